//! [`Connection`] over `svn://`.

use chrono::{DateTime, Utc};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, trace};

use crate::editor::{EditFuture, TreeEditor};
use crate::session::{Connection, Connector, ReportRequest};
use crate::svndiff::SvndiffDecoder;
use crate::types::format_svn_date;
use crate::{
    CommitOptions, Depth, DirEntry, DirListing, FileContents, FileRevision, Location, Lock,
    LockOptions, LogEntry, LogOptions, NodeKind, PropertyList, Report, RepositoryInfo,
    SessionConfig, SvnError, SvnUrl, UnlockOptions, WorkspaceMediator,
};

use super::SvnItem;
use super::commit::RaSvnCommitEditor;
use super::conn::WireConn;
use super::edit::{drive_editor, report_request_params, send_report};
use super::parse::{
    parse_file_revision, parse_get_dir_listing, parse_get_file_response_params, parse_location,
    parse_lock, parse_log_entry, parse_proplist, parse_stat_params,
};

const DIRENT_FIELDS: [&str; 6] = [
    "kind",
    "size",
    "has-props",
    "created-rev",
    "time",
    "last-author",
];

/// Opens `svn://` connections.
#[derive(Clone, Copy, Debug, Default)]
pub struct RaSvnConnector;

impl Connector for RaSvnConnector {
    fn connect<'a>(
        &'a self,
        url: &'a SvnUrl,
        config: &'a SessionConfig,
    ) -> EditFuture<'a, Box<dyn Connection>> {
        Box::pin(async move {
            let conn = RaSvnConnection::open(url, config).await?;
            Ok(Box::new(conn) as Box<dyn Connection>)
        })
    }
}

fn opt_rev(rev: Option<u64>) -> SvnItem {
    SvnItem::List(rev.map(SvnItem::Number).into_iter().collect())
}

fn path_item(path: &str) -> SvnItem {
    SvnItem::String(path.as_bytes().to_vec())
}

pub(crate) struct RaSvnConnection {
    wire: Option<WireConn>,
    info: RepositoryInfo,
    url: SvnUrl,
    config: SessionConfig,
    commit: Option<RaSvnCommitEditor>,
}

impl RaSvnConnection {
    pub(crate) async fn open(url: &SvnUrl, config: &SessionConfig) -> Result<Self, SvnError> {
        let mut wire = WireConn::connect(url, config).await?;
        let info = wire.handshake().await?;
        info!(url = %url.url, uuid = %info.uuid, "connected");
        Ok(Self::with_wire(wire, info, url.clone(), config.clone()))
    }

    pub(crate) fn with_wire(
        wire: WireConn,
        info: RepositoryInfo,
        url: SvnUrl,
        config: SessionConfig,
    ) -> Self {
        Self {
            wire: Some(wire),
            info,
            url,
            config,
            commit: None,
        }
    }

    /// The wire for a new request, reclaimed from a finished commit or
    /// reopened after it was given up.
    async fn wire(&mut self) -> Result<&mut WireConn, SvnError> {
        if let Some(editor) = self.commit.as_mut() {
            if !editor.is_finished() {
                return Err(SvnError::Reentrancy("a commit is in progress".into()));
            }
            if self.wire.is_none() {
                self.wire = editor.take_wire();
            }
            self.commit = None;
        }
        if self.wire.is_none() {
            debug!(url = %self.url.url, "reconnecting");
            let mut wire = WireConn::connect(&self.url, &self.config).await?;
            wire.handshake().await?;
            self.wire = Some(wire);
        }
        self.wire
            .as_mut()
            .ok_or_else(|| SvnError::Protocol("connection unavailable".into()))
    }

    fn settle<T>(&mut self, result: Result<T, SvnError>) -> Result<T, SvnError> {
        if let Err(err) = &result
            && err.is_transport()
        {
            debug!(error = %err, "dropping broken connection");
            self.wire = None;
        }
        result
    }

    async fn do_latest_revision(&mut self) -> Result<u64, SvnError> {
        let wire = self.wire().await?;
        let response = wire.call("get-latest-rev", SvnItem::List(Vec::new())).await?;
        response
            .success_params("get-latest-rev")?
            .first()
            .and_then(SvnItem::as_u64)
            .ok_or_else(|| SvnError::Protocol("get-latest-rev response missing rev".into()))
    }

    async fn do_check_path(&mut self, path: String, rev: Option<u64>) -> Result<NodeKind, SvnError> {
        let wire = self.wire().await?;
        let params = SvnItem::List(vec![path_item(&path), opt_rev(rev)]);
        let response = wire.call("check-path", params).await?;
        response
            .success_params("check-path")?
            .first()
            .and_then(SvnItem::as_word)
            .and_then(|word| NodeKind::from_word(&word))
            .ok_or_else(|| SvnError::Protocol("check-path response missing kind".into()))
    }

    async fn do_stat(&mut self, path: String, rev: Option<u64>) -> Result<Option<DirEntry>, SvnError> {
        let wire = self.wire().await?;
        let params = SvnItem::List(vec![path_item(&path), opt_rev(rev)]);
        let response = wire.call("stat", params).await?;
        parse_stat_params(&path, response.success_params("stat")?)
    }

    async fn do_get_dir(&mut self, path: String, rev: Option<u64>) -> Result<DirListing, SvnError> {
        let wire = self.wire().await?;
        let params = SvnItem::List(vec![
            path_item(&path),
            opt_rev(rev),
            SvnItem::Bool(true),
            SvnItem::Bool(true),
            SvnItem::List(
                DIRENT_FIELDS
                    .iter()
                    .map(|field| SvnItem::Word(field.to_string()))
                    .collect(),
            ),
            SvnItem::Bool(false),
        ]);
        let response = wire.call("get-dir", params).await?;
        parse_get_dir_listing(&path, response.success_params("get-dir")?)
    }

    async fn do_get_file(
        &mut self,
        path: String,
        rev: Option<u64>,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<FileContents, SvnError> {
        let wire = self.wire().await?;
        let params = SvnItem::List(vec![
            path_item(&path),
            opt_rev(rev),
            SvnItem::Bool(true),
            SvnItem::Bool(true),
            SvnItem::Bool(false),
        ]);
        let response = wire.call("get-file", params).await?;
        let meta = parse_get_file_response_params(response.success_params("get-file")?)?;

        let mut written = 0u64;
        loop {
            let item = wire.read_item().await?;
            let chunk = item
                .as_bytes_string()
                .ok_or_else(|| SvnError::Protocol("expected file chunk string".into()))?;
            if chunk.is_empty() {
                break;
            }
            written += chunk.len() as u64;
            sink.write_all(&chunk).await?;
        }
        sink.flush().await?;
        wire.read_command_response().await?.ensure_success("get-file")?;

        Ok(FileContents {
            rev: meta.rev,
            checksum: meta.checksum,
            props: meta.props,
            bytes_written: written,
        })
    }

    async fn do_log(
        &mut self,
        options: LogOptions,
        handler: &mut (dyn FnMut(LogEntry) -> Result<(), SvnError> + Send),
    ) -> Result<(), SvnError> {
        let wire = self.wire().await?;
        let params = SvnItem::List(vec![
            SvnItem::List(options.target_paths.iter().map(|p| path_item(p)).collect()),
            opt_rev(options.start_rev),
            opt_rev(options.end_rev),
            SvnItem::Bool(options.changed_paths),
            SvnItem::Bool(options.strict_node),
            SvnItem::Number(options.limit),
            SvnItem::Bool(false),
            SvnItem::Word("revprops".to_string()),
            SvnItem::List(
                ["svn:author", "svn:date", "svn:log"]
                    .iter()
                    .map(|name| path_item(name))
                    .collect(),
            ),
        ]);
        wire.send_command("log", params).await?;
        wire.handle_auth_request().await?;

        // Entries keep arriving after a handler error; they are read and
        // dropped so the connection stays usable.
        let mut handler_error = None;
        loop {
            match wire.read_item().await? {
                SvnItem::Word(word) if word == "done" => break,
                SvnItem::List(items) => {
                    if handler_error.is_some() {
                        continue;
                    }
                    let entry = parse_log_entry(items)?;
                    if let Err(err) = handler(entry) {
                        debug!(error = %err, "log handler failed; draining entries");
                        handler_error = Some(err);
                    }
                }
                other => {
                    return Err(SvnError::Protocol(format!(
                        "unexpected log entry item: {}",
                        other.kind()
                    )));
                }
            }
        }
        let response = wire.read_command_response().await?;
        match handler_error {
            Some(err) => Err(err),
            None => response.ensure_success("log"),
        }
    }

    async fn do_revision_properties(&mut self, rev: u64) -> Result<PropertyList, SvnError> {
        let wire = self.wire().await?;
        let response = wire
            .call("rev-proplist", SvnItem::List(vec![SvnItem::Number(rev)]))
            .await?;
        let proplist = response
            .success_params("rev-proplist")?
            .first()
            .ok_or_else(|| SvnError::Protocol("rev-proplist response missing proplist".into()))?;
        parse_proplist(proplist)
    }

    async fn do_revision_property(
        &mut self,
        rev: u64,
        name: String,
    ) -> Result<Option<Vec<u8>>, SvnError> {
        let wire = self.wire().await?;
        let params = SvnItem::List(vec![SvnItem::Number(rev), path_item(&name)]);
        let response = wire.call("rev-prop", params).await?;
        let Some(value_tuple) = response.success_params("rev-prop")?.first() else {
            return Ok(None);
        };
        let items = value_tuple
            .as_list()
            .ok_or_else(|| SvnError::Protocol("rev-prop value tuple not a list".into()))?;
        match items.first() {
            None => Ok(None),
            Some(value) => value
                .as_bytes_string()
                .map(Some)
                .ok_or_else(|| SvnError::Protocol("rev-prop value not a string".into())),
        }
    }

    async fn do_change_revision_property(
        &mut self,
        rev: u64,
        name: String,
        value: Option<Vec<u8>>,
    ) -> Result<(), SvnError> {
        let wire = self.wire().await?;
        let mut items = vec![SvnItem::Number(rev), path_item(&name)];
        if let Some(value) = value {
            items.push(SvnItem::String(value));
        }
        let response = wire.call("change-rev-prop", SvnItem::List(items)).await?;
        response.ensure_success("change-rev-prop")
    }

    async fn do_dated_revision(&mut self, date: DateTime<Utc>) -> Result<u64, SvnError> {
        let wire = self.wire().await?;
        let params = SvnItem::List(vec![path_item(&format_svn_date(&date))]);
        let response = wire.call("get-dated-rev", params).await?;
        response
            .success_params("get-dated-rev")?
            .first()
            .and_then(SvnItem::as_u64)
            .ok_or_else(|| SvnError::Protocol("get-dated-rev response missing rev".into()))
    }

    async fn do_locations(
        &mut self,
        path: String,
        peg_rev: u64,
        revs: Vec<u64>,
    ) -> Result<Vec<Location>, SvnError> {
        let wire = self.wire().await?;
        let params = SvnItem::List(vec![
            path_item(&path),
            SvnItem::Number(peg_rev),
            SvnItem::List(revs.into_iter().map(SvnItem::Number).collect()),
        ]);
        wire.send_command("get-locations", params).await?;
        wire.handle_auth_request().await?;

        let mut locations = Vec::new();
        loop {
            match wire.read_item().await? {
                SvnItem::Word(word) if word == "done" => break,
                SvnItem::List(items) => locations.push(parse_location(&items)?),
                other => {
                    return Err(SvnError::Protocol(format!(
                        "unexpected location item: {}",
                        other.kind()
                    )));
                }
            }
        }
        wire.read_command_response()
            .await?
            .ensure_success("get-locations")?;
        Ok(locations)
    }

    async fn do_file_revisions(
        &mut self,
        path: String,
        start_rev: Option<u64>,
        end_rev: Option<u64>,
    ) -> Result<Vec<FileRevision>, SvnError> {
        let wire = self.wire().await?;
        let params = SvnItem::List(vec![
            path_item(&path),
            opt_rev(start_rev),
            opt_rev(end_rev),
            SvnItem::Bool(false),
        ]);
        wire.send_command("get-file-revs", params).await?;
        wire.handle_auth_request().await?;

        // Every entry is followed by its svndiff stream, sent as string
        // chunks and ended by an empty one.
        let mut revisions = Vec::new();
        loop {
            let items = match wire.read_item().await? {
                SvnItem::Word(word) if word == "done" => break,
                SvnItem::List(items) => items,
                other => {
                    return Err(SvnError::Protocol(format!(
                        "unexpected file-rev item: {}",
                        other.kind()
                    )));
                }
            };
            let mut revision = parse_file_revision(&items)?;
            let mut decoder = SvndiffDecoder::default();
            loop {
                let chunk = wire
                    .read_item()
                    .await?
                    .as_bytes_string()
                    .ok_or_else(|| SvnError::Protocol("file-rev delta chunk not a string".into()))?;
                if chunk.is_empty() {
                    break;
                }
                decoder.push(&chunk)?;
                while let Some(window) = decoder.next_window()? {
                    revision.windows.push(window);
                }
            }
            decoder.finish()?;
            trace!(rev = revision.rev, windows = revision.windows.len(), "file revision");
            revisions.push(revision);
        }
        wire.read_command_response()
            .await?
            .ensure_success("get-file-revs")?;
        if revisions.is_empty() {
            return Err(SvnError::Protocol(format!(
                "get-file-revs returned no revisions for '{path}'"
            )));
        }
        Ok(revisions)
    }

    async fn do_get_lock(&mut self, path: String) -> Result<Option<Lock>, SvnError> {
        let wire = self.wire().await?;
        let response = wire
            .call("get-lock", SvnItem::List(vec![path_item(&path)]))
            .await?;
        let Some(tuple) = response.success_params("get-lock")?.first() else {
            return Ok(None);
        };
        let items = tuple
            .as_list()
            .ok_or_else(|| SvnError::Protocol("get-lock tuple not a list".into()))?;
        items.first().map(parse_lock).transpose()
    }

    async fn do_get_locks(&mut self, path: String, depth: Depth) -> Result<Vec<Lock>, SvnError> {
        let wire = self.wire().await?;
        let params = SvnItem::List(vec![
            path_item(&path),
            SvnItem::List(vec![SvnItem::Word(depth.as_word().to_string())]),
        ]);
        let response = wire.call("get-locks", params).await?;
        response
            .success_params("get-locks")?
            .first()
            .and_then(SvnItem::as_list)
            .ok_or_else(|| SvnError::Protocol("get-locks response not a list".into()))?
            .iter()
            .map(parse_lock)
            .collect()
    }

    async fn do_lock(&mut self, path: String, options: LockOptions) -> Result<Lock, SvnError> {
        let wire = self.wire().await?;
        let params = SvnItem::List(vec![
            path_item(&path),
            SvnItem::List(options.comment.iter().map(|c| path_item(c)).collect()),
            SvnItem::Bool(options.steal_lock),
            opt_rev(options.current_rev),
        ]);
        let response = wire.call("lock", params).await?;
        let lock = response
            .success_params("lock")?
            .first()
            .ok_or_else(|| SvnError::Protocol("lock response missing lock".into()))?;
        parse_lock(lock)
    }

    async fn do_unlock(&mut self, path: String, options: UnlockOptions) -> Result<(), SvnError> {
        let wire = self.wire().await?;
        let params = SvnItem::List(vec![
            path_item(&path),
            SvnItem::List(options.token.iter().map(|t| path_item(t)).collect()),
            SvnItem::Bool(options.break_lock),
        ]);
        wire.call("unlock", params).await?.ensure_success("unlock")
    }

    async fn do_run_report(
        &mut self,
        request: ReportRequest,
        report: Report,
        editor: &mut dyn TreeEditor,
    ) -> Result<(), SvnError> {
        let params = report_request_params(&request)?;
        let command = request.command();
        let wire = self.wire().await?;
        wire.send_command(command, params).await?;
        wire.handle_auth_request().await?;
        if !send_report(wire, &report).await? {
            // The server is left without a report to answer; start over.
            self.wire = None;
            return Err(SvnError::Cancelled);
        }
        wire.handle_auth_request().await?;
        drive_editor(wire, command, editor).await
    }

    async fn do_begin_commit(
        &mut self,
        options: CommitOptions,
        mediator: Box<dyn WorkspaceMediator>,
    ) -> Result<(), SvnError> {
        let root_url = if self.info.root_url.is_empty() {
            self.url.clone()
        } else {
            SvnUrl::parse(&self.info.root_url)?
        };
        let session_url = self.url.clone();

        let wire = self.wire().await?;
        let custom_props = options.rev_props.keys().any(|name| name != "svn:log");
        if custom_props && !wire.server_has_cap("commit-revprops") {
            return Err(SvnError::ProtocolViolation(
                "server does not accept revision properties on commit".into(),
            ));
        }

        let mut rev_props = options.rev_props;
        rev_props.insert("svn:log".to_string(), options.log_message.as_bytes().to_vec());
        let params = SvnItem::List(vec![
            path_item(&options.log_message),
            SvnItem::List(
                options
                    .lock_tokens
                    .iter()
                    .map(|lock| SvnItem::List(vec![path_item(&lock.path), path_item(&lock.token)]))
                    .collect(),
            ),
            SvnItem::Bool(options.keep_locks),
            SvnItem::List(
                rev_props
                    .into_iter()
                    .map(|(name, value)| {
                        SvnItem::List(vec![SvnItem::String(name.into_bytes()), SvnItem::String(value)])
                    })
                    .collect(),
            ),
        ]);
        wire.call("commit", params).await?.ensure_success("commit")?;

        let wire = self
            .wire
            .take()
            .ok_or_else(|| SvnError::Protocol("connection unavailable".into()))?;
        self.commit = Some(RaSvnCommitEditor::new(wire, mediator, session_url, root_url));
        Ok(())
    }
}

impl Connection for RaSvnConnection {
    fn info(&self) -> &RepositoryInfo {
        &self.info
    }

    fn latest_revision(&mut self) -> EditFuture<'_, u64> {
        Box::pin(async move {
            let result = self.do_latest_revision().await;
            self.settle(result)
        })
    }

    fn check_path(&mut self, path: String, rev: Option<u64>) -> EditFuture<'_, NodeKind> {
        Box::pin(async move {
            let result = self.do_check_path(path, rev).await;
            self.settle(result)
        })
    }

    fn stat(&mut self, path: String, rev: Option<u64>) -> EditFuture<'_, Option<DirEntry>> {
        Box::pin(async move {
            let result = self.do_stat(path, rev).await;
            self.settle(result)
        })
    }

    fn get_dir(&mut self, path: String, rev: Option<u64>) -> EditFuture<'_, DirListing> {
        Box::pin(async move {
            let result = self.do_get_dir(path, rev).await;
            self.settle(result)
        })
    }

    fn get_file<'a>(
        &'a mut self,
        path: String,
        rev: Option<u64>,
        sink: &'a mut (dyn AsyncWrite + Unpin + Send),
    ) -> EditFuture<'a, FileContents> {
        Box::pin(async move {
            let result = self.do_get_file(path, rev, sink).await;
            self.settle(result)
        })
    }

    fn log<'a>(
        &'a mut self,
        options: LogOptions,
        handler: &'a mut (dyn FnMut(LogEntry) -> Result<(), SvnError> + Send),
    ) -> EditFuture<'a> {
        Box::pin(async move {
            let result = self.do_log(options, handler).await;
            self.settle(result)
        })
    }

    fn revision_properties(&mut self, rev: u64) -> EditFuture<'_, PropertyList> {
        Box::pin(async move {
            let result = self.do_revision_properties(rev).await;
            self.settle(result)
        })
    }

    fn revision_property(&mut self, rev: u64, name: String) -> EditFuture<'_, Option<Vec<u8>>> {
        Box::pin(async move {
            let result = self.do_revision_property(rev, name).await;
            self.settle(result)
        })
    }

    fn change_revision_property(
        &mut self,
        rev: u64,
        name: String,
        value: Option<Vec<u8>>,
    ) -> EditFuture<'_> {
        Box::pin(async move {
            let result = self.do_change_revision_property(rev, name, value).await;
            self.settle(result)
        })
    }

    fn dated_revision(&mut self, date: DateTime<Utc>) -> EditFuture<'_, u64> {
        Box::pin(async move {
            let result = self.do_dated_revision(date).await;
            self.settle(result)
        })
    }

    fn locations(
        &mut self,
        path: String,
        peg_rev: u64,
        revs: Vec<u64>,
    ) -> EditFuture<'_, Vec<Location>> {
        Box::pin(async move {
            let result = self.do_locations(path, peg_rev, revs).await;
            self.settle(result)
        })
    }

    fn file_revisions(
        &mut self,
        path: String,
        start_rev: Option<u64>,
        end_rev: Option<u64>,
    ) -> EditFuture<'_, Vec<FileRevision>> {
        Box::pin(async move {
            let result = self.do_file_revisions(path, start_rev, end_rev).await;
            self.settle(result)
        })
    }

    fn get_lock(&mut self, path: String) -> EditFuture<'_, Option<Lock>> {
        Box::pin(async move {
            let result = self.do_get_lock(path).await;
            self.settle(result)
        })
    }

    fn get_locks(&mut self, path: String, depth: Depth) -> EditFuture<'_, Vec<Lock>> {
        Box::pin(async move {
            let result = self.do_get_locks(path, depth).await;
            self.settle(result)
        })
    }

    fn lock(&mut self, path: String, options: LockOptions) -> EditFuture<'_, Lock> {
        Box::pin(async move {
            let result = self.do_lock(path, options).await;
            self.settle(result)
        })
    }

    fn unlock(&mut self, path: String, options: UnlockOptions) -> EditFuture<'_> {
        Box::pin(async move {
            let result = self.do_unlock(path, options).await;
            self.settle(result)
        })
    }

    fn run_report<'a>(
        &'a mut self,
        request: ReportRequest,
        report: Report,
        editor: &'a mut dyn TreeEditor,
    ) -> EditFuture<'a> {
        Box::pin(async move {
            let result = self.do_run_report(request, report, editor).await;
            self.settle(result)
        })
    }

    fn begin_commit(
        &mut self,
        options: CommitOptions,
        mediator: Box<dyn WorkspaceMediator>,
    ) -> EditFuture<'_> {
        Box::pin(async move {
            let result = self.do_begin_commit(options, mediator).await;
            self.settle(result)
        })
    }

    fn commit_editor(&mut self) -> Option<&mut dyn TreeEditor> {
        self.commit
            .as_mut()
            .map(|editor| editor as &mut dyn TreeEditor)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::MemoryMediator;
    use crate::rasvn::conn::tests::{connected_conn, read_line, run_async, send_line};
    use tokio::net::TcpStream;

    const NO_AUTH: &[u8] = b"( success ( ( ) 0: ) )";

    async fn connection() -> (RaSvnConnection, TcpStream) {
        let (wire, server) = connected_conn(None, None).await;
        let info = RepositoryInfo {
            uuid: "00000000-1111-2222-3333-444444444444".to_string(),
            root_url: "svn://example.com:3690/repo".to_string(),
            capabilities: Vec::new(),
        };
        let conn = RaSvnConnection::with_wire(
            wire,
            info,
            SvnUrl::parse("svn://example.com/repo/trunk").unwrap(),
            SessionConfig::new(),
        );
        (conn, server)
    }

    #[test]
    fn latest_revision_and_check_path() {
        run_async(async {
            let (mut conn, mut server) = connection().await;
            let script = tokio::spawn(async move {
                let first = read_line(&mut server).await;
                send_line(&mut server, NO_AUTH).await;
                send_line(&mut server, b"( success ( 12 ) )").await;
                let second = read_line(&mut server).await;
                send_line(&mut server, NO_AUTH).await;
                send_line(&mut server, b"( success ( dir ) )").await;
                (first, second)
            });

            assert_eq!(conn.latest_revision().await.unwrap(), 12);
            assert_eq!(
                conn.check_path("a/b".into(), Some(3)).await.unwrap(),
                NodeKind::Dir
            );
            let (first, second) = script.await.unwrap();
            assert_eq!(first, b"( get-latest-rev ( ) ) \n");
            assert_eq!(second, b"( check-path ( 3:a/b ( 3 ) ) ) \n");
        });
    }

    #[test]
    fn get_file_streams_chunks_into_the_sink() {
        run_async(async {
            let (mut conn, mut server) = connection().await;
            let script = tokio::spawn(async move {
                let request = read_line(&mut server).await;
                send_line(&mut server, NO_AUTH).await;
                send_line(
                    &mut server,
                    b"( success ( ( 32:5d41402abc4b2a76b9719d911017c592 ) 4 ( ( 13:svn:mime-type 10:text/plain ) ) ) )",
                )
                .await;
                send_line(&mut server, b"3:hel 2:lo 0: ").await;
                send_line(&mut server, b"( success ( ) )").await;
                request
            });

            let mut sink = Vec::new();
            let contents = conn
                .get_file("README".into(), None, &mut sink)
                .await
                .unwrap();
            assert_eq!(sink, b"hello");
            assert_eq!(contents.rev, 4);
            assert_eq!(contents.bytes_written, 5);
            assert_eq!(
                contents.checksum.as_deref(),
                Some("5d41402abc4b2a76b9719d911017c592")
            );
            assert_eq!(contents.props["svn:mime-type"], b"text/plain");
            assert_eq!(
                script.await.unwrap(),
                b"( get-file ( 6:README ( ) true true false ) ) \n"
            );
        });
    }

    #[test]
    fn stat_of_missing_path_is_none() {
        run_async(async {
            let (mut conn, mut server) = connection().await;
            tokio::spawn(async move {
                read_line(&mut server).await;
                send_line(&mut server, NO_AUTH).await;
                send_line(&mut server, b"( success ( ( ) ) )").await;
                read_line(&mut server).await;
                send_line(&mut server, NO_AUTH).await;
                send_line(
                    &mut server,
                    b"( success ( ( ( file 5 false 3 ( 27:2025-01-01T00:00:00.000000Z ) ( 3:bob ) ) ) ) )",
                )
                .await;
            });

            assert!(conn.stat("missing".into(), None).await.unwrap().is_none());
            let entry = conn.stat("dir/f".into(), None).await.unwrap().unwrap();
            assert_eq!(entry.name, "f");
            assert_eq!(entry.kind, NodeKind::File);
            assert_eq!(entry.size, 5);
            assert_eq!(entry.last_author.as_deref(), Some("bob"));
        });
    }

    #[test]
    fn log_handler_error_drains_remaining_entries() {
        run_async(async {
            let (mut conn, mut server) = connection().await;
            tokio::spawn(async move {
                read_line(&mut server).await;
                send_line(&mut server, NO_AUTH).await;
                send_line(&mut server, b"( ( ) 1 ( 5:alice ) ( ) ( 3:one ) )").await;
                send_line(&mut server, b"( ( ) 2 ( 5:alice ) ( ) ( 3:two ) )").await;
                send_line(&mut server, b"done").await;
                send_line(&mut server, b"( success ( ) )").await;
                read_line(&mut server).await;
                send_line(&mut server, NO_AUTH).await;
                send_line(&mut server, b"( success ( 2 ) )").await;
            });

            let mut seen = Vec::new();
            let mut handler = |entry: LogEntry| {
                seen.push(entry.rev);
                Err(SvnError::Cancelled)
            };
            let err = conn
                .log(LogOptions::between(1, 2), &mut handler)
                .await
                .unwrap_err();
            assert!(matches!(err, SvnError::Cancelled));
            assert_eq!(seen, vec![1]);
            // The connection is still in sync.
            assert_eq!(conn.latest_revision().await.unwrap(), 2);
        });
    }

    #[test]
    fn custom_revision_properties_need_server_support() {
        run_async(async {
            let (mut conn, _server) = connection().await;
            let mut rev_props = PropertyList::new();
            rev_props.insert("custom".to_string(), b"x".to_vec());
            let options = CommitOptions::new("msg").with_rev_props(rev_props);
            let err = conn
                .begin_commit(options, Box::new(MemoryMediator::new()))
                .await
                .unwrap_err();
            assert!(matches!(err, SvnError::ProtocolViolation(_)));
            assert!(conn.commit_editor().is_none());
        });
    }

    #[test]
    fn commit_holds_the_connection_until_it_ends() {
        run_async(async {
            let (mut conn, mut server) = connection().await;
            let script = tokio::spawn(async move {
                let request = read_line(&mut server).await;
                send_line(&mut server, NO_AUTH).await;
                send_line(&mut server, b"( success ( ) )").await;
                let abort = read_line(&mut server).await;
                send_line(&mut server, b"( success ( ) )").await;
                read_line(&mut server).await;
                send_line(&mut server, NO_AUTH).await;
                send_line(&mut server, b"( success ( 9 ) )").await;
                (request, abort)
            });

            conn.begin_commit(CommitOptions::new("msg"), Box::new(MemoryMediator::new()))
                .await
                .unwrap();
            let err = conn.latest_revision().await.unwrap_err();
            assert!(matches!(err, SvnError::Reentrancy(_)));

            conn.commit_editor().unwrap().abort_edit().await.unwrap();
            assert_eq!(conn.latest_revision().await.unwrap(), 9);

            let (request, abort) = script.await.unwrap();
            assert_eq!(
                request,
                b"( commit ( 3:msg ( ) false ( ( 7:svn:log 3:msg ) ) ) ) \n"
            );
            assert_eq!(abort, b"( abort-edit ( ) ) \n");
        });
    }

    fn string_item(bytes: &[u8]) -> Vec<u8> {
        let mut out = format!("{}:", bytes.len()).into_bytes();
        out.extend_from_slice(bytes);
        out.push(b' ');
        out
    }

    #[test]
    fn locks_are_taken_listed_and_released() {
        run_async(async {
            let (mut conn, mut server) = connection().await;
            let script = tokio::spawn(async move {
                let mut requests = Vec::new();
                requests.push(read_line(&mut server).await);
                send_line(&mut server, NO_AUTH).await;
                send_line(
                    &mut server,
                    b"( success ( ( 12:/trunk/a.txt 3:tok 5:alice ( 4:todo ) 27:2025-01-01T00:00:00.000000Z ( ) ) ) )",
                )
                .await;
                requests.push(read_line(&mut server).await);
                send_line(&mut server, NO_AUTH).await;
                send_line(
                    &mut server,
                    b"( success ( ( ( 12:/trunk/a.txt 3:tok 5:alice ( ) 27:2025-01-01T00:00:00.000000Z ( ) ) ) ) )",
                )
                .await;
                requests.push(read_line(&mut server).await);
                send_line(&mut server, NO_AUTH).await;
                send_line(&mut server, b"( success ( ( ) ) )").await;
                requests.push(read_line(&mut server).await);
                send_line(&mut server, NO_AUTH).await;
                send_line(&mut server, b"( success ( ) )").await;
                requests
            });

            let lock = conn
                .lock(
                    "a.txt".into(),
                    LockOptions::new().with_comment("todo").with_current_rev(3),
                )
                .await
                .unwrap();
            assert_eq!(lock.path, "/trunk/a.txt");
            assert_eq!(lock.token, "tok");
            assert_eq!(lock.comment.as_deref(), Some("todo"));

            let locks = conn.get_locks(String::new(), Depth::Infinity).await.unwrap();
            assert_eq!(locks.len(), 1);
            assert_eq!(locks[0].owner, "alice");
            assert!(conn.get_lock("b.txt".into()).await.unwrap().is_none());
            conn.unlock("a.txt".into(), UnlockOptions::with_token("tok"))
                .await
                .unwrap();

            let requests = script.await.unwrap();
            assert_eq!(requests[0], b"( lock ( 5:a.txt ( 4:todo ) false ( 3 ) ) ) \n");
            assert_eq!(requests[1], b"( get-locks ( 0: ( infinity ) ) ) \n");
            assert_eq!(requests[2], b"( get-lock ( 5:b.txt ) ) \n");
            assert_eq!(requests[3], b"( unlock ( 5:a.txt ( 3:tok ) false ) ) \n");
        });
    }

    #[test]
    fn dated_revision_and_locations() {
        run_async(async {
            let (mut conn, mut server) = connection().await;
            let script = tokio::spawn(async move {
                let dated = read_line(&mut server).await;
                send_line(&mut server, NO_AUTH).await;
                send_line(&mut server, b"( success ( 6 ) )").await;
                let locations = read_line(&mut server).await;
                send_line(&mut server, NO_AUTH).await;
                send_line(&mut server, b"( 9 12:/trunk/a.txt ) ( 3 13:/branch/a.txt ) done").await;
                send_line(&mut server, b"( success ( ) )").await;
                (dated, locations)
            });

            let date = crate::types::parse_svn_date("2025-01-01T00:00:00Z").unwrap();
            assert_eq!(conn.dated_revision(date).await.unwrap(), 6);
            let locations = conn
                .locations("a.txt".into(), 9, vec![9, 3])
                .await
                .unwrap();
            assert_eq!(
                locations,
                vec![
                    Location {
                        rev: 9,
                        path: "/trunk/a.txt".into(),
                    },
                    Location {
                        rev: 3,
                        path: "/branch/a.txt".into(),
                    },
                ]
            );

            let (dated, locations) = script.await.unwrap();
            assert_eq!(
                dated,
                b"( get-dated-rev ( 27:2025-01-01T00:00:00.000000Z ) ) \n"
            );
            assert_eq!(locations, b"( get-locations ( 5:a.txt 9 ( 9 3 ) ) ) \n");
        });
    }

    #[test]
    fn file_revisions_decode_chunked_deltas() {
        use crate::svndiff::{DEFAULT_ZLIB_LEVEL, SvndiffVersion, encode_stream};

        let first = encode_stream(
            SvndiffVersion::V0,
            &crate::generate(b"", b"one\n", crate::DELTA_WINDOW_MAX),
            DEFAULT_ZLIB_LEVEL,
        )
        .unwrap();
        let second = encode_stream(
            SvndiffVersion::V1,
            &crate::generate(b"one\n", b"one\ntwo\n", crate::DELTA_WINDOW_MAX),
            DEFAULT_ZLIB_LEVEL,
        )
        .unwrap();

        run_async(async {
            let (mut conn, mut server) = connection().await;
            let script = tokio::spawn(async move {
                let request = read_line(&mut server).await;
                send_line(&mut server, NO_AUTH).await;

                let mut line =
                    b"( 12:/trunk/a.txt 2 ( ( 10:svn:author 5:alice ) ) ( ( 3:eol ( 2:lf ) ) ) ) "
                        .to_vec();
                line.extend(string_item(&first));
                line.extend(string_item(b""));
                send_line(&mut server, &line).await;

                let (head, tail) = second.split_at(second.len() / 2);
                let mut line = b"( 12:/trunk/a.txt 5 ( ) ( ) false ) ".to_vec();
                line.extend(string_item(head));
                line.extend(string_item(tail));
                line.extend(string_item(b""));
                line.extend_from_slice(b"done");
                send_line(&mut server, &line).await;
                send_line(&mut server, b"( success ( ) )").await;
                request
            });

            let revisions = conn
                .file_revisions("a.txt".into(), None, Some(5))
                .await
                .unwrap();
            assert_eq!(
                script.await.unwrap(),
                b"( get-file-revs ( 5:a.txt ( ) ( 5 ) false ) ) \n"
            );
            assert_eq!(revisions.len(), 2);
            assert_eq!(revisions[0].rev, 2);
            assert_eq!(revisions[0].rev_props["svn:author"], b"alice");
            assert_eq!(revisions[0].prop_changes[0].value.as_deref(), Some(&b"lf"[..]));
            let one = revisions[0].apply(b"").unwrap();
            assert_eq!(one, b"one\n");
            assert_eq!(revisions[1].apply(&one).unwrap(), b"one\ntwo\n");
        });
    }
}
