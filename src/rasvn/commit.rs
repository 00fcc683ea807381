//! The commit editor of an `svn://` connection.
//!
//! Editor calls are pipelined: they are encoded into a batch and written
//! without waiting for replies. The server only speaks up when something
//! goes wrong, so the batch is flushed periodically and pending input is
//! checked before each new batch. Delta windows are parked in the
//! [`WorkspaceMediator`] until the file's stream ends and then sent as one
//! svndiff stream.

use tracing::{debug, trace, warn};

use crate::editor::{EditFuture, TreeEditor};
use crate::mediator::StagedDelta;
use crate::svndiff::{DEFAULT_ZLIB_LEVEL, SvndiffVersion, encode_window};
use crate::{CommitInfo, CopyFrom, DiffWindow, PropKind, PropName, SvnError, SvnUrl, WorkspaceMediator};

use super::SvnItem;
use super::conn::WireConn;
use super::parse::parse_commit_info;
use super::wire::WireEncoder;

const MAX_BATCH_BYTES: usize = 256 * 1024;
const MAX_COMMANDS_PER_BATCH: usize = 32;

struct OpenDir {
    token: String,
    path: String,
}

struct OpenFile {
    token: String,
    path: String,
    staged: Option<StagedDelta>,
    base_checksum: Option<String>,
}

pub(crate) struct RaSvnCommitEditor {
    wire: Option<WireConn>,
    mediator: Box<dyn WorkspaceMediator>,
    session_url: SvnUrl,
    root_url: SvnUrl,
    version: SvndiffVersion,
    dirs: Vec<OpenDir>,
    file: Option<OpenFile>,
    next_token: u64,
    batch: Vec<u8>,
    since_poll: usize,
    finished: bool,
}

impl std::fmt::Debug for RaSvnCommitEditor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaSvnCommitEditor")
            .field("session_url", &self.session_url.url)
            .field("depth", &self.dirs.len())
            .field("finished", &self.finished)
            .finish()
    }
}

impl RaSvnCommitEditor {
    /// Takes over `wire` after a successful `commit` command.
    pub(crate) fn new(
        wire: WireConn,
        mediator: Box<dyn WorkspaceMediator>,
        session_url: SvnUrl,
        root_url: SvnUrl,
    ) -> Self {
        let version = if wire.server_has_cap("accepts-svndiff2") {
            SvndiffVersion::V2
        } else if wire.server_has_cap("svndiff1") {
            SvndiffVersion::V1
        } else {
            SvndiffVersion::V0
        };
        Self {
            wire: Some(wire),
            mediator,
            session_url,
            root_url,
            version,
            dirs: Vec::new(),
            file: None,
            next_token: 0,
            batch: Vec::new(),
            since_poll: 0,
            finished: false,
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }

    /// Hands the connection back once the edit has ended cleanly. `None`
    /// means it was given up and the caller has to reconnect.
    pub(crate) fn take_wire(&mut self) -> Option<WireConn> {
        if self.finished { self.wire.take() } else { None }
    }

    fn token(&mut self, prefix: char) -> String {
        let token = format!("{prefix}{}", self.next_token);
        self.next_token += 1;
        token
    }

    fn wire(&mut self) -> Result<&mut WireConn, SvnError> {
        self.wire
            .as_mut()
            .ok_or_else(|| SvnError::ProtocolViolation("commit already finished".into()))
    }

    /// Gives up the connection after any failure; the edit is over.
    fn settle<T>(&mut self, result: Result<T, SvnError>) -> Result<T, SvnError> {
        if let Err(err) = &result {
            debug!(error = %err, "commit edit failed; dropping connection");
            self.discard_staged();
            self.wire = None;
            self.finished = true;
        }
        result
    }

    fn discard_staged(&mut self) {
        if let Some(file) = self.file.as_mut()
            && let Some(mut staged) = file.staged.take()
        {
            staged.discard(self.mediator.as_mut());
        }
    }

    fn top_dir(&self) -> Result<&OpenDir, SvnError> {
        self.dirs
            .last()
            .ok_or_else(|| SvnError::ProtocolViolation("no open directory".into()))
    }

    fn current_file(&mut self) -> Result<&mut OpenFile, SvnError> {
        self.file
            .as_mut()
            .ok_or_else(|| SvnError::ProtocolViolation("no open file".into()))
    }

    /// Copy sources travel as URLs; a leading `/` is relative to the
    /// repository root, anything else to the session URL.
    fn copy_url(&self, copy_from: &CopyFrom) -> Result<String, SvnError> {
        let url = match copy_from.path.strip_prefix('/') {
            Some(absolute) => self.root_url.join(absolute)?,
            None => self.session_url.join(&copy_from.path)?,
        };
        Ok(url.url)
    }

    /// Checks for an early server reply before starting a new batch.
    async fn before_command(&mut self) -> Result<(), SvnError> {
        if self.since_poll > 0 {
            return Ok(());
        }
        let wire = self.wire()?;
        if !wire.data_available().await? {
            return Ok(());
        }
        // The server only talks mid-edit to report a failure.
        wire.send_command("abort-edit", SvnItem::List(Vec::new()))
            .await?;
        let response = wire.read_command_response().await?;
        response.ensure_success("commit")?;
        Err(SvnError::Protocol(
            "server ended the commit before close-edit".into(),
        ))
    }

    async fn after_command(&mut self) -> Result<(), SvnError> {
        self.since_poll += 1;
        if self.since_poll >= MAX_COMMANDS_PER_BATCH || self.batch.len() >= MAX_BATCH_BYTES {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SvnError> {
        self.since_poll = 0;
        if self.batch.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.batch);
        let result = self.wire()?.write_wire_bytes(&batch).await;
        self.batch = batch;
        self.batch.clear();
        result
    }

    async fn command(
        &mut self,
        name: &str,
        encode: impl FnOnce(&mut WireEncoder<'_>),
    ) -> Result<(), SvnError> {
        self.before_command().await?;
        trace!(command = name, "queueing editor command");
        let mut enc = WireEncoder::new(&mut self.batch);
        enc.command_start(name);
        encode(&mut enc);
        enc.command_end();
        self.after_command().await
    }

    async fn do_open_root(&mut self, base_rev: Option<u64>) -> Result<(), SvnError> {
        let token = self.token('d');
        self.command("open-root", |enc| {
            enc.opt_number(base_rev);
            enc.string_str(&token);
        })
        .await?;
        self.dirs.push(OpenDir {
            token,
            path: String::new(),
        });
        Ok(())
    }

    async fn do_delete_entry(&mut self, path: String, rev: Option<u64>) -> Result<(), SvnError> {
        let parent = self.top_dir()?.token.clone();
        self.command("delete-entry", |enc| {
            enc.string_str(&path);
            enc.opt_number(rev);
            enc.string_str(&parent);
        })
        .await
    }

    async fn do_add_or_open_dir(
        &mut self,
        path: String,
        copy_from: Option<CopyFrom>,
        base_rev: Option<u64>,
        add: bool,
    ) -> Result<(), SvnError> {
        let parent = self.top_dir()?.token.clone();
        let copy_url = copy_from
            .as_ref()
            .map(|copy| self.copy_url(copy).map(|url| (url, copy.revision)))
            .transpose()?;
        let token = self.token('d');
        let name = if add { "add-dir" } else { "open-dir" };
        self.command(name, |enc| {
            enc.string_str(&path);
            enc.string_str(&parent);
            enc.string_str(&token);
            if add {
                enc.list_start();
                if let Some((url, rev)) = &copy_url {
                    enc.string_str(url);
                    enc.number(*rev);
                }
                enc.list_end();
            } else {
                enc.opt_number(base_rev);
            }
        })
        .await?;
        self.dirs.push(OpenDir { token, path });
        Ok(())
    }

    async fn do_change_dir_property(
        &mut self,
        name: PropName,
        value: Option<Vec<u8>>,
    ) -> Result<(), SvnError> {
        let dir = self.top_dir()?;
        match name.kind() {
            PropKind::Workspace => {
                let path = dir.path.clone();
                self.mediator.set_workspace_property(&path, &name, value)
            }
            PropKind::Entry => Ok(()),
            PropKind::Versioned => {
                let token = dir.token.clone();
                self.command("change-dir-prop", |enc| {
                    enc.string_str(&token);
                    enc.string_str(name.as_str());
                    enc.opt_bytes(value.as_deref());
                })
                .await
            }
        }
    }

    async fn do_close_dir(&mut self) -> Result<(), SvnError> {
        let token = self.top_dir()?.token.clone();
        self.command("close-dir", |enc| enc.string_str(&token)).await?;
        self.dirs.pop();
        Ok(())
    }

    async fn do_absent(&mut self, path: String, name: &str) -> Result<(), SvnError> {
        let parent = self.top_dir()?.token.clone();
        self.command(name, |enc| {
            enc.string_str(&path);
            enc.string_str(&parent);
        })
        .await
    }

    async fn do_add_or_open_file(
        &mut self,
        path: String,
        copy_from: Option<CopyFrom>,
        base_rev: Option<u64>,
        add: bool,
    ) -> Result<(), SvnError> {
        let parent = self.top_dir()?.token.clone();
        let copy_url = copy_from
            .as_ref()
            .map(|copy| self.copy_url(copy).map(|url| (url, copy.revision)))
            .transpose()?;
        let token = self.token('c');
        let name = if add { "add-file" } else { "open-file" };
        self.command(name, |enc| {
            enc.string_str(&path);
            enc.string_str(&parent);
            enc.string_str(&token);
            if add {
                enc.list_start();
                if let Some((url, rev)) = &copy_url {
                    enc.string_str(url);
                    enc.number(*rev);
                }
                enc.list_end();
            } else {
                enc.opt_number(base_rev);
            }
        })
        .await?;
        self.file = Some(OpenFile {
            token,
            path,
            staged: None,
            base_checksum: None,
        });
        Ok(())
    }

    fn do_apply_text_delta(&mut self, base_checksum: Option<String>) -> Result<(), SvnError> {
        let file = self.current_file()?;
        let prefix = format!("ra-svn.{}", file.token);
        file.staged = Some(StagedDelta::new(file.path.clone(), prefix));
        file.base_checksum = base_checksum;
        Ok(())
    }

    fn do_text_delta_chunk(&mut self, window: &DiffWindow) -> Result<(), SvnError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| SvnError::ProtocolViolation("no open file".into()))?;
        let staged = file
            .staged
            .as_mut()
            .ok_or_else(|| SvnError::ProtocolViolation("no text delta in progress".into()))?;
        staged.push(self.mediator.as_mut(), window)
    }

    /// Sends the staged windows as `apply-textdelta`, one chunk per window,
    /// then `textdelta-end`.
    async fn do_text_delta_end(&mut self) -> Result<(), SvnError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| SvnError::ProtocolViolation("no open file".into()))?;
        let mut staged = file
            .staged
            .take()
            .ok_or_else(|| SvnError::ProtocolViolation("no text delta in progress".into()))?;
        let token = file.token.clone();
        let base_checksum = file.base_checksum.take();
        let windows = match staged.drain(self.mediator.as_mut()) {
            Ok(windows) => windows,
            Err(err) => {
                staged.discard(self.mediator.as_mut());
                return Err(err);
            }
        };
        trace!(path = %staged.path(), windows = windows.len(), "sending text delta");

        self.command("apply-textdelta", |enc| {
            enc.string_str(&token);
            enc.opt_bytes(base_checksum.as_deref().map(str::as_bytes));
        })
        .await?;
        let header = self.version.header();
        self.command("textdelta-chunk", |enc| {
            enc.string_str(&token);
            enc.string_bytes(&header);
        })
        .await?;
        let mut encoded = Vec::new();
        for window in &windows {
            encoded.clear();
            encode_window(self.version, window, DEFAULT_ZLIB_LEVEL, &mut encoded)?;
            self.command("textdelta-chunk", |enc| {
                enc.string_str(&token);
                enc.string_bytes(&encoded);
            })
            .await?;
        }
        self.command("textdelta-end", |enc| enc.string_str(&token))
            .await
    }

    async fn do_change_file_property(
        &mut self,
        name: PropName,
        value: Option<Vec<u8>>,
    ) -> Result<(), SvnError> {
        let file = self.current_file()?;
        match name.kind() {
            PropKind::Workspace => {
                let path = file.path.clone();
                self.mediator.set_workspace_property(&path, &name, value)
            }
            PropKind::Entry => Ok(()),
            PropKind::Versioned => {
                let token = file.token.clone();
                self.command("change-file-prop", |enc| {
                    enc.string_str(&token);
                    enc.string_str(name.as_str());
                    enc.opt_bytes(value.as_deref());
                })
                .await
            }
        }
    }

    async fn do_close_file(&mut self, text_checksum: Option<String>) -> Result<(), SvnError> {
        let token = self.current_file()?.token.clone();
        self.command("close-file", |enc| {
            enc.string_str(&token);
            enc.opt_bytes(text_checksum.as_deref().map(str::as_bytes));
        })
        .await?;
        self.file = None;
        Ok(())
    }

    async fn do_close_edit(&mut self) -> Result<CommitInfo, SvnError> {
        self.command("close-edit", |_| {}).await?;
        self.flush().await?;

        let wire = self.wire()?;
        let response = wire.read_command_response().await?;
        response.ensure_success("commit")?;
        wire.handle_auth_request().await?;
        let item = wire.read_item().await?;
        let info = parse_commit_info(&item)?;
        self.finished = true;
        Ok(info)
    }
}

impl TreeEditor for RaSvnCommitEditor {
    fn target_revision(&mut self, rev: u64) -> EditFuture<'_> {
        Box::pin(async move {
            let result = self
                .command("target-rev", |enc| enc.number(rev))
                .await;
            self.settle(result)
        })
    }

    fn open_root(&mut self, base_rev: Option<u64>) -> EditFuture<'_> {
        Box::pin(async move {
            let result = self.do_open_root(base_rev).await;
            self.settle(result)
        })
    }

    fn delete_entry(&mut self, path: String, rev: Option<u64>) -> EditFuture<'_> {
        Box::pin(async move {
            let result = self.do_delete_entry(path, rev).await;
            self.settle(result)
        })
    }

    fn add_dir(&mut self, path: String, copy_from: Option<CopyFrom>) -> EditFuture<'_> {
        Box::pin(async move {
            let result = self.do_add_or_open_dir(path, copy_from, None, true).await;
            self.settle(result)
        })
    }

    fn open_dir(&mut self, path: String, base_rev: Option<u64>) -> EditFuture<'_> {
        Box::pin(async move {
            let result = self.do_add_or_open_dir(path, None, base_rev, false).await;
            self.settle(result)
        })
    }

    fn change_dir_property(
        &mut self,
        name: PropName,
        value: Option<Vec<u8>>,
    ) -> EditFuture<'_> {
        Box::pin(async move {
            let result = self.do_change_dir_property(name, value).await;
            self.settle(result)
        })
    }

    fn close_dir(&mut self) -> EditFuture<'_> {
        Box::pin(async move {
            let result = self.do_close_dir().await;
            self.settle(result)
        })
    }

    fn absent_dir(&mut self, path: String) -> EditFuture<'_> {
        Box::pin(async move {
            let result = self.do_absent(path, "absent-dir").await;
            self.settle(result)
        })
    }

    fn add_file(&mut self, path: String, copy_from: Option<CopyFrom>) -> EditFuture<'_> {
        Box::pin(async move {
            let result = self.do_add_or_open_file(path, copy_from, None, true).await;
            self.settle(result)
        })
    }

    fn open_file(&mut self, path: String, base_rev: Option<u64>) -> EditFuture<'_> {
        Box::pin(async move {
            let result = self.do_add_or_open_file(path, None, base_rev, false).await;
            self.settle(result)
        })
    }

    fn apply_text_delta(&mut self, base_checksum: Option<String>) -> EditFuture<'_> {
        let result = self.do_apply_text_delta(base_checksum);
        let result = self.settle(result);
        Box::pin(std::future::ready(result))
    }

    fn text_delta_chunk(&mut self, window: DiffWindow) -> EditFuture<'_> {
        let result = self.do_text_delta_chunk(&window);
        let result = self.settle(result);
        Box::pin(std::future::ready(result))
    }

    fn text_delta_end(&mut self) -> EditFuture<'_> {
        Box::pin(async move {
            let result = self.do_text_delta_end().await;
            self.settle(result)
        })
    }

    fn change_file_property(
        &mut self,
        name: PropName,
        value: Option<Vec<u8>>,
    ) -> EditFuture<'_> {
        Box::pin(async move {
            let result = self.do_change_file_property(name, value).await;
            self.settle(result)
        })
    }

    fn close_file(&mut self, text_checksum: Option<String>) -> EditFuture<'_> {
        Box::pin(async move {
            let result = self.do_close_file(text_checksum).await;
            self.settle(result)
        })
    }

    fn absent_file(&mut self, path: String) -> EditFuture<'_> {
        Box::pin(async move {
            let result = self.do_absent(path, "absent-file").await;
            self.settle(result)
        })
    }

    fn close_edit(&mut self) -> EditFuture<'_, Option<CommitInfo>> {
        Box::pin(async move {
            let result = self.do_close_edit().await;
            self.settle(result).map(|info| {
                debug!(rev = info.new_rev, "commit accepted");
                if let Some(err) = &info.post_commit_err {
                    warn!(error = %err, "post-commit hook failed");
                }
                Some(info)
            })
        })
    }

    fn abort_edit(&mut self) -> EditFuture<'_> {
        Box::pin(async move {
            if self.finished || self.wire.is_none() {
                self.finished = true;
                return Ok(());
            }
            self.discard_staged();
            self.batch.clear();
            let result = async {
                let wire = self.wire()?;
                wire.send_command("abort-edit", SvnItem::List(Vec::new()))
                    .await?;
                wire.read_command_response()
                    .await?
                    .ensure_success("abort-edit")
            }
            .await;
            let result = self.settle(result);
            self.finished = true;
            result
        })
    }
}

impl Drop for RaSvnCommitEditor {
    fn drop(&mut self) {
        self.discard_staged();
    }
}
