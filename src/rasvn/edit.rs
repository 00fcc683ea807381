//! Reports and server-driven edits on the `svn://` wire.
//!
//! An update-style command is answered by an editor drive: the server sends
//! one command per editor call, naming directories and files by tokens.
//! [`IncomingDrive`] checks the tokens against the open nodes and turns each
//! command into [`EditorEvent`]s, decoding svndiff chunks into windows on
//! the way.

use tracing::{debug, trace};

use crate::editor::{EditorEvent, TreeEditor, dispatch};
use crate::path::{validate_rel_dir_path, validate_rel_dir_path_ref, validate_rel_path};
use crate::svndiff::SvndiffDecoder;
use crate::{CopyFrom, Depth, PropName, Report, ReportCommand, ReportRequest, SvnError};

use super::SvnItem;
use super::conn::WireConn;
use super::parse::{opt_tuple_bytes, opt_tuple_string, opt_tuple_u64, parse_server_error};
use super::wire::WireEncoder;

const MAX_REPORT_BATCH_BYTES: usize = 64 * 1024;

fn recurse(depth: Depth) -> bool {
    matches!(depth, Depth::Immediates | Depth::Infinity)
}

fn opt_rev(rev: Option<u64>) -> SvnItem {
    SvnItem::List(rev.map(SvnItem::Number).into_iter().collect())
}

/// Parameters of the command that precedes the report.
pub(crate) fn report_request_params(request: &ReportRequest) -> Result<SvnItem, SvnError> {
    let target = SvnItem::String(validate_rel_dir_path(request.target())?.into_bytes());
    let depth = SvnItem::Word(request.depth().as_word().to_string());
    let items = match request {
        ReportRequest::Update(o) => vec![
            opt_rev(o.scope.rev),
            target,
            SvnItem::Bool(recurse(o.scope.depth)),
            depth,
            SvnItem::Bool(o.send_copyfrom_args),
            SvnItem::Bool(o.ignore_ancestry),
        ],
        ReportRequest::Switch(o) => vec![
            opt_rev(o.scope.rev),
            target,
            SvnItem::Bool(recurse(o.scope.depth)),
            SvnItem::String(o.switch_url.as_bytes().to_vec()),
            depth,
            SvnItem::Bool(false),
            SvnItem::Bool(o.ignore_ancestry),
        ],
        ReportRequest::Status(o) => vec![
            target,
            SvnItem::Bool(recurse(o.scope.depth)),
            opt_rev(o.scope.rev),
            depth,
        ],
        ReportRequest::Diff(o) => vec![
            opt_rev(o.scope.rev),
            target,
            SvnItem::Bool(recurse(o.scope.depth)),
            SvnItem::Bool(o.ignore_ancestry),
            SvnItem::String(o.versus_url.as_bytes().to_vec()),
            SvnItem::Bool(o.text_deltas),
            depth,
        ],
    };
    Ok(SvnItem::List(items))
}

/// Writes the report in batches. Returns `false` when it ended with
/// `abort-report`.
pub(crate) async fn send_report(conn: &mut WireConn, report: &Report) -> Result<bool, SvnError> {
    let mut buf = Vec::new();
    for command in &report.commands {
        let end = encode_report_command(command, &mut buf)?;
        if buf.len() >= MAX_REPORT_BATCH_BYTES || end.is_some() {
            conn.write_wire_bytes(&buf).await?;
            buf.clear();
        }
        if let Some(finished) = end {
            return Ok(finished);
        }
    }

    Err(SvnError::ProtocolViolation(
        "report did not end with finish-report or abort-report".into(),
    ))
}

/// Returns `Some(finished)` for the terminating command.
fn encode_report_command(cmd: &ReportCommand, out: &mut Vec<u8>) -> Result<Option<bool>, SvnError> {
    let mut enc = WireEncoder::new(out);
    match cmd {
        ReportCommand::SetPath {
            path,
            rev,
            start_empty,
            lock_token,
            depth,
        } => {
            let path = validate_rel_dir_path_ref(path)?;
            enc.command_start("set-path");
            enc.string_str(&path);
            enc.number(*rev);
            enc.bool(*start_empty);
            enc.opt_bytes(lock_token.as_deref().map(str::as_bytes));
            enc.word(depth.as_word());
            enc.command_end();
            Ok(None)
        }
        ReportCommand::DeletePath { path } => {
            let path = validate_rel_path(path)?;
            enc.command_start("delete-path");
            enc.string_str(&path);
            enc.command_end();
            Ok(None)
        }
        ReportCommand::LinkPath {
            path,
            url,
            rev,
            start_empty,
            lock_token,
            depth,
        } => {
            let path = validate_rel_dir_path_ref(path)?;
            enc.command_start("link-path");
            enc.string_str(&path);
            enc.string_str(url);
            enc.number(*rev);
            enc.bool(*start_empty);
            enc.opt_bytes(lock_token.as_deref().map(str::as_bytes));
            enc.word(depth.as_word());
            enc.command_end();
            Ok(None)
        }
        ReportCommand::FinishReport => {
            enc.command_start("finish-report");
            enc.command_end();
            Ok(Some(true))
        }
        ReportCommand::AbortReport => {
            enc.command_start("abort-report");
            enc.command_end();
            Ok(Some(false))
        }
    }
}

#[derive(Debug)]
struct IncomingFile {
    token: String,
    decoder: Option<SvndiffDecoder>,
}

/// Token bookkeeping for one server-driven edit.
#[derive(Debug, Default)]
pub(crate) struct IncomingDrive {
    dirs: Vec<String>,
    file: Option<IncomingFile>,
}

impl IncomingDrive {
    fn expect_dir(&self, token: &str, cmd: &str) -> Result<(), SvnError> {
        if self.file.is_some() {
            return Err(SvnError::ProtocolViolation(format!(
                "{cmd} while a file is open"
            )));
        }
        match self.dirs.last() {
            Some(top) if top == token => Ok(()),
            _ => Err(SvnError::ProtocolViolation(format!(
                "{cmd} names directory token '{token}' which is not the innermost open directory"
            ))),
        }
    }

    fn expect_file(&mut self, token: &str, cmd: &str) -> Result<&mut IncomingFile, SvnError> {
        match self.file.as_mut() {
            Some(file) if file.token == token => Ok(file),
            _ => Err(SvnError::ProtocolViolation(format!(
                "{cmd} names file token '{token}' which is not open"
            ))),
        }
    }

    /// Translates one wire command into the editor calls it stands for.
    pub(crate) fn events(
        &mut self,
        cmd: &str,
        params: &[SvnItem],
    ) -> Result<Vec<EditorEvent>, SvnError> {
        let event = match cmd {
            "target-rev" => EditorEvent::TargetRevision {
                rev: req_u64(params, 0, cmd)?,
            },
            "open-root" => {
                if !self.dirs.is_empty() {
                    return Err(SvnError::ProtocolViolation("open-root sent twice".into()));
                }
                let base_rev = params.first().and_then(opt_tuple_u64);
                self.dirs.push(req_string(params, 1, cmd)?);
                EditorEvent::OpenRoot { base_rev }
            }
            "delete-entry" => {
                let path = req_path(params, 0, cmd)?;
                let rev = params.get(1).and_then(opt_tuple_u64);
                self.expect_dir(&req_string(params, 2, cmd)?, cmd)?;
                EditorEvent::DeleteEntry { path, rev }
            }
            "add-dir" | "open-dir" => {
                let path = req_path(params, 0, cmd)?;
                self.expect_dir(&req_string(params, 1, cmd)?, cmd)?;
                let child = req_string(params, 2, cmd)?;
                let event = if cmd == "add-dir" {
                    EditorEvent::AddDir {
                        path,
                        copy_from: copy_from(params.get(3))?,
                    }
                } else {
                    EditorEvent::OpenDir {
                        path,
                        base_rev: params.get(3).and_then(opt_tuple_u64),
                    }
                };
                self.dirs.push(child);
                event
            }
            "change-dir-prop" => {
                self.expect_dir(&req_string(params, 0, cmd)?, cmd)?;
                EditorEvent::ChangeDirProp {
                    name: PropName::new(req_string(params, 1, cmd)?),
                    value: params.get(2).and_then(opt_tuple_bytes),
                }
            }
            "close-dir" => {
                self.expect_dir(&req_string(params, 0, cmd)?, cmd)?;
                self.dirs.pop();
                EditorEvent::CloseDir
            }
            "absent-dir" | "absent-file" => {
                let path = req_path(params, 0, cmd)?;
                self.expect_dir(&req_string(params, 1, cmd)?, cmd)?;
                if cmd == "absent-dir" {
                    EditorEvent::AbsentDir { path }
                } else {
                    EditorEvent::AbsentFile { path }
                }
            }
            "add-file" | "open-file" => {
                let path = req_path(params, 0, cmd)?;
                self.expect_dir(&req_string(params, 1, cmd)?, cmd)?;
                let token = req_string(params, 2, cmd)?;
                let event = if cmd == "add-file" {
                    EditorEvent::AddFile {
                        path,
                        copy_from: copy_from(params.get(3))?,
                    }
                } else {
                    EditorEvent::OpenFile {
                        path,
                        base_rev: params.get(3).and_then(opt_tuple_u64),
                    }
                };
                self.file = Some(IncomingFile {
                    token,
                    decoder: None,
                });
                event
            }
            "apply-textdelta" => {
                let file = self.expect_file(&req_string(params, 0, cmd)?, cmd)?;
                if file.decoder.is_some() {
                    return Err(SvnError::ProtocolViolation(
                        "apply-textdelta sent twice for one file".into(),
                    ));
                }
                file.decoder = Some(SvndiffDecoder::default());
                EditorEvent::ApplyTextDelta {
                    base_checksum: params.get(1).and_then(opt_tuple_string),
                }
            }
            "textdelta-chunk" => {
                let file = self.expect_file(&req_string(params, 0, cmd)?, cmd)?;
                let chunk = params
                    .get(1)
                    .and_then(SvnItem::as_bytes_string)
                    .ok_or_else(|| SvnError::Protocol("textdelta-chunk without data".into()))?;
                let decoder = file.decoder.as_mut().ok_or_else(|| {
                    SvnError::ProtocolViolation("textdelta-chunk before apply-textdelta".into())
                })?;
                decoder.push(&chunk)?;
                let mut events = Vec::new();
                while let Some(window) = decoder.next_window()? {
                    events.push(EditorEvent::TextDeltaChunk { window });
                }
                return Ok(events);
            }
            "textdelta-end" => {
                let file = self.expect_file(&req_string(params, 0, cmd)?, cmd)?;
                let decoder = file.decoder.take().ok_or_else(|| {
                    SvnError::ProtocolViolation("textdelta-end before apply-textdelta".into())
                })?;
                if !decoder.is_empty() {
                    decoder.finish()?;
                }
                EditorEvent::TextDeltaEnd
            }
            "change-file-prop" => {
                self.expect_file(&req_string(params, 0, cmd)?, cmd)?;
                EditorEvent::ChangeFileProp {
                    name: PropName::new(req_string(params, 1, cmd)?),
                    value: params.get(2).and_then(opt_tuple_bytes),
                }
            }
            "close-file" => {
                let file = self.expect_file(&req_string(params, 0, cmd)?, cmd)?;
                if file.decoder.is_some() {
                    return Err(SvnError::ProtocolViolation(
                        "close-file before textdelta-end".into(),
                    ));
                }
                self.file = None;
                EditorEvent::CloseFile {
                    text_checksum: params.get(1).and_then(opt_tuple_string),
                }
            }
            other => {
                return Err(SvnError::ProtocolViolation(format!(
                    "unexpected editor command '{other}'"
                )));
            }
        };
        Ok(vec![event])
    }

    fn check_closed(&self) -> Result<(), SvnError> {
        if self.file.is_some() || !self.dirs.is_empty() {
            return Err(SvnError::ProtocolViolation(
                "close-edit while nodes are still open".into(),
            ));
        }
        Ok(())
    }
}

enum DriveOutcome {
    Completed,
    Aborted,
    Failed {
        error: SvnError,
        response_pending: bool,
    },
}

/// Feeds the server's editor drive into `editor` and reads the response
/// that ends `command`.
///
/// An error raised by `editor` is reported back to the server, which then
/// abandons the edit; the caller gets that error. A server failure ends the
/// drive with [`SvnError::Server`].
pub(crate) async fn drive_editor(
    conn: &mut WireConn,
    command: &str,
    editor: &mut dyn TreeEditor,
) -> Result<(), SvnError> {
    match drive(conn, editor).await? {
        DriveOutcome::Completed => conn.read_command_response().await?.ensure_success(command),
        DriveOutcome::Aborted => {
            let response = conn.read_command_response().await?;
            Err(if response.is_failure() {
                response.failure(command)
            } else {
                SvnError::Cancelled
            })
        }
        DriveOutcome::Failed {
            error,
            response_pending,
        } => {
            if response_pending {
                // Usually our own error echoed back.
                let _ = conn.read_command_response().await?;
            }
            Err(error)
        }
    }
}

async fn drive(conn: &mut WireConn, editor: &mut dyn TreeEditor) -> Result<DriveOutcome, SvnError> {
    let mut incoming = IncomingDrive::default();
    loop {
        let (cmd, params) = read_command_item(conn).await?;
        trace!(cmd = %cmd, "editor command");
        match cmd.as_str() {
            "failure" => return Err(SvnError::Server(parse_server_error(&params))),
            "close-edit" => {
                let result = match incoming.check_closed() {
                    Ok(()) => editor.close_edit().await.map(|_| ()),
                    Err(err) => Err(err),
                };
                if let Err(err) = result {
                    return consumer_failed(conn, err, false).await;
                }
                conn.write_cmd_success().await?;
                return Ok(DriveOutcome::Completed);
            }
            "abort-edit" => {
                debug!("server aborted the edit");
                let _ = editor.abort_edit().await;
                conn.write_cmd_success().await?;
                return Ok(DriveOutcome::Aborted);
            }
            _ => {}
        }

        let events = match incoming.events(&cmd, &params) {
            Ok(events) => events,
            Err(err) if err.is_transport() => return Err(err),
            Err(err) => return consumer_failed(conn, err, true).await,
        };
        for event in events {
            if let Err(err) = dispatch(editor, event).await {
                if err.is_transport() {
                    return Err(err);
                }
                return consumer_failed(conn, err, true).await;
            }
        }
    }
}

/// Reports `error` to the server and skips the rest of its drive.
async fn consumer_failed(
    conn: &mut WireConn,
    error: SvnError,
    drain: bool,
) -> Result<DriveOutcome, SvnError> {
    debug!(error = %error, "editor rejected the drive");
    let aborted = conn.write_cmd_failure(&error).await?;
    let response_pending = if drain && !aborted {
        drain_until_abort_or_success(conn).await?
    } else {
        true
    };
    Ok(DriveOutcome::Failed {
        error,
        response_pending,
    })
}

/// Returns `true` when the drive ended with `abort-edit`, `false` when the
/// command's final `success` was consumed instead.
async fn drain_until_abort_or_success(conn: &mut WireConn) -> Result<bool, SvnError> {
    loop {
        let SvnItem::List(parts) = conn.read_item().await? else {
            continue;
        };
        match parts.first().and_then(SvnItem::as_word).as_deref() {
            Some("abort-edit") => return Ok(true),
            Some("success") => return Ok(false),
            _ => {}
        }
    }
}

async fn read_command_item(conn: &mut WireConn) -> Result<(String, Vec<SvnItem>), SvnError> {
    let SvnItem::List(mut parts) = conn.read_item().await? else {
        return Err(SvnError::Protocol("expected command list".into()));
    };
    if parts.is_empty() {
        return Err(SvnError::Protocol("empty command list".into()));
    }
    let params = if parts.len() > 1 {
        parts.swap_remove(1).as_list().unwrap_or_default()
    } else {
        Vec::new()
    };
    let cmd = parts[0]
        .as_word()
        .ok_or_else(|| SvnError::Protocol("command name not a word".into()))?;
    Ok((cmd, params))
}

fn req_string(params: &[SvnItem], idx: usize, cmd: &str) -> Result<String, SvnError> {
    params
        .get(idx)
        .and_then(SvnItem::as_string)
        .ok_or_else(|| SvnError::Protocol(format!("{cmd}: parameter {idx} is not a string")))
}

fn req_u64(params: &[SvnItem], idx: usize, cmd: &str) -> Result<u64, SvnError> {
    params
        .get(idx)
        .and_then(SvnItem::as_u64)
        .ok_or_else(|| SvnError::Protocol(format!("{cmd}: parameter {idx} is not a number")))
}

fn req_path(params: &[SvnItem], idx: usize, cmd: &str) -> Result<String, SvnError> {
    validate_rel_path(&req_string(params, idx, cmd)?)
}

/// `( path rev )` or `( )`. A leading `/` marks a repository-absolute path.
fn copy_from(item: Option<&SvnItem>) -> Result<Option<CopyFrom>, SvnError> {
    let Some(items) = item.and_then(SvnItem::as_list) else {
        return Ok(None);
    };
    if items.is_empty() {
        return Ok(None);
    }
    let path = items[0]
        .as_string()
        .ok_or_else(|| SvnError::Protocol("copy-from path not a string".into()))?;
    let rev = items
        .get(1)
        .and_then(SvnItem::as_u64)
        .ok_or_else(|| SvnError::Protocol("copy-from rev not a number".into()))?;
    let path = match path.strip_prefix('/') {
        Some(absolute) => format!("/{}", validate_rel_dir_path(absolute)?),
        None => validate_rel_path(&path)?,
    };
    Ok(Some(CopyFrom::new(path, rev)))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::rasvn::conn::tests::{connected_conn, read_line, run_async, send_line};
    use crate::svndiff::{DEFAULT_ZLIB_LEVEL, SvndiffVersion, encode_stream};
    use crate::{
        DiffOptions, DiffWindow, MemoryExport, RecordingEditor, StatusOptions, UpdateOptions,
    };

    fn s(text: &str) -> SvnItem {
        SvnItem::String(text.as_bytes().to_vec())
    }

    fn l(items: Vec<SvnItem>) -> SvnItem {
        SvnItem::List(items)
    }

    #[test]
    fn report_commands_encode_in_wire_order() {
        let mut report = Report::new();
        report
            .push(ReportCommand::SetPath {
                path: String::new(),
                rev: 5,
                start_empty: false,
                lock_token: None,
                depth: Depth::Infinity,
            })
            .push(ReportCommand::SetPath {
                path: "a/b".into(),
                rev: 3,
                start_empty: true,
                lock_token: Some("tok".into()),
                depth: Depth::Files,
            })
            .push(ReportCommand::DeletePath { path: "gone".into() })
            .push(ReportCommand::LinkPath {
                path: "lib".into(),
                url: "svn://h/r/x".into(),
                rev: 2,
                start_empty: false,
                lock_token: None,
                depth: Depth::Empty,
            })
            .finish();

        let mut out = Vec::new();
        let mut ends = Vec::new();
        for cmd in &report.commands {
            ends.push(encode_report_command(cmd, &mut out).unwrap());
        }
        assert_eq!(ends, [None, None, None, None, Some(true)]);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "( set-path ( 0: 5 false ( ) infinity ) ) \n\
             ( set-path ( 3:a/b 3 true ( 3:tok ) files ) ) \n\
             ( delete-path ( 4:gone ) ) \n\
             ( link-path ( 3:lib 11:svn://h/r/x 2 false ( ) empty ) ) \n\
             ( finish-report ( ) ) \n"
        );
    }

    #[test]
    fn report_paths_are_validated() {
        let mut out = Vec::new();
        let err = encode_report_command(
            &ReportCommand::DeletePath {
                path: "../etc".into(),
            },
            &mut out,
        )
        .unwrap_err();
        assert!(matches!(err, SvnError::InvalidPath(_)));
    }

    #[test]
    fn request_params_follow_command_layout() {
        let update = report_request_params(&ReportRequest::Update(
            UpdateOptions::new("", Depth::Infinity).with_rev(7),
        ))
        .unwrap();
        let mut out = Vec::new();
        update.encode(&mut out);
        assert_eq!(out, b"( ( 7 ) 0: true infinity false false ) ");

        let status = report_request_params(&ReportRequest::Status(StatusOptions::new(
            "f", Depth::Empty,
        )))
        .unwrap();
        out.clear();
        status.encode(&mut out);
        assert_eq!(out, b"( 1:f false ( ) empty ) ");

        let diff = report_request_params(&ReportRequest::Diff(
            DiffOptions::new("", "svn://h/r/b", Depth::Files).with_text_deltas(false),
        ))
        .unwrap();
        out.clear();
        diff.encode(&mut out);
        assert_eq!(out, b"( ( ) 0: false false 11:svn://h/r/b false files ) ");
    }

    #[test]
    fn tokens_must_name_the_innermost_node() {
        let mut drive = IncomingDrive::default();
        drive
            .events("open-root", &[l(vec![SvnItem::Number(1)]), s("d0")])
            .unwrap();
        drive
            .events("add-dir", &[s("a"), s("d0"), s("d1"), l(Vec::new())])
            .unwrap();
        let err = drive
            .events("add-file", &[s("a/f"), s("d0"), s("c2"), l(Vec::new())])
            .unwrap_err();
        assert!(matches!(err, SvnError::ProtocolViolation(_)));

        let err = drive.events("close-dir", &[s("d0")]).unwrap_err();
        assert!(matches!(err, SvnError::ProtocolViolation(_)));
        drive.events("close-dir", &[s("d1")]).unwrap();
        drive.events("close-dir", &[s("d0")]).unwrap();
        drive.check_closed().unwrap();
    }

    #[test]
    fn chunks_are_decoded_into_windows() {
        let windows = DiffWindow::replacement_windows(b"hello world, hello svndiff", 8);
        let stream = encode_stream(SvndiffVersion::V1, &windows, DEFAULT_ZLIB_LEVEL).unwrap();

        let mut drive = IncomingDrive::default();
        drive.events("open-root", &[l(Vec::new()), s("d0")]).unwrap();
        drive
            .events("add-file", &[s("f"), s("d0"), s("c1"), l(Vec::new())])
            .unwrap();
        drive
            .events("apply-textdelta", &[s("c1"), l(Vec::new())])
            .unwrap();

        let mut decoded = Vec::new();
        for chunk in stream.chunks(5) {
            for event in drive
                .events("textdelta-chunk", &[s("c1"), SvnItem::String(chunk.to_vec())])
                .unwrap()
            {
                let EditorEvent::TextDeltaChunk { window } = event else {
                    panic!("unexpected event");
                };
                decoded.push(window);
            }
        }
        assert_eq!(decoded, windows);

        let err = drive.events("close-file", &[s("c1"), l(Vec::new())]).unwrap_err();
        assert!(matches!(err, SvnError::ProtocolViolation(_)));
        drive.events("textdelta-end", &[s("c1")]).unwrap();
        drive.events("close-file", &[s("c1"), l(Vec::new())]).unwrap();
    }

    #[test]
    fn copy_sources_keep_absolute_marker() {
        let copy = copy_from(Some(&l(vec![s("/trunk/x"), SvnItem::Number(4)])))
            .unwrap()
            .unwrap();
        assert_eq!(copy, CopyFrom::new("/trunk/x", 4));
        assert_eq!(copy_from(Some(&l(Vec::new()))).unwrap(), None);
        assert!(copy_from(Some(&l(vec![s("/a/../b"), SvnItem::Number(1)]))).is_err());
    }

    #[test]
    fn drive_feeds_editor_and_acknowledges_close() {
        run_async(async {
            let (mut conn, mut server) = connected_conn(None, None).await;
            let stream = encode_stream(
                SvndiffVersion::V0,
                &[DiffWindow::replacement(b"abc")],
                DEFAULT_ZLIB_LEVEL,
            )
            .unwrap();
            let script = tokio::spawn(async move {
                for line in [
                    b"( target-rev ( 3 ) )".to_vec(),
                    b"( open-root ( ( 3 ) 2:d0 ) )".to_vec(),
                    b"( add-file ( 5:x.txt 2:d0 2:c1 ( ) ) )".to_vec(),
                    b"( apply-textdelta ( 2:c1 ( ) ) )".to_vec(),
                ] {
                    send_line(&mut server, &line).await;
                }
                let mut chunk = b"( textdelta-chunk ( 2:c1 ".to_vec();
                chunk.extend_from_slice(format!("{}:", stream.len()).as_bytes());
                chunk.extend_from_slice(&stream);
                chunk.extend_from_slice(b" ) )");
                send_line(&mut server, &chunk).await;
                for line in [
                    b"( textdelta-end ( 2:c1 ) )".to_vec(),
                    b"( change-file-prop ( 2:c1 13:svn:mime-type ( 10:text/plain ) ) )".to_vec(),
                    b"( close-file ( 2:c1 ( 32:900150983cd24fb0d6963f7d28e17f72 ) ) )".to_vec(),
                    b"( close-dir ( 2:d0 ) )".to_vec(),
                    b"( close-edit ( ) )".to_vec(),
                ] {
                    send_line(&mut server, &line).await;
                }
                let ack = read_line(&mut server).await;
                send_line(&mut server, b"( success ( ) )").await;
                ack
            });

            let mut export = MemoryExport::new();
            drive_editor(&mut conn, "update", &mut export).await.unwrap();
            assert_eq!(script.await.unwrap(), b"( success ( ) ) \n");
            assert_eq!(export.file("x.txt"), Some(&b"abc"[..]));
            assert_eq!(export.target_rev(), Some(3));
            assert_eq!(
                export.node("x.txt").unwrap().props["svn:mime-type"],
                b"text/plain"
            );
        });
    }

    #[test]
    fn editor_errors_are_sent_back_and_returned() {
        run_async(async {
            let (mut conn, mut server) = connected_conn(None, None).await;
            let script = tokio::spawn(async move {
                send_line(&mut server, b"( open-root ( ( ) 2:d0 ) )").await;
                // Closing the root twice breaks the editor's nesting.
                send_line(&mut server, b"( close-dir ( 2:d0 ) )").await;
                send_line(&mut server, b"( close-dir ( 2:d0 ) )").await;
                let failure = read_line(&mut server).await;
                send_line(&mut server, b"( abort-edit ( ) )").await;
                send_line(
                    &mut server,
                    b"( failure ( ( 1 11:echoed back 0: 0 ) ) )",
                )
                .await;
                failure
            });

            let mut editor = RecordingEditor::new();
            let err = drive_editor(&mut conn, "update", &mut editor)
                .await
                .unwrap_err();
            assert!(matches!(err, SvnError::ProtocolViolation(_)));
            let failure = String::from_utf8(script.await.unwrap()).unwrap();
            assert!(failure.starts_with("( failure ( ( 1 "), "{failure}");
            assert!(failure.contains("protocol violation"));
        });
    }

    #[test]
    fn server_abort_cancels_the_drive() {
        run_async(async {
            let (mut conn, mut server) = connected_conn(None, None).await;
            let script = tokio::spawn(async move {
                send_line(&mut server, b"( open-root ( ( ) 2:d0 ) )").await;
                send_line(&mut server, b"( abort-edit ( ) )").await;
                let ack = read_line(&mut server).await;
                send_line(&mut server, b"( success ( ) )").await;
                ack
            });

            let mut editor = RecordingEditor::new();
            let err = drive_editor(&mut conn, "switch", &mut editor)
                .await
                .unwrap_err();
            assert!(matches!(err, SvnError::Cancelled));
            assert_eq!(script.await.unwrap(), b"( success ( ) ) \n");
        });
    }

    #[test]
    fn server_failure_mid_drive_is_returned() {
        run_async(async {
            let (mut conn, mut server) = connected_conn(None, None).await;
            send_line(&mut server, b"( open-root ( ( ) 2:d0 ) )").await;
            send_line(
                &mut server,
                b"( failure ( ( 160013 14:Path not found 0: 0 ) ) )",
            )
            .await;
            let mut editor = RecordingEditor::new();
            let err = drive_editor(&mut conn, "update", &mut editor)
                .await
                .unwrap_err();
            assert!(matches!(err, SvnError::Server(e) if e.chain[0].code == 160013));
        });
    }
}
