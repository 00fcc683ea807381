//! The tree editor protocol.
//!
//! An edit drive is a pre-order walk: `open_root`, then nested
//! `add_*`/`open_*` ... `close_*` pairs, then exactly one `close_edit` or
//! `abort_edit`. Files and directories are addressed by the frame on top of
//! the stack, so a child must be closed before its next sibling begins.
//!
//! [`EditorState`] checks that discipline without side effects. Every
//! editor in this crate runs each call through one before touching its
//! backend, so a rejected call leaves nothing behind.

use std::future::Future;
use std::pin::Pin;

use crate::path::{dirname, validate_rel_path};
use crate::{CommitInfo, CopyFrom, DiffWindow, PropName, SvnError};

/// Future returned by [`TreeEditor`] methods.
pub type EditFuture<'a, T = ()> = Pin<Box<dyn Future<Output = Result<T, SvnError>> + Send + 'a>>;

/// Wraps an already computed result as an [`EditFuture`].
pub fn ready<'a, T: Send + 'a>(result: Result<T, SvnError>) -> EditFuture<'a, T> {
    Box::pin(std::future::ready(result))
}

/// Consumer of an edit drive.
///
/// Paths are canonical and relative to the session root. Revisions given as
/// `None` mean the caller does not know the base revision, which disables
/// out-of-date checks for that node.
pub trait TreeEditor: Send {
    /// Announces the revision the drive brings the tree to.
    fn target_revision(&mut self, rev: u64) -> EditFuture<'_>;

    /// Opens the root directory. Must be the first structural call.
    fn open_root(&mut self, base_rev: Option<u64>) -> EditFuture<'_>;

    /// Removes the child `path` of the current directory.
    fn delete_entry(&mut self, path: String, rev: Option<u64>) -> EditFuture<'_>;

    /// Adds directory `path`, optionally as a copy.
    fn add_dir(&mut self, path: String, copy_from: Option<CopyFrom>) -> EditFuture<'_>;

    /// Opens existing directory `path`.
    fn open_dir(&mut self, path: String, base_rev: Option<u64>) -> EditFuture<'_>;

    /// Sets (`Some`) or deletes (`None`) a property of the current directory.
    fn change_dir_property(&mut self, name: PropName, value: Option<Vec<u8>>)
    -> EditFuture<'_>;

    /// Closes the current directory.
    fn close_dir(&mut self) -> EditFuture<'_>;

    /// Reports a child directory the consumer may not see.
    fn absent_dir(&mut self, path: String) -> EditFuture<'_>;

    /// Adds file `path`, optionally as a copy.
    fn add_file(&mut self, path: String, copy_from: Option<CopyFrom>) -> EditFuture<'_>;

    /// Opens existing file `path`.
    fn open_file(&mut self, path: String, base_rev: Option<u64>) -> EditFuture<'_>;

    /// Starts the window stream for the current file.
    ///
    /// `base_checksum` is the MD5 of the content the windows apply to.
    fn apply_text_delta(&mut self, base_checksum: Option<String>) -> EditFuture<'_>;

    /// Delivers the next window of the current file.
    fn text_delta_chunk(&mut self, window: DiffWindow) -> EditFuture<'_>;

    /// Ends the window stream of the current file.
    fn text_delta_end(&mut self) -> EditFuture<'_>;

    /// Sets (`Some`) or deletes (`None`) a property of the current file.
    fn change_file_property(
        &mut self,
        name: PropName,
        value: Option<Vec<u8>>,
    ) -> EditFuture<'_>;

    /// Closes the current file, checking its content against `text_checksum`.
    fn close_file(&mut self, text_checksum: Option<String>) -> EditFuture<'_>;

    /// Reports a child file the consumer may not see.
    fn absent_file(&mut self, path: String) -> EditFuture<'_>;

    /// Completes the drive. Commit editors return the new revision.
    fn close_edit(&mut self) -> EditFuture<'_, Option<CommitInfo>>;

    /// Discards the drive. Safe to call repeatedly and after errors.
    fn abort_edit(&mut self) -> EditFuture<'_>;
}

/// Kind of an open node in an [`EditorState`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    /// The root directory.
    Root,
    /// A directory below the root.
    Dir,
    /// A file.
    File,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DeltaPhase {
    NotStarted,
    Streaming,
    Ended,
}

/// One open node of an edit drive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Node kind.
    pub kind: FrameKind,
    /// Node path; `""` for the root.
    pub path: String,
    /// Base revision given when the node was opened.
    pub base_rev: Option<u64>,
    /// Whether the node was added in this drive.
    pub added: bool,
    /// Copy source of an added node.
    pub copy_from: Option<CopyFrom>,
    delta: DeltaPhase,
}

impl Frame {
    fn new(kind: FrameKind, path: String, base_rev: Option<u64>) -> Self {
        Self {
            kind,
            path,
            base_rev,
            added: false,
            copy_from: None,
            delta: DeltaPhase::NotStarted,
        }
    }

    fn added(kind: FrameKind, path: String, copy_from: Option<CopyFrom>) -> Self {
        Self {
            added: true,
            copy_from,
            ..Self::new(kind, path, None)
        }
    }

    fn is_dir(&self) -> bool {
        self.kind != FrameKind::File
    }

    /// Whether windows were delivered (or are being delivered) for this file.
    pub fn has_text_delta(&self) -> bool {
        self.delta != DeltaPhase::NotStarted
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Ready,
    Open,
    RootClosed,
    Closed,
    Aborted,
    Failed,
}

/// Frame-stack validator shared by every editor.
///
/// Each method checks one call and updates the stack only when the call is
/// valid. A rejected call poisons the state: afterwards only
/// [`EditorState::abort`] succeeds.
#[derive(Clone, Debug)]
pub struct EditorState {
    stack: Vec<Frame>,
    phase: Phase,
    target_rev: Option<u64>,
}

impl Default for EditorState {
    fn default() -> Self {
        Self::new()
    }
}

fn violation(msg: impl Into<String>) -> SvnError {
    SvnError::ProtocolViolation(msg.into())
}

impl EditorState {
    /// Creates a state expecting `open_root`.
    pub fn new() -> Self {
        Self {
            stack: Vec::new(),
            phase: Phase::Ready,
            target_rev: None,
        }
    }

    /// The frame on top of the stack.
    pub fn top(&self) -> Option<&Frame> {
        self.stack.last()
    }

    /// Number of open frames.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Revision announced by `target_revision`, if any.
    pub fn target_rev(&self) -> Option<u64> {
        self.target_rev
    }

    /// `true` once `close_edit` or `abort_edit` has been accepted.
    pub fn is_finished(&self) -> bool {
        matches!(self.phase, Phase::Closed | Phase::Aborted)
    }

    /// `true` when a call failed and the drive can only be aborted.
    pub fn is_failed(&self) -> bool {
        self.phase == Phase::Failed
    }

    /// Poisons the state after a backend failure.
    pub fn fail(&mut self) {
        if !self.is_finished() {
            self.phase = Phase::Failed;
        }
    }

    /// Runs `result` through the state: an error poisons it.
    pub fn guard<T>(&mut self, result: Result<T, SvnError>) -> Result<T, SvnError> {
        if result.is_err() {
            self.fail();
        }
        result
    }

    fn check_live(&self) -> Result<(), SvnError> {
        match self.phase {
            Phase::Closed | Phase::Aborted => Err(violation("edit already finished")),
            Phase::Failed => Err(violation("edit failed; only abort_edit is accepted")),
            Phase::Ready | Phase::Open | Phase::RootClosed => Ok(()),
        }
    }

    fn check_open(&self) -> Result<(), SvnError> {
        self.check_live()?;
        match self.phase {
            Phase::Ready => Err(violation("open_root has not been called")),
            Phase::RootClosed => Err(violation("root directory already closed")),
            _ => Ok(()),
        }
    }

    fn top_dir(&self, op: &str) -> Result<&Frame, SvnError> {
        self.check_open()?;
        match self.stack.last() {
            Some(frame) if frame.is_dir() => Ok(frame),
            Some(frame) => Err(violation(format!(
                "{op} while file '{}' is open",
                frame.path
            ))),
            None => Err(violation(format!("{op} with no open directory"))),
        }
    }

    fn top_file(&mut self, op: &str) -> Result<&mut Frame, SvnError> {
        self.check_open()?;
        match self.stack.last_mut() {
            Some(frame) if frame.kind == FrameKind::File => Ok(frame),
            _ => Err(violation(format!("{op} with no open file"))),
        }
    }

    fn child(&self, op: &str, path: &str) -> Result<(), SvnError> {
        let parent = self.top_dir(op)?;
        let canonical = validate_rel_path(path)?;
        if canonical != path {
            return Err(SvnError::InvalidPath(format!("non-canonical path: {path}")));
        }
        if dirname(path) != parent.path {
            return Err(violation(format!(
                "{op}: '{path}' is not a child of '{}'",
                parent.path
            )));
        }
        Ok(())
    }

    fn checked(&mut self, f: impl FnOnce(&mut Self) -> Result<(), SvnError>) -> Result<(), SvnError> {
        let result = f(self);
        self.guard(result)
    }

    /// Checks `target_revision`.
    pub fn target_revision(&mut self, rev: u64) -> Result<(), SvnError> {
        self.checked(|s| {
            s.check_live()?;
            s.target_rev = Some(rev);
            Ok(())
        })
    }

    /// Checks `open_root`.
    pub fn open_root(&mut self, base_rev: Option<u64>) -> Result<(), SvnError> {
        self.checked(|s| {
            s.check_live()?;
            if s.phase != Phase::Ready {
                return Err(violation("open_root called twice"));
            }
            s.stack
                .push(Frame::new(FrameKind::Root, String::new(), base_rev));
            s.phase = Phase::Open;
            Ok(())
        })
    }

    /// Checks `delete_entry`.
    pub fn delete_entry(&mut self, path: &str) -> Result<(), SvnError> {
        self.checked(|s| s.child("delete_entry", path))
    }

    /// Checks `add_dir` and pushes its frame.
    pub fn add_dir(&mut self, path: &str, copy_from: Option<&CopyFrom>) -> Result<(), SvnError> {
        self.checked(|s| {
            s.child("add_dir", path)?;
            s.stack.push(Frame::added(
                FrameKind::Dir,
                path.to_string(),
                copy_from.cloned(),
            ));
            Ok(())
        })
    }

    /// Checks `open_dir` and pushes its frame.
    pub fn open_dir(&mut self, path: &str, base_rev: Option<u64>) -> Result<(), SvnError> {
        self.checked(|s| {
            s.child("open_dir", path)?;
            s.stack
                .push(Frame::new(FrameKind::Dir, path.to_string(), base_rev));
            Ok(())
        })
    }

    /// Checks `change_dir_property`.
    pub fn change_dir_property(&mut self) -> Result<(), SvnError> {
        self.checked(|s| s.top_dir("change_dir_property").map(|_| ()))
    }

    /// Checks `close_dir` and pops the directory frame.
    pub fn close_dir(&mut self) -> Result<Frame, SvnError> {
        let result = (|| -> Result<Frame, SvnError> {
            self.top_dir("close_dir")?;
            let frame = self
                .stack
                .pop()
                .ok_or_else(|| violation("close_dir with no open directory"))?;
            if self.stack.is_empty() {
                self.phase = Phase::RootClosed;
            }
            Ok(frame)
        })();
        self.guard(result)
    }

    /// Checks `absent_dir`/`absent_file`.
    pub fn absent(&mut self, path: &str) -> Result<(), SvnError> {
        self.checked(|s| s.child("absent entry", path))
    }

    /// Checks `add_file` and pushes its frame.
    pub fn add_file(&mut self, path: &str, copy_from: Option<&CopyFrom>) -> Result<(), SvnError> {
        self.checked(|s| {
            s.child("add_file", path)?;
            s.stack.push(Frame::added(
                FrameKind::File,
                path.to_string(),
                copy_from.cloned(),
            ));
            Ok(())
        })
    }

    /// Checks `open_file` and pushes its frame.
    pub fn open_file(&mut self, path: &str, base_rev: Option<u64>) -> Result<(), SvnError> {
        self.checked(|s| {
            s.child("open_file", path)?;
            s.stack
                .push(Frame::new(FrameKind::File, path.to_string(), base_rev));
            Ok(())
        })
    }

    /// Checks `apply_text_delta`.
    pub fn apply_text_delta(&mut self) -> Result<(), SvnError> {
        self.checked(|s| {
            let file = s.top_file("apply_text_delta")?;
            if file.delta != DeltaPhase::NotStarted {
                return Err(violation(format!(
                    "second apply_text_delta for '{}'",
                    file.path
                )));
            }
            file.delta = DeltaPhase::Streaming;
            Ok(())
        })
    }

    /// Checks `text_delta_chunk`.
    pub fn text_delta_chunk(&mut self) -> Result<(), SvnError> {
        self.checked(|s| {
            let file = s.top_file("text_delta_chunk")?;
            if file.delta != DeltaPhase::Streaming {
                return Err(violation(format!(
                    "delta window for '{}' outside apply_text_delta",
                    file.path
                )));
            }
            Ok(())
        })
    }

    /// Checks `text_delta_end`.
    pub fn text_delta_end(&mut self) -> Result<(), SvnError> {
        self.checked(|s| {
            let file = s.top_file("text_delta_end")?;
            if file.delta != DeltaPhase::Streaming {
                return Err(violation(format!(
                    "text_delta_end for '{}' outside apply_text_delta",
                    file.path
                )));
            }
            file.delta = DeltaPhase::Ended;
            Ok(())
        })
    }

    /// Checks `change_file_property`.
    pub fn change_file_property(&mut self) -> Result<(), SvnError> {
        self.checked(|s| {
            let file = s.top_file("change_file_property")?;
            if file.delta == DeltaPhase::Streaming {
                return Err(violation(format!(
                    "property change for '{}' while windows are streaming",
                    file.path
                )));
            }
            Ok(())
        })
    }

    /// Checks `close_file` and pops the file frame.
    pub fn close_file(&mut self) -> Result<Frame, SvnError> {
        let result = (|| -> Result<Frame, SvnError> {
            let file = self.top_file("close_file")?;
            match file.delta {
                DeltaPhase::Streaming => {
                    return Err(violation(format!(
                        "close_file for '{}' before text_delta_end",
                        file.path
                    )));
                }
                DeltaPhase::NotStarted if file.added && file.copy_from.is_none() => {
                    return Err(violation(format!(
                        "added file '{}' closed without content",
                        file.path
                    )));
                }
                _ => {}
            }
            self.stack
                .pop()
                .ok_or_else(|| violation("close_file with no open file"))
        })();
        self.guard(result)
    }

    /// Checks `close_edit`.
    pub fn close_edit(&mut self) -> Result<(), SvnError> {
        self.checked(|s| {
            s.check_live()?;
            match s.phase {
                Phase::RootClosed => {
                    s.phase = Phase::Closed;
                    Ok(())
                }
                Phase::Ready => Err(violation("close_edit before open_root")),
                _ => Err(violation(format!(
                    "close_edit with {} open node(s)",
                    s.stack.len()
                ))),
            }
        })
    }

    /// Accepts `abort_edit` in every phase.
    ///
    /// Returns `false` when the drive had already been closed or aborted, in
    /// which case there is nothing left to release.
    pub fn abort(&mut self) -> bool {
        if self.is_finished() {
            return false;
        }
        self.stack.clear();
        self.phase = Phase::Aborted;
        true
    }
}

/// One recorded [`TreeEditor`] call.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EditorEvent {
    /// `target_revision`.
    TargetRevision {
        /// Target revision.
        rev: u64,
    },
    /// `open_root`.
    OpenRoot {
        /// Base revision.
        base_rev: Option<u64>,
    },
    /// `delete_entry`.
    DeleteEntry {
        /// Child path.
        path: String,
        /// Last known revision of the child.
        rev: Option<u64>,
    },
    /// `add_dir`.
    AddDir {
        /// Directory path.
        path: String,
        /// Copy source.
        copy_from: Option<CopyFrom>,
    },
    /// `open_dir`.
    OpenDir {
        /// Directory path.
        path: String,
        /// Base revision.
        base_rev: Option<u64>,
    },
    /// `change_dir_property`.
    ChangeDirProp {
        /// Property name.
        name: PropName,
        /// New value, or `None` to delete.
        value: Option<Vec<u8>>,
    },
    /// `close_dir`.
    CloseDir,
    /// `absent_dir`.
    AbsentDir {
        /// Directory path.
        path: String,
    },
    /// `add_file`.
    AddFile {
        /// File path.
        path: String,
        /// Copy source.
        copy_from: Option<CopyFrom>,
    },
    /// `open_file`.
    OpenFile {
        /// File path.
        path: String,
        /// Base revision.
        base_rev: Option<u64>,
    },
    /// `apply_text_delta`.
    ApplyTextDelta {
        /// Checksum of the base content.
        base_checksum: Option<String>,
    },
    /// `text_delta_chunk`.
    TextDeltaChunk {
        /// The window.
        window: DiffWindow,
    },
    /// `text_delta_end`.
    TextDeltaEnd,
    /// `change_file_property`.
    ChangeFileProp {
        /// Property name.
        name: PropName,
        /// New value, or `None` to delete.
        value: Option<Vec<u8>>,
    },
    /// `close_file`.
    CloseFile {
        /// Checksum of the resulting content.
        text_checksum: Option<String>,
    },
    /// `absent_file`.
    AbsentFile {
        /// File path.
        path: String,
    },
    /// `close_edit`.
    CloseEdit,
    /// `abort_edit`.
    AbortEdit,
}

/// Replays one event against `editor`.
///
/// Returns the commit result for [`EditorEvent::CloseEdit`] and `None`
/// otherwise.
pub async fn dispatch(
    editor: &mut dyn TreeEditor,
    event: EditorEvent,
) -> Result<Option<CommitInfo>, SvnError> {
    match event {
        EditorEvent::TargetRevision { rev } => editor.target_revision(rev).await?,
        EditorEvent::OpenRoot { base_rev } => editor.open_root(base_rev).await?,
        EditorEvent::DeleteEntry { path, rev } => editor.delete_entry(path, rev).await?,
        EditorEvent::AddDir { path, copy_from } => editor.add_dir(path, copy_from).await?,
        EditorEvent::OpenDir { path, base_rev } => editor.open_dir(path, base_rev).await?,
        EditorEvent::ChangeDirProp { name, value } => {
            editor.change_dir_property(name, value).await?
        }
        EditorEvent::CloseDir => editor.close_dir().await?,
        EditorEvent::AbsentDir { path } => editor.absent_dir(path).await?,
        EditorEvent::AddFile { path, copy_from } => editor.add_file(path, copy_from).await?,
        EditorEvent::OpenFile { path, base_rev } => editor.open_file(path, base_rev).await?,
        EditorEvent::ApplyTextDelta { base_checksum } => {
            editor.apply_text_delta(base_checksum).await?
        }
        EditorEvent::TextDeltaChunk { window } => editor.text_delta_chunk(window).await?,
        EditorEvent::TextDeltaEnd => editor.text_delta_end().await?,
        EditorEvent::ChangeFileProp { name, value } => {
            editor.change_file_property(name, value).await?
        }
        EditorEvent::CloseFile { text_checksum } => editor.close_file(text_checksum).await?,
        EditorEvent::AbsentFile { path } => editor.absent_file(path).await?,
        EditorEvent::CloseEdit => return editor.close_edit().await,
        EditorEvent::AbortEdit => editor.abort_edit().await?,
    }
    Ok(None)
}

/// An editor that validates and records every call.
///
/// Useful for status drives and for checking what a transport sent.
#[derive(Debug, Default)]
pub struct RecordingEditor {
    state: EditorState,
    events: Vec<EditorEvent>,
}

impl RecordingEditor {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Events accepted so far.
    pub fn events(&self) -> &[EditorEvent] {
        &self.events
    }

    /// Consumes the recorder and returns its events.
    pub fn into_events(self) -> Vec<EditorEvent> {
        self.events
    }

    fn record(
        &mut self,
        check: impl FnOnce(&mut EditorState) -> Result<(), SvnError>,
        event: EditorEvent,
    ) -> EditFuture<'_> {
        let result = check(&mut self.state);
        if result.is_ok() {
            self.events.push(event);
        }
        ready(result)
    }
}

impl TreeEditor for RecordingEditor {
    fn target_revision(&mut self, rev: u64) -> EditFuture<'_> {
        self.record(
            |s| s.target_revision(rev),
            EditorEvent::TargetRevision { rev },
        )
    }

    fn open_root(&mut self, base_rev: Option<u64>) -> EditFuture<'_> {
        self.record(|s| s.open_root(base_rev), EditorEvent::OpenRoot { base_rev })
    }

    fn delete_entry(&mut self, path: String, rev: Option<u64>) -> EditFuture<'_> {
        self.record(
            |s| s.delete_entry(&path),
            EditorEvent::DeleteEntry {
                path: path.clone(),
                rev,
            },
        )
    }

    fn add_dir(&mut self, path: String, copy_from: Option<CopyFrom>) -> EditFuture<'_> {
        self.record(
            |s| s.add_dir(&path, copy_from.as_ref()),
            EditorEvent::AddDir {
                path: path.clone(),
                copy_from: copy_from.clone(),
            },
        )
    }

    fn open_dir(&mut self, path: String, base_rev: Option<u64>) -> EditFuture<'_> {
        self.record(
            |s| s.open_dir(&path, base_rev),
            EditorEvent::OpenDir {
                path: path.clone(),
                base_rev,
            },
        )
    }

    fn change_dir_property(
        &mut self,
        name: PropName,
        value: Option<Vec<u8>>,
    ) -> EditFuture<'_> {
        self.record(
            EditorState::change_dir_property,
            EditorEvent::ChangeDirProp { name, value },
        )
    }

    fn close_dir(&mut self) -> EditFuture<'_> {
        self.record(|s| s.close_dir().map(|_| ()), EditorEvent::CloseDir)
    }

    fn absent_dir(&mut self, path: String) -> EditFuture<'_> {
        self.record(
            |s| s.absent(&path),
            EditorEvent::AbsentDir { path: path.clone() },
        )
    }

    fn add_file(&mut self, path: String, copy_from: Option<CopyFrom>) -> EditFuture<'_> {
        self.record(
            |s| s.add_file(&path, copy_from.as_ref()),
            EditorEvent::AddFile {
                path: path.clone(),
                copy_from: copy_from.clone(),
            },
        )
    }

    fn open_file(&mut self, path: String, base_rev: Option<u64>) -> EditFuture<'_> {
        self.record(
            |s| s.open_file(&path, base_rev),
            EditorEvent::OpenFile {
                path: path.clone(),
                base_rev,
            },
        )
    }

    fn apply_text_delta(&mut self, base_checksum: Option<String>) -> EditFuture<'_> {
        self.record(
            EditorState::apply_text_delta,
            EditorEvent::ApplyTextDelta { base_checksum },
        )
    }

    fn text_delta_chunk(&mut self, window: DiffWindow) -> EditFuture<'_> {
        let checked = window.validate().map_err(SvnError::from);
        self.record(
            |s| {
                s.text_delta_chunk()?;
                s.guard(checked)
            },
            EditorEvent::TextDeltaChunk { window },
        )
    }

    fn text_delta_end(&mut self) -> EditFuture<'_> {
        self.record(EditorState::text_delta_end, EditorEvent::TextDeltaEnd)
    }

    fn change_file_property(
        &mut self,
        name: PropName,
        value: Option<Vec<u8>>,
    ) -> EditFuture<'_> {
        self.record(
            EditorState::change_file_property,
            EditorEvent::ChangeFileProp { name, value },
        )
    }

    fn close_file(&mut self, text_checksum: Option<String>) -> EditFuture<'_> {
        self.record(
            |s| s.close_file().map(|_| ()),
            EditorEvent::CloseFile { text_checksum },
        )
    }

    fn absent_file(&mut self, path: String) -> EditFuture<'_> {
        self.record(
            |s| s.absent(&path),
            EditorEvent::AbsentFile { path: path.clone() },
        )
    }

    fn close_edit(&mut self) -> EditFuture<'_, Option<CommitInfo>> {
        let result = self.state.close_edit();
        if result.is_ok() {
            self.events.push(EditorEvent::CloseEdit);
        }
        ready(result.map(|()| None))
    }

    fn abort_edit(&mut self) -> EditFuture<'_> {
        if self.state.abort() {
            self.events.push(EditorEvent::AbortEdit);
        }
        ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn run_async<T>(f: impl Future<Output = T>) -> T {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(f)
    }

    fn add_file_drive() -> Vec<EditorEvent> {
        vec![
            EditorEvent::TargetRevision { rev: 1 },
            EditorEvent::OpenRoot { base_rev: None },
            EditorEvent::AddDir {
                path: "test".into(),
                copy_from: None,
            },
            EditorEvent::ChangeDirProp {
                name: "svn:ignore".into(),
                value: Some(b"*.o".to_vec()),
            },
            EditorEvent::AddFile {
                path: "test/a.txt".into(),
                copy_from: None,
            },
            EditorEvent::ChangeFileProp {
                name: "svn:eol-style".into(),
                value: Some(b"native".to_vec()),
            },
            EditorEvent::ApplyTextDelta {
                base_checksum: None,
            },
            EditorEvent::TextDeltaChunk {
                window: DiffWindow::replacement(b"hello"),
            },
            EditorEvent::TextDeltaEnd,
            EditorEvent::CloseFile {
                text_checksum: Some(crate::md5_hex(b"hello")),
            },
            EditorEvent::CloseDir,
            EditorEvent::DeleteEntry {
                path: "old".into(),
                rev: Some(3),
            },
            EditorEvent::AddDir {
                path: "branch".into(),
                copy_from: Some(CopyFrom::new("trunk", 5)),
            },
            EditorEvent::CloseDir,
            EditorEvent::CloseDir,
            EditorEvent::CloseEdit,
        ]
    }

    async fn replay(editor: &mut RecordingEditor, events: &[EditorEvent]) -> Result<(), SvnError> {
        for event in events {
            dispatch(editor, event.clone()).await?;
        }
        Ok(())
    }

    #[test]
    fn valid_drive_is_recorded_in_order() {
        run_async(async {
            let mut editor = RecordingEditor::new();
            let events = add_file_drive();
            replay(&mut editor, &events).await.unwrap();
            assert_eq!(editor.events(), events.as_slice());
        });
    }

    #[test]
    fn close_file_without_open_file_is_rejected() {
        run_async(async {
            let mut editor = RecordingEditor::new();
            editor.open_root(Some(1)).await.unwrap();
            let err = editor.close_file(None).await.unwrap_err();
            assert!(matches!(err, SvnError::ProtocolViolation(_)));
            assert_eq!(editor.events().len(), 1);
        });
    }

    #[test]
    fn second_open_root_is_rejected() {
        run_async(async {
            let mut editor = RecordingEditor::new();
            editor.open_root(None).await.unwrap();
            assert!(matches!(
                editor.open_root(None).await.unwrap_err(),
                SvnError::ProtocolViolation(_)
            ));
        });
    }

    #[test]
    fn sibling_before_previous_close_is_rejected() {
        run_async(async {
            let mut editor = RecordingEditor::new();
            editor.open_root(None).await.unwrap();
            editor.open_file("a".into(), Some(1)).await.unwrap();
            let err = editor.open_file("b".into(), Some(1)).await.unwrap_err();
            assert!(matches!(err, SvnError::ProtocolViolation(_)));
        });
    }

    #[test]
    fn grandchild_paths_are_rejected() {
        let mut state = EditorState::new();
        state.open_root(None).unwrap();
        assert!(matches!(
            state.add_dir("a/b", None).unwrap_err(),
            SvnError::ProtocolViolation(_)
        ));

        let mut state = EditorState::new();
        state.open_root(None).unwrap();
        assert!(matches!(
            state.add_dir("a//b", None).unwrap_err(),
            SvnError::InvalidPath(_)
        ));
    }

    #[test]
    fn calls_after_close_edit_are_rejected_but_abort_is_harmless() {
        run_async(async {
            let mut editor = RecordingEditor::new();
            editor.open_root(None).await.unwrap();
            editor.close_dir().await.unwrap();
            editor.close_edit().await.unwrap();
            assert!(editor.target_revision(2).await.is_err());
            assert!(editor.close_edit().await.is_err());
            editor.abort_edit().await.unwrap();
            assert_eq!(
                editor.events(),
                &[
                    EditorEvent::OpenRoot { base_rev: None },
                    EditorEvent::CloseDir,
                    EditorEvent::CloseEdit
                ]
            );
        });
    }

    #[test]
    fn close_edit_requires_closed_root() {
        let mut state = EditorState::new();
        assert!(state.close_edit().is_err());

        let mut state = EditorState::new();
        state.open_root(None).unwrap();
        assert!(state.close_edit().is_err());
        assert!(state.is_failed());
    }

    #[test]
    fn added_file_needs_content_unless_copied() {
        let mut state = EditorState::new();
        state.open_root(None).unwrap();
        state.add_file("new.txt", None).unwrap();
        assert!(matches!(
            state.close_file().unwrap_err(),
            SvnError::ProtocolViolation(_)
        ));

        let mut state = EditorState::new();
        state.open_root(None).unwrap();
        state
            .add_file("copy.txt", Some(&CopyFrom::new("orig.txt", 2)))
            .unwrap();
        let frame = state.close_file().unwrap();
        assert!(frame.added);
        assert!(!frame.has_text_delta());

        let mut state = EditorState::new();
        state.open_root(None).unwrap();
        state.open_file("old.txt", Some(2)).unwrap();
        state.change_file_property().unwrap();
        state.close_file().unwrap();
    }

    #[test]
    fn delta_phase_is_enforced() {
        let mut state = EditorState::new();
        state.open_root(None).unwrap();
        state.open_file("f", Some(1)).unwrap();
        assert!(state.text_delta_chunk().is_err());

        let mut state = EditorState::new();
        state.open_root(None).unwrap();
        state.open_file("f", Some(1)).unwrap();
        state.apply_text_delta().unwrap();
        assert!(state.change_file_property().is_err());

        let mut state = EditorState::new();
        state.open_root(None).unwrap();
        state.open_file("f", Some(1)).unwrap();
        state.apply_text_delta().unwrap();
        assert!(state.close_file().is_err());

        let mut state = EditorState::new();
        state.open_root(None).unwrap();
        state.open_file("f", Some(1)).unwrap();
        state.apply_text_delta().unwrap();
        state.text_delta_end().unwrap();
        assert!(state.apply_text_delta().is_err());
    }

    #[test]
    fn failure_leaves_only_abort() {
        run_async(async {
            let mut editor = RecordingEditor::new();
            editor.open_root(None).await.unwrap();
            editor.add_file("f".into(), None).await.unwrap();
            assert!(editor.close_dir().await.is_err());
            assert!(editor.apply_text_delta(None).await.is_err());
            editor.abort_edit().await.unwrap();
            editor.abort_edit().await.unwrap();
            assert_eq!(editor.events().last(), Some(&EditorEvent::AbortEdit));
            assert_eq!(
                editor
                    .events()
                    .iter()
                    .filter(|e| **e == EditorEvent::AbortEdit)
                    .count(),
                1
            );
        });
    }

    #[test]
    fn malformed_window_is_rejected_before_recording() {
        run_async(async {
            let mut editor = RecordingEditor::new();
            editor.open_root(None).await.unwrap();
            editor.open_file("f".into(), Some(1)).await.unwrap();
            editor.apply_text_delta(None).await.unwrap();
            let mut window = DiffWindow::replacement(b"abc");
            window.target_view_length = 4;
            let err = editor.text_delta_chunk(window).await.unwrap_err();
            assert!(matches!(err, SvnError::MalformedDelta(_)));
            assert_eq!(editor.events().len(), 3);
        });
    }
}
