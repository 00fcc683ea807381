use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use tracing::{debug, warn};

use crate::editor::{EditFuture, EditorState, TreeEditor, ready};
use crate::path::is_ancestor;
use crate::textdelta::{AppliedDelta, DeltaApplier, RandomAccess, md5_hex};
use crate::{
    CommitInfo, CopyFrom, DiffWindow, NodeKind, PropKind, PropName, PropertyList, SvnError,
    WorkspaceMediator,
};

fn checksum_mismatch(path: &str, expected: &str, actual: &str) -> SvnError {
    SvnError::ChecksumMismatch {
        path: path.to_string(),
        expected: expected.to_string(),
        actual: actual.to_string(),
    }
}

fn verify(path: &str, expected: Option<&str>, actual: &str) -> Result<(), SvnError> {
    match expected {
        Some(expected) if !expected.eq_ignore_ascii_case(actual) => {
            Err(checksum_mismatch(path, expected, actual))
        }
        _ => Ok(()),
    }
}

fn set_prop(props: &mut PropertyList, name: &PropName, value: Option<Vec<u8>>) {
    match value {
        Some(value) => {
            props.insert(name.as_str().to_string(), value);
        }
        None => {
            props.remove(name.as_str());
        }
    }
}

/// A node materialized by [`MemoryExport`].
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportedNode {
    /// File or directory.
    pub kind: NodeKind,
    /// Versioned properties.
    pub props: PropertyList,
    /// `svn:entry:*` metadata sent with the node.
    pub entry_props: PropertyList,
    /// File content; empty for directories.
    pub contents: Vec<u8>,
}

impl ExportedNode {
    fn dir() -> Self {
        Self {
            kind: NodeKind::Dir,
            props: PropertyList::new(),
            entry_props: PropertyList::new(),
            contents: Vec::new(),
        }
    }

    fn file() -> Self {
        Self {
            kind: NodeKind::File,
            ..Self::dir()
        }
    }
}

/// File changes held back until `close_file` verifies them.
#[derive(Debug)]
struct PendingFile {
    node: ExportedNode,
    applier: Option<DeltaApplier<Vec<u8>, Vec<u8>>>,
    result: Option<(Vec<u8>, AppliedDelta)>,
}

/// An editor that materializes an edit drive into an in-memory tree.
///
/// Use it to receive a checkout, then seed a second export with
/// [`MemoryExport::into_nodes`]/[`MemoryExport::with_nodes`] to apply an
/// update on top. A drive that fails or is aborted leaves the tree as it
/// was before `open_root`.
#[derive(Default)]
pub struct MemoryExport {
    state: EditorState,
    nodes: BTreeMap<String, ExportedNode>,
    absent: BTreeSet<String>,
    pending: Option<PendingFile>,
    /// Tree as it was at `open_root`, restored when the drive fails.
    snapshot: Option<(BTreeMap<String, ExportedNode>, BTreeSet<String>)>,
    mediator: Option<Box<dyn WorkspaceMediator>>,
}

impl std::fmt::Debug for MemoryExport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryExport")
            .field("state", &self.state)
            .field("nodes", &self.nodes)
            .field("absent", &self.absent)
            .finish_non_exhaustive()
    }
}

impl MemoryExport {
    /// Creates an export holding only an empty root directory.
    pub fn new() -> Self {
        Self::with_nodes(BTreeMap::new())
    }

    /// Creates an export starting from a previously exported tree.
    pub fn with_nodes(mut nodes: BTreeMap<String, ExportedNode>) -> Self {
        nodes.entry(String::new()).or_insert_with(ExportedNode::dir);
        Self {
            nodes,
            ..Self::default()
        }
    }

    /// Sends `svn:wc:*` properties to `mediator`.
    #[must_use]
    pub fn with_mediator(mut self, mediator: Box<dyn WorkspaceMediator>) -> Self {
        self.mediator = Some(mediator);
        self
    }

    /// Revision announced by the drive, if any.
    pub fn target_rev(&self) -> Option<u64> {
        self.state.target_rev()
    }

    /// The node at `path`.
    pub fn node(&self, path: &str) -> Option<&ExportedNode> {
        self.nodes.get(path)
    }

    /// Content of the file at `path`.
    pub fn file(&self, path: &str) -> Option<&[u8]> {
        self.nodes
            .get(path)
            .filter(|node| node.kind == NodeKind::File)
            .map(|node| node.contents.as_slice())
    }

    /// All files with their content, in path order.
    pub fn files(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.kind == NodeKind::File)
            .map(|(path, node)| (path.as_str(), node.contents.as_slice()))
    }

    /// All directory paths, in path order. The root is `""`.
    pub fn dirs(&self) -> impl Iterator<Item = &str> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.kind == NodeKind::Dir)
            .map(|(path, _)| path.as_str())
    }

    /// Paths reported as absent.
    pub fn absent(&self) -> &BTreeSet<String> {
        &self.absent
    }

    /// Consumes the export and returns its tree.
    pub fn into_nodes(self) -> BTreeMap<String, ExportedNode> {
        self.nodes
    }

    fn top_path(&self) -> String {
        self.state
            .top()
            .map(|frame| frame.path.clone())
            .unwrap_or_default()
    }

    fn workspace_prop(
        &mut self,
        path: &str,
        name: &PropName,
        value: Option<Vec<u8>>,
    ) -> Result<(), SvnError> {
        match self.mediator.as_mut() {
            Some(mediator) => mediator.set_workspace_property(path, name, value),
            None => Ok(()),
        }
    }

    fn rollback(&mut self) {
        if let Some((nodes, absent)) = self.snapshot.take() {
            self.nodes = nodes;
            self.absent = absent;
        }
    }

    /// Deleted entries are gone from `nodes`, so a replace still passes.
    fn ensure_vacant(&self, path: &str) -> Result<(), SvnError> {
        match self.nodes.get(path) {
            Some(existing) => Err(SvnError::conflict(
                path,
                format!("already exists as a {}", existing.kind),
            )),
            None => Ok(()),
        }
    }

    fn do_open_root(&mut self, base_rev: Option<u64>) -> Result<(), SvnError> {
        self.state.open_root(base_rev)?;
        self.snapshot = Some((self.nodes.clone(), self.absent.clone()));
        Ok(())
    }

    fn existing(&self, path: &str, kind: NodeKind) -> Result<&ExportedNode, SvnError> {
        match self.nodes.get(path) {
            Some(node) if node.kind == kind => Ok(node),
            Some(node) => Err(SvnError::conflict(
                path,
                format!("expected a {kind}, found a {}", node.kind),
            )),
            None => Err(SvnError::conflict(path, "not present in the export")),
        }
    }

    fn do_delete_entry(&mut self, path: String) -> Result<(), SvnError> {
        self.state.delete_entry(&path)?;
        self.nodes.retain(|p, _| !is_ancestor(&path, p));
        Ok(())
    }

    fn do_add_dir(&mut self, path: String, copy_from: Option<CopyFrom>) -> Result<(), SvnError> {
        self.ensure_vacant(&path)?;
        self.state.add_dir(&path, copy_from.as_ref())?;
        self.absent.remove(&path);
        self.nodes.insert(path, ExportedNode::dir());
        Ok(())
    }

    fn do_open_dir(&mut self, path: String, base_rev: Option<u64>) -> Result<(), SvnError> {
        self.existing(&path, NodeKind::Dir)?;
        self.state.open_dir(&path, base_rev)
    }

    fn do_change_dir_property(
        &mut self,
        name: PropName,
        value: Option<Vec<u8>>,
    ) -> Result<(), SvnError> {
        self.state.change_dir_property()?;
        let path = self.top_path();
        if name.kind() == PropKind::Workspace {
            return self.workspace_prop(&path, &name, value);
        }
        let node = self
            .nodes
            .get_mut(&path)
            .ok_or_else(|| SvnError::conflict(&path, "directory vanished"))?;
        match name.kind() {
            PropKind::Entry => set_prop(&mut node.entry_props, &name, value),
            _ => set_prop(&mut node.props, &name, value),
        }
        Ok(())
    }

    fn do_add_file(&mut self, path: String, copy_from: Option<CopyFrom>) -> Result<(), SvnError> {
        self.ensure_vacant(&path)?;
        self.state.add_file(&path, copy_from.as_ref())?;
        self.pending = Some(PendingFile {
            node: ExportedNode::file(),
            applier: None,
            result: None,
        });
        Ok(())
    }

    fn do_open_file(&mut self, path: String, base_rev: Option<u64>) -> Result<(), SvnError> {
        let node = self.existing(&path, NodeKind::File)?.clone();
        self.state.open_file(&path, base_rev)?;
        self.pending = Some(PendingFile {
            node,
            applier: None,
            result: None,
        });
        Ok(())
    }

    fn pending(&mut self) -> Result<&mut PendingFile, SvnError> {
        self.pending
            .as_mut()
            .ok_or_else(|| SvnError::ProtocolViolation("no open file".into()))
    }

    fn do_apply_text_delta(&mut self, base_checksum: Option<String>) -> Result<(), SvnError> {
        self.state.apply_text_delta()?;
        let path = self.top_path();
        let pending = self.pending()?;
        let base = pending.node.contents.clone();
        verify(&path, base_checksum.as_deref(), &md5_hex(&base))?;
        pending.applier = Some(DeltaApplier::new(base, Vec::new()));
        Ok(())
    }

    fn do_text_delta_chunk(&mut self, window: DiffWindow) -> Result<(), SvnError> {
        self.state.text_delta_chunk()?;
        self.pending()?
            .applier
            .as_mut()
            .ok_or_else(|| SvnError::ProtocolViolation("delta window without applier".into()))?
            .apply(&window)
    }

    fn do_text_delta_end(&mut self) -> Result<(), SvnError> {
        self.state.text_delta_end()?;
        let pending = self.pending()?;
        let applier = pending
            .applier
            .take()
            .ok_or_else(|| SvnError::ProtocolViolation("text_delta_end without applier".into()))?;
        pending.result = Some(applier.finish()?);
        Ok(())
    }

    fn do_change_file_property(
        &mut self,
        name: PropName,
        value: Option<Vec<u8>>,
    ) -> Result<(), SvnError> {
        self.state.change_file_property()?;
        if name.kind() == PropKind::Workspace {
            let path = self.top_path();
            return self.workspace_prop(&path, &name, value);
        }
        let pending = self.pending()?;
        match name.kind() {
            PropKind::Entry => set_prop(&mut pending.node.entry_props, &name, value),
            _ => set_prop(&mut pending.node.props, &name, value),
        }
        Ok(())
    }

    fn do_close_file(&mut self, text_checksum: Option<String>) -> Result<(), SvnError> {
        let frame = self.state.close_file()?;
        let mut pending = self
            .pending
            .take()
            .ok_or_else(|| SvnError::ProtocolViolation("no open file".into()))?;
        match pending.result.take() {
            Some((contents, applied)) => {
                verify(&frame.path, text_checksum.as_deref(), &applied.md5)?;
                pending.node.contents = contents;
            }
            None => verify(
                &frame.path,
                text_checksum.as_deref(),
                &md5_hex(&pending.node.contents),
            )?,
        }
        debug!(path = %frame.path, len = pending.node.contents.len(), "exported file");
        self.absent.remove(&frame.path);
        self.nodes.insert(frame.path, pending.node);
        Ok(())
    }

    fn do_absent(&mut self, path: String) -> Result<(), SvnError> {
        self.state.absent(&path)?;
        self.absent.insert(path);
        Ok(())
    }

    fn run(&mut self, result: Result<(), SvnError>) -> EditFuture<'_> {
        let result = self.state.guard(result);
        if result.is_err() {
            self.pending = None;
            self.rollback();
        }
        ready(result)
    }
}

impl TreeEditor for MemoryExport {
    fn target_revision(&mut self, rev: u64) -> EditFuture<'_> {
        let r = self.state.target_revision(rev);
        self.run(r)
    }

    fn open_root(&mut self, base_rev: Option<u64>) -> EditFuture<'_> {
        let r = self.do_open_root(base_rev);
        self.run(r)
    }

    fn delete_entry(&mut self, path: String, _rev: Option<u64>) -> EditFuture<'_> {
        let r = self.do_delete_entry(path);
        self.run(r)
    }

    fn add_dir(&mut self, path: String, copy_from: Option<CopyFrom>) -> EditFuture<'_> {
        let r = self.do_add_dir(path, copy_from);
        self.run(r)
    }

    fn open_dir(&mut self, path: String, base_rev: Option<u64>) -> EditFuture<'_> {
        let r = self.do_open_dir(path, base_rev);
        self.run(r)
    }

    fn change_dir_property(
        &mut self,
        name: PropName,
        value: Option<Vec<u8>>,
    ) -> EditFuture<'_> {
        let r = self.do_change_dir_property(name, value);
        self.run(r)
    }

    fn close_dir(&mut self) -> EditFuture<'_> {
        let r = self.state.close_dir().map(|_| ());
        self.run(r)
    }

    fn absent_dir(&mut self, path: String) -> EditFuture<'_> {
        let r = self.do_absent(path);
        self.run(r)
    }

    fn add_file(&mut self, path: String, copy_from: Option<CopyFrom>) -> EditFuture<'_> {
        let r = self.do_add_file(path, copy_from);
        self.run(r)
    }

    fn open_file(&mut self, path: String, base_rev: Option<u64>) -> EditFuture<'_> {
        let r = self.do_open_file(path, base_rev);
        self.run(r)
    }

    fn apply_text_delta(&mut self, base_checksum: Option<String>) -> EditFuture<'_> {
        let r = self.do_apply_text_delta(base_checksum);
        self.run(r)
    }

    fn text_delta_chunk(&mut self, window: DiffWindow) -> EditFuture<'_> {
        let r = self.do_text_delta_chunk(window);
        self.run(r)
    }

    fn text_delta_end(&mut self) -> EditFuture<'_> {
        let r = self.do_text_delta_end();
        self.run(r)
    }

    fn change_file_property(
        &mut self,
        name: PropName,
        value: Option<Vec<u8>>,
    ) -> EditFuture<'_> {
        let r = self.do_change_file_property(name, value);
        self.run(r)
    }

    fn close_file(&mut self, text_checksum: Option<String>) -> EditFuture<'_> {
        let r = self.do_close_file(text_checksum);
        self.run(r)
    }

    fn absent_file(&mut self, path: String) -> EditFuture<'_> {
        let r = self.do_absent(path);
        self.run(r)
    }

    fn close_edit(&mut self) -> EditFuture<'_, Option<CommitInfo>> {
        let r = self.state.close_edit();
        match &r {
            Ok(()) => self.snapshot = None,
            Err(_) => self.rollback(),
        }
        ready(r.map(|()| None))
    }

    fn abort_edit(&mut self) -> EditFuture<'_> {
        self.state.abort();
        self.pending = None;
        self.rollback();
        ready(Ok(()))
    }
}

/// Base content of a file being rewritten by [`FsExport`].
#[derive(Debug)]
enum BaseFile {
    Missing,
    Present(File),
}

impl RandomAccess for BaseFile {
    fn size(&mut self) -> io::Result<u64> {
        match self {
            Self::Missing => Ok(0),
            Self::Present(file) => file.size(),
        }
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        match self {
            Self::Missing if buf.is_empty() => Ok(()),
            Self::Missing => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "file has no base content",
            )),
            Self::Present(file) => file.read_at(offset, buf),
        }
    }
}

#[derive(Debug)]
struct PendingFsFile {
    dest: PathBuf,
    tmp: Option<PathBuf>,
    applier: Option<DeltaApplier<BaseFile, File>>,
    md5: Option<String>,
    #[cfg(unix)]
    executable: Option<bool>,
}

/// A filesystem change made during a drive, undone in reverse order.
#[derive(Debug)]
enum Undo {
    Created(PathBuf),
    MovedAside {
        dest: PathBuf,
        backup: PathBuf,
    },
    #[cfg(unix)]
    Mode {
        path: PathBuf,
        mode: u32,
    },
}

/// An editor that materializes an edit drive into a directory.
///
/// `FsExport` writes plain files and directories; it does **not** create a
/// working copy. File content is assembled in a temporary sibling and
/// renamed into place once `close_file` has verified its checksum.
///
/// Deleted and replaced nodes are moved aside until `close_edit`. A drive
/// that fails, is aborted, or is dropped unfinished puts them back and
/// removes everything it created.
#[derive(Default)]
pub struct FsExport {
    root: PathBuf,
    state: EditorState,
    pending: Option<PendingFsFile>,
    journal: Option<Vec<Undo>>,
    next_tmp_id: u64,
    mediator: Option<Box<dyn WorkspaceMediator>>,
}

impl std::fmt::Debug for FsExport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsExport")
            .field("root", &self.root)
            .field("state", &self.state)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

impl FsExport {
    /// Creates a filesystem export rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state: EditorState::default(),
            pending: None,
            journal: None,
            next_tmp_id: 0,
            mediator: None,
        }
    }

    /// Sends `svn:wc:*` properties to `mediator`.
    #[must_use]
    pub fn with_mediator(mut self, mediator: Box<dyn WorkspaceMediator>) -> Self {
        self.mediator = Some(mediator);
        self
    }

    /// Returns the export root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn repo_path_to_fs(&self, path: &str) -> Result<PathBuf, SvnError> {
        map_repo_path_to_fs(&self.root, path)
    }

    fn new_tmp_path(&mut self, dest: &Path, suffix: &str) -> PathBuf {
        new_tmp_path(&self.root, dest, &mut self.next_tmp_id, suffix)
    }

    fn record(&mut self, undo: Undo) {
        if let Some(journal) = self.journal.as_mut() {
            journal.push(undo);
        }
    }

    fn move_aside(&mut self, dest: &Path) -> Result<(), SvnError> {
        let backup = self.new_tmp_path(dest, "bak");
        std::fs::rename(dest, &backup)?;
        self.record(Undo::MovedAside {
            dest: dest.to_path_buf(),
            backup,
        });
        Ok(())
    }

    /// Removes the backups of a drive that closed cleanly.
    fn commit_journal(&mut self) {
        for undo in self.journal.take().unwrap_or_default() {
            if let Undo::MovedAside { backup, .. } = undo
                && let Err(err) = remove_path(&backup)
            {
                warn!(path = %backup.display(), error = %err, "failed to remove export backup");
            }
        }
    }

    fn rollback(&mut self) {
        self.discard_pending();
        let Some(journal) = self.journal.take() else {
            return;
        };
        debug!(changes = journal.len(), "rolling back export");
        for undo in journal.into_iter().rev() {
            let result = match &undo {
                Undo::Created(path) => remove_path(path),
                Undo::MovedAside { dest, backup } => {
                    remove_path(dest).and_then(|()| std::fs::rename(backup, dest))
                }
                #[cfg(unix)]
                Undo::Mode { path, mode } => set_mode(path, *mode),
            };
            if let Err(err) = result {
                warn!(?undo, error = %err, "failed to undo export change");
            }
        }
    }

    fn discard_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            drop(pending.applier);
            if let Some(tmp) = pending.tmp {
                let _ = std::fs::remove_file(tmp);
            }
        }
    }

    fn pending(&mut self) -> Result<&mut PendingFsFile, SvnError> {
        self.pending
            .as_mut()
            .ok_or_else(|| SvnError::ProtocolViolation("no open file".into()))
    }

    fn do_open_root(&mut self, base_rev: Option<u64>) -> Result<(), SvnError> {
        self.state.open_root(base_rev)?;
        let mut journal = Vec::new();
        if std::fs::symlink_metadata(&self.root).is_err() {
            std::fs::create_dir_all(&self.root)?;
            journal.push(Undo::Created(self.root.clone()));
        }
        self.journal = Some(journal);
        Ok(())
    }

    fn do_delete_entry(&mut self, path: String) -> Result<(), SvnError> {
        self.state.delete_entry(&path)?;
        let fs_path = self.repo_path_to_fs(&path)?;
        if std::fs::symlink_metadata(&fs_path).is_ok() {
            self.move_aside(&fs_path)?;
        }
        Ok(())
    }

    fn do_add_dir(&mut self, path: String, copy_from: Option<CopyFrom>) -> Result<(), SvnError> {
        let dir = self.repo_path_to_fs(&path)?;
        if std::fs::symlink_metadata(&dir).is_ok() {
            return Err(SvnError::conflict(&path, "already exists"));
        }
        self.state.add_dir(&path, copy_from.as_ref())?;
        std::fs::create_dir(&dir)?;
        self.record(Undo::Created(dir));
        Ok(())
    }

    fn do_open_dir(&mut self, path: String, base_rev: Option<u64>) -> Result<(), SvnError> {
        let dir = self.repo_path_to_fs(&path)?;
        if !dir.is_dir() {
            return Err(SvnError::conflict(&path, "not present in the export"));
        }
        self.state.open_dir(&path, base_rev)
    }

    fn do_change_prop(
        &mut self,
        file: bool,
        name: PropName,
        value: Option<Vec<u8>>,
    ) -> Result<(), SvnError> {
        if file {
            self.state.change_file_property()?;
        } else {
            self.state.change_dir_property()?;
        }
        if name.kind() == PropKind::Workspace
            && let Some(mediator) = self.mediator.as_mut()
        {
            let path = self
                .state
                .top()
                .map(|frame| frame.path.clone())
                .unwrap_or_default();
            return mediator.set_workspace_property(&path, &name, value);
        }
        #[cfg(unix)]
        if file && name.as_str() == "svn:executable" {
            self.pending()?.executable = Some(value.is_some());
        }
        Ok(())
    }

    fn open_pending(
        &mut self,
        path: &str,
        added: bool,
        copy_from: Option<&CopyFrom>,
        base_rev: Option<u64>,
    ) -> Result<(), SvnError> {
        let dest = self.repo_path_to_fs(path)?;
        if added && std::fs::symlink_metadata(&dest).is_ok() {
            return Err(SvnError::conflict(path, "already exists"));
        }
        if !added && dest.is_dir() {
            return Err(SvnError::conflict(path, "expected a file, found a dir"));
        }
        if !added && !dest.is_file() {
            return Err(SvnError::conflict(path, "not present in the export"));
        }
        if added {
            self.state.add_file(path, copy_from)?;
        } else {
            self.state.open_file(path, base_rev)?;
        }
        self.pending = Some(PendingFsFile {
            dest,
            tmp: None,
            applier: None,
            md5: None,
            #[cfg(unix)]
            executable: None,
        });
        Ok(())
    }

    fn do_apply_text_delta(&mut self, base_checksum: Option<String>) -> Result<(), SvnError> {
        self.state.apply_text_delta()?;
        let path = self
            .state
            .top()
            .map(|frame| frame.path.clone())
            .unwrap_or_default();
        let added = self.state.top().is_some_and(|frame| frame.added);
        let dest = self.pending()?.dest.clone();

        if let Ok(meta) = std::fs::symlink_metadata(&dest)
            && meta.file_type().is_symlink()
        {
            return Err(SvnError::InvalidPath(
                "refusing to apply a delta to a symlink".into(),
            ));
        }

        let base = if added {
            BaseFile::Missing
        } else {
            match File::open(&dest) {
                Ok(file) => BaseFile::Present(file),
                Err(err) if err.kind() == io::ErrorKind::NotFound => BaseFile::Missing,
                Err(err) => return Err(err.into()),
            }
        };
        if let Some(expected) = base_checksum.as_deref() {
            let actual = match &base {
                BaseFile::Missing => md5_hex(&[]),
                BaseFile::Present(_) => file_md5(&dest)?,
            };
            verify(&path, Some(expected), &actual)?;
        }

        let tmp = self.new_tmp_path(&dest, "tmp");
        let out = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp)?;
        let pending = self.pending()?;
        pending.tmp = Some(tmp);
        pending.applier = Some(DeltaApplier::new(base, out));
        Ok(())
    }

    fn do_text_delta_chunk(&mut self, window: DiffWindow) -> Result<(), SvnError> {
        self.state.text_delta_chunk()?;
        self.pending()?
            .applier
            .as_mut()
            .ok_or_else(|| SvnError::ProtocolViolation("delta window without applier".into()))?
            .apply(&window)
    }

    fn do_text_delta_end(&mut self) -> Result<(), SvnError> {
        self.state.text_delta_end()?;
        let pending = self.pending()?;
        let applier = pending
            .applier
            .take()
            .ok_or_else(|| SvnError::ProtocolViolation("text_delta_end without applier".into()))?;
        let (out, applied) = applier.finish()?;
        out.sync_all()?;
        pending.md5 = Some(applied.md5);
        Ok(())
    }

    fn do_close_file(&mut self, text_checksum: Option<String>) -> Result<(), SvnError> {
        let frame = self.state.close_file()?;
        let pending = self
            .pending
            .take()
            .ok_or_else(|| SvnError::ProtocolViolation("no open file".into()))?;
        let result = self.install(&frame.path, &pending, text_checksum.as_deref());
        if result.is_err()
            && let Some(tmp) = &pending.tmp
        {
            let _ = std::fs::remove_file(tmp);
        }
        result
    }

    /// Moves a verified file into place, keeping the journal current.
    fn install(
        &mut self,
        path: &str,
        pending: &PendingFsFile,
        text_checksum: Option<&str>,
    ) -> Result<(), SvnError> {
        let dest = &pending.dest;
        let existed = std::fs::symlink_metadata(dest).is_ok();
        match (&pending.tmp, &pending.md5) {
            (Some(tmp), Some(md5)) => {
                verify(path, text_checksum, md5)?;
                if existed {
                    self.move_aside(dest)?;
                }
                std::fs::rename(tmp, dest)?;
            }
            _ => {
                if !existed {
                    File::create(dest)?;
                }
                if let Some(expected) = text_checksum {
                    verify(path, Some(expected), &file_md5(dest)?)?;
                }
            }
        }
        if !existed {
            self.record(Undo::Created(dest.clone()));
        }
        #[cfg(unix)]
        if let Some(exec) = pending.executable
            && let Some(mode) = apply_executable_bit(dest, exec)?
        {
            self.record(Undo::Mode {
                path: dest.clone(),
                mode,
            });
        }
        Ok(())
    }

    fn run(&mut self, result: Result<(), SvnError>) -> EditFuture<'_> {
        let result = self.state.guard(result);
        if result.is_err() {
            self.rollback();
        }
        ready(result)
    }
}

impl Drop for FsExport {
    fn drop(&mut self) {
        self.rollback();
    }
}

impl TreeEditor for FsExport {
    fn target_revision(&mut self, rev: u64) -> EditFuture<'_> {
        let r = self.state.target_revision(rev);
        self.run(r)
    }

    fn open_root(&mut self, base_rev: Option<u64>) -> EditFuture<'_> {
        let r = self.do_open_root(base_rev);
        self.run(r)
    }

    fn delete_entry(&mut self, path: String, _rev: Option<u64>) -> EditFuture<'_> {
        let r = self.do_delete_entry(path);
        self.run(r)
    }

    fn add_dir(&mut self, path: String, copy_from: Option<CopyFrom>) -> EditFuture<'_> {
        let r = self.do_add_dir(path, copy_from);
        self.run(r)
    }

    fn open_dir(&mut self, path: String, base_rev: Option<u64>) -> EditFuture<'_> {
        let r = self.do_open_dir(path, base_rev);
        self.run(r)
    }

    fn change_dir_property(
        &mut self,
        name: PropName,
        value: Option<Vec<u8>>,
    ) -> EditFuture<'_> {
        let r = self.do_change_prop(false, name, value);
        self.run(r)
    }

    fn close_dir(&mut self) -> EditFuture<'_> {
        let r = self.state.close_dir().map(|_| ());
        self.run(r)
    }

    fn absent_dir(&mut self, path: String) -> EditFuture<'_> {
        let r = self.state.absent(&path);
        self.run(r)
    }

    fn add_file(&mut self, path: String, copy_from: Option<CopyFrom>) -> EditFuture<'_> {
        let r = self.open_pending(&path, true, copy_from.as_ref(), None);
        self.run(r)
    }

    fn open_file(&mut self, path: String, base_rev: Option<u64>) -> EditFuture<'_> {
        let r = self.open_pending(&path, false, None, base_rev);
        self.run(r)
    }

    fn apply_text_delta(&mut self, base_checksum: Option<String>) -> EditFuture<'_> {
        let r = self.do_apply_text_delta(base_checksum);
        self.run(r)
    }

    fn text_delta_chunk(&mut self, window: DiffWindow) -> EditFuture<'_> {
        let r = self.do_text_delta_chunk(window);
        self.run(r)
    }

    fn text_delta_end(&mut self) -> EditFuture<'_> {
        let r = self.do_text_delta_end();
        self.run(r)
    }

    fn change_file_property(
        &mut self,
        name: PropName,
        value: Option<Vec<u8>>,
    ) -> EditFuture<'_> {
        let r = self.do_change_prop(true, name, value);
        self.run(r)
    }

    fn close_file(&mut self, text_checksum: Option<String>) -> EditFuture<'_> {
        let r = self.do_close_file(text_checksum);
        self.run(r)
    }

    fn absent_file(&mut self, path: String) -> EditFuture<'_> {
        let r = self.state.absent(&path);
        self.run(r)
    }

    fn close_edit(&mut self) -> EditFuture<'_, Option<CommitInfo>> {
        let r = self.state.close_edit();
        match &r {
            Ok(()) => self.commit_journal(),
            Err(_) => self.rollback(),
        }
        ready(r.map(|()| None))
    }

    fn abort_edit(&mut self) -> EditFuture<'_> {
        self.state.abort();
        self.rollback();
        ready(Ok(()))
    }
}

fn remove_path(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

fn file_md5(path: &Path) -> Result<String, SvnError> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Returns the previous mode when it changed.
#[cfg(unix)]
fn apply_executable_bit(path: &Path, executable: bool) -> Result<Option<u32>, SvnError> {
    use std::os::unix::fs::PermissionsExt;

    let mode = std::fs::metadata(path)?.permissions().mode();
    let new_mode = if executable {
        mode | ((mode & 0o444) >> 2)
    } else {
        mode & !0o111
    };
    if new_mode == mode {
        return Ok(None);
    }
    set_mode(path, new_mode)?;
    Ok(Some(mode))
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

fn map_repo_path_to_fs(root: &Path, path: &str) -> Result<PathBuf, SvnError> {
    if path.is_empty() {
        return Ok(root.to_path_buf());
    }
    let mut out = root.to_path_buf();
    for part in path.split('/') {
        if part.is_empty() || part == "." || part == ".." {
            return Err(SvnError::InvalidPath(format!("unsafe path: {path}")));
        }
        #[cfg(windows)]
        if part.contains(['\\', ':']) {
            return Err(SvnError::InvalidPath(format!("unsafe path: {path}")));
        }
        out.push(part);
    }
    Ok(out)
}

fn new_tmp_path(root: &Path, dest: &Path, next_tmp_id: &mut u64, suffix: &str) -> PathBuf {
    let parent = dest.parent().unwrap_or(root);
    let mut name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());

    name.retain(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if name.is_empty() {
        name = "file".to_string();
    }

    *next_tmp_id = next_tmp_id.wrapping_add(1);
    parent.join(format!(".svn-ra.{name}.{}.{suffix}", *next_tmp_id))
}
