//! Commit transactions against a [`MemRepository`].
//!
//! The transaction is a private copy of HEAD. Nothing becomes visible until
//! `close_edit` publishes it, so a failed or aborted edit leaves the
//! repository untouched.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use super::locks::LockClaim;
use super::tree::{NodeId, Tree};
use super::{MemRepository, Revision, SVN_AUTHOR, SVN_LOG};
use crate::editor::{EditFuture, EditorState, TreeEditor, ready};
use crate::mediator::StagedDelta;
use crate::path::{basename, dirname, join, validate_rel_dir_path};
use crate::textdelta::{AppliedDelta, DeltaApplier, md5_hex};
use crate::{
    ChangedPath, CommitInfo, CommitOptions, CopyFrom, DiffWindow, NodeKind, PropKind, PropName,
    SvnError, WorkspaceMediator,
};

struct Txn {
    base_rev: u64,
    tree: Tree,
    touched: Vec<NodeId>,
    changes: BTreeMap<String, ChangedPath>,
    revisions: Vec<Arc<Revision>>,
}

struct OpenFile {
    id: NodeId,
    path: String,
    staged: Option<StagedDelta>,
    result: Option<(Vec<u8>, AppliedDelta)>,
}

/// The server side of one commit.
pub(crate) struct MemCommitEditor {
    repo: MemRepository,
    base: String,
    options: CommitOptions,
    author: Option<String>,
    mediator: Box<dyn WorkspaceMediator>,
    state: EditorState,
    txn: Option<Txn>,
    file: Option<OpenFile>,
    deltas: u64,
}

fn record(changes: &mut BTreeMap<String, ChangedPath>, change: ChangedPath) {
    let previous = changes.get(&change.path).map(|c| c.action.clone());
    match (previous.as_deref(), change.action.as_str()) {
        (Some("A" | "R"), "M") => {}
        (Some("A"), "D") => {
            changes.remove(&change.path);
        }
        (Some("D"), "A") => {
            changes.insert(
                change.path.clone(),
                ChangedPath {
                    action: "R".to_string(),
                    ..change
                },
            );
        }
        _ => {
            changes.insert(change.path.clone(), change);
        }
    }
}

impl MemCommitEditor {
    pub(crate) fn new(
        repo: MemRepository,
        base: String,
        options: CommitOptions,
        author: Option<String>,
        mediator: Box<dyn WorkspaceMediator>,
    ) -> Self {
        Self {
            repo,
            base,
            options,
            author,
            mediator,
            state: EditorState::new(),
            txn: None,
            file: None,
            deltas: 0,
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    fn repo_path(&self, path: &str) -> String {
        join(&self.base, path)
    }

    fn txn(&mut self) -> Result<&mut Txn, SvnError> {
        self.txn
            .as_mut()
            .ok_or_else(|| SvnError::ProtocolViolation("no open transaction".into()))
    }

    fn file(&mut self) -> Result<&mut OpenFile, SvnError> {
        self.file
            .as_mut()
            .ok_or_else(|| SvnError::ProtocolViolation("no open file".into()))
    }

    /// Looks up `path` in the transaction and checks its kind.
    fn existing(&mut self, path: &str, kind: NodeKind) -> Result<NodeId, SvnError> {
        let rp = self.repo_path(path);
        let txn = self.txn()?;
        match txn.tree.lookup(&rp) {
            Some(id) if txn.tree.node(id).kind == kind => Ok(id),
            Some(id) => Err(SvnError::conflict(
                path,
                format!("expected a {kind}, found a {}", txn.tree.node(id).kind),
            )),
            None => Err(SvnError::conflict(path, "path not found in transaction")),
        }
    }

    fn check_current(
        tree: &Tree,
        id: NodeId,
        path: &str,
        base_rev: Option<u64>,
    ) -> Result<(), SvnError> {
        let created = tree.node(id).created_rev;
        match base_rev {
            Some(base) if created > base => Err(SvnError::conflict(
                path,
                format!("out of date: changed in r{created}, base is r{base}"),
            )),
            _ => Ok(()),
        }
    }

    /// Resolves a copy source; a leading `/` makes its path repository-absolute.
    fn copy_source(
        &self,
        copy_from: &CopyFrom,
    ) -> Result<(Arc<Revision>, NodeId, String), SvnError> {
        let txn = self
            .txn
            .as_ref()
            .ok_or_else(|| SvnError::ProtocolViolation("no open transaction".into()))?;
        let source_path = match copy_from.path.strip_prefix('/') {
            Some(absolute) => validate_rel_dir_path(absolute)?,
            None => self.repo_path(&validate_rel_dir_path(&copy_from.path)?),
        };
        let revision = txn
            .revisions
            .get(copy_from.revision as usize)
            .cloned()
            .ok_or_else(|| {
                SvnError::conflict(
                    &copy_from.path,
                    format!("copy source revision r{} does not exist", copy_from.revision),
                )
            })?;
        let id = revision.tree.lookup(&source_path).ok_or_else(|| {
            SvnError::conflict(
                &copy_from.path,
                format!("copy source not found in r{}", copy_from.revision),
            )
        })?;
        Ok((revision, id, source_path))
    }

    fn add_node(
        &mut self,
        path: &str,
        kind: NodeKind,
        copy_from: Option<&CopyFrom>,
    ) -> Result<NodeId, SvnError> {
        let rp = self.repo_path(path);
        let source = copy_from.map(|cf| self.copy_source(cf)).transpose()?;
        let txn = self.txn()?;
        if txn.tree.lookup(&rp).is_some() {
            return Err(SvnError::conflict(path, "already exists"));
        }
        let parent = txn
            .tree
            .lookup(dirname(&rp))
            .ok_or_else(|| SvnError::conflict(path, "parent directory not found"))?;
        let name = basename(&rp);
        let id = match &source {
            Some((revision, src, _)) => {
                let found = revision.tree.node(*src).kind;
                if found != kind {
                    return Err(SvnError::conflict(
                        path,
                        format!("copy source is a {found}, not a {kind}"),
                    ));
                }
                txn.tree.copy_subtree(&revision.tree, *src, parent, name)
            }
            None => txn.tree.add_child(parent, name, kind, txn.base_rev),
        };
        txn.touched.push(id);
        record(
            &mut txn.changes,
            ChangedPath {
                action: "A".to_string(),
                path: format!("/{rp}"),
                copy_from_path: source.as_ref().map(|(_, _, path)| format!("/{path}")),
                copy_from_rev: copy_from.map(|cf| cf.revision),
                node_kind: Some(kind),
            },
        );
        Ok(id)
    }

    fn modified(&mut self, id: NodeId) -> Result<(), SvnError> {
        let txn = self.txn()?;
        txn.touched.push(id);
        let path = txn.tree.path_of(id);
        let kind = txn.tree.node(id).kind;
        record(
            &mut txn.changes,
            ChangedPath {
                action: "M".to_string(),
                path: format!("/{path}"),
                copy_from_path: None,
                copy_from_rev: None,
                node_kind: Some(kind),
            },
        );
        Ok(())
    }

    fn do_open_root(&mut self, base_rev: Option<u64>) -> Result<(), SvnError> {
        self.state.open_root(base_rev)?;
        let revisions = self.repo.revisions();
        let base_rev_now = (revisions.len() - 1) as u64;
        if let Some(rev) = base_rev
            && rev > base_rev_now
        {
            return Err(SvnError::conflict("", format!("no such revision r{rev}")));
        }
        let tree = revisions[base_rev_now as usize].tree.as_ref().clone();
        debug!(base = base_rev_now, path = %self.base, "opened commit transaction");
        self.txn = Some(Txn {
            base_rev: base_rev_now,
            tree,
            touched: Vec::new(),
            changes: BTreeMap::new(),
            revisions,
        });
        Ok(())
    }

    fn do_delete_entry(&mut self, path: String, rev: Option<u64>) -> Result<(), SvnError> {
        self.state.delete_entry(&path)?;
        let rp = self.repo_path(&path);
        let txn = self.txn()?;
        let id = txn
            .tree
            .lookup(&rp)
            .ok_or_else(|| SvnError::conflict(&path, "path not found in transaction"))?;
        Self::check_current(&txn.tree, id, &path, rev)?;
        let parent = txn
            .tree
            .node(id)
            .parent
            .ok_or_else(|| SvnError::conflict(&path, "cannot delete the root"))?;
        let kind = txn.tree.node(id).kind;
        txn.tree.remove_child(parent, basename(&rp));
        txn.touched.push(parent);
        let key = format!("/{rp}");
        let nested = format!("{key}/");
        txn.changes.retain(|p, _| !p.starts_with(&nested));
        record(
            &mut txn.changes,
            ChangedPath {
                action: "D".to_string(),
                path: key,
                copy_from_path: None,
                copy_from_rev: None,
                node_kind: Some(kind),
            },
        );
        Ok(())
    }

    fn do_add_dir(&mut self, path: String, copy_from: Option<CopyFrom>) -> Result<(), SvnError> {
        self.state.add_dir(&path, copy_from.as_ref())?;
        self.add_node(&path, NodeKind::Dir, copy_from.as_ref())?;
        Ok(())
    }

    fn do_open_dir(&mut self, path: String, base_rev: Option<u64>) -> Result<(), SvnError> {
        self.state.open_dir(&path, base_rev)?;
        self.existing(&path, NodeKind::Dir)?;
        if let Some(rev) = base_rev {
            let rp = self.repo_path(&path);
            let txn = self.txn()?;
            let present = txn
                .revisions
                .get(rev as usize)
                .is_some_and(|r| r.tree.kind_at(&rp) == NodeKind::Dir);
            if !present {
                return Err(SvnError::conflict(&path, format!("not a directory in r{rev}")));
            }
        }
        Ok(())
    }

    fn change_prop(
        &mut self,
        path: &str,
        id: NodeId,
        name: PropName,
        value: Option<Vec<u8>>,
    ) -> Result<(), SvnError> {
        match name.kind() {
            PropKind::Workspace => {
                let rp = self.repo_path(path);
                self.mediator.set_workspace_property(&rp, &name, value)
            }
            // Entry props describe the committed node and are not stored.
            PropKind::Entry => Ok(()),
            PropKind::Versioned => {
                let txn = self.txn()?;
                let props = &mut txn.tree.node_mut(id).props;
                match value {
                    Some(value) => {
                        props.insert(name.into_string(), value);
                    }
                    None => {
                        props.remove(name.as_str());
                    }
                }
                self.modified(id)
            }
        }
    }

    fn do_change_dir_property(
        &mut self,
        name: PropName,
        value: Option<Vec<u8>>,
    ) -> Result<(), SvnError> {
        self.state.change_dir_property()?;
        let (path, base_rev, added) = match self.state.top() {
            Some(frame) => (frame.path.clone(), frame.base_rev, frame.added),
            None => return Err(SvnError::ProtocolViolation("no open directory".into())),
        };
        let id = self.existing(&path, NodeKind::Dir)?;
        if !added && name.kind() == PropKind::Versioned {
            let txn = self.txn()?;
            Self::check_current(&txn.tree, id, &path, base_rev)?;
        }
        self.change_prop(&path, id, name, value)
    }

    fn do_add_file(&mut self, path: String, copy_from: Option<CopyFrom>) -> Result<(), SvnError> {
        self.state.add_file(&path, copy_from.as_ref())?;
        let id = self.add_node(&path, NodeKind::File, copy_from.as_ref())?;
        self.file = Some(OpenFile {
            id,
            path,
            staged: None,
            result: None,
        });
        Ok(())
    }

    fn do_open_file(&mut self, path: String, base_rev: Option<u64>) -> Result<(), SvnError> {
        self.state.open_file(&path, base_rev)?;
        let id = self.existing(&path, NodeKind::File)?;
        let txn = self.txn()?;
        Self::check_current(&txn.tree, id, &path, base_rev)?;
        self.file = Some(OpenFile {
            id,
            path,
            staged: None,
            result: None,
        });
        Ok(())
    }

    fn do_apply_text_delta(&mut self, base_checksum: Option<String>) -> Result<(), SvnError> {
        self.state.apply_text_delta()?;
        let (id, path) = {
            let file = self.file()?;
            (file.id, file.path.clone())
        };
        let actual = md5_hex(&self.txn()?.tree.node(id).contents);
        if let Some(expected) = base_checksum
            && !expected.eq_ignore_ascii_case(&actual)
        {
            return Err(SvnError::ChecksumMismatch {
                path,
                expected,
                actual,
            });
        }
        self.deltas += 1;
        let prefix = format!("commit.{}", self.deltas);
        let rp = self.repo_path(&path);
        self.file()?.staged = Some(StagedDelta::new(rp, prefix));
        Ok(())
    }

    fn do_text_delta_chunk(&mut self, window: DiffWindow) -> Result<(), SvnError> {
        self.state.text_delta_chunk()?;
        window.validate()?;
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| SvnError::ProtocolViolation("no open file".into()))?;
        let staged = file
            .staged
            .as_mut()
            .ok_or_else(|| SvnError::ProtocolViolation("delta window before apply_text_delta".into()))?;
        staged.push(self.mediator.as_mut(), &window)
    }

    fn do_text_delta_end(&mut self) -> Result<(), SvnError> {
        self.state.text_delta_end()?;
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| SvnError::ProtocolViolation("no open file".into()))?;
        let mut staged = file
            .staged
            .take()
            .ok_or_else(|| SvnError::ProtocolViolation("text_delta_end before apply_text_delta".into()))?;
        let id = file.id;
        let windows = match staged.drain(self.mediator.as_mut()) {
            Ok(windows) => windows,
            Err(err) => {
                staged.discard(self.mediator.as_mut());
                return Err(err);
            }
        };
        let base = match &self.txn {
            Some(txn) => Arc::clone(&txn.tree.node(id).contents),
            None => return Err(SvnError::ProtocolViolation("no open transaction".into())),
        };
        let mut applier = DeltaApplier::new(base.as_slice(), Vec::new());
        for window in &windows {
            applier.apply(window)?;
        }
        let result = applier.finish()?;
        debug!(path = %staged.path(), windows = windows.len(), len = result.1.length, "applied commit delta");
        self.file()?.result = Some(result);
        Ok(())
    }

    fn do_change_file_property(
        &mut self,
        name: PropName,
        value: Option<Vec<u8>>,
    ) -> Result<(), SvnError> {
        self.state.change_file_property()?;
        let (id, path) = {
            let file = self.file()?;
            (file.id, file.path.clone())
        };
        self.change_prop(&path, id, name, value)
    }

    fn do_close_file(&mut self, text_checksum: Option<String>) -> Result<(), SvnError> {
        self.state.close_file()?;
        let file = self
            .file
            .take()
            .ok_or_else(|| SvnError::ProtocolViolation("no open file".into()))?;
        let txn = self.txn()?;
        let node = txn.tree.node_mut(file.id);
        match file.result {
            Some((contents, applied)) => {
                if let Some(expected) = text_checksum
                    && !expected.eq_ignore_ascii_case(&applied.md5)
                {
                    return Err(SvnError::ChecksumMismatch {
                        path: file.path,
                        expected,
                        actual: applied.md5,
                    });
                }
                node.contents = Arc::new(contents);
                self.modified(file.id)
            }
            None => {
                let actual = md5_hex(&node.contents);
                match text_checksum {
                    Some(expected) if !expected.eq_ignore_ascii_case(&actual) => {
                        Err(SvnError::ChecksumMismatch {
                            path: file.path,
                            expected,
                            actual,
                        })
                    }
                    _ => Ok(()),
                }
            }
        }
    }

    fn do_close_edit(&mut self) -> Result<Option<CommitInfo>, SvnError> {
        self.state.close_edit()?;
        let txn = self
            .txn
            .take()
            .ok_or_else(|| SvnError::ProtocolViolation("no open transaction".into()))?;
        let mut props = self.options.rev_props.clone();
        props.insert(
            SVN_LOG.to_string(),
            self.options.log_message.clone().into_bytes(),
        );
        if let Some(author) = &self.author {
            props.insert(SVN_AUTHOR.to_string(), author.clone().into_bytes());
        }
        let claim = LockClaim {
            user: self.author.clone(),
            tokens: self
                .options
                .lock_tokens
                .iter()
                .map(|t| (format!("/{}", join(&self.base, &t.path)), t.token.clone()))
                .collect(),
            keep: self.options.keep_locks,
        };
        let (new_rev, date) = self.repo.publish(
            txn.base_rev,
            txn.tree,
            &txn.touched,
            props,
            txn.changes.into_values().collect(),
            &claim,
        )?;
        Ok(Some(CommitInfo {
            new_rev,
            date: Some(date),
            author: self.author.clone(),
            post_commit_err: None,
        }))
    }

    fn discard(&mut self) {
        self.txn = None;
        if let Some(mut file) = self.file.take()
            && let Some(staged) = file.staged.as_mut()
        {
            staged.discard(self.mediator.as_mut());
        }
    }

    fn run(&mut self, result: Result<(), SvnError>) -> EditFuture<'_> {
        let result = self.state.guard(result);
        if let Err(err) = &result {
            warn!(error = %err, "commit call rejected");
        }
        ready(result)
    }
}

impl Drop for MemCommitEditor {
    fn drop(&mut self) {
        self.discard();
    }
}

impl TreeEditor for MemCommitEditor {
    fn target_revision(&mut self, rev: u64) -> EditFuture<'_> {
        let r = self.state.target_revision(rev);
        self.run(r)
    }

    fn open_root(&mut self, base_rev: Option<u64>) -> EditFuture<'_> {
        let r = self.do_open_root(base_rev);
        self.run(r)
    }

    fn delete_entry(&mut self, path: String, rev: Option<u64>) -> EditFuture<'_> {
        let r = self.do_delete_entry(path, rev);
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
        let r = self.state.absent(&path);
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
        let r = self.state.absent(&path);
        self.run(r)
    }

    fn close_edit(&mut self) -> EditFuture<'_, Option<CommitInfo>> {
        let r = self.do_close_edit();
        let r = self.state.guard(r);
        if r.is_err() {
            self.discard();
        }
        ready(r)
    }

    fn abort_edit(&mut self) -> EditFuture<'_> {
        if self.state.abort() {
            debug!(path = %self.base, "commit transaction aborted");
        }
        self.discard();
        ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::MemoryMediator;

    fn run_async<T>(f: impl std::future::Future<Output = T>) -> T {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(f)
    }

    fn editor(repo: &MemRepository, mediator: &MemoryMediator) -> MemCommitEditor {
        MemCommitEditor::new(
            repo.clone(),
            String::new(),
            CommitOptions::new("test"),
            Some("alice".into()),
            Box::new(mediator.clone()),
        )
    }

    #[test]
    fn added_file_is_published_with_changes() {
        run_async(async {
            let repo = MemRepository::new();
            let mediator = MemoryMediator::new();
            let mut ed = editor(&repo, &mediator);
            ed.open_root(None).await.unwrap();
            ed.add_dir("test".into(), None).await.unwrap();
            ed.add_file("test/a.txt".into(), None).await.unwrap();
            ed.apply_text_delta(None).await.unwrap();
            ed.text_delta_chunk(DiffWindow::replacement(b"hello"))
                .await
                .unwrap();
            assert_eq!(mediator.temporary_count(), 1);
            ed.text_delta_end().await.unwrap();
            assert_eq!(mediator.temporary_count(), 0);
            ed.close_file(Some(md5_hex(b"hello"))).await.unwrap();
            ed.close_dir().await.unwrap();
            ed.close_dir().await.unwrap();
            let info = ed.close_edit().await.unwrap().unwrap();
            assert_eq!(info.new_rev, 1);
            assert_eq!(info.author.as_deref(), Some("alice"));
            assert_eq!(repo.read_file("test/a.txt", None).unwrap(), b"hello");

            let (_, rev) = repo.revision(Some(1)).unwrap();
            let actions: Vec<_> = rev
                .changes
                .iter()
                .map(|c| (c.action.as_str(), c.path.as_str()))
                .collect();
            assert_eq!(actions, vec![("A", "/test"), ("A", "/test/a.txt")]);
            assert_eq!(rev.tree.node(rev.tree.lookup("test").unwrap()).created_rev, 1);
        });
    }

    #[test]
    fn nothing_is_visible_before_close_edit() {
        run_async(async {
            let repo = MemRepository::new();
            let mediator = MemoryMediator::new();
            let mut ed = editor(&repo, &mediator);
            ed.open_root(None).await.unwrap();
            ed.add_dir("pending".into(), None).await.unwrap();
            assert_eq!(repo.kind("pending", None), NodeKind::None);
            ed.abort_edit().await.unwrap();
            assert_eq!(repo.youngest(), 0);
        });
    }

    #[test]
    fn wrong_result_checksum_fails_the_edit() {
        run_async(async {
            let repo = MemRepository::new();
            let mediator = MemoryMediator::new();
            let mut ed = editor(&repo, &mediator);
            ed.open_root(None).await.unwrap();
            ed.add_file("f".into(), None).await.unwrap();
            ed.apply_text_delta(None).await.unwrap();
            ed.text_delta_chunk(DiffWindow::replacement(b"data"))
                .await
                .unwrap();
            ed.text_delta_end().await.unwrap();
            let err = ed.close_file(Some(md5_hex(b"other"))).await.unwrap_err();
            assert!(matches!(err, SvnError::ChecksumMismatch { .. }));
            assert!(matches!(
                ed.close_dir().await.unwrap_err(),
                SvnError::ProtocolViolation(_)
            ));
            ed.abort_edit().await.unwrap();
            assert_eq!(repo.youngest(), 0);
        });
    }

    #[test]
    fn abort_releases_staged_windows() {
        run_async(async {
            let repo = MemRepository::new();
            let mediator = MemoryMediator::new();
            let mut ed = editor(&repo, &mediator);
            ed.open_root(None).await.unwrap();
            ed.add_file("f".into(), None).await.unwrap();
            ed.apply_text_delta(None).await.unwrap();
            ed.text_delta_chunk(DiffWindow::replacement(b"one"))
                .await
                .unwrap();
            ed.text_delta_chunk(DiffWindow::replacement(b"two"))
                .await
                .unwrap();
            assert_eq!(mediator.temporary_count(), 2);
            ed.abort_edit().await.unwrap();
            assert_eq!(mediator.temporary_count(), 0);
        });
    }

    #[test]
    fn workspace_props_go_to_the_mediator() {
        run_async(async {
            let repo = MemRepository::new();
            let mediator = MemoryMediator::new();
            let mut ed = editor(&repo, &mediator);
            ed.open_root(None).await.unwrap();
            ed.add_dir("d".into(), None).await.unwrap();
            ed.change_dir_property("svn:wc:ra_dav:version-url".into(), Some(b"/v/1".to_vec()))
                .await
                .unwrap();
            ed.change_dir_property("owner".into(), Some(b"bob".to_vec()))
                .await
                .unwrap();
            ed.close_dir().await.unwrap();
            ed.close_dir().await.unwrap();
            ed.close_edit().await.unwrap();

            assert_eq!(mediator.workspace_properties().len(), 1);
            let (_, rev) = repo.revision(None).unwrap();
            let node = rev.tree.node(rev.tree.lookup("d").unwrap());
            assert_eq!(node.props.get("owner").unwrap(), b"bob");
            assert!(!node.props.contains_key("svn:wc:ra_dav:version-url"));
        });
    }

    #[test]
    fn delete_then_add_is_a_replace() {
        let mut changes = BTreeMap::new();
        let change = |action: &str| ChangedPath {
            action: action.to_string(),
            path: "/x".to_string(),
            copy_from_path: None,
            copy_from_rev: None,
            node_kind: Some(NodeKind::File),
        };
        record(&mut changes, change("D"));
        record(&mut changes, change("A"));
        assert_eq!(changes["/x"].action, "R");
        record(&mut changes, change("M"));
        assert_eq!(changes["/x"].action, "R");

        let mut changes = BTreeMap::new();
        record(&mut changes, change("A"));
        record(&mut changes, change("D"));
        assert!(changes.is_empty());
    }
}
