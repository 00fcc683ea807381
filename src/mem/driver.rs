//! Report-driven read edits over the in-memory repository.
//!
//! The reported working copy and the target tree are compared up front and
//! the resulting calls are replayed against the caller's editor in
//! pre-order. Paths handed to the editor are relative to the session URL.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::debug;

use super::tree::{NodeId, Tree};
use super::{Revision, no_such_revision};
use crate::deltagen::generate;
use crate::editor::{EditorEvent, TreeEditor, dispatch};
use crate::path::{basename, dirname, join, skip_ancestor};
use crate::session::ReportRequest;
use crate::textdelta::md5_hex;
use crate::{
    DELTA_WINDOW_MAX, Depth, ENTRY_COMMITTED_DATE, ENTRY_COMMITTED_REV, ENTRY_LAST_AUTHOR,
    NodeKind, PropName, PropertyList, Report, ReportCommand, SvnError,
};

/// What the client claims to hold at one report path.
#[derive(Clone, Debug)]
enum Claim {
    Present {
        root: String,
        rev: u64,
        depth: Depth,
        start_empty: bool,
    },
    Deleted,
}

/// A node the client holds.
#[derive(Clone, Copy)]
struct Source<'a> {
    tree: &'a Tree,
    id: NodeId,
    rev: u64,
}

impl Source<'_> {
    fn kind(&self) -> NodeKind {
        self.tree.node(self.id).kind
    }
}

struct Planner<'a> {
    revisions: &'a [Arc<Revision>],
    target_tree: &'a Tree,
    target: &'a str,
    target_root: &'a str,
    text_deltas: bool,
    claims: BTreeMap<String, Claim>,
    events: Vec<EditorEvent>,
}

/// A planned edit, ready to be replayed.
pub(crate) struct Drive {
    events: Vec<EditorEvent>,
}

impl Drive {
    pub(crate) fn new(
        revisions: Vec<Arc<Revision>>,
        base: &str,
        request: &ReportRequest,
        target_root: String,
        report: &Report,
        links: BTreeMap<String, String>,
        rev: u64,
    ) -> Result<Self, SvnError> {
        let mut claims = BTreeMap::new();
        for cmd in report.claims() {
            let (path, claim) = match cmd {
                ReportCommand::SetPath {
                    path,
                    rev,
                    start_empty,
                    depth,
                    ..
                } => (
                    path,
                    Claim::Present {
                        root: join(base, path),
                        rev: *rev,
                        depth: *depth,
                        start_empty: *start_empty,
                    },
                ),
                ReportCommand::LinkPath {
                    path,
                    url,
                    rev,
                    start_empty,
                    depth,
                    ..
                } => {
                    let root = links.get(url).cloned().ok_or_else(|| {
                        SvnError::InvalidUrl(format!("'{url}' is not in this repository"))
                    })?;
                    (
                        path,
                        Claim::Present {
                            root,
                            rev: *rev,
                            depth: *depth,
                            start_empty: *start_empty,
                        },
                    )
                }
                ReportCommand::DeletePath { path } => (path, Claim::Deleted),
                ReportCommand::FinishReport | ReportCommand::AbortReport => continue,
            };
            if let Claim::Present { rev, .. } = &claim
                && *rev as usize >= revisions.len()
            {
                return Err(no_such_revision(*rev));
            }
            claims.insert(path.clone(), claim);
        }
        let root_rev = match claims.get("") {
            Some(Claim::Present { rev, .. }) => *rev,
            _ => {
                return Err(SvnError::ProtocolViolation(
                    "report does not describe the session root".into(),
                ));
            }
        };

        let target_tree = match revisions.get(rev as usize) {
            Some(revision) => Arc::clone(&revision.tree),
            None => return Err(no_such_revision(rev)),
        };
        let planner = Planner {
            revisions: &revisions,
            target_tree: &target_tree,
            target: request.target(),
            target_root: &target_root,
            text_deltas: request.text_deltas(),
            claims,
            events: Vec::new(),
        };
        let events = planner.plan(rev, root_rev, request.depth())?;
        debug!(
            op = request.command(),
            rev,
            calls = events.len(),
            "planned edit drive"
        );
        Ok(Self { events })
    }

    /// Replays the planned calls, in order.
    pub(crate) async fn run(self, editor: &mut dyn TreeEditor) -> Result<(), SvnError> {
        for event in self.events {
            dispatch(editor, event).await?;
        }
        Ok(())
    }
}

fn prop_event(dir: bool, name: &str, value: Option<Vec<u8>>) -> EditorEvent {
    let name = PropName::new(name);
    if dir {
        EditorEvent::ChangeDirProp { name, value }
    } else {
        EditorEvent::ChangeFileProp { name, value }
    }
}

impl<'a> Planner<'a> {
    fn plan(
        mut self,
        rev: u64,
        root_rev: u64,
        depth: Depth,
    ) -> Result<Vec<EditorEvent>, SvnError> {
        self.events.push(EditorEvent::TargetRevision { rev });
        self.events.push(EditorEvent::OpenRoot {
            base_rev: Some(root_rev),
        });
        if self.target.is_empty() {
            let target = match self.target_of("") {
                Some(id) if self.target_tree.node(id).kind == NodeKind::Dir => id,
                _ => {
                    return Err(SvnError::conflict(
                        self.target_root,
                        format!("not a directory in r{rev}"),
                    ));
                }
            };
            let source = self.source_of("").filter(|s| s.kind() == NodeKind::Dir);
            self.props(true, source.map(|s| &s.tree.node(s.id).props), target);
            self.dir_contents("", source, target, depth);
        } else {
            let target = self.target.to_string();
            self.entry(&target, depth);
        }
        self.events.push(EditorEvent::CloseDir);
        self.events.push(EditorEvent::CloseEdit);
        Ok(self.events)
    }

    fn tree(&self, rev: u64) -> Option<&'a Tree> {
        let revisions: &'a [Arc<Revision>] = self.revisions;
        revisions.get(rev as usize).map(|r| r.tree.as_ref())
    }

    fn target_of(&self, path: &str) -> Option<NodeId> {
        let rest = skip_ancestor(self.target, path)?;
        self.target_tree.lookup(&join(self.target_root, rest))
    }

    /// The node the client holds at `path`, following the nearest claim.
    fn source_of(&self, path: &str) -> Option<Source<'a>> {
        let mut at = path;
        let claim = loop {
            if let Some(claim) = self.claims.get(at) {
                break claim;
            }
            if at.is_empty() {
                return None;
            }
            at = dirname(at);
        };
        let Claim::Present {
            root,
            rev,
            depth,
            start_empty,
        } = claim
        else {
            return None;
        };
        let tree = self.tree(*rev)?;
        let rest = skip_ancestor(at, path)?;
        if rest.is_empty() {
            let id = tree.lookup(root)?;
            return Some(Source {
                tree,
                id,
                rev: *rev,
            });
        }
        if *start_empty {
            return None;
        }
        let id = tree.lookup(&join(root, rest))?;
        let nested = rest.contains('/');
        let held = match depth {
            Depth::Empty => false,
            Depth::Files => !nested && tree.node(id).kind == NodeKind::File,
            Depth::Immediates => !nested,
            Depth::Infinity => true,
        };
        held.then_some(Source {
            tree,
            id,
            rev: *rev,
        })
    }

    /// Emits property changes turning `source` into the props of `target`.
    fn props(&mut self, dir: bool, source: Option<&PropertyList>, target: NodeId) -> bool {
        let target_props = &self.target_tree.node(target).props;
        let before = self.events.len();
        for (name, value) in target_props {
            if source.and_then(|s| s.get(name)) != Some(value) {
                self.events
                    .push(prop_event(dir, name, Some(value.clone())));
            }
        }
        if let Some(source) = source {
            for name in source.keys() {
                if !target_props.contains_key(name) {
                    self.events.push(prop_event(dir, name, None));
                }
            }
        }
        self.events.len() > before
    }

    fn entry_props(&mut self, dir: bool, target: NodeId) {
        let created_rev = self.target_tree.node(target).created_rev;
        self.events.push(prop_event(
            dir,
            ENTRY_COMMITTED_REV,
            Some(created_rev.to_string().into_bytes()),
        ));
        let Some(created) = self.revisions.get(created_rev as usize) else {
            return;
        };
        if let Some(date) = created.date() {
            self.events
                .push(prop_event(dir, ENTRY_COMMITTED_DATE, Some(date.into_bytes())));
        }
        if let Some(author) = created.author() {
            self.events
                .push(prop_event(dir, ENTRY_LAST_AUTHOR, Some(author.into_bytes())));
        }
    }

    /// Visits one entry of an open directory; `depth` applies to its contents.
    fn entry(&mut self, path: &str, depth: Depth) {
        let source = self.source_of(path);
        let target = self.target_of(path);
        match (source, target) {
            (None, None) => {}
            (Some(source), None) => self.events.push(EditorEvent::DeleteEntry {
                path: path.to_string(),
                rev: Some(source.rev),
            }),
            (None, Some(target)) => self.add(path, target, depth),
            (Some(source), Some(target)) => {
                let kind = self.target_tree.node(target).kind;
                if source.kind() != kind {
                    self.events.push(EditorEvent::DeleteEntry {
                        path: path.to_string(),
                        rev: Some(source.rev),
                    });
                    self.add(path, target, depth);
                } else if kind == NodeKind::Dir {
                    self.open_dir(path, source, target, depth);
                } else {
                    self.open_file(path, source, target);
                }
            }
        }
    }

    /// Visits the children of a directory present on both sides.
    fn dir_contents(
        &mut self,
        path: &str,
        source: Option<Source<'a>>,
        target: NodeId,
        depth: Depth,
    ) {
        let mut names: BTreeSet<String> = self
            .target_tree
            .node(target)
            .children
            .keys()
            .cloned()
            .collect();
        if let Some(source) = source {
            names.extend(source.tree.node(source.id).children.keys().cloned());
        }
        names.extend(
            self.claims
                .keys()
                .filter(|claimed| !claimed.is_empty() && dirname(claimed) == path)
                .map(|claimed| basename(claimed).to_string()),
        );

        for name in names {
            let child = join(path, &name);
            let kind = match self.target_of(&child) {
                Some(id) => self.target_tree.node(id).kind,
                None => self.source_of(&child).map_or(NodeKind::None, |s| s.kind()),
            };
            match kind {
                NodeKind::File if depth.includes_files() => self.entry(&child, depth),
                NodeKind::Dir => {
                    if let Some(child_depth) = depth.for_child_dir() {
                        self.entry(&child, child_depth);
                    }
                }
                _ => {}
            }
        }
    }

    fn add(&mut self, path: &str, target: NodeId, depth: Depth) {
        let tree = self.target_tree;
        let node = tree.node(target);
        match node.kind {
            NodeKind::Dir => {
                self.events.push(EditorEvent::AddDir {
                    path: path.to_string(),
                    copy_from: None,
                });
                self.props(true, None, target);
                self.entry_props(true, target);
                for (name, child) in &node.children {
                    let child_path = join(path, name);
                    match tree.node(*child).kind {
                        NodeKind::File if depth.includes_files() => {
                            self.add(&child_path, *child, depth);
                        }
                        NodeKind::Dir => {
                            if let Some(child_depth) = depth.for_child_dir() {
                                self.add(&child_path, *child, child_depth);
                            }
                        }
                        _ => {}
                    }
                }
                self.events.push(EditorEvent::CloseDir);
            }
            NodeKind::File => {
                self.events.push(EditorEvent::AddFile {
                    path: path.to_string(),
                    copy_from: None,
                });
                self.props(false, None, target);
                self.entry_props(false, target);
                self.text(None, target);
                self.close_file(target);
            }
            NodeKind::None => {}
        }
    }

    fn open_dir(&mut self, path: &str, source: Source<'a>, target: NodeId, depth: Depth) {
        let mark = self.events.len();
        self.events.push(EditorEvent::OpenDir {
            path: path.to_string(),
            base_rev: Some(source.rev),
        });
        let props_changed = self.props(true, Some(&source.tree.node(source.id).props), target);
        self.dir_contents(path, Some(source), target, depth);
        if !props_changed && self.events.len() == mark + 1 {
            self.events.truncate(mark);
            return;
        }
        self.entry_props(true, target);
        self.events.push(EditorEvent::CloseDir);
    }

    fn open_file(&mut self, path: &str, source: Source<'a>, target: NodeId) {
        let before = source.tree.node(source.id);
        let text_changed = before.contents != self.target_tree.node(target).contents;
        let mark = self.events.len();
        self.events.push(EditorEvent::OpenFile {
            path: path.to_string(),
            base_rev: Some(source.rev),
        });
        let props_changed = self.props(false, Some(&before.props), target);
        if !text_changed && !props_changed {
            self.events.truncate(mark);
            return;
        }
        self.entry_props(false, target);
        if text_changed {
            self.text(Some(before.contents.as_slice()), target);
        }
        self.close_file(target);
    }

    /// Sends the content of `target`, as windows against `source` when
    /// deltas are on and as bare stream markers otherwise.
    fn text(&mut self, source: Option<&[u8]>, target: NodeId) {
        self.events.push(EditorEvent::ApplyTextDelta {
            base_checksum: source.map(md5_hex),
        });
        if self.text_deltas {
            let contents = &self.target_tree.node(target).contents;
            for window in generate(source.unwrap_or_default(), contents, DELTA_WINDOW_MAX) {
                self.events.push(EditorEvent::TextDeltaChunk { window });
            }
        }
        self.events.push(EditorEvent::TextDeltaEnd);
    }

    fn close_file(&mut self, target: NodeId) {
        let text_checksum = self
            .text_deltas
            .then(|| md5_hex(&self.target_tree.node(target).contents));
        self.events.push(EditorEvent::CloseFile { text_checksum });
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::mem::MemRepository;
    use crate::mem::locks::LockClaim;
    use crate::{MemoryExport, RecordingEditor, StatusOptions, UpdateOptions};

    fn run_async<T>(f: impl std::future::Future<Output = T>) -> T {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(f)
    }

    fn put(tree: &mut Tree, path: &str, contents: Option<&[u8]>) -> NodeId {
        let mut id = Tree::ROOT;
        let parts: Vec<&str> = path.split('/').collect();
        for (i, name) in parts.iter().enumerate() {
            let last = i + 1 == parts.len();
            id = match tree.node(id).children.get(*name) {
                Some(child) => *child,
                None => {
                    let kind = if last && contents.is_some() {
                        NodeKind::File
                    } else {
                        NodeKind::Dir
                    };
                    tree.add_child(id, name, kind, 0)
                }
            };
        }
        if let Some(contents) = contents {
            tree.node_mut(id).contents = Arc::new(contents.to_vec());
        }
        id
    }

    fn commit(repo: &MemRepository, edit: impl FnOnce(&mut Tree) -> Vec<NodeId>) {
        let (base, revision) = repo.revision(None).unwrap();
        let mut tree = revision.tree.as_ref().clone();
        let touched = edit(&mut tree);
        repo.publish(
            base,
            tree,
            &touched,
            PropertyList::new(),
            Vec::new(),
            &LockClaim::default(),
        )
            .unwrap();
    }

    fn sample() -> MemRepository {
        let repo = MemRepository::new();
        commit(&repo, |tree| {
            vec![
                put(tree, "trunk/a.txt", Some(b"alpha\n")),
                put(tree, "trunk/sub/b.txt", Some(b"beta\n")),
                put(tree, "top.txt", Some(b"top\n")),
            ]
        });
        commit(&repo, |tree| {
            let trunk = tree.lookup("trunk").unwrap();
            tree.remove_child(trunk, "sub").unwrap();
            vec![trunk, put(tree, "trunk/a.txt", Some(b"alpha\nmore\n"))]
        });
        repo
    }

    fn report(rev: u64, start_empty: bool, depth: Depth) -> Report {
        let mut report = Report::new();
        report.push(ReportCommand::SetPath {
            path: String::new(),
            rev,
            start_empty,
            lock_token: None,
            depth,
        });
        report.finish();
        report
    }

    fn drive(repo: &MemRepository, request: &ReportRequest, report: &Report, rev: u64) -> Drive {
        Drive::new(
            repo.revisions(),
            "",
            request,
            String::new(),
            report,
            BTreeMap::new(),
            rev,
        )
        .unwrap()
    }

    #[test]
    fn empty_report_adds_everything() {
        run_async(async {
            let repo = sample();
            let request = ReportRequest::Update(UpdateOptions::new("", Depth::Infinity));
            let mut export = MemoryExport::new();
            drive(&repo, &request, &report(1, true, Depth::Infinity), 1)
                .run(&mut export)
                .await
                .unwrap();
            let files: Vec<_> = export.files().collect();
            assert_eq!(
                files,
                vec![
                    ("top.txt", &b"top\n"[..]),
                    ("trunk/a.txt", &b"alpha\n"[..]),
                    ("trunk/sub/b.txt", &b"beta\n"[..]),
                ]
            );
            let node = export.node("trunk/a.txt").unwrap();
            assert_eq!(node.entry_props.get(ENTRY_COMMITTED_REV).unwrap(), b"1");
            assert!(node.entry_props.contains_key(ENTRY_COMMITTED_DATE));
        });
    }

    #[test]
    fn update_sends_only_changes() {
        run_async(async {
            let repo = sample();
            let request = ReportRequest::Update(UpdateOptions::new("", Depth::Infinity));
            let mut recorder = RecordingEditor::new();
            drive(&repo, &request, &report(1, false, Depth::Infinity), 2)
                .run(&mut recorder)
                .await
                .unwrap();
            let events = recorder.into_events();
            assert!(events.contains(&EditorEvent::OpenDir {
                path: "trunk".into(),
                base_rev: Some(1),
            }));
            assert!(events.contains(&EditorEvent::DeleteEntry {
                path: "trunk/sub".into(),
                rev: Some(1),
            }));
            assert!(events.contains(&EditorEvent::ApplyTextDelta {
                base_checksum: Some(md5_hex(b"alpha\n")),
            }));
            assert!(!events.iter().any(|e| matches!(
                e,
                EditorEvent::OpenFile { path, .. } if path == "top.txt"
            )));
        });
    }

    #[test]
    fn update_applies_on_top_of_checkout() {
        run_async(async {
            let repo = sample();
            let request = ReportRequest::Update(UpdateOptions::new("", Depth::Infinity));
            let mut first = MemoryExport::new();
            drive(&repo, &request, &report(1, true, Depth::Infinity), 1)
                .run(&mut first)
                .await
                .unwrap();
            let mut second = MemoryExport::with_nodes(first.into_nodes());
            drive(&repo, &request, &report(1, false, Depth::Infinity), 2)
                .run(&mut second)
                .await
                .unwrap();
            assert_eq!(second.file("trunk/a.txt").unwrap(), b"alpha\nmore\n");
            assert!(second.node("trunk/sub").is_none());
            assert!(second.node("trunk/sub/b.txt").is_none());
        });
    }

    #[test]
    fn deleted_claims_are_sent_again() {
        run_async(async {
            let repo = sample();
            let request = ReportRequest::Update(UpdateOptions::new("", Depth::Infinity));
            let mut report = Report::new();
            report.push(ReportCommand::SetPath {
                path: String::new(),
                rev: 2,
                start_empty: false,
                lock_token: None,
                depth: Depth::Infinity,
            });
            report.push(ReportCommand::DeletePath {
                path: "top.txt".into(),
            });
            report.finish();
            let mut recorder = RecordingEditor::new();
            drive(&repo, &request, &report, 2)
                .run(&mut recorder)
                .await
                .unwrap();
            let adds: Vec<_> = recorder
                .events()
                .iter()
                .filter_map(|e| match e {
                    EditorEvent::AddFile { path, .. } => Some(path.as_str()),
                    _ => None,
                })
                .collect();
            assert_eq!(adds, vec!["top.txt"]);
        });
    }

    #[test]
    fn files_depth_skips_directories() {
        run_async(async {
            let repo = sample();
            let request = ReportRequest::Update(UpdateOptions::new("", Depth::Files));
            let mut export = MemoryExport::new();
            drive(&repo, &request, &report(1, true, Depth::Files), 1)
                .run(&mut export)
                .await
                .unwrap();
            assert_eq!(export.files().count(), 1);
            assert_eq!(export.dirs().collect::<Vec<_>>(), vec![""]);
        });
    }

    #[test]
    fn status_sends_markers_without_windows() {
        run_async(async {
            let repo = sample();
            let request = ReportRequest::Status(StatusOptions::new("", Depth::Infinity));
            let mut recorder = RecordingEditor::new();
            drive(&repo, &request, &report(1, false, Depth::Infinity), 2)
                .run(&mut recorder)
                .await
                .unwrap();
            let events = recorder.into_events();
            assert!(events.contains(&EditorEvent::TextDeltaEnd));
            assert!(!events
                .iter()
                .any(|e| matches!(e, EditorEvent::TextDeltaChunk { .. })));
        });
    }

    #[test]
    fn single_entry_target_only_touches_that_entry() {
        run_async(async {
            let repo = sample();
            let request = ReportRequest::Update(UpdateOptions::new("top.txt", Depth::Infinity));
            let mut recorder = RecordingEditor::new();
            Drive::new(
                repo.revisions(),
                "",
                &request,
                "top.txt".into(),
                &report(0, false, Depth::Infinity),
                BTreeMap::new(),
                2,
            )
            .unwrap()
            .run(&mut recorder)
            .await
            .unwrap();
            let paths: Vec<_> = recorder
                .events()
                .iter()
                .filter_map(|e| match e {
                    EditorEvent::AddFile { path, .. } | EditorEvent::AddDir { path, .. } => {
                        Some(path.as_str())
                    }
                    _ => None,
                })
                .collect();
            assert_eq!(paths, vec!["top.txt"]);
        });
    }

    #[test]
    fn missing_target_root_is_a_conflict() {
        let repo = sample();
        let request = ReportRequest::Update(UpdateOptions::new("", Depth::Infinity));
        let err = Drive::new(
            repo.revisions(),
            "",
            &request,
            "nope".into(),
            &report(1, false, Depth::Infinity),
            BTreeMap::new(),
            2,
        )
        .err()
        .unwrap();
        assert!(matches!(err, SvnError::NodeConflict { .. }));
    }

    #[test]
    fn report_revision_must_exist() {
        let repo = sample();
        let request = ReportRequest::Update(UpdateOptions::new("", Depth::Infinity));
        let err = Drive::new(
            repo.revisions(),
            "",
            &request,
            String::new(),
            &report(9, false, Depth::Infinity),
            BTreeMap::new(),
            2,
        )
        .err()
        .unwrap();
        assert!(matches!(err, SvnError::Server(_)));
    }
}
