//! An in-memory repository and its `mem://` transport.
//!
//! Meant for tests and examples: every revision is kept as a compacted node
//! arena, commits stage into a private transaction that becomes visible only
//! when `close_edit` succeeds, and read operations drive editors from a
//! report exactly like a remote server would.
//!
//! ```rust
//! # fn main() -> svn_ra::Result<()> {
//! # tokio::runtime::Builder::new_current_thread().build()?.block_on(async {
//! use std::sync::Arc;
//! use svn_ra::mem::{MemConnector, MemRepository};
//! use svn_ra::{RepositorySession, SessionConfig, TransportRegistry};
//!
//! let repo = MemRepository::new();
//! let registry = TransportRegistry::new().with(
//!     "mem",
//!     Arc::new(MemConnector::new().with_repository("demo", repo.clone())),
//! );
//! let mut session = RepositorySession::open("mem://demo/", SessionConfig::new(), &registry).await?;
//! assert_eq!(session.latest_revision().await?, 0);
//! # Ok(())
//! # })
//! # }
//! ```

mod commit;
mod driver;
mod history;
mod locks;
mod tree;

use std::collections::BTreeMap;
use std::fmt::Formatter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::editor::{EditFuture, TreeEditor, ready};
use crate::path::join;
use crate::session::{Connection, Connector, ReportRequest};
use crate::textdelta::md5_hex;
use crate::types::format_svn_date;
use crate::{
    ChangedPath, CommitOptions, Depth, DirEntry, DirListing, FileContents, FileRevision,
    Location, Lock, LockOptions, LogEntry, LogOptions, NodeKind, PropertyList, Report,
    RepositoryInfo, ServerError, ServerErrorItem, SessionConfig, SvnError, SvnUrl, UnlockOptions,
    WorkspaceMediator,
};

use commit::MemCommitEditor;
use locks::{LockClaim, LockTable};
use tree::{NodeId, Tree};

const SVN_LOG: &str = "svn:log";
const SVN_AUTHOR: &str = "svn:author";
const SVN_DATE: &str = "svn:date";

/// Server error code for a missing revision.
const ERR_NO_SUCH_REVISION: u64 = 160006;
/// Server error code for a missing repository.
const ERR_REPOS_NOT_FOUND: u64 = 210005;

/// One published revision.
#[derive(Debug)]
pub(crate) struct Revision {
    pub(crate) tree: Arc<Tree>,
    pub(crate) props: PropertyList,
    pub(crate) changes: Vec<ChangedPath>,
}

impl Revision {
    fn prop_string(&self, name: &str) -> Option<String> {
        self.props
            .get(name)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    pub(crate) fn date(&self) -> Option<String> {
        self.prop_string(SVN_DATE)
    }

    pub(crate) fn author(&self) -> Option<String> {
        self.prop_string(SVN_AUTHOR)
    }
}

#[derive(Debug)]
struct RepoInner {
    uuid: String,
    revisions: Vec<Arc<Revision>>,
    locks: LockTable,
}

/// An in-memory repository shared by every session opened on it.
///
/// Cloning is cheap and yields another handle to the same repository.
#[derive(Clone)]
pub struct MemRepository {
    inner: Arc<Mutex<RepoInner>>,
}

impl std::fmt::Debug for MemRepository {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("MemRepository")
            .field("uuid", &inner.uuid)
            .field("youngest", &(inner.revisions.len() - 1))
            .finish()
    }
}

impl Default for MemRepository {
    fn default() -> Self {
        Self::new()
    }
}

fn format_date(time: SystemTime) -> String {
    format_svn_date(&chrono::DateTime::<chrono::Utc>::from(time))
}

fn generate_uuid() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let mut hasher = Md5::new();
    hasher.update(nanos.to_le_bytes());
    hasher.update(std::process::id().to_le_bytes());
    hasher.update(COUNTER.fetch_add(1, Ordering::Relaxed).to_le_bytes());
    let hex = hex::encode(hasher.finalize());
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

fn server_error(code: u64, message: String) -> SvnError {
    SvnError::Server(ServerError {
        context: None,
        chain: vec![ServerErrorItem::new(code, message)],
    })
}

fn no_such_revision(rev: u64) -> SvnError {
    server_error(ERR_NO_SUCH_REVISION, format!("No such revision {rev}"))
}

impl MemRepository {
    /// Creates a repository with an empty revision 0 and a fresh UUID.
    pub fn new() -> Self {
        Self::with_uuid(generate_uuid())
    }

    /// Creates a repository with a fixed UUID.
    pub fn with_uuid(uuid: impl Into<String>) -> Self {
        let mut props = PropertyList::new();
        props.insert(
            SVN_DATE.to_string(),
            format_date(SystemTime::now()).into_bytes(),
        );
        let rev0 = Revision {
            tree: Arc::new(Tree::new()),
            props,
            changes: Vec::new(),
        };
        Self {
            inner: Arc::new(Mutex::new(RepoInner {
                uuid: uuid.into(),
                revisions: vec![Arc::new(rev0)],
                locks: LockTable::default(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RepoInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Repository UUID.
    pub fn uuid(&self) -> String {
        self.lock().uuid.clone()
    }

    /// Youngest revision.
    pub fn youngest(&self) -> u64 {
        (self.lock().revisions.len() - 1) as u64
    }

    /// Content of file `path` in `rev` (HEAD when `None`).
    pub fn read_file(&self, path: &str, rev: Option<u64>) -> Option<Vec<u8>> {
        let (_, revision) = self.revision(rev).ok()?;
        let id = revision.tree.lookup(path)?;
        let node = revision.tree.node(id);
        (node.kind == NodeKind::File).then(|| node.contents.as_ref().clone())
    }

    /// Kind of the node at `path` in `rev` (HEAD when `None`).
    pub fn kind(&self, path: &str, rev: Option<u64>) -> NodeKind {
        self.revision(rev)
            .map_or(NodeKind::None, |(_, revision)| revision.tree.kind_at(path))
    }

    /// Every path of `rev` (HEAD when `None`) in pre-order, directories
    /// suffixed with `/`.
    pub fn paths(&self, rev: Option<u64>) -> Vec<String> {
        let Ok((_, revision)) = self.revision(rev) else {
            return Vec::new();
        };
        let tree = &revision.tree;
        let mut out = Vec::new();
        let mut stack = vec![Tree::ROOT];
        while let Some(id) = stack.pop() {
            let node = tree.node(id);
            if id != Tree::ROOT {
                let mut path = tree.path_of(id);
                if node.kind == NodeKind::Dir {
                    path.push('/');
                }
                out.push(path);
            }
            stack.extend(node.children.values().rev());
        }
        out
    }

    pub(crate) fn revision(&self, rev: Option<u64>) -> Result<(u64, Arc<Revision>), SvnError> {
        let inner = self.lock();
        let youngest = (inner.revisions.len() - 1) as u64;
        let rev = rev.unwrap_or(youngest);
        inner
            .revisions
            .get(rev as usize)
            .map(|r| (rev, Arc::clone(r)))
            .ok_or_else(|| no_such_revision(rev))
    }

    pub(crate) fn revisions(&self) -> Vec<Arc<Revision>> {
        self.lock().revisions.clone()
    }

    /// Every lock currently held, ordered by path.
    pub fn locks(&self) -> Vec<Lock> {
        self.lock().locks.all()
    }

    fn lock_at(&self, path: &str) -> Option<Lock> {
        self.lock().locks.get(path).cloned()
    }

    fn locks_below(&self, path: &str, depth: Depth) -> Vec<Lock> {
        self.lock().locks.below(path, depth)
    }

    fn acquire_lock(
        &self,
        path: &str,
        owner: Option<&str>,
        options: &LockOptions,
    ) -> Result<Lock, SvnError> {
        let mut inner = self.lock();
        let head = Arc::clone(&inner.revisions[inner.revisions.len() - 1]);
        let lock = inner.locks.acquire(
            &head.tree,
            path,
            owner,
            options,
            format_date(SystemTime::now()),
        )?;
        debug!(path, owner = %lock.owner, "locked");
        Ok(lock)
    }

    fn release_lock(
        &self,
        path: &str,
        user: Option<&str>,
        options: &UnlockOptions,
    ) -> Result<(), SvnError> {
        self.lock().locks.release(path, user, options)?;
        debug!(path, broken = options.break_lock, "unlocked");
        Ok(())
    }

    /// Publishes `tree` as the next revision unless HEAD moved past `base`
    /// or `claim` may not touch a locked path in `changes`.
    pub(crate) fn publish(
        &self,
        base: u64,
        mut tree: Tree,
        touched: &[NodeId],
        mut props: PropertyList,
        changes: Vec<ChangedPath>,
        claim: &LockClaim,
    ) -> Result<(u64, String), SvnError> {
        let mut inner = self.lock();
        let youngest = (inner.revisions.len() - 1) as u64;
        if youngest != base {
            return Err(SvnError::conflict(
                "",
                format!("transaction based on r{base} but HEAD is r{youngest}"),
            ));
        }
        inner.locks.check_commit(&changes, claim)?;
        let new_rev = youngest + 1;
        for id in touched {
            if tree.is_linked(*id) {
                tree.bump(*id, new_rev);
            }
        }
        let tree = tree.compact();
        let date = format_date(SystemTime::now());
        props.insert(SVN_DATE.to_string(), date.clone().into_bytes());
        debug!(rev = new_rev, nodes = tree.len(), changes = changes.len(), "published revision");
        inner.locks.settle_commit(&changes, claim);
        inner.revisions.push(Arc::new(Revision {
            tree: Arc::new(tree),
            props,
            changes,
        }));
        Ok((new_rev, date))
    }

    fn set_revision_prop(
        &self,
        rev: u64,
        name: String,
        value: Option<Vec<u8>>,
    ) -> Result<(), SvnError> {
        let mut inner = self.lock();
        let slot = inner
            .revisions
            .get_mut(rev as usize)
            .ok_or_else(|| no_such_revision(rev))?;
        let mut props = slot.props.clone();
        match value {
            Some(value) => {
                props.insert(name, value);
            }
            None => {
                props.remove(&name);
            }
        }
        *slot = Arc::new(Revision {
            tree: Arc::clone(&slot.tree),
            props,
            changes: slot.changes.clone(),
        });
        Ok(())
    }
}

/// Connector serving named [`MemRepository`] values as `mem://name/path`.
#[derive(Clone, Default)]
pub struct MemConnector {
    repos: Arc<Mutex<BTreeMap<String, MemRepository>>>,
}

impl std::fmt::Debug for MemConnector {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let repos = self.repos.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("MemConnector")
            .field("repositories", &repos.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl MemConnector {
    /// Creates a connector serving no repositories.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `repo` under `name` and returns the connector.
    pub fn with_repository(self, name: impl Into<String>, repo: MemRepository) -> Self {
        self.add_repository(name, repo);
        self
    }

    /// Serves `repo` under `name`.
    pub fn add_repository(&self, name: impl Into<String>, repo: MemRepository) {
        self.repos
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), repo);
    }

    /// The repository served under `name`.
    pub fn repository(&self, name: &str) -> Option<MemRepository> {
        self.repos
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

impl Connector for MemConnector {
    fn connect<'a>(
        &'a self,
        url: &'a SvnUrl,
        config: &'a SessionConfig,
    ) -> EditFuture<'a, Box<dyn Connection>> {
        let result = match self.repository(&url.host) {
            Some(repo) => {
                let info = RepositoryInfo {
                    uuid: repo.uuid(),
                    root_url: format!("{}://{}/", url.scheme, url.host),
                    capabilities: vec!["depth".to_string(), "log-revprops".to_string()],
                };
                debug!(url = %url, "opened in-memory repository");
                Ok(Box::new(MemConnection {
                    repo,
                    base: url.path.clone(),
                    info,
                    author: config.username.clone(),
                    commit: None,
                }) as Box<dyn Connection>)
            }
            None => Err(SvnError::Server(ServerError {
                context: Some("open".to_string()),
                chain: vec![ServerErrorItem::new(
                    ERR_REPOS_NOT_FOUND,
                    format!("No repository found in '{url}'"),
                )],
            })),
        };
        ready(result)
    }
}

/// A `mem://` connection; paths are relative to `base`.
struct MemConnection {
    repo: MemRepository,
    base: String,
    info: RepositoryInfo,
    author: Option<String>,
    commit: Option<MemCommitEditor>,
}

impl MemConnection {
    fn repo_path(&self, path: &str) -> String {
        join(&self.base, path)
    }

    /// `path` as an absolute repository path, as locks and history use.
    fn abs_path(&self, path: &str) -> String {
        format!("/{}", self.repo_path(path))
    }

    /// Repository path of a URL served by this connection's repository.
    fn url_path(&self, url: &str) -> Result<String, SvnError> {
        let url = SvnUrl::parse(url)?;
        let root = SvnUrl::parse(&self.info.root_url)?;
        url.relative_to(&root).ok_or_else(|| {
            SvnError::InvalidUrl(format!("'{url}' is not in repository '{root}'"))
        })
    }

    fn dir_entry(&self, revisions: &[Arc<Revision>], tree: &Tree, id: NodeId, path: String) -> DirEntry {
        let node = tree.node(id);
        let created = revisions.get(node.created_rev as usize);
        DirEntry {
            name: node.name.clone(),
            path,
            kind: node.kind,
            size: match node.kind {
                NodeKind::File => node.contents.len() as u64,
                _ => 0,
            },
            has_props: !node.props.is_empty(),
            created_rev: node.created_rev,
            created_date: created.and_then(|r| r.date()),
            last_author: created.and_then(|r| r.author()),
        }
    }

    fn do_get_dir(&self, path: &str, rev: Option<u64>) -> Result<DirListing, SvnError> {
        let (rev, revision) = self.repo.revision(rev)?;
        let repo_path = self.repo_path(path);
        let tree = &revision.tree;
        let id = match tree.lookup(&repo_path) {
            Some(id) if tree.node(id).kind == NodeKind::Dir => id,
            _ => return Err(SvnError::conflict(path, format!("not a directory in r{rev}"))),
        };
        let revisions = self.repo.revisions();
        let entries = tree
            .node(id)
            .children
            .values()
            .map(|child| {
                let child_path = join(path, &tree.node(*child).name);
                self.dir_entry(&revisions, tree, *child, child_path)
            })
            .collect();
        Ok(DirListing {
            rev,
            props: tree.node(id).props.clone(),
            entries,
        })
    }

    fn do_log(
        &self,
        options: &LogOptions,
        handler: &mut (dyn FnMut(LogEntry) -> Result<(), SvnError> + Send),
    ) -> Result<(), SvnError> {
        let revisions = self.repo.revisions();
        let youngest = (revisions.len() - 1) as u64;
        let start = options.start_rev.unwrap_or(youngest);
        let end = options.end_rev.unwrap_or(youngest);
        for rev in [start, end] {
            if rev > youngest {
                return Err(no_such_revision(rev));
            }
        }
        let order: Box<dyn Iterator<Item = u64>> = if start <= end {
            Box::new(start..=end)
        } else {
            Box::new((end..=start).rev())
        };

        let prefixes: Vec<String> = if options.target_paths.is_empty() {
            vec![format!("/{}", self.base)]
        } else {
            options
                .target_paths
                .iter()
                .map(|p| format!("/{}", self.repo_path(p)))
                .collect()
        };
        let touches = |changed: &ChangedPath| {
            prefixes.iter().any(|prefix| {
                prefix == "/"
                    || changed.path == *prefix
                    || changed
                        .path
                        .strip_prefix(prefix.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            })
        };

        let mut sent = 0u64;
        for rev in order {
            let revision = &revisions[rev as usize];
            if !revision.changes.iter().any(|c| touches(c)) {
                continue;
            }
            handler(LogEntry {
                rev,
                changed_paths: if options.changed_paths {
                    revision.changes.clone()
                } else {
                    Vec::new()
                },
                author: revision.author(),
                date: revision.date(),
                message: revision.prop_string(SVN_LOG),
            })?;
            sent += 1;
            if options.limit > 0 && sent >= options.limit {
                break;
            }
        }
        Ok(())
    }
}

impl Connection for MemConnection {
    fn info(&self) -> &RepositoryInfo {
        &self.info
    }

    fn latest_revision(&mut self) -> EditFuture<'_, u64> {
        ready(Ok(self.repo.youngest()))
    }

    fn check_path(&mut self, path: String, rev: Option<u64>) -> EditFuture<'_, NodeKind> {
        let result = self
            .repo
            .revision(rev)
            .map(|(_, revision)| revision.tree.kind_at(&self.repo_path(&path)));
        ready(result)
    }

    fn stat(&mut self, path: String, rev: Option<u64>) -> EditFuture<'_, Option<DirEntry>> {
        let result = self.repo.revision(rev).map(|(_, revision)| {
            let tree = &revision.tree;
            tree.lookup(&self.repo_path(&path)).map(|id| {
                let revisions = self.repo.revisions();
                self.dir_entry(&revisions, tree, id, path.clone())
            })
        });
        ready(result)
    }

    fn get_dir(&mut self, path: String, rev: Option<u64>) -> EditFuture<'_, DirListing> {
        ready(self.do_get_dir(&path, rev))
    }

    fn get_file<'a>(
        &'a mut self,
        path: String,
        rev: Option<u64>,
        sink: &'a mut (dyn AsyncWrite + Unpin + Send),
    ) -> EditFuture<'a, FileContents> {
        Box::pin(async move {
            let (rev, revision) = self.repo.revision(rev)?;
            let tree = &revision.tree;
            let node = match tree.lookup(&self.repo_path(&path)) {
                Some(id) if tree.node(id).kind == NodeKind::File => tree.node(id),
                _ => return Err(SvnError::conflict(&path, format!("not a file in r{rev}"))),
            };
            for chunk in node.contents.chunks(crate::DELTA_WINDOW_MAX) {
                sink.write_all(chunk).await?;
            }
            sink.flush().await?;
            Ok(FileContents {
                rev,
                checksum: Some(md5_hex(&node.contents)),
                props: node.props.clone(),
                bytes_written: node.contents.len() as u64,
            })
        })
    }

    fn log<'a>(
        &'a mut self,
        options: LogOptions,
        handler: &'a mut (dyn FnMut(LogEntry) -> Result<(), SvnError> + Send),
    ) -> EditFuture<'a> {
        ready(self.do_log(&options, handler))
    }

    fn revision_properties(&mut self, rev: u64) -> EditFuture<'_, PropertyList> {
        ready(
            self.repo
                .revision(Some(rev))
                .map(|(_, revision)| revision.props.clone()),
        )
    }

    fn revision_property(&mut self, rev: u64, name: String) -> EditFuture<'_, Option<Vec<u8>>> {
        ready(
            self.repo
                .revision(Some(rev))
                .map(|(_, revision)| revision.props.get(&name).cloned()),
        )
    }

    fn change_revision_property(
        &mut self,
        rev: u64,
        name: String,
        value: Option<Vec<u8>>,
    ) -> EditFuture<'_> {
        ready(self.repo.set_revision_prop(rev, name, value))
    }

    fn dated_revision(&mut self, date: DateTime<Utc>) -> EditFuture<'_, u64> {
        ready(Ok(history::dated_revision(&self.repo.revisions(), date)))
    }

    fn locations(
        &mut self,
        path: String,
        peg_rev: u64,
        revs: Vec<u64>,
    ) -> EditFuture<'_, Vec<Location>> {
        let path = self.abs_path(&path);
        ready(history::locations(&self.repo.revisions(), &path, peg_rev, &revs))
    }

    fn file_revisions(
        &mut self,
        path: String,
        start_rev: Option<u64>,
        end_rev: Option<u64>,
    ) -> EditFuture<'_, Vec<FileRevision>> {
        let path = self.abs_path(&path);
        let revisions = self.repo.revisions();
        let youngest = (revisions.len() - 1) as u64;
        let end = end_rev.unwrap_or(youngest);
        ready(history::file_revisions(
            &revisions,
            &path,
            start_rev.unwrap_or(0),
            end,
        ))
    }

    fn get_lock(&mut self, path: String) -> EditFuture<'_, Option<Lock>> {
        ready(Ok(self.repo.lock_at(&self.abs_path(&path))))
    }

    fn get_locks(&mut self, path: String, depth: Depth) -> EditFuture<'_, Vec<Lock>> {
        ready(Ok(self.repo.locks_below(&self.abs_path(&path), depth)))
    }

    fn lock(&mut self, path: String, options: LockOptions) -> EditFuture<'_, Lock> {
        let path = self.abs_path(&path);
        ready(self.repo.acquire_lock(&path, self.author.as_deref(), &options))
    }

    fn unlock(&mut self, path: String, options: UnlockOptions) -> EditFuture<'_> {
        let path = self.abs_path(&path);
        ready(self.repo.release_lock(&path, self.author.as_deref(), &options))
    }

    fn run_report<'a>(
        &'a mut self,
        request: ReportRequest,
        report: Report,
        editor: &'a mut dyn TreeEditor,
    ) -> EditFuture<'a> {
        Box::pin(async move {
            let target_root = match &request {
                ReportRequest::Switch(options) => self.url_path(&options.switch_url)?,
                ReportRequest::Diff(options) => self.url_path(&options.versus_url)?,
                ReportRequest::Update(_) | ReportRequest::Status(_) => {
                    self.repo_path(request.target())
                }
            };
            let mut links = BTreeMap::new();
            for cmd in report.claims() {
                if let crate::ReportCommand::LinkPath { url, .. } = cmd {
                    links.insert(url.clone(), self.url_path(url)?);
                }
            }
            let (rev, _) = self.repo.revision(request.rev())?;
            let drive = driver::Drive::new(
                self.repo.revisions(),
                &self.base,
                &request,
                target_root,
                &report,
                links,
                rev,
            )?;
            drive.run(editor).await
        })
    }

    fn begin_commit(
        &mut self,
        options: CommitOptions,
        mediator: Box<dyn WorkspaceMediator>,
    ) -> EditFuture<'_> {
        if let Some(editor) = &self.commit
            && !editor.is_finished()
        {
            return ready(Err(SvnError::Reentrancy(
                "a commit is already in progress".into(),
            )));
        }
        self.commit = Some(MemCommitEditor::new(
            self.repo.clone(),
            self.base.clone(),
            options,
            self.author.clone(),
            mediator,
        ));
        ready(Ok(()))
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

    #[test]
    fn new_repository_has_empty_revision_zero() {
        let repo = MemRepository::with_uuid("00000000-1111-2222-3333-444444444444");
        assert_eq!(repo.youngest(), 0);
        assert_eq!(repo.uuid(), "00000000-1111-2222-3333-444444444444");
        assert_eq!(repo.kind("", None), NodeKind::Dir);
        assert!(repo.paths(None).is_empty());
        assert!(repo.revision(Some(1)).is_err());
    }

    #[test]
    fn generated_uuids_differ() {
        let a = MemRepository::new().uuid();
        let b = MemRepository::new().uuid();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }

    #[test]
    fn publish_rejects_stale_base() {
        let repo = MemRepository::new();
        let (rev, _) = repo
            .publish(
                0,
                Tree::new(),
                &[],
                PropertyList::new(),
                Vec::new(),
                &LockClaim::default(),
            )
            .unwrap();
        assert_eq!(rev, 1);
        let err = repo
            .publish(
                0,
                Tree::new(),
                &[],
                PropertyList::new(),
                Vec::new(),
                &LockClaim::default(),
            )
            .unwrap_err();
        assert!(matches!(err, SvnError::NodeConflict { .. }));
        assert_eq!(repo.youngest(), 1);
    }

    #[test]
    fn dates_use_microsecond_utc_format() {
        let date = format_date(UNIX_EPOCH);
        assert_eq!(date, "1970-01-01T00:00:00.000000Z");
    }
}
