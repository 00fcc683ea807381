//! Sessions bound to one repository URL.
//!
//! A [`RepositorySession`] owns at most one transport connection and runs
//! one operation on it at a time. The connection is leased out for the
//! duration of each call; a [`CommitEditor`] keeps the lease until the edit
//! finishes, and every other call fails fast with
//! [`SvnError::Reentrancy`] in the meantime.

use std::collections::BTreeMap;
use std::fmt::Formatter;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use tokio::io::AsyncWrite;
use tracing::{debug, warn};

use crate::editor::{EditFuture, EditorState, TreeEditor};
use crate::path::{validate_rel_dir_path, validate_rel_path};
use crate::reporter::ReportBuilder;
use crate::{
    CommitInfo, CommitOptions, CopyFrom, Depth, DiffOptions, DiffWindow, DirEntry, DirListing,
    FileContents, FileRevision, Location, Lock, LockOptions, LogEntry, LogOptions, NodeKind,
    PropName, PropertyList, Report, ReportCommand, ReportScope, ReporterBaton, RepositoryInfo,
    SessionConfig, StatusOptions, SvnError, SvnUrl, SwitchOptions, UnlockOptions, UpdateOptions,
    WorkspaceMediator,
};

/// Opens connections for one URL scheme.
pub trait Connector: Send + Sync {
    /// Connects to `url` and completes any handshake and authentication.
    fn connect<'a>(
        &'a self,
        url: &'a SvnUrl,
        config: &'a SessionConfig,
    ) -> EditFuture<'a, Box<dyn Connection>>;
}

/// The update-style request a finished report is sent with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReportRequest {
    /// Bring the reported state to a revision of the session URL.
    Update(UpdateOptions),
    /// Bring the reported state to a revision of another URL.
    Switch(SwitchOptions),
    /// Describe local differences against a revision without content.
    Status(StatusOptions),
    /// Describe differences against another URL.
    Diff(DiffOptions),
}

impl ReportRequest {
    /// Command name used in logs and on the `svn://` wire.
    pub fn command(&self) -> &'static str {
        match self {
            Self::Update(_) => "update",
            Self::Switch(_) => "switch",
            Self::Status(_) => "status",
            Self::Diff(_) => "diff",
        }
    }

    /// Target, revision and depth of the edit.
    pub fn scope(&self) -> &ReportScope {
        match self {
            Self::Update(o) => &o.scope,
            Self::Switch(o) => &o.scope,
            Self::Status(o) => &o.scope,
            Self::Diff(o) => &o.scope,
        }
    }

    /// Requested revision; `None` means HEAD.
    pub fn rev(&self) -> Option<u64> {
        self.scope().rev
    }

    /// Entry below the session URL the edit is restricted to, or `""`.
    pub fn target(&self) -> &str {
        &self.scope().target
    }

    /// Requested depth.
    pub fn depth(&self) -> Depth {
        self.scope().depth
    }

    /// Whether file content travels as delta windows.
    pub fn text_deltas(&self) -> bool {
        match self {
            Self::Status(_) => false,
            Self::Diff(o) => o.text_deltas,
            Self::Update(_) | Self::Switch(_) => true,
        }
    }
}

/// One live connection to a repository.
///
/// Paths are relative to the URL the connection was opened for. A
/// connection runs one request at a time; [`RepositorySession`] enforces
/// that before any of these methods are reached.
pub trait Connection: Send {
    /// Repository identity learned while connecting.
    fn info(&self) -> &RepositoryInfo;

    /// Youngest revision of the repository.
    fn latest_revision(&mut self) -> EditFuture<'_, u64>;

    /// Kind of the node at `path`, or [`NodeKind::None`].
    fn check_path(&mut self, path: String, rev: Option<u64>) -> EditFuture<'_, NodeKind>;

    /// Entry describing the node at `path`, if it exists.
    fn stat(&mut self, path: String, rev: Option<u64>) -> EditFuture<'_, Option<DirEntry>>;

    /// Directory properties and entries.
    fn get_dir(&mut self, path: String, rev: Option<u64>) -> EditFuture<'_, DirListing>;

    /// Streams file content into `sink`.
    fn get_file<'a>(
        &'a mut self,
        path: String,
        rev: Option<u64>,
        sink: &'a mut (dyn AsyncWrite + Unpin + Send),
    ) -> EditFuture<'a, FileContents>;

    /// Hands log entries to `handler` in the requested order.
    fn log<'a>(
        &'a mut self,
        options: LogOptions,
        handler: &'a mut (dyn FnMut(LogEntry) -> Result<(), SvnError> + Send),
    ) -> EditFuture<'a>;

    /// All properties of revision `rev`.
    fn revision_properties(&mut self, rev: u64) -> EditFuture<'_, PropertyList>;

    /// One property of revision `rev`.
    fn revision_property(&mut self, rev: u64, name: String) -> EditFuture<'_, Option<Vec<u8>>>;

    /// Sets (`Some`) or deletes (`None`) a property of revision `rev`.
    fn change_revision_property(
        &mut self,
        rev: u64,
        name: String,
        value: Option<Vec<u8>>,
    ) -> EditFuture<'_>;

    /// Youngest revision committed at or before `date`.
    fn dated_revision(&mut self, date: DateTime<Utc>) -> EditFuture<'_, u64>;

    /// Paths the node at `path` in `peg_rev` had in each of `revs`.
    ///
    /// Revisions in which the node did not exist are left out.
    fn locations(
        &mut self,
        path: String,
        peg_rev: u64,
        revs: Vec<u64>,
    ) -> EditFuture<'_, Vec<Location>>;

    /// Revisions that changed file `path` between `start_rev` and `end_rev`,
    /// oldest first, following copies.
    fn file_revisions(
        &mut self,
        path: String,
        start_rev: Option<u64>,
        end_rev: Option<u64>,
    ) -> EditFuture<'_, Vec<FileRevision>>;

    /// Lock on file `path`, if any.
    fn get_lock(&mut self, path: String) -> EditFuture<'_, Option<Lock>>;

    /// Locks on `path` and below it, down to `depth`.
    fn get_locks(&mut self, path: String, depth: Depth) -> EditFuture<'_, Vec<Lock>>;

    /// Locks file `path` for the session user.
    fn lock(&mut self, path: String, options: LockOptions) -> EditFuture<'_, Lock>;

    /// Releases or breaks the lock on file `path`.
    fn unlock(&mut self, path: String, options: UnlockOptions) -> EditFuture<'_>;

    /// Sends a finished report and drives `editor` with the response.
    fn run_report<'a>(
        &'a mut self,
        request: ReportRequest,
        report: Report,
        editor: &'a mut dyn TreeEditor,
    ) -> EditFuture<'a>;

    /// Starts a commit. Until it ends, calls go to [`Connection::commit_editor`].
    fn begin_commit(
        &mut self,
        options: CommitOptions,
        mediator: Box<dyn WorkspaceMediator>,
    ) -> EditFuture<'_>;

    /// The editor of the commit started by [`Connection::begin_commit`].
    fn commit_editor(&mut self) -> Option<&mut dyn TreeEditor>;
}

/// Maps URL schemes to connectors.
///
/// Built once and passed to [`RepositorySession::open`]; there is no
/// process-wide registry.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    connectors: BTreeMap<String, Arc<dyn Connector>>,
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("schemes", &self.connectors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TransportRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the `svn://` transport.
    ///
    /// `mem://` repositories are registered by the caller, see
    /// [`crate::mem::MemConnector`].
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("svn", Arc::new(crate::rasvn::RaSvnConnector));
        registry
    }

    /// Registers `connector` for `scheme`, replacing any previous one.
    pub fn register(&mut self, scheme: impl Into<String>, connector: Arc<dyn Connector>) -> &mut Self {
        self.connectors
            .insert(scheme.into().to_ascii_lowercase(), connector);
        self
    }

    /// Returns a copy with `connector` registered for `scheme`.
    pub fn with(mut self, scheme: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        self.register(scheme, connector);
        self
    }

    fn connector(&self, scheme: &str) -> Result<Arc<dyn Connector>, SvnError> {
        self.connectors
            .get(scheme)
            .cloned()
            .ok_or_else(|| SvnError::UnsupportedScheme(scheme.to_string()))
    }
}

/// Connection state of a [`RepositorySession`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// No connection; the next call reconnects.
    Closed,
    /// Idle with an open connection.
    Connected,
    /// An operation or a commit editor holds the connection.
    OperationInProgress,
}

struct Slot {
    state: SessionState,
    conn: Option<Box<dyn Connection>>,
    info: Option<RepositoryInfo>,
    op: &'static str,
}

type SharedSlot = Arc<Mutex<Slot>>;

fn lock_slot(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Closes the session unless disarmed; covers dropped futures and editors.
struct ResetOnDrop {
    slot: SharedSlot,
    armed: bool,
}

impl Drop for ResetOnDrop {
    fn drop(&mut self) {
        if self.armed {
            let mut slot = lock_slot(&self.slot);
            debug!(op = slot.op, "operation abandoned; closing session");
            slot.conn = None;
            slot.state = SessionState::Closed;
        }
    }
}

/// A connection checked out of the session for one operation.
struct Lease {
    conn: Box<dyn Connection>,
    reset: ResetOnDrop,
}

impl Lease {
    /// Hands the connection back, or drops it after a transport failure.
    fn finish<T>(self, result: Result<T, SvnError>) -> Result<T, SvnError> {
        let Lease { conn, mut reset } = self;
        reset.armed = false;
        let mut slot = lock_slot(&reset.slot);
        match &result {
            Err(err) if err.is_transport() => {
                warn!(op = slot.op, error = %err, "transport failed; closing session");
                slot.conn = None;
                slot.state = SessionState::Closed;
            }
            _ => {
                slot.conn = Some(conn);
                slot.state = SessionState::Connected;
            }
        }
        result
    }
}

/// A session against one repository URL.
///
/// ```rust,no_run
/// # async fn demo() -> svn_ra::Result<()> {
/// use svn_ra::{LogOptions, RepositorySession, SessionConfig, TransportRegistry};
///
/// let registry = TransportRegistry::with_defaults();
/// let mut session =
///     RepositorySession::open("svn://example.com/repo", SessionConfig::new(), &registry).await?;
/// session
///     .log(LogOptions::between(1, 10), |entry| {
///         println!("r{} {:?}", entry.rev, entry.message);
///         Ok(())
///     })
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct RepositorySession {
    url: SvnUrl,
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    slot: SharedSlot,
}

impl std::fmt::Debug for RepositorySession {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositorySession")
            .field("url", &self.url.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl RepositorySession {
    /// Opens a session for `url` and connects to it.
    pub async fn open(
        url: &str,
        config: SessionConfig,
        registry: &TransportRegistry,
    ) -> Result<Self, SvnError> {
        let url = SvnUrl::parse(url)?;
        let connector = registry.connector(&url.scheme)?;
        let session = Self {
            url,
            config,
            connector,
            slot: Arc::new(Mutex::new(Slot {
                state: SessionState::Closed,
                conn: None,
                info: None,
                op: "open",
            })),
        };
        session.test_connection().await?;
        Ok(session)
    }

    /// The URL this session is bound to.
    pub fn url(&self) -> &SvnUrl {
        &self.url
    }

    /// Current connection state.
    pub fn state(&self) -> SessionState {
        lock_slot(&self.slot).state
    }

    /// Repository identity from the most recent connection.
    pub fn repository_info(&self) -> Option<RepositoryInfo> {
        lock_slot(&self.slot).info.clone()
    }

    /// Drops the connection. Fails while a commit editor is alive.
    pub fn close(&mut self) -> Result<(), SvnError> {
        let mut slot = lock_slot(&self.slot);
        if slot.state == SessionState::OperationInProgress {
            return Err(SvnError::Reentrancy(format!(
                "cannot close while {} is in progress",
                slot.op
            )));
        }
        slot.conn = None;
        slot.state = SessionState::Closed;
        Ok(())
    }

    async fn lease(&self, op: &'static str) -> Result<Lease, SvnError> {
        let existing = {
            let mut slot = lock_slot(&self.slot);
            if slot.state == SessionState::OperationInProgress {
                return Err(SvnError::Reentrancy(format!(
                    "cannot start {op} while {} is in progress",
                    slot.op
                )));
            }
            slot.state = SessionState::OperationInProgress;
            slot.op = op;
            slot.conn.take()
        };
        let reset = ResetOnDrop {
            slot: self.slot.clone(),
            armed: true,
        };
        let conn = match existing {
            Some(conn) => conn,
            None => {
                debug!(op, url = %self.url, "connecting");
                let conn = self.connector.connect(&self.url, &self.config).await?;
                lock_slot(&self.slot).info = Some(conn.info().clone());
                conn
            }
        };
        Ok(Lease { conn, reset })
    }

    /// Connects if needed and checks that the session is usable.
    pub async fn test_connection(&self) -> Result<(), SvnError> {
        let lease = self.lease("test-connection").await?;
        lease.finish(Ok(()))
    }

    /// Youngest revision in the repository.
    pub async fn latest_revision(&mut self) -> Result<u64, SvnError> {
        let mut lease = self.lease("get-latest-rev").await?;
        let result = lease.conn.latest_revision().await;
        lease.finish(result)
    }

    /// Kind of the node at `path` in `rev` (HEAD when `None`).
    pub async fn check_path(&mut self, path: &str, rev: Option<u64>) -> Result<NodeKind, SvnError> {
        let path = validate_rel_dir_path(path)?;
        let mut lease = self.lease("check-path").await?;
        let result = lease.conn.check_path(path, rev).await;
        lease.finish(result)
    }

    /// Entry for the node at `path`, or `None` when it does not exist.
    pub async fn stat(&mut self, path: &str, rev: Option<u64>) -> Result<Option<DirEntry>, SvnError> {
        let path = validate_rel_dir_path(path)?;
        let mut lease = self.lease("stat").await?;
        let result = lease.conn.stat(path, rev).await;
        lease.finish(result)
    }

    /// Lists directory `path`, handing each entry to `handler` first.
    pub async fn get_dir<F>(
        &mut self,
        path: &str,
        rev: Option<u64>,
        mut handler: F,
    ) -> Result<DirListing, SvnError>
    where
        F: FnMut(&DirEntry) -> Result<(), SvnError>,
    {
        let path = validate_rel_dir_path(path)?;
        let mut lease = self.lease("get-dir").await?;
        let result = lease.conn.get_dir(path, rev).await;
        let listing = lease.finish(result)?;
        for entry in &listing.entries {
            handler(entry)?;
        }
        Ok(listing)
    }

    /// Streams file `path` into `sink` and verifies its MD5.
    pub async fn get_file<W>(
        &mut self,
        path: &str,
        rev: Option<u64>,
        sink: &mut W,
    ) -> Result<FileContents, SvnError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let path = validate_rel_path(path)?;
        let mut hashing = HashingWriter::new(sink);
        let mut lease = self.lease("get-file").await?;
        let result = lease.conn.get_file(path.clone(), rev, &mut hashing).await;
        let contents = lease.finish(result)?;
        let actual = hashing.finish();
        if let Some(expected) = contents.checksum.as_deref()
            && !expected.eq_ignore_ascii_case(&actual)
        {
            return Err(SvnError::ChecksumMismatch {
                path,
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(contents)
    }

    /// Runs a log query, handing each entry to `handler`.
    pub async fn log<F>(&mut self, options: LogOptions, mut handler: F) -> Result<(), SvnError>
    where
        F: FnMut(LogEntry) -> Result<(), SvnError> + Send,
    {
        let mut options = options;
        options.target_paths = options
            .target_paths
            .iter()
            .map(|p| validate_rel_dir_path(p))
            .collect::<Result<_, _>>()?;
        let mut lease = self.lease("log").await?;
        let result = lease.conn.log(options, &mut handler).await;
        lease.finish(result)
    }

    /// All properties of revision `rev`.
    pub async fn revision_properties(&mut self, rev: u64) -> Result<PropertyList, SvnError> {
        let mut lease = self.lease("rev-proplist").await?;
        let result = lease.conn.revision_properties(rev).await;
        lease.finish(result)
    }

    /// One property of revision `rev`.
    pub async fn revision_property(
        &mut self,
        rev: u64,
        name: &str,
    ) -> Result<Option<Vec<u8>>, SvnError> {
        let mut lease = self.lease("rev-prop").await?;
        let result = lease.conn.revision_property(rev, name.to_string()).await;
        lease.finish(result)
    }

    /// Sets (`Some`) or deletes (`None`) a property of revision `rev`.
    pub async fn change_revision_property(
        &mut self,
        rev: u64,
        name: &str,
        value: Option<Vec<u8>>,
    ) -> Result<(), SvnError> {
        let mut lease = self.lease("change-rev-prop").await?;
        let result = lease
            .conn
            .change_revision_property(rev, name.to_string(), value)
            .await;
        lease.finish(result)
    }

    /// Youngest revision committed at or before `date`; `0` when the
    /// repository is younger than `date`.
    pub async fn dated_revision(&mut self, date: DateTime<Utc>) -> Result<u64, SvnError> {
        let mut lease = self.lease("get-dated-rev").await?;
        let result = lease.conn.dated_revision(date).await;
        lease.finish(result)
    }

    /// Traces the node at `path` in `peg_rev` back to each of `revs`.
    ///
    /// The result is ordered newest first. Revisions younger than `peg_rev`,
    /// or in which the node did not exist yet, are left out of it.
    pub async fn locations(
        &mut self,
        path: &str,
        peg_rev: u64,
        revs: &[u64],
    ) -> Result<Vec<Location>, SvnError> {
        let path = validate_rel_dir_path(path)?;
        let mut lease = self.lease("get-locations").await?;
        let result = lease
            .conn
            .locations(path, peg_rev, revs.to_vec())
            .await
            .map(|mut locations| {
                locations.sort_by(|a, b| b.rev.cmp(&a.rev));
                locations
            });
        lease.finish(result)
    }

    /// History of file `path` as content deltas, oldest first.
    ///
    /// The first entry is the last change at or before `start_rev` (`0` when
    /// `None`) and carries the full content as a delta against nothing;
    /// `end_rev` defaults to HEAD.
    pub async fn file_revisions(
        &mut self,
        path: &str,
        start_rev: Option<u64>,
        end_rev: Option<u64>,
    ) -> Result<Vec<FileRevision>, SvnError> {
        let path = validate_rel_path(path)?;
        let mut lease = self.lease("get-file-revs").await?;
        let result = lease.conn.file_revisions(path, start_rev, end_rev).await;
        lease.finish(result)
    }

    /// Lock on file `path`, or `None` when it is not locked.
    pub async fn get_lock(&mut self, path: &str) -> Result<Option<Lock>, SvnError> {
        let path = validate_rel_path(path)?;
        let mut lease = self.lease("get-lock").await?;
        let result = lease.conn.get_lock(path).await;
        lease.finish(result)
    }

    /// Locks on `path` and below it, down to `depth`.
    pub async fn get_locks(&mut self, path: &str, depth: Depth) -> Result<Vec<Lock>, SvnError> {
        let path = validate_rel_dir_path(path)?;
        let mut lease = self.lease("get-locks").await?;
        let result = lease.conn.get_locks(path, depth).await;
        lease.finish(result)
    }

    /// Locks file `path` for the session user and returns the new lock.
    pub async fn lock(&mut self, path: &str, options: LockOptions) -> Result<Lock, SvnError> {
        let path = validate_rel_path(path)?;
        let mut lease = self.lease("lock").await?;
        let result = lease.conn.lock(path, options).await;
        lease.finish(result)
    }

    /// Releases the lock on file `path`, or breaks it with
    /// [`UnlockOptions::breaking`].
    pub async fn unlock(&mut self, path: &str, options: UnlockOptions) -> Result<(), SvnError> {
        let path = validate_rel_path(path)?;
        let mut lease = self.lease("unlock").await?;
        let result = lease.conn.unlock(path, options).await;
        lease.finish(result)
    }

    /// Drives `editor` with the full tree of the session URL at `rev`.
    ///
    /// Fails with [`SvnError::NodeConflict`] when the URL names a file.
    pub async fn checkout(
        &mut self,
        rev: Option<u64>,
        depth: Depth,
        editor: &mut dyn TreeEditor,
    ) -> Result<(), SvnError> {
        let mut lease = self.lease("checkout").await?;
        let result = checkout_on(lease.conn.as_mut(), rev, depth, editor).await;
        lease.finish(result)
    }

    /// Brings the state described by `baton` to `options.scope.rev`.
    pub async fn update(
        &mut self,
        options: UpdateOptions,
        baton: &mut dyn ReporterBaton,
        editor: &mut dyn TreeEditor,
    ) -> Result<(), SvnError> {
        self.report(ReportRequest::Update(options), baton, editor)
            .await
    }

    /// Like [`RepositorySession::update`], towards `options.switch_url`.
    pub async fn switch(
        &mut self,
        options: SwitchOptions,
        baton: &mut dyn ReporterBaton,
        editor: &mut dyn TreeEditor,
    ) -> Result<(), SvnError> {
        SvnUrl::parse(&options.switch_url)?;
        self.report(ReportRequest::Switch(options), baton, editor)
            .await
    }

    /// Describes what changed relative to `baton` without file content.
    pub async fn status(
        &mut self,
        options: StatusOptions,
        baton: &mut dyn ReporterBaton,
        editor: &mut dyn TreeEditor,
    ) -> Result<(), SvnError> {
        self.report(ReportRequest::Status(options), baton, editor)
            .await
    }

    /// Describes the differences between `baton` and `options.versus_url`.
    pub async fn diff(
        &mut self,
        options: DiffOptions,
        baton: &mut dyn ReporterBaton,
        editor: &mut dyn TreeEditor,
    ) -> Result<(), SvnError> {
        SvnUrl::parse(&options.versus_url)?;
        self.report(ReportRequest::Diff(options), baton, editor)
            .await
    }

    async fn report(
        &mut self,
        request: ReportRequest,
        baton: &mut dyn ReporterBaton,
        editor: &mut dyn TreeEditor,
    ) -> Result<(), SvnError> {
        if !request.target().is_empty() {
            let target = validate_rel_path(request.target())?;
            if target.contains('/') {
                return Err(SvnError::InvalidPath(format!(
                    "update target must be a single entry: {target}"
                )));
            }
        }
        // A report that fails or aborts never reaches the transport.
        let mut builder = ReportBuilder::new();
        baton.report(&mut builder)?;
        let report = builder.finish()?;

        let op = request.command();
        let mut lease = self.lease(op).await?;
        debug!(op, rev = ?request.rev(), claims = report.claims().count(), "sending report");
        let result = lease.conn.run_report(request, report, editor).await;
        if result.is_err() {
            let _ = editor.abort_edit().await;
        }
        lease.finish(result)
    }

    /// Starts a commit against the session URL.
    ///
    /// The session stays busy until the returned editor is closed, aborted
    /// or dropped.
    pub async fn get_commit_editor(
        &mut self,
        options: CommitOptions,
        mediator: Box<dyn WorkspaceMediator>,
    ) -> Result<CommitEditor, SvnError> {
        let mut lease = self.lease("commit").await?;
        match lease.conn.begin_commit(options, mediator).await {
            Ok(()) => Ok(CommitEditor {
                lease: Some(lease),
                state: EditorState::new(),
            }),
            Err(err) => lease.finish(Err(err)),
        }
    }
}

async fn checkout_on(
    conn: &mut dyn Connection,
    rev: Option<u64>,
    depth: Depth,
    editor: &mut dyn TreeEditor,
) -> Result<(), SvnError> {
    let rev = match rev {
        Some(rev) => rev,
        None => conn.latest_revision().await?,
    };
    match conn.check_path(String::new(), Some(rev)).await? {
        NodeKind::Dir => {}
        kind => {
            return Err(SvnError::conflict(
                "",
                format!("cannot check out a {kind} at r{rev}"),
            ));
        }
    }
    let mut report = Report::new();
    report.push(ReportCommand::SetPath {
        path: String::new(),
        rev,
        start_empty: true,
        lock_token: None,
        depth,
    });
    report.finish();
    let options = UpdateOptions::new("", depth).with_rev(rev);
    let result = conn
        .run_report(ReportRequest::Update(options), report, editor)
        .await;
    if result.is_err() {
        let _ = editor.abort_edit().await;
    }
    result
}

/// Tees written bytes into an MD5 digest.
struct HashingWriter<'a, W> {
    inner: &'a mut W,
    digest: Md5,
}

impl<'a, W> HashingWriter<'a, W> {
    fn new(inner: &'a mut W) -> Self {
        Self {
            inner,
            digest: Md5::new(),
        }
    }

    fn finish(self) -> String {
        hex::encode(self.digest.finalize())
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for HashingWriter<'_, W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let poll = Pin::new(&mut *this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &poll {
            this.digest.update(&buf[..*n]);
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_shutdown(cx)
    }
}

/// Editor for one commit, returned by [`RepositorySession::get_commit_editor`].
///
/// Calls are checked locally and then forwarded to the connection. The
/// connection returns to the session after `close_edit` or `abort_edit`;
/// dropping the editor before either counts as an abort and closes the
/// session.
pub struct CommitEditor {
    lease: Option<Lease>,
    state: EditorState,
}

impl std::fmt::Debug for CommitEditor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitEditor")
            .field("state", &self.state)
            .field("holds_connection", &self.lease.is_some())
            .finish()
    }
}

impl CommitEditor {
    fn remote(&mut self) -> Result<&mut dyn TreeEditor, SvnError> {
        self.lease
            .as_mut()
            .and_then(|lease| lease.conn.commit_editor())
            .ok_or_else(|| SvnError::ProtocolViolation("commit already finished".into()))
    }

    /// Poisons the local state on error and gives up the connection after
    /// a transport failure.
    fn settle<T>(&mut self, result: Result<T, SvnError>) -> Result<T, SvnError> {
        if let Err(err) = &result
            && err.is_transport()
        {
            // Dropping an unfinished lease closes the session.
            self.lease = None;
        }
        self.state.guard(result)
    }

    fn release(&mut self) {
        if let Some(lease) = self.lease.take() {
            let _ = lease.finish(Ok(()));
        }
    }
}

impl TreeEditor for CommitEditor {
    fn target_revision(&mut self, rev: u64) -> EditFuture<'_> {
        Box::pin(async move {
            self.state.target_revision(rev)?;
            let result = match self.remote() {
                Ok(remote) => remote.target_revision(rev).await,
                Err(err) => Err(err),
            };
            self.settle(result)
        })
    }

    fn open_root(&mut self, base_rev: Option<u64>) -> EditFuture<'_> {
        Box::pin(async move {
            self.state.open_root(base_rev)?;
            let result = match self.remote() {
                Ok(remote) => remote.open_root(base_rev).await,
                Err(err) => Err(err),
            };
            self.settle(result)
        })
    }

    fn delete_entry(&mut self, path: String, rev: Option<u64>) -> EditFuture<'_> {
        Box::pin(async move {
            self.state.delete_entry(&path)?;
            let result = match self.remote() {
                Ok(remote) => remote.delete_entry(path, rev).await,
                Err(err) => Err(err),
            };
            self.settle(result)
        })
    }

    fn add_dir(&mut self, path: String, copy_from: Option<CopyFrom>) -> EditFuture<'_> {
        Box::pin(async move {
            self.state.add_dir(&path, copy_from.as_ref())?;
            let result = match self.remote() {
                Ok(remote) => remote.add_dir(path, copy_from).await,
                Err(err) => Err(err),
            };
            self.settle(result)
        })
    }

    fn open_dir(&mut self, path: String, base_rev: Option<u64>) -> EditFuture<'_> {
        Box::pin(async move {
            self.state.open_dir(&path, base_rev)?;
            let result = match self.remote() {
                Ok(remote) => remote.open_dir(path, base_rev).await,
                Err(err) => Err(err),
            };
            self.settle(result)
        })
    }

    fn change_dir_property(
        &mut self,
        name: PropName,
        value: Option<Vec<u8>>,
    ) -> EditFuture<'_> {
        Box::pin(async move {
            self.state.change_dir_property()?;
            let result = match self.remote() {
                Ok(remote) => remote.change_dir_property(name, value).await,
                Err(err) => Err(err),
            };
            self.settle(result)
        })
    }

    fn close_dir(&mut self) -> EditFuture<'_> {
        Box::pin(async move {
            self.state.close_dir()?;
            let result = match self.remote() {
                Ok(remote) => remote.close_dir().await,
                Err(err) => Err(err),
            };
            self.settle(result)
        })
    }

    fn absent_dir(&mut self, path: String) -> EditFuture<'_> {
        Box::pin(async move {
            self.state.absent(&path)?;
            let result = match self.remote() {
                Ok(remote) => remote.absent_dir(path).await,
                Err(err) => Err(err),
            };
            self.settle(result)
        })
    }

    fn add_file(&mut self, path: String, copy_from: Option<CopyFrom>) -> EditFuture<'_> {
        Box::pin(async move {
            self.state.add_file(&path, copy_from.as_ref())?;
            let result = match self.remote() {
                Ok(remote) => remote.add_file(path, copy_from).await,
                Err(err) => Err(err),
            };
            self.settle(result)
        })
    }

    fn open_file(&mut self, path: String, base_rev: Option<u64>) -> EditFuture<'_> {
        Box::pin(async move {
            self.state.open_file(&path, base_rev)?;
            let result = match self.remote() {
                Ok(remote) => remote.open_file(path, base_rev).await,
                Err(err) => Err(err),
            };
            self.settle(result)
        })
    }

    fn apply_text_delta(&mut self, base_checksum: Option<String>) -> EditFuture<'_> {
        Box::pin(async move {
            self.state.apply_text_delta()?;
            let result = match self.remote() {
                Ok(remote) => remote.apply_text_delta(base_checksum).await,
                Err(err) => Err(err),
            };
            self.settle(result)
        })
    }

    fn text_delta_chunk(&mut self, window: DiffWindow) -> EditFuture<'_> {
        Box::pin(async move {
            self.state.text_delta_chunk()?;
            let result = match self.remote() {
                Ok(remote) => remote.text_delta_chunk(window).await,
                Err(err) => Err(err),
            };
            self.settle(result)
        })
    }

    fn text_delta_end(&mut self) -> EditFuture<'_> {
        Box::pin(async move {
            self.state.text_delta_end()?;
            let result = match self.remote() {
                Ok(remote) => remote.text_delta_end().await,
                Err(err) => Err(err),
            };
            self.settle(result)
        })
    }

    fn change_file_property(
        &mut self,
        name: PropName,
        value: Option<Vec<u8>>,
    ) -> EditFuture<'_> {
        Box::pin(async move {
            self.state.change_file_property()?;
            let result = match self.remote() {
                Ok(remote) => remote.change_file_property(name, value).await,
                Err(err) => Err(err),
            };
            self.settle(result)
        })
    }

    fn close_file(&mut self, text_checksum: Option<String>) -> EditFuture<'_> {
        Box::pin(async move {
            self.state.close_file()?;
            let result = match self.remote() {
                Ok(remote) => remote.close_file(text_checksum).await,
                Err(err) => Err(err),
            };
            self.settle(result)
        })
    }

    fn absent_file(&mut self, path: String) -> EditFuture<'_> {
        Box::pin(async move {
            self.state.absent(&path)?;
            let result = match self.remote() {
                Ok(remote) => remote.absent_file(path).await,
                Err(err) => Err(err),
            };
            self.settle(result)
        })
    }

    fn close_edit(&mut self) -> EditFuture<'_, Option<CommitInfo>> {
        Box::pin(async move {
            self.state.close_edit()?;
            let result = match self.remote() {
                Ok(remote) => remote.close_edit().await,
                Err(err) => Err(err),
            };
            let result = self.settle(result);
            match &result {
                Ok(info) => {
                    debug!(rev = ?info.as_ref().map(|i| i.new_rev), "commit finished");
                    self.release();
                }
                Err(err) => {
                    // The remote transaction is gone either way.
                    warn!(error = %err, "commit failed");
                    if let Ok(remote) = self.remote() {
                        let _ = remote.abort_edit().await;
                    }
                    self.release();
                }
            }
            result
        })
    }

    fn abort_edit(&mut self) -> EditFuture<'_> {
        Box::pin(async move {
            if !self.state.abort() && self.lease.is_none() {
                return Ok(());
            }
            let result = match self.remote() {
                Ok(remote) => remote.abort_edit().await,
                Err(_) => Ok(()),
            };
            match result {
                Ok(()) => {
                    self.release();
                    Ok(())
                }
                Err(err) => {
                    self.lease = None;
                    Err(err)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::mem::{MemConnector, MemRepository};
    use crate::{MemoryExport, MemoryMediator, RecordingEditor, WorkingCopyState};

    fn run_async<T>(f: impl std::future::Future<Output = T>) -> T {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(f)
    }

    fn registry(repo: &MemRepository) -> TransportRegistry {
        let connector = MemConnector::new().with_repository("repo", repo.clone());
        TransportRegistry::new().with("mem", Arc::new(connector))
    }

    async fn commit_file(session: &mut RepositorySession, path: &str, data: &[u8]) -> u64 {
        let mut editor = session
            .get_commit_editor(CommitOptions::new("add"), Box::new(MemoryMediator::new()))
            .await
            .unwrap();
        editor.open_root(None).await.unwrap();
        editor.add_file(path.to_string(), None).await.unwrap();
        let md5 = crate::send_file_delta(&mut editor, None, b"", data)
            .await
            .unwrap();
        editor.close_file(Some(md5)).await.unwrap();
        editor.close_dir().await.unwrap();
        editor.close_edit().await.unwrap().unwrap().new_rev
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        run_async(async {
            let err = RepositorySession::open("http://host/repo", SessionConfig::new(), &TransportRegistry::new())
                .await
                .unwrap_err();
            assert!(matches!(err, SvnError::UnsupportedScheme(s) if s == "http"));
        });
    }

    #[test]
    fn open_connects_and_close_drops_connection() {
        run_async(async {
            let repo = MemRepository::new();
            let mut session =
                RepositorySession::open("mem://repo/", SessionConfig::new(), &registry(&repo))
                    .await
                    .unwrap();
            assert_eq!(session.state(), SessionState::Connected);
            assert_eq!(session.repository_info().unwrap().uuid, repo.uuid());
            session.close().unwrap();
            assert_eq!(session.state(), SessionState::Closed);
            assert_eq!(session.latest_revision().await.unwrap(), 0);
            assert_eq!(session.state(), SessionState::Connected);
        });
    }

    #[test]
    fn commit_editor_blocks_other_calls_until_closed() {
        run_async(async {
            let repo = MemRepository::new();
            let mut session =
                RepositorySession::open("mem://repo/", SessionConfig::new(), &registry(&repo))
                    .await
                    .unwrap();
            let mut editor = session
                .get_commit_editor(CommitOptions::new("msg"), Box::new(MemoryMediator::new()))
                .await
                .unwrap();
            assert_eq!(session.state(), SessionState::OperationInProgress);
            assert!(matches!(
                session.latest_revision().await.unwrap_err(),
                SvnError::Reentrancy(_)
            ));
            assert!(matches!(session.close().unwrap_err(), SvnError::Reentrancy(_)));

            editor.open_root(None).await.unwrap();
            editor.close_dir().await.unwrap();
            let info = editor.close_edit().await.unwrap().unwrap();
            assert_eq!(info.new_rev, 1);
            assert_eq!(session.state(), SessionState::Connected);
            assert_eq!(session.latest_revision().await.unwrap(), 1);
        });
    }

    #[test]
    fn dropping_commit_editor_aborts_and_closes() {
        run_async(async {
            let repo = MemRepository::new();
            let mut session =
                RepositorySession::open("mem://repo/", SessionConfig::new(), &registry(&repo))
                    .await
                    .unwrap();
            {
                let mut editor = session
                    .get_commit_editor(CommitOptions::new("msg"), Box::new(MemoryMediator::new()))
                    .await
                    .unwrap();
                editor.open_root(None).await.unwrap();
                editor.add_dir("lost".into(), None).await.unwrap();
            }
            assert_eq!(session.state(), SessionState::Closed);
            assert_eq!(session.latest_revision().await.unwrap(), 0);
            assert_eq!(repo.youngest(), 0);
        });
    }

    #[test]
    fn aborted_commit_returns_connection() {
        run_async(async {
            let repo = MemRepository::new();
            let mut session =
                RepositorySession::open("mem://repo/", SessionConfig::new(), &registry(&repo))
                    .await
                    .unwrap();
            let mut editor = session
                .get_commit_editor(CommitOptions::new("msg"), Box::new(MemoryMediator::new()))
                .await
                .unwrap();
            editor.open_root(None).await.unwrap();
            editor.add_dir("gone".into(), None).await.unwrap();
            editor.abort_edit().await.unwrap();
            editor.abort_edit().await.unwrap();
            assert_eq!(session.state(), SessionState::Connected);
            assert_eq!(repo.youngest(), 0);
        });
    }

    #[test]
    fn get_file_verifies_and_streams() {
        run_async(async {
            let repo = MemRepository::new();
            let mut session =
                RepositorySession::open("mem://repo/", SessionConfig::new(), &registry(&repo))
                    .await
                    .unwrap();
            let rev = commit_file(&mut session, "a.txt", b"hello").await;
            let mut out = Vec::new();
            let contents = session.get_file("a.txt", None, &mut out).await.unwrap();
            assert_eq!(out, b"hello");
            assert_eq!(contents.rev, rev);
            assert_eq!(contents.checksum.as_deref(), Some(crate::md5_hex(b"hello").as_str()));
        });
    }

    #[test]
    fn checkout_of_file_url_is_a_conflict() {
        run_async(async {
            let repo = MemRepository::new();
            let reg = registry(&repo);
            let mut session = RepositorySession::open("mem://repo/", SessionConfig::new(), &reg)
                .await
                .unwrap();
            commit_file(&mut session, "f", b"x").await;

            let mut file_session = RepositorySession::open("mem://repo/f", SessionConfig::new(), &reg)
                .await
                .unwrap();
            let mut export = MemoryExport::new();
            let err = file_session
                .checkout(None, Depth::Infinity, &mut export)
                .await
                .unwrap_err();
            assert!(matches!(err, SvnError::NodeConflict { .. }));
            assert_eq!(file_session.state(), SessionState::Connected);
        });
    }

    #[test]
    fn aborted_report_never_reaches_the_editor() {
        run_async(async {
            let repo = MemRepository::new();
            let mut session =
                RepositorySession::open("mem://repo/", SessionConfig::new(), &registry(&repo))
                    .await
                    .unwrap();
            let mut editor = RecordingEditor::new();
            let mut baton = |reporter: &mut dyn crate::Reporter| {
                reporter.set_path("", None, 0, Depth::Infinity, false)?;
                reporter.abort_report()
            };
            let err = session
                .update(UpdateOptions::new("", Depth::Infinity), &mut baton, &mut editor)
                .await
                .unwrap_err();
            assert!(matches!(err, SvnError::Cancelled));
            assert!(editor.events().is_empty());
            assert_eq!(session.state(), SessionState::Connected);
        });
    }

    #[test]
    fn update_target_must_be_one_entry() {
        run_async(async {
            let repo = MemRepository::new();
            let mut session =
                RepositorySession::open("mem://repo/", SessionConfig::new(), &registry(&repo))
                    .await
                    .unwrap();
            let mut state = WorkingCopyState::new(0, Depth::Infinity);
            let err = session
                .update(
                    UpdateOptions::new("a/b", Depth::Infinity),
                    &mut state,
                    &mut RecordingEditor::new(),
                )
                .await
                .unwrap_err();
            assert!(matches!(err, SvnError::InvalidPath(_)));
        });
    }
}
