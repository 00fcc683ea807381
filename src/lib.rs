//! Async Subversion repository access: the editor and reporter protocols,
//! delta windows, and sessions that drive them over pluggable transports.
//!
//! A [`RepositorySession`] is opened for a URL through an explicit
//! [`TransportRegistry`]. Read operations (checkout, update, switch, status,
//! diff) drive a caller-supplied [`TreeEditor`] while the caller describes
//! its current state through a [`Reporter`]. Commits hand the caller a
//! [`CommitEditor`] to drive instead. File content always travels as
//! [`DiffWindow`]s, applied with a [`DeltaApplier`].
//!
//! ## Getting started
//!
//! ```rust,no_run
//! use svn_ra::{Depth, MemoryExport, RepositorySession, SessionConfig, TransportRegistry};
//!
//! fn main() -> svn_ra::Result<()> {
//!     let rt = tokio::runtime::Builder::new_current_thread()
//!         .enable_all()
//!         .build()?;
//!
//!     rt.block_on(async {
//!         let registry = TransportRegistry::with_defaults();
//!         let mut session =
//!             RepositorySession::open("svn://example.com/repo", SessionConfig::new(), &registry)
//!                 .await?;
//!         let latest = session.latest_revision().await?;
//!
//!         let mut export = MemoryExport::new();
//!         session.checkout(Some(latest), Depth::Infinity, &mut export).await?;
//!         println!("{} files", export.files().count());
//!         Ok(())
//!     })
//! }
//! ```
//!
//! ## Transports
//!
//! - `svn://` speaks the `svnserve` protocol with `ANONYMOUS`, `PLAIN` and
//!   `CRAM-MD5` authentication.
//! - `mem://name/` is an in-memory repository meant for tests; see
//!   [`mem::MemRepository`].
//!
//! ## Features
//!
//! - `serde`: enables `Serialize`/`Deserialize` for public data types.
//!
//! ## Low-level access
//!
//! For raw wire protocol items, see [`raw::SvnItem`].

#![deny(unsafe_code)]

mod deltagen;
mod editor;
mod error;
mod export;
pub mod mem;
mod mediator;
mod options;
mod path;
mod rasvn;
mod reporter;
mod session;
mod svndiff;
mod textdelta;
mod types;
mod url;
mod window;

pub use deltagen::{generate, send_file_delta};
pub use editor::{
    EditFuture, EditorEvent, EditorState, Frame, FrameKind, RecordingEditor, TreeEditor,
    dispatch, ready,
};
pub use error::{DeltaError, ServerError, ServerErrorItem, SvnError};
pub use export::{ExportedNode, FsExport, MemoryExport};
pub use mediator::{FsMediator, MemoryMediator, WorkspaceMediator};
/// Convenience alias for results returned by this crate.
pub type Result<T> = std::result::Result<T, SvnError>;
pub use options::{
    CommitLockToken, CommitOptions, DiffOptions, LockOptions, LogOptions, ReportScope,
    SessionConfig, StatusOptions, SwitchOptions, UnlockOptions, UpdateOptions,
};
/// Low-level wire-protocol types and helpers.
pub mod raw {
    pub use crate::rasvn::SvnItem;
}
pub use reporter::{
    Report, ReportBuilder, ReportCommand, Reporter, ReporterBaton, WorkingCopyState,
};
pub use session::{
    CommitEditor, Connection, Connector, ReportRequest, RepositorySession, SessionState,
    TransportRegistry,
};
pub use textdelta::{AppliedDelta, DeltaApplier, RandomAccess, apply_windows, md5_hex};
pub use types::{
    ChangedPath, CommitInfo, CopyFrom, Depth, DirEntry, DirListing, ENTRY_COMMITTED_DATE,
    ENTRY_COMMITTED_REV, ENTRY_LAST_AUTHOR, FileContents, FileRevision, Location, Lock, LogEntry,
    NodeKind, PropChange, PropKind, PropName, PropertyList, RepositoryInfo,
};
pub use url::SvnUrl;
pub use window::{DELTA_WINDOW_MAX, DiffWindow, Instruction};
