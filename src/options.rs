//! Builder-style configuration and option types.

use std::time::Duration;

use crate::{Depth, PropertyList};

/// Connection settings shared by every transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// User to authenticate as; also the author of commits and locks.
    pub username: Option<String>,
    /// Secret for `username`.
    pub password: Option<String>,
    /// Upper bound on establishing the TCP connection.
    pub connect_timeout: Duration,
    /// Upper bound on waiting for the next byte from the server.
    pub read_timeout: Duration,
    /// Upper bound on flushing one request.
    pub write_timeout: Duration,
    /// Client string sent in the `svn://` greeting.
    pub ra_client: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(60),
            ra_client: format!("svn-ra/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl SessionConfig {
    /// Anonymous access with the default timeouts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Authenticates as `username`.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Applies one timeout to connecting, reading and writing.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self.read_timeout = timeout;
        self.write_timeout = timeout;
        self
    }

    /// Overrides the read timeout alone.
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }
}

/// What a log query covers.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogOptions {
    /// Paths below the session URL; empty means the session URL itself.
    pub target_paths: Vec<String>,
    /// First revision reported; `None` is HEAD.
    pub start_rev: Option<u64>,
    /// Last revision reported; `None` is HEAD.
    pub end_rev: Option<u64>,
    /// Fill [`crate::LogEntry::changed_paths`].
    pub changed_paths: bool,
    /// Stop following a path at the revision it was copied in.
    pub strict_node: bool,
    /// Stop after this many entries; `0` is no limit.
    pub limit: u64,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            target_paths: Vec::new(),
            start_rev: None,
            end_rev: None,
            changed_paths: true,
            strict_node: false,
            limit: 0,
        }
    }
}

impl LogOptions {
    /// Entries from `start_rev` to `end_rev`, newest first when
    /// `start_rev > end_rev`.
    pub fn between(start_rev: u64, end_rev: u64) -> Self {
        Self {
            start_rev: Some(start_rev),
            end_rev: Some(end_rev),
            ..Self::default()
        }
    }

    /// Only revisions touching one of `paths`.
    pub fn with_paths(mut self, paths: Vec<String>) -> Self {
        self.target_paths = paths;
        self
    }

    /// At most `limit` entries.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    /// Turns changed-path lists on or off.
    pub fn with_changed_paths(mut self, changed_paths: bool) -> Self {
        self.changed_paths = changed_paths;
        self
    }
}

/// The part of the tree a report-driven edit covers.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReportScope {
    /// A single entry name below the session URL, or `""` for all of it.
    pub target: String,
    /// Revision the edit leads to; `None` is HEAD.
    pub rev: Option<u64>,
    /// How far below `target` the edit reaches.
    pub depth: Depth,
}

impl ReportScope {
    fn new(target: impl Into<String>, depth: Depth) -> Self {
        Self {
            target: target.into(),
            rev: None,
            depth,
        }
    }
}

/// Parameters of [`crate::RepositorySession::update`].
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Target, revision and depth.
    pub scope: ReportScope,
    /// Let added nodes name the node they were copied from.
    pub send_copyfrom_args: bool,
    /// Treat unrelated nodes at the same path as replacements of each other.
    pub ignore_ancestry: bool,
}

impl UpdateOptions {
    /// Updates `target` to HEAD.
    pub fn new(target: impl Into<String>, depth: Depth) -> Self {
        Self {
            scope: ReportScope::new(target, depth),
            send_copyfrom_args: false,
            ignore_ancestry: false,
        }
    }

    /// Updates to `rev` instead of HEAD.
    pub fn with_rev(mut self, rev: u64) -> Self {
        self.scope.rev = Some(rev);
        self
    }

    /// Asks for copy-from arguments on added nodes.
    pub fn with_copyfrom_args(mut self) -> Self {
        self.send_copyfrom_args = true;
        self
    }
}

/// Parameters of [`crate::RepositorySession::switch`].
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwitchOptions {
    /// Target, revision and depth.
    pub scope: ReportScope,
    /// Repository URL the target ends up pointing at.
    pub switch_url: String,
    /// Treat unrelated nodes at the same path as replacements of each other.
    pub ignore_ancestry: bool,
}

impl SwitchOptions {
    /// Switches `target` to HEAD of `switch_url`.
    pub fn new(target: impl Into<String>, switch_url: impl Into<String>, depth: Depth) -> Self {
        Self {
            scope: ReportScope::new(target, depth),
            switch_url: switch_url.into(),
            ignore_ancestry: false,
        }
    }

    /// Switches to `rev` instead of HEAD.
    pub fn with_rev(mut self, rev: u64) -> Self {
        self.scope.rev = Some(rev);
        self
    }
}

/// Parameters of [`crate::RepositorySession::status`].
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusOptions {
    /// Target, revision and depth.
    pub scope: ReportScope,
}

impl StatusOptions {
    /// Compares `target` against HEAD.
    pub fn new(target: impl Into<String>, depth: Depth) -> Self {
        Self {
            scope: ReportScope::new(target, depth),
        }
    }

    /// Compares against `rev` instead of HEAD.
    pub fn with_rev(mut self, rev: u64) -> Self {
        self.scope.rev = Some(rev);
        self
    }
}

/// Parameters of [`crate::RepositorySession::diff`].
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiffOptions {
    /// Target, revision (of `versus_url`) and depth.
    pub scope: ReportScope,
    /// Repository URL the reported state is compared with.
    pub versus_url: String,
    /// Treat unrelated nodes at the same path as replacements of each other.
    pub ignore_ancestry: bool,
    /// Send file content as delta windows; `false` only flags changed files.
    pub text_deltas: bool,
}

impl DiffOptions {
    /// Compares `target` with HEAD of `versus_url`, content included.
    pub fn new(target: impl Into<String>, versus_url: impl Into<String>, depth: Depth) -> Self {
        Self {
            scope: ReportScope::new(target, depth),
            versus_url: versus_url.into(),
            ignore_ancestry: false,
            text_deltas: true,
        }
    }

    /// Compares with `rev` instead of HEAD.
    pub fn with_rev(mut self, rev: u64) -> Self {
        self.scope.rev = Some(rev);
        self
    }

    /// Turns content deltas on or off.
    pub fn with_text_deltas(mut self, text_deltas: bool) -> Self {
        self.text_deltas = text_deltas;
        self
    }
}

/// A lock token presented with a commit.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitLockToken {
    /// Locked file, relative to the session URL.
    pub path: String,
    /// Token returned when the lock was taken.
    pub token: String,
}

impl CommitLockToken {
    /// Pairs `path` with `token`.
    pub fn new(path: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            token: token.into(),
        }
    }
}

/// Parameters of [`crate::RepositorySession::get_commit_editor`].
///
/// `svn:log` always comes from `log_message`, even when `rev_props` names it.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitOptions {
    /// Log message of the new revision.
    pub log_message: String,
    /// Tokens for locked files the commit touches.
    pub lock_tokens: Vec<CommitLockToken>,
    /// Keep those locks after the commit instead of releasing them.
    pub keep_locks: bool,
    /// Further properties of the new revision.
    pub rev_props: PropertyList,
}

impl CommitOptions {
    /// A commit with `log_message` and nothing else.
    pub fn new(log_message: impl Into<String>) -> Self {
        Self {
            log_message: log_message.into(),
            lock_tokens: Vec::new(),
            keep_locks: false,
            rev_props: PropertyList::new(),
        }
    }

    /// Presents `lock_tokens` to the repository.
    pub fn with_lock_tokens(mut self, lock_tokens: Vec<CommitLockToken>) -> Self {
        self.lock_tokens = lock_tokens;
        self
    }

    /// Keeps the presented locks once the commit lands.
    pub fn keep_locks(mut self) -> Self {
        self.keep_locks = true;
        self
    }

    /// Sets additional revision properties.
    pub fn with_rev_props(mut self, rev_props: PropertyList) -> Self {
        self.rev_props = rev_props;
        self
    }
}

/// Parameters of [`crate::RepositorySession::lock`].
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LockOptions {
    /// Stored with the lock.
    pub comment: Option<String>,
    /// Take the lock over even when someone else holds it.
    pub steal_lock: bool,
    /// Refuse the lock when the file changed after this revision.
    pub current_rev: Option<u64>,
}

impl LockOptions {
    /// A plain lock request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches `comment` to the lock.
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Steals an existing lock.
    pub fn steal(mut self) -> Self {
        self.steal_lock = true;
        self
    }

    /// Requires the file to be unchanged since `rev`.
    pub fn with_current_rev(mut self, rev: u64) -> Self {
        self.current_rev = Some(rev);
        self
    }
}

/// Parameters of [`crate::RepositorySession::unlock`].
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UnlockOptions {
    /// Token of the lock being released; needed unless `break_lock` is set.
    pub token: Option<String>,
    /// Remove the lock whoever holds it.
    pub break_lock: bool,
}

impl UnlockOptions {
    /// Releases the lock identified by `token`.
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            break_lock: false,
        }
    }

    /// Breaks the lock without its token.
    pub fn breaking() -> Self {
        Self {
            token: None,
            break_lock: true,
        }
    }
}
