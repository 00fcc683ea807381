//! Public data types shared by editors, reporters and sessions.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

/// A Subversion property list (`name -> raw bytes`).
///
/// Property values can be binary; callers should treat the value as opaque
/// bytes unless they know it is UTF-8.
pub type PropertyList = BTreeMap<String, Vec<u8>>;

/// Namespace a property name belongs to.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PropKind {
    /// A regular versioned property (`svn:eol-style`, `owner`, ...).
    Versioned,
    /// Client-side bookkeeping (`svn:wc:*`), never versioned.
    Workspace,
    /// Node metadata supplied by the repository (`svn:entry:*`).
    Entry,
}

impl PropKind {
    const WORKSPACE_PREFIX: &'static str = "svn:wc:";
    const ENTRY_PREFIX: &'static str = "svn:entry:";

    /// Classifies a raw property name.
    pub fn classify(name: &str) -> Self {
        if name.starts_with(Self::WORKSPACE_PREFIX) {
            Self::Workspace
        } else if name.starts_with(Self::ENTRY_PREFIX) {
            Self::Entry
        } else {
            Self::Versioned
        }
    }
}

/// A property name tagged with its [`PropKind`].
///
/// The namespace is decided once, when the name enters the crate, so
/// editors dispatch on [`PropName::kind`] instead of string prefixes.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropName {
    kind: PropKind,
    name: String,
}

impl PropName {
    /// Classifies and wraps `name`.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            kind: PropKind::classify(&name),
            name,
        }
    }

    /// Returns the namespace of this property.
    pub fn kind(&self) -> PropKind {
        self.kind
    }

    /// Returns the full property name.
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// Consumes the wrapper and returns the full property name.
    pub fn into_string(self) -> String {
        self.name
    }
}

impl From<&str> for PropName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for PropName {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl Display for PropName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Entry property carrying the last-changed revision of a node.
pub const ENTRY_COMMITTED_REV: &str = "svn:entry:committed-rev";
/// Entry property carrying the last-changed date of a node.
pub const ENTRY_COMMITTED_DATE: &str = "svn:entry:committed-date";
/// Entry property carrying the last author of a node.
pub const ENTRY_LAST_AUTHOR: &str = "svn:entry:last-author";

/// Copy source of an added node.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CopyFrom {
    /// Source path (relative to the session root).
    pub path: String,
    /// Source revision.
    pub revision: u64,
}

impl CopyFrom {
    /// Creates a copy source.
    pub fn new(path: impl Into<String>, revision: u64) -> Self {
        Self {
            path: path.into(),
            revision,
        }
    }
}

/// Repository metadata returned by the server.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepositoryInfo {
    /// Repository UUID.
    pub uuid: String,
    /// Repository root URL.
    ///
    /// Some older servers may not provide a root URL during handshake; in that
    /// case this is an empty string.
    pub root_url: String,
    /// Server-reported capabilities.
    pub capabilities: Vec<String>,
}

/// A successful commit result returned by [`crate::TreeEditor::close_edit`].
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitInfo {
    /// The new committed revision number.
    pub new_rev: u64,
    /// Commit date, if provided by the server.
    pub date: Option<String>,
    /// Commit author, if provided by the server.
    pub author: Option<String>,
    /// Server-reported post-commit error, if any.
    pub post_commit_err: Option<String>,
}

/// Metadata returned by [`crate::RepositorySession::get_file`].
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileContents {
    /// The revision that was actually served.
    pub rev: u64,
    /// MD5 checksum of the contents, hex-encoded.
    pub checksum: Option<String>,
    /// Versioned file properties.
    pub props: PropertyList,
    /// Number of bytes streamed to the sink.
    pub bytes_written: u64,
}

/// A log entry returned by `log`.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    /// Revision number.
    pub rev: u64,
    /// Changed paths list (may be empty if not requested).
    pub changed_paths: Vec<ChangedPath>,
    /// Author, if provided.
    pub author: Option<String>,
    /// Date, if provided.
    pub date: Option<String>,
    /// Commit message, if provided.
    pub message: Option<String>,
}

/// A single path change entry within a [`LogEntry`].
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangedPath {
    /// Change action (`A`, `D`, `M` or `R`).
    pub action: String,
    /// Changed repository path (absolute, starting with `/`).
    pub path: String,
    /// Copy source path, if this change was made by a copy.
    pub copy_from_path: Option<String>,
    /// Copy source revision, if this change was made by a copy.
    pub copy_from_rev: Option<u64>,
    /// Node kind, if provided by the server.
    pub node_kind: Option<NodeKind>,
}

/// The kind of a node in the repository.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeKind {
    /// No node exists at the requested path/revision.
    None,
    /// A file node.
    File,
    /// A directory node.
    Dir,
}

impl NodeKind {
    pub(crate) fn from_word(word: &str) -> Option<Self> {
        match word {
            "none" => Some(Self::None),
            "file" => Some(Self::File),
            "dir" => Some(Self::Dir),
            _ => None,
        }
    }

    /// Returns the word used for this kind on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::File => "file",
            Self::Dir => "dir",
        }
    }
}

impl Display for NodeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A directory entry as returned by directory listing operations.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name (basename).
    pub name: String,
    /// Entry path relative to the session root.
    pub path: String,
    /// Node kind.
    pub kind: NodeKind,
    /// File size; always `0` for directories.
    pub size: u64,
    /// Whether the node carries versioned properties.
    pub has_props: bool,
    /// Revision in which the node last changed.
    pub created_rev: u64,
    /// Date of `created_rev`, if known.
    pub created_date: Option<String>,
    /// Author of `created_rev`, if known.
    pub last_author: Option<String>,
}

/// Result of [`crate::RepositorySession::get_dir`].
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirListing {
    /// The revision served.
    pub rev: u64,
    /// Versioned properties of the listed directory.
    pub props: PropertyList,
    /// Directory entries, sorted by name.
    pub entries: Vec<DirEntry>,
}

const SVN_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// `date` in the form used by `svn:date`.
pub(crate) fn format_svn_date(date: &chrono::DateTime<chrono::Utc>) -> String {
    date.format(SVN_DATE_FORMAT).to_string()
}

/// Reads an `svn:date` value; any RFC 3339 timestamp is accepted.
pub(crate) fn parse_svn_date(text: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(text.trim())
        .ok()
        .map(|date| date.with_timezone(&chrono::Utc))
}

/// A lock held on a file.
///
/// Dates use the same `YYYY-MM-DDTHH:MM:SS.ffffffZ` form as `svn:date`.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lock {
    /// Locked repository path (absolute, starting with `/`).
    pub path: String,
    /// Opaque token that proves ownership.
    pub token: String,
    /// User holding the lock.
    pub owner: String,
    /// Comment given when the lock was taken.
    pub comment: Option<String>,
    /// When the lock was taken.
    pub created: String,
    /// When the lock expires, if ever.
    pub expires: Option<String>,
}

/// Where a node lived in one revision; see
/// [`crate::RepositorySession::locations`].
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Location {
    /// The revision asked about.
    pub rev: u64,
    /// Repository path of the node in `rev` (absolute, starting with `/`).
    pub path: String,
}

/// A property set (`Some`) or deleted (`None`).
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropChange {
    /// Property name.
    pub name: String,
    /// New value; `None` deletes the property.
    pub value: Option<Vec<u8>>,
}

/// One revision in the history of a file.
///
/// `windows` turn the content of the previous entry (empty for the first)
/// into the content at `rev`; [`FileRevision::apply`] does exactly that.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileRevision {
    /// Repository path of the file in `rev` (absolute, starting with `/`).
    pub path: String,
    /// Revision that changed the file.
    pub rev: u64,
    /// Properties of `rev` itself.
    pub rev_props: PropertyList,
    /// File property changes relative to the previous entry.
    pub prop_changes: Vec<PropChange>,
    /// Whether the revision arrived through a merge.
    pub merged: bool,
    /// Content delta relative to the previous entry.
    pub windows: Vec<crate::DiffWindow>,
}

impl FileRevision {
    /// Content at `rev`, given the content of the previous entry.
    pub fn apply(&self, previous: &[u8]) -> Result<Vec<u8>, crate::SvnError> {
        crate::apply_windows(previous, &self.windows)
    }
}

/// Subversion depth value (used by `update`, `switch`, `status`, etc.).
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub enum Depth {
    /// Exclude entries (the target itself only).
    Empty,
    /// Include file children.
    Files,
    /// Include immediate children (files and dirs) but not recurse.
    Immediates,
    /// Fully recursive.
    Infinity,
}

impl Depth {
    pub(crate) fn as_word(self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Files => "files",
            Self::Immediates => "immediates",
            Self::Infinity => "infinity",
        }
    }

    pub(crate) fn from_word(word: &str) -> Option<Self> {
        match word {
            "empty" => Some(Self::Empty),
            "files" => Some(Self::Files),
            "immediates" => Some(Self::Immediates),
            "infinity" => Some(Self::Infinity),
            _ => None,
        }
    }

    /// Depth a child directory is visited with when its parent uses `self`.
    pub(crate) fn for_child_dir(self) -> Option<Self> {
        match self {
            Self::Empty | Self::Files => None,
            Self::Immediates => Some(Self::Empty),
            Self::Infinity => Some(Self::Infinity),
        }
    }

    pub(crate) fn includes_files(self) -> bool {
        self != Self::Empty
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn prop_names_are_classified_once() {
        assert_eq!(PropName::new("svn:eol-style").kind(), PropKind::Versioned);
        assert_eq!(PropName::new("owner").kind(), PropKind::Versioned);
        assert_eq!(
            PropName::new("svn:wc:ra_dav:version-url").kind(),
            PropKind::Workspace
        );
        assert_eq!(PropName::new(ENTRY_COMMITTED_REV).kind(), PropKind::Entry);
        assert_eq!(PropName::from("svn:entry").kind(), PropKind::Versioned);
    }

    #[test]
    fn depth_child_visits() {
        assert_eq!(Depth::Infinity.for_child_dir(), Some(Depth::Infinity));
        assert_eq!(Depth::Immediates.for_child_dir(), Some(Depth::Empty));
        assert_eq!(Depth::Files.for_child_dir(), None);
        assert!(!Depth::Empty.includes_files());
        assert_eq!(Depth::from_word("files"), Some(Depth::Files));
        assert_eq!(Depth::from_word("exclude"), None);
    }

    #[test]
    fn svn_dates_round_trip_through_chrono() {
        let date = parse_svn_date("2024-02-29T13:45:01.250000Z").unwrap();
        assert_eq!(format_svn_date(&date), "2024-02-29T13:45:01.250000Z");
        assert_eq!(
            parse_svn_date("2024-02-29T14:45:01.25+01:00"),
            Some(date)
        );
        assert_eq!(parse_svn_date("yesterday"), None);
    }

    #[test]
    fn node_kind_words() {
        assert_eq!(NodeKind::from_word("dir"), Some(NodeKind::Dir));
        assert_eq!(NodeKind::from_word("symlink"), None);
        assert_eq!(NodeKind::File.to_string(), "file");
    }
}
