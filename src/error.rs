use thiserror::Error;

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq)]
/// One error entry as returned by a server-side `failure` response.
pub struct ServerErrorItem {
    /// Subversion error code.
    pub code: u64,
    /// Human-readable error message (UTF-8, lossy-decoded).
    pub message: Option<String>,
    /// Source file on the server side, if provided.
    pub file: Option<String>,
    /// Source line on the server side, if provided.
    pub line: Option<u64>,
}

impl ServerErrorItem {
    /// Creates an error entry with a code and message.
    pub fn new(code: u64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
            file: None,
            line: None,
        }
    }
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq)]
/// A structured error reported by the repository side of a connection.
///
/// `context` is typically the command name and `chain` is the error stack
/// the server sent, outermost first.
pub struct ServerError {
    /// High-level context for the failure (for example, the command name).
    pub context: Option<String>,
    /// The server-provided error chain.
    pub chain: Vec<ServerErrorItem>,
}

impl ServerError {
    /// Attaches additional context to this error.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Returns a single-line, human-readable message.
    pub fn message_summary(&self) -> String {
        let mut messages = Vec::new();
        for err in &self.chain {
            if let Some(message) = err.message.as_deref()
                && !message.is_empty()
            {
                messages.push(message);
            }
        }
        if messages.is_empty() {
            "unknown error".to_string()
        } else {
            messages.join("; ")
        }
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ctx) = self.context.as_deref()
            && !ctx.is_empty()
        {
            write!(f, "{ctx}: ")?;
        }
        write!(f, "{}", self.message_summary())
    }
}

/// Reasons a delta window or delta stream is rejected.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum DeltaError {
    /// The input ended in the middle of a window.
    #[error("truncated delta: {0}")]
    Truncated(String),
    /// A declared length does not match the bytes or output actually present.
    #[error("delta length mismatch: {0}")]
    LengthMismatch(String),
    /// An instruction references bytes outside the view it copies from.
    #[error("delta instruction out of bounds: {0}")]
    OutOfBounds(String),
    /// An instruction selector or length is not valid.
    #[error("invalid delta instruction: {0}")]
    InvalidInstruction(String),
    /// The stream is structurally broken (bad header, overflow, limits).
    #[error("corrupt delta stream: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
#[non_exhaustive]
/// Errors returned by this crate.
pub enum SvnError {
    /// The provided URL is syntactically invalid.
    #[error("invalid svn url: {0}")]
    InvalidUrl(String),
    /// No transport is registered for the URL scheme.
    #[error("unsupported url scheme: {0}")]
    UnsupportedScheme(String),
    /// The provided repository path is invalid or unsafe.
    #[error("invalid path: {0}")]
    InvalidPath(String),
    /// An editor or reporter call arrived out of sequence.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// Base or result content does not match its checksum.
    #[error("checksum mismatch for '{path}': expected {expected}, actual {actual}")]
    ChecksumMismatch {
        /// Path of the file being assembled.
        path: String,
        /// Checksum announced by the sender.
        expected: String,
        /// Checksum of the bytes actually seen.
        actual: String,
    },
    /// A delta window is truncated or references bytes out of bounds.
    #[error("malformed delta: {0}")]
    MalformedDelta(#[from] DeltaError),
    /// A node exists where it must not, is missing, or is out of date.
    #[error("node conflict at '{path}': {reason}")]
    NodeConflict {
        /// Repository-relative path of the conflicting node.
        path: String,
        /// Short description of the conflict.
        reason: String,
    },
    /// The operation was aborted before it completed.
    #[error("operation cancelled")]
    Cancelled,
    /// Another operation is already in progress on this session.
    #[error("session busy: {0}")]
    Reentrancy(String),
    /// An I/O error occurred while reading/writing the network stream or a file.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The peer's messages did not match the expected wire protocol shape.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The server requested authentication but offered no supported mechanisms.
    #[error("auth required but no supported mechanism")]
    AuthUnavailable,
    /// Authentication failed (for example, invalid username/password).
    #[error("auth failed: {0}")]
    AuthFailed(String),
    /// The server returned a `failure` response.
    #[error("server error: {0}")]
    Server(ServerError),
}

impl SvnError {
    pub(crate) fn conflict(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NodeConflict {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Returns `true` for failures of the connection itself.
    ///
    /// A session drops its connection after one of these and reconnects on
    /// the next call.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Protocol(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_error_display_joins_chain() {
        let err = ServerError {
            context: Some("commit".to_string()),
            chain: vec![
                ServerErrorItem::new(160028, "File is out of date"),
                ServerErrorItem {
                    code: 1,
                    message: Some(String::new()),
                    file: None,
                    line: None,
                },
                ServerErrorItem::new(2, "txn aborted"),
            ],
        };
        assert_eq!(err.to_string(), "commit: File is out of date; txn aborted");
    }

    #[test]
    fn delta_error_converts_into_malformed_delta() {
        let err: SvnError = DeltaError::OutOfBounds("source".into()).into();
        assert!(matches!(
            err,
            SvnError::MalformedDelta(DeltaError::OutOfBounds(_))
        ));
        assert!(!err.is_transport());
    }
}
