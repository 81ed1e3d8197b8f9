//! Error types for driver operations.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::bson::Document;
use crate::version::{Version, VersionRange};

/// Convenience result alias used throughout the driver.
pub type Result<T> = std::result::Result<T, Error>;

/// Fields searched, in order, for a server error message.
const ERROR_MESSAGE_FIELDS: [&str; 5] = ["jnote", "wnote", "$err", "errmsg", "err"];

/// Field holding the server error code.
const ERROR_CODE_FIELD: &str = "code";

/// Errors surfaced to callers and reply callbacks.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The socket closed or failed while requests were in flight.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The server skipped a pending message; a later reply correlated
    /// past it.
    #[error("no reply received")]
    NoReply,

    /// The server reported a failure in a reply document or flags.
    #[error("{0}")]
    Reply(ReplyError),

    /// An outgoing document exceeds the server's maximum size.
    #[error("document size {size} exceeds the server maximum of {maximum}")]
    DocumentTooLarge {
        /// The encoded size of the offending document.
        size: usize,
        /// The server's maximum document size.
        maximum: usize,
    },

    /// A message requires a server version outside the target's range.
    #[error("'{operation}' requires server version {required}, server is {actual}")]
    ServerVersion {
        /// The operation that was rejected.
        operation: String,
        /// The version range the operation requires.
        required: VersionRange,
        /// The server's discovered version.
        actual: Version,
    },

    /// The connection's pending queue cannot accept another request,
    /// even after flushing buffered bytes.
    #[error("pending queue is full ({capacity} requests in flight)")]
    QueueFull {
        /// The queue's configured bound.
        capacity: usize,
    },

    /// An I/O error outside an established connection's lifetime.
    #[error("i/o error: {0}")]
    Io(String),

    /// The peer violated the wire protocol or document encoding.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The authentication handshake failed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The connection or client is shut down.
    #[error("shutdown: {0}")]
    Shutdown(String),

    /// A bounded operation ran out of time.
    #[error("timed out: {0}")]
    Timeout(String),
}

impl Error {
    /// Returns true for errors that indicate the connection itself is
    /// unusable, as opposed to a single request failing.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::ConnectionLost(_) | Error::Io(_) | Error::Shutdown(_)
        )
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::Io(error.to_string())
    }
}

/// The classified kind of a server-reported failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyErrorKind {
    /// The reply's cursor-not-found flag was set.
    CursorNotFound,
    /// The reply's query-failed flag was set.
    QueryFailed,
    /// The reply's shard-config-stale flag was set.
    ShardConfigStale,
    /// A unique index rejected a write (codes 11000/11001 or an
    /// `E11000`/`E11001` message prefix).
    DuplicateKey,
    /// The requested write durability could not be satisfied.
    DurabilityFailure,
    /// The server-side time limit for the operation expired
    /// (codes 50, 13475, 16711).
    MaximumTimeLimitExceeded,
    /// Any other `ok: 0` command response.
    General,
}

/// A failure reported by the server inside a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyError {
    kind: ReplyErrorKind,
    ok: i64,
    code: i64,
    message: String,
}

impl ReplyError {
    /// Creates a reply error with an explicit kind.
    pub fn new(kind: ReplyErrorKind, ok: i64, code: i64, message: impl Into<String>) -> Self {
        Self {
            kind,
            ok,
            code,
            message: message.into(),
        }
    }

    /// Returns the classified kind.
    pub fn kind(&self) -> ReplyErrorKind {
        self.kind
    }

    /// Returns the `ok` field value, or -1 if absent.
    pub fn ok(&self) -> i64 {
        self.ok
    }

    /// Returns the server error code, or -1 if absent.
    pub fn code(&self) -> i64 {
        self.code
    }

    /// Returns the server error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Extracts a failure from a command response document.
    ///
    /// Returns `None` when the document reports success. With
    /// `known_error` set the document is assumed to describe a failure
    /// even without an `ok` field, as for replies whose header flags
    /// already signalled one.
    pub fn from_document(document: &Document, known_error: bool) -> Option<ReplyError> {
        let ok = document.get_int("ok");
        let code = document.get_int(ERROR_CODE_FIELD).unwrap_or(-1);
        let message = ERROR_MESSAGE_FIELDS
            .iter()
            .find_map(|field| document.get_str(field))
            .unwrap_or_default()
            .to_string();

        match ok {
            Some(1) if message.is_empty() => None,
            Some(value) => Some(Self::classified(document, value, code, message)),
            None if known_error => Some(Self::classified(document, -1, code, message)),
            None => None,
        }
    }

    fn classified(document: &Document, ok: i64, code: i64, message: String) -> ReplyError {
        let kind = if is_durability_failure(document, &message) {
            ReplyErrorKind::DurabilityFailure
        } else if code == 11000
            || code == 11001
            || message.starts_with("E11000")
            || message.starts_with("E11001")
        {
            ReplyErrorKind::DuplicateKey
        } else if code == 50 || code == 13475 || code == 16711 {
            ReplyErrorKind::MaximumTimeLimitExceeded
        } else {
            ReplyErrorKind::General
        };

        ReplyError::new(kind, ok, code, message)
    }

    /// Re-labels the error with a flag-derived kind, keeping the parsed
    /// fields.
    pub fn with_kind(mut self, kind: ReplyErrorKind) -> Self {
        self.kind = kind;
        self
    }
}

impl fmt::Display for ReplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server error ({:?})", self.kind)?;
        if self.code >= 0 {
            write!(f, " code {}", self.code)?;
        }
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        Ok(())
    }
}

impl From<ReplyError> for Error {
    fn from(error: ReplyError) -> Self {
        Error::Reply(error)
    }
}

fn is_durability_failure(document: &Document, message: &str) -> bool {
    document.contains("wtimeout")
        || document.contains("wnote")
        || document.contains("jnote")
        || document.contains("badGLE")
        || message.starts_with("cannot use 'j' option")
        || message.starts_with("could not enforce write concern")
}
