use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TapError>;

/// Error code used when a failed response carries no store error code.
pub const NO_STORE_ERROR_CODE: &str = "NoAwsErrorCode";
pub const NO_SUCH_DOMAIN: &str = "NoSuchDomain";
pub const CONDITIONAL_CHECK_FAILED: &str = "ConditionalCheckFailed";
pub const ATTRIBUTE_DOES_NOT_EXIST: &str = "AttributeDoesNotExist";

#[derive(Error, Debug)]
pub enum TapError {
    /// Non-2xx response that survived (or was not eligible for) retries.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Connection-level failure with no HTTP status to classify.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    /// Structured error reported by the store.
    #[error("{message} ({code}/{status})")]
    Store {
        status: u16,
        code: String,
        message: String,
    },

    #[error("conditional check failed: {message}")]
    ConditionalCheckFailed { code: String, message: String },

    #[error("table {table} has shard {shard} claiming {found} shards, expected {expected}")]
    ShardCountMismatch {
        table: String,
        shard: String,
        expected: u32,
        found: u32,
    },

    #[error("table {table} is missing shard #{index} of {count}")]
    MissingShard { table: String, index: u32, count: u32 },

    #[error("shard {shard} has index outside 1..={count}")]
    InvalidShardIndex { shard: String, count: u32 },

    #[error("async write of {items} items to {shard} failed: {source}")]
    AsyncWrite {
        shard: String,
        items: usize,
        #[source]
        source: Box<TapError>,
    },

    #[error("hard termination of async writes after {timeout:?}")]
    ShutdownTimeout { timeout: Duration },

    #[error("writer is closed")]
    WriterClosed,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("malformed response: {0}")]
    Xml(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse grouping that lets callers decide what to do with a failure
/// without matching on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Throttling or connection trouble that outlasted the retry budget.
    Transient,
    /// The request, query, or condition was rejected by the store.
    Semantic,
    /// Shard layout is corrupt or was tampered with.
    Consistency,
    /// Deferred failure from a background flush, or a hard shutdown.
    AsyncWrite,
    /// Local misuse or environment failure.
    Local,
}

impl TapError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Http { status, .. } | Self::Store { status, .. } => {
                if is_retryable_status(*status) {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Semantic
                }
            }
            Self::Transport(_) => ErrorClass::Transient,
            Self::Tls(_) => ErrorClass::Local,
            Self::ConditionalCheckFailed { .. } | Self::InvalidRequest(_) | Self::Xml(_) => {
                ErrorClass::Semantic
            }
            Self::ShardCountMismatch { .. }
            | Self::MissingShard { .. }
            | Self::InvalidShardIndex { .. } => ErrorClass::Consistency,
            Self::AsyncWrite { .. } | Self::ShutdownTimeout { .. } => ErrorClass::AsyncWrite,
            Self::WriterClosed
            | Self::Config(_)
            | Self::Io(_)
            | Self::Internal(_) => ErrorClass::Local,
        }
    }

    /// HTTP status attached to this error, looking through async-write wrappers.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } | Self::Store { status, .. } => Some(*status),
            Self::AsyncWrite { source, .. } => source.status(),
            _ => None,
        }
    }

    /// Store error code attached to this error, looking through async-write wrappers.
    pub fn store_code(&self) -> Option<&str> {
        match self {
            Self::Store { code, .. } | Self::ConditionalCheckFailed { code, .. } => {
                Some(code.as_str())
            }
            Self::AsyncWrite { source, .. } => source.store_code(),
            _ => None,
        }
    }

    pub fn is_no_such_domain(&self) -> bool {
        self.store_code() == Some(NO_SUCH_DOMAIN)
    }

    pub fn is_conditional_check_failed(&self) -> bool {
        matches!(self, Self::ConditionalCheckFailed { .. })
    }
}

impl From<quick_xml::Error> for TapError {
    fn from(error: quick_xml::Error) -> Self {
        Self::Xml(error.to_string())
    }
}

/// Server-side throttling and overload statuses that are worth retrying.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 500 | 503 | 408)
}
