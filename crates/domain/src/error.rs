/// Shared error type used across all Palaver crates.
///
/// Every component boundary returns `Result<T, Error>`; tool and model
/// failures are additionally *recorded* as transcript messages rather than
/// propagated as panics. The [`ErrorKind`] grouping is what the HTTP layer
/// maps to status codes.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("validation: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Retriable failure: proxy stream reset, provider 5xx, storage hiccup.
    /// Recovered locally where possible; surfaced as 503 when it is not.
    #[error("transient: {0}")]
    Transient(String),

    /// A tool or provider returned an unrecoverable error result. Recorded
    /// in the transcript; the planner decides whether to continue.
    #[error("{0}")]
    Permanent(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    /// Sequence-assignment violation or unrecoverable store corruption.
    /// The process must not continue past one of these.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("config: {0}")]
    Config(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// The taxonomy bucket an [`Error`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Unauthorized,
    Conflict,
    Transient,
    Permanent,
    Cancelled,
    Fatal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) | Error::Config(_) => ErrorKind::Validation,
            Error::NotFound(_) | Error::UnknownTool(_) => ErrorKind::NotFound,
            Error::Unauthorized(_) => ErrorKind::Unauthorized,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Transient(_) | Error::Io(_) => ErrorKind::Transient,
            Error::Permanent(_) | Error::Timeout(_) | Error::Json(_) | Error::Provider { .. } => {
                ErrorKind::Permanent
            }
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Fatal(_) => ErrorKind::Fatal,
        }
    }

    /// Whether the caller may retry the operation as-is.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}
