//! Error taxonomy shared by the query and telnet subsystems
//!
//! Every variant maps to an HTTP status so the API layer can fail a request
//! without inspecting message contents. `Init` is only produced during
//! startup validation and is fatal.

use thiserror::Error;

/// Main error type
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input: bad syntax, empty required field, bad numeric
    /// literal, out-of-order time window
    #[error("validation: {0}")]
    Validation(String),

    /// Unknown keyset, empty path variable or missing resource
    #[error("not found: {0}")]
    NotFound(String),

    /// The expression string was empty
    #[error("expression is empty")]
    EmptyExpression,

    /// A sub-query matched more timeseries than the configured maximum
    #[error("query matched {total} timeseries, the maximum allowed is {limit}")]
    TsLimitExceeded {
        /// Full match count reported by the metadata index
        total: usize,
        /// Configured `max_timeseries`
        limit: usize,
    },

    /// Invalid configuration detected at startup
    #[error("initialization: {0}")]
    Init(String),

    /// Metadata index or storage failure, carrying the upstream code
    #[error("upstream failure ({code}): {message}")]
    External {
        /// Status code reported by the upstream service
        code: u16,
        /// Upstream error description
        message: String,
    },

    /// Unclassified failure
    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    /// Create a not-found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Error::NotFound(message.into())
    }

    /// Create an init error
    pub fn init(message: impl Into<String>) -> Self {
        Error::Init(message.into())
    }

    /// Create an external error with an upstream status code
    pub fn external(code: u16, message: impl Into<String>) -> Self {
        Error::External {
            code,
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal(message.into())
    }

    /// Stable machine-readable kind, used in error response bodies
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::NotFound(_) => "not-found",
            Error::EmptyExpression => "empty-expression",
            Error::TsLimitExceeded { .. } => "ts-limit-exceeded",
            Error::Init(_) => "init",
            Error::External { .. } => "external",
            Error::Internal(_) => "internal",
        }
    }

    /// The HTTP status this error maps to
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation(_) | Error::EmptyExpression | Error::TsLimitExceeded { .. } => 400,
            Error::NotFound(_) => 404,
            // Gateway timeout when the upstream timed out, bad gateway otherwise
            Error::External { code, .. } => {
                if *code == 504 {
                    504
                } else {
                    502
                }
            }
            Error::Init(_) | Error::Internal(_) => 500,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
