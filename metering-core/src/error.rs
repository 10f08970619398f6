use std::fmt::{self, Display};

use http::StatusCode;

/// Crate-wide error type.
///
/// The struct member is private so that every error goes through `new` and is
/// logged exactly once, at construction, with the context needed to
/// reconstruct the decision later. We box `ErrorDetails` to keep `Result`
/// sizes small.
#[derive(Debug, PartialEq)]
pub struct Error(Box<ErrorDetails>);

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Box::new(details))
    }

    pub fn new_without_logging(details: ErrorDetails) -> Self {
        Error(Box::new(details))
    }

    pub fn status_code(&self) -> StatusCode {
        self.0.status_code()
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }

    pub fn get_owned_details(self) -> ErrorDetails {
        *self.0
    }

    pub fn log(&self) {
        self.0.log();
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

/// Infrastructure and configuration failures.
///
/// Exceeded limits and exhausted credit are *decisions*, not errors; they
/// never appear here. Variants that surface to callers map to 5xx-class
/// status codes so a transient infrastructure failure is never mistaken for
/// quota exhaustion.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorDetails {
    Config {
        message: String,
    },
    /// The fast counter store was unreachable or timed out. Recovered
    /// locally via the fail-open path; callers normally never see this.
    CounterStore {
        message: String,
    },
    InternalError {
        message: String,
    },
    InvalidTier {
        value: String,
    },
    LedgerConnection {
        message: String,
    },
    LedgerQuery {
        message: String,
    },
    /// The durable store did not answer within its deadline during a
    /// quota or credit check. Hard failure: credit correctness cannot
    /// fail open.
    LedgerTimeout {
        context: String,
    },
    TierResolution {
        identity: String,
        message: String,
    },
}

impl ErrorDetails {
    /// Defines the error level for logging this error
    fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::Config { .. } => tracing::Level::ERROR,
            ErrorDetails::CounterStore { .. } => tracing::Level::WARN,
            ErrorDetails::InternalError { .. } => tracing::Level::ERROR,
            ErrorDetails::InvalidTier { .. } => tracing::Level::ERROR,
            ErrorDetails::LedgerConnection { .. } => tracing::Level::ERROR,
            ErrorDetails::LedgerQuery { .. } => tracing::Level::ERROR,
            ErrorDetails::LedgerTimeout { .. } => tracing::Level::ERROR,
            ErrorDetails::TierResolution { .. } => tracing::Level::ERROR,
        }
    }

    /// Defines the HTTP status code for responses involving this error
    fn status_code(&self) -> StatusCode {
        match self {
            ErrorDetails::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::CounterStore { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ErrorDetails::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InvalidTier { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::LedgerConnection { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ErrorDetails::LedgerQuery { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::LedgerTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ErrorDetails::TierResolution { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Log the error at the level defined in `level`
    pub fn log(&self) {
        match self.level() {
            tracing::Level::ERROR => tracing::error!("{self}"),
            tracing::Level::WARN => tracing::warn!("{self}"),
            tracing::Level::INFO => tracing::info!("{self}"),
            tracing::Level::DEBUG => tracing::debug!("{self}"),
            tracing::Level::TRACE => tracing::trace!("{self}"),
        }
    }
}

impl Display for ErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorDetails::Config { message } => {
                write!(f, "{message}")
            }
            ErrorDetails::CounterStore { message } => {
                write!(f, "Counter store unavailable: {message}")
            }
            ErrorDetails::InternalError { message } => {
                write!(f, "Internal error: {message}")
            }
            ErrorDetails::InvalidTier { value } => {
                write!(f, "Unknown tier: {value}")
            }
            ErrorDetails::LedgerConnection { message } => {
                write!(f, "Error connecting to ledger: {message}")
            }
            ErrorDetails::LedgerQuery { message } => {
                write!(f, "Failed to run ledger query: {message}")
            }
            ErrorDetails::LedgerTimeout { context } => {
                write!(f, "Ledger timed out during {context}")
            }
            ErrorDetails::TierResolution { identity, message } => {
                write!(f, "Failed to resolve tier for identity {identity}: {message}")
            }
        }
    }
}
