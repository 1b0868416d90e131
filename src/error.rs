//! Error types for the runtime client.
//!
//! Each error variant carries a stable error code (SCREAMING_SNAKE_CASE)
//! that is included in the Display output and accessible via
//! [`RuntimeError::code()`]. Codes are part of the public API contract and
//! will not change.

/// Stable error codes for programmatic error handling.
///
/// These codes never change and form part of the public API contract.
/// Use these for distinguishing errors rather than parsing Display output.
pub mod error_codes {
    /// The server executable could not be located on this machine.
    pub const EXECUTABLE_NOT_FOUND: &str = "EXECUTABLE_NOT_FOUND";

    /// Process control is not implemented for this platform.
    pub const UNSUPPORTED_PLATFORM: &str = "UNSUPPORTED_PLATFORM";

    /// Spawning the server process failed.
    pub const SPAWN_FAILED: &str = "SPAWN_FAILED";

    /// The server did not become healthy within the start window.
    pub const START_TIMEOUT: &str = "START_TIMEOUT";

    /// A pull for this model name is already active.
    pub const ALREADY_PULLING: &str = "ALREADY_PULLING";

    /// The model catalog could not be reached or read.
    pub const CATALOG_UNAVAILABLE: &str = "CATALOG_UNAVAILABLE";

    /// Deleting an installed model failed.
    pub const DELETE_FAILED: &str = "DELETE_FAILED";

    /// A model pull exhausted its retry budget.
    pub const PULL_FAILED: &str = "PULL_FAILED";

    /// A chat/generate request is already active on this client.
    pub const REQUEST_IN_FLIGHT: &str = "REQUEST_IN_FLIGHT";

    /// The server answered with a non-success HTTP status.
    pub const HTTP_STATUS: &str = "HTTP_STATUS";

    /// A network connection could not be established or was dropped.
    pub const CONNECTION_FAILED: &str = "CONNECTION_FAILED";

    /// A request or read timed out.
    pub const TIMEOUT: &str = "TIMEOUT";

    /// No bytes arrived within the stall watchdog window.
    pub const STALLED: &str = "STALLED";

    /// A response stream ended before a terminal record.
    pub const STREAM_ENDED: &str = "STREAM_ENDED";

    /// The server reported an error record or an undecodable payload.
    pub const PROTOCOL: &str = "PROTOCOL";

    /// Request arguments were malformed.
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";

    /// Invalid or unreadable configuration.
    pub const CONFIG: &str = "CONFIG";

    /// An underlying I/O operation failed.
    pub const IO: &str = "IO";
}

/// Errors produced by the runtime client.
///
/// Each variant includes a stable error code accessible via
/// [`RuntimeError::code()`]. The Display impl formats as `[CODE] message`.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The server executable could not be located.
    #[error("[{code}] server executable not found: {0}", code = error_codes::EXECUTABLE_NOT_FOUND)]
    ExecutableNotFound(String),

    /// Process control is not implemented for this platform.
    #[error("[{code}] unsupported platform: {0}", code = error_codes::UNSUPPORTED_PLATFORM)]
    UnsupportedPlatform(String),

    /// Spawning the server process failed.
    #[error("[{code}] failed to spawn server: {0}", code = error_codes::SPAWN_FAILED)]
    SpawnFailed(String),

    /// The server did not become healthy within the start window.
    #[error("[{code}] server not healthy after {0}s", code = error_codes::START_TIMEOUT)]
    StartTimeout(u64),

    /// A pull for this model name is already active.
    #[error("[{code}] model {0} is already being pulled", code = error_codes::ALREADY_PULLING)]
    AlreadyPulling(String),

    /// The model catalog could not be reached or read.
    #[error("[{code}] model catalog unavailable: {0}", code = error_codes::CATALOG_UNAVAILABLE)]
    CatalogUnavailable(String),

    /// Deleting an installed model failed.
    #[error("[{code}] failed to delete model {model}: {detail}", code = error_codes::DELETE_FAILED)]
    DeleteFailed {
        /// Name of the model the delete targeted.
        model: String,
        /// Underlying failure detail.
        detail: String,
    },

    /// A model pull exhausted its retry budget.
    #[error("[{code}] failed to pull model {model}: {detail}", code = error_codes::PULL_FAILED)]
    PullFailed {
        /// Name of the model being pulled.
        model: String,
        /// The last attempt's failure detail.
        detail: String,
    },

    /// A chat/generate request is already active on this client.
    #[error("[{code}] a completion request is already in flight", code = error_codes::REQUEST_IN_FLIGHT)]
    RequestInFlight,

    /// The server answered with a non-success HTTP status.
    #[error("[{code}] server returned {status}: {detail}", code = error_codes::HTTP_STATUS)]
    HttpStatus {
        /// Numeric HTTP status code.
        status: u16,
        /// Response body, used as error detail.
        detail: String,
    },

    /// A network connection could not be established or was dropped.
    #[error("[{code}] connection failed: {0}", code = error_codes::CONNECTION_FAILED)]
    ConnectionFailed(String),

    /// A request or read timed out.
    #[error("[{code}] timed out: {0}", code = error_codes::TIMEOUT)]
    Timeout(String),

    /// No bytes arrived within the stall watchdog window.
    #[error("[{code}] no data received for {0}s", code = error_codes::STALLED)]
    Stalled(u64),

    /// A response stream ended before a terminal record.
    #[error("[{code}] stream ended unexpectedly: {0}", code = error_codes::STREAM_ENDED)]
    StreamEnded(String),

    /// The server reported an error record or an undecodable payload.
    #[error("[{code}] {0}", code = error_codes::PROTOCOL)]
    Protocol(String),

    /// Request arguments were malformed.
    #[error("[{code}] invalid request: {0}", code = error_codes::INVALID_REQUEST)]
    InvalidRequest(String),

    /// Invalid or unreadable configuration.
    #[error("[{code}] config error: {0}", code = error_codes::CONFIG)]
    Config(String),

    /// An underlying I/O operation failed.
    #[error("[{code}] {0}", code = error_codes::IO)]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Returns the stable error code for this error.
    ///
    /// Codes are SCREAMING_SNAKE_CASE strings that remain stable across
    /// releases. Use these for programmatic error handling rather than
    /// parsing Display output.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ExecutableNotFound(_) => error_codes::EXECUTABLE_NOT_FOUND,
            Self::UnsupportedPlatform(_) => error_codes::UNSUPPORTED_PLATFORM,
            Self::SpawnFailed(_) => error_codes::SPAWN_FAILED,
            Self::StartTimeout(_) => error_codes::START_TIMEOUT,
            Self::AlreadyPulling(_) => error_codes::ALREADY_PULLING,
            Self::CatalogUnavailable(_) => error_codes::CATALOG_UNAVAILABLE,
            Self::DeleteFailed { .. } => error_codes::DELETE_FAILED,
            Self::PullFailed { .. } => error_codes::PULL_FAILED,
            Self::RequestInFlight => error_codes::REQUEST_IN_FLIGHT,
            Self::HttpStatus { .. } => error_codes::HTTP_STATUS,
            Self::ConnectionFailed(_) => error_codes::CONNECTION_FAILED,
            Self::Timeout(_) => error_codes::TIMEOUT,
            Self::Stalled(_) => error_codes::STALLED,
            Self::StreamEnded(_) => error_codes::STREAM_ENDED,
            Self::Protocol(_) => error_codes::PROTOCOL,
            Self::InvalidRequest(_) => error_codes::INVALID_REQUEST,
            Self::Config(_) => error_codes::CONFIG,
            Self::Io(_) => error_codes::IO,
        }
    }

    /// Returns the human-readable message without the code prefix.
    pub fn message(&self) -> String {
        let full = self.to_string();
        match full.split_once("] ") {
            Some((_, rest)) => rest.to_string(),
            None => full,
        }
    }

    /// Returns true if this error represents a transient failure that can
    /// be retried.
    ///
    /// Retryable errors:
    /// - connection failures and timeouts
    /// - stall watchdog expiry
    /// - streams that ended before a terminal record
    /// - HTTP 408, 429, and 5xx responses
    /// - I/O errors whose message indicates a network-level fault
    ///
    /// Everything else (configuration problems, protocol errors, explicit
    /// rejections) is surfaced immediately and never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionFailed(_) | Self::Timeout(_) | Self::Stalled(_) => true,
            Self::StreamEnded(_) => true,
            Self::HttpStatus { status, .. } => {
                matches!(status, 408 | 429) || (500..=599).contains(status)
            }
            Self::Io(e) => crate::retry::is_transient_message(&e.to_string()),
            Self::CatalogUnavailable(_)
            | Self::ExecutableNotFound(_)
            | Self::UnsupportedPlatform(_)
            | Self::SpawnFailed(_)
            | Self::StartTimeout(_)
            | Self::AlreadyPulling(_)
            | Self::DeleteFailed { .. }
            | Self::PullFailed { .. }
            | Self::RequestInFlight
            | Self::Protocol(_)
            | Self::InvalidRequest(_)
            | Self::Config(_) => false,
        }
    }
}

/// Convenience alias for runtime client results.
pub type Result<T> = std::result::Result<T, RuntimeError>;
