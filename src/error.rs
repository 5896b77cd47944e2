//! Error taxonomy for suite execution.
//!
//! Only one class of error is fatal to a caller: [`SuiteError::DeviceNotAvailable`].
//! Every other failure is recorded as a structured result and travels up the
//! listener chain instead of unwinding out of `run()`.
//!
//! | Variant | Raised by | Effect |
//! |---------|-----------|--------|
//! | `TargetSetup` | target preparers | module run failure, teardown still runs |
//! | `DeviceUnresponsive` | delegates, devices | module run failure, suite continues |
//! | `DeviceNotAvailable` | delegates, devices | aborts the current shard |
//! | `Config` | suite start | fails before any device work |
//! | `InvalidArgument` | merger | caller misuse |
//! | `Harness` | delegates | module run failure |

/// Result type for suite operations.
pub type SuiteResult<T> = Result<T, SuiteError>;

/// Errors produced while loading, sharding and running a suite.
#[derive(Debug, thiserror::Error)]
pub enum SuiteError {
    /// The device went away and cannot be recovered.
    ///
    /// Propagates out of module and suite runs and aborts the remaining
    /// modules of the shard.
    #[error("Device not available: {0}")]
    DeviceNotAvailable(String),

    /// The device stopped responding but may recover.
    ///
    /// The module is marked failed and the suite moves on.
    #[error("Device unresponsive: {0}")]
    DeviceUnresponsive(String),

    /// A target preparer failed during setup.
    #[error("Target setup failed: {0}")]
    TargetSetup(String),

    /// Invalid suite configuration or filters.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// An operation was called with arguments that break its contract.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A delegate failed with an error that is not device related.
    #[error("Test harness error: {0}")]
    Harness(String),

    /// I/O error, e.g. while saving logs.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SuiteError {
    /// Returns `true` for errors that must abort the enclosing shard.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SuiteError::DeviceNotAvailable(_))
    }
}
