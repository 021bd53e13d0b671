use vmherd_cloud::ComputeError;
use vmherd_storage::StoreError;

/// Failure modes of one command invocation. Nothing here is fatal to the
/// process; every variant is scoped to the invocation (or sweep iteration)
/// that produced it.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// Bad input, resolved locally: no cloud call was made, no inventory
    /// row was touched.
    #[error("{0}")]
    Validation(String),

    /// Active-instance limit or creation cooldown not satisfied.
    #[error("quota exceeded: {reason}")]
    QuotaExceeded {
        reason: String,
        retry_after_secs: Option<u64>,
    },

    /// Denied by the sliding-window rate limiter.
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The named instance is not in the inventory.
    #[error("instance '{0}' is not registered")]
    NotFound(String),

    /// The provider rejected or failed the action; detail passed through
    /// verbatim.
    #[error("cloud provider error: {0}")]
    Provider(#[source] ComputeError),

    /// Polling gave up; the outcome on the provider side is unknown.
    #[error("operation outcome unknown: {0}")]
    OperationTimeout(#[source] ComputeError),

    /// Inventory read/write failure. Aborts the action with the instance
    /// left in its last known status.
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl From<ComputeError> for CommandError {
    fn from(err: ComputeError) -> Self {
        match err {
            e if e.is_timeout() => CommandError::OperationTimeout(e),
            e @ (ComputeError::InvalidName(_) | ComputeError::InvalidSerialPort(_)) => {
                CommandError::Validation(e.to_string())
            }
            e => CommandError::Provider(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, CommandError>;
