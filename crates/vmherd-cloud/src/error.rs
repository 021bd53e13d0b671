/// Errors from the compute layer.
///
/// A timed-out operation is deliberately its own variant: the outcome on the
/// provider side is unknown, which callers must report differently from an
/// operation the provider *said* failed.
///
/// # Examples
///
/// ```rust
/// use vmherd_cloud::error::ComputeError;
///
/// let err = ComputeError::OperationTimeout {
///     operation: "operation-123".to_string(),
///     waited_secs: 300,
/// };
/// assert!(err.is_timeout());
/// assert!(err.to_string().contains("operation-123"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum ComputeError {
    /// The instance name does not satisfy the provider naming grammar.
    #[error(
        "invalid instance name '{0}': must start with a lowercase letter, \
         contain only lowercase letters, digits or hyphens, not end with a \
         hyphen, and be 1-63 characters"
    )]
    InvalidName(String),

    /// Serial port index outside the provider's 1-4 range.
    #[error("invalid serial port {0}: must be 1-4")]
    InvalidSerialPort(u8),

    /// Non-2xx response from the compute API.
    #[error("GCE API HTTP error: status={status}, body={body}")]
    HttpStatus { status: u16, body: String },

    /// 2xx response whose payload carries an error object.
    #[error("GCE API error: code={code}, message={message}")]
    Api { code: String, message: String },

    /// A long-running operation completed and reported failure.
    #[error("operation {operation} failed: {message}")]
    OperationFailed { operation: String, message: String },

    /// Polling exceeded its bound; the operation outcome is unknown.
    #[error("operation {operation} did not complete within {waited_secs}s")]
    OperationTimeout { operation: String, waited_secs: u64 },

    /// Transport-level failure from `reqwest`.
    #[error("network error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Malformed or unexpected JSON payload.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Credential acquisition failed.
    #[error("credential error: {0}")]
    Auth(String),
}

impl ComputeError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ComputeError::OperationTimeout { .. })
    }
}

/// Convenience alias so callers can write `error::Result<T>`.
pub type Result<T> = std::result::Result<T, ComputeError>;
