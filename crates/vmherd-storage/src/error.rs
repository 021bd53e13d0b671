/// Errors surfaced by the storage layer.
///
/// Callers distinguish "the record does not exist" (a normal outcome for
/// several inventory operations, reported as `Ok(false)`/`Ok(None)` there)
/// from an actual I/O failure, which always arrives as an `Err`.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A required record was not found.
    #[error("storage: {entity} not found ({key})")]
    NotFound { entity: &'static str, key: String },

    /// An underlying database error.
    #[error("storage: database error: {0}")]
    Db(#[from] sea_orm::DbErr),

    /// A JSON column failed to encode or decode.
    #[error("storage: JSON error in column '{column}': {source}")]
    Json {
        column: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// A status column held a value outside the lifecycle vocabulary.
    #[error("storage: invalid status value '{value}'")]
    InvalidStatus { value: String },
}

/// Convenience alias so callers can write `error::Result<T>`.
pub type Result<T> = std::result::Result<T, StoreError>;
