use thiserror::Error;

/// Error taxonomy for the memory engine.
///
/// Provider failures are deliberately coarse: individual HTTP/transport
/// errors from an embedding or LLM backend are captured as `ProviderError`
/// and never escape past the embedding manager or LLM provider boundary —
/// callers only see `AllProvidersFailed` once every tier in the chain has
/// been exhausted.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad input: {0}")]
    BadInput(String),

    #[error("provider error: {0}")]
    ProviderError(String),

    #[error("all embedding providers failed for this request")]
    AllProvidersFailed,

    #[error("vector upsert error: {0}")]
    VectorUpsertError(String),

    #[error("storage error: {0}")]
    StorageError(#[from] libsql::Error),

    #[error("llm error: {0}")]
    LLMError(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
