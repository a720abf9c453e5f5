/// Shared error type used across all spawnpoint crates.
///
/// Variants mirror how a failure is surfaced: lookup misses become 404,
/// policy denials 403, spawn problems 502 and so on. `http_status` is the
/// single place that mapping lives.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("spawn failed: {0}")]
    SpawnFailure(String),

    #[error("run failed: {0}")]
    RuntimeFailure(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("corrupted state: {0}")]
    Corruption(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// HTTP status code the error surfaces as on the public routes.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::NotFound(_) => 404,
            Error::Forbidden(_) => 403,
            Error::BadRequest(_) | Error::Validation(_) => 400,
            Error::MethodNotAllowed(_) => 405,
            Error::PayloadTooLarge(_) => 413,
            Error::Timeout(_) => 504,
            Error::SpawnFailure(_) => 502,
            Error::Conflict(_) => 409,
            Error::RuntimeFailure(_) | Error::Corruption(_) | Error::Io(_) | Error::Json(_) => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
