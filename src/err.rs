//! BioIndex error taxonomy.
//!
//! Kinds mirror the ones named in the specification: each maps to an HTTP
//! status at the REST boundary (see `server::rest`) and to specific
//! propagation behavior inside the indexer/reader (logged-and-skipped vs.
//! fatal-to-the-containing-operation).

use std::num::ParseIntError;

#[derive(thiserror::Error, Debug)]
pub enum BioIndexError {
    /// Arity mismatch, unknown index, malformed locus/gene name, unknown format. -> 400
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Blob missing. -> 404 at plot endpoints; logged+skipped inside the reader.
    #[error("not found: {0}")]
    NotFound(String),

    /// Restriction violation on a protected resource. -> 401
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Would-read bytes exceed `response_limit_max`. -> 413
    #[error("payload too large: {bytes_total} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { bytes_total: u64, limit: u64 },

    /// Block-gzip child exited non-zero, or blob-store client error.
    #[error("failed to read source {blob_path:?}: {message}")]
    SourceReadFailed { blob_path: String, message: String },

    /// Bulk-load retriable failure exhausted its retry budget.
    #[error("bulk load deadlocked after {attempts} attempts for key {key:?}")]
    BulkLoadDeadlock { key: String, attempts: u32 },

    /// Prefix contains both compressed and uncompressed blobs.
    #[error("prefix {prefix:?} mixes compressed and uncompressed blobs")]
    MixedCompression { prefix: String },

    /// Continuation token unknown or expired. -> 400
    #[error("continuation token expired or unknown")]
    TokenExpired,

    /// Resolution (query / match) exceeded its configured timeout. -> 408
    #[error("query timed out")]
    QueryTimedOut,

    /// Catalog/process-cache not yet populated. -> 503
    #[error("schema unavailable")]
    SchemaUnavailable,

    #[error("invalid locus: {0}")]
    BadLocus(String),

    #[error(transparent)]
    Catalog(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    ParseInt(#[from] ParseIntError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, BioIndexError>;

impl BioIndexError {
    /// HTTP status code this error kind maps to at the REST boundary.
    pub fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self {
            BioIndexError::BadRequest(_)
            | BioIndexError::BadLocus(_)
            | BioIndexError::TokenExpired => StatusCode::BAD_REQUEST,
            BioIndexError::NotFound(_) => StatusCode::NOT_FOUND,
            BioIndexError::Forbidden(_) => StatusCode::UNAUTHORIZED,
            BioIndexError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            BioIndexError::QueryTimedOut => StatusCode::REQUEST_TIMEOUT,
            BioIndexError::SchemaUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            BioIndexError::SourceReadFailed { .. }
            | BioIndexError::BulkLoadDeadlock { .. }
            | BioIndexError::MixedCompression { .. }
            | BioIndexError::Catalog(_)
            | BioIndexError::Io(_)
            | BioIndexError::Json(_)
            | BioIndexError::ParseInt(_)
            | BioIndexError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl actix_web::ResponseError for BioIndexError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        BioIndexError::status_code(self)
    }

    fn error_response(&self) -> actix_web::HttpResponse {
        actix_web::HttpResponse::build(self.status_code()).json(serde_json::json!({
            "error": self.to_string(),
        }))
    }
}
