use thiserror::Error;

use crate::rest::RestError;
use crate::store::StoreError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("rest fallback error: {0}")]
    Rest(#[from] RestError),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("unsupported server url scheme: {0}")]
    Scheme(String),
    #[error("sync session closed")]
    Closed,
}
