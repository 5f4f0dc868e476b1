use thiserror::Error;

use rfmp_shared::FramingError;
use rfmp_store::StoreError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("transmission queue over high water mark, submission dropped")]
    BackpressureDropped,

    #[error("message body exceeds {0} bytes")]
    BodyTooLarge(usize),

    #[error("shutdown did not drain in time")]
    ShutdownTimeout,
}

pub type Result<T> = std::result::Result<T, EngineError>;
