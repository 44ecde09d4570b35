/// Core error type for the monitor.
///
/// Adapter crates map their specific errors into this type so the router can
/// decide between "degrade this feature" and "abort startup".
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("remote store error: {0}")]
    Remote(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("external error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, Error>;
