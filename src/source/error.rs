#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("kernel flow tracking is not supported on this platform")]
    Unsupported,
    #[error("flow source I/O failure: {0}")]
    Io(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
