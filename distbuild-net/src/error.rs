use thiserror::Error;

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("io error on connection")]
    Io(#[from] std::io::Error),

    #[error("malformed message line: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("message line exceeded the {0} byte cap without a newline")]
    LineTooLong(usize),

    #[error("connection closed")]
    Eof,
}
