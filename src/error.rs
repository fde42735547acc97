use std::io;
use std::result;

/// Outcome of every stack operation. Kinds the application can act on;
/// malformed input never surfaces here, it is dropped and counted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("no route to host")]
    NoRoute,

    #[error("host unreachable")]
    Unreachable,

    #[error("operation timed out")]
    Timeout,

    #[error("connection refused")]
    Refused,

    #[error("connection reset")]
    ConnReset,

    #[error("connection aborted")]
    ConnAborted,

    #[error("no buffer space available")]
    NoSpace,

    #[error("link i/o: {0}")]
    Io(String),
}

impl From<io::Error> for NetError {
    fn from(err: io::Error) -> Self {
        NetError::Io(err.to_string())
    }
}

pub type Result<T> = result::Result<T, NetError>;
