mod enums;
mod header;
pub mod name;
mod packet;
mod question;
mod resource;

pub use enums::*;
pub use header::*;
pub use name::*;
pub use packet::*;
pub use question::*;
pub use resource::*;

/// Errors raised while decoding or encoding DNS wire data.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("packet truncated: needed {needed} bytes at offset {offset}")]
    UnexpectedEnd { offset: usize, needed: usize },

    #[error("invalid label at offset {0}")]
    InvalidLabel(usize),

    #[error("compression pointer loop")]
    PointerLoop,

    #[error("malformed header")]
    InvalidHeader,

    #[error("malformed rdata for {rtype}: {reason}")]
    InvalidRdata { rtype: String, reason: String },

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ParseError {
    fn from(err: std::io::Error) -> Self {
        ParseError::Io(err.to_string())
    }
}
