use thiserror::Error;

/// Errors produced while validating or decoding a binary unit.
#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("not a crescent bytecode unit (bad magic)")]
    BadMagic,
    #[error("unexpected end of data: need {needed} bytes at offset {offset}")]
    Truncated { needed: usize, offset: usize },
    #[error("invalid UTF-8 in string: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("unknown {what} tag: {tag}")]
    UnknownTag { what: &'static str, tag: u8 },
}
