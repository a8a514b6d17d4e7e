//! Error types for chunk encoding and decoding

use thiserror::Error;

/// The specific reason a chunk was rejected by the loader.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatFault {
    #[error("truncated chunk")]
    Truncated,

    #[error("not a binary chunk")]
    NotBinaryChunk,

    #[error("version mismatch")]
    VersionMismatch,

    #[error("format mismatch")]
    FormatMismatch,

    #[error("corrupted chunk")]
    Corrupted,

    #[error("{0} size mismatch")]
    SizeMismatch(&'static str),

    #[error("integer format mismatch")]
    IntegerFormatMismatch,

    #[error("float format mismatch")]
    FloatFormatMismatch,

    #[error("integer overflow")]
    IntegerOverflow,

    #[error("invalid string index")]
    InvalidStringIndex,

    #[error("bad format for constant string")]
    NullConstantString,

    #[error("decompression failed")]
    DecompressionFailed,

    #[error("unknown constant tag {0:#04x}")]
    UnknownConstantTag(u8),

    #[error("chunk nested too deep")]
    NestedTooDeep,
}

/// Main error type for dump/undump operations
#[derive(Error, Debug)]
pub enum BytecodeError {
    #[error("{chunk}: bad binary format ({fault})")]
    Format { chunk: String, fault: FormatFault },

    #[error("Chunk writer failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Code compression failed: {0}")]
    Compression(String),
}

impl BytecodeError {
    /// The format fault behind this error, if it is one.
    pub fn fault(&self) -> Option<&FormatFault> {
        match self {
            BytecodeError::Format { fault, .. } => Some(fault),
            _ => None,
        }
    }
}

/// Convenient Result type
pub type Result<T> = std::result::Result<T, BytecodeError>;

/// Display name for a chunk in error messages.
///
/// `@file` and `=name` lose their prefix; anything that itself looks like a
/// binary chunk is reported as `binary string`.
pub fn chunk_display_name(name: &str) -> String {
    if let Some(rest) = name.strip_prefix('@').or_else(|| name.strip_prefix('=')) {
        rest.to_string()
    } else if name.starts_with('\x1b') {
        "binary string".to_string()
    } else {
        name.to_string()
    }
}
