//! Error types for archive operations.

/// Errors raised while reading, writing or extracting ZIP archives.
#[derive(Debug, thiserror::Error)]
pub enum ZipError {
    /// Structural damage: bad signature, truncated record, impossible field.
    #[error("bad zip data: {0}")]
    Format(String),

    /// Decompressed payload did not hash to the recorded CRC-32.
    #[error("CRC mismatch in '{name}': expected 0x{expected:08x}, got 0x{actual:08x}")]
    CrcMismatch {
        name: String,
        expected: u32,
        actual: u32,
    },

    /// Encryption header check failed; wrong or missing password.
    #[error("bad password")]
    BadPassword,

    /// The archive uses a feature this engine does not decode.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Lookup by name found nothing.
    #[error("no entry named '{0}'")]
    NotFound(String),

    /// An operation was invoked in a state that cannot honor it.
    #[error("bad state: {0}")]
    BadState(&'static str),

    /// A value overflowed the classic format and ZIP64 is disabled.
    #[error("zip64 required: {0}")]
    Zip64Required(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ZipError>;

impl ZipError {
    /// Format error with the file offset where parsing gave up.
    pub fn format_at(what: &str, offset: u64) -> Self {
        ZipError::Format(format!("{what} at offset 0x{offset:x}"))
    }
}
