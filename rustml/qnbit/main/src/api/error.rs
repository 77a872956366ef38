use thiserror::Error;

pub type QnbitResult<T> = Result<T, QnbitError>;

#[derive(Debug, Error)]
pub enum QnbitError {
    #[error("Unsupported: {what}")]
    Unsupported { what: String },

    #[error("Invalid block length {blk_len}: must be a power of two in [{min}, {max}]")]
    InvalidBlockLength { blk_len: usize, min: usize, max: usize },

    #[error("Invalid bit width {0}: only 4 and 8 are supported")]
    InvalidBitWidth(usize),

    #[error("Shape mismatch: {what} expected {expected}, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Buffer too small: {what} requires {required} bytes, got {actual}")]
    BufferTooSmall {
        what: &'static str,
        required: usize,
        actual: usize,
    },

    #[error("Misaligned buffer: {what} requires {alignment}-byte alignment")]
    Misaligned { what: &'static str, alignment: usize },

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Runtime configuration error: {0}")]
    Config(String),
}

impl QnbitError {
    pub(crate) fn unsupported(what: impl Into<String>) -> Self {
        QnbitError::Unsupported { what: what.into() }
    }
}
