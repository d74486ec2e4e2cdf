/// Errors raised while parsing domain values from text.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid chunk digest '{value}': {reason}")]
    InvalidDigest { value: String, reason: String },
    #[error("unknown compression algorithm '{0}'")]
    UnknownCompression(String),
    #[error("blob id must not be empty")]
    EmptyBlobId,
}
