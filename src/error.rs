use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Invalid DNS packet: {0}")]
    InvalidPacket(String),

    #[error("Invalid label length: {0}")]
    InvalidLabelLength(u8),

    #[error("DNS name too long")]
    NameTooLong,
}

pub type Result<T> = std::result::Result<T, CacheError>;
