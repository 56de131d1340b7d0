//! Error types for cache and configuration operations.

use std::fmt;

/// Errors returned by cache manager operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    /// The key is not present (or has expired).
    NotFound,

    /// The key is already present (for ADD operations).
    Exists,

    /// The caller's cache id does not match the stored item.
    Mismatch,

    /// A non-zero watch id was supplied but no such watch exists.
    WatchNotFound,

    /// The memory ceiling would be exceeded by the allocation.
    OutOfMemory,

    /// The requested item is larger than the largest size class.
    TooLarge,

    /// The key is too long (max 255 bytes).
    KeyTooLong,

    /// The item was allocated by a different cache manager.
    ForeignItem,
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::Exists => write!(f, "key already exists"),
            Self::Mismatch => write!(f, "cache id mismatch"),
            Self::WatchNotFound => write!(f, "watch not found"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::TooLarge => write!(f, "item too large"),
            Self::KeyTooLong => write!(f, "key too long (max 255 bytes)"),
            Self::ForeignItem => write!(f, "item allocated by another manager"),
        }
    }
}

impl std::error::Error for CacheError {}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid TOML for this schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A size string such as `"64MB"` could not be parsed.
    #[error("invalid size: {0}")]
    InvalidSize(String),

    /// A value parsed but violates a configuration rule.
    #[error("invalid config: {0}")]
    Invalid(String),
}
