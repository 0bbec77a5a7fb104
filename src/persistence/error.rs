//! Persistence error types

use std::fmt;

/// Storage failure reported by the persistence layer.
///
/// Callers treat every variant as recoverable: in-memory state stays
/// authoritative and the condition is logged.
#[derive(Debug)]
pub enum PersistenceError {
    Io(std::io::Error),
    Serialize(String),
    Deserialize(String),
    /// Backend rejected the operation
    Storage(String),
    /// Writer queue is full or closed
    Unavailable(&'static str),
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "IO error: {}", e),
            Self::Serialize(e) => write!(f, "serialization error: {}", e),
            Self::Deserialize(e) => write!(f, "deserialization error: {}", e),
            Self::Storage(e) => write!(f, "storage error: {}", e),
            Self::Unavailable(why) => write!(f, "persistence unavailable: {}", why),
        }
    }
}

impl std::error::Error for PersistenceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PersistenceError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<fjall::Error> for PersistenceError {
    fn from(err: fjall::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for PersistenceError {
    fn from(err: bincode::error::EncodeError) -> Self {
        Self::Serialize(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for PersistenceError {
    fn from(err: bincode::error::DecodeError) -> Self {
        Self::Deserialize(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PersistenceError>;
