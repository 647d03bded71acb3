//! Error types for the photo cache

use disk_lru_cache::DiskCacheError;
use std::fmt;

#[derive(Debug)]
pub enum CacheError {
    Disk(Box<DiskCacheError>),
    Io(Box<std::io::Error>),
    Serialization(String),
    /// The stored value is not of the requested kind
    TypeMismatch { expected: String, found: String },
    Config(String),
    NotInitialized,
    AlreadyInitialized,
    /// A blocking disk task panicked or was cancelled
    Task(String),
    NotFound(String),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Disk(err) => write!(f, "Disk cache error: {}", err),
            CacheError::Io(err) => write!(f, "IO error: {}", err),
            CacheError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            CacheError::TypeMismatch { expected, found } => {
                write!(f, "Type mismatch: expected {}, found {}", expected, found)
            }
            CacheError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CacheError::NotInitialized => write!(f, "Cache has not been initialized"),
            CacheError::AlreadyInitialized => write!(f, "Cache is already initialized"),
            CacheError::Task(msg) => write!(f, "Background task failed: {}", msg),
            CacheError::NotFound(key) => write!(f, "Not found: {}", key),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::Disk(err) => Some(err.as_ref()),
            CacheError::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<DiskCacheError> for CacheError {
    fn from(err: DiskCacheError) -> Self {
        CacheError::Disk(Box::new(err))
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(Box::new(err))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

impl From<tokio::task::JoinError> for CacheError {
    fn from(err: tokio::task::JoinError) -> Self {
        CacheError::Task(err.to_string())
    }
}

impl From<tracing_subscriber::filter::ParseError> for CacheError {
    fn from(err: tracing_subscriber::filter::ParseError) -> Self {
        CacheError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_mismatch_display() {
        let err = CacheError::TypeMismatch {
            expected: "text".to_string(),
            found: "binary".to_string(),
        };
        assert_eq!(
            format!("{}", err),
            "Type mismatch: expected text, found binary"
        );
    }

    #[test]
    fn test_disk_error_keeps_source() {
        use std::error::Error;

        let err: CacheError = DiskCacheError::Closed.into();
        assert_eq!(format!("{}", err), "Disk cache error: Cache is closed");
        assert!(err.source().is_some());
    }

    #[test]
    fn test_not_initialized_display() {
        assert_eq!(
            format!("{}", CacheError::NotInitialized),
            "Cache has not been initialized"
        );
    }

    #[test]
    fn test_serde_error_conversion() {
        let err: CacheError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, CacheError::Serialization(_)));
    }
}
