use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Core error type for cachify operations
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("factory for '{key}' exceeded the hard timeout of {timeout:?}")]
    HardTimeout { key: String, timeout: Duration },

    #[error("factory failed: {0}")]
    Factory(Arc<dyn std::error::Error + Send + Sync>),

    #[error("store operation failed: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("backplane delivery failed: {0}")]
    Backplane(String),

    #[error("unsupported backplane wire version: {0}")]
    WireVersion(u32),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl CacheError {
    /// Create a new HardTimeout error
    pub fn hard_timeout(key: impl Into<String>, timeout: Duration) -> Self {
        Self::HardTimeout {
            key: key.into(),
            timeout,
        }
    }

    /// Wrap a factory error
    pub fn factory(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Factory(Arc::new(source))
    }

    /// Create a new Store error
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    /// Create a new Backplane error
    pub fn backplane(message: impl Into<String>) -> Self {
        Self::Backplane(message.into())
    }

    /// Create a new Configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Check whether this error came from a timed-out factory
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::HardTimeout { .. })
    }

    /// Check whether this error is swallowed by default (logged, not surfaced)
    pub fn is_swallowed_by_default(&self) -> bool {
        matches!(
            self,
            Self::Serialization(_) | Self::Backplane(_) | Self::WireVersion(_)
        )
    }

    /// Get error category for logging/monitoring
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::HardTimeout { .. } => ErrorCategory::Timeout,
            Self::Factory(_) => ErrorCategory::Factory,
            Self::Store(_) => ErrorCategory::Store,
            Self::Serialization(_) => ErrorCategory::Serialization,
            Self::Backplane(_) | Self::WireVersion(_) => ErrorCategory::Backplane,
            Self::Configuration(_) => ErrorCategory::Configuration,
        }
    }
}

/// Error categories for monitoring and classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Timeout,
    Factory,
    Store,
    Serialization,
    Backplane,
    Configuration,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Factory => write!(f, "factory"),
            Self::Store => write!(f, "store"),
            Self::Serialization => write!(f, "serialization"),
            Self::Backplane => write!(f, "backplane"),
            Self::Configuration => write!(f, "configuration"),
        }
    }
}

/// Convenience result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("downstream unavailable")]
    struct FakeFactoryError;

    #[test]
    fn test_hard_timeout_error() {
        let err = CacheError::hard_timeout("user:1", Duration::from_secs(2));
        assert!(err.to_string().contains("user:1"));
        assert!(err.is_timeout());
        assert_eq!(err.category(), ErrorCategory::Timeout);
    }

    #[test]
    fn test_factory_error_preserves_message() {
        let err = CacheError::factory(FakeFactoryError);
        assert_eq!(err.to_string(), "factory failed: downstream unavailable");
        assert_eq!(err.category(), ErrorCategory::Factory);
    }

    #[test]
    fn test_store_error() {
        let err = CacheError::store("connection refused");
        assert_eq!(
            err.to_string(),
            "store operation failed: connection refused"
        );
        assert!(!err.is_timeout());
        assert_eq!(err.category(), ErrorCategory::Store);
    }

    #[test]
    fn test_serialization_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{ bad").unwrap_err();
        let err: CacheError = json_err.into();
        assert!(matches!(err, CacheError::Serialization(_)));
        assert!(err.is_swallowed_by_default());
        assert_eq!(err.category(), ErrorCategory::Serialization);
    }

    #[test]
    fn test_backplane_errors_are_swallowed() {
        assert!(CacheError::backplane("publish failed").is_swallowed_by_default());
        assert!(CacheError::WireVersion(2).is_swallowed_by_default());
        assert!(!CacheError::store("io").is_swallowed_by_default());
        assert!(!CacheError::hard_timeout("k", Duration::from_secs(1)).is_swallowed_by_default());
    }

    #[test]
    fn test_error_categories_display() {
        assert_eq!(ErrorCategory::Timeout.to_string(), "timeout");
        assert_eq!(ErrorCategory::Factory.to_string(), "factory");
        assert_eq!(ErrorCategory::Store.to_string(), "store");
        assert_eq!(ErrorCategory::Serialization.to_string(), "serialization");
        assert_eq!(ErrorCategory::Backplane.to_string(), "backplane");
        assert_eq!(ErrorCategory::Configuration.to_string(), "configuration");
    }

    #[test]
    fn test_wire_version_category() {
        let err = CacheError::WireVersion(2);
        assert_eq!(err.to_string(), "unsupported backplane wire version: 2");
        assert_eq!(err.category(), ErrorCategory::Backplane);
    }

    #[test]
    fn test_configuration_error() {
        let err = CacheError::configuration("jitter_ratio must be < 1");
        assert_eq!(
            err.to_string(),
            "configuration error: jitter_ratio must be < 1"
        );
        assert_eq!(err.category(), ErrorCategory::Configuration);
    }
}
