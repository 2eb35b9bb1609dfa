//! Error type definitions for epg2xml
//!
//! A small hierarchy: provider-scoped and cache errors roll up into
//! [`AppError`], which the binary maps onto a process exit code.

use thiserror::Error;

/// Top-level application error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Channel cache errors
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Provider-scoped errors
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Output sink errors (disk full, broken socket, ...)
    #[error("Output sink error: {0}")]
    Sink(#[source] std::io::Error),

    /// The run was cancelled by an interrupt signal
    #[error("Interrupted")]
    Interrupted,

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Provider-scoped errors
///
/// Every variant names the provider so logs are diagnosable without looking
/// at the output document.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// No factory registered for the configured provider kind
    #[error("Unknown provider kind '{kind}' for provider {provider}")]
    UnknownKind { provider: String, kind: String },

    /// Provider configuration is invalid
    #[error("Invalid configuration for {provider}: {field} - {message}")]
    InvalidConfig {
        provider: String,
        field: String,
        message: String,
    },

    /// Channel discovery failed
    #[error("Channel discovery failed for {provider}: {message}")]
    Discovery { provider: String, message: String },

    /// Program fetch failed
    #[error("Program fetch failed for {provider}: {message}")]
    Fetch { provider: String, message: String },

    /// Upstream data could not be parsed
    #[error("Parse error for {provider}: {message}")]
    Parse { provider: String, message: String },

    /// HTTP errors from the upstream service
    #[error("HTTP error for {provider}: {message}")]
    Http { provider: String, message: String },

    /// Provider exceeded its fetch deadline
    #[error("Program fetch for {provider} timed out after {elapsed}")]
    Timeout { provider: String, elapsed: String },
}

/// Channel cache errors
#[derive(Error, Debug)]
pub enum CacheError {
    /// Snapshot file could not be read or written
    #[error("Cache I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Snapshot content is not valid JSON for the cache schema
    #[error("Cache JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience methods for creating common error types
impl AppError {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether this error must abort the run.
    ///
    /// Provider errors are isolated at the provider boundary and a cache
    /// failure only loses the snapshot; interruption is a clean exit.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Sink(_) | Self::Internal { .. } | Self::Configuration { .. }
        )
    }
}

impl ProviderError {
    /// Create a discovery error
    pub fn discovery<P: Into<String>, M: Into<String>>(provider: P, message: M) -> Self {
        Self::Discovery {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a fetch error
    pub fn fetch<P: Into<String>, M: Into<String>>(provider: P, message: M) -> Self {
        Self::Fetch {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a parse error
    pub fn parse<P: Into<String>, M: Into<String>>(provider: P, message: M) -> Self {
        Self::Parse {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create an HTTP error
    pub fn http<P: Into<String>, M: Into<String>>(provider: P, message: M) -> Self {
        Self::Http {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config<P: Into<String>, F: Into<String>, M: Into<String>>(
        provider: P,
        field: F,
        message: M,
    ) -> Self {
        Self::InvalidConfig {
            provider: provider.into(),
            field: field.into(),
            message: message.into(),
        }
    }
}

impl CacheError {
    pub fn io<P: AsRef<std::path::Path>>(path: P, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality_classification() {
        assert!(AppError::Sink(std::io::Error::other("broken pipe")).is_fatal());
        assert!(AppError::internal("join failure").is_fatal());
        assert!(!AppError::Interrupted.is_fatal());
        assert!(!AppError::from(ProviderError::fetch("KT", "boom")).is_fatal());
    }

    #[test]
    fn test_provider_error_names_provider() {
        let err = ProviderError::discovery("SK", "status 500");
        assert_eq!(
            err.to_string(),
            "Channel discovery failed for SK: status 500"
        );
    }
}
