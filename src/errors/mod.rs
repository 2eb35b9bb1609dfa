//! Centralized error handling for epg2xml
//!
//! Errors are split by the boundary they are allowed to cross:
//!
//! - **Provider Errors**: discovery/fetch failures of a single provider. They
//!   are logged at the provider boundary and never abort sibling providers.
//! - **Cache Errors**: channel snapshot I/O and JSON failures. Loading
//!   recovers from them; saving reports them.
//! - **Application Errors**: configuration, output sink and cancellation.
//!   Sink failures abort the run.
//!
//! # Usage
//!
//! ```rust
//! use epg2xml::errors::{AppError, AppResult};
//!
//! fn example_function() -> AppResult<String> {
//!     Ok("success".to_string())
//! }
//! ```

pub mod types;

pub use types::*;

/// Convenience type alias for Results using AppError
pub type AppResult<T> = Result<T, AppError>;

/// Convenience type alias for provider-scoped Results
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Convenience type alias for channel cache Results
pub type CacheResult<T> = Result<T, CacheError>;
