//! # storefront-graphql
//!
//! Resolver-side building blocks for the storefront GraphQL API.
//!
//! ## Features
//!
//! - **Cursor Pagination** - Relay-style connections over typed, resumable sort keys
//! - **DataLoader** - Request-scoped batch loading for N+1 prevention
//! - **Request Scope** - Per-request loader registry injected into the GraphQL context
//! - **Axum Handler** - GraphQL endpoint that builds and tears down the request scope
//!
//! ## Usage
//!
//! ```rust,no_run
//! use storefront_graphql::cursor::SortKey;
//! use storefront_graphql::pagination::{PaginationInput, Paginator};
//!
//! # fn example() -> storefront_graphql::Result<()> {
//! let names = vec![("Apple", "1"), ("Banana", "2"), ("Cherry", "3")];
//! let input = PaginationInput { first: Some(2), ..Default::default() };
//!
//! let connection = Paginator::new(&input)
//!     .with_total_count()
//!     .paginate(names, |(name, id)| SortKey::new().field("name", *name).field("id", *id))?;
//! assert!(connection.page_info.has_next_page);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod cursor;
pub mod dataloaders;
pub mod handler;
pub mod keys;
pub mod pagination;

pub use config::{DataLoaderConfig, GraphQLConfig, PaginationConfig};
pub use context::{loader, RequestLoaders, RequestLoadersBuilder};
pub use cursor::{CursorCodec, SortKey, SortValue};
pub use dataloaders::{BatchLoader, DataLoader, LoadHandle, LoadResult};
pub use handler::{graphql_handler, ScopeFactory};
pub use keys::CompositeKey;
pub use pagination::{Connection, Edge, OrderDirection, PageInfo, PageWindow, PaginationInput, Paginator};

use std::sync::Arc;

use async_graphql::ErrorExtensions;
use thiserror::Error;

/// GraphQL errors
#[derive(Error, Debug)]
pub enum GraphQLError {
    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("Pagination error: {0}")]
    PaginationError(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Load(#[from] LoadError),
}

impl GraphQLError {
    /// Stable code exposed in the `extensions.code` of the GraphQL error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidCursor(_) => "INVALID_CURSOR",
            Self::PaginationError(_) => "PAGINATION_INVALID",
            Self::InvalidKey(_) => "INVALID_KEY",
            Self::Config(_) => "CONFIG",
            Self::Load(err) => err.code(),
        }
    }
}

impl ErrorExtensions for GraphQLError {
    fn extend(&self) -> async_graphql::Error {
        async_graphql::Error::new(self.to_string()).extend_with(|_, e| e.set("code", self.code()))
    }
}

/// Result type for GraphQL operations
pub type Result<T> = std::result::Result<T, GraphQLError>;

/// Outcome of a failed or abandoned load.
///
/// Cloned to every caller that was waiting on the same batch.
#[derive(Error, Debug, Clone)]
pub enum LoadError {
    #[error("batch fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("load cancelled: the owning request ended before the batch completed")]
    Cancelled,
}

impl LoadError {
    /// Stable code exposed in the `extensions.code` of the GraphQL error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Fetch(_) => "FETCH_FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl ErrorExtensions for LoadError {
    fn extend(&self) -> async_graphql::Error {
        async_graphql::Error::new(self.to_string()).extend_with(|_, e| e.set("code", self.code()))
    }
}

/// Failure reported by a [`BatchLoader`] for a whole batch.
#[derive(Error, Debug, Clone)]
#[error("{message}{}", source_suffix(.source))]
pub struct FetchError {
    message: String,
    #[source]
    source: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
}

fn source_suffix(source: &Option<Arc<dyn std::error::Error + Send + Sync + 'static>>) -> String {
    source.as_ref().map(|s| format!(": {}", s)).unwrap_or_default()
}

impl FetchError {
    /// Batch failure described by a message alone.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap a backend error, keeping it as the error source.
    pub fn from_error<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    /// The message without the source's text.
    pub fn message(&self) -> &str {
        &self.message
    }
}
