//! Configuration for pagination limits, loader batching and request scope

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::{GraphQLError, Result};

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;
pub const DEFAULT_LOADER_DELAY_MS: u64 = 1;
pub const DEFAULT_MAX_BATCH_SIZE: usize = 1000;

/// Page size limits applied to `first` / `last`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PaginationConfig {
    /// Used when neither `first` nor `last` is provided
    pub default_page_size: usize,
    /// Upper bound for `first` / `last`
    pub max_page_size: usize,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            default_page_size: DEFAULT_PAGE_SIZE,
            max_page_size: MAX_PAGE_SIZE,
        }
    }
}

impl PaginationConfig {
    /// Reject page sizes that cannot produce a page
    pub fn validate(&self) -> Result<()> {
        if self.default_page_size == 0 || self.max_page_size == 0 {
            return Err(GraphQLError::Config(
                "page sizes must be positive".to_string(),
            ));
        }
        if self.default_page_size > self.max_page_size {
            return Err(GraphQLError::Config(format!(
                "default page size {} exceeds max page size {}",
                self.default_page_size, self.max_page_size
            )));
        }
        Ok(())
    }
}

/// Batching behaviour of every [`DataLoader`](crate::DataLoader)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DataLoaderConfig {
    /// How long a batch keeps collecting keys after its first key arrives
    pub delay_ms: u64,
    /// A batch is dispatched immediately once it holds this many distinct keys
    pub max_batch_size: usize,
}

impl Default for DataLoaderConfig {
    fn default() -> Self {
        Self {
            delay_ms: DEFAULT_LOADER_DELAY_MS,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }
}

impl DataLoaderConfig {
    /// Coalescing window as a [`Duration`]
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Reject a zero batch size
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(GraphQLError::Config(
                "max batch size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Top-level configuration for the GraphQL layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GraphQLConfig {
    pub pagination: PaginationConfig,
    pub loaders: DataLoaderConfig,
    /// Requests running longer than this are abandoned and their loaders cancelled
    pub request_timeout_ms: Option<u64>,
}

impl GraphQLConfig {
    /// Read configuration from `GRAPHQL_*` environment variables, falling back to defaults
    pub fn from_env() -> Result<Self> {
        let config = Self {
            pagination: PaginationConfig {
                default_page_size: env_or("GRAPHQL_DEFAULT_PAGE_SIZE", DEFAULT_PAGE_SIZE)?,
                max_page_size: env_or("GRAPHQL_MAX_PAGE_SIZE", MAX_PAGE_SIZE)?,
            },
            loaders: DataLoaderConfig {
                delay_ms: env_or("GRAPHQL_LOADER_DELAY_MS", DEFAULT_LOADER_DELAY_MS)?,
                max_batch_size: env_or("GRAPHQL_LOADER_MAX_BATCH", DEFAULT_MAX_BATCH_SIZE)?,
            },
            request_timeout_ms: match env::var("GRAPHQL_REQUEST_TIMEOUT_MS") {
                Ok(raw) => Some(parse_var("GRAPHQL_REQUEST_TIMEOUT_MS", &raw)?),
                Err(_) => None,
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.pagination.validate()?;
        self.loaders.validate()
    }

    /// Request timeout, if one is configured
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => parse_var(name, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_var<T>(name: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| GraphQLError::Config(format!("Invalid {}: {}", name, e)))
}
