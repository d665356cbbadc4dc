//! Request-scoped loader registry
//!
//! Every inbound request gets its own [`RequestLoaders`], carried in the
//! GraphQL request data and reached from resolvers through [`loader`]. Caches
//! and pending batches therefore never outlive, or leak across, a request.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use async_graphql::Context;
use tracing::debug;

use crate::config::DataLoaderConfig;
use crate::dataloaders::{BatchLoader, DataLoader};

trait ScopedLoader: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn cancel(&self);
}

impl<L: BatchLoader> ScopedLoader for DataLoader<L> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn cancel(&self) {
        DataLoader::cancel(self);
    }
}

struct Registry {
    loaders: HashMap<TypeId, Box<dyn ScopedLoader>>,
}

impl Drop for Registry {
    fn drop(&mut self) {
        for loader in self.loaders.values() {
            loader.cancel();
        }
    }
}

/// The loaders of one request, keyed by [`BatchLoader`] type
#[derive(Clone)]
pub struct RequestLoaders {
    registry: Arc<Registry>,
}

impl RequestLoaders {
    /// Builder using the default batching configuration
    pub fn builder() -> RequestLoadersBuilder {
        RequestLoadersBuilder::new(DataLoaderConfig::default())
    }

    /// The request's loader for `L`, if one was registered
    pub fn get<L: BatchLoader>(&self) -> Option<&DataLoader<L>> {
        self.registry
            .loaders
            .get(&TypeId::of::<L>())
            .and_then(|loader| loader.as_any().downcast_ref::<DataLoader<L>>())
    }

    /// Number of registered loaders
    pub fn len(&self) -> usize {
        self.registry.loaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.loaders.is_empty()
    }

    /// Cancel every loader of this request, releasing all waiting callers.
    ///
    /// Also happens automatically once the last handle is dropped.
    pub fn cancel_all(&self) {
        debug!(loaders = self.registry.loaders.len(), "cancelling request loaders");
        for loader in self.registry.loaders.values() {
            loader.cancel();
        }
    }
}

/// Builds a [`RequestLoaders`]; called once per request
pub struct RequestLoadersBuilder {
    config: DataLoaderConfig,
    loaders: HashMap<TypeId, Box<dyn ScopedLoader>>,
}

impl RequestLoadersBuilder {
    /// Empty builder; registered loaders use `config`
    pub fn new(config: DataLoaderConfig) -> Self {
        Self {
            config,
            loaders: HashMap::new(),
        }
    }

    /// Register a loader using the builder's batching configuration.
    ///
    /// A second loader of the same type replaces the first.
    pub fn with<L: BatchLoader>(self, loader: L) -> Self {
        let config = self.config;
        self.with_loader(DataLoader::with_config(loader, config))
    }

    /// Register an already constructed [`DataLoader`]
    pub fn with_loader<L: BatchLoader>(mut self, loader: DataLoader<L>) -> Self {
        self.loaders.insert(TypeId::of::<L>(), Box::new(loader));
        self
    }

    /// Finish the request scope
    pub fn build(self) -> RequestLoaders {
        RequestLoaders {
            registry: Arc::new(Registry {
                loaders: self.loaders,
            }),
        }
    }
}

/// Fetch the current request's loader for `L` from the GraphQL context
///
/// # Example
///
/// ```rust,no_run
/// use async_graphql::Context;
/// use storefront_graphql::{loader, BatchLoader, FetchError};
/// use std::collections::HashMap;
///
/// struct ChannelById;
///
/// #[async_trait::async_trait]
/// impl BatchLoader for ChannelById {
///     type Key = String;
///     type Value = String;
///
///     async fn load_batch(&self, keys: &[String]) -> Result<HashMap<String, String>, FetchError> {
///         Ok(HashMap::new())
///     }
/// }
///
/// async fn resolver(ctx: &Context<'_>, id: String) -> async_graphql::Result<Option<String>> {
///     Ok(loader::<ChannelById>(ctx)?.load(id).await?)
/// }
/// ```
pub fn loader<'a, L: BatchLoader>(ctx: &Context<'a>) -> async_graphql::Result<&'a DataLoader<L>> {
    let loaders = ctx.data::<RequestLoaders>()?;
    loaders.get::<L>().ok_or_else(|| {
        async_graphql::Error::new(format!(
            "no loader registered for {}",
            std::any::type_name::<L>()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FetchError, LoadError};
    use async_trait::async_trait;

    struct NameById;

    #[async_trait]
    impl BatchLoader for NameById {
        type Key = u32;
        type Value = String;

        async fn load_batch(&self, keys: &[u32]) -> Result<HashMap<u32, String>, FetchError> {
            Ok(keys.iter().map(|k| (*k, format!("name-{}", k))).collect())
        }
    }

    struct StockByVariant;

    #[async_trait]
    impl BatchLoader for StockByVariant {
        type Key = String;
        type Value = i64;

        async fn load_batch(&self, keys: &[String]) -> Result<HashMap<String, i64>, FetchError> {
            Ok(keys.iter().map(|k| (k.clone(), k.len() as i64)).collect())
        }
    }

    fn scope() -> RequestLoaders {
        RequestLoaders::builder()
            .with(NameById)
            .with(StockByVariant)
            .build()
    }

    #[tokio::test]
    async fn test_loaders_are_typed() {
        let loaders = scope();
        assert_eq!(loaders.len(), 2);

        let name = loaders.get::<NameById>().unwrap().load(7).await.unwrap();
        assert_eq!(name, Some("name-7".to_string()));

        let stock = loaders
            .get::<StockByVariant>()
            .unwrap()
            .load("abc".to_string())
            .await
            .unwrap();
        assert_eq!(stock, Some(3));
    }

    #[tokio::test]
    async fn test_requests_do_not_share_caches() {
        let first = scope();
        let second = scope();

        let first_names = first.get::<NameById>().unwrap();
        assert!(first_names.prime(1, "primed".to_string()));
        assert_eq!(first_names.load(1).await.unwrap(), Some("primed".to_string()));

        let second_names = second.get::<NameById>().unwrap();
        assert_eq!(second_names.load(1).await.unwrap(), Some("name-1".to_string()));
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let loaders = scope();
        loaders.cancel_all();
        let result = loaders.get::<NameById>().unwrap().load(1).await;
        assert!(matches!(result, Err(LoadError::Cancelled)));
    }

    #[tokio::test]
    async fn test_dropping_scope_cancels_loaders() {
        let loaders = scope();
        let names = loaders.get::<NameById>().unwrap().clone();
        drop(loaders);
        assert!(names.is_cancelled());
    }

    #[test]
    fn test_unregistered_loader() {
        let loaders = RequestLoaders::builder().with(NameById).build();
        assert!(loaders.get::<StockByVariant>().is_none());
    }
}
