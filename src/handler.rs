//! GraphQL HTTP handler with request-scoped loaders
//!
//! Provides helpers for:
//! - Building a fresh [`RequestLoaders`] for every request
//! - Injecting it into the GraphQL request data
//! - Abandoning requests that exceed the configured timeout

use std::sync::Arc;
use std::time::Duration;

use async_graphql::{Request, Response, Schema, ServerError};
use axum::{extract::Extension, Json};
use tracing::{debug, warn};

use crate::config::GraphQLConfig;
use crate::context::{RequestLoaders, RequestLoadersBuilder};
use crate::DataLoaderConfig;

type BuildFn = dyn Fn(RequestLoadersBuilder) -> RequestLoadersBuilder + Send + Sync;

/// Creates the loader scope of each request
#[derive(Clone)]
pub struct ScopeFactory {
    build: Arc<BuildFn>,
    loader_config: DataLoaderConfig,
    request_timeout: Option<Duration>,
}

impl ScopeFactory {
    /// `build` registers the application's loaders on a fresh builder
    pub fn new<F>(build: F) -> Self
    where
        F: Fn(RequestLoadersBuilder) -> RequestLoadersBuilder + Send + Sync + 'static,
    {
        Self {
            build: Arc::new(build),
            loader_config: DataLoaderConfig::default(),
            request_timeout: None,
        }
    }

    /// Apply loader batching and request timeout settings
    pub fn with_config(mut self, config: &GraphQLConfig) -> Self {
        self.loader_config = config.loaders;
        self.request_timeout = config.request_timeout();
        self
    }

    /// Abandon requests that run longer than `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Build the loaders for one request
    pub fn scope(&self) -> RequestLoaders {
        (self.build)(RequestLoadersBuilder::new(self.loader_config)).build()
    }

    /// Configured request timeout, `None` when requests may run indefinitely
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }
}

/// Execute `request` inside a fresh loader scope, cancelling it afterwards
pub async fn execute_scoped<Query, Mutation, Subscription>(
    schema: &Schema<Query, Mutation, Subscription>,
    factory: &ScopeFactory,
    request: Request,
) -> Response
where
    Query: async_graphql::ObjectType + 'static,
    Mutation: async_graphql::ObjectType + 'static,
    Subscription: async_graphql::SubscriptionType + 'static,
{
    let loaders = factory.scope();
    debug!(loaders = loaders.len(), "request scope created");
    let request = request.data(loaders.clone());

    let response = match factory.request_timeout() {
        Some(timeout) => match tokio::time::timeout(timeout, schema.execute(request)).await {
            Ok(response) => response,
            Err(_) => {
                warn!(?timeout, "GraphQL request timed out");
                Response::from_errors(vec![ServerError::new("request timed out", None)])
            }
        },
        None => schema.execute(request).await,
    };

    loaders.cancel_all();
    response
}

/// Standard GraphQL handler with a per-request loader scope
///
/// # Example
///
/// ```rust,no_run
/// use axum::{Extension, Router, routing::post};
/// use storefront_graphql::handler::{graphql_handler, ScopeFactory};
/// use async_graphql::{EmptyMutation, EmptySubscription, Schema};
///
/// # struct Query;
/// # #[async_graphql::Object]
/// # impl Query { async fn ping(&self) -> bool { true } }
/// # async fn example() {
/// let schema = Schema::new(Query, EmptyMutation, EmptySubscription);
/// let app: Router = Router::new()
///     .route("/graphql", post(graphql_handler::<Query, EmptyMutation, EmptySubscription>))
///     .layer(Extension(schema))
///     .layer(Extension(ScopeFactory::new(|loaders| loaders)));
/// # }
/// ```
pub async fn graphql_handler<Query, Mutation, Subscription>(
    Extension(schema): Extension<Schema<Query, Mutation, Subscription>>,
    Extension(factory): Extension<ScopeFactory>,
    req: Json<Request>,
) -> Json<Response>
where
    Query: async_graphql::ObjectType + 'static,
    Mutation: async_graphql::ObjectType + 'static,
    Subscription: async_graphql::SubscriptionType + 'static,
{
    Json(execute_scoped(&schema, &factory, req.0).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{context::loader, BatchLoader, DataLoader, FetchError, LoadError, LoadHandle};
    use async_graphql::{Context, EmptyMutation, EmptySubscription, Object};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    static BATCHES: AtomicUsize = AtomicUsize::new(0);

    struct TitleById;

    #[async_trait]
    impl BatchLoader for TitleById {
        type Key = String;
        type Value = String;

        async fn load_batch(&self, keys: &[String]) -> Result<HashMap<String, String>, FetchError> {
            BATCHES.fetch_add(1, Ordering::SeqCst);
            Ok(keys
                .iter()
                .filter(|k| k.as_str() != "gone")
                .map(|k| (k.clone(), format!("Title {}", k)))
                .collect())
        }
    }

    /// Backend that never answers
    struct StalledWarehouse;

    #[async_trait]
    impl BatchLoader for StalledWarehouse {
        type Key = String;
        type Value = i64;

        async fn load_batch(&self, _keys: &[String]) -> Result<HashMap<String, i64>, FetchError> {
            std::future::pending().await
        }
    }

    type ParkedHandle = Arc<Mutex<Option<LoadHandle<i64>>>>;

    struct Query;

    #[Object]
    impl Query {
        async fn title(&self, ctx: &Context<'_>, id: String) -> async_graphql::Result<Option<String>> {
            Ok(loader::<TitleById>(ctx)?.load(id).await?)
        }

        async fn stock(&self, ctx: &Context<'_>, variant: String) -> async_graphql::Result<Option<i64>> {
            let warehouse = loader::<StalledWarehouse>(ctx)?;
            if let Ok(parked) = ctx.data::<ParkedHandle>() {
                *parked.lock().unwrap() = Some(warehouse.enqueue(format!("{}-reserved", variant)));
            }
            Ok(warehouse.load(variant).await?)
        }

        async fn slow(&self) -> bool {
            tokio::time::sleep(Duration::from_secs(5)).await;
            true
        }
    }

    fn schema() -> Schema<Query, EmptyMutation, EmptySubscription> {
        Schema::new(Query, EmptyMutation, EmptySubscription)
    }

    #[tokio::test]
    async fn test_sibling_fields_batch_through_scope() {
        let factory = ScopeFactory::new(|loaders| loaders.with(TitleById));
        let before = BATCHES.load(Ordering::SeqCst);

        let response = execute_scoped(
            &schema(),
            &factory,
            Request::new(r#"{ a: title(id: "1") b: title(id: "2") c: title(id: "1") d: title(id: "gone") }"#),
        )
        .await;

        assert!(response.errors.is_empty(), "{:?}", response.errors);
        let data = response.data.into_json().unwrap();
        assert_eq!(data["a"], "Title 1");
        assert_eq!(data["b"], "Title 2");
        assert_eq!(data["c"], "Title 1");
        assert!(data["d"].is_null());
        assert_eq!(BATCHES.load(Ordering::SeqCst) - before, 1);
    }

    #[tokio::test]
    async fn test_missing_loader_is_a_field_error() {
        let factory = ScopeFactory::new(|loaders| loaders);
        let response = execute_scoped(&schema(), &factory, Request::new(r#"{ title(id: "1") }"#)).await;
        assert_eq!(response.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let factory = ScopeFactory::new(|loaders| loaders).with_timeout(Duration::from_millis(20));
        let response = execute_scoped(&schema(), &factory, Request::new("{ slow }")).await;
        assert_eq!(response.errors.len(), 1);
        assert_eq!(response.errors[0].message, "request timed out");
    }

    #[tokio::test]
    async fn test_timeout_cancels_loaders_and_releases_waiters() {
        let captured: Arc<Mutex<Option<DataLoader<StalledWarehouse>>>> = Arc::default();
        let slot = captured.clone();
        let factory = ScopeFactory::new(move |loaders| {
            let warehouse = DataLoader::new(StalledWarehouse);
            *slot.lock().unwrap() = Some(warehouse.clone());
            loaders.with_loader(warehouse)
        })
        .with_timeout(Duration::from_millis(20));

        let parked = ParkedHandle::default();
        let schema = Schema::build(Query, EmptyMutation, EmptySubscription)
            .data(parked.clone())
            .finish();

        let response = execute_scoped(&schema, &factory, Request::new(r#"{ stock(variant: "v-1") }"#)).await;
        assert_eq!(response.errors.len(), 1);
        assert_eq!(response.errors[0].message, "request timed out");

        let warehouse = captured.lock().unwrap().take().unwrap();
        assert!(warehouse.is_cancelled());

        // enqueued inside the resolver before the timeout fired
        let handle = parked.lock().unwrap().take().unwrap();
        let released = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(matches!(released, Ok(Err(LoadError::Cancelled))));

        let late = warehouse.enqueue("v-2".to_string()).await;
        assert!(matches!(late, Err(LoadError::Cancelled)));
    }

    #[test]
    fn test_factory_applies_config() {
        let config = GraphQLConfig {
            request_timeout_ms: Some(1500),
            ..Default::default()
        };
        let factory = ScopeFactory::new(|loaders| loaders.with(TitleById)).with_config(&config);
        assert_eq!(factory.request_timeout(), Some(Duration::from_millis(1500)));

        let scope = factory.scope();
        let titles = scope.get::<TitleById>().unwrap();
        assert_eq!(titles.config(), &config.loaders);
    }
}
