//! Relay-style cursor pagination
//!
//! [`Paginator`] turns an already-filtered candidate set into a [`Connection`]
//! page. Items are ordered by a caller-supplied [`SortKey`]; that ordering must
//! match whatever produced the candidates, otherwise pages drift.

use std::borrow::Cow;

use async_graphql::{InputObject, Object, OutputType, SimpleObject, TypeName};
use tracing::warn;

use crate::config::PaginationConfig;
use crate::cursor::{CursorCodec, SortKey};
use crate::GraphQLError;

/// Page information
#[derive(SimpleObject, Debug, Clone, Default, PartialEq, Eq)]
pub struct PageInfo {
    pub has_next_page: bool,
    pub has_previous_page: bool,
    pub start_cursor: Option<String>,
    pub end_cursor: Option<String>,
}

/// Edge in a connection
#[derive(Debug, Clone, PartialEq)]
pub struct Edge<T> {
    pub cursor: String,
    pub node: T,
}

/// Named after the node type, e.g. `ProductEdge`
impl<T: OutputType> TypeName for Edge<T> {
    fn type_name() -> Cow<'static, str> {
        format!("{}Edge", T::type_name()).into()
    }
}

#[Object(name_type)]
impl<T: OutputType> Edge<T> {
    async fn cursor(&self) -> &str {
        &self.cursor
    }

    async fn node(&self) -> &T {
        &self.node
    }
}

/// Connection (paginated result)
#[derive(Debug, Clone, PartialEq)]
pub struct Connection<T> {
    pub edges: Vec<Edge<T>>,
    pub page_info: PageInfo,
    /// Size of the whole filtered candidate set, when requested
    pub total_count: Option<i64>,
}

/// Named after the node type, e.g. `ProductConnection`
impl<T: OutputType> TypeName for Connection<T> {
    fn type_name() -> Cow<'static, str> {
        format!("{}Connection", T::type_name()).into()
    }
}

#[Object(name_type)]
impl<T: OutputType> Connection<T> {
    async fn edges(&self) -> &[Edge<T>] {
        &self.edges
    }

    async fn page_info(&self) -> &PageInfo {
        &self.page_info
    }

    async fn total_count(&self) -> Option<i64> {
        self.total_count
    }
}

impl<T> Connection<T> {
    /// Create empty connection
    pub fn empty() -> Self {
        Self {
            edges: Vec::new(),
            page_info: PageInfo::default(),
            total_count: None,
        }
    }

    /// Nodes of this page, in edge order
    pub fn nodes(&self) -> impl Iterator<Item = &T> {
        self.edges.iter().map(|e| &e.node)
    }

    /// Convert every node, keeping cursors and page info
    pub fn map<U, F>(self, mut f: F) -> Connection<U>
    where
        F: FnMut(T) -> U,
    {
        Connection {
            edges: self
                .edges
                .into_iter()
                .map(|Edge { cursor, node }| Edge {
                    cursor,
                    node: f(node),
                })
                .collect(),
            page_info: self.page_info,
            total_count: self.total_count,
        }
    }
}

/// Pagination input for GraphQL queries
///
/// Follows the Relay Cursor Connections Specification:
/// https://relay.dev/graphql/connections.htm
#[derive(InputObject, Debug, Clone, Default, PartialEq, Eq)]
pub struct PaginationInput {
    /// Number of items to return (forward pagination)
    pub first: Option<i32>,

    /// Cursor to start from (forward pagination)
    pub after: Option<String>,

    /// Number of items to return (backward pagination)
    pub last: Option<i32>,

    /// Cursor to start from (backward pagination)
    pub before: Option<String>,
}

/// Ordering direction of a page window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderDirection {
    /// Items after the boundary, smallest first
    Forward,
    /// Items before the boundary, taken from the largest end
    Backward,
}

/// Validated and decoded pagination arguments.
///
/// Resolvers that page inside storage can translate this into a keyset query:
/// order by the sort fields in `direction`, keep rows strictly past `boundary`
/// and fetch [`PageWindow::query_limit`] rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageWindow {
    pub direction: OrderDirection,
    pub page_size: usize,
    pub boundary: Option<SortKey>,
}

impl PageWindow {
    /// Page size plus one look-ahead row used to detect a further page
    pub fn query_limit(&self) -> usize {
        self.page_size + 1
    }
}

impl PaginationInput {
    /// Forward page of `first` items after `after`
    pub fn forward(first: i32, after: Option<String>) -> Self {
        Self {
            first: Some(first),
            after,
            ..Default::default()
        }
    }

    /// Backward page of `last` items before `before`
    pub fn backward(last: i32, before: Option<String>) -> Self {
        Self {
            last: Some(last),
            before,
            ..Default::default()
        }
    }

    /// Validate pagination input
    pub fn validate(&self, config: &PaginationConfig) -> crate::Result<()> {
        if self.first.is_some() && self.last.is_some() {
            return Err(GraphQLError::PaginationError(
                "Cannot specify both 'first' and 'last'".to_string(),
            ));
        }
        if self.first.is_some() && self.before.is_some() {
            return Err(GraphQLError::PaginationError(
                "'first' and 'before' cannot be combined".to_string(),
            ));
        }
        if self.last.is_some() && self.after.is_some() {
            return Err(GraphQLError::PaginationError(
                "'last' and 'after' cannot be combined".to_string(),
            ));
        }
        if self.after.is_some() && self.before.is_some() {
            return Err(GraphQLError::PaginationError(
                "'after' and 'before' cannot be combined".to_string(),
            ));
        }

        check_count("first", self.first, config)?;
        check_count("last", self.last, config)
    }

    /// Number of edges requested, falling back to the configured default
    pub fn page_size(&self, config: &PaginationConfig) -> usize {
        self.first
            .or(self.last)
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(config.default_page_size)
            .min(config.max_page_size)
    }

    /// Check if backward pagination
    pub fn is_backward(&self) -> bool {
        self.last.is_some() || (self.first.is_none() && self.before.is_some())
    }

    /// Check if forward pagination
    pub fn is_forward(&self) -> bool {
        !self.is_backward()
    }

    /// Validate the arguments and decode the boundary cursor
    pub fn resolve(&self, config: &PaginationConfig) -> crate::Result<PageWindow> {
        self.validate(config)?;

        let cursor = if self.is_backward() {
            self.before.as_deref()
        } else {
            self.after.as_deref()
        };
        let boundary = cursor.map(CursorCodec::decode).transpose()?;

        Ok(PageWindow {
            direction: if self.is_backward() {
                OrderDirection::Backward
            } else {
                OrderDirection::Forward
            },
            page_size: self.page_size(config),
            boundary,
        })
    }
}

fn check_count(name: &str, value: Option<i32>, config: &PaginationConfig) -> crate::Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if value <= 0 {
        return Err(GraphQLError::PaginationError(format!(
            "'{}' must be positive",
            name
        )));
    }
    if value as usize > config.max_page_size {
        return Err(GraphQLError::PaginationError(format!(
            "'{}' cannot exceed {}",
            name, config.max_page_size
        )));
    }
    Ok(())
}

/// Builds one connection page out of an in-memory candidate set
#[derive(Debug, Clone)]
pub struct Paginator<'a> {
    input: &'a PaginationInput,
    config: PaginationConfig,
    total_count: bool,
}

impl<'a> Paginator<'a> {
    /// Paginator for `input` with the default page-size limits
    pub fn new(input: &'a PaginationInput) -> Self {
        Self {
            input,
            config: PaginationConfig::default(),
            total_count: false,
        }
    }

    /// Override the page-size limits
    pub fn config(mut self, config: PaginationConfig) -> Self {
        self.config = config;
        self
    }

    /// Report the size of the full candidate set as `totalCount`
    pub fn with_total_count(mut self) -> Self {
        self.total_count = true;
        self
    }

    /// Paginate `items`, ordered by `sort_key_of`.
    ///
    /// Edges are always emitted in ascending sort order, for backward pages too.
    pub fn paginate<T, F>(&self, items: Vec<T>, sort_key_of: F) -> crate::Result<Connection<T>>
    where
        F: Fn(&T) -> SortKey,
    {
        let window = self.input.resolve(&self.config)?;
        let total = items.len();

        let mut keyed: Vec<(SortKey, T)> = items
            .into_iter()
            .map(|item| (sort_key_of(&item), item))
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));

        if keyed.windows(2).any(|pair| pair[0].0 == pair[1].0) {
            warn!(
                fields = %keyed[0].0.describe_shape(),
                "duplicate sort keys in connection; the last sort field should be unique"
            );
        }

        if let (Some(boundary), Some((first_key, _))) = (&window.boundary, keyed.first()) {
            if !first_key.same_shape(boundary) {
                return Err(GraphQLError::InvalidCursor(format!(
                    "cursor was issued for ordering ({}) but this connection is ordered by ({})",
                    boundary.describe_shape(),
                    first_key.describe_shape()
                )));
            }
        }

        let (selected, has_next_page, has_previous_page) = match window.direction {
            OrderDirection::Forward => {
                let start = match &window.boundary {
                    Some(b) => keyed.partition_point(|(k, _)| k <= b),
                    None => 0,
                };
                let mut selected: Vec<(SortKey, T)> =
                    keyed.into_iter().skip(start).take(window.query_limit()).collect();
                let has_next = selected.len() > window.page_size;
                selected.truncate(window.page_size);
                (selected, has_next, window.boundary.is_some() && start > 0)
            }
            OrderDirection::Backward => {
                let len = keyed.len();
                let end = match &window.boundary {
                    Some(b) => keyed.partition_point(|(k, _)| k < b),
                    None => len,
                };
                let from = end.saturating_sub(window.query_limit());
                keyed.truncate(end);
                let mut selected = keyed.split_off(from);
                let has_previous = selected.len() > window.page_size;
                if has_previous {
                    selected.remove(0);
                }
                (selected, window.boundary.is_some() && end < len, has_previous)
            }
        };

        let edges = selected
            .into_iter()
            .map(|(key, node)| {
                Ok(Edge {
                    cursor: CursorCodec::encode(&key)?,
                    node,
                })
            })
            .collect::<crate::Result<Vec<_>>>()?;

        Ok(Connection {
            page_info: PageInfo {
                has_next_page,
                has_previous_page,
                start_cursor: edges.first().map(|e| e.cursor.clone()),
                end_cursor: edges.last().map(|e| e.cursor.clone()),
            },
            edges,
            total_count: self.total_count.then_some(total as i64),
        })
    }

    /// Paginate and convert each selected item into its API representation
    pub fn paginate_map<T, U, F, M>(
        &self,
        items: Vec<T>,
        sort_key_of: F,
        to_node: M,
    ) -> crate::Result<Connection<U>>
    where
        F: Fn(&T) -> SortKey,
        M: FnMut(T) -> U,
    {
        Ok(self.paginate(items, sort_key_of)?.map(to_node))
    }
}
