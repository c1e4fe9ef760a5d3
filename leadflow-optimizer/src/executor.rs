//! Execute function contract.

use std::future::Future;

use async_trait::async_trait;
use leadflow_core::LeadflowResult;
use serde_json::Value;

/// Result of running one query, with the cost signals the monitor records.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedQuery {
    pub data: Value,
    pub resolver_count: u32,
    pub db_queries: u32,
}

impl ExecutedQuery {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            resolver_count: 0,
            db_queries: 0,
        }
    }

    pub fn with_counts(mut self, resolver_count: u32, db_queries: u32) -> Self {
        self.resolver_count = resolver_count;
        self.db_queries = db_queries;
        self
    }
}

/// Runs a query on a cache miss.
///
/// Loader and circuit errors raised inside should be returned as-is so the
/// caller sees their structured context.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, query: &str, variables: &Value) -> LeadflowResult<ExecutedQuery>;
}

/// Adapter turning an async closure into a [`QueryExecutor`].
pub struct FnExecutor<F> {
    f: F,
}

/// Wrap `f` as a [`QueryExecutor`]. The closure receives owned copies.
pub fn executor_fn<F, Fut>(f: F) -> FnExecutor<F>
where
    F: Fn(String, Value) -> Fut + Send + Sync,
    Fut: Future<Output = LeadflowResult<ExecutedQuery>> + Send,
{
    FnExecutor { f }
}

#[async_trait]
impl<F, Fut> QueryExecutor for FnExecutor<F>
where
    F: Fn(String, Value) -> Fut + Send + Sync,
    Fut: Future<Output = LeadflowResult<ExecutedQuery>> + Send,
{
    async fn execute(&self, query: &str, variables: &Value) -> LeadflowResult<ExecutedQuery> {
        (self.f)(query.to_string(), variables.clone()).await
    }
}
