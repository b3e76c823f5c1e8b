//! Capability Table
//!
//! The host application exposes its action/query surface to the transport
//! layer as a capability table: a set of named callables the relay server and
//! the tool-call endpoint dispatch into by channel name. The transport never
//! inspects business semantics, only existence: an absent entry is an
//! "unknown channel", not a crash.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Errors produced by capability dispatch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CapabilityError {
    /// The channel has no registered handler.
    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    /// The handler itself reported a failure. The message is surfaced
    /// verbatim to the original caller.
    #[error("{0}")]
    Handler(String),
}

impl From<CapabilityError> for String {
    fn from(err: CapabilityError) -> String {
        err.to_string()
    }
}

/// The action/query surface injected by the host application.
///
/// Both the relay server and the tool-call endpoint hold the table as
/// `Arc<dyn CapabilityTable>` and must treat every call as potentially
/// concurrent with any other; the host is responsible for whatever internal
/// serialization its handlers need.
#[async_trait]
pub trait CapabilityTable: Send + Sync {
    /// Dispatch a fire-and-forget action.
    async fn action(&self, channel: &str, data: Value) -> Result<(), CapabilityError>;

    /// Execute a correlated query and return its value.
    async fn query(&self, channel: &str, args: Vec<Value>) -> Result<Value, CapabilityError>;
}

type ActionFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;
type QueryFuture = Pin<Box<dyn Future<Output = Result<Value, String>> + Send>>;

type ActionFn = Arc<dyn Fn(Value) -> ActionFuture + Send + Sync>;
type QueryFn = Arc<dyn Fn(Vec<Value>) -> QueryFuture + Send + Sync>;

/// The standard [`CapabilityTable`] implementation: two name → handler maps
/// populated by the host at composition time and immutable afterwards.
#[derive(Default)]
pub struct CapabilityRegistry {
    actions: HashMap<String, ActionFn>,
    queries: HashMap<String, QueryFn>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named action handler. Replaces any previous handler for the
    /// same channel.
    pub fn register_action<F, Fut>(&mut self, channel: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let wrapped: ActionFn = Arc::new(move |data| -> ActionFuture { Box::pin(handler(data)) });
        self.actions.insert(channel.into(), wrapped);
    }

    /// Register a named query handler. Replaces any previous handler for the
    /// same channel.
    pub fn register_query<F, Fut>(&mut self, channel: impl Into<String>, handler: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        let wrapped: QueryFn = Arc::new(move |args| -> QueryFuture { Box::pin(handler(args)) });
        self.queries.insert(channel.into(), wrapped);
    }

    /// Channel names with a registered action handler.
    pub fn action_channels(&self) -> Vec<&str> {
        self.actions.keys().map(String::as_str).collect()
    }

    /// Channel names with a registered query handler.
    pub fn query_channels(&self) -> Vec<&str> {
        self.queries.keys().map(String::as_str).collect()
    }
}

#[async_trait]
impl CapabilityTable for CapabilityRegistry {
    async fn action(&self, channel: &str, data: Value) -> Result<(), CapabilityError> {
        let handler = self
            .actions
            .get(channel)
            .cloned()
            .ok_or_else(|| CapabilityError::UnknownChannel(channel.to_string()))?;
        handler(data).await.map_err(CapabilityError::Handler)
    }

    async fn query(&self, channel: &str, args: Vec<Value>) -> Result<Value, CapabilityError> {
        let handler = self
            .queries
            .get(channel)
            .cloned()
            .ok_or_else(|| CapabilityError::UnknownChannel(channel.to_string()))?;
        handler(args).await.map_err(CapabilityError::Handler)
    }
}
