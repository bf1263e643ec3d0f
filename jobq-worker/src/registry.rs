//! Registry mapping job type strings to handlers.
//!
//! Each worker process registers its handlers at startup; the dispatch loop
//! looks them up by the `type` of every claimed job. The queue itself never
//! consults the registry.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use anyhow::Result;
use serde_json::Value;
use sqlx::postgres::PgPool;

/// Type alias for the async handler function.
///
/// Handlers receive a database handle and the job payload only. The claim
/// bookkeeping stays with the worker, so handlers cannot observe or mutate
/// queue columns.
pub type BoxedHandler = Box<
    dyn Fn(PgPool, Value) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> + Send + Sync,
>;

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, BoxedHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// The handlers every worker ships with.
    pub fn with_builtin_handlers() -> Self {
        let mut registry = Self::new();
        registry.register("ping", crate::handlers::ping);
        registry.register("location.upsert", crate::handlers::location_upsert);
        registry
    }

    /// Register a handler for `job_type`. Registration is process-lifetime;
    /// registering the same type again replaces the previous handler.
    pub fn register<F, Fut>(&mut self, job_type: &'static str, handler: F)
    where
        F: Fn(PgPool, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.handlers.insert(
            job_type,
            Box::new(move |db, payload| Box::pin(handler(db, payload))),
        );
    }

    pub fn get(&self, job_type: &str) -> Option<&BoxedHandler> {
        self.handlers.get(job_type)
    }
}
