//! Task abstraction: what the worker can execute.

pub mod registry;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;

use crate::error::TaskError;
use crate::runner::context::Context;

pub use crate::durable::eviction::EvictionPolicy;
pub use registry::TaskRegistry;

/// Value returned by a successful run. Must be a JSON object (or null).
pub type TaskOutput = serde_json::Value;

/// A task the worker can run.
///
/// Cooperative tasks implement [`Task::call`] and run on the async scheduler.
/// Blocking tasks return `true` from [`Task::is_blocking`], implement
/// [`Task::call_blocking`] and run on the bounded blocking pool.
#[async_trait]
pub trait Task: Send + Sync {
    /// Action name this task is registered under.
    fn name(&self) -> &str;

    /// Durable tasks hold a durable slot and may suspend in durable waits.
    fn is_durable(&self) -> bool {
        false
    }

    fn is_blocking(&self) -> bool {
        false
    }

    /// Retries the engine should schedule after a retryable failure.
    fn retries(&self) -> u32 {
        0
    }

    fn eviction_policy(&self) -> EvictionPolicy {
        EvictionPolicy::default()
    }

    async fn call(&self, _ctx: Arc<Context>) -> Result<TaskOutput, TaskError> {
        Err(TaskError::non_retryable(format!(
            "Task {} has no cooperative entry point",
            self.name()
        )))
    }

    /// Entry point for blocking tasks, called on a pool thread.
    fn call_blocking(&self, _ctx: Arc<Context>) -> Result<TaskOutput, TaskError> {
        Err(TaskError::non_retryable(format!(
            "Task {} has no blocking entry point",
            self.name()
        )))
    }
}

type AsyncHandler =
    Arc<dyn Fn(Arc<Context>) -> BoxFuture<'static, Result<TaskOutput, TaskError>> + Send + Sync>;
type BlockingHandler = Arc<dyn Fn(Arc<Context>) -> Result<TaskOutput, TaskError> + Send + Sync>;

#[derive(Clone)]
enum Handler {
    Cooperative(AsyncHandler),
    Blocking(BlockingHandler),
}

/// Closure-backed [`Task`].
#[derive(Clone)]
pub struct FnTask {
    name: String,
    durable: bool,
    retries: u32,
    eviction_policy: EvictionPolicy,
    handler: Handler,
}

impl FnTask {
    /// Task backed by an async closure.
    pub fn cooperative<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Arc<Context>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TaskOutput, TaskError>> + Send + 'static,
    {
        let handler: AsyncHandler = Arc::new(move |ctx| f(ctx).boxed());
        Self::with_handler(name, Handler::Cooperative(handler))
    }

    /// Task backed by a synchronous closure, run on the blocking pool.
    pub fn blocking<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Arc<Context>) -> Result<TaskOutput, TaskError> + Send + Sync + 'static,
    {
        Self::with_handler(name, Handler::Blocking(Arc::new(f)))
    }

    fn with_handler(name: impl Into<String>, handler: Handler) -> Self {
        Self {
            name: name.into(),
            durable: false,
            retries: 0,
            eviction_policy: EvictionPolicy::default(),
            handler,
        }
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.eviction_policy = policy;
        self
    }
}

#[async_trait]
impl Task for FnTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_durable(&self) -> bool {
        self.durable
    }

    fn is_blocking(&self) -> bool {
        matches!(self.handler, Handler::Blocking(_))
    }

    fn retries(&self) -> u32 {
        self.retries
    }

    fn eviction_policy(&self) -> EvictionPolicy {
        self.eviction_policy.clone()
    }

    async fn call(&self, ctx: Arc<Context>) -> Result<TaskOutput, TaskError> {
        match &self.handler {
            Handler::Cooperative(f) => f(ctx).await,
            Handler::Blocking(_) => Err(TaskError::non_retryable(format!(
                "Task {} is blocking and must run on the blocking pool",
                self.name
            ))),
        }
    }

    fn call_blocking(&self, ctx: Arc<Context>) -> Result<TaskOutput, TaskError> {
        match &self.handler {
            Handler::Blocking(f) => f(ctx),
            Handler::Cooperative(_) => Err(TaskError::non_retryable(format!(
                "Task {} is cooperative and cannot run on the blocking pool",
                self.name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fn_task_flags() {
        let task = FnTask::blocking("crunch", |_ctx| Ok(serde_json::json!({})))
            .durable()
            .with_retries(3);
        assert_eq!(task.name(), "crunch");
        assert!(task.is_blocking());
        assert!(task.is_durable());
        assert_eq!(task.retries(), 3);

        let task = FnTask::cooperative("echo", |ctx| async move { Ok(ctx.input().clone()) });
        assert!(!task.is_blocking());
        assert!(!task.is_durable());
        assert!(task.eviction_policy().allow_capacity_eviction);
    }
}
