//! Handler traits for tool and agent workflows.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use keel_protocols::{DurableError, HandlerError};

use crate::context::TaskContext;
use crate::durable::DurableContext;

/// A tool handler: side-effecting work executed on an ordinary slot.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Execute one delivery attempt.
    async fn call(&self, ctx: Arc<TaskContext>) -> Result<serde_json::Value, HandlerError>;
}

/// An agent handler: orchestration executed on a durable slot with replay.
///
/// Durable operations that cannot complete from recorded history return
/// [`DurableError::Suspended`], which the handler body propagates with `?`.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    /// Execute (or replay) one delivery attempt.
    async fn call(&self, ctx: Arc<DurableContext>) -> Result<serde_json::Value, DurableError>;
}

/// Adapter so plain async functions can be registered as tool handlers.
pub struct FnTaskHandler<F>(pub F);

#[async_trait]
impl<F, Fut> TaskHandler for FnTaskHandler<F>
where
    F: Fn(Arc<TaskContext>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send,
{
    async fn call(&self, ctx: Arc<TaskContext>) -> Result<serde_json::Value, HandlerError> {
        (self.0)(ctx).await
    }
}

/// Adapter so plain async functions can be registered as agent handlers.
pub struct FnAgentHandler<F>(pub F);

#[async_trait]
impl<F, Fut> AgentHandler for FnAgentHandler<F>
where
    F: Fn(Arc<DurableContext>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, DurableError>> + Send,
{
    async fn call(&self, ctx: Arc<DurableContext>) -> Result<serde_json::Value, DurableError> {
        (self.0)(ctx).await
    }
}
