//! Handler trait - タスクを実行する handler の定義
//!
//! - `TaskFn`: object-safe、`Context` のみを受け取る。レジストリが保持するのはこれ。
//!   `Fn(Context) -> impl Future<Output = Result<..>>` はそのまま `TaskFn` になる。
//! - `Handler<T>`: 型付きの表層。`TypedHandler<T, H>` が body を `T` に bind し、
//!   型を消去して `TaskFn` に戻す。

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

use super::task::Task;
use crate::app::Context;
use crate::domain::WorqError;

/// A registered task function.
///
/// Return `Ok(())` to ack, `Err(ctx.reject(requeue))` to nack with an
/// explicit requeue flag, and any other error to nack with requeue.
#[async_trait]
pub trait TaskFn: Send + Sync {
    async fn call(&self, ctx: Context) -> Result<(), WorqError>;
}

#[async_trait]
impl<F, Fut> TaskFn for F
where
    F: Fn(Context) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), WorqError>> + Send + 'static,
{
    async fn call(&self, ctx: Context) -> Result<(), WorqError> {
        (self)(ctx).await
    }
}

/// Typed handler for task `T`.
///
/// # Example
/// ```ignore
/// struct AddHandler;
///
/// #[async_trait]
/// impl Handler<Add> for AddHandler {
///     async fn handle(&self, ctx: Context, task: Add) -> Result<(), WorqError> {
///         tracing::info!(sum = task.x + task.y, "added");
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    async fn handle(&self, ctx: Context, task: T) -> Result<(), WorqError>;
}

pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> TaskFn for TypedHandler<T, H> {
    async fn call(&self, ctx: Context) -> Result<(), WorqError> {
        let task: T = ctx.bind()?;
        self.handler.handle(ctx, task).await
    }
}
