//! Context - タスク関数から見た delivery
//!
//! エンジンが delivery ごとに一度だけ作り、handler に値で渡します。
//! clone は同じ delivery を共有します。

use std::any::type_name;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::{Span, info_span, warn};

use super::engine::App;
use crate::cancel::CancelScope;
use crate::domain::{Message, TaskId, WorqError};
use crate::ports::Consumer;

/// A consumer shared between its worker loop and the contexts it hands out.
pub type ConsumerHandle = Arc<tokio::sync::Mutex<Box<dyn Consumer>>>;

struct ContextInner {
    app: App,
    consumer: ConsumerHandle,
    message: Arc<Message>,
    id: Option<TaskId>,
    task: Option<String>,
    span: Span,
    scope: CancelScope,
}

#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Resolve id and task name through the app's protocol. A header that
    /// cannot be resolved is logged and left as `None`.
    pub(crate) fn new(
        app: App,
        consumer: ConsumerHandle,
        message: Arc<Message>,
        scope: CancelScope,
    ) -> Self {
        let id = app
            .protocol()
            .id(&message)
            .map_err(|err| warn!(error = %err, "cannot resolve task id"))
            .ok();
        let task = app
            .protocol()
            .task(&message)
            .map_err(|err| warn!(error = %err, "cannot resolve task name"))
            .ok();

        let span = info_span!(
            "task",
            id = id.as_ref().map(TaskId::as_str).unwrap_or_default(),
            task = task.as_deref().unwrap_or_default(),
            queue = message.queue(),
            delivery_tag = message.delivery_tag().get(),
        );

        Self {
            inner: Arc::new(ContextInner {
                app,
                consumer,
                message,
                id,
                task,
                span,
                scope,
            }),
        }
    }

    pub fn app(&self) -> &App {
        &self.inner.app
    }

    /// Span every event of this delivery is recorded under. Attach it to
    /// work spawned off the handler with `Instrument::instrument`.
    pub fn span(&self) -> &Span {
        &self.inner.span
    }

    pub fn consumer(&self) -> &ConsumerHandle {
        &self.inner.consumer
    }

    pub fn message(&self) -> &Message {
        &self.inner.message
    }

    pub fn id(&self) -> Option<&TaskId> {
        self.inner.id.as_ref()
    }

    pub fn task(&self) -> Option<&str> {
        self.inner.task.as_deref()
    }

    /// Decode the message arguments into `T` with the app's binder.
    pub fn bind<T>(&self) -> Result<T, WorqError>
    where
        T: DeserializeOwned,
    {
        self.inner.app.binder().bind(&self.inner.message)?.deserialize()
    }

    /// Decode into a caller-owned value. `None` is rejected.
    pub fn bind_into<T>(&self, target: Option<&mut T>) -> Result<(), WorqError>
    where
        T: DeserializeOwned,
    {
        let Some(target) = target else {
            return Err(WorqError::InvalidArgument(format!(
                "Bind(nil {})",
                type_name::<T>()
            )));
        };
        *target = self.bind()?;
        Ok(())
    }

    /// Error to return from a handler to nack with an explicit requeue flag.
    pub fn reject(&self, requeue: bool) -> WorqError {
        WorqError::TaskRejected { requeue }
    }

    pub fn scope(&self) -> &CancelScope {
        &self.inner.scope
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.scope.is_cancelled()
    }

    /// Resolves when the worker pool is shutting down.
    pub async fn cancelled(&self) {
        self.inner.scope.cancelled().await
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.scope.deadline()
    }

    pub fn cause(&self) -> Option<String> {
        self.inner.scope.cause()
    }
}
