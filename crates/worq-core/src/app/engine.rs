//! App - ディスパッチエンジン
//!
//! タスクレジストリと broker/protocol/binder を保持し、worker プールを
//! 動かして delivery を確定させ、新しい signature を enqueue します。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{Dispatch, Instrument, debug, error, info, warn};

use super::config::EngineConfig;
use super::context::{ConsumerHandle, Context};
use super::worker_loop::WorkerPool;
use crate::cancel::CancelScope;
use crate::domain::{AsyncResult, Decision, Signature, WorqError};
use crate::ports::{Binder, Broker, IdGenerator, Protocol};
use crate::typed::{Handler, Task, TaskFn, TaskRegistry, TypedHandler};

struct AppInner {
    registry: TaskRegistry,
    broker: Arc<dyn Broker>,
    protocol: Arc<dyn Protocol>,
    binder: Arc<dyn Binder>,
    id_generator: Arc<dyn IdGenerator>,
    config: EngineConfig,
    dispatch: Option<Dispatch>,
    scope: CancelScope,
    started: AtomicBool,
}

/// Cheap to clone; every clone drives the same engine.
#[derive(Clone)]
pub struct App {
    inner: Arc<AppInner>,
}

impl App {
    pub(crate) fn from_parts(
        registry: TaskRegistry,
        broker: Arc<dyn Broker>,
        protocol: Arc<dyn Protocol>,
        binder: Arc<dyn Binder>,
        id_generator: Arc<dyn IdGenerator>,
        config: EngineConfig,
        dispatch: Option<Dispatch>,
    ) -> Self {
        Self {
            inner: Arc::new(AppInner {
                registry,
                broker,
                protocol,
                binder,
                id_generator,
                config,
                dispatch,
                scope: CancelScope::new(),
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.inner.broker
    }

    pub fn protocol(&self) -> &Arc<dyn Protocol> {
        &self.inner.protocol
    }

    pub fn binder(&self) -> &Arc<dyn Binder> {
        &self.inner.binder
    }

    pub fn default_queue(&self) -> &str {
        &self.inner.config.default_queue
    }

    pub fn concurrency(&self) -> usize {
        self.inner.config.concurrency
    }

    pub fn registered_tasks(&self) -> Vec<String> {
        self.inner.registry.registered_names()
    }

    /// Engine-wide cancellation scope. Derive from it (e.g.
    /// `app.scope().with_timeout(..)`) when calling [`App::start_with`] so
    /// [`App::shutdown`] still reaches the pool.
    pub fn scope(&self) -> &CancelScope {
        &self.inner.scope
    }

    pub(crate) fn dispatch(&self) -> Option<&Dispatch> {
        self.inner.dispatch.as_ref()
    }

    /// Register `handler` under `name`.
    ///
    /// Fails with `InvalidArgument` for an empty name or once the pool has
    /// started, and with `Conflict` if the name is taken.
    pub fn register<F>(&self, name: &str, handler: F) -> Result<(), WorqError>
    where
        F: TaskFn + 'static,
    {
        if self.inner.started.load(Ordering::Acquire) {
            return Err(WorqError::InvalidArgument(format!(
                "cannot register {name:?} after start"
            )));
        }
        self.inner.registry.register(name, Arc::new(handler))
    }

    /// Register a typed handler under `T::NAME`.
    pub fn register_task<T, H>(&self, handler: H) -> Result<(), WorqError>
    where
        T: Task,
        H: Handler<T> + 'static,
    {
        self.register(T::NAME, TypedHandler::<T, H>::new(handler))
    }

    /// Run the worker pool under the engine scope until it terminates.
    pub async fn start(&self) -> Result<(), WorqError> {
        self.start_with(self.inner.scope.clone()).await
    }

    /// Run the worker pool under `scope`.
    ///
    /// Returns the first error any worker hit (which also stops the others),
    /// or `Ok(())` after a clean stop.
    pub async fn start_with(&self, scope: CancelScope) -> Result<(), WorqError> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(WorqError::InvalidArgument("engine already started".into()));
        }
        info!(
            queue = %self.default_queue(),
            concurrency = self.concurrency(),
            tasks = ?self.registered_tasks(),
            "starting worker pool"
        );
        let result = WorkerPool::new(self.clone(), self.concurrency()).run(scope).await;
        match &result {
            Ok(()) => info!("worker pool stopped"),
            Err(err) => error!(error = %err, "worker pool failed"),
        }
        result
    }

    /// Ask every worker to stop at its next pull.
    pub fn shutdown(&self, cause: impl Into<String>) {
        self.inner.scope.cancel(cause);
    }

    /// Publish `signature` and return the id it was given.
    pub async fn enqueue(&self, signature: &Signature) -> Result<AsyncResult, WorqError> {
        let queue = self.queue_for_signature(signature);
        let id = self.inner.id_generator.generate_task_id();

        let publishing = self.inner.binder.unbind(&id, queue, signature)?;
        self.inner.broker.enqueue(publishing).await?;

        debug!(id = %id, task = signature.task(), queue, "task enqueued");
        Ok(AsyncResult::new(id))
    }

    // Single default queue until routing is configurable.
    fn queue_for_signature(&self, _signature: &Signature) -> &str {
        self.default_queue()
    }

    /// Handle the consumer's current delivery and settle it.
    ///
    /// Handler failures only shape the returned decision; an `Err` here means
    /// the settlement itself failed.
    pub(crate) async fn consumer_on_next(
        &self,
        consumer: &ConsumerHandle,
        scope: &CancelScope,
    ) -> Result<Decision, WorqError> {
        let current = consumer.lock().await.message();
        let message = match current {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "cannot read delivery, dropping it");
                consumer.lock().await.reject_current(false).await?;
                return Ok(Decision::poison(err.to_string()));
            }
        };

        let ctx = Context::new(
            self.clone(),
            Arc::clone(consumer),
            Arc::clone(&message),
            scope.clone(),
        );
        let span = ctx.span().clone();
        span.in_scope(|| info!(redelivered = message.redelivered(), "task received"));

        let result = self.process_message(&ctx).instrument(span.clone()).await;
        let decision = Decision::from_result(&result);

        span.in_scope(|| match (&decision, &result) {
            (Decision::Ack, _) => debug!("task succeeded"),
            (Decision::Nack { requeue, reason }, Err(WorqError::TaskRejected { .. })) => {
                warn!(requeue, reason = %reason, "task rejected")
            }
            (Decision::Nack { requeue, reason }, _) => {
                error!(requeue, reason = %reason, "task failed")
            }
        });

        let mut consumer = consumer.lock().await;
        match &decision {
            Decision::Ack => consumer.ack(&message).await?,
            Decision::Nack { requeue, .. } => consumer.nack(&message, *requeue).await?,
        }
        Ok(decision)
    }

    async fn process_message(&self, ctx: &Context) -> Result<(), WorqError> {
        let Some(task) = ctx.task() else {
            return Err(WorqError::TaskNotFound(String::new()));
        };
        let handler = self
            .inner
            .registry
            .get(task)
            .ok_or_else(|| WorqError::TaskNotFound(task.to_string()))?;
        handler.call(ctx.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AppBuilder;
    use crate::domain::{Headers, Message};
    use crate::impls::{InMemoryBroker, Settled};
    use crate::ports::{Binder, Consumer};
    use serde::{Deserialize, Serialize};
    use serde_json::{Value, json};
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time::timeout;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Add {
        x: i64,
        y: i64,
    }

    impl Task for Add {
        const NAME: &'static str = "tasks.add";
    }

    fn app_with(broker: &Arc<InMemoryBroker>, concurrency: usize) -> App {
        AppBuilder::new()
            .broker(broker.clone())
            .concurrency(concurrency)
            .build()
            .unwrap()
    }

    /// Open a consumer, advance it once, and run the dispatch step on it.
    async fn dispatch_one(app: &App) -> Decision {
        let scope = CancelScope::new();
        let consumer = app.broker().consume(&scope, app.default_queue()).await.unwrap();
        let handle: ConsumerHandle = Arc::new(tokio::sync::Mutex::new(consumer));
        assert!(handle.lock().await.next().await);
        app.consumer_on_next(&handle, &scope).await.unwrap()
    }

    #[tokio::test]
    async fn duplicate_register_conflicts() {
        let broker = Arc::new(InMemoryBroker::new());
        let app = app_with(&broker, 1);
        app.register("tasks.add", |_ctx: Context| async { Ok::<(), WorqError>(()) }).unwrap();
        let err = app
            .register("tasks.add", |_ctx: Context| async {
                Err::<(), _>(WorqError::handler("second"))
            })
            .unwrap_err();
        assert!(matches!(err, WorqError::Conflict(_)));
        assert_eq!(app.registered_tasks(), vec!["tasks.add".to_string()]);
    }

    #[tokio::test]
    async fn add_task_binds_and_acks() {
        let broker = Arc::new(InMemoryBroker::new());
        let app = app_with(&broker, 1);
        let seen = Arc::new(Mutex::new(None));

        let sink = Arc::clone(&seen);
        app.register("tasks.add", move |ctx: Context| {
            let sink = Arc::clone(&sink);
            async move {
                let args: Add = ctx.bind()?;
                tracing::info!(sum = args.x + args.y, "{} + {}", args.x, args.y);
                *sink.lock().unwrap() = Some(args);
                Ok::<(), WorqError>(())
            }
        })
        .unwrap();

        let result = app
            .enqueue(&Signature::from_task(&Add { x: 2, y: 10 }).unwrap())
            .await
            .unwrap();

        assert_eq!(dispatch_one(&app).await, Decision::Ack);
        assert_eq!(*seen.lock().unwrap(), Some(Add { x: 2, y: 10 }));

        let settlements = broker.settlements().await;
        assert_eq!(settlements.len(), 1);
        assert_eq!(settlements[0].settled, Settled::Ack);
        assert_eq!(settlements[0].id.as_deref(), Some(result.id.as_str()));
    }

    #[tokio::test]
    async fn missing_task_is_dropped_without_invocation() {
        let broker = Arc::new(InMemoryBroker::new());
        let app = app_with(&broker, 1);
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        app.register("tasks.add", move |_ctx: Context| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<(), WorqError>(()) }
        })
        .unwrap();

        app.enqueue(&Signature::new("tasks.missing", json!([1])))
            .await
            .unwrap();

        let decision = dispatch_one(&app).await;
        assert_eq!(decision.requeue(), Some(false));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            broker.settlements().await[0].settled,
            Settled::Nack { requeue: false }
        );
        assert_eq!(broker.pending(app.default_queue()).await, 0);
    }

    #[tokio::test]
    async fn missing_task_header_is_dropped() {
        let broker = Arc::new(InMemoryBroker::new());
        let app = app_with(&broker, 1);
        let mut headers = Headers::new();
        headers.insert("id".into(), json!("no-task"));
        broker
            .push("worq", headers, "application/json", b"[[],{},{}]".to_vec())
            .await;

        assert_eq!(dispatch_one(&app).await.requeue(), Some(false));
    }

    #[tokio::test]
    async fn reject_honours_requeue_flag() {
        for requeue in [true, false] {
            let broker = Arc::new(InMemoryBroker::new());
            let app = app_with(&broker, 1);
            app.register("tasks.flaky", move |ctx: Context| async move {
                Err::<(), _>(ctx.reject(requeue))
            })
            .unwrap();
            app.enqueue(&Signature::new("tasks.flaky", json!([])))
                .await
                .unwrap();

            assert_eq!(dispatch_one(&app).await.requeue(), Some(requeue));
            assert_eq!(
                broker.settlements().await[0].settled,
                Settled::Nack { requeue }
            );
            let expected_pending = usize::from(requeue);
            assert_eq!(broker.pending("worq").await, expected_pending);
        }
    }

    #[tokio::test]
    async fn handler_error_is_requeued() {
        let broker = Arc::new(InMemoryBroker::new());
        let app = app_with(&broker, 1);
        app.register("tasks.boom", |_ctx: Context| async {
            Err::<(), _>(WorqError::handler("database unavailable"))
        })
        .unwrap();
        app.enqueue(&Signature::new("tasks.boom", json!({})))
            .await
            .unwrap();

        assert_eq!(dispatch_one(&app).await.requeue(), Some(true));
        assert_eq!(broker.pending("worq").await, 1);
    }

    #[tokio::test]
    async fn bind_failure_is_requeued() {
        let broker = Arc::new(InMemoryBroker::new());
        let app = app_with(&broker, 1);
        app.register_task::<Add, _>(AddHandler).unwrap();
        let mut headers = Headers::new();
        headers.insert("id".into(), json!("1"));
        headers.insert("task".into(), json!("tasks.add"));
        broker.push("worq", headers, "text/plain", b"2 + 10".to_vec()).await;

        assert_eq!(dispatch_one(&app).await.requeue(), Some(true));
    }

    #[tokio::test]
    async fn malformed_delivery_is_poison() {
        let broker = Arc::new(InMemoryBroker::new());
        let app = app_with(&broker, 1);
        broker.push_malformed("worq", "header value is NaN").await;

        let decision = dispatch_one(&app).await;
        assert_eq!(decision.requeue(), Some(false));
        assert_eq!(
            broker.settlements().await[0].settled,
            Settled::Nack { requeue: false }
        );
    }

    struct AddHandler;

    #[async_trait::async_trait]
    impl Handler<Add> for AddHandler {
        async fn handle(&self, _ctx: Context, task: Add) -> Result<(), WorqError> {
            if task.x + task.y == 12 {
                Ok(())
            } else {
                Err(WorqError::handler("bad sum"))
            }
        }
    }

    #[tokio::test]
    async fn typed_handler_receives_bound_task() {
        let broker = Arc::new(InMemoryBroker::new());
        let app = app_with(&broker, 1);
        app.register_task::<Add, _>(AddHandler).unwrap();

        app.enqueue(&Signature::with_args(Add::NAME, &(2, 10)).unwrap())
            .await
            .unwrap();
        assert_eq!(dispatch_one(&app).await, Decision::Ack);
    }

    #[tokio::test]
    async fn rejected_then_redelivered_until_success() {
        let broker = Arc::new(InMemoryBroker::new());
        let app = app_with(&broker, 1);
        let attempts = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&attempts);
        app.register("tasks.retry", move |ctx: Context| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    assert!(!ctx.message().redelivered());
                    return Err(ctx.reject(true));
                }
                assert!(ctx.message().redelivered());
                Ok::<(), WorqError>(())
            }
        })
        .unwrap();
        app.enqueue(&Signature::new("tasks.retry", json!([])))
            .await
            .unwrap();

        let runner = {
            let app = app.clone();
            tokio::spawn(async move { app.start().await })
        };
        timeout(Duration::from_secs(5), broker.wait_for_settlements(2))
            .await
            .unwrap();
        app.shutdown("test finished");
        runner.await.unwrap().unwrap();

        let settled: Vec<Settled> = broker
            .settlements()
            .await
            .into_iter()
            .map(|s| s.settled)
            .collect();
        assert_eq!(settled, vec![Settled::Nack { requeue: true }, Settled::Ack]);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pool_processes_each_message_once() {
        let broker = Arc::new(InMemoryBroker::new());
        let app = app_with(&broker, 4);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        app.register("tasks.add", move |ctx: Context| {
            let sink = Arc::clone(&sink);
            async move {
                let id = ctx.id().cloned().ok_or_else(|| WorqError::handler("no id"))?;
                sink.lock().unwrap().push(id);
                tokio::task::yield_now().await;
                Ok::<(), WorqError>(())
            }
        })
        .unwrap();

        let mut enqueued = HashSet::new();
        for i in 0..100 {
            let result = app
                .enqueue(&Signature::from_task(&Add { x: i, y: i }).unwrap())
                .await
                .unwrap();
            assert!(enqueued.insert(result.id));
        }

        let runner = {
            let app = app.clone();
            tokio::spawn(async move { app.start().await })
        };
        timeout(Duration::from_secs(10), broker.wait_for_settlements(100))
            .await
            .unwrap();
        broker.close().await.unwrap();
        runner.await.unwrap().unwrap();

        let settlements = broker.settlements().await;
        assert_eq!(settlements.len(), 100);
        assert!(settlements.iter().all(|s| s.settled == Settled::Ack));

        let seen = seen.lock().unwrap();
        let unique: HashSet<_> = seen.iter().cloned().collect();
        assert_eq!(seen.len(), 100);
        assert_eq!(unique, enqueued);
    }

    #[tokio::test]
    async fn first_worker_error_is_returned() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.fail_consume("connection refused").await;
        let app = app_with(&broker, 3);

        let err = timeout(Duration::from_secs(5), app.start())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, WorqError::Transport(_)));
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let broker = Arc::new(InMemoryBroker::new());
        let app = app_with(&broker, 1);
        app.shutdown("not needed");
        app.start().await.unwrap();

        let err = app.start().await.unwrap_err();
        assert!(matches!(err, WorqError::InvalidArgument(_)));
        let err = app
            .register("late", |_ctx: Context| async { Ok::<(), WorqError>(()) })
            .unwrap_err();
        assert!(matches!(err, WorqError::InvalidArgument(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_stops_pool() {
        let broker = Arc::new(InMemoryBroker::new());
        let app = app_with(&broker, 2);
        let scope = app.scope().with_timeout(Duration::from_secs(30));
        app.start_with(scope).await.unwrap();
    }

    #[tokio::test]
    async fn enqueue_fails_when_broker_closed() {
        let broker = Arc::new(InMemoryBroker::new());
        let app = app_with(&broker, 1);
        broker.close().await.unwrap();

        let err = app
            .enqueue(&Signature::new("tasks.add", json!([1, 2])))
            .await
            .unwrap_err();
        assert!(matches!(err, WorqError::Transport(_)));
    }

    #[tokio::test]
    async fn unbind_then_bind_round_trips() {
        let broker = Arc::new(InMemoryBroker::new());
        let app = app_with(&broker, 1);
        let signature = Signature::from_task(&Add { x: -3, y: 40 }).unwrap();
        let id = crate::domain::TaskId::new("round-trip");

        let publishing = app.binder().unbind(&id, "worq", &signature).unwrap();
        let message = Message::new(
            crate::domain::DeliveryTag::new(1),
            publishing.queue.clone(),
            publishing.headers.clone(),
            publishing.content_type.clone(),
            publishing.body.clone(),
        );
        let bound: Add = app.binder().bind(&message).unwrap().deserialize().unwrap();
        assert_eq!(bound, Add { x: -3, y: 40 });
        assert_eq!(app.protocol().id(&message).unwrap(), id);
        assert_eq!(app.protocol().task(&message).unwrap(), "tasks.add");
    }

    #[tokio::test]
    async fn closed_consumer_refuses_reads() {
        let broker = Arc::new(InMemoryBroker::new());
        let scope = CancelScope::new();
        let mut consumer: Box<dyn Consumer> = broker.consume(&scope, "worq").await.unwrap();
        consumer.close().await.unwrap();
        assert!(!consumer.next().await);
        assert!(matches!(consumer.message(), Err(WorqError::ConsumerClosed)));
    }

    #[tokio::test]
    async fn pool_runs_under_dispatch_override() {
        let broker = Arc::new(InMemoryBroker::new());
        let app = AppBuilder::new()
            .broker(broker.clone())
            .concurrency(2)
            .dispatch(Dispatch::new(tracing::subscriber::NoSubscriber::default()))
            .build()
            .unwrap();
        app.register("tasks.noop", |_ctx: Context| async { Ok::<(), WorqError>(()) })
            .unwrap();
        app.enqueue(&Signature::new("tasks.noop", Value::Null))
            .await
            .unwrap();

        let runner = {
            let app = app.clone();
            tokio::spawn(async move { app.start().await })
        };
        timeout(Duration::from_secs(5), broker.wait_for_settlements(1))
            .await
            .unwrap();
        app.shutdown("done");
        runner.await.unwrap().unwrap();
        assert_eq!(broker.settlements().await[0].settled, Settled::Ack);
    }
}
