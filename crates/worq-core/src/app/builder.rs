//! AppBuilder - ワイヤリングと起動時検証
//!
//! Fail-fast: broker が無い、プールサイズが 0、`expect_tasks` に挙げた
//! タスクが未登録、のいずれかなら `build` は `App` を返しません。

use std::sync::Arc;

use tracing::Dispatch;

use super::config::EngineConfig;
use super::engine::App;
use crate::domain::WorqError;
use crate::impls::{CeleryBinder, CeleryProtocol};
use crate::ports::{Binder, Broker, IdGenerator, Protocol, SystemClock, UlidGenerator};
use crate::typed::{Handler, Task, TaskFn, TaskRegistry, TypedHandler};

/// # Example
/// ```ignore
/// let app = AppBuilder::new()
///     .broker(broker)
///     .default_queue("celery")
///     .register("tasks.add", add)?
///     .expect_tasks(&["tasks.add"])
///     .build()?;
/// ```
///
/// Protocol and binder default to the Celery-compatible reference pair; ids
/// default to ULIDs.
pub struct AppBuilder {
    registry: TaskRegistry,
    expected_tasks: Option<Vec<String>>,
    broker: Option<Arc<dyn Broker>>,
    protocol: Arc<dyn Protocol>,
    binder: Arc<dyn Binder>,
    id_generator: Arc<dyn IdGenerator>,
    config: EngineConfig,
    dispatch: Option<Dispatch>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no broker configured")]
    MissingBroker,

    #[error("concurrency must be at least 1")]
    InvalidConcurrency,

    #[error("Missing task types: {0:?}. These tasks were expected but not registered.")]
    MissingTaskTypes(Vec<String>),
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            registry: TaskRegistry::new(),
            expected_tasks: None,
            broker: None,
            protocol: Arc::new(CeleryProtocol),
            binder: Arc::new(CeleryBinder),
            id_generator: Arc::new(UlidGenerator::new(SystemClock)),
            config: EngineConfig::default(),
            dispatch: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn protocol(mut self, protocol: Arc<dyn Protocol>) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn binder(mut self, binder: Arc<dyn Binder>) -> Self {
        self.binder = binder;
        self
    }

    pub fn id_generator(mut self, id_generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = id_generator;
        self
    }

    pub fn default_queue(mut self, queue: impl Into<String>) -> Self {
        self.config.default_queue = queue.into();
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.config.concurrency = concurrency;
        self
    }

    /// Route every event the engine and its handlers emit to `dispatch`
    /// instead of the global subscriber.
    pub fn dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    pub fn register<F>(self, name: &str, handler: F) -> Result<Self, WorqError>
    where
        F: TaskFn + 'static,
    {
        self.registry.register(name, Arc::new(handler))?;
        Ok(self)
    }

    pub fn register_task<T, H>(self, handler: H) -> Result<Self, WorqError>
    where
        T: Task,
        H: Handler<T> + 'static,
    {
        self.register(T::NAME, TypedHandler::<T, H>::new(handler))
    }

    /// Task names that must be registered by the time `build` runs.
    pub fn expect_tasks(mut self, task_names: &[&str]) -> Self {
        self.expected_tasks = Some(task_names.iter().map(|name| name.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<App, BuildError> {
        let broker = self.broker.ok_or(BuildError::MissingBroker)?;
        if self.config.concurrency == 0 {
            return Err(BuildError::InvalidConcurrency);
        }
        if let Some(expected_tasks) = &self.expected_tasks {
            let missing_tasks: Vec<String> = expected_tasks
                .iter()
                .filter(|name| !self.registry.contains(name))
                .cloned()
                .collect();
            if !missing_tasks.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing_tasks));
            }
        }

        Ok(App::from_parts(
            self.registry,
            broker,
            self.protocol,
            self.binder,
            self.id_generator,
            self.config,
            self.dispatch,
        ))
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}
