//! InMemoryBroker - テスト・ローカル開発用のプロセス内 broker
//!
//! キューは一つの async mutex の内側にある `VecDeque`。consumer は publish、
//! broker の close、スコープのキャンセルのいずれかまで `Notify` で待機します。
//! ack/nack はすべて記録され、テストから確定履歴を検証できます。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::cancel::CancelScope;
use crate::domain::{DeliveryTag, Headers, Message, Publishing, WorqError};
use crate::ports::{Broker, Consumer};

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    Ack,
    Nack { requeue: bool },
}

/// One entry of the settlement history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub delivery_tag: DeliveryTag,
    pub queue: String,
    /// `id` header of the delivery, if it carried a string one.
    pub id: Option<String>,
    pub settled: Settled,
}

#[derive(Debug, Clone)]
struct Queued {
    headers: Headers,
    content_type: String,
    body: Vec<u8>,
    redelivered: bool,
    malformed: Option<String>,
}

impl Queued {
    fn id(&self) -> Option<String> {
        self.headers
            .get("id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }
}

#[derive(Default)]
struct State {
    queues: HashMap<String, VecDeque<Queued>>,
    settlements: Vec<Settlement>,
    next_tag: u64,
    closed: bool,
    consume_error: Option<String>,
}

impl State {
    fn push(&mut self, queue: &str, queued: Queued) {
        self.queues.entry(queue.to_string()).or_default().push_back(queued);
    }
}

struct Shared {
    state: Mutex<State>,
    /// Something was published, requeued, or the broker closed.
    available: Notify,
    /// A settlement was recorded.
    settled: Notify,
}

/// # Example
/// ```ignore
/// let broker = Arc::new(InMemoryBroker::new());
/// let app = AppBuilder::new().broker(broker.clone()).build()?;
/// ```
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                available: Notify::new(),
                settled: Notify::new(),
            }),
        }
    }

    /// Publish a raw delivery, bypassing any binder.
    pub async fn push(
        &self,
        queue: &str,
        headers: Headers,
        content_type: &str,
        body: Vec<u8>,
    ) {
        self.push_queued(
            queue,
            Queued {
                headers,
                content_type: content_type.to_string(),
                body,
                redelivered: false,
                malformed: None,
            },
        )
        .await;
    }

    /// Publish a delivery whose message cannot be read, the way a transport
    /// reports undecodable headers.
    pub async fn push_malformed(&self, queue: &str, reason: &str) {
        self.push_queued(
            queue,
            Queued {
                headers: Headers::new(),
                content_type: String::new(),
                body: Vec::new(),
                redelivered: false,
                malformed: Some(reason.to_string()),
            },
        )
        .await;
    }

    async fn push_queued(&self, queue: &str, queued: Queued) {
        self.shared.state.lock().await.push(queue, queued);
        self.shared.available.notify_waiters();
    }

    /// Make every following `consume` fail with a transport error.
    pub async fn fail_consume(&self, reason: &str) {
        self.shared.state.lock().await.consume_error = Some(reason.to_string());
    }

    /// Settlement history, oldest first.
    pub async fn settlements(&self) -> Vec<Settlement> {
        self.shared.state.lock().await.settlements.clone()
    }

    /// Deliveries ready on `queue` (not counting unsettled ones).
    pub async fn pending(&self, queue: &str) -> usize {
        self.shared
            .state
            .lock()
            .await
            .queues
            .get(queue)
            .map_or(0, VecDeque::len)
    }

    /// Wait until at least `count` settlements were recorded.
    pub async fn wait_for_settlements(&self, count: usize) {
        loop {
            let notified = self.shared.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.state.lock().await.settlements.len() >= count {
                return;
            }
            notified.await;
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn consume(
        &self,
        scope: &CancelScope,
        queue: &str,
    ) -> Result<Box<dyn Consumer>, WorqError> {
        let mut state = self.shared.state.lock().await;
        if let Some(reason) = &state.consume_error {
            return Err(WorqError::transport(reason.clone()));
        }
        if state.closed {
            return Err(WorqError::transport("broker is closed"));
        }
        state.queues.entry(queue.to_string()).or_default();

        Ok(Box::new(InMemoryConsumer {
            shared: Arc::clone(&self.shared),
            queue: queue.to_string(),
            scope: scope.clone(),
            current: None,
            unsettled: HashMap::new(),
            closed: false,
            err: None,
        }))
    }

    async fn enqueue(&self, publishing: Publishing) -> Result<(), WorqError> {
        if publishing.queue.is_empty() {
            return Err(WorqError::InvalidArgument("Enqueue(empty queue)".into()));
        }
        let mut state = self.shared.state.lock().await;
        if state.closed {
            return Err(WorqError::transport("broker is closed"));
        }
        state.push(
            &publishing.queue,
            Queued {
                headers: publishing.headers,
                content_type: publishing.content_type,
                body: publishing.body,
                redelivered: false,
                malformed: None,
            },
        );
        drop(state);
        self.shared.available.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> Result<(), WorqError> {
        self.shared.state.lock().await.closed = true;
        self.shared.available.notify_waiters();
        Ok(())
    }
}

struct Current {
    tag: DeliveryTag,
    message: Result<Arc<Message>, String>,
}

pub struct InMemoryConsumer {
    shared: Arc<Shared>,
    queue: String,
    scope: CancelScope,
    current: Option<Current>,
    unsettled: HashMap<DeliveryTag, Queued>,
    closed: bool,
    err: Option<WorqError>,
}

impl InMemoryConsumer {
    async fn settle(&mut self, tag: DeliveryTag, settled: Settled) -> Result<(), WorqError> {
        if self.closed {
            return Err(WorqError::ConsumerClosed);
        }
        let queued = self.unsettled.remove(&tag).ok_or_else(|| {
            WorqError::InvalidArgument(format!("unknown or settled delivery tag {tag}"))
        })?;

        let mut state = self.shared.state.lock().await;
        state.settlements.push(Settlement {
            delivery_tag: tag,
            queue: self.queue.clone(),
            id: queued.id(),
            settled,
        });
        let requeued = matches!(settled, Settled::Nack { requeue: true });
        if requeued {
            state.push(
                &self.queue,
                Queued {
                    redelivered: true,
                    ..queued
                },
            );
        }
        drop(state);

        self.shared.settled.notify_waiters();
        if requeued {
            self.shared.available.notify_waiters();
        }
        Ok(())
    }
}

#[async_trait]
impl Consumer for InMemoryConsumer {
    async fn next(&mut self) -> bool {
        if self.closed {
            return false;
        }
        loop {
            if self.scope.is_cancelled() {
                return false;
            }
            let notified = self.shared.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.state.lock().await;
                if state.closed {
                    drop(state);
                    self.closed = true;
                    self.current = None;
                    return false;
                }
                let popped = state.queues.get_mut(&self.queue).and_then(VecDeque::pop_front);
                if let Some(queued) = popped {
                    state.next_tag += 1;
                    let tag = DeliveryTag::new(state.next_tag);
                    let message = match &queued.malformed {
                        Some(reason) => Err(reason.clone()),
                        None => Ok(Arc::new(
                            Message::new(
                                tag,
                                self.queue.clone(),
                                queued.headers.clone(),
                                queued.content_type.clone(),
                                queued.body.clone(),
                            )
                            .with_redelivered(queued.redelivered),
                        )),
                    };
                    self.unsettled.insert(tag, queued);
                    self.current = Some(Current { tag, message });
                    return true;
                }
            }

            tokio::select! {
                _ = self.scope.cancelled() => return false,
                _ = &mut notified => {}
            }
        }
    }

    fn take_err(&mut self) -> Option<WorqError> {
        self.err.take()
    }

    fn message(&self) -> Result<Arc<Message>, WorqError> {
        if self.closed {
            return Err(WorqError::ConsumerClosed);
        }
        match &self.current {
            None => Err(WorqError::NoCurrentMessage),
            Some(Current {
                message: Ok(message),
                ..
            }) => Ok(Arc::clone(message)),
            Some(Current {
                message: Err(reason),
                ..
            }) => Err(WorqError::MalformedMessage(reason.clone())),
        }
    }

    fn delivery_tag(&self) -> Option<DeliveryTag> {
        self.current.as_ref().map(|current| current.tag)
    }

    async fn ack(&mut self, message: &Message) -> Result<(), WorqError> {
        self.settle(message.delivery_tag(), Settled::Ack).await
    }

    async fn nack(&mut self, message: &Message, requeue: bool) -> Result<(), WorqError> {
        self.settle(message.delivery_tag(), Settled::Nack { requeue }).await
    }

    async fn reject_current(&mut self, requeue: bool) -> Result<(), WorqError> {
        let tag = self.delivery_tag().ok_or(WorqError::NoCurrentMessage)?;
        self.settle(tag, Settled::Nack { requeue }).await
    }

    /// Unsettled deliveries go back to the queue as redelivered.
    async fn close(&mut self) -> Result<(), WorqError> {
        if self.closed && self.unsettled.is_empty() {
            return Ok(());
        }
        self.closed = true;
        self.current = None;
        if self.unsettled.is_empty() {
            return Ok(());
        }

        let mut state = self.shared.state.lock().await;
        let mut returned: Vec<(DeliveryTag, Queued)> = self.unsettled.drain().collect();
        returned.sort_by_key(|(tag, _)| *tag);
        let queue = state.queues.entry(self.queue.clone()).or_default();
        for (_, queued) in returned.into_iter().rev() {
            queue.push_front(Queued {
                redelivered: true,
                ..queued
            });
        }
        drop(state);
        self.shared.available.notify_waiters();
        Ok(())
    }
}
