//! AmqpConsumer - one lapin subscription on its own channel

use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use lapin::Channel;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicCancelOptions, BasicNackOptions};
use tracing::{debug, warn};
use worq_core::CancelScope;
use worq_core::domain::{DeliveryTag, Message, WorqError};
use worq_core::ports::Consumer;

use crate::headers::from_field_table;

struct Current {
    tag: DeliveryTag,
    message: Result<Arc<Message>, String>,
}

pub struct AmqpConsumer {
    channel: Channel,
    stream: lapin::Consumer,
    consumer_tag: String,
    queue: String,
    scope: CancelScope,
    current: Option<Current>,
    closed: bool,
    err: Option<WorqError>,
}

impl AmqpConsumer {
    pub(crate) fn new(
        channel: Channel,
        stream: lapin::Consumer,
        consumer_tag: String,
        queue: String,
        scope: CancelScope,
    ) -> Self {
        Self {
            channel,
            stream,
            consumer_tag,
            queue,
            scope,
            current: None,
            closed: false,
            err: None,
        }
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    fn to_current(&self, delivery: Delivery) -> Current {
        let tag = DeliveryTag::new(delivery.delivery_tag);
        let properties = &delivery.properties;
        let message = from_field_table(properties.headers().as_ref()).map(|headers| {
            let content_type = properties
                .content_type()
                .as_ref()
                .map(|ct| ct.as_str().to_string())
                .unwrap_or_default();
            let queue = match delivery.routing_key.as_str() {
                "" => self.queue.clone(),
                routing_key => routing_key.to_string(),
            };
            Arc::new(
                Message::new(tag, queue, headers, content_type, delivery.data.clone())
                    .with_redelivered(delivery.redelivered),
            )
        });
        Current { tag, message }
    }

    fn ensure_open(&self) -> Result<(), WorqError> {
        if self.closed {
            return Err(WorqError::ConsumerClosed);
        }
        Ok(())
    }

    async fn close_with(&mut self, err: Option<WorqError>) -> Result<(), WorqError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.current = None;
        if self.err.is_none() {
            self.err = err;
        }

        if let Err(e) = self
            .channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await
        {
            warn!(consumer_tag = %self.consumer_tag, error = %e, "consumer cancel failed");
        }
        // Closing the channel returns unacked deliveries to the queue.
        self.channel
            .close(200, "OK")
            .await
            .map_err(|e| WorqError::transport(format!("AMQP channel close failed: {e}")))?;
        debug!(consumer_tag = %self.consumer_tag, "AMQP consumer closed");
        Ok(())
    }
}

/// Next item of `stream`, or `None` once `scope` is cancelled. Cancellation
/// is checked first so buffered prefetched deliveries are left unconsumed.
async fn next_unless_cancelled<S>(
    scope: &CancelScope,
    stream: &mut S,
) -> Option<Option<S::Item>>
where
    S: Stream + Unpin,
{
    tokio::select! {
        biased;
        _ = scope.cancelled() => {
            debug!(cause = ?scope.cause(), "consumer cancelled");
            None
        }
        item = stream.next() => Some(item),
    }
}

#[async_trait]
impl Consumer for AmqpConsumer {
    async fn next(&mut self) -> bool {
        if self.closed {
            return false;
        }
        let next = next_unless_cancelled(&self.scope, &mut self.stream).await;

        let outcome = match next {
            None | Some(None) => Err(None),
            Some(Some(Err(e))) => Err(Some(WorqError::transport(format!(
                "AMQP delivery stream on {} failed: {e}",
                self.queue
            )))),
            Some(Some(Ok(delivery))) => Ok(delivery),
        };

        match outcome {
            Ok(delivery) => {
                self.current = Some(self.to_current(delivery));
                true
            }
            Err(err) => {
                if let Err(close_err) = self.close_with(err).await {
                    warn!(error = %close_err, "closing exhausted consumer failed");
                }
                false
            }
        }
    }

    fn take_err(&mut self) -> Option<WorqError> {
        self.err.take()
    }

    fn message(&self) -> Result<Arc<Message>, WorqError> {
        self.ensure_open()?;
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
        self.ensure_open()?;
        let tag = message.delivery_tag();
        self.channel
            .basic_ack(tag.get(), BasicAckOptions::default())
            .await
            .map_err(|e| WorqError::transport(format!("Ack of delivery {tag} failed: {e}")))
    }

    async fn nack(&mut self, message: &Message, requeue: bool) -> Result<(), WorqError> {
        self.ensure_open()?;
        let tag = message.delivery_tag();
        self.channel
            .basic_nack(
                tag.get(),
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|e| WorqError::transport(format!("Nack of delivery {tag} failed: {e}")))
    }

    async fn reject_current(&mut self, requeue: bool) -> Result<(), WorqError> {
        self.ensure_open()?;
        let tag = self.delivery_tag().ok_or(WorqError::NoCurrentMessage)?;
        self.channel
            .basic_nack(
                tag.get(),
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|e| WorqError::transport(format!("Nack of delivery {tag} failed: {e}")))
    }

    async fn close(&mut self) -> Result<(), WorqError> {
        self.close_with(None).await
    }
}
