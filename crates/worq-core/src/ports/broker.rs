//! Broker port - メッセージ転送
//!
//! `Broker` は worker ごとに `Consumer` を払い出し、送信する publishing を受け付けます。
//!
//! # 実装
//! - `impls::InMemoryBroker`（テスト・ローカル開発用）
//! - `worq_amqp::AmqpBroker`（lapin による AMQP 0.9.1）

use std::sync::Arc;

use async_trait::async_trait;

use crate::cancel::CancelScope;
use crate::domain::{DeliveryTag, Message, Publishing, WorqError};

#[async_trait]
pub trait Broker: Send + Sync {
    /// Ensure `queue` exists and open a fresh subscription to it.
    ///
    /// The consumer stops yielding once `scope` is cancelled. Failures are not
    /// retried here; the caller owns retry/backoff.
    async fn consume(
        &self,
        scope: &CancelScope,
        queue: &str,
    ) -> Result<Box<dyn Consumer>, WorqError>;

    /// Publish, waiting for broker confirmation where the transport has it.
    async fn enqueue(&self, publishing: Publishing) -> Result<(), WorqError>;

    /// Release the underlying connection. Idempotent.
    async fn close(&self) -> Result<(), WorqError>;
}

/// A live subscription.
///
/// States: open -> closed (terminal). `next` advances to the next delivery;
/// exactly one message is current at a time. Ack/nack are only meaningful
/// for the current message.
#[async_trait]
pub trait Consumer: Send {
    /// Wait for the next delivery. `false` once the stream is exhausted, the
    /// scope is cancelled, a read failed, or the consumer was closed. Natural
    /// exhaustion closes the consumer implicitly.
    async fn next(&mut self) -> bool;

    /// Error that closed the consumer, if any. `None` after a clean end.
    fn take_err(&mut self) -> Option<WorqError>;

    /// The current message. Fails before the first successful `next`, after
    /// close, or if the current delivery could not be decoded.
    fn message(&self) -> Result<Arc<Message>, WorqError>;

    /// Tag of the current delivery, available even when `message` fails.
    fn delivery_tag(&self) -> Option<DeliveryTag>;

    async fn ack(&mut self, message: &Message) -> Result<(), WorqError>;

    async fn nack(&mut self, message: &Message, requeue: bool) -> Result<(), WorqError>;

    /// Nack the current delivery by tag; used when `message` failed and there
    /// is no `Message` to hand back.
    async fn reject_current(&mut self, requeue: bool) -> Result<(), WorqError>;

    async fn close(&mut self) -> Result<(), WorqError>;
}
