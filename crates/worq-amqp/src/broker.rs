//! AmqpBroker - AMQP 0.9.1 broker over lapin
//!
//! # Topology
//! One exchange (durable, direct by default). Each queue is durable and bound
//! to the exchange with its own name as routing key, so publishing with
//! routing key = queue name lands in that queue.
//!
//! # Channels
//! The connection and the publisher channel are opened lazily and cached.
//! Every consumer opens its own channel so acks from one worker never
//! serialize behind another.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};
use uuid::Uuid;
use worq_core::CancelScope;
use worq_core::domain::{Publishing, WorqError};
use worq_core::ports::{Broker, Clock, Consumer, SystemClock};

use crate::config::AmqpConfig;
use crate::consumer::AmqpConsumer;
use crate::headers::to_field_table;

const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// # Example
/// ```ignore
/// let broker = Arc::new(AmqpBroker::new(AmqpConfig::from_env()));
/// let app = AppBuilder::new().broker(broker).build()?;
/// ```
pub struct AmqpBroker {
    config: AmqpConfig,
    clock: Arc<dyn Clock>,
    connection: OnceCell<Connection>,
    publisher: OnceCell<Channel>,
    /// Queues whose topology has been declared through this broker.
    declared: Mutex<HashSet<String>>,
    closed: AtomicBool,
}

impl AmqpBroker {
    pub fn new(config: AmqpConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Broker stamping publishings with `clock`.
    pub fn with_clock(config: AmqpConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            connection: OnceCell::new(),
            publisher: OnceCell::new(),
            declared: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &AmqpConfig {
        &self.config
    }

    fn ensure_open(&self) -> Result<(), WorqError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WorqError::transport("broker is closed"));
        }
        Ok(())
    }

    async fn connection(&self) -> Result<&Connection, WorqError> {
        self.connection
            .get_or_try_init(|| async {
                let properties = ConnectionProperties::default()
                    .with_connection_name(self.config.connection_name.clone().into());
                let connection = Connection::connect(&self.config.url, properties)
                    .await
                    .map_err(|e| {
                        WorqError::transport(format!(
                            "AMQP connection to {} failed: {e}",
                            self.config.url_redacted()
                        ))
                    })?;
                info!(url = %self.config.url_redacted(), "AMQP connection established");
                Ok::<_, WorqError>(connection)
            })
            .await
    }

    async fn open_channel(&self) -> Result<Channel, WorqError> {
        self.connection()
            .await?
            .create_channel()
            .await
            .map_err(|e| WorqError::transport(format!("AMQP channel creation failed: {e}")))
    }

    /// Publisher channel, in confirm mode when the server supports it.
    async fn publisher(&self) -> Result<&Channel, WorqError> {
        self.publisher
            .get_or_try_init(|| async {
                let channel = self.open_channel().await?;
                if let Err(e) = channel
                    .confirm_select(ConfirmSelectOptions::default())
                    .await
                {
                    warn!(error = %e, "publisher confirms not supported; publishing unconfirmed");
                }
                Ok::<_, WorqError>(channel)
            })
            .await
    }

    fn exchange_kind(&self) -> ExchangeKind {
        match self.config.exchange_kind.as_str() {
            "direct" => ExchangeKind::Direct,
            "fanout" => ExchangeKind::Fanout,
            "topic" => ExchangeKind::Topic,
            "headers" => ExchangeKind::Headers,
            other => ExchangeKind::Custom(other.to_string()),
        }
    }

    /// Declare exchange, queue, and binding for `queue` once per broker.
    async fn declare_topology(&self, channel: &Channel, queue: &str) -> Result<(), WorqError> {
        let mut declared = self.declared.lock().await;
        if declared.contains(queue) {
            return Ok(());
        }
        let exchange = &self.config.exchange;

        channel
            .exchange_declare(
                exchange,
                self.exchange_kind(),
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                WorqError::transport(format!("Exchange {exchange} declaration failed: {e}"))
            })?;

        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| WorqError::transport(format!("Queue {queue} declaration failed: {e}")))?;

        channel
            .queue_bind(
                queue,
                exchange,
                queue,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                WorqError::transport(format!("Queue {queue} binding to {exchange} failed: {e}"))
            })?;

        declared.insert(queue.to_string());
        debug!(queue, exchange = %exchange, "topology declared");
        Ok(())
    }

    fn properties(&self, publishing: &Publishing) -> BasicProperties {
        let timestamp = u64::try_from(self.clock.now().timestamp()).unwrap_or_default();
        let mut properties = BasicProperties::default()
            .with_headers(to_field_table(&publishing.headers))
            .with_content_type(publishing.content_type.clone().into())
            .with_delivery_mode(DELIVERY_MODE_PERSISTENT)
            .with_timestamp(timestamp);
        if let Some(encoding) = &publishing.content_encoding {
            properties = properties.with_content_encoding(encoding.clone().into());
        }
        properties
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn consume(
        &self,
        scope: &CancelScope,
        queue: &str,
    ) -> Result<Box<dyn Consumer>, WorqError> {
        self.ensure_open()?;
        let channel = self.open_channel().await?;
        self.declare_topology(&channel, queue).await?;

        channel
            .basic_qos(self.config.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| WorqError::transport(format!("Failed to set QoS: {e}")))?;

        let consumer_tag = format!("worq-{}", Uuid::new_v4());
        let stream = channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| WorqError::transport(format!("Consume on {queue} failed: {e}")))?;

        debug!(queue, consumer_tag = %consumer_tag, "AMQP consumer started");
        Ok(Box::new(AmqpConsumer::new(
            channel,
            stream,
            consumer_tag,
            queue.to_string(),
            scope.clone(),
        )))
    }

    async fn enqueue(&self, publishing: Publishing) -> Result<(), WorqError> {
        if publishing.queue.is_empty() {
            return Err(WorqError::InvalidArgument("Enqueue(empty queue)".into()));
        }
        self.ensure_open()?;
        let channel = self.publisher().await?;
        self.declare_topology(channel, &publishing.queue).await?;

        let queue = publishing.queue.as_str();
        let confirm = channel
            .basic_publish(
                &self.config.exchange,
                queue,
                BasicPublishOptions::default(),
                &publishing.body,
                self.properties(&publishing),
            )
            .await
            .map_err(|e| WorqError::transport(format!("Publish to {queue} failed: {e}")))?;

        let confirmation = confirm.await.map_err(|e| {
            WorqError::transport(format!("Publish confirmation for {queue} failed: {e}"))
        })?;
        if confirmation.is_nack() {
            return Err(WorqError::transport(format!(
                "Publish to {queue} was not acknowledged by the broker"
            )));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), WorqError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let Some(connection) = self.connection.get() else {
            return Ok(());
        };
        connection
            .close(200, "OK")
            .await
            .map_err(|e| WorqError::transport(format!("AMQP connection close failed: {e}")))?;
        info!("AMQP connection closed");
        Ok(())
    }
}
