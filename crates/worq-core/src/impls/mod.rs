//! Impls - ports のプロセス内実装
//!
//! - **InMemoryBroker**: テスト・ローカル開発用のプロセス内 broker
//! - **CeleryProtocol / CeleryBinder**: デフォルトのエンベロープ
//!
//! AMQP broker は `worq-amqp` crate にあります。

pub mod celery;
pub mod inmem_broker;

pub use self::celery::{CeleryBinder, CeleryProtocol, MIME_APPLICATION_JSON, TaskBody, TaskEmbed};
pub use self::inmem_broker::{InMemoryBroker, InMemoryConsumer, Settled, Settlement};
