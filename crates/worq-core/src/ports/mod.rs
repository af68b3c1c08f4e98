//! Ports - 抽象化レイヤー
//!
//! 各 trait はエンジン外部（broker、エンベロープ codec、時刻、ID 生成）への
//! 境界です。エンジンは常に `Arc<dyn Trait>` として保持するので、
//! テストでは自由に差し替えられます。

pub mod binder;
pub mod broker;
pub mod clock;
pub mod id_generator;
pub mod protocol;

pub use self::binder::{Binder, BoundArgs};
pub use self::broker::{Broker, Consumer};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::protocol::Protocol;
