//! App - エンジン層
//!
//! ports を組み合わせて稼働するシステムを構成します。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: ワイヤリングと起動時検証
//! - **App**: タスク登録、worker プール、enqueue
//! - **Context**: handler に渡す delivery ごとのビュー
//! - **WorkerPool**: N 個の worker、それぞれが専用の consumer から取り出す

pub mod builder;
pub mod config;
pub mod context;
pub mod engine;
mod worker_loop;

pub use self::builder::{AppBuilder, BuildError};
pub use self::config::{DEFAULT_CONCURRENCY, DEFAULT_QUEUE, EngineConfig};
pub use self::context::{ConsumerHandle, Context};
pub use self::engine::App;
