//! worq-core
//!
//! タスクキューのディスパッチエンジン。タスク関数を名前で登録し、
//! worker プールで broker から delivery を取り出して、handler の結果に
//! 応じて ack / nack します。
//!
//! # モジュール
//! - **domain**: Message, Signature, ID, Decision, エラー
//! - **ports**: Broker/Consumer, Protocol, Binder, Clock, IdGenerator
//! - **app**: AppBuilder, App（エンジン本体）, Context, worker プール
//! - **typed**: Task trait, Handler trait, タスクレジストリ
//! - **impls**: InMemory broker と Celery 互換エンベロープ
//! - **cancel**: worker と handler で共有するキャンセルスコープ

pub mod app;
pub mod cancel;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod typed;

pub use self::app::{App, AppBuilder, BuildError, Context, EngineConfig};
pub use self::cancel::CancelScope;
pub use self::domain::{AsyncResult, Decision, Message, Publishing, Signature, TaskId, WorqError};
pub use self::typed::{Handler, Task, TaskFn};
