//! Typed - タスク関数、型付き Handler、レジストリ
//!
//! # 二層構造
//! - **表層（Typed）**: `Task` trait, `Handler<T>` trait
//! - **内部（Dyn）**: `TaskFn` - object-safe, `TaskRegistry` に格納

pub mod handler;
pub mod registry;
pub mod task;

pub use self::handler::{Handler, TaskFn, TypedHandler};
pub use self::registry::TaskRegistry;
pub use self::task::Task;
