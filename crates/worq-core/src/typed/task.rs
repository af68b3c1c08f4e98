//! Task trait - タスク名と引数の型の対応付け
//!
//! `Task` を実装すると、producer 側は `Signature::from_task` で signature を作れ、
//! consumer 側は名前を二度書かずに `Handler<T>` を登録できます。

use serde::Serialize;
use serde::de::DeserializeOwned;

/// # Trait Bounds
/// - `Serialize`: to build a signature
/// - `DeserializeOwned`: to bind from a message body
/// - `Send + Sync + 'static`: moved into handler futures
///
/// # Example
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Add {
///     x: i64,
///     y: i64,
/// }
///
/// impl Task for Add {
///     const NAME: &'static str = "tasks.add";
/// }
/// ```
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Task name as it appears in the `task` header, e.g. `tasks.add`.
    const NAME: &'static str;
}
