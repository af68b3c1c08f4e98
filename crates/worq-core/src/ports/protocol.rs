//! Protocol port - エンベロープ header から ID とタスク名を取り出す

use crate::domain::{Message, TaskId, WorqError};

/// Reads envelope metadata. Both methods are pure and must fail with
/// `WorqError::MissingField` when the header is absent or not a string.
pub trait Protocol: Send + Sync {
    fn id(&self, message: &Message) -> Result<TaskId, WorqError>;

    fn task(&self, message: &Message) -> Result<String, WorqError>;
}
