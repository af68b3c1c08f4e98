//! Producer 側の型: enqueue するものと、その結果

use serde::Serialize;
use serde_json::Value;

use super::errors::WorqError;
use super::ids::TaskId;
use super::message::Headers;
use crate::typed::Task;

/// A pending task invocation: task name plus arguments.
///
/// Arguments are kept as JSON so any binder can lay them out on the wire. An
/// array becomes positional args, an object becomes keyword args.
#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
    task: String,
    args: Value,
}

impl Signature {
    pub fn new(task: impl Into<String>, args: Value) -> Self {
        Self {
            task: task.into(),
            args,
        }
    }

    /// Serialize `args` into a signature for `task`.
    pub fn with_args<A: Serialize>(task: impl Into<String>, args: &A) -> Result<Self, WorqError> {
        Ok(Self::new(task, serde_json::to_value(args)?))
    }

    /// Signature for a typed task; the name comes from `T::NAME`.
    pub fn from_task<T: Task>(task: &T) -> Result<Self, WorqError> {
        Self::with_args(T::NAME, task)
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn args(&self) -> &Value {
        &self.args
    }
}

/// Wire-ready form of a [`Signature`], produced by `Binder::unbind`.
#[derive(Debug, Clone, PartialEq)]
pub struct Publishing {
    pub queue: String,
    pub headers: Headers,
    pub content_type: String,
    pub content_encoding: Option<String>,
    pub body: Vec<u8>,
}

/// Handle returned by `App::enqueue`. Result retrieval is not supported; the
/// id is all there is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncResult {
    pub id: TaskId,
}

impl AsyncResult {
    pub fn new(id: TaskId) -> Self {
        Self { id }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Serialize, Deserialize)]
    struct Add {
        x: i64,
        y: i64,
    }

    impl Task for Add {
        const NAME: &'static str = "tasks.add";
    }

    #[test]
    fn from_task_uses_task_name() {
        let sig = Signature::from_task(&Add { x: 2, y: 10 }).unwrap();
        assert_eq!(sig.task(), "tasks.add");
        assert_eq!(sig.args(), &json!({"x": 2, "y": 10}));
    }

    #[test]
    fn with_args_accepts_tuples() {
        let sig = Signature::with_args("tasks.add", &(2, 10)).unwrap();
        assert_eq!(sig.args(), &json!([2, 10]));
    }
}
