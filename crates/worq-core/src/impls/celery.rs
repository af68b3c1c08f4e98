//! Celery 互換エンベロープ
//!
//! header に `id` と `task` を載せ、body は Celery v2 の三つ組
//! `[args, kwargs, embed]` を JSON で表現します。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::domain::{Headers, Message, Publishing, Signature, TaskId, WorqError};
use crate::ports::{Binder, BoundArgs, Protocol};

pub const MIME_APPLICATION_JSON: &str = "application/json";

const CONTENT_ENCODING: &str = "utf-8";
const LANG: &str = "rust";

/// Reads `id` and `task` from message headers.
#[derive(Debug, Clone, Copy, Default)]
pub struct CeleryProtocol;

impl CeleryProtocol {
    fn header<'m>(message: &'m Message, field: &'static str) -> Result<&'m str, WorqError> {
        message
            .header_str(field)
            .ok_or(WorqError::MissingField { field })
    }
}

impl Protocol for CeleryProtocol {
    fn id(&self, message: &Message) -> Result<TaskId, WorqError> {
        Self::header(message, "id").map(TaskId::from)
    }

    fn task(&self, message: &Message) -> Result<String, WorqError> {
        Self::header(message, "task").map(str::to_string)
    }
}

/// Workflow slots of the body. worq never fills them but keeps them on the
/// wire so Celery workers accept the message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskEmbed {
    pub callbacks: Option<Value>,
    pub errbacks: Option<Value>,
    pub chain: Option<Value>,
    pub chord: Option<Value>,
}

/// `[args, kwargs, embed]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskBody(
    pub Vec<Value>,
    pub Map<String, Value>,
    #[serde(default)] pub TaskEmbed,
);

/// JSON body codec for the Celery v2 layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct CeleryBinder;

fn is_json(content_type: &str) -> bool {
    let essence = content_type.split(';').next().unwrap_or_default().trim();
    essence.eq_ignore_ascii_case(MIME_APPLICATION_JSON)
}

impl Binder for CeleryBinder {
    fn bind(&self, message: &Message) -> Result<BoundArgs, WorqError> {
        if !is_json(message.content_type()) {
            return Err(WorqError::UnsupportedContentType(
                message.content_type().to_string(),
            ));
        }
        let TaskBody(args, kwargs, _embed) = serde_json::from_slice(message.body())?;
        Ok(BoundArgs::new(args, kwargs))
    }

    fn unbind(
        &self,
        id: &TaskId,
        queue: &str,
        signature: &Signature,
    ) -> Result<Publishing, WorqError> {
        let (args, kwargs) = match signature.args().clone() {
            Value::Array(args) => (args, Map::new()),
            Value::Object(kwargs) => (Vec::new(), kwargs),
            Value::Null => (Vec::new(), Map::new()),
            scalar => (vec![scalar], Map::new()),
        };

        let mut headers = Headers::new();
        headers.insert("id".into(), json!(id.as_str()));
        headers.insert("task".into(), json!(signature.task()));
        headers.insert("lang".into(), json!(LANG));
        headers.insert("root_id".into(), json!(id.as_str()));
        headers.insert("parent_id".into(), Value::Null);
        headers.insert("group".into(), Value::Null);
        headers.insert("retries".into(), json!(0));
        headers.insert("argsrepr".into(), json!(Value::Array(args.clone()).to_string()));
        headers.insert(
            "kwargsrepr".into(),
            json!(Value::Object(kwargs.clone()).to_string()),
        );

        let body = serde_json::to_vec(&TaskBody(args, kwargs, TaskEmbed::default()))?;

        Ok(Publishing {
            queue: queue.to_string(),
            headers,
            content_type: MIME_APPLICATION_JSON.to_string(),
            content_encoding: Some(CONTENT_ENCODING.to_string()),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DeliveryTag;
    use rstest::rstest;

    fn message(headers: Headers, content_type: &str, body: &[u8]) -> Message {
        Message::new(DeliveryTag::new(1), "worq", headers, content_type, body.to_vec())
    }

    #[test]
    fn protocol_reads_string_headers() {
        let mut headers = Headers::new();
        headers.insert("id".into(), json!("abc"));
        headers.insert("task".into(), json!("tasks.add"));
        let msg = message(headers, MIME_APPLICATION_JSON, b"");

        assert_eq!(CeleryProtocol.id(&msg).unwrap(), TaskId::new("abc"));
        assert_eq!(CeleryProtocol.task(&msg).unwrap(), "tasks.add");
    }

    #[rstest]
    #[case::absent(None)]
    #[case::not_a_string(Some(json!(42)))]
    fn protocol_rejects_missing_task(#[case] value: Option<Value>) {
        let mut headers = Headers::new();
        if let Some(value) = value {
            headers.insert("task".into(), value);
        }
        let msg = message(headers, MIME_APPLICATION_JSON, b"");
        assert!(matches!(
            CeleryProtocol.task(&msg),
            Err(WorqError::MissingField { field: "task" })
        ));
        assert!(matches!(
            CeleryProtocol.id(&msg),
            Err(WorqError::MissingField { field: "id" })
        ));
    }

    #[rstest]
    #[case::plain("application/json")]
    #[case::with_charset("application/json; charset=utf-8")]
    #[case::upper("Application/JSON")]
    fn bind_accepts_json(#[case] content_type: &str) {
        let msg = message(Headers::new(), content_type, br#"[[2],{"y":10},{}]"#);
        let args = CeleryBinder.bind(&msg).unwrap();
        assert_eq!(args.positional, vec![json!(2)]);
        assert_eq!(args.named.get("y"), Some(&json!(10)));
    }

    #[test]
    fn bind_rejects_other_content_types() {
        let msg = message(Headers::new(), "application/x-msgpack", b"\x93");
        assert!(matches!(
            CeleryBinder.bind(&msg),
            Err(WorqError::UnsupportedContentType(ct)) if ct == "application/x-msgpack"
        ));
    }

    #[test]
    fn bind_rejects_malformed_body() {
        let msg = message(Headers::new(), MIME_APPLICATION_JSON, b"{\"x\":");
        assert!(matches!(CeleryBinder.bind(&msg), Err(WorqError::Decode(_))));
    }

    #[test]
    fn bind_tolerates_missing_embed() {
        let msg = message(Headers::new(), MIME_APPLICATION_JSON, b"[[1,2],{}]");
        assert_eq!(CeleryBinder.bind(&msg).unwrap().positional.len(), 2);
    }

    #[rstest]
    #[case::array(json!([2, 10]), json!([2, 10]), json!({}))]
    #[case::object(json!({"x": 2}), json!([]), json!({"x": 2}))]
    #[case::null(Value::Null, json!([]), json!({}))]
    #[case::scalar(json!("hello"), json!(["hello"]), json!({}))]
    fn unbind_lays_out_args(#[case] args: Value, #[case] positional: Value, #[case] named: Value) {
        let id = TaskId::new("id-1");
        let publishing = CeleryBinder
            .unbind(&id, "worq", &Signature::new("tasks.add", args))
            .unwrap();

        let body: Value = serde_json::from_slice(&publishing.body).unwrap();
        assert_eq!(body[0], positional);
        assert_eq!(body[1], named);
        assert_eq!(
            body[2],
            json!({"callbacks": null, "errbacks": null, "chain": null, "chord": null})
        );
    }

    #[test]
    fn unbind_sets_envelope_headers() {
        let id = TaskId::new("id-1");
        let publishing = CeleryBinder
            .unbind(&id, "celery", &Signature::new("tasks.add", json!([2, 10])))
            .unwrap();

        assert_eq!(publishing.queue, "celery");
        assert_eq!(publishing.content_type, MIME_APPLICATION_JSON);
        assert_eq!(publishing.content_encoding.as_deref(), Some("utf-8"));
        assert_eq!(publishing.headers["id"], json!("id-1"));
        assert_eq!(publishing.headers["task"], json!("tasks.add"));
        assert_eq!(publishing.headers["lang"], json!("rust"));
        assert_eq!(publishing.headers["argsrepr"], json!("[2,10]"));
        assert_eq!(publishing.headers["retries"], json!(0));
    }

    #[test]
    fn unbind_is_deterministic() {
        let id = TaskId::new("id-1");
        let signature = Signature::new("tasks.add", json!({"b": 1, "a": 2}));
        let first = CeleryBinder.unbind(&id, "worq", &signature).unwrap();
        let second = CeleryBinder.unbind(&id, "worq", &signature).unwrap();
        assert_eq!(first, second);
    }
}
