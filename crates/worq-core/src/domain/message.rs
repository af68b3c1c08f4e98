//! Message - transport に依存しない delivery のビュー

use std::collections::BTreeMap;

use serde_json::Value;

use super::ids::DeliveryTag;

/// Header table carried by messages and publishings.
pub type Headers = BTreeMap<String, Value>;

/// One inbound unit of work.
///
/// Built by a `Consumer` from whatever its transport delivered; protocols read
/// identity and task name out of [`Message::headers`] and never see transport
/// types.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    delivery_tag: DeliveryTag,
    queue: String,
    headers: Headers,
    content_type: String,
    body: Vec<u8>,
    redelivered: bool,
}

impl Message {
    pub fn new(
        delivery_tag: DeliveryTag,
        queue: impl Into<String>,
        headers: Headers,
        content_type: impl Into<String>,
        body: Vec<u8>,
    ) -> Self {
        Self {
            delivery_tag,
            queue: queue.into(),
            headers,
            content_type: content_type.into(),
            body,
            redelivered: false,
        }
    }

    pub fn with_redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    pub fn delivery_tag(&self) -> DeliveryTag {
        self.delivery_tag
    }

    /// Queue (routing key) the message was delivered from.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// String-valued header, `None` if absent or of another type.
    pub fn header_str(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(Value::as_str)
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }
}
