//! EngineConfig - プレーンデータのエンジン設定
//!
//! 協調オブジェクト（broker, protocol, binder など）は `AppBuilder` で
//! ワイヤリングします。この構造体はファイルや環境変数から来る値だけを持ちます。

use serde::{Deserialize, Serialize};

pub const DEFAULT_QUEUE: &str = "worq";
pub const DEFAULT_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Queue every worker consumes from and every signature is routed to.
    pub default_queue: String,

    /// Number of workers, each with its own consumer.
    pub concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_queue: DEFAULT_QUEUE.to_string(),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl EngineConfig {
    /// Read from environment variables:
    /// - `WORQ_QUEUE` (default: "worq")
    /// - `WORQ_CONCURRENCY` (default: 4)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            default_queue: lookup("WORQ_QUEUE")
                .filter(|q| !q.is_empty())
                .unwrap_or(defaults.default_queue),
            concurrency: lookup("WORQ_CONCURRENCY")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.concurrency),
        }
    }
}
