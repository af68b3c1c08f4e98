//! Decision - handler 実行後に delivery をどう確定するか
//!
//! リトライ方針はここだけで決まります。
//! - 未知のタスク: 破棄（requeue なしの nack）。何度配送しても成功しない
//! - 明示的な reject: handler が選んだ requeue フラグで nack
//! - その他のエラー: requeue ありの nack（楽観的リトライ）
//! - 成功: ack

use super::errors::WorqError;

/// Settlement of one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Ack,
    Nack { requeue: bool, reason: String },
}

impl Decision {
    /// Classify a handler result. Pure; no side effects.
    pub fn from_result(result: &Result<(), WorqError>) -> Self {
        match result {
            Ok(()) => Decision::Ack,
            Err(err @ WorqError::TaskNotFound(_)) => Decision::Nack {
                requeue: false,
                reason: err.to_string(),
            },
            Err(err @ WorqError::TaskRejected { requeue }) => Decision::Nack {
                requeue: *requeue,
                reason: err.to_string(),
            },
            Err(err) => Decision::Nack {
                requeue: true,
                reason: err.to_string(),
            },
        }
    }

    /// Decision for a delivery whose message could not even be read.
    pub fn poison(reason: impl Into<String>) -> Self {
        Decision::Nack {
            requeue: false,
            reason: reason.into(),
        }
    }

    pub fn is_ack(&self) -> bool {
        matches!(self, Decision::Ack)
    }

    /// `Some(requeue)` for a nack.
    pub fn requeue(&self) -> Option<bool> {
        match self {
            Decision::Ack => None,
            Decision::Nack { requeue, .. } => Some(*requeue),
        }
    }
}
