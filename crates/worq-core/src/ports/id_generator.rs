//! IdGenerator port - タスク ID の生成
//!
//! `App::enqueue` は signature ごとに新しい ID をこの port から受け取ります。
//! 生成に副作用は無いので、publish に失敗しても何も残りません。
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース、時刻順にソート可能（デフォルト）

use crate::domain::ids::TaskId;
use crate::ports::Clock;
use ulid::Ulid;

pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;
}

/// ULID generator; the timestamp part comes from `C`, so a [`FixedClock`]
/// yields ids with a predictable prefix.
///
/// [`FixedClock`]: crate::ports::FixedClock
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_task_id(&self) -> TaskId {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        let ulid = Ulid::from_parts(timestamp_ms, rand::random());
        TaskId::from(ulid)
    }
}
