//! TaskRegistry - タスク名から handler へのマップ（全 worker で共有）
//!
//! 登録は起動時のみ、以降は読み取りのみ。`DashMap` により並行登録も
//! 安全で、プール稼働中の lookup も軽量です。

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::handler::TaskFn;
use crate::domain::WorqError;

#[derive(Default)]
pub struct TaskRegistry {
    handlers: DashMap<String, Arc<dyn TaskFn>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    /// Register `handler` under `name`. Names are unique; a second
    /// registration fails and leaves the first one in place.
    pub fn register(&self, name: &str, handler: Arc<dyn TaskFn>) -> Result<(), WorqError> {
        if name.is_empty() {
            return Err(WorqError::InvalidArgument("task name is empty".into()));
        }
        match self.handlers.entry(name.to_string()) {
            Entry::Occupied(_) => Err(WorqError::Conflict(format!(
                "task already defined: {name}"
            ))),
            Entry::Vacant(slot) => {
                slot.insert(handler);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskFn>> {
        self.handlers.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
