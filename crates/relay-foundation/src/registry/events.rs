//! Bounded log of model state transitions.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use relay_kernel::{ModelId, ModelState};
use serde::Serialize;

/// One recorded state transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryEvent {
    /// Strictly increasing across the registry's lifetime, starting at 1.
    pub id: u64,
    pub model_id: ModelId,
    pub from: ModelState,
    pub to: ModelState,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Ring buffer of the most recent events. Ids keep increasing after old
/// events fall off the front.
#[derive(Debug)]
pub(crate) struct EventLog {
    capacity: usize,
    next_id: u64,
    events: VecDeque<RegistryEvent>,
}

impl EventLog {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_id: 1,
            events: VecDeque::new(),
        }
    }

    pub(crate) fn record(
        &mut self,
        model_id: &ModelId,
        from: ModelState,
        to: ModelState,
        detail: Option<String>,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(RegistryEvent {
            id,
            model_id: model_id.clone(),
            from,
            to,
            at: Utc::now(),
            detail,
        });
        id
    }

    /// Events with an id greater than `after`, oldest first.
    pub(crate) fn since(&self, after: u64) -> Vec<RegistryEvent> {
        self.events
            .iter()
            .filter(|e| e.id > after)
            .cloned()
            .collect()
    }

    /// Id of the newest event, 0 when nothing was recorded.
    pub(crate) fn latest_id(&self) -> u64 {
        self.next_id - 1
    }
}
