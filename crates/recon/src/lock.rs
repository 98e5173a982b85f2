//! Per-(card, month) run exclusivity.
//!
//! A [`RunSlots`] registry hands out [`RunLock`] tokens. The token names its
//! key and holder and is passed into the run it guards; dropping it frees the
//! slot, whether the run completed or was abandoned.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ReconError;
use crate::model::BillMonth;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunKey {
    pub card_label: String,
    pub bill_month: BillMonth,
}

impl RunKey {
    pub fn new(card_label: impl Into<String>, bill_month: BillMonth) -> Self {
        Self {
            card_label: card_label.into(),
            bill_month,
        }
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.card_label, self.bill_month)
    }
}

type SlotMap = HashMap<RunKey, String>;

/// Registry of active runs. Cloning shares the same registry.
#[derive(Debug, Clone, Default)]
pub struct RunSlots {
    active: Arc<Mutex<SlotMap>>,
}

impl RunSlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key` for `holder`, or fail with [`ReconError::RunConflict`].
    pub fn acquire(&self, key: RunKey, holder: impl Into<String>) -> Result<RunLock, ReconError> {
        let holder = holder.into();
        let mut active = self.active.lock();
        if let Some(current) = active.get(&key) {
            return Err(ReconError::RunConflict {
                key,
                holder: current.clone(),
            });
        }
        active.insert(key.clone(), holder.clone());
        debug!(%key, %holder, "run slot acquired");
        Ok(RunLock {
            key,
            holder,
            slots: Arc::clone(&self.active),
        })
    }

    pub fn holder_of(&self, key: &RunKey) -> Option<String> {
        self.active.lock().get(key).cloned()
    }

    pub fn is_active(&self, key: &RunKey) -> bool {
        self.active.lock().contains_key(key)
    }
}

/// Token proving its holder owns one (card, month) slot.
#[derive(Debug)]
pub struct RunLock {
    key: RunKey,
    holder: String,
    slots: Arc<Mutex<SlotMap>>,
}

impl RunLock {
    pub fn key(&self) -> &RunKey {
        &self.key
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let mut active = self.slots.lock();
        if active.get(&self.key).is_some_and(|h| *h == self.holder) {
            active.remove(&self.key);
            debug!(key = %self.key, holder = %self.holder, "run slot released");
        }
    }
}
