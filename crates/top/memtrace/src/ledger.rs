//! In-flight call activations.

use std::time::Duration;

use mt_memory::Snapshot;
use nohash_hasher::IntMap;
use parking_lot::Mutex;

use crate::event::{ActivationId, Arguments};

/// What we captured when an activation was entered.
#[derive(Clone, Debug)]
pub struct CallActivation {
    pub wall_start: Duration,
    pub cpu_start: Duration,
    pub snapshot: Snapshot,

    /// Process RSS at the call, if known.
    pub rss_start: Option<i64>,

    pub arguments: Arguments,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerError {
    #[error("activation {0} is already being tracked")]
    AlreadyActive(ActivationId),
}

/// Owns each [`CallActivation`] from its call until its return.
///
/// Keyed by activation, never by function, so recursive and concurrent calls of the
/// same function each get their own entry.
#[derive(Default)]
pub struct FrameLedger {
    active: Mutex<IntMap<ActivationId, CallActivation>>,
}

impl FrameLedger {
    /// Start tracking an activation.
    ///
    /// An id that is already tracked is an error and leaves the existing entry untouched.
    pub fn begin(&self, id: ActivationId, start: CallActivation) -> Result<(), LedgerError> {
        use std::collections::hash_map::Entry;

        match self.active.lock().entry(id) {
            Entry::Occupied(_) => Err(LedgerError::AlreadyActive(id)),
            Entry::Vacant(entry) => {
                entry.insert(start);
                Ok(())
            }
        }
    }

    /// Stop tracking an activation, handing back what was captured at its call.
    ///
    /// `None` if the call was never seen.
    pub fn end(&self, id: ActivationId) -> Option<CallActivation> {
        self.active.lock().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.active.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.lock().is_empty()
    }

    /// Drop every activation that never returned. Returns how many there were.
    pub fn expire_all(&self) -> usize {
        let expired = std::mem::take(&mut *self.active.lock());
        expired.len()
    }
}
