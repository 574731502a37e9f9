//! Security Association store
//!
//! Maps (destination, protocol, SPI) to SA records. The table itself
//! is a read-mostly map guarded by an `RwLock`; each entry carries its
//! own `Mutex`, so pipeline steps that mutate one SA (lifetime
//! accounting, replay-window updates, chain deletion) serialize
//! against each other per SA without serializing unrelated SAs.
//!
//! [`SaStore::lookup`] hands out a clone of the entry `Arc`: a
//! borrowed-for-the-run reference. Holders must never keep an entry
//! lock across a suspension, and must re-validate liveness through the
//! store after resuming, since the SA may have been deleted
//! concurrently.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, RwLock};

use crate::sa::{SaId, SaState, SecurityAssociation};

/// Shared handle to one stored SA
pub type SaEntry = Arc<Mutex<SecurityAssociation>>;

/// Concurrent SA table
#[derive(Debug, Default)]
pub struct SaStore {
    table: RwLock<HashMap<SaId, SaEntry>>,
}

impl SaStore {
    /// Create an empty store
    pub fn new() -> Self {
        SaStore::default()
    }

    /// Insert an SA, replacing any existing entry with the same identity
    pub fn insert(&self, sa: SecurityAssociation) -> SaEntry {
        let said = sa.said;
        let entry = Arc::new(Mutex::new(sa));
        self.table
            .write()
            .expect("SA table lock poisoned")
            .insert(said, entry.clone());
        entry
    }

    /// Look up an SA by identity
    ///
    /// Returns a borrowed-for-the-run reference, or `None`. The entry
    /// may be in any lifecycle state; callers gate on
    /// [`SecurityAssociation::is_usable`] under the entry lock.
    pub fn lookup(&self, said: &SaId) -> Option<SaEntry> {
        self.table
            .read()
            .expect("SA table lock poisoned")
            .get(said)
            .cloned()
    }

    /// Convenience lookup by the raw identity triple
    pub fn lookup_by(&self, dst: Ipv4Addr, proto: u8, spi: u32) -> Option<SaEntry> {
        self.lookup(&SaId::new(dst, proto, spi))
    }

    /// Mark an SA and everything downstream of it DEAD
    ///
    /// Walks the `inner_next` chain starting at `said`, flipping each
    /// SA to [`SaState::Dead`]. Entries stay in the table so later
    /// lookups fail with a not-live verdict rather than silently
    /// recreating state. Callable from any failure path; per-entry
    /// locks are taken one at a time.
    pub fn delete_chain(&self, said: &SaId) {
        let mut next = Some(*said);
        // chains are short; guard against an accidental cycle anyway
        let mut hops = 0;
        while let Some(id) = next.take() {
            hops += 1;
            if hops > 64 {
                break;
            }
            if let Some(entry) = self.lookup(&id) {
                let mut sa = entry.lock().expect("SA entry lock poisoned");
                if sa.state == SaState::Dead {
                    break;
                }
                sa.state = SaState::Dead;
                next = sa.inner_next;
            }
        }
    }

    /// Remove an SA outright, returning it
    pub fn remove(&self, said: &SaId) -> Option<SaEntry> {
        self.table
            .write()
            .expect("SA table lock poisoned")
            .remove(said)
    }

    /// Number of stored SAs (any state)
    pub fn len(&self) -> usize {
        self.table.read().expect("SA table lock poisoned").len()
    }

    /// Is the store empty?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
