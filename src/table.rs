//! Connection table
//!
//! One keyed map shared by the two workers: the queue worker creates and
//! updates entries on the packet path, the conntrack worker promotes,
//! rebinds and removes them on the event path. A reader/writer lock guards
//! the map itself; each entry carries its own mutex (see `conn`). Lookups
//! clone the entry's `Arc`, so an entry erased from the map is only freed
//! once the last outstanding handle drops.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::conn::Connection;
use crate::rules::RuleSet;

/// Entries idle longer than this are garbage collected.
pub const IDLE_TTL: Duration = Duration::from_secs(600);

pub struct ConnectionTable {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    rules: Arc<RuleSet>,
}

impl ConnectionTable {
    pub fn new(rules: Arc<RuleSet>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            rules,
        }
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    pub fn has(&self, key: &str) -> bool {
        self.connections.read().contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<Arc<Connection>> {
        self.connections.read().get(key).cloned()
    }

    /// Packet-path lookup: the forward-keyed entry if it exists, else the
    /// reverse-keyed entry with the direction flipped, else a fresh untracked
    /// entry under the forward key. The returned bool is true when the
    /// packet travels in the entry's forward direction. Atomic with respect
    /// to concurrent conntrack events.
    pub fn get_or_create(&self, forward: &str, reverse: &str) -> (Arc<Connection>, bool) {
        let mut map = self.connections.write();

        if let Some(conn) = map.get(forward) {
            return (conn.clone(), true);
        }
        if let Some(conn) = map.get(reverse) {
            return (conn.clone(), false);
        }

        debug!("untracked packet '{}'", forward);
        let conn = Arc::new(Connection::new(false, self.rules.clone()));
        map.insert(forward.to_string(), conn.clone());
        (conn, true)
    }

    /// Set the tracked bit on an existing entry. Returns false when the key
    /// is unknown.
    pub fn mark_tracked(&self, key: &str) -> bool {
        match self.connections.read().get(key) {
            Some(conn) => {
                conn.set_tracked(true);
                true
            }
            None => false,
        }
    }

    /// Insert a tracked entry, or promote the existing one. Idempotent.
    pub fn insert_tracked(&self, key: &str) {
        let mut map = self.connections.write();
        match map.get(key) {
            Some(conn) => conn.set_tracked(true),
            None => {
                map.insert(
                    key.to_string(),
                    Arc::new(Connection::new(true, self.rules.clone())),
                );
            }
        }
    }

    /// Conntrack NEW handling, atomically: promote the forward-keyed entry
    /// if present; otherwise reverse and rebind a reverse-keyed entry
    /// (created by a packet that was seen before the NEW event); otherwise
    /// insert a fresh tracked entry.
    pub fn promote_tracked(&self, forward: &str, reverse: &str) {
        let mut map = self.connections.write();

        if let Some(conn) = map.get(forward) {
            conn.set_tracked(true);
            return;
        }

        if let Some(conn) = map.remove(reverse) {
            info!("reverse connection found for key '{}'", forward);
            conn.reverse();
            conn.set_tracked(true);
            map.insert(forward.to_string(), conn);
            return;
        }

        map.insert(
            forward.to_string(),
            Arc::new(Connection::new(true, self.rules.clone())),
        );
    }

    /// Erase an entry. Returns true when something was removed. Workers
    /// still holding a handle keep the entry alive until they release it.
    pub fn remove(&self, key: &str) -> bool {
        self.connections.write().remove(key).is_some()
    }

    /// Remove entries whose last activity is older than [`IDLE_TTL`].
    /// Entries that never saw a packet are kept: conntrack owns their
    /// lifetime through DESTROY events.
    pub fn gc(&self, now: Instant) -> usize {
        let Some(cutoff) = now.checked_sub(IDLE_TTL) else {
            return 0;
        };

        let mut map = self.connections.write();
        let before = map.len();
        map.retain(|_, conn| match conn.last_activity() {
            Some(last) => last >= cutoff,
            None => true,
        });
        let removed = before - map.len();
        if removed > 0 {
            info!("connection garbage collection: removed {} items", removed);
        }
        removed
    }
}
