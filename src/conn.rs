//! Connection entries
//!
//! A [`Connection`] is one keyed entry of the table: per-direction counters
//! and bounded payload buffers, the tracked bit, the current classification
//! mark, and the classifier that is torn down once the mark is definitive.
//! All mutable state sits behind a per-entry mutex; the table hands out
//! `Arc<Connection>` clones, so an entry removed from the map while a worker
//! still holds a handle stays alive until that handle drops.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::classifier::FlowClassifier;
use crate::rules::{RuleSet, MARK_NO_MATCH, MARK_NO_MATCH_YET};

/// Limit above which the classifier is torn down and the connection is
/// classified as unmatched.
pub const MAX_BUFFER_SIZE: usize = 16 * 1024;

/// Counters and the retained payload window for one direction of a flow.
/// `buffer` only stores the trailing bytes `[bytes - buffer.len(), bytes)`;
/// the front is discarded as the classifier consumes it.
#[derive(Debug, Default, Clone)]
pub struct DirectionState {
    pub packets: u64,
    pub bytes: u64,
    pub buffer: Vec<u8>,
}

impl DirectionState {
    fn append(&mut self, data: &[u8]) {
        self.packets += 1;
        self.bytes += data.len() as u64;
        self.buffer.extend_from_slice(data);
    }

    /// Drop buffered bytes the classifier reported as consumed, keeping
    /// exactly the `bytes - hint` trailing bytes.
    fn shrink_to_hint(&mut self, hint: u64) {
        let dropped = self.bytes - self.buffer.len() as u64;
        if hint > dropped {
            assert!(hint <= self.bytes);
            let keep = (self.bytes - hint) as usize;
            let excess = self.buffer.len() - keep;
            self.buffer.drain(..excess);
        }
    }
}

/// Snapshot of one direction, for stats and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirectionCounters {
    pub packets: u64,
    pub bytes: u64,
    pub buffered: usize,
}

struct ConnInner {
    tracked: bool,
    mark: u32,
    definitive: bool,
    egress: DirectionState,
    ingress: DirectionState,
    classifier: Option<FlowClassifier>,
    last_activity: Option<Instant>,
}

impl ConnInner {
    fn set_definitive(&mut self) {
        self.classifier = None;
        self.egress.buffer.clear();
        self.ingress.buffer.clear();
        self.definitive = true;
    }
}

pub struct Connection {
    inner: Mutex<ConnInner>,
}

impl Connection {
    pub fn new(tracked: bool, rules: Arc<RuleSet>) -> Self {
        Self {
            inner: Mutex::new(ConnInner {
                tracked,
                mark: MARK_NO_MATCH_YET,
                definitive: false,
                egress: DirectionState::default(),
                ingress: DirectionState::default(),
                classifier: Some(FlowClassifier::new(rules)),
                last_activity: None,
            }),
        }
    }

    pub fn is_tracked(&self) -> bool {
        self.inner.lock().tracked
    }

    pub fn set_tracked(&self, tracked: bool) {
        self.inner.lock().tracked = tracked;
    }

    pub fn mark(&self) -> u32 {
        self.inner.lock().mark
    }

    pub fn is_definitive(&self) -> bool {
        self.inner.lock().definitive
    }

    pub fn last_activity(&self) -> Option<Instant> {
        self.inner.lock().last_activity
    }

    pub fn egress_counters(&self) -> DirectionCounters {
        let inner = self.inner.lock();
        counters(&inner.egress)
    }

    pub fn ingress_counters(&self) -> DirectionCounters {
        let inner = self.inner.lock();
        counters(&inner.ingress)
    }

    /// Append a packet payload to one direction and drive the classifier.
    /// Returns the connection's mark after the update. Once the mark is
    /// definitive no payload is accumulated; the activity timestamp still
    /// moves so an active flow is never garbage collected.
    pub fn update_packet(&self, egress_dir: bool, payload: &[u8], now: Instant) -> u32 {
        let mut inner = self.inner.lock();
        if payload.is_empty() {
            return inner.mark;
        }

        inner.last_activity = Some(now);
        if inner.definitive {
            return inner.mark;
        }

        if egress_dir {
            inner.egress.append(payload);
        } else {
            inner.ingress.append(payload);
        }

        let inner = &mut *inner;
        let Some(classifier) = inner.classifier.as_mut() else {
            return inner.mark;
        };

        let classified = classifier.update(&inner.egress, &inner.ingress);
        inner.mark = classifier.mark();
        if classified {
            inner.set_definitive();
            return inner.mark;
        }

        let egress_hint = classifier.egress_hint();
        let ingress_hint = classifier.ingress_hint();
        inner.egress.shrink_to_hint(egress_hint);
        inner.ingress.shrink_to_hint(ingress_hint);

        if inner.egress.buffer.len() > MAX_BUFFER_SIZE
            || inner.ingress.buffer.len() > MAX_BUFFER_SIZE
        {
            inner.mark = MARK_NO_MATCH;
            inner.set_definitive();
        }

        inner.mark
    }

    /// Swap the two directions, for a flow whose entry was created under the
    /// reverse key before conntrack reported the original orientation.
    /// Callers observe the swap atomically (per-entry lock).
    pub fn reverse(&self) {
        let mut inner = self.inner.lock();
        if let Some(classifier) = inner.classifier.as_mut() {
            classifier.reverse();
        }
        let inner = &mut *inner;
        std::mem::swap(&mut inner.egress, &mut inner.ingress);
    }
}

fn counters(dir: &DirectionState) -> DirectionCounters {
    DirectionCounters {
        packets: dir.packets,
        bytes: dir.bytes,
        buffered: dir.buffer.len(),
    }
}
