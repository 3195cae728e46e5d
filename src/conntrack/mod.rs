//! Conntrack event path
//!
//! The second producer feeding the connection table: kernel connection-
//! tracker events promote entries to tracked, rebind entries that a packet
//! created under the reverse key, remove destroyed flows, and pace garbage
//! collection. The worker is written against [`EventSource`] so its
//! semantics do not depend on the kernel binding (see [`netlink`] for the
//! real one).

pub mod netlink;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::key::{FlowTuple, IPPROTO_TCP, IPPROTO_UDP};
use crate::table::ConnectionTable;

/// Minimum spacing between garbage-collection sweeps.
pub const GC_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    New,
    Destroy,
    Unknown,
    Error,
}

/// One conntrack event. `tuple` is the flow's original-direction tuple;
/// events the kernel could not attribute to a flow carry `None`.
#[derive(Debug, Clone)]
pub struct ConntrackEvent {
    pub kind: EventKind,
    pub tuple: Option<FlowTuple>,
}

/// A stream of conntrack events. `Ok(None)` means no event was available
/// within the source's polling interval; callers use it to check the stop
/// flag.
pub trait EventSource {
    fn recv(&mut self) -> std::io::Result<Option<ConntrackEvent>>;
}

pub struct ConntrackWorker {
    table: Arc<ConnectionTable>,
    stop: Arc<AtomicBool>,
    last_gc: Option<Instant>,
}

impl ConntrackWorker {
    pub fn new(table: Arc<ConnectionTable>, stop: Arc<AtomicBool>) -> Self {
        Self {
            table,
            stop,
            last_gc: None,
        }
    }

    /// Consume events until shutdown is requested or the source fails.
    pub fn run<S: EventSource>(&mut self, source: &mut S) -> crate::error::Result<()> {
        while !self.stop.load(Ordering::Relaxed) {
            match source.recv() {
                Ok(Some(event)) => self.handle_event(&event, Instant::now()),
                Ok(None) => {}
                Err(e) => {
                    info!("conntrack read failure: {}", e);
                    return Err(crate::error::FlowmarkError::Conntrack(e));
                }
            }
        }
        info!("conntrack worker exiting");
        Ok(())
    }

    pub(crate) fn handle_event(&mut self, event: &ConntrackEvent, now: Instant) {
        // Unknown and error events, and events without a flow tuple, are
        // irrelevant to the table.
        let tuple = match (event.kind, &event.tuple) {
            (EventKind::Unknown | EventKind::Error, _) => {
                debug!("ignoring {:?} conntrack event", event.kind);
                return;
            }
            (_, None) => {
                info!("got {:?} conntrack event without a tuple", event.kind);
                return;
            }
            (_, Some(tuple)) => tuple,
        };

        if tuple.l4_proto != IPPROTO_TCP && tuple.l4_proto != IPPROTO_UDP {
            return;
        }

        self.maybe_gc(now);

        let (forward, reverse) = tuple.key_pair();
        match event.kind {
            EventKind::New => self.table.promote_tracked(&forward, &reverse),
            EventKind::Destroy => {
                self.table.remove(&forward);
                self.table.remove(&reverse);
            }
            EventKind::Unknown | EventKind::Error => unreachable!(),
        }
    }

    fn maybe_gc(&mut self, now: Instant) {
        let due = match self.last_gc {
            Some(last) => now > last + GC_INTERVAL,
            None => true,
        };
        if due {
            self.last_gc = Some(now);
            self.table.gc(now);
        }
    }
}
