//! NFQUEUE verdict path
//!
//! One long-running worker bound to the configured queue id. For every
//! queued packet it looks up (or creates) the connection entry, feeds the
//! payload to the classifier, and returns ACCEPT with the classification
//! mark packed into the masked field of the kernel mark. Anything the
//! classifier cannot handle is accepted unchanged; only a failed bind is
//! fatal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use nfq::{Queue, Verdict};
use tracing::{debug, info, warn};

use crate::error::{FlowmarkError, Result};
use crate::mark::MarkMask;
use crate::packet::PacketView;
use crate::table::ConnectionTable;

#[derive(Debug, Default, Clone, Copy)]
pub struct QueueStats {
    pub packets: u64,
    pub bytes: u64,
    pub classified: u64,
    pub errors: u64,
}

pub struct QueueWorker {
    table: Arc<ConnectionTable>,
    mask: MarkMask,
    queue_num: u16,
    stop: Arc<AtomicBool>,
    stats: QueueStats,
}

impl QueueWorker {
    pub fn new(
        table: Arc<ConnectionTable>,
        mask: MarkMask,
        queue_num: u16,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            table,
            mask,
            queue_num,
            stop,
            stats: QueueStats::default(),
        }
    }

    pub fn stats(&self) -> QueueStats {
        self.stats
    }

    /// Bind the queue and process packets until shutdown is requested.
    pub fn run(&mut self) -> Result<()> {
        let mut queue = Queue::open().map_err(FlowmarkError::Queue)?;
        queue.bind(self.queue_num).map_err(FlowmarkError::Queue)?;
        info!(
            "listening on NFQUEUE {} (mark mask {:#010x})",
            self.queue_num,
            self.mask.mask()
        );

        while !self.stop.load(Ordering::Relaxed) {
            let mut msg = match queue.recv() {
                Ok(msg) => msg,
                Err(e) => {
                    if self.stop.load(Ordering::Relaxed) {
                        break;
                    }
                    info!("queue receive error: {}", e);
                    self.stats.errors += 1;
                    continue;
                }
            };

            self.stats.packets += 1;
            self.stats.bytes += msg.get_payload().len() as u64;

            let mark_in = msg.get_nfmark();
            let final_mark = self.verdict_mark(msg.get_payload(), mark_in, Instant::now());
            if let Some(mark) = final_mark {
                msg.set_nfmark(mark);
                self.stats.classified += 1;
            }

            msg.set_verdict(Verdict::Accept);
            if let Err(e) = queue.verdict(msg) {
                warn!("queue verdict error: {}", e);
                self.stats.errors += 1;
            }
        }

        info!(
            "queue worker exiting: {} packets, {} bytes, {} classified, {} errors",
            self.stats.packets, self.stats.bytes, self.stats.classified, self.stats.errors
        );
        Ok(())
    }

    /// Classify one packet and compose the replacement mark. `None` means
    /// "accept unchanged": unparseable packets, unsupported protocols and
    /// payload-less control segments never touch the connection table.
    fn verdict_mark(&self, data: &[u8], mark_in: u32, now: Instant) -> Option<u32> {
        let view = match PacketView::parse(data) {
            Ok(view) => view,
            Err(e) => {
                debug!("accepting unparseable packet: {}", e);
                return None;
            }
        };

        let tuple = view.flow_tuple()?;
        if view.payload.is_empty() {
            return None;
        }

        let (forward, reverse) = tuple.key_pair();
        let (conn, is_forward) = self.table.get_or_create(&forward, &reverse);
        let local_out = conn.update_packet(is_forward, view.payload, now);

        let (external, _local_in) = self.mask.split(mark_in);
        Some(self.mask.compose(external, local_out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{ClassificationRule, RuleProtocol, RuleSet, MARK_NO_MATCH_YET};

    fn worker(mask: u32, mark: u32) -> QueueWorker {
        let mut rule = ClassificationRule::new(RuleProtocol::Http, mark);
        rule.set_method_literal("GET").unwrap();
        let mut set = RuleSet::new();
        set.push(rule);
        let table = Arc::new(ConnectionTable::new(Arc::new(set)));
        QueueWorker::new(
            table,
            MarkMask::new(mask).unwrap(),
            0,
            Arc::new(AtomicBool::new(false)),
        )
    }

    fn tcp_v4_packet(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
        let total_len = (40 + payload.len()) as u16;
        let mut pkt = vec![
            0x45,
            0x00,
            (total_len >> 8) as u8,
            total_len as u8,
            0x12,
            0x34,
            0x40,
            0x00,
            0x40,
            0x06,
            0x00,
            0x00,
        ];
        pkt.extend_from_slice(&src);
        pkt.extend_from_slice(&dst);
        pkt.extend_from_slice(&sport.to_be_bytes());
        pkt.extend_from_slice(&dport.to_be_bytes());
        pkt.extend_from_slice(&[
            0x00, 0x00, 0x00, 0x01, // seq
            0x00, 0x00, 0x00, 0x00, // ack
            0x50, 0x18, // data offset=5, PSH|ACK
            0xff, 0xff, // window
            0x00, 0x00, // checksum
            0x00, 0x00, // urgent pointer
        ]);
        pkt.extend_from_slice(payload);
        pkt
    }

    const CLIENT: [u8; 4] = [192, 168, 1, 100];
    const SERVER: [u8; 4] = [10, 0, 0, 1];

    #[test]
    fn test_get_in_reply_direction_classifies_as_client() {
        let worker = worker(0xffff, 42);

        // The flow is already known with the server side as its forward
        // direction, so the request arrives as ingress.
        worker
            .table
            .insert_tracked("tcp src=10.0.0.1 dst=192.168.1.100 sport=80 dport=54321");

        let pkt = tcp_v4_packet(
            CLIENT,
            SERVER,
            54321,
            80,
            b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n",
        );
        let mark = worker.verdict_mark(&pkt, 0, Instant::now());
        assert_eq!(mark, Some(42));
        assert_eq!(worker.table.len(), 1);
    }

    #[test]
    fn test_first_packet_creates_entry() {
        let worker = worker(0xffff, 42);
        let pkt = tcp_v4_packet(CLIENT, SERVER, 54321, 80, b"GET / HTTP/1.1\r\n");
        let mark = worker.verdict_mark(&pkt, 0, Instant::now());

        assert_eq!(mark, Some(42));
        let conn = worker
            .table
            .get("tcp src=192.168.1.100 dst=10.0.0.1 sport=54321 dport=80")
            .unwrap();
        assert!(!conn.is_tracked());
    }

    #[test]
    fn test_zero_payload_accepted_unchanged() {
        let worker = worker(0xffff, 42);
        let pkt = tcp_v4_packet(CLIENT, SERVER, 54321, 80, b"");
        assert_eq!(worker.verdict_mark(&pkt, 0x1234, Instant::now()), None);
        assert!(worker.table.is_empty());
    }

    #[test]
    fn test_malformed_packet_accepted_unchanged() {
        let worker = worker(0xffff, 42);
        let mut pkt = tcp_v4_packet(CLIENT, SERVER, 54321, 80, b"data");
        pkt.push(0xff); // total-length field no longer matches
        assert_eq!(worker.verdict_mark(&pkt, 0, Instant::now()), None);
        assert!(worker.table.is_empty());
    }

    #[test]
    fn test_non_ip_accepted_unchanged() {
        let worker = worker(0xffff, 42);
        assert_eq!(worker.verdict_mark(&[0x12, 0x34], 0, Instant::now()), None);
    }

    #[test]
    fn test_unsupported_l4_accepted_unchanged() {
        let worker = worker(0xffff, 42);
        let mut pkt = tcp_v4_packet(CLIENT, SERVER, 54321, 80, b"");
        pkt[9] = 47; // GRE
        assert_eq!(worker.verdict_mark(&pkt, 0, Instant::now()), None);
        assert!(worker.table.is_empty());
    }

    #[test]
    fn test_mark_composition_preserves_external_bits() {
        let worker = worker(0x0ff0, 0x07);
        let pkt = tcp_v4_packet(CLIENT, SERVER, 54321, 80, b"GET / HTTP/1.1\r\n");
        let mark = worker.verdict_mark(&pkt, 0xA1B2, Instant::now());
        assert_eq!(mark, Some(0xA072));
    }

    #[test]
    fn test_unclassified_flow_reports_no_match_yet() {
        let worker = worker(0xffff, 42);
        let pkt = tcp_v4_packet(CLIENT, SERVER, 54321, 80, b"partial");
        let mark = worker.verdict_mark(&pkt, 0, Instant::now());
        assert_eq!(mark, Some(MARK_NO_MATCH_YET));
    }
}
