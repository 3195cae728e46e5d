//! Flow keys
//!
//! Connections are indexed by a canonical ASCII key derived from the L3/L4
//! tuple:
//!
//! ```text
//! <proto> src=<addr> dst=<addr> sport=<port> dport=<port>
//! ```
//!
//! where `<proto>` is `tcp`, `udp` or `l4-unk-<n>`. The key is
//! direction-specific: the same flow seen from the other side yields the
//! reversed key. Both the queue path and the conntrack event path build keys
//! through [`FlowTuple`], so the two sources always agree on the format.

use std::fmt;
use std::net::IpAddr;

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// One direction of an L3/L4 flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowTuple {
    pub l4_proto: u8,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub sport: u16,
    pub dport: u16,
}

impl FlowTuple {
    /// The same flow seen from the other endpoint.
    pub fn reversed(&self) -> FlowTuple {
        FlowTuple {
            l4_proto: self.l4_proto,
            src: self.dst,
            dst: self.src,
            sport: self.dport,
            dport: self.sport,
        }
    }

    /// Canonical table key for this direction.
    pub fn key(&self) -> String {
        self.to_string()
    }

    /// Forward and reverse keys, in that order.
    pub fn key_pair(&self) -> (String, String) {
        (self.key(), self.reversed().key())
    }

    /// Parse a key back into a tuple. Counterpart of the `Display`
    /// formatting; returns `None` on any grammar violation.
    pub fn parse(key: &str) -> Option<FlowTuple> {
        let mut fields = key.split(' ');
        let proto = fields.next()?;
        let l4_proto = match proto {
            "tcp" => IPPROTO_TCP,
            "udp" => IPPROTO_UDP,
            other => other.strip_prefix("l4-unk-")?.parse().ok()?,
        };

        let src = fields.next()?.strip_prefix("src=")?.parse().ok()?;
        let dst = fields.next()?.strip_prefix("dst=")?.parse().ok()?;
        let sport = fields.next()?.strip_prefix("sport=")?.parse().ok()?;
        let dport = fields.next()?.strip_prefix("dport=")?.parse().ok()?;
        if fields.next().is_some() {
            return None;
        }

        Some(FlowTuple {
            l4_proto,
            src,
            dst,
            sport,
            dport,
        })
    }
}

impl fmt::Display for FlowTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.l4_proto {
            IPPROTO_TCP => write!(f, "tcp")?,
            IPPROTO_UDP => write!(f, "udp")?,
            other => write!(f, "l4-unk-{}", other)?,
        }
        write!(
            f,
            " src={} dst={} sport={} dport={}",
            self.src, self.dst, self.sport, self.dport
        )
    }
}
