//! flowmark: userspace NFQUEUE flow classifier
//!
//! Attaches to a netfilter queue and to the kernel connection tracker, and
//! classifies each flow by matching the first HTTP request line against a
//! rule file. The resulting mark is packed into a configurable field of the
//! packet mark and returned with an ACCEPT verdict, so nftables/iptables
//! rules downstream can route or police on it.
//!
//! Two worker threads share one connection table: the queue worker (packet
//! verdict path) and the conntrack worker (NEW/DESTROY event path). Entries
//! are reference-counted and carry their own lock; the table itself sits
//! behind a reader/writer lock. See DESIGN.md for the lifecycle details.

pub mod classifier;
pub mod conn;
pub mod conntrack;
pub mod error;
pub mod key;
pub mod mark;
pub mod packet;
pub mod queue;
pub mod rules;
pub mod shutdown;
pub mod table;

pub use conn::Connection;
pub use error::{FlowmarkError, Result};
pub use key::FlowTuple;
pub use mark::MarkMask;
pub use rules::RuleSet;
pub use table::ConnectionTable;
