//! ctnetlink event subscription
//!
//! Raw `AF_NETLINK`/`NETLINK_NETFILTER` socket joined to the conntrack NEW
//! and DESTROY multicast groups. Each datagram carries one or more netlink
//! messages; the original-direction tuple is decoded from the nested
//! `CTA_TUPLE_ORIG` attribute. A one-second receive timeout turns the
//! blocking read into a poll so the worker can honor the stop flag.

use std::collections::VecDeque;
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use tracing::info;

use super::{ConntrackEvent, EventKind, EventSource};
use crate::error::{FlowmarkError, Result};
use crate::key::FlowTuple;

const NETLINK_NETFILTER: libc::c_int = 12;
const NFNLGRP_CONNTRACK_NEW: u32 = 1;
const NFNLGRP_CONNTRACK_DESTROY: u32 = 3;

const NFNL_SUBSYS_CTNETLINK: u16 = 1;
const IPCTNL_MSG_CT_NEW: u16 = 0;
const IPCTNL_MSG_CT_DELETE: u16 = 2;

const NLMSG_NOOP: u16 = 1;
const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;
const NLMSG_HDRLEN: usize = 16;
const NFGENMSG_LEN: usize = 4;

// Attribute types inside a conntrack message.
const CTA_TUPLE_ORIG: u16 = 1;
const CTA_TUPLE_IP: u16 = 1;
const CTA_TUPLE_PROTO: u16 = 2;
const CTA_IP_V4_SRC: u16 = 1;
const CTA_IP_V4_DST: u16 = 2;
const CTA_IP_V6_SRC: u16 = 3;
const CTA_IP_V6_DST: u16 = 4;
const CTA_PROTO_NUM: u16 = 1;
const CTA_PROTO_SRC_PORT: u16 = 2;
const CTA_PROTO_DST_PORT: u16 = 3;

const NLA_TYPE_MASK: u16 = 0x3fff;

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// Walk a run of netlink attributes: yields (type, payload) pairs and stops
/// at the first malformed header.
struct AttrIter<'a> {
    data: &'a [u8],
}

impl<'a> Iterator for AttrIter<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.len() < 4 {
            return None;
        }
        let len = u16::from_ne_bytes([self.data[0], self.data[1]]) as usize;
        let typ = u16::from_ne_bytes([self.data[2], self.data[3]]);
        if len < 4 || len > self.data.len() {
            return None;
        }
        let payload = &self.data[4..len];
        let next = align4(len).min(self.data.len());
        self.data = &self.data[next..];
        Some((typ & NLA_TYPE_MASK, payload))
    }
}

fn attrs(data: &[u8]) -> AttrIter<'_> {
    AttrIter { data }
}

/// Decode the ORIG tuple of a conntrack message body (nfgenmsg already
/// stripped). Returns `None` when the addresses or the protocol number are
/// missing.
fn parse_orig_tuple(body: &[u8]) -> Option<FlowTuple> {
    let mut src: Option<IpAddr> = None;
    let mut dst: Option<IpAddr> = None;
    let mut l4_proto: Option<u8> = None;
    let mut sport: u16 = 0;
    let mut dport: u16 = 0;

    for (typ, tuple) in attrs(body) {
        if typ != CTA_TUPLE_ORIG {
            continue;
        }
        for (part, payload) in attrs(tuple) {
            match part {
                CTA_TUPLE_IP => {
                    for (field, addr) in attrs(payload) {
                        match field {
                            CTA_IP_V4_SRC if addr.len() == 4 => {
                                src = Some(Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3]).into())
                            }
                            CTA_IP_V4_DST if addr.len() == 4 => {
                                dst = Some(Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3]).into())
                            }
                            CTA_IP_V6_SRC if addr.len() == 16 => {
                                let octets: [u8; 16] = addr.try_into().ok()?;
                                src = Some(Ipv6Addr::from(octets).into())
                            }
                            CTA_IP_V6_DST if addr.len() == 16 => {
                                let octets: [u8; 16] = addr.try_into().ok()?;
                                dst = Some(Ipv6Addr::from(octets).into())
                            }
                            _ => {}
                        }
                    }
                }
                CTA_TUPLE_PROTO => {
                    for (field, value) in attrs(payload) {
                        match field {
                            CTA_PROTO_NUM if !value.is_empty() => l4_proto = Some(value[0]),
                            CTA_PROTO_SRC_PORT if value.len() >= 2 => {
                                sport = u16::from_be_bytes([value[0], value[1]])
                            }
                            CTA_PROTO_DST_PORT if value.len() >= 2 => {
                                dport = u16::from_be_bytes([value[0], value[1]])
                            }
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }
    }

    Some(FlowTuple {
        l4_proto: l4_proto?,
        src: src?,
        dst: dst?,
        sport,
        dport,
    })
}

fn parse_message(msg_type: u16, body: &[u8]) -> Option<ConntrackEvent> {
    match msg_type {
        NLMSG_NOOP | NLMSG_DONE => None,
        NLMSG_ERROR => Some(ConntrackEvent {
            kind: EventKind::Error,
            tuple: None,
        }),
        _ => {
            if msg_type >> 8 != NFNL_SUBSYS_CTNETLINK {
                return Some(ConntrackEvent {
                    kind: EventKind::Unknown,
                    tuple: None,
                });
            }
            let kind = match msg_type & 0xff {
                IPCTNL_MSG_CT_NEW => EventKind::New,
                IPCTNL_MSG_CT_DELETE => EventKind::Destroy,
                _ => EventKind::Unknown,
            };
            let tuple = body
                .get(NFGENMSG_LEN..)
                .and_then(parse_orig_tuple);
            Some(ConntrackEvent { kind, tuple })
        }
    }
}

/// Split a datagram into netlink messages and decode each one.
fn parse_datagram(data: &[u8], out: &mut VecDeque<ConntrackEvent>) {
    let mut offset = 0;
    while offset + NLMSG_HDRLEN <= data.len() {
        let len = u32::from_ne_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]) as usize;
        let msg_type = u16::from_ne_bytes([data[offset + 4], data[offset + 5]]);
        if len < NLMSG_HDRLEN || offset + len > data.len() {
            break;
        }
        if let Some(event) = parse_message(msg_type, &data[offset + NLMSG_HDRLEN..offset + len]) {
            out.push_back(event);
        }
        offset += align4(len);
    }
}

pub struct NetlinkSource {
    fd: OwnedFd,
    buf: Vec<u8>,
    pending: VecDeque<ConntrackEvent>,
}

impl NetlinkSource {
    /// Open the event socket and join the NEW and DESTROY groups. Fails
    /// without CAP_NET_ADMIN or without nf_conntrack_netlink support.
    pub fn open() -> Result<Self> {
        let raw = unsafe { libc::socket(libc::AF_NETLINK, libc::SOCK_RAW, NETLINK_NETFILTER) };
        if raw < 0 {
            return Err(FlowmarkError::Conntrack(io::Error::last_os_error()));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_groups =
            (1 << (NFNLGRP_CONNTRACK_NEW - 1)) | (1 << (NFNLGRP_CONNTRACK_DESTROY - 1));
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(FlowmarkError::Conntrack(io::Error::last_os_error()));
        }

        // Receive timeout so the worker loop can poll the stop flag.
        let tv = libc::timeval {
            tv_sec: 1,
            tv_usec: 0,
        };
        let rc = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const libc::c_void,
                mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(FlowmarkError::Conntrack(io::Error::last_os_error()));
        }

        info!("subscribed to conntrack NEW/DESTROY events");
        Ok(Self {
            fd,
            buf: vec![0; 64 * 1024],
            pending: VecDeque::new(),
        })
    }
}

impl EventSource for NetlinkSource {
    fn recv(&mut self) -> io::Result<Option<ConntrackEvent>> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(Some(event));
        }

        let n = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                self.buf.as_mut_ptr() as *mut libc::c_void,
                self.buf.len(),
                0,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            // ENOBUFS means the kernel dropped events while we were busy;
            // the affected flows will simply stay untracked until their
            // DESTROY, so keep listening.
            if err.raw_os_error() == Some(libc::ENOBUFS) {
                info!("conntrack event overrun, some events were lost");
                return Ok(None);
            }
            return match err.kind() {
                io::ErrorKind::WouldBlock
                | io::ErrorKind::TimedOut
                | io::ErrorKind::Interrupted => Ok(None),
                _ => Err(err),
            };
        }

        parse_datagram(&self.buf[..n as usize], &mut self.pending);
        Ok(self.pending.pop_front())
    }
}
