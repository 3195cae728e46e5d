//! Zero-copy packet decoding
//!
//! NFQUEUE delivers raw IP datagrams (no link layer). [`PacketView::parse`]
//! decodes the L3/L4 headers and exposes the application payload as a slice
//! into the original buffer. Length fields are validated strictly: a datagram
//! whose total-length field disagrees with the delivered byte count is
//! rejected rather than guessed at, and the caller accepts it unchanged.

use std::net::{Ipv4Addr, Ipv6Addr};

use etherparse::{
    IpNumber, Ipv4HeaderSlice, Ipv6Header, Ipv6HeaderSlice, TcpHeaderSlice, UdpHeader,
    UdpHeaderSlice,
};
use thiserror::Error;

use crate::key::{FlowTuple, IPPROTO_TCP, IPPROTO_UDP};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("empty packet")]
    Empty,

    #[error("truncated {0} header")]
    TruncatedHeader(&'static str),

    #[error("{0} length field does not match packet length")]
    LengthMismatch(&'static str),
}

/// Network-layer addressing. `Other` carries the version nibble of packets
/// this classifier does not inspect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L3Info {
    V4 { src: Ipv4Addr, dst: Ipv4Addr },
    V6 { src: Ipv6Addr, dst: Ipv6Addr },
    Other(u8),
}

/// Transport-layer addressing. `Other` carries the IP protocol number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L4Info {
    Tcp { sport: u16, dport: u16 },
    Udp { sport: u16, dport: u16 },
    Other(u8),
}

/// A decoded datagram. `payload` borrows from the parse input.
#[derive(Debug, PartialEq)]
pub struct PacketView<'a> {
    pub l3: L3Info,
    pub l4: L4Info,
    pub payload: &'a [u8],
}

impl<'a> PacketView<'a> {
    pub fn parse(data: &'a [u8]) -> Result<PacketView<'a>, PacketError> {
        if data.is_empty() {
            return Err(PacketError::Empty);
        }

        let version = data[0] >> 4;
        let (l3, l4_proto, l4_start) = match version {
            4 => {
                let header = Ipv4HeaderSlice::from_slice(data)
                    .map_err(|_| PacketError::TruncatedHeader("ipv4"))?;
                if header.total_len() as usize != data.len() {
                    return Err(PacketError::LengthMismatch("ipv4"));
                }
                (
                    L3Info::V4 {
                        src: header.source_addr(),
                        dst: header.destination_addr(),
                    },
                    header.protocol(),
                    header.slice().len(),
                )
            }
            6 => {
                let header = Ipv6HeaderSlice::from_slice(data)
                    .map_err(|_| PacketError::TruncatedHeader("ipv6"))?;
                if header.payload_length() as usize + Ipv6Header::LEN != data.len() {
                    return Err(PacketError::LengthMismatch("ipv6"));
                }
                (
                    L3Info::V6 {
                        src: header.source_addr(),
                        dst: header.destination_addr(),
                    },
                    header.next_header(),
                    Ipv6Header::LEN,
                )
            }
            other => {
                return Ok(PacketView {
                    l3: L3Info::Other(other),
                    l4: L4Info::Other(0),
                    payload: &[],
                })
            }
        };

        match l4_proto {
            IpNumber::TCP => {
                let tcp = TcpHeaderSlice::from_slice(&data[l4_start..])
                    .map_err(|_| PacketError::TruncatedHeader("tcp"))?;
                let payload_start = l4_start + tcp.slice().len();
                Ok(PacketView {
                    l3,
                    l4: L4Info::Tcp {
                        sport: tcp.source_port(),
                        dport: tcp.destination_port(),
                    },
                    payload: &data[payload_start..],
                })
            }
            IpNumber::UDP => {
                let udp = UdpHeaderSlice::from_slice(&data[l4_start..])
                    .map_err(|_| PacketError::TruncatedHeader("udp"))?;
                if udp.length() as usize != data.len() - l4_start {
                    return Err(PacketError::LengthMismatch("udp"));
                }
                Ok(PacketView {
                    l3,
                    l4: L4Info::Udp {
                        sport: udp.source_port(),
                        dport: udp.destination_port(),
                    },
                    payload: &data[l4_start + UdpHeader::LEN..],
                })
            }
            other => Ok(PacketView {
                l3,
                l4: L4Info::Other(other.0),
                payload: &[],
            }),
        }
    }

    /// Flow tuple for table lookups. `None` for the L3/L4 combinations this
    /// classifier does not handle.
    pub fn flow_tuple(&self) -> Option<FlowTuple> {
        let (src, dst) = match self.l3 {
            L3Info::V4 { src, dst } => (src.into(), dst.into()),
            L3Info::V6 { src, dst } => (src.into(), dst.into()),
            L3Info::Other(_) => return None,
        };
        let (l4_proto, sport, dport) = match self.l4 {
            L4Info::Tcp { sport, dport } => (IPPROTO_TCP, sport, dport),
            L4Info::Udp { sport, dport } => (IPPROTO_UDP, sport, dport),
            L4Info::Other(_) => return None,
        };
        Some(FlowTuple {
            l4_proto,
            src,
            dst,
            sport,
            dport,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// IPv4 + TCP datagram with the given payload, correct length fields.
    fn tcp_v4_packet(payload: &[u8]) -> Vec<u8> {
        let total_len = (20 + 20 + payload.len()) as u16;
        let mut pkt = vec![
            0x45, // version=4, ihl=5
            0x00,
            (total_len >> 8) as u8,
            total_len as u8,
            0x12, 0x34, // identification
            0x40, 0x00, // flags (DF), fragment offset
            0x40, // ttl
            0x06, // protocol TCP
            0x00, 0x00, // checksum (not validated)
            192, 168, 1, 100, // src
            10, 0, 0, 1, // dst
        ];
        pkt.extend_from_slice(&[
            0x30, 0x39, // src port 12345
            0x00, 0x50, // dst port 80
            0x00, 0x00, 0x00, 0x01, // seq
            0x00, 0x00, 0x00, 0x00, // ack
            0x50, 0x18, // data offset=5, flags=PSH|ACK
            0xff, 0xff, // window
            0x00, 0x00, // checksum
            0x00, 0x00, // urgent pointer
        ]);
        pkt.extend_from_slice(payload);
        pkt
    }

    fn udp_v6_packet(payload: &[u8]) -> Vec<u8> {
        let udp_len = (8 + payload.len()) as u16;
        let mut pkt = vec![0x60, 0x00, 0x00, 0x00];
        pkt.extend_from_slice(&udp_len.to_be_bytes()); // payload length
        pkt.push(17); // next header UDP
        pkt.push(64); // hop limit
        pkt.extend_from_slice(&"2001:db8::1".parse::<Ipv6Addr>().unwrap().octets());
        pkt.extend_from_slice(&"2001:db8::2".parse::<Ipv6Addr>().unwrap().octets());
        pkt.extend_from_slice(&53u16.to_be_bytes());
        pkt.extend_from_slice(&33000u16.to_be_bytes());
        pkt.extend_from_slice(&udp_len.to_be_bytes());
        pkt.extend_from_slice(&[0x00, 0x00]); // checksum
        pkt.extend_from_slice(payload);
        pkt
    }

    #[test]
    fn test_parse_tcp_v4() {
        let data = tcp_v4_packet(b"GET / HTTP/1.1\r\n");
        let view = PacketView::parse(&data).unwrap();

        assert_eq!(
            view.l3,
            L3Info::V4 {
                src: Ipv4Addr::new(192, 168, 1, 100),
                dst: Ipv4Addr::new(10, 0, 0, 1),
            }
        );
        assert_eq!(
            view.l4,
            L4Info::Tcp {
                sport: 12345,
                dport: 80
            }
        );
        assert_eq!(view.payload, b"GET / HTTP/1.1\r\n");
    }

    #[test]
    fn test_parse_udp_v6() {
        let data = udp_v6_packet(b"hello");
        let view = PacketView::parse(&data).unwrap();

        assert!(matches!(view.l3, L3Info::V6 { .. }));
        assert_eq!(
            view.l4,
            L4Info::Udp {
                sport: 53,
                dport: 33000
            }
        );
        assert_eq!(view.payload, b"hello");
    }

    #[test]
    fn test_payload_borrows_input() {
        let data = tcp_v4_packet(b"x");
        let view = PacketView::parse(&data).unwrap();
        let payload_ptr = view.payload.as_ptr() as usize;
        let data_ptr = data.as_ptr() as usize;
        assert_eq!(payload_ptr, data_ptr + 40);
    }

    #[test]
    fn test_total_length_mismatch_rejected() {
        let mut data = tcp_v4_packet(b"payload");
        data.push(0); // one trailing byte the total-length field does not cover
        assert_eq!(
            PacketView::parse(&data),
            Err(PacketError::LengthMismatch("ipv4"))
        );
    }

    #[test]
    fn test_udp_length_mismatch_rejected() {
        let mut data = udp_v6_packet(b"dns");
        // Corrupt the UDP length field (bytes 44-45).
        data[44] = 0;
        data[45] = 200;
        // The IPv6 payload length still matches, only UDP lies.
        assert_eq!(
            PacketView::parse(&data),
            Err(PacketError::LengthMismatch("udp"))
        );
    }

    #[test]
    fn test_non_ip_is_other() {
        let view = PacketView::parse(&[0x20, 0x01, 0x02]).unwrap();
        assert_eq!(view.l3, L3Info::Other(2));
        assert!(view.payload.is_empty());
    }

    #[test]
    fn test_empty_packet() {
        assert_eq!(PacketView::parse(&[]), Err(PacketError::Empty));
    }

    #[test]
    fn test_truncated_tcp_rejected() {
        let data = tcp_v4_packet(b"");
        // Keep the IP header intact but lie about total length to chop TCP.
        let mut short = data[..30].to_vec();
        short[2] = 0;
        short[3] = 30;
        assert_eq!(
            PacketView::parse(&short),
            Err(PacketError::TruncatedHeader("tcp"))
        );
    }

    #[test]
    fn test_other_l4_has_no_payload() {
        let mut data = tcp_v4_packet(b"");
        data[9] = 47; // GRE
        let view = PacketView::parse(&data).unwrap();
        assert_eq!(view.l4, L4Info::Other(47));
        assert!(view.payload.is_empty());
    }
}
