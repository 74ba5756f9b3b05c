//! IP header inspection for flow keying.
//!
//! Only what the flow table needs leaves this module: the transport
//! protocol, the endpoint pair, and whether a TCP segment signals
//! teardown. Payload bytes are never touched.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::{Error, Result};

/// Transport protocol carried in an IP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Proto {
    Tcp,
    Udp,
    Icmp,
    Icmpv6,
    Other(u8),
}

impl Proto {
    pub fn from_number(n: u8) -> Self {
        match n {
            6 => Proto::Tcp,
            17 => Proto::Udp,
            1 => Proto::Icmp,
            58 => Proto::Icmpv6,
            other => Proto::Other(other),
        }
    }

    pub fn number(self) -> u8 {
        match self {
            Proto::Tcp => 6,
            Proto::Udp => 17,
            Proto::Icmp => 1,
            Proto::Icmpv6 => 58,
            Proto::Other(n) => n,
        }
    }

    fn has_ports(self) -> bool {
        matches!(self, Proto::Tcp | Proto::Udp)
    }
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proto::Tcp => write!(f, "tcp"),
            Proto::Udp => write!(f, "udp"),
            Proto::Icmp => write!(f, "icmp"),
            Proto::Icmpv6 => write!(f, "icmpv6"),
            Proto::Other(n) => write!(f, "proto-{n}"),
        }
    }
}

/// Stable identity of a flow: protocol plus the endpoint pair as seen
/// from the local side. Port 0 stands in for portless protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub proto: Proto,
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

impl FlowKey {
    pub fn new(proto: Proto, local: SocketAddr, remote: SocketAddr) -> Self {
        Self {
            proto,
            local,
            remote,
        }
    }

    /// The same flow seen from the other direction.
    pub fn reverse(&self) -> Self {
        Self {
            proto: self.proto,
            local: self.remote,
            remote: self.local,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.proto, self.local, self.remote)
    }
}

/// Borrowed view over one IP packet's headers.
#[derive(Debug, Clone)]
pub struct PacketView<'a> {
    pub proto: Proto,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    /// Total unit length in bytes, for traffic accounting.
    pub len: usize,
    data: &'a [u8],
    transport_offset: usize,
}

impl<'a> PacketView<'a> {
    /// Parse v4 or v6 headers off the front of `data`.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let first = data
            .first()
            .ok_or_else(|| Error::MalformedPacket("empty packet".into()))?;
        match first >> 4 {
            4 => Self::parse_v4(data),
            6 => Self::parse_v6(data),
            v => Err(Error::MalformedPacket(format!("unknown IP version {v}"))),
        }
    }

    fn parse_v4(data: &'a [u8]) -> Result<Self> {
        if data.len() < 20 {
            return Err(Error::MalformedPacket("short IPv4 header".into()));
        }
        let header_len = usize::from(data[0] & 0x0f) * 4;
        if header_len < 20 || data.len() < header_len {
            return Err(Error::MalformedPacket("truncated IPv4 header".into()));
        }

        let proto = Proto::from_number(data[9]);
        let src = IpAddr::V4(Ipv4Addr::new(data[12], data[13], data[14], data[15]));
        let dst = IpAddr::V4(Ipv4Addr::new(data[16], data[17], data[18], data[19]));
        let (src_port, dst_port) = read_ports(data, header_len, proto);

        Ok(Self {
            proto,
            src,
            dst,
            src_port,
            dst_port,
            len: data.len(),
            data,
            transport_offset: header_len,
        })
    }

    fn parse_v6(data: &'a [u8]) -> Result<Self> {
        if data.len() < 40 {
            return Err(Error::MalformedPacket("short IPv6 header".into()));
        }

        let mut src = [0u8; 16];
        let mut dst = [0u8; 16];
        src.copy_from_slice(&data[8..24]);
        dst.copy_from_slice(&data[24..40]);

        let (proto, transport_offset) = walk_v6_extensions(data, data[6], 40);
        let (src_port, dst_port) = read_ports(data, transport_offset, proto);

        Ok(Self {
            proto,
            src: IpAddr::V6(Ipv6Addr::from(src)),
            dst: IpAddr::V6(Ipv6Addr::from(dst)),
            src_port,
            dst_port,
            len: data.len(),
            data,
            transport_offset,
        })
    }

    /// Flow key for an outbound packet: source is the local side.
    pub fn flow_key(&self) -> FlowKey {
        FlowKey::new(
            self.proto,
            SocketAddr::new(self.src, self.src_port),
            SocketAddr::new(self.dst, self.dst_port),
        )
    }

    /// Flow key for an inbound packet: destination is the local side.
    pub fn reverse_key(&self) -> FlowKey {
        self.flow_key().reverse()
    }

    /// Whether this is a TCP FIN or RST segment.
    pub fn is_teardown(&self) -> bool {
        if self.proto != Proto::Tcp {
            return false;
        }
        // TCP flags live at byte 13 of the TCP header.
        match self.data.get(self.transport_offset + 13) {
            Some(flags) => flags & 0x01 != 0 || flags & 0x04 != 0,
            None => false,
        }
    }
}

fn read_ports(data: &[u8], offset: usize, proto: Proto) -> (u16, u16) {
    if !proto.has_ports() || data.len() < offset + 4 {
        return (0, 0);
    }
    let src = u16::from_be_bytes([data[offset], data[offset + 1]]);
    let dst = u16::from_be_bytes([data[offset + 2], data[offset + 3]]);
    (src, dst)
}

/// Follow the IPv6 extension header chain to the transport header.
fn walk_v6_extensions(data: &[u8], first_header: u8, start: usize) -> (Proto, usize) {
    const HOP_BY_HOP: u8 = 0;
    const ROUTING: u8 = 43;
    const FRAGMENT: u8 = 44;
    const DESTINATION: u8 = 60;

    let mut header = first_header;
    let mut offset = start;

    while offset + 2 <= data.len() {
        match header {
            HOP_BY_HOP | ROUTING | DESTINATION => {
                let next = data[offset];
                offset += (usize::from(data[offset + 1]) + 1) * 8;
                header = next;
            }
            FRAGMENT => {
                let next = data[offset];
                offset += 8;
                header = next;
            }
            _ => break,
        }
    }

    (Proto::from_number(header), offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4_packet(proto: u8, src_port: u16, dst_port: u16, tcp_flags: u8) -> Vec<u8> {
        let mut p = vec![
            0x45, 0x00, 0x00, 0x28, // version 4, ihl 5, total length 40
            0x00, 0x01, 0x00, 0x00, // id, flags, fragment offset
            0x40, proto, 0x00, 0x00, // ttl 64, protocol, checksum
            10, 0, 0, 5, // src 10.0.0.5
            1, 1, 1, 1, // dst 1.1.1.1
        ];
        p.extend_from_slice(&src_port.to_be_bytes());
        p.extend_from_slice(&dst_port.to_be_bytes());
        if proto == 6 {
            // seq, ack, data offset + flags, window, checksum, urgent
            p.extend_from_slice(&[0; 8]);
            p.extend_from_slice(&[0x50, tcp_flags, 0x00, 0x00]);
            p.extend_from_slice(&[0; 4]);
        } else {
            // udp length + checksum
            p.extend_from_slice(&[0x00, 0x08, 0x00, 0x00]);
        }
        p
    }

    fn v6_udp_packet(src_port: u16, dst_port: u16) -> Vec<u8> {
        let mut p = vec![0x60, 0, 0, 0]; // version 6, class, flow label
        p.extend_from_slice(&8u16.to_be_bytes()); // payload length
        p.push(17); // next header: udp
        p.push(64); // hop limit
        let mut src = [0u8; 16];
        src[15] = 1;
        let mut dst = [0u8; 16];
        dst[15] = 2;
        p.extend_from_slice(&src);
        p.extend_from_slice(&dst);
        p.extend_from_slice(&src_port.to_be_bytes());
        p.extend_from_slice(&dst_port.to_be_bytes());
        p.extend_from_slice(&[0x00, 0x08, 0x00, 0x00]);
        p
    }

    #[test]
    fn test_parse_v4_udp() {
        let data = v4_packet(17, 5353, 53, 0);
        let view = PacketView::parse(&data).unwrap();

        assert_eq!(view.proto, Proto::Udp);
        assert_eq!(view.src, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)));
        assert_eq!(view.dst, IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)));
        assert_eq!(view.src_port, 5353);
        assert_eq!(view.dst_port, 53);
        assert_eq!(view.len, data.len());
    }

    #[test]
    fn test_parse_v6_udp() {
        let data = v6_udp_packet(40000, 443);
        let view = PacketView::parse(&data).unwrap();

        assert_eq!(view.proto, Proto::Udp);
        assert_eq!(view.src_port, 40000);
        assert_eq!(view.dst_port, 443);
        assert!(matches!(view.src, IpAddr::V6(_)));
    }

    #[test]
    fn test_flow_key_round_trip() {
        let data = v4_packet(6, 40000, 443, 0x02);
        let view = PacketView::parse(&data).unwrap();

        let out = view.flow_key();
        assert_eq!(out.local.port(), 40000);
        assert_eq!(out.remote.port(), 443);

        // An inbound reply keys back to the same flow.
        assert_eq!(out.reverse().reverse(), out);
        assert_eq!(view.reverse_key(), out.reverse());
    }

    #[test]
    fn test_teardown_flags() {
        let syn = v4_packet(6, 40000, 443, 0x02);
        assert!(!PacketView::parse(&syn).unwrap().is_teardown());

        let fin = v4_packet(6, 40000, 443, 0x11); // FIN+ACK
        assert!(PacketView::parse(&fin).unwrap().is_teardown());

        let rst = v4_packet(6, 40000, 443, 0x04);
        assert!(PacketView::parse(&rst).unwrap().is_teardown());

        let udp = v4_packet(17, 5353, 53, 0);
        assert!(!PacketView::parse(&udp).unwrap().is_teardown());
    }

    #[test]
    fn test_icmp_keys_with_zero_ports() {
        let mut data = v4_packet(1, 0, 0, 0);
        data.truncate(20); // header only
        let view = PacketView::parse(&data).unwrap();
        assert_eq!(view.proto, Proto::Icmp);
        assert_eq!(view.flow_key().local.port(), 0);
    }

    #[test]
    fn test_malformed_packets_rejected() {
        assert!(PacketView::parse(&[]).is_err());
        assert!(PacketView::parse(&[0x45, 0x00]).is_err());
        assert!(PacketView::parse(&[0x90; 40]).is_err()); // version 9
        let short_v6 = vec![0x60; 24];
        assert!(PacketView::parse(&short_v6).is_err());
    }

    #[test]
    fn test_proto_numbers() {
        assert_eq!(Proto::from_number(6), Proto::Tcp);
        assert_eq!(Proto::from_number(17), Proto::Udp);
        assert_eq!(Proto::Udp.number(), 17);
        assert_eq!(Proto::Other(89).number(), 89);
        assert_eq!(Proto::Tcp.to_string(), "tcp");
    }
}
