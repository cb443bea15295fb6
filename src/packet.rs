//! Decoded packet model.
//!
//! Packets are owned byte buffers captured off the wire; layer views are
//! computed by parsing rather than mutated in place. After IP
//! reassembly the transport layer is re-parsed from the reassembled
//! payload, which replaces builder-style layer insertion with plain
//! ownership transfer.

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use etherparse::{InternetSlice, SlicedPacket, TcpHeaderSlice, UdpHeaderSlice};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("packet parse error: {0}")]
    Parse(String),
    #[error("packet has no IPv4 layer")]
    NoIpv4,
    #[error("truncated {0} header")]
    Truncated(&'static str),
}

/// Link-layer framing of the capture source. Set once when the capture
/// handle is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkLayer {
    Ethernet,
    /// BSD/Linux loopback: a 4-byte address-family header, then IP.
    Null,
    /// Raw IP, no link framing.
    Raw,
}

/// One captured frame: owned bytes plus capture metadata.
#[derive(Debug, Clone)]
pub struct Packet {
    pub data: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub link: LinkLayer,
}

/// An owned IPv4 datagram view: the header fields the pipeline cares
/// about plus the payload bytes.
#[derive(Debug, Clone)]
pub struct Ipv4Datagram {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: u8,
    pub identification: u16,
    pub dont_fragment: bool,
    pub more_fragments: bool,
    /// Fragment offset in bytes (the wire field is in 8-octet units).
    pub fragment_offset: usize,
    pub total_len: u16,
    pub payload: Vec<u8>,
}

impl Ipv4Datagram {
    pub const HEADER_LEN: usize = 20;

    /// Part of a fragmented datagram, needing reassembly?
    pub fn is_fragment(&self) -> bool {
        !self.dont_fragment && (self.more_fragments || self.fragment_offset > 0)
    }
}

#[derive(Debug, Clone)]
pub struct UdpSegment {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct TcpSegment {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum Transport {
    Udp(UdpSegment),
    Tcp(TcpSegment),
    /// A transport protocol the pipeline does not handle (SCTP etc.),
    /// tagged with the IP protocol number.
    Other(u8),
}

#[derive(Debug)]
pub struct Decoded {
    pub ipv4: Ipv4Datagram,
    /// None for fragments (the transport header may be sliced across
    /// fragments) and for protocols with no transport layer (ICMP).
    pub transport: Option<Transport>,
}

/// Decode a captured frame down to its IPv4 and transport layers.
pub fn decode(packet: &Packet) -> Result<Decoded, DecodeError> {
    let sliced = match packet.link {
        LinkLayer::Ethernet => SlicedPacket::from_ethernet(&packet.data),
        LinkLayer::Null => {
            if packet.data.len() < 4 {
                return Err(DecodeError::Truncated("loopback"));
            }
            SlicedPacket::from_ip(&packet.data[4..])
        }
        LinkLayer::Raw => SlicedPacket::from_ip(&packet.data),
    }
    .map_err(|e| DecodeError::Parse(e.to_string()))?;

    let ipv4 = match &sliced.net {
        Some(InternetSlice::Ipv4(ipv4)) => ipv4,
        _ => return Err(DecodeError::NoIpv4),
    };
    let header = ipv4.header();
    let payload = sliced
        .ip_payload()
        .map(|p| p.payload.to_vec())
        .unwrap_or_default();

    let dgram = Ipv4Datagram {
        src: header.source_addr(),
        dst: header.destination_addr(),
        protocol: header.protocol().0,
        identification: header.identification(),
        dont_fragment: header.dont_fragment(),
        more_fragments: header.more_fragments(),
        fragment_offset: header.fragments_offset().value() as usize * 8,
        total_len: header.total_len(),
        payload,
    };

    let transport = if dgram.is_fragment() {
        None
    } else {
        decode_transport(&dgram)?
    };
    Ok(Decoded { ipv4: dgram, transport })
}

/// Parse the transport layer out of an IPv4 payload. Used both on the
/// initial decode and to re-decode after reassembly.
pub fn decode_transport(ip4: &Ipv4Datagram) -> Result<Option<Transport>, DecodeError> {
    match ip4.protocol {
        6 => {
            let tcp = TcpHeaderSlice::from_slice(&ip4.payload)
                .map_err(|_| DecodeError::Truncated("tcp"))?;
            let header_len = tcp.slice().len();
            Ok(Some(Transport::Tcp(TcpSegment {
                src_port: tcp.source_port(),
                dst_port: tcp.destination_port(),
                seq: tcp.sequence_number(),
                syn: tcp.syn(),
                fin: tcp.fin(),
                rst: tcp.rst(),
                payload: ip4.payload[header_len..].to_vec(),
            })))
        }
        17 => {
            let udp = UdpHeaderSlice::from_slice(&ip4.payload)
                .map_err(|_| DecodeError::Truncated("udp"))?;
            // Trust the UDP length field but never read past the buffer.
            let total = (udp.length() as usize).clamp(8, ip4.payload.len());
            Ok(Some(Transport::Udp(UdpSegment {
                src_port: udp.source_port(),
                dst_port: udp.destination_port(),
                payload: ip4.payload[8..total].to_vec(),
            })))
        }
        // ICMP and friends carry no transport layer we can demux on.
        1 => Ok(None),
        other => Ok(Some(Transport::Other(other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn decodes_udp() {
        let packet = testutil::udp_packet("10.0.0.1", "10.0.0.2", 5060, 5060, b"payload");
        let decoded = decode(&packet).unwrap();
        assert_eq!(decoded.ipv4.protocol, 17);
        assert!(!decoded.ipv4.is_fragment());
        match decoded.transport {
            Some(Transport::Udp(udp)) => {
                assert_eq!(udp.src_port, 5060);
                assert_eq!(udp.dst_port, 5060);
                assert_eq!(udp.payload, b"payload");
            }
            other => panic!("expected udp transport, got {other:?}"),
        }
    }

    #[test]
    fn decodes_tcp() {
        let packet =
            testutil::tcp_packet("10.0.0.1", "10.0.0.2", 5060, 5060, 42, testutil::SYN, b"x");
        let decoded = decode(&packet).unwrap();
        match decoded.transport {
            Some(Transport::Tcp(tcp)) => {
                assert_eq!(tcp.seq, 42);
                assert!(tcp.syn);
                assert!(!tcp.fin);
                assert_eq!(tcp.payload, b"x");
            }
            other => panic!("expected tcp transport, got {other:?}"),
        }
    }

    #[test]
    fn fragment_has_no_transport() {
        let packet = testutil::udp_fragment("10.0.0.1", "10.0.0.2", 77, 0, true, b"01234567");
        let decoded = decode(&packet).unwrap();
        assert!(decoded.ipv4.is_fragment());
        assert!(decoded.transport.is_none());
        assert_eq!(decoded.ipv4.payload, b"01234567");
    }

    #[test]
    fn icmp_is_transportless() {
        let packet = testutil::ipv4_packet("10.0.0.1", "10.0.0.2", 1, &[8, 0, 0, 0, 0, 0, 0, 0]);
        let decoded = decode(&packet).unwrap();
        assert!(decoded.transport.is_none());
    }

    #[test]
    fn sctp_is_other() {
        let packet = testutil::ipv4_packet("10.0.0.1", "10.0.0.2", 132, &[0; 16]);
        let decoded = decode(&packet).unwrap();
        assert!(matches!(decoded.transport, Some(Transport::Other(132))));
    }

    #[test]
    fn garbage_fails_decode() {
        let packet = Packet {
            data: vec![0xde, 0xad],
            timestamp: Utc::now(),
            link: LinkLayer::Ethernet,
        };
        assert!(decode(&packet).is_err());
    }
}
