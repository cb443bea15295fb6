//! Hand-rolled packet builders for tests. Keeping these as raw byte
//! layouts avoids dragging capture fixtures around and keeps the tests
//! independent of any packet-construction API.

use chrono::Utc;

use crate::packet::{LinkLayer, Packet};

pub const SYN: u8 = 0x02;
pub const PSH: u8 = 0x08;

fn ip_octets(addr: &str) -> [u8; 4] {
    addr.parse::<std::net::Ipv4Addr>().expect("test ip").octets()
}

fn ethernet_frame(ip: Vec<u8>) -> Packet {
    let mut data = vec![0u8; 12];
    data.extend_from_slice(&[0x08, 0x00]);
    data.extend_from_slice(&ip);
    Packet {
        data,
        timestamp: Utc::now(),
        link: LinkLayer::Ethernet,
    }
}

fn ipv4_header(
    src: &str,
    dst: &str,
    protocol: u8,
    identification: u16,
    flags_and_offset: u16,
    payload_len: usize,
) -> Vec<u8> {
    let total_len = (20 + payload_len) as u16;
    let mut h = Vec::with_capacity(20);
    h.push(0x45); // version 4, ihl 5
    h.push(0x00);
    h.extend_from_slice(&total_len.to_be_bytes());
    h.extend_from_slice(&identification.to_be_bytes());
    h.extend_from_slice(&flags_and_offset.to_be_bytes());
    h.push(64); // ttl
    h.push(protocol);
    h.extend_from_slice(&[0x00, 0x00]); // checksum, not verified by slicing
    h.extend_from_slice(&ip_octets(src));
    h.extend_from_slice(&ip_octets(dst));
    h
}

const DONT_FRAGMENT: u16 = 0x4000;
const MORE_FRAGMENTS: u16 = 0x2000;

/// An unfragmented IPv4 packet with an arbitrary protocol and payload.
pub fn ipv4_packet(src: &str, dst: &str, protocol: u8, payload: &[u8]) -> Packet {
    let mut ip = ipv4_header(src, dst, protocol, 0, DONT_FRAGMENT, payload.len());
    ip.extend_from_slice(payload);
    ethernet_frame(ip)
}

/// One fragment of a UDP datagram. `offset` is in bytes and must be a
/// multiple of 8; `payload` is the fragment's slice of the full IP
/// payload (the UDP header belongs in the offset-zero fragment).
pub fn udp_fragment(
    src: &str,
    dst: &str,
    identification: u16,
    offset: usize,
    more: bool,
    payload: &[u8],
) -> Packet {
    assert_eq!(offset % 8, 0, "fragment offsets are 8-octet aligned");
    let mut flags_and_offset = (offset / 8) as u16;
    if more {
        flags_and_offset |= MORE_FRAGMENTS;
    }
    let mut ip = ipv4_header(src, dst, 17, identification, flags_and_offset, payload.len());
    ip.extend_from_slice(payload);
    ethernet_frame(ip)
}

pub fn udp_payload(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let mut udp = Vec::with_capacity(8 + payload.len());
    udp.extend_from_slice(&src_port.to_be_bytes());
    udp.extend_from_slice(&dst_port.to_be_bytes());
    udp.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    udp.extend_from_slice(&[0x00, 0x00]); // checksum optional for ipv4
    udp.extend_from_slice(payload);
    udp
}

/// A complete UDP packet.
pub fn udp_packet(src: &str, dst: &str, src_port: u16, dst_port: u16, payload: &[u8]) -> Packet {
    let udp = udp_payload(src_port, dst_port, payload);
    let mut ip = ipv4_header(src, dst, 17, 0, DONT_FRAGMENT, udp.len());
    ip.extend_from_slice(&udp);
    ethernet_frame(ip)
}

/// A TCP segment with the given sequence number and flag byte.
pub fn tcp_packet(
    src: &str,
    dst: &str,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    flags: u8,
    payload: &[u8],
) -> Packet {
    let mut tcp = Vec::with_capacity(20 + payload.len());
    tcp.extend_from_slice(&src_port.to_be_bytes());
    tcp.extend_from_slice(&dst_port.to_be_bytes());
    tcp.extend_from_slice(&seq.to_be_bytes());
    tcp.extend_from_slice(&0u32.to_be_bytes()); // ack
    tcp.push(0x50); // data offset 5 words
    tcp.push(flags);
    tcp.extend_from_slice(&0xffffu16.to_be_bytes()); // window
    tcp.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]); // checksum + urgent
    tcp.extend_from_slice(payload);

    let mut ip = ipv4_header(src, dst, 6, 0, DONT_FRAGMENT, tcp.len());
    ip.extend_from_slice(&tcp);
    ethernet_frame(ip)
}
