//! Frame decoding
//!
//! Turns a captured frame into a [`Packet`] using etherparse. Only the IP and
//! transport fields the flow engine consumes are read; non-IP frames yield
//! `None`.

use std::net::IpAddr;

use etherparse::{NetSlice, SlicedPacket, TransportSlice};

use super::packet::{IpProtocol, Packet, TcpFlags};

/// Fixed IPv6 header length
const IPV6_HEADER_LEN: u16 = 40;
/// UDP header length
const UDP_HEADER_LEN: u16 = 8;

/// Link layer of a captured frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Ethernet,
    /// Bare IPv4/IPv6 (DLT_RAW, tun devices)
    RawIp,
}

/// A frame as delivered by a capture source
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Capture timestamp, seconds since the Unix epoch
    pub timestamp: f64,
    /// Original length on the wire
    pub orig_len: u32,
    pub link: LinkKind,
    pub data: Vec<u8>,
}

impl RawFrame {
    pub fn new(timestamp: f64, link: LinkKind, data: Vec<u8>) -> Self {
        Self {
            timestamp,
            orig_len: data.len() as u32,
            link,
            data,
        }
    }
}

/// Decode a captured frame. Returns `None` for non-IP or undecodable frames.
pub fn parse_frame(frame: &RawFrame) -> Option<Packet> {
    let sliced = match frame.link {
        LinkKind::Ethernet => SlicedPacket::from_ethernet(&frame.data).ok()?,
        LinkKind::RawIp => {
            let version = frame.data.first().map(|b| b >> 4)?;
            if version != 4 && version != 6 {
                return None;
            }
            SlicedPacket::from_ip(&frame.data).ok()?
        }
    };

    let mut packet = parse_ip(&sliced)?;
    parse_transport(&sliced, &mut packet);
    packet.timestamp = frame.timestamp;
    packet.raw_len = frame.orig_len.max(frame.data.len() as u32);
    Some(packet)
}

/// Parse the IP layer. Returns None for non-IP packets (ARP, etc.)
fn parse_ip(sliced: &SlicedPacket<'_>) -> Option<Packet> {
    match &sliced.net {
        Some(NetSlice::Ipv4(ipv4)) => {
            let header = ipv4.header();
            let mut packet = Packet::new(
                IpAddr::from(header.source_addr()),
                IpAddr::from(header.destination_addr()),
                IpProtocol::from(header.protocol().0),
            );
            packet.ip_header_len = Some(u16::from(header.ihl()) * 4);
            Some(packet)
        }
        Some(NetSlice::Ipv6(ipv6)) => {
            let header = ipv6.header();
            let mut packet = Packet::new(
                IpAddr::from(header.source_addr()),
                IpAddr::from(header.destination_addr()),
                IpProtocol::from(header.next_header().0),
            );
            packet.ip_header_len = Some(IPV6_HEADER_LEN);
            Some(packet)
        }
        _ => None,
    }
}

/// Fill ports, flags and header widths from the transport layer
fn parse_transport(sliced: &SlicedPacket<'_>, packet: &mut Packet) {
    match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => {
            packet.protocol = IpProtocol::Tcp;
            packet.src_port = tcp.source_port();
            packet.dst_port = tcp.destination_port();
            packet.transport_header_len = Some(u16::from(tcp.data_offset()) * 4);
            packet.window = Some(tcp.window_size());
            packet.tcp_flags = Some(TcpFlags {
                fin: tcp.fin(),
                syn: tcp.syn(),
                rst: tcp.rst(),
                psh: tcp.psh(),
                ack: tcp.ack(),
                urg: tcp.urg(),
                ece: tcp.ece(),
                cwr: tcp.cwr(),
            });
            packet.payload_len = tcp.payload().len() as u32;
        }
        Some(TransportSlice::Udp(udp)) => {
            packet.protocol = IpProtocol::Udp;
            packet.src_port = udp.source_port();
            packet.dst_port = udp.destination_port();
            packet.transport_header_len = Some(UDP_HEADER_LEN);
            packet.payload_len = udp.payload().len() as u32;
        }
        // ICMP and anything else: no ports, the flow key uses port 0
        _ => {}
    }
}
