//! Unified packet representation
//!
//! Holds only the header fields the flow/feature engine consumes. Anything the
//! parser could not read stays `None` and the dependent feature falls back
//! to 0.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::error::FeatureComputeError;

/// IP protocol numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IpProtocol {
    Icmp,
    Tcp,
    Udp,
    Icmpv6,
    Other(u8),
}

impl From<u8> for IpProtocol {
    fn from(val: u8) -> Self {
        match val {
            1 => IpProtocol::Icmp,
            6 => IpProtocol::Tcp,
            17 => IpProtocol::Udp,
            58 => IpProtocol::Icmpv6,
            other => IpProtocol::Other(other),
        }
    }
}

impl From<IpProtocol> for u8 {
    fn from(val: IpProtocol) -> Self {
        match val {
            IpProtocol::Icmp => 1,
            IpProtocol::Tcp => 6,
            IpProtocol::Udp => 17,
            IpProtocol::Icmpv6 => 58,
            IpProtocol::Other(v) => v,
        }
    }
}

impl std::fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpProtocol::Icmp => write!(f, "ICMP"),
            IpProtocol::Tcp => write!(f, "TCP"),
            IpProtocol::Udp => write!(f, "UDP"),
            IpProtocol::Icmpv6 => write!(f, "ICMPv6"),
            IpProtocol::Other(n) => write!(f, "Proto({})", n),
        }
    }
}

/// TCP flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
    pub ece: bool,
    pub cwr: bool,
}

impl TcpFlags {
    pub fn from_u8(flags: u8) -> Self {
        Self {
            fin: flags & 0x01 != 0,
            syn: flags & 0x02 != 0,
            rst: flags & 0x04 != 0,
            psh: flags & 0x08 != 0,
            ack: flags & 0x10 != 0,
            urg: flags & 0x20 != 0,
            ece: flags & 0x40 != 0,
            cwr: flags & 0x80 != 0,
        }
    }
}

/// Packet direction relative to the flow initiator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Sent by the endpoint that opened the flow
    Forward,
    /// Sent by the responder
    Backward,
}

/// A decoded packet as seen by the flow engine
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Capture timestamp, seconds since the Unix epoch
    pub timestamp: f64,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: IpProtocol,
    /// Frame length on the wire (including link layer)
    pub raw_len: u32,
    /// IP header length in bytes (IPv4 IHL * 4, IPv6 fixed header)
    pub ip_header_len: Option<u16>,
    /// Transport header length in bytes (TCP data offset * 4, UDP 8)
    pub transport_header_len: Option<u16>,
    pub tcp_flags: Option<TcpFlags>,
    /// TCP receive window
    pub window: Option<u16>,
    /// Transport payload length
    pub payload_len: u32,
}

impl Packet {
    /// Create a packet with addresses only; remaining fields are unset
    pub fn new(src_ip: IpAddr, dst_ip: IpAddr, protocol: IpProtocol) -> Self {
        Self {
            timestamp: 0.0,
            src_ip,
            dst_ip,
            src_port: 0,
            dst_port: 0,
            protocol,
            raw_len: 0,
            ip_header_len: None,
            transport_header_len: None,
            tcp_flags: None,
            window: None,
            payload_len: 0,
        }
    }

    /// Source endpoint
    pub fn src(&self) -> (IpAddr, u16) {
        (self.src_ip, self.src_port)
    }

    /// Destination endpoint
    pub fn dst(&self) -> (IpAddr, u16) {
        (self.dst_ip, self.dst_port)
    }

    /// IP header plus TCP/UDP header length
    pub fn header_len(&self) -> Result<u32, FeatureComputeError> {
        match self.protocol {
            IpProtocol::Tcp | IpProtocol::Udp => {
                let ip = self
                    .ip_header_len
                    .ok_or(FeatureComputeError::MissingField("ip_header_len"))?;
                let transport = self
                    .transport_header_len
                    .ok_or(FeatureComputeError::MissingField("transport_header_len"))?;
                Ok(u32::from(ip) + u32::from(transport))
            }
            _ => Err(FeatureComputeError::MissingField("transport_header_len")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_flags_from_bits() {
        let flags = TcpFlags::from_u8(0x12);
        assert!(flags.syn);
        assert!(flags.ack);
        assert!(!flags.urg);
        assert!(!flags.fin);
    }

    #[test]
    fn test_protocol_numbers() {
        assert_eq!(IpProtocol::from(6), IpProtocol::Tcp);
        assert_eq!(IpProtocol::from(47), IpProtocol::Other(47));
        assert_eq!(u8::from(IpProtocol::Udp), 17);
    }

    #[test]
    fn test_header_len() {
        let mut pkt = Packet::new(
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            IpProtocol::Tcp,
        );
        assert!(pkt.header_len().is_err());

        pkt.ip_header_len = Some(20);
        pkt.transport_header_len = Some(32);
        assert_eq!(pkt.header_len(), Ok(52));

        pkt.protocol = IpProtocol::Icmp;
        assert_eq!(
            pkt.header_len(),
            Err(FeatureComputeError::MissingField("transport_header_len"))
        );
    }
}
