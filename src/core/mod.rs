//! Core shared types for packet processing
//!
//! - `Packet`: decoded header fields consumed by the flow engine
//! - `FlowKey` / `FlowState`: bidirectional flow tracking
//! - `parser`: frame decoding on top of etherparse

pub mod flow;
pub mod packet;
pub mod parser;

pub use flow::{DirectionStats, FlowKey, FlowState, PacketRecord};
pub use packet::{Direction, IpProtocol, Packet, TcpFlags};
pub use parser::{parse_frame, LinkKind, RawFrame};
