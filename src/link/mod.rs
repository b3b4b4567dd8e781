//! StreamLink: framed pub/sub channel between pipeline stages
//!
//! TCP with a length-prefixed JSON frame per message:
//! - Hub (inference stage) accepts subscribers and fans messages out
//! - Client (capture stage, supervisor relay) reconnects on its own
//!
//! Delivery is at-most-once. Nothing is acknowledged or replayed.

pub mod client;
pub mod codec;
pub mod messages;
pub mod server;
pub mod subscribers;

pub use client::{LinkClient, LinkEvent, LinkHandle};
pub use messages::*;
pub use server::{HubEvent, LinkHub};
pub use subscribers::{SubscriberId, SubscriberSet};

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u8 = 1;

/// Default hub address
pub const DEFAULT_HUB_ADDR: &str = "127.0.0.1:8765";

/// StreamLink settings shared by hub and clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Address the inference hub listens on and clients connect to
    pub hub_addr: String,

    /// Largest accepted frame in bytes
    pub max_frame_bytes: usize,

    /// Delay between reconnect attempts (seconds)
    pub reconnect_delay_secs: f64,

    /// Connect attempt timeout (seconds)
    pub connect_timeout_secs: f64,

    /// Outbound queue depth per connection
    pub outbound_queue: usize,

    /// Keep-alive ping interval (seconds, 0 disables)
    pub ping_interval_secs: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            hub_addr: DEFAULT_HUB_ADDR.to_string(),
            max_frame_bytes: codec::DEFAULT_MAX_FRAME,
            reconnect_delay_secs: 5.0,
            connect_timeout_secs: 5.0,
            outbound_queue: 256,
            ping_interval_secs: 30,
        }
    }
}

impl LinkConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs_f64(self.reconnect_delay_secs.max(0.0))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connect_timeout_secs.max(0.1))
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_secs > 0).then(|| Duration::from_secs(self.ping_interval_secs))
    }
}
