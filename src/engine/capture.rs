//! Packet sources
//!
//! Supports multiple acquisition methods:
//! - Live interface capture through libpcap (`live-capture` feature)
//! - PCAP file replay
//! - Synthetic frames (tests, demos)

use std::collections::VecDeque;
use std::fs::File;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pcap_file::pcap::PcapReader;
use pcap_file::DataLink;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::parser::{LinkKind, RawFrame};
use crate::error::CaptureError;

/// Capture method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMethod {
    /// Live interface via libpcap
    #[default]
    Live,
    /// PCAP file replay
    File,
    /// Synthetic traffic
    Synthetic,
}

/// Capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Capture method
    pub method: CaptureMethod,
    /// Interface name (live method). Auto-selected when unset.
    pub interface: Option<String>,
    /// PCAP file path (file method)
    pub pcap_file: Option<PathBuf>,
    /// Snapshot length
    pub snaplen: i32,
    /// Read timeout in milliseconds; bounds how long a stop request waits
    pub timeout_ms: i32,
    /// Enable promiscuous mode
    pub promiscuous: bool,
    /// Source addresses admitted into flow tracking. Empty admits all.
    pub allowed_sources: Vec<IpAddr>,
    /// Frames buffered between the capture thread and the flow worker
    pub queue_capacity: usize,
    /// Feature frames buffered between the flow worker and the link
    pub handoff_capacity: usize,
    /// Reopen delay after a permission failure (seconds)
    pub permission_backoff_secs: f64,
    /// Reopen delay after any other failure (seconds)
    pub failure_backoff_secs: f64,
    /// Give up after this many consecutive failures (0 = never)
    pub max_consecutive_failures: u32,
    /// Interval for queue statistics logging (seconds)
    pub stats_interval_secs: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            method: CaptureMethod::Live,
            interface: None,
            pcap_file: None,
            snaplen: 65535,
            timeout_ms: 100,
            promiscuous: true,
            allowed_sources: Vec::new(),
            queue_capacity: 4096,
            handoff_capacity: 1024,
            permission_backoff_secs: 2.0,
            failure_backoff_secs: 1.0,
            max_consecutive_failures: 0,
            stats_interval_secs: 30,
        }
    }
}

impl CaptureConfig {
    pub fn permission_backoff(&self) -> Duration {
        Duration::from_secs_f64(self.permission_backoff_secs.max(0.0))
    }

    pub fn failure_backoff(&self) -> Duration {
        Duration::from_secs_f64(self.failure_backoff_secs.max(0.0))
    }
}

/// A blocking source of captured frames
pub trait PacketSource: Send {
    /// Next frame. `Ok(None)` means the read timed out with nothing captured;
    /// `Err(CaptureError::Exhausted)` means the source has ended.
    fn next_frame(&mut self) -> Result<Option<RawFrame>, CaptureError>;

    /// Human-readable description for logs
    fn describe(&self) -> String;
}

/// Opens a fresh source; called again after every capture failure
pub type SourceOpener = Arc<dyn Fn() -> Result<Box<dyn PacketSource>, CaptureError> + Send + Sync>;

/// Build the opener for a configuration
pub fn source_opener(config: &CaptureConfig) -> SourceOpener {
    let config = config.clone();
    Arc::new(move || open_source(&config))
}

/// Create a source based on configuration
pub fn open_source(config: &CaptureConfig) -> Result<Box<dyn PacketSource>, CaptureError> {
    match config.method {
        CaptureMethod::Live => open_live(config),
        CaptureMethod::File => {
            let path = config
                .pcap_file
                .clone()
                .ok_or_else(|| CaptureError::Unavailable("pcap_file not configured".into()))?;
            Ok(Box::new(FileSource::open(path)?))
        }
        CaptureMethod::Synthetic => Ok(Box::new(SyntheticSource::demo())),
    }
}

#[cfg(feature = "live-capture")]
fn open_live(config: &CaptureConfig) -> Result<Box<dyn PacketSource>, CaptureError> {
    let interface = match &config.interface {
        Some(name) => name.clone(),
        None => select_interface()?,
    };
    Ok(Box::new(live::LiveSource::open(&interface, config)?))
}

#[cfg(not(feature = "live-capture"))]
fn open_live(_config: &CaptureConfig) -> Result<Box<dyn PacketSource>, CaptureError> {
    Err(CaptureError::Unavailable(
        "built without the live-capture feature".into(),
    ))
}

/// Pick the first non-loopback device that is up and has an address,
/// falling back to the library default
#[cfg(feature = "live-capture")]
pub fn select_interface() -> Result<String, CaptureError> {
    let devices =
        pcap::Device::list().map_err(|e| CaptureError::from_driver_message(e.to_string()))?;
    for device in &devices {
        debug!("Interface {} ({} addresses)", device.name, device.addresses.len());
    }

    if let Some(device) = devices.iter().find(|d| {
        !d.flags.is_loopback() && d.flags.is_up() && !d.addresses.is_empty()
    }) {
        info!("Selected interface {}", device.name);
        return Ok(device.name.clone());
    }

    match pcap::Device::lookup() {
        Ok(Some(device)) => {
            info!("No active interface found, using default {}", device.name);
            Ok(device.name)
        }
        Ok(None) => Err(CaptureError::Device("no capture device available".into())),
        Err(e) => Err(CaptureError::from_driver_message(e.to_string())),
    }
}

#[cfg(feature = "live-capture")]
mod live {
    use super::*;

    /// Live libpcap capture
    pub struct LiveSource {
        cap: pcap::Capture<pcap::Active>,
        interface: String,
        link: LinkKind,
    }

    impl LiveSource {
        pub fn open(interface: &str, config: &CaptureConfig) -> Result<Self, CaptureError> {
            let cap = pcap::Capture::from_device(interface)
                .map_err(|e| CaptureError::from_driver_message(e.to_string()))?
                .promisc(config.promiscuous)
                .snaplen(config.snaplen)
                .timeout(config.timeout_ms)
                .immediate_mode(true)
                .open()
                .map_err(|e| CaptureError::from_driver_message(e.to_string()))?;

            let link = match cap.get_datalink() {
                pcap::Linktype::ETHERNET => LinkKind::Ethernet,
                pcap::Linktype(12) | pcap::Linktype(101) => LinkKind::RawIp,
                other => {
                    return Err(CaptureError::Device(format!(
                        "unsupported link type {:?} on {}",
                        other, interface
                    )))
                }
            };

            Ok(Self {
                cap,
                interface: interface.to_string(),
                link,
            })
        }
    }

    impl PacketSource for LiveSource {
        fn next_frame(&mut self) -> Result<Option<RawFrame>, CaptureError> {
            match self.cap.next_packet() {
                Ok(packet) => {
                    let ts = packet.header.ts;
                    let timestamp = ts.tv_sec as f64 + ts.tv_usec as f64 / 1_000_000.0;
                    Ok(Some(RawFrame {
                        timestamp,
                        orig_len: packet.header.len,
                        link: self.link,
                        data: packet.data.to_vec(),
                    }))
                }
                // Normal timeout, continue
                Err(pcap::Error::TimeoutExpired) => Ok(None),
                Err(e) => Err(CaptureError::from_driver_message(e.to_string())),
            }
        }

        fn describe(&self) -> String {
            format!("interface {}", self.interface)
        }
    }
}

/// PCAP file replay
pub struct FileSource {
    reader: PcapReader<BufReader<File>>,
    path: PathBuf,
    link: LinkKind,
}

impl FileSource {
    pub fn open(path: PathBuf) -> Result<Self, CaptureError> {
        let file = File::open(&path)?;
        let reader = PcapReader::new(BufReader::new(file))
            .map_err(|e| CaptureError::Device(format!("{}: {}", path.display(), e)))?;

        let link = match reader.header().datalink {
            DataLink::ETHERNET => LinkKind::Ethernet,
            DataLink::RAW | DataLink::IPV4 | DataLink::IPV6 => LinkKind::RawIp,
            other => {
                return Err(CaptureError::Device(format!(
                    "{}: unsupported link type {:?}",
                    path.display(),
                    other
                )))
            }
        };

        info!("Replaying {} ({:?})", path.display(), link);
        Ok(Self { reader, path, link })
    }
}

impl PacketSource for FileSource {
    fn next_frame(&mut self) -> Result<Option<RawFrame>, CaptureError> {
        match self.reader.next_packet() {
            Some(Ok(packet)) => Ok(Some(RawFrame {
                timestamp: packet.timestamp.as_secs_f64(),
                orig_len: packet.orig_len,
                link: self.link,
                data: packet.data.into_owned(),
            })),
            Some(Err(e)) => Err(CaptureError::Device(format!(
                "{}: {}",
                self.path.display(),
                e
            ))),
            None => {
                debug!("End of {}", self.path.display());
                Err(CaptureError::Exhausted)
            }
        }
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }
}

/// Replays a fixed list of frames
pub struct SyntheticSource {
    frames: VecDeque<RawFrame>,
    /// Pause between frames
    pace: Option<Duration>,
}

impl SyntheticSource {
    pub fn new(frames: Vec<RawFrame>) -> Self {
        Self {
            frames: frames.into(),
            pace: None,
        }
    }

    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = Some(pace);
        self
    }

    /// A short TCP exchange between 192.168.1.11 and 10.0.0.1
    pub fn demo() -> Self {
        let mut frames = Vec::new();
        for i in 0..20u32 {
            let ts = 1_700_000_000.0 + f64::from(i) * 0.05;
            let data = if i % 2 == 0 {
                demo_tcp([192, 168, 1, 11], 40000, [10, 0, 0, 1], 80, 0x18, 64 + i as usize)
            } else {
                demo_tcp([10, 0, 0, 1], 80, [192, 168, 1, 11], 40000, 0x10, 512)
            };
            frames.push(RawFrame::new(ts, LinkKind::Ethernet, data));
        }
        Self::new(frames).with_pace(Duration::from_millis(10))
    }
}

impl PacketSource for SyntheticSource {
    fn next_frame(&mut self) -> Result<Option<RawFrame>, CaptureError> {
        if let Some(pace) = self.pace {
            std::thread::sleep(pace);
        }
        self.frames.pop_front().map(Some).ok_or(CaptureError::Exhausted)
    }

    fn describe(&self) -> String {
        format!("synthetic ({} frames left)", self.frames.len())
    }
}

/// Ethernet + IPv4 + TCP frame with `payload_len` zero bytes of payload
fn demo_tcp(
    src: [u8; 4],
    sport: u16,
    dst: [u8; 4],
    dport: u16,
    flags: u8,
    payload_len: usize,
) -> Vec<u8> {
    let total_len = (40 + payload_len) as u16;
    let mut pkt = vec![
        0x02, 0, 0, 0, 0, 0x02, 0x02, 0, 0, 0, 0, 0x01, 0x08, 0x00,
        0x45, 0x00,
    ];
    pkt.extend_from_slice(&total_len.to_be_bytes());
    pkt.extend_from_slice(&[0, 0, 0x40, 0x00, 64, 6, 0, 0]);
    pkt.extend_from_slice(&src);
    pkt.extend_from_slice(&dst);
    pkt.extend_from_slice(&sport.to_be_bytes());
    pkt.extend_from_slice(&dport.to_be_bytes());
    pkt.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 0, 0x50, flags, 0xfa, 0xf0, 0, 0, 0, 0]);
    pkt.resize(pkt.len() + payload_len, 0);
    pkt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parser::parse_frame;
    use pcap_file::pcap::{PcapPacket, PcapWriter};

    #[test]
    fn test_capture_config_default() {
        let config = CaptureConfig::default();
        assert_eq!(config.method, CaptureMethod::Live);
        assert!(config.allowed_sources.is_empty());
        assert_eq!(config.permission_backoff(), Duration::from_secs(2));
        assert_eq!(config.failure_backoff(), Duration::from_secs(1));
        assert_eq!(config.max_consecutive_failures, 0);
    }

    #[test]
    fn test_synthetic_source_ends() {
        let frame = RawFrame::new(0.0, LinkKind::Ethernet, vec![0; 60]);
        let mut source = SyntheticSource::new(vec![frame.clone(), frame]);

        assert!(source.next_frame().unwrap().is_some());
        assert!(source.next_frame().unwrap().is_some());
        assert!(matches!(source.next_frame(), Err(CaptureError::Exhausted)));
    }

    #[test]
    fn test_demo_frames_parse() {
        let mut source = SyntheticSource::demo();
        source.pace = None;
        let mut parsed = 0;
        while let Ok(Some(frame)) = source.next_frame() {
            assert!(parse_frame(&frame).is_some());
            parsed += 1;
        }
        assert_eq!(parsed, 20);
    }

    #[test]
    fn test_file_source_replays_pcap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.pcap");
        {
            let file = File::create(&path).unwrap();
            let mut writer = PcapWriter::new(file).unwrap();
            let data = demo_tcp([192, 168, 1, 11], 1234, [10, 0, 0, 1], 80, 0x02, 0);
            writer
                .write_packet(&PcapPacket::new(Duration::from_millis(1500), data.len() as u32, &data))
                .unwrap();
        }

        let mut source = FileSource::open(path).unwrap();
        let frame = source.next_frame().unwrap().unwrap();
        assert_eq!(frame.link, LinkKind::Ethernet);
        assert!((frame.timestamp - 1.5).abs() < 1e-9);
        assert_eq!(parse_frame(&frame).unwrap().dst_port, 80);
        assert!(matches!(source.next_frame(), Err(CaptureError::Exhausted)));
    }

    #[test]
    fn test_missing_file_is_error() {
        let config = CaptureConfig {
            method: CaptureMethod::File,
            pcap_file: Some(PathBuf::from("/nonexistent/trace.pcap")),
            ..Default::default()
        };
        assert!(open_source(&config).is_err());

        let config = CaptureConfig {
            method: CaptureMethod::File,
            ..Default::default()
        };
        assert!(matches!(open_source(&config), Err(CaptureError::Unavailable(_))));
    }
}
