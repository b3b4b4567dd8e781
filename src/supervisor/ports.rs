//! Port release
//!
//! After the stages are gone, any process still listening on one of the
//! pipeline's ports is killed so the next start can bind. Linux only; other
//! platforms skip the sweep.

use serde::Serialize;

/// A listener that was killed to free a port
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleasedPort {
    pub port: u16,
    pub pid: u32,
}

/// Parse `/proc/net/tcp{,6}` content into `(port, inode)` pairs for sockets in
/// the LISTEN state
pub fn parse_listeners(content: &str) -> Vec<(u16, u64)> {
    const TCP_LISTEN: &str = "0A";

    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 || fields[3] != TCP_LISTEN {
                return None;
            }
            let port_hex = fields[1].rsplit(':').next()?;
            let port = u16::from_str_radix(port_hex, 16).ok()?;
            let inode = fields[9].parse::<u64>().ok()?;
            Some((port, inode))
        })
        .collect()
}

#[cfg(target_os = "linux")]
pub fn release_ports(ports: &[u16]) -> Vec<ReleasedPort> {
    use std::collections::HashMap;
    use std::fs;

    use sysinfo::{Pid, System};
    use tracing::{debug, info, warn};

    if ports.is_empty() {
        return Vec::new();
    }

    let mut inodes: HashMap<u64, u16> = HashMap::new();
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        match fs::read_to_string(table) {
            Ok(content) => {
                for (port, inode) in parse_listeners(&content) {
                    if ports.contains(&port) && inode != 0 {
                        inodes.insert(inode, port);
                    }
                }
            }
            Err(e) => debug!("Cannot read {}: {}", table, e),
        }
    }
    if inodes.is_empty() {
        return Vec::new();
    }

    let own_pid = std::process::id();
    let mut owners: Vec<ReleasedPort> = Vec::new();
    let Ok(entries) = fs::read_dir("/proc") else {
        return Vec::new();
    };
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        if pid == own_pid {
            continue;
        }
        let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        for fd in fds.flatten() {
            let Ok(target) = fs::read_link(fd.path()) else {
                continue;
            };
            let Some(inode) = socket_inode(&target.to_string_lossy()) else {
                continue;
            };
            if let Some(port) = inodes.get(&inode) {
                if !owners.iter().any(|o| o.pid == pid && o.port == *port) {
                    owners.push(ReleasedPort { port: *port, pid });
                }
            }
        }
    }

    if owners.is_empty() {
        return owners;
    }

    let mut sys = System::new();
    sys.refresh_processes();
    owners.retain(|owner| match sys.process(Pid::from_u32(owner.pid)) {
        Some(process) => {
            info!("Releasing port {} held by PID {} ({})", owner.port, owner.pid, process.name());
            process.kill()
        }
        None => false,
    });
    if owners.is_empty() {
        warn!("Ports {:?} are held but no listener could be killed", ports);
    }
    owners
}

#[cfg(not(target_os = "linux"))]
pub fn release_ports(_ports: &[u16]) -> Vec<ReleasedPort> {
    Vec::new()
}

/// Extract the inode from a `socket:[12345]` fd link
fn socket_inode(link: &str) -> Option<u64> {
    link.strip_prefix("socket:[")?.strip_suffix(']')?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:223D 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 41234 1 0000000000000000 100 0 0 10 0
   1: 0100007F:1F41 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 41235 1 0000000000000000 100 0 0 10 0
   2: 0100007F:223D 0100007F:D431 01 00000000:00000000 00:00000000 00000000  1000        0 41236 1 0000000000000000 20 4 30 10 -1
";

    #[test]
    fn test_parse_listeners() {
        let listeners = parse_listeners(SAMPLE);
        assert_eq!(listeners, vec![(8765, 41234), (8001, 41235)]);
    }

    #[test]
    fn test_parse_ipv6_line() {
        let content = "header\n   0: 00000000000000000000000001000000:1F40 00000000000000000000000000000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 5555 1 0 100 0 0 10 0\n";
        assert_eq!(parse_listeners(content), vec![(8000, 5555)]);
    }

    #[test]
    fn test_socket_inode() {
        assert_eq!(socket_inode("socket:[41234]"), Some(41234));
        assert_eq!(socket_inode("pipe:[1]"), None);
        assert_eq!(socket_inode("/dev/null"), None);
    }

    #[test]
    fn test_release_nothing() {
        assert!(release_ports(&[]).is_empty());
    }
}
