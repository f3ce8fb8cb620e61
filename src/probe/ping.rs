//! ICMP echo connector with native sockets and a `ping` command fallback.
//!
//! Native probes run on blocking sockets inside `spawn_blocking` so the
//! round trip is measured without runtime scheduling noise.

use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::{Connector, ProbeError};

#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    Native,
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

fn next_echo_id() -> (u16, u16) {
    let identifier: u16 = rand::random();
    let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    (identifier, sequence)
}

fn detect_icmp_capability() -> IcmpCapability {
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping connector: using native ICMP (RAW socket)");
        return IcmpCapability::Native;
    }

    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping connector: using native ICMP (DGRAM socket)");
        return IcmpCapability::Native;
    }

    tracing::info!("Ping connector: native ICMP unavailable, using command fallback");
    IcmpCapability::CommandOnly
}

/// ICMP echo probe for one host.
#[derive(Debug, Clone)]
pub struct PingConnector {
    address: String,
}

impl PingConnector {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
        }
    }
}

#[async_trait]
impl Connector for PingConnector {
    fn describe(&self) -> String {
        format!("icmp://{}", self.address)
    }

    async fn probe(&self, timeout: Duration) -> Result<Duration, ProbeError> {
        let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);
        if capability == IcmpCapability::CommandOnly {
            return run_ping_command(&self.address, timeout).await;
        }

        let ip = resolve_address(&self.address).await?;
        let result = tokio::task::spawn_blocking(move || echo_blocking(ip, timeout))
            .await
            .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?;

        match result {
            Err(ProbeError::Network(msg)) if msg.contains("Permission denied") => {
                tracing::warn!(
                    "Native ping to {} not permitted, falling back to command: {}",
                    self.address,
                    msg
                );
                run_ping_command(&self.address, timeout).await
            }
            other => other,
        }
    }
}

async fn resolve_address(address: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    tokio::net::lookup_host(format!("{}:0", address))
        .await
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed: {}", e)))?
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Network(format!("No addresses found for {}", address)))
}

fn echo_blocking(ip: IpAddr, timeout: Duration) -> Result<Duration, ProbeError> {
    let (domain, protocol, request_type, reply_type) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4, 8u8, 0u8),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6, 128u8, 129u8),
    };

    let socket = Socket::new(domain, Type::RAW, Some(protocol))
        .or_else(|_| Socket::new(domain, Type::DGRAM, Some(protocol)))
        .map_err(|e| ProbeError::Network(format!("Failed to create ICMP socket: {}", e)))?;

    socket
        .set_read_timeout(Some(timeout))
        .and_then(|_| socket.set_write_timeout(Some(timeout)))
        .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;
    socket
        .connect(&SocketAddr::new(ip, 0).into())
        .map_err(|e| ProbeError::Network(format!("Failed to connect: {}", e)))?;

    let (identifier, sequence) = next_echo_id();
    let packet = build_echo_request(request_type, identifier, sequence, ip.is_ipv4());

    let start = Instant::now();
    socket.send(&packet).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            ProbeError::Network(format!("Permission denied: {}", e))
        } else {
            ProbeError::Network(format!("Failed to send: {}", e))
        }
    })?;

    let mut buf = [0u8; 1500];
    loop {
        let len = (&socket).read(&mut buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => ProbeError::Timeout(timeout),
            _ => ProbeError::Network(format!("Failed to receive: {}", e)),
        })?;
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }

        if is_echo_reply(&buf[..len], reply_type, identifier, sequence) {
            return Ok(elapsed);
        }
    }
}

/// Match an echo reply, skipping an IPv4 header when a RAW socket hands one back.
fn is_echo_reply(buf: &[u8], reply_type: u8, identifier: u16, sequence: u16) -> bool {
    if buf.len() < 8 {
        return false;
    }
    let offset = if reply_type == 0 && buf[0] >> 4 == 4 {
        usize::from(buf[0] & 0x0F) * 4
    } else {
        0
    };
    if buf.len() < offset + 8 {
        return false;
    }
    let icmp = &buf[offset..];
    icmp[0] == reply_type
        && u16::from_be_bytes([icmp[4], icmp[5]]) == identifier
        && u16::from_be_bytes([icmp[6], icmp[7]]) == sequence
}

fn build_echo_request(request_type: u8, identifier: u16, sequence: u16, with_checksum: bool) -> Vec<u8> {
    let mut packet = vec![0u8; 64];
    packet[0] = request_type;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let stamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    packet[8..16].copy_from_slice(&stamp.to_be_bytes());

    // The kernel fills in the ICMPv6 checksum.
    if with_checksum {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }
    packet
}

/// RFC 1071 checksum.
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]) as u32,
            [hi] => (*hi as u32) << 8,
            _ => 0,
        })
        .sum();

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !sum as u16
}

async fn run_ping_command(address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let timeout_secs = timeout.as_secs().max(1);

    let output = Command::new("ping")
        .args(["-c", "1", "-W", &timeout_secs.to_string(), address])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("timeout") || stdout.contains("100% packet loss") || stdout.contains("100.0% packet loss") {
            return Err(ProbeError::Timeout(timeout));
        }
        return Err(ProbeError::Command(format!("ping failed: {}", stdout.trim())));
    }

    parse_ping_output(&stdout)
}

/// Extract the round trip from `ping` output (Linux and macOS formats).
fn parse_ping_output(output: &str) -> Result<Duration, ProbeError> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            r"time[=<](?P<ms>[0-9.]+)\s*ms",
            r"round-trip\s+min/avg/max/stddev\s*=\s*[0-9.]+/(?P<ms>[0-9.]+)/",
            r"rtt\s+min/avg/max/mdev\s*=\s*[0-9.]+/(?P<ms>[0-9.]+)/",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    });

    patterns
        .iter()
        .filter_map(|re| re.captures(output))
        .filter_map(|caps| caps.name("ms")?.as_str().parse::<f64>().ok())
        .next()
        .map(|ms| Duration::from_secs_f64(ms / 1000.0))
        .ok_or_else(|| ProbeError::Command(format!("failed to parse ping output: {}", output)))
}
