//! DNS connector using raw UDP queries.

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

use super::{Connector, ProbeError};

const DEFAULT_QUERY_NAME: &str = "example.com";

/// Queries a DNS server for an A record and times the answer.
#[derive(Debug, Clone)]
pub struct DnsConnector {
    server: String,
    port: u16,
    query_name: String,
}

impl DnsConnector {
    pub fn new(server: &str, port: u16) -> Self {
        Self {
            server: server.to_string(),
            port,
            query_name: DEFAULT_QUERY_NAME.to_string(),
        }
    }
}

#[async_trait]
impl Connector for DnsConnector {
    fn describe(&self) -> String {
        format!("dns://{}:{}", self.server, self.port)
    }

    async fn probe(&self, timeout: Duration) -> Result<Duration, ProbeError> {
        let tx_id: u16 = rand::random();
        let packet = build_dns_query(tx_id, &self.query_name)?;

        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| ProbeError::Network(format!("failed to bind socket: {}", e)))?;
        socket
            .connect((self.server.as_str(), self.port))
            .await
            .map_err(|e| ProbeError::Network(format!("failed to connect: {}", e)))?;

        let start = Instant::now();
        socket
            .send(&packet)
            .await
            .map_err(|e| ProbeError::Network(format!("failed to send: {}", e)))?;

        let mut response = [0u8; 512];
        let n = tokio::time::timeout(timeout, socket.recv(&mut response))
            .await
            .map_err(|_| ProbeError::Timeout(timeout))?
            .map_err(|e| ProbeError::Network(format!("failed to recv: {}", e)))?;
        let elapsed = start.elapsed();

        check_dns_response(&response[..n], tx_id)?;
        Ok(elapsed)
    }
}

/// Validate length, transaction id and RCODE of a response.
fn check_dns_response(response: &[u8], tx_id: u16) -> Result<(), ProbeError> {
    if response.len() < 12 {
        return Err(ProbeError::Network(format!(
            "response too short: {} bytes",
            response.len()
        )));
    }

    let resp_tx_id = u16::from_be_bytes([response[0], response[1]]);
    if resp_tx_id != tx_id {
        return Err(ProbeError::Network(format!(
            "transaction ID mismatch: got {}, expected {}",
            resp_tx_id, tx_id
        )));
    }

    let rcode = response[3] & 0x0F;
    if rcode != 0 {
        return Err(ProbeError::Network(format!("DNS error RCODE: {}", rcode)));
    }
    Ok(())
}

/// Build a recursive A/IN query for `name`.
fn build_dns_query(tx_id: u16, name: &str) -> Result<Vec<u8>, ProbeError> {
    let mut packet = Vec::with_capacity(64);
    packet.extend_from_slice(&tx_id.to_be_bytes());
    packet.extend_from_slice(&0x0100u16.to_be_bytes()); // recursion desired
    packet.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    packet.extend_from_slice(&[0u8; 6]); // AN/NS/AR counts

    for label in name.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(ProbeError::Config(format!("invalid query name: {}", name)));
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);

    packet.extend_from_slice(&1u16.to_be_bytes()); // QTYPE A
    packet.extend_from_slice(&1u16.to_be_bytes()); // QCLASS IN
    Ok(packet)
}
