//! Probe connectors for network monitoring.
//!
//! Supports ICMP, DNS, HTTP, TCP and SMTP probes. The scheduler never looks
//! inside a connector: it builds one per target through a [`ConnectorFactory`]
//! and calls [`Connector::probe`] once per cycle.

mod dns;
mod http;
mod ping;
mod tcp;

pub use dns::*;
pub use http::*;
pub use ping::*;
pub use tcp::*;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::db::{ProbeKind, Target};

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("command failed: {0}")]
    Command(String),
}

/// One protocol-specific way of probing a single endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Short description used in logs, e.g. `tcp://10.0.0.1:443`.
    fn describe(&self) -> String;

    /// Perform one probe attempt and return the round trip time.
    async fn probe(&self, timeout: Duration) -> Result<Duration, ProbeError>;
}

/// Builds connectors for targets.
pub trait ConnectorFactory: Send + Sync {
    fn build(&self, target: &Target) -> Arc<dyn Connector>;
}

/// Factory producing the real network connectors.
#[derive(Debug, Clone, Default)]
pub struct NetworkConnectorFactory;

impl ConnectorFactory for NetworkConnectorFactory {
    fn build(&self, target: &Target) -> Arc<dyn Connector> {
        let port = target.effective_port();
        match target.kind {
            ProbeKind::Icmp => Arc::new(PingConnector::new(&target.address)),
            ProbeKind::Dns => Arc::new(DnsConnector::new(&target.address, port)),
            ProbeKind::Http => Arc::new(HttpConnector::new(&target.address, port)),
            ProbeKind::Tcp => Arc::new(TcpConnector::new(&target.address, port)),
            ProbeKind::Smtp => Arc::new(SmtpConnector::new(&target.address, port)),
        }
    }
}

/// Run one probe bounded by `timeout`.
///
/// A connector that overruns, or reports a round trip at or above the
/// timeout, is treated as timed out.
pub async fn probe_within(connector: &dyn Connector, timeout: Duration) -> Result<Duration, ProbeError> {
    let rtt = match tokio::time::timeout(timeout, connector.probe(timeout)).await {
        Ok(result) => result?,
        Err(_) => return Err(ProbeError::Timeout(timeout)),
    };

    if rtt >= timeout {
        return Err(ProbeError::Timeout(timeout));
    }

    Ok(rtt)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedConnector(Duration);

    #[async_trait]
    impl Connector for FixedConnector {
        fn describe(&self) -> String {
            "fixed".to_string()
        }

        async fn probe(&self, _timeout: Duration) -> Result<Duration, ProbeError> {
            tokio::time::sleep(self.0).await;
            Ok(self.0)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_within_ok() {
        let connector = FixedConnector(Duration::from_millis(20));
        let rtt = probe_within(&connector, Duration::from_millis(100)).await.unwrap();
        assert_eq!(rtt, Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_within_overrun() {
        let connector = FixedConnector(Duration::from_secs(5));
        let result = probe_within(&connector, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(ProbeError::Timeout(_))));
    }

    #[test]
    fn test_factory_describes_endpoints() {
        let factory = NetworkConnectorFactory;
        let target = Target {
            address: "mail.example.com".to_string(),
            kind: ProbeKind::Smtp,
            ..Default::default()
        };
        assert_eq!(factory.build(&target).describe(), "smtp://mail.example.com:25");

        let target = Target {
            address: "8.8.8.8".to_string(),
            kind: ProbeKind::Dns,
            ..Default::default()
        };
        assert_eq!(factory.build(&target).describe(), "dns://8.8.8.8:53");
    }
}
