//! Raw TCP and SMTP connectors.

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use super::{Connector, ProbeError};

async fn connect(address: &str, port: u16, timeout: Duration) -> Result<TcpStream, ProbeError> {
    tokio::time::timeout(timeout, TcpStream::connect((address, port)))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| ProbeError::Network(format!("connect to {}:{} failed: {}", address, port, e)))
}

/// Times a TCP handshake.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
    port: u16,
}

impl TcpConnector {
    pub fn new(address: &str, port: u16) -> Self {
        Self {
            address: address.to_string(),
            port,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    fn describe(&self) -> String {
        format!("tcp://{}:{}", self.address, self.port)
    }

    async fn probe(&self, timeout: Duration) -> Result<Duration, ProbeError> {
        let start = Instant::now();
        let _stream = connect(&self.address, self.port, timeout).await?;
        Ok(start.elapsed())
    }
}

/// Connects to a mail server and waits for its `220` greeting.
#[derive(Debug, Clone)]
pub struct SmtpConnector {
    address: String,
    port: u16,
}

impl SmtpConnector {
    pub fn new(address: &str, port: u16) -> Self {
        Self {
            address: address.to_string(),
            port,
        }
    }
}

#[async_trait]
impl Connector for SmtpConnector {
    fn describe(&self) -> String {
        format!("smtp://{}:{}", self.address, self.port)
    }

    async fn probe(&self, timeout: Duration) -> Result<Duration, ProbeError> {
        let start = Instant::now();
        let mut stream = connect(&self.address, self.port, timeout).await?;

        let remaining = timeout.saturating_sub(start.elapsed());
        let mut banner = [0u8; 512];
        let n = tokio::time::timeout(remaining, stream.read(&mut banner))
            .await
            .map_err(|_| ProbeError::Timeout(timeout))?
            .map_err(|e| ProbeError::Network(format!("failed to read greeting: {}", e)))?;

        check_smtp_greeting(&banner[..n])?;
        Ok(start.elapsed())
    }
}

fn check_smtp_greeting(banner: &[u8]) -> Result<(), ProbeError> {
    if banner.starts_with(b"220") {
        return Ok(());
    }
    let line = String::from_utf8_lossy(banner);
    Err(ProbeError::Network(format!(
        "unexpected SMTP greeting: {}",
        line.lines().next().unwrap_or("").trim()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_connect_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let connector = TcpConnector::new("127.0.0.1", port);
        let rtt = connector.probe(Duration::from_secs(2)).await.unwrap();
        assert!(rtt < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_smtp_greeting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let _ = socket.write_all(b"220 mail.test ESMTP ready\r\n").await;
            }
        });

        let connector = SmtpConnector::new("127.0.0.1", port);
        assert!(connector.probe(Duration::from_secs(2)).await.is_ok());
    }

    #[test]
    fn test_check_smtp_greeting_rejects() {
        assert!(check_smtp_greeting(b"220 ok\r\n").is_ok());
        let err = check_smtp_greeting(b"554 go away\r\n").unwrap_err();
        assert!(err.to_string().contains("554 go away"));
    }
}
