//! HTTP connector.

use async_trait::async_trait;
use std::time::{Duration, Instant};

use super::{Connector, ProbeError};

/// Fetches a URL and times the full transfer.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    url: String,
}

impl HttpConnector {
    pub fn new(address: &str, port: u16) -> Self {
        Self {
            url: build_url(address, port),
        }
    }
}

fn build_url(address: &str, port: u16) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        return address.to_string();
    }
    match port {
        0 | 80 => format!("http://{}", address),
        443 => format!("https://{}", address),
        other => format!("http://{}:{}", address, other),
    }
}

#[async_trait]
impl Connector for HttpConnector {
    fn describe(&self) -> String {
        self.url.clone()
    }

    async fn probe(&self, timeout: Duration) -> Result<Duration, ProbeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProbeError::Config(e.to_string()))?;

        let start = Instant::now();
        let response = client.get(&self.url).send().await.map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout(timeout)
            } else {
                ProbeError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(ProbeError::Network(format!("server error: {}", status)));
        }

        response
            .bytes()
            .await
            .map_err(|e| ProbeError::Network(e.to_string()))?;

        Ok(start.elapsed())
    }
}
