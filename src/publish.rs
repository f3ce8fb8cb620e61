//! Outbound boundaries of the engine: the publisher and the state store.
//!
//! Both are shared by the probe cycle and the job queue, so implementations
//! must tolerate concurrent calls.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::db::{AlertView, DbError, ProbeRecord};
use crate::jobs::JobResult;

/// Publish error types.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("publisher channel closed")]
    Closed,
    #[error("publish failed: {0}")]
    Failed(String),
}

/// Sink for aggregated results, job output and readiness.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Full record batch, for persistence on the backend.
    async fn publish_records(&self, records: &[ProbeRecord]) -> Result<(), PublishError>;

    /// Reduced status-only batch for the alerting subsystem.
    async fn publish_alerts(&self, alerts: &[AlertView]) -> Result<(), PublishError>;

    /// Output of one job, addressed to the service that requested it.
    async fn publish_job_output(&self, service: &str, result: &JobResult) -> Result<(), PublishError>;

    async fn publish_ready(&self, ready: bool) -> Result<(), PublishError>;
}

/// Key/value blob persistence.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save_blob(&self, key: &str, blob: Vec<u8>) -> Result<(), DbError>;
    async fn load_blob(&self, key: &str) -> Result<Option<Vec<u8>>, DbError>;
}

/// A message handed to the transport.
#[derive(Debug, Clone)]
pub enum Publication {
    Records(Vec<ProbeRecord>),
    Alerts(Vec<AlertView>),
    JobOutput { service: String, result: JobResult },
    Ready(bool),
}

/// Publisher that forwards every publication onto an mpsc channel.
#[derive(Clone)]
pub struct ChannelPublisher {
    tx: mpsc::Sender<Publication>,
}

impl ChannelPublisher {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<Publication>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }

    async fn send(&self, publication: Publication) -> Result<(), PublishError> {
        self.tx.send(publication).await.map_err(|_| PublishError::Closed)
    }
}

#[async_trait]
impl Publisher for ChannelPublisher {
    async fn publish_records(&self, records: &[ProbeRecord]) -> Result<(), PublishError> {
        self.send(Publication::Records(records.to_vec())).await
    }

    async fn publish_alerts(&self, alerts: &[AlertView]) -> Result<(), PublishError> {
        self.send(Publication::Alerts(alerts.to_vec())).await
    }

    async fn publish_job_output(&self, service: &str, result: &JobResult) -> Result<(), PublishError> {
        self.send(Publication::JobOutput {
            service: service.to_string(),
            result: result.clone(),
        })
        .await
    }

    async fn publish_ready(&self, ready: bool) -> Result<(), PublishError> {
        self.send(Publication::Ready(ready)).await
    }
}

/// Drain publications and log them until every sender is gone.
pub async fn run_publication_logger(mut rx: mpsc::Receiver<Publication>) {
    while let Some(publication) = rx.recv().await {
        match publication {
            Publication::Records(records) => {
                tracing::info!("Publish: {} probe records", records.len());
            }
            Publication::Alerts(alerts) => {
                let down = alerts.iter().filter(|a| !a.is_up).count();
                tracing::info!("Publish: {} alert views ({} down)", alerts.len(), down);
            }
            Publication::JobOutput { service, result } => {
                tracing::info!(
                    "Publish: job {} output for {} ({}, {} bytes)",
                    result.message_id,
                    service,
                    result.status,
                    result.output.len()
                );
            }
            Publication::Ready(ready) => {
                tracing::debug!("Publish: processor ready = {}", ready);
            }
        }
    }
}
