//! Model types shared by the engine, the store and the control API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Protocol used to probe a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    #[default]
    Icmp,
    Dns,
    Http,
    Tcp,
    Smtp,
}

impl ProbeKind {
    /// Port used when a target does not carry one.
    pub fn default_port(self) -> u16 {
        match self {
            ProbeKind::Icmp => 0,
            ProbeKind::Dns => 53,
            ProbeKind::Http => 80,
            ProbeKind::Tcp => 80,
            ProbeKind::Smtp => 25,
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProbeKind::Icmp => "icmp",
            ProbeKind::Dns => "dns",
            ProbeKind::Http => "http",
            ProbeKind::Tcp => "tcp",
            ProbeKind::Smtp => "smtp",
        };
        f.write_str(name)
    }
}

/// A monitored endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    /// Durable id; 0 means the engine assigns one.
    #[serde(default)]
    pub id: i64,
    pub owner_id: String,
    pub address: String,
    /// 0 means the protocol default.
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub kind: ProbeKind,
    /// Per-target timeout override in milliseconds, 0 inherits the global timeout.
    #[serde(default)]
    pub timeout_ms: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Default for Target {
    fn default() -> Self {
        Self {
            id: 0,
            owner_id: String::new(),
            address: String::new(),
            port: 0,
            kind: ProbeKind::Icmp,
            timeout_ms: 0,
            enabled: true,
        }
    }
}

impl Target {
    /// Port to connect to, falling back to the protocol default.
    pub fn effective_port(&self) -> u16 {
        if self.port == 0 {
            self.kind.default_port()
        } else {
            self.port
        }
    }

    /// True when `other` points at a different endpoint than `self`.
    pub fn endpoint_differs(&self, other: &Target) -> bool {
        self.address != other.address || self.port != other.port || self.kind != other.kind
    }
}

/// Status of a single probe attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Ok,
    Timeout,
    Error,
    /// Dispatched but never reported back before the drain window closed.
    Abandoned,
}

impl ProbeStatus {
    pub fn is_success(self) -> bool {
        matches!(self, ProbeStatus::Ok)
    }
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProbeStatus::Ok => "ok",
            ProbeStatus::Timeout => "timeout",
            ProbeStatus::Error => "error",
            ProbeStatus::Abandoned => "abandoned",
        };
        f.write_str(name)
    }
}

/// Result of one probe attempt as seen by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeOutcome {
    pub target_id: i64,
    pub time: DateTime<Utc>,
    pub status: ProbeStatus,
    /// Round trip in milliseconds, present only on success.
    pub rtt_ms: Option<f64>,
    pub message: String,
}

impl ProbeOutcome {
    pub fn success(target_id: i64, time: DateTime<Utc>, rtt_ms: f64) -> Self {
        Self {
            target_id,
            time,
            status: ProbeStatus::Ok,
            rtt_ms: Some(rtt_ms),
            message: format!("reply in {:.3} ms", rtt_ms),
        }
    }

    pub fn failure(target_id: i64, time: DateTime<Utc>, status: ProbeStatus, message: String) -> Self {
        Self {
            target_id,
            time,
            status,
            rtt_ms: None,
            message,
        }
    }
}

/// One recorded probe attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeSample {
    pub id: u64,
    pub record_id: i64,
    pub time: DateTime<Utc>,
    pub status: ProbeStatus,
    pub rtt_ms: Option<f64>,
}

/// Alerting state attached to each record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertState {
    pub is_up: bool,
    pub alert_flag: bool,
    pub alert_sent: bool,
    /// Failed probes since the last alert reset.
    pub down_count: u32,
    pub event_time: Option<DateTime<Utc>>,
    pub message: String,
}

impl Default for AlertState {
    fn default() -> Self {
        Self {
            is_up: true,
            alert_flag: false,
            alert_sent: false,
            down_count: 0,
            event_time: None,
            message: String::new(),
        }
    }
}

/// Accumulated statistics and alert state for one target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeRecord {
    /// Same as the target id.
    pub id: i64,
    pub owner_id: String,
    pub address: String,
    pub port: u16,
    pub kind: ProbeKind,
    pub enabled: bool,

    pub sent: u64,
    pub received: u64,
    pub lost: u64,
    pub loss_percentage: f64,

    pub rtt_min: f64,
    pub rtt_max: f64,
    pub rtt_total: f64,
    pub rtt_avg: f64,

    pub started_at: DateTime<Utc>,
    pub timeouts: u64,
    pub samples: VecDeque<ProbeSample>,
    pub next_sample_id: u64,

    pub alert: AlertState,
    /// Set by an alert reset; the next merge zeroes `down_count` and clears it.
    pub dirty_down_count: bool,
}

impl ProbeRecord {
    /// Create an empty record describing `target`.
    pub fn new(target: &Target) -> Self {
        Self {
            id: target.id,
            owner_id: target.owner_id.clone(),
            address: target.address.clone(),
            port: target.port,
            kind: target.kind,
            enabled: target.enabled,
            sent: 0,
            received: 0,
            lost: 0,
            loss_percentage: 0.0,
            rtt_min: 0.0,
            rtt_max: 0.0,
            rtt_total: 0.0,
            rtt_avg: 0.0,
            started_at: Utc::now(),
            timeouts: 0,
            samples: VecDeque::new(),
            next_sample_id: 1,
            alert: AlertState::default(),
            dirty_down_count: false,
        }
    }

    /// Copy the descriptive fields of `target` onto this record.
    pub fn describe(&mut self, target: &Target) {
        self.owner_id = target.owner_id.clone();
        self.address = target.address.clone();
        self.port = target.port;
        self.kind = target.kind;
        self.enabled = target.enabled;
    }

    pub fn alert_view(&self) -> AlertView {
        AlertView {
            id: self.id,
            owner_id: self.owner_id.clone(),
            address: self.address.clone(),
            kind: self.kind,
            is_up: self.alert.is_up,
            alert_flag: self.alert.alert_flag,
            alert_sent: self.alert.alert_sent,
            down_count: self.alert.down_count,
            event_time: self.alert.event_time,
            message: self.alert.message.clone(),
        }
    }
}

/// Status-only projection of a record for the alerting subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertView {
    pub id: i64,
    pub owner_id: String,
    pub address: String,
    pub kind: ProbeKind,
    pub is_up: bool,
    pub alert_flag: bool,
    pub alert_sent: bool,
    pub down_count: u32,
    pub event_time: Option<DateTime<Utc>>,
    pub message: String,
}

/// Global probe parameters, persisted alongside the target set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeParams {
    /// Recent samples kept per record.
    pub max_samples: usize,
    /// Counters are zeroed once a window this long has elapsed. 0 disables rollover.
    pub stats_window_secs: u64,
    /// Raise the alert flag once `down_count` reaches this. 0 disables.
    pub alert_threshold: u32,
}

impl Default for ProbeParams {
    fn default() -> Self {
        Self {
            max_samples: 100,
            stats_window_secs: 0,
            alert_threshold: 0,
        }
    }
}

/// How `init` treats records that already exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetMode {
    /// Keep restored statistics for targets that survive.
    #[default]
    Keep,
    /// Keep records but zero their counters.
    Zero,
    /// Discard every prior record.
    Clear,
}
