//! Configuration module for fleetprobe.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::jobs::JobSettings;
use crate::scheduler::CycleConfig;

/// Processor configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// HTTP port for the control API (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "fleetprobe.db")
    pub db_path: String,
    /// Time between cycle starts in milliseconds (default: 60000)
    pub cycle_interval_ms: u64,
    /// Global probe timeout in milliseconds (default: 2000)
    pub probe_timeout_ms: u64,
    /// Scheduling buffer subtracted from the pacing window (default: 500)
    pub max_buffer_ms: u64,
    /// Job worker slots (default: 5)
    pub job_workers: usize,
    /// Job loop poll interval in milliseconds (default: 250)
    pub job_poll_ms: u64,
    /// Line cap for unpaginated job output (default: 1000)
    pub max_output_lines: usize,
    /// Programs `exec` jobs may run (default: none, exec disabled)
    pub exec_allow: Vec<String>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "fleetprobe.db".to_string(),
            cycle_interval_ms: 60_000,
            probe_timeout_ms: 2_000,
            max_buffer_ms: 500,
            job_workers: 5,
            job_poll_ms: 250,
            max_output_lines: 1000,
            exec_allow: Vec::new(),
        }
    }
}

fn parse_var<T: FromStr>(name: &str, target: &mut T) {
    if let Ok(raw) = env::var(name) {
        match raw.parse() {
            Ok(value) => *target = value,
            Err(_) => tracing::warn!("Ignoring invalid {}={:?}", name, raw),
        }
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

impl ProcessorConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `FLEETPROBE_HTTP_PORT`: HTTP port (default: 8080)
    /// - `FLEETPROBE_DB_PATH`: Database file path (default: "fleetprobe.db")
    /// - `FLEETPROBE_CYCLE_INTERVAL_MS`: Cycle interval (default: 60000)
    /// - `FLEETPROBE_PROBE_TIMEOUT_MS`: Global probe timeout (default: 2000)
    /// - `FLEETPROBE_MAX_BUFFER_MS`: Scheduling buffer (default: 500)
    /// - `FLEETPROBE_JOB_WORKERS`: Job worker slots (default: 5)
    /// - `FLEETPROBE_JOB_POLL_MS`: Job loop poll interval (default: 250)
    /// - `FLEETPROBE_MAX_OUTPUT_LINES`: Unpaginated output cap (default: 1000)
    /// - `FLEETPROBE_EXEC_ALLOW`: Comma-separated program names for exec jobs (default: none)
    pub fn load() -> Self {
        let mut cfg = Self::default();

        parse_var("FLEETPROBE_HTTP_PORT", &mut cfg.http_port);
        if let Ok(db_path) = env::var("FLEETPROBE_DB_PATH") {
            cfg.db_path = db_path;
        }
        parse_var("FLEETPROBE_CYCLE_INTERVAL_MS", &mut cfg.cycle_interval_ms);
        parse_var("FLEETPROBE_PROBE_TIMEOUT_MS", &mut cfg.probe_timeout_ms);
        parse_var("FLEETPROBE_MAX_BUFFER_MS", &mut cfg.max_buffer_ms);
        parse_var("FLEETPROBE_JOB_WORKERS", &mut cfg.job_workers);
        parse_var("FLEETPROBE_JOB_POLL_MS", &mut cfg.job_poll_ms);
        parse_var("FLEETPROBE_MAX_OUTPUT_LINES", &mut cfg.max_output_lines);
        if let Ok(raw) = env::var("FLEETPROBE_EXEC_ALLOW") {
            cfg.exec_allow = parse_list(&raw);
        }

        cfg
    }

    /// Timing for cycles driven by the built-in cadence.
    pub fn cycle_config(&self) -> CycleConfig {
        CycleConfig {
            next_run_interval_ms: self.cycle_interval_ms,
            global_timeout_ms: self.probe_timeout_ms,
            max_buffer_ms: self.max_buffer_ms,
            persist: true,
        }
    }

    pub fn job_settings(&self) -> JobSettings {
        JobSettings {
            workers: self.job_workers.max(1),
            poll_interval: Duration::from_millis(self.job_poll_ms.max(1)),
            max_output_lines: self.max_output_lines,
        }
    }
}
