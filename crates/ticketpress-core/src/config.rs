// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Engine configuration. Every field has a default so a partial JSON file (or
// none at all) yields a working setup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TicketpressError};
use crate::types::{Capabilities, ConnectionParams, PrintSettings, PrinterProfile};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "TICKETPRESS_CONFIG";

/// Backoff for failed print attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts (including the first) before a job fails.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 600_000,
        }
    }
}

/// Backoff for re-establishing a dropped printer link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (0-based), capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ms = self
            .base_delay_ms
            .saturating_mul(1u64 << attempt.min(20))
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

/// A printer declared in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterConfig {
    pub id: String,
    pub name: String,
    pub connection: ConnectionParams,
    #[serde(default)]
    pub capabilities: Option<Capabilities>,
    #[serde(default)]
    pub settings: Option<PrintSettings>,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

impl PrinterConfig {
    /// Build a profile, filling unspecified parts with transport defaults.
    pub fn to_profile(&self) -> PrinterProfile {
        let mut profile = PrinterProfile::new(&self.id, &self.name, self.connection.clone());
        if let Some(caps) = &self.capabilities {
            profile.capabilities = caps.clone();
        }
        if let Some(settings) = &self.settings {
            profile.settings = settings.clone();
        }
        profile.is_default = self.is_default;
        profile.auto_reconnect = self.auto_reconnect;
        profile.active = self.active;
        profile
    }
}

/// Top-level engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// SQLite file holding jobs and printer profiles.
    pub database_path: PathBuf,
    pub retry: RetryPolicy,
    pub reconnect: ReconnectPolicy,
    /// Manual retry of a failed job starts a fresh attempt cycle.
    pub reset_attempts_on_manual_retry: bool,
    pub max_copies: u32,
    pub connect_timeout_ms: u64,
    /// How long to wait for a real-time status reply before reporting unknown.
    pub status_timeout_ms: u64,
    pub monitor_interval_secs: u64,
    /// Suggested wait for auto-recoverable faults found by the monitor.
    pub monitor_retry_delay_secs: u64,
    pub printers: Vec<PrinterConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("ticketpress.db"),
            retry: RetryPolicy::default(),
            reconnect: ReconnectPolicy::default(),
            reset_attempts_on_manual_retry: true,
            max_copies: 10,
            connect_timeout_ms: 5_000,
            status_timeout_ms: 500,
            monitor_interval_secs: 30,
            monitor_retry_delay_secs: 15,
            printers: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Read a JSON configuration file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        let config: Self = serde_json::from_str(&data)
            .map_err(|e| TicketpressError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(TicketpressError::Config(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.max_copies == 0 {
            return Err(TicketpressError::Config("max_copies must be at least 1".into()));
        }
        let defaults = self.printers.iter().filter(|p| p.is_default).count();
        if defaults > 1 {
            return Err(TicketpressError::Config(format!(
                "{defaults} printers are marked default, at most one may be"
            )));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn monitor_retry_delay(&self) -> Duration {
        Duration::from_secs(self.monitor_retry_delay_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "retry": { "max_attempts": 5 } }"#).expect("parse");
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 1_000);
        assert!(config.reset_attempts_on_manual_retry);
    }

    #[test]
    fn printer_entries_parse_with_transport_tag() {
        let config: EngineConfig = serde_json::from_str(
            r#"{ "printers": [
                { "id": "gate-1", "name": "Gate 1",
                  "connection": { "kind": "network", "host": "10.0.0.20" },
                  "is_default": true }
            ] }"#,
        )
        .expect("parse");
        let profile = config.printers[0].to_profile();
        assert_eq!(
            profile.connection,
            ConnectionParams::Network {
                host: "10.0.0.20".into(),
                port: 9100
            }
        );
        assert!(profile.is_default);
        assert!(profile.auto_reconnect);
    }

    #[test]
    fn two_defaults_rejected() {
        let mut config = EngineConfig::default();
        for id in ["a", "b"] {
            config.printers.push(PrinterConfig {
                id: id.into(),
                name: id.into(),
                connection: ConnectionParams::Usb {
                    device_path: "/dev/usb/lp0".into(),
                },
                capabilities: None,
                settings: None,
                is_default: true,
                auto_reconnect: true,
                active: true,
            });
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = EngineConfig::load("/nonexistent/ticketpress.json").expect("defaults");
        assert_eq!(config.max_copies, 10);
    }

    #[test]
    fn reconnect_delay_is_capped() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(500));
        assert_eq!(policy.delay(1), Duration::from_millis(1_000));
        assert_eq!(policy.delay(12), Duration::from_millis(30_000));
    }
}
