//! Relay and agent configuration.
//!
//! Read once at process start from a TOML file, then overridden by `.env`
//! and environment variables. A missing file means defaults.

use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ReconnectPolicy;
use crate::queue::board::{clamp_displayed, DEFAULT_MAX_DISPLAYED, MAX_DISPLAYED_LIMIT};
use crate::queue::{DoctorId, PartitionFilter};
use crate::sync::protocol::Role;

pub const DEFAULT_CONFIG_FILE: &str = "queue-relay.toml";

static IPV4: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{1,3})\.(\d{1,3})\.(\d{1,3})\.(\d{1,3})$").expect("valid regex")
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Hub address agents connect to, `host:port` with optional `ws://`
    pub server_url: String,

    /// Hub listen address
    pub bind: String,
    pub port: u16,

    /// 1 or 2; restricts relayed and displayed lanes
    pub doctor_count: Option<u8>,

    pub max_patients_displayed: usize,

    pub auto_reconnect: bool,
    pub reconnect_interval_ms: u64,
    pub max_reconnect_interval_ms: u64,
    pub reconnect_multiplier: f64,
    pub max_reconnect_attempts: Option<u32>,
    pub reconnect_cooldown_ms: u64,

    /// Surface this agent runs in
    pub role: Role,
    pub doctor_id: DoctorId,

    pub data_dir: PathBuf,

    /// Directory of surface HTML the hub serves alongside the socket
    pub static_dir: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            server_url: "127.0.0.1:8080".to_string(),
            bind: "0.0.0.0".to_string(),
            port: 8080,
            doctor_count: None,
            max_patients_displayed: DEFAULT_MAX_DISPLAYED,
            auto_reconnect: true,
            reconnect_interval_ms: 2000,
            max_reconnect_interval_ms: 30_000,
            reconnect_multiplier: 1.5,
            max_reconnect_attempts: Some(10),
            reconnect_cooldown_ms: 60_000,
            role: Role::Receptionist,
            doctor_id: DoctorId::primary(),
            data_dir: PathBuf::from(".queue-relay"),
            static_dir: None,
        }
    }
}

impl RelayConfig {
    /// Load from `path`, falling back to defaults when the file is absent,
    /// then apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            toml::from_str(&text)
                .with_context(|| format!("invalid config file {}", path.display()))?
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Self::default()
        };

        dotenvy::dotenv().ok();
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `PORT`, `QUEUE_SERVER_URL`, `DOCTOR_COUNT` and
    /// `MAX_PATIENTS_DISPLAYED` overrides.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(port) = lookup("PORT") {
            self.port = port
                .trim()
                .parse()
                .with_context(|| format!("invalid PORT '{port}'"))?;
        }
        if let Some(url) = lookup("QUEUE_SERVER_URL") {
            self.server_url = url.trim().to_string();
        }
        if let Some(count) = lookup("DOCTOR_COUNT") {
            self.doctor_count = Some(
                count
                    .trim()
                    .parse()
                    .with_context(|| format!("invalid DOCTOR_COUNT '{count}'"))?,
            );
        }
        if let Some(max) = lookup("MAX_PATIENTS_DISPLAYED") {
            self.max_patients_displayed = match max.trim().parse() {
                Ok(n) if (1..=MAX_DISPLAYED_LIMIT).contains(&n) => n,
                _ => {
                    tracing::warn!(value = %max, "invalid MAX_PATIENTS_DISPLAYED, using default");
                    DEFAULT_MAX_DISPLAYED
                }
            };
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        validate_server_url(&self.server_url)?;
        if self.reconnect_interval_ms < 1000 {
            bail!("config: reconnect_interval_ms must be >= 1000");
        }
        if self.max_reconnect_interval_ms < self.reconnect_interval_ms {
            bail!("config: max_reconnect_interval_ms must be >= reconnect_interval_ms");
        }
        if !(self.reconnect_multiplier >= 1.0) {
            bail!("config: reconnect_multiplier must be >= 1.0");
        }
        if let Some(count) = self.doctor_count {
            if !(1..=2).contains(&count) {
                bail!("config: doctor_count must be 1 or 2");
            }
        }
        Ok(())
    }

    /// Validate and write as TOML, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self).context("failed to encode config")?;
        std::fs::write(path, text)
            .with_context(|| format!("failed to write config {}", path.display()))?;
        tracing::info!(path = %path.display(), "configuration saved");
        Ok(())
    }

    pub fn reset(path: &Path) -> Result<Self> {
        let config = Self::default();
        config.save(path)?;
        Ok(config)
    }

    pub fn websocket_url(&self) -> String {
        websocket_url(&self.server_url)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(self.reconnect_interval_ms),
            backoff_multiplier: self.reconnect_multiplier,
            max_delay: Duration::from_millis(self.max_reconnect_interval_ms),
            max_attempts: self.max_reconnect_attempts,
            cooldown: Duration::from_millis(self.reconnect_cooldown_ms),
        }
    }

    pub fn partition_filter(&self) -> PartitionFilter {
        PartitionFilter::for_doctor_count(self.doctor_count)
    }

    /// Lanes a board shows, in order.
    pub fn lanes(&self) -> Vec<DoctorId> {
        DoctorId::roster(self.doctor_count.unwrap_or(2))
    }

    pub fn max_displayed(&self) -> usize {
        clamp_displayed(self.max_patients_displayed)
    }
}

fn strip_scheme(url: &str) -> &str {
    ["ws://", "wss://", "http://", "https://"]
        .iter()
        .find_map(|scheme| url.strip_prefix(scheme))
        .unwrap_or(url)
}

/// `host:port` (scheme optional); port 1..=65535; dotted IPv4 octets <= 255.
pub fn validate_server_url(url: &str) -> Result<()> {
    let url = url.trim();
    if url.is_empty() {
        bail!("Server URL is required");
    }
    let authority = strip_scheme(url).split('/').next().unwrap_or_default();
    let Some((host, port)) = authority.rsplit_once(':') else {
        bail!("Server URL must include port (e.g., 192.168.1.11:8080)");
    };
    if host.trim().is_empty() {
        bail!("Invalid host in server URL");
    }
    match port.parse::<u16>() {
        Ok(p) if p >= 1 => {}
        _ => bail!("Server URL port must be a number between 1 and 65535"),
    }
    if let Some(caps) = IPV4.captures(host) {
        for octet in caps.iter().skip(1).flatten() {
            if octet.as_str().parse::<u16>().map_or(true, |n| n > 255) {
                bail!("Invalid IP address in server URL");
            }
        }
    }
    Ok(())
}

/// Normalise to a `ws://` URL; `ws://` and `wss://` inputs pass through.
pub fn websocket_url(server_url: &str) -> String {
    let url = server_url.trim();
    if url.starts_with("ws://") || url.starts_with("wss://") {
        url.to_string()
    } else {
        format!("ws://{}", strip_scheme(url))
    }
}
