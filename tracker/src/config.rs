use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Invalid port override: {0}")]
    InvalidPortOverride(String),

    #[error("Color palette cannot be empty")]
    EmptyPalette,

    #[error("{0} must be greater than 0")]
    Zero(&'static str),
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }

    fn public() -> Self {
        Listener {
            host: "0.0.0.0".into(),
            port: 3000,
        }
    }

    fn admin() -> Self {
        Listener {
            host: "127.0.0.1".into(),
            port: 3001,
        }
    }
}

/// What happens to device state when a mobile producer disconnects.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectPolicy {
    /// Any producer disconnect wipes every device, route and backup timer.
    #[default]
    FlushAll,
    /// Only devices last reported by the disconnecting producer are removed.
    OwnDevices,
    /// Devices are kept; the producer's devices are checked for liveness later and
    /// switched to the offline backup cadence if they stay silent.
    Retain,
}

/// Limits and cadences of the device tracker. All durations are milliseconds.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrackingConfig {
    pub max_positions: usize,
    /// Gap between consecutive samples above which the later one starts a new segment.
    pub segment_gap_ms: u64,
    pub max_backup_logs: usize,
    pub normal_backup_interval_ms: u64,
    pub offline_backup_interval_ms: u64,
    /// Delay after a producer disconnect before its devices are checked for silence.
    pub offline_check_delay_ms: u64,
    /// Silence after which a new position restarts the normal backup cadence.
    pub offline_return_ms: u64,
    pub sweep_interval_ms: u64,
    /// Frames queued per connection before further frames to it are dropped.
    pub outbox_capacity: usize,
    pub palette: Vec<String>,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        TrackingConfig {
            max_positions: 100,
            segment_gap_ms: 30_000,
            max_backup_logs: 50,
            normal_backup_interval_ms: 600_000,
            offline_backup_interval_ms: 300_000,
            offline_check_delay_ms: 120_000,
            offline_return_ms: 900_000,
            sweep_interval_ms: 1_000,
            outbox_capacity: 64,
            palette: [
                "red", "blue", "green", "purple", "orange", "yellow", "pink", "cyan",
            ]
            .map(String::from)
            .to_vec(),
        }
    }
}

impl TrackingConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.palette.is_empty() {
            return Err(ValidationError::EmptyPalette);
        }

        let non_zero = [
            ("max_positions", self.max_positions as u64),
            ("max_backup_logs", self.max_backup_logs as u64),
            ("normal_backup_interval_ms", self.normal_backup_interval_ms),
            ("offline_backup_interval_ms", self.offline_backup_interval_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
            ("outbox_capacity", self.outbox_capacity as u64),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(ValidationError::Zero(name));
            }
        }

        Ok(())
    }
}

/// Tracker configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Websocket and HTTP listener for producers and dashboards
    #[serde(default = "Listener::public")]
    pub listener: Listener,
    /// Listener for the health and readiness probes
    #[serde(default = "Listener::admin")]
    pub admin_listener: Listener,
    #[serde(default)]
    pub disconnect_policy: DisconnectPolicy,
    #[serde(default)]
    pub tracking: TrackingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listener: Listener::public(),
            admin_listener: Listener::admin(),
            disconnect_policy: DisconnectPolicy::default(),
            tracking: TrackingConfig::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;
        self.tracking.validate()
    }

    /// Applies a port taken from the environment (`PORT`) to the public listener.
    pub fn override_port(&mut self, raw: &str) -> Result<(), ValidationError> {
        self.listener.port = raw
            .trim()
            .parse()
            .map_err(|_| ValidationError::InvalidPortOverride(raw.to_string()))?;
        self.listener.validate()
    }
}
