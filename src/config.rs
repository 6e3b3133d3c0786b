use chrono_tz::Tz;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::route::ProgressSettings;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Vehicle plate used to look up the active route assignment
    pub plate: String,
    /// Hardware identifier of this device. Compared against the identifier the
    /// backend assigned to the route; a mismatch puts the session in view-only mode.
    pub hardware_id: String,
    /// IANA time zone the routes operate in
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub route: RouteConfig,
    #[serde(default)]
    pub fleet: FleetConfig,
    #[serde(default)]
    pub connectivity: ConnectivityConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Dispatch backend, e.g. `https://villa.velsat.pe:8443/api/Datero`
    pub base_url: String,
    /// Fleet position backend, e.g. `https://velsat.pe:8585/api/Datero`
    pub fleet_base_url: String,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://villa.velsat.pe:8443/api/Datero".to_string(),
            fleet_base_url: "https://velsat.pe:8585/api/Datero".to_string(),
            request_timeout_secs: 15,
            connect_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub max_retries: u32,
    /// Delay before the next drain when offline or when records remain queued
    pub retry_interval_secs: u64,
    /// Periodic forced drain and stats publication
    pub stats_interval_secs: u64,
    /// Upper bound for a single delivery attempt
    pub attempt_timeout_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_interval_secs: 30,
            stats_interval_secs: 60,
            attempt_timeout_secs: 10,
        }
    }
}

impl DeliveryConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    pub geofence_radius_m: f64,
    /// Dwell limit for an active intermediate reference point. Once exceeded
    /// without entering its geofence the point is skipped. `None` disables it.
    pub intermediate_timeout_secs: Option<u64>,
    /// Refresh period of the active waypoint's display duration
    pub tick_interval_ms: u64,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            geofence_radius_m: 25.0,
            intermediate_timeout_secs: Some(600),
            tick_interval_ms: 1000,
        }
    }
}

impl RouteConfig {
    pub fn progress_settings(&self) -> ProgressSettings {
        ProgressSettings {
            geofence_radius_m: self.geofence_radius_m,
            intermediate_timeout: self
                .intermediate_timeout_secs
                .map(|secs| chrono::Duration::seconds(secs as i64)),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub enabled: bool,
    pub refresh_interval_secs: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            refresh_interval_secs: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    pub probe_interval_secs: u64,
    pub probe_timeout_secs: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: 10,
            probe_timeout_secs: 5,
        }
    }
}

fn default_timezone() -> String {
    "America/Lima".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parsed operating time zone
    pub fn tz(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| ConfigError::InvalidTimezone(self.timezone.clone()))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.tz()?;

        if self.plate.trim().is_empty() {
            return Err(ConfigError::Invalid("plate must not be empty".to_string()));
        }
        if self.delivery.max_retries == 0 {
            return Err(ConfigError::Invalid(
                "delivery.max_retries must be at least 1".to_string(),
            ));
        }
        if self.route.geofence_radius_m <= 0.0 {
            return Err(ConfigError::Invalid(
                "route.geofence_radius_m must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),
    #[error("Failed to parse config: {0}")]
    ParseError(String),
    #[error("Unknown time zone: {0}")]
    InvalidTimezone(String),
    #[error("Invalid config: {0}")]
    Invalid(String),
}
