//! Runtime configuration.
//!
//! Defaults cover a source on the local machine. A JSON file can override any
//! subset of fields; the binary applies CLI flags on top of that.

use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::engine::EngineConfig;
use crate::error::ConfigError;
use crate::stream::{PlaybackPath, ProbeSettings, RestartPolicy};
use crate::timestamp::Zone;
use crate::window::DEFAULT_MAX_POINTS;

/// Live feed settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Playlist URL; defaults to `<base_url>/hls/stream.m3u8`
    pub url: Option<String>,
    pub playback: PlaybackPath,
    pub restart_delay_secs: f64,
    /// 1.0 keeps the restart delay fixed
    pub restart_multiplier: f64,
    pub max_restart_delay_secs: f64,
    pub max_media_recoveries: u32,
    pub probe_interval_secs: f64,
    pub failure_threshold: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            url: None,
            playback: PlaybackPath::Decoder,
            restart_delay_secs: 3.0,
            restart_multiplier: 1.0,
            max_restart_delay_secs: 30.0,
            max_media_recoveries: 3,
            probe_interval_secs: 2.0,
            failure_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    /// Telemetry source root, e.g. `http://raspberrypi.local:5000`
    pub base_url: String,
    pub poll_interval_secs: f64,
    pub max_points: usize,
    /// Sensor whose timestamp advances the sync watermark
    pub primary_sensor: String,
    /// Ids rendered as single tiles instead of chart traces
    pub reserved: Vec<String>,
    pub history_spacing_secs: f64,
    /// `local`, `utc` or a fixed offset such as `+02:00`
    pub time_zone: String,
    pub request_timeout_secs: f64,
    pub dashboard_port: u16,
    pub stream: StreamConfig,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        DashboardConfig {
            base_url: "http://127.0.0.1:5000".to_string(),
            poll_interval_secs: 10.0,
            max_points: DEFAULT_MAX_POINTS,
            primary_sensor: "Shelly".to_string(),
            reserved: vec!["Shelly".to_string(), "Pi".to_string()],
            history_spacing_secs: 5.0,
            time_zone: "local".to_string(),
            request_timeout_secs: 5.0,
            dashboard_port: 8080,
            stream: StreamConfig::default(),
        }
    }
}

impl DashboardConfig {
    /// Read and validate a JSON config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: DashboardConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "base_url must be an http(s) URL, got '{}'",
                self.base_url
            )));
        }
        if self.max_points == 0 {
            return Err(ConfigError::Invalid("max_points must be at least 1".into()));
        }
        if self.primary_sensor.is_empty() {
            return Err(ConfigError::Invalid("primary_sensor is empty".into()));
        }

        let durations = [
            ("poll_interval_secs", self.poll_interval_secs),
            ("request_timeout_secs", self.request_timeout_secs),
            ("stream.restart_delay_secs", self.stream.restart_delay_secs),
            ("stream.max_restart_delay_secs", self.stream.max_restart_delay_secs),
            ("stream.probe_interval_secs", self.stream.probe_interval_secs),
        ];
        for (name, value) in durations {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }
        if !self.history_spacing_secs.is_finite() || self.history_spacing_secs < 0.0 {
            return Err(ConfigError::Invalid(
                "history_spacing_secs must not be negative".into(),
            ));
        }
        if !self.stream.restart_multiplier.is_finite() || self.stream.restart_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "stream.restart_multiplier must be >= 1.0".into(),
            ));
        }

        self.zone()?;
        Ok(())
    }

    pub fn zone(&self) -> Result<Zone, ConfigError> {
        match self.time_zone.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Zone::Local),
            "utc" | "z" => Ok(Zone::utc()),
            other => other
                .parse::<FixedOffset>()
                .map(Zone::Fixed)
                .map_err(|_| ConfigError::Invalid(format!("unknown time zone '{}'", self.time_zone))),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            poll_interval: secs(self.poll_interval_secs),
            max_points: self.max_points,
            primary_sensor: self.primary_sensor.clone(),
            reserved: self.reserved.clone(),
            history_spacing: secs(self.history_spacing_secs),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        secs(self.request_timeout_secs)
    }

    pub fn stream_url(&self) -> String {
        match &self.stream.url {
            Some(url) => url.clone(),
            None => format!("{}/hls/stream.m3u8", self.base_url.trim_end_matches('/')),
        }
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            base_delay: secs(self.stream.restart_delay_secs),
            multiplier: self.stream.restart_multiplier,
            max_delay: secs(self.stream.max_restart_delay_secs),
        }
    }

    pub fn probe_settings(&self) -> ProbeSettings {
        ProbeSettings {
            poll_interval: secs(self.stream.probe_interval_secs),
            failure_threshold: self.stream.failure_threshold,
            timeout: self.request_timeout(),
        }
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}
