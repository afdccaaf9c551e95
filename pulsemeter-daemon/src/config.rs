// Pulsemeter Daemon - Configuration file handling
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Daemon configuration.
//!
//! The configuration is a JSON document. Every field is optional; missing
//! fields take the defaults below, so `{}` is a valid file.

use pulsemeter::source::{Edge, EmulatorConfig, GpioConfig};
use pulsemeter::{DriverConfig, MeterConfig, MeterError, ResetPolicy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors that stop the daemon from starting.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Meter error: {0}")]
    Meter(#[from] MeterError),

    #[error("Config file error: {0}")]
    ConfigFile(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Daemon configuration as read from the JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Meter identifier used in published reports
    pub meter_id: String,
    /// Human readable device name
    pub device_name: String,
    /// Entity identifier, defaults to `<meter_id>_<gpio_pin>`
    pub entity_id: Option<String>,
    /// Pulses per kWh
    pub ticks_per_kwh: f64,
    /// BCM pin number of the pulse input
    pub gpio_pin: u32,
    /// Which transition counts as a pulse
    pub gpio_edge: Edge,
    /// Minimum spacing between pulses, in milliseconds
    pub gpio_debounce_ms: u64,
    /// Seconds between reports
    pub send_interval_secs: u64,
    /// Lookback of the power estimate, in seconds
    pub power_time_window_secs: u64,
    /// Minimum pulses inside the window before power is reported
    pub min_power_ticks: usize,
    /// History policy after each report
    pub reset_policy: ResetPolicy,
    /// Power range walked by the emulator, in kW
    pub emulator_power_range_kw: (f64, f64),
    /// HTTP port for /metrics, /health and /status
    pub listen_port: u16,
    /// Write every report as a JSON line on stdout
    pub json_output: bool,
    /// Publish reports and Home Assistant discovery over MQTT
    pub mqtt_enabled: bool,
    pub mqtt_server: String,
    pub mqtt_port: u16,
    /// Broker user, empty for anonymous access
    pub mqtt_user: String,
    pub mqtt_password: String,
    /// Home Assistant discovery topic prefix
    pub mqtt_discovery_prefix: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            meter_id: "smartmeter".to_string(),
            device_name: "Energy Meter".to_string(),
            entity_id: None,
            ticks_per_kwh: 1000.0,
            gpio_pin: 14,
            gpio_edge: Edge::Falling,
            gpio_debounce_ms: 18,
            send_interval_secs: 300,
            power_time_window_secs: 30,
            min_power_ticks: 2,
            reset_policy: ResetPolicy::Clear,
            emulator_power_range_kw: (1.0, 5.0),
            listen_port: 9184,
            json_output: false,
            mqtt_enabled: true,
            mqtt_server: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_password: String::new(),
            mqtt_discovery_prefix: "homeassistant".to_string(),
        }
    }
}

impl DaemonConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, DaemonError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Parse and validate a JSON document.
    pub fn from_json(contents: &str) -> Result<Self, DaemonError> {
        let config: Self = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the meter or the report loop cannot run with.
    pub fn validate(&self) -> Result<(), DaemonError> {
        self.meter_config().validate().map_err(MeterError::from)?;

        if self.send_interval_secs == 0 {
            return Err(DaemonError::Invalid(
                "send_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.power_time_window_secs > self.send_interval_secs {
            return Err(DaemonError::Invalid(format!(
                "power_time_window_secs ({}) exceeds send_interval_secs ({})",
                self.power_time_window_secs, self.send_interval_secs
            )));
        }
        let (min, max) = self.emulator_power_range_kw;
        if !(min > 0.0 && min <= max) {
            return Err(DaemonError::Invalid(format!(
                "emulator_power_range_kw ({}, {}) is not a positive range",
                min, max
            )));
        }
        if self.mqtt_enabled && self.mqtt_server.trim().is_empty() {
            return Err(DaemonError::Invalid(
                "mqtt_server is empty while MQTT is enabled".to_string(),
            ));
        }
        Ok(())
    }

    pub fn entity_id(&self) -> String {
        self.entity_id
            .clone()
            .unwrap_or_else(|| format!("{}_{}", self.meter_id, self.gpio_pin))
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_secs(self.send_interval_secs)
    }

    pub fn meter_config(&self) -> MeterConfig {
        MeterConfig::new(
            self.ticks_per_kwh,
            Duration::from_secs(self.power_time_window_secs),
            self.min_power_ticks,
        )
    }

    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig::with_policy(self.reset_policy)
    }

    pub fn gpio_config(&self) -> GpioConfig {
        GpioConfig {
            edge: self.gpio_edge,
            debounce: Duration::from_millis(self.gpio_debounce_ms),
            ..GpioConfig::new(self.gpio_pin)
        }
    }

    pub fn emulator_config(&self) -> EmulatorConfig {
        EmulatorConfig::new(self.ticks_per_kwh, self.emulator_power_range_kw)
    }
}
