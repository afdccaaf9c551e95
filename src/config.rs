// Pulsemeter - Pulse-counting energy meter
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Configuration types for the meter and the report driver

use crate::error::ConfigError;
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Meter configuration, fixed for the lifetime of an [`crate::EnergyMeter`]
#[derive(Debug, Clone, PartialEq)]
pub struct MeterConfig {
    /// Pulses per kWh (energy per pulse = 1 / ticks_per_kwh kWh)
    pub ticks_per_kwh: f64,

    /// Lookback for the instantaneous power estimate
    pub power_time_window: Duration,

    /// Minimum ticks inside the power window before power is reported
    pub min_power_ticks: usize,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            ticks_per_kwh: 1000.0,
            power_time_window: Duration::from_secs(30),
            min_power_ticks: 2,
        }
    }
}

impl MeterConfig {
    /// Create a configuration with every value given explicitly
    pub fn new(ticks_per_kwh: f64, power_time_window: Duration, min_power_ticks: usize) -> Self {
        Self {
            ticks_per_kwh,
            power_time_window,
            min_power_ticks,
        }
    }

    /// Create a configuration with a specific pulse rate
    pub fn with_ticks_per_kwh(ticks_per_kwh: f64) -> Self {
        Self {
            ticks_per_kwh,
            ..Default::default()
        }
    }

    /// Create a configuration with a specific power window
    pub fn with_power_time_window(power_time_window: Duration) -> Self {
        Self {
            power_time_window,
            ..Default::default()
        }
    }

    /// Check every value, returning the first one that is out of range
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.ticks_per_kwh.is_finite() && self.ticks_per_kwh > 0.0) {
            return Err(ConfigError::TicksPerKwh(self.ticks_per_kwh));
        }
        if self.power_time_window.is_zero() || TimeDelta::from_std(self.power_time_window).is_err()
        {
            return Err(ConfigError::PowerTimeWindow);
        }
        if self.min_power_ticks < 1 {
            return Err(ConfigError::MinPowerTicks(self.min_power_ticks));
        }
        Ok(())
    }

    /// Energy represented by a single pulse, in kWh
    pub fn kwh_per_tick(&self) -> f64 {
        1.0 / self.ticks_per_kwh
    }

    /// The power window as a chrono delta
    pub(crate) fn power_window_delta(&self) -> Result<TimeDelta, ConfigError> {
        TimeDelta::from_std(self.power_time_window).map_err(|_| ConfigError::PowerTimeWindow)
    }
}

/// What the report driver does with history once a report went out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetPolicy {
    /// Report energy since the previous report, then discard old raw ticks
    #[default]
    Clear,
    /// Report the running total, then fold old raw ticks into the summary
    Condense,
}

impl std::str::FromStr for ResetPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "clear" => Ok(Self::Clear),
            "condense" => Ok(Self::Condense),
            other => Err(format!("unknown reset policy: {}", other)),
        }
    }
}

/// Report driver configuration
#[derive(Debug, Clone, PartialEq)]
pub struct DriverConfig {
    /// How history is trimmed after a successful report
    pub reset_policy: ResetPolicy,

    /// Raw history kept behind the last reported tick.
    /// `None` keeps one power window so the next estimate still has data.
    pub retained_history: Option<Duration>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            reset_policy: ResetPolicy::Clear,
            retained_history: None,
        }
    }
}

impl DriverConfig {
    /// Create a configuration with a specific reset policy
    pub fn with_policy(reset_policy: ResetPolicy) -> Self {
        Self {
            reset_policy,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meter_config_default() {
        let config = MeterConfig::default();
        assert_eq!(config.ticks_per_kwh, 1000.0);
        assert_eq!(config.power_time_window, Duration::from_secs(30));
        assert_eq!(config.min_power_ticks, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_meter_config_rejects_bad_rate() {
        assert_eq!(
            MeterConfig::with_ticks_per_kwh(0.0).validate(),
            Err(ConfigError::TicksPerKwh(0.0))
        );
        assert_eq!(
            MeterConfig::with_ticks_per_kwh(-5.0).validate(),
            Err(ConfigError::TicksPerKwh(-5.0))
        );
        assert!(MeterConfig::with_ticks_per_kwh(f64::NAN).validate().is_err());
    }

    #[test]
    fn test_meter_config_rejects_zero_window() {
        let config = MeterConfig::with_power_time_window(Duration::ZERO);
        assert_eq!(config.validate(), Err(ConfigError::PowerTimeWindow));
    }

    #[test]
    fn test_meter_config_rejects_zero_min_ticks() {
        let config = MeterConfig {
            min_power_ticks: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::MinPowerTicks(0)));
    }

    #[test]
    fn test_kwh_per_tick() {
        let config = MeterConfig::with_ticks_per_kwh(800.0);
        assert_eq!(config.kwh_per_tick(), 0.00125);
    }

    #[test]
    fn test_reset_policy_from_str() {
        assert_eq!("clear".parse::<ResetPolicy>(), Ok(ResetPolicy::Clear));
        assert_eq!("Condense".parse::<ResetPolicy>(), Ok(ResetPolicy::Condense));
        assert!("purge".parse::<ResetPolicy>().is_err());
    }

    #[test]
    fn test_driver_config_default() {
        let config = DriverConfig::default();
        assert_eq!(config.reset_policy, ResetPolicy::Clear);
        assert!(config.retained_history.is_none());
    }
}
