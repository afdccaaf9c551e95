// Pulsemeter - Pulse-counting energy meter
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Error types for Pulsemeter
//!
//! This module defines all error types used throughout the library. An
//! unknown power reading is not an error: it is reported as `None` by
//! [`crate::EnergyMeter::calculate_energy`].

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type alias for meter operations
pub type Result<T> = std::result::Result<T, MeterError>;

/// Main error type for meter operations
#[derive(Error, Debug)]
pub enum MeterError {
    /// Configuration rejected at construction time
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// A caller broke an operation's precondition
    #[error("Contract violation: {0}")]
    Contract(#[from] ContractError),

    /// A telemetry sink failed to publish
    #[error("Publisher {publisher} failed: {reason}")]
    Publish { publisher: String, reason: String },

    /// A tick source could not be started or stopped
    #[error("Tick source error: {0}")]
    Source(String),

    /// I/O error (thread spawn, GPIO value file, JSON sink)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MeterError {
    /// Build a publish error for the named publisher
    pub fn publish(publisher: impl Into<String>, reason: impl ToString) -> Self {
        Self::Publish {
            publisher: publisher.into(),
            reason: reason.to_string(),
        }
    }

    /// True for programming-contract violations
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Self::Contract(_))
    }
}

/// Errors in the three meter configuration values
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// `ticks_per_kwh` must be a finite value above zero
    #[error("ticks_per_kwh must be > 0, got {0}")]
    TicksPerKwh(f64),

    /// The power window must be non-zero and representable as a time delta
    #[error("power_time_window must be > 0 and fit in a time delta")]
    PowerTimeWindow,

    /// At least one tick is needed for a power estimate
    #[error("min_power_ticks must be >= 1, got {0}")]
    MinPowerTicks(usize),
}

/// Programming-contract violations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ContractError {
    /// `condense` was called with no raw tick at or before `until`
    #[error("No ticks at or before {until} to condense")]
    NothingToCondense { until: DateTime<Utc> },

    /// The range-overlap rule reached a combination it cannot handle
    #[error(
        "Query range [{start}, {end}] overlaps condensed range \
         [{condensed_start}, {condensed_end}] in an unsupported way"
    )]
    OverlapInvariant {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        condensed_start: DateTime<Utc>,
        condensed_end: DateTime<Utc>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_error_display() {
        let err = MeterError::Config(ConfigError::TicksPerKwh(-1.0));
        let msg = format!("{}", err);
        assert!(msg.contains("ticks_per_kwh"));
        assert!(msg.contains("-1"));
    }

    #[test]
    fn test_error_conversion() {
        let until = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let err: MeterError = ContractError::NothingToCondense { until }.into();
        assert!(err.is_contract_violation());
        assert!(format!("{}", err).contains("2024-01-01"));
    }

    #[test]
    fn test_publish_error() {
        let err = MeterError::publish("json", "broken pipe");
        assert!(!err.is_contract_violation());
        assert_eq!(format!("{}", err), "Publisher json failed: broken pipe");
    }
}
