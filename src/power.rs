// Pulsemeter - Pulse-counting energy meter
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Sliding-window instantaneous power estimate.

use crate::condensed::seconds;
use crate::config::MeterConfig;
use crate::error::ConfigError;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::VecDeque;

/// Estimates power from the spacing of the most recent raw ticks.
#[derive(Debug, Clone)]
pub struct PowerEstimator {
    window: TimeDelta,
    min_ticks: usize,
    kwh_per_tick: f64,
}

impl PowerEstimator {
    pub fn new(config: &MeterConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            window: config.power_window_delta()?,
            min_ticks: config.min_power_ticks,
            kwh_per_tick: config.kwh_per_tick(),
        })
    }

    /// Power in kW over the ticks in `(last_tick - window, last_tick]`.
    ///
    /// `ticks` must be in chronological order and end at `last_tick`.
    /// Returns `None` when fewer than `min_power_ticks` ticks are in the
    /// window or when they all share one timestamp.
    pub fn estimate(
        &self,
        ticks: &VecDeque<DateTime<Utc>>,
        last_tick: DateTime<Utc>,
    ) -> Option<f64> {
        let window_start = last_tick - self.window;
        let first_index = ticks.partition_point(|t| *t <= window_start);
        let count = ticks.len() - first_index;
        if count < self.min_ticks {
            return None;
        }

        let first = *ticks.get(first_index)?;
        let elapsed = seconds(last_tick - first);
        if elapsed <= 0.0 {
            return None;
        }

        // n ticks bound n - 1 intervals
        let energy_kwh = (count - 1) as f64 * self.kwh_per_tick;
        Some(energy_kwh / elapsed * 3600.0)
    }

    /// Power window length
    pub fn window(&self) -> TimeDelta {
        self.window
    }
}
