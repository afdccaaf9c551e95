// Pulsemeter - Pulse-counting energy meter
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Append-only tick history with bounded memory
//!
//! [`TickLog`] is the single-threaded core behind [`crate::EnergyMeter`]. It
//! keeps raw pulse timestamps in arrival order, folds old ones into a
//! [`CondensedSummary`], and answers energy and power queries over both.
//!
//! Invariants:
//! - raw ticks are appended at the tail and only ever removed from the head;
//! - every raw tick is strictly later than the summary's `end`;
//! - a pulse is counted either as a raw tick or in the summary, never both.

use crate::condensed::CondensedSummary;
use crate::config::MeterConfig;
use crate::error::{ConfigError, ContractError};
use crate::power::PowerEstimator;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

/// Result of an energy query
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EnergyReading {
    /// Energy matched by the query, in kWh
    pub energy_kwh: f64,
    /// Instantaneous power in kW, `None` when there is not enough recent data
    pub power_kw: Option<f64>,
    /// Latest raw tick matched by the query
    pub last_tick: Option<DateTime<Utc>>,
}

impl EnergyReading {
    /// A reading with nothing new to report
    pub fn empty() -> Self {
        Self {
            energy_kwh: 0.0,
            power_kw: None,
            last_tick: None,
        }
    }
}

/// Point-in-time view of the log's bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MeterSnapshot {
    /// Raw ticks currently held
    pub raw_ticks: usize,
    /// Pulses folded into the summary
    pub condensed_ticks: u64,
    pub condensed_start: Option<DateTime<Utc>>,
    pub condensed_end: Option<DateTime<Utc>>,
    /// Boundary of the most recent `clear`
    pub last_reset: Option<DateTime<Utc>>,
    pub first_tick: Option<DateTime<Utc>>,
    pub last_tick: Option<DateTime<Utc>>,
}

/// Raw tick timestamps plus the condensed summary of older ones
#[derive(Debug, Clone)]
pub struct TickLog {
    ticks: VecDeque<DateTime<Utc>>,
    kwh_per_tick: f64,
    estimator: PowerEstimator,
    condensed: Option<CondensedSummary>,
    last_reset: Option<DateTime<Utc>>,
}

impl TickLog {
    /// Create an empty log, rejecting an invalid configuration
    pub fn new(config: &MeterConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            ticks: VecDeque::new(),
            kwh_per_tick: config.kwh_per_tick(),
            estimator: PowerEstimator::new(config)?,
            condensed: None,
            last_reset: None,
        })
    }

    /// Append a pulse. Callers supply non-decreasing timestamps.
    pub fn push(&mut self, at: DateTime<Utc>) {
        self.ticks.push_back(at);
    }

    /// Energy strictly after `since` (everything when `None`), the power
    /// estimate at the latest matched tick, and that tick.
    ///
    /// Returns [`EnergyReading::empty`] when no raw tick matches, whatever
    /// the summary holds. Pure read: nothing is mutated.
    pub fn calculate_energy(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<EnergyReading, ContractError> {
        let first_matched = match since {
            Some(since) => self.ticks.partition_point(|t| *t <= since),
            None => 0,
        };
        let matched = (self.ticks.len() - first_matched) as u64;
        let last_tick = match self.ticks.back() {
            Some(last) if matched > 0 => *last,
            _ => return Ok(EnergyReading::empty()),
        };

        let condensed = match (self.condensed, since) {
            (None, _) => 0,
            (Some(summary), None) => summary.ticks,
            (Some(summary), Some(since)) => summary.ticks_in_range(since, summary.end)?,
        };

        let total = matched + condensed;
        let reading = EnergyReading {
            energy_kwh: total as f64 * self.kwh_per_tick,
            power_kw: self.estimator.estimate(&self.ticks, last_tick),
            last_tick: Some(last_tick),
        };
        log::debug!(
            "calculate_energy(since={:?}): {} raw + {} condensed ticks, power={:?}",
            since,
            matched,
            condensed,
            reading.power_kw
        );
        Ok(reading)
    }

    /// Drop raw ticks strictly before `before` and shrink the summary by the
    /// pulses estimated to lie before it. Sets `last_reset = before`.
    pub fn clear(&mut self, before: DateTime<Utc>) -> Result<(), ContractError> {
        let removed = self.ticks.partition_point(|t| *t < before);
        self.ticks.drain(..removed);

        if let Some(summary) = self.condensed {
            self.condensed = summary.trim_before(before)?;
        }
        self.last_reset = Some(before);

        log::debug!(
            "clear(before={}): dropped {} raw ticks, {} kept, {} condensed",
            before,
            removed,
            self.ticks.len(),
            self.condensed_ticks()
        );
        Ok(())
    }

    /// Fold every raw tick at or before `until` into the summary.
    ///
    /// Returns the number of folded ticks. Fails with
    /// [`ContractError::NothingToCondense`] if there are none.
    pub fn condense(&mut self, until: DateTime<Utc>) -> Result<u64, ContractError> {
        let count = self.ticks_until(until);
        let (first, last) = match (self.ticks.front(), count.checked_sub(1)) {
            (Some(first), Some(last_index)) => (*first, self.ticks[last_index]),
            _ => return Err(ContractError::NothingToCondense { until }),
        };

        self.condensed = Some(CondensedSummary::absorb(
            self.condensed,
            count as u64,
            first,
            last,
        ));
        self.ticks.drain(..count);

        log::debug!(
            "condense(until={}): folded {} ticks, {} condensed, {} raw left",
            until,
            count,
            self.condensed_ticks(),
            self.ticks.len()
        );
        Ok(count as u64)
    }

    /// Number of raw ticks at or before `until`
    pub fn ticks_until(&self, until: DateTime<Utc>) -> usize {
        self.ticks.partition_point(|t| *t <= until)
    }

    /// Number of raw ticks held
    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    /// Pulses folded into the summary
    pub fn condensed_ticks(&self) -> u64 {
        self.condensed.map_or(0, |c| c.ticks)
    }

    /// The condensed summary, if anything was folded
    pub fn condensed(&self) -> Option<CondensedSummary> {
        self.condensed
    }

    /// Boundary of the most recent `clear`
    pub fn last_reset(&self) -> Option<DateTime<Utc>> {
        self.last_reset
    }

    pub fn snapshot(&self) -> MeterSnapshot {
        MeterSnapshot {
            raw_ticks: self.ticks.len(),
            condensed_ticks: self.condensed_ticks(),
            condensed_start: self.condensed.map(|c| c.start),
            condensed_end: self.condensed.map(|c| c.end),
            last_reset: self.last_reset,
            first_tick: self.ticks.front().copied(),
            last_tick: self.ticks.back().copied(),
        }
    }
}
