// Pulsemeter - Pulse-counting energy meter
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Thread-safe meter handle
//!
//! [`EnergyMeter`] wraps a [`TickLog`] in one coarse mutex and stamps pulses
//! with an injected [`Clock`]. The detection path ([`EnergyMeter::tick`])
//! holds the lock for a single append; the periodic driver's queries and
//! trims are serialized against it by the same lock.
//!
//! # Example
//!
//! ```rust
//! use pulsemeter::{EnergyMeter, MeterConfig};
//!
//! let meter = EnergyMeter::new(MeterConfig::default()).unwrap();
//! meter.tick();
//! meter.tick();
//!
//! let reading = meter.calculate_energy(None).unwrap();
//! assert!((reading.energy_kwh - 0.002).abs() < 1e-12);
//! assert!(reading.last_tick.is_some());
//! ```

use crate::clock::{Clock, SystemClock};
use crate::condensed::CondensedSummary;
use crate::config::MeterConfig;
use crate::error::Result;
use crate::tick_log::{EnergyReading, MeterSnapshot, TickLog};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// One meter's tick history, shareable between the tick source and the
/// periodic driver.
pub struct EnergyMeter {
    config: MeterConfig,
    clock: Arc<dyn Clock>,
    log: Mutex<TickLog>,
}

impl EnergyMeter {
    /// Create a meter stamped by the system clock
    pub fn new(config: MeterConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a meter with an injected clock
    ///
    /// # Errors
    ///
    /// Returns [`crate::MeterError::Config`] if any configuration value is
    /// out of range.
    pub fn with_clock(config: MeterConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let log = TickLog::new(&config)?;
        log::info!(
            "Energy meter ready: {} ticks/kWh, power window {:?}, min {} ticks",
            config.ticks_per_kwh,
            config.power_time_window,
            config.min_power_ticks
        );
        Ok(Self {
            config,
            clock,
            log: Mutex::new(log),
        })
    }

    fn lock(&self) -> MutexGuard<'_, TickLog> {
        // TickLog never panics mid-mutation, a poisoned log is still valid
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record one pulse at the current time
    pub fn tick(&self) {
        let mut log = self.lock();
        // Stamped under the lock so insertion order matches time order
        let now = self.clock.now();
        log.push(now);
        log::trace!("tick({})", now);
    }

    /// Record one pulse stamped by the caller
    pub fn tick_at(&self, at: DateTime<Utc>) {
        self.lock().push(at);
        log::trace!("tick({})", at);
    }

    /// Energy since `since` (exclusive), the latest power estimate, and the
    /// last matched tick. See [`TickLog::calculate_energy`].
    pub fn calculate_energy(&self, since: Option<DateTime<Utc>>) -> Result<EnergyReading> {
        Ok(self.lock().calculate_energy(since)?)
    }

    /// Discard history before `before`. Energy at or before `before` that was
    /// never reported is lost.
    pub fn clear(&self, before: DateTime<Utc>) -> Result<()> {
        Ok(self.lock().clear(before)?)
    }

    /// Fold raw ticks at or before `until` into the condensed summary.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ContractError::NothingToCondense`] when no raw tick
    /// qualifies; check [`EnergyMeter::ticks_until`] first.
    pub fn condense(&self, until: DateTime<Utc>) -> Result<u64> {
        Ok(self.lock().condense(until)?)
    }

    /// Raw ticks at or before `until`
    pub fn ticks_until(&self, until: DateTime<Utc>) -> usize {
        self.lock().ticks_until(until)
    }

    pub fn condensed(&self) -> Option<CondensedSummary> {
        self.lock().condensed()
    }

    pub fn snapshot(&self) -> MeterSnapshot {
        self.lock().snapshot()
    }

    pub fn config(&self) -> &MeterConfig {
        &self.config
    }

    /// Current time according to the meter's clock
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

impl fmt::Debug for EnergyMeter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnergyMeter")
            .field("config", &self.config)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::{ContractError, MeterError};
    use approx::assert_relative_eq;
    use chrono::TimeZone;
    use std::thread;
    use std::time::Duration;

    fn manual_meter() -> (EnergyMeter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap(),
        ));
        let config = MeterConfig::new(1000.0, Duration::from_secs(10), 2);
        let meter = EnergyMeter::with_clock(config, clock.clone()).unwrap();
        (meter, clock)
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let result = EnergyMeter::new(MeterConfig::with_ticks_per_kwh(-1.0));
        assert!(matches!(result, Err(MeterError::Config(_))));
    }

    #[test]
    fn test_tick_uses_clock() {
        let (meter, clock) = manual_meter();
        meter.tick();
        clock.advance_millis(1000);
        meter.tick();

        let snapshot = meter.snapshot();
        assert_eq!(snapshot.raw_ticks, 2);
        assert_eq!(snapshot.last_tick, Some(clock.now()));
    }

    #[test]
    fn test_calculate_energy_through_handle() {
        let (meter, clock) = manual_meter();
        for _ in 0..3 {
            meter.tick();
            clock.advance_millis(1000);
        }
        let reading = meter.calculate_energy(None).unwrap();
        assert_relative_eq!(reading.energy_kwh, 0.003);
        assert_relative_eq!(reading.power_kw.unwrap(), 3.6, epsilon = 1e-9);
    }

    #[test]
    fn test_condense_error_is_contract_violation() {
        let (meter, clock) = manual_meter();
        let err = meter.condense(clock.now()).unwrap_err();
        assert!(matches!(
            err,
            MeterError::Contract(ContractError::NothingToCondense { .. })
        ));
    }

    #[test]
    fn test_concurrent_ticks_are_all_counted() {
        let meter = Arc::new(EnergyMeter::new(MeterConfig::default()).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let meter = meter.clone();
                thread::spawn(move || {
                    for _ in 0..250 {
                        meter.tick();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let reading = meter.calculate_energy(None).unwrap();
        assert_relative_eq!(reading.energy_kwh, 1.0, epsilon = 1e-9);
    }
}
