// Pulsemeter - Pulse-counting energy meter
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Periodic report driver
//!
//! The [`ReportDriver`] is what an external scheduler calls once per report
//! period. Each call reads the meter, publishes to every sink, and only then
//! advances the meter's history:
//!
//! - a failed publish leaves the history untouched, so the next report
//!   covers the unreported energy again;
//! - a report with no new pulse (no `last_tick`) advances nothing;
//! - whether a power estimate was available does not matter.
//!
//! # Example
//!
//! ```rust
//! use pulsemeter::{DriverConfig, EnergyMeter, MemoryPublisher, MeterConfig, ReportDriver};
//! use std::sync::Arc;
//!
//! let meter = Arc::new(EnergyMeter::new(MeterConfig::default()).unwrap());
//! let sink = MemoryPublisher::new();
//! let mut driver = ReportDriver::new(meter.clone(), DriverConfig::default());
//! driver.add_publisher(Box::new(sink.clone()));
//!
//! meter.tick();
//! let outcome = driver.report().unwrap();
//! assert!(outcome.advanced);
//! assert_eq!(sink.published().len(), 1);
//! ```

use crate::config::{DriverConfig, ResetPolicy};
use crate::error::{MeterError, Result};
use crate::meter::EnergyMeter;
use crate::publish::{Publisher, Telemetry};
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;

/// Result of one [`ReportDriver::report`] call
#[derive(Debug)]
pub struct ReportOutcome {
    /// What was sent
    pub telemetry: Telemetry,
    /// Publishers that accepted the report
    pub published: usize,
    /// Failures, one per publisher that rejected the report
    pub failures: Vec<MeterError>,
    /// Whether the meter's history was cleared or condensed
    pub advanced: bool,
}

impl ReportOutcome {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Reads, publishes and trims one meter on a fixed cadence
pub struct ReportDriver {
    meter: Arc<EnergyMeter>,
    publishers: Vec<Box<dyn Publisher>>,
    policy: ResetPolicy,
    retained: TimeDelta,
    /// Boundary of the next incremental report
    last_sent: DateTime<Utc>,
    started: DateTime<Utc>,
    reports: u64,
}

impl ReportDriver {
    /// Create a driver starting its first period now
    pub fn new(meter: Arc<EnergyMeter>, config: DriverConfig) -> Self {
        let retained = config
            .retained_history
            .unwrap_or(meter.config().power_time_window);
        // An out-of-range retention keeps nothing rather than everything
        let retained = TimeDelta::from_std(retained).unwrap_or_else(|_| TimeDelta::zero());
        let started = meter.now();
        Self {
            meter,
            publishers: Vec::new(),
            policy: config.reset_policy,
            retained,
            last_sent: started,
            started,
            reports: 0,
        }
    }

    /// Create a driver with its publishers
    pub fn with_publishers(
        meter: Arc<EnergyMeter>,
        config: DriverConfig,
        publishers: Vec<Box<dyn Publisher>>,
    ) -> Self {
        let mut driver = Self::new(meter, config);
        driver.publishers = publishers;
        driver
    }

    pub fn add_publisher(&mut self, publisher: Box<dyn Publisher>) {
        self.publishers.push(publisher);
    }

    pub fn publisher_count(&self) -> usize {
        self.publishers.len()
    }

    /// Boundary the next incremental report starts after
    pub fn last_sent(&self) -> DateTime<Utc> {
        self.last_sent
    }

    /// Number of `report` calls so far
    pub fn reports(&self) -> u64 {
        self.reports
    }

    pub fn meter(&self) -> &Arc<EnergyMeter> {
        &self.meter
    }

    /// Run one report period.
    ///
    /// Publisher failures are collected in the outcome, not returned as an
    /// error. An `Err` means the meter itself rejected an operation.
    pub fn report(&mut self) -> Result<ReportOutcome> {
        self.reports += 1;
        let (reading, last_reset) = match self.policy {
            ResetPolicy::Clear => (
                self.meter.calculate_energy(Some(self.last_sent))?,
                self.last_sent,
            ),
            ResetPolicy::Condense => (self.meter.calculate_energy(None)?, self.started),
        };
        let telemetry = Telemetry {
            energy_kwh: reading.energy_kwh,
            power_kw: reading.power_kw,
            last_reset: Some(last_reset),
            last_tick: reading.last_tick,
        };

        let mut published = 0;
        let mut failures = Vec::new();
        for publisher in &mut self.publishers {
            match publisher.publish(&telemetry) {
                Ok(()) => published += 1,
                Err(e) => {
                    log::error!("Error publishing to {}: {}", publisher.name(), e);
                    failures.push(e);
                }
            }
        }

        let advanced = match reading.last_tick {
            Some(_) if !failures.is_empty() => {
                log::warn!(
                    "{} publisher(s) failed, keeping history for the next report",
                    failures.len()
                );
                false
            }
            Some(last_tick) => self.advance(last_tick)?,
            None => false,
        };

        Ok(ReportOutcome {
            telemetry,
            published,
            failures,
            advanced,
        })
    }

    fn advance(&mut self, last_tick: DateTime<Utc>) -> Result<bool> {
        let boundary = last_tick - self.retained;
        match self.policy {
            ResetPolicy::Clear => {
                self.meter.clear(boundary)?;
                self.last_sent = last_tick;
                Ok(true)
            }
            ResetPolicy::Condense => {
                // The latest tick stays raw, or the running total reads as empty
                let boundary = boundary.min(last_tick - TimeDelta::nanoseconds(1));
                if self.meter.ticks_until(boundary) == 0 {
                    return Ok(false);
                }
                self.meter.condense(boundary)?;
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::MeterConfig;
    use crate::publish::MemoryPublisher;
    use approx::assert_relative_eq;
    use chrono::TimeZone;
    use std::time::Duration;

    fn setup(policy: ResetPolicy) -> (Arc<EnergyMeter>, Arc<ManualClock>, ReportDriver, MemoryPublisher) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
        ));
        let config = MeterConfig::new(1000.0, Duration::from_secs(10), 2);
        let meter = Arc::new(EnergyMeter::with_clock(config, clock.clone()).unwrap());
        let sink = MemoryPublisher::new();
        let driver = ReportDriver::with_publishers(
            meter.clone(),
            DriverConfig::with_policy(policy),
            vec![Box::new(sink.clone())],
        );
        (meter, clock, driver, sink)
    }

    fn tick_every_second(meter: &EnergyMeter, clock: &ManualClock, n: usize) {
        for _ in 0..n {
            clock.advance_millis(1000);
            meter.tick();
        }
    }

    #[test]
    fn test_report_without_ticks() {
        let (_, _, mut driver, sink) = setup(ResetPolicy::Clear);
        let outcome = driver.report().unwrap();
        assert!(!outcome.advanced);
        assert_eq!(outcome.published, 1);
        assert_eq!(outcome.telemetry.energy_kwh, 0.0);
        assert!(outcome.telemetry.power_kw.is_none());
        assert_eq!(sink.published().len(), 1);
    }

    #[test]
    fn test_clear_policy_reports_increments() {
        let (meter, clock, mut driver, _) = setup(ResetPolicy::Clear);

        tick_every_second(&meter, &clock, 5);
        let first = driver.report().unwrap();
        assert!(first.advanced);
        assert_relative_eq!(first.telemetry.energy_kwh, 0.005);
        assert_eq!(driver.last_sent(), first.telemetry.last_tick.unwrap());

        tick_every_second(&meter, &clock, 3);
        let second = driver.report().unwrap();
        assert_relative_eq!(second.telemetry.energy_kwh, 0.003);
        assert_eq!(second.telemetry.last_reset, first.telemetry.last_tick);
    }

    #[test]
    fn test_clear_policy_keeps_power_window() {
        let (meter, clock, mut driver, _) = setup(ResetPolicy::Clear);
        tick_every_second(&meter, &clock, 30);
        driver.report().unwrap();

        // Ticks in (last_tick - 10 s, last_tick] survive; the one exactly
        // 10 s back is at the clear boundary and survives too.
        assert_eq!(meter.snapshot().raw_ticks, 11);
    }

    #[test]
    fn test_failed_publish_does_not_advance() {
        let (meter, clock, mut driver, sink) = setup(ResetPolicy::Clear);
        tick_every_second(&meter, &clock, 4);

        sink.set_failing(true);
        let failed = driver.report().unwrap();
        assert!(!failed.is_success());
        assert!(!failed.advanced);

        tick_every_second(&meter, &clock, 2);
        sink.set_failing(false);
        let retried = driver.report().unwrap();
        assert!(retried.is_success());
        // Nothing was lost while the sink was down
        assert_relative_eq!(retried.telemetry.energy_kwh, 0.006);
    }

    #[test]
    fn test_condense_policy_reports_running_total() {
        let (meter, clock, mut driver, _) = setup(ResetPolicy::Condense);

        tick_every_second(&meter, &clock, 30);
        let first = driver.report().unwrap();
        assert!(first.advanced);
        assert_relative_eq!(first.telemetry.energy_kwh, 0.030);
        assert_eq!(meter.condensed().unwrap().ticks, 20);

        tick_every_second(&meter, &clock, 5);
        let second = driver.report().unwrap();
        assert_relative_eq!(second.telemetry.energy_kwh, 0.035);
        assert!(second.telemetry.power_kw.is_some());
    }

    #[test]
    fn test_condense_policy_skips_when_nothing_old_enough() {
        let (meter, clock, mut driver, _) = setup(ResetPolicy::Condense);
        tick_every_second(&meter, &clock, 3);
        let outcome = driver.report().unwrap();
        assert!(!outcome.advanced);
        assert!(meter.condensed().is_none());
    }

    #[test]
    fn test_condense_without_retention_keeps_running_total() {
        let (meter, clock, _, _) = setup(ResetPolicy::Condense);
        let config = DriverConfig {
            reset_policy: ResetPolicy::Condense,
            retained_history: Some(Duration::ZERO),
        };
        let mut driver = ReportDriver::new(meter.clone(), config);

        tick_every_second(&meter, &clock, 5);
        let first = driver.report().unwrap();
        assert!(first.advanced);
        assert_eq!(meter.snapshot().raw_ticks, 1);
        assert_eq!(meter.condensed().unwrap().ticks, 4);

        // No new pulses: the total must not fall back to zero
        clock.advance_millis(60_000);
        let idle = driver.report().unwrap();
        assert_relative_eq!(idle.telemetry.energy_kwh, 0.005);
        assert!(!idle.advanced);
    }

    #[test]
    fn test_clear_without_retention_keeps_last_tick() {
        let (meter, clock, _, _) = setup(ResetPolicy::Clear);
        let config = DriverConfig {
            reset_policy: ResetPolicy::Clear,
            retained_history: Some(Duration::ZERO),
        };
        let mut driver = ReportDriver::new(meter.clone(), config);

        tick_every_second(&meter, &clock, 3);
        let first = driver.report().unwrap();
        assert_eq!(driver.last_sent(), first.telemetry.last_tick.unwrap());
        assert_eq!(meter.snapshot().raw_ticks, 1);
    }

    #[test]
    fn test_every_publisher_is_attempted() {
        let (meter, clock, mut driver, first) = setup(ResetPolicy::Clear);
        let second = MemoryPublisher::new();
        driver.add_publisher(Box::new(second.clone()));
        tick_every_second(&meter, &clock, 2);

        first.set_failing(true);
        let outcome = driver.report().unwrap();
        assert_eq!(outcome.published, 1);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(second.published().len(), 1);
    }
}
