// Pulsemeter - Pulse-counting energy meter
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Telemetry publishers
//!
//! This module provides the [`Publisher`] trait and the sinks that ship with
//! the library. Each report is published to every configured sink.

use crate::error::{MeterError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// One periodic report
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Telemetry {
    /// Energy in kWh accumulated since `last_reset`
    pub energy_kwh: f64,
    /// Instantaneous power in kW, `None` when unknown
    pub power_kw: Option<f64>,
    /// Start of the period `energy_kwh` covers
    pub last_reset: Option<DateTime<Utc>>,
    /// Latest pulse included in the report
    pub last_tick: Option<DateTime<Utc>>,
}

/// Trait for telemetry sinks
pub trait Publisher: Send {
    /// Short name for logs and errors
    fn name(&self) -> &str;

    /// Deliver one report
    fn publish(&mut self, telemetry: &Telemetry) -> Result<()>;
}

/// Writes reports to the `log` facade
#[derive(Debug, Default)]
pub struct LogPublisher;

impl LogPublisher {
    pub fn new() -> Self {
        Self
    }
}

impl Publisher for LogPublisher {
    fn name(&self) -> &str {
        "log"
    }

    fn publish(&mut self, telemetry: &Telemetry) -> Result<()> {
        match telemetry.power_kw {
            Some(power) => log::info!("Instantaneous power: {:.3} kW", power),
            None => log::info!("Instantaneous power: unknown"),
        }
        match telemetry.last_reset {
            Some(since) => log::info!(
                "Accumulated energy since {}: {:.3} kWh",
                since.to_rfc3339(),
                telemetry.energy_kwh
            ),
            None => log::info!("Accumulated energy: {:.3} kWh", telemetry.energy_kwh),
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct PowerState {
    power: Option<f64>,
    unit_of_measurement: &'static str,
}

#[derive(Serialize)]
struct EnergyState {
    energy: f64,
    unit_of_measurement: &'static str,
    last_reset: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct JsonReport<'a> {
    meter: &'a str,
    power: PowerState,
    energy: EnergyState,
    last_tick: Option<DateTime<Utc>>,
}

/// Writes one JSON object per report, newline delimited
pub struct JsonPublisher<W: Write + Send> {
    meter_id: String,
    writer: W,
}

impl<W: Write + Send> JsonPublisher<W> {
    pub fn new(meter_id: impl Into<String>, writer: W) -> Self {
        Self {
            meter_id: meter_id.into(),
            writer,
        }
    }

    /// Give back the underlying writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> Publisher for JsonPublisher<W> {
    fn name(&self) -> &str {
        "json"
    }

    fn publish(&mut self, telemetry: &Telemetry) -> Result<()> {
        let report = JsonReport {
            meter: &self.meter_id,
            power: PowerState {
                power: telemetry.power_kw,
                unit_of_measurement: "kW",
            },
            energy: EnergyState {
                energy: telemetry.energy_kwh,
                unit_of_measurement: "kWh",
                last_reset: telemetry.last_reset,
            },
            last_tick: telemetry.last_tick,
        };
        serde_json::to_writer(&mut self.writer, &report)
            .map_err(|e| MeterError::publish("json", e))?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Records reports in memory; clones share the same record
#[derive(Debug, Clone, Default)]
pub struct MemoryPublisher {
    published: Arc<Mutex<Vec<Telemetry>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent publishes fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Every report accepted so far
    pub fn published(&self) -> Vec<Telemetry> {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn last(&self) -> Option<Telemetry> {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last()
            .copied()
    }
}

impl Publisher for MemoryPublisher {
    fn name(&self) -> &str {
        "memory"
    }

    fn publish(&mut self, telemetry: &Telemetry) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(MeterError::publish("memory", "sink unavailable"));
        }
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(*telemetry);
        Ok(())
    }
}
