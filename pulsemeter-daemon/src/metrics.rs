// Pulsemeter Daemon - Prometheus metrics definitions
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Prometheus metrics for the meter.
//!
//! Reports reach these gauges through [`PrometheusPublisher`], one of the
//! report driver's sinks. Meter state gauges are refreshed after every report.

use lazy_static::lazy_static;
use prometheus::{register_gauge, register_int_counter, Encoder, Gauge, IntCounter, TextEncoder};
use pulsemeter::{MeterSnapshot, Publisher, ReportOutcome, Telemetry};

lazy_static! {
    // ============================================================
    // Report values
    // ============================================================

    /// Energy of the latest report in kWh.
    pub static ref ENERGY_KWH: Gauge = register_gauge!(
        "pulsemeter_energy_kwh",
        "Energy in kWh covered by the latest report"
    ).unwrap();

    /// Instantaneous power in kW, NaN while unknown.
    pub static ref POWER_KW: Gauge = register_gauge!(
        "pulsemeter_power_kw",
        "Instantaneous power in kW from the latest report (NaN if unknown)"
    ).unwrap();

    /// 1 if the latest report carried a power estimate, 0 otherwise.
    pub static ref POWER_KNOWN: Gauge = register_gauge!(
        "pulsemeter_power_known",
        "Whether the latest report had a power estimate (0/1)"
    ).unwrap();

    // ============================================================
    // Meter state
    // ============================================================

    pub static ref RAW_TICKS: Gauge = register_gauge!(
        "pulsemeter_raw_ticks",
        "Pulses held individually by the meter"
    ).unwrap();

    pub static ref CONDENSED_TICKS: Gauge = register_gauge!(
        "pulsemeter_condensed_ticks",
        "Pulses folded into the condensed summary"
    ).unwrap();

    // ============================================================
    // Report loop
    // ============================================================

    pub static ref REPORTS_TOTAL: IntCounter = register_int_counter!(
        "pulsemeter_reports_total",
        "Reports produced by the daemon"
    ).unwrap();

    pub static ref PUBLISH_FAILURES_TOTAL: IntCounter = register_int_counter!(
        "pulsemeter_publish_failures_total",
        "Publisher failures across all reports"
    ).unwrap();
}

/// Register every metric so the first scrape already lists them.
pub fn init() {
    lazy_static::initialize(&ENERGY_KWH);
    lazy_static::initialize(&POWER_KW);
    lazy_static::initialize(&POWER_KNOWN);
    lazy_static::initialize(&RAW_TICKS);
    lazy_static::initialize(&CONDENSED_TICKS);
    lazy_static::initialize(&REPORTS_TOTAL);
    lazy_static::initialize(&PUBLISH_FAILURES_TOTAL);
}

/// Sink that mirrors each report into the report gauges.
#[derive(Debug, Default)]
pub struct PrometheusPublisher;

impl PrometheusPublisher {
    pub fn new() -> Self {
        Self
    }
}

impl Publisher for PrometheusPublisher {
    fn name(&self) -> &str {
        "prometheus"
    }

    fn publish(&mut self, telemetry: &Telemetry) -> pulsemeter::Result<()> {
        update_report_metrics(telemetry);
        Ok(())
    }
}

/// Update the report gauges.
pub fn update_report_metrics(telemetry: &Telemetry) {
    ENERGY_KWH.set(telemetry.energy_kwh);
    match telemetry.power_kw {
        Some(power) => {
            POWER_KW.set(power);
            POWER_KNOWN.set(1.0);
        }
        None => {
            POWER_KW.set(f64::NAN);
            POWER_KNOWN.set(0.0);
        }
    }
}

/// Update meter state gauges.
pub fn update_meter_metrics(snapshot: &MeterSnapshot) {
    RAW_TICKS.set(snapshot.raw_ticks as f64);
    CONDENSED_TICKS.set(snapshot.condensed_ticks as f64);
}

/// Count a finished report and its failed sinks.
pub fn record_outcome(outcome: &ReportOutcome) {
    REPORTS_TOTAL.inc();
    PUBLISH_FAILURES_TOTAL.inc_by(outcome.failures.len() as u64);
}

/// Encode all metrics to Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn telemetry(power_kw: Option<f64>) -> Telemetry {
        Telemetry {
            energy_kwh: 0.25,
            power_kw,
            last_reset: None,
            last_tick: None,
        }
    }

    // Only this test touches the report gauges
    #[test]
    fn test_publisher_sets_report_gauges() {
        let mut publisher = PrometheusPublisher::new();
        assert_eq!(publisher.name(), "prometheus");

        publisher.publish(&telemetry(Some(1.8))).unwrap();
        assert_eq!(ENERGY_KWH.get(), 0.25);
        assert_eq!(POWER_KW.get(), 1.8);
        assert_eq!(POWER_KNOWN.get(), 1.0);

        publisher.publish(&telemetry(None)).unwrap();
        assert!(POWER_KW.get().is_nan());
        assert_eq!(POWER_KNOWN.get(), 0.0);

        let output = encode_metrics();
        assert!(output.contains("pulsemeter_energy_kwh"));
        assert!(output.contains("pulsemeter_power_known"));
    }

    #[test]
    fn test_outcome_counters() {
        let before = REPORTS_TOTAL.get();
        let outcome = ReportOutcome {
            telemetry: telemetry(None),
            published: 1,
            failures: vec![pulsemeter::MeterError::publish("json", "broken pipe")],
            advanced: false,
        };
        let failures_before = PUBLISH_FAILURES_TOTAL.get();
        record_outcome(&outcome);
        assert!(REPORTS_TOTAL.get() > before);
        assert!(PUBLISH_FAILURES_TOTAL.get() > failures_before);
    }

    #[test]
    fn test_encode_metrics() {
        init();
        update_meter_metrics(&pulsemeter::MeterSnapshot {
            raw_ticks: 12,
            condensed_ticks: 340,
            condensed_start: None,
            condensed_end: None,
            last_reset: None,
            first_tick: None,
            last_tick: None,
        });

        let output = encode_metrics();
        assert!(output.contains("pulsemeter_raw_ticks"));
        assert!(output.contains("pulsemeter_condensed_ticks"));
        assert!(output.contains("pulsemeter_reports_total"));
        assert!(output.contains("pulsemeter_publish_failures_total"));
    }
}
