// Pulsemeter Daemon - Pulse meter service with Prometheus metrics
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # Pulsemeter Daemon
//!
//! Counts pulses from a GPIO input (or an emulator), reports energy and
//! power every send interval and serves the latest values over HTTP.
//!
//! ## Usage
//!
//! ```bash
//! # Read pulses from the pin named in the config file
//! pulsemeter-daemon --config /etc/pulsemeter.json
//!
//! # Emulated pulses, a report every 30 s, JSON lines on stdout
//! pulsemeter-daemon --emulate --send-interval 30 --json --no-mqtt
//! ```
//!
//! Log output goes to stderr. Stdout only carries the `--json` reports, one
//! object per line.

mod config;
mod metrics;
mod mqtt;

use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use clap::Parser;
use config::{DaemonConfig, DaemonError};
use metrics::{encode_metrics, PrometheusPublisher};
use mqtt::{MqttLink, MqttPublisher};
use pulsemeter::source::{EmulatorTickSource, GpioTickSource};
use pulsemeter::{
    EnergyMeter, JsonPublisher, LogPublisher, MeterSnapshot, Publisher, ReportDriver,
    ResetPolicy, Telemetry, TickSource,
};
use serde::Serialize;
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

/// Pulse meter daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emulate pulses instead of reading the GPIO pin
    #[arg(short, long)]
    emulate: bool,

    /// Shorthand for --log-level debug
    #[arg(short, long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Port to listen on (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Seconds between reports (overrides the config file)
    #[arg(long)]
    send_interval: Option<u64>,

    /// Write every report as a JSON line on stdout
    #[arg(long)]
    json: bool,

    /// Do not connect to the MQTT broker
    #[arg(long)]
    no_mqtt: bool,
}

/// Application state shared across handlers.
struct AppState {
    config: DaemonConfig,
    meter: Arc<EnergyMeter>,
    last_report: RwLock<Option<Telemetry>>,
    started_at: DateTime<Utc>,
    start_time: std::time::Instant,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if args.verbose {
            Level::DEBUG
        } else {
            match args.log_level.to_lowercase().as_str() {
                "trace" => Level::TRACE,
                "debug" => Level::DEBUG,
                "info" => Level::INFO,
                "warn" => Level::WARN,
                "error" => Level::ERROR,
                _ => Level::INFO,
            }
        };
        EnvFilter::from_default_env().add_directive(level.into())
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("Pulsemeter daemon v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(args).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), DaemonError> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            DaemonConfig::load(path)?
        }
        None => {
            warn!("No configuration file given, using defaults");
            DaemonConfig::default()
        }
    };
    if let Some(port) = args.port {
        config.listen_port = port;
    }
    if let Some(secs) = args.send_interval {
        config.send_interval_secs = secs;
    }
    config.json_output |= args.json;
    if args.no_mqtt {
        config.mqtt_enabled = false;
    }
    config.validate()?;

    info!(
        "Meter {} ({}): {} pulses/kWh, report every {}s, {:?} policy",
        config.entity_id(),
        config.device_name,
        config.ticks_per_kwh,
        config.send_interval_secs,
        config.reset_policy
    );

    let meter = Arc::new(EnergyMeter::new(config.meter_config())?);

    let mut source: Box<dyn TickSource> = if args.emulate {
        let (min, max) = config.emulator_power_range_kw;
        info!("Emulating pulses for a {:.1}-{:.1} kW load", min, max);
        Box::new(EmulatorTickSource::start(
            config.emulator_config(),
            tick_sink(meter.clone()),
        )?)
    } else {
        info!(
            "Reading pulses from GPIO {} ({:?} edge)",
            config.gpio_pin, config.gpio_edge
        );
        Box::new(GpioTickSource::start(
            config.gpio_config(),
            tick_sink(meter.clone()),
        )?)
    };

    let mqtt = if config.mqtt_enabled {
        info!(
            "Publishing to MQTT broker {}:{}",
            config.mqtt_server, config.mqtt_port
        );
        let link = MqttLink::new(&config);
        tokio::spawn(link.event_loop.run());
        Some(link.publisher)
    } else {
        None
    };

    let publishers = build_publishers(&config, mqtt, std::io::stdout());
    let driver = ReportDriver::with_publishers(meter.clone(), config.driver_config(), publishers);

    metrics::init();
    metrics::POWER_KW.set(f64::NAN);

    let state = Arc::new(AppState {
        config: config.clone(),
        meter,
        last_report: RwLock::new(None),
        started_at: Utc::now(),
        start_time: std::time::Instant::now(),
    });

    let reporter = tokio::spawn(report_loop(driver, config.send_interval(), state.clone()));

    // Build router
    let app = Router::new()
        .route("/", get(root_handler))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .with_state(state);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
    info!("Starting server on http://{}", addr);
    info!("Metrics endpoint: http://{}/metrics", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    reporter.abort();
    source.stop()?;
    info!("Stopped {} source", source.name());
    Ok(())
}

/// Report sinks in publishing order. JSON lines go to `json_out`.
fn build_publishers<W>(
    config: &DaemonConfig,
    mqtt: Option<MqttPublisher>,
    json_out: W,
) -> Vec<Box<dyn Publisher>>
where
    W: Write + Send + 'static,
{
    let mut publishers: Vec<Box<dyn Publisher>> = vec![
        Box::new(LogPublisher::new()),
        Box::new(PrometheusPublisher::new()),
    ];
    if let Some(mqtt) = mqtt {
        publishers.push(Box::new(mqtt));
    }
    if config.json_output {
        publishers.push(Box::new(JsonPublisher::new(config.entity_id(), json_out)));
    }
    publishers
}

/// Sink handed to a tick source: one call per pulse.
fn tick_sink(meter: Arc<EnergyMeter>) -> impl Fn() + Send + 'static {
    move || meter.tick()
}

/// Produce a report every `period`, the first one a full period after start.
async fn report_loop(mut driver: ReportDriver, period: Duration, state: Arc<AppState>) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let outcome = match driver.report() {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Report failed: {}", e);
                continue;
            }
        };
        for failure in &outcome.failures {
            warn!("{}", failure);
        }
        metrics::record_outcome(&outcome);
        metrics::update_meter_metrics(&driver.meter().snapshot());

        let telemetry = outcome.telemetry;
        *state.last_report.write().await = Some(telemetry);
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

/// Root handler - shows a simple HTML page.
async fn root_handler() -> Html<&'static str> {
    Html(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Pulsemeter</title>
    <style>
        body { font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; max-width: 800px; margin: 50px auto; padding: 20px; }
        code { background: #e9ecef; padding: 2px 6px; border-radius: 4px; }
    </style>
</head>
<body>
    <h1>Pulsemeter</h1>
    <p>Pulse-counting energy meter.</p>
    <ul>
        <li><a href="/metrics">/metrics</a> - Prometheus metrics</li>
        <li><a href="/health">/health</a> - Health check</li>
        <li><a href="/status">/status</a> - Latest report and meter state (JSON)</li>
    </ul>
    <ul>
        <li><code>pulsemeter_energy_kwh</code> - Energy of the latest report</li>
        <li><code>pulsemeter_power_kw</code> - Instantaneous power (NaN if unknown)</li>
        <li><code>pulsemeter_raw_ticks</code> / <code>pulsemeter_condensed_ticks</code> - Meter history</li>
        <li><code>pulsemeter_reports_total</code> / <code>pulsemeter_publish_failures_total</code> - Report loop</li>
    </ul>
</body>
</html>"#,
    )
}

/// Metrics handler - returns Prometheus text format.
async fn metrics_handler() -> impl IntoResponse {
    let metrics = encode_metrics();
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; charset=utf-8")],
        metrics,
    )
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Status information response.
#[derive(Serialize)]
struct StatusResponse {
    version: String,
    uptime_secs: u64,
    started_at: DateTime<Utc>,
    meter_id: String,
    device_name: String,
    entity_id: String,
    reset_policy: ResetPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_report: Option<Telemetry>,
    meter: MeterSnapshot,
}

/// Status handler - returns JSON status information.
async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let last_report = *state.last_report.read().await;

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        started_at: state.started_at,
        meter_id: state.config.meter_id.clone(),
        device_name: state.config.device_name.clone(),
        entity_id: state.config.entity_id(),
        reset_policy: state.config.reset_policy,
        last_report,
        meter: state.meter.snapshot(),
    })
}
