// Pulsemeter - Pulse-counting energy meter
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! GPIO pulse input through the Linux sysfs interface
//!
//! The meter's pulse LED or S0 output is wired to a GPIO pin. The source
//! polls the pin's `value` file, detects the configured edge and debounces it
//! the way an interrupt-driven edge detector with a bounce time would.

use super::{StopSignal, TickSource};
use crate::error::{MeterError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const SYSFS_GPIO: &str = "/sys/class/gpio";

/// Signal edge that marks a pulse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Edge {
    Rising,
    #[default]
    Falling,
}

impl std::str::FromStr for Edge {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rising" => Ok(Self::Rising),
            "falling" => Ok(Self::Falling),
            other => Err(format!("unknown edge: {}", other)),
        }
    }
}

/// GPIO source settings
#[derive(Debug, Clone, PartialEq)]
pub struct GpioConfig {
    /// BCM pin number
    pub pin: u32,
    pub edge: Edge,
    /// Edges closer than this to the last accepted one are ignored
    pub debounce: Duration,
    pub poll_interval: Duration,
    /// Override for the pin's value file. When unset the pin is exported
    /// through sysfs and released again on stop.
    pub value_path: Option<PathBuf>,
}

impl GpioConfig {
    pub fn new(pin: u32) -> Self {
        Self {
            pin,
            edge: Edge::default(),
            debounce: Duration::from_millis(18),
            poll_interval: Duration::from_millis(2),
            value_path: None,
        }
    }

    /// Read levels from `path` instead of the sysfs pin
    pub fn with_value_path(pin: u32, path: impl Into<PathBuf>) -> Self {
        Self {
            value_path: Some(path.into()),
            ..Self::new(pin)
        }
    }
}

/// Edge detector with bounce suppression
#[derive(Debug, Clone)]
pub struct EdgeDetector {
    edge: Edge,
    debounce: Duration,
    level: Option<bool>,
    last_fire: Option<Instant>,
}

impl EdgeDetector {
    pub fn new(edge: Edge, debounce: Duration) -> Self {
        Self {
            edge,
            debounce,
            level: None,
            last_fire: None,
        }
    }

    /// Feed one sampled level; true when it completes an accepted pulse.
    /// The first sample only primes the detector.
    pub fn observe(&mut self, level: bool, at: Instant) -> bool {
        let previous = self.level.replace(level);
        let edge = match (previous, self.edge) {
            (Some(false), Edge::Rising) => level,
            (Some(true), Edge::Falling) => !level,
            _ => false,
        };
        if !edge {
            return false;
        }
        if let Some(last) = self.last_fire {
            if at.saturating_duration_since(last) < self.debounce {
                return false;
            }
        }
        self.last_fire = Some(at);
        true
    }
}

/// Polling GPIO pulse detector
pub struct GpioTickSource {
    pin: u32,
    exported: bool,
    signal: Arc<StopSignal>,
    thread: Option<JoinHandle<()>>,
}

impl GpioTickSource {
    /// Open the pin and start polling it
    pub fn start<F>(config: GpioConfig, sink: F) -> Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let (value_path, exported) = match &config.value_path {
            Some(path) => (path.clone(), false),
            None => export_pin(config.pin)?,
        };
        // Fail early on an unreadable pin rather than inside the thread
        read_level(&value_path)?;

        let signal = Arc::new(StopSignal::new());
        let thread_signal = signal.clone();
        let pin = config.pin;
        let thread = thread::Builder::new()
            .name(format!("gpio-{}", pin))
            .spawn(move || poll(config, value_path, sink, &thread_signal))?;

        log::info!("GPIO tick source started on pin {}", pin);
        Ok(Self {
            pin,
            exported,
            signal,
            thread: Some(thread),
        })
    }
}

fn export_pin(pin: u32) -> Result<(PathBuf, bool)> {
    let gpio_dir = Path::new(SYSFS_GPIO).join(format!("gpio{}", pin));
    let exported = if gpio_dir.exists() {
        false
    } else {
        fs::write(Path::new(SYSFS_GPIO).join("export"), pin.to_string())?;
        true
    };
    fs::write(gpio_dir.join("direction"), "in")?;
    Ok((gpio_dir.join("value"), exported))
}

fn read_level(path: &Path) -> Result<bool> {
    let raw = fs::read_to_string(path)?;
    match raw.trim() {
        "0" => Ok(false),
        "1" => Ok(true),
        other => Err(MeterError::Source(format!(
            "unexpected GPIO level {:?} in {}",
            other,
            path.display()
        ))),
    }
}

fn poll<F: Fn()>(config: GpioConfig, path: PathBuf, sink: F, signal: &StopSignal) {
    let mut detector = EdgeDetector::new(config.edge, config.debounce);
    let mut failing = false;

    while !signal.wait(config.poll_interval) {
        match read_level(&path) {
            Ok(level) => {
                if failing {
                    log::info!("GPIO pin {} readable again", config.pin);
                    failing = false;
                }
                if detector.observe(level, Instant::now()) {
                    sink();
                }
            }
            Err(e) => {
                if !failing {
                    log::warn!("Failed to read GPIO pin {}: {}", config.pin, e);
                    failing = true;
                }
            }
        }
    }
}

impl TickSource for GpioTickSource {
    fn name(&self) -> &str {
        "gpio"
    }

    fn stop(&mut self) -> Result<()> {
        self.signal.stop();
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        thread
            .join()
            .map_err(|_| MeterError::Source(format!("gpio-{} thread panicked", self.pin)))?;

        if self.exported {
            if let Err(e) = fs::write(Path::new(SYSFS_GPIO).join("unexport"), self.pin.to_string()) {
                log::warn!("Failed to release GPIO pin {}: {}", self.pin, e);
            }
        }
        log::info!("GPIO tick source on pin {} stopped", self.pin);
        Ok(())
    }
}

impl Drop for GpioTickSource {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("Failed to stop GPIO source: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::NamedTempFile;

    fn ms(base: Instant, millis: u64) -> Instant {
        base + Duration::from_millis(millis)
    }

    #[test]
    fn test_edge_from_str() {
        assert_eq!("rising".parse::<Edge>(), Ok(Edge::Rising));
        assert_eq!("FALLING".parse::<Edge>(), Ok(Edge::Falling));
        assert!("both".parse::<Edge>().is_err());
    }

    #[test]
    fn test_first_sample_only_primes() {
        let base = Instant::now();
        let mut detector = EdgeDetector::new(Edge::Rising, Duration::ZERO);
        assert!(!detector.observe(true, base));
    }

    #[test]
    fn test_rising_edge() {
        let base = Instant::now();
        let mut detector = EdgeDetector::new(Edge::Rising, Duration::ZERO);
        assert!(!detector.observe(false, ms(base, 0)));
        assert!(detector.observe(true, ms(base, 1)));
        assert!(!detector.observe(true, ms(base, 2)));
        assert!(!detector.observe(false, ms(base, 3)));
        assert!(detector.observe(true, ms(base, 4)));
    }

    #[test]
    fn test_falling_edge() {
        let base = Instant::now();
        let mut detector = EdgeDetector::new(Edge::Falling, Duration::ZERO);
        assert!(!detector.observe(true, ms(base, 0)));
        assert!(detector.observe(false, ms(base, 1)));
        assert!(!detector.observe(true, ms(base, 2)));
    }

    #[test]
    fn test_debounce_suppresses_bounces() {
        let base = Instant::now();
        let mut detector = EdgeDetector::new(Edge::Rising, Duration::from_millis(18));
        detector.observe(false, ms(base, 0));
        assert!(detector.observe(true, ms(base, 1)));
        // Contact bounce
        detector.observe(false, ms(base, 3));
        assert!(!detector.observe(true, ms(base, 5)));
        // Next real pulse
        detector.observe(false, ms(base, 100));
        assert!(detector.observe(true, ms(base, 120)));
    }

    #[test]
    fn test_unreadable_value_file_fails_start() {
        let config = GpioConfig::with_value_path(14, "/nonexistent/gpio14/value");
        let result = GpioTickSource::start(config, || {});
        assert!(matches!(result, Err(MeterError::Io(_))));
    }

    #[test]
    fn test_source_ticks_on_file_edges() {
        let file = NamedTempFile::new().unwrap();
        fs::write(file.path(), "1\n").unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let sink_count = count.clone();
        let config = GpioConfig {
            debounce: Duration::ZERO,
            ..GpioConfig::with_value_path(14, file.path())
        };
        let mut source = GpioTickSource::start(config, move || {
            sink_count.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        thread::sleep(Duration::from_millis(50));
        fs::write(file.path(), "0\n").unwrap();
        thread::sleep(Duration::from_millis(50));
        source.stop().unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
