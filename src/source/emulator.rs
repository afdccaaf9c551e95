// Pulsemeter - Pulse-counting energy meter
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Emulated pulse stream for running without meter hardware.

use super::{StopSignal, TickSource};
use crate::error::{MeterError, Result};
use rand::Rng;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Emulator settings
#[derive(Debug, Clone, PartialEq)]
pub struct EmulatorConfig {
    /// Pulse rate of the emulated meter
    pub ticks_per_kwh: f64,
    /// (min, max) emulated power draw in kW
    pub power_range_kw: (f64, f64),
    /// Speed-up factor for demos (1.0 = real time)
    pub speed: f64,
}

impl EmulatorConfig {
    pub fn new(ticks_per_kwh: f64, power_range_kw: (f64, f64)) -> Self {
        Self {
            ticks_per_kwh,
            power_range_kw,
            speed: 1.0,
        }
    }

    fn validate(&self) -> Result<()> {
        let (min, max) = self.power_range_kw;
        if !(self.ticks_per_kwh > 0.0) {
            return Err(MeterError::Source(format!(
                "emulator ticks_per_kwh must be > 0, got {}",
                self.ticks_per_kwh
            )));
        }
        if !(min >= 0.0 && max > 0.0 && min <= max) {
            return Err(MeterError::Source(format!(
                "invalid emulator power range ({}, {})",
                min, max
            )));
        }
        if !(self.speed > 0.0) {
            return Err(MeterError::Source(format!(
                "emulator speed must be > 0, got {}",
                self.speed
            )));
        }
        Ok(())
    }
}

/// Random-walk power draw bounded to a range.
///
/// Each step scales the current power by a uniform factor in `[0.9, 1.1]`;
/// a step that leaves the range re-draws uniformly inside it.
#[derive(Debug, Clone)]
pub struct PowerProfile {
    range: (f64, f64),
    current_kw: f64,
}

impl PowerProfile {
    pub fn new<R: Rng + ?Sized>(range: (f64, f64), rng: &mut R) -> Self {
        Self {
            range,
            current_kw: draw(range, rng),
        }
    }

    /// Advance one step and return the new power in kW
    pub fn next_kw<R: Rng + ?Sized>(&mut self, rng: &mut R) -> f64 {
        let (min, max) = self.range;
        let next = self.current_kw * (1.0 + rng.gen_range(-0.1_f64..=0.1));
        self.current_kw = if next < min || next > max {
            draw(self.range, rng)
        } else {
            next
        };
        self.current_kw
    }

    pub fn current_kw(&self) -> f64 {
        self.current_kw
    }
}

fn draw<R: Rng + ?Sized>((min, max): (f64, f64), rng: &mut R) -> f64 {
    if min >= max {
        min
    } else {
        rng.gen_range(min..=max)
    }
}

/// Time between pulses at `power_kw`, `None` at zero power
fn tick_interval(ticks_per_kwh: f64, power_kw: f64) -> Option<Duration> {
    if power_kw <= 0.0 {
        return None;
    }
    let seconds = (1.0 / ticks_per_kwh) / power_kw * 3600.0;
    Duration::try_from_secs_f64(seconds).ok()
}

/// Background thread that ticks at an emulated, drifting power draw
pub struct EmulatorTickSource {
    signal: Arc<StopSignal>,
    thread: Option<JoinHandle<()>>,
}

impl EmulatorTickSource {
    /// Spawn the emulator thread
    pub fn start<F>(config: EmulatorConfig, sink: F) -> Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        config.validate()?;
        let signal = Arc::new(StopSignal::new());
        let thread_signal = signal.clone();

        let thread = thread::Builder::new()
            .name("tick-emulator".to_string())
            .spawn(move || run(config, sink, &thread_signal))?;

        log::info!("Emulator tick source started");
        Ok(Self {
            signal,
            thread: Some(thread),
        })
    }
}

fn run<F: Fn()>(config: EmulatorConfig, sink: F, signal: &StopSignal) {
    let mut rng = rand::thread_rng();
    let mut profile = PowerProfile::new(config.power_range_kw, &mut rng);

    while !signal.is_stopped() {
        let power_kw = profile.next_kw(&mut rng);
        log::debug!("Emulated power: {:.2} kW", power_kw);

        match tick_interval(config.ticks_per_kwh, power_kw) {
            Some(interval) => {
                if signal.wait(interval.div_f64(config.speed)) {
                    break;
                }
                sink();
            }
            None => {
                if signal.wait(Duration::from_secs(1)) {
                    break;
                }
            }
        }
    }
}

impl TickSource for EmulatorTickSource {
    fn name(&self) -> &str {
        "emulator"
    }

    fn stop(&mut self) -> Result<()> {
        self.signal.stop();
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| MeterError::Source("emulator thread panicked".to_string()))?;
            log::info!("Emulator tick source stopped");
        }
        Ok(())
    }
}

impl Drop for EmulatorTickSource {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("Failed to stop emulator: {}", e);
        }
    }
}
