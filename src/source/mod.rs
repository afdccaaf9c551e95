// Pulsemeter - Pulse-counting energy meter
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Tick sources
//!
//! A tick source watches a physical or simulated pulse stream on its own
//! thread and calls a tick sink once per detected pulse. The sink is usually
//! [`crate::EnergyMeter::tick`] behind an `Arc`:
//!
//! ```rust,no_run
//! use pulsemeter::source::{EmulatorConfig, EmulatorTickSource, TickSource};
//! use pulsemeter::{EnergyMeter, MeterConfig};
//! use std::sync::Arc;
//!
//! let meter = Arc::new(EnergyMeter::new(MeterConfig::default()).unwrap());
//! let sink = meter.clone();
//! let mut source = EmulatorTickSource::start(
//!     EmulatorConfig::new(1000.0, (1.0, 5.0)),
//!     move || sink.tick(),
//! ).unwrap();
//!
//! // ... later
//! source.stop().unwrap();
//! ```

mod emulator;
mod gpio;

pub use emulator::{EmulatorConfig, EmulatorTickSource, PowerProfile};
pub use gpio::{Edge, EdgeDetector, GpioConfig, GpioTickSource};

use crate::error::Result;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A running pulse detector
pub trait TickSource: Send {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Stop calling the sink and release the underlying resource.
    ///
    /// Stopping twice is a no-op.
    fn stop(&mut self) -> Result<()>;
}

/// Interruptible sleep shared between a source thread and its owner
#[derive(Debug, Default)]
pub(crate) struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn stop(&self) {
        *self.stopped.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.wake.notify_all();
    }

    pub(crate) fn is_stopped(&self) -> bool {
        *self.stopped.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sleep for `timeout` or until stopped. Returns true once stopped.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let guard = self.stopped.lock().unwrap_or_else(|e| e.into_inner());
        let (guard, _) = self
            .wake
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(|e| e.into_inner());
        *guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_stop_signal_times_out() {
        let signal = StopSignal::new();
        assert!(!signal.wait(Duration::from_millis(5)));
        assert!(!signal.is_stopped());
    }

    #[test]
    fn test_stop_signal_wakes_sleeper() {
        let signal = Arc::new(StopSignal::new());
        let sleeper = signal.clone();
        let start = Instant::now();
        let handle = thread::spawn(move || sleeper.wait(Duration::from_secs(30)));

        thread::sleep(Duration::from_millis(20));
        signal.stop();

        assert!(handle.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(signal.is_stopped());
    }
}
