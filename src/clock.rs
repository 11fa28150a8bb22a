//! Injectable time source for payloads that simulate blocking work.

use std::sync::Mutex;
use std::thread;
use std::time::Duration;

/// Sleeps in whole "time units" so tests can shrink or skip real waiting.
pub trait Clock: Send + Sync {
    /// Length of one unit of simulated work.
    fn unit(&self) -> Duration;

    /// Suspend the calling thread for `units` units.
    fn sleep_units(&self, units: u32);
}

/// Real clock backed by `thread::sleep`.
#[derive(Clone, Copy, Debug)]
pub struct SystemClock {
    unit: Duration,
}

impl SystemClock {
    pub fn new(unit: Duration) -> Self {
        Self { unit }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl Clock for SystemClock {
    fn unit(&self) -> Duration {
        self.unit
    }

    fn sleep_units(&self, units: u32) {
        if units > 0 {
            thread::sleep(self.unit * units);
        }
    }
}

/// Clock that never sleeps; it only records what was requested.
#[derive(Debug, Default)]
pub struct InstantClock {
    requested: Mutex<Vec<u32>>,
}

impl InstantClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `sleep_units` request seen so far, in arrival order.
    pub fn requested(&self) -> Vec<u32> {
        self.requested
            .lock()
            .expect("instant clock mutex poisoned")
            .clone()
    }
}

impl Clock for InstantClock {
    fn unit(&self) -> Duration {
        Duration::ZERO
    }

    fn sleep_units(&self, units: u32) {
        self.requested
            .lock()
            .expect("instant clock mutex poisoned")
            .push(units);
    }
}
