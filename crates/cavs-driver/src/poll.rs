//! Hardware status polling
//!
//! Three flavours, matching what the hardware protocol allows:
//!
//! | Function | Bound | Used for |
//! |----------|-------|----------|
//! | [`spin_until`] | none | power sequencing, link reset, ROM boot |
//! | [`PollConfig::spin`] | wall clock | stream reset handshake |
//! | [`poll_every`] | optional timeout + stop flag | FW_ENTERED, log and IPC loops |
//!
//! An unbounded spin on a transition that never completes hangs the caller.
//! It has no way to return early.

use crate::error::{CavsError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Busy-wait until `done` returns true.
pub fn spin_until(mut done: impl FnMut() -> bool) {
    while !done() {
        std::hint::spin_loop();
    }
}

/// Bounded busy-wait.
#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    /// Give up after this long.
    pub timeout: Duration,
    /// Yield the CPU every this many checks.
    pub yield_interval: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(500),
            yield_interval: 64,
        }
    }
}

impl PollConfig {
    /// Spin until `done` returns true, returning the number of checks made.
    ///
    /// # Errors
    ///
    /// Returns [`CavsError::Timeout`] naming `what` if `timeout` elapses first.
    pub fn spin(&self, what: &'static str, mut done: impl FnMut() -> bool) -> Result<u32> {
        let start = Instant::now();
        let mut checks = 0u32;
        loop {
            checks = checks.saturating_add(1);
            if done() {
                return Ok(checks);
            }
            if start.elapsed() >= self.timeout {
                tracing::warn!("{what} still pending after {checks} checks");
                return Err(CavsError::timeout(what, self.timeout));
            }
            if self.yield_interval != 0 && checks % self.yield_interval == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
    }
}

/// How a sleep-based poll ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The condition became true.
    Ready,
    /// The timeout elapsed first.
    TimedOut,
    /// The stop flag was raised.
    Stopped,
}

/// Check `done` every `interval` until it holds, `timeout` elapses, or `stop`
/// is raised. `None` means unbounded / not cancellable.
///
/// The condition is always checked at least once, and once more after the
/// final sleep, so a zero timeout still samples the hardware.
pub fn poll_every(
    interval: Duration,
    timeout: Option<Duration>,
    stop: Option<&AtomicBool>,
    mut done: impl FnMut() -> bool,
) -> PollOutcome {
    let start = Instant::now();
    loop {
        if done() {
            return PollOutcome::Ready;
        }
        if stop.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
            return PollOutcome::Stopped;
        }
        if timeout.is_some_and(|limit| start.elapsed() >= limit) {
            return PollOutcome::TimedOut;
        }
        std::thread::sleep(interval);
    }
}
