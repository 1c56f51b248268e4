// This file is part of Nightjar NVR, a security camera network video recorder.
// Copyright (C) 2026 The Nightjar NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Clock interface and implementations for testability.

use crate::shutdown::ShutdownError;
use crate::time::Time;
use crate::Error;
use crate::Mutex;
use std::mem;
use std::thread;
use std::time::Duration as StdDuration;
use tracing::warn;

/// A monotonic instant, as time since an arbitrary epoch (boot on Linux).
#[derive(Copy, Clone, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub struct Instant(pub StdDuration);

impl Instant {
    pub fn saturating_sub(&self, other: &Instant) -> StdDuration {
        self.0.saturating_sub(other.0)
    }
}

impl std::ops::Add<StdDuration> for Instant {
    type Output = Instant;
    fn add(self, rhs: StdDuration) -> Instant {
        Instant(self.0 + rhs)
    }
}

/// Abstract interface to the system clocks. This is for testability.
pub trait Clocks: Send + Sync + 'static {
    /// Gets the current wall-clock time from `CLOCK_REALTIME`.
    fn realtime(&self) -> Time;

    /// Gets the current time from a monotonic clock.
    ///
    /// On Linux, this uses `CLOCK_BOOTTIME`, which includes suspended time.
    /// On other systems, it uses `CLOCK_MONOTONIC`.
    fn monotonic(&self) -> Instant;

    /// Causes the current thread to sleep for the specified time.
    fn sleep(&self, how_long: StdDuration);
}

/// Runs `f` until it succeeds, sleeping one second between attempts, aborting
/// when shutdown is requested.
pub fn retry<C, T, E>(
    clocks: &C,
    shutdown_rx: &crate::shutdown::Receiver,
    f: &mut dyn FnMut() -> Result<T, E>,
) -> Result<T, ShutdownError>
where
    C: Clocks,
    E: Into<Error>,
{
    loop {
        let e = match f() {
            Ok(t) => return Ok(t),
            Err(e) => e.into(),
        };
        shutdown_rx.check()?;
        warn!(err = %e.chain(), "sleeping for 1 s after error");
        clocks.sleep(StdDuration::from_secs(1));
    }
}

#[derive(Copy, Clone)]
pub struct RealClocks {}

impl RealClocks {
    fn get(&self, clock: libc::clockid_t) -> libc::timespec {
        unsafe {
            let mut ts = mem::MaybeUninit::uninit();
            assert_eq!(0, libc::clock_gettime(clock, ts.as_mut_ptr()));
            ts.assume_init()
        }
    }
}

impl Clocks for RealClocks {
    fn realtime(&self) -> Time {
        let ts = self.get(libc::CLOCK_REALTIME);
        // On 32-bit arm builds, `tv_sec` is an `i32` and requires conversion.
        #[allow(clippy::useless_conversion)]
        Time(i64::from(ts.tv_sec))
    }

    #[cfg(target_os = "linux")]
    fn monotonic(&self) -> Instant {
        let ts = self.get(libc::CLOCK_BOOTTIME);
        #[allow(clippy::useless_conversion)]
        Instant(StdDuration::new(
            u64::try_from(i64::from(ts.tv_sec)).unwrap_or(0),
            ts.tv_nsec as u32,
        ))
    }

    #[cfg(not(target_os = "linux"))]
    fn monotonic(&self) -> Instant {
        let ts = self.get(libc::CLOCK_MONOTONIC);
        #[allow(clippy::useless_conversion)]
        Instant(StdDuration::new(
            u64::try_from(i64::from(ts.tv_sec)).unwrap_or(0),
            ts.tv_nsec as u32,
        ))
    }

    fn sleep(&self, how_long: StdDuration) {
        thread::sleep(how_long)
    }
}

/// Logs a warning if the `TimerGuard` lives "too long", using the label
/// created by a supplied function.
pub struct TimerGuard<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> {
    clocks: &'a C,
    label_f: Option<F>,
    start: Instant,
}

impl<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> TimerGuard<'a, C, S, F> {
    pub fn new(clocks: &'a C, label_f: F) -> Self {
        TimerGuard {
            clocks,
            label_f: Some(label_f),
            start: clocks.monotonic(),
        }
    }
}

impl<'a, C, S, F> Drop for TimerGuard<'a, C, S, F>
where
    C: Clocks + ?Sized,
    S: AsRef<str>,
    F: FnOnce() -> S + 'a,
{
    fn drop(&mut self) {
        let elapsed = self.clocks.monotonic().saturating_sub(&self.start);
        if elapsed.as_secs() >= 1 {
            let label_f = self.label_f.take().unwrap();
            warn!("{} took {:?}!", label_f().as_ref(), elapsed);
        }
    }
}

/// Simulated clock for testing.
#[derive(Clone)]
pub struct SimulatedClocks(std::sync::Arc<SimulatedClocksInner>);

struct SimulatedClocksInner {
    boot: Time,
    uptime: Mutex<StdDuration>,
}

impl SimulatedClocks {
    pub fn new(boot: Time) -> Self {
        SimulatedClocks(std::sync::Arc::new(SimulatedClocksInner {
            boot,
            uptime: Mutex::new(StdDuration::ZERO),
        }))
    }
}

impl Clocks for SimulatedClocks {
    fn realtime(&self) -> Time {
        let uptime = *self.0.uptime.lock();
        Time(self.0.boot.0 + uptime.as_secs() as i64)
    }

    fn monotonic(&self) -> Instant {
        Instant(*self.0.uptime.lock())
    }

    /// Advances the clock by the specified amount without actually sleeping.
    fn sleep(&self, how_long: StdDuration) {
        let mut l = self.0.uptime.lock();
        *l += how_long;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_advances_on_sleep() {
        let c = SimulatedClocks::new(Time(1_429_920_000));
        assert_eq!(c.realtime(), Time(1_429_920_000));
        c.sleep(StdDuration::from_secs(86_400));
        assert_eq!(c.realtime(), Time(1_430_006_400));
        assert_eq!(c.monotonic(), Instant(StdDuration::from_secs(86_400)));
    }

    #[test]
    fn real_monotonic_is_monotonic() {
        let c = RealClocks {};
        let a = c.monotonic();
        let b = c.monotonic();
        assert!(b >= a);
    }
}
