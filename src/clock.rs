//! Monotonic time and tick pacing.
//!
//! The control loop is declared at 1 kHz, but a sensor read plus a PID step
//! is not free. [`TickPacer`] sleeps to the next tick boundary instead of
//! sleeping a fixed interval after each step, so the loop rate does not
//! drift with the cost of the step.

use embassy_time::{Duration, Instant};
use embedded_hal_async::delay::DelayNs;

use crate::log::*;

/// Monotonic time source.
pub trait Clock {
    fn now(&mut self) -> Instant;
}

impl<T: Clock + ?Sized> Clock for &mut T {
    fn now(&mut self) -> Instant {
        T::now(self)
    }
}

/// Hardware clock backed by the embassy time driver.
#[cfg(feature = "rp2040")]
#[derive(Debug, Default, Clone, Copy)]
pub struct EmbassyClock;

#[cfg(feature = "rp2040")]
impl Clock for EmbassyClock {
    fn now(&mut self) -> Instant {
        Instant::now()
    }
}

pub struct TickPacer {
    period: Duration,
    next: Option<Instant>,
    overruns: u32,
}

impl TickPacer {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            next: None,
            overruns: 0,
        }
    }

    pub fn from_micros(micros: u32) -> Self {
        Self::new(Duration::from_micros(micros as u64))
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Ticks that started late because the previous one ran long.
    pub fn overruns(&self) -> u32 {
        self.overruns
    }

    /// Forget the schedule; the next `wait` starts a fresh one.
    pub fn restart(&mut self) {
        self.next = None;
    }

    /// Sleep until the next tick boundary.
    pub async fn wait<C: Clock, D: DelayNs>(&mut self, clock: &mut C, delay: &mut D) {
        let now = clock.now();
        let deadline = match self.next {
            Some(deadline) => deadline,
            None => now + self.period,
        };

        if deadline > now {
            let remaining = deadline - now;
            delay
                .delay_us(remaining.as_micros().min(u32::MAX as u64) as u32)
                .await;
            self.next = Some(deadline + self.period);
        } else {
            // late: start over from here rather than bursting to catch up
            self.overruns = self.overruns.wrapping_add(1);
            if self.overruns.is_power_of_two() {
                debug!("TickPacer: {} overruns", self.overruns);
            }
            self.next = Some(now + self.period);
        }
    }
}
