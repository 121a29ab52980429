//! Oscillation-driven gain search.
//!
//! Each cycle forces the heater to full until the target is reached, then
//! lets the controller regulate for a measurement window while sampling the
//! temperature once per slot. Peaks and troughs in that trace give the
//! oscillation period and amplitude, from which new gains are derived:
//!
//! - amplitude above `acceptable_amplitude`: `kp *= gain_factor`
//! - otherwise: `kp /= gain_factor`
//! - `ki = 2 kp / period`, `kd = kp period / 8`
//!
//! Tuning stops early once the trace holds a long enough run of samples
//! within `stability_tolerance` of the target.

use core::fmt;

use embassy_time::Duration;
use embedded_hal_async::delay::DelayNs;
use heapless::Vec;
use portable_atomic::{AtomicBool, Ordering};
use serde::{Deserialize, Serialize};

use crate::clock::{Clock, TickPacer};
use crate::heater::{HeaterDrive, HeaterOutput};
use crate::log::*;
use crate::pid::{self, Controller, Gains, HistoryOverflow};
use crate::thermistor::ThermistorInput;

/// Longest measurement window, in samples.
pub const MAX_WINDOW_SECS: usize = 600;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    pub target: f32,
    pub max_cycles: u32,
    /// Samples per measurement window, one per slot.
    pub measure_secs: u32,
    pub steps_per_sample: u32,
    pub step_interval_us: u32,
    pub peak_threshold: f32,
    pub acceptable_amplitude: f32,
    pub gain_factor: f32,
    pub stability_tolerance: f32,
    pub stability_samples: u32,
    pub forcing_margin: f32,
    /// 0 waits forever.
    pub forcing_timeout_secs: u32,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            target: 200.0,
            max_cycles: 30,
            measure_secs: 120,
            steps_per_sample: 1000,
            step_interval_us: 1000,
            peak_threshold: 0.5,
            acceptable_amplitude: 1.0,
            gain_factor: 0.6,
            stability_tolerance: 0.5,
            stability_samples: 100,
            forcing_margin: 0.05,
            forcing_timeout_secs: 600,
        }
    }
}

impl TuningConfig {
    pub fn with_target(mut self, target: f32) -> Self {
        self.target = target;
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if !self.target.is_finite() {
            return Err(Error::InvalidConfig("target must be finite"));
        }
        if self.max_cycles == 0 {
            return Err(Error::InvalidConfig("max_cycles must be at least 1"));
        }
        if self.measure_secs == 0 || self.measure_secs as usize > MAX_WINDOW_SECS {
            return Err(Error::InvalidConfig("measure_secs out of range"));
        }
        if self.steps_per_sample == 0 || self.step_interval_us == 0 {
            return Err(Error::InvalidConfig("step pacing must be non-zero"));
        }
        if !(self.gain_factor > 0.0 && self.gain_factor < 1.0) {
            return Err(Error::InvalidConfig("gain_factor must be in (0, 1)"));
        }
        let non_negative = |x: f32| x.is_finite() && x >= 0.0;
        if !non_negative(self.peak_threshold)
            || !non_negative(self.acceptable_amplitude)
            || !non_negative(self.stability_tolerance)
            || !non_negative(self.forcing_margin)
        {
            return Err(Error::InvalidConfig("thresholds must be finite and non-negative"));
        }
        if self.stability_samples == 0 || self.stability_samples > self.measure_secs {
            return Err(Error::InvalidConfig("stability_samples must fit the window"));
        }
        Ok(())
    }
}

/// Autotune error
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    Controller(pid::Error),
    /// Forcing phase never reached the target.
    ForcingTimeout,
    InvalidConfig(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Controller(e) => write!(f, "{}", e),
            Error::ForcingTimeout => write!(f, "Heater did not reach the tuning target"),
            Error::InvalidConfig(msg) => write!(f, "Invalid tuning config: {}", msg),
        }
    }
}

impl From<pid::Error> for Error {
    fn from(e: pid::Error) -> Self {
        Error::Controller(e)
    }
}

/// Period in samples, amplitude in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Oscillation {
    pub period: f32,
    pub amplitude: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[serde(rename_all = "snake_case")]
pub enum TuneStatus {
    Converged,
    Exhausted,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TuneReport {
    pub status: TuneStatus,
    pub cycles: u32,
    pub gains: Gains,
    pub oscillation: Option<Oscillation>,
}

/// Cooperative stop request, shareable through a `static`.
pub struct CancelToken {
    flag: AtomicBool,
}

impl CancelToken {
    pub const fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Interior samples strictly above both neighbours and above `floor`.
fn peaks(trace: &[f32], floor: f32) -> impl Iterator<Item = (usize, f32)> + '_ {
    trace
        .windows(3)
        .enumerate()
        .filter(move |(_, w)| w[1] > w[0] && w[1] > w[2] && w[1] > floor)
        .map(|(i, w)| (i + 1, w[1]))
}

/// Interior samples strictly below both neighbours and below `ceiling`.
fn troughs(trace: &[f32], ceiling: f32) -> impl Iterator<Item = (usize, f32)> + '_ {
    trace
        .windows(3)
        .enumerate()
        .filter(move |(_, w)| w[1] < w[0] && w[1] < w[2] && w[1] < ceiling)
        .map(|(i, w)| (i + 1, w[1]))
}

/// Period and amplitude of the oscillation around `target`, if there is one.
///
/// At least two peaks and two troughs are needed.
pub fn find_oscillation(trace: &[f32], target: f32, threshold: f32) -> Option<Oscillation> {
    let floor = target + threshold;
    let ceiling = target - threshold;

    let peak_count = peaks(trace, floor).count();
    let trough_count = troughs(trace, ceiling).count();
    if peak_count < 2 || trough_count < 2 {
        return None;
    }

    let (spacing, _) = peaks(trace, floor).fold((0usize, None), |(sum, prev), (i, _)| {
        match prev {
            Some(p) => (sum + (i - p), Some(i)),
            None => (sum, Some(i)),
        }
    });
    let period = spacing as f32 / (peak_count - 1) as f32;

    let pairs = peak_count.min(trough_count);
    let swing: f32 = peaks(trace, floor)
        .zip(troughs(trace, ceiling))
        .map(|((_, p), (_, t))| libm::fabsf(p - t) / 2.0)
        .sum();
    let amplitude = swing / pairs as f32;

    Some(Oscillation { period, amplitude })
}

/// New gains for an observed oscillation, or `None` if the period is unusable.
pub fn adjust_gains(gains: Gains, oscillation: &Oscillation, config: &TuningConfig) -> Option<Gains> {
    let period = oscillation.period;
    if !(period.is_finite() && period > 0.0) {
        return None;
    }

    let kp = if oscillation.amplitude > config.acceptable_amplitude {
        gains.kp * config.gain_factor
    } else {
        gains.kp / config.gain_factor
    };
    let adjusted = Gains::new(kp, 2.0 * kp / period, kp * period / 8.0);
    adjusted.is_finite().then_some(adjusted)
}

/// Whether `trace` holds `samples` consecutive readings within `tolerance`.
pub fn is_stable(trace: &[f32], target: f32, tolerance: f32, samples: u32) -> bool {
    let mut run = 0u32;
    for &t in trace {
        if libm::fabsf(t - target) <= tolerance {
            run += 1;
            if run >= samples {
                return true;
            }
        } else {
            run = 0;
        }
    }
    false
}

#[derive(PartialEq)]
enum Phase {
    Done,
    Cancelled,
}

pub struct Autotuner<'a, S, H, const N: usize> {
    controller: &'a mut Controller<S, H, N>,
    config: TuningConfig,
    cancel: Option<&'a CancelToken>,
    trace: Vec<f32, MAX_WINDOW_SECS>,
    cycles: u32,
    skipped_steps: u32,
    oscillation: Option<Oscillation>,
}

impl<'a, S, H, const N: usize> Autotuner<'a, S, H, N>
where
    S: ThermistorInput,
    H: HeaterOutput,
{
    pub fn new(controller: &'a mut Controller<S, H, N>, config: TuningConfig) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            controller,
            config,
            cancel: None,
            trace: Vec::new(),
            cycles: 0,
            skipped_steps: 0,
            oscillation: None,
        })
    }

    pub fn with_cancel(mut self, token: &'a CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Samples of the most recent measurement window.
    pub fn trace(&self) -> &[f32] {
        &self.trace
    }

    /// Controller steps rejected during measurement so far.
    pub fn skipped_steps(&self) -> u32 {
        self.skipped_steps
    }

    /// Tune until stable, cancelled or out of cycles.
    ///
    /// The controller target is moved to the tuning target and stays there.
    /// The heater is off when this returns an error or a cancelled report.
    pub async fn run<C: Clock, D: DelayNs>(
        &mut self,
        clock: &mut C,
        delay: &mut D,
    ) -> Result<TuneReport, Error> {
        info!(
            "Autotune: target={} cycles={} window={}s",
            self.config.target, self.config.max_cycles, self.config.measure_secs
        );
        self.controller.set_target(self.config.target)?;

        let overflow = self.controller.history_overflow();
        self.controller.set_history_overflow(HistoryOverflow::Wrap);
        let result = self.run_cycles(clock, delay).await;
        self.controller.set_history_overflow(overflow);
        if overflow == HistoryOverflow::Reject && self.controller.state().history().is_full() {
            // a full history would reject the caller's next step
            self.controller.reset();
        }

        match &result {
            Ok(report) => {
                info!(
                    "Autotune: {:?} after {} cycles, Kp={} Ki={} Kd={}",
                    report.status, report.cycles, report.gains.kp, report.gains.ki, report.gains.kd
                );
                if report.status == TuneStatus::Cancelled {
                    self.controller.shutdown();
                }
            }
            Err(e) => {
                error!("Autotune: failed: {:?}", e);
                self.controller.shutdown();
            }
        }
        result
    }

    async fn run_cycles<C: Clock, D: DelayNs>(
        &mut self,
        clock: &mut C,
        delay: &mut D,
    ) -> Result<TuneReport, Error> {
        for cycle in 1..=self.config.max_cycles {
            self.cycles = cycle;
            debug!("Autotune: cycle {}", cycle);

            if self.force_to_target(clock, delay).await? == Phase::Cancelled {
                return Ok(self.report(TuneStatus::Cancelled));
            }
            if self.measure(clock, delay).await? == Phase::Cancelled {
                return Ok(self.report(TuneStatus::Cancelled));
            }

            match find_oscillation(&self.trace, self.config.target, self.config.peak_threshold) {
                Some(oscillation) => {
                    debug!(
                        "Autotune: period={} amplitude={}",
                        oscillation.period, oscillation.amplitude
                    );
                    self.oscillation = Some(oscillation);
                    match adjust_gains(self.controller.gains(), &oscillation, &self.config) {
                        Some(gains) => self.controller.set_gains(gains)?,
                        None => warn!("Autotune: unusable period, gains unchanged"),
                    }
                }
                None => debug!("Autotune: no oscillation, gains unchanged"),
            }

            if is_stable(
                &self.trace,
                self.config.target,
                self.config.stability_tolerance,
                self.config.stability_samples,
            ) {
                return Ok(self.report(TuneStatus::Converged));
            }
        }
        Ok(self.report(TuneStatus::Exhausted))
    }

    /// Full drive until the temperature reaches the target less the margin.
    async fn force_to_target<C: Clock, D: DelayNs>(
        &mut self,
        clock: &mut C,
        delay: &mut D,
    ) -> Result<Phase, Error> {
        let threshold = self.config.target - self.config.forcing_margin;
        let deadline = match self.config.forcing_timeout_secs {
            0 => None,
            secs => Some(clock.now() + Duration::from_secs(secs as u64)),
        };
        self.controller
            .force(HeaterDrive::full(self.controller.actuation()))?;

        let mut pacer = TickPacer::from_micros(self.config.step_interval_us);
        loop {
            if self.cancelled() {
                return Ok(Phase::Cancelled);
            }
            let reading = self.controller.read_temperature().await?;
            if reading.celsius >= threshold {
                return Ok(Phase::Done);
            }
            if let Some(deadline) = deadline {
                if clock.now() >= deadline {
                    return Err(Error::ForcingTimeout);
                }
            }
            pacer.wait(clock, delay).await;
        }
    }

    /// Regulate for one window, sampling once per slot.
    async fn measure<C: Clock, D: DelayNs>(
        &mut self,
        clock: &mut C,
        delay: &mut D,
    ) -> Result<Phase, Error> {
        self.trace.clear();
        let mut pacer = TickPacer::from_micros(self.config.step_interval_us);

        for _ in 0..self.config.measure_secs {
            if self.cancelled() {
                return Ok(Phase::Cancelled);
            }
            let reading = self.controller.read_temperature().await?;
            self.trace
                .push(reading.celsius)
                .map_err(|_| Error::InvalidConfig("measurement window too long"))?;

            for _ in 0..self.config.steps_per_sample {
                match self.controller.step().await {
                    Ok(_) => {}
                    Err(e @ (pid::Error::Sensor(_) | pid::Error::Heater)) => {
                        return Err(Error::Controller(e))
                    }
                    Err(e) => {
                        self.skipped_steps = self.skipped_steps.wrapping_add(1);
                        debug!("Autotune: step skipped: {:?}", e);
                    }
                }
                pacer.wait(clock, delay).await;
            }
        }
        Ok(Phase::Done)
    }

    fn cancelled(&self) -> bool {
        self.cancel.map_or(false, |token| token.is_cancelled())
    }

    fn report(&self, status: TuneStatus) -> TuneReport {
        TuneReport {
            status,
            cycles: self.cycles,
            gains: self.controller.gains(),
            oscillation: self.oscillation,
        }
    }
}
