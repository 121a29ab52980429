//! PID temperature controller for one heater.
//!
//! - Reads the thermistor, writes the heater, once per control tick
//! - Error history kept in a fixed-capacity buffer indexed by tick
//! - Integral is a plain running sum of the error (no dt scaling, no
//!   anti-windup), held in an `f64` and saturated at `f32::MAX`
//! - Derivative taken from a piecewise-linear reconstruction of the history
//! - Output drives a relay (threshold) or a PWM duty cycle
//!
//! Example
//! ```ignore
//! let config = ControllerConfig::default()
//!     .with_target(200.0)
//!     .with_gains(Gains::new(22.2, 1.08, 114.0))
//!     .with_actuation(Actuation::Duty);
//! let mut controller = Controller::new(thermistor, heater, config)?;
//!
//! loop {
//!     controller.step().await?;
//!     pacer.wait(&mut clock, &mut delay).await;
//! }
//! ```

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::heater::{HeaterDrive, HeaterOutput};
use crate::log::*;
use crate::thermistor::{self, SensorReading, Thermistor, ThermistorInput};

/// Error samples kept by a controller unless told otherwise.
pub const HISTORY_CAPACITY: usize = 1024;

/// Half-width of the window used to differentiate the error history.
const DERIVATIVE_DELTA: f64 = 1.0e-6;

const INTEGRAL_LIMIT: f64 = f32::MAX as f64;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Gains {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
}

impl Gains {
    pub const fn new(kp: f32, ki: f32, kd: f32) -> Self {
        Self { kp, ki, kd }
    }

    pub fn is_finite(&self) -> bool {
        self.kp.is_finite() && self.ki.is_finite() && self.kd.is_finite()
    }
}

/// How the control signal reaches the heater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[serde(rename_all = "snake_case")]
pub enum Actuation {
    /// On when the signal is above `trigger_threshold`.
    #[default]
    Relay,
    /// `signal / duty_scale`, clamped to 0..=1.
    Duty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[serde(rename_all = "snake_case")]
pub enum Derivative {
    /// Central difference over the interpolated history at `t ± δ`.
    ///
    /// The sample after `t` has not been recorded yet and reads as zero, so
    /// this comes out as `(0 - e[t-1]) / 2`. The stock gains assume it.
    #[default]
    Reconstructed,
    /// `e[t] - e[t-1]`.
    Backward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[serde(rename_all = "snake_case")]
pub enum HistoryOverflow {
    /// Refuse to step once the history is full.
    #[default]
    Reject,
    /// Overwrite the oldest sample.
    Wrap,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub target: f32,
    pub gains: Gains,
    pub actuation: Actuation,
    pub trigger_threshold: f32,
    pub duty_scale: f32,
    pub derivative: Derivative,
    pub history_overflow: HistoryOverflow,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            target: 0.0,
            gains: Gains::new(1.0, 0.0, 0.0),
            actuation: Actuation::Relay,
            trigger_threshold: 0.0,
            duty_scale: 1.0,
            derivative: Derivative::Reconstructed,
            history_overflow: HistoryOverflow::Reject,
        }
    }
}

impl ControllerConfig {
    pub fn with_target(mut self, target: f32) -> Self {
        self.target = target;
        self
    }

    pub fn with_gains(mut self, gains: Gains) -> Self {
        self.gains = gains;
        self
    }

    pub fn with_actuation(mut self, actuation: Actuation) -> Self {
        self.actuation = actuation;
        self
    }

    pub fn with_trigger_threshold(mut self, threshold: f32) -> Self {
        self.trigger_threshold = threshold;
        self
    }

    pub fn with_duty_scale(mut self, scale: f32) -> Self {
        self.duty_scale = scale;
        self
    }

    pub fn with_derivative(mut self, derivative: Derivative) -> Self {
        self.derivative = derivative;
        self
    }

    pub fn with_history_overflow(mut self, overflow: HistoryOverflow) -> Self {
        self.history_overflow = overflow;
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if !self.target.is_finite() {
            return Err(Error::InvalidConfig("target must be finite"));
        }
        if !self.gains.is_finite() {
            return Err(Error::InvalidGains);
        }
        if !self.trigger_threshold.is_finite() {
            return Err(Error::InvalidConfig("trigger_threshold must be finite"));
        }
        if !(self.duty_scale.is_finite() && self.duty_scale > 0.0) {
            return Err(Error::InvalidConfig("duty_scale must be positive"));
        }
        Ok(())
    }
}

/// Controller error
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    Sensor(thermistor::Error),
    Heater,
    HistoryFull { capacity: usize },
    NonFiniteReading,
    InvalidGains,
    InvalidConfig(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Sensor(e) => write!(f, "{}", e),
            Error::Heater => write!(f, "Heater output failed"),
            Error::HistoryFull { capacity } => {
                write!(f, "Error history full ({} samples)", capacity)
            }
            Error::NonFiniteReading => write!(f, "Non-finite temperature"),
            Error::InvalidGains => write!(f, "Gains must be finite"),
            Error::InvalidConfig(msg) => write!(f, "Invalid controller config: {}", msg),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Warning {
    /// `step` found the controller uninitialized and brought it back up.
    LazyInit,
}

/// Recorded errors, addressed by absolute tick.
#[derive(Debug, Clone)]
pub struct ErrorHistory<const N: usize> {
    samples: [f32; N],
    next_tick: u64,
    overflow: HistoryOverflow,
}

impl<const N: usize> ErrorHistory<N> {
    pub const fn new(overflow: HistoryOverflow) -> Self {
        Self {
            samples: [0.0; N],
            next_tick: 0,
            overflow,
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Tick the next sample will be recorded at.
    pub fn next_tick(&self) -> u64 {
        self.next_tick
    }

    pub fn overflow(&self) -> HistoryOverflow {
        self.overflow
    }

    pub fn set_overflow(&mut self, overflow: HistoryOverflow) {
        self.overflow = overflow;
    }

    pub fn is_full(&self) -> bool {
        self.next_tick >= N as u64
    }

    pub fn clear(&mut self) {
        self.samples = [0.0; N];
        self.next_tick = 0;
    }

    /// Store `error` at the next tick and return that tick.
    pub fn record(&mut self, error: f32) -> Result<u64, Error> {
        if N == 0 || (self.overflow == HistoryOverflow::Reject && self.is_full()) {
            return Err(Error::HistoryFull { capacity: N });
        }
        let tick = self.next_tick;
        self.samples[(tick % N as u64) as usize] = error;
        self.next_tick += 1;
        Ok(tick)
    }

    /// Sample at `tick`, or 0.0 if it was never recorded or has been
    /// overwritten.
    pub fn value_at(&self, tick: i64) -> f32 {
        if tick < 0 || N == 0 {
            return 0.0;
        }
        let tick = tick as u64;
        if tick >= self.next_tick || self.next_tick - tick > N as u64 {
            return 0.0;
        }
        self.samples[(tick % N as u64) as usize]
    }

    /// Piecewise-linear reconstruction of the history at fractional tick `x`.
    pub fn reconstruct(&self, x: f64) -> f64 {
        let lo = libm::floor(x);
        let frac = x - lo;
        let lo = lo as i64;
        let a = self.value_at(lo) as f64;
        let b = self.value_at(lo + 1) as f64;
        a + (b - a) * frac
    }

    /// Central difference of the reconstruction around `tick`.
    pub fn reconstructed_slope(&self, tick: u64) -> f64 {
        let x1 = tick as f64 - DERIVATIVE_DELTA;
        let x2 = tick as f64 + DERIVATIVE_DELTA;
        (self.reconstruct(x2) - self.reconstruct(x1)) / (x2 - x1)
    }

    pub fn backward_difference(&self, tick: u64) -> f64 {
        if tick == 0 {
            return 0.0;
        }
        self.value_at(tick as i64) as f64 - self.value_at(tick as i64 - 1) as f64
    }
}

/// Everything a control loop mutates between ticks.
#[derive(Debug, Clone)]
pub struct ControllerState<const N: usize = HISTORY_CAPACITY> {
    target: f32,
    gains: Gains,
    history: ErrorHistory<N>,
    integral: f64,
    initialized: bool,
}

impl<const N: usize> ControllerState<N> {
    fn new(config: &ControllerConfig) -> Self {
        Self {
            target: config.target,
            gains: config.gains,
            history: ErrorHistory::new(config.history_overflow),
            integral: 0.0,
            initialized: true,
        }
    }

    pub fn target(&self) -> f32 {
        self.target
    }

    pub fn gains(&self) -> Gains {
        self.gains
    }

    pub fn history(&self) -> &ErrorHistory<N> {
        &self.history
    }

    pub fn tick_index(&self) -> u64 {
        self.history.next_tick()
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}

pub struct Controller<S, H, const N: usize = HISTORY_CAPACITY> {
    thermistor: Thermistor<S>,
    heater: H,
    actuation: Actuation,
    trigger_threshold: f32,
    duty_scale: f32,
    derivative: Derivative,
    state: ControllerState<N>,
    last_signal: f32,
    last_drive: Option<HeaterDrive>,
    last_reading: Option<SensorReading>,
    last_error: Option<Error>,
    warning: Option<Warning>,
}

impl<S, H, const N: usize> Controller<S, H, N>
where
    S: ThermistorInput,
    H: HeaterOutput,
{
    /// Take ownership of an initialized thermistor and heater. The heater is
    /// switched off before the first tick.
    pub fn new(
        thermistor: Thermistor<S>,
        mut heater: H,
        config: ControllerConfig,
    ) -> Result<Self, Error> {
        config.validate()?;
        heater
            .set_output(HeaterDrive::off(config.actuation))
            .map_err(|_| Error::Heater)?;
        info!(
            "Controller: target={} Kp={} Ki={} Kd={}",
            config.target, config.gains.kp, config.gains.ki, config.gains.kd
        );
        Ok(Self {
            thermistor,
            heater,
            actuation: config.actuation,
            trigger_threshold: config.trigger_threshold,
            duty_scale: config.duty_scale,
            derivative: config.derivative,
            state: ControllerState::new(&config),
            last_signal: 0.0,
            last_drive: Some(HeaterDrive::off(config.actuation)),
            last_reading: None,
            last_error: None,
            warning: None,
        })
    }

    /// One control tick: read, compute, drive.
    pub async fn step(&mut self) -> Result<f32, Error> {
        if !self.state.initialized {
            warn!("Controller: stepped while uninitialized, re-initializing");
            self.warning = Some(Warning::LazyInit);
            self.reinitialize().await?;
        }
        let reading = self.read_temperature().await?;
        let signal = self.compute(reading.celsius)?;
        self.apply(signal)?;
        Ok(signal)
    }

    /// PID arithmetic for one tick without touching hardware.
    ///
    /// Nothing is mutated when the tick is rejected.
    pub fn compute(&mut self, temperature: f32) -> Result<f32, Error> {
        let error = self.state.target - temperature;
        if !temperature.is_finite() || !error.is_finite() {
            return Err(self.fail(Error::NonFiniteReading));
        }

        let tick = match self.state.history.record(error) {
            Ok(tick) => tick,
            Err(e) => return Err(self.fail(e)),
        };

        let derivative = match self.derivative {
            Derivative::Reconstructed => self.state.history.reconstructed_slope(tick),
            Derivative::Backward => self.state.history.backward_difference(tick),
        };

        self.state.integral =
            (self.state.integral + error as f64).clamp(-INTEGRAL_LIMIT, INTEGRAL_LIMIT);

        let gains = self.state.gains;
        let signal = gains.kp as f64 * error as f64
            + gains.ki as f64 * self.state.integral
            + gains.kd as f64 * derivative;
        let signal = signal.clamp(-INTEGRAL_LIMIT, INTEGRAL_LIMIT) as f32;

        self.last_signal = signal;
        Ok(signal)
    }

    /// Forward a control signal to the heater.
    pub fn apply(&mut self, signal: f32) -> Result<HeaterDrive, Error> {
        let drive = match self.actuation {
            Actuation::Relay => HeaterDrive::Relay(signal > self.trigger_threshold),
            Actuation::Duty => {
                let duty = signal / self.duty_scale;
                HeaterDrive::Duty(if duty.is_nan() { 0.0 } else { duty.clamp(0.0, 1.0) })
            }
        };
        self.force(drive)?;
        Ok(drive)
    }

    /// Drive the heater directly, bypassing the PID.
    pub fn force(&mut self, drive: HeaterDrive) -> Result<(), Error> {
        if self.heater.set_output(drive).is_err() {
            error!("Controller: heater output failed");
            return Err(self.fault(Error::Heater));
        }
        self.last_drive = Some(drive);
        Ok(())
    }

    /// Switch the heater off. Failures are only recorded.
    pub fn shutdown(&mut self) {
        let off = HeaterDrive::off(self.actuation);
        match self.heater.set_output(off) {
            Ok(()) => self.last_drive = Some(off),
            Err(_) => {
                error!("Controller: failed to switch heater off");
                self.last_error = Some(Error::Heater);
            }
        }
    }

    pub async fn read_temperature(&mut self) -> Result<SensorReading, Error> {
        match self.thermistor.read().await {
            Ok(reading) => {
                self.last_reading = Some(reading);
                Ok(reading)
            }
            Err(e) => Err(self.fault(Error::Sensor(e))),
        }
    }

    /// Bring the sensor back up after a fault.
    pub async fn reinitialize(&mut self) -> Result<(), Error> {
        if let Err(e) = self.thermistor.reinitialize().await {
            return Err(self.fail(Error::Sensor(e)));
        }
        self.state.initialized = true;
        info!("Controller: initialized");
        Ok(())
    }

    /// Mark the controller as needing re-initialization before the next step.
    pub fn invalidate(&mut self) {
        self.state.initialized = false;
    }

    /// Clear history and integral. Target and gains are kept.
    pub fn reset(&mut self) {
        self.state.history.clear();
        self.state.integral = 0.0;
        self.last_signal = 0.0;
    }

    pub fn set_target(&mut self, target: f32) -> Result<(), Error> {
        if !target.is_finite() {
            return Err(self.fail(Error::InvalidConfig("target must be finite")));
        }
        self.state.target = target;
        Ok(())
    }

    pub fn set_gains(&mut self, gains: Gains) -> Result<(), Error> {
        if !gains.is_finite() {
            return Err(self.fail(Error::InvalidGains));
        }
        self.state.gains = gains;
        Ok(())
    }

    pub fn set_history_overflow(&mut self, overflow: HistoryOverflow) {
        self.state.history.set_overflow(overflow);
    }

    pub fn history_overflow(&self) -> HistoryOverflow {
        self.state.history.overflow()
    }

    pub fn state(&self) -> &ControllerState<N> {
        &self.state
    }

    pub fn target(&self) -> f32 {
        self.state.target
    }

    pub fn gains(&self) -> Gains {
        self.state.gains
    }

    pub fn actuation(&self) -> Actuation {
        self.actuation
    }

    pub fn last_signal(&self) -> f32 {
        self.last_signal
    }

    pub fn last_drive(&self) -> Option<HeaterDrive> {
        self.last_drive
    }

    pub fn last_reading(&self) -> Option<SensorReading> {
        self.last_reading
    }

    pub fn last_error(&self) -> Option<Error> {
        self.last_error
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    pub fn take_warning(&mut self) -> Option<Warning> {
        self.warning.take()
    }

    pub fn thermistor_mut(&mut self) -> &mut Thermistor<S> {
        &mut self.thermistor
    }

    pub fn heater_mut(&mut self) -> &mut H {
        &mut self.heater
    }

    fn fail(&mut self, e: Error) -> Error {
        self.last_error = Some(e);
        e
    }

    /// Hardware fault: heater off, and the next step re-initializes.
    fn fault(&mut self, e: Error) -> Error {
        self.state.initialized = false;
        let _ = self.heater.set_output(HeaterDrive::off(self.actuation));
        self.fail(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thermistor::{Divider, NTC_100K};
    use embassy_futures::block_on;

    struct TableInput {
        raw: u16,
        fail: bool,
    }

    impl ThermistorInput for TableInput {
        type Error = ();

        async fn read_raw(&mut self) -> Result<u16, ()> {
            if self.fail {
                Err(())
            } else {
                Ok(self.raw)
            }
        }
    }

    #[derive(Default)]
    struct RecordingHeater {
        drive: Option<HeaterDrive>,
        fail: bool,
    }

    impl HeaterOutput for RecordingHeater {
        type Error = ();

        fn set_output(&mut self, drive: HeaterDrive) -> Result<(), ()> {
            if self.fail {
                return Err(());
            }
            self.drive = Some(drive);
            Ok(())
        }
    }

    fn raw_at(celsius: f32) -> u16 {
        Divider::default().raw_for_kilohms(NTC_100K.resistance_at(celsius))
    }

    fn controller<const N: usize>(
        config: ControllerConfig,
    ) -> Controller<TableInput, RecordingHeater, N> {
        let input = TableInput {
            raw: raw_at(25.0),
            fail: false,
        };
        let thermistor = block_on(Thermistor::new(input, Divider::default(), NTC_100K)).unwrap();
        Controller::new(thermistor, RecordingHeater::default(), config).unwrap()
    }

    #[test]
    fn proportional_and_integral_terms() {
        let config = ControllerConfig::default()
            .with_target(100.0)
            .with_gains(Gains::new(2.0, 0.5, 0.0));
        let mut pid = controller::<16>(config);
        // error 10, integral 10
        assert_eq!(pid.compute(90.0).unwrap(), 2.0 * 10.0 + 0.5 * 10.0);
        // error 5, integral 15
        assert_eq!(pid.compute(95.0).unwrap(), 2.0 * 5.0 + 0.5 * 15.0);
        assert_eq!(pid.state().tick_index(), 2);
        assert_eq!(pid.state().integral(), 15.0);
    }

    #[test]
    fn zero_error_leaves_only_integral() {
        let config = ControllerConfig::default()
            .with_target(50.0)
            .with_gains(Gains::new(3.0, 0.25, 7.0));
        let mut pid = controller::<64>(config);
        for _ in 0..5 {
            assert_eq!(pid.compute(50.0).unwrap(), 0.0);
        }

        pid.compute(45.0).unwrap();
        pid.compute(45.0).unwrap();
        assert_eq!(pid.state().integral(), 10.0);

        // the first settled tick still sees the previous error in D
        pid.compute(50.0).unwrap();
        for _ in 0..5 {
            let signal = pid.compute(50.0).unwrap();
            assert!((signal - 0.25 * 10.0).abs() < 1e-4, "{}", signal);
        }
    }

    #[test]
    fn reconstructed_derivative_uses_neighbours() {
        let config = ControllerConfig::default()
            .with_target(0.0)
            .with_gains(Gains::new(0.0, 0.0, 1.0));
        let mut pid = controller::<16>(config);
        // errors: 4 then 6
        assert!(pid.compute(-4.0).unwrap().abs() < 1e-4);
        let d = pid.compute(-6.0).unwrap();
        // (e[t+1] - e[t-1]) / 2 with e[t+1] unrecorded
        assert!((d - -2.0).abs() < 1e-3, "{}", d);
    }

    #[test]
    fn backward_derivative_is_discrete_difference() {
        let config = ControllerConfig::default()
            .with_target(0.0)
            .with_gains(Gains::new(0.0, 0.0, 1.0))
            .with_derivative(Derivative::Backward);
        let mut pid = controller::<16>(config);
        assert_eq!(pid.compute(-4.0).unwrap(), 0.0);
        assert_eq!(pid.compute(-6.0).unwrap(), 2.0);
    }

    #[test]
    fn full_history_rejects_step() {
        let mut pid = controller::<HISTORY_CAPACITY>(ControllerConfig::default());
        for _ in 0..HISTORY_CAPACITY {
            pid.compute(1.0).unwrap();
        }
        let integral = pid.state().integral();
        assert_eq!(
            pid.compute(1.0),
            Err(Error::HistoryFull {
                capacity: HISTORY_CAPACITY
            })
        );
        assert_eq!(pid.state().tick_index(), HISTORY_CAPACITY as u64);
        assert_eq!(pid.state().integral(), integral);
        assert_eq!(
            pid.last_error(),
            Some(Error::HistoryFull {
                capacity: HISTORY_CAPACITY
            })
        );
    }

    #[test]
    fn wrapping_history_keeps_going() {
        let config = ControllerConfig::default().with_history_overflow(HistoryOverflow::Wrap);
        let mut pid = controller::<4>(config);
        for i in 0..10 {
            pid.compute(i as f32).unwrap();
        }
        let history = pid.state().history();
        assert_eq!(history.next_tick(), 10);
        assert_eq!(history.value_at(9), -9.0);
        assert_eq!(history.value_at(6), -6.0);
        // overwritten
        assert_eq!(history.value_at(5), 0.0);
    }

    #[test]
    fn reset_clears_history_and_integral() {
        let mut pid = controller::<4>(ControllerConfig::default().with_target(10.0));
        pid.compute(0.0).unwrap();
        pid.compute(0.0).unwrap();
        pid.reset();
        assert_eq!(pid.state().tick_index(), 0);
        assert_eq!(pid.state().integral(), 0.0);
        assert_eq!(pid.target(), 10.0);
    }

    #[test]
    fn integral_saturates_instead_of_overflowing() {
        let config = ControllerConfig::default()
            .with_target(3.0e38)
            .with_gains(Gains::new(0.0, 1.0, 0.0));
        let mut pid = controller::<8>(config);
        for _ in 0..4 {
            pid.compute(0.0).unwrap();
        }
        assert_eq!(pid.state().integral(), f32::MAX as f64);
        assert!(pid.last_signal().is_finite());
    }

    #[test]
    fn non_finite_reading_is_rejected() {
        let mut pid = controller::<8>(ControllerConfig::default());
        assert_eq!(pid.compute(f32::NAN), Err(Error::NonFiniteReading));
        assert_eq!(pid.state().tick_index(), 0);
    }

    #[test]
    fn relay_actuation_uses_threshold() {
        let config = ControllerConfig::default()
            .with_target(100.0)
            .with_trigger_threshold(5.0);
        let mut pid = controller::<8>(config);
        assert_eq!(pid.apply(6.0).unwrap(), HeaterDrive::Relay(true));
        assert_eq!(pid.apply(5.0).unwrap(), HeaterDrive::Relay(false));
        assert_eq!(pid.heater_mut().drive, Some(HeaterDrive::Relay(false)));
    }

    #[test]
    fn duty_actuation_is_clamped() {
        let config = ControllerConfig::default()
            .with_actuation(Actuation::Duty)
            .with_duty_scale(100.0);
        let mut pid = controller::<8>(config);
        assert_eq!(pid.apply(25.0).unwrap(), HeaterDrive::Duty(0.25));
        assert_eq!(pid.apply(250.0).unwrap(), HeaterDrive::Duty(1.0));
        assert_eq!(pid.apply(-3.0).unwrap(), HeaterDrive::Duty(0.0));
    }

    #[test]
    fn step_reads_sensor_and_drives_heater() {
        let config = ControllerConfig::default()
            .with_target(60.0)
            .with_gains(Gains::new(1.0, 0.0, 0.0));
        let mut pid = controller::<8>(config);
        let signal = block_on(pid.step()).unwrap();
        // ~35 degrees below target
        assert!((signal - 35.0).abs() < 0.5, "{}", signal);
        assert_eq!(pid.heater_mut().drive, Some(HeaterDrive::Relay(true)));
    }

    #[test]
    fn sensor_fault_turns_heater_off_until_reinit() {
        let config = ControllerConfig::default().with_target(60.0);
        let mut pid = controller::<8>(config);
        block_on(pid.step()).unwrap();

        pid.thermistor_mut().input_mut().fail = true;
        assert_eq!(
            block_on(pid.step()),
            Err(Error::Sensor(thermistor::Error::Read))
        );
        assert!(!pid.state().is_initialized());
        assert_eq!(pid.heater_mut().drive, Some(HeaterDrive::Relay(false)));

        pid.thermistor_mut().input_mut().fail = false;
        block_on(pid.step()).unwrap();
        assert_eq!(pid.take_warning(), Some(Warning::LazyInit));
        assert!(pid.state().is_initialized());
        assert_eq!(pid.take_warning(), None);
    }

    #[test]
    fn heater_fault_is_reported() {
        let mut pid = controller::<8>(ControllerConfig::default().with_target(60.0));
        pid.heater_mut().fail = true;
        assert_eq!(block_on(pid.step()), Err(Error::Heater));
        assert_eq!(pid.last_error(), Some(Error::Heater));
        assert!(!pid.state().is_initialized());
    }

    #[test]
    fn invalid_gains_are_refused() {
        let mut pid = controller::<8>(ControllerConfig::default());
        assert_eq!(
            pid.set_gains(Gains::new(f32::INFINITY, 0.0, 0.0)),
            Err(Error::InvalidGains)
        );
        assert_eq!(pid.gains(), Gains::new(1.0, 0.0, 0.0));

        let bad = ControllerConfig::default().with_duty_scale(0.0);
        assert!(bad.validate().is_err());
    }
}
