//! Simulated heater and thermistor for host runs and tests.
//!
//! Time is virtual: awaiting [`SimDelay`] integrates the plant forward, so a
//! two minute tuning window runs as fast as the PID math allows.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_time::{Duration, Instant};
use embedded_hal_async::delay::DelayNs;

use crate::clock::Clock;
use crate::heater::{HeaterDrive, HeaterOutput};
use crate::log::*;
use crate::thermistor::{Divider, ThermistorInput, ThermistorTable, NTC_100K};

/// Anything whose temperature responds to heater power over time.
pub trait Plant {
    /// Integrate `dt_s` seconds at `power` (0..=1).
    fn advance(&mut self, dt_s: f32, power: f32);
    fn temperature(&self) -> f32;
}

/// First-order heater block losing heat to ambient.
#[derive(Debug, Clone)]
pub struct ThermalModel {
    pub temperature: f32,
    pub ambient: f32,
    /// degrees C/second at 100% power
    pub max_heating_rate: f32,
    /// Factor affecting heat retention (0-1)
    pub thermal_mass: f32,
    /// Heat loss to ambient per degree difference
    pub heat_loss_coefficient: f32,
    /// Time constant between the gate switching and heat reaching the sensor
    pub lag_s: f32,
    delivered: f32,
}

impl ThermalModel {
    pub fn new(ambient: f32) -> Self {
        Self {
            temperature: ambient,
            ambient,
            max_heating_rate: 3.0,
            thermal_mass: 0.3,
            heat_loss_coefficient: 0.1,
            lag_s: 0.0,
            delivered: 0.0,
        }
    }

    /// Small aluminium block with a cartridge heater.
    pub fn hotend() -> Self {
        Self {
            max_heating_rate: 12.0,
            thermal_mass: 0.5,
            heat_loss_coefficient: 0.04,
            lag_s: 2.0,
            ..Self::new(25.0)
        }
    }

    /// Large slow plate.
    pub fn bed() -> Self {
        Self {
            max_heating_rate: 2.0,
            thermal_mass: 0.4,
            heat_loss_coefficient: 0.02,
            lag_s: 6.0,
            ..Self::new(25.0)
        }
    }

    /// Temperature the block settles at when held at `power`.
    pub fn equilibrium(&self, power: f32) -> f32 {
        self.ambient + self.max_heating_rate * power / self.heat_loss_coefficient
    }
}

impl Plant for ThermalModel {
    fn advance(&mut self, dt_s: f32, power: f32) {
        if dt_s <= 0.0 {
            return;
        }
        if self.lag_s > 0.0 {
            let k = (dt_s / self.lag_s).min(1.0);
            self.delivered += (power - self.delivered) * k;
        } else {
            self.delivered = power;
        }

        // Heat input from heater (degrees per second)
        let heat_input = self.max_heating_rate * self.delivered;
        // Heat loss to ambient (Newton's law of cooling)
        let heat_loss = self.heat_loss_coefficient * (self.temperature - self.ambient);
        // Net temperature change considering thermal mass
        self.temperature += (heat_input - heat_loss) * self.thermal_mass * dt_s;

        if self.temperature < self.ambient {
            self.temperature = self.ambient;
        }
    }

    fn temperature(&self) -> f32 {
        self.temperature
    }
}

/// Longest single integration step; longer delays are split.
const MAX_STEP_US: u64 = 10_000;

struct SimState<P> {
    plant: P,
    now_us: u64,
    power: f32,
    sensor_fault: bool,
}

pub struct SimulatedHeater<P = ThermalModel> {
    state: Mutex<NoopRawMutex, RefCell<SimState<P>>>,
    divider: Divider,
    table: ThermistorTable<'static>,
}

impl<P: Plant> SimulatedHeater<P> {
    pub fn new(plant: P) -> Self {
        Self {
            state: Mutex::new(RefCell::new(SimState {
                plant,
                now_us: 0,
                power: 0.0,
                sensor_fault: false,
            })),
            divider: Divider::default(),
            table: NTC_100K,
        }
    }

    pub fn with_divider(mut self, divider: Divider) -> Self {
        self.divider = divider;
        self
    }

    pub fn divider(&self) -> Divider {
        self.divider
    }

    pub fn thermistor_input(&self) -> SimThermistor<'_, P> {
        SimThermistor { sim: self }
    }

    pub fn output(&self) -> SimOutput<'_, P> {
        SimOutput { sim: self }
    }

    pub fn clock(&self) -> SimClock<'_, P> {
        SimClock { sim: self }
    }

    pub fn delay(&self) -> SimDelay<'_, P> {
        SimDelay { sim: self }
    }

    pub fn temperature(&self) -> f32 {
        self.with(|s| s.plant.temperature())
    }

    pub fn power(&self) -> f32 {
        self.with(|s| s.power)
    }

    pub fn now(&self) -> Instant {
        Instant::from_micros(self.with(|s| s.now_us))
    }

    /// Make the next reads fail, as a disconnected ADC would.
    pub fn set_sensor_fault(&self, fault: bool) {
        self.with(|s| s.sensor_fault = fault);
    }

    pub fn advance(&self, dt: Duration) {
        let mut remaining = dt.as_micros();
        self.with(|s| {
            while remaining > 0 {
                let step = remaining.min(MAX_STEP_US);
                let power = s.power;
                s.plant.advance(step as f32 / 1_000_000.0, power);
                s.now_us += step;
                remaining -= step;
            }
        });
    }

    fn with<R>(&self, f: impl FnOnce(&mut SimState<P>) -> R) -> R {
        self.state.lock(|cell| f(&mut cell.borrow_mut()))
    }
}

pub struct SimThermistor<'a, P> {
    sim: &'a SimulatedHeater<P>,
}

impl<P: Plant> ThermistorInput for SimThermistor<'_, P> {
    type Error = ();

    async fn read_raw(&mut self) -> Result<u16, ()> {
        let (celsius, fault) = self.sim.with(|s| (s.plant.temperature(), s.sensor_fault));
        if fault {
            return Err(());
        }
        let kilohms = self.sim.table.resistance_at(celsius);
        Ok(self.sim.divider.raw_for_kilohms(kilohms))
    }
}

pub struct SimOutput<'a, P> {
    sim: &'a SimulatedHeater<P>,
}

impl<P: Plant> HeaterOutput for SimOutput<'_, P> {
    type Error = core::convert::Infallible;

    fn set_output(&mut self, drive: HeaterDrive) -> Result<(), Self::Error> {
        let power = drive.fraction();
        self.sim.with(|s| s.power = power);
        Ok(())
    }
}

pub struct SimClock<'a, P> {
    sim: &'a SimulatedHeater<P>,
}

impl<P: Plant> Clock for SimClock<'_, P> {
    fn now(&mut self) -> Instant {
        self.sim.now()
    }
}

pub struct SimDelay<'a, P> {
    sim: &'a SimulatedHeater<P>,
}

impl<P: Plant> DelayNs for SimDelay<'_, P> {
    async fn delay_ns(&mut self, ns: u32) {
        self.sim.advance(Duration::from_micros(ns as u64 / 1_000));
    }

    async fn delay_us(&mut self, us: u32) {
        self.sim.advance(Duration::from_micros(us as u64));
    }

    async fn delay_ms(&mut self, ms: u32) {
        self.sim.advance(Duration::from_millis(ms as u64));
    }
}

/// Log a one-line summary of the plant, handy at the end of a host run.
pub fn log_state<P: Plant>(sim: &SimulatedHeater<P>) {
    info!(
        "Simulation: t={}s temp={} power={}",
        sim.now().as_millis() as f32 / 1000.0,
        sim.temperature(),
        sim.power()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thermistor::{Thermistor, NTC_100K};
    use embassy_futures::block_on;

    #[test]
    fn full_power_heats_towards_equilibrium() {
        let sim = SimulatedHeater::new(ThermalModel::hotend());
        let mut out = sim.output();
        out.set_output(HeaterDrive::Relay(true)).unwrap();
        sim.advance(Duration::from_secs(30));
        let warm = sim.temperature();
        assert!(warm > 100.0, "{}", warm);

        sim.advance(Duration::from_secs(600));
        let eq = ThermalModel::hotend().equilibrium(1.0);
        assert!((sim.temperature() - eq).abs() < 1.0);
        assert_eq!(sim.now().as_secs(), 630);
    }

    #[test]
    fn cools_back_to_ambient_and_no_further() {
        let mut model = ThermalModel::bed();
        model.temperature = 80.0;
        let sim = SimulatedHeater::new(model);
        sim.advance(Duration::from_secs(3_600));
        assert!((sim.temperature() - 25.0).abs() < 0.5);
        assert!(sim.temperature() >= 25.0);
    }

    #[test]
    fn delay_advances_virtual_time() {
        let sim = SimulatedHeater::new(ThermalModel::new(25.0));
        let mut delay = sim.delay();
        let mut clock = sim.clock();
        let start = clock.now();
        block_on(delay.delay_ms(1500));
        assert_eq!((clock.now() - start).as_millis(), 1500);
    }

    #[test]
    fn thermistor_reads_plant_temperature() {
        let mut model = ThermalModel::new(25.0);
        model.temperature = 182.0;
        let sim = SimulatedHeater::new(model);
        let mut thermistor =
            block_on(Thermistor::new(sim.thermistor_input(), sim.divider(), NTC_100K)).unwrap();
        let reading = block_on(thermistor.read()).unwrap();
        assert!((reading.celsius - 182.0).abs() < 1.5, "{}", reading.celsius);

        sim.set_sensor_fault(true);
        assert!(block_on(thermistor.read()).is_err());
    }
}
