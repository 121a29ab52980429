use embassy_rp::adc::{self, Channel};
use embassy_rp::gpio::Pull;
use embassy_rp::Peri;
use embassy_time::Timer;

use crate::log::*;
use crate::resources_rp2040::AdcBus;
use crate::thermistor::ThermistorInput;

/// Divider settling time after power-up.
const SETTLE_MS: u64 = 100;

/// Thermistor divider on one ADC pin.
pub struct AdcThermistor {
    bus: &'static AdcBus,
    channel: Channel<'static>,
}

impl AdcThermistor {
    pub fn new(bus: &'static AdcBus, pin: Peri<'static, impl adc::AdcPin>) -> Self {
        Self {
            bus,
            channel: Channel::new_pin(pin, Pull::None),
        }
    }
}

impl ThermistorInput for AdcThermistor {
    type Error = adc::Error;

    async fn init(&mut self) -> Result<(), adc::Error> {
        Timer::after_millis(SETTLE_MS).await;
        // a first conversion shakes out a dead channel before the loop starts
        let raw = self.read_raw().await?;
        debug!("Thermistor: first conversion {}", raw);
        Ok(())
    }

    async fn read_raw(&mut self) -> Result<u16, adc::Error> {
        let mut adc = self.bus.lock().await;
        adc.read(&mut self.channel).await
    }
}
