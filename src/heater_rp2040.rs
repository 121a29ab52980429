use embassy_rp::gpio::{Level, Output, Pin};
use embassy_rp::pwm::{self, ChannelAPin, Pwm, PwmOutput, Slice};
use embassy_rp::Peri;
use fixed::traits::ToFixed;

use crate::heater::{PwmHeater, RelayHeater};
use crate::log::*;

/// 125 MHz / 25 / 50_000 = 100 Hz on the MOSFET gate.
const PWM_DIVIDER: u8 = 25;
const PWM_TOP: u16 = 49_999;

fn gate_config() -> pwm::Config {
    let mut config = pwm::Config::default();
    config.divider = PWM_DIVIDER.to_fixed();
    config.top = PWM_TOP;
    config.compare_a = 0;
    config
}

/// Heater gate on channel A of a PWM slice, starting off.
pub fn pwm_heater<T: Slice>(
    slice: Peri<'static, T>,
    gate: Peri<'static, impl ChannelAPin<T>>,
) -> Option<PwmHeater<PwmOutput<'static>>> {
    let pwm = Pwm::new_output_a(slice, gate, gate_config());
    match pwm.split() {
        (Some(output), _) => Some(PwmHeater::new(output)),
        _ => {
            error!("Heater: PWM channel A unavailable");
            None
        }
    }
}

/// Heater gate on a plain GPIO, starting off.
pub fn relay_heater(gate: Peri<'static, impl Pin>) -> RelayHeater<Output<'static>> {
    RelayHeater::new(Output::new(gate, Level::Low))
}
