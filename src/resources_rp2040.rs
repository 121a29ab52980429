use assign_resources::assign_resources;
use embassy_rp::adc::{self, Adc};
use embassy_rp::peripherals;
use embassy_rp::Peri;
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::mutex::Mutex;

/// Both thermistors hang off the one ADC.
pub type AdcBus = Mutex<NoopRawMutex, Adc<'static, adc::Async>>;

assign_resources! {
    adc: AdcResources {
        adc: ADC,
    },
    hotend: HotendResources {
        thermistor: PIN_26,
        pwm: PWM_SLICE0,
        gate: PIN_16,
    },
    bed: BedResources {
        thermistor: PIN_27,
        gate: PIN_18,
    },
    usb: USBResources {
        usb: USB,
    },
}
