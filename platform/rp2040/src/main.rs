#![no_std]
#![no_main]

use defmt::*;
use embassy_executor::Spawner;
use embassy_rp::adc::{self, Adc};
use embassy_rp::bind_interrupts;
use embassy_sync::mutex::Mutex;
use embassy_time::Delay;
use static_cell::StaticCell;
use {defmt_rtt as _, panic_probe as _};

use forge_heater::clock::EmbassyClock;
use forge_heater::config::HeaterConfig;
use forge_heater::heater_controller::HeaterController;
use forge_heater::heater_rp2040::{pwm_heater, relay_heater};
use forge_heater::resources::{AdcBus, AssignedResources, BedResources, HotendResources};
use forge_heater::split_resources;
use forge_heater::thermistor_rp2040::AdcThermistor;
use forge_heater::usb_interface::usb_task;
use forge_heater::{BED, HOTEND, VERSION};

bind_interrupts!(struct Irqs {
    ADC_IRQ_FIFO => adc::InterruptHandler;
});

#[embassy_executor::task]
async fn hotend_task(adc: &'static AdcBus, r: HotendResources) {
    let Some(heater) = pwm_heater(r.pwm, r.gate) else {
        return;
    };
    let input = AdcThermistor::new(adc, r.thermistor);
    let config = HeaterConfig::hotend();
    match HeaterController::from_config(input, heater, config, EmbassyClock, Delay, &HOTEND).await {
        Ok(mut controller) => controller.run().await,
        Err(e) => error!("Hotend: bring-up failed: {:?}", e),
    }
}

#[embassy_executor::task]
async fn bed_task(adc: &'static AdcBus, r: BedResources) {
    let heater = relay_heater(r.gate);
    let input = AdcThermistor::new(adc, r.thermistor);
    let config = HeaterConfig::bed();
    match HeaterController::from_config(input, heater, config, EmbassyClock, Delay, &BED).await {
        Ok(mut controller) => controller.run().await,
        Err(e) => error!("Bed: bring-up failed: {:?}", e),
    }
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    let p = embassy_rp::init(Default::default());
    let r = split_resources!(p);
    info!("forge-heater {}", VERSION);

    // Shared ADC
    let adc = Adc::new(r.adc.adc, Irqs, adc::Config::default());
    static ADC_BUS: StaticCell<AdcBus> = StaticCell::new();
    let adc_bus = ADC_BUS.init(Mutex::new(adc));

    spawner.spawn(unwrap!(usb_task(spawner, r.usb)));
    spawner.spawn(unwrap!(hotend_task(adc_bus, r.hotend)));
    spawner.spawn(unwrap!(bed_task(adc_bus, r.bed)));
}
