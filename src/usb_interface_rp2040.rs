use embassy_rp::bind_interrupts;
use embassy_rp::peripherals::USB;
use embassy_rp::rom_data::reset_to_usb_boot;

use embassy_rp::usb::{Driver, InterruptHandler};
use embassy_usb_logger::ReceiverHandler;
use heapless::String;

use core::str;
use embassy_executor::Spawner;
use embassy_time::Timer;
use serde_json_core::ser::to_string;

use crate::command::{dispatch, parse_addressed};
use crate::heater_controller::HeaterStatus;
use crate::resources_rp2040::USBResources;
use crate::{BED, HOTEND};

// USB interrupt binding
bind_interrupts!(struct Irqs {
    USBCTRL_IRQ => InterruptHandler<USB>;
});

const STATUS_PERIOD_SECS: u64 = 1;

pub fn to_json_heapless(status: &HeaterStatus) -> Option<String<512>> {
    to_string(status).ok()
}

struct Handler;

impl ReceiverHandler for Handler {
    async fn handle_data(&self, data: &[u8]) {
        let Ok(data) = str::from_utf8(data) else {
            defmt::warn!("USB: non-UTF-8 input dropped");
            return;
        };
        let data = data.trim();

        // elf2uf2-term -t sends this when the monitor closes; reboot into the bootloader
        if data == "q" || data == "elf2uf2-term" {
            reset_to_usb_boot(0, 0);
            return;
        }

        match parse_addressed(data) {
            Ok((heater, command)) => {
                defmt::info!("USB: {:?} -> {:?}", command, heater);
                if let Err(e) = dispatch(command, heater.links()) {
                    defmt::warn!("USB: command dropped: {:?}", e);
                }
            }
            Err(e) => defmt::warn!("USB: {:?}: {}", e, data),
        }
    }

    fn new() -> Self {
        Self
    }
}

#[embassy_executor::task]
async fn logger_task(driver: Driver<'static, USB>) {
    embassy_usb_logger::run!(1024, log::LevelFilter::Info, driver, Handler);
}

#[embassy_executor::task]
pub async fn usb_task(spawner: Spawner, r: USBResources) {
    let driver = Driver::new(r.usb, Irqs);
    match logger_task(driver) {
        Ok(token) => spawner.spawn(token),
        Err(_) => {
            defmt::error!("USB: logger task already running");
            return;
        }
    }

    let (Some(mut hotend), Some(mut bed)) = (HOTEND.status.receiver(), BED.status.receiver())
    else {
        defmt::error!("USB: no status receivers left");
        return;
    };

    loop {
        Timer::after_secs(STATUS_PERIOD_SECS).await;
        for (name, receiver) in [("hotend", &mut hotend), ("bed", &mut bed)] {
            let Some(status) = receiver.try_get() else {
                continue;
            };
            match to_json_heapless(&status) {
                Some(json) => log::info!("{{\"heater\":\"{}\",\"state\":{}}}", name, json),
                None => defmt::warn!("USB: {} status too large to encode", name),
            }
        }
    }
}
