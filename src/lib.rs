#![cfg_attr(not(test), no_std)]

#[cfg(feature = "rp2040")]
pub use defmt as log;

#[cfg(not(feature = "rp2040"))]
pub use log;

pub mod autotune;
pub mod clock;
pub mod command;
pub mod config;
pub mod heater;
pub mod heater_controller;
pub mod pid;
pub mod thermistor;

#[cfg(any(test, feature = "std"))]
pub mod simulation;

#[cfg(feature = "rp2040")]
pub mod resources_rp2040;
#[cfg(feature = "rp2040")]
pub use resources_rp2040 as resources;

#[cfg(feature = "rp2040")]
pub mod heater_rp2040;

#[cfg(feature = "rp2040")]
pub mod thermistor_rp2040;

#[cfg(feature = "rp2040")]
pub mod usb_interface_rp2040;
#[cfg(feature = "rp2040")]
pub use usb_interface_rp2040 as usb_interface;

pub static VERSION: &str = "v0.1";

/// Control loop period. The tuning rule assumes a 1 kHz loop.
pub static CONTROL_TICK_MICROS: u32 = 1_000;

use autotune::CancelToken;
use command::Command;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::watch::Watch;
use heater_controller::HeaterStatus;

pub const COMMAND_QUEUE_DEPTH: usize = 4;
pub const STATUS_RECEIVERS: usize = 2;

pub type CommandChannel = Channel<CriticalSectionRawMutex, Command, COMMAND_QUEUE_DEPTH>;
pub type StatusWatch = Watch<CriticalSectionRawMutex, HeaterStatus, STATUS_RECEIVERS>;

/// Everything a heater task shares with the outside world.
pub struct HeaterLinks {
    pub commands: CommandChannel,
    pub status: StatusWatch,
    pub cancel: CancelToken,
}

impl HeaterLinks {
    pub const fn new() -> Self {
        Self {
            commands: Channel::new(),
            status: Watch::new(),
            cancel: CancelToken::new(),
        }
    }
}

impl Default for HeaterLinks {
    fn default() -> Self {
        Self::new()
    }
}

pub static HOTEND: HeaterLinks = HeaterLinks::new();
pub static BED: HeaterLinks = HeaterLinks::new();
