use core::fmt::Write;

use embedded_hal_async::delay::DelayNs;
use heapless::String;
use serde::{Deserialize, Serialize};

use crate::autotune::{self, Autotuner, TuneReport, TuneStatus};
use crate::clock::{Clock, TickPacer};
use crate::command::Command;
use crate::config::HeaterConfig;
use crate::heater::HeaterOutput;
use crate::log::*;
use crate::pid::{self, Controller, Gains, HistoryOverflow};
use crate::thermistor::{Thermistor, ThermistorInput, NTC_100K};
use crate::{HeaterLinks, CONTROL_TICK_MICROS};

/// Ticks between status snapshots (10 Hz at the default tick).
pub const STATUS_EVERY_TICKS: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Idle,
    Regulating,
    Tuning,
    Fault,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaterStatus {
    pub status: Status,
    pub target: f32,
    pub temperature: f32,
    /// Fraction of full heater power last applied.
    pub power: f32,
    pub gains: Gains,
    pub tune: Option<TuneReport>,
    pub error_message: String<64>,
}

pub struct HeaterController<'a, S, H, C, D> {
    controller: Controller<S, H>,
    config: HeaterConfig,
    clock: C,
    delay: D,
    pacer: TickPacer,
    links: &'a HeaterLinks,
    status: Status,
    ticks: u32,
    last_tune: Option<TuneReport>,
    error_message: String<64>,
}

impl<'a, S, H, C, D> HeaterController<'a, S, H, C, D>
where
    S: ThermistorInput,
    H: HeaterOutput,
    C: Clock,
    D: DelayNs,
{
    /// Bring up the thermistor and controller described by `config`.
    pub async fn from_config(
        input: S,
        heater: H,
        config: HeaterConfig,
        clock: C,
        delay: D,
        links: &'a HeaterLinks,
    ) -> Result<Self, pid::Error> {
        let thermistor = Thermistor::new(input, config.divider, NTC_100K)
            .await
            .map_err(pid::Error::Sensor)?;
        let controller = Controller::new(thermistor, heater, config.controller)?;
        Ok(Self::new(controller, config, clock, delay, links))
    }

    /// Regulation runs indefinitely, so the error history always wraps
    /// whatever `config` asks for.
    pub fn new(
        mut controller: Controller<S, H>,
        mut config: HeaterConfig,
        clock: C,
        delay: D,
        links: &'a HeaterLinks,
    ) -> Self {
        controller.set_history_overflow(HistoryOverflow::Wrap);
        config.controller.history_overflow = HistoryOverflow::Wrap;
        Self {
            controller,
            config,
            clock,
            delay,
            pacer: TickPacer::from_micros(CONTROL_TICK_MICROS),
            links,
            status: Status::Idle,
            ticks: 0,
            last_tune: None,
            error_message: String::new(),
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn config(&self) -> &HeaterConfig {
        &self.config
    }

    pub fn controller(&self) -> &Controller<S, H> {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut Controller<S, H> {
        &mut self.controller
    }

    pub fn last_tune(&self) -> Option<TuneReport> {
        self.last_tune
    }

    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    pub async fn run(&mut self) {
        info!("Heater: running, tick={}us", CONTROL_TICK_MICROS);
        self.publish();
        loop {
            self.tick().await;
        }
    }

    /// One control tick: commands, regulation, status, pacing.
    pub async fn tick(&mut self) {
        while let Ok(command) = self.links.commands.try_receive() {
            self.handle_command(command).await;
        }

        if self.status == Status::Regulating {
            if let Err(e) = self.controller.step().await {
                self.enter_fault(e.into());
            }
        }

        self.ticks = self.ticks.wrapping_add(1);
        if self.ticks % STATUS_EVERY_TICKS == 0 {
            if self.status == Status::Idle {
                // keep the reported temperature fresh while the heater is off
                if let Err(e) = self.controller.read_temperature().await {
                    self.enter_fault(e.into());
                }
            }
            self.publish();
        }

        self.pacer.wait(&mut self.clock, &mut self.delay).await;
    }

    pub async fn handle_command(&mut self, command: Command) {
        debug!("Heater: command {:?}", command);
        match command {
            Command::Start => match self.status {
                Status::Idle => {
                    info!("Heater: regulating at {}", self.controller.target());
                    self.controller.reset();
                    self.status = Status::Regulating;
                }
                Status::Fault => warn!("Heater: cannot start while faulted, reset first"),
                _ => {}
            },
            Command::Stop => {
                self.controller.shutdown();
                if self.status != Status::Fault {
                    self.status = Status::Idle;
                }
            }
            Command::Reset => {
                if self.status == Status::Fault {
                    info!("Heater: fault cleared");
                    self.error_message.clear();
                    self.controller.clear_error();
                    self.controller.invalidate();
                    self.status = Status::Idle;
                }
            }
            Command::SetTarget(target) => match self.controller.set_target(target) {
                Ok(()) => self.config.controller.target = target,
                Err(e) => warn!("Heater: target rejected: {:?}", e),
            },
            Command::SetGains(gains) => match self.controller.set_gains(gains) {
                Ok(()) => self.config.controller.gains = gains,
                Err(e) => warn!("Heater: gains rejected: {:?}", e),
            },
            Command::Autotune { target } => {
                if self.status == Status::Fault {
                    warn!("Heater: cannot tune while faulted, reset first");
                } else {
                    self.autotune(target).await;
                }
            }
            Command::Cancel => self.links.cancel.cancel(),
        }
        self.publish();
    }

    /// Run the autotuner in place. Regulation resumes at the tuning target
    /// with the new gains, unless tuning was cancelled.
    async fn autotune(&mut self, target: Option<f32>) {
        let mut config = self.config.tuning;
        if let Some(target) = target {
            config.target = target;
        }

        self.status = Status::Tuning;
        self.links.cancel.reset();
        self.publish();

        let result = match Autotuner::new(&mut self.controller, config) {
            Ok(tuner) => {
                let mut tuner = tuner.with_cancel(&self.links.cancel);
                tuner.run(&mut self.clock, &mut self.delay).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(report) => {
                self.last_tune = Some(report);
                self.config.controller.gains = report.gains;
                self.config.controller.target = self.controller.target();
                if report.status == TuneStatus::Cancelled {
                    self.status = Status::Idle;
                } else {
                    self.controller.reset();
                    self.status = Status::Regulating;
                }
            }
            Err(e) => self.enter_fault(e),
        }
        self.pacer.restart();
    }

    fn enter_fault(&mut self, e: autotune::Error) {
        error!("Heater: fault: {:?}", e);
        self.controller.shutdown();
        self.status = Status::Fault;
        self.error_message.clear();
        // truncated messages are fine
        let _ = write!(self.error_message, "{}", e);
    }

    fn snapshot(&self) -> HeaterStatus {
        HeaterStatus {
            status: self.status,
            target: self.controller.target(),
            temperature: match (self.controller.last_error(), self.controller.last_reading()) {
                // the last good reading is stale once the sensor has failed
                (Some(pid::Error::Sensor(_)), _) | (_, None) => f32::NAN,
                (_, Some(reading)) => reading.celsius,
            },
            power: self
                .controller
                .last_drive()
                .map_or(0.0, |drive| drive.fraction()),
            gains: self.controller.gains(),
            tune: self.last_tune,
            error_message: self.error_message.clone(),
        }
    }

    fn publish(&self) {
        self.links.status.sender().send(self.snapshot());
    }
}
