//! Host commands.
//!
//! One JSON object per line:
//!
//! ```json
//! {"command":"start"}
//! {"command":"set_target","value":210.0}
//! {"command":"set_gains","kp":20.0,"ki":1.0,"kd":100.0}
//! {"command":"autotune","value":200.0}
//! {"command":"cancel"}
//! {"command":"start","heater":"bed"}
//! ```
//!
//! Frames without a `heater` field address the hotend.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::log::*;
use crate::pid::Gains;
use crate::{HeaterLinks, BED, HOTEND};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[serde(rename_all = "snake_case")]
pub enum HeaterId {
    #[default]
    Hotend,
    Bed,
}

impl HeaterId {
    pub fn links(self) -> &'static HeaterLinks {
        match self {
            HeaterId::Hotend => &HOTEND,
            HeaterId::Bed => &BED,
        }
    }
}

impl FromStr for HeaterId {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, CommandError> {
        match s {
            "hotend" => Ok(HeaterId::Hotend),
            "bed" => Ok(HeaterId::Bed),
            _ => Err(CommandError::UnknownHeater),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    /// Begin regulating at the current target.
    Start,
    /// Heater off, back to idle.
    Stop,
    /// Leave the fault state.
    Reset,
    SetTarget(f32),
    SetGains(Gains),
    /// Tune at `target`, or at the configured tuning target.
    Autotune { target: Option<f32> },
    /// Abort a running autotune.
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Start,
    Stop,
    Reset,
    SetTarget,
    SetGains,
    Autotune,
    Cancel,
}

/// Wire form of a [`Command`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CommandFrame {
    pub command: CommandKind,
    #[serde(default)]
    pub heater: HeaterId,
    #[serde(default)]
    pub value: Option<f32>,
    #[serde(default)]
    pub kp: Option<f32>,
    #[serde(default)]
    pub ki: Option<f32>,
    #[serde(default)]
    pub kd: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandError {
    Parse,
    MissingField(&'static str),
    NonFinite,
    QueueFull,
    UnknownHeater,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Parse => write!(f, "Unknown command"),
            CommandError::MissingField(name) => write!(f, "Missing field: {}", name),
            CommandError::NonFinite => write!(f, "Values must be finite"),
            CommandError::QueueFull => write!(f, "Command queue full"),
            CommandError::UnknownHeater => write!(f, "Unknown heater"),
        }
    }
}

fn finite(x: f32) -> Result<f32, CommandError> {
    if x.is_finite() {
        Ok(x)
    } else {
        Err(CommandError::NonFinite)
    }
}

impl TryFrom<CommandFrame> for Command {
    type Error = CommandError;

    fn try_from(frame: CommandFrame) -> Result<Self, CommandError> {
        let required = |field: Option<f32>, name| {
            field.ok_or(CommandError::MissingField(name)).and_then(finite)
        };
        Ok(match frame.command {
            CommandKind::Start => Command::Start,
            CommandKind::Stop => Command::Stop,
            CommandKind::Reset => Command::Reset,
            CommandKind::Cancel => Command::Cancel,
            CommandKind::SetTarget => Command::SetTarget(required(frame.value, "value")?),
            CommandKind::SetGains => Command::SetGains(Gains::new(
                required(frame.kp, "kp")?,
                required(frame.ki, "ki")?,
                required(frame.kd, "kd")?,
            )),
            CommandKind::Autotune => Command::Autotune {
                target: frame.value.map(finite).transpose()?,
            },
        })
    }
}

impl From<Command> for CommandFrame {
    fn from(command: Command) -> Self {
        let frame = |command| CommandFrame {
            command,
            heater: HeaterId::Hotend,
            value: None,
            kp: None,
            ki: None,
            kd: None,
        };
        match command {
            Command::Start => frame(CommandKind::Start),
            Command::Stop => frame(CommandKind::Stop),
            Command::Reset => frame(CommandKind::Reset),
            Command::Cancel => frame(CommandKind::Cancel),
            Command::SetTarget(value) => CommandFrame {
                value: Some(value),
                ..frame(CommandKind::SetTarget)
            },
            Command::SetGains(gains) => CommandFrame {
                kp: Some(gains.kp),
                ki: Some(gains.ki),
                kd: Some(gains.kd),
                ..frame(CommandKind::SetGains)
            },
            Command::Autotune { target } => CommandFrame {
                value: target,
                ..frame(CommandKind::Autotune)
            },
        }
    }
}

/// Decode a frame and the heater it is meant for.
pub fn parse_addressed(text: &str) -> Result<(HeaterId, Command), CommandError> {
    let (frame, _) = serde_json_core::from_str::<CommandFrame>(text.trim())
        .map_err(|_| CommandError::Parse)?;
    Ok((frame.heater, Command::try_from(frame)?))
}

pub fn parse_command(text: &str) -> Result<Command, CommandError> {
    parse_addressed(text).map(|(_, command)| command)
}

/// Route a command to a heater task.
///
/// `Cancel` trips the token directly, since the heater task does not read
/// its queue while tuning. Everything else is queued without waiting.
pub fn dispatch(command: Command, links: &HeaterLinks) -> Result<(), CommandError> {
    if command == Command::Cancel {
        info!("Command: cancelling autotune");
        links.cancel.cancel();
        return Ok(());
    }
    links.commands.try_send(command).map_err(|_| {
        warn!("Command: queue full, dropping {:?}", command);
        CommandError::QueueFull
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_commands() {
        assert_eq!(parse_command(r#"{"command":"start"}"#), Ok(Command::Start));
        assert_eq!(parse_command(" {\"command\":\"stop\"}\r\n"), Ok(Command::Stop));
        assert_eq!(parse_command(r#"{"command":"cancel"}"#), Ok(Command::Cancel));
    }

    #[test]
    fn parses_values() {
        assert_eq!(
            parse_command(r#"{"command":"set_target","value":210.5}"#),
            Ok(Command::SetTarget(210.5))
        );
        assert_eq!(
            parse_command(r#"{"command":"set_gains","kp":20.0,"ki":1.0,"kd":100.0}"#),
            Ok(Command::SetGains(Gains::new(20.0, 1.0, 100.0)))
        );
        assert_eq!(
            parse_command(r#"{"command":"autotune"}"#),
            Ok(Command::Autotune { target: None })
        );
        assert_eq!(
            parse_command(r#"{"command":"autotune","value":60.0}"#),
            Ok(Command::Autotune { target: Some(60.0) })
        );
    }

    #[test]
    fn rejects_incomplete_commands() {
        assert_eq!(parse_command("q"), Err(CommandError::Parse));
        assert_eq!(parse_command(r#"{"command":"explode"}"#), Err(CommandError::Parse));
        assert_eq!(
            parse_command(r#"{"command":"set_target"}"#),
            Err(CommandError::MissingField("value"))
        );
        assert_eq!(
            parse_command(r#"{"command":"set_gains","kp":1.0,"kd":1.0}"#),
            Err(CommandError::MissingField("ki"))
        );
    }

    #[test]
    fn frame_round_trips_through_json() {
        let command = Command::SetGains(Gains::new(1.5, 0.25, 8.0));
        let json: heapless::String<128> =
            serde_json_core::to_string(&CommandFrame::from(command)).unwrap();
        assert_eq!(parse_command(&json), Ok(command));
    }

    #[test]
    fn frames_address_a_heater() {
        assert_eq!(
            parse_addressed(r#"{"command":"start"}"#),
            Ok((HeaterId::Hotend, Command::Start))
        );
        assert_eq!(
            parse_addressed(r#"{"command":"set_target","heater":"bed","value":65.0}"#),
            Ok((HeaterId::Bed, Command::SetTarget(65.0)))
        );
        assert_eq!(
            parse_addressed(r#"{"command":"start","heater":"chamber"}"#),
            Err(CommandError::Parse)
        );
        assert!(core::ptr::eq(HeaterId::Bed.links(), &BED));
        assert_eq!("bed".parse(), Ok(HeaterId::Bed));
        assert_eq!("chamber".parse::<HeaterId>(), Err(CommandError::UnknownHeater));
    }

    #[test]
    fn dispatch_routes_cancel_to_token() {
        let links = HeaterLinks::new();

        dispatch(Command::Cancel, &links).unwrap();
        assert!(links.cancel.is_cancelled());
        assert!(links.commands.is_empty());

        for _ in 0..crate::COMMAND_QUEUE_DEPTH {
            dispatch(Command::Start, &links).unwrap();
        }
        assert_eq!(
            dispatch(Command::Stop, &links),
            Err(CommandError::QueueFull)
        );
        assert_eq!(links.commands.try_receive().ok(), Some(Command::Start));
    }
}
