//! Per-heater configuration.
//!
//! Everything has a default, so a JSON document only needs the fields it
//! changes:
//!
//! ```json
//! {"controller":{"target":210.0,"gains":{"kp":20.0,"ki":1.0,"kd":100.0}}}
//! ```

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::autotune::TuningConfig;
use crate::pid::{ControllerConfig, Gains, HistoryOverflow};
use crate::thermistor::Divider;

pub const HOTEND_GAINS: Gains = Gains::new(22.2, 1.08, 114.0);
pub const BED_GAINS: Gains = Gains::new(10.0, 0.023, 305.0);

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaterConfig {
    pub controller: ControllerConfig,
    pub tuning: TuningConfig,
    pub divider: Divider,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    Parse,
    Invalid(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Parse => write!(f, "Malformed heater config"),
            ConfigError::Invalid(msg) => write!(f, "Invalid heater config: {}", msg),
        }
    }
}

impl HeaterConfig {
    /// Hotend on the forge board, regulated at 200 °C.
    pub fn hotend() -> Self {
        Self::preset(200.0, HOTEND_GAINS)
    }

    /// Heated bed on the forge board, regulated at 60 °C.
    pub fn bed() -> Self {
        Self::preset(60.0, BED_GAINS)
    }

    fn preset(target: f32, gains: Gains) -> Self {
        Self {
            // regulation runs indefinitely, so the history wraps
            controller: ControllerConfig::default()
                .with_target(target)
                .with_gains(gains)
                .with_history_overflow(HistoryOverflow::Wrap),
            tuning: TuningConfig::default().with_target(target),
            divider: Divider::default(),
        }
    }

    pub fn from_json(json: &[u8]) -> Result<Self, ConfigError> {
        let (config, _) =
            serde_json_core::from_slice::<HeaterConfig>(json).map_err(|_| ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.controller
            .validate()
            .map_err(|_| ConfigError::Invalid("controller"))?;
        self.tuning
            .validate()
            .map_err(|_| ConfigError::Invalid("tuning"))?;
        if !self.divider.validate() {
            return Err(ConfigError::Invalid("divider"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pid::Actuation;

    #[test]
    fn presets_validate() {
        let hotend = HeaterConfig::hotend();
        assert!(hotend.validate().is_ok());
        assert_eq!(hotend.controller.target, 200.0);
        assert_eq!(hotend.controller.gains, HOTEND_GAINS);
        assert_eq!(hotend.controller.actuation, Actuation::Relay);
        assert_eq!(hotend.tuning.target, 200.0);
        assert_eq!(hotend.tuning.max_cycles, 30);

        let bed = HeaterConfig::bed();
        assert!(bed.validate().is_ok());
        assert_eq!(bed.controller.gains.kd, 305.0);
        assert_eq!(bed.tuning.target, 60.0);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let json = br#"{"controller":{"target":210.0,"actuation":"duty","duty_scale":50.0},"tuning":{"max_cycles":5}}"#;
        let config = HeaterConfig::from_json(json).unwrap();
        assert_eq!(config.controller.target, 210.0);
        assert_eq!(config.controller.actuation, Actuation::Duty);
        assert_eq!(config.controller.duty_scale, 50.0);
        assert_eq!(config.tuning.max_cycles, 5);
        assert_eq!(config.tuning.measure_secs, 120);
        assert_eq!(config.divider, Divider::default());
    }

    #[test]
    fn rejects_bad_documents() {
        assert_eq!(HeaterConfig::from_json(b"{not json"), Err(ConfigError::Parse));
        assert_eq!(
            HeaterConfig::from_json(br#"{"tuning":{"measure_secs":0}}"#),
            Err(ConfigError::Invalid("tuning"))
        );
        assert_eq!(
            HeaterConfig::from_json(br#"{"divider":{"fixed_ohms":-1.0}}"#),
            Err(ConfigError::Invalid("divider"))
        );
    }
}
