//! Heater drive.
//!
//! The controller only ever talks to a [`HeaterOutput`]. Two adapters cover
//! the forge hardware: a MOSFET gate on a plain GPIO (relay style, on/off) and
//! the same gate on a PWM channel (duty cycle).

use core::fmt;

use embedded_hal::digital::OutputPin;
use embedded_hal::pwm::SetDutyCycle;

use crate::pid::Actuation;

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HeaterDrive {
    Relay(bool),
    /// Fraction of full power, 0.0..=1.0
    Duty(f32),
}

impl HeaterDrive {
    pub fn full(actuation: Actuation) -> Self {
        match actuation {
            Actuation::Relay => HeaterDrive::Relay(true),
            Actuation::Duty => HeaterDrive::Duty(1.0),
        }
    }

    pub fn off(actuation: Actuation) -> Self {
        match actuation {
            Actuation::Relay => HeaterDrive::Relay(false),
            Actuation::Duty => HeaterDrive::Duty(0.0),
        }
    }

    /// Drive level as a fraction of full power.
    pub fn fraction(&self) -> f32 {
        match *self {
            HeaterDrive::Relay(true) => 1.0,
            HeaterDrive::Relay(false) => 0.0,
            HeaterDrive::Duty(duty) => clamp_unit(duty),
        }
    }
}

/// Heater driver error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    Pin,
    Pwm,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Pin => write!(f, "Heater pin error"),
            Error::Pwm => write!(f, "Heater PWM error"),
        }
    }
}

/// Something that can heat. Must be idempotent and cheap enough to call
/// every control tick.
pub trait HeaterOutput {
    type Error;

    fn set_output(&mut self, drive: HeaterDrive) -> Result<(), Self::Error>;
}

impl<T: HeaterOutput + ?Sized> HeaterOutput for &mut T {
    type Error = T::Error;

    fn set_output(&mut self, drive: HeaterDrive) -> Result<(), Self::Error> {
        T::set_output(self, drive)
    }
}

/// Heater gate switched by a GPIO.
pub struct RelayHeater<P> {
    pin: P,
    on: bool,
}

impl<P: OutputPin> RelayHeater<P> {
    pub fn new(pin: P) -> Self {
        Self { pin, on: false }
    }

    pub fn is_on(&self) -> bool {
        self.on
    }

    pub fn free(self) -> P {
        self.pin
    }
}

impl<P: OutputPin> HeaterOutput for RelayHeater<P> {
    type Error = Error;

    fn set_output(&mut self, drive: HeaterDrive) -> Result<(), Error> {
        let on = match drive {
            HeaterDrive::Relay(on) => on,
            // no time proportioning on a bare pin
            HeaterDrive::Duty(duty) => duty >= 0.5,
        };
        if on {
            self.pin.set_high().map_err(|_| Error::Pin)?;
        } else {
            self.pin.set_low().map_err(|_| Error::Pin)?;
        }
        self.on = on;
        Ok(())
    }
}

/// Resolution used when handing a fraction to the PWM driver.
const DUTY_STEPS: u16 = 10_000;

/// Heater gate on a PWM channel.
pub struct PwmHeater<P> {
    pwm: P,
    duty: f32,
}

impl<P: SetDutyCycle> PwmHeater<P> {
    pub fn new(pwm: P) -> Self {
        Self { pwm, duty: 0.0 }
    }

    pub fn duty(&self) -> f32 {
        self.duty
    }

    pub fn free(self) -> P {
        self.pwm
    }
}

impl<P: SetDutyCycle> HeaterOutput for PwmHeater<P> {
    type Error = Error;

    fn set_output(&mut self, drive: HeaterDrive) -> Result<(), Error> {
        let duty = drive.fraction();
        let steps = libm::roundf(duty * DUTY_STEPS as f32) as u16;
        self.pwm
            .set_duty_cycle_fraction(steps, DUTY_STEPS)
            .map_err(|_| Error::Pwm)?;
        self.duty = duty;
        Ok(())
    }
}

fn clamp_unit(x: f32) -> f32 {
    if x.is_nan() || x < 0.0 {
        0.0
    } else if x > 1.0 {
        1.0
    } else {
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::Infallible;
    use embedded_hal::digital::ErrorType as PinErrorType;
    use embedded_hal::pwm::ErrorType as PwmErrorType;

    #[derive(Default)]
    struct MockPin {
        high: bool,
        writes: u32,
    }

    impl PinErrorType for MockPin {
        type Error = Infallible;
    }

    impl OutputPin for MockPin {
        fn set_low(&mut self) -> Result<(), Infallible> {
            self.high = false;
            self.writes += 1;
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Infallible> {
            self.high = true;
            self.writes += 1;
            Ok(())
        }
    }

    struct MockPwm {
        duty: u16,
    }

    impl PwmErrorType for MockPwm {
        type Error = Infallible;
    }

    impl SetDutyCycle for MockPwm {
        fn max_duty_cycle(&self) -> u16 {
            1000
        }

        fn set_duty_cycle(&mut self, duty: u16) -> Result<(), Infallible> {
            self.duty = duty;
            Ok(())
        }
    }

    #[test]
    fn relay_follows_drive() {
        let mut heater = RelayHeater::new(MockPin::default());
        heater.set_output(HeaterDrive::Relay(true)).unwrap();
        assert!(heater.is_on());
        heater.set_output(HeaterDrive::Relay(true)).unwrap();
        assert!(heater.is_on());
        heater.set_output(HeaterDrive::Duty(0.2)).unwrap();
        assert!(!heater.is_on());
        let pin = heater.free();
        assert!(!pin.high);
        assert_eq!(pin.writes, 3);
    }

    #[test]
    fn pwm_scales_fraction() {
        let mut heater = PwmHeater::new(MockPwm { duty: 0 });
        heater.set_output(HeaterDrive::Duty(0.25)).unwrap();
        assert_eq!(heater.free().duty, 250);

        let mut heater = PwmHeater::new(MockPwm { duty: 0 });
        heater.set_output(HeaterDrive::Duty(3.0)).unwrap();
        assert_eq!(heater.duty(), 1.0);
        heater.set_output(HeaterDrive::Relay(false)).unwrap();
        assert_eq!(heater.free().duty, 0);
    }

    #[test]
    fn full_and_off_match_actuation() {
        assert_eq!(HeaterDrive::full(Actuation::Relay), HeaterDrive::Relay(true));
        assert_eq!(HeaterDrive::off(Actuation::Duty), HeaterDrive::Duty(0.0));
        assert_eq!(HeaterDrive::Duty(f32::NAN).fraction(), 0.0);
    }
}
