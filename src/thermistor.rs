//! NTC thermistor linearization.
//!
//! The forge boards read each thermistor through a 12-bit ADC with the
//! thermistor on the high side of a divider and a fixed resistor to ground.
//! Raw counts are turned into a resistance, and the resistance is mapped to a
//! temperature with a calibration table:
//!
//! ```ignore
//! let mut thermistor = Thermistor::new(adc_input, Divider::default(), NTC_100K).await?;
//! let reading = thermistor.read().await?;
//! info!("hotend at {} C", reading.celsius);
//! ```

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::log::*;

/// One calibration point: resistance (kΩ) measured at a temperature (°C).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TablePoint {
    pub celsius: f32,
    pub kilohms: f32,
}

const fn pt(celsius: f32, kilohms: f32) -> TablePoint {
    TablePoint { celsius, kilohms }
}

/// 100 kΩ NTC, 0–300 °C in 5 °C steps.
pub static NTC_100K_POINTS: [TablePoint; 61] = [
    pt(0.0, 332.4),
    pt(5.0, 257.69),
    pt(10.0, 201.27),
    pt(15.0, 158.34),
    pt(20.0, 125.42),
    pt(25.0, 100.0),
    pt(30.0, 80.239),
    pt(35.0, 64.776),
    pt(40.0, 52.598),
    pt(45.0, 42.95),
    pt(50.0, 35.262),
    pt(55.0, 29.1),
    pt(60.0, 24.136),
    pt(65.0, 20.114),
    pt(70.0, 16.841),
    pt(75.0, 14.164),
    pt(80.0, 11.963),
    pt(85.0, 10.147),
    pt(90.0, 8.6407),
    pt(95.0, 7.3867),
    pt(100.0, 6.3383),
    pt(105.0, 5.4584),
    pt(110.0, 4.717),
    pt(115.0, 4.0901),
    pt(120.0, 3.5581),
    pt(125.0, 3.105),
    pt(130.0, 2.7179),
    pt(135.0, 2.3861),
    pt(140.0, 2.1008),
    pt(145.0, 1.8548),
    pt(150.0, 1.6419),
    pt(155.0, 1.4573),
    pt(160.0, 1.2967),
    pt(165.0, 1.1566),
    pt(170.0, 1.0341),
    pt(175.0, 0.92664),
    pt(180.0, 0.83224),
    pt(185.0, 0.74907),
    pt(190.0, 0.67564),
    pt(195.0, 0.61064),
    pt(200.0, 0.55299),
    pt(205.0, 0.50175),
    pt(210.0, 0.45611),
    pt(215.0, 0.41537),
    pt(220.0, 0.37895),
    pt(225.0, 0.34631),
    pt(230.0, 0.31701),
    pt(235.0, 0.29067),
    pt(240.0, 0.26693),
    pt(245.0, 0.24551),
    pt(250.0, 0.22615),
    pt(255.0, 0.20862),
    pt(260.0, 0.19273),
    pt(265.0, 0.17829),
    pt(270.0, 0.16516),
    pt(275.0, 0.15319),
    pt(280.0, 0.14228),
    pt(285.0, 0.13231),
    pt(290.0, 0.12319),
    pt(295.0, 0.11483),
    pt(300.0, 0.10716),
];

/// The stock forge thermistor table.
pub const NTC_100K: ThermistorTable<'static> = ThermistorTable {
    points: &NTC_100K_POINTS,
};

/// Thermistor error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The ADC (or whatever feeds the divider) failed to come up.
    Init,
    /// A conversion failed after a successful init.
    Read,
    /// Calibration table is too short or not strictly decreasing.
    InvalidTable,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Init => write!(f, "Thermistor init failed"),
            Error::Read => write!(f, "Thermistor read failed"),
            Error::InvalidTable => write!(f, "Invalid thermistor table"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Certainty {
    /// The resistance hit a table entry.
    Exact,
    /// Linear estimate between two entries (or clamped to the table edge).
    Interpolated,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SensorReading {
    pub raw: u16,
    pub kilohms: f32,
    pub celsius: f32,
    pub certainty: Certainty,
}

/// Calibration table, resistance strictly decreasing as temperature rises.
#[derive(Debug, Clone, Copy)]
pub struct ThermistorTable<'a> {
    points: &'a [TablePoint],
}

impl<'a> ThermistorTable<'a> {
    pub fn new(points: &'a [TablePoint]) -> Result<Self, Error> {
        if points.len() < 2 {
            return Err(Error::InvalidTable);
        }
        let decreasing = points
            .windows(2)
            .all(|w| w[1].kilohms < w[0].kilohms && w[1].celsius > w[0].celsius);
        if !decreasing {
            return Err(Error::InvalidTable);
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &'a [TablePoint] {
        self.points
    }

    pub fn coldest(&self) -> TablePoint {
        self.points[0]
    }

    pub fn hottest(&self) -> TablePoint {
        self.points[self.points.len() - 1]
    }

    /// Map a resistance to a temperature.
    ///
    /// Single pass over the table, remembering the closest entry above and
    /// the closest entry below the measured resistance. Values outside the
    /// table are clamped to the nearest bound.
    pub fn linearize(&self, kilohms: f32) -> (f32, Certainty) {
        let mut above: Option<TablePoint> = None;
        let mut below: Option<TablePoint> = None;

        for point in self.points {
            if point.kilohms == kilohms {
                return (point.celsius, Certainty::Exact);
            }
            if point.kilohms > kilohms {
                above = Some(*point);
            } else if below.is_none() {
                below = Some(*point);
            }
        }

        let celsius = match (above, below) {
            (Some(hi), Some(lo)) => {
                hi.celsius
                    + (lo.celsius - hi.celsius) / (lo.kilohms - hi.kilohms) * (kilohms - hi.kilohms)
            }
            (Some(_), None) => self.hottest().celsius,
            // NaN falls through here as well
            _ => self.coldest().celsius,
        };
        (celsius, Certainty::Interpolated)
    }

    /// Inverse lookup, resistance expected at `celsius`. Clamped to the table.
    pub fn resistance_at(&self, celsius: f32) -> f32 {
        if celsius <= self.coldest().celsius {
            return self.coldest().kilohms;
        }
        if celsius >= self.hottest().celsius {
            return self.hottest().kilohms;
        }
        for w in self.points.windows(2) {
            let (cold, hot) = (w[0], w[1]);
            if celsius >= cold.celsius && celsius <= hot.celsius {
                let frac = (celsius - cold.celsius) / (hot.celsius - cold.celsius);
                return cold.kilohms + frac * (hot.kilohms - cold.kilohms);
            }
        }
        self.hottest().kilohms
    }
}

/// Voltage divider feeding the ADC.
///
/// The thermistor sits between the reference and the ADC pin, the fixed
/// resistor between the pin and ground: `R = fixed * (Vref - V) / V`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Divider {
    pub reference_volts: f32,
    pub fixed_ohms: f32,
    pub adc_full_scale: u16,
}

impl Default for Divider {
    fn default() -> Self {
        Self {
            reference_volts: 3.3,
            fixed_ohms: 4_700.0,
            adc_full_scale: 4095,
        }
    }
}

impl Divider {
    /// Thermistor resistance in kΩ for a raw conversion.
    ///
    /// Zero counts (open sensor) give infinity, which linearizes to the
    /// coldest table entry.
    pub fn kilohms(&self, raw: u16) -> f32 {
        let raw = raw.min(self.adc_full_scale);
        let volts = (raw as f32 / self.adc_full_scale as f32) * self.reference_volts;
        if volts <= 0.0 {
            return f32::INFINITY;
        }
        self.fixed_ohms * ((self.reference_volts - volts) / volts) / 1000.0
    }

    /// Raw count the ADC would report for a given thermistor resistance.
    pub fn raw_for_kilohms(&self, kilohms: f32) -> u16 {
        let ohms = kilohms * 1000.0;
        let ratio = self.fixed_ohms / (self.fixed_ohms + ohms);
        let raw = libm::roundf(ratio * self.adc_full_scale as f32);
        if raw <= 0.0 {
            0
        } else if raw >= self.adc_full_scale as f32 {
            self.adc_full_scale
        } else {
            raw as u16
        }
    }

    pub fn validate(&self) -> bool {
        self.reference_volts > 0.0
            && self.reference_volts.is_finite()
            && self.fixed_ohms > 0.0
            && self.fixed_ohms.is_finite()
            && self.adc_full_scale > 0
    }
}

/// Source of raw thermistor conversions.
#[allow(async_fn_in_trait)]
pub trait ThermistorInput {
    type Error;

    /// Bring the converter up. Implementations may need a settling delay.
    async fn init(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Latest conversion, blocking until one is available.
    async fn read_raw(&mut self) -> Result<u16, Self::Error>;
}

pub struct Thermistor<S> {
    input: S,
    divider: Divider,
    table: ThermistorTable<'static>,
    last_error: Option<Error>,
}

impl<S: ThermistorInput> Thermistor<S> {
    /// Initialize the input and return a ready thermistor.
    pub async fn new(
        mut input: S,
        divider: Divider,
        table: ThermistorTable<'static>,
    ) -> Result<Self, Error> {
        if input.init().await.is_err() {
            error!("Thermistor: input init failed");
            return Err(Error::Init);
        }
        debug!("Thermistor: ready, {} table points", table.points().len());
        Ok(Self {
            input,
            divider,
            table,
            last_error: None,
        })
    }

    pub async fn reinitialize(&mut self) -> Result<(), Error> {
        match self.input.init().await {
            Ok(()) => {
                self.last_error = None;
                Ok(())
            }
            Err(_) => {
                error!("Thermistor: re-init failed");
                self.last_error = Some(Error::Init);
                Err(Error::Init)
            }
        }
    }

    pub async fn read(&mut self) -> Result<SensorReading, Error> {
        match self.input.read_raw().await {
            Ok(raw) => Ok(self.convert(raw)),
            Err(_) => {
                warn!("Thermistor: read failed");
                self.last_error = Some(Error::Read);
                Err(Error::Read)
            }
        }
    }

    pub fn convert(&self, raw: u16) -> SensorReading {
        let kilohms = self.divider.kilohms(raw);
        let (celsius, certainty) = self.table.linearize(kilohms);
        SensorReading {
            raw,
            kilohms,
            celsius,
            certainty,
        }
    }

    pub fn last_error(&self) -> Option<Error> {
        self.last_error
    }

    pub fn divider(&self) -> &Divider {
        &self.divider
    }

    pub fn table(&self) -> &ThermistorTable<'static> {
        &self.table
    }

    pub fn input_mut(&mut self) -> &mut S {
        &mut self.input
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::block_on;

    struct FixedInput {
        raw: u16,
        fail_init: bool,
        fail_read: bool,
    }

    impl ThermistorInput for FixedInput {
        type Error = ();

        async fn init(&mut self) -> Result<(), ()> {
            if self.fail_init {
                Err(())
            } else {
                Ok(())
            }
        }

        async fn read_raw(&mut self) -> Result<u16, ()> {
            if self.fail_read {
                Err(())
            } else {
                Ok(self.raw)
            }
        }
    }

    fn input(raw: u16) -> FixedInput {
        FixedInput {
            raw,
            fail_init: false,
            fail_read: false,
        }
    }

    #[test]
    fn builtin_table_is_valid() {
        assert!(ThermistorTable::new(&NTC_100K_POINTS).is_ok());
        assert_eq!(NTC_100K.points().len(), 61);
    }

    #[test]
    fn rejects_unordered_table() {
        let points = [pt(0.0, 10.0), pt(5.0, 12.0)];
        assert_eq!(ThermistorTable::new(&points).unwrap_err(), Error::InvalidTable);
        assert_eq!(ThermistorTable::new(&points[..1]).unwrap_err(), Error::InvalidTable);
    }

    #[test]
    fn every_entry_is_exact() {
        for point in NTC_100K.points() {
            let (celsius, certainty) = NTC_100K.linearize(point.kilohms);
            assert_eq!(celsius, point.celsius);
            assert_eq!(certainty, Certainty::Exact);
        }
    }

    #[test]
    fn interpolates_between_entries() {
        // halfway between 25 C (100k) and 30 C (80.239k)
        let (celsius, certainty) = NTC_100K.linearize((100.0 + 80.239) / 2.0);
        assert_eq!(certainty, Certainty::Interpolated);
        assert!((celsius - 27.5).abs() < 1e-3, "{}", celsius);
    }

    #[test]
    fn interpolation_preserves_order() {
        for w in NTC_100K.points().windows(2) {
            let span = w[0].kilohms - w[1].kilohms;
            let higher_r = w[1].kilohms + span * 0.7;
            let lower_r = w[1].kilohms + span * 0.3;
            let (t_high_r, _) = NTC_100K.linearize(higher_r);
            let (t_low_r, _) = NTC_100K.linearize(lower_r);
            assert!(t_high_r < t_low_r);
            assert!(t_high_r > w[0].celsius && t_low_r < w[1].celsius);
        }
    }

    #[test]
    fn out_of_range_clamps_to_bounds() {
        assert_eq!(NTC_100K.linearize(1_000.0).0, 0.0);
        assert_eq!(NTC_100K.linearize(0.01).0, 300.0);
        assert_eq!(NTC_100K.linearize(f32::INFINITY).0, 0.0);
    }

    #[test]
    fn inverse_lookup_matches_forward() {
        for celsius in [12.5_f32, 60.0, 182.0, 247.3] {
            let kilohms = NTC_100K.resistance_at(celsius);
            let (back, _) = NTC_100K.linearize(kilohms);
            assert!((back - celsius).abs() < 0.01, "{} -> {}", celsius, back);
        }
    }

    #[test]
    fn divider_roundtrips_resistance() {
        let divider = Divider::default();
        let raw = divider.raw_for_kilohms(4.7);
        // 4.7k against 4.7k sits mid-scale
        assert_eq!(raw, 2048);
        assert!((divider.kilohms(raw) - 4.7).abs() < 0.01);
        assert_eq!(divider.kilohms(0), f32::INFINITY);
        assert_eq!(divider.kilohms(4095), 0.0);
    }

    #[test]
    fn reads_through_input() {
        let divider = Divider::default();
        let raw = divider.raw_for_kilohms(NTC_100K.resistance_at(60.0));
        let mut thermistor = block_on(Thermistor::new(input(raw), divider, NTC_100K)).unwrap();
        let reading = block_on(thermistor.read()).unwrap();
        assert_eq!(reading.raw, raw);
        assert!((reading.celsius - 60.0).abs() < 0.5, "{}", reading.celsius);
    }

    #[test]
    fn init_failure_is_reported() {
        let mut bad = input(0);
        bad.fail_init = true;
        let result = block_on(Thermistor::new(bad, Divider::default(), NTC_100K));
        assert_eq!(result.err(), Some(Error::Init));
    }

    #[test]
    fn read_failure_is_latched() {
        let mut thermistor =
            block_on(Thermistor::new(input(2000), Divider::default(), NTC_100K)).unwrap();
        thermistor.input_mut().fail_read = true;
        assert_eq!(block_on(thermistor.read()), Err(Error::Read));
        assert_eq!(thermistor.last_error(), Some(Error::Read));

        thermistor.input_mut().fail_read = false;
        block_on(thermistor.reinitialize()).unwrap();
        assert_eq!(thermistor.last_error(), None);
    }
}
