//! Engineering units and display-unit conversion.
//!
//! Every tag stores values in a base unit and is shown in a display unit.
//! A [`Reading`] couples a value with its unit and can be converted to any
//! other unit of the same [`Quantity`].
//!
//! Conversions go through the SI unit of each quantity:
//! `si = value * factor + offset`.

use crate::error::{AppResult, AutomationError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Physical quantity a unit measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantity {
    /// SI unit: kelvin
    Temperature,
    /// SI unit: meter
    Length,
    /// SI unit: pascal
    Pressure,
    /// SI unit: kilogram
    Mass,
    /// SI unit: second
    Time,
    /// SI unit: ampere
    Current,
    /// SI unit: watt
    Power,
    /// SI unit: newton
    Force,
    /// SI unit: cubic meter per second
    VolumetricFlow,
    /// Unitless counts, ratios and flags
    Dimensionless,
}

/// Supported engineering units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Unit {
    // Temperature
    /// Degree Celsius
    #[serde(rename = "degC")]
    Celsius,
    /// Degree Fahrenheit
    #[serde(rename = "degF")]
    Fahrenheit,
    /// Kelvin
    #[serde(rename = "K")]
    Kelvin,
    /// Degree Rankine
    #[serde(rename = "degR")]
    Rankine,
    // Length
    /// Meter
    #[serde(rename = "m")]
    Meter,
    /// Centimeter
    #[serde(rename = "cm")]
    Centimeter,
    /// Millimeter
    #[serde(rename = "mm")]
    Millimeter,
    /// Inch
    #[serde(rename = "in")]
    Inch,
    /// Foot
    #[serde(rename = "ft")]
    Foot,
    // Pressure
    /// Pascal
    #[serde(rename = "Pa")]
    Pascal,
    /// Kilopascal
    #[serde(rename = "kPa")]
    Kilopascal,
    /// Bar
    #[serde(rename = "bar")]
    Bar,
    /// Pound per square inch
    #[serde(rename = "psi")]
    Psi,
    /// Atmosphere
    #[serde(rename = "atm")]
    Atmosphere,
    // Mass
    /// Kilogram
    #[serde(rename = "kg")]
    Kilogram,
    /// Gram
    #[serde(rename = "g")]
    Gram,
    /// Pound
    #[serde(rename = "lb")]
    Pound,
    // Time
    /// Second
    #[serde(rename = "s")]
    Second,
    /// Millisecond
    #[serde(rename = "ms")]
    Millisecond,
    /// Minute
    #[serde(rename = "min")]
    Minute,
    /// Hour
    #[serde(rename = "h")]
    Hour,
    // Current
    /// Ampere
    #[serde(rename = "A")]
    Ampere,
    /// Milliampere
    #[serde(rename = "mA")]
    Milliampere,
    // Power
    /// Watt
    #[serde(rename = "W")]
    Watt,
    /// Kilowatt
    #[serde(rename = "kW")]
    Kilowatt,
    /// Horsepower
    #[serde(rename = "hp")]
    Horsepower,
    // Force
    /// Newton
    #[serde(rename = "N")]
    Newton,
    /// Kilonewton
    #[serde(rename = "kN")]
    Kilonewton,
    /// Pound-force
    #[serde(rename = "lbf")]
    PoundForce,
    // Volumetric flow
    /// Cubic meter per second
    #[serde(rename = "m3/s")]
    CubicMeterPerSecond,
    /// Cubic meter per hour
    #[serde(rename = "m3/h")]
    CubicMeterPerHour,
    /// Liter per minute
    #[serde(rename = "L/min")]
    LiterPerMinute,
    /// US gallon per minute
    #[serde(rename = "gal/min")]
    GallonPerMinute,
    // Dimensionless
    /// No unit
    #[serde(rename = "")]
    Unitless,
    /// Percent
    #[serde(rename = "%")]
    Percent,
}

const ALL_UNITS: [Unit; 35] = [
    Unit::Celsius,
    Unit::Fahrenheit,
    Unit::Kelvin,
    Unit::Rankine,
    Unit::Meter,
    Unit::Centimeter,
    Unit::Millimeter,
    Unit::Inch,
    Unit::Foot,
    Unit::Pascal,
    Unit::Kilopascal,
    Unit::Bar,
    Unit::Psi,
    Unit::Atmosphere,
    Unit::Kilogram,
    Unit::Gram,
    Unit::Pound,
    Unit::Second,
    Unit::Millisecond,
    Unit::Minute,
    Unit::Hour,
    Unit::Ampere,
    Unit::Milliampere,
    Unit::Watt,
    Unit::Kilowatt,
    Unit::Horsepower,
    Unit::Newton,
    Unit::Kilonewton,
    Unit::PoundForce,
    Unit::CubicMeterPerSecond,
    Unit::CubicMeterPerHour,
    Unit::LiterPerMinute,
    Unit::GallonPerMinute,
    Unit::Unitless,
    Unit::Percent,
];

impl Unit {
    /// Quantity family of this unit.
    pub fn quantity(&self) -> Quantity {
        use Unit::*;
        match self {
            Celsius | Fahrenheit | Kelvin | Rankine => Quantity::Temperature,
            Meter | Centimeter | Millimeter | Inch | Foot => Quantity::Length,
            Pascal | Kilopascal | Bar | Psi | Atmosphere => Quantity::Pressure,
            Kilogram | Gram | Pound => Quantity::Mass,
            Second | Millisecond | Minute | Hour => Quantity::Time,
            Ampere | Milliampere => Quantity::Current,
            Watt | Kilowatt | Horsepower => Quantity::Power,
            Newton | Kilonewton | PoundForce => Quantity::Force,
            CubicMeterPerSecond | CubicMeterPerHour | LiterPerMinute | GallonPerMinute => {
                Quantity::VolumetricFlow
            }
            Unitless | Percent => Quantity::Dimensionless,
        }
    }

    /// Unit symbol.
    pub fn symbol(&self) -> &'static str {
        use Unit::*;
        match self {
            Celsius => "degC",
            Fahrenheit => "degF",
            Kelvin => "K",
            Rankine => "degR",
            Meter => "m",
            Centimeter => "cm",
            Millimeter => "mm",
            Inch => "in",
            Foot => "ft",
            Pascal => "Pa",
            Kilopascal => "kPa",
            Bar => "bar",
            Psi => "psi",
            Atmosphere => "atm",
            Kilogram => "kg",
            Gram => "g",
            Pound => "lb",
            Second => "s",
            Millisecond => "ms",
            Minute => "min",
            Hour => "h",
            Ampere => "A",
            Milliampere => "mA",
            Watt => "W",
            Kilowatt => "kW",
            Horsepower => "hp",
            Newton => "N",
            Kilonewton => "kN",
            PoundForce => "lbf",
            CubicMeterPerSecond => "m3/s",
            CubicMeterPerHour => "m3/h",
            LiterPerMinute => "L/min",
            GallonPerMinute => "gal/min",
            Unitless => "",
            Percent => "%",
        }
    }

    /// `(factor, offset)` mapping a value in this unit onto the SI unit.
    fn to_si(self) -> (f64, f64) {
        use Unit::*;
        match self {
            Celsius => (1.0, 273.15),
            Fahrenheit => (5.0 / 9.0, 273.15 - 32.0 * 5.0 / 9.0),
            Kelvin => (1.0, 0.0),
            Rankine => (5.0 / 9.0, 0.0),
            Meter => (1.0, 0.0),
            Centimeter => (0.01, 0.0),
            Millimeter => (0.001, 0.0),
            Inch => (0.0254, 0.0),
            Foot => (0.3048, 0.0),
            Pascal => (1.0, 0.0),
            Kilopascal => (1_000.0, 0.0),
            Bar => (100_000.0, 0.0),
            Psi => (6_894.757_293_168, 0.0),
            Atmosphere => (101_325.0, 0.0),
            Kilogram => (1.0, 0.0),
            Gram => (0.001, 0.0),
            Pound => (0.453_592_37, 0.0),
            Second => (1.0, 0.0),
            Millisecond => (0.001, 0.0),
            Minute => (60.0, 0.0),
            Hour => (3_600.0, 0.0),
            Ampere => (1.0, 0.0),
            Milliampere => (0.001, 0.0),
            Watt => (1.0, 0.0),
            Kilowatt => (1_000.0, 0.0),
            Horsepower => (745.699_871_582_27, 0.0),
            Newton => (1.0, 0.0),
            Kilonewton => (1_000.0, 0.0),
            PoundForce => (4.448_221_615_260_5, 0.0),
            CubicMeterPerSecond => (1.0, 0.0),
            CubicMeterPerHour => (1.0 / 3_600.0, 0.0),
            LiterPerMinute => (0.001 / 60.0, 0.0),
            GallonPerMinute => (0.003_785_411_784 / 60.0, 0.0),
            Unitless => (1.0, 0.0),
            Percent => (0.01, 0.0),
        }
    }

    /// Convert `value` from this unit into `target`.
    ///
    /// # Errors
    /// Returns `UnitMismatch` if the units measure different quantities.
    pub fn convert(self, value: f64, target: Unit) -> AppResult<f64> {
        if self == target {
            return Ok(value);
        }
        if self.quantity() != target.quantity() {
            return Err(AutomationError::UnitMismatch {
                from: self.symbol().to_string(),
                to: target.symbol().to_string(),
            });
        }

        let (factor, offset) = self.to_si();
        let si = value * factor + offset;
        let (target_factor, target_offset) = target.to_si();
        Ok((si - target_offset) / target_factor)
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Unit {
    type Err = AutomationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_UNITS
            .iter()
            .copied()
            .find(|unit| unit.symbol() == s)
            .ok_or_else(|| AutomationError::InvalidAttribute(format!("Unknown unit '{}'", s)))
    }
}

/// A value expressed in a specific unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Magnitude
    pub value: f64,
    /// Unit of `value`
    pub unit: Unit,
}

impl Reading {
    /// Reading of `value` in `unit`.
    pub fn new(value: f64, unit: Unit) -> Self {
        Self { value, unit }
    }

    /// Express this reading in `target`.
    pub fn convert(&self, target: Unit) -> AppResult<Reading> {
        let value = self.unit.convert(self.value, target)?;
        Ok(Reading::new(value, target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-6, "{} != {}", a, b);
    }

    #[test]
    fn temperature_conversion_uses_offsets() {
        assert_close(Unit::Celsius.convert(100.0, Unit::Fahrenheit).unwrap(), 212.0);
        assert_close(Unit::Fahrenheit.convert(32.0, Unit::Celsius).unwrap(), 0.0);
        assert_close(Unit::Celsius.convert(0.0, Unit::Kelvin).unwrap(), 273.15);
        assert_close(Unit::Kelvin.convert(0.0, Unit::Rankine).unwrap(), 0.0);
    }

    #[test]
    fn linear_conversions() {
        assert_close(Unit::Bar.convert(1.0, Unit::Kilopascal).unwrap(), 100.0);
        assert_close(Unit::Foot.convert(1.0, Unit::Inch).unwrap(), 12.0);
        assert_close(Unit::Hour.convert(1.5, Unit::Minute).unwrap(), 90.0);
        assert_close(Unit::CubicMeterPerHour.convert(3.6, Unit::LiterPerMinute).unwrap(), 60.0);
    }

    #[test]
    fn cross_quantity_conversion_fails() {
        let err = Unit::Meter.convert(1.0, Unit::Second).unwrap_err();
        assert!(matches!(err, AutomationError::UnitMismatch { .. }));
    }

    #[test]
    fn symbols_round_trip_through_from_str() {
        for unit in ALL_UNITS {
            assert_eq!(unit.symbol().parse::<Unit>().unwrap(), unit);
        }
        assert!("furlong".parse::<Unit>().is_err());
    }

    #[test]
    fn serde_names_match_symbols() {
        let json = serde_json::to_string(&Unit::LiterPerMinute).unwrap();
        assert_eq!(json, "\"L/min\"");
        let unit: Unit = serde_json::from_str("\"degC\"").unwrap();
        assert_eq!(unit, Unit::Celsius);
    }

    #[test]
    fn reading_converts_into_target_unit() {
        let reading = Reading::new(2.0, Unit::Kilowatt).convert(Unit::Watt).unwrap();
        assert_eq!(reading.unit, Unit::Watt);
        assert_close(reading.value, 2_000.0);
    }
}
