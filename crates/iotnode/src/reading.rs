use core::fmt::{Display, Formatter, Result};

/// A temperature, in hundredths of degree Celsius.
///
/// It is displayed with one decimal digit, e.g. `23.5°C`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Temperature(pub i16);

impl Temperature {
    /// Creates a [`Temperature`] from hundredths of degree Celsius.
    #[must_use]
    pub const fn from_centi_celsius(value: i16) -> Self {
        Self(value)
    }
}

impl Display for Temperature {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let value = self.0.unsigned_abs();
        write!(f, "{sign}{}.{}°C", value / 100, (value % 100) / 10)
    }
}

/// An atmospheric pressure, in Pascal.
///
/// It is displayed in hectoPascal, e.g. `1013.25hPa`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Pressure(pub u32);

impl Display for Pressure {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{}.{:02}hPa", self.0 / 100, self.0 % 100)
    }
}

/// A relative humidity, in hundredths of percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Humidity(pub u16);

impl Display for Humidity {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{}.{:02}%", self.0 / 100, self.0 % 100)
    }
}

/// An illuminance, in lux.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Illuminance(pub u32);

impl Display for Illuminance {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{}lx", self.0)
    }
}

/// The state of a LED, displayed as `1` when lit and `0` otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedState(pub bool);

impl Display for LedState {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        f.write_str(if self.0 { "1" } else { "0" })
    }
}

/// Accelerometer and gyroscope samples of an inertial unit.
///
/// It is displayed as a JSON array with one object per sensor type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Inertial {
    /// Acceleration on the `x`, `y`, and `z` axes.
    pub acc: [i16; 3],
    /// Angular rate on the `x`, `y`, and `z` axes.
    pub gyro: [i16; 3],
}

impl Display for Inertial {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        let [ax, ay, az] = self.acc;
        let [gx, gy, gz] = self.gyro;
        write!(
            f,
            r#"[{{"type":"acc","values":[{ax}, {ay}, {az}]}},{{"type":"gyro","values":[{gx}, {gy}, {gz}]}}]"#
        )
    }
}
