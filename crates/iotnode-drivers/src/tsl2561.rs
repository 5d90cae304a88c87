//! # TSL2561 Driver
//!
//! This module provides an architecture-agnostic driver for the TSL2561
//! light-to-digital converter, reading the broadband and infrared channels
//! over the I²C protocol and converting them into lux.
//!
//! The lux conversion follows the integer algorithm of the datasheet for the
//! T, FN, and CL packages, so it never requires floating point arithmetic.
//!
//! For detailed information and specifications, see the [datasheet](https://cdn-shop.adafruit.com/datasheets/TSL2561.pdf).

use core::result::Result::{self, Err, Ok};

use embedded_hal::i2c::I2c;
use embedded_hal_async::delay::DelayNs;

// The command bit must be set in every register access.
const COMMAND: u8 = 0x80;
// Reads two consecutive registers in a single transaction.
const WORD: u8 = 0x20;

// Registers.
const CONTROL: u8 = 0x00;
const TIMING: u8 = 0x01;
const ID: u8 = 0x0A;
const DATA0_LOW: u8 = 0x0C;
const DATA1_LOW: u8 = 0x0E;

// Control register values.
const POWER_ON: u8 = 0x03;
const POWER_OFF: u8 = 0x00;

// Timing register gain bit.
const GAIN_16X: u8 = 0x10;

// Part numbers of the TSL2561, in the upper nibble of the ID register.
const PART_TSL2561_CS: u8 = 0x1;
const PART_TSL2561_T_FN_CL: u8 = 0x5;

// Fixed-point scales of the lux algorithm.
const LUX_SCALE: u32 = 14;
const RATIO_SCALE: u32 = 9;
const CH_SCALE: u32 = 10;
// 322/11 * 2^CH_SCALE and 322/81 * 2^CH_SCALE.
const CHSCALE_TINT0: u32 = 0x7517;
const CHSCALE_TINT1: u32 = 0x0FE7;

// Ratio thresholds and their `(B, M)` coefficients, T, FN, and CL packages.
const COEFFICIENTS: [(u32, u32, u32); 8] = [
    (0x0040, 0x01f2, 0x01be),
    (0x0080, 0x0214, 0x02d1),
    (0x00c0, 0x023f, 0x037b),
    (0x0100, 0x0270, 0x03fe),
    (0x0138, 0x016f, 0x01fc),
    (0x019a, 0x00d2, 0x00fb),
    (0x029a, 0x0018, 0x0012),
    (0x029a, 0x0000, 0x0000),
];

/// Errors that may occur while interacting with the TSL2561 sensor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Tsl2561Error<E> {
    /// I²C bus error.
    I2c(E),
    /// The device answering on the bus is not a TSL2561.
    UnknownDevice(u8),
    /// At least one channel reached its maximum count.
    ///
    /// The light level is too high for the current timing, which makes the
    /// computed lux meaningless.
    Saturated,
}

impl<E> From<E> for Tsl2561Error<E> {
    fn from(e: E) -> Self {
        Tsl2561Error::I2c(e)
    }
}

impl<E: core::fmt::Debug> core::fmt::Display for Tsl2561Error<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::I2c(e) => write!(f, "I²C bus error: {e:?}"),
            Self::UnknownDevice(id) => write!(f, "unknown device with id {id:#04x}"),
            Self::Saturated => f.write_str("sensor saturated"),
        }
    }
}

/// I²C address of the TSL2561 sensor.
///
/// The address depends on how the ADDR SEL pin is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Address {
    /// `0x29` when ADDR SEL is connected to GND.
    Low = 0x29,
    /// `0x39` when ADDR SEL is floating.
    Float = 0x39,
    /// `0x49` when ADDR SEL is connected to VDD.
    High = 0x49,
}

/// Integration time of an ADC conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrationTime {
    /// 13.7 ms.
    Ms13,
    /// 101 ms.
    Ms101,
    /// 402 ms.
    Ms402,
}

impl IntegrationTime {
    #[inline]
    const fn bits(self) -> u8 {
        match self {
            Self::Ms13 => 0x00,
            Self::Ms101 => 0x01,
            Self::Ms402 => 0x02,
        }
    }

    #[inline]
    const fn millis(self) -> u32 {
        match self {
            Self::Ms13 => 14,
            Self::Ms101 => 101,
            Self::Ms402 => 402,
        }
    }

    // Channels at or above this count are saturated.
    #[inline]
    const fn max_count(self) -> u16 {
        match self {
            Self::Ms13 => 5047,
            Self::Ms101 => 37177,
            Self::Ms402 => 65535,
        }
    }

    #[inline]
    const fn channel_scale(self) -> u32 {
        match self {
            Self::Ms13 => CHSCALE_TINT0,
            Self::Ms101 => CHSCALE_TINT1,
            Self::Ms402 => 1 << CH_SCALE,
        }
    }
}

/// Analog gain of the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gain {
    /// Low gain, for bright environments.
    X1,
    /// High gain, for dim environments.
    X16,
}

/// Raw counts of the two photodiode channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channels {
    /// Visible and infrared light.
    pub broadband: u16,
    /// Infrared light only.
    pub infrared: u16,
}

/// Computes the illuminance in lux out of raw channel counts.
///
/// # Errors
///
/// Returns [`Tsl2561Error::Saturated`] when any channel reached its maximum
/// count for the given integration time.
pub fn lux<E>(
    channels: Channels,
    integration: IntegrationTime,
    gain: Gain,
) -> Result<u32, Tsl2561Error<E>> {
    let max = integration.max_count();
    if channels.broadband >= max || channels.infrared >= max {
        return Err(Tsl2561Error::Saturated);
    }

    // Normalize the counts to a 402 ms integration time at 16x gain.
    let mut scale = integration.channel_scale();
    if gain == Gain::X1 {
        scale <<= 4;
    }

    let ch0 = (u32::from(channels.broadband) * scale) >> CH_SCALE;
    let ch1 = (u32::from(channels.infrared) * scale) >> CH_SCALE;

    let ratio = if ch0 == 0 {
        0
    } else {
        (((ch1 << (RATIO_SCALE + 1)) / ch0) + 1) >> 1
    };

    let (_, b, m) = COEFFICIENTS
        .iter()
        .copied()
        .find(|(threshold, _, _)| ratio <= *threshold)
        .unwrap_or(COEFFICIENTS[COEFFICIENTS.len() - 1]);

    let value = (ch0 * b).saturating_sub(ch1 * m) + (1 << (LUX_SCALE - 1));

    Ok(value >> LUX_SCALE)
}

/// TSL2561 driver.
pub struct Tsl2561<I2C> {
    i2c: I2C,
    address: Address,
    integration: IntegrationTime,
    gain: Gain,
}

impl<I2C, E> Tsl2561<I2C>
where
    I2C: I2c<u8, Error = E>,
{
    /// Creates a new [`Tsl2561`] driver with the given I²C bus and address.
    ///
    /// The driver assumes the power-on timing of the sensor: 402 ms
    /// integration time and 1x gain.
    #[must_use]
    pub fn new(i2c: I2C, address: Address) -> Self {
        Self {
            i2c,
            address,
            integration: IntegrationTime::Ms402,
            gain: Gain::X1,
        }
    }

    /// Checks the identity of the device and powers it on with the current
    /// timing, then waits for the first conversion to complete.
    ///
    /// # Errors
    ///
    /// Returns:
    /// - [`Tsl2561Error::UnknownDevice`] if the part number does not belong
    ///   to a TSL2561
    /// - An I²C error if communication with the device fails
    pub async fn enable<D: DelayNs>(&mut self, delay: &mut D) -> Result<(), Tsl2561Error<E>> {
        let _ = self.id()?;
        self.power_on()?;
        self.set_timing(self.integration, self.gain)?;
        delay.delay_ms(self.integration.millis()).await;

        Ok(())
    }

    /// Reads the ID register.
    ///
    /// # Errors
    ///
    /// Returns [`Tsl2561Error::UnknownDevice`] if the part number does not
    /// belong to a TSL2561, or an I²C error.
    pub fn id(&mut self) -> Result<u8, Tsl2561Error<E>> {
        let mut buf = [0u8; 1];
        self.i2c
            .write_read(self.address as u8, &[COMMAND | ID], &mut buf)?;

        let id = buf[0];
        match id >> 4 {
            PART_TSL2561_CS | PART_TSL2561_T_FN_CL => Ok(id),
            _ => Err(Tsl2561Error::UnknownDevice(id)),
        }
    }

    /// Puts the sensor into the power-up state.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying I²C bus operation fails.
    pub fn power_on(&mut self) -> Result<(), Tsl2561Error<E>> {
        self.write_register(CONTROL, POWER_ON)
    }

    /// Puts the sensor into the power-down state.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying I²C bus operation fails.
    pub fn power_down(&mut self) -> Result<(), Tsl2561Error<E>> {
        self.write_register(CONTROL, POWER_OFF)
    }

    /// Sets the integration time and the gain.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying I²C bus operation fails.
    pub fn set_timing(
        &mut self,
        integration: IntegrationTime,
        gain: Gain,
    ) -> Result<(), Tsl2561Error<E>> {
        let gain_bit = match gain {
            Gain::X1 => 0,
            Gain::X16 => GAIN_16X,
        };
        self.write_register(TIMING, gain_bit | integration.bits())?;

        self.integration = integration;
        self.gain = gain;

        Ok(())
    }

    /// Returns the configured integration time.
    #[must_use]
    pub const fn integration(&self) -> IntegrationTime {
        self.integration
    }

    /// Returns the configured gain.
    #[must_use]
    pub const fn gain(&self) -> Gain {
        self.gain
    }

    /// Reads the raw counts of both channels.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying I²C bus operation fails.
    pub fn channels(&mut self) -> Result<Channels, Tsl2561Error<E>> {
        Ok(Channels {
            broadband: self.read_word(DATA0_LOW)?,
            infrared: self.read_word(DATA1_LOW)?,
        })
    }

    /// Reads both channels and returns the illuminance in lux.
    ///
    /// # Errors
    ///
    /// Returns:
    /// - [`Tsl2561Error::Saturated`] if the light level is too high for the
    ///   current timing
    /// - An I²C error if communication with the device fails
    pub fn illuminance(&mut self) -> Result<u32, Tsl2561Error<E>> {
        let channels = self.channels()?;
        lux(channels, self.integration, self.gain)
    }

    /// Releases the I²C bus.
    pub fn release(self) -> I2C {
        self.i2c
    }

    #[inline]
    fn write_register(&mut self, register: u8, value: u8) -> Result<(), Tsl2561Error<E>> {
        self.i2c
            .write(self.address as u8, &[COMMAND | register, value])?;

        Ok(())
    }

    #[inline]
    fn read_word(&mut self, register: u8) -> Result<u16, E> {
        let mut buf = [0u8; 2];
        self.i2c
            .write_read(self.address as u8, &[COMMAND | WORD | register], &mut buf)?;

        Ok(u16::from_le_bytes(buf))
    }
}

#[cfg(feature = "iotnode")]
impl<I2C, E> iotnode::Sensor for Tsl2561<I2C>
where
    I2C: I2c<u8, Error = E> + Send,
    E: core::fmt::Debug + Send,
{
    type Reading = iotnode::reading::Illuminance;
    type Error = Tsl2561Error<E>;

    fn read(
        &mut self,
    ) -> impl core::future::Future<Output = Result<Self::Reading, Self::Error>> + Send {
        core::future::ready(self.illuminance().map(iotnode::reading::Illuminance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern crate std;
    use std::vec;

    use embedded_hal_mock::eh1::delay::NoopDelay;
    use embedded_hal_mock::eh1::i2c::{Mock as I2cMock, Transaction as I2cTransaction};

    fn channels(broadband: u16, infrared: u16) -> Channels {
        Channels {
            broadband,
            infrared,
        }
    }

    #[test]
    fn test_lux_conversion() {
        let lux = |c, i, g| lux::<()>(c, i, g).unwrap();

        assert_eq!(lux(channels(1000, 0), IntegrationTime::Ms402, Gain::X16), 30);
        assert_eq!(lux(channels(1000, 0), IntegrationTime::Ms402, Gain::X1), 486);
        assert_eq!(lux(channels(0, 0), IntegrationTime::Ms101, Gain::X1), 0);

        // More infrared light lowers the result.
        assert!(
            lux(channels(1000, 400), IntegrationTime::Ms402, Gain::X16)
                < lux(channels(1000, 100), IntegrationTime::Ms402, Gain::X16)
        );
        // Infrared only.
        assert_eq!(lux(channels(100, 200), IntegrationTime::Ms402, Gain::X16), 0);
    }

    #[test]
    fn test_saturation() {
        assert_eq!(
            lux::<()>(channels(5047, 0), IntegrationTime::Ms13, Gain::X1),
            Err(Tsl2561Error::Saturated)
        );
        assert_eq!(
            lux::<()>(channels(10, 37177), IntegrationTime::Ms101, Gain::X1),
            Err(Tsl2561Error::Saturated)
        );
        assert!(lux::<()>(channels(5046, 0), IntegrationTime::Ms13, Gain::X1).is_ok());
    }

    #[test]
    fn test_id() {
        let expectations = [
            I2cTransaction::write_read(0x39, vec![0x8A], vec![0x50]),
            I2cTransaction::write_read(0x39, vec![0x8A], vec![0x20]),
        ];

        let i2c = I2cMock::new(&expectations);
        let mut tsl2561 = Tsl2561::new(i2c, Address::Float);

        assert_eq!(tsl2561.id().unwrap(), 0x50);
        assert_eq!(tsl2561.id(), Err(Tsl2561Error::UnknownDevice(0x20)));

        tsl2561.release().done();
    }

    #[test]
    fn test_power_and_timing() {
        let expectations = [
            I2cTransaction::write(0x29, vec![0x80, 0x03]), // Power on.
            I2cTransaction::write(0x29, vec![0x81, 0x11]), // 101 ms, 16x.
            I2cTransaction::write(0x29, vec![0x80, 0x00]), // Power down.
        ];

        let i2c = I2cMock::new(&expectations);
        let mut tsl2561 = Tsl2561::new(i2c, Address::Low);

        tsl2561.power_on().unwrap();
        tsl2561
            .set_timing(IntegrationTime::Ms101, Gain::X16)
            .unwrap();
        assert_eq!(tsl2561.integration(), IntegrationTime::Ms101);
        assert_eq!(tsl2561.gain(), Gain::X16);
        tsl2561.power_down().unwrap();

        tsl2561.release().done();
    }

    #[tokio::test]
    async fn test_enable() {
        let expectations = [
            I2cTransaction::write_read(0x49, vec![0x8A], vec![0x1A]), // ID.
            I2cTransaction::write(0x49, vec![0x80, 0x03]),            // Power on.
            I2cTransaction::write(0x49, vec![0x81, 0x02]),            // 402 ms, 1x.
        ];

        let i2c = I2cMock::new(&expectations);
        let mut delay = NoopDelay::new();
        let mut tsl2561 = Tsl2561::new(i2c, Address::High);

        tsl2561.enable(&mut delay).await.unwrap();

        tsl2561.release().done();
    }

    #[test]
    fn test_illuminance() {
        // Channels are little-endian words: broadband 1000, infrared 0.
        let expectations = [
            I2cTransaction::write_read(0x39, vec![0xAC], vec![0xE8, 0x03]),
            I2cTransaction::write_read(0x39, vec![0xAE], vec![0x00, 0x00]),
        ];

        let i2c = I2cMock::new(&expectations);
        let mut tsl2561 = Tsl2561::new(i2c, Address::Float);

        assert_eq!(tsl2561.illuminance().unwrap(), 486);

        tsl2561.release().done();
    }

    #[cfg(feature = "iotnode")]
    #[tokio::test]
    async fn test_sensor_reading() {
        use iotnode::Sensor;

        let expectations = [
            I2cTransaction::write_read(0x39, vec![0xAC], vec![0xE8, 0x03]),
            I2cTransaction::write_read(0x39, vec![0xAE], vec![0x00, 0x00]),
            I2cTransaction::write_read(0x39, vec![0xAC], vec![0xFF, 0xFF]),
            I2cTransaction::write_read(0x39, vec![0xAE], vec![0x00, 0x00]),
        ];

        let i2c = I2cMock::new(&expectations);
        let mut tsl2561 = Tsl2561::new(i2c, Address::Float);

        let reading = tsl2561.read().await.unwrap();
        assert_eq!(reading, iotnode::reading::Illuminance(486));

        assert_eq!(tsl2561.read().await, Err(Tsl2561Error::Saturated));

        tsl2561.release().done();
    }
}
