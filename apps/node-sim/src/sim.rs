use std::convert::Infallible;
use std::f64::consts::TAU;
use std::future::Future;
use std::time::Duration;

use embedded_hal::digital::{self, OutputPin, StatefulOutputPin};
use embedded_hal::i2c::{self, I2c, Operation, SevenBitAddress};
use embedded_hal_async::delay::DelayNs;

use tokio::time::Instant;

use iotnode::Sensor;
use iotnode::reading::{Humidity, Inertial, Pressure, Temperature};

// TSL2561 registers emulated by the light bus.
const TSL2561_TIMING: u8 = 0x01;
const TSL2561_ID: u8 = 0x0A;
const TSL2561_DATA0: u8 = 0x0C;
const TSL2561_DATA1: u8 = 0x0E;
const TSL2561_PART: u8 = 0x50;

// A slow sinusoidal drift around a base value.
#[derive(Debug, Clone, Copy)]
struct Wave {
    start: Instant,
    base: f64,
    amplitude: f64,
    period: Duration,
}

impl Wave {
    fn new(base: f64, amplitude: f64, period: Duration) -> Self {
        Self {
            start: Instant::now(),
            base,
            amplitude,
            period,
        }
    }

    fn sample(&self) -> f64 {
        let phase = self.start.elapsed().as_secs_f64() / self.period.as_secs_f64();
        self.base + self.amplitude * (TAU * phase).sin()
    }
}

/// A simulated temperature sensor.
#[derive(Debug)]
pub struct Thermometer(Wave);

impl Thermometer {
    /// Creates a [`Thermometer`] drifting around 23.5 °C.
    pub fn new() -> Self {
        Self(Wave::new(2350., 150., Duration::from_secs(600)))
    }
}

impl Sensor for Thermometer {
    type Reading = Temperature;
    type Error = Infallible;

    fn read(&mut self) -> impl Future<Output = Result<Self::Reading, Self::Error>> + Send {
        std::future::ready(Ok(Temperature::from_centi_celsius(
            self.0.sample().round() as i16,
        )))
    }
}

/// A simulated pressure sensor.
#[derive(Debug)]
pub struct Barometer(Wave);

impl Barometer {
    /// Creates a [`Barometer`] drifting around 1013.25 hPa.
    pub fn new() -> Self {
        Self(Wave::new(101_325., 200., Duration::from_secs(1800)))
    }
}

impl Sensor for Barometer {
    type Reading = Pressure;
    type Error = Infallible;

    fn read(&mut self) -> impl Future<Output = Result<Self::Reading, Self::Error>> + Send {
        std::future::ready(Ok(Pressure(self.0.sample().round() as u32)))
    }
}

/// A simulated humidity sensor.
#[derive(Debug)]
pub struct Hygrometer(Wave);

impl Hygrometer {
    /// Creates a [`Hygrometer`] drifting around 45 %.
    pub fn new() -> Self {
        Self(Wave::new(4500., 500., Duration::from_secs(900)))
    }
}

impl Sensor for Hygrometer {
    type Reading = Humidity;
    type Error = Infallible;

    fn read(&mut self) -> impl Future<Output = Result<Self::Reading, Self::Error>> + Send {
        std::future::ready(Ok(Humidity(self.0.sample().round() as u16)))
    }
}

/// A simulated accelerometer and gyroscope, gently swaying.
#[derive(Debug)]
pub struct Imu {
    sway: Wave,
}

impl Imu {
    /// Creates an [`Imu`] lying flat.
    pub fn new() -> Self {
        Self {
            sway: Wave::new(0., 40., Duration::from_secs(20)),
        }
    }
}

impl Sensor for Imu {
    type Reading = Inertial;
    type Error = Infallible;

    fn read(&mut self) -> impl Future<Output = Result<Self::Reading, Self::Error>> + Send {
        let sway = self.sway.sample().round() as i16;
        std::future::ready(Ok(Inertial {
            acc: [sway, -sway / 2, 1000],
            gyro: [sway / 4, 0, -sway / 4],
        }))
    }
}

/// An I²C bus with a TSL2561 attached, seeing a slowly changing light.
#[derive(Debug)]
pub struct LightBus {
    register: u8,
    timing: u8,
    broadband: Wave,
    infrared: Wave,
}

impl LightBus {
    /// Creates a [`LightBus`].
    pub fn new() -> Self {
        Self {
            register: 0,
            timing: 0x02,
            broadband: Wave::new(1000., 600., Duration::from_secs(600)),
            infrared: Wave::new(300., 150., Duration::from_secs(600)),
        }
    }

    /// Returns the value last written into the timing register.
    #[cfg(test)]
    pub const fn timing(&self) -> u8 {
        self.timing
    }

    fn select(&mut self, bytes: &[u8]) {
        let Some((command, rest)) = bytes.split_first() else {
            return;
        };

        self.register = command & 0x0F;
        if let (TSL2561_TIMING, Some(value)) = (self.register, rest.first()) {
            self.timing = *value;
        }
    }

    fn fill(&self, buffer: &mut [u8]) {
        let word = |wave: &Wave| (wave.sample().max(0.) as u16).to_le_bytes();

        match self.register {
            TSL2561_ID => buffer.fill(TSL2561_PART),
            TSL2561_DATA0 => copy(buffer, &word(&self.broadband)),
            TSL2561_DATA1 => copy(buffer, &word(&self.infrared)),
            _ => buffer.fill(0),
        }
    }
}

fn copy(buffer: &mut [u8], bytes: &[u8]) {
    for (dst, src) in buffer.iter_mut().zip(bytes) {
        *dst = *src;
    }
}

impl i2c::ErrorType for LightBus {
    type Error = Infallible;
}

impl I2c for LightBus {
    fn transaction(
        &mut self,
        _address: SevenBitAddress,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        for operation in operations {
            match operation {
                Operation::Write(bytes) => self.select(bytes),
                Operation::Read(buffer) => self.fill(buffer),
            }
        }
        Ok(())
    }
}

/// The GPIO pin driving the on-board LED.
#[derive(Debug, Default)]
pub struct LedPin {
    high: bool,
}

impl digital::ErrorType for LedPin {
    type Error = Infallible;
}

impl OutputPin for LedPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.high = false;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.high = true;
        Ok(())
    }
}

impl StatefulOutputPin for LedPin {
    fn is_set_high(&mut self) -> Result<bool, Self::Error> {
        Ok(self.high)
    }

    fn is_set_low(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.high)
    }
}

/// A delay provider backed by the `tokio` timer.
#[derive(Debug, Default)]
pub struct TokioDelay;

impl DelayNs for TokioDelay {
    async fn delay_ns(&mut self, ns: u32) {
        tokio::time::sleep(Duration::from_nanos(u64::from(ns))).await;
    }
}

#[cfg(test)]
mod tests {
    use iotnode::Sensor;

    use iotnode_drivers::led::{Led, Polarity};
    use iotnode_drivers::tsl2561::{Address, Gain, IntegrationTime, Tsl2561};

    use super::{Barometer, LedPin, LightBus, Thermometer, TokioDelay};

    #[tokio::test(start_paused = true)]
    async fn environment() {
        assert_eq!(Thermometer::new().read().await.unwrap().to_string(), "23.5°C");
        assert_eq!(Barometer::new().read().await.unwrap().to_string(), "1013.25hPa");
    }

    #[tokio::test(start_paused = true)]
    async fn light_sensor() {
        let mut sensor = Tsl2561::new(LightBus::new(), Address::Float);
        sensor.enable(&mut TokioDelay).await.unwrap();
        sensor
            .set_timing(IntegrationTime::Ms101, Gain::X16)
            .unwrap();

        let lux = sensor.read().await.unwrap().0;
        assert!(lux > 0);

        assert_eq!(sensor.release().timing(), 0x11);
    }

    #[test]
    fn active_low_led() {
        let mut led = Led::new(LedPin::default(), Polarity::ActiveLow);

        led.on().unwrap();
        assert!(led.is_on().unwrap());

        led.off().unwrap();
        let mut pin = led.release();
        assert!(embedded_hal::digital::StatefulOutputPin::is_set_high(&mut pin).unwrap());
    }
}
