//! # LED Driver
//!
//! A LED wired to a GPIO output pin, either lit when the pin is high
//! (active-high) or when it is low (active-low, common on development
//! boards).

use core::result::Result::{self, Ok};

use embedded_hal::digital::StatefulOutputPin;

/// Errors that may occur while driving the LED.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LedError<E> {
    /// GPIO pin error.
    Pin(E),
}

impl<E> From<E> for LedError<E> {
    fn from(e: E) -> Self {
        LedError::Pin(e)
    }
}

impl<E: core::fmt::Debug> core::fmt::Display for LedError<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Pin(e) => write!(f, "GPIO pin error: {e:?}"),
        }
    }
}

/// Electrical level which lights the LED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    /// The LED is lit when the pin is high.
    ActiveHigh,
    /// The LED is lit when the pin is low.
    ActiveLow,
}

/// LED driver.
pub struct Led<P> {
    pin: P,
    polarity: Polarity,
}

impl<P, E> Led<P>
where
    P: StatefulOutputPin<Error = E>,
{
    /// Creates a new [`Led`] driver with the given pin and polarity.
    #[must_use]
    pub const fn new(pin: P, polarity: Polarity) -> Self {
        Self { pin, polarity }
    }

    /// Lights the LED.
    ///
    /// # Errors
    ///
    /// Returns an error if the pin cannot be driven.
    pub fn on(&mut self) -> Result<(), LedError<E>> {
        self.set(true)
    }

    /// Turns the LED off.
    ///
    /// # Errors
    ///
    /// Returns an error if the pin cannot be driven.
    pub fn off(&mut self) -> Result<(), LedError<E>> {
        self.set(false)
    }

    /// Lights the LED when `on` is `true`, turns it off otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if the pin cannot be driven.
    pub fn set(&mut self, on: bool) -> Result<(), LedError<E>> {
        let high = match self.polarity {
            Polarity::ActiveHigh => on,
            Polarity::ActiveLow => !on,
        };

        if high {
            self.pin.set_high()?;
        } else {
            self.pin.set_low()?;
        }

        Ok(())
    }

    /// Inverts the LED state and returns the new one.
    ///
    /// # Errors
    ///
    /// Returns an error if the pin cannot be read or driven.
    pub fn toggle(&mut self) -> Result<bool, LedError<E>> {
        let on = !self.is_on()?;
        self.set(on)?;

        Ok(on)
    }

    /// Checks whether the LED is lit.
    ///
    /// # Errors
    ///
    /// Returns an error if the pin state cannot be read.
    pub fn is_on(&mut self) -> Result<bool, LedError<E>> {
        let high = self.pin.is_set_high()?;

        Ok(match self.polarity {
            Polarity::ActiveHigh => high,
            Polarity::ActiveLow => !high,
        })
    }

    /// Releases the pin.
    pub fn release(self) -> P {
        self.pin
    }
}

#[cfg(feature = "iotnode")]
impl<P, E> iotnode::Sensor for Led<P>
where
    P: StatefulOutputPin<Error = E> + Send,
    E: core::fmt::Debug + Send,
{
    type Reading = iotnode::reading::LedState;
    type Error = LedError<E>;

    fn read(
        &mut self,
    ) -> impl core::future::Future<Output = Result<Self::Reading, Self::Error>> + Send {
        core::future::ready(self.is_on().map(iotnode::reading::LedState))
    }
}
