//! `iotnode-drivers` provides architecture-agnostic drivers for the sensors
//! and actuators mounted on IoT nodes.
//!
//! All drivers are implemented using only the [`embedded-hal`] and
//! [`embedded-hal-async`] traits, ensuring compatibility with any platform
//! that supports these abstractions.
//!
//! With the `iotnode` feature, every driver also implements
//! [`iotnode::Sensor`], so it can be polled by a periodic publishing job.
//!
//! [`embedded-hal`]: https://crates.io/crates/embedded-hal
//! [`embedded-hal-async`]: https://crates.io/crates/embedded-hal-async

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![no_std]

/// The on-board LED driver.
#[cfg(feature = "led")]
pub mod led;

/// The `TSL2561` driver.
#[cfg(feature = "tsl2561")]
pub mod tsl2561;
