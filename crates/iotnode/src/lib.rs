//! `iotnode` is the scheduling core shared by all node firmwares.
//!
//! A node runs many low-frequency periodic jobs, such as polling a sensor and
//! publishing its value, or emitting an "I am alive" beacon. Instead of
//! spawning one task and one timer loop per job, every job is registered into
//! a [`registry::Registry`] owned by a single [`scheduler::Scheduler`] task.
//!
//! This crate provides APIs to:
//!
//! - Register and unregister periodic jobs, each identified by a stable
//!   [`job::JobKey`] and by a positional notification tag
//! - Arm one-shot timers which deliver typed notifications into the
//!   scheduler inbox
//! - Run the scheduler loop, which re-arms the originating job and invokes
//!   its callback for every notification it receives
//! - Build job callbacks out of a [`Sensor`] and a [`Messenger`]
//!
//! Callbacks always run on the scheduler task, one at a time and in
//! notification delivery order. A callback that blocks delays every other
//! job sharing the same scheduler.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

/// Error management.
pub mod error;
/// Periodic job descriptors.
pub mod job;
/// Ready-made job callbacks.
pub mod jobs;
/// The messaging collaborator.
pub mod messenger;
/// Notifications and their tags.
pub mod notification;
/// Physical readings along with their textual representation.
pub mod reading;
/// The ordered registry of periodic jobs.
pub mod registry;
/// The scheduler task and its handle.
pub mod scheduler;
/// The sensor collaborator.
pub mod sensor;
/// One-shot timers.
pub mod timer;

pub use messenger::Messenger;
pub use sensor::Sensor;
