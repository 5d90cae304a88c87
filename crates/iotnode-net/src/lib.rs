//! The `iotnode-net` library crate provides the messaging collaborators of
//! an IoT node, that is everything a periodic job needs to deliver its
//! readings, plus the resources a node exposes to the network.
//!
//! This crate provides APIs to:
//!
//! - Post payloads to a fixed `CoAP` peer
//! - Serve node resources over `CoAP`
//! - Publish payloads on `MQTT` topics
//! - Announce a node and its resources, and build its liveness beacons
//!
//! Both [`coap::CoapClient`] and [`mqtt::MqttPublisher`] implement
//! [`iotnode::Messenger`], so they can be plugged into any job built by
//! [`iotnode::jobs`].

#![forbid(unsafe_code)]
#![deny(missing_docs)]

/// Peer address parsing.
pub mod address;
/// `CoAP` message codec, client and resource server.
pub mod coap;
/// Error management.
pub mod error;
/// `MQTT` publisher.
pub mod mqtt;
/// Node identity, announcements and beacons.
pub mod node;
