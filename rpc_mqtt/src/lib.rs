// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![warn(missing_docs)]

//! Ordered-acknowledgement MQTT 5.0 session wrapper.
//!
//! This crate owns exactly one concern: turning a raw `rumqttc` v5 client/event-loop pair into a
//! session whose received QoS 1 publishes are acknowledged strictly in receive order, with
//! pluggable reconnect policy and SAT-file based enhanced re-authentication. Everything above
//! that layer (topic patterns, typed payloads, command/telemetry semantics) lives in `rpc_protocol`.

pub use crate::connection_settings::{
    MqttConnectionSettings, MqttConnectionSettingsBuilder, MqttConnectionSettingsBuilderError,
};

mod auth;
mod connection_settings;
pub mod control_packet;
pub mod error;
pub mod interface;
mod rumqttc_adapter;
pub mod session;
pub mod topic;

#[macro_use]
extern crate derive_builder;

//----------------------------------------------------------------------

// Re-export rumqttc types to avoid user code taking the dependency.
// Only once there are non-rumqttc implementations of these can we allow non-rumqttc compilations.

/// Event yielded by the event loop.
pub type Event = rumqttc::v5::Event;
/// Incoming data on the event loop.
pub type Incoming = rumqttc::v5::Incoming;
/// Outgoing data on the event loop.
pub type Outgoing = rumqttc::Outgoing;
