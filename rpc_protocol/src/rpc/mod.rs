// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Command invocation: the invoker (client) and executor (server) sides of request/response RPC
//! over MQTT.

pub mod executor;
pub mod invoker;

pub use executor::Executor;
pub use invoker::CommandInvoker;

use crate::common::error::ProtocolVersion;

/// Protocol version advertised by every command request/response this crate builds.
pub const COMMAND_PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };
