// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Fire-and-forget telemetry: a [`sender::Sender`] that stamps CloudEvents metadata on outgoing
//! messages, and a [`receiver::Receiver`] that parses it back off.

pub mod receiver;
pub mod sender;

pub use receiver::Receiver;
pub use sender::Sender;

use crate::common::error::ProtocolVersion;

/// Protocol version advertised by every telemetry message this crate sends.
pub const TELEMETRY_PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

/// CloudEvents `type` attribute used when the caller doesn't override it.
pub const DEFAULT_TELEMETRY_CLOUD_EVENT_TYPE: &str = "ms.aio.telemetry";
