// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Building blocks shared by the RPC and telemetry envoys: the topic-pattern engine, the error
//! taxonomy, CloudEvent metadata, the typed payload-encoding seam, and user-property helpers.

pub mod cloud_event;
pub mod error;
pub mod payload_serialize;
pub mod topic_pattern;
pub mod user_properties;
