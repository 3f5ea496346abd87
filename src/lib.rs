// Copyright 2020, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Keystore daemon core.
//!
//! This crate implements the service layer of a per-device, multi-tenant
//! credential management daemon. Keys live as opaque blobs produced by a
//! lower level keymaster module or as plain byte blobs, persisted per user
//! and per client UID by an external blob store. The core mediates every
//! request against the keymaster: it authorizes the caller, enforces the
//! key's authorization list, manages the bounded pool of concurrent
//! keymaster operations, threads user authentication tokens into operations
//! that demand them, and drives the key blob upgrade dance when the
//! keymaster requests it.
//!
//! The RPC transport, the permission backend, the on-disk blob codec, and
//! the keymaster itself are external collaborators accessed through the
//! traits in the `traits` module.

pub mod auth_token;
pub mod blob;
pub mod characteristics;
pub mod enforcement;
pub mod error;
pub mod id_rotation;
pub mod key_parameter;
pub mod legacy;
pub mod operation;
pub mod permission;
pub mod service;
pub mod traits;
pub mod user_state;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, KeymasterError, ResponseCode};
pub use operation::{LivenessHandle, OpTicket};
pub use service::{BeginResponse, KeyStoreCore};
pub use traits::{AttestationIdSource, BlobStore, Caller, KeymasterDevice, PermissionOracle};
pub use user_state::UserState;
