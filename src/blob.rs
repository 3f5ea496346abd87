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

//! The in-memory representation of a persisted blob: payload bytes, an
//! opaque info prefix, a type discriminator and a set of flags. The on-disk
//! encoding is the blob store's concern; the flags byte is stored in the
//! unencrypted file header and is therefore readable regardless of the
//! owning user's lock state.

/// Blob flag bits.
pub mod flags {
    /// The payload is envelope encrypted under the user's master key and
    /// cannot be read while the master key is unavailable.
    pub const ENCRYPTED: u8 = 1 << 0;
    /// The blob was produced by the software fallback keymaster rather than
    /// the hardware device.
    pub const FALLBACK: u8 = 1 << 1;
    /// An additional envelope tied to the user authentication secret. Such
    /// blobs are unreadable while the owning user is locked, even if the
    /// master key is present.
    pub const SUPER_ENCRYPTED: u8 = 1 << 2;
    /// The blob is part of the device encryption flow. It is never super
    /// encrypted and survives uid clears performed for the system principal.
    pub const CRITICAL_TO_DEVICE_ENCRYPTION: u8 = 1 << 3;
}

/// The type of a stored blob. A single logical key materializes as a
/// `KeymasterBound` blob and a `KeyCharacteristics` sibling.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BlobType {
    /// Selector only: matches any non-characteristics blob on lookup.
    Any = 0,
    /// An unstructured byte blob stored on behalf of a client.
    Generic = 1,
    /// A keymaster wrapped key handle.
    KeymasterBound = 2,
    /// The serialized authorization list observed at key creation time.
    KeyCharacteristics = 3,
}

/// A blob as handed to and received from the blob store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    blob_type: BlobType,
    flags: u8,
    info: Vec<u8>,
    value: Vec<u8>,
}

impl Blob {
    pub fn new(blob_type: BlobType, value: Vec<u8>) -> Self {
        Self { blob_type, flags: 0, info: Vec::new(), value }
    }

    pub fn with_info(blob_type: BlobType, value: Vec<u8>, info: Vec<u8>) -> Self {
        Self { blob_type, flags: 0, info, value }
    }

    pub fn blob_type(&self) -> BlobType {
        self.blob_type
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn take_value(self) -> Vec<u8> {
        self.value
    }

    pub fn info(&self) -> &[u8] {
        &self.info
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & flags::ENCRYPTED != 0
    }

    pub fn is_fallback(&self) -> bool {
        self.flags & flags::FALLBACK != 0
    }

    pub fn is_super_encrypted(&self) -> bool {
        self.flags & flags::SUPER_ENCRYPTED != 0
    }

    pub fn is_critical_to_device_encryption(&self) -> bool {
        self.flags & flags::CRITICAL_TO_DEVICE_ENCRYPTION != 0
    }

    pub fn set_encrypted(&mut self, encrypted: bool) {
        self.set_flag(flags::ENCRYPTED, encrypted);
    }

    pub fn set_fallback(&mut self, fallback: bool) {
        self.set_flag(flags::FALLBACK, fallback);
    }

    pub fn set_super_encrypted(&mut self, super_encrypted: bool) {
        self.set_flag(flags::SUPER_ENCRYPTED, super_encrypted);
    }

    pub fn set_critical_to_device_encryption(&mut self, critical: bool) {
        self.set_flag(flags::CRITICAL_TO_DEVICE_ENCRYPTION, critical);
    }

    /// Replaces the whole flag byte. Used when rewriting an upgraded blob,
    /// which must preserve every flag of its predecessor.
    pub fn set_flags(&mut self, flags: u8) {
        self.flags = flags;
    }

    fn set_flag(&mut self, flag: u8, value: bool) {
        if value {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
    }
}
