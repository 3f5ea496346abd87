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

//! Collaborator interfaces of the keystore core. The transport, the
//! permission backend, the on-disk codec and the keymaster module live
//! behind these traits; implementations must be thread safe and must have
//! already mapped their transport failures onto
//! `Error::Rc(ResponseCode::SystemError)`.

use crate::blob::{Blob, BlobType};
use crate::error::Error;
use crate::key_parameter::{KeyCharacteristics, KeyFormat, KeyParameter, KeyPurpose};
use crate::permission::KeystorePerm;
use crate::user_state::UserState;
use std::path::{Path, PathBuf};

/// Identity of the principal making a call, as established by the
/// transport.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Caller {
    pub uid: u32,
    pub pid: u32,
}

impl Caller {
    pub fn new(uid: u32, pid: u32) -> Self {
        Self { uid, pid }
    }
}

/// Result of a successful `KeymasterDevice::generate_key` or `import_key`.
#[derive(Debug, Clone)]
pub struct KeyCreation {
    /// The opaque keymaster wrapped key handle.
    pub key_blob: Vec<u8>,
    /// The authorization list the keymaster bound to the key.
    pub characteristics: KeyCharacteristics,
}

/// Result of a successful `KeymasterDevice::begin`.
#[derive(Debug, Clone)]
pub struct BeginOutput {
    /// The keymaster side operation handle, also used as the challenge for
    /// per operation auth tokens.
    pub handle: u64,
    pub out_params: Vec<KeyParameter>,
}

/// Result of a successful `KeymasterDevice::update`.
#[derive(Debug, Clone, Default)]
pub struct UpdateOutput {
    /// How many input bytes the keymaster consumed.
    pub input_consumed: usize,
    pub out_params: Vec<KeyParameter>,
    pub output: Vec<u8>,
}

/// Result of a successful `KeymasterDevice::finish`.
#[derive(Debug, Clone, Default)]
pub struct FinishOutput {
    pub out_params: Vec<KeyParameter>,
    pub output: Vec<u8>,
}

/// The keymaster module. The service holds two instances: the primary
/// (usually hardware backed) device and the software fallback.
pub trait KeymasterDevice: Send + Sync {
    /// Mixes caller provided entropy into the device's rng.
    fn add_rng_entropy(&self, entropy: &[u8]) -> Result<(), Error>;

    fn generate_key(&self, params: &[KeyParameter]) -> Result<KeyCreation, Error>;

    fn import_key(
        &self,
        params: &[KeyParameter],
        format: KeyFormat,
        key_data: &[u8],
    ) -> Result<KeyCreation, Error>;

    fn export_key(
        &self,
        format: KeyFormat,
        key_blob: &[u8],
        client_id: &[u8],
        app_data: &[u8],
    ) -> Result<Vec<u8>, Error>;

    fn get_key_characteristics(
        &self,
        key_blob: &[u8],
        client_id: &[u8],
        app_data: &[u8],
    ) -> Result<KeyCharacteristics, Error>;

    fn begin(
        &self,
        purpose: KeyPurpose,
        key_blob: &[u8],
        params: &[KeyParameter],
    ) -> Result<BeginOutput, Error>;

    fn update(
        &self,
        handle: u64,
        params: &[KeyParameter],
        input: &[u8],
    ) -> Result<UpdateOutput, Error>;

    fn finish(
        &self,
        handle: u64,
        params: &[KeyParameter],
        signature: &[u8],
    ) -> Result<FinishOutput, Error>;

    fn abort(&self, handle: u64) -> Result<(), Error>;

    /// Rewraps a key blob after a device or OS version change. The old blob
    /// keeps working until deleted; the caller is responsible for replacing
    /// the persisted copy.
    fn upgrade_key(&self, key_blob: &[u8], params: &[KeyParameter]) -> Result<Vec<u8>, Error>;

    fn delete_key(&self, key_blob: &[u8]) -> Result<(), Error>;

    /// Produces an attestation certificate chain for the given key.
    fn attest_key(
        &self,
        key_blob: &[u8],
        params: &[KeyParameter],
    ) -> Result<Vec<Vec<u8>>, Error>;
}

/// Persistence backend. Owns the on-disk encoding, the per-user master key
/// material, and the grant database. Paths handed back by the naming
/// methods are opaque to the core; it only passes them back into the store.
pub trait BlobStore: Send + Sync {
    fn put(&self, filename: &Path, blob: &Blob, user_id: u32) -> Result<(), Error>;

    fn get(&self, filename: &Path, blob_type: BlobType, user_id: u32) -> Result<Blob, Error>;

    fn del(&self, filename: &Path, blob_type: BlobType, user_id: u32) -> Result<(), Error>;

    /// Lists the aliases of all blobs whose file name starts with `prefix`.
    fn list(&self, prefix: &str, user_id: u32) -> Result<Vec<String>, Error>;

    /// Loads the blob stored under (alias, uid, type), resolving grant
    /// aliases to their target keys.
    fn get_key_for_name(&self, alias: &str, uid: u32, blob_type: BlobType)
        -> Result<Blob, Error>;

    /// The file path a blob of the given identity is stored under, whether
    /// or not it currently exists.
    fn key_file_name(&self, alias: &str, uid: u32, blob_type: BlobType) -> PathBuf;

    /// The file name prefix matching every blob of `uid` whose alias starts
    /// with `prefix`.
    fn key_file_prefix(&self, prefix: &str, uid: u32, blob_type: BlobType) -> String;

    /// Returns the path of the blob if a file for it exists. With
    /// `BlobType::Any`, non-characteristics types are probed.
    fn blob_file_if_exists(&self, alias: &str, uid: u32, blob_type: BlobType) -> Option<PathBuf>;

    /// Peeks at the flag byte of a stored blob. Flags live in the
    /// unencrypted header, so this works regardless of the user's lock
    /// state.
    fn blob_flags(&self, alias: &str, uid: u32, blob_type: BlobType) -> Option<u8>;

    /// Modification time of the given blob file in seconds since the epoch.
    fn mtime(&self, filename: &Path) -> Result<i64, Error>;

    fn get_state(&self, user_id: u32) -> UserState;

    /// Generates a fresh master key for the user and envelopes it under
    /// `password`.
    fn initialize_user(&self, password: &str, user_id: u32) -> Result<(), Error>;

    /// Re-envelopes the in-memory master key under a new password.
    fn write_master_key(&self, password: &str, user_id: u32) -> Result<(), Error>;

    /// Decrypts the on-disk master key with `password` and brings it into
    /// memory.
    fn read_master_key(&self, password: &str, user_id: u32) -> Result<(), Error>;

    /// Makes `user_id` share `src_user_id`'s master key by copying it.
    fn copy_master_key(&self, src_user_id: u32, user_id: u32) -> Result<(), Error>;

    /// Erases the user's master key and blobs. With `keep_unencrypted`,
    /// plaintext blobs and blobs critical to device encryption survive.
    fn reset_user(&self, user_id: u32, keep_unencrypted: bool) -> Result<(), Error>;

    /// Discards the user's in-memory master key.
    fn lock(&self, user_id: u32);

    fn is_empty(&self, user_id: u32) -> bool;

    /// Records a grant and returns the alias under which the grantee can
    /// refer to the key.
    fn add_grant(&self, alias: &str, owner_uid: u32, grantee_uid: u32) -> String;

    /// Removes a grant. Returns false if no such grant existed.
    fn remove_grant(&self, alias: &str, owner_uid: u32, grantee_uid: u32) -> bool;

    fn remove_all_grants_to_uid(&self, grantee_uid: u32);

    fn is_hardware_backed(&self, key_type: &str) -> bool;
}

/// Answers permission questions about local principals.
pub trait PermissionOracle: Send + Sync {
    /// May `calling_uid`/`calling_pid` perform `perm`?
    fn has(&self, perm: KeystorePerm, calling_uid: u32, calling_pid: u32) -> bool;

    /// May `calling_uid` act on keys of `target_uid`? Always true for the
    /// caller itself; otherwise requires a grant.
    fn is_granted_to(&self, calling_uid: u32, target_uid: u32) -> bool;

    /// Checks a platform level permission by name.
    fn check_platform_permission(&self, name: &str, uid: u32, pid: u32) -> bool;
}

/// Produces the attestation application id describing the calling package
/// set, used to augment attestation requests.
pub trait AttestationIdSource: Send + Sync {
    fn gather(&self, calling_uid: u32) -> Result<Vec<u8>, Error>;
}
