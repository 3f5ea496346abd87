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

//! The keystore service facade. Composes the auth token table, the
//! operation map, the enforcement policy and the user state machine over
//! the external collaborators, and implements every public operation of the
//! service.

use crate::auth_token::{AuthLookup, AuthTokenTable, HardwareAuthToken};
use crate::blob::{flags, Blob, BlobType};
use crate::characteristics;
use crate::enforcement::EnforcementPolicy;
use crate::error::{Error, KeymasterError, ResponseCode};
use crate::id_rotation::IdRotationState;
use crate::key_parameter::{
    contains_tag, is_authentication_bound, merge_union, subtract, KeyCharacteristics, KeyFormat,
    KeyParameter, KeyParameterValue, KeyPurpose, Tag,
};
use crate::ks_err;
use crate::operation::{LivenessHandle, OpTicket, OpView, OperationMap, MAX_OPERATIONS};
use crate::permission::{KeystorePerm, READ_PRIVILEGED_PHONE_STATE};
use crate::traits::{
    AttestationIdSource, BeginOutput, BlobStore, Caller, FinishOutput, KeyCreation,
    KeymasterDevice, PermissionOracle, UpdateOutput,
};
use crate::user_state::{UserState, UserStateMachine};
use crate::utils::{effective_uid, is_system_uid, user_id};
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Maximum size of the attestation application id pushed into attestation
/// parameters; longer ids are truncated.
const ATTESTATION_APPLICATION_ID_MAX_SIZE: usize = 1024;

/// Result of a successful `begin`.
#[derive(Debug, Clone)]
pub struct BeginResponse {
    /// Handle for driving the operation through update/finish/abort.
    pub ticket: OpTicket,
    /// The keymaster operation handle; doubles as the challenge an
    /// authenticator must sign for per operation auth.
    pub handle: u64,
    pub out_params: Vec<KeyParameter>,
    /// True iff the key is per operation authorized and no token is cached
    /// yet. The caller must deliver a token for `handle` before the first
    /// update.
    pub op_auth_needed: bool,
}

/// The keystore service core.
pub struct KeyStoreCore {
    store: Arc<dyn BlobStore>,
    primary: Arc<dyn KeymasterDevice>,
    fallback: Arc<dyn KeymasterDevice>,
    permissions: Arc<dyn PermissionOracle>,
    attestation_ids: Arc<dyn AttestationIdSource>,
    auth_tokens: AuthTokenTable,
    operations: OperationMap,
    enforcement: EnforcementPolicy,
    users: UserStateMachine,
    id_rotation: IdRotationState,
    internal_liveness: AtomicU64,
}

impl KeyStoreCore {
    pub fn new(
        store: Arc<dyn BlobStore>,
        primary: Arc<dyn KeymasterDevice>,
        fallback: Arc<dyn KeymasterDevice>,
        permissions: Arc<dyn PermissionOracle>,
        attestation_ids: Arc<dyn AttestationIdSource>,
        working_dir: &Path,
    ) -> Self {
        Self {
            store: store.clone(),
            primary,
            fallback,
            permissions,
            attestation_ids,
            auth_tokens: AuthTokenTable::new(),
            operations: OperationMap::new(),
            enforcement: EnforcementPolicy::new(),
            users: UserStateMachine::new(store),
            id_rotation: IdRotationState::new(working_dir),
            internal_liveness: AtomicU64::new(1 << 63),
        }
    }

    // Every keymaster bound blob is served by the device that produced it:
    // the fallback iff the fallback flag is set.
    fn device_for(&self, blob: &Blob) -> Arc<dyn KeymasterDevice> {
        if blob.is_fallback() {
            self.fallback.clone()
        } else {
            self.primary.clone()
        }
    }

    pub(crate) fn check_permission(&self, caller: Caller, perm: KeystorePerm) -> Result<()> {
        if self.permissions.has(perm, caller.uid, caller.pid) {
            Ok(())
        } else {
            log::warn!("permission {} denied for {}", perm.label(), caller.uid);
            Err(Error::perm())
                .context(ks_err!("Permission {} denied for uid {}.", perm.label(), caller.uid))
        }
    }

    // Permission check plus the grant check for acting on another uid's
    // keys.
    fn check_granted_permission(
        &self,
        caller: Caller,
        perm: KeystorePerm,
        target_uid: u32,
    ) -> Result<()> {
        self.check_permission(caller, perm)?;
        if self.permissions.is_granted_to(caller.uid, target_uid) {
            Ok(())
        } else {
            log::warn!("uid {} not granted to act for {}", caller.uid, target_uid);
            Err(Error::perm())
                .context(ks_err!("Uid {} not granted to act for {}.", caller.uid, target_uid))
        }
    }

    // Permission and grant check plus, when requested, the requirement that
    // the target user's keystore is unlocked. The state value surfaces
    // directly when the requirement fails.
    fn check_permission_and_state(
        &self,
        caller: Caller,
        perm: KeystorePerm,
        target_uid: u32,
        enforce_unlocked: bool,
    ) -> Result<()> {
        self.check_granted_permission(caller, perm, target_uid)?;
        if enforce_unlocked {
            let state = self.users.state(user_id(target_uid));
            if state != UserState::Unlocked {
                return Err(Error::Rc(state.into()))
                    .context(ks_err!("Keystore of user {} not unlocked.", user_id(target_uid)));
            }
        }
        Ok(())
    }

    // Parameters keystore adds on its own behalf are rejected from callers
    // at every operation entry point.
    fn check_allowed_op_params(params: &[KeyParameter]) -> Result<()> {
        for param in params {
            if matches!(
                param.tag,
                Tag::ATTESTATION_APPLICATION_ID | Tag::AUTH_TOKEN | Tag::RESET_SINCE_ID_ROTATION
            ) {
                return Err(Error::Km(KeymasterError::InvalidArgument))
                    .context(ks_err!("Caller supplied restricted tag {:?}.", param.tag));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle and enumeration.
    // ------------------------------------------------------------------

    pub fn get_state(&self, caller: Caller, user: u32) -> Result<UserState> {
        self.check_permission(caller, KeystorePerm::GetState)?;
        Ok(self.users.state(user))
    }

    pub fn is_empty(&self, caller: Caller, user: u32) -> Result<bool> {
        self.check_permission(caller, KeystorePerm::IsEmpty)?;
        Ok(self.store.is_empty(user))
    }

    pub fn reset(&self, caller: Caller) -> Result<()> {
        self.check_permission(caller, KeystorePerm::Reset)?;
        self.users.reset(user_id(caller.uid))
    }

    pub fn on_user_password_changed(
        &self,
        caller: Caller,
        user: u32,
        password: &str,
    ) -> Result<()> {
        self.check_permission(caller, KeystorePerm::Password)?;
        // Flush the auth token table to prevent stale tokens from sticking
        // around.
        self.auth_tokens.clear();
        self.users.on_user_password_changed(user, password)
    }

    pub fn on_user_added(&self, caller: Caller, user: u32, parent: Option<u32>) -> Result<()> {
        self.check_permission(caller, KeystorePerm::UserChanged)?;
        self.users.on_user_added(user, parent)
    }

    pub fn on_user_removed(&self, caller: Caller, user: u32) -> Result<()> {
        self.check_permission(caller, KeystorePerm::UserChanged)?;
        self.users.on_user_removed(user)
    }

    pub fn lock(&self, caller: Caller, user: u32) -> Result<()> {
        self.check_permission(caller, KeystorePerm::Lock)?;
        self.users.lock(user)
    }

    pub fn unlock(&self, caller: Caller, user: u32, password: &str) -> Result<()> {
        self.check_permission(caller, KeystorePerm::Unlock)?;
        self.users.unlock(user, password)
    }

    // ------------------------------------------------------------------
    // Blob CRUD.
    // ------------------------------------------------------------------

    pub fn get(&self, caller: Caller, alias: &str, target_uid: i32) -> Result<Vec<u8>> {
        let target = effective_uid(caller.uid, target_uid);
        self.check_granted_permission(caller, KeystorePerm::Get, target)?;
        let blob = self
            .store
            .get_key_for_name(alias, target, BlobType::Generic)
            .context(ks_err!("Loading blob {} for {}.", alias, target))?;
        Ok(blob.take_value())
    }

    pub fn insert(
        &self,
        caller: Caller,
        alias: &str,
        item: Vec<u8>,
        target_uid: i32,
        request_flags: u8,
    ) -> Result<()> {
        let target = effective_uid(caller.uid, target_uid);
        let encrypted = request_flags & flags::ENCRYPTED != 0;
        self.check_permission_and_state(caller, KeystorePerm::Insert, target, encrypted)?;

        let filename = self.store.key_file_name(alias, target, BlobType::Generic);
        let mut blob = Blob::new(BlobType::Generic, item);
        blob.set_encrypted(encrypted);
        self.store
            .put(&filename, &blob, user_id(target))
            .context(ks_err!("Storing blob {} for {}.", alias, target))
    }

    pub fn del(&self, caller: Caller, alias: &str, target_uid: i32) -> Result<()> {
        let target = effective_uid(caller.uid, target_uid);
        self.check_granted_permission(caller, KeystorePerm::Delete, target)?;
        log::info!("del {} {}", alias, target);

        let filename = self
            .store
            .blob_file_if_exists(alias, target, BlobType::Any)
            .ok_or(Error::Rc(ResponseCode::KeyNotFound))
            .context(ks_err!("No blob {} for {}.", alias, target))?;
        self.store
            .del(&filename, BlobType::Any, user_id(target))
            .context(ks_err!("Deleting {}.", alias))?;

        // The characteristics sibling goes with the key.
        if let Some(chr) = self.store.blob_file_if_exists(alias, target, BlobType::KeyCharacteristics)
        {
            self.store
                .del(&chr, BlobType::KeyCharacteristics, user_id(target))
                .context(ks_err!("Deleting characteristics of {}.", alias))?;
        }
        Ok(())
    }

    pub fn exist(&self, caller: Caller, alias: &str, target_uid: i32) -> Result<()> {
        let target = effective_uid(caller.uid, target_uid);
        self.check_granted_permission(caller, KeystorePerm::Exist, target)?;
        self.store
            .blob_file_if_exists(alias, target, BlobType::Any)
            .map(|_| ())
            .ok_or(Error::Rc(ResponseCode::KeyNotFound))
            .context(ks_err!("No blob {} for {}.", alias, target))
    }

    pub fn list(&self, caller: Caller, prefix: &str, target_uid: i32) -> Result<Vec<String>> {
        let target = effective_uid(caller.uid, target_uid);
        self.check_granted_permission(caller, KeystorePerm::List, target)?;
        let file_prefix = self.store.key_file_prefix(prefix, target, BlobType::Any);
        self.store
            .list(&file_prefix, user_id(target))
            .context(ks_err!("Listing {}* for {}.", prefix, target))
    }

    pub fn getmtime(&self, caller: Caller, alias: &str, target_uid: i32) -> Result<i64> {
        let target = effective_uid(caller.uid, target_uid);
        self.check_granted_permission(caller, KeystorePerm::Get, target)?;
        let filename = self
            .store
            .blob_file_if_exists(alias, target, BlobType::Any)
            .ok_or(Error::Rc(ResponseCode::KeyNotFound))
            .context(ks_err!("Could not access {} for getmtime.", alias))?;
        self.store.mtime(&filename).context(ks_err!("Reading mtime of {}.", alias))
    }

    /// Dead legacy surface, retained as a stub.
    pub fn duplicate(
        &self,
        caller: Caller,
        _src_alias: &str,
        _src_uid: i32,
        _dest_alias: &str,
        _dest_uid: i32,
    ) -> Result<()> {
        log::warn!("duplicate called by {}; rejecting", caller.uid);
        Err(Error::perm()).context(ks_err!("Duplicate is not supported."))
    }

    pub fn is_hardware_backed(&self, key_type: &str) -> bool {
        self.store.is_hardware_backed(key_type)
    }

    pub fn clear_uid(&self, caller: Caller, target_uid: i64) -> Result<()> {
        let target = effective_uid(caller.uid, target_uid as i32);
        self.check_permission(caller, KeystorePerm::ClearUid)?;
        if target != caller.uid && !is_system_uid(caller.uid) {
            return Err(Error::perm())
                .context(ks_err!("Uid {} may not clear uid {}.", caller.uid, target));
        }
        log::info!("clear_uid {}", target);

        self.store.remove_all_grants_to_uid(target);

        let file_prefix = self.store.key_file_prefix("", target, BlobType::Any);
        let aliases = self
            .store
            .list(&file_prefix, user_id(target))
            .context(ks_err!("Listing blobs of {}.", target))?;

        for alias in aliases {
            if is_system_uid(target) {
                // Do not clear keys critical to device encryption under the
                // system uid.
                if let Some(blob_flags) = self.store.blob_flags(&alias, target, BlobType::Any) {
                    if blob_flags & flags::CRITICAL_TO_DEVICE_ENCRYPTION != 0 {
                        continue;
                    }
                }
            }
            if let Some(filename) = self.store.blob_file_if_exists(&alias, target, BlobType::Any) {
                if let Err(e) = self.store.del(&filename, BlobType::Any, user_id(target)) {
                    log::warn!("clear_uid: failed to delete {}: {:?}", alias, e);
                }
            }
            if let Some(chr) =
                self.store.blob_file_if_exists(&alias, target, BlobType::KeyCharacteristics)
            {
                let _ = self.store.del(&chr, BlobType::KeyCharacteristics, user_id(target));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Grants.
    // ------------------------------------------------------------------

    pub fn grant(&self, caller: Caller, alias: &str, grantee_uid: u32) -> Result<String> {
        self.check_permission_and_state(caller, KeystorePerm::Grant, caller.uid, true)?;
        self.store
            .blob_file_if_exists(alias, caller.uid, BlobType::Any)
            .ok_or(Error::Rc(ResponseCode::KeyNotFound))
            .context(ks_err!("Cannot grant missing key {}.", alias))?;
        Ok(self.store.add_grant(alias, caller.uid, grantee_uid))
    }

    pub fn ungrant(&self, caller: Caller, alias: &str, grantee_uid: u32) -> Result<()> {
        self.check_permission_and_state(caller, KeystorePerm::Grant, caller.uid, true)?;
        self.store
            .blob_file_if_exists(alias, caller.uid, BlobType::Any)
            .ok_or(Error::Rc(ResponseCode::KeyNotFound))
            .context(ks_err!("Cannot ungrant missing key {}.", alias))?;
        if self.store.remove_grant(alias, caller.uid, grantee_uid) {
            Ok(())
        } else {
            Err(Error::Rc(ResponseCode::KeyNotFound))
                .context(ks_err!("No grant of {} to {}.", alias, grantee_uid))
        }
    }

    // ------------------------------------------------------------------
    // Auth tokens.
    // ------------------------------------------------------------------

    /// Accepts a packed hardware auth token from an authenticator.
    pub fn add_auth_token(&self, caller: Caller, token: &[u8]) -> Result<()> {
        self.check_permission(caller, KeystorePerm::AddAuth)?;
        let token =
            HardwareAuthToken::from_bytes(token).context(ks_err!("Malformed auth token."))?;
        self.auth_tokens.add(token);
        Ok(())
    }

    pub fn on_device_off_body(&self) {
        self.auth_tokens.on_device_off_body();
    }

    pub fn add_rng_entropy(&self, entropy: &[u8]) -> Result<()> {
        self.primary.add_rng_entropy(entropy).context(ks_err!("Seeding device rng."))
    }

    // ------------------------------------------------------------------
    // Key creation.
    // ------------------------------------------------------------------

    pub fn generate_key(
        &self,
        caller: Caller,
        alias: &str,
        params: &[KeyParameter],
        entropy: &[u8],
        target_uid: i32,
        request_flags: u8,
    ) -> Result<KeyCharacteristics> {
        let target = effective_uid(caller.uid, target_uid);
        self.check_creation_preconditions(caller, target, params, request_flags)?;

        self.primary.add_rng_entropy(entropy).context(ks_err!("Seeding device rng."))?;

        let mut using_fallback = false;
        let creation = match self.primary.generate_key(params) {
            Ok(creation) => creation,
            Err(Error::Km(e)) => {
                log::error!(
                    "Failed to generate key ({:?}) -> falling back to software keymaster",
                    e
                );
                using_fallback = true;
                self.fallback
                    .generate_key(params)
                    .context(ks_err!("Fallback generate failed."))?
            }
            Err(e) => return Err(e).context(ks_err!("Generate failed.")),
        };

        self.store_new_key(alias, target, request_flags, using_fallback, params, &creation)?;
        Ok(creation.characteristics)
    }

    pub fn import_key(
        &self,
        caller: Caller,
        alias: &str,
        params: &[KeyParameter],
        format: KeyFormat,
        key_data: &[u8],
        target_uid: i32,
        request_flags: u8,
    ) -> Result<KeyCharacteristics> {
        let target = effective_uid(caller.uid, target_uid);
        self.check_creation_preconditions(caller, target, params, request_flags)?;

        let mut using_fallback = false;
        let creation = match self.primary.import_key(params, format, key_data) {
            Ok(creation) => creation,
            Err(Error::Km(e)) => {
                log::error!(
                    "Failed to import key ({:?}) -> falling back to software keymaster",
                    e
                );
                using_fallback = true;
                self.fallback
                    .import_key(params, format, key_data)
                    .context(ks_err!("Fallback import failed."))?
            }
            Err(e) => return Err(e).context(ks_err!("Import failed.")),
        };

        self.store_new_key(alias, target, request_flags, using_fallback, params, &creation)?;
        Ok(creation.characteristics)
    }

    fn check_creation_preconditions(
        &self,
        caller: Caller,
        target: u32,
        params: &[KeyParameter],
        request_flags: u8,
    ) -> Result<()> {
        let encrypted = request_flags & flags::ENCRYPTED != 0;
        self.check_permission_and_state(caller, KeystorePerm::Insert, target, encrypted)?;
        if request_flags & flags::CRITICAL_TO_DEVICE_ENCRYPTION != 0 && !is_system_uid(target) {
            log::error!("Non-system uid {} cannot create device encryption critical keys", target);
            return Err(Error::perm())
                .context(ks_err!("Critical flag requires the system principal."));
        }
        if contains_tag(params, Tag::INCLUDE_UNIQUE_ID) {
            self.check_permission(caller, KeystorePerm::GenUniqueId)?;
        }
        Ok(())
    }

    // Persists the keymaster blob and its characteristics sibling. The
    // sibling records the creation time authorization list, which carries
    // the keystore only software tags.
    fn store_new_key(
        &self,
        alias: &str,
        uid: u32,
        request_flags: u8,
        using_fallback: bool,
        params: &[KeyParameter],
        creation: &KeyCreation,
    ) -> Result<()> {
        let filename = self.store.key_file_name(alias, uid, BlobType::KeymasterBound);
        let mut blob = Blob::new(BlobType::KeymasterBound, creation.key_blob.clone());
        blob.set_fallback(using_fallback);
        blob.set_critical_to_device_encryption(
            request_flags & flags::CRITICAL_TO_DEVICE_ENCRYPTION != 0,
        );
        if is_authentication_bound(params) && !blob.is_critical_to_device_encryption() {
            blob.set_super_encrypted(true);
        }
        blob.set_encrypted(request_flags & flags::ENCRYPTED != 0);
        self.store
            .put(&filename, &blob, user_id(uid))
            .context(ks_err!("Writing key blob {}.", alias))?;

        let chr_filename = self.store.key_file_name(alias, uid, BlobType::KeyCharacteristics);
        let mut chr_blob =
            Blob::new(BlobType::KeyCharacteristics, characteristics::serialize(params));
        chr_blob.set_fallback(using_fallback);
        chr_blob.set_encrypted(request_flags & flags::ENCRYPTED != 0);
        self.store
            .put(&chr_filename, &chr_blob, user_id(uid))
            .context(ks_err!("Writing characteristics of {}.", alias))
    }

    // ------------------------------------------------------------------
    // Characteristics, export, upgrade.
    // ------------------------------------------------------------------

    pub fn get_key_characteristics(
        &self,
        caller: Caller,
        alias: &str,
        client_id: &[u8],
        app_data: &[u8],
        target_uid: i32,
    ) -> Result<KeyCharacteristics> {
        let target = effective_uid(caller.uid, target_uid);
        if !self.permissions.is_granted_to(caller.uid, target) {
            log::warn!(
                "uid {} not permitted to act for uid {} in get_key_characteristics",
                caller.uid,
                target
            );
            return Err(Error::perm()).context(ks_err!("Not granted."));
        }

        let blob = match self.store.get_key_for_name(alias, target, BlobType::KeymasterBound) {
            Err(Error::Rc(ResponseCode::Uninitialized)) => {
                // The master key is unavailable, e.g. because the user
                // removed the lock screen. Serve the persisted creation
                // time authorizations instead; they are software enforced
                // by definition.
                let chr_blob = self
                    .store
                    .get_key_for_name(alias, target, BlobType::KeyCharacteristics)
                    .context(ks_err!("No readable characteristics for {}.", alias))?;
                let software_enforced = characteristics::deserialize(chr_blob.value())
                    .context(ks_err!("Decoding characteristics of {}.", alias))?;
                return Ok(KeyCharacteristics { software_enforced, hardware_enforced: vec![] });
            }
            r => r.context(ks_err!("Loading key blob {}.", alias))?,
        };

        let device = self.device_for(&blob);
        match device.get_key_characteristics(blob.value(), client_id, app_data) {
            Err(Error::Km(KeymasterError::KeyRequiresUpgrade)) => {
                let upgrade_params = Self::application_params(client_id, app_data);
                let blob = self.upgrade_key_blob(alias, target, &upgrade_params)?;
                device
                    .get_key_characteristics(blob.value(), client_id, app_data)
                    .context(ks_err!("Reading characteristics after upgrade."))
            }
            r => r.context(ks_err!("Reading characteristics of {}.", alias)),
        }
    }

    pub fn export_key(
        &self,
        caller: Caller,
        alias: &str,
        format: KeyFormat,
        client_id: &[u8],
        app_data: &[u8],
        target_uid: i32,
    ) -> Result<Vec<u8>> {
        let target = effective_uid(caller.uid, target_uid);
        if !self.permissions.is_granted_to(caller.uid, target) {
            log::warn!(
                "uid {} not permitted to act for uid {} in export_key",
                caller.uid,
                target
            );
            return Err(Error::perm()).context(ks_err!("Not granted."));
        }

        let blob = self
            .store
            .get_key_for_name(alias, target, BlobType::KeymasterBound)
            .context(ks_err!("Loading key blob {}.", alias))?;
        let device = self.device_for(&blob);
        match device.export_key(format, blob.value(), client_id, app_data) {
            Err(Error::Km(KeymasterError::KeyRequiresUpgrade)) => {
                let upgrade_params = Self::application_params(client_id, app_data);
                let blob = self.upgrade_key_blob(alias, target, &upgrade_params)?;
                device
                    .export_key(format, blob.value(), client_id, app_data)
                    .context(ks_err!("Exporting after upgrade."))
            }
            r => r.context(ks_err!("Exporting {}.", alias)),
        }
    }

    fn application_params(client_id: &[u8], app_data: &[u8]) -> Vec<KeyParameter> {
        let mut params = Vec::new();
        if !client_id.is_empty() {
            params.push(KeyParameter::new(
                Tag::APPLICATION_ID,
                KeyParameterValue::Blob(client_id.to_vec()),
            ));
        }
        if !app_data.is_empty() {
            params.push(KeyParameter::new(
                Tag::APPLICATION_DATA,
                KeyParameterValue::Blob(app_data.to_vec()),
            ));
        }
        params
    }

    // The upgrade dance: re-read the blob by name rather than trusting the
    // caller's copy, let the device rewrap it, replace the file preserving
    // all flags, and re-read the replacement for the caller.
    fn upgrade_key_blob(&self, alias: &str, uid: u32, params: &[KeyParameter]) -> Result<Blob> {
        let blob = self
            .store
            .get_key_for_name(alias, uid, BlobType::KeymasterBound)
            .context(ks_err!("Reading blob for upgrade."))?;
        log::info!("upgrade_key_blob {} {}", alias, uid);

        let device = self.device_for(&blob);
        let upgraded = device
            .upgrade_key(blob.value(), params)
            .context(ks_err!("KeymasterDevice::upgrade_key failed."))?;

        let filename = self
            .store
            .blob_file_if_exists(alias, uid, BlobType::KeymasterBound)
            .ok_or(Error::Rc(ResponseCode::KeyNotFound))
            .context(ks_err!("Trying to upgrade a non existing blob."))?;
        self.store
            .del(&filename, BlobType::Any, user_id(uid))
            .context(ks_err!("Deleting outdated blob."))?;

        let mut new_blob = Blob::new(BlobType::KeymasterBound, upgraded);
        new_blob.set_flags(blob.flags());
        self.store
            .put(&filename, &new_blob, user_id(uid))
            .context(ks_err!("Writing upgraded blob."))?;

        self.store
            .get_key_for_name(alias, uid, BlobType::KeymasterBound)
            .context(ks_err!("Re-reading upgraded blob."))
    }

    fn get_operation_characteristics(
        &self,
        key_blob: &[u8],
        device: &Arc<dyn KeymasterDevice>,
        params: &[KeyParameter],
    ) -> Result<KeyCharacteristics, Error> {
        let mut client_id: &[u8] = &[];
        let mut app_data: &[u8] = &[];
        for param in params {
            match (param.tag, &param.value) {
                (Tag::APPLICATION_ID, KeyParameterValue::Blob(b)) => client_id = b,
                (Tag::APPLICATION_DATA, KeyParameterValue::Blob(b)) => app_data = b,
                _ => {}
            }
        }
        device.get_key_characteristics(key_blob, client_id, app_data)
    }

    // ------------------------------------------------------------------
    // Operations.
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn begin(
        &self,
        caller: Caller,
        liveness: LivenessHandle,
        alias: &str,
        purpose: KeyPurpose,
        pruneable: bool,
        params: &[KeyParameter],
        entropy: &[u8],
        target_uid: i32,
    ) -> Result<BeginResponse> {
        let target = effective_uid(caller.uid, target_uid);
        if !self.permissions.is_granted_to(caller.uid, target) {
            log::warn!("uid {} not permitted to act for uid {} in begin", caller.uid, target);
            return Err(Error::perm()).context(ks_err!("Not granted."));
        }
        if !pruneable && !is_system_uid(caller.uid) {
            log::error!("Non-system uid {} trying to start non-pruneable operation", caller.uid);
            return Err(Error::perm())
                .context(ks_err!("Non-pruneable operations are a system privilege."));
        }
        Self::check_allowed_op_params(params)?;

        let mut blob = match self.store.get_key_for_name(alias, target, BlobType::KeymasterBound) {
            Err(Error::Rc(ResponseCode::Locked))
                if self
                    .store
                    .blob_flags(alias, target, BlobType::KeymasterBound)
                    .is_some_and(|f| f & flags::SUPER_ENCRYPTED != 0) =>
            {
                // An authentication bound key while the user is locked: keep
                // the error surface uniform.
                return Err(Error::Km(KeymasterError::KeyUserNotAuthenticated))
                    .context(ks_err!("Auth bound key {} used while user locked.", alias));
            }
            r => r.context(ks_err!("Loading key blob {}.", alias))?,
        };

        let device = self.device_for(&blob);
        let mut op_params = params.to_vec();

        let mut chars =
            match self.get_operation_characteristics(blob.value(), &device, &op_params) {
                Err(Error::Km(KeymasterError::KeyRequiresUpgrade)) => {
                    blob = self.upgrade_key_blob(alias, target, &op_params)?;
                    self.get_operation_characteristics(blob.value(), &device, &op_params)
                        .context(ks_err!("Reading characteristics after upgrade."))?
                }
                r => r.context(ks_err!("Reading operation characteristics."))?,
            };

        // Merge the characteristics persisted at creation time: the
        // software enforced set becomes (persisted ∪ software) ∖ hardware,
        // which restores keystore only tags the keymaster does not echo.
        let mut merged = match self
            .store
            .get_key_for_name(alias, target, BlobType::KeyCharacteristics)
            .ok()
            .map(|b| characteristics::deserialize(b.value()))
        {
            Some(Ok(persisted)) => persisted,
            _ => {
                log::debug!("Unable to read cached characteristics for key");
                Vec::new()
            }
        };
        merge_union(&mut merged, &chars.software_enforced);
        subtract(&mut merged, &chars.hardware_enforced);
        chars.software_enforced = merged;

        let lookup = self.auth_tokens.find(&chars.union(), purpose, 0);
        let (auth_token, op_auth_needed) = match lookup {
            AuthLookup::Found(token) => (Some(token), false),
            AuthLookup::NotRequired => (None, false),
            // The caller is allowed to authenticate and authorize later,
            // before update, now that a challenge will exist.
            AuthLookup::OpHandleRequired => (None, true),
            AuthLookup::TokenNotFound | AuthLookup::TokenExpired | AuthLookup::WrongSid => {
                return Err(Error::Km(KeymasterError::KeyUserNotAuthenticated))
                    .context(ks_err!("No valid auth token for {}.", alias));
            }
        };
        if let Some(token) = &auth_token {
            op_params.push(KeyParameter::new(
                Tag::AUTH_TOKEN,
                KeyParameterValue::Blob(token.to_bytes()),
            ));
        }

        if !entropy.is_empty() {
            device.add_rng_entropy(entropy).context(ks_err!("Seeding device rng."))?;
        }

        let key_id = EnforcementPolicy::compute_key_id(blob.value());
        self.enforcement
            .authorize_operation(purpose, key_id, &chars, &op_params, 0, true)
            .context(ks_err!("Operation not authorized."))?;

        // If we are at the concurrent operation limit, abort the oldest
        // pruneable operation before asking the device for a slot.
        while self.operations.count() >= MAX_OPERATIONS {
            log::warn!("Reached or exceeded concurrent operations limit");
            if !self.prune_operation() {
                break;
            }
        }

        let begin_output: BeginOutput = loop {
            match device.begin(purpose, blob.value(), &op_params) {
                Err(Error::Km(KeymasterError::TooManyOperations))
                    if self.operations.has_pruneable() =>
                {
                    log::warn!("Ran out of operation handles");
                    if !self.prune_operation() {
                        return Err(Error::Km(KeymasterError::TooManyOperations))
                            .context(ks_err!("Pruning made no progress."));
                    }
                }
                r => break r.context(ks_err!("KeymasterDevice::begin failed."))?,
            }
        };

        let ticket = self.operations.add(
            begin_output.handle,
            key_id,
            purpose,
            device,
            liveness,
            chars,
            pruneable,
        );
        if let Some(token) = auth_token {
            self.operations.set_auth_token(ticket, token);
        }

        Ok(BeginResponse {
            ticket,
            handle: begin_output.handle,
            out_params: begin_output.out_params,
            op_auth_needed,
        })
    }

    pub fn update(
        &self,
        ticket: OpTicket,
        params: &[KeyParameter],
        input: &[u8],
    ) -> Result<UpdateOutput> {
        Self::check_allowed_op_params(params)?;
        let op = self
            .operations
            .get(ticket)
            .ok_or(Error::Km(KeymasterError::InvalidOperationHandle))
            .context(ks_err!("Update on unknown operation."))?;

        let result = self.do_update(&op, params, input);
        if result.is_err() {
            // A failed update ends the operation; no leaked slots.
            self.discard_operation(ticket);
        }
        result
    }

    fn do_update(
        &self,
        op: &OpView,
        params: &[KeyParameter],
        input: &[u8],
    ) -> Result<UpdateOutput> {
        let mut op_params = params.to_vec();
        self.add_operation_auth_token_if_needed(op, &mut op_params)?;
        self.enforcement
            .authorize_operation(op.purpose, op.key_id, &op.characteristics, &op_params, op.handle, false)
            .context(ks_err!("Update not authorized."))?;
        op.device
            .update(op.handle, &op_params, input)
            .context(ks_err!("KeymasterDevice::update failed."))
    }

    pub fn finish(
        &self,
        ticket: OpTicket,
        params: &[KeyParameter],
        signature: &[u8],
        entropy: &[u8],
    ) -> Result<FinishOutput> {
        Self::check_allowed_op_params(params)?;
        let op = self
            .operations
            .get(ticket)
            .ok_or(Error::Km(KeymasterError::InvalidOperationHandle))
            .context(ks_err!("Finish on unknown operation."))?;

        let result = self.do_finish(&op, params, signature, entropy);
        // The operation leaves the map regardless of the outcome.
        if result.is_ok() {
            if let Some(removed) = self.operations.remove(ticket) {
                self.auth_tokens.mark_completed(removed.handle);
            }
        } else {
            self.discard_operation(ticket);
        }
        result
    }

    fn do_finish(
        &self,
        op: &OpView,
        params: &[KeyParameter],
        signature: &[u8],
        entropy: &[u8],
    ) -> Result<FinishOutput> {
        let mut op_params = params.to_vec();
        self.add_operation_auth_token_if_needed(op, &mut op_params)?;
        if !entropy.is_empty() {
            op.device.add_rng_entropy(entropy).context(ks_err!("Seeding device rng."))?;
        }
        self.enforcement
            .authorize_operation(op.purpose, op.key_id, &op.characteristics, &op_params, op.handle, false)
            .context(ks_err!("Finish not authorized."))?;
        op.device
            .finish(op.handle, &op_params, signature)
            .context(ks_err!("KeymasterDevice::finish failed."))
    }

    // Resolves the per operation auth token lazily: by update time the
    // challenge is known, so a token delivered after begin can be picked up
    // here. The result is cached on the operation.
    fn add_operation_auth_token_if_needed(
        &self,
        op: &OpView,
        op_params: &mut Vec<KeyParameter>,
    ) -> Result<()> {
        let token = match self.operations.get_auth_token(op.ticket) {
            Some(token) => Some(token),
            None => match self.auth_tokens.find(&op.characteristics.union(), op.purpose, op.handle)
            {
                AuthLookup::Found(token) => {
                    self.operations.set_auth_token(op.ticket, token.clone());
                    Some(token)
                }
                AuthLookup::NotRequired => None,
                _ => {
                    return Err(Error::Km(KeymasterError::KeyUserNotAuthenticated))
                        .context(ks_err!("Operation not authorized by any cached token."));
                }
            },
        };
        if let Some(token) = token {
            op_params.push(KeyParameter::new(
                Tag::AUTH_TOKEN,
                KeyParameterValue::Blob(token.to_bytes()),
            ));
        }
        Ok(())
    }

    pub fn abort(&self, ticket: OpTicket) -> Result<()> {
        let op = self
            .operations
            .remove(ticket)
            .ok_or(Error::Km(KeymasterError::InvalidOperationHandle))
            .context(ks_err!("Abort on unknown operation."))?;
        if let Err(e) = op.device.abort(op.handle) {
            log::warn!("abort: device abort failed: {:?}", e);
        }
        self.auth_tokens.mark_completed(op.handle);
        Ok(())
    }

    /// Whether the operation's auth requirement is currently satisfied.
    pub fn is_operation_authorized(&self, ticket: OpTicket) -> bool {
        let Some(op) = self.operations.get(ticket) else {
            return false;
        };
        let mut ignored = Vec::new();
        self.add_operation_auth_token_if_needed(&op, &mut ignored).is_ok()
    }

    /// Called by the host when a client's liveness handle dies; every
    /// operation bound to it is aborted.
    pub fn on_client_death(&self, liveness: LivenessHandle) {
        for ticket in self.operations.operations_for_liveness(liveness) {
            let _ = self.abort(ticket);
        }
    }

    // Aborts the oldest pruneable operation. Returns true iff an operation
    // was removed.
    fn prune_operation(&self) -> bool {
        let Some(oldest) = self.operations.get_oldest_pruneable() else {
            return false;
        };
        log::warn!("Trying to prune operation {:?}", oldest);
        let count_before = self.operations.count();
        let _ = self.abort(oldest);
        self.operations.count() < count_before
    }

    // Removes an operation after a failed update/finish, releasing the
    // device slot and the auth token binding.
    fn discard_operation(&self, ticket: OpTicket) {
        if let Some(op) = self.operations.remove(ticket) {
            let _ = op.device.abort(op.handle);
            self.auth_tokens.mark_completed(op.handle);
        }
    }

    pub(crate) fn fresh_internal_liveness(&self) -> LivenessHandle {
        LivenessHandle(self.internal_liveness.fetch_add(1, Ordering::Relaxed))
    }

    // ------------------------------------------------------------------
    // Attestation.
    // ------------------------------------------------------------------

    pub fn attest_key(
        &self,
        caller: Caller,
        alias: &str,
        params: &[KeyParameter],
    ) -> Result<Vec<Vec<u8>>> {
        Self::check_allowed_op_params(params)?;
        if params.iter().any(|p| p.tag.is_device_id_attestation_tag()) {
            // There is a dedicated entry point for device id attestation.
            return Err(Error::Km(KeymasterError::InvalidArgument))
                .context(ks_err!("Device id tags must go through attest_device_ids."));
        }

        let mut attest_params = params.to_vec();
        self.update_params_for_attestation(caller.uid, &mut attest_params)?;

        let blob = self
            .store
            .get_key_for_name(alias, caller.uid, BlobType::KeymasterBound)
            .context(ks_err!("Loading key blob {}.", alias))?;
        let device = self.device_for(&blob);
        device.attest_key(blob.value(), &attest_params).context(ks_err!("Attestation failed."))
    }

    pub fn attest_device_ids(
        &self,
        caller: Caller,
        params: &[KeyParameter],
    ) -> Result<Vec<Vec<u8>>> {
        Self::check_allowed_op_params(params)?;
        if !params.iter().any(|p| p.tag.is_device_id_attestation_tag()) {
            // Plain key attestation goes through attest_key.
            return Err(Error::Km(KeymasterError::InvalidArgument))
                .context(ks_err!("No device id tag present."));
        }
        if !self.permissions.check_platform_permission(
            READ_PRIVILEGED_PHONE_STATE,
            caller.uid,
            caller.pid,
        ) {
            return Err(Error::Km(KeymasterError::CannotAttestIds))
                .context(ks_err!("Caller {} may not attest device ids.", caller.uid));
        }

        let mut attest_params = params.to_vec();
        self.update_params_for_attestation(caller.uid, &mut attest_params)?;

        // Device ids are attested with a transient signing key that never
        // touches the store.
        let key_params = vec![
            KeyParameter::new(Tag::PURPOSE, KeyParameterValue::KeyPurpose(KeyPurpose::VERIFY)),
            KeyParameter::new(
                Tag::ALGORITHM,
                KeyParameterValue::Algorithm(crate::key_parameter::Algorithm::EC),
            ),
            KeyParameter::new(
                Tag::DIGEST,
                KeyParameterValue::Digest(crate::key_parameter::Digest::SHA_2_256),
            ),
            KeyParameter::bool(Tag::NO_AUTH_REQUIRED),
            KeyParameter::new(
                Tag::EC_CURVE,
                KeyParameterValue::EcCurve(crate::key_parameter::EcCurve::P_256),
            ),
        ];
        let creation = self
            .primary
            .generate_key(&key_params)
            .context(ks_err!("Generating transient attestation key."))?;

        let attest_result = self.primary.attest_key(&creation.key_blob, &attest_params);
        // The transient key dies regardless of the attestation outcome.
        let delete_result = self.primary.delete_key(&creation.key_blob);

        let chain = attest_result.context(ks_err!("Device id attestation failed."))?;
        delete_result.context(ks_err!("Deleting transient attestation key."))?;
        Ok(chain)
    }

    fn update_params_for_attestation(
        &self,
        calling_uid: u32,
        params: &mut Vec<KeyParameter>,
    ) -> Result<()> {
        if self
            .id_rotation
            .had_factory_reset_since_id_rotation()
            .context(ks_err!("Checking factory reset sentinel."))?
        {
            params.push(KeyParameter::bool(Tag::RESET_SINCE_ID_ROTATION));
        }

        let mut attestation_id = match self.attestation_ids.gather(calling_uid) {
            Ok(id) => id,
            Err(e) => {
                log::error!("failed to gather attestation_id: {:?}", e);
                return Err(Error::Km(KeymasterError::AttestationApplicationIdMissing))
                    .context(ks_err!("No attestation application id."));
            }
        };
        attestation_id.truncate(ATTESTATION_APPLICATION_ID_MAX_SIZE);
        params.push(KeyParameter::new(
            Tag::ATTESTATION_APPLICATION_ID,
            KeyParameterValue::Blob(attestation_id),
        ));
        Ok(())
    }
}
