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

//! Mock collaborators shared by the unit tests: a scriptable keymaster, an
//! in-memory blob store with master key states, and permissive permission
//! and attestation id sources.

use crate::blob::{Blob, BlobType};
use crate::error::{Error, KeymasterError, ResponseCode};
use crate::key_parameter::{
    KeyCharacteristics, KeyFormat, KeyOrigin, KeyParameter, KeyParameterValue, KeyPurpose, Tag,
};
use crate::permission::KeystorePerm;
use crate::traits::{
    AttestationIdSource, BeginOutput, BlobStore, FinishOutput, KeyCreation, KeymasterDevice,
    PermissionOracle, UpdateOutput,
};
use crate::user_state::UserState;
use crate::utils::user_id;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

// ---------------------------------------------------------------------
// Keymaster.
// ---------------------------------------------------------------------

#[derive(Default)]
struct KmState {
    next_key: u64,
    next_handle: u64,
    keys: HashMap<Vec<u8>, KeyCharacteristics>,
    upgrade_required: HashSet<Vec<u8>>,
    active: HashSet<u64>,
    aborted: Vec<u64>,
    deleted: Vec<Vec<u8>>,
    entropy_calls: usize,
    upgrade_calls: usize,
    max_active: Option<usize>,
    creation_error: Option<KeymasterError>,
    update_chunk: Option<usize>,
    last_attest_params: Vec<KeyParameter>,
}

/// A scriptable in-memory keymaster.
pub struct MockKeymaster {
    fallback_device: bool,
    state: Mutex<KmState>,
}

impl MockKeymaster {
    pub fn new(fallback_device: bool) -> Self {
        Self { fallback_device, state: Mutex::new(KmState::default()) }
    }

    /// Makes generate/import fail with the given keymaster error.
    pub fn fail_creation(&self, error: KeymasterError) {
        self.state.lock().unwrap().creation_error = Some(error);
    }

    /// Marks a key blob as requiring an upgrade before further use.
    pub fn require_upgrade(&self, key_blob: &[u8]) {
        self.state.lock().unwrap().upgrade_required.insert(key_blob.to_vec());
    }

    /// Caps the number of concurrently active operations; begin beyond the
    /// cap fails with TooManyOperations.
    pub fn set_max_active(&self, max: usize) {
        self.state.lock().unwrap().max_active = Some(max);
    }

    /// Limits how many input bytes a single update call consumes.
    pub fn set_update_chunk(&self, chunk: usize) {
        self.state.lock().unwrap().update_chunk = Some(chunk);
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().unwrap().active.len()
    }

    pub fn was_aborted(&self, handle: u64) -> bool {
        self.state.lock().unwrap().aborted.contains(&handle)
    }

    pub fn upgrade_calls(&self) -> usize {
        self.state.lock().unwrap().upgrade_calls
    }

    pub fn entropy_calls(&self) -> usize {
        self.state.lock().unwrap().entropy_calls
    }

    pub fn deleted_keys(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn last_attest_params(&self) -> Vec<KeyParameter> {
        self.state.lock().unwrap().last_attest_params.clone()
    }

    fn creation(&self, params: &[KeyParameter], origin: KeyOrigin) -> Result<KeyCreation, Error> {
        let mut state = self.state.lock().unwrap();
        if let Some(e) = state.creation_error {
            return Err(Error::Km(e));
        }
        state.next_key += 1;
        let key_blob = format!(
            "km-key-{}{}",
            state.next_key,
            if self.fallback_device { "-fallback" } else { "" }
        )
        .into_bytes();
        let mut hardware_enforced = params.to_vec();
        hardware_enforced
            .push(KeyParameter::new(Tag::ORIGIN, KeyParameterValue::Origin(origin)));
        let characteristics = KeyCharacteristics {
            hardware_enforced,
            software_enforced: vec![KeyParameter::new(
                Tag::CREATION_DATETIME,
                KeyParameterValue::DateTime(0),
            )],
        };
        state.keys.insert(key_blob.clone(), characteristics.clone());
        Ok(KeyCreation { key_blob, characteristics })
    }

    fn check_current(state: &KmState, key_blob: &[u8]) -> Result<(), Error> {
        if state.upgrade_required.contains(key_blob) {
            return Err(Error::Km(KeymasterError::KeyRequiresUpgrade));
        }
        if !state.keys.contains_key(key_blob) {
            return Err(Error::Km(KeymasterError::InvalidKeyBlob));
        }
        Ok(())
    }
}

impl KeymasterDevice for MockKeymaster {
    fn add_rng_entropy(&self, _entropy: &[u8]) -> Result<(), Error> {
        self.state.lock().unwrap().entropy_calls += 1;
        Ok(())
    }

    fn generate_key(&self, params: &[KeyParameter]) -> Result<KeyCreation, Error> {
        self.creation(params, KeyOrigin::GENERATED)
    }

    fn import_key(
        &self,
        params: &[KeyParameter],
        _format: KeyFormat,
        _key_data: &[u8],
    ) -> Result<KeyCreation, Error> {
        self.creation(params, KeyOrigin::IMPORTED)
    }

    fn export_key(
        &self,
        _format: KeyFormat,
        key_blob: &[u8],
        _client_id: &[u8],
        _app_data: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let state = self.state.lock().unwrap();
        Self::check_current(&state, key_blob)?;
        Ok([b"export:" as &[u8], key_blob].concat())
    }

    fn get_key_characteristics(
        &self,
        key_blob: &[u8],
        _client_id: &[u8],
        _app_data: &[u8],
    ) -> Result<KeyCharacteristics, Error> {
        let state = self.state.lock().unwrap();
        Self::check_current(&state, key_blob)?;
        Ok(state.keys[key_blob].clone())
    }

    fn begin(
        &self,
        _purpose: KeyPurpose,
        key_blob: &[u8],
        _params: &[KeyParameter],
    ) -> Result<BeginOutput, Error> {
        let mut state = self.state.lock().unwrap();
        Self::check_current(&state, key_blob)?;
        if let Some(max) = state.max_active {
            if state.active.len() >= max {
                return Err(Error::Km(KeymasterError::TooManyOperations));
            }
        }
        state.next_handle += 1;
        let handle = state.next_handle;
        state.active.insert(handle);
        Ok(BeginOutput { handle, out_params: vec![] })
    }

    fn update(
        &self,
        handle: u64,
        _params: &[KeyParameter],
        input: &[u8],
    ) -> Result<UpdateOutput, Error> {
        let state = self.state.lock().unwrap();
        if !state.active.contains(&handle) {
            return Err(Error::Km(KeymasterError::InvalidOperationHandle));
        }
        let consumed = state.update_chunk.unwrap_or(input.len()).min(input.len());
        Ok(UpdateOutput {
            input_consumed: consumed,
            out_params: vec![],
            output: input[..consumed].to_vec(),
        })
    }

    fn finish(
        &self,
        handle: u64,
        _params: &[KeyParameter],
        _signature: &[u8],
    ) -> Result<FinishOutput, Error> {
        let mut state = self.state.lock().unwrap();
        if !state.active.remove(&handle) {
            return Err(Error::Km(KeymasterError::InvalidOperationHandle));
        }
        Ok(FinishOutput { out_params: vec![], output: b"signature".to_vec() })
    }

    fn abort(&self, handle: u64) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if !state.active.remove(&handle) {
            return Err(Error::Km(KeymasterError::InvalidOperationHandle));
        }
        state.aborted.push(handle);
        Ok(())
    }

    fn upgrade_key(&self, key_blob: &[u8], _params: &[KeyParameter]) -> Result<Vec<u8>, Error> {
        let mut state = self.state.lock().unwrap();
        if !state.keys.contains_key(key_blob) {
            return Err(Error::Km(KeymasterError::InvalidKeyBlob));
        }
        let upgraded = [key_blob, b"+upgraded" as &[u8]].concat();
        let characteristics = state.keys[key_blob].clone();
        state.keys.insert(upgraded.clone(), characteristics);
        state.upgrade_required.remove(key_blob);
        state.upgrade_calls += 1;
        Ok(upgraded)
    }

    fn delete_key(&self, key_blob: &[u8]) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.keys.remove(key_blob);
        state.deleted.push(key_blob.to_vec());
        Ok(())
    }

    fn attest_key(
        &self,
        key_blob: &[u8],
        params: &[KeyParameter],
    ) -> Result<Vec<Vec<u8>>, Error> {
        let mut state = self.state.lock().unwrap();
        Self::check_current(&state, key_blob)?;
        state.last_attest_params = params.to_vec();
        Ok(vec![b"leaf-cert".to_vec(), b"root-cert".to_vec()])
    }
}

// ---------------------------------------------------------------------
// Blob store.
// ---------------------------------------------------------------------

#[derive(Clone)]
struct Master {
    password: String,
    unlocked: bool,
}

#[derive(Clone)]
struct Grant {
    owner_uid: u32,
    alias: String,
    grantee_uid: u32,
    grant_alias: String,
}

#[derive(Default)]
struct StoreState {
    files: HashMap<(u32, String), (Blob, i64)>,
    masters: HashMap<u32, Master>,
    grants: Vec<Grant>,
    mtime_counter: i64,
}

/// An in-memory blob store modelling per-user master key state, grant
/// indirection and header-readable flags.
pub struct MockBlobStore {
    state: Mutex<StoreState>,
    hardware_backed: bool,
}

impl Default for MockBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBlobStore {
    pub fn new() -> Self {
        Self { state: Mutex::new(StoreState::default()), hardware_backed: true }
    }

    fn file_name(alias: &str, uid: u32, blob_type: BlobType) -> String {
        match blob_type {
            BlobType::KeymasterBound => format!("{}_USRPKEY_{}", uid, alias),
            BlobType::KeyCharacteristics => format!("{}_CHR_{}", uid, alias),
            BlobType::Generic | BlobType::Any => format!("{}_{}", uid, alias),
        }
    }

    // Candidate file names for a lookup; Any probes the non-characteristics
    // types.
    fn candidates(alias: &str, uid: u32, blob_type: BlobType) -> Vec<String> {
        match blob_type {
            BlobType::Any => vec![
                Self::file_name(alias, uid, BlobType::Generic),
                Self::file_name(alias, uid, BlobType::KeymasterBound),
            ],
            t => vec![Self::file_name(alias, uid, t)],
        }
    }

    fn readable(state: &StoreState, blob: &Blob, user: u32) -> Result<(), Error> {
        if !blob.is_encrypted() && !blob.is_super_encrypted() {
            return Ok(());
        }
        match state.masters.get(&user) {
            None => Err(Error::Rc(ResponseCode::Uninitialized)),
            Some(m) if !m.unlocked => Err(Error::Rc(ResponseCode::Locked)),
            Some(_) => Ok(()),
        }
    }

    fn alias_of(file_name: &str, uid: u32) -> Option<String> {
        let rest = file_name.strip_prefix(&format!("{}_", uid))?;
        let alias = rest
            .strip_prefix("USRPKEY_")
            .or_else(|| rest.strip_prefix("CHR_"))
            .unwrap_or(rest);
        Some(alias.to_string())
    }

    pub fn file_count(&self, user: u32) -> usize {
        self.state.lock().unwrap().files.keys().filter(|(u, _)| *u == user).count()
    }
}

impl BlobStore for MockBlobStore {
    fn put(&self, filename: &Path, blob: &Blob, user: u32) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        Self::readable(&state, blob, user)?;
        state.mtime_counter += 1;
        let mtime = state.mtime_counter;
        state
            .files
            .insert((user, filename.to_string_lossy().into_owned()), (blob.clone(), mtime));
        Ok(())
    }

    fn get(&self, filename: &Path, blob_type: BlobType, user: u32) -> Result<Blob, Error> {
        let state = self.state.lock().unwrap();
        let (blob, _) = state
            .files
            .get(&(user, filename.to_string_lossy().into_owned()))
            .ok_or(Error::Rc(ResponseCode::KeyNotFound))?;
        if blob_type != BlobType::Any && blob.blob_type() != blob_type {
            return Err(Error::Rc(ResponseCode::KeyNotFound));
        }
        Self::readable(&state, blob, user)?;
        Ok(blob.clone())
    }

    fn del(&self, filename: &Path, _blob_type: BlobType, user: u32) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state
            .files
            .remove(&(user, filename.to_string_lossy().into_owned()))
            .map(|_| ())
            .ok_or(Error::Rc(ResponseCode::KeyNotFound))
    }

    fn list(&self, prefix: &str, user: u32) -> Result<Vec<String>, Error> {
        let state = self.state.lock().unwrap();
        // The prefix is "<uid>_<alias prefix>"; aliases are matched with
        // the type infix stripped, so keymaster bound blobs are listed too.
        let (uid, alias_prefix) = match prefix.split_once('_') {
            Some((uid, alias_prefix)) => match uid.parse::<u32>() {
                Ok(uid) => (uid, alias_prefix),
                Err(_) => return Ok(vec![]),
            },
            None => return Ok(vec![]),
        };
        let mut aliases: Vec<String> = state
            .files
            .keys()
            .filter(|(u, _)| *u == user)
            .filter_map(|(_, name)| Self::alias_of(name, uid))
            .filter(|alias| alias.starts_with(alias_prefix))
            .collect();
        aliases.sort();
        aliases.dedup();
        Ok(aliases)
    }

    fn get_key_for_name(
        &self,
        alias: &str,
        uid: u32,
        blob_type: BlobType,
    ) -> Result<Blob, Error> {
        let (resolved_alias, resolved_uid) = {
            let state = self.state.lock().unwrap();
            match state
                .grants
                .iter()
                .find(|g| g.grant_alias == alias && g.grantee_uid == uid)
            {
                Some(grant) => (grant.alias.clone(), grant.owner_uid),
                None => (alias.to_string(), uid),
            }
        };
        let user = user_id(resolved_uid);
        for name in Self::candidates(&resolved_alias, resolved_uid, blob_type) {
            match self.get(Path::new(&name), BlobType::Any, user) {
                Err(Error::Rc(ResponseCode::KeyNotFound)) => continue,
                r => return r,
            }
        }
        Err(Error::Rc(ResponseCode::KeyNotFound))
    }

    fn key_file_name(&self, alias: &str, uid: u32, blob_type: BlobType) -> PathBuf {
        PathBuf::from(Self::file_name(alias, uid, blob_type))
    }

    fn key_file_prefix(&self, prefix: &str, uid: u32, _blob_type: BlobType) -> String {
        format!("{}_{}", uid, prefix)
    }

    fn blob_file_if_exists(&self, alias: &str, uid: u32, blob_type: BlobType) -> Option<PathBuf> {
        let state = self.state.lock().unwrap();
        let user = user_id(uid);
        Self::candidates(alias, uid, blob_type)
            .into_iter()
            .find(|name| state.files.contains_key(&(user, name.clone())))
            .map(PathBuf::from)
    }

    fn blob_flags(&self, alias: &str, uid: u32, blob_type: BlobType) -> Option<u8> {
        let state = self.state.lock().unwrap();
        let user = user_id(uid);
        Self::candidates(alias, uid, blob_type)
            .into_iter()
            .find_map(|name| state.files.get(&(user, name)).map(|(b, _)| b.flags()))
    }

    fn mtime(&self, filename: &Path) -> Result<i64, Error> {
        let state = self.state.lock().unwrap();
        let name = filename.to_string_lossy().into_owned();
        state
            .files
            .iter()
            .find(|((_, n), _)| *n == name)
            .map(|(_, (_, mtime))| *mtime)
            .ok_or(Error::Rc(ResponseCode::KeyNotFound))
    }

    fn get_state(&self, user: u32) -> UserState {
        let state = self.state.lock().unwrap();
        match state.masters.get(&user) {
            None => UserState::Uninitialized,
            Some(m) if m.unlocked => UserState::Unlocked,
            Some(_) => UserState::Locked,
        }
    }

    fn initialize_user(&self, password: &str, user: u32) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.masters.insert(user, Master { password: password.to_string(), unlocked: true });
        Ok(())
    }

    fn write_master_key(&self, password: &str, user: u32) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        match state.masters.get_mut(&user) {
            Some(m) if m.unlocked => {
                m.password = password.to_string();
                Ok(())
            }
            _ => Err(Error::sys()),
        }
    }

    fn read_master_key(&self, password: &str, user: u32) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        match state.masters.get_mut(&user) {
            Some(m) if m.password == password => {
                m.unlocked = true;
                Ok(())
            }
            Some(_) => Err(Error::Rc(ResponseCode::WrongPassword0)),
            None => Err(Error::Rc(ResponseCode::Uninitialized)),
        }
    }

    fn copy_master_key(&self, src_user: u32, user: u32) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let master = state.masters.get(&src_user).cloned().ok_or_else(Error::sys)?;
        state.masters.insert(user, master);
        Ok(())
    }

    fn reset_user(&self, user: u32, keep_unencrypted: bool) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.files.retain(|(u, _), (blob, _)| {
            if *u != user {
                return true;
            }
            keep_unencrypted
                && (!blob.is_encrypted() || blob.is_critical_to_device_encryption())
        });
        state.masters.remove(&user);
        Ok(())
    }

    fn lock(&self, user: u32) {
        let mut state = self.state.lock().unwrap();
        if let Some(m) = state.masters.get_mut(&user) {
            m.unlocked = false;
        }
    }

    fn is_empty(&self, user: u32) -> bool {
        let state = self.state.lock().unwrap();
        !state.files.keys().any(|(u, _)| *u == user)
    }

    fn add_grant(&self, alias: &str, owner_uid: u32, grantee_uid: u32) -> String {
        let mut state = self.state.lock().unwrap();
        let grant_alias = format!("ks_grant_{}_{}_{}", owner_uid, grantee_uid, alias);
        if !state
            .grants
            .iter()
            .any(|g| g.owner_uid == owner_uid && g.alias == alias && g.grantee_uid == grantee_uid)
        {
            state.grants.push(Grant {
                owner_uid,
                alias: alias.to_string(),
                grantee_uid,
                grant_alias: grant_alias.clone(),
            });
        }
        grant_alias
    }

    fn remove_grant(&self, alias: &str, owner_uid: u32, grantee_uid: u32) -> bool {
        let mut state = self.state.lock().unwrap();
        let before = state.grants.len();
        state.grants.retain(|g| {
            !(g.owner_uid == owner_uid && g.alias == alias && g.grantee_uid == grantee_uid)
        });
        state.grants.len() < before
    }

    fn remove_all_grants_to_uid(&self, grantee_uid: u32) {
        let mut state = self.state.lock().unwrap();
        state.grants.retain(|g| g.grantee_uid != grantee_uid);
    }

    fn is_hardware_backed(&self, _key_type: &str) -> bool {
        self.hardware_backed
    }
}

// ---------------------------------------------------------------------
// Permissions and attestation ids.
// ---------------------------------------------------------------------

#[derive(Default)]
struct PermState {
    denied: HashSet<KeystorePerm>,
    extra_grants: HashSet<(u32, u32)>,
    platform_denied: bool,
}

/// Permission oracle granting everything unless told otherwise.
#[derive(Default)]
pub struct MockPermissions {
    state: Mutex<PermState>,
}

impl MockPermissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny(&self, perm: KeystorePerm) {
        self.state.lock().unwrap().denied.insert(perm);
    }

    pub fn allow_acting_for(&self, calling_uid: u32, target_uid: u32) {
        self.state.lock().unwrap().extra_grants.insert((calling_uid, target_uid));
    }

    pub fn deny_platform_permissions(&self) {
        self.state.lock().unwrap().platform_denied = true;
    }
}

impl PermissionOracle for MockPermissions {
    fn has(&self, perm: KeystorePerm, _calling_uid: u32, _calling_pid: u32) -> bool {
        !self.state.lock().unwrap().denied.contains(&perm)
    }

    fn is_granted_to(&self, calling_uid: u32, target_uid: u32) -> bool {
        calling_uid == target_uid
            || self.state.lock().unwrap().extra_grants.contains(&(calling_uid, target_uid))
    }

    fn check_platform_permission(&self, _name: &str, _uid: u32, _pid: u32) -> bool {
        !self.state.lock().unwrap().platform_denied
    }
}

/// Attestation id source with a fixed payload.
pub struct MockAttestationIds {
    pub payload: Mutex<Result<Vec<u8>, Error>>,
}

impl Default for MockAttestationIds {
    fn default() -> Self {
        Self { payload: Mutex::new(Ok(b"attestation-application-id".to_vec())) }
    }
}

impl MockAttestationIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_payload(&self, payload: Vec<u8>) {
        *self.payload.lock().unwrap() = Ok(payload);
    }

    pub fn fail(&self) {
        *self.payload.lock().unwrap() = Err(Error::sys());
    }
}

impl AttestationIdSource for MockAttestationIds {
    fn gather(&self, _calling_uid: u32) -> Result<Vec<u8>, Error> {
        self.payload.lock().unwrap().clone()
    }
}
