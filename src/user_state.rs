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

//! Per-user master key lifecycle. Each user's master key is either absent
//! (Uninitialized), present in memory (Unlocked) or present only on disk
//! (Locked). The cryptography lives in the blob store; this module owns the
//! transition rules and serializes transitions per user so that distinct
//! users do not contend.

use crate::error::{Error, ResponseCode};
use crate::ks_err;
use crate::traits::BlobStore;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Lifecycle state of one user's master key.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UserState {
    /// No master key exists for the user.
    Uninitialized,
    /// The master key is in memory; encrypted blobs are readable.
    Unlocked,
    /// The master key exists on disk but is not in memory.
    Locked,
}

/// The numeric overlap between user states and response codes is historic;
/// the mapping is confined to this conversion.
impl From<UserState> for ResponseCode {
    fn from(state: UserState) -> Self {
        match state {
            UserState::Uninitialized => ResponseCode::Uninitialized,
            UserState::Unlocked => ResponseCode::NoError,
            UserState::Locked => ResponseCode::Locked,
        }
    }
}

/// Drives master key transitions against the blob store, one lock per user.
pub struct UserStateMachine {
    store: Arc<dyn BlobStore>,
    user_locks: Mutex<HashMap<u32, Arc<Mutex<()>>>>,
}

impl UserStateMachine {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store, user_locks: Mutex::new(HashMap::new()) }
    }

    fn user_lock(&self, user_id: u32) -> Arc<Mutex<()>> {
        let mut locks = self.user_locks.lock().expect("In UserStateMachine::user_lock.");
        locks.entry(user_id).or_default().clone()
    }

    pub fn state(&self, user_id: u32) -> UserState {
        self.store.get_state(user_id)
    }

    /// Dispatches a password change on the current state: initializes an
    /// uninitialized user, re-envelopes an unlocked user's master key, and
    /// resets a locked user before initializing with the new password. An
    /// empty password removes the secure lock screen: encrypted entries are
    /// deleted and the user becomes uninitialized.
    pub fn on_user_password_changed(&self, user_id: u32, password: &str) -> Result<()> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().expect("In on_user_password_changed.");

        if password.is_empty() {
            log::info!(
                "Secure lockscreen for user {} removed, deleting encrypted entries",
                user_id
            );
            return self
                .store
                .reset_user(user_id, true)
                .context(ks_err!("Resetting user {}.", user_id));
        }
        match self.store.get_state(user_id) {
            UserState::Uninitialized => self
                .store
                .initialize_user(password, user_id)
                .context(ks_err!("Initializing user {}.", user_id)),
            UserState::Unlocked => self
                .store
                .write_master_key(password, user_id)
                .context(ks_err!("Rewriting master key for user {}.", user_id)),
            UserState::Locked => {
                log::error!(
                    "Changing user {}'s password while locked, clearing old encryption",
                    user_id
                );
                self.store
                    .reset_user(user_id, true)
                    .context(ks_err!("Resetting locked user {}.", user_id))?;
                self.store
                    .initialize_user(password, user_id)
                    .context(ks_err!("Initializing user {}.", user_id))
            }
        }
    }

    /// Creates a new user. A profile with a parent inherits the parent's
    /// master key by copy, because the parent's password is not known here.
    pub fn on_user_added(&self, user_id: u32, parent_user_id: Option<u32>) -> Result<()> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().expect("In on_user_added.");

        if !self.store.is_empty(user_id) {
            log::warn!("New user {}'s keystore not empty. Clearing old entries.", user_id);
        }
        self.store.reset_user(user_id, false).context(ks_err!("Resetting user {}.", user_id))?;
        if let Some(parent) = parent_user_id {
            self.store
                .copy_master_key(parent, user_id)
                .context(ks_err!("Copying master key {} -> {}.", parent, user_id))?;
        }
        Ok(())
    }

    pub fn on_user_removed(&self, user_id: u32) -> Result<()> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().expect("In on_user_removed.");
        self.store.reset_user(user_id, false).context(ks_err!("Resetting user {}.", user_id))
    }

    /// Discards the in-memory master key. Fails with the current state if
    /// the user is not unlocked.
    pub fn lock(&self, user_id: u32) -> Result<()> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().expect("In lock.");

        let state = self.store.get_state(user_id);
        if state != UserState::Unlocked {
            log::warn!("calling lock in state: {:?}", state);
            return Err(Error::Rc(state.into()))
                .context(ks_err!("Lock called on user {} in state {:?}.", user_id, state));
        }
        self.store.lock(user_id);
        Ok(())
    }

    /// Brings the master key back into memory. Fails with the current state
    /// if the user is not locked.
    pub fn unlock(&self, user_id: u32, password: &str) -> Result<()> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().expect("In unlock.");

        let state = self.store.get_state(user_id);
        if state != UserState::Locked {
            log::warn!("calling unlock in state: {:?}", state);
            return Err(Error::Rc(state.into()))
                .context(ks_err!("Unlock called on user {} in state {:?}.", user_id, state));
        }
        self.store
            .read_master_key(password, user_id)
            .context(ks_err!("Reading master key for user {}.", user_id))
    }

    /// Hard reset: every blob and the master key are erased.
    pub fn reset(&self, user_id: u32) -> Result<()> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().expect("In reset.");
        self.store.reset_user(user_id, false).context(ks_err!("Resetting user {}.", user_id))
    }
}
