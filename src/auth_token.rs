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

//! The authentication token table. External authenticators (lock screen,
//! biometric sensors) deposit hardware auth tokens here; `find` matches the
//! cached tokens against a key's authorization list when an operation on an
//! authentication bound key is requested. The token HMAC is never verified
//! here; that is the keymaster's job.

use crate::error::{Error, KeymasterError};
use crate::key_parameter::{
    contains_tag, HardwareAuthenticatorType, KeyParameter, KeyParameterValue, KeyPurpose, Tag,
};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Packed size of a version 0 hardware auth token:
/// version(1) challenge(8) user_id(8) authenticator_id(8)
/// authenticator_type(4) timestamp(8) hmac(32).
pub const AUTH_TOKEN_SIZE: usize = 69;

const HMAC_SIZE: usize = 32;

/// Maximum number of cached tokens. Completed and superseded entries are
/// evicted first when the table is full.
const MAX_ENTRIES: usize = 32;

/// A user authentication assertion produced by an external authenticator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareAuthToken {
    /// For per operation tokens, the keymaster operation handle this token
    /// authorizes.
    pub challenge: u64,
    /// The user's secure id, matched against USER_SECURE_ID authorizations.
    pub user_id: u64,
    pub authenticator_id: u64,
    /// Raw authenticator class bit mask.
    pub authenticator_type: u32,
    /// Authentication time in milliseconds.
    pub timestamp_ms: u64,
    /// Opaque HMAC, verified by the keymaster.
    pub mac: [u8; HMAC_SIZE],
}

impl HardwareAuthToken {
    /// Parses a packed version 0 token. The authenticator type and the
    /// timestamp are in network byte order, everything else host order,
    /// matching the layout the authenticator HALs emit.
    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        if data.len() != AUTH_TOKEN_SIZE {
            return Err(Error::Km(KeymasterError::InvalidArgument));
        }
        if data[0] != 0 {
            return Err(Error::Km(KeymasterError::InvalidArgument));
        }
        let mut mac = [0u8; HMAC_SIZE];
        mac.copy_from_slice(&data[37..69]);
        Ok(Self {
            challenge: u64::from_ne_bytes(data[1..9].try_into().unwrap()),
            user_id: u64::from_ne_bytes(data[9..17].try_into().unwrap()),
            authenticator_id: u64::from_ne_bytes(data[17..25].try_into().unwrap()),
            authenticator_type: u32::from_be_bytes(data[25..29].try_into().unwrap()),
            timestamp_ms: u64::from_be_bytes(data[29..37].try_into().unwrap()),
            mac,
        })
    }

    /// Serializes back into the packed layout, for threading the token into
    /// keymaster operation parameters.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(AUTH_TOKEN_SIZE);
        out.push(0u8);
        out.extend_from_slice(&self.challenge.to_ne_bytes());
        out.extend_from_slice(&self.user_id.to_ne_bytes());
        out.extend_from_slice(&self.authenticator_id.to_ne_bytes());
        out.extend_from_slice(&self.authenticator_type.to_be_bytes());
        out.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        out.extend_from_slice(&self.mac);
        out
    }
}

/// Outcome of an auth token lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthLookup {
    /// A matching token was found.
    Found(HardwareAuthToken),
    /// The key does not require authentication.
    NotRequired,
    /// No token for the key's secure ids is cached.
    TokenNotFound,
    /// A matching token exists but its timestamp is outside the key's auth
    /// timeout window.
    TokenExpired,
    /// A token of the right authenticator class exists but none of the
    /// key's secure ids match.
    WrongSid,
    /// The key demands a per operation token and the operation handle is
    /// not known yet. Benign before `begin` has produced a handle.
    OpHandleRequired,
}

struct Entry {
    token: HardwareAuthToken,
    received_ms: u64,
    operation_completed: bool,
}

struct Inner {
    entries: Vec<Entry>,
    last_off_body_ms: u64,
}

type ClockFn = Box<dyn Fn() -> u64 + Send + Sync>;

/// Cache of recent hardware auth tokens, keyed on lookup by user secure id,
/// authenticator class and, for per operation tokens, the keymaster
/// operation handle.
pub struct AuthTokenTable {
    clock: ClockFn,
    inner: Mutex<Inner>,
}

fn wall_clock_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

impl Default for AuthTokenTable {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthTokenTable {
    pub fn new() -> Self {
        Self::new_with_clock(Box::new(wall_clock_ms))
    }

    /// Injectable clock, for tests that exercise timeout matching.
    pub fn new_with_clock(clock: ClockFn) -> Self {
        Self { clock, inner: Mutex::new(Inner { entries: Vec::new(), last_off_body_ms: 0 }) }
    }

    /// Caches a token. A new token supersedes older ones from the same
    /// authenticator for the same user.
    pub fn add(&self, token: HardwareAuthToken) {
        let now = (self.clock)();
        let mut inner = self.inner.lock().expect("In AuthTokenTable::add.");
        inner.entries.retain(|e| {
            !(e.token.user_id == token.user_id
                && e.token.authenticator_id == token.authenticator_id
                && e.token.authenticator_type == token.authenticator_type
                && e.token.timestamp_ms <= token.timestamp_ms)
        });
        if inner.entries.len() >= MAX_ENTRIES {
            Self::evict_one(&mut inner.entries);
        }
        inner.entries.push(Entry { token, received_ms: now, operation_completed: false });
    }

    fn evict_one(entries: &mut Vec<Entry>) {
        if let Some(pos) = entries.iter().position(|e| e.operation_completed) {
            entries.remove(pos);
            return;
        }
        if let Some((pos, _)) = entries
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.token.timestamp_ms)
        {
            let _ = entries.remove(pos);
        }
    }

    /// Matches the cached tokens against a key's authorization list.
    ///
    /// `characteristics` is the union of the key's hardware and software
    /// enforced authorizations. `op_handle` is the keymaster operation
    /// handle, or 0 if the operation has not begun yet.
    pub fn find(
        &self,
        characteristics: &[KeyParameter],
        _purpose: KeyPurpose,
        op_handle: u64,
    ) -> AuthLookup {
        let secure_ids: Vec<u64> = characteristics
            .iter()
            .filter_map(|p| match (p.tag, &p.value) {
                (Tag::USER_SECURE_ID, KeyParameterValue::LongInteger(sid)) => Some(*sid),
                _ => None,
            })
            .collect();
        if contains_tag(characteristics, Tag::NO_AUTH_REQUIRED) || secure_ids.is_empty() {
            return AuthLookup::NotRequired;
        }

        let auth_type_mask = characteristics
            .iter()
            .find_map(|p| match (p.tag, &p.value) {
                (Tag::USER_AUTH_TYPE, KeyParameterValue::HardwareAuthenticatorType(t)) => {
                    Some(*t as u32)
                }
                (Tag::USER_AUTH_TYPE, KeyParameterValue::Integer(t)) => Some(*t),
                _ => None,
            })
            .unwrap_or(HardwareAuthenticatorType::ANY as u32);

        let auth_timeout_s = characteristics.iter().find_map(|p| match (p.tag, &p.value) {
            (Tag::AUTH_TIMEOUT, KeyParameterValue::Integer(t)) => Some(*t as u64),
            _ => None,
        });

        let allow_while_on_body = contains_tag(characteristics, Tag::ALLOW_WHILE_ON_BODY);

        let inner = self.inner.lock().expect("In AuthTokenTable::find.");
        match auth_timeout_s {
            Some(timeout_s) => self.find_timed_token(
                &inner,
                &secure_ids,
                auth_type_mask,
                timeout_s,
                allow_while_on_body,
            ),
            None => Self::find_per_op_token(&inner, &secure_ids, auth_type_mask, op_handle),
        }
    }

    fn find_timed_token(
        &self,
        inner: &Inner,
        secure_ids: &[u64],
        auth_type_mask: u32,
        timeout_s: u64,
        allow_while_on_body: bool,
    ) -> AuthLookup {
        let now = (self.clock)();
        let mut saw_wrong_sid = false;
        let mut newest: Option<&Entry> = None;
        for entry in &inner.entries {
            if entry.token.authenticator_type & auth_type_mask == 0 {
                continue;
            }
            if !secure_ids.contains(&entry.token.user_id) {
                saw_wrong_sid = true;
                continue;
            }
            // A token delivered before the device came off body no longer
            // attests presence.
            if allow_while_on_body && entry.received_ms < inner.last_off_body_ms {
                continue;
            }
            match newest {
                Some(best) if best.token.timestamp_ms >= entry.token.timestamp_ms => {}
                _ => newest = Some(entry),
            }
        }
        match newest {
            Some(entry) => {
                if entry.token.timestamp_ms.saturating_add(timeout_s * 1000) > now {
                    AuthLookup::Found(entry.token.clone())
                } else {
                    AuthLookup::TokenExpired
                }
            }
            None if saw_wrong_sid => AuthLookup::WrongSid,
            None => AuthLookup::TokenNotFound,
        }
    }

    fn find_per_op_token(
        inner: &Inner,
        secure_ids: &[u64],
        auth_type_mask: u32,
        op_handle: u64,
    ) -> AuthLookup {
        if op_handle == 0 {
            return AuthLookup::OpHandleRequired;
        }
        let mut saw_challenge_match = false;
        for entry in &inner.entries {
            if entry.token.challenge != op_handle {
                continue;
            }
            saw_challenge_match = true;
            if entry.token.authenticator_type & auth_type_mask == 0 {
                continue;
            }
            if secure_ids.contains(&entry.token.user_id) {
                return AuthLookup::Found(entry.token.clone());
            }
        }
        if saw_challenge_match {
            AuthLookup::WrongSid
        } else {
            AuthLookup::TokenNotFound
        }
    }

    /// Marks tokens bound to the given operation handle as spent so the
    /// table can evict them under pressure.
    pub fn mark_completed(&self, op_handle: u64) {
        let mut inner = self.inner.lock().expect("In AuthTokenTable::mark_completed.");
        for entry in inner.entries.iter_mut() {
            if entry.token.challenge == op_handle {
                entry.operation_completed = true;
            }
        }
    }

    /// Records the device coming off body.
    pub fn on_device_off_body(&self) {
        let now = (self.clock)();
        self.inner.lock().expect("In AuthTokenTable::on_device_off_body.").last_off_body_ms = now;
    }

    /// Drops every cached token. Invoked on user password changes to defeat
    /// stale tokens.
    pub fn clear(&self) {
        self.inner.lock().expect("In AuthTokenTable::clear.").entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("In AuthTokenTable::len.").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
