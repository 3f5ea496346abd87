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

//! Key usage policy enforcement. Before an operation is dispatched to the
//! keymaster, the key's stored authorization list is checked against the
//! requested purpose and the caller supplied operation parameters. Usage
//! counters (max uses per boot, minimum seconds between operations) are
//! tracked here, keyed by the stable key id derived from the key blob.

use crate::error::{Error, KeymasterError};
use crate::key_parameter::{
    contains_tag, KeyCharacteristics, KeyParameter, KeyParameterValue, KeyPurpose, Tag,
};
use sha2::{Digest as _, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Enforces per key usage policy across operations.
#[derive(Default)]
pub struct EnforcementPolicy {
    /// Number of begun operations per key id since service start.
    access_counts: Mutex<HashMap<u64, u32>>,
    /// Second resolution timestamp of the last begun operation per key id.
    last_use_s: Mutex<HashMap<u64, u64>>,
}

fn wall_clock_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

impl EnforcementPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derives the stable 64 bit key id used to correlate authorizations
    /// across operations on the same key: the first eight bytes of the
    /// SHA-256 digest of the keymaster blob.
    pub fn compute_key_id(key_blob: &[u8]) -> u64 {
        let digest = Sha256::digest(key_blob);
        u64::from_be_bytes(digest[0..8].try_into().expect("digest is 32 bytes"))
    }

    /// Verifies that the key's authorization list permits the requested
    /// operation.
    ///
    /// Begin checks the purpose, validity windows and usage counters;
    /// update and finish re-verify only the caller supplied parameters
    /// against the authorization list.
    pub fn authorize_operation(
        &self,
        purpose: KeyPurpose,
        key_id: u64,
        characteristics: &KeyCharacteristics,
        op_params: &[KeyParameter],
        _op_handle: u64,
        is_begin: bool,
    ) -> Result<(), Error> {
        let key_auths = characteristics.union();

        self.check_op_params(&key_auths, op_params)?;

        if is_begin {
            self.check_purpose(&key_auths, purpose)?;
            self.check_validity_windows(&key_auths, purpose)?;
            self.check_caller_nonce(&key_auths, op_params)?;
            self.check_usage_counters(&key_auths, key_id)?;
        }
        Ok(())
    }

    fn check_purpose(&self, key_auths: &[KeyParameter], purpose: KeyPurpose) -> Result<(), Error> {
        let allowed = key_auths.iter().any(|p| {
            p.tag == Tag::PURPOSE && p.value == KeyParameterValue::KeyPurpose(purpose)
        });
        if allowed {
            Ok(())
        } else {
            Err(Error::Km(KeymasterError::IncompatiblePurpose))
        }
    }

    /// Every algorithm, digest, padding or block mode named in the
    /// operation parameters must be present in the key's authorization
    /// list.
    fn check_op_params(
        &self,
        key_auths: &[KeyParameter],
        op_params: &[KeyParameter],
    ) -> Result<(), Error> {
        for param in op_params {
            let err = match param.tag {
                Tag::ALGORITHM => KeymasterError::IncompatibleAlgorithm,
                Tag::DIGEST => KeymasterError::IncompatibleDigest,
                Tag::PADDING => KeymasterError::IncompatiblePaddingMode,
                Tag::BLOCK_MODE => KeymasterError::IncompatibleBlockMode,
                _ => continue,
            };
            if !key_auths.contains(param) {
                return Err(Error::Km(err));
            }
        }
        Ok(())
    }

    fn check_caller_nonce(
        &self,
        key_auths: &[KeyParameter],
        op_params: &[KeyParameter],
    ) -> Result<(), Error> {
        if contains_tag(op_params, Tag::NONCE) && !contains_tag(key_auths, Tag::CALLER_NONCE) {
            return Err(Error::Km(KeymasterError::CallerNonceProhibited));
        }
        Ok(())
    }

    fn check_validity_windows(
        &self,
        key_auths: &[KeyParameter],
        purpose: KeyPurpose,
    ) -> Result<(), Error> {
        let now_ms = wall_clock_ms();
        for param in key_auths {
            let date_ms = match &param.value {
                KeyParameterValue::DateTime(ms) => *ms,
                _ => continue,
            };
            match param.tag {
                Tag::ACTIVE_DATETIME => {
                    if now_ms < date_ms {
                        return Err(Error::Km(KeymasterError::KeyNotYetValid));
                    }
                }
                Tag::ORIGINATION_EXPIRE_DATETIME
                    if matches!(purpose, KeyPurpose::SIGN | KeyPurpose::ENCRYPT) =>
                {
                    if now_ms > date_ms {
                        return Err(Error::Km(KeymasterError::KeyExpired));
                    }
                }
                Tag::USAGE_EXPIRE_DATETIME
                    if matches!(purpose, KeyPurpose::VERIFY | KeyPurpose::DECRYPT) =>
                {
                    if now_ms > date_ms {
                        return Err(Error::Km(KeymasterError::KeyExpired));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn check_usage_counters(&self, key_auths: &[KeyParameter], key_id: u64) -> Result<(), Error> {
        if let Some(max_uses) = key_auths.iter().find_map(|p| match (p.tag, &p.value) {
            (Tag::MAX_USES_PER_BOOT, KeyParameterValue::Integer(n)) => Some(*n),
            _ => None,
        }) {
            let mut counts =
                self.access_counts.lock().expect("In EnforcementPolicy::check_usage_counters.");
            let count = counts.entry(key_id).or_insert(0);
            if *count >= max_uses {
                return Err(Error::Km(KeymasterError::KeyMaxOpsExceeded));
            }
            *count += 1;
        }

        if let Some(min_gap_s) = key_auths.iter().find_map(|p| match (p.tag, &p.value) {
            (Tag::MIN_SECONDS_BETWEEN_OPS, KeyParameterValue::Integer(n)) => Some(*n as u64),
            _ => None,
        }) {
            let now_s = wall_clock_ms() / 1000;
            let mut last_use =
                self.last_use_s.lock().expect("In EnforcementPolicy::check_usage_counters.");
            if let Some(last) = last_use.get(&key_id) {
                if now_s < last.saturating_add(min_gap_s) {
                    return Err(Error::Km(KeymasterError::KeyRateLimitExceeded));
                }
            }
            last_use.insert(key_id, now_s);
        }
        Ok(())
    }
}
