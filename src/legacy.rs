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

//! The legacy call surface. These entry points predate the parameterized
//! API: key shapes are fixed (digest none, padding none), results are
//! reported in the legacy response code space, and any keymaster native
//! error collapses into `SystemError`.

use crate::error::{root_cause_error, Error, ResponseCode};
use crate::key_parameter::{
    Algorithm, Digest, KeyFormat, KeyParameter, KeyParameterValue, KeyPurpose, PaddingMode, Tag,
};
use crate::service::KeyStoreCore;
use crate::traits::Caller;
use crate::utils::UID_SELF;

const RSA_KEY_SIZE_DEFAULT: i32 = 2048;
const RSA_KEY_SIZE_MIN: i32 = 512;
const RSA_KEY_SIZE_MAX: i32 = 4096;
const RSA_EXPONENT_DEFAULT: u64 = 65537;
const EC_KEY_SIZE_DEFAULT: i32 = 256;
const EC_KEY_SIZE_MIN: i32 = 224;
const EC_KEY_SIZE_MAX: i32 = 521;

/// Collapses an internal error into the legacy response code space: service
/// codes survive verbatim, everything from the keymaster becomes a system
/// error.
fn legacy_code(e: &anyhow::Error) -> ResponseCode {
    match root_cause_error(e) {
        Error::Rc(rc) => rc,
        Error::Km(_) => ResponseCode::SystemError,
    }
}

// All legacy keys are digest none / padding none and usable without user
// authentication.
fn legacy_key_authorizations(algorithm: Algorithm) -> Vec<KeyParameter> {
    vec![
        KeyParameter::new(Tag::PURPOSE, KeyParameterValue::KeyPurpose(KeyPurpose::SIGN)),
        KeyParameter::new(Tag::PURPOSE, KeyParameterValue::KeyPurpose(KeyPurpose::VERIFY)),
        KeyParameter::new(Tag::PURPOSE, KeyParameterValue::KeyPurpose(KeyPurpose::ENCRYPT)),
        KeyParameter::new(Tag::PURPOSE, KeyParameterValue::KeyPurpose(KeyPurpose::DECRYPT)),
        KeyParameter::new(Tag::ALGORITHM, KeyParameterValue::Algorithm(algorithm)),
        KeyParameter::new(Tag::DIGEST, KeyParameterValue::Digest(Digest::NONE)),
        KeyParameter::new(Tag::PADDING, KeyParameterValue::PaddingMode(PaddingMode::NONE)),
        KeyParameter::bool(Tag::NO_AUTH_REQUIRED),
    ]
}

// Big endian byte string to machine word; None if the value does not fit.
fn parse_public_exponent(bytes: &[u8]) -> Option<u64> {
    let stripped: &[u8] = match bytes.iter().position(|b| *b != 0) {
        Some(first) => &bytes[first..],
        None => &[],
    };
    if stripped.len() > std::mem::size_of::<u64>() {
        return None;
    }
    Some(stripped.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64))
}

impl KeyStoreCore {
    /// Legacy key generation: algorithm plus an optional size, with an
    /// optional RSA public exponent as a big endian byte string. A size of
    /// -1 selects the per-algorithm default.
    pub fn legacy_generate(
        &self,
        caller: Caller,
        alias: &str,
        target_uid: i32,
        algorithm: Algorithm,
        key_size: i32,
        request_flags: u8,
        args: &[Vec<u8>],
    ) -> Result<(), ResponseCode> {
        let mut params = legacy_key_authorizations(algorithm);
        match algorithm {
            Algorithm::EC => {
                let key_size = if key_size == -1 { EC_KEY_SIZE_DEFAULT } else { key_size };
                if !(EC_KEY_SIZE_MIN..=EC_KEY_SIZE_MAX).contains(&key_size) {
                    log::info!("invalid key size {}", key_size);
                    return Err(ResponseCode::SystemError);
                }
                params.push(KeyParameter::new(
                    Tag::KEY_SIZE,
                    KeyParameterValue::Integer(key_size as u32),
                ));
            }
            Algorithm::RSA => {
                let key_size = if key_size == -1 { RSA_KEY_SIZE_DEFAULT } else { key_size };
                if !(RSA_KEY_SIZE_MIN..=RSA_KEY_SIZE_MAX).contains(&key_size) {
                    log::info!("invalid key size {}", key_size);
                    return Err(ResponseCode::SystemError);
                }
                params.push(KeyParameter::new(
                    Tag::KEY_SIZE,
                    KeyParameterValue::Integer(key_size as u32),
                ));
                if args.len() > 1 {
                    log::info!("invalid number of arguments: {}", args.len());
                    return Err(ResponseCode::SystemError);
                }
                let exponent = match args.first() {
                    Some(bytes) => match parse_public_exponent(bytes) {
                        Some(e) => e,
                        None => {
                            log::warn!("cannot represent public exponent as a long value");
                            return Err(ResponseCode::SystemError);
                        }
                    },
                    None => RSA_EXPONENT_DEFAULT,
                };
                params.push(KeyParameter::new(
                    Tag::RSA_PUBLIC_EXPONENT,
                    KeyParameterValue::LongInteger(exponent),
                ));
            }
            _ => {
                log::warn!("Unsupported legacy key algorithm {:?}", algorithm);
                return Err(ResponseCode::SystemError);
            }
        }

        self.generate_key(caller, alias, &params, &[], target_uid, request_flags)
            .map(|_| ())
            .map_err(|e| {
                log::warn!("generate failed: {:?}", legacy_code(&e));
                legacy_code(&e)
            })
    }

    /// Legacy key import. The key material is a PKCS#8 encoded private key;
    /// only RSA and EC are accepted.
    pub fn legacy_import(
        &self,
        caller: Caller,
        alias: &str,
        algorithm: Algorithm,
        key_data: &[u8],
        target_uid: i32,
        request_flags: u8,
    ) -> Result<(), ResponseCode> {
        if !matches!(algorithm, Algorithm::RSA | Algorithm::EC) {
            log::warn!("Unsupported legacy key algorithm {:?}", algorithm);
            return Err(ResponseCode::SystemError);
        }
        let params = legacy_key_authorizations(algorithm);
        self.import_key(
            caller,
            alias,
            &params,
            KeyFormat::PKCS8,
            key_data,
            target_uid,
            request_flags,
        )
        .map(|_| ())
        .map_err(|e| {
            log::warn!("import_key failed: {:?}", legacy_code(&e));
            legacy_code(&e)
        })
    }

    /// Legacy one-shot signing.
    pub fn sign(&self, caller: Caller, alias: &str, data: &[u8]) -> Result<Vec<u8>, ResponseCode> {
        self.check_permission(caller, crate::permission::KeystorePerm::Sign)
            .map_err(|e| legacy_code(&e))?;
        self.do_legacy_sign_verify(caller, alias, data, &[], KeyPurpose::SIGN)
    }

    /// Legacy one-shot verification.
    pub fn verify(
        &self,
        caller: Caller,
        alias: &str,
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), ResponseCode> {
        self.check_permission(caller, crate::permission::KeystorePerm::Verify)
            .map_err(|e| legacy_code(&e))?;
        self.do_legacy_sign_verify(caller, alias, data, signature, KeyPurpose::VERIFY)
            .map(|_| ())
    }

    /// Legacy public key export: X.509 SubjectPublicKeyInfo of the caller's
    /// key.
    pub fn get_pubkey(&self, caller: Caller, alias: &str) -> Result<Vec<u8>, ResponseCode> {
        self.export_key(caller, alias, KeyFormat::X509, &[], &[], UID_SELF).map_err(|e| {
            log::warn!("export failed: {:?}", legacy_code(&e));
            legacy_code(&e)
        })
    }

    // Sequences begin, update until the input is consumed, and finish, with
    // the signature supplied on verify. Output chunks are concatenated.
    fn do_legacy_sign_verify(
        &self,
        caller: Caller,
        alias: &str,
        data: &[u8],
        signature: &[u8],
        purpose: KeyPurpose,
    ) -> Result<Vec<u8>, ResponseCode> {
        let mut in_params = vec![
            KeyParameter::new(Tag::DIGEST, KeyParameterValue::Digest(Digest::NONE)),
            KeyParameter::new(Tag::PADDING, KeyParameterValue::PaddingMode(PaddingMode::NONE)),
        ];
        match self.get_key_characteristics(caller, alias, &[], &[], UID_SELF) {
            Ok(chars) => match chars.algorithm() {
                Some(algorithm) => in_params
                    .push(KeyParameter::new(Tag::ALGORITHM, KeyParameterValue::Algorithm(algorithm))),
                None => log::error!("key characteristics did not include an algorithm"),
            },
            Err(_) => log::error!("Failed to get key characteristics"),
        }

        let liveness = self.fresh_internal_liveness();
        let begin = self
            .begin(caller, liveness, alias, purpose, true, &in_params, &[], UID_SELF)
            .map_err(|e| {
                let code = legacy_code(&e);
                if code == ResponseCode::KeyNotFound {
                    log::warn!("Key not found");
                } else {
                    log::warn!("Error in begin: {:?}", code);
                }
                code
            })?;

        let mut out = Vec::new();
        let mut consumed = 0usize;
        loop {
            let result = self.update(begin.ticket, &[], &data[consumed..]).map_err(|e| {
                log::warn!("Error in update: {:?}", legacy_code(&e));
                legacy_code(&e)
            })?;
            out.extend_from_slice(&result.output);
            consumed += result.input_consumed;
            if consumed >= data.len() || result.input_consumed == 0 {
                break;
            }
        }
        if consumed != data.len() {
            log::warn!("Not all data consumed. Consumed {} of {}", consumed, data.len());
            let _ = self.abort(begin.ticket);
            return Err(ResponseCode::SystemError);
        }

        let finish = self.finish(begin.ticket, &[], signature, &[]).map_err(|e| {
            log::warn!("Error in finish: {:?}", legacy_code(&e));
            legacy_code(&e)
        })?;
        out.extend_from_slice(&finish.output);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KeymasterError;
    use crate::permission::KeystorePerm;
    use crate::testing::{MockAttestationIds, MockBlobStore, MockKeymaster, MockPermissions};
    use crate::utils::{SYSTEM_APP_ID, USER_ID_STRIDE};
    use std::sync::Arc;

    const USER: u32 = 10;
    const APP_UID: u32 = USER * USER_ID_STRIDE + 10021;
    const SYSTEM_UID: u32 = USER * USER_ID_STRIDE + SYSTEM_APP_ID;
    const APP: Caller = Caller { uid: APP_UID, pid: 21 };
    const SYSTEM: Caller = Caller { uid: SYSTEM_UID, pid: 22 };

    struct Harness {
        core: KeyStoreCore,
        primary: Arc<MockKeymaster>,
        fallback: Arc<MockKeymaster>,
        permissions: Arc<MockPermissions>,
        _working_dir: tempfile::TempDir,
    }

    fn unlocked_harness() -> Harness {
        let store = Arc::new(MockBlobStore::new());
        let primary = Arc::new(MockKeymaster::new(false));
        let fallback = Arc::new(MockKeymaster::new(true));
        let permissions = Arc::new(MockPermissions::new());
        let working_dir = tempfile::tempdir().unwrap();
        let core = KeyStoreCore::new(
            store,
            primary.clone(),
            fallback.clone(),
            permissions.clone(),
            Arc::new(MockAttestationIds::new()),
            working_dir.path(),
        );
        core.on_user_password_changed(SYSTEM, USER, "1234").unwrap();
        Harness { core, primary, fallback, permissions, _working_dir: working_dir }
    }

    #[test]
    fn generate_accepts_defaults_and_validates_ranges() {
        let h = unlocked_harness();
        h.core.legacy_generate(APP, "ec", -1, Algorithm::EC, -1, 0, &[]).unwrap();
        h.core.legacy_generate(APP, "rsa", -1, Algorithm::RSA, -1, 0, &[]).unwrap();

        assert_eq!(
            h.core.legacy_generate(APP, "small", -1, Algorithm::EC, 128, 0, &[]),
            Err(ResponseCode::SystemError)
        );
        assert_eq!(
            h.core.legacy_generate(APP, "big", -1, Algorithm::RSA, 8192, 0, &[]),
            Err(ResponseCode::SystemError)
        );
        assert_eq!(
            h.core.legacy_generate(APP, "aes", -1, Algorithm::AES, 128, 0, &[]),
            Err(ResponseCode::SystemError)
        );
    }

    #[test]
    fn generate_parses_rsa_public_exponent() {
        let h = unlocked_harness();
        // 65537 as a big endian byte string, with leading zeros.
        h.core
            .legacy_generate(APP, "rsa", -1, Algorithm::RSA, 2048, 0, &[vec![0, 1, 0, 1]])
            .unwrap();

        // Wider than a machine word.
        assert_eq!(
            h.core.legacy_generate(APP, "rsa2", -1, Algorithm::RSA, 2048, 0, &[vec![1; 9]]),
            Err(ResponseCode::SystemError)
        );
        // At most one argument is understood.
        assert_eq!(
            h.core.legacy_generate(
                APP,
                "rsa3",
                -1,
                Algorithm::RSA,
                2048,
                0,
                &[vec![3], vec![5]]
            ),
            Err(ResponseCode::SystemError)
        );
    }

    #[test]
    fn parse_public_exponent_strips_leading_zeros() {
        assert_eq!(parse_public_exponent(&[]), Some(0));
        assert_eq!(parse_public_exponent(&[0, 0, 3]), Some(3));
        assert_eq!(parse_public_exponent(&[1, 0, 1]), Some(65537));
        assert_eq!(parse_public_exponent(&[0, 0, 0, 0, 0, 0, 0, 0, 0, 1]), Some(1));
        assert_eq!(parse_public_exponent(&[1, 0, 0, 0, 0, 0, 0, 0, 0]), None);
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let h = unlocked_harness();
        h.core.legacy_generate(APP, "k", -1, Algorithm::EC, -1, 0, &[]).unwrap();

        let signature = h.core.sign(APP, "k", b"hello").unwrap();
        assert!(!signature.is_empty());
        h.core.verify(APP, "k", b"hello", &signature).unwrap();
    }

    #[test]
    fn sign_chunks_large_inputs() {
        let h = unlocked_harness();
        h.core.legacy_generate(APP, "k", -1, Algorithm::EC, -1, 0, &[]).unwrap();
        h.primary.set_update_chunk(4);

        let data = vec![0xabu8; 19];
        let signature = h.core.sign(APP, "k", &data).unwrap();
        // Every chunk echoed plus the finish output.
        assert!(signature.len() > data.len());
    }

    #[test]
    fn stalled_update_is_a_system_error_without_leaks() {
        let h = unlocked_harness();
        h.core.legacy_generate(APP, "k", -1, Algorithm::EC, -1, 0, &[]).unwrap();
        h.primary.set_update_chunk(0);

        assert_eq!(h.core.sign(APP, "k", b"hello"), Err(ResponseCode::SystemError));
        assert_eq!(h.primary.active_count(), 0);
    }

    #[test]
    fn response_codes_survive_keymaster_errors_do_not() {
        let h = unlocked_harness();

        // Missing key: the service code is preserved verbatim.
        assert_eq!(h.core.sign(APP, "missing", b"x"), Err(ResponseCode::KeyNotFound));

        // Permission denial short circuits.
        h.permissions.deny(KeystorePerm::Sign);
        assert_eq!(h.core.sign(APP, "missing", b"x"), Err(ResponseCode::PermissionDenied));

        // A keymaster native error collapses into SystemError.
        h.primary.fail_creation(KeymasterError::UnsupportedAlgorithm);
        h.fallback.fail_creation(KeymasterError::UnsupportedAlgorithm);
        assert_eq!(
            h.core.legacy_generate(APP, "k", -1, Algorithm::EC, -1, 0, &[]),
            Err(ResponseCode::SystemError)
        );
    }

    #[test]
    fn import_accepts_rsa_and_ec_only() {
        let h = unlocked_harness();
        h.core.legacy_import(APP, "imp", Algorithm::EC, b"pkcs8", -1, 0).unwrap();
        assert_eq!(
            h.core.legacy_import(APP, "imp2", Algorithm::HMAC, b"pkcs8", -1, 0),
            Err(ResponseCode::SystemError)
        );
    }

    #[test]
    fn get_pubkey_exports_x509() {
        let h = unlocked_harness();
        h.core.legacy_generate(APP, "k", -1, Algorithm::EC, -1, 0, &[]).unwrap();
        let pubkey = h.core.get_pubkey(APP, "k").unwrap();
        assert!(pubkey.starts_with(b"export:"));

        assert_eq!(h.core.get_pubkey(APP, "missing"), Err(ResponseCode::KeyNotFound));
    }
}
