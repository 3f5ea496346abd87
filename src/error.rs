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

//! Error types for the keystore core.
//!
//! `Error` encapsulates the two error taxonomies of the service: the
//! service's own `ResponseCode` space and the keymaster's `KeymasterError`
//! space. It is used internally to diagnose error conditions that need to be
//! reported to the client.
//!
//! Functions of this crate use `anyhow::Result` and add context with the
//! `ks_err!` macro every time an error is forwarded. At the service boundary
//! `anyhow_error_to_serialized_error` squashes both taxonomies into a single
//! signed integer wire space.

/// Expands an error context message to include the file and line number.
///
/// # Examples
///
/// ```ignore
/// use crate::ks_err;
///
/// ks_err!("Key is expired.");
/// // "src/enforcement.rs:122: Key is expired."
/// ```
#[macro_export]
macro_rules! ks_err {
    { $($arg:tt)+ } => {
        format!("{}:{}: {}", file!(), line!(), format_args!($($arg)+))
    };
    {} => {
        format!("{}:{}", file!(), line!())
    };
}

/// Service response codes. These are positive on the wire.
///
/// Some values coincide numerically with the user state values for
/// historical reasons; the two are nevertheless distinct types and are only
/// mapped into each other at the service boundary (see `UserState`).
#[repr(i32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ResponseCode {
    /// Request completed successfully. Only used by the legacy surface,
    /// which reports results as codes rather than as `Result`.
    NoError = 1,
    /// The user's master key is on disk but not in memory.
    Locked = 2,
    /// The user has no master key.
    Uninitialized = 3,
    /// Unspecified internal failure, including keymaster transport failures.
    SystemError = 4,
    /// Malformed request.
    ProtocolError = 5,
    /// The caller lacks the permission for the requested action.
    PermissionDenied = 6,
    /// No blob was found under the requested alias.
    KeyNotFound = 7,
    /// A blob was found but could not be decoded or decrypted.
    ValueCorrupted = 8,
    /// The requested action is not defined for this key type.
    UndefinedAction = 9,
    /// Wrong unlock password; the suffix counts remaining attempts.
    WrongPassword0 = 10,
    /// See `WrongPassword0`.
    WrongPassword1 = 11,
    /// See `WrongPassword0`.
    WrongPassword2 = 12,
    /// See `WrongPassword0`.
    WrongPassword3 = 13,
    /// Signature verification failed on the legacy verify surface.
    SignatureInvalid = 14,
    /// The operation started but requires a per-operation authorization
    /// token before the first update call.
    OpAuthNeeded = 15,
}

/// Keymaster error codes. These are negative on the wire.
#[repr(i32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum KeymasterError {
    UnsupportedPurpose = -2,
    IncompatiblePurpose = -3,
    UnsupportedAlgorithm = -4,
    IncompatibleAlgorithm = -5,
    UnsupportedKeySize = -6,
    UnsupportedBlockMode = -7,
    IncompatibleBlockMode = -8,
    UnsupportedPaddingMode = -10,
    IncompatiblePaddingMode = -11,
    UnsupportedDigest = -12,
    IncompatibleDigest = -13,
    InvalidExpirationTime = -14,
    InvalidUserId = -15,
    InvalidAuthorizationTimeout = -16,
    UnsupportedKeyFormat = -17,
    InvalidInputLength = -21,
    KeyNotYetValid = -24,
    KeyExpired = -25,
    KeyUserNotAuthenticated = -26,
    InvalidOperationHandle = -28,
    VerificationFailed = -30,
    TooManyOperations = -31,
    UnexpectedNullPointer = -32,
    InvalidKeyBlob = -33,
    InvalidArgument = -38,
    UnsupportedTag = -39,
    InvalidTag = -40,
    ImportParameterMismatch = -44,
    OperationCancelled = -46,
    MissingNonce = -51,
    InvalidNonce = -52,
    KeyRateLimitExceeded = -54,
    CallerNonceProhibited = -55,
    KeyMaxOpsExceeded = -56,
    UnsupportedEcCurve = -61,
    KeyRequiresUpgrade = -62,
    AttestationChallengeMissing = -63,
    AttestationApplicationIdMissing = -65,
    CannotAttestIds = -66,
    Unimplemented = -100,
    UnknownError = -1000,
}

/// The main error type of the keystore core. It wraps the service's own
/// `ResponseCode` in the `Rc` variant and keymaster errors in the `Km`
/// variant.
#[derive(Debug, thiserror::Error, Copy, Clone, Eq, PartialEq)]
pub enum Error {
    /// Wraps a service response code.
    #[error("Error::Rc({0:?})")]
    Rc(ResponseCode),
    /// Wraps a keymaster error code.
    #[error("Error::Km({0:?})")]
    Km(KeymasterError),
}

impl Error {
    /// Short hand for `Error::Rc(ResponseCode::SystemError)`.
    pub fn sys() -> Self {
        Error::Rc(ResponseCode::SystemError)
    }

    /// Short hand for `Error::Rc(ResponseCode::PermissionDenied)`.
    pub fn perm() -> Self {
        Error::Rc(ResponseCode::PermissionDenied)
    }
}

/// This type is used to send error codes on the wire.
///
/// Errors are squashed into one number space using the following rules:
/// - `ResponseCode` values are positive and identity mapped.
/// - `KeymasterError` values are negative and identity mapped.
/// - Everything else maps to `ResponseCode::SystemError`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct SerializedError(pub i32);

/// Returns a SerializedError given a reference to Error.
pub fn error_to_serialized_error(e: &Error) -> SerializedError {
    match e {
        Error::Rc(rc) => SerializedError(*rc as i32),
        Error::Km(ec) => SerializedError(*ec as i32),
    }
}

/// Returns a SerializedError given a reference to anyhow::Error. The root
/// cause is inspected; anything that is not a keystore `Error` is reported
/// as a system error.
pub fn anyhow_error_to_serialized_error(e: &anyhow::Error) -> SerializedError {
    match e.root_cause().downcast_ref::<Error>() {
        Some(e) => error_to_serialized_error(e),
        None => SerializedError(ResponseCode::SystemError as i32),
    }
}

/// Extracts the keystore `Error` from the root cause of an anyhow error
/// chain, mapping everything else to a system error.
pub fn root_cause_error(e: &anyhow::Error) -> Error {
    match e.root_cause().downcast_ref::<Error>() {
        Some(e) => *e,
        None => Error::sys(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Context};

    fn nested_nested_rc(rc: ResponseCode) -> anyhow::Result<()> {
        Err(anyhow!(Error::Rc(rc))).context("nested nested rc")
    }

    fn nested_rc(rc: ResponseCode) -> anyhow::Result<()> {
        nested_nested_rc(rc).context("nested rc")
    }

    fn nested_km(ec: KeymasterError) -> anyhow::Result<()> {
        Err(anyhow!(Error::Km(ec))).context("nested km")
    }

    #[derive(Debug, thiserror::Error)]
    enum TestError {
        #[error("TestError::Fail")]
        Fail,
    }

    #[test]
    fn response_codes_map_identically() {
        for rc in [
            ResponseCode::Locked,
            ResponseCode::Uninitialized,
            ResponseCode::PermissionDenied,
            ResponseCode::KeyNotFound,
            ResponseCode::OpAuthNeeded,
        ] {
            assert_eq!(
                anyhow_error_to_serialized_error(&nested_rc(rc).unwrap_err()),
                SerializedError(rc as i32)
            );
        }
        assert_eq!(ResponseCode::NoError as i32, 1);
        assert_eq!(ResponseCode::OpAuthNeeded as i32, 15);
    }

    #[test]
    fn keymaster_errors_map_identically() {
        for ec in [
            KeymasterError::KeyUserNotAuthenticated,
            KeymasterError::TooManyOperations,
            KeymasterError::InvalidOperationHandle,
            KeymasterError::KeyRequiresUpgrade,
        ] {
            assert_eq!(
                anyhow_error_to_serialized_error(&nested_km(ec).unwrap_err()),
                SerializedError(ec as i32)
            );
            assert!((ec as i32) < 0);
        }
    }

    #[test]
    fn unrelated_errors_map_to_system_error() {
        let e = Err::<(), _>(anyhow!(TestError::Fail)).context("nested other").unwrap_err();
        assert_eq!(
            anyhow_error_to_serialized_error(&e),
            SerializedError(ResponseCode::SystemError as i32)
        );
        assert_eq!(root_cause_error(&e), Error::sys());
    }

    #[test]
    fn root_cause_survives_context_nesting() {
        let e = nested_rc(ResponseCode::KeyNotFound).unwrap_err();
        assert_eq!(root_cause_error(&e), Error::Rc(ResponseCode::KeyNotFound));
    }
}
