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

//! The keystore permission vocabulary. Whether a given caller holds a
//! permission is the `PermissionOracle`'s business; this module only names
//! the actions.

/// Actions a caller may be granted on the keystore service.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum KeystorePerm {
    AddAuth,
    ClearUid,
    Delete,
    Duplicate,
    Exist,
    GenUniqueId,
    Get,
    GetState,
    Grant,
    Insert,
    IsEmpty,
    List,
    Lock,
    Password,
    Reset,
    Sign,
    Unlock,
    UserChanged,
    Verify,
}

impl KeystorePerm {
    /// The label used in log messages.
    pub fn label(&self) -> &'static str {
        match self {
            KeystorePerm::AddAuth => "add_auth",
            KeystorePerm::ClearUid => "clear_uid",
            KeystorePerm::Delete => "delete",
            KeystorePerm::Duplicate => "duplicate",
            KeystorePerm::Exist => "exist",
            KeystorePerm::GenUniqueId => "gen_unique_id",
            KeystorePerm::Get => "get",
            KeystorePerm::GetState => "get_state",
            KeystorePerm::Grant => "grant",
            KeystorePerm::Insert => "insert",
            KeystorePerm::IsEmpty => "is_empty",
            KeystorePerm::List => "list",
            KeystorePerm::Lock => "lock",
            KeystorePerm::Password => "password",
            KeystorePerm::Reset => "reset",
            KeystorePerm::Sign => "sign",
            KeystorePerm::Unlock => "unlock",
            KeystorePerm::UserChanged => "user_changed",
            KeystorePerm::Verify => "verify",
        }
    }
}

/// Platform level permission gating device id attestation.
pub const READ_PRIVILEGED_PHONE_STATE: &str = "android.permission.READ_PRIVILEGED_PHONE_STATE";
