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

//! Principal id arithmetic. A UID identifies one app under one user; the
//! user and app components are derived by the stride below.

/// Number of uids reserved per user.
pub const USER_ID_STRIDE: u32 = 100_000;

/// App id of the system principal within each user's uid range.
pub const SYSTEM_APP_ID: u32 = 1000;

/// Sentinel accepted by operations that take an optional target uid,
/// meaning "the caller's own uid".
pub const UID_SELF: i32 = -1;

/// Extracts the user id from the given uid.
pub fn user_id(uid: u32) -> u32 {
    uid / USER_ID_STRIDE
}

/// Extracts the app id from the given uid.
pub fn app_id(uid: u32) -> u32 {
    uid % USER_ID_STRIDE
}

/// True iff the uid belongs to the system principal of its user.
pub fn is_system_uid(uid: u32) -> bool {
    app_id(uid) == SYSTEM_APP_ID
}

/// Resolves an optional target uid against the calling uid.
pub fn effective_uid(calling_uid: u32, target_uid: i32) -> u32 {
    if target_uid == UID_SELF {
        calling_uid
    } else {
        target_uid as u32
    }
}
