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

#![allow(non_camel_case_types)]
#![allow(missing_docs)]

//! Keymaster tag and parameter model. Tag values encode their type in the
//! top nibble; the remainder is the tag ordinal as defined by the keymaster
//! HAL.

/// The type of a tag, stored in the four most significant bits of the tag
/// value.
#[repr(u32)]
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum TagType {
    INVALID = 0 << 28,
    ENUM = 1 << 28,
    ENUM_REP = 2 << 28,
    UINT = 3 << 28,
    UINT_REP = 4 << 28,
    ULONG = 5 << 28,
    DATE = 6 << 28,
    BOOL = 7 << 28,
    BIGNUM = 8 << 28,
    BYTES = 9 << 28,
    ULONG_REP = 10 << 28,
}

#[repr(u32)]
#[derive(PartialEq, Eq, Debug, Copy, Clone, Hash, PartialOrd, Ord)]
pub enum Tag {
    INVALID = TagType::INVALID as u32,
    PURPOSE = TagType::ENUM_REP as u32 | 1,
    ALGORITHM = TagType::ENUM as u32 | 2,
    KEY_SIZE = TagType::UINT as u32 | 3,
    BLOCK_MODE = TagType::ENUM_REP as u32 | 4,
    DIGEST = TagType::ENUM_REP as u32 | 5,
    PADDING = TagType::ENUM_REP as u32 | 6,
    CALLER_NONCE = TagType::BOOL as u32 | 7,
    MIN_MAC_LENGTH = TagType::UINT as u32 | 8,
    EC_CURVE = TagType::ENUM as u32 | 10,
    RSA_PUBLIC_EXPONENT = TagType::ULONG as u32 | 200,
    INCLUDE_UNIQUE_ID = TagType::BOOL as u32 | 202,
    ACTIVE_DATETIME = TagType::DATE as u32 | 400,
    ORIGINATION_EXPIRE_DATETIME = TagType::DATE as u32 | 401,
    USAGE_EXPIRE_DATETIME = TagType::DATE as u32 | 402,
    MIN_SECONDS_BETWEEN_OPS = TagType::UINT as u32 | 403,
    MAX_USES_PER_BOOT = TagType::UINT as u32 | 404,
    USER_ID = TagType::UINT as u32 | 501,
    USER_SECURE_ID = TagType::ULONG_REP as u32 | 502,
    NO_AUTH_REQUIRED = TagType::BOOL as u32 | 503,
    USER_AUTH_TYPE = TagType::ENUM as u32 | 504,
    AUTH_TIMEOUT = TagType::UINT as u32 | 505,
    ALLOW_WHILE_ON_BODY = TagType::BOOL as u32 | 506,
    TRUSTED_USER_PRESENCE_REQUIRED = TagType::BOOL as u32 | 507,
    APPLICATION_ID = TagType::BYTES as u32 | 601,
    APPLICATION_DATA = TagType::BYTES as u32 | 700,
    CREATION_DATETIME = TagType::DATE as u32 | 701,
    ORIGIN = TagType::ENUM as u32 | 702,
    ROOT_OF_TRUST = TagType::BYTES as u32 | 704,
    OS_VERSION = TagType::UINT as u32 | 705,
    OS_PATCHLEVEL = TagType::UINT as u32 | 706,
    UNIQUE_ID = TagType::BYTES as u32 | 707,
    ATTESTATION_CHALLENGE = TagType::BYTES as u32 | 708,
    ATTESTATION_APPLICATION_ID = TagType::BYTES as u32 | 709,
    ATTESTATION_ID_BRAND = TagType::BYTES as u32 | 710,
    ATTESTATION_ID_DEVICE = TagType::BYTES as u32 | 711,
    ATTESTATION_ID_PRODUCT = TagType::BYTES as u32 | 712,
    ATTESTATION_ID_SERIAL = TagType::BYTES as u32 | 713,
    ATTESTATION_ID_IMEI = TagType::BYTES as u32 | 714,
    ATTESTATION_ID_MEID = TagType::BYTES as u32 | 715,
    ATTESTATION_ID_MANUFACTURER = TagType::BYTES as u32 | 716,
    ATTESTATION_ID_MODEL = TagType::BYTES as u32 | 717,
    AUTH_TOKEN = TagType::BYTES as u32 | 1002,
    NONCE = TagType::BYTES as u32 | 1001,
    MAC_LENGTH = TagType::UINT as u32 | 1003,
    RESET_SINCE_ID_ROTATION = TagType::BOOL as u32 | 1004,
}

impl Tag {
    /// Every tag this service knows about.
    pub const ALL: &'static [Tag] = &[
        Tag::PURPOSE,
        Tag::ALGORITHM,
        Tag::KEY_SIZE,
        Tag::BLOCK_MODE,
        Tag::DIGEST,
        Tag::PADDING,
        Tag::CALLER_NONCE,
        Tag::MIN_MAC_LENGTH,
        Tag::EC_CURVE,
        Tag::RSA_PUBLIC_EXPONENT,
        Tag::INCLUDE_UNIQUE_ID,
        Tag::ACTIVE_DATETIME,
        Tag::ORIGINATION_EXPIRE_DATETIME,
        Tag::USAGE_EXPIRE_DATETIME,
        Tag::MIN_SECONDS_BETWEEN_OPS,
        Tag::MAX_USES_PER_BOOT,
        Tag::USER_ID,
        Tag::USER_SECURE_ID,
        Tag::NO_AUTH_REQUIRED,
        Tag::USER_AUTH_TYPE,
        Tag::AUTH_TIMEOUT,
        Tag::ALLOW_WHILE_ON_BODY,
        Tag::TRUSTED_USER_PRESENCE_REQUIRED,
        Tag::APPLICATION_ID,
        Tag::APPLICATION_DATA,
        Tag::CREATION_DATETIME,
        Tag::ORIGIN,
        Tag::ROOT_OF_TRUST,
        Tag::OS_VERSION,
        Tag::OS_PATCHLEVEL,
        Tag::UNIQUE_ID,
        Tag::ATTESTATION_CHALLENGE,
        Tag::ATTESTATION_APPLICATION_ID,
        Tag::ATTESTATION_ID_BRAND,
        Tag::ATTESTATION_ID_DEVICE,
        Tag::ATTESTATION_ID_PRODUCT,
        Tag::ATTESTATION_ID_SERIAL,
        Tag::ATTESTATION_ID_IMEI,
        Tag::ATTESTATION_ID_MEID,
        Tag::ATTESTATION_ID_MANUFACTURER,
        Tag::ATTESTATION_ID_MODEL,
        Tag::AUTH_TOKEN,
        Tag::NONCE,
        Tag::MAC_LENGTH,
        Tag::RESET_SINCE_ID_ROTATION,
    ];

    /// Looks up a tag by its raw HAL value.
    pub fn from_raw(raw: u32) -> Option<Tag> {
        Tag::ALL.iter().copied().find(|t| *t as u32 == raw)
    }

    /// The type nibble of this tag.
    pub fn tag_type(self) -> TagType {
        match (self as u32) >> 28 {
            1 => TagType::ENUM,
            2 => TagType::ENUM_REP,
            3 => TagType::UINT,
            4 => TagType::UINT_REP,
            5 => TagType::ULONG,
            6 => TagType::DATE,
            7 => TagType::BOOL,
            8 => TagType::BIGNUM,
            9 => TagType::BYTES,
            10 => TagType::ULONG_REP,
            _ => TagType::INVALID,
        }
    }

    /// True for the tags that identify the hardware device for device id
    /// attestation. Requests carrying these must go through the dedicated
    /// device id attestation entry point.
    pub fn is_device_id_attestation_tag(self) -> bool {
        matches!(
            self,
            Tag::ATTESTATION_ID_BRAND
                | Tag::ATTESTATION_ID_DEVICE
                | Tag::ATTESTATION_ID_IMEI
                | Tag::ATTESTATION_ID_MANUFACTURER
                | Tag::ATTESTATION_ID_MEID
                | Tag::ATTESTATION_ID_MODEL
                | Tag::ATTESTATION_ID_PRODUCT
                | Tag::ATTESTATION_ID_SERIAL
        )
    }
}

macro_rules! hal_enum {
    ($name:ident { $($variant:ident = $value:expr,)+ }) => {
        #[repr(u32)]
        #[derive(PartialEq, Eq, Debug, Copy, Clone, Hash, PartialOrd, Ord)]
        pub enum $name {
            $($variant = $value,)+
        }

        impl $name {
            /// Looks up a value by its raw HAL representation.
            pub fn from_raw(raw: u32) -> Option<Self> {
                match raw {
                    $(x if x == $name::$variant as u32 => Some($name::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

hal_enum!(Algorithm {
    RSA = 1,
    EC = 3,
    AES = 32,
    TRIPLE_DES = 33,
    HMAC = 128,
});

hal_enum!(BlockMode {
    ECB = 1,
    CBC = 2,
    CTR = 3,
    GCM = 32,
});

hal_enum!(PaddingMode {
    NONE = 1,
    RSA_OAEP = 2,
    RSA_PSS = 3,
    RSA_PKCS1_1_5_ENCRYPT = 4,
    RSA_PKCS1_1_5_SIGN = 5,
    PKCS7 = 64,
});

hal_enum!(Digest {
    NONE = 0,
    MD5 = 1,
    SHA1 = 2,
    SHA_2_224 = 3,
    SHA_2_256 = 4,
    SHA_2_384 = 5,
    SHA_2_512 = 6,
});

hal_enum!(EcCurve {
    P_224 = 0,
    P_256 = 1,
    P_384 = 2,
    P_521 = 3,
});

hal_enum!(KeyOrigin {
    GENERATED = 0,
    DERIVED = 1,
    IMPORTED = 2,
    UNKNOWN = 3,
});

hal_enum!(KeyPurpose {
    ENCRYPT = 0,
    DECRYPT = 1,
    SIGN = 2,
    VERIFY = 3,
    WRAP_KEY = 5,
});

hal_enum!(KeyFormat {
    X509 = 0,
    PKCS8 = 1,
    RAW = 3,
});

hal_enum!(SecurityLevel {
    SOFTWARE = 0,
    TRUSTED_ENVIRONMENT = 1,
    STRONGBOX = 2,
});

/// Authenticator classes as a bit set. Tokens carry the raw bit mask; keys
/// name the accepted set in their USER_AUTH_TYPE authorization.
#[repr(u32)]
#[derive(PartialEq, Eq, Debug, Copy, Clone, Hash, PartialOrd, Ord)]
pub enum HardwareAuthenticatorType {
    NONE = 0,
    PASSWORD = 1,
    FINGERPRINT = 1 << 1,
    ANY = u32::MAX,
}

impl HardwareAuthenticatorType {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(HardwareAuthenticatorType::NONE),
            1 => Some(HardwareAuthenticatorType::PASSWORD),
            2 => Some(HardwareAuthenticatorType::FINGERPRINT),
            u32::MAX => Some(HardwareAuthenticatorType::ANY),
            _ => None,
        }
    }
}

/// The value side of a key parameter. The variant must agree with the tag's
/// type nibble.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyParameterValue {
    Invalid,
    Algorithm(Algorithm),
    BlockMode(BlockMode),
    PaddingMode(PaddingMode),
    Digest(Digest),
    EcCurve(EcCurve),
    Origin(KeyOrigin),
    KeyPurpose(KeyPurpose),
    HardwareAuthenticatorType(HardwareAuthenticatorType),
    BoolValue(bool),
    Integer(u32),
    LongInteger(u64),
    DateTime(u64),
    Blob(Vec<u8>),
}

/// A single tagged authorization or operation parameter.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyParameter {
    pub tag: Tag,
    pub value: KeyParameterValue,
}

impl KeyParameter {
    pub fn new(tag: Tag, value: KeyParameterValue) -> Self {
        Self { tag, value }
    }

    /// Convenience constructor for boolean tags, which carry an implicit
    /// `true`.
    pub fn bool(tag: Tag) -> Self {
        Self { tag, value: KeyParameterValue::BoolValue(true) }
    }
}

/// Returns true iff `params` contains at least one parameter with `tag`.
pub fn contains_tag(params: &[KeyParameter], tag: Tag) -> bool {
    params.iter().any(|p| p.tag == tag)
}

/// A key is authentication bound iff its authorization list lacks
/// NO_AUTH_REQUIRED.
pub fn is_authentication_bound(params: &[KeyParameter]) -> bool {
    !contains_tag(params, Tag::NO_AUTH_REQUIRED)
}

/// Returns the first value for `tag` in `params`, if any.
pub fn find_value<'a>(params: &'a [KeyParameter], tag: Tag) -> Option<&'a KeyParameterValue> {
    params.iter().find(|p| p.tag == tag).map(|p| &p.value)
}

/// The authorization list of a key as reported by the keymaster, split into
/// the hardware enforced and software enforced partitions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyCharacteristics {
    pub software_enforced: Vec<KeyParameter>,
    pub hardware_enforced: Vec<KeyParameter>,
}

impl KeyCharacteristics {
    /// Both partitions chained, hardware first.
    pub fn all(&self) -> impl Iterator<Item = &KeyParameter> {
        self.hardware_enforced.iter().chain(self.software_enforced.iter())
    }

    /// Both partitions as one owned list, hardware first.
    pub fn union(&self) -> Vec<KeyParameter> {
        self.all().cloned().collect()
    }

    /// The key's algorithm, preferring the hardware enforced list.
    pub fn algorithm(&self) -> Option<Algorithm> {
        self.all().find_map(|p| match p.value {
            KeyParameterValue::Algorithm(a) => Some(a),
            _ => None,
        })
    }
}

/// Set union over parameter lists: appends those elements of `other` that
/// are not already present in `params`, comparing whole (tag, value) pairs.
pub fn merge_union(params: &mut Vec<KeyParameter>, other: &[KeyParameter]) {
    for p in other {
        if !params.contains(p) {
            params.push(p.clone());
        }
    }
}

/// Set subtraction over parameter lists: removes every element of `params`
/// that appears in `other`.
pub fn subtract(params: &mut Vec<KeyParameter>, other: &[KeyParameter]) {
    params.retain(|p| !other.contains(p));
}
