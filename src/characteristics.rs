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

//! Deterministic byte codec for authorization lists. The serialized form is
//! persisted as the characteristics sibling of every keymaster bound key
//! blob and read back when the keymaster blob itself is unavailable.
//!
//! Layout: one version byte, a little endian element count, then per
//! parameter the raw u32 tag followed by a value encoding selected by the
//! tag's type nibble. Parameters are sorted before writing so that equal
//! sets serialize identically.

use crate::error::{Error, ResponseCode};
use crate::key_parameter::{
    Algorithm, BlockMode, Digest, EcCurve, HardwareAuthenticatorType, KeyOrigin, KeyParameter,
    KeyParameterValue, KeyPurpose, PaddingMode, Tag, TagType,
};
use crate::ks_err;
use anyhow::{Context, Result};
use std::io::Read;

const VERSION: u8 = 1;

/// Errors specific to the characteristics codec.
#[derive(thiserror::Error, Debug, Eq, PartialEq)]
pub enum CodecError {
    /// The input stream did not have enough bytes to read.
    #[error("Input stream had insufficient bytes to read.")]
    BadLen,
    /// The input carried an unknown version byte.
    #[error("Unsupported characteristics version.")]
    BadVersion,
    /// A tag or enum value was not recognized.
    #[error("Unknown tag or enum value.")]
    BadValue,
}

fn read_u8(stream: &mut dyn Read) -> Result<u8> {
    let mut buffer = [0u8; 1];
    stream.read_exact(&mut buffer).map(|_| buffer[0]).context(ks_err!("In read_u8."))
}

fn read_le_u32(stream: &mut dyn Read) -> Result<u32> {
    const SIZE: usize = std::mem::size_of::<u32>();
    let mut buffer: [u8; SIZE] = [0; SIZE];
    stream.read_exact(&mut buffer).map(|_| u32::from_le_bytes(buffer)).context(ks_err!())
}

fn read_le_u64(stream: &mut dyn Read) -> Result<u64> {
    const SIZE: usize = std::mem::size_of::<u64>();
    let mut buffer: [u8; SIZE] = [0; SIZE];
    stream.read_exact(&mut buffer).map(|_| u64::from_le_bytes(buffer)).context(ks_err!())
}

fn encode_value(param: &KeyParameter, out: &mut Vec<u8>) {
    match &param.value {
        KeyParameterValue::Algorithm(v) => out.extend_from_slice(&(*v as u32).to_le_bytes()),
        KeyParameterValue::BlockMode(v) => out.extend_from_slice(&(*v as u32).to_le_bytes()),
        KeyParameterValue::PaddingMode(v) => out.extend_from_slice(&(*v as u32).to_le_bytes()),
        KeyParameterValue::Digest(v) => out.extend_from_slice(&(*v as u32).to_le_bytes()),
        KeyParameterValue::EcCurve(v) => out.extend_from_slice(&(*v as u32).to_le_bytes()),
        KeyParameterValue::Origin(v) => out.extend_from_slice(&(*v as u32).to_le_bytes()),
        KeyParameterValue::KeyPurpose(v) => out.extend_from_slice(&(*v as u32).to_le_bytes()),
        KeyParameterValue::HardwareAuthenticatorType(v) => {
            out.extend_from_slice(&(*v as u32).to_le_bytes())
        }
        KeyParameterValue::Integer(v) => out.extend_from_slice(&v.to_le_bytes()),
        KeyParameterValue::LongInteger(v) | KeyParameterValue::DateTime(v) => {
            out.extend_from_slice(&v.to_le_bytes())
        }
        KeyParameterValue::BoolValue(v) => out.push(*v as u8),
        KeyParameterValue::Blob(v) => {
            out.extend_from_slice(&(v.len() as u32).to_le_bytes());
            out.extend_from_slice(v);
        }
        KeyParameterValue::Invalid => {}
    }
}

/// Serializes an authorization list. Equal parameter sets produce identical
/// bytes regardless of input order.
pub fn serialize(params: &[KeyParameter]) -> Vec<u8> {
    let mut sorted: Vec<&KeyParameter> = params.iter().collect();
    sorted.sort();

    let mut out = Vec::new();
    out.push(VERSION);
    out.extend_from_slice(&(sorted.len() as u32).to_le_bytes());
    for param in sorted {
        out.extend_from_slice(&(param.tag as u32).to_le_bytes());
        encode_value(param, &mut out);
    }
    out
}

fn decode_enum(tag: Tag, raw: u32) -> Result<KeyParameterValue> {
    let value = match tag {
        Tag::ALGORITHM => Algorithm::from_raw(raw).map(KeyParameterValue::Algorithm),
        Tag::BLOCK_MODE => BlockMode::from_raw(raw).map(KeyParameterValue::BlockMode),
        Tag::PADDING => PaddingMode::from_raw(raw).map(KeyParameterValue::PaddingMode),
        Tag::DIGEST => Digest::from_raw(raw).map(KeyParameterValue::Digest),
        Tag::EC_CURVE => EcCurve::from_raw(raw).map(KeyParameterValue::EcCurve),
        Tag::ORIGIN => KeyOrigin::from_raw(raw).map(KeyParameterValue::Origin),
        Tag::PURPOSE => KeyPurpose::from_raw(raw).map(KeyParameterValue::KeyPurpose),
        Tag::USER_AUTH_TYPE => HardwareAuthenticatorType::from_raw(raw)
            .map(KeyParameterValue::HardwareAuthenticatorType),
        // Enum typed tags this service does not interpret.
        _ => Some(KeyParameterValue::Integer(raw)),
    };
    value
        .ok_or(Error::Rc(ResponseCode::ValueCorrupted))
        .context(ks_err!("Unknown enum value {} for tag {:?}.", raw, tag))
}

/// Deserializes an authorization list previously produced by `serialize`.
pub fn deserialize(data: &[u8]) -> Result<Vec<KeyParameter>> {
    let mut stream: &[u8] = data;
    let version = read_u8(&mut stream).context(ks_err!("Reading version."))?;
    if version != VERSION {
        return Err(CodecError::BadVersion.into());
    }
    let count = read_le_u32(&mut stream).context(ks_err!("Reading element count."))?;

    let mut params = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        let raw_tag = read_le_u32(&mut stream).context(ks_err!("Reading tag."))?;
        let tag = Tag::from_raw(raw_tag)
            .ok_or(CodecError::BadValue)
            .context(ks_err!("Unknown tag {:#x}.", raw_tag))?;
        let value = match tag.tag_type() {
            TagType::ENUM | TagType::ENUM_REP => {
                let raw = read_le_u32(&mut stream)?;
                decode_enum(tag, raw)?
            }
            TagType::UINT | TagType::UINT_REP => {
                KeyParameterValue::Integer(read_le_u32(&mut stream)?)
            }
            TagType::ULONG | TagType::ULONG_REP => {
                KeyParameterValue::LongInteger(read_le_u64(&mut stream)?)
            }
            TagType::DATE => KeyParameterValue::DateTime(read_le_u64(&mut stream)?),
            TagType::BOOL => KeyParameterValue::BoolValue(read_u8(&mut stream)? != 0),
            TagType::BIGNUM | TagType::BYTES => {
                let len = read_le_u32(&mut stream)? as usize;
                if stream.len() < len {
                    return Err(CodecError::BadLen).context(ks_err!("Blob length {}.", len));
                }
                let (blob, rest) = stream.split_at(len);
                stream = rest;
                KeyParameterValue::Blob(blob.to_vec())
            }
            TagType::INVALID => {
                return Err(CodecError::BadValue).context(ks_err!("Invalid tag type."))
            }
        };
        params.push(KeyParameter::new(tag, value));
    }
    Ok(params)
}
