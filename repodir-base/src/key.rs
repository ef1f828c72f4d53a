//! Owner identities.
//!
//! An owner is identified by a 32 byte key. The key travels in one of two textual encodings:
//! the raw form, 64 hex characters, and the self-describing bech32 form with the `npub`
//! human readable part. [`canonicalize`] accepts either and always yields the same [`OwnerId`],
//! which is the only value ever used for equality and for directory keys.

use std::{
    fmt::{self, Debug, Display},
    str::FromStr,
};

use bech32::{Bech32, Hrp};
use serde::{Deserialize, Serialize};

/// Human readable part of the encoded form.
const NPUB: Hrp = Hrp::parse_unchecked("npub");

/// URI scheme some clients prepend to the encoded form.
const URI_PREFIX: &str = "nostr:";

/// The canonical identity of a repository owner or contributor.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct OwnerId([u8; 32]);

impl OwnerId {
    /// The length of the raw key, in bytes.
    pub const LENGTH: usize = 32;

    /// Create from the raw key bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The raw encoding: lower-case hex.
    pub fn to_hex(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0)
    }

    /// The self-describing encoding (`npub1…`).
    pub fn to_npub(&self) -> String {
        bech32::encode::<Bech32>(NPUB, &self.0).expect("32 bytes fit into a bech32 string")
    }

    /// Format the first five bytes as hex, for logging.
    pub fn fmt_short(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0[..5])
    }
}

/// Map either encoding of an owner identity to its canonical [`OwnerId`].
///
/// Surrounding whitespace and a leading `nostr:` scheme are ignored. Hex input may use either
/// letter case.
pub fn canonicalize(identity: &str) -> Result<OwnerId, KeyParsingError> {
    let s = identity.trim();
    let s = s.strip_prefix(URI_PREFIX).unwrap_or(s);
    if s.len() == OwnerId::LENGTH * 2 {
        decode_hex(s)
    } else {
        decode_npub(s)
    }
}

fn decode_hex(s: &str) -> Result<OwnerId, KeyParsingError> {
    let mut bytes = [0u8; 32];
    match data_encoding::HEXLOWER_PERMISSIVE.decode_mut(s.as_bytes(), &mut bytes) {
        Ok(len) if len == OwnerId::LENGTH => Ok(OwnerId(bytes)),
        Ok(_) => Err(KeyParsingError::DecodeInvalidLength),
        Err(partial) => Err(partial.error.into()),
    }
}

fn decode_npub(s: &str) -> Result<OwnerId, KeyParsingError> {
    let (hrp, data) = bech32::decode(s)?;
    if hrp != NPUB {
        return Err(KeyParsingError::UnexpectedPrefix(hrp.to_string()));
    }
    let bytes: [u8; 32] = data
        .try_into()
        .map_err(|_| KeyParsingError::DecodeInvalidLength)?;
    Ok(OwnerId(bytes))
}

/// Error when an identity string does not decode to a well-formed raw key.
#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum KeyParsingError {
    /// The raw form was not valid hex.
    #[error(transparent)]
    Hex(#[from] data_encoding::DecodeError),
    /// The encoded form was not valid bech32.
    #[error(transparent)]
    Bech32(#[from] bech32::DecodeError),
    /// The encoded form wraps something other than a public key.
    #[error("unexpected human readable part {0:?}")]
    UnexpectedPrefix(String),
    /// The decoded key had the wrong length.
    #[error("invalid length")]
    DecodeInvalidLength,
}

impl FromStr for OwnerId {
    type Err = KeyParsingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        canonicalize(s)
    }
}

impl From<[u8; 32]> for OwnerId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for OwnerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Debug for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnerId({})", self.fmt_short())
    }
}

impl Serialize for OwnerId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for OwnerId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            canonicalize(&s).map_err(serde::de::Error::custom)
        } else {
            let bytes: [u8; 32] = Deserialize::deserialize(deserializer)?;
            Ok(Self(bytes))
        }
    }
}
