//! The 256-bit identifier used throughout.

use std::fmt;
use std::str::FromStr;

use serde::{
    de,
    ser::SerializeTuple,
    Deserialize, Deserializer, Serialize, Serializer,
};

/// Length of the textual form: 32 bytes as base64url without padding.
pub const UID_TEXT_LEN: usize = 43;

/// A 256-bit identifier.
///
/// Uids name collections, items, revisions, invitations and chunks. Chunk
/// uids are content-derived on the client; the server only relies on them
/// being unique and stable. The textual form is 43 characters of unpadded
/// base64url (alphabet `[A-Za-z0-9\-_]`).
#[derive(PartialEq, Eq, Copy, Clone, Hash, PartialOrd, Ord)]
pub struct Uid([u8; 32]);

impl Uid {
    /// Create a `Uid` from its raw bytes representation.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Bytes of the uid.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uid({self})")
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // result will be 43 bytes
        let mut res = [0u8; UID_TEXT_LEN];
        data_encoding::BASE64URL_NOPAD.encode_mut(&self.0, &mut res);
        // convert to str, this is guaranteed to succeed
        let t = std::str::from_utf8(res.as_ref()).unwrap();
        // write the str, no allocations
        f.write_str(t)
    }
}

impl AsRef<[u8]> for Uid {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 32]> for Uid {
    fn from(value: [u8; 32]) -> Self {
        Uid(value)
    }
}

impl From<Uid> for [u8; 32] {
    fn from(value: Uid) -> Self {
        value.0
    }
}

/// Parse failure for the textual uid form.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvalidUid {
    /// The input is not exactly [`UID_TEXT_LEN`] characters.
    #[error("expected {UID_TEXT_LEN} characters, got {0}")]
    Length(usize),
    /// The input is not valid unpadded base64url.
    #[error("not valid base64url")]
    Encoding,
}

impl FromStr for Uid {
    type Err = InvalidUid;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let sb = s.as_bytes();
        if sb.len() != UID_TEXT_LEN {
            return Err(InvalidUid::Length(sb.len()));
        }
        let mut res = [0u8; 32];
        data_encoding::BASE64URL_NOPAD
            .decode_mut(sb, &mut res)
            .map_err(|_| InvalidUid::Encoding)?;
        Ok(Self(res))
    }
}

impl Serialize for Uid {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(self.to_string().as_str())
        } else {
            // Fixed-length structures, including arrays, are supported in Serde as tuples
            // See: https://serde.rs/impl-serialize.html#serializing-a-tuple
            let mut s = serializer.serialize_tuple(32)?;
            for item in &self.0 {
                s.serialize_element(item)?;
            }
            s.end()
        }
    }
}

impl<'de> Deserialize<'de> for Uid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(de::Error::custom)
        } else {
            deserializer.deserialize_tuple(32, BytesVisitor)
        }
    }
}

struct BytesVisitor;

impl<'de> de::Visitor<'de> for BytesVisitor {
    type Value = Uid;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "a tuple of 32 bytes")
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: de::SeqAccess<'de>,
    {
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = seq
                .next_element()?
                .ok_or_else(|| de::Error::invalid_length(i, &self))?;
        }
        Ok(Uid::from_bytes(bytes))
    }
}
