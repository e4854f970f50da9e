//! Stable identifiers for synchronized assets.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::borrow::Cow;
use std::fmt;
use uuid::Uuid;

/// Identifier of a user, device, group or computer.
///
/// Directory sources use either UUIDs (graph and device-management APIs) or
/// opaque strings (distinguished names, REST ids). A string that parses as a
/// UUID is always held in UUID form, so the JSON string form round-trips to
/// the same value and the same store key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetId(Repr);

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum Repr {
    Uuid(Uuid),
    Name(String),
}

impl AssetId {
    /// Create an identifier from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        match Uuid::parse_str(&id) {
            Ok(uuid) => Self(Repr::Uuid(uuid)),
            Err(_) => Self(Repr::Name(id)),
        }
    }

    /// The UUID, if this identifier is UUID-typed.
    pub fn as_uuid(&self) -> Option<&Uuid> {
        match &self.0 {
            Repr::Uuid(u) => Some(u),
            Repr::Name(_) => None,
        }
    }

    /// Bytes used as the store key.
    ///
    /// UUIDs use their raw 16-byte form, names their UTF-8 bytes.
    pub fn key_bytes(&self) -> Cow<'_, [u8]> {
        match &self.0 {
            Repr::Uuid(u) => Cow::Owned(u.as_bytes().to_vec()),
            Repr::Name(n) => Cow::Borrowed(n.as_bytes()),
        }
    }
}

impl Default for AssetId {
    fn default() -> Self {
        Self(Repr::Name(String::new()))
    }
}

impl From<Uuid> for AssetId {
    fn from(uuid: Uuid) -> Self {
        Self(Repr::Uuid(uuid))
    }
}

impl From<&str> for AssetId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for AssetId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Repr::Uuid(u) => write!(f, "{}", u.hyphenated()),
            Repr::Name(n) => f.write_str(n),
        }
    }
}

impl fmt::Debug for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AssetId({})", self)
    }
}

impl Serialize for AssetId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AssetId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IdVisitor;

        impl Visitor<'_> for IdVisitor {
            type Value = AssetId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an asset identifier string")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<AssetId, E> {
                Ok(AssetId::new(v))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<AssetId, E> {
                Ok(AssetId::new(v))
            }
        }

        deserializer.deserialize_str(IdVisitor)
    }
}
