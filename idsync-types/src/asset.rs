//! Identity assets and their synchronization state.

use crate::collections::Set;
use crate::error::IdError;
use crate::ids::AssetId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Provider-specific attributes, keyed by attribute name.
pub type Attributes = Map<String, Value>;

/// The kind of identity asset.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    /// A user account.
    #[default]
    User,
    /// A managed device.
    Device,
    /// A group.
    Group,
    /// A managed computer (device-management inventory).
    Computer,
}

impl AssetKind {
    /// Every kind, in persistence order.
    pub const ALL: [AssetKind; 4] = [Self::User, Self::Device, Self::Group, Self::Computer];

    /// Name of the store bucket holding assets of this kind.
    pub fn bucket(self) -> &'static str {
        match self {
            Self::User => "users",
            Self::Device => "devices",
            Self::Group => "groups",
            Self::Computer => "computers",
        }
    }

    /// Singular name, used for event actions and id fields.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Device => "device",
            Self::Group => "group",
            Self::Computer => "computer",
        }
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetKind {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" | "users" => Ok(Self::User),
            "device" | "devices" => Ok(Self::Device),
            "group" | "groups" => Ok(Self::Group),
            "computer" | "computers" => Ok(Self::Computer),
            other => Err(IdError::UnknownKind(other.to_string())),
        }
    }
}

/// Change classification of an asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    /// Seen for the first time.
    Discovered,
    /// Attributes or memberships differ from the persisted copy.
    Modified,
    /// Removed at the source. Terminal.
    Deleted,
}

impl State {
    /// Suffix used in `event.action`.
    pub fn action_suffix(self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
        }
    }
}

/// A synchronized identity record as persisted in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    /// Stable identifier.
    pub id: AssetId,
    /// What this asset is.
    pub kind: AssetKind,
    /// Provider attributes.
    #[serde(default)]
    pub attributes: Attributes,
    /// Groups this asset directly belongs to.
    #[serde(default)]
    pub member_of: Set<AssetId>,
    /// Groups reachable through the relationship graph, direct ones included.
    #[serde(default)]
    pub transitive_member_of: Set<AssetId>,
    /// Change classification.
    pub state: State,
    /// When the source last changed this asset, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when_changed: Option<DateTime<Utc>>,
}

impl Asset {
    /// Build a freshly discovered asset from a fetched record.
    pub fn discovered(fetched: FetchedAsset) -> Self {
        let mut member_of = fetched.member_of;
        member_of.subtract(&fetched.member_of_removed);
        Self {
            id: fetched.id,
            kind: fetched.kind,
            attributes: fetched.attributes,
            transitive_member_of: member_of.clone(),
            member_of,
            state: State::Discovered,
            when_changed: fetched.when_changed,
        }
    }

    /// True if the asset has been deleted at the source.
    pub fn is_deleted(&self) -> bool {
        self.state == State::Deleted
    }

    /// The `event.action` value for this asset, e.g. `user-modified`.
    pub fn action(&self) -> String {
        format!("{}-{}", self.kind.as_str(), self.state.action_suffix())
    }
}

/// A record as returned by a provider fetch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchedAsset {
    /// Stable identifier.
    pub id: AssetId,
    /// What this record is.
    pub kind: AssetKind,
    /// Attributes reported by the source. Keys absent here keep their
    /// persisted values.
    #[serde(default)]
    pub attributes: Attributes,
    /// Direct group memberships reported by the source.
    #[serde(default)]
    pub member_of: Set<AssetId>,
    /// Memberships the source explicitly reports as removed.
    #[serde(default)]
    pub member_of_removed: Set<AssetId>,
    /// The source reports this record as removed.
    #[serde(default)]
    pub deleted: bool,
    /// Source change timestamp, if the source provides one.
    #[serde(default)]
    pub when_changed: Option<DateTime<Utc>>,
}

impl FetchedAsset {
    /// Create a live record with no attributes.
    pub fn new(kind: AssetKind, id: impl Into<AssetId>) -> Self {
        Self {
            id: id.into(),
            kind,
            ..Default::default()
        }
    }

    /// Set an attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Add a direct group membership.
    pub fn with_member_of(mut self, group: impl Into<AssetId>) -> Self {
        self.member_of.add(group.into());
        self
    }

    /// Mark the record as removed at the source.
    pub fn deleted(mut self) -> Self {
        self.deleted = true;
        self
    }
}
