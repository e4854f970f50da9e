//! Events handed to the downstream pipeline.

use crate::asset::Asset;
use crate::error::IdError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// Which end of a full synchronization batch a marker delimits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    /// Published before any asset of the batch.
    Started,
    /// Published after every asset of the batch.
    Completed,
}

/// A single event: a timestamp plus nested fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    /// Event time.
    #[serde(rename = "@timestamp")]
    pub timestamp: DateTime<Utc>,
    /// Event fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Event {
    /// Create an empty event at `timestamp`.
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            fields: Map::new(),
        }
    }

    /// Build a batch marker.
    pub fn marker(marker: Marker, input_id: &str, at: DateTime<Utc>) -> Self {
        let mut event = Self::new(at);
        event.set("labels.identity_source", input_id);
        match marker {
            Marker::Started => {
                event.set("event.action", "started");
                event.set("event.start", at.to_rfc3339());
            }
            Marker::Completed => {
                event.set("event.action", "completed");
                event.set("event.end", at.to_rfc3339());
            }
        }
        event
    }

    /// Build the event for one asset.
    ///
    /// Provider attributes are placed under `namespace`.
    pub fn asset(namespace: &str, input_id: &str, asset: &Asset, at: DateTime<Utc>) -> Self {
        let kind = asset.kind.as_str();
        let mut event = Self::new(at);
        event.set(namespace, Value::Object(asset.attributes.clone()));
        event.set("labels.identity_source", input_id);
        event.set(&format!("{kind}.id"), asset.id.to_string());
        if !asset.member_of.is_empty() {
            let direct: Vec<String> = asset.member_of.iter().map(ToString::to_string).collect();
            event.set(&format!("{kind}.member_of"), direct);
        }
        if !asset.transitive_member_of.is_empty() {
            let all: Vec<String> = asset
                .transitive_member_of
                .iter()
                .map(ToString::to_string)
                .collect();
            event.set(&format!("{kind}.transitive_member_of"), all);
        }
        event.set("event.action", asset.action());
        event
    }

    /// Put `value` at a dotted `path`, creating intermediate objects.
    ///
    /// Non-object values found along the path are replaced.
    pub fn put(&mut self, path: &str, value: impl Into<Value>) -> Result<(), IdError> {
        if !Self::is_field_path(path) {
            return Err(IdError::InvalidFieldPath(path.to_string()));
        }
        let mut parts: Vec<&str> = path.split('.').collect();
        let leaf = parts.pop().unwrap_or(path);
        let mut node = &mut self.fields;
        for part in parts {
            let entry = node
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            node = match entry {
                Value::Object(map) => map,
                _ => unreachable!("entry was just made an object"),
            };
        }
        node.insert(leaf.to_string(), value.into());
        Ok(())
    }

    /// True if `path` is a dotted path with no empty segments.
    pub fn is_field_path(path: &str) -> bool {
        !path.is_empty() && !path.split('.').any(str::is_empty)
    }

    /// Look up a value by dotted path.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut value = self.fields.get(first)?;
        for part in parts {
            value = value.as_object()?.get(part)?;
        }
        Some(value)
    }

    // Paths used by the builders are static and well-formed.
    fn set(&mut self, path: &str, value: impl Into<Value>) {
        let result = self.put(path, value);
        debug_assert!(result.is_ok(), "malformed field path {path:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::{AssetKind, FetchedAsset, State};

    #[test]
    fn put_builds_nested_objects() {
        let mut event = Event::new(Utc::now());
        event.put("event.action", "started").unwrap();
        event.put("event.kind", "asset").unwrap();
        event.put("labels.identity_source", "ea-1").unwrap();

        assert_eq!(event.get("event.action").unwrap(), "started");
        assert_eq!(event.fields["event"]["kind"], "asset");
        assert_eq!(event.get("labels.identity_source").unwrap(), "ea-1");
    }

    #[test]
    fn put_replaces_scalars_on_path() {
        let mut event = Event::new(Utc::now());
        event.put("user", "flat").unwrap();
        event.put("user.id", "u1").unwrap();
        assert_eq!(event.get("user.id").unwrap(), "u1");
    }

    #[test]
    fn put_rejects_empty_segments() {
        let mut event = Event::new(Utc::now());
        assert!(event.put("", 1).is_err());
        assert!(event.put("a..b", 1).is_err());
        assert!(event.put("a.", 1).is_err());
    }

    #[test]
    fn marker_fields() {
        let at = Utc::now();
        let start = Event::marker(Marker::Started, "ea-1", at);
        assert_eq!(start.get("event.action").unwrap(), "started");
        assert!(start.get("event.start").is_some());
        assert!(start.get("event.end").is_none());

        let end = Event::marker(Marker::Completed, "ea-1", at);
        assert_eq!(end.get("event.action").unwrap(), "completed");
        assert!(end.get("event.end").is_some());
    }

    #[test]
    fn asset_fields() {
        let mut asset = Asset::discovered(
            FetchedAsset::new(AssetKind::User, "u1")
                .with_attribute("name", "A")
                .with_member_of("g1"),
        );
        asset.state = State::Modified;

        let event = Event::asset("fixture", "ea-1", &asset, Utc::now());
        assert_eq!(event.get("fixture.name").unwrap(), "A");
        assert_eq!(event.get("user.id").unwrap(), "u1");
        assert_eq!(event.get("user.member_of").unwrap()[0], "g1");
        assert_eq!(event.get("event.action").unwrap(), "user-modified");
        assert_eq!(event.get("labels.identity_source").unwrap(), "ea-1");
    }

    #[test]
    fn asset_attributes_nest_under_dotted_namespace() {
        let asset = Asset::discovered(
            FetchedAsset::new(AssetKind::Device, "d1").with_attribute("os", "linux"),
        );
        let event = Event::asset("okta.raw", "ea-1", &asset, Utc::now());
        assert_eq!(event.get("okta.raw.os").unwrap(), "linux");
        assert_eq!(event.get("device.id").unwrap(), "d1");
    }

    #[test]
    fn field_path_shape() {
        assert!(Event::is_field_path("user"));
        assert!(Event::is_field_path("okta.raw"));
        assert!(!Event::is_field_path(""));
        assert!(!Event::is_field_path(".user"));
        assert!(!Event::is_field_path("user."));
    }

    #[test]
    fn serializes_flat_with_timestamp() {
        let event = Event::marker(Marker::Started, "ea-1", Utc::now());
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("@timestamp").is_some());
        assert_eq!(json["event"]["action"], "started");
    }
}
