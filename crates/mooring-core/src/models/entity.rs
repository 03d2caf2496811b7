//! Versioned entity model

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;

/// Position in the global write order shared by every syncable entity type.
///
/// Issued only by the version authority. Zero means "never written" and is
/// the implicit checkpoint of a client that has not synced yet.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct VersionStamp(i64);

impl VersionStamp {
    pub const ZERO: Self = Self(0);

    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for VersionStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-row compare-and-swap counter. Unrelated to [`VersionStamp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockVersion(i64);

impl LockVersion {
    /// Lock version of a freshly inserted row
    pub const INITIAL: Self = Self(1);

    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> i64 {
        self.0
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for LockVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The closed set of syncable entity types.
///
/// Each variant maps to exactly one table; runtime strings are parsed into
/// this enum once, at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    #[serde(rename = "listings")]
    Listing,
    #[serde(rename = "conversations")]
    Conversation,
    #[serde(rename = "notifications")]
    Notification,
}

impl EntityKind {
    pub const ALL: [Self; 3] = [Self::Listing, Self::Conversation, Self::Notification];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Listing => "listings",
            Self::Conversation => "conversations",
            Self::Notification => "notifications",
        }
    }

    /// Backing table name
    pub const fn table(self) -> &'static str {
        match self {
            Self::Listing => "listings",
            Self::Conversation => "conversations",
            Self::Notification => "notifications",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "listings" | "listing" => Ok(Self::Listing),
            "conversations" | "conversation" => Ok(Self::Conversation),
            "notifications" | "notification" => Ok(Self::Notification),
            _ => Err(Error::UnsupportedEntity(s.to_string())),
        }
    }
}

const MAX_ENTITY_ID_LEN: usize = 128;

/// Entity identifier. Server-generated ids are UUID v7; offline clients may
/// bring their own opaque ids for creates.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Generate a new time-sortable id
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EntityId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidInput("entity id must not be empty".into()));
        }
        if trimmed.len() > MAX_ENTITY_ID_LEN {
            return Err(Error::InvalidInput(format!(
                "entity id must be at most {MAX_ENTITY_ID_LEN} bytes"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }
}

/// Keys the store owns; stripped from any client payload before storage.
pub const RESERVED_FIELDS: [&str; 7] = [
    "id",
    "owner_id",
    "created_at",
    "modified_at",
    "version_stamp",
    "lock_version",
    "is_deleted",
];

/// Validate a client payload and drop store-owned keys.
pub fn sanitize_fields(payload: &Value) -> crate::Result<Map<String, Value>> {
    let Value::Object(fields) = payload else {
        return Err(Error::InvalidInput(
            "entity payload must be a JSON object".into(),
        ));
    };
    Ok(fields
        .iter()
        .filter(|(key, _)| !RESERVED_FIELDS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect())
}

/// Shallow-merge `changes` into `base`; a `null` change removes the key.
pub fn merge_fields(base: &mut Map<String, Value>, changes: Map<String, Value>) {
    for (key, value) in changes {
        if value.is_null() {
            base.remove(&key);
        } else {
            base.insert(key, value);
        }
    }
}

/// A row of any syncable table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRecord {
    pub id: EntityId,
    pub kind: EntityKind,
    /// Identity of the creating client; consumed by visibility rules
    pub owner_id: String,
    /// Domain fields
    pub data: Map<String, Value>,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Last server-side write (Unix ms)
    pub modified_at: i64,
    pub version_stamp: VersionStamp,
    pub lock_version: LockVersion,
    /// Tombstone marker
    pub is_deleted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entity_kind_parses_plural_and_singular() {
        assert_eq!("listings".parse::<EntityKind>().unwrap(), EntityKind::Listing);
        assert_eq!(
            "Conversation".parse::<EntityKind>().unwrap(),
            EntityKind::Conversation
        );
        let err = "widgets".parse::<EntityKind>().unwrap_err();
        assert!(matches!(err, Error::UnsupportedEntity(name) if name == "widgets"));
    }

    #[test]
    fn entity_kind_serializes_as_table_name() {
        assert_eq!(
            serde_json::to_string(&EntityKind::Notification).unwrap(),
            "\"notifications\""
        );
        for kind in EntityKind::ALL {
            assert_eq!(kind.as_str(), kind.table());
        }
    }

    #[test]
    fn entity_id_rejects_blank_and_oversized() {
        assert!("   ".parse::<EntityId>().is_err());
        assert!("x".repeat(200).parse::<EntityId>().is_err());
        assert_eq!(" abc ".parse::<EntityId>().unwrap().as_str(), "abc");
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(EntityId::generate(), EntityId::generate());
    }

    #[test]
    fn sanitize_strips_store_owned_fields() {
        let fields = sanitize_fields(&json!({
            "title": "Bike",
            "version_stamp": 999_999,
            "lock_version": 7,
            "modified_at": 1,
        }))
        .unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields["title"], json!("Bike"));
    }

    #[test]
    fn sanitize_rejects_non_objects() {
        assert!(sanitize_fields(&json!([1, 2])).is_err());
        assert!(sanitize_fields(&Value::Null).is_err());
    }

    #[test]
    fn merge_overwrites_and_removes() {
        let mut base = sanitize_fields(&json!({"title": "Bike", "price": 10})).unwrap();
        let changes = sanitize_fields(&json!({"price": 12, "title": null, "color": "red"})).unwrap();
        merge_fields(&mut base, changes);
        assert_eq!(Value::Object(base), json!({"price": 12, "color": "red"}));
    }

    #[test]
    fn lock_version_next_increments() {
        assert_eq!(LockVersion::INITIAL.next(), LockVersion::new(2));
    }
}
