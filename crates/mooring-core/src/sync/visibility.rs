//! Row-visibility boundary.
//!
//! Authorization lives outside the sync engine. The engine only asks a
//! [`VisibilityPolicy`] which rows of a given type a client may see, and the
//! answer is a closed [`Visibility`] predicate the entity store can express
//! in SQL.

use crate::models::{EntityKind, EntityRecord};

/// Which rows of one table a client may observe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Visibility {
    /// Every row, including other owners' tombstones
    Everyone,
    /// Only rows whose `owner_id` matches
    OwnedBy(String),
    /// No rows at all
    Nothing,
}

/// Supplies the visibility predicate for a (client, entity type) pair
pub trait VisibilityPolicy: Send + Sync {
    fn visibility(&self, client_id: &str, kind: EntityKind) -> Visibility;

    /// Whether the client may queue updates or deletes against `record`
    fn may_modify(&self, client_id: &str, record: &EntityRecord) -> bool {
        record.owner_id == client_id
    }
}

/// Default policy: listings are public, conversations and notifications
/// are private to their owner. Only owners modify rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct OwnerVisibility;

impl VisibilityPolicy for OwnerVisibility {
    fn visibility(&self, client_id: &str, kind: EntityKind) -> Visibility {
        match kind {
            EntityKind::Listing => Visibility::Everyone,
            EntityKind::Conversation | EntityKind::Notification => {
                Visibility::OwnedBy(client_id.to_string())
            }
        }
    }
}

/// Every client sees and may modify every row. Useful for trusted internal
/// callers.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublicVisibility;

impl VisibilityPolicy for PublicVisibility {
    fn visibility(&self, _client_id: &str, _kind: EntityKind) -> Visibility {
        Visibility::Everyone
    }

    fn may_modify(&self, _client_id: &str, _record: &EntityRecord) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_policy_keeps_private_types_private() {
        let policy = OwnerVisibility;
        assert_eq!(
            policy.visibility("client-a", EntityKind::Listing),
            Visibility::Everyone
        );
        assert_eq!(
            policy.visibility("client-a", EntityKind::Notification),
            Visibility::OwnedBy("client-a".to_string())
        );
    }
}
