//! Entity contract and audit metadata.
//!
//! Every persisted type embeds an [`EntityMeta`] (flattened into its serialized
//! form) and implements [`Entity`]. The repository stamps the audit fields from
//! the ambient [`crate::context`] on every write; callers never fill them by hand.
//!
//! ```rust,ignore
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! pub struct Label {
//!     #[serde(flatten)]
//!     pub meta: EntityMeta,
//!     pub name: String,
//! }
//!
//! impl Entity for Label {
//!     const NAME: &'static str = "Label";
//!     const COLLECTION: &'static str = "label";
//!
//!     fn meta(&self) -> &EntityMeta { &self.meta }
//!     fn meta_mut(&mut self) -> &mut EntityMeta { &mut self.meta }
//! }
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context;
use crate::errors::{StoreError, StoreResult};
use crate::types::{unix_now, EntityId, TenantId, Timestamp, UserId};

/// Stored field names shared by every entity.
pub mod fields {
    /// Identifier
    pub const ID: &str = "id";
    /// Owning tenant
    pub const TENANT_ID: &str = "tenant_id";
    /// Insert time, unix seconds
    pub const CREATED_AT: &str = "created_at";
    /// Last mutation time, unix seconds
    pub const UPDATED_AT: &str = "updated_at";
    /// Inserting user
    pub const CREATED_BY: &str = "created_by";
    /// Last mutating user
    pub const UPDATED_BY: &str = "updated_by";
    /// Soft-delete marker; null while active
    pub const DELETED_AT: &str = "deleted_at";
    /// Soft-deleting user
    pub const DELETED_BY: &str = "deleted_by";

    /// All audit fields, in column order.
    pub const ALL: [&str; 8] = [
        ID, TENANT_ID, CREATED_AT, UPDATED_AT, CREATED_BY, UPDATED_BY, DELETED_AT, DELETED_BY,
    ];

    /// Returns true for the shared audit fields.
    pub fn is_audit_field(name: &str) -> bool {
        ALL.contains(&name)
    }
}

/// A backend-agnostic stored document: the entity serialized to a JSON object.
pub type Document = serde_json::Map<String, Value>;

/// Identity and audit fields carried by every entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMeta {
    /// Identifier; assigned by the backend on first save when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<EntityId>,
    /// Owning tenant; `0` for entities that are not tenant scoped.
    #[serde(default)]
    pub tenant_id: TenantId,
    /// Insert time in unix seconds.
    #[serde(default)]
    pub created_at: i64,
    /// Last mutation time in unix seconds.
    #[serde(default)]
    pub updated_at: i64,
    /// Inserting user.
    #[serde(default)]
    pub created_by: UserId,
    /// Last mutating user.
    #[serde(default)]
    pub updated_by: UserId,
    /// Soft-delete marker; `None` while the entity is active.
    #[serde(default)]
    pub deleted_at: Option<Timestamp>,
    /// Soft-deleting user.
    #[serde(default)]
    pub deleted_by: UserId,
}

impl EntityMeta {
    /// Metadata for a not-yet-persisted entity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata with a caller-chosen identifier.
    pub fn with_id(id: impl Into<EntityId>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Returns true while the soft-delete marker is unset.
    pub const fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// Stamps audit fields before a save.
    ///
    /// Inserts (no id yet, or never stamped) get `created_at`, `created_by` and,
    /// for tenant-scoped entities, `tenant_id`, each only when the caller left it
    /// unset. Every save refreshes `updated_at` and, when a user is acting,
    /// `updated_by`.
    pub fn stamp_for_save(&mut self, tenant_scoped: bool) {
        let now = unix_now();
        let user = context::current_user();
        let inserting = self.id.is_none() || self.created_at == 0;

        if inserting {
            if self.created_at == 0 {
                self.created_at = now;
            }
            if let Some(user) = &user {
                if self.created_by.is_system() {
                    self.created_by = user.user_id;
                }
                if tenant_scoped && self.tenant_id.is_unassigned() {
                    self.tenant_id = user.tenant_id;
                }
            }
        }

        self.updated_at = now.max(self.created_at);
        if let Some(user) = user.filter(|user| !user.user_id.is_system()) {
            self.updated_by = user.user_id;
        }
    }
}

/// A persisted type managed by an [`crate::repository::EntityRepository`].
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Name used in logs and metrics ("Label").
    const NAME: &'static str;
    /// Table or collection holding the entity.
    const COLLECTION: &'static str;
    /// Whether inserts inherit the acting user's tenant.
    const TENANT_SCOPED: bool = true;

    /// Identity and audit fields.
    fn meta(&self) -> &EntityMeta;

    /// Mutable identity and audit fields.
    fn meta_mut(&mut self) -> &mut EntityMeta;

    /// Identifier, once assigned.
    fn id(&self) -> Option<&EntityId> {
        self.meta().id.as_ref()
    }
}

/// Serializes an entity into its stored document form.
pub fn to_document<E: Entity>(entity: &E) -> StoreResult<Document> {
    match serde_json::to_value(entity) {
        Ok(Value::Object(document)) => Ok(document),
        Ok(other) => Err(StoreError::Serialization {
            entity: E::NAME,
            detail: format!("expected a JSON object, got {other}"),
        }),
        Err(error) => Err(StoreError::Serialization {
            entity: E::NAME,
            detail: error.to_string(),
        }),
    }
}

/// Rebuilds an entity from a stored document.
pub fn from_document<E: Entity>(document: Document) -> StoreResult<E> {
    serde_json::from_value(Value::Object(document)).map_err(|error| StoreError::Deserialization {
        entity: E::NAME,
        detail: error.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{run, CurrentUser, ExecutionContext};
    use crate::types::RequestId;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Note {
        #[serde(flatten)]
        meta: EntityMeta,
        title: String,
    }

    impl Entity for Note {
        const NAME: &'static str = "Note";
        const COLLECTION: &'static str = "note";

        fn meta(&self) -> &EntityMeta {
            &self.meta
        }

        fn meta_mut(&mut self) -> &mut EntityMeta {
            &mut self.meta
        }
    }

    fn as_user(user_id: i64, tenant_id: i64) -> ExecutionContext {
        ExecutionContext::new(
            RequestId::try_new("entity-test").unwrap(),
            Some(CurrentUser::new(user_id, tenant_id)),
        )
    }

    #[tokio::test]
    async fn insert_stamps_creator_and_tenant_from_context() {
        let mut meta = EntityMeta::new();
        run(as_user(8, 3), async { meta.stamp_for_save(true) }).await;

        assert!(meta.created_at > 0);
        assert!(meta.created_at <= meta.updated_at);
        assert_eq!(meta.created_by, UserId::new(8));
        assert_eq!(meta.updated_by, UserId::new(8));
        assert_eq!(meta.tenant_id, TenantId::new(3));
        assert!(meta.is_active());
    }

    #[tokio::test]
    async fn caller_populated_fields_are_kept() {
        let mut meta = EntityMeta {
            tenant_id: TenantId::new(99),
            created_at: 1_000,
            ..EntityMeta::new()
        };
        run(as_user(8, 3), async { meta.stamp_for_save(true) }).await;

        assert_eq!(meta.tenant_id, TenantId::new(99));
        assert_eq!(meta.created_at, 1_000);
    }

    #[tokio::test]
    async fn later_saves_only_refresh_update_fields() {
        let mut meta = EntityMeta::with_id(5);
        run(as_user(1, 1), async { meta.stamp_for_save(true) }).await;
        let created_at = meta.created_at;

        run(as_user(2, 2), async { meta.stamp_for_save(true) }).await;

        assert_eq!(meta.created_by, UserId::new(1));
        assert_eq!(meta.tenant_id, TenantId::new(1));
        assert_eq!(meta.created_at, created_at);
        assert_eq!(meta.updated_by, UserId::new(2));
    }

    #[tokio::test]
    async fn unscoped_entities_ignore_the_tenant() {
        let mut meta = EntityMeta::new();
        run(as_user(4, 6), async { meta.stamp_for_save(false) }).await;
        assert_eq!(meta.tenant_id, TenantId::UNASSIGNED);
    }

    #[test]
    fn stamping_outside_a_request_records_the_system_user() {
        let mut meta = EntityMeta::new();
        meta.stamp_for_save(true);

        assert_eq!(meta.created_by, UserId::SYSTEM);
        assert_eq!(meta.tenant_id, TenantId::UNASSIGNED);
        assert!(meta.created_at > 0);
    }

    #[test]
    fn documents_flatten_meta_beside_fields() {
        let note = Note {
            meta: EntityMeta::with_id(7),
            title: "hello".to_string(),
        };

        let document = to_document(&note).unwrap();
        assert_eq!(document["id"], 7);
        assert_eq!(document["title"], "hello");
        assert!(document["deleted_at"].is_null());

        let back: Note = from_document(document).unwrap();
        assert_eq!(back.meta, note.meta);
        assert_eq!(back.title, "hello");
    }

    #[test]
    fn malformed_documents_report_the_entity() {
        let mut document = Document::new();
        document.insert("title".to_string(), Value::from(12));

        let error = from_document::<Note>(document).unwrap_err();
        assert!(matches!(error, StoreError::Deserialization { entity: "Note", .. }));
    }
}
