//! Soft-delete aware entity repositories.
//!
//! [`EntityRepository`] is the uniform data-access contract every entity type
//! gets, whichever store backs it. The soft-delete rules live here exactly once,
//! in [`Repository`]; stores only plug in through two narrow seams:
//!
//! - [`StoreBackend`] opens a [`QueryHandle`] per collection, builds the id
//!   criterion and applies field patches.
//! - [`QueryHandle`] runs the primitive save/find/count/delete calls.
//!
//! # Visibility rules
//!
//! | read family           | rows returned                  |
//! |-----------------------|--------------------------------|
//! | plain (`find_*`, `count`) | `deleted_at` unset        |
//! | `*_with_deleted`      | all rows                       |
//! | `*_deleted`           | `deleted_at` set               |
//!
//! The `deleted_at` condition is conjoined with the caller's filter; callers
//! never write it themselves.

use std::fmt;
use std::marker::PhantomData;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::context;
use crate::criteria::{Filter, FindOptions, Patch};
use crate::entity::{fields, from_document, to_document, Document, Entity};
use crate::errors::{StoreError, StoreResult};
use crate::transaction::TransactionalBackend;
use crate::types::{unix_now, CollectionName, EntityId, Timestamp};

/// Family of store behind a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Relational database (`PostgreSQL`)
    Relational,
    /// Document database (`MongoDB`)
    Document,
    /// Process-local store used in tests and development
    InMemory,
}

impl BackendKind {
    /// Short name used in logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Relational => "relational",
            Self::Document => "document",
            Self::InMemory => "memory",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Primitive operations on one table or collection.
#[async_trait]
pub trait QueryHandle: Send + Sync {
    /// Upserts documents by id, assigning native ids to documents without one.
    /// Returns the documents as stored.
    async fn save(&self, documents: Vec<Document>) -> StoreResult<Vec<Document>>;

    /// Returns the documents matching `options`.
    async fn find(&self, options: &FindOptions) -> StoreResult<Vec<Document>>;

    /// Counts the documents matching `filter`.
    async fn count(&self, filter: &Filter) -> StoreResult<u64>;

    /// Physically removes the documents matching `filter`, returning how many.
    async fn delete(&self, filter: &Filter) -> StoreResult<u64>;
}

/// A store that can back [`Repository`].
#[async_trait]
pub trait StoreBackend: Clone + Send + Sync + 'static {
    /// Handle type returned by [`StoreBackend::query_handle`].
    type Handle: QueryHandle;

    /// Family of this store.
    fn kind(&self) -> BackendKind;

    /// Opens a live handle on `collection`.
    fn query_handle(&self, collection: &CollectionName) -> Self::Handle;

    /// Builds the criterion selecting the entity with `id`.
    ///
    /// Document stores interpret string ids as object ids here.
    fn id_criterion(&self, id: &EntityId) -> Filter {
        Filter::eq(fields::ID, id)
    }

    /// Applies `patch` to every document matching `filter`, returning how many
    /// documents matched. Documents already holding the patched values still
    /// count.
    async fn apply_update(
        &self,
        collection: &CollectionName,
        filter: &Filter,
        patch: &Patch,
    ) -> StoreResult<u64>;
}

/// Uniform data-access contract for one entity type.
#[async_trait]
pub trait EntityRepository<E: Entity>: Send + Sync {
    /// Backend family, reported in metrics.
    fn backend_kind(&self) -> BackendKind;

    /// Inserts or replaces one entity, stamping its audit fields. Returns the
    /// entity as stored, with its id assigned.
    async fn save(&self, entity: E) -> StoreResult<E>;

    /// Inserts or replaces several entities.
    async fn save_many(&self, entities: Vec<E>) -> StoreResult<Vec<E>>;

    /// Active entity with `id`.
    async fn find_by_id(&self, id: &EntityId) -> StoreResult<Option<E>>;

    /// First active entity matching `options`.
    async fn find_one(&self, options: FindOptions) -> StoreResult<Option<E>>;

    /// Active entities matching `options`.
    async fn find_all(&self, options: FindOptions) -> StoreResult<Vec<E>>;

    /// Active entities matching `options`, plus the total count of matches
    /// ignoring paging.
    async fn find_and_count(&self, options: FindOptions) -> StoreResult<(Vec<E>, u64)>;

    /// Number of active entities matching `filter`.
    async fn count(&self, filter: Filter) -> StoreResult<u64>;

    /// Entity with `id`, deleted or not.
    async fn find_by_id_with_deleted(&self, id: &EntityId) -> StoreResult<Option<E>>;

    /// First entity matching `options`, deleted or not.
    async fn find_one_with_deleted(&self, options: FindOptions) -> StoreResult<Option<E>>;

    /// Entities matching `options`, deleted or not.
    async fn find_all_with_deleted(&self, options: FindOptions) -> StoreResult<Vec<E>>;

    /// Entities matching `options` with their total count, deleted or not.
    async fn find_and_count_with_deleted(
        &self,
        options: FindOptions,
    ) -> StoreResult<(Vec<E>, u64)>;

    /// Number of entities matching `filter`, deleted or not.
    async fn count_with_deleted(&self, filter: Filter) -> StoreResult<u64>;

    /// Soft-deleted entities matching `options`.
    async fn find_all_deleted(&self, options: FindOptions) -> StoreResult<Vec<E>>;

    /// Soft-deleted entities matching `options` with their total count.
    async fn find_and_count_deleted(&self, options: FindOptions) -> StoreResult<(Vec<E>, u64)>;

    /// Applies `patch` to every entity matching `filter`, deleted or not, and
    /// refreshes `updated_at`/`updated_by`. Returns the matched count, so
    /// repeating an identical update reports the same number.
    async fn update(&self, filter: Filter, patch: Patch) -> StoreResult<u64>;

    /// Physically removes every entity matching `filter`, deleted or not.
    async fn hard_delete(&self, filter: Filter) -> StoreResult<u64>;

    /// Marks every active entity matching `filter` as deleted. Already-deleted
    /// entities keep their original marker.
    async fn soft_delete(&self, filter: Filter) -> StoreResult<u64>;
}

/// The store-independent [`EntityRepository`] implementation.
pub struct Repository<E, B> {
    backend: B,
    collection: CollectionName,
    _entity: PhantomData<fn() -> E>,
}

impl<E, B> Clone for Repository<E, B>
where
    B: Clone,
{
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            collection: self.collection.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E, B> fmt::Debug for Repository<E, B>
where
    E: Entity,
    B: StoreBackend,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("entity", &E::NAME)
            .field("collection", &self.collection.as_ref())
            .field("backend", &self.backend.kind())
            .finish()
    }
}

impl<E, B> Repository<E, B>
where
    E: Entity,
    B: StoreBackend,
{
    /// Creates a repository over `backend` for the entity's collection.
    pub fn new(backend: B) -> StoreResult<Self> {
        let collection = CollectionName::try_new(E::COLLECTION)
            .map_err(|_| StoreError::InvalidCollection(E::COLLECTION.to_string()))?;
        Ok(Self {
            backend,
            collection,
            _entity: PhantomData,
        })
    }

    /// The backend this repository writes to.
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// The table or collection name.
    pub const fn collection(&self) -> &CollectionName {
        &self.collection
    }

    /// The same repository running inside `tx`.
    pub fn within(&self, tx: &B::Transaction) -> Repository<E, B::Transaction>
    where
        B: TransactionalBackend,
    {
        Repository {
            backend: tx.clone(),
            collection: self.collection.clone(),
            _entity: PhantomData,
        }
    }

    fn handle(&self) -> B::Handle {
        self.backend.query_handle(&self.collection)
    }

    fn decode_all(documents: Vec<Document>) -> StoreResult<Vec<E>> {
        documents.into_iter().map(from_document).collect()
    }

    async fn find_first(&self, options: FindOptions) -> StoreResult<Option<E>> {
        let mut documents = self.handle().find(&options.take(1)).await?;
        documents.pop().map(from_document).transpose()
    }

    async fn find_with(&self, options: FindOptions) -> StoreResult<Vec<E>> {
        let documents = self.handle().find(&options).await?;
        Self::decode_all(documents)
    }

    async fn find_and_count_with(&self, options: FindOptions) -> StoreResult<(Vec<E>, u64)> {
        let handle = self.handle();
        let total = handle.count(&options.filter).await?;
        let documents = handle.find(&options).await?;
        Ok((Self::decode_all(documents)?, total))
    }
}

/// Adds `updated_at`/`updated_by` to a patch unless the caller set them.
fn stamp_patch(patch: &mut Patch) {
    patch.insert_if_absent(fields::UPDATED_AT, unix_now());
    let user_id = context::user_id();
    if !user_id.is_system() {
        patch.insert_if_absent(fields::UPDATED_BY, user_id);
    }
}

#[async_trait]
impl<E, B> EntityRepository<E> for Repository<E, B>
where
    E: Entity,
    B: StoreBackend,
{
    fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    async fn save(&self, entity: E) -> StoreResult<E> {
        let mut saved = self.save_many(vec![entity]).await?;
        saved.pop().ok_or_else(|| StoreError::Deserialization {
            entity: E::NAME,
            detail: "store returned no document for a saved entity".to_string(),
        })
    }

    #[instrument(skip_all, fields(entity = E::NAME, count = entities.len()))]
    async fn save_many(&self, entities: Vec<E>) -> StoreResult<Vec<E>> {
        if entities.is_empty() {
            return Ok(Vec::new());
        }
        let documents = entities
            .into_iter()
            .map(|mut entity| {
                entity.meta_mut().stamp_for_save(E::TENANT_SCOPED);
                to_document(&entity)
            })
            .collect::<StoreResult<Vec<_>>>()?;

        let stored = self.handle().save(documents).await?;
        debug!(saved = stored.len(), "entities saved");
        Self::decode_all(stored)
    }

    async fn find_by_id(&self, id: &EntityId) -> StoreResult<Option<E>> {
        let filter = self.backend.id_criterion(id).and(Filter::active());
        self.find_first(FindOptions::new(filter)).await
    }

    async fn find_one(&self, options: FindOptions) -> StoreResult<Option<E>> {
        self.find_first(options.and_filter(Filter::active())).await
    }

    async fn find_all(&self, options: FindOptions) -> StoreResult<Vec<E>> {
        self.find_with(options.and_filter(Filter::active())).await
    }

    async fn find_and_count(&self, options: FindOptions) -> StoreResult<(Vec<E>, u64)> {
        self.find_and_count_with(options.and_filter(Filter::active()))
            .await
    }

    async fn count(&self, filter: Filter) -> StoreResult<u64> {
        self.handle().count(&filter.and(Filter::active())).await
    }

    async fn find_by_id_with_deleted(&self, id: &EntityId) -> StoreResult<Option<E>> {
        self.find_first(FindOptions::new(self.backend.id_criterion(id)))
            .await
    }

    async fn find_one_with_deleted(&self, options: FindOptions) -> StoreResult<Option<E>> {
        self.find_first(options).await
    }

    async fn find_all_with_deleted(&self, options: FindOptions) -> StoreResult<Vec<E>> {
        self.find_with(options).await
    }

    async fn find_and_count_with_deleted(
        &self,
        options: FindOptions,
    ) -> StoreResult<(Vec<E>, u64)> {
        self.find_and_count_with(options).await
    }

    async fn count_with_deleted(&self, filter: Filter) -> StoreResult<u64> {
        self.handle().count(&filter).await
    }

    async fn find_all_deleted(&self, options: FindOptions) -> StoreResult<Vec<E>> {
        self.find_with(options.and_filter(Filter::deleted())).await
    }

    async fn find_and_count_deleted(&self, options: FindOptions) -> StoreResult<(Vec<E>, u64)> {
        self.find_and_count_with(options.and_filter(Filter::deleted()))
            .await
    }

    #[instrument(skip_all, fields(entity = E::NAME))]
    async fn update(&self, filter: Filter, mut patch: Patch) -> StoreResult<u64> {
        stamp_patch(&mut patch);
        let affected = self
            .backend
            .apply_update(&self.collection, &filter, &patch)
            .await?;
        debug!(affected, "entities updated");
        Ok(affected)
    }

    #[instrument(skip_all, fields(entity = E::NAME))]
    async fn hard_delete(&self, filter: Filter) -> StoreResult<u64> {
        let removed = self.handle().delete(&filter).await?;
        debug!(removed, "entities removed");
        Ok(removed)
    }

    #[instrument(skip_all, fields(entity = E::NAME))]
    async fn soft_delete(&self, filter: Filter) -> StoreResult<u64> {
        let patch = Patch::new()
            .set(fields::DELETED_AT, Timestamp::now())
            .set(fields::DELETED_BY, context::user_id());
        self.update(filter.and(Filter::active()), patch).await
    }
}
