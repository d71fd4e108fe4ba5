//! `MongoDB` backend for `tenantcore` repositories.
//!
//! Documents keep the entity's JSON shape with two boundary conversions: `id`
//! is stored as `_id` (an `ObjectId` assigned by the server for new
//! documents) and the audit times are stored as unix seconds.
//!
//! [`MongoTransaction`] groups writes in one multi-document transaction,
//! which needs a replica set.

pub mod document;
pub mod filter;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{doc, Document as BsonDocument};
use mongodb::options::IndexOptions;
use mongodb::{Client, ClientSession, Collection, Database, IndexModel};
use tenantcore::config::MongoSettings;
use tenantcore::criteria::{FieldValue, Filter, FindOptions, Patch};
use tenantcore::entity::fields;
use tenantcore::errors::{Operation, StoreError, StoreResult};
use tenantcore::repository::{BackendKind, QueryHandle, StoreBackend};
use tenantcore::transaction::{StoreTransaction, TransactionalBackend};
use tenantcore::types::{CollectionName, EntityId};
use tenantcore::{Document, Entity};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, instrument};

use crate::filter::{field_bson, looks_like_object_id, stored_field, PRIMARY_KEY};

/// Connection settings for [`MongoBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MongoConfig {
    /// Connection URL
    pub url: String,
    /// Database holding the collections
    pub database: String,
}

impl From<&MongoSettings> for MongoConfig {
    fn from(settings: &MongoSettings) -> Self {
        Self {
            url: settings.url.clone(),
            database: settings.database.clone(),
        }
    }
}

/// Repository backend over one `MongoDB` database.
#[derive(Debug, Clone)]
pub struct MongoBackend {
    database: Database,
}

impl MongoBackend {
    /// Connects and checks the server answers.
    pub async fn connect(config: &MongoConfig) -> StoreResult<Self> {
        let client = Client::with_uri_str(&config.url)
            .await
            .map_err(|source| StoreError::ConnectionFailed {
                backend: "mongo",
                source: Box::new(source),
            })?;
        let backend = Self::from_database(client.database(&config.database));
        backend.ping().await?;
        info!(database = %config.database, "[mongo.connect] connected");
        Ok(backend)
    }

    /// Connects using loaded settings.
    pub async fn from_settings(settings: &MongoSettings) -> StoreResult<Self> {
        Self::connect(&MongoConfig::from(settings)).await
    }

    /// Wraps an existing database handle.
    pub const fn from_database(database: Database) -> Self {
        Self { database }
    }

    /// The underlying database handle.
    pub const fn database(&self) -> &Database {
        &self.database
    }

    /// Round-trips a `ping` command.
    pub async fn ping(&self) -> StoreResult<()> {
        self.database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|error| map_mongo_error(error, Operation::Connect))?;
        Ok(())
    }

    /// Creates the tenant/soft-delete index for `E`'s collection.
    #[instrument(name = "mongo.ensure_indexes", skip(self), fields(collection = E::COLLECTION))]
    pub async fn ensure_indexes<E: Entity>(&self) -> StoreResult<()> {
        let collection = CollectionName::try_new(E::COLLECTION)
            .map_err(|_| StoreError::InvalidCollection(E::COLLECTION.to_string()))?;
        let index = IndexModel::builder()
            .keys(doc! { fields::TENANT_ID: 1, fields::DELETED_AT: 1 })
            .options(
                IndexOptions::builder()
                    .name(format!("{collection}_tenant_active"))
                    .build(),
            )
            .build();
        self.collection(&collection)
            .create_index(index)
            .await
            .map_err(|error| map_mongo_error(error, Operation::EnsureSchema))?;
        debug!("[mongo.ensure_indexes] index ready");
        Ok(())
    }

    fn collection(&self, collection: &CollectionName) -> Collection<BsonDocument> {
        self.database.collection(collection.as_ref())
    }
}

#[async_trait]
impl StoreBackend for MongoBackend {
    type Handle = MongoCollection;

    fn kind(&self) -> BackendKind {
        BackendKind::Document
    }

    fn query_handle(&self, collection: &CollectionName) -> Self::Handle {
        MongoCollection {
            collection: self.collection(collection),
            session: None,
        }
    }

    fn id_criterion(&self, id: &EntityId) -> Filter {
        object_id_criterion(id)
    }

    async fn apply_update(
        &self,
        collection: &CollectionName,
        filter: &Filter,
        patch: &Patch,
    ) -> StoreResult<u64> {
        self.query_handle(collection).update(filter, patch).await
    }
}

#[async_trait]
impl TransactionalBackend for MongoBackend {
    type Transaction = MongoTransaction;

    /// Starts a session with an open transaction. The server must be a
    /// replica set or sharded cluster.
    #[instrument(name = "mongo.begin", skip(self))]
    async fn begin(&self) -> StoreResult<MongoTransaction> {
        let mut session = self
            .database
            .client()
            .start_session()
            .await
            .map_err(|error| map_mongo_error(error, Operation::Transaction))?;
        session
            .start_transaction()
            .await
            .map_err(|error| map_mongo_error(error, Operation::Transaction))?;
        Ok(MongoTransaction {
            backend: self.clone(),
            session: Arc::new(Mutex::new(Some(session))),
        })
    }
}

/// Builds the id criterion, reading 24-digit hex text as an `ObjectId`.
fn object_id_criterion(id: &EntityId) -> Filter {
    match id {
        EntityId::Text(raw) if looks_like_object_id(raw) => {
            Filter::eq(fields::ID, FieldValue::ObjectId(raw.clone()))
        }
        other => Filter::eq(fields::ID, other),
    }
}

type SharedSession = Arc<Mutex<Option<ClientSession>>>;

/// A multi-document transaction on a [`MongoBackend`].
///
/// Every operation through the transaction (or its clones) runs in one
/// client session, one at a time.
#[derive(Clone)]
pub struct MongoTransaction {
    backend: MongoBackend,
    session: SharedSession,
}

impl fmt::Debug for MongoTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MongoTransaction")
            .field("database", &self.backend.database.name())
            .finish_non_exhaustive()
    }
}

impl MongoTransaction {
    async fn finish(&self) -> StoreResult<ClientSession> {
        self.session
            .lock()
            .await
            .take()
            .ok_or(StoreError::TransactionClosed)
    }
}

#[async_trait]
impl StoreBackend for MongoTransaction {
    type Handle = MongoCollection;

    fn kind(&self) -> BackendKind {
        BackendKind::Document
    }

    fn query_handle(&self, collection: &CollectionName) -> Self::Handle {
        MongoCollection {
            collection: self.backend.collection(collection),
            session: Some(Arc::clone(&self.session)),
        }
    }

    fn id_criterion(&self, id: &EntityId) -> Filter {
        object_id_criterion(id)
    }

    async fn apply_update(
        &self,
        collection: &CollectionName,
        filter: &Filter,
        patch: &Patch,
    ) -> StoreResult<u64> {
        self.query_handle(collection).update(filter, patch).await
    }
}

#[async_trait]
impl StoreTransaction for MongoTransaction {
    #[instrument(name = "mongo.commit", skip(self))]
    async fn commit(self) -> StoreResult<()> {
        let mut session = self.finish().await?;
        session
            .commit_transaction()
            .await
            .map_err(|error| map_mongo_error(error, Operation::Transaction))
    }

    #[instrument(name = "mongo.rollback", skip(self))]
    async fn rollback(self) -> StoreResult<()> {
        let mut session = self.finish().await?;
        session
            .abort_transaction()
            .await
            .map_err(|error| map_mongo_error(error, Operation::Transaction))
    }
}

/// The session, if any, an operation runs in.
struct SessionLease<'a>(Option<MutexGuard<'a, Option<ClientSession>>>);

impl SessionLease<'_> {
    fn session(&mut self) -> StoreResult<Option<&mut ClientSession>> {
        match &mut self.0 {
            None => Ok(None),
            Some(guard) => guard
                .as_mut()
                .map(Some)
                .ok_or(StoreError::TransactionClosed),
        }
    }
}

/// Handle on one collection, either standalone or inside a transaction.
#[derive(Clone)]
pub struct MongoCollection {
    collection: Collection<BsonDocument>,
    session: Option<SharedSession>,
}

impl fmt::Debug for MongoCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MongoCollection")
            .field("collection", &self.collection.name())
            .field("in_transaction", &self.session.is_some())
            .finish()
    }
}

impl MongoCollection {
    async fn lease(&self) -> SessionLease<'_> {
        match &self.session {
            Some(session) => SessionLease(Some(session.lock().await)),
            None => SessionLease(None),
        }
    }

    /// Applies `patch` with `$set` to every matching document. Returns the
    /// matched count, like the other backends, even where values were
    /// already equal.
    #[instrument(name = "mongo.update", skip(self, filter, patch), fields(collection = %self.collection.name()))]
    async fn update(&self, filter: &Filter, patch: &Patch) -> StoreResult<u64> {
        let mut set = BsonDocument::new();
        for (field, value) in patch.iter() {
            if field != fields::ID {
                set.insert(stored_field(field), field_bson(field, value));
            }
        }
        if set.is_empty() {
            return Ok(0);
        }

        let query = filter::compile(filter);
        let update = doc! { "$set": set };
        let mut lease = self.lease().await;
        let result = match lease.session()? {
            Some(session) => {
                self.collection
                    .update_many(query, update)
                    .session(session)
                    .await
            }
            None => self.collection.update_many(query, update).await,
        }
        .map_err(|error| map_mongo_error(error, Operation::Update))?;
        Ok(result.matched_count)
    }
}

#[async_trait]
impl QueryHandle for MongoCollection {
    #[instrument(name = "mongo.save", skip(self, documents), fields(collection = %self.collection.name(), count = documents.len()))]
    async fn save(&self, documents: Vec<Document>) -> StoreResult<Vec<Document>> {
        let mut lease = self.lease().await;
        let mut session = lease.session()?;

        let mut saved = Vec::with_capacity(documents.len());
        for document in documents {
            let mut stored = document::to_stored(document)?;
            match stored.get(PRIMARY_KEY).cloned() {
                Some(id) => {
                    let replace = self
                        .collection
                        .replace_one(doc! { PRIMARY_KEY: id }, stored.clone())
                        .upsert(true);
                    let replaced = match session.as_deref_mut() {
                        Some(session) => replace.session(session).await,
                        None => replace.await,
                    };
                    replaced.map_err(|error| map_mongo_error(error, Operation::Save))?;
                }
                None => {
                    let insert = self.collection.insert_one(stored.clone());
                    let inserted = match session.as_deref_mut() {
                        Some(session) => insert.session(session).await,
                        None => insert.await,
                    }
                    .map_err(|error| map_mongo_error(error, Operation::Save))?;
                    stored.insert(PRIMARY_KEY, inserted.inserted_id);
                }
            }
            saved.push(document::from_stored(stored));
        }
        Ok(saved)
    }

    #[instrument(name = "mongo.find", skip(self, options), fields(collection = %self.collection.name()))]
    async fn find(&self, options: &FindOptions) -> StoreResult<Vec<Document>> {
        let mut query = self
            .collection
            .find(filter::compile(&options.filter))
            .sort(filter::compile_sort(&options.order));
        if let Some(skip) = options.skip.filter(|skip| *skip > 0) {
            query = query.skip(skip);
        }
        if let Some(take) = options.take {
            query = query.limit(i64::try_from(take).unwrap_or(i64::MAX));
        }

        let mut lease = self.lease().await;
        let stored: Vec<BsonDocument> = match lease.session()? {
            Some(session) => {
                let mut cursor = query
                    .session(&mut *session)
                    .await
                    .map_err(|error| map_mongo_error(error, Operation::Find))?;
                cursor.stream(session).try_collect().await
            }
            None => query
                .await
                .map_err(|error| map_mongo_error(error, Operation::Find))?
                .try_collect()
                .await,
        }
        .map_err(|error| map_mongo_error(error, Operation::Find))?;
        Ok(stored.into_iter().map(document::from_stored).collect())
    }

    #[instrument(name = "mongo.count", skip(self, filter), fields(collection = %self.collection.name()))]
    async fn count(&self, filter: &Filter) -> StoreResult<u64> {
        let query = self.collection.count_documents(filter::compile(filter));
        let mut lease = self.lease().await;
        let counted = match lease.session()? {
            Some(session) => query.session(session).await,
            None => query.await,
        };
        counted.map_err(|error| map_mongo_error(error, Operation::Count))
    }

    #[instrument(name = "mongo.delete", skip(self, filter), fields(collection = %self.collection.name()))]
    async fn delete(&self, filter: &Filter) -> StoreResult<u64> {
        let query = self.collection.delete_many(filter::compile(filter));
        let mut lease = self.lease().await;
        let result = match lease.session()? {
            Some(session) => query.session(session).await,
            None => query.await,
        }
        .map_err(|error| map_mongo_error(error, Operation::Delete))?;
        Ok(result.deleted_count)
    }
}

fn map_mongo_error(error: mongodb::error::Error, operation: Operation) -> StoreError {
    error!(
        error = %error,
        operation = %operation,
        "[mongo.database_error] database operation failed"
    );
    StoreError::backend(operation, error)
}
