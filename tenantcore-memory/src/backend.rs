//! In-memory [`StoreBackend`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tenantcore::criteria::{Filter, FindOptions, Patch};
use tenantcore::entity::fields;
use tenantcore::errors::{StoreError, StoreResult};
use tenantcore::id::next_snowflake;
use tenantcore::repository::{BackendKind, QueryHandle, StoreBackend};
use tenantcore::transaction::{StoreTransaction, TransactionalBackend};
use tenantcore::types::CollectionName;
use tenantcore::Document;
use tracing::debug;

use crate::eval;

type Collections = HashMap<String, Vec<Document>>;

/// Fails once a transaction's flag has been cleared.
fn ensure_open(open: Option<&Arc<AtomicBool>>) -> StoreResult<()> {
    match open {
        Some(flag) if !flag.load(Ordering::SeqCst) => Err(StoreError::TransactionClosed),
        _ => Ok(()),
    }
}

/// Inserts `document`, or replaces the stored document with the same id.
fn upsert(stored: &mut Vec<Document>, document: Document) {
    let id = document.get(fields::ID).cloned();
    match stored
        .iter_mut()
        .find(|existing| existing.get(fields::ID) == id.as_ref())
    {
        Some(existing) => *existing = document,
        None => stored.push(document),
    }
}

/// Thread-safe in-memory document store for tests and local development.
///
/// Clones share the same data. Documents keep insertion order, which is also
/// the order of unsorted reads.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    collections: Arc<RwLock<Collections>>,
    open: Option<Arc<AtomicBool>>,
}

impl MemoryBackend {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents in `collection`, deleted or not.
    pub fn document_count(&self, collection: &str) -> usize {
        self.collections.read().get(collection).map_or(0, Vec::len)
    }

    /// Drops every document.
    pub fn clear(&self) {
        self.collections.write().clear();
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    type Handle = MemoryCollection;

    fn kind(&self) -> BackendKind {
        BackendKind::InMemory
    }

    fn query_handle(&self, collection: &CollectionName) -> Self::Handle {
        MemoryCollection {
            collections: Arc::clone(&self.collections),
            name: collection.to_string(),
            open: self.open.clone(),
        }
    }

    async fn apply_update(
        &self,
        collection: &CollectionName,
        filter: &Filter,
        patch: &Patch,
    ) -> StoreResult<u64> {
        ensure_open(self.open.as_ref())?;
        let mut collections = self.collections.write();
        let Some(documents) = collections.get_mut(collection.as_ref()) else {
            return Ok(0);
        };

        let mut affected = 0;
        for document in documents
            .iter_mut()
            .filter(|document| eval::matches(filter, document))
        {
            for (field, value) in patch.iter() {
                document.insert(field.to_string(), value.to_json());
            }
            affected += 1;
        }
        Ok(affected)
    }
}

#[async_trait]
impl TransactionalBackend for MemoryBackend {
    type Transaction = MemoryTransaction;

    async fn begin(&self) -> StoreResult<MemoryTransaction> {
        ensure_open(self.open.as_ref())?;
        let snapshot = self.collections.read().clone();
        Ok(MemoryTransaction {
            target: self.clone(),
            staged: Self {
                collections: Arc::new(RwLock::new(snapshot.clone())),
                open: Some(Arc::new(AtomicBool::new(true))),
            },
            snapshot: Arc::new(snapshot),
        })
    }
}

/// A transaction over [`MemoryBackend`].
///
/// Reads and writes go to a staged copy taken at `begin`. Commit merges the
/// documents the transaction inserted, replaced or removed back into the
/// store by id; documents it never touched keep any concurrent changes.
#[derive(Debug, Clone)]
pub struct MemoryTransaction {
    target: MemoryBackend,
    staged: MemoryBackend,
    snapshot: Arc<Collections>,
}

impl MemoryTransaction {
    fn close(&self) -> StoreResult<()> {
        let open = self
            .staged
            .open
            .as_ref()
            .is_some_and(|flag| flag.swap(false, Ordering::SeqCst));
        if open {
            Ok(())
        } else {
            Err(StoreError::TransactionClosed)
        }
    }
}

#[async_trait]
impl StoreBackend for MemoryTransaction {
    type Handle = MemoryCollection;

    fn kind(&self) -> BackendKind {
        BackendKind::InMemory
    }

    fn query_handle(&self, collection: &CollectionName) -> Self::Handle {
        self.staged.query_handle(collection)
    }

    async fn apply_update(
        &self,
        collection: &CollectionName,
        filter: &Filter,
        patch: &Patch,
    ) -> StoreResult<u64> {
        self.staged.apply_update(collection, filter, patch).await
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn commit(self) -> StoreResult<()> {
        self.close()?;
        let staged = self.staged.collections.read().clone();
        let mut target = self.target.collections.write();

        let mut changed = 0_usize;
        for (name, documents) in staged {
            let before = self.snapshot.get(&name);
            let stored = target.entry(name).or_default();

            for old in before.into_iter().flatten() {
                let id = old.get(fields::ID);
                if !documents.iter().any(|document| document.get(fields::ID) == id) {
                    stored.retain(|existing| existing.get(fields::ID) != id);
                    changed += 1;
                }
            }
            for document in documents {
                if before.is_some_and(|before| before.contains(&document)) {
                    continue;
                }
                upsert(stored, document);
                changed += 1;
            }
        }
        debug!(changed, "memory transaction committed");
        Ok(())
    }

    async fn rollback(self) -> StoreResult<()> {
        self.close()
    }
}

/// Handle on one in-memory collection.
#[derive(Debug, Clone)]
pub struct MemoryCollection {
    collections: Arc<RwLock<Collections>>,
    name: String,
    open: Option<Arc<AtomicBool>>,
}

#[async_trait]
impl QueryHandle for MemoryCollection {
    async fn save(&self, documents: Vec<Document>) -> StoreResult<Vec<Document>> {
        ensure_open(self.open.as_ref())?;
        let mut collections = self.collections.write();
        let stored = collections.entry(self.name.clone()).or_default();

        let mut saved = Vec::with_capacity(documents.len());
        for mut document in documents {
            if matches!(document.get(fields::ID), None | Some(Value::Null)) {
                document.insert(fields::ID.to_string(), Value::from(next_snowflake()));
            }
            upsert(stored, document.clone());
            saved.push(document);
        }
        Ok(saved)
    }

    async fn find(&self, options: &FindOptions) -> StoreResult<Vec<Document>> {
        ensure_open(self.open.as_ref())?;
        let collections = self.collections.read();
        let mut found: Vec<Document> = collections
            .get(&self.name)
            .map(|documents| {
                documents
                    .iter()
                    .filter(|document| eval::matches(&options.filter, document))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        drop(collections);

        eval::sort(&mut found, &options.order);

        let skip = options
            .skip
            .map_or(0, |skip| usize::try_from(skip).unwrap_or(usize::MAX));
        let take = options
            .take
            .map_or(usize::MAX, |take| usize::try_from(take).unwrap_or(usize::MAX));
        Ok(found.into_iter().skip(skip).take(take).collect())
    }

    async fn count(&self, filter: &Filter) -> StoreResult<u64> {
        ensure_open(self.open.as_ref())?;
        let collections = self.collections.read();
        let count = collections.get(&self.name).map_or(0, |documents| {
            documents
                .iter()
                .filter(|document| eval::matches(filter, document))
                .count()
        });
        Ok(count as u64)
    }

    async fn delete(&self, filter: &Filter) -> StoreResult<u64> {
        ensure_open(self.open.as_ref())?;
        let mut collections = self.collections.write();
        let Some(documents) = collections.get_mut(&self.name) else {
            return Ok(0);
        };
        let before = documents.len();
        documents.retain(|document| !eval::matches(filter, document));
        Ok((before - documents.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn collection(backend: &MemoryBackend) -> MemoryCollection {
        backend.query_handle(&CollectionName::try_new("notes").unwrap())
    }

    fn collection_in(tx: &MemoryTransaction) -> MemoryCollection {
        tx.query_handle(&CollectionName::try_new("notes").unwrap())
    }

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => unreachable!("test documents are objects"),
        }
    }

    #[tokio::test]
    async fn save_assigns_ids_and_upserts() {
        let backend = MemoryBackend::new();
        let notes = collection(&backend);

        let saved = notes.save(vec![doc(json!({ "title": "a" }))]).await.unwrap();
        let id = saved[0]["id"].clone();
        assert!(id.as_i64().is_some_and(|id| id > 0));

        let mut replacement = saved[0].clone();
        replacement.insert("title".to_string(), json!("b"));
        notes.save(vec![replacement]).await.unwrap();

        assert_eq!(backend.document_count("notes"), 1);
        let found = notes.find(&FindOptions::default()).await.unwrap();
        assert_eq!(found[0]["title"], "b");
    }

    #[tokio::test]
    async fn find_applies_skip_and_take_after_sorting() {
        let backend = MemoryBackend::new();
        let notes = collection(&backend);
        let docs = (1..=5).map(|n| doc(json!({ "id": n, "rank": 10 - n }))).collect();
        notes.save(docs).await.unwrap();

        let page = notes
            .find(&FindOptions::default().order_by_asc("rank").skip(1).take(2))
            .await
            .unwrap();

        let ids: Vec<_> = page.iter().map(|d| d["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![4, 3]);
    }

    #[tokio::test]
    async fn update_and_delete_report_affected_counts() {
        let backend = MemoryBackend::new();
        let notes = collection(&backend);
        notes
            .save(vec![
                doc(json!({ "id": 1, "kind": "x" })),
                doc(json!({ "id": 2, "kind": "y" })),
                doc(json!({ "id": 3, "kind": "x" })),
            ])
            .await
            .unwrap();
        let name = CollectionName::try_new("notes").unwrap();

        let updated = backend
            .apply_update(&name, &Filter::eq("kind", "x"), &Patch::new().set("kind", "z"))
            .await
            .unwrap();
        assert_eq!(updated, 2);

        let removed = notes.delete(&Filter::eq("kind", "z")).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(notes.count(&Filter::All).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn commit_merges_only_documents_the_transaction_touched() {
        let backend = MemoryBackend::new();
        let notes = collection(&backend);
        notes
            .save(vec![doc(json!({ "id": 1, "v": "a" })), doc(json!({ "id": 2, "v": "b" }))])
            .await
            .unwrap();

        let tx = backend.begin().await.unwrap();
        let staged = collection_in(&tx);
        staged.save(vec![doc(json!({ "id": 3, "v": "c" }))]).await.unwrap();
        staged.delete(&Filter::eq("id", 1_i64)).await.unwrap();

        // A write outside the transaction to a document it never touched.
        notes.save(vec![doc(json!({ "id": 2, "v": "b2" }))]).await.unwrap();
        assert_eq!(backend.document_count("notes"), 2);

        tx.commit().await.unwrap();

        let found = notes.find(&FindOptions::default().order_by_asc("id")).await.unwrap();
        let values: Vec<_> = found.iter().map(|d| d["v"].clone()).collect();
        assert_eq!(values, vec![json!("b2"), json!("c")]);
    }

    #[tokio::test]
    async fn closed_transactions_reject_further_use() {
        let backend = MemoryBackend::new();
        let tx = backend.begin().await.unwrap();
        let staged = collection_in(&tx);
        staged.save(vec![doc(json!({ "id": 1 }))]).await.unwrap();

        tx.clone().rollback().await.unwrap();

        assert!(matches!(
            staged.count(&Filter::All).await,
            Err(StoreError::TransactionClosed)
        ));
        assert!(matches!(tx.commit().await, Err(StoreError::TransactionClosed)));
        assert_eq!(backend.document_count("notes"), 0);
    }

    #[tokio::test]
    async fn unknown_collections_are_empty() {
        let backend = MemoryBackend::new();
        let notes = collection(&backend);

        assert!(notes.find(&FindOptions::default()).await.unwrap().is_empty());
        assert_eq!(notes.count(&Filter::All).await.unwrap(), 0);
        assert_eq!(notes.delete(&Filter::All).await.unwrap(), 0);
    }
}
