//! Schema-validated, quota-accounted document CRUD and filtered queries.
//!
//! Every mutation runs inside the tenant's write section: schema lookup,
//! validation, quota accounting and the storage write happen as one unit
//! relative to other writers of the same tenant. Quota is charged before the
//! write and released again if the write fails, so usage never exceeds the
//! limit even under concurrent inserts.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error};

use crate::catalog::Catalog;
use crate::error::{DbError, DbResult};
use crate::events::{Change, ChangeEvent};
use crate::keygen;
use crate::models::{Document, DocumentData};
use crate::sanitize;
use crate::storage::StoredDocument;
use crate::validation::{self, Filters};

#[derive(Clone)]
pub struct DocumentStore {
    catalog: Arc<Catalog>,
}

impl DocumentStore {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Validate and store a new document, charging its size to the tenant.
    pub fn insert(
        &self,
        tenant_id: &str,
        collection: &str,
        data: DocumentData,
    ) -> DbResult<Document> {
        sanitize::validate(collection)?;
        let store = self.catalog.tenant_store(tenant_id)?;
        let _guard = store.lock()?;

        let schema = self.catalog.get_schema(tenant_id, collection)?;
        validation::validate_document(&data, &schema)?;

        let now = Utc::now();
        let stored = StoredDocument::new(keygen::document_id()?, store.next_seq()?, now, &data)?;
        let size = stored.size();

        self.catalog.adjust_quota(tenant_id, size as i64)?;
        if let Err(e) = store.insert_document(collection, &stored) {
            self.catalog.release_quota(tenant_id, size);
            return Err(e);
        }

        debug!(tenant = tenant_id, collection, id = %stored.id, size, "document inserted");
        let data = Arc::new(data);
        self.catalog.broadcaster().publish(ChangeEvent::new(
            tenant_id,
            collection,
            Change::Insert {
                document_id: stored.id.clone(),
                data: data.clone(),
            },
        ));

        Ok(Document {
            id: stored.id,
            collection: collection.to_string(),
            data: Arc::unwrap_or_clone(data),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get(&self, tenant_id: &str, collection: &str, doc_id: &str) -> DbResult<Document> {
        self.catalog.get_schema(tenant_id, collection)?;
        let store = self.catalog.tenant_store(tenant_id)?;
        store
            .get_document(collection, doc_id)?
            .ok_or_else(|| DbError::document_not_found(doc_id))?
            .into_document(collection)
    }

    /// Documents matching every filter, newest first. `limit` of zero means
    /// no limit; `offset` applies after filtering.
    pub fn query(
        &self,
        tenant_id: &str,
        collection: &str,
        limit: usize,
        offset: usize,
        filters: &Filters,
    ) -> DbResult<Vec<Document>> {
        let schema = self.catalog.get_schema(tenant_id, collection)?;
        let store = self.catalog.tenant_store(tenant_id)?;

        let mut matched = vec![];
        for stored in store.scan(collection)? {
            let seq = stored.seq;
            let document = stored.into_document(collection)?;
            if validation::matches_filters(&document.data, &schema, filters) {
                matched.push((seq, document));
            }
        }

        matched.sort_by(|(a_seq, a), (b_seq, b)| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b_seq.cmp(a_seq))
        });

        let limit = if limit == 0 { usize::MAX } else { limit };
        Ok(matched
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(_, document)| document)
            .collect())
    }

    /// Replace a document's data. Only the size difference is charged; a
    /// shrinking update releases quota.
    pub fn update(
        &self,
        tenant_id: &str,
        collection: &str,
        doc_id: &str,
        data: DocumentData,
    ) -> DbResult<Document> {
        sanitize::validate(collection)?;
        let store = self.catalog.tenant_store(tenant_id)?;
        let _guard = store.lock()?;

        let schema = self.catalog.get_schema(tenant_id, collection)?;
        validation::validate_document(&data, &schema)?;

        let old = store
            .get_document(collection, doc_id)?
            .ok_or_else(|| DbError::document_not_found(doc_id))?;
        let now = Utc::now();
        let updated = StoredDocument {
            id: old.id.clone(),
            seq: old.seq,
            created_at: old.created_at,
            updated_at: now,
            data: serde_json::to_string(&data)?,
        };
        let delta = updated.size() as i64 - old.size() as i64;

        if delta > 0 {
            self.catalog.adjust_quota(tenant_id, delta)?;
            if let Err(e) = store.put_document(collection, &updated) {
                self.catalog.release_quota(tenant_id, delta as u64);
                return Err(e);
            }
        } else {
            store.put_document(collection, &updated)?;
            if delta < 0 {
                if let Err(e) = self.catalog.adjust_quota(tenant_id, delta) {
                    if let Err(rollback) = store.put_document(collection, &old) {
                        error!(
                            tenant = tenant_id,
                            collection,
                            id = doc_id,
                            error = %rollback,
                            "failed to restore document"
                        );
                    }
                    return Err(e);
                }
            }
        }

        debug!(tenant = tenant_id, collection, id = doc_id, delta, "document updated");
        let data = Arc::new(data);
        self.catalog.broadcaster().publish(ChangeEvent::new(
            tenant_id,
            collection,
            Change::Update {
                document_id: doc_id.to_string(),
                data: data.clone(),
            },
        ));

        Ok(Document {
            id: updated.id,
            collection: collection.to_string(),
            data: Arc::unwrap_or_clone(data),
            created_at: updated.created_at,
            updated_at: now,
        })
    }

    /// Remove a document and release its size from the tenant's quota.
    pub fn delete(&self, tenant_id: &str, collection: &str, doc_id: &str) -> DbResult<()> {
        sanitize::validate(collection)?;
        let store = self.catalog.tenant_store(tenant_id)?;
        let _guard = store.lock()?;

        self.catalog.get_schema(tenant_id, collection)?;
        let removed = store
            .remove_document(collection, doc_id)?
            .ok_or_else(|| DbError::document_not_found(doc_id))?;

        if let Err(e) = self.catalog.adjust_quota(tenant_id, -(removed.size() as i64)) {
            if let Err(rollback) = store.put_document(collection, &removed) {
                error!(
                    tenant = tenant_id,
                    collection,
                    id = doc_id,
                    error = %rollback,
                    "failed to restore document"
                );
            }
            return Err(e);
        }

        debug!(tenant = tenant_id, collection, id = doc_id, "document deleted");
        self.catalog.broadcaster().publish(ChangeEvent::new(
            tenant_id,
            collection,
            Change::Delete {
                document_id: doc_id.to_string(),
            },
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::events::Broadcaster;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: DocumentStore,
        tenant: String,
    }

    fn fixture(quota: u64) -> Fixture {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open(
            dir.path().join("catalog.db"),
            dir.path().join("data"),
            quota,
            Broadcaster::default(),
        )
        .unwrap();
        let tenant = catalog.create_tenant().unwrap().database_id;
        let fields: BTreeMap<String, String> = [("name", "string"), ("age", "number")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        catalog.create_schema(&tenant, "users", &fields).unwrap();
        Fixture {
            _dir: dir,
            store: DocumentStore::new(Arc::new(catalog)),
            tenant,
        }
    }

    fn data(value: serde_json::Value) -> DocumentData {
        value.as_object().cloned().unwrap()
    }

    fn used(f: &Fixture) -> u64 {
        f.store.catalog().get_tenant(&f.tenant).unwrap().quota_used
    }

    #[test]
    fn test_insert_charges_serialized_size() {
        let f = fixture(1024);
        let payload = data(json!({"name": "Alice", "age": 25}));
        let size = serde_json::to_string(&payload).unwrap().len() as u64;

        let doc = f.store.insert(&f.tenant, "users", payload).unwrap();
        assert!(doc.id.starts_with("doc_"));
        assert_eq!(doc.created_at, doc.updated_at);
        assert_eq!(used(&f), size);

        let fetched = f.store.get(&f.tenant, "users", &doc.id).unwrap();
        assert_eq!(fetched, doc);
    }

    #[test]
    fn test_invalid_insert_changes_nothing() {
        let f = fixture(1024);
        let err = f
            .store
            .insert(&f.tenant, "users", data(json!({"name": "Alice", "age": "25"})))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);

        let err = f
            .store
            .insert(&f.tenant, "ghosts", data(json!({"name": "Alice"})))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = f
            .store
            .insert(&f.tenant, "users--", data(json!({"name": "Alice"})))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidIdentifier);

        assert_eq!(used(&f), 0);
        assert!(f
            .store
            .query(&f.tenant, "users", 0, 0, &Filters::new())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_quota_exceeded_leaves_state_unchanged() {
        let f = fixture(40);
        f.store
            .insert(&f.tenant, "users", data(json!({"name": "Al", "age": 1})))
            .unwrap();
        let before = used(&f);

        let err = f
            .store
            .insert(&f.tenant, "users", data(json!({"name": "Bartholomew", "age": 2})))
            .unwrap_err();
        assert!(matches!(err, DbError::QuotaExceeded { used: at, limit: 40, .. } if at == before));
        assert_eq!(used(&f), before);
        assert_eq!(
            f.store
                .query(&f.tenant, "users", 0, 0, &Filters::new())
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_update_charges_only_the_delta() {
        let f = fixture(1024);
        let doc = f
            .store
            .insert(&f.tenant, "users", data(json!({"name": "Al", "age": 1})))
            .unwrap();
        let small = used(&f);

        let grown = f
            .store
            .update(&f.tenant, "users", &doc.id, data(json!({"name": "Alexander", "age": 1})))
            .unwrap();
        assert_eq!(grown.created_at, doc.created_at);
        assert!(grown.updated_at >= doc.updated_at);
        assert_eq!(used(&f), small + 7);

        f.store
            .update(&f.tenant, "users", &doc.id, data(json!({"name": "Al", "age": 1})))
            .unwrap();
        assert_eq!(used(&f), small);

        let err = f
            .store
            .update(&f.tenant, "users", "doc_missing", data(json!({"name": "Al", "age": 1})))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_update_over_quota_keeps_prior_document() {
        let f = fixture(40);
        let doc = f
            .store
            .insert(&f.tenant, "users", data(json!({"name": "Al", "age": 1})))
            .unwrap();
        let before = used(&f);

        let long_name = "A".repeat(64);
        let err = f
            .store
            .update(&f.tenant, "users", &doc.id, data(json!({"name": long_name, "age": 2})))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);

        assert_eq!(used(&f), before);
        let kept = f.store.get(&f.tenant, "users", &doc.id).unwrap();
        assert_eq!(kept.data["name"], "Al");
        assert_eq!(kept.data["age"], 1);
        assert_eq!(kept.updated_at, doc.updated_at);
    }

    #[test]
    fn test_delete_releases_quota() {
        let f = fixture(1024);
        let doc = f
            .store
            .insert(&f.tenant, "users", data(json!({"name": "Alice", "age": 30})))
            .unwrap();
        f.store.delete(&f.tenant, "users", &doc.id).unwrap();
        assert_eq!(used(&f), 0);

        let err = f.store.delete(&f.tenant, "users", &doc.id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = f.store.get(&f.tenant, "users", &doc.id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_delete_schema_returns_quota() {
        let f = fixture(1024);
        for name in ["a", "b", "c"] {
            f.store
                .insert(&f.tenant, "users", data(json!({"name": name, "age": 1})))
                .unwrap();
        }
        assert!(used(&f) > 0);
        f.store.catalog().delete_schema(&f.tenant, "users").unwrap();
        assert_eq!(used(&f), 0);
    }

    #[test]
    fn test_query_orders_newest_first_and_paginates_after_filtering() {
        let f = fixture(4096);
        for i in 0..6 {
            f.store
                .insert(&f.tenant, "users", data(json!({"name": format!("u{}", i), "age": i % 2})))
                .unwrap();
        }

        let all = f
            .store
            .query(&f.tenant, "users", 0, 0, &Filters::new())
            .unwrap();
        let names: Vec<_> = all.iter().map(|d| d.data["name"].clone()).collect();
        assert_eq!(names, vec!["u5", "u4", "u3", "u2", "u1", "u0"]);

        let mut filters = Filters::new();
        filters.insert("age".into(), vec!["0".into()]);
        let page = f.store.query(&f.tenant, "users", 1, 1, &filters).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].data["name"], "u2");

        let beyond = f.store.query(&f.tenant, "users", 10, 50, &filters).unwrap();
        assert!(beyond.is_empty());
    }

    #[test]
    fn test_concurrent_inserts_never_exceed_quota() {
        let payload = data(json!({"name": "abcdefgh", "age": 1}));
        let size = serde_json::to_string(&payload).unwrap().len() as u64;
        let f = fixture(size * 5 + size / 2);

        let successes = std::sync::atomic::AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for _ in 0..16 {
                scope.spawn(|| match f.store.insert(&f.tenant, "users", payload.clone()) {
                    Ok(_) => {
                        successes.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    }
                    Err(e) => assert_eq!(e.kind(), ErrorKind::QuotaExceeded),
                });
            }
        });

        assert_eq!(successes.into_inner(), 5);
        assert_eq!(used(&f), size * 5);
    }

    #[tokio::test]
    async fn test_mutations_publish_events() {
        let f = fixture(1024);
        let mut listener = f
            .store
            .catalog()
            .broadcaster()
            .subscribe_collection(&f.tenant, "users");

        let doc = f
            .store
            .insert(&f.tenant, "users", data(json!({"name": "Alice", "age": 1})))
            .unwrap();
        f.store
            .update(&f.tenant, "users", &doc.id, data(json!({"name": "Alicia", "age": 2})))
            .unwrap();
        f.store.delete(&f.tenant, "users", &doc.id).unwrap();

        let mut kinds = vec![];
        for _ in 0..3 {
            let event = listener.next_event().await.unwrap();
            assert_eq!(event.document_id(), doc.id);
            kinds.push(event.event_type());
        }
        assert_eq!(kinds, vec!["insert", "update", "delete"]);
    }
}
