use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use crate::models::{Document, DocumentData};
use crate::sanitize;

/// Tree registering every provisioned collection of a tenant.
const COLLECTIONS_TREE: &str = "_collections";

/// A document as persisted in a collection tree.
/// `data` is the serialized field map; its length is what quota is charged.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StoredDocument {
    pub id: String,
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub data: String,
}

impl StoredDocument {
    pub fn new(id: String, seq: u64, now: DateTime<Utc>, data: &DocumentData) -> DbResult<Self> {
        Ok(Self {
            id,
            seq,
            created_at: now,
            updated_at: now,
            data: serde_json::to_string(data)?,
        })
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn into_document(self, collection: &str) -> DbResult<Document> {
        Ok(Document {
            data: serde_json::from_str(&self.data)?,
            id: self.id,
            collection: collection.to_string(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// One tenant's storage unit: a Sled database with one tree per collection.
///
/// Mutations go through [`TenantStore::lock`], which serialises writers on this
/// tenant only. Once the tenant is destroyed the handle is closed and every
/// further call fails with `NotFound`.
pub struct TenantStore {
    id: String,
    db: sled::Db,
    write_lock: Mutex<()>,
    closed: AtomicBool,
}

impl TenantStore {
    fn open(id: &str, path: &Path) -> DbResult<Self> {
        let db = sled::open(path)?;
        db.open_tree(COLLECTIONS_TREE)?;
        Ok(Self {
            id: id.to_string(),
            db,
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Exclusive write section for this tenant. Held across
    /// validate, write and quota update.
    pub fn lock(&self) -> DbResult<MutexGuard<'_, ()>> {
        let guard = self.write_lock.lock();
        self.ensure_open()?;
        Ok(guard)
    }

    fn ensure_open(&self) -> DbResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DbError::tenant_not_found(&self.id));
        }
        Ok(())
    }

    /// Monotonic per-tenant sequence used to order documents created in the
    /// same instant.
    pub fn next_seq(&self) -> DbResult<u64> {
        Ok(self.db.generate_id()?)
    }

    pub fn has_collection(&self, name: &str) -> DbResult<bool> {
        self.ensure_open()?;
        Ok(self.db.open_tree(COLLECTIONS_TREE)?.contains_key(name.as_bytes())?)
    }

    /// Create the collection tree and register it. Idempotent.
    pub fn create_collection(&self, name: &str) -> DbResult<()> {
        self.ensure_open()?;
        let tree_name = sanitize::safe_identifier(name)?;
        self.db.open_tree(tree_name.as_bytes())?;
        let created_at = serde_json::to_vec(&Utc::now())?;
        self.db
            .open_tree(COLLECTIONS_TREE)?
            .insert(name.as_bytes(), created_at)?;
        debug!(tenant = %self.id, collection = name, "collection provisioned");
        Ok(())
    }

    /// Drop the collection tree and its registration. Returns the summed size of
    /// every document that was dropped.
    pub fn drop_collection(&self, name: &str) -> DbResult<u64> {
        self.ensure_open()?;
        let tree_name = sanitize::safe_identifier(name)?;
        let mut freed = 0;
        for doc in self.scan(name)? {
            freed += doc.size();
        }
        self.db.drop_tree(tree_name.as_bytes())?;
        self.db
            .open_tree(COLLECTIONS_TREE)?
            .remove(name.as_bytes())?;
        debug!(tenant = %self.id, collection = name, freed, "collection dropped");
        Ok(freed)
    }

    fn collection(&self, name: &str) -> DbResult<sled::Tree> {
        self.ensure_open()?;
        if !self.has_collection(name)? {
            return Err(DbError::schema_not_found(name));
        }
        let tree_name = sanitize::safe_identifier(name)?;
        Ok(self.db.open_tree(tree_name.as_bytes())?)
    }

    /// Insert a new document. An id that is already taken surfaces as a
    /// retryable generation failure.
    pub fn insert_document(&self, collection: &str, doc: &StoredDocument) -> DbResult<()> {
        let tree = self.collection(collection)?;
        let bytes = serde_json::to_vec(doc)?;
        tree.compare_and_swap(doc.id.as_bytes(), None as Option<&[u8]>, Some(bytes))?
            .map_err(|_| {
                DbError::GenerationFailure(format!("document id collision: {}", doc.id))
            })?;
        Ok(())
    }

    /// Overwrite a document, returning the prior version.
    pub fn put_document(
        &self,
        collection: &str,
        doc: &StoredDocument,
    ) -> DbResult<Option<StoredDocument>> {
        let tree = self.collection(collection)?;
        let bytes = serde_json::to_vec(doc)?;
        match tree.insert(doc.id.as_bytes(), bytes)? {
            Some(old) => Ok(Some(serde_json::from_slice(&old)?)),
            None => Ok(None),
        }
    }

    pub fn get_document(&self, collection: &str, id: &str) -> DbResult<Option<StoredDocument>> {
        let tree = self.collection(collection)?;
        match tree.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn remove_document(&self, collection: &str, id: &str) -> DbResult<Option<StoredDocument>> {
        let tree = self.collection(collection)?;
        match tree.remove(id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every document in a collection, unordered.
    pub fn scan(&self, collection: &str) -> DbResult<Vec<StoredDocument>> {
        let tree = self.collection(collection)?;
        let mut docs = vec![];
        for item in tree.iter() {
            let (_, value) = item?;
            docs.push(serde_json::from_slice(&value)?);
        }
        Ok(docs)
    }
}

/// Handles kept open when nothing else is using them.
pub const DEFAULT_POOL_CAPACITY: usize = 64;

struct PoolEntry {
    store: Arc<TenantStore>,
    last_used: u64,
}

/// Registry of tenant storage units, one Sled database per tenant at
/// `<base_dir>/<tenant id>.db`. Handles are opened lazily and pooled. Past
/// `capacity` the least recently used handles that no caller holds are
/// closed; a held handle is never closed, so a tenant has one handle at a time.
pub struct StoragePool {
    base_dir: PathBuf,
    capacity: usize,
    open: Mutex<Pool>,
}

#[derive(Default)]
struct Pool {
    entries: HashMap<String, PoolEntry>,
    clock: u64,
}

impl Pool {
    fn checkout(&mut self, tenant_id: &str) -> Option<Arc<TenantStore>> {
        self.clock += 1;
        let clock = self.clock;
        self.entries.get_mut(tenant_id).map(|entry| {
            entry.last_used = clock;
            entry.store.clone()
        })
    }

    fn admit(&mut self, store: Arc<TenantStore>, capacity: usize) {
        self.clock += 1;
        self.entries.insert(
            store.id().to_string(),
            PoolEntry {
                store,
                last_used: self.clock,
            },
        );
        self.evict_idle(capacity);
    }

    fn evict_idle(&mut self, capacity: usize) {
        while self.entries.len() > capacity {
            let victim = self
                .entries
                .iter()
                .filter(|(_, entry)| Arc::strong_count(&entry.store) == 1)
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(id, _)| id.clone());
            let Some(id) = victim else {
                return;
            };
            self.entries.remove(&id);
            debug!(tenant = %id, "idle tenant storage closed");
        }
    }
}

impl StoragePool {
    pub fn new(base_dir: impl Into<PathBuf>) -> DbResult<Self> {
        Self::with_capacity(base_dir, DEFAULT_POOL_CAPACITY)
    }

    pub fn with_capacity(base_dir: impl Into<PathBuf>, capacity: usize) -> DbResult<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir,
            capacity: capacity.max(1),
            open: Mutex::new(Pool::default()),
        })
    }

    pub fn path_for(&self, tenant_id: &str) -> PathBuf {
        self.base_dir.join(format!("{}.db", tenant_id))
    }

    /// Number of handles currently open.
    pub fn open_count(&self) -> usize {
        self.open.lock().entries.len()
    }

    /// Create empty storage for a new tenant.
    pub fn provision(&self, tenant_id: &str) -> DbResult<Arc<TenantStore>> {
        let mut pool = self.open.lock();
        let store = Arc::new(TenantStore::open(tenant_id, &self.path_for(tenant_id))?);
        pool.admit(store.clone(), self.capacity);
        info!(tenant = tenant_id, "tenant storage provisioned");
        Ok(store)
    }

    /// Handle for an existing tenant, opening it on first use.
    pub fn get(&self, tenant_id: &str) -> DbResult<Arc<TenantStore>> {
        let mut pool = self.open.lock();
        if let Some(store) = pool.checkout(tenant_id) {
            return Ok(store);
        }
        let path = self.path_for(tenant_id);
        if !path.exists() {
            return Err(DbError::tenant_not_found(tenant_id));
        }
        let store = Arc::new(TenantStore::open(tenant_id, &path)?);
        pool.admit(store.clone(), self.capacity);
        Ok(store)
    }

    /// Close the tenant's handle and delete its files. Missing storage is not
    /// an error. The registry lock is held throughout so the storage cannot be
    /// reopened halfway through deletion.
    pub fn destroy(&self, tenant_id: &str) -> DbResult<()> {
        let mut pool = self.open.lock();
        if let Some(entry) = pool.entries.remove(tenant_id) {
            let _guard = entry.store.write_lock.lock();
            entry.store.closed.store(true, Ordering::Release);
        }

        let path = self.path_for(tenant_id);
        match fs::remove_dir_all(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(tenant = tenant_id, "tenant storage removed");
        Ok(())
    }
}
