//! Tenant catalog: the system of record for databases, capability keys and
//! collection schemas.
//!
//! The catalog is one Sled database with four trees:
//! - `tenants`: tenant id -> JSON [`Tenant`] record (quota, timestamps)
//! - `write_keys` / `read_keys`: capability key -> tenant id, which is also
//!   what keeps keys unique
//! - `schemas`: `<tenant id>/<collection>` -> JSON [`Schema`]
//!
//! Each tenant additionally owns a storage unit in the [`StoragePool`]. Steps
//! that span the catalog and a storage unit are compensated when the second
//! step fails; a failed compensation is logged and the triggering error is returned.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sled::transaction::{ConflictableTransactionError, TransactionResult};
use sled::Transactional;
use tracing::{error, info, warn};

use crate::error::{DbError, DbResult};
use crate::events::{Broadcaster, Change, ChangeEvent};
use crate::keygen;
use crate::models::{Capability, CreatedDatabase, DatabaseInfo, Resolved, Schema, Tenant};
use crate::sanitize;
use crate::storage::{StoragePool, TenantStore};
use crate::validation;

fn abort<E: Into<DbError>>(err: E) -> ConflictableTransactionError<DbError> {
    ConflictableTransactionError::Abort(err.into())
}

fn schema_key(tenant_id: &str, name: &str) -> String {
    format!("{}/{}", tenant_id, name)
}

pub struct Catalog {
    tenants: sled::Tree,
    write_keys: sled::Tree,
    read_keys: sled::Tree,
    schemas: sled::Tree,
    storage: StoragePool,
    default_quota: u64,
    broadcaster: Broadcaster,
}

impl Catalog {
    /// Open or create the catalog at `catalog_path`, keeping tenant storage
    /// units under `data_dir`. New tenants get `default_quota` bytes.
    pub fn open(
        catalog_path: impl AsRef<Path>,
        data_dir: impl AsRef<Path>,
        default_quota: u64,
        broadcaster: Broadcaster,
    ) -> DbResult<Self> {
        let storage = StoragePool::new(data_dir.as_ref())?;
        Self::with_storage(catalog_path, storage, default_quota, broadcaster)
    }

    /// Like [`Catalog::open`] over an already configured storage pool.
    pub fn with_storage(
        catalog_path: impl AsRef<Path>,
        storage: StoragePool,
        default_quota: u64,
        broadcaster: Broadcaster,
    ) -> DbResult<Self> {
        let db = sled::open(catalog_path.as_ref())?;
        Ok(Self {
            tenants: db.open_tree("tenants")?,
            write_keys: db.open_tree("write_keys")?,
            read_keys: db.open_tree("read_keys")?,
            schemas: db.open_tree("schemas")?,
            storage,
            default_quota,
            broadcaster,
        })
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// Create a database: catalog record plus empty storage. If the storage
    /// cannot be provisioned the record is removed again.
    pub fn create_tenant(&self) -> DbResult<CreatedDatabase> {
        let id = keygen::database_id()?;
        let write_key = keygen::write_key()?;
        let read_key = keygen::read_key()?;

        let now = Utc::now();
        let tenant = Tenant {
            id: id.clone(),
            write_key: write_key.clone(),
            read_key: read_key.clone(),
            created_at: now,
            last_accessed: now,
            quota_used: 0,
            quota_limit: self.default_quota,
        };
        let record = serde_json::to_vec(&tenant)?;

        let result: TransactionResult<(), DbError> =
            (&self.tenants, &self.write_keys, &self.read_keys).transaction(
                |(tenants, write_keys, read_keys)| {
                    if tenants.get(id.as_bytes())?.is_some()
                        || write_keys.get(write_key.as_bytes())?.is_some()
                        || read_keys.get(read_key.as_bytes())?.is_some()
                    {
                        return Err(abort(DbError::GenerationFailure(
                            "generated identifier already in use".to_string(),
                        )));
                    }
                    tenants.insert(id.as_bytes(), record.as_slice())?;
                    write_keys.insert(write_key.as_bytes(), id.as_bytes())?;
                    read_keys.insert(read_key.as_bytes(), id.as_bytes())?;
                    Ok(())
                },
            );
        result?;

        if let Err(e) = self.storage.provision(&id) {
            if let Err(rollback) = self.remove_tenant_record(&id) {
                error!(tenant = %id, error = %rollback, "failed to roll back catalog entry");
            }
            return Err(e);
        }

        info!(tenant = %id, quota = self.default_quota, "database created");
        Ok(CreatedDatabase {
            database_id: id,
            write_key,
            read_key,
        })
    }

    /// Look a capability key up, reporting whether it grants write access.
    pub fn resolve(&self, key: &str) -> DbResult<Resolved> {
        let (tree, capability) = if key.starts_with(keygen::READ_KEY_PREFIX) {
            (&self.read_keys, Capability::Read)
        } else {
            (&self.write_keys, Capability::Write)
        };

        let not_found = || DbError::NotFound {
            what: "key",
            name: "capability key".to_string(),
        };
        let id = tree.get(key.as_bytes())?.ok_or_else(not_found)?;
        let id = String::from_utf8(id.to_vec())
            .map_err(|e| DbError::StorageFailure(format!("corrupt key index: {}", e)))?;
        let tenant = self.get_tenant(&id).map_err(|e| match e.kind() {
            crate::error::ErrorKind::NotFound => not_found(),
            _ => e,
        })?;
        Ok(Resolved { tenant, capability })
    }

    pub fn get_tenant(&self, tenant_id: &str) -> DbResult<Tenant> {
        let bytes = self
            .tenants
            .get(tenant_id.as_bytes())?
            .ok_or_else(|| DbError::tenant_not_found(tenant_id))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn info(&self, tenant_id: &str) -> DbResult<DatabaseInfo> {
        Ok(DatabaseInfo::from(&self.get_tenant(tenant_id)?))
    }

    /// Record an access. Best-effort: failures are logged and swallowed.
    pub fn touch(&self, tenant_id: &str) {
        let now = Utc::now();
        if let Err(e) = self.modify_tenant(tenant_id, |tenant| {
            tenant.last_accessed = now;
            Ok(())
        }) {
            warn!(tenant = tenant_id, error = %e, "failed to update last_accessed");
        }
    }

    /// Read-modify-write of one tenant record as a single Sled transaction.
    fn modify_tenant<F>(&self, tenant_id: &str, f: F) -> DbResult<Tenant>
    where
        F: Fn(&mut Tenant) -> DbResult<()>,
    {
        let result: TransactionResult<Tenant, DbError> = self.tenants.transaction(|tx| {
            let bytes = tx
                .get(tenant_id.as_bytes())?
                .ok_or_else(|| abort(DbError::tenant_not_found(tenant_id)))?;
            let mut tenant: Tenant = serde_json::from_slice(&bytes).map_err(abort)?;
            f(&mut tenant).map_err(ConflictableTransactionError::Abort)?;
            tx.insert(
                tenant_id.as_bytes(),
                serde_json::to_vec(&tenant).map_err(abort)?,
            )?;
            Ok(tenant)
        });
        Ok(result?)
    }

    /// Apply a quota delta atomically. Growth past the limit is rejected with
    /// nothing changed; shrinking floors at zero.
    pub(crate) fn adjust_quota(&self, tenant_id: &str, delta: i64) -> DbResult<Tenant> {
        self.modify_tenant(tenant_id, |tenant| {
            if delta >= 0 {
                let requested = delta as u64;
                let next = tenant.quota_used.saturating_add(requested);
                if next > tenant.quota_limit {
                    return Err(DbError::QuotaExceeded {
                        used: tenant.quota_used,
                        limit: tenant.quota_limit,
                        requested,
                    });
                }
                tenant.quota_used = next;
            } else {
                tenant.quota_used = tenant.quota_used.saturating_sub(delta.unsigned_abs());
            }
            Ok(())
        })
    }

    /// Undo a quota charge as compensation. Failure is logged only.
    pub(crate) fn release_quota(&self, tenant_id: &str, bytes: u64) {
        if let Err(e) = self.adjust_quota(tenant_id, -(bytes as i64)) {
            error!(
                tenant = tenant_id,
                bytes,
                error = %e,
                "failed to release quota during rollback"
            );
        }
    }

    /// Define a collection. Rejects duplicates, empty field sets and unknown
    /// field types, then provisions the collection's storage; the schema
    /// entry is removed again if provisioning fails.
    pub fn create_schema(
        &self,
        tenant_id: &str,
        name: &str,
        fields: &BTreeMap<String, String>,
    ) -> DbResult<Schema> {
        sanitize::validate(name)?;
        let fields = validation::parse_fields(fields)?;

        let store = self.storage.get(tenant_id)?;
        let _guard = store.lock()?;
        self.get_tenant(tenant_id)?;

        let schema = Schema {
            database_id: tenant_id.to_string(),
            name: name.to_string(),
            fields,
            created_at: Utc::now(),
        };
        self.commit_schema(&schema, || store.create_collection(name))?;

        info!(tenant = tenant_id, schema = name, "schema created");
        self.broadcaster.publish(ChangeEvent::new(
            tenant_id,
            name,
            Change::SchemaCreated {
                fields: schema.fields.clone(),
            },
        ));
        Ok(schema)
    }

    /// Claim the schema entry, then run `provision`. The entry is removed
    /// again if provisioning fails.
    fn commit_schema<F>(&self, schema: &Schema, provision: F) -> DbResult<()>
    where
        F: FnOnce() -> DbResult<()>,
    {
        let key = schema_key(&schema.database_id, &schema.name);
        self.schemas
            .compare_and_swap(
                key.as_bytes(),
                None as Option<&[u8]>,
                Some(serde_json::to_vec(schema)?),
            )?
            .map_err(|_| DbError::AlreadyExists {
                what: "schema",
                name: schema.name.clone(),
            })?;

        if let Err(e) = provision() {
            if let Err(rollback) = self.schemas.remove(key.as_bytes()) {
                error!(
                    tenant = %schema.database_id,
                    schema = %schema.name,
                    error = %rollback,
                    "failed to roll back schema entry"
                );
            }
            return Err(e);
        }
        Ok(())
    }

    pub fn get_schema(&self, tenant_id: &str, name: &str) -> DbResult<Schema> {
        sanitize::validate(name)?;
        let bytes = self
            .schemas
            .get(schema_key(tenant_id, name).as_bytes())?
            .ok_or_else(|| DbError::schema_not_found(name))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Every schema of a tenant, by name.
    pub fn list_schemas(&self, tenant_id: &str) -> DbResult<Vec<Schema>> {
        let prefix = schema_key(tenant_id, "");
        let mut schemas = vec![];
        for item in self.schemas.scan_prefix(prefix.as_bytes()) {
            let (_, value) = item?;
            schemas.push(serde_json::from_slice(&value)?);
        }
        Ok(schemas)
    }

    /// Remove a schema together with its collection and documents, returning
    /// the freed bytes to the tenant's quota.
    pub fn delete_schema(&self, tenant_id: &str, name: &str) -> DbResult<()> {
        sanitize::validate(name)?;
        let store = self.storage.get(tenant_id)?;
        let _guard = store.lock()?;

        let key = schema_key(tenant_id, name);
        let previous = self
            .schemas
            .remove(key.as_bytes())?
            .ok_or_else(|| DbError::schema_not_found(name))?;

        let freed = match store.drop_collection(name) {
            Ok(freed) => freed,
            Err(e) => {
                if let Err(rollback) = self.schemas.insert(key.as_bytes(), previous) {
                    error!(
                        tenant = tenant_id,
                        schema = name,
                        error = %rollback,
                        "failed to restore schema entry"
                    );
                }
                return Err(e);
            }
        };
        self.adjust_quota(tenant_id, -(freed as i64))?;

        info!(tenant = tenant_id, schema = name, freed, "schema deleted");
        self.broadcaster
            .publish(ChangeEvent::new(tenant_id, name, Change::SchemaDeleted));
        Ok(())
    }

    /// Tenants whose last access is older than `max_idle`.
    pub fn expired_tenants(&self, max_idle: Duration) -> DbResult<Vec<String>> {
        let cutoff = chrono::Duration::from_std(max_idle)
            .ok()
            .and_then(|idle| Utc::now().checked_sub_signed(idle));
        let Some(cutoff) = cutoff else {
            return Ok(vec![]);
        };

        let mut expired = vec![];
        for item in self.tenants.iter() {
            let (_, value) = item?;
            let tenant: Tenant = serde_json::from_slice(&value)?;
            if tenant.last_accessed < cutoff {
                expired.push(tenant.id);
            }
        }
        Ok(expired)
    }

    /// Delete a tenant's storage, schemas, keys and record. Deleting a tenant
    /// that is already gone succeeds.
    pub fn delete_tenant(&self, tenant_id: &str) -> DbResult<()> {
        self.storage.destroy(tenant_id)?;
        self.remove_tenant_record(tenant_id)?;

        let prefix = schema_key(tenant_id, "");
        for item in self.schemas.scan_prefix(prefix.as_bytes()).keys() {
            self.schemas.remove(item?)?;
        }
        self.broadcaster.close_tenant(tenant_id);

        info!(tenant = tenant_id, "database deleted");
        Ok(())
    }

    fn remove_tenant_record(&self, tenant_id: &str) -> DbResult<()> {
        let result: TransactionResult<(), DbError> =
            (&self.tenants, &self.write_keys, &self.read_keys).transaction(
                |(tenants, write_keys, read_keys)| {
                    let Some(bytes) = tenants.remove(tenant_id.as_bytes())? else {
                        return Ok(());
                    };
                    let tenant: Tenant = serde_json::from_slice(&bytes).map_err(abort)?;
                    write_keys.remove(tenant.write_key.as_bytes())?;
                    read_keys.remove(tenant.read_key.as_bytes())?;
                    Ok(())
                },
            );
        Ok(result?)
    }

    /// Delete every tenant idle for longer than `max_idle`. Per-tenant
    /// failures are logged and skipped. Returns how many were deleted.
    pub fn sweep_expired(&self, max_idle: Duration) -> DbResult<usize> {
        let mut deleted = 0;
        for tenant_id in self.expired_tenants(max_idle)? {
            match self.delete_tenant(&tenant_id) {
                Ok(()) => deleted += 1,
                Err(e) => {
                    error!(tenant = %tenant_id, error = %e, "failed to delete expired database")
                }
            }
        }
        if deleted > 0 {
            info!(deleted, "expired databases removed");
        }
        Ok(deleted)
    }

    /// Storage handle for an existing tenant.
    pub(crate) fn tenant_store(&self, tenant_id: &str) -> DbResult<Arc<TenantStore>> {
        self.storage.get(tenant_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::TempDir;

    fn catalog(dir: &TempDir, quota: u64) -> Catalog {
        Catalog::open(
            dir.path().join("catalog.db"),
            dir.path().join("data"),
            quota,
            Broadcaster::default(),
        )
        .unwrap()
    }

    fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_create_and_resolve_tenant() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog(&dir, 1024);
        let created = catalog.create_tenant().unwrap();
        assert_ne!(created.write_key, created.read_key);

        let by_write = catalog.resolve(&created.write_key).unwrap();
        assert_eq!(by_write.tenant.id, created.database_id);
        assert_eq!(by_write.capability, Capability::Write);
        assert_eq!(by_write.tenant.quota_used, 0);
        assert_eq!(by_write.tenant.quota_limit, 1024);

        let by_read = catalog.resolve(&created.read_key).unwrap();
        assert_eq!(by_read.tenant.id, created.database_id);
        assert!(!by_read.capability.can_write());

        let err = catalog.resolve("wk_nope").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_schema_lifecycle() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog(&dir, 1024);
        let id = catalog.create_tenant().unwrap().database_id;

        let schema = catalog
            .create_schema(&id, "users", &fields(&[("name", "string"), ("age", "number")]))
            .unwrap();
        assert_eq!(schema.fields.len(), 2);

        let err = catalog
            .create_schema(&id, "users", &fields(&[("email", "string")]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        // The first definition survives the rejected overwrite.
        assert_eq!(catalog.get_schema(&id, "users").unwrap(), schema);

        assert_eq!(catalog.list_schemas(&id).unwrap().len(), 1);
        catalog.delete_schema(&id, "users").unwrap();
        assert_eq!(
            catalog.get_schema(&id, "users").unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            catalog.delete_schema(&id, "users").unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_schema_rejections() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog(&dir, 1024);
        let id = catalog.create_tenant().unwrap().database_id;

        let err = catalog.create_schema(&id, "users", &fields(&[])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);

        let err = catalog
            .create_schema(&id, "users", &fields(&[("born", "date")]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);

        let err = catalog
            .create_schema(&id, "users; DROP TABLE x--", &fields(&[("a", "string")]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidIdentifier);

        let err = catalog
            .create_schema("db_missing", "users", &fields(&[("a", "string")]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        assert!(catalog.list_schemas(&id).unwrap().is_empty());
    }

    #[test]
    fn test_failed_provisioning_leaves_no_tenant() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog(&dir, 1024);
        let data_dir = dir.path().join("data");
        std::fs::remove_dir_all(&data_dir).unwrap();
        std::fs::write(&data_dir, b"not a directory").unwrap();

        assert!(catalog.create_tenant().is_err());
        assert!(catalog.tenants.is_empty());
        assert!(catalog.write_keys.is_empty());
        assert!(catalog.read_keys.is_empty());

        std::fs::remove_file(&data_dir).unwrap();
        std::fs::create_dir(&data_dir).unwrap();
        let created = catalog.create_tenant().unwrap();
        assert_eq!(catalog.tenants.len(), 1);
        assert!(catalog.resolve(&created.write_key).is_ok());
    }

    #[test]
    fn test_failed_collection_provisioning_removes_schema() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog(&dir, 1024);
        let id = catalog.create_tenant().unwrap().database_id;
        let schema = Schema {
            database_id: id.clone(),
            name: "users".to_string(),
            fields: validation::parse_fields(&fields(&[("name", "string")])).unwrap(),
            created_at: Utc::now(),
        };

        let err = catalog
            .commit_schema(&schema, || Err(DbError::StorageFailure("disk full".into())))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StorageFailure);
        let err = catalog.get_schema(&id, "users").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        // The name is free again.
        catalog
            .create_schema(&id, "users", &fields(&[("name", "string")]))
            .unwrap();
        assert!(catalog.tenant_store(&id).unwrap().has_collection("users").unwrap());
    }

    #[test]
    fn test_open_handles_stay_capped_across_many_tenants() {
        let dir = TempDir::new().unwrap();
        let storage = StoragePool::with_capacity(dir.path().join("data"), 4).unwrap();
        let catalog = Catalog::with_storage(
            dir.path().join("catalog.db"),
            storage,
            1024,
            Broadcaster::default(),
        )
        .unwrap();

        let ids: Vec<String> = (0..50)
            .map(|_| catalog.create_tenant().unwrap().database_id)
            .collect();
        assert!(catalog.storage.open_count() <= 4);

        for id in ids.iter().take(10) {
            catalog
                .create_schema(id, "users", &fields(&[("name", "string")]))
                .unwrap();
        }
        assert!(catalog.storage.open_count() <= 4);
        assert_eq!(catalog.list_schemas(&ids[0]).unwrap().len(), 1);
        assert!(catalog.tenant_store(&ids[0]).unwrap().has_collection("users").unwrap());
    }

    #[test]
    fn test_quota_adjustments() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog(&dir, 100);
        let id = catalog.create_tenant().unwrap().database_id;

        assert_eq!(catalog.adjust_quota(&id, 60).unwrap().quota_used, 60);
        let err = catalog.adjust_quota(&id, 41).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
        assert_eq!(catalog.get_tenant(&id).unwrap().quota_used, 60);
        assert_eq!(catalog.adjust_quota(&id, 40).unwrap().quota_used, 100);
        assert_eq!(catalog.adjust_quota(&id, -500).unwrap().quota_used, 0);
    }

    #[test]
    fn test_touch_and_expiry() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog(&dir, 100);
        let id = catalog.create_tenant().unwrap().database_id;

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(
            catalog.expired_tenants(Duration::from_millis(5)).unwrap(),
            vec![id.clone()]
        );
        assert!(catalog
            .expired_tenants(Duration::from_secs(3600))
            .unwrap()
            .is_empty());

        catalog.touch(&id);
        assert!(catalog
            .expired_tenants(Duration::from_millis(5))
            .unwrap()
            .is_empty());

        // Touching a missing tenant is swallowed.
        catalog.touch("db_missing");
    }

    #[test]
    fn test_delete_tenant_cascades_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog(&dir, 100);
        let created = catalog.create_tenant().unwrap();
        let id = created.database_id.clone();
        catalog
            .create_schema(&id, "users", &fields(&[("name", "string")]))
            .unwrap();

        catalog.delete_tenant(&id).unwrap();
        assert_eq!(catalog.get_tenant(&id).unwrap_err().kind(), ErrorKind::NotFound);
        assert!(catalog.resolve(&created.write_key).is_err());
        assert!(catalog.resolve(&created.read_key).is_err());
        assert!(catalog.list_schemas(&id).unwrap().is_empty());
        assert!(!dir.path().join("data").join(format!("{}.db", id)).exists());

        catalog.delete_tenant(&id).unwrap();
    }

    #[test]
    fn test_sweep_expired_deletes_idle_tenants() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog(&dir, 100);
        let idle = catalog.create_tenant().unwrap().database_id;
        std::thread::sleep(Duration::from_millis(30));
        let fresh = catalog.create_tenant().unwrap().database_id;

        assert_eq!(catalog.sweep_expired(Duration::from_millis(15)).unwrap(), 1);
        assert!(catalog.get_tenant(&idle).is_err());
        assert!(catalog.get_tenant(&fresh).is_ok());
    }

    #[tokio::test]
    async fn test_schema_events_are_published() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog(&dir, 100);
        let id = catalog.create_tenant().unwrap().database_id;
        let mut listener = catalog.broadcaster().subscribe(&id);

        catalog
            .create_schema(&id, "users", &fields(&[("name", "string")]))
            .unwrap();
        catalog.delete_schema(&id, "users").unwrap();

        let created = listener.next_event().await.unwrap();
        assert_eq!(created.event_type(), "schema_created");
        assert_eq!(created.document_id(), "");
        let deleted = listener.next_event().await.unwrap();
        assert_eq!(deleted.event_type(), "schema_deleted");
    }
}
