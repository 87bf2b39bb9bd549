/*
 * Copyright (C) 2025 The Cellar Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Storage pool manager: the single source of truth for pool existence and
//! configuration. Pool records live in the metadata store; a read-mostly
//! cache fronts it and is only ever updated through the write-through path,
//! so the cache is always a subset of committed store state.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use super::{
    new_driver, storage_type_from_string, storage_type_to_string, StorageDriver, StorageError,
    StorageType,
};
use crate::cellar::db::{MetaStore, PoolRecord, PoolStatus};
use crate::cellar::logger::{log_info, log_warn};

const COMPONENT: &str = "storage.pool";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoragePool {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub driver: StorageType,
    pub status: PoolStatus,
    pub config: HashMap<String, String>,
}

impl StoragePool {
    fn from_record(record: PoolRecord) -> Result<Self, StorageError> {
        Ok(Self {
            driver: storage_type_from_string(&record.driver)?,
            id: record.id,
            name: record.name,
            description: record.description,
            status: record.status,
            config: record.config,
        })
    }

    fn to_record(&self) -> PoolRecord {
        PoolRecord {
            id: self.id,
            name: self.name.clone(),
            description: self.description.clone(),
            driver: storage_type_to_string(self.driver).to_string(),
            status: self.status,
            config: self.config.clone(),
        }
    }
}

pub struct PoolManager {
    store: Arc<MetaStore>,
    storage_root: PathBuf,
    cache: RwLock<HashMap<String, Arc<StoragePool>>>,
    drivers: Mutex<HashMap<StorageType, Arc<dyn StorageDriver>>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PoolManager {
    pub fn new(store: Arc<MetaStore>, storage_root: PathBuf) -> Self {
        Self {
            store,
            storage_root,
            cache: RwLock::new(HashMap::new()),
            drivers: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<MetaStore> {
        &self.store
    }

    /// One shared driver instance per variant and manager.
    pub fn driver_for(&self, storage_type: StorageType) -> Result<Arc<dyn StorageDriver>, StorageError> {
        let mut drivers = lock_plain(&self.drivers);
        if let Some(driver) = drivers.get(&storage_type) {
            return Ok(Arc::clone(driver));
        }
        let driver = new_driver(storage_type, self.storage_root.clone())?;
        drivers.insert(storage_type, Arc::clone(&driver));
        Ok(driver)
    }

    /// Named lock serializing mutating operations against one pool. Distinct
    /// pools proceed fully in parallel.
    pub fn lock_pool(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = lock_plain(&self.locks);
        Arc::clone(
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Insert the pool record within one transaction and publish it to the
    /// cache only after a successful commit. A failed transaction leaves the
    /// cache untouched, so a cached pool is always durably persisted.
    pub fn create_and_update_cache(
        &self,
        name: &str,
        description: &str,
        driver_tag: &str,
        config: &HashMap<String, String>,
    ) -> Result<i64, StorageError> {
        let lock = self.lock_pool(name);
        let _guard = lock_guard(&lock);
        self.create_record(name, description, driver_tag, config)
    }

    /// Caller must hold the pool's named lock: the duplicate-name check and
    /// the commit have to be one atomic step, or two racing creates could
    /// both pass the check.
    fn create_record(
        &self,
        name: &str,
        description: &str,
        driver_tag: &str,
        config: &HashMap<String, String>,
    ) -> Result<i64, StorageError> {
        if name.is_empty() {
            return Err(StorageError::InvalidConfig(
                "Pool name may not be empty".to_string(),
            ));
        }
        if self.get(name)?.is_some() {
            return Err(StorageError::AlreadyExists(format!("Pool '{}'", name)));
        }

        let storage_type = storage_type_from_string(driver_tag)?;
        let driver = self.driver_for(storage_type)?;
        driver.validate_config(config)?;

        let id = self.store.next_pool_id().map_err(store_err)?;
        let pool = StoragePool {
            id,
            name: name.to_string(),
            description: description.to_string(),
            driver: storage_type,
            status: PoolStatus::Pending,
            config: config.clone(),
        };

        let mut tx = self.store.begin().map_err(store_err)?;
        tx.put_pool(pool.to_record());
        tx.commit().map_err(store_err)?;

        self.publish(pool);
        log_info(
            COMPONENT,
            "pool record created",
            &[("pool", name), ("driver", driver_tag)],
        );
        Ok(id)
    }

    /// Full pool creation: metadata first, then the backend, flipping the
    /// status to Created through the same write-through path. A failing
    /// backend call removes the record again so no orphaned metadata
    /// remains. The named lock spans the whole operation, so a racing
    /// create of the same name can never interleave with the cleanup.
    pub fn create_pool(
        &self,
        name: &str,
        description: &str,
        driver_tag: &str,
        config: &HashMap<String, String>,
    ) -> Result<i64, StorageError> {
        let lock = self.lock_pool(name);
        let _guard = lock_guard(&lock);

        let id = self.create_record(name, description, driver_tag, config)?;

        let pool = self
            .get(name)?
            .ok_or_else(|| StorageError::NotFound(format!("Pool '{}'", name)))?;
        let driver = self.driver_for(pool.driver)?;

        if let Err(error) = driver.create_pool(name, config) {
            log_warn(
                COMPONENT,
                "backend pool creation failed, removing record",
                &[("pool", name), ("error", &error.to_string())],
            );
            let mut tx = self.store.begin().map_err(store_err)?;
            tx.delete_pool(name);
            tx.commit().map_err(store_err)?;
            self.evict(name);
            return Err(StorageError::Backend(error.to_string()));
        }

        self.set_status(name, PoolStatus::Created)?;
        Ok(id)
    }

    /// Cache-first lookup with lazy fill from the store, so the cache
    /// degrades gracefully after a process restart.
    pub fn get(&self, name: &str) -> Result<Option<Arc<StoragePool>>, StorageError> {
        if let Some(pool) = self
            .cache
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
        {
            return Ok(Some(Arc::clone(pool)));
        }

        let record = self.store.pool_record(name).map_err(store_err)?;
        match record {
            Some(record) => {
                let pool = StoragePool::from_record(record)?;
                Ok(Some(self.publish(pool)))
            }
            None => Ok(None),
        }
    }

    pub fn pool_names(&self) -> Result<Vec<String>, StorageError> {
        self.store.pool_names().map_err(store_err)
    }

    pub fn update_description(&self, name: &str, description: &str) -> Result<(), StorageError> {
        let lock = self.lock_pool(name);
        let _guard = lock_guard(&lock);

        let pool = self
            .get(name)?
            .ok_or_else(|| StorageError::NotFound(format!("Pool '{}'", name)))?;
        let mut updated = (*pool).clone();
        updated.description = description.to_string();

        let mut tx = self.store.begin().map_err(store_err)?;
        tx.put_pool(updated.to_record());
        tx.commit().map_err(store_err)?;
        self.publish(updated);
        Ok(())
    }

    /// Delete a pool with no dependent volumes. The backend delete is
    /// idempotent, so a retry after a partial failure converges.
    pub fn delete_pool(&self, name: &str) -> Result<(), StorageError> {
        let lock = self.lock_pool(name);
        let _guard = lock_guard(&lock);

        let pool = self
            .get(name)?
            .ok_or_else(|| StorageError::NotFound(format!("Pool '{}'", name)))?;

        let volumes = self.store.volume_names(name).map_err(store_err)?;
        if !volumes.is_empty() {
            return Err(StorageError::InUse(format!(
                "Pool '{}' with {} volume(s)",
                name,
                volumes.len()
            )));
        }

        let driver = self.driver_for(pool.driver)?;
        driver
            .delete_pool(name)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let mut tx = self.store.begin().map_err(store_err)?;
        tx.delete_pool(name);
        tx.commit().map_err(store_err)?;
        self.evict(name);
        log_info(COMPONENT, "pool deleted", &[("pool", name)]);
        Ok(())
    }

    fn set_status(&self, name: &str, status: PoolStatus) -> Result<(), StorageError> {
        let pool = self
            .get(name)?
            .ok_or_else(|| StorageError::NotFound(format!("Pool '{}'", name)))?;
        let mut updated = (*pool).clone();
        updated.status = status;

        let mut tx = self.store.begin().map_err(store_err)?;
        tx.put_pool(updated.to_record());
        tx.commit().map_err(store_err)?;
        self.publish(updated);
        Ok(())
    }

    /// Publish a pool into the cache. Exclusive access is held only for the
    /// instant of the insert.
    fn publish(&self, pool: StoragePool) -> Arc<StoragePool> {
        let pool = Arc::new(pool);
        self.cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(pool.name.clone(), Arc::clone(&pool));
        pool
    }

    fn evict(&self, name: &str) {
        self.cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(name);
    }
}

fn store_err(error: Box<dyn std::error::Error + Send + Sync>) -> StorageError {
    StorageError::Store(error.to_string())
}

fn lock_plain<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock_guard(lock: &Arc<Mutex<()>>) -> MutexGuard<'_, ()> {
    lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
