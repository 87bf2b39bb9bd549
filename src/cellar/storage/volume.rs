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

//! Volume lifecycle: creation, reference-counted mounts, snapshots, resize
//! and container root provisioning. When a container carries its own
//! mapping set, on-disk ownership is shifted into the namespace view after
//! mount and back to host-relative ids before unmount, so unmounted trees
//! are always host-relative.

use std::collections::HashMap;
use std::error::Error;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard};

use super::pool::PoolManager;
use super::{StorageDriver, StorageError};
use crate::cellar::db::VolumeRecord;
use crate::cellar::idmap::shift::{shift_owner, ShiftDirection};
use crate::cellar::idmap::IdmapSet;
use crate::cellar::logger::{log_debug, log_info, log_warn};
use crate::cellar::util::with_context;

const COMPONENT: &str = "storage.volume";
const SIZE_CONFIG_KEY: &str = "size";

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum VolumeType {
    Container,
    Custom,
    Image,
}

impl VolumeType {
    pub fn as_str(self) -> &'static str {
        match self {
            VolumeType::Container => "container",
            VolumeType::Custom => "custom",
            VolumeType::Image => "image",
        }
    }
}

#[derive(Debug)]
struct MountState {
    refcount: u64,
    path: PathBuf,
}

pub struct VolumeController {
    pools: Arc<PoolManager>,
    mounts: Mutex<HashMap<(String, String), MountState>>,
}

impl VolumeController {
    pub fn new(pools: Arc<PoolManager>) -> Self {
        Self {
            pools,
            mounts: Mutex::new(HashMap::new()),
        }
    }

    fn resolve(
        &self,
        pool: &str,
    ) -> Result<Arc<dyn StorageDriver>, StorageError> {
        let record = self
            .pools
            .get(pool)?
            .ok_or_else(|| StorageError::NotFound(format!("Pool '{}'", pool)))?;
        self.pools.driver_for(record.driver)
    }

    /// Create a volume: driver first, metadata second. If the metadata
    /// commit fails after the backend call succeeded the error is surfaced
    /// and the caller retries the delete; the backend delete is idempotent
    /// so the retry converges.
    pub fn create_volume(
        &self,
        pool: &str,
        name: &str,
        volume_type: VolumeType,
        size_bytes: u64,
        source_snapshot: Option<&str>,
    ) -> Result<(), StorageError> {
        let driver = self.resolve(pool)?;
        let lock = self.pools.lock_pool(pool);
        let _guard = hold(&lock);

        if self
            .pools
            .store()
            .volume_record(pool, name)
            .map_err(store_err)?
            .is_some()
        {
            return Err(StorageError::AlreadyExists(format!(
                "Volume '{}/{}'",
                pool, name
            )));
        }

        driver.create_volume(pool, name, size_bytes, source_snapshot)?;

        let mut config = HashMap::new();
        config.insert(SIZE_CONFIG_KEY.to_string(), size_bytes.to_string());
        let mut tx = self.pools.store().begin().map_err(store_err)?;
        tx.put_volume(VolumeRecord {
            name: name.to_string(),
            pool: pool.to_string(),
            volume_type: volume_type.as_str().to_string(),
            config,
        });
        if let Err(error) = tx.commit() {
            log_warn(
                COMPONENT,
                "volume metadata commit failed after backend create, retry delete",
                &[("pool", pool), ("volume", name), ("error", &error.to_string())],
            );
            return Err(store_err(error));
        }

        log_info(
            COMPONENT,
            "volume created",
            &[("pool", pool), ("volume", name), ("type", volume_type.as_str())],
        );
        Ok(())
    }

    pub fn delete_volume(&self, pool: &str, name: &str) -> Result<(), StorageError> {
        let driver = self.resolve(pool)?;
        let lock = self.pools.lock_pool(pool);
        let _guard = hold(&lock);

        if self.refcount(pool, name) > 0 {
            return Err(StorageError::InUse(format!("Volume '{}/{}'", pool, name)));
        }

        driver.delete_volume(pool, name)?;
        let mut tx = self.pools.store().begin().map_err(store_err)?;
        tx.delete_volume(pool, name);
        tx.commit().map_err(store_err)?;
        log_info(COMPONENT, "volume deleted", &[("pool", pool), ("volume", name)]);
        Ok(())
    }

    /// Reference-counted mount. Only the 0 -> 1 transition reaches the
    /// driver; later calls return the recorded path untouched. A failing
    /// driver mount leaves the refcount at 0.
    pub fn mount(&self, pool: &str, name: &str) -> Result<PathBuf, StorageError> {
        let driver = self.resolve(pool)?;
        let lock = self.pools.lock_pool(pool);
        let _guard = hold(&lock);

        let key = (pool.to_string(), name.to_string());
        {
            let mut mounts = lock_mounts(&self.mounts);
            if let Some(state) = mounts.get_mut(&key) {
                if state.refcount > 0 {
                    state.refcount += 1;
                    return Ok(state.path.clone());
                }
            }
        }

        // First reference. The map lock is dropped for the backend call so
        // mounts on other pools proceed while this one is in flight; this
        // key stays consistent because the pool lock is held.
        let path = driver.mount_volume(pool, name).map_err(|e| match e {
            StorageError::NotFound(what) => StorageError::NotFound(what),
            StorageError::Backend(detail) => StorageError::Backend(detail),
            other => StorageError::Backend(other.to_string()),
        })?;
        lock_mounts(&self.mounts).insert(
            key,
            MountState {
                refcount: 1,
                path: path.clone(),
            },
        );
        log_debug(
            COMPONENT,
            "volume mounted",
            &[("pool", pool), ("volume", name)],
        );
        Ok(path)
    }

    /// Decrement the mount refcount; only the transition to 0 reaches the
    /// driver. Unmounting more often than mounted is a no-op, never an
    /// error. Returns whether the backend unmount actually ran.
    pub fn unmount(&self, pool: &str, name: &str) -> Result<bool, StorageError> {
        let driver = self.resolve(pool)?;
        let lock = self.pools.lock_pool(pool);
        let _guard = hold(&lock);

        let key = (pool.to_string(), name.to_string());
        {
            let mut mounts = lock_mounts(&self.mounts);
            let Some(state) = mounts.get_mut(&key) else {
                return Ok(false);
            };
            match state.refcount {
                0 => return Ok(false),
                1 => {}
                _ => {
                    state.refcount -= 1;
                    return Ok(false);
                }
            }
        }

        // Last reference; backend unmount runs without the map lock. A
        // failing unmount leaves the reference in place so a retry reaches
        // the driver again.
        driver.unmount_volume(pool, name)?;
        lock_mounts(&self.mounts).remove(&key);
        log_debug(
            COMPONENT,
            "volume unmounted",
            &[("pool", pool), ("volume", name)],
        );
        Ok(true)
    }

    pub fn is_mounted(&self, pool: &str, name: &str) -> bool {
        self.refcount(pool, name) > 0
    }

    pub fn resize_volume(
        &self,
        pool: &str,
        name: &str,
        size_bytes: u64,
    ) -> Result<(), StorageError> {
        let driver = self.resolve(pool)?;
        let lock = self.pools.lock_pool(pool);
        let _guard = hold(&lock);

        driver.resize_volume(pool, name, size_bytes)?;

        let record = self
            .pools
            .store()
            .volume_record(pool, name)
            .map_err(store_err)?;
        if let Some(mut record) = record {
            record
                .config
                .insert(SIZE_CONFIG_KEY.to_string(), size_bytes.to_string());
            let mut tx = self.pools.store().begin().map_err(store_err)?;
            tx.put_volume(record);
            tx.commit().map_err(store_err)?;
        }
        Ok(())
    }

    pub fn snapshot_volume(
        &self,
        pool: &str,
        name: &str,
        snapshot: &str,
    ) -> Result<(), StorageError> {
        let driver = self.resolve(pool)?;
        let lock = self.pools.lock_pool(pool);
        let _guard = hold(&lock);
        driver.snapshot_volume(pool, name, snapshot)
    }

    pub fn volume_snapshots(&self, pool: &str, name: &str) -> Result<Vec<String>, StorageError> {
        self.resolve(pool)?.list_snapshots(pool, name)
    }

    fn refcount(&self, pool: &str, name: &str) -> u64 {
        lock_mounts(&self.mounts)
            .get(&(pool.to_string(), name.to_string()))
            .map(|state| state.refcount)
            .unwrap_or(0)
    }

    /// Provision a container's root filesystem: resolve the root disk
    /// device to its pool, create and mount the backing volume, and shift
    /// ownership into the namespace view when the container carries its own
    /// mapping set.
    pub fn provision_container_root(
        &self,
        container: &str,
        devices: &HashMap<String, HashMap<String, String>>,
        idmap: Option<&IdmapSet>,
        cancel: &AtomicBool,
    ) -> Result<PathBuf, Box<dyn Error + Send + Sync>> {
        let (_, device) = root_disk_device(devices)
            .ok_or_else(|| StorageError::InvalidConfig("No root disk device".to_string()))?;
        let pool = device
            .get("pool")
            .cloned()
            .ok_or_else(|| StorageError::InvalidConfig("Root device has no pool".to_string()))?;

        self.create_volume(&pool, container, VolumeType::Container, 0, None)?;
        let path = self.mount(&pool, container)?;

        if let Some(set) = idmap.filter(|set| !set.is_empty()) {
            shift_owner(&path, set, ShiftDirection::ToNamespace, cancel).map_err(|e| {
                with_context(
                    e,
                    format!("Failed to shift container root for '{}'", container),
                )
            })?;
        }
        Ok(path)
    }

    /// Inverse of provisioning: restore host-relative ownership, unmount
    /// and delete the backing volume.
    pub fn teardown_container_root(
        &self,
        container: &str,
        devices: &HashMap<String, HashMap<String, String>>,
        idmap: Option<&IdmapSet>,
        cancel: &AtomicBool,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let (_, device) = root_disk_device(devices)
            .ok_or_else(|| StorageError::InvalidConfig("No root disk device".to_string()))?;
        let pool = device
            .get("pool")
            .cloned()
            .ok_or_else(|| StorageError::InvalidConfig("Root device has no pool".to_string()))?;

        if self.is_mounted(&pool, container) {
            if let Some(set) = idmap.filter(|set| !set.is_empty()) {
                let path = self.mount(&pool, container)?;
                let shifted = shift_owner(&path, set, ShiftDirection::ToHost, cancel);
                self.unmount(&pool, container)?;
                shifted.map_err(|e| {
                    with_context(
                        e,
                        format!("Failed to restore host ownership for '{}'", container),
                    )
                })?;
            }
            // Drain any outstanding references before deletion.
            while self.is_mounted(&pool, container) {
                self.unmount(&pool, container)?;
            }
        }

        self.delete_volume(&pool, container)?;
        Ok(())
    }
}

/// Recognize the root filesystem device in a device map: `type="disk"`,
/// `path="/"` and a `pool` reference.
pub fn root_disk_device(
    devices: &HashMap<String, HashMap<String, String>>,
) -> Option<(&str, &HashMap<String, String>)> {
    devices
        .iter()
        .find(|(_, attrs)| {
            attrs.get("type").map(String::as_str) == Some("disk")
                && attrs.get("path").map(String::as_str) == Some("/")
                && attrs.contains_key("pool")
        })
        .map(|(name, attrs)| (name.as_str(), attrs))
}

fn store_err(error: Box<dyn Error + Send + Sync>) -> StorageError {
    StorageError::Store(error.to_string())
}

fn hold(lock: &Arc<Mutex<()>>) -> MutexGuard<'_, ()> {
    lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock_mounts(
    mounts: &Mutex<HashMap<(String, String), MountState>>,
) -> MutexGuard<'_, HashMap<(String, String), MountState>> {
    mounts
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
