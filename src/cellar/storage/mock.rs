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

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{StorageDriver, StorageError, StorageType};

#[derive(Debug, Default)]
struct MockVolume {
    size_bytes: u64,
    mounted: bool,
    snapshots: HashSet<String>,
}

#[derive(Debug, Default)]
struct MockState {
    pools: HashSet<String>,
    volumes: HashMap<(String, String), MockVolume>,
    operations: Vec<String>,
}

/// Deterministic in-memory driver for tests. Performs no real I/O; every
/// invocation is appended to an operations log and mount paths are
/// synthetic.
#[derive(Debug)]
pub struct MockDriver {
    root: PathBuf,
    state: Mutex<MockState>,
}

impl MockDriver {
    pub fn construct(root: PathBuf) -> Arc<dyn StorageDriver> {
        Arc::new(Self {
            root,
            state: Mutex::new(MockState::default()),
        })
    }

    /// Every driver invocation so far, in call order.
    pub fn operations(&self) -> Vec<String> {
        self.lock_state().operations.clone()
    }

    pub fn volume_size(&self, pool: &str, name: &str) -> Option<u64> {
        self.lock_state()
            .volumes
            .get(&(pool.to_string(), name.to_string()))
            .map(|v| v.size_bytes)
    }

    fn lock_state(&self) -> MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn synthetic_mount(&self, pool: &str, name: &str) -> PathBuf {
        self.root.join("mock").join(pool).join(name)
    }
}

impl StorageDriver for MockDriver {
    fn storage_type(&self) -> StorageType {
        StorageType::Mock
    }

    fn validate_config(&self, config: &HashMap<String, String>) -> Result<(), StorageError> {
        match config.keys().next() {
            None => Ok(()),
            Some(key) => Err(StorageError::InvalidConfig(format!(
                "Unknown configuration key '{}' for mock storage",
                key
            ))),
        }
    }

    fn create_pool(
        &self,
        name: &str,
        config: &HashMap<String, String>,
    ) -> Result<(), StorageError> {
        self.validate_config(config)?;
        let mut state = self.lock_state();
        state.operations.push(format!("create_pool {}", name));
        if !state.pools.insert(name.to_string()) {
            return Err(StorageError::AlreadyExists(format!("Pool '{}'", name)));
        }
        Ok(())
    }

    fn delete_pool(&self, name: &str) -> Result<(), StorageError> {
        let mut state = self.lock_state();
        state.operations.push(format!("delete_pool {}", name));
        // Absent pools are tolerated for partial-failure recovery.
        state.pools.remove(name);
        state.volumes.retain(|(pool, _), _| pool != name);
        Ok(())
    }

    fn create_volume(
        &self,
        pool: &str,
        name: &str,
        size_bytes: u64,
        source_snapshot: Option<&str>,
    ) -> Result<(), StorageError> {
        let mut state = self.lock_state();
        state
            .operations
            .push(format!("create_volume {}/{}", pool, name));
        if !state.pools.contains(pool) {
            return Err(StorageError::NotFound(format!("Pool '{}'", pool)));
        }
        if let Some(source) = source_snapshot {
            let (volume, snapshot) = source.split_once('@').ok_or_else(|| {
                StorageError::InvalidConfig(format!(
                    "Snapshot source '{}' must use the volume@snapshot form",
                    source
                ))
            })?;
            let known = state
                .volumes
                .get(&(pool.to_string(), volume.to_string()))
                .map(|v| v.snapshots.contains(snapshot))
                .unwrap_or(false);
            if !known {
                return Err(StorageError::NotFound(format!(
                    "Snapshot '{}/{}'",
                    pool, source
                )));
            }
        }
        let key = (pool.to_string(), name.to_string());
        if state.volumes.contains_key(&key) {
            return Err(StorageError::AlreadyExists(format!(
                "Volume '{}/{}'",
                pool, name
            )));
        }
        state.volumes.insert(
            key,
            MockVolume {
                size_bytes,
                ..MockVolume::default()
            },
        );
        Ok(())
    }

    fn delete_volume(&self, pool: &str, name: &str) -> Result<(), StorageError> {
        let mut state = self.lock_state();
        state
            .operations
            .push(format!("delete_volume {}/{}", pool, name));
        state.volumes.remove(&(pool.to_string(), name.to_string()));
        Ok(())
    }

    fn mount_volume(&self, pool: &str, name: &str) -> Result<PathBuf, StorageError> {
        let mut state = self.lock_state();
        state
            .operations
            .push(format!("mount_volume {}/{}", pool, name));
        let volume = state
            .volumes
            .get_mut(&(pool.to_string(), name.to_string()))
            .ok_or_else(|| StorageError::NotFound(format!("Volume '{}/{}'", pool, name)))?;
        volume.mounted = true;
        Ok(self.synthetic_mount(pool, name))
    }

    fn unmount_volume(&self, pool: &str, name: &str) -> Result<(), StorageError> {
        let mut state = self.lock_state();
        state
            .operations
            .push(format!("unmount_volume {}/{}", pool, name));
        if let Some(volume) = state.volumes.get_mut(&(pool.to_string(), name.to_string())) {
            volume.mounted = false;
        }
        Ok(())
    }

    fn resize_volume(&self, pool: &str, name: &str, size_bytes: u64) -> Result<(), StorageError> {
        let mut state = self.lock_state();
        state
            .operations
            .push(format!("resize_volume {}/{}", pool, name));
        let volume = state
            .volumes
            .get_mut(&(pool.to_string(), name.to_string()))
            .ok_or_else(|| StorageError::NotFound(format!("Volume '{}/{}'", pool, name)))?;
        volume.size_bytes = size_bytes;
        Ok(())
    }

    fn snapshot_volume(&self, pool: &str, name: &str, snapshot: &str) -> Result<(), StorageError> {
        let mut state = self.lock_state();
        state
            .operations
            .push(format!("snapshot_volume {}/{}@{}", pool, name, snapshot));
        let volume = state
            .volumes
            .get_mut(&(pool.to_string(), name.to_string()))
            .ok_or_else(|| StorageError::NotFound(format!("Volume '{}/{}'", pool, name)))?;
        if !volume.snapshots.insert(snapshot.to_string()) {
            return Err(StorageError::AlreadyExists(format!(
                "Snapshot '{}/{}@{}'",
                pool, name, snapshot
            )));
        }
        Ok(())
    }

    fn list_snapshots(&self, pool: &str, name: &str) -> Result<Vec<String>, StorageError> {
        let state = self.lock_state();
        let volume = state
            .volumes
            .get(&(pool.to_string(), name.to_string()))
            .ok_or_else(|| StorageError::NotFound(format!("Volume '{}/{}'", pool, name)))?;
        let mut names: Vec<String> = volume.snapshots.iter().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn is_mounted(&self, pool: &str, name: &str) -> bool {
        self.lock_state()
            .volumes
            .get(&(pool.to_string(), name.to_string()))
            .map(|v| v.mounted)
            .unwrap_or(false)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
