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

pub mod dir;
pub mod mock;
pub mod pool;
pub mod volume;

use std::any::Any;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum StorageType {
    Dir,
    Btrfs,
    Lvm,
    Ceph,
    Mock,
}

/// Stable external name for each driver variant. These tags appear in
/// persisted pool records and CLI arguments; a tag is never renamed or
/// reused once released, a new variant only ever adds a new tag.
pub fn storage_type_to_string(storage_type: StorageType) -> &'static str {
    match storage_type {
        StorageType::Dir => "dir",
        StorageType::Btrfs => "btrfs",
        StorageType::Lvm => "lvm",
        StorageType::Ceph => "ceph",
        StorageType::Mock => "mock",
    }
}

pub fn storage_type_from_string(tag: &str) -> Result<StorageType, StorageError> {
    match tag {
        "dir" => Ok(StorageType::Dir),
        "btrfs" => Ok(StorageType::Btrfs),
        "lvm" => Ok(StorageType::Lvm),
        "ceph" => Ok(StorageType::Ceph),
        "mock" => Ok(StorageType::Mock),
        other => Err(StorageError::InvalidConfig(format!(
            "Unknown storage driver '{}'",
            other
        ))),
    }
}

#[derive(Debug)]
pub enum StorageError {
    /// Bad or unknown pool/volume configuration, rejected before any
    /// persisted or backend mutation.
    InvalidConfig(String),
    /// The underlying driver call failed; metadata is not persisted or has
    /// been rolled back.
    Backend(String),
    NotFound(String),
    InUse(String),
    AlreadyExists(String),
    /// Metadata store failure during a combined operation.
    Store(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::InvalidConfig(detail) => write!(f, "Invalid configuration: {}", detail),
            StorageError::Backend(detail) => write!(f, "Storage backend failure: {}", detail),
            StorageError::NotFound(what) => write!(f, "{} not found", what),
            StorageError::InUse(what) => write!(f, "{} is in use", what),
            StorageError::AlreadyExists(what) => write!(f, "{} already exists", what),
            StorageError::Store(detail) => write!(f, "Metadata store failure: {}", detail),
        }
    }
}

impl Error for StorageError {}

/// Contract every storage backend variant implements. Pool deletion of an
/// absent pool is a no-op success so partial-failure recovery can always
/// retry a delete.
pub trait StorageDriver: std::fmt::Debug + Send + Sync {
    fn storage_type(&self) -> StorageType;

    /// Schema check for this variant; unknown keys are rejected.
    fn validate_config(&self, config: &HashMap<String, String>) -> Result<(), StorageError>;

    fn create_pool(
        &self,
        name: &str,
        config: &HashMap<String, String>,
    ) -> Result<(), StorageError>;

    fn delete_pool(&self, name: &str) -> Result<(), StorageError>;

    /// When `source_snapshot` (`"volume@snapshot"`) is given, the new volume
    /// is a clone of that snapshot instead of empty.
    fn create_volume(
        &self,
        pool: &str,
        name: &str,
        size_bytes: u64,
        source_snapshot: Option<&str>,
    ) -> Result<(), StorageError>;

    fn delete_volume(&self, pool: &str, name: &str) -> Result<(), StorageError>;

    fn mount_volume(&self, pool: &str, name: &str) -> Result<PathBuf, StorageError>;

    fn unmount_volume(&self, pool: &str, name: &str) -> Result<(), StorageError>;

    fn resize_volume(&self, pool: &str, name: &str, size_bytes: u64) -> Result<(), StorageError>;

    fn snapshot_volume(&self, pool: &str, name: &str, snapshot: &str) -> Result<(), StorageError>;

    /// Snapshot names for a volume, sorted. A volume without snapshots
    /// yields an empty list.
    fn list_snapshots(&self, pool: &str, name: &str) -> Result<Vec<String>, StorageError>;

    fn is_mounted(&self, pool: &str, name: &str) -> bool;

    /// Test access to the concrete driver.
    fn as_any(&self) -> &dyn Any;
}

pub type DriverConstructor = fn(PathBuf) -> Arc<dyn StorageDriver>;

fn registry() -> &'static Mutex<HashMap<StorageType, DriverConstructor>> {
    static REGISTRY: OnceLock<Mutex<HashMap<StorageType, DriverConstructor>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut builtin: HashMap<StorageType, DriverConstructor> = HashMap::new();
        builtin.insert(StorageType::Dir, dir::DirDriver::construct);
        builtin.insert(StorageType::Mock, mock::MockDriver::construct);
        Mutex::new(builtin)
    })
}

/// Register a constructor for a driver variant. Adding a backend means
/// registering its tag here; call sites never switch on the variant.
pub fn register_driver(
    storage_type: StorageType,
    constructor: DriverConstructor,
) -> Result<(), StorageError> {
    let mut drivers = registry()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if drivers.contains_key(&storage_type) {
        return Err(StorageError::AlreadyExists(format!(
            "Storage driver '{}'",
            storage_type_to_string(storage_type)
        )));
    }
    drivers.insert(storage_type, constructor);
    Ok(())
}

/// Instantiate the driver for a tag. Tags in the name table without a
/// registered constructor are valid names whose backend is simply not
/// available in this build.
pub fn new_driver(
    storage_type: StorageType,
    storage_root: PathBuf,
) -> Result<Arc<dyn StorageDriver>, StorageError> {
    let constructor = {
        let drivers = registry()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        drivers.get(&storage_type).copied()
    };
    match constructor {
        Some(constructor) => Ok(constructor(storage_root)),
        None => Err(StorageError::Backend(format!(
            "Storage driver '{}' is not available in this build",
            storage_type_to_string(storage_type)
        ))),
    }
}
