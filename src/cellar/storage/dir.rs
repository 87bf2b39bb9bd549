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

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{StorageDriver, StorageError, StorageType};
use crate::cellar::logger::log_info;

const VOLUMES_DIR: &str = "volumes";
const META_DIR: &str = "meta";
const SNAPSHOTS_DIR: &str = "snapshots";
const COMPONENT: &str = "storage.dir";

#[derive(Debug, Serialize, Deserialize)]
struct DirVolumeMeta {
    size_bytes: u64,
}

/// Directory-backed driver. Pools are directories under the storage root,
/// volumes are plain subdirectories and "mounting" resolves to the volume
/// path itself. Sizes are recorded but not enforced; the dir backend has no
/// quota mechanism.
#[derive(Debug)]
pub struct DirDriver {
    root: PathBuf,
}

impl DirDriver {
    pub fn construct(root: PathBuf) -> Arc<dyn StorageDriver> {
        Arc::new(Self { root })
    }

    fn pool_path(&self, pool: &str) -> PathBuf {
        self.root.join(pool)
    }

    fn volume_path(&self, pool: &str, name: &str) -> PathBuf {
        self.pool_path(pool).join(VOLUMES_DIR).join(name)
    }

    fn meta_path(&self, pool: &str, name: &str) -> PathBuf {
        self.pool_path(pool)
            .join(META_DIR)
            .join(format!("{}.json", name))
    }

    fn snapshot_path(&self, pool: &str, name: &str, snapshot: &str) -> PathBuf {
        self.pool_path(pool)
            .join(SNAPSHOTS_DIR)
            .join(name)
            .join(snapshot)
    }

    fn write_meta(&self, pool: &str, name: &str, size_bytes: u64) -> Result<(), StorageError> {
        let path = self.meta_path(pool, name);
        let encoded = serde_json::to_vec(&DirVolumeMeta { size_bytes })
            .map_err(|e| StorageError::Backend(format!("Failed to encode volume meta: {}", e)))?;
        fs::write(&path, encoded).map_err(|e| backend_io("write volume meta", &path, e))
    }
}

fn backend_io(action: &str, path: &Path, error: std::io::Error) -> StorageError {
    StorageError::Backend(format!("Failed to {} '{}': {}", action, path.display(), error))
}

fn copy_tree(src: &Path, dst: &Path) -> Result<(), StorageError> {
    let metadata =
        fs::symlink_metadata(src).map_err(|e| backend_io("inspect source entry", src, e))?;
    let file_type = metadata.file_type();

    if file_type.is_dir() {
        fs::create_dir_all(dst).map_err(|e| backend_io("create directory", dst, e))?;
        let entries = fs::read_dir(src).map_err(|e| backend_io("traverse directory", src, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| backend_io("iterate directory", src, e))?;
            copy_tree(&entry.path(), &dst.join(entry.file_name()))?;
        }
    } else if file_type.is_symlink() {
        let target = fs::read_link(src).map_err(|e| backend_io("read symlink", src, e))?;
        symlink(&target, dst).map_err(|e| backend_io("copy symlink", dst, e))?;
    } else {
        fs::copy(src, dst).map_err(|e| backend_io("copy file", src, e))?;
    }
    Ok(())
}

fn remove_tree(path: &Path) -> Result<(), StorageError> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(backend_io("inspect", path, e)),
    };
    let result = if metadata.file_type().is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(backend_io("remove", path, e)),
    }
}

/// Parse a `"volume@snapshot"` clone source.
fn parse_snapshot_source(source: &str) -> Result<(&str, &str), StorageError> {
    source.split_once('@').ok_or_else(|| {
        StorageError::InvalidConfig(format!(
            "Snapshot source '{}' must use the volume@snapshot form",
            source
        ))
    })
}

impl StorageDriver for DirDriver {
    fn storage_type(&self) -> StorageType {
        StorageType::Dir
    }

    fn validate_config(&self, config: &HashMap<String, String>) -> Result<(), StorageError> {
        for key in config.keys() {
            if key != "source" {
                return Err(StorageError::InvalidConfig(format!(
                    "Unknown configuration key '{}' for dir storage",
                    key
                )));
            }
        }
        if let Some(source) = config.get("source") {
            if !source.starts_with('/') {
                return Err(StorageError::InvalidConfig(format!(
                    "Pool source '{}' must be an absolute path",
                    source
                )));
            }
        }
        Ok(())
    }

    fn create_pool(
        &self,
        name: &str,
        config: &HashMap<String, String>,
    ) -> Result<(), StorageError> {
        self.validate_config(config)?;
        let path = self.pool_path(name);
        if path.symlink_metadata().is_ok() {
            return Err(StorageError::AlreadyExists(format!(
                "Pool path '{}'",
                path.display()
            )));
        }

        if let Some(source) = config.get("source") {
            let source = PathBuf::from(source);
            fs::create_dir_all(&source).map_err(|e| backend_io("create pool source", &source, e))?;
            symlink(&source, &path).map_err(|e| backend_io("link pool source", &path, e))?;
        }
        for sub in [VOLUMES_DIR, META_DIR, SNAPSHOTS_DIR] {
            let dir = path.join(sub);
            fs::create_dir_all(&dir).map_err(|e| backend_io("create pool directory", &dir, e))?;
        }
        log_info(COMPONENT, "pool created", &[("pool", name)]);
        Ok(())
    }

    fn delete_pool(&self, name: &str) -> Result<(), StorageError> {
        let path = self.pool_path(name);
        let metadata = match path.symlink_metadata() {
            Ok(metadata) => metadata,
            // Deleting an absent pool is a no-op success.
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(backend_io("inspect pool", &path, e)),
        };
        if metadata.file_type().is_symlink() {
            let target = fs::read_link(&path).map_err(|e| backend_io("read pool link", &path, e))?;
            remove_tree(&target)?;
            fs::remove_file(&path).map_err(|e| backend_io("remove pool link", &path, e))?;
        } else {
            remove_tree(&path)?;
        }
        log_info(COMPONENT, "pool deleted", &[("pool", name)]);
        Ok(())
    }

    fn create_volume(
        &self,
        pool: &str,
        name: &str,
        size_bytes: u64,
        source_snapshot: Option<&str>,
    ) -> Result<(), StorageError> {
        if !self.pool_path(pool).join(VOLUMES_DIR).is_dir() {
            return Err(StorageError::NotFound(format!("Pool '{}'", pool)));
        }
        let path = self.volume_path(pool, name);
        if path.exists() {
            return Err(StorageError::AlreadyExists(format!(
                "Volume '{}/{}'",
                pool, name
            )));
        }

        match source_snapshot {
            Some(source) => {
                let (volume, snapshot) = parse_snapshot_source(source)?;
                let snapshot_path = self.snapshot_path(pool, volume, snapshot);
                if !snapshot_path.is_dir() {
                    return Err(StorageError::NotFound(format!(
                        "Snapshot '{}/{}'",
                        pool, source
                    )));
                }
                copy_tree(&snapshot_path, &path)?;
            }
            None => {
                fs::create_dir_all(&path).map_err(|e| backend_io("create volume", &path, e))?;
            }
        }
        self.write_meta(pool, name, size_bytes)
    }

    fn delete_volume(&self, pool: &str, name: &str) -> Result<(), StorageError> {
        remove_tree(&self.volume_path(pool, name))?;
        remove_tree(&self.meta_path(pool, name))?;
        remove_tree(&self.pool_path(pool).join(SNAPSHOTS_DIR).join(name))
    }

    fn mount_volume(&self, pool: &str, name: &str) -> Result<PathBuf, StorageError> {
        let path = self.volume_path(pool, name);
        if !path.is_dir() {
            return Err(StorageError::NotFound(format!("Volume '{}/{}'", pool, name)));
        }
        Ok(path)
    }

    fn unmount_volume(&self, _pool: &str, _name: &str) -> Result<(), StorageError> {
        // Directory volumes are plain paths; nothing to tear down.
        Ok(())
    }

    fn resize_volume(&self, pool: &str, name: &str, size_bytes: u64) -> Result<(), StorageError> {
        if !self.volume_path(pool, name).is_dir() {
            return Err(StorageError::NotFound(format!("Volume '{}/{}'", pool, name)));
        }
        self.write_meta(pool, name, size_bytes)
    }

    fn snapshot_volume(&self, pool: &str, name: &str, snapshot: &str) -> Result<(), StorageError> {
        let source = self.volume_path(pool, name);
        if !source.is_dir() {
            return Err(StorageError::NotFound(format!("Volume '{}/{}'", pool, name)));
        }
        let target = self.snapshot_path(pool, name, snapshot);
        if target.exists() {
            return Err(StorageError::AlreadyExists(format!(
                "Snapshot '{}/{}@{}'",
                pool, name, snapshot
            )));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| backend_io("create snapshot directory", parent, e))?;
        }
        copy_tree(&source, &target)
    }

    fn list_snapshots(&self, pool: &str, name: &str) -> Result<Vec<String>, StorageError> {
        let dir = self.pool_path(pool).join(SNAPSHOTS_DIR).join(name);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(backend_io("list snapshots in", &dir, e)),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| backend_io("walk snapshots in", &dir, e))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn is_mounted(&self, pool: &str, name: &str) -> bool {
        self.volume_path(pool, name).is_dir()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
