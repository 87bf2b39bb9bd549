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

//! Metadata record store. One JSON file per record, an advisory lock file
//! guarding the root, and short-lived transactions that stage writes in
//! memory and apply them on commit. Transactions are never held open across
//! driver I/O or ownership shifts.

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::cellar::util::{new_error, with_context};

const POOLS_DIR: &str = "pools";
const VOLUMES_DIR: &str = "volumes";
const PROFILES_DIR: &str = "profiles";
const SEQUENCE_FILE: &str = "_sequence_";
const LOCK_FILE: &str = ".lock";

type DynError = Box<dyn Error + Send + Sync>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum PoolStatus {
    Pending,
    Created,
    Errored,
}

impl PoolStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PoolStatus::Pending => "pending",
            PoolStatus::Created => "created",
            PoolStatus::Errored => "errored",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PoolRecord {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub driver: String,
    pub status: PoolStatus,
    pub config: HashMap<String, String>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub name: String,
    pub pool: String,
    pub volume_type: String,
    pub config: HashMap<String, String>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub name: String,
    pub devices: HashMap<String, HashMap<String, String>>,
}

enum StagedOp {
    PutPool(PoolRecord),
    DeletePool(String),
    PutVolume(VolumeRecord),
    DeleteVolume { pool: String, name: String },
    PutProfile(ProfileRecord),
    DeleteProfile(String),
}

/// File-per-record JSON store. All commits are serialized by an internal
/// mutex; concurrent processes are excluded by the fs2 lock file.
pub struct MetaStore {
    root: PathBuf,
    commit_lock: Mutex<()>,
    _lock_file: File,
}

impl MetaStore {
    pub fn open(root: &Path) -> Result<Self, DynError> {
        for dir in [POOLS_DIR, VOLUMES_DIR, PROFILES_DIR] {
            fs::create_dir_all(root.join(dir)).map_err(|e| {
                with_context(e, format!("Failed to create metastore directory '{}'", dir))
            })?;
        }

        let lock_path = root.join(LOCK_FILE);
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| {
                with_context(
                    e,
                    format!("Failed to open metastore lock '{}'", lock_path.display()),
                )
            })?;
        lock_file.try_lock_exclusive().map_err(|e| {
            with_context(
                e,
                format!(
                    "Metastore '{}' is locked by another process",
                    root.display()
                ),
            )
        })?;

        Ok(Self {
            root: root.to_path_buf(),
            commit_lock: Mutex::new(()),
            _lock_file: lock_file,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Begin a transaction. Staged writes become visible only on commit.
    pub fn begin(&self) -> Result<Tx<'_>, DynError> {
        Ok(Tx {
            store: self,
            staged: Vec::new(),
        })
    }

    /// Next value of the persisted pool id sequence. Ids are monotonic;
    /// gaps from rolled-back transactions are fine.
    pub fn next_pool_id(&self) -> Result<i64, DynError> {
        let _guard = self.lock_commits();
        let path = self.root.join(SEQUENCE_FILE);
        let current: i64 = match fs::read_to_string(&path) {
            Ok(raw) => raw
                .trim()
                .parse()
                .map_err(|e| with_context(e, "Corrupt pool id sequence"))?,
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(with_context(e, "Failed to read pool id sequence")),
        };
        let next = current + 1;
        atomic_write(&path, next.to_string().as_bytes())?;
        Ok(next)
    }

    pub fn pool_record(&self, name: &str) -> Result<Option<PoolRecord>, DynError> {
        read_record(&self.root.join(POOLS_DIR).join(record_file(name)?))
    }

    pub fn pool_names(&self) -> Result<Vec<String>, DynError> {
        list_records(&self.root.join(POOLS_DIR))
    }

    pub fn volume_record(&self, pool: &str, name: &str) -> Result<Option<VolumeRecord>, DynError> {
        read_record(&self.volume_path(pool, name)?)
    }

    pub fn volume_names(&self, pool: &str) -> Result<Vec<String>, DynError> {
        let dir = self.root.join(VOLUMES_DIR).join(valid_name(pool)?);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        list_records(&dir)
    }

    pub fn profile_record(&self, name: &str) -> Result<Option<ProfileRecord>, DynError> {
        read_record(&self.root.join(PROFILES_DIR).join(record_file(name)?))
    }

    fn volume_path(&self, pool: &str, name: &str) -> Result<PathBuf, DynError> {
        Ok(self
            .root
            .join(VOLUMES_DIR)
            .join(valid_name(pool)?)
            .join(record_file(name)?))
    }

    fn lock_commits(&self) -> std::sync::MutexGuard<'_, ()> {
        self.commit_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn apply(&self, op: &StagedOp) -> Result<(), DynError> {
        match op {
            StagedOp::PutPool(record) => {
                let path = self.root.join(POOLS_DIR).join(record_file(&record.name)?);
                atomic_write(&path, &encode(record)?)
            }
            StagedOp::DeletePool(name) => {
                remove_record(&self.root.join(POOLS_DIR).join(record_file(name)?))
            }
            StagedOp::PutVolume(record) => {
                let path = self.volume_path(&record.pool, &record.name)?;
                atomic_write(&path, &encode(record)?)
            }
            StagedOp::DeleteVolume { pool, name } => {
                remove_record(&self.volume_path(pool, name)?)
            }
            StagedOp::PutProfile(record) => {
                let path = self
                    .root
                    .join(PROFILES_DIR)
                    .join(record_file(&record.name)?);
                atomic_write(&path, &encode(record)?)
            }
            StagedOp::DeleteProfile(name) => {
                remove_record(&self.root.join(PROFILES_DIR).join(record_file(name)?))
            }
        }
    }
}

/// A staged transaction. Dropping without commit discards all staged writes.
pub struct Tx<'a> {
    store: &'a MetaStore,
    staged: Vec<StagedOp>,
}

impl Tx<'_> {
    pub fn put_pool(&mut self, record: PoolRecord) {
        self.staged.push(StagedOp::PutPool(record));
    }

    pub fn delete_pool(&mut self, name: &str) {
        self.staged.push(StagedOp::DeletePool(name.to_string()));
    }

    pub fn put_volume(&mut self, record: VolumeRecord) {
        self.staged.push(StagedOp::PutVolume(record));
    }

    pub fn delete_volume(&mut self, pool: &str, name: &str) {
        self.staged.push(StagedOp::DeleteVolume {
            pool: pool.to_string(),
            name: name.to_string(),
        });
    }

    pub fn put_profile(&mut self, record: ProfileRecord) {
        self.staged.push(StagedOp::PutProfile(record));
    }

    pub fn delete_profile(&mut self, name: &str) {
        self.staged.push(StagedOp::DeleteProfile(name.to_string()));
    }

    pub fn commit(self) -> Result<(), DynError> {
        let _guard = self.store.lock_commits();
        for op in &self.staged {
            self.store.apply(op)?;
        }
        Ok(())
    }

    pub fn rollback(self) -> Result<(), DynError> {
        Ok(())
    }
}

fn valid_name(name: &str) -> Result<&str, DynError> {
    if name.is_empty() {
        return Err(new_error("Record name may not be empty"));
    }
    if name.contains('/') || name.starts_with('.') {
        return Err(new_error(format!("Invalid record name '{}'", name)));
    }
    Ok(name)
}

fn record_file(name: &str) -> Result<String, DynError> {
    Ok(format!("{}.json", valid_name(name)?))
}

fn encode<T: Serialize>(record: &T) -> Result<Vec<u8>, DynError> {
    serde_json::to_vec_pretty(record).map_err(|e| with_context(e, "Failed to encode record"))
}

fn atomic_write(path: &Path, contents: &[u8]) -> Result<(), DynError> {
    let parent = path
        .parent()
        .ok_or_else(|| new_error(format!("Record path '{}' has no parent", path.display())))?;
    fs::create_dir_all(parent).map_err(|e| {
        with_context(
            e,
            format!("Failed to create record directory '{}'", parent.display()),
        )
    })?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, contents)
        .map_err(|e| with_context(e, format!("Failed to write record '{}'", tmp.display())))?;
    fs::rename(&tmp, path).map_err(|e| {
        with_context(e, format!("Failed to publish record '{}'", path.display()))
    })
}

fn remove_record(path: &Path) -> Result<(), DynError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(with_context(
            e,
            format!("Failed to delete record '{}'", path.display()),
        )),
    }
}

fn read_record<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, DynError> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(with_context(
                e,
                format!("Failed to read record '{}'", path.display()),
            ))
        }
    };
    let record = serde_json::from_slice(&raw)
        .map_err(|e| with_context(e, format!("Corrupt record '{}'", path.display())))?;
    Ok(Some(record))
}

fn list_records(dir: &Path) -> Result<Vec<String>, DynError> {
    let mut names = Vec::new();
    let entries = fs::read_dir(dir)
        .map_err(|e| with_context(e, format!("Failed to list records in '{}'", dir.display())))?;
    for entry in entries {
        let entry =
            entry.map_err(|e| with_context(e, format!("Failed to walk '{}'", dir.display())))?;
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        if let Some(name) = file_name.strip_suffix(".json") {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}
