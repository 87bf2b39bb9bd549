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

use std::error::Error;
use std::sync::Arc;

use crate::cellar::db::MetaStore;
use crate::cellar::idmap::{HostRangePool, IdmapSet};
use crate::cellar::logger::log_info;
use crate::cellar::storage::pool::PoolManager;
use crate::cellar::storage::volume::VolumeController;
use crate::cellar::util::with_context;
use crate::cellar::Config;

const COMPONENT: &str = "context";

/// First host id handed out to containers; everything below stays with the
/// host.
pub const DEFAULT_RANGE_START: u32 = 100000;
pub const DEFAULT_RANGE_LENGTH: u32 = 1_000_000;
pub const DEFAULT_IDMAP_LENGTH: u32 = 65536;

/// Process-wide storage context, built once at daemon start and torn down
/// at stop. Owns the metadata store, the pool and volume managers, and the
/// host-range pool; nothing here is ambient global state.
pub struct NodeContext {
    pub mock_mode: bool,
    store: Arc<MetaStore>,
    pools: Arc<PoolManager>,
    volumes: Arc<VolumeController>,
    ranges: Arc<HostRangePool>,
    default_idmap: IdmapSet,
}

impl NodeContext {
    pub fn new(mock_mode: bool) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let metastore_root = Config::Metastore.verify(None, false)?;
        let storage_root = Config::StorageRoot.verify(None, false)?;

        let store = Arc::new(MetaStore::open(&metastore_root)?);
        let pools = Arc::new(PoolManager::new(Arc::clone(&store), storage_root));
        let volumes = Arc::new(VolumeController::new(Arc::clone(&pools)));

        let ranges = Arc::new(
            HostRangePool::new(
                DEFAULT_RANGE_START,
                DEFAULT_RANGE_LENGTH,
                DEFAULT_RANGE_START,
                DEFAULT_RANGE_LENGTH,
            )
            .map_err(|e| with_context(e, "Failed to build host range pool"))?,
        );
        let default_idmap = ranges
            .allocate_set(DEFAULT_IDMAP_LENGTH)
            .map_err(|e| with_context(e, "Failed to allocate the default idmap"))?;

        log_info(
            COMPONENT,
            "storage context initialized",
            &[("mock_mode", if mock_mode { "true" } else { "false" })],
        );

        Ok(Self {
            mock_mode,
            store,
            pools,
            volumes,
            ranges,
            default_idmap,
        })
    }

    pub fn store(&self) -> &Arc<MetaStore> {
        &self.store
    }

    pub fn pools(&self) -> &Arc<PoolManager> {
        &self.pools
    }

    pub fn volumes(&self) -> &Arc<VolumeController> {
        &self.volumes
    }

    pub fn ranges(&self) -> &Arc<HostRangePool> {
        &self.ranges
    }

    pub fn default_idmap(&self) -> &IdmapSet {
        &self.default_idmap
    }

    /// The driver tag actually used for new pools: mock mode pins
    /// everything to the mock backend.
    pub fn effective_driver<'a>(&self, tag: &'a str) -> &'a str {
        if self.mock_mode {
            "mock"
        } else {
            tag
        }
    }
}
