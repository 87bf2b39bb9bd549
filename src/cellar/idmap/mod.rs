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

//! UID/GID mapping engine. An [`IdmapSet`] describes how a container's
//! numeric identities translate to host-side ranges; the [`HostRangePool`]
//! hands out disjoint host ranges so containers can never collide with each
//! other or with the host's own identity space.

pub mod shift;
pub mod userns;

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::cellar::logger::log_debug;

/// Host ids below this value are reserved for the host's own identity range
/// and are never handed out to containers.
pub const HOST_RESERVED_IDS: u32 = 65536;

const COMPONENT: &str = "idmap";

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum IdKind {
    Uid,
    Gid,
}

impl IdKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IdKind::Uid => "uid",
            IdKind::Gid => "gid",
        }
    }
}

#[derive(Debug)]
pub enum IdmapError {
    /// No contiguous free host range of the requested length exists.
    Exhausted { kind: IdKind, length: u32 },
    /// A released range was never allocated from this pool.
    NotOwned { kind: IdKind, host_id: u32, length: u32 },
    /// Ownership rewrite hit an unrecoverable filesystem error. Entries
    /// shifted before the failure stay shifted.
    Shift { path: PathBuf, detail: String },
    /// Cooperative cancellation honored before visiting `path`.
    Canceled { path: PathBuf },
    /// Privileged namespace operation attempted without privilege.
    Permission { detail: String },
    /// Malformed persisted mapping set.
    Wire { line: usize, detail: String },
    /// A mapping range or pool definition violates a structural invariant.
    Invalid(String),
}

impl fmt::Display for IdmapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdmapError::Exhausted { kind, length } => write!(
                f,
                "No free contiguous {} range of length {} available",
                kind.as_str(),
                length
            ),
            IdmapError::NotOwned {
                kind,
                host_id,
                length,
            } => write!(
                f,
                "{} range {}+{} was not allocated from this pool",
                kind.as_str(),
                host_id,
                length
            ),
            IdmapError::Shift { path, detail } => {
                write!(f, "Failed to shift ownership at '{}': {}", path.display(), detail)
            }
            IdmapError::Canceled { path } => {
                write!(f, "Ownership shift canceled before '{}'", path.display())
            }
            IdmapError::Permission { detail } => {
                write!(f, "Namespace mapping requires privilege: {}", detail)
            }
            IdmapError::Wire { line, detail } => {
                write!(f, "Malformed mapping set at line {}: {}", line, detail)
            }
            IdmapError::Invalid(detail) => write!(f, "Invalid mapping: {}", detail),
        }
    }
}

impl Error for IdmapError {}

/// One contiguous UID and/or GID translation rule. Field order is the stable
/// wire order; persisted sets must never reorder these.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct IdmapEntry {
    pub is_uid: bool,
    pub is_gid: bool,
    pub host_id: u32,
    pub ns_id: u32,
    pub map_range: u32,
}

impl IdmapEntry {
    pub fn covers_kind(&self, kind: IdKind) -> bool {
        match kind {
            IdKind::Uid => self.is_uid,
            IdKind::Gid => self.is_gid,
        }
    }

    fn host_end(&self) -> u64 {
        u64::from(self.host_id) + u64::from(self.map_range)
    }

    fn ns_end(&self) -> u64 {
        u64::from(self.ns_id) + u64::from(self.map_range)
    }

    /// True when `other` is of the same kind and the host intervals intersect.
    pub fn overlaps(&self, other: &IdmapEntry) -> bool {
        let same_kind = (self.is_uid && other.is_uid) || (self.is_gid && other.is_gid);
        if !same_kind {
            return false;
        }
        u64::from(self.host_id) < other.host_end() && u64::from(other.host_id) < self.host_end()
    }
}

/// The full set of mapping ranges assigned to one container. Insertion order
/// is preserved; it carries no meaning beyond stable iteration.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct IdmapSet {
    entries: Vec<IdmapEntry>,
}

impl IdmapSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[IdmapEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add a range, enforcing well-formedness: positive length, no overlap
    /// with an existing range of the same kind.
    pub fn add(&mut self, entry: IdmapEntry) -> Result<(), IdmapError> {
        if entry.map_range == 0 {
            return Err(IdmapError::Invalid(
                "mapping range length must be positive".to_string(),
            ));
        }
        if !entry.is_uid && !entry.is_gid {
            return Err(IdmapError::Invalid(
                "mapping range must cover uids, gids or both".to_string(),
            ));
        }
        let id_space = u64::from(u32::MAX) + 1;
        if entry.host_end() > id_space || entry.ns_end() > id_space {
            return Err(IdmapError::Invalid(format!(
                "range {}+{} exceeds the 32-bit id space",
                entry.host_id.max(entry.ns_id),
                entry.map_range
            )));
        }
        if let Some(existing) = self.entries.iter().find(|e| e.overlaps(&entry)) {
            return Err(IdmapError::Invalid(format!(
                "range {}+{} overlaps existing range {}+{}",
                entry.host_id, entry.map_range, existing.host_id, existing.map_range
            )));
        }
        self.entries.push(entry);
        Ok(())
    }

    /// True iff any range in `self` overlaps a same-kind range in `other`.
    pub fn intersects(&self, other: &IdmapSet) -> bool {
        self.entries
            .iter()
            .any(|a| other.entries.iter().any(|b| a.overlaps(b)))
    }

    /// Translate a namespace-relative id to its host-side id. `None` means
    /// the id falls into a hole and the owner must stay unchanged.
    pub fn to_host(&self, kind: IdKind, id: u32) -> Option<u32> {
        self.entries
            .iter()
            .find(|e| e.covers_kind(kind) && u64::from(id) >= u64::from(e.ns_id) && u64::from(id) < e.ns_end())
            .map(|e| e.host_id + (id - e.ns_id))
    }

    /// Translate a host-side id back to its namespace-relative id.
    pub fn to_ns(&self, kind: IdKind, id: u32) -> Option<u32> {
        self.entries
            .iter()
            .find(|e| e.covers_kind(kind) && u64::from(id) >= u64::from(e.host_id) && u64::from(id) < e.host_end())
            .map(|e| e.ns_id + (id - e.host_id))
    }

    /// Stable textual form: one JSON record per line, fields in declaration
    /// order. Two equal sets always serialize to byte-identical output.
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            // Serializing a plain struct with primitive fields cannot fail.
            let line = serde_json::to_string(entry).unwrap_or_default();
            out.push_str(&line);
            out.push('\n');
        }
        out
    }

    pub fn parse_wire(input: &str) -> Result<IdmapSet, IdmapError> {
        let mut set = IdmapSet::new();
        for (index, line) in input.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let entry: IdmapEntry =
                serde_json::from_str(trimmed).map_err(|e| IdmapError::Wire {
                    line: index + 1,
                    detail: e.to_string(),
                })?;
            set.add(entry).map_err(|e| IdmapError::Wire {
                line: index + 1,
                detail: e.to_string(),
            })?;
        }
        Ok(set)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Span {
    start: u32,
    len: u32,
}

impl Span {
    fn end(&self) -> u64 {
        u64::from(self.start) + u64::from(self.len)
    }
}

#[derive(Debug, Default)]
struct KindState {
    free: Vec<Span>,
    allocated: Vec<Span>,
}

impl KindState {
    fn first_fit(&mut self, length: u32) -> Option<Span> {
        let index = self.free.iter().position(|s| s.len >= length)?;
        let span = self.free[index];
        let carved = Span {
            start: span.start,
            len: length,
        };
        if span.len == length {
            self.free.remove(index);
        } else {
            self.free[index] = Span {
                start: span.start + length,
                len: span.len - length,
            };
        }
        self.allocated.push(carved);
        Some(carved)
    }

    fn owns(&self, span: Span) -> bool {
        self.allocated.contains(&span)
    }

    fn give_back(&mut self, span: Span) {
        if let Some(index) = self.allocated.iter().position(|s| *s == span) {
            self.allocated.remove(index);
        }
        let insert_at = self
            .free
            .iter()
            .position(|s| s.start > span.start)
            .unwrap_or(self.free.len());
        self.free.insert(insert_at, span);

        // Coalesce with the following neighbor first, then the preceding one.
        if insert_at + 1 < self.free.len() && self.free[insert_at].end() == u64::from(self.free[insert_at + 1].start) {
            let next = self.free.remove(insert_at + 1);
            self.free[insert_at].len += next.len;
        }
        if insert_at > 0 && self.free[insert_at - 1].end() == u64::from(self.free[insert_at].start) {
            let merged = self.free.remove(insert_at);
            self.free[insert_at - 1].len += merged.len;
        }
    }
}

#[derive(Debug)]
struct PoolState {
    uid: KindState,
    gid: KindState,
}

impl PoolState {
    fn kind_mut(&mut self, kind: IdKind) -> &mut KindState {
        match kind {
            IdKind::Uid => &mut self.uid,
            IdKind::Gid => &mut self.gid,
        }
    }
}

/// Process-wide pool of allocatable host UID/GID ranges, maintained as a
/// first-fit interval free-list. Constructed once at daemon start and passed
/// by reference; all access is serialized by an internal lock that is never
/// held across I/O.
#[derive(Debug)]
pub struct HostRangePool {
    state: Mutex<PoolState>,
}

impl HostRangePool {
    pub fn new(
        uid_start: u32,
        uid_len: u32,
        gid_start: u32,
        gid_len: u32,
    ) -> Result<Self, IdmapError> {
        for (kind, start, len) in [
            (IdKind::Uid, uid_start, uid_len),
            (IdKind::Gid, gid_start, gid_len),
        ] {
            if len == 0 {
                return Err(IdmapError::Invalid(format!(
                    "{} pool length must be positive",
                    kind.as_str()
                )));
            }
            if start < HOST_RESERVED_IDS {
                return Err(IdmapError::Invalid(format!(
                    "{} pool start {} intrudes on the reserved host range below {}",
                    kind.as_str(),
                    start,
                    HOST_RESERVED_IDS
                )));
            }
        }

        Ok(Self {
            state: Mutex::new(PoolState {
                uid: KindState {
                    free: vec![Span {
                        start: uid_start,
                        len: uid_len,
                    }],
                    allocated: Vec::new(),
                },
                gid: KindState {
                    free: vec![Span {
                        start: gid_start,
                        len: gid_len,
                    }],
                    allocated: Vec::new(),
                },
            }),
        })
    }

    /// First-fit allocation of a free contiguous host range.
    pub fn allocate(&self, kind: IdKind, length: u32) -> Result<IdmapEntry, IdmapError> {
        if length == 0 {
            return Err(IdmapError::Invalid(
                "allocation length must be positive".to_string(),
            ));
        }
        let mut state = self.lock_state();
        let span = state
            .kind_mut(kind)
            .first_fit(length)
            .ok_or(IdmapError::Exhausted { kind, length })?;
        log_debug(
            COMPONENT,
            "allocated host range",
            &[
                ("kind", kind.as_str()),
                ("host_id", &span.start.to_string()),
                ("length", &span.len.to_string()),
            ],
        );
        Ok(IdmapEntry {
            is_uid: kind == IdKind::Uid,
            is_gid: kind == IdKind::Gid,
            host_id: span.start,
            ns_id: 0,
            map_range: span.len,
        })
    }

    /// Return a previously allocated range to the free-list, coalescing with
    /// adjacent free intervals.
    pub fn release(&self, entry: &IdmapEntry) -> Result<(), IdmapError> {
        let span = Span {
            start: entry.host_id,
            len: entry.map_range,
        };
        let kinds: Vec<IdKind> = [IdKind::Uid, IdKind::Gid]
            .into_iter()
            .filter(|k| entry.covers_kind(*k))
            .collect();

        let mut state = self.lock_state();
        for kind in &kinds {
            if !state.kind_mut(*kind).owns(span) {
                return Err(IdmapError::NotOwned {
                    kind: *kind,
                    host_id: entry.host_id,
                    length: entry.map_range,
                });
            }
        }
        for kind in &kinds {
            state.kind_mut(*kind).give_back(span);
        }
        Ok(())
    }

    /// Allocate one uid and one gid range of the same length and wrap them in
    /// a fresh set. The uid range is returned to the pool if the gid side
    /// cannot be satisfied.
    pub fn allocate_set(&self, length: u32) -> Result<IdmapSet, IdmapError> {
        let uid_entry = self.allocate(IdKind::Uid, length)?;
        let gid_entry = match self.allocate(IdKind::Gid, length) {
            Ok(entry) => entry,
            Err(error) => {
                let _ = self.release(&uid_entry);
                return Err(error);
            }
        };
        let mut set = IdmapSet::new();
        set.add(uid_entry)?;
        set.add(gid_entry)?;
        Ok(set)
    }

    /// Release every range of a container's set. Used at container deletion.
    pub fn release_set(&self, set: &IdmapSet) -> Result<(), IdmapError> {
        for entry in set.entries() {
            self.release(entry)?;
        }
        Ok(())
    }

    /// Snapshot of the free intervals for one kind, ordered by start.
    pub fn free_spans(&self, kind: IdKind) -> Vec<(u32, u32)> {
        let mut state = self.lock_state();
        state
            .kind_mut(kind)
            .free
            .iter()
            .map(|s| (s.start, s.len))
            .collect()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
