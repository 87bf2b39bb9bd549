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

use std::fs;
use std::os::unix::fs::{lchown, MetadataExt};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use super::{IdKind, IdmapError, IdmapSet};
use crate::cellar::logger::{log_debug, log_warn};

const COMPONENT: &str = "idmap.shift";

/// Which view of the tree the rewrite prepares.
///
/// `ToNamespace` rewrites host-relative ownership into the set's mapped host
/// ranges, so ids read back as their original values from inside the user
/// namespace. `ToHost` is the exact inverse and restores host-relative
/// ownership before a volume is unmounted.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ShiftDirection {
    ToNamespace,
    ToHost,
}

impl ShiftDirection {
    fn as_str(self) -> &'static str {
        match self {
            ShiftDirection::ToNamespace => "to-namespace",
            ShiftDirection::ToHost => "to-host",
        }
    }
}

/// Recursively rewrite the owning uid/gid of every entry under `root`.
///
/// Symlinks are chowned themselves and never followed; file types are never
/// altered. Ids with no matching range are left unchanged, and ids already
/// inside a host range are recognized as shifted and skipped, so re-running
/// a pass with the same set and direction changes nothing even when the
/// namespace window overlaps the host window.
/// Shifting is not transactional; on error the entries already
/// rewritten stay rewritten and the offending path is reported. The `cancel`
/// flag is checked before every entry and stops the walk with
/// [`IdmapError::Canceled`].
///
/// Returns the number of entries whose ownership was changed.
pub fn shift_owner(
    root: &Path,
    set: &IdmapSet,
    direction: ShiftDirection,
    cancel: &AtomicBool,
) -> Result<u64, IdmapError> {
    log_debug(
        COMPONENT,
        "starting ownership shift",
        &[
            ("root", &root.display().to_string()),
            ("direction", direction.as_str()),
        ],
    );
    let mut changed = 0;
    shift_entry(root, set, direction, cancel, &mut changed)?;
    log_debug(
        COMPONENT,
        "ownership shift finished",
        &[
            ("root", &root.display().to_string()),
            ("changed", &changed.to_string()),
        ],
    );
    Ok(changed)
}

fn translate(set: &IdmapSet, direction: ShiftDirection, kind: IdKind, id: u32) -> Option<u32> {
    match direction {
        ShiftDirection::ToNamespace => {
            // An id inside a host range is already in the namespace view;
            // translating it again would double-shift when the namespace
            // window overlaps the host window.
            if set.to_ns(kind, id).is_some() {
                return None;
            }
            set.to_host(kind, id)
        }
        // `to_ns` is only defined on host ranges, so ids already restored
        // to the namespace view fall through unchanged.
        ShiftDirection::ToHost => set.to_ns(kind, id),
    }
}

fn shift_entry(
    path: &Path,
    set: &IdmapSet,
    direction: ShiftDirection,
    cancel: &AtomicBool,
    changed: &mut u64,
) -> Result<(), IdmapError> {
    if cancel.load(Ordering::Relaxed) {
        log_warn(
            COMPONENT,
            "ownership shift canceled",
            &[("path", &path.display().to_string())],
        );
        return Err(IdmapError::Canceled {
            path: path.to_path_buf(),
        });
    }

    let metadata = fs::symlink_metadata(path).map_err(|e| IdmapError::Shift {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;

    let uid = metadata.uid();
    let gid = metadata.gid();
    let new_uid = translate(set, direction, IdKind::Uid, uid);
    let new_gid = translate(set, direction, IdKind::Gid, gid);

    let target_uid = new_uid.unwrap_or(uid);
    let target_gid = new_gid.unwrap_or(gid);
    if target_uid != uid || target_gid != gid {
        lchown(path, Some(target_uid), Some(target_gid)).map_err(|e| IdmapError::Shift {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        *changed += 1;
    }

    // Descend into real directories only; symlinked directories are handled
    // as the link itself above.
    if metadata.is_dir() {
        let entries = fs::read_dir(path).map_err(|e| IdmapError::Shift {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| IdmapError::Shift {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;
            shift_entry(&entry.path(), set, direction, cancel, changed)?;
        }
    }

    Ok(())
}
