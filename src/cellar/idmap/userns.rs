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

//! Namespace entry adapter. Exactly one implementation is selected per
//! target platform at build time. On platforms without user-namespace
//! support the adapter is a silent no-op that always succeeds: callers must
//! not be able to distinguish "unsupported" from "entered the default
//! namespace", since identity remapping is an additive safety feature.

use super::{IdKind, IdmapError, IdmapSet};

/// Attaches a running process to the user-namespace mapping implied by an
/// [`IdmapSet`].
pub trait NamespaceEntry: Send + Sync {
    fn enter_mapping(&self, pid: u32, set: &IdmapSet) -> Result<(), IdmapError>;
}

/// Adapter for builds without privileged kernel support. Unconditionally
/// succeeds; there is deliberately no `supported()` probe.
pub struct NoopNamespaceEntry;

impl NamespaceEntry for NoopNamespaceEntry {
    fn enter_mapping(&self, _pid: u32, _set: &IdmapSet) -> Result<(), IdmapError> {
        Ok(())
    }
}

#[cfg(target_os = "linux")]
pub use linux::ProcNamespaceEntry;

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use std::fs;
    use std::io::ErrorKind;

    /// Writes the uid/gid map files of the target process. Requires the
    /// calling process to hold CAP_SETUID/CAP_SETGID over the target
    /// namespace.
    pub struct ProcNamespaceEntry;

    impl ProcNamespaceEntry {
        pub(super) fn map_lines(set: &IdmapSet, kind: IdKind) -> String {
            let mut lines = String::new();
            for entry in set.entries() {
                if !entry.covers_kind(kind) {
                    continue;
                }
                lines.push_str(&format!(
                    "{} {} {}\n",
                    entry.ns_id, entry.host_id, entry.map_range
                ));
            }
            lines
        }

        fn write_map(pid: u32, file: &str, contents: &str) -> Result<(), IdmapError> {
            if contents.is_empty() {
                return Ok(());
            }
            let path = format!("/proc/{}/{}", pid, file);
            // The kernel requires the whole map in a single write.
            fs::write(&path, contents).map_err(|e| match e.kind() {
                ErrorKind::PermissionDenied => IdmapError::Permission {
                    detail: format!("writing '{}' denied", path),
                },
                _ => IdmapError::Permission {
                    detail: format!("writing '{}': {}", path, e),
                },
            })
        }
    }

    impl NamespaceEntry for ProcNamespaceEntry {
        fn enter_mapping(&self, pid: u32, set: &IdmapSet) -> Result<(), IdmapError> {
            Self::write_map(pid, "uid_map", &Self::map_lines(set, IdKind::Uid))?;
            Self::write_map(pid, "gid_map", &Self::map_lines(set, IdKind::Gid))
        }
    }
}

/// The adapter for this build. Non-Linux targets always get the no-op
/// adapter; Linux gets the `/proc` map writer.
pub fn platform_adapter() -> &'static dyn NamespaceEntry {
    #[cfg(target_os = "linux")]
    {
        static ADAPTER: ProcNamespaceEntry = ProcNamespaceEntry;
        &ADAPTER
    }
    #[cfg(not(target_os = "linux"))]
    {
        static ADAPTER: NoopNamespaceEntry = NoopNamespaceEntry;
        &ADAPTER
    }
}
