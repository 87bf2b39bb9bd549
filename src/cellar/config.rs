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

use std::env;
use std::error::Error;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, PathBuf};

/// Enum for supported configuration parameters
#[derive(Debug)]
pub enum Config {
    Metastore,
    StorageRoot,
    LockFile,
}

impl Config {
    /// Returns the associated environment variable for the config parameter.
    pub fn env_var(&self) -> &'static str {
        match self {
            Config::Metastore => "CELLAR_METASTORE",
            Config::StorageRoot => "CELLAR_STORAGE",
            Config::LockFile => "CELLAR_LOCK_FILE",
        }
    }

    /// Returns the default value for the config parameter.
    pub fn default_path(&self) -> &'static str {
        match self {
            Config::Metastore => {
                #[cfg(test)]
                {
                    "/tmp/cellar-test/metastore"
                }
                #[cfg(not(test))]
                {
                    "/var/lib/cellar/metastore"
                }
            }
            Config::StorageRoot => {
                #[cfg(test)]
                {
                    "/tmp/cellar-test/storage"
                }
                #[cfg(not(test))]
                {
                    "/var/lib/cellar/storage"
                }
            }
            Config::LockFile => {
                #[cfg(test)]
                {
                    "/tmp/cellar-test/metastore/.lock"
                }
                #[cfg(not(test))]
                {
                    "/var/lib/cellar/metastore/.lock"
                }
            }
        }
    }

    /// Returns the effective value, either from environment or default.
    pub fn get_path(&self) -> PathBuf {
        env::var(self.env_var()).map_or_else(
            |_| Self::normalize_path(self.default_path()),
            |value| Self::normalize_path(&value),
        )
    }

    /// Create or verify the configured directory.
    pub fn verify(
        &self,
        subpath: Option<&str>,
        require_empty: bool,
    ) -> Result<PathBuf, Box<dyn Error + Send + Sync>> {
        let mut path = self.get_path();
        if let Some(subpath) = subpath {
            path = path.join(subpath);
        }

        // Create the directory if it is absent else reject paths that already
        // exist but are not directories.
        if !&path.exists() {
            fs::create_dir_all(&path)
                .map_err(|e| format!("Failed to create directory '{}': {}", path.display(), e))?;
        } else if !path.is_dir() {
            return Err(format!("Path '{}' exists but is not a directory", path.display()).into());
        }

        if require_empty && path.read_dir()?.next().is_some() {
            return Err(format!("Directory '{}' must be empty", path.display()).into());
        }

        if subpath.is_none() {
            if let Some(mode) = self.desired_mode() {
                let permissions = fs::Permissions::from_mode(mode);
                if let Err(error) = fs::set_permissions(&path, permissions) {
                    return Err(std::io::Error::other(format!(
                        "Failed to set permissions on '{}': {}",
                        path.display(),
                        error
                    ))
                    .into());
                }
            }
        }

        Ok(path)
    }

    /// Normalize a directory path by expanding ~, resolving ., .., and returning an absolute, cleaned path.
    fn normalize_path(input: &str) -> PathBuf {
        let path: PathBuf = match input {
            _ if input.starts_with("~/") => env::var("HOME")
                .ok()
                .map(|home| PathBuf::from(home).join(&input[2..])),
            _ if !input.starts_with('/') => env::current_dir().ok().map(|cwd| cwd.join(input)),
            _ => None,
        }
        .unwrap_or_else(|| PathBuf::from(input));

        path.components()
            .fold(PathBuf::new(), |mut normalized, component| {
                match component {
                    Component::CurDir => {}
                    Component::ParentDir => {
                        normalized.pop();
                    }
                    _ => normalized.push(component),
                }
                normalized
            })
    }

    fn desired_mode(&self) -> Option<u32> {
        match self {
            Config::Metastore => Some(0o700),
            Config::StorageRoot => Some(0o711),
            Config::LockFile => None,
        }
    }
}
