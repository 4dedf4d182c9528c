/*
 * Copyright 2021 Aon Cyber Solutions
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Obtains a private, unlocked copy of a hive.
//!
//! Hives are copied into the run's scratch directory. Known system hives that
//! the OS holds open are exported from the live registry instead, which needs
//! an elevated session.

use crate::err::Error;
use crate::locator::Classification;
use crate::util::{self, FileDigests};
use log::{debug, info, warn};
use serde::Serialize;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempPath;
use thiserror::Error;

/// Integrity levels (high, system) that allow `reg save` of machine hives.
const ELEVATED_INTEGRITY_SIDS: [&str; 2] = ["S-1-16-12288", "S-1-16-16384"];

/// The operating system's live registry.
pub trait LiveRegistry {
    /// False where the host has no live registry to export from.
    fn is_available(&self) -> bool {
        true
    }
    fn is_elevated(&self) -> bool;
    fn current_user_profile(&self) -> Option<PathBuf>;
    /// Writes a snapshot of the mounted `root` (ex: `HKLM\SYSTEM`) to `destination`.
    fn export(&self, root: &str, destination: &Path) -> Result<(), Error>;
}

/// Live registry access through `whoami` and `reg save`.
#[derive(Clone, Copy, Debug, Default)]
pub struct RegExe {}

impl LiveRegistry for RegExe {
    fn is_available(&self) -> bool {
        cfg!(windows)
    }

    fn is_elevated(&self) -> bool {
        if !cfg!(windows) {
            return false;
        }
        match Command::new("whoami").arg("/groups").output() {
            Ok(output) => {
                let groups = String::from_utf8_lossy(&output.stdout);
                ELEVATED_INTEGRITY_SIDS.iter().any(|sid| groups.contains(sid))
            }
            Err(e) => {
                debug!("Unable to query elevation: {}", e);
                false
            }
        }
    }

    fn current_user_profile(&self) -> Option<PathBuf> {
        env::var_os("USERPROFILE").map(PathBuf::from)
    }

    fn export(&self, root: &str, destination: &Path) -> Result<(), Error> {
        if !cfg!(windows) {
            return Err(Error::Any {
                detail: "live registry export is only available on Windows".to_string(),
            });
        }
        let output = Command::new("reg")
            .arg("save")
            .arg(root)
            .arg(destination)
            .arg("/y")
            .output()?;
        if !output.status.success() {
            return Err(Error::Any {
                detail: format!(
                    "reg save {} failed with {}: {}",
                    root,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum AcquireFailure {
    #[error("{} is locked and exporting {} requires an elevated (administrator) session", path.display(), root)]
    LockedWithoutPrivilege { path: PathBuf, root: String },
    #[error("Unable to copy {}: {}", path.display(), source)]
    Copy {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Unable to export {}: {}", path.display(), detail)]
    Export { path: PathBuf, detail: String },
}

impl AcquireFailure {
    pub fn is_privilege(&self) -> bool {
        matches!(self, AcquireFailure::LockedWithoutPrivilege { .. })
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub enum Strategy {
    Copy,
    LiveExport { root: String },
}

/// A readable copy of a hive inside the scratch directory; removed when dropped.
#[derive(Debug)]
pub struct AcquiredHive {
    path: TempPath,
    pub strategy: Strategy,
    pub digests: Option<FileDigests>,
}

impl AcquiredHive {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the copy now instead of at drop.
    pub fn release(self) -> io::Result<()> {
        self.path.close()
    }
}

pub type AcquisitionResult = Result<AcquiredHive, AcquireFailure>;

/// Maps a known hive to the live registry root it is mounted at.
///
/// A profile hive only maps to `HKCU` when it lives in the current user's
/// profile; other users' loaded hives cannot be exported this way.
pub fn live_root_for<L: LiveRegistry + ?Sized>(path: &Path, live: &L) -> Option<&'static str> {
    match util::source_name(path).to_lowercase().as_str() {
        "system" => Some("HKLM\\SYSTEM"),
        "software" => Some("HKLM\\SOFTWARE"),
        "sam" => Some("HKLM\\SAM"),
        "security" => Some("HKLM\\SECURITY"),
        "default" => Some("HKU\\.DEFAULT"),
        "ntuser.dat" => {
            let profile = live.current_user_profile()?;
            let parent = path.parent()?;
            if same_location(parent, &profile) {
                Some("HKCU")
            } else {
                None
            }
        }
        _ => None,
    }
}

fn same_location(a: &Path, b: &Path) -> bool {
    let a = fs::canonicalize(a).unwrap_or_else(|_| a.to_path_buf());
    let b = fs::canonicalize(b).unwrap_or_else(|_| b.to_path_buf());
    a.to_string_lossy().to_lowercase() == b.to_string_lossy().to_lowercase()
}

pub struct AcquisitionManager<L: LiveRegistry> {
    live: L,
    record_digests: bool,
}

impl<L: LiveRegistry> AcquisitionManager<L> {
    pub fn new(live: L) -> Self {
        AcquisitionManager {
            live,
            record_digests: true,
        }
    }

    pub fn record_digests(mut self, record_digests: bool) -> Self {
        self.record_digests = record_digests;
        self
    }

    /// Never panics; every failure is returned as an [`AcquireFailure`].
    pub fn acquire(
        &self,
        path: &Path,
        classification: Classification,
        scratch_dir: &Path,
    ) -> AcquisitionResult {
        let destination = self.scratch_file(path, scratch_dir)?;
        match fs::copy(path, &destination) {
            Ok(bytes) => {
                debug!("Copied {} ({} bytes) to {}", path.display(), bytes, destination.display());
                Ok(self.acquired(destination, Strategy::Copy))
            }
            Err(e) => self.fallback(path, classification, destination, e),
        }
    }

    fn scratch_file(&self, path: &Path, scratch_dir: &Path) -> Result<TempPath, AcquireFailure> {
        tempfile::Builder::new()
            .prefix(&format!("{}.", util::source_name(path)))
            .suffix(".hive")
            .tempfile_in(scratch_dir)
            .map(|file| file.into_temp_path())
            .map_err(|source| AcquireFailure::Copy {
                path: path.to_path_buf(),
                source,
            })
    }

    pub(crate) fn fallback(
        &self,
        path: &Path,
        classification: Classification,
        destination: TempPath,
        copy_error: io::Error,
    ) -> AcquisitionResult {
        if !util::is_lock_error(&copy_error) || classification != Classification::DefiniteHive {
            return Err(AcquireFailure::Copy {
                path: path.to_path_buf(),
                source: copy_error,
            });
        }
        let root = match live_root_for(path, &self.live) {
            Some(root) => root,
            None => {
                return Err(AcquireFailure::Export {
                    path: path.to_path_buf(),
                    detail: format!("no live registry root to export from ({})", copy_error),
                })
            }
        };
        if !self.live.is_available() {
            return Err(AcquireFailure::Export {
                path: path.to_path_buf(),
                detail: format!(
                    "{} is locked ({}) and live registry export is unavailable on this platform",
                    root, copy_error
                ),
            });
        }
        info!("{} is locked ({}); exporting {}", path.display(), copy_error, root);
        match self.live.export(root, &destination) {
            Ok(()) => Ok(self.acquired(
                destination,
                Strategy::LiveExport {
                    root: root.to_string(),
                },
            )),
            Err(e) if !self.live.is_elevated() => {
                debug!("Export of {} failed without elevation: {}", root, e);
                Err(AcquireFailure::LockedWithoutPrivilege {
                    path: path.to_path_buf(),
                    root: root.to_string(),
                })
            }
            Err(e) => Err(AcquireFailure::Export {
                path: path.to_path_buf(),
                detail: format!("{}: {}", root, e),
            }),
        }
    }

    fn acquired(&self, path: TempPath, strategy: Strategy) -> AcquiredHive {
        let digests = if self.record_digests {
            match util::digest_file(&path) {
                Ok(digests) => Some(digests),
                Err(e) => {
                    warn!("Unable to hash {}: {}", path.display(), e);
                    None
                }
            }
        } else {
            None
        };
        AcquiredHive {
            path,
            strategy,
            digests,
        }
    }
}
