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

//! Decides whether a file is a registry hive, and finds hives under a folder.

use crate::err::Error;
use crate::util;
use log::{debug, warn};
use regex::Regex;
use serde::Serialize;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use walkdir::WalkDir;

pub const HIVE_SIGNATURE: &[u8; 4] = b"regf";
/// A hive is at least one base block long.
pub const MIN_HIVE_SIZE: u64 = 4096;

/// Base names (lowercase) that are always treated as hives.
pub const KNOWN_SYSTEM_HIVES: [&str; 6] = [
    "sam",
    "security",
    "software",
    "system",
    "default",
    "ntuser.dat",
];

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum Classification {
    DefiniteHive,
    ProbableHive,
    NotAHive,
}

impl Classification {
    pub fn is_hive(self) -> bool {
        self != Classification::NotAHive
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct DiscoveredHive {
    pub path: PathBuf,
    pub classification: Classification,
}

impl DiscoveredHive {
    /// Classifies a path named directly by the caller.
    pub fn from_path<P: Into<PathBuf>>(path: P) -> Self {
        let path = path.into();
        let classification = classify(&path);
        DiscoveredHive {
            path,
            classification,
        }
    }
}

/// Transaction logs and backups that sit next to hives.
fn hive_artifact_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\.(log\d*|blf|sav|jfm|regtrans-ms)$").expect("Static pattern is valid")
    })
}

pub fn is_hive_artifact(file_name: &str) -> bool {
    hive_artifact_pattern().is_match(file_name)
}

pub fn is_known_system_hive(file_name: &str) -> bool {
    let lower = file_name.to_lowercase();
    KNOWN_SYSTEM_HIVES.contains(&lower.as_str())
}

pub fn classify(path: &Path) -> Classification {
    let file_name = util::source_name(path);
    if is_hive_artifact(&file_name) {
        return Classification::NotAHive;
    }
    if is_known_system_hive(&file_name) {
        return Classification::DefiniteHive;
    }
    classify_content(path)
}

fn classify_content(path: &Path) -> Classification {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if util::is_lock_error(&e) => {
            // held open by someone else: most likely an in-use hive
            debug!("{}: locked ({}), assuming hive", path.display(), e);
            return Classification::ProbableHive;
        }
        Err(e) => {
            debug!("{}: {}", path.display(), e);
            return Classification::NotAHive;
        }
    };
    match file.metadata() {
        Ok(metadata) if metadata.is_file() && metadata.len() >= MIN_HIVE_SIZE => {}
        _ => return Classification::NotAHive,
    }
    let mut signature = [0u8; 4];
    match file.read_exact(&mut signature) {
        Ok(()) if &signature == HIVE_SIGNATURE => Classification::ProbableHive,
        Ok(()) => Classification::NotAHive,
        Err(e) if util::is_lock_error(&e) => Classification::ProbableHive,
        Err(_) => Classification::NotAHive,
    }
}

/// Recursively scans `root`, returning hives in file name order.
pub fn discover(root: &Path) -> Result<Vec<DiscoveredHive>, Error> {
    fs::metadata(root)?;
    let mut found = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        if entry.file_type().is_dir() {
            continue;
        }
        let classification = classify(entry.path());
        if classification.is_hive() {
            debug!("{}: {:?}", entry.path().display(), classification);
            found.push(DiscoveredHive {
                path: entry.into_path(),
                classification,
            });
        }
    }
    Ok(found)
}
