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

//! Depth-first, pre-order traversal of a hive that yields one row per value.
//!
//! Traversal keeps an explicit worklist rather than recursing, so a deep or
//! hostile hive cannot exhaust the call stack. Failures at a single value or a
//! single key are logged and stepped over; only the rows they would have
//! produced are lost.

use crate::err::Error;
use crate::hive::{Hive, HiveKey, HiveValue};
use crate::normalize;
use crate::util;
use log::{debug, warn};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub const KEY_PATH_DELIMITER: &str = "\\";
pub const UNKNOWN_TIMESTAMP: &str = "UNKNOWN";

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ExtractedRow {
    #[serde(rename = "Source_Hive")]
    pub source: String,
    #[serde(rename = "Last_Modified")]
    pub last_modified: String,
    #[serde(rename = "Key_Path")]
    pub key_path: String,
    #[serde(rename = "Value_Name")]
    pub value_name: String,
    #[serde(rename = "Data_Type")]
    pub data_type: String,
    #[serde(rename = "Data")]
    pub data: String,
}

/// Bounds on a single traversal. Unset fields mean unbounded.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct WalkLimits {
    pub max_keys: Option<usize>,
    pub max_duration: Option<Duration>,
}

pub struct HiveWalker<'h, H: Hive> {
    hive: &'h mut H,
    source: String,
    limits: WalkLimits,
    started: Instant,
    stack: Vec<(H::Key, String)>,
    pending: VecDeque<ExtractedRow>,
    keys_visited: usize,
    values_skipped: usize,
    truncated: bool,
}

/// The caller is responsible for having obtained a valid `root` from `hive`.
pub fn walk<'h, H: Hive>(hive: &'h mut H, root: H::Key, source_name: &str) -> HiveWalker<'h, H> {
    HiveWalker::new(hive, root, source_name)
}

impl<'h, H: Hive> HiveWalker<'h, H> {
    pub fn new(hive: &'h mut H, root: H::Key, source_name: &str) -> Self {
        HiveWalker {
            hive,
            source: source_name.to_string(),
            limits: WalkLimits::default(),
            started: Instant::now(),
            stack: vec![(root, String::new())],
            pending: VecDeque::new(),
            keys_visited: 0,
            values_skipped: 0,
            truncated: false,
        }
    }

    pub fn with_limits(mut self, limits: WalkLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn keys_visited(&self) -> usize {
        self.keys_visited
    }

    pub fn values_skipped(&self) -> usize {
        self.values_skipped
    }

    /// True once a [`WalkLimits`] bound stopped the traversal early.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    fn limit_reached(&self) -> bool {
        if let Some(max_keys) = self.limits.max_keys {
            if self.keys_visited >= max_keys {
                return true;
            }
        }
        if let Some(max_duration) = self.limits.max_duration {
            if self.started.elapsed() >= max_duration {
                return true;
            }
        }
        false
    }

    fn visit(&mut self, key: &mut H::Key, parent_path: &str) {
        self.keys_visited += 1;
        let key_path = format!("{}{}{}", parent_path, KEY_PATH_DELIMITER, key.name());

        let last_modified = match key.last_written() {
            Ok(date_time) => util::format_date_time(date_time),
            Err(e) => {
                warn!("{}: {}: {}", self.source, key_path, e);
                UNKNOWN_TIMESTAMP.to_string()
            }
        };

        match key.values() {
            Ok(values) => {
                for value in values {
                    match self.build_row(&value, &last_modified, &key_path) {
                        Ok(row) => self.pending.push_back(row),
                        Err(e) => {
                            self.values_skipped += 1;
                            warn!("{}: {}: skipping value: {}", self.source, key_path, e);
                        }
                    }
                }
            }
            Err(e) => warn!("{}: {}: skipping values: {}", self.source, key_path, e),
        }

        match self.hive.sub_keys(key) {
            Ok(sub_keys) => {
                // reversed so the first sub key is popped first
                for sub_key in sub_keys.into_iter().rev() {
                    self.stack.push((sub_key, key_path.clone()));
                }
            }
            Err(e) => warn!("{}: {}: skipping sub keys: {}", self.source, key_path, e),
        }
    }

    fn build_row(
        &self,
        value: &<H::Key as HiveKey>::Value,
        last_modified: &str,
        key_path: &str,
    ) -> Result<ExtractedRow, Error> {
        Ok(ExtractedRow {
            source: self.source.clone(),
            last_modified: last_modified.to_string(),
            key_path: key_path.to_string(),
            value_name: value.name()?,
            data_type: value.type_name(),
            data: normalize::normalize(value),
        })
    }
}

impl<'h, H: Hive> Iterator for HiveWalker<'h, H> {
    type Item = ExtractedRow;

    fn next(&mut self) -> Option<ExtractedRow> {
        loop {
            if let Some(row) = self.pending.pop_front() {
                return Some(row);
            }
            if self.truncated {
                return None;
            }
            let (mut key, parent_path) = self.stack.pop()?;
            if self.limit_reached() {
                warn!(
                    "{}: traversal stopped after {} keys ({} keys still queued)",
                    self.source,
                    self.keys_visited,
                    self.stack.len() + 1
                );
                self.truncated = true;
                self.stack.clear();
                return None;
            }
            self.visit(&mut key, &parent_path);
        }
    }
}

impl<'h, H: Hive> Drop for HiveWalker<'h, H> {
    fn drop(&mut self) {
        debug!(
            "{}: visited {} keys, skipped {} values",
            self.source, self.keys_visited, self.values_skipped
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hive::{ValueData, ValueKind};
    use crate::memory::{MemoryHive, MemoryKey, MemoryValue};
    use chrono::{TimeZone, Utc};

    fn sample_tree() -> MemoryKey {
        let ts = Utc.with_ymd_and_hms(2020, 1, 2, 3, 4, 5).unwrap();
        MemoryKey::new("ROOT")
            .last_written(ts)
            .value(MemoryValue::string("RootValue", "r"))
            .sub_key(
                MemoryKey::new("Software")
                    .last_written(ts)
                    .value(MemoryValue::dword("Count", 3))
                    .sub_key(
                        MemoryKey::new("Vendor")
                            .last_written(ts)
                            .value(MemoryValue::string("Name", "acme")),
                    ),
            )
            .sub_key(
                MemoryKey::new("System")
                    .last_written(ts)
                    .value(MemoryValue::binary("Blob", &[0xde, 0xad])),
            )
    }

    fn collect(root: MemoryKey) -> Vec<ExtractedRow> {
        let mut hive = MemoryHive::new(root);
        let root = hive.root_key().unwrap();
        walk(&mut hive, root, "SOFTWARE").collect()
    }

    #[test]
    fn test_walk_pre_order() {
        let rows = collect(sample_tree());
        let paths: Vec<(&str, &str)> = rows
            .iter()
            .map(|r| (r.key_path.as_str(), r.value_name.as_str()))
            .collect();
        assert_eq!(
            vec![
                ("\\ROOT", "RootValue"),
                ("\\ROOT\\Software", "Count"),
                ("\\ROOT\\Software\\Vendor", "Name"),
                ("\\ROOT\\System", "Blob"),
            ],
            paths
        );
        assert_eq!(
            ExtractedRow {
                source: "SOFTWARE".to_string(),
                last_modified: "2020-01-02T03:04:05.0000000Z".to_string(),
                key_path: "\\ROOT\\Software".to_string(),
                value_name: "Count".to_string(),
                data_type: "REG_DWORD".to_string(),
                data: "[INT] 3".to_string(),
            },
            rows[1]
        );
        assert_eq!("[HEX] DE AD", rows[3].data);
    }

    #[test]
    fn test_walk_bad_timestamp() {
        let root = MemoryKey::new("ROOT")
            .value(MemoryValue::string("A", "a"))
            .sub_key(MemoryKey::new("Child").value(MemoryValue::string("B", "b")));
        let rows = collect(root);
        assert_eq!(2, rows.len());
        assert!(rows.iter().all(|r| r.last_modified == UNKNOWN_TIMESTAMP));
        assert_eq!("\\ROOT\\Child", rows[1].key_path);
    }

    #[test]
    fn test_walk_skips_bad_values() {
        let root = MemoryKey::new("ROOT")
            .value(MemoryValue::string("First", "1"))
            .value(MemoryValue::string("Broken", "x").with_unreadable_name())
            .value(MemoryValue::string("Unparsed", "x").with_content_error("bad cell"))
            .value(MemoryValue::string("Last", "3"));
        let mut hive = MemoryHive::new(root);
        let root = hive.root_key().unwrap();
        let mut walker = walk(&mut hive, root, "NTUSER.DAT");
        let rows: Vec<ExtractedRow> = walker.by_ref().collect();
        assert_eq!(1, walker.values_skipped());
        let names: Vec<&str> = rows.iter().map(|r| r.value_name.as_str()).collect();
        assert_eq!(vec!["First", "Unparsed", "Last"], names);
        assert!(rows[1].data.starts_with("[PARSE_ERROR]"));
    }

    #[test]
    fn test_walk_corrupt_branch_keeps_sibling_paths() {
        let root = MemoryKey::new("ROOT")
            .sub_key(
                MemoryKey::new("Bad")
                    .value(MemoryValue::string("Kept", "k"))
                    .sub_key(MemoryKey::new("Lost").value(MemoryValue::string("L", "l")))
                    .with_unreadable_sub_keys(),
            )
            .sub_key(MemoryKey::new("NoValues").with_unreadable_values())
            .sub_key(MemoryKey::new("Good").value(MemoryValue::string("G", "g")));
        let rows = collect(root);
        let paths: Vec<&str> = rows.iter().map(|r| r.key_path.as_str()).collect();
        assert_eq!(vec!["\\ROOT\\Bad", "\\ROOT\\Good"], paths);
    }

    #[test]
    fn test_walk_row_count_matches_values() {
        let root = sample_tree();
        let expected = root.count_values();
        assert_eq!(expected, collect(root).len());
    }

    #[test]
    fn test_walk_deep_chain() {
        let depth = 1_000;
        let mut key = MemoryKey::new("leaf").value(MemoryValue::string("Deep", "d"));
        for i in (0..depth).rev() {
            key = MemoryKey::new(&format!("k{}", i)).sub_key(key);
        }
        let rows = collect(key);
        assert_eq!(1, rows.len());
        assert_eq!(depth + 1, rows[0].key_path.matches(KEY_PATH_DELIMITER).count());
        assert!(rows[0].key_path.ends_with("\\k999\\leaf"));
    }

    #[test]
    fn test_walk_max_keys() {
        let mut hive = MemoryHive::new(sample_tree());
        let root = hive.root_key().unwrap();
        let mut walker = walk(&mut hive, root, "SOFTWARE").with_limits(WalkLimits {
            max_keys: Some(2),
            max_duration: None,
        });
        let rows: Vec<ExtractedRow> = walker.by_ref().collect();
        assert_eq!(2, rows.len());
        assert!(walker.truncated());
        assert_eq!(2, walker.keys_visited());
    }

    #[test]
    fn test_walk_other_kinds() {
        let root = MemoryKey::new("ROOT").value(MemoryValue::new(
            "Paths",
            ValueKind::MultiString,
            ValueData::Strings(vec!["a".to_string(), "b".to_string()]),
        ));
        let rows = collect(root);
        assert_eq!("[LIST] a; b", rows[0].data);
        assert_eq!("REG_MULTI_SZ", rows[0].data_type);
    }

    #[test]
    fn test_walk_default_value_name() {
        let root = MemoryKey::new("ROOT").value(MemoryValue::string("", "shell"));
        let rows = collect(root);
        assert_eq!("(default)", rows[0].value_name);
        assert_eq!("shell", rows[0].data);
    }

    #[test]
    fn test_walk_keeps_decoder_type_name() {
        let root = MemoryKey::new("ROOT")
            .value(MemoryValue::dword("Swapped", 16).with_type_name("REG_DWORD_BIG_ENDIAN"));
        let rows = collect(root);
        assert_eq!("REG_DWORD_BIG_ENDIAN", rows[0].data_type);
        assert_eq!("[INT] 16", rows[0].data);
    }
}
