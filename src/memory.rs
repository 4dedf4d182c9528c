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

//! An in-memory hive tree that plugs into the decoder seam.

use crate::err::Error;
use crate::hive::{
    Hive, HiveDecoder, HiveKey, HiveValue, ValueData, ValueKind, DEFAULT_VALUE_NAME,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

#[derive(Clone, Debug, Default)]
pub struct MemoryKey {
    pub name: String,
    pub last_written: Option<DateTime<Utc>>,
    pub values: Vec<MemoryValue>,
    pub sub_keys: Vec<Arc<MemoryKey>>,
    pub values_unreadable: bool,
    pub sub_keys_unreadable: bool,
}

impl MemoryKey {
    pub fn new(name: &str) -> Self {
        MemoryKey {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn last_written(mut self, last_written: DateTime<Utc>) -> Self {
        self.last_written = Some(last_written);
        self
    }

    pub fn value(mut self, value: MemoryValue) -> Self {
        self.values.push(value);
        self
    }

    pub fn sub_key(mut self, key: MemoryKey) -> Self {
        self.sub_keys.push(Arc::new(key));
        self
    }

    pub fn with_unreadable_values(mut self) -> Self {
        self.values_unreadable = true;
        self
    }

    pub fn with_unreadable_sub_keys(mut self) -> Self {
        self.sub_keys_unreadable = true;
        self
    }

    /// Total number of values reachable from this key, itself included.
    pub fn count_values(&self) -> usize {
        self.values.len()
            + self
                .sub_keys
                .iter()
                .map(|k| k.count_values())
                .sum::<usize>()
    }
}

#[derive(Clone, Debug)]
pub struct MemoryValue {
    pub name: String,
    pub kind: ValueKind,
    pub type_name: String,
    pub data: ValueData,
    pub name_unreadable: bool,
    pub content_error: Option<String>,
}

impl MemoryValue {
    pub fn new(name: &str, kind: ValueKind, data: ValueData) -> Self {
        MemoryValue {
            name: name.to_string(),
            kind,
            type_name: type_name_for(kind).to_string(),
            data,
            name_unreadable: false,
            content_error: None,
        }
    }

    pub fn string(name: &str, s: &str) -> Self {
        Self::new(name, ValueKind::String, ValueData::Text(s.to_string()))
    }

    pub fn dword(name: &str, n: u32) -> Self {
        Self::new(name, ValueKind::Dword, ValueData::Integer(n.into()))
    }

    pub fn binary(name: &str, bytes: &[u8]) -> Self {
        Self::new(name, ValueKind::Binary, ValueData::Bytes(bytes.to_vec()))
    }

    pub fn with_type_name(mut self, type_name: &str) -> Self {
        self.type_name = type_name.to_string();
        self
    }

    pub fn with_unreadable_name(mut self) -> Self {
        self.name_unreadable = true;
        self
    }

    pub fn with_content_error(mut self, detail: &str) -> Self {
        self.content_error = Some(detail.to_string());
        self
    }
}

fn type_name_for(kind: ValueKind) -> &'static str {
    match kind {
        ValueKind::Binary => "REG_BIN",
        ValueKind::MultiString => "REG_MULTI_SZ",
        ValueKind::Dword => "REG_DWORD",
        ValueKind::Qword => "REG_QWORD",
        ValueKind::String => "REG_SZ",
        ValueKind::ExpandString => "REG_EXPAND_SZ",
        ValueKind::Other => "REG_NONE",
    }
}

impl HiveKey for Arc<MemoryKey> {
    type Value = MemoryValue;

    fn name(&self) -> String {
        self.name.clone()
    }

    fn last_written(&self) -> Result<DateTime<Utc>, Error> {
        self.last_written
            .ok_or_else(|| Error::decoder(format!("no valid timestamp for key {}", self.name)))
    }

    fn values(&self) -> Result<Vec<MemoryValue>, Error> {
        if self.values_unreadable {
            return Err(Error::decoder(format!("value list of {} is unreadable", self.name)));
        }
        Ok(self.values.clone())
    }
}

impl HiveValue for MemoryValue {
    fn name(&self) -> Result<String, Error> {
        if self.name_unreadable {
            return Err(Error::decoder("value name is unreadable"));
        }
        if self.name.is_empty() {
            return Ok(DEFAULT_VALUE_NAME.to_string());
        }
        Ok(self.name.clone())
    }

    fn kind(&self) -> ValueKind {
        self.kind
    }

    fn type_name(&self) -> String {
        self.type_name.clone()
    }

    fn data(&self) -> Result<ValueData, Error> {
        match &self.content_error {
            Some(detail) => Err(Error::value_content(detail)),
            None => Ok(self.data.clone()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct MemoryHive {
    root: Arc<MemoryKey>,
}

impl MemoryHive {
    pub fn new(root: MemoryKey) -> Self {
        MemoryHive {
            root: Arc::new(root),
        }
    }
}

impl Hive for MemoryHive {
    type Key = Arc<MemoryKey>;

    fn root_key(&mut self) -> Result<Self::Key, Error> {
        Ok(Arc::clone(&self.root))
    }

    fn sub_keys(&mut self, key: &mut Self::Key) -> Result<Vec<Self::Key>, Error> {
        if key.sub_keys_unreadable {
            return Err(Error::decoder(format!("sub key list of {} is unreadable", key.name)));
        }
        Ok(key.sub_keys.clone())
    }
}

/// Resolves files to registered trees by their exact content.
///
/// Content that was never registered is reported as a corrupt hive, the same
/// way a real decoder rejects bytes it cannot make sense of.
#[derive(Clone, Debug, Default)]
pub struct MemoryDecoder {
    hives: HashMap<Vec<u8>, Arc<MemoryKey>>,
}

impl MemoryDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, content: &[u8], root: MemoryKey) -> &mut Self {
        self.hives.insert(content.to_vec(), Arc::new(root));
        self
    }
}

impl HiveDecoder for MemoryDecoder {
    type Hive = MemoryHive;

    fn open(&self, path: &Path) -> Result<MemoryHive, Error> {
        let content = fs::read(path)?;
        match self.hives.get(&content) {
            Some(root) => Ok(MemoryHive {
                root: Arc::clone(root),
            }),
            None => Err(Error::corrupt_hive(format!(
                "{} is not a recognized hive",
                path.display()
            ))),
        }
    }
}
