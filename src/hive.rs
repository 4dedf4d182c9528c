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

//! The seam between extraction and the binary hive decoder.
//!
//! Extraction only ever sees a tree of keys and values through these traits;
//! the production implementation lives in [`crate::notatin_hive`] and an
//! in-memory one in [`crate::memory`].

use crate::err::Error;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;

/// Name reported for a value stored with an empty name.
pub const DEFAULT_VALUE_NAME: &str = "(default)";

/// Opens acquired hive files.
pub trait HiveDecoder {
    type Hive: Hive;

    /// Returns [`Error::CorruptHive`] when the file is recognizably not a usable hive.
    fn open(&self, path: &Path) -> Result<Self::Hive, Error>;
}

/// An open hive handle.
///
/// Sub keys are read through the handle because decoders typically need
/// access to the backing file to materialize them.
pub trait Hive {
    type Key: HiveKey;

    fn root_key(&mut self) -> Result<Self::Key, Error>;
    fn sub_keys(&mut self, key: &mut Self::Key) -> Result<Vec<Self::Key>, Error>;
}

pub trait HiveKey {
    type Value: HiveValue;

    fn name(&self) -> String;
    fn last_written(&self) -> Result<DateTime<Utc>, Error>;
    fn values(&self) -> Result<Vec<Self::Value>, Error>;
}

pub trait HiveValue {
    fn name(&self) -> Result<String, Error>;
    /// Decided once by the decoder layer.
    fn kind(&self) -> ValueKind;
    /// The decoder's own text for the declared type (ex: `REG_SZ`).
    fn type_name(&self) -> String;
    fn data(&self) -> Result<ValueData, Error>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum ValueKind {
    Binary,
    MultiString,
    Dword,
    Qword,
    String,
    ExpandString,
    Other,
}

impl ValueKind {
    pub fn is_integer(self) -> bool {
        matches!(self, ValueKind::Dword | ValueKind::Qword)
    }
}

/// Decoded payload of a value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ValueData {
    None,
    Bytes(Vec<u8>),
    Text(String),
    Strings(Vec<String>),
    /// Stored bytes of a text value the decoder could not convert.
    RawText(Vec<u8>),
    /// Wide enough for every signed and unsigned width a decoder reports.
    Integer(i128),
}
