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

//! Hive decoding backed by the `notatin` registry parser.

use crate::err::Error;
use crate::hive::{Hive, HiveDecoder, HiveKey, HiveValue, ValueData, ValueKind};
use chrono::{DateTime, TimeZone, Utc};
use notatin::{
    cell_key_node::CellKeyNode,
    cell_key_value::{CellKeyValue, CellKeyValueDataTypes},
    cell_value::CellValue,
    log::{LogCode, Logs},
    parser::Parser,
    parser_builder::ParserBuilder,
};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

/// Hive content is untrusted; a decoder panic is reported as an error instead of unwinding into the batch.
fn guarded<T>(what: &str, f: impl FnOnce() -> T) -> Result<T, Error> {
    panic::catch_unwind(AssertUnwindSafe(f))
        .map_err(|_| Error::decoder(format!("decoder panicked while reading {}", what)))
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NotatinDecoder {}

impl NotatinDecoder {
    pub fn new() -> Self {
        NotatinDecoder {}
    }
}

impl HiveDecoder for NotatinDecoder {
    type Hive = NotatinHive;

    fn open(&self, path: &Path) -> Result<NotatinHive, Error> {
        let primary = path.to_path_buf();
        let parser = guarded("base block", || ParserBuilder::from_path(primary).build())?
            .map_err(Error::corrupt_hive)?;
        Ok(NotatinHive { parser })
    }
}

pub struct NotatinHive {
    parser: Parser,
}

impl Hive for NotatinHive {
    type Key = CellKeyNode;

    fn root_key(&mut self) -> Result<CellKeyNode, Error> {
        let parser = &mut self.parser;
        match guarded("root key", || parser.get_root_key())? {
            Ok(Some(root)) => Ok(root),
            Ok(None) => Err(Error::corrupt_hive("hive has no root key")),
            Err(e) => Err(Error::corrupt_hive(e)),
        }
    }

    fn sub_keys(&mut self, key: &mut CellKeyNode) -> Result<Vec<CellKeyNode>, Error> {
        let parser = &mut self.parser;
        guarded("sub keys", || key.read_sub_keys(parser))
    }
}

/// FILETIME zero; decoders report it for keys whose timestamp was never set or is unreadable.
fn windows_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1601, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl HiveKey for CellKeyNode {
    type Value = CellKeyValue;

    fn name(&self) -> String {
        self.key_name.clone()
    }

    fn last_written(&self) -> Result<DateTime<Utc>, Error> {
        let last_written = guarded("key timestamp", || self.last_key_written_date_and_time())?;
        if last_written <= windows_epoch() {
            return Err(Error::decoder(format!(
                "invalid last written timestamp for {}",
                self.key_name
            )));
        }
        Ok(last_written)
    }

    fn values(&self) -> Result<Vec<CellKeyValue>, Error> {
        guarded("value list", || self.value_iter().collect())
    }
}

impl HiveValue for CellKeyValue {
    fn name(&self) -> Result<String, Error> {
        guarded("value name", || self.get_pretty_name())
    }

    fn kind(&self) -> ValueKind {
        kind_for(self.data_type)
    }

    fn type_name(&self) -> String {
        format!("{:?}", self.data_type)
    }

    fn data(&self) -> Result<ValueData, Error> {
        let (content, logs) = guarded("value content", || self.get_content())?;
        let undecodable = if has_conversion_warning(&logs) {
            self.detail.value_bytes()
        } else {
            None
        };
        content_to_data(content, undecodable, || {
            logs.map(|l| l.to_string())
                .unwrap_or_else(|| "unrecognized content".to_string())
        })
    }
}

fn has_conversion_warning(logs: &Option<Logs>) -> bool {
    logs.as_ref()
        .and_then(|l| l.get())
        .map(|entries| entries.iter().any(|e| e.code == LogCode::WarningConversion))
        .unwrap_or(false)
}

pub(crate) fn kind_for(data_type: CellKeyValueDataTypes) -> ValueKind {
    match data_type {
        CellKeyValueDataTypes::REG_BIN => ValueKind::Binary,
        CellKeyValueDataTypes::REG_MULTI_SZ => ValueKind::MultiString,
        CellKeyValueDataTypes::REG_DWORD | CellKeyValueDataTypes::REG_DWORD_BIG_ENDIAN => {
            ValueKind::Dword
        }
        CellKeyValueDataTypes::REG_QWORD => ValueKind::Qword,
        CellKeyValueDataTypes::REG_SZ => ValueKind::String,
        CellKeyValueDataTypes::REG_EXPAND_SZ => ValueKind::ExpandString,
        _ => ValueKind::Other,
    }
}

/// `undecodable` carries the stored bytes when the decoder had to substitute
/// characters while converting text; they replace the lossy string.
pub(crate) fn content_to_data<F: FnOnce() -> String>(
    content: CellValue,
    undecodable: Option<Vec<u8>>,
    error_detail: F,
) -> Result<ValueData, Error> {
    if let (CellValue::String(_) | CellValue::MultiString(_), Some(bytes)) = (&content, undecodable)
    {
        return Ok(ValueData::RawText(bytes));
    }
    Ok(match content {
        CellValue::Binary(bytes) => ValueData::Bytes(bytes),
        CellValue::String(s) => ValueData::Text(s),
        CellValue::MultiString(strings) => ValueData::Strings(strings),
        CellValue::U32(n) => ValueData::Integer(n.into()),
        CellValue::I32(n) => ValueData::Integer(n.into()),
        CellValue::U64(n) => ValueData::Integer(n.into()),
        CellValue::I64(n) => ValueData::Integer(n.into()),
        CellValue::Error => return Err(Error::value_content(error_detail())),
        _ => ValueData::None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize;
    use crate::walker::{self, ExtractedRow};
    use std::io::Write;

    const BASE_BLOCK_SIZE: usize = 4096;
    const HBIN_SIZE: usize = 4096;
    /// 2021-01-01T00:00:00Z
    const FILETIME_2021: u64 = 132_539_328_000_000_000;

    fn put_u16(buf: &mut [u8], at: usize, v: u16) {
        buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
    }

    fn put_u32(buf: &mut [u8], at: usize, v: u32) {
        buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn put_u64(buf: &mut [u8], at: usize, v: u64) {
        buf[at..at + 8].copy_from_slice(&v.to_le_bytes());
    }

    /// Writes a `vk` cell at `at` (relative to the first hbin) and returns its size.
    fn put_value(hbin: &mut [u8], at: usize, name: &str, data_type: u32, size_raw: u32, offset: u32) -> usize {
        let size = (24 + name.len() + 7) & !7;
        put_u32(hbin, at, (size as i32).wrapping_neg() as u32);
        hbin[at + 4..at + 6].copy_from_slice(b"vk");
        put_u16(hbin, at + 6, name.len() as u16);
        put_u32(hbin, at + 8, size_raw);
        put_u32(hbin, at + 12, offset);
        put_u32(hbin, at + 16, data_type);
        put_u16(hbin, at + 20, 0x0001); // ascii name
        hbin[at + 24..at + 24 + name.len()].copy_from_slice(name.as_bytes());
        size
    }

    /// Writes a data cell holding `data` and returns its size.
    fn put_data(hbin: &mut [u8], at: usize, data: &[u8]) -> usize {
        let size = (4 + data.len() + 7) & !7;
        put_u32(hbin, at, (size as i32).wrapping_neg() as u32);
        hbin[at + 4..at + 4 + data.len()].copy_from_slice(data);
        size
    }

    /// A minimal hive: root key `ROOT` written at `last_written` with three values,
    /// `Count` (REG_DWORD 7, resident), `Name` (REG_SZ "hi") and `Broken` (REG_SZ
    /// holding a lone UTF-16 surrogate).
    fn build_hive(last_written: u64) -> Vec<u8> {
        const REG_SZ: u32 = 1;
        const REG_DWORD: u32 = 4;
        const NONE: u32 = 0xffff_ffff;

        let mut hbin = vec![0u8; HBIN_SIZE];
        hbin[0..4].copy_from_slice(b"hbin");
        put_u32(&mut hbin, 4, 0);
        put_u32(&mut hbin, 8, HBIN_SIZE as u32);

        let root = 32;
        let root_size = (80 + "ROOT".len() + 7) & !7;
        let value_list = root + root_size;
        let value_list_size = 16;
        let count = value_list + value_list_size;
        let name = count + 32;
        let name_data = name + 32;
        let broken = name_data + 16;
        let broken_data = broken + 32;
        let free = broken_data + 16;

        put_u32(&mut hbin, root, (root_size as i32).wrapping_neg() as u32);
        hbin[root + 4..root + 6].copy_from_slice(b"nk");
        put_u16(&mut hbin, root + 6, 0x0024); // hive entry, ascii name
        put_u64(&mut hbin, root + 8, last_written);
        put_u32(&mut hbin, root + 20, NONE); // parent
        put_u32(&mut hbin, root + 24, 0); // sub keys
        put_u32(&mut hbin, root + 28, 0); // volatile sub keys
        put_u32(&mut hbin, root + 32, NONE);
        put_u32(&mut hbin, root + 36, NONE);
        put_u32(&mut hbin, root + 40, 3); // values
        put_u32(&mut hbin, root + 44, value_list as u32);
        put_u32(&mut hbin, root + 48, NONE); // security
        put_u32(&mut hbin, root + 52, NONE); // class name
        put_u16(&mut hbin, root + 76, "ROOT".len() as u16);
        hbin[root + 80..root + 84].copy_from_slice(b"ROOT");

        put_u32(&mut hbin, value_list, (value_list_size as i32).wrapping_neg() as u32);
        put_u32(&mut hbin, value_list + 4, count as u32);
        put_u32(&mut hbin, value_list + 8, name as u32);
        put_u32(&mut hbin, value_list + 12, broken as u32);

        put_value(&mut hbin, count, "Count", REG_DWORD, 0x8000_0004, 7);
        put_value(&mut hbin, name, "Name", REG_SZ, 6, name_data as u32);
        put_data(&mut hbin, name_data, &[0x68, 0x00, 0x69, 0x00, 0x00, 0x00]);
        put_value(&mut hbin, broken, "Broken", REG_SZ, 6, broken_data as u32);
        put_data(&mut hbin, broken_data, &[0x61, 0x00, 0x00, 0xd8, 0x62, 0x00]);
        put_u32(&mut hbin, free, (HBIN_SIZE - free) as u32);

        let mut hive = vec![0u8; BASE_BLOCK_SIZE];
        hive[0..4].copy_from_slice(b"regf");
        put_u32(&mut hive, 4, 1); // primary sequence
        put_u32(&mut hive, 8, 1); // secondary sequence
        put_u64(&mut hive, 12, FILETIME_2021);
        put_u32(&mut hive, 20, 1); // major version
        put_u32(&mut hive, 24, 5); // minor version
        put_u32(&mut hive, 28, 0); // primary file
        put_u32(&mut hive, 32, 1); // direct memory load
        put_u32(&mut hive, 36, root as u32);
        put_u32(&mut hive, 40, HBIN_SIZE as u32);
        put_u32(&mut hive, 44, 1); // clustering factor
        let mut checksum = (0..508)
            .step_by(4)
            .fold(0u32, |acc, i| acc ^ u32::from_le_bytes([hive[i], hive[i + 1], hive[i + 2], hive[i + 3]]));
        if checksum == 0 {
            checksum = 1;
        } else if checksum == u32::MAX {
            checksum = u32::MAX - 1;
        }
        put_u32(&mut hive, 508, checksum);

        hive.extend_from_slice(&hbin);
        hive
    }

    fn hive_file(last_written: u64) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&build_hive(last_written)).unwrap();
        file
    }

    #[test]
    fn test_kind_for() {
        assert_eq!(ValueKind::Binary, kind_for(CellKeyValueDataTypes::REG_BIN));
        assert_eq!(ValueKind::MultiString, kind_for(CellKeyValueDataTypes::REG_MULTI_SZ));
        assert_eq!(ValueKind::Dword, kind_for(CellKeyValueDataTypes::REG_DWORD));
        assert_eq!(ValueKind::Dword, kind_for(CellKeyValueDataTypes::REG_DWORD_BIG_ENDIAN));
        assert_eq!(ValueKind::Qword, kind_for(CellKeyValueDataTypes::REG_QWORD));
        assert_eq!(ValueKind::String, kind_for(CellKeyValueDataTypes::REG_SZ));
        assert_eq!(ValueKind::ExpandString, kind_for(CellKeyValueDataTypes::REG_EXPAND_SZ));
        assert_eq!(ValueKind::Other, kind_for(CellKeyValueDataTypes::REG_NONE));
        assert_eq!(ValueKind::Other, kind_for(CellKeyValueDataTypes::REG_FILETIME));
    }

    #[test]
    fn test_content_to_data() {
        let detail = || "unused".to_string();
        assert_eq!(
            ValueData::Integer(4_294_967_295),
            content_to_data(CellValue::U32(u32::MAX), None, detail).unwrap()
        );
        assert_eq!(
            ValueData::Integer(-5),
            content_to_data(CellValue::I64(-5), None, detail).unwrap()
        );
        assert_eq!(
            ValueData::Bytes(vec![1, 2]),
            content_to_data(CellValue::Binary(vec![1, 2]), None, detail).unwrap()
        );
        let err = content_to_data(CellValue::Error, None, || "bad big data cell".to_string()).unwrap_err();
        assert_eq!("Unable to read value content: bad big data cell", err.to_string());
    }

    #[test]
    fn test_open_rejects_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"this is not a registry hive").unwrap();
        assert!(NotatinDecoder::new().open(file.path()).is_err());
    }

    #[test]
    fn test_content_to_data_undecodable_text() {
        let detail = || "unused".to_string();
        let raw = vec![0x61, 0x00, 0x00, 0xd8, 0x62, 0x00];
        assert_eq!(
            ValueData::RawText(raw.clone()),
            content_to_data(CellValue::String("a\u{fffd}b".to_string()), Some(raw.clone()), detail)
                .unwrap()
        );
        assert_eq!(
            ValueData::RawText(raw.clone()),
            content_to_data(CellValue::MultiString(vec!["a\u{fffd}b".to_string()]), Some(raw.clone()), detail)
                .unwrap()
        );
        assert_eq!(
            ValueData::Text("ab".to_string()),
            content_to_data(CellValue::String("ab".to_string()), None, detail).unwrap()
        );
        assert_eq!(
            ValueData::Bytes(vec![1]),
            content_to_data(CellValue::Binary(vec![1]), Some(raw), detail).unwrap()
        );
    }

    #[test]
    fn test_read_built_hive() {
        let file = hive_file(FILETIME_2021);
        let mut hive = NotatinDecoder::new().open(file.path()).unwrap();
        let mut root = hive.root_key().unwrap();
        assert_eq!("ROOT", root.name());
        assert_eq!(
            Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap(),
            root.last_written().unwrap()
        );
        assert!(hive.sub_keys(&mut root).unwrap().is_empty());

        let values = root.values().unwrap();
        let names: Vec<String> = values.iter().map(|v| v.name().unwrap()).collect();
        assert_eq!(vec!["Count", "Name", "Broken"], names);
        assert_eq!(ValueKind::Dword, values[0].kind());
        assert_eq!("REG_DWORD", values[0].type_name());
        assert_eq!(ValueData::Integer(7), values[0].data().unwrap());
        assert_eq!(ValueKind::String, values[1].kind());
        assert_eq!("hi", normalize::normalize(&values[1]));
        assert_eq!(
            ValueData::RawText(vec![0x61, 0x00, 0x00, 0xd8, 0x62, 0x00]),
            values[2].data().unwrap()
        );
    }

    #[test]
    fn test_walk_built_hive() {
        let file = hive_file(FILETIME_2021);
        let mut hive = NotatinDecoder::new().open(file.path()).unwrap();
        let root = hive.root_key().unwrap();
        let rows: Vec<ExtractedRow> = walker::walk(&mut hive, root, "built.dat").collect();
        let cells: Vec<(&str, &str, &str, &str)> = rows
            .iter()
            .map(|r| {
                (
                    r.key_path.as_str(),
                    r.value_name.as_str(),
                    r.data_type.as_str(),
                    r.data.as_str(),
                )
            })
            .collect();
        assert_eq!(
            vec![
                ("\\ROOT", "Count", "REG_DWORD", "[INT] 7"),
                ("\\ROOT", "Name", "REG_SZ", "hi"),
                ("\\ROOT", "Broken", "REG_SZ", "[RAW_LATIN] a\u{d8}b"),
            ],
            cells
        );
        assert!(rows.iter().all(|r| r.last_modified == "2021-01-01T00:00:00.0000000Z"));
    }

    #[test]
    fn test_epoch_timestamp_is_invalid() {
        let file = hive_file(0);
        let mut hive = NotatinDecoder::new().open(file.path()).unwrap();
        let root = hive.root_key().unwrap();
        assert!(root.last_written().is_err());
        let rows: Vec<ExtractedRow> = walker::walk(&mut hive, root, "built.dat").collect();
        assert_eq!(3, rows.len());
        assert!(rows.iter().all(|r| r.last_modified == walker::UNKNOWN_TIMESTAMP));
    }
}
