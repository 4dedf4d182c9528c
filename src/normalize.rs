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

//! Renders one decoded value as a display string that is safe to put in a CSV cell.

use crate::hive::{HiveValue, ValueData, ValueKind};
use crate::util;

/// Hex renderings longer than this are cut and tagged as truncated.
pub const HEX_DISPLAY_LIMIT: usize = 100;

pub const TAG_HEX: &str = "[HEX]";
pub const TAG_HEX_TRUNCATED: &str = "[HEX_TRUNCATED]";
pub const TAG_LIST: &str = "[LIST]";
pub const TAG_INT: &str = "[INT]";
pub const TAG_RAW_LATIN: &str = "[RAW_LATIN]";
pub const TAG_PARSE_ERROR: &str = "[PARSE_ERROR]";

/// Never fails: a value the decoder cannot materialize becomes a `[PARSE_ERROR]` string.
pub fn normalize<V: HiveValue>(value: &V) -> String {
    match value.data() {
        Ok(data) => normalize_data(value.kind(), data),
        Err(err) => format!("{} {}", TAG_PARSE_ERROR, err),
    }
}

pub fn normalize_data(kind: ValueKind, data: ValueData) -> String {
    match (kind, data) {
        (ValueKind::Binary, ValueData::Bytes(bytes)) => render_hex(&bytes),
        (ValueKind::MultiString, ValueData::Strings(strings)) => {
            format!("{} {}", TAG_LIST, strings.join("; "))
        }
        (kind, ValueData::Integer(n)) if kind.is_integer() => format!("{} {}", TAG_INT, n),
        (_, data) => render_text(data),
    }
}

fn render_hex(bytes: &[u8]) -> String {
    let hex = util::to_hex_string(bytes);
    if hex.len() > HEX_DISPLAY_LIMIT {
        // hex is ASCII so byte slicing is on a char boundary
        format!("{} {}...", TAG_HEX_TRUNCATED, &hex[..HEX_DISPLAY_LIMIT])
    } else {
        format!("{} {}", TAG_HEX, hex)
    }
}

fn render_text(data: ValueData) -> String {
    match data {
        ValueData::None => String::new(),
        ValueData::Text(s) => clean_text(&s),
        ValueData::Strings(strings) => clean_text(&strings.join("; ")),
        ValueData::Integer(n) => n.to_string(),
        ValueData::Bytes(bytes) => match std::str::from_utf8(&bytes) {
            Ok(s) => clean_text(s),
            Err(_) => render_raw_latin(&bytes),
        },
        ValueData::RawText(bytes) => render_raw_latin(&bytes),
    }
}

fn render_raw_latin(bytes: &[u8]) -> String {
    format!("{} {}", TAG_RAW_LATIN, clean_text(&util::from_latin1(bytes)))
}

/// Drops NULs (they break downstream CSV readers) and surrounding whitespace.
pub fn clean_text(s: &str) -> String {
    s.replace('\0', "").trim().to_string()
}
