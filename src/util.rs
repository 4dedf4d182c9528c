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

use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Converts a DateTime<Utc> to ISO-8601/RFC-3339 format `%Y-%m-%dT%H:%M:%S%.7fZ`, matching the 100ns precision of a FILETIME
pub fn format_date_time(date_time: DateTime<Utc>) -> String {
    let fractional_seconds = date_time.format("%9f").to_string();
    const EXPECTED_FRACTIONAL_SECONDS_LEN: usize = 9;
    if fractional_seconds.len() == EXPECTED_FRACTIONAL_SECONDS_LEN
        && fractional_seconds.ends_with("00")
    {
        return format!(
            "{}.{}Z",
            date_time.format("%Y-%m-%dT%H:%M:%S"),
            &fractional_seconds[..7]
        );
    }
    date_time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Uppercase hex pairs separated by a single space
pub fn to_hex_string(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 3);
    for byte in bytes {
        write!(s, "{:02X} ", byte).expect("Writing to an allocated string cannot fail");
    }
    s.trim_end().to_string()
}

/// Maps every byte to the code point of the same value (ISO-8859-1), so nothing is dropped.
pub fn from_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|b| *b as char).collect()
}

/// True when `err` means another process holds the file or we may not open it.
pub fn is_lock_error(err: &io::Error) -> bool {
    const ERROR_SHARING_VIOLATION: i32 = 32;
    const ERROR_LOCK_VIOLATION: i32 = 33;
    if err.kind() == io::ErrorKind::PermissionDenied {
        return true;
    }
    cfg!(windows)
        && matches!(
            err.raw_os_error(),
            Some(ERROR_SHARING_VIOLATION) | Some(ERROR_LOCK_VIOLATION)
        )
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Serialize)]
pub struct FileDigests {
    pub md5: String,
    pub blake3: String,
}

/// Streams a file once through both hashers.
pub fn digest_file(path: &Path) -> io::Result<FileDigests> {
    let mut file = File::open(path)?;
    let mut md5_context = md5::Context::new();
    let mut blake3_hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        md5_context.consume(&buffer[..read]);
        blake3_hasher.update(&buffer[..read]);
    }
    Ok(FileDigests {
        md5: format!("{:x}", md5_context.compute()),
        blake3: blake3_hasher.finalize().to_hex().to_string(),
    })
}

/// The file name component used to identify a source in output rows.
pub fn source_name(path: &Path) -> String {
    path.file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;

    #[test]
    fn test_format_date_time() {
        let date_time = Utc.with_ymd_and_hms(2021, 3, 4, 12, 34, 56).unwrap()
            + chrono::Duration::nanoseconds(123_456_700);
        assert_eq!("2021-03-04T12:34:56.1234567Z", format_date_time(date_time));

        let odd = Utc.with_ymd_and_hms(2021, 3, 4, 12, 34, 56).unwrap()
            + chrono::Duration::nanoseconds(1);
        assert_eq!("2021-03-04T12:34:56.000000001Z", format_date_time(odd));
    }

    #[test]
    fn test_to_hex_string() {
        assert_eq!("", to_hex_string(&[]));
        assert_eq!("00 0A FF", to_hex_string(&[0x00, 0x0a, 0xff]));
    }

    #[test]
    fn test_from_latin1() {
        assert_eq!("caf\u{e9}", from_latin1(&[0x63, 0x61, 0x66, 0xe9]));
    }

    #[test]
    fn test_is_lock_error() {
        assert!(is_lock_error(&io::Error::from(io::ErrorKind::PermissionDenied)));
        assert!(!is_lock_error(&io::Error::from(io::ErrorKind::NotFound)));
    }

    #[test]
    fn test_digest_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"abc").unwrap();
        let digests = digest_file(file.path()).unwrap();
        assert_eq!("900150983cd24fb0d6963f7d28e17f72", digests.md5);
        assert_eq!(
            "6437b3ac38465133ffb63b75273a8db548c558465d79db03fd359c6cd5bd9d85",
            digests.blake3
        );
    }

    #[test]
    fn test_source_name() {
        assert_eq!("SYSTEM", source_name(Path::new("/evidence/config/SYSTEM")));
    }
}
