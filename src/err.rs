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

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("An I/O error has occurred: {}", source)]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("Failed to write output row: {}", source)]
    Csv {
        #[from]
        source: csv::Error,
    },
    #[error("Failed to serialize report: {}", source)]
    Json {
        #[from]
        source: serde_json::Error,
    },
    #[error("Failed to walk directory: {}", source)]
    WalkDir {
        #[from]
        source: walkdir::Error,
    },
    #[error("The hive decoder reported an error: {}", detail)]
    Decoder { detail: String },
    #[error("The hive is corrupt or empty: {}", detail)]
    CorruptHive { detail: String },
    #[error("Unable to read value content: {}", detail)]
    ValueContent { detail: String },
    #[error("An unexpected error has occurred: {}", detail)]
    Any { detail: String },
}

impl Error {
    pub fn decoder<T: ToString>(detail: T) -> Error {
        Error::Decoder {
            detail: detail.to_string(),
        }
    }

    pub fn corrupt_hive<T: ToString>(detail: T) -> Error {
        Error::CorruptHive {
            detail: detail.to_string(),
        }
    }

    pub fn value_content<T: ToString>(detail: T) -> Error {
        Error::ValueContent {
            detail: detail.to_string(),
        }
    }
}
