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

use crate::err::Error;
use crate::walker::ExtractedRow;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Column names downstream tooling keys on; do not reorder.
pub const HEADER: [&str; 6] = [
    "Source_Hive",
    "Last_Modified",
    "Key_Path",
    "Value_Name",
    "Data_Type",
    "Data",
];

/// Append-only CSV output for a whole batch. The header is written on creation.
pub struct RowSink<W: Write> {
    writer: csv::Writer<W>,
    rows_written: u64,
}

impl RowSink<BufWriter<File>> {
    pub fn create<P: AsRef<Path>>(output: P) -> Result<Self, Error> {
        let write_file = File::create(output)?;
        RowSink::new(BufWriter::new(write_file))
    }
}

impl<W: Write> RowSink<W> {
    pub fn new(output: W) -> Result<Self, Error> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(output);
        writer.write_record(HEADER)?;
        writer.flush()?;
        Ok(RowSink {
            writer,
            rows_written: 0,
        })
    }

    pub fn write_row(&mut self, row: &ExtractedRow) -> Result<(), Error> {
        self.writer.serialize(row)?;
        self.rows_written += 1;
        Ok(())
    }

    /// Pushes buffered rows out so the file stays well formed if the batch stops here.
    pub fn flush(&mut self) -> Result<(), Error> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    pub fn finish(mut self) -> Result<W, Error> {
        self.writer.flush()?;
        self.writer
            .into_inner()
            .map_err(|e| Error::Io {
                source: e.into_error(),
            })
    }
}
