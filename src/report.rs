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

use crate::acquire::Strategy;
use crate::err::Error;
use crate::locator::Classification;
use crate::util::FileDigests;
use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum RunState {
    Idle,
    Running,
    Completed,
    /// The caller asked to stop; inputs after the one in flight were not started.
    Stopped,
    Aborted,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub enum InputStatus {
    Succeeded,
    /// Extracted, but a traversal bound stopped the walk early.
    Truncated,
    Skipped { reason: String },
}

#[derive(Clone, Debug, Serialize)]
pub struct InputOutcome {
    pub path: PathBuf,
    pub source: String,
    pub classification: Classification,
    pub status: InputStatus,
    pub rows_written: u64,
    pub values_skipped: usize,
    pub strategy: Option<Strategy>,
    pub digests: Option<FileDigests>,
}

impl InputOutcome {
    pub fn new(path: &Path, source: &str, classification: Classification) -> Self {
        InputOutcome {
            path: path.to_path_buf(),
            source: source.to_string(),
            classification,
            status: InputStatus::Succeeded,
            rows_written: 0,
            values_skipped: 0,
            strategy: None,
            digests: None,
        }
    }

    pub fn skip<T: ToString>(&mut self, reason: T) {
        self.status = InputStatus::Skipped {
            reason: reason.to_string(),
        };
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.status, InputStatus::Skipped { .. })
    }

    fn describe(&self) -> String {
        match &self.status {
            InputStatus::Skipped { reason } => format!("{}: skipped: {}", self.source, reason),
            status => {
                let mut line = format!("{}: {} rows", self.source, self.rows_written);
                if let Some(Strategy::LiveExport { root }) = &self.strategy {
                    line += &format!(", exported from {}", root);
                }
                if self.values_skipped > 0 {
                    line += &format!(", {} unreadable values", self.values_skipped);
                }
                if *status == InputStatus::Truncated {
                    line += ", traversal truncated";
                }
                if let Some(digests) = &self.digests {
                    line += &format!(", md5 {}", digests.md5);
                }
                line
            }
        }
    }
}

/// Tally and log of one batch; readable after the run however it ended.
#[derive(Clone, Debug, Serialize)]
pub struct BatchReport {
    pub state: RunState,
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub rows_written: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcomes: Vec<InputOutcome>,
    pub log: Vec<String>,
}

impl BatchReport {
    pub fn new(total: usize) -> Self {
        BatchReport {
            state: RunState::Idle,
            total,
            processed: 0,
            succeeded: 0,
            skipped: 0,
            rows_written: 0,
            started_at: Utc::now(),
            finished_at: None,
            outcomes: Vec::new(),
            log: Vec::new(),
        }
    }

    pub fn log<T: ToString>(&mut self, line: &T) {
        let line = line.to_string();
        info!("{}", line);
        self.log.push(line);
    }

    pub(crate) fn record(&mut self, outcome: InputOutcome) {
        self.processed += 1;
        if outcome.is_skipped() {
            self.skipped += 1;
        } else {
            self.succeeded += 1;
        }
        self.rows_written += outcome.rows_written;
        let line = format!("[{}/{}] {}", self.processed, self.total, outcome.describe());
        self.log(&line);
        self.outcomes.push(outcome);
    }

    pub(crate) fn finish(&mut self, state: RunState) {
        self.state = state;
        self.finished_at = Some(Utc::now());
        let summary = self.summary();
        self.log(&summary);
    }

    pub fn summary(&self) -> String {
        format!(
            "{:?}: processed {}/{}, succeeded {}, skipped {}, {} rows written",
            self.state, self.processed, self.total, self.succeeded, self.skipped, self.rows_written
        )
    }

    pub fn write_json<W: Write>(&self, output: W) -> Result<(), Error> {
        serde_json::to_writer_pretty(output, self)?;
        Ok(())
    }
}
