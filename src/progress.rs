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
use crate::pipeline::{Aborted, ExtractionHandle, ProgressEvent};
use crate::report::{BatchReport, InputStatus};
use crossterm::{
    cursor,
    terminal::{Clear, ClearType},
    QueueableCommand,
};
use log::warn;
use std::io;
use std::io::{Stdout, Write};

pub fn new(update_console: bool) -> Box<dyn UpdateProgressTrait> {
    if update_console {
        Box::new(UpdateConsole {
            need_final_newline: false,
            stdout: io::stdout(),
        })
    } else {
        Box::new(UpdateNull {})
    }
}

pub trait UpdateProgressTrait {
    /// Rewrites the status line in place.
    fn update(&mut self, msg: &str) -> Result<(), Error>;
    fn write(&mut self, msg: &str) -> Result<(), Error>;

    fn handle_event(&mut self, event: &ProgressEvent) -> Result<(), Error> {
        match event {
            ProgressEvent::Started { total } => self.write(&format!("Extracting {} input(s)\n", total)),
            ProgressEvent::InputStarted {
                index,
                total,
                source,
            } => self.update(&format!("[{}/{}] Parsing {}...", index + 1, total, source)),
            ProgressEvent::InputFinished {
                index,
                total,
                outcome,
            } => {
                let status = match &outcome.status {
                    InputStatus::Succeeded => format!("{} rows", outcome.rows_written),
                    InputStatus::Truncated => format!("{} rows (truncated)", outcome.rows_written),
                    InputStatus::Skipped { reason } => format!("skipped: {}", reason),
                };
                self.write(&format!("[{}/{}] {}: {}\n", index + 1, total, outcome.source, status))
            }
            ProgressEvent::Finished {
                state,
                processed,
                succeeded,
                skipped,
            } => self.write(&format!(
                "{:?}: {} processed, {} succeeded, {} skipped\n",
                state, processed, succeeded, skipped
            )),
        }
    }
}

/// Renders every event of a running batch, then waits for the worker.
///
/// A console that stops accepting output is replaced by a silent one; the
/// worker always runs to the end so its scratch files are cleaned up.
pub fn follow(
    handle: ExtractionHandle,
    mut console: Box<dyn UpdateProgressTrait>,
) -> Result<BatchReport, Aborted> {
    for event in handle.events().iter() {
        if let Err(e) = console.handle_event(&event) {
            warn!("Progress output failed, continuing without it: {}", e);
            console = new(false);
        }
    }
    handle.join()
}

struct UpdateConsole {
    need_final_newline: bool,
    stdout: Stdout,
}

impl UpdateProgressTrait for UpdateConsole {
    fn update(&mut self, msg: &str) -> Result<(), Error> {
        self.stdout.queue(cursor::SavePosition)?;
        self.stdout.queue(Clear(ClearType::UntilNewLine))?;
        self.stdout.write_all(msg.as_bytes())?;
        self.stdout.queue(cursor::RestorePosition)?;
        self.stdout.flush()?;
        self.need_final_newline = true;
        Ok(())
    }

    fn write(&mut self, msg: &str) -> Result<(), Error> {
        if self.need_final_newline {
            self.stdout.queue(Clear(ClearType::UntilNewLine))?;
            self.need_final_newline = false;
        }
        self.stdout.write_all(msg.as_bytes())?;
        self.stdout.flush()?;
        Ok(())
    }
}

impl Drop for UpdateConsole {
    fn drop(&mut self) {
        if self.need_final_newline {
            self.stdout.write_all("\n".as_bytes()).unwrap_or_default();
            self.stdout.flush().unwrap_or_default();
        }
    }
}

struct UpdateNull {}

impl UpdateProgressTrait for UpdateNull {
    fn update(&mut self, _msg: &str) -> Result<(), Error> {
        Ok(())
    }

    fn write(&mut self, _msg: &str) -> Result<(), Error> {
        Ok(())
    }
}
