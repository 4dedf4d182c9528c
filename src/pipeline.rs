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

//! Runs a batch of inputs through acquisition, decoding and traversal into one CSV.
//!
//! Inputs are handled strictly one after another. A failure with one input is
//! recorded and the batch moves on; only losing the output aborts the run.

use crate::acquire::{AcquiredHive, AcquisitionManager, LiveRegistry};
use crate::err::Error;
use crate::hive::{Hive, HiveDecoder};
use crate::locator::DiscoveredHive;
use crate::report::{BatchReport, InputOutcome, InputStatus, RunState};
use crate::sink::RowSink;
use crate::util;
use crate::walker::{self, WalkLimits};
use log::{debug, warn};
use std::env;
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

#[derive(Clone, Debug)]
pub enum ProgressEvent {
    Started {
        total: usize,
    },
    InputStarted {
        index: usize,
        total: usize,
        source: String,
    },
    InputFinished {
        index: usize,
        total: usize,
        outcome: InputOutcome,
    },
    Finished {
        state: RunState,
        processed: usize,
        succeeded: usize,
        skipped: usize,
    },
}

/// The output could not be written; the report covers everything up to that point.
#[derive(Debug, Error)]
#[error("Extraction aborted: {source}")]
pub struct Aborted {
    pub report: BatchReport,
    #[source]
    pub source: Error,
}

pub struct ExtractorBuilder<D: HiveDecoder, L: LiveRegistry> {
    decoder: D,
    live: L,
    scratch_root: Option<PathBuf>,
    limits: WalkLimits,
    record_digests: bool,
    events: Option<Sender<ProgressEvent>>,
    stop: Option<Arc<AtomicBool>>,
}

impl<D: HiveDecoder, L: LiveRegistry> ExtractorBuilder<D, L> {
    pub fn new(decoder: D, live: L) -> Self {
        ExtractorBuilder {
            decoder,
            live,
            scratch_root: None,
            limits: WalkLimits::default(),
            record_digests: true,
            events: None,
            stop: None,
        }
    }

    /// Parent folder for the per-run scratch directory (default: the OS temp dir).
    pub fn scratch_root<P: Into<PathBuf>>(mut self, scratch_root: P) -> Self {
        self.scratch_root = Some(scratch_root.into());
        self
    }

    pub fn max_keys(mut self, max_keys: usize) -> Self {
        self.limits.max_keys = Some(max_keys);
        self
    }

    pub fn max_duration(mut self, max_duration: Duration) -> Self {
        self.limits.max_duration = Some(max_duration);
        self
    }

    pub fn record_digests(mut self, record_digests: bool) -> Self {
        self.record_digests = record_digests;
        self
    }

    pub fn events(mut self, sender: Sender<ProgressEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    /// Checked between inputs; setting it never interrupts the input in flight.
    pub fn stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn build(self) -> Extractor<D, L> {
        Extractor {
            decoder: self.decoder,
            acquisition: AcquisitionManager::new(self.live).record_digests(self.record_digests),
            scratch_root: self.scratch_root.unwrap_or_else(env::temp_dir),
            limits: self.limits,
            events: self.events,
            stop: self.stop,
        }
    }
}

pub struct Extractor<D: HiveDecoder, L: LiveRegistry> {
    decoder: D,
    acquisition: AcquisitionManager<L>,
    scratch_root: PathBuf,
    limits: WalkLimits,
    events: Option<Sender<ProgressEvent>>,
    stop: Option<Arc<AtomicBool>>,
}

impl<D: HiveDecoder, L: LiveRegistry> Extractor<D, L> {
    /// Creates (or overwrites) `output` and extracts every input into it.
    pub fn run<P: AsRef<Path>>(
        &self,
        inputs: &[DiscoveredHive],
        output: P,
    ) -> Result<BatchReport, Aborted> {
        match RowSink::create(output.as_ref()) {
            Ok(sink) => self.run_with_sink(inputs, sink),
            Err(source) => {
                let mut report = BatchReport::new(inputs.len());
                report.log(&format!(
                    "Unable to create {}: {}",
                    output.as_ref().display(),
                    source
                ));
                Err(self.abort(report, source))
            }
        }
    }

    pub fn run_with_sink<W: Write>(
        &self,
        inputs: &[DiscoveredHive],
        mut sink: RowSink<W>,
    ) -> Result<BatchReport, Aborted> {
        let total = inputs.len();
        let mut report = BatchReport::new(total);

        let scratch = match tempfile::Builder::new()
            .prefix("hive2csv-")
            .tempdir_in(&self.scratch_root)
        {
            Ok(scratch) => scratch,
            Err(e) => {
                report.log(&format!(
                    "Unable to create scratch directory in {}: {}",
                    self.scratch_root.display(),
                    e
                ));
                return Err(self.abort(report, e.into()));
            }
        };
        debug!("Scratch directory {}", scratch.path().display());

        report.state = RunState::Running;
        self.emit(ProgressEvent::Started { total });

        let mut state = RunState::Completed;
        for (index, input) in inputs.iter().enumerate() {
            if self.stop_requested() {
                report.log(&format!("Stop requested; {} of {} inputs not started", total - index, total));
                state = RunState::Stopped;
                break;
            }
            let source = util::source_name(&input.path);
            self.emit(ProgressEvent::InputStarted {
                index,
                total,
                source: source.clone(),
            });

            let processed = panic::catch_unwind(AssertUnwindSafe(|| {
                self.process_input(input, &source, scratch.path(), &mut sink)
            }));
            let outcome = match processed {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    report.log(&format!("Output failed while writing {}: {}", source, e));
                    // TempDir removes the scratch directory on drop
                    return Err(self.abort(report, e));
                }
                Err(_) => {
                    warn!("{}: extraction panicked", source);
                    let mut outcome =
                        InputOutcome::new(&input.path, &source, input.classification);
                    outcome.skip("internal error: extraction panicked");
                    outcome
                }
            };
            report.record(outcome.clone());
            self.emit(ProgressEvent::InputFinished {
                index,
                total,
                outcome,
            });
        }

        if let Err(e) = sink.finish() {
            report.log(&format!("Unable to finish output: {}", e));
            return Err(self.abort(report, e));
        }
        if let Err(e) = scratch.close() {
            warn!("Unable to remove scratch directory: {}", e);
        }
        report.finish(state);
        self.emit_finished(&report);
        Ok(report)
    }

    /// Per-input failures are folded into the outcome; `Err` means the sink failed.
    fn process_input<W: Write>(
        &self,
        input: &DiscoveredHive,
        source: &str,
        scratch_dir: &Path,
        sink: &mut RowSink<W>,
    ) -> Result<InputOutcome, Error> {
        let (path, classification) = (input.path.as_path(), input.classification);
        let mut outcome = InputOutcome::new(path, source, classification);
        if !classification.is_hive() {
            outcome.skip("not a registry hive");
            return Ok(outcome);
        }

        let acquired = match self.acquisition.acquire(path, classification, scratch_dir) {
            Ok(acquired) => acquired,
            Err(e) => {
                outcome.skip(e);
                return Ok(outcome);
            }
        };
        outcome.strategy = Some(acquired.strategy.clone());
        outcome.digests = acquired.digests.clone();

        let extracted = self.extract(&acquired, source, sink, &mut outcome);
        if let Err(e) = acquired.release() {
            warn!("Unable to remove temporary copy of {}: {}", source, e);
        }
        extracted?;
        Ok(outcome)
    }

    fn extract<W: Write>(
        &self,
        acquired: &AcquiredHive,
        source: &str,
        sink: &mut RowSink<W>,
        outcome: &mut InputOutcome,
    ) -> Result<(), Error> {
        let mut hive = match self.decoder.open(acquired.path()) {
            Ok(hive) => hive,
            Err(e) => {
                outcome.skip(e);
                return Ok(());
            }
        };
        let root = match hive.root_key() {
            Ok(root) => root,
            Err(e) => {
                outcome.skip(e);
                return Ok(());
            }
        };

        let mut rows = walker::walk(&mut hive, root, source).with_limits(self.limits);
        for row in rows.by_ref() {
            sink.write_row(&row)?;
            outcome.rows_written += 1;
        }
        outcome.values_skipped = rows.values_skipped();
        if rows.truncated() {
            outcome.status = InputStatus::Truncated;
        }
        sink.flush()
    }

    fn stop_requested(&self) -> bool {
        self.stop
            .as_ref()
            .map(|stop| stop.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(events) = &self.events {
            // a host that stopped listening does not stop the batch
            let _ = events.send(event);
        }
    }

    fn emit_finished(&self, report: &BatchReport) {
        self.emit(ProgressEvent::Finished {
            state: report.state,
            processed: report.processed,
            succeeded: report.succeeded,
            skipped: report.skipped,
        });
    }

    fn abort(&self, mut report: BatchReport, source: Error) -> Aborted {
        report.finish(RunState::Aborted);
        self.emit_finished(&report);
        Aborted { report, source }
    }
}

/// A batch running on its own worker thread.
pub struct ExtractionHandle {
    events: Receiver<ProgressEvent>,
    stop: Arc<AtomicBool>,
    worker: JoinHandle<Result<BatchReport, Aborted>>,
}

impl ExtractionHandle {
    pub fn events(&self) -> &Receiver<ProgressEvent> {
        &self.events
    }

    /// Lets the current input finish and schedules no further inputs.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn join(self) -> Result<BatchReport, Aborted> {
        match self.worker.join() {
            Ok(result) => result,
            Err(_) => {
                let mut report = BatchReport::new(0);
                report.finish(RunState::Aborted);
                Err(Aborted {
                    report,
                    source: Error::Any {
                        detail: "extraction worker panicked".to_string(),
                    },
                })
            }
        }
    }
}

/// Starts the batch on a dedicated worker; progress arrives on [`ExtractionHandle::events`].
pub fn spawn<D, L>(
    builder: ExtractorBuilder<D, L>,
    inputs: Vec<DiscoveredHive>,
    output: PathBuf,
) -> Result<ExtractionHandle, Error>
where
    D: HiveDecoder + Send + 'static,
    L: LiveRegistry + Send + 'static,
{
    let (sender, events) = mpsc::channel();
    let stop = Arc::new(AtomicBool::new(false));
    let extractor = builder.events(sender).stop_flag(Arc::clone(&stop)).build();
    let worker = thread::Builder::new()
        .name("hive2csv-worker".to_string())
        .spawn(move || extractor.run(&inputs, &output))?;
    Ok(ExtractionHandle {
        events,
        stop,
        worker,
    })
}
