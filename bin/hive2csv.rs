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

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{arg, value_parser, Arg, ArgAction, Command};
use hive2csv::{
    acquire::RegExe,
    err::Error,
    locator::{self, DiscoveredHive},
    notatin_hive::NotatinDecoder,
    pipeline::{self, ExtractorBuilder},
    progress,
    report::{BatchReport, RunState},
};
use log::{error, info, warn};

const DEFAULT_OUTPUT: &str = "merged_registry_analysis.csv";

fn main() -> ExitCode {
    let matches = Command::new("hive2csv")
        .version("0.1")
        .about("Flatten registry hives into one CSV")
        .arg(
            Arg::new("input")
                .short('i')
                .long("input")
                .help("Registry hive file, or root folder if recursing")
                .required(true)
                .num_args(1..)
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .help("Output CSV file")
                .default_value(DEFAULT_OUTPUT)
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(arg!(
            --recurse "Recurse through input folders looking for registry hives"
        ))
        .arg(arg!(
            --list "List the hives that would be extracted and exit"
        ))
        .arg(
            Arg::new("report")
                .long("report")
                .value_name("FILE")
                .help("Write the run report as JSON")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("scratch")
                .long("scratch")
                .value_name("DIR")
                .help("Folder for temporary hive copies (default: system temp)")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("max-keys")
                .long("max-keys")
                .value_name("N")
                .help("Stop walking a hive after this many keys")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .value_name("SECONDS")
                .help("Stop walking a hive after this many seconds")
                .value_parser(value_parser!(u64)),
        )
        .arg(arg!(
            --"no-digest" "Skip hashing acquired hive copies"
        ))
        .arg(arg!(
            -q --quiet "No console progress"
        ))
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("More diagnostic logging (repeat for more)")
                .action(ArgAction::Count),
        )
        .try_get_matches();

    let matches = match matches {
        Ok(matches) => matches,
        Err(e) => {
            let _ = e.print();
            // --help and --version land here too
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let level = match matches.get_count("verbose") {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let inputs: Vec<PathBuf> = matches
        .get_many::<PathBuf>("input")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();
    let output = matches
        .get_one::<PathBuf>("output")
        .cloned()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT));
    let recurse = matches.get_flag("recurse");
    let quiet = matches.get_flag("quiet");

    let hives = match collect_inputs(&inputs, recurse) {
        Ok(hives) => hives,
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if matches.get_flag("list") {
        for hive in &hives {
            println!("{}\t{:?}", hive.path.display(), hive.classification);
        }
        return ExitCode::SUCCESS;
    }

    let mut builder = ExtractorBuilder::new(NotatinDecoder::new(), RegExe::default())
        .record_digests(!matches.get_flag("no-digest"));
    if let Some(scratch) = matches.get_one::<PathBuf>("scratch") {
        builder = builder.scratch_root(scratch);
    }
    if let Some(max_keys) = matches.get_one::<usize>("max-keys") {
        builder = builder.max_keys(*max_keys);
    }
    if let Some(timeout) = matches.get_one::<u64>("timeout") {
        builder = builder.max_duration(Duration::from_secs(*timeout));
    }

    let (report, failure) = match run(builder, hives, output.clone(), quiet) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Some(report_path) = matches.get_one::<PathBuf>("report") {
        if let Err(e) = write_report(&report, report_path) {
            eprintln!("Unable to write report {}: {}", report_path.display(), e);
        }
    }

    match failure {
        Some(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
        None if report.state == RunState::Aborted => ExitCode::FAILURE,
        None => {
            info!("Output written to {}", output.display());
            if quiet {
                println!("{}", report.summary());
            }
            ExitCode::SUCCESS
        }
    }
}

/// Files are taken as given; folders are scanned only with `--recurse`.
fn collect_inputs(inputs: &[PathBuf], recurse: bool) -> Result<Vec<DiscoveredHive>, Error> {
    let mut hives = Vec::new();
    for input in inputs {
        if input.is_dir() {
            if !recurse {
                return Err(Error::Any {
                    detail: format!("{} is a folder; use --recurse to scan it", input.display()),
                });
            }
            let found = locator::discover(input)?;
            info!("{}: {} hive(s) found", input.display(), found.len());
            hives.extend(found);
        } else {
            hives.push(DiscoveredHive::from_path(input));
        }
    }
    if hives.is_empty() {
        warn!("No registry hives to extract");
    }
    Ok(hives)
}

fn run(
    builder: ExtractorBuilder<NotatinDecoder, RegExe>,
    inputs: Vec<DiscoveredHive>,
    output: PathBuf,
    quiet: bool,
) -> Result<(BatchReport, Option<Error>), Error> {
    let handle = pipeline::spawn(builder, inputs, output)?;
    match progress::follow(handle, progress::new(!quiet)) {
        Ok(report) => Ok((report, None)),
        Err(aborted) => Ok((aborted.report, Some(aborted.source))),
    }
}

fn write_report(report: &BatchReport, path: &Path) -> Result<(), Error> {
    let file = File::create(path)?;
    report.write_json(BufWriter::new(file))
}
