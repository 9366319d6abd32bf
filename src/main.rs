use std::path;
use std::process;

use clap::ArgEnum;
use env_logger;
use log;

use line_sort::{ExternalRun, ExternalSorter, ExternalSorterBuilder, MergeStrategy, RmpRun, SortAlgorithm, TextRun};

fn main() {
    let arg_parser = build_arg_parser();

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let run_format: RunFormat = arg_parser.value_of_t_or_exit("run_format");
    let result = match run_format {
        RunFormat::Text => sort::<TextRun>(&arg_parser),
        RunFormat::Msgpack => sort::<RmpRun>(&arg_parser),
    };

    if let Err(err) = result {
        log::error!("{}", err);
        process::exit(1);
    }
}

fn sort<C: ExternalRun>(arg_parser: &clap::ArgMatches) -> Result<(), line_sort::SortError> {
    let algorithm: Algorithm = arg_parser.value_of_t_or_exit("algorithm");
    let merge: Merge = arg_parser.value_of_t_or_exit("merge");
    let chunk_capacity: usize = arg_parser.value_of_t_or_exit("chunk_capacity");
    let max_open_runs: usize = arg_parser.value_of_t_or_exit("max_open_runs");
    let tmp_dir: Option<&str> = arg_parser.value_of("tmp_dir");
    let threads: Option<usize> = arg_parser
        .is_present("threads")
        .then(|| arg_parser.value_of_t_or_exit("threads"));

    let input = arg_parser.value_of("input").expect("value is required");
    let output = arg_parser.value_of("output").expect("value is required");

    let mut sorter_builder = ExternalSorterBuilder::new()
        .with_chunk_capacity(chunk_capacity)
        .with_max_open_runs(max_open_runs)
        .with_algorithm(algorithm.into())
        .with_merge_strategy(merge.into());
    if let Some(threads) = threads {
        sorter_builder = sorter_builder.with_threads_number(threads);
    }

    if let Some(tmp_dir) = tmp_dir {
        sorter_builder = sorter_builder.with_tmp_dir(path::Path::new(tmp_dir));
    }

    let sorter: ExternalSorter<C> = sorter_builder.build()?;
    let summary = sorter.sort_file(path::Path::new(input), path::Path::new(output))?;

    println!(
        "records: {}, skipped: {}, runs: {}",
        summary.records_written, summary.records_skipped, summary.runs
    );
    println!("Execution time (ms): {}", summary.elapsed_millis());

    Ok(())
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Self::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <LogLevel as clap::ArgEnum>::from_str(s, false)
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum Algorithm {
    Quick,
    Merge,
}

impl Algorithm {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Algorithm::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Algorithm as clap::ArgEnum>::from_str(s, false)
    }
}

impl From<Algorithm> for SortAlgorithm {
    fn from(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::Quick => SortAlgorithm::Quick,
            Algorithm::Merge => SortAlgorithm::Merge,
        }
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum Merge {
    Heap,
    Scan,
}

impl Merge {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Merge::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for Merge {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Merge as clap::ArgEnum>::from_str(s, false)
    }
}

impl From<Merge> for MergeStrategy {
    fn from(merge: Merge) -> Self {
        match merge {
            Merge::Heap => MergeStrategy::Heap,
            Merge::Scan => MergeStrategy::LinearScan,
        }
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum RunFormat {
    Text,
    Msgpack,
}

impl RunFormat {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        RunFormat::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for RunFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <RunFormat as clap::ArgEnum>::from_str(s, false)
    }
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("line-sort")
        .about("external sorter for <int64>,<text> records")
        .arg(
            clap::Arg::new("input")
                .short('i')
                .long("input")
                .help("file to be sorted")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("output")
                .short('o')
                .long("output")
                .help("result file")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("chunk_capacity")
                .short('c')
                .long("chunk-capacity")
                .help("number of records sorted in memory at once")
                .takes_value(true)
                .default_value("5000000")
                .validator(|v| match v.parse::<usize>() {
                    Ok(0) => Err("Chunk capacity must be positive".to_string()),
                    Ok(_) => Ok(()),
                    Err(err) => Err(format!("Chunk capacity format incorrect: {}", err)),
                }),
        )
        .arg(
            clap::Arg::new("algorithm")
                .short('a')
                .long("algorithm")
                .help("in-memory chunk sorting algorithm")
                .takes_value(true)
                .default_value("merge")
                .possible_values(Algorithm::possible_values()),
        )
        .arg(
            clap::Arg::new("merge")
                .short('m')
                .long("merge")
                .help("k-way merge frontier")
                .takes_value(true)
                .default_value("heap")
                .possible_values(Merge::possible_values()),
        )
        .arg(
            clap::Arg::new("run_format")
                .short('f')
                .long("run-format")
                .help("temporary run file format")
                .takes_value(true)
                .default_value("text")
                .possible_values(RunFormat::possible_values()),
        )
        .arg(
            clap::Arg::new("max_open_runs")
                .long("max-open-runs")
                .help("maximum number of runs merged at once")
                .takes_value(true)
                .default_value("512"),
        )
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .takes_value(true)
                .default_value("info")
                .possible_values(LogLevel::possible_values()),
        )
        .arg(
            clap::Arg::new("threads")
                .short('t')
                .long("threads")
                .help("number of threads to use for parallel chunk sorting")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("tmp_dir")
                .short('d')
                .long("tmp-dir")
                .help("directory to be used to store temporary data")
                .takes_value(true),
        )
        .get_matches()
}

fn init_logger(log_level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(match log_level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .init();
}
