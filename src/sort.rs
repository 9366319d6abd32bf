//! External sorter.

use log;
use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::io;
use std::io::prelude::*;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use rayon::prelude::*;

use crate::algorithm::SortAlgorithm;
use crate::buffer::{ChunkBuffer, LimitedBuffer};
use crate::chunk::{ExternalRun, RunError, RunHandle, RunId, TextRun};
use crate::merger::MergeStrategy;
use crate::record::{Parsed, Record, RecordReader};

/// Default number of records per chunk.
pub const DEFAULT_CHUNK_CAPACITY: usize = 5_000_000;

/// Default maximum number of runs merged (and opened) at once.
pub const DEFAULT_MAX_OPEN_RUNS: usize = 512;

const MIN_FAN_IN: usize = 2;

#[cfg(windows)]
const TOO_MANY_OPEN_FILES: i32 = 4; // ERROR_TOO_MANY_OPEN_FILES
#[cfg(not(windows))]
const TOO_MANY_OPEN_FILES: i32 = 24; // EMFILE

/// Pipeline phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Splitting,
    Merging,
    Finalizing,
    Done,
    Failed,
}

impl Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Splitting => "splitting",
            Phase::Merging => "merging",
            Phase::Finalizing => "finalizing",
            Phase::Done => "done",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Sorting error.
#[derive(Debug)]
pub enum SortError {
    /// Sorter configuration is not valid.
    InvalidConfig(&'static str),
    /// Temporary directory or file creation error.
    TempDir(io::Error),
    /// Workers thread pool initialization error.
    ThreadPoolBuildError(rayon::ThreadPoolBuildError),
    /// Input data stream error.
    Input(io::Error),
    /// Run file write or read error.
    Run { phase: Phase, run: RunId, source: RunError },
    /// Output write error.
    Output { phase: Phase, source: io::Error },
    /// Not enough file handles to merge runs even with the smallest fan-in.
    ResourceExhaustion { runs: usize, source: io::Error },
}

impl SortError {
    /// Returns the pipeline phase the error occurred in.
    pub fn phase(&self) -> Phase {
        match self {
            SortError::InvalidConfig(_) | SortError::TempDir(_) | SortError::ThreadPoolBuildError(_) => Phase::Idle,
            SortError::Input(_) => Phase::Splitting,
            SortError::Run { phase, .. } | SortError::Output { phase, .. } => *phase,
            SortError::ResourceExhaustion { .. } => Phase::Merging,
        }
    }
}

impl Error for SortError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            SortError::InvalidConfig(_) => None,
            SortError::TempDir(err) => Some(err),
            SortError::ThreadPoolBuildError(err) => Some(err),
            SortError::Input(err) => Some(err),
            SortError::Run { source, .. } => Some(source),
            SortError::Output { source, .. } => Some(source),
            SortError::ResourceExhaustion { source, .. } => Some(source),
        }
    }
}

impl Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SortError::InvalidConfig(reason) => write!(f, "invalid configuration: {}", reason),
            SortError::TempDir(err) => write!(f, "temporary directory or file not created: {}", err),
            SortError::ThreadPoolBuildError(err) => write!(f, "thread pool initialization failed: {}", err),
            SortError::Input(err) => write!(f, "input data stream error: {}", err),
            SortError::Run { phase, run, source } => write!(f, "{} failed while {}: {}", run, phase, source),
            SortError::Output { phase, source } => write!(f, "output write failed while {}: {}", phase, source),
            SortError::ResourceExhaustion { runs, source } => {
                write!(f, "cannot open {} runs at once: {}", runs, source)
            }
        }
    }
}

/// Result of a finished sort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSummary {
    /// Number of input lines read.
    pub records_read: u64,
    /// Number of records written to the output.
    pub records_written: u64,
    /// Number of malformed input lines skipped.
    pub records_skipped: u64,
    /// Number of runs created while splitting the input.
    pub runs: usize,
    /// Number of intermediate merge passes.
    pub merge_passes: u32,
    pub elapsed: Duration,
}

impl SortSummary {
    pub fn elapsed_millis(&self) -> u128 {
        self.elapsed.as_millis()
    }
}

/// External sorter builder. Provides methods for [`ExternalSorter`] initialization.
pub struct ExternalSorterBuilder<C = TextRun>
where
    C: ExternalRun,
{
    /// Number of threads to be used to sort chunks in parallel.
    threads_number: Option<usize>,
    /// Directory to be used to store temporary data.
    tmp_dir: Option<Box<Path>>,
    /// Run file read/write buffer size.
    rw_buf_size: Option<usize>,
    /// Number of records per chunk.
    chunk_capacity: usize,
    /// Chunk buffer memory preallocation.
    preallocate: bool,
    /// Chunk sorting algorithm.
    algorithm: SortAlgorithm,
    /// Merge frontier strategy.
    merge_strategy: MergeStrategy,
    /// Maximum number of runs merged at once.
    max_open_runs: usize,

    /// External run type.
    external_run_type: PhantomData<C>,
}

impl<C> ExternalSorterBuilder<C>
where
    C: ExternalRun,
{
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        ExternalSorterBuilder::default()
    }

    /// Builds an [`ExternalSorter`] instance using provided configuration.
    pub fn build(self) -> Result<ExternalSorter<C>, SortError> {
        if self.chunk_capacity == 0 {
            return Err(SortError::InvalidConfig("chunk capacity must be positive"));
        }
        if self.max_open_runs < MIN_FAN_IN {
            return Err(SortError::InvalidConfig("at least two runs must be allowed to be open at once"));
        }

        let thread_pool = ExternalSorter::<C>::init_thread_pool(self.threads_number)?;
        let tmp_root = match self.tmp_dir {
            Some(tmp_dir) => tmp_dir.into_path_buf(),
            None => std::env::temp_dir(),
        };

        return Ok(ExternalSorter {
            threads: thread_pool.current_num_threads(),
            thread_pool,
            tmp_root,
            rw_buf_size: self.rw_buf_size,
            chunk_capacity: self.chunk_capacity,
            preallocate: self.preallocate,
            algorithm: self.algorithm,
            merge_strategy: self.merge_strategy,
            max_open_runs: self.max_open_runs,
            external_run_type: PhantomData,
        });
    }

    /// Sets number of threads to be used to sort chunks in parallel.
    pub fn with_threads_number(mut self, threads_number: usize) -> ExternalSorterBuilder<C> {
        self.threads_number = Some(threads_number);
        return self;
    }

    /// Sets directory to be used to store temporary data. It is created if it does not exist.
    pub fn with_tmp_dir(mut self, path: &Path) -> ExternalSorterBuilder<C> {
        self.tmp_dir = Some(path.into());
        return self;
    }

    /// Sets run read/write buffer size.
    pub fn with_rw_buf_size(mut self, buf_size: usize) -> ExternalSorterBuilder<C> {
        self.rw_buf_size = Some(buf_size);
        return self;
    }

    /// Sets number of records per chunk.
    pub fn with_chunk_capacity(mut self, chunk_capacity: usize) -> ExternalSorterBuilder<C> {
        self.chunk_capacity = chunk_capacity;
        return self;
    }

    /// Reserves memory for a full chunk up front.
    pub fn with_preallocation(mut self, preallocate: bool) -> ExternalSorterBuilder<C> {
        self.preallocate = preallocate;
        return self;
    }

    /// Sets chunk sorting algorithm.
    ///
    /// [`SortAlgorithm::Quick`] always pivots on the last element of a range, so already sorted chunks and chunks
    /// with few distinct keys (equal keys are ordered by input position) take quadratic time. Prefer the default
    /// [`SortAlgorithm::Merge`] for large chunks unless the input is known to be shuffled.
    pub fn with_algorithm(mut self, algorithm: SortAlgorithm) -> ExternalSorterBuilder<C> {
        self.algorithm = algorithm;
        return self;
    }

    /// Sets merge frontier strategy.
    pub fn with_merge_strategy(mut self, merge_strategy: MergeStrategy) -> ExternalSorterBuilder<C> {
        self.merge_strategy = merge_strategy;
        return self;
    }

    /// Sets the maximum number of runs merged at once. More runs are merged in several passes.
    pub fn with_max_open_runs(mut self, max_open_runs: usize) -> ExternalSorterBuilder<C> {
        self.max_open_runs = max_open_runs;
        return self;
    }
}

impl<C> Default for ExternalSorterBuilder<C>
where
    C: ExternalRun,
{
    fn default() -> Self {
        ExternalSorterBuilder {
            threads_number: None,
            tmp_dir: None,
            rw_buf_size: None,
            chunk_capacity: DEFAULT_CHUNK_CAPACITY,
            preallocate: false,
            algorithm: SortAlgorithm::default(),
            merge_strategy: MergeStrategy::default(),
            max_open_runs: DEFAULT_MAX_OPEN_RUNS,
            external_run_type: PhantomData,
        }
    }
}

/// External sorter.
///
/// The sorter holds configuration and the worker pool only, every sort owns its own temporary directory
/// so a single sorter can be used by several threads at once.
pub struct ExternalSorter<C = TextRun>
where
    C: ExternalRun,
{
    /// Sorting thread pool.
    thread_pool: rayon::ThreadPool,
    /// Number of pool threads, also the number of chunks kept in memory at once.
    threads: usize,
    /// Directory temporary data directories are created in.
    tmp_root: PathBuf,
    /// Run file read/write buffer size.
    rw_buf_size: Option<usize>,
    chunk_capacity: usize,
    preallocate: bool,
    algorithm: SortAlgorithm,
    merge_strategy: MergeStrategy,
    max_open_runs: usize,

    /// External run type.
    external_run_type: PhantomData<C>,
}

impl<C> ExternalSorter<C>
where
    C: ExternalRun,
{
    fn init_thread_pool(threads_number: Option<usize>) -> Result<rayon::ThreadPool, SortError> {
        let mut thread_pool_builder = rayon::ThreadPoolBuilder::new();

        if let Some(threads_number) = threads_number {
            log::info!("initializing thread-pool (threads: {})", threads_number);
            thread_pool_builder = thread_pool_builder.num_threads(threads_number);
        } else {
            log::info!("initializing thread-pool (threads: default)");
        }
        let thread_pool = thread_pool_builder
            .build()
            .map_err(|err| SortError::ThreadPoolBuildError(err))?;

        return Ok(thread_pool);
    }

    fn init_workspace(&self) -> Result<Workspace, SortError> {
        let created_root = if self.tmp_root.exists() {
            None
        } else {
            fs::create_dir_all(&self.tmp_root).map_err(|err| SortError::TempDir(err))?;
            Some(self.tmp_root.clone())
        };

        let tmp_dir = tempfile::Builder::new()
            .prefix("line-sort-")
            .tempdir_in(&self.tmp_root)
            .map_err(|err| {
                if let Some(root) = &created_root {
                    let _ = fs::remove_dir(root);
                }
                SortError::TempDir(err)
            })?;

        log::info!("using {} as a temporary directory", tmp_dir.path().display());

        return Ok(Workspace {
            path: tmp_dir.path().to_path_buf(),
            dir: Some(tmp_dir),
            created_root,
        });
    }

    /// Sorts a file into another one.
    ///
    /// # Arguments
    /// * `input` - Path of the file to be sorted
    /// * `output` - Path of the sorted file, only created once sorting succeeded
    pub fn sort_file(&self, input: &Path, output: &Path) -> Result<SortSummary, SortError> {
        let file = fs::File::open(input).map_err(|err| SortError::Input(err))?;
        let reader = match self.rw_buf_size {
            Some(buf_size) => io::BufReader::with_capacity(buf_size, file),
            None => io::BufReader::new(file),
        };

        self.sort(reader, output)
    }

    /// Sorts data from the input into the file at `output`.
    ///
    /// The output is written to a temporary file next to `output` and renamed once complete,
    /// so on failure the `output` path is left untouched.
    pub fn sort<R>(&self, input: R, output: &Path) -> Result<SortSummary, SortError>
    where
        R: BufRead,
    {
        let output_dir = match output.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let output_file = tempfile::Builder::new()
            .prefix(".line-sort-")
            .tempfile_in(output_dir)
            .map_err(|err| SortError::Output {
                phase: Phase::Idle,
                source: err,
            })?;

        let output_writer = match self.rw_buf_size {
            Some(buf_size) => io::BufWriter::with_capacity(buf_size, output_file),
            None => io::BufWriter::new(output_file),
        };

        self.execute(input, output_writer, |output_writer| {
            let output_file = output_writer.into_inner().map_err(|err| err.into_error())?;
            output_file.persist(output).map_err(|err| err.error)?;
            Ok(())
        })
    }

    /// Sorts data from the input streaming the sorted records into `output`.
    pub fn sort_to_writer<R, W>(&self, input: R, output: W) -> Result<SortSummary, SortError>
    where
        R: BufRead,
        W: Write,
    {
        self.execute(input, output, |mut output| output.flush())
    }

    fn execute<R, W, F>(&self, input: R, output: W, finalize: F) -> Result<SortSummary, SortError>
    where
        R: BufRead,
        W: Write,
        F: FnOnce(W) -> io::Result<()>,
    {
        let mut state = PipelineState::new();

        let result = self.run_pipeline(&mut state, input, output, finalize);
        match &result {
            Ok(summary) => log::info!(
                "sorted {} records ({} lines skipped, {} runs, {} merge passes) in {} ms",
                summary.records_written,
                summary.records_skipped,
                summary.runs,
                summary.merge_passes,
                summary.elapsed_millis(),
            ),
            Err(err) => {
                log::error!("sorting failed while {}: {}", state.phase, err);
                state.enter(Phase::Failed);
            }
        }

        return result;
    }

    fn run_pipeline<R, W, F>(
        &self,
        state: &mut PipelineState,
        input: R,
        mut output: W,
        finalize: F,
    ) -> Result<SortSummary, SortError>
    where
        R: BufRead,
        W: Write,
        F: FnOnce(W) -> io::Result<()>,
    {
        let workspace = self.init_workspace()?;

        let runs = self.split(state, workspace.path(), input)?;
        let records_written = self.merge(state, workspace.path(), runs, &mut output)?;

        state.enter(Phase::Finalizing);
        finalize(output).map_err(|err| SortError::Output {
            phase: Phase::Finalizing,
            source: err,
        })?;
        if let Err(err) = workspace.close() {
            log::warn!("temporary directory cleanup failed: {}", err);
        }
        state.enter(Phase::Done);

        return Ok(SortSummary {
            records_read: state.lines,
            records_written,
            records_skipped: state.skipped,
            runs: state.runs.len(),
            merge_passes: state.passes,
            elapsed: state.started.elapsed(),
        });
    }

    /// Reads the input splitting it into sorted runs. Returns run handles in input order.
    fn split<R>(&self, state: &mut PipelineState, dir: &Path, input: R) -> Result<Vec<RunHandle>, SortError>
    where
        R: BufRead,
    {
        state.enter(Phase::Splitting);

        let mut chunk_buf = if self.preallocate {
            LimitedBuffer::with_capacity(self.chunk_capacity)
        } else {
            LimitedBuffer::new(self.chunk_capacity)
        };
        let mut pending = Vec::with_capacity(self.threads);
        let mut runs = Vec::new();

        for line in RecordReader::new(input) {
            let (line_number, parsed) = line.map_err(|err| SortError::Input(err))?;
            state.lines += 1;

            match parsed {
                Parsed::Record(record) => chunk_buf.push(record),
                Parsed::Skip(reason) => {
                    state.skipped += 1;
                    log::warn!("skipping line {}: {}", line_number, reason);
                }
            }

            if chunk_buf.is_full() {
                pending.push(self.next_chunk(state, &mut chunk_buf));
                if pending.len() >= self.threads {
                    runs.extend(self.spill(dir, std::mem::take(&mut pending))?);
                }
            }
        }

        if !chunk_buf.is_empty() {
            pending.push(self.next_chunk(state, &mut chunk_buf));
        }
        if !pending.is_empty() {
            runs.extend(self.spill(dir, pending)?);
        }

        log::debug!("external sort preparation done ({} runs)", runs.len());

        return Ok(runs);
    }

    fn next_chunk(&self, state: &mut PipelineState, chunk_buf: &mut LimitedBuffer<Record>) -> (RunId, Vec<Record>) {
        let id = RunId::new(0, state.runs.len());
        state.runs.push(id);
        (id, chunk_buf.drain())
    }

    /// Sorts and saves chunks in parallel. Handles are returned in the order of `chunks`.
    fn spill(&self, dir: &Path, chunks: Vec<(RunId, Vec<Record>)>) -> Result<Vec<RunHandle>, SortError> {
        let algorithm = self.algorithm;
        let rw_buf_size = self.rw_buf_size;

        self.thread_pool.install(|| {
            chunks
                .into_par_iter()
                .map(|(id, mut records)| {
                    log::debug!("sorting chunk data of {} ({} records) ...", id, records.len());
                    algorithm.sort_by(&mut records, |a, b| a.key.cmp(&b.key));

                    log::debug!("saving chunk data of {}", id);
                    C::build(dir, id, records, rw_buf_size).map_err(|err| SortError::Run {
                        phase: Phase::Splitting,
                        run: id,
                        source: err,
                    })
                })
                .collect()
        })
    }

    /// Merges runs into the output. Runs exceeding the fan-in are first merged in intermediate passes.
    fn merge<W>(
        &self,
        state: &mut PipelineState,
        dir: &Path,
        mut runs: Vec<RunHandle>,
        output: &mut W,
    ) -> Result<u64, SortError>
    where
        W: Write,
    {
        state.enter(Phase::Merging);
        let mut fan_in = self.max_open_runs;
        // run ids of a retried pass never collide with files of a failed attempt
        let mut attempt: u32 = 0;

        loop {
            let result = if runs.len() <= fan_in {
                self.merge_into(&runs, output).map(Some)
            } else {
                attempt += 1;
                self.merge_pass(dir, attempt, &runs, fan_in).map(|merged| {
                    runs = merged;
                    None
                })
            };

            match result {
                Ok(Some(records_written)) => {
                    remove_runs(&runs);
                    return Ok(records_written);
                }
                Ok(None) => state.passes += 1,
                Err(SortError::ResourceExhaustion { runs: open, source }) if fan_in > MIN_FAN_IN => {
                    fan_in = usize::max(MIN_FAN_IN, usize::min(fan_in, open) / 2);
                    log::warn!("{} runs can't be opened at once ({}), merge fan-in reduced to {}", open, source, fan_in);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Merges groups of `fan_in` neighbouring runs into new runs.
    fn merge_pass(&self, dir: &Path, pass: u32, runs: &[RunHandle], fan_in: usize) -> Result<Vec<RunHandle>, SortError> {
        log::debug!("merge pass {}: {} runs, fan-in {}", pass, runs.len(), fan_in);

        let mut merged = Vec::with_capacity(runs.len() / fan_in + 1);
        for (index, group) in runs.chunks(fan_in).enumerate() {
            match self.merge_group(dir, RunId::new(pass, index), group) {
                Ok(handle) => merged.push(handle),
                Err(err) => {
                    remove_runs(merged.iter().filter(|handle| handle.id.pass == pass));
                    return Err(err);
                }
            }
        }

        for group in runs.chunks(fan_in).filter(|group| group.len() > 1) {
            remove_runs(group);
        }

        return Ok(merged);
    }

    fn merge_group(&self, dir: &Path, id: RunId, group: &[RunHandle]) -> Result<RunHandle, SortError> {
        if let [single] = group {
            return Ok(single.clone());
        }

        let cursors = self.open_runs(group)?;
        let mut failure = None;
        let records = self
            .merge_strategy
            .merge(cursors, |record: &Record| record.key)
            .map_while(|record| match record {
                Ok(record) => Some(record),
                Err(err) => {
                    failure = Some(err);
                    None
                }
            });

        let built = C::build(dir, id, records, self.rw_buf_size).map_err(|err| SortError::Run {
            phase: Phase::Merging,
            run: id,
            source: err,
        });

        match failure {
            Some(err) => {
                if let Ok(handle) = built {
                    remove_runs([&handle]);
                }
                Err(err)
            }
            None => built,
        }
    }

    fn merge_into<W>(&self, runs: &[RunHandle], output: &mut W) -> Result<u64, SortError>
    where
        W: Write,
    {
        let cursors = self.open_runs(runs)?;

        let mut records_written = 0;
        for record in self.merge_strategy.merge(cursors, |record: &Record| record.key) {
            record?.write_line(output).map_err(|err| SortError::Output {
                phase: Phase::Merging,
                source: err,
            })?;
            records_written += 1;
        }

        return Ok(records_written);
    }

    /// Opens cursors over all runs. Already opened cursors are closed if any of the runs fails to open.
    fn open_runs(
        &self,
        runs: &[RunHandle],
    ) -> Result<Vec<impl Iterator<Item = Result<Record, SortError>>>, SortError> {
        let mut cursors = Vec::with_capacity(runs.len());

        for handle in runs {
            let run = handle.id;
            let cursor = C::open(handle, self.rw_buf_size).map_err(|err| {
                if err.raw_os_error() == Some(TOO_MANY_OPEN_FILES) {
                    SortError::ResourceExhaustion {
                        runs: runs.len(),
                        source: err,
                    }
                } else {
                    SortError::Run {
                        phase: Phase::Merging,
                        run,
                        source: RunError::IO(err),
                    }
                }
            })?;

            cursors.push(cursor.map(move |record| {
                record.map_err(|err| SortError::Run {
                    phase: Phase::Merging,
                    run,
                    source: err,
                })
            }));
        }

        return Ok(cursors);
    }
}

fn remove_runs<'a>(runs: impl IntoIterator<Item = &'a RunHandle>) {
    for run in runs {
        if let Err(err) = run.remove() {
            log::warn!("{} removal failed: {}", run.id, err);
        }
    }
}

/// Per-sort state.
struct PipelineState {
    phase: Phase,
    lines: u64,
    skipped: u64,
    runs: Vec<RunId>,
    passes: u32,
    started: Instant,
}

impl PipelineState {
    fn new() -> Self {
        PipelineState {
            phase: Phase::Idle,
            lines: 0,
            skipped: 0,
            runs: Vec::new(),
            passes: 0,
            started: Instant::now(),
        }
    }

    fn enter(&mut self, phase: Phase) {
        log::debug!("{} -> {}", self.phase, phase);
        self.phase = phase;
    }
}

/// Temporary directory owned by a single sort. Removed when closed or dropped.
struct Workspace {
    path: PathBuf,
    dir: Option<tempfile::TempDir>,
    /// Temporary root created for this sort, removed afterwards if nothing else uses it.
    created_root: Option<PathBuf>,
}

impl Workspace {
    fn path(&self) -> &Path {
        &self.path
    }

    fn close(mut self) -> io::Result<()> {
        let result = match self.dir.take() {
            Some(dir) => dir.close(),
            None => Ok(()),
        };
        self.remove_root();

        return result;
    }

    fn remove_root(&mut self) {
        if let Some(root) = self.created_root.take() {
            if let Err(err) = fs::remove_dir(&root) {
                log::debug!("temporary root {} kept: {}", root.display(), err);
            }
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        drop(self.dir.take());
        self.remove_root();
    }
}
