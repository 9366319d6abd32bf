//! `line-sort` is an external sort engine for keyed text records.
//!
//! Records are newline-delimited `<key>,<payload>` lines where the key is a 64-bit signed integer and the payload
//! is arbitrary text (everything after the first comma). The input may be far larger than the available memory:
//! it is split into chunks of bounded size, every chunk is sorted in memory and spilled to a temporary run file,
//! then all runs are merged with a k-way streaming merge into a single sorted output.
//! For more information see [External Sorting](https://en.wikipedia.org/wiki/External_sorting).
//!
//! # Overview
//!
//! * **Deterministic output:**
//!   records with equal keys keep their input order, whatever the chunk size or the number of threads is.
//! * **Multithreading support:**
//!   chunks are sorted and spilled in parallel by a bounded thread pool.
//! * **Bounded resources:**
//!   at most one record per run is held in memory while merging; when there are more runs than files
//!   allowed to be open at once they are merged in several passes.
//! * **Clean failure:**
//!   temporary files are always removed and the output file only appears once it is complete.
//! * **Malformed lines tolerance:**
//!   lines that are not valid records are skipped and counted, they never abort sorting.
//!
//! # Example
//!
//! ```no_run
//! use std::fs;
//! use std::io;
//! use std::path::Path;
//!
//! use env_logger;
//! use log;
//!
//! use line_sort::{ExternalSorter, ExternalSorterBuilder, SortAlgorithm};
//!
//! fn main() {
//!     env_logger::Builder::new().filter_level(log::LevelFilter::Debug).init();
//!
//!     let input_reader = io::BufReader::new(fs::File::open("input.csv").unwrap());
//!
//!     let sorter: ExternalSorter = ExternalSorterBuilder::new()
//!         .with_tmp_dir(Path::new("./"))
//!         .with_chunk_capacity(1_000_000)
//!         .with_algorithm(SortAlgorithm::Quick)
//!         .build()
//!         .unwrap();
//!
//!     let summary = sorter.sort(input_reader, Path::new("output.csv")).unwrap();
//!     println!("{} records sorted in {} ms", summary.records_written, summary.elapsed_millis());
//! }
//! ```

use std::io::BufRead;
use std::path::Path;

pub mod algorithm;
pub mod buffer;
pub mod chunk;
pub mod merger;
pub mod record;
pub mod sort;

pub use algorithm::SortAlgorithm;
pub use buffer::{ChunkBuffer, LimitedBuffer};
pub use chunk::{ExternalRun, RmpRun, RunError, RunHandle, RunId, TextRun};
pub use merger::{BinaryHeapMerger, LinearScanMerger, MergeStrategy};
pub use record::{parse_line, Parsed, Record, RecordReader, SkipReason};
pub use sort::{ExternalSorter, ExternalSorterBuilder, Phase, SortError, SortSummary};

/// Sorts the input into the file at `output` using default settings and the given chunk capacity.
///
/// Returns the sort summary, see [`SortSummary::records_written`] and [`SortSummary::elapsed_millis`].
pub fn run<R: BufRead>(input: R, output: &Path, chunk_capacity: usize) -> Result<SortSummary, SortError> {
    let sorter: ExternalSorter = ExternalSorterBuilder::new().with_chunk_capacity(chunk_capacity).build()?;

    sorter.sort(input, output)
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::io;

    use rstest::*;

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir_in("./").unwrap()
    }

    #[rstest]
    fn test_run(tmp_dir: tempfile::TempDir) {
        let output = tmp_dir.path().join("sorted.csv");
        let input = io::Cursor::new("5,alpha\n3,beta\n5,gamma\n1,delta\n");

        let summary = super::run(input, &output, 2).unwrap();

        assert_eq!(summary.records_written, 4);
        assert_eq!(fs::read_to_string(&output).unwrap(), "1,delta\n3,beta\n5,alpha\n5,gamma\n");
    }
}
