//! External runs: sorted record sequences spilled to the file system.

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::io;
use std::io::prelude::*;
use std::path::{Path, PathBuf};

use crate::record::{self, Parsed, Record, SkipReason};

/// Run identifier. Runs created while splitting the input belong to pass 0,
/// runs created by intermediate merges belong to subsequent passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunId {
    pub pass: u32,
    pub index: usize,
}

impl RunId {
    pub fn new(pass: u32, index: usize) -> Self {
        RunId { pass, index }
    }

    fn file_name(&self) -> String {
        format!("run-{:03}-{:08}.dat", self.pass, self.index)
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run {}/{}", self.pass, self.index)
    }
}

/// Handle to a finished run file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunHandle {
    pub id: RunId,
    pub path: PathBuf,
    /// Run file size in bytes.
    pub size: u64,
    /// Number of records stored in the run.
    pub len: u64,
}

impl RunHandle {
    /// Deletes the run file.
    pub fn remove(&self) -> io::Result<()> {
        fs::remove_file(&self.path)
    }
}

/// Run read/write error.
#[derive(Debug)]
pub enum RunError {
    /// Common I/O error.
    IO(io::Error),
    /// Record serialization error.
    SerializationError(Box<dyn Error + Send + Sync>),
    /// Record deserialization error.
    DeserializationError(Box<dyn Error + Send + Sync>),
    /// A stored line is not a valid record.
    Corrupt { line: u64, reason: SkipReason },
}

impl Error for RunError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            RunError::IO(err) => Some(err),
            RunError::SerializationError(err) => Some(err.as_ref()),
            RunError::DeserializationError(err) => Some(err.as_ref()),
            RunError::Corrupt { .. } => None,
        }
    }
}

impl Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            RunError::IO(err) => write!(f, "I/O operation failed: {}", err),
            RunError::SerializationError(err) => write!(f, "record serialization error: {}", err),
            RunError::DeserializationError(err) => write!(f, "record deserialization error: {}", err),
            RunError::Corrupt { line, reason } => write!(f, "corrupted record at line {}: {}", line, reason),
        }
    }
}

impl From<io::Error> for RunError {
    fn from(err: io::Error) -> Self {
        RunError::IO(err)
    }
}

/// External run interface. Provides methods for creating a run stored on file system and streaming records back.
pub trait ExternalRun: Sized + Iterator<Item = Result<Record, RunError>> {
    /// Writes already sorted records to a new run file inside `dir`.
    fn build(
        dir: &Path,
        id: RunId,
        records: impl IntoIterator<Item = Record>,
        buf_size: Option<usize>,
    ) -> Result<RunHandle, RunError> {
        let path = dir.join(id.file_name());
        let file = fs::OpenOptions::new().write(true).create_new(true).open(&path)?;

        let mut run_writer = match buf_size {
            Some(buf_size) => io::BufWriter::with_capacity(buf_size, file),
            None => io::BufWriter::new(file),
        };

        let written = Self::dump(&mut run_writer, records).and_then(|len| {
            run_writer.flush()?;
            Ok((len, run_writer.get_ref().metadata()?.len()))
        });

        match written {
            Ok((len, size)) => Ok(RunHandle { id, path, size, len }),
            Err(err) => {
                // a partially written run must never be merged
                drop(run_writer);
                let _ = fs::remove_file(&path);
                Err(err)
            }
        }
    }

    /// Opens a streaming cursor over a run file.
    fn open(handle: &RunHandle, buf_size: Option<usize>) -> io::Result<Self> {
        let file = fs::File::open(&handle.path)?;
        let run_reader = match buf_size {
            Some(buf_size) => io::BufReader::with_capacity(buf_size, file),
            None => io::BufReader::new(file),
        };

        return Ok(Self::new(run_reader.take(handle.size)));
    }

    /// Creates an instance of a run cursor.
    fn new(reader: io::Take<io::BufReader<fs::File>>) -> Self;

    /// Dumps records to a run file. Returns the number of records written.
    fn dump(
        run_writer: &mut io::BufWriter<fs::File>,
        records: impl IntoIterator<Item = Record>,
    ) -> Result<u64, RunError>;
}

/// Text run implementation.
/// Records are stored one per line in the same `<key>,<payload>` format the input uses.
pub struct TextRun {
    reader: io::Take<io::BufReader<fs::File>>,
    line: String,
    line_number: u64,
}

impl ExternalRun for TextRun {
    fn new(reader: io::Take<io::BufReader<fs::File>>) -> Self {
        TextRun {
            reader,
            line: String::new(),
            line_number: 0,
        }
    }

    fn dump(
        run_writer: &mut io::BufWriter<fs::File>,
        records: impl IntoIterator<Item = Record>,
    ) -> Result<u64, RunError> {
        let mut len = 0;
        for record in records.into_iter() {
            record.write_line(run_writer)?;
            len += 1;
        }

        return Ok(len);
    }
}

impl Iterator for TextRun {
    type Item = Result<Record, RunError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.line.clear();
        match self.reader.read_line(&mut self.line) {
            Ok(0) => None,
            Ok(_) => {
                self.line_number += 1;
                let line = self.line.strip_suffix('\n').unwrap_or(&self.line);
                match record::parse_line(line) {
                    Parsed::Record(record) => Some(Ok(record)),
                    Parsed::Skip(reason) => Some(Err(RunError::Corrupt {
                        line: self.line_number,
                        reason,
                    })),
                }
            }
            Err(err) => Some(Err(RunError::IO(err))),
        }
    }
}

/// RMP (Rust MessagePack) run implementation.
/// It uses MessagePack as a data serialization format.
/// For more information see https://msgpack.org/.
pub struct RmpRun {
    reader: io::Take<io::BufReader<fs::File>>,
}

impl ExternalRun for RmpRun {
    fn new(reader: io::Take<io::BufReader<fs::File>>) -> Self {
        RmpRun { reader }
    }

    fn dump(
        mut run_writer: &mut io::BufWriter<fs::File>,
        records: impl IntoIterator<Item = Record>,
    ) -> Result<u64, RunError> {
        let mut len = 0;
        for record in records.into_iter() {
            rmp_serde::encode::write(&mut run_writer, &record)
                .map_err(|err| RunError::SerializationError(Box::new(err)))?;
            len += 1;
        }

        return Ok(len);
    }
}

impl Iterator for RmpRun {
    type Item = Result<Record, RunError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.reader.limit() == 0 {
            None
        } else {
            match rmp_serde::decode::from_read(&mut self.reader) {
                Ok(record) => Some(Ok(record)),
                Err(err) => Some(Err(RunError::DeserializationError(Box::new(err)))),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::io;
    use std::io::prelude::*;

    use rstest::*;

    use super::{ExternalRun, RmpRun, RunError, RunHandle, RunId, TextRun};
    use crate::record::Record;

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir_in("./").unwrap()
    }

    fn records() -> Vec<Record> {
        vec![
            Record::new(-5, "minus five"),
            Record::new(1, "one,with,commas"),
            Record::new(1, ""),
            Record::new(42, "answer"),
        ]
    }

    fn read_back<C: ExternalRun>(handle: &RunHandle) -> Vec<Record> {
        let run = C::open(handle, Some(16)).unwrap();
        let restored: Result<Vec<Record>, RunError> = run.collect();
        restored.unwrap()
    }

    #[rstest]
    fn test_text_run(tmp_dir: tempfile::TempDir) {
        let handle = TextRun::build(tmp_dir.path(), RunId::new(0, 7), records(), None).unwrap();

        assert_eq!(handle.len, 4);
        assert_eq!(handle.path, tmp_dir.path().join("run-000-00000007.dat"));
        assert_eq!(
            fs::read_to_string(&handle.path).unwrap(),
            "-5,minus five\n1,one,with,commas\n1,\n42,answer\n"
        );
        assert_eq!(handle.size, 45);
        assert_eq!(read_back::<TextRun>(&handle), records());
    }

    #[rstest]
    fn test_rmp_run(tmp_dir: tempfile::TempDir) {
        let handle = RmpRun::build(tmp_dir.path(), RunId::new(1, 0), records(), Some(8)).unwrap();

        assert_eq!(handle.len, 4);
        assert_eq!(read_back::<RmpRun>(&handle), records());
    }

    #[rstest]
    fn test_empty_run(tmp_dir: tempfile::TempDir) {
        let handle = TextRun::build(tmp_dir.path(), RunId::new(0, 0), Vec::new(), None).unwrap();

        assert_eq!(handle.len, 0);
        assert_eq!(handle.size, 0);
        assert_eq!(read_back::<TextRun>(&handle), Vec::new());
    }

    #[rstest]
    fn test_run_ids_are_not_reused(tmp_dir: tempfile::TempDir) {
        TextRun::build(tmp_dir.path(), RunId::new(0, 0), records(), None).unwrap();
        let result = TextRun::build(tmp_dir.path(), RunId::new(0, 0), records(), None);

        assert!(matches!(result, Err(RunError::IO(_))));
    }

    #[rstest]
    fn test_corrupted_text_run(tmp_dir: tempfile::TempDir) {
        let handle = TextRun::build(tmp_dir.path(), RunId::new(0, 1), records(), None).unwrap();
        let mut file = fs::OpenOptions::new().append(true).open(&handle.path).unwrap();
        file.write_all(b"garbage\n").unwrap();
        let handle = RunHandle {
            size: fs::metadata(&handle.path).unwrap().len(),
            ..handle
        };

        let run = TextRun::open(&handle, None).unwrap();
        let restored: Vec<Result<Record, RunError>> = run.collect();

        assert_eq!(restored.len(), 5);
        assert!(matches!(restored[4], Err(RunError::Corrupt { line: 5, .. })));
    }

    /// Run format failing after the first record is written.
    struct BrokenRun;

    impl ExternalRun for BrokenRun {
        fn new(_reader: io::Take<io::BufReader<fs::File>>) -> Self {
            BrokenRun
        }

        fn dump(
            run_writer: &mut io::BufWriter<fs::File>,
            records: impl IntoIterator<Item = Record>,
        ) -> Result<u64, RunError> {
            for record in records.into_iter().take(1) {
                record.write_line(run_writer)?;
            }
            run_writer.flush()?;
            Err(RunError::IO(io::Error::new(io::ErrorKind::Other, "no space left")))
        }
    }

    impl Iterator for BrokenRun {
        type Item = Result<Record, RunError>;

        fn next(&mut self) -> Option<Self::Item> {
            None
        }
    }

    #[rstest]
    fn test_partial_run_removed(tmp_dir: tempfile::TempDir) {
        let result = BrokenRun::build(tmp_dir.path(), RunId::new(0, 3), records(), None);

        assert!(matches!(result, Err(RunError::IO(_))));
        assert!(fs::read_dir(tmp_dir.path()).unwrap().next().is_none());
    }

    #[rstest]
    fn test_remove_run(tmp_dir: tempfile::TempDir) {
        let handle = TextRun::build(tmp_dir.path(), RunId::new(0, 2), records(), None).unwrap();
        handle.remove().unwrap();

        assert!(!handle.path.exists());
    }
}
