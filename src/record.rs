//! Keyed text records and the line parser.

use std::fmt;
use std::fmt::Display;
use std::io;
use std::io::prelude::*;
use std::num::ParseIntError;

use serde::{Deserialize, Serialize};

/// Field delimiter separating the key from the payload.
pub const DELIMITER: char = ',';

/// A single input record: an integer sort key and an opaque text payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: i64,
    pub payload: String,
}

impl Record {
    pub fn new(key: i64, payload: impl Into<String>) -> Self {
        Record {
            key,
            payload: payload.into(),
        }
    }

    /// Writes the record as a `<key>,<payload>\n` line.
    pub fn write_line<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writeln!(writer, "{}{}{}", self.key, DELIMITER, self.payload)
    }
}

impl Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.key, DELIMITER, self.payload)
    }
}

/// Reason a line was not turned into a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The line has no field delimiter.
    MissingDelimiter,
    /// The key field is not a 64-bit signed integer.
    InvalidKey(ParseIntError),
    /// The line is not valid UTF-8.
    InvalidUtf8,
}

impl Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SkipReason::MissingDelimiter => write!(f, "missing '{}' delimiter", DELIMITER),
            SkipReason::InvalidKey(err) => write!(f, "invalid key: {}", err),
            SkipReason::InvalidUtf8 => write!(f, "line is not valid utf-8"),
        }
    }
}

/// Parsing outcome of a single line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    Record(Record),
    Skip(SkipReason),
}

/// Parses one line (without its terminator) into a record.
///
/// The line is split on the first delimiter only, everything after it is kept verbatim as the payload.
/// Malformed lines are classified, never treated as fatal.
pub fn parse_line(line: &str) -> Parsed {
    let (key, payload) = match line.split_once(DELIMITER) {
        Some(fields) => fields,
        None => return Parsed::Skip(SkipReason::MissingDelimiter),
    };

    match key.trim().parse::<i64>() {
        Ok(key) => Parsed::Record(Record::new(key, payload)),
        Err(err) => Parsed::Skip(SkipReason::InvalidKey(err)),
    }
}

/// Parses a raw line that may not be valid UTF-8.
pub fn parse_bytes(line: &[u8]) -> Parsed {
    match std::str::from_utf8(line) {
        Ok(line) => parse_line(line),
        Err(_) => Parsed::Skip(SkipReason::InvalidUtf8),
    }
}

/// Reads newline-delimited lines from a stream and parses each of them.
///
/// Yields `(line_number, parsed)` pairs, line numbers start at 1. Only genuine read errors are returned as `Err`.
/// The `\n` terminator and every carriage return preceding it (or ending the last line) are stripped, so a
/// payload never ends with `\r`.
pub struct RecordReader<R> {
    reader: R,
    line: Vec<u8>,
    line_number: u64,
}

impl<R: BufRead> RecordReader<R> {
    pub fn new(reader: R) -> Self {
        RecordReader {
            reader,
            line: Vec::new(),
            line_number: 0,
        }
    }
}

impl<R: BufRead> Iterator for RecordReader<R> {
    type Item = io::Result<(u64, Parsed)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.line.clear();
        match self.reader.read_until(b'\n', &mut self.line) {
            Ok(0) => None,
            Ok(_) => {
                if self.line.last() == Some(&b'\n') {
                    self.line.pop();
                }
                while self.line.last() == Some(&b'\r') {
                    self.line.pop();
                }
                self.line_number += 1;
                Some(Ok((self.line_number, parse_bytes(&self.line))))
            }
            Err(err) => Some(Err(err)),
        }
    }
}
