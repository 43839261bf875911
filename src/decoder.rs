//! Input line decoding and validation.

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::io;
use std::io::prelude::*;

use crate::record::Record;

/// Layout of an input line.
#[derive(Debug, Clone, PartialEq)]
pub struct DecoderConfig {
    /// Field delimiter.
    pub delimiter: char,
    /// Number of fields a valid line consists of.
    pub expected_fields: usize,
    /// Zero-based index of the numeric sort key field.
    pub key_field: usize,
}

impl DecoderConfig {
    pub fn new(delimiter: char, expected_fields: usize, key_field: usize) -> Self {
        DecoderConfig {
            delimiter,
            expected_fields,
            key_field,
        }
    }

    /// Checks that the layout can describe a valid line.
    pub fn validate(&self) -> Result<(), String> {
        if self.expected_fields == 0 {
            return Err("expected field count must be positive".to_string());
        }
        if self.key_field >= self.expected_fields {
            return Err(format!(
                "key field index {} is out of range for {} fields",
                self.key_field, self.expected_fields
            ));
        }

        return Ok(());
    }
}

impl Default for DecoderConfig {
    /// Taxi trip layout: 17 comma separated fields with the fare amount at index 11.
    fn default() -> Self {
        DecoderConfig::new(',', 17, 11)
    }
}

/// Reason a line was not accepted.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    /// Line is not valid UTF-8.
    InvalidUtf8,
    /// Line has a wrong number of fields.
    FieldCount { expected: usize, actual: usize },
    /// Key field is not a finite number.
    InvalidKey(String),
}

impl Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::InvalidUtf8 => write!(f, "line is not valid UTF-8"),
            Rejection::FieldCount { expected, actual } => {
                write!(f, "expected {} fields, found {}", expected, actual)
            }
            Rejection::InvalidKey(field) => write!(f, "key field {:?} is not a finite number", field),
        }
    }
}

impl Error for Rejection {}

/// A rejected input line together with the rejection reason.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedLine {
    /// One-based input line number.
    pub line_number: u64,
    /// Raw line content without the line terminator.
    pub line: Vec<u8>,
    pub reason: Rejection,
}

/// Turns raw input lines into records.
#[derive(Debug, Clone, Default)]
pub struct Decoder {
    config: DecoderConfig,
}

impl Decoder {
    pub fn new(config: DecoderConfig) -> Self {
        Decoder { config }
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Decodes a raw line read at `line_number` into a record.
    /// The record payload is the line itself, the line number becomes the record sequence number.
    pub fn decode(&self, line_number: u64, line: Vec<u8>) -> Result<Record, RejectedLine> {
        let line = match String::from_utf8(line) {
            Ok(line) => line,
            Err(err) => {
                return Err(RejectedLine {
                    line_number,
                    line: err.into_bytes(),
                    reason: Rejection::InvalidUtf8,
                })
            }
        };

        match self.parse_key(&line) {
            Ok(key) => Ok(Record::new(key, line_number, line)),
            Err(reason) => Err(RejectedLine {
                line_number,
                line: line.into_bytes(),
                reason,
            }),
        }
    }

    fn parse_key(&self, line: &str) -> Result<f64, Rejection> {
        let mut fields = 0;
        let mut key_field = None;
        for (idx, field) in line.split(self.config.delimiter).enumerate() {
            if idx == self.config.key_field {
                key_field = Some(field);
            }
            fields += 1;
        }

        if fields != self.config.expected_fields {
            return Err(Rejection::FieldCount {
                expected: self.config.expected_fields,
                actual: fields,
            });
        }

        let field = key_field.unwrap_or_default();
        match field.trim().parse::<f64>() {
            Ok(key) if key.is_finite() => Ok(key),
            _ => Err(Rejection::InvalidKey(field.to_string())),
        }
    }
}

/// Destination of rejected lines.
pub trait RejectSink {
    /// Accepts a rejected line. An error aborts the sorting.
    fn reject(&mut self, rejected: RejectedLine) -> io::Result<()>;
}

/// Keeps rejected lines in memory.
impl RejectSink for Vec<RejectedLine> {
    fn reject(&mut self, rejected: RejectedLine) -> io::Result<()> {
        self.push(rejected);
        return Ok(());
    }
}

/// Writes raw rejected lines to a writer, one per line.
pub struct RejectWriter<W: Write> {
    writer: W,
    count: u64,
}

impl<W: Write> RejectWriter<W> {
    pub fn new(writer: W) -> Self {
        RejectWriter { writer, count: 0 }
    }

    /// Number of lines written so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Flushes the writer and returns it.
    pub fn finish(mut self) -> io::Result<W> {
        self.writer.flush()?;
        return Ok(self.writer);
    }
}

impl<W: Write> RejectSink for RejectWriter<W> {
    fn reject(&mut self, rejected: RejectedLine) -> io::Result<()> {
        self.writer.write_all(&rejected.line)?;
        self.writer.write_all(b"\n")?;
        self.count += 1;

        return Ok(());
    }
}
