//! Chunk files stored on the file system.

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::io;
use std::io::prelude::*;
use std::path::{Path, PathBuf};

use crate::record::Record;

/// Boxed codec error.
pub type CodecError = Box<dyn Error + Send + Sync>;

/// Chunk file error.
#[derive(Debug)]
pub enum ChunkError {
    /// Common I/O error.
    IO(io::Error),
    /// Record serialization error.
    SerializationError(CodecError),
    /// Record deserialization error.
    DeserializationError(CodecError),
}

impl Error for ChunkError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(match &self {
            ChunkError::IO(err) => err,
            ChunkError::SerializationError(err) => &**err,
            ChunkError::DeserializationError(err) => &**err,
        })
    }
}

impl Display for ChunkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            ChunkError::IO(err) => write!(f, "chunk I/O operation failed: {}", err),
            ChunkError::SerializationError(err) => write!(f, "record serialization error: {}", err),
            ChunkError::DeserializationError(err) => write!(f, "record deserialization error: {}", err),
        }
    }
}

impl From<io::Error> for ChunkError {
    fn from(err: io::Error) -> Self {
        ChunkError::IO(err)
    }
}

/// Record encoding used for chunk files.
///
/// An implementation must restore the key exactly and the payload byte for byte.
/// Records are written back to back, the end of a chunk is detected by its length.
pub trait RecordCodec: Clone + Send + Sync {
    /// Writes a single record.
    fn encode<W: Write>(&self, writer: &mut W, record: &Record) -> Result<(), CodecError>;

    /// Reads a single record.
    fn decode<R: Read>(&self, reader: &mut R) -> Result<Record, CodecError>;
}

/// RMP (Rust MessagePack) record codec.
/// For more information see https://msgpack.org/.
#[derive(Debug, Clone, Copy, Default)]
pub struct RmpCodec;

impl RecordCodec for RmpCodec {
    fn encode<W: Write>(&self, writer: &mut W, record: &Record) -> Result<(), CodecError> {
        rmp_serde::encode::write(writer, record)?;
        return Ok(());
    }

    fn decode<R: Read>(&self, reader: &mut R) -> Result<Record, CodecError> {
        let record = rmp_serde::decode::from_read(reader)?;
        return Ok(record);
    }
}

/// Chunk file role in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// Records in input order.
    Spool,
    /// Records of a single spool chunk in sorted order.
    Sorted,
    /// Records of several sorted chunks merged in sorted order.
    Merged,
}

impl ChunkKind {
    fn prefix(&self) -> &'static str {
        match self {
            ChunkKind::Spool => "spool",
            ChunkKind::Sorted => "sorted",
            ChunkKind::Merged => "merged",
        }
    }
}

/// A sealed chunk file. Its content never changes after sealing.
#[derive(Debug)]
pub struct ChunkFile {
    id: usize,
    kind: ChunkKind,
    path: PathBuf,
    records: u64,
    bytes: u64,
}

impl ChunkFile {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn kind(&self) -> ChunkKind {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records stored in the chunk.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Encoded chunk size.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Opens the chunk for sequential reading.
    pub fn open<C: RecordCodec>(&self, codec: C, buf_size: Option<usize>) -> Result<ChunkReader<C>, ChunkError> {
        let file = fs::File::open(&self.path)?;
        let file_len = file.metadata()?.len();

        let reader = match buf_size {
            Some(buf_size) => io::BufReader::with_capacity(buf_size, file),
            None => io::BufReader::new(file),
        };

        return Ok(ChunkReader {
            reader: reader.take(file_len),
            codec,
        });
    }

    /// Deletes the chunk file.
    pub fn remove(self) -> Result<(), ChunkError> {
        fs::remove_file(&self.path)?;
        return Ok(());
    }
}

/// Writer counting bytes passed through it.
struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.count += written as u64;
        return Ok(written);
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Writes records into a new chunk file.
pub struct ChunkWriter<C: RecordCodec> {
    id: usize,
    kind: ChunkKind,
    path: PathBuf,
    writer: CountingWriter<io::BufWriter<fs::File>>,
    records: u64,
    codec: C,
}

impl<C: RecordCodec> ChunkWriter<C> {
    /// Creates a new chunk file named after its kind and id in `dir`.
    pub fn create(dir: &Path, kind: ChunkKind, id: usize, codec: C, buf_size: Option<usize>) -> Result<Self, ChunkError> {
        let path = dir.join(format!("{}-{:06}.chunk", kind.prefix(), id));
        let file = fs::OpenOptions::new().write(true).create_new(true).open(&path)?;

        let writer = match buf_size {
            Some(buf_size) => io::BufWriter::with_capacity(buf_size, file),
            None => io::BufWriter::new(file),
        };

        return Ok(ChunkWriter {
            id,
            kind,
            path,
            writer: CountingWriter { inner: writer, count: 0 },
            records: 0,
            codec,
        });
    }

    /// Appends a record to the chunk.
    pub fn write(&mut self, record: &Record) -> Result<(), ChunkError> {
        self.codec
            .encode(&mut self.writer, record)
            .map_err(|err| ChunkError::SerializationError(err))?;
        self.records += 1;

        return Ok(());
    }

    /// Number of records written so far.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Number of encoded bytes written so far.
    pub fn bytes(&self) -> u64 {
        self.writer.count
    }

    /// Flushes and closes the chunk file.
    pub fn seal(self) -> Result<ChunkFile, ChunkError> {
        let bytes = self.writer.count;
        let file = self.writer.inner.into_inner().map_err(|err| err.into_error())?;
        drop(file);

        return Ok(ChunkFile {
            id: self.id,
            kind: self.kind,
            path: self.path,
            records: self.records,
            bytes,
        });
    }
}

/// Forward-only record stream over a sealed chunk file.
pub struct ChunkReader<C: RecordCodec> {
    reader: io::Take<io::BufReader<fs::File>>,
    codec: C,
}

impl<C: RecordCodec> Iterator for ChunkReader<C> {
    type Item = Result<Record, ChunkError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.reader.limit() == 0 {
            None
        } else {
            match self.codec.decode(&mut self.reader) {
                Ok(record) => Some(Ok(record)),
                Err(err) => {
                    // the rest of a corrupt chunk can not be trusted
                    self.reader.set_limit(0);
                    Some(Err(ChunkError::DeserializationError(err)))
                }
            }
        }
    }
}
