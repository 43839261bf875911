//! Input splitting into spool chunks.

use std::io;
use std::path::Path;

use crate::budget::BatchSize;
use crate::cancel::CancelToken;
use crate::chunk::{ChunkFile, ChunkKind, ChunkWriter, RecordCodec};
use crate::decoder::{Decoder, RejectSink};
use crate::sort::{Phase, SortError};

/// Input line counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SplitStats {
    /// Lines decoded into records.
    pub accepted: u64,
    /// Lines passed to the reject sink.
    pub rejected: u64,
}

/// Splits an input line stream into sealed spool chunks.
///
/// Only one chunk is open at a time. A chunk is created for the first record that has no open chunk
/// and is sealed right after the record that exhausts the batch budget.
pub(crate) struct ChunkSplitter<'a, C: RecordCodec> {
    pub dir: &'a Path,
    pub decoder: &'a Decoder,
    pub batch_size: BatchSize,
    pub codec: C,
    pub rw_buf_size: Option<usize>,
    pub cancel: &'a CancelToken,
}

impl<'a, C: RecordCodec> ChunkSplitter<'a, C> {
    /// Reads all the lines and returns the sealed chunks in input order.
    pub fn split<I, S>(&self, lines: I, rejects: &mut S) -> Result<(Vec<ChunkFile>, SplitStats), SortError>
    where
        I: IntoIterator<Item = io::Result<Vec<u8>>>,
        S: RejectSink + ?Sized,
    {
        let mut chunks = Vec::new();
        let mut stats = SplitStats::default();
        let mut current: Option<ChunkWriter<C>> = None;

        for (idx, line) in lines.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                log::warn!("input splitting cancelled after {} lines", idx);
                return Err(SortError::Cancelled(Phase::Split));
            }

            let line = line.map_err(|err| SortError::Input(err))?;
            let record = match self.decoder.decode(idx as u64 + 1, line) {
                Ok(record) => record,
                Err(rejected) => {
                    log::trace!("line {} rejected: {}", rejected.line_number, rejected.reason);
                    stats.rejected += 1;
                    rejects.reject(rejected).map_err(|err| SortError::Rejects(err))?;
                    continue;
                }
            };

            let mut writer = match current.take() {
                Some(writer) => writer,
                None => ChunkWriter::create(
                    self.dir,
                    ChunkKind::Spool,
                    chunks.len(),
                    self.codec.clone(),
                    self.rw_buf_size,
                )
                .map_err(|err| SortError::Chunk(Phase::Split, err))?,
            };

            writer
                .write(&record)
                .map_err(|err| SortError::Chunk(Phase::Split, err))?;
            stats.accepted += 1;

            if self.batch_size.is_exceeded(writer.records(), writer.bytes()) {
                chunks.push(Self::seal(writer)?);
            } else {
                current = Some(writer);
            }
        }

        if let Some(writer) = current {
            chunks.push(Self::seal(writer)?);
        }

        log::info!(
            "input split into {} chunks ({} lines accepted, {} rejected)",
            chunks.len(),
            stats.accepted,
            stats.rejected
        );

        return Ok((chunks, stats));
    }

    fn seal(writer: ChunkWriter<C>) -> Result<ChunkFile, SortError> {
        let chunk = writer.seal().map_err(|err| SortError::Chunk(Phase::Split, err))?;
        log::debug!(
            "spool chunk {} sealed ({} records, {} bytes)",
            chunk.id(),
            chunk.records(),
            chunk.bytes()
        );

        return Ok(chunk);
    }
}
