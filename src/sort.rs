//! External sorter.

use std::cmp::Ordering;
use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::io;
use std::io::prelude::*;
use std::path::Path;

use crate::budget::BatchSize;
use crate::cancel::CancelToken;
use crate::chunk::{ChunkError, RecordCodec, RmpCodec};
use crate::chunk_sort::{self, ChunkSorter};
use crate::decoder::{Decoder, DecoderConfig, RejectSink};
use crate::input::LineReader;
use crate::merger::MergeCoordinator;
use crate::record::{self, Record};
use crate::split::ChunkSplitter;

/// Default maximum number of chunks merged at once.
pub const DEFAULT_MAX_OPEN_CHUNKS: usize = 64;

/// Sorting phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Input splitting into spool chunks.
    Split,
    /// Spool chunks sorting.
    Sort,
    /// Sorted chunks merging.
    Merge,
}

impl Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Split => write!(f, "split"),
            Phase::Sort => write!(f, "sort"),
            Phase::Merge => write!(f, "merge"),
        }
    }
}

/// Sorting error.
#[derive(Debug)]
pub enum SortError {
    /// Sorter configuration is invalid.
    InvalidConfig(String),
    /// Temporary directory or file creation error.
    TempDir(io::Error),
    /// Workers thread pool initialization error.
    ThreadPoolBuildError(rayon::ThreadPoolBuildError),
    /// Input data stream error.
    Input(io::Error),
    /// Rejected lines sink error.
    Rejects(io::Error),
    /// Chunk file error.
    Chunk(Phase, ChunkError),
    /// Output stream error.
    Output(io::Error),
    /// Sorting was cancelled.
    Cancelled(Phase),
}

impl SortError {
    /// Returns the phase the error occurred in.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            SortError::Input(_) | SortError::Rejects(_) => Some(Phase::Split),
            SortError::ThreadPoolBuildError(_) => Some(Phase::Sort),
            SortError::Output(_) => Some(Phase::Merge),
            SortError::Chunk(phase, _) | SortError::Cancelled(phase) => Some(*phase),
            SortError::InvalidConfig(_) | SortError::TempDir(_) => None,
        }
    }
}

impl Error for SortError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            SortError::TempDir(err) => Some(err),
            SortError::ThreadPoolBuildError(err) => Some(err),
            SortError::Input(err) => Some(err),
            SortError::Rejects(err) => Some(err),
            SortError::Chunk(_, err) => Some(err),
            SortError::Output(err) => Some(err),
            SortError::InvalidConfig(_) | SortError::Cancelled(_) => None,
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
            SortError::Rejects(err) => write!(f, "rejected lines saving error: {}", err),
            SortError::Chunk(phase, err) => write!(f, "{} phase chunk error: {}", phase, err),
            SortError::Output(err) => write!(f, "output stream error: {}", err),
            SortError::Cancelled(phase) => write!(f, "sorting cancelled during {} phase", phase),
        }
    }
}

/// Outcome of a successful sorting run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SortSummary {
    /// Input lines written to the output.
    pub accepted: u64,
    /// Input lines passed to the reject sink.
    pub rejected: u64,
    /// Number of spool chunks the input was split into.
    pub chunks: usize,
    /// Number of intermediate merge waves.
    pub merge_waves: usize,
    /// Number of chunks sorted simultaneously.
    pub sort_workers: usize,
}

impl Display for SortSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} lines accepted, {} rejected ({} chunks, {} sort workers, {} merge waves)",
            self.accepted, self.rejected, self.chunks, self.sort_workers, self.merge_waves
        )
    }
}

/// External sorter builder. Provides methods for [`ExternalSorter`] initialization.
#[derive(Clone)]
pub struct ExternalSorterBuilder<C = RmpCodec>
where
    C: RecordCodec,
{
    /// Number of threads to be used to sort chunks in parallel.
    threads_number: Option<usize>,
    /// Directory to be used to store temporary data.
    tmp_dir: Option<Box<Path>>,
    /// Chunk file read/write buffer size.
    rw_buf_size: Option<usize>,
    /// Spool chunk budget.
    batch_size: BatchSize,
    /// Input line layout.
    decoder: DecoderConfig,
    /// Maximum number of chunks merged at once.
    max_open_chunks: usize,
    /// Memory available for chunk sorting.
    memory_limit: Option<u64>,
    /// Chunk record codec.
    codec: C,
    /// Cancellation flag.
    cancel: CancelToken,
}

impl ExternalSorterBuilder<RmpCodec> {
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        ExternalSorterBuilder::default()
    }
}

impl<C> ExternalSorterBuilder<C>
where
    C: RecordCodec,
{
    /// Builds an [`ExternalSorter`] instance using provided configuration.
    pub fn build(self) -> Result<ExternalSorter<C>, SortError> {
        self.validate().map_err(|reason| SortError::InvalidConfig(reason))?;

        return Ok(ExternalSorter {
            threads_number: self.threads_number,
            tmp_dir: ExternalSorter::<C>::init_tmp_directory(self.tmp_dir.as_deref())?,
            rw_buf_size: self.rw_buf_size,
            batch_size: self.batch_size,
            decoder: Decoder::new(self.decoder),
            max_open_chunks: self.max_open_chunks,
            memory_limit: self.memory_limit,
            codec: self.codec,
            cancel: self.cancel,
        });
    }

    fn validate(&self) -> Result<(), String> {
        if self.batch_size.limit() == 0 {
            return Err("batch size must be positive".to_string());
        }
        if self.max_open_chunks < 2 {
            return Err(format!(
                "at least 2 chunks must be merged at once, got {}",
                self.max_open_chunks
            ));
        }
        if self.memory_limit == Some(0) {
            return Err("memory limit must be positive".to_string());
        }
        if self.rw_buf_size == Some(0) {
            return Err("read/write buffer size must be positive".to_string());
        }

        return self.decoder.validate();
    }

    /// Sets number of threads to be used to sort chunks in parallel.
    pub fn with_threads_number(mut self, threads_number: usize) -> ExternalSorterBuilder<C> {
        self.threads_number = Some(threads_number);
        return self;
    }

    /// Sets directory to be used to store temporary data.
    pub fn with_tmp_dir(mut self, path: &Path) -> ExternalSorterBuilder<C> {
        self.tmp_dir = Some(path.into());
        return self;
    }

    /// Sets spool chunk budget.
    pub fn with_batch_size(mut self, batch_size: BatchSize) -> ExternalSorterBuilder<C> {
        self.batch_size = batch_size;
        return self;
    }

    /// Sets input line layout.
    pub fn with_decoder(mut self, decoder: DecoderConfig) -> ExternalSorterBuilder<C> {
        self.decoder = decoder;
        return self;
    }

    /// Sets maximum number of chunks merged at once.
    pub fn with_max_open_chunks(mut self, max_open_chunks: usize) -> ExternalSorterBuilder<C> {
        self.max_open_chunks = max_open_chunks;
        return self;
    }

    /// Sets memory available for chunk sorting. Limits the number of chunks sorted simultaneously.
    pub fn with_memory_limit(mut self, memory_limit: u64) -> ExternalSorterBuilder<C> {
        self.memory_limit = Some(memory_limit);
        return self;
    }

    /// Sets chunk read/write buffer size.
    pub fn with_rw_buf_size(mut self, buf_size: usize) -> ExternalSorterBuilder<C> {
        self.rw_buf_size = Some(buf_size);
        return self;
    }

    /// Sets cancellation token.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> ExternalSorterBuilder<C> {
        self.cancel = cancel;
        return self;
    }

    /// Sets chunk record codec.
    pub fn with_codec<D: RecordCodec>(self, codec: D) -> ExternalSorterBuilder<D> {
        ExternalSorterBuilder {
            threads_number: self.threads_number,
            tmp_dir: self.tmp_dir,
            rw_buf_size: self.rw_buf_size,
            batch_size: self.batch_size,
            decoder: self.decoder,
            max_open_chunks: self.max_open_chunks,
            memory_limit: self.memory_limit,
            codec,
            cancel: self.cancel,
        }
    }
}

impl<C> Default for ExternalSorterBuilder<C>
where
    C: RecordCodec + Default,
{
    fn default() -> Self {
        ExternalSorterBuilder {
            threads_number: None,
            tmp_dir: None,
            rw_buf_size: None,
            batch_size: BatchSize::default(),
            decoder: DecoderConfig::default(),
            max_open_chunks: DEFAULT_MAX_OPEN_CHUNKS,
            memory_limit: None,
            codec: C::default(),
            cancel: CancelToken::default(),
        }
    }
}

/// External sorter.
///
/// Every sorting run uses its own directory inside the sorter temporary directory. The run directory
/// and everything left in it is removed when the run returns, whatever the outcome.
pub struct ExternalSorter<C = RmpCodec>
where
    C: RecordCodec,
{
    /// Number of threads to be used to sort chunks in parallel.
    threads_number: Option<usize>,
    /// Directory to be used to store temporary data.
    tmp_dir: tempfile::TempDir,
    /// Chunk file read/write buffer size.
    rw_buf_size: Option<usize>,
    /// Spool chunk budget.
    batch_size: BatchSize,
    /// Input line decoder.
    decoder: Decoder,
    /// Maximum number of chunks merged at once.
    max_open_chunks: usize,
    /// Memory available for chunk sorting.
    memory_limit: Option<u64>,
    /// Chunk record codec.
    codec: C,
    /// Cancellation flag.
    cancel: CancelToken,
}

impl<C> ExternalSorter<C>
where
    C: RecordCodec,
{
    fn init_thread_pool(threads_number: usize) -> Result<rayon::ThreadPool, SortError> {
        log::info!("initializing thread-pool (threads: {})", threads_number);
        let thread_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads_number)
            .thread_name(|idx| format!("chunk-sort-{}", idx))
            .build()
            .map_err(|err| SortError::ThreadPoolBuildError(err))?;

        return Ok(thread_pool);
    }

    fn init_tmp_directory(tmp_path: Option<&Path>) -> Result<tempfile::TempDir, SortError> {
        let tmp_dir = if let Some(tmp_path) = tmp_path {
            tempfile::tempdir_in(tmp_path)
        } else {
            tempfile::tempdir()
        }
        .map_err(|err| SortError::TempDir(err))?;

        log::info!("using {} as a temporary directory", tmp_dir.path().display());

        return Ok(tmp_dir);
    }

    fn ensure_not_cancelled(&self, phase: Phase) -> Result<(), SortError> {
        if self.cancel.is_cancelled() {
            log::warn!("sorting cancelled before {} phase", phase);
            return Err(SortError::Cancelled(phase));
        }

        return Ok(());
    }

    /// Returns the token cancelling this sorter runs.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Sorts input lines in ascending key order.
    ///
    /// # Arguments
    /// * `input` - Input lines stream
    /// * `rejects` - Sink receiving lines that could not be decoded
    /// * `output` - Stream the sorted lines are written to
    pub fn sort<R, S, W>(&self, input: R, rejects: &mut S, output: &mut W) -> Result<SortSummary, SortError>
    where
        R: BufRead,
        S: RejectSink + ?Sized,
        W: Write + ?Sized,
    {
        self.sort_by(input, rejects, output, record::ascending)
    }

    /// Sorts input lines using a custom compare function.
    ///
    /// Splits the input into spool chunks, sorts every chunk and merges the sorted chunks into the output.
    /// Every phase starts only after the previous one has sealed all its chunks.
    ///
    /// # Arguments
    /// * `input` - Input lines stream
    /// * `rejects` - Sink receiving lines that could not be decoded
    /// * `output` - Stream the sorted lines are written to
    /// * `compare` - Function be be used to compare records
    pub fn sort_by<R, S, W, F>(
        &self,
        input: R,
        rejects: &mut S,
        output: &mut W,
        compare: F,
    ) -> Result<SortSummary, SortError>
    where
        R: BufRead,
        S: RejectSink + ?Sized,
        W: Write + ?Sized,
        F: Fn(&Record, &Record) -> Ordering + Sync + Send + Copy,
    {
        let run_dir = tempfile::Builder::new()
            .prefix("run-")
            .tempdir_in(self.tmp_dir.path())
            .map_err(|err| SortError::TempDir(err))?;
        log::debug!("using {} as a run directory", run_dir.path().display());

        self.ensure_not_cancelled(Phase::Split)?;
        let splitter = ChunkSplitter {
            dir: run_dir.path(),
            decoder: &self.decoder,
            batch_size: self.batch_size,
            codec: self.codec.clone(),
            rw_buf_size: self.rw_buf_size,
            cancel: &self.cancel,
        };
        let (chunks, split_stats) = splitter.split(LineReader::new(input), rejects)?;
        let chunks_number = chunks.len();

        self.ensure_not_cancelled(Phase::Sort)?;
        let sort_workers = chunk_sort::sort_workers(self.threads_number, self.memory_limit, &chunks);
        let thread_pool = Self::init_thread_pool(sort_workers)?;
        let sorter = ChunkSorter {
            dir: run_dir.path(),
            codec: self.codec.clone(),
            rw_buf_size: self.rw_buf_size,
            cancel: &self.cancel,
        };
        let sorted = sorter.sort_all(chunks, &thread_pool, compare)?;

        self.ensure_not_cancelled(Phase::Merge)?;
        let coordinator = MergeCoordinator {
            dir: run_dir.path(),
            codec: self.codec.clone(),
            rw_buf_size: self.rw_buf_size,
            max_open_chunks: self.max_open_chunks,
            cancel: &self.cancel,
        };
        let merge_stats = coordinator.merge(sorted, compare, output)?;

        if let Err(err) = run_dir.close() {
            log::warn!("run directory removal failed: {}", err);
        }

        let summary = SortSummary {
            accepted: split_stats.accepted,
            rejected: split_stats.rejected,
            chunks: chunks_number,
            merge_waves: merge_stats.waves,
            sort_workers,
        };
        log::info!("sorting done: {}", summary);

        return Ok(summary);
    }

    /// Sorts input lines into the file at `output_path`.
    ///
    /// The sorted lines are written into a temporary file next to the destination which is renamed
    /// to `output_path` once the merge completes. If sorting fails the destination is left untouched.
    pub fn sort_file<R, S, F>(
        &self,
        input: R,
        output_path: &Path,
        rejects: &mut S,
        compare: F,
    ) -> Result<SortSummary, SortError>
    where
        R: BufRead,
        S: RejectSink + ?Sized,
        F: Fn(&Record, &Record) -> Ordering + Sync + Send + Copy,
    {
        let output_dir = match output_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let partial = tempfile::Builder::new()
            .prefix(".ext-keysort-")
            .suffix(".partial")
            .tempfile_in(output_dir)
            .map_err(|err| SortError::Output(err))?;

        let mut writer = match self.rw_buf_size {
            Some(buf_size) => io::BufWriter::with_capacity(buf_size, partial.as_file()),
            None => io::BufWriter::new(partial.as_file()),
        };
        let summary = self.sort_by(input, rejects, &mut writer, compare)?;
        writer.into_inner().map_err(|err| SortError::Output(err.into_error()))?;

        partial
            .persist(output_path)
            .map_err(|err| SortError::Output(err.error))?;
        log::info!("sorted data saved to {}", output_path.display());

        return Ok(summary);
    }
}
