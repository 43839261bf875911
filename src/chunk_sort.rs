//! In-memory sorting of spool chunks.

use std::cmp::Ordering;
use std::num::NonZeroUsize;
use std::path::Path;
use std::thread;

use rayon::prelude::*;

use crate::cancel::CancelToken;
use crate::chunk::{ChunkError, ChunkFile, ChunkKind, ChunkWriter, RecordCodec};
use crate::record::Record;
use crate::sort::{Phase, SortError};

/// Estimated ratio of in-memory records size to their encoded size.
const IN_MEMORY_OVERHEAD: u64 = 4;

/// Returns the number of chunks to be sorted simultaneously.
///
/// Each worker holds a whole chunk in memory, so when a memory limit is set the number of workers
/// is reduced until the largest chunks fit. At least one worker is always used.
pub(crate) fn sort_workers(threads_number: Option<usize>, memory_limit: Option<u64>, chunks: &[ChunkFile]) -> usize {
    let threads = threads_number
        .unwrap_or_else(|| thread::available_parallelism().map(NonZeroUsize::get).unwrap_or(1))
        .max(1);

    let memory_limit = match memory_limit {
        Some(memory_limit) => memory_limit,
        None => return threads,
    };

    let largest_chunk = chunks.iter().map(ChunkFile::bytes).max().unwrap_or(0);
    let chunk_memory = largest_chunk.saturating_mul(IN_MEMORY_OVERHEAD).max(1);
    let fitting = (memory_limit / chunk_memory).max(1);

    return threads.min(usize::try_from(fitting).unwrap_or(usize::MAX));
}

/// Sorts sealed spool chunks one by one, each of them independently of the others.
pub(crate) struct ChunkSorter<'a, C: RecordCodec> {
    pub dir: &'a Path,
    pub codec: C,
    pub rw_buf_size: Option<usize>,
    pub cancel: &'a CancelToken,
}

impl<'a, C: RecordCodec> ChunkSorter<'a, C> {
    /// Sorts all the chunks using the thread pool.
    /// Fails if any of the chunks fails.
    pub fn sort_all<F>(
        &self,
        chunks: Vec<ChunkFile>,
        thread_pool: &rayon::ThreadPool,
        compare: F,
    ) -> Result<Vec<ChunkFile>, SortError>
    where
        F: Fn(&Record, &Record) -> Ordering + Sync + Send + Copy,
    {
        log::info!(
            "sorting {} chunks (workers: {})",
            chunks.len(),
            thread_pool.current_num_threads()
        );

        let sorted = thread_pool.install(|| {
            chunks
                .into_par_iter()
                .map(|chunk| self.sort_chunk(chunk, compare))
                .collect::<Result<Vec<_>, _>>()
        })?;

        log::debug!("chunk sorting done");

        return Ok(sorted);
    }

    /// Loads a spool chunk, sorts it and writes the records into a sorted chunk with the same id.
    /// The spool chunk is deleted afterwards.
    pub fn sort_chunk<F>(&self, chunk: ChunkFile, compare: F) -> Result<ChunkFile, SortError>
    where
        F: Fn(&Record, &Record) -> Ordering + Sync + Send,
    {
        if self.cancel.is_cancelled() {
            return Err(SortError::Cancelled(Phase::Sort));
        }

        log::debug!("sorting chunk {} ({} records)", chunk.id(), chunk.records());

        let mut records = chunk
            .open(self.codec.clone(), self.rw_buf_size)
            .and_then(|reader| reader.collect::<Result<Vec<Record>, ChunkError>>())
            .map_err(|err| SortError::Chunk(Phase::Sort, err))?;

        if self.cancel.is_cancelled() {
            return Err(SortError::Cancelled(Phase::Sort));
        }

        records.par_sort_by(compare);

        let sorted = self
            .write_sorted(chunk.id(), &records)
            .map_err(|err| SortError::Chunk(Phase::Sort, err))?;
        chunk.remove().map_err(|err| SortError::Chunk(Phase::Sort, err))?;

        return Ok(sorted);
    }

    fn write_sorted(&self, id: usize, records: &[Record]) -> Result<ChunkFile, ChunkError> {
        let mut writer = ChunkWriter::create(self.dir, ChunkKind::Sorted, id, self.codec.clone(), self.rw_buf_size)?;
        for record in records {
            writer.write(record)?;
        }

        return writer.seal();
    }
}

#[cfg(test)]
mod test {
    use rand::seq::SliceRandom;
    use rstest::*;

    use super::{sort_workers, ChunkSorter};
    use crate::cancel::CancelToken;
    use crate::chunk::{ChunkError, ChunkFile, ChunkKind, ChunkWriter, RmpCodec};
    use crate::record::{ascending, descending, Record};
    use crate::sort::{Phase, SortError};

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    fn spool_chunk(tmp_dir: &tempfile::TempDir, id: usize, keys: &[f64]) -> ChunkFile {
        let mut writer = ChunkWriter::create(tmp_dir.path(), ChunkKind::Spool, id, RmpCodec, None).unwrap();
        for (idx, key) in keys.iter().enumerate() {
            writer
                .write(&Record::new(*key, idx as u64 + 1, format!("{}", key)))
                .unwrap();
        }

        return writer.seal().unwrap();
    }

    fn read_keys(chunk: &ChunkFile) -> Vec<f64> {
        let records: Result<Vec<Record>, ChunkError> = chunk.open(RmpCodec, None).unwrap().collect();
        records.unwrap().iter().map(Record::key).collect()
    }

    #[rstest]
    #[case(false)]
    #[case(true)]
    fn test_sort_chunk(tmp_dir: tempfile::TempDir, #[case] reversed: bool) {
        let mut keys = Vec::from_iter((0..100).map(f64::from));
        keys.shuffle(&mut rand::thread_rng());

        let chunk = spool_chunk(&tmp_dir, 5, &keys);
        let spool_path = chunk.path().to_path_buf();

        let cancel = CancelToken::new();
        let sorter = ChunkSorter {
            dir: tmp_dir.path(),
            codec: RmpCodec,
            rw_buf_size: None,
            cancel: &cancel,
        };

        let sorted = if reversed {
            sorter.sort_chunk(chunk, descending).unwrap()
        } else {
            sorter.sort_chunk(chunk, ascending).unwrap()
        };

        let mut expected = Vec::from_iter((0..100).map(f64::from));
        if reversed {
            expected.reverse();
        }

        assert_eq!(sorted.id(), 5);
        assert_eq!(sorted.kind(), ChunkKind::Sorted);
        assert_eq!(sorted.records(), 100);
        assert_eq!(read_keys(&sorted), expected);
        assert!(!spool_path.exists());
    }

    #[rstest]
    fn test_sort_chunk_ties_keep_input_order(tmp_dir: tempfile::TempDir) {
        let chunk = spool_chunk(&tmp_dir, 0, &[7.25, 1.0, 7.25, 7.25]);
        let cancel = CancelToken::new();
        let sorter = ChunkSorter {
            dir: tmp_dir.path(),
            codec: RmpCodec,
            rw_buf_size: None,
            cancel: &cancel,
        };

        let sorted = sorter.sort_chunk(chunk, ascending).unwrap();
        let records: Result<Vec<Record>, ChunkError> = sorted.open(RmpCodec, None).unwrap().collect();
        let seqs: Vec<u64> = records.unwrap().iter().map(Record::seq).collect();

        assert_eq!(seqs, vec![2, 1, 3, 4]);
    }

    #[rstest]
    fn test_sort_all(tmp_dir: tempfile::TempDir) {
        let chunks = vec![
            spool_chunk(&tmp_dir, 0, &[3.0, 1.0, 2.0]),
            spool_chunk(&tmp_dir, 1, &[9.0, 8.0]),
            spool_chunk(&tmp_dir, 2, &[5.0]),
        ];
        let cancel = CancelToken::new();
        let sorter = ChunkSorter {
            dir: tmp_dir.path(),
            codec: RmpCodec,
            rw_buf_size: Some(64),
            cancel: &cancel,
        };
        let thread_pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();

        let sorted = sorter.sort_all(chunks, &thread_pool, ascending).unwrap();

        let actual: Vec<Vec<f64>> = sorted.iter().map(read_keys).collect();
        assert_eq!(actual, vec![vec![1.0, 2.0, 3.0], vec![8.0, 9.0], vec![5.0]]);
    }

    #[rstest]
    fn test_sort_all_cancelled(tmp_dir: tempfile::TempDir) {
        let chunks = vec![spool_chunk(&tmp_dir, 0, &[2.0, 1.0])];
        let cancel = CancelToken::new();
        cancel.cancel();
        let sorter = ChunkSorter {
            dir: tmp_dir.path(),
            codec: RmpCodec,
            rw_buf_size: None,
            cancel: &cancel,
        };
        let thread_pool = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();

        let result = sorter.sort_all(chunks, &thread_pool, ascending);

        assert!(matches!(result, Err(SortError::Cancelled(Phase::Sort))));
    }

    #[rstest]
    fn test_sort_chunk_missing_file(tmp_dir: tempfile::TempDir) {
        let chunk = spool_chunk(&tmp_dir, 0, &[1.0]);
        std::fs::remove_file(chunk.path()).unwrap();
        let cancel = CancelToken::new();
        let sorter = ChunkSorter {
            dir: tmp_dir.path(),
            codec: RmpCodec,
            rw_buf_size: None,
            cancel: &cancel,
        };

        let result = sorter.sort_chunk(chunk, ascending);

        assert!(matches!(result, Err(SortError::Chunk(Phase::Sort, ChunkError::IO(_)))));
    }

    #[rstest]
    #[case(Some(8), None, 8)]
    #[case(Some(8), Some(u64::MAX), 8)]
    #[case(Some(8), Some(1), 1)]
    #[case(Some(0), None, 1)]
    fn test_sort_workers(
        tmp_dir: tempfile::TempDir,
        #[case] threads: Option<usize>,
        #[case] memory_limit: Option<u64>,
        #[case] expected: usize,
    ) {
        let chunks = vec![spool_chunk(&tmp_dir, 0, &[1.0, 2.0, 3.0])];

        assert_eq!(sort_workers(threads, memory_limit, &chunks), expected);
    }

    #[rstest]
    fn test_sort_workers_memory_bound(tmp_dir: tempfile::TempDir) {
        let chunks = vec![spool_chunk(&tmp_dir, 0, &[1.0, 2.0]), spool_chunk(&tmp_dir, 1, &[1.0; 10])];
        let chunk_memory = chunks[1].bytes() * 4;

        assert_eq!(sort_workers(Some(16), Some(chunk_memory * 3 + 1), &chunks), 3);
    }
}
