//! Binary heap merger.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io::prelude::*;
use std::path::Path;

use crate::cancel::CancelToken;
use crate::chunk::{ChunkError, ChunkFile, ChunkKind, ChunkWriter, RecordCodec};
use crate::record::Record;
use crate::sort::{Phase, SortError};

/// A sorted record stream taking part in a merge.
///
/// A source may be backed by a chunk file. When the stream is exhausted it is dropped, which closes
/// the file, and the backing file is deleted.
pub struct MergeSource<I> {
    id: usize,
    stream: Option<I>,
    backing: Option<ChunkFile>,
}

impl<I> MergeSource<I>
where
    I: Iterator<Item = Result<Record, ChunkError>>,
{
    /// Creates a source without a backing file.
    pub fn new(stream: I) -> Self {
        MergeSource {
            id: 0,
            stream: Some(stream),
            backing: None,
        }
    }

    /// Creates a source reading from the chunk file `backing`.
    pub fn backed_by(stream: I, backing: ChunkFile) -> Self {
        MergeSource {
            id: 0,
            stream: Some(stream),
            backing: Some(backing),
        }
    }

    /// Source id, equal to the source index in its merger.
    pub fn id(&self) -> usize {
        self.id
    }

    fn next(&mut self) -> Option<Result<Record, ChunkError>> {
        self.stream.as_mut()?.next()
    }

    fn close(&mut self) -> Result<(), ChunkError> {
        self.stream = None;
        if let Some(backing) = self.backing.take() {
            log::debug!("chunk {} merged, removing {}", backing.id(), backing.path().display());
            backing.remove()?;
        }

        return Ok(());
    }
}

struct HeapEntry<F> {
    record: Record,
    source: usize,
    compare: F,
}

impl<F> Ord for HeapEntry<F>
where
    F: Fn(&Record, &Record) -> Ordering,
{
    // binary heap is max-heap by default so the order is reversed to convert it to min-heap
    fn cmp(&self, other: &Self) -> Ordering {
        (self.compare)(&other.record, &self.record).then_with(|| other.source.cmp(&self.source))
    }
}

impl<F> PartialOrd for HeapEntry<F>
where
    F: Fn(&Record, &Record) -> Ordering,
{
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<F> PartialEq for HeapEntry<F>
where
    F: Fn(&Record, &Record) -> Ordering,
{
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<F> Eq for HeapEntry<F> where F: Fn(&Record, &Record) -> Ordering {}

/// Binary heap merger implementation.
/// Merges multiple sorted sources into a single sorted output.
/// Time complexity is *m* \* log(*n*) in worst case where *m* is the number of records,
/// *n* is the number of sources.
///
/// Records comparing equal are taken from the source with the lower id first.
pub struct BinaryHeapMerger<I, F>
where
    I: Iterator<Item = Result<Record, ChunkError>>,
    F: Fn(&Record, &Record) -> Ordering + Copy,
{
    items: BinaryHeap<HeapEntry<F>>,
    sources: Vec<MergeSource<I>>,
    compare: F,
    initiated: bool,
}

impl<I, F> BinaryHeapMerger<I, F>
where
    I: Iterator<Item = Result<Record, ChunkError>>,
    F: Fn(&Record, &Record) -> Ordering + Copy,
{
    /// Creates an instance of a binary heap merger.
    /// Source records should be sorted according to `compare` otherwise the result is undefined.
    /// Sources get ids in iteration order.
    ///
    /// # Arguments
    /// * `sources` - Sources to be merged in a single sorted one
    /// * `compare` - Function used to compare records
    pub fn new<S>(sources: S, compare: F) -> Self
    where
        S: IntoIterator<Item = MergeSource<I>>,
    {
        let sources = Vec::from_iter(sources.into_iter().enumerate().map(|(id, mut source)| {
            source.id = id;
            source
        }));
        let items = BinaryHeap::with_capacity(sources.len());

        return BinaryHeapMerger {
            items,
            sources,
            compare,
            initiated: false,
        };
    }

    /// Pulls the next record of the source into the heap or closes the source if it is exhausted.
    fn advance(&mut self, source_id: usize) -> Result<(), ChunkError> {
        let source = &mut self.sources[source_id];
        match source.next() {
            Some(Ok(record)) => {
                self.items.push(HeapEntry {
                    record,
                    source: source_id,
                    compare: self.compare,
                });
                Ok(())
            }
            Some(Err(err)) => Err(err),
            None => source.close(),
        }
    }
}

impl<I, F> Iterator for BinaryHeapMerger<I, F>
where
    I: Iterator<Item = Result<Record, ChunkError>>,
    F: Fn(&Record, &Record) -> Ordering + Copy,
{
    type Item = Result<Record, ChunkError>;

    /// Returns the next record from the sources in sorted order.
    fn next(&mut self) -> Option<Self::Item> {
        if !self.initiated {
            self.initiated = true;
            for source_id in 0..self.sources.len() {
                if let Err(err) = self.advance(source_id) {
                    return Some(Err(err));
                }
            }
        }

        let entry = self.items.pop()?;
        if let Err(err) = self.advance(entry.source) {
            return Some(Err(err));
        }

        return Some(Ok(entry.record));
    }
}

/// Merge phase statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Number of intermediate merge waves.
    pub waves: usize,
    /// Number of records written to the output.
    pub records: u64,
}

/// Merges sorted chunks keeping at most `max_open_chunks` of them open at once.
pub(crate) struct MergeCoordinator<'a, C: RecordCodec> {
    pub dir: &'a Path,
    pub codec: C,
    pub rw_buf_size: Option<usize>,
    pub max_open_chunks: usize,
    pub cancel: &'a CancelToken,
}

impl<'a, C: RecordCodec> MergeCoordinator<'a, C> {
    /// Merges all the chunks and writes record payloads to the output, one per line.
    pub fn merge<F, W>(&self, chunks: Vec<ChunkFile>, compare: F, output: &mut W) -> Result<MergeStats, SortError>
    where
        F: Fn(&Record, &Record) -> Ordering + Copy,
        W: Write + ?Sized,
    {
        let (chunks, waves) = self.reduce(chunks, compare)?;

        log::info!("merging {} chunks into the output", chunks.len());
        let records = self.drain(chunks, compare, |record| {
            output
                .write_all(record.payload().as_bytes())
                .and_then(|_| output.write_all(b"\n"))
                .map_err(|err| SortError::Output(err))
        })?;
        output.flush().map_err(|err| SortError::Output(err))?;

        return Ok(MergeStats { waves, records });
    }

    /// Merges groups of chunks into intermediate chunks until no more than `max_open_chunks` are left.
    /// Returns the remaining chunks and the number of merge waves performed.
    fn reduce<F>(&self, mut chunks: Vec<ChunkFile>, compare: F) -> Result<(Vec<ChunkFile>, usize), SortError>
    where
        F: Fn(&Record, &Record) -> Ordering + Copy,
    {
        let mut waves = 0;
        let mut next_id = 0;

        while chunks.len() > self.max_open_chunks {
            waves += 1;
            log::info!(
                "merge wave {}: {} chunks, at most {} at once",
                waves,
                chunks.len(),
                self.max_open_chunks
            );

            let mut merged = Vec::with_capacity(chunks.len() / self.max_open_chunks + 1);
            let mut remaining = chunks.into_iter();
            loop {
                let group: Vec<ChunkFile> = remaining.by_ref().take(self.max_open_chunks).collect();
                if group.len() <= 1 {
                    merged.extend(group);
                    break;
                }

                let mut writer =
                    ChunkWriter::create(self.dir, ChunkKind::Merged, next_id, self.codec.clone(), self.rw_buf_size)
                        .map_err(|err| SortError::Chunk(Phase::Merge, err))?;
                next_id += 1;

                self.drain(group, compare, |record| {
                    writer
                        .write(&record)
                        .map_err(|err| SortError::Chunk(Phase::Merge, err))
                })?;

                let chunk = writer.seal().map_err(|err| SortError::Chunk(Phase::Merge, err))?;
                log::debug!("intermediate chunk {} sealed ({} records)", chunk.id(), chunk.records());
                merged.push(chunk);
            }

            chunks = merged;
        }

        return Ok((chunks, waves));
    }

    /// Merges the chunks passing every record to `emit`. Returns the number of records merged.
    fn drain<F, E>(&self, chunks: Vec<ChunkFile>, compare: F, mut emit: E) -> Result<u64, SortError>
    where
        F: Fn(&Record, &Record) -> Ordering + Copy,
        E: FnMut(Record) -> Result<(), SortError>,
    {
        let sources = chunks
            .into_iter()
            .map(|chunk| {
                let reader = chunk.open(self.codec.clone(), self.rw_buf_size)?;
                Ok(MergeSource::backed_by(reader, chunk))
            })
            .collect::<Result<Vec<_>, ChunkError>>()
            .map_err(|err| SortError::Chunk(Phase::Merge, err))?;

        let mut records = 0;
        for record in BinaryHeapMerger::new(sources, compare) {
            if self.cancel.is_cancelled() {
                log::warn!("merge cancelled after {} records", records);
                return Err(SortError::Cancelled(Phase::Merge));
            }

            let record = record.map_err(|err| SortError::Chunk(Phase::Merge, err))?;
            emit(record)?;
            records += 1;
        }

        return Ok(records);
    }
}

#[cfg(test)]
mod test {
    use std::error::Error;
    use std::fs;
    use std::io::{self, ErrorKind};

    use rand::Rng;
    use rstest::*;

    use super::{BinaryHeapMerger, MergeCoordinator, MergeSource, MergeStats};
    use crate::cancel::CancelToken;
    use crate::chunk::{ChunkError, ChunkFile, ChunkKind, ChunkWriter, RmpCodec};
    use crate::record::{ascending, Record};
    use crate::sort::{Phase, SortError};

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    fn record(key: i32) -> Record {
        Record::new(f64::from(key), 0, key.to_string())
    }

    fn test_error() -> ChunkError {
        ChunkError::IO(io::Error::new(ErrorKind::Other, "test error"))
    }

    #[rstest]
    #[case(
        vec![],
        vec![],
    )]
    #[case(
        vec![
            vec![],
            vec![]
        ],
        vec![],
    )]
    #[case(
        vec![
            vec![Ok(4), Ok(5), Ok(7)],
            vec![Ok(1), Ok(6)],
            vec![Ok(3)],
            vec![],
        ],
        vec![Ok(1), Ok(3), Ok(4), Ok(5), Ok(6), Ok(7)],
    )]
    #[case(
        vec![
            vec![Err(())]
        ],
        vec![Err(())],
    )]
    #[case(
        vec![
            vec![Ok(3), Err(())],
            vec![Ok(1), Ok(2)],
        ],
        vec![
            Ok(1),
            Ok(2),
            Err(()),
        ],
    )]
    fn test_merger(#[case] sources: Vec<Vec<Result<i32, ()>>>, #[case] expected_result: Vec<Result<i32, ()>>) {
        let sources = sources.into_iter().map(|source| {
            MergeSource::new(
                source
                    .into_iter()
                    .map(|item| item.map(record).map_err(|_| test_error()))
                    .collect::<Vec<_>>()
                    .into_iter(),
            )
        });

        let merger = BinaryHeapMerger::new(sources, ascending);
        let actual_result: Vec<Result<Record, ChunkError>> = merger.collect();

        assert!(
            compare_vectors_of_result(&actual_result, &expected_result),
            "actual={:?}, expected={:?}",
            actual_result,
            expected_result
        );
    }

    fn compare_vectors_of_result(actual: &Vec<Result<Record, ChunkError>>, expected: &Vec<Result<i32, ()>>) -> bool {
        actual.len() == expected.len()
            && actual
                .into_iter()
                .zip(expected)
                .all(|(actual_result, expected_result)| match (actual_result, expected_result) {
                    (Ok(actual_result), Ok(expected_result)) => actual_result.key() == f64::from(*expected_result),
                    (Err(actual_err), Err(_)) => actual_err.source().unwrap().to_string() == "test error",
                    _ => false,
                })
    }

    #[test]
    fn test_merger_ties_prefer_lower_source() {
        let sources = vec![
            vec![Record::new(1.0, 0, "a".to_string())],
            vec![Record::new(1.0, 0, "b".to_string())],
            vec![Record::new(1.0, 0, "c".to_string())],
        ];
        let compare_keys = |a: &Record, b: &Record| a.key().total_cmp(&b.key());

        let merger = BinaryHeapMerger::new(
            sources
                .into_iter()
                .map(|source| MergeSource::new(source.into_iter().map(Ok::<Record, ChunkError>))),
            compare_keys,
        );
        let payloads: Vec<String> = merger.map(|record| record.unwrap().into_payload()).collect();

        assert_eq!(payloads, vec!["a", "b", "c"]);
    }

    fn sorted_chunk(tmp_dir: &tempfile::TempDir, id: usize, keys: &[i32]) -> ChunkFile {
        let mut writer = ChunkWriter::create(tmp_dir.path(), ChunkKind::Sorted, id, RmpCodec, None).unwrap();
        for key in keys {
            writer.write(&record(*key)).unwrap();
        }

        return writer.seal().unwrap();
    }

    #[rstest]
    fn test_exhausted_chunk_is_removed(tmp_dir: tempfile::TempDir) {
        let first = sorted_chunk(&tmp_dir, 0, &[1, 2]);
        let second = sorted_chunk(&tmp_dir, 1, &[3, 4, 5]);
        let (first_path, second_path) = (first.path().to_path_buf(), second.path().to_path_buf());

        let sources = vec![first, second].into_iter().map(|chunk| {
            let reader = chunk.open(RmpCodec, None).unwrap();
            MergeSource::backed_by(reader, chunk)
        });
        let mut merger = BinaryHeapMerger::new(sources, ascending);

        assert_eq!(merger.next().unwrap().unwrap().key(), 1.0);
        assert!(first_path.exists());
        assert_eq!(merger.next().unwrap().unwrap().key(), 2.0);
        assert!(!first_path.exists());
        assert!(second_path.exists());

        assert_eq!(merger.count(), 3);
        assert!(!second_path.exists());
    }

    #[rstest]
    #[case(2, 2)]
    #[case(3, 1)]
    #[case(4, 1)]
    #[case(5, 0)]
    #[case(64, 0)]
    fn test_merge_waves(tmp_dir: tempfile::TempDir, #[case] max_open_chunks: usize, #[case] expected_waves: usize) {
        let mut rng = rand::thread_rng();
        let mut all_keys = Vec::new();
        let chunks: Vec<ChunkFile> = (0..5)
            .map(|id| {
                let mut keys: Vec<i32> = (0..20).map(|_| rng.gen_range(-50..50)).collect();
                keys.sort();
                all_keys.extend(keys.iter().copied());
                sorted_chunk(&tmp_dir, id, &keys)
            })
            .collect();
        all_keys.sort();

        let cancel = CancelToken::new();
        let coordinator = MergeCoordinator {
            dir: tmp_dir.path(),
            codec: RmpCodec,
            rw_buf_size: None,
            max_open_chunks,
            cancel: &cancel,
        };

        let mut output = Vec::new();
        let stats = coordinator.merge(chunks, ascending, &mut output).unwrap();

        let expected: String = all_keys.iter().map(|key| format!("{}\n", key)).collect();
        assert_eq!(String::from_utf8(output).unwrap(), expected);
        assert_eq!(stats.records, 100);
        assert_eq!(stats.waves, expected_waves);
        assert_eq!(fs::read_dir(tmp_dir.path()).unwrap().count(), 0);
    }

    #[rstest]
    fn test_merge_many_singletons(tmp_dir: tempfile::TempDir) {
        let chunks: Vec<ChunkFile> = (0..10).rev().enumerate().map(|(id, key)| sorted_chunk(&tmp_dir, id, &[key])).collect();

        let cancel = CancelToken::new();
        let coordinator = MergeCoordinator {
            dir: tmp_dir.path(),
            codec: RmpCodec,
            rw_buf_size: None,
            max_open_chunks: 2,
            cancel: &cancel,
        };

        let mut output = Vec::new();
        let stats = coordinator.merge(chunks, ascending, &mut output).unwrap();

        assert_eq!(String::from_utf8(output).unwrap(), "0\n1\n2\n3\n4\n5\n6\n7\n8\n9\n");
        assert_eq!(stats, MergeStats { waves: 3, records: 10 });
    }

    #[rstest]
    fn test_merge_cancelled(tmp_dir: tempfile::TempDir) {
        let chunks = vec![sorted_chunk(&tmp_dir, 0, &[1]), sorted_chunk(&tmp_dir, 1, &[2])];
        let cancel = CancelToken::new();
        cancel.cancel();
        let coordinator = MergeCoordinator {
            dir: tmp_dir.path(),
            codec: RmpCodec,
            rw_buf_size: None,
            max_open_chunks: 4,
            cancel: &cancel,
        };

        let mut output = Vec::new();
        let result = coordinator.merge(chunks, ascending, &mut output);

        assert!(matches!(result, Err(SortError::Cancelled(Phase::Merge))));
        assert!(output.is_empty());
    }

    #[rstest]
    fn test_merge_corrupt_chunk(tmp_dir: tempfile::TempDir) {
        let chunks = vec![sorted_chunk(&tmp_dir, 0, &[1, 2]), sorted_chunk(&tmp_dir, 1, &[3])];
        fs::write(chunks[1].path(), [0xc1u8]).unwrap();

        let cancel = CancelToken::new();
        let coordinator = MergeCoordinator {
            dir: tmp_dir.path(),
            codec: RmpCodec,
            rw_buf_size: None,
            max_open_chunks: 4,
            cancel: &cancel,
        };

        let result = coordinator.merge(chunks, ascending, &mut Vec::<u8>::new());

        assert!(matches!(
            result,
            Err(SortError::Chunk(Phase::Merge, ChunkError::DeserializationError(_)))
        ));
    }
}
