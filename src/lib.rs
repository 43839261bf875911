//! `ext-keysort` sorts delimited text files by a numeric key field using external sorting.
//!
//! External sorting is a class of sorting algorithms that can handle massive amounts of data. External sorting
//! is required when the data being sorted do not fit into the main memory (RAM) of a computer and instead must be
//! resided in slower external memory, usually a hard disk drive. For more information see
//! [External Sorting](https://en.wikipedia.org/wiki/External_sorting).
//!
//! # Overview
//!
//! Sorting runs in three phases separated by hard barriers:
//!
//! * **Split:**
//!   input lines are validated and decoded into records which are spooled into size bounded chunk files.
//!   Lines that can not be decoded are passed to a reject sink and never stop the sorting.
//! * **Sort:**
//!   every spool chunk is loaded, sorted in memory and written back as a sorted chunk. Chunks are sorted
//!   in parallel on a thread pool sized by the number of CPU cores and the configured memory limit.
//! * **Merge:**
//!   sorted chunks are merged using a binary heap. If there are more chunks than allowed to be open at once
//!   they are merged in waves through intermediate chunks first.
//!
//! The output consists of the original input lines. Records with equal keys keep their input order,
//! so sorting the same input always produces the same output.
//!
//! # Example
//!
//! ```no_run
//! use std::fs;
//! use std::io;
//! use std::path;
//!
//! use ext_keysort::{BatchSize, DecoderConfig, ExternalSorter, ExternalSorterBuilder, RejectWriter};
//!
//! fn main() {
//!     let input_reader = io::BufReader::new(fs::File::open("trips.csv").unwrap());
//!     let mut rejects = RejectWriter::new(io::BufWriter::new(fs::File::create("rejected.csv").unwrap()));
//!
//!     let sorter: ExternalSorter = ExternalSorterBuilder::new()
//!         .with_tmp_dir(path::Path::new("./"))
//!         .with_batch_size(BatchSize::Bytes(50_000_000))
//!         .with_decoder(DecoderConfig::new(',', 17, 11))
//!         .build()
//!         .unwrap();
//!
//!     let summary = sorter
//!         .sort_file(input_reader, path::Path::new("sorted.csv"), &mut rejects, ext_keysort::ascending)
//!         .unwrap();
//!     rejects.finish().unwrap();
//!
//!     println!("{}", summary);
//! }
//! ```

pub mod budget;
pub mod cancel;
pub mod chunk;
mod chunk_sort;
pub mod decoder;
pub mod input;
pub mod merger;
pub mod record;
pub mod sort;
mod split;

pub use budget::BatchSize;
pub use cancel::CancelToken;
pub use chunk::{ChunkError, ChunkFile, ChunkKind, ChunkReader, ChunkWriter, RecordCodec, RmpCodec};
pub use decoder::{Decoder, DecoderConfig, RejectSink, RejectWriter, RejectedLine, Rejection};
pub use merger::{BinaryHeapMerger, MergeSource};
pub use record::{ascending, descending, Record};
pub use sort::{ExternalSorter, ExternalSorterBuilder, Phase, SortError, SortSummary};
