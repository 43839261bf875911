//! Chunk size budget.

use std::fmt;
use std::fmt::Display;

/// Bounds the amount of data a single spool chunk accumulates before it is sealed.
///
/// The budget is checked after every record written to a chunk:
/// * [`BatchSize::Records`] seals a chunk as soon as it holds the given number of records,
///   so chunks never exceed the limit.
/// * [`BatchSize::Bytes`] seals a chunk once its encoded size exceeds the given number of bytes.
///   The record that crosses the limit stays in the chunk, so a chunk can be larger than the limit
///   by at most one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchSize {
    /// Limit by number of records.
    Records(u64),
    /// Limit by encoded chunk size in bytes.
    Bytes(u64),
}

impl BatchSize {
    /// Checks if a chunk holding `records` records encoded into `bytes` bytes has to be sealed.
    pub fn is_exceeded(&self, records: u64, bytes: u64) -> bool {
        match *self {
            BatchSize::Records(limit) => records >= limit,
            BatchSize::Bytes(limit) => bytes > limit,
        }
    }

    pub fn limit(&self) -> u64 {
        match *self {
            BatchSize::Records(limit) | BatchSize::Bytes(limit) => limit,
        }
    }
}

impl Default for BatchSize {
    fn default() -> Self {
        BatchSize::Bytes(64 * 1024 * 1024)
    }
}

impl Display for BatchSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchSize::Records(limit) => write!(f, "{} records", limit),
            BatchSize::Bytes(limit) => write!(f, "{} bytes", limit),
        }
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::BatchSize;

    #[rstest]
    #[case(BatchSize::Records(2), 1, 1000, false)]
    #[case(BatchSize::Records(2), 2, 10, true)]
    #[case(BatchSize::Records(1), 1, 0, true)]
    #[case(BatchSize::Bytes(100), 50, 100, false)]
    #[case(BatchSize::Bytes(100), 1, 101, true)]
    fn test_batch_size(#[case] batch_size: BatchSize, #[case] records: u64, #[case] bytes: u64, #[case] exceeded: bool) {
        assert_eq!(batch_size.is_exceeded(records, bytes), exceeded);
    }
}
