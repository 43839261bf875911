//! Sort record and record orderings.

use std::cmp::Ordering;

/// A decoded input line.
///
/// `payload` holds the original line verbatim, `key` is the numeric field the line is sorted by and `seq` is the
/// line number the record was read from. Records are never mutated after decoding.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Record {
    key: f64,
    seq: u64,
    payload: String,
}

impl Record {
    pub fn new(key: f64, seq: u64, payload: String) -> Self {
        Record { key, seq, payload }
    }

    /// Sort key.
    pub fn key(&self) -> f64 {
        self.key
    }

    /// Input line number, used to order records with equal keys.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Original input line.
    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn into_payload(self) -> String {
        self.payload
    }
}

/// Orders records by ascending key. Equal keys keep input order.
pub fn ascending(a: &Record, b: &Record) -> Ordering {
    a.key.total_cmp(&b.key).then(a.seq.cmp(&b.seq))
}

/// Orders records by descending key. Equal keys keep input order.
pub fn descending(a: &Record, b: &Record) -> Ordering {
    b.key.total_cmp(&a.key).then(a.seq.cmp(&b.seq))
}
