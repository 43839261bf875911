//! Input stream helpers.

use std::fs;
use std::io;
use std::io::prelude::*;
use std::path::Path;

use bzip2::read::MultiBzDecoder;
use flate2::read::MultiGzDecoder;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const BZIP2_MAGIC: [u8; 3] = *b"BZh";

/// Opens an input file for buffered reading.
/// Gzip and bzip2 compressed files are detected by their magic bytes and decompressed on the fly,
/// any other file is read as is.
pub fn open_input(path: &Path, buf_size: Option<usize>) -> io::Result<Box<dyn BufRead + Send>> {
    let file = fs::File::open(path)?;
    let mut reader = match buf_size {
        Some(buf_size) => io::BufReader::with_capacity(buf_size, file),
        None => io::BufReader::new(file),
    };

    let head = reader.fill_buf()?;
    let (is_gzip, is_bzip2) = (head.starts_with(&GZIP_MAGIC), head.starts_with(&BZIP2_MAGIC));
    if is_gzip {
        log::info!("reading gzip compressed input {}", path.display());
        return Ok(Box::new(io::BufReader::new(MultiGzDecoder::new(reader))));
    }
    if is_bzip2 {
        log::info!("reading bzip2 compressed input {}", path.display());
        return Ok(Box::new(io::BufReader::new(MultiBzDecoder::new(reader))));
    }

    log::info!("reading plain text input {}", path.display());
    return Ok(Box::new(reader));
}

/// Iterator over raw lines of a buffered reader.
/// Lines are yielded without their `\n` or `\r\n` terminator and are not required to be valid UTF-8.
/// A trailing `\r` of an unterminated last line is dropped as well.
pub struct LineReader<R: BufRead> {
    reader: R,
}

impl<R: BufRead> LineReader<R> {
    pub fn new(reader: R) -> Self {
        LineReader { reader }
    }
}

impl<R: BufRead> Iterator for LineReader<R> {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut line = Vec::new();
        match self.reader.read_until(b'\n', &mut line) {
            Ok(0) => None,
            Ok(_) => {
                if line.last() == Some(&b'\n') {
                    line.pop();
                }
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                Some(Ok(line))
            }
            Err(err) => Some(Err(err)),
        }
    }
}
