use std::io::{self, prelude::*};
use std::path;

use env_logger;
use log;

use ext_keysort::chunk::CodecError;
use ext_keysort::{BatchSize, DecoderConfig, ExternalSorter, ExternalSorterBuilder, Record, RecordCodec, RejectWriter};

/// Fixed layout codec: little-endian key, sequence number and payload length followed by the payload bytes.
#[derive(Clone, Copy, Default)]
struct RawCodec;

impl RecordCodec for RawCodec {
    fn encode<W: Write>(&self, writer: &mut W, record: &Record) -> Result<(), CodecError> {
        writer.write_all(&record.key().to_le_bytes())?;
        writer.write_all(&record.seq().to_le_bytes())?;
        writer.write_all(&(record.payload().len() as u64).to_le_bytes())?;
        writer.write_all(record.payload().as_bytes())?;

        return Ok(());
    }

    fn decode<R: Read>(&self, reader: &mut R) -> Result<Record, CodecError> {
        let mut buf: [u8; 8] = [0; 8];

        reader.read_exact(&mut buf)?;
        let key = f64::from_le_bytes(buf);
        reader.read_exact(&mut buf)?;
        let seq = u64::from_le_bytes(buf);
        reader.read_exact(&mut buf)?;
        let mut payload = vec![0; u64::from_le_bytes(buf) as usize];
        reader.read_exact(&mut payload)?;

        return Ok(Record::new(key, seq, String::from_utf8(payload)?));
    }
}

fn main() {
    env_logger::Builder::new().filter_level(log::LevelFilter::Debug).init();

    let input = "b\t2.5\na\t-1\nbroken\nc\t2.5\n";
    let mut rejects = RejectWriter::new(io::stderr());
    let mut output = io::stdout();

    let sorter: ExternalSorter<RawCodec> = ExternalSorterBuilder::new()
        .with_codec(RawCodec)
        .with_tmp_dir(path::Path::new("./"))
        .with_batch_size(BatchSize::Records(2))
        .with_decoder(DecoderConfig::new('\t', 2, 1))
        .build()
        .unwrap();

    let summary = sorter.sort(io::Cursor::new(input), &mut rejects, &mut output).unwrap();
    rejects.finish().unwrap();

    log::info!("{}", summary);
}
