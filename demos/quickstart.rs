use std::path;

use env_logger;
use log;

use ext_keysort::input::open_input;
use ext_keysort::{ascending, BatchSize, ExternalSorter, ExternalSorterBuilder, RejectedLine};

fn main() {
    env_logger::Builder::new().filter_level(log::LevelFilter::Debug).init();

    let input_reader = open_input(path::Path::new("trips.csv.gz"), None).unwrap();

    let sorter: ExternalSorter = ExternalSorterBuilder::new()
        .with_tmp_dir(path::Path::new("./"))
        .with_batch_size(BatchSize::Bytes(50_000_000))
        .build()
        .unwrap();

    let mut rejects: Vec<RejectedLine> = Vec::new();
    let summary = sorter
        .sort_file(input_reader, path::Path::new("sorted.csv"), &mut rejects, ascending)
        .unwrap();

    log::info!("{}", summary);
    for rejected in rejects.iter().take(10) {
        log::warn!(
            "line {} rejected: {} ({})",
            rejected.line_number,
            rejected.reason,
            String::from_utf8_lossy(&rejected.line)
        );
    }
}
