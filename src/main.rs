use std::cmp::Ordering;
use std::env;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path;
use std::process;

use bytesize::ByteSize;
use clap::ArgEnum;
use env_logger;
use log;

use ext_keysort::input::open_input;
use ext_keysort::{
    ascending, descending, BatchSize, CancelToken, DecoderConfig, ExternalSorter, ExternalSorterBuilder, Record,
    RejectWriter,
};

fn main() {
    let arg_parser = build_arg_parser(env::args_os()).unwrap_or_else(|err| err.exit());

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let input = arg_parser.value_of("input").expect("value is required");
    let batch_size: u64 = arg_parser.value_of_t_or_exit("batch_size");
    let batch_unit: BatchUnit = arg_parser.value_of_t_or_exit("batch_unit");
    let output = arg_parser.value_of("output").expect("value has default");
    let order: Order = arg_parser.value_of_t_or_exit("sort");
    let delimiter: char = arg_parser.value_of_t_or_exit("delimiter");
    let fields: usize = arg_parser.value_of_t_or_exit("fields");
    let key_field: usize = arg_parser.value_of_t_or_exit("key_field");
    let max_open: usize = arg_parser.value_of_t_or_exit("max_open");
    let tmp_dir: Option<&str> = arg_parser.value_of("tmp_dir");
    let threads: Option<usize> = arg_parser
        .is_present("threads")
        .then(|| arg_parser.value_of_t_or_exit("threads"));
    let memory_limit: Option<ByteSize> = arg_parser
        .is_present("memory_limit")
        .then(|| arg_parser.value_of_t_or_exit("memory_limit"));
    let rejects_path = match arg_parser.value_of("rejects") {
        Some(rejects) => path::PathBuf::from(rejects),
        None => path::PathBuf::from(format!("{}.rejected", output)),
    };

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        log::warn!("interrupt received, cancelling sorting");
        handler_token.cancel();
    }) {
        log::warn!("interrupt handler installation error: {}", err);
    }

    let input_stream = match open_input(path::Path::new(input), None) {
        Ok(input_stream) => input_stream,
        Err(err) => {
            log::error!("input file opening error: {}", err);
            process::exit(1);
        }
    };

    let mut rejects = match fs::File::create(&rejects_path) {
        Ok(file) => RejectWriter::new(io::BufWriter::new(file)),
        Err(err) => {
            log::error!("rejected lines file creation error: {}", err);
            process::exit(1);
        }
    };

    let mut sorter_builder = ExternalSorterBuilder::new()
        .with_batch_size(match batch_unit {
            BatchUnit::Bytes => BatchSize::Bytes(batch_size),
            BatchUnit::Records => BatchSize::Records(batch_size),
        })
        .with_decoder(DecoderConfig::new(delimiter, fields, key_field))
        .with_max_open_chunks(max_open)
        .with_cancel_token(cancel);

    if let Some(threads) = threads {
        sorter_builder = sorter_builder.with_threads_number(threads);
    }

    if let Some(tmp_dir) = tmp_dir {
        sorter_builder = sorter_builder.with_tmp_dir(path::Path::new(tmp_dir));
    }

    if let Some(memory_limit) = memory_limit {
        sorter_builder = sorter_builder.with_memory_limit(memory_limit.as_u64());
    }

    let sorter: ExternalSorter = match sorter_builder.build() {
        Ok(sorter) => sorter,
        Err(err) => {
            log::error!("sorter initialization error: {}", err);
            process::exit(1);
        }
    };

    let compare: fn(&Record, &Record) -> Ordering = match order {
        Order::Asc => ascending,
        Order::Desc => descending,
    };

    let summary = match sorter.sort_file(input_stream, path::Path::new(output), &mut rejects, compare) {
        Ok(summary) => summary,
        Err(err) => {
            match err.phase() {
                Some(phase) => log::error!("{} phase failed: {}", phase, err),
                None => log::error!("data sorting error: {}", err),
            }
            process::exit(1);
        }
    };

    if let Err(err) = rejects.finish() {
        log::error!("rejected lines flushing error: {}", err);
        process::exit(1);
    }

    log::info!(
        "{} lines sorted into {}, {} lines rejected into {}",
        summary.accepted,
        output,
        summary.rejected,
        rejects_path.display()
    );
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Self::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <LogLevel as clap::ArgEnum>::from_str(s, false)
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum Order {
    Asc,
    Desc,
}

impl Order {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Order::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for Order {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Order as clap::ArgEnum>::from_str(s, false)
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum BatchUnit {
    Bytes,
    Records,
}

impl BatchUnit {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        BatchUnit::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for BatchUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <BatchUnit as clap::ArgEnum>::from_str(s, false)
    }
}

fn validate_number(value: &str, min: u64, name: &str) -> Result<(), String> {
    match value.parse::<u64>() {
        Ok(number) if number >= min => Ok(()),
        Ok(_) => Err(format!("{} must be at least {}", name, min)),
        Err(err) => Err(format!("{} format incorrect: {}", name, err)),
    }
}

fn build_arg_parser<I, T>(args: I) -> Result<clap::ArgMatches, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    clap::App::new("ext-keysort")
        .about("sorts delimited text lines by a numeric key field using external sorting")
        .arg(
            clap::Arg::new("input")
                .help("file to be sorted, plain text or gzip compressed")
                .required(true)
                .index(1)
                .validator(|v| match path::Path::new(v).exists() {
                    true => Ok(()),
                    false => Err(format!("input file {} does not exist", v)),
                }),
        )
        .arg(
            clap::Arg::new("batch_size")
                .help("spool chunk size limit, see --batch-unit")
                .required(true)
                .index(2)
                .validator(|v| validate_number(v, 1, "batch size")),
        )
        .arg(
            clap::Arg::new("batch_unit")
                .short('u')
                .long("batch-unit")
                .help("unit of the batch size")
                .takes_value(true)
                .default_value("bytes")
                .possible_values(BatchUnit::possible_values()),
        )
        .arg(
            clap::Arg::new("output")
                .short('o')
                .long("output")
                .help("result file")
                .takes_value(true)
                .default_value("sorted.txt"),
        )
        .arg(
            clap::Arg::new("rejects")
                .short('r')
                .long("rejects")
                .help("file rejected lines are saved to [default: <output>.rejected]")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("delimiter")
                .long("delimiter")
                .help("field delimiter")
                .takes_value(true)
                .default_value(",")
                .validator(|v| match v.chars().count() {
                    1 => Ok(()),
                    _ => Err(format!("delimiter must be a single character, got {:?}", v)),
                }),
        )
        .arg(
            clap::Arg::new("fields")
                .short('f')
                .long("fields")
                .help("number of fields in a valid line")
                .takes_value(true)
                .default_value("17")
                .validator(|v| validate_number(v, 1, "fields number")),
        )
        .arg(
            clap::Arg::new("key_field")
                .short('k')
                .long("key-field")
                .help("zero-based index of the numeric key field")
                .takes_value(true)
                .default_value("11")
                .validator(|v| validate_number(v, 0, "key field index")),
        )
        .arg(
            clap::Arg::new("max_open")
                .short('m')
                .long("max-open")
                .help("maximum number of chunks merged at once")
                .takes_value(true)
                .default_value("64")
                .validator(|v| validate_number(v, 2, "max open chunks")),
        )
        .arg(
            clap::Arg::new("sort")
                .short('s')
                .long("sort")
                .help("sorting order")
                .takes_value(true)
                .default_value("asc")
                .possible_values(Order::possible_values()),
        )
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .takes_value(true)
                .default_value("info")
                .possible_values(LogLevel::possible_values()),
        )
        .arg(
            clap::Arg::new("threads")
                .short('t')
                .long("threads")
                .help("number of threads to use for parallel chunk sorting")
                .takes_value(true)
                .validator(|v| validate_number(v, 1, "threads number")),
        )
        .arg(
            clap::Arg::new("memory_limit")
                .long("memory-limit")
                .help("memory available for parallel chunk sorting, e.g. 2GiB")
                .takes_value(true)
                .validator(|v| match v.parse::<ByteSize>() {
                    Ok(_) => Ok(()),
                    Err(err) => Err(format!("memory limit format incorrect: {}", err)),
                }),
        )
        .arg(
            clap::Arg::new("tmp_dir")
                .short('d')
                .long("tmp-dir")
                .help("directory to be used to store temporary data")
                .takes_value(true),
        )
        .try_get_matches_from(args)
}

fn init_logger(log_level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(match log_level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .init();
}
