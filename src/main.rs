use std::path::{Path, PathBuf};
use std::process;
use std::time::Instant;

use bytesize::ByteSize;
use clap::ArgEnum;
use env_logger;
use log;

use huge_sort::collate::icu::IcuCollationBuilder;
use huge_sort::{check_sorted, CollatorPool, SorterBuilder, SplitterBuilder};

fn main() {
    let arg_parser = build_arg_parser();

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let input = Path::new(arg_parser.value_of("input").expect("value is required"));
    let threads: Option<usize> = arg_parser
        .is_present("threads")
        .then(|| arg_parser.value_of_t_or_exit("threads"));

    let collation = arg_parser.value_of("locale").map(|locale| match IcuCollationBuilder::new(locale) {
        Ok(collation) => collation,
        Err(err) => {
            log::error!("collator initialization error: {}", err);
            process::exit(1);
        }
    });

    if arg_parser.is_present("check") {
        check(input, collation);
        return;
    }

    let output = match arg_parser.value_of("output") {
        Some(output) => PathBuf::from(output),
        None => default_output(input),
    };
    let max_size = parse_size(arg_parser.value_of("max_size").expect("value has default"));
    let chunk_size = arg_parser.value_of("chunk_size").map(parse_size);
    let seed: Option<u64> = arg_parser
        .is_present("seed")
        .then(|| arg_parser.value_of_t_or_exit("seed"));

    let mut splitter_builder = SplitterBuilder::new().with_max_file_size(max_size);
    let mut sorter_builder = SorterBuilder::new().with_max_file_size(max_size);
    if let Some(chunk_size) = chunk_size {
        splitter_builder = splitter_builder.with_chunk_size(chunk_size);
    }
    if let Some(seed) = seed {
        splitter_builder = splitter_builder.with_seed(seed);
    }
    if let Some(tmp_dir) = arg_parser.value_of("tmp_dir") {
        splitter_builder = splitter_builder.with_tmp_dir(Path::new(tmp_dir));
    }
    if let Some(threads) = threads {
        splitter_builder = splitter_builder.with_workers_number(threads);
        sorter_builder = sorter_builder.with_threads_number(threads);
    }
    if let Some(collation) = collation {
        splitter_builder = splitter_builder.with_collation(collation.clone());
        sorter_builder = sorter_builder.with_collation(collation);
    }

    let mut splitter = match splitter_builder.build() {
        Ok(splitter) => splitter,
        Err(err) => {
            log::error!("splitter initialization error: {}", err);
            process::exit(1);
        }
    };
    log::info!("seed: {}", splitter.seed());

    let sorter = match sorter_builder.build() {
        Ok(sorter) => sorter,
        Err(err) => {
            log::error!("sorter initialization error: {}", err);
            process::exit(1);
        }
    };

    let split_started = Instant::now();
    let files = match splitter.split(input) {
        Ok(files) => files,
        Err(err) => {
            log::error!("data splitting error: {}", err);
            process::exit(1);
        }
    };
    log::info!("split done in {:?} ({} chunks)", split_started.elapsed(), files.len());

    let sort_started = Instant::now();
    let sorted = match sorter.sort(&output, &files) {
        Ok(sorted) => sorted,
        Err(err) => {
            log::error!("data sorting error: {}", err);
            process::exit(1);
        }
    };
    log::info!("sort/write done in {:?}", sort_started.elapsed());
    log::info!(
        "total done in {:?}, {} written to {}",
        split_started.elapsed(),
        ByteSize::b(sorted.size),
        sorted.path.display()
    );
}

fn check(input: &Path, collation: Option<IcuCollationBuilder>) {
    let collators = CollatorPool::new(collation);
    match check_sorted(input, &collators, None) {
        Ok(None) => println!("sorted"),
        Ok(Some(position)) => {
            println!("not sorted: line at byte {} is out of order", position);
            process::exit(1);
        }
        Err(err) => {
            log::error!("sorted check error: {}", err);
            process::exit(1);
        }
    }
}

fn default_output(input: &Path) -> PathBuf {
    let mut name = input.file_stem().unwrap_or_default().to_os_string();
    name.push(".sorted");
    if let Some(extension) = input.extension() {
        name.push(".");
        name.push(extension);
    }
    input.with_file_name(name)
}

fn parse_size(value: &str) -> u64 {
    value.parse::<ByteSize>().expect("value is pre-validated").as_u64()
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

fn validate_size(value: &str) -> Result<(), String> {
    match value.parse::<ByteSize>() {
        Ok(size) if size.as_u64() > 0 => Ok(()),
        Ok(_) => Err("size must be positive".to_string()),
        Err(err) => Err(format!("size format incorrect: {}", err)),
    }
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("huge-sort")
        .about("external sorter of indexed line files")
        .arg(
            clap::Arg::new("input")
                .short('i')
                .long("input")
                .help("file to be sorted")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("output")
                .short('o')
                .long("output")
                .help("result file, <input>.sorted.<ext> by default")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("check")
                .long("check")
                .help("check the input file is sorted instead of sorting it"),
        )
        .arg(
            clap::Arg::new("max_size")
                .short('m')
                .long("max-size")
                .help("max file size to be sorted in memory")
                .takes_value(true)
                .default_value("1GiB")
                .validator(validate_size),
        )
        .arg(
            clap::Arg::new("chunk_size")
                .short('c')
                .long("chunk-size")
                .help("expected split chunk size, max size / 100 by default")
                .takes_value(true)
                .validator(validate_size),
        )
        .arg(
            clap::Arg::new("seed")
                .long("seed")
                .help("pivot sampling seed, random by default")
                .takes_value(true)
                .validator(|v| match v.parse::<u64>() {
                    Ok(_) => Ok(()),
                    Err(err) => Err(format!("seed format incorrect: {}", err)),
                }),
        )
        .arg(
            clap::Arg::new("locale")
                .long("locale")
                .help("locale to collate lines with (e.g. en, de-AT), byte order by default")
                .takes_value(true),
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
                .help("number of threads to use for splitting and sorting")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("tmp_dir")
                .short('d')
                .long("tmp-dir")
                .help("directory to be used to store temporary data")
                .takes_value(true),
        )
        .get_matches()
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
