use std::fs;
use std::io;
use std::net::IpAddr;
use std::process;
use std::thread;
use std::time::Duration;

use clap::ArgEnum;
use env_logger;
use log;

use dist_sort::coordinator::{self, CoordinatorBuilder};
use dist_sort::{Leader, NetworkConfig, Worker, WorkerExit};

fn main() {
    let arg_parser = build_arg_parser();

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let mut network = NetworkConfig::new();
    if arg_parser.is_present("broadcast") {
        let broadcast: IpAddr = arg_parser.value_of_t_or_exit("broadcast");
        network = network.with_broadcast_addr(broadcast);
    }

    match arg_parser.subcommand() {
        Some(("coordinator", args)) => {
            let input = args.value_of("input").expect("value is required");
            let output = args.value_of("output").expect("value has default");
            run_coordinator(network, input, output);
        }
        Some(("worker", _)) => run_worker(network),
        Some(("leader", _)) => run_leader(network),
        _ => unreachable!("subcommand is required"),
    }
}

/// Runs the coordinator together with a leader and a worker on this machine.
fn run_coordinator(network: NetworkConfig, input: &str, output: &str) {
    let input_stream = match fs::File::open(input) {
        Ok(file) => io::BufReader::new(file),
        Err(err) => {
            log::error!("input file opening error: {}", err);
            process::exit(1);
        }
    };

    let sequence = match coordinator::read_sequence(input_stream) {
        Ok(sequence) => sequence,
        Err(err) => {
            log::error!("input file reading error: {}", err);
            process::exit(1);
        }
    };

    if let Err(err) = dist_sort::spawn_leader(network.clone(), Duration::ZERO) {
        log::error!("leader thread starting error: {}", err);
        process::exit(1);
    }

    let worker = {
        let network = network.clone();
        thread::Builder::new().name("worker".into()).spawn(move || Worker::new(network).run())
    };
    let worker = match worker {
        Ok(worker) => worker,
        Err(err) => {
            log::error!("worker thread starting error: {}", err);
            process::exit(1);
        }
    };

    let coordinator = CoordinatorBuilder::new()
        .with_network(network)
        .with_output(output)
        .build(sequence);

    if let Err(err) = coordinator.run() {
        log::error!("data sorting error: {}", err);
        process::exit(1);
    }

    if worker.join().is_err() {
        log::error!("worker thread panicked");
        process::exit(1);
    }
}

fn run_worker(network: NetworkConfig) {
    let report = Worker::new(network).run();

    log::info!("tasks completed: {}, promotions: {}", report.completed, report.promotions);
    if report.exit == WorkerExit::NoLeader {
        log::error!("no leader found");
        process::exit(1);
    }
}

fn run_leader(network: NetworkConfig) {
    match Leader::bind(network) {
        Ok(leader) => leader.run(),
        Err(err) => {
            log::error!("leader starting error: {}", err);
            process::exit(1);
        }
    }
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

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("dist-sort")
        .about("distributed external merge sort")
        .subcommand_required(true)
        .arg_required_else_help(true)
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
            clap::Arg::new("broadcast")
                .short('b')
                .long("broadcast")
                .help("address leader discovery requests are sent to")
                .takes_value(true)
                .validator(|v| match v.parse::<IpAddr>() {
                    Ok(_) => Ok(()),
                    Err(err) => Err(format!("Broadcast address format incorrect: {}", err)),
                }),
        )
        .subcommand(
            clap::App::new("coordinator")
                .about("sorts a file with the help of the cluster, running a leader and a worker locally")
                .arg(
                    clap::Arg::new("input")
                        .short('i')
                        .long("input")
                        .help("file to be sorted, one integer per line")
                        .required(true)
                        .takes_value(true),
                )
                .arg(
                    clap::Arg::new("output")
                        .short('o')
                        .long("output")
                        .help("result file")
                        .takes_value(true)
                        .default_value(coordinator::DEFAULT_OUTPUT),
                ),
        )
        .subcommand(clap::App::new("worker").about("merges runs for the cluster leader"))
        .subcommand(clap::App::new("leader").about("brokers work between the coordinator and the workers"))
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
