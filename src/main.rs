use clap::Parser;
use log::{error, info};
use simple_dispatch::config::{CliArgs, Config, Transport};
use simple_dispatch::session::{run_session, SessionOutcome};
use simple_dispatch::{Communicator, DispatchError, LocalWorld, World};
use std::process::ExitCode;

const EXIT_NOT_ENOUGH_PROCESSES: u8 = 1;
const EXIT_FAILURE: u8 = 2;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match Config::try_from(CliArgs::parse()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    match config.transport {
        Transport::Shm => run_processes(&config),
        Transport::Threads => run_threads(&config),
    }
}

fn print_outcome(outcome: &SessionOutcome) {
    if let SessionOutcome::Coordinator(report) = outcome {
        println!("{report}");
    }
}

fn run_processes(config: &Config) -> ExitCode {
    let world = match World::init(config.procs, config.slot_bytes) {
        Ok(world) => world,
        Err(e) => {
            error!("Failed to form process group: {e}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };
    let rank = world.rank();
    info!("Process {} of {} started (PID: {})", rank, world.size(), std::process::id());

    match run_session(&world, config.tickets, config.seed) {
        Ok(outcome) => {
            print_outcome(&outcome);
            match world.finalize() {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!("Rank {rank} failed to shut down cleanly: {e}");
                    ExitCode::from(EXIT_FAILURE)
                }
            }
        }
        Err(e @ DispatchError::NotEnoughProcesses { .. }) => {
            eprintln!("{e}");
            if let Err(e) = world.finalize() {
                error!("Rank {rank} failed to shut down cleanly: {e}");
            }
            ExitCode::from(EXIT_NOT_ENOUGH_PROCESSES)
        }
        Err(e) => {
            error!("Rank {rank} failed: {e}");
            world.abort();
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

fn run_threads(config: &Config) -> ExitCode {
    let results = match LocalWorld::run(config.procs, |world| {
        run_session(world, config.tickets, config.seed)
    }) {
        Ok(results) => results,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    let mut code = ExitCode::SUCCESS;
    for (rank, result) in results.iter().enumerate() {
        match result {
            Ok(outcome) => print_outcome(outcome),
            Err(e @ DispatchError::NotEnoughProcesses { .. }) => {
                eprintln!("{e}");
                code = ExitCode::from(EXIT_NOT_ENOUGH_PROCESSES);
            }
            Err(e) => {
                error!("Rank {rank} failed: {e}");
                code = ExitCode::from(EXIT_FAILURE);
            }
        }
    }
    code
}
