//! Command line and environment configuration of the `simple-dispatch` binary.

use crate::comm::shm::{DEFAULT_SLOT_BYTES, MIN_SLOT_BYTES};
use crate::error::DispatchError;
use clap::{Parser, ValueEnum};
use log::warn;

/// Ticket count used when none (or a non-positive one) is given.
pub const DEFAULT_TICKETS: u64 = 6000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Transport {
    /// One process per rank, exchanging messages through shared memory.
    Shm,
    /// One thread per rank inside this process.
    Threads,
}

/// Arguments of the `simple-dispatch` binary.
///
/// Spawned ranks are started with the same arguments as the launching process,
/// so every rank sees the same configuration.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "simple-dispatch",
    version,
    about = "Hand out work tickets from one coordinator to whichever worker is free"
)]
pub struct CliArgs {
    /// Total number of tickets to dispatch. Missing or non-positive values
    /// fall back to 6000.
    #[arg(allow_negative_numbers = true)]
    pub tickets: Option<i64>,

    /// Total number of ranks, coordinator included.
    ///
    /// Environment variable: `DISPATCH_PROCS`
    #[arg(short = 'n', long, env = "DISPATCH_PROCS", default_value_t = 4)]
    pub procs: i32,

    /// How ranks are run and connected.
    ///
    /// Environment variable: `DISPATCH_TRANSPORT`
    #[arg(long, value_enum, env = "DISPATCH_TRANSPORT", default_value_t = Transport::Shm)]
    pub transport: Transport,

    /// Base seed of the workers' random streams. Worker `r` uses `seed + r`.
    ///
    /// Environment variable: `DISPATCH_SEED`
    #[arg(long, env = "DISPATCH_SEED", default_value_t = 1)]
    pub seed: u64,

    /// Largest serialized message, in bytes, of the shared memory transport.
    ///
    /// Environment variable: `DISPATCH_SLOT_BYTES`
    #[arg(long, env = "DISPATCH_SLOT_BYTES", default_value_t = DEFAULT_SLOT_BYTES)]
    pub slot_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub tickets: u64,
    pub procs: i32,
    pub transport: Transport,
    pub seed: u64,
    pub slot_bytes: usize,
}

impl TryFrom<CliArgs> for Config {
    type Error = DispatchError;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.procs <= 0 {
            return Err(DispatchError::InitError(format!(
                "process count must be positive, got {}",
                args.procs
            )));
        }
        if args.slot_bytes < MIN_SLOT_BYTES {
            return Err(DispatchError::InitError(format!(
                "slot size must be at least {MIN_SLOT_BYTES} bytes, got {}",
                args.slot_bytes
            )));
        }

        let tickets = match args.tickets {
            Some(n) if n > 0 => n as u64,
            Some(n) => {
                warn!("Ignoring non-positive ticket count {n}, using {DEFAULT_TICKETS}");
                DEFAULT_TICKETS
            }
            None => DEFAULT_TICKETS,
        };

        Ok(Self {
            tickets,
            procs: args.procs,
            transport: args.transport,
            seed: args.seed,
            slot_bytes: args.slot_bytes,
        })
    }
}
