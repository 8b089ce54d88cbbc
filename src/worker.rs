//! Ranks 1..size: take a ticket, do the work, report, repeat until told to stop.

use crate::comm::Communicator;
use crate::error::Result;
use crate::protocol::{
    result_tag, Assignment, Completion, Ticket, WorkerSummary, COORDINATOR, WORK_TAG,
};
use log::{debug, info};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Lower bound of the particles generated for one ticket.
pub const MIN_PARTICLES: u32 = 2500;
/// Upper bound (inclusive) of the particles generated for one ticket.
pub const MAX_PARTICLES: u32 = 5000;

/// The simulated unit of work: generate a random number of random 3-D
/// positions and report how many were generated.
///
/// The amount of work depends only on the worker's own random stream, never
/// on the ticket.
pub struct Workload {
    rng: SmallRng,
}

impl Workload {
    /// Stream for the worker at `rank`, derived from a run-wide `seed`.
    pub fn new(seed: u64, rank: i32) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed.wrapping_add(rank as u64)),
        }
    }

    pub fn run(&mut self, ticket: Ticket) -> Completion {
        let particles = self.rng.random_range(MIN_PARTICLES..=MAX_PARTICLES);

        let mut centroid = [0.0f32; 3];
        for _ in 0..particles {
            let x: f32 = self.rng.random();
            let y: f32 = self.rng.random();
            let z: f32 = self.rng.random();
            centroid[0] += x;
            centroid[1] += y;
            centroid[2] += z;
        }
        std::hint::black_box(centroid);

        debug!("Ticket {} generated {} particles", ticket, particles);
        particles
    }
}

enum WorkerState {
    Idle,
    Working(Ticket),
    Reporting(Completion),
    Terminated,
}

/// What one worker did over a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerRun {
    pub summary: WorkerSummary,
    /// Tickets in the order they were received.
    pub tickets: Vec<Ticket>,
}

/// Block until the coordinator sends the next assignment.
pub fn receive_assignment<C: Communicator>(comm: &C) -> Result<Assignment> {
    let raw: i64 = comm.recv(COORDINATOR, WORK_TAG)?;
    Assignment::decode(raw)
}

/// Serve assignments from the coordinator until the termination signal.
///
/// A malformed assignment ends the loop with
/// [`DispatchError::ProtocolViolation`](crate::DispatchError::ProtocolViolation).
pub fn run_worker<C: Communicator>(comm: &C, workload: &mut Workload) -> Result<WorkerRun> {
    let rank = comm.rank();
    let mut run = WorkerRun {
        summary: WorkerSummary {
            rank,
            ..Default::default()
        },
        tickets: Vec::new(),
    };

    let mut state = WorkerState::Idle;
    loop {
        state = match state {
            WorkerState::Idle => match receive_assignment(comm)? {
                Assignment::Work(ticket) => WorkerState::Working(ticket),
                Assignment::Terminate => WorkerState::Terminated,
            },
            WorkerState::Working(ticket) => {
                let particles = workload.run(ticket);
                run.tickets.push(ticket);
                run.summary.tickets_completed += 1;
                run.summary.particles += u64::from(particles);
                WorkerState::Reporting(particles)
            }
            WorkerState::Reporting(particles) => {
                comm.send(&particles, COORDINATOR, result_tag(rank))?;
                WorkerState::Idle
            }
            WorkerState::Terminated => break,
        };
    }

    info!(
        "Rank {} generated {} volumes with a total of {} particles",
        rank, run.summary.tickets_completed, run.summary.particles
    );
    Ok(run)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn particles_stay_in_range() {
        let mut workload = Workload::new(7, 3);
        for id in 1..=200 {
            let particles = workload.run(Ticket::new(id).unwrap());
            assert!((MIN_PARTICLES..=MAX_PARTICLES).contains(&particles));
        }
    }

    #[test]
    fn streams_depend_on_seed_and_rank_only() {
        let ticket = Ticket::new(1).unwrap();
        let other = Ticket::new(99).unwrap();

        let a: Vec<_> = {
            let mut w = Workload::new(1, 2);
            (0..8).map(|_| w.run(ticket)).collect()
        };
        let b: Vec<_> = {
            let mut w = Workload::new(1, 2);
            (0..8).map(|_| w.run(other)).collect()
        };
        let c: Vec<_> = {
            let mut w = Workload::new(1, 3);
            (0..8).map(|_| w.run(ticket)).collect()
        };

        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
