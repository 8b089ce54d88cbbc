//! One full dispatch from the point of view of a single rank.
//!
//! Every rank calls [`run_session`] with the same arguments. The rank decides
//! its own role, so the same code runs under both transports.

use crate::comm::Communicator;
use crate::coordinator::{run_coordinator, DispatchReport};
use crate::error::{DispatchError, Result};
use crate::protocol::{WorkerSummary, COORDINATOR};
use crate::worker::{run_worker, WorkerRun, Workload};
use log::debug;

/// What one rank got out of a session.
#[derive(Debug, Clone)]
pub enum SessionOutcome {
    Coordinator(DispatchReport),
    Worker(WorkerRun),
}

/// Run one complete dispatch on every rank of `comm`.
///
/// Rank 0 coordinates `tickets` tickets and the other ranks work them. Worker
/// totals are then gathered at rank 0, and all ranks meet at a barrier before
/// returning. With fewer than two ranks nothing is sent and every rank gets
/// [`DispatchError::NotEnoughProcesses`].
pub fn run_session<C: Communicator>(comm: &C, tickets: u64, seed: u64) -> Result<SessionOutcome> {
    if comm.size() < 2 {
        return Err(DispatchError::NotEnoughProcesses { size: comm.size() });
    }

    let outcome = if comm.rank() == COORDINATOR {
        let dispatcher = run_coordinator(comm, tickets)?;

        // The coordinator's own entry is a placeholder
        let own = WorkerSummary {
            rank: comm.rank(),
            ..Default::default()
        };
        let summaries = comm
            .gather(&own, COORDINATOR)?
            .unwrap_or_default()
            .into_iter()
            .skip(1)
            .collect();
        SessionOutcome::Coordinator(dispatcher.into_report(summaries))
    } else {
        let mut workload = Workload::new(seed, comm.rank());
        let run = run_worker(comm, &mut workload)?;
        comm.gather(&run.summary, COORDINATOR)?;
        SessionOutcome::Worker(run)
    };

    comm.barrier()?;
    debug!("Rank {} finished session", comm.rank());
    Ok(outcome)
}
