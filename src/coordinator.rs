//! Rank 0: hands out tickets one at a time to whichever worker is free.
//!
//! [`Dispatcher`] is the bookkeeping state machine and never touches the
//! transport. [`run_coordinator`] drives it: prime every worker, then loop on
//! "wait for any completion, reissue to that worker" until every worker has
//! been sent the termination signal.

use crate::comm::{Communicator, RequestSet};
use crate::error::{DispatchError, Result};
use crate::protocol::{result_tag, Assignment, Completion, Ticket, WorkerSummary, WORK_TAG};
use log::{debug, info};
use std::fmt;

/// Process rank of worker slot `worker`. Rank 0 is the coordinator.
pub fn worker_rank(worker: usize) -> i32 {
    worker as i32 + 1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Handing every worker its first assignment.
    Priming,
    /// Reissuing tickets as completions come in.
    Dispatching,
    /// Tickets are exhausted; completions are answered with termination.
    Draining,
    Done,
}

/// Coordinator-side view of one worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSlot {
    outstanding: Option<Ticket>,
    last_result: Option<Completion>,
    completed: u64,
    primed: bool,
    terminated: bool,
}

impl WorkerSlot {
    /// Ticket the worker is currently working on, if any.
    pub fn outstanding(&self) -> Option<Ticket> {
        self.outstanding
    }

    pub fn last_result(&self) -> Option<Completion> {
        self.last_result
    }

    /// Number of tickets this worker has reported back.
    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn terminated(&self) -> bool {
        self.terminated
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionRecord {
    pub worker: usize,
    pub ticket: Ticket,
    pub result: Completion,
}

/// Ticket bookkeeping for `W` workers and `N` tickets.
///
/// Tickets are issued in increasing order starting at 1. A worker holds at
/// most one ticket at a time and is terminated exactly once, the first time it
/// asks for work after the tickets run out.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    total: u64,
    last: u64,
    slots: Vec<WorkerSlot>,
    primed: usize,
    finished: usize,
    phase: Phase,
    completions: Vec<CompletionRecord>,
}

impl Dispatcher {
    /// Fails with [`DispatchError::NotEnoughProcesses`] when there is no worker.
    pub fn new(workers: usize, tickets: u64) -> Result<Self> {
        if workers < 1 {
            return Err(DispatchError::NotEnoughProcesses {
                size: workers as i32 + 1,
            });
        }
        Ok(Self {
            total: tickets,
            last: 0,
            slots: vec![WorkerSlot::default(); workers],
            primed: 0,
            finished: 0,
            phase: Phase::Priming,
            completions: Vec::new(),
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn workers(&self) -> usize {
        self.slots.len()
    }

    pub fn slots(&self) -> &[WorkerSlot] {
        &self.slots
    }

    /// Number of workers that have been sent the termination signal.
    pub fn finished(&self) -> usize {
        self.finished
    }

    pub fn tickets_issued(&self) -> u64 {
        self.last
    }

    pub fn tickets_remaining(&self) -> u64 {
        self.total - self.last
    }

    pub fn completions(&self) -> &[CompletionRecord] {
        &self.completions
    }

    fn slot_mut(&mut self, worker: usize) -> Result<&mut WorkerSlot> {
        let workers = self.slots.len();
        self.slots.get_mut(worker).ok_or_else(|| {
            DispatchError::ProtocolViolation(format!("unknown worker {worker} of {workers}"))
        })
    }

    /// Give `worker` the next ticket, or the termination signal if none are
    /// left.
    pub fn assign_next(&mut self, worker: usize) -> Result<Assignment> {
        let exhausted = self.last >= self.total;
        let next = self.last + 1;
        let slot = self.slot_mut(worker)?;
        if slot.terminated {
            return Err(DispatchError::ProtocolViolation(format!(
                "worker {worker} was already terminated"
            )));
        }
        if let Some(ticket) = slot.outstanding {
            return Err(DispatchError::ProtocolViolation(format!(
                "worker {worker} still holds ticket {ticket}"
            )));
        }

        let first = !slot.primed;
        slot.primed = true;
        let assignment = if exhausted {
            slot.terminated = true;
            Assignment::Terminate
        } else {
            let ticket = Ticket::new(next).ok_or_else(|| {
                DispatchError::ProtocolViolation("ticket counter wrapped".into())
            })?;
            slot.outstanding = Some(ticket);
            Assignment::Work(ticket)
        };

        match assignment {
            Assignment::Work(_) => self.last += 1,
            Assignment::Terminate => self.finished += 1,
        }
        if first {
            self.primed += 1;
        }

        match self.phase {
            Phase::Priming if self.primed == self.slots.len() => self.phase = Phase::Dispatching,
            Phase::Dispatching if assignment == Assignment::Terminate => {
                self.phase = Phase::Draining
            }
            _ => {}
        }
        if self.finished == self.slots.len() {
            self.phase = Phase::Done;
        }

        Ok(assignment)
    }

    /// Record that `worker` finished its outstanding ticket with `result`.
    pub fn record_completion(&mut self, worker: usize, result: Completion) -> Result<Ticket> {
        let slot = self.slot_mut(worker)?;
        let ticket = slot.outstanding.take().ok_or_else(|| {
            DispatchError::ProtocolViolation(format!(
                "completion from worker {worker} with no outstanding ticket"
            ))
        })?;
        slot.last_result = Some(result);
        slot.completed += 1;

        self.completions.push(CompletionRecord {
            worker,
            ticket,
            result,
        });
        Ok(ticket)
    }

    pub fn into_report(self, summaries: Vec<WorkerSummary>) -> DispatchReport {
        DispatchReport {
            tickets: self.total,
            slots: self.slots,
            completions: self.completions,
            summaries,
        }
    }
}

/// Everything the coordinator saw during one run.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub tickets: u64,
    pub slots: Vec<WorkerSlot>,
    pub completions: Vec<CompletionRecord>,
    /// Self-reported totals of each worker, ordered by worker slot.
    pub summaries: Vec<WorkerSummary>,
}

impl DispatchReport {
    pub fn workers(&self) -> usize {
        self.slots.len()
    }

    pub fn total_particles(&self) -> u64 {
        self.completions.iter().map(|c| u64::from(c.result)).sum()
    }
}

impl fmt::Display for DispatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Dispatched {} tickets to {} workers",
            self.tickets,
            self.workers()
        )?;
        for summary in &self.summaries {
            writeln!(
                f,
                "  rank {:>3}: {:>6} tickets, {:>10} particles",
                summary.rank, summary.tickets_completed, summary.particles
            )?;
        }
        write!(
            f,
            "Total: {} completions, {} particles",
            self.completions.len(),
            self.total_particles()
        )
    }
}

fn dispatch<C: Communicator>(
    comm: &C,
    dispatcher: &mut Dispatcher,
    requests: &mut RequestSet,
    worker: usize,
) -> Result<()> {
    let rank = worker_rank(worker);
    let assignment = dispatcher.assign_next(worker)?;
    comm.send(&assignment.encode(), rank, WORK_TAG)?;

    match assignment {
        Assignment::Work(ticket) => {
            requests.post(worker, rank, result_tag(rank))?;
            debug!("Ticket {} issued to rank {}", ticket, rank);
        }
        Assignment::Terminate => {
            debug!(
                "Rank {} terminated ({}/{} finished)",
                rank,
                dispatcher.finished(),
                dispatcher.workers()
            );
        }
    }
    Ok(())
}

/// Block until any worker holding a ticket reports back. Returns `None` when
/// no worker holds a ticket.
pub fn await_any_completion<C: Communicator>(
    comm: &C,
    requests: &mut RequestSet,
) -> Result<Option<(usize, Completion)>> {
    comm.wait_any(requests)
}

/// Dispatch `tickets` tickets over every other rank of `comm` and terminate
/// them all. Must be called on rank 0 while every other rank runs
/// [`run_worker`](crate::worker::run_worker).
///
/// Blocks forever if a worker dies while holding a ticket.
pub fn run_coordinator<C: Communicator>(comm: &C, tickets: u64) -> Result<Dispatcher> {
    let workers = (comm.size() - 1).max(0) as usize;
    let mut dispatcher = Dispatcher::new(workers, tickets)?;
    let mut requests = RequestSet::new(workers);

    info!("Generating {} tickets with {} workers", tickets, workers);

    for worker in 0..workers {
        dispatch(comm, &mut dispatcher, &mut requests, worker)?;
    }
    info!("Priming done, phase {:?}", dispatcher.phase());

    let mut phase = dispatcher.phase();
    while dispatcher.phase() != Phase::Done {
        let (worker, result) = await_any_completion(comm, &mut requests)?.ok_or_else(|| {
            DispatchError::ProtocolViolation(format!(
                "no outstanding tickets but only {}/{} workers finished",
                dispatcher.finished(),
                workers
            ))
        })?;
        let ticket = dispatcher.record_completion(worker, result)?;
        debug!(
            "Rank {} completed ticket {} with {}",
            worker_rank(worker),
            ticket,
            result
        );

        dispatch(comm, &mut dispatcher, &mut requests, worker)?;
        if dispatcher.phase() != phase {
            phase = dispatcher.phase();
            info!("Coordinator entered {:?}", phase);
        }
    }

    Ok(dispatcher)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticket(id: u64) -> Ticket {
        Ticket::new(id).unwrap()
    }

    #[test]
    fn refuses_zero_workers() {
        assert!(matches!(
            Dispatcher::new(0, 10),
            Err(DispatchError::NotEnoughProcesses { size: 1 })
        ));
    }

    #[test]
    fn priming_then_dispatching_then_draining() {
        let mut d = Dispatcher::new(2, 3).unwrap();
        assert_eq!(d.phase(), Phase::Priming);

        assert_eq!(d.assign_next(0).unwrap(), Assignment::Work(ticket(1)));
        assert_eq!(d.phase(), Phase::Priming);
        assert_eq!(d.assign_next(1).unwrap(), Assignment::Work(ticket(2)));
        assert_eq!(d.phase(), Phase::Dispatching);

        assert_eq!(d.record_completion(1, 2600).unwrap(), ticket(2));
        assert_eq!(d.assign_next(1).unwrap(), Assignment::Work(ticket(3)));
        assert_eq!(d.phase(), Phase::Dispatching);
        assert_eq!(d.tickets_remaining(), 0);

        d.record_completion(0, 3000).unwrap();
        assert_eq!(d.assign_next(0).unwrap(), Assignment::Terminate);
        assert_eq!(d.phase(), Phase::Draining);
        assert_eq!(d.finished(), 1);

        d.record_completion(1, 4000).unwrap();
        assert_eq!(d.assign_next(1).unwrap(), Assignment::Terminate);
        assert_eq!(d.phase(), Phase::Done);
        assert_eq!(d.finished(), 2);
        assert_eq!(d.completions().len(), 3);
    }

    #[test]
    fn zero_tickets_terminates_during_priming() {
        let mut d = Dispatcher::new(3, 0).unwrap();
        for worker in 0..3 {
            assert_eq!(d.assign_next(worker).unwrap(), Assignment::Terminate);
        }
        assert_eq!(d.phase(), Phase::Done);
        assert_eq!(d.tickets_issued(), 0);
    }

    #[test]
    fn fewer_tickets_than_workers() {
        let mut d = Dispatcher::new(3, 1).unwrap();
        assert_eq!(d.assign_next(0).unwrap(), Assignment::Work(ticket(1)));
        assert_eq!(d.assign_next(1).unwrap(), Assignment::Terminate);
        assert_eq!(d.assign_next(2).unwrap(), Assignment::Terminate);
        assert_eq!(d.phase(), Phase::Dispatching);

        d.record_completion(0, 2500).unwrap();
        assert_eq!(d.assign_next(0).unwrap(), Assignment::Terminate);
        assert_eq!(d.phase(), Phase::Done);
    }

    #[test]
    fn at_most_one_outstanding_ticket() {
        let mut d = Dispatcher::new(1, 5).unwrap();
        d.assign_next(0).unwrap();
        assert_eq!(d.slots()[0].outstanding(), Some(ticket(1)));
        assert!(matches!(
            d.assign_next(0),
            Err(DispatchError::ProtocolViolation(_))
        ));
        assert_eq!(d.tickets_issued(), 1);
    }

    #[test]
    fn terminated_worker_gets_nothing_more() {
        let mut d = Dispatcher::new(2, 0).unwrap();
        d.assign_next(0).unwrap();
        assert!(d.assign_next(0).is_err());
        assert_eq!(d.finished(), 1);
    }

    #[test]
    fn completion_requires_outstanding_ticket() {
        let mut d = Dispatcher::new(2, 5).unwrap();
        assert!(d.record_completion(0, 1).is_err());
        assert!(d.record_completion(7, 1).is_err());
        assert!(d.assign_next(7).is_err());
    }

    #[test]
    fn slots_track_results() {
        let mut d = Dispatcher::new(1, 2).unwrap();
        d.assign_next(0).unwrap();
        d.record_completion(0, 2501).unwrap();
        d.assign_next(0).unwrap();
        d.record_completion(0, 4999).unwrap();

        let slot = &d.slots()[0];
        assert_eq!(slot.completed(), 2);
        assert_eq!(slot.last_result(), Some(4999));
        assert!(!slot.terminated());

        let report = d.into_report(Vec::new());
        assert_eq!(report.total_particles(), 2501 + 4999);
    }
}
