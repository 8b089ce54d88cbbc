//! Messages exchanged between the coordinator (rank 0) and the workers.
//!
//! Assignments travel from rank 0 on [`WORK_TAG`] as a single `i64`: a ticket
//! id `>= 1`, or [`TERMINATE_SENTINEL`]. A worker answers on a tag equal to
//! its own rank with the result of the ticket it just finished.

use crate::error::{DispatchError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Rank of the coordinator.
pub const COORDINATOR: i32 = 0;

/// Tag of every assignment sent by the coordinator.
pub const WORK_TAG: i32 = 0;

/// Wire value meaning "no more work".
pub const TERMINATE_SENTINEL: i64 = -1;

/// Tag a worker reports its results on.
pub fn result_tag(worker_rank: i32) -> i32 {
    worker_rank
}

/// Result reported for one finished ticket.
pub type Completion = u32;

/// One unit of work. Ids start at 1 and are never reused within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ticket(u64);

impl Ticket {
    pub fn new(id: u64) -> Option<Self> {
        (id >= 1).then_some(Ticket(id))
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    Work(Ticket),
    Terminate,
}

impl Assignment {
    pub fn encode(self) -> i64 {
        match self {
            Assignment::Work(ticket) => ticket.0 as i64,
            Assignment::Terminate => TERMINATE_SENTINEL,
        }
    }

    /// Decode a wire value. Anything that is neither a ticket id nor the
    /// sentinel is a protocol violation.
    pub fn decode(raw: i64) -> Result<Self> {
        match raw {
            TERMINATE_SENTINEL => Ok(Assignment::Terminate),
            id if id >= 1 => Ok(Assignment::Work(Ticket(id as u64))),
            other => Err(DispatchError::ProtocolViolation(format!(
                "malformed assignment {other}"
            ))),
        }
    }
}

/// What a worker did over the whole run, gathered at the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub rank: i32,
    pub tickets_completed: u64,
    pub particles: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticket_ids_start_at_one() {
        assert_eq!(Ticket::new(0), None);
        assert_eq!(Ticket::new(1).map(Ticket::id), Some(1));
    }

    #[test]
    fn sentinel_is_not_a_ticket() {
        assert_eq!(Assignment::Terminate.encode(), TERMINATE_SENTINEL);
        assert_eq!(
            Assignment::decode(TERMINATE_SENTINEL).unwrap(),
            Assignment::Terminate
        );
        let ticket = Ticket::new(6000).unwrap();
        assert_eq!(Assignment::decode(6000).unwrap(), Assignment::Work(ticket));
    }

    #[test]
    fn malformed_assignments_are_rejected() {
        for raw in [0, -2, i64::MIN] {
            assert!(matches!(
                Assignment::decode(raw),
                Err(DispatchError::ProtocolViolation(_))
            ));
        }
    }
}
