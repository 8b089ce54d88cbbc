//! The process-group abstraction the dispatcher talks through.
//!
//! A [`Communicator`] is acquired once per rank and never mutated afterwards. It
//! carries the rank's identity, point-to-point messaging, a "first of these
//! posted receives" wait, and the two collectives the dispatcher needs
//! (`barrier` and `gather`). Two transports implement it:
//!
//! - [`World`]: one OS process per rank, messages exchanged through POSIX shared memory.
//! - [`LocalWorld`]: one thread per rank inside the current process, messages
//!   exchanged through channels.
//!
//! User tags must be non-negative; negative tags are reserved for collectives.

use crate::error::{DispatchError, Result};
use log::debug;
use serde::{de::DeserializeOwned, Serialize};

pub mod local;
pub mod shm;

pub use local::LocalWorld;
pub use shm::World;

pub(crate) const BARRIER_ARRIVE_TAG: i32 = -1;
pub(crate) const BARRIER_COMPLETE_TAG: i32 = -2;
pub(crate) const GATHER_TAG: i32 = -3;

/// A receive that has been posted but not yet matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostedRecv {
    pub source: i32,
    pub tag: i32,
}

/// A fixed-length collection of posted receives, completed one at a time by
/// [`Communicator::wait_any`].
///
/// Entries are addressed by index. Completing an entry clears it, so the
/// caller can re-arm the same index with [`RequestSet::post`].
///
/// Transports that poll scan the entries starting just after the last
/// completed index, so a re-armed low index cannot keep winning over entries
/// that were already ready.
#[derive(Debug, Clone)]
pub struct RequestSet {
    requests: Vec<Option<PostedRecv>>,
    cursor: usize,
}

impl RequestSet {
    pub fn new(len: usize) -> Self {
        Self {
            requests: vec![None; len],
            cursor: 0,
        }
    }

    /// Post a receive for `(source, tag)` at `idx`.
    ///
    /// Fails if `idx` is out of range or the entry is still active.
    pub fn post(&mut self, idx: usize, source: i32, tag: i32) -> Result<()> {
        let len = self.requests.len();
        let entry = self.requests.get_mut(idx).ok_or_else(|| {
            DispatchError::CommunicationError(format!("request index {idx} out of range ({len})"))
        })?;
        if let Some(active) = entry {
            return Err(DispatchError::CommunicationError(format!(
                "request {idx} is still waiting on rank {} tag {}",
                active.source, active.tag
            )));
        }
        *entry = Some(PostedRecv { source, tag });
        Ok(())
    }

    pub fn get(&self, idx: usize) -> Option<PostedRecv> {
        self.requests.get(idx).copied().flatten()
    }

    /// Number of receives still waiting for a message.
    pub fn outstanding(&self) -> usize {
        self.requests.iter().filter(|r| r.is_some()).count()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub(crate) fn active(&self) -> impl Iterator<Item = (usize, PostedRecv)> + '_ {
        self.requests
            .iter()
            .enumerate()
            .filter_map(|(idx, r)| r.map(|r| (idx, r)))
    }

    /// Active entries in polling order: from the cursor to the end, then
    /// wrapping around to the start.
    pub(crate) fn scan(&self) -> impl Iterator<Item = (usize, PostedRecv)> + '_ {
        let len = self.requests.len();
        (0..len)
            .map(move |i| (self.cursor + i) % len)
            .filter_map(|idx| self.requests[idx].map(|r| (idx, r)))
    }

    /// Index of the first active entry that `(source, tag)` satisfies.
    pub(crate) fn match_index(&self, source: i32, tag: i32) -> Option<usize> {
        self.active()
            .find(|(_, r)| r.source == source && r.tag == tag)
            .map(|(idx, _)| idx)
    }

    pub(crate) fn complete(&mut self, idx: usize) {
        if let Some(entry) = self.requests.get_mut(idx) {
            *entry = None;
            self.cursor = (idx + 1) % self.requests.len();
        }
    }
}

pub(crate) fn check_rank(rank: i32, size: i32) -> Result<()> {
    if rank < 0 || rank >= size {
        return Err(DispatchError::InvalidRank(rank));
    }
    Ok(())
}

/// Identity and message passing for one member of a process group.
pub trait Communicator {
    /// This member's rank, between 0 and `size() - 1`.
    fn rank(&self) -> i32;

    /// Total number of members. Fixed when the group is formed.
    fn size(&self) -> i32;

    /// Send `data` to `dest`. Messages between one pair of ranks arrive in order.
    fn send<T: Serialize>(&self, data: &T, dest: i32, tag: i32) -> Result<()>;

    /// Block until a message with `tag` arrives from `source`.
    fn recv<T: DeserializeOwned>(&self, source: i32, tag: i32) -> Result<T>;

    /// Block until any active entry of `requests` is matched by an incoming
    /// message. The matched entry is cleared and its index returned together
    /// with the payload. Returns `Ok(None)` when nothing is posted.
    ///
    /// When several entries could be matched, which one wins is unspecified.
    fn wait_any<T: DeserializeOwned>(&self, requests: &mut RequestSet)
        -> Result<Option<(usize, T)>>;

    /// Barrier synchronization - blocks until all ranks reach this point.
    fn barrier(&self) -> Result<()> {
        debug!("Rank {} entering barrier", self.rank());

        // First phase: everyone reports to root
        if self.rank() == 0 {
            for rank in 1..self.size() {
                debug!("Root waiting for rank {}", rank);
                self.recv::<()>(rank, BARRIER_ARRIVE_TAG)?;
            }
        } else {
            self.send(&(), 0, BARRIER_ARRIVE_TAG)?;
        }

        // Second phase: root releases everyone
        if self.rank() == 0 {
            for rank in 1..self.size() {
                self.send(&(), rank, BARRIER_COMPLETE_TAG)?;
            }
        } else {
            self.recv::<()>(0, BARRIER_COMPLETE_TAG)?;
        }

        debug!("Rank {} exiting barrier", self.rank());
        Ok(())
    }

    /// Gather one value from every rank at `root`.
    ///
    /// Returns the values ordered by rank on `root`, and `None` elsewhere.
    fn gather<T: Serialize + DeserializeOwned + Clone>(
        &self,
        data: &T,
        root: i32,
    ) -> Result<Option<Vec<T>>> {
        check_rank(root, self.size())?;
        debug!("Rank {} entering gather", self.rank());

        let result = if self.rank() == root {
            let mut result = Vec::with_capacity(self.size() as usize);
            for rank in 0..self.size() {
                if rank == root {
                    result.push(data.clone());
                } else {
                    debug!("Root receiving from rank {}", rank);
                    result.push(self.recv(rank, GATHER_TAG)?);
                }
            }
            Some(result)
        } else {
            self.send(data, root, GATHER_TAG)?;
            None
        };

        debug!("Rank {} completed gather", self.rank());
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_rejects_active_entry() {
        let mut set = RequestSet::new(2);
        set.post(0, 1, 1).unwrap();
        assert!(set.post(0, 1, 1).is_err());
        assert!(set.post(2, 3, 3).is_err());
        assert_eq!(set.outstanding(), 1);
    }

    #[test]
    fn complete_clears_and_allows_rearm() {
        let mut set = RequestSet::new(3);
        set.post(0, 1, 1).unwrap();
        set.post(2, 3, 3).unwrap();
        assert_eq!(set.match_index(3, 3), Some(2));
        assert_eq!(set.match_index(3, 1), None);

        set.complete(2);
        assert_eq!(set.get(2), None);
        assert_eq!(set.outstanding(), 1);
        set.post(2, 3, 3).unwrap();
        assert_eq!(set.get(2), Some(PostedRecv { source: 3, tag: 3 }));
    }

    #[test]
    fn scan_resumes_after_last_completion() {
        let mut set = RequestSet::new(3);
        for idx in 0..3 {
            set.post(idx, idx as i32 + 1, idx as i32 + 1).unwrap();
        }
        let first = |set: &RequestSet| set.scan().next().map(|(idx, _)| idx);
        assert_eq!(first(&set), Some(0));

        // Re-arming index 0 must not put it back in front of 1 and 2
        set.complete(0);
        set.post(0, 1, 1).unwrap();
        assert_eq!(first(&set), Some(1));
        assert_eq!(
            set.scan().map(|(idx, _)| idx).collect::<Vec<_>>(),
            vec![1, 2, 0]
        );

        set.complete(1);
        set.post(1, 2, 2).unwrap();
        assert_eq!(first(&set), Some(2));

        set.complete(2);
        assert_eq!(
            set.scan().map(|(idx, _)| idx).collect::<Vec<_>>(),
            vec![0, 1]
        );
    }

    #[test]
    fn rank_bounds() {
        assert!(check_rank(0, 1).is_ok());
        assert!(matches!(check_rank(1, 1), Err(DispatchError::InvalidRank(1))));
        assert!(matches!(check_rank(-1, 4), Err(DispatchError::InvalidRank(-1))));
    }
}
