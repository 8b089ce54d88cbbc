//! Thread-per-rank transport.
//!
//! Every rank owns one inbox. Messages that arrive before anyone asks for them
//! are parked in a per-rank pending queue, which is always searched before
//! blocking on the inbox again, so per-pair ordering is preserved.
//!
//! A member holds senders to every other inbox but not to its own, so once
//! every peer has returned a blocked receive fails instead of waiting forever.
//! A peer that returns early while others are still blocked on it is not
//! detected.

use super::{check_rank, Communicator, RequestSet};
use crate::error::{DispatchError, Result};
use log::debug;
use serde::{de::DeserializeOwned, Serialize};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

struct Envelope {
    source: i32,
    tag: i32,
    payload: Vec<u8>,
}

/// One member of an in-process group.
///
/// ```rust
/// use simple_dispatch::comm::{Communicator, LocalWorld};
///
/// let sums = LocalWorld::run(3, |world| {
///     let gathered = world.gather(&world.rank(), 0).unwrap();
///     gathered.map(|ranks| ranks.iter().sum::<i32>())
/// })
/// .unwrap();
///
/// assert_eq!(sums, vec![Some(3), None, None]);
/// ```
pub struct LocalWorld {
    rank: i32,
    size: i32,
    inbox: Receiver<Envelope>,
    /// Indexed by rank. `None` at this member's own rank.
    peers: Vec<Option<Sender<Envelope>>>,
    pending: RefCell<VecDeque<Envelope>>,
}

impl LocalWorld {
    /// Create the `size` connected members of a group, ordered by rank.
    pub fn group(size: i32) -> Result<Vec<LocalWorld>> {
        if size <= 0 {
            return Err(DispatchError::InitError("Size must be positive".into()));
        }

        let (peers, inboxes): (Vec<_>, Vec<_>) = (0..size).map(|_| mpsc::channel()).unzip();

        Ok(inboxes
            .into_iter()
            .zip(0..size)
            .map(|(inbox, rank)| LocalWorld {
                rank,
                size,
                inbox,
                peers: peers
                    .iter()
                    .enumerate()
                    .map(|(peer, tx)| (peer != rank as usize).then(|| tx.clone()))
                    .collect(),
                pending: RefCell::new(VecDeque::new()),
            })
            .collect())
    }

    /// Run `f` once per rank, each on its own thread, and collect the results
    /// ordered by rank.
    pub fn run<F, R>(size: i32, f: F) -> Result<Vec<R>>
    where
        F: Fn(&LocalWorld) -> R + Sync,
        R: Send,
    {
        let members = Self::group(size)?;
        let f = &f;

        thread::scope(|scope| -> Result<Vec<R>> {
            let mut handles = Vec::with_capacity(members.len());
            for world in members {
                let handle = thread::Builder::new()
                    .name(format!("rank-{}", world.rank))
                    .spawn_scoped(scope, move || f(&world))
                    .map_err(|e| DispatchError::ProcessError(e.to_string()))?;
                handles.push(handle);
            }

            handles
                .into_iter()
                .enumerate()
                .map(|(rank, handle)| {
                    handle
                        .join()
                        .map_err(|_| DispatchError::ProcessError(format!("rank {rank} panicked")))
                })
                .collect()
        })
    }

    fn take_pending(&self, mut matches: impl FnMut(&Envelope) -> bool) -> Option<Envelope> {
        let mut pending = self.pending.borrow_mut();
        let pos = pending.iter().position(&mut matches)?;
        pending.remove(pos)
    }

    fn next_from_inbox(&self) -> Result<Envelope> {
        self.inbox.recv().map_err(|_| {
            DispatchError::CommunicationError(format!("rank {} inbox disconnected", self.rank))
        })
    }

    /// Block until an envelope satisfying `matches` is available, parking
    /// everything else.
    fn next_matching(&self, mut matches: impl FnMut(&Envelope) -> bool) -> Result<Envelope> {
        if let Some(envelope) = self.take_pending(&mut matches) {
            return Ok(envelope);
        }
        loop {
            let envelope = self.next_from_inbox()?;
            if matches(&envelope) {
                return Ok(envelope);
            }
            self.pending.borrow_mut().push_back(envelope);
        }
    }
}

impl Communicator for LocalWorld {
    fn rank(&self) -> i32 {
        self.rank
    }

    fn size(&self) -> i32 {
        self.size
    }

    fn send<T: Serialize>(&self, data: &T, dest: i32, tag: i32) -> Result<()> {
        check_rank(dest, self.size)?;
        debug!("Rank {} sending to rank {} with tag {}", self.rank, dest, tag);

        let envelope = Envelope {
            source: self.rank,
            tag,
            payload: bincode::serialize(data)?,
        };
        match &self.peers[dest as usize] {
            Some(peer) => peer.send(envelope).map_err(|_| {
                DispatchError::CommunicationError(format!("rank {dest} is no longer receiving"))
            }),
            None => {
                self.pending.borrow_mut().push_back(envelope);
                Ok(())
            }
        }
    }

    fn recv<T: DeserializeOwned>(&self, source: i32, tag: i32) -> Result<T> {
        check_rank(source, self.size)?;
        debug!("Rank {} receiving from rank {} with tag {}", self.rank, source, tag);

        let envelope = self.next_matching(|e| e.source == source && e.tag == tag)?;
        Ok(bincode::deserialize(&envelope.payload)?)
    }

    fn wait_any<T: DeserializeOwned>(
        &self,
        requests: &mut RequestSet,
    ) -> Result<Option<(usize, T)>> {
        if requests.outstanding() == 0 {
            return Ok(None);
        }
        for (_, posted) in requests.active() {
            check_rank(posted.source, self.size)?;
        }
        debug!(
            "Rank {} waiting on {} posted receives",
            self.rank,
            requests.outstanding()
        );

        let envelope = self.next_matching(|e| requests.match_index(e.source, e.tag).is_some())?;
        let idx = requests
            .match_index(envelope.source, envelope.tag)
            .ok_or_else(|| DispatchError::CommunicationError("matched request vanished".into()))?;
        requests.complete(idx);

        debug!("Rank {} completed request {} from rank {}", self.rank, idx, envelope.source);
        Ok(Some((idx, bincode::deserialize(&envelope.payload)?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_rejects_empty() {
        assert!(matches!(LocalWorld::group(0), Err(DispatchError::InitError(_))));
    }

    #[test]
    fn out_of_order_tags_are_parked() {
        let got = LocalWorld::run(2, |world| {
            if world.rank() == 0 {
                world.send(&"first", 1, 7).unwrap();
                world.send(&"second", 1, 8).unwrap();
                None
            } else {
                let second: String = world.recv(0, 8).unwrap();
                let first: String = world.recv(0, 7).unwrap();
                Some((first, second))
            }
        })
        .unwrap();

        assert_eq!(got[1], Some(("first".to_string(), "second".to_string())));
    }

    #[test]
    fn pair_order_is_fifo() {
        let got = LocalWorld::run(2, |world| {
            if world.rank() == 0 {
                for i in 0..50u32 {
                    world.send(&i, 1, 0).unwrap();
                }
                Vec::new()
            } else {
                (0..50).map(|_| world.recv::<u32>(0, 0).unwrap()).collect()
            }
        })
        .unwrap();

        assert_eq!(got[1], (0..50).collect::<Vec<u32>>());
    }

    #[test]
    fn wait_any_returns_each_posted_receive_once() {
        let got = LocalWorld::run(4, |world| {
            if world.rank() == 0 {
                let mut requests = RequestSet::new(3);
                for worker in 1..4 {
                    requests.post(worker as usize - 1, worker, worker).unwrap();
                }
                let mut seen = Vec::new();
                while let Some((idx, value)) = world.wait_any::<i32>(&mut requests).unwrap() {
                    assert_eq!(value, idx as i32 + 1);
                    seen.push(idx);
                }
                seen.sort();
                seen
            } else {
                world.send(&world.rank(), 0, world.rank()).unwrap();
                Vec::new()
            }
        })
        .unwrap();

        assert_eq!(got[0], vec![0, 1, 2]);
    }

    #[test]
    fn wait_any_with_nothing_posted() {
        let worlds = LocalWorld::group(1).unwrap();
        let mut requests = RequestSet::new(4);
        let got = worlds[0].wait_any::<i32>(&mut requests).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn invalid_ranks_are_rejected() {
        let worlds = LocalWorld::group(2).unwrap();
        assert!(matches!(
            worlds[0].send(&1, 2, 0),
            Err(DispatchError::InvalidRank(2))
        ));
        assert!(matches!(
            worlds[0].recv::<i32>(-1, 0),
            Err(DispatchError::InvalidRank(-1))
        ));
        assert!(matches!(
            worlds[0].gather(&1, 5),
            Err(DispatchError::InvalidRank(5))
        ));
    }

    #[test]
    fn send_to_self_is_received() {
        let worlds = LocalWorld::group(2).unwrap();
        worlds[1].send(&"loopback", 1, 3).unwrap();
        let got: String = worlds[1].recv(1, 3).unwrap();
        assert_eq!(got, "loopback");
    }

    #[test]
    fn recv_fails_once_every_peer_is_gone() {
        let got = LocalWorld::run(3, |world| {
            if world.rank() == 0 {
                Some(world.recv::<i32>(2, 0))
            } else {
                None
            }
        })
        .unwrap();

        assert!(matches!(
            got[0],
            Some(Err(DispatchError::CommunicationError(_)))
        ));
    }

    #[test]
    fn send_to_departed_rank_fails() {
        let mut worlds = LocalWorld::group(2).unwrap();
        drop(worlds.pop());
        assert!(matches!(
            worlds[0].send(&1, 1, 0),
            Err(DispatchError::CommunicationError(_))
        ));
    }

    #[test]
    fn barrier_and_gather_with_non_zero_root() {
        let got = LocalWorld::run(3, |world| {
            world.barrier().unwrap();
            world.gather(&(world.rank() * 10), 2).unwrap()
        })
        .unwrap();

        assert_eq!(got[0], None);
        assert_eq!(got[1], None);
        assert_eq!(got[2], Some(vec![0, 10, 20]));
    }
}
