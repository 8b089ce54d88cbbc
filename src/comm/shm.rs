//! Multi-process transport over POSIX shared memory.
//!
//! The launching process becomes rank 0. It creates one shared memory segment,
//! re-executes the current binary `size - 1` times with the same arguments,
//! and each child claims the lowest free rank. The segment holds a control
//! block, one [`RankState`] per rank, and one message slot per ordered
//! `(source, destination)` pair:
//!
//! ```text
//! | ControlBlock | RankState * size | (MessageHeader + payload) * size * size |
//! ```
//!
//! A slot carries one message at a time. `send` blocks until the receiver has
//! copied the message out, so a receive for a different tag on the same pair
//! waits until the message in the slot has been consumed.

use super::{check_rank, Communicator, RequestSet};
use crate::error::{DispatchError, Result};
use crossbeam_utils::Backoff;
use log::debug;
use serde::{de::DeserializeOwned, Serialize};
use shared_memory::{Shmem, ShmemConf};
use std::ffi::OsString;
use std::mem::{align_of, size_of};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

/// Payload capacity of one message slot unless configured otherwise.
pub const DEFAULT_SLOT_BYTES: usize = 4096;
/// Smallest accepted payload capacity.
pub const MIN_SLOT_BYTES: usize = 64;

const SPAWNED_ENV: &str = "SIMPLE_DISPATCH_SPAWNED";
const SHM_ENV: &str = "SIMPLE_DISPATCH_SHM";
const HEADER_SIZE: usize = size_of::<MessageHeader>();

#[repr(C)]
struct MessageHeader {
    valid: AtomicBool,
    received: AtomicBool,
    tag: AtomicI32,
    source: AtomicI32,
    size: AtomicUsize,
}

impl MessageHeader {
    fn new() -> Self {
        Self {
            valid: AtomicBool::new(false),
            received: AtomicBool::new(false),
            tag: AtomicI32::new(0),
            source: AtomicI32::new(-1),
            size: AtomicUsize::new(0),
        }
    }
}

#[repr(C)]
struct ControlBlock {
    size: AtomicUsize,
    slot_bytes: AtomicUsize,
}

#[repr(C)]
struct RankState {
    process_id: AtomicUsize,
    init: AtomicBool,
    cleanup_ready: AtomicBool,
}

impl RankState {
    fn new() -> Self {
        Self {
            process_id: AtomicUsize::new(0),
            init: AtomicBool::new(false),
            cleanup_ready: AtomicBool::new(false),
        }
    }
}

fn align_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) / align * align
}

/// Byte offsets of everything inside the segment, derived from the group size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Layout {
    size: usize,
    slot_bytes: usize,
}

impl Layout {
    fn new(size: usize, slot_bytes: usize) -> Self {
        Self {
            size,
            slot_bytes: align_up(slot_bytes, align_of::<MessageHeader>()),
        }
    }

    fn ranks_offset(&self) -> usize {
        align_up(size_of::<ControlBlock>(), align_of::<RankState>())
    }

    fn rank_offset(&self, rank: usize) -> usize {
        self.ranks_offset() + rank * size_of::<RankState>()
    }

    fn slots_offset(&self) -> usize {
        align_up(self.rank_offset(self.size), align_of::<MessageHeader>())
    }

    fn slot_stride(&self) -> usize {
        HEADER_SIZE + self.slot_bytes
    }

    fn slot_offset(&self, src: usize, dst: usize) -> usize {
        self.slots_offset() + (src * self.size + dst) * self.slot_stride()
    }

    fn total_size(&self) -> usize {
        self.slots_offset() + self.size * self.size * self.slot_stride()
    }
}

/// A process group whose ranks are separate OS processes sharing one memory
/// segment.
///
/// ```rust,no_run
/// use simple_dispatch::comm::{Communicator, World, shm::DEFAULT_SLOT_BYTES};
///
/// // Rank 0 spawns ranks 1..4 by re-executing this binary
/// let world = World::init(4, DEFAULT_SLOT_BYTES).unwrap();
///
/// if world.rank() == 0 {
///     world.send(&42, 1, 0).unwrap();
/// } else if world.rank() == 1 {
///     let data: i32 = world.recv(0, 0).unwrap();
///     println!("Received: {}", data);
/// }
///
/// world.finalize().unwrap();
/// ```
pub struct World {
    rank: i32,
    size: i32,
    layout: Layout,
    shmem: Shmem,
    children: Vec<Child>,
}

impl World {
    /// Form a group of `size` processes.
    ///
    /// Called in the launching process, this creates the segment, spawns the
    /// other ranks and blocks until all of them have attached. Called in a
    /// spawned process (recognised through the environment), it attaches to
    /// the parent's segment and claims a rank.
    ///
    /// `slot_bytes` bounds the serialized size of any single message.
    pub fn init(size: i32, slot_bytes: usize) -> Result<Self> {
        if size <= 0 {
            return Err(DispatchError::InitError("Size must be positive".into()));
        }
        if slot_bytes < MIN_SLOT_BYTES {
            return Err(DispatchError::InitError(format!(
                "Slot size must be at least {MIN_SLOT_BYTES} bytes"
            )));
        }

        if std::env::var_os(SPAWNED_ENV).is_some() {
            return Self::init_spawned(size);
        }

        debug!("Initializing world with {} processes", size);

        let layout = Layout::new(size as usize, slot_bytes);
        let flink = std::env::temp_dir().join(format!("simple_dispatch_{}", std::process::id()));

        debug!("Creating shared memory of size {}", layout.total_size());
        let shmem = ShmemConf::new()
            .size(layout.total_size())
            .flink(&flink)
            .create()
            .map_err(|e| DispatchError::SharedMemoryError(e.to_string()))?;

        let mut world = World {
            rank: 0,
            size,
            layout,
            shmem,
            children: Vec::with_capacity(size as usize - 1),
        };
        world.reset_segment();
        world
            .rank_state(0)
            .process_id
            .store(std::process::id() as usize, Ordering::SeqCst);
        world.rank_state(0).init.store(true, Ordering::SeqCst);

        if let Err(e) = world.spawn_children(flink) {
            world.kill_children();
            return Err(e);
        }

        debug!("Parent process initialized as rank 0");
        if let Err(e) = world.wait_for_attach() {
            world.kill_children();
            return Err(e);
        }
        Ok(world)
    }

    fn init_spawned(size: i32) -> Result<Self> {
        debug!("Spawned process initializing");

        let flink = std::env::var_os(SHM_ENV)
            .map(PathBuf::from)
            .ok_or_else(|| DispatchError::InitError(format!("{SHM_ENV} is not set")))?;
        let shmem = ShmemConf::new()
            .flink(&flink)
            .open()
            .map_err(|e| DispatchError::SharedMemoryError(e.to_string()))?;

        let control = unsafe { &*(shmem.as_ptr() as *const ControlBlock) };
        let shared_size = control.size.load(Ordering::SeqCst);
        if shared_size != size as usize {
            return Err(DispatchError::InitError(format!(
                "Group size mismatch: parent has {shared_size}, child expected {size}"
            )));
        }
        let layout = Layout::new(shared_size, control.slot_bytes.load(Ordering::SeqCst));
        if shmem.len() < layout.total_size() {
            return Err(DispatchError::SharedMemoryError(format!(
                "Segment is {} bytes, expected {}",
                shmem.len(),
                layout.total_size()
            )));
        }

        let mut world = World {
            rank: -1,
            size,
            layout,
            shmem,
            children: Vec::new(),
        };

        // Claim the first rank whose process id is still unset
        let pid = std::process::id() as usize;
        let rank = (1..size)
            .find(|&i| {
                world
                    .rank_state(i as usize)
                    .process_id
                    .compare_exchange(0, pid, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            })
            .ok_or_else(|| {
                DispatchError::InitError(format!("No available ranks for process {pid}"))
            })?;
        world.rank = rank;

        world
            .rank_state(rank as usize)
            .init
            .store(true, Ordering::SeqCst);
        world.wait_for_attach()?;

        debug!("Process {} initialized as rank {}", pid, world.rank);
        Ok(world)
    }

    fn reset_segment(&mut self) {
        let base = self.shmem.as_ptr();
        unsafe {
            std::ptr::write(
                base as *mut ControlBlock,
                ControlBlock {
                    size: AtomicUsize::new(self.layout.size),
                    slot_bytes: AtomicUsize::new(self.layout.slot_bytes),
                },
            );
            for rank in 0..self.layout.size {
                std::ptr::write(
                    base.add(self.layout.rank_offset(rank)) as *mut RankState,
                    RankState::new(),
                );
            }
            for src in 0..self.layout.size {
                for dst in 0..self.layout.size {
                    std::ptr::write(
                        base.add(self.layout.slot_offset(src, dst)) as *mut MessageHeader,
                        MessageHeader::new(),
                    );
                }
            }
        }
    }

    fn spawn_children(&mut self, flink: PathBuf) -> Result<()> {
        let exe = std::env::current_exe().map_err(|e| DispatchError::ProcessError(e.to_string()))?;
        let args: Vec<OsString> = std::env::args_os().skip(1).collect();

        for _ in 1..self.size {
            let child = Command::new(&exe)
                .args(&args)
                .env(SPAWNED_ENV, "1")
                .env(SHM_ENV, &flink)
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .spawn()
                .map_err(|e| DispatchError::ProcessError(e.to_string()))?;
            self.children.push(child);
        }
        Ok(())
    }

    fn kill_children(&mut self) {
        for child in &mut self.children {
            let _ = child.kill();
            let _ = child.wait();
        }
        self.children.clear();
    }

    /// Block until every rank has attached. The parent also watches its
    /// children so a child that dies during startup is reported instead of
    /// waited on forever.
    fn wait_for_attach(&mut self) -> Result<()> {
        let backoff = Backoff::new();
        loop {
            if (0..self.layout.size).all(|i| self.rank_state(i).init.load(Ordering::SeqCst)) {
                return Ok(());
            }
            for child in &mut self.children {
                let exited = child
                    .try_wait()
                    .map_err(|e| DispatchError::ProcessError(e.to_string()))?;
                if let Some(status) = exited {
                    return Err(DispatchError::ProcessError(format!(
                        "Process {} exited during startup with {}",
                        child.id(),
                        status
                    )));
                }
            }
            backoff.snooze();
        }
    }

    fn control(&self) -> &ControlBlock {
        unsafe { &*(self.shmem.as_ptr() as *const ControlBlock) }
    }

    fn rank_state(&self, rank: usize) -> &RankState {
        unsafe { &*(self.shmem.as_ptr().add(self.layout.rank_offset(rank)) as *const RankState) }
    }

    fn slot(&self, src: i32, dst: i32) -> (&MessageHeader, *mut u8) {
        unsafe {
            let ptr = self
                .shmem
                .as_ptr()
                .add(self.layout.slot_offset(src as usize, dst as usize));
            (&*(ptr as *const MessageHeader), ptr.add(HEADER_SIZE))
        }
    }

    fn has_message(&self, source: i32, tag: i32) -> bool {
        let (header, _) = self.slot(source, self.rank);
        header.valid.load(Ordering::SeqCst)
            && header.source.load(Ordering::SeqCst) == source
            && header.tag.load(Ordering::SeqCst) == tag
    }

    /// Copy the message out of the slot and hand the slot back to the sender.
    fn take_message<T: DeserializeOwned>(&self, source: i32) -> Result<T> {
        let (header, data_ptr) = self.slot(source, self.rank);
        let bytes = unsafe {
            std::slice::from_raw_parts(data_ptr, header.size.load(Ordering::SeqCst)).to_vec()
        };

        header.received.store(true, Ordering::SeqCst);
        header.valid.store(false, Ordering::SeqCst);

        Ok(bincode::deserialize(&bytes)?)
    }

    /// Synchronize shutdown and release the segment.
    ///
    /// Every rank must call this once it is done communicating. Rank 0 waits
    /// for all spawned processes to exit before the segment is unlinked, and
    /// reports any child that exited unsuccessfully.
    pub fn finalize(mut self) -> Result<()> {
        self.rank_state(self.rank as usize)
            .cleanup_ready
            .store(true, Ordering::SeqCst);

        let backoff = Backoff::new();
        while !(0..self.layout.size)
            .all(|i| self.rank_state(i).cleanup_ready.load(Ordering::SeqCst))
        {
            backoff.snooze();
        }

        let mut failed = Vec::new();
        if self.rank == 0 {
            debug!("Parent process waiting for children to finish");
            for child in &mut self.children {
                let status = child
                    .wait()
                    .map_err(|e| DispatchError::ProcessError(e.to_string()))?;
                if !status.success() {
                    failed.push(format!("process {} exited with {}", child.id(), status));
                }
            }
            self.children.clear();
        }

        debug!("Process {} finished", self.rank);
        if failed.is_empty() {
            Ok(())
        } else {
            Err(DispatchError::ProcessError(failed.join(", ")))
        }
    }

    /// Tear down without synchronizing. On rank 0 every spawned process is
    /// killed, since peers may be blocked waiting on this rank.
    pub fn abort(mut self) {
        debug!("Rank {} aborting", self.rank);
        self.kill_children();
    }

    /// Payload capacity of one message slot, in bytes.
    pub fn slot_bytes(&self) -> usize {
        self.control().slot_bytes.load(Ordering::SeqCst)
    }
}

impl Communicator for World {
    fn rank(&self) -> i32 {
        self.rank
    }

    fn size(&self) -> i32 {
        self.size
    }

    /// Send data to a specific rank, blocking until it has been received.
    fn send<T: Serialize>(&self, data: &T, dest: i32, tag: i32) -> Result<()> {
        check_rank(dest, self.size)?;
        debug!("Rank {} sending to rank {} with tag {}", self.rank, dest, tag);

        let serialized = bincode::serialize(data)?;
        if serialized.len() > self.layout.slot_bytes {
            return Err(DispatchError::CommunicationError(format!(
                "Message too large: {} bytes, slot holds {}",
                serialized.len(),
                self.layout.slot_bytes
            )));
        }

        let (header, data_ptr) = self.slot(self.rank, dest);

        // Wait for slot to be free
        let backoff = Backoff::new();
        while header.valid.load(Ordering::SeqCst) {
            backoff.snooze();
        }

        header.tag.store(tag, Ordering::SeqCst);
        header.source.store(self.rank, Ordering::SeqCst);
        header.size.store(serialized.len(), Ordering::SeqCst);
        header.received.store(false, Ordering::SeqCst);
        unsafe {
            std::ptr::copy_nonoverlapping(serialized.as_ptr(), data_ptr, serialized.len());
        }
        header.valid.store(true, Ordering::SeqCst);

        debug!("Rank {} waiting for acknowledgment from rank {}", self.rank, dest);
        let backoff = Backoff::new();
        while !header.received.load(Ordering::SeqCst) {
            backoff.snooze();
        }

        debug!("Rank {} completed send to rank {}", self.rank, dest);
        Ok(())
    }

    fn recv<T: DeserializeOwned>(&self, source: i32, tag: i32) -> Result<T> {
        check_rank(source, self.size)?;
        debug!("Rank {} receiving from rank {} with tag {}", self.rank, source, tag);

        let backoff = Backoff::new();
        while !self.has_message(source, tag) {
            backoff.snooze();
        }
        let result = self.take_message(source)?;

        debug!("Rank {} completed receive from rank {}", self.rank, source);
        Ok(result)
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

        let backoff = Backoff::new();
        let (idx, source) = loop {
            let ready = requests
                .scan()
                .find(|(_, posted)| self.has_message(posted.source, posted.tag));
            if let Some((idx, posted)) = ready {
                break (idx, posted.source);
            }
            backoff.snooze();
        };

        requests.complete(idx);
        let result = self.take_message(source)?;

        debug!("Rank {} completed request {} from rank {}", self.rank, idx, source);
        Ok(Some((idx, result)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_grows_with_group_size() {
        let small = Layout::new(2, DEFAULT_SLOT_BYTES);
        let large = Layout::new(64, DEFAULT_SLOT_BYTES);
        assert!(large.total_size() > small.total_size());
        assert_eq!(
            large.total_size() - large.slots_offset(),
            64 * 64 * large.slot_stride()
        );
    }

    #[test]
    fn regions_are_aligned_and_disjoint() {
        let layout = Layout::new(5, 100);
        assert_eq!(layout.slot_bytes % align_of::<MessageHeader>(), 0);
        assert!(layout.ranks_offset() >= size_of::<ControlBlock>());
        assert!(layout.slots_offset() >= layout.rank_offset(5));

        for rank in 0..5 {
            assert_eq!(layout.rank_offset(rank) % align_of::<RankState>(), 0);
        }
        for src in 0..5 {
            for dst in 0..5 {
                let offset = layout.slot_offset(src, dst);
                assert_eq!(offset % align_of::<MessageHeader>(), 0);
                assert!(offset + layout.slot_stride() <= layout.total_size());
            }
        }
        assert_eq!(
            layout.slot_offset(0, 1) - layout.slot_offset(0, 0),
            layout.slot_stride()
        );
    }

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(16, 8), 16);
        assert_eq!(align_up(17, 4), 20);
    }

    #[test]
    fn init_validates_arguments() {
        assert!(matches!(
            World::init(0, DEFAULT_SLOT_BYTES),
            Err(DispatchError::InitError(_))
        ));
        assert!(matches!(
            World::init(2, MIN_SLOT_BYTES - 1),
            Err(DispatchError::InitError(_))
        ));
    }
}
