// Copyright (C) 2023, Ava Labs, Inc. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! Sparse descriptor-to-queue map: a four-level table keyed on byte slices
//! of the descriptor, lazily allocated under the write side of the map
//! lock. Lookups hold the read side; because destruction requires the write
//! side, a queue found under the read lock cannot disappear until the
//! reference bump below has happened.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

use nix::fcntl::{fcntl, FcntlArg};

use crate::abi;
use crate::cb::AioError;
use crate::queue::Queue;
use crate::rwlock::RwFutex;
use crate::signal::BlockAllGuard;

pub(crate) static MAP: RwFutex<QueueMap> = RwFutex::new(QueueMap::new());

/// Number of descriptors with a live queue.
pub(crate) static FD_COUNT: AtomicI32 = AtomicI32::new(0);

/// Stack size for I/O workers, probed once under the map write lock.
static WORKER_STACK: AtomicUsize = AtomicUsize::new(0);

// Top level spans the positive descriptor range; inner levels one byte each.
const TOP_FANOUT: usize = ((u32::MAX / 2 + 1) >> 24) as usize;
const FANOUT: usize = 256;

type Leaf = Box<[Option<Arc<Queue>>]>;
type Mid = Box<[Option<Leaf>]>;
type Second = Box<[Option<Mid>]>;

pub(crate) struct QueueMap {
    root: Option<Box<[Option<Second>]>>,
}

fn table<T>(n: usize) -> Box<[Option<T>]> {
    std::iter::repeat_with(|| None).take(n).collect()
}

fn slots(fd: RawFd) -> (usize, usize, usize, usize) {
    let fd = fd as u32;
    (
        (fd >> 24) as usize,
        (fd >> 16 & 0xff) as usize,
        (fd >> 8 & 0xff) as usize,
        (fd & 0xff) as usize,
    )
}

impl QueueMap {
    pub const fn new() -> Self {
        QueueMap { root: None }
    }

    pub fn find(&self, fd: RawFd) -> Option<&Arc<Queue>> {
        let (a, b, c, d) = slots(fd);
        self.root.as_ref()?[a].as_ref()?[b].as_ref()?[c].as_ref()?[d].as_ref()
    }

    /// Walk the path for `fd`, allocating missing levels, and return the
    /// queue plus whether this call created it.
    pub fn ensure(&mut self, fd: RawFd) -> (Arc<Queue>, bool) {
        let (a, b, c, d) = slots(fd);
        let root = self.root.get_or_insert_with(|| table(TOP_FANOUT));
        let second = root[a].get_or_insert_with(|| table(FANOUT));
        let mid = second[b].get_or_insert_with(|| table(FANOUT));
        let leaf = mid[c].get_or_insert_with(|| table(FANOUT));
        let cell = &mut leaf[d];
        let created = cell.is_none();
        let q = cell
            .get_or_insert_with(|| Arc::new(Queue::new(fd)))
            .clone();
        (q, created)
    }

    pub fn detach(&mut self, fd: RawFd) {
        let (a, b, c, d) = slots(fd);
        if let Some(root) = self.root.as_mut() {
            if let Some(second) = root[a].as_mut() {
                if let Some(mid) = second[b].as_mut() {
                    if let Some(leaf) = mid[c].as_mut() {
                        leaf[d] = None;
                    }
                }
            }
        }
    }

    /// Null every leaf cell without dropping the queues. Post-fork child
    /// only: the queues' lock state was copied from another process image
    /// and cannot be trusted, so the memory is abandoned.
    pub fn forget_leaves(&mut self) {
        if let Some(root) = self.root.as_mut() {
            for second in root.iter_mut().flatten() {
                for mid in second.iter_mut().flatten() {
                    for leaf in mid.iter_mut().flatten() {
                        for cell in leaf.iter_mut() {
                            if let Some(q) = cell.take() {
                                std::mem::forget(q);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Abandon the whole structure. Post-fork child fallback when the map
    /// lock itself is in an unknown state.
    pub fn forget_root(&mut self) {
        if let Some(root) = self.root.take() {
            std::mem::forget(root);
        }
    }

    #[cfg(test)]
    pub fn live_leaves(&self) -> usize {
        let mut n = 0;
        if let Some(root) = self.root.as_ref() {
            for second in root.iter().flatten() {
                for mid in second.iter().flatten() {
                    for leaf in mid.iter().flatten() {
                        n += leaf.iter().filter(|c| c.is_some()).count();
                    }
                }
            }
        }
        n
    }
}

/// Look up the queue for `fd`, creating it if requested. On a create, one
/// reference is taken on behalf of the caller while the map lock still
/// excludes destruction; the caller owes a matching `unref_locked`.
pub(crate) fn get_queue(fd: RawFd, create: bool) -> Result<Option<Arc<Queue>>, AioError> {
    if fd < 0 {
        return Err(AioError::BadDescriptor);
    }

    {
        let map = MAP.read();
        if let Some(q) = map.find(fd) {
            if create {
                q.state.lock().refs += 1;
            }
            return Ok(Some(q.clone()));
        }
    }

    if !create {
        return Ok(None);
    }
    if fcntl(fd, FcntlArg::F_GETFD).is_err() {
        return Err(AioError::BadDescriptor);
    }

    let _mask = BlockAllGuard::new();
    let mut map = MAP.write();
    if WORKER_STACK.load(Ordering::Relaxed) == 0 {
        WORKER_STACK.store(abi::min_worker_stack(), Ordering::Relaxed);
    }
    let (q, created) = map.ensure(fd);
    if created {
        FD_COUNT.fetch_add(1, Ordering::SeqCst);
    }
    q.state.lock().refs += 1;
    Ok(Some(q))
}

pub(crate) fn worker_stack() -> usize {
    match WORKER_STACK.load(Ordering::Relaxed) {
        0 => abi::min_worker_stack(),
        n => n,
    }
}
