// Copyright (C) 2023, Ava Labs, Inc. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! Per-descriptor request queues.
//!
//! A queue exists while any submitter or worker holds a reference on it;
//! the last holder detaches it from the descriptor map. The request list is
//! head-inserted, so "requests older than mine" is exactly "requests with a
//! lower sequence number still linked", which is what the write sequencing
//! rule scans for.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, AtomicIsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::cb::{Aiocb, Op};
use crate::map;

/// Values of the per-request `running` word.
pub(crate) const RUNNING: i32 = 1;
pub(crate) const EXITED: i32 = 0;
pub(crate) const CANCEL_PENDING: i32 = -1;

pub(crate) struct Queue {
    pub fd: RawFd,
    pub state: Mutex<QueueState>,
    /// Wakes workers parked on the sequencing rule; broadcast on every
    /// completion and on cancellation marks.
    pub cond: Condvar,
}

pub(crate) struct QueueState {
    /// Submitters holding the queue plus workers linked or starting.
    pub refs: i32,
    /// `seekable`/`append` are valid; populated by the first worker.
    pub init: bool,
    pub seekable: bool,
    pub append: bool,
    next_seq: u64,
    list: VecDeque<Arc<Request>>,
}

impl Queue {
    pub fn new(fd: RawFd) -> Self {
        Queue {
            fd,
            state: Mutex::new(QueueState {
                refs: 0,
                init: false,
                seekable: false,
                append: false,
                next_seq: 0,
                list: VecDeque::new(),
            }),
            cond: Condvar::new(),
        }
    }
}

impl QueueState {
    pub fn alloc_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    pub fn link_front(&mut self, req: Arc<Request>) {
        self.list.push_front(req);
    }

    pub fn unlink(&mut self, req: &Arc<Request>) {
        if let Some(pos) = self.list.iter().position(|r| Arc::ptr_eq(r, req)) {
            self.list.remove(pos);
        }
    }

    /// True while any WRITE linked before `seq` has not exited.
    pub fn write_pending_before(&self, seq: u64) -> bool {
        self.list.iter().any(|r| r.seq < seq && r.op == Op::Write)
    }

    pub fn requests(&self) -> impl Iterator<Item = &Arc<Request>> {
        self.list.iter()
    }
}

/// State of one in-flight operation, owned by its worker. Peers may read
/// `running` (atomic) and the list linkage (queue lock); `err`/`ret` become
/// readable once `running` has been observed at `EXITED`.
pub(crate) struct Request {
    pub op: Op,
    pub seq: u64,
    pub tid: libc::pthread_t,
    pub cb: Arc<Aiocb>,
    pub q: Arc<Queue>,
    pub running: AtomicI32,
    /// Cancellers currently nudging this request; gates worker exit so a
    /// nudge never lands on a reused thread id.
    pub waiters: AtomicI32,
    err: AtomicI32,
    ret: AtomicIsize,
}

impl Request {
    pub fn new(op: Op, seq: u64, tid: libc::pthread_t, cb: Arc<Aiocb>, q: Arc<Queue>) -> Self {
        Request {
            op,
            seq,
            tid,
            cb,
            q,
            running: AtomicI32::new(RUNNING),
            waiters: AtomicI32::new(0),
            // Defaults published as-is when the worker never reaches the
            // I/O call (cancelled in the sequencing wait or before it).
            err: AtomicI32::new(libc::ECANCELED),
            ret: AtomicIsize::new(-1),
        }
    }

    /// Record the outcome of the I/O call. Published to other threads by
    /// the later swap on `running`.
    pub fn stage(&self, ret: isize, err: i32) {
        self.ret.store(ret, Ordering::Relaxed);
        self.err.store(err, Ordering::Relaxed);
    }

    pub fn staged_ret(&self) -> isize {
        self.ret.load(Ordering::Relaxed)
    }

    pub fn staged_err(&self) -> i32 {
        self.err.load(Ordering::Relaxed)
    }
}

/// Drop one reference, freeing the queue if it was the last. The map write
/// lock cannot be taken over the queue lock, so a tentative last reference
/// releases the queue, locks the map, and reinspects: a submitter may have
/// acquired the queue in between.
pub(crate) fn unref_locked(q: &Arc<Queue>, mut st: MutexGuard<'_, QueueState>) {
    if st.refs > 1 {
        st.refs -= 1;
        return;
    }

    drop(st);
    let mut map = map::MAP.write();
    let mut st = q.state.lock();
    if st.refs == 1 {
        map.detach(q.fd);
        map::FD_COUNT.fetch_sub(1, Ordering::SeqCst);
        // Detaching drops the map's handle; the memory goes away with the
        // last outstanding clone.
    } else {
        st.refs -= 1;
    }
}
