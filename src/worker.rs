// Copyright (C) 2023, Ava Labs, Inc. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! Worker threads: one detached thread per in-flight request.
//!
//! A worker registers its request on the queue, waits out the write
//! sequencing rule, performs the I/O, and exits through `CompletionGuard`.
//! The guard runs on every exit path and publishes completion in a fixed
//! order: result, `running` word, status word, global wake word, then
//! unlink and queue release under the queue lock, then the notification.
//! A reader observing the status word off `EINPROGRESS` may rely on the
//! result being final.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::Sender;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::{lseek, Whence};

use crate::abi;
use crate::cb::{Aiocb, Notify, Op};
use crate::map;
use crate::queue::{self, Queue, Request, CANCEL_PENDING, EXITED};
use crate::signal;

/// Wake word for list waiters; any completion swaps it to zero and wakes.
pub(crate) static LIST_WAKE: AtomicI32 = AtomicI32::new(0);

pub(crate) struct WorkerArgs {
    pub cb: Arc<Aiocb>,
    pub q: Arc<Queue>,
    pub op: Op,
    pub reg: Sender<()>,
}

/// Create the detached worker. Runs with the submitter's full signal mask
/// in effect, so the thread starts with everything blocked.
pub(crate) fn spawn(args: WorkerArgs) -> std::io::Result<()> {
    signal::install_nudge_handler();

    let stack = match args.cb.event() {
        // Callback notifications may carry their own thread sizing; plain
        // requests run on the small probed stack.
        Notify::Callback(c) => c.stack_size,
        _ => Some(map::worker_stack()),
    };
    let mut builder = thread::Builder::new().name("paio-io".into());
    if let Some(size) = stack {
        builder = builder.stack_size(size);
    }
    builder.spawn(move || worker_main(args)).map(drop)
}

fn worker_main(args: WorkerArgs) {
    let WorkerArgs { cb, q, op, reg } = args;

    let mut st = q.state.lock();
    // Registration handshake happens under the queue lock, together with
    // the link, so cancellers see either nothing or a linked request.
    let _ = reg.send(());

    let seq = st.alloc_seq();
    let req = Arc::new(Request::new(
        op,
        seq,
        unsafe { libc::pthread_self() },
        cb,
        q.clone(),
    ));
    st.link_front(req.clone());

    if !st.init {
        let fd = req.cb.fd();
        let seekable = lseek(fd, 0, Whence::SeekCur).is_ok();
        st.seekable = seekable;
        // Non-seekable descriptors also take the plain-write path.
        st.append = !seekable
            || fcntl(fd, FcntlArg::F_GETFL)
                .map(|f| OFlag::from_bits_truncate(f).contains(OFlag::O_APPEND))
                .unwrap_or(false);
        st.init = true;
    }
    let seekable = st.seekable;
    let append = st.append;

    let _guard = CompletionGuard { req: req.clone() };
    signal::unblock_nudge();

    // Sequencing rule: syncs and append writes wait until every write
    // linked before them has exited. Reads and plain writes do not wait.
    let mut cancelled = false;
    if op != Op::Read && (op != Op::Write || append) {
        loop {
            if req.running.load(Ordering::SeqCst) == CANCEL_PENDING {
                cancelled = true;
                break;
            }
            if !st.write_pending_before(seq) {
                break;
            }
            q.cond.wait(&mut st);
        }
    }
    drop(st);

    if !cancelled {
        perform_io(&req, seekable, append);
    }
}

fn perform_io(req: &Request, seekable: bool, append: bool) {
    let cb = &req.cb;
    let fd = cb.fd();
    let buf = cb.buf_ptr();
    let len = cb.nbytes();
    let off = cb.offset();

    loop {
        let ret = unsafe {
            match req.op {
                Op::Write => {
                    if append {
                        libc::write(fd, buf as *const libc::c_void, len)
                    } else {
                        libc::pwrite(fd, buf as *const libc::c_void, len, off)
                    }
                }
                Op::Read => {
                    if seekable {
                        libc::pread(fd, buf as *mut libc::c_void, len, off)
                    } else {
                        libc::read(fd, buf as *mut libc::c_void, len)
                    }
                }
                Op::Sync => libc::fsync(fd) as isize,
                Op::DataSync => libc::fdatasync(fd) as isize,
            }
        };
        if ret >= 0 {
            req.stage(ret, 0);
            return;
        }
        let err = std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EIO);
        if err == libc::EINTR {
            if req.running.load(Ordering::SeqCst) == CANCEL_PENDING {
                // Nudged out of the call; the staged defaults already read
                // as cancelled.
                return;
            }
            continue;
        }
        req.stage(-1, err);
        return;
    }
}

struct CompletionGuard {
    req: Arc<Request>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        let req = &self.req;
        let cb = &req.cb;
        let q = &req.q;

        cb.ret_word().store(req.staged_ret(), Ordering::SeqCst);
        if req.running.swap(EXITED, Ordering::SeqCst) == CANCEL_PENDING {
            abi::futex_wake(&req.running, i32::MAX);
        }
        if cb.err_word().swap(req.staged_err(), Ordering::SeqCst) != libc::EINPROGRESS {
            abi::futex_wake(cb.err_word(), i32::MAX);
        }
        if LIST_WAKE.swap(0, Ordering::SeqCst) != 0 {
            abi::futex_wake(&LIST_WAKE, i32::MAX);
        }

        {
            let mut st = q.state.lock();
            st.unlink(req);
            q.cond.notify_all();
            queue::unref_locked(q, st);
        }

        deliver_event(cb.event());

        // Exit gate: cancellers register on `waiters` before nudging, so
        // the thread must not end while any registration is outstanding.
        loop {
            let w = req.waiters.load(Ordering::SeqCst);
            if w == 0 {
                break;
            }
            abi::futex_wait(&req.waiters, w, None);
        }
    }
}

pub(crate) fn deliver_event(event: &Notify) {
    match event {
        Notify::None => {}
        Notify::Signal { signo, value } => {
            let _ = abi::queue_completion_signal(*signo, *value);
        }
        Notify::Callback(c) => {
            if let Some(f) = c.func.lock().take() {
                f(c.value);
            }
        }
    }
}
