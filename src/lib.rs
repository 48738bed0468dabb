// Copyright (C) 2023, Ava Labs, Inc. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! Thread-backed POSIX-style asynchronous file I/O.
//!
//! Each submitted request runs on its own small detached thread against the
//! caller's file descriptor. Completion is observed by polling
//! [`aio_error`], blocking in [`aio_suspend`], or through a signal or
//! callback notification attached to the control block. Requests can be
//! cancelled individually or per descriptor, including from the
//! descriptor-close path.
//!
//! Writes to append-mode descriptors and both fsync flavors are sequenced
//! after every write submitted before them on the same descriptor. No other
//! ordering is provided; in particular reads are never ordered against
//! writes.
//!
//! # Example
//!
//! ```
//! use std::os::unix::io::AsRawFd;
//! use std::sync::Arc;
//!
//! let path = std::env::temp_dir().join(format!("paio-doc-{}", std::process::id()));
//! std::fs::write(&path, b"hello world").unwrap();
//! let file = std::fs::File::open(&path).unwrap();
//!
//! let cb = Arc::new(paio::Aiocb::read_at(file.as_raw_fd(), 0, 5));
//! paio::aio_read(&cb).unwrap();
//! paio::aio_suspend(&[&cb], None).unwrap();
//!
//! assert_eq!(paio::aio_error(&cb), 0);
//! assert_eq!(paio::aio_return(&cb), 5);
//! assert_eq!(cb.buffer().unwrap(), b"hello");
//! # std::fs::remove_file(&path).ok();
//! ```

mod abi;
mod cancel;
mod cb;
mod fork;
mod map;
mod queue;
mod rwlock;
mod signal;
mod suspend;
mod worker;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam_channel::bounded;
use log::trace;

pub use cancel::{aio_cancel, cancel_on_close};
pub use cb::{AioCancelStat, AioError, AioFsyncMode, Aiocb, CallbackNotify, LioMode, Notify, Opcode};
pub use fork::{atfork_child, atfork_parent, atfork_prepare};
pub use suspend::{aio_suspend, lio_listio};

use cb::Op;
use signal::BlockAllGuard;

/// Queue an asynchronous read described by `cb`.
pub fn aio_read(cb: &Arc<Aiocb>) -> Result<(), AioError> {
    submit(cb, Op::Read)
}

/// Queue an asynchronous write described by `cb`.
pub fn aio_write(cb: &Arc<Aiocb>) -> Result<(), AioError> {
    submit(cb, Op::Write)
}

/// Queue an asynchronous `fsync`/`fdatasync` of `cb`'s descriptor, ordered
/// after all writes already queued on it.
pub fn aio_fsync(mode: AioFsyncMode, cb: &Arc<Aiocb>) -> Result<(), AioError> {
    let op = match mode {
        AioFsyncMode::Sync => Op::Sync,
        AioFsyncMode::DataSync => Op::DataSync,
    };
    submit(cb, op)
}

/// Status of the request on `cb`: `EINPROGRESS` while outstanding, then 0
/// or the error code of the underlying call (`ECANCELED` after a cancel).
pub fn aio_error(cb: &Aiocb) -> i32 {
    cb.status()
}

/// Return value of the completed request on `cb`.
pub fn aio_return(cb: &Aiocb) -> isize {
    cb.ret_word().load(Ordering::SeqCst)
}

/// Hand `cb` to a fresh worker. On success the request is registered on
/// its descriptor's queue and the status word reads `EINPROGRESS`; on
/// failure the status words carry the terminal error.
fn submit(cb: &Arc<Aiocb>, op: Op) -> Result<(), AioError> {
    cb.begin()?;

    let q = match map::get_queue(cb.fd(), true) {
        Ok(Some(q)) => q,
        Ok(None) => {
            cb.stamp(-1, libc::EAGAIN);
            return Err(AioError::Resource);
        }
        Err(e) => {
            cb.stamp(-1, e.errno());
            return Err(e);
        }
    };

    let (reg_s, reg_r) = bounded(1);
    let args = worker::WorkerArgs {
        cb: cb.clone(),
        q: q.clone(),
        op,
        reg: reg_s,
    };

    // Workers inherit the creating thread's mask; blocking everything here
    // is what lets them run with signals off for their whole lifetime.
    let mask = BlockAllGuard::new();
    if let Err(e) = worker::spawn(args) {
        let st = q.state.lock();
        queue::unref_locked(&q, st);
        drop(mask);
        trace!("worker spawn for fd {} failed: {e}", cb.fd());
        cb.stamp(-1, libc::EAGAIN);
        return Err(AioError::Resource);
    }
    drop(mask);

    // Registration handshake. Once the worker has linked its request the
    // block's in-flight state belongs to it.
    let _ = reg_r.recv();
    Ok(())
}
