// Copyright (C) 2023, Ava Labs, Inc. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! Cancellation of in-flight requests, one descriptor at a time.
//!
//! Cancelling transitions the target's `running` word to cancel-pending,
//! then drives the worker out of whatever it is blocked on: the condvar
//! broadcast covers sequencing sleepers, the SIGURG nudge covers blocking
//! syscalls. The canceller then waits on the `running` futex until the
//! worker's cleanup has published, re-nudging on an interval because a
//! nudge that lands before the worker enters the syscall is absorbed by
//! the handler. All of this runs with signals blocked so the close path
//! stays usable from restricted contexts.

use std::os::unix::io::RawFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use log::debug;

use crate::abi;
use crate::cb::{AioCancelStat, AioError, Aiocb};
use crate::map::{self, FD_COUNT};
use crate::queue::{Request, CANCEL_PENDING, EXITED, RUNNING};
use crate::signal::{self, BlockAllGuard};

const NUDGE_INTERVAL: Duration = Duration::from_millis(2);

/// Cancel all requests on `fd`, or just `cb`'s request when one is given.
pub fn aio_cancel(fd: RawFd, cb: Option<&Arc<Aiocb>>) -> Result<AioCancelStat, AioError> {
    if let Some(cb) = cb {
        if cb.fd() != fd {
            return Err(AioError::Invalid);
        }
    }

    let _mask = BlockAllGuard::new();

    let q = match map::get_queue(fd, false)? {
        Some(q) => q,
        None => return Ok(AioCancelStat::AllDone),
    };

    let mut targets: Vec<Arc<Request>> = Vec::new();
    {
        let st = q.state.lock();
        for r in st.requests() {
            if let Some(cb) = cb {
                if !Arc::ptr_eq(cb, &r.cb) {
                    continue;
                }
            }
            match r.running.compare_exchange(
                RUNNING,
                CANCEL_PENDING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                // Marked by us, or by a racing canceller we join.
                Ok(_) | Err(CANCEL_PENDING) => {
                    r.waiters.fetch_add(1, Ordering::SeqCst);
                    targets.push(r.clone());
                }
                // Already exited; its completion is not a cancellation.
                Err(_) => {}
            }
        }
        q.cond.notify_all();
    }

    if !targets.is_empty() {
        debug!("cancelling {} request(s) on fd {}", targets.len(), fd);
    }

    let mut result = AioCancelStat::AllDone;
    for r in targets {
        loop {
            if r.running.load(Ordering::SeqCst) == EXITED {
                break;
            }
            signal::nudge(r.tid);
            abi::futex_wait(&r.running, CANCEL_PENDING, Some(NUDGE_INTERVAL));
        }
        r.waiters.fetch_sub(1, Ordering::SeqCst);
        abi::futex_wake(&r.waiters, i32::MAX);
        if r.staged_err() == libc::ECANCELED {
            result = AioCancelStat::Canceled;
        }
    }

    Ok(result)
}

/// Descriptor-close integration: cancel whatever is still in flight on `fd`
/// before the caller closes it. Returns the descriptor unchanged.
pub fn cancel_on_close(fd: RawFd) -> RawFd {
    if FD_COUNT.load(Ordering::SeqCst) != 0 {
        let _ = aio_cancel(fd, None);
    }
    fd
}
