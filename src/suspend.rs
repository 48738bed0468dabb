// Copyright (C) 2023, Ava Labs, Inc. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! Blocking waits and batch submission, layered on the two futex words the
//! completion protocol publishes: the per-block status word and the global
//! list wake word.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::abi;
use crate::cb::{AioError, Aiocb, LioMode, Notify, Opcode, STATUS_WAITER};
use crate::worker::{self, LIST_WAKE};
use crate::{aio_read, aio_write};

/// Wait until at least one of `cbs` has completed. `Err(TimedOut)` maps to
/// the `EAGAIN` timeout of the POSIX interface.
pub fn aio_suspend(cbs: &[&Aiocb], timeout: Option<Duration>) -> Result<(), AioError> {
    if cbs.is_empty() {
        return Ok(());
    }
    let deadline = timeout.map(|t| Instant::now() + t);

    loop {
        if cbs.iter().any(|cb| cb.status() != libc::EINPROGRESS) {
            return Ok(());
        }

        let remaining = match deadline {
            Some(d) => {
                let now = Instant::now();
                if now >= d {
                    return Err(AioError::TimedOut);
                }
                Some(d - now)
            }
            None => None,
        };

        if let [cb] = cbs {
            // Flag our presence in the status word's high bit; completion
            // replaces the whole word and wakes on any non-EINPROGRESS
            // prior value.
            let marked = libc::EINPROGRESS | STATUS_WAITER;
            let _ = cb.err_word().compare_exchange(
                libc::EINPROGRESS,
                marked,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
            abi::futex_wait(cb.err_word(), marked, remaining);
        } else {
            let _ = LIST_WAKE.compare_exchange(0, -1, Ordering::SeqCst, Ordering::SeqCst);
            // Re-scan after arming; a completion in between already
            // consumed the word.
            if cbs.iter().any(|cb| cb.status() != libc::EINPROGRESS) {
                return Ok(());
            }
            abi::futex_wait(&LIST_WAKE, -1, remaining);
        }
    }
}

/// Submit every element per its list opcode. `Wait` blocks until the whole
/// batch has completed and reports `EIO` if any element failed; `NoWait`
/// returns after submission and delivers `event` once the batch drains.
pub fn lio_listio(mode: LioMode, list: &[Arc<Aiocb>], event: Notify) -> Result<(), AioError> {
    let mut submit_err: Option<AioError> = None;
    for cb in list {
        let res = match cb.lio_opcode() {
            Opcode::Read => aio_read(cb),
            Opcode::Write => aio_write(cb),
            Opcode::Nop => continue,
        };
        if let Err(e) = res {
            submit_err.get_or_insert(e);
        }
    }

    match mode {
        LioMode::Wait => {
            for cb in list {
                wait_complete(cb);
            }
            if let Some(e) = submit_err {
                return Err(e);
            }
            if list
                .iter()
                .any(|cb| cb.lio_opcode() != Opcode::Nop && cb.status() != 0)
            {
                return Err(AioError::ListIo);
            }
            Ok(())
        }
        LioMode::NoWait => {
            if !matches!(event, Notify::None) {
                let batch: Vec<Arc<Aiocb>> = list.to_vec();
                std::thread::spawn(move || {
                    for cb in &batch {
                        wait_complete(cb);
                    }
                    worker::deliver_event(&event);
                });
            }
            submit_err.map_or(Ok(()), Err)
        }
    }
}

/// Block until `cb` is no longer in progress. Elements that never made it
/// in flight (NOP, failed submission) fall straight through.
fn wait_complete(cb: &Aiocb) {
    let marked = libc::EINPROGRESS | STATUS_WAITER;
    loop {
        if cb.status() != libc::EINPROGRESS {
            return;
        }
        let _ = cb.err_word().compare_exchange(
            libc::EINPROGRESS,
            marked,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        abi::futex_wait(cb.err_word(), marked, None);
    }
}
