// Copyright (C) 2023, Ava Labs, Inc. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! Signal plumbing: the block-everything guard taken around queue and map
//! mutations, and the SIGURG nudge used to kick a worker out of a blocking
//! syscall when its request is cancelled.
//!
//! Queue locks are only taken with all signals blocked because cancellation
//! runs on the descriptor-close path, which has to stay usable from signal
//! handlers. Workers are created while the submitter holds the full mask, so
//! they start with everything blocked and unblock only SIGURG.

use std::sync::Once;

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};

/// RAII full signal mask; restores the previous mask on drop.
pub(crate) struct BlockAllGuard {
    old: SigSet,
}

impl BlockAllGuard {
    pub fn new() -> Self {
        let mut old = SigSet::empty();
        signal::pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&SigSet::all()), Some(&mut old))
            .expect("pthread_sigmask");
        BlockAllGuard { old }
    }
}

impl Drop for BlockAllGuard {
    fn drop(&mut self) {
        let _ = signal::pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.old), None);
    }
}

static NUDGE_INIT: Once = Once::new();

extern "C" fn nudge_handler(_: libc::c_int) {
    // The only job of the handler is to exist without SA_RESTART, so a
    // nudged worker's syscall fails with EINTR.
}

/// Process-wide one-time installation of the nudge handler. Called before
/// the first worker is created.
pub(crate) fn install_nudge_handler() {
    NUDGE_INIT.call_once(|| {
        let sa = SigAction::new(
            SigHandler::Handler(nudge_handler),
            SaFlags::empty(),
            SigSet::all(),
        );
        unsafe {
            let _ = signal::sigaction(Signal::SIGURG, &sa);
        }
    });
}

/// Open the nudge window on the calling worker thread; everything else
/// stays blocked for its lifetime.
pub(crate) fn unblock_nudge() {
    let mut set = SigSet::empty();
    set.add(Signal::SIGURG);
    let _ = signal::pthread_sigmask(SigmaskHow::SIG_UNBLOCK, Some(&set), None);
}

/// Interrupt `tid`'s in-flight syscall. The caller must hold a waiter
/// registration on the target request, which pins the worker thread.
pub(crate) fn nudge(tid: libc::pthread_t) {
    unsafe {
        libc::pthread_kill(tid, libc::SIGURG);
    }
}
