// Copyright (C) 2023, Ava Labs, Inc. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! Fork integration. The process fork machinery calls these three hooks in
//! order; they keep the descriptor map coherent on both sides of the fork.

use std::sync::atomic::Ordering;

use log::debug;

use crate::map::{FD_COUNT, MAP};

/// Immediately before `fork()`: hold the read side of the map lock across
/// the syscall so the child never snapshots a half-mutated structure.
pub fn atfork_prepare() {
    MAP.lock_shared_raw();
}

/// In the parent, after `fork()` returns.
pub fn atfork_parent() {
    unsafe { MAP.unlock_shared_raw() };
}

/// In the child, after `fork()` returns. Queues inherited from the parent
/// carry lock and thread state that means nothing here, so they are leaked
/// on purpose rather than torn down; only the map skeleton and its lock are
/// made usable again.
pub fn atfork_child() {
    FD_COUNT.store(0, Ordering::SeqCst);

    if !MAP.try_lock_shared_raw() {
        // A writer held the lock, so the fork bypassed the cooperative
        // hooks. Nothing below the root can be trusted; abandon all of it
        // so the close path finds an empty map.
        unsafe { (*MAP.data_ptr()).forget_root() };
        return;
    }

    // Safety: the child has exactly one thread, so mutating through the
    // data pointer under a read hold cannot race.
    unsafe { (*MAP.data_ptr()).forget_leaves() };

    // Reinitialize rather than unlock: the parent may have held more than
    // the one read acquisition taken in the prepare hook.
    unsafe { MAP.reset() };
    debug!("descriptor map reset in fork child");
}
