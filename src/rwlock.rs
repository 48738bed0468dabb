// Copyright (C) 2023, Ava Labs, Inc. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! Futex-backed readers-writer lock for the descriptor map.
//!
//! The map lock has one requirement an off-the-shelf lock cannot meet: after
//! `fork()` the child inherits a lock word in an arbitrary state and must be
//! able to re-initialize it in place, without ever unparking threads that no
//! longer exist. All state therefore lives in two plain atomics.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicI32, Ordering};

use crate::abi;

const WRITER: i32 = -1;

/// `state` is 0 when free, a reader count when read-held, `WRITER` when
/// write-held. `waiters` counts threads parked on the state word.
pub struct RwFutex<T> {
    state: AtomicI32,
    waiters: AtomicI32,
    data: UnsafeCell<T>,
}

// Safety: access to `data` is mediated by the lock protocol below; the raw
// entry points document their single-threaded-child requirements.
unsafe impl<T: Send> Send for RwFutex<T> {}
unsafe impl<T: Send + Sync> Sync for RwFutex<T> {}

impl<T> RwFutex<T> {
    pub const fn new(data: T) -> Self {
        RwFutex {
            state: AtomicI32::new(0),
            waiters: AtomicI32::new(0),
            data: UnsafeCell::new(data),
        }
    }

    pub fn read(&self) -> ReadGuard<'_, T> {
        self.lock_shared();
        ReadGuard { lock: self }
    }

    pub fn write(&self) -> WriteGuard<'_, T> {
        loop {
            match self
                .state
                .compare_exchange(0, WRITER, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return WriteGuard { lock: self },
                Err(0) => continue,
                Err(s) => self.park(s),
            }
        }
    }

    /// Take the read side without a guard; released by `unlock_shared_raw`.
    /// Used around `fork()`, where the release happens in a different
    /// process image than the acquire.
    pub fn lock_shared_raw(&self) {
        self.lock_shared();
    }

    /// Single attempt at the read side, for the post-fork child probing
    /// whether the parent held the lock through an uncooperative fork.
    pub fn try_lock_shared_raw(&self) -> bool {
        loop {
            let s = self.state.load(Ordering::Acquire);
            if s < 0 {
                return false;
            }
            if self
                .state
                .compare_exchange(s, s + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Safety: the caller must hold one read acquisition obtained through
    /// `lock_shared_raw` or `try_lock_shared_raw`.
    pub unsafe fn unlock_shared_raw(&self) {
        self.unlock_shared();
    }

    /// Safety: bypasses the lock entirely. Only sound where no other thread
    /// can touch the data, i.e. in the single-threaded post-fork child.
    pub unsafe fn data_ptr(&self) -> *mut T {
        self.data.get()
    }

    /// Safety: single-threaded post-fork child only. Drops every holder the
    /// parent's threads had; their process image owns the originals.
    pub unsafe fn reset(&self) {
        self.state.store(0, Ordering::SeqCst);
        self.waiters.store(0, Ordering::SeqCst);
    }

    fn lock_shared(&self) {
        loop {
            let s = self.state.load(Ordering::Acquire);
            if s < 0 {
                self.park(s);
                continue;
            }
            if self
                .state
                .compare_exchange_weak(s, s + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    fn unlock_shared(&self) {
        if self.state.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.wake_parked();
        }
    }

    fn unlock_exclusive(&self) {
        self.state.store(0, Ordering::Release);
        self.wake_parked();
    }

    fn park(&self, observed: i32) {
        self.waiters.fetch_add(1, Ordering::SeqCst);
        abi::futex_wait(&self.state, observed, None);
        self.waiters.fetch_sub(1, Ordering::SeqCst);
    }

    fn wake_parked(&self) {
        if self.waiters.load(Ordering::SeqCst) > 0 {
            abi::futex_wake(&self.state, i32::MAX);
        }
    }
}

pub struct ReadGuard<'a, T> {
    lock: &'a RwFutex<T>,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock_shared();
    }
}

pub struct WriteGuard<'a, T> {
    lock: &'a RwFutex<T>,
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock_exclusive();
    }
}
