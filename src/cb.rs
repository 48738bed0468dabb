// Copyright (C) 2023, Ava Labs, Inc. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! The caller-visible control block and its satellite types.

use std::cell::UnsafeCell;
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, AtomicIsize, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum AioError {
    /// The descriptor is not open (`EBADF`).
    #[error("bad file descriptor")]
    BadDescriptor,
    /// Out of threads or bookkeeping memory (`EAGAIN`).
    #[error("insufficient resources to queue the request")]
    Resource,
    /// Malformed request: descriptor mismatch on cancel, or a control block
    /// that is already in flight (`EINVAL`).
    #[error("invalid request")]
    Invalid,
    /// One or more elements of a list submission failed (`EIO`).
    #[error("list operation had failed elements")]
    ListIo,
    /// `aio_suspend` timed out (`EAGAIN`).
    #[error("timed out waiting for completion")]
    TimedOut,
}

impl AioError {
    pub fn errno(self) -> i32 {
        match self {
            AioError::BadDescriptor => libc::EBADF,
            AioError::Resource => libc::EAGAIN,
            AioError::Invalid => libc::EINVAL,
            AioError::ListIo => libc::EIO,
            AioError::TimedOut => libc::EAGAIN,
        }
    }
}

/// List opcode stored in a control block, consumed by `lio_listio`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum Opcode {
    Read = 0,
    Write = 1,
    Nop = 2,
}

/// Whether `aio_fsync` flushes data and metadata or data only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AioFsyncMode {
    Sync,
    DataSync,
}

/// Result of `aio_cancel`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum AioCancelStat {
    Canceled = 0,
    NotCanceled = 1,
    AllDone = 2,
}

/// Blocking behavior of `lio_listio`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LioMode {
    Wait,
    NoWait,
}

/// Internal operation actually performed by a worker. Sync flavors arrive
/// through `aio_fsync`, not through the list opcode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Op {
    Read,
    Write,
    Sync,
    DataSync,
}

/// How completion is reported beyond the status words.
pub enum Notify {
    None,
    /// Queue a realtime signal carrying `value`.
    Signal { signo: i32, value: usize },
    /// Run a callback with `value` on the worker thread.
    Callback(CallbackNotify),
}

pub struct CallbackNotify {
    pub(crate) func: Mutex<Option<Box<dyn FnOnce(usize) + Send>>>,
    pub(crate) value: usize,
    pub(crate) stack_size: Option<usize>,
}

impl Notify {
    pub fn signal(signo: i32, value: usize) -> Self {
        Notify::Signal { signo, value }
    }

    pub fn callback<F>(f: F, value: usize) -> Self
    where
        F: FnOnce(usize) + Send + 'static,
    {
        Notify::Callback(CallbackNotify {
            func: Mutex::new(Some(Box::new(f))),
            value,
            stack_size: None,
        })
    }
}

/// High bit of the status word: set by a suspended waiter so the completion
/// protocol knows to issue a futex wake. Status queries mask it off.
pub(crate) const STATUS_WAITER: i32 = i32::MIN;
pub(crate) const STATUS_MASK: i32 = i32::MAX;

/// One asynchronous request. Shared as `Arc<Aiocb>` between the caller and
/// the worker servicing it.
///
/// The status word `err` holds `EINPROGRESS` while a request is outstanding,
/// then the final error code (0 on success, `ECANCELED` after a successful
/// cancel). `ret` holds the I/O return value and is final once `err` leaves
/// `EINPROGRESS`. Both double as futex words for the wait primitives.
pub struct Aiocb {
    fd: RawFd,
    lio_opcode: Opcode,
    priority: i32,
    nbytes: usize,
    offset: i64,
    event: Notify,
    buf: UnsafeCell<Box<[u8]>>,
    err: AtomicI32,
    ret: AtomicIsize,
}

// Safety: `buf` is written only by the worker thread while `err` is
// EINPROGRESS; `buffer()` refuses access during that window, and the
// release swap on `err` in the completion protocol orders the last buffer
// write before any caller read. Everything else is atomic or immutable.
unsafe impl Send for Aiocb {}
unsafe impl Sync for Aiocb {}

impl Aiocb {
    /// Read `len` bytes at `offset` into a buffer owned by the block.
    pub fn read_at(fd: RawFd, offset: i64, len: usize) -> Self {
        Self::new(fd, Opcode::Read, offset, vec![0; len].into_boxed_slice())
    }

    /// Write `data` at `offset` (at end of file for append descriptors).
    pub fn write_at(fd: RawFd, offset: i64, data: Box<[u8]>) -> Self {
        Self::new(fd, Opcode::Write, offset, data)
    }

    /// Buffer-less block for `aio_fsync`.
    pub fn sync(fd: RawFd) -> Self {
        Self::new(fd, Opcode::Nop, 0, Box::new([]))
    }

    fn new(fd: RawFd, lio_opcode: Opcode, offset: i64, data: Box<[u8]>) -> Self {
        Aiocb {
            fd,
            lio_opcode,
            priority: 0,
            nbytes: data.len(),
            offset,
            event: Notify::None,
            buf: UnsafeCell::new(data),
            err: AtomicI32::new(0),
            ret: AtomicIsize::new(0),
        }
    }

    /// Request priority. Stored for interface completeness; scheduling is
    /// one detached thread per request with no priority ordering.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn notify(mut self, event: Notify) -> Self {
        self.event = event;
        self
    }

    pub fn notify_signal(mut self, signo: i32, value: usize) -> Self {
        self.event = Notify::signal(signo, value);
        self
    }

    pub fn notify_callback<F>(mut self, f: F, value: usize) -> Self
    where
        F: FnOnce(usize) + Send + 'static,
    {
        self.event = Notify::callback(f, value);
        self
    }

    /// Stack size for the worker when a callback notification is set,
    /// standing in for caller-supplied thread attributes.
    pub fn callback_stack(mut self, stack_size: usize) -> Self {
        if let Notify::Callback(cb) = &mut self.event {
            cb.stack_size = Some(stack_size);
        }
        self
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn nbytes(&self) -> usize {
        self.nbytes
    }

    pub fn lio_opcode(&self) -> Opcode {
        self.lio_opcode
    }

    /// The data buffer, once no request is in flight on this block.
    pub fn buffer(&self) -> Option<&[u8]> {
        if self.status() == libc::EINPROGRESS {
            return None;
        }
        // Safety: no worker mutates the buffer outside the EINPROGRESS
        // window just checked.
        Some(unsafe { &**self.buf.get() })
    }

    /// Status word with the waiter bit dropped.
    pub(crate) fn status(&self) -> i32 {
        self.err.load(Ordering::Acquire) & STATUS_MASK
    }

    pub(crate) fn event(&self) -> &Notify {
        &self.event
    }

    pub(crate) fn err_word(&self) -> &AtomicI32 {
        &self.err
    }

    pub(crate) fn ret_word(&self) -> &AtomicIsize {
        &self.ret
    }

    pub(crate) fn buf_ptr(&self) -> *mut u8 {
        unsafe { (*self.buf.get()).as_mut_ptr() }
    }

    /// Claim the block for a new submission. Fails if a request is already
    /// outstanding, or if two submitters race for the same block.
    pub(crate) fn begin(&self) -> Result<(), AioError> {
        let prev = self.err.load(Ordering::SeqCst);
        if prev & STATUS_MASK == libc::EINPROGRESS {
            return Err(AioError::Invalid);
        }
        self.err
            .compare_exchange(prev, libc::EINPROGRESS, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| AioError::Invalid)
    }

    /// Terminal stamp for synchronous submission failures.
    pub(crate) fn stamp(&self, ret: isize, err: i32) {
        self.ret.store(ret, Ordering::SeqCst);
        self.err.store(err, Ordering::SeqCst);
    }
}

impl fmt::Debug for Aiocb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aiocb")
            .field("fd", &self.fd)
            .field("lio_opcode", &self.lio_opcode)
            .field("priority", &self.priority)
            .field("nbytes", &self.nbytes)
            .field("offset", &self.offset)
            .field("err", &self.err.load(Ordering::Relaxed))
            .field("ret", &self.ret.load(Ordering::Relaxed))
            .finish()
    }
}
