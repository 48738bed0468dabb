// Copyright (C) 2023, Ava Labs, Inc. All rights reserved.
// See the file LICENSE.md for licensing terms.

//! Raw kernel interfaces with no portable wrapper: futex, queued signal
//! injection, and the auxv probe for the worker stack floor.

#![allow(dead_code)]

use std::ptr;
use std::sync::atomic::AtomicI32;
use std::time::Duration;

use libc::{c_int, c_long};

/// `si_code` for completions of asynchronous I/O, from
/// `asm-generic/siginfo.h`.
pub const SI_ASYNCIO: c_int = -4;

// Not exposed by every libc build; the value is ABI on all Linux ports.
const AT_MINSIGSTKSZ: libc::c_ulong = 51;

fn errno() -> i32 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EINVAL)
}

/// Block until `*word != expected` or the timeout elapses. Returns 0 on a
/// wakeup, otherwise the errno from the futex call (`EAGAIN` when the word
/// already changed, `ETIMEDOUT`, `EINTR`).
pub fn futex_wait(word: &AtomicI32, expected: i32, timeout: Option<Duration>) -> i32 {
    let ts = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: i64::from(d.subsec_nanos()) as _,
    });
    let ts_ptr = ts
        .as_ref()
        .map_or(ptr::null(), |t| t as *const libc::timespec);
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            expected,
            ts_ptr,
            ptr::null::<u32>(),
            0 as c_long,
        )
    };
    if rc == 0 {
        0
    } else {
        errno()
    }
}

/// Wake up to `count` waiters parked on `word`.
pub fn futex_wake(word: &AtomicI32, count: i32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            count,
            ptr::null::<libc::timespec>(),
            ptr::null::<u32>(),
            0 as c_long,
        );
    }
}

// Layout of the rt member of siginfo, from asm-generic/siginfo.h. The kernel
// copies SI_MAX_SIZE (128) bytes, hence the tail padding. 64-bit ports only;
// 32-bit drops the alignment pad after si_code.
#[repr(C)]
struct RawSigInfo {
    si_signo: c_int,
    si_errno: c_int,
    si_code: c_int,
    _align: c_int,
    si_pid: libc::pid_t,
    si_uid: libc::uid_t,
    si_value: usize,
    _pad: [u8; 96],
}

/// Queue `signo` to the calling process with an `SI_ASYNCIO` cause and the
/// supplied payload, the way a kernel AIO completion would be reported.
pub fn queue_completion_signal(signo: c_int, value: usize) -> std::io::Result<()> {
    let si = RawSigInfo {
        si_signo: signo,
        si_errno: 0,
        si_code: SI_ASYNCIO,
        _align: 0,
        si_pid: unsafe { libc::getpid() },
        si_uid: unsafe { libc::getuid() },
        si_value: value,
        _pad: [0; 96],
    };
    let rc = unsafe {
        libc::syscall(
            libc::SYS_rt_sigqueueinfo,
            si.si_pid,
            signo,
            &si as *const RawSigInfo,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Stack floor for I/O worker threads: the kernel's minimum signal stack
/// with a little headroom for the worker body itself.
pub fn min_worker_stack() -> usize {
    let aux = unsafe { libc::getauxval(AT_MINSIGSTKSZ) } as usize;
    std::cmp::max(libc::MINSIGSTKSZ + 2048, aux + 512)
}
