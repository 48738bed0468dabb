use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use paio::{
    aio_cancel, aio_error, aio_fsync, aio_read, aio_return, aio_write, AioCancelStat, AioError,
    AioFsyncMode, Aiocb,
};

fn pipe() -> (i32, i32) {
    let mut fds = [0i32; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    (fds[0], fds[1])
}

fn close(fd: i32) {
    unsafe { libc::close(fd) };
}

#[test]
fn cancel_pending_pipe_read() {
    let (rx, tx) = pipe();
    let cb = Arc::new(Aiocb::read_at(rx, 0, 16));
    aio_read(&cb).unwrap();
    assert_eq!(aio_error(&cb), libc::EINPROGRESS);

    // Give the worker a moment to block in read(2); the cancel must still
    // work whether or not it has.
    std::thread::sleep(Duration::from_millis(20));

    assert_eq!(aio_cancel(rx, Some(&cb)).unwrap(), AioCancelStat::Canceled);
    assert_eq!(aio_error(&cb), libc::ECANCELED);
    assert_eq!(aio_return(&cb), -1);

    close(rx);
    close(tx);
}

#[test]
fn cancel_whole_descriptor() {
    let (rx, tx) = pipe();
    let a = Arc::new(Aiocb::read_at(rx, 0, 4));
    let b = Arc::new(Aiocb::read_at(rx, 0, 4));
    aio_read(&a).unwrap();
    aio_read(&b).unwrap();

    assert_eq!(aio_cancel(rx, None).unwrap(), AioCancelStat::Canceled);
    assert_eq!(aio_error(&a), libc::ECANCELED);
    assert_eq!(aio_error(&b), libc::ECANCELED);

    close(rx);
    close(tx);
}

#[test]
fn cancel_is_selective_with_a_block() {
    let (rx, tx) = pipe();
    let keep = Arc::new(Aiocb::read_at(rx, 0, 4));
    let drop_ = Arc::new(Aiocb::read_at(rx, 0, 4));
    aio_read(&keep).unwrap();
    aio_read(&drop_).unwrap();

    assert_eq!(
        aio_cancel(rx, Some(&drop_)).unwrap(),
        AioCancelStat::Canceled
    );
    assert_eq!(aio_error(&drop_), libc::ECANCELED);
    assert_eq!(aio_error(&keep), libc::EINPROGRESS);

    assert_eq!(aio_cancel(rx, None).unwrap(), AioCancelStat::Canceled);
    close(rx);
    close(tx);
}

#[test]
fn cancel_without_outstanding_requests_is_all_done() {
    // No queue was ever created for this descriptor number.
    assert_eq!(aio_cancel(873, None).unwrap(), AioCancelStat::AllDone);
}

#[test]
fn cancel_after_completion_is_all_done() {
    let mut file = tempfile::tempfile().unwrap();
    std::io::Write::write_all(&mut file, b"data").unwrap();
    let fd = file.as_raw_fd();

    let cb = Arc::new(Aiocb::read_at(fd, 0, 4));
    aio_read(&cb).unwrap();
    paio::aio_suspend(&[cb.as_ref()], Some(Duration::from_secs(10))).unwrap();

    assert_eq!(aio_cancel(fd, Some(&cb)).unwrap(), AioCancelStat::AllDone);
    assert_eq!(aio_error(&cb), 0);
    assert_eq!(aio_return(&cb), 4);
}

#[test]
fn cancel_rejects_descriptor_mismatch() {
    let (rx, tx) = pipe();
    let cb = Arc::new(Aiocb::read_at(rx, 0, 4));
    assert_eq!(aio_cancel(tx, Some(&cb)).unwrap_err(), AioError::Invalid);
    close(rx);
    close(tx);
}

#[test]
fn cancel_rejects_negative_descriptor() {
    assert_eq!(aio_cancel(-3, None).unwrap_err(), AioError::BadDescriptor);
}

#[test]
fn submit_on_bad_descriptor() {
    let cb = Arc::new(Aiocb::read_at(-1, 0, 4));
    assert_eq!(aio_read(&cb).unwrap_err(), AioError::BadDescriptor);
    assert_eq!(aio_error(&cb), libc::EBADF);
    assert_eq!(aio_return(&cb), -1);
}

#[test]
fn submit_on_closed_descriptor() {
    let (rx, tx) = pipe();
    close(rx);
    close(tx);
    let cb = Arc::new(Aiocb::read_at(rx, 0, 4));
    assert_eq!(aio_read(&cb).unwrap_err(), AioError::BadDescriptor);
    assert_eq!(aio_error(&cb), libc::EBADF);
}

#[test]
fn close_hook_flushes_descriptor() {
    let (rx, tx) = pipe();
    let cb = Arc::new(Aiocb::read_at(rx, 0, 4));
    aio_read(&cb).unwrap();

    assert_eq!(paio::cancel_on_close(rx), rx);
    assert_eq!(aio_error(&cb), libc::ECANCELED);

    close(rx);
    close(tx);
}

// A write on an already-full pipe blocks the worker in write(2), which
// also parks every operation sequenced behind it.
fn stuck_pipe_write(tx: i32) -> Arc<Aiocb> {
    let flags = unsafe { libc::fcntl(tx, libc::F_GETFL) };
    unsafe { libc::fcntl(tx, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    let chunk = [0u8; 4096];
    while unsafe { libc::write(tx, chunk.as_ptr().cast(), chunk.len()) } > 0 {}
    unsafe { libc::fcntl(tx, libc::F_SETFL, flags) };

    let w = Arc::new(Aiocb::write_at(tx, 0, b"stuck".to_vec().into_boxed_slice()));
    aio_write(&w).unwrap();
    w
}

#[test]
fn cancelling_blocked_write_releases_sequencing_successor() {
    let (rx, tx) = pipe();
    let w = stuck_pipe_write(tx);

    let s = Arc::new(Aiocb::sync(tx));
    aio_fsync(AioFsyncMode::Sync, &s).unwrap();
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(aio_error(&s), libc::EINPROGRESS);

    assert_eq!(aio_cancel(tx, Some(&w)).unwrap(), AioCancelStat::Canceled);
    assert_eq!(aio_error(&w), libc::ECANCELED);

    // The sync must now run; fsync on a pipe fails, but it completes.
    paio::aio_suspend(&[s.as_ref()], Some(Duration::from_secs(10))).unwrap();
    assert_ne!(aio_error(&s), libc::EINPROGRESS);
    assert_ne!(aio_error(&s), libc::ECANCELED);

    close(rx);
    close(tx);
}

#[test]
fn cancelling_a_sequencing_waiter() {
    let (rx, tx) = pipe();
    let w = stuck_pipe_write(tx);

    let s = Arc::new(Aiocb::sync(tx));
    aio_fsync(AioFsyncMode::Sync, &s).unwrap();
    std::thread::sleep(Duration::from_millis(20));

    // The sync is parked on the sequencing rule; cancel it directly.
    assert_eq!(aio_cancel(tx, Some(&s)).unwrap(), AioCancelStat::Canceled);
    assert_eq!(aio_error(&s), libc::ECANCELED);
    assert_eq!(aio_return(&s), -1);
    assert_eq!(aio_error(&w), libc::EINPROGRESS);

    assert_eq!(aio_cancel(tx, None).unwrap(), AioCancelStat::Canceled);
    close(rx);
    close(tx);
}
