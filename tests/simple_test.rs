use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use paio::{
    aio_error, aio_fsync, aio_read, aio_return, aio_suspend, aio_write, AioFsyncMode, Aiocb,
};

fn wait(cb: &Arc<Aiocb>) {
    aio_suspend(&[cb.as_ref()], Some(Duration::from_secs(10))).unwrap();
    assert_ne!(aio_error(cb), libc::EINPROGRESS);
}

#[test]
fn simple_read() {
    let mut file = tempfile::tempfile().unwrap();
    file.write_all(b"HELLO").unwrap();

    let cb = Arc::new(Aiocb::read_at(file.as_raw_fd(), 0, 5));
    aio_read(&cb).unwrap();
    wait(&cb);

    assert_eq!(aio_error(&cb), 0);
    assert_eq!(aio_return(&cb), 5);
    assert_eq!(cb.buffer().unwrap(), b"HELLO");
}

#[test]
fn simple_write() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let cb = Arc::new(Aiocb::write_at(
        file.as_file().as_raw_fd(),
        0,
        b"written async".to_vec().into_boxed_slice(),
    ));
    aio_write(&cb).unwrap();
    wait(&cb);

    assert_eq!(aio_error(&cb), 0);
    assert_eq!(aio_return(&cb), 13);
    assert_eq!(std::fs::read(file.path()).unwrap(), b"written async");
}

#[test]
fn read_at_offset() {
    let mut file = tempfile::tempfile().unwrap();
    file.write_all(b"0123456789").unwrap();

    let cb = Arc::new(Aiocb::read_at(file.as_raw_fd(), 4, 3));
    aio_read(&cb).unwrap();
    wait(&cb);

    assert_eq!(aio_return(&cb), 3);
    assert_eq!(cb.buffer().unwrap(), b"456");
}

#[test]
fn read_past_eof_returns_zero() {
    let mut file = tempfile::tempfile().unwrap();
    file.write_all(b"x").unwrap();

    let cb = Arc::new(Aiocb::read_at(file.as_raw_fd(), 100, 8));
    aio_read(&cb).unwrap();
    wait(&cb);

    assert_eq!(aio_error(&cb), 0);
    assert_eq!(aio_return(&cb), 0);
}

#[test]
fn buffer_hidden_while_in_flight() {
    let (rx, _tx) = pipe();
    let cb = Arc::new(Aiocb::read_at(rx, 0, 4));
    aio_read(&cb).unwrap();

    assert_eq!(aio_error(&cb), libc::EINPROGRESS);
    assert!(cb.buffer().is_none());

    paio::aio_cancel(rx, Some(&cb)).unwrap();
    assert!(cb.buffer().is_some());
    close(rx);
}

#[test]
fn append_writes_keep_submission_order() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let appender = std::fs::OpenOptions::new()
        .append(true)
        .open(file.path())
        .unwrap();
    let fd = appender.as_raw_fd();

    let a = Arc::new(Aiocb::write_at(fd, 0, b"AAA".to_vec().into_boxed_slice()));
    let b = Arc::new(Aiocb::write_at(fd, 0, b"BBB".to_vec().into_boxed_slice()));
    aio_write(&a).unwrap();
    aio_write(&b).unwrap();
    wait(&a);
    wait(&b);

    assert_eq!(aio_return(&a), 3);
    assert_eq!(aio_return(&b), 3);
    assert_eq!(std::fs::read(file.path()).unwrap(), b"AAABBB");
}

#[test]
fn fsync_runs_after_queued_writes() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let fd = file.as_file().as_raw_fd();

    let w = Arc::new(Aiocb::write_at(fd, 0, b"durable".to_vec().into_boxed_slice()));
    let s = Arc::new(Aiocb::sync(fd));
    aio_write(&w).unwrap();
    aio_fsync(AioFsyncMode::Sync, &s).unwrap();

    // Waiting on the sync alone is enough: it is sequenced after the write.
    wait(&s);
    assert_eq!(aio_error(&s), 0);
    assert_ne!(aio_error(&w), libc::EINPROGRESS);
    assert_eq!(aio_error(&w), 0);
    assert_eq!(std::fs::read(file.path()).unwrap(), b"durable");
}

#[test]
fn fdatasync_flavor_completes() {
    let file = tempfile::tempfile().unwrap();
    let s = Arc::new(Aiocb::sync(file.as_raw_fd()));
    aio_fsync(AioFsyncMode::DataSync, &s).unwrap();
    wait(&s);
    assert_eq!(aio_error(&s), 0);
}

#[test]
fn pipe_read_uses_plain_read() {
    let (rx, tx) = pipe();
    let payload = b"over the pipe";
    assert_eq!(
        unsafe { libc::write(tx, payload.as_ptr().cast(), payload.len()) },
        payload.len() as isize
    );

    let cb = Arc::new(Aiocb::read_at(rx, 0, payload.len()));
    aio_read(&cb).unwrap();
    wait(&cb);

    assert_eq!(aio_return(&cb), payload.len() as isize);
    assert_eq!(cb.buffer().unwrap(), payload);
    close(rx);
    close(tx);
}

#[test]
fn suspend_times_out_on_stuck_request() {
    let (rx, _tx) = pipe();
    let cb = Arc::new(Aiocb::read_at(rx, 0, 1));
    aio_read(&cb).unwrap();

    let err = aio_suspend(&[cb.as_ref()], Some(Duration::from_millis(50))).unwrap_err();
    assert_eq!(err, paio::AioError::TimedOut);
    assert_eq!(err.errno(), libc::EAGAIN);

    paio::aio_cancel(rx, None).unwrap();
    close(rx);
}

#[test]
fn suspend_on_list_returns_on_first_completion() {
    let (rx, _tx) = pipe();
    let stuck = Arc::new(Aiocb::read_at(rx, 0, 1));
    aio_read(&stuck).unwrap();

    let mut file = tempfile::tempfile().unwrap();
    file.write_all(b"fast").unwrap();
    let quick = Arc::new(Aiocb::read_at(file.as_raw_fd(), 0, 4));
    aio_read(&quick).unwrap();

    aio_suspend(
        &[stuck.as_ref(), quick.as_ref()],
        Some(Duration::from_secs(10)),
    )
    .unwrap();
    assert_ne!(aio_error(&quick), libc::EINPROGRESS);

    paio::aio_cancel(rx, None).unwrap();
    close(rx);
}

#[test]
fn resubmitting_inflight_block_is_rejected() {
    let (rx, _tx) = pipe();
    let cb = Arc::new(Aiocb::read_at(rx, 0, 1));
    aio_read(&cb).unwrap();

    assert_eq!(aio_read(&cb).unwrap_err(), paio::AioError::Invalid);

    paio::aio_cancel(rx, Some(&cb)).unwrap();
    close(rx);
}

fn pipe() -> (i32, i32) {
    let mut fds = [0i32; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    (fds[0], fds[1])
}

fn close(fd: i32) {
    unsafe { libc::close(fd) };
}
