//! Per-operation syscall handlers.
//!
//! Each operation tag maps to exactly one syscall attempt. The outcome is
//! classified for the loop: done (with its raw value), definite failure
//! (errno), would-block (with the readiness direction to arm), or retry
//! (`EINTR`). `EAGAIN`/`EWOULDBLOCK` and `EINTR` never escape this module.

use std::io;
use std::net::SocketAddr;

use socket2::SockAddr;

use crate::completion::Op;
use crate::poller::Direction;

#[cfg(target_os = "linux")]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: libc::c_int = 0;

/// Outcome of one syscall attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Attempt {
    /// Success; raw value (byte count or new fd).
    Done(i32),
    /// Definite failure; positive errno.
    Fail(i32),
    /// `EAGAIN`: arm interest in the given direction and wait.
    Block(Direction),
    /// `EINTR`: attempt again next iteration.
    Retry,
}

fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

/// Attempts the syscall for `op` once.
///
/// `Timeout` and `Nop` never reach here: timeouts are purely scheduled and
/// `Nop` is never submitted.
///
/// # Safety
///
/// Buffer pointers carried by `op` must be valid for `len` bytes.
pub(crate) unsafe fn attempt(op: &mut Op) -> Attempt {
    match op {
        Op::Accept { socket } => accept(*socket),
        Op::Connect {
            socket,
            address,
            initiated,
        } => connect(*socket, address, initiated),
        Op::Recv { socket, buf, len } => unsafe { recv(*socket, *buf, *len) },
        Op::Send { socket, buf, len } => unsafe { send(*socket, *buf, *len) },
        Op::Read {
            fd,
            buf,
            len,
            offset,
        } => unsafe { read(*fd, *buf, *len, *offset) },
        Op::Write {
            fd,
            buf,
            len,
            offset,
        } => unsafe { write(*fd, *buf, *len, *offset) },
        Op::Close { fd } => close(*fd),
        Op::Timeout { .. } | Op::Nop => unreachable!("not a syscall operation"),
    }
}

fn accept(socket: libc::c_int) -> Attempt {
    #[cfg(target_os = "linux")]
    let rc = unsafe {
        libc::accept4(
            socket,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    #[cfg(not(target_os = "linux"))]
    let rc = unsafe {
        let fd = libc::accept(socket, std::ptr::null_mut(), std::ptr::null_mut());
        if fd >= 0 {
            libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK);
            libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            let on: libc::c_int = 1;
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_NOSIGPIPE,
                (&on as *const libc::c_int).cast(),
                size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
        fd
    };
    classify(rc, Direction::Readable)
}

fn connect(socket: libc::c_int, address: &SocketAddr, initiated: &mut bool) -> Attempt {
    if *initiated {
        // Writability reported; the handshake outcome is in SO_ERROR.
        let mut err: libc::c_int = 0;
        let mut len = size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                socket,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                (&mut err as *mut libc::c_int).cast(),
                &mut len,
            )
        };
        if rc != 0 {
            return Attempt::Fail(errno());
        }
        match err {
            0 => Attempt::Done(0),
            e => Attempt::Fail(e),
        }
    } else {
        let addr = SockAddr::from(*address);
        let rc = unsafe { libc::connect(socket, addr.as_ptr().cast(), addr.len()) };
        if rc == 0 {
            return Attempt::Done(0);
        }
        match errno() {
            // In progress: completes asynchronously, even when interrupted.
            libc::EINPROGRESS | libc::EAGAIN | libc::EINTR => {
                *initiated = true;
                Attempt::Block(Direction::Writable)
            }
            libc::EISCONN => Attempt::Done(0),
            e => Attempt::Fail(e),
        }
    }
}

unsafe fn recv(socket: libc::c_int, buf: *mut u8, len: usize) -> Attempt {
    let n = unsafe { libc::recv(socket, buf.cast(), clamp(len), 0) };
    // 0 bytes means the peer closed; surfaced as a successful 0-byte read.
    classify(n as i32, Direction::Readable)
}

unsafe fn send(socket: libc::c_int, buf: *const u8, len: usize) -> Attempt {
    let n = unsafe { libc::send(socket, buf.cast(), clamp(len), SEND_FLAGS) };
    classify(n as i32, Direction::Writable)
}

unsafe fn read(fd: libc::c_int, buf: *mut u8, len: usize, offset: u64) -> Attempt {
    let n = unsafe { libc::pread(fd, buf.cast(), clamp(len), offset as libc::off_t) };
    classify(n as i32, Direction::Readable)
}

unsafe fn write(fd: libc::c_int, buf: *const u8, len: usize, offset: u64) -> Attempt {
    let n = unsafe { libc::pwrite(fd, buf.cast(), clamp(len), offset as libc::off_t) };
    classify(n as i32, Direction::Writable)
}

fn close(fd: libc::c_int) -> Attempt {
    let rc = unsafe { libc::close(fd) };
    if rc == 0 {
        return Attempt::Done(0);
    }
    match errno() {
        // POSIX leaves the descriptor state unspecified after EINTR;
        // retrying risks closing a reused descriptor.
        libc::EINTR => Attempt::Done(0),
        e => Attempt::Fail(e),
    }
}

/// Caps a request so the result fits the raw `i32` completion result.
#[inline]
fn clamp(len: usize) -> usize {
    len.min(i32::MAX as usize)
}

fn classify(rc: i32, direction: Direction) -> Attempt {
    if rc >= 0 {
        return Attempt::Done(rc);
    }
    match errno() {
        libc::EAGAIN => Attempt::Block(direction),
        #[allow(unreachable_patterns)] // EWOULDBLOCK == EAGAIN on most targets
        libc::EWOULDBLOCK => Attempt::Block(direction),
        libc::EINTR => Attempt::Retry,
        e => Attempt::Fail(e),
    }
}
