use std::fmt;
use std::io;

/// Coarse error taxonomy delivered to completion callbacks.
///
/// `EAGAIN`/`EWOULDBLOCK` and `EINTR` never appear here: would-block parks
/// the operation in the notifier and interrupted syscalls are retried
/// internally. Everything else a syscall can report is folded into one of
/// these kinds; errno values without a dedicated kind are carried raw in
/// [`ErrorKind::Io`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The file descriptor was closed under the operation, or the pending
    /// interest was torn down while the operation waited.
    Canceled,
    /// The peer refused the connection.
    ConnectionRefused,
    /// The connection was reset by the peer.
    ConnectionReset,
    /// The connection was aborted before it could be used.
    ConnectionAborted,
    /// The kernel reported a deadline exceeded (e.g. TCP user timeout).
    ///
    /// Distinct from a `timeout` operation completing, which is a success.
    TimedOut,
    /// Write side of the connection is gone.
    BrokenPipe,
    /// The socket is not connected.
    NotConnected,
    /// The file descriptor is not valid.
    BadFileDescriptor,
    /// An argument was rejected by the kernel, or a second operation was
    /// submitted for a (fd, direction) that already has one waiting.
    InvalidArgument,
    /// Kernel memory exhaustion.
    NoMemory,
    /// Process or system file table is full.
    TooManyOpenFiles,
    /// No kernel buffer space available.
    NoBufferSpace,
    /// Any other errno, carried raw.
    Io(i32),
}

impl ErrorKind {
    /// Maps a raw (positive) errno to its kind.
    pub(crate) fn from_errno(errno: i32) -> Self {
        match errno {
            libc::ECANCELED => ErrorKind::Canceled,
            libc::ECONNREFUSED => ErrorKind::ConnectionRefused,
            libc::ECONNRESET => ErrorKind::ConnectionReset,
            libc::ECONNABORTED => ErrorKind::ConnectionAborted,
            libc::ETIMEDOUT => ErrorKind::TimedOut,
            libc::EPIPE => ErrorKind::BrokenPipe,
            libc::ENOTCONN => ErrorKind::NotConnected,
            libc::EBADF => ErrorKind::BadFileDescriptor,
            libc::EINVAL => ErrorKind::InvalidArgument,
            libc::ENOMEM => ErrorKind::NoMemory,
            libc::EMFILE | libc::ENFILE => ErrorKind::TooManyOpenFiles,
            libc::ENOBUFS => ErrorKind::NoBufferSpace,
            other => ErrorKind::Io(other),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Canceled => write!(f, "operation canceled"),
            ErrorKind::ConnectionRefused => write!(f, "connection refused"),
            ErrorKind::ConnectionReset => write!(f, "connection reset"),
            ErrorKind::ConnectionAborted => write!(f, "connection aborted"),
            ErrorKind::TimedOut => write!(f, "timed out"),
            ErrorKind::BrokenPipe => write!(f, "broken pipe"),
            ErrorKind::NotConnected => write!(f, "not connected"),
            ErrorKind::BadFileDescriptor => write!(f, "bad file descriptor"),
            ErrorKind::InvalidArgument => write!(f, "invalid argument"),
            ErrorKind::NoMemory => write!(f, "out of memory"),
            ErrorKind::TooManyOpenFiles => write!(f, "too many open files"),
            ErrorKind::NoBufferSpace => write!(f, "no buffer space"),
            ErrorKind::Io(errno) => write!(f, "I/O error (errno {errno})"),
        }
    }
}

/// Errors returned by the event loop itself.
///
/// Misuse is reported here, at the submission call site, never through the
/// completion callback.
#[derive(Debug)]
pub enum Error {
    /// The notifier failed; the loop cannot make progress.
    Io(io::Error),
    /// The completion is still owned by the loop: linked in a queue, parked
    /// in the notifier, or scheduled as a timeout.
    AlreadySubmitted,
    /// The operation names a negative file descriptor.
    InvalidSocket,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::AlreadySubmitted => write!(f, "completion is already submitted"),
            Error::InvalidSocket => write!(f, "invalid socket"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
