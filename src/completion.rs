//! The completion record: per-operation state owned by the caller.
//!
//! A [`Completion`] is allocated by the caller (stack or heap) and borrowed
//! by the loop from submission until its callback returns. The public
//! submission surface is generic on the context type; the record stores the
//! callback type-erased, and a monomorphized trampoline installed at
//! submission performs the single cast back.

use core::ffi::c_void;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use crate::error::ErrorKind;

/// Tombstone sentinel for the link field: "not in any queue".
///
/// A linked completion's `next` is either a valid pointer or null (tail),
/// so the all-ones pattern is unambiguous.
const UNLINKED: *mut Completion = usize::MAX as *mut Completion;

/// Lifecycle of a completion.
///
/// `Idle -> Ready -> (Waiting | Scheduled)* -> Completed -> Idle`.
/// A completion may bounce between `Ready` and `Waiting` any number of
/// times before completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Owned by the caller; available for submission.
    Idle,
    /// In the retry queue, about to have its syscall attempted.
    Ready,
    /// Parked in the notifier awaiting readiness.
    Waiting,
    /// Parked in the timeout set awaiting its deadline.
    Scheduled,
    /// Result attached; callback runs at the end of the iteration.
    Completed,
}

/// Tagged per-operation arguments.
///
/// `Recv`/`Send`/`Read`/`Write` hold raw pointers to caller-owned buffers,
/// which must stay valid and immovable until the callback runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Sentinel for an idle completion.
    Nop,
    /// Accept one connection on a listening socket.
    Accept { socket: RawFd },
    /// Connect `socket` to `address`. `initiated` tracks whether the
    /// kernel has already been asked and we are waiting for writability.
    Connect {
        socket: RawFd,
        address: SocketAddr,
        initiated: bool,
    },
    /// Receive up to `len` bytes into `buf`.
    Recv {
        socket: RawFd,
        buf: *mut u8,
        len: usize,
    },
    /// Send up to `len` bytes from `buf`. Short sends are reported as-is.
    Send {
        socket: RawFd,
        buf: *const u8,
        len: usize,
    },
    /// Positioned read (`pread`).
    Read {
        fd: RawFd,
        buf: *mut u8,
        len: usize,
        offset: u64,
    },
    /// Positioned write (`pwrite`). Short writes are reported as-is.
    Write {
        fd: RawFd,
        buf: *const u8,
        len: usize,
        offset: u64,
    },
    /// Close the descriptor, canceling anything parked on it.
    Close { fd: RawFd },
    /// Fire at `deadline_ns` (absolute, loop monotonic clock).
    Timeout { deadline_ns: u64 },
}

impl Op {
    /// The descriptor this operation targets, if any.
    pub(crate) fn fd(&self) -> Option<RawFd> {
        match *self {
            Op::Accept { socket }
            | Op::Connect { socket, .. }
            | Op::Recv { socket, .. }
            | Op::Send { socket, .. } => Some(socket),
            Op::Read { fd, .. } | Op::Write { fd, .. } | Op::Close { fd } => Some(fd),
            Op::Nop | Op::Timeout { .. } => None,
        }
    }
}

/// Callback for `accept`: receives the new socket.
pub type AcceptCallback<Ctx> = fn(*mut Ctx, &mut Completion, Result<RawFd, ErrorKind>);
/// Callback for `recv`/`send`/`read`/`write`: receives the byte count.
/// A `recv` count of 0 means the peer closed.
pub type TransferCallback<Ctx> = fn(*mut Ctx, &mut Completion, Result<usize, ErrorKind>);
/// Callback for `connect`/`close`/`timeout`.
pub type StatusCallback<Ctx> = fn(*mut Ctx, &mut Completion, Result<(), ErrorKind>);

/// Monomorphized dispatch trampoline installed at submission.
pub(crate) type DispatchFn = unsafe fn(&mut Completion);

/// One in-flight asynchronous operation.
///
/// The caller owns the memory; the loop borrows it from submission until
/// the callback returns. While borrowed, the record must not be mutated,
/// freed, or resubmitted.
pub struct Completion {
    /// Intrusive link; belongs to whichever queue currently holds the
    /// completion. [`UNLINKED`] when in none.
    pub(crate) next: *mut Completion,
    pub(crate) state: State,
    pub(crate) op: Op,
    /// Raw outcome: success value (byte count or fd) when non-negative,
    /// negated errno when negative.
    pub(crate) result: i32,
    pub(crate) context: *mut c_void,
    /// The caller's typed callback, erased. Restored by `dispatch`.
    pub(crate) callback: *const (),
    pub(crate) dispatch: Option<DispatchFn>,
}

impl Completion {
    /// Creates an idle, unlinked completion.
    pub const fn new() -> Self {
        Self {
            next: UNLINKED,
            state: State::Idle,
            op: Op::Nop,
            result: 0,
            context: std::ptr::null_mut(),
            callback: std::ptr::null(),
            dispatch: None,
        }
    }

    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.state == State::Idle
    }

    #[inline]
    pub fn is_linked(&self) -> bool {
        self.next != UNLINKED
    }

    /// The operation this completion was last submitted with.
    #[inline]
    pub fn op(&self) -> &Op {
        &self.op
    }

    /// Clears all fields back to the freshly-constructed state.
    ///
    /// # Panics
    ///
    /// Panics if the completion is still owned by the loop.
    pub fn reset(&mut self) {
        assert!(!self.is_linked());
        assert!(self.state == State::Idle || self.state == State::Completed);
        self.next = UNLINKED;
        self.state = State::Idle;
        self.op = Op::Nop;
        self.result = 0;
        self.context = std::ptr::null_mut();
        self.callback = std::ptr::null();
        self.dispatch = None;
    }

    #[inline]
    pub(crate) fn unlink(&mut self) {
        self.next = UNLINKED;
    }

    /// Invokes the callback installed at submission.
    ///
    /// # Safety
    ///
    /// `completion` must be valid, unlinked, and in `Completed` state; its
    /// context must still point where the caller promised at submission.
    pub(crate) unsafe fn dispatch(completion: *mut Completion) {
        let c = unsafe { &mut *completion };
        debug_assert_eq!(c.state, State::Completed);
        debug_assert!(!c.is_linked());
        if let Some(dispatch) = c.dispatch.take() {
            unsafe { dispatch(c) };
        }
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

// The trampolines below restore the exact callback type erased by the
// matching submission method, mark the completion idle so the callback may
// resubmit it, then hand over the typed result.

pub(crate) unsafe fn dispatch_accept<Ctx>(completion: &mut Completion) {
    // SAFETY: the accept submission stored an `AcceptCallback<Ctx>` here.
    let callback: AcceptCallback<Ctx> = unsafe { mem::transmute(completion.callback) };
    let context = completion.context.cast::<Ctx>();
    let result = match completion.result {
        fd if fd >= 0 => Ok(fd),
        err => Err(ErrorKind::from_errno(-err)),
    };
    completion.state = State::Idle;
    callback(context, completion, result);
}

pub(crate) unsafe fn dispatch_transfer<Ctx>(completion: &mut Completion) {
    // SAFETY: the recv/send/read/write submission stored a
    // `TransferCallback<Ctx>` here.
    let callback: TransferCallback<Ctx> = unsafe { mem::transmute(completion.callback) };
    let context = completion.context.cast::<Ctx>();
    let result = match completion.result {
        n if n >= 0 => Ok(n as usize),
        err => Err(ErrorKind::from_errno(-err)),
    };
    completion.state = State::Idle;
    callback(context, completion, result);
}

pub(crate) unsafe fn dispatch_status<Ctx>(completion: &mut Completion) {
    // SAFETY: the connect/close/timeout submission stored a
    // `StatusCallback<Ctx>` here.
    let callback: StatusCallback<Ctx> = unsafe { mem::transmute(completion.callback) };
    let context = completion.context.cast::<Ctx>();
    let result = match completion.result {
        n if n >= 0 => Ok(()),
        err => Err(ErrorKind::from_errno(-err)),
    };
    completion.state = State::Idle;
    callback(context, completion, result);
}
