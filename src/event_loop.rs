//! The event loop: submission surface and iteration drivers.
//!
//! One loop instance is owned by one thread for its lifetime. There is no
//! synchronization inside; submissions must come from the owning thread,
//! which includes submissions made from within a callback the loop is
//! dispatching.
//!
//! Each iteration: refresh the cached clock, attempt every queued
//! operation once (would-block parks it in the notifier, `EINTR` retries
//! next iteration), expire due timeouts, block in the notifier up to the
//! computed budget, then dispatch the callbacks of everything that
//! completed. Completions submitted from inside a callback are attempted in
//! the next iteration, never the current one.

use core::ffi::c_void;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::clock::MonotonicClock;
use crate::completion::{
    AcceptCallback, Completion, DispatchFn, Op, State, StatusCallback, TransferCallback,
    dispatch_accept, dispatch_status, dispatch_transfer,
};
use crate::config::Config;
use crate::error::Error;
use crate::ops::{self, Attempt};
use crate::poller::Poller;
use crate::queue::Fifo;
use crate::timeouts::TimeoutSet;

/// Single-threaded, callback-oriented asynchronous I/O event loop.
///
/// The loop owns its kernel notifier handle (released on drop). File
/// descriptors belong to the caller and are never closed implicitly;
/// closing one goes through [`close`](EventLoop::close), which also fails
/// any operation parked on that descriptor with
/// [`ErrorKind::Canceled`](crate::ErrorKind::Canceled).
pub struct EventLoop {
    poller: Poller,
    /// Submitted, ready to have their syscall attempted.
    unqueued: Fifo,
    /// Result attached, callback pending.
    completed: Fifo,
    timeouts: TimeoutSet,
    clock: MonotonicClock,
    /// Refreshed once per iteration; never decreases. Equal-deadline
    /// comparisons within an iteration are therefore deterministic.
    now_cached: u64,
    stopped: bool,
}

impl EventLoop {
    pub fn new(config: Config) -> Result<Self, Error> {
        // No setup flags are defined for the readiness backend.
        if config.flags != 0 {
            return Err(Error::Io(std::io::Error::from_raw_os_error(libc::EINVAL)));
        }
        let poller = Poller::new(config.entries as usize)?;
        let clock = MonotonicClock::new();
        let now_cached = clock.now_ns();
        tracing::debug!(entries = config.entries, "event loop initialized");
        Ok(Self {
            poller,
            unqueued: Fifo::new(),
            completed: Fifo::new(),
            timeouts: TimeoutSet::new(),
            clock,
            now_cached,
            stopped: false,
        })
    }

    /// Current monotonic time in nanoseconds, for deadline arithmetic.
    #[inline]
    pub fn now(&self) -> u64 {
        self.clock.now_ns().max(self.now_cached)
    }

    /// Whether no work remains: both queues, the waiting set, and the
    /// timeout set are empty.
    pub fn is_idle(&self) -> bool {
        self.unqueued.is_empty()
            && self.completed.is_empty()
            && self.timeouts.is_empty()
            && self.poller.waiting() == 0
    }

    /// Number of completions currently borrowed by the loop, across the
    /// retry queue, the dispatch queue, the waiting set, and the timeout
    /// set.
    pub fn pending(&self) -> usize {
        self.unqueued.len() + self.completed.len() + self.timeouts.len() + self.poller.waiting()
    }

    /// Makes [`run_for_ns`](EventLoop::run_for_ns) return after the current
    /// iteration. Callable from a callback.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// Runs exactly one iteration with a block budget of zero.
    pub fn run(&mut self) -> Result<(), Error> {
        self.tick(0)
    }

    /// Runs iterations until the wall-clock budget is consumed, the loop is
    /// [`stop`](EventLoop::stop)ped, or it becomes idle.
    pub fn run_for_ns(&mut self, budget_ns: u64) -> Result<(), Error> {
        let deadline = self.clock.now_ns().saturating_add(budget_ns);
        loop {
            if self.stopped {
                self.stopped = false;
                return Ok(());
            }
            if self.is_idle() {
                return Ok(());
            }
            let now = self.clock.now_ns();
            if now >= deadline {
                return Ok(());
            }
            self.tick(deadline - now)?;
        }
    }

    fn tick(&mut self, budget_ns: u64) -> Result<(), Error> {
        self.now_cached = self.now_cached.max(self.clock.now_ns());

        // Attempt everything submitted before this iteration. EINTR retries
        // re-append to the live queue and wait for the next iteration.
        let mut pending = self.unqueued.take();
        while let Some(completion) = unsafe { pending.pop_front() } {
            unsafe { self.attempt(completion) };
        }

        // Expire due timeouts. They land behind any I/O that completed
        // above, so I/O callbacks run first within the iteration.
        while let Some(completion) = self.timeouts.pop_expired(self.now_cached) {
            unsafe {
                (*completion).result = 0;
                (*completion).state = State::Completed;
                self.completed.push_back(completion);
            }
        }

        // Block budget: zero when anything is dispatchable, else bounded by
        // the earliest deadline and the caller's remaining budget.
        let budget = if !self.completed.is_empty() || !self.unqueued.is_empty() {
            0
        } else if let Some(deadline) = self.timeouts.earliest_deadline() {
            budget_ns.min(deadline.saturating_sub(self.now_cached))
        } else if self.poller.waiting() == 0 {
            0
        } else {
            budget_ns
        };

        if self.poller.waiting() > 0 || budget > 0 {
            match self
                .poller
                .poll(Duration::from_nanos(budget), &mut self.unqueued)
            {
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(error = %e, "notifier poll failed");
                    return Err(Error::Io(e));
                }
            }
        }

        // Dispatch everything that completed this iteration. Submissions
        // made by these callbacks go to `unqueued` and are attempted next
        // iteration.
        let mut finished = self.completed.take();
        while let Some(completion) = unsafe { finished.pop_front() } {
            unsafe { Completion::dispatch(completion) };
        }
        Ok(())
    }

    /// One syscall attempt for a queued completion.
    unsafe fn attempt(&mut self, completion: *mut Completion) {
        let c = unsafe { &mut *completion };

        if let Op::Timeout { deadline_ns } = c.op {
            c.state = State::Scheduled;
            self.timeouts.insert(completion, deadline_ns);
            return;
        }

        // A close tears down parked interest before the descriptor goes
        // away; the canceled operations complete with ECANCELED.
        if let Op::Close { fd } = c.op {
            let (reader, writer) = self.poller.cancel(fd);
            for canceled in [reader, writer].into_iter().flatten() {
                unsafe {
                    (*canceled).result = -libc::ECANCELED;
                    (*canceled).state = State::Completed;
                    self.completed.push_back(canceled);
                }
            }
        }

        match unsafe { ops::attempt(&mut c.op) } {
            Attempt::Done(value) => {
                c.result = value;
                c.state = State::Completed;
                unsafe { self.completed.push_back(completion) };
            }
            Attempt::Fail(errno) => {
                c.result = -errno;
                c.state = State::Completed;
                unsafe { self.completed.push_back(completion) };
            }
            Attempt::Retry => unsafe { self.unqueued.push_back(completion) },
            Attempt::Block(direction) => {
                let fd = c.op.fd().unwrap();
                match unsafe { self.poller.register(fd, direction, completion) } {
                    Ok(()) => c.state = State::Waiting,
                    Err(e) => {
                        // Interest registration failures belong to this
                        // completion, not the loop.
                        c.result = -e.raw_os_error().unwrap_or(libc::EIO);
                        c.state = State::Completed;
                        unsafe { self.completed.push_back(completion) };
                    }
                }
            }
        }
    }

    /// Validates and queues a filled-in completion.
    unsafe fn enqueue(
        &mut self,
        completion: *mut Completion,
        op: Op,
        context: *mut c_void,
        callback: *const (),
        dispatch: DispatchFn,
    ) -> Result<(), Error> {
        let c = unsafe { &mut *completion };
        if c.is_linked() || !c.is_idle() {
            return Err(Error::AlreadySubmitted);
        }
        if let Some(fd) = op.fd()
            && fd < 0
        {
            return Err(Error::InvalidSocket);
        }
        c.op = op;
        c.result = 0;
        c.context = context;
        c.callback = callback;
        c.dispatch = Some(dispatch);
        c.state = State::Ready;
        unsafe { self.unqueued.push_back(completion) };
        Ok(())
    }

    /// Submits an `accept` on a listening socket. The callback receives the
    /// new connection's descriptor, already non-blocking and close-on-exec.
    ///
    /// # Safety
    ///
    /// `completion` and `context` must stay valid and unmoved until the
    /// callback returns.
    pub unsafe fn accept<Ctx>(
        &mut self,
        context: *mut Ctx,
        completion: *mut Completion,
        callback: AcceptCallback<Ctx>,
        socket: RawFd,
    ) -> Result<(), Error> {
        unsafe {
            self.enqueue(
                completion,
                Op::Accept { socket },
                context.cast(),
                callback as *const (),
                dispatch_accept::<Ctx>,
            )
        }
    }

    /// Submits a `connect` of `socket` to `address`.
    ///
    /// # Safety
    ///
    /// `completion` and `context` must stay valid and unmoved until the
    /// callback returns.
    pub unsafe fn connect<Ctx>(
        &mut self,
        context: *mut Ctx,
        completion: *mut Completion,
        callback: StatusCallback<Ctx>,
        socket: RawFd,
        address: SocketAddr,
    ) -> Result<(), Error> {
        unsafe {
            self.enqueue(
                completion,
                Op::Connect {
                    socket,
                    address,
                    initiated: false,
                },
                context.cast(),
                callback as *const (),
                dispatch_status::<Ctx>,
            )
        }
    }

    /// Submits a `recv` into `buffer[..len]`. A callback count of 0 means
    /// the peer closed.
    ///
    /// # Safety
    ///
    /// `completion`, `context`, and `buffer[..len]` must stay valid and
    /// unmoved until the callback returns.
    pub unsafe fn recv<Ctx>(
        &mut self,
        context: *mut Ctx,
        completion: *mut Completion,
        callback: TransferCallback<Ctx>,
        socket: RawFd,
        buffer: *mut u8,
        len: usize,
    ) -> Result<(), Error> {
        unsafe {
            self.enqueue(
                completion,
                Op::Recv {
                    socket,
                    buf: buffer,
                    len,
                },
                context.cast(),
                callback as *const (),
                dispatch_transfer::<Ctx>,
            )
        }
    }

    /// Submits a `send` of `buffer[..len]`. Short sends are reported as-is;
    /// the caller resubmits the remainder.
    ///
    /// # Safety
    ///
    /// `completion`, `context`, and `buffer[..len]` must stay valid and
    /// unmoved until the callback returns.
    pub unsafe fn send<Ctx>(
        &mut self,
        context: *mut Ctx,
        completion: *mut Completion,
        callback: TransferCallback<Ctx>,
        socket: RawFd,
        buffer: *const u8,
        len: usize,
    ) -> Result<(), Error> {
        unsafe {
            self.enqueue(
                completion,
                Op::Send {
                    socket,
                    buf: buffer,
                    len,
                },
                context.cast(),
                callback as *const (),
                dispatch_transfer::<Ctx>,
            )
        }
    }

    /// Submits a positioned `read` (`pread`) at `offset`.
    ///
    /// # Safety
    ///
    /// `completion`, `context`, and `buffer[..len]` must stay valid and
    /// unmoved until the callback returns.
    pub unsafe fn read<Ctx>(
        &mut self,
        context: *mut Ctx,
        completion: *mut Completion,
        callback: TransferCallback<Ctx>,
        fd: RawFd,
        buffer: *mut u8,
        len: usize,
        offset: u64,
    ) -> Result<(), Error> {
        unsafe {
            self.enqueue(
                completion,
                Op::Read {
                    fd,
                    buf: buffer,
                    len,
                    offset,
                },
                context.cast(),
                callback as *const (),
                dispatch_transfer::<Ctx>,
            )
        }
    }

    /// Submits a positioned `write` (`pwrite`) at `offset`. Short writes
    /// are reported as-is.
    ///
    /// # Safety
    ///
    /// `completion`, `context`, and `buffer[..len]` must stay valid and
    /// unmoved until the callback returns.
    pub unsafe fn write<Ctx>(
        &mut self,
        context: *mut Ctx,
        completion: *mut Completion,
        callback: TransferCallback<Ctx>,
        fd: RawFd,
        buffer: *const u8,
        len: usize,
        offset: u64,
    ) -> Result<(), Error> {
        unsafe {
            self.enqueue(
                completion,
                Op::Write {
                    fd,
                    buf: buffer,
                    len,
                    offset,
                },
                context.cast(),
                callback as *const (),
                dispatch_transfer::<Ctx>,
            )
        }
    }

    /// Submits a `close` of `fd`. Any operation parked on `fd` completes
    /// with [`ErrorKind::Canceled`](crate::ErrorKind::Canceled) first.
    ///
    /// # Safety
    ///
    /// `completion` and `context` must stay valid and unmoved until the
    /// callback returns.
    pub unsafe fn close<Ctx>(
        &mut self,
        context: *mut Ctx,
        completion: *mut Completion,
        callback: StatusCallback<Ctx>,
        fd: RawFd,
    ) -> Result<(), Error> {
        unsafe {
            self.enqueue(
                completion,
                Op::Close { fd },
                context.cast(),
                callback as *const (),
                dispatch_status::<Ctx>,
            )
        }
    }

    /// Submits a timeout firing at the absolute `deadline_ns` (loop
    /// monotonic clock, see [`now`](EventLoop::now)). A deadline at or
    /// before the current time completes within the same iteration.
    ///
    /// # Safety
    ///
    /// `completion` and `context` must stay valid and unmoved until the
    /// callback returns.
    pub unsafe fn timeout<Ctx>(
        &mut self,
        context: *mut Ctx,
        completion: *mut Completion,
        callback: StatusCallback<Ctx>,
        deadline_ns: u64,
    ) -> Result<(), Error> {
        unsafe {
            self.enqueue(
                completion,
                Op::Timeout { deadline_ns },
                context.cast(),
                callback as *const (),
                dispatch_status::<Ctx>,
            )
        }
    }

    /// Cancels a pending timeout. The completion's callback still fires —
    /// exactly once, with [`ErrorKind::Canceled`](crate::ErrorKind::Canceled),
    /// at the end of the next iteration. Returns whether anything was
    /// canceled (false when the timeout already expired or was never
    /// submitted).
    ///
    /// # Safety
    ///
    /// `completion` must be valid and, if pending, have been submitted to
    /// this loop.
    pub unsafe fn cancel_timeout(&mut self, completion: *mut Completion) -> bool {
        let c = unsafe { &mut *completion };
        if !matches!(c.op, Op::Timeout { .. }) {
            return false;
        }
        let found = match c.state {
            State::Scheduled => self.timeouts.remove(completion),
            // Submitted this iteration, not yet scheduled.
            State::Ready => unsafe { self.unqueued.remove(completion) },
            _ => false,
        };
        if found {
            c.result = -libc::ECANCELED;
            c.state = State::Completed;
            unsafe { self.completed.push_back(completion) };
        }
        found
    }
}
