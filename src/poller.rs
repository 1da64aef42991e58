//! Kernel readiness notifier: a thin wrapper over mio's `Poll`
//! (epoll on Linux, kqueue on macOS/BSD).
//!
//! Completions that would block are parked here, keyed by
//! (fd, direction). Interest is disarmed as soon as an event is delivered
//! (deregister, or reregister with the remaining direction), so a socket
//! with successive operations never accumulates stale events.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::completion::{Completion, State};
use crate::queue::Fifo;

/// Readiness direction for one parked operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Readable,
    Writable,
}

/// Parked completions for one descriptor, one slot per direction.
#[derive(Clone, Copy)]
struct Waiters {
    reader: *mut Completion,
    writer: *mut Completion,
}

impl Waiters {
    const EMPTY: Waiters = Waiters {
        reader: std::ptr::null_mut(),
        writer: std::ptr::null_mut(),
    };

    fn is_empty(&self) -> bool {
        self.reader.is_null() && self.writer.is_null()
    }

    fn interest(&self) -> Option<Interest> {
        match (!self.reader.is_null(), !self.writer.is_null()) {
            (true, true) => Some(Interest::READABLE.add(Interest::WRITABLE)),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

pub(crate) struct Poller {
    poll: Poll,
    events: Events,
    waiting: HashMap<RawFd, Waiters>,
    /// Number of parked completions across all descriptors.
    parked: usize,
    /// Reusable decode buffer for one poll's events.
    fired: Vec<(RawFd, bool, bool)>,
}

impl Poller {
    pub(crate) fn new(entries: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(entries.max(8)),
            waiting: HashMap::with_capacity(entries),
            parked: 0,
            fired: Vec::new(),
        })
    }

    /// Number of completions parked in the waiting set.
    #[inline]
    pub(crate) fn waiting(&self) -> usize {
        self.parked
    }

    /// Arms interest for `fd` in `direction` and parks `completion`.
    ///
    /// Fails with `EINVAL` if that (fd, direction) already has a waiter:
    /// at most one completion may await each direction of a descriptor.
    ///
    /// # Safety
    ///
    /// `completion` must be valid until it is handed back by
    /// [`poll`](Poller::poll) or [`cancel`](Poller::cancel).
    pub(crate) unsafe fn register(
        &mut self,
        fd: RawFd,
        direction: Direction,
        completion: *mut Completion,
    ) -> io::Result<()> {
        let mut waiters = self.waiting.get(&fd).copied().unwrap_or(Waiters::EMPTY);
        let armed_before = waiters.interest().is_some();
        let slot = match direction {
            Direction::Readable => &mut waiters.reader,
            Direction::Writable => &mut waiters.writer,
        };
        if !slot.is_null() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        *slot = completion;

        let interest = waiters.interest().unwrap();
        let token = Token(fd as usize);
        let mut source = SourceFd(&fd);
        let registry = self.poll.registry();
        let result = if armed_before {
            registry.reregister(&mut source, token, interest)
        } else {
            registry.register(&mut source, token, interest)
        };
        // The kernel table can disagree with ours after descriptor reuse;
        // retry once the other way.
        let result = match result {
            Err(e) if !armed_before && e.raw_os_error() == Some(libc::EEXIST) => {
                registry.reregister(&mut source, token, interest)
            }
            Err(e) if armed_before && e.raw_os_error() == Some(libc::ENOENT) => {
                registry.register(&mut source, token, interest)
            }
            other => other,
        };
        result?;

        tracing::trace!(fd, ?direction, "interest armed");
        self.waiting.insert(fd, waiters);
        self.parked += 1;
        Ok(())
    }

    /// Blocks up to `timeout` and moves every completion whose readiness
    /// fired into `ready` (state set back to [`State::Ready`]). Delivered
    /// interest is disarmed. Returns the number of completions moved.
    ///
    /// `EINTR` is swallowed: the loop retries on its next iteration.
    pub(crate) fn poll(&mut self, timeout: Duration, ready: &mut Fifo) -> io::Result<usize> {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e),
        }

        self.fired.clear();
        for event in self.events.iter() {
            let fd = event.token().0 as RawFd;
            let failed = event.is_error();
            self.fired.push((
                fd,
                event.is_readable() || event.is_read_closed() || failed,
                event.is_writable() || event.is_write_closed() || failed,
            ));
        }

        let mut moved = 0;
        for index in 0..self.fired.len() {
            let (fd, wake_read, wake_write) = self.fired[index];
            let Some(mut waiters) = self.waiting.get(&fd).copied() else {
                continue;
            };

            let mut unparked = 0;
            if wake_read && !waiters.reader.is_null() {
                let completion = std::mem::replace(&mut waiters.reader, std::ptr::null_mut());
                unsafe {
                    (*completion).state = State::Ready;
                    ready.push_back(completion);
                }
                unparked += 1;
            }
            if wake_write && !waiters.writer.is_null() {
                let completion = std::mem::replace(&mut waiters.writer, std::ptr::null_mut());
                unsafe {
                    (*completion).state = State::Ready;
                    ready.push_back(completion);
                }
                unparked += 1;
            }
            if unparked == 0 {
                continue;
            }
            self.parked -= unparked;
            moved += unparked;

            let mut source = SourceFd(&fd);
            match waiters.interest() {
                None => {
                    self.waiting.remove(&fd);
                    // The descriptor may already be gone; nothing to do then.
                    let _ = self.poll.registry().deregister(&mut source);
                }
                Some(remaining) => {
                    let rearmed = self
                        .poll
                        .registry()
                        .reregister(&mut source, Token(fd as usize), remaining);
                    if rearmed.is_ok() {
                        self.waiting.insert(fd, waiters);
                    } else {
                        // Registration lost. Hand the survivor back to the
                        // retry queue; its syscall reports the real error.
                        let survivor = if waiters.reader.is_null() {
                            waiters.writer
                        } else {
                            waiters.reader
                        };
                        unsafe {
                            (*survivor).state = State::Ready;
                            ready.push_back(survivor);
                        }
                        self.parked -= 1;
                        moved += 1;
                        self.waiting.remove(&fd);
                    }
                }
            }
        }
        Ok(moved)
    }

    /// Tears down all interest for `fd`, returning the parked reader and
    /// writer so the loop can fail them. Used on the close path.
    pub(crate) fn cancel(
        &mut self,
        fd: RawFd,
    ) -> (Option<*mut Completion>, Option<*mut Completion>) {
        let Some(waiters) = self.waiting.remove(&fd) else {
            return (None, None);
        };
        let mut source = SourceFd(&fd);
        let _ = self.poll.registry().deregister(&mut source);
        let reader = (!waiters.reader.is_null()).then_some(waiters.reader);
        let writer = (!waiters.writer.is_null()).then_some(waiters.writer);
        self.parked -= reader.is_some() as usize + writer.is_some() as usize;
        (reader, writer)
    }
}
