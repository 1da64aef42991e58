//! evio - completion-oriented readiness event loop.
//!
//! A single-threaded, callback-oriented asynchronous I/O event loop over
//! the kernel's readiness facility (epoll on Linux, kqueue on macOS/BSD,
//! via mio). Programs submit non-blocking operations — `accept`,
//! `connect`, `recv`, `send`, `read`, `write`, `close`, and pure
//! `timeout` — and receive completions through callbacks.
//!
//! # Design
//!
//! - **Caller-allocated completions**: every operation is described by a
//!   [`Completion`] the caller allocates (stack or heap). The loop borrows
//!   it from submission until the callback returns; no allocation happens
//!   on the hot path.
//! - **Readiness to completion**: each queued operation has its syscall
//!   attempted once per iteration. Would-block arms one-shot interest in
//!   the notifier and parks the completion; readiness moves it back for
//!   retry. `EAGAIN` and `EINTR` never reach a callback.
//! - **One loop per thread**: no synchronization inside, no cross-thread
//!   submission. Servers fan out with one loop per thread, each with its
//!   own listening socket (`SO_REUSEPORT`, see
//!   [`SocketOptions::reuse_port`]).
//!
//! # Quick Start
//!
//! ```ignore
//! use evio::{Completion, Config, ErrorKind, EventLoop};
//!
//! struct Server { /* ... */ }
//!
//! fn on_accept(server: *mut Server, _: &mut Completion, result: Result<i32, ErrorKind>) {
//!     let connection = result.expect("accept failed");
//!     // submit a recv on `connection`, re-submit the accept, ...
//! }
//!
//! let mut event_loop = EventLoop::new(Config::default())?;
//! let mut accept = Completion::new();
//! unsafe {
//!     event_loop.accept(&mut server, &mut accept, on_accept, listener_fd)?;
//! }
//! loop {
//!     event_loop.run_for_ns(1_000_000)?; // 1ms
//! }
//! ```

mod clock;
mod ops;
mod poller;
mod queue;
mod timeouts;

pub mod completion;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod socket;

// Public API re-exports
pub use completion::{
    AcceptCallback, Completion, Op, State, StatusCallback, TransferCallback,
};
pub use config::{Config, Keepalive, SocketOptions};
pub use error::{Error, ErrorKind};
pub use event_loop::EventLoop;
pub use socket::{close_socket, open_socket_tcp, open_socket_udp};

// Socket domain selection for the helpers.
pub use socket2::Domain;
