/// Configuration for the event loop.
#[derive(Debug, Clone)]
pub struct Config {
    /// Sizing hint for internal queues (event buffer, waiting table).
    /// The loop still functions when more completions are in flight.
    pub entries: u32,
    /// Setup flags. No flags are defined for the readiness backend; must
    /// be 0 for now.
    pub flags: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            entries: 256,
            flags: 0,
        }
    }
}

/// TCP keepalive parameters for [`open_socket_tcp`](crate::open_socket_tcp).
#[derive(Debug, Clone, Copy)]
pub struct Keepalive {
    /// Seconds of idleness before the first probe.
    pub idle_secs: u32,
    /// Seconds between probes.
    pub interval_secs: u32,
    /// Unanswered probes before the connection is dropped.
    pub probes: u32,
}

/// Options applied by the socket helpers. The returned descriptor is owned
/// by the caller; the loop never closes it implicitly.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// SO_RCVBUF in bytes. 0 leaves the kernel default.
    pub rcvbuf: usize,
    /// SO_SNDBUF in bytes. 0 leaves the kernel default.
    pub sndbuf: usize,
    /// SO_KEEPALIVE with the given probe schedule. TCP only.
    pub keepalive: Option<Keepalive>,
    /// TCP user timeout in milliseconds (TCP_USER_TIMEOUT on Linux,
    /// TCP_RXT_CONNDROPTIME on Darwin). 0 disables. TCP only.
    pub user_timeout_ms: u32,
    /// TCP_NODELAY. TCP only.
    pub nodelay: bool,
    /// SO_REUSEPORT, for fanning a listener out across loops (one loop per
    /// thread, one socket per loop). Kernels without support surface the
    /// setsockopt error from the helper.
    pub reuse_port: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            rcvbuf: 0,
            sndbuf: 0,
            keepalive: None,
            user_timeout_ms: 0,
            nodelay: true,
            reuse_port: false,
        }
    }
}
