//! Socket construction helpers.
//!
//! These return a raw descriptor the caller owns: the loop never closes a
//! caller's descriptor implicitly, and dropping the loop does not touch it.

use std::io;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};

use crate::config::SocketOptions;

/// Opens a non-blocking, close-on-exec TCP socket with `options` applied.
/// The caller binds/connects it and owns the descriptor.
pub fn open_socket_tcp(domain: Domain, options: &SocketOptions) -> io::Result<RawFd> {
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    apply_common(&socket, options)?;
    socket.set_nodelay(options.nodelay)?;
    if let Some(keepalive) = &options.keepalive {
        let params = TcpKeepalive::new()
            .with_time(Duration::from_secs(keepalive.idle_secs as u64))
            .with_interval(Duration::from_secs(keepalive.interval_secs as u64))
            .with_retries(keepalive.probes);
        socket.set_keepalive(true)?;
        socket.set_tcp_keepalive(&params)?;
    }
    if options.user_timeout_ms > 0 {
        set_user_timeout(&socket, options.user_timeout_ms)?;
    }
    Ok(socket.into_raw_fd())
}

/// Opens a non-blocking, close-on-exec UDP socket with the applicable
/// `options` (buffer sizes, SO_REUSEPORT). The caller owns the descriptor.
pub fn open_socket_udp(domain: Domain, options: &SocketOptions) -> io::Result<RawFd> {
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    apply_common(&socket, options)?;
    Ok(socket.into_raw_fd())
}

/// Closes a descriptor returned by the helpers (or any descriptor the
/// caller owns). Prefer [`EventLoop::close`](crate::EventLoop::close) when
/// operations may still be parked on it.
pub fn close_socket(socket: RawFd) {
    unsafe {
        libc::close(socket);
    }
}

fn apply_common(socket: &Socket, options: &SocketOptions) -> io::Result<()> {
    if options.rcvbuf > 0 {
        socket.set_recv_buffer_size(options.rcvbuf)?;
    }
    if options.sndbuf > 0 {
        socket.set_send_buffer_size(options.sndbuf)?;
    }
    if options.reuse_port {
        socket.set_reuse_port(true)?;
    }
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    socket.set_nosigpipe(true)?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_user_timeout(socket: &Socket, ms: u32) -> io::Result<()> {
    socket.set_tcp_user_timeout(Some(Duration::from_millis(ms as u64)))
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn set_user_timeout(socket: &Socket, ms: u32) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    // TCP_RXT_CONNDROPTIME takes seconds.
    let secs: libc::c_int = ms.div_ceil(1000) as libc::c_int;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_RXT_CONNDROPTIME,
            (&secs as *const libc::c_int).cast(),
            size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios")))]
fn set_user_timeout(_socket: &Socket, _ms: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "TCP user timeout is not supported on this platform",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Keepalive;
    use std::os::unix::io::FromRawFd;

    fn nonblocking(fd: RawFd) -> bool {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        flags & libc::O_NONBLOCK != 0
    }

    #[test]
    fn test_open_tcp_defaults() {
        let fd = open_socket_tcp(Domain::IPV4, &SocketOptions::default()).unwrap();
        assert!(fd >= 0);
        assert!(nonblocking(fd));
        close_socket(fd);
    }

    #[test]
    fn test_open_udp_defaults() {
        let fd = open_socket_udp(Domain::IPV4, &SocketOptions::default()).unwrap();
        assert!(fd >= 0);
        assert!(nonblocking(fd));
        close_socket(fd);
    }

    #[test]
    fn test_open_tcp_with_options() {
        let options = SocketOptions {
            rcvbuf: 64 * 1024,
            sndbuf: 64 * 1024,
            keepalive: Some(Keepalive {
                idle_secs: 30,
                interval_secs: 10,
                probes: 3,
            }),
            user_timeout_ms: 5_000,
            nodelay: true,
            reuse_port: true,
        };
        let fd = open_socket_tcp(Domain::IPV4, &options).unwrap();

        // inspect through a borrowed socket2 handle
        let socket = unsafe { Socket::from_raw_fd(fd) };
        assert!(socket.keepalive().unwrap());
        assert!(socket.nodelay().unwrap());
        assert!(socket.reuse_port().unwrap());
        // the kernel may round buffer sizes, but never below the request
        assert!(socket.recv_buffer_size().unwrap() >= 64 * 1024);
        drop(socket); // closes fd
    }

    #[test]
    fn test_open_tcp_ipv6() {
        // IPv6 may be unavailable in minimal environments
        if let Ok(fd) = open_socket_tcp(Domain::IPV6, &SocketOptions::default()) {
            assert!(nonblocking(fd));
            close_socket(fd);
        }
    }
}
