//! Real-socket behavior over loopback TCP: accept, echo, short writes,
//! would-block parking, connect, and close-driven cancellation.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

use evio::{
    close_socket, open_socket_tcp, Completion, Config, Domain, ErrorKind, EventLoop,
    SocketOptions,
};

/// Drives the loop in bounded slices until `done` reports true.
fn drive(event_loop: &mut EventLoop, mut done: impl FnMut() -> bool) {
    for _ in 0..500 {
        if done() {
            return;
        }
        event_loop.run_for_ns(10_000_000).unwrap(); // 10ms slices
    }
    panic!("loop did not reach the expected state in time");
}

struct AcceptCtx {
    accepted: Option<RawFd>,
}

fn on_accept(ctx: *mut AcceptCtx, _: &mut Completion, result: Result<RawFd, ErrorKind>) {
    unsafe { (*ctx).accepted = Some(result.expect("accept failed")) };
}

/// Accepts one connection through the loop, returning its descriptor.
fn accept_one(event_loop: &mut EventLoop, listener: &TcpListener) -> RawFd {
    let mut ctx = AcceptCtx { accepted: None };
    let mut completion = Completion::new();
    unsafe {
        event_loop
            .accept(&mut ctx, &mut completion, on_accept, listener.as_raw_fd())
            .unwrap();
    }
    drive(event_loop, || ctx.accepted.is_some());
    ctx.accepted.unwrap()
}

struct RecvCtx {
    received: Option<Result<usize, ErrorKind>>,
}

fn on_recv(ctx: *mut RecvCtx, _: &mut Completion, result: Result<usize, ErrorKind>) {
    unsafe { (*ctx).received = Some(result) };
}

#[test]
fn test_accept_yields_nonblocking_socket_and_eof_on_peer_close() {
    let mut event_loop = EventLoop::new(Config::default()).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();

    let client = TcpStream::connect(addr).unwrap();
    let connection = accept_one(&mut event_loop, &listener);

    let flags = unsafe { libc::fcntl(connection, libc::F_GETFL) };
    assert!(flags & libc::O_NONBLOCK != 0, "accepted socket must be non-blocking");

    // peer closes; a recv completes with 0 bytes
    drop(client);
    let mut ctx = RecvCtx { received: None };
    let mut completion = Completion::new();
    let mut buffer = [0u8; 64];
    unsafe {
        event_loop
            .recv(
                &mut ctx,
                &mut completion,
                on_recv,
                connection,
                buffer.as_mut_ptr(),
                buffer.len(),
            )
            .unwrap();
    }
    drive(&mut event_loop, || ctx.received.is_some());
    assert_eq!(ctx.received, Some(Ok(0)));

    close_socket(connection);
}

#[test]
fn test_recv_delivers_exact_bytes() {
    let mut event_loop = EventLoop::new(Config::default()).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    let connection = accept_one(&mut event_loop, &listener);

    client.write_all(b"Hello, World!").unwrap();

    let mut ctx = RecvCtx { received: None };
    let mut completion = Completion::new();
    let mut buffer = [0u8; 13];
    unsafe {
        event_loop
            .recv(
                &mut ctx,
                &mut completion,
                on_recv,
                connection,
                buffer.as_mut_ptr(),
                buffer.len(),
            )
            .unwrap();
    }
    drive(&mut event_loop, || ctx.received.is_some());

    assert_eq!(ctx.received, Some(Ok(13)));
    assert_eq!(&buffer, b"Hello, World!");
    close_socket(connection);
}

#[test]
fn test_recv_parks_until_data_arrives() {
    let mut event_loop = EventLoop::new(Config::default()).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    let connection = accept_one(&mut event_loop, &listener);

    let mut ctx = RecvCtx { received: None };
    let mut completion = Completion::new();
    let mut buffer = [0u8; 64];
    unsafe {
        event_loop
            .recv(
                &mut ctx,
                &mut completion,
                on_recv,
                connection,
                buffer.as_mut_ptr(),
                buffer.len(),
            )
            .unwrap();
    }

    // no data: the operation parks, no callback fires
    for _ in 0..5 {
        event_loop.run().unwrap();
    }
    assert!(ctx.received.is_none());
    assert!(!event_loop.is_idle());
    assert_eq!(event_loop.pending(), 1);

    client.write_all(b"ping").unwrap();
    drive(&mut event_loop, || ctx.received.is_some());
    assert_eq!(ctx.received, Some(Ok(4)));
    assert_eq!(&buffer[..4], b"ping");

    close_socket(connection);
}

#[test]
fn test_connect_then_send_large_buffer_in_pieces() {
    let mut event_loop = EventLoop::new(Config::default()).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    // small send buffer forces short writes on a 1 MiB payload
    let options = SocketOptions {
        sndbuf: 64 * 1024,
        ..SocketOptions::default()
    };
    let client = open_socket_tcp(Domain::IPV4, &options).unwrap();

    struct ConnectCtx {
        connected: Option<Result<(), ErrorKind>>,
    }
    fn on_connect(ctx: *mut ConnectCtx, _: &mut Completion, result: Result<(), ErrorKind>) {
        unsafe { (*ctx).connected = Some(result) };
    }

    let mut connect_ctx = ConnectCtx { connected: None };
    let mut connect_completion = Completion::new();
    unsafe {
        event_loop
            .connect(
                &mut connect_ctx,
                &mut connect_completion,
                on_connect,
                client,
                addr,
            )
            .unwrap();
    }
    drive(&mut event_loop, || connect_ctx.connected.is_some());
    assert_eq!(connect_ctx.connected, Some(Ok(())));

    let (mut server_side, _) = listener.accept().unwrap();
    let reader = std::thread::spawn(move || {
        let mut total = 0usize;
        let mut buffer = vec![0u8; 64 * 1024];
        while total < 1024 * 1024 {
            let n = server_side.read(&mut buffer).unwrap();
            if n == 0 {
                break;
            }
            assert!(buffer[..n].iter().all(|&b| b == 0xAB));
            total += n;
        }
        total
    });

    struct SendCtx {
        event_loop: *mut EventLoop,
        socket: RawFd,
        data: Vec<u8>,
        sent: usize,
        submissions: u32,
        done: bool,
    }

    fn on_send(ctx: *mut SendCtx, completion: &mut Completion, result: Result<usize, ErrorKind>) {
        let ctx = unsafe { &mut *ctx };
        let n = result.expect("send failed");
        assert!(n > 0);
        ctx.sent += n;
        if ctx.sent < ctx.data.len() {
            ctx.submissions += 1;
            let event_loop = ctx.event_loop;
            let socket = ctx.socket;
            let remaining_ptr = unsafe { ctx.data.as_ptr().add(ctx.sent) };
            let remaining_len = ctx.data.len() - ctx.sent;
            unsafe {
                (*event_loop)
                    .send(
                        ctx as *mut SendCtx,
                        completion,
                        on_send,
                        socket,
                        remaining_ptr,
                        remaining_len,
                    )
                    .unwrap();
            }
        } else {
            ctx.done = true;
        }
    }

    let mut send_ctx = SendCtx {
        event_loop: &mut event_loop,
        socket: client,
        data: vec![0xAB; 1024 * 1024],
        sent: 0,
        submissions: 1,
        done: false,
    };
    let data_ptr = send_ctx.data.as_ptr();
    let data_len = send_ctx.data.len();
    let mut send_completion = Completion::new();
    unsafe {
        event_loop
            .send(
                &mut send_ctx,
                &mut send_completion,
                on_send,
                client,
                data_ptr,
                data_len,
            )
            .unwrap();
    }
    drive(&mut event_loop, || send_ctx.done);

    assert_eq!(send_ctx.sent, 1024 * 1024);
    assert!(
        send_ctx.submissions > 1,
        "a 1 MiB payload must not fit one send on a 64 KiB buffer"
    );
    assert_eq!(reader.join().unwrap(), 1024 * 1024);

    close_socket(client);
}

#[test]
fn test_connect_refused() {
    let mut event_loop = EventLoop::new(Config::default()).unwrap();

    // bind to learn a free port, then release it
    let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();

    let client = open_socket_tcp(Domain::IPV4, &SocketOptions::default()).unwrap();

    struct ConnectCtx {
        connected: Option<Result<(), ErrorKind>>,
    }
    fn on_connect(ctx: *mut ConnectCtx, _: &mut Completion, result: Result<(), ErrorKind>) {
        unsafe { (*ctx).connected = Some(result) };
    }

    let mut ctx = ConnectCtx { connected: None };
    let mut completion = Completion::new();
    unsafe {
        event_loop
            .connect(&mut ctx, &mut completion, on_connect, client, addr)
            .unwrap();
    }
    drive(&mut event_loop, || ctx.connected.is_some());

    assert_eq!(ctx.connected, Some(Err(ErrorKind::ConnectionRefused)));
    close_socket(client);
}

#[test]
fn test_close_cancels_parked_recv() {
    let mut event_loop = EventLoop::new(Config::default()).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();

    let _client = TcpStream::connect(addr).unwrap();
    let connection = accept_one(&mut event_loop, &listener);

    let mut recv_ctx = RecvCtx { received: None };
    let mut recv_completion = Completion::new();
    let mut buffer = [0u8; 64];
    unsafe {
        event_loop
            .recv(
                &mut recv_ctx,
                &mut recv_completion,
                on_recv,
                connection,
                buffer.as_mut_ptr(),
                buffer.len(),
            )
            .unwrap();
    }
    // park it
    event_loop.run().unwrap();
    assert!(recv_ctx.received.is_none());

    struct CloseCtx {
        closed: Option<Result<(), ErrorKind>>,
    }
    fn on_close(ctx: *mut CloseCtx, _: &mut Completion, result: Result<(), ErrorKind>) {
        unsafe { (*ctx).closed = Some(result) };
    }

    let mut close_ctx = CloseCtx { closed: None };
    let mut close_completion = Completion::new();
    unsafe {
        event_loop
            .close(&mut close_ctx, &mut close_completion, on_close, connection)
            .unwrap();
    }
    event_loop.run().unwrap();

    // the parked recv fails, not silently; the close itself succeeds
    assert_eq!(recv_ctx.received, Some(Err(ErrorKind::Canceled)));
    assert_eq!(close_ctx.closed, Some(Ok(())));
    assert!(event_loop.is_idle());
}

#[test]
fn test_independent_read_and_write_interest_on_one_socket() {
    let mut event_loop = EventLoop::new(Config::default()).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    let connection = accept_one(&mut event_loop, &listener);

    // one completion awaiting readability...
    let mut recv_ctx = RecvCtx { received: None };
    let mut recv_completion = Completion::new();
    let mut recv_buffer = [0u8; 16];
    unsafe {
        event_loop
            .recv(
                &mut recv_ctx,
                &mut recv_completion,
                on_recv,
                connection,
                recv_buffer.as_mut_ptr(),
                recv_buffer.len(),
            )
            .unwrap();
    }

    // ...while another sends on the same socket
    struct SendCtx {
        sent: Option<Result<usize, ErrorKind>>,
    }
    fn on_send(ctx: *mut SendCtx, _: &mut Completion, result: Result<usize, ErrorKind>) {
        unsafe { (*ctx).sent = Some(result) };
    }
    let mut send_ctx = SendCtx { sent: None };
    let mut send_completion = Completion::new();
    let payload = b"pong";
    unsafe {
        event_loop
            .send(
                &mut send_ctx,
                &mut send_completion,
                on_send,
                connection,
                payload.as_ptr(),
                payload.len(),
            )
            .unwrap();
    }

    drive(&mut event_loop, || send_ctx.sent.is_some());
    assert_eq!(send_ctx.sent, Some(Ok(4)));

    let mut echoed = [0u8; 4];
    client.read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed, b"pong");

    client.write_all(b"ping").unwrap();
    drive(&mut event_loop, || recv_ctx.received.is_some());
    assert_eq!(recv_ctx.received, Some(Ok(4)));
    assert_eq!(&recv_buffer[..4], b"ping");

    close_socket(connection);
}
