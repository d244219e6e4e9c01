//! End-to-end exercise of the full runtime/event-loop/I/O-wrapper path: a real listening socket,
//! real accepted connections, coroutines suspending on real `EAGAIN` and being resumed by a real
//! `mio` poller, against an external client driven from this test's own OS thread.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::RawFd;
use std::thread;
use std::time::Duration;

use ef_coroutine::{io, Coroutine, RuntimeBuilder};

fn listen_socket() -> (RawFd, u16) {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0, "socket() failed");

        let one: libc::c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );

        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: 0, // ask the kernel for an ephemeral port
            sin_addr: libc::in_addr { s_addr: 0 },
            sin_zero: [0; 8],
        };
        let rc = libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        );
        assert_eq!(rc, 0, "bind() failed");
        let rc = libc::listen(fd, 128);
        assert_eq!(rc, 0, "listen() failed");

        let mut actual: libc::sockaddr_in = std::mem::zeroed();
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let rc = libc::getsockname(fd, &mut actual as *mut _ as *mut libc::sockaddr, &mut len);
        assert_eq!(rc, 0, "getsockname() failed");
        (fd, u16::from_be(actual.sin_port))
    }
}

fn echo(client_fd: RawFd, _coroutine: &Coroutine) -> isize {
    let mut buf = [0u8; 4096];
    loop {
        match io::read(client_fd, &mut buf) {
            Ok(0) => return 0,
            Ok(n) => {
                let mut written = 0;
                while written < n {
                    match io::write(client_fd, &buf[written..n]) {
                        Ok(w) => written += w,
                        Err(_) => return -1,
                    }
                }
            }
            Err(_) => return -1,
        }
    }
}

/// A listener whose "echo" is actually scenario 5: attempt a `connect` to a closed local port
/// from inside a coroutine, then report success/failure back over the accepted connection.
fn connect_probe(client_fd: RawFd, _coroutine: &Coroutine) -> isize {
    let closed_addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
    let probe_fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    assert!(probe_fd >= 0);
    unsafe {
        let flags = libc::fcntl(probe_fd, libc::F_GETFL, 0);
        libc::fcntl(probe_fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }

    let msg: &[u8] = match io::connect(probe_fd, &closed_addr) {
        Ok(()) => b"UNEXPECTED-OK\n",
        Err(_) => b"REFUSED\n",
    };
    unsafe { libc::close(probe_fd) };

    let _ = io::write(client_fd, msg);
    let _ = io::close(client_fd);
    0
}

#[test]
fn echo_server_round_trips_several_concurrent_connections() {
    let (fd, port) = listen_socket();

    let mut runtime = RuntimeBuilder::new()
        .min_count(2)
        .max_count(64)
        .shrink_interval_ms(200)
        .shrink_batch(2)
        .poll_capacity(64)
        .build()
        .expect("runtime init");
    runtime.add_listen(fd, echo).expect("add_listen");
    let stop = runtime.stop_handle();

    let handle = thread::spawn(move || runtime.run_loop());
    thread::sleep(Duration::from_millis(50));

    let mut clients = Vec::new();
    for _ in 0..8 {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
        stream.write_all(b"hello\n").expect("write");
        clients.push(stream);
    }
    for mut stream in clients {
        let mut buf = [0u8; 6];
        stream.read_exact(&mut buf).expect("read");
        assert_eq!(&buf, b"hello\n");
    }

    stop.stop();
    handle.join().expect("run_loop thread panicked");
}

#[test]
fn connect_to_a_closed_port_is_observed_as_refused_from_inside_a_coroutine() {
    let (fd, port) = listen_socket();

    let mut runtime = RuntimeBuilder::new()
        .min_count(1)
        .max_count(4)
        .shrink_interval_ms(200)
        .shrink_batch(1)
        .poll_capacity(16)
        .build()
        .expect("runtime init");
    runtime.add_listen(fd, connect_probe).expect("add_listen");
    let stop = runtime.stop_handle();

    let handle = thread::spawn(move || runtime.run_loop());
    thread::sleep(Duration::from_millis(50));

    let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).expect("read");
    assert_eq!(buf, b"REFUSED\n");

    stop.stop();
    handle.join().expect("run_loop thread panicked");
}
