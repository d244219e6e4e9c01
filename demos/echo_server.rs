//! A minimal echo server: each accepted connection gets its own coroutine, written in
//! straight-line blocking-looking style even though every `io::read`/`io::write` call actually
//! suspends the coroutine and returns control to the event loop whenever the socket isn't ready.
//!
//! Socket setup (bind/listen) is explicitly outside this crate's core (§1 scope) — the demo does
//! it directly with `libc`, the way an application embedding this runtime would.

use std::os::unix::io::RawFd;

use ef_coroutine::{io, Coroutine, RuntimeBuilder};

fn listen_socket(port: u16) -> RawFd {
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
            sin_port: port.to_be(),
            sin_addr: libc::in_addr { s_addr: 0 }, // INADDR_ANY
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

        fd
    }
}

fn echo(client_fd: RawFd, _coroutine: &Coroutine) -> isize {
    let mut buf = [0u8; 8192];
    loop {
        let n = match io::read(client_fd, &mut buf) {
            Ok(0) => return 0, // peer closed
            Ok(n) => n,
            Err(e) => {
                eprintln!("read error on fd={client_fd}: {e}");
                return -1;
            }
        };

        let mut written = 0;
        while written < n {
            match io::write(client_fd, &buf[written..n]) {
                Ok(w) => written += w,
                Err(e) => {
                    eprintln!("write error on fd={client_fd}: {e}");
                    return -1;
                }
            }
        }
    }
}

fn main() {
    env_logger::init();

    let fd = listen_socket(18080);

    let mut runtime = RuntimeBuilder::new()
        .min_count(16)
        .max_count(4096)
        .shrink_interval_ms(30_000)
        .shrink_batch(8)
        .build()
        .expect("runtime init");

    runtime.add_listen(fd, echo).expect("add_listen");

    let stop = runtime.stop_handle();
    ctrlc_stop(stop);

    println!("echo server listening on 127.0.0.1:18080");
    runtime.run_loop();
}

/// Wires `SIGINT` to the runtime's `stop_handle`, the "settable from outside" path §6 names.
fn ctrlc_stop(stop: ef_coroutine::StopHandle) {
    use std::sync::OnceLock;
    static STOP: OnceLock<ef_coroutine::StopHandle> = OnceLock::new();
    let _ = STOP.set(stop);

    extern "C" fn on_sigint(_sig: libc::c_int) {
        if let Some(stop) = STOP.get() {
            stop.stop();
        }
    }

    unsafe {
        libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t);
    }
}
