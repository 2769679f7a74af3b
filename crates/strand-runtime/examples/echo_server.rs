//! TCP echo server on the IoManager.
//!
//! ```text
//! cargo run -p strand-runtime --example echo_server -- 127.0.0.1:7000
//! ```
//!
//! Every connection is served by its own fiber that parks on the reactor
//! whenever the socket would block. Press enter to shut down.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::io::{self, BufRead, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use strand_runtime::{Event, IoManager, Readiness};
use tracing::{debug, info, warn};

#[derive(Default)]
struct Connections {
    open: Mutex<FxHashMap<RawFd, TcpStream>>,
    closing: AtomicBool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7000".to_string())
        .parse()?;

    let listener = TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    let local = listener.local_addr()?;
    info!(%local, "echo server listening, press enter to stop");

    let io = IoManager::new(4, false, "echo")?;
    let connections = Arc::new(Connections::default());

    let acceptor_io = io.clone();
    let acceptor_conns = connections.clone();
    io.schedule(move || accept_loop(acceptor_io, listener, acceptor_conns));

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;

    info!("shutting down");
    connections.closing.store(true, Ordering::Release);
    // wake the acceptor in case it is parked on the listener
    let _ = TcpStream::connect(local);
    for stream in connections.open.lock().values() {
        let _ = stream.shutdown(Shutdown::Both);
    }

    io.stop();
    info!("bye");
    Ok(())
}

fn accept_loop(io: IoManager, listener: TcpListener, connections: Arc<Connections>) {
    let fd = listener.as_raw_fd();
    while !connections.closing.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(err) = stream.set_nonblocking(true) {
                    warn!(%peer, error = %err, "dropping connection");
                    continue;
                }
                if let Ok(handle) = stream.try_clone() {
                    connections.open.lock().insert(stream.as_raw_fd(), handle);
                }
                debug!(%peer, "accepted");

                let conn_io = io.clone();
                let conns = connections.clone();
                io.schedule(move || {
                    let fd = stream.as_raw_fd();
                    if let Err(err) = serve(&conn_io, stream) {
                        debug!(%peer, error = %err, "connection closed with error");
                    }
                    conns.open.lock().remove(&fd);
                });
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                match io.wait_event(fd, Event::READ) {
                    Ok(Readiness::Ready) => {}
                    Ok(Readiness::Cancelled) => break,
                    Err(err) => {
                        warn!(error = %err, "cannot wait on listener");
                        break;
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "accept failed");
                break;
            }
        }
    }
    info!("acceptor stopped");
}

fn serve(io: &IoManager, mut stream: TcpStream) -> io::Result<()> {
    let fd = stream.as_raw_fd();
    let mut buf = [0u8; 4096];
    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                park(io, fd, Event::READ)?;
                continue;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };

        let mut written = 0;
        while written < n {
            match stream.write(&buf[written..n]) {
                Ok(m) => written += m,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    park(io, fd, Event::WRITE)?;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }
}

/// Park the current fiber until `fd` is ready for `event`
fn park(io: &IoManager, fd: RawFd, event: Event) -> io::Result<()> {
    match io.wait_event(fd, event) {
        Ok(Readiness::Ready) => Ok(()),
        Ok(Readiness::Cancelled) => Err(io::ErrorKind::ConnectionAborted.into()),
        Err(err) => Err(io::Error::new(io::ErrorKind::Other, err)),
    }
}
