/*
 * This file is a part of Skytable
 * Skytable (formerly known as TerrabaseDB or Skybase) is a free and open-source
 * NoSQL database written by Sayan Nandan ("the Author") with the
 * vision to provide flexibility in data modelling without compromising
 * on performance, queryability or scalability.
*/

//! # TCP server
//!
//! One accept loop, one `std::thread` per connection — the blocking-threads
//! concurrency model the base spec mandates, rather than the teacher's own
//! `tokio`-driven `dbnet::tcp::RawListener`. The accept loop polls a
//! nonblocking listener instead of relying on a wakeable async select, since
//! there's no async runtime here to provide one.

use {
    crate::{
        command::{CommandHandler, ConnectionState},
        resp::{self, Reply},
    },
    libcommon::BUF_CAP,
    std::{
        io::{self, Read, Write},
        net::{SocketAddr, TcpListener, TcpStream},
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread,
        time::Duration,
    },
};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(200);
const CONN_READ_TIMEOUT: Duration = Duration::from_millis(200);

pub struct TcpServer {
    listener: TcpListener,
    handler: Arc<CommandHandler>,
    stop: Arc<AtomicBool>,
}

impl TcpServer {
    pub fn bind(addr: SocketAddr, handler: Arc<CommandHandler>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            handler,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// A clone of this server's stop flag, for wiring up signal handlers
    /// before calling `run`.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Blocks until the stop flag is set, accepting connections and spawning
    /// one thread per connection. Returns once every spawned connection
    /// thread has finished its current command and exited.
    pub fn run(self) {
        let mut connection_threads = Vec::new();
        while !self.stop.load(Ordering::Acquire) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    log::info!("accepted connection from {peer}");
                    let handler = Arc::clone(&self.handler);
                    let stop = Arc::clone(&self.stop);
                    connection_threads.push(thread::spawn(move || handle_connection(stream, handler, stop)));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => {
                    log::error!("accept failed: {e}");
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
            }
            connection_threads.retain(|h| !h.is_finished());
        }
        log::info!("tcp server: draining {} in-flight connection(s)", connection_threads.len());
        for handle in connection_threads {
            let _ = handle.join();
        }
    }
}

fn handle_connection(mut stream: TcpStream, handler: Arc<CommandHandler>, stop: Arc<AtomicBool>) {
    if let Err(e) = stream.set_read_timeout(Some(CONN_READ_TIMEOUT)) {
        log::warn!("failed to set read timeout: {e}");
    }
    let mut conn = ConnectionState::new(handler.requires_auth());
    let mut buf = Vec::with_capacity(BUF_CAP);
    let mut chunk = vec![0u8; BUF_CAP];
    loop {
        if stop.load(Ordering::Acquire) {
            break;
        }
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if !drain_commands(&mut stream, &mut buf, &handler, &mut conn) {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) => {
                log::debug!("connection read error: {e}");
                break;
            }
        }
    }
}

/// Parses and dispatches every complete command currently buffered. Returns
/// `false` if the connection should be torn down (protocol error or a failed
/// write back to the socket).
fn drain_commands(stream: &mut TcpStream, buf: &mut Vec<u8>, handler: &CommandHandler, conn: &mut ConnectionState) -> bool {
    loop {
        match resp::try_parse_command(buf) {
            Ok(Some(args)) => {
                let reply = handler.dispatch(&args, conn);
                if reply.write_to(stream).is_err() {
                    return false;
                }
            }
            Ok(None) => return true,
            Err(()) => {
                let _ = Reply::Error("Protocol error: malformed RESP input".to_string()).write_to(stream);
                return false;
            }
        }
    }
}
