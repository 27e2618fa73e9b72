//! Readiness-driven connections on mio.
//!
//! A [`Poller`] owns a mio `Poll` and drives every registered connection
//! from the thread that calls [`Poller::poll`]: readable sockets run the
//! connection's input state machine until the socket would block, writable
//! sockets resume the output drain. Listeners accept new server-side
//! connections on the same loop.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use mio::net::{TcpListener as MioTcpListener, TcpStream as MioTcpStream};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use tracing::{debug, warn};

use crate::connection::{Connection, Role};
use crate::context::Context;
use crate::error::Result;
use crate::transport::{retry, Transfer, Transport};

/// Token offset for listeners to avoid collision with connections.
const LISTENER_TOKEN_OFFSET: usize = 1 << 30;

/// One direction of a non-blocking mio socket.
#[derive(Debug, Clone)]
pub struct MioTransport {
    socket: Arc<MioTcpStream>,
}

impl MioTransport {
    pub fn new(socket: Arc<MioTcpStream>) -> Self {
        Self { socket }
    }
}

impl Transport for MioTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<Transfer> {
        retry(|| (&*self.socket).read(buf))
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<Transfer> {
        retry(|| (&*self.socket).write(buf))
    }

    fn close(&mut self) -> io::Result<()> {
        match self.socket.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

struct Registered {
    connection: Connection,
    socket: Arc<MioTcpStream>,
}

struct Listener {
    listener: MioTcpListener,
    context: Arc<Context>,
}

/// Event loop for non-blocking connections.
pub struct Poller {
    poll: Poll,
    events: Events,
    connections: Slab<Registered>,
    listeners: Slab<Listener>,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(256),
            connections: Slab::new(),
            listeners: Slab::new(),
        })
    }

    /// Accept server connections on `addr`; returns the bound address.
    pub fn listen(&mut self, addr: SocketAddr, context: Arc<Context>) -> Result<SocketAddr> {
        let mut listener = MioTcpListener::bind(addr)?;
        let local = listener.local_addr()?;

        let entry = self.listeners.vacant_entry();
        self.poll.registry().register(
            &mut listener,
            Token(entry.key() + LISTENER_TOKEN_OFFSET),
            Interest::READABLE,
        )?;
        entry.insert(Listener { listener, context });
        debug!(%local, "listening");
        Ok(local)
    }

    /// Drive an already-connected socket.
    pub fn register(&mut self, context: Arc<Context>, role: Role, stream: std::net::TcpStream) -> Result<Connection> {
        stream.set_nonblocking(true)?;
        self.register_mio(context, role, MioTcpStream::from_std(stream))
    }

    fn register_mio(&mut self, context: Arc<Context>, role: Role, stream: MioTcpStream) -> Result<Connection> {
        stream.set_nodelay(true)?;
        let socket = Arc::new(stream);

        let entry = self.connections.vacant_entry();
        self.poll.registry().register(
            &mut SourceFd(&socket.as_raw_fd()),
            Token(entry.key()),
            Interest::READABLE | Interest::WRITABLE,
        )?;
        let connection = Connection::new(
            context,
            role,
            MioTransport::new(socket.clone()),
            MioTransport::new(socket.clone()),
        )?;
        entry.insert(Registered {
            connection: connection.clone(),
            socket,
        });
        Ok(connection)
    }

    /// Connections currently driven by this poller.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Wait for readiness and service it. Returns the number of events handled.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        match self.poll.poll(&mut self.events, timeout) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            other => other?,
        }

        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|event| {
                let readable = event.is_readable() || event.is_read_closed() || event.is_error();
                (event.token(), readable, event.is_writable())
            })
            .collect();

        for &(token, readable, writable) in &ready {
            if token.0 >= LISTENER_TOKEN_OFFSET {
                self.accept(token.0 - LISTENER_TOKEN_OFFSET);
                continue;
            }
            let Some(registered) = self.connections.get(token.0) else {
                continue;
            };
            if readable {
                registered.connection.process_input();
            }
            if writable {
                registered.connection.drain();
            }
        }

        self.reap();
        Ok(ready.len())
    }

    fn accept(&mut self, id: usize) {
        loop {
            let Some(listener) = self.listeners.get(id) else {
                return;
            };
            match listener.listener.accept() {
                Ok((stream, peer)) => {
                    let context = listener.context.clone();
                    match self.register_mio(context, Role::Server, stream) {
                        Ok(_) => debug!(%peer, "accepted connection"),
                        Err(e) => warn!(%peer, error = %e, "failed to register connection"),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    /// Drop closed connections so their slots can be reused.
    fn reap(&mut self) {
        let closed: Vec<usize> = self
            .connections
            .iter()
            .filter(|(_, registered)| registered.connection.is_closed())
            .map(|(key, _)| key)
            .collect();
        for key in closed {
            let registered = self.connections.remove(key);
            let fd = registered.socket.as_raw_fd();
            if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
                debug!(error = %e, "deregister failed");
            }
        }
    }
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("connections", &self.connections.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
