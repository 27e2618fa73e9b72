//! Transport layer abstraction.
//!
//! A connection only ever calls [`Transport::read`] and [`Transport::write`],
//! so the same engine runs over a blocking socket on its own thread, a
//! non-blocking socket driven by readiness events, or any encrypted byte
//! stream handed in from outside (the TLS handshake is not our business).
//!
//! Connections take two transports, one per direction, since the reader
//! may be parked in a blocking `read` while application threads write.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};

/// Outcome of a single transport read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// This many bytes were moved (always > 0).
    Bytes(usize),
    /// Non-blocking transport has nothing to give or no room to take.
    WouldBlock,
    /// End of stream: the peer closed, no more bytes will ever move.
    Closed,
}

/// Raw byte transport under a connection.
pub trait Transport: Send + 'static {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<Transfer>;

    fn write(&mut self, buf: &[u8]) -> io::Result<Transfer>;

    /// Best-effort close.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<Transfer> {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<Transfer> {
        (**self).write(buf)
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

/// Map a `std::io` read/write result onto a [`Transfer`].
pub(crate) fn transfer(result: io::Result<usize>) -> io::Result<Transfer> {
    match result {
        Ok(0) => Ok(Transfer::Closed),
        Ok(n) => Ok(Transfer::Bytes(n)),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Transfer::WouldBlock),
        Err(e) => Err(e),
    }
}

/// Run `op`, retrying on `Interrupted`.
pub(crate) fn retry<F>(mut op: F) -> io::Result<Transfer>
where
    F: FnMut() -> io::Result<usize>,
{
    loop {
        match op() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return transfer(other),
        }
    }
}

/// Socket I/O mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    /// Reads park the reader thread until data arrives.
    Blocking,
    /// Reads and writes return `WouldBlock` instead of parking.
    NonBlocking,
}

/// TCP transport, blocking or non-blocking.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// Reader and writer halves over one socket.
    pub fn split(stream: TcpStream, mode: IoMode) -> io::Result<(TcpTransport, TcpTransport)> {
        stream.set_nonblocking(mode == IoMode::NonBlocking)?;
        stream.set_nodelay(true)?;
        let writer = stream.try_clone()?;
        Ok((TcpTransport::new(stream), TcpTransport::new(writer)))
    }
}

impl Transport for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<Transfer> {
        retry(|| self.stream.read(buf))
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<Transfer> {
        retry(|| self.stream.write(buf))
    }

    /// Shuts down both directions, which also wakes a reader parked on the
    /// other half.
    fn close(&mut self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

/// Transport over any `Read + Write` byte stream.
///
/// Meant for an already-established encrypted session or another opaque
/// provider; each direction gets its own value.
#[derive(Debug)]
pub struct IoTransport<S> {
    inner: S,
}

impl<S> IoTransport<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: Read + Write + Send + 'static> Transport for IoTransport<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<Transfer> {
        retry(|| self.inner.read(buf))
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<Transfer> {
        let written = retry(|| self.inner.write(buf))?;
        if let Transfer::Bytes(_) = written {
            // Buffered providers (TLS records) only hit the wire on flush.
            match self.inner.flush() {
                Err(e) if e.kind() != io::ErrorKind::WouldBlock => return Err(e),
                _ => {}
            }
        }
        Ok(written)
    }

    fn close(&mut self) -> io::Result<()> {
        match self.inner.flush() {
            Err(e) if e.kind() != io::ErrorKind::WouldBlock => Err(e),
            _ => Ok(()),
        }
    }
}
