//! Multiplexed session over a single transport.
//!
//! # Output
//!
//! Frames from every stream go through two FIFO queues, priority and normal.
//! Whoever holds the writer lock drains them: it pops the next frame
//! (priority first), assigns a stream id to SYN_STREAM frames, deflates the
//! header block, serializes the head, and writes until the transport stops
//! accepting bytes. A partially written frame stays "in progress" inside the
//! writer and is always finished before the next one starts, so frame bytes
//! never interleave on the wire.
//!
//! Senders wait on a condition variable for their own frame's completion
//! flag, re-running the drain themselves after `drain_retry` when a
//! non-blocking transport pushed back.
//!
//! # Input
//!
//! The reader accumulates the 8-byte head, parses it, accumulates the body,
//! and dispatches. Bytes read past the end of a frame seed the next one.
//! On a blocking transport the read loop only returns once the connection
//! closes; on a non-blocking one it returns at the first would-block.
//!
//! # Failure
//!
//! Any framing, codec or transport error in either direction aborts the
//! whole connection: streams are released, blocked senders return
//! [`Error::Closed`], and the transport is closed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::{self, Write as _};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace, warn};

use crate::compress::{HeaderCompressor, HeaderDeflater, HeaderInflater};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::frame::{Control, Frame, FrameType, RstStatus, Setting};
use crate::stream::Stream;
use crate::transport::{IoMode, TcpTransport, Transfer, Transport};

/// Priority given to PING frames so they jump the normal queue.
pub const PING_PRIORITY: u8 = 0x80;

/// Which end of the connection this side is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    /// First id for locally-opened streams: odd for clients, even for servers.
    pub fn first_stream_id(self) -> u32 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }
}

/// Result of [`Connection::drain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drain {
    /// Both queues are empty and nothing is in progress.
    Idle,
    /// The transport stopped accepting bytes; call again when writable.
    Blocked,
    Closed,
}

/// Result of [`Connection::process_input`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    /// The transport has no more bytes for now; call again when readable.
    Pending,
    Closed,
}

struct Outgoing {
    frame: Frame,
    stream: Option<Arc<Stream>>,
    done: Option<Arc<AtomicBool>>,
}

struct State {
    streams: HashMap<u32, Arc<Stream>>,
    priority: VecDeque<Outgoing>,
    normal: VecDeque<Outgoing>,
    next_stream_id: u32,
    /// Highest stream id opened by the peer.
    last_remote_id: u32,
    next_ping_id: u32,
    /// Our pings still waiting for their echo.
    pings: HashSet<u32>,
    peer_settings: Vec<Setting>,
}

struct Writer {
    transport: Box<dyn Transport>,
    current: Option<Outgoing>,
    deflater: Option<HeaderDeflater>,
}

struct Reader {
    transport: Box<dyn Transport>,
    frame: Option<Frame>,
    inflater: Option<HeaderInflater>,
}

struct Inner {
    context: Arc<Context>,
    role: Role,
    closed: AtomicBool,
    state: Mutex<State>,
    /// Signalled whenever a frame finishes writing, and on close.
    sent: Condvar,
    writer: Mutex<Writer>,
    reader: Mutex<Reader>,
}

/// Handle to a session; cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Connection over separate reader and writer halves of one transport.
    pub fn new(
        context: Arc<Context>,
        role: Role,
        reader: impl Transport,
        writer: impl Transport,
    ) -> Result<Self> {
        let (deflater, inflater) = if context.compression() {
            let (deflater, inflater) = HeaderCompressor::with_limit(context.max_header_block_size())?.split();
            (Some(deflater), Some(inflater))
        } else {
            (None, None)
        };
        let first = role.first_stream_id();

        Ok(Self {
            inner: Arc::new(Inner {
                context,
                role,
                closed: AtomicBool::new(false),
                state: Mutex::new(State {
                    streams: HashMap::new(),
                    priority: VecDeque::new(),
                    normal: VecDeque::new(),
                    next_stream_id: first,
                    last_remote_id: 0,
                    next_ping_id: first,
                    pings: HashSet::new(),
                    peer_settings: Vec::new(),
                }),
                sent: Condvar::new(),
                writer: Mutex::new(Writer {
                    transport: Box::new(writer),
                    current: None,
                    deflater,
                }),
                reader: Mutex::new(Reader {
                    transport: Box::new(reader),
                    frame: None,
                    inflater,
                }),
            }),
        })
    }

    /// Connection over a TCP socket.
    pub fn tcp(context: Arc<Context>, role: Role, stream: TcpStream, mode: IoMode) -> Result<Self> {
        let (reader, writer) = TcpTransport::split(stream, mode)?;
        Self::new(context, role, reader, writer)
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.inner.context
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Streams currently registered.
    pub fn open_streams(&self) -> usize {
        self.inner.state.lock().streams.len()
    }

    pub fn stream(&self, id: u32) -> Option<Arc<Stream>> {
        self.inner.state.lock().streams.get(&id).cloned()
    }

    /// Last SETTINGS received from the peer.
    pub fn peer_settings(&self) -> Vec<Setting> {
        self.inner.state.lock().peer_settings.clone()
    }

    // ------------------------------------------------------------------
    // Streams
    // ------------------------------------------------------------------

    /// New local stream; it gets an id when its SYN_STREAM is sent.
    pub fn new_stream(&self) -> Arc<Stream> {
        self.inner.context.new_stream(self)
    }

    /// Open a stream with a body-less GET for `url` on `host`.
    pub fn get(&self, host: &str, url: &str) -> Result<Arc<Stream>> {
        let stream = self.new_stream();
        stream.add_header("host", host)?;
        stream.add_header("url", url)?;
        stream.send()?;
        Ok(stream)
    }

    fn lookup(&self, id: u32) -> Option<Arc<Stream>> {
        self.inner.state.lock().streams.get(&id).cloned()
    }

    /// Whether `id` was handed out on this connection at some point.
    fn was_allocated(&self, id: u32) -> bool {
        if id == 0 {
            return false;
        }
        let state = self.inner.state.lock();
        if id % 2 == self.inner.role.first_stream_id() % 2 {
            id < state.next_stream_id
        } else {
            id <= state.last_remote_id
        }
    }

    fn release_if_finished(&self, stream: &Arc<Stream>) {
        if stream.is_finished() {
            let mut state = self.inner.state.lock();
            release(&mut state, stream);
        }
    }

    // ------------------------------------------------------------------
    // Output
    // ------------------------------------------------------------------

    /// Queue `frame` and block until it has been fully written.
    ///
    /// Returns [`Error::Closed`] if the connection closes first; the frame
    /// may or may not have reached the peer.
    pub fn send_frame_blocking(&self, frame: Frame, stream: Option<&Arc<Stream>>) -> Result<()> {
        let done = Arc::new(AtomicBool::new(false));
        self.enqueue(frame, stream.cloned(), Some(done.clone()))?;
        loop {
            self.drain();
            if done.load(Ordering::Acquire) {
                return Ok(());
            }
            let mut state = self.inner.state.lock();
            if done.load(Ordering::Acquire) {
                return Ok(());
            }
            if self.is_closed() {
                return Err(Error::Closed);
            }
            self.inner
                .sent
                .wait_for(&mut state, self.inner.context.drain_retry());
        }
    }

    /// Queue `frame` and drain on the context's executor.
    pub fn send_frame_non_blocking(&self, frame: Frame, stream: Option<&Arc<Stream>>) -> Result<()> {
        self.enqueue(frame, stream.cloned(), None)?;
        let connection = self.clone();
        self.inner.context.execute(Box::new(move || {
            connection.drain();
        }));
        Ok(())
    }

    fn enqueue(&self, mut frame: Frame, stream: Option<Arc<Stream>>, done: Option<Arc<AtomicBool>>) -> Result<()> {
        frame.prepare_send();
        let mut state = self.inner.state.lock();
        if self.is_closed() {
            drop(state);
            self.inner.context.recycle(frame);
            return Err(Error::Closed);
        }
        let urgent = frame.priority() != 0;
        let out = Outgoing { frame, stream, done };
        if urgent {
            state.priority.push_back(out);
        } else {
            state.normal.push_back(out);
        }
        Ok(())
    }

    /// Write queued frames until the queues are empty or the transport
    /// pushes back. Safe to call from any thread; only one writes at a time.
    pub fn drain(&self) -> Drain {
        let mut writer = self.inner.writer.lock();
        match self.drain_locked(&mut writer) {
            Ok(status) => status,
            Err(e) => {
                if let Some(out) = writer.current.take() {
                    self.inner.context.recycle(out.frame);
                }
                if let Err(close_err) = writer.transport.close() {
                    debug!(error = %close_err, "transport close failed");
                }
                drop(writer);
                self.abort(&e);
                Drain::Closed
            }
        }
    }

    fn drain_locked(&self, writer: &mut Writer) -> Result<Drain> {
        let Writer {
            transport,
            current,
            deflater,
        } = writer;

        loop {
            if self.is_closed() {
                return Ok(Drain::Closed);
            }
            if current.is_none() {
                match self.next_outgoing(deflater.as_mut())? {
                    Some(out) => *current = Some(out),
                    None => return Ok(Drain::Idle),
                }
            }
            let Some(out) = current.as_mut() else {
                continue;
            };

            while !out.frame.is_written() {
                match transport.write(out.frame.unwritten())? {
                    Transfer::Bytes(n) => out.frame.mark_written(n),
                    Transfer::WouldBlock => return Ok(Drain::Blocked),
                    Transfer::Closed => return Err(Error::Closed),
                }
            }
            if let Some(out) = current.take() {
                self.frame_written(out);
            }
        }
    }

    /// Pop the next frame and make it ready for the wire.
    fn next_outgoing(&self, deflater: Option<&mut HeaderDeflater>) -> Result<Option<Outgoing>> {
        let mut out = {
            let mut state = self.inner.state.lock();
            let next = match state.priority.pop_front() {
                Some(out) => Some(out),
                None => state.normal.pop_front(),
            };
            let Some(mut out) = next else {
                return Ok(None);
            };

            match out.frame.frame_type() {
                FrameType::SynStream => {
                    // ids are assigned in wire order, under the same lock
                    // the reader uses for lookups
                    let id = state.next_stream_id;
                    if state.streams.contains_key(&id) {
                        drop(state);
                        if let Some(stream) = &out.stream {
                            stream.abandon();
                        }
                        self.inner.context.recycle(out.frame);
                        return Err(Error::DuplicateStream(id));
                    }
                    state.next_stream_id += 2;
                    out.frame.set_stream_id(id);
                    if let Some(stream) = &out.stream {
                        stream.assign_id(id);
                        state.streams.insert(id, stream.clone());
                        debug!(stream_id = id, "stream opened");
                    }
                }
                FrameType::Data => {
                    if let Some(stream) = &out.stream {
                        out.frame.set_stream_id(stream.id());
                    }
                }
                _ => {}
            }
            out
        };

        out.frame.finish_headers();
        if let Some(deflater) = deflater {
            out.frame.compress_headers(deflater)?;
        }
        out.frame.serialize_head();
        trace!(frame = %out.frame, "send");
        Ok(Some(out))
    }

    fn frame_written(&self, out: Outgoing) {
        let Outgoing { frame, stream, done } = out;
        if let Some(stream) = &stream {
            if frame.is_half_close() {
                stream.mark_fin_sent();
            }
        }
        self.inner.context.recycle(frame);
        if let Some(done) = done {
            done.store(true, Ordering::Release);
        }

        let mut state = self.inner.state.lock();
        if let Some(stream) = &stream {
            if stream.is_finished() {
                release(&mut state, stream);
            }
        }
        self.inner.sent.notify_all();
    }

    // ------------------------------------------------------------------
    // Input
    // ------------------------------------------------------------------

    /// Read and dispatch frames until the transport would block or the
    /// connection closes.
    pub fn process_input(&self) -> Input {
        let mut reader = self.inner.reader.lock();
        match self.read_frames(&mut reader) {
            Ok(input) => input,
            Err(e) => {
                if let Some(frame) = reader.frame.take() {
                    self.inner.context.recycle(frame);
                }
                if let Err(close_err) = reader.transport.close() {
                    debug!(error = %close_err, "transport close failed");
                }
                drop(reader);
                match e {
                    Error::Closed => self.close_with("peer closed the transport"),
                    e => self.abort(&e),
                }
                Input::Closed
            }
        }
    }

    /// Reader loop for blocking transports: runs until the connection closes.
    ///
    /// On a non-blocking transport this returns at the first would-block;
    /// drive those with [`Connection::process_input`] instead.
    pub fn run(&self) {
        if self.process_input() == Input::Pending {
            debug!("transport would block, leaving the reader loop");
        }
    }

    /// Run the reader loop on the context's executor.
    pub fn start(&self) {
        let connection = self.clone();
        self.inner.context.execute(Box::new(move || connection.run()));
    }

    fn read_frames(&self, reader: &mut Reader) -> Result<Input> {
        let context = &self.inner.context;
        loop {
            if self.is_closed() {
                if let Err(e) = reader.transport.close() {
                    debug!(error = %e, "transport close failed");
                }
                return Ok(Input::Closed);
            }

            let frame = reader.frame.get_or_insert_with(|| context.frame());
            if !frame.is_complete() {
                if frame.has_head() && !frame.is_parsed() {
                    frame.parse(context.max_frame_size())?;
                    continue;
                }
                match reader.transport.read(frame.read_space())? {
                    Transfer::Bytes(n) => frame.record_read(n),
                    Transfer::WouldBlock => return Ok(Input::Pending),
                    Transfer::Closed => return Err(Error::Closed),
                }
                continue;
            }

            let Some(mut frame) = reader.frame.take() else {
                continue;
            };
            if frame.filled() > frame.end() {
                let mut next = context.frame();
                frame.split_surplus(&mut next);
                reader.frame = Some(next);
            }
            self.dispatch(frame, reader.inflater.as_mut())?;
        }
    }

    fn dispatch(&self, mut frame: Frame, inflater: Option<&mut HeaderInflater>) -> Result<()> {
        if !frame.is_control() {
            trace!(frame = %frame, "recv");
            return self.on_data(frame);
        }

        let control = frame.decode_control(inflater)?;
        trace!(frame = %frame, "recv");
        match control {
            Control::SynStream { stream_id, .. } => self.on_syn_stream(stream_id, frame),
            Control::SynReply { stream_id } | Control::Headers { stream_id } => {
                let stream = self.lookup(stream_id).ok_or(Error::UnknownStream(stream_id))?;
                stream.on_ctl_frame(frame);
                self.release_if_finished(&stream);
                Ok(())
            }
            Control::RstStream { stream_id, status } => self.on_rst_stream(stream_id, status, frame),
            Control::Settings(settings) => {
                debug!(count = settings.len(), "SETTINGS received");
                self.inner.context.recycle(frame);
                self.inner.state.lock().peer_settings = settings;
                Ok(())
            }
            Control::Noop => {
                self.inner.context.recycle(frame);
                Ok(())
            }
            Control::Ping(id) => {
                self.inner.context.recycle(frame);
                self.on_ping(id)
            }
            Control::GoAway { last_stream_id } => {
                self.inner.context.recycle(frame);
                self.on_goaway(last_stream_id);
                Ok(())
            }
        }
    }

    fn on_data(&self, frame: Frame) -> Result<()> {
        let id = frame.stream_id();
        match self.lookup(id) {
            Some(stream) => {
                stream.on_data_frame(frame);
                self.release_if_finished(&stream);
                Ok(())
            }
            None if self.was_allocated(id) => {
                debug!(stream_id = id, "dropping DATA for closed stream");
                self.inner.context.recycle(frame);
                Ok(())
            }
            None => Err(Error::UnknownStream(id)),
        }
    }

    fn on_syn_stream(&self, stream_id: u32, frame: Frame) -> Result<()> {
        if stream_id == 0 {
            return Err(Error::malformed("SYN_STREAM", "stream id 0"));
        }
        if stream_id % 2 == self.inner.role.first_stream_id() % 2 {
            return Err(Error::malformed("SYN_STREAM", "stream id has the receiver's parity"));
        }
        let stream = self.inner.context.new_stream(self);
        stream.assign_id(stream_id);
        {
            let mut state = self.inner.state.lock();
            // peer ids only grow, so anything at or below the last one is a reuse
            if stream_id <= state.last_remote_id || state.streams.contains_key(&stream_id) {
                return Err(Error::DuplicateStream(stream_id));
            }
            state.streams.insert(stream_id, stream.clone());
            state.last_remote_id = state.last_remote_id.max(stream_id);
        }
        debug!(stream_id, "stream accepted");
        stream.on_ctl_frame(frame);
        self.inner.context.stream_accepted(self, stream);
        Ok(())
    }

    fn on_rst_stream(&self, stream_id: u32, status: RstStatus, frame: Frame) -> Result<()> {
        match self.lookup(stream_id) {
            Some(stream) => {
                stream.on_ctl_frame(frame);
                self.release_if_finished(&stream);
                Ok(())
            }
            None if self.was_allocated(stream_id) => {
                debug!(stream_id, %status, "ignoring RST_STREAM for closed stream");
                self.inner.context.recycle(frame);
                Ok(())
            }
            None => Err(Error::UnknownStream(stream_id)),
        }
    }

    fn on_ping(&self, id: u32) -> Result<()> {
        if self.inner.state.lock().pings.remove(&id) {
            debug!(ping_id = id, "PING answered");
            return Ok(());
        }
        let mut echo = self.inner.context.pool().ping(id);
        echo.set_priority(PING_PRIORITY);
        self.send_frame_non_blocking(echo, None)
    }

    fn on_goaway(&self, last_stream_id: u32) {
        info!(last_stream_id, "GOAWAY received");
        let refused: Vec<Arc<Stream>> = {
            let mut state = self.inner.state.lock();
            let ids: Vec<u32> = state
                .streams
                .keys()
                .copied()
                .filter(|id| *id > last_stream_id)
                .collect();
            ids.iter().filter_map(|id| state.streams.remove(id)).collect()
        };
        for stream in refused {
            stream.on_reset(RstStatus::RefusedStream);
        }
        self.close_with("peer sent GOAWAY");
    }

    // ------------------------------------------------------------------
    // Control
    // ------------------------------------------------------------------

    /// Send a PING and return its id; the echo is consumed silently.
    pub fn ping(&self) -> Result<u32> {
        let id = {
            let mut state = self.inner.state.lock();
            let id = state.next_ping_id;
            state.next_ping_id = state.next_ping_id.wrapping_add(2);
            state.pings.insert(id);
            id
        };
        let mut frame = self.inner.context.pool().ping(id);
        frame.set_priority(PING_PRIORITY);
        self.send_frame_blocking(frame, None)?;
        Ok(id)
    }

    /// Pings sent by us and not yet echoed.
    pub fn outstanding_pings(&self) -> usize {
        self.inner.state.lock().pings.len()
    }

    pub fn send_settings(&self, settings: &[Setting]) -> Result<()> {
        let frame = self.inner.context.pool().settings(settings);
        self.send_frame_blocking(frame, None)
    }

    /// Tell the peer we are done, then close.
    pub fn goaway(&self) -> Result<()> {
        let last_stream_id = self.inner.state.lock().last_remote_id;
        let frame = self.inner.context.pool().goaway(last_stream_id);
        let sent = self.send_frame_blocking(frame, None);
        if sent.is_ok() {
            info!(last_stream_id, "GOAWAY sent");
        }
        self.close_with("local GOAWAY");
        sent
    }

    /// Close without telling the peer.
    pub fn close(&self) {
        self.close_with("closed locally");
    }

    /// Tear the connection down after an error.
    pub fn abort(&self, reason: impl fmt::Display) {
        if self.mark_closed() {
            warn!(reason = %reason, "connection aborted");
            self.release_all();
        }
    }

    fn close_with(&self, reason: &str) {
        if self.mark_closed() {
            debug!(reason, "connection closed");
            self.release_all();
        }
    }

    /// True for the first caller only.
    fn mark_closed(&self) -> bool {
        !self.inner.closed.swap(true, Ordering::AcqRel)
    }

    fn release_all(&self) {
        let (streams, queued) = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let streams: Vec<Arc<Stream>> = state.streams.drain().map(|(_, stream)| stream).collect();
            let queued: Vec<Outgoing> = state.priority.drain(..).chain(state.normal.drain(..)).collect();
            self.inner.sent.notify_all();
            (streams, queued)
        };

        for stream in &streams {
            stream.abandon();
        }
        for out in queued {
            if let Some(stream) = &out.stream {
                stream.abandon();
            }
            self.inner.context.recycle(out.frame);
        }

        // A writer stuck mid-frame notices the closed flag on its own.
        if let Some(mut writer) = self.inner.writer.try_lock() {
            if let Some(out) = writer.current.take() {
                self.inner.context.recycle(out.frame);
            }
            if let Err(e) = writer.transport.close() {
                debug!(error = %e, "transport close failed");
            }
        }
    }

    /// Human-readable snapshot of the connection and its streams.
    pub fn dump(&self) -> String {
        let state = self.inner.state.lock();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:?} connection: closed={} streams={} priority={} normal={} next_stream_id={} last_remote_id={}",
            self.inner.role,
            self.is_closed(),
            state.streams.len(),
            state.priority.len(),
            state.normal.len(),
            state.next_stream_id,
            state.last_remote_id,
        );
        let mut ids: Vec<u32> = state.streams.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            if let Some(stream) = state.streams.get(&id) {
                let _ = writeln!(out, "  {:?}", stream);
            }
        }
        out
    }
}

fn release(state: &mut State, stream: &Arc<Stream>) {
    let id = stream.id();
    if state.streams.remove(&id).is_some() {
        debug!(stream_id = id, "stream finished");
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Connection");
        s.field("role", &self.inner.role)
            .field("closed", &self.is_closed());
        match self.inner.state.try_lock() {
            Some(state) => s
                .field("streams", &state.streams.len())
                .field("priority", &state.priority.len())
                .field("normal", &state.normal.len())
                .finish(),
            None => s.finish_non_exhaustive(),
        }
    }
}
