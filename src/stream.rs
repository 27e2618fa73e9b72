//! One logical request/response exchange on a connection.
//!
//! The connection's reader feeds a stream through `on_ctl_frame` and
//! `on_data_frame`; application threads consume it with [`Stream::get_in`]
//! and write to it with the `send*` family, each of which blocks until its
//! frame is on the wire.
//!
//! A stream is finished once both sides have half-closed it. A reset, local
//! or remote, finishes it at once.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::frame::{Frame, FrameType, RstStatus, HEADER_LEN};

/// Protocol version advertised in request and reply header blocks.
pub const HTTP_VERSION: &str = "HTTP/1.1";

enum Inbound {
    Data(Frame),
    /// Peer half-closed; nothing follows.
    End,
}

#[derive(Default)]
struct StreamState {
    /// Local request under construction; becomes the SYN_STREAM.
    request: Option<Frame>,
    opened: bool,
    /// SYN_STREAM received from the peer.
    syn: Option<Frame>,
    /// SYN_REPLY received from the peer.
    reply: Option<Frame>,
    /// HEADERS received after the reply.
    headers: Vec<Frame>,
    inbound: VecDeque<Inbound>,
    fin_sent: bool,
    fin_rcvd: bool,
    reset: Option<RstStatus>,
    /// Connection went away before the peer half-closed.
    aborted: bool,
}

/// A multiplexed stream.
pub struct Stream {
    connection: Connection,
    id: AtomicU32,
    state: Mutex<StreamState>,
    readable: Condvar,
}

impl Stream {
    pub(crate) fn new(connection: Connection) -> Arc<Self> {
        Arc::new(Self {
            connection,
            id: AtomicU32::new(0),
            state: Mutex::new(StreamState::default()),
            readable: Condvar::new(),
        })
    }

    /// Stream id; 0 until a locally-opened stream's SYN_STREAM is sent.
    pub fn id(&self) -> u32 {
        self.id.load(Ordering::Acquire)
    }

    pub(crate) fn assign_id(&self, id: u32) {
        self.id.store(id, Ordering::Release);
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Add a header to the request this stream will be opened with.
    pub fn add_header(&self, name: &str, value: &str) -> Result<()> {
        let context = self.connection.context();
        let mut state = self.state.lock();
        if state.opened {
            return Err(Error::StreamFinished);
        }
        state
            .request
            .get_or_insert_with(|| context.control_frame(FrameType::SynStream))
            .add_header(name, value)
    }

    /// Open the stream with a body-less GET.
    pub fn send(self: &Arc<Self>) -> Result<()> {
        self.send_request("GET", "http", true)
    }

    /// Finish the request and send it as SYN_STREAM.
    ///
    /// `close` half-closes the stream when no body follows. Blocks until the
    /// frame is written; the stream id is known once this returns.
    pub fn send_request(self: &Arc<Self>, method: &str, scheme: &str, close: bool) -> Result<()> {
        let context = self.connection.context();
        let frame = {
            let mut state = self.state.lock();
            if state.opened {
                return Err(Error::StreamFinished);
            }
            let mut frame = state
                .request
                .take()
                .unwrap_or_else(|| context.control_frame(FrameType::SynStream));
            frame.add_header("method", method)?;
            frame.add_header("scheme", scheme)?;
            frame.add_header("version", HTTP_VERSION)?;
            frame.set_half_close(close);
            state.opened = true;
            frame
        };
        self.connection.send_frame_blocking(frame, Some(self))
    }

    /// Answer a peer-opened stream with SYN_REPLY.
    ///
    /// A `version` header is added unless `headers` carries one.
    pub fn send_reply(self: &Arc<Self>, headers: &[(&str, &str)], close: bool) -> Result<()> {
        let with_version = !headers.iter().any(|(name, _)| *name == "version");
        self.send_header_block(FrameType::SynReply, headers, with_version, close)
    }

    /// Send additional headers after the reply.
    pub fn send_headers(self: &Arc<Self>, headers: &[(&str, &str)], close: bool) -> Result<()> {
        self.send_header_block(FrameType::Headers, headers, false, close)
    }

    fn send_header_block(
        self: &Arc<Self>,
        frame_type: FrameType,
        headers: &[(&str, &str)],
        with_version: bool,
        close: bool,
    ) -> Result<()> {
        self.check_writable()?;
        let mut frame = self.connection.context().control_frame(frame_type);
        frame.set_stream_id(self.id());
        for (name, value) in headers {
            frame.add_header(name, value)?;
        }
        if with_version {
            frame.add_header("version", HTTP_VERSION)?;
        }
        frame.set_half_close(close);
        self.connection.send_frame_blocking(frame, Some(self))
    }

    /// Send `data` on this stream, half-closing it with the last frame if
    /// `close` is set.
    ///
    /// Payloads larger than one frame are split; an empty payload still
    /// sends one (possibly FIN-only) frame.
    pub fn send_data_frame(self: &Arc<Self>, data: &[u8], close: bool) -> Result<()> {
        self.check_writable()?;
        let context = self.connection.context();
        let max_payload = context.max_frame_size().saturating_sub(HEADER_LEN).max(1);

        let mut rest = data;
        loop {
            let (chunk, tail) = rest.split_at(rest.len().min(max_payload));
            let last = tail.is_empty();

            let mut frame = context.pool().get(HEADER_LEN + chunk.len());
            frame.set_stream_id(self.id());
            frame.append_bytes(chunk);
            frame.set_half_close(close && last);
            self.connection.send_frame_blocking(frame, Some(self))?;

            if last {
                return Ok(());
            }
            rest = tail;
        }
    }

    /// Cancel the stream: mark it reset locally and tell the peer.
    pub fn reset(self: &Arc<Self>, status: RstStatus) -> Result<()> {
        if !self.on_reset(status) {
            return Ok(());
        }
        let id = self.id();
        if id == 0 {
            // never reached the wire
            return Ok(());
        }
        let frame = self.connection.context().pool().rst_stream(id, status);
        self.connection.send_frame_blocking(frame, Some(self))
    }

    fn check_writable(&self) -> Result<()> {
        let state = self.state.lock();
        if let Some(status) = state.reset {
            return Err(Error::Reset(status));
        }
        if state.aborted {
            return Err(Error::Closed);
        }
        if self.id() == 0 {
            return Err(Error::NotOpened);
        }
        if state.fin_sent {
            return Err(Error::StreamFinished);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Next inbound data frame, waiting up to `timeout`.
    ///
    /// Returns `None` at once when the peer has half-closed and the queue is
    /// drained, on reaching the end marker, or when the timeout expires.
    pub fn get_in(&self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        loop {
            match state.inbound.pop_front() {
                Some(Inbound::Data(frame)) => return Some(frame),
                Some(Inbound::End) => return None,
                None if state.fin_rcvd => return None,
                None => {}
            }
            match deadline {
                Some(deadline) => {
                    if self.readable.wait_until(&mut state, deadline).timed_out() {
                        return match state.inbound.pop_front() {
                            Some(Inbound::Data(frame)) => Some(frame),
                            _ => None,
                        };
                    }
                }
                None => self.readable.wait(&mut state),
            }
        }
    }

    /// Collect every remaining payload byte until the peer half-closes.
    ///
    /// `timeout` applies to each wait for a frame, not to the whole read.
    pub fn read_to_end(&self, timeout: Duration) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        while let Some(frame) = self.get_in(timeout) {
            body.extend_from_slice(frame.payload());
            self.recycle(frame);
        }

        let state = self.state.lock();
        if let Some(status) = state.reset {
            return Err(Error::Reset(status));
        }
        if state.aborted {
            return Err(Error::Closed);
        }
        if !state.fin_rcvd {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "timed out waiting for stream data").into());
        }
        Ok(body)
    }

    /// Hand a consumed frame back to the pool.
    pub fn recycle(&self, frame: Frame) {
        self.connection.context().recycle(frame);
    }

    /// Headers of the SYN_STREAM that opened a peer-initiated stream.
    pub fn request_headers(&self) -> Result<HashMap<String, String>> {
        match &self.state.lock().syn {
            Some(frame) => frame.headers(),
            None => Ok(HashMap::new()),
        }
    }

    /// Headers of the SYN_REPLY plus any later HEADERS frames.
    pub fn reply_headers(&self) -> Result<HashMap<String, String>> {
        let state = self.state.lock();
        let mut headers = HashMap::new();
        for frame in state.reply.iter().chain(state.headers.iter()) {
            headers.extend(frame.headers()?);
        }
        Ok(headers)
    }

    // ------------------------------------------------------------------
    // Connection callbacks (reader thread; must not block)
    // ------------------------------------------------------------------

    pub(crate) fn on_ctl_frame(&self, frame: Frame) {
        let context = self.connection.context();
        if frame.frame_type() == FrameType::RstStream {
            let status = frame.rst_status().unwrap_or(RstStatus::ProtocolError);
            context.recycle(frame);
            self.on_reset(status);
            return;
        }

        let fin = frame.is_half_close();
        let mut state = self.state.lock();
        match frame.frame_type() {
            FrameType::SynStream => {
                if let Some(old) = state.syn.replace(frame) {
                    context.recycle(old);
                }
            }
            FrameType::SynReply => {
                if let Some(old) = state.reply.replace(frame) {
                    context.recycle(old);
                }
            }
            FrameType::Headers => state.headers.push(frame),
            _ => context.recycle(frame),
        }
        if fin && !state.fin_rcvd {
            state.fin_rcvd = true;
            state.inbound.push_back(Inbound::End);
            self.readable.notify_all();
        }
    }

    pub(crate) fn on_data_frame(&self, frame: Frame) {
        let context = self.connection.context();
        let mut state = self.state.lock();
        if state.fin_rcvd {
            debug!(stream_id = self.id(), "dropping DATA after half-close");
            context.recycle(frame);
            return;
        }

        let fin = frame.is_half_close();
        if frame.remaining() > 0 {
            state.inbound.push_back(Inbound::Data(frame));
        } else {
            context.recycle(frame);
        }
        if fin {
            state.fin_rcvd = true;
            state.inbound.push_back(Inbound::End);
        }
        self.readable.notify_all();
    }

    /// Record a reset; false if the stream was already reset.
    pub(crate) fn on_reset(&self, status: RstStatus) -> bool {
        let mut state = self.state.lock();
        if state.reset.is_some() {
            return false;
        }
        debug!(stream_id = self.id(), %status, "stream reset");
        state.reset = Some(status);
        state.fin_sent = true;
        state.fin_rcvd = true;
        self.discard_inbound(&mut state);
        self.readable.notify_all();
        true
    }

    /// The connection is gone: release every reader.
    pub(crate) fn abandon(&self) {
        let mut state = self.state.lock();
        if state.fin_sent && state.fin_rcvd {
            return;
        }
        state.aborted = !state.fin_rcvd;
        state.fin_sent = true;
        state.fin_rcvd = true;
        self.discard_inbound(&mut state);
        self.readable.notify_all();
    }

    fn discard_inbound(&self, state: &mut StreamState) {
        let context = self.connection.context();
        for item in state.inbound.drain(..) {
            if let Inbound::Data(frame) = item {
                context.recycle(frame);
            }
        }
        state.inbound.push_back(Inbound::End);
    }

    pub(crate) fn mark_fin_sent(&self) {
        self.state.lock().fin_sent = true;
    }

    // ------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------

    /// Both directions half-closed (or the stream was reset).
    pub fn is_finished(&self) -> bool {
        let state = self.state.lock();
        state.fin_sent && state.fin_rcvd
    }

    pub fn fin_sent(&self) -> bool {
        self.state.lock().fin_sent
    }

    pub fn fin_rcvd(&self) -> bool {
        self.state.lock().fin_rcvd
    }

    pub fn reset_status(&self) -> Option<RstStatus> {
        self.state.lock().reset
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Stream");
        s.field("id", &self.id());
        match self.state.try_lock() {
            Some(state) => s
                .field("fin_sent", &state.fin_sent)
                .field("fin_rcvd", &state.fin_rcvd)
                .field("reset", &state.reset)
                .field("queued", &state.inbound.len())
                .finish(),
            None => s.finish_non_exhaustive(),
        }
    }
}
