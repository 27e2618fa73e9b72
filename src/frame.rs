//! SPDY frame buffer: header parsing, serialization and name/value blocks.
//!
//! A [`Frame`] is a single growable byte buffer holding one wire frame,
//! header included, plus the cursors needed to build it, read it back and
//! write it out incrementally:
//!
//! - `off`: write position while building, read position after parsing,
//!   transmit position while being sent.
//! - `end`: boundary of the frame's valid bytes (8-byte header included).
//! - `filled`: bytes received from the transport so far (inbound only). May
//!   run past `end` when a read picked up the start of the next frame.
//!
//! Control frame bodies are decoded once, at parse time, into a [`Control`]
//! value; later code matches on that instead of re-inspecting type codes.
//!
//! Wire layout (big-endian):
//!
//! ```text
//! control: |1| version(15) | type(16) | flags(8) | length(24) | body...
//! data:    |0| stream id(31)          | flags(8) | length(24) | payload...
//! ```

use std::collections::HashMap;
use std::fmt;

use crate::compress::{HeaderDeflater, HeaderInflater};
use crate::error::{Error, Result};

/// Protocol version spoken by this engine.
pub const VERSION: u16 = 2;

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 8;

/// Largest length representable in the 24-bit length field.
pub const MAX_LENGTH: usize = 0x00FF_FFFF;

/// Default initial buffer size for a frame.
pub const DEFAULT_FRAME_SIZE: usize = 16 * 1024;

/// Default cap on the total size of an inbound frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Offset of the name/value block (its count field) in a SYN_STREAM frame.
pub const SYN_STREAM_NV_OFFSET: usize = 18;

/// Offset of the name/value block in SYN_REPLY and HEADERS frames.
pub const SYN_REPLY_NV_OFFSET: usize = 14;

const STREAM_ID_MASK: u32 = 0x7FFF_FFFF;

/// Frame flags
pub mod flags {
    /// Sender half-closes the stream with this frame.
    pub const FIN: u8 = 0x1;
    /// SYN_STREAM only: the recipient must not reply with data.
    pub const UNIDIRECTIONAL: u8 = 0x2;
}

/// Frame kind, control type or plain data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameType {
    #[default]
    Data,
    SynStream,
    SynReply,
    RstStream,
    Settings,
    Noop,
    Ping,
    GoAway,
    /// Type 8; shares its code with WINDOW_UPDATE in later protocol drafts.
    Headers,
}

impl FrameType {
    /// Map a control frame type code to a frame type.
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(FrameType::SynStream),
            2 => Some(FrameType::SynReply),
            3 => Some(FrameType::RstStream),
            4 => Some(FrameType::Settings),
            5 => Some(FrameType::Noop),
            6 => Some(FrameType::Ping),
            7 => Some(FrameType::GoAway),
            8 => Some(FrameType::Headers),
            _ => None,
        }
    }

    /// Control type code, 0 for data frames.
    pub fn code(self) -> u16 {
        match self {
            FrameType::Data => 0,
            FrameType::SynStream => 1,
            FrameType::SynReply => 2,
            FrameType::RstStream => 3,
            FrameType::Settings => 4,
            FrameType::Noop => 5,
            FrameType::Ping => 6,
            FrameType::GoAway => 7,
            FrameType::Headers => 8,
        }
    }

    pub fn is_control(self) -> bool {
        self != FrameType::Data
    }

    pub fn name(self) -> &'static str {
        match self {
            FrameType::Data => "DATA",
            FrameType::SynStream => "SYN_STREAM",
            FrameType::SynReply => "SYN_REPLY",
            FrameType::RstStream => "RST_STREAM",
            FrameType::Settings => "SETTINGS",
            FrameType::Noop => "NOOP",
            FrameType::Ping => "PING",
            FrameType::GoAway => "GOAWAY",
            FrameType::Headers => "HEADERS",
        }
    }

    /// Offset of the name/value block, for frame types that carry one.
    pub fn nv_offset(self) -> Option<usize> {
        match self {
            FrameType::SynStream => Some(SYN_STREAM_NV_OFFSET),
            FrameType::SynReply | FrameType::Headers => Some(SYN_REPLY_NV_OFFSET),
            _ => None,
        }
    }

    /// Bytes reserved in front of the first body byte appended while building.
    fn body_start(self) -> usize {
        match self.nv_offset() {
            // fixed fields plus the 16-bit pair count
            Some(nv) => nv + 2,
            None => HEADER_LEN,
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// RST_STREAM status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RstStatus {
    ProtocolError,
    InvalidStream,
    RefusedStream,
    UnsupportedVersion,
    Cancel,
    InternalError,
    FlowControlError,
    Other(u32),
}

impl RstStatus {
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => RstStatus::ProtocolError,
            2 => RstStatus::InvalidStream,
            3 => RstStatus::RefusedStream,
            4 => RstStatus::UnsupportedVersion,
            5 => RstStatus::Cancel,
            6 => RstStatus::InternalError,
            7 => RstStatus::FlowControlError,
            other => RstStatus::Other(other),
        }
    }

    pub fn code(self) -> u32 {
        match self {
            RstStatus::ProtocolError => 1,
            RstStatus::InvalidStream => 2,
            RstStatus::RefusedStream => 3,
            RstStatus::UnsupportedVersion => 4,
            RstStatus::Cancel => 5,
            RstStatus::InternalError => 6,
            RstStatus::FlowControlError => 7,
            RstStatus::Other(code) => code,
        }
    }
}

impl fmt::Display for RstStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RstStatus::ProtocolError => f.write_str("PROTOCOL_ERROR"),
            RstStatus::InvalidStream => f.write_str("INVALID_STREAM"),
            RstStatus::RefusedStream => f.write_str("REFUSED_STREAM"),
            RstStatus::UnsupportedVersion => f.write_str("UNSUPPORTED_VERSION"),
            RstStatus::Cancel => f.write_str("CANCEL"),
            RstStatus::InternalError => f.write_str("INTERNAL_ERROR"),
            RstStatus::FlowControlError => f.write_str("FLOW_CONTROL_ERROR"),
            RstStatus::Other(code) => write!(f, "UNKNOWN({})", code),
        }
    }
}

/// One SETTINGS entry. Values are carried, not interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Setting {
    pub flags: u8,
    /// 24-bit identifier.
    pub id: u32,
    pub value: u32,
}

/// Decoded body of a control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    SynStream {
        stream_id: u32,
        associated_stream_id: u32,
        priority: u8,
    },
    SynReply {
        stream_id: u32,
    },
    Headers {
        stream_id: u32,
    },
    RstStream {
        stream_id: u32,
        status: RstStatus,
    },
    Settings(Vec<Setting>),
    Noop,
    Ping(u32),
    GoAway {
        last_stream_id: u32,
    },
}

/// A single SPDY frame and its buffer.
#[derive(Debug, Default)]
pub struct Frame {
    data: Vec<u8>,
    off: usize,
    end: usize,
    filled: usize,
    frame_type: FrameType,
    flags: u8,
    stream_id: u32,
    associated_stream_id: u32,
    priority: u8,
    nv_count: u16,
    nv_start: usize,
}

impl Frame {
    /// Empty data frame with a buffer of `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity.max(HEADER_LEN)],
            ..Self::default()
        }
    }

    /// Empty control frame of the given type.
    pub fn control(frame_type: FrameType) -> Self {
        let mut frame = Self::with_capacity(256);
        frame.frame_type = frame_type;
        frame
    }

    /// Data frame carrying `payload` on `stream_id`.
    pub fn data(stream_id: u32, payload: &[u8], fin: bool) -> Self {
        let mut frame = Self::with_capacity(HEADER_LEN + payload.len());
        frame.stream_id = stream_id & STREAM_ID_MASK;
        frame.append_bytes(payload);
        frame.set_half_close(fin);
        frame
    }

    /// PING carrying a 32-bit opaque id.
    pub fn ping(id: u32) -> Self {
        let mut frame = Self::control(FrameType::Ping);
        frame.write_ping(id);
        frame
    }

    /// RST_STREAM for `stream_id`.
    pub fn rst_stream(stream_id: u32, status: RstStatus) -> Self {
        let mut frame = Self::control(FrameType::RstStream);
        frame.write_rst_stream(stream_id, status);
        frame
    }

    /// GOAWAY naming the last stream this side processed.
    pub fn goaway(last_stream_id: u32) -> Self {
        let mut frame = Self::control(FrameType::GoAway);
        frame.write_goaway(last_stream_id);
        frame
    }

    /// SETTINGS frame with the given entries.
    pub fn settings(settings: &[Setting]) -> Self {
        let mut frame = Self::control(FrameType::Settings);
        frame.write_settings(settings);
        frame
    }

    // Bodies of the fixed-layout control frames, written into a blank frame
    // of the right type (fresh or from a pool).

    pub(crate) fn write_ping(&mut self, id: u32) {
        self.append_u32(id);
    }

    pub(crate) fn write_rst_stream(&mut self, stream_id: u32, status: RstStatus) {
        self.stream_id = stream_id & STREAM_ID_MASK;
        self.append_u32(stream_id & STREAM_ID_MASK);
        self.append_u32(status.code());
    }

    pub(crate) fn write_goaway(&mut self, last_stream_id: u32) {
        self.append_u32(last_stream_id & STREAM_ID_MASK);
    }

    pub(crate) fn write_settings(&mut self, settings: &[Setting]) {
        self.append_u32(settings.len() as u32);
        for setting in settings {
            self.append_u8(setting.flags);
            self.append_u24(setting.id);
            self.append_u32(setting.value);
        }
    }

    /// Parse a complete frame out of `bytes`.
    pub fn from_bytes(bytes: &[u8], max_frame_size: usize) -> Result<Self> {
        let mut frame = Self::with_capacity(bytes.len());
        frame.data[..bytes.len()].copy_from_slice(bytes);
        frame.filled = bytes.len();
        if !frame.has_head() {
            return Err(Error::malformed("frame", "shorter than the 8-byte header"));
        }
        frame.parse(max_frame_size)?;
        if !frame.is_complete() {
            return Err(Error::malformed(frame.frame_type.name(), "truncated body"));
        }
        Ok(frame)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    pub fn is_control(&self) -> bool {
        self.frame_type.is_control()
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn associated_stream_id(&self) -> u32 {
        self.associated_stream_id
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn nv_count(&self) -> u16 {
        self.nv_count
    }

    /// Total frame length including the header, once known.
    pub fn end(&self) -> usize {
        self.end
    }

    /// Length field value: body bytes after the 8-byte header.
    pub fn body_len(&self) -> usize {
        self.end.saturating_sub(HEADER_LEN)
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn is_half_close(&self) -> bool {
        self.flags & flags::FIN != 0
    }

    pub fn set_half_close(&mut self, fin: bool) {
        if fin {
            self.flags |= flags::FIN;
        } else {
            self.flags &= !flags::FIN;
        }
    }

    pub fn set_type(&mut self, frame_type: FrameType) {
        self.frame_type = frame_type;
    }

    pub fn set_flags(&mut self, flags: u8) {
        self.flags = flags;
    }

    pub fn set_stream_id(&mut self, stream_id: u32) {
        self.stream_id = stream_id & STREAM_ID_MASK;
    }

    pub fn set_associated_stream_id(&mut self, stream_id: u32) {
        self.associated_stream_id = stream_id & STREAM_ID_MASK;
    }

    /// Non-zero priority sends the frame through the connection's priority queue.
    pub fn set_priority(&mut self, priority: u8) {
        self.priority = priority;
    }

    /// Data frame payload not yet consumed by the application.
    pub fn payload(&self) -> &[u8] {
        &self.data[self.off.min(self.end)..self.end]
    }

    pub fn remaining(&self) -> usize {
        self.end.saturating_sub(self.off)
    }

    /// Mark `n` payload bytes as consumed.
    pub fn advance(&mut self, n: usize) {
        self.off = (self.off + n).min(self.end);
    }

    /// Reset every field for reuse; the buffer itself is kept.
    pub fn recycle(&mut self) {
        self.off = 0;
        self.end = 0;
        self.filled = 0;
        self.frame_type = FrameType::Data;
        self.flags = 0;
        self.stream_id = 0;
        self.associated_stream_id = 0;
        self.priority = 0;
        self.nv_count = 0;
        self.nv_start = 0;
    }

    // ------------------------------------------------------------------
    // Building
    // ------------------------------------------------------------------

    /// Grow the buffer so that it holds at least `needed` bytes.
    ///
    /// Growth is at least geometric so repeated appends stay amortized.
    pub fn ensure_capacity(&mut self, needed: usize) {
        if needed > self.data.len() {
            let new_len = (self.data.len() * 2).max(needed);
            self.data.resize(new_len, 0);
        }
    }

    fn reserve_head(&mut self) {
        if self.off == 0 {
            self.off = self.frame_type.body_start();
            self.ensure_capacity(self.off);
        }
    }

    pub fn append_u8(&mut self, value: u8) {
        self.append_bytes(&[value]);
    }

    pub fn append_u16(&mut self, value: u16) {
        self.append_bytes(&value.to_be_bytes());
    }

    pub fn append_u24(&mut self, value: u32) {
        self.append_bytes(&value.to_be_bytes()[1..]);
    }

    pub fn append_u32(&mut self, value: u32) {
        self.append_bytes(&value.to_be_bytes());
    }

    pub fn append_bytes(&mut self, bytes: &[u8]) {
        self.reserve_head();
        self.ensure_capacity(self.off + bytes.len());
        self.data[self.off..self.off + bytes.len()].copy_from_slice(bytes);
        self.off += bytes.len();
    }

    fn append_string(&mut self, bytes: &[u8]) -> Result<()> {
        let len = u16::try_from(bytes.len())
            .map_err(|_| Error::malformed(self.frame_type.name(), "header longer than 65535 bytes"))?;
        self.append_u16(len);
        self.append_bytes(bytes);
        Ok(())
    }

    /// Append a header name and count a new name/value pair.
    pub fn header_name(&mut self, name: &[u8]) -> Result<()> {
        let count = self
            .nv_count
            .checked_add(1)
            .ok_or_else(|| Error::malformed(self.frame_type.name(), "more than 65535 headers"))?;
        self.append_string(name)?;
        self.nv_count = count;
        Ok(())
    }

    /// Append the value for the most recent header name.
    pub fn header_value(&mut self, value: &[u8]) -> Result<()> {
        self.append_string(value)
    }

    pub fn add_header(&mut self, name: &str, value: &str) -> Result<()> {
        self.header_name(name.as_bytes())?;
        self.header_value(value.as_bytes())
    }

    /// Write the pair count into the name/value block.
    pub(crate) fn finish_headers(&mut self) {
        if let Some(nv) = self.frame_type.nv_offset() {
            self.ensure_capacity(nv + 2);
            self.data[nv..nv + 2].copy_from_slice(&self.nv_count.to_be_bytes());
        }
    }

    /// Freeze the built body: `end` becomes the write cursor and the
    /// cursor rewinds to the start of the frame.
    pub(crate) fn prepare_send(&mut self) {
        self.reserve_head();
        self.end = self.off;
        self.off = 0;
    }

    /// Write the 8-byte header and the type-specific fixed fields.
    ///
    /// Returns the number of header bytes written; it depends on the type.
    pub fn serialize_head(&mut self) -> usize {
        let length = self.body_len() as u32;
        if self.frame_type.is_control() {
            self.put_u16(0, 0x8000 | VERSION);
            self.put_u16(2, self.frame_type.code());
        } else {
            self.put_u32(0, self.stream_id & STREAM_ID_MASK);
        }
        self.data[4] = self.flags;
        self.data[5..8].copy_from_slice(&length.to_be_bytes()[1..]);

        match self.frame_type {
            FrameType::SynStream => {
                self.put_u32(8, self.stream_id);
                self.put_u32(12, self.associated_stream_id);
                self.data[16] = self.priority;
                self.data[17] = 0;
                SYN_STREAM_NV_OFFSET
            }
            FrameType::SynReply | FrameType::Headers => {
                self.put_u32(8, self.stream_id);
                self.put_u16(12, 0);
                SYN_REPLY_NV_OFFSET
            }
            _ => HEADER_LEN,
        }
    }

    /// Finish an uncompressed frame and return its wire bytes.
    ///
    /// Consumes the building state; the frame is ready to be parsed or sent
    /// afterwards, not appended to.
    pub fn encode(&mut self) -> &[u8] {
        self.prepare_send();
        self.finish_headers();
        self.serialize_head();
        &self.data[..self.end]
    }

    /// Like [`Frame::encode`], deflating the name/value block on the way.
    pub fn encode_compressed(&mut self, deflater: &mut HeaderDeflater) -> Result<&[u8]> {
        self.prepare_send();
        self.finish_headers();
        self.compress_headers(deflater)?;
        self.serialize_head();
        Ok(&self.data[..self.end])
    }

    /// Deflate the name/value block of a prepared frame, if it has one.
    pub(crate) fn compress_headers(&mut self, deflater: &mut HeaderDeflater) -> Result<()> {
        match self.frame_type.nv_offset() {
            Some(nv) => deflater.compress(self, nv),
            None => Ok(()),
        }
    }

    fn put_u16(&mut self, at: usize, value: u16) {
        self.data[at..at + 2].copy_from_slice(&value.to_be_bytes());
    }

    fn put_u32(&mut self, at: usize, value: u32) {
        self.data[at..at + 4].copy_from_slice(&value.to_be_bytes());
    }

    /// Bytes of a prepared frame not yet accepted by the transport.
    pub(crate) fn unwritten(&self) -> &[u8] {
        &self.data[self.off..self.end]
    }

    pub(crate) fn mark_written(&mut self, n: usize) {
        self.off = (self.off + n).min(self.end);
    }

    pub(crate) fn is_written(&self) -> bool {
        self.off == self.end
    }

    // ------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------

    /// Free space for the next transport read, growing the buffer if full.
    pub(crate) fn read_space(&mut self) -> &mut [u8] {
        let target = if self.end > 0 { self.end } else { self.filled + 1 };
        self.ensure_capacity(target.max(self.filled + 1));
        &mut self.data[self.filled..]
    }

    pub(crate) fn record_read(&mut self, n: usize) {
        self.filled += n;
    }

    pub(crate) fn filled(&self) -> usize {
        self.filled
    }

    pub(crate) fn has_head(&self) -> bool {
        self.filled >= HEADER_LEN
    }

    pub(crate) fn is_parsed(&self) -> bool {
        self.end > 0
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.end > 0 && self.filled >= self.end
    }

    /// Move bytes read past this frame's end into `next`.
    pub(crate) fn split_surplus(&mut self, next: &mut Frame) {
        let extra = self.filled.saturating_sub(self.end);
        if extra == 0 {
            return;
        }
        next.ensure_capacity(extra);
        next.data[..extra].copy_from_slice(&self.data[self.end..self.filled]);
        next.filled = extra;
        self.filled = self.end;
    }

    /// Parse the 8-byte header: kind, version, type, flags and length.
    ///
    /// The body is not touched; see [`Frame::decode_control`].
    pub fn parse(&mut self, max_frame_size: usize) -> Result<()> {
        let head = &self.data[..HEADER_LEN];
        if head[0] & 0x80 != 0 {
            let version = u16::from_be_bytes([head[0], head[1]]) & 0x7FFF;
            if version != VERSION {
                return Err(Error::UnsupportedVersion(version));
            }
            let code = u16::from_be_bytes([head[2], head[3]]);
            self.frame_type = FrameType::from_code(code).ok_or(Error::UnknownFrameType(code))?;
        } else {
            self.frame_type = FrameType::Data;
            self.stream_id = u32::from_be_bytes([head[0], head[1], head[2], head[3]]) & STREAM_ID_MASK;
        }
        self.flags = head[4];
        let length = u32::from_be_bytes([0, head[5], head[6], head[7]]) as usize;

        let end = length + HEADER_LEN;
        if end > max_frame_size {
            return Err(Error::FrameTooLarge {
                size: end,
                max: max_frame_size,
            });
        }
        self.end = end;
        self.off = HEADER_LEN;
        self.ensure_capacity(end);
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&[u8]> {
        if self.off + n > self.end {
            return Err(Error::malformed(self.frame_type.name(), "body too short"));
        }
        let bytes = &self.data[self.off..self.off + n];
        self.off += n;
        Ok(bytes)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u24(&mut self) -> Result<u32> {
        let b = self.take(3)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Decode the body of a parsed control frame.
    ///
    /// Header blocks are inflated in place first when an inflater is given.
    pub fn decode_control(&mut self, inflater: Option<&mut HeaderInflater>) -> Result<Control> {
        self.off = HEADER_LEN;
        match self.frame_type {
            FrameType::SynStream => {
                self.stream_id = self.read_u32()? & STREAM_ID_MASK;
                self.associated_stream_id = self.read_u32()? & STREAM_ID_MASK;
                self.priority = self.read_u8()?;
                self.read_u8()?;
                self.decode_nv_block(inflater)?;
                Ok(Control::SynStream {
                    stream_id: self.stream_id,
                    associated_stream_id: self.associated_stream_id,
                    priority: self.priority,
                })
            }
            FrameType::SynReply | FrameType::Headers => {
                self.stream_id = self.read_u32()? & STREAM_ID_MASK;
                self.read_u16()?;
                self.decode_nv_block(inflater)?;
                if self.frame_type == FrameType::SynReply {
                    Ok(Control::SynReply { stream_id: self.stream_id })
                } else {
                    Ok(Control::Headers { stream_id: self.stream_id })
                }
            }
            FrameType::RstStream => {
                self.stream_id = self.read_u32()? & STREAM_ID_MASK;
                let status = RstStatus::from_code(self.read_u32()?);
                Ok(Control::RstStream {
                    stream_id: self.stream_id,
                    status,
                })
            }
            FrameType::Settings => {
                let count = self.read_u32()? as usize;
                if count.saturating_mul(8) > self.remaining() {
                    return Err(Error::malformed("SETTINGS", "entry count exceeds body"));
                }
                let mut settings = Vec::with_capacity(count);
                for _ in 0..count {
                    let flags = self.read_u8()?;
                    let id = self.read_u24()?;
                    let value = self.read_u32()?;
                    settings.push(Setting { flags, id, value });
                }
                Ok(Control::Settings(settings))
            }
            FrameType::Noop => Ok(Control::Noop),
            FrameType::Ping => Ok(Control::Ping(self.read_u32()?)),
            FrameType::GoAway => Ok(Control::GoAway {
                last_stream_id: self.read_u32()? & STREAM_ID_MASK,
            }),
            FrameType::Data => Err(Error::malformed("DATA", "not a control frame")),
        }
    }

    fn decode_nv_block(&mut self, inflater: Option<&mut HeaderInflater>) -> Result<()> {
        let start = self.off;
        if let Some(inflater) = inflater {
            if self.end > start {
                inflater.decompress(self, start)?;
            }
        }
        self.nv_count = if self.end > start { self.read_u16()? } else { 0 };
        self.nv_start = self.off;
        Ok(())
    }

    /// Decode the name/value block in wire order, duplicates included.
    pub fn header_pairs(&self) -> Result<Vec<(String, String)>> {
        let name = self.frame_type.name();
        let limit = self.end.max(self.off);
        let mut pos = match (self.nv_start, self.frame_type.nv_offset()) {
            (0, Some(nv)) => nv + 2,
            (0, None) => return Ok(Vec::new()),
            (start, _) => start,
        };

        let read_string = |pos: &mut usize| -> Result<String> {
            if *pos + 2 > limit {
                return Err(Error::malformed(name, "truncated header length"));
            }
            let len = u16::from_be_bytes([self.data[*pos], self.data[*pos + 1]]) as usize;
            *pos += 2;
            if *pos + len > limit {
                return Err(Error::malformed(name, "truncated header string"));
            }
            let s = String::from_utf8_lossy(&self.data[*pos..*pos + len]).into_owned();
            *pos += len;
            Ok(s)
        };

        let mut pairs = Vec::with_capacity(self.nv_count as usize);
        for _ in 0..self.nv_count {
            let name = read_string(&mut pos)?;
            let value = read_string(&mut pos)?;
            pairs.push((name, value));
        }
        Ok(pairs)
    }

    /// Status carried by a received RST_STREAM frame.
    pub fn rst_status(&self) -> Option<RstStatus> {
        if self.frame_type != FrameType::RstStream || self.end < HEADER_LEN + 8 {
            return None;
        }
        let b = &self.data[12..16];
        Some(RstStatus::from_code(u32::from_be_bytes([b[0], b[1], b[2], b[3]])))
    }

    /// Decode the name/value block into a map; later duplicates win.
    pub fn headers(&self) -> Result<HashMap<String, String>> {
        Ok(self.header_pairs()?.into_iter().collect())
    }

    // ------------------------------------------------------------------
    // Compression support
    // ------------------------------------------------------------------

    /// Valid frame bytes, header included.
    pub(crate) fn bytes(&self) -> &[u8] {
        &self.data[..self.end]
    }

    /// Replace the buffer with `buf` (whose valid length becomes the frame
    /// end); the old buffer is handed back through `buf` for reuse.
    pub(crate) fn swap_buffer(&mut self, buf: &mut Vec<u8>) {
        std::mem::swap(&mut self.data, buf);
        self.end = self.data.len();
        self.filled = self.end;
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} stream={} len={} flags={:#x}",
            self.frame_type,
            self.stream_id,
            self.body_len(),
            self.flags
        )
    }
}
