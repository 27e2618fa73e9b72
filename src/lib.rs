//! spdy-session: a multiplexed SPDY/2 session engine
//!
//! This crate runs many logical request/response streams over one byte-stream
//! connection. It frames the wire, deflates header blocks with the shared
//! SPDY dictionary, routes inbound frames to their streams and serializes
//! outbound frames from every stream onto a single writer.
//!
//! # Features
//!
//! - **SPDY/2 Framing**: DATA, SYN_STREAM, SYN_REPLY, RST_STREAM, SETTINGS,
//!   NOOP, PING, GOAWAY and HEADERS frames
//! - **Header Compression**: stateful zlib with the protocol dictionary, via flate2
//! - **Prioritized Output**: PING and other urgent frames jump the normal queue;
//!   frames never interleave on the wire
//! - **Blocking or Non-blocking**: a thread per connection over blocking sockets,
//!   or a mio readiness loop over non-blocking ones
//! - **Frame Pool**: buffers are recycled by size class
//!
//! # Quick Start
//!
//! ```no_run
//! use std::net::TcpStream;
//! use std::time::Duration;
//! use spdy_session::{Connection, Context, IoMode, Role};
//!
//! let context = Context::new();
//! let socket = TcpStream::connect("127.0.0.1:8080")?;
//! let connection = Connection::tcp(context, Role::Client, socket, IoMode::Blocking)?;
//! connection.start();
//!
//! let stream = connection.get("example.com", "/")?;
//! let body = stream.read_to_end(Duration::from_secs(5))?;
//! println!("{:?} -> {} bytes", stream.reply_headers()?, body.len());
//! # Ok::<(), spdy_session::Error>(())
//! ```
//!
//! # Architecture
//!
//! - [`frame`]: wire format, one buffer per frame
//! - [`compress`]: header block deflate/inflate
//! - [`stream`] and [`connection`]: the session state machines
//! - [`transport`] and [`poll`]: byte transports and the readiness loop
//! - [`context`] and [`config`]: shared settings, executor, frame pool
//!
//! It does NOT provide:
//! - TLS (hand an established session in through [`IoTransport`])
//! - HTTP semantics (headers are opaque name/value pairs)
//! - Flow control beyond carrying SETTINGS values

pub mod compress;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod frame;
#[cfg(unix)]
pub mod poll;
pub mod pool;
pub mod stream;
pub mod transport;

pub use compress::{HeaderCompressor, HeaderDeflater, HeaderInflater, DICTIONARY, MAX_HEADER_BLOCK_SIZE};
pub use config::Config;
pub use connection::{Connection, Drain, Input, Role, PING_PRIORITY};
pub use context::{Context, ContextBuilder, Executor, Job, StreamHandler, ThreadExecutor};
pub use error::{Error, Result};
pub use frame::{
    flags, Control, Frame, FrameType, RstStatus, Setting, DEFAULT_FRAME_SIZE, DEFAULT_MAX_FRAME_SIZE, HEADER_LEN,
    SYN_REPLY_NV_OFFSET, SYN_STREAM_NV_OFFSET, VERSION,
};
#[cfg(unix)]
pub use poll::{MioTransport, Poller};
pub use pool::FramePool;
pub use stream::Stream;
pub use transport::{IoMode, IoTransport, TcpTransport, Transfer, Transport};
