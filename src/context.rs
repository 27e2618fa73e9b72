//! Shared connection context.
//!
//! One [`Context`] is created per listener (or per client) and referenced by
//! every [`Connection`] it spawns. It carries frame sizing, the compression
//! switch and header block limit, the frame pool, the executor used to run
//! work off the I/O thread, and the handler told about streams opened by the
//! peer.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::connection::Connection;
use crate::compress::MAX_HEADER_BLOCK_SIZE;
use crate::error::{Error, Result};
use crate::frame::{Frame, FrameType, DEFAULT_FRAME_SIZE, DEFAULT_MAX_FRAME_SIZE, HEADER_LEN, MAX_LENGTH};
use crate::pool::FramePool;
use crate::stream::Stream;

/// Default interval a blocked sender waits before retrying a drain.
pub const DEFAULT_DRAIN_RETRY: Duration = Duration::from_millis(10);

/// Default number of idle frames kept per pool size class.
pub const DEFAULT_POOL_CAPACITY: usize = 64;

/// A unit of work handed to an [`Executor`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs work asynchronously, off the calling thread.
pub trait Executor: Send + Sync + 'static {
    fn execute(&self, job: Job);
}

/// Spawns one named thread per job.
#[derive(Debug, Clone)]
pub struct ThreadExecutor {
    name: String,
}

impl ThreadExecutor {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for ThreadExecutor {
    fn default() -> Self {
        Self::new("spdy-worker")
    }
}

impl Executor for ThreadExecutor {
    fn execute(&self, job: Job) {
        if let Err(e) = thread::Builder::new().name(self.name.clone()).spawn(job) {
            warn!(error = %e, "failed to spawn worker thread");
        }
    }
}

/// Told about every stream the peer opens.
///
/// Runs on the context's executor, never on the connection's reader, so it
/// may block on the stream for as long as it likes.
pub trait StreamHandler: Send + Sync + 'static {
    fn on_stream(&self, connection: &Connection, stream: Arc<Stream>);
}

impl<F> StreamHandler for F
where
    F: Fn(&Connection, Arc<Stream>) + Send + Sync + 'static,
{
    fn on_stream(&self, connection: &Connection, stream: Arc<Stream>) {
        self(connection, stream)
    }
}

/// Per-listener configuration and factory for frames and streams.
pub struct Context {
    frame_size: usize,
    max_frame_size: usize,
    compression: bool,
    max_header_block_size: usize,
    drain_retry: Duration,
    pool: FramePool,
    executor: Arc<dyn Executor>,
    handler: Option<Arc<dyn StreamHandler>>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("frame_size", &self.frame_size)
            .field("max_frame_size", &self.max_frame_size)
            .field("compression", &self.compression)
            .field("max_header_block_size", &self.max_header_block_size)
            .field("drain_retry", &self.drain_retry)
            .field("idle_frames", &self.pool.idle())
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

impl Context {
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    /// Context with every default and no stream handler.
    pub fn new() -> Arc<Self> {
        Arc::new(ContextBuilder::default().build_unchecked())
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    pub fn compression(&self) -> bool {
        self.compression
    }

    /// Largest inflated header block accepted from the peer.
    pub fn max_header_block_size(&self) -> usize {
        self.max_header_block_size
    }

    pub fn drain_retry(&self) -> Duration {
        self.drain_retry
    }

    pub fn pool(&self) -> &FramePool {
        &self.pool
    }

    /// Fresh frame of the default size, from the pool.
    pub fn frame(&self) -> Frame {
        self.pool.get(self.frame_size)
    }

    /// Fresh control frame, from the pool.
    pub fn control_frame(&self, frame_type: FrameType) -> Frame {
        self.pool.control(frame_type)
    }

    pub fn recycle(&self, frame: Frame) {
        self.pool.recycle(frame);
    }

    pub fn execute(&self, job: Job) {
        self.executor.execute(job);
    }

    /// Stream factory: every stream on a connection of this context is made here.
    pub fn new_stream(&self, connection: &Connection) -> Arc<Stream> {
        Stream::new(connection.clone())
    }

    /// Hand a peer-opened stream to the handler, off the reader thread.
    pub(crate) fn stream_accepted(&self, connection: &Connection, stream: Arc<Stream>) {
        let Some(handler) = self.handler.clone() else {
            debug!(stream_id = stream.id(), "no stream handler installed");
            return;
        };
        let connection = connection.clone();
        self.execute(Box::new(move || handler.on_stream(&connection, stream)));
    }
}

/// Builder for [`Context`].
pub struct ContextBuilder {
    frame_size: usize,
    max_frame_size: usize,
    compression: bool,
    max_header_block_size: usize,
    drain_retry: Duration,
    pool_capacity: usize,
    executor: Option<Arc<dyn Executor>>,
    handler: Option<Arc<dyn StreamHandler>>,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self {
            frame_size: DEFAULT_FRAME_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            compression: true,
            max_header_block_size: MAX_HEADER_BLOCK_SIZE,
            drain_retry: DEFAULT_DRAIN_RETRY,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            executor: None,
            handler: None,
        }
    }
}

impl fmt::Debug for ContextBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextBuilder")
            .field("frame_size", &self.frame_size)
            .field("max_frame_size", &self.max_frame_size)
            .field("compression", &self.compression)
            .field("max_header_block_size", &self.max_header_block_size)
            .field("drain_retry", &self.drain_retry)
            .field("pool_capacity", &self.pool_capacity)
            .finish()
    }
}

impl ContextBuilder {
    /// Initial buffer capacity of inbound frames.
    pub fn frame_size(mut self, size: usize) -> Self {
        self.frame_size = size;
        self
    }

    /// Largest inbound frame accepted, header included.
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    /// Largest inflated header block accepted from the peer; larger ones
    /// abort the connection.
    pub fn max_header_block_size(mut self, size: usize) -> Self {
        self.max_header_block_size = size;
        self
    }

    pub fn drain_retry(mut self, interval: Duration) -> Self {
        self.drain_retry = interval;
        self
    }

    pub fn pool_capacity(mut self, per_class: usize) -> Self {
        self.pool_capacity = per_class;
        self
    }

    pub fn executor(mut self, executor: impl Executor) -> Self {
        self.executor = Some(Arc::new(executor));
        self
    }

    pub fn handler(mut self, handler: impl StreamHandler) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_frame_size < HEADER_LEN || self.max_frame_size > MAX_LENGTH + HEADER_LEN {
            return Err(Error::Config(format!(
                "max_frame_size must be between {} and {}, got {}",
                HEADER_LEN,
                MAX_LENGTH + HEADER_LEN,
                self.max_frame_size
            )));
        }
        if self.frame_size < HEADER_LEN {
            return Err(Error::Config(format!(
                "frame_size must be at least {}, got {}",
                HEADER_LEN, self.frame_size
            )));
        }
        if self.max_header_block_size == 0 {
            return Err(Error::Config("max_header_block_size must be non-zero".to_string()));
        }
        if self.drain_retry.is_zero() {
            return Err(Error::Config("drain_retry must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn build(self) -> Result<Arc<Context>> {
        self.validate()?;
        Ok(Arc::new(self.build_unchecked()))
    }

    fn build_unchecked(self) -> Context {
        Context {
            frame_size: self.frame_size,
            max_frame_size: self.max_frame_size,
            compression: self.compression,
            max_header_block_size: self.max_header_block_size,
            drain_retry: self.drain_retry,
            pool: FramePool::new(self.pool_capacity),
            executor: self
                .executor
                .unwrap_or_else(|| Arc::new(ThreadExecutor::default())),
            handler: self.handler,
        }
    }
}
