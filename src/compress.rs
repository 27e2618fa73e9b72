//! Header block compression for control frames.
//!
//! Name/value blocks are deflated with zlib primed with a fixed dictionary of
//! common header text. Each direction of a connection keeps one running
//! zlib stream for its whole lifetime, so a codec failure leaves the header
//! state unrecoverable and must abort the connection.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};

use crate::error::{Error, Result};
use crate::frame::Frame;

/// Shared dictionary for header block compression.
pub const DICTIONARY: &[u8] = b"optionsgetheadpostputdeletetraceacceptaccept-charsetaccept-encodingaccept-\
languageauthorizationexpectfromhostif-modified-sinceif-matchif-none-matchif-rangeif-\
unmodifiedsincemax-forwardsproxy-authorizationrangerefererteuser-agent100101200201202\
203204205206300301302303304305306307400401402403404405406407408409410411412413414415416\
417500501502503504505accept-rangesageetaglocationproxy-authenticatepublicretry-afterser\
vervarywarningwww-authenticateallowcontent-basecontent-encodingcache-controlconnectiond\
atetrailertransfer-encodingupgradeviawarningcontent-languagecontent-lengthcontent-locat\
ioncontent-md5content-rangecontent-typeetagexpireslast-modifiedset-cookieMondayTuesdayW\
ednesdayThursdayFridaySaturdaySundayJanFebMarAprMayJunJulAugSepOctNovDecchunkedtext/htm\
limage/pngimage/jpgimage/gifapplication/xmlapplication/xhtmltext/plainpublicmax-agecha\
rset=iso-8859-1utf-8gzipdeflateHTTP/1.1statusversionurl\0";

/// Spare output space kept free before each codec call.
const MIN_SPARE: usize = 256;

/// Default cap on the inflated size of one header block.
pub const MAX_HEADER_BLOCK_SIZE: usize = 256 * 1024;

/// Outbound half: deflates header blocks of frames about to be sent.
pub struct HeaderDeflater {
    inner: Compress,
    scratch: Vec<u8>,
}

impl std::fmt::Debug for HeaderDeflater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaderDeflater")
            .field("total_in", &self.inner.total_in())
            .field("total_out", &self.inner.total_out())
            .finish()
    }
}

impl HeaderDeflater {
    pub fn new() -> Result<Self> {
        let mut inner = Compress::new(Compression::default(), true);
        inner.set_dictionary(DICTIONARY)?;
        Ok(Self {
            inner,
            scratch: Vec::new(),
        })
    }

    /// Deflate everything in `frame` from `start` to its end, in place.
    ///
    /// The last input byte is fed on its own with a sync flush so the
    /// compressor emits every buffered bit before the frame goes out; a single
    /// flush over the whole block can leave state behind.
    pub fn compress(&mut self, frame: &mut Frame, start: usize) -> Result<()> {
        let bytes = frame.bytes();
        if bytes.len() <= start {
            return Ok(());
        }

        self.scratch.clear();
        self.scratch.reserve(bytes.len());
        self.scratch.extend_from_slice(&bytes[..start]);

        let (block, last) = bytes[start..].split_at(bytes.len() - start - 1);
        deflate(&mut self.inner, &mut self.scratch, block, FlushCompress::None)?;
        deflate(&mut self.inner, &mut self.scratch, last, FlushCompress::Sync)?;

        frame.swap_buffer(&mut self.scratch);
        Ok(())
    }
}

fn deflate(inner: &mut Compress, out: &mut Vec<u8>, mut input: &[u8], flush: FlushCompress) -> Result<()> {
    loop {
        if out.capacity() - out.len() < MIN_SPARE {
            out.reserve(out.capacity().max(MIN_SPARE));
        }
        let before_in = inner.total_in();
        let before_out = inner.total_out();
        inner.compress_vec(input, out, flush)?;
        let consumed = (inner.total_in() - before_in) as usize;
        let produced = inner.total_out() - before_out;
        input = &input[consumed..];

        let spare = out.len() < out.capacity();
        if input.is_empty() && spare {
            return Ok(());
        }
        if consumed == 0 && produced == 0 && spare {
            return Err(Error::Compression("deflate made no progress".to_string()));
        }
    }
}

/// Inbound half: inflates header blocks of received frames.
pub struct HeaderInflater {
    inner: Decompress,
    scratch: Vec<u8>,
    limit: usize,
}

impl std::fmt::Debug for HeaderInflater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaderInflater")
            .field("total_in", &self.inner.total_in())
            .field("total_out", &self.inner.total_out())
            .field("limit", &self.limit)
            .finish()
    }
}

impl Default for HeaderInflater {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderInflater {
    pub fn new() -> Self {
        Self::with_limit(MAX_HEADER_BLOCK_SIZE)
    }

    /// Inflater that refuses header blocks inflating past `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            inner: Decompress::new(true),
            scratch: Vec::new(),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Inflate everything in `frame` from `start` to its end, in place.
    ///
    /// The output grows geometrically since the inflated size is unknown,
    /// but never much past the limit: a block that inflates beyond it is a
    /// compression error. The dictionary is supplied when the stream asks
    /// for it.
    pub fn decompress(&mut self, frame: &mut Frame, start: usize) -> Result<()> {
        let bytes = frame.bytes();
        if bytes.len() <= start {
            return Ok(());
        }

        // one byte past the limit is enough to tell an oversized block
        let ceiling = start + self.limit + 1;
        self.scratch.clear();
        self.scratch
            .reserve_exact((start + (bytes.len() - start) * 4).min(ceiling));
        self.scratch.extend_from_slice(&bytes[..start]);

        let mut input = &bytes[start..];
        loop {
            if self.scratch.capacity() - self.scratch.len() < MIN_SPARE {
                let room = ceiling.saturating_sub(self.scratch.len());
                let grow = self.scratch.capacity().min(room).max(MIN_SPARE);
                self.scratch.reserve_exact(grow);
            }
            let before_in = self.inner.total_in();
            let before_out = self.inner.total_out();
            let result = self
                .inner
                .decompress_vec(input, &mut self.scratch, FlushDecompress::Sync);
            let consumed = (self.inner.total_in() - before_in) as usize;
            let produced = self.inner.total_out() - before_out;
            input = &input[consumed..];

            match result {
                Ok(_) => {}
                Err(e) if e.needs_dictionary().is_some() => {
                    self.inner.set_dictionary(DICTIONARY)?;
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            let inflated = self.scratch.len() - start;
            if inflated > self.limit {
                return Err(Error::Compression(format!(
                    "header block too large ({} bytes, max {})",
                    inflated, self.limit
                )));
            }

            let spare = self.scratch.len() < self.scratch.capacity();
            if input.is_empty() && spare {
                break;
            }
            if consumed == 0 && produced == 0 && spare {
                return Err(Error::Compression("inflate made no progress".to_string()));
            }
        }

        frame.swap_buffer(&mut self.scratch);
        Ok(())
    }
}

/// Both directions of a connection's header compression.
#[derive(Debug)]
pub struct HeaderCompressor {
    deflater: HeaderDeflater,
    inflater: HeaderInflater,
}

impl HeaderCompressor {
    pub fn new() -> Result<Self> {
        Self::with_limit(MAX_HEADER_BLOCK_SIZE)
    }

    /// Compressor whose inbound half refuses blocks inflating past `limit`.
    pub fn with_limit(limit: usize) -> Result<Self> {
        Ok(Self {
            deflater: HeaderDeflater::new()?,
            inflater: HeaderInflater::with_limit(limit),
        })
    }

    pub fn compress(&mut self, frame: &mut Frame, start: usize) -> Result<()> {
        self.deflater.compress(frame, start)
    }

    pub fn decompress(&mut self, frame: &mut Frame, start: usize) -> Result<()> {
        self.inflater.decompress(frame, start)
    }

    pub fn halves_mut(&mut self) -> (&mut HeaderDeflater, &mut HeaderInflater) {
        (&mut self.deflater, &mut self.inflater)
    }

    /// Separate the halves so the writer and reader paths can own one each.
    pub fn split(self) -> (HeaderDeflater, HeaderInflater) {
        (self.deflater, self.inflater)
    }
}

// ============================================================================
// Tests
// ============================================================================
