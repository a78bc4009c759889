//! Codec adapters: one open/write/flush/close contract over every compressor
//! used by the patch streams and by container member recompression.

use std::io::{self, Read, Seek, SeekFrom, Write};

use brotli::CompressorWriter;
use bzip2::write::BzEncoder;
use bzip2::Compression as BzCompression;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use lz4_flex::frame::{BlockMode, BlockSize, FrameDecoder, FrameEncoder, FrameInfo};

use crate::error::{PatchError, Result};

/// Growth step for in-memory patch buffers and the chunk size used when
/// streaming diff bytes.
pub const LIMIT_UNIT: usize = 10_240;

const BROTLI_BUFFER_SIZE: usize = 4096;
const BROTLI_QUALITY: u32 = 11;
// matches Android kBrotliDefaultLgwin
const BROTLI_LG_WINDOW: u32 = 20;

/// Frame magic written into LZ4 image block headers.
pub const LZ4S_MAGIC: i32 = 0x184D_2204;
/// Legacy stream magic; also written into LZ4 image block headers.
pub const LZ4B_MAGIC: i32 = 0x184C_2102;

/// Input bytes per block of the legacy LZ4 format.
pub const LZ4_LEGACY_BLOCK_SIZE: usize = 8 << 20;

/// Compression applied to one of the three block-patch streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCodec {
    None = 0,
    Bz2 = 1,
    Brotli = 2,
}

impl StreamCodec {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Bz2),
            2 => Some(Self::Brotli),
            _ => None,
        }
    }
}

impl From<StreamCodec> for Codec {
    fn from(codec: StreamCodec) -> Self {
        match codec {
            StreamCodec::None => Codec::Stored,
            StreamCodec::Bz2 => Codec::Bz2,
            StreamCodec::Brotli => Codec::Brotli,
        }
    }
}

/// Raw deflate settings as recorded for zip members.
///
/// Only `level` influences the encoder; the remaining fields are carried
/// through image patch headers unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeflateParams {
    pub level: i32,
    pub method: i32,
    pub window_bits: i32,
    pub mem_level: i32,
    pub strategy: i32,
}

impl Default for DeflateParams {
    fn default() -> Self {
        Self {
            level: 6,
            method: 8,
            window_bits: -15,
            mem_level: 8,
            strategy: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lz4Format {
    /// LZ4 frame format (magic `0x184D2204`).
    Frame,
    /// Legacy format (magic `0x184C2102`): length-prefixed raw LZ4 blocks.
    Block,
}

impl Lz4Format {
    pub fn magic(self) -> i32 {
        match self {
            Self::Frame => LZ4S_MAGIC,
            Self::Block => LZ4B_MAGIC,
        }
    }

    pub fn from_magic(magic: i32) -> Option<Self> {
        match magic {
            LZ4S_MAGIC => Some(Self::Frame),
            LZ4B_MAGIC => Some(Self::Block),
            _ => None,
        }
    }
}

/// LZ4 settings; `block_size_id` follows the LZ4 frame descriptor numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lz4Params {
    pub compression_level: i32,
    pub format: Lz4Format,
    pub block_independence: i32,
    pub content_checksum: i32,
    pub block_size_id: i32,
    pub auto_flush: i32,
}

impl Default for Lz4Params {
    fn default() -> Self {
        Self {
            compression_level: 0,
            format: Lz4Format::Frame,
            block_independence: 1,
            content_checksum: 0,
            block_size_id: 4,
            auto_flush: 1,
        }
    }
}

impl Lz4Params {
    fn frame_block_size(&self) -> BlockSize {
        match self.block_size_id {
            5 => BlockSize::Max256KB,
            6 => BlockSize::Max1MB,
            7 => BlockSize::Max4MB,
            _ => BlockSize::Max64KB,
        }
    }

    /// Maximum number of input bytes per block. Legacy streams always use
    /// 8 MiB blocks.
    pub fn block_size(&self) -> usize {
        if self.format == Lz4Format::Block {
            return LZ4_LEGACY_BLOCK_SIZE;
        }
        match self.block_size_id {
            5 => 256 * 1024,
            6 => 1024 * 1024,
            7 => 4 * 1024 * 1024,
            _ => 64 * 1024,
        }
    }

    fn frame_info(&self) -> FrameInfo {
        let mode = if self.block_independence != 0 {
            BlockMode::Independent
        } else {
            BlockMode::Linked
        };
        FrameInfo::new()
            .block_size(self.frame_block_size())
            .block_mode(mode)
            .content_checksum(self.content_checksum != 0)
    }
}

/// Every algorithm an adapter can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Stored,
    Bz2,
    Brotli,
    Deflate(DeflateParams),
    Lz4(Lz4Params),
}

impl Codec {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Stored => "stored",
            Self::Bz2 => "bzip2",
            Self::Brotli => "brotli",
            Self::Deflate(_) => "deflate",
            Self::Lz4(_) => "lz4",
        }
    }
}

/// Uniform open/write/flush/close contract shared by all compressors.
pub trait CodecAdapter {
    fn open(&mut self) -> Result<()>;

    fn write_data(&mut self, data: &[u8]) -> Result<()>;

    /// Finalizes the stream, returning the number of bytes written to the sink.
    fn flush_data(&mut self) -> Result<usize>;

    fn close(&mut self) -> Result<()>;
}

/// Writer that counts the bytes passed through to `inner`.
pub struct CountingWriter<W> {
    inner: W,
    bytes: usize,
}

impl<W: Write> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, bytes: 0 }
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn into_parts(self) -> (W, usize) {
        (self.inner, self.bytes)
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.bytes += n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Writes into a caller-owned buffer starting at `base`, growing it by whole
/// [`LIMIT_UNIT`]s when the write position runs past its end.
pub struct BufferSink<'a> {
    buffer: &'a mut Vec<u8>,
    base: usize,
    pos: usize,
    end: usize,
}

impl<'a> BufferSink<'a> {
    pub fn new(buffer: &'a mut Vec<u8>, base: usize) -> Self {
        Self {
            buffer,
            base,
            pos: 0,
            end: 0,
        }
    }

    /// Bytes written past `base` so far.
    pub fn len(&self) -> usize {
        self.end
    }

    pub fn is_empty(&self) -> bool {
        self.end == 0
    }

    /// Trims the buffer to the written data and returns its length past `base`.
    pub fn finish(self) -> usize {
        self.buffer.truncate(self.base + self.end);
        self.end
    }

    fn reserve(&mut self, needed: usize) {
        if needed > self.buffer.len() {
            self.buffer.resize(LIMIT_UNIT * (needed / LIMIT_UNIT + 1), 0);
        }
    }
}

impl Write for BufferSink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let start = self.base + self.pos;
        let needed = start + buf.len();
        self.reserve(needed);
        self.buffer[start..needed].copy_from_slice(buf);
        self.pos += buf.len();
        self.end = self.end.max(self.pos);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for BufferSink<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset as i64),
            SeekFrom::Current(delta) => (self.pos as i64).checked_add(delta),
            SeekFrom::End(delta) => (self.end as i64).checked_add(delta),
        };
        match target {
            Some(t) if t >= 0 => {
                self.pos = t as usize;
                Ok(self.pos as u64)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of buffer sink",
            )),
        }
    }
}

/// Legacy LZ4 stream writer: the magic, then per chunk a u32 LE compressed
/// length followed by a raw LZ4 block of at most `block_size` input bytes.
struct Lz4BlockWriter<W: Write> {
    inner: W,
    pending: Vec<u8>,
    block_size: usize,
    started: bool,
}

impl<W: Write> Lz4BlockWriter<W> {
    fn new(inner: W, block_size: usize) -> Self {
        Self {
            inner,
            pending: Vec::new(),
            block_size,
            started: false,
        }
    }

    fn start(&mut self) -> io::Result<()> {
        if !self.started {
            self.inner.write_all(&LZ4B_MAGIC.to_le_bytes())?;
            self.started = true;
        }
        Ok(())
    }

    fn emit(&mut self, chunk_len: usize) -> io::Result<()> {
        let compressed = lz4_flex::block::compress(&self.pending[..chunk_len]);
        self.inner.write_all(&(compressed.len() as u32).to_le_bytes())?;
        self.inner.write_all(&compressed)?;
        self.pending.drain(..chunk_len);
        Ok(())
    }

    fn finish(mut self) -> io::Result<W> {
        self.start()?;
        if !self.pending.is_empty() {
            self.emit(self.pending.len())?;
        }
        Ok(self.inner)
    }
}

impl<W: Write> Write for Lz4BlockWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.start()?;
        self.pending.extend_from_slice(buf);
        while self.pending.len() >= self.block_size {
            self.emit(self.block_size)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

enum Encoder<W: Write> {
    Stored(CountingWriter<W>),
    Bz2(BzEncoder<CountingWriter<W>>),
    /// Brotli output is staged in memory and copied to the sink on finish.
    Brotli(Box<CompressorWriter<Vec<u8>>>, CountingWriter<W>),
    Deflate(DeflateEncoder<CountingWriter<W>>),
    Lz4Frame(FrameEncoder<CountingWriter<W>>),
    Lz4Block(Lz4BlockWriter<CountingWriter<W>>),
}

impl<W: Write> Encoder<W> {
    fn new(codec: &Codec, sink: CountingWriter<W>) -> Self {
        match codec {
            Codec::Stored => Self::Stored(sink),
            Codec::Bz2 => Self::Bz2(BzEncoder::new(sink, BzCompression::best())),
            Codec::Brotli => Self::Brotli(
                Box::new(CompressorWriter::new(
                    Vec::new(),
                    BROTLI_BUFFER_SIZE,
                    BROTLI_QUALITY,
                    BROTLI_LG_WINDOW,
                )),
                sink,
            ),
            Codec::Deflate(params) => {
                let level = params.level.clamp(0, 9) as u32;
                Self::Deflate(DeflateEncoder::new(sink, Compression::new(level)))
            }
            Codec::Lz4(params) => match params.format {
                Lz4Format::Frame => {
                    Self::Lz4Frame(FrameEncoder::with_frame_info(params.frame_info(), sink))
                }
                Lz4Format::Block => {
                    Self::Lz4Block(Lz4BlockWriter::new(sink, params.block_size()))
                }
            },
        }
    }

    fn writer(&mut self) -> &mut dyn Write {
        match self {
            Self::Stored(w) => w,
            Self::Bz2(w) => w,
            Self::Brotli(w, _) => w.as_mut(),
            Self::Deflate(w) => w,
            Self::Lz4Frame(w) => w,
            Self::Lz4Block(w) => w,
        }
    }

    fn finish(self) -> io::Result<CountingWriter<W>> {
        match self {
            Self::Stored(w) => Ok(w),
            Self::Bz2(w) => w.finish(),
            Self::Brotli(w, mut sink) => {
                let compressed = (*w).into_inner();
                sink.write_all(&compressed)?;
                Ok(sink)
            }
            Self::Deflate(w) => w.finish(),
            Self::Lz4Frame(w) => w.finish().map_err(io::Error::other),
            Self::Lz4Block(w) => w.finish(),
        }
    }
}

/// Compressing adapter writing into any `Write` sink.
///
/// Pass `&mut BufferSink` for the in-memory variant or `&mut File` for the
/// stream variant.
pub struct CompressAdapter<W: Write> {
    codec: Codec,
    sink: Option<W>,
    encoder: Option<Encoder<W>>,
}

impl<W: Write> CompressAdapter<W> {
    pub fn new(codec: Codec, sink: W) -> Self {
        Self {
            codec,
            sink: Some(sink),
            encoder: None,
        }
    }

    fn encoder(&mut self) -> Result<&mut Encoder<W>> {
        let name = self.codec.name();
        self.encoder
            .as_mut()
            .ok_or_else(|| PatchError::invalid_param(format!("{name} adapter is not open")))
    }
}

impl<W: Write> CodecAdapter for CompressAdapter<W> {
    fn open(&mut self) -> Result<()> {
        let sink = self.sink.take().ok_or_else(|| {
            PatchError::invalid_param(format!("{} adapter already open", self.codec.name()))
        })?;
        self.encoder = Some(Encoder::new(&self.codec, CountingWriter::new(sink)));
        Ok(())
    }

    fn write_data(&mut self, data: &[u8]) -> Result<()> {
        let name = self.codec.name();
        self.encoder()?
            .writer()
            .write_all(data)
            .map_err(|e| PatchError::codec(name, e))
    }

    fn flush_data(&mut self) -> Result<usize> {
        let name = self.codec.name();
        let encoder = self
            .encoder
            .take()
            .ok_or_else(|| PatchError::invalid_param(format!("{name} adapter is not open")))?;
        let (sink, written) = encoder
            .finish()
            .map_err(|e| PatchError::codec(name, e))?
            .into_parts();
        self.sink = Some(sink);
        Ok(written)
    }

    fn close(&mut self) -> Result<()> {
        self.encoder = None;
        Ok(())
    }
}

/// Reader for legacy LZ4 streams as written by [`Lz4BlockWriter`].
struct Lz4BlockReader<'a> {
    input: &'a [u8],
    block_size: usize,
    chunk: Vec<u8>,
    pos: usize,
}

impl<'a> Lz4BlockReader<'a> {
    fn new(input: &'a [u8], block_size: usize) -> io::Result<Self> {
        let body = input
            .strip_prefix(&LZ4B_MAGIC.to_le_bytes()[..])
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing lz4 legacy magic"))?;
        Ok(Self {
            input: body,
            block_size,
            chunk: Vec::new(),
            pos: 0,
        })
    }
}

impl Read for Lz4BlockReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.chunk.len() {
            if self.input.is_empty() {
                return Ok(0);
            }
            if self.input.len() < 4 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            let (len, rest) = self.input.split_at(4);
            let len = u32::from_le_bytes([len[0], len[1], len[2], len[3]]);
            if len == LZ4B_MAGIC as u32 {
                // concatenated legacy stream
                self.input = rest;
                continue;
            }
            let len = len as usize;
            if rest.len() < len {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            self.chunk = lz4_flex::block::decompress(&rest[..len], self.block_size)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            self.input = &rest[len..];
            self.pos = 0;
        }
        let n = buf.len().min(self.chunk.len() - self.pos);
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Decompressing adapter reading from a byte slice.
pub struct DecompressAdapter<'a> {
    codec: Codec,
    input: &'a [u8],
    reader: Option<Box<dyn Read + 'a>>,
}

impl<'a> DecompressAdapter<'a> {
    pub fn new(codec: Codec, input: &'a [u8]) -> Self {
        Self {
            codec,
            input,
            reader: None,
        }
    }

    pub fn open(&mut self) -> Result<()> {
        let input = self.input;
        let reader: Box<dyn Read + 'a> = match self.codec {
            Codec::Stored => Box::new(input),
            Codec::Bz2 => Box::new(bzip2::read::BzDecoder::new(input)),
            Codec::Brotli => Box::new(brotli::Decompressor::new(input, BROTLI_BUFFER_SIZE)),
            Codec::Deflate(_) => Box::new(flate2::read::DeflateDecoder::new(input)),
            Codec::Lz4(params) => match params.format {
                Lz4Format::Frame => Box::new(FrameDecoder::new(input)),
                Lz4Format::Block => Box::new(
                    Lz4BlockReader::new(input, params.block_size())
                        .map_err(|e| PatchError::codec(self.codec.name(), e))?,
                ),
            },
        };
        self.reader = Some(reader);
        Ok(())
    }

    /// Fills `buf` completely or fails.
    pub fn read_data(&mut self, buf: &mut [u8]) -> Result<()> {
        let name = self.codec.name();
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| PatchError::invalid_param(format!("{name} adapter is not open")))?;
        reader.read_exact(buf).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => {
                PatchError::invalid_patch(format!("{name} stream exhausted"))
            }
            _ => PatchError::codec(name, e),
        })
    }

    /// Drains the remaining stream into `out`, returning the number of bytes read.
    pub fn read_to_end(&mut self, out: &mut Vec<u8>) -> Result<usize> {
        let name = self.codec.name();
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| PatchError::invalid_param(format!("{name} adapter is not open")))?;
        reader
            .read_to_end(out)
            .map_err(|e| PatchError::codec(name, e))
    }

    pub fn close(&mut self) {
        self.reader = None;
    }
}

/// Compresses `data` into a fresh buffer.
pub fn compress_to_vec(codec: Codec, data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut sink = BufferSink::new(&mut out, 0);
    let mut adapter = CompressAdapter::new(codec, &mut sink);
    adapter.open()?;
    adapter.write_data(data)?;
    adapter.flush_data()?;
    adapter.close()?;
    drop(adapter);
    sink.finish();
    Ok(out)
}

/// Decompresses a whole buffer.
pub fn decompress_to_vec(codec: Codec, data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut adapter = DecompressAdapter::new(codec, data);
    adapter.open()?;
    adapter.read_to_end(&mut out)?;
    adapter.close();
    Ok(out)
}
