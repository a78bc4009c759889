//! Image patch application with SHA-256 verification of the output.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use log::{debug, info};
use sha2::{Digest, Sha256};

use crate::block_patch::{self, OffsetSink, Sink, WriterSink};
use crate::codec::{DeflateParams, Lz4Format, Lz4Params};
use crate::error::{PatchError, Result};
use crate::format::PKGDIFF_MAGIC;
use crate::image_diff::{BLOCK_COUNT_LEN, BLOCK_DEFLATE, BLOCK_LZ4, BLOCK_NORMAL, BLOCK_RAW};
use crate::package::{Compressor, MemberCodec, MemberCodecs};
use crate::view::{MappedFile, Span};

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Sequential sink that hashes everything it forwards.
struct HashingSink<S> {
    inner: S,
    hasher: Sha256,
    position: u64,
}

impl<S: Sink> HashingSink<S> {
    fn new(inner: S) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            position: 0,
        }
    }

    fn finish(self) -> (u64, String) {
        (self.position, hex::encode(self.hasher.finalize()))
    }
}

impl<S: Sink> Sink for HashingSink<S> {
    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if offset != self.position {
            return Err(PatchError::invalid_param(format!(
                "out-of-order write at {offset}, expected {}",
                self.position
            )));
        }
        self.inner.write(offset, data)?;
        self.hasher.update(data);
        self.position += data.len() as u64;
        Ok(())
    }
}

/// Little-endian field reader over the header section.
struct HeaderReader<'p> {
    data: &'p [u8],
    pos: usize,
}

impl<'p> HeaderReader<'p> {
    fn take(&mut self, n: usize) -> Result<&'p [u8]> {
        let span = Span::new(self.pos, n, self.data.len())
            .map_err(|_| PatchError::invalid_patch(format!("image patch truncated at {}", self.pos)))?;
        self.pos = span.end();
        Ok(span.slice(self.data))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> Result<i64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(i64::from_le_bytes(buf))
    }

    fn length(&mut self) -> Result<usize> {
        let v = self.i64()?;
        usize::try_from(v).map_err(|_| PatchError::invalid_patch(format!("negative length {v}")))
    }
}

/// A decoded block of an image patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchBlock<'p> {
    Normal {
        old: Span,
        payload: &'p [u8],
    },
    Raw {
        data: &'p [u8],
    },
    Deflate {
        old: Span,
        payload: &'p [u8],
        old_len: usize,
        new_len: usize,
        params: DeflateParams,
    },
    Lz4 {
        old: Span,
        payload: &'p [u8],
        old_len: usize,
        new_len: usize,
        params: Lz4Params,
    },
}

/// Raw header entry; payloads are resolved once every offset is known.
enum Entry<'p> {
    Raw(&'p [u8]),
    Patched {
        tag: u32,
        old: Span,
        offset: usize,
        lengths: (usize, usize),
        deflate: DeflateParams,
        lz4: Lz4Params,
    },
}

/// Parsed image patch.
pub struct ImagePatch<'p> {
    blocks: Vec<PatchBlock<'p>>,
}

impl<'p> ImagePatch<'p> {
    /// Parses and bounds-checks every block header against the patch and
    /// against an old image of `old_len` bytes.
    pub fn parse(patch: &'p [u8], old_len: usize) -> Result<Self> {
        if patch.len() < PKGDIFF_MAGIC.len() + BLOCK_COUNT_LEN || &patch[..8] != PKGDIFF_MAGIC {
            return Err(PatchError::invalid_patch("invalid PKGDIFF magic header"));
        }
        let mut reader = HeaderReader {
            data: patch,
            pos: PKGDIFF_MAGIC.len(),
        };
        let count = reader.u32()?;

        let mut entries = Vec::new();
        for index in 0..count {
            let tag = reader.u32()?;
            let entry = match tag {
                BLOCK_RAW => {
                    let len = reader.u32()? as usize;
                    Entry::Raw(reader.take(len)?)
                }
                BLOCK_NORMAL | BLOCK_DEFLATE | BLOCK_LZ4 => {
                    let start = reader.i64()?;
                    let len = reader.i64()?;
                    let old = Span::within(start, len, old_len)?;
                    let offset = reader.length()?;
                    let mut lengths = (0, 0);
                    let mut deflate = DeflateParams::default();
                    let mut lz4 = Lz4Params::default();
                    if tag != BLOCK_NORMAL {
                        lengths = (reader.length()?, reader.length()?);
                    }
                    if tag == BLOCK_DEFLATE {
                        deflate = DeflateParams {
                            level: reader.i32()?,
                            method: reader.i32()?,
                            window_bits: reader.i32()?,
                            mem_level: reader.i32()?,
                            strategy: reader.i32()?,
                        };
                    } else if tag == BLOCK_LZ4 {
                        let compression_level = reader.i32()?;
                        let magic = reader.i32()?;
                        let format = Lz4Format::from_magic(magic).ok_or_else(|| {
                            PatchError::invalid_patch(format!("unknown lz4 magic {magic:#x}"))
                        })?;
                        lz4 = Lz4Params {
                            compression_level,
                            format,
                            block_independence: reader.i32()?,
                            content_checksum: reader.i32()?,
                            block_size_id: reader.i32()?,
                            auto_flush: reader.i32()?,
                        };
                    }
                    Entry::Patched {
                        tag,
                        old,
                        offset,
                        lengths,
                        deflate,
                        lz4,
                    }
                }
                other => {
                    return Err(PatchError::invalid_patch(format!(
                        "unknown block type {other} at block {index}"
                    )))
                }
            };
            entries.push(entry);
        }

        let headers_end = reader.pos;
        let offsets: Vec<usize> = entries
            .iter()
            .filter_map(|e| match e {
                Entry::Patched { offset, .. } => Some(*offset),
                Entry::Raw(_) => None,
            })
            .collect();

        let mut next = 0;
        let mut blocks = Vec::with_capacity(entries.len());
        for entry in entries {
            let block = match entry {
                Entry::Raw(data) => PatchBlock::Raw { data },
                Entry::Patched {
                    tag,
                    old,
                    offset,
                    lengths,
                    deflate,
                    lz4,
                } => {
                    next += 1;
                    let end = offsets.get(next).copied().unwrap_or(patch.len());
                    if offset < headers_end || offset > end || end > patch.len() {
                        return Err(PatchError::invalid_patch(format!(
                            "block payload {offset}..{end} outside patch data"
                        )));
                    }
                    let payload = &patch[offset..end];
                    let (old_len, new_len) = lengths;
                    match tag {
                        BLOCK_NORMAL => PatchBlock::Normal { old, payload },
                        BLOCK_DEFLATE => PatchBlock::Deflate {
                            old,
                            payload,
                            old_len,
                            new_len,
                            params: deflate,
                        },
                        _ => PatchBlock::Lz4 {
                            old,
                            payload,
                            old_len,
                            new_len,
                            params: lz4,
                        },
                    }
                }
            };
            blocks.push(block);
        }
        Ok(Self { blocks })
    }

    pub fn blocks(&self) -> &[PatchBlock<'p>] {
        &self.blocks
    }

    /// Reconstructs the new image block by block into `sink`.
    pub fn apply<S: Sink + ?Sized>(
        &self,
        old: &[u8],
        sink: &mut S,
        compressor: &dyn Compressor,
    ) -> Result<u64> {
        let mut position = 0u64;
        for (index, block) in self.blocks.iter().enumerate() {
            let written = match block {
                PatchBlock::Normal { old: span, payload } => {
                    let mut source = old_slice(span, old)?;
                    block_patch::patch_to(&mut source, payload, &mut OffsetSink::new(&mut *sink, position))?
                }
                PatchBlock::Raw { data } => {
                    sink.write(position, data)?;
                    data.len() as u64
                }
                PatchBlock::Deflate {
                    old: span,
                    payload,
                    old_len,
                    new_len,
                    params,
                } => {
                    let codec = MemberCodec::Deflate(*params);
                    let packed = recompress(&codec, old_slice(span, old)?, payload, (*old_len, *new_len), compressor)?;
                    sink.write(position, &packed)?;
                    packed.len() as u64
                }
                PatchBlock::Lz4 {
                    old: span,
                    payload,
                    old_len,
                    new_len,
                    params,
                } => {
                    let codec = MemberCodec::Lz4(*params);
                    let packed = recompress(&codec, old_slice(span, old)?, payload, (*old_len, *new_len), compressor)?;
                    sink.write(position, &packed)?;
                    packed.len() as u64
                }
            };
            debug!("block {index} wrote {written} bytes at {position}");
            position += written;
        }
        Ok(position)
    }
}

fn old_slice<'a>(span: &Span, old: &'a [u8]) -> Result<&'a [u8]> {
    Ok(Span::new(span.start, span.len, old.len())?.slice(old))
}

/// Decompresses the old member, patches its payload and re-encodes the result.
fn recompress(
    codec: &MemberCodec,
    old_packed: &[u8],
    payload: &[u8],
    (old_len, new_len): (usize, usize),
    compressor: &dyn Compressor,
) -> Result<Vec<u8>> {
    let old_payload = compressor.decompress(codec, old_packed, old_len)?;
    let new_payload = block_patch::patch(&old_payload, payload)?;
    if new_payload.len() != new_len {
        return Err(PatchError::invalid_patch(format!(
            "member patched to {} bytes, expected {new_len}",
            new_payload.len()
        )));
    }
    compressor.compress(codec, &new_payload)
}

/// Applies an image patch into `sink` and checks the SHA-256 of everything
/// written against `expected_sha256` (hex, any case). Returns the output size.
pub fn apply_image_patch_to<S: Sink>(
    old: &[u8],
    patch: &[u8],
    sink: S,
    expected_sha256: &str,
) -> Result<u64> {
    if expected_sha256.is_empty() {
        return Err(PatchError::invalid_param("expected digest is empty"));
    }
    let image = ImagePatch::parse(patch, old.len())?;
    let mut hashing = HashingSink::new(sink);
    image.apply(old, &mut hashing, &MemberCodecs)?;

    let (written, actual) = hashing.finish();
    if !actual.eq_ignore_ascii_case(expected_sha256) {
        return Err(PatchError::Integrity {
            expected: expected_sha256.to_string(),
            actual,
        });
    }
    debug!("image patch output verified: {written} bytes");
    Ok(written)
}

/// Applies an image patch in memory; nothing is returned unless the output
/// matches `expected_sha256`.
pub fn apply_image_patch(old: &[u8], patch: &[u8], expected_sha256: &str) -> Result<Vec<u8>> {
    let mut new = Vec::new();
    apply_image_patch_to(old, patch, &mut new, expected_sha256)?;
    Ok(new)
}

/// Applies an image patch file to an old image file. The new file is removed
/// when application or verification fails.
pub fn apply_image_patch_files<P: AsRef<Path>>(
    patch_path: P,
    old_path: P,
    new_path: P,
    expected_sha256: &str,
) -> Result<u64> {
    let new_path = new_path.as_ref();
    let patch = MappedFile::open(patch_path)?;
    let old = MappedFile::open(old_path)?;
    ImagePatch::parse(patch.as_slice(), old.len())?;

    let write = || -> Result<u64> {
        let mut out = BufWriter::new(File::create(new_path)?);
        let written = apply_image_patch_to(
            old.as_slice(),
            patch.as_slice(),
            WriterSink::new(&mut out),
            expected_sha256,
        )?;
        out.flush()?;
        Ok(written)
    };
    match write() {
        Ok(written) => {
            info!("image patch applied: {} -> {written} bytes", new_path.display());
            Ok(written)
        }
        Err(e) => {
            let _ = fs::remove_file(new_path);
            Err(e)
        }
    }
}
