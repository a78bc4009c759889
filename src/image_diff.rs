//! Container-aware image diff.
//!
//! An image is cut into [`Block`]s, either in equal chunks or along the member
//! boundaries of a zip archive or LZ4 file. Compressed members are diffed on
//! their decompressed payloads and carry the encoder parameters that reproduce
//! the original packed bytes, so the apply side can recompress them exactly.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::block_diff::{diff_to_stream, diff_with};
use crate::codec::{CountingWriter, DeflateParams, Lz4Params, LIMIT_UNIT};
use crate::config::DiffConfig;
use crate::error::{PatchError, Result};
use crate::format::PKGDIFF_MAGIC;
use crate::package::{open_package, Compressor, ContainerFormat, FileInfo, MemberCodec, MemberCodecs, PackageParser};
use crate::view::{MappedFile, Span};

pub const BLOCK_NORMAL: u32 = 0;
pub const BLOCK_DEFLATE: u32 = 2;
pub const BLOCK_RAW: u32 = 3;
pub const BLOCK_LZ4: u32 = 4;

/// Block count field following the magic.
pub(crate) const BLOCK_COUNT_LEN: usize = 4;
pub(crate) const TAG_LEN: usize = 4;
/// old start, old length, patch data offset.
pub(crate) const NORMAL_HEADER_LEN: usize = 3 * 8;
/// Normal fields plus both decompressed lengths.
pub(crate) const MEMBER_HEADER_LEN: usize = 5 * 8;
pub(crate) const DEFLATE_PARAMS_LEN: usize = 5 * 4;
pub(crate) const LZ4_PARAMS_LEN: usize = 6 * 4;

/// Decompressed payloads of a member present in both images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberPayload {
    pub old: Vec<u8>,
    pub new: Vec<u8>,
}

/// One unit of the image patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    /// Block patch of `old` producing `new`.
    Normal { new: Span, old: Span },
    /// New bytes stored inline.
    Raw { new: Span },
    /// Deflate member diffed on its decompressed payload.
    Deflate {
        new: Span,
        old: Span,
        member: MemberPayload,
        params: DeflateParams,
    },
    /// LZ4 member diffed on its decompressed payload.
    Lz4 {
        new: Span,
        old: Span,
        member: MemberPayload,
        params: Lz4Params,
    },
}

impl Block {
    pub fn tag(&self) -> u32 {
        match self {
            Self::Normal { .. } => BLOCK_NORMAL,
            Self::Raw { .. } => BLOCK_RAW,
            Self::Deflate { .. } => BLOCK_DEFLATE,
            Self::Lz4 { .. } => BLOCK_LZ4,
        }
    }

    /// Span of the new image this block reproduces.
    pub fn new_span(&self) -> Span {
        match self {
            Self::Normal { new, .. }
            | Self::Raw { new }
            | Self::Deflate { new, .. }
            | Self::Lz4 { new, .. } => *new,
        }
    }

    /// Serialized header size, tag included.
    pub fn header_len(&self) -> usize {
        TAG_LEN
            + match self {
                Self::Normal { .. } => NORMAL_HEADER_LEN,
                Self::Raw { new } => 4 + new.len,
                Self::Deflate { .. } => MEMBER_HEADER_LEN + DEFLATE_PARAMS_LEN,
                Self::Lz4 { .. } => MEMBER_HEADER_LEN + LZ4_PARAMS_LEN,
            }
    }

    /// Size that decides whether block patches are staged on disk.
    fn staged_len(&self) -> usize {
        match self {
            Self::Deflate { new, member, .. } | Self::Lz4 { new, member, .. } => {
                new.len.max(member.new.len())
            }
            other => other.new_span().len,
        }
    }

    /// `(old, new)` inputs of the block patch; `None` for raw blocks.
    fn diff_inputs<'a>(&'a self, old_image: &'a [u8], new_image: &'a [u8]) -> Option<(&'a [u8], &'a [u8])> {
        match self {
            Self::Normal { new, old } => Some((old.slice(old_image), new.slice(new_image))),
            Self::Raw { .. } => None,
            Self::Deflate { member, .. } | Self::Lz4 { member, .. } => {
                Some((member.old.as_slice(), member.new.as_slice()))
            }
        }
    }

    fn write_header<W: Write>(&self, out: &mut W, data_offset: usize, new_image: &[u8]) -> Result<()> {
        out.write_all(&self.tag().to_le_bytes())?;
        match self {
            Self::Normal { old, .. } => write_i64s(out, &[old.start, old.len, data_offset]),
            Self::Raw { new } => {
                let len = u32::try_from(new.len).map_err(|_| {
                    PatchError::invalid_param(format!("raw block of {} bytes is too large", new.len))
                })?;
                out.write_all(&len.to_le_bytes())?;
                out.write_all(new.slice(new_image))?;
                Ok(())
            }
            Self::Deflate {
                old, member, params, ..
            } => {
                write_i64s(out, &[old.start, old.len, data_offset, member.old.len(), member.new.len()])?;
                write_i32s(
                    out,
                    &[params.level, params.method, params.window_bits, params.mem_level, params.strategy],
                )
            }
            Self::Lz4 {
                old, member, params, ..
            } => {
                write_i64s(out, &[old.start, old.len, data_offset, member.old.len(), member.new.len()])?;
                write_i32s(
                    out,
                    &[
                        params.compression_level,
                        params.format.magic(),
                        params.block_independence,
                        params.content_checksum,
                        params.block_size_id,
                        params.auto_flush,
                    ],
                )
            }
        }
    }
}

fn write_i64s<W: Write>(out: &mut W, values: &[usize]) -> Result<()> {
    for &v in values {
        out.write_all(&(v as i64).to_le_bytes())?;
    }
    Ok(())
}

fn write_i32s<W: Write>(out: &mut W, values: &[i32]) -> Result<()> {
    for &v in values {
        out.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

/// Cuts both images into `new_len / limit + 1` equal chunks, the last one
/// taking the remainder. Chunks are raw when there is no old data.
pub fn split_image(old_len: usize, new_len: usize, limit: usize) -> Result<Vec<Block>> {
    if limit == 0 {
        return Err(PatchError::invalid_param("cannot split an image with limit 0"));
    }
    let count = new_len / limit + 1;
    let old_size = old_len / count;
    let new_size = new_len / count;
    let blocks = (0..count)
        .map(|i| {
            let last = i == count - 1;
            let new = Span {
                start: new_size * i,
                len: if last { new_len - new_size * i } else { new_size },
            };
            let old = Span {
                start: old_size * i,
                len: if last { old_len - old_size * i } else { old_size },
            };
            if old_len == 0 {
                Block::Raw { new }
            } else {
                Block::Normal { new, old }
            }
        })
        .collect();
    Ok(blocks)
}

/// Blocks for an image diffed without looking at its structure.
pub fn plain_blocks(old_len: usize, new_len: usize, config: &DiffConfig) -> Result<Vec<Block>> {
    if config.limit == 0 || new_len <= config.limit {
        Ok(vec![Block::Normal {
            new: Span { start: 0, len: new_len },
            old: Span { start: 0, len: old_len },
        }])
    } else {
        split_image(old_len, new_len, config.limit)
    }
}

/// First deflate level (parser hint, then 9 down to 0) that reproduces `packed`.
pub fn probe_deflate(
    hint: DeflateParams,
    payload: &[u8],
    packed: &[u8],
    compressor: &dyn Compressor,
) -> Result<Option<DeflateParams>> {
    let levels = std::iter::once(hint.level).chain((0..=9).rev().filter(|&l| l != hint.level));
    for level in levels {
        let candidate = DeflateParams { level, ..hint };
        let encoded = compressor.compress(&MemberCodec::Deflate(candidate), payload)?;
        debug!("deflate probe level {level}: {} vs {} bytes", encoded.len(), packed.len());
        if encoded == packed {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}

/// First LZ4 parameter set (parser hint, then every block size id, block
/// independence and content checksum combination) that reproduces `packed`.
pub fn probe_lz4(
    hint: Lz4Params,
    payload: &[u8],
    packed: &[u8],
    compressor: &dyn Compressor,
) -> Result<Option<Lz4Params>> {
    let mut candidates = vec![hint];
    for block_size_id in 0..=7 {
        for block_independence in [1, 0] {
            for content_checksum in [0, 1] {
                let candidate = Lz4Params {
                    block_size_id,
                    block_independence,
                    content_checksum,
                    ..hint
                };
                if candidate != hint {
                    candidates.push(candidate);
                }
            }
        }
    }
    for candidate in candidates {
        let encoded = compressor.compress(&MemberCodec::Lz4(candidate), payload)?;
        debug!(
            "lz4 probe id {} independence {} checksum {}: {} vs {} bytes",
            candidate.block_size_id,
            candidate.block_independence,
            candidate.content_checksum,
            encoded.len(),
            packed.len()
        );
        if encoded == packed {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}

fn same_family(a: &MemberCodec, b: &MemberCodec) -> bool {
    match (a, b) {
        (MemberCodec::Stored, MemberCodec::Stored) => true,
        (MemberCodec::Deflate(_), MemberCodec::Deflate(_)) => true,
        (MemberCodec::Lz4(x), MemberCodec::Lz4(y)) => x.format == y.format,
        _ => false,
    }
}

/// Member-by-member block planner over two parsed containers.
struct MemberPlanner<'p> {
    old: &'p dyn PackageParser,
    new: &'p dyn PackageParser,
    config: &'p DiffConfig,
    compressor: &'p dyn Compressor,
    blocks: Vec<Block>,
}

impl MemberPlanner<'_> {
    fn plan(mut self) -> Result<Vec<Block>> {
        let new = self.new;
        let new_len = new.image().len();
        let mut cursor = 0;
        for id in new.file_ids() {
            let info = new
                .file_info(id)
                .ok_or_else(|| PatchError::invalid_param(format!("no member named {id}")))?;
            let span = info.member_span();
            if span.start < cursor {
                return Err(PatchError::invalid_param(format!("member {id} overlaps its predecessor")));
            }
            if span.start > cursor {
                self.blocks.push(Block::Raw {
                    new: Span {
                        start: cursor,
                        len: span.start - cursor,
                    },
                });
            }
            cursor = span.end();
            self.diff_member(id, info)?;
        }
        if cursor < new_len {
            self.blocks.push(Block::Raw {
                new: Span {
                    start: cursor,
                    len: new_len - cursor,
                },
            });
        }
        Ok(self.blocks)
    }

    fn diff_member(&mut self, id: &str, info: &FileInfo) -> Result<()> {
        let (old, new) = (self.old, self.new);
        let new_payload = new.extract(id)?;
        let limit = self.config.limit;
        if limit != 0 && info.unpacked_size >= limit {
            return Err(PatchError::ExceedLimit {
                name: id.to_string(),
                size: info.unpacked_size,
                limit,
            });
        }

        let old_member = old.file_info(id).and_then(|old_info| match old.extract(id) {
            Ok(payload) => Some((old_info, payload)),
            Err(e) => {
                debug!("old member {id} unavailable: {e}");
                None
            }
        });
        let Some((old_info, old_payload)) = old_member.filter(|(o, _)| same_family(&o.codec, &info.codec)) else {
            debug!("member {id} stored raw");
            self.blocks.push(Block::Raw {
                new: info.member_span(),
            });
            return Ok(());
        };

        let packed = info.data_span().slice(new.image());
        let block = match info.codec {
            MemberCodec::Stored => Block::Normal {
                new: info.data_span(),
                old: old_info.data_span(),
            },
            MemberCodec::Deflate(hint) => {
                let params = probe_deflate(hint, &new_payload, packed, self.compressor)?
                    .ok_or_else(|| no_parameters(id))?;
                Block::Deflate {
                    new: info.data_span(),
                    old: old_info.data_span(),
                    member: MemberPayload {
                        old: old_payload,
                        new: new_payload,
                    },
                    params,
                }
            }
            MemberCodec::Lz4(hint) => {
                let params = probe_lz4(hint, &new_payload, packed, self.compressor)?
                    .ok_or_else(|| no_parameters(id))?;
                Block::Lz4 {
                    new: info.data_span(),
                    old: old_info.data_span(),
                    member: MemberPayload {
                        old: old_payload,
                        new: new_payload,
                    },
                    params,
                }
            }
        };

        if info.data_offset > info.header_offset {
            self.blocks.push(Block::Raw {
                new: Span {
                    start: info.header_offset,
                    len: info.data_offset - info.header_offset,
                },
            });
        }
        self.blocks.push(block);
        Ok(())
    }
}

/// Blocks along member boundaries; equal chunks when the new image reaches
/// the limit, and the plain layout when any member cannot be handled.
fn member_blocks(
    old: &dyn PackageParser,
    new: &dyn PackageParser,
    config: &DiffConfig,
    compressor: &dyn Compressor,
) -> Result<Vec<Block>> {
    let (old_len, new_len) = (old.image().len(), new.image().len());
    if config.limit != 0 && new_len >= config.limit {
        return split_image(old_len, new_len, config.limit);
    }

    let planner = MemberPlanner {
        old,
        new,
        config,
        compressor,
        blocks: Vec::new(),
    };
    planner.plan().or_else(|e| {
        warn!("member diff failed ({e}), falling back to whole-image diff");
        plain_blocks(old_len, new_len, config)
    })
}

fn no_parameters(id: &str) -> PatchError {
    PatchError::invalid_param(format!("no encoder parameters reproduce member {id}"))
}

/// Block patches staged before the payload section is written.
enum Stage {
    Memory(Vec<Vec<u8>>),
    File(Sidecar),
}

/// On-disk staging file, removed when dropped.
struct Sidecar {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl Sidecar {
    fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        debug!("staging block patches in {}", path.display());
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
        })
    }
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

impl Stage {
    fn add(&mut self, old: &[u8], new: &[u8], config: &DiffConfig) -> Result<usize> {
        match self {
            Self::Memory(patches) => {
                let patch = diff_with(old, new, config)?;
                let size = patch.len();
                patches.push(patch);
                Ok(size)
            }
            Self::File(sidecar) => diff_to_stream(old, new, &mut sidecar.writer, config),
        }
    }

    fn copy_to<W: Write>(self, out: &mut W) -> Result<()> {
        match self {
            Self::Memory(patches) => {
                for patch in &patches {
                    out.write_all(patch)?;
                }
            }
            Self::File(mut sidecar) => {
                sidecar.writer.flush()?;
                let file = sidecar.writer.get_mut();
                file.seek(SeekFrom::Start(0))?;
                let mut buf = vec![0u8; LIMIT_UNIT];
                loop {
                    let n = file.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    out.write_all(&buf[..n])?;
                }
            }
        }
        Ok(())
    }
}

/// `<patch>.bspatch`, next to the patch file.
pub fn sidecar_path(patch_path: &Path) -> PathBuf {
    let mut name = OsString::from(patch_path.as_os_str());
    name.push(".bspatch");
    PathBuf::from(name)
}

/// A planned image diff: the blocks plus the images they index into.
pub struct ImageDiff<'a> {
    old: &'a [u8],
    new: &'a [u8],
    config: DiffConfig,
    blocks: Vec<Block>,
}

impl<'a> ImageDiff<'a> {
    /// Plans the diff, using member boundaries when both images are the same
    /// kind of container.
    pub fn new(old: &'a [u8], new: &'a [u8], config: &DiffConfig) -> Result<Self> {
        let format = ContainerFormat::detect(new);
        if format != ContainerFormat::Plain && format == ContainerFormat::detect(old) {
            match (open_package(old), open_package(new)) {
                (Ok(old_pkg), Ok(new_pkg)) => {
                    let blocks = member_blocks(old_pkg.as_ref(), new_pkg.as_ref(), config, &MemberCodecs)?;
                    return Ok(Self {
                        old,
                        new,
                        config: config.clone(),
                        blocks,
                    });
                }
                (Err(e), _) | (_, Err(e)) => {
                    debug!("{format:?} container not parsed ({e}), using plain image diff");
                }
            }
        }
        Self::plain(old, new, config)
    }

    /// Whole-image diff, split in equal chunks above the limit.
    pub fn plain(old: &'a [u8], new: &'a [u8], config: &DiffConfig) -> Result<Self> {
        Ok(Self {
            old,
            new,
            config: config.clone(),
            blocks: plain_blocks(old.len(), new.len(), config)?,
        })
    }

    /// Member-aware diff over caller-supplied parsers. If any member cannot be
    /// handled the whole image is diffed plainly instead.
    pub fn with_packages(
        old: &'a dyn PackageParser,
        new: &'a dyn PackageParser,
        config: &DiffConfig,
        compressor: &dyn Compressor,
    ) -> Result<Self> {
        Ok(Self {
            old: old.image(),
            new: new.image(),
            config: config.clone(),
            blocks: member_blocks(old, new, config, compressor)?,
        })
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Writes the image patch. Block patches are staged in `sidecar` when one
    /// is given and a block reaches the configured sidecar threshold.
    /// Returns the number of bytes written.
    pub fn write_patch<W: Write>(&self, out: W, sidecar: Option<&Path>) -> Result<usize> {
        let mut out = CountingWriter::new(out);
        let headers: usize = self.blocks.iter().map(Block::header_len).sum();
        let mut data_offset = PKGDIFF_MAGIC.len() + BLOCK_COUNT_LEN + headers;

        let threshold = self.config.sidecar_threshold;
        let mut stage = match sidecar {
            Some(path) if self.blocks.iter().any(|b| b.staged_len() >= threshold) => {
                Stage::File(Sidecar::create(path)?)
            }
            _ => Stage::Memory(Vec::new()),
        };

        let count = u32::try_from(self.blocks.len())
            .map_err(|_| PatchError::invalid_param("too many blocks"))?;
        out.write_all(PKGDIFF_MAGIC)?;
        out.write_all(&count.to_le_bytes())?;

        for (index, block) in self.blocks.iter().enumerate() {
            let patch_size = match block.diff_inputs(self.old, self.new) {
                Some((old, new)) => stage.add(old, new, &self.config)?,
                None => 0,
            };
            debug!(
                "block {index} tag {} new {}+{} patch {patch_size} at {data_offset}",
                block.tag(),
                block.new_span().start,
                block.new_span().len
            );
            block.write_header(&mut out, data_offset, self.new)?;
            data_offset += patch_size;
        }
        stage.copy_to(&mut out)?;
        out.flush()?;

        let written = out.bytes();
        info!("image patch: {} blocks, {written} bytes", self.blocks.len());
        Ok(written)
    }
}

/// Diffs two images into an in-memory image patch.
pub fn image_diff(old: &[u8], new: &[u8], config: &DiffConfig) -> Result<Vec<u8>> {
    let mut patch = Vec::new();
    ImageDiff::new(old, new, config)?.write_patch(&mut patch, None)?;
    Ok(patch)
}

/// Diffs two image files. Large block patches are staged in
/// `<patch>.bspatch`, which is removed afterwards; the patch file itself is
/// removed on failure.
pub fn image_diff_files<P: AsRef<Path>>(
    old_path: P,
    new_path: P,
    patch_path: P,
    config: &DiffConfig,
) -> Result<usize> {
    let patch_path = patch_path.as_ref();
    let old = MappedFile::open(old_path)?;
    let new = MappedFile::open(new_path)?;
    info!(
        "image diff {}: old {} new {} limit {}",
        patch_path.display(),
        old.len(),
        new.len(),
        config.limit
    );

    let write = || -> Result<usize> {
        let diff = ImageDiff::new(old.as_slice(), new.as_slice(), config)?;
        let mut out = BufWriter::new(File::create(patch_path)?);
        let size = diff.write_patch(&mut out, Some(&sidecar_path(patch_path)))?;
        out.flush()?;
        Ok(size)
    };
    write().map_err(|e| {
        let _ = fs::remove_file(patch_path);
        e
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{compress_to_vec, Codec};

    fn sample(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(seed).wrapping_add((i >> 8) as u8)).collect()
    }

    #[test]
    fn small_images_are_one_normal_block() {
        let blocks = plain_blocks(10, 20, &DiffConfig::default()).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].tag(), BLOCK_NORMAL);

        let blocks = plain_blocks(10, 20, &DiffConfig::default().with_limit(20)).unwrap();
        assert_eq!(blocks.len(), 1);
    }

    #[test]
    fn split_covers_both_images() {
        let blocks = split_image(1000, 3000, 1200).unwrap();
        assert_eq!(blocks.len(), 3);
        let spans: Vec<Span> = blocks.iter().map(Block::new_span).collect();
        assert_eq!(spans[0], Span { start: 0, len: 1000 });
        assert_eq!(spans[2], Span { start: 2000, len: 1000 });
        match &blocks[2] {
            Block::Normal { old, .. } => assert_eq!(old.end(), 1000),
            other => panic!("unexpected block {other:?}"),
        }

        let uneven = split_image(7, 3001, 1000).unwrap();
        assert_eq!(uneven.len(), 4);
        assert_eq!(uneven.last().unwrap().new_span().end(), 3001);
    }

    #[test]
    fn split_without_old_data_is_raw() {
        let blocks = split_image(0, 50, 20).unwrap();
        assert_eq!(blocks.len(), 3);
        assert!(blocks.iter().all(|b| b.tag() == BLOCK_RAW));
        assert!(split_image(0, 50, 0).is_err());
    }

    #[test]
    fn header_lengths_match_layout() {
        let member = MemberPayload {
            old: vec![],
            new: vec![],
        };
        let span = Span::default();
        assert_eq!(Block::Normal { new: span, old: span }.header_len(), 28);
        assert_eq!(Block::Raw { new: Span { start: 0, len: 9 } }.header_len(), 17);
        let deflate = Block::Deflate {
            new: span,
            old: span,
            member: member.clone(),
            params: DeflateParams::default(),
        };
        assert_eq!(deflate.header_len(), 64);
        let lz4 = Block::Lz4 {
            new: span,
            old: span,
            member,
            params: Lz4Params::default(),
        };
        assert_eq!(lz4.header_len(), 68);

        let mut out = Vec::new();
        lz4.write_header(&mut out, 100, &[]).unwrap();
        assert_eq!(out.len(), lz4.header_len());
    }

    #[test]
    fn deflate_probe_recovers_level() {
        let payload = sample(20_000, 7);
        let params = DeflateParams {
            level: 3,
            ..DeflateParams::default()
        };
        let packed = compress_to_vec(Codec::Deflate(params), &payload).unwrap();
        let found = probe_deflate(DeflateParams::default(), &payload, &packed, &MemberCodecs)
            .unwrap()
            .unwrap();
        let again = compress_to_vec(Codec::Deflate(found), &payload).unwrap();
        assert_eq!(again, packed);
    }

    #[test]
    fn lz4_probe_recovers_frame_settings() {
        let payload = sample(100_000, 3);
        let params = Lz4Params {
            block_size_id: 6,
            block_independence: 0,
            ..Lz4Params::default()
        };
        let packed = compress_to_vec(Codec::Lz4(params), &payload).unwrap();
        let found = probe_lz4(Lz4Params::default(), &payload, &packed, &MemberCodecs).unwrap();
        assert_eq!(found, Some(params));
    }

    #[test]
    fn probe_gives_up_on_foreign_bytes() {
        let payload = sample(500, 5);
        let found = probe_deflate(DeflateParams::default(), &payload, b"not deflate", &MemberCodecs).unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn sidecar_sits_next_to_patch() {
        assert_eq!(
            sidecar_path(Path::new("/tmp/out.patch")),
            PathBuf::from("/tmp/out.patch.bspatch")
        );
    }

    #[test]
    fn patch_starts_with_magic_and_count() {
        let old = sample(3000, 11);
        let new = sample(3000, 13);
        let patch = image_diff(&old, &new, &DiffConfig::default().with_limit(1000)).unwrap();
        assert_eq!(&patch[..8], PKGDIFF_MAGIC);
        assert_eq!(u32::from_le_bytes([patch[8], patch[9], patch[10], patch[11]]), 4);
    }
}
