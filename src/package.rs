//! Container collaborators: archive parsers that expose member layout and
//! payloads, and the compressor used to re-encode member data.

use std::collections::HashMap;

use log::debug;

use crate::codec::{
    compress_to_vec, decompress_to_vec, Codec, DeflateParams, Lz4Format, Lz4Params, LZ4B_MAGIC,
    LZ4S_MAGIC,
};
use crate::error::{PatchError, Result};
use crate::view::Span;

const LOCAL_HEADER_SIGNATURE: u32 = 0x0403_4b50;
const CENTRAL_SIGNATURE: u32 = 0x0201_4b50;
const END_CENTRAL_SIGNATURE: u32 = 0x0605_4b50;

const LOCAL_HEADER_LEN: usize = 30;
const CENTRAL_ENTRY_LEN: usize = 46;
const END_CENTRAL_LEN: usize = 22;
const MAX_COMMENT_LEN: usize = u16::MAX as usize;
const ZIP64_EXTRA_ID: u16 = 1;

const METHOD_STORED: u16 = 0;
const METHOD_DEFLATED: u16 = 8;

/// Identity used for the single member of an LZ4 file.
pub const LZ4_MEMBER_NAME: &str = "lz4";

/// How a member's bytes are stored inside its container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberCodec {
    Stored,
    Deflate(DeflateParams),
    Lz4(Lz4Params),
}

impl MemberCodec {
    pub fn codec(&self) -> Codec {
        match *self {
            Self::Stored => Codec::Stored,
            Self::Deflate(params) => Codec::Deflate(params),
            Self::Lz4(params) => Codec::Lz4(params),
        }
    }
}

/// Layout of one container member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub identity: String,
    pub packed_size: usize,
    pub unpacked_size: usize,
    /// Start of the member's local header.
    pub header_offset: usize,
    /// Start of the member's (packed) data.
    pub data_offset: usize,
    pub codec: MemberCodec,
}

impl FileInfo {
    /// Span of the packed data.
    pub fn data_span(&self) -> Span {
        Span {
            start: self.data_offset,
            len: self.packed_size,
        }
    }

    /// Span from the local header to the end of the packed data.
    pub fn member_span(&self) -> Span {
        Span {
            start: self.header_offset,
            len: self.data_offset - self.header_offset + self.packed_size,
        }
    }
}

/// Parsed view of a container image.
pub trait PackageParser {
    /// The whole container image.
    fn image(&self) -> &[u8];

    /// Member identities ordered by header offset.
    fn file_ids(&self) -> Vec<&str>;

    fn file_info(&self, id: &str) -> Option<&FileInfo>;

    /// Decompressed payload of a member.
    fn extract(&self, id: &str) -> Result<Vec<u8>>;
}

/// Re-encodes member payloads under explicit codec parameters.
pub trait Compressor {
    fn compress(&self, codec: &MemberCodec, data: &[u8]) -> Result<Vec<u8>>;

    /// Decodes `data`, which must yield exactly `expected_len` bytes.
    fn decompress(&self, codec: &MemberCodec, data: &[u8], expected_len: usize) -> Result<Vec<u8>>;
}

/// Compressor built on the crate's codec adapters.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemberCodecs;

impl Compressor for MemberCodecs {
    fn compress(&self, codec: &MemberCodec, data: &[u8]) -> Result<Vec<u8>> {
        compress_to_vec(codec.codec(), data)
    }

    fn decompress(&self, codec: &MemberCodec, data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        let out = decompress_to_vec(codec.codec(), data)?;
        if out.len() != expected_len {
            return Err(PatchError::invalid_patch(format!(
                "{} member decoded to {} bytes, expected {}",
                codec.codec().name(),
                out.len(),
                expected_len
            )));
        }
        Ok(out)
    }
}

/// Container formats recognized by their leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    Zip,
    Lz4,
    Plain,
}

impl ContainerFormat {
    pub fn detect(image: &[u8]) -> Self {
        match image.get(..4) {
            Some(magic) if u32::from_le_bytes([magic[0], magic[1], magic[2], magic[3]]) == LOCAL_HEADER_SIGNATURE => {
                Self::Zip
            }
            Some(magic)
                if matches!(
                    i32::from_le_bytes([magic[0], magic[1], magic[2], magic[3]]),
                    LZ4S_MAGIC | LZ4B_MAGIC
                ) =>
            {
                Self::Lz4
            }
            _ => Self::Plain,
        }
    }
}

/// Opens `image` with the parser matching its detected format.
pub fn open_package(image: &[u8]) -> Result<Box<dyn PackageParser + '_>> {
    match ContainerFormat::detect(image) {
        ContainerFormat::Zip => Ok(Box::new(ZipParser::parse(image)?)),
        ContainerFormat::Lz4 => Ok(Box::new(Lz4FileParser::parse(image, LZ4_MEMBER_NAME)?)),
        ContainerFormat::Plain => Err(PatchError::invalid_param("image is not a known container")),
    }
}

fn truncated(what: &str) -> PatchError {
    PatchError::invalid_param(format!("truncated zip {what}"))
}

fn read_u16(data: &[u8], at: usize) -> Option<u16> {
    data.get(at..at + 2).map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn read_u32(data: &[u8], at: usize) -> Option<u32> {
    data.get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_u64(data: &[u8], at: usize) -> Option<u64> {
    data.get(at..at + 8).map(|b| {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        u64::from_le_bytes(buf)
    })
}

/// Level implied by the deflate option bits of the general purpose flags.
fn deflate_level_hint(flags: u16) -> i32 {
    match (flags >> 1) & 0b11 {
        0b00 => 6,
        0b01 => 9,
        _ => 1,
    }
}

/// Zip archive parsed through its central directory.
pub struct ZipParser<'a> {
    image: &'a [u8],
    members: Vec<FileInfo>,
    index: HashMap<String, usize>,
}

impl<'a> ZipParser<'a> {
    pub fn parse(image: &'a [u8]) -> Result<Self> {
        let end = Self::find_end_central(image)?;
        if read_u16(image, end + 4) != Some(0) {
            return Err(PatchError::invalid_param("multi-disk zip archives are not supported"));
        }
        let count = read_u16(image, end + 10).ok_or_else(|| truncated("end of central directory"))?;
        let cd_offset = read_u32(image, end + 16).ok_or_else(|| truncated("end of central directory"))?;

        let mut members = Vec::with_capacity(count as usize);
        let mut pos = cd_offset as usize;
        for _ in 0..count {
            let (info, entry_len) = Self::parse_central_entry(image, pos)?;
            members.push(info);
            pos += entry_len;
        }
        members.sort_by_key(|m| m.header_offset);

        let index = members
            .iter()
            .enumerate()
            .map(|(i, m)| (m.identity.clone(), i))
            .collect();
        debug!("zip archive with {} members", members.len());
        Ok(Self {
            image,
            members,
            index,
        })
    }

    fn find_end_central(image: &[u8]) -> Result<usize> {
        if image.len() < END_CENTRAL_LEN {
            return Err(truncated("archive"));
        }
        let last = image.len() - END_CENTRAL_LEN;
        let first = last.saturating_sub(MAX_COMMENT_LEN);
        (first..=last)
            .rev()
            .find(|&at| read_u32(image, at) == Some(END_CENTRAL_SIGNATURE))
            .ok_or_else(|| PatchError::invalid_param("zip end of central directory not found"))
    }

    fn parse_central_entry(image: &[u8], pos: usize) -> Result<(FileInfo, usize)> {
        let entry = image
            .get(pos..pos + CENTRAL_ENTRY_LEN)
            .ok_or_else(|| truncated("central directory"))?;
        if read_u32(entry, 0) != Some(CENTRAL_SIGNATURE) {
            return Err(PatchError::invalid_param(format!(
                "bad central directory signature at {pos}"
            )));
        }
        let field16 = |at| read_u16(entry, at).ok_or_else(|| truncated("central directory"));
        let field32 = |at| read_u32(entry, at).ok_or_else(|| truncated("central directory"));

        let flags = field16(8)?;
        let method = field16(10)?;
        let mut packed = field32(20)? as u64;
        let mut unpacked = field32(24)? as u64;
        let name_len = field16(28)? as usize;
        let extra_len = field16(30)? as usize;
        let comment_len = field16(32)? as usize;
        let mut header_offset = field32(42)? as u64;

        let name_start = pos + CENTRAL_ENTRY_LEN;
        let name = image
            .get(name_start..name_start + name_len)
            .ok_or_else(|| truncated("file name"))?;
        let identity = String::from_utf8_lossy(name).into_owned();

        let extra_start = name_start + name_len;
        let extra = image
            .get(extra_start..extra_start + extra_len)
            .ok_or_else(|| truncated("extra field"))?;
        if read_u16(extra, 0) == Some(ZIP64_EXTRA_ID) {
            // zip64 values appear in this order, only for saturated fields
            let mut at = 4;
            for field in [&mut unpacked, &mut packed, &mut header_offset] {
                if *field == u32::MAX as u64 {
                    *field = read_u64(extra, at).ok_or_else(|| truncated("zip64 extra field"))?;
                    at += 8;
                }
            }
        }

        let to_usize = |v: u64| usize::try_from(v).map_err(|_| PatchError::invalid_param("zip offset out of range"));
        let header_offset = to_usize(header_offset)?;
        let packed_size = to_usize(packed)?;
        let unpacked_size = to_usize(unpacked)?;

        let local = image
            .get(header_offset..header_offset + LOCAL_HEADER_LEN)
            .ok_or_else(|| truncated("local header"))?;
        if read_u32(local, 0) != Some(LOCAL_HEADER_SIGNATURE) {
            return Err(PatchError::invalid_param(format!(
                "bad local header signature for {identity}"
            )));
        }
        let local_name = read_u16(local, 26).ok_or_else(|| truncated("local header"))? as usize;
        let local_extra = read_u16(local, 28).ok_or_else(|| truncated("local header"))? as usize;
        let data_offset = header_offset + LOCAL_HEADER_LEN + local_name + local_extra;
        Span::new(data_offset, packed_size, image.len())?;

        let codec = match method {
            METHOD_STORED => MemberCodec::Stored,
            METHOD_DEFLATED => MemberCodec::Deflate(DeflateParams {
                level: deflate_level_hint(flags),
                ..DeflateParams::default()
            }),
            other => {
                return Err(PatchError::invalid_param(format!(
                    "unsupported compression method {other} for {identity}"
                )))
            }
        };

        let info = FileInfo {
            identity,
            packed_size,
            unpacked_size,
            header_offset,
            data_offset,
            codec,
        };
        Ok((info, CENTRAL_ENTRY_LEN + name_len + extra_len + comment_len))
    }
}

impl PackageParser for ZipParser<'_> {
    fn image(&self) -> &[u8] {
        self.image
    }

    fn file_ids(&self) -> Vec<&str> {
        self.members.iter().map(|m| m.identity.as_str()).collect()
    }

    fn file_info(&self, id: &str) -> Option<&FileInfo> {
        self.index.get(id).map(|&i| &self.members[i])
    }

    fn extract(&self, id: &str) -> Result<Vec<u8>> {
        let info = self
            .file_info(id)
            .ok_or_else(|| PatchError::invalid_param(format!("no member named {id}")))?;
        let packed = info.data_span().slice(self.image);
        MemberCodecs.decompress(&info.codec, packed, info.unpacked_size)
    }
}

/// A single LZ4 file (frame or legacy stream), exposed as one member spanning
/// the whole image.
pub struct Lz4FileParser<'a> {
    image: &'a [u8],
    info: FileInfo,
    content: Vec<u8>,
}

impl<'a> Lz4FileParser<'a> {
    pub fn parse(image: &'a [u8], name: &str) -> Result<Self> {
        let params = Self::stream_params(image)?;
        let content = decompress_to_vec(Codec::Lz4(params), image)?;
        debug!(
            "lz4 {:?} {name}: block size id {} independence {} checksum {}",
            params.format, params.block_size_id, params.block_independence, params.content_checksum
        );
        let info = FileInfo {
            identity: name.to_string(),
            packed_size: image.len(),
            unpacked_size: content.len(),
            header_offset: 0,
            data_offset: 0,
            codec: MemberCodec::Lz4(params),
        };
        Ok(Self {
            image,
            info,
            content,
        })
    }

    /// Codec parameters of an LZ4 file: the frame descriptor (FLG and BD
    /// bytes) for frames, the fixed legacy settings otherwise.
    pub fn stream_params(image: &[u8]) -> Result<Lz4Params> {
        let magic = image
            .get(..4)
            .map(|m| i32::from_le_bytes([m[0], m[1], m[2], m[3]]))
            .ok_or_else(|| PatchError::invalid_param("truncated lz4 header"))?;
        if magic == LZ4B_MAGIC {
            return Ok(Lz4Params {
                format: Lz4Format::Block,
                ..Lz4Params::default()
            });
        }
        if magic != LZ4S_MAGIC {
            return Err(PatchError::invalid_param(format!("bad lz4 magic {magic:#x}")));
        }
        let descriptor = image
            .get(..6)
            .ok_or_else(|| PatchError::invalid_param("truncated lz4 frame header"))?;
        let flg = descriptor[4];
        let bd = descriptor[5];
        if flg >> 6 != 0b01 {
            return Err(PatchError::invalid_param("unsupported lz4 frame version"));
        }
        Ok(Lz4Params {
            format: Lz4Format::Frame,
            block_independence: i32::from((flg >> 5) & 1),
            content_checksum: i32::from((flg >> 2) & 1),
            block_size_id: i32::from((bd >> 4) & 0b111),
            ..Lz4Params::default()
        })
    }
}

impl PackageParser for Lz4FileParser<'_> {
    fn image(&self) -> &[u8] {
        self.image
    }

    fn file_ids(&self) -> Vec<&str> {
        vec![self.info.identity.as_str()]
    }

    fn file_info(&self, id: &str) -> Option<&FileInfo> {
        (id == self.info.identity).then_some(&self.info)
    }

    fn extract(&self, id: &str) -> Result<Vec<u8>> {
        if id != self.info.identity {
            return Err(PatchError::invalid_param(format!("no member named {id}")));
        }
        Ok(self.content.clone())
    }
}
