//! Wire-level constants and the BSDIFF40 / BSDF2 block-patch header.

use crate::codec::StreamCodec;
use crate::error::{PatchError, Result};

pub const BSDIFF_MAGIC: &[u8; 8] = b"BSDIFF40";
pub const BSDF2_MAGIC: &[u8; 5] = b"BSDF2";
pub const PKGDIFF_MAGIC: &[u8; 8] = b"PKGDIFF0";

/// Magic plus three 8-byte length fields.
pub const PATCH_HEADER_LEN: usize = 32;
/// One control record: three 8-byte integers.
pub const CONTROL_RECORD_LEN: usize = 24;

/// encode signed integer in bspatch sign-magnitude format
#[inline]
pub fn offtout(x: i64, buf: &mut [u8]) {
    if x >= 0 {
        buf.copy_from_slice(&x.to_le_bytes());
    } else {
        let tmp = x.unsigned_abs() | (1u64 << 63);
        buf.copy_from_slice(&tmp.to_le_bytes());
    }
}

/// Reads sign-magnitude i64 as used in bspatch
/// This is NOT plain little-endian - it uses sign-magnitude encoding
#[inline]
pub fn offtin(buf: [u8; 8]) -> i64 {
    let y = i64::from_le_bytes(buf);
    if 0 == y & (1 << 63) {
        y
    } else {
        -(y & !(1 << 63))
    }
}

#[inline]
pub(crate) fn le_bytes<const N: usize>(data: &[u8], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&data[at..at + N]);
    out
}

/// Header of a single block patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchHeader {
    /// Compression of the control, diff and extra streams.
    pub codecs: [StreamCodec; 3],
    pub control_len: i64,
    pub diff_len: i64,
    pub new_len: i64,
}

impl PatchHeader {
    pub fn new(codecs: [StreamCodec; 3]) -> Self {
        Self {
            codecs,
            control_len: 0,
            diff_len: 0,
            new_len: 0,
        }
    }

    /// True when all streams use bzip2 and the classic magic is written.
    pub fn is_legacy(&self) -> bool {
        self.codecs.iter().all(|c| *c == StreamCodec::Bz2)
    }

    pub fn encode(&self) -> [u8; PATCH_HEADER_LEN] {
        let mut header = [0u8; PATCH_HEADER_LEN];
        if self.is_legacy() {
            header[0..8].copy_from_slice(BSDIFF_MAGIC);
        } else {
            header[0..5].copy_from_slice(BSDF2_MAGIC);
            header[5] = self.codecs[0] as u8;
            header[6] = self.codecs[1] as u8;
            header[7] = self.codecs[2] as u8;
        }
        offtout(self.control_len, &mut header[8..16]);
        offtout(self.diff_len, &mut header[16..24]);
        offtout(self.new_len, &mut header[24..32]);
        header
    }

    /// Parses and validates a header against the physical patch length.
    pub fn parse(patch: &[u8]) -> Result<Self> {
        if patch.len() < PATCH_HEADER_LEN {
            return Err(PatchError::invalid_patch("patch data too short"));
        }

        let magic = &patch[0..8];
        let codecs = if magic == BSDIFF_MAGIC {
            [StreamCodec::Bz2; 3]
        } else if &magic[0..5] == BSDF2_MAGIC {
            let alg = |b: u8| {
                StreamCodec::from_u8(b).ok_or_else(|| {
                    PatchError::invalid_patch(format!("unknown compression algorithm: {b}"))
                })
            };
            [alg(magic[5])?, alg(magic[6])?, alg(magic[7])?]
        } else {
            return Err(PatchError::invalid_patch("invalid BSDIFF/BSDF2 magic header"));
        };

        let header = Self {
            codecs,
            control_len: offtin(le_bytes(patch, 8)),
            diff_len: offtin(le_bytes(patch, 16)),
            new_len: offtin(le_bytes(patch, 24)),
        };

        if header.control_len < 0 || header.diff_len < 0 || header.new_len < 0 {
            return Err(PatchError::invalid_patch("negative length in patch header"));
        }
        let fits = (header.control_len as u64)
            .checked_add(header.diff_len as u64)
            .and_then(|n| n.checked_add(PATCH_HEADER_LEN as u64))
            .map_or(false, |total| total <= patch.len() as u64);
        if !fits {
            return Err(PatchError::invalid_patch("stream lengths exceed patch size"));
        }
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offtin_zero() {
        assert_eq!(offtin([0u8; 8]), 0);
    }

    #[test]
    fn test_offtin_negative() {
        // 42 with sign bit set
        let buf = [42, 0, 0, 0, 0, 0, 0, 0x80];
        assert_eq!(offtin(buf), -42);
    }

    #[test]
    fn test_offtin_max_positive() {
        let buf = [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x7F];
        assert_eq!(offtin(buf), i64::MAX);
    }

    #[test]
    fn test_offtin_max_negative() {
        let buf = [0xFF; 8];
        assert_eq!(offtin(buf), -i64::MAX);
    }

    #[test]
    fn test_offtout_negative() {
        let mut buf = [0u8; 8];
        offtout(-42, &mut buf);
        assert_eq!(buf, [42, 0, 0, 0, 0, 0, 0, 0x80]);
        offtout(0, &mut buf);
        assert_eq!(buf, [0; 8]);
    }

    #[test]
    fn header_magic_follows_codecs() {
        let legacy = PatchHeader::new([StreamCodec::Bz2; 3]).encode();
        assert_eq!(&legacy[0..8], BSDIFF_MAGIC);

        let mixed = PatchHeader::new([StreamCodec::Brotli, StreamCodec::Brotli, StreamCodec::Bz2]).encode();
        assert_eq!(&mixed[0..8], b"BSDF2\x02\x02\x01");
    }

    #[test]
    fn parse_rejects_short_and_bad_magic() {
        assert!(PatchHeader::parse(&[0u8; 16]).is_err());
        assert!(matches!(
            PatchHeader::parse(&[0u8; 32]),
            Err(PatchError::InvalidPatch(_))
        ));
    }

    #[test]
    fn parse_rejects_negative_lengths() {
        let mut data = vec![0u8; 32];
        data[0..8].copy_from_slice(BSDIFF_MAGIC);
        data[8] = 0x01;
        data[15] = 0x80;
        assert!(PatchHeader::parse(&data).is_err());
    }

    #[test]
    fn parse_rejects_streams_past_end() {
        let mut header = PatchHeader::new([StreamCodec::Bz2; 3]);
        header.control_len = 10;
        header.diff_len = 10;
        let mut data = header.encode().to_vec();
        data.extend_from_slice(&[0u8; 19]);
        assert!(PatchHeader::parse(&data).is_err());
        data.push(0);
        assert_eq!(PatchHeader::parse(&data).unwrap(), header);
    }

    #[test]
    fn parse_rejects_unknown_bsdf2_algorithm() {
        let mut data = vec![0u8; 32];
        data[0..8].copy_from_slice(b"BSDF2\x01\x01\x09");
        assert!(PatchHeader::parse(&data).is_err());
    }
}
