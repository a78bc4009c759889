/*-
 * Copyright 2003-2005 Colin Percival
 * Copyright 2012 Matthew Endsley
 * Modified 2017 Pieter-Jan Briers
 * Modified 2025 - Performance optimizations
 * All rights reserved
 *
 * Redistribution and use in source and binary forms, with or without
 * modification, are permitted providing that the following conditions
 * are met:
 * 1. Redistributions of source code must retain the above copyright
 *    notice, this list of conditions and the following disclaimer.
 * 2. Redistributions in binary form must reproduce the above copyright
 *    notice, this list of conditions and the following disclaimer in the
 *    documentation and/or other materials provided with the distribution.
 *
 * THIS SOFTWARE IS PROVIDED BY THE AUTHOR ``AS IS'' AND ANY EXPRESS OR
 * IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE IMPLIED
 * WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE
 * ARE DISCLAIMED.  IN NO EVENT SHALL THE AUTHOR BE LIABLE FOR ANY
 * DIRECT, INDIRECT, INCIDENTAL, SPECIAL, EXEMPLARY, OR CONSEQUENTIAL
 * DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS
 * OR SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION)
 * HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY, WHETHER IN CONTRACT,
 * STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING
 * IN ANY WAY OUT OF THE USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE
 * POSSIBILITY OF SUCH DAMAGE.
 */

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::{debug, info};

use crate::codec::{DecompressAdapter, LIMIT_UNIT};
use crate::error::{PatchError, Result};
use crate::format::{le_bytes, offtin, PatchHeader, CONTROL_RECORD_LEN, PATCH_HEADER_LEN};
use crate::view::MappedFile;

/// Random-access source of old bytes.
pub trait OldSource {
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fills `buf` from `offset`; the range is always inside `0..len()`.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

impl OldSource for &[u8] {
    fn len(&self) -> u64 {
        <[u8]>::len(self) as u64
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = offset as usize;
        buf.copy_from_slice(&self[start..start + buf.len()]);
        Ok(())
    }
}

/// Old data read from a seekable stream instead of a flat buffer.
pub struct StreamSource<R> {
    inner: R,
    len: u64,
}

impl<R: Read + Seek> StreamSource<R> {
    pub fn new(mut inner: R) -> Result<Self> {
        let len = inner.seek(SeekFrom::End(0))?;
        Ok(Self { inner, len })
    }
}

impl<R: Read + Seek> OldSource for StreamSource<R> {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.inner.seek(SeekFrom::Start(offset))?;
        self.inner.read_exact(buf)?;
        Ok(())
    }
}

/// Byte-addressable output of a patch application.
///
/// Writers are called with monotonically increasing offsets.
pub trait Sink {
    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()>;
}

impl Sink for Vec<u8> {
    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| PatchError::invalid_param("sink offset out of range"))?;
        let end = start + data.len();
        if self.len() < end {
            self.resize(end, 0);
        }
        self[start..end].copy_from_slice(data);
        Ok(())
    }
}

impl<S: Sink + ?Sized> Sink for &mut S {
    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        (**self).write(offset, data)
    }
}

/// Sequential-append sink over any writer.
pub struct WriterSink<W> {
    inner: W,
    position: u64,
}

impl<W: Write> WriterSink<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, position: 0 }
    }

    /// Bytes written so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Sink for WriterSink<W> {
    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if offset != self.position {
            return Err(PatchError::invalid_param(format!(
                "out-of-order write at {offset}, expected {}",
                self.position
            )));
        }
        self.inner.write_all(data)?;
        self.position += data.len() as u64;
        Ok(())
    }
}

/// Shifts every write of an inner sink by a fixed base offset.
pub struct OffsetSink<S> {
    inner: S,
    base: u64,
}

impl<S: Sink> OffsetSink<S> {
    pub fn new(inner: S, base: u64) -> Self {
        Self { inner, base }
    }
}

impl<S: Sink> Sink for OffsetSink<S> {
    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.inner.write(self.base + offset, data)
    }
}

/// Adds old bytes at `old_offset` onto `chunk`; positions outside the old
/// data contribute zero.
fn add_old<O: OldSource + ?Sized>(
    old: &mut O,
    old_offset: i64,
    chunk: &mut [u8],
    scratch: &mut [u8],
) -> Result<()> {
    let start = old_offset;
    let end = old_offset.saturating_add(chunk.len() as i64);
    let lo = start.max(0);
    let hi = end.min(old.len() as i64);
    if lo >= hi {
        return Ok(());
    }
    let n = (hi - lo) as usize;
    let skip = (lo - start) as usize;
    old.read_at(lo as u64, &mut scratch[..n])?;
    for (b, o) in chunk[skip..skip + n].iter_mut().zip(&scratch[..n]) {
        *b = b.wrapping_add(*o);
    }
    Ok(())
}

/// Replays a block patch against `old`, writing the new data into `sink`.
///
/// The header is validated before anything is written. Returns the number of
/// bytes produced.
pub fn patch_to<O, S>(old: &mut O, patch: &[u8], sink: &mut S) -> Result<u64>
where
    O: OldSource + ?Sized,
    S: Sink + ?Sized,
{
    let header = PatchHeader::parse(patch)?;
    let diff_start = PATCH_HEADER_LEN + header.control_len as usize;
    let extra_start = diff_start + header.diff_len as usize;

    let mut control =
        DecompressAdapter::new(header.codecs[0].into(), &patch[PATCH_HEADER_LEN..diff_start]);
    let mut diff = DecompressAdapter::new(header.codecs[1].into(), &patch[diff_start..extra_start]);
    let mut extra = DecompressAdapter::new(header.codecs[2].into(), &patch[extra_start..]);
    control.open()?;
    diff.open()?;
    extra.open()?;

    let new_size = header.new_len as u64;
    let mut new_offset = 0u64;
    let mut old_offset = 0i64;
    let mut buf = vec![0u8; LIMIT_UNIT];
    let mut scratch = vec![0u8; LIMIT_UNIT];
    let mut records = 0usize;

    while new_offset < new_size {
        let mut record = [0u8; CONTROL_RECORD_LEN];
        control.read_data(&mut record)?;
        let diff_len = offtin(le_bytes(&record, 0));
        let extra_len = offtin(le_bytes(&record, 8));
        let increment = offtin(le_bytes(&record, 16));
        records += 1;

        if diff_len < 0 || extra_len < 0 {
            return Err(PatchError::invalid_patch(format!(
                "negative length in control record: diff={diff_len}, extra={extra_len}"
            )));
        }
        let fits = (diff_len as u64)
            .checked_add(extra_len as u64)
            .and_then(|n| n.checked_add(new_offset))
            .map_or(false, |end| end <= new_size);
        if !fits {
            return Err(PatchError::invalid_patch(format!(
                "control record exceeds new size {new_size} at offset {new_offset}"
            )));
        }

        let mut remaining = diff_len as u64;
        while remaining > 0 {
            let n = remaining.min(LIMIT_UNIT as u64) as usize;
            let chunk = &mut buf[..n];
            diff.read_data(chunk)?;
            add_old(old, old_offset, chunk, &mut scratch)?;
            sink.write(new_offset, chunk)?;
            new_offset += n as u64;
            old_offset = old_offset.saturating_add(n as i64);
            remaining -= n as u64;
        }

        let mut remaining = extra_len as u64;
        while remaining > 0 {
            let n = remaining.min(LIMIT_UNIT as u64) as usize;
            let chunk = &mut buf[..n];
            extra.read_data(chunk)?;
            sink.write(new_offset, chunk)?;
            new_offset += n as u64;
            remaining -= n as u64;
        }

        old_offset = old_offset.checked_add(increment).ok_or_else(|| {
            PatchError::invalid_patch(format!("seek overflow: old={old_offset}, seek={increment}"))
        })?;
    }

    control.close();
    diff.close();
    extra.close();
    debug!("replayed {records} control records into {new_offset} bytes");
    Ok(new_offset)
}

/// Applies a block patch to an in-memory old buffer.
pub fn patch(old: &[u8], patch: &[u8]) -> Result<Vec<u8>> {
    let mut new = Vec::new();
    let mut source = old;
    patch_to(&mut source, patch, &mut new)?;
    Ok(new)
}

/// Applies a patch file to an old file. The new file is not created when the
/// header is invalid and is removed when replay fails.
pub fn patch_files<P: AsRef<Path>>(patch_path: P, old_path: P, new_path: P) -> Result<u64> {
    let new_path = new_path.as_ref();
    let patch = MappedFile::open(patch_path)?;
    let old = MappedFile::open(old_path)?;
    PatchHeader::parse(patch.as_slice())?;

    let write = || -> Result<u64> {
        let mut sink = WriterSink::new(BufWriter::new(File::create(new_path)?));
        let mut source = old.as_slice();
        let written = patch_to(&mut source, patch.as_slice(), &mut sink)?;
        sink.into_inner().flush()?;
        Ok(written)
    };
    match write() {
        Ok(written) => {
            info!(
                "block patch applied: old {} patch {} new {}",
                old.len(),
                patch.len(),
                written
            );
            Ok(written)
        }
        Err(e) => {
            if let Err(rm) = fs::remove_file(new_path) {
                if rm.kind() != io::ErrorKind::NotFound {
                    debug!("could not remove {}: {rm}", new_path.display());
                }
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_diff::diff;
    use crate::codec::StreamCodec;
    use crate::format::offtout;
    use std::io::Cursor;

    /// Block patch with uncompressed streams.
    fn stored_patch(records: &[(i64, i64, i64)], diff: &[u8], extra: &[u8], new_len: i64) -> Vec<u8> {
        let mut control = Vec::new();
        for &(d, e, i) in records {
            let mut buf = [0u8; 24];
            offtout(d, &mut buf[..8]);
            offtout(e, &mut buf[8..16]);
            offtout(i, &mut buf[16..]);
            control.extend_from_slice(&buf);
        }
        let mut header = PatchHeader::new([StreamCodec::None; 3]);
        header.control_len = control.len() as i64;
        header.diff_len = diff.len() as i64;
        header.new_len = new_len;
        let mut out = header.encode().to_vec();
        out.extend_from_slice(&control);
        out.extend_from_slice(diff);
        out.extend_from_slice(extra);
        out
    }

    #[test]
    fn replays_diff_and_extra() {
        let old = b"hello world";
        let new = b"hello there world";
        let p = diff(old, new).unwrap();
        assert_eq!(patch(old, &p).unwrap(), new);
    }

    #[test]
    fn empty_new_writes_nothing() {
        let p = diff(b"some old bytes", b"").unwrap();
        assert!(patch(b"some old bytes", &p).unwrap().is_empty());
    }

    #[test]
    fn out_of_range_old_bytes_count_as_zero() {
        let p = stored_patch(&[(4, 0, 0)], &[1, 1, 7, 9], &[], 4);
        assert_eq!(patch(&[10, 20], &p).unwrap(), vec![11, 21, 7, 9]);

        // negative old offset after the seek
        let p = stored_patch(&[(1, 0, -2), (2, 0, 0)], &[1, 5, 5], &[], 3);
        assert_eq!(patch(&[10, 20], &p).unwrap(), vec![11, 5, 15]);
    }

    #[test]
    fn corrupted_magic_writes_no_output() {
        let mut p = diff(b"abcdef", b"abcxef").unwrap();
        for i in 0..8 {
            p[i] ^= 0x20;
            let mut sink = Vec::new();
            let result = patch_to(&mut &b"abcdef"[..], &p, &mut sink);
            assert!(matches!(result, Err(PatchError::InvalidPatch(_))));
            assert!(sink.is_empty());
            p[i] ^= 0x20;
        }
    }

    #[test]
    fn record_past_new_size_is_rejected() {
        let p = stored_patch(&[(0, 5, 0)], &[], b"abcde", 3);
        assert!(matches!(patch(b"", &p), Err(PatchError::InvalidPatch(_))));
    }

    #[test]
    fn truncated_control_stream_is_rejected() {
        let p = stored_patch(&[(0, 2, 0)], &[], b"ab", 4);
        assert!(matches!(patch(b"", &p), Err(PatchError::InvalidPatch(_))));
    }

    #[test]
    fn stream_source_matches_buffer() {
        let old: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        let mut new = old.clone();
        new[25_000..25_010].copy_from_slice(b"0123456789");
        let p = diff(&old, &new).unwrap();

        let mut source = StreamSource::new(Cursor::new(old.clone())).unwrap();
        let mut sink = WriterSink::new(Vec::new());
        let written = patch_to(&mut source, &p, &mut sink).unwrap();
        assert_eq!(written, new.len() as u64);
        assert_eq!(sink.into_inner(), new);
    }

    #[test]
    fn writer_sink_rejects_out_of_order_writes() {
        let mut sink = WriterSink::new(Vec::new());
        sink.write(0, b"ab").unwrap();
        assert!(matches!(
            sink.write(5, b"cd"),
            Err(PatchError::InvalidParam(_))
        ));
        assert_eq!(sink.position(), 2);
    }

    #[test]
    fn offset_sink_shifts_writes() {
        let mut out = vec![0u8; 2];
        OffsetSink::new(&mut out, 2).write(0, b"xy").unwrap();
        assert_eq!(out, vec![0, 0, b'x', b'y']);
    }
}
