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
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::Instant;

use log::{debug, info};

use crate::codec::{BufferSink, CodecAdapter, CompressAdapter, StreamCodec, LIMIT_UNIT};
use crate::config::DiffConfig;
use crate::error::Result;
use crate::format::{offtout, PatchHeader, CONTROL_RECORD_LEN, PATCH_HEADER_LEN};
use crate::suffix_array::SuffixArray;
use crate::view::MappedFile;

/// A match is accepted once it beats the running old score by this much.
const BLOCK_SCORE: isize = 8;

/// One reconstruction step: add `diff_length` bytes onto old data, copy
/// `extra_length` literal bytes, then move the old cursor by `offset_increment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRecord {
    pub diff_length: i64,
    pub extra_length: i64,
    pub offset_increment: i64,
    /// Start of the diff run in the new buffer.
    pub diff_new_start: usize,
    /// Start of the diff run in the old buffer.
    pub diff_old_start: usize,
    /// Start of the literal run in the new buffer.
    pub extra_new_start: usize,
}

/// Scan state of the greedy match extension.
///
/// Each [`ScanCursor::step`] call advances to the next control record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanCursor {
    pub current_offset: usize,
    pub last_scan: usize,
    pub last_pos: usize,
    pub last_offset: isize,
    pub match_pos: usize,
    pub match_len: usize,
}

impl ScanCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Produces the next control record, or `None` once `new` is covered.
    pub fn step(&mut self, sa: &SuffixArray, old: &[u8], new: &[u8]) -> Option<ControlRecord> {
        while self.current_offset < new.len() {
            let old_score = self.extend_match(sa, old, new);
            if self.match_len as isize == old_score && self.current_offset != new.len() {
                continue;
            }

            let (lenf, lenb) = self.split_lengths(old, new);
            // nothing reads the old cursor after the final record
            let offset_increment = if self.current_offset == new.len() {
                0
            } else {
                (self.match_pos as i64 - lenb as i64) - (self.last_pos + lenf) as i64
            };
            let record = ControlRecord {
                diff_length: lenf as i64,
                extra_length: ((self.current_offset - lenb) - (self.last_scan + lenf)) as i64,
                offset_increment,
                diff_new_start: self.last_scan,
                diff_old_start: self.last_pos,
                extra_new_start: self.last_scan + lenf,
            };

            self.last_scan = self.current_offset - lenb;
            self.last_pos = self.match_pos - lenb;
            self.last_offset = self.match_pos as isize - self.current_offset as isize;
            return Some(record);
        }
        None
    }

    #[inline]
    fn old_matches(&self, old: &[u8], new: &[u8], at: usize) -> bool {
        let o = at as isize + self.last_offset;
        o >= 0 && o < old.len() as isize && old[o as usize] == new[at]
    }

    /// Finds the next matching block, returning the running old score.
    fn extend_match(&mut self, sa: &SuffixArray, old: &[u8], new: &[u8]) -> isize {
        let mut old_score = 0isize;
        self.current_offset += self.match_len;
        let mut scsc = self.current_offset;

        while self.current_offset < new.len() {
            let (len, pos) = sa.search(old, &new[self.current_offset..]);
            self.match_len = len;
            self.match_pos = pos;

            // Score matches in overlap region
            while scsc < self.current_offset + self.match_len {
                if self.old_matches(old, new, scsc) {
                    old_score += 1;
                }
                scsc += 1;
            }

            let len = self.match_len as isize;
            if (len == old_score && len != 0) || len > old_score + BLOCK_SCORE {
                break;
            }

            if self.old_matches(old, new, self.current_offset) {
                old_score -= 1;
            }
            self.current_offset += 1;
        }
        old_score
    }

    /// Forward extent of the previous match and backward extent of the next
    /// one, with any overlap resolved to the best split point.
    fn split_lengths(&self, old: &[u8], new: &[u8]) -> (usize, usize) {
        let scan = self.current_offset;
        let lastscan = self.last_scan;
        let lastpos = self.last_pos;
        let pos = self.match_pos;

        // Find optimal split point (forward)
        let mut s = 0isize;
        let mut best_forward = 0isize;
        let mut lenf = 0usize;
        let mut i = 0usize;
        while lastscan + i < scan && lastpos + i < old.len() {
            if old[lastpos + i] == new[lastscan + i] {
                s += 1;
            }
            i += 1;
            if s * 2 - i as isize > best_forward * 2 - lenf as isize {
                best_forward = s;
                lenf = i;
            }
        }

        // Find optimal split point (backward)
        let mut lenb = 0usize;
        if scan < new.len() {
            let mut s = 0isize;
            let mut best_backward = 0isize;
            let mut i = 1;
            while scan >= lastscan + i && pos >= i {
                if old[pos - i] == new[scan - i] {
                    s += 1;
                }
                if s * 2 - i as isize > best_backward * 2 - lenb as isize {
                    best_backward = s;
                    lenb = i;
                }
                i += 1;
            }
        }

        // Handle overlap between forward and backward matches
        if lastscan + lenf > scan - lenb {
            let overlap = lastscan + lenf - (scan - lenb);
            let mut s = 0isize;
            let mut best_overlap = 0isize;
            let mut lens = 0;
            for i in 0..overlap {
                if new[lastscan + lenf - overlap + i] == old[lastpos + lenf - overlap + i] {
                    s += 1;
                }
                if new[scan - lenb + i] == old[pos - lenb + i] {
                    s -= 1;
                }
                if s > best_overlap {
                    best_overlap = s;
                    lens = i + 1;
                }
            }
            lenf = lenf + lens - overlap;
            lenb -= lens;
        }

        (lenf, lenb)
    }
}

/// Block-level differ: one suffix array over `old`, one patch for `new`.
pub struct BlockDiff<'a> {
    old: &'a [u8],
    new: &'a [u8],
    suffix_array: SuffixArray,
    codecs: [StreamCodec; 3],
}

impl<'a> BlockDiff<'a> {
    pub fn new(old: &'a [u8], new: &'a [u8]) -> Self {
        Self {
            old,
            new,
            suffix_array: SuffixArray::new(old),
            codecs: [StreamCodec::Bz2; 3],
        }
    }

    pub fn with_stream_codecs(mut self, codecs: [StreamCodec; 3]) -> Self {
        self.codecs = codecs;
        self
    }

    /// Runs the scan over the whole new buffer.
    pub fn control_records(&self) -> Vec<ControlRecord> {
        let started = Instant::now();
        let mut cursor = ScanCursor::new();
        let mut records = Vec::new();
        while let Some(record) = cursor.step(&self.suffix_array, self.old, self.new) {
            records.push(record);
        }
        debug!(
            "{} control records for {} new bytes in {:?}",
            records.len(),
            self.new.len(),
            started.elapsed()
        );
        records
    }

    /// Writes a complete block patch at the current position of `out`.
    ///
    /// The header is written zeroed first and rewritten with the real stream
    /// lengths only after all three streams were flushed. Returns the patch size.
    pub fn write_patch<W: Write + Seek>(&self, out: &mut W) -> Result<usize> {
        let records = self.control_records();
        let start = out.stream_position()?;

        let mut header = PatchHeader::new(self.codecs);
        out.write_all(&header.encode())?;

        let control_size = self.write_control(&records, out)?;
        let diff_size = self.write_diff(&records, out)?;
        let extra_size = self.write_extra(&records, out)?;

        header.control_len = control_size as i64;
        header.diff_len = diff_size as i64;
        header.new_len = self.new.len() as i64;
        out.seek(SeekFrom::Start(start))?;
        out.write_all(&header.encode())?;
        out.seek(SeekFrom::End(0))?;

        let patch_size = PATCH_HEADER_LEN + control_size + diff_size + extra_size;
        debug!(
            "block patch {} bytes: control {} diff {} extra {}",
            patch_size, control_size, diff_size, extra_size
        );
        Ok(patch_size)
    }

    fn write_control<W: Write>(&self, records: &[ControlRecord], out: &mut W) -> Result<usize> {
        let mut adapter = CompressAdapter::new(self.codecs[0].into(), out);
        adapter.open()?;
        let mut buf = [0u8; CONTROL_RECORD_LEN];
        for record in records {
            offtout(record.diff_length, &mut buf[..8]);
            offtout(record.extra_length, &mut buf[8..16]);
            offtout(record.offset_increment, &mut buf[16..24]);
            adapter.write_data(&buf)?;
        }
        let size = adapter.flush_data()?;
        adapter.close()?;
        Ok(size)
    }

    fn write_diff<W: Write>(&self, records: &[ControlRecord], out: &mut W) -> Result<usize> {
        let mut adapter = CompressAdapter::new(self.codecs[1].into(), out);
        adapter.open()?;
        let mut buffer = Vec::with_capacity(LIMIT_UNIT);
        for record in records.iter().filter(|r| r.diff_length > 0) {
            let len = record.diff_length as usize;
            let new = &self.new[record.diff_new_start..record.diff_new_start + len];
            let old = &self.old[record.diff_old_start..record.diff_old_start + len];
            for (n, o) in new.chunks(LIMIT_UNIT).zip(old.chunks(LIMIT_UNIT)) {
                buffer.clear();
                buffer.extend(n.iter().zip(o).map(|(n, o)| n.wrapping_sub(*o)));
                adapter.write_data(&buffer)?;
            }
        }
        let size = adapter.flush_data()?;
        adapter.close()?;
        Ok(size)
    }

    fn write_extra<W: Write>(&self, records: &[ControlRecord], out: &mut W) -> Result<usize> {
        let mut adapter = CompressAdapter::new(self.codecs[2].into(), out);
        adapter.open()?;
        for record in records.iter().filter(|r| r.extra_length > 0) {
            let start = record.extra_new_start;
            adapter.write_data(&self.new[start..start + record.extra_length as usize])?;
        }
        let size = adapter.flush_data()?;
        adapter.close()?;
        Ok(size)
    }
}

/// Diffs two buffers into a new in-memory block patch.
pub fn diff(old: &[u8], new: &[u8]) -> Result<Vec<u8>> {
    diff_with(old, new, &DiffConfig::default())
}

pub fn diff_with(old: &[u8], new: &[u8], config: &DiffConfig) -> Result<Vec<u8>> {
    let mut patch = Vec::new();
    diff_into(old, new, &mut patch, 0, config)?;
    Ok(patch)
}

/// Writes a block patch into `patch` starting at `offset`; the buffer is
/// trimmed to the end of the patch. Returns the patch size.
pub fn diff_into(
    old: &[u8],
    new: &[u8],
    patch: &mut Vec<u8>,
    offset: usize,
    config: &DiffConfig,
) -> Result<usize> {
    let mut sink = BufferSink::new(patch, offset);
    let size = BlockDiff::new(old, new)
        .with_stream_codecs(config.stream_codecs)
        .write_patch(&mut sink)?;
    sink.finish();
    Ok(size)
}

/// Appends a block patch at the current position of a seekable stream.
pub fn diff_to_stream<W: Write + Seek>(
    old: &[u8],
    new: &[u8],
    out: &mut W,
    config: &DiffConfig,
) -> Result<usize> {
    BlockDiff::new(old, new)
        .with_stream_codecs(config.stream_codecs)
        .write_patch(out)
}

/// Diffs two files into a block patch file. A partially written patch file is
/// removed on failure.
pub fn diff_files<P: AsRef<Path>>(
    old_path: P,
    new_path: P,
    patch_path: P,
    config: &DiffConfig,
) -> Result<usize> {
    let patch_path = patch_path.as_ref();
    info!("block diff {}", patch_path.display());
    let old = MappedFile::open(old_path)?;
    let new = MappedFile::open(new_path)?;

    let write = || -> Result<usize> {
        let mut out = BufWriter::new(File::create(patch_path)?);
        let size = diff_to_stream(old.as_slice(), new.as_slice(), &mut out, config)?;
        out.flush()?;
        Ok(size)
    };
    match write() {
        Ok(size) => {
            info!(
                "block diff done: old {} new {} patch {}",
                old.len(),
                new.len(),
                size
            );
            Ok(size)
        }
        Err(e) => {
            let _ = fs::remove_file(patch_path);
            Err(e)
        }
    }
}
