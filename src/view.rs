//! Read-only views over input data: memory-mapped files and bounds-checked spans.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use crate::error::{PatchError, Result};

/// A file mapped read-only into memory.
///
/// The mapping and the descriptor are released together when the value is
/// dropped. Empty files are not mapped at all and read as an empty slice.
pub struct MappedFile {
    map: Option<Mmap>,
    _file: File,
}

impl MappedFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        let map = if len > 0 {
            // SAFETY: the mapping is read-only and lives no longer than `file`.
            Some(unsafe { Mmap::map(&file)? })
        } else {
            None
        };
        Ok(Self { map, _file: file })
    }

    pub fn as_slice(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AsRef<[u8]> for MappedFile {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

/// A validated `(start, len)` window into a buffer of known length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub len: usize,
}

impl Span {
    /// Creates a span, rejecting windows that leave a buffer of `total` bytes.
    pub fn new(start: usize, len: usize, total: usize) -> Result<Self> {
        Self::check(start, len, total)
            .ok_or_else(|| PatchError::invalid_param(format!("span {start}+{len} exceeds {total}")))
    }

    /// Like [`Span::new`], for offsets decoded from patch bytes.
    pub fn within(start: i64, len: i64, total: usize) -> Result<Self> {
        let bad = || PatchError::invalid_patch(format!("span {start}+{len} exceeds {total}"));
        let start = usize::try_from(start).map_err(|_| bad())?;
        let len = usize::try_from(len).map_err(|_| bad())?;
        Self::check(start, len, total).ok_or_else(bad)
    }

    fn check(start: usize, len: usize, total: usize) -> Option<Self> {
        match start.checked_add(len) {
            Some(end) if end <= total => Some(Self { start, len }),
            _ => None,
        }
    }

    pub fn end(&self) -> usize {
        self.start + self.len
    }

    pub fn slice<'a>(&self, buffer: &'a [u8]) -> &'a [u8] {
        &buffer[self.start..self.end()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn span_rejects_overflow() {
        assert!(Span::new(4, 4, 8).is_ok());
        assert!(matches!(Span::new(5, 4, 8), Err(PatchError::InvalidParam(_))));
        assert!(Span::new(usize::MAX, 2, 8).is_err());
        assert!(matches!(Span::within(-1, 2, 8), Err(PatchError::InvalidPatch(_))));
        assert!(matches!(Span::within(0, 9, 8), Err(PatchError::InvalidPatch(_))));
    }

    #[test]
    fn span_slices_buffer() {
        let data = b"0123456789";
        let span = Span::new(2, 3, data.len()).unwrap();
        assert_eq!(span.slice(data), b"234");
        assert_eq!(span.end(), 5);
    }

    #[test]
    fn maps_file_contents() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"mapped bytes").unwrap();
        file.flush().unwrap();
        let mapped = MappedFile::open(file.path()).unwrap();
        assert_eq!(mapped.as_slice(), b"mapped bytes");
    }

    #[test]
    fn empty_file_has_no_mapping() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mapped = MappedFile::open(file.path()).unwrap();
        assert!(mapped.is_empty());
        assert!(mapped.map.is_none());
    }
}
