use crate::codec::StreamCodec;

/// Block patches for blocks at least this large are staged in a sidecar file.
pub const DEFAULT_SIDECAR_THRESHOLD: usize = 1 << 20;

/// Settings shared by block and image diffing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffConfig {
    /// Split threshold for images and upper bound for member payloads.
    /// `0` disables splitting.
    pub limit: usize,
    /// Compression of the control, diff and extra streams of every block patch.
    pub stream_codecs: [StreamCodec; 3],
    /// Size from which image diffing stages block patches on disk.
    pub sidecar_threshold: usize,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            limit: 0,
            stream_codecs: [StreamCodec::Bz2; 3],
            sidecar_threshold: DEFAULT_SIDECAR_THRESHOLD,
        }
    }
}

impl DiffConfig {
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_stream_codecs(mut self, codecs: [StreamCodec; 3]) -> Self {
        self.stream_codecs = codecs;
        self
    }

    pub fn with_sidecar_threshold(mut self, threshold: usize) -> Self {
        self.sidecar_threshold = threshold;
        self
    }
}
