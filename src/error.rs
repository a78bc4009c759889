use std::io;

/// Errors produced while building or applying block and image patches.
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    /// A caller-supplied buffer, span or argument is unusable.
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    /// The patch is malformed: bad magic, sizes that do not fit the physical
    /// patch, or control records that would read or write out of bounds.
    #[error("invalid patch: {0}")]
    InvalidPatch(String),

    /// A container member is larger than the configured diff limit.
    #[error("member {name} exceeds diff limit ({size} >= {limit})")]
    ExceedLimit {
        /// Member identity inside the container.
        name: String,
        /// Unpacked size of the member.
        size: usize,
        /// Configured limit.
        limit: usize,
    },

    /// A compression or decompression engine failed.
    #[error("{codec} codec failure: {source}")]
    Codec {
        /// Name of the codec that failed.
        codec: &'static str,
        /// Underlying engine error.
        #[source]
        source: io::Error,
    },

    /// The reconstructed output does not hash to the expected digest.
    #[error("integrity check failed: expected {expected}, got {actual}")]
    Integrity {
        /// Expected SHA-256 digest (hex).
        expected: String,
        /// Digest of the produced output (hex).
        actual: String,
    },

    /// I/O error on a file, mapping or sink.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, PatchError>;

impl PatchError {
    pub(crate) fn codec(codec: &'static str, source: io::Error) -> Self {
        Self::Codec { codec, source }
    }

    pub(crate) fn invalid_patch(msg: impl Into<String>) -> Self {
        Self::InvalidPatch(msg.into())
    }

    pub(crate) fn invalid_param(msg: impl Into<String>) -> Self {
        Self::InvalidParam(msg.into())
    }

    /// Negative status code for callers that report plain integers.
    pub fn code(&self) -> i32 {
        match self {
            Self::Io(_) => -1,
            Self::InvalidParam(_) => -2,
            Self::InvalidPatch(_) => -3,
            Self::ExceedLimit { .. } => -4,
            Self::Codec { .. } => -5,
            Self::Integrity { .. } => -6,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_negative_and_distinct() {
        let errors = [
            PatchError::Io(io::ErrorKind::Other.into()),
            PatchError::invalid_param("x"),
            PatchError::invalid_patch("x"),
            PatchError::ExceedLimit {
                name: "a".into(),
                size: 2,
                limit: 1,
            },
            PatchError::codec("bzip2", io::ErrorKind::InvalidData.into()),
            PatchError::Integrity {
                expected: "00".into(),
                actual: "11".into(),
            },
        ];
        let mut codes: Vec<i32> = errors.iter().map(PatchError::code).collect();
        assert!(codes.iter().all(|c| *c < 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn display_names_the_codec() {
        let err = PatchError::codec("brotli", io::Error::new(io::ErrorKind::Other, "boom"));
        assert_eq!(err.to_string(), "brotli codec failure: boom");
    }
}
