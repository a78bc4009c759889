#![allow(clippy::needless_doctest_main)]
#![doc = include_str!("../README.md")]

pub mod block_diff;
pub mod block_patch;
pub mod codec;
mod config;
mod error;
pub mod format;
pub mod image_diff;
pub mod image_patch;
pub mod package;
mod suffix_array;
pub mod view;

pub use block_diff::{diff, diff_files, diff_into, diff_to_stream, diff_with, BlockDiff, ControlRecord, ScanCursor};
pub use block_patch::{patch, patch_files, patch_to, OldSource, Sink, StreamSource, WriterSink};
pub use codec::{Codec, CodecAdapter, DeflateParams, Lz4Format, Lz4Params, StreamCodec};
pub use config::{DiffConfig, DEFAULT_SIDECAR_THRESHOLD};
pub use error::{PatchError, Result};
pub use format::PatchHeader;
pub use image_diff::{image_diff, image_diff_files, Block, ImageDiff};
pub use image_patch::{apply_image_patch, apply_image_patch_files, apply_image_patch_to, sha256_hex, ImagePatch};
pub use package::{
    Compressor, ContainerFormat, FileInfo, Lz4FileParser, MemberCodec, MemberCodecs, PackageParser, ZipParser,
};
pub use suffix_array::SuffixArray;

pub use block_patch::patch as apply_patch;
