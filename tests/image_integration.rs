mod common;

use pkgdiff::codec::compress_to_vec;
use pkgdiff::image_diff::{BLOCK_DEFLATE, BLOCK_LZ4, BLOCK_NORMAL, BLOCK_RAW};
use pkgdiff::image_patch::PatchBlock;
use pkgdiff::{
    apply_image_patch, image_diff, sha256_hex, Block, Codec, DiffConfig, ImageDiff, ImagePatch,
    Lz4Format, Lz4Params, PatchError,
};

use common::{build_zip, deflate, foreign_deflate, init_logger, sample, ZipEntry};

fn round_trip(old: &[u8], new: &[u8], config: &DiffConfig) -> Vec<u8> {
    let patch = image_diff(old, new, config).unwrap();
    let restored = apply_image_patch(old, &patch, &sha256_hex(new)).unwrap();
    assert_eq!(restored, new);
    patch
}

fn tags(diff: &ImageDiff<'_>) -> Vec<u32> {
    diff.blocks().iter().map(Block::tag).collect()
}

#[test]
fn plain_image_is_split_into_chunks() {
    init_logger();
    let old = sample(1000, 1);
    let mut new = sample(3000, 1);
    new[1500] ^= 0xff;
    let config = DiffConfig::default().with_limit(1200);

    let diff = ImageDiff::new(&old, &new, &config).unwrap();
    assert_eq!(tags(&diff), vec![BLOCK_NORMAL; 3]);

    let patch = round_trip(&old, &new, &config);
    let parsed = ImagePatch::parse(&patch, old.len()).unwrap();
    assert_eq!(parsed.blocks().len(), 3);
}

#[test]
fn plain_image_below_limit_is_one_block() {
    let old = sample(800, 2);
    let new = sample(900, 3);
    let config = DiffConfig::default().with_limit(1200);
    let diff = ImageDiff::new(&old, &new, &config).unwrap();
    assert_eq!(tags(&diff), vec![BLOCK_NORMAL]);
    round_trip(&old, &new, &config);
}

#[test]
fn zip_deflate_members_are_recompressed_exactly() {
    init_logger();
    let old_a = sample(30_000, 10);
    let mut new_a = old_a.clone();
    new_a[12_345..12_400].fill(b'z');
    let readme = b"unchanged readme contents".to_vec();

    let old = build_zip(&[
        ZipEntry::deflated("lib/a.so", deflate(&old_a, 6), old_a.len()),
        ZipEntry::stored("README", &readme),
    ]);
    let new = build_zip(&[
        ZipEntry::deflated("lib/a.so", deflate(&new_a, 6), new_a.len()),
        ZipEntry::stored("README", &readme),
    ]);

    let config = DiffConfig::default();
    let diff = ImageDiff::new(&old, &new, &config).unwrap();
    assert_eq!(
        tags(&diff),
        vec![BLOCK_RAW, BLOCK_DEFLATE, BLOCK_RAW, BLOCK_NORMAL, BLOCK_RAW]
    );
    match &diff.blocks()[1] {
        Block::Deflate { member, params, .. } => {
            assert_eq!(member.new, new_a);
            assert_eq!(member.old, old_a);
            assert_eq!(params.method, 8);
            assert_eq!(params.window_bits, -15);
        }
        other => panic!("unexpected block {other:?}"),
    }

    let patch = round_trip(&old, &new, &config);
    let parsed = ImagePatch::parse(&patch, old.len()).unwrap();
    assert!(matches!(parsed.blocks()[1], PatchBlock::Deflate { new_len, .. } if new_len == new_a.len()));
}

#[test]
fn foreign_deflate_stream_falls_back_to_whole_image() {
    init_logger();
    let old_a = sample(6000, 20);
    let mut new_a = old_a.clone();
    new_a[100] = 1;

    let old = build_zip(&[ZipEntry::deflated("a.bin", deflate(&old_a, 6), old_a.len())]);
    let new = build_zip(&[ZipEntry::deflated("a.bin", foreign_deflate(&new_a), new_a.len())]);

    let config = DiffConfig::default();
    let diff = ImageDiff::new(&old, &new, &config).unwrap();
    assert_eq!(tags(&diff), vec![BLOCK_NORMAL]);
    assert_eq!(diff.blocks()[0].new_span().len, new.len());
    round_trip(&old, &new, &config);
}

#[test]
fn added_and_removed_members() {
    let kept = sample(4000, 30);
    let gone = sample(2000, 31);
    let added = sample(3000, 32);

    let old = build_zip(&[
        ZipEntry::stored("kept", &kept),
        ZipEntry::deflated("gone", deflate(&gone, 6), gone.len()),
    ]);
    let new = build_zip(&[
        ZipEntry::stored("kept", &kept),
        ZipEntry::deflated("added", deflate(&added, 6), added.len()),
    ]);

    let config = DiffConfig::default();
    let diff = ImageDiff::new(&old, &new, &config).unwrap();
    // header, kept data, whole added member, central directory
    assert_eq!(tags(&diff), vec![BLOCK_RAW, BLOCK_NORMAL, BLOCK_RAW, BLOCK_RAW]);
    round_trip(&old, &new, &config);
}

#[test]
fn large_zip_is_split_instead_of_parsed() {
    let payload = sample(5000, 40);
    let old = build_zip(&[ZipEntry::stored("x", &payload)]);
    let mut changed = payload.clone();
    changed[10] = 0;
    let new = build_zip(&[ZipEntry::stored("x", &changed)]);

    let config = DiffConfig::default().with_limit(2000);
    let diff = ImageDiff::new(&old, &new, &config).unwrap();
    assert_eq!(diff.blocks().len(), new.len() / 2000 + 1);
    assert!(diff.blocks().iter().all(|b| b.tag() == BLOCK_NORMAL));
    round_trip(&old, &new, &config);
}

#[test]
fn lz4_frame_settings_are_recovered() {
    init_logger();
    let params = Lz4Params {
        block_size_id: 5,
        block_independence: 0,
        ..Lz4Params::default()
    };
    let old_payload = sample(400_000, 50);
    let mut new_payload = old_payload.clone();
    new_payload[300_000..300_010].copy_from_slice(b"0123456789");

    let old = compress_to_vec(Codec::Lz4(params), &old_payload).unwrap();
    let new = compress_to_vec(Codec::Lz4(params), &new_payload).unwrap();

    let config = DiffConfig::default();
    let diff = ImageDiff::new(&old, &new, &config).unwrap();
    assert_eq!(tags(&diff), vec![BLOCK_LZ4]);
    match &diff.blocks()[0] {
        Block::Lz4 { params: found, .. } => {
            assert_eq!(found.block_size_id, 5);
            assert_eq!(found.block_independence, 0);
            assert_eq!(found.content_checksum, 0);
        }
        other => panic!("unexpected block {other:?}"),
    }
    round_trip(&old, &new, &config);
}

#[test]
fn lz4_legacy_stream_round_trips_as_one_member() {
    init_logger();
    let params = Lz4Params {
        format: Lz4Format::Block,
        ..Lz4Params::default()
    };
    let old_payload = sample(200_000, 55);
    let mut new_payload = old_payload.clone();
    new_payload[150_000..150_004].copy_from_slice(b"edit");
    new_payload.extend_from_slice(&sample(1000, 56));

    let old = compress_to_vec(Codec::Lz4(params), &old_payload).unwrap();
    let new = compress_to_vec(Codec::Lz4(params), &new_payload).unwrap();

    let config = DiffConfig::default();
    let diff = ImageDiff::new(&old, &new, &config).unwrap();
    assert_eq!(tags(&diff), vec![BLOCK_LZ4]);
    match &diff.blocks()[0] {
        Block::Lz4 { params: found, member, .. } => {
            assert_eq!(found.format, Lz4Format::Block);
            assert_eq!(member.new, new_payload);
        }
        other => panic!("unexpected block {other:?}"),
    }

    let patch = round_trip(&old, &new, &config);
    let parsed = ImagePatch::parse(&patch, old.len()).unwrap();
    assert!(matches!(
        parsed.blocks()[0],
        PatchBlock::Lz4 { params, .. } if params.format == Lz4Format::Block
    ));
}

#[test]
fn wrong_digest_yields_nothing() {
    let old = sample(2000, 60);
    let new = sample(2100, 61);
    let patch = image_diff(&old, &new, &DiffConfig::default()).unwrap();

    let err = apply_image_patch(&old, &patch, &sha256_hex(&old)).unwrap_err();
    assert!(matches!(err, PatchError::Integrity { .. }));
    assert_eq!(err.code(), -6);

    let upper = sha256_hex(&new).to_uppercase();
    assert_eq!(apply_image_patch(&old, &patch, &upper).unwrap(), new);
}

#[test]
fn patch_against_shorter_old_image_is_rejected() {
    let old = sample(2000, 70);
    let new = sample(2000, 71);
    let patch = image_diff(&old, &new, &DiffConfig::default()).unwrap();
    let err = apply_image_patch(&old[..1000], &patch, &sha256_hex(&new)).unwrap_err();
    assert!(matches!(err, PatchError::InvalidPatch(_)));
}
