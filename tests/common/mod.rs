#![allow(dead_code)]

use pkgdiff::codec::{compress_to_vec, Codec};
use pkgdiff::DeflateParams;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Deterministic filler with some repetition so compressors have work to do.
pub fn sample(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    (0..len)
        .map(|i| {
            if i % 7 < 3 {
                (i / 7) as u8
            } else {
                state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                (state >> 16) as u8
            }
        })
        .collect()
}

pub fn deflate(data: &[u8], level: i32) -> Vec<u8> {
    let params = DeflateParams {
        level,
        ..DeflateParams::default()
    };
    compress_to_vec(Codec::Deflate(params), data).unwrap()
}

/// Raw deflate made of two stored blocks, something no level of our encoder
/// produces.
pub fn foreign_deflate(data: &[u8]) -> Vec<u8> {
    let (head, tail) = data.split_at(data.len() / 2);
    let mut out = Vec::new();
    for (part, last) in [(head, 0u8), (tail, 1u8)] {
        let len = part.len() as u16;
        out.push(last);
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&(!len).to_le_bytes());
        out.extend_from_slice(part);
    }
    out
}

pub struct ZipEntry {
    pub name: &'static str,
    pub method: u16,
    pub packed: Vec<u8>,
    pub unpacked_len: usize,
}

impl ZipEntry {
    pub fn stored(name: &'static str, data: &[u8]) -> Self {
        Self {
            name,
            method: 0,
            packed: data.to_vec(),
            unpacked_len: data.len(),
        }
    }

    pub fn deflated(name: &'static str, packed: Vec<u8>, unpacked_len: usize) -> Self {
        Self {
            name,
            method: 8,
            packed,
            unpacked_len,
        }
    }
}

/// Writes a minimal zip archive: local headers, central directory, end record.
pub fn build_zip(entries: &[ZipEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut central = Vec::new();
    for entry in entries {
        let offset = out.len() as u32;
        let name = entry.name.as_bytes();

        out.extend_from_slice(&0x0403_4b50u32.to_le_bytes());
        out.extend_from_slice(&20u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&entry.method.to_le_bytes());
        out.extend_from_slice(&[0; 8]);
        out.extend_from_slice(&(entry.packed.len() as u32).to_le_bytes());
        out.extend_from_slice(&(entry.unpacked_len as u32).to_le_bytes());
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(name);
        out.extend_from_slice(&entry.packed);

        central.extend_from_slice(&0x0201_4b50u32.to_le_bytes());
        central.extend_from_slice(&20u16.to_le_bytes());
        central.extend_from_slice(&20u16.to_le_bytes());
        central.extend_from_slice(&0u16.to_le_bytes());
        central.extend_from_slice(&entry.method.to_le_bytes());
        central.extend_from_slice(&[0; 8]);
        central.extend_from_slice(&(entry.packed.len() as u32).to_le_bytes());
        central.extend_from_slice(&(entry.unpacked_len as u32).to_le_bytes());
        central.extend_from_slice(&(name.len() as u16).to_le_bytes());
        central.extend_from_slice(&[0; 12]);
        central.extend_from_slice(&offset.to_le_bytes());
        central.extend_from_slice(name);
    }
    let cd_offset = out.len() as u32;
    out.extend_from_slice(&central);
    out.extend_from_slice(&0x0605_4b50u32.to_le_bytes());
    out.extend_from_slice(&[0; 4]);
    out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    out.extend_from_slice(&(central.len() as u32).to_le_bytes());
    out.extend_from_slice(&cd_offset.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out
}
