//! Byte-level transformations applied to raw attribute bytes before
//! decoding (`process:` in a schema).
//!
//! Supported algorithms: zlib inflate, repeating-key XOR, grouped bit
//! rotations (`rol`/`ror`), and byte swapping within fixed-size groups
//! (`bswap2/4/8/16`). Anything else is recognized syntactically and fails
//! at runtime with `NotImplemented`.
//!
//! All functions return fresh buffers; inputs are never mutated.

use crate::errors::{Error, Result};
use flate2::read::ZlibDecoder;
use std::io::Read;

/// Process algorithm selector, parsed from the schema's `process:` key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessAlgo {
    Zlib,
    Xor,
    Rol,
    Ror,
    Bswap(u32),
    /// Recognized shape, unknown algorithm; fails at apply time.
    Other(String),
}

impl ProcessAlgo {
    pub fn from_name(name: &str) -> ProcessAlgo {
        match name {
            "zlib" => ProcessAlgo::Zlib,
            "xor" => ProcessAlgo::Xor,
            "rol" => ProcessAlgo::Rol,
            "ror" => ProcessAlgo::Ror,
            "bswap2" => ProcessAlgo::Bswap(2),
            "bswap4" => ProcessAlgo::Bswap(4),
            "bswap8" => ProcessAlgo::Bswap(8),
            "bswap16" => ProcessAlgo::Bswap(16),
            other => ProcessAlgo::Other(other.to_string()),
        }
    }
}

/// RFC 1950/1951 inflate.
pub fn inflate_zlib(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| Error::parse(format!("zlib inflate failed: {e}")))?;
    Ok(out)
}

/// `out[i] = in[i] ^ key[i % key.len()]`.
pub fn xor(data: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    if key.is_empty() {
        return Err(Error::parse("xor process requires a non-empty key"));
    }
    Ok(data
        .iter()
        .enumerate()
        .map(|(i, b)| b ^ key[i % key.len()])
        .collect())
}

/// Rotates each `group`-byte unit left by `amount` bits.
///
/// Bits are numbered MSB-first across the group, so a group is treated as
/// one big-endian integer of `group * 8` bits. `amount` is reduced modulo
/// the group width. The input length must be a multiple of `group`.
pub fn rotate_left(data: &[u8], amount: u64, group: usize) -> Result<Vec<u8>> {
    if group == 0 {
        return Err(Error::parse("rol/ror group must be at least 1"));
    }
    if data.len() % group != 0 {
        return Err(Error::parse(format!(
            "rol/ror input length {} is not a multiple of group size {group}",
            data.len()
        )));
    }
    let width = group as u64 * 8;
    let k = (amount % width) as usize;
    let (k_bytes, k_bits) = (k / 8, k % 8);
    let mut out = vec![0u8; data.len()];
    for (g, chunk) in data.chunks(group).enumerate() {
        let base = g * group;
        for i in 0..group {
            let hi = chunk[(i + k_bytes) % group];
            out[base + i] = if k_bits == 0 {
                hi
            } else {
                let lo = chunk[(i + k_bytes + 1) % group];
                (hi << k_bits) | (lo >> (8 - k_bits))
            };
        }
    }
    Ok(out)
}

/// Mirror of [`rotate_left`].
pub fn rotate_right(data: &[u8], amount: u64, group: usize) -> Result<Vec<u8>> {
    if group == 0 {
        return Err(Error::parse("rol/ror group must be at least 1"));
    }
    let width = group as u64 * 8;
    rotate_left(data, (width - amount % width) % width, group)
}

/// Reverses bytes within each `n`-byte group.
pub fn bswap(data: &[u8], n: usize) -> Result<Vec<u8>> {
    if data.len() % n != 0 {
        return Err(Error::parse(format!(
            "bswap{n} input length {} is not a multiple of {n}",
            data.len()
        )));
    }
    let mut out = Vec::with_capacity(data.len());
    for chunk in data.chunks(n) {
        out.extend(chunk.iter().rev());
    }
    Ok(out)
}
