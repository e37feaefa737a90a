//! Test data generators.
//!
//! Sizes are expressed against the cache block size, since residency is
//! tracked per block and most off-by-one bugs live at block edges.

use rand::Rng;

use crate::config::IO_BLOCK_SIZE;

/// Cache block size (16 KiB).
#[allow(clippy::cast_possible_truncation)]
pub const BLOCK_SIZE: usize = IO_BLOCK_SIZE as usize;

/// Generate random bytes of specified size.
pub fn random_bytes(size: usize) -> Vec<u8> {
    let mut rng = rand::rng();
    (0..size).map(|_| rng.random()).collect()
}

/// Deterministic content where every byte depends on its offset.
///
/// The period (251) is prime, so shifted reads never line up with a block
/// and a misplaced range shows up as a mismatch.
#[allow(clippy::cast_possible_truncation)]
pub fn patterned_bytes(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

/// Exactly one block.
pub fn one_block_content() -> Vec<u8> {
    random_bytes(BLOCK_SIZE)
}

/// One byte short of a block.
pub fn block_minus_one() -> Vec<u8> {
    random_bytes(BLOCK_SIZE - 1)
}

/// One byte into a second block.
pub fn block_plus_one() -> Vec<u8> {
    random_bytes(BLOCK_SIZE + 1)
}

/// Exactly `blocks` blocks.
pub fn multi_block_content(blocks: usize) -> Vec<u8> {
    random_bytes(blocks * BLOCK_SIZE)
}
