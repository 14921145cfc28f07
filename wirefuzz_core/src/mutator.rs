use crate::input::Testcase;

/// Flips bit `bit` of `data`. Bit 0 is the most significant bit of byte 0.
///
/// # Panics
/// Panics if `bit >= data.len() * 8`.
#[inline]
pub fn flip_bit(data: &mut [u8], bit: usize) {
    data[bit >> 3] ^= 128 >> (bit & 7);
}

/// Produces walking single-bit flips of `seed`.
///
/// Output `i` is `seed` with bit `offset + i` flipped and nothing else changed.
/// Positions past the end of the seed are not generated, so fewer than `count`
/// testcases are returned when `offset + count` exceeds `seed.len() * 8`.
///
/// # Arguments
/// * `seed`: The buffer to mutate. It is never modified.
/// * `offset`: The first bit position to flip.
/// * `count`: How many consecutive bit positions to flip.
pub fn flip_bits(seed: &[u8], offset: usize, count: usize) -> Vec<Testcase> {
    let total_bits = seed.len() * 8;
    let end = offset.saturating_add(count).min(total_bits);
    if offset >= end {
        return Vec::new();
    }

    // One scratch copy is flipped, cloned out and flipped back for every position.
    let mut scratch = seed.to_vec();
    let mut cases = Vec::with_capacity(end - offset);
    for bit in offset..end {
        flip_bit(&mut scratch, bit);
        cases.push(Testcase::new(scratch.clone()));
        flip_bit(&mut scratch, bit);
    }
    cases
}
