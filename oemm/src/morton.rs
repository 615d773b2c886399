//! Morton (Z-order) keys for integer grid coordinates
//!
//! Deduplication trees are keyed by a single interleaved value so that
//! vertices sharing a grid point compare equal regardless of which triangle
//! produced them.  Coordinates up to 32 bits wide are supported; each
//! coordinate byte is dilated into 24 bits and the three dilated words are
//! interleaved, so a full triple fits in a `u128` with room to spare.

/// Spreads the 8 bits of `b` so that two zero bits separate each of them.
///
/// Bit `n` of the input ends up at bit `3 * n` of the output.
const fn dilate(b: u8) -> u32 {
    let b = b as u32;
    let b = ((b & 0xf0) << 8) | (b & 0x0f);
    let b = ((b & 0x0000_c00c) << 4) | (b & 0x0000_3003);
    ((b & 0x0008_2082) << 2) | (b & 0x0004_1041)
}

/// Inverse of [`dilate`]: collects bits `0, 3, 6, ...` of `w` into a byte
const fn contract(w: u32) -> u8 {
    let w = w & 0x0024_9249;
    let w = ((w >> 2) & 0x0008_2082) | (w & 0x0004_1041);
    let w = ((w >> 4) & 0x0000_c00c) | (w & 0x0000_3003);
    (((w >> 8) & 0xf0) | (w & 0x0f)) as u8
}

/// Interleaves three grid coordinates into a single Morton key
///
/// Bit `n` of `i`, `j`, `k` lands at bit `3n`, `3n + 1`, `3n + 2` of the key
/// respectively, so keys sort in Z-order.
pub fn encode(i: u32, j: u32, k: u32) -> u128 {
    let mut key = 0u128;
    let mut b = 0;
    while b < 4 {
        let w = dilate((i >> (8 * b)) as u8)
            | dilate((j >> (8 * b)) as u8) << 1
            | dilate((k >> (8 * b)) as u8) << 2;
        key |= (w as u128) << (24 * b);
        b += 1;
    }
    key
}

/// Recovers the three grid coordinates from a Morton key
pub fn decode(key: u128) -> [u32; 3] {
    let mut out = [0u32; 3];
    let mut b = 0;
    while b < 4 {
        let w = (key >> (24 * b)) as u32 & 0x00ff_ffff;
        out[0] |= (contract(w) as u32) << (8 * b);
        out[1] |= (contract(w >> 1) as u32) << (8 * b);
        out[2] |= (contract(w >> 2) as u32) << (8 * b);
        b += 1;
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dilate_contract_roundtrip() {
        for b in 0..=u8::MAX {
            let w = dilate(b);
            // no dilated bit may leave its 24-bit lane
            assert_eq!(w & !0x00ff_ffff, 0);
            assert_eq!(contract(w), b);
        }
    }

    #[test]
    fn encode_low_bits() {
        assert_eq!(encode(0, 0, 0), 0);
        assert_eq!(encode(1, 0, 0), 0b001);
        assert_eq!(encode(0, 1, 0), 0b010);
        assert_eq!(encode(0, 0, 1), 0b100);
        assert_eq!(encode(0b11, 0, 0), 0b001001);
        assert_eq!(encode(0, 0, 0b10), 0b100000);
    }

    #[test]
    fn encode_decode_roundtrip() {
        use rand::prelude::*;
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..10_000 {
            let i = rng.r#gen::<u32>() & ((1 << 30) - 1);
            let j = rng.r#gen::<u32>() & ((1 << 30) - 1);
            let k = rng.r#gen::<u32>() & ((1 << 30) - 1);
            assert_eq!(decode(encode(i, j, k)), [i, j, k]);
        }
    }

    #[test]
    fn keys_sort_in_z_order() {
        // within one octant, all keys are below those of the next octant
        let half = 1u32 << 29;
        let a = encode(half - 1, half - 1, half - 1);
        let b = encode(half, 0, 0);
        assert!(a < b);
    }
}
