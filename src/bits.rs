//! Bit tricks over a 64 bits mask where a set bit is a free slot.
//!
//! Bit `i` of a mask describes slot `i`; "low" means slot 0, "high"
//! means slot 63.

/// Mask with bits `offset..offset + len` set
#[inline]
pub fn run_mask(offset: usize, len: usize) -> u64 {
    debug_assert!(offset + len <= 64, "run {}+{} out of bounds", offset, len);

    if len == 0 {
        return 0;
    }
    (!0u64 >> (64 - len)) << offset
}

/// Returns a mask where bit `i` is set if and only if bits `i..i + len`
/// are all set in `mask`
#[inline]
fn run_starts(mask: u64, len: usize) -> u64 {
    let mut starts = mask;
    let mut have = 1;

    // `starts` holds the starting bits of runs of at least `have` ones.
    // Combining it with itself shifted by `step <= have` extends those
    // runs by `step`.
    while have < len {
        let step = have.min(len - have);
        starts &= starts >> step;
        have += step;
    }

    starts
}

/// Offset of the lowest run of `len` set bits
#[inline]
pub fn find_run_low(mask: u64, len: usize) -> Option<usize> {
    if len == 0 || len > 64 {
        return None;
    }

    match run_starts(mask, len) {
        0 => None,
        starts => Some(starts.trailing_zeros() as usize),
    }
}

/// Offset of the highest run of `len` set bits
#[inline]
pub fn find_run_high(mask: u64, len: usize) -> Option<usize> {
    if len == 0 || len > 64 {
        return None;
    }

    match run_starts(mask, len) {
        0 => None,
        starts => Some(63 - starts.leading_zeros() as usize),
    }
}

/// Length of the longest run of set bits
#[inline]
pub fn longest_run(mut mask: u64) -> usize {
    let mut len = 0;

    while mask != 0 {
        mask &= mask >> 1;
        len += 1;
    }

    len
}

/// Number of bits from `offset` (included) to the first set bit of
/// `mask` at or above `offset`.
///
/// Used on the boundary mask: the result is the length, in slots, of
/// the allocation starting at `offset`.
#[inline]
pub fn run_length_to_boundary(mask: u64, offset: usize) -> Option<usize> {
    if offset >= 64 {
        return None;
    }

    match mask >> offset {
        0 => None,
        shifted => Some(shifted.trailing_zeros() as usize + 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks() {
        assert_eq!(run_mask(0, 0), 0);
        assert_eq!(run_mask(0, 1), 1);
        assert_eq!(run_mask(3, 2), 0b11000);
        assert_eq!(run_mask(0, 64), !0);
        assert_eq!(run_mask(63, 1), 1 << 63);
        assert_eq!(run_mask(32, 32), 0xFFFF_FFFF_0000_0000);
    }

    #[test]
    fn low_runs() {
        assert_eq!(find_run_low(!0, 1), Some(0));
        assert_eq!(find_run_low(!0, 64), Some(0));
        assert_eq!(find_run_low(0, 1), None);
        assert_eq!(find_run_low(0b1011_0110, 2), Some(1));
        assert_eq!(find_run_low(0b1011_0110, 3), None);
        assert_eq!(find_run_low(0b1111_0110, 3), Some(4));
        assert_eq!(find_run_low(1 << 63, 1), Some(63));
        assert_eq!(find_run_low(1 << 63, 2), None);
        assert_eq!(find_run_low(!1, 63), Some(1));
        assert_eq!(find_run_low(!1, 64), None);
        assert_eq!(find_run_low(!0, 0), None);
        assert_eq!(find_run_low(!0, 65), None);
    }

    #[test]
    fn high_runs() {
        assert_eq!(find_run_high(!0, 1), Some(63));
        assert_eq!(find_run_high(!0, 4), Some(60));
        assert_eq!(find_run_high(!0, 64), Some(0));
        assert_eq!(find_run_high(0b1011_0110, 2), Some(4));
        assert_eq!(find_run_high(0b0000_0111, 3), Some(0));
        assert_eq!(find_run_high(!(1 << 63), 63), Some(0));
        assert_eq!(find_run_high(!(1 << 63), 2), Some(61));
        assert_eq!(find_run_high(0, 1), None);
    }

    #[test]
    fn runs_agree_with_naive_scan() {
        fn naive(mask: u64, len: usize) -> Vec<usize> {
            (0..=64 - len)
                .filter(|&off| (mask >> off) & (!0u64 >> (64 - len)) == !0u64 >> (64 - len))
                .collect()
        }

        let mut state = 0x9E37_79B9_7F4A_7C15u64;
        for _ in 0..500 {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let mask = state | (state >> 3);

            for len in 1..=64 {
                let starts = naive(mask, len);
                assert_eq!(find_run_low(mask, len), starts.first().copied(), "{:064b} {}", mask, len);
                assert_eq!(find_run_high(mask, len), starts.last().copied(), "{:064b} {}", mask, len);
            }
        }
    }

    #[test]
    fn longest() {
        assert_eq!(longest_run(0), 0);
        assert_eq!(longest_run(!0), 64);
        assert_eq!(longest_run(0b1011_0111), 3);
        assert_eq!(longest_run(1 << 63), 1);
        assert_eq!(longest_run(!0 << 1), 63);
        assert_eq!(longest_run(0xF0F0_FFFF_0000_00FF), 16);
    }

    #[test]
    fn boundary_lengths() {
        let boundary = (1 << 3) | (1 << 10) | (1 << 63);

        assert_eq!(run_length_to_boundary(boundary, 0), Some(4));
        assert_eq!(run_length_to_boundary(boundary, 3), Some(1));
        assert_eq!(run_length_to_boundary(boundary, 4), Some(7));
        assert_eq!(run_length_to_boundary(boundary, 11), Some(53));
        assert_eq!(run_length_to_boundary(boundary, 63), Some(1));
        assert_eq!(run_length_to_boundary(0, 0), None);
        assert_eq!(run_length_to_boundary(1, 1), None);
        assert_eq!(run_length_to_boundary(!0, 64), None);
    }
}
