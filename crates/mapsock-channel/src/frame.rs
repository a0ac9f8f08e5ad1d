//! Frame layout constants and the padding law.
//!
//! Every frame is a native-endian `u32` length header followed by the
//! payload, padded so that header plus padded payload is a whole number
//! of cache lines. The first frame of a region starts at offset zero,
//! so the payload of a minimal frame occupies the rest of that line
//! plus an optional tail.

/// Size of a region file and its mapping, in bytes.
pub const REGION_SIZE: usize = 1 << 22;

/// Alignment unit for frame slots.
pub const CACHE_LINE: usize = 64;

/// Bytes taken by the length header of a frame.
pub const HEADER_SIZE: usize = 4;

/// Padded payload span for a payload of `len` bytes.
///
/// `HEADER_SIZE + padded_len(len)` is always a multiple of
/// [`CACHE_LINE`], so consecutive headers land on line boundaries.
pub fn padded_len(len: usize) -> usize {
    if len <= CACHE_LINE - HEADER_SIZE {
        CACHE_LINE - HEADER_SIZE
    } else if len <= 2 * CACHE_LINE - HEADER_SIZE {
        2 * CACHE_LINE - HEADER_SIZE
    } else {
        let over = (len - (CACHE_LINE - HEADER_SIZE)) % CACHE_LINE;
        len + (CACHE_LINE - over) % CACHE_LINE
    }
}

/// Pad bytes following a payload of `len` bytes.
pub fn padding_after(len: usize) -> usize {
    padded_len(len) - len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_payloads_fill_one_line() {
        assert_eq!(padded_len(0), 60);
        assert_eq!(padded_len(1), 60);
        assert_eq!(padded_len(60), 60);
    }

    #[test]
    fn medium_payloads_fill_two_lines() {
        assert_eq!(padded_len(61), 124);
        assert_eq!(padded_len(100), 124);
        assert_eq!(padded_len(124), 124);
    }

    #[test]
    fn larger_payloads_round_up_to_line_boundaries() {
        assert_eq!(padded_len(125), 188);
        assert_eq!(padded_len(188), 188);
        assert_eq!(padded_len(189), 252);
    }

    #[test]
    fn header_plus_padded_payload_is_line_aligned() {
        for len in 0..=4096 {
            let slot = HEADER_SIZE + padded_len(len);
            assert_eq!(slot % CACHE_LINE, 0, "len {len} gave slot {slot}");
            assert!(padded_len(len) >= len);
        }
    }

    #[test]
    fn padding_after_is_consistent() {
        for len in [0, 1, 60, 61, 124, 125, 1000] {
            assert_eq!(len + padding_after(len), padded_len(len));
        }
    }
}
