/// Round `value` up to the next multiple of `align` (`align` > 0).
#[inline]
pub fn round_up(value: usize, align: usize) -> usize {
    debug_assert!(align > 0);
    value.div_ceil(align) * align
}

#[inline]
pub fn round_up_u64(value: u64, align: u64) -> u64 {
    debug_assert!(align > 0);
    value.div_ceil(align) * align
}

#[inline]
pub fn round_down_u64(value: u64, align: u64) -> u64 {
    debug_assert!(align > 0);
    value - value % align
}

/// Offset of the first non-zero byte, if any.
#[inline]
pub fn first_non_zero(bytes: &[u8]) -> Option<usize> {
    bytes.iter().position(|&b| b != 0)
}

pub fn fmt_bytes(b: &[u8]) -> String {
    if b.iter().all(|&c| c.is_ascii_graphic() || c == b' ') {
        format!("b\"{}\"", String::from_utf8_lossy(b))
    } else {
        format!("0x{}", hex::encode(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding_helpers() {
        assert_eq!(round_up(0, 512), 0);
        assert_eq!(round_up(1, 512), 512);
        assert_eq!(round_up(512, 512), 512);
        assert_eq!(round_up_u64(513, 512), 1024);
        assert_eq!(round_down_u64(1023, 512), 512);
    }

    #[test]
    fn fmt_bytes_prefers_ascii() {
        assert_eq!(fmt_bytes(b"DBDN"), "b\"DBDN\"");
        assert_eq!(fmt_bytes(&[0, 1]), "0x0001");
    }
}
