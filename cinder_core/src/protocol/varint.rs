//! Unsigned LEB128 varints used for frame length prefixes.

/// The most bytes a `u64` can occupy once encoded.
pub const MAX_ENCODED_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarintError {
    /// The buffer ended before the terminating byte.
    Incomplete,
    /// More continuation bytes than a `u64` can hold.
    Overflow,
}

/// Returns the number of bytes needed to encode a value.
#[inline]
pub fn encoded_len(value: u64) -> usize {
    if value == 0 {
        return 1;
    }
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(7)
}

/// Appends the encoding of `value` to `out`.
#[inline]
pub fn encode(mut value: u64, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Decodes a varint from the start of `buf`.
/// Returns (decoded_value, bytes_consumed).
pub fn decode(buf: &[u8]) -> Result<(u64, usize), VarintError> {
    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().enumerate() {
        if i >= MAX_ENCODED_LEN {
            return Err(VarintError::Overflow);
        }
        let shift = 7 * i as u32;
        let bits = u64::from(byte & 0x7F);
        if shift == 63 && bits > 1 {
            return Err(VarintError::Overflow);
        }
        value |= bits << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    if buf.len() >= MAX_ENCODED_LEN {
        Err(VarintError::Overflow)
    } else {
        Err(VarintError::Incomplete)
    }
}
