//! The catalogue of byte-level transforms.
//!
//! Each transform works on a copy of its input and returns `None` when it
//! cannot be applied to that buffer (for example, swapping bytes in a buffer
//! shorter than two). An empty `Some` is a valid result.

use crate::mutator::MutationContext;
use rand::Rng;

/// Upper bound on the span spliced in by [`Mutation::InsertRange`].
pub const MAX_INSERT_LEN: usize = 10;

/// Boundary values likely to trip off-by-one and overflow bugs.
pub const INTERESTING_8: [i8; 9] = [-128, -1, 0, 1, 16, 32, 64, 100, 127];
/// Added to [`INTERESTING_8`] for 16-bit replacements.
pub const INTERESTING_16: [i16; 10] = [-32768, -129, 128, 255, 256, 512, 1000, 1024, 4096, 32767];
/// Added to the 8- and 16-bit tables for 32-bit replacements.
pub const INTERESTING_32: [i32; 8] = [
    -2147483648,
    -100663046,
    -32769,
    32768,
    65535,
    65536,
    100663045,
    2147483647,
];

/// Integer width, in bytes, for the arithmetic transforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    One = 1,
    Two = 2,
    Four = 4,
}

impl Width {
    pub fn bytes(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mutation {
    RemoveRange,
    InsertRange,
    DuplicateRange,
    CopyRange,
    FlipBit,
    RandomByte,
    SwapBytes,
    /// Adds or subtracts one, wrapping, in either byte order.
    Increment(Width),
    /// Overwrites with a boundary value, in either byte order.
    Interesting(Width),
    AsciiDigitReplace,
    AsciiNumberReplace,
    /// Splices in a literal from the mutation context.
    InsertLiteral,
}

impl Mutation {
    pub const ALL: [Mutation; 16] = [
        Mutation::RemoveRange,
        Mutation::InsertRange,
        Mutation::DuplicateRange,
        Mutation::CopyRange,
        Mutation::FlipBit,
        Mutation::RandomByte,
        Mutation::SwapBytes,
        Mutation::Increment(Width::One),
        Mutation::Increment(Width::Two),
        Mutation::Increment(Width::Four),
        Mutation::Interesting(Width::One),
        Mutation::Interesting(Width::Two),
        Mutation::Interesting(Width::Four),
        Mutation::AsciiDigitReplace,
        Mutation::AsciiNumberReplace,
        Mutation::InsertLiteral,
    ];

    pub fn apply<R: Rng + ?Sized>(
        self,
        buf: &[u8],
        ctx: &MutationContext,
        rng: &mut R,
    ) -> Option<Vec<u8>> {
        match self {
            Mutation::RemoveRange => remove_range(buf, rng),
            Mutation::InsertRange => Some(insert_range(buf, rng)),
            Mutation::DuplicateRange => duplicate_range(buf, rng),
            Mutation::CopyRange => copy_range(buf, rng),
            Mutation::FlipBit => flip_bit(buf, rng),
            Mutation::RandomByte => random_byte(buf, rng),
            Mutation::SwapBytes => swap_bytes(buf, rng),
            Mutation::Increment(width) => increment(buf, width, rng),
            Mutation::Interesting(width) => interesting(buf, width, rng),
            Mutation::AsciiDigitReplace => ascii_digit_replace(buf, rng),
            Mutation::AsciiNumberReplace => ascii_number_replace(buf, rng),
            Mutation::InsertLiteral => insert_literal(buf, ctx, rng),
        }
    }
}

/// Picks a span length in `[1, max]`, strongly favoring short spans.
pub fn choose_length<R: Rng + ?Sized>(max: usize, rng: &mut R) -> usize {
    let max = max.max(1);
    let upper = match rng.random_range(0..100) {
        0..90 => max.min(8),
        90..99 => max.min(32),
        _ => max,
    };
    rng.random_range(1..=upper)
}

/// An index in `0..len` other than `other`. Requires `len >= 2`.
fn distinct_index<R: Rng + ?Sized>(len: usize, other: usize, rng: &mut R) -> usize {
    let index = rng.random_range(0..len - 1);
    if index >= other { index + 1 } else { index }
}

fn remove_range<R: Rng + ?Sized>(buf: &[u8], rng: &mut R) -> Option<Vec<u8>> {
    if buf.is_empty() {
        return None;
    }
    let start = rng.random_range(0..buf.len());
    let end = start + choose_length(buf.len() - start, rng);
    let mut out = Vec::with_capacity(buf.len() - (end - start));
    out.extend_from_slice(&buf[..start]);
    out.extend_from_slice(&buf[end..]);
    Some(out)
}

fn insert_range<R: Rng + ?Sized>(buf: &[u8], rng: &mut R) -> Vec<u8> {
    let at = rng.random_range(0..=buf.len());
    let mut fill = vec![0u8; choose_length(MAX_INSERT_LEN, rng)];
    rng.fill(&mut fill[..]);
    let mut out = buf.to_vec();
    out.splice(at..at, fill);
    out
}

fn duplicate_range<R: Rng + ?Sized>(buf: &[u8], rng: &mut R) -> Option<Vec<u8>> {
    if buf.len() < 2 {
        return None;
    }
    let src = rng.random_range(0..buf.len());
    let end = src + choose_length(buf.len() - src, rng);
    let at = rng.random_range(0..=buf.len());
    let mut out = buf.to_vec();
    out.splice(at..at, buf[src..end].iter().copied());
    Some(out)
}

fn copy_range<R: Rng + ?Sized>(buf: &[u8], rng: &mut R) -> Option<Vec<u8>> {
    if buf.len() < 2 {
        return None;
    }
    let src = rng.random_range(0..buf.len());
    let dst = distinct_index(buf.len(), src, rng);
    let n = choose_length(buf.len() - src, rng).min(buf.len() - dst);
    let mut out = buf.to_vec();
    out.copy_within(src..src + n, dst);
    Some(out)
}

fn flip_bit<R: Rng + ?Sized>(buf: &[u8], rng: &mut R) -> Option<Vec<u8>> {
    if buf.is_empty() {
        return None;
    }
    let mut out = buf.to_vec();
    let at = rng.random_range(0..out.len());
    out[at] ^= 1 << rng.random_range(0..8);
    Some(out)
}

fn random_byte<R: Rng + ?Sized>(buf: &[u8], rng: &mut R) -> Option<Vec<u8>> {
    if buf.is_empty() {
        return None;
    }
    let mut out = buf.to_vec();
    let at = rng.random_range(0..out.len());
    out[at] ^= rng.random_range(1..=u8::MAX);
    Some(out)
}

fn swap_bytes<R: Rng + ?Sized>(buf: &[u8], rng: &mut R) -> Option<Vec<u8>> {
    if buf.len() < 2 {
        return None;
    }
    let mut out = buf.to_vec();
    let a = rng.random_range(0..out.len());
    let b = distinct_index(out.len(), a, rng);
    out.swap(a, b);
    Some(out)
}

fn increment<R: Rng + ?Sized>(buf: &[u8], width: Width, rng: &mut R) -> Option<Vec<u8>> {
    let n = width.bytes();
    if buf.len() < n {
        return None;
    }
    let at = rng.random_range(0..=buf.len() - n);
    let up = rng.random_bool(0.5);
    let big_endian = rng.random_bool(0.5);
    let mut out = buf.to_vec();
    let field = &mut out[at..at + n];

    let mut value = 0u32;
    for i in 0..n {
        let byte = if big_endian { field[i] } else { field[n - 1 - i] };
        value = (value << 8) | u32::from(byte);
    }
    let mask = if n == 4 { u32::MAX } else { (1u32 << (8 * n)) - 1 };
    let stepped = if up {
        value.wrapping_add(1)
    } else {
        value.wrapping_sub(1)
    };
    value = stepped & mask;
    for i in 0..n {
        let byte = (value >> (8 * (n - 1 - i))) as u8;
        if big_endian {
            field[i] = byte;
        } else {
            field[n - 1 - i] = byte;
        }
    }
    Some(out)
}

fn interesting<R: Rng + ?Sized>(buf: &[u8], width: Width, rng: &mut R) -> Option<Vec<u8>> {
    let n = width.bytes();
    if buf.len() < n {
        return None;
    }
    let table_len = match width {
        Width::One => INTERESTING_8.len(),
        Width::Two => INTERESTING_8.len() + INTERESTING_16.len(),
        Width::Four => INTERESTING_8.len() + INTERESTING_16.len() + INTERESTING_32.len(),
    };
    let mut pick = rng.random_range(0..table_len);
    let value: i32 = if pick < INTERESTING_8.len() {
        i32::from(INTERESTING_8[pick])
    } else {
        pick -= INTERESTING_8.len();
        if pick < INTERESTING_16.len() {
            i32::from(INTERESTING_16[pick])
        } else {
            INTERESTING_32[pick - INTERESTING_16.len()]
        }
    };

    let big_endian = rng.random_bool(0.5);
    let at = rng.random_range(0..=buf.len() - n);
    let mut out = buf.to_vec();
    match (width, big_endian) {
        (Width::One, _) => out[at] = value as u8,
        (Width::Two, true) => out[at..at + 2].copy_from_slice(&(value as i16).to_be_bytes()),
        (Width::Two, false) => out[at..at + 2].copy_from_slice(&(value as i16).to_le_bytes()),
        (Width::Four, true) => out[at..at + 4].copy_from_slice(&value.to_be_bytes()),
        (Width::Four, false) => out[at..at + 4].copy_from_slice(&value.to_le_bytes()),
    }
    Some(out)
}

fn ascii_digit_replace<R: Rng + ?Sized>(buf: &[u8], rng: &mut R) -> Option<Vec<u8>> {
    let digits: Vec<usize> = buf
        .iter()
        .enumerate()
        .filter(|(_, b)| b.is_ascii_digit())
        .map(|(i, _)| i)
        .collect();
    if digits.is_empty() {
        return None;
    }
    let at = digits[rng.random_range(0..digits.len())];
    let current = buf[at] - b'0';
    let mut next = rng.random_range(0..9u8);
    if next >= current {
        next += 1;
    }
    let mut out = buf.to_vec();
    out[at] = b'0' + next;
    Some(out)
}

/// Spans of decimal digits, each optionally led by a `-`.
fn number_runs(buf: &[u8]) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    let mut i = 0;
    while i < buf.len() {
        let start = i;
        if buf[i] == b'-' {
            i += 1;
        }
        let digits_start = i;
        while i < buf.len() && buf[i].is_ascii_digit() {
            i += 1;
        }
        if i > digits_start {
            runs.push((start, i));
        } else {
            i = start + 1;
        }
    }
    runs
}

fn ascii_number_replace<R: Rng + ?Sized>(buf: &[u8], rng: &mut R) -> Option<Vec<u8>> {
    let runs = number_runs(buf);
    if runs.is_empty() {
        return None;
    }
    let (start, end) = runs[rng.random_range(0..runs.len())];

    let max = i64::from(i32::MAX);
    let mut value: i64 = match rng.random_range(0..4) {
        0 => rng.random_range(0..1000),
        1 => rng.random_range(0..max),
        2 => rng.random_range(0..max).pow(2),
        _ => -rng.random_range(0..max),
    };
    if buf[start] == b'-' {
        value = -value;
    }

    let mut out = Vec::with_capacity(buf.len() + 20);
    out.extend_from_slice(&buf[..start]);
    out.extend_from_slice(value.to_string().as_bytes());
    out.extend_from_slice(&buf[end..]);
    Some(out)
}

fn insert_literal<R: Rng + ?Sized>(
    buf: &[u8],
    ctx: &MutationContext,
    rng: &mut R,
) -> Option<Vec<u8>> {
    let literals = ctx.literals();
    if literals.is_empty() {
        return None;
    }
    let literal = &literals[rng.random_range(0..literals.len())];
    let at = rng.random_range(0..=buf.len());
    let mut out = buf.to_vec();
    out.splice(at..at, literal.iter().copied());
    Some(out)
}
