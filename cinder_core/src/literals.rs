//! Literals used to seed the mutation context before fuzzing starts.

use anyhow::Context;
use std::collections::BTreeSet;
use std::path::Path;

/// Shortest printable run kept as a literal.
pub const MIN_LITERAL_LEN: usize = 4;
/// Longer runs are almost always prose or tables, not tokens.
pub const MAX_LITERAL_LEN: usize = 64;
/// Cap on how many literals a single extraction returns.
pub const MAX_LITERALS: usize = 4096;

/// Collects printable ASCII runs from the bytes produced by `load` (usually
/// the target executable), the way `strings(1)` does.
pub fn detect_all<F>(load: F) -> anyhow::Result<BTreeSet<String>>
where
    F: FnOnce() -> std::io::Result<Vec<u8>>,
{
    let bytes = load().context("failed to load literal source")?;
    Ok(detect(&bytes))
}

/// Printable ASCII runs of `MIN_LITERAL_LEN..=MAX_LITERAL_LEN` bytes.
pub fn detect(bytes: &[u8]) -> BTreeSet<String> {
    let mut literals = BTreeSet::new();
    let printable = |b: &u8| b.is_ascii_graphic() || *b == b' ';
    for run in bytes.split(|b| !printable(b)) {
        if literals.len() >= MAX_LITERALS {
            break;
        }
        if (MIN_LITERAL_LEN..=MAX_LITERAL_LEN).contains(&run.len()) {
            // Runs are ASCII by construction.
            literals.insert(String::from_utf8_lossy(run).into_owned());
        }
    }
    literals
}

/// Reads an AFL-style dictionary: one `"value"` or `name="value"` per line,
/// `#` comments, with `\\`, `\"` and `\xNN` escapes.
///
/// Literals are text, so entries that decode to invalid UTF-8 are skipped
/// with a warning.
pub fn load_dictionary(path: &Path) -> anyhow::Result<Vec<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read dictionary {path:?}"))?;
    let mut entries = Vec::new();
    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let entry = parse_dictionary_line(line)
            .with_context(|| format!("{path:?}:{}: malformed dictionary entry", number + 1))?;
        match String::from_utf8(entry) {
            Ok(entry) => entries.push(entry),
            Err(_) => log::warn!("{path:?}:{}: skipping non-UTF-8 dictionary entry", number + 1),
        }
    }
    Ok(entries)
}

fn parse_dictionary_line(line: &str) -> anyhow::Result<Vec<u8>> {
    let start = line.find('"').context("missing opening quote")?;
    let end = line.rfind('"').filter(|&end| end > start).context("missing closing quote")?;
    let quoted = &line[start + 1..end];

    let mut out = Vec::with_capacity(quoted.len());
    let mut bytes = quoted.bytes();
    while let Some(b) = bytes.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match bytes.next() {
            Some(b'\\') => out.push(b'\\'),
            Some(b'"') => out.push(b'"'),
            Some(b'x') => {
                let hi = bytes.next().context("truncated \\x escape")?;
                let lo = bytes.next().context("truncated \\x escape")?;
                let digits = [hi, lo];
                let text = std::str::from_utf8(&digits).context("invalid \\x escape")?;
                out.push(u8::from_str_radix(text, 16).context("invalid \\x escape")?);
            }
            other => anyhow::bail!("unknown escape {:?}", other.map(char::from)),
        }
    }
    Ok(out)
}
