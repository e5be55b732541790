use anyhow::{bail, Context, Result};

/// The number of digits of the segment id in a segment filename.
const ID_DIGITS: usize = 10;

/// Build the filename of a segment, e.g. `undo.0.0000000001.log` for prefix `undo.0` and id 1.
pub fn format(prefix: &str, segment_id: u32) -> String {
    // 10 digits hold any u32.
    format!("{prefix}.{segment_id:0>10}.log")
}

/// Extract the segment id from a filename produced by [`format`] with the same prefix.
pub fn parse(prefix: &str, filename: &str) -> Result<u32> {
    assert!(!prefix.is_empty());
    let Some(digits) = filename
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('.'))
        .and_then(|rest| rest.strip_suffix(".log"))
    else {
        bail!("{filename} is not a segment of {prefix}");
    };

    if digits.len() != ID_DIGITS || !digits.bytes().all(|b| b.is_ascii_digit()) {
        bail!("{filename}: segment id must be exactly {ID_DIGITS} decimal digits");
    }

    digits
        .parse::<u32>()
        .with_context(|| format!("{filename}: segment id out of range"))
}
