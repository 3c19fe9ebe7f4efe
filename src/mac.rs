//! MAC address normalization and validation shared across C1/C3/C4/C12.

use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;

static MAC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9A-Fa-f]{2}(:[0-9A-Fa-f]{2}){5}$").unwrap());

/// Normalize any reasonable MAC representation (colons, dashes, bare hex) to
/// canonical uppercase colon-separated form, validating length along the way.
pub fn normalize(mac: &str) -> Result<String> {
    let cleaned: String = mac
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .collect::<String>()
        .to_uppercase();

    if cleaned.len() != 12 {
        return Err(Error::Validation(format!("malformed MAC address: {mac}")));
    }

    let normalized = cleaned
        .as_bytes()
        .chunks(2)
        .map(|c| std::str::from_utf8(c).unwrap())
        .collect::<Vec<_>>()
        .join(":");

    Ok(normalized)
}

/// True iff `mac` is already in canonical `XX:XX:XX:XX:XX:XX` form.
pub fn is_canonical(mac: &str) -> bool {
    MAC_RE.is_match(mac)
}

/// First three octets of a canonical MAC, joined by underscores (`AA_BB_CC`).
pub fn prefix_octets(mac: &str) -> Result<String> {
    let normalized = normalize(mac)?;
    Ok(normalized.split(':').take(3).collect::<Vec<_>>().join("_"))
}
