//! Block number and address canonicalization
//!
//! Block numbers travel as `0x`-prefixed hex strings (the JSON-RPC quantity
//! encoding). Addresses are kept as strings and only have their leading
//! zero digits normalized away.

use crate::error::{Result, WatchError};

/// Decode a `0x`-prefixed hex quantity.
///
/// Fails with [`WatchError::BadFormat`] if the prefix is missing.
pub fn str_to_hex(s: &str) -> Result<i64> {
    let digits = s
        .strip_prefix("0x")
        .ok_or_else(|| WatchError::BadFormat(s.to_string()))?;

    i64::from_str_radix(digits, 16).map_err(|source| WatchError::InvalidHex {
        value: s.to_string(),
        source,
    })
}

/// Encode a number as a lowercase, minimal-length `0x` hex quantity.
pub fn num_to_str(n: i64) -> String {
    format!("{:#x}", n)
}

/// Canonicalize an address by stripping redundant leading zero digits.
///
/// Letter case is left untouched.
pub fn normalize_address(s: &str) -> String {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    format!("0x{}", digits.trim_start_matches('0'))
}

/// Check that `s` looks like an address: `0x` followed by 1-40 hex digits.
pub fn is_address(s: &str) -> bool {
    match s.strip_prefix("0x") {
        Some(digits) => {
            !digits.is_empty()
                && digits.len() <= 40
                && digits.chars().all(|c| c.is_ascii_hexdigit())
        }
        None => false,
    }
}
