//! Object key canonicalization.
//!
//! Creation notifications carry keys in form encoding: spaces arrive as `+`
//! and everything else unsafe is percent-escaped (a literal `+` arrives as
//! `%2B`). The canonical key is what every store operation uses.

use percent_encoding::percent_decode_str;

use crate::error::ReplicationError;

/// Decode a notification key into its canonical form.
///
/// `+` is turned into a space before percent-decoding, so an escaped `%2B`
/// survives as a literal plus sign.
///
/// # Errors
///
/// Returns [`ReplicationError::InvalidRequest`] if the key is empty or does
/// not decode to valid UTF-8.
///
/// # Examples
///
/// ```
/// use blobrelay_core::key::decode_key;
///
/// assert_eq!(decode_key("a+b%20c").unwrap(), "a b c");
/// assert_eq!(decode_key("reports/q1+2024.csv").unwrap(), "reports/q1 2024.csv");
/// assert_eq!(decode_key("c%2B%2B.txt").unwrap(), "c++.txt");
/// ```
pub fn decode_key(raw: &str) -> Result<String, ReplicationError> {
    if raw.is_empty() {
        return Err(ReplicationError::invalid_request("key must not be empty"));
    }

    let spaced = raw.replace('+', " ");
    let decoded = percent_decode_str(&spaced)
        .decode_utf8()
        .map_err(|e| ReplicationError::invalid_request(format!("key is not valid UTF-8: {e}")))?;

    Ok(decoded.into_owned())
}
