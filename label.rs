//! Lock label codec.
//!
//! A label is an ordered list of `(key, value)` pairs rendered as
//! `data:k1=v1&k2=v2`. Keys and values are percent-escaped, so `&`, `=` and `%`
//! inside them survive the round trip. Labels carry no cryptographic meaning.

use std::collections::HashSet;

use crate::error::{CdocError, Result};

pub const LABEL_PREFIX: &str = "data:";

/// Encode ordered pairs into a label string. Keys must be non-empty and unique.
pub fn build_label<K, V>(pairs: &[(K, V)]) -> Result<String>
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut seen = HashSet::with_capacity(pairs.len());
    let mut out = String::from(LABEL_PREFIX);

    for (i, (key, value)) in pairs.iter().enumerate() {
        let key = key.as_ref();
        if key.is_empty() {
            return Err(CdocError::format("label key cannot be empty"));
        }
        if !seen.insert(key) {
            return Err(CdocError::format(format!("duplicate label key '{}'", key)));
        }
        if i > 0 {
            out.push('&');
        }
        out.push_str(&urlencoding::encode(key));
        out.push('=');
        out.push_str(&urlencoding::encode(value.as_ref()));
    }

    Ok(out)
}

/// Decode a label produced by [`build_label`].
pub fn parse_label(label: &str) -> Result<Vec<(String, String)>> {
    let body = label
        .strip_prefix(LABEL_PREFIX)
        .ok_or_else(|| CdocError::format(format!("label must start with '{}'", LABEL_PREFIX)))?;

    if body.is_empty() {
        return Ok(Vec::new());
    }

    let mut seen = HashSet::new();
    let mut pairs = Vec::new();

    for part in body.split('&') {
        let (raw_key, raw_value) = part
            .split_once('=')
            .ok_or_else(|| CdocError::format(format!("label component '{}' has no '='", part)))?;
        if raw_value.contains('=') {
            return Err(CdocError::format(format!("unescaped '=' in label component '{}'", part)));
        }

        let key = unescape(raw_key)?;
        if key.is_empty() {
            return Err(CdocError::format("label key cannot be empty"));
        }
        if !seen.insert(key.clone()) {
            return Err(CdocError::format(format!("duplicate label key '{}'", key)));
        }
        pairs.push((key, unescape(raw_value)?));
    }

    Ok(pairs)
}

/// Look up a single value in a label; `None` if the label is malformed or lacks the key.
pub fn label_value(label: &str, key: &str) -> Option<String> {
    parse_label(label)
        .ok()?
        .into_iter()
        .find_map(|(k, v)| (k == key).then_some(v))
}

fn unescape(raw: &str) -> Result<String> {
    let bytes = raw.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let well_formed = bytes.len() >= i + 3
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit();
            if !well_formed {
                return Err(CdocError::format(format!("broken escape in '{}'", raw)));
            }
            i += 3;
        } else {
            i += 1;
        }
    }

    urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .map_err(|e| CdocError::format(format!("label is not valid UTF-8: {}", e)))
}
