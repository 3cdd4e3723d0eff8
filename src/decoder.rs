//! Field decoder for MCMP message bodies
//!
//! A body is a flat sequence of tokens separated by `&` or `=`, read as
//! alternating names and values. Tokens are percent-decoded; a decoded
//! `<`, `>`, `"`, `'`, CR or LF rejects the whole message.

use crate::error::{McmpError, McmpResult, PARSE_FAILED};

/// Decoded name/value pairs of one message, in arrival order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fields {
    pairs: Vec<(String, String)>,
}

impl Fields {
    /// Decode a raw message body
    pub fn decode(buf: &[u8]) -> McmpResult<Self> {
        if buf.is_empty() {
            return Ok(Self::default());
        }

        let tokens: Vec<&[u8]> = buf.split(|b| *b == b'&' || *b == b'=').collect();
        let mut pairs = Vec::with_capacity(tokens.len() / 2 + 1);
        for chunk in tokens.chunks(2) {
            let name = decode_token(chunk[0])?;
            let value = match chunk.get(1) {
                Some(raw) => decode_token(raw)?,
                None => String::new(),
            };
            // A trailing separator leaves an empty marker behind
            if name.is_empty() && value.is_empty() {
                continue;
            }
            pairs.push((name, value));
        }
        Ok(Self { pairs })
    }

    /// Build from already decoded pairs
    pub fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        Self { pairs }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Value of the first field named `name` (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&str> {
        self.iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Percent-decode one token, rejecting markup, line breaks and invalid UTF-8
pub(crate) fn decode_token(raw: &[u8]) -> McmpResult<String> {
    let decoded = urlencoding::decode_binary(raw);
    if decoded
        .iter()
        .any(|b| matches!(b, b'<' | b'>' | b'"' | b'\'' | b'\r' | b'\n'))
    {
        return Err(McmpError::syntax(PARSE_FAILED));
    }
    String::from_utf8(decoded.into_owned()).map_err(|_| McmpError::syntax(PARSE_FAILED))
}

/// Parse a leading decimal integer the way the protocol's numeric fields
/// have always been read: surrounding garbage is ignored, no digits is zero.
pub fn parse_int(value: &str) -> i64 {
    let s = value.trim_start();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let end = digits
        .bytes()
        .position(|b| !b.is_ascii_digit())
        .unwrap_or(digits.len());
    let n = digits[..end]
        .bytes()
        .fold(0i64, |acc, b| acc.saturating_mul(10).saturating_add((b - b'0') as i64));
    if negative {
        -n
    } else {
        n
    }
}
