//! Byte-oriented percent-decoding and `application/x-www-form-urlencoded`
//! parsing. Decoding first maps `%HH` escapes (and, in form context, `+`)
//! down to bytes, then interprets the bytes in a caller-supplied encoding.

use crate::protocol::Params;

/// Text encoding applied to decoded parameter bytes and emitted header
/// values. UTF-8 unless the peer labelled something else.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TextEncoding {
    #[default]
    Utf8,
    Latin1,
}

impl TextEncoding {
    /// Resolves a MIME charset label. Unknown labels map to `None`.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().trim_matches('"').to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Some(Self::Utf8),
            "latin1" | "iso-8859-1" | "iso8859-1" => Some(Self::Latin1),
            _ => None,
        }
    }

    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            Self::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Self::Latin1 => bytes.iter().map(|&b| b as char).collect(),
        }
    }

    pub fn encode(self, text: &str) -> Vec<u8> {
        match self {
            Self::Utf8 => text.as_bytes().to_vec(),
            Self::Latin1 => text.chars().map(|c| if (c as u32) < 256 { c as u8 } else { b'?' }).collect(),
        }
    }
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Maps `%HH` escapes to bytes. `+` becomes a space only in form context;
/// in path context it stays literal. Malformed escapes pass through
/// unchanged.
pub fn percent_decode(input: &[u8], plus_as_space: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;

    while i < input.len() {
        match input[i] {
            b'%' => {
                let hi = input.get(i + 1).copied().and_then(hex_value);
                let lo = input.get(i + 2).copied().and_then(hex_value);
                match (hi, lo) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 3;
                        continue;
                    }
                    _ => out.push(b'%'),
                }
            }
            b'+' if plus_as_space => out.push(b' '),
            b => out.push(b),
        }
        i += 1;
    }

    out
}

const UNRESERVED: &[u8] = b"-_.~";

/// Percent-encodes a string in the given encoding. Form context encodes
/// spaces as `+`, path context as `%20`.
pub fn percent_encode(input: &str, encoding: TextEncoding, plus_for_space: bool) -> String {
    let mut out = String::new();
    for b in encoding.encode(input) {
        match b {
            b' ' if plus_for_space => out.push('+'),
            b if b.is_ascii_alphanumeric() || UNRESERVED.contains(&b) => out.push(b as char),
            b => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Decodes one path or query component without form `+` handling.
pub fn url_decode(input: &str, encoding: TextEncoding) -> String {
    encoding.decode(&percent_decode(input.as_bytes(), false))
}

/// Splits a form body (or query string) on `&`, then on the first `=`.
/// Missing `=` yields an empty value; repeated keys preserve order.
pub fn parse_form(input: &[u8], encoding: TextEncoding) -> Params {
    let mut params = Params::new();

    for pair in input.split(|&b| b == b'&') {
        if pair.is_empty() {
            continue;
        }

        let (name, value) = match pair.iter().position(|&b| b == b'=') {
            Some(eq) => (&pair[..eq], &pair[eq + 1..]),
            None => (pair, &[][..]),
        };

        params.push(
            encoding.decode(&percent_decode(name, true)),
            encoding.decode(&percent_decode(value, true)),
        );
    }

    params
}

/// Serializes a parameter multimap back into form encoding.
pub fn encode_form(params: &Params, encoding: TextEncoding) -> String {
    params
        .iter()
        .map(|(n, v)| format!("{}={}", percent_encode(n, encoding, true), percent_encode(v, encoding, true)))
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plus_is_space_only_in_form_context() {
        assert_eq!(percent_decode(b"a+b", true), b"a b");
        assert_eq!(percent_decode(b"a+b", false), b"a+b");
    }

    #[test]
    fn percent_escapes_decode_to_bytes() {
        assert_eq!(percent_decode(b"hi%20u", false), b"hi u");
        assert_eq!(percent_decode(b"%E2%82%AC", false), "€".as_bytes());
    }

    #[test]
    fn malformed_escapes_pass_through() {
        assert_eq!(percent_decode(b"100%", false), b"100%");
        assert_eq!(percent_decode(b"%zz", false), b"%zz");
    }

    #[test]
    fn form_split_and_missing_equals() {
        let params = parse_form(b"a=1&b=hi%20u&flag", TextEncoding::Utf8);

        assert_eq!(params.get("a"), Some("1"));
        assert_eq!(params.get("b"), Some("hi u"));
        assert_eq!(params.get("flag"), Some(""));
    }

    #[test]
    fn repeated_keys_keep_order() {
        let params = parse_form(b"k=1&k=2&k=3", TextEncoding::Utf8);
        assert_eq!(params.get_all("k").collect::<Vec<_>>(), vec!["1", "2", "3"]);
    }

    #[test]
    fn latin1_bytes_decode_per_charset() {
        assert_eq!(TextEncoding::Latin1.decode(&[0xE9]), "é");
        assert_eq!(TextEncoding::Utf8.decode("é".as_bytes()), "é");
    }

    // parse(encode(m)) == m as multimaps, order preserved, for ASCII and
    // non-ASCII keys and values.
    #[test]
    fn form_round_trip_preserves_multimap() {
        let cases: Vec<Params> = vec![
            [("a", "1"), ("b", "hi u"), ("a", "3")]
                .into_iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
            [("naïve", "café €"), ("x&y", "a=b+c"), ("", "empty-name")]
                .into_iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
        ];

        for params in cases {
            let encoded = encode_form(&params, TextEncoding::Utf8);
            let decoded = parse_form(encoded.as_bytes(), TextEncoding::Utf8);
            assert_eq!(decoded, params, "round trip through {encoded:?}");
        }
    }

    #[test]
    fn encode_uses_plus_only_for_form_space() {
        assert_eq!(percent_encode("a b", TextEncoding::Utf8, true), "a+b");
        assert_eq!(percent_encode("a b", TextEncoding::Utf8, false), "a%20b");
        assert_eq!(percent_encode("€", TextEncoding::Utf8, false), "%E2%82%AC");
    }
}
