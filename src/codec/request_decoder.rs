use http::{HeaderMap, HeaderName, HeaderValue, Method, Version};

use crate::buffer::ReadBuffer;
use crate::protocol::ProtocolError;

/// Everything parsed before the body: request line and header block.
#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub version: Version,
    pub headers: HeaderMap,
}

/// Line-based decoder for the request prolog and headers.
///
/// `decode` pulls complete lines out of the read buffer and returns
/// `Ok(None)` until the blank line that ends the header block has been
/// seen. Blank lines before the prolog are skipped.
pub struct RequestDecoder {
    prolog: Option<(Method, String, Version)>,
    headers: HeaderMap,
}

impl RequestDecoder {
    pub fn new() -> Self {
        Self { prolog: None, headers: HeaderMap::new() }
    }

    /// True once the request line has been parsed.
    pub fn prolog_read(&self) -> bool {
        self.prolog.is_some()
    }

    pub fn decode(&mut self, buffer: &mut ReadBuffer) -> Result<Option<RequestHead>, ProtocolError> {
        loop {
            let Some(line) = buffer.read_line() else {
                return Ok(None);
            };

            if self.prolog.is_none() {
                if line.is_empty() {
                    continue;
                }
                self.prolog = Some(parse_prolog(&line)?);
                continue;
            }

            if line.is_empty() {
                let (method, target, version) = self.prolog.take().expect("prolog parsed");
                let headers = std::mem::take(&mut self.headers);
                return Ok(Some(RequestHead { method, target, version, headers }));
            }

            let (name, value) = parse_header_line(&line)?;
            // duplicates overwrite, last write wins
            self.headers.insert(name, value);
        }
    }
}

impl Default for RequestDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// `METHOD SP TARGET SP HTTP/x` with METHOD all uppercase letters and no
/// extra fields. Only the two protocols this library can answer pass.
fn parse_prolog(line: &str) -> Result<(Method, String, Version), ProtocolError> {
    let invalid = || ProtocolError::InvalidProlog { line: line.to_string() };

    let fields: Vec<&str> = line.split(' ').collect();
    let &[method, target, protocol] = fields.as_slice() else {
        return Err(invalid());
    };

    if method.is_empty() || !method.bytes().all(|b| b.is_ascii_uppercase()) {
        return Err(invalid());
    }
    let method = Method::from_bytes(method.as_bytes()).map_err(|_| invalid())?;

    if target.is_empty() {
        return Err(invalid());
    }

    let version = match protocol {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        _ => return Err(invalid()),
    };

    Ok((method, target.to_string(), version))
}

/// `Name: value`, split on the first colon, both sides trimmed.
fn parse_header_line(line: &str) -> Result<(HeaderName, HeaderValue), ProtocolError> {
    let invalid = || ProtocolError::InvalidHeaderLine { line: line.to_string() };

    let (name, value) = line.split_once(':').ok_or_else(invalid)?;

    let name = HeaderName::from_bytes(name.trim().as_bytes()).map_err(|_| invalid())?;

    // read_line decoded bytes 1:1, so chars map back losslessly
    let value_bytes: Vec<u8> = value.trim().chars().map(|c| c as u8).collect();
    let value = HeaderValue::from_bytes(&value_bytes).map_err(|_| invalid())?;

    Ok((name, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    async fn buffer_from(bytes: &[u8]) -> ReadBuffer {
        let mut buffer = ReadBuffer::new(64, 1024 * 1024);
        let mut stream = bytes;
        while buffer.fill_from(&mut stream).await.unwrap() > 0 {}
        buffer
    }

    async fn decode_head(bytes: &[u8]) -> Result<Option<RequestHead>, ProtocolError> {
        let mut buffer = buffer_from(bytes).await;
        RequestDecoder::new().decode(&mut buffer)
    }

    #[tokio::test]
    async fn parses_a_plain_get() {
        let head = decode_head(b"GET /index.html?a=1 HTTP/1.1\r\nHost: 127.0.0.1:8080\r\nAccept: */*\r\n\r\n")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(head.method, Method::GET);
        assert_eq!(head.target, "/index.html?a=1");
        assert_eq!(head.version, Version::HTTP_11);
        assert_eq!(head.headers.len(), 2);
        assert_eq!(head.headers.get(http::header::HOST).unwrap(), "127.0.0.1:8080");
    }

    #[tokio::test]
    async fn header_names_are_case_insensitive_and_duplicates_overwrite() {
        let head = decode_head(b"GET / HTTP/1.1\r\nX-Tag: one\r\nx-tag: two\r\n\r\n")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(head.headers.len(), 1);
        assert_eq!(head.headers.get("X-TAG").unwrap(), "two");
    }

    #[tokio::test]
    async fn bare_lf_lines_are_accepted() {
        let head = decode_head(b"GET / HTTP/1.1\nHost: h\n\n").await.unwrap().unwrap();
        assert_eq!(head.headers.get(http::header::HOST).unwrap(), "h");
    }

    #[tokio::test]
    async fn from_curl() {
        let raw = indoc! {r"
            GET /index.html HTTP/1.1
            Host: 127.0.0.1:8080
            User-Agent: curl/7.79.1
            Accept: */*

        "};

        let head = decode_head(raw.as_bytes()).await.unwrap().unwrap();

        assert_eq!(head.method, Method::GET);
        assert_eq!(head.headers.len(), 3);
        assert_eq!(head.headers.get(http::header::HOST).unwrap(), "127.0.0.1:8080");
        assert_eq!(head.headers.get(http::header::USER_AGENT).unwrap(), "curl/7.79.1");
        assert_eq!(head.headers.get(http::header::ACCEPT).unwrap(), "*/*");
    }

    #[tokio::test]
    async fn leading_blank_lines_are_skipped() {
        let head = decode_head(b"\r\n\r\nGET / HTTP/1.1\r\n\r\n").await.unwrap().unwrap();
        assert_eq!(head.method, Method::GET);
    }

    #[tokio::test]
    async fn incomplete_head_yields_none() {
        let mut buffer = buffer_from(b"GET / HTTP/1.1\r\nHost: h\r\n").await;
        let mut decoder = RequestDecoder::new();

        assert!(decoder.decode(&mut buffer).unwrap().is_none());
        assert!(decoder.prolog_read());
    }

    #[tokio::test]
    async fn malformed_prologs_are_rejected() {
        for bad in [
            &b"NOT A REQUEST\r\n\r\n"[..],
            b"get / HTTP/1.1\r\n\r\n",
            b"GET / HTTP/2.0\r\n\r\n",
            b"GET /a b HTTP/1.1\r\n\r\n",
            b"GET HTTP/1.1\r\n\r\n",
        ] {
            let result = decode_head(bad).await;
            assert!(
                matches!(result, Err(ProtocolError::InvalidProlog { .. })),
                "expected prolog rejection for {:?}",
                String::from_utf8_lossy(bad)
            );
        }
    }

    #[tokio::test]
    async fn header_without_colon_is_rejected() {
        let result = decode_head(b"GET / HTTP/1.1\r\nbroken header\r\n\r\n").await;
        assert!(matches!(result, Err(ProtocolError::InvalidHeaderLine { .. })));
    }

    #[tokio::test]
    async fn trailing_bytes_stay_in_the_buffer() {
        let mut buffer = buffer_from(b"GET / HTTP/1.1\r\n\r\nleftover").await;
        RequestDecoder::new().decode(&mut buffer).unwrap().unwrap();

        assert_eq!(buffer.unread_len(), 8);
    }

    // For any split of the byte stream into chunks, the parser yields the
    // same head as the unsplit input.
    #[tokio::test]
    async fn parse_is_invariant_under_chunking() {
        let raw = &b"POST /submit?q=2 HTTP/1.1\r\nHost: example\r\nContent-Length: 0\r\n\r\n"[..];

        for split in 1..raw.len() {
            let mut buffer = ReadBuffer::new(8, 1024);
            let mut decoder = RequestDecoder::new();

            let (mut first, mut second) = raw.split_at(split);
            while buffer.fill_from(&mut first).await.unwrap() > 0 {}
            assert!(decoder.decode(&mut buffer).unwrap().is_none() || second.is_empty());
            while buffer.fill_from(&mut second).await.unwrap() > 0 {}

            let head = match decoder.decode(&mut buffer).unwrap() {
                Some(head) => head,
                None => panic!("head not parsed at split {split}"),
            };
            assert_eq!(head.method, Method::POST);
            assert_eq!(head.target, "/submit?q=2");
            assert_eq!(head.headers.len(), 2);
        }
    }
}
