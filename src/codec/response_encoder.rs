use bytes::{BufMut, BytesMut};
use http::Version;
use httpdate::fmt_http_date;
use tokio_util::codec::Encoder;

use crate::form::TextEncoding;
use crate::protocol::{version_str, Response, SendError};

/// Serializes a response into its wire header block.
///
/// Emission order is fixed: status line, Cache-Control, Content-Type,
/// Expires, Location, user headers in insertion order, the computed
/// Content-Length, then one Set-Cookie per cookie. A user-set
/// Content-Length is ignored in favor of the body length.
pub struct ResponseEncoder {
    header_encoding: TextEncoding,
}

impl ResponseEncoder {
    pub fn new(header_encoding: TextEncoding) -> Self {
        Self { header_encoding }
    }

    fn put_header(&self, dst: &mut BytesMut, name: &str, value: &str) -> Result<(), SendError> {
        if name.contains(['\r', '\n']) || value.contains(['\r', '\n']) {
            return Err(SendError::InvalidHeaderValue { name: name.to_string() });
        }

        dst.put_slice(name.as_bytes());
        dst.put_slice(b": ");
        dst.put_slice(&self.header_encoding.encode(value));
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

impl<'a> Encoder<(&'a Response, Version)> for ResponseEncoder {
    type Error = SendError;

    fn encode(&mut self, item: (&'a Response, Version), dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (response, version) = item;

        dst.put_slice(version_str(version).as_bytes());
        dst.put_slice(b" ");
        dst.put_slice(response.status().as_str().as_bytes());
        if !response.status_text().is_empty() {
            if response.status_text().contains(['\r', '\n']) {
                return Err(SendError::InvalidHeaderValue { name: "status".to_string() });
            }
            dst.put_slice(b" ");
            dst.put_slice(&self.header_encoding.encode(response.status_text()));
        }
        dst.put_slice(b"\r\n");

        if !response.cache_control().is_empty() {
            self.put_header(dst, "Cache-Control", response.cache_control())?;
        }

        if !response.content_type().is_empty() {
            if response.charset().is_empty() {
                self.put_header(dst, "Content-Type", response.content_type())?;
            } else {
                let value = format!("{}; charset={}", response.content_type(), response.charset());
                self.put_header(dst, "Content-Type", &value)?;
            }
        }

        self.put_header(dst, "Expires", &fmt_http_date(response.expires()))?;

        if let Some(location) = response.location() {
            self.put_header(dst, "Location", location)?;
        }

        for (name, value) in response.headers() {
            if name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            self.put_header(dst, name, value)?;
        }

        self.put_header(dst, "Content-Length", &response.body_len().to_string())?;

        for cookie in response.cookies() {
            self.put_header(dst, "Set-Cookie", &cookie.header_value())?;
        }

        dst.put_slice(b"\r\n");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Cookie;
    use http::StatusCode;

    fn encode(response: &Response) -> String {
        let mut dst = BytesMut::new();
        ResponseEncoder::new(TextEncoding::Utf8).encode((response, Version::HTTP_11), &mut dst).unwrap();
        String::from_utf8(dst.to_vec()).unwrap()
    }

    #[test]
    fn default_response_header_block() {
        let mut response = Response::new();
        response.write_str("hello");

        let block = encode(&response);
        assert_eq!(
            block,
            "HTTP/1.1 200 OK\r\n\
             Cache-Control: private\r\n\
             Content-Type: text/html; charset=utf-8\r\n\
             Expires: Thu, 01 Jan 1970 00:00:00 GMT\r\n\
             Content-Length: 5\r\n\
             \r\n"
        );
    }

    #[test]
    fn user_headers_keep_insertion_order() {
        let mut response = Response::new();
        response.append_header("X-First", "1");
        response.append_header("X-Second", "2");

        let block = encode(&response);
        let first = block.find("X-First").unwrap();
        let second = block.find("X-Second").unwrap();
        assert!(first < second);
    }

    // Exactly one Content-Length, computed from the body, even when the
    // host set its own.
    #[test]
    fn content_length_overrides_user_value() {
        let mut response = Response::new();
        response.set_header("Content-Length", "9999");
        response.write_str("four");

        let block = encode(&response);
        assert_eq!(block.matches("Content-Length").count(), 1);
        assert!(block.contains("Content-Length: 4\r\n"));
    }

    #[test]
    fn cookies_follow_content_length() {
        let mut response = Response::new();
        response.add_cookie(Cookie::new("a", "1"));
        response.add_cookie(Cookie::new("b", "2").http_only());

        let block = encode(&response);
        assert!(block.contains("Set-Cookie: a=1\r\n"));
        assert!(block.contains("Set-Cookie: b=2; HttpOnly\r\n"));
        assert!(block.find("Content-Length").unwrap() < block.find("Set-Cookie").unwrap());
    }

    #[test]
    fn redirect_emits_location() {
        let mut response = Response::new();
        response.set_status(StatusCode::FOUND, "Moved");
        response.set_location("http://h:81/a/c");

        let block = encode(&response);
        assert!(block.starts_with("HTTP/1.1 302 Moved\r\n"));
        assert!(block.contains("Location: http://h:81/a/c\r\n"));
    }

    #[test]
    fn empty_charset_drops_the_parameter() {
        let mut response = Response::new();
        response.set_charset("");

        assert!(encode(&response).contains("Content-Type: text/html\r\n"));
    }

    #[test]
    fn newline_in_header_value_is_rejected() {
        let mut response = Response::new();
        response.set_header("X-Bad", "a\r\nInjected: yes");

        let mut dst = BytesMut::new();
        let result = ResponseEncoder::new(TextEncoding::Utf8).encode((&response, Version::HTTP_11), &mut dst);
        assert!(matches!(result, Err(SendError::InvalidHeaderValue { .. })));
    }
}
