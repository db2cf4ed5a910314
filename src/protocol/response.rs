use std::io::{self, Write};
use std::time::SystemTime;

use http::StatusCode;

use crate::protocol::Cookie;

/// Body of the built-in error response, status line interpolated.
const ERROR_PAGE: &str = "<!DOCTYPE html>\n<html>\n<head><title>{status}</title></head>\n\
<body>\n<h1>{status}</h1>\n<p>The server was unable to process your request.</p>\n</body>\n</html>\n";

/// A response under construction, mutable until its headers are serialized.
///
/// The output stream is owned by the response and drained by the
/// connection; `Content-Length` is always computed from it.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    status_text: String,
    content_type: String,
    charset: String,
    cache_control: String,
    expires: SystemTime,
    location: Option<String>,
    headers: Vec<(String, String)>,
    cookies: Vec<Cookie>,
    body: Vec<u8>,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            status_text: "OK".to_string(),
            content_type: "text/html".to_string(),
            charset: "utf-8".to_string(),
            cache_control: "private".to_string(),
            expires: SystemTime::UNIX_EPOCH,
            location: None,
            headers: Vec::new(),
            cookies: Vec::new(),
            body: Vec::new(),
        }
    }
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in error response with the HTML template body.
    pub(crate) fn error_page(status: StatusCode, status_text: &str) -> Self {
        let mut response = Self::new();
        response.set_status(status, status_text);
        let line = format!("{} {}", status.as_u16(), status_text);
        response.body = ERROR_PAGE.replace("{status}", &line).into_bytes();
        response
    }

    pub(crate) fn internal_error() -> Self {
        Self::error_page(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    pub fn set_status(&mut self, status: StatusCode, status_text: impl Into<String>) {
        self.status = status;
        self.status_text = status_text.into();
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.content_type = content_type.into();
    }

    pub fn charset(&self) -> &str {
        &self.charset
    }

    pub fn set_charset(&mut self, charset: impl Into<String>) {
        self.charset = charset.into();
    }

    pub fn cache_control(&self) -> &str {
        &self.cache_control
    }

    pub fn set_cache_control(&mut self, cache_control: impl Into<String>) {
        self.cache_control = cache_control.into();
    }

    pub fn expires(&self) -> SystemTime {
        self.expires
    }

    pub fn set_expires(&mut self, at: SystemTime) {
        self.expires = at;
    }

    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    pub fn set_location(&mut self, location: impl Into<String>) {
        self.location = Some(location.into());
    }

    /// Replaces every header named `name` (case-insensitive) with one entry
    /// appended at the end of the ordered header list.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
    }

    /// Appends a header without touching existing entries of the same name.
    pub fn append_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn add_cookie(&mut self, cookie: Cookie) {
        self.cookies.push(cookie);
    }

    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    /// The response body accumulated so far.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_len(&self) -> u64 {
        self.body.len() as u64
    }

    pub fn write_str(&mut self, text: &str) {
        self.body.extend_from_slice(text.as_bytes());
    }
}

impl Write for Response {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.body.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let response = Response::new();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.status_text(), "OK");
        assert_eq!(response.content_type(), "text/html");
        assert_eq!(response.charset(), "utf-8");
        assert_eq!(response.cache_control(), "private");
        assert_eq!(response.expires(), SystemTime::UNIX_EPOCH);
        assert!(response.location().is_none());
        assert_eq!(response.body_len(), 0);
    }

    #[test]
    fn set_header_replaces_case_insensitively() {
        let mut response = Response::new();
        response.append_header("X-Tag", "1");
        response.append_header("x-tag", "2");
        response.set_header("X-TAG", "3");

        let tags: Vec<_> = response.headers().collect();
        assert_eq!(tags, vec![("X-TAG", "3")]);
    }

    #[test]
    fn body_accumulates_through_write() {
        let mut response = Response::new();
        response.write_str("hello ");
        response.write_all(b"world").unwrap();

        assert_eq!(response.body(), b"hello world");
        assert_eq!(response.body_len(), 11);
    }

    #[test]
    fn error_page_carries_status_line_in_body() {
        let response = Response::internal_error();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = String::from_utf8(response.body().to_vec()).unwrap();
        assert!(body.contains("500 Internal Server Error"));
        assert!(body.starts_with("<!DOCTYPE html>"));
    }
}
