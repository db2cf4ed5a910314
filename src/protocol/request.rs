use std::fmt::{self, Display, Formatter};
use std::net::SocketAddr;
use std::sync::OnceLock;

use http::{HeaderMap, Method, Version};

use crate::form::{self, TextEncoding};
use crate::protocol::{version_str, MultipartItem, Params};
use crate::spool::Spool;

/// The request target resolved against the connection and `Host` header.
///
/// The scheme is `https` iff the connection is TLS. The authority comes
/// from an absolute-form target if the client sent one, else the `Host`
/// header, else the local endpoint.
#[derive(Debug, Clone)]
pub struct RequestUrl {
    secure: bool,
    host: String,
    port: u16,
    path: String,
    query: Option<String>,
}

impl RequestUrl {
    pub(crate) fn parse(target: &str, headers: &HeaderMap, secure: bool, local_addr: SocketAddr) -> Self {
        let default_port = if secure { 443 } else { 80 };

        let (authority, path_and_query) = match target.strip_prefix("http://").or_else(|| target.strip_prefix("https://")) {
            // absolute-form: its authority overrides the Host header
            Some(rest) => match rest.find('/') {
                Some(slash) => (Some(&rest[..slash]), &rest[slash..]),
                None => (Some(rest), "/"),
            },
            None => {
                let host = headers.get(http::header::HOST).and_then(|v| v.to_str().ok());
                (host, target)
            }
        };

        let (host, port) = match authority {
            Some(authority) => split_authority(authority, default_port),
            None => (local_addr.ip().to_string(), local_addr.port()),
        };

        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (path_and_query.to_string(), None),
        };

        Self { secure, host, port, path, query }
    }

    pub fn scheme(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// `host` or `host:port` when the port is not the scheme default.
    /// IPv6 literals go back into brackets.
    pub fn authority(&self) -> String {
        let default_port = if self.secure { 443 } else { 80 };
        let host = if self.host.contains(':') { format!("[{}]", self.host) } else { self.host.clone() };
        if self.port == default_port {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

/// Splits `host[:port]`, handling the bracketed IPv6 literal form: the
/// brackets are stripped and only a colon after `]` separates the port.
fn split_authority(authority: &str, default_port: u16) -> (String, u16) {
    if let Some(rest) = authority.strip_prefix('[') {
        return match rest.split_once(']') {
            Some((host, after)) => {
                let port = after.strip_prefix(':').and_then(|p| p.parse().ok()).unwrap_or(default_port);
                (host.to_string(), port)
            }
            // unterminated literal, keep it whole
            None => (authority.to_string(), default_port),
        };
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(default_port)),
        None => (authority.to_string(), default_port),
    }
}

impl Display for RequestUrl {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme(), self.authority(), self.path)?;
        if let Some(query) = &self.query {
            write!(f, "?{query}")?;
        }
        Ok(())
    }
}

/// A parsed request, immutable once the handler runs.
#[derive(Debug)]
pub struct Request {
    method: Method,
    target: String,
    version: Version,
    headers: HeaderMap,
    url: RequestUrl,
    query_params: OnceLock<Params>,
    post_params: Params,
    multipart_items: Vec<MultipartItem>,
    body: Option<Spool>,
}

impl Request {
    pub(crate) fn new(
        method: Method,
        target: String,
        version: Version,
        headers: HeaderMap,
        secure: bool,
        local_addr: SocketAddr,
    ) -> Self {
        let url = RequestUrl::parse(&target, &headers, secure, local_addr);
        Self {
            method,
            target,
            version,
            headers,
            url,
            query_params: OnceLock::new(),
            post_params: Params::new(),
            multipart_items: Vec::new(),
            body: None,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The raw request target as it appeared on the wire.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub(crate) fn protocol(&self) -> &'static str {
        version_str(self.version)
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn url(&self) -> &RequestUrl {
        &self.url
    }

    /// Query parameters, parsed once from the raw query on first access.
    pub fn query_params(&self) -> &Params {
        self.query_params.get_or_init(|| {
            form::parse_form(self.url.query().unwrap_or("").as_bytes(), TextEncoding::Utf8)
        })
    }

    /// Parameters from a urlencoded request body.
    pub fn post_params(&self) -> &Params {
        &self.post_params
    }

    pub fn multipart_items(&self) -> &[MultipartItem] {
        &self.multipart_items
    }

    pub fn multipart_items_mut(&mut self) -> &mut [MultipartItem] {
        &mut self.multipart_items
    }

    /// The opaque request body stream, when one was received.
    pub fn body_mut(&mut self) -> Option<&mut Spool> {
        self.body.as_mut()
    }

    /// First value for `name` from the merged query-then-post view.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.query_params().get(name).or_else(|| self.post_params.get(name))
    }

    /// The merged query-then-post view, in precedence order.
    pub fn params(&self) -> impl Iterator<Item = (&str, &str)> {
        self.query_params().iter().chain(self.post_params.iter())
    }

    pub(crate) fn set_post_params(&mut self, params: Params) {
        self.post_params = params;
    }

    pub(crate) fn set_multipart_items(&mut self, items: Vec<MultipartItem>) {
        self.multipart_items = items;
    }

    pub(crate) fn set_body(&mut self, body: Spool) {
        self.body = Some(body);
    }
}
