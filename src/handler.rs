use std::net::SocketAddr;

use async_trait::async_trait;
use http::StatusCode;

use crate::protocol::{BoxError, Request, RequestUrl, Response};

/// The request-received callback.
///
/// Invoked once per parsed request, on the task that drove the parse. The
/// request is read-only; the response stays mutable until the first byte
/// is flushed. Neither may be retained past the call.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: &mut ServerContext<'_>) -> Result<(), BoxError>;
}

/// Adapter for plain synchronous callbacks.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> RequestHandler for FnHandler<F>
where
    F: Fn(&mut ServerContext<'_>) -> Result<(), BoxError> + Send + Sync + 'static,
{
    async fn handle(&self, ctx: &mut ServerContext<'_>) -> Result<(), BoxError> {
        (self.0)(ctx)
    }
}

/// Request/response pair handed to the handler.
///
/// The request is read-only apart from its body streams, whose read
/// cursors necessarily move.
pub struct ServerContext<'a> {
    request: &'a mut Request,
    response: &'a mut Response,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl<'a> ServerContext<'a> {
    pub(crate) fn new(
        request: &'a mut Request,
        response: &'a mut Response,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Self {
        Self { request, response, local_addr, peer_addr }
    }

    pub fn request(&self) -> &Request {
        self.request
    }

    /// The opaque request body stream, when one was received.
    pub fn body(&mut self) -> Option<&mut crate::spool::Spool> {
        self.request.body_mut()
    }

    /// Multipart items with their file streams readable.
    pub fn multipart_items(&mut self) -> &mut [crate::protocol::MultipartItem] {
        self.request.multipart_items_mut()
    }

    pub fn response(&mut self) -> &mut Response {
        self.response
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// First value for `name` from the merged query-then-post multimap.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.request.param(name)
    }

    /// Sets a `301`/`302 Moved` response. Locations without a scheme are
    /// resolved against the current request URL: absolute paths against
    /// its authority, relative paths against its directory.
    pub fn redirect(&mut self, location: &str, permanent: bool) {
        let status = if permanent { StatusCode::MOVED_PERMANENTLY } else { StatusCode::FOUND };
        let resolved = resolve_location(self.request.url(), location);
        self.response.set_status(status, "Moved");
        self.response.set_location(resolved);
    }
}

fn resolve_location(url: &RequestUrl, location: &str) -> String {
    // a colon means the caller passed a full URL already
    if location.contains(':') {
        return location.to_string();
    }

    let base = format!("{}://{}", url.scheme(), url.authority());
    if location.starts_with('/') {
        return format!("{base}{location}");
    }

    let path = url.path();
    let directory = match path.rfind('/') {
        Some(slash) => &path[..=slash],
        None => "/",
    };
    format!("{base}{directory}{location}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, Method, Version};

    fn request_for(target: &str, host: &str) -> Request {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::HOST, host.parse().unwrap());
        Request::new(
            Method::GET,
            target.to_string(),
            Version::HTTP_11,
            headers,
            false,
            "127.0.0.1:80".parse().unwrap(),
        )
    }

    fn redirect_of(target: &str, host: &str, location: &str, permanent: bool) -> Response {
        let mut request = request_for(target, host);
        let mut response = Response::new();
        let mut ctx = ServerContext::new(
            &mut request,
            &mut response,
            "127.0.0.1:80".parse().unwrap(),
            "10.0.0.1:9".parse().unwrap(),
        );
        ctx.redirect(location, permanent);
        response
    }

    #[test]
    fn relative_location_resolves_against_request_directory() {
        let response = redirect_of("/a/b", "h:81", "c", false);

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.status_text(), "Moved");
        assert_eq!(response.location(), Some("http://h:81/a/c"));
    }

    #[test]
    fn absolute_path_resolves_against_authority() {
        let response = redirect_of("/a/b?q=1", "h", "/root", true);

        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.location(), Some("http://h/root"));
    }

    #[test]
    fn full_urls_pass_through_untouched() {
        let response = redirect_of("/a", "h", "https://elsewhere/x", false);
        assert_eq!(response.location(), Some("https://elsewhere/x"));
    }
}
