//! Per-connection state machine.
//!
//! One task owns the socket and drives read, parse, dispatch, and write
//! for each request in turn; at most one read or write is outstanding at
//! any time. Every await on the socket is raced against the connection's
//! cancellation token, so a dispose from the timeout sweeper or shutdown
//! fails the in-flight I/O and unwinds the task.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use http::Version;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::buffer::ReadBuffer;
use crate::codec::body::{BodyConfig, BodyDecoder, ParsedBody};
use crate::codec::{RequestDecoder, RequestHead, ResponseEncoder};
use crate::handler::ServerContext;
use crate::protocol::{version_str, HttpError, ProtocolError, Request, Response, SendError};
use crate::server::{ServerCore, ServerRuntime, ServerState};

/// Where the state machine currently is, mirrored for observers like
/// `request_close`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ConnectionState {
    ReadingProlog = 0,
    ReadingHeaders = 1,
    ReadingContent = 2,
    WritingHeaders = 3,
    WritingContent = 4,
    Closed = 5,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::ReadingProlog,
            1 => Self::ReadingHeaders,
            2 => Self::ReadingContent,
            3 => Self::WritingHeaders,
            4 => Self::WritingContent,
            _ => Self::Closed,
        }
    }
}

/// Connection handle shared with the registry and the timeout sweeper.
pub(crate) struct ConnShared {
    pub id: u64,
    pub token: CancellationToken,
    state: AtomicU8,
    close_requested: AtomicBool,
}

impl ConnShared {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            token: CancellationToken::new(),
            state: AtomicU8::new(ConnectionState::ReadingProlog as u8),
            close_requested: AtomicBool::new(false),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn close_requested(&self) -> bool {
        self.close_requested.load(Ordering::Acquire)
    }

    /// Winds the connection down: idle connections tear down their read
    /// immediately, in-flight requests finish and then close.
    pub fn request_close(&self) {
        self.close_requested.store(true, Ordering::Release);
        if self.state() == ConnectionState::ReadingProlog {
            self.token.cancel();
        }
    }

    pub fn force_close(&self) {
        self.token.cancel();
    }
}

pub(crate) struct Connection<S> {
    stream: S,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    secure: bool,
    buffer: ReadBuffer,
    shared: Arc<ConnShared>,
    core: Arc<ServerCore>,
    runtime: Arc<ServerRuntime>,
    prolog_parsed: bool,
    response_started: bool,
    version: Version,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        stream: S,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        secure: bool,
        shared: Arc<ConnShared>,
        core: Arc<ServerCore>,
        runtime: Arc<ServerRuntime>,
    ) -> Self {
        let config = core.config();
        let buffer = ReadBuffer::new(config.read_buffer_size, config.max_read_buffer_size);
        Self {
            stream,
            peer_addr,
            local_addr,
            secure,
            buffer,
            shared,
            core,
            runtime,
            prolog_parsed: false,
            response_started: false,
            version: Version::HTTP_11,
        }
    }

    pub async fn run(mut self) {
        debug!(conn_id = self.shared.id, peer = %self.peer_addr, "connection opened");

        match self.process().await {
            Ok(()) => debug!(conn_id = self.shared.id, "connection closed"),
            Err(error) => self.handle_failure(error).await,
        }

        self.shared.set_state(ConnectionState::Closed);
        self.shared.token.cancel();
    }

    async fn process(&mut self) -> Result<(), HttpError> {
        loop {
            let Some(head) = self.read_head().await? else {
                return Ok(());
            };

            let keep_alive = self.handle_request(head).await?;
            if !keep_alive {
                return Ok(());
            }

            self.reset_for_next_request();
        }
    }

    /// Reads the prolog and header block. `Ok(None)` is a clean close:
    /// EOF on a request boundary with nothing buffered.
    async fn read_head(&mut self) -> Result<Option<RequestHead>, HttpError> {
        self.shared.set_state(ConnectionState::ReadingProlog);
        let mut decoder = RequestDecoder::new();

        loop {
            let decoded = decoder.decode(&mut self.buffer);
            if decoder.prolog_read() && !self.prolog_parsed {
                self.prolog_parsed = true;
                self.shared.set_state(ConnectionState::ReadingHeaders);
            }

            match decoded? {
                Some(head) => {
                    self.prolog_parsed = true;
                    self.version = head.version;
                    return Ok(Some(head));
                }
                None => {
                    let n = self.fill_read().await?;
                    if n == 0 {
                        if self.prolog_parsed || self.buffer.data_available() {
                            return Err(HttpError::Io { source: io::ErrorKind::UnexpectedEof.into() });
                        }
                        return Ok(None);
                    }
                }
            }
        }
    }

    async fn handle_request(&mut self, head: RequestHead) -> Result<bool, HttpError> {
        self.shared.set_state(ConnectionState::ReadingContent);
        self.buffer.reset();

        let RequestHead { method, target, version, mut headers } = head;

        // consumed here so it is not re-handled below
        if let Some(expect) = headers.remove(http::header::EXPECT) {
            let value = expect.to_str().unwrap_or("").trim().to_string();
            if !value.eq_ignore_ascii_case("100-continue") {
                return Err(ProtocolError::UnsupportedExpect { value }.into());
            }
            self.send_continue(version).await?;
        }

        // refused regardless of Content-Length: a chunked body would
        // otherwise desync the connection
        if is_chunked(headers.get(http::header::TRANSFER_ENCODING)) {
            return Err(ProtocolError::UnsupportedTransferEncoding.into());
        }

        let parsed_body = match content_length(&headers)? {
            Some(length) => Some(self.read_body(&headers, length).await?),
            None => None,
        };

        let keep_alive_requested = headers
            .get(http::header::CONNECTION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().eq_ignore_ascii_case("keep-alive"))
            .unwrap_or(false);

        let mut request = Request::new(method, target, version, headers, self.secure, self.local_addr);
        match parsed_body {
            Some(ParsedBody::Opaque(spool)) => request.set_body(spool),
            Some(ParsedBody::Form(params)) => request.set_post_params(params),
            Some(ParsedBody::Multipart(items)) => request.set_multipart_items(items),
            None => {}
        }

        let mut response = Response::new();
        let unhandled = {
            let mut ctx = ServerContext::new(&mut request, &mut response, self.local_addr, self.peer_addr);
            match self.core.handler().handle(&mut ctx).await {
                Ok(()) => false,
                Err(error) => {
                    let handled = self.core.observe_unhandled_error(&mut ctx, &error);
                    if !handled {
                        warn!(conn_id = self.shared.id, cause = %error, "unhandled handler error");
                    }
                    !handled
                }
            }
        };
        if unhandled {
            response = Response::internal_error();
        }

        self.write_response(&response, version).await?;

        let keep_alive = keep_alive_requested
            && self.core.state() == ServerState::Started
            && !unhandled
            && !self.shared.close_requested();
        Ok(keep_alive)
    }

    async fn read_body(&mut self, headers: &http::HeaderMap, length: u64) -> Result<ParsedBody, HttpError> {
        let config = self.core.config();
        let body_config = BodyConfig { spill_threshold: config.spill_threshold, form_encoding: config.form_encoding };
        let mut decoder = BodyDecoder::for_request(headers, length, &body_config)?;

        loop {
            if let Some(parsed) = decoder.decode(self.buffer.bytes_mut())? {
                return Ok(parsed);
            }

            let n = self.fill_read().await?;
            if n == 0 {
                let (expected, received) = decoder.progress();
                return Err(ProtocolError::IncompleteBody { expected, received }.into());
            }
        }
    }

    async fn send_continue(&mut self, version: Version) -> Result<(), HttpError> {
        let prelude = format!(
            "{} 100 Continue\r\nServer: {}\r\nDate: {}\r\n\r\n",
            version_str(version),
            self.core.config().banner,
            self.runtime.date.http_date(),
        );
        debug!(conn_id = self.shared.id, "sending 100 continue");
        self.write_all(prelude.as_bytes()).await
    }

    async fn write_response(&mut self, response: &Response, version: Version) -> Result<(), HttpError> {
        self.shared.set_state(ConnectionState::WritingHeaders);

        let write_buffer_size = self.core.config().write_buffer_size.max(1);
        let header_encoding = self.core.config().header_encoding;

        let mut head = BytesMut::with_capacity(write_buffer_size);
        ResponseEncoder::new(header_encoding).encode((response, version), &mut head)?;

        self.response_started = true;
        self.write_all(&head).await?;

        self.shared.set_state(ConnectionState::WritingContent);
        for chunk in response.body().chunks(write_buffer_size) {
            self.write_all(chunk).await?;
        }

        self.stream.flush().await.map_err(|source| HttpError::Send { source: SendError::Io { source } })?;
        Ok(())
    }

    async fn fill_read(&mut self) -> Result<usize, HttpError> {
        let guard = self.runtime.timeouts.read_queue.register(&self.shared.token, self.shared.id);
        let result = tokio::select! {
            biased;
            _ = self.shared.token.cancelled() => Err(HttpError::Disposed),
            filled = self.buffer.fill_from(&mut self.stream) => filled,
        };
        guard.complete();
        result
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), HttpError> {
        let guard = self.runtime.timeouts.write_queue.register(&self.shared.token, self.shared.id);
        let result = tokio::select! {
            biased;
            _ = self.shared.token.cancelled() => Err(HttpError::Disposed),
            written = self.stream.write_all(bytes) => {
                written.map_err(|source| HttpError::Send { source: SendError::Io { source } })
            }
        };
        guard.complete();
        result
    }

    /// Keep-alive reset: request-scoped artifacts are already gone with
    /// the request, only the buffer (with any pipelined bytes) survives.
    fn reset_for_next_request(&mut self) {
        self.buffer.reset();
        self.prolog_parsed = false;
        self.response_started = false;
    }

    async fn handle_failure(&mut self, error: HttpError) {
        match &error {
            HttpError::Disposed => debug!(conn_id = self.shared.id, "connection disposed"),
            error => debug!(conn_id = self.shared.id, cause = %error, "connection failed"),
        }

        // best-effort 500 once the request line was understood; failures
        // here are final
        if error.wants_error_response() && self.prolog_parsed && !self.response_started {
            let response = Response::internal_error();
            let version = self.version;
            if self.write_response(&response, version).await.is_err() {
                debug!(conn_id = self.shared.id, "error response could not be written");
            }
        }
    }
}

fn is_chunked(value: Option<&http::HeaderValue>) -> bool {
    value
        .and_then(|v| v.to_str().ok())
        .and_then(|encodings| encodings.rsplit(',').next())
        .map(|last_encoding| last_encoding.trim().eq_ignore_ascii_case("chunked"))
        .unwrap_or(false)
}

fn content_length(headers: &http::HeaderMap) -> Result<Option<u64>, ProtocolError> {
    let Some(value) = headers.get(http::header::CONTENT_LENGTH) else {
        return Ok(None);
    };

    let text = value.to_str().map_err(|_| ProtocolError::InvalidContentLength {
        reason: "not ascii".to_string(),
    })?;

    let length = text.trim().parse::<u64>().map_err(|_| ProtocolError::InvalidContentLength {
        reason: text.to_string(),
    })?;

    Ok(Some(length))
}
