use std::io;

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Malformed or unsupported request input.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("invalid request line: {line:?}")]
    InvalidProlog { line: String },

    #[error("invalid header line: {line:?}")]
    InvalidHeaderLine { line: String },

    #[error("invalid content-length header: {reason}")]
    InvalidContentLength { reason: String },

    #[error("chunked transfer-encoding is not supported")]
    UnsupportedTransferEncoding,

    #[error("unsupported expect header: {value:?}")]
    UnsupportedExpect { value: String },

    #[error("multipart content-type without boundary")]
    MissingBoundary,

    #[error("invalid multipart body: {reason}")]
    InvalidMultipart { reason: String },

    #[error("body ended after {received} of {expected} declared bytes")]
    IncompleteBody { expected: u64, received: u64 },

    #[error("read buffer exceeded {max_size} bytes")]
    BufferOverflow { max_size: usize },
}

/// Failure while serializing or writing a response.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("header {name:?} contains a line break")]
    InvalidHeaderValue { name: String },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

/// Anything that terminates a connection.
#[derive(Error, Debug)]
pub enum HttpError {
    #[error("request error: {source}")]
    Protocol {
        #[from]
        source: ProtocolError,
    },

    #[error("response error: {source}")]
    Send {
        #[from]
        source: SendError,
    },

    #[error("io error: {source}")]
    Io { source: io::Error },

    #[error("handler error: {source}")]
    Handler { source: BoxError },

    #[error("connection disposed")]
    Disposed,
}

impl From<io::Error> for HttpError {
    fn from(source: io::Error) -> Self {
        HttpError::Io { source }
    }
}

impl HttpError {
    /// True when a best-effort `500` response is still worth attempting:
    /// the request line was understood and the failure is not itself a
    /// broken or disposed socket.
    pub(crate) fn wants_error_response(&self) -> bool {
        matches!(self, HttpError::Protocol { .. } | HttpError::Handler { .. })
    }
}

/// Configuration-level failures surfaced from `start` and `stop`.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("server is already running")]
    AlreadyRunning,

    #[error("server is not running")]
    NotRunning,

    #[error("a request handler must be set")]
    MissingHandler,

    #[error("bind error: {source}")]
    Bind {
        #[from]
        source: io::Error,
    },

    #[error("tls configuration error: {reason}")]
    Tls { reason: String },
}
