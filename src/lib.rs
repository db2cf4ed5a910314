//! Embeddable async HTTP/1.1 server library.
//!
//! A host program configures an endpoint, installs a request handler, and
//! starts the server; the library accepts connections (plain TCP or TLS),
//! parses requests including query strings, urlencoded forms, and
//! multipart uploads, invokes the handler, writes the response, and keeps
//! connections alive on request.
//!
//! ```no_run
//! use ember_http::{FnHandler, Server, ServerContext};
//!
//! # async fn run() -> Result<(), ember_http::ServerError> {
//! let mut server = Server::builder()
//!     .endpoint("127.0.0.1:8080".parse().unwrap())
//!     .handler(FnHandler(|ctx: &mut ServerContext<'_>| {
//!         let who = ctx.param("name").unwrap_or("world").to_string();
//!         ctx.response().write_str(&format!("hello, {who}"));
//!         Ok(())
//!     }))
//!     .build()?;
//!
//! server.start().await?;
//! # server.stop().await
//! # }
//! ```

pub mod buffer;
pub mod codec;
mod connection;
mod date;
pub mod escape;
pub mod form;
pub mod handler;
pub mod protocol;
pub mod server;
pub mod spool;
mod timeout;
pub mod tls;

pub use http;

pub use form::TextEncoding;
pub use handler::{FnHandler, RequestHandler, ServerContext};
pub use protocol::{
    BoxError, Cookie, HttpError, MultipartContent, MultipartItem, Params, ProtocolError, Request, RequestUrl,
    Response, SendError, ServerError,
};
pub use server::{Server, ServerBuilder, ServerConfig, ServerState};
pub use spool::Spool;
pub use tls::{TlsSettings, TlsVersion};
