mod cookie;
mod error;
mod multipart;
mod params;
mod request;
mod response;

pub use cookie::Cookie;
pub use error::{BoxError, HttpError, ProtocolError, SendError, ServerError};
pub use multipart::{MultipartContent, MultipartItem};
pub use params::Params;
pub use request::{Request, RequestUrl};
pub use response::Response;

use http::Version;

/// The only protocols this wire speaks.
pub(crate) fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    }
}
