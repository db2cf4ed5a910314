mod form_decoder;
mod multipart_decoder;
mod opaque_decoder;

pub use form_decoder::FormDecoder;
pub use multipart_decoder::MultipartDecoder;
pub use opaque_decoder::OpaqueDecoder;

use bytes::BytesMut;
use http::HeaderMap;
use tokio_util::codec::Decoder;

use crate::form::TextEncoding;
use crate::protocol::{HttpError, MultipartItem, Params, ProtocolError};
use crate::spool::Spool;

/// Artifacts of a completed body parse, installed into the request.
#[derive(Debug)]
pub enum ParsedBody {
    Opaque(Spool),
    Form(Params),
    Multipart(Vec<MultipartItem>),
}

#[derive(Debug, Clone)]
pub struct BodyConfig {
    /// Bytes kept in memory per body or file part before spilling to disk.
    pub spill_threshold: usize,
    /// Encoding applied to urlencoded bodies without a charset label.
    pub form_encoding: TextEncoding,
}

impl Default for BodyConfig {
    fn default() -> Self {
        Self { spill_threshold: 64 * 1024, form_encoding: TextEncoding::Utf8 }
    }
}

/// Decoder for a request body of declared length.
///
/// Consumes exactly that many bytes across one or more decode steps and
/// yields the parsed artifacts; `Ok(None)` means more bytes are needed.
pub struct BodyDecoder {
    kind: Kind,
}

enum Kind {
    Opaque(OpaqueDecoder),
    Form(FormDecoder),
    Multipart(MultipartDecoder),
}

impl BodyDecoder {
    /// Picks the parser from the first `Content-Type` token. Unknown types
    /// fall back to the opaque parser. The connection has already refused
    /// chunked transfer-encoding by the time a length reaches here.
    pub fn for_request(headers: &HeaderMap, length: u64, config: &BodyConfig) -> Result<Self, ProtocolError> {
        let content_type = headers.get(http::header::CONTENT_TYPE).and_then(|v| v.to_str().ok()).unwrap_or("");
        let token = content_type.split(';').next().unwrap_or("").trim().to_ascii_lowercase();

        let kind = match token.as_str() {
            "application/x-www-form-urlencoded" => {
                let encoding = content_type_param(content_type, "charset")
                    .and_then(|label| TextEncoding::from_label(&label))
                    .unwrap_or(config.form_encoding);
                Kind::Form(FormDecoder::new(length, encoding))
            }
            "multipart/form-data" => {
                let boundary = content_type_param(content_type, "boundary").ok_or(ProtocolError::MissingBoundary)?;
                Kind::Multipart(MultipartDecoder::new(&boundary, length, config.spill_threshold))
            }
            _ => Kind::Opaque(OpaqueDecoder::new(length, config.spill_threshold)),
        };

        Ok(Self { kind })
    }

    /// Declared length and bytes consumed so far, for truncation reports.
    pub fn progress(&self) -> (u64, u64) {
        match &self.kind {
            Kind::Opaque(d) => d.progress(),
            Kind::Form(d) => d.progress(),
            Kind::Multipart(d) => d.progress(),
        }
    }
}

impl Decoder for BodyDecoder {
    type Item = ParsedBody;
    type Error = HttpError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match &mut self.kind {
            Kind::Opaque(decoder) => decoder.decode(src),
            Kind::Form(decoder) => decoder.decode(src),
            Kind::Multipart(decoder) => decoder.decode(src),
        }
    }
}

/// Extracts a `; name=value` parameter from a header value, unquoting if
/// needed.
pub(crate) fn content_type_param(value: &str, name: &str) -> Option<String> {
    for part in value.split(';').skip(1) {
        let Some((key, val)) = part.split_once('=') else {
            continue;
        };
        if key.trim().eq_ignore_ascii_case(name) {
            return Some(val.trim().trim_matches('"').to_string());
        }
    }
    None
}
