use std::cmp;

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::codec::body::ParsedBody;
use crate::form::{self, TextEncoding};
use crate::protocol::HttpError;

/// Accumulates an `application/x-www-form-urlencoded` body in memory and
/// decodes it into the post-parameter multimap once complete.
pub struct FormDecoder {
    expected: u64,
    remaining: u64,
    data: Vec<u8>,
    encoding: TextEncoding,
}

impl FormDecoder {
    pub fn new(length: u64, encoding: TextEncoding) -> Self {
        // sized from the declared length, but never trust it for a large
        // up-front allocation
        let capacity = cmp::min(length, 64 * 1024) as usize;
        Self { expected: length, remaining: length, data: Vec::with_capacity(capacity), encoding }
    }

    pub fn progress(&self) -> (u64, u64) {
        (self.expected, self.expected - self.remaining)
    }
}

impl Decoder for FormDecoder {
    type Item = ParsedBody;
    type Error = HttpError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.remaining > 0 && !src.is_empty() {
            let take = cmp::min(self.remaining, src.len() as u64) as usize;
            self.data.extend_from_slice(&src.split_to(take));
            self.remaining -= take as u64;
        }

        if self.remaining > 0 {
            return Ok(None);
        }

        Ok(Some(ParsedBody::Form(form::parse_form(&self.data, self.encoding))))
    }
}
