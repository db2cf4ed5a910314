use std::cmp;
use std::io::Write;

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::codec::body::ParsedBody;
use crate::protocol::HttpError;
use crate::spool::Spool;

/// Streams a body of declared length into a spill buffer without any
/// content parsing.
pub struct OpaqueDecoder {
    expected: u64,
    remaining: u64,
    spool: Option<Spool>,
}

impl OpaqueDecoder {
    pub fn new(length: u64, spill_threshold: usize) -> Self {
        Self { expected: length, remaining: length, spool: Some(Spool::with_threshold(spill_threshold)) }
    }

    pub fn progress(&self) -> (u64, u64) {
        (self.expected, self.expected - self.remaining)
    }
}

impl Decoder for OpaqueDecoder {
    type Item = ParsedBody;
    type Error = HttpError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(spool) = self.spool.as_mut() else {
            return Ok(None);
        };

        if self.remaining > 0 && !src.is_empty() {
            let take = cmp::min(self.remaining, src.len() as u64) as usize;
            let chunk = src.split_to(take);
            spool.write_all(&chunk)?;
            self.remaining -= take as u64;
        }

        if self.remaining > 0 {
            return Ok(None);
        }

        let mut spool = self.spool.take().expect("checked above");
        spool.rewind()?;
        Ok(Some(ParsedBody::Opaque(spool)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumes_exactly_the_declared_length() {
        let mut decoder = OpaqueDecoder::new(10, 1024);
        let mut src = BytesMut::from(&b"0123456789pipelined"[..]);

        let ParsedBody::Opaque(mut spool) = decoder.decode(&mut src).unwrap().unwrap() else {
            panic!("expected opaque body");
        };

        assert_eq!(spool.contents().unwrap(), "0123456789");
        assert_eq!(&src[..], b"pipelined");
    }

    #[test]
    fn accumulates_across_chunks() {
        let mut decoder = OpaqueDecoder::new(6, 1024);

        let mut first = BytesMut::from(&b"abc"[..]);
        assert!(decoder.decode(&mut first).unwrap().is_none());
        assert_eq!(decoder.progress(), (6, 3));

        let mut second = BytesMut::from(&b"def"[..]);
        let ParsedBody::Opaque(mut spool) = decoder.decode(&mut second).unwrap().unwrap() else {
            panic!("expected opaque body");
        };
        assert_eq!(spool.contents().unwrap(), "abcdef");
    }

    #[test]
    fn zero_length_completes_immediately() {
        let mut decoder = OpaqueDecoder::new(0, 1024);
        let mut src = BytesMut::new();

        let ParsedBody::Opaque(spool) = decoder.decode(&mut src).unwrap().unwrap() else {
            panic!("expected opaque body");
        };
        assert!(spool.is_empty());
    }

    #[test]
    fn large_bodies_spill_to_disk() {
        let mut decoder = OpaqueDecoder::new(32, 8);
        let mut src = BytesMut::from(&[b'x'; 32][..]);

        let ParsedBody::Opaque(spool) = decoder.decode(&mut src).unwrap().unwrap() else {
            panic!("expected opaque body");
        };
        assert!(spool.is_spilled());
        assert_eq!(spool.len(), 32);
    }
}
