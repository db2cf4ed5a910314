use std::cmp;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::protocol::{HttpError, ProtocolError};

const MIN_GROW: usize = 4 * 1024;

/// Growable byte buffer backing a sequential line reader.
///
/// Header parsing walks the buffer line by line through a consumed cursor;
/// body decoders take over the raw tail once the cursor has been reset.
pub struct ReadBuffer {
    buf: BytesMut,
    pos: usize,
    max_size: usize,
}

impl ReadBuffer {
    pub fn new(initial_size: usize, max_size: usize) -> Self {
        Self { buf: BytesMut::with_capacity(initial_size), pos: 0, max_size }
    }

    /// Issues one read into the free tail, doubling capacity on demand up to
    /// the hard maximum. Returns the number of bytes read; 0 means EOF and
    /// the caller must close.
    pub async fn fill_from<S>(&mut self, stream: &mut S) -> Result<usize, HttpError>
    where
        S: AsyncRead + Unpin,
    {
        if self.buf.len() >= self.max_size {
            return Err(ProtocolError::BufferOverflow { max_size: self.max_size }.into());
        }

        if self.buf.capacity() - self.buf.len() == 0 {
            let grow = cmp::min(cmp::max(self.buf.capacity(), MIN_GROW), self.max_size - self.buf.len());
            self.buf.reserve(grow);
        }

        let n = stream.read_buf(&mut self.buf).await.map_err(|source| HttpError::Io { source })?;
        Ok(n)
    }

    /// Returns the next LF-terminated line past the consumed cursor with the
    /// CRLF (or bare LF) stripped, or `None` when no complete line is
    /// buffered. A lone CR does not terminate a line. Bytes decode 1:1.
    pub fn read_line(&mut self) -> Option<String> {
        let start = self.pos;
        let nl = self.buf[start..].iter().position(|&b| b == b'\n')? + start;

        let mut end = nl;
        if end > start && self.buf[end - 1] == b'\r' {
            end -= 1;
        }

        let line = self.buf[start..end].iter().map(|&b| b as char).collect();
        self.pos = nl + 1;
        Some(line)
    }

    /// True iff unread bytes remain past the consumed cursor.
    pub fn data_available(&self) -> bool {
        self.pos < self.buf.len()
    }

    /// Drops the consumed prefix, retaining any unparsed tail.
    pub fn reset(&mut self) {
        self.buf.advance(self.pos);
        self.pos = 0;
    }

    /// The unconsumed bytes, for body decoders. Only meaningful after
    /// [`reset`](Self::reset) has dropped the consumed prefix.
    pub fn bytes_mut(&mut self) -> &mut BytesMut {
        debug_assert_eq!(self.pos, 0, "body decoding requires a reset cursor");
        &mut self.buf
    }

    pub fn unread_len(&self) -> usize {
        self.buf.len() - self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_with(bytes: &[u8]) -> ReadBuffer {
        let mut buffer = ReadBuffer::new(64, 1024);
        buffer.buf.extend_from_slice(bytes);
        buffer
    }

    #[test]
    fn reads_crlf_and_bare_lf_lines() {
        let mut buffer = buffer_with(b"GET / HTTP/1.1\r\nHost: h\npartial");

        assert_eq!(buffer.read_line().as_deref(), Some("GET / HTTP/1.1"));
        assert_eq!(buffer.read_line().as_deref(), Some("Host: h"));
        assert_eq!(buffer.read_line(), None);
        assert!(buffer.data_available());
    }

    #[test]
    fn lone_cr_is_not_a_terminator() {
        let mut buffer = buffer_with(b"abc\rdef");
        assert_eq!(buffer.read_line(), None);
    }

    #[test]
    fn empty_line_between_headers_and_body() {
        let mut buffer = buffer_with(b"\r\nBODY");
        assert_eq!(buffer.read_line().as_deref(), Some(""));
        assert_eq!(buffer.unread_len(), 4);
    }

    #[test]
    fn reset_drops_consumed_prefix_and_keeps_tail() {
        let mut buffer = buffer_with(b"line\r\ntail-bytes");
        buffer.read_line().unwrap();
        buffer.reset();

        assert_eq!(&buffer.bytes_mut()[..], b"tail-bytes");
        assert_eq!(buffer.unread_len(), 10);
    }

    #[tokio::test]
    async fn fill_reports_eof_as_zero() {
        let mut buffer = ReadBuffer::new(16, 1024);
        let mut stream: &[u8] = b"ab";

        assert_eq!(buffer.fill_from(&mut stream).await.unwrap(), 2);
        assert_eq!(buffer.fill_from(&mut stream).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fill_fails_past_hard_maximum() {
        let mut buffer = ReadBuffer::new(4, 8);
        let mut stream: &[u8] = b"0123456789abcdef";

        while buffer.buf.len() < 8 {
            buffer.fill_from(&mut stream).await.unwrap();
        }

        let err = buffer.fill_from(&mut stream).await.unwrap_err();
        assert!(matches!(
            err,
            HttpError::Protocol { source: ProtocolError::BufferOverflow { max_size: 8 } }
        ));
    }
}
