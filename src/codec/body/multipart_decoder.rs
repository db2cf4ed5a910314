use std::cmp;
use std::collections::HashMap;
use std::io::Write;

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::codec::body::{content_type_param, ParsedBody};
use crate::form::TextEncoding;
use crate::protocol::{HttpError, MultipartContent, MultipartItem, ProtocolError};
use crate::spool::Spool;

/// Streaming `multipart/form-data` decoder.
///
/// Splits the declared-length body on the client's boundary. Parts with a
/// `filename` disposition stream into a spill buffer; other parts collect
/// in memory and decode with the part's charset (UTF-8 default). Bytes
/// after the terminating boundary are consumed up to the declared length
/// and discarded.
pub struct MultipartDecoder {
    delimiter: Vec<u8>,
    data_delimiter: Vec<u8>,
    expected: u64,
    remaining: u64,
    spill_threshold: usize,
    state: State,
    items: Vec<MultipartItem>,
    part: Option<PartInProgress>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Preamble,
    BoundaryTail,
    PartHeaders,
    PartData,
    Epilogue,
    Done,
}

impl MultipartDecoder {
    pub fn new(boundary: &str, length: u64, spill_threshold: usize) -> Self {
        let delimiter = format!("--{boundary}").into_bytes();
        let data_delimiter = format!("\r\n--{boundary}").into_bytes();
        Self {
            delimiter,
            data_delimiter,
            expected: length,
            remaining: length,
            spill_threshold,
            state: State::Preamble,
            items: Vec::new(),
            part: None,
        }
    }

    pub fn progress(&self) -> (u64, u64) {
        (self.expected, self.expected - self.remaining)
    }

    fn consume(&mut self, src: &mut BytesMut, n: usize) {
        let _ = src.split_to(n);
        self.remaining -= n as u64;
    }

    fn write_content(&mut self, bytes: &[u8]) -> Result<(), HttpError> {
        self.part.as_mut().expect("content follows part headers").write(bytes)?;
        Ok(())
    }

    fn finish_part(&mut self) -> Result<(), HttpError> {
        let part = self.part.take().expect("part in progress");
        self.items.push(part.finish()?);
        Ok(())
    }

    fn malformed(&self, reason: &str) -> HttpError {
        ProtocolError::InvalidMultipart { reason: reason.to_string() }.into()
    }
}

impl Decoder for MultipartDecoder {
    type Item = ParsedBody;
    type Error = HttpError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let budget = cmp::min(self.remaining, src.len() as u64) as usize;
            // every declared byte is buffered; waiting for more is pointless
            let exhausted = budget as u64 == self.remaining;

            match self.state {
                State::Done => return Ok(None),

                State::Epilogue => {
                    self.consume(src, budget);
                    if self.remaining > 0 {
                        return Ok(None);
                    }
                    self.state = State::Done;
                    return Ok(Some(ParsedBody::Multipart(std::mem::take(&mut self.items))));
                }

                State::Preamble => match find(&src[..budget], &self.delimiter) {
                    Some(pos) => {
                        self.consume(src, pos + self.delimiter.len());
                        self.state = State::BoundaryTail;
                    }
                    None => {
                        if exhausted {
                            return Err(self.malformed("opening boundary not found"));
                        }
                        let keep = cmp::min(self.delimiter.len() - 1, budget);
                        self.consume(src, budget - keep);
                        return Ok(None);
                    }
                },

                State::BoundaryTail => {
                    let avail = &src[..budget];
                    match avail.first() {
                        None => {
                            if exhausted {
                                return Err(self.malformed("body ends at a boundary"));
                            }
                            return Ok(None);
                        }
                        Some(b'-') => {
                            if avail.len() < 2 {
                                if exhausted {
                                    return Err(self.malformed("body ends at a boundary"));
                                }
                                return Ok(None);
                            }
                            if avail[1] != b'-' {
                                return Err(self.malformed("malformed boundary terminator"));
                            }
                            self.consume(src, 2);
                            self.state = State::Epilogue;
                        }
                        Some(b'\r') => {
                            if avail.len() < 2 {
                                if exhausted {
                                    return Err(self.malformed("body ends at a boundary"));
                                }
                                return Ok(None);
                            }
                            if avail[1] != b'\n' {
                                return Err(self.malformed("boundary not followed by CRLF"));
                            }
                            self.consume(src, 2);
                            self.state = State::PartHeaders;
                        }
                        Some(b'\n') => {
                            self.consume(src, 1);
                            self.state = State::PartHeaders;
                        }
                        Some(_) => return Err(self.malformed("boundary not followed by CRLF")),
                    }
                }

                State::PartHeaders => {
                    if self.part.is_none() {
                        self.part = Some(PartInProgress::default());
                    }

                    match src[..budget].iter().position(|&b| b == b'\n') {
                        Some(nl) => {
                            let mut end = nl;
                            if end > 0 && src[end - 1] == b'\r' {
                                end -= 1;
                            }
                            let line: String = src[..end].iter().map(|&b| b as char).collect();
                            self.consume(src, nl + 1);

                            if line.is_empty() {
                                let part = self.part.as_mut().expect("created above");
                                part.begin_content(self.spill_threshold);
                                self.state = State::PartData;
                            } else {
                                self.part.as_mut().expect("created above").add_header(&line)?;
                            }
                        }
                        None => {
                            if exhausted {
                                return Err(self.malformed("body ends inside part headers"));
                            }
                            return Ok(None);
                        }
                    }
                }

                State::PartData => match find(&src[..budget], &self.data_delimiter) {
                    Some(pos) => {
                        let content = src.split_to(pos);
                        self.remaining -= pos as u64;
                        self.write_content(&content)?;
                        self.consume(src, self.data_delimiter.len());
                        self.finish_part()?;
                        self.state = State::BoundaryTail;
                    }
                    None => {
                        if exhausted {
                            return Err(self.malformed("terminating boundary not found"));
                        }
                        // hold back a possible delimiter prefix
                        let keep = cmp::min(self.data_delimiter.len() - 1, budget);
                        let flush = budget - keep;
                        if flush > 0 {
                            let content = src.split_to(flush);
                            self.remaining -= flush as u64;
                            self.write_content(&content)?;
                        }
                        return Ok(None);
                    }
                },
            }
        }
    }
}

#[derive(Default)]
struct PartInProgress {
    headers: HashMap<String, String>,
    name: Option<String>,
    filename: Option<String>,
    content: Option<PartContent>,
}

enum PartContent {
    Value(Vec<u8>),
    File(Spool),
}

impl PartInProgress {
    fn add_header(&mut self, line: &str) -> Result<(), HttpError> {
        let (name, value) = line.split_once(':').ok_or_else(|| ProtocolError::InvalidMultipart {
            reason: format!("part header without colon: {line:?}"),
        })?;

        let name = name.trim().to_ascii_lowercase();
        let value = value.trim().to_string();

        if name == "content-disposition" {
            self.name = content_type_param(&value, "name");
            self.filename = content_type_param(&value, "filename");
        }

        self.headers.insert(name, value);
        Ok(())
    }

    fn begin_content(&mut self, spill_threshold: usize) {
        self.content = Some(if self.filename.is_some() {
            PartContent::File(Spool::with_threshold(spill_threshold))
        } else {
            PartContent::Value(Vec::new())
        });
    }

    fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        match self.content.as_mut().expect("begin_content ran") {
            PartContent::Value(data) => {
                data.extend_from_slice(bytes);
                Ok(())
            }
            PartContent::File(spool) => spool.write_all(bytes),
        }
    }

    fn finish(self) -> Result<MultipartItem, HttpError> {
        let content = match self.content.expect("begin_content ran") {
            PartContent::Value(data) => {
                let encoding = self
                    .headers
                    .get("content-type")
                    .and_then(|ct| content_type_param(ct, "charset"))
                    .and_then(|label| TextEncoding::from_label(&label))
                    .unwrap_or(TextEncoding::Utf8);
                MultipartContent::Value(encoding.decode(&data))
            }
            PartContent::File(mut spool) => {
                spool.rewind().map_err(|source| HttpError::Io { source })?;
                MultipartContent::File(spool)
            }
        };

        Ok(MultipartItem::new(self.headers, self.name, self.filename, content))
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(boundary: &str, body: &[u8]) -> Result<Vec<MultipartItem>, HttpError> {
        let mut decoder = MultipartDecoder::new(boundary, body.len() as u64, 1024);
        let mut src = BytesMut::from(body);
        match decoder.decode(&mut src)? {
            Some(ParsedBody::Multipart(items)) => Ok(items),
            Some(_) => unreachable!(),
            None => panic!("decoder wanted more than the declared length"),
        }
    }

    #[test]
    fn single_file_part_upload() {
        let body = b"--XYZ\r\n\
            Content-Disposition: form-data; name=\"f\"; filename=\"x.txt\"\r\n\
            Content-Type: text/plain\r\n\
            \r\n\
            HELLO\r\n\
            --XYZ--\r\n";

        let mut items = decode_all("XYZ", body).unwrap();
        assert_eq!(items.len(), 1);

        let item = &mut items[0];
        assert_eq!(item.name(), Some("f"));
        assert_eq!(item.filename(), Some("x.txt"));
        assert_eq!(item.header("content-type"), Some("text/plain"));
        assert!(item.header("Content-Disposition").unwrap().contains("form-data"));

        let mut content = String::new();
        std::io::Read::read_to_string(item.file().unwrap(), &mut content).unwrap();
        assert_eq!(content, "HELLO");
    }

    #[test]
    fn mixed_value_and_file_parts() {
        let body = b"--B\r\n\
            Content-Disposition: form-data; name=\"field\"\r\n\
            \r\n\
            plain value\r\n\
            --B\r\n\
            Content-Disposition: form-data; name=\"upload\"; filename=\"a.bin\"\r\n\
            \r\n\
            \x00\x01\x02\r\n\
            --B--\r\n";

        let items = decode_all("B", body).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].value(), Some("plain value"));
        assert!(items[1].value().is_none());
    }

    // Pinned vectors: the part charset governs value decoding, UTF-8
    // otherwise.
    #[test]
    fn part_charset_governs_value_decoding() {
        let body = b"--B\r\n\
            Content-Disposition: form-data; name=\"l\"\r\n\
            Content-Type: text/plain; charset=latin1\r\n\
            \r\n\
            caf\xE9\r\n\
            --B\r\n\
            Content-Disposition: form-data; name=\"u\"\r\n\
            \r\n\
            caf\xC3\xA9\r\n\
            --B--\r\n";

        let items = decode_all("B", body).unwrap();
        assert_eq!(items[0].value(), Some("café"));
        assert_eq!(items[1].value(), Some("café"));
    }

    #[test]
    fn value_may_contain_boundary_lookalikes() {
        let body = b"--B\r\n\
            Content-Disposition: form-data; name=\"v\"\r\n\
            \r\n\
            --B-- without its own line is data, as is \n--B with a bare LF\r\n\
            --B--\r\n";

        let items = decode_all("B", body).unwrap();
        assert_eq!(
            items[0].value(),
            Some("--B-- without its own line is data, as is \n--B with a bare LF")
        );
    }

    #[test]
    fn empty_form_terminates_without_parts() {
        let items = decode_all("B", b"--B--\r\n").unwrap();
        assert!(items.is_empty());
    }

    #[test]
    fn epilogue_bytes_are_consumed() {
        let body = b"--B\r\n\
            Content-Disposition: form-data; name=\"v\"\r\n\
            \r\n\
            x\r\n\
            --B--\r\n\
            trailing epilogue";

        let items = decode_all("B", body).unwrap();
        assert_eq!(items[0].value(), Some("x"));
    }

    #[test]
    fn missing_terminator_is_rejected() {
        let body = b"--B\r\n\
            Content-Disposition: form-data; name=\"v\"\r\n\
            \r\n\
            dangling";

        let mut decoder = MultipartDecoder::new("B", body.len() as u64, 1024);
        let mut src = BytesMut::from(&body[..]);
        let result = decoder.decode(&mut src);
        assert!(matches!(
            result,
            Err(HttpError::Protocol { source: ProtocolError::InvalidMultipart { .. } })
        ));
    }

    // Same parse regardless of how the bytes are chunked.
    #[test]
    fn decode_is_invariant_under_chunking() {
        let body: &[u8] = b"--XYZ\r\n\
            Content-Disposition: form-data; name=\"f\"; filename=\"x.txt\"\r\n\
            Content-Type: text/plain\r\n\
            \r\n\
            HELLO\r\n\
            --XYZ--\r\n";

        for chunk_size in 1..=body.len() {
            let mut decoder = MultipartDecoder::new("XYZ", body.len() as u64, 1024);
            let mut src = BytesMut::new();
            let mut result = None;

            for chunk in body.chunks(chunk_size) {
                src.extend_from_slice(chunk);
                if let Some(parsed) = decoder.decode(&mut src).unwrap() {
                    result = Some(parsed);
                    break;
                }
            }

            let Some(ParsedBody::Multipart(mut items)) = result else {
                panic!("no parse at chunk size {chunk_size}");
            };
            assert_eq!(items.len(), 1);
            let mut content = String::new();
            std::io::Read::read_to_string(items[0].file().unwrap(), &mut content).unwrap();
            assert_eq!(content, "HELLO", "chunk size {chunk_size}");
        }
    }
}
