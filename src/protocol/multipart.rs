use std::collections::HashMap;

use crate::spool::Spool;

/// One part of a `multipart/form-data` body.
///
/// Non-file parts carry their value inline as a decoded string; file parts
/// (a `filename` in the disposition) carry an open seekable stream.
#[derive(Debug)]
pub struct MultipartItem {
    headers: HashMap<String, String>,
    name: Option<String>,
    filename: Option<String>,
    content: MultipartContent,
}

#[derive(Debug)]
pub enum MultipartContent {
    Value(String),
    File(Spool),
}

impl MultipartItem {
    pub(crate) fn new(
        headers: HashMap<String, String>,
        name: Option<String>,
        filename: Option<String>,
        content: MultipartContent,
    ) -> Self {
        Self { headers, name, filename, content }
    }

    /// Part header lookup, names matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// The `name` parameter of the content disposition.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The `filename` parameter, present only for file parts.
    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    pub fn content(&self) -> &MultipartContent {
        &self.content
    }

    pub fn content_mut(&mut self) -> &mut MultipartContent {
        &mut self.content
    }

    /// The inline value for non-file parts.
    pub fn value(&self) -> Option<&str> {
        match &self.content {
            MultipartContent::Value(value) => Some(value),
            MultipartContent::File(_) => None,
        }
    }

    /// The open stream for file parts.
    pub fn file(&mut self) -> Option<&mut Spool> {
        match &mut self.content {
            MultipartContent::Value(_) => None,
            MultipartContent::File(spool) => Some(spool),
        }
    }
}
