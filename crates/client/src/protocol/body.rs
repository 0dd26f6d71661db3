//! Request bodies and the upload reader that feeds them to the backend.

use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;

use bytes::{Bytes, BytesMut};

/// The payload of an outgoing request: nothing, an in-memory buffer, or a file
/// streamed from disk while the request is sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Body {
    #[default]
    Empty,
    Bytes(Bytes),
    File(PathBuf),
}

impl Body {
    pub fn file<P: Into<PathBuf>>(path: P) -> Self {
        Self::File(path.into())
    }

    /// True for [`Body::Empty`] and for an empty buffer. File bodies are never
    /// considered empty here, their length is only known once opened.
    pub fn is_empty(&self) -> bool {
        match self {
            Body::Empty => true,
            Body::Bytes(bytes) => bytes.is_empty(),
            Body::File(_) => false,
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes.into())
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Self::Bytes(s.into())
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Self::Bytes(Bytes::from_static(s.as_bytes()))
    }
}

impl From<&'static [u8]> for Body {
    fn from(bytes: &'static [u8]) -> Self {
        Self::Bytes(Bytes::from_static(bytes))
    }
}

/// Reads a [`Body`] in bounded chunks.
#[derive(Debug)]
pub(crate) enum Upload {
    Buffer { data: Bytes },
    File { file: File, remaining: u64 },
}

impl Upload {
    /// Opens the body for reading and reports its total length.
    pub(crate) fn open(body: &Body) -> io::Result<(Self, u64)> {
        match body {
            Body::Empty => Ok((Upload::Buffer { data: Bytes::new() }, 0)),
            Body::Bytes(bytes) => Ok((Upload::Buffer { data: bytes.clone() }, bytes.len() as u64)),
            Body::File(path) => {
                let file = File::open(path)?;
                let remaining = file.metadata()?.len();
                Ok((Upload::File { file, remaining }, remaining))
            }
        }
    }

    /// Returns the next chunk of at most `max` bytes, or `None` once the body is exhausted.
    pub(crate) fn next_chunk(&mut self, max: usize) -> io::Result<Option<Bytes>> {
        match self {
            Upload::Buffer { data } => {
                if data.is_empty() {
                    return Ok(None);
                }
                let len = max.min(data.len());
                Ok(Some(data.split_to(len)))
            }
            Upload::File { file, remaining } => {
                if *remaining == 0 {
                    return Ok(None);
                }
                let len = usize::try_from(*remaining).map_or(max, |remaining| remaining.min(max));
                let mut buf = BytesMut::zeroed(len);
                let read = file.read(&mut buf)?;
                if read == 0 {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "upload file shrank while sending"));
                }
                buf.truncate(read);
                *remaining -= read as u64;
                Ok(Some(buf.freeze()))
            }
        }
    }
}
