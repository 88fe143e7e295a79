//! Line-oriented access to raw log object bodies.
//!
//! Edge logs arrive gzip-compressed. Detection goes by the gzip magic bytes,
//! not the object name, so a mislabelled object is still read correctly.

use flate2::read::MultiGzDecoder;
use std::io::{self, BufRead, BufReader, Cursor};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    None,
}

impl Compression {
    /// Pick the codec for an object body
    pub fn detect(name: &str, data: &[u8]) -> Self {
        if data.starts_with(&GZIP_MAGIC) {
            Compression::Gzip
        } else {
            if name.ends_with(".gz") && !data.is_empty() {
                tracing::warn!(name, "Object named as gzip has no gzip header; reading as plain text");
            }
            Compression::None
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Compression::Gzip => "gzip",
            Compression::None => "none",
        }
    }

    /// A buffered reader over the decompressed bytes
    pub fn reader<'a>(&self, data: &'a [u8]) -> Box<dyn BufRead + Send + 'a> {
        match self {
            Compression::Gzip => Box::new(BufReader::new(MultiGzDecoder::new(data))),
            Compression::None => Box::new(Cursor::new(data)),
        }
    }
}

/// Iterator over raw lines of a reader, each including its `\n` terminator
/// when present. Bytes are not interpreted.
pub struct RawLines<R> {
    reader: R,
}

impl<R: BufRead> RawLines<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R: BufRead> Iterator for RawLines<R> {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut line = Vec::new();
        match self.reader.read_until(b'\n', &mut line) {
            Ok(0) => None,
            Ok(_) => Some(Ok(line)),
            Err(e) => Some(Err(e)),
        }
    }
}

/// Strip a trailing `\n` or `\r\n`
pub fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
