//! Byte sources feeding part bodies into the renderer
//!
//! A body is either an in-memory byte buffer or a read-once stream. The
//! [`ByteSource`] trait abstracts over both so the renderer and the
//! transfer encoders can pull from them uniformly. Sources handed to the
//! library are consumed exactly once and must not be mutated elsewhere
//! while a message referencing them is queued.

use std::{
    fs::File,
    io::{self, Read},
    path::Path,
    sync::{Arc, Mutex},
};

/// A sequential or random-access byte stream.
///
/// `read` returning `Ok(0)` together with `at_end()` signals end of
/// stream. Random-access sources report their end through position,
/// sequential ones flip `at_end` once the final byte was produced.
pub trait ByteSource: Send {
    /// Read up to `buf.len()` bytes into `buf`, returning the count.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// True once every byte has been produced.
    fn at_end(&self) -> bool;

    /// Sequential sources cannot seek and do not know their length.
    fn is_sequential(&self) -> bool {
        false
    }

    /// Upper bound on the remaining bytes, when knowable. Treat as a
    /// hint only.
    fn len_hint(&self) -> Option<u64> {
        None
    }

    /// Release underlying resources. Reading after close returns end of
    /// stream.
    fn close(&mut self) {}
}

/// An in-memory, random-access byte source.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    data: Vec<u8>,
    pos: usize,
}

impl MemorySource {
    pub fn new<B: Into<Vec<u8>>>(data: B) -> MemorySource {
        MemorySource {
            data: data.into(),
            pos: 0,
        }
    }
}

impl ByteSource for MemorySource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = &self.data[self.pos..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn len_hint(&self) -> Option<u64> {
        Some((self.data.len() - self.pos) as u64)
    }
}

/// A file-backed, random-access byte source.
///
/// The file is opened eagerly so that open errors surface when the
/// message is built rather than in the middle of the DATA phase.
#[derive(Debug)]
pub struct FileSource {
    file: Option<File>,
    remaining: u64,
}

impl FileSource {
    /// Open `path` for streaming
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<FileSource> {
        let file = File::open(path)?;
        let remaining = file.metadata()?.len();
        Ok(FileSource {
            file: Some(file),
            remaining,
        })
    }
}

impl ByteSource for FileSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let file = match &mut self.file {
            Some(file) => file,
            None => return Ok(0),
        };
        let max = (self.remaining.min(buf.len() as u64)) as usize;
        if max == 0 {
            return Ok(0);
        }
        let n = file.read(&mut buf[..max])?;
        self.remaining -= n as u64;
        Ok(n)
    }

    fn at_end(&self) -> bool {
        self.file.is_none() || self.remaining == 0
    }

    fn len_hint(&self) -> Option<u64> {
        Some(self.remaining)
    }

    fn close(&mut self) {
        self.file = None;
        self.remaining = 0;
    }
}

/// Shared handle to a read-once stream inside a part tree.
///
/// Cloning a message clones the tree but shares the stream, which keeps
/// the read-once contract intact. The renderer takes the source out of
/// the cell when the part body is reached and returns it only when the
/// part was built with `auto_dispose` off.
#[derive(Clone)]
pub struct SourceCell {
    inner: Arc<Mutex<Option<Box<dyn ByteSource>>>>,
}

impl SourceCell {
    pub(crate) fn new(source: Box<dyn ByteSource>) -> SourceCell {
        SourceCell {
            inner: Arc::new(Mutex::new(Some(source))),
        }
    }

    /// Take the source out of the cell; `None` if it was already consumed.
    pub(crate) fn take(&self) -> Option<Box<dyn ByteSource>> {
        self.inner.lock().expect("source cell poisoned").take()
    }

    /// Put a partially or fully consumed source back for the caller.
    pub(crate) fn put_back(&self, source: Box<dyn ByteSource>) {
        *self.inner.lock().expect("source cell poisoned") = Some(source);
    }
}

impl std::fmt::Debug for SourceCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let taken = self
            .inner
            .lock()
            .map(|guard| guard.is_none())
            .unwrap_or(true);
        f.debug_struct("SourceCell").field("taken", &taken).finish()
    }
}

/// Lookahead layer over a [`ByteSource`].
///
/// Adds the one-byte unget and bounded peek the quoted-printable encoder
/// and the content-type sniffer need, without requiring rewind support
/// from the underlying source: peeked bytes are buffered and served
/// before further reads.
pub struct PushbackSource {
    inner: Box<dyn ByteSource>,
    pending: Vec<u8>,
}

impl PushbackSource {
    pub fn new(inner: Box<dyn ByteSource>) -> PushbackSource {
        PushbackSource {
            inner,
            pending: Vec::new(),
        }
    }

    /// Read a single byte, `None` at end of stream.
    pub fn get(&mut self) -> io::Result<Option<u8>> {
        if let Some(&byte) = self.pending.first() {
            self.pending.remove(0);
            return Ok(Some(byte));
        }
        let mut byte = [0u8; 1];
        match self.inner.read(&mut byte)? {
            0 => Ok(None),
            _ => Ok(Some(byte[0])),
        }
    }

    /// Push a byte back; it is served before anything else.
    pub fn unget(&mut self, byte: u8) {
        self.pending.insert(0, byte);
    }

    /// Look at up to `want` upcoming bytes without consuming them. The
    /// returned slice is shorter than `want` only at end of stream.
    pub fn peek(&mut self, want: usize) -> io::Result<&[u8]> {
        while self.pending.len() < want && !self.inner.at_end() {
            let missing = want - self.pending.len();
            let mut chunk = vec![0u8; missing];
            let n = self.inner.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            self.pending.extend_from_slice(&chunk[..n]);
        }
        Ok(&self.pending[..self.pending.len().min(want)])
    }

    /// Recover the wrapped source, dropping buffered lookahead bytes.
    pub fn into_inner(self) -> Box<dyn ByteSource> {
        self.inner
    }
}

impl ByteSource for PushbackSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.pending.is_empty() {
            let n = self.pending.len().min(buf.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            return Ok(n);
        }
        self.inner.read(buf)
    }

    fn at_end(&self) -> bool {
        self.pending.is_empty() && self.inner.at_end()
    }

    fn is_sequential(&self) -> bool {
        self.inner.is_sequential()
    }

    fn len_hint(&self) -> Option<u64> {
        self.inner
            .len_hint()
            .map(|n| n + self.pending.len() as u64)
    }

    fn close(&mut self) {
        self.pending.clear();
        self.inner.close();
    }
}
