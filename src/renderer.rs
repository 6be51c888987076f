//! Streaming message renderer
//!
//! The renderer walks the part tree of a message and produces its
//! on-wire form into a bounded buffer: cooked headers, multipart
//! boundaries, per-part headers with content-type sniffing and encoder
//! selection, and part bodies run through the selected transfer
//! encoder. The transport drains the buffer into the socket during the
//! DATA phase and refills it by calling [`Renderer::fill`].
//!
//! A renderer can run exactly once; body streams are consumed on the
//! way through and are not rewindable.

use std::io;

use crate::{
    encoding::{Base64Encoder, EncoderKind, QuotedPrintableEncoder},
    message::{
        source::{ByteSource, MemorySource, PushbackSource, SourceCell},
        BodyData, Message, Multipart, Part,
    },
};

/// Default capacity of the render buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 128 * 1024;

/// How many leading body bytes the content-type sniffer looks at.
const SNIFF_WINDOW: usize = 512;

/// RFC 2045 section 5.2 default when sniffing fails.
const FALLBACK_CONTENT_TYPE: &[u8] = b"text/plain; charset=us-ascii";

/// Errors the renderer can surface while producing message data.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("message renderers cannot be reused")]
    AlreadyRun,
    #[error("body stream was already consumed")]
    SourceConsumed,
    #[error("read error from body source: {0}")]
    Source(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    SimpleBody,
    Boundary,
    PartHeader,
    PartBody,
    Finished,
}

/// Stack frame for one nested multipart: the path of child indexes
/// leading to it and the iteration cursor over its children.
struct Frame {
    path: Vec<usize>,
    idx: usize,
}

/// The body source currently being drained into the buffer.
enum ActiveBody {
    Plain(Box<dyn ByteSource>),
    Base64(Base64Encoder),
    Qp(QuotedPrintableEncoder),
}

impl ActiveBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ActiveBody::Plain(src) => src.read(buf),
            ActiveBody::Base64(enc) => enc.read(buf),
            ActiveBody::Qp(enc) => enc.read(buf),
        }
    }

    fn at_end(&self) -> bool {
        match self {
            ActiveBody::Plain(src) => src.at_end(),
            ActiveBody::Base64(enc) => enc.at_end(),
            ActiveBody::Qp(enc) => enc.at_end(),
        }
    }

    /// Unwrap the encoder layer, recovering the underlying source.
    fn into_source(self) -> Box<dyn ByteSource> {
        match self {
            ActiveBody::Plain(src) => src,
            ActiveBody::Base64(enc) => Box::new(enc.into_inner()),
            ActiveBody::Qp(enc) => Box::new(enc.into_inner()),
        }
    }
}

struct Active {
    body: ActiveBody,
    auto_dispose: bool,
    /// Cell to hand a caller-owned stream back to on detach
    origin: Option<SourceCell>,
}

/// The leaf body scheduled between the PartHeader and PartBody states.
struct PendingBody {
    encoder: EncoderKind,
    data: PendingData,
}

enum PendingData {
    Bytes(Vec<u8>),
    Stream {
        /// Already taken out of the cell when sniffing needed a peek
        source: Option<PushbackSource>,
        cell: SourceCell,
        auto_dispose: bool,
    },
}

/// Pull-based serialiser for one queued message.
pub struct Renderer {
    state: State,
    message: Message,
    /// Body tree being walked; a bare MIME part body is wrapped into an
    /// implicit mixed multipart here
    root: Part,
    stack: Vec<Frame>,
    pending: Option<PendingBody>,
    active: Option<Active>,
    buf: Vec<u8>,
    rpos: usize,
    wpos: usize,
    line_width: usize,
    processed_chunks: usize,
    total_chunks: usize,
    started: bool,
}

impl Renderer {
    /// Create a renderer over `message` with the given buffer capacity
    /// and encoded-line width.
    pub fn new(message: &Message, buffer_size: usize, line_width: usize) -> Renderer {
        Renderer {
            state: State::Idle,
            message: message.clone(),
            root: Part::Null,
            stack: Vec::new(),
            pending: None,
            active: None,
            buf: vec![0; buffer_size.max(1)],
            rpos: 0,
            wpos: 0,
            line_width,
            processed_chunks: 0,
            total_chunks: 0,
            started: false,
        }
    }

    /// Capacity of the render buffer
    pub fn buffer_size(&self) -> usize {
        self.buf.len()
    }

    /// Bytes ready for the consumer
    pub fn bytes_available(&self) -> usize {
        self.wpos - self.rpos
    }

    /// The readable region; valid for [`bytes_available`](Self::bytes_available) bytes
    pub fn data(&self) -> &[u8] {
        &self.buf[self.rpos..self.wpos]
    }

    /// Advance the read cursor after consuming `n` bytes
    pub fn advance(&mut self, n: usize) {
        self.rpos = (self.rpos + n).min(self.wpos);
    }

    /// True once the whole message was produced and consumed
    pub fn at_end(&self) -> bool {
        self.state == State::Finished && self.active.is_none() && self.rpos >= self.wpos
    }

    /// Chunk progress: `(processed, total)`
    pub fn progress(&self) -> (usize, usize) {
        (self.processed_chunks, self.total_chunks)
    }

    /// Progress as a percentage, clamped to 100
    pub fn percent(&self) -> u8 {
        if self.total_chunks == 0 {
            return 0;
        }
        (self.processed_chunks * 100 / self.total_chunks).min(100) as u8
    }

    /// Start producing. Fails on reuse: the body streams have been
    /// consumed by the first run.
    pub fn run(&mut self) -> Result<(), RenderError> {
        if self.started {
            return Err(RenderError::AlreadyRun);
        }
        self.started = true;
        Ok(())
    }

    /// Cancel rendering: the active source is released, the buffer is
    /// reset and the renderer reports end of data.
    pub fn abort(&mut self) {
        if let Some(active) = self.active.take() {
            Renderer::release(active);
        }
        self.rpos = 0;
        self.wpos = 0;
        self.state = State::Finished;
        self.started = true;
    }

    /// Refill the buffer: drain the active source and step the state
    /// machine until data is available, the buffer is full, or the
    /// message is complete.
    pub fn fill(&mut self) -> Result<(), RenderError> {
        debug_assert!(self.started, "fill before run");
        loop {
            // the buffer drains fully between refill rounds
            if self.rpos >= self.wpos {
                self.rpos = 0;
                self.wpos = 0;
            }
            let free = self.buf.len() - self.wpos;
            if free == 0 {
                return Ok(());
            }

            if let Some(active) = &mut self.active {
                let n = active.body.read(&mut self.buf[self.wpos..])?;
                self.wpos += n;
                if active.body.at_end() {
                    let active = self.active.take().expect("active body");
                    Renderer::release(active);
                    self.processed_chunks += 1;
                }
                if n > 0 {
                    continue;
                }
                if self.active.is_some() {
                    // source produced nothing and is not at its end;
                    // hand back what is buffered so far
                    return Ok(());
                }
                continue;
            }

            if self.state == State::Finished {
                return Ok(());
            }
            self.process_state()?;
        }
    }

    /// Close or hand back the underlying source of a drained chunk.
    fn release(active: Active) {
        let mut source = active.body.into_source();
        if active.auto_dispose {
            source.close();
        } else if let Some(cell) = active.origin {
            cell.put_back(source);
        }
    }

    fn enqueue_bytes(&mut self, chunk: Vec<u8>) {
        self.active = Some(Active {
            body: ActiveBody::Plain(Box::new(MemorySource::new(chunk))),
            auto_dispose: true,
            origin: None,
        });
    }

    fn multipart_at(&self, path: &[usize]) -> &Multipart {
        let mut part = &self.root;
        for &i in path {
            part = match part {
                Part::Multipart(m) => &m.parts[i],
                _ => unreachable!("frame path points at a multipart"),
            };
        }
        match part {
            Part::Multipart(m) => m,
            _ => unreachable!("frame path points at a multipart"),
        }
    }

    /// Advance the state machine one step, queueing the next chunk.
    fn process_state(&mut self) -> Result<(), RenderError> {
        match self.state {
            State::Idle => self.enter_message(),
            State::SimpleBody => {
                let body = match &self.message.body {
                    Part::Body(part) => part.body.clone(),
                    // a null body renders as an empty line after the headers
                    _ => BodyData::Bytes(Vec::new()),
                };
                self.attach_body(body, EncoderKind::Passthrough)?;
                self.state = State::Finished;
                Ok(())
            }
            State::Boundary => {
                let frame = self.stack.last().expect("boundary needs a frame");
                let mp = self.multipart_at(&frame.path);
                let closing = frame.idx >= mp.parts.len();
                let chunk = boundary_chunk(mp, frame.idx);
                self.enqueue_bytes(chunk);

                if closing {
                    self.stack.pop();
                    match self.stack.last_mut() {
                        None => self.state = State::Finished,
                        Some(parent) => {
                            parent.idx += 1;
                            self.state = State::Boundary;
                        }
                    }
                } else {
                    self.state = State::PartHeader;
                }
                Ok(())
            }
            State::PartHeader => self.enter_part_header(),
            State::PartBody => {
                let pending = self.pending.take().expect("part body needs a pending body");
                match pending.data {
                    PendingData::Bytes(bytes) => {
                        self.attach_body(BodyData::Bytes(bytes), pending.encoder)?
                    }
                    PendingData::Stream {
                        source,
                        cell,
                        auto_dispose,
                    } => {
                        let source = match source {
                            Some(source) => source,
                            None => PushbackSource::new(
                                cell.take().ok_or(RenderError::SourceConsumed)?,
                            ),
                        };
                        self.attach_stream(source, cell, auto_dispose, pending.encoder);
                    }
                }
                self.state = State::Boundary;
                Ok(())
            }
            State::Finished => Ok(()),
        }
    }

    /// Produce the top-level header block and pick the body route.
    fn enter_message(&mut self) -> Result<(), RenderError> {
        self.root = match self.message.body.clone() {
            // every MIME message is structurally a multipart
            Part::Mime(part) => Part::Multipart(Multipart::mixed().part(part)),
            other => other,
        };

        match &self.root {
            Part::Multipart(mp) => {
                self.total_chunks = total_chunks(&self.root);
                self.processed_chunks = 0;

                let mut chunk = self.message.cook_headers_mime().render();
                chunk.extend_from_slice(&mp.cook_headers().render());
                chunk.extend_from_slice(b"\r\n");
                self.enqueue_bytes(chunk);

                self.stack.push(Frame {
                    path: Vec::new(),
                    idx: 0,
                });
                self.state = State::Boundary;
            }
            _ => {
                self.total_chunks = 2;
                self.processed_chunks = 0;

                let mut chunk = self.message.cook_headers().render();
                chunk.extend_from_slice(b"\r\n");
                self.enqueue_bytes(chunk);

                self.state = State::SimpleBody;
            }
        }
        Ok(())
    }

    /// Cook and queue the headers of the current child; for leaves this
    /// is where the content type is sniffed and the encoder chosen.
    fn enter_part_header(&mut self) -> Result<(), RenderError> {
        let frame = self.stack.last().expect("part header needs a frame");
        let path = frame.path.clone();
        let idx = frame.idx;
        let mut child_path = path.clone();
        child_path.push(idx);

        if let Part::Multipart(child) = &self.multipart_at(&path).parts[idx] {
            let mut chunk = child.cook_headers().render();
            chunk.extend_from_slice(b"\r\n");
            self.enqueue_bytes(chunk);
            self.stack.push(Frame {
                path: child_path,
                idx: 0,
            });
            self.state = State::Boundary;
            return Ok(());
        }

        // leaf part: the parent cursor moves on now so the next
        // Boundary round sees the following child
        self.stack.last_mut().expect("frame").idx += 1;

        let parent = self.multipart_at(&path);
        let leaf = match &parent.parts[idx] {
            Part::Mime(leaf) => leaf,
            _ => unreachable!("multipart children are mime parts or multiparts"),
        };

        let mut cooked = leaf.cook_headers();
        let encoder = leaf.encoder;
        let body = leaf.body.clone();

        // resolve the content type, sniffing the body when unset
        let mut taken_source = None;
        let content_type = if let Some(explicit) = cooked.value(b"Content-Type") {
            explicit.to_vec()
        } else {
            let sniffed = match &body {
                BodyData::Bytes(bytes) => {
                    sniff_content_type(&bytes[..bytes.len().min(SNIFF_WINDOW)])
                }
                BodyData::Stream { cell, .. } => {
                    let mut source = PushbackSource::new(
                        cell.take().ok_or(RenderError::SourceConsumed)?,
                    );
                    let window = source.peek(SNIFF_WINDOW)?.to_vec();
                    taken_source = Some(source);
                    sniff_content_type(&window)
                }
            };
            cooked.set("Content-Type", Some(sniffed.clone()));
            sniffed
        };

        let encoder = encoder.resolve(&content_type);
        if let Some(value) = encoder.header_value() {
            cooked.set("Content-Transfer-Encoding", Some(value.to_vec()));
        }

        self.pending = Some(PendingBody {
            encoder,
            data: match body {
                BodyData::Bytes(bytes) => PendingData::Bytes(bytes),
                BodyData::Stream { cell, auto_dispose } => PendingData::Stream {
                    source: taken_source,
                    cell,
                    auto_dispose,
                },
            },
        });

        let mut chunk = cooked.render();
        chunk.extend_from_slice(b"\r\n");
        self.enqueue_bytes(chunk);
        self.state = State::PartBody;
        Ok(())
    }

    /// Attach an in-memory or stream body through the chosen encoder.
    fn attach_body(&mut self, body: BodyData, encoder: EncoderKind) -> Result<(), RenderError> {
        match body {
            BodyData::Bytes(bytes) => {
                let source = PushbackSource::new(Box::new(MemorySource::new(bytes)));
                self.active = Some(Active {
                    body: wrap_encoder(source, encoder, self.line_width),
                    auto_dispose: true,
                    origin: None,
                });
            }
            BodyData::Stream { cell, auto_dispose } => {
                let source =
                    PushbackSource::new(cell.take().ok_or(RenderError::SourceConsumed)?);
                self.attach_stream(source, cell, auto_dispose, encoder);
            }
        }
        Ok(())
    }

    fn attach_stream(
        &mut self,
        source: PushbackSource,
        cell: SourceCell,
        auto_dispose: bool,
        encoder: EncoderKind,
    ) {
        self.active = Some(Active {
            body: wrap_encoder(source, encoder, self.line_width),
            auto_dispose,
            origin: (!auto_dispose).then_some(cell),
        });
    }
}

fn wrap_encoder(source: PushbackSource, encoder: EncoderKind, line_width: usize) -> ActiveBody {
    match encoder {
        EncoderKind::Passthrough => ActiveBody::Plain(Box::new(source)),
        EncoderKind::Base64 => ActiveBody::Base64(Base64Encoder::new(source, line_width)),
        EncoderKind::QuotedPrintable => {
            ActiveBody::Qp(QuotedPrintableEncoder::new(source, line_width))
        }
        EncoderKind::AutoDetect => {
            unreachable!("auto-detect is resolved before the body is attached")
        }
    }
}

/// `<opt-CRLF>--<token><opt-"--">\r\n`. The leading CRLF terminates the
/// body of a preceding leaf part; the `--` suffix closes the container.
fn boundary_chunk(mp: &Multipart, idx: usize) -> Vec<u8> {
    let mut out = Vec::new();
    if idx > 0 && mp.parts[idx - 1].is_mime_leaf() {
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"--");
    out.extend_from_slice(&mp.boundary);
    if idx >= mp.parts.len() {
        out.extend_from_slice(b"--");
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Number of buffer chunks a part tree will produce.
fn total_chunks(part: &Part) -> usize {
    match part {
        Part::Mime(_) => 1,
        Part::Multipart(mp) => {
            let children: usize = mp.parts.iter().map(|p| 2 + total_chunks(p)).sum();
            1 + children + 1
        }
        Part::Null | Part::Body(_) => 0,
    }
}

/// Content type from the freedesktop shared MIME database, with the
/// RFC 2045 fallback for unidentifiable content.
fn sniff_content_type(window: &[u8]) -> Vec<u8> {
    if window.is_empty() {
        return FALLBACK_CONTENT_TYPE.to_vec();
    }
    let detected = tree_magic_mini::from_u8(window);
    if detected.is_empty() {
        FALLBACK_CONTENT_TYPE.to_vec()
    } else {
        detected.as_bytes().to_vec()
    }
}
