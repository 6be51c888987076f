//! MIME part tree
//!
//! A message body is a [`Part`]: nothing at all, a bare body, a single
//! MIME part, or a multipart container of further parts. Multiparts may
//! only contain MIME parts and other multiparts.

use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use uuid::Uuid;

use crate::{
    encoding::EncoderKind,
    headers::Headers,
    message::source::{ByteSource, FileSource, SourceCell},
    rfc,
};

/// RFC 3986 unreserved characters stay literal in `filename*` values
const FILENAME_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// One node of a message body tree.
#[derive(Debug, Clone, Default)]
pub enum Part {
    /// No body at all
    #[default]
    Null,
    /// A raw body without MIME headers
    Body(BodyPart),
    /// A single MIME part
    Mime(MimePart),
    /// A container of MIME parts separated by a boundary
    Multipart(Multipart),
}

impl Part {
    pub fn is_null(&self) -> bool {
        matches!(self, Part::Null)
    }

    pub(crate) fn is_mime_leaf(&self) -> bool {
        matches!(self, Part::Mime(_))
    }
}

impl From<BodyPart> for Part {
    fn from(part: BodyPart) -> Part {
        Part::Body(part)
    }
}

impl From<MimePart> for Part {
    fn from(part: MimePart) -> Part {
        Part::Mime(part)
    }
}

impl From<Multipart> for Part {
    fn from(part: Multipart) -> Part {
        Part::Multipart(part)
    }
}

/// Content bytes of a body or MIME part: an owned buffer or a
/// read-once stream.
#[derive(Debug, Clone)]
pub enum BodyData {
    /// In-memory content
    Bytes(Vec<u8>),
    /// Streamed content; `auto_dispose` controls whether the stream is
    /// closed after the transport consumed it
    Stream {
        cell: SourceCell,
        auto_dispose: bool,
    },
}

impl Default for BodyData {
    fn default() -> BodyData {
        BodyData::Bytes(Vec::new())
    }
}

impl BodyData {
    pub(crate) fn from_source(source: Box<dyn ByteSource>, auto_dispose: bool) -> BodyData {
        BodyData::Stream {
            cell: SourceCell::new(source),
            auto_dispose,
        }
    }
}

/// A message body without any MIME structure.
#[derive(Debug, Clone, Default)]
pub struct BodyPart {
    pub(crate) body: BodyData,
}

impl BodyPart {
    /// Body from an in-memory buffer
    pub fn new<B: Into<Vec<u8>>>(body: B) -> BodyPart {
        BodyPart {
            body: BodyData::Bytes(body.into()),
        }
    }

    /// Body from a byte stream
    pub fn from_source(source: Box<dyn ByteSource>, auto_dispose: bool) -> BodyPart {
        BodyPart {
            body: BodyData::from_source(source, auto_dispose),
        }
    }
}

/// Content disposition of a MIME part, RFC 2183.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Disposition {
    #[default]
    Inline,
    Attachment,
}

/// A leaf MIME part: headers plus a body run through a transfer encoder.
#[derive(Debug, Clone, Default)]
pub struct MimePart {
    pub(crate) headers: Headers,
    pub(crate) body: BodyData,
    pub(crate) content_type: Vec<u8>,
    pub(crate) content_id: Vec<u8>,
    pub(crate) content_encoding: Vec<u8>,
    pub(crate) content_description: String,
    pub(crate) disposition: Disposition,
    pub(crate) filename: String,
    pub(crate) create_date: Option<DateTime<Utc>>,
    pub(crate) modification_date: Option<DateTime<Utc>>,
    pub(crate) read_date: Option<DateTime<Utc>>,
    pub(crate) size: i64,
    pub(crate) encoder: EncoderKind,
}

impl MimePart {
    /// Start building a part
    pub fn builder() -> MimePartBuilder {
        MimePartBuilder {
            part: MimePart::default(),
        }
    }

    /// A `text/plain` UTF-8 part
    pub fn text<S: Into<String>>(body: S) -> MimePart {
        MimePart::builder()
            .content_type("text/plain; charset=utf-8")
            .body(body.into().into_bytes())
    }

    /// A file attachment: streamed from disk, named after the file,
    /// disposed of once sent.
    pub fn attachment<P: AsRef<std::path::Path>>(path: P) -> std::io::Result<MimePart> {
        let path = path.as_ref();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let source = FileSource::open(path)?;
        let size = source.len_hint().map(|n| n as i64).unwrap_or(-1);
        Ok(MimePart::builder()
            .disposition(Disposition::Attachment)
            .filename(filename)
            .size(size)
            .body_source(Box::new(source), true))
    }

    /// Cook the on-wire headers for this part, except for the sniffed
    /// content type and encoder override which the renderer applies.
    pub(crate) fn cook_headers(&self) -> Headers {
        let mut cooked = self.headers.clone();
        if !self.content_type.is_empty() {
            cooked.set("Content-Type", Some(self.content_type.clone()));
        }
        cook_common(
            &mut cooked,
            &self.content_id,
            &self.content_encoding,
            &self.content_description,
            self.disposition,
            &self.filename,
            self.create_date,
            self.modification_date,
            self.read_date,
            self.size,
        );
        cooked
    }
}

/// Builder for [`MimePart`]
#[derive(Debug, Clone, Default)]
pub struct MimePartBuilder {
    part: MimePart,
}

impl MimePartBuilder {
    /// Set a raw header on the part
    pub fn header<N: Into<Vec<u8>>, V: Into<Vec<u8>>>(mut self, name: N, value: V) -> Self {
        self.part.headers.append(name, value);
        self
    }

    /// Set the content type; when unset, the type is sniffed from the
    /// body bytes
    pub fn content_type<V: Into<Vec<u8>>>(mut self, value: V) -> Self {
        self.part.content_type = value.into();
        self
    }

    /// Set the `Content-ID`
    pub fn content_id<V: Into<Vec<u8>>>(mut self, value: V) -> Self {
        self.part.content_id = value.into();
        self
    }

    /// Set an explicit `Content-transfer-encoding` attribute
    pub fn content_encoding<V: Into<Vec<u8>>>(mut self, value: V) -> Self {
        self.part.content_encoding = value.into();
        self
    }

    /// Set the `Content-Description`
    pub fn description<S: Into<String>>(mut self, value: S) -> Self {
        self.part.content_description = value.into();
        self
    }

    /// Set the disposition keyword
    pub fn disposition(mut self, disposition: Disposition) -> Self {
        self.part.disposition = disposition;
        self
    }

    /// Set the disposition filename
    pub fn filename<S: Into<String>>(mut self, filename: S) -> Self {
        self.part.filename = filename.into();
        self
    }

    /// Set the disposition creation date
    pub fn create_date(mut self, date: DateTime<Utc>) -> Self {
        self.part.create_date = Some(date);
        self
    }

    /// Set the disposition modification date
    pub fn modification_date(mut self, date: DateTime<Utc>) -> Self {
        self.part.modification_date = Some(date);
        self
    }

    /// Set the disposition read date
    pub fn read_date(mut self, date: DateTime<Utc>) -> Self {
        self.part.read_date = Some(date);
        self
    }

    /// Set the disposition size; values `<= 0` mean unknown
    pub fn size(mut self, size: i64) -> Self {
        self.part.size = size;
        self
    }

    /// Select the transfer encoder
    pub fn encoder(mut self, encoder: EncoderKind) -> Self {
        self.part.encoder = encoder;
        self
    }

    /// Finish the part with an in-memory body
    pub fn body<B: Into<Vec<u8>>>(mut self, body: B) -> MimePart {
        self.part.body = BodyData::Bytes(body.into());
        self.part
    }

    /// Finish the part with a streamed body
    pub fn body_source(mut self, source: Box<dyn ByteSource>, auto_dispose: bool) -> MimePart {
        self.part.body = BodyData::from_source(source, auto_dispose);
        self.part
    }
}

/// The multipart container subtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MultipartKind {
    #[default]
    Mixed,
    Alternative,
    Digest,
    Parallel,
}

impl MultipartKind {
    fn subtype(self) -> &'static str {
        match self {
            MultipartKind::Mixed => "mixed",
            MultipartKind::Alternative => "alternative",
            MultipartKind::Digest => "digest",
            MultipartKind::Parallel => "parallel",
        }
    }
}

/// A multipart container. Children are separated by the boundary token
/// and may only be MIME parts or further multiparts.
///
/// Multiparts carry the same content attributes as leaf parts; the
/// `Content-Type` however is always derived from the kind and boundary.
#[derive(Debug, Clone)]
pub struct Multipart {
    pub(crate) headers: Headers,
    pub(crate) kind: MultipartKind,
    pub(crate) boundary: Vec<u8>,
    pub(crate) parts: Vec<Part>,
    pub(crate) content_id: Vec<u8>,
    pub(crate) content_encoding: Vec<u8>,
    pub(crate) content_description: String,
    pub(crate) disposition: Disposition,
    pub(crate) filename: String,
    pub(crate) create_date: Option<DateTime<Utc>>,
    pub(crate) modification_date: Option<DateTime<Utc>>,
    pub(crate) read_date: Option<DateTime<Utc>>,
    pub(crate) size: i64,
}

impl Default for Multipart {
    fn default() -> Multipart {
        Multipart::new(MultipartKind::Mixed)
    }
}

impl Multipart {
    /// An empty container of the given kind with a fresh boundary
    pub fn new(kind: MultipartKind) -> Multipart {
        Multipart {
            headers: Headers::new(),
            kind,
            boundary: make_boundary(),
            parts: Vec::new(),
            content_id: Vec::new(),
            content_encoding: Vec::new(),
            content_description: String::new(),
            disposition: Disposition::default(),
            filename: String::new(),
            create_date: None,
            modification_date: None,
            read_date: None,
            size: 0,
        }
    }

    /// Shortcut for `Multipart::new(MultipartKind::Mixed)`
    pub fn mixed() -> Multipart {
        Multipart::new(MultipartKind::Mixed)
    }

    /// Shortcut for `Multipart::new(MultipartKind::Alternative)`
    pub fn alternative() -> Multipart {
        Multipart::new(MultipartKind::Alternative)
    }

    /// Shortcut for `Multipart::new(MultipartKind::Digest)`
    pub fn digest() -> Multipart {
        Multipart::new(MultipartKind::Digest)
    }

    /// Shortcut for `Multipart::new(MultipartKind::Parallel)`
    pub fn parallel() -> Multipart {
        Multipart::new(MultipartKind::Parallel)
    }

    /// Override the generated boundary token
    pub fn boundary<B: Into<Vec<u8>>>(mut self, boundary: B) -> Self {
        self.boundary = boundary.into();
        self
    }

    /// Set a raw header on the container
    pub fn header<N: Into<Vec<u8>>, V: Into<Vec<u8>>>(mut self, name: N, value: V) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Append a MIME part child
    pub fn part(mut self, part: MimePart) -> Self {
        self.parts.push(Part::Mime(part));
        self
    }

    /// Append a nested multipart child
    pub fn multipart(mut self, part: Multipart) -> Self {
        self.parts.push(Part::Multipart(part));
        self
    }

    /// Set the `Content-ID`
    pub fn content_id<V: Into<Vec<u8>>>(mut self, value: V) -> Self {
        self.content_id = value.into();
        self
    }

    /// Set the `Content-Description`
    pub fn description<S: Into<String>>(mut self, value: S) -> Self {
        self.content_description = value.into();
        self
    }

    /// Set the disposition keyword
    pub fn disposition(mut self, disposition: Disposition) -> Self {
        self.disposition = disposition;
        self
    }

    /// Cook the on-wire headers for this container.
    pub(crate) fn cook_headers(&self) -> Headers {
        let mut cooked = self.headers.clone();
        let mut ctype = format!("multipart/{}; boundary=\"", self.kind.subtype()).into_bytes();
        ctype.extend_from_slice(&self.boundary);
        ctype.push(b'"');
        cooked.set("Content-Type", Some(ctype));
        cook_common(
            &mut cooked,
            &self.content_id,
            &self.content_encoding,
            &self.content_description,
            self.disposition,
            &self.filename,
            self.create_date,
            self.modification_date,
            self.read_date,
            self.size,
        );
        cooked
    }
}

/// A fresh boundary token, distinct per multipart instance.
fn make_boundary() -> Vec<u8> {
    Uuid::new_v4().simple().to_string().into_bytes()
}

/// The disposition and content attributes shared by parts.
#[allow(clippy::too_many_arguments)]
fn cook_common(
    cooked: &mut Headers,
    content_id: &[u8],
    content_encoding: &[u8],
    content_description: &str,
    disposition: Disposition,
    filename: &str,
    create_date: Option<DateTime<Utc>>,
    modification_date: Option<DateTime<Utc>>,
    read_date: Option<DateTime<Utc>>,
    size: i64,
) {
    if !content_id.is_empty() {
        cooked.set("Content-ID", Some(content_id.to_vec()));
    }
    if !content_encoding.is_empty() {
        cooked.set("Content-transfer-encoding", Some(content_encoding.to_vec()));
    }
    if !content_description.is_empty() {
        cooked.set(
            "Content-Description",
            Some(rfc::to_encoded_words(content_description).into_bytes()),
        );
    }

    let mut value: Vec<u8> = match disposition {
        Disposition::Inline => b"inline".to_vec(),
        Disposition::Attachment => b"attachment".to_vec(),
    };
    for (name, date) in [
        ("creation-date", create_date),
        ("modification-date", modification_date),
        ("read-date", read_date),
    ] {
        if let Some(date) = date {
            value.extend_from_slice(
                format!(";\r\n\t{}=\"{}\"", name, rfc::rfc2822_date(date)).as_bytes(),
            );
        }
    }
    if size > 0 {
        value.extend_from_slice(format!(";\r\n\tsize={size}").as_bytes());
    }
    if !filename.is_empty() {
        let encoded = utf8_percent_encode(filename, FILENAME_ESCAPE);
        value.extend_from_slice(format!(";\r\n\tfilename*=\"utf-8''{encoded}\"").as_bytes());
    }
    cooked.set("Content-Disposition", Some(value));
}
