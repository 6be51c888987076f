//! Message model: the envelope-level value the transport queues and the
//! renderer serialises

pub use self::part::{
    BodyData, BodyPart, Disposition, MimePart, MimePartBuilder, Multipart, MultipartKind, Part,
};
pub use self::source::{ByteSource, FileSource, MemorySource, PushbackSource, SourceCell};

pub mod part;
pub mod source;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{address::Address, headers::Headers, rfc};

/// A complete mail message: addressing, headers and a body part tree.
///
/// Messages are cheap to clone; body streams are shared between clones
/// and remain read-once.
#[derive(Debug, Clone)]
pub struct Message {
    pub(crate) message_id: Vec<u8>,
    pub(crate) headers: Headers,
    pub(crate) sender: Option<Address>,
    pub(crate) from: Vec<Address>,
    pub(crate) to: Vec<Address>,
    pub(crate) reply_to: Vec<Address>,
    pub(crate) cc: Vec<Address>,
    pub(crate) bcc: Vec<Address>,
    pub(crate) date: Option<DateTime<Utc>>,
    pub(crate) subject: Option<String>,
    pub(crate) body: Part,
}

impl Message {
    /// Start building a message
    pub fn builder() -> MessageBuilder {
        MessageBuilder {
            message: Message {
                message_id: default_message_id(),
                headers: Headers::new(),
                sender: None,
                from: Vec::new(),
                to: Vec::new(),
                reply_to: Vec::new(),
                cc: Vec::new(),
                bcc: Vec::new(),
                date: None,
                subject: None,
                body: Part::Null,
            },
        }
    }

    pub fn message_id(&self) -> &[u8] {
        &self.message_id
    }

    pub fn sender(&self) -> Option<&Address> {
        self.sender.as_ref()
    }

    pub fn from(&self) -> &[Address] {
        &self.from
    }

    pub fn to(&self) -> &[Address] {
        &self.to
    }

    pub fn reply_to(&self) -> &[Address] {
        &self.reply_to
    }

    pub fn cc(&self) -> &[Address] {
        &self.cc
    }

    pub fn bcc(&self) -> &[Address] {
        &self.bcc
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn date(&self) -> Option<DateTime<Utc>> {
        self.date
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &Part {
        &self.body
    }

    /// Cook the top-level header block: raw headers first, address
    /// lists appended in category order, then the single-value headers.
    pub(crate) fn cook_headers(&self) -> Headers {
        self.cook_onto(self.headers.clone())
    }

    /// Like [`cook_headers`](Self::cook_headers), with `MIME-Version`
    /// appended to the raw headers first. Used for multipart messages.
    pub(crate) fn cook_headers_mime(&self) -> Headers {
        let mut raw = self.headers.clone();
        raw.append("MIME-Version", "1.0");
        self.cook_onto(raw)
    }

    fn cook_onto(&self, mut cooked: Headers) -> Headers {
        for (name, addresses) in [
            ("From", &self.from),
            ("To", &self.to),
            ("Reply-To", &self.reply_to),
            ("Cc", &self.cc),
            ("Bcc", &self.bcc),
        ] {
            for address in addresses {
                cooked.append(name, address.to_header_bytes());
            }
        }

        match self.date {
            Some(date) => cooked.set("Date", Some(rfc::rfc2822_date(date).into_bytes())),
            None => {
                if !cooked.has(b"Date") {
                    cooked.set("Date", Some(rfc::rfc2822_date(Utc::now()).into_bytes()));
                }
            }
        }

        if let Some(subject) = &self.subject {
            cooked.set(
                "Subject",
                Some(rfc::to_encoded_words(subject).into_bytes()),
            );
        }

        cooked.set("Message-ID", Some(self.message_id.clone()));

        if !cooked.has(b"User-Agent") {
            cooked.set(
                "User-Agent",
                Some(
                    format!("mailout {}", env!("CARGO_PKG_VERSION"))
                        .into_bytes(),
                ),
            );
        }

        cooked
    }
}

/// Builder for [`Message`]
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    message: Message,
}

impl MessageBuilder {
    /// Override the generated `Message-ID`
    pub fn message_id<V: Into<Vec<u8>>>(mut self, id: V) -> Self {
        self.message.message_id = id.into();
        self
    }

    /// Set a raw header; repeated calls append
    pub fn header<N: Into<Vec<u8>>, V: Into<Vec<u8>>>(mut self, name: N, value: V) -> Self {
        self.message.headers.append(name, value);
        self
    }

    /// Set the envelope sender, used for `MAIL FROM` in preference to
    /// the first `From` address
    pub fn sender(mut self, address: Address) -> Self {
        self.message.sender = Some(address);
        self
    }

    /// Add a `From` address
    pub fn from(mut self, address: Address) -> Self {
        self.message.from.push(address);
        self
    }

    /// Add a `To` recipient
    pub fn to(mut self, address: Address) -> Self {
        self.message.to.push(address);
        self
    }

    /// Add a `Reply-To` address
    pub fn reply_to(mut self, address: Address) -> Self {
        self.message.reply_to.push(address);
        self
    }

    /// Add a `Cc` recipient
    pub fn cc(mut self, address: Address) -> Self {
        self.message.cc.push(address);
        self
    }

    /// Add a `Bcc` recipient
    pub fn bcc(mut self, address: Address) -> Self {
        self.message.bcc.push(address);
        self
    }

    /// Set the `Date` header; the current time is used when unset and
    /// no raw `Date` header exists
    pub fn date(mut self, date: DateTime<Utc>) -> Self {
        self.message.date = Some(date);
        self
    }

    /// Set the subject
    pub fn subject<S: Into<String>>(mut self, subject: S) -> Self {
        self.message.subject = Some(subject.into());
        self
    }

    /// Set the message body
    pub fn body<P: Into<Part>>(mut self, body: P) -> Self {
        self.message.body = body.into();
        self
    }

    /// Shortcut for a plain text body part
    pub fn text_body<S: Into<String>>(self, text: S) -> Self {
        self.body(BodyPart::new(text.into().into_bytes()))
    }

    /// Finish the message
    pub fn build(self) -> Message {
        self.message
    }
}

/// `<uuid-hex@host>` where host is the unqualified local host name.
fn default_message_id() -> Vec<u8> {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .and_then(|h| h.split('.').next().map(str::to_owned))
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_owned());
    format!("<{}@{}>", Uuid::new_v4().simple(), host).into_bytes()
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    #[test]
    fn default_message_id_shape() {
        let m = Message::builder().build();
        let id = String::from_utf8(m.message_id().to_vec()).unwrap();
        assert!(id.starts_with('<'));
        assert!(id.ends_with('>'));
        assert!(id.contains('@'));
        // uuid hex part
        assert_eq!(id.split('@').next().unwrap().len(), 1 + 32);
    }

    #[test]
    fn cooked_headers_order() {
        let date = Utc.with_ymd_and_hms(1994, 11, 15, 8, 12, 31).unwrap();
        let m = Message::builder()
            .message_id("<test@localhost>")
            .header("X-Priority", "5")
            .from(addr("a@example.com"))
            .to(addr("b@example.com"))
            .to(addr("c@example.com"))
            .cc(addr("d@example.com"))
            .date(date)
            .subject("Hi")
            .build();
        let rendered = String::from_utf8(m.cook_headers().render()).unwrap();
        assert_eq!(
            rendered,
            concat!(
                "X-Priority: 5\r\n",
                "From: <a@example.com>\r\n",
                "To: <b@example.com>\r\n",
                "To: <c@example.com>\r\n",
                "Cc: <d@example.com>\r\n",
                "Date: Tue, 15 Nov 1994 08:12:31 +0000\r\n",
                "Subject: Hi\r\n",
                "Message-ID: <test@localhost>\r\n",
                concat!("User-Agent: mailout ", env!("CARGO_PKG_VERSION"), "\r\n"),
            )
        );
    }

    #[test]
    fn raw_date_header_is_replaced_in_place_by_explicit_date() {
        let date = Utc.with_ymd_and_hms(1994, 11, 15, 8, 12, 31).unwrap();
        let m = Message::builder()
            .header("Date", "bogus")
            .header("X-After", "1")
            .date(date)
            .build();
        let cooked = m.cook_headers();
        let names: Vec<&[u8]> = cooked.iter().map(|(n, _)| n).collect();
        assert_eq!(names[0], b"Date");
        assert_eq!(
            cooked.value(b"Date"),
            Some(b"Tue, 15 Nov 1994 08:12:31 +0000".as_ref())
        );
    }

    #[test]
    fn raw_date_header_is_kept_when_no_date_set() {
        let m = Message::builder()
            .header("Date", "Thu, 1 Jan 1970 00:00:00 +0000")
            .build();
        let cooked = m.cook_headers();
        assert_eq!(
            cooked.value(b"Date"),
            Some(b"Thu, 1 Jan 1970 00:00:00 +0000".as_ref())
        );
    }

    #[test]
    fn subject_omitted_when_none() {
        let m = Message::builder().build();
        assert!(!m.cook_headers().has(b"Subject"));
    }

    #[test]
    fn non_ascii_subject_is_encoded() {
        let m = Message::builder().subject("яңа ел белән!").build();
        let cooked = m.cook_headers();
        assert_eq!(
            cooked.value(b"Subject"),
            Some(b"=?utf-8?b?0Y/So9CwINC10Lsg0LHQtdC705nQvSE=?=".as_ref())
        );
    }

    #[test]
    fn user_agent_not_overridden() {
        let m = Message::builder().header("User-Agent", "custom/1.0").build();
        let cooked = m.cook_headers();
        assert_eq!(cooked.value(b"User-Agent"), Some(b"custom/1.0".as_ref()));
    }
}
