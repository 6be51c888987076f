//! mailout is a client-side SMTP submission library. It provides:
//!
//! * A strongly typed message and MIME part model
//! * A streaming renderer with Base64 and quoted-printable transfer
//!   encodings, so large attachments never have to fit in memory
//! * An asynchronous SMTP transport with STARTTLS, SASL authentication
//!   and per-message delivery outcomes
//!
//! # Example
//!
//! ```no_run
//! use mailout::{Message, MimePart, Multipart, Transport};
//!
//! # async fn send() {
//! let message = Message::builder()
//!     .from("alice@example.com".parse().unwrap())
//!     .to("bob@example.net".parse().unwrap())
//!     .subject("Quarterly report")
//!     .body(
//!         Multipart::mixed()
//!             .part(MimePart::text("Report attached."))
//!             .part(MimePart::attachment("report.pdf").unwrap()),
//!     )
//!     .build();
//!
//! let mut transport = Transport::builder()
//!     .credentials("alice", "hunter2")
//!     .build();
//! let transaction = transport.queue_message(message);
//! transport.send("mail.example.com").await;
//! assert_eq!(transaction.error_kind(), mailout::ErrorKind::None);
//! # }
//! ```

#![deny(
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unstable_features,
    unused_import_braces,
    unsafe_code
)]

pub mod address;
pub mod encoding;
pub mod headers;
pub mod message;
pub mod renderer;
pub(crate) mod rfc;
pub mod transaction;
pub mod transport;

pub use crate::{
    address::{Address, AddressError},
    encoding::EncoderKind,
    headers::Headers,
    message::{
        BodyPart, ByteSource, Disposition, FileSource, MemorySource, Message, MessageBuilder,
        MimePart, Multipart, MultipartKind, Part,
    },
    renderer::{RenderError, Renderer},
    transaction::{ErrorKind, ServerStatus, Transaction, TransactionEvent},
    transport::{
        AbortHandle, AuthMechanism, IpPreference, TlsLevel, TlsParameters, Transport,
        TransportBuilder,
    },
};
