//! Asynchronous SMTP submission transport
//!
//! The [`Transport`] owns a queue of messages, each bound to a
//! [`Transaction`]. `send` resolves the server, walks the SMTP dialogue
//! (banner, EHLO/HELO, optional STARTTLS, optional authentication) and
//! then delivers the queued messages one transaction at a time over the
//! same connection, streaming each message out of its renderer under
//! backpressure. Failures are reported per transaction; the transport
//! itself never returns an error from `send`.
//!
//! Everything runs cooperatively on the calling task: the suspension
//! points are socket readiness, the TLS handshake, resolver completion
//! and the per-operation timeout.

pub use self::{
    auth::AuthMechanism,
    response::Response,
    tls::{TlsError, TlsLevel, TlsParameters, TlsParametersBuilder},
};

pub(crate) mod auth;
pub(crate) mod extension;
pub mod response;
pub mod tls;

use std::{
    collections::VecDeque,
    io,
    net::{IpAddr, SocketAddr},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use hickory_resolver::{
    config::{LookupIpStrategy, ResolverConfig, ResolverOpts},
    system_conf, TokioAsyncResolver,
};
use rustls::pki_types::ServerName;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::TcpStream,
    sync::watch,
};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::{
    message::Message,
    renderer::{Renderer, DEFAULT_BUFFER_SIZE},
    transaction::{ErrorKind, ServerStatus, Transaction},
    transport::{extension::ServerInfo, response::ResponseAccumulator},
};

/// Default SMTP port
pub const SMTP_PORT: u16 = 25;

/// Default timeout for every protocol step
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(60_000);

/// Which address family to resolve the server name to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpPreference {
    /// Use whatever A or AAAA records exist
    #[default]
    Any,
    /// IPv4 only
    V4,
    /// IPv6 only
    V6,
}

/// Shared cancellation flag; `abort` wakes every guarded await.
pub(crate) struct AbortFlag {
    tx: watch::Sender<bool>,
}

impl AbortFlag {
    fn new() -> AbortFlag {
        let (tx, _rx) = watch::channel(false);
        AbortFlag { tx }
    }

    fn abort(&self) {
        self.tx.send_replace(true);
    }

    fn reset(&self) {
        self.tx.send_replace(false);
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Cloneable handle that cancels a running [`Transport::send`] from
/// another task. Queued transactions are finalised as `Aborted`.
#[derive(Clone)]
pub struct AbortHandle {
    flag: Arc<AbortFlag>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.flag.abort();
    }
}

/// Local interruption of a guarded operation
enum Interrupt {
    Timeout,
    Aborted,
}

/// Failures of a single link operation
enum LinkError {
    Timeout,
    Aborted,
    Closed,
    Io(String),
    Framing(String),
}

impl LinkError {
    fn from_io(e: io::Error) -> LinkError {
        LinkError::Io(e.to_string())
    }
}

/// Why the connection went away
enum DropReason {
    Timeout,
    Aborted,
    Io(String),
}

/// How a session over one connection ended
enum SessionOutcome {
    /// The queue was drained or flushed and QUIT was sent
    Clean,
    /// The connection was lost or torn down
    Dropped(DropReason),
}

/// Result of attempting the head transaction
enum TxnOutcome {
    /// Head transaction was already finalised (aborted by the caller)
    Skip,
    /// Envelope preflight failed; finalise locally without traffic
    Invalid(ErrorKind),
    /// The server accepted the message
    Delivered(Response),
    /// The server rejected a command for this message
    Rejected(Response),
    /// Rendering the message failed mid-DATA
    RenderFailed(String),
    /// The link failed
    Link(LinkError),
}

/// A plaintext or TLS-upgraded stream.
enum MaybeTls {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    /// Placeholder while the STARTTLS handshake owns the stream
    Detached,
}

impl MaybeTls {
    fn is_encrypted(&self) -> bool {
        matches!(self, MaybeTls::Tls(_))
    }
}

impl AsyncRead for MaybeTls {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            MaybeTls::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            MaybeTls::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            MaybeTls::Detached => Poll::Ready(Err(io::ErrorKind::NotConnected.into())),
        }
    }
}

impl AsyncWrite for MaybeTls {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            MaybeTls::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            MaybeTls::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            MaybeTls::Detached => Poll::Ready(Err(io::ErrorKind::NotConnected.into())),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            MaybeTls::Plain(stream) => Pin::new(stream).poll_flush(cx),
            MaybeTls::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            MaybeTls::Detached => Poll::Ready(Err(io::ErrorKind::NotConnected.into())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            MaybeTls::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            MaybeTls::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            MaybeTls::Detached => Poll::Ready(Err(io::ErrorKind::NotConnected.into())),
        }
    }
}

/// Wrap an await in the session timeout and the abort flag. The timer
/// effectively restarts on every protocol step, reply line and write.
macro_rules! guarded {
    ($self:ident, $fut:expr) => {{
        let mut aborted = $self.abort.subscribe();
        tokio::select! {
            _ = aborted.wait_for(|a| *a) => Err(LinkError::Aborted),
            res = tokio::time::timeout($self.timeout, $fut) => match res {
                Err(_) => Err(LinkError::Timeout),
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(LinkError::from_io(e)),
            },
        }
    }};
}

/// The server side of one TCP connection.
struct Connection {
    stream: MaybeTls,
    rbuf: Vec<u8>,
    timeout: Duration,
    abort: Arc<AbortFlag>,
}

impl Connection {
    fn new(stream: TcpStream, timeout: Duration, abort: Arc<AbortFlag>) -> Connection {
        Connection {
            stream: MaybeTls::Plain(stream),
            rbuf: Vec::new(),
            timeout,
            abort,
        }
    }

    fn is_encrypted(&self) -> bool {
        self.stream.is_encrypted()
    }

    /// Read one CRLF-terminated line, stripped.
    async fn read_line(&mut self) -> Result<String, LinkError> {
        loop {
            if let Some(pos) = self.rbuf.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.rbuf.drain(..=pos).collect();
                if line.last() == Some(&b'\n') {
                    line.pop();
                }
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return String::from_utf8(line)
                    .map_err(|_| LinkError::Framing("server reply is not valid UTF-8".into()));
            }
            let mut tmp = [0u8; 2048];
            let n = guarded!(self, self.stream.read(&mut tmp))?;
            if n == 0 {
                return Err(LinkError::Closed);
            }
            self.rbuf.extend_from_slice(&tmp[..n]);
        }
    }

    /// Read reply lines until the reply is complete.
    async fn read_response(&mut self) -> Result<Response, LinkError> {
        let mut acc = ResponseAccumulator::new();
        loop {
            let line = self.read_line().await?;
            debug!("<< {line}");
            match acc.push_line(&line) {
                Ok(Some(response)) => return Ok(response),
                Ok(None) => {}
                Err(e) => return Err(LinkError::Framing(e.to_string())),
            }
        }
    }

    /// Send one command line and await the reply.
    async fn command(&mut self, line: &str) -> Result<Response, LinkError> {
        debug!(">> {line}");
        let mut data = Vec::with_capacity(line.len() + 2);
        data.extend_from_slice(line.as_bytes());
        data.extend_from_slice(b"\r\n");
        self.write_all(&data).await?;
        self.flush().await?;
        self.read_response().await
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), LinkError> {
        guarded!(self, self.stream.write_all(data))
    }

    /// A single possibly-partial write; backpressure shows up here as
    /// the await suspending until the socket drains.
    async fn write(&mut self, data: &[u8]) -> Result<usize, LinkError> {
        guarded!(self, self.stream.write(data))
    }

    async fn flush(&mut self) -> Result<(), LinkError> {
        guarded!(self, self.stream.flush())
    }

    /// Upgrade the plaintext stream in place after a `220` to STARTTLS.
    /// Returns the negotiated protocol and cipher suite names.
    async fn upgrade_tls(
        &mut self,
        connector: TlsConnector,
        name: ServerName<'static>,
    ) -> Result<(Option<String>, Option<String>), LinkError> {
        let plain = match std::mem::replace(&mut self.stream, MaybeTls::Detached) {
            MaybeTls::Plain(stream) => stream,
            other => {
                self.stream = other;
                return Err(LinkError::Io("connection is already encrypted".into()));
            }
        };
        let tls = guarded!(self, connector.connect(name, plain))?;
        let (_, session) = tls.get_ref();
        let protocol = session.protocol_version().map(|v| format!("{v:?}"));
        let cipher = session
            .negotiated_cipher_suite()
            .map(|s| format!("{:?}", s.suite()));
        self.stream = MaybeTls::Tls(Box::new(tls));
        Ok((protocol, cipher))
    }
}

/// Tracks whether the outgoing DATA stream currently ends in CRLF, so
/// the terminator never glues onto an unterminated line.
#[derive(Default)]
struct CrlfTracker {
    state: u8,
}

impl CrlfTracker {
    fn update(&mut self, data: &[u8]) {
        for &byte in data {
            self.state = match (self.state, byte) {
                (1, b'\n') => 2,
                (_, b'\r') => 1,
                _ => 0,
            };
        }
    }

    fn at_crlf(&self) -> bool {
        self.state == 2
    }
}

/// TLS and authentication facts recorded onto each transaction.
#[derive(Clone, Default)]
struct SessionFacts {
    encrypted: bool,
    tls_protocol: Option<String>,
    tls_cipher: Option<String>,
    authenticated: bool,
    mechanism: Option<AuthMechanism>,
}

struct Entry {
    txn: Transaction,
    renderer: Renderer,
}

/// Client-side SMTP submission endpoint.
///
/// Configure it through [`Transport::builder`], queue messages with
/// [`queue_message`](Transport::queue_message), then drive the
/// delivery with [`send`](Transport::send). Each queued message
/// reports its own outcome through its [`Transaction`].
pub struct Transport {
    user: String,
    password: String,
    auth_mechanism: AuthMechanism,
    system_identifier: String,
    timeout: Duration,
    tls_level: TlsLevel,
    tls_parameters: Option<TlsParameters>,
    port: u16,
    ip_preference: IpPreference,
    buffer_size: usize,
    line_width: usize,
    queue: VecDeque<Entry>,
    abort: Arc<AbortFlag>,
    progress: watch::Sender<u8>,
}

/// Builder for [`Transport`]
#[derive(Debug, Clone)]
pub struct TransportBuilder {
    user: String,
    password: String,
    auth_mechanism: AuthMechanism,
    system_identifier: String,
    timeout: Duration,
    tls_level: TlsLevel,
    tls_parameters: Option<TlsParameters>,
    port: u16,
    ip_preference: IpPreference,
    buffer_size: usize,
    line_width: usize,
}

impl Default for TransportBuilder {
    fn default() -> TransportBuilder {
        TransportBuilder {
            user: String::new(),
            password: String::new(),
            auth_mechanism: AuthMechanism::AutoSelect,
            system_identifier: "localhost".to_owned(),
            timeout: DEFAULT_TIMEOUT,
            tls_level: TlsLevel::Optional,
            tls_parameters: None,
            port: SMTP_PORT,
            ip_preference: IpPreference::Any,
            buffer_size: DEFAULT_BUFFER_SIZE,
            line_width: crate::encoding::DEFAULT_LINE_WIDTH,
        }
    }
}

impl TransportBuilder {
    /// Set the credentials used for authentication
    pub fn credentials<U: Into<String>, P: Into<String>>(mut self, user: U, password: P) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    /// Select the authentication mechanism; the default negotiates one
    pub fn auth_mechanism(mut self, mechanism: AuthMechanism) -> Self {
        self.auth_mechanism = mechanism;
        self
    }

    /// The name presented in EHLO/HELO, `localhost` by default
    pub fn system_identifier<S: Into<String>>(mut self, identifier: S) -> Self {
        self.system_identifier = identifier.into();
        self
    }

    /// Timeout for every protocol step, 60 seconds by default
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// TLS upgrade policy
    pub fn tls_level(mut self, level: TlsLevel) -> Self {
        self.tls_level = level;
        self
    }

    /// TLS trust and verification settings
    pub fn tls_parameters(mut self, parameters: TlsParameters) -> Self {
        self.tls_parameters = Some(parameters);
        self
    }

    /// Server port, 25 by default
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Restrict resolution to one address family
    pub fn ip_preference(mut self, preference: IpPreference) -> Self {
        self.ip_preference = preference;
        self
    }

    /// Renderer buffer capacity, 128 KiB by default
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Output line width for encoded bodies, 76 by default; 0 disables
    /// folding
    pub fn line_width(mut self, width: usize) -> Self {
        self.line_width = width;
        self
    }

    pub fn build(self) -> Transport {
        let (progress, _) = watch::channel(0);
        Transport {
            user: self.user,
            password: self.password,
            auth_mechanism: self.auth_mechanism,
            system_identifier: self.system_identifier,
            timeout: self.timeout,
            tls_level: self.tls_level,
            tls_parameters: self.tls_parameters,
            port: self.port,
            ip_preference: self.ip_preference,
            buffer_size: self.buffer_size,
            line_width: self.line_width,
            queue: VecDeque::new(),
            abort: Arc::new(AbortFlag::new()),
            progress,
        }
    }
}

impl Default for Transport {
    fn default() -> Transport {
        Transport::builder().build()
    }
}

impl Transport {
    /// Start configuring a transport
    pub fn builder() -> TransportBuilder {
        TransportBuilder::default()
    }

    /// Number of messages waiting for delivery
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Queue a message for the next [`send`](Transport::send) and
    /// return its transaction handle.
    pub fn queue_message(&mut self, message: Message) -> Transaction {
        let renderer = Renderer::new(&message, self.buffer_size, self.line_width);
        let txn = Transaction::new(message);
        self.queue.push_back(Entry {
            txn: txn.clone(),
            renderer,
        });
        txn
    }

    /// Observe the overall delivery progress in percent across all
    /// queued messages.
    pub fn progress_watch(&self) -> watch::Receiver<u8> {
        self.progress.subscribe()
    }

    /// A handle that cancels a running `send` from elsewhere.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            flag: self.abort.clone(),
        }
    }

    /// Cancel delivery; every queued transaction is finalised as
    /// `Aborted`. Idempotent.
    pub fn abort(&self) {
        self.abort.abort();
    }

    /// Deliver every queued message to `server` (a host name or IP
    /// literal). Returns once all transactions are finalised and the
    /// connection is closed; per-message outcomes are reported on the
    /// transactions.
    pub async fn send(&mut self, server: &str) {
        if self.queue.is_empty() {
            return;
        }
        self.abort.reset();
        let total = self.queue.len();
        let mut processed = 0usize;
        self.progress.send_replace(0);

        let ip = match server.parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) => match self.resolve(server).await {
                Ok(ip) => ip,
                Err(ResolveOutcome::Failed(text)) => {
                    warn!("resolving {server} failed: {text}");
                    self.flush_queue(
                        ErrorKind::Resolver,
                        Some(text),
                        None,
                        &mut processed,
                        total,
                    );
                    return;
                }
                Err(ResolveOutcome::Interrupted(Interrupt::Timeout)) => {
                    self.flush_queue(ErrorKind::Timeout, None, None, &mut processed, total);
                    return;
                }
                Err(ResolveOutcome::Interrupted(Interrupt::Aborted)) => {
                    self.flush_queue(ErrorKind::Aborted, None, None, &mut processed, total);
                    return;
                }
            },
        };

        let mut reached_rts = false;
        loop {
            match self
                .run_session(server, ip, &mut reached_rts, total, &mut processed)
                .await
            {
                SessionOutcome::Clean => break,
                SessionOutcome::Dropped(reason) => {
                    let retry = !self.queue.is_empty()
                        && reached_rts
                        && !matches!(reason, DropReason::Aborted);
                    if retry {
                        // the connection worked once; reconnect and
                        // resume the queue on the same server
                        reached_rts = false;
                        info!(
                            "connection lost with {} messages pending, reconnecting",
                            self.queue.len()
                        );
                        continue;
                    }
                    let (kind, text) = match reason {
                        DropReason::Timeout => (ErrorKind::Timeout, None),
                        DropReason::Aborted => (ErrorKind::Aborted, None),
                        DropReason::Io(text) => (ErrorKind::Connection, Some(text)),
                    };
                    self.flush_queue(kind, text, None, &mut processed, total);
                    break;
                }
            }
        }
    }

    /// Resolve `host` to one address, picking randomly among the
    /// returned records.
    async fn resolve(&self, host: &str) -> Result<IpAddr, ResolveOutcome> {
        let (config, mut opts) = system_conf::read_system_conf()
            .unwrap_or_else(|_| (ResolverConfig::default(), ResolverOpts::default()));
        opts.ip_strategy = match self.ip_preference {
            IpPreference::Any => LookupIpStrategy::Ipv4AndIpv6,
            IpPreference::V4 => LookupIpStrategy::Ipv4Only,
            IpPreference::V6 => LookupIpStrategy::Ipv6Only,
        };
        let resolver = TokioAsyncResolver::tokio(config, opts);

        let mut aborted = self.abort.subscribe();
        let lookup = tokio::select! {
            _ = aborted.wait_for(|a| *a) => {
                return Err(ResolveOutcome::Interrupted(Interrupt::Aborted))
            }
            res = tokio::time::timeout(self.timeout, resolver.lookup_ip(host)) => match res {
                Err(_) => return Err(ResolveOutcome::Interrupted(Interrupt::Timeout)),
                Ok(Err(e)) => return Err(ResolveOutcome::Failed(e.to_string())),
                Ok(Ok(lookup)) => lookup,
            },
        };
        let addrs: Vec<IpAddr> = lookup.iter().collect();
        if addrs.is_empty() {
            return Err(ResolveOutcome::Failed(format!(
                "no address records for {host}"
            )));
        }
        Ok(addrs[fastrand::usize(..addrs.len())])
    }

    /// Drive one connection: greeting, session setup, then the
    /// transaction loop.
    async fn run_session(
        &mut self,
        host: &str,
        ip: IpAddr,
        reached_rts: &mut bool,
        total: usize,
        processed: &mut usize,
    ) -> SessionOutcome {
        let addr = SocketAddr::new(ip, self.port);
        debug!("connecting to {addr}");
        let mut aborted = self.abort.subscribe();
        let stream = tokio::select! {
            _ = aborted.wait_for(|a| *a) => {
                return SessionOutcome::Dropped(DropReason::Aborted)
            }
            res = tokio::time::timeout(self.timeout, TcpStream::connect(addr)) => match res {
                Err(_) => return SessionOutcome::Dropped(DropReason::Timeout),
                Ok(Err(e)) => return SessionOutcome::Dropped(DropReason::Io(e.to_string())),
                Ok(Ok(stream)) => stream,
            },
        };
        let mut conn = Connection::new(stream, self.timeout, self.abort.clone());
        info!("connection established to {addr}");

        let mut facts = SessionFacts::default();

        // banner
        let resp = match conn.read_response().await {
            Ok(resp) => resp,
            Err(e) => return self.link_failed(&mut conn, e, total, processed).await,
        };
        if resp.code() != 220 {
            return self.flush_and_quit(&mut conn, resp, total, processed).await;
        }

        // EHLO, falling back to HELO on 50x
        let mut server_info;
        let resp = match conn
            .command(&format!("EHLO {}", self.system_identifier))
            .await
        {
            Ok(resp) => resp,
            Err(e) => return self.link_failed(&mut conn, e, total, processed).await,
        };
        if (500..510).contains(&resp.code()) {
            let resp = match conn
                .command(&format!("HELO {}", self.system_identifier))
                .await
            {
                Ok(resp) => resp,
                Err(e) => return self.link_failed(&mut conn, e, total, processed).await,
            };
            if resp.code() != 250 {
                return self.flush_and_quit(&mut conn, resp, total, processed).await;
            }
            server_info = ServerInfo::default();
        } else if resp.code() == 250 {
            server_info = ServerInfo::from_response(&resp);
        } else {
            return self.flush_and_quit(&mut conn, resp, total, processed).await;
        }

        // TLS upgrade decision
        if self.tls_level == TlsLevel::Required && !server_info.starttls {
            self.flush_queue(ErrorKind::TlsRequired, None, None, processed, total);
            let _ = conn.command("QUIT").await;
            return SessionOutcome::Clean;
        }
        if self.tls_level != TlsLevel::Disabled && server_info.starttls {
            let resp = match conn.command("STARTTLS").await {
                Ok(resp) => resp,
                Err(e) => return self.link_failed(&mut conn, e, total, processed).await,
            };
            match resp.code() {
                220 => {
                    let parameters = self
                        .tls_parameters
                        .clone()
                        .unwrap_or_default();
                    let name = match parameters.server_name(host) {
                        Ok(name) => name,
                        Err(e) => {
                            return SessionOutcome::Dropped(DropReason::Io(e.to_string()))
                        }
                    };
                    let connector = TlsConnector::from(parameters.config.clone());
                    match conn.upgrade_tls(connector, name).await {
                        Ok((protocol, cipher)) => {
                            debug!("connection encrypted ({protocol:?}, {cipher:?})");
                            facts.encrypted = true;
                            facts.tls_protocol = protocol;
                            facts.tls_cipher = cipher;
                        }
                        Err(e) => {
                            return self.link_failed(&mut conn, e, total, processed).await
                        }
                    }
                    // RFC 3207: the session restarts, EHLO again
                    let resp = match conn
                        .command(&format!("EHLO {}", self.system_identifier))
                        .await
                    {
                        Ok(resp) => resp,
                        Err(e) => return self.link_failed(&mut conn, e, total, processed).await,
                    };
                    if resp.code() != 250 {
                        return self.flush_and_quit(&mut conn, resp, total, processed).await;
                    }
                    server_info = ServerInfo::from_response(&resp);
                }
                454 if self.tls_level == TlsLevel::Required => {
                    self.flush_queue(ErrorKind::TlsRequired, None, None, processed, total);
                    let _ = conn.command("QUIT").await;
                    return SessionOutcome::Clean;
                }
                // TLS unavailable but optional: continue in plaintext
                454 => {}
                _ => {
                    return self.flush_and_quit(&mut conn, resp, total, processed).await;
                }
            }
        }

        // authentication
        if let Some(mechanism) = auth::select(&server_info, self.auth_mechanism) {
            if !self.user.is_empty() || !self.password.is_empty() {
                let mut resp = match conn.command(&format!("AUTH {mechanism}")).await {
                    Ok(resp) => resp,
                    Err(e) => return self.link_failed(&mut conn, e, total, processed).await,
                };
                // bounded so a misbehaving server cannot loop forever
                let mut challenges = 10;
                while resp.code() == 334 && challenges > 0 {
                    challenges -= 1;
                    let answer =
                        auth::respond(mechanism, resp.last_line(), &self.user, &self.password);
                    resp = match conn.command(&answer).await {
                        Ok(resp) => resp,
                        Err(e) => return self.link_failed(&mut conn, e, total, processed).await,
                    };
                }
                if resp.code() != 235 {
                    return self.flush_and_quit(&mut conn, resp, total, processed).await;
                }
                debug!("authenticated as {} via {}", self.user, mechanism);
                facts.authenticated = true;
                facts.mechanism = Some(mechanism);
            }
        }

        // transaction loop
        loop {
            *reached_rts = true;
            if self.queue.is_empty() {
                let _ = conn.command("QUIT").await;
                return SessionOutcome::Clean;
            }

            match self.attempt_front(&mut conn, &facts, total, *processed).await {
                TxnOutcome::Skip => {
                    let mut entry = self.queue.pop_front().expect("queue head");
                    entry.renderer.abort();
                    *processed += 1;
                    self.send_overall_progress(*processed, total);
                }
                TxnOutcome::Invalid(kind) => {
                    let mut entry = self.queue.pop_front().expect("queue head");
                    entry.renderer.abort();
                    entry.txn.finalize(kind, None, None);
                    *processed += 1;
                    self.send_overall_progress(*processed, total);
                }
                TxnOutcome::Delivered(resp) => {
                    let mut entry = self.queue.pop_front().expect("queue head");
                    info!(
                        "message accepted: {}",
                        resp.last_line()
                    );
                    entry.txn.set_progress(100);
                    entry.txn.finalize(ErrorKind::None, None, Some(status_of(&resp)));
                    entry.renderer.abort();
                    *processed += 1;
                    self.send_overall_progress(*processed, total);
                }
                TxnOutcome::Rejected(resp) => {
                    let mut entry = self.queue.pop_front().expect("queue head");
                    entry.renderer.abort();
                    entry
                        .txn
                        .finalize(ErrorKind::Response, None, Some(status_of(&resp)));
                    *processed += 1;
                    self.send_overall_progress(*processed, total);
                    // reset the protocol and continue with the next
                    // queued message on the same connection
                    match conn.command("RSET").await {
                        Ok(_) => {}
                        Err(e) => return self.link_failed(&mut conn, e, total, processed).await,
                    }
                }
                TxnOutcome::RenderFailed(text) => {
                    let mut entry = self.queue.pop_front().expect("queue head");
                    entry.renderer.abort();
                    entry.txn.finalize(ErrorKind::Data, Some(text), None);
                    *processed += 1;
                    self.send_overall_progress(*processed, total);
                    // DATA is underway with a broken payload; the only
                    // safe move is to drop the connection
                    return SessionOutcome::Dropped(DropReason::Io(
                        "connection dropped after message rendering failed".into(),
                    ));
                }
                TxnOutcome::Link(e) => {
                    return self.link_failed(&mut conn, e, total, processed).await
                }
            }
        }
    }

    /// Walk the head transaction through MAIL FROM, RCPT TO and DATA.
    async fn attempt_front(
        &mut self,
        conn: &mut Connection,
        facts: &SessionFacts,
        total: usize,
        processed: usize,
    ) -> TxnOutcome {
        let (sender, recipients) = {
            let entry = self.queue.front().expect("queue head");
            if entry.txn.is_finished() {
                return TxnOutcome::Skip;
            }
            envelope(entry.txn.message())
        };

        let Some(sender) = sender else {
            return TxnOutcome::Invalid(ErrorKind::NoSender);
        };
        if recipients.is_empty() {
            return TxnOutcome::Invalid(ErrorKind::NoRecipients);
        }

        {
            let entry = self.queue.front().expect("queue head");
            entry.txn.set_session_facts(
                conn.is_encrypted() && facts.encrypted,
                facts.tls_protocol.clone(),
                facts.tls_cipher.clone(),
                facts.authenticated,
                facts.mechanism,
                (!self.user.is_empty()).then(|| self.user.clone()),
            );
            info!("from=<{sender}>, recipients={}", recipients.len());
        }

        let resp = match conn.command(&format!("MAIL FROM:<{sender}>")).await {
            Ok(resp) => resp,
            Err(e) => return TxnOutcome::Link(e),
        };
        if resp.code() != 250 {
            return TxnOutcome::Rejected(resp);
        }

        for recipient in &recipients {
            let resp = match conn.command(&format!("RCPT TO:<{recipient}>")).await {
                Ok(resp) => resp,
                Err(e) => return TxnOutcome::Link(e),
            };
            if resp.code() != 250 {
                return TxnOutcome::Rejected(resp);
            }
        }

        let resp = match conn.command("DATA").await {
            Ok(resp) => resp,
            Err(e) => return TxnOutcome::Link(e),
        };
        if resp.code() != 354 {
            return TxnOutcome::Rejected(resp);
        }

        // stream the rendered message under write backpressure
        let mut crlf = CrlfTracker::default();
        {
            let entry = self.queue.front_mut().expect("queue head");
            if let Err(e) = entry.renderer.run() {
                return TxnOutcome::RenderFailed(e.to_string());
            }
            loop {
                if let Err(e) = entry.renderer.fill() {
                    return TxnOutcome::RenderFailed(e.to_string());
                }
                if entry.renderer.bytes_available() == 0 {
                    if entry.renderer.at_end() {
                        break;
                    }
                    continue;
                }
                let n = match conn.write(entry.renderer.data()).await {
                    Ok(n) => n,
                    Err(e) => return TxnOutcome::Link(e),
                };
                crlf.update(&entry.renderer.data()[..n]);
                entry.renderer.advance(n);
                let pct = entry.renderer.percent();
                entry.txn.set_progress(pct);
                let overall = ((processed * 100 + pct as usize) / total).min(100) as u8;
                self.progress.send_replace(overall);
            }
        }

        // terminator, with a CRLF injected when the payload did not
        // end on one
        let mut terminator: Vec<u8> = Vec::with_capacity(5);
        if !crlf.at_crlf() {
            terminator.extend_from_slice(b"\r\n");
        }
        terminator.extend_from_slice(b".\r\n");
        if let Err(e) = conn.write_all(&terminator).await {
            return TxnOutcome::Link(e);
        }
        if let Err(e) = conn.flush().await {
            return TxnOutcome::Link(e);
        }

        match conn.read_response().await {
            Ok(resp) if resp.code() == 250 => TxnOutcome::Delivered(resp),
            Ok(resp) => TxnOutcome::Rejected(resp),
            Err(e) => TxnOutcome::Link(e),
        }
    }

    /// Convert a link failure into the session outcome; invalid framing
    /// flushes the queue as a protocol error and quits.
    async fn link_failed(
        &mut self,
        conn: &mut Connection,
        error: LinkError,
        total: usize,
        processed: &mut usize,
    ) -> SessionOutcome {
        match error {
            LinkError::Timeout => SessionOutcome::Dropped(DropReason::Timeout),
            LinkError::Aborted => SessionOutcome::Dropped(DropReason::Aborted),
            LinkError::Closed => SessionOutcome::Dropped(DropReason::Io(
                "connection closed by server".into(),
            )),
            LinkError::Io(text) => SessionOutcome::Dropped(DropReason::Io(text)),
            LinkError::Framing(text) => {
                self.flush_queue(
                    ErrorKind::Response,
                    Some(text),
                    None,
                    processed,
                    total,
                );
                let _ = conn.command("QUIT").await;
                SessionOutcome::Clean
            }
        }
    }

    /// Flush the whole queue with a protocol error carrying the
    /// offending reply, then QUIT.
    async fn flush_and_quit(
        &mut self,
        conn: &mut Connection,
        resp: Response,
        total: usize,
        processed: &mut usize,
    ) -> SessionOutcome {
        warn!("unexpected server reply {}: {}", resp.code(), resp.last_line());
        self.flush_queue(
            ErrorKind::Response,
            None,
            Some(status_of(&resp)),
            processed,
            total,
        );
        let _ = conn.command("QUIT").await;
        SessionOutcome::Clean
    }

    /// Finalise every queued transaction with one error.
    fn flush_queue(
        &mut self,
        kind: ErrorKind,
        text: Option<String>,
        status: Option<ServerStatus>,
        processed: &mut usize,
        total: usize,
    ) {
        while let Some(mut entry) = self.queue.pop_front() {
            entry.renderer.abort();
            entry.txn.finalize(kind, text.clone(), status.clone());
            *processed += 1;
        }
        self.send_overall_progress(*processed, total);
    }

    fn send_overall_progress(&self, processed: usize, total: usize) {
        let overall = ((processed * 100) / total.max(1)).min(100) as u8;
        self.progress.send_replace(overall);
    }
}

enum ResolveOutcome {
    Failed(String),
    Interrupted(Interrupt),
}

/// Envelope sender and ordered, deduplicated recipient set.
fn envelope(message: &Message) -> (Option<String>, Vec<String>) {
    let sender = message
        .sender()
        .map(|a| a.addr().to_owned())
        .or_else(|| message.from().first().map(|a| a.addr().to_owned()));

    let mut recipients: Vec<String> = Vec::new();
    for address in message
        .to()
        .iter()
        .chain(message.cc())
        .chain(message.bcc())
    {
        if !recipients.iter().any(|r| r == address.addr()) {
            recipients.push(address.addr().to_owned());
        }
    }
    (sender, recipients)
}

fn status_of(resp: &Response) -> ServerStatus {
    ServerStatus {
        code: resp.code(),
        lines: resp.lines().to_vec(),
    }
}
