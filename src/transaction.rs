//! Per-message delivery outcome
//!
//! Every queued message is bound one-to-one to a [`Transaction`], an
//! observable handle the transport finalises exactly once. Observers
//! see ordered events: progress updates are non-decreasing, an error
//! (if any) strictly precedes `Finished`, and `Finished` fires once.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::{message::Message, transport::AuthMechanism};

/// Transaction outcome classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorKind {
    /// Delivery succeeded
    #[default]
    None,
    /// The message has neither a valid sender nor a `From` address
    NoSender,
    /// The message has no recipients
    NoRecipients,
    /// The server rejected a command with a 4xx/5xx reply
    Response,
    /// The connection failed or was lost
    Connection,
    /// TLS was required but the server does not offer it
    TlsRequired,
    /// The server name could not be resolved
    Resolver,
    /// The server stopped responding within the configured timeout
    Timeout,
    /// Delivery was aborted locally
    Aborted,
    /// The message body could not be rendered
    Data,
}

impl ErrorKind {
    /// Default human-readable text; the transport overrides this with
    /// context-specific detail where it has any.
    pub fn default_text(self) -> &'static str {
        match self {
            ErrorKind::None => "no error",
            ErrorKind::NoSender => "message has no valid sender address",
            ErrorKind::NoRecipients => "message has no recipients",
            ErrorKind::Response => "server replied with an error",
            ErrorKind::Connection => "connection failed",
            ErrorKind::TlsRequired => "encryption required but not offered by the server",
            ErrorKind::Resolver => "could not resolve server name",
            ErrorKind::Timeout => "server communication timed out",
            ErrorKind::Aborted => "delivery aborted",
            ErrorKind::Data => "message data could not be produced",
        }
    }
}

/// Events observable through [`Transaction::events`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionEvent {
    /// Render progress of the message, `0..=100`
    Progress(u8),
    /// Delivery failed; fired at most once, before `Finished`
    Error(ErrorKind),
    /// The transaction was finalised; fired exactly once
    Finished,
}

/// The server reply recorded on a finalised transaction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerStatus {
    pub code: u16,
    pub lines: Vec<String>,
}

#[derive(Default)]
struct TransactionState {
    error_kind: ErrorKind,
    error_text: Option<String>,
    status: Option<ServerStatus>,
    encrypted: bool,
    tls_protocol: Option<String>,
    tls_cipher: Option<String>,
    authenticated: bool,
    auth_mechanism: Option<AuthMechanism>,
    username: Option<String>,
    progress: u8,
    finished: bool,
    observers: Vec<mpsc::UnboundedSender<TransactionEvent>>,
}

/// Observable handle for one queued message.
///
/// Cloning yields another handle onto the same transaction.
#[derive(Clone)]
pub struct Transaction {
    message: Message,
    state: Arc<Mutex<TransactionState>>,
}

impl Transaction {
    pub(crate) fn new(message: Message) -> Transaction {
        Transaction {
            message,
            state: Arc::new(Mutex::new(TransactionState::default())),
        }
    }

    /// The message this transaction delivers
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// The error classification; `ErrorKind::None` until finalisation
    /// and after successful delivery
    pub fn error_kind(&self) -> ErrorKind {
        self.state.lock().expect("transaction state").error_kind
    }

    /// Human-readable error description
    pub fn error_text(&self) -> String {
        let state = self.state.lock().expect("transaction state");
        state
            .error_text
            .clone()
            .unwrap_or_else(|| state.error_kind.default_text().to_owned())
    }

    /// The last SMTP status the server sent for this transaction
    pub fn server_status(&self) -> Option<ServerStatus> {
        self.state.lock().expect("transaction state").status.clone()
    }

    /// Whether the connection was TLS-encrypted while sending
    pub fn encrypted(&self) -> bool {
        self.state.lock().expect("transaction state").encrypted
    }

    /// Negotiated TLS protocol version, when encrypted
    pub fn tls_protocol(&self) -> Option<String> {
        self.state
            .lock()
            .expect("transaction state")
            .tls_protocol
            .clone()
    }

    /// Negotiated TLS cipher suite, when encrypted
    pub fn tls_cipher(&self) -> Option<String> {
        self.state
            .lock()
            .expect("transaction state")
            .tls_cipher
            .clone()
    }

    /// Whether the session was authenticated while sending
    pub fn authenticated(&self) -> bool {
        self.state.lock().expect("transaction state").authenticated
    }

    /// The SASL mechanism used for authentication
    pub fn auth_mechanism(&self) -> Option<AuthMechanism> {
        self.state
            .lock()
            .expect("transaction state")
            .auth_mechanism
    }

    /// The username used for authentication
    pub fn username(&self) -> Option<String> {
        self.state
            .lock()
            .expect("transaction state")
            .username
            .clone()
    }

    /// Render progress percentage, `0..=100`
    pub fn progress(&self) -> u8 {
        self.state.lock().expect("transaction state").progress
    }

    /// True once the transaction was finalised
    pub fn is_finished(&self) -> bool {
        self.state.lock().expect("transaction state").finished
    }

    /// Subscribe to transaction events. Events already emitted are not
    /// replayed.
    pub fn events(&self) -> mpsc::UnboundedReceiver<TransactionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .expect("transaction state")
            .observers
            .push(tx);
        rx
    }

    /// Abort this transaction only. A no-op once finalised; the
    /// transport skips aborted transactions when it reaches them.
    pub fn abort(&self) {
        self.finalize(ErrorKind::Aborted, None, None);
    }

    pub(crate) fn set_progress(&self, percent: u8) {
        let mut state = self.state.lock().expect("transaction state");
        if state.finished || percent <= state.progress {
            return;
        }
        state.progress = percent.min(100);
        let event = TransactionEvent::Progress(state.progress);
        state.observers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub(crate) fn set_session_facts(
        &self,
        encrypted: bool,
        tls_protocol: Option<String>,
        tls_cipher: Option<String>,
        authenticated: bool,
        auth_mechanism: Option<AuthMechanism>,
        username: Option<String>,
    ) {
        let mut state = self.state.lock().expect("transaction state");
        state.encrypted = encrypted;
        state.tls_protocol = tls_protocol;
        state.tls_cipher = tls_cipher;
        state.authenticated = authenticated;
        state.auth_mechanism = auth_mechanism;
        state.username = username;
    }

    /// Record the outcome and emit `Error` (when kind is not `None`)
    /// followed by `Finished`. Finalisation happens at most once;
    /// further calls are no-ops.
    pub(crate) fn finalize(
        &self,
        kind: ErrorKind,
        text: Option<String>,
        status: Option<ServerStatus>,
    ) {
        let mut state = self.state.lock().expect("transaction state");
        if state.finished {
            return;
        }
        state.finished = true;
        state.error_kind = kind;
        state.error_text = text;
        if status.is_some() {
            state.status = status;
        }
        if kind != ErrorKind::None {
            let event = TransactionEvent::Error(kind);
            state.observers.retain(|tx| tx.send(event.clone()).is_ok());
        }
        state
            .observers
            .retain(|tx| tx.send(TransactionEvent::Finished).is_ok());
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("transaction state");
        f.debug_struct("Transaction")
            .field("error_kind", &state.error_kind)
            .field("progress", &state.progress)
            .field("finished", &state.finished)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn transaction() -> Transaction {
        Transaction::new(crate::Message::builder().build())
    }

    #[test]
    fn finalize_emits_error_then_finished_once() {
        let t = transaction();
        let mut events = t.events();
        t.finalize(ErrorKind::Response, Some("550".to_owned()), None);
        t.finalize(ErrorKind::Connection, None, None);
        assert_eq!(
            events.try_recv().unwrap(),
            TransactionEvent::Error(ErrorKind::Response)
        );
        assert_eq!(events.try_recv().unwrap(), TransactionEvent::Finished);
        assert!(events.try_recv().is_err());
        assert_eq!(t.error_kind(), ErrorKind::Response);
        assert_eq!(t.error_text(), "550");
    }

    #[test]
    fn successful_finalization_has_no_error_event() {
        let t = transaction();
        let mut events = t.events();
        t.finalize(ErrorKind::None, None, None);
        assert_eq!(events.try_recv().unwrap(), TransactionEvent::Finished);
        assert_eq!(t.error_kind(), ErrorKind::None);
    }

    #[test]
    fn abort_is_idempotent() {
        let t = transaction();
        t.finalize(ErrorKind::None, None, None);
        t.abort();
        assert_eq!(t.error_kind(), ErrorKind::None);

        let t = transaction();
        t.abort();
        t.abort();
        assert_eq!(t.error_kind(), ErrorKind::Aborted);
        assert!(t.is_finished());
    }

    #[test]
    fn progress_is_monotonic_and_stops_at_finalization() {
        let t = transaction();
        t.set_progress(10);
        t.set_progress(5);
        assert_eq!(t.progress(), 10);
        t.set_progress(60);
        assert_eq!(t.progress(), 60);
        t.finalize(ErrorKind::None, None, None);
        t.set_progress(90);
        assert_eq!(t.progress(), 60);
    }

    #[test]
    fn default_error_text_is_used() {
        let t = transaction();
        t.finalize(ErrorKind::Timeout, None, None);
        assert_eq!(t.error_text(), ErrorKind::Timeout.default_text());
    }
}
