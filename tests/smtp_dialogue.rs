//! End-to-end SMTP dialogue tests against a scripted mock server.

use std::time::Duration;

use mailout::{
    Address, AuthMechanism, BodyPart, ErrorKind, Message, Transport, TlsLevel,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpListener,
    task::JoinHandle,
};

/// One step of the scripted server dialogue.
enum Step {
    /// Send the banner (or any unsolicited line)
    Banner(&'static str),
    /// Expect a command starting with `expect`, then send `reply`.
    /// Multi-line replies carry embedded CRLFs.
    Command {
        expect: &'static str,
        reply: &'static str,
    },
    /// Consume a DATA payload up to the lone dot, then send `reply`
    Data { reply: &'static str },
    /// Expect QUIT and close politely
    Quit,
}

#[derive(Debug, Default)]
struct Transcript {
    commands: Vec<String>,
    payloads: Vec<String>,
}

async fn mock_server(steps: Vec<Step>) -> (String, JoinHandle<Transcript>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(serve(listener, steps));
    (addr.to_string(), handle)
}

async fn serve(listener: TcpListener, steps: Vec<Step>) -> Transcript {
    let (stream, _) = listener.accept().await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut transcript = Transcript::default();

    async fn read_line(reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>) -> String {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        line.trim_end_matches(['\r', '\n']).to_owned()
    }

    for step in steps {
        match step {
            Step::Banner(text) => {
                write_half
                    .write_all(format!("{text}\r\n").as_bytes())
                    .await
                    .unwrap();
            }
            Step::Command { expect, reply } => {
                let line = read_line(&mut reader).await;
                assert!(
                    line.starts_with(expect),
                    "expected command {expect:?}, got {line:?}"
                );
                transcript.commands.push(line);
                write_half
                    .write_all(format!("{reply}\r\n").as_bytes())
                    .await
                    .unwrap();
            }
            Step::Data { reply } => {
                let mut payload = String::new();
                loop {
                    let line = read_line(&mut reader).await;
                    if line == "." {
                        break;
                    }
                    payload.push_str(&line);
                    payload.push_str("\r\n");
                }
                transcript.payloads.push(payload);
                write_half
                    .write_all(format!("{reply}\r\n").as_bytes())
                    .await
                    .unwrap();
            }
            Step::Quit => {
                let line = read_line(&mut reader).await;
                assert!(line.starts_with("QUIT"), "expected QUIT, got {line:?}");
                transcript.commands.push(line);
                let _ = write_half.write_all(b"221 Bye\r\n").await;
            }
        }
    }
    transcript
}

fn addr(s: &str) -> Address {
    s.parse().unwrap()
}

fn plain_message(to: &[&str]) -> Message {
    let mut builder = Message::builder()
        .from(addr("a@x.example"))
        .subject("Hi")
        .body(BodyPart::new(b"Hello world".to_vec()));
    for rcpt in to {
        builder = builder.to(addr(rcpt));
    }
    builder.build()
}

fn transport_for(server: &str) -> (Transport, String) {
    let (host, port) = server.rsplit_once(':').unwrap();
    let transport = Transport::builder()
        .port(port.parse().unwrap())
        .timeout(Duration::from_secs(5))
        .tls_level(TlsLevel::Disabled)
        .build();
    (transport, host.to_owned())
}

#[tokio::test]
async fn plain_submission_without_auth_or_tls() {
    let (server, handle) = mock_server(vec![
        Step::Banner("220 mock ESMTP ready"),
        Step::Command {
            expect: "EHLO localhost",
            reply: "250-mock\r\n250 SIZE 35882577",
        },
        Step::Command {
            expect: "MAIL FROM:<a@x.example>",
            reply: "250 Ok",
        },
        Step::Command {
            expect: "RCPT TO:<b@y.example>",
            reply: "250 Ok",
        },
        Step::Command {
            expect: "DATA",
            reply: "354 End data with <CR><LF>.<CR><LF>",
        },
        Step::Data {
            reply: "250 Ok: queued as 12345",
        },
        Step::Quit,
    ])
    .await;

    let (mut transport, host) = transport_for(&server);
    let txn = transport.queue_message(plain_message(&["b@y.example"]));
    transport.send(&host).await;

    assert!(txn.is_finished());
    assert_eq!(txn.error_kind(), ErrorKind::None);
    assert!(!txn.encrypted());
    assert!(!txn.authenticated());
    let status = txn.server_status().unwrap();
    assert_eq!(status.code, 250);
    assert_eq!(status.lines, vec!["Ok: queued as 12345".to_owned()]);
    assert_eq!(txn.progress(), 100);

    let transcript = handle.await.unwrap();
    let payload = &transcript.payloads[0];
    assert!(payload.contains("From: <a@x.example>\r\n"));
    assert!(payload.contains("To: <b@y.example>\r\n"));
    assert!(payload.contains("Subject: Hi\r\n"));
    assert!(payload.contains("\r\nHello world"));
}

#[tokio::test]
async fn tls_required_but_not_advertised() {
    let (server, handle) = mock_server(vec![
        Step::Banner("220 mock ESMTP ready"),
        Step::Command {
            expect: "EHLO",
            reply: "250-mock\r\n250 SIZE 35882577",
        },
        Step::Quit,
    ])
    .await;

    let (host, port) = server.rsplit_once(':').unwrap();
    let mut transport = Transport::builder()
        .port(port.parse().unwrap())
        .timeout(Duration::from_secs(5))
        .tls_level(TlsLevel::Required)
        .build();
    let txn = transport.queue_message(plain_message(&["b@y.example"]));
    transport.send(host).await;

    assert_eq!(txn.error_kind(), ErrorKind::TlsRequired);
    assert!(txn.is_finished());

    let transcript = handle.await.unwrap();
    // no MAIL FROM was ever sent
    assert!(transcript
        .commands
        .iter()
        .all(|c| !c.starts_with("MAIL FROM")));
}

#[tokio::test]
async fn transient_error_during_rcpt_moves_to_next_message() {
    let (server, handle) = mock_server(vec![
        Step::Banner("220 mock ESMTP ready"),
        Step::Command {
            expect: "EHLO",
            reply: "250 mock",
        },
        Step::Command {
            expect: "MAIL FROM:<a@x.example>",
            reply: "250 Ok",
        },
        Step::Command {
            expect: "RCPT TO:<r1@y.example>",
            reply: "250 Ok",
        },
        Step::Command {
            expect: "RCPT TO:<r2@y.example>",
            reply: "452 Too many recipients",
        },
        Step::Command {
            expect: "RSET",
            reply: "250 Ok",
        },
        Step::Command {
            expect: "MAIL FROM:<a@x.example>",
            reply: "250 Ok",
        },
        Step::Command {
            expect: "RCPT TO:<b@y.example>",
            reply: "250 Ok",
        },
        Step::Command {
            expect: "DATA",
            reply: "354 go ahead",
        },
        Step::Data { reply: "250 Ok" },
        Step::Quit,
    ])
    .await;

    let (mut transport, host) = transport_for(&server);
    let rejected =
        transport.queue_message(plain_message(&["r1@y.example", "r2@y.example", "r3@y.example"]));
    let delivered = transport.queue_message(plain_message(&["b@y.example"]));
    transport.send(&host).await;

    assert_eq!(rejected.error_kind(), ErrorKind::Response);
    let status = rejected.server_status().unwrap();
    assert_eq!(status.code, 452);
    assert_eq!(status.lines, vec!["Too many recipients".to_owned()]);

    assert_eq!(delivered.error_kind(), ErrorKind::None);
    assert!(delivered.is_finished());

    let transcript = handle.await.unwrap();
    // the third recipient of the rejected message was never attempted
    assert!(transcript
        .commands
        .iter()
        .all(|c| !c.contains("r3@y.example")));
    assert_eq!(transcript.payloads.len(), 1);
}

#[tokio::test]
async fn auth_plain_round_trip() {
    let (server, handle) = mock_server(vec![
        Step::Banner("220 mock ESMTP ready"),
        Step::Command {
            expect: "EHLO",
            reply: "250-mock\r\n250 AUTH PLAIN",
        },
        Step::Command {
            expect: "AUTH PLAIN",
            reply: "334 ",
        },
        Step::Command {
            expect: "AHVzZXIAcGFzc3dvcmQ=",
            reply: "235 Authentication successful",
        },
        Step::Command {
            expect: "MAIL FROM:<a@x.example>",
            reply: "250 Ok",
        },
        Step::Command {
            expect: "RCPT TO:<b@y.example>",
            reply: "250 Ok",
        },
        Step::Command {
            expect: "DATA",
            reply: "354 go ahead",
        },
        Step::Data { reply: "250 Ok" },
        Step::Quit,
    ])
    .await;

    let (host, port) = server.rsplit_once(':').unwrap();
    let mut transport = Transport::builder()
        .port(port.parse().unwrap())
        .timeout(Duration::from_secs(5))
        .tls_level(TlsLevel::Disabled)
        .credentials("user", "password")
        .build();
    let txn = transport.queue_message(plain_message(&["b@y.example"]));
    transport.send(host).await;

    assert_eq!(txn.error_kind(), ErrorKind::None);
    assert!(txn.authenticated());
    assert_eq!(txn.auth_mechanism(), Some(AuthMechanism::Plain));
    assert_eq!(txn.username().as_deref(), Some("user"));
    handle.await.unwrap();
}

#[tokio::test]
async fn auth_login_round_trip() {
    let (server, handle) = mock_server(vec![
        Step::Banner("220 mock ESMTP ready"),
        Step::Command {
            expect: "EHLO",
            reply: "250-mock\r\n250 AUTH LOGIN",
        },
        Step::Command {
            expect: "AUTH LOGIN",
            // base64("Username:")
            reply: "334 VXNlcm5hbWU6",
        },
        Step::Command {
            // base64("alice")
            expect: "YWxpY2U=",
            // base64("Password:")
            reply: "334 UGFzc3dvcmQ6",
        },
        Step::Command {
            // base64("wonderland")
            expect: "d29uZGVybGFuZA==",
            reply: "235 ok",
        },
        Step::Command {
            expect: "MAIL FROM:",
            reply: "250 Ok",
        },
        Step::Command {
            expect: "RCPT TO:",
            reply: "250 Ok",
        },
        Step::Command {
            expect: "DATA",
            reply: "354 go ahead",
        },
        Step::Data { reply: "250 Ok" },
        Step::Quit,
    ])
    .await;

    let (host, port) = server.rsplit_once(':').unwrap();
    let mut transport = Transport::builder()
        .port(port.parse().unwrap())
        .timeout(Duration::from_secs(5))
        .tls_level(TlsLevel::Disabled)
        .credentials("alice", "wonderland")
        .build();
    let txn = transport.queue_message(plain_message(&["b@y.example"]));
    transport.send(host).await;

    assert_eq!(txn.error_kind(), ErrorKind::None);
    assert_eq!(txn.auth_mechanism(), Some(AuthMechanism::Login));
    handle.await.unwrap();
}

#[tokio::test]
async fn failed_authentication_flushes_queue() {
    let (server, handle) = mock_server(vec![
        Step::Banner("220 mock ESMTP ready"),
        Step::Command {
            expect: "EHLO",
            reply: "250-mock\r\n250 AUTH PLAIN",
        },
        Step::Command {
            expect: "AUTH PLAIN",
            reply: "334 ",
        },
        Step::Command {
            expect: "",
            reply: "535 Authentication credentials invalid",
        },
        Step::Quit,
    ])
    .await;

    let (host, port) = server.rsplit_once(':').unwrap();
    let mut transport = Transport::builder()
        .port(port.parse().unwrap())
        .timeout(Duration::from_secs(5))
        .tls_level(TlsLevel::Disabled)
        .credentials("user", "wrong")
        .build();
    let first = transport.queue_message(plain_message(&["b@y.example"]));
    let second = transport.queue_message(plain_message(&["c@y.example"]));
    transport.send(host).await;

    for txn in [&first, &second] {
        assert_eq!(txn.error_kind(), ErrorKind::Response);
        assert_eq!(txn.server_status().unwrap().code, 535);
        assert!(txn.is_finished());
    }
    handle.await.unwrap();
}

#[tokio::test]
async fn helo_fallback_when_ehlo_rejected() {
    let (server, handle) = mock_server(vec![
        Step::Banner("220 mock ready"),
        Step::Command {
            expect: "EHLO",
            reply: "502 command not implemented",
        },
        Step::Command {
            expect: "HELO localhost",
            reply: "250 mock",
        },
        Step::Command {
            expect: "MAIL FROM:",
            reply: "250 Ok",
        },
        Step::Command {
            expect: "RCPT TO:",
            reply: "250 Ok",
        },
        Step::Command {
            expect: "DATA",
            reply: "354 go ahead",
        },
        Step::Data { reply: "250 Ok" },
        Step::Quit,
    ])
    .await;

    let (mut transport, host) = transport_for(&server);
    let txn = transport.queue_message(plain_message(&["b@y.example"]));
    transport.send(&host).await;

    assert_eq!(txn.error_kind(), ErrorKind::None);
    handle.await.unwrap();
}

#[tokio::test]
async fn message_without_sender_fails_locally() {
    let (server, handle) = mock_server(vec![
        Step::Banner("220 mock ready"),
        Step::Command {
            expect: "EHLO",
            reply: "250 mock",
        },
        Step::Command {
            expect: "MAIL FROM:<a@x.example>",
            reply: "250 Ok",
        },
        Step::Command {
            expect: "RCPT TO:",
            reply: "250 Ok",
        },
        Step::Command {
            expect: "DATA",
            reply: "354 go ahead",
        },
        Step::Data { reply: "250 Ok" },
        Step::Quit,
    ])
    .await;

    let (mut transport, host) = transport_for(&server);
    let no_sender = transport.queue_message(
        Message::builder()
            .to(addr("b@y.example"))
            .body(BodyPart::new(b"x".to_vec()))
            .build(),
    );
    let no_recipients = transport.queue_message(
        Message::builder()
            .from(addr("a@x.example"))
            .body(BodyPart::new(b"x".to_vec()))
            .build(),
    );
    let good = transport.queue_message(plain_message(&["b@y.example"]));
    transport.send(&host).await;

    assert_eq!(no_sender.error_kind(), ErrorKind::NoSender);
    assert_eq!(no_recipients.error_kind(), ErrorKind::NoRecipients);
    assert_eq!(good.error_kind(), ErrorKind::None);
    handle.await.unwrap();
}

#[tokio::test]
async fn error_outside_transaction_flushes_queue() {
    let (server, handle) = mock_server(vec![
        Step::Banner("554 go away"),
        Step::Quit,
    ])
    .await;

    let (mut transport, host) = transport_for(&server);
    let first = transport.queue_message(plain_message(&["b@y.example"]));
    let second = transport.queue_message(plain_message(&["c@y.example"]));
    transport.send(&host).await;

    for txn in [&first, &second] {
        assert_eq!(txn.error_kind(), ErrorKind::Response);
        assert_eq!(txn.server_status().unwrap().code, 554);
    }
    handle.await.unwrap();
}

#[tokio::test]
async fn unresponsive_server_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    // accept but never send the banner
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        drop(stream);
    });

    let mut transport = Transport::builder()
        .port(addr.port())
        .timeout(Duration::from_millis(200))
        .tls_level(TlsLevel::Disabled)
        .build();
    let txn = transport.queue_message(plain_message(&["b@y.example"]));
    transport.send(&addr.ip().to_string()).await;

    assert_eq!(txn.error_kind(), ErrorKind::Timeout);
    assert!(txn.is_finished());
    server.abort();
}

#[tokio::test]
async fn abort_handle_cancels_delivery() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        drop(stream);
    });

    let mut transport = Transport::builder()
        .port(addr.port())
        .timeout(Duration::from_secs(30))
        .tls_level(TlsLevel::Disabled)
        .build();
    let txn = transport.queue_message(plain_message(&["b@y.example"]));
    let handle = transport.abort_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();
    });
    transport.send(&addr.ip().to_string()).await;

    assert_eq!(txn.error_kind(), ErrorKind::Aborted);
    assert!(txn.is_finished());
    server.abort();
}

#[tokio::test]
async fn aborted_transaction_is_skipped() {
    let (server, handle) = mock_server(vec![
        Step::Banner("220 mock ready"),
        Step::Command {
            expect: "EHLO",
            reply: "250 mock",
        },
        Step::Command {
            expect: "MAIL FROM:",
            reply: "250 Ok",
        },
        Step::Command {
            expect: "RCPT TO:<c@y.example>",
            reply: "250 Ok",
        },
        Step::Command {
            expect: "DATA",
            reply: "354 go ahead",
        },
        Step::Data { reply: "250 Ok" },
        Step::Quit,
    ])
    .await;

    let (mut transport, host) = transport_for(&server);
    let aborted = transport.queue_message(plain_message(&["b@y.example"]));
    let delivered = transport.queue_message(plain_message(&["c@y.example"]));
    aborted.abort();
    transport.send(&host).await;

    assert_eq!(aborted.error_kind(), ErrorKind::Aborted);
    assert_eq!(delivered.error_kind(), ErrorKind::None);

    let transcript = handle.await.unwrap();
    assert_eq!(transcript.payloads.len(), 1);
    assert!(transcript
        .commands
        .iter()
        .all(|c| !c.contains("b@y.example")));
}

#[tokio::test]
async fn transaction_events_are_ordered() {
    let (server, handle) = mock_server(vec![
        Step::Banner("220 mock ready"),
        Step::Command {
            expect: "EHLO",
            reply: "250 mock",
        },
        Step::Command {
            expect: "MAIL FROM:",
            reply: "550 no thanks",
        },
        Step::Command {
            expect: "RSET",
            reply: "250 Ok",
        },
        Step::Quit,
    ])
    .await;

    let (mut transport, host) = transport_for(&server);
    let txn = transport.queue_message(plain_message(&["b@y.example"]));
    let mut events = txn.events();
    transport.send(&host).await;

    use mailout::TransactionEvent;
    assert_eq!(
        events.try_recv().unwrap(),
        TransactionEvent::Error(ErrorKind::Response)
    );
    assert_eq!(events.try_recv().unwrap(), TransactionEvent::Finished);
    assert!(events.try_recv().is_err());
    handle.await.unwrap();
}
