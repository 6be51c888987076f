//! Full-message rendering tests: wire format, encoder selection and
//! DATA safety of the produced payload.

use mailout::{
    renderer::Renderer, Address, BodyPart, Disposition, EncoderKind, Message, MimePart, Multipart,
};

fn addr(s: &str) -> Address {
    s.parse().unwrap()
}

fn render(message: &Message) -> Vec<u8> {
    let mut renderer = Renderer::new(message, 8192, 76);
    renderer.run().unwrap();
    let mut out = Vec::new();
    loop {
        renderer.fill().unwrap();
        let n = renderer.bytes_available();
        if n == 0 {
            if renderer.at_end() {
                break;
            }
            continue;
        }
        out.extend_from_slice(&renderer.data()[..n]);
        renderer.advance(n);
    }
    out
}

fn base_message() -> mailout::MessageBuilder {
    Message::builder()
        .message_id("<fixed@localhost>")
        .from(addr("a@x.example"))
        .to(addr("b@y.example"))
        .date(chrono::DateTime::from_timestamp(784887151, 0).unwrap())
}

#[test]
fn multipart_with_text_and_binary_attachment() {
    let attachment_bytes: Vec<u8> = (0u8..=255).cycle().take(600).collect();
    let message = base_message()
        .subject("mixed")
        .body(
            Multipart::mixed()
                .boundary("XXXXboundaryXXXX")
                .part(MimePart::text("Der Inhalt: ein Umlaut-Text mit Ümläuten."))
                .part(
                    MimePart::builder()
                        .content_type("application/octet-stream")
                        .disposition(Disposition::Attachment)
                        .filename("blob.bin")
                        .body(attachment_bytes.clone()),
                ),
        )
        .build();

    let text = String::from_utf8(render(&message)).unwrap();

    // structure: headers, opening boundary, two parts, closing boundary
    assert!(text.contains("MIME-Version: 1.0\r\n"));
    assert!(text.contains("Content-Type: multipart/mixed; boundary=\"XXXXboundaryXXXX\"\r\n"));
    let opening = text.find("--XXXXboundaryXXXX\r\n").unwrap();
    let closing = text.find("\r\n--XXXXboundaryXXXX--\r\n").unwrap();
    assert!(opening < closing);
    assert!(text.ends_with("--XXXXboundaryXXXX--\r\n"));

    // text part is quoted-printable, attachment is base64
    assert!(text.contains("Content-Type: text/plain; charset=utf-8\r\n"));
    assert!(text.contains("Content-Transfer-Encoding: quoted-printable\r\n"));
    assert!(text.contains("=C3=9Cml=C3=A4uten"));
    assert!(text.contains("Content-Transfer-Encoding: base64\r\n"));
    assert!(text.contains("filename*=\"utf-8''blob.bin\""));

    // decode the base64 part back to the original bytes
    let b64_start = text.find("base64\r\n").unwrap();
    let b64_block = &text[b64_start..];
    let body_start = b64_block.find("\r\n\r\n").unwrap() + 4;
    let body_end = b64_block.find("\r\n--XXXXboundaryXXXX--").unwrap();
    let encoded: String = b64_block[body_start..body_end]
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    assert_eq!(STANDARD.decode(encoded).unwrap(), attachment_bytes);
}

#[test]
fn no_payload_line_is_a_lone_dot() {
    let message = base_message()
        .subject("dots")
        .body(
            Multipart::mixed().part(MimePart::text(
                ".\r\n.\r\n.leading dots everywhere\r\n.\r\n",
            )),
        )
        .build();

    let rendered = render(&message);
    let text = String::from_utf8(rendered).unwrap();
    for line in text.split("\r\n") {
        assert_ne!(line, ".", "payload contains a bare dot line");
        assert!(!line.starts_with('.'), "line starts with a dot: {line:?}");
    }
}

#[test]
fn qp_dot_and_trailing_space_safety() {
    let message = base_message()
        .body(
            Multipart::mixed().part(
                MimePart::builder()
                    .content_type("text/plain; charset=us-ascii")
                    .encoder(EncoderKind::QuotedPrintable)
                    .body(b".start\r\nend ".to_vec()),
            ),
        )
        .build();

    let text = String::from_utf8(render(&message)).unwrap();
    assert!(text.contains("=2Estart\r\nend=20"));
}

#[test]
fn streamed_file_attachment_round_trips() {
    use std::io::Write;

    let payload: Vec<u8> = (0u8..=255).cycle().take(200_000).collect();
    let mut path = std::env::temp_dir();
    path.push(format!("mailout-render-test-{}.bin", std::process::id()));
    {
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&payload).unwrap();
    }

    let message = base_message()
        .body(
            Multipart::mixed()
                .boundary("filebound")
                .part(MimePart::attachment(&path).unwrap()),
        )
        .build();

    let text = String::from_utf8(render(&message)).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert!(text.contains("Content-Transfer-Encoding: base64\r\n"));
    assert!(text.contains(";\r\n\tsize=200000"));
    let body_start = text.find("base64\r\n").unwrap();
    let block = &text[body_start..];
    let start = block.find("\r\n\r\n").unwrap() + 4;
    let end = block.find("\r\n--filebound--").unwrap();
    let encoded: String = block[start..end]
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    assert_eq!(STANDARD.decode(encoded).unwrap(), payload);

    // base64 line folding respected the default width
    for line in text[body_start..].split("\r\n") {
        assert!(line.len() <= 76);
    }
}

#[test]
fn simple_body_renders_headers_then_body() {
    let message = base_message()
        .subject("plain")
        .body(BodyPart::new(b"Hello world".to_vec()))
        .build();
    let text = String::from_utf8(render(&message)).unwrap();

    let split = text.find("\r\n\r\n").unwrap();
    let (headers, body) = text.split_at(split + 4);
    assert!(headers.contains("Message-ID: <fixed@localhost>\r\n"));
    assert!(headers.contains("Date: Tue, 15 Nov 1994 08:12:31 +0000\r\n"));
    assert!(!headers.contains("MIME-Version"));
    assert_eq!(body, "Hello world");
}

#[test]
fn alternative_parts_keep_document_order() {
    let message = base_message()
        .body(
            Multipart::alternative()
                .boundary("alt")
                .part(MimePart::text("plain version"))
                .part(
                    MimePart::builder()
                        .content_type("text/html; charset=utf-8")
                        .body(b"<p>html version</p>".to_vec()),
                ),
        )
        .build();
    let text = String::from_utf8(render(&message)).unwrap();
    let plain = text.find("plain version").unwrap();
    let html = text.find("html version").unwrap();
    assert!(plain < html);
    assert!(text.contains("Content-Type: multipart/alternative; boundary=\"alt\"\r\n"));
}
