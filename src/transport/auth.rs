//! SASL authentication mechanisms
//!
//! Three challenge/response mechanisms are supported: CRAM-MD5 (RFC
//! 2195), LOGIN and PLAIN (RFC 4616). Auto-selection picks the first
//! of these, in that order of preference, that the server advertises.

use std::fmt::{self, Display, Formatter};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::transport::extension::ServerInfo;

/// Authentication mechanism configuration and selection result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMechanism {
    /// Never authenticate
    Disabled,
    /// Pick the strongest mechanism the server advertises
    #[default]
    AutoSelect,
    /// CRAM-MD5, RFC 2195
    CramMd5,
    /// LOGIN
    Login,
    /// PLAIN, RFC 4616
    Plain,
}

impl Display for AuthMechanism {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuthMechanism::CramMd5 => "CRAM-MD5",
            AuthMechanism::Login => "LOGIN",
            AuthMechanism::Plain => "PLAIN",
            AuthMechanism::Disabled => "(disabled)",
            AuthMechanism::AutoSelect => "(auto)",
        })
    }
}

/// Ordered preference for auto-selection.
const PREFERENCE: [AuthMechanism; 3] = [
    AuthMechanism::CramMd5,
    AuthMechanism::Login,
    AuthMechanism::Plain,
];

/// Pick the mechanism to use against a server, or `None` when
/// authentication is disabled or the server offers no AUTH at all.
pub(crate) fn select(info: &ServerInfo, configured: AuthMechanism) -> Option<AuthMechanism> {
    if !info.auth {
        return None;
    }
    match configured {
        AuthMechanism::Disabled => None,
        AuthMechanism::AutoSelect => PREFERENCE
            .iter()
            .copied()
            .find(|m| info.advertises_mechanism(&m.to_string())),
        explicit => Some(explicit),
    }
}

/// Compute the reply to a `334` challenge. `challenge` is the raw text
/// after the code, i.e. base64-encoded bytes.
pub(crate) fn respond(
    mechanism: AuthMechanism,
    challenge: &str,
    username: &str,
    password: &str,
) -> String {
    let decoded = BASE64.decode(challenge.trim()).unwrap_or_default();
    match mechanism {
        AuthMechanism::CramMd5 => cram_md5(&decoded, username, password),
        AuthMechanism::Login => login(&decoded, username, password),
        AuthMechanism::Plain => plain(username, password),
        AuthMechanism::Disabled | AuthMechanism::AutoSelect => String::new(),
    }
}

/// RFC 2195: HMAC-MD5 over the challenge text, keyed with the password.
fn cram_md5(challenge: &[u8], username: &str, password: &str) -> String {
    // keys longer than the MD5 block are replaced by their digest
    let mut key = password.as_bytes().to_vec();
    if key.len() > 64 {
        key = md5::compute(&key).0.to_vec();
    }
    key.resize(64, 0);

    let mut inner = Vec::with_capacity(64 + challenge.len());
    inner.extend(key.iter().map(|b| b ^ 0x36));
    inner.extend_from_slice(challenge);

    let mut outer = Vec::with_capacity(64 + 16);
    outer.extend(key.iter().map(|b| b ^ 0x5c));
    outer.extend_from_slice(&md5::compute(&inner).0);

    let digest = md5::compute(&outer);
    BASE64.encode(format!("{} {:x}", username, digest).as_bytes())
}

/// The LOGIN challenge is the plaintext prompt `Username:` or
/// `Password:`; anything else gets an empty reply.
fn login(challenge: &[u8], username: &str, password: &str) -> String {
    match challenge {
        b"Username:" => BASE64.encode(username.as_bytes()),
        b"Password:" => BASE64.encode(password.as_bytes()),
        _ => String::new(),
    }
}

/// RFC 4616: `\0user\0pass`, fields capped at 255 octets.
fn plain(username: &str, password: &str) -> String {
    let user = username.as_bytes();
    let pass = password.as_bytes();
    let mut payload = Vec::with_capacity(user.len() + pass.len() + 2);
    payload.push(0);
    payload.extend_from_slice(&user[..user.len().min(255)]);
    payload.push(0);
    payload.extend_from_slice(&pass[..pass.len().min(255)]);
    BASE64.encode(payload)
}
