//! ESMTP extension enumeration

use crate::transport::response::Response;

/// The EHLO keywords the session cares about: STARTTLS availability and
/// the advertised AUTH mechanisms.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ServerInfo {
    pub starttls: bool,
    pub auth: bool,
    pub auth_mechanisms: Vec<String>,
}

impl ServerInfo {
    /// Enumerate the keywords of an EHLO reply. Unknown keywords are
    /// ignored; a HELO session leaves everything off.
    pub(crate) fn from_response(response: &Response) -> ServerInfo {
        let mut info = ServerInfo::default();
        for line in response.lines() {
            let mut words = line.split_whitespace();
            match words.next() {
                Some("STARTTLS") => info.starttls = true,
                Some("AUTH") => {
                    info.auth = true;
                    info.auth_mechanisms
                        .extend(words.map(str::to_owned));
                }
                _ => {}
            }
        }
        info
    }

    pub(crate) fn advertises_mechanism(&self, name: &str) -> bool {
        self.auth_mechanisms.iter().any(|m| m == name)
    }
}
