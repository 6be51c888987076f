//! Email address representation

use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};

use crate::rfc;

/// A single mailbox: the `addr-spec` plus an optional display name.
///
/// The address part is validated lexically at construction, so every
/// `Address` held by a [`Message`][crate::Message] is syntactically
/// valid. The display name may contain any UTF-8 text; it is converted
/// to RFC 2047 encoded words when the address is put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    addr: String,
    display: Option<String>,
}

/// Errors while creating an [`Address`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    /// The addr-spec does not follow RFC 5322 syntax
    #[error("invalid address syntax: {0:?}")]
    InvalidSyntax(String),
}

impl Address {
    /// Create an address from an `addr-spec` like `user@example.com`
    pub fn new<S: Into<String>>(addr: S) -> Result<Address, AddressError> {
        let addr = addr.into();
        if !rfc::validate_addr_spec(&addr) {
            return Err(AddressError::InvalidSyntax(addr));
        }
        Ok(Address {
            addr,
            display: None,
        })
    }

    /// Create an address with a display name, e.g. `Henry Müller
    /// <h.mueller@foo.com>`
    pub fn with_display<S: Into<String>, D: Into<String>>(
        addr: S,
        display: D,
    ) -> Result<Address, AddressError> {
        let mut address = Address::new(addr)?;
        address.display = Some(display.into());
        Ok(address)
    }

    /// The bare `addr-spec`, as used in `MAIL FROM` and `RCPT TO`
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// The display name, if one was set
    pub fn display(&self) -> Option<&str> {
        self.display.as_deref()
    }

    /// The on-wire header form: `<addr>` alone, or `Display <addr>` with
    /// the display name in encoded words when it is not plain ASCII
    pub fn to_header_bytes(&self) -> Vec<u8> {
        match &self.display {
            Some(display) => {
                format!("{} <{}>", rfc::to_encoded_words(display), self.addr).into_bytes()
            }
            None => format!("<{}>", self.addr).into_bytes(),
        }
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.display {
            Some(display) => write!(f, "{} <{}>", display, self.addr),
            None => f.write_str(&self.addr),
        }
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::new(s)
    }
}
