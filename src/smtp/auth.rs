/*
 * Copyright Stalwart Labs Ltd.
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

use std::{borrow::Cow, convert::TryFrom, fmt::Display, sync::Arc};

use base64::{engine::general_purpose::STANDARD, Engine};

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("invalid challenge received")]
    InvalidChallenge,
    #[error("token source failed: {0}")]
    TokenSource(String),
}

/// Supplies OAuth bearer tokens for XOAUTH2 authentication.
///
/// The source is consulted on every authentication attempt, which lets
/// implementations refresh an expired token before the session retries.
#[async_trait::async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> Result<String, Error>;
}

/// Authentication credentials.
#[derive(Clone)]
pub enum Credentials<'x> {
    /// Username and password, usable with the PLAIN and LOGIN mechanisms.
    Plain {
        username: Cow<'x, str>,
        secret: Cow<'x, str>,
    },
    /// A previously obtained OAuth bearer token, usable with XOAUTH2.
    Token {
        username: Cow<'x, str>,
        token: Cow<'x, str>,
    },
    /// Obtains a fresh OAuth bearer token on demand, usable with XOAUTH2.
    Generator {
        username: Cow<'x, str>,
        source: Arc<dyn TokenSource>,
    },
}

impl<'x> From<(&'x str, &'x str)> for Credentials<'x> {
    fn from(credentials: (&'x str, &'x str)) -> Self {
        Credentials::new(credentials.0, credentials.1)
    }
}

impl<'x> From<(String, String)> for Credentials<'x> {
    fn from(credentials: (String, String)) -> Self {
        Credentials::new(credentials.0, credentials.1)
    }
}

/// Authentication mechanism
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Mechanism {
    /// Plain
    Plain = 5,

    /// Login
    Login = 4,

    /// SASL XOAUTH2 (used by Google)
    XOauth2 = 1,
}

impl TryFrom<&str> for Mechanism {
    type Error = ();

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        if s.eq_ignore_ascii_case("PLAIN") {
            Ok(Mechanism::Plain)
        } else if s.eq_ignore_ascii_case("LOGIN") {
            Ok(Mechanism::Login)
        } else if s.eq_ignore_ascii_case("XOAUTH2") {
            Ok(Mechanism::XOauth2)
        } else {
            Err(())
        }
    }
}

impl Display for Mechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mechanism::Plain => write!(f, "PLAIN"),
            Mechanism::Login => write!(f, "LOGIN"),
            Mechanism::XOauth2 => write!(f, "XOAUTH2"),
        }
    }
}

impl<'x> Credentials<'x> {
    /// Creates username and password credentials.
    pub fn new(
        username: impl Into<Cow<'x, str>>,
        secret: impl Into<Cow<'x, str>>,
    ) -> Credentials<'x> {
        Credentials::Plain {
            username: username.into(),
            secret: secret.into(),
        }
    }

    /// Creates credentials around an OAuth bearer token.
    pub fn token(
        username: impl Into<Cow<'x, str>>,
        token: impl Into<Cow<'x, str>>,
    ) -> Credentials<'x> {
        Credentials::Token {
            username: username.into(),
            token: token.into(),
        }
    }

    /// Creates credentials that request a token from `source` each time
    /// authentication runs.
    pub fn generator(
        username: impl Into<Cow<'x, str>>,
        source: Arc<dyn TokenSource>,
    ) -> Credentials<'x> {
        Credentials::Generator {
            username: username.into(),
            source,
        }
    }

    pub fn username(&self) -> &str {
        match self {
            Credentials::Plain { username, .. }
            | Credentials::Token { username, .. }
            | Credentials::Generator { username, .. } => username,
        }
    }
}

pub(crate) fn plain_payload(username: &str, secret: &str) -> String {
    STANDARD.encode(format!("\u{0}{}\u{0}{}", username, secret))
}

pub(crate) fn xoauth2_payload(username: &str, token: &str) -> String {
    STANDARD.encode(format!("user={}\x01auth=Bearer {}\x01\x01", username, token))
}

/// Answers a LOGIN `334` challenge with the username or the password,
/// depending on which prompt the server sent.
pub(crate) fn login_response(
    challenge: &str,
    username: &str,
    secret: &str,
) -> crate::Result<String> {
    let challenge = STANDARD.decode(challenge)?;

    let value = if starts_with_ignore_ascii_case(&challenge, b"user name")
        // Because Google makes its own standards
        || starts_with_ignore_ascii_case(&challenge, b"username")
    {
        username
    } else if starts_with_ignore_ascii_case(&challenge, b"password") {
        secret
    } else {
        return Err(Error::InvalidChallenge.into());
    };

    Ok(STANDARD.encode(value))
}

fn starts_with_ignore_ascii_case(bytes: &[u8], prefix: &[u8]) -> bool {
    bytes.len() >= prefix.len() && bytes[..prefix.len()].eq_ignore_ascii_case(prefix)
}
