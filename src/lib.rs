/*
 * Copyright Stalwart Labs Ltd. See the COPYING
 * file at the top-level directory of this distribution.
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! # smtp-session
//!
//! [![crates.io](https://img.shields.io/crates/v/smtp-session)](https://crates.io/crates/smtp-session)
//! [![build](https://github.com/stalwartlabs/smtp-session/actions/workflows/rust.yml/badge.svg)](https://github.com/stalwartlabs/smtp-session/actions/workflows/rust.yml)
//! [![docs.rs](https://img.shields.io/docsrs/smtp-session)](https://docs.rs/smtp-session)
//! [![crates.io](https://img.shields.io/crates/l/smtp-session)](http://www.apache.org/licenses/LICENSE-2.0)
//!
//! _smtp-session_ is a Rust library implementing the client side of a single
//! SMTP connection. It includes the following features:
//!
//! - Simple Mail Transfer Protocol (**SMTP**; _RFC 5321_) session management
//!   over one owned connection.
//! - SMTP Service Extension for Secure SMTP over **TLS** (_RFC 3207_) with
//!   implicit TLS, opportunistic and mandatory STARTTLS policies.
//! - SMTP Service Extension for Authentication (_RFC 4954_):
//!   - PLAIN
//!   - LOGIN
//!   - XOAUTH2 (with pluggable token sources for refreshable OAuth tokens)
//! - **SMTPUTF8** (_RFC 6531_), **SIZE** and **8BITMIME** extension
//!   negotiation.
//! - Streamed message submission with on-the-fly dot-stuffing and line ending
//!   canonicalization.
//! - Per-recipient delivery accounting.
//! - Full async (requires Tokio).
//!
//! ## Usage Example
//!
//! ```rust
//!     // Connect to an SMTP submission server, upgrading the connection
//!     // to TLS before anything else is sent.
//!     let mut conn = SmtpConnectionBuilder::new("mail.example.com", 587)
//!         .security(Security::Required)
//!         .connect()
//!         .await
//!         .unwrap();
//!
//!     // Authenticate using the provided credentials.
//!     conn.login(&Credentials::new("john", "p4ssw0rd"))
//!         .await
//!         .unwrap();
//!
//!     // Submit a message, keeping track of which recipients the
//!     // server accepted.
//!     let result = conn
//!         .send(
//!             &Envelope::new("john@example.com")
//!                 .to("jane@example.com")
//!                 .to("james@test.com"),
//!             b"From: john@example.com\r\nSubject: Hi!\r\n\r\nHello, world!\r\n",
//!         )
//!         .await
//!         .unwrap();
//!     println!("{} recipients accepted", result.accepted.len());
//!
//!     conn.close().await;
//! ```
//!
//! Message composition and parsing are not provided by this library; the
//! [`mail-builder`](https://crates.io/crates/mail-builder) and
//! [`mail-parser`](https://crates.io/crates/mail-parser) crates cover that
//! functionality.
//!
//! ## Testing
//!
//! To run the testsuite:
//!
//! ```bash
//!  $ cargo test --all-features
//! ```
//!
//! ## License
//!
//! Licensed under either of
//!
//!  * Apache License, Version 2.0 ([LICENSE-APACHE](LICENSE-APACHE) or <http://www.apache.org/licenses/LICENSE-2.0>)
//!  * MIT license ([LICENSE-MIT](LICENSE-MIT) or <http://opensource.org/licenses/MIT>)
//!
//! at your option.
//!
//! ## Copyright
//!
//! Copyright (C) 2020-2022, Stalwart Labs Ltd.
//!
//! See [COPYING] for the license.
//!
//! [COPYING]: https://github.com/stalwartlabs/smtp-session/blob/main/COPYING
//!

#[forbid(unsafe_code)]
pub mod connection;
pub mod smtp;

use std::fmt::Display;

use connection::builder::Timeouts;
use smtp::capability::Capabilities;
use smtp::reply::ReplyParser;
use smtp::stream::SmtpStream;

pub use connection::builder::{Security, SmtpConnectionBuilder};
pub use smtp::auth::{Credentials, Mechanism, TokenSource};
pub use smtp::capability::Capability;
pub use smtp::envelope::{Envelope, Rejection, SendResult};
pub use smtp::reply::{Reply, Severity};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Base64 decode error
    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// SMTP authentication error.
    #[error("SMTP authentication error: {0}")]
    Auth(#[from] smtp::auth::Error),

    /// Failure parsing SMTP reply
    #[error("Unparseable SMTP reply: {0}")]
    UnparseableReply(#[from] smtp::reply::Error),

    /// Unexpected SMTP reply.
    #[error("Unexpected reply: {0}")]
    UnexpectedReply(Reply),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(Box<rustls::Error>),

    /// Invalid TLS name provided.
    #[error("Invalid TLS name provided")]
    InvalidTlsName,

    /// TLS was required but the server does not advertise STARTTLS.
    #[error("The server does not support STARTTLS")]
    StartTlsUnavailable,

    /// SMTP authentication failure.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(Reply),

    /// The server advertises none of the mechanisms the credentials can use.
    #[error("The server does not support any of the available authentication mechanisms")]
    UnsupportedAuthMechanism,

    /// Malformed sender or recipient address.
    #[error("Invalid address: {0:?}")]
    InvalidAddress(String),

    /// Missing message recipients.
    #[error("Missing message recipients")]
    MissingRcptTo,

    /// The envelope requires SMTPUTF8 but the server does not offer it.
    #[error("The server does not support SMTPUTF8")]
    SmtpUtf8Unavailable,

    /// The message exceeds the size limit advertised by the server.
    #[error("Message exceeds the maximum size accepted by the server")]
    MessageTooLarge,

    /// The server rejected the message sender.
    #[error("Sender rejected: {0}")]
    SenderRejected(Reply),

    /// The server rejected every recipient in the envelope.
    #[error("The server rejected all {} recipients", .0.len())]
    RecipientsRejected(Vec<Rejection>),

    /// The server rejected the message contents.
    #[error("Message rejected: {0}")]
    MessageRejected(Reply),

    /// Operation timeout.
    #[error("Timed out waiting for {0}")]
    Timeout(TimeoutStage),

    /// The connection is closed or no longer usable.
    #[error("Not connected")]
    NotConnected,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Watchdog that expired while waiting on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutStage {
    /// Establishing the TCP connection or TLS session.
    Connect,
    /// Waiting for the first server greeting.
    Greeting,
    /// Waiting for server activity on an established session.
    Inactivity,
}

/// Session lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Connected, greeted and ready for commands.
    Ready,
    /// Released by [`SmtpConnection::close`] or by the remote end.
    Closed,
    /// Torn down after a fatal error.
    Errored,
}

/// An established SMTP client connection.
///
/// Obtained from [`SmtpConnectionBuilder::connect`]. Commands are issued
/// strictly one at a time through `&mut self`; a fatal error releases the
/// underlying transport and fails every subsequent call with
/// [`Error::NotConnected`].
pub struct SmtpConnection {
    pub(crate) stream: SmtpStream,
    pub(crate) parser: ReplyParser,
    pub(crate) capabilities: Capabilities,
    pub(crate) timeouts: Timeouts,
    pub(crate) phase: Phase,
    pub(crate) secure: bool,
    pub(crate) authenticated: bool,
}

impl std::fmt::Debug for SmtpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpConnection")
            .field("phase", &self.phase)
            .field("secure", &self.secure)
            .field("authenticated", &self.authenticated)
            .finish_non_exhaustive()
    }
}

impl Error {
    /// Whether the error leaves the connection unusable.
    ///
    /// Authentication and envelope rejections keep the session coherent and
    /// further commands may be issued on the same connection; transport,
    /// timeout and protocol errors release it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Base64(_)
                | Error::UnparseableReply(_)
                | Error::UnexpectedReply(_)
                | Error::Tls(_)
                | Error::InvalidTlsName
                | Error::StartTlsUnavailable
                | Error::Timeout(_)
        )
    }
}

impl Display for TimeoutStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TimeoutStage::Connect => "connection establishment",
            TimeoutStage::Greeting => "the server greeting",
            TimeoutStage::Inactivity => "server activity",
        })
    }
}
