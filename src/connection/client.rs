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

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

use crate::{
    smtp::{
        auth::{self, Credentials, Mechanism},
        capability::Capabilities,
        envelope::{Envelope, Rejection, SendResult},
        reply::{Reply, Severity},
        stream::{BodyEncoder, SmtpStream},
    },
    Error, Phase, SmtpConnection, TimeoutStage,
};

impl SmtpConnection {
    fn pop_reply(&mut self) -> Option<Reply> {
        let reply = self.parser.pop()?;
        trace!("S: {}", reply);
        Some(reply)
    }

    /// Performs one read and feeds the parser.
    async fn fill(&mut self, buf: &mut [u8]) -> crate::Result<()> {
        let br = self.stream.read(buf).await?;
        if br == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by server",
            )));
        }
        self.parser.receive(&buf[..br])?;
        Ok(())
    }

    /// Waits for the connection greeting under a single absolute
    /// window. A banner trickling in line by line does not extend it;
    /// only a complete reply stops the clock.
    pub(crate) async fn read_greeting(&mut self, timeout: Duration) -> crate::Result<Reply> {
        tokio::time::timeout(timeout, async {
            let mut buf = vec![0u8; 1024];
            loop {
                if let Some(reply) = self.pop_reply() {
                    return Ok(reply);
                }
                self.fill(&mut buf).await?;
            }
        })
        .await
        .map_err(|_| Error::Timeout(TimeoutStage::Greeting))?
    }

    /// Reads from the server until a complete reply is available. The
    /// inactivity watchdog re-arms on every read.
    pub(crate) async fn read_reply(&mut self) -> crate::Result<Reply> {
        let mut buf = vec![0u8; 1024];

        loop {
            if let Some(reply) = self.pop_reply() {
                return Ok(reply);
            }

            tokio::time::timeout(self.timeouts.inactivity, self.fill(&mut buf))
                .await
                .map_err(|_| Error::Timeout(TimeoutStage::Inactivity))??;
        }
    }

    /// Sends a command to the SMTP server and waits for the reply.
    pub(crate) async fn cmd(&mut self, bytes: &[u8]) -> crate::Result<Reply> {
        trace!("C: {}", String::from_utf8_lossy(bytes).trim_end());

        tokio::time::timeout(self.timeouts.inactivity, async {
            self.stream.write_all(bytes).await?;
            self.stream.flush().await
        })
        .await
        .map_err(|_| Error::Timeout(TimeoutStage::Inactivity))??;

        self.read_reply().await
    }

    /// Sends EHLO and stores the advertised capabilities, falling back to
    /// HELO for servers that predate extensions.
    pub(crate) async fn ehlo(&mut self, local_host: &str) -> crate::Result<()> {
        let reply = self
            .cmd(format!("EHLO {}\r\n", local_host).as_bytes())
            .await?;

        self.capabilities = if reply.severity() == Severity::PositiveCompletion {
            Capabilities::try_from(reply)?
        } else {
            self.cmd(format!("HELO {}\r\n", local_host).as_bytes())
                .await?
                .assert_severity(Severity::PositiveCompletion)?;
            Capabilities::default()
        };
        Ok(())
    }

    /// Authenticates the session with the mechanism the credentials and
    /// the advertised `AUTH` list agree on.
    ///
    /// A rejection by the server leaves the connection usable, so the
    /// caller may retry on the same session with other credentials.
    pub async fn login(&mut self, credentials: &Credentials<'_>) -> crate::Result<()> {
        self.ensure_ready()?;
        match self.do_login(credentials).await {
            Ok(()) => {
                self.authenticated = true;
                debug!(username = credentials.username(), "authenticated");
                Ok(())
            }
            Err(err) => Err(self.handle_error(err)),
        }
    }

    async fn do_login(&mut self, credentials: &Credentials<'_>) -> crate::Result<()> {
        let mechanisms = self.capabilities.auth().unwrap_or_default();

        match credentials {
            Credentials::Plain { username, secret } => {
                if mechanisms.contains(&Mechanism::Plain) {
                    self.auth_plain(username, secret).await
                } else if mechanisms.contains(&Mechanism::Login) {
                    self.auth_login(username, secret).await
                } else {
                    Err(Error::UnsupportedAuthMechanism)
                }
            }
            Credentials::Token { username, token } => {
                if !mechanisms.contains(&Mechanism::XOauth2) {
                    return Err(Error::UnsupportedAuthMechanism);
                }
                self.auth_xoauth2(username, token).await
            }
            Credentials::Generator { username, source } => {
                // The mechanism gate runs before the source is consulted,
                // so no token is ever fetched for nothing.
                if !mechanisms.contains(&Mechanism::XOauth2) {
                    return Err(Error::UnsupportedAuthMechanism);
                }
                let token = source.token().await.map_err(Error::Auth)?;
                self.auth_xoauth2(username, &token).await
            }
        }
    }

    async fn auth_plain(&mut self, username: &str, secret: &str) -> crate::Result<()> {
        let reply = self
            .cmd(format!("AUTH PLAIN {}\r\n", auth::plain_payload(username, secret)).as_bytes())
            .await?;

        if reply.severity() == Severity::PositiveCompletion {
            Ok(())
        } else {
            Err(Error::AuthenticationFailed(reply))
        }
    }

    async fn auth_login(&mut self, username: &str, secret: &str) -> crate::Result<()> {
        let mut reply = self.cmd(b"AUTH LOGIN\r\n").await?;

        // Username and password prompts, with one round to spare
        for _ in 0..3 {
            match reply.code() {
                334 => {
                    let challenge = reply.message().first().map_or("", |s| s.as_str());
                    let response = auth::login_response(challenge, username, secret)?;
                    reply = self.cmd(format!("{}\r\n", response).as_bytes()).await?;
                }
                _ if reply.severity() == Severity::PositiveCompletion => return Ok(()),
                _ => return Err(Error::AuthenticationFailed(reply)),
            }
        }

        Err(Error::AuthenticationFailed(reply))
    }

    async fn auth_xoauth2(&mut self, username: &str, token: &str) -> crate::Result<()> {
        let reply = self
            .cmd(format!("AUTH XOAUTH2 {}\r\n", auth::xoauth2_payload(username, token)).as_bytes())
            .await?;

        match reply.code() {
            // A rejection arrives as a challenge carrying the error
            // details; an empty response makes the server close the
            // exchange with its verdict.
            334 => {
                let reply = self.cmd(b"\r\n").await?;
                Err(Error::AuthenticationFailed(reply))
            }
            _ if reply.severity() == Severity::PositiveCompletion => Ok(()),
            _ => Err(Error::AuthenticationFailed(reply)),
        }
    }

    /// Submits a message held in memory. See [`SmtpConnection::send_stream`].
    pub async fn send(
        &mut self,
        envelope: &Envelope<'_>,
        message: &[u8],
    ) -> crate::Result<SendResult> {
        self.send_stream(envelope, message).await
    }

    /// Submits a message streamed from `message`, canonicalizing line
    /// endings and applying the dot transparency procedure on the fly.
    ///
    /// Per-recipient rejections do not abort the transaction; they are
    /// reported in the returned [`SendResult`]. The transaction fails
    /// without a DATA phase when the server turns every recipient away.
    pub async fn send_stream<R>(
        &mut self,
        envelope: &Envelope<'_>,
        message: R,
    ) -> crate::Result<SendResult>
    where
        R: AsyncRead + Unpin,
    {
        self.ensure_ready()?;
        match self.do_send(envelope, message).await {
            Ok(result) => {
                debug!(
                    accepted = result.accepted.len(),
                    rejected = result.rejected.len(),
                    "message accepted for delivery"
                );
                Ok(result)
            }
            Err(err) => Err(self.handle_error(err)),
        }
    }

    async fn do_send<R>(
        &mut self,
        envelope: &Envelope<'_>,
        mut message: R,
    ) -> crate::Result<SendResult>
    where
        R: AsyncRead + Unpin,
    {
        envelope.validate()?;
        let params = envelope.mail_parameters(&self.capabilities)?;

        let reply = self
            .cmd(format!("MAIL FROM:<{}>{}\r\n", envelope.sender, params).as_bytes())
            .await?;
        if reply.severity() != Severity::PositiveCompletion {
            return Err(Error::SenderRejected(reply));
        }

        let mut accepted = Vec::with_capacity(envelope.recipients.len());
        let mut rejected = Vec::new();
        for recipient in &envelope.recipients {
            let reply = self
                .cmd(format!("RCPT TO:<{}>\r\n", recipient).as_bytes())
                .await?;
            if reply.severity() == Severity::PositiveCompletion {
                accepted.push(recipient.to_string());
            } else {
                rejected.push(Rejection {
                    address: recipient.to_string(),
                    reply,
                });
            }
        }

        if accepted.is_empty() {
            return Err(Error::RecipientsRejected(rejected));
        }

        let reply = self.cmd(b"DATA\r\n").await?;
        if reply.severity() != Severity::PositiveIntermediate {
            return Err(Error::MessageRejected(reply));
        }

        self.write_body(&mut message).await?;

        let reply = self.read_reply().await?;
        if reply.severity() != Severity::PositiveCompletion {
            return Err(Error::MessageRejected(reply));
        }

        Ok(SendResult {
            accepted,
            rejected,
            response: reply,
        })
    }

    async fn write_body<R>(&mut self, message: &mut R) -> crate::Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut encoder = BodyEncoder::new();
        let mut chunk = vec![0u8; 4096];
        let mut out = Vec::with_capacity(8192);

        loop {
            let br = tokio::time::timeout(self.timeouts.inactivity, message.read(&mut chunk))
                .await
                .map_err(|_| Error::Timeout(TimeoutStage::Inactivity))??;
            if br == 0 {
                break;
            }

            out.clear();
            encoder.encode(&chunk[..br], &mut out);
            self.write_chunk(&out).await?;
        }

        out.clear();
        encoder.finish(&mut out);
        self.write_chunk(&out).await?;

        tokio::time::timeout(self.timeouts.inactivity, self.stream.flush())
            .await
            .map_err(|_| Error::Timeout(TimeoutStage::Inactivity))??;
        Ok(())
    }

    async fn write_chunk(&mut self, bytes: &[u8]) -> crate::Result<()> {
        tokio::time::timeout(self.timeouts.inactivity, self.stream.write_all(bytes))
            .await
            .map_err(|_| Error::Timeout(TimeoutStage::Inactivity))??;
        Ok(())
    }

    /// Closes the session, sending a best-effort QUIT when the connection
    /// is still healthy. Closing an already released session is a no-op.
    pub async fn close(&mut self) {
        if self.phase == Phase::Ready {
            trace!("C: QUIT");
            let _ = tokio::time::timeout(self.timeouts.inactivity, async {
                self.stream.write_all(b"QUIT\r\n").await?;
                self.stream.flush().await
            })
            .await;
            let _ = self.stream.shutdown().await;
        }

        if self.phase != Phase::Closed {
            self.stream = SmtpStream::Closed;
            self.phase = Phase::Closed;
            debug!("session closed");
        }
    }

    fn ensure_ready(&self) -> crate::Result<()> {
        if self.phase == Phase::Ready {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    /// Applies an operation's outcome to the session: fatal errors
    /// release the transport, everything else leaves the session ready.
    fn handle_error(&mut self, err: Error) -> Error {
        if err.is_fatal() {
            self.stream = SmtpStream::Closed;
            self.phase = Phase::Errored;
            debug!(error = %err, "session failed");
        }
        err
    }

    /// Extension set advertised by the most recent EHLO.
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Whether the transport is protected by TLS.
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Whether the session has authenticated successfully.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Advertised maximum message size, when the server declares one.
    pub fn max_message_size(&self) -> Option<usize> {
        self.capabilities.size().filter(|size| *size > 0)
    }
}
