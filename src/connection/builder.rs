/*
 * Copyright Stalwart Labs Ltd.
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

use std::{borrow::Cow, time::Duration};

use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::{
    smtp::{capability::Capability, reply::ReplyParser, stream::SmtpStream},
    Phase, SmtpConnection, TimeoutStage,
};

use super::tls::build_tls_connector;

/// TLS policy applied while establishing a session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Security {
    /// Stay in plaintext even when the server offers STARTTLS.
    None,
    /// Upgrade with STARTTLS when advertised, continue in plaintext
    /// otherwise.
    #[default]
    Opportunistic,
    /// Require a STARTTLS upgrade; fail without sending anything past
    /// EHLO when the server does not offer it.
    Required,
    /// TLS from the first byte, before the server greeting.
    Implicit,
}

/// Watchdogs applied while waiting on the server.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// TCP connect and TLS handshakes.
    pub connect: Duration,
    /// The whole wait for the first greeting, from transport
    /// establishment to the complete reply.
    pub greeting: Duration,
    /// Each read on an established session.
    pub inactivity: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            connect: Duration::from_secs(2 * 60),
            greeting: Duration::from_secs(30),
            inactivity: Duration::from_secs(10 * 60),
        }
    }
}

/// Builder for [`SmtpConnection`] sessions.
pub struct SmtpConnectionBuilder<'x> {
    hostname: Cow<'x, str>,
    port: u16,
    security: Security,
    tls_connector: TlsConnector,
    local_host: String,
    timeouts: Timeouts,
}

impl<'x> SmtpConnectionBuilder<'x> {
    pub fn new(hostname: impl Into<Cow<'x, str>>, port: u16) -> Self {
        SmtpConnectionBuilder {
            hostname: hostname.into(),
            port,
            security: Security::default(),
            tls_connector: build_tls_connector(false),
            local_host: gethostname::gethostname()
                .to_str()
                .unwrap_or("[127.0.0.1]")
                .to_string(),
            timeouts: Timeouts::default(),
        }
    }

    /// Sets the TLS policy.
    pub fn security(mut self, security: Security) -> Self {
        self.security = security;
        self
    }

    /// Allow invalid TLS certificates
    pub fn allow_invalid_certs(mut self) -> Self {
        self.tls_connector = build_tls_connector(true);
        self
    }

    /// Set the EHLO hostname
    pub fn helo_host(mut self, host: impl Into<String>) -> Self {
        self.local_host = host.into();
        self
    }

    /// Sets the timeout for establishing the TCP connection and TLS
    /// handshakes.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.connect = timeout;
        self
    }

    /// Sets the timeout for the first server greeting.
    pub fn greeting_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.greeting = timeout;
        self
    }

    /// Sets the inactivity timeout applied to every read on the
    /// established session.
    pub fn socket_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.inactivity = timeout;
        self
    }

    /// Connects to the server and negotiates a session according to the
    /// configured policy.
    pub async fn connect(&self) -> crate::Result<SmtpConnection> {
        let stream = tokio::time::timeout(
            self.timeouts.connect,
            TcpStream::connect(format!("{}:{}", self.hostname, self.port)),
        )
        .await
        .map_err(|_| crate::Error::Timeout(TimeoutStage::Connect))??;

        self.handshake(stream).await
    }

    /// Negotiates a session over a transport the caller established,
    /// for dialers that go through a proxy or pick addresses themselves.
    /// The connect timeout does not apply.
    pub async fn connect_with(&self, stream: TcpStream) -> crate::Result<SmtpConnection> {
        self.handshake(stream).await
    }

    async fn handshake(&self, stream: TcpStream) -> crate::Result<SmtpConnection> {
        let mut conn = SmtpConnection {
            stream: SmtpStream::Tcp(stream),
            parser: ReplyParser::new(),
            capabilities: Default::default(),
            timeouts: self.timeouts,
            phase: Phase::Ready,
            secure: false,
            authenticated: false,
        };

        if self.security == Security::Implicit {
            conn.upgrade_tls(&self.tls_connector, self.hostname.as_ref())
                .await?;
        }

        // Read greeting
        conn.read_greeting(self.timeouts.greeting)
            .await?
            .assert_code(220)?;

        conn.ehlo(&self.local_host).await?;

        if !conn.secure {
            match self.security {
                Security::Opportunistic => {
                    if conn.capabilities.has_capability(&Capability::StartTLS) {
                        conn.starttls(
                            &self.tls_connector,
                            self.hostname.as_ref(),
                            &self.local_host,
                        )
                        .await?;
                    }
                }
                Security::Required => {
                    if conn.capabilities.has_capability(&Capability::StartTLS) {
                        conn.starttls(
                            &self.tls_connector,
                            self.hostname.as_ref(),
                            &self.local_host,
                        )
                        .await?;
                    } else {
                        return Err(crate::Error::StartTlsUnavailable);
                    }
                }
                Security::None | Security::Implicit => (),
            }
        }

        debug!(
            host = conn.capabilities.hostname(),
            secure = conn.secure,
            "session established"
        );

        Ok(conn)
    }
}
