/*
 * Copyright Stalwart Labs Ltd.
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

use super::reply::Severity;
use super::{auth::Mechanism, reply::Reply};
use std::convert::TryFrom;
use std::str::FromStr;

#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub enum Capability {
    DSN,
    StartTLS,
    SmtpUTF8,
    Pipelining,
    EightBitMIME,
    EnhancedStatusCodes,
    Size(usize),
    Auth(Vec<Mechanism>),
    Unsupported(String),
}

/// Extension set advertised in an EHLO response.
///
/// A session greeted with HELO, or renegotiating after STARTTLS, starts
/// from the empty default.
#[derive(Debug, Default, PartialEq, Eq, Hash, Clone)]
pub struct Capabilities {
    hostname: String,
    capabilities: Vec<Capability>,
}

impl TryFrom<Reply> for Capabilities {
    type Error = crate::Error;

    fn try_from(value: Reply) -> Result<Self, Self::Error> {
        if value.severity() != Severity::PositiveCompletion {
            return Err(crate::Error::UnexpectedReply(value));
        }

        let message = value.message();
        let mut hostname = String::with_capacity(0);
        let mut capabilities = Vec::with_capacity(message.len());

        for (pos, line) in message.iter().enumerate() {
            let mut line = line.split(' ');
            if let Some(token) = line.next() {
                if pos > 0 {
                    // Extension keywords are matched case-insensitively.
                    capabilities.push(match token.to_ascii_uppercase().as_str() {
                        "STARTTLS" => Capability::StartTLS,
                        "AUTH" => Capability::Auth({
                            let mut mechanisms = line
                                .filter_map(|mechanism| Mechanism::try_from(mechanism).ok())
                                .collect::<Vec<Mechanism>>();
                            mechanisms.sort_unstable();
                            mechanisms
                        }),
                        "8BITMIME" => Capability::EightBitMIME,
                        "ENHANCEDSTATUSCODES" => Capability::EnhancedStatusCodes,
                        "SMTPUTF8" => Capability::SmtpUTF8,
                        "DSN" => Capability::DSN,
                        "PIPELINING" => Capability::Pipelining,
                        "SIZE" => Capability::Size(
                            usize::from_str(line.next().unwrap_or("0")).unwrap_or(0),
                        ),
                        _ => Capability::Unsupported(token.to_string()),
                    });
                } else {
                    hostname = token.to_string();
                }
            }
        }

        Ok(Capabilities {
            hostname,
            capabilities,
        })
    }
}

impl Capabilities {
    #[cfg(test)]
    pub(crate) fn new(hostname: String, capabilities: Vec<Capability>) -> Self {
        Capabilities {
            hostname,
            capabilities,
        }
    }

    /// Returns the hostname of the SMTP server.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Returns the capabilities of the SMTP server.
    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    /// Returns `true` if the SMTP server advertises the given capability.
    pub fn has_capability(&self, capability: &Capability) -> bool {
        self.capabilities.contains(capability)
    }

    /// Returns all supported authentication mechanisms.
    pub fn auth(&self) -> Option<&[Mechanism]> {
        self.capabilities()
            .iter()
            .find_map(|capability| match capability {
                Capability::Auth(mechanisms) if !mechanisms.is_empty() => {
                    Some(mechanisms.as_slice())
                }
                _ => None,
            })
    }

    /// Returns the advertised message size limit, if any.
    ///
    /// A limit of zero means the server declares no fixed maximum.
    pub fn size(&self) -> Option<usize> {
        self.capabilities()
            .iter()
            .find_map(|capability| match capability {
                Capability::Size(size) => Some(*size),
                _ => None,
            })
    }
}
