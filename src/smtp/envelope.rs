/*
 * Copyright Stalwart Labs Ltd.
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

use std::borrow::Cow;

use super::capability::{Capabilities, Capability};
use super::reply::Reply;

/// Message envelope: the sender, recipients and transfer parameters of a
/// single mail transaction.
#[derive(Debug, Default, Clone)]
pub struct Envelope<'x> {
    /// Reverse path; an empty sender is transmitted as the null path `<>`.
    pub sender: Cow<'x, str>,
    /// Forward paths, submitted in order.
    pub recipients: Vec<Cow<'x, str>>,
    /// Overrides SMTPUTF8 detection; when unset, the extension is requested
    /// whenever an address contains non-ASCII characters.
    pub smtputf8: Option<bool>,
    /// Declare the message body as 8BITMIME.
    pub eight_bit_mime: bool,
    /// Declared message size in bytes, passed along when the server
    /// advertises SIZE.
    pub size: Option<usize>,
}

impl<'x> Envelope<'x> {
    /// Creates an envelope with the given sender.
    pub fn new(sender: impl Into<Cow<'x, str>>) -> Envelope<'x> {
        Envelope {
            sender: sender.into(),
            ..Default::default()
        }
    }

    /// Adds a recipient.
    pub fn to(mut self, address: impl Into<Cow<'x, str>>) -> Self {
        self.recipients.push(address.into());
        self
    }

    /// Forces SMTPUTF8 on or off instead of deriving it from the addresses.
    pub fn smtputf8(mut self, smtputf8: bool) -> Self {
        self.smtputf8 = Some(smtputf8);
        self
    }

    /// Declares the message body as 8BITMIME.
    pub fn eight_bit_mime(mut self, eight_bit_mime: bool) -> Self {
        self.eight_bit_mime = eight_bit_mime;
        self
    }

    /// Declares the message size.
    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    /// Validates every address before anything is written to the server.
    pub(crate) fn validate(&self) -> crate::Result<()> {
        if self.recipients.is_empty() {
            return Err(crate::Error::MissingRcptTo);
        }
        if !self.sender.is_empty() {
            check_address(&self.sender)?;
        }
        for recipient in &self.recipients {
            if recipient.is_empty() {
                return Err(crate::Error::InvalidAddress(String::new()));
            }
            check_address(recipient)?;
        }
        Ok(())
    }

    pub(crate) fn requires_smtputf8(&self) -> bool {
        self.smtputf8.unwrap_or_else(|| {
            !self.sender.is_ascii() || self.recipients.iter().any(|addr| !addr.is_ascii())
        })
    }

    /// Renders the MAIL FROM parameter list, gating each parameter on the
    /// capabilities the server advertised.
    pub(crate) fn mail_parameters(&self, capabilities: &Capabilities) -> crate::Result<String> {
        let mut params = String::new();

        if let Some(size) = self.size {
            if let Some(limit) = capabilities.size() {
                if limit > 0 && size > limit {
                    return Err(crate::Error::MessageTooLarge);
                }
                params.push_str(" SIZE=");
                params.push_str(&size.to_string());
            }
        }

        if self.eight_bit_mime && capabilities.has_capability(&Capability::EightBitMIME) {
            params.push_str(" BODY=8BITMIME");
        }

        if self.requires_smtputf8() {
            if capabilities.has_capability(&Capability::SmtpUTF8) {
                params.push_str(" SMTPUTF8");
            } else {
                return Err(crate::Error::SmtpUtf8Unavailable);
            }
        }

        Ok(params)
    }
}

/// Addresses travel inside `<...>` on the command line, so anything that
/// could escape it or smuggle a command is rejected locally.
fn check_address(address: &str) -> crate::Result<()> {
    if address
        .bytes()
        .any(|ch| ch.is_ascii_control() || ch == b' ' || ch == b'<' || ch == b'>')
    {
        Err(crate::Error::InvalidAddress(address.to_string()))
    } else {
        Ok(())
    }
}

/// Outcome of a completed mail transaction.
#[derive(Debug, Clone)]
pub struct SendResult {
    /// Recipients the server accepted, in envelope order.
    pub accepted: Vec<String>,
    /// Recipients the server refused, in envelope order.
    pub rejected: Vec<Rejection>,
    /// The reply that acknowledged the message contents.
    pub response: Reply,
}

/// A refused recipient together with the server's reply.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub address: String,
    pub reply: Reply,
}

#[cfg(test)]
mod test {
    use crate::smtp::auth::Mechanism;
    use crate::smtp::capability::{Capabilities, Capability};

    use super::Envelope;

    #[test]
    fn envelope_validation() {
        // Valid envelope with a null reverse path
        Envelope::new("").to("jane@example.com").validate().unwrap();

        // No recipients
        assert!(matches!(
            Envelope::new("john@example.com").validate(),
            Err(crate::Error::MissingRcptTo)
        ));

        // Command injection via the recipient address
        assert!(matches!(
            Envelope::new("john@example.com")
                .to("jane@example.com>\r\nRCPT TO:<other@example.com")
                .validate(),
            Err(crate::Error::InvalidAddress(_))
        ));

        // Spaces and angle brackets never make it onto the wire
        for addr in ["jane doe@example.com", "<jane@example.com>", ""] {
            assert!(matches!(
                Envelope::new("john@example.com").to(addr).validate(),
                Err(crate::Error::InvalidAddress(_))
            ));
        }

        // A malformed sender is rejected as well
        assert!(matches!(
            Envelope::new("john\r\n@example.com")
                .to("jane@example.com")
                .validate(),
            Err(crate::Error::InvalidAddress(_))
        ));
    }

    #[test]
    fn smtputf8_detection() {
        assert!(!Envelope::new("john@example.com")
            .to("jane@example.com")
            .requires_smtputf8());
        assert!(Envelope::new("john@example.com")
            .to("josé@example.com")
            .requires_smtputf8());
        assert!(Envelope::new("jöhn@example.com")
            .to("jane@example.com")
            .requires_smtputf8());

        // An explicit setting wins over detection
        assert!(!Envelope::new("jöhn@example.com")
            .to("jane@example.com")
            .smtputf8(false)
            .requires_smtputf8());
        assert!(Envelope::new("john@example.com")
            .to("jane@example.com")
            .smtputf8(true)
            .requires_smtputf8());
    }

    #[test]
    fn mail_parameters() {
        let caps = Capabilities::new(
            "smtp.example.com".to_string(),
            vec![
                Capability::Size(1000),
                Capability::EightBitMIME,
                Capability::SmtpUTF8,
                Capability::Auth(vec![Mechanism::Plain]),
            ],
        );

        assert_eq!(
            Envelope::new("john@example.com")
                .to("josé@example.com")
                .size(500)
                .eight_bit_mime(true)
                .mail_parameters(&caps)
                .unwrap(),
            " SIZE=500 BODY=8BITMIME SMTPUTF8"
        );

        // The declared size exceeds the advertised limit
        assert!(matches!(
            Envelope::new("john@example.com")
                .to("jane@example.com")
                .size(2000)
                .mail_parameters(&caps),
            Err(crate::Error::MessageTooLarge)
        ));

        // SIZE 0 advertises no fixed maximum
        let unlimited =
            Capabilities::new("smtp.example.com".to_string(), vec![Capability::Size(0)]);
        assert_eq!(
            Envelope::new("john@example.com")
                .to("jane@example.com")
                .size(usize::MAX)
                .mail_parameters(&unlimited)
                .unwrap(),
            format!(" SIZE={}", usize::MAX)
        );

        // Parameters the server does not support are left out
        let bare = Capabilities::default();
        assert_eq!(
            Envelope::new("john@example.com")
                .to("jane@example.com")
                .size(500)
                .eight_bit_mime(true)
                .mail_parameters(&bare)
                .unwrap(),
            ""
        );

        // Except SMTPUTF8, which the transaction cannot do without
        assert!(matches!(
            Envelope::new("john@example.com")
                .to("josé@example.com")
                .mail_parameters(&bare),
            Err(crate::Error::SmtpUtf8Unavailable)
        ));
    }
}
