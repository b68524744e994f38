/*
 * Copyright Stalwart Labs Ltd.
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

#[allow(clippy::large_enum_variant)]
#[doc(hidden)]
pub enum SmtpStream {
    Tcp(TcpStream),
    Tls(tokio_rustls::client::TlsStream<TcpStream>),
    Closed,
}

impl SmtpStream {
    pub(crate) async fn read(&mut self, buf: &mut [u8]) -> tokio::io::Result<usize> {
        match self {
            SmtpStream::Tcp(stream) => stream.read(buf).await,
            SmtpStream::Tls(stream) => stream.read(buf).await,
            SmtpStream::Closed => Err(tokio::io::ErrorKind::NotConnected.into()),
        }
    }

    pub(crate) async fn write_all(&mut self, bytes: &[u8]) -> tokio::io::Result<()> {
        match self {
            SmtpStream::Tcp(stream) => stream.write_all(bytes).await,
            SmtpStream::Tls(stream) => stream.write_all(bytes).await,
            SmtpStream::Closed => Err(tokio::io::ErrorKind::NotConnected.into()),
        }
    }

    pub(crate) async fn flush(&mut self) -> tokio::io::Result<()> {
        match self {
            SmtpStream::Tcp(stream) => stream.flush().await,
            SmtpStream::Tls(stream) => stream.flush().await,
            SmtpStream::Closed => Err(tokio::io::ErrorKind::NotConnected.into()),
        }
    }

    pub(crate) async fn shutdown(&mut self) -> tokio::io::Result<()> {
        match self {
            SmtpStream::Tcp(stream) => stream.shutdown().await,
            SmtpStream::Tls(stream) => stream.shutdown().await,
            SmtpStream::Closed => Ok(()),
        }
    }
}

impl Default for SmtpStream {
    fn default() -> Self {
        SmtpStream::Closed
    }
}

enum EncoderState {
    /// Nothing emitted yet.
    Start,
    /// The last emitted byte completed a line.
    LineStart,
    /// The last emitted byte was a carriage return.
    Cr,
    /// Somewhere in the middle of a line.
    Mid,
}

/// Transparency procedure applied to message contents on the way out:
/// bare line feeds become CRLF, a dot opening a line is doubled, and
/// [`BodyEncoder::finish`] closes the message with the `CRLF . CRLF`
/// terminator without adding a blank line when the contents already end
/// on a line boundary.
pub(crate) struct BodyEncoder {
    state: EncoderState,
}

impl BodyEncoder {
    pub fn new() -> Self {
        BodyEncoder {
            state: EncoderState::Start,
        }
    }

    pub fn encode(&mut self, chunk: &[u8], out: &mut Vec<u8>) {
        for byte in chunk {
            match byte {
                b'\n' => {
                    if matches!(self.state, EncoderState::Cr) {
                        out.push(b'\n');
                    } else {
                        out.extend_from_slice(b"\r\n");
                    }
                    self.state = EncoderState::LineStart;
                }
                b'\r' => {
                    out.push(b'\r');
                    self.state = EncoderState::Cr;
                }
                b'.' => {
                    if matches!(self.state, EncoderState::Start | EncoderState::LineStart) {
                        out.extend_from_slice(b"..");
                    } else {
                        out.push(b'.');
                    }
                    self.state = EncoderState::Mid;
                }
                _ => {
                    out.push(*byte);
                    self.state = EncoderState::Mid;
                }
            }
        }
    }

    pub fn finish(self, out: &mut Vec<u8>) {
        match self.state {
            EncoderState::LineStart => out.extend_from_slice(b".\r\n"),
            EncoderState::Cr => out.extend_from_slice(b"\n.\r\n"),
            EncoderState::Start | EncoderState::Mid => out.extend_from_slice(b"\r\n.\r\n"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::BodyEncoder;

    fn encode(message: &[u8]) -> Vec<u8> {
        let mut encoder = BodyEncoder::new();
        let mut out = Vec::new();
        encoder.encode(message, &mut out);
        encoder.finish(&mut out);
        out
    }

    #[test]
    fn transparency_procedure() {
        for (message, expected) in [
            ("A: b\r\n.\r\n", "A: b\r\n..\r\n.\r\n"),
            ("A: b\r\n.", "A: b\r\n..\r\n.\r\n"),
            ("A: b\r\n..\r\n", "A: b\r\n...\r\n.\r\n"),
            ("A: ...b", "A: ...b\r\n.\r\n"),
            (".starts with a dot", "..starts with a dot\r\n.\r\n"),
            ("bare\nnewlines\nonly", "bare\r\nnewlines\r\nonly\r\n.\r\n"),
            ("mixed\r\nand\nbare\n.\n", "mixed\r\nand\r\nbare\r\n..\r\n.\r\n"),
            ("", "\r\n.\r\n"),
            ("ends in cr\r", "ends in cr\r\n.\r\n"),
        ] {
            assert_eq!(
                String::from_utf8(encode(message.as_bytes())).unwrap(),
                expected,
                "failed for {:?}",
                message
            );

            // The same bytes fed one at a time produce the same output
            let mut encoder = BodyEncoder::new();
            let mut out = Vec::new();
            for byte in message.as_bytes() {
                encoder.encode(&[*byte], &mut out);
            }
            encoder.finish(&mut out);
            assert_eq!(
                String::from_utf8(out).unwrap(),
                expected,
                "failed bytewise for {:?}",
                message
            );
        }
    }
}
