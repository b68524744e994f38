use std::collections::VecDeque;
use std::fmt::Display;

const MAX_MESSAGE_LENGTH: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Severity {
    PositiveCompletion = 2,
    PositiveIntermediate = 3,
    TransientNegativeCompletion = 4,
    PermanentNegativeCompletion = 5,
    Invalid = 0,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    code: u16,
    message: Vec<String>,
}

impl Reply {
    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn message(&self) -> &[String] {
        &self.message
    }

    pub fn severity(&self) -> Severity {
        match self.code / 100 {
            2 => Severity::PositiveCompletion,
            3 => Severity::PositiveIntermediate,
            4 => Severity::TransientNegativeCompletion,
            5 => Severity::PermanentNegativeCompletion,
            _ => Severity::Invalid,
        }
    }

    pub fn assert_severity(self, severity: Severity) -> crate::Result<Reply> {
        if self.severity() == severity {
            Ok(self)
        } else {
            Err(crate::Error::UnexpectedReply(self))
        }
    }

    pub fn assert_code(self, code: u16) -> crate::Result<Reply> {
        if self.code == code {
            Ok(self)
        } else {
            Err(crate::Error::UnexpectedReply(self))
        }
    }
}

impl Display for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code)?;
        for line in &self.message {
            write!(f, " {}", line)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("invalid reply code")]
    InvalidReplyCode,
    #[error("invalid line separator")]
    InvalidSeparator,
    #[error("reply code changed between lines")]
    CodeMismatch,
    #[error("reply exceeds the maximum length")]
    MessageTooLong,
}

enum ReplyParserState {
    FirstDigit,
    SecondDigit,
    ThirdDigit,
    Separator,
    Description,
}

pub struct ReplyParser {
    code: u16,
    current_code: u16,
    state: ReplyParserState,
    is_last: bool,
    buf: Vec<u8>,
    message: Vec<String>,
    message_len: usize,
    ready: VecDeque<Reply>,
}

impl Default for ReplyParser {
    fn default() -> Self {
        Self {
            code: u16::MAX,
            current_code: 0,
            state: ReplyParserState::FirstDigit,
            buf: Vec::with_capacity(128),
            is_last: false,
            message: Vec::with_capacity(4),
            message_len: 0,
            ready: VecDeque::new(),
        }
    }
}

impl ReplyParser {
    pub fn new() -> Self {
        Self::default()
    }

    fn reset(&mut self) {
        self.state = ReplyParserState::FirstDigit;
        self.code = u16::MAX;
        self.current_code = 0;
        self.buf.clear();
        self.message.clear();
        self.message_len = 0;
        self.is_last = false;
    }

    /// Feeds bytes read from the server into the parser.
    ///
    /// Every reply completed by this chunk is queued for [`ReplyParser::pop`];
    /// a trailing partial reply is buffered until more data arrives.
    pub fn receive(&mut self, bytes: &[u8]) -> Result<(), Error> {
        for byte in bytes {
            match self.state {
                ReplyParserState::FirstDigit => {
                    if (b'0'..=b'9').contains(byte) {
                        self.current_code = ((byte - b'0') as u16) * 100;
                        self.state = ReplyParserState::SecondDigit;
                    } else {
                        self.reset();
                        return Err(Error::InvalidReplyCode);
                    }
                }
                ReplyParserState::SecondDigit => {
                    if (b'0'..=b'9').contains(byte) {
                        self.current_code += ((byte - b'0') as u16) * 10;
                        self.state = ReplyParserState::ThirdDigit;
                    } else {
                        self.reset();
                        return Err(Error::InvalidReplyCode);
                    }
                }
                ReplyParserState::ThirdDigit => {
                    if (b'0'..=b'9').contains(byte) {
                        self.current_code += (byte - b'0') as u16;
                        self.state = ReplyParserState::Separator;
                    } else {
                        self.reset();
                        return Err(Error::InvalidReplyCode);
                    }
                }
                ReplyParserState::Separator => {
                    match byte {
                        b' ' => {
                            self.is_last = true;
                        }
                        b'-' => (),
                        // A line may end right after the code.
                        b'\r' | b'\n' => {
                            self.is_last = true;
                        }
                        _ => {
                            self.reset();
                            return Err(Error::InvalidSeparator);
                        }
                    }

                    if self.code == u16::MAX {
                        self.code = self.current_code;
                    } else if self.code != self.current_code {
                        self.reset();
                        return Err(Error::CodeMismatch);
                    }
                    self.current_code = 0;
                    self.state = ReplyParserState::Description;

                    if *byte == b'\n' {
                        self.end_of_line();
                    }
                }
                ReplyParserState::Description => match byte {
                    b'\n' => {
                        self.end_of_line();
                    }
                    b'\r' => (),
                    _ => {
                        if self.message_len < MAX_MESSAGE_LENGTH {
                            self.buf.push(*byte);
                            self.message_len += 1;
                        } else {
                            self.reset();
                            return Err(Error::MessageTooLong);
                        }
                    }
                },
            }
        }

        Ok(())
    }

    /// Returns the next complete reply, in arrival order.
    pub fn pop(&mut self) -> Option<Reply> {
        self.ready.pop_front()
    }

    fn end_of_line(&mut self) {
        if !self.buf.is_empty() {
            self.message
                .push(String::from_utf8_lossy(&self.buf).into_owned());
            self.buf.clear();
        }

        self.state = ReplyParserState::FirstDigit;
        self.current_code = 0;

        if self.is_last {
            let reply = Reply {
                code: self.code,
                message: std::mem::take(&mut self.message),
            };

            self.code = u16::MAX;
            self.is_last = false;
            self.message_len = 0;
            self.ready.push_back(reply);
        }
    }
}

#[cfg(test)]
mod test {
    use crate::smtp::reply::{Error, Severity, MAX_MESSAGE_LENGTH};

    use super::ReplyParser;

    #[test]
    fn reply_parser() {
        // Create parser
        let mut parser = ReplyParser::new();

        // Parse valid multi-line response
        parser.receive(b"250-First line\r\n250-Second line\r\n250-234 Text beginning with numbers\r\n250 The last line\r\n").unwrap();
        let result = parser.pop().unwrap();
        assert_eq!(result.code(), 250);
        assert_eq!(result.severity(), Severity::PositiveCompletion);
        assert_eq!(
            result.message(),
            &[
                "First line",
                "Second line",
                "234 Text beginning with numbers",
                "The last line"
            ]
        );
        assert!(parser.pop().is_none());

        // Parse valid single-line response
        parser
            .receive(b"421 These pretzels are making me thirsty\r\n")
            .unwrap();
        let result = parser.pop().unwrap();
        assert_eq!(result.code(), 421);
        assert_eq!(result.severity(), Severity::TransientNegativeCompletion);
        assert_eq!(result.message(), &["These pretzels are making me thirsty",]);

        // Parse chunked response
        parser.receive(b"555-These pretzels\r\n").unwrap();
        assert!(parser.pop().is_none());
        parser.receive(b"555 are making me thirsty\r\n").unwrap();
        let result = parser.pop().unwrap();
        assert_eq!(result.code(), 555);
        assert_eq!(result.severity(), Severity::PermanentNegativeCompletion);
        assert_eq!(
            result.message(),
            &["These pretzels", "are making me thirsty"]
        );

        // Parse several replies arriving in a single read
        parser
            .receive(b"250 Ok\r\n354 End data with <CR><LF>.<CR><LF>\r\n")
            .unwrap();
        let first = parser.pop().unwrap();
        assert_eq!(first.code(), 250);
        assert_eq!(first.to_string(), "250 Ok");
        assert_eq!(parser.pop().unwrap().code(), 354);
        assert!(parser.pop().is_none());

        // Parse a reply split in the middle of the code
        parser.receive(b"25").unwrap();
        assert!(parser.pop().is_none());
        parser.receive(b"0 Ok\r\n").unwrap();
        assert_eq!(parser.pop().unwrap().code(), 250);

        // Parse a reply with no text after the code
        parser.receive(b"250\r\n").unwrap();
        let result = parser.pop().unwrap();
        assert_eq!(result.code(), 250);
        assert!(result.message().is_empty());

        // Replies outside the 2xx-5xx range carry no valid severity
        parser.receive(b"699 boom\r\n").unwrap();
        assert_eq!(parser.pop().unwrap().severity(), Severity::Invalid);

        // Parse invalid response (code mismatch)
        assert_eq!(
            parser.receive(b"421-These pretzels\r\n250 are making me thirsty\r\n"),
            Err(Error::CodeMismatch)
        );

        // Parse invalid response (alphabetical characters in code)
        assert_eq!(
            parser.receive(b"1zz-These pretzels are making me thirsty\r\n"),
            Err(Error::InvalidReplyCode)
        );

        // Parse invalid response (alphabetical characters in separator)
        assert_eq!(
            parser.receive(b"123These pretzels are making me thirsty\r\n"),
            Err(Error::InvalidSeparator)
        );

        // Parse invalid response (message too long)
        let mut long_response = Vec::new();
        (0..MAX_MESSAGE_LENGTH + 1).for_each(|_| long_response.extend_from_slice(b"123-a\r\n"));
        long_response.extend_from_slice(b"123 a\r\n");
        assert_eq!(parser.receive(&long_response), Err(Error::MessageTooLong));

        // The parser recovers after an error
        parser.receive(b"220 mx.example.org ready\r\n").unwrap();
        assert_eq!(parser.pop().unwrap().code(), 220);
    }
}
