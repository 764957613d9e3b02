//! Request grammar and the streaming parser.
//!
//! ```text
//! request    = header body? terminator
//! header     = ("update" | "drop") SP setname LF
//! body       = (domain LF)+            ; only for "update"
//! terminator = LF | EOF
//! ```
//!
//! The parser is fed raw reads and commits only complete lines; a trailing
//! partial line is carried over to the next read. A blank line anywhere in
//! the stream terminates the request.

use std::str;

use thiserror::Error;

/// Maximum length of a user-visible set name, in bytes. The scratch twin
/// `<name>$` must still fit the kernel's 32-byte cap.
pub const MAX_SET_NAME_LEN: usize = 30;

/// What a request asks the daemon to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Replace the domain list of a set, creating the set if needed.
    Update,
    /// Remove a set.
    Drop,
}

/// A fully parsed control request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub set: String,
    pub domains: Vec<String>,
}

impl Request {
    /// Wire form of the request, terminator included.
    #[must_use]
    pub fn to_wire(&self) -> String {
        let verb = match self.command {
            Command::Update => "update",
            Command::Drop => "drop",
        };

        let mut wire = format!("{verb} {}\n", self.set);
        for domain in &self.domains {
            wire.push_str(domain);
            wire.push('\n');
        }
        wire.push('\n');
        wire
    }
}

/// Rejections produced while parsing a request. The `Display` form is the
/// exact reply written to the client, sans trailing newline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Header with a verb other than `update`/`drop`.
    #[error("wrong command")]
    WrongCommand,

    /// Set name empty, over [`MAX_SET_NAME_LEN`] bytes, or containing `$`.
    #[error("bad set name")]
    BadSetName,

    /// Input that does not scan as a request at all.
    #[error("some garbage on input")]
    Garbage,
}

/// Replies written back to the client.
pub mod reply {
    use std::fmt::Display;

    pub const OK: &str = "ok\n";

    #[must_use]
    pub fn not_found(set: &str) -> String {
        format!("set {set} is not found\n")
    }

    #[must_use]
    pub fn error(message: &impl Display) -> String {
        format!("error: {message}\n")
    }

    #[must_use]
    pub fn rejected(err: super::ParseError) -> String {
        format!("{err}\n")
    }
}

/// Checks the set-name constraints shared by parser and daemon.
#[must_use]
pub fn valid_set_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= MAX_SET_NAME_LEN && !name.contains('$')
}

#[derive(Debug, Default)]
enum State {
    /// The command is still undecided.
    #[default]
    Header,
    /// Header accepted; only `update` accumulates domain lines.
    Body {
        command: Command,
        set: String,
        domains: Vec<String>,
    },
}

/// Streaming parser over one client connection.
#[derive(Debug, Default)]
pub struct RequestParser {
    buf: Vec<u8>,
    state: State,
}

impl RequestParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes one read's worth of bytes.
    ///
    /// Returns `Ok(Some(_))` once the request terminator was seen, `Ok(None)`
    /// while more input is needed.
    ///
    /// # Errors
    ///
    /// Returns the rejection to relay to the client; the connection is dead
    /// afterwards.
    pub fn feed(&mut self, data: &[u8]) -> Result<Option<Request>, ParseError> {
        self.buf.extend_from_slice(data);

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();

            if line.is_empty() {
                return self.complete().map(Some);
            }

            let line = str::from_utf8(&line).map_err(|_| ParseError::Garbage)?;
            self.accept_line(line)?;
        }

        Ok(None)
    }

    /// Flushes the parser at EOF. A trailing line without a final newline is
    /// still committed, matching the `terminator = EOF` production.
    ///
    /// # Errors
    ///
    /// Returns the rejection to relay to the client.
    pub fn finish(&mut self) -> Result<Request, ParseError> {
        if !self.buf.is_empty() {
            let line = std::mem::take(&mut self.buf);
            let line = str::from_utf8(&line).map_err(|_| ParseError::Garbage)?;
            self.accept_line(line)?;
        }

        self.complete()
    }

    fn accept_line(&mut self, line: &str) -> Result<(), ParseError> {
        match &mut self.state {
            State::Header => {
                let mut tokens = line.split_whitespace();
                let (Some(verb), Some(set), None) = (tokens.next(), tokens.next(), tokens.next())
                else {
                    return Err(ParseError::Garbage);
                };

                let command = match verb {
                    "update" => Command::Update,
                    "drop" => Command::Drop,
                    _ => return Err(ParseError::WrongCommand),
                };

                if !valid_set_name(set) {
                    return Err(ParseError::BadSetName);
                }

                self.state = State::Body {
                    command,
                    set: set.to_string(),
                    domains: Vec::new(),
                };
                Ok(())
            }
            State::Body {
                command: Command::Update,
                domains,
                ..
            } => {
                domains.push(line.to_string());
                Ok(())
            }
            // only `update` accumulates; lines after a `drop` header are noise
            State::Body { .. } => Ok(()),
        }
    }

    fn complete(&mut self) -> Result<Request, ParseError> {
        match std::mem::take(&mut self.state) {
            State::Header => Err(ParseError::Garbage),
            State::Body {
                command,
                set,
                domains,
            } => Ok(Request {
                command,
                set,
                domains,
            }),
        }
    }
}
