//! Transport handshake protocol
//!
//! A transport process announces its state on stdout with one ASCII line
//! per message, space separated, keyword first:
//!
//! ```text
//! VERSION <version>                      must be the first line
//! ERROR <message...>                     negotiation failed
//! PARENT <method> <protocol> <connect>   the transport is itself proxied
//! EXPOSE <method> <protocol> <bindaddr>  an endpoint is listening
//! DONE                                   negotiation finished
//! ```
//!
//! [`format_line`] is the encoder used by transports, [`HandshakeMessage`]
//! and [`Negotiation`] the decoder used by the supervisor.

use crate::{Error, Result};
use futures::StreamExt;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tokio::io::AsyncRead;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, trace};

/// Protocol version announced by transports built with this crate
pub const PROTOCOL_VERSION: &str = "1.0";

/// Longest status line accepted from a transport
pub const MAX_LINE_LENGTH: usize = 4096;

pub const KEYWORD_VERSION: &str = "VERSION";
pub const KEYWORD_ERROR: &str = "ERROR";
pub const KEYWORD_PARENT: &str = "PARENT";
pub const KEYWORD_EXPOSE: &str = "EXPOSE";
pub const KEYWORD_DONE: &str = "DONE";

/// Keywords may only contain alphanumerics, `_` and `-`.
pub fn keyword_is_safe(keyword: &str) -> bool {
    !keyword.is_empty()
        && keyword
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Arguments may contain any US-ASCII byte except NUL and newline.
pub fn arg_is_safe(arg: &str) -> bool {
    arg.bytes().all(|b| b < 0x80 && b != b'\0' && b != b'\n')
}

/// Build one protocol line (without the trailing newline).
///
/// # Panics
///
/// Panics if the keyword or any argument contains forbidden bytes. Lines
/// cross a process boundary, an ambiguous line is a bug in the caller.
pub fn format_line(keyword: &str, args: &[&str]) -> String {
    if !keyword_is_safe(keyword) {
        panic!("keyword {:?} contains forbidden bytes", keyword);
    }
    let mut line = String::with_capacity(keyword.len() + args.iter().map(|a| a.len() + 1).sum::<usize>());
    line.push_str(keyword);
    for arg in args {
        if !arg_is_safe(arg) {
            panic!("arg {:?} contains forbidden bytes", arg);
        }
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// One decoded status line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeMessage {
    /// `VERSION`: protocol version of the transport
    Version(String),
    /// `ERROR`: the transport gave up
    Error(String),
    /// `PARENT`: the transport connects through a parent proxy
    Parent {
        method: String,
        protocol: String,
        connect: String,
    },
    /// `EXPOSE`: an endpoint is ready for use
    Expose {
        method: String,
        protocol: String,
        bind_addr: String,
    },
    /// `DONE`: negotiation finished successfully
    Done,
}

impl HandshakeMessage {
    pub fn keyword(&self) -> &'static str {
        match self {
            HandshakeMessage::Version(_) => KEYWORD_VERSION,
            HandshakeMessage::Error(_) => KEYWORD_ERROR,
            HandshakeMessage::Parent { .. } => KEYWORD_PARENT,
            HandshakeMessage::Expose { .. } => KEYWORD_EXPOSE,
            HandshakeMessage::Done => KEYWORD_DONE,
        }
    }

    /// Encode with [`format_line`]
    pub fn to_line(&self) -> String {
        match self {
            HandshakeMessage::Version(version) => format_line(KEYWORD_VERSION, &[version.as_str()]),
            HandshakeMessage::Error(message) => format_line(KEYWORD_ERROR, &[message.as_str()]),
            HandshakeMessage::Parent {
                method,
                protocol,
                connect,
            } => format_line(KEYWORD_PARENT, &[method.as_str(), protocol.as_str(), connect.as_str()]),
            HandshakeMessage::Expose {
                method,
                protocol,
                bind_addr,
            } => format_line(
                KEYWORD_EXPOSE,
                &[method.as_str(), protocol.as_str(), bind_addr.as_str()],
            ),
            HandshakeMessage::Done => format_line(KEYWORD_DONE, &[]),
        }
    }
}

impl fmt::Display for HandshakeMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

fn expect_args(keyword: &str, args: &[&str], n: usize) -> Result<()> {
    if args.len() != n {
        return Err(Error::protocol(format!(
            "{} takes {} arguments, got {}",
            keyword,
            n,
            args.len()
        )));
    }
    Ok(())
}

impl FromStr for HandshakeMessage {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if !arg_is_safe(line) {
            return Err(Error::protocol(format!("line {:?} contains forbidden bytes", line)));
        }

        let mut tokens = line.split(' ').filter(|t| !t.is_empty());
        let keyword = tokens
            .next()
            .ok_or_else(|| Error::protocol("empty line"))?;
        if !keyword_is_safe(keyword) {
            return Err(Error::protocol(format!("malformed keyword {:?}", keyword)));
        }
        let args: Vec<&str> = tokens.collect();

        let message = match keyword {
            KEYWORD_VERSION => {
                expect_args(keyword, &args, 1)?;
                HandshakeMessage::Version(args[0].to_string())
            }
            KEYWORD_ERROR => HandshakeMessage::Error(args.join(" ")),
            KEYWORD_PARENT => {
                expect_args(keyword, &args, 3)?;
                HandshakeMessage::Parent {
                    method: args[0].to_string(),
                    protocol: args[1].to_string(),
                    connect: args[2].to_string(),
                }
            }
            KEYWORD_EXPOSE => {
                expect_args(keyword, &args, 3)?;
                HandshakeMessage::Expose {
                    method: args[0].to_string(),
                    protocol: args[1].to_string(),
                    bind_addr: args[2].to_string(),
                }
            }
            KEYWORD_DONE => {
                expect_args(keyword, &args, 0)?;
                HandshakeMessage::Done
            }
            other => {
                return Err(Error::protocol(format!("unhandled line: {}", other)));
            }
        };
        Ok(message)
    }
}

/// An endpoint announced with `EXPOSE`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExposedMethod {
    pub name: String,
    pub protocol: String,
    pub bind_addr: String,
}

/// Result of feeding one line to a [`Negotiation`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// More lines are expected
    Continue,
    /// `DONE` was received
    Done,
}

/// Accumulates the outcome of a handshake, one line at a time.
#[derive(Debug, Default, Clone)]
pub struct Negotiation {
    version: Option<String>,
    methods: Vec<ExposedMethod>,
    response: HashMap<String, String>,
    done: bool,
}

impl Negotiation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode and apply one line.
    ///
    /// `ERROR` becomes [`Error::Negotiation`], anything unrecognized or out
    /// of order becomes [`Error::Protocol`].
    pub fn feed(&mut self, line: &str) -> Result<Step> {
        if self.done {
            return Err(Error::protocol("line received after DONE"));
        }
        let message: HandshakeMessage = line.parse()?;
        trace!("handshake: {}", message);

        if self.version.is_none() {
            match &message {
                HandshakeMessage::Version(_) | HandshakeMessage::Error(_) => {}
                other => {
                    return Err(Error::protocol(format!(
                        "expected VERSION as first line, got {}",
                        other.keyword()
                    )))
                }
            }
        }

        match message {
            HandshakeMessage::Version(version) => {
                if self.version.is_some() {
                    return Err(Error::protocol("duplicate VERSION line"));
                }
                self.response.insert("version".to_string(), version.clone());
                self.version = Some(version);
            }
            HandshakeMessage::Error(message) => {
                return Err(Error::negotiation(message));
            }
            HandshakeMessage::Parent {
                protocol, connect, ..
            } => {
                self.response.insert("parentaddr".to_string(), connect);
                self.response.insert("parentprotocol".to_string(), protocol);
            }
            HandshakeMessage::Expose {
                method,
                protocol,
                bind_addr,
            } => {
                self.response.insert("bindaddr".to_string(), bind_addr.clone());
                self.response.insert("protocol".to_string(), protocol.clone());
                self.methods.push(ExposedMethod {
                    name: method,
                    protocol,
                    bind_addr,
                });
            }
            HandshakeMessage::Done => {
                self.done = true;
                return Ok(Step::Done);
            }
        }
        Ok(Step::Continue)
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn methods(&self) -> &[ExposedMethod] {
        &self.methods
    }

    /// Response map (`version`, `bindaddr`, `protocol`, `parentaddr`, ...)
    pub fn response(&self) -> &HashMap<String, String> {
        &self.response
    }

    pub fn into_parts(self) -> (HashMap<String, String>, Vec<ExposedMethod>) {
        (self.response, self.methods)
    }
}

/// Line reader over a transport's stdout
pub type LineReader<R> = FramedRead<R, LinesCodec>;

/// Wrap a stream in the line framing used by the protocol
pub fn line_reader<R: AsyncRead>(reader: R) -> LineReader<R> {
    FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH))
}

/// Read lines until the negotiation completes. The reader is left
/// positioned right after `DONE` so the caller can keep draining it.
pub async fn negotiate<R: AsyncRead + Unpin>(lines: &mut LineReader<R>) -> Result<Negotiation> {
    let mut negotiation = Negotiation::new();
    while let Some(line) = lines.next().await {
        let line = line?;
        debug!("handshake line: {}", line);
        if negotiation.feed(&line)? == Step::Done {
            return Ok(negotiation);
        }
    }
    Err(Error::protocol("stream closed before DONE"))
}
