//! Incremental parsers for probe output
//!
//! A parser consumes one output line at a time and may yield one
//! [`ParsedEvent`] per line. [`EventStream`] drives a parser over any async
//! reader and skips records the parser rejects.

mod iperf3;
mod ping;

pub use iperf3::Iperf3Parser;
pub use ping::PingParser;

use crate::parameter::ProbeKind;
use protocol::ParsedEvent;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("Not a JSON object: {0}")]
    InvalidJson(String),

    #[error("JSON record has no event field")]
    MissingEvent,

    #[error("Malformed {event} data: {reason}")]
    InvalidData { event: String, reason: String },

    #[error("Unrecognized {kind} line: {line}")]
    Pattern { kind: &'static str, line: String },
}

pub trait OutputParser {
    /// Parse one line. `Ok(None)` means the line carried nothing to report.
    fn parse_line(&mut self, line: &str) -> Result<Option<ParsedEvent>, ParseError>;

    /// True once the parser has seen a terminal record and wants no more input
    fn is_finished(&self) -> bool;
}

impl<P: OutputParser + ?Sized> OutputParser for Box<P> {
    fn parse_line(&mut self, line: &str) -> Result<Option<ParsedEvent>, ParseError> {
        (**self).parse_line(line)
    }

    fn is_finished(&self) -> bool {
        (**self).is_finished()
    }
}

/// Fresh parser for a probe type
pub fn parser_for(kind: ProbeKind) -> Box<dyn OutputParser + Send> {
    match kind {
        ProbeKind::Ping => Box::new(PingParser::new()),
        ProbeKind::Iperf3 => Box::new(Iperf3Parser::new()),
    }
}

/// Line reader that never fails on invalid UTF-8
///
/// Bad bytes become U+FFFD so the record is handed to the parser and
/// rejected there like any other malformed line.
pub struct LossyLines<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> LossyLines<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
        }
    }

    /// Next line without its terminator, `None` at end of input
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.buf.clear();
        if self.reader.read_until(b'\n', &mut self.buf).await? == 0 {
            return Ok(None);
        }
        if self.buf.ends_with(b"\n") {
            self.buf.pop();
            if self.buf.ends_with(b"\r") {
                self.buf.pop();
            }
        }
        Ok(Some(String::from_utf8_lossy(&self.buf).into_owned()))
    }
}

/// Lazy event sequence over an async line source
///
/// Restarting means building a new stream over a rewound reader.
pub struct EventStream<R, P> {
    lines: LossyLines<R>,
    parser: P,
    skipped: usize,
}

impl<R, P> EventStream<R, P>
where
    R: AsyncBufRead + Unpin,
    P: OutputParser,
{
    pub fn new(reader: R, parser: P) -> Self {
        Self {
            lines: LossyLines::new(reader),
            parser,
            skipped: 0,
        }
    }

    /// Waits for the next event; `None` at end of input or once the parser finished
    pub async fn next_event(&mut self) -> std::io::Result<Option<ParsedEvent>> {
        while !self.parser.is_finished() {
            let Some(line) = self.lines.next_line().await? else {
                return Ok(None);
            };
            match self.parser.parse_line(&line) {
                Ok(Some(event)) => return Ok(Some(event)),
                Ok(None) => {}
                Err(e) => {
                    self.skipped += 1;
                    match e {
                        ParseError::Pattern { .. } => debug!("Skipping record: {}", e),
                        _ => warn!("Skipping record: {}", e),
                    }
                }
            }
        }
        Ok(None)
    }

    /// Records rejected so far
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}
