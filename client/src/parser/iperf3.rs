//! Parser for iperf3 `--json-stream` output
//!
//! Each line is one JSON object `{"event": ..., "data": ...}`.

use super::{OutputParser, ParseError};
use protocol::events::{
    ConnectingTo, IntervalSample, ParsedEvent, StartInfo, StreamSample, SumRecord, TcpStreamInfo,
    UdpStreamInfo,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

#[derive(Deserialize)]
struct Record {
    event: Option<String>,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct WireStart {
    version: Option<String>,
    timestamp: Option<WireTime>,
    connecting_to: Option<WireHost>,
    test_start: Option<WireTestStart>,
}

#[derive(Deserialize)]
struct WireTime {
    timesecs: Option<u64>,
}

#[derive(Deserialize)]
struct WireHost {
    host: String,
    port: u16,
}

#[derive(Deserialize)]
struct WireTestStart {
    protocol: Option<String>,
    num_streams: Option<u32>,
    blksize: Option<u64>,
    omit: Option<u64>,
    duration: Option<u64>,
    bytes: Option<u64>,
    blocks: Option<u64>,
    reverse: Option<u64>,
    tos: Option<u64>,
    target_bitrate: Option<u64>,
    bidir: Option<u64>,
}

#[derive(Deserialize)]
struct WireInterval {
    #[serde(default)]
    streams: Vec<WireStream>,
    sum: WireSum,
    sum_bidir_reverse: Option<WireSum>,
}

#[derive(Deserialize)]
struct WireSum {
    start: f64,
    end: f64,
    seconds: f64,
    bytes: u64,
    bits_per_second: f64,
    #[serde(default)]
    sender: bool,
}

#[derive(Deserialize)]
struct WireStream {
    socket: i64,
    start: f64,
    end: f64,
    seconds: f64,
    bytes: u64,
    bits_per_second: f64,
    #[serde(default)]
    omitted: bool,
    #[serde(default)]
    sender: bool,
    snd_cwnd: Option<u64>,
    snd_wnd: Option<u64>,
    retransmits: Option<u64>,
    rtt: Option<u64>,
    rttvar: Option<u64>,
    pmtu: Option<u64>,
    jitter_ms: Option<f64>,
    lost_packets: Option<u64>,
    packets: Option<u64>,
    lost_percent: Option<f64>,
}

impl From<WireSum> for SumRecord {
    fn from(w: WireSum) -> Self {
        SumRecord {
            start: w.start,
            end: w.end,
            seconds: w.seconds,
            bytes: w.bytes,
            bits_per_second: w.bits_per_second,
            sender: w.sender,
        }
    }
}

impl From<WireStream> for StreamSample {
    fn from(w: WireStream) -> Self {
        let has_tcp = w.snd_cwnd.is_some()
            || w.snd_wnd.is_some()
            || w.retransmits.is_some()
            || w.rtt.is_some()
            || w.rttvar.is_some()
            || w.pmtu.is_some();
        let has_udp = w.jitter_ms.is_some()
            || w.lost_packets.is_some()
            || w.packets.is_some()
            || w.lost_percent.is_some();

        StreamSample {
            socket: w.socket,
            start: w.start,
            end: w.end,
            seconds: w.seconds,
            bytes: w.bytes,
            bits_per_second: w.bits_per_second,
            sender: w.sender,
            omitted: w.omitted,
            tcp: has_tcp.then_some(TcpStreamInfo {
                snd_cwnd: w.snd_cwnd,
                snd_wnd: w.snd_wnd,
                retransmits: w.retransmits,
                rtt: w.rtt,
                rttvar: w.rttvar,
                pmtu: w.pmtu,
            }),
            udp: has_udp.then_some(UdpStreamInfo {
                jitter_ms: w.jitter_ms,
                lost_packets: w.lost_packets,
                packets: w.packets,
                lost_percent: w.lost_percent,
            }),
        }
    }
}

#[derive(Debug, Default)]
pub struct Iperf3Parser {
    finished: bool,
}

impl Iperf3Parser {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OutputParser for Iperf3Parser {
    fn parse_line(&mut self, line: &str) -> Result<Option<ParsedEvent>, ParseError> {
        let line = line.trim();
        if line.is_empty() || self.finished {
            return Ok(None);
        }

        let record: Record = serde_json::from_str(line)
            .map_err(|e| ParseError::InvalidJson(format!("{}: {}", e, truncate(line))))?;
        let event = record.event.ok_or(ParseError::MissingEvent)?;

        match event.as_str() {
            "start" => {
                let start: WireStart = decode(&event, record.data)?;
                Ok(Some(ParsedEvent::Start(start_info(start))))
            }
            "interval" => {
                let interval: WireInterval = decode(&event, record.data)?;
                Ok(Some(ParsedEvent::Interval(IntervalSample {
                    streams: interval.streams.into_iter().map(StreamSample::from).collect(),
                    sum: interval.sum.into(),
                    sum_bidir_reverse: interval.sum_bidir_reverse.map(SumRecord::from),
                })))
            }
            "end" => {
                debug!("iperf3 end record received");
                Ok(None)
            }
            "error" => {
                self.finished = true;
                let message = match record.data {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                Ok(Some(ParsedEvent::Error { message }))
            }
            other => {
                debug!("Ignoring iperf3 event {:?}", other);
                Ok(None)
            }
        }
    }

    fn is_finished(&self) -> bool {
        self.finished
    }
}

fn decode<T: for<'de> Deserialize<'de>>(event: &str, data: Value) -> Result<T, ParseError> {
    serde_json::from_value(data).map_err(|e| ParseError::InvalidData {
        event: event.to_string(),
        reason: e.to_string(),
    })
}

fn start_info(start: WireStart) -> StartInfo {
    let test = start.test_start;
    let flag = |v: Option<u64>| v.map(|n| n != 0);

    StartInfo {
        version: start.version,
        connecting_to: start.connecting_to.map(|h| ConnectingTo {
            host: h.host,
            port: h.port,
        }),
        timesecs: start.timestamp.and_then(|t| t.timesecs),
        protocol: test.as_ref().and_then(|t| t.protocol.clone()),
        num_streams: test.as_ref().and_then(|t| t.num_streams),
        reverse: flag(test.as_ref().and_then(|t| t.reverse)),
        bidir: flag(test.as_ref().and_then(|t| t.bidir)),
        duration: test.as_ref().and_then(|t| t.duration),
        blksize: test.as_ref().and_then(|t| t.blksize),
        omit: test.as_ref().and_then(|t| t.omit),
        bytes: test.as_ref().and_then(|t| t.bytes),
        blocks: test.as_ref().and_then(|t| t.blocks),
        tos: test.as_ref().and_then(|t| t.tos),
        target_bitrate: test.as_ref().and_then(|t| t.target_bitrate),
    }
}

fn truncate(line: &str) -> &str {
    match line.char_indices().nth(120) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}
