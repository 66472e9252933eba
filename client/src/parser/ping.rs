//! Line classifier for `ping -D` output

use super::{OutputParser, ParseError};
use protocol::events::{PacketLoss, ParsedEvent, RttSample};
use regex::{Captures, Regex};
use std::sync::LazyLock;

static RTT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:\[(?P<ts>\d+(?:\.\d+)?)\]\s*)?\d+\s+bytes from (?P<host>\S+?)(?:\s+\((?P<ip>[^)]+)\))?:\s+icmp_[sr]eq=(?P<seq>\d+)\s+ttl=(?P<ttl>\d+)\s+time=(?P<rtt>\d+(?:\.\d+)?)\s*ms",
    )
    .unwrap()
});

static PACKET_LOSS_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?P<tx>\d+)\s+packets\s+transmitted,\s+(?P<rx>\d+)\s+(?:packets\s+)?received.*?(?P<loss>\d+(?:\.\d+)?)%\s+packet\s+loss(?:.*?time\s+(?P<time>\d+)\s*ms)?",
    )
    .unwrap()
});

static UNREACHABLE_FROM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"From (?P<host>[^\s:]+)").unwrap());

static EPOCH_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[(?P<ts>\d+(?:\.\d+)?)\]").unwrap());

static ICMP_SEQ: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"icmp_[sr]eq[= ](?P<seq>\d+)").unwrap());

#[derive(Debug, Default)]
pub struct PingParser;

impl PingParser {
    pub fn new() -> Self {
        Self
    }
}

impl OutputParser for PingParser {
    fn parse_line(&mut self, line: &str) -> Result<Option<ParsedEvent>, ParseError> {
        let line = line.trim_end();
        if line.trim().is_empty() {
            return Ok(None);
        }

        let event = if line.contains("bytes from") {
            ParsedEvent::Rtt(parse_rtt(line)?)
        } else if line.contains("Unreachable") {
            ParsedEvent::Unreachable {
                line: line.to_string(),
                host: UNREACHABLE_FROM
                    .captures(line)
                    .map(|c| c["host"].to_string()),
                icmp_seq: icmp_seq(line),
                timestamp_ms: epoch_prefix(line),
            }
        } else if line.contains("Request timeout") || line.contains("no answer yet") {
            ParsedEvent::Timeout {
                line: line.to_string(),
                icmp_seq: icmp_seq(line),
                timestamp_ms: epoch_prefix(line),
            }
        } else if line.contains("packets transmitted") {
            ParsedEvent::PacketLoss(parse_packet_loss(line)?)
        } else {
            ParsedEvent::Unknown {
                line: line.to_string(),
            }
        };

        Ok(Some(event))
    }

    fn is_finished(&self) -> bool {
        false
    }
}

fn parse_rtt(line: &str) -> Result<RttSample, ParseError> {
    let caps = RTT_LINE.captures(line).ok_or_else(|| pattern_error("rtt", line))?;

    Ok(RttSample {
        host: caps["host"].to_string(),
        ip: caps.name("ip").map(|m| m.as_str().to_string()),
        icmp_seq: number(&caps, "seq", line)?,
        ttl: number(&caps, "ttl", line)?,
        rtt_ms: number(&caps, "rtt", line)?,
        timestamp_ms: caps.name("ts").and_then(|m| epoch_to_millis(m.as_str())),
    })
}

fn parse_packet_loss(line: &str) -> Result<PacketLoss, ParseError> {
    let caps = PACKET_LOSS_LINE
        .captures(line)
        .ok_or_else(|| pattern_error("packet loss", line))?;

    Ok(PacketLoss {
        transmitted: number(&caps, "tx", line)?,
        received: number(&caps, "rx", line)?,
        loss_percent: number(&caps, "loss", line)?,
        time_ms: caps.name("time").and_then(|m| m.as_str().parse().ok()),
    })
}

fn number<T: std::str::FromStr>(caps: &Captures, name: &str, line: &str) -> Result<T, ParseError> {
    caps.name(name)
        .and_then(|m| m.as_str().parse().ok())
        .ok_or_else(|| pattern_error("ping", line))
}

fn icmp_seq(line: &str) -> Option<u32> {
    ICMP_SEQ
        .captures(line)
        .and_then(|c| c["seq"].parse().ok())
}

fn epoch_prefix(line: &str) -> Option<i64> {
    EPOCH_PREFIX
        .captures(line)
        .and_then(|c| epoch_to_millis(&c["ts"]))
}

/// `1697040000.123456` -> `1697040000123`, without going through f64
fn epoch_to_millis(ts: &str) -> Option<i64> {
    let (secs, frac) = ts.split_once('.').unwrap_or((ts, ""));
    let secs: i64 = secs.parse().ok()?;
    let millis: i64 = format!("{:0<3}", &frac[..frac.len().min(3)]).parse().ok()?;
    secs.checked_mul(1000)?.checked_add(millis)
}

fn pattern_error(kind: &'static str, line: &str) -> ParseError {
    ParseError::Pattern {
        kind,
        line: line.to_string(),
    }
}
