//! Structured events parsed from probe output
//!
//! Both the ping line parser and the iperf3 JSON-stream parser emit
//! [`ParsedEvent`]s. Events are serializable so a run's event sequence can be
//! stored and later turned into line protocol points.

use serde::{Deserialize, Serialize};

/// One structured occurrence in a probe's output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParsedEvent {
    /// iperf3 connection metadata
    Start(StartInfo),
    /// iperf3 per-interval throughput report
    Interval(IntervalSample),
    /// ping summary line
    PacketLoss(PacketLoss),
    /// ping echo reply
    Rtt(RttSample),
    /// ping destination unreachable
    Unreachable {
        line: String,
        host: Option<String>,
        icmp_seq: Option<u32>,
        /// From the `-D` prefix, unix milliseconds
        #[serde(default)]
        timestamp_ms: Option<i64>,
    },
    /// ping request timed out
    Timeout {
        line: String,
        icmp_seq: Option<u32>,
        #[serde(default)]
        timestamp_ms: Option<i64>,
    },
    /// Probe-reported error, message kept verbatim
    Error { message: String },
    /// Line that matched no known shape
    Unknown { line: String },
}

impl ParsedEvent {
    /// Short kind label, used for storage and logging
    pub fn kind(&self) -> &'static str {
        match self {
            ParsedEvent::Start(_) => "start",
            ParsedEvent::Interval(_) => "interval",
            ParsedEvent::PacketLoss(_) => "packet_loss",
            ParsedEvent::Rtt(_) => "rtt",
            ParsedEvent::Unreachable { .. } => "unreachable",
            ParsedEvent::Timeout { .. } => "timeout",
            ParsedEvent::Error { .. } => "error",
            ParsedEvent::Unknown { .. } => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectingTo {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartInfo {
    pub version: Option<String>,
    pub protocol: Option<String>,
    /// Present only when this side is the client
    pub connecting_to: Option<ConnectingTo>,
    /// Test start, unix seconds
    pub timesecs: Option<u64>,
    pub num_streams: Option<u32>,
    pub reverse: Option<bool>,
    pub bidir: Option<bool>,
    pub duration: Option<u64>,
    pub blksize: Option<u64>,
    pub omit: Option<u64>,
    pub bytes: Option<u64>,
    pub blocks: Option<u64>,
    pub tos: Option<u64>,
    pub target_bitrate: Option<u64>,
}

/// Aggregate over all streams of one direction for one interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SumRecord {
    pub start: f64,
    pub end: f64,
    pub seconds: f64,
    pub bytes: u64,
    pub bits_per_second: f64,
    pub sender: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpStreamInfo {
    pub snd_cwnd: Option<u64>,
    pub snd_wnd: Option<u64>,
    pub retransmits: Option<u64>,
    pub rtt: Option<u64>,
    pub rttvar: Option<u64>,
    pub pmtu: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UdpStreamInfo {
    pub jitter_ms: Option<f64>,
    pub lost_packets: Option<u64>,
    pub packets: Option<u64>,
    pub lost_percent: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSample {
    pub socket: i64,
    pub start: f64,
    pub end: f64,
    pub seconds: f64,
    pub bytes: u64,
    pub bits_per_second: f64,
    pub sender: bool,
    pub omitted: bool,
    pub tcp: Option<TcpStreamInfo>,
    pub udp: Option<UdpStreamInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalSample {
    pub streams: Vec<StreamSample>,
    pub sum: SumRecord,
    /// Reverse-direction sum, only reported in bidirectional tests
    pub sum_bidir_reverse: Option<SumRecord>,
}

impl IntervalSample {
    /// All sum records of this interval in report order
    pub fn sums(&self) -> impl Iterator<Item = &SumRecord> {
        std::iter::once(&self.sum).chain(self.sum_bidir_reverse.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketLoss {
    pub transmitted: u64,
    pub received: u64,
    pub loss_percent: f64,
    pub time_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RttSample {
    pub host: String,
    /// Numeric address when the reply line carried a resolved name
    pub ip: Option<String>,
    pub icmp_seq: u32,
    pub ttl: u32,
    pub rtt_ms: f64,
    /// From ping's `-D` prefix, unix milliseconds
    pub timestamp_ms: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serde_uses_kind_tag() {
        let event = ParsedEvent::Error {
            message: "test start error".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"error\""));

        let back: ParsedEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.kind(), "error");
    }

    #[test]
    fn test_interval_sums_include_reverse() {
        let sum = SumRecord {
            start: 0.0,
            end: 1.0,
            seconds: 1.0,
            bytes: 1000,
            bits_per_second: 8000.0,
            sender: true,
        };
        let mut interval = IntervalSample {
            streams: Vec::new(),
            sum: sum.clone(),
            sum_bidir_reverse: None,
        };
        assert_eq!(interval.sums().count(), 1);

        interval.sum_bidir_reverse = Some(SumRecord { sender: false, ..sum });
        let senders: Vec<bool> = interval.sums().map(|s| s.sender).collect();
        assert_eq!(senders, vec![true, false]);
    }
}
