//! Run record to line protocol conversion

use crate::parameter::{Direction, Iperf3Parameter, PingParameter, ProbeParameter, format_number};
use crate::runner::RunRecord;
use protocol::events::{IntervalSample, StartInfo, StreamSample};
use protocol::{LineProtocolPoint, ParsedEvent, ProtocolError};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum EncodingError {
    #[error("Invalid point: {0}")]
    Point(#[from] ProtocolError),

    #[error("Run {0} produced no valid points")]
    NoPoints(String),

    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result of a successful encode
#[derive(Debug, Clone)]
pub struct Encoded {
    pub points: Vec<LineProtocolPoint>,
    /// Points that failed validation and were left out
    pub dropped: usize,
}

#[derive(Debug, Clone, Default)]
pub struct LineProtocolEncoder {
    static_tags: BTreeMap<String, String>,
}

impl LineProtocolEncoder {
    pub fn new(static_tags: BTreeMap<String, String>) -> Self {
        Self { static_tags }
    }

    /// All points for a run, unvalidated
    pub fn points(&self, record: &RunRecord) -> Vec<LineProtocolPoint> {
        match &record.parameter {
            ProbeParameter::Iperf3(param) => self.iperf3_points(record, param),
            ProbeParameter::Ping(param) => self.ping_points(record, param),
        }
    }

    /// Valid points for a run; invalid ones are counted and dropped
    pub fn encode(&self, record: &RunRecord) -> Result<Encoded, EncodingError> {
        let encoded = validated(self.points(record));
        if encoded.points.is_empty() {
            return Err(EncodingError::NoPoints(record.test_uuid.clone()));
        }
        Ok(encoded)
    }

    /// Encode a run and rewrite its `.lp` file
    pub async fn write(&self, record: &RunRecord, path: &Path) -> Result<Encoded, EncodingError> {
        let encoded = self.encode(record)?;
        write_points(path, &encoded.points).await?;
        info!(
            "Encoded run {}: {} points to {}",
            record.test_uuid,
            encoded.points.len(),
            path.display()
        );
        Ok(encoded)
    }

    fn base_point(&self, measurement: &str, record: &RunRecord) -> LineProtocolPoint {
        let mut point = LineProtocolPoint::new(measurement)
            .tag(protocol::TAG_TEST_UUID, record.test_uuid.as_str())
            .tag(protocol::TAG_SEQUENCE_UUID, record.sequence_uuid.as_str())
            .tag(protocol::TAG_MEASUREMENT_UUID, record.measurement_uuid.as_str())
            .tag(protocol::TAG_CAMPAIGN_UUID, record.campaign_uuid.as_str());
        for (key, value) in &self.static_tags {
            point.add_tag(key.as_str(), value.as_str());
        }
        point
    }

    fn iperf3_points(&self, record: &RunRecord, param: &Iperf3Parameter) -> Vec<LineProtocolPoint> {
        let default_start = StartInfo::default();
        let start = record
            .events()
            .iter()
            .find_map(|e| match e {
                ParsedEvent::Start(start) => Some(start),
                _ => None,
            })
            .unwrap_or(&default_start);

        let base_ms = match start.timesecs {
            Some(secs) => secs as i64 * 1000,
            None => {
                debug!("Run {} has no start event, using run start time", record.test_uuid);
                record.started_at.timestamp_millis()
            }
        };

        let mut common = self.base_point(protocol::MEASUREMENT_IPERF3, record);
        if let Some(uuid) = param.iperf3_uuid() {
            common.add_tag(protocol::TAG_IPERF3_UUID, uuid);
        }
        let bidir = start
            .bidir
            .unwrap_or(param.direction() == Direction::Bidir);
        let reversed = start
            .reverse
            .unwrap_or(param.direction() == Direction::Down);
        common.add_tag("bidir", bidir.to_string());
        common.add_tag("reversed", reversed.to_string());
        common.add_tag("oneOff", param.one_off().to_string());
        common.add_tag("interval", format_number(param.interval_secs()));
        common.add_tag(
            "protocol",
            start
                .protocol
                .clone()
                .unwrap_or_else(|| param.protocol().as_str().to_uppercase()),
        );
        common.add_tag("role", param.mode().as_str());
        if let Some(version) = &start.version {
            common.add_tag("version", version.as_str());
        }
        match (&start.connecting_to, param.host()) {
            (Some(to), _) => {
                common.add_tag("connectingToHost", to.host.as_str());
                common.add_tag("connectingToPort", to.port.to_string());
            }
            (None, Some(host)) => {
                common.add_tag("connectingToHost", host);
                common.add_tag("connectingToPort", param.port().to_string());
            }
            (None, None) => {}
        }
        match (start.target_bitrate, param.bitrate()) {
            (Some(v), _) => common.add_tag("bandwidth", v.to_string()),
            (None, Some(v)) => common.add_tag("bandwidth", v),
            (None, None) => {}
        }
        if let Some(v) = start.duration {
            common.add_tag("duration", v.to_string());
        }
        if let Some(v) = start.bytes {
            common.add_tag("bytesToTransmit", v.to_string());
        }
        if let Some(v) = start.num_streams.or(param.streams()) {
            common.add_tag("streams", v.to_string());
        }

        let intervals = record.events().iter().filter_map(|e| match e {
            ParsedEvent::Interval(interval) => Some(interval),
            _ => None,
        });

        let mut points = Vec::new();
        for (interval_idx, interval) in intervals.enumerate() {
            points.extend(stream_points(&common, base_ms, interval_idx, interval));
        }
        points
    }

    fn ping_points(&self, record: &RunRecord, param: &PingParameter) -> Vec<LineProtocolPoint> {
        let started_ms = record.started_at.timestamp_millis();
        let finished_ms = record
            .finished_at
            .map(|t| t.timestamp_millis())
            .unwrap_or(started_ms);
        let mut common = self
            .base_point(protocol::MEASUREMENT_PING, record)
            .tag("destination", param.destination());
        if let Some(count) = param.count() {
            common.add_tag("count", count.to_string());
        }
        if let Some(interval) = param.interval() {
            common.add_tag("interval", format_number(interval));
        }

        let mut last_ms = started_ms;
        // markers without their own timestamp must not share one
        let mut marker_ms = i64::MIN;
        let mut points = Vec::new();
        for event in record.events() {
            let point = match event {
                ParsedEvent::Rtt(rtt) => {
                    last_ms = rtt.timestamp_ms.unwrap_or(last_ms);
                    let mut point = common
                        .clone()
                        .tag("host", rtt.host.as_str())
                        .field("icmp_seq", rtt.icmp_seq as i64)
                        .field("ttl", rtt.ttl as i64)
                        .field("rtt", rtt.rtt_ms)
                        .time_ms(last_ms);
                    if let Some(ip) = &rtt.ip {
                        point.add_tag("ip", ip.as_str());
                    }
                    point
                }
                ParsedEvent::PacketLoss(loss) => common
                    .clone()
                    .field("packets_transmitted", loss.transmitted as i64)
                    .field("packets_received", loss.received as i64)
                    .field("packet_loss", loss.loss_percent)
                    .time_ms(finished_ms),
                ParsedEvent::Unreachable {
                    host,
                    icmp_seq,
                    timestamp_ms,
                    ..
                } => {
                    marker_ms = timestamp_ms.unwrap_or(marker_ms.max(last_ms) + 1);
                    let mut point = common
                        .clone()
                        .tag("event", "unreachable")
                        .field("unreachable", true)
                        .time_ms(marker_ms);
                    if let Some(host) = host {
                        point.add_tag("host", host.as_str());
                    }
                    if let Some(seq) = icmp_seq {
                        point.add_field("icmp_seq", *seq as i64);
                    }
                    point
                }
                ParsedEvent::Timeout {
                    icmp_seq,
                    timestamp_ms,
                    ..
                } => {
                    marker_ms = timestamp_ms.unwrap_or(marker_ms.max(last_ms) + 1);
                    let mut point = common
                        .clone()
                        .tag("event", "timeout")
                        .field("timeout", true)
                        .time_ms(marker_ms);
                    if let Some(seq) = icmp_seq {
                        point.add_field("icmp_seq", *seq as i64);
                    }
                    point
                }
                _ => continue,
            };
            points.push(point);
        }
        points
    }
}

fn stream_points(
    common: &LineProtocolPoint,
    base_ms: i64,
    interval_idx: usize,
    interval: &IntervalSample,
) -> Vec<LineProtocolPoint> {
    interval
        .streams
        .iter()
        .enumerate()
        .map(|(stream_idx, stream)| {
            let mut point = common
                .clone()
                .tag("sender", stream.sender.to_string())
                .tag("socket", stream.socket.to_string())
                .tag("streamIdx", stream_idx.to_string())
                .tag("intervalIdx", interval_idx.to_string())
                .field("bits_per_second", stream.bits_per_second)
                .field("seconds", stream.seconds)
                .field("bytes", stream.bytes as i64)
                .time_ms(base_ms + (stream.end * 1000.0).round() as i64);
            add_detail_fields(&mut point, stream);
            point
        })
        .collect()
}

/// TCP detail only means something on the sending side, UDP loss on the receiving side
fn add_detail_fields(point: &mut LineProtocolPoint, stream: &StreamSample) {
    if stream.sender {
        if let Some(tcp) = &stream.tcp {
            let fields = [
                ("snd_cwnd", tcp.snd_cwnd),
                ("snd_wnd", tcp.snd_wnd),
                ("retransmits", tcp.retransmits),
                ("rtt", tcp.rtt),
                ("rttvar", tcp.rttvar),
                ("pmtu", tcp.pmtu),
            ];
            for (key, value) in fields {
                if let Some(v) = value {
                    point.add_field(key, v as i64);
                }
            }
        }
    } else if let Some(udp) = &stream.udp {
        if let Some(v) = udp.jitter_ms {
            point.add_field("jitter_ms", v);
        }
        if let Some(v) = udp.lost_packets {
            point.add_field("lost_packets", v as i64);
        }
        if let Some(v) = udp.packets {
            point.add_field("packets", v as i64);
        }
        if let Some(v) = udp.lost_percent {
            point.add_field("lost_percent", v);
        }
    }
}

fn validated(points: Vec<LineProtocolPoint>) -> Encoded {
    let total = points.len();
    let points: Vec<_> = points
        .into_iter()
        .filter(|p| match p.validate() {
            Ok(()) => true,
            Err(e) => {
                warn!("Dropping {} point: {}", p.measurement, e);
                false
            }
        })
        .collect();
    Encoded {
        dropped: total - points.len(),
        points,
    }
}

/// Validate and write points, one per line, replacing any existing file
pub async fn write_points(
    path: &Path,
    points: &[LineProtocolPoint],
) -> Result<Encoded, EncodingError> {
    let encoded = validated(points.to_vec());
    if encoded.points.is_empty() {
        return Err(EncodingError::NoPoints(path.display().to_string()));
    }

    let mut body = String::new();
    for point in &encoded.points {
        body.push_str(&point.to_line()?);
        body.push('\n');
    }

    let io_err = |source| EncodingError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await.map_err(io_err)?;
    }
    tokio::fs::write(path, body).await.map_err(io_err)?;
    Ok(encoded)
}

/// Read a `.lp` file back into points
pub async fn read_points(path: &Path) -> Result<Vec<LineProtocolPoint>, EncodingError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| EncodingError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| LineProtocolPoint::parse(l).map_err(EncodingError::from))
        .collect()
}
