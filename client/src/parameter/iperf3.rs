//! iperf3 parameters

use super::{format_number, Params, ValidationError};
use protocol::{IPERF3_DEFAULT_INTERVAL_S, IPERF3_DEFAULT_PORT, IPERF3_DEFAULT_TIME_S};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;

pub const HOST: &str = "host";
pub const IPERF3_UUID: &str = "iperf3UUID";
pub const PORT: &str = "port";
pub const BITRATE: &str = "bitrate";
pub const TIME: &str = "time";
pub const INTERVAL: &str = "interval";
pub const LENGTH: &str = "length";
pub const STREAMS: &str = "streams";
pub const PARALLEL: &str = "parallel";
pub const DIRECTION: &str = "direction";
pub const PROTOCOL: &str = "protocol";
pub const MODE: &str = "mode";
pub const SERVER: &str = "server";
pub const ONE_OFF: &str = "oneOff";
pub const OMIT: &str = "omit";
pub const TITLE: &str = "title";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
    Bidir,
}

impl Direction {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" => Some(Direction::Up),
            "down" => Some(Direction::Down),
            "bidir" => Some(Direction::Bidir),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
            Direction::Bidir => "bidir",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportProtocol {
    Tcp,
    Udp,
}

impl TransportProtocol {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Some(TransportProtocol::Tcp),
            "udp" => Some(TransportProtocol::Udp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportProtocol::Tcp => "tcp",
            TransportProtocol::Udp => "udp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Iperf3Mode {
    Client,
    Server,
}

impl Iperf3Mode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "client" => Some(Iperf3Mode::Client),
            "server" => Some(Iperf3Mode::Server),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Iperf3Mode::Client => "client",
            Iperf3Mode::Server => "server",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ArgKind {
    /// `flag value`
    Text,
    /// `flag N`
    Number,
    /// `flag=N`
    Attached,
    /// bare `flag` when true
    Switch,
}

struct FlagSpec {
    key: &'static str,
    flag: &'static str,
    kind: ArgKind,
}

const fn text(key: &'static str, flag: &'static str) -> FlagSpec {
    FlagSpec { key, flag, kind: ArgKind::Text }
}

const fn number(key: &'static str, flag: &'static str) -> FlagSpec {
    FlagSpec { key, flag, kind: ArgKind::Number }
}

const fn switch(key: &'static str, flag: &'static str) -> FlagSpec {
    FlagSpec { key, flag, kind: ArgKind::Switch }
}

const COMMON_FLAGS: &[FlagSpec] = &[
    text("pidfile", "-I"),
    text("file", "-F"),
    text("affinity", "-A"),
    text("bind", "-B"),
    text("bindDev", "--bind-dev"),
    switch("verbose", "-V"),
    text("timestamps", "--timestamps"),
    number("rcvTimeout", "--rcv-timeout"),
    number("sndTimeout", "--snd-timeout"),
    FlagSpec { key: "debug", flag: "--debug", kind: ArgKind::Attached },
];

const SERVER_FLAGS: &[FlagSpec] = &[
    switch(ONE_OFF, "-1"),
    text("serverBitrateLimit", "--server-bitrate-limit"),
    number("idleTimeout", "--idle-timeout"),
    text("rsaPrivateKeyPath", "--rsa-private-key-path"),
    text("authorizedUsersPath", "--authorized-users-path"),
    number("timeSkewThreshold", "--time-skew-threshold"),
    switch("usePkcs1Padding", "--use-pkcs1-padding"),
];

const CLIENT_FLAGS: &[FlagSpec] = &[
    switch("sctp", "--sctp"),
    text("xbind", "-X"),
    number("connectTimeout", "--connect-timeout"),
    text("pacingTimer", "--pacing-timer"),
    text("fqRate", "--fq-rate"),
    text("bytes", "-n"),
    text("blockcount", "-k"),
    number("cport", "--cport"),
];

const TCPIP_FLAGS: &[FlagSpec] = &[
    text("window", "-w"),
    text("congestion", "-C"),
    number("setMss", "-M"),
    switch("noDelay", "-N"),
    switch("version4", "-4"),
    switch("version6", "-6"),
    number("tos", "-S"),
    text("dscp", "--dscp"),
    number("flowlabel", "-L"),
    switch("zerocopy", "-Z"),
    number(OMIT, "-O"),
    text(TITLE, "-T"),
    text("extraData", "--extra-data"),
    switch("getServerOutput", "--get-server-output"),
    switch("udpCounters64bit", "--udp-counters-64bit"),
    switch("repeatingPayload", "--repeating-payload"),
    switch("dontFragment", "--dont-fragment"),
    text("username", "--username"),
    text("rsaPublicKeyPath", "--rsa-public-key-path"),
];

#[derive(Debug, Clone, PartialEq)]
enum FlagValue {
    Text(String),
    Number(u32),
    Switch(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Iperf3Parameter {
    mode: Iperf3Mode,
    host: Option<String>,
    iperf3_uuid: Option<String>,
    port: Option<u16>,
    bitrate: Option<String>,
    time: Option<u32>,
    interval: Option<f64>,
    length: Option<String>,
    streams: Option<u32>,
    direction: Option<Direction>,
    protocol: Option<TransportProtocol>,
    flags: BTreeMap<&'static str, FlagValue>,
}

impl Iperf3Parameter {
    /// Client-mode parameters against `host`
    pub fn client(host: impl Into<String>) -> Result<Self, ValidationError> {
        let host = host.into();
        if host.trim().is_empty() {
            return Err(ValidationError::MissingField(HOST));
        }
        Ok(Self::empty(Iperf3Mode::Client, Some(host.trim().to_string())))
    }

    pub fn server() -> Self {
        Self::empty(Iperf3Mode::Server, None)
    }

    fn empty(mode: Iperf3Mode, host: Option<String>) -> Self {
        Self {
            mode,
            host,
            iperf3_uuid: None,
            port: None,
            bitrate: None,
            time: None,
            interval: None,
            length: None,
            streams: None,
            direction: None,
            protocol: None,
            flags: BTreeMap::new(),
        }
    }

    pub fn from_map(map: &Map<String, Value>) -> Result<Self, ValidationError> {
        let params = Params::new(map);

        let host = params.string(HOST)?;
        let explicit_mode = match params.string(MODE)? {
            Some(m) => Some(Iperf3Mode::parse(&m).ok_or_else(|| invalid(MODE, &m))?),
            None => None,
        };
        let server_flag = params.boolean(SERVER)?.unwrap_or(false);

        let is_server = server_flag || explicit_mode == Some(Iperf3Mode::Server);
        let mode = if is_server {
            if host.is_some() {
                return Err(ValidationError::Conflict("server mode together with a client host"));
            }
            Iperf3Mode::Server
        } else if explicit_mode == Some(Iperf3Mode::Client) || host.is_some() {
            if host.is_none() {
                return Err(ValidationError::MissingField(HOST));
            }
            Iperf3Mode::Client
        } else {
            return Err(ValidationError::NoMode);
        };

        let port = match params.integer(PORT)? {
            Some(p) if (0..=65535).contains(&p) => Some(p as u16),
            Some(p) => return Err(ValidationError::PortOutOfRange(p)),
            None => None,
        };
        let streams = match params.unsigned(STREAMS)? {
            Some(s) => Some(s),
            None => params.unsigned(PARALLEL)?,
        };
        let direction = match params.string(DIRECTION)? {
            Some(d) => Some(Direction::parse(&d).ok_or_else(|| invalid(DIRECTION, &d))?),
            None => None,
        };
        let protocol = match params.string(PROTOCOL)? {
            Some(p) => Some(TransportProtocol::parse(&p).ok_or_else(|| invalid(PROTOCOL, &p))?),
            None => None,
        };

        let mut parameter = Self::empty(mode, host)
            .with_port(port)?
            .with_bitrate(params.string(BITRATE)?)
            .with_time(params.unsigned(TIME)?)
            .with_streams(streams)
            .with_direction(direction)
            .with_protocol(protocol);
        parameter.iperf3_uuid = params.string(IPERF3_UUID)?;
        parameter.interval = params.float(INTERVAL)?;
        parameter.length = params.string(LENGTH)?;

        for spec in COMMON_FLAGS
            .iter()
            .chain(SERVER_FLAGS)
            .chain(CLIENT_FLAGS)
            .chain(TCPIP_FLAGS)
        {
            let value = match spec.kind {
                ArgKind::Text => params.string(spec.key)?.map(FlagValue::Text),
                ArgKind::Number | ArgKind::Attached => {
                    params.unsigned(spec.key)?.map(FlagValue::Number)
                }
                ArgKind::Switch => params.boolean(spec.key)?.map(FlagValue::Switch),
            };
            if let Some(value) = value {
                parameter.flags.insert(spec.key, value);
            }
        }

        Ok(parameter)
    }

    pub fn with_port(mut self, port: Option<u16>) -> Result<Self, ValidationError> {
        if port == Some(0) {
            return Err(ValidationError::PortOutOfRange(0));
        }
        self.port = port;
        Ok(self)
    }

    pub fn with_time(mut self, time: Option<u32>) -> Self {
        self.time = time;
        self
    }

    pub fn with_direction(mut self, direction: Option<Direction>) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_protocol(mut self, protocol: Option<TransportProtocol>) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_bitrate(mut self, bitrate: Option<String>) -> Self {
        self.bitrate = bitrate
            .filter(|b| !b.trim().is_empty())
            .map(|b| normalize_bitrate(&b));
        self
    }

    pub fn with_streams(mut self, streams: Option<u32>) -> Self {
        self.streams = streams;
        self
    }

    pub fn mode(&self) -> Iperf3Mode {
        self.mode
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn iperf3_uuid(&self) -> Option<&str> {
        self.iperf3_uuid.as_deref()
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(IPERF3_DEFAULT_PORT)
    }

    pub fn interval_secs(&self) -> f64 {
        self.interval.unwrap_or(IPERF3_DEFAULT_INTERVAL_S)
    }

    pub fn time_secs(&self) -> u32 {
        self.time.unwrap_or(IPERF3_DEFAULT_TIME_S)
    }

    pub fn direction(&self) -> Direction {
        self.direction.unwrap_or(Direction::Up)
    }

    pub fn protocol(&self) -> TransportProtocol {
        self.protocol.unwrap_or(TransportProtocol::Tcp)
    }

    pub fn bitrate(&self) -> Option<&str> {
        self.bitrate.as_deref()
    }

    pub fn streams(&self) -> Option<u32> {
        self.streams
    }

    pub fn one_off(&self) -> bool {
        matches!(self.flags.get(ONE_OFF), Some(FlagValue::Switch(true)))
    }

    /// Argument vector: mode, common, server, client, direction and TCP/IP
    /// options, then the fixed streaming-output flags
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();

        match (self.mode, &self.host) {
            (Iperf3Mode::Client, Some(host)) => {
                args.push("-c".to_string());
                args.push(host.clone());
            }
            _ => args.push("-s".to_string()),
        }

        if let Some(port) = self.port {
            push_pair(&mut args, "-p", port.to_string());
        }
        if let Some(interval) = self.interval {
            push_pair(&mut args, "-i", format_number(interval));
        }
        self.push_flags(&mut args, COMMON_FLAGS);
        self.push_flags(&mut args, SERVER_FLAGS);

        if self.mode == Iperf3Mode::Client {
            self.push_client_args(&mut args);
        }
        self.push_flags(&mut args, TCPIP_FLAGS);

        args.push("--json-stream".to_string());
        args.push("--forceflush".to_string());
        args
    }

    /// Options a server rejects or ignores
    fn push_client_args(&self, args: &mut Vec<String>) {
        self.push_flags(args, CLIENT_FLAGS);
        if self.protocol == Some(TransportProtocol::Udp) {
            args.push("-u".to_string());
        }
        if let Some(bitrate) = &self.bitrate {
            push_pair(args, "-b", bitrate.clone());
        }
        if let Some(time) = self.time {
            push_pair(args, "-t", time.to_string());
        }
        if let Some(length) = &self.length {
            push_pair(args, "-l", length.clone());
        }
        if let Some(streams) = self.streams {
            push_pair(args, "-P", streams.to_string());
        }

        match self.direction {
            Some(Direction::Down) => args.push("--reverse".to_string()),
            Some(Direction::Bidir) => args.push("--bidir".to_string()),
            Some(Direction::Up) | None => {}
        }
    }

    fn push_flags(&self, args: &mut Vec<String>, specs: &[FlagSpec]) {
        for spec in specs {
            match (self.flags.get(spec.key), spec.kind) {
                (Some(FlagValue::Text(v)), _) => push_pair(args, spec.flag, v.clone()),
                (Some(FlagValue::Number(n)), ArgKind::Attached) => {
                    args.push(format!("{}={}", spec.flag, n))
                }
                (Some(FlagValue::Number(n)), _) => push_pair(args, spec.flag, n.to_string()),
                (Some(FlagValue::Switch(true)), _) => args.push(spec.flag.to_string()),
                (Some(FlagValue::Switch(false)), _) | (None, _) => {}
            }
        }
    }

    /// Client runs end after the configured time; servers wait indefinitely
    pub fn expected_duration(&self) -> Option<Duration> {
        match self.mode {
            Iperf3Mode::Client => {
                let omit = match self.flags.get(OMIT) {
                    Some(FlagValue::Number(n)) => *n,
                    _ => 0,
                };
                Some(Duration::from_secs(u64::from(self.time_secs()) + u64::from(omit)))
            }
            Iperf3Mode::Server => None,
        }
    }

    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert(MODE.into(), json!(self.mode.as_str()));
        if let Some(v) = &self.host {
            map.insert(HOST.into(), json!(v));
        }
        if let Some(v) = &self.iperf3_uuid {
            map.insert(IPERF3_UUID.into(), json!(v));
        }
        if let Some(v) = self.port {
            map.insert(PORT.into(), json!(v));
        }
        if let Some(v) = &self.bitrate {
            map.insert(BITRATE.into(), json!(v));
        }
        if let Some(v) = self.time {
            map.insert(TIME.into(), json!(v));
        }
        if let Some(v) = self.interval {
            map.insert(INTERVAL.into(), json!(v));
        }
        if let Some(v) = &self.length {
            map.insert(LENGTH.into(), json!(v));
        }
        if let Some(v) = self.streams {
            map.insert(STREAMS.into(), json!(v));
        }
        if let Some(v) = self.direction {
            map.insert(DIRECTION.into(), json!(v.as_str()));
        }
        if let Some(v) = self.protocol {
            map.insert(PROTOCOL.into(), json!(v.as_str()));
        }
        for (key, value) in &self.flags {
            let value = match value {
                FlagValue::Text(s) => json!(s),
                FlagValue::Number(n) => json!(n),
                FlagValue::Switch(b) => json!(b),
            };
            map.insert((*key).to_string(), value);
        }
        Value::Object(map)
    }
}

fn push_pair(args: &mut Vec<String>, flag: &str, value: String) {
    args.push(flag.to_string());
    args.push(value);
}

fn invalid(key: &str, value: &str) -> ValidationError {
    ValidationError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

/// A bare number is megabits; anything with a unit passes through
fn normalize_bitrate(bitrate: &str) -> String {
    let bitrate = bitrate.trim();
    if bitrate.parse::<f64>().is_ok() {
        format!("{}M", bitrate)
    } else {
        bitrate.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from(value: Value) -> Result<Iperf3Parameter, ValidationError> {
        Iperf3Parameter::from_map(value.as_object().unwrap())
    }

    fn pos(args: &[String], flag: &str) -> usize {
        args.iter()
            .position(|a| a == flag)
            .unwrap_or_else(|| panic!("{flag} missing from {args:?}"))
    }

    #[test]
    fn test_minimal_client_args() {
        let p = from(json!({"host": "iperf.example.org"})).unwrap();
        assert_eq!(
            p.args(),
            vec!["-c", "iperf.example.org", "--json-stream", "--forceflush"]
        );
        assert_eq!(p.port(), 5201);
        assert_eq!(p.time_secs(), 10);
        assert_eq!(p.interval_secs(), 1.0);
        assert_eq!(p.direction(), Direction::Up);
        assert_eq!(p.protocol(), TransportProtocol::Tcp);
    }

    #[test]
    fn test_server_args() {
        let p = from(json!({"server": true, "port": 5202, "oneOff": true})).unwrap();
        assert_eq!(p.mode(), Iperf3Mode::Server);
        assert_eq!(
            p.args(),
            vec!["-s", "-p", "5202", "-1", "--json-stream", "--forceflush"]
        );
        assert!(p.one_off());
        assert_eq!(p.expected_duration(), None);
    }

    #[test]
    fn test_server_args_skip_client_options() {
        let p = from(json!({
            "server": true,
            "time": 20,
            "bitrate": "5M",
            "parallel": 4,
            "protocol": "udp",
            "direction": "bidir",
            "bytes": "1G",
            "window": "256K"
        }))
        .unwrap();
        let args = p.args();
        for flag in ["-t", "-b", "-P", "-u", "--bidir", "-n"] {
            assert!(!args.contains(&flag.to_string()), "{flag} in {args:?}");
        }
        assert_eq!(&args[..3], &["-s", "-w", "256K"]);
        assert_eq!(p.expected_duration(), None);
    }

    #[test]
    fn test_client_without_host_rejected() {
        assert_eq!(
            from(json!({"mode": "client"})),
            Err(ValidationError::MissingField(HOST))
        );
        assert_eq!(
            from(json!({"mode": "client", "host": ""})),
            Err(ValidationError::MissingField(HOST))
        );
    }

    #[test]
    fn test_server_with_host_rejected() {
        assert!(matches!(
            from(json!({"server": true, "host": "iperf.example.org"})),
            Err(ValidationError::Conflict(_))
        ));
        assert!(matches!(
            from(json!({"mode": "server", "host": "iperf.example.org"})),
            Err(ValidationError::Conflict(_))
        ));
    }

    #[test]
    fn test_no_mode_rejected() {
        assert_eq!(from(json!({"time": 5})), Err(ValidationError::NoMode));
    }

    #[test]
    fn test_invalid_enums_rejected() {
        assert!(matches!(
            from(json!({"host": "h", "direction": "sideways"})),
            Err(ValidationError::InvalidValue { .. })
        ));
        assert!(matches!(
            from(json!({"host": "h", "protocol": "quic"})),
            Err(ValidationError::InvalidValue { .. })
        ));
        assert!(matches!(
            from(json!({"mode": "peer"})),
            Err(ValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_port_range() {
        assert_eq!(
            from(json!({"host": "h", "port": 0})),
            Err(ValidationError::PortOutOfRange(0))
        );
        assert_eq!(
            from(json!({"host": "h", "port": 70000})),
            Err(ValidationError::PortOutOfRange(70000))
        );
    }

    #[test]
    fn test_direction_flags() {
        let down = from(json!({"host": "h", "direction": "down"})).unwrap();
        assert!(down.args().contains(&"--reverse".to_string()));

        let bidir = from(json!({"host": "h", "direction": "BIDIR"})).unwrap();
        assert!(bidir.args().contains(&"--bidir".to_string()));

        let up = from(json!({"host": "h", "direction": "up"})).unwrap();
        let args = up.args();
        assert!(!args.contains(&"--reverse".to_string()));
        assert!(!args.contains(&"--bidir".to_string()));
    }

    #[test]
    fn test_bitrate_suffix() {
        let p = from(json!({"host": "h", "bitrate": 10})).unwrap();
        let args = p.args();
        assert_eq!(args[pos(&args, "-b") + 1], "10M");

        let p = from(json!({"host": "h", "bitrate": "500K"})).unwrap();
        let args = p.args();
        assert_eq!(args[pos(&args, "-b") + 1], "500K");
    }

    #[test]
    fn test_argument_groups_in_order() {
        let p = from(json!({
            "host": "iperf.example.org",
            "port": 5202,
            "interval": 0.5,
            "verbose": true,
            "idleTimeout": 30,
            "protocol": "udp",
            "time": 20,
            "parallel": 4,
            "direction": "down",
            "window": "256K",
            "title": "run one",
            "debug": 2,
            "noDelay": false
        }))
        .unwrap();
        let args = p.args();

        assert_eq!(&args[..2], &["-c", "iperf.example.org"]);
        assert!(pos(&args, "-p") < pos(&args, "-V"));
        assert!(pos(&args, "-V") < pos(&args, "--idle-timeout"));
        assert!(pos(&args, "--idle-timeout") < pos(&args, "-u"));
        assert!(pos(&args, "-u") < pos(&args, "-t"));
        assert!(pos(&args, "-P") < pos(&args, "--reverse"));
        assert!(pos(&args, "--reverse") < pos(&args, "-w"));
        assert!(pos(&args, "-w") < pos(&args, "-T"));
        assert_eq!(args[pos(&args, "-i") + 1], "0.5");
        assert_eq!(args[pos(&args, "-P") + 1], "4");
        assert!(args.contains(&"--debug=2".to_string()));
        assert!(!args.contains(&"-N".to_string()));
        assert_eq!(&args[args.len() - 2..], &["--json-stream", "--forceflush"]);
    }

    #[test]
    fn test_expected_duration_includes_omit() {
        let p = from(json!({"host": "h", "time": 5, "omit": 2})).unwrap();
        assert_eq!(p.expected_duration(), Some(Duration::from_secs(7)));

        let max = u32::MAX;
        let p = from(json!({"host": "h", "time": max, "omit": max})).unwrap();
        assert_eq!(
            p.expected_duration(),
            Some(Duration::from_secs(2 * u64::from(u32::MAX)))
        );
    }

    #[test]
    fn test_json_round_trip() {
        let p = from(json!({
            "host": "h",
            "iperf3UUID": "u-1",
            "port": 5202,
            "bitrate": "20",
            "direction": "bidir",
            "zerocopy": true,
            "tos": 16
        }))
        .unwrap();
        let back = from(p.to_json()).unwrap();
        assert_eq!(back.args(), p.args());
        assert_eq!(back.iperf3_uuid(), Some("u-1"));
    }
}
