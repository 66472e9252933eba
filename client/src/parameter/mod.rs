//! Probe parameters: validated settings, argument vectors and output paths

pub mod iperf3;
pub mod ping;

pub use iperf3::{Direction, Iperf3Parameter};
pub use ping::PingParameter;

use crate::config::Config;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Missing required parameter: {0}")]
    MissingField(&'static str),

    #[error("Conflicting parameters: {0}")]
    Conflict(&'static str),

    #[error("Neither client nor server mode could be derived")]
    NoMode,

    #[error("Invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },

    #[error("Parameter {key} must be {expected}")]
    WrongType { key: String, expected: &'static str },

    #[error("Port {0} outside 1..=65535")]
    PortOutOfRange(i64),

    #[error("Test id {0:?} may only contain letters, digits, '-' and '_'")]
    InvalidTestId(String),
}

/// Longest accepted test id
const MAX_TEST_ID_LEN: usize = 128;

/// Test ids become file names under the output root
pub fn validate_test_id(id: &str) -> Result<(), ValidationError> {
    let ok = !id.is_empty()
        && id.len() <= MAX_TEST_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(ValidationError::InvalidTestId(id.to_string()))
    }
}

/// Which external probe a parameter set drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    Ping,
    Iperf3,
}

impl ProbeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeKind::Ping => protocol::PROBE_DIR_PING,
            ProbeKind::Iperf3 => protocol::PROBE_DIR_IPERF3,
        }
    }

    fn raw_extension(&self) -> &'static str {
        match self {
            ProbeKind::Ping => "log",
            ProbeKind::Iperf3 => "json",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ping" => Some(ProbeKind::Ping),
            "iperf3" => Some(ProbeKind::Iperf3),
            _ => None,
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical artifact locations for one run
#[derive(Debug, Clone, PartialEq)]
pub struct OutputPaths {
    pub raw: PathBuf,
    pub line_protocol: PathBuf,
}

impl OutputPaths {
    pub fn new(root: &Path, kind: ProbeKind, test_uuid: &str) -> Self {
        let base = root.join(kind.as_str());
        Self {
            raw: base
                .join(protocol::RAW_DIR)
                .join(format!("{}.{}", test_uuid, kind.raw_extension())),
            line_protocol: base
                .join(protocol::LINE_PROTOCOL_DIR)
                .join(format!("{}.{}", test_uuid, protocol::LINE_PROTOCOL_EXT)),
        }
    }
}

/// Settings for a single probe invocation
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeParameter {
    Ping(PingParameter),
    Iperf3(Iperf3Parameter),
}

impl ProbeParameter {
    pub fn from_map(kind: ProbeKind, map: &Map<String, Value>) -> Result<Self, ValidationError> {
        match kind {
            ProbeKind::Ping => PingParameter::from_map(map).map(ProbeParameter::Ping),
            ProbeKind::Iperf3 => Iperf3Parameter::from_map(map).map(ProbeParameter::Iperf3),
        }
    }

    pub fn kind(&self) -> ProbeKind {
        match self {
            ProbeParameter::Ping(_) => ProbeKind::Ping,
            ProbeParameter::Iperf3(_) => ProbeKind::Iperf3,
        }
    }

    /// Argument vector without the program name
    pub fn args(&self) -> Vec<String> {
        match self {
            ProbeParameter::Ping(p) => p.args(),
            ProbeParameter::Iperf3(p) => p.args(),
        }
    }

    /// How long the probe should take when it behaves, if that is knowable
    pub fn expected_duration(&self) -> Option<Duration> {
        match self {
            ProbeParameter::Ping(p) => p.expected_duration(),
            ProbeParameter::Iperf3(p) => p.expected_duration(),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            ProbeParameter::Ping(p) => p.to_json(),
            ProbeParameter::Iperf3(p) => p.to_json(),
        }
    }
}

/// One requested test: identity tags plus the probe parameters
#[derive(Debug, Clone)]
pub struct TestInput {
    pub test_uuid: String,
    pub sequence_uuid: String,
    pub measurement_uuid: String,
    pub campaign_uuid: String,
    pub device: String,
    pub created_at: DateTime<Utc>,
    pub parameter: ProbeParameter,
}

impl TestInput {
    /// A standalone test with a fresh UUID and no grouping tags
    pub fn new(parameter: ProbeParameter) -> Self {
        Self {
            test_uuid: uuid::Uuid::new_v4().to_string(),
            sequence_uuid: String::new(),
            measurement_uuid: String::new(),
            campaign_uuid: String::new(),
            device: String::new(),
            created_at: Utc::now(),
            parameter,
        }
    }

    pub fn kind(&self) -> ProbeKind {
        self.parameter.kind()
    }

    pub fn output_paths(&self, root: &Path) -> OutputPaths {
        OutputPaths::new(root, self.kind(), &self.test_uuid)
    }
}

/// One entry of a JSON test plan
#[derive(Debug, Clone, Deserialize)]
struct PlanEntry {
    #[serde(rename = "testUUID", default)]
    test_uuid: Option<String>,
    #[serde(rename = "measurementUUID", default)]
    measurement_uuid: String,
    #[serde(rename = "sequenceUUID", default)]
    sequence_uuid: String,
    #[serde(rename = "campaignUUID", default)]
    campaign_uuid: String,
    #[serde(default)]
    device: String,
    #[serde(rename = "type")]
    probe_type: String,
    #[serde(default)]
    params: Map<String, Value>,
}

/// Parse a JSON test plan, merging the config's probe defaults under each entry
pub fn parse_plan(json: &str, config: &Config) -> Result<Vec<TestInput>> {
    let entries: Vec<PlanEntry> =
        serde_json::from_str(json).context("Failed to parse test plan")?;

    let mut inputs = Vec::with_capacity(entries.len());
    for (idx, entry) in entries.into_iter().enumerate() {
        let Some(kind) = ProbeKind::parse(&entry.probe_type) else {
            warn!("Skipping plan entry {} with unknown type {:?}", idx, entry.probe_type);
            continue;
        };

        let params = config.merged_params(kind.as_str(), &entry.params);
        let parameter = ProbeParameter::from_map(kind, &params)
            .with_context(|| format!("Invalid parameters in plan entry {}", idx))?;

        let test_uuid = match entry.test_uuid.filter(|u| !u.trim().is_empty()) {
            Some(id) => {
                let id = id.trim().to_string();
                validate_test_id(&id)
                    .with_context(|| format!("Invalid testUUID in plan entry {}", idx))?;
                id
            }
            None => uuid::Uuid::new_v4().to_string(),
        };
        debug!("Plan entry {}: {} test {}", idx, kind, test_uuid);

        inputs.push(TestInput {
            test_uuid,
            sequence_uuid: entry.sequence_uuid,
            measurement_uuid: entry.measurement_uuid,
            campaign_uuid: entry.campaign_uuid,
            device: entry.device,
            created_at: Utc::now(),
            parameter,
        });
    }

    Ok(inputs)
}

/// Typed, lenient access to a flat parameter map
///
/// Numbers given as strings and strings given as numbers are both accepted.
pub(crate) struct Params<'a> {
    map: &'a Map<String, Value>,
}

impl<'a> Params<'a> {
    pub(crate) fn new(map: &'a Map<String, Value>) -> Self {
        Self { map }
    }

    fn present(&self, key: &str) -> Option<&'a Value> {
        match self.map.get(key) {
            None | Some(Value::Null) => None,
            Some(v) => Some(v),
        }
    }

    pub(crate) fn string(&self, key: &str) -> Result<Option<String>, ValidationError> {
        match self.present(key) {
            None => Ok(None),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(_) => Err(wrong_type(key, "a string")),
        }
    }

    pub(crate) fn integer(&self, key: &str) -> Result<Option<i64>, ValidationError> {
        match self.present(key) {
            None => Ok(None),
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .map(Some)
                .ok_or_else(|| wrong_type(key, "an integer")),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| wrong_type(key, "an integer")),
            Some(_) => Err(wrong_type(key, "an integer")),
        }
    }

    pub(crate) fn unsigned(&self, key: &str) -> Result<Option<u32>, ValidationError> {
        match self.integer(key)? {
            None => Ok(None),
            Some(v) => u32::try_from(v).map(Some).map_err(|_| ValidationError::InvalidValue {
                key: key.to_string(),
                value: v.to_string(),
            }),
        }
    }

    pub(crate) fn float(&self, key: &str) -> Result<Option<f64>, ValidationError> {
        let value = match self.present(key) {
            None => return Ok(None),
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) if s.trim().is_empty() => return Ok(None),
            Some(Value::String(s)) => s.trim().parse().ok(),
            Some(_) => None,
        };
        match value {
            Some(v) if v.is_finite() && v >= 0.0 => Ok(Some(v)),
            Some(v) => Err(ValidationError::InvalidValue {
                key: key.to_string(),
                value: v.to_string(),
            }),
            None => Err(wrong_type(key, "a number")),
        }
    }

    pub(crate) fn boolean(&self, key: &str) -> Result<Option<bool>, ValidationError> {
        match self.present(key) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(Some(true)),
                "false" => Ok(Some(false)),
                _ => Err(wrong_type(key, "a boolean")),
            },
            Some(_) => Err(wrong_type(key, "a boolean")),
        }
    }
}

fn wrong_type(key: &str, expected: &'static str) -> ValidationError {
    ValidationError::WrongType {
        key: key.to_string(),
        expected,
    }
}

/// Float formatting for argv: `1` rather than `1.0`, `0.2` stays `0.2`
pub(crate) fn format_number(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        v.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> Config {
        Config::from_toml(
            r#"
[general]
root_dir = "omnt"
database_path = "netprobe.db"

[ping]
count = 5
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_output_paths() {
        let paths = OutputPaths::new(Path::new("/data/omnt"), ProbeKind::Ping, "abc");
        assert_eq!(paths.raw, PathBuf::from("/data/omnt/ping/raw/abc.log"));
        assert_eq!(
            paths.line_protocol,
            PathBuf::from("/data/omnt/ping/lineprotocol/abc.lp")
        );

        let paths = OutputPaths::new(Path::new("omnt"), ProbeKind::Iperf3, "def");
        assert_eq!(paths.raw, PathBuf::from("omnt/iperf3/raw/def.json"));
        assert_eq!(
            paths.line_protocol,
            PathBuf::from("omnt/iperf3/lineprotocol/def.lp")
        );
    }

    #[test]
    fn test_parse_plan() {
        let plan = json!([
            {
                "testUUID": "t-1",
                "measurementUUID": "m-1",
                "sequenceUUID": "s-1",
                "campaignUUID": "c-1",
                "device": "phone",
                "type": "ping",
                "params": {"destination": "8.8.8.8"}
            },
            {
                "type": "iperf3",
                "params": {"host": "iperf.example.org", "time": 5}
            },
            {
                "testUUID": "t-3",
                "type": "traceroute",
                "params": {}
            }
        ]);

        let inputs = parse_plan(&plan.to_string(), &config()).unwrap();
        assert_eq!(inputs.len(), 2);

        assert_eq!(inputs[0].test_uuid, "t-1");
        assert_eq!(inputs[0].campaign_uuid, "c-1");
        assert_eq!(inputs[0].kind(), ProbeKind::Ping);
        // config default merged in
        assert!(inputs[0].parameter.args().contains(&"-c".to_string()));

        assert_eq!(inputs[1].kind(), ProbeKind::Iperf3);
        assert!(uuid::Uuid::parse_str(&inputs[1].test_uuid).is_ok());
        assert!(inputs[1].sequence_uuid.is_empty());
    }

    #[test]
    fn test_parse_plan_rejects_invalid_entry() {
        let plan = json!([{"testUUID": "t-1", "type": "ping", "params": {}}]);
        assert!(parse_plan(&plan.to_string(), &config()).is_err());
    }

    #[test]
    fn test_parse_plan_rejects_path_like_test_ids() {
        for id in ["../../../tmp/x", "a/b", "..", "run\\1", "a b", "x.lp"] {
            let plan = json!([{
                "testUUID": id,
                "type": "ping",
                "params": {"destination": "8.8.8.8"}
            }]);
            assert!(
                parse_plan(&plan.to_string(), &config()).is_err(),
                "{:?} accepted",
                id
            );
        }

        assert!(validate_test_id("3f2a9c1e-0000-4000-8000-000000000001").is_ok());
        assert!(validate_test_id("campaign_7-run-2").is_ok());
        assert!(validate_test_id(&"a".repeat(MAX_TEST_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_params_lenient_types() {
        let map = json!({
            "a": "5",
            "b": 5,
            "c": "true",
            "d": 0.5,
            "e": "",
            "f": [1]
        });
        let map = map.as_object().unwrap();
        let params = Params::new(map);

        assert_eq!(params.integer("a").unwrap(), Some(5));
        assert_eq!(params.string("b").unwrap(), Some("5".to_string()));
        assert_eq!(params.boolean("c").unwrap(), Some(true));
        assert_eq!(params.float("d").unwrap(), Some(0.5));
        assert_eq!(params.string("e").unwrap(), None);
        assert_eq!(params.integer("missing").unwrap(), None);
        assert!(matches!(
            params.integer("f"),
            Err(ValidationError::WrongType { .. })
        ));
        assert!(params.integer("d").is_err());
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(1.0), "1");
        assert_eq!(format_number(0.2), "0.2");
        assert_eq!(format_number(10.0), "10");
    }
}
