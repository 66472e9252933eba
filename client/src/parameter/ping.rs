//! ping parameters

use super::{format_number, Params, ValidationError};
use serde_json::{json, Map, Value};
use std::time::Duration;

pub const DESTINATION: &str = "destination";
pub const COUNT: &str = "count";
pub const TIMEOUT: &str = "timeout";
pub const PACKET_SIZE: &str = "packetSize";
pub const INTERVAL: &str = "interval";
pub const DEADLINE: &str = "deadline";

#[derive(Debug, Clone, PartialEq)]
pub struct PingParameter {
    destination: String,
    count: Option<u32>,
    /// Per-reply wait, seconds
    timeout: Option<u32>,
    packet_size: Option<u32>,
    /// Seconds between echo requests
    interval: Option<f64>,
    /// Overall run limit, seconds
    deadline: Option<u32>,
}

impl PingParameter {
    pub fn new(destination: impl Into<String>) -> Result<Self, ValidationError> {
        let destination = destination.into();
        if destination.trim().is_empty() {
            return Err(ValidationError::MissingField(DESTINATION));
        }
        Ok(Self {
            destination: destination.trim().to_string(),
            count: None,
            timeout: None,
            packet_size: None,
            interval: None,
            deadline: None,
        })
    }

    pub fn from_map(map: &Map<String, Value>) -> Result<Self, ValidationError> {
        let params = Params::new(map);
        let destination = params
            .string(DESTINATION)?
            .ok_or(ValidationError::MissingField(DESTINATION))?;

        Ok(Self::new(destination)?
            .with_count(params.unsigned(COUNT)?)
            .with_timeout(params.unsigned(TIMEOUT)?)
            .with_packet_size(params.unsigned(PACKET_SIZE)?)
            .with_interval(params.float(INTERVAL)?)
            .with_deadline(params.unsigned(DEADLINE)?))
    }

    pub fn with_count(mut self, count: Option<u32>) -> Self {
        self.count = count;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<u32>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_packet_size(mut self, packet_size: Option<u32>) -> Self {
        self.packet_size = packet_size;
        self
    }

    pub fn with_interval(mut self, interval: Option<f64>) -> Self {
        self.interval = interval.filter(|v| v.is_finite() && *v >= 0.0);
        self
    }

    pub fn with_deadline(mut self, deadline: Option<u32>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn count(&self) -> Option<u32> {
        self.count
    }

    pub fn interval(&self) -> Option<f64> {
        self.interval
    }

    /// `-c -W -s -i -w`, each only when set, then `-D` and the destination last
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(count) = self.count {
            args.push("-c".to_string());
            args.push(count.to_string());
        }
        if let Some(timeout) = self.timeout {
            args.push("-W".to_string());
            args.push(timeout.to_string());
        }
        if let Some(size) = self.packet_size {
            args.push("-s".to_string());
            args.push(size.to_string());
        }
        if let Some(interval) = self.interval {
            args.push("-i".to_string());
            args.push(format_number(interval));
        }
        if let Some(deadline) = self.deadline {
            args.push("-w".to_string());
            args.push(deadline.to_string());
        }
        args.push("-D".to_string());
        args.push(self.destination.clone());
        args
    }

    pub fn expected_duration(&self) -> Option<Duration> {
        if let Some(deadline) = self.deadline.filter(|d| *d > 0) {
            return Some(Duration::from_secs(deadline as u64));
        }
        let count = self.count.filter(|c| *c > 0)?;
        let interval = self.interval.unwrap_or(1.0);
        let wait = self.timeout.unwrap_or(10) as f64;
        Some(Duration::from_secs_f64(count as f64 * interval + wait))
    }

    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert(DESTINATION.into(), json!(self.destination));
        if let Some(v) = self.count {
            map.insert(COUNT.into(), json!(v));
        }
        if let Some(v) = self.timeout {
            map.insert(TIMEOUT.into(), json!(v));
        }
        if let Some(v) = self.packet_size {
            map.insert(PACKET_SIZE.into(), json!(v));
        }
        if let Some(v) = self.interval {
            map.insert(INTERVAL.into(), json!(v));
        }
        if let Some(v) = self.deadline {
            map.insert(DEADLINE.into(), json!(v));
        }
        Value::Object(map)
    }
}
