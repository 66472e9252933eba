//! Protocol constants: measurement names, tag keys and probe defaults

/// Measurement name for iperf3 points
pub const MEASUREMENT_IPERF3: &str = "Iperf3";

/// Measurement name for ping points
pub const MEASUREMENT_PING: &str = "Ping";

/// Tag keys shared by every probe type
pub const TAG_TEST_UUID: &str = "testUUID";
pub const TAG_SEQUENCE_UUID: &str = "sequenceUUID";
pub const TAG_MEASUREMENT_UUID: &str = "measurementUUID";
pub const TAG_CAMPAIGN_UUID: &str = "campaignUUID";
pub const TAG_IPERF3_UUID: &str = "iperf3UUID";

/// iperf3 defaults used when a parameter is absent
pub const IPERF3_DEFAULT_PORT: u16 = 5201;
pub const IPERF3_DEFAULT_INTERVAL_S: f64 = 1.0;
pub const IPERF3_DEFAULT_TIME_S: u32 = 10;

/// Probe type directory names
pub const PROBE_DIR_PING: &str = "ping";
pub const PROBE_DIR_IPERF3: &str = "iperf3";

/// Output sub-directories under each probe type directory
pub const RAW_DIR: &str = "raw";
pub const LINE_PROTOCOL_DIR: &str = "lineprotocol";

/// Line protocol file extension
pub const LINE_PROTOCOL_EXT: &str = "lp";
