//! Run orchestration: launch a probe, stream its output, classify the result

mod launcher;
mod live;

#[cfg(test)]
pub use launcher::testing;
pub use launcher::{LaunchError, ProbeCommand, ProbeLauncher, ProbeProcess, TokioLauncher};
pub use live::LiveMetrics;

use crate::config::Config;
use crate::metrics::{MetricCalculator, MetricName, MetricSnapshot};
use crate::parameter::{ProbeKind, ProbeParameter, TestInput};
use crate::parser::{parser_for, OutputParser, ParseError};
use crate::pipeline::{EventBus, PipelineEvent};
use crate::storage::Database;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use protocol::ParsedEvent;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const REASON_CANCELLED: &str = "cancelled";

/// Slack on top of a probe's expected duration before it counts as hung
const DEFAULT_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Created,
    Running,
    Succeeded,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Created => "created",
            RunState::Running => "running",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(RunState::Created),
            "running" => Some(RunState::Running),
            "succeeded" => Some(RunState::Succeeded),
            "failed" => Some(RunState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed)
    }

    /// Forward-only: Created -> Running -> {Succeeded, Failed}, plus Created -> Failed
    pub fn can_transition_to(&self, next: RunState) -> bool {
        matches!(
            (self, next),
            (RunState::Created, RunState::Running)
                | (RunState::Created, RunState::Failed)
                | (RunState::Running, RunState::Succeeded)
                | (RunState::Running, RunState::Failed)
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("Illegal run state transition {from:?} -> {to:?}")]
pub struct StateError {
    pub from: RunState,
    pub to: RunState,
}

/// Everything known about one run
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub test_uuid: String,
    pub probe: ProbeKind,
    pub sequence_uuid: String,
    pub measurement_uuid: String,
    pub campaign_uuid: String,
    pub device: String,
    pub parameter: ProbeParameter,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    state: RunState,
    pub reason: Option<String>,
    events: Vec<ParsedEvent>,
    pub metrics: BTreeMap<MetricName, MetricSnapshot>,
    pub exit_code: Option<i32>,
}

impl RunRecord {
    pub fn new(input: &TestInput) -> Self {
        Self {
            test_uuid: input.test_uuid.clone(),
            probe: input.kind(),
            sequence_uuid: input.sequence_uuid.clone(),
            measurement_uuid: input.measurement_uuid.clone(),
            campaign_uuid: input.campaign_uuid.clone(),
            device: input.device.clone(),
            parameter: input.parameter.clone(),
            started_at: Utc::now(),
            finished_at: None,
            state: RunState::Created,
            reason: None,
            events: Vec::new(),
            metrics: MetricName::for_probe(input.kind())
                .into_iter()
                .map(|name| (name, MetricSnapshot::default()))
                .collect(),
            exit_code: None,
        }
    }

    /// Rebuild a record from storage without replaying transitions
    pub(crate) fn restore(mut self, state: RunState, events: Vec<ParsedEvent>) -> Self {
        self.state = state;
        self.events = events;
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn events(&self) -> &[ParsedEvent] {
        &self.events
    }

    pub fn transition(&mut self, to: RunState) -> Result<(), StateError> {
        if !self.state.can_transition_to(to) {
            return Err(StateError {
                from: self.state,
                to,
            });
        }
        self.state = to;
        if to.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), StateError> {
        self.transition(RunState::Failed)?;
        self.reason = Some(reason.into());
        Ok(())
    }

    pub fn push_event(&mut self, event: ParsedEvent) {
        self.events.push(event);
    }

    /// First probe-reported error, if any
    pub fn error_message(&self) -> Option<&str> {
        self.events.iter().find_map(|e| match e {
            ParsedEvent::Error { message } => Some(message.as_str()),
            _ => None,
        })
    }
}

/// What a finished run future resolves to
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub test_uuid: String,
    pub probe: ProbeKind,
    pub state: RunState,
    pub reason: Option<String>,
    pub exit_code: Option<i32>,
    pub events: usize,
    pub metrics: BTreeMap<MetricName, MetricSnapshot>,
}

impl From<&RunRecord> for RunOutcome {
    fn from(record: &RunRecord) -> Self {
        Self {
            test_uuid: record.test_uuid.clone(),
            probe: record.probe,
            state: record.state,
            reason: record.reason.clone(),
            exit_code: record.exit_code,
            events: record.events.len(),
            metrics: record.metrics.clone(),
        }
    }
}

/// Everything a run needs besides its input
#[derive(Clone)]
pub struct RunnerSettings {
    pub root_dir: PathBuf,
    pub ping_binary: String,
    pub iperf3_binary: String,
    /// Added to a probe's expected duration before it is considered hung
    pub grace: Duration,
}

impl RunnerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            root_dir: config.general.root_dir.clone(),
            ping_binary: config.general.ping_binary.clone(),
            iperf3_binary: config.general.iperf3_binary.clone(),
            grace: DEFAULT_GRACE,
        }
    }

    fn program(&self, kind: ProbeKind) -> &str {
        match kind {
            ProbeKind::Ping => &self.ping_binary,
            ProbeKind::Iperf3 => &self.iperf3_binary,
        }
    }
}

pub struct RunOrchestrator {
    settings: RunnerSettings,
    launcher: Arc<dyn ProbeLauncher>,
    db: Arc<Database>,
    bus: EventBus,
    live: LiveMetrics,
}

enum Interrupt {
    Cancelled,
    TimedOut(Duration),
}

impl RunOrchestrator {
    pub fn new(
        settings: RunnerSettings,
        launcher: Arc<dyn ProbeLauncher>,
        db: Arc<Database>,
        bus: EventBus,
    ) -> Self {
        Self {
            settings,
            launcher,
            db,
            bus,
            live: LiveMetrics::default(),
        }
    }

    /// Metrics of the runs currently executing
    pub fn live_metrics(&self) -> &LiveMetrics {
        &self.live
    }

    /// Drive one run to a terminal state and persist it
    ///
    /// Errors only come from storage; probe failures end up in the record.
    pub async fn execute(&self, input: TestInput, cancel: CancellationToken) -> Result<RunRecord> {
        let mut record = RunRecord::new(&input);
        self.db
            .insert_run(&record)
            .with_context(|| format!("Failed to create run {}", record.test_uuid))?;
        self.publish_state(&record);

        let paths = input.output_paths(&self.settings.root_dir);
        let command = ProbeCommand {
            program: self.settings.program(input.kind()).to_string(),
            args: input.parameter.args(),
        };
        info!("Run {} starting: {}", record.test_uuid, command);

        let launched = async {
            let raw = create_raw_file(&paths.raw).await?;
            if let Some(dir) = paths.line_protocol.parent() {
                tokio::fs::create_dir_all(dir).await?;
            }
            let process = self.launcher.launch(&command).await?;
            Ok::<_, LaunchError>((raw, process))
        };

        let launched = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(None),
            r = launched => r.map_err(Some),
        };

        let (mut raw, mut process) = match launched {
            Ok(ok) => ok,
            Err(e) => {
                let reason = match e {
                    Some(e) => {
                        error!("Run {} failed to launch: {}", record.test_uuid, e);
                        e.to_string()
                    }
                    None => REASON_CANCELLED.to_string(),
                };
                record.fail(reason)?;
                return self.finish(record).await;
            }
        };

        record.transition(RunState::Running)?;
        self.db.update_state(&record)?;
        self.publish_state(&record);

        let mut parser = parser_for(input.kind());
        let mut calculators = MetricName::for_probe(input.kind()).map(MetricCalculator::new);
        let _live = self.live.track(
            &record.test_uuid,
            calculators.iter().map(MetricCalculator::reader).collect(),
        );

        let limit = input
            .parameter
            .expected_duration()
            .map(|d| d + self.settings.grace);
        let watchdog = async {
            match limit {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(watchdog);

        let mut interrupt = None;
        let mut read_error = None;
        loop {
            let line = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    interrupt = Some(Interrupt::Cancelled);
                    break;
                }
                _ = &mut watchdog => {
                    interrupt = limit.map(Interrupt::TimedOut);
                    break;
                }
                line = process.next_line() => line,
            };

            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!("Run {}: error reading probe output: {}", record.test_uuid, e);
                    read_error = Some(e.to_string());
                    break;
                }
            };

            if let Err(e) = write_raw_line(&mut raw, &line).await {
                warn!("Run {}: failed to write raw output: {}", record.test_uuid, e);
            }

            match parser.parse_line(&line) {
                Ok(Some(event)) => {
                    self.apply_event(&mut record, &mut calculators, event)?;
                }
                Ok(None) => {}
                Err(e @ ParseError::Pattern { .. }) => debug!("Run {}: {}", record.test_uuid, e),
                Err(e) => warn!("Run {}: skipping record: {}", record.test_uuid, e),
            }

            if parser.is_finished() {
                debug!("Run {}: parser finished, no further output consumed", record.test_uuid);
                break;
            }
        }

        if let Err(e) = raw.flush().await {
            warn!("Run {}: failed to flush raw output: {}", record.test_uuid, e);
        }
        drop(raw);

        // nobody drains stdout any more, so a live child could block on a full pipe
        let exit = if interrupt.is_some() || parser.is_finished() || read_error.is_some() {
            if let Err(e) = process.kill().await {
                warn!("Run {}: failed to kill probe: {}", record.test_uuid, e);
            }
            None
        } else {
            let exit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    interrupt = Some(Interrupt::Cancelled);
                    None
                }
                _ = &mut watchdog => {
                    interrupt = limit.map(Interrupt::TimedOut);
                    None
                }
                exit = process.wait() => Some(exit),
            };
            if exit.is_none() {
                if let Err(e) = process.kill().await {
                    warn!("Run {}: failed to kill probe: {}", record.test_uuid, e);
                }
            }
            exit
        };
        drop(process);

        for calc in calculators.iter_mut() {
            calc.calc_all();
            record.metrics.insert(calc.name(), calc.snapshot());
        }

        let reason = match (interrupt, exit) {
            (Some(Interrupt::Cancelled), _) => Some(REASON_CANCELLED.to_string()),
            (Some(Interrupt::TimedOut(limit)), _) => {
                Some(format!("timed out after {}s", limit.as_secs()))
            }
            (None, _) if record.error_message().is_some() => {
                record.error_message().map(str::to_string)
            }
            (None, Some(Ok(exit))) => {
                record.exit_code = exit.code;
                match exit.code {
                    Some(0) => None,
                    Some(code) if exit.stderr.is_empty() => Some(format!("exit code {}", code)),
                    Some(code) => Some(format!("exit code {}: {}", code, exit.stderr)),
                    None => Some("terminated by signal".to_string()),
                }
            }
            (None, Some(Err(e))) => Some(format!("failed to wait for probe: {}", e)),
            (None, None) => Some(match read_error {
                Some(e) => format!("output read failed: {}", e),
                None => "exit status unavailable".to_string(),
            }),
        };

        match reason {
            None => record.transition(RunState::Succeeded)?,
            Some(reason) => record.fail(reason)?,
        }
        self.finish(record).await
    }

    fn apply_event(
        &self,
        record: &mut RunRecord,
        calculators: &mut [MetricCalculator; 2],
        event: ParsedEvent,
    ) -> Result<()> {
        let mut touched = Vec::with_capacity(2);
        match &event {
            // a long-lived server announces every client test with a fresh start
            ParsedEvent::Start(_)
                if record.events().iter().any(|e| matches!(e, ParsedEvent::Start(_))) =>
            {
                info!("Run {}: new test started, resetting metrics", record.test_uuid);
                for calc in calculators.iter_mut() {
                    calc.reset_metric();
                }
                touched.extend([0, 1]);
            }
            ParsedEvent::Interval(interval) => {
                // sending side feeds upload, receiving side download
                for sum in interval.sums() {
                    let idx = if sum.sender { 0 } else { 1 };
                    calculators[idx].update(sum.bits_per_second);
                    touched.push(idx);
                }
                for calc in calculators.iter_mut() {
                    calc.calc_all();
                }
            }
            ParsedEvent::Rtt(rtt) => {
                calculators[0].update(rtt.rtt_ms);
                touched.push(0);
            }
            ParsedEvent::PacketLoss(loss) => {
                calculators[1].update(loss.loss_percent);
                touched.push(1);
            }
            ParsedEvent::Error { message } => {
                warn!("Run {}: probe reported error: {}", record.test_uuid, message);
            }
            _ => {}
        }

        let seq = record.events().len();
        self.db
            .append_event(&record.test_uuid, seq, &event)
            .with_context(|| format!("Failed to persist event for run {}", record.test_uuid))?;
        record.push_event(event);

        touched.dedup();
        for idx in touched {
            let calc = &calculators[idx];
            record.metrics.insert(calc.name(), calc.snapshot());
            self.bus.publish(PipelineEvent::MetricUpdated {
                test_uuid: record.test_uuid.clone(),
                name: calc.name(),
                snapshot: calc.snapshot(),
            });
        }
        Ok(())
    }

    /// Persist the terminal record before anyone downstream hears about it
    async fn finish(&self, record: RunRecord) -> Result<RunRecord> {
        self.db
            .finish_run(&record)
            .with_context(|| format!("Failed to persist final state of run {}", record.test_uuid))?;

        match record.state() {
            RunState::Succeeded => info!("Run {} succeeded", record.test_uuid),
            _ => warn!(
                "Run {} failed: {}",
                record.test_uuid,
                record.reason.as_deref().unwrap_or("unknown")
            ),
        }
        self.publish_state(&record);
        Ok(record)
    }

    fn publish_state(&self, record: &RunRecord) {
        self.bus.publish(PipelineEvent::RunStateChanged {
            test_uuid: record.test_uuid.clone(),
            probe: record.probe,
            state: record.state(),
            reason: record.reason.clone(),
        });
    }
}

async fn create_raw_file(path: &std::path::Path) -> std::io::Result<BufWriter<File>> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    Ok(BufWriter::new(File::create(path).await?))
}

async fn write_raw_line(raw: &mut BufWriter<File>, line: &str) -> std::io::Result<()> {
    raw.write_all(line.as_bytes()).await?;
    raw.write_all(b"\n").await?;
    raw.flush().await
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedLauncher;
    use super::*;
    use crate::parameter::{Iperf3Parameter, PingParameter};
    use crate::storage::Completion;
    use tempfile::TempDir;

    const PING_LINES: &[&str] = &[
        "PING 8.8.8.8 (8.8.8.8) 56(84) bytes of data.",
        "[1697040000.100000] 64 bytes from 8.8.8.8: icmp_seq=1 ttl=64 time=23.4 ms",
        "[1697040001.100000] 64 bytes from 8.8.8.8: icmp_seq=2 ttl=64 time=20.0 ms",
        "From 8.8.8.8 icmp_seq=3 Destination Host Unreachable",
        "",
        "--- 8.8.8.8 ping statistics ---",
        "5 packets transmitted, 4 received, 20% packet loss, time 4021ms",
    ];

    struct Harness {
        _dir: TempDir,
        root: PathBuf,
        db: Arc<Database>,
        bus: EventBus,
    }

    impl Harness {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let db = Arc::new(Database::in_memory().unwrap());
            db.initialize().unwrap();
            Self {
                root: dir.path().join("omnt"),
                _dir: dir,
                db,
                bus: EventBus::new(64),
            }
        }

        fn orchestrator(&self, launcher: ScriptedLauncher) -> RunOrchestrator {
            RunOrchestrator::new(
                RunnerSettings {
                    root_dir: self.root.clone(),
                    ping_binary: "ping".to_string(),
                    iperf3_binary: "iperf3".to_string(),
                    grace: Duration::from_secs(30),
                },
                Arc::new(launcher),
                self.db.clone(),
                self.bus.clone(),
            )
        }
    }

    fn ping_input() -> TestInput {
        TestInput::new(ProbeParameter::Ping(
            PingParameter::new("8.8.8.8").unwrap().with_count(Some(5)),
        ))
    }

    #[test]
    fn test_state_machine_is_forward_only() {
        let mut record = RunRecord::new(&ping_input());
        assert_eq!(record.state(), RunState::Created);
        record.transition(RunState::Running).unwrap();
        assert_eq!(
            record.transition(RunState::Created),
            Err(StateError {
                from: RunState::Running,
                to: RunState::Created
            })
        );
        record.transition(RunState::Succeeded).unwrap();
        assert!(record.finished_at.is_some());
        assert!(record.transition(RunState::Failed).is_err());
        assert!(record.transition(RunState::Running).is_err());
    }

    #[test]
    fn test_created_can_fail_directly() {
        let mut record = RunRecord::new(&ping_input());
        record.fail("launch failed").unwrap();
        assert_eq!(record.state(), RunState::Failed);
        assert!(record.fail("again").is_err());
        assert_eq!(record.reason.as_deref(), Some("launch failed"));
    }

    #[tokio::test]
    async fn test_successful_ping_run() {
        let h = Harness::new();
        let launcher = ScriptedLauncher::new(PING_LINES, 0);
        let commands = launcher.commands.clone();
        let orchestrator = h.orchestrator(launcher);
        let mut events = h.bus.subscribe();

        let input = ping_input();
        let record = orchestrator
            .execute(input.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(record.state(), RunState::Succeeded);
        assert_eq!(record.exit_code, Some(0));
        assert!(record.reason.is_none());

        let kinds: Vec<&str> = record.events().iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec!["unknown", "rtt", "rtt", "unreachable", "unknown", "packet_loss"]
        );

        let rtt = record.metrics[&MetricName::Rtt];
        assert_eq!(rtt.count, 2);
        assert_eq!(rtt.min, Some(20.0));
        assert_eq!(rtt.max, Some(23.4));
        assert!((rtt.median.unwrap() - 21.7).abs() < 1e-9);
        assert_eq!(record.metrics[&MetricName::PacketLoss].last, Some(20.0));

        let command = commands.lock().unwrap()[0].clone();
        assert_eq!(command.program, "ping");
        assert_eq!(command.args, vec!["-c", "5", "-D", "8.8.8.8"]);

        // persisted before anyone downstream could claim it
        let stored = h.db.load_run(&input.test_uuid).unwrap().unwrap();
        assert_eq!(stored.state(), RunState::Succeeded);
        assert_eq!(stored.events().len(), 6);
        assert_eq!(
            h.db.completion(&input.test_uuid).unwrap(),
            Some(Completion::Pending)
        );

        // raw output teed to disk
        let raw = std::fs::read_to_string(input.output_paths(&h.root).raw).unwrap();
        assert_eq!(raw.lines().count(), PING_LINES.len());

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let PipelineEvent::RunStateChanged { state, .. } = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![RunState::Created, RunState::Running, RunState::Succeeded]
        );
    }

    #[tokio::test]
    async fn test_iperf3_error_event_fails_run() {
        let h = Harness::new();
        let launcher = ScriptedLauncher::new(
            &[
                r#"{"event":"error","data":"test start error"}"#,
                r#"{"event":"interval","data":{"streams":[],"sum":{"start":0,"end":1,"seconds":1,"bytes":10,"bits_per_second":80,"sender":true}}}"#,
            ],
            0,
        );
        let killed = launcher.killed.clone();
        let orchestrator = h.orchestrator(launcher);

        let input = TestInput::new(ProbeParameter::Iperf3(
            Iperf3Parameter::client("iperf.example.org").unwrap(),
        ));
        let record = orchestrator
            .execute(input, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(record.state(), RunState::Failed);
        assert_eq!(record.reason.as_deref(), Some("test start error"));
        // nothing consumed after the error
        assert_eq!(record.events().len(), 1);
        assert_eq!(record.metrics[&MetricName::Upload].count, 0);
        assert!(killed.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_iperf3_intervals_feed_both_directions() {
        let h = Harness::new();
        let launcher = ScriptedLauncher::new(
            &[
                r#"{"event":"interval","data":{"streams":[],"sum":{"start":0,"end":1,"seconds":1,"bytes":12500000,"bits_per_second":100000000,"sender":true}}}"#,
                r#"{"event":"interval","data":{"streams":[],"sum":{"start":1,"end":2,"seconds":1,"bytes":6250000,"bits_per_second":50000000,"sender":false}}}"#,
                r#"{"event":"interval","data":{"streams":[],"sum":{"start":2,"end":3,"seconds":1,"bytes":1250000,"bits_per_second":10000000,"sender":true},"sum_bidir_reverse":{"start":2,"end":3,"seconds":1,"bytes":2500000,"bits_per_second":20000000,"sender":false}}}"#,
                r#"{"event":"end","data":{"streams":[]}}"#,
            ],
            0,
        );
        let orchestrator = h.orchestrator(launcher);
        let mut events = h.bus.subscribe();

        let input = TestInput::new(ProbeParameter::Iperf3(
            Iperf3Parameter::client("iperf.example.org").unwrap(),
        ));
        let record = orchestrator
            .execute(input, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(record.state(), RunState::Succeeded);
        assert_eq!(record.events().len(), 3);

        let upload = record.metrics[&MetricName::Upload];
        assert_eq!(upload.count, 2);
        assert_eq!(upload.min, Some(10_000_000.0));
        assert_eq!(upload.max, Some(100_000_000.0));
        assert_eq!(upload.last, Some(10_000_000.0));

        let download = record.metrics[&MetricName::Download];
        assert_eq!(download.count, 2);
        assert_eq!(download.min, Some(20_000_000.0));
        assert_eq!(download.max, Some(50_000_000.0));
        assert_eq!(download.last, Some(20_000_000.0));

        let mut updates = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let PipelineEvent::MetricUpdated { name, .. } = event {
                updates.push(name);
            }
        }
        assert_eq!(
            updates,
            vec![
                MetricName::Upload,
                MetricName::Download,
                MetricName::Upload,
                MetricName::Download
            ]
        );
    }

    #[tokio::test]
    async fn test_server_resets_metrics_per_client_test() {
        let h = Harness::new();
        let start = r#"{"event":"start","data":{"version":"iperf 3.16","timestamp":{"timesecs":1697040000}}}"#;
        let launcher = ScriptedLauncher::new(
            &[
                start,
                r#"{"event":"interval","data":{"streams":[],"sum":{"start":0,"end":1,"seconds":1,"bytes":12500000,"bits_per_second":100000000,"sender":false}}}"#,
                r#"{"event":"end","data":{"streams":[]}}"#,
                start,
                r#"{"event":"interval","data":{"streams":[],"sum":{"start":0,"end":1,"seconds":1,"bytes":3750000,"bits_per_second":30000000,"sender":false}}}"#,
                r#"{"event":"end","data":{"streams":[]}}"#,
            ],
            0,
        );
        let orchestrator = h.orchestrator(launcher);

        let input = TestInput::new(ProbeParameter::Iperf3(Iperf3Parameter::server()));
        let record = orchestrator
            .execute(input, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(record.state(), RunState::Succeeded);
        assert_eq!(record.events().len(), 4);
        let download = record.metrics[&MetricName::Download];
        assert_eq!(download.count, 1);
        assert_eq!(download.max, Some(30_000_000.0));
        assert_eq!(record.metrics[&MetricName::Upload].count, 0);
    }

    #[tokio::test]
    async fn test_invalid_utf8_output_is_skipped() {
        let h = Harness::new();
        let mut output = Vec::new();
        output.extend_from_slice(b"PING 8.8.8.8 (8.8.8.8) 56(84) bytes of data.\n");
        output.extend_from_slice(b"\xff\xfe garbage\n");
        output.extend_from_slice(
            b"[1697040000.100000] 64 bytes from 8.8.8.8: icmp_seq=1 ttl=64 time=23.4 ms\n",
        );
        output.extend_from_slice(b"1 packets transmitted, 1 received, 0% packet loss, time 0ms\n");
        let orchestrator = h.orchestrator(ScriptedLauncher::from_bytes(&output, 0));

        let record = orchestrator
            .execute(ping_input(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(record.state(), RunState::Succeeded);
        let kinds: Vec<&str> = record.events().iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["unknown", "unknown", "rtt", "packet_loss"]);
        assert_eq!(record.metrics[&MetricName::Rtt].count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_exit_times_out() {
        let h = Harness::new();
        let launcher = ScriptedLauncher::new(&[PING_LINES[0]], 0).exit_hangs();
        let killed = launcher.killed.clone();
        let orchestrator = h.orchestrator(launcher);

        let input = TestInput::new(ProbeParameter::Ping(
            PingParameter::new("8.8.8.8").unwrap().with_deadline(Some(5)),
        ));
        let record = orchestrator
            .execute(input, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(record.state(), RunState::Failed);
        assert_eq!(record.reason.as_deref(), Some("timed out after 35s"));
        assert!(killed.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_non_zero_exit_fails_with_stderr() {
        let h = Harness::new();
        let launcher = ScriptedLauncher::new(&["PING 10.0.0.1 (10.0.0.1) 56(84) bytes of data."], 2)
            .with_stderr("ping: connect: Network is unreachable");
        let orchestrator = h.orchestrator(launcher);

        let record = orchestrator
            .execute(ping_input(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(record.state(), RunState::Failed);
        assert_eq!(record.exit_code, Some(2));
        assert_eq!(
            record.reason.as_deref(),
            Some("exit code 2: ping: connect: Network is unreachable")
        );
    }

    #[tokio::test]
    async fn test_launch_failure_marks_failed() {
        let h = Harness::new();
        let orchestrator = h.orchestrator(ScriptedLauncher::new(&[], 0).failing());

        let input = ping_input();
        let record = orchestrator
            .execute(input.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(record.state(), RunState::Failed);
        assert!(record.reason.unwrap().contains("not found"));
        let stored = h.db.load_run(&input.test_uuid).unwrap().unwrap();
        assert_eq!(stored.state(), RunState::Failed);
    }

    #[tokio::test]
    async fn test_cancellation_kills_process() {
        let h = Harness::new();
        let launcher = ScriptedLauncher::new(&[PING_LINES[0], PING_LINES[1]], 0).hanging();
        let killed = launcher.killed.clone();
        let orchestrator = Arc::new(h.orchestrator(launcher));

        let cancel = CancellationToken::new();
        let task = {
            let orchestrator = orchestrator.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { orchestrator.execute(ping_input(), cancel).await })
        };

        // let the run consume its two lines and block on the third
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        let live = orchestrator.live_metrics().snapshot();
        assert_eq!(live.len(), 2);
        assert_eq!(live[0].1, MetricName::Rtt);
        assert_eq!(live[0].2.last, Some(23.4));
        cancel.cancel();

        let record = task.await.unwrap().unwrap();
        assert_eq!(record.state(), RunState::Failed);
        assert_eq!(record.reason.as_deref(), Some(REASON_CANCELLED));
        assert!(killed.load(std::sync::atomic::Ordering::SeqCst));
        assert!(orchestrator.live_metrics().snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_run_times_out() {
        let h = Harness::new();
        let launcher = ScriptedLauncher::new(&[], 0).hanging();
        let killed = launcher.killed.clone();
        let orchestrator = h.orchestrator(launcher);

        let input = TestInput::new(ProbeParameter::Ping(
            PingParameter::new("8.8.8.8").unwrap().with_deadline(Some(5)),
        ));
        let record = orchestrator
            .execute(input, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(record.state(), RunState::Failed);
        assert_eq!(record.reason.as_deref(), Some("timed out after 35s"));
        assert!(killed.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_duplicate_test_uuid_rejected() {
        let h = Harness::new();
        let orchestrator = h.orchestrator(ScriptedLauncher::new(PING_LINES, 0));
        let input = ping_input();

        orchestrator
            .execute(input.clone(), CancellationToken::new())
            .await
            .unwrap();
        assert!(orchestrator
            .execute(input, CancellationToken::new())
            .await
            .is_err());
    }
}
