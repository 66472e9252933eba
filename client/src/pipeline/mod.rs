//! Wiring between runs, the encoder and the uploader
//!
//! Each submitted test runs in its own task. Finished runs are handed to a
//! single encode stage over an mpsc channel by test UUID; the stage claims
//! the run in the database first, so a run is encoded at most once no matter
//! how often it is enqueued. Encoded batches go to the upload adapter.

use crate::config::Config;
use crate::encoder::LineProtocolEncoder;
use crate::metrics::{MetricName, MetricSnapshot};
use crate::parameter::{OutputPaths, ProbeKind, TestInput};
use crate::runner::{ProbeLauncher, RunOrchestrator, RunOutcome, RunState, RunnerSettings};
use crate::storage::{Completion, Database};
use crate::upload::{Sink, UploadAdapter, UploadStatus};
use anyhow::Result;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const ENCODE_QUEUE: usize = 256;

/// Everything observers can hear about
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    RunStateChanged {
        test_uuid: String,
        probe: ProbeKind,
        state: RunState,
        reason: Option<String>,
    },
    MetricUpdated {
        test_uuid: String,
        name: MetricName,
        snapshot: MetricSnapshot,
    },
    Encoded {
        test_uuid: String,
        points: usize,
        path: PathBuf,
    },
    EncodingFailed {
        test_uuid: String,
        error: String,
    },
    Upload(UploadStatus),
}

/// Broadcast fan-out; slow subscribers lag rather than block publishers
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: PipelineEvent) {
        // no subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }
}

pub struct PipelineDeps {
    pub config: Config,
    pub db: Arc<Database>,
    pub launcher: Arc<dyn ProbeLauncher>,
    /// Upload is disabled without a sink
    pub sink: Option<Arc<dyn Sink>>,
}

type Registry = Arc<RwLock<HashMap<String, CancellationToken>>>;

pub struct Pipeline {
    orchestrator: Arc<RunOrchestrator>,
    db: Arc<Database>,
    bus: EventBus,
    runs: Registry,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
    encode_tx: mpsc::Sender<String>,
    encode_task: JoinHandle<()>,
    upload: Option<UploadHandle>,
}

struct UploadHandle {
    adapter: Arc<UploadAdapter>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Pipeline {
    /// Recover from any previous crash, then start the encode and upload stages
    pub async fn start(deps: PipelineDeps) -> Result<Self> {
        let PipelineDeps {
            config,
            db,
            launcher,
            sink,
        } = deps;

        db.release_stale_claims()?;
        db.fail_interrupted_runs()?;

        let bus = EventBus::new(1024);

        let upload = sink.map(|sink| {
            let adapter = Arc::new(UploadAdapter::new(sink, &config.upload, bus.clone()));
            let cancel = CancellationToken::new();
            let task = {
                let adapter = adapter.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { adapter.run(cancel).await })
            };
            UploadHandle {
                adapter,
                cancel,
                task,
            }
        });

        let (encode_tx, encode_rx) = mpsc::channel(ENCODE_QUEUE);
        let stage = EncodeStage {
            db: db.clone(),
            encoder: LineProtocolEncoder::new(config.tags.clone()),
            root_dir: config.general.root_dir.clone(),
            bus: bus.clone(),
            upload: upload.as_ref().map(|u| u.adapter.clone()),
        };
        let encode_task = tokio::spawn(stage.run(encode_rx));

        let orchestrator = Arc::new(RunOrchestrator::new(
            RunnerSettings::from_config(&config),
            launcher,
            db.clone(),
            bus.clone(),
        ));

        let pipeline = Self {
            orchestrator,
            db,
            bus,
            runs: Arc::new(RwLock::new(HashMap::new())),
            permits: Arc::new(Semaphore::new(config.general.max_concurrent_runs.max(1))),
            shutdown: CancellationToken::new(),
            encode_tx,
            encode_task,
            upload,
        };

        let resumed = pipeline.resume().await?;
        if resumed > 0 {
            info!("Re-enqueued {} runs awaiting encoding", resumed);
        }
        Ok(pipeline)
    }

    /// Enqueue every terminal run that has not been encoded yet
    pub async fn resume(&self) -> Result<usize> {
        let pending = self.db.pending_completions()?;
        let count = pending.len();
        for test_uuid in pending {
            if self.encode_tx.send(test_uuid).await.is_err() {
                warn!("Encode stage is gone, cannot resume");
                break;
            }
        }
        Ok(count)
    }

    /// Start a run in its own task
    ///
    /// A test id that is already in flight is refused without touching the running one.
    pub fn submit(&self, input: TestInput) -> JoinHandle<Result<RunOutcome>> {
        let token = self.shutdown.child_token();
        let test_uuid = input.test_uuid.clone();
        {
            let mut runs = write_registry(&self.runs);
            if runs.contains_key(&test_uuid) {
                warn!("Run {} is already in flight, refusing duplicate", test_uuid);
                return tokio::spawn(async move {
                    Err(anyhow::anyhow!("Run {} is already in flight", test_uuid))
                });
            }
            runs.insert(test_uuid.clone(), token.clone());
        }

        let orchestrator = self.orchestrator.clone();
        let runs = self.runs.clone();
        let permits = self.permits.clone();
        let encode_tx = self.encode_tx.clone();

        tokio::spawn(async move {
            // a run cancelled while queued still goes through execute and ends as cancelled
            let _permit = tokio::select! {
                _ = token.cancelled() => None,
                permit = permits.acquire_owned() => permit.ok(),
            };

            let result = orchestrator.execute(input, token).await;
            write_registry(&runs).remove(&test_uuid);

            let record = result?;
            if encode_tx.send(test_uuid.clone()).await.is_err() {
                warn!("Encode stage closed before run {} could be enqueued", test_uuid);
            }
            Ok(RunOutcome::from(&record))
        })
    }

    /// Cancel an in-flight run; false if it is unknown or already finished
    pub fn cancel(&self, test_uuid: &str) -> bool {
        let runs = self.runs.read().unwrap_or_else(|e| e.into_inner());
        match runs.get(test_uuid) {
            Some(token) => {
                info!("Cancelling run {}", test_uuid);
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every in-flight run and anything submitted afterwards
    pub fn cancel_all(&self) {
        let ids: Vec<String> = self
            .runs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        for test_uuid in ids {
            self.cancel(&test_uuid);
        }
        self.shutdown.cancel();
    }

    pub fn in_flight(&self) -> usize {
        self.runs.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn events(&self) -> broadcast::Receiver<PipelineEvent> {
        self.bus.subscribe()
    }

    /// Latest metrics of every run still executing
    pub fn live_metrics(&self) -> Vec<(String, MetricName, MetricSnapshot)> {
        self.orchestrator.live_metrics().snapshot()
    }

    /// Queue points that did not come from a run, e.g. existing `.lp` files
    ///
    /// Returns false when upload is disabled.
    pub fn upload(&self, points: Vec<protocol::LineProtocolPoint>) -> bool {
        match &self.upload {
            Some(upload) => {
                upload.adapter.submit(points);
                true
            }
            None => false,
        }
    }

    /// Cancel remaining runs, finish encoding, then give uploads `drain_timeout`
    pub async fn shutdown(self, drain_timeout: Duration) {
        self.shutdown.cancel();
        drop(self.encode_tx);
        if let Err(e) = self.encode_task.await {
            error!("Encode stage panicked: {}", e);
        }

        if let Some(upload) = self.upload {
            if !upload.adapter.drain(drain_timeout).await {
                warn!(
                    "Upload drain timed out with {} batches still buffered",
                    upload.adapter.buffered()
                );
            }
            upload.cancel.cancel();
            if let Err(e) = upload.task.await {
                error!("Upload task panicked: {}", e);
            }
        }
        info!("Pipeline stopped");
    }
}

fn write_registry(
    runs: &Registry,
) -> std::sync::RwLockWriteGuard<'_, HashMap<String, CancellationToken>> {
    runs.write().unwrap_or_else(|e| e.into_inner())
}

struct EncodeStage {
    db: Arc<Database>,
    encoder: LineProtocolEncoder,
    root_dir: PathBuf,
    bus: EventBus,
    upload: Option<Arc<UploadAdapter>>,
}

impl EncodeStage {
    async fn run(self, mut rx: mpsc::Receiver<String>) {
        debug!("Encode stage started");
        while let Some(test_uuid) = rx.recv().await {
            if let Err(e) = self.encode(&test_uuid).await {
                error!("Failed to encode run {}: {:#}", test_uuid, e);
            }
        }
        debug!("Encode stage stopped");
    }

    async fn encode(&self, test_uuid: &str) -> Result<()> {
        if !self.db.claim_encoding(test_uuid)? {
            debug!("Run {} already claimed or not finished, skipping", test_uuid);
            return Ok(());
        }

        let record = match self.db.load_run(test_uuid) {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!("Claimed run {} vanished", test_uuid);
                return Ok(());
            }
            Err(e) => {
                self.db.mark_completion(test_uuid, Completion::Failed)?;
                return Err(e);
            }
        };

        let path = OutputPaths::new(&self.root_dir, record.probe, test_uuid).line_protocol;
        match self.encoder.write(&record, &path).await {
            Ok(encoded) => {
                self.db.mark_completion(test_uuid, Completion::Encoded)?;
                if encoded.dropped > 0 {
                    warn!("Run {}: dropped {} invalid points", test_uuid, encoded.dropped);
                }
                self.bus.publish(PipelineEvent::Encoded {
                    test_uuid: test_uuid.to_string(),
                    points: encoded.points.len(),
                    path,
                });
                if let Some(upload) = &self.upload {
                    upload.submit(encoded.points);
                }
            }
            Err(e) => {
                warn!("Encoding run {} failed: {}", test_uuid, e);
                self.db.mark_completion(test_uuid, Completion::Failed)?;
                self.bus.publish(PipelineEvent::EncodingFailed {
                    test_uuid: test_uuid.to_string(),
                    error: e.to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameter::{PingParameter, ProbeParameter};
    use crate::parser::{parser_for, OutputParser};
    use crate::runner::testing::ScriptedLauncher;
    use crate::runner::RunRecord;
    use crate::upload::testing::ScriptedSink;
    use tempfile::TempDir;

    const PING_LINES: &[&str] = &[
        "PING 8.8.8.8 (8.8.8.8) 56(84) bytes of data.",
        "[1697040000.100000] 64 bytes from 8.8.8.8: icmp_seq=1 ttl=64 time=23.4 ms",
        "[1697040001.100000] 64 bytes from 8.8.8.8: icmp_seq=2 ttl=64 time=20.0 ms",
        "2 packets transmitted, 2 received, 0% packet loss, time 1001ms",
    ];

    fn config(dir: &TempDir) -> Config {
        Config::from_toml(&format!(
            "[general]\nroot_dir = {:?}\ndatabase_path = \"unused.db\"\n\n[tags]\ndevice = \"lab-phone\"\n",
            dir.path().join("omnt").display().to_string()
        ))
        .unwrap()
    }

    fn db() -> Arc<Database> {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        Arc::new(db)
    }

    fn ping_input() -> TestInput {
        TestInput::new(ProbeParameter::Ping(
            PingParameter::new("8.8.8.8").unwrap().with_count(Some(2)),
        ))
    }

    async fn wait_for<F>(rx: &mut broadcast::Receiver<PipelineEvent>, mut pred: F) -> PipelineEvent
    where
        F: FnMut(&PipelineEvent) -> bool,
    {
        loop {
            let event = rx.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_run_is_encoded_and_uploaded() {
        let dir = TempDir::new().unwrap();
        let db = db();
        let sink = Arc::new(ScriptedSink::up());
        let pipeline = Pipeline::start(PipelineDeps {
            config: config(&dir),
            db: db.clone(),
            launcher: Arc::new(ScriptedLauncher::new(PING_LINES, 0)),
            sink: Some(sink.clone()),
        })
        .await
        .unwrap();
        let mut rx = pipeline.events();

        let input = ping_input();
        let outcome = pipeline.submit(input.clone()).await.unwrap().unwrap();
        assert_eq!(outcome.state, RunState::Succeeded);
        assert_eq!(outcome.events, 4);
        assert_eq!(pipeline.in_flight(), 0);

        let PipelineEvent::Encoded { points, path, .. } =
            wait_for(&mut rx, |e| matches!(e, PipelineEvent::Encoded { .. })).await
        else {
            unreachable!()
        };
        assert_eq!(points, 3);
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written.lines().count(), 3);
        assert!(written.contains("device=lab-phone"));

        wait_for(&mut rx, |e| {
            matches!(e, PipelineEvent::Upload(UploadStatus::Delivered { points: 3 }))
        })
        .await;
        assert_eq!(sink.delivered(), 1);
        assert_eq!(
            db.completion(&input.test_uuid).unwrap(),
            Some(Completion::Encoded)
        );

        pipeline.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_failed_run_encoding_does_not_touch_state() {
        let dir = TempDir::new().unwrap();
        let db = db();
        let pipeline = Pipeline::start(PipelineDeps {
            config: config(&dir),
            db: db.clone(),
            launcher: Arc::new(ScriptedLauncher::new(&[], 0).failing()),
            sink: None,
        })
        .await
        .unwrap();
        let mut rx = pipeline.events();

        let input = ping_input();
        let outcome = pipeline.submit(input.clone()).await.unwrap().unwrap();
        assert_eq!(outcome.state, RunState::Failed);

        wait_for(&mut rx, |e| matches!(e, PipelineEvent::EncodingFailed { .. })).await;
        assert_eq!(
            db.completion(&input.test_uuid).unwrap(),
            Some(Completion::Failed)
        );
        let stored = db.load_run(&input.test_uuid).unwrap().unwrap();
        assert_eq!(stored.state(), RunState::Failed);
        assert!(!pipeline.upload(Vec::new()));

        pipeline.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_cancel_in_flight_run() {
        let dir = TempDir::new().unwrap();
        let launcher = ScriptedLauncher::new(&[PING_LINES[0]], 0).hanging();
        let killed = launcher.killed.clone();
        let pipeline = Pipeline::start(PipelineDeps {
            config: config(&dir),
            db: db(),
            launcher: Arc::new(launcher),
            sink: None,
        })
        .await
        .unwrap();
        let mut rx = pipeline.events();

        let input = ping_input();
        let handle = pipeline.submit(input.clone());
        wait_for(&mut rx, |e| {
            matches!(e, PipelineEvent::RunStateChanged { state: RunState::Running, .. })
        })
        .await;

        assert!(!pipeline.cancel("no-such-run"));
        assert!(pipeline.cancel(&input.test_uuid));

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.state, RunState::Failed);
        assert_eq!(outcome.reason.as_deref(), Some("cancelled"));
        assert!(killed.load(std::sync::atomic::Ordering::SeqCst));
        assert!(!pipeline.cancel(&input.test_uuid));

        pipeline.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_duplicate_submit_leaves_running_run_alone() {
        let dir = TempDir::new().unwrap();
        let launcher = ScriptedLauncher::new(&[PING_LINES[0], PING_LINES[1]], 0).hanging();
        let pipeline = Pipeline::start(PipelineDeps {
            config: config(&dir),
            db: db(),
            launcher: Arc::new(launcher),
            sink: None,
        })
        .await
        .unwrap();
        let mut rx = pipeline.events();

        let input = ping_input();
        let first = pipeline.submit(input.clone());
        wait_for(&mut rx, |e| matches!(e, PipelineEvent::MetricUpdated { .. })).await;

        let err = pipeline.submit(input.clone()).await.unwrap().unwrap_err();
        assert!(err.to_string().contains("already in flight"));
        assert_eq!(pipeline.in_flight(), 1);

        let live = pipeline.live_metrics();
        assert!(live.iter().all(|(id, _, _)| id == &input.test_uuid));
        assert!(live.iter().any(|(_, name, s)| *name == MetricName::Rtt && s.count == 1));

        pipeline.cancel_all();
        let outcome = first.await.unwrap().unwrap();
        assert_eq!(outcome.state, RunState::Failed);
        assert_eq!(outcome.reason.as_deref(), Some("cancelled"));
        assert_eq!(pipeline.in_flight(), 0);
        assert!(pipeline.live_metrics().is_empty());

        pipeline.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_resume_encodes_pending_runs_once() {
        let dir = TempDir::new().unwrap();
        let db = db();

        // left behind by a previous process: one finished, one mid-run
        let mut finished = RunRecord::new(&ping_input());
        db.insert_run(&finished).unwrap();
        finished.transition(RunState::Running).unwrap();
        let event = parser_for(ProbeKind::Ping)
            .parse_line(PING_LINES[1])
            .unwrap()
            .unwrap();
        db.append_event(&finished.test_uuid, 0, &event).unwrap();
        finished.push_event(event);
        finished.transition(RunState::Succeeded).unwrap();
        db.finish_run(&finished).unwrap();
        assert!(db.claim_encoding(&finished.test_uuid).unwrap());

        let interrupted = RunRecord::new(&ping_input());
        db.insert_run(&interrupted).unwrap();

        let pipeline = Pipeline::start(PipelineDeps {
            config: config(&dir),
            db: db.clone(),
            launcher: Arc::new(ScriptedLauncher::new(&[], 0)),
            sink: None,
        })
        .await
        .unwrap();

        // resumed twice; the claim keeps encoding to once per run
        pipeline.resume().await.unwrap();
        pipeline.shutdown(Duration::from_secs(1)).await;

        assert_eq!(
            db.completion(&finished.test_uuid).unwrap(),
            Some(Completion::Encoded)
        );
        // interrupted run has no events, so nothing to encode
        assert_eq!(
            db.completion(&interrupted.test_uuid).unwrap(),
            Some(Completion::Failed)
        );
        assert!(db.pending_completions().unwrap().is_empty());

        let lp = OutputPaths::new(&dir.path().join("omnt"), ProbeKind::Ping, &finished.test_uuid)
            .line_protocol;
        assert_eq!(std::fs::read_to_string(lp).unwrap().lines().count(), 1);
    }
}
