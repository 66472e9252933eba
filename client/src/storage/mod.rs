//! SQLite run store
//!
//! Every run, its parsed events and its completion status live here. The
//! `completion` column is what makes encoding exactly-once across restarts:
//! a run is claimed by a single conditional UPDATE before it is encoded.

use crate::metrics::{MetricName, MetricSnapshot};
use crate::parameter::{ProbeKind, ProbeParameter, TestInput};
use crate::runner::{RunRecord, RunState};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use protocol::ParsedEvent;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Reason recorded for runs found unfinished at startup
pub const REASON_INTERRUPTED: &str = "interrupted";

/// Where a terminal run stands with respect to encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Pending,
    Claimed,
    Encoded,
    Failed,
}

impl Completion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Completion::Pending => "pending",
            Completion::Claimed => "claimed",
            Completion::Encoded => "encoded",
            Completion::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Completion::Pending),
            "claimed" => Some(Completion::Claimed),
            "encoded" => Some(Completion::Encoded),
            "failed" => Some(Completion::Failed),
            _ => None,
        }
    }
}

/// One row of the runs table, as exported
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub test_uuid: String,
    pub probe: String,
    pub state: String,
    pub reason: Option<String>,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub exit_code: Option<i32>,
    pub completion: String,
    pub metrics: BTreeMap<MetricName, MetricSnapshot>,
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(dir) = path.as_ref().parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }

        let conn = Connection::open(path).context("Failed to open database")?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .context("Failed to enable WAL mode")?;
        conn.pragma_update(None, "busy_timeout", "5000")
            .context("Failed to set busy timeout")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Database connection lock poisoned"))
    }

    pub fn initialize(&self) -> Result<()> {
        info!("Initializing database schema");
        let conn = self.conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS runs (
                test_uuid TEXT PRIMARY KEY,
                probe TEXT NOT NULL,
                state TEXT NOT NULL,
                reason TEXT,
                started_at INTEGER NOT NULL,
                finished_at INTEGER,
                exit_code INTEGER,
                metrics TEXT,
                completion TEXT NOT NULL DEFAULT 'pending',
                params TEXT NOT NULL,
                sequence_uuid TEXT NOT NULL DEFAULT '',
                measurement_uuid TEXT NOT NULL DEFAULT '',
                campaign_uuid TEXT NOT NULL DEFAULT '',
                device TEXT NOT NULL DEFAULT ''
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_runs_started ON runs(started_at)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_runs_completion ON runs(completion, state)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS run_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                test_uuid TEXT NOT NULL REFERENCES runs(test_uuid),
                seq INTEGER NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_run_events_run ON run_events(test_uuid, seq)",
            [],
        )?;

        info!("Database schema initialized");
        Ok(())
    }

    /// Insert a fresh run; fails if the test UUID is already known
    pub fn insert_run(&self, record: &RunRecord) -> Result<()> {
        let params_json = serde_json::to_string(&record.parameter.to_json())?;
        self.conn()?.execute(
            "INSERT INTO runs (
                test_uuid, probe, state, reason, started_at, params,
                sequence_uuid, measurement_uuid, campaign_uuid, device
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                &record.test_uuid,
                record.probe.as_str(),
                record.state().as_str(),
                &record.reason,
                record.started_at.timestamp_millis(),
                params_json,
                &record.sequence_uuid,
                &record.measurement_uuid,
                &record.campaign_uuid,
                &record.device,
            ],
        )?;
        Ok(())
    }

    pub fn update_state(&self, record: &RunRecord) -> Result<()> {
        self.conn()?.execute(
            "UPDATE runs SET state = ?2, reason = ?3 WHERE test_uuid = ?1",
            params![&record.test_uuid, record.state().as_str(), &record.reason],
        )?;
        Ok(())
    }

    pub fn append_event(&self, test_uuid: &str, seq: usize, event: &ParsedEvent) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        self.conn()?.execute(
            "INSERT INTO run_events (test_uuid, seq, kind, payload) VALUES (?1, ?2, ?3, ?4)",
            params![test_uuid, seq as i64, event.kind(), payload],
        )?;
        Ok(())
    }

    /// Persist the terminal state; the run becomes claimable for encoding
    pub fn finish_run(&self, record: &RunRecord) -> Result<()> {
        if !record.state().is_terminal() {
            return Err(anyhow!(
                "Run {} is not terminal ({})",
                record.test_uuid,
                record.state().as_str()
            ));
        }
        let metrics = serde_json::to_string(&record.metrics)?;
        self.conn()?.execute(
            "UPDATE runs SET
                state = ?2, reason = ?3, finished_at = ?4, exit_code = ?5,
                metrics = ?6, completion = 'pending'
            WHERE test_uuid = ?1",
            params![
                &record.test_uuid,
                record.state().as_str(),
                &record.reason,
                record.finished_at.map(|t| t.timestamp_millis()),
                record.exit_code,
                metrics,
            ],
        )?;
        Ok(())
    }

    /// Atomically take ownership of a terminal run for encoding
    ///
    /// Returns false if the run is not terminal or someone else already
    /// claimed it.
    pub fn claim_encoding(&self, test_uuid: &str) -> Result<bool> {
        let rows = self.conn()?.execute(
            "UPDATE runs SET completion = 'claimed'
            WHERE test_uuid = ?1 AND completion = 'pending'
                AND state IN ('succeeded', 'failed')",
            params![test_uuid],
        )?;
        Ok(rows == 1)
    }

    pub fn mark_completion(&self, test_uuid: &str, completion: Completion) -> Result<()> {
        self.conn()?.execute(
            "UPDATE runs SET completion = ?2 WHERE test_uuid = ?1",
            params![test_uuid, completion.as_str()],
        )?;
        Ok(())
    }

    pub fn completion(&self, test_uuid: &str) -> Result<Option<Completion>> {
        let value: Option<String> = self
            .conn()?
            .query_row(
                "SELECT completion FROM runs WHERE test_uuid = ?1",
                params![test_uuid],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.as_deref().and_then(Completion::parse))
    }

    /// Claims left behind by a crash go back to pending
    pub fn release_stale_claims(&self) -> Result<usize> {
        let released = self.conn()?.execute(
            "UPDATE runs SET completion = 'pending' WHERE completion = 'claimed'",
            [],
        )?;
        if released > 0 {
            info!("Released {} stale encoding claims", released);
        }
        Ok(released)
    }

    /// Runs that never reached a terminal state are failed as interrupted
    pub fn fail_interrupted_runs(&self) -> Result<usize> {
        let failed = self.conn()?.execute(
            "UPDATE runs SET state = 'failed', reason = ?1, finished_at = ?2,
                completion = 'pending'
            WHERE state IN ('created', 'running')",
            params![REASON_INTERRUPTED, Utc::now().timestamp_millis()],
        )?;
        if failed > 0 {
            warn!("Marked {} interrupted runs as failed", failed);
        }
        Ok(failed)
    }

    /// Terminal runs still waiting to be encoded, oldest first
    pub fn pending_completions(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT test_uuid FROM runs
            WHERE completion = 'pending' AND state IN ('succeeded', 'failed')
            ORDER BY started_at ASC",
        )?;
        let uuids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(uuids)
    }

    pub fn load_run(&self, test_uuid: &str) -> Result<Option<RunRecord>> {
        let conn = self.conn()?;

        let row = conn
            .query_row(
                "SELECT probe, state, reason, started_at, finished_at, exit_code, metrics,
                    params, sequence_uuid, measurement_uuid, campaign_uuid, device
                FROM runs WHERE test_uuid = ?1",
                params![test_uuid],
                |row| {
                    Ok(StoredRun {
                        probe: row.get(0)?,
                        state: row.get(1)?,
                        reason: row.get(2)?,
                        started_at: row.get(3)?,
                        finished_at: row.get(4)?,
                        exit_code: row.get(5)?,
                        metrics: row.get(6)?,
                        params: row.get(7)?,
                        sequence_uuid: row.get(8)?,
                        measurement_uuid: row.get(9)?,
                        campaign_uuid: row.get(10)?,
                        device: row.get(11)?,
                    })
                },
            )
            .optional()?;
        let Some(row) = row else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT payload FROM run_events WHERE test_uuid = ?1 ORDER BY seq ASC",
        )?;
        let events = stmt
            .query_map(params![test_uuid], |row| row.get::<_, String>(0))?
            .map(|payload| -> Result<ParsedEvent> {
                serde_json::from_str(&payload?).context("Corrupt stored event")
            })
            .collect::<Result<Vec<_>>>()?;

        debug!("Loaded run {} with {} events", test_uuid, events.len());
        row.into_record(test_uuid, events).map(Some)
    }

    /// Runs started within `[start, end]` (unix milliseconds)
    pub fn query_runs(&self, start: i64, end: i64) -> Result<Vec<RunSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT test_uuid, probe, state, reason, started_at, finished_at, exit_code,
                completion, metrics
            FROM runs
            WHERE started_at >= ?1 AND started_at <= ?2
            ORDER BY started_at ASC",
        )?;

        let rows = stmt
            .query_map(params![start, end], |row| {
                Ok((
                    RunSummary {
                        test_uuid: row.get(0)?,
                        probe: row.get(1)?,
                        state: row.get(2)?,
                        reason: row.get(3)?,
                        started_at: row.get(4)?,
                        finished_at: row.get(5)?,
                        exit_code: row.get(6)?,
                        completion: row.get(7)?,
                        metrics: BTreeMap::new(),
                    },
                    row.get::<_, Option<String>>(8)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut summaries = Vec::with_capacity(rows.len());
        for (mut summary, metrics) in rows {
            if let Some(metrics) = metrics {
                summary.metrics = serde_json::from_str(&metrics).with_context(|| {
                    format!("Corrupt metrics for run {}", summary.test_uuid)
                })?;
            }
            summaries.push(summary);
        }
        Ok(summaries)
    }
}

struct StoredRun {
    probe: String,
    state: String,
    reason: Option<String>,
    started_at: i64,
    finished_at: Option<i64>,
    exit_code: Option<i32>,
    metrics: Option<String>,
    params: String,
    sequence_uuid: String,
    measurement_uuid: String,
    campaign_uuid: String,
    device: String,
}

impl StoredRun {
    fn into_record(self, test_uuid: &str, events: Vec<ParsedEvent>) -> Result<RunRecord> {
        let probe = ProbeKind::parse(&self.probe)
            .ok_or_else(|| anyhow!("Unknown probe {:?} for run {}", self.probe, test_uuid))?;
        let state = RunState::parse(&self.state)
            .ok_or_else(|| anyhow!("Unknown state {:?} for run {}", self.state, test_uuid))?;

        let params: serde_json::Value = serde_json::from_str(&self.params)
            .with_context(|| format!("Corrupt parameters for run {}", test_uuid))?;
        let params = params
            .as_object()
            .ok_or_else(|| anyhow!("Parameters for run {} are not an object", test_uuid))?;
        let parameter = ProbeParameter::from_map(probe, params)
            .with_context(|| format!("Invalid stored parameters for run {}", test_uuid))?;

        let input = TestInput {
            test_uuid: test_uuid.to_string(),
            sequence_uuid: self.sequence_uuid,
            measurement_uuid: self.measurement_uuid,
            campaign_uuid: self.campaign_uuid,
            device: self.device,
            created_at: from_millis(self.started_at),
            parameter,
        };

        let mut record = RunRecord::new(&input).restore(state, events);
        record.started_at = from_millis(self.started_at);
        record.finished_at = self.finished_at.map(from_millis);
        record.reason = self.reason;
        record.exit_code = self.exit_code;
        if let Some(metrics) = self.metrics {
            record.metrics = serde_json::from_str(&metrics)
                .with_context(|| format!("Corrupt metrics for run {}", test_uuid))?;
        }
        Ok(record)
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameter::PingParameter;
    use protocol::events::RttSample;
    use tempfile::TempDir;

    fn db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn record() -> RunRecord {
        let mut input = TestInput::new(ProbeParameter::Ping(
            PingParameter::new("8.8.8.8").unwrap().with_count(Some(3)),
        ));
        input.campaign_uuid = "c-1".to_string();
        RunRecord::new(&input)
    }

    fn rtt(seq: u32) -> ParsedEvent {
        ParsedEvent::Rtt(RttSample {
            host: "8.8.8.8".to_string(),
            ip: None,
            icmp_seq: seq,
            ttl: 64,
            rtt_ms: 10.0 + seq as f64,
            timestamp_ms: Some(1_700_000_000_000 + seq as i64 * 1000),
        })
    }

    fn finished(db: &Database) -> RunRecord {
        let mut record = record();
        db.insert_run(&record).unwrap();
        record.transition(RunState::Running).unwrap();
        db.update_state(&record).unwrap();
        for seq in 1..=2 {
            db.append_event(&record.test_uuid, record.events().len(), &rtt(seq))
                .unwrap();
            record.push_event(rtt(seq));
        }
        record.exit_code = Some(0);
        record.transition(RunState::Succeeded).unwrap();
        db.finish_run(&record).unwrap();
        record
    }

    #[test]
    fn test_on_disk_database() {
        let dir = TempDir::new().unwrap();
        let db = Database::new(dir.path().join("nested/netprobe.db")).unwrap();
        db.initialize().unwrap();
        // idempotent
        db.initialize().unwrap();
        assert!(db.pending_completions().unwrap().is_empty());
    }

    #[test]
    fn test_run_round_trip() {
        let db = db();
        let record = finished(&db);

        let loaded = db.load_run(&record.test_uuid).unwrap().unwrap();
        assert_eq!(loaded.state(), RunState::Succeeded);
        assert_eq!(loaded.events(), record.events());
        assert_eq!(loaded.parameter, record.parameter);
        assert_eq!(loaded.campaign_uuid, "c-1");
        assert_eq!(loaded.exit_code, Some(0));
        assert_eq!(
            loaded.started_at.timestamp_millis(),
            record.started_at.timestamp_millis()
        );
        assert!(loaded.finished_at.is_some());

        assert!(db.load_run("missing").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_insert_fails() {
        let db = db();
        let record = record();
        db.insert_run(&record).unwrap();
        assert!(db.insert_run(&record).is_err());
    }

    #[test]
    fn test_claim_is_exactly_once() {
        let db = db();
        let record = finished(&db);

        assert_eq!(db.pending_completions().unwrap(), vec![record.test_uuid.clone()]);
        assert!(db.claim_encoding(&record.test_uuid).unwrap());
        assert!(!db.claim_encoding(&record.test_uuid).unwrap());
        assert!(db.pending_completions().unwrap().is_empty());

        db.mark_completion(&record.test_uuid, Completion::Encoded).unwrap();
        assert!(!db.claim_encoding(&record.test_uuid).unwrap());
        assert_eq!(
            db.completion(&record.test_uuid).unwrap(),
            Some(Completion::Encoded)
        );
    }

    #[test]
    fn test_running_run_cannot_be_claimed() {
        let db = db();
        let mut record = record();
        db.insert_run(&record).unwrap();
        record.transition(RunState::Running).unwrap();
        db.update_state(&record).unwrap();

        assert!(!db.claim_encoding(&record.test_uuid).unwrap());
        assert!(db.finish_run(&record).is_err());
    }

    #[test]
    fn test_recovery_after_crash() {
        let db = db();
        let claimed = finished(&db);
        assert!(db.claim_encoding(&claimed.test_uuid).unwrap());

        let mut running = record();
        db.insert_run(&running).unwrap();
        running.transition(RunState::Running).unwrap();
        db.update_state(&running).unwrap();

        assert_eq!(db.release_stale_claims().unwrap(), 1);
        assert_eq!(db.fail_interrupted_runs().unwrap(), 1);

        let pending = db.pending_completions().unwrap();
        assert_eq!(pending.len(), 2);

        let loaded = db.load_run(&running.test_uuid).unwrap().unwrap();
        assert_eq!(loaded.state(), RunState::Failed);
        assert_eq!(loaded.reason.as_deref(), Some(REASON_INTERRUPTED));
    }

    #[test]
    fn test_query_runs_for_export() {
        let db = db();
        let mut record = finished(&db);
        record.metrics.insert(
            MetricName::Rtt,
            MetricSnapshot {
                count: 2,
                mean: Some(11.5),
                ..Default::default()
            },
        );
        db.finish_run(&record).unwrap();

        let start = record.started_at.timestamp_millis();
        let runs = db.query_runs(start, start + 1).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].state, "succeeded");
        assert_eq!(runs[0].probe, "ping");
        assert_eq!(runs[0].metrics[&MetricName::Rtt].mean, Some(11.5));

        assert!(db.query_runs(start + 10, start + 20).unwrap().is_empty());
    }
}
