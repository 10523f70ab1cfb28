//! Context store: the durable, versioned owner of all task state.
//!
//! Three durable structures live here, all under the data directory:
//!
//! - task records, mirrored from the in-memory graph on every write
//! - the write-ahead transition log (`wal.jsonl`, append-only): every
//!   lifecycle transition is appended here *before* its bus publish, and
//!   acknowledged with an `ack` line after; restart replays entries with
//!   no ack
//! - the decision log (`decisions.jsonl`, append-only, never mutated)
//!
//! Writes use optimistic concurrency: each mutation carries the version
//! the writer last observed and fails with `StorageWriteConflict` when
//! stale. Contention is therefore scoped to the individual record, with
//! no global lock.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clog_debug;
use crate::core::lifecycle::TransitionRecord;
use crate::core::task::{AgentId, Task, TaskId};
use crate::error::{Error, Result};

/// Append-only audit record of an arbitration or scheduling decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    /// Task the decision concerns.
    pub task_id: TaskId,
    /// Agent involved, if any.
    pub agent_id: Option<AgentId>,
    /// Why the decision was made.
    pub rationale: String,
    /// When it was recorded.
    pub timestamp: DateTime<Utc>,
}

impl DecisionRecord {
    pub fn new(task_id: TaskId, agent_id: Option<AgentId>, rationale: &str) -> Self {
        Self {
            task_id,
            agent_id,
            rationale: rationale.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// One line of the write-ahead log file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
enum WalLine {
    /// A transition that has been applied but possibly not yet published.
    Entry { seq: u64, record: TransitionRecord },
    /// Acknowledgement that the entry's bus publish completed.
    Ack { seq: u64 },
}

/// A transition awaiting its bus publish.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingPublish {
    pub seq: u64,
    pub record: TransitionRecord,
}

/// Durable, versioned key/value state for the orchestration core.
pub struct ContextStore {
    data_dir: PathBuf,
    version: u64,
    wal_seq: u64,
    tasks: HashMap<TaskId, Task>,
    /// Every WAL entry in sequence order; `record.published` reflects
    /// whether its ack line exists.
    history: Vec<PendingPublish>,
    unpublished: Vec<PendingPublish>,
    decisions: Vec<DecisionRecord>,
}

impl ContextStore {
    /// Open (or create) a store rooted at the given data directory.
    ///
    /// Replays `wal.jsonl` to recover transitions whose bus publish was
    /// never acknowledged, and reloads the decision log.
    ///
    /// # Errors
    /// `StorageCorruption` if a log line cannot be parsed. Corruption is
    /// fatal by design: the store refuses to open rather than silently
    /// dropping history.
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let mut store = Self {
            data_dir: data_dir.to_path_buf(),
            version: 0,
            wal_seq: 0,
            tasks: HashMap::new(),
            history: Vec::new(),
            unpublished: Vec::new(),
            decisions: Vec::new(),
        };
        store.replay_wal()?;
        store.load_decisions()?;
        clog_debug!(
            "ContextStore::open dir={} wal_seq={} unpublished={}",
            data_dir.display(),
            store.wal_seq,
            store.unpublished.len()
        );
        Ok(store)
    }

    fn wal_path(&self) -> PathBuf {
        self.data_dir.join("wal.jsonl")
    }

    fn decisions_path(&self) -> PathBuf {
        self.data_dir.join("decisions.jsonl")
    }

    fn replay_wal(&mut self) -> Result<()> {
        let path = self.wal_path();
        if !path.exists() {
            return Ok(());
        }
        let mut entries: HashMap<u64, TransitionRecord> = HashMap::new();
        for (lineno, line) in std::fs::read_to_string(&path)?.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let parsed: WalLine = serde_json::from_str(line).map_err(|e| {
                Error::StorageCorruption(format!(
                    "wal.jsonl line {}: {}",
                    lineno + 1,
                    e
                ))
            })?;
            match parsed {
                WalLine::Entry { seq, record } => {
                    self.wal_seq = self.wal_seq.max(seq);
                    entries.insert(seq, record);
                }
                WalLine::Ack { seq } => {
                    if let Some(record) = entries.get_mut(&seq) {
                        record.published = true;
                    }
                }
            }
        }
        let mut history: Vec<PendingPublish> = entries
            .into_iter()
            .map(|(seq, record)| PendingPublish { seq, record })
            .collect();
        history.sort_by_key(|p| p.seq);
        self.unpublished = history
            .iter()
            .filter(|p| !p.record.published)
            .cloned()
            .collect();
        self.history = history;
        Ok(())
    }

    fn load_decisions(&mut self) -> Result<()> {
        let path = self.decisions_path();
        if !path.exists() {
            return Ok(());
        }
        for (lineno, line) in std::fs::read_to_string(&path)?.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: DecisionRecord = serde_json::from_str(line).map_err(|e| {
                Error::StorageCorruption(format!(
                    "decisions.jsonl line {}: {}",
                    lineno + 1,
                    e
                ))
            })?;
            self.decisions.push(record);
        }
        Ok(())
    }

    fn append_line(&self, path: &Path, value: &impl Serialize) -> Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", serde_json::to_string(value)?)?;
        Ok(())
    }

    /// Current store version, carried by writers for optimistic checks.
    pub fn version(&self) -> u64 {
        self.version
    }

    fn check_version(&self, expected: u64) -> Result<()> {
        if expected != self.version {
            return Err(Error::StorageWriteConflict {
                expected,
                actual: self.version,
            });
        }
        Ok(())
    }

    /// Persist a batch of task records in one versioned write.
    ///
    /// Used at submission time; rejects with `StorageWriteConflict` if the
    /// writer's view is stale, in which case nothing is written.
    pub fn put_tasks(&mut self, expected_version: u64, tasks: &[Task]) -> Result<u64> {
        self.check_version(expected_version)?;
        for task in tasks {
            self.tasks.insert(task.id, task.clone());
        }
        self.version += 1;
        Ok(self.version)
    }

    /// Record a transition write-ahead of its bus publish.
    ///
    /// Appends the WAL entry, updates the task record, and bumps the
    /// version. Returns the WAL sequence to acknowledge after publishing.
    pub fn record_transition(
        &mut self,
        expected_version: u64,
        record: &TransitionRecord,
        task: &Task,
    ) -> Result<u64> {
        self.check_version(expected_version)?;
        self.wal_seq += 1;
        let seq = self.wal_seq;
        self.append_line(
            &self.wal_path(),
            &WalLine::Entry {
                seq,
                record: record.clone(),
            },
        )?;
        self.tasks.insert(task.id, task.clone());
        self.history.push(PendingPublish {
            seq,
            record: record.clone(),
        });
        self.unpublished.push(PendingPublish {
            seq,
            record: record.clone(),
        });
        self.version += 1;
        Ok(seq)
    }

    /// Acknowledge that a transition's bus publish completed.
    pub fn mark_published(&mut self, seq: u64) -> Result<()> {
        self.append_line(&self.wal_path(), &WalLine::Ack { seq })?;
        self.unpublished.retain(|p| p.seq != seq);
        if let Some(entry) = self.history.iter_mut().find(|p| p.seq == seq) {
            entry.record.published = true;
        }
        Ok(())
    }

    /// Transitions written but not yet acknowledged as published.
    ///
    /// After a crash these are the publishes to replay, in WAL order.
    pub fn unpublished(&self) -> &[PendingPublish] {
        &self.unpublished
    }

    /// Highest WAL sequence written so far.
    pub fn wal_seq(&self) -> u64 {
        self.wal_seq
    }

    /// WAL entries strictly after the given sequence, in order.
    ///
    /// Recovery replays these on top of a checkpoint whose `wal_seq`
    /// equals `seq`; entries whose `record.published` is false still
    /// need their bus publish.
    pub fn entries_after(&self, seq: u64) -> &[PendingPublish] {
        let start = self.history.partition_point(|p| p.seq <= seq);
        &self.history[start..]
    }

    /// Append to the decision log. Never mutated or deleted.
    pub fn record_decision(&mut self, record: DecisionRecord) -> Result<()> {
        self.append_line(&self.decisions_path(), &record)?;
        self.decisions.push(record);
        Ok(())
    }

    /// The full decision log, oldest first.
    pub fn decisions(&self) -> &[DecisionRecord] {
        &self.decisions
    }

    /// Read a task record.
    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// All task records.
    pub fn all_tasks(&self) -> Vec<&Task> {
        self.tasks.values().collect()
    }

    /// Replace the task records wholesale from a checkpoint snapshot.
    pub fn load_snapshot(&mut self, tasks: Vec<Task>, decisions: Vec<DecisionRecord>) {
        self.tasks = tasks.into_iter().map(|t| (t.id, t)).collect();
        self.decisions = decisions;
    }
}
