//! Sequence-numbered checkpoints of the task graph and decision log.
//!
//! A checkpoint is one JSON document named by its zero-padded sequence
//! number, e.g. `checkpoints/0000000042.json`. Files are append-only:
//! recovery loads the highest sequence and then replays the write-ahead
//! log tail past the checkpoint's `wal_seq` mark.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clog;
use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::store::context::DecisionRecord;

/// A durable snapshot of orchestrator state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Strictly increasing checkpoint number.
    pub sequence: u64,
    /// Highest write-ahead log sequence this snapshot covers. Recovery
    /// replays WAL entries past this mark on top of the snapshot.
    pub wal_seq: u64,
    /// Snapshot of every task record.
    pub tasks: Vec<Task>,
    /// Decision log as of the snapshot.
    pub decision_log: Vec<DecisionRecord>,
    /// When the checkpoint was taken.
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        sequence: u64,
        wal_seq: u64,
        tasks: Vec<Task>,
        decision_log: Vec<DecisionRecord>,
    ) -> Self {
        Self {
            sequence,
            wal_seq,
            tasks,
            decision_log,
            timestamp: Utc::now(),
        }
    }

    /// Whether the snapshot is a consistent cut.
    ///
    /// A checkpoint is only valid if no task is in a transient status
    /// inconsistent with its dependencies: anything InProgress or Review
    /// must have every dependency Completed.
    pub fn is_consistent(&self) -> bool {
        let status_of = |id: &TaskId| {
            self.tasks
                .iter()
                .find(|t| t.id == *id)
                .map(|t| &t.status)
        };
        self.tasks.iter().all(|task| {
            match task.status {
                TaskStatus::InProgress | TaskStatus::Review => task
                    .depends_on
                    .iter()
                    .all(|dep| status_of(dep) == Some(&TaskStatus::Completed)),
                _ => true,
            }
        })
    }
}

/// Writes and recovers checkpoint files under one directory.
pub struct CheckpointStore {
    dir: PathBuf,
    next_sequence: u64,
}

impl CheckpointStore {
    /// Open a checkpoint directory, scanning for the highest existing
    /// sequence so new checkpoints continue the series.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let mut highest = 0u64;
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(seq) = parse_sequence(&entry.path()) {
                highest = highest.max(seq);
            }
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            next_sequence: highest + 1,
        })
    }

    fn path_for(&self, sequence: u64) -> PathBuf {
        self.dir.join(format!("{:010}.json", sequence))
    }

    /// Write the next checkpoint in the series.
    ///
    /// Refuses an inconsistent cut; the caller should quiesce or retry at
    /// the next interval rather than persist a torn state.
    pub fn write(
        &mut self,
        tasks: Vec<Task>,
        decision_log: Vec<DecisionRecord>,
        wal_seq: u64,
    ) -> Result<Checkpoint> {
        let checkpoint = Checkpoint::new(self.next_sequence, wal_seq, tasks, decision_log);
        if !checkpoint.is_consistent() {
            return Err(Error::Validation(format!(
                "checkpoint {} would capture an inconsistent cut",
                checkpoint.sequence
            )));
        }
        let path = self.path_for(checkpoint.sequence);
        std::fs::write(&path, serde_json::to_string_pretty(&checkpoint)?)?;
        clog!(
            "checkpoint {} written ({} tasks)",
            checkpoint.sequence,
            checkpoint.tasks.len()
        );
        self.next_sequence += 1;
        Ok(checkpoint)
    }

    /// Load the highest-sequence checkpoint, if any exist.
    ///
    /// # Errors
    /// `StorageCorruption` if the newest checkpoint file cannot be parsed.
    pub fn latest(&self) -> Result<Option<Checkpoint>> {
        let mut newest: Option<(u64, PathBuf)> = None;
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if let Some(seq) = parse_sequence(&path) {
                if newest.as_ref().map(|(s, _)| seq > *s).unwrap_or(true) {
                    newest = Some((seq, path));
                }
            }
        }
        let Some((seq, path)) = newest else {
            return Ok(None);
        };
        let content = std::fs::read_to_string(&path)?;
        let checkpoint: Checkpoint = serde_json::from_str(&content).map_err(|e| {
            Error::StorageCorruption(format!("checkpoint {}: {}", seq, e))
        })?;
        if checkpoint.sequence != seq {
            return Err(Error::StorageCorruption(format!(
                "checkpoint file {} claims sequence {}",
                path.display(),
                checkpoint.sequence
            )));
        }
        Ok(Some(checkpoint))
    }

    /// Sequence number the next write will use.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }
}

fn parse_sequence(path: &Path) -> Option<u64> {
    if path.extension()? != "json" {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}
