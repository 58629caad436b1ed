//! Runtime types: per-chunk outcomes and the job-level report.

use std::fmt;

use scribeflow_core::FailureClass;
use scribeflow_store::{ChunkStatus, Manifest};
use serde::Serialize;
use uuid::Uuid;

/// How one chunk's run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    Done {
        index: usize,
        attempts: u32,
    },
    Failed {
        index: usize,
        class: FailureClass,
        attempts: u32,
        error: String,
    },
    /// Abandoned because the job was cancelled.
    Cancelled { index: usize },
}

impl ChunkOutcome {
    pub fn index(&self) -> usize {
        match self {
            Self::Done { index, .. } | Self::Failed { index, .. } | Self::Cancelled { index } => {
                *index
            }
        }
    }
}

/// A chunk that ended the run `failed`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedChunk {
    pub index: usize,
    pub class: Option<FailureClass>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// User-visible summary of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobReport {
    pub run_id: Uuid,
    pub source: String,
    pub model: String,
    pub total: usize,
    pub done: usize,
    pub failed: usize,
    /// Chunks neither done nor failed (cancelled before or during dispatch).
    pub pending: usize,
    /// Done chunks carried over from an earlier run.
    pub skipped: usize,
    pub cancelled: bool,
    pub failures: Vec<FailedChunk>,
}

impl JobReport {
    /// Build the report from the manifest state at the end of a run.
    pub fn from_manifest(
        run_id: Uuid,
        manifest: &Manifest,
        skipped: usize,
        cancelled: bool,
    ) -> Self {
        let progress = manifest.progress();
        let failures = manifest
            .chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Failed)
            .map(|c| FailedChunk {
                index: c.index,
                class: c.failure_class,
                attempts: c.attempts,
                last_error: c.last_error.clone(),
            })
            .collect();
        Self {
            run_id,
            source: manifest.source.clone(),
            model: manifest.planning.model.clone(),
            total: progress.total,
            done: progress.done,
            failed: progress.failed,
            pending: progress.pending + progress.in_flight,
            skipped,
            cancelled,
            failures,
        }
    }

    /// True only when every chunk is `done`.
    pub fn is_success(&self) -> bool {
        self.total > 0 && self.done == self.total
    }
}

impl fmt::Display for JobReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.is_success() {
            "complete"
        } else if self.cancelled {
            "cancelled"
        } else {
            "failed"
        };
        write!(
            f,
            "{}: {} ({}/{} chunks done, {} failed, {} pending",
            self.source, status, self.done, self.total, self.failed, self.pending
        )?;
        if self.skipped > 0 {
            write!(f, ", {} resumed", self.skipped)?;
        }
        write!(f, ")")?;
        for failure in &self.failures {
            let class = failure
                .class
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            write!(
                f,
                "\n  chunk {}: {} after {} attempt{}",
                failure.index,
                class,
                failure.attempts,
                if failure.attempts == 1 { "" } else { "s" }
            )?;
            if let Some(error) = &failure.last_error {
                write!(f, ": {}", error)?;
            }
        }
        Ok(())
    }
}
