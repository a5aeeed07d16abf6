use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::recover;
use crate::types::{Chunk, ChunkStatus};

/// Lifecycle of a transfer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Preparing,
    Transferring,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }
}

/// Snapshot of a session's chunk statuses.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionProgress {
    pub session_id: String,
    pub status: SessionStatus,
    pub total_chunks: usize,
    pub pending: usize,
    pub transferring: usize,
    pub completed: usize,
    pub failed: usize,
    /// `completed / total_chunks`; 1.0 for an empty session.
    pub fraction: f64,
}

impl SessionProgress {
    /// Whole-number percentage of completed chunks.
    pub fn percent(&self) -> u8 {
        (self.fraction * 100.0).floor().clamp(0.0, 100.0) as u8
    }

    /// Every chunk reached Completed or Failed.
    pub fn is_settled(&self) -> bool {
        self.completed + self.failed == self.total_chunks
    }
}

/// One end-to-end transfer of one byte stream (thread-safe).
///
/// Overall progress is never stored; it is recomputed from the chunk
/// statuses on every query.
pub struct TransferSession {
    id: String,
    file_name: String,
    total_size: u64,
    chunks: Vec<Arc<Chunk>>,
    inner: RwLock<SessionInner>,
}

struct SessionInner {
    status: SessionStatus,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    error: String,
}

impl TransferSession {
    /// Creates a preparing session with a random id.
    pub fn new(file_name: impl Into<String>, total_size: u64, chunks: Vec<Arc<Chunk>>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), file_name, total_size, chunks)
    }

    pub fn with_id(
        id: impl Into<String>,
        file_name: impl Into<String>,
        total_size: u64,
        chunks: Vec<Arc<Chunk>>,
    ) -> Self {
        Self {
            id: id.into(),
            file_name: file_name.into(),
            total_size,
            chunks,
            inner: RwLock::new(SessionInner {
                status: SessionStatus::Preparing,
                created_at: Utc::now(),
                started_at: None,
                ended_at: None,
                error: String::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Chunks in index order.
    pub fn chunks(&self) -> &[Arc<Chunk>] {
        &self.chunks
    }

    pub fn total_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Marks the session as transferring.
    pub fn start(&self) {
        let mut s = recover(self.inner.write());
        if s.status == SessionStatus::Preparing {
            s.status = SessionStatus::Transferring;
            s.started_at = Some(Utc::now());
        }
    }

    /// Marks the session as completed. Terminal sessions are left untouched.
    pub fn complete(&self) {
        let mut s = recover(self.inner.write());
        if !s.status.is_terminal() {
            s.status = SessionStatus::Completed;
            s.ended_at = Some(Utc::now());
        }
    }

    /// Marks the session as failed. Terminal sessions are left untouched.
    pub fn fail(&self, err: &str) {
        let mut s = recover(self.inner.write());
        if !s.status.is_terminal() {
            s.status = SessionStatus::Failed;
            s.error = err.to_string();
            s.ended_at = Some(Utc::now());
        }
    }

    /// Settles the status from the chunk outcomes.
    ///
    /// Completed when every chunk completed, Failed otherwise. Call once no
    /// sender can still change a chunk.
    pub fn settle(&self) -> SessionStatus {
        let p = self.progress();
        if p.completed == p.total_chunks {
            self.complete();
        } else {
            self.fail(&format!(
                "{} of {} chunks not completed ({} failed)",
                p.total_chunks - p.completed,
                p.total_chunks,
                p.failed
            ));
        }
        self.status()
    }

    /// Recomputes progress from the chunk statuses.
    pub fn progress(&self) -> SessionProgress {
        let (mut pending, mut transferring, mut completed, mut failed) = (0, 0, 0, 0);
        for chunk in &self.chunks {
            match chunk.status() {
                ChunkStatus::Pending => pending += 1,
                ChunkStatus::Transferring => transferring += 1,
                ChunkStatus::Completed => completed += 1,
                ChunkStatus::Failed => failed += 1,
            }
        }
        let total_chunks = self.chunks.len();
        let fraction = if total_chunks == 0 {
            1.0
        } else {
            completed as f64 / total_chunks as f64
        };
        SessionProgress {
            session_id: self.id.clone(),
            status: self.status(),
            total_chunks,
            pending,
            transferring,
            completed,
            failed,
            fraction,
        }
    }

    /// Returns `true` if the session is preparing or transferring.
    pub fn is_active(&self) -> bool {
        !self.status().is_terminal()
    }

    pub fn status(&self) -> SessionStatus {
        recover(self.inner.read()).status
    }

    /// Error recorded by [`fail`](Self::fail), empty otherwise.
    pub fn error(&self) -> String {
        recover(self.inner.read()).error.clone()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        recover(self.inner.read()).created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        recover(self.inner.read()).started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        recover(self.inner.read()).ended_at
    }

    /// Time between start and end (or now, while running).
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        let s = recover(self.inner.read());
        let started = s.started_at?;
        Some(s.ended_at.unwrap_or_else(Utc::now) - started)
    }
}
