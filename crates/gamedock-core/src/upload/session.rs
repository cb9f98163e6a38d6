//! Upload session state machine.
//!
//! Pure bookkeeping, no I/O: the manager in the parent module owns the
//! disk side. A session tracks declared totals, per-file received byte
//! ranges for retransmission tolerance, and a progress throttle so the
//! observer queue is not flooded with near-identical updates.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Declared, no chunk received yet.
    Pending,
    /// Chunks are being applied.
    Receiving,
    /// Finish requested, verification in progress.
    Finalizing,
    /// Artifact installed at its final path.
    Complete,
    /// Cancelled, failed, or reaped; partials deleted.
    Aborted,
}

/// Result of offering a chunk to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// New bytes, to be written at the given offset.
    Applied,
    /// Range already covered; skip the write, re-ack the current totals.
    Duplicate,
}

/// Progress throttle: at most one update per step of percent or window of
/// wall time, whichever comes first.
const PROGRESS_STEP_PCT: u8 = 2;
const PROGRESS_WINDOW: Duration = Duration::from_millis(500);

/// One declared upload.
#[derive(Debug)]
pub struct UploadSession {
    /// Session id, random hex.
    pub id: String,
    /// Declared game name.
    pub name: String,
    /// Declared payload size in bytes, summed over all files.
    pub total_size: u64,
    /// Final destination directory under the install root.
    pub final_dest: PathBuf,
    /// Staging directory the chunks are written into.
    pub staging_dir: PathBuf,
    state: SessionState,
    bytes_received: u64,
    ranges: HashMap<PathBuf, Vec<(u64, u64)>>,
    last_activity: Instant,
    last_progress_pct: u8,
    last_progress_at: Instant,
}

impl UploadSession {
    /// Create a session in `Pending` state.
    #[must_use]
    pub fn new(
        id: String,
        name: String,
        total_size: u64,
        final_dest: PathBuf,
        staging_dir: PathBuf,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            name,
            total_size,
            final_dest,
            staging_dir,
            state: SessionState::Pending,
            bytes_received: 0,
            ranges: HashMap::new(),
            last_activity: now,
            last_progress_pct: 0,
            last_progress_at: now,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Bytes accepted so far, duplicates excluded.
    #[must_use]
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Whole-percent progress, 0-100.
    #[must_use]
    pub fn progress_pct(&self) -> u8 {
        if self.total_size == 0 {
            return 100;
        }
        ((self.bytes_received.saturating_mul(100)) / self.total_size).min(100) as u8
    }

    /// True when every declared byte has been received.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.bytes_received == self.total_size
    }

    /// Time since the last chunk or state change.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Move to `Receiving`. Valid from `Pending` only; the manager calls
    /// this when the session is accepted.
    pub fn start(&mut self) {
        debug_assert_eq!(self.state, SessionState::Pending);
        self.state = SessionState::Receiving;
        self.last_activity = Instant::now();
    }

    /// Move to `Finalizing`.
    pub fn begin_finalize(&mut self) {
        self.state = SessionState::Finalizing;
        self.last_activity = Instant::now();
    }

    /// Terminal success.
    pub fn complete(&mut self) {
        self.state = SessionState::Complete;
    }

    /// Terminal failure or cancellation.
    pub fn abort(&mut self) {
        self.state = SessionState::Aborted;
    }

    /// Account for an incoming chunk.
    ///
    /// A range overlapping anything already recorded for the same file is
    /// treated as a retransmission and skipped whole; the hub's ack tells
    /// it how far the session actually is.
    pub fn record_chunk(&mut self, file: &PathBuf, offset: u64, len: u64) -> ChunkOutcome {
        self.last_activity = Instant::now();
        if len == 0 {
            return ChunkOutcome::Duplicate;
        }

        let ranges = self.ranges.entry(file.clone()).or_default();
        let end = offset.saturating_add(len);
        let overlaps = ranges
            .iter()
            .any(|&(start, stop)| offset < stop && start < end);
        if overlaps {
            return ChunkOutcome::Duplicate;
        }

        ranges.push((offset, end));
        self.bytes_received += len;
        ChunkOutcome::Applied
    }

    /// Whole-percent progress if an update is due under the throttle,
    /// `None` otherwise.
    pub fn throttled_progress(&mut self) -> Option<u8> {
        let pct = self.progress_pct();
        let now = Instant::now();
        let due = pct >= self.last_progress_pct + PROGRESS_STEP_PCT
            || now.duration_since(self.last_progress_at) >= PROGRESS_WINDOW
            || pct == 100;
        if !due {
            return None;
        }
        self.last_progress_pct = pct;
        self.last_progress_at = now;
        Some(pct)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(total: u64) -> UploadSession {
        let mut s = UploadSession::new(
            "abcd".into(),
            "Hollow Depths".into(),
            total,
            PathBuf::from("/games/Hollow Depths"),
            PathBuf::from("/games/.partial/abcd"),
        );
        s.start();
        s
    }

    #[test]
    fn test_chunks_accumulate() {
        let mut s = session(1000);
        let file = PathBuf::from("game.bin");

        assert_eq!(s.record_chunk(&file, 0, 600), ChunkOutcome::Applied);
        assert_eq!(s.bytes_received(), 600);
        assert!(!s.is_complete());

        assert_eq!(s.record_chunk(&file, 600, 400), ChunkOutcome::Applied);
        assert_eq!(s.bytes_received(), 1000);
        assert!(s.is_complete());
    }

    #[test]
    fn test_duplicate_chunk_skipped() {
        let mut s = session(1000);
        let file = PathBuf::from("game.bin");

        s.record_chunk(&file, 0, 600);
        assert_eq!(s.record_chunk(&file, 0, 600), ChunkOutcome::Duplicate);
        assert_eq!(s.bytes_received(), 600);
    }

    #[test]
    fn test_overlapping_chunk_skipped() {
        let mut s = session(1000);
        let file = PathBuf::from("game.bin");

        s.record_chunk(&file, 0, 600);
        assert_eq!(s.record_chunk(&file, 500, 200), ChunkOutcome::Duplicate);
        assert_eq!(s.bytes_received(), 600);
    }

    #[test]
    fn test_same_offset_different_files() {
        let mut s = session(1000);
        s.record_chunk(&PathBuf::from("a.bin"), 0, 500);
        assert_eq!(
            s.record_chunk(&PathBuf::from("b.bin"), 0, 500),
            ChunkOutcome::Applied
        );
        assert!(s.is_complete());
    }

    #[test]
    fn test_progress_pct() {
        let mut s = session(1000);
        let file = PathBuf::from("game.bin");
        assert_eq!(s.progress_pct(), 0);

        s.record_chunk(&file, 0, 250);
        assert_eq!(s.progress_pct(), 25);

        s.record_chunk(&file, 250, 750);
        assert_eq!(s.progress_pct(), 100);
    }

    #[test]
    fn test_throttle_suppresses_small_steps() {
        let mut s = session(10_000);
        let file = PathBuf::from("game.bin");

        s.record_chunk(&file, 0, 300);
        assert_eq!(s.throttled_progress(), Some(3));

        // 3% -> 4% is below the step and the window has not elapsed.
        s.record_chunk(&file, 300, 100);
        assert_eq!(s.throttled_progress(), None);

        // Crossing the step fires.
        s.record_chunk(&file, 400, 200);
        assert_eq!(s.throttled_progress(), Some(6));
    }

    #[test]
    fn test_completion_always_reported() {
        let mut s = session(1000);
        let file = PathBuf::from("game.bin");

        s.record_chunk(&file, 0, 990);
        let _ = s.throttled_progress();
        s.record_chunk(&file, 990, 10);
        assert_eq!(s.throttled_progress(), Some(100));
    }

    #[test]
    fn test_state_transitions() {
        let mut s = session(10);
        assert_eq!(s.state(), SessionState::Receiving);
        s.begin_finalize();
        assert_eq!(s.state(), SessionState::Finalizing);
        s.complete();
        assert_eq!(s.state(), SessionState::Complete);
    }
}
