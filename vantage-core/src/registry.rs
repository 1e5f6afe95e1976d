//! Process-wide stream registry.
//!
//! A concurrent map from stream id to its live state. Capture workers flip
//! the streaming flag, recorder workers report started/stopped recordings,
//! and HTTP handlers stage record intent through the `try_begin_*` calls.
//! Everything goes through one read-write lock; the handlers' polling loops
//! read `last_file` under the same lock the recorder writes under, so a
//! started recording is observable by the next poll tick.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::packet::StreamId;

/// Live state for one stream id. All fields default to the neutral value.
#[derive(Debug, Clone, Default)]
pub struct StreamState {
    /// Capture currently holds an open session and is reading.
    pub streaming: bool,
    /// Recorder has opened a file and is writing.
    pub recording: bool,
    /// A record-start was accepted but the recorder has not yet confirmed a
    /// file.
    pub start_pending: bool,
    /// A record-stop arrived while the start was still pending.
    pub stop_pending: bool,
    /// Last file the recorder reported. Survives the end of the recording
    /// so clients can query it after stop.
    pub last_file: Option<PathBuf>,
}

/// Outcome of staging a record-start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartDecision {
    /// Intent staged; signal the recorder and wait for the file.
    Proceed,
    /// A recording is already running; its file is returned as-is.
    AlreadyRecording { file: Option<PathBuf> },
    /// An earlier start has not been confirmed yet.
    AlreadyPending,
}

/// Outcome of staging a record-stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopDecision {
    /// Nothing is recording or pending for this stream.
    NotRecording,
    /// Stop staged; signal the recorder and wait for the file.
    Proceed,
}

#[derive(Clone, Default)]
pub struct StreamRegistry {
    inner: Arc<RwLock<HashMap<StreamId, StreamState>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure the id exists with neutral state. Configured streams are
    /// registered at boot so `/stream/status` lists them before any goes
    /// online.
    pub fn register(&self, id: &str) {
        let mut map = self.inner.write().unwrap();
        map.entry(id.to_string()).or_default();
    }

    pub fn is_known(&self, id: &str) -> bool {
        self.inner.read().unwrap().contains_key(id)
    }

    /// Set the streaming flag, inserting the id if it was never configured.
    pub fn mark_streaming(&self, id: &str, streaming: bool) {
        let mut map = self.inner.write().unwrap();
        let entry = map.entry(id.to_string()).or_default();
        if entry.streaming != streaming {
            log::debug!("{}: streaming -> {}", id, streaming);
        }
        entry.streaming = streaming;
    }

    /// Recorder confirmed an open file. Returns `true` when a stop arrived
    /// while the start was pending, in which case the caller must begin
    /// stopping immediately.
    pub fn on_record_started(&self, id: &str, path: &Path) -> bool {
        let mut map = self.inner.write().unwrap();
        let entry = map.entry(id.to_string()).or_default();
        entry.last_file = Some(path.to_path_buf());
        entry.recording = true;
        entry.start_pending = false;
        if entry.stop_pending {
            entry.stop_pending = false;
            log::info!("{}: stop was requested before start confirmed, stopping now", id);
            true
        } else {
            false
        }
    }

    /// Recorder is no longer writing. `last_file` is deliberately kept.
    pub fn on_record_stopped(&self, id: &str) {
        let mut map = self.inner.write().unwrap();
        let entry = map.entry(id.to_string()).or_default();
        entry.recording = false;
        entry.start_pending = false;
        entry.stop_pending = false;
    }

    /// Atomically stage a record-start.
    pub fn try_begin_start(&self, id: &str) -> StartDecision {
        let mut map = self.inner.write().unwrap();
        let entry = map.entry(id.to_string()).or_default();
        if entry.recording {
            return StartDecision::AlreadyRecording {
                file: entry.last_file.clone(),
            };
        }
        if entry.start_pending {
            return StartDecision::AlreadyPending;
        }
        entry.start_pending = true;
        entry.stop_pending = false;
        entry.last_file = None;
        StartDecision::Proceed
    }

    /// Atomically stage a record-stop. When the start is still pending the
    /// stop is remembered so `on_record_started` can bounce it back.
    pub fn try_begin_stop(&self, id: &str) -> StopDecision {
        let mut map = self.inner.write().unwrap();
        let entry = map.entry(id.to_string()).or_default();
        if !entry.recording && !entry.start_pending {
            return StopDecision::NotRecording;
        }
        if entry.start_pending && !entry.recording {
            entry.stop_pending = true;
        }
        StopDecision::Proceed
    }

    /// Roll back a staged start that was never confirmed (the HTTP wait
    /// timed out), so a later start can retry instead of reporting
    /// "already pending" forever.
    pub fn cancel_start(&self, id: &str) {
        let mut map = self.inner.write().unwrap();
        if let Some(entry) = map.get_mut(id) {
            if entry.start_pending && !entry.recording {
                entry.start_pending = false;
                entry.stop_pending = false;
            }
        }
    }

    pub fn last_file(&self, id: &str) -> Option<PathBuf> {
        self.inner
            .read()
            .unwrap()
            .get(id)
            .and_then(|e| e.last_file.clone())
    }

    /// Lock-covered copy of one entry.
    pub fn snapshot_one(&self, id: &str) -> Option<StreamState> {
        self.inner.read().unwrap().get(id).cloned()
    }

    /// Lock-covered copy of every entry, sorted by id for stable output.
    pub fn snapshot(&self) -> Vec<(StreamId, StreamState)> {
        let map = self.inner.read().unwrap();
        let mut entries: Vec<_> = map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}
