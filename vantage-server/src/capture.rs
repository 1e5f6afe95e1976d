//! Per-stream capture worker.
//!
//! Each configured stream gets one worker owning a dedicated demux thread.
//! While enabled it keeps an RTSP session open, forwards every demuxed
//! video packet (and stream-info updates) to its recorder in demux order,
//! and reports online/offline edges to the registry. Connection failures
//! are never fatal: the worker backs off for five seconds and tries again,
//! publishing placeholder preview frames so an attached display has
//! something to show.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::broadcast;
use tokio_graceful_shutdown::SubsystemHandle;

use vantage_core::StreamRegistry;

use crate::media::{MediaSource, PlaceholderKind, PreviewFrame, SourceEvent, SourceOpener};
use crate::recorder::RecorderMsg;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Capture thread for '{0}' ended abnormally")]
    ThreadFailed(String),
}

/// Handle the control plane uses to switch a capture worker on and off.
/// Both calls are idempotent and never block; the worker reacts at its
/// next loop point.
#[derive(Clone)]
pub struct CaptureControl {
    stream_id: String,
    enabled: Arc<AtomicBool>,
}

impl CaptureControl {
    pub fn enable(&self) {
        if !self.enabled.swap(true, Ordering::AcqRel) {
            log::info!("{}: streaming enabled", self.stream_id);
        }
    }

    pub fn disable(&self) {
        if self.enabled.swap(false, Ordering::AcqRel) {
            log::info!("{}: streaming disabled", self.stream_id);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

pub struct CaptureWorker<O: SourceOpener> {
    stream_id: String,
    url: String,
    opener: O,
    control: CaptureControl,
    abort: Arc<AtomicBool>,
    registry: StreamRegistry,
    recorder_tx: std::sync::mpsc::Sender<RecorderMsg>,
    preview_tx: broadcast::Sender<PreviewFrame>,
    decode_preview: bool,
    online: bool,
    /// How long to back off after a failed open or read. Shortened in
    /// tests.
    reconnect_delay: Duration,
    /// Poll cadence while disabled.
    idle_poll: Duration,
}

impl<O: SourceOpener> CaptureWorker<O> {
    pub fn new(
        stream_id: &str,
        url: &str,
        opener: O,
        registry: StreamRegistry,
        recorder_tx: std::sync::mpsc::Sender<RecorderMsg>,
        preview_tx: broadcast::Sender<PreviewFrame>,
        decode_preview: bool,
    ) -> (Self, CaptureControl) {
        let control = CaptureControl {
            stream_id: stream_id.to_string(),
            enabled: Arc::new(AtomicBool::new(false)),
        };
        let worker = CaptureWorker {
            stream_id: stream_id.to_string(),
            url: url.to_string(),
            opener,
            control: control.clone(),
            abort: Arc::new(AtomicBool::new(false)),
            registry,
            recorder_tx,
            preview_tx,
            decode_preview,
            online: false,
            reconnect_delay: Duration::from_secs(5),
            idle_poll: Duration::from_millis(100),
        };
        (worker, control)
    }

    pub async fn run(self, subsys: SubsystemHandle) -> Result<(), CaptureError> {
        let stream_id = self.stream_id.clone();
        let abort = self.abort.clone();
        let mut thread = tokio::task::spawn_blocking(move || self.run_blocking());

        tokio::select! { biased;
            _ = subsys.on_shutdown_requested() => {
                abort.store(true, Ordering::Release);
                let _ = (&mut thread).await;
                Ok(())
            },
            r = &mut thread => {
                r.map_err(|_| CaptureError::ThreadFailed(stream_id))
            },
        }
    }

    fn run_blocking(mut self) {
        log::debug!("{}: capture thread started", self.stream_id);
        self.publish_placeholder(PlaceholderKind::NoSignal);

        let mut source: Option<O::Source> = None;

        while !self.abort.load(Ordering::Acquire) {
            if !self.control.is_enabled() {
                if source.take().is_some() {
                    log::info!("{}: input closed", self.stream_id);
                }
                self.set_online(false);
                self.publish_placeholder(PlaceholderKind::NoSignal);
                std::thread::sleep(self.idle_poll);
                continue;
            }

            if source.is_none() {
                self.publish_placeholder(PlaceholderKind::Acquiring);
                match self
                    .opener
                    .open(&self.stream_id, &self.url, self.decode_preview)
                {
                    Ok(opened) => {
                        self.set_online(true);
                        // The recorder must know the stream parameters
                        // before the first packet of the session.
                        let _ = self.recorder_tx.send(RecorderMsg::Info(opened.info()));
                        source = Some(opened);
                    }
                    Err(e) => {
                        log::warn!(
                            "{}: open failed ({}), retrying in {:?}",
                            self.stream_id,
                            e,
                            self.reconnect_delay
                        );
                        self.set_online(false);
                        self.backoff();
                        continue;
                    }
                }
            }

            let Some(open_source) = source.as_mut() else {
                continue;
            };
            match open_source.read() {
                Ok(SourceEvent::Packet(packet)) => {
                    if self.recorder_tx.send(RecorderMsg::Packet(packet)).is_err() {
                        // Recorder is gone; only happens during shutdown.
                        break;
                    }
                }
                Ok(SourceEvent::InfoChanged(info)) => {
                    let _ = self.recorder_tx.send(RecorderMsg::Info(info));
                }
                Ok(SourceEvent::Frame(frame)) => {
                    // Nobody listening is fine.
                    let _ = self.preview_tx.send(frame);
                }
                Err(e) => {
                    log::warn!("{}: read error ({}), reconnecting", self.stream_id, e);
                    source = None;
                    self.set_online(false);
                }
            }
        }

        self.set_online(false);
        log::debug!("{}: capture thread finished", self.stream_id);
    }

    fn set_online(&mut self, online: bool) {
        if self.online != online {
            self.online = online;
            self.registry.mark_streaming(&self.stream_id, online);
            log::info!(
                "{}: stream {}",
                self.stream_id,
                if online { "online" } else { "offline" }
            );
        }
    }

    /// Wait out the reconnect delay, publishing a failure placeholder at
    /// no more than 5 fps. Cut short by disable or shutdown.
    fn backoff(&mut self) {
        let started = Instant::now();
        let frame_interval = Duration::from_millis(200);
        let mut last_emit = started - frame_interval;

        while !self.abort.load(Ordering::Acquire) && self.control.is_enabled() {
            if started.elapsed() >= self.reconnect_delay {
                break;
            }
            if last_emit.elapsed() >= frame_interval {
                self.publish_placeholder(PlaceholderKind::StreamFailed);
                last_emit = Instant::now();
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn publish_placeholder(&self, label: PlaceholderKind) {
        let _ = self.preview_tx.send(PreviewFrame::Placeholder {
            stream_id: self.stream_id.clone(),
            label,
        });
    }
}
