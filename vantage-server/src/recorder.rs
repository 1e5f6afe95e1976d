//! Per-stream recorder worker.
//!
//! One worker per stream consumes the capture output on a single channel
//! carrying packets, stream-info updates and start/stop commands, in that
//! arrival order. While idle it maintains the pre-roll ring; a start drains
//! that ring into a freshly opened MP4 so the file begins pre-roll seconds
//! before the command. A stop arms the post-roll deadline, reports the stop
//! to the registry right away (so the control plane is not held hostage by
//! tail buffering) and keeps writing until the deadline fires, then
//! finalizes the container.
//!
//! Timestamps are rebased so the first written packet sits near t=0 of the
//! output: the first known pts (or dts) becomes the zero point and
//! everything is rescaled from the packet's own time base into whatever
//! time base the muxer chose for the output stream.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use thiserror::Error;
use tokio_graceful_shutdown::SubsystemHandle;

use vantage_core::time::rescale;
use vantage_core::{EncodedPacket, PreRollBuffer, StreamRegistry};

use crate::media::{ContainerOpener, ContainerWriter, StreamInfo, WritePacket};

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("Recorder thread for '{0}' ended abnormally")]
    ThreadFailed(String),
}

/// Everything the capture side and the control plane can tell a recorder.
pub enum RecorderMsg {
    Packet(EncodedPacket),
    Info(StreamInfo),
    Start,
    Stop,
}

#[derive(Debug, Clone)]
pub struct RecorderSettings {
    pub pre_roll_seconds: f64,
    pub post_roll_seconds: f64,
    pub folder_base: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecState {
    Idle,
    Recording,
    Stopping,
}

/// The recording state machine, kept separate from the thread shell so the
/// whole lifecycle can be driven synchronously in tests.
struct RecorderEngine<O: ContainerOpener> {
    stream_id: String,
    settings: RecorderSettings,
    opener: O,
    registry: StreamRegistry,
    prebuffer: PreRollBuffer,
    info: Option<StreamInfo>,
    state: RecState,
    writer: Option<O::Writer>,
    current_file: Option<PathBuf>,
    /// Media timestamp of the first written packet; the output's zero
    /// point.
    rec_start_ts: Option<i64>,
    finalize_at: Option<Instant>,
}

impl<O: ContainerOpener> RecorderEngine<O> {
    fn new(stream_id: &str, settings: RecorderSettings, opener: O, registry: StreamRegistry) -> Self {
        RecorderEngine {
            stream_id: stream_id.to_string(),
            prebuffer: PreRollBuffer::new(settings.pre_roll_seconds),
            settings,
            opener,
            registry,
            info: None,
            state: RecState::Idle,
            writer: None,
            current_file: None,
            rec_start_ts: None,
            finalize_at: None,
        }
    }

    fn handle(&mut self, msg: RecorderMsg, now: Instant) {
        match msg {
            RecorderMsg::Packet(packet) => match self.state {
                RecState::Idle => self.prebuffer.push(packet),
                // The post-roll window keeps absorbing packets too.
                RecState::Recording | RecState::Stopping => self.write_packet(&packet),
            },
            RecorderMsg::Info(info) => {
                log::debug!("{}: stream info ready ({:?})", self.stream_id, info.codec_id);
                self.info = Some(info);
            }
            RecorderMsg::Start => self.start(now),
            RecorderMsg::Stop => self.begin_stop(now),
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.finalize_at
    }

    /// Fire the post-roll deadline if it has passed.
    fn poll_deadline(&mut self, now: Instant) {
        if let Some(at) = self.finalize_at {
            if now >= at && self.state == RecState::Stopping {
                self.finalize();
            }
        }
    }

    fn start(&mut self, now: Instant) {
        if self.state != RecState::Idle {
            log::info!("{}: already recording", self.stream_id);
            return;
        }
        let Some(info) = self.info.clone() else {
            log::warn!("{}: stream info not ready, record start ignored", self.stream_id);
            return;
        };
        if !info.is_usable() {
            log::warn!("{}: stream info not ready, record start ignored", self.stream_id);
            return;
        }

        let filename = format!(
            "rec_{}_{}.mp4",
            self.stream_id,
            Local::now().format("%Y-%m-%d_%H-%M-%S")
        );
        let path = self.settings.folder_base.join(filename);

        let writer = match self.opener.open(&path, &info) {
            Ok(writer) => writer,
            Err(e) => {
                // The opener leaves nothing behind on failure; stay idle
                // and let the control plane's wait time out.
                log::error!("{}: cannot start recording: {}", self.stream_id, e);
                return;
            }
        };

        self.writer = Some(writer);
        self.current_file = Some(path.clone());
        self.state = RecState::Recording;
        self.rec_start_ts = None;

        let backlog: Vec<EncodedPacket> = self.prebuffer.drain().collect();
        let backlog_len = backlog.len();
        for packet in &backlog {
            self.write_packet(packet);
        }

        log::info!(
            "{}: recording -> {} ({} pre-roll packets)",
            self.stream_id,
            path.display(),
            backlog_len
        );

        if self.registry.on_record_started(&self.stream_id, &path) {
            // A stop raced the start; honor it now.
            self.begin_stop(now);
        }
    }

    fn begin_stop(&mut self, now: Instant) {
        match self.state {
            RecState::Idle => {
                log::debug!("{}: record stop ignored, not recording", self.stream_id);
            }
            RecState::Stopping => {
                log::debug!("{}: already stopping", self.stream_id);
            }
            RecState::Recording => {
                let post = self.settings.post_roll_seconds;
                if post <= 0.0 {
                    self.finalize();
                    self.registry.on_record_stopped(&self.stream_id);
                } else {
                    self.state = RecState::Stopping;
                    self.finalize_at = Some(now + Duration::from_secs_f64(post));
                    // Report the stop right away; the file stays open for
                    // the post-roll window.
                    self.registry.on_record_stopped(&self.stream_id);
                    log::info!("{}: stopping, {:.1}s post-roll", self.stream_id, post);
                }
            }
        }
    }

    fn write_packet(&mut self, packet: &EncodedPacket) {
        let rec_start = match self.rec_start_ts {
            Some(ts) => Some(ts),
            None => {
                // Packets with no usable timestamp do not move the zero
                // point.
                self.rec_start_ts = packet.media_ts();
                self.rec_start_ts
            }
        };

        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        let out_tb = writer.time_base();
        let src_tb = packet.time_base;

        let rebase = |ts: Option<i64>| match (ts, rec_start) {
            (Some(t), Some(start)) => Some(rescale(t - start, src_tb, out_tb)),
            _ => None,
        };

        let out = WritePacket {
            data: &packet.data,
            pts: rebase(packet.pts),
            dts: rebase(packet.dts),
            duration: if packet.duration > 0 {
                rescale(packet.duration, src_tb, out_tb)
            } else {
                0
            },
            key: packet.key,
        };

        if let Err(e) = writer.write(out) {
            // A bad packet must not end the recording.
            log::error!("{}: error writing frame: {}", self.stream_id, e);
        }
    }

    fn finalize(&mut self) {
        self.finalize_at = None;
        self.rec_start_ts = None;
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.finalize() {
                log::error!("{}: finalize failed: {}", self.stream_id, e);
            }
            if let Some(path) = self.current_file.take() {
                log::info!("{}: recording finished -> {}", self.stream_id, path.display());
            }
        }
        self.state = RecState::Idle;
    }

    /// Process shutdown: an in-flight file is finalized, never abandoned.
    fn shutdown(&mut self) {
        if self.state != RecState::Idle {
            self.finalize();
            self.registry.on_record_stopped(&self.stream_id);
        }
    }
}

pub struct RecorderWorker<O: ContainerOpener> {
    stream_id: String,
    settings: RecorderSettings,
    opener: O,
    registry: StreamRegistry,
    rx: mpsc::Receiver<RecorderMsg>,
    abort: Arc<AtomicBool>,
}

impl<O: ContainerOpener> RecorderWorker<O> {
    pub fn new(
        stream_id: &str,
        settings: RecorderSettings,
        opener: O,
        registry: StreamRegistry,
    ) -> (Self, mpsc::Sender<RecorderMsg>) {
        let (tx, rx) = mpsc::channel();
        let worker = RecorderWorker {
            stream_id: stream_id.to_string(),
            settings,
            opener,
            registry,
            rx,
            abort: Arc::new(AtomicBool::new(false)),
        };
        (worker, tx)
    }

    pub async fn run(self, subsys: SubsystemHandle) -> Result<(), RecorderError> {
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
                r.map_err(|_| RecorderError::ThreadFailed(stream_id))
            },
        }
    }

    fn run_blocking(self) {
        // Upper bound on how long the loop stays blind to the abort flag.
        const IDLE_TICK: Duration = Duration::from_millis(100);

        // The container writer must live and die on this thread, so the
        // engine is built here rather than carried across the spawn.
        let mut engine =
            RecorderEngine::new(&self.stream_id, self.settings, self.opener, self.registry);

        log::debug!("{}: recorder started", self.stream_id);

        while !self.abort.load(Ordering::Acquire) {
            let now = Instant::now();
            engine.poll_deadline(now);

            let timeout = engine
                .next_deadline()
                .map(|at| at.saturating_duration_since(now).min(IDLE_TICK))
                .unwrap_or(IDLE_TICK);

            match self.rx.recv_timeout(timeout) {
                Ok(msg) => engine.handle(msg, Instant::now()),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        engine.shutdown();
        log::debug!("{}: recorder finished", self.stream_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaError, StreamInfo};
    use std::path::Path;
    use std::sync::Mutex;
    use vantage_core::TimeBase;

    #[derive(Debug, Clone, PartialEq)]
    enum WriterEvent {
        Opened(String),
        Wrote {
            pts: Option<i64>,
            dts: Option<i64>,
            duration: i64,
            key: bool,
        },
        Finalized,
    }

    #[derive(Clone, Default)]
    struct FakeOpener {
        events: Arc<Mutex<Vec<WriterEvent>>>,
        fail_open: Arc<AtomicBool>,
        fail_write: Arc<AtomicBool>,
    }

    struct FakeWriter {
        events: Arc<Mutex<Vec<WriterEvent>>>,
        fail_write: Arc<AtomicBool>,
    }

    impl ContainerOpener for FakeOpener {
        type Writer = FakeWriter;

        fn open(&self, path: &Path, _info: &StreamInfo) -> Result<FakeWriter, MediaError> {
            if self.fail_open.load(Ordering::Acquire) {
                return Err(MediaError::OpenOutput {
                    path: path.display().to_string(),
                    reason: "disk on fire".to_string(),
                });
            }
            self.events
                .lock()
                .unwrap()
                .push(WriterEvent::Opened(path.display().to_string()));
            Ok(FakeWriter {
                events: self.events.clone(),
                fail_write: self.fail_write.clone(),
            })
        }
    }

    impl ContainerWriter for FakeWriter {
        fn time_base(&self) -> TimeBase {
            // Millisecond output ticks keep expectations readable.
            TimeBase::new(1, 1000)
        }

        fn write(&mut self, packet: WritePacket<'_>) -> Result<(), MediaError> {
            if self.fail_write.load(Ordering::Acquire) {
                return Err(MediaError::Muxer("write failed".to_string()));
            }
            self.events.lock().unwrap().push(WriterEvent::Wrote {
                pts: packet.pts,
                dts: packet.dts,
                duration: packet.duration,
                key: packet.key,
            });
            Ok(())
        }

        fn finalize(&mut self) -> Result<(), MediaError> {
            self.events.lock().unwrap().push(WriterEvent::Finalized);
            Ok(())
        }
    }

    fn test_info() -> StreamInfo {
        StreamInfo {
            stream_id: "cam01".to_string(),
            codec_id: ffmpeg_next::codec::Id::H264,
            time_base: TimeBase::RTP_90KHZ,
            width: 1280,
            height: 720,
            extradata: vec![1, 2, 3],
        }
    }

    fn test_packet(pts: Option<i64>, key: bool) -> EncodedPacket {
        EncodedPacket {
            stream_id: "cam01".to_string(),
            data: vec![0u8; 16],
            pts,
            dts: pts,
            duration: 3000,
            key,
            time_base: TimeBase::RTP_90KHZ,
        }
    }

    fn engine_with(
        pre_roll: f64,
        post_roll: f64,
    ) -> (RecorderEngine<FakeOpener>, FakeOpener, StreamRegistry) {
        let opener = FakeOpener::default();
        let registry = StreamRegistry::new();
        registry.register("cam01");
        let engine = RecorderEngine::new(
            "cam01",
            RecorderSettings {
                pre_roll_seconds: pre_roll,
                post_roll_seconds: post_roll,
                folder_base: PathBuf::from("/recordings"),
            },
            opener.clone(),
            registry.clone(),
        );
        (engine, opener, registry)
    }

    fn writes(opener: &FakeOpener) -> Vec<WriterEvent> {
        opener.events.lock().unwrap().clone()
    }

    #[test]
    fn start_without_info_is_a_noop() {
        let (mut engine, opener, registry) = engine_with(5.0, 0.0);
        engine.handle(RecorderMsg::Start, Instant::now());
        assert_eq!(engine.state, RecState::Idle);
        assert!(writes(&opener).is_empty());
        assert!(!registry.snapshot_one("cam01").unwrap().recording);
    }

    #[test]
    fn start_drains_preroll_rebased_to_zero() {
        let (mut engine, opener, registry) = engine_with(5.0, 0.0);
        let now = Instant::now();
        engine.handle(RecorderMsg::Info(test_info()), now);
        // Pre-roll packets at 0 s, 0.5 s, 1 s media time.
        for i in 0..3 {
            engine.handle(RecorderMsg::Packet(test_packet(Some(i * 45_000), i == 0)), now);
        }
        engine.handle(RecorderMsg::Start, now);

        let events = writes(&opener);
        assert!(matches!(&events[0], WriterEvent::Opened(p) if p.contains("rec_cam01_")));
        // 90 kHz input rebased into millisecond output ticks, zeroed on the
        // first packet.
        assert_eq!(
            &events[1..],
            &[
                WriterEvent::Wrote { pts: Some(0), dts: Some(0), duration: 33, key: true },
                WriterEvent::Wrote { pts: Some(500), dts: Some(500), duration: 33, key: false },
                WriterEvent::Wrote { pts: Some(1000), dts: Some(1000), duration: 33, key: false },
            ]
        );

        let state = registry.snapshot_one("cam01").unwrap();
        assert!(state.recording);
        assert!(state.last_file.is_some());
        assert_eq!(engine.prebuffer.len(), 0);
    }

    #[test]
    fn second_start_is_a_noop() {
        let (mut engine, opener, _registry) = engine_with(5.0, 0.0);
        let now = Instant::now();
        engine.handle(RecorderMsg::Info(test_info()), now);
        engine.handle(RecorderMsg::Start, now);
        engine.handle(RecorderMsg::Start, now);
        let opened = writes(&opener)
            .iter()
            .filter(|e| matches!(e, WriterEvent::Opened(_)))
            .count();
        assert_eq!(opened, 1);
    }

    #[test]
    fn zero_postroll_finalizes_immediately() {
        let (mut engine, opener, registry) = engine_with(5.0, 0.0);
        let now = Instant::now();
        engine.handle(RecorderMsg::Info(test_info()), now);
        engine.handle(RecorderMsg::Start, now);
        engine.handle(RecorderMsg::Stop, now);

        assert_eq!(engine.state, RecState::Idle);
        assert_eq!(writes(&opener).last(), Some(&WriterEvent::Finalized));
        let state = registry.snapshot_one("cam01").unwrap();
        assert!(!state.recording);
        // The file survives the stop for clients that query afterwards.
        assert!(state.last_file.is_some());
    }

    #[test]
    fn deferred_stop_keeps_writing_through_postroll() {
        let (mut engine, opener, registry) = engine_with(5.0, 0.5);
        let now = Instant::now();
        engine.handle(RecorderMsg::Info(test_info()), now);
        engine.handle(RecorderMsg::Start, now);
        engine.handle(RecorderMsg::Stop, now);

        // Stop is visible immediately even though the file is still open.
        assert!(!registry.snapshot_one("cam01").unwrap().recording);
        assert_eq!(engine.state, RecState::Stopping);

        // A packet arriving inside the post-roll window is written.
        engine.handle(RecorderMsg::Packet(test_packet(Some(45_000), false)), now);
        assert!(matches!(writes(&opener).last(), Some(WriterEvent::Wrote { .. })));

        // Deadline not reached yet.
        engine.poll_deadline(now + Duration::from_millis(100));
        assert_eq!(engine.state, RecState::Stopping);

        // Deadline passed: trailer written, back to idle.
        engine.poll_deadline(now + Duration::from_millis(600));
        assert_eq!(engine.state, RecState::Idle);
        assert_eq!(writes(&opener).last(), Some(&WriterEvent::Finalized));
    }

    #[test]
    fn stop_while_stopping_is_a_noop() {
        let (mut engine, opener, _registry) = engine_with(5.0, 0.5);
        let now = Instant::now();
        engine.handle(RecorderMsg::Info(test_info()), now);
        engine.handle(RecorderMsg::Start, now);
        engine.handle(RecorderMsg::Stop, now);
        let first_deadline = engine.next_deadline();
        engine.handle(RecorderMsg::Stop, now + Duration::from_millis(200));
        // The second stop must not re-arm the timer.
        assert_eq!(engine.next_deadline(), first_deadline);
        assert!(!writes(&opener).iter().any(|e| *e == WriterEvent::Finalized));
    }

    #[test]
    fn stop_when_idle_is_a_noop() {
        let (mut engine, opener, _registry) = engine_with(5.0, 0.5);
        engine.handle(RecorderMsg::Stop, Instant::now());
        assert!(writes(&opener).is_empty());
        assert_eq!(engine.state, RecState::Idle);
    }

    #[test]
    fn write_errors_do_not_stop_the_recording() {
        let (mut engine, opener, _registry) = engine_with(5.0, 0.0);
        let now = Instant::now();
        engine.handle(RecorderMsg::Info(test_info()), now);
        engine.handle(RecorderMsg::Start, now);

        opener.fail_write.store(true, Ordering::Release);
        engine.handle(RecorderMsg::Packet(test_packet(Some(0), true)), now);
        assert_eq!(engine.state, RecState::Recording);

        opener.fail_write.store(false, Ordering::Release);
        engine.handle(RecorderMsg::Packet(test_packet(Some(45_000), false)), now);
        assert!(matches!(writes(&opener).last(), Some(WriterEvent::Wrote { .. })));
    }

    #[test]
    fn open_failure_rolls_back_to_idle() {
        let (mut engine, opener, registry) = engine_with(5.0, 0.0);
        opener.fail_open.store(true, Ordering::Release);
        let now = Instant::now();
        engine.handle(RecorderMsg::Info(test_info()), now);
        engine.handle(RecorderMsg::Start, now);

        assert_eq!(engine.state, RecState::Idle);
        assert!(engine.writer.is_none());
        assert!(!registry.snapshot_one("cam01").unwrap().recording);
    }

    #[test]
    fn stop_staged_before_start_confirmation_bounces() {
        let (mut engine, opener, registry) = engine_with(5.0, 0.0);
        let now = Instant::now();
        engine.handle(RecorderMsg::Info(test_info()), now);

        // Control plane staged start then stop before the recorder ran.
        registry.try_begin_start("cam01");
        registry.try_begin_stop("cam01");

        engine.handle(RecorderMsg::Start, now);

        // The recording was opened, confirmed and immediately stopped.
        assert_eq!(engine.state, RecState::Idle);
        assert_eq!(writes(&opener).last(), Some(&WriterEvent::Finalized));
        let state = registry.snapshot_one("cam01").unwrap();
        assert!(!state.recording);
        assert!(state.last_file.is_some());
    }

    #[test]
    fn unknown_timestamps_do_not_move_the_zero_point() {
        let (mut engine, opener, _registry) = engine_with(5.0, 0.0);
        let now = Instant::now();
        engine.handle(RecorderMsg::Info(test_info()), now);
        engine.handle(RecorderMsg::Start, now);

        engine.handle(RecorderMsg::Packet(test_packet(None, false)), now);
        engine.handle(RecorderMsg::Packet(test_packet(Some(90_000), true)), now);
        engine.handle(RecorderMsg::Packet(test_packet(Some(135_000), false)), now);

        let wrote: Vec<_> = writes(&opener)
            .into_iter()
            .filter_map(|e| match e {
                WriterEvent::Wrote { pts, .. } => Some(pts),
                _ => None,
            })
            .collect();
        // Untimestamped packet passes through unstamped; the first known
        // pts becomes zero.
        assert_eq!(wrote, vec![None, Some(0), Some(500)]);
    }

    #[test]
    fn shutdown_finalizes_in_flight_file() {
        let (mut engine, opener, registry) = engine_with(5.0, 30.0);
        let now = Instant::now();
        engine.handle(RecorderMsg::Info(test_info()), now);
        engine.handle(RecorderMsg::Start, now);
        engine.shutdown();

        assert_eq!(writes(&opener).last(), Some(&WriterEvent::Finalized));
        assert!(!registry.snapshot_one("cam01").unwrap().recording);
    }

    #[test]
    fn worker_thread_processes_commands() {
        let opener = FakeOpener::default();
        let registry = StreamRegistry::new();
        registry.register("cam01");
        let (worker, tx) = RecorderWorker::new(
            "cam01",
            RecorderSettings {
                pre_roll_seconds: 1.0,
                post_roll_seconds: 0.0,
                folder_base: PathBuf::from("/recordings"),
            },
            opener.clone(),
            registry.clone(),
        );
        let abort = worker.abort.clone();
        let thread = std::thread::spawn(move || worker.run_blocking());

        tx.send(RecorderMsg::Info(test_info())).unwrap();
        tx.send(RecorderMsg::Packet(test_packet(Some(0), true))).unwrap();
        tx.send(RecorderMsg::Start).unwrap();

        // The started recording becomes visible to a registry poller.
        let mut confirmed = false;
        for _ in 0..100 {
            if registry.last_file("cam01").is_some() {
                confirmed = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(confirmed);

        tx.send(RecorderMsg::Stop).unwrap();
        abort.store(true, Ordering::Release);
        thread.join().unwrap();
        assert_eq!(writes(&opener).last(), Some(&WriterEvent::Finalized));
    }
}
