//! Media I/O seams.
//!
//! Capture and recording talk to the demuxer and muxer only through the
//! traits defined here, so the engine logic can be exercised in tests with
//! in-memory fakes while production wires in the ffmpeg-backed
//! implementations from [`crate::media::ffmpeg`].

use std::path::Path;

use thiserror::Error;
use vantage_core::{EncodedPacket, TimeBase};

pub mod ffmpeg;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("Failed to open input '{url}': {reason}")]
    OpenInput { url: String, reason: String },
    #[error("No video stream found in '{0}'")]
    NoVideoStream(String),
    #[error("End of stream")]
    EndOfStream,
    #[error("Failed to create output '{path}': {reason}")]
    OpenOutput { path: String, reason: String },
    #[error("Muxer error: {0}")]
    Muxer(String),
    #[error("Demuxer error: {0}")]
    Demuxer(String),
}

/// Everything the muxer must know to produce a playable file: codec
/// identity and time base from the demuxed stream, dimensions (possibly 0
/// until the first decoded frame refines them) and the out-of-band codec
/// configuration bytes (SPS/PPS for H.264).
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub stream_id: String,
    pub codec_id: ::ffmpeg_next::codec::Id,
    pub time_base: TimeBase,
    pub width: u32,
    pub height: u32,
    pub extradata: Vec<u8>,
}

impl StreamInfo {
    /// Enough is known to open an output file.
    pub fn is_usable(&self) -> bool {
        self.codec_id != ::ffmpeg_next::codec::Id::None && self.time_base.is_valid()
    }
}

/// A decoded or synthetic frame for an attached display sink. Rendering is
/// outside this crate; workers only publish.
#[derive(Debug, Clone)]
pub enum PreviewFrame {
    /// Stand-in emitted while no decodable input is available.
    Placeholder {
        stream_id: String,
        label: PlaceholderKind,
    },
    /// A decoded image, packed plane-by-plane.
    Image {
        stream_id: String,
        width: u32,
        height: u32,
        data: Vec<u8>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderKind {
    NoSignal,
    Acquiring,
    StreamFailed,
}

impl PlaceholderKind {
    pub fn label(&self) -> &'static str {
        match self {
            PlaceholderKind::NoSignal => "NO SIGNAL",
            PlaceholderKind::Acquiring => "ACQUIRING",
            PlaceholderKind::StreamFailed => "STREAM FAILED",
        }
    }
}

/// One observation surfaced by a [`MediaSource`] read.
#[derive(Debug)]
pub enum SourceEvent {
    /// A demuxed video packet, payload copied out of the demuxer.
    Packet(EncodedPacket),
    /// Stream parameters were refined (first decoded frame carries the
    /// observed dimensions and the best available extradata).
    InfoChanged(StreamInfo),
    /// A decoded preview frame; only produced while preview decoding is on.
    Frame(PreviewFrame),
}

/// An open demux session for one RTSP url. Reads block with the session's
/// network timeout; non-video packets are filtered out by the
/// implementation.
///
/// Sources are not `Send`: a session is created and consumed entirely on
/// its capture worker's thread (the ffmpeg contexts behind the production
/// implementation must not migrate).
pub trait MediaSource {
    /// Best currently-known stream parameters. Available from open time,
    /// possibly refined later via [`SourceEvent::InfoChanged`].
    fn info(&self) -> StreamInfo;

    /// Blocking read of the next event in demux order.
    fn read(&mut self) -> Result<SourceEvent, MediaError>;
}

/// Factory for demux sessions; the seam the capture worker is generic over.
pub trait SourceOpener: Send + Sync + 'static {
    type Source: MediaSource;

    /// Open `url` for `stream_id`. `decode_preview` keeps the decoder
    /// alive beyond stream-info refinement so every frame is surfaced to
    /// the display sink.
    fn open(
        &self,
        stream_id: &str,
        url: &str,
        decode_preview: bool,
    ) -> Result<Self::Source, MediaError>;
}

/// A packet ready for the container, already rebased by the recorder into
/// the writer's own time base.
#[derive(Debug)]
pub struct WritePacket<'a> {
    pub data: &'a [u8],
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub duration: i64,
    pub key: bool,
}

/// An open single-video-track container file. Like [`MediaSource`], a
/// writer stays on its recorder's thread for its whole life.
pub trait ContainerWriter {
    /// The output stream's time base as chosen by the muxer after the
    /// header was written. Rebased timestamps must use this.
    fn time_base(&self) -> TimeBase;

    /// Submit one packet to the interleaving writer.
    fn write(&mut self, packet: WritePacket<'_>) -> Result<(), MediaError>;

    /// Write the trailer and close the file. The writer is unusable
    /// afterwards.
    fn finalize(&mut self) -> Result<(), MediaError>;
}

/// Factory for container files; the seam the recorder worker is generic
/// over.
pub trait ContainerOpener: Send + Sync + 'static {
    type Writer: ContainerWriter;

    /// Create the file at `path`, set up one video stream from `info` and
    /// write the container header. Any failure must leave no open handles
    /// behind.
    fn open(&self, path: &Path, info: &StreamInfo) -> Result<Self::Writer, MediaError>;
}
