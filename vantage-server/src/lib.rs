//! # Vantage Server
//!
//! Multi-camera network video recorder. One capture worker per configured
//! RTSP stream demuxes encoded video and fans it out to a per-stream
//! recorder that keeps a rolling pre-roll buffer and remuxes start/stop
//! windows into MP4 files, all without re-encoding. An HTTP control plane
//! starts/stops streaming and recording per camera and manages the
//! resulting files.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     vantage-server                       │
//! │  ┌─────────────┐   ┌──────────────┐   ┌───────────────┐  │
//! │  │ HTTP API    │   │ Capture      │   │ Recorder      │  │
//! │  │ (axum)      │   │ (one/stream) │──▶│ (one/stream)  │  │
//! │  └──────┬──────┘   └──────┬───────┘   └───────┬───────┘  │
//! │         │                 │                   │          │
//! │         ▼                 ▼                   ▼          │
//! │  ┌──────────────────────────────────────────────────────┐│
//! │  │        StreamRegistry (vantage-core, RwLock)         ││
//! │  └──────────────────────────────────────────────────────┘│
//! │                                                          │
//! │  Media I/O through trait seams; production impls wrap    │
//! │  ffmpeg-next (RTSP demux in, MP4 mux out).               │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine logic (time bases, pre-roll ring, registry state machine)
//! lives in [`vantage_core`] so it stays testable without a demuxer.

use clap::Parser;
use std::path::PathBuf;

pub mod capture;
pub mod config;
pub mod files;
pub mod media;
pub mod recorder;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Clone, Debug)]
#[command(version, about = "Multi-camera RTSP recorder")]
pub struct Cli {
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    /// Path to the JSON configuration file
    #[arg(long)]
    pub config: PathBuf,
}

impl Cli {
    /// Parse the command line, dropping unrecognized arguments instead of
    /// refusing to start. Returns the dropped arguments so the caller can
    /// log them once the logger is up. Anything else wrong with the
    /// command line (a missing `--config`, a bad value) still prints usage
    /// and exits non-zero.
    pub fn parse_lenient() -> (Self, Vec<String>) {
        Self::parse_lenient_from(std::env::args().collect())
    }

    fn parse_lenient_from(mut argv: Vec<String>) -> (Self, Vec<String>) {
        use clap::error::{ContextKind, ContextValue, ErrorKind};

        let mut ignored = Vec::new();
        loop {
            match Cli::try_parse_from(&argv) {
                Ok(cli) => return (cli, ignored),
                Err(e) if e.kind() == ErrorKind::UnknownArgument => {
                    let unknown = e.get(ContextKind::InvalidArg).and_then(|v| match v {
                        ContextValue::String(s) => Some(s.clone()),
                        _ => None,
                    });
                    let Some(arg) = unknown else { e.exit() };

                    // Drop the offending argument (either bare or in
                    // `--flag=value` form) and try again.
                    let before = argv.len();
                    let assigned = format!("{}=", arg);
                    argv.retain(|a| a != &arg && !a.starts_with(&assigned));
                    if argv.len() == before {
                        e.exit();
                    }
                    ignored.push(arg);
                }
                Err(e) => e.exit(),
            }
        }
    }
}
