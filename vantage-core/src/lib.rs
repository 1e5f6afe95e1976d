//! # Vantage Core
//!
//! Runtime-independent engine logic for the vantage network video recorder:
//!
//! - [`time`]: rational time bases and timestamp rescaling
//! - [`packet`]: the encoded-packet data model shared by capture and
//!   recording
//! - [`prebuffer`]: the time-bounded pre-roll ring each recorder keeps
//!   while idle
//! - [`registry`]: the process-wide table of stream ids and their
//!   streaming/recording state
//!
//! Everything here is plain synchronous Rust so it can be unit tested
//! without a demuxer or an async runtime; `vantage-server` supplies the
//! tokio workers, the HTTP control plane and the ffmpeg-backed media I/O.

pub mod packet;
pub mod prebuffer;
pub mod registry;
pub mod time;

pub use packet::{EncodedPacket, StreamId};
pub use prebuffer::PreRollBuffer;
pub use registry::{StartDecision, StopDecision, StreamRegistry, StreamState};
pub use time::TimeBase;
