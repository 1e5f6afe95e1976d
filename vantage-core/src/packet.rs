//! The encoded-packet data model shared by capture and recording.

use crate::time::TimeBase;

/// Opaque stream identifier from the configuration file. Two ids compare
/// equal iff byte-equal.
pub type StreamId = String;

/// One demuxed video packet, payload copied out of the demuxer (demux
/// buffers are invalidated on the next read, so the copy happens at the
/// capture boundary).
#[derive(Debug, Clone)]
pub struct EncodedPacket {
    pub stream_id: StreamId,
    pub data: Vec<u8>,
    /// Presentation timestamp in `time_base` ticks, if the demuxer knew it.
    pub pts: Option<i64>,
    /// Decode timestamp in `time_base` ticks, if the demuxer knew it.
    pub dts: Option<i64>,
    /// Duration in `time_base` ticks, never negative.
    pub duration: i64,
    pub key: bool,
    pub time_base: TimeBase,
}

impl EncodedPacket {
    /// The packet's position on the media timeline: pts when known,
    /// otherwise dts. `None` when both are unknown.
    pub fn media_ts(&self) -> Option<i64> {
        self.pts.or(self.dts)
    }

    /// `media_ts` converted to seconds via the packet's own time base.
    pub fn media_seconds(&self) -> Option<f64> {
        self.media_ts().map(|ts| self.time_base.to_seconds(ts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkt(pts: Option<i64>, dts: Option<i64>) -> EncodedPacket {
        EncodedPacket {
            stream_id: "cam01".to_string(),
            data: vec![0u8; 8],
            pts,
            dts,
            duration: 0,
            key: false,
            time_base: TimeBase::RTP_90KHZ,
        }
    }

    #[test]
    fn media_ts_prefers_pts() {
        assert_eq!(pkt(Some(10), Some(5)).media_ts(), Some(10));
        assert_eq!(pkt(None, Some(5)).media_ts(), Some(5));
        assert_eq!(pkt(None, None).media_ts(), None);
    }

    #[test]
    fn media_seconds_uses_own_time_base() {
        let p = pkt(Some(90_000), None);
        assert!((p.media_seconds().unwrap() - 1.0).abs() < 1e-9);
    }
}
