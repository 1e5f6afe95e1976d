//! Pre-roll ring buffer.
//!
//! While a recorder is idle, every packet lands here so that a later record
//! command can reach back `pre_roll_seconds` into the past. The ring is
//! bounded by media time, not count: after each append the front is trimmed
//! while the span between the newest and oldest timestamped packet exceeds
//! the window. Packets whose pts and dts are both unknown cannot be placed
//! on the timeline; they stay put until a timestamped head packet becomes
//! evictable again. A hard count cap keeps pathological all-unknown input
//! from growing the ring without bound.

use std::collections::VecDeque;

use crate::packet::EncodedPacket;

/// Safety net for streams that never produce usable timestamps.
const MAX_PACKETS: usize = 10_000;

#[derive(Debug)]
pub struct PreRollBuffer {
    window_seconds: f64,
    packets: VecDeque<EncodedPacket>,
}

impl PreRollBuffer {
    pub fn new(window_seconds: f64) -> Self {
        PreRollBuffer {
            window_seconds: window_seconds.max(0.0),
            packets: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Append a packet and trim the front back inside the time window.
    pub fn push(&mut self, packet: EncodedPacket) {
        self.packets.push_back(packet);

        if let Some(last_sec) = self.packets.back().and_then(|p| p.media_seconds()) {
            while let Some(first) = self.packets.front() {
                // An unknown-timestamp head blocks trimming until the next
                // append reconsiders it.
                let Some(first_sec) = first.media_seconds() else {
                    break;
                };
                if last_sec - first_sec > self.window_seconds {
                    self.packets.pop_front();
                } else {
                    break;
                }
            }
        }

        if self.packets.len() > MAX_PACKETS {
            log::warn!(
                "pre-roll ring hit the {} packet cap, dropping oldest",
                MAX_PACKETS
            );
            while self.packets.len() > MAX_PACKETS {
                self.packets.pop_front();
            }
        }
    }

    /// Hand the buffered packets over in arrival order, leaving the ring
    /// empty. Called when a recording starts so the file begins pre-roll
    /// seconds before the command.
    pub fn drain(&mut self) -> impl Iterator<Item = EncodedPacket> + '_ {
        self.packets.drain(..)
    }

    /// Media-time span currently held, in seconds. Zero when fewer than two
    /// timestamped packets are present.
    pub fn span_seconds(&self) -> f64 {
        let first = self.packets.iter().find_map(|p| p.media_seconds());
        let last = self.packets.iter().rev().find_map(|p| p.media_seconds());
        match (first, last) {
            (Some(f), Some(l)) => (l - f).max(0.0),
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::TimeBase;

    fn pkt(pts: Option<i64>) -> EncodedPacket {
        EncodedPacket {
            stream_id: "cam01".to_string(),
            data: vec![0u8; 4],
            pts,
            dts: None,
            duration: 3000,
            key: false,
            time_base: TimeBase::RTP_90KHZ,
        }
    }

    #[test]
    fn trims_to_window() {
        let mut ring = PreRollBuffer::new(1.0);
        // One packet every 0.5 s of media time.
        for i in 0..10 {
            ring.push(pkt(Some(i * 45_000)));
        }
        // Span must never exceed one second.
        assert!(ring.span_seconds() <= 1.0 + 1e-9);
        // 1 s window at 0.5 s cadence keeps three packets (span exactly 1.0).
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn keeps_everything_inside_window() {
        let mut ring = PreRollBuffer::new(5.0);
        for i in 0..4 {
            ring.push(pkt(Some(i * 90_000)));
        }
        assert_eq!(ring.len(), 4);
    }

    #[test]
    fn unknown_timestamps_do_not_trim() {
        let mut ring = PreRollBuffer::new(1.0);
        ring.push(pkt(Some(0)));
        ring.push(pkt(None));
        ring.push(pkt(None));
        // Untimestamped tail cannot advance the window.
        assert_eq!(ring.len(), 3);
        // A timestamped packet far in the future evicts the old head, but
        // the unknown packets behind it block further trimming.
        ring.push(pkt(Some(10 * 90_000)));
        assert_eq!(ring.len(), 3);
        assert!(ring.packets.front().unwrap().pts.is_none());
    }

    #[test]
    fn zero_window_keeps_only_newest_instant() {
        let mut ring = PreRollBuffer::new(0.0);
        ring.push(pkt(Some(0)));
        ring.push(pkt(Some(90_000)));
        ring.push(pkt(Some(180_000)));
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.packets.front().unwrap().pts, Some(180_000));
    }

    #[test]
    fn count_cap_bounds_pathological_input() {
        let mut ring = PreRollBuffer::new(1.0);
        for _ in 0..(MAX_PACKETS + 50) {
            ring.push(pkt(None));
        }
        assert_eq!(ring.len(), MAX_PACKETS);
    }

    #[test]
    fn drain_preserves_order_and_empties() {
        let mut ring = PreRollBuffer::new(10.0);
        for i in 0..5 {
            ring.push(pkt(Some(i * 9000)));
        }
        let pts: Vec<_> = ring.drain().map(|p| p.pts.unwrap()).collect();
        assert_eq!(pts, vec![0, 9000, 18_000, 27_000, 36_000]);
        assert!(ring.is_empty());
    }
}
