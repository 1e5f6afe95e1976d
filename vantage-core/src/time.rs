//! Rational time bases and timestamp rescaling.

/// A rational time unit: one tick equals `num/den` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBase {
    pub num: i32,
    pub den: i32,
}

impl TimeBase {
    pub const fn new(num: i32, den: i32) -> Self {
        TimeBase { num, den }
    }

    /// The RTP clock used by most RTSP video streams.
    pub const RTP_90KHZ: TimeBase = TimeBase::new(1, 90_000);

    /// A time base is usable once both terms are positive.
    pub fn is_valid(&self) -> bool {
        self.num > 0 && self.den > 0
    }

    /// Tick count expressed in seconds.
    pub fn to_seconds(&self, ticks: i64) -> f64 {
        ticks as f64 * self.num as f64 / self.den as f64
    }
}

impl Default for TimeBase {
    fn default() -> Self {
        TimeBase::new(1, 1)
    }
}

impl std::fmt::Display for TimeBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Convert `value` ticks of `from` into ticks of `to`, rounding to the
/// nearest tick with ties away from zero. This matches the muxer's own
/// rescaling rule so rebased timestamps land where the container expects
/// them.
pub fn rescale(value: i64, from: TimeBase, to: TimeBase) -> i64 {
    let num = value as i128 * from.num as i128 * to.den as i128;
    let den = from.den as i128 * to.num as i128;
    debug_assert!(den > 0, "rescale with invalid time base {from} -> {to}");

    let half = den / 2;
    let out = if num >= 0 {
        (num + half) / den
    } else {
        (num - half) / den
    };
    out as i64
}
