pub mod aac;
pub mod h264;

use std::time::Duration;

/// Maps RTP timestamps of one track onto elapsed time since the first packet.
///
/// The first observed timestamp becomes zero; later timestamps use wrapping
/// arithmetic so a wrapped 32-bit counter keeps producing forward deltas.
pub(crate) struct Timeline {
    clock_rate: u32,
    base: Option<u32>,
}

impl Timeline {
    pub(crate) fn new(clock_rate: u32) -> Self {
        Self {
            clock_rate,
            base: None,
        }
    }

    pub(crate) fn elapsed(&mut self, timestamp: u32) -> Duration {
        let base = *self.base.get_or_insert(timestamp);
        let ticks = timestamp.wrapping_sub(base) as u64;
        Duration::from_nanos(ticks * 1_000_000_000 / self.clock_rate as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeline_relative_to_first_packet() {
        let mut timeline = Timeline::new(90_000);
        assert_eq!(timeline.elapsed(123_456), Duration::ZERO);
        assert_eq!(timeline.elapsed(123_456 + 90_000), Duration::from_secs(1));
        assert_eq!(timeline.elapsed(123_456 + 45_000), Duration::from_millis(500));
    }

    #[test]
    fn test_timeline_wraparound() {
        let mut timeline = Timeline::new(90_000);
        timeline.elapsed(u32::MAX - 44_999);
        assert_eq!(timeline.elapsed(45_000), Duration::from_secs(1));
    }
}
