//! Segmented sliding window.

use std::collections::VecDeque;
use std::time::Duration;

use super::{LimiterStrategy, StrategyKind};
use crate::ratelimit::clock::{periods, whole_periods};

/// Sliding window approximated by `segments_per_window` fixed segments.
///
/// Every segment still inside the window counts in full towards the limit;
/// a segment's permits come back only once it slides out. One segment per
/// window behaves exactly like [`FixedWindow`](super::FixedWindow).
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    permit_limit: u32,
    segment: Duration,
    /// Absolute index (`now / segment`) of the newest segment
    segment_index: u64,
    /// Permit counts, oldest first; the back is the current segment
    segments: VecDeque<u32>,
    /// Sum of `segments`
    used: u32,
}

impl SlidingWindow {
    /// Create a window split into `segments_per_window` equal segments.
    pub fn new(permit_limit: u32, window: Duration, segments_per_window: u32, now: Duration) -> Self {
        let segments_per_window = segments_per_window.max(1);
        let segment = window / segments_per_window;

        Self {
            permit_limit,
            segment,
            segment_index: whole_periods(now, segment),
            segments: std::iter::repeat(0)
                .take(segments_per_window as usize)
                .collect(),
            used: 0,
        }
    }

    /// Permits counted against the window right now.
    pub fn used(&self) -> u32 {
        self.used
    }

    /// Slide the window forward to the segment containing `now`.
    fn advance(&mut self, now: Duration) {
        let index = whole_periods(now, self.segment);
        if index <= self.segment_index {
            return;
        }

        let shifts = (index - self.segment_index).min(self.segments.len() as u64);
        for _ in 0..shifts {
            if let Some(expired) = self.segments.pop_front() {
                self.used -= expired;
            }
            self.segments.push_back(0);
        }
        self.segment_index = index;
    }
}

impl LimiterStrategy for SlidingWindow {
    fn kind(&self) -> StrategyKind {
        StrategyKind::SlidingWindow
    }

    fn try_acquire(&mut self, now: Duration) -> bool {
        self.advance(now);

        if self.used >= self.permit_limit {
            return false;
        }
        if let Some(current) = self.segments.back_mut() {
            *current += 1;
            self.used += 1;
            return true;
        }
        false
    }

    fn available_permits(&mut self, now: Duration) -> u64 {
        self.advance(now);
        u64::from(self.permit_limit.saturating_sub(self.used))
    }

    fn retry_after(&mut self, now: Duration) -> Option<Duration> {
        self.advance(now);

        if self.used < self.permit_limit {
            return Some(Duration::ZERO);
        }

        // Segment `i` (oldest first) leaves the window once the current
        // segment index has moved `i + 1` positions.
        let needed = self.used - self.permit_limit + 1;
        let mut freed = 0;
        for (offset, count) in self.segments.iter().enumerate() {
            freed += count;
            if freed >= needed {
                let at = periods(self.segment, self.segment_index + 1 + offset as u64);
                return Some(at.saturating_sub(now));
            }
        }
        None
    }

    fn is_idle(&mut self, now: Duration) -> bool {
        self.advance(now);
        self.used == 0
    }
}
