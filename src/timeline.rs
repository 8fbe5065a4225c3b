//! The per-channel timeline index.
//!
//! For every enabled channel the timeline keeps a sequence of marks, one
//! per burst of trace arrivals, bucketed at display resolution: arrivals
//! that would land within half a display unit of the previous mark
//! collapse into it by bumping its count. The index is cheap to rebuild
//! and is recomputed from the trace store whenever the zoom configuration
//! changes.

use crate::channel::{ChannelRegistry, CHANNEL_COUNT};
use crate::store::TraceStore;

/// Smallest permitted pixel distance between major ticks.
pub const MARK_SPACING_MIN: f32 = 10.0;

/// The permitted tick scales, in microseconds per tick unit
/// (microseconds, milliseconds, seconds, minutes).
pub const MARK_SCALES: [u32; 4] = [1, 1_000, 1_000_000, 60_000_000];

/// Marks closer than this, in display units, collapse into one.
const COLLAPSE_EPSILON: f32 = 0.5;

/// Mark arrays start at this capacity and double as they grow.
const MARKS_INITIAL_CAPACITY: usize = 32;

/// One bucketed burst of trace arrivals on a channel.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TimelineMark {
    /// Display position, in pixels from the capture start.
    pub pos: f32,
    /// Number of trace lines collapsed into this mark.
    pub count: u32,
}

/// Zoomable index of trace arrival times per channel.
#[derive(Debug)]
pub struct Timeline {
    marks: Vec<Vec<TimelineMark>>,
    mark_spacing: f32,
    mark_scale: u32,
    mark_delta: u32,
    max_count: u32,
    max_pos: f32,
    time_origin: f64,
}

impl Default for Timeline {
    fn default() -> Self {
        Timeline::new()
    }
}

impl Timeline {
    pub fn new() -> Timeline {
        Timeline {
            marks: vec![Vec::new(); CHANNEL_COUNT],
            mark_spacing: 100.0,
            mark_scale: 1_000_000,
            mark_delta: 1,
            max_count: 0,
            max_pos: 0.0,
            time_origin: 0.0,
        }
    }

    /// The marks of one channel, in non-decreasing position order.
    pub fn marks(&self, channel: u8) -> &[TimelineMark] {
        self.marks
            .get(channel as usize)
            .map(|m| m.as_slice())
            .unwrap_or(&[])
    }

    /// Largest collapse count over all marks; scales the mark rendering.
    pub fn max_count(&self) -> u32 {
        self.max_count
    }

    /// Rightmost mark position, in pixels.
    pub fn max_pos(&self) -> f32 {
        self.max_pos
    }

    /// Capture timestamp that maps to position 0.
    pub fn time_origin(&self) -> f64 {
        self.time_origin
    }

    /// Pixels between major ticks.
    pub fn spacing(&self) -> f32 {
        self.mark_spacing
    }

    pub fn set_spacing(&mut self, spacing: f32) {
        self.mark_spacing = spacing.max(MARK_SPACING_MIN);
    }

    /// Microseconds per tick unit; one of [`MARK_SCALES`].
    pub fn scale(&self) -> u32 {
        self.mark_scale
    }

    /// Selects the tick scale. Values outside [`MARK_SCALES`] are
    /// rejected.
    pub fn set_scale(&mut self, scale: u32) -> bool {
        if MARK_SCALES.contains(&scale) {
            self.mark_scale = scale;
            true
        } else {
            false
        }
    }

    /// Tick units per major mark.
    pub fn delta(&self) -> u32 {
        self.mark_delta
    }

    /// Sets the ticks-per-mark divider; accepts `1..=100`.
    pub fn set_delta(&mut self, delta: u32) -> bool {
        if (1..=100).contains(&delta) {
            self.mark_delta = delta;
            true
        } else {
            false
        }
    }

    /// Converts a capture timestamp to a display position under the
    /// current zoom configuration.
    fn position(&self, timestamp: f64) -> f32 {
        ((timestamp - self.time_origin) * self.mark_spacing as f64 * 1e6
            / (self.mark_scale as f64 * self.mark_delta as f64)) as f32
    }

    /// Recomputes every channel's marks from the trace store. With a
    /// `limit` only the most recent `limit` lines are indexed, bounding
    /// rebuild cost on very long captures. Disabled channels produce no
    /// marks.
    pub fn rebuild(
        &mut self,
        store: &TraceStore,
        channels: &ChannelRegistry,
        limit: Option<usize>,
    ) {
        if store.is_empty() {
            self.marks = vec![Vec::new(); CHANNEL_COUNT];
            self.max_count = 0;
            self.max_pos = 0.0;
            self.time_origin = 0.0;
            return;
        }

        self.time_origin = store.lines()[0].timestamp;
        for marks in &mut self.marks {
            marks.clear();
        }
        self.max_count = 0;
        self.max_pos = 0.0;

        let skip = match limit {
            Some(limit) => store.len().saturating_sub(limit),
            None => 0,
        };
        for line in &store.lines()[skip..] {
            if !channels.is_enabled(line.channel) {
                continue;
            }
            let pos = self.position(line.timestamp);
            let marks = &mut self.marks[line.channel as usize];
            match marks.last_mut() {
                Some(last) if pos - last.pos < COLLAPSE_EPSILON => {
                    last.count += 1;
                    self.max_count = self.max_count.max(last.count);
                }
                _ => {
                    if marks.len() == marks.capacity() {
                        let grow = if marks.capacity() == 0 {
                            MARKS_INITIAL_CAPACITY
                        } else {
                            marks.capacity()
                        };
                        if marks.try_reserve_exact(grow).is_err() {
                            continue;
                        }
                    }
                    marks.push(TimelineMark { pos, count: 1 });
                    self.max_count = self.max_count.max(1);
                }
            }
            self.max_pos = self.max_pos.max(pos);
        }
    }

    /// Tightens the zoom by 1.5×. Past 700 px the spacing folds back into
    /// the tick configuration: the ticks-per-mark divider drops a decade,
    /// and when that bottoms out the scale drops to the next finer unit.
    /// Call [`rebuild`](Self::rebuild) afterwards.
    pub fn zoom_in(&mut self) {
        self.mark_spacing *= 1.5;
        if self.mark_spacing > 700.0 && (self.mark_delta > 1 || self.mark_scale > 1) {
            self.mark_delta /= 10;
            self.mark_spacing /= 10.0;
            if self.mark_delta == 0 {
                if self.mark_scale >= 1_000 {
                    self.mark_scale /= 1_000;
                    self.mark_delta = 100;
                } else {
                    self.mark_delta = 1;
                }
            }
        }
    }

    /// Widens the zoom by 1.5×, the inverse of [`zoom_in`](Self::zoom_in):
    /// below 70 px the divider gains a decade, and a divider past the
    /// decade range promotes the scale to the next coarser unit. Call
    /// [`rebuild`](Self::rebuild) afterwards.
    pub fn zoom_out(&mut self) {
        if self.mark_spacing > 45.0 || self.mark_scale < 60_000_000 || self.mark_delta == 1 {
            self.mark_spacing /= 1.5;
            if self.mark_spacing < 70.0 {
                self.mark_delta *= 10;
                self.mark_spacing *= 10.0;
                if self.mark_scale < 1_000_000 && self.mark_delta >= 1_000 {
                    self.mark_scale *= 1_000;
                    self.mark_delta /= 1_000;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(lines: &[(u8, f64)]) -> TraceStore {
        let mut store = TraceStore::new();
        for &(channel, ts) in lines {
            store.append_bytes(channel, b"x\n", ts);
        }
        store
    }

    fn all_enabled() -> ChannelRegistry {
        let mut channels = ChannelRegistry::new();
        for ch in 0..CHANNEL_COUNT as u8 {
            channels.set_enabled(ch, true);
        }
        channels
    }

    #[test]
    fn marks_are_monotonic_and_spaced() {
        let mut lines = Vec::new();
        for i in 0..500 {
            lines.push((0u8, i as f64 * 0.001));
        }
        let store = store_with(&lines);
        let mut timeline = Timeline::new();
        timeline.rebuild(&store, &all_enabled(), None);

        let marks = timeline.marks(0);
        assert!(!marks.is_empty());
        for pair in marks.windows(2) {
            assert!(pair[1].pos >= pair[0].pos);
            assert!(pair[1].pos - pair[0].pos >= COLLAPSE_EPSILON);
        }
        assert_eq!(marks.iter().map(|m| m.count).sum::<u32>(), 500);
        assert_eq!(timeline.max_pos(), marks.last().unwrap().pos);
    }

    #[test]
    fn close_arrivals_collapse() {
        // 1 s per mark unit at 100 px: 10 lines 1 ms apart are well inside
        // half a display unit and land in a single mark
        let lines: Vec<_> = (0..10).map(|i| (0u8, 5.0 + i as f64 * 0.001)).collect();
        let store = store_with(&lines);
        let mut timeline = Timeline::new();
        timeline.rebuild(&store, &all_enabled(), None);

        assert_eq!(timeline.marks(0).len(), 1);
        assert_eq!(timeline.marks(0)[0].count, 10);
        assert_eq!(timeline.max_count(), 10);
        // first line anchors the origin at position 0
        assert_eq!(timeline.marks(0)[0].pos, 0.0);
    }

    #[test]
    fn disabled_channels_have_no_marks() {
        let store = store_with(&[(0, 0.0), (3, 1.0)]);
        let mut channels = all_enabled();
        channels.set_enabled(3, false);
        let mut timeline = Timeline::new();
        timeline.rebuild(&store, &channels, None);

        assert!(!timeline.marks(0).is_empty());
        assert!(timeline.marks(3).is_empty());
    }

    #[test]
    fn limit_skips_oldest_lines() {
        let lines: Vec<_> = (0..100).map(|i| (0u8, i as f64)).collect();
        let store = store_with(&lines);
        let mut timeline = Timeline::new();
        timeline.rebuild(&store, &all_enabled(), Some(10));

        assert_eq!(timeline.marks(0).iter().map(|m| m.count).sum::<u32>(), 10);
    }

    #[test]
    fn empty_store_clears_state() {
        let store = store_with(&[(0, 0.0), (0, 1.0)]);
        let mut timeline = Timeline::new();
        timeline.rebuild(&store, &all_enabled(), None);
        assert!(timeline.max_pos() > 0.0);

        timeline.rebuild(&TraceStore::new(), &all_enabled(), None);
        assert!(timeline.marks(0).is_empty());
        assert_eq!(timeline.max_count(), 0);
        assert_eq!(timeline.max_pos(), 0.0);
        assert_eq!(timeline.time_origin(), 0.0);
    }

    #[test]
    fn zoom_round_trip_is_stable() {
        let mut timeline = Timeline::new();
        timeline.set_spacing(120.0);
        let (spacing, scale, delta) = (timeline.spacing(), timeline.scale(), timeline.delta());

        timeline.zoom_in();
        timeline.zoom_out();

        assert!((timeline.spacing() - spacing).abs() / spacing < 0.01);
        assert_eq!(timeline.scale(), scale);
        assert_eq!(timeline.delta(), delta);
    }

    #[test]
    fn zoom_in_folds_the_tick_ladder() {
        let mut timeline = Timeline::new();
        timeline.set_scale(1_000);
        timeline.set_delta(10);
        timeline.set_spacing(500.0);

        timeline.zoom_in();
        assert_eq!(timeline.delta(), 1);
        assert_eq!(timeline.scale(), 1_000);
        assert!((timeline.spacing() - 75.0).abs() < 1e-3);

        // the inverse widening restores the previous rung
        timeline.zoom_out();
        assert_eq!(timeline.delta(), 10);
        assert_eq!(timeline.scale(), 1_000);
        assert!((timeline.spacing() - 500.0).abs() < 1e-3);
    }

    #[test]
    fn zoom_in_drops_to_finer_scale() {
        let mut timeline = Timeline::new();
        timeline.set_scale(1_000);
        timeline.set_delta(1);
        timeline.set_spacing(500.0);

        timeline.zoom_in();
        assert_eq!(timeline.scale(), 1);
        assert_eq!(timeline.delta(), 100);
        assert!((timeline.spacing() - 75.0).abs() < 1e-3);

        timeline.zoom_out();
        assert_eq!(timeline.scale(), 1_000);
        assert_eq!(timeline.delta(), 1);
        assert!((timeline.spacing() - 500.0).abs() < 1e-3);
    }

    #[test]
    fn spacing_never_drops_below_minimum() {
        let mut timeline = Timeline::new();
        timeline.set_spacing(0.0);
        assert_eq!(timeline.spacing(), MARK_SPACING_MIN);
    }
}
