use crate::model::*;

use super::conflict::overlaps_merged;
use super::slots::{generate, AvailabilityWindow};

// ── Availability Algorithm ────────────────────────────────────────

/// Free slots for `window` given the provider's active bookings that day.
///
/// Pure: `booked` is a snapshot the caller already copied out of the ledger.
/// Bookings are clipped to opening hours, merged once, and each generated
/// candidate is binary-searched against the merged set. Generation order is
/// preserved.
pub fn list_available(window: &AvailabilityWindow, booked: &[Interval]) -> Vec<Slot> {
    let bounds = window.bounds();
    let clipped: Vec<Interval> = booked.iter().filter_map(|b| b.clamp_to(&bounds)).collect();
    let merged = merge_intervals(&clipped);

    generate(window)
        .filter(|candidate| !overlaps_merged(&merged, candidate))
        .map(Slot::from)
        .collect()
}

/// Collapse intervals into a sorted list of disjoint spans. Touching spans
/// (`a.end == b.start`) are fused too, so the output never has two entries
/// sharing an endpoint.
pub fn merge_intervals(intervals: &[Interval]) -> Vec<Interval> {
    let mut sorted = intervals.to_vec();
    sorted.sort_unstable_by_key(|iv| iv.start);

    let mut merged: Vec<Interval> = Vec::with_capacity(sorted.len());
    for iv in sorted {
        if let Some(last) = merged.last_mut()
            && iv.start <= last.end {
                last.end = last.end.max(iv.end);
                continue;
            }
        merged.push(iv);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 9, 20).unwrap()
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn at(h: u32, m: u32) -> NaiveDateTime {
        date().and_time(t(h, m))
    }

    fn iv(sh: u32, sm: u32, eh: u32, em: u32) -> Interval {
        Interval::new(at(sh, sm), at(eh, em))
    }

    fn nine_to_five(step: i64, duration: i64) -> AvailabilityWindow {
        AvailabilityWindow::new(date(), t(9, 0), t(17, 0), step, duration).unwrap()
    }

    // ── merge_intervals ────────────────────────────────

    #[test]
    fn merge_empty() {
        assert!(merge_intervals(&[]).is_empty());
    }

    #[test]
    fn merge_overlapping_basic() {
        let merged = merge_intervals(&[iv(9, 0, 11, 0), iv(10, 0, 12, 0), iv(13, 0, 14, 0)]);
        assert_eq!(merged, vec![iv(9, 0, 12, 0), iv(13, 0, 14, 0)]);
    }

    #[test]
    fn merge_touching_fuses() {
        let merged = merge_intervals(&[iv(9, 0, 9, 30), iv(9, 30, 10, 0)]);
        assert_eq!(merged, vec![iv(9, 0, 10, 0)]);
    }

    #[test]
    fn merge_unsorted_input() {
        let merged = merge_intervals(&[iv(14, 0, 15, 0), iv(9, 0, 10, 0), iv(9, 30, 9, 45)]);
        assert_eq!(merged, vec![iv(9, 0, 10, 0), iv(14, 0, 15, 0)]);
    }

    #[test]
    fn merge_contained_interval() {
        let merged = merge_intervals(&[iv(9, 0, 17, 0), iv(10, 0, 11, 0)]);
        assert_eq!(merged, vec![iv(9, 0, 17, 0)]);
    }

    #[test]
    fn merge_is_idempotent() {
        let inputs = vec![
            vec![],
            vec![iv(9, 0, 10, 0)],
            vec![iv(12, 0, 13, 0), iv(9, 0, 9, 30), iv(9, 30, 10, 0), iv(9, 45, 11, 0)],
            vec![iv(8, 0, 8, 15), iv(8, 30, 8, 45), iv(8, 10, 8, 35), iv(16, 0, 18, 0)],
        ];
        for xs in inputs {
            let once = merge_intervals(&xs);
            assert_eq!(merge_intervals(&once), once);
            for pair in once.windows(2) {
                assert!(pair[0].end < pair[1].start, "merged output must be disjoint and non-touching");
            }
        }
    }

    // ── list_available ────────────────────────────────

    #[test]
    fn no_bookings_returns_every_slot() {
        let slots = list_available(&nine_to_five(30, 30), &[]);
        assert_eq!(slots.len(), 16);
        assert_eq!(slots[0].label, "09:00 AM - 09:30 AM");
        assert_eq!(slots[15].label, "04:30 PM - 05:00 PM");
    }

    #[test]
    fn booked_slot_excluded() {
        let slots = list_available(&nine_to_five(30, 30), &[iv(10, 0, 10, 30)]);
        assert_eq!(slots.len(), 15);
        assert!(slots.iter().all(|s| s.start != at(10, 0)));
        assert!(slots.iter().any(|s| s.start == at(9, 30)));
        assert!(slots.iter().any(|s| s.start == at(10, 30)));
    }

    #[test]
    fn longer_booking_blocks_overlapping_candidates() {
        // 20-min step, 30-min duration: 10:00-11:00 knocks out 09:40, 10:00, 10:20, 10:40
        let slots = list_available(&nine_to_five(20, 30), &[iv(10, 0, 11, 0)]);
        let starts: Vec<_> = slots.iter().map(|s| s.start).collect();
        assert!(starts.contains(&at(9, 20)));
        for blocked in [at(9, 40), at(10, 0), at(10, 20), at(10, 40)] {
            assert!(!starts.contains(&blocked), "{blocked} should be blocked");
        }
        assert!(starts.contains(&at(11, 0)));
    }

    #[test]
    fn preserves_generation_order() {
        let slots = list_available(&nine_to_five(15, 45), &[iv(12, 0, 13, 0), iv(9, 0, 9, 15)]);
        for pair in slots.windows(2) {
            assert!(pair[0].start < pair[1].start);
        }
    }

    #[test]
    fn bookings_outside_hours_are_ignored() {
        let slots = list_available(&nine_to_five(30, 30), &[iv(7, 0, 8, 0), iv(17, 0, 18, 0)]);
        assert_eq!(slots.len(), 16);
    }

    #[test]
    fn booking_straddling_open_is_clipped() {
        let slots = list_available(&nine_to_five(30, 30), &[iv(8, 0, 9, 30)]);
        assert_eq!(slots.len(), 15);
        assert_eq!(slots[0].start, at(9, 30));
    }

    #[test]
    fn fully_booked_day_is_empty() {
        let slots = list_available(&nine_to_five(30, 30), &[iv(9, 0, 13, 0), iv(13, 0, 17, 0)]);
        assert!(slots.is_empty());
    }

    #[test]
    fn window_too_short_is_empty_not_error() {
        let window = AvailabilityWindow::new(date(), t(9, 0), t(9, 15), 15, 45).unwrap();
        assert!(list_available(&window, &[]).is_empty());
    }
}
