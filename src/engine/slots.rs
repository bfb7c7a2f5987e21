use std::iter::FusedIterator;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};

use crate::limits::MAX_SLOT_MINUTES;
use crate::model::Interval;

use super::EngineError;

/// One provider+service combination on one calendar date. Only constructible
/// through [`AvailabilityWindow::new`], so every instance is well-formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailabilityWindow {
    date: NaiveDate,
    open_time: NaiveTime,
    close_time: NaiveTime,
    step: TimeDelta,
    duration: TimeDelta,
}

impl AvailabilityWindow {
    pub fn new(
        date: NaiveDate,
        open_time: NaiveTime,
        close_time: NaiveTime,
        step_minutes: i64,
        duration_minutes: i64,
    ) -> Result<Self, EngineError> {
        if step_minutes <= 0 {
            return Err(EngineError::InvalidWindow("step must be positive"));
        }
        if duration_minutes <= 0 {
            return Err(EngineError::InvalidWindow("duration must be positive"));
        }
        if step_minutes > MAX_SLOT_MINUTES || duration_minutes > MAX_SLOT_MINUTES {
            return Err(EngineError::InvalidWindow("step or duration longer than a day"));
        }
        if open_time >= close_time {
            return Err(EngineError::InvalidWindow("open time must be before close time"));
        }
        Ok(Self {
            date,
            open_time,
            close_time,
            step: TimeDelta::minutes(step_minutes),
            duration: TimeDelta::minutes(duration_minutes),
        })
    }

    pub fn duration(&self) -> TimeDelta {
        self.duration
    }

    /// Opening hours on this date as `[open, close)`.
    pub fn bounds(&self) -> Interval {
        Interval::new(
            self.date.and_time(self.open_time),
            self.date.and_time(self.close_time),
        )
    }
}

/// Candidate slots for `window`, earliest first, independent of bookings.
///
/// The sequence is finite and carries no hidden state: calling `generate`
/// again (or cloning the iterator before use) replays it exactly.
pub fn generate(window: &AvailabilityWindow) -> Slots {
    let bounds = window.bounds();
    Slots {
        current: bounds.start,
        latest_start: bounds.end - window.duration,
        step: window.step,
        duration: window.duration,
    }
}

#[derive(Debug, Clone)]
pub struct Slots {
    current: NaiveDateTime,
    latest_start: NaiveDateTime,
    step: TimeDelta,
    duration: TimeDelta,
}

impl Iterator for Slots {
    type Item = Interval;

    fn next(&mut self) -> Option<Interval> {
        if self.current > self.latest_start {
            return None;
        }
        let slot = Interval::new(self.current, self.current + self.duration);
        self.current += self.step;
        Some(slot)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = if self.current > self.latest_start {
            0
        } else {
            let span = (self.latest_start - self.current).num_seconds();
            (span / self.step.num_seconds()) as usize + 1
        };
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Slots {}
impl FusedIterator for Slots {}
