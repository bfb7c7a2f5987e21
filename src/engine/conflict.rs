use chrono::TimeDelta;

use crate::model::*;

use super::availability::merge_intervals;
use super::store::DayLedger;
use super::EngineError;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// True if `candidate` overlaps any interval in `confirmed`.
pub fn conflicts(candidate: &Interval, confirmed: &[Interval]) -> bool {
    overlaps_merged(&merge_intervals(confirmed), candidate)
}

/// Binary search over a merged (sorted, disjoint) set.
///
/// The first span ending after `candidate.start` is the only one that can
/// overlap; everything before it ends too early and everything after it
/// starts later still.
pub fn overlaps_merged(merged: &[Interval], candidate: &Interval) -> bool {
    let idx = merged.partition_point(|m| m.end <= candidate.start);
    merged.get(idx).is_some_and(|m| m.overlaps(candidate))
}

pub(crate) fn check_no_conflict(day: &DayLedger, candidate: &Interval) -> Result<(), EngineError> {
    if !overlaps_merged(day.merged(), candidate) {
        return Ok(());
    }
    let blocker = day
        .overlapping(candidate)
        .find(|b| b.status.is_active())
        .map(|b| b.id);
    match blocker {
        Some(id) => Err(EngineError::Conflict(id)),
        // merged cache and booking list disagree; treat as conflict on the day itself
        None => Err(EngineError::Validation(format!(
            "ledger {} inconsistent at {candidate}",
            day.key
        ))),
    }
}

/// Checks that do not need the ledger lock: exact duration and opening hours.
pub(crate) fn validate_candidate(
    candidate: &Interval,
    hours: &Interval,
    duration: TimeDelta,
) -> Result<(), EngineError> {
    if candidate.duration() != duration {
        return Err(EngineError::Validation(format!(
            "slot duration incorrect: expected {} minutes, got {}",
            duration.num_minutes(),
            candidate.duration().num_minutes()
        )));
    }
    if !hours.contains(candidate) {
        return Err(EngineError::Validation(format!(
            "{candidate} is outside opening hours {hours}"
        )));
    }
    Ok(())
}
