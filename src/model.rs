use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Used for wall-clock deadlines only; slot times are
/// [`NaiveDateTime`] in the single canonical zone.
pub type Ms = i64;

pub type ProviderId = Ulid;
pub type ServiceId = Ulid;
pub type UserId = Ulid;
pub type BookingId = Ulid;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Interval {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl Interval {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        debug_assert!(start < end, "Interval start must be before end");
        Self { start, end }
    }

    /// `None` unless `start < end`.
    pub fn try_new(start: NaiveDateTime, end: NaiveDateTime) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    /// `[date start, date end)`, `None` if the times are not ordered.
    pub fn on(date: NaiveDate, start: NaiveTime, end: NaiveTime) -> Option<Self> {
        Self::try_new(date.and_time(start), date.and_time(end))
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Interval) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: NaiveDateTime) -> bool {
        self.start <= t && t < self.end
    }

    /// True if `self` fully contains `other`.
    pub fn contains(&self, other: &Interval) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Intersection with `bounds`, if non-empty.
    pub fn clamp_to(&self, bounds: &Interval) -> Option<Interval> {
        Self::try_new(self.start.max(bounds.start), self.end.min(bounds.end))
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// A bookable candidate. Derived on demand, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Slot {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub label: String,
}

impl From<Interval> for Slot {
    fn from(iv: Interval) -> Self {
        let label = format!("{} - {}", iv.start.format("%I:%M %p"), iv.end.format("%I:%M %p"));
        Self {
            start: iv.start,
            end: iv.end,
            label,
        }
    }
}

impl Slot {
    pub fn interval(&self) -> Interval {
        Interval::new(self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl BookingStatus {
    /// Active bookings occupy their interval; the rest are history.
    pub fn is_active(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed) | (Pending, Cancelled) | (Confirmed, Cancelled) | (Confirmed, Completed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(BookingStatus::Pending),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "cancelled" | "canceled" => Ok(BookingStatus::Cancelled),
            "completed" => Ok(BookingStatus::Completed),
            other => Err(format!("unknown booking status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub provider_id: ProviderId,
    pub service_id: ServiceId,
    pub user_id: UserId,
    pub date: NaiveDate,
    pub interval: Interval,
    pub status: BookingStatus,
    pub notes: Option<String>,
    /// Pending bookings lapse at this instant unless confirmed first.
    pub expires_at: Option<Ms>,
}

impl Booking {
    pub fn key(&self) -> LedgerKey {
        LedgerKey::new(self.provider_id, self.date)
    }
}

/// The unit of write serialization: one provider on one calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LedgerKey {
    pub provider_id: ProviderId,
    pub date: NaiveDate,
}

impl LedgerKey {
    pub fn new(provider_id: ProviderId, date: NaiveDate) -> Self {
        Self { provider_id, date }
    }
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.provider_id, self.date)
    }
}

/// Catalog entry for a service provider. Hours are optional; the engine falls
/// back to its configured defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    pub id: ProviderId,
    /// User who runs this provider; may cancel and complete its bookings.
    pub owner_id: Option<UserId>,
    pub name: Option<String>,
    pub open_time: Option<NaiveTime>,
    pub close_time: Option<NaiveTime>,
    pub slot_interval: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: ServiceId,
    pub provider_id: ProviderId,
    pub name: Option<String>,
    pub duration_minutes: i64,
    /// Step between candidate starts. Defaults to the provider's step, then
    /// to the duration.
    pub slot_interval: Option<i64>,
}

/// A reservation attempt as it arrives from a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub id: BookingId,
    pub provider_id: ProviderId,
    pub service_id: ServiceId,
    pub user_id: UserId,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub notes: Option<String>,
}

/// Who is asking for a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requester {
    pub user_id: UserId,
    pub admin: bool,
}

impl Requester {
    pub fn user(user_id: UserId) -> Self {
        Self { user_id, admin: false }
    }

    pub fn admin(user_id: UserId) -> Self {
        Self { user_id, admin: true }
    }
}

/// WAL record format. Flat, one variant per state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ProviderRegistered(Provider),
    ServiceRegistered(Service),
    BookingReserved(Booking),
    BookingStatusChanged {
        id: BookingId,
        provider_id: ProviderId,
        date: NaiveDate,
        status: BookingStatus,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 9, 20)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn interval_basics() {
        let iv = Interval::new(at(9, 0), at(9, 30));
        assert_eq!(iv.duration(), TimeDelta::minutes(30));
        assert!(iv.contains_instant(at(9, 0)));
        assert!(iv.contains_instant(at(9, 29)));
        assert!(!iv.contains_instant(at(9, 30))); // half-open
    }

    #[test]
    fn interval_overlap() {
        let a = Interval::new(at(9, 0), at(9, 30));
        let b = Interval::new(at(9, 15), at(9, 45));
        let c = Interval::new(at(9, 30), at(10, 0));
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // back-to-back
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn interval_try_new_rejects_empty_and_inverted() {
        assert!(Interval::try_new(at(9, 0), at(9, 0)).is_none());
        assert!(Interval::try_new(at(10, 0), at(9, 0)).is_none());
        let date = NaiveDate::from_ymd_opt(2025, 9, 20).unwrap();
        let iv = Interval::on(date, at(9, 0).time(), at(10, 0).time()).unwrap();
        assert_eq!(iv, Interval::new(at(9, 0), at(10, 0)));
    }

    #[test]
    fn interval_contains_and_clamp() {
        let day = Interval::new(at(9, 0), at(17, 0));
        assert!(day.contains(&Interval::new(at(9, 0), at(17, 0))));
        assert!(!day.contains(&Interval::new(at(8, 30), at(9, 30))));

        let early = Interval::new(at(8, 0), at(9, 30));
        assert_eq!(early.clamp_to(&day), Some(Interval::new(at(9, 0), at(9, 30))));
        let outside = Interval::new(at(17, 0), at(18, 0));
        assert_eq!(outside.clamp_to(&day), None);
    }

    #[test]
    fn slot_label_uses_twelve_hour_clock() {
        let slot = Slot::from(Interval::new(at(9, 0), at(9, 30)));
        assert_eq!(slot.label, "09:00 AM - 09:30 AM");
        let slot = Slot::from(Interval::new(at(12, 30), at(13, 15)));
        assert_eq!(slot.label, "12:30 PM - 01:15 PM");
    }

    #[test]
    fn status_transitions() {
        use BookingStatus::*;
        assert!(Pending.can_transition_to(Confirmed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Confirmed.can_transition_to(Completed));
        assert!(Confirmed.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Cancelled.can_transition_to(Confirmed));
        assert!(!Completed.can_transition_to(Cancelled));
        assert!(!Confirmed.can_transition_to(Confirmed));
    }

    #[test]
    fn status_activity() {
        assert!(BookingStatus::Pending.is_active());
        assert!(BookingStatus::Confirmed.is_active());
        assert!(!BookingStatus::Cancelled.is_active());
        assert!(!BookingStatus::Completed.is_active());
    }

    #[test]
    fn status_parse() {
        assert_eq!("Confirmed".parse::<BookingStatus>(), Ok(BookingStatus::Confirmed));
        assert_eq!("canceled".parse::<BookingStatus>(), Ok(BookingStatus::Cancelled));
        assert!("done".parse::<BookingStatus>().is_err());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingReserved(Booking {
            id: Ulid::new(),
            provider_id: Ulid::new(),
            service_id: Ulid::new(),
            user_id: Ulid::new(),
            date: at(0, 0).date(),
            interval: Interval::new(at(10, 0), at(10, 30)),
            status: BookingStatus::Pending,
            notes: Some("window seat".into()),
            expires_at: Some(1_700_000_000_000),
        });
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
