use std::sync::OnceLock;

use dashmap::DashMap;

use crate::model::*;

use super::availability::merge_intervals;

/// Bookings of one provider on one date. Owned by the engine behind a
/// per-key `RwLock`; everything outside the engine sees copies.
#[derive(Debug)]
pub struct DayLedger {
    pub key: LedgerKey,
    /// Sorted by `interval.start`.
    bookings: Vec<Booking>,
    /// Merged active intervals, rebuilt lazily after a mutation.
    merged: OnceLock<Vec<Interval>>,
}

impl DayLedger {
    pub fn new(key: LedgerKey) -> Self {
        Self {
            key,
            bookings: Vec::new(),
            merged: OnceLock::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.bookings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bookings.is_empty()
    }

    pub fn bookings(&self) -> &[Booking] {
        &self.bookings
    }

    pub fn get(&self, id: &BookingId) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    /// Owned copy of the intervals that block new reservations.
    pub fn active_intervals(&self) -> Vec<Interval> {
        self.bookings
            .iter()
            .filter(|b| b.status.is_active())
            .map(|b| b.interval)
            .collect()
    }

    pub fn merged(&self) -> &[Interval] {
        self.merged
            .get_or_init(|| merge_intervals(&self.active_intervals()))
    }

    /// Bookings (any status) whose interval overlaps `query`, in start order.
    pub fn overlapping(&self, query: &Interval) -> impl Iterator<Item = &Booking> {
        let end_idx = self.bookings.partition_point(|b| b.interval.start < query.end);
        self.bookings[..end_idx]
            .iter()
            .filter(move |b| b.interval.end > query.start)
    }

    /// Insert maintaining start order.
    pub fn insert(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.interval.start <= booking.interval.start);
        self.bookings.insert(pos, booking);
        self.invalidate();
    }

    pub fn set_status(&mut self, id: &BookingId, status: BookingStatus) -> Option<&Booking> {
        let idx = self.bookings.iter().position(|b| b.id == *id)?;
        let booking = &mut self.bookings[idx];
        booking.status = status;
        if status != BookingStatus::Pending {
            booking.expires_at = None;
        }
        self.invalidate();
        Some(&self.bookings[idx])
    }

    /// Pending bookings whose hold lapsed at or before `now`.
    pub fn expired_pending(&self, now: Ms) -> Vec<BookingId> {
        self.bookings
            .iter()
            .filter(|b| b.status == BookingStatus::Pending)
            .filter(|b| b.expires_at.is_some_and(|exp| exp <= now))
            .map(|b| b.id)
            .collect()
    }

    fn invalidate(&mut self) {
        self.merged.take();
    }
}

/// Providers and services. Written only by registration events; read by
/// every availability query and reservation.
#[derive(Default)]
pub struct Catalog {
    providers: DashMap<ProviderId, Provider>,
    services: DashMap<ServiceId, Service>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Providers ────────────────────────────────────────────

    pub fn provider(&self, id: &ProviderId) -> Option<Provider> {
        self.providers.get(id).map(|e| e.value().clone())
    }

    pub fn contains_provider(&self, id: &ProviderId) -> bool {
        self.providers.contains_key(id)
    }

    pub fn upsert_provider(&self, provider: Provider) {
        self.providers.insert(provider.id, provider);
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    pub fn providers(&self) -> Vec<Provider> {
        self.providers.iter().map(|e| e.value().clone()).collect()
    }

    // ── Services ─────────────────────────────────────────────

    pub fn service(&self, id: &ServiceId) -> Option<Service> {
        self.services.get(id).map(|e| e.value().clone())
    }

    pub fn contains_service(&self, id: &ServiceId) -> bool {
        self.services.contains_key(id)
    }

    pub fn upsert_service(&self, service: Service) {
        self.services.insert(service.id, service);
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    pub fn services(&self) -> Vec<Service> {
        self.services.iter().map(|e| e.value().clone()).collect()
    }
}
