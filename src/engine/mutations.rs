use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{check_no_conflict, now_ms, validate_candidate};
use super::{DayLedger, Engine, EngineError, WalCommand};

fn check_name(name: Option<&str>, what: &'static str) -> Result<(), EngineError> {
    if let Some(n) = name
        && n.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded(what));
        }
    Ok(())
}

fn check_minutes(value: Option<i64>, what: &str) -> Result<(), EngineError> {
    match value {
        Some(m) if m <= 0 => Err(EngineError::Validation(format!("{what} must be positive"))),
        Some(m) if m > MAX_SLOT_MINUTES => {
            Err(EngineError::Validation(format!("{what} longer than a day")))
        }
        _ => Ok(()),
    }
}

impl Engine {
    // ── Catalog ──────────────────────────────────────────────

    /// Insert or replace a provider.
    pub async fn register_provider(&self, provider: Provider) -> Result<(), EngineError> {
        check_name(provider.name.as_deref(), "provider name too long")?;
        check_minutes(provider.slot_interval, "slot interval")?;
        let open = provider.open_time.unwrap_or(self.config.default_open);
        let close = provider.close_time.unwrap_or(self.config.default_close);
        if open >= close {
            return Err(EngineError::Validation(format!(
                "provider opens at {open} but closes at {close}"
            )));
        }

        let _catalog = self.catalog_write.lock().await;
        if !self.catalog.contains_provider(&provider.id)
            && self.catalog.provider_count() >= MAX_PROVIDERS
        {
            return Err(EngineError::LimitExceeded("too many providers"));
        }
        let event = Event::ProviderRegistered(provider);
        self.persist_and_apply_catalog(&event).await
    }

    /// Insert or replace a service. Its provider must already exist.
    pub async fn register_service(&self, service: Service) -> Result<(), EngineError> {
        check_name(service.name.as_deref(), "service name too long")?;
        check_minutes(Some(service.duration_minutes), "duration")?;
        check_minutes(service.slot_interval, "slot interval")?;

        let _catalog = self.catalog_write.lock().await;
        if !self.catalog.contains_provider(&service.provider_id) {
            return Err(EngineError::provider_not_found(service.provider_id));
        }
        if let Some(existing) = self.catalog.service(&service.id)
            && existing.provider_id != service.provider_id {
                return Err(EngineError::Validation(format!(
                    "service {} already belongs to provider {}",
                    service.id, existing.provider_id
                )));
            }
        if !self.catalog.contains_service(&service.id)
            && self.catalog.service_count() >= MAX_SERVICES
        {
            return Err(EngineError::LimitExceeded("too many services"));
        }
        let event = Event::ServiceRegistered(service);
        self.persist_and_apply_catalog(&event).await
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Atomically check and record a booking.
    ///
    /// Everything that does not depend on the ledger is validated before the
    /// provider/date lock is taken. Under the lock the conflict check and the
    /// WAL append happen back to back, so no concurrent reserve on the same
    /// key can slip in between.
    pub async fn reserve(
        &self,
        req: BookingRequest,
        deadline: Option<Instant>,
    ) -> Result<Booking, EngineError> {
        let candidate = Interval::on(req.date, req.start, req.end).ok_or_else(|| {
            EngineError::Validation(format!(
                "start {} must be before end {}",
                req.start, req.end
            ))
        })?;
        if let Some(notes) = &req.notes
            && notes.len() > MAX_NOTES_LEN {
                return Err(EngineError::LimitExceeded("notes too long"));
            }
        let (provider, service) = self.resolve_catalog(req.provider_id, req.service_id)?;
        let window = self.window_for(&provider, &service, req.date)?;
        validate_candidate(&candidate, &window.bounds(), window.duration())?;

        let key = LedgerKey::new(req.provider_id, req.date);
        let mut day = self.acquire_write(key, deadline).await?;

        // The id index is shared by every ledger, so the id is claimed before
        // anything is written and released again if the reserve fails.
        match self.booking_index.entry(req.id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(req.id)),
            Entry::Vacant(slot) => {
                slot.insert(key);
            }
        }
        let id = req.id;
        let result = self.commit_reservation(&mut day, req, candidate).await;
        if result.is_err() {
            self.booking_index.remove(&id);
        }
        result
    }

    async fn commit_reservation(
        &self,
        day: &mut DayLedger,
        req: BookingRequest,
        candidate: Interval,
    ) -> Result<Booking, EngineError> {
        let key = day.key;
        if day.len() >= MAX_BOOKINGS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many bookings for provider on this date"));
        }
        if let Err(e) = check_no_conflict(day, &candidate) {
            metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            debug!("reserve {} on {key} rejected: {e}", req.id);
            return Err(e);
        }

        let (status, expires_at) = match self.config.pending_ttl {
            Some(ttl) => (BookingStatus::Pending, Some(now_ms() + ttl.as_millis() as Ms)),
            None => (BookingStatus::Confirmed, None),
        };
        let booking = Booking {
            id: req.id,
            provider_id: req.provider_id,
            service_id: req.service_id,
            user_id: req.user_id,
            date: req.date,
            interval: candidate,
            status,
            notes: req.notes,
            expires_at,
        };
        let event = Event::BookingReserved(booking.clone());
        self.persist_and_apply(day, &event).await?;

        metrics::counter!(observability::BOOKINGS_RESERVED_TOTAL).increment(1);
        debug!("reserved {} on {key} at {candidate} ({status})", booking.id);
        Ok(booking)
    }

    /// Cancel a pending or confirmed booking. Allowed for the booking's user,
    /// the provider's owner, and admins. The interval is free for the next
    /// reserve as soon as this returns.
    pub async fn cancel(
        &self,
        id: BookingId,
        requester: Requester,
        deadline: Option<Instant>,
    ) -> Result<Booking, EngineError> {
        self.transition(id, requester, BookingStatus::Cancelled, deadline)
            .await
    }

    /// Pending → Confirmed. Provider owner or admin.
    pub async fn confirm(
        &self,
        id: BookingId,
        requester: Requester,
        deadline: Option<Instant>,
    ) -> Result<Booking, EngineError> {
        self.transition(id, requester, BookingStatus::Confirmed, deadline)
            .await
    }

    /// Confirmed → Completed. Provider owner or admin.
    pub async fn complete(
        &self,
        id: BookingId,
        requester: Requester,
        deadline: Option<Instant>,
    ) -> Result<Booking, EngineError> {
        self.transition(id, requester, BookingStatus::Completed, deadline)
            .await
    }

    pub async fn transition(
        &self,
        id: BookingId,
        requester: Requester,
        target: BookingStatus,
        deadline: Option<Instant>,
    ) -> Result<Booking, EngineError> {
        let key = self
            .get_ledger_for_booking(&id)
            .ok_or_else(|| EngineError::booking_not_found(id))?;
        let owner = self
            .catalog
            .provider(&key.provider_id)
            .and_then(|p| p.owner_id);

        let mut day = self.acquire_write(key, deadline).await?;
        let booking = day
            .get(&id)
            .ok_or_else(|| EngineError::booking_not_found(id))?;

        let is_owner = owner == Some(requester.user_id);
        let allowed = requester.admin
            || is_owner
            || (target == BookingStatus::Cancelled && booking.user_id == requester.user_id);
        if !allowed {
            return Err(EngineError::Permission {
                requester: requester.user_id,
                booking: id,
            });
        }
        if !booking.status.can_transition_to(target) {
            return Err(EngineError::Validation(format!(
                "booking {id} is {}, cannot become {target}",
                booking.status
            )));
        }

        let event = Event::BookingStatusChanged {
            id,
            provider_id: key.provider_id,
            date: key.date,
            status: target,
        };
        self.persist_and_apply(&mut day, &event).await?;
        debug!("booking {id} on {key} is now {target}");
        day.get(&id)
            .cloned()
            .ok_or_else(|| EngineError::booking_not_found(id))
    }

    // ── Pending expiry ───────────────────────────────────────

    /// Pending bookings whose hold lapsed at or before `now`. Ledgers locked
    /// by a writer are skipped and picked up on the next sweep.
    pub fn collect_expired_pending(&self, now: Ms) -> Vec<BookingId> {
        let mut expired = Vec::new();
        for entry in self.ledgers.iter() {
            if let Ok(day) = entry.value().try_read() {
                expired.extend(day.expired_pending(now));
            }
        }
        expired
    }

    /// Cancel `id` if it is still pending and past its expiry. Returns whether
    /// it was cancelled.
    pub async fn expire_pending(&self, id: BookingId, now: Ms) -> Result<bool, EngineError> {
        let key = self
            .get_ledger_for_booking(&id)
            .ok_or_else(|| EngineError::booking_not_found(id))?;
        let mut day = self.acquire_write(key, None).await?;
        let lapsed = day.get(&id).is_some_and(|b| {
            b.status == BookingStatus::Pending && b.expires_at.is_some_and(|exp| exp <= now)
        });
        if !lapsed {
            return Ok(false);
        }
        let event = Event::BookingStatusChanged {
            id,
            provider_id: key.provider_id,
            date: key.date,
            status: BookingStatus::Cancelled,
        };
        self.persist_and_apply(&mut day, &event).await?;
        metrics::counter!(observability::BOOKINGS_EXPIRED_TOTAL).increment(1);
        Ok(true)
    }

    // ── Compaction ───────────────────────────────────────────

    /// Rewrite the WAL with one record per provider, service and booking.
    ///
    /// The compaction gate is held exclusively until the new file is in
    /// place. No ledger write, including one that would create a new ledger,
    /// can append between snapshot and swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.write().await;
        let _catalog = self.catalog_write.lock().await;

        let mut events: Vec<Event> = Vec::new();
        events.extend(self.catalog.providers().into_iter().map(Event::ProviderRegistered));
        events.extend(self.catalog.services().into_iter().map(Event::ServiceRegistered));

        let days: Vec<_> = self.ledgers.iter().map(|e| e.value().clone()).collect();
        let mut guards = Vec::with_capacity(days.len());
        for day in days {
            let guard = day.read_owned().await;
            events.extend(guard.bookings().iter().cloned().map(Event::BookingReserved));
            guards.push(guard);
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
