use chrono::NaiveDate;

use crate::limits::MAX_QUERY_ROWS;
use crate::model::*;

use super::availability::list_available;
use super::slots::AvailabilityWindow;
use super::{Engine, EngineError};

impl Engine {
    /// Free slots for one service of one provider on `date`, earliest first.
    ///
    /// Holds the day's read lock only while copying its active intervals; slot
    /// generation and filtering run on the copy.
    pub async fn available_slots(
        &self,
        provider_id: ProviderId,
        service_id: ServiceId,
        date: NaiveDate,
    ) -> Result<Vec<Slot>, EngineError> {
        let (provider, service) = self.resolve_catalog(provider_id, service_id)?;
        let window = self.window_for(&provider, &service, date)?;
        let booked = self.snapshot(&LedgerKey::new(provider_id, date)).await;
        Ok(list_available(&window, &booked))
    }

    /// Active (pending or confirmed) intervals of one ledger, copied out.
    pub async fn snapshot(&self, key: &LedgerKey) -> Vec<Interval> {
        match self.ledger(key) {
            Some(day) => day.read().await.active_intervals(),
            None => Vec::new(),
        }
    }

    pub async fn get_booking(&self, id: BookingId) -> Result<Booking, EngineError> {
        let key = self
            .get_ledger_for_booking(&id)
            .ok_or_else(|| EngineError::booking_not_found(id))?;
        let day = self
            .ledger(&key)
            .ok_or_else(|| EngineError::booking_not_found(id))?;
        let guard = day.read().await;
        guard
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::booking_not_found(id))
    }

    /// Every booking (any status) of a provider on `date`, in start order.
    pub async fn bookings_for(
        &self,
        provider_id: ProviderId,
        date: NaiveDate,
    ) -> Result<Vec<Booking>, EngineError> {
        if !self.catalog.contains_provider(&provider_id) {
            return Err(EngineError::provider_not_found(provider_id));
        }
        let Some(day) = self.ledger(&LedgerKey::new(provider_id, date)) else {
            return Ok(Vec::new());
        };
        let guard = day.read().await;
        if guard.len() > MAX_QUERY_ROWS {
            return Err(EngineError::LimitExceeded("too many rows"));
        }
        Ok(guard.bookings().to_vec())
    }

    pub fn get_provider(&self, id: ProviderId) -> Result<Provider, EngineError> {
        self.catalog
            .provider(&id)
            .ok_or_else(|| EngineError::provider_not_found(id))
    }

    pub fn get_service(&self, id: ServiceId) -> Result<Service, EngineError> {
        self.catalog
            .service(&id)
            .ok_or_else(|| EngineError::service_not_found(id))
    }

    /// Look up a provider and one of its services.
    pub(super) fn resolve_catalog(
        &self,
        provider_id: ProviderId,
        service_id: ServiceId,
    ) -> Result<(Provider, Service), EngineError> {
        let provider = self.get_provider(provider_id)?;
        let service = self.get_service(service_id)?;
        if service.provider_id != provider_id {
            return Err(EngineError::Validation(format!(
                "service {service_id} is not offered by provider {provider_id}"
            )));
        }
        Ok((provider, service))
    }

    /// Opening hours fall back to the configured defaults. The step is the
    /// service's own, else the provider's, else the service duration.
    pub(super) fn window_for(
        &self,
        provider: &Provider,
        service: &Service,
        date: NaiveDate,
    ) -> Result<AvailabilityWindow, EngineError> {
        let open = provider.open_time.unwrap_or(self.config.default_open);
        let close = provider.close_time.unwrap_or(self.config.default_close);
        let step = service
            .slot_interval
            .or(provider.slot_interval)
            .unwrap_or(service.duration_minutes);
        AvailabilityWindow::new(date, open, close, step, service.duration_minutes)
    }
}
