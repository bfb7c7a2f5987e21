mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod slots;
mod store;

pub use availability::{list_available, merge_intervals};
pub use conflict::{conflicts, now_ms, overlaps_merged};
pub use error::EngineError;
pub use slots::{generate, AvailabilityWindow, Slots};
pub use store::{Catalog, DayLedger};

use std::collections::HashMap;
use std::io;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio::time::Instant;
use tracing::warn;

use crate::config::EngineConfig;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::wal::Wal;

pub type SharedDayLedger = Arc<RwLock<DayLedger>>;

/// Write access to one day ledger. Also holds the compaction gate shared, so
/// a compaction cannot snapshot while this write is in flight.
pub(super) struct LedgerWriteGuard {
    day: OwnedRwLockWriteGuard<DayLedger>,
    _gate: OwnedRwLockReadGuard<()>,
}

impl Deref for LedgerWriteGuard {
    type Target = DayLedger;

    fn deref(&self) -> &DayLedger {
        &self.day
    }
}

impl DerefMut for LedgerWriteGuard {
    fn deref_mut(&mut self) -> &mut DayLedger {
        &mut self.day
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that arrive while a flush is being prepared ride
/// along in the same fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        respond_batch(batch, &result);

        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // flush even after a failed append so the next batch starts clean
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let batch = vec![(event, response)];
            let result = flush_batch(wal, &batch);
            respond_batch(batch, &result);
        }
    }
}

/// The booking ledger. Sole owner of every provider/date booking set.
///
/// Writes to one `LedgerKey` are serialized by that key's `RwLock`; there is
/// no lock shared between keys on the write path.
pub struct Engine {
    pub(super) ledgers: DashMap<LedgerKey, SharedDayLedger>,
    /// Reverse lookup: booking id → the ledger that holds it.
    pub(super) booking_index: DashMap<BookingId, LedgerKey>,
    pub catalog: Catalog,
    /// Serializes catalog registrations against each other and against
    /// compaction snapshots.
    pub(super) catalog_write: Mutex<()>,
    /// Held shared by every ledger writer and exclusively by compaction, from
    /// snapshot until the rewritten WAL is in place.
    pub(super) compaction_gate: Arc<RwLock<()>>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub config: EngineConfig,
}

/// Apply a booking event to its ledger. Caller holds the write lock.
fn apply_to_ledger(day: &mut DayLedger, event: &Event, index: &DashMap<BookingId, LedgerKey>) {
    match event {
        Event::BookingReserved(booking) => {
            index.insert(booking.id, booking.key());
            day.insert(booking.clone());
        }
        Event::BookingStatusChanged { id, status, .. } => {
            if day.set_status(id, *status).is_none() {
                warn!("status change for unknown booking {id} on {}", day.key);
            }
        }
        Event::ProviderRegistered(_) | Event::ServiceRegistered(_) => {}
    }
}

fn apply_to_catalog(catalog: &Catalog, event: &Event) {
    match event {
        Event::ProviderRegistered(provider) => catalog.upsert_provider(provider.clone()),
        Event::ServiceRegistered(service) => catalog.upsert_service(service.clone()),
        Event::BookingReserved(_) | Event::BookingStatusChanged { .. } => {}
    }
}

/// The ledger a booking event belongs to, if any.
fn event_key(event: &Event) -> Option<LedgerKey> {
    match event {
        Event::BookingReserved(booking) => Some(booking.key()),
        Event::BookingStatusChanged { provider_id, date, .. } => {
            Some(LedgerKey::new(*provider_id, *date))
        }
        Event::ProviderRegistered(_) | Event::ServiceRegistered(_) => None,
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, config: EngineConfig) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let catalog = Catalog::new();
        let booking_index = DashMap::new();

        // Ledgers are rebuilt unlocked and only wrapped once replay is done.
        let mut days: HashMap<LedgerKey, DayLedger> = HashMap::new();
        for event in &events {
            match event_key(event) {
                Some(key) => {
                    let day = days.entry(key).or_insert_with(|| DayLedger::new(key));
                    apply_to_ledger(day, event, &booking_index);
                }
                None => apply_to_catalog(&catalog, event),
            }
        }

        let ledgers = DashMap::with_capacity(days.len());
        for (key, day) in days {
            ledgers.insert(key, Arc::new(RwLock::new(day)));
        }

        tracing::info!(
            events = events.len(),
            providers = catalog.provider_count(),
            services = catalog.service_count(),
            bookings = booking_index.len(),
            "replayed WAL {}",
            wal_path.display()
        );

        Ok(Self {
            ledgers,
            booking_index,
            catalog,
            catalog_write: Mutex::new(()),
            compaction_gate: Arc::new(RwLock::new(())),
            wal_tx,
            notify,
            config,
        })
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Existing ledger for `key`. Reads never create one.
    pub(super) fn ledger(&self, key: &LedgerKey) -> Option<SharedDayLedger> {
        self.ledgers.get(key).map(|e| e.value().clone())
    }

    /// Ledger for `key`, created empty on first write.
    fn ledger_or_create(&self, key: LedgerKey) -> SharedDayLedger {
        self.ledgers
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(DayLedger::new(key))))
            .value()
            .clone()
    }

    pub fn ledger_count(&self) -> usize {
        self.ledgers.len()
    }

    pub fn get_ledger_for_booking(&self, id: &BookingId) -> Option<LedgerKey> {
        self.booking_index.get(id).map(|e| *e.value())
    }

    /// Exclusive lock on one provider/date, waiting no later than `deadline`
    /// (default: now + the configured lock timeout). The compaction gate is
    /// taken before the ledger lock, never after.
    pub(super) async fn acquire_write(
        &self,
        key: LedgerKey,
        deadline: Option<Instant>,
    ) -> Result<LedgerWriteGuard, EngineError> {
        let deadline = deadline.unwrap_or_else(|| Instant::now() + self.config.lock_timeout);
        let timed_out = |_: tokio::time::error::Elapsed| {
            metrics::counter!(observability::LOCK_TIMEOUTS_TOTAL).increment(1);
            EngineError::Timeout(key)
        };
        let wait_start = std::time::Instant::now();
        let gate = tokio::time::timeout_at(deadline, self.compaction_gate.clone().read_owned())
            .await
            .map_err(timed_out)?;
        let day = self.ledger_or_create(key);
        let day = tokio::time::timeout_at(deadline, day.write_owned())
            .await
            .map_err(timed_out)?;
        metrics::histogram!(observability::LOCK_WAIT_SECONDS)
            .record(wait_start.elapsed().as_secs_f64());
        Ok(LedgerWriteGuard { day, _gate: gate })
    }

    /// WAL-append, then apply, then publish. Nothing is applied if the append
    /// fails.
    pub(super) async fn persist_and_apply(
        &self,
        day: &mut DayLedger,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_ledger(day, event, &self.booking_index);
        self.notify.send(day.key.provider_id, event);
        Ok(())
    }

    /// Catalog counterpart of [`Engine::persist_and_apply`].
    pub(super) async fn persist_and_apply_catalog(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_catalog(&self.catalog, event);
        Ok(())
    }
}
