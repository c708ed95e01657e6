mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
pub mod validation;
#[cfg(test)]
mod tests;

pub use availability::{available_units, ReservedUnits};
pub use conflict::{conflicts, find_conflict};
pub use error::{EngineError, Field, ValidationErrors};
pub use validation::{AvailabilityQuery, ReservationRequest};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedUnitState = Arc<RwLock<UnitState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) struct WalAppend {
    event: Event,
    response: oneshot::Sender<io::Result<()>>,
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the shared result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalAppend>) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(next) = rx.try_recv() {
            batch.push(next);
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            warn!("WAL flush of {} events failed: {e}", batch.len());
        }

        for append in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = append.response.send(r);
        }
    }
    info!("WAL writer stopped after {} appends", wal.appends());
}

fn flush_batch(wal: &mut Wal, batch: &[WalAppend]) -> io::Result<()> {
    for append in batch {
        if let Err(e) = wal.append_buffered(&append.event) {
            // The whole batch fails, so none of it may be written later.
            wal.discard_pending();
            return Err(e);
        }
    }
    // A failed flush discards the batch inside the WAL.
    wal.flush_sync()
}

/// In-memory listing catalog and reservation store, backed by the WAL.
///
/// Listings are copy-on-write (`Arc<Listing>`) so availability queries can
/// snapshot the catalog without holding map guards. Each bookable unit owns
/// its reservations behind a `tokio::sync::RwLock`; writers hold that lock
/// across the overlap check, the WAL append and the apply.
pub struct Engine {
    pub(super) listings: DashMap<Ulid, Arc<Listing>>,
    /// Room type id → hotel listing id.
    pub(super) room_types: DashMap<Ulid, Ulid>,
    /// Room id → hotel listing id.
    pub(super) rooms: DashMap<Ulid, Ulid>,
    pub(super) units: DashMap<UnitKey, SharedUnitState>,
    /// Reservation id → unit holding it.
    pub(super) reservations: DashMap<Ulid, UnitKey>,
    pub(super) catalog_lock: Mutex<()>,
    next_seq: AtomicU64,
    wal_tx: mpsc::Sender<WalAppend>,
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let (wal, events) = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            listings: DashMap::new(),
            room_types: DashMap::new(),
            rooms: DashMap::new(),
            units: DashMap::new(),
            reservations: DashMap::new(),
            catalog_lock: Mutex::new(()),
            next_seq: AtomicU64::new(0),
            wal_tx,
        };

        // Reservations are gathered into plain UnitStates first; nothing else
        // can see the engine yet, so no locks are taken during replay.
        let mut units: HashMap<UnitKey, UnitState> = HashMap::new();
        for event in &events {
            match event {
                Event::ReservationCreated { reservation } => {
                    let key = reservation.unit_key();
                    engine.reservations.insert(reservation.id, key);
                    units
                        .entry(key)
                        .or_insert_with(|| UnitState::new(key))
                        .insert_reservation(reservation.clone());
                }
                catalog => engine.apply_catalog(catalog),
            }
        }
        for (key, unit) in units {
            engine.units.insert(key, Arc::new(RwLock::new(unit)));
        }

        info!(
            "engine ready: {} listings, {} reservations replayed from {}",
            engine.listings.len(),
            engine.reservations.len(),
            wal_path.display()
        );
        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalAppend {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append then apply a catalog event. Caller holds `catalog_lock`.
    pub(super) async fn persist_catalog(&self, event: Event) -> Result<(), EngineError> {
        self.wal_append(&event).await?;
        self.apply_catalog(&event);
        Ok(())
    }

    /// Apply a catalog event to the in-memory tree. Events are validated
    /// before they reach the WAL, so a dangling parent only shows up in a
    /// hand-edited log and is skipped.
    fn apply_catalog(&self, event: &Event) {
        match event {
            Event::ListingCreated {
                id,
                listing_type,
                title,
                location,
                price,
            } => {
                let kind = match listing_type {
                    ListingType::Hotel => ListingKind::Hotel { room_types: Vec::new() },
                    ListingType::Apartment => ListingKind::Apartment {
                        booking_info: BookingInfo {
                            price: price.unwrap_or(Decimal::ZERO),
                        },
                    },
                };
                let listing = Listing {
                    id: *id,
                    seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                    title: title.clone(),
                    location: location.clone(),
                    kind,
                };
                self.listings.insert(*id, Arc::new(listing));
            }
            Event::RoomTypeAdded {
                id,
                listing_id,
                title,
                price,
            } => {
                let Some(mut entry) = self.listings.get_mut(listing_id) else {
                    warn!("replay: room type {id} references missing listing {listing_id}");
                    return;
                };
                if let ListingKind::Hotel { room_types } = &mut Arc::make_mut(&mut *entry).kind {
                    room_types.push(RoomType {
                        id: *id,
                        title: title.clone(),
                        booking_info: BookingInfo { price: *price },
                        rooms: Vec::new(),
                    });
                    self.room_types.insert(*id, *listing_id);
                }
            }
            Event::RoomAdded {
                id,
                listing_id,
                room_type_id,
                room_number,
            } => {
                let Some(mut entry) = self.listings.get_mut(listing_id) else {
                    warn!("replay: room {id} references missing listing {listing_id}");
                    return;
                };
                if let ListingKind::Hotel { room_types } = &mut Arc::make_mut(&mut *entry).kind
                    && let Some(rt) = room_types.iter_mut().find(|rt| rt.id == *room_type_id)
                {
                    rt.rooms.push(Room {
                        id: *id,
                        room_number: room_number.clone(),
                    });
                    self.rooms.insert(*id, *listing_id);
                }
            }
            Event::ReservationCreated { .. } => {}
        }
    }

    pub fn get_listing(&self, id: &Ulid) -> Option<Arc<Listing>> {
        self.listings.get(id).map(|e| e.value().clone())
    }

    pub fn get_unit(&self, key: &UnitKey) -> Option<SharedUnitState> {
        self.units.get(key).map(|e| e.value().clone())
    }

    /// Unit state for `key`, created empty on first use.
    pub(super) fn unit_or_default(&self, key: UnitKey) -> SharedUnitState {
        self.units
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(UnitState::new(key))))
            .value()
            .clone()
    }
}
