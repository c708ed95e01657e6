use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use rust_decimal::Decimal;
use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{RESERVATIONS_CREATED_TOTAL, RESERVATIONS_REJECTED_TOTAL};

use super::conflict::{check_no_conflict, now_ms, today};
use super::error::{Field, ValidationErrors};
use super::validation::{check_price, required_text, ReservationRequest, REQUIRED};
use super::{Engine, EngineError};

impl Engine {
    // ── Catalog ──────────────────────────────────────────────

    /// Create a hotel or apartment listing. Apartments carry their own
    /// nightly price; hotels are priced per room type and must not.
    pub async fn create_listing(
        &self,
        id: Ulid,
        listing_type: ListingType,
        title: &str,
        country: &str,
        city: &str,
        price: Option<Decimal>,
    ) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        if self.listings.len() >= MAX_LISTINGS {
            return Err(EngineError::LimitExceeded("too many listings"));
        }
        if self.listings.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let mut errors = ValidationErrors::new();
        let title = required_text(Field::Title, title, MAX_TITLE_LEN, &mut errors);
        let country = required_text(Field::Country, country, MAX_PLACE_LEN, &mut errors);
        let city = required_text(Field::City, city, MAX_PLACE_LEN, &mut errors);
        match (listing_type, price) {
            (ListingType::Apartment, None) => errors.add(Field::Price, REQUIRED),
            (ListingType::Apartment, Some(p)) => {
                if let Err(e) = check_price(Field::Price, p) {
                    errors.merge(e);
                }
            }
            (ListingType::Hotel, Some(_)) => {
                errors.add(Field::Price, "Hotels are priced per room type.")
            }
            (ListingType::Hotel, None) => {}
        }
        let (Some(title), Some(country), Some(city)) = (title, country, city) else {
            return Err(errors.into());
        };
        errors.into_result()?;

        self.persist_catalog(Event::ListingCreated {
            id,
            listing_type,
            title,
            location: Location { country, city },
            price,
        })
        .await?;
        debug!("listing {id} created ({listing_type})");
        Ok(())
    }

    /// Add a priced room type to a hotel listing.
    pub async fn add_room_type(
        &self,
        id: Ulid,
        listing_id: Ulid,
        title: &str,
        price: Decimal,
    ) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        if self.room_types.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let listing = self
            .get_listing(&listing_id)
            .ok_or(EngineError::NotFound(listing_id))?;
        if listing.listing_type() != ListingType::Hotel {
            return Err(EngineError::validation(
                Field::NonField,
                format!("Room types can only be added to hotels; {} is an apartment.", listing.title),
            ));
        }
        if listing.room_types().len() >= MAX_ROOM_TYPES_PER_LISTING {
            return Err(EngineError::LimitExceeded("too many room types on listing"));
        }

        let mut errors = ValidationErrors::new();
        let title = required_text(Field::Title, title, MAX_TITLE_LEN, &mut errors);
        if let Err(e) = check_price(Field::Price, price) {
            errors.merge(e);
        }
        let Some(title) = title else {
            return Err(errors.into());
        };
        errors.into_result()?;

        self.persist_catalog(Event::RoomTypeAdded {
            id,
            listing_id,
            title,
            price,
        })
        .await?;
        debug!("room type {id} added to listing {listing_id}");
        Ok(())
    }

    /// Add a room to a room type. Room numbers are unique within a room type.
    pub async fn add_room(&self, id: Ulid, room_type_id: Ulid, room_number: &str) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        if self.rooms.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let listing_id = self
            .room_types
            .get(&room_type_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(room_type_id))?;
        let listing = self
            .get_listing(&listing_id)
            .ok_or(EngineError::NotFound(listing_id))?;
        let room_type = listing
            .room_types()
            .iter()
            .find(|rt| rt.id == room_type_id)
            .ok_or(EngineError::NotFound(room_type_id))?;
        if room_type.rooms.len() >= MAX_ROOMS_PER_ROOM_TYPE {
            return Err(EngineError::LimitExceeded("too many rooms in room type"));
        }

        let mut errors = ValidationErrors::new();
        let Some(room_number) = required_text(Field::RoomNumber, room_number, MAX_ROOM_NUMBER_LEN, &mut errors)
        else {
            return Err(errors.into());
        };
        if room_type.rooms.iter().any(|r| r.room_number == room_number) {
            return Err(EngineError::validation(
                Field::RoomNumber,
                format!("Room {room_number} already exists in {}.", room_type.title),
            ));
        }

        self.persist_catalog(Event::RoomAdded {
            id,
            listing_id,
            room_type_id,
            room_number,
        })
        .await?;
        debug!("room {id} added to room type {room_type_id}");
        Ok(())
    }

    // ── Reservations ─────────────────────────────────────────

    /// Validate and commit a reservation, treating today's UTC date as the
    /// earliest allowed check-in.
    pub async fn create_reservation(&self, req: ReservationRequest) -> Result<Reservation, EngineError> {
        self.create_reservation_as_of(req, today()).await
    }

    /// Like [`Engine::create_reservation`] with an explicit "today".
    pub async fn create_reservation_as_of(
        &self,
        req: ReservationRequest,
        today: NaiveDate,
    ) -> Result<Reservation, EngineError> {
        let result = self.try_create_reservation(req, today).await;
        match &result {
            Ok(r) => {
                metrics::counter!(RESERVATIONS_CREATED_TOTAL).increment(1);
                debug!(
                    "reservation {} on {:?} for {} ~ {}",
                    r.id,
                    r.unit_key(),
                    r.stay.check_in,
                    r.stay.check_out
                );
            }
            Err(e) => {
                metrics::counter!(RESERVATIONS_REJECTED_TOTAL, "reason" => e.label()).increment(1);
                debug!("reservation rejected: {e}");
            }
        }
        result
    }

    async fn try_create_reservation(
        &self,
        req: ReservationRequest,
        today: NaiveDate,
    ) -> Result<Reservation, EngineError> {
        if self.reservations.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }
        let listing = self
            .get_listing(&req.listing_id)
            .ok_or(EngineError::NotFound(req.listing_id))?;

        let mut errors = ValidationErrors::new();
        let room_id = self.clean_room(&listing, req.room_id, &mut errors)?;
        req.check_dates(today, &mut errors);
        errors.into_result()?;

        let stay = DateRange::new(req.check_in, req.check_out);
        if stay.days() > MAX_STAY_DAYS {
            return Err(EngineError::LimitExceeded("stay too long"));
        }

        let now = now_ms();
        let reservation = Reservation {
            id: req.id,
            listing_id: req.listing_id,
            room_id,
            stay,
            created_on: now,
            modified_on: now,
        };
        let key = reservation.unit_key();

        let unit = self.unit_or_default(key);
        let mut guard = unit.write().await;
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_UNIT {
            return Err(EngineError::LimitExceeded("too many reservations on unit"));
        }
        check_no_conflict(&guard, &stay)?;

        // Claim the id before the WAL append; two units never share a lock.
        match self.reservations.entry(reservation.id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(reservation.id)),
            Entry::Vacant(slot) => {
                slot.insert(key);
            }
        }
        let event = Event::ReservationCreated {
            reservation: reservation.clone(),
        };
        if let Err(e) = self.wal_append(&event).await {
            self.reservations.remove(&reservation.id);
            return Err(e);
        }
        guard.insert_reservation(reservation.clone());
        Ok(reservation)
    }

    /// Resolve the room of a reservation against its listing. Apartments
    /// drop any supplied room; hotels need one of their own rooms.
    fn clean_room(
        &self,
        listing: &Listing,
        room_id: Option<Ulid>,
        errors: &mut ValidationErrors,
    ) -> Result<Option<Ulid>, EngineError> {
        if listing.listing_type() == ListingType::Apartment {
            return Ok(None);
        }
        let Some(room_id) = room_id else {
            errors.add(Field::Room, REQUIRED);
            return Ok(None);
        };
        if listing.find_room(&room_id).is_some() {
            return Ok(Some(room_id));
        }

        let owner = self
            .rooms
            .get(&room_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(room_id))?;
        let room_number = self
            .get_listing(&owner)
            .and_then(|l| l.find_room(&room_id).map(|(_, room)| room.room_number.clone()))
            .unwrap_or_else(|| room_id.to_string());
        errors.add(
            Field::Room,
            format!("{room_number} does not belong to hotel {}", listing.title),
        );
        Ok(None)
    }
}
