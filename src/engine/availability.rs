use std::collections::HashSet;

use ulid::Ulid;

use crate::model::*;

use super::validation::AvailabilityQuery;

// ── Availability Algorithm ────────────────────────────────────────

/// Units whose reservations overlap the query window, split by unit kind.
#[derive(Debug, Default)]
pub struct ReservedUnits {
    pub rooms: HashSet<Ulid>,
    pub apartments: HashSet<Ulid>,
}

impl ReservedUnits {
    /// Every reservation overlapping `stay` excludes its unit. Hotel and
    /// apartment reservations land in separate sets and never affect one
    /// another.
    pub fn collect<'a>(
        reservations: impl IntoIterator<Item = &'a Reservation>,
        stay: &DateRange,
    ) -> Self {
        let mut reserved = Self::default();
        for r in reservations {
            if !r.stay.overlaps(stay) {
                continue;
            }
            match r.unit_key() {
                UnitKey::Room(id) => reserved.rooms.insert(id),
                UnitKey::Apartment(id) => reserved.apartments.insert(id),
            };
        }
        reserved
    }

    pub fn contains(&self, key: &UnitKey) -> bool {
        match key {
            UnitKey::Room(id) => self.rooms.contains(id),
            UnitKey::Apartment(id) => self.apartments.contains(id),
        }
    }
}

/// Compute the available, in-budget units.
///
/// `listings` are visited in the order given; within a hotel, room types and
/// rooms keep their creation order. A unit qualifies when its nightly price is
/// at most `max_price` and none of `reservations` holds it on any day of the
/// query window. A hotel contributes one offer per qualifying room and is
/// absent when none qualifies.
pub fn available_units<'a>(
    listings: impl IntoIterator<Item = &'a Listing>,
    reservations: impl IntoIterator<Item = &'a Reservation>,
    query: &AvailabilityQuery,
) -> Vec<UnitOffer> {
    let reserved = ReservedUnits::collect(reservations, &query.stay);
    let mut seen: HashSet<UnitKey> = HashSet::new();
    let mut offers = Vec::new();

    for listing in listings {
        for unit in listing.units() {
            if unit.price > query.max_price || reserved.contains(&unit.key) {
                continue;
            }
            if !seen.insert(unit.key) {
                continue;
            }
            offers.push(offer(listing, &unit));
        }
    }

    offers
}

fn offer(listing: &Listing, unit: &PricedUnit<'_>) -> UnitOffer {
    let title = match unit.room {
        Some(room) => format!("{} - room {}", listing.title, room.room_number),
        None => listing.title.clone(),
    };
    UnitOffer {
        key: unit.key,
        listing_id: listing.id,
        listing_type: listing.listing_type(),
        country: listing.location.country.clone(),
        city: listing.location.city.clone(),
        title,
        price: unit.price,
    }
}
