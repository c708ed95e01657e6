use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for record timestamps.
pub type Ms = i64;

/// Closed date interval `[check_in, check_out]`.
///
/// Both ends are occupied: a stay checking out on the 11th overlaps one
/// checking in on the 11th.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
}

impl DateRange {
    pub fn new(check_in: NaiveDate, check_out: NaiveDate) -> Self {
        debug_assert!(check_in <= check_out, "check-in must not be after check-out");
        Self { check_in, check_out }
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.check_in <= other.check_out && self.check_out >= other.check_in
    }

    /// Number of calendar days covered, both ends included.
    pub fn days(&self) -> i64 {
        (self.check_out - self.check_in).num_days() + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ListingType {
    Hotel,
    Apartment,
}

impl ListingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingType::Hotel => "hotel",
            ListingType::Apartment => "apartment",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "hotel" => Some(ListingType::Hotel),
            "apartment" => Some(ListingType::Apartment),
            _ => None,
        }
    }
}

impl std::fmt::Display for ListingType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub country: String,
    pub city: String,
}

/// Nightly price record. Owned by an apartment listing or by a hotel room type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingInfo {
    pub price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    pub id: Ulid,
    pub room_number: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomType {
    pub id: Ulid,
    pub title: String,
    pub booking_info: BookingInfo,
    /// Rooms in creation order.
    pub rooms: Vec<Room>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListingKind {
    Hotel { room_types: Vec<RoomType> },
    Apartment { booking_info: BookingInfo },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub id: Ulid,
    /// Creation sequence number; fixes the output order of availability queries.
    pub seq: u64,
    pub title: String,
    pub location: Location,
    pub kind: ListingKind,
}

/// The thing a reservation occupies: a hotel room, or a whole apartment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum UnitKey {
    Room(Ulid),
    Apartment(Ulid),
}

/// One bookable unit of a listing together with the price it is sold at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PricedUnit<'a> {
    pub key: UnitKey,
    pub price: Decimal,
    /// `Some` for hotel rooms.
    pub room: Option<&'a Room>,
}

impl Listing {
    pub fn listing_type(&self) -> ListingType {
        match self.kind {
            ListingKind::Hotel { .. } => ListingType::Hotel,
            ListingKind::Apartment { .. } => ListingType::Apartment,
        }
    }

    /// Every bookable unit with its nightly price: the listing itself for an
    /// apartment, each room (priced by its room type) for a hotel.
    pub fn units(&self) -> impl Iterator<Item = PricedUnit<'_>> + '_ {
        let (apartment, room_types) = match &self.kind {
            ListingKind::Apartment { booking_info } => (
                Some(PricedUnit {
                    key: UnitKey::Apartment(self.id),
                    price: booking_info.price,
                    room: None,
                }),
                &[][..],
            ),
            ListingKind::Hotel { room_types } => (None, room_types.as_slice()),
        };
        let rooms = room_types.iter().flat_map(|rt| {
            rt.rooms.iter().map(move |room| PricedUnit {
                key: UnitKey::Room(room.id),
                price: rt.booking_info.price,
                room: Some(room),
            })
        });
        apartment.into_iter().chain(rooms)
    }

    /// Cheapest nightly price among bookable units. `None` for a hotel
    /// without rooms.
    pub fn price(&self) -> Option<Decimal> {
        self.units().map(|u| u.price).min()
    }

    pub fn room_types(&self) -> &[RoomType] {
        match &self.kind {
            ListingKind::Hotel { room_types } => room_types,
            ListingKind::Apartment { .. } => &[],
        }
    }

    pub fn find_room(&self, room_id: &Ulid) -> Option<(&RoomType, &Room)> {
        self.room_types().iter().find_map(|rt| {
            rt.rooms
                .iter()
                .find(|r| r.id == *room_id)
                .map(|room| (rt, room))
        })
    }

    pub fn room_count(&self) -> usize {
        self.room_types().iter().map(|rt| rt.rooms.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub listing_id: Ulid,
    /// `None` iff the listing is an apartment.
    pub room_id: Option<Ulid>,
    pub stay: DateRange,
    pub created_on: Ms,
    pub modified_on: Ms,
}

impl Reservation {
    pub fn unit_key(&self) -> UnitKey {
        match self.room_id {
            Some(room_id) => UnitKey::Room(room_id),
            None => UnitKey::Apartment(self.listing_id),
        }
    }
}

/// Reservations held by one unit, sorted by `stay.check_in`.
#[derive(Debug, Clone)]
pub struct UnitState {
    pub key: UnitKey,
    pub reservations: Vec<Reservation>,
}

impl UnitState {
    pub fn new(key: UnitKey) -> Self {
        Self {
            key,
            reservations: Vec::new(),
        }
    }

    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.stay.check_in <= reservation.stay.check_in);
        self.reservations.insert(pos, reservation);
    }

    /// Reservations whose stay overlaps `query` (inclusive on both ends).
    pub fn overlapping(&self, query: &DateRange) -> impl Iterator<Item = &Reservation> {
        // Everything past right_bound checks in after query.check_out.
        let right_bound = self
            .reservations
            .partition_point(|r| r.stay.check_in <= query.check_out);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.stay.check_out >= query.check_in)
    }
}

/// One available, in-budget unit returned by the availability query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitOffer {
    #[serde(skip)]
    pub key: UnitKey,
    #[serde(skip)]
    pub listing_id: Ulid,
    pub listing_type: ListingType,
    pub country: String,
    pub city: String,
    pub title: String,
    pub price: Decimal,
}

/// WAL record format. Catalog events carry everything needed to rebuild the
/// listing tree; reservations are replayed into per-unit state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ListingCreated {
        id: Ulid,
        listing_type: ListingType,
        title: String,
        location: Location,
        price: Option<Decimal>,
    },
    RoomTypeAdded {
        id: Ulid,
        listing_id: Ulid,
        title: String,
        price: Decimal,
    },
    RoomAdded {
        id: Ulid,
        listing_id: Ulid,
        room_type_id: Ulid,
        room_number: String,
    },
    ReservationCreated {
        reservation: Reservation,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingInfo {
    pub id: Ulid,
    pub listing_type: ListingType,
    pub title: String,
    pub location: Location,
    pub price: Option<Decimal>,
    pub room_count: usize,
}

impl From<&Listing> for ListingInfo {
    fn from(listing: &Listing) -> Self {
        Self {
            id: listing.id,
            listing_type: listing.listing_type(),
            title: listing.title.clone(),
            location: listing.location.clone(),
            price: listing.price(),
            room_count: listing.room_count(),
        }
    }
}
