use super::*;
use crate::limits::*;
use chrono::{Days, NaiveDate};

fn d(s: &str) -> NaiveDate {
    s.parse().unwrap()
}

fn dec(s: &str) -> Decimal {
    s.parse().unwrap()
}

/// The "today" most reservation tests run against.
fn jan1() -> NaiveDate {
    d("2024-01-01")
}

fn query(checkin: &str, checkout: &str, max_price: &str) -> AvailabilityQuery {
    AvailabilityQuery::parse(Some(checkin), Some(checkout), Some(max_price)).unwrap()
}

fn request(listing_id: Ulid, room_id: Option<Ulid>, check_in: &str, check_out: &str) -> ReservationRequest {
    ReservationRequest::parse(Ulid::new(), listing_id, room_id, check_in, check_out).unwrap()
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("staybook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

struct Hotel {
    id: Ulid,
    room_type: Ulid,
    rooms: Vec<Ulid>,
}

async fn hotel(engine: &Engine, title: &str, price: &str, numbers: &[&str]) -> Hotel {
    let id = Ulid::new();
    engine
        .create_listing(id, ListingType::Hotel, title, "Portugal", "Lisbon", None)
        .await
        .unwrap();
    let room_type = Ulid::new();
    engine.add_room_type(room_type, id, "Standard", dec(price)).await.unwrap();
    let mut rooms = Vec::new();
    for n in numbers {
        let room = Ulid::new();
        engine.add_room(room, room_type, n).await.unwrap();
        rooms.push(room);
    }
    Hotel { id, room_type, rooms }
}

async fn apartment(engine: &Engine, title: &str, price: &str) -> Ulid {
    let id = Ulid::new();
    engine
        .create_listing(id, ListingType::Apartment, title, "Spain", "Madrid", Some(dec(price)))
        .await
        .unwrap();
    id
}

fn titles(offers: &[UnitOffer]) -> Vec<&str> {
    offers.iter().map(|o| o.title.as_str()).collect()
}

// ── Catalog ──────────────────────────────────────────────

#[tokio::test]
async fn create_listings_and_list_them() {
    let engine = Engine::new(test_wal_path("list_listings.wal")).unwrap();
    let h = hotel(&engine, "Grand", "120.50", &["101", "102"]).await;
    let a = apartment(&engine, "Loft", "80").await;

    let listings = engine.list_listings();
    assert_eq!(listings.len(), 2);
    assert_eq!(listings[0].id, h.id);
    assert_eq!(listings[0].listing_type, ListingType::Hotel);
    assert_eq!(listings[0].price, Some(dec("120.50")));
    assert_eq!(listings[0].room_count, 2);
    assert_eq!(listings[1].id, a);
    assert_eq!(listings[1].price, Some(dec("80")));
    assert_eq!(listings[1].location.city, "Madrid");
    assert_eq!(engine.listing_count(), 2);
}

#[tokio::test]
async fn duplicate_listing_id_rejected() {
    let engine = Engine::new(test_wal_path("dup_listing.wal")).unwrap();
    let a = apartment(&engine, "Loft", "80").await;
    let err = engine
        .create_listing(a, ListingType::Apartment, "Other", "ES", "Madrid", Some(dec("10")))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(id) if id == a));
}

#[tokio::test]
async fn listing_input_is_validated() {
    let engine = Engine::new(test_wal_path("listing_validation.wal")).unwrap();

    let err = engine
        .create_listing(Ulid::new(), ListingType::Apartment, "  ", "ES", "", None)
        .await
        .unwrap_err();
    let errors = err.field_errors().unwrap();
    assert_eq!(errors.messages(Field::Title), ["This field is required."]);
    assert_eq!(errors.messages(Field::City), ["This field is required."]);
    assert_eq!(errors.messages(Field::Price), ["This field is required."]);
    assert!(!errors.has(Field::Country));

    let err = engine
        .create_listing(Ulid::new(), ListingType::Hotel, "Grand", "PT", "Lisbon", Some(dec("10")))
        .await
        .unwrap_err();
    assert!(err.field_errors().unwrap().has(Field::Price));

    let err = engine
        .create_listing(Ulid::new(), ListingType::Apartment, "Loft", "ES", "Madrid", Some(dec("0")))
        .await
        .unwrap_err();
    assert_eq!(
        err.field_errors().unwrap().messages(Field::Price),
        ["Ensure this value is greater than 0."]
    );
    assert_eq!(engine.listing_count(), 0);
}

#[tokio::test]
async fn room_types_only_on_hotels() {
    let engine = Engine::new(test_wal_path("room_type_on_apartment.wal")).unwrap();
    let a = apartment(&engine, "Loft", "80").await;
    let err = engine.add_room_type(Ulid::new(), a, "Double", dec("50")).await.unwrap_err();
    assert!(err.field_errors().unwrap().has(Field::NonField));

    let missing = Ulid::new();
    let err = engine.add_room_type(Ulid::new(), missing, "Double", dec("50")).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(id) if id == missing));
}

#[tokio::test]
async fn room_numbers_unique_within_room_type() {
    let engine = Engine::new(test_wal_path("room_number_unique.wal")).unwrap();
    let h = hotel(&engine, "Grand", "100", &["101"]).await;
    let err = engine.add_room(Ulid::new(), h.room_type, " 101 ").await.unwrap_err();
    assert!(err.field_errors().unwrap().has(Field::RoomNumber));

    // Same number in another room type is fine.
    let suite = Ulid::new();
    engine.add_room_type(suite, h.id, "Suite", dec("300")).await.unwrap();
    engine.add_room(Ulid::new(), suite, "101").await.unwrap();

    let err = engine.add_room(Ulid::new(), Ulid::new(), "9").await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

// ── Availability ─────────────────────────────────────────

#[tokio::test]
async fn free_room_offered_at_room_type_price() {
    let engine = Engine::new(test_wal_path("free_room.wal")).unwrap();
    hotel(&engine, "H", "100", &["R101"]).await;

    let offers = engine.available_units(&query("2024-01-10", "2024-01-12", "150")).await.unwrap();
    assert_eq!(offers.len(), 1);
    assert_eq!(offers[0].listing_type, ListingType::Hotel);
    assert_eq!(offers[0].title, "H - room R101");
    assert_eq!(offers[0].price, dec("100"));
    assert_eq!(offers[0].country, "Portugal");
}

#[tokio::test]
async fn reservation_blocks_touching_query() {
    let engine = Engine::new(test_wal_path("touching_query.wal")).unwrap();
    let h = hotel(&engine, "H", "100", &["R101"]).await;
    engine
        .create_reservation_as_of(request(h.id, Some(h.rooms[0]), "2024-01-10", "2024-01-11"), jan1())
        .await
        .unwrap();

    let offers = engine.available_units(&query("2024-01-11", "2024-01-12", "150")).await.unwrap();
    assert!(offers.is_empty());
    let offers = engine.available_units(&query("2024-01-12", "2024-01-13", "150")).await.unwrap();
    assert_eq!(offers.len(), 1);
}

#[tokio::test]
async fn offers_follow_creation_order() {
    let engine = Engine::new(test_wal_path("offer_order.wal")).unwrap();
    apartment(&engine, "A1", "50").await;
    let h = hotel(&engine, "H", "40", &["1", "2"]).await;
    let pricey = Ulid::new();
    engine.add_room_type(pricey, h.id, "Suite", dec("500")).await.unwrap();
    engine.add_room(Ulid::new(), pricey, "S1").await.unwrap();
    apartment(&engine, "A2", "200").await;
    apartment(&engine, "A3", "60").await;

    let offers = engine.available_units(&query("2024-03-01", "2024-03-03", "100")).await.unwrap();
    assert_eq!(titles(&offers), ["A1", "H - room 1", "H - room 2", "A3"]);

    let again = engine.available_units(&query("2024-03-01", "2024-03-03", "100")).await.unwrap();
    assert_eq!(offers, again);
}

#[tokio::test]
async fn apartment_over_budget_or_reserved_is_hidden() {
    let engine = Engine::new(test_wal_path("apartment_hidden.wal")).unwrap();
    let cheap = apartment(&engine, "Cheap", "40").await;
    apartment(&engine, "Dear", "80").await;

    let offers = engine.available_units(&query("2024-01-10", "2024-01-12", "50")).await.unwrap();
    assert_eq!(titles(&offers), ["Cheap"]);

    engine
        .create_reservation_as_of(request(cheap, None, "2024-01-12", "2024-01-12"), jan1())
        .await
        .unwrap();
    let offers = engine.available_units(&query("2024-01-10", "2024-01-12", "50")).await.unwrap();
    assert!(offers.is_empty());
}

#[tokio::test]
async fn query_window_limit() {
    let engine = Engine::new(test_wal_path("window_limit.wal")).unwrap();
    let start = d("2024-01-01");
    let end = start + Days::new(MAX_QUERY_WINDOW_DAYS as u64);
    let q = AvailabilityQuery::new(DateRange::new(start, end), dec("100"));
    let err = engine.available_units(&q).await.unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));
}

// ── Reservations ─────────────────────────────────────────

#[tokio::test]
async fn overlapping_reservation_conflicts_on_room() {
    let engine = Engine::new(test_wal_path("room_conflict.wal")).unwrap();
    let h = hotel(&engine, "H", "100", &["101", "102"]).await;
    engine
        .create_reservation_as_of(request(h.id, Some(h.rooms[0]), "2024-02-01", "2024-02-05"), jan1())
        .await
        .unwrap();

    let err = engine
        .create_reservation_as_of(request(h.id, Some(h.rooms[0]), "2024-02-05", "2024-02-07"), jan1())
        .await
        .unwrap_err();
    assert_eq!(err.sqlstate(), "23P01");
    assert_eq!(
        err.field_errors().unwrap().messages(Field::Room),
        ["Reservation already exists in 2024-02-05 ~ 2024-02-07"]
    );

    // Other room, and the day after, are free.
    engine
        .create_reservation_as_of(request(h.id, Some(h.rooms[1]), "2024-02-05", "2024-02-07"), jan1())
        .await
        .unwrap();
    engine
        .create_reservation_as_of(request(h.id, Some(h.rooms[0]), "2024-02-06", "2024-02-07"), jan1())
        .await
        .unwrap();
    assert_eq!(engine.reservation_count(), 3);
}

#[tokio::test]
async fn apartment_conflict_is_non_field_error() {
    let engine = Engine::new(test_wal_path("apartment_conflict.wal")).unwrap();
    let a = apartment(&engine, "Loft", "80").await;
    engine
        .create_reservation_as_of(request(a, None, "2024-05-10", "2024-05-10"), jan1())
        .await
        .unwrap();
    let err = engine
        .create_reservation_as_of(request(a, None, "2024-05-01", "2024-05-10"), jan1())
        .await
        .unwrap_err();
    assert!(err.field_errors().unwrap().has(Field::NonField));
}

#[tokio::test]
async fn apartment_reservation_drops_room() {
    let engine = Engine::new(test_wal_path("apartment_drops_room.wal")).unwrap();
    let a = apartment(&engine, "Loft", "80").await;
    let r = engine
        .create_reservation_as_of(request(a, Some(Ulid::new()), "2024-05-10", "2024-05-12"), jan1())
        .await
        .unwrap();
    assert_eq!(r.room_id, None);
    assert_eq!(r.unit_key(), UnitKey::Apartment(a));
}

#[tokio::test]
async fn inverted_dates_rejected_and_nothing_persisted() {
    let engine = Engine::new(test_wal_path("inverted_dates.wal")).unwrap();
    let h = hotel(&engine, "H", "100", &["101"]).await;
    let err = engine
        .create_reservation_as_of(request(h.id, Some(h.rooms[0]), "2024-03-10", "2024-03-08"), jan1())
        .await
        .unwrap_err();
    assert_eq!(err.sqlstate(), "22023");
    assert_eq!(
        err.field_errors().unwrap().messages(Field::CheckOut),
        ["Checkout must not be before checkin date."]
    );
    assert_eq!(engine.reservation_count(), 0);
    assert!(engine.list_reservations(None).await.is_empty());
}

#[tokio::test]
async fn hotel_reservation_needs_own_room() {
    let engine = Engine::new(test_wal_path("own_room.wal")).unwrap();
    let h = hotel(&engine, "H", "100", &["101"]).await;
    let other = hotel(&engine, "Other", "100", &["7"]).await;

    let err = engine
        .create_reservation_as_of(request(h.id, None, "2024-03-10", "2024-03-12"), jan1())
        .await
        .unwrap_err();
    assert_eq!(err.field_errors().unwrap().messages(Field::Room), ["This field is required."]);

    let err = engine
        .create_reservation_as_of(request(h.id, Some(other.rooms[0]), "2024-03-10", "2024-03-12"), jan1())
        .await
        .unwrap_err();
    assert_eq!(
        err.field_errors().unwrap().messages(Field::Room),
        ["7 does not belong to hotel H"]
    );

    let ghost = Ulid::new();
    let err = engine
        .create_reservation_as_of(request(h.id, Some(ghost), "2024-03-10", "2024-03-12"), jan1())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(id) if id == ghost));

    let err = engine
        .create_reservation_as_of(request(Ulid::new(), None, "2024-03-10", "2024-03-12"), jan1())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn field_errors_reported_together() {
    let engine = Engine::new(test_wal_path("errors_together.wal")).unwrap();
    let h = hotel(&engine, "H", "100", &["101"]).await;
    let err = engine
        .create_reservation_as_of(request(h.id, None, "2023-12-30", "2023-12-20"), jan1())
        .await
        .unwrap_err();
    let errors = err.field_errors().unwrap();
    assert!(errors.has(Field::Room));
    assert_eq!(errors.messages(Field::CheckIn), ["Invalid checkin date."]);
    assert!(errors.has(Field::CheckOut));
}

#[tokio::test]
async fn past_checkin_rejected_against_wall_clock() {
    let engine = Engine::new(test_wal_path("past_checkin.wal")).unwrap();
    let a = apartment(&engine, "Loft", "80").await;

    let err = engine
        .create_reservation(request(a, None, "2000-01-01", "2000-01-02"))
        .await
        .unwrap_err();
    assert!(err.field_errors().unwrap().has(Field::CheckIn));

    let soon = conflict::today() + Days::new(30);
    let req = ReservationRequest {
        id: Ulid::new(),
        listing_id: a,
        room_id: None,
        check_in: soon,
        check_out: soon + Days::new(2),
    };
    engine.create_reservation(req).await.unwrap();
}

#[tokio::test]
async fn duplicate_reservation_id_rejected() {
    let engine = Engine::new(test_wal_path("dup_reservation.wal")).unwrap();
    let a = apartment(&engine, "A", "80").await;
    let b = apartment(&engine, "B", "80").await;
    let first = request(a, None, "2024-05-10", "2024-05-12");
    let mut second = request(b, None, "2024-05-10", "2024-05-12");
    second.id = first.id;
    engine.create_reservation_as_of(first, jan1()).await.unwrap();
    let err = engine.create_reservation_as_of(second, jan1()).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(_)));
}

#[tokio::test]
async fn stay_length_limit() {
    let engine = Engine::new(test_wal_path("stay_limit.wal")).unwrap();
    let a = apartment(&engine, "A", "80").await;
    let check_in = d("2024-02-01");
    let req = ReservationRequest {
        id: Ulid::new(),
        listing_id: a,
        room_id: None,
        check_in,
        check_out: check_in + Days::new(MAX_STAY_DAYS as u64),
    };
    let err = engine.create_reservation_as_of(req, jan1()).await.unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));
}

#[tokio::test]
async fn list_reservations_filters_by_listing() {
    let engine = Engine::new(test_wal_path("list_reservations.wal")).unwrap();
    let h = hotel(&engine, "H", "100", &["1", "2"]).await;
    let a = apartment(&engine, "A", "80").await;
    engine
        .create_reservation_as_of(request(a, None, "2024-04-01", "2024-04-02"), jan1())
        .await
        .unwrap();
    engine
        .create_reservation_as_of(request(h.id, Some(h.rooms[1]), "2024-04-05", "2024-04-06"), jan1())
        .await
        .unwrap();
    engine
        .create_reservation_as_of(request(h.id, Some(h.rooms[0]), "2024-04-03", "2024-04-04"), jan1())
        .await
        .unwrap();

    let all = engine.list_reservations(None).await;
    let days: Vec<_> = all.iter().map(|r| r.stay.check_in.to_string()).collect();
    assert_eq!(days, ["2024-04-03", "2024-04-05", "2024-04-01"]);

    let only_apartment = engine.list_reservations(Some(a)).await;
    assert_eq!(only_apartment.len(), 1);
    assert_eq!(only_apartment[0].listing_id, a);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_bookings_of_one_room_admit_one() {
    let engine = Arc::new(Engine::new(test_wal_path("concurrent_room.wal")).unwrap());
    let h = hotel(&engine, "H", "100", &["101"]).await;

    let mut handles = Vec::new();
    for i in 0..16u64 {
        let eng = engine.clone();
        let req = ReservationRequest {
            id: Ulid::new(),
            listing_id: h.id,
            room_id: Some(h.rooms[0]),
            check_in: d("2024-06-01") + Days::new(i % 3),
            check_out: d("2024-06-05"),
        };
        handles.push(tokio::spawn(async move { eng.create_reservation_as_of(req, jan1()).await }));
    }

    let mut accepted = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(e) => assert_eq!(e.sqlstate(), "23P01"),
        }
    }
    assert_eq!(accepted, 1);
    assert_eq!(engine.reservation_count(), 1);
}

// ── Persistence ──────────────────────────────────────────

#[tokio::test]
async fn replay_restores_catalog_and_reservations() {
    let path = test_wal_path("replay.wal");
    let (h, a) = {
        let engine = Engine::new(path.clone()).unwrap();
        let h = hotel(&engine, "H", "100", &["101", "102"]).await;
        let a = apartment(&engine, "A", "80").await;
        engine
            .create_reservation_as_of(request(h.id, Some(h.rooms[0]), "2024-01-10", "2024-01-11"), jan1())
            .await
            .unwrap();
        engine
            .create_reservation_as_of(request(a, None, "2024-01-09", "2024-01-10"), jan1())
            .await
            .unwrap();
        (h, a)
    };

    let engine = Engine::new(path).unwrap();
    assert_eq!(engine.listing_count(), 2);
    assert_eq!(engine.reservation_count(), 2);
    let listing = engine.get_listing(&h.id).unwrap();
    assert_eq!(listing.room_count(), 2);
    assert_eq!(listing.room_types()[0].id, h.room_type);

    let offers = engine.available_units(&query("2024-01-10", "2024-01-10", "150")).await.unwrap();
    assert_eq!(titles(&offers), ["H - room 102"]);

    // Replayed reservations still guard their units.
    let err = engine
        .create_reservation_as_of(request(a, None, "2024-01-10", "2024-01-12"), jan1())
        .await
        .unwrap_err();
    assert_eq!(err.sqlstate(), "23P01");
    let unit = engine.get_unit(&UnitKey::Room(h.rooms[0])).unwrap();
    assert_eq!(unit.read().await.reservations.len(), 1);
}

#[tokio::test]
async fn group_commit_batches_appends() {
    let path = test_wal_path("group_commit_batch.wal");
    let engine = Arc::new(Engine::new(path.clone()).unwrap());
    let a = apartment(&engine, "A", "80").await;

    let n = 20u64;
    let mut handles = Vec::new();
    for i in 0..n {
        let eng = engine.clone();
        let day = d("2024-07-01") + Days::new(i * 2);
        let req = ReservationRequest {
            id: Ulid::new(),
            listing_id: a,
            room_id: None,
            check_in: day,
            check_out: day,
        };
        handles.push(tokio::spawn(async move { eng.create_reservation_as_of(req, jan1()).await }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(engine.reservation_count(), n as usize);

    let engine2 = Engine::new(path).unwrap();
    assert_eq!(engine2.list_reservations(Some(a)).await.len(), n as usize);
}
