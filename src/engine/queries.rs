use std::sync::Arc;

use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::UNITS_OFFERED;

use super::availability::available_units;
use super::validation::AvailabilityQuery;
use super::{Engine, EngineError};

impl Engine {
    /// Listings ordered by creation.
    fn listing_snapshot(&self) -> Vec<Arc<Listing>> {
        let mut listings: Vec<Arc<Listing>> = self.listings.iter().map(|e| e.value().clone()).collect();
        listings.sort_by_key(|l| l.seq);
        listings
    }

    /// Every unit whose price is within budget and which is free on each day
    /// of the query window. Only per-unit read locks are taken.
    pub async fn available_units(&self, query: &AvailabilityQuery) -> Result<Vec<UnitOffer>, EngineError> {
        if query.stay.days() > MAX_QUERY_WINDOW_DAYS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let listings = self.listing_snapshot();
        let units: Vec<_> = self.units.iter().map(|e| e.value().clone()).collect();

        let mut reserved = Vec::new();
        for unit in units {
            let guard = unit.read().await;
            reserved.extend(guard.overlapping(&query.stay).cloned());
        }

        let offers = available_units(listings.iter().map(|l| &**l), &reserved, query);
        metrics::histogram!(UNITS_OFFERED).record(offers.len() as f64);
        debug!(
            "availability {} ~ {} max {}: {} offers",
            query.stay.check_in,
            query.stay.check_out,
            query.max_price,
            offers.len()
        );
        Ok(offers)
    }

    pub fn list_listings(&self) -> Vec<ListingInfo> {
        self.listing_snapshot()
            .iter()
            .map(|l| ListingInfo::from(l.as_ref()))
            .collect()
    }

    /// Reservations ordered by listing creation, then check-in. Restricted to
    /// one listing when `listing_id` is given.
    pub async fn list_reservations(&self, listing_id: Option<Ulid>) -> Vec<Reservation> {
        let units: Vec<_> = self.units.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for unit in units {
            let guard = unit.read().await;
            out.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|r| listing_id.is_none_or(|id| r.listing_id == id))
                    .cloned(),
            );
        }

        let seq = |r: &Reservation| self.listings.get(&r.listing_id).map(|l| l.seq);
        out.sort_by(|a, b| {
            seq(a)
                .cmp(&seq(b))
                .then(a.stay.check_in.cmp(&b.stay.check_in))
                .then(a.id.cmp(&b.id))
        });
        out
    }

    pub fn listing_count(&self) -> usize {
        self.listings.len()
    }

    pub fn reservation_count(&self) -> usize {
        self.reservations.len()
    }
}
