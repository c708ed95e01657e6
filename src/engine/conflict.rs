use chrono::NaiveDate;

use crate::model::*;

use super::error::{EngineError, Field, ValidationErrors};

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn today() -> NaiveDate {
    chrono::Utc::now().date_naive()
}

/// First reservation in `existing` that holds `unit` on any day of `stay`.
pub fn find_conflict<'a>(
    unit: UnitKey,
    stay: &DateRange,
    existing: impl IntoIterator<Item = &'a Reservation>,
) -> Option<&'a Reservation> {
    existing
        .into_iter()
        .find(|r| r.unit_key() == unit && r.stay.overlaps(stay))
}

/// True iff some reservation in `existing` holds `unit` on a day of `stay`.
///
/// Boundaries are inclusive: `existing.check_in <= stay.check_out` and
/// `existing.check_out >= stay.check_in`.
pub fn conflicts<'a>(
    unit: UnitKey,
    stay: &DateRange,
    existing: impl IntoIterator<Item = &'a Reservation>,
) -> bool {
    find_conflict(unit, stay, existing).is_some()
}

/// Commit-time gate: caller holds the unit's write lock.
pub(crate) fn check_no_conflict(unit: &UnitState, stay: &DateRange) -> Result<(), EngineError> {
    let Some(existing) = find_conflict(unit.key, stay, unit.overlapping(stay)) else {
        return Ok(());
    };
    let field = match unit.key {
        UnitKey::Room(_) => Field::Room,
        UnitKey::Apartment(_) => Field::NonField,
    };
    Err(EngineError::Conflict {
        existing: existing.id,
        errors: ValidationErrors::single(
            field,
            format!(
                "Reservation already exists in {} ~ {}",
                stay.check_in, stay.check_out
            ),
        ),
    })
}
