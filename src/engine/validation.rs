//! Input cleaning shared by the wire layer and the engine.
//!
//! Each parser reports problems as [`ValidationErrors`] keyed by the field the
//! caller supplied, so several bad fields are reported together.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use ulid::Ulid;

use crate::model::{DateRange, ListingType};

use super::error::{Field, ValidationErrors};

pub const REQUIRED: &str = "This field is required.";
pub const BAD_DATE: &str = "Date has wrong format. Use YYYY-MM-DD.";
pub const BAD_NUMBER: &str = "A valid number is required.";
pub const NOT_POSITIVE: &str = "Ensure this value is greater than 0.";
pub const INVALID_CHECKIN: &str = "Invalid checkin date.";
pub const CHECKOUT_BEFORE_CHECKIN: &str = "Checkout must not be before checkin date.";

/// Prices are stored as `DECIMAL(7, 2)`.
pub const PRICE_MAX_DIGITS: u32 = 7;
pub const PRICE_DECIMAL_PLACES: u32 = 2;

/// Cleaned input of the availability query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailabilityQuery {
    pub stay: DateRange,
    pub max_price: Decimal,
}

impl AvailabilityQuery {
    pub fn new(stay: DateRange, max_price: Decimal) -> Self {
        Self { stay, max_price }
    }

    /// Clean the raw `checkin`, `checkout` and `max_price` parameters.
    pub fn parse(
        checkin: Option<&str>,
        checkout: Option<&str>,
        max_price: Option<&str>,
    ) -> Result<Self, ValidationErrors> {
        let mut errors = ValidationErrors::new();
        let checkin = collect(&mut errors, required(Field::Checkin, checkin).and_then(|s| parse_date(Field::Checkin, s)));
        let checkout = collect(&mut errors, required(Field::Checkout, checkout).and_then(|s| parse_date(Field::Checkout, s)));
        let max_price = collect(&mut errors, required(Field::MaxPrice, max_price).and_then(|s| parse_price(Field::MaxPrice, s)));

        if let (Some(ci), Some(co)) = (checkin, checkout)
            && ci > co
        {
            errors.add(Field::Checkout, CHECKOUT_BEFORE_CHECKIN);
        }

        match (checkin, checkout, max_price) {
            (Some(ci), Some(co), Some(max_price)) if errors.is_empty() => {
                Ok(Self::new(DateRange::new(ci, co), max_price))
            }
            _ => Err(errors),
        }
    }
}

/// A reservation as submitted, before checks against the catalog and the
/// existing reservations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRequest {
    pub id: Ulid,
    pub listing_id: Ulid,
    pub room_id: Option<Ulid>,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
}

impl ReservationRequest {
    /// Build a request from raw date text, reporting malformed dates per field.
    pub fn parse(
        id: Ulid,
        listing_id: Ulid,
        room_id: Option<Ulid>,
        check_in: &str,
        check_out: &str,
    ) -> Result<Self, ValidationErrors> {
        let mut errors = ValidationErrors::new();
        let check_in = collect(&mut errors, parse_date(Field::CheckIn, check_in));
        let check_out = collect(&mut errors, parse_date(Field::CheckOut, check_out));
        match (check_in, check_out) {
            (Some(check_in), Some(check_out)) => Ok(Self {
                id,
                listing_id,
                room_id,
                check_in,
                check_out,
            }),
            _ => Err(errors),
        }
    }

    /// Date checks that need no catalog access: no check-in in the past and
    /// check-out not before check-in.
    pub fn check_dates(&self, today: NaiveDate, errors: &mut ValidationErrors) {
        if self.check_in < today {
            errors.add(Field::CheckIn, INVALID_CHECKIN);
        }
        if self.check_in > self.check_out {
            errors.add(Field::CheckOut, CHECKOUT_BEFORE_CHECKIN);
        }
    }
}

fn collect<T>(errors: &mut ValidationErrors, result: Result<T, ValidationErrors>) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            errors.merge(e);
            None
        }
    }
}

fn required(field: Field, value: Option<&str>) -> Result<&str, ValidationErrors> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ValidationErrors::single(field, REQUIRED)),
    }
}

/// Parse a listing type choice (`hotel` or `apartment`).
pub fn parse_listing_type(raw: &str) -> Result<ListingType, ValidationErrors> {
    ListingType::parse(raw).ok_or_else(|| {
        ValidationErrors::single(Field::ListingType, format!("\"{}\" is not a valid choice.", raw.trim()))
    })
}

/// Parse an ISO-8601 calendar date (`YYYY-MM-DD`).
pub fn parse_date(field: Field, raw: &str) -> Result<NaiveDate, ValidationErrors> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| ValidationErrors::single(field, BAD_DATE))
}

/// Parse a positive decimal price with at most 2 fractional and 7 total digits.
pub fn parse_price(field: Field, raw: &str) -> Result<Decimal, ValidationErrors> {
    let raw = raw.trim();
    let well_formed = !raw.is_empty()
        && raw
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+'));
    let value = if well_formed { raw.parse::<Decimal>().ok() } else { None };
    let value = value.ok_or_else(|| ValidationErrors::single(field, BAD_NUMBER))?;
    check_price(field, value)?;
    Ok(value)
}

/// Domain checks for an already-numeric price.
pub fn check_price(field: Field, value: Decimal) -> Result<(), ValidationErrors> {
    if value <= Decimal::ZERO {
        return Err(ValidationErrors::single(field, NOT_POSITIVE));
    }
    let decimal_places = value.scale();
    let digits = digit_count(value.mantissa().unsigned_abs());
    let total_digits = digits.max(decimal_places);
    let whole_digits = total_digits - decimal_places;
    let max_whole = PRICE_MAX_DIGITS - PRICE_DECIMAL_PLACES;

    if total_digits > PRICE_MAX_DIGITS {
        Err(ValidationErrors::single(
            field,
            format!("Ensure that there are no more than {PRICE_MAX_DIGITS} digits in total."),
        ))
    } else if decimal_places > PRICE_DECIMAL_PLACES {
        Err(ValidationErrors::single(
            field,
            format!("Ensure that there are no more than {PRICE_DECIMAL_PLACES} decimal places."),
        ))
    } else if whole_digits > max_whole {
        Err(ValidationErrors::single(
            field,
            format!("Ensure that there are no more than {max_whole} digits before the decimal point."),
        ))
    } else {
        Ok(())
    }
}

fn digit_count(mut n: u128) -> u32 {
    let mut digits = 0;
    while n > 0 {
        digits += 1;
        n /= 10;
    }
    digits
}

/// Clean a required free-text field, enforcing a maximum length.
pub fn required_text(
    field: Field,
    raw: &str,
    max_len: usize,
    errors: &mut ValidationErrors,
) -> Option<String> {
    let value = raw.trim();
    if value.is_empty() {
        errors.add(field, REQUIRED);
        None
    } else if value.chars().count() > max_len {
        errors.add(field, format!("Ensure this field has no more than {max_len} characters."));
        None
    } else {
        Some(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn availability_query_parses() {
        let q = AvailabilityQuery::parse(Some("2024-01-10"), Some("2024-01-12"), Some("150")).unwrap();
        assert_eq!(q.stay, DateRange::new(d("2024-01-10"), d("2024-01-12")));
        assert_eq!(q.max_price, Decimal::new(150, 0));
    }

    #[test]
    fn availability_query_same_day_is_valid() {
        let q = AvailabilityQuery::parse(Some("2024-01-10"), Some("2024-01-10"), Some("99.99")).unwrap();
        assert_eq!(q.stay.days(), 1);
        assert_eq!(q.max_price, Decimal::new(9999, 2));
    }

    #[test]
    fn availability_query_reports_all_missing_fields() {
        let errors = AvailabilityQuery::parse(None, Some(" "), None).unwrap_err();
        for field in [Field::Checkin, Field::Checkout, Field::MaxPrice] {
            assert_eq!(errors.messages(field), [REQUIRED]);
        }
    }

    #[test]
    fn availability_query_rejects_inverted_range() {
        let errors = AvailabilityQuery::parse(Some("2024-01-12"), Some("2024-01-10"), Some("100")).unwrap_err();
        assert_eq!(errors.messages(Field::Checkout), [CHECKOUT_BEFORE_CHECKIN]);
        assert!(!errors.has(Field::Checkin));
    }

    #[test]
    fn availability_query_rejects_bad_dates() {
        let errors = AvailabilityQuery::parse(Some("10/01/2024"), Some("2024-02-30"), Some("100")).unwrap_err();
        assert_eq!(errors.messages(Field::Checkin), [BAD_DATE]);
        assert_eq!(errors.messages(Field::Checkout), [BAD_DATE]);
    }

    #[test]
    fn price_domain() {
        assert_eq!(parse_price(Field::MaxPrice, "0.01").unwrap(), Decimal::new(1, 2));
        assert_eq!(parse_price(Field::MaxPrice, "99999.99").unwrap(), Decimal::new(9_999_999, 2));
        assert_eq!(parse_price(Field::MaxPrice, " 150 ").unwrap(), Decimal::new(150, 0));

        let msg = |raw: &str| parse_price(Field::MaxPrice, raw).unwrap_err().messages(Field::MaxPrice)[0].clone();
        assert_eq!(msg("0"), NOT_POSITIVE);
        assert_eq!(msg("-5"), NOT_POSITIVE);
        assert_eq!(msg("abc"), BAD_NUMBER);
        assert_eq!(msg("1e3"), BAD_NUMBER);
        assert_eq!(msg("NaN"), BAD_NUMBER);
        assert_eq!(msg(""), BAD_NUMBER);
        assert_eq!(msg("1.005"), "Ensure that there are no more than 2 decimal places.");
        assert_eq!(msg("12345678"), "Ensure that there are no more than 7 digits in total.");
        assert_eq!(msg("123456"), "Ensure that there are no more than 5 digits before the decimal point.");
    }

    #[test]
    fn reservation_request_reports_bad_dates_per_field() {
        let errors = ReservationRequest::parse(Ulid::new(), Ulid::new(), None, "tomorrow", "2024-01-12").unwrap_err();
        assert_eq!(errors.messages(Field::CheckIn), [BAD_DATE]);
        assert!(!errors.has(Field::CheckOut));
    }

    #[test]
    fn reservation_request_date_checks() {
        let req = ReservationRequest::parse(Ulid::new(), Ulid::new(), None, "2024-01-12", "2024-01-10").unwrap();
        let mut errors = ValidationErrors::new();
        req.check_dates(d("2024-01-11"), &mut errors);
        assert_eq!(errors.messages(Field::CheckIn), [INVALID_CHECKIN]);
        assert_eq!(errors.messages(Field::CheckOut), [CHECKOUT_BEFORE_CHECKIN]);

        let req = ReservationRequest::parse(Ulid::new(), Ulid::new(), None, "2024-01-12", "2024-01-12").unwrap();
        let mut errors = ValidationErrors::new();
        req.check_dates(d("2024-01-12"), &mut errors);
        assert!(errors.is_empty());
    }

    #[test]
    fn listing_type_choices() {
        assert_eq!(parse_listing_type(" Hotel").unwrap(), ListingType::Hotel);
        let errors = parse_listing_type("villa").unwrap_err();
        assert_eq!(errors.messages(Field::ListingType), ["\"villa\" is not a valid choice."]);
    }

    #[test]
    fn required_text_limits() {
        let mut errors = ValidationErrors::new();
        assert_eq!(required_text(Field::Title, "  Loft ", 10, &mut errors).as_deref(), Some("Loft"));
        assert!(required_text(Field::Title, "   ", 10, &mut errors).is_none());
        assert!(required_text(Field::City, "Llanfairpwll", 5, &mut errors).is_none());
        assert_eq!(errors.messages(Field::Title), [REQUIRED]);
        assert!(errors.has(Field::City));
    }
}
