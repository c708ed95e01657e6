use std::collections::BTreeMap;

use serde::Serialize;
use ulid::Ulid;

/// Input field a validation message is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Checkin,
    Checkout,
    MaxPrice,
    Room,
    CheckIn,
    CheckOut,
    ListingType,
    Title,
    Country,
    City,
    Price,
    RoomNumber,
    #[serde(rename = "non_field_errors")]
    NonField,
}

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Checkin => "checkin",
            Field::Checkout => "checkout",
            Field::MaxPrice => "max_price",
            Field::Room => "room",
            Field::CheckIn => "check_in",
            Field::CheckOut => "check_out",
            Field::ListingType => "listing_type",
            Field::Title => "title",
            Field::Country => "country",
            Field::City => "city",
            Field::Price => "price",
            Field::RoomNumber => "room_number",
            Field::NonField => "non_field_errors",
        }
    }
}

/// Field-scoped validation messages, collected the way a form collects them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidationErrors {
    fields: BTreeMap<Field, Vec<String>>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(field: Field, message: impl Into<String>) -> Self {
        let mut errors = Self::new();
        errors.add(field, message);
        errors
    }

    pub fn add(&mut self, field: Field, message: impl Into<String>) {
        self.fields.entry(field).or_default().push(message.into());
    }

    pub fn merge(&mut self, other: ValidationErrors) {
        for (field, messages) in other.fields {
            self.fields.entry(field).or_default().extend(messages);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn has(&self, field: Field) -> bool {
        self.fields.contains_key(&field)
    }

    pub fn messages(&self, field: Field) -> &[String] {
        self.fields.get(&field).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn fields(&self) -> impl Iterator<Item = Field> + '_ {
        self.fields.keys().copied()
    }

    /// `Ok(())` when nothing was collected.
    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }

    /// JSON object `{field: [messages]}`.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.to_string())
    }
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (field, messages) in &self.fields {
            for message in messages {
                if !first {
                    f.write_str("; ")?;
                }
                first = false;
                write!(f, "{}: {message}", field.as_str())?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    Validation(ValidationErrors),
    /// The requested stay overlaps an existing reservation of the same unit.
    Conflict {
        existing: Ulid,
        errors: ValidationErrors,
    },
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn validation(field: Field, message: impl Into<String>) -> Self {
        EngineError::Validation(ValidationErrors::single(field, message))
    }

    /// Field errors carried by this error, if it is user-correctable.
    pub fn field_errors(&self) -> Option<&ValidationErrors> {
        match self {
            EngineError::Validation(errors) | EngineError::Conflict { errors, .. } => Some(errors),
            _ => None,
        }
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::Validation(_) => "validation",
            EngineError::Conflict { .. } => "conflict",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }

    /// SQLSTATE reported to wire clients.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "P0002",
            EngineError::AlreadyExists(_) => "23505",
            EngineError::Validation(_) => "22023",
            EngineError::Conflict { .. } => "23P01",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::WalError(_) => "58030",
        }
    }
}

impl From<ValidationErrors> for EngineError {
    fn from(errors: ValidationErrors) -> Self {
        EngineError::Validation(errors)
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Validation(errors) => write!(f, "validation failed: {}", errors.to_json()),
            EngineError::Conflict { existing, errors } => {
                write!(f, "conflict with reservation {existing}: {}", errors.to_json())
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
