use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Stable error taxonomy surfaced to callers of the ledger.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ExpenseNotFound,
    TravelItemNotFound,
    CrossTripReference,
    InvalidTripData,
    MissingTripId,
    DuplicateLink,
    SplitValidationFailed,
    ValidationError,
    Conflict,
    StoreError,
}

/// Transport-neutral status categories for [`ErrorKind`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StatusClass {
    NotFound,
    BadRequest,
    Conflict,
    Internal,
}

impl StatusClass {
    #[must_use]
    pub fn http_status(self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::BadRequest => 400,
            Self::Conflict => 409,
            Self::Internal => 500,
        }
    }
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExpenseNotFound => "EXPENSE_NOT_FOUND",
            Self::TravelItemNotFound => "TRAVEL_ITEM_NOT_FOUND",
            Self::CrossTripReference => "CROSS_TRIP_REFERENCE",
            Self::InvalidTripData => "INVALID_TRIP_DATA",
            Self::MissingTripId => "MISSING_TRIP_ID",
            Self::DuplicateLink => "DUPLICATE_LINK",
            Self::SplitValidationFailed => "SPLIT_VALIDATION_FAILED",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::Conflict => "CONFLICT",
            Self::StoreError => "STORE_ERROR",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "EXPENSE_NOT_FOUND" => Some(Self::ExpenseNotFound),
            "TRAVEL_ITEM_NOT_FOUND" => Some(Self::TravelItemNotFound),
            "CROSS_TRIP_REFERENCE" => Some(Self::CrossTripReference),
            "INVALID_TRIP_DATA" => Some(Self::InvalidTripData),
            "MISSING_TRIP_ID" => Some(Self::MissingTripId),
            "DUPLICATE_LINK" => Some(Self::DuplicateLink),
            "SPLIT_VALIDATION_FAILED" => Some(Self::SplitValidationFailed),
            "VALIDATION_ERROR" => Some(Self::ValidationError),
            "CONFLICT" => Some(Self::Conflict),
            "STORE_ERROR" => Some(Self::StoreError),
            _ => None,
        }
    }

    #[must_use]
    pub fn status(self) -> StatusClass {
        match self {
            Self::ExpenseNotFound | Self::TravelItemNotFound => StatusClass::NotFound,
            Self::CrossTripReference
            | Self::InvalidTripData
            | Self::MissingTripId
            | Self::SplitValidationFailed
            | Self::ValidationError => StatusClass::BadRequest,
            Self::DuplicateLink | Self::Conflict => StatusClass::Conflict,
            Self::StoreError => StatusClass::Internal,
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single boundary violation. Validators accumulate these instead of failing.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationError {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expense_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trip_id: Option<String>,
}

impl ValidationError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            item_id: None,
            expense_id: None,
            trip_id: None,
        }
    }

    #[must_use]
    pub fn with_item(mut self, item_id: impl Into<String>) -> Self {
        self.item_id = Some(item_id.into());
        self
    }

    #[must_use]
    pub fn with_expense(mut self, expense_id: impl Into<String>) -> Self {
        self.expense_id = Some(expense_id.into());
        self
    }

    #[must_use]
    pub fn with_trip(mut self, trip_id: impl Into<String>) -> Self {
        self.trip_id = Some(trip_id.into());
        self
    }
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Caller-facing validation payload: `{isValid, errors}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<ValidationError>,
}

impl ValidationResult {
    #[must_use]
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
        }
    }

    #[must_use]
    pub fn from_errors(errors: Vec<ValidationError>) -> Self {
        Self {
            is_valid: errors.is_empty(),
            errors,
        }
    }

    pub fn absorb(&mut self, other: Self) {
        self.errors.extend(other.errors);
        self.is_valid = self.errors.is_empty();
    }

    #[must_use]
    pub fn has_kind(&self, kind: ErrorKind) -> bool {
        self.errors.iter().any(|error| error.kind == kind)
    }

    /// Joins every error into one line for logs and CLI output.
    #[must_use]
    pub fn summary(&self) -> String {
        self.errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}
