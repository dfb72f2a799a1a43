//! Read-only referential integrity checks over one migrated trip document.
//!
//! Nothing here returns `Err`: every check produces a [`ValidationResult`] and
//! the caller decides whether a violation blocks the operation.

use crate::error::{ErrorKind, ValidationError, ValidationResult};
use crate::model::{CostTrackingLink, TravelItemRef, TripDocument};

fn with_trip(error: ValidationError, doc: &TripDocument) -> ValidationError {
    if doc.id.is_empty() {
        error
    } else {
        error.with_trip(doc.id.clone())
    }
}

/// Document-level preconditions shared by every check.
fn document_errors(doc: Option<&TripDocument>) -> Result<&TripDocument, ValidationError> {
    let Some(doc) = doc else {
        return Err(ValidationError::new(
            ErrorKind::InvalidTripData,
            "trip document is missing",
        ));
    };
    if doc.id.trim().is_empty() {
        return Err(ValidationError::new(
            ErrorKind::MissingTripId,
            "trip document has no id",
        ));
    }
    Ok(doc)
}

fn expense_error(expense_id: &str, doc: &TripDocument) -> Option<ValidationError> {
    if doc.find_expense(expense_id).is_some() {
        return None;
    }
    Some(with_trip(
        ValidationError::new(
            ErrorKind::ExpenseNotFound,
            format!("expense {expense_id} does not belong to trip {}", doc.id),
        )
        .with_expense(expense_id),
        doc,
    ))
}

fn travel_item_error(item_id: &str, doc: &TripDocument) -> Option<ValidationError> {
    if doc.find_travel_item(item_id).is_some() {
        return None;
    }
    Some(with_trip(
        ValidationError::new(
            ErrorKind::TravelItemNotFound,
            format!("travel item {item_id} does not belong to trip {}", doc.id),
        )
        .with_item(item_id),
        doc,
    ))
}

#[must_use]
pub fn validate_expense_belongs_to_trip(
    expense_id: &str,
    doc: Option<&TripDocument>,
) -> ValidationResult {
    match document_errors(doc) {
        Err(error) => ValidationResult::from_errors(vec![error.with_expense(expense_id)]),
        Ok(doc) => ValidationResult::from_errors(expense_error(expense_id, doc).into_iter().collect()),
    }
}

/// Searches locations, routes and accommodations. Route legs are not
/// addressable travel items.
#[must_use]
pub fn validate_travel_item_belongs_to_trip(
    item_id: &str,
    doc: Option<&TripDocument>,
) -> ValidationResult {
    match document_errors(doc) {
        Err(error) => ValidationResult::from_errors(vec![error.with_item(item_id)]),
        Ok(doc) => {
            ValidationResult::from_errors(travel_item_error(item_id, doc).into_iter().collect())
        }
    }
}

/// Both checks, accumulated in the order expense then item.
#[must_use]
pub fn validate_trip_boundary(
    expense_id: &str,
    item_id: &str,
    doc: Option<&TripDocument>,
) -> ValidationResult {
    let doc = match document_errors(doc) {
        Ok(doc) => doc,
        Err(error) => {
            return ValidationResult::from_errors(vec![error
                .with_expense(expense_id)
                .with_item(item_id)]);
        }
    };

    let errors = expense_error(expense_id, doc)
        .into_iter()
        .chain(travel_item_error(item_id, doc))
        .collect();
    ValidationResult::from_errors(errors)
}

fn link_errors<'a>(
    owner_id: &'a str,
    links: &'a [CostTrackingLink],
    doc: &'a TripDocument,
) -> impl Iterator<Item = ValidationError> + 'a {
    links
        .iter()
        .filter_map(move |link| expense_error(&link.expense_id, doc))
        .map(move |error| error.with_item(owner_id))
}

/// Every link on `item` (and on its legs, for routes) must name an expense
/// declared in `doc`.
#[must_use]
pub fn validate_cost_tracking_links(item: TravelItemRef<'_>, doc: &TripDocument) -> ValidationResult {
    let mut errors = link_errors(item.id(), item.cost_tracking_links(), doc).collect::<Vec<_>>();
    if let TravelItemRef::Route(route) = item {
        for segment in &route.sub_routes {
            errors.extend(link_errors(&segment.id, &segment.cost_tracking_links, doc));
        }
    }
    ValidationResult::from_errors(errors)
}

/// Whole-document sweep: every link on every travel item, plus any legacy
/// `travelReference` still present on an expense.
#[must_use]
pub fn validate_all_trip_boundaries(doc: &TripDocument) -> ValidationResult {
    let mut result = match document_errors(Some(doc)) {
        Ok(_) => ValidationResult::valid(),
        Err(error) => ValidationResult::from_errors(vec![error]),
    };

    for item in doc.travel_items() {
        result.absorb(validate_cost_tracking_links(item, doc));
    }

    for expense in doc.expenses() {
        let Some(reference) = &expense.travel_reference else {
            continue;
        };
        let (kind, item_id) = reference.target();
        if doc.find_travel_item_of(kind, item_id).is_none() {
            result.absorb(ValidationResult::from_errors(vec![with_trip(
                ValidationError::new(
                    ErrorKind::TravelItemNotFound,
                    format!(
                        "expense {} references {kind} {item_id} outside trip {}",
                        expense.id, doc.id
                    ),
                )
                .with_expense(expense.id.clone())
                .with_item(item_id),
                doc,
            )]));
        }
    }

    result
}

/// Runs the whole-document sweep and logs any violations.
pub fn sweep_and_log(doc: &TripDocument, operation: &str) -> ValidationResult {
    let result = validate_all_trip_boundaries(doc);
    if !result.is_valid {
        tracing::warn!(
            trip_id = %doc.id,
            operation,
            error_count = result.errors.len(),
            errors = %result.summary(),
            "trip boundary sweep found violations"
        );
    }
    result
}
