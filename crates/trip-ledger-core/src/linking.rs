//! Expense ↔ travel item links.
//!
//! The travel-item side (`costTrackingLinks`) is the single source of truth.
//! Writes here clear any legacy `travelReference` on the expense; callers that
//! still want that pointer get it from [`derive_travel_reference`].

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::config::{LedgerConfig, SplitConfig};
use crate::error::{ErrorKind, ValidationError, ValidationResult};
use crate::model::{
    CostTrackingLink, DroppedLink, SplitMode, TravelItemKind, TravelReference, TripDocument,
    TripId, CURRENT_SCHEMA_VERSION,
};
use crate::store::{post_write_check, StoreError, TripBlobStore, UnifiedDataStore};

const MAX_SAVE_ATTEMPTS: usize = 3;

/// Where an expense should be linked, and how its amount is split there.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LinkTarget {
    pub kind: TravelItemKind,
    pub item_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_mode: Option<SplitMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_value: Option<f64>,
}

impl LinkTarget {
    #[must_use]
    pub fn new(kind: TravelItemKind, item_id: impl Into<String>) -> Self {
        Self {
            kind,
            item_id: item_id.into(),
            description: None,
            split_mode: None,
            split_value: None,
        }
    }

    #[must_use]
    pub fn with_split(mut self, mode: SplitMode, value: f64) -> Self {
        self.split_mode = Some(mode);
        self.split_value = Some(value);
        self
    }

    fn to_link(&self, expense_id: &str) -> CostTrackingLink {
        CostTrackingLink {
            expense_id: expense_id.to_string(),
            description: self.description.clone(),
            split_mode: self.split_mode,
            split_value: self.split_value,
        }
    }
}

/// Expense-side view of one link, derived from the travel items.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExpenseLink {
    pub kind: TravelItemKind,
    pub item_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_route_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_mode: Option<SplitMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_value: Option<f64>,
}

#[derive(Debug, thiserror::Error)]
pub enum LinkingError {
    #[error("invalid link request: {0}")]
    InvalidRequest(String),
    #[error("expense {expense_id} not found in trip {trip_id}")]
    ExpenseNotFound { trip_id: String, expense_id: String },
    #[error("link targets outside trip: {}", .0.summary())]
    CrossTripReference(ValidationResult),
    #[error("expense {expense_id} is linked to {kind} {item_id} more than once")]
    DuplicateLink {
        expense_id: String,
        kind: TravelItemKind,
        item_id: String,
    },
    #[error("split validation failed: {0}")]
    SplitValidation(String),
    #[error("write rejected by trip boundary sweep: {}", .0.summary())]
    Boundary(ValidationResult),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LinkingError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest(_) => ErrorKind::ValidationError,
            Self::ExpenseNotFound { .. } => ErrorKind::ExpenseNotFound,
            Self::CrossTripReference(_) => ErrorKind::CrossTripReference,
            Self::DuplicateLink { .. } => ErrorKind::DuplicateLink,
            Self::SplitValidation(_) => ErrorKind::SplitValidationFailed,
            Self::Boundary(result) => result
                .errors
                .first()
                .map_or(ErrorKind::ValidationError, |error| error.kind),
            Self::Store(err) => err.kind(),
        }
    }

    /// Structured errors behind this failure, for the caller-facing envelope.
    #[must_use]
    pub fn details(&self) -> Vec<ValidationError> {
        match self {
            Self::CrossTripReference(result) | Self::Boundary(result) => result.errors.clone(),
            Self::ExpenseNotFound {
                trip_id,
                expense_id,
            } => vec![ValidationError::new(ErrorKind::ExpenseNotFound, self.to_string())
                .with_expense(expense_id.clone())
                .with_trip(trip_id.clone())],
            Self::DuplicateLink {
                expense_id,
                item_id,
                ..
            } => vec![ValidationError::new(ErrorKind::DuplicateLink, self.to_string())
                .with_expense(expense_id.clone())
                .with_item(item_id.clone())],
            _ => vec![ValidationError::new(self.kind(), self.to_string())],
        }
    }
}

fn split_value_of(target: &LinkTarget) -> Result<Option<(SplitMode, f64)>, LinkingError> {
    let mode = match target.split_mode {
        None | Some(SplitMode::Equal) => return Ok(None),
        Some(mode) => mode,
    };
    match target.split_value {
        Some(value) if value.is_finite() && value >= 0.0 => Ok(Some((mode, value))),
        Some(value) => Err(LinkingError::SplitValidation(format!(
            "{} split on {} has invalid value {value}",
            mode.as_str(),
            target.item_id
        ))),
        None => Err(LinkingError::SplitValidation(format!(
            "{} split on {} needs a splitValue",
            mode.as_str(),
            target.item_id
        ))),
    }
}

/// Percentage links must sum to 100 and fixed links to the expense amount,
/// each within the configured tolerance. Equal splits carry no value.
///
/// # Errors
/// Returns [`LinkingError::SplitValidation`] describing the first violated rule.
pub fn validate_split(
    targets: &[LinkTarget],
    expense_amount: f64,
    tolerances: &SplitConfig,
) -> Result<(), LinkingError> {
    let mut percentage = None::<f64>;
    let mut fixed = None::<f64>;

    for target in targets {
        match split_value_of(target)? {
            Some((SplitMode::Percentage, value)) => {
                *percentage.get_or_insert(0.0) += value;
            }
            Some((SplitMode::Fixed, value)) => {
                *fixed.get_or_insert(0.0) += value;
            }
            Some((SplitMode::Equal, _)) | None => {}
        }
    }

    // Absorbs binary rounding so a sum exactly on the tolerance edge passes.
    let slack = 1e-9;
    if let Some(sum) = percentage {
        if (sum - 100.0).abs() > tolerances.percentage_tolerance + slack {
            return Err(LinkingError::SplitValidation(format!(
                "percentage splits sum to {sum}, expected 100 ± {}",
                tolerances.percentage_tolerance
            )));
        }
    }
    if let Some(sum) = fixed {
        if (sum - expense_amount).abs() > tolerances.fixed_amount_tolerance + slack {
            return Err(LinkingError::SplitValidation(format!(
                "fixed splits sum to {sum}, expected {expense_amount} ± {}",
                tolerances.fixed_amount_tolerance
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    /// At most one link per expense; a new target replaces the old one.
    Single,
    /// One link per target, validated as a split.
    Multiple,
}

fn check_request(
    doc: &TripDocument,
    expense_id: &str,
    targets: &[LinkTarget],
    mode: LinkMode,
    split: &SplitConfig,
) -> Result<(), LinkingError> {
    check_expense(doc, expense_id)?;
    if targets.is_empty() {
        return Err(LinkingError::InvalidRequest(
            "at least one link target is required".to_string(),
        ));
    }

    let missing = targets
        .iter()
        .filter(|target| doc.find_travel_item_of(target.kind, &target.item_id).is_none())
        .map(|target| {
            ValidationError::new(
                ErrorKind::TravelItemNotFound,
                format!(
                    "{} {} does not belong to trip {}",
                    target.kind, target.item_id, doc.id
                ),
            )
            .with_item(target.item_id.clone())
            .with_expense(expense_id)
            .with_trip(doc.id.clone())
        })
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        return Err(LinkingError::CrossTripReference(
            ValidationResult::from_errors(missing),
        ));
    }

    let mut seen = BTreeSet::new();
    for target in targets {
        if !seen.insert((target.kind, target.item_id.as_str())) {
            return Err(LinkingError::DuplicateLink {
                expense_id: expense_id.to_string(),
                kind: target.kind,
                item_id: target.item_id.clone(),
            });
        }
    }

    match mode {
        LinkMode::Single => targets.iter().try_for_each(|target| split_value_of(target).map(drop)),
        LinkMode::Multiple => {
            let amount = doc.find_expense(expense_id).map_or(0.0, |expense| expense.amount);
            validate_split(targets, amount, split)
        }
    }
}

fn check_expense(doc: &TripDocument, expense_id: &str) -> Result<(), LinkingError> {
    if expense_id.trim().is_empty() {
        return Err(LinkingError::InvalidRequest("expense id is required".to_string()));
    }
    if doc.schema_version < CURRENT_SCHEMA_VERSION {
        return Err(LinkingError::InvalidRequest(format!(
            "trip {} is at schema version {} and must be migrated to {CURRENT_SCHEMA_VERSION} first",
            doc.id, doc.schema_version
        )));
    }
    if doc.find_expense(expense_id).is_none() {
        return Err(LinkingError::ExpenseNotFound {
            trip_id: doc.id.clone(),
            expense_id: expense_id.to_string(),
        });
    }
    Ok(())
}

fn clear_expense_links(doc: &mut TripDocument, expense_id: &str) -> Vec<DroppedLink> {
    let dropped = doc.retain_links(|_, link| link.expense_id != expense_id);
    if let Some(expense) = doc.find_expense_mut(expense_id) {
        expense.travel_reference = None;
    }
    dropped
}

/// Validates and applies a link request to `doc` in place. On error `doc` is
/// untouched. Returns the links that were replaced.
///
/// # Errors
/// The first failed precondition, in the order: request shape, schema
/// version, expense, targets, duplicates, split rules.
pub fn link_expense(
    doc: &mut TripDocument,
    expense_id: &str,
    targets: &[LinkTarget],
    mode: LinkMode,
    split: &SplitConfig,
) -> Result<Vec<DroppedLink>, LinkingError> {
    if mode == LinkMode::Single && targets.len() > 1 {
        return Err(LinkingError::InvalidRequest(
            "single-link mode takes exactly one target".to_string(),
        ));
    }
    check_request(doc, expense_id, targets, mode, split)?;

    let dropped = clear_expense_links(doc, expense_id);
    for target in targets {
        if let Some(links) = doc.links_mut(target.kind, &target.item_id) {
            links.push(target.to_link(expense_id));
        }
    }
    Ok(dropped)
}

/// Removes every link for `expense_id` and its legacy mirror.
///
/// # Errors
/// Request shape, schema version and expense preconditions.
pub fn unlink_expense(
    doc: &mut TripDocument,
    expense_id: &str,
) -> Result<Vec<DroppedLink>, LinkingError> {
    check_expense(doc, expense_id)?;
    Ok(clear_expense_links(doc, expense_id))
}

/// Every travel item (including route legs) linked to `expense_id`.
#[must_use]
pub fn expense_links(doc: &TripDocument, expense_id: &str) -> Vec<ExpenseLink> {
    doc.link_owners_for(expense_id)
        .into_iter()
        .map(|(owner, link)| ExpenseLink {
            kind: owner.kind,
            item_id: owner.item_id,
            parent_route_id: owner.parent_route_id,
            description: link.description,
            split_mode: link.split_mode,
            split_value: link.split_value,
        })
        .collect()
}

/// Legacy expense-side pointer computed from the first link. Links on route
/// legs point at the parent route.
#[must_use]
pub fn derive_travel_reference(doc: &TripDocument, expense_id: &str) -> Option<TravelReference> {
    let link = expense_links(doc, expense_id).into_iter().next()?;
    let item_id = link.parent_route_id.as_deref().unwrap_or(&link.item_id);
    Some(TravelReference::to_item(link.kind, item_id, link.description.clone()))
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkOutcome {
    pub document: TripDocument,
    pub links: Vec<ExpenseLink>,
    pub replaced: usize,
    pub sweep: ValidationResult,
}

/// Link writes for one trip: load, check, mutate, sweep, compare-and-swap
/// save, retrying a bounded number of times when the save conflicts.
pub struct ExpenseLinkingService<'a, S> {
    store: &'a mut UnifiedDataStore<S>,
    trip_id: TripId,
}

impl<'a, S: TripBlobStore> ExpenseLinkingService<'a, S> {
    pub fn new(store: &'a mut UnifiedDataStore<S>, trip_id: TripId) -> Self {
        Self { store, trip_id }
    }

    /// # Errors
    /// See [`link_expense`]; store errors otherwise.
    pub fn create_or_update_link(
        &mut self,
        expense_id: &str,
        target: &LinkTarget,
    ) -> Result<LinkOutcome, LinkingError> {
        let targets = std::slice::from_ref(target);
        self.write("create_or_update_link", expense_id, |doc, split| {
            link_expense(doc, expense_id, targets, LinkMode::Single, split)
        })
    }

    /// # Errors
    /// See [`link_expense`]; store errors otherwise.
    pub fn create_multiple_links(
        &mut self,
        expense_id: &str,
        targets: &[LinkTarget],
    ) -> Result<LinkOutcome, LinkingError> {
        self.write("create_multiple_links", expense_id, |doc, split| {
            link_expense(doc, expense_id, targets, LinkMode::Multiple, split)
        })
    }

    /// # Errors
    /// See [`unlink_expense`]; store errors otherwise.
    pub fn remove_link(&mut self, expense_id: &str) -> Result<LinkOutcome, LinkingError> {
        self.write("remove_link", expense_id, |doc, _| unlink_expense(doc, expense_id))
    }

    /// # Errors
    /// Store errors, or [`LinkingError::ExpenseNotFound`].
    pub fn expense_links(&mut self, expense_id: &str) -> Result<Vec<ExpenseLink>, LinkingError> {
        let doc = self.store.load(&self.trip_id)?;
        check_expense(&doc, expense_id)?;
        Ok(expense_links(&doc, expense_id))
    }

    fn write<F>(
        &mut self,
        operation: &'static str,
        expense_id: &str,
        mut mutate: F,
    ) -> Result<LinkOutcome, LinkingError>
    where
        F: FnMut(&mut TripDocument, &SplitConfig) -> Result<Vec<DroppedLink>, LinkingError>,
    {
        let LedgerConfig {
            split, validation, ..
        } = self.store.config().clone();

        let mut attempt = 1;
        loop {
            let before = self.store.load(&self.trip_id)?;
            let mut after = before.clone();
            let replaced = mutate(&mut after, &split)?.len();

            if after == before {
                return Ok(LinkOutcome {
                    links: expense_links(&after, expense_id),
                    document: after,
                    replaced,
                    sweep: ValidationResult::valid(),
                });
            }

            let sweep = post_write_check(validation.post_write_sweep, &before, &after, operation)
                .map_err(LinkingError::Boundary)?;

            match self.store.save(&mut after) {
                Ok(()) => {
                    tracing::info!(
                        trip_id = %self.trip_id,
                        expense_id,
                        operation,
                        replaced,
                        document_version = after.document_version,
                        "updated expense links"
                    );
                    return Ok(LinkOutcome {
                        links: expense_links(&after, expense_id),
                        document: after,
                        replaced,
                        sweep,
                    });
                }
                Err(StoreError::Conflict { .. }) if attempt < MAX_SAVE_ATTEMPTS => {
                    tracing::debug!(
                        trip_id = %self.trip_id,
                        expense_id,
                        attempt,
                        "link write conflicted; reloading"
                    );
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use super::*;
    use crate::store::InMemoryBlobStore;
    use serde_json::json;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("unexpected error: {err}"),
        }
    }

    fn trip_a() -> serde_json::Value {
        json!({
            "schemaVersion": 4,
            "id": "tripA",
            "travelData": {
                "locations": [
                    {"id": "locA1", "name": "Lisbon"},
                    {"id": "locA2", "name": "Sintra"}
                ],
                "routes": [{
                    "id": "rA1", "type": "train", "from": "Lisbon", "to": "Porto",
                    "subRoutes": [{"id": "rA1a", "type": "train", "from": "Lisbon", "to": "Coimbra",
                                   "costTrackingLinks": [{"expenseId": "e1"}]}]
                }]
            },
            "accommodations": [{"id": "accA1", "name": "Hotel", "locationId": "locA1"}],
            "costData": {"expenses": [
                {"id": "e1", "amount": 100.0, "category": "Transport",
                 "travelReference": {"type": "route", "routeId": "rA1"}},
                {"id": "e2", "amount": 80.0, "category": "Accommodation"}
            ]}
        })
    }

    fn trip_b() -> serde_json::Value {
        json!({
            "schemaVersion": 4,
            "id": "tripB",
            "travelData": {"locations": [{"id": "locB1", "name": "Madrid"}]},
            "costData": {"expenses": [{"id": "b1", "amount": 10.0}]}
        })
    }

    fn store() -> UnifiedDataStore<InMemoryBlobStore> {
        let mut store = UnifiedDataStore::new(InMemoryBlobStore::new(), LedgerConfig::default());
        for body in [trip_a(), trip_b()] {
            let trip_id = must(TripId::parse(body["id"].as_str().unwrap_or_default()));
            must(store.backend_mut().write(&trip_id, &body, None));
        }
        store
    }

    fn id(raw: &str) -> TripId {
        must(TripId::parse(raw))
    }

    #[test]
    fn cross_trip_link_is_rejected_without_writes() {
        let mut store = store();
        let before_a = must(store.load(&id("tripA")));
        let before_b = must(store.load(&id("tripB")));

        let result = ExpenseLinkingService::new(&mut store, id("tripA"))
            .create_or_update_link("e1", &LinkTarget::new(TravelItemKind::Location, "locB1"));
        let err = match result {
            Err(err) => err,
            Ok(outcome) => panic!("expected rejection, got {outcome:?}"),
        };
        assert_eq!(err.kind(), ErrorKind::CrossTripReference);
        assert_eq!(err.details()[0].kind, ErrorKind::TravelItemNotFound);
        assert_eq!(err.details()[0].item_id.as_deref(), Some("locB1"));

        assert_eq!(must(store.load(&id("tripA"))), before_a);
        assert_eq!(must(store.load(&id("tripB"))), before_b);
    }

    #[test]
    fn single_link_moves_to_latest_target() {
        let mut store = store();
        let mut service = ExpenseLinkingService::new(&mut store, id("tripA"));

        must(service.create_or_update_link("e1", &LinkTarget::new(TravelItemKind::Location, "locA1")));
        let outcome =
            must(service.create_or_update_link("e1", &LinkTarget::new(TravelItemKind::Accommodation, "accA1")));

        assert_eq!(outcome.links.len(), 1);
        assert_eq!(outcome.links[0].kind, TravelItemKind::Accommodation);
        assert_eq!(outcome.links[0].item_id, "accA1");
        assert_eq!(outcome.replaced, 1);

        let doc = must(store.load(&id("tripA")));
        assert_eq!(expense_links(&doc, "e1").len(), 1);
        assert!(doc.locations()[0].cost_tracking_links.is_empty());
        assert!(doc.routes()[0].sub_routes[0].cost_tracking_links.is_empty());
        assert!(doc.find_expense("e1").and_then(|e| e.travel_reference.as_ref()).is_none());
    }

    #[test]
    fn first_write_replaces_legacy_leg_link() {
        let mut store = store();
        let outcome = must(
            ExpenseLinkingService::new(&mut store, id("tripA"))
                .create_or_update_link("e1", &LinkTarget::new(TravelItemKind::Route, "rA1")),
        );
        assert_eq!(outcome.replaced, 1);
        assert_eq!(outcome.document.document_version, 2);
    }

    #[test]
    fn multiple_links_respect_percentage_split() {
        let mut store = store();
        let mut service = ExpenseLinkingService::new(&mut store, id("tripA"));
        let targets = [
            LinkTarget::new(TravelItemKind::Location, "locA1").with_split(SplitMode::Percentage, 60.0),
            LinkTarget::new(TravelItemKind::Location, "locA2").with_split(SplitMode::Percentage, 40.4),
        ];
        let outcome = must(service.create_multiple_links("e2", &targets));
        assert_eq!(outcome.links.len(), 2);
        assert_eq!(outcome.links[1].split_value, Some(40.4));

        let too_much = [
            LinkTarget::new(TravelItemKind::Location, "locA1").with_split(SplitMode::Percentage, 60.0),
            LinkTarget::new(TravelItemKind::Location, "locA2").with_split(SplitMode::Percentage, 40.6),
        ];
        let err = service.create_multiple_links("e2", &too_much);
        assert!(matches!(err, Err(LinkingError::SplitValidation(_))));

        let doc = must(store.load(&id("tripA")));
        assert_eq!(expense_links(&doc, "e2").len(), 2);
    }

    #[test]
    fn split_tolerances_match_contract() {
        let tolerances = SplitConfig::default();
        let pct = |a: f64, b: f64| {
            validate_split(
                &[
                    LinkTarget::new(TravelItemKind::Location, "x").with_split(SplitMode::Percentage, a),
                    LinkTarget::new(TravelItemKind::Location, "y").with_split(SplitMode::Percentage, b),
                ],
                0.0,
                &tolerances,
            )
        };
        assert!(pct(50.0, 50.4).is_ok());
        assert!(pct(50.0, 50.6).is_err());
        assert!(pct(50.0, 49.5).is_ok());

        let fixed = |a: f64, b: f64| {
            validate_split(
                &[
                    LinkTarget::new(TravelItemKind::Route, "x").with_split(SplitMode::Fixed, a),
                    LinkTarget::new(TravelItemKind::Route, "y").with_split(SplitMode::Fixed, b),
                ],
                100.0,
                &tolerances,
            )
        };
        assert!(fixed(50.0, 50.005).is_ok());
        assert!(fixed(50.0, 49.995).is_ok());
        assert!(fixed(50.0, 50.02).is_err());

        let equal = [
            LinkTarget::new(TravelItemKind::Location, "x").with_split(SplitMode::Equal, f64::NAN),
            LinkTarget::new(TravelItemKind::Location, "y"),
        ];
        assert!(validate_split(&equal, 10.0, &tolerances).is_ok());

        let missing_value = LinkTarget {
            split_mode: Some(SplitMode::Fixed),
            ..LinkTarget::new(TravelItemKind::Location, "x")
        };
        assert!(validate_split(&[missing_value], 10.0, &tolerances).is_err());
    }

    #[test]
    fn duplicate_targets_are_rejected() {
        let mut store = store();
        let targets = [
            LinkTarget::new(TravelItemKind::Location, "locA1"),
            LinkTarget::new(TravelItemKind::Location, "locA1"),
        ];
        let err = ExpenseLinkingService::new(&mut store, id("tripA")).create_multiple_links("e2", &targets);
        match err {
            Err(err) => assert_eq!(err.kind(), ErrorKind::DuplicateLink),
            Ok(outcome) => panic!("expected duplicate rejection, got {outcome:?}"),
        }
    }

    #[test]
    fn precondition_order_is_stable() {
        let mut doc = must(TripDocument::from_value(trip_a()));
        let split = SplitConfig::default();
        let foreign = [LinkTarget::new(TravelItemKind::Location, "locB1")];

        let empty = link_expense(&mut doc, " ", &foreign, LinkMode::Single, &split);
        assert!(matches!(empty, Err(LinkingError::InvalidRequest(_))));

        let missing = link_expense(&mut doc, "nope", &foreign, LinkMode::Single, &split);
        assert!(matches!(missing, Err(LinkingError::ExpenseNotFound { .. })));

        let mut stale = doc.clone();
        stale.schema_version = 3;
        let stale_result = link_expense(&mut stale, "e1", &foreign, LinkMode::Single, &split);
        assert!(matches!(stale_result, Err(LinkingError::InvalidRequest(_))));

        let wrong_kind = [LinkTarget::new(TravelItemKind::Route, "locA1")];
        let kind_result = link_expense(&mut doc, "e1", &wrong_kind, LinkMode::Single, &split);
        assert!(matches!(kind_result, Err(LinkingError::CrossTripReference(_))));

        let untouched = must(TripDocument::from_value(trip_a()));
        assert_eq!(doc, untouched);
    }

    #[test]
    fn remove_link_clears_links_and_mirror() {
        let mut store = store();
        let mut service = ExpenseLinkingService::new(&mut store, id("tripA"));
        let outcome = must(service.remove_link("e1"));
        assert!(outcome.links.is_empty());
        assert_eq!(outcome.replaced, 1);

        let again = must(service.remove_link("e1"));
        assert_eq!(again.replaced, 0);
        assert_eq!(again.document.document_version, outcome.document.document_version);

        let doc = must(store.load(&id("tripA")));
        assert!(doc.find_expense("e1").and_then(|e| e.travel_reference.as_ref()).is_none());
        assert!(derive_travel_reference(&doc, "e1").is_none());
    }

    #[test]
    fn travel_reference_is_derived_from_links() {
        let doc = must(TripDocument::from_value(trip_a()));
        assert_eq!(
            derive_travel_reference(&doc, "e1"),
            Some(TravelReference::Route {
                route_id: "rA1".to_string(),
                description: None
            })
        );
        let links = expense_links(&doc, "e1");
        assert_eq!(links[0].item_id, "rA1a");
        assert_eq!(links[0].parent_route_id.as_deref(), Some("rA1"));
    }
}
