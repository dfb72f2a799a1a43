//! Stepwise schema migrations for stored trip documents.
//!
//! Migrations run on the raw JSON body, before it is parsed into
//! [`crate::model::TripDocument`], because older bodies do not fit the current
//! model. Every step is deterministic and free of I/O; persisting the result is
//! the caller's job.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::{ACCOMMODATION_CATEGORY, CURRENT_SCHEMA_VERSION, LEGACY_SCHEMA_VERSION};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum MigrationError {
    #[error("document is not a JSON object")]
    NotAnObject,
    #[error("schemaVersion is not a positive integer")]
    InvalidSchemaVersion,
    #[error("schemaVersion {0} is newer than this build supports")]
    FromTheFuture(u64),
    #[error("{field} has unexpected shape: expected {expected}")]
    Shape {
        field: String,
        expected: &'static str,
    },
    #[error("missing required field {0}")]
    MissingField(String),
}

fn shape(field: impl Into<String>, expected: &'static str) -> MigrationError {
    MigrationError::Shape {
        field: field.into(),
        expected,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CleanupItemKind {
    Location,
    Route,
    RouteSegment,
    Accommodation,
    Expense,
}

impl CleanupItemKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Location => "location",
            Self::Route => "route",
            Self::RouteSegment => "route_segment",
            Self::Accommodation => "accommodation",
            Self::Expense => "expense",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "location" => Some(Self::Location),
            "route" => Some(Self::Route),
            "route_segment" => Some(Self::RouteSegment),
            "accommodation" => Some(Self::Accommodation),
            "expense" => Some(Self::Expense),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CleanupReason {
    DanglingLink,
    DanglingTravelReference,
}

impl CleanupReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DanglingLink => "dangling_link",
            Self::DanglingTravelReference => "dangling_travel_reference",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "dangling_link" => Some(Self::DanglingLink),
            "dangling_travel_reference" => Some(Self::DanglingTravelReference),
            _ => None,
        }
    }
}

/// One audit record per link or legacy reference removed during migration.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LinkCleanupEntry {
    pub trip_id: String,
    pub item_kind: CleanupItemKind,
    pub item_id: String,
    pub expense_id: String,
    pub reason: CleanupReason,
    pub schema_version: u32,
}

impl Display for LinkCleanupEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}:{} -> expense {} ({})",
            self.trip_id,
            self.item_kind.as_str(),
            self.item_id,
            self.expense_id,
            self.reason.as_str()
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MigrationOutcome {
    pub document: Value,
    pub from_version: u32,
    pub to_version: u32,
    pub cleanup: Vec<LinkCleanupEntry>,
    /// Set when the document could not be advanced and was returned as-is.
    pub failure: Option<MigrationError>,
}

impl MigrationOutcome {
    #[must_use]
    pub fn advanced(&self) -> bool {
        self.to_version > self.from_version
    }

    fn unchanged(document: Value, version: u32, failure: Option<MigrationError>) -> Self {
        Self {
            document,
            from_version: version,
            to_version: version,
            cleanup: Vec::new(),
            failure,
        }
    }
}

struct StepContext {
    trip_id: String,
    cleanup: Vec<LinkCleanupEntry>,
}

type Step = fn(&mut Map<String, Value>, &mut StepContext) -> Result<(), MigrationError>;

/// `(from_version, step)`; each step lands on `from_version + 1`.
const STEPS: &[(u32, Step)] = &[
    (1, extract_inline_accommodations),
    (2, split_accommodation_links),
    (3, prune_dangling_links),
];

/// Reads `schemaVersion`, treating an absent field as the legacy version.
///
/// # Errors
/// Returns [`MigrationError::InvalidSchemaVersion`] for non-integer or zero values.
pub fn schema_version_of(document: &Map<String, Value>) -> Result<u32, MigrationError> {
    match document.get("schemaVersion") {
        None | Some(Value::Null) => Ok(LEGACY_SCHEMA_VERSION),
        Some(value) => {
            let raw = value
                .as_u64()
                .ok_or(MigrationError::InvalidSchemaVersion)?;
            if raw == 0 {
                return Err(MigrationError::InvalidSchemaVersion);
            }
            u32::try_from(raw).map_err(|_| MigrationError::FromTheFuture(raw))
        }
    }
}

/// Upgrades a stored document to [`CURRENT_SCHEMA_VERSION`].
///
/// Never fails: a document that cannot be advanced comes back untouched, at its
/// original version, with [`MigrationOutcome::failure`] set. A document already
/// at the current version is returned exactly as given.
#[must_use]
pub fn migrate_to_latest_schema(document: Value) -> MigrationOutcome {
    let original = match document {
        Value::Object(original) => original,
        other => {
            tracing::warn!("trip document is not a JSON object; leaving it unmigrated");
            return MigrationOutcome::unchanged(other, 0, Some(MigrationError::NotAnObject));
        }
    };

    let trip_id = original
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let from_version = match schema_version_of(&original) {
        Ok(version) => version,
        Err(err) => {
            tracing::warn!(trip_id = %trip_id, error = %err, "cannot read schemaVersion; leaving document unmigrated");
            return MigrationOutcome::unchanged(Value::Object(original), 0, Some(err));
        }
    };

    if from_version >= CURRENT_SCHEMA_VERSION {
        let failure = (from_version > CURRENT_SCHEMA_VERSION)
            .then(|| MigrationError::FromTheFuture(u64::from(from_version)));
        if failure.is_some() {
            tracing::warn!(trip_id = %trip_id, schema_version = from_version, "document is newer than this build");
        }
        return MigrationOutcome::unchanged(Value::Object(original), from_version, failure);
    }

    let mut working = original.clone();
    let mut context = StepContext {
        trip_id: trip_id.clone(),
        cleanup: Vec::new(),
    };
    let mut version = from_version;

    for (step_from, step) in STEPS {
        if *step_from != version {
            continue;
        }

        if let Err(err) = step(&mut working, &mut context) {
            tracing::warn!(
                trip_id = %trip_id,
                from_version,
                failed_step = version,
                error = %err,
                "migration step failed; leaving document at its original version"
            );
            return MigrationOutcome::unchanged(Value::Object(original), from_version, Some(err));
        }

        version += 1;
        working.insert("schemaVersion".to_string(), Value::from(version));
    }

    tracing::info!(
        trip_id = %trip_id,
        from_version,
        to_version = version,
        removed = context.cleanup.len(),
        "migrated trip document"
    );

    MigrationOutcome {
        document: Value::Object(working),
        from_version,
        to_version: version,
        cleanup: context.cleanup,
        failure: None,
    }
}

/// Mutable view of an optional array nested under `path`.
fn array_at<'a>(
    document: &'a mut Map<String, Value>,
    path: &[&str],
) -> Result<Option<&'a mut Vec<Value>>, MigrationError> {
    let Some((last, parents)) = path.split_last() else {
        return Ok(None);
    };

    let mut cursor = document;
    for parent in parents {
        match cursor.get_mut(*parent) {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::Object(inner)) => cursor = inner,
            Some(_) => return Err(shape(*parent, "an object")),
        }
    }

    match cursor.get_mut(*last) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => Ok(Some(items)),
        Some(_) => Err(shape(path.join("."), "an array")),
    }
}

fn object_entry<'a>(
    value: &'a mut Value,
    field: &str,
) -> Result<&'a mut Map<String, Value>, MigrationError> {
    value.as_object_mut().ok_or_else(|| shape(field, "an object"))
}

fn string_field(object: &Map<String, Value>, field: &str) -> Option<String> {
    object
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Takes the top-level accommodations array out of the document, leaving a
/// placeholder so the key keeps its position.
fn take_accommodations(document: &mut Map<String, Value>) -> Result<Vec<Value>, MigrationError> {
    match document.get_mut("accommodations").map(Value::take) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items),
        Some(_) => Err(shape("accommodations", "an array")),
    }
}

fn restore_accommodations(document: &mut Map<String, Value>, accommodations: Vec<Value>) {
    let present = document.contains_key("accommodations");
    if present || !accommodations.is_empty() {
        document.insert("accommodations".to_string(), Value::Array(accommodations));
    }
}

fn accommodation_for_location<'a>(
    accommodations: &'a [Value],
    location_id: &str,
) -> Option<&'a Map<String, Value>> {
    accommodations
        .iter()
        .filter_map(Value::as_object)
        .find(|accommodation| {
            accommodation.get("locationId").and_then(Value::as_str) == Some(location_id)
        })
}

fn push_unique_id(location: &mut Map<String, Value>, accommodation_id: &str) -> Result<(), MigrationError> {
    let ids = location
        .entry("accommodationIds")
        .or_insert_with(|| Value::Array(Vec::new()));
    let Value::Array(ids) = ids else {
        return Err(shape("accommodationIds", "an array"));
    };
    if !ids.iter().any(|id| id.as_str() == Some(accommodation_id)) {
        ids.push(Value::from(accommodation_id));
    }
    Ok(())
}

fn unique_accommodation_id(accommodations: &[Value], location_id: &str) -> String {
    let taken = accommodations
        .iter()
        .filter_map(|item| item.get("id").and_then(Value::as_str))
        .collect::<BTreeSet<_>>();

    let base = format!("acc-{location_id}");
    if !taken.contains(base.as_str()) {
        return base;
    }
    let mut suffix = 2_u32;
    loop {
        let candidate = format!("{base}-{suffix}");
        if !taken.contains(candidate.as_str()) {
            return candidate;
        }
        suffix += 1;
    }
}

/// v1→v2 (re-run by v2→v3): move inline accommodation blobs off locations into
/// `accommodations`, one per location, keyed by `locationId`.
fn extract_inline_accommodations(
    document: &mut Map<String, Value>,
    _context: &mut StepContext,
) -> Result<(), MigrationError> {
    let stamp = document
        .get("updatedAt")
        .or_else(|| document.get("createdAt"))
        .cloned();
    let mut accommodations = take_accommodations(document)?;

    if let Some(locations) = array_at(document, &["travelData", "locations"])? {
        for entry in locations.iter_mut() {
            let location = object_entry(entry, "travelData.locations[]")?;
            let inline = location
                .get("accommodationData")
                .and_then(Value::as_str)
                .filter(|raw| !raw.trim().is_empty())
                .map(str::to_string);
            let Some(inline) = inline else {
                continue;
            };

            let location_id = string_field(location, "id")
                .ok_or_else(|| MigrationError::MissingField("travelData.locations[].id".to_string()))?;
            let is_public = location
                .get("isAccommodationPublic")
                .and_then(Value::as_bool)
                .unwrap_or(false);

            let accommodation_id = if let Some(existing) =
                accommodation_for_location(&accommodations, &location_id)
            {
                string_field(existing, "id").unwrap_or_default()
            } else {
                let accommodation_id = unique_accommodation_id(&accommodations, &location_id);
                let name = string_field(location, "name")
                    .filter(|name| !name.is_empty())
                    .map_or_else(|| "Accommodation".to_string(), |name| format!("{name} accommodation"));

                let mut accommodation = Map::new();
                accommodation.insert("kind".to_string(), Value::from("accommodation"));
                accommodation.insert("id".to_string(), Value::from(accommodation_id.clone()));
                accommodation.insert("name".to_string(), Value::from(name));
                accommodation.insert("locationId".to_string(), Value::from(location_id.clone()));
                accommodation.insert("accommodationData".to_string(), Value::from(inline));
                accommodation.insert("isAccommodationPublic".to_string(), Value::from(is_public));
                if let Some(stamp) = stamp.clone() {
                    accommodation.insert("createdAt".to_string(), stamp.clone());
                    accommodation.insert("updatedAt".to_string(), stamp);
                }
                accommodations.push(Value::Object(accommodation));
                accommodation_id
            };

            location.remove("accommodationData");
            location.remove("isAccommodationPublic");
            if !accommodation_id.is_empty() {
                push_unique_id(location, &accommodation_id)?;
            }
        }
    }

    restore_accommodations(document, accommodations);
    Ok(())
}

fn expense_categories(document: &mut Map<String, Value>) -> Result<BTreeMap<String, String>, MigrationError> {
    let mut categories = BTreeMap::new();
    if let Some(expenses) = array_at(document, &["costData", "expenses"])? {
        for expense in expenses.iter().filter_map(Value::as_object) {
            if let Some(id) = string_field(expense, "id") {
                categories.insert(id, string_field(expense, "category").unwrap_or_default());
            }
        }
    }
    Ok(categories)
}

fn links_of<'a>(
    item: &'a mut Map<String, Value>,
    field: &str,
) -> Result<Option<&'a mut Vec<Value>>, MigrationError> {
    match item.get_mut("costTrackingLinks") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(links)) => Ok(Some(links)),
        Some(_) => Err(shape(format!("{field}.costTrackingLinks"), "an array")),
    }
}

fn link_expense_id(link: &Value) -> Option<&str> {
    link.get("expenseId").and_then(Value::as_str)
}

/// v2→v3: finish the extraction, then move links for "Accommodation" expenses
/// from each location onto that location's accommodation.
fn split_accommodation_links(
    document: &mut Map<String, Value>,
    context: &mut StepContext,
) -> Result<(), MigrationError> {
    extract_inline_accommodations(document, context)?;

    let categories = expense_categories(document)?;
    let mut accommodations = take_accommodations(document)?;

    if let Some(locations) = array_at(document, &["travelData", "locations"])? {
        for entry in locations.iter_mut() {
            let location = object_entry(entry, "travelData.locations[]")?;
            let Some(location_id) = string_field(location, "id") else {
                continue;
            };
            let Some(target_index) = accommodations.iter().position(|accommodation| {
                accommodation.get("locationId").and_then(Value::as_str) == Some(location_id.as_str())
            }) else {
                continue;
            };
            let Some(links) = links_of(location, "travelData.locations[]")? else {
                continue;
            };

            let (moving, staying): (Vec<Value>, Vec<Value>) =
                links.drain(..).partition(|link| {
                    link_expense_id(link)
                        .and_then(|expense_id| categories.get(expense_id))
                        .is_some_and(|category| category == ACCOMMODATION_CATEGORY)
                });
            *links = staying;
            if moving.is_empty() {
                continue;
            }

            let accommodation = object_entry(&mut accommodations[target_index], "accommodations[]")?;
            let target_links = accommodation
                .entry("costTrackingLinks")
                .or_insert_with(|| Value::Array(Vec::new()));
            let Value::Array(target_links) = target_links else {
                return Err(shape("accommodations[].costTrackingLinks", "an array"));
            };
            for link in moving {
                let duplicate = target_links
                    .iter()
                    .any(|existing| link_expense_id(existing) == link_expense_id(&link));
                if !duplicate {
                    target_links.push(link);
                }
            }
        }
    }

    restore_accommodations(document, accommodations);
    Ok(())
}

fn ids_in(document: &mut Map<String, Value>, path: &[&str]) -> Result<BTreeSet<String>, MigrationError> {
    let mut ids = BTreeSet::new();
    if let Some(items) = array_at(document, path)? {
        for item in items.iter().filter_map(Value::as_object) {
            if let Some(id) = string_field(item, "id") {
                ids.insert(id);
            }
        }
    }
    Ok(ids)
}

fn prune_links_on(
    item: &mut Map<String, Value>,
    field: &str,
    kind: CleanupItemKind,
    expense_ids: &BTreeSet<String>,
    context: &mut StepContext,
) -> Result<(), MigrationError> {
    let item_id = string_field(item, "id").unwrap_or_default();
    let Some(links) = links_of(item, field)? else {
        return Ok(());
    };

    let mut kept = Vec::with_capacity(links.len());
    for link in links.drain(..) {
        let expense_id = link_expense_id(&link).map(str::to_string);
        match expense_id {
            Some(expense_id) if expense_ids.contains(&expense_id) => kept.push(link),
            expense_id => {
                let expense_id = expense_id.unwrap_or_default();
                tracing::warn!(
                    trip_id = %context.trip_id,
                    item_kind = kind.as_str(),
                    item_id = %item_id,
                    expense_id = %expense_id,
                    "pruned dangling cost tracking link"
                );
                context.cleanup.push(LinkCleanupEntry {
                    trip_id: context.trip_id.clone(),
                    item_kind: kind,
                    item_id: item_id.clone(),
                    expense_id,
                    reason: CleanupReason::DanglingLink,
                    schema_version: 4,
                });
            }
        }
    }
    *links = kept;
    Ok(())
}

fn reference_resolves(
    reference: &Map<String, Value>,
    locations: &BTreeSet<String>,
    routes: &BTreeSet<String>,
    accommodations: &BTreeSet<String>,
) -> bool {
    let target = match reference.get("type").and_then(Value::as_str) {
        Some("location") => string_field(reference, "locationId").map(|id| (locations, id)),
        Some("route") => string_field(reference, "routeId").map(|id| (routes, id)),
        Some("accommodation") => {
            string_field(reference, "accommodationId").map(|id| (accommodations, id))
        }
        _ => None,
    };
    target.is_some_and(|(ids, id)| ids.contains(&id))
}

/// v3→v4: drop every link whose expense is not declared in this document, and
/// every legacy `travelReference` pointing at an item this document lacks.
fn prune_dangling_links(
    document: &mut Map<String, Value>,
    context: &mut StepContext,
) -> Result<(), MigrationError> {
    let expense_ids = expense_categories(document)?
        .into_keys()
        .collect::<BTreeSet<_>>();

    if let Some(locations) = array_at(document, &["travelData", "locations"])? {
        for entry in locations.iter_mut() {
            let location = object_entry(entry, "travelData.locations[]")?;
            prune_links_on(location, "travelData.locations[]", CleanupItemKind::Location, &expense_ids, context)?;
        }
    }

    if let Some(routes) = array_at(document, &["travelData", "routes"])? {
        for entry in routes.iter_mut() {
            let route = object_entry(entry, "travelData.routes[]")?;
            prune_links_on(route, "travelData.routes[]", CleanupItemKind::Route, &expense_ids, context)?;

            match route.get_mut("subRoutes") {
                None | Some(Value::Null) => {}
                Some(Value::Array(segments)) => {
                    for segment in segments.iter_mut() {
                        let segment = object_entry(segment, "travelData.routes[].subRoutes[]")?;
                        prune_links_on(
                            segment,
                            "travelData.routes[].subRoutes[]",
                            CleanupItemKind::RouteSegment,
                            &expense_ids,
                            context,
                        )?;
                    }
                }
                Some(_) => return Err(shape("travelData.routes[].subRoutes", "an array")),
            }
        }
    }

    if let Some(accommodations) = array_at(document, &["accommodations"])? {
        for entry in accommodations.iter_mut() {
            let accommodation = object_entry(entry, "accommodations[]")?;
            prune_links_on(accommodation, "accommodations[]", CleanupItemKind::Accommodation, &expense_ids, context)?;
        }
    }

    let location_ids = ids_in(document, &["travelData", "locations"])?;
    let route_ids = ids_in(document, &["travelData", "routes"])?;
    let accommodation_ids = ids_in(document, &["accommodations"])?;

    if let Some(expenses) = array_at(document, &["costData", "expenses"])? {
        for entry in expenses.iter_mut() {
            let expense = object_entry(entry, "costData.expenses[]")?;
            let dangling = match expense.get("travelReference") {
                None | Some(Value::Null) => false,
                Some(Value::Object(reference)) => {
                    !reference_resolves(reference, &location_ids, &route_ids, &accommodation_ids)
                }
                Some(_) => true,
            };
            if !dangling {
                continue;
            }

            let expense_id = string_field(expense, "id").unwrap_or_default();
            expense.remove("travelReference");
            tracing::warn!(
                trip_id = %context.trip_id,
                expense_id = %expense_id,
                "cleared dangling legacy travel reference"
            );
            context.cleanup.push(LinkCleanupEntry {
                trip_id: context.trip_id.clone(),
                item_kind: CleanupItemKind::Expense,
                item_id: expense_id.clone(),
                expense_id,
                reason: CleanupReason::DanglingTravelReference,
                schema_version: 4,
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn v1_fixture() -> Value {
        json!({
            "id": "trip1",
            "title": "Portugal",
            "updatedAt": "2024-03-01T10:00:00.000Z",
            "travelData": {
                "locations": [{
                    "id": "loc1",
                    "name": "Lisbon",
                    "coordinates": [38.72, -9.14],
                    "accommodationData": "Hotel Avenida, room 12",
                    "isAccommodationPublic": true,
                    "costTrackingLinks": [
                        {"expenseId": "hotel"},
                        {"expenseId": "dinner"},
                        {"expenseId": "ghost"}
                    ]
                }, {
                    "id": "loc2",
                    "name": "Porto",
                    "coordinates": [41.15, -8.61]
                }],
                "routes": [{
                    "id": "r1",
                    "type": "train",
                    "from": "Lisbon",
                    "to": "Porto",
                    "costTrackingLinks": [{"expenseId": "ticket"}],
                    "subRoutes": [{
                        "id": "r1a",
                        "type": "train",
                        "from": "Lisbon",
                        "to": "Coimbra",
                        "costTrackingLinks": [{"expenseId": "other-trip-expense"}]
                    }]
                }]
            },
            "costData": {
                "expenses": [
                    {"id": "hotel", "amount": 300, "category": "Accommodation"},
                    {"id": "dinner", "amount": 40, "category": "Food"},
                    {"id": "ticket", "amount": 25, "category": "Transport",
                     "travelReference": {"type": "route", "routeId": "r1"}},
                    {"id": "stale", "amount": 5, "category": "Food",
                     "travelReference": {"type": "location", "locationId": "locB1"}}
                ]
            }
        })
    }

    fn links(value: &Value) -> Vec<&str> {
        value["costTrackingLinks"]
            .as_array()
            .map(|links| links.iter().filter_map(link_expense_id).collect())
            .unwrap_or_default()
    }

    #[test]
    fn v1_document_reaches_current_version() {
        let outcome = migrate_to_latest_schema(v1_fixture());
        assert!(outcome.failure.is_none());
        assert_eq!(outcome.from_version, 1);
        assert_eq!(outcome.to_version, CURRENT_SCHEMA_VERSION);

        let doc = &outcome.document;
        assert_eq!(doc["schemaVersion"], json!(4));

        let location = &doc["travelData"]["locations"][0];
        assert!(location.get("accommodationData").is_none());
        assert!(location.get("isAccommodationPublic").is_none());
        assert_eq!(location["accommodationIds"], json!(["acc-loc1"]));
        assert_eq!(links(location), vec!["dinner"]);

        let accommodation = &doc["accommodations"][0];
        assert_eq!(accommodation["id"], json!("acc-loc1"));
        assert_eq!(accommodation["locationId"], json!("loc1"));
        assert_eq!(accommodation["name"], json!("Lisbon accommodation"));
        assert_eq!(accommodation["isAccommodationPublic"], json!(true));
        assert_eq!(accommodation["createdAt"], json!("2024-03-01T10:00:00.000Z"));
        assert_eq!(links(accommodation), vec!["hotel"]);

        let route = &doc["travelData"]["routes"][0];
        assert_eq!(links(route), vec!["ticket"]);
        assert!(links(&route["subRoutes"][0]).is_empty());

        assert_eq!(doc["costData"]["expenses"][2]["travelReference"]["routeId"], json!("r1"));
        assert!(doc["costData"]["expenses"][3].get("travelReference").is_none());
    }

    #[test]
    fn cleanup_log_names_every_removed_reference() {
        let outcome = migrate_to_latest_schema(v1_fixture());
        let removed = outcome
            .cleanup
            .iter()
            .map(|entry| (entry.item_kind, entry.item_id.as_str(), entry.expense_id.as_str(), entry.reason))
            .collect::<Vec<_>>();

        assert_eq!(
            removed,
            vec![
                (CleanupItemKind::Location, "loc1", "ghost", CleanupReason::DanglingLink),
                (CleanupItemKind::RouteSegment, "r1a", "other-trip-expense", CleanupReason::DanglingLink),
                (CleanupItemKind::Expense, "stale", "stale", CleanupReason::DanglingTravelReference),
            ]
        );
        assert!(outcome.cleanup.iter().all(|entry| entry.trip_id == "trip1"));
    }

    #[test]
    fn v3_prune_keeps_only_declared_expenses() {
        let outcome = migrate_to_latest_schema(json!({
            "schemaVersion": 3,
            "costData": {"expenses": [{"id": "valid-expense"}]},
            "travelData": {"locations": [{
                "id": "loc1",
                "costTrackingLinks": [{"expenseId": "valid-expense"}, {"expenseId": "ghost"}]
            }]}
        }));

        assert_eq!(outcome.to_version, 4);
        assert_eq!(
            links(&outcome.document["travelData"]["locations"][0]),
            vec!["valid-expense"]
        );
        assert_eq!(outcome.cleanup.len(), 1);
        assert_eq!(outcome.cleanup[0].expense_id, "ghost");
    }

    #[test]
    fn current_document_is_returned_unchanged() {
        let current = migrate_to_latest_schema(v1_fixture()).document;
        let again = migrate_to_latest_schema(current.clone());
        assert!(!again.advanced());
        assert!(again.cleanup.is_empty());
        assert_eq!(again.document, current);
    }

    #[test]
    fn rerun_extraction_does_not_duplicate_existing_accommodation() {
        let outcome = migrate_to_latest_schema(json!({
            "schemaVersion": 2,
            "id": "trip2",
            "accommodations": [{"id": "stay1", "locationId": "loc1", "name": "Stay"}],
            "travelData": {"locations": [{
                "id": "loc1",
                "accommodationData": "left behind by an incomplete v2 step",
                "accommodationIds": ["stay1"]
            }]}
        }));

        assert!(outcome.failure.is_none());
        let accommodations = outcome.document["accommodations"].as_array().map(Vec::len);
        assert_eq!(accommodations, Some(1));
        let location = &outcome.document["travelData"]["locations"][0];
        assert!(location.get("accommodationData").is_none());
        assert_eq!(location["accommodationIds"], json!(["stay1"]));
    }

    #[test]
    fn malformed_document_is_returned_as_is() {
        let broken = json!({
            "schemaVersion": 1,
            "id": "trip3",
            "travelData": {"locations": {"not": "an array"}}
        });
        let outcome = migrate_to_latest_schema(broken.clone());
        assert_eq!(outcome.document, broken);
        assert_eq!(outcome.to_version, 1);
        assert!(matches!(outcome.failure, Some(MigrationError::Shape { .. })));

        let not_object = migrate_to_latest_schema(json!([1, 2, 3]));
        assert_eq!(not_object.failure, Some(MigrationError::NotAnObject));
    }

    #[test]
    fn location_with_inline_blob_but_no_id_cannot_advance() {
        let broken = json!({
            "travelData": {"locations": [{"accommodationData": "somewhere"}]}
        });
        let outcome = migrate_to_latest_schema(broken.clone());
        assert_eq!(outcome.document, broken);
        assert!(matches!(outcome.failure, Some(MigrationError::MissingField(_))));
    }

    #[test]
    fn future_versions_are_left_alone() {
        let future = json!({"schemaVersion": 9, "id": "trip4"});
        let outcome = migrate_to_latest_schema(future.clone());
        assert_eq!(outcome.document, future);
        assert_eq!(outcome.failure, Some(MigrationError::FromTheFuture(9)));
    }

    fn legacy_strategy() -> impl Strategy<Value = Value> {
        let expense_ids = prop::collection::btree_set("[a-d]", 0..4);
        let link_ids = prop::collection::vec("[a-f]", 0..5);
        (expense_ids, link_ids, any::<bool>(), 1u32..4).prop_map(
            |(expenses, link_ids, inline, version)| {
                let expenses = expenses
                    .into_iter()
                    .map(|id| {
                        let category = if id == "a" { "Accommodation" } else { "Food" };
                        json!({"id": id, "category": category})
                    })
                    .collect::<Vec<_>>();
                let links = link_ids
                    .into_iter()
                    .map(|id| json!({"expenseId": id}))
                    .collect::<Vec<_>>();
                let mut location = json!({"id": "loc1", "costTrackingLinks": links});
                if inline {
                    location["accommodationData"] = json!("inline");
                }
                json!({
                    "schemaVersion": version,
                    "id": "tripP",
                    "travelData": {"locations": [location]},
                    "costData": {"expenses": expenses}
                })
            },
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_migration_is_idempotent_and_monotonic(document in legacy_strategy()) {
            let first = migrate_to_latest_schema(document);
            prop_assert!(first.to_version >= first.from_version);
            prop_assert_eq!(first.to_version, CURRENT_SCHEMA_VERSION);

            let second = migrate_to_latest_schema(first.document.clone());
            prop_assert_eq!(second.document, first.document);
            prop_assert!(second.cleanup.is_empty());
        }
    }
}
