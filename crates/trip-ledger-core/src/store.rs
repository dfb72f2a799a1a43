//! Load/save boundary for trip documents.
//!
//! Backends persist opaque JSON blobs keyed by trip id together with a
//! monotonically increasing `documentVersion`. [`UnifiedDataStore`] layers the
//! migrator, typed parsing, compare-and-swap saves and the post-write boundary
//! sweep on top of any [`TripBlobStore`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{LedgerConfig, SweepPolicy};
use crate::delta::{apply_delta, CollectionDelta};
use crate::error::{ErrorKind, ValidationResult};
use crate::migrate::{migrate_to_latest_schema, LinkCleanupEntry};
use crate::model::{
    Accommodation, CostData, DocDate, Expense, InvalidTripId, Location, Route, TravelData,
    TripDocument, TripId, CURRENT_SCHEMA_VERSION,
};
use crate::validate::sweep_and_log;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("trip {0} not found")]
    NotFound(String),
    #[error("trip {trip_id} was modified concurrently: expected version {expected:?}, found {actual:?}")]
    Conflict {
        trip_id: String,
        expected: Option<u64>,
        actual: Option<u64>,
    },
    #[error(transparent)]
    InvalidTripId(#[from] InvalidTripId),
    #[error("trip {trip_id} is corrupt: {reason}")]
    Corrupt { trip_id: String, reason: String },
    #[error("storage backend failure: {0}")]
    Backend(String),
}

impl StoreError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) | Self::Corrupt { .. } => ErrorKind::InvalidTripData,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::InvalidTripId(_) => ErrorKind::ValidationError,
            Self::Backend(_) => ErrorKind::StoreError,
        }
    }

    fn corrupt(trip_id: &TripId, err: &serde_json::Error) -> Self {
        Self::Corrupt {
            trip_id: trip_id.to_string(),
            reason: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VersionedBlob {
    pub body: Value,
    pub document_version: u64,
}

/// Key-value persistence for trip documents.
///
/// `write` is a compare-and-swap: it succeeds only when the stored version
/// equals `expected` (`None` meaning "must not exist yet") and returns the new
/// version, which is always `expected + 1` (or 1 on create).
pub trait TripBlobStore {
    /// # Errors
    /// Returns [`StoreError::Backend`] when the backend cannot be read.
    fn read(&self, trip_id: &TripId) -> Result<Option<VersionedBlob>, StoreError>;

    /// # Errors
    /// Returns [`StoreError::Conflict`] on a version mismatch.
    fn write(
        &mut self,
        trip_id: &TripId,
        body: &Value,
        expected: Option<u64>,
    ) -> Result<u64, StoreError>;

    /// # Errors
    /// Returns [`StoreError::Backend`] when the backend cannot be read.
    fn trip_ids(&self) -> Result<Vec<TripId>, StoreError>;

    /// # Errors
    /// Returns [`StoreError::Backend`] when the entries cannot be stored.
    fn record_link_cleanup(&mut self, entries: &[LinkCleanupEntry]) -> Result<(), StoreError>;

    /// # Errors
    /// Returns [`StoreError::Backend`] when the backend cannot be read.
    fn link_cleanup_log(&self, trip_id: &TripId) -> Result<Vec<LinkCleanupEntry>, StoreError>;
}

/// Process-local backend used by tests and embedders.
#[derive(Debug, Default, Clone)]
pub struct InMemoryBlobStore {
    blobs: BTreeMap<String, VersionedBlob>,
    cleanup: Vec<LinkCleanupEntry>,
}

impl InMemoryBlobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl TripBlobStore for InMemoryBlobStore {
    fn read(&self, trip_id: &TripId) -> Result<Option<VersionedBlob>, StoreError> {
        Ok(self.blobs.get(trip_id.as_str()).cloned())
    }

    fn write(
        &mut self,
        trip_id: &TripId,
        body: &Value,
        expected: Option<u64>,
    ) -> Result<u64, StoreError> {
        let actual = self
            .blobs
            .get(trip_id.as_str())
            .map(|blob| blob.document_version);
        if actual != expected {
            return Err(StoreError::Conflict {
                trip_id: trip_id.to_string(),
                expected,
                actual,
            });
        }

        let next = expected.map_or(1, |version| version + 1);
        self.blobs.insert(
            trip_id.to_string(),
            VersionedBlob {
                body: body.clone(),
                document_version: next,
            },
        );
        Ok(next)
    }

    fn trip_ids(&self) -> Result<Vec<TripId>, StoreError> {
        Ok(self
            .blobs
            .keys()
            .filter_map(|raw| TripId::parse(raw).ok())
            .collect())
    }

    fn record_link_cleanup(&mut self, entries: &[LinkCleanupEntry]) -> Result<(), StoreError> {
        self.cleanup.extend_from_slice(entries);
        Ok(())
    }

    fn link_cleanup_log(&self, trip_id: &TripId) -> Result<Vec<LinkCleanupEntry>, StoreError> {
        Ok(self
            .cleanup
            .iter()
            .filter(|entry| entry.trip_id == trip_id.as_str())
            .cloned()
            .collect())
    }
}

/// Fields for a brand-new trip.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewTrip {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub start_date: Option<DocDate>,
    #[serde(default)]
    pub end_date: Option<DocDate>,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub overall_budget: f64,
}

/// PATCH-style change set. Absent fields and empty deltas leave the document
/// untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TripUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DocDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DocDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locations: Option<CollectionDelta<Location>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routes: Option<CollectionDelta<Route>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accommodations: Option<CollectionDelta<Accommodation>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expenses: Option<CollectionDelta<Expense>>,
}

fn delta_is_empty<T>(delta: Option<&CollectionDelta<T>>) -> bool {
    delta.map_or(true, CollectionDelta::is_empty)
}

impl TripUpdate {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.start_date.is_none()
            && self.end_date.is_none()
            && delta_is_empty(self.locations.as_ref())
            && delta_is_empty(self.routes.as_ref())
            && delta_is_empty(self.accommodations.as_ref())
            && delta_is_empty(self.expenses.as_ref())
    }

    pub fn apply_to(&self, doc: &mut TripDocument) {
        if let Some(title) = &self.title {
            doc.title.clone_from(title);
        }
        if let Some(description) = &self.description {
            doc.description.clone_from(description);
        }
        if let Some(start_date) = &self.start_date {
            doc.start_date = Some(start_date.clone());
        }
        if let Some(end_date) = &self.end_date {
            doc.end_date = Some(end_date.clone());
        }

        if !delta_is_empty(self.locations.as_ref()) || !delta_is_empty(self.routes.as_ref()) {
            let data = doc.travel_data.get_or_insert_with(TravelData::default);
            if let Some(delta) = &self.locations {
                data.locations = apply_delta(&data.locations, Some(delta));
            }
            if let Some(delta) = &self.routes {
                data.routes = apply_delta(&data.routes, Some(delta));
            }
        }

        if let Some(delta) = self.accommodations.as_ref().filter(|delta| !delta.is_empty()) {
            let current = doc.accommodations.take().unwrap_or_default();
            doc.accommodations = Some(apply_delta(&current, Some(delta)));
        }

        if let Some(delta) = self.expenses.as_ref().filter(|delta| !delta.is_empty()) {
            let costs = doc.cost_data.get_or_insert_with(CostData::default);
            costs.expenses = apply_delta(&costs.expenses, Some(delta));
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("write rejected by trip boundary sweep: {}", .0.summary())]
    Boundary(ValidationResult),
}

impl UpdateError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(err) => err.kind(),
            Self::Boundary(result) => result
                .errors
                .first()
                .map_or(ErrorKind::ValidationError, |error| error.kind),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOutcome {
    pub document: TripDocument,
    pub written: bool,
    pub sweep: ValidationResult,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub trip_id: String,
    pub from_version: u32,
    pub to_version: u32,
    pub persisted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub cleanup: Vec<LinkCleanupEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TripSummary {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DocDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DocDate>,
    pub schema_version: u32,
    pub document_version: u64,
    pub expense_count: usize,
    pub travel_item_count: usize,
}

impl TripSummary {
    fn of(doc: &TripDocument) -> Self {
        Self {
            id: doc.id.clone(),
            title: doc.title.clone(),
            start_date: doc.start_date.clone(),
            end_date: doc.end_date.clone(),
            schema_version: doc.schema_version,
            document_version: doc.document_version,
            expense_count: doc.expenses().len(),
            travel_item_count: doc.travel_items().count(),
        }
    }
}

/// Runs the post-write sweep on `after`. Under [`SweepPolicy::Blocking`] the
/// write is rejected only for violations `before` did not already have.
pub(crate) fn post_write_check(
    policy: SweepPolicy,
    before: &TripDocument,
    after: &TripDocument,
    operation: &str,
) -> Result<ValidationResult, ValidationResult> {
    let result = sweep_and_log(after, operation);
    if result.is_valid || policy == SweepPolicy::Advisory {
        return Ok(result);
    }

    let baseline = crate::validate::validate_all_trip_boundaries(before);
    let introduced = result
        .errors
        .iter()
        .filter(|error| !baseline.errors.contains(error))
        .cloned()
        .collect::<Vec<_>>();
    if introduced.is_empty() {
        Ok(result)
    } else {
        Err(ValidationResult::from_errors(introduced))
    }
}

pub struct UnifiedDataStore<S> {
    backend: S,
    config: LedgerConfig,
}

impl<S: TripBlobStore> UnifiedDataStore<S> {
    pub fn new(backend: S, config: LedgerConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn backend(&self) -> &S {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut S {
        &mut self.backend
    }

    pub fn into_backend(self) -> S {
        self.backend
    }

    /// Loads a trip, migrating it to the current schema first. When the
    /// migration advanced the document and `migration.persist_on_load` is set,
    /// the migrated body is written back and its cleanup entries logged.
    ///
    /// # Errors
    /// [`StoreError::NotFound`] for unknown trips, [`StoreError::Corrupt`] when
    /// the body does not fit the document model, backend errors otherwise.
    pub fn load(&mut self, trip_id: &TripId) -> Result<TripDocument, StoreError> {
        let persist = self.config.migration.persist_on_load;
        self.load_with_report(trip_id, persist)
            .map(|(document, _)| document)
    }

    /// Migrates and persists one trip regardless of `persist_on_load`.
    ///
    /// # Errors
    /// See [`UnifiedDataStore::load`].
    pub fn migrate_trip(&mut self, trip_id: &TripId) -> Result<MigrationReport, StoreError> {
        self.load_with_report(trip_id, true)
            .map(|(_, report)| report)
    }

    fn load_with_report(
        &mut self,
        trip_id: &TripId,
        persist: bool,
    ) -> Result<(TripDocument, MigrationReport), StoreError> {
        let blob = self
            .backend
            .read(trip_id)?
            .ok_or_else(|| StoreError::NotFound(trip_id.to_string()))?;
        let stored_version = blob.document_version;

        let outcome = migrate_to_latest_schema(blob.body);
        let advanced = outcome.advanced();
        let mut document = parse_document(trip_id, outcome.document)?;
        document.document_version = stored_version;

        let mut report = MigrationReport {
            trip_id: trip_id.to_string(),
            from_version: outcome.from_version,
            to_version: outcome.to_version,
            persisted: false,
            failure: outcome.failure.map(|err| err.to_string()),
            cleanup: outcome.cleanup,
        };

        if !(advanced && persist) {
            return Ok((document, report));
        }

        let mut migrated = document.clone();
        migrated.document_version = stored_version + 1;
        let body = migrated
            .to_value()
            .map_err(|err| StoreError::corrupt(trip_id, &err))?;

        match self.backend.write(trip_id, &body, Some(stored_version)) {
            Ok(version) => {
                migrated.document_version = version;
                self.backend.record_link_cleanup(&report.cleanup)?;
                report.persisted = true;
                tracing::info!(
                    trip_id = %trip_id,
                    from_version = report.from_version,
                    to_version = report.to_version,
                    removed = report.cleanup.len(),
                    document_version = version,
                    "persisted migrated trip document"
                );
                Ok((migrated, report))
            }
            Err(StoreError::Conflict { actual, .. }) => {
                tracing::warn!(
                    trip_id = %trip_id,
                    expected = stored_version,
                    actual = ?actual,
                    "trip changed while persisting migration; serving unpersisted copy"
                );
                Ok((document, report))
            }
            Err(err) => Err(err),
        }
    }

    /// Compare-and-swap save against the version `doc` was loaded at. On
    /// success `doc` carries the new `documentVersion` and `updatedAt`.
    ///
    /// # Errors
    /// [`StoreError::Conflict`] when the stored version moved on since load.
    pub fn save(&mut self, doc: &mut TripDocument) -> Result<(), StoreError> {
        let trip_id = TripId::parse(&doc.id)?;
        let expected = doc.document_version;

        let mut next = doc.clone();
        next.document_version = expected + 1;
        next.updated_at = Some(DocDate::now());
        let body = next
            .to_value()
            .map_err(|err| StoreError::corrupt(&trip_id, &err))?;

        next.document_version = self.backend.write(&trip_id, &body, Some(expected))?;
        tracing::debug!(
            trip_id = %trip_id,
            document_version = next.document_version,
            "saved trip document"
        );
        *doc = next;
        Ok(())
    }

    /// # Errors
    /// Backend errors only; a freshly generated id cannot collide in practice,
    /// and a collision surfaces as [`StoreError::Conflict`].
    pub fn create_trip(&mut self, new_trip: NewTrip) -> Result<TripDocument, StoreError> {
        let trip_id = TripId::generate();
        let now = DocDate::now();

        let doc = TripDocument {
            schema_version: CURRENT_SCHEMA_VERSION,
            document_version: 1,
            id: trip_id.to_string(),
            title: new_trip.title,
            description: new_trip.description,
            start_date: new_trip.start_date,
            end_date: new_trip.end_date,
            created_at: Some(now.clone()),
            updated_at: Some(now),
            travel_data: Some(TravelData::default()),
            accommodations: Some(Vec::new()),
            cost_data: Some(CostData {
                overall_budget: new_trip.overall_budget,
                currency: new_trip.currency,
                ..CostData::default()
            }),
            ..TripDocument::default()
        };

        let body = doc
            .to_value()
            .map_err(|err| StoreError::corrupt(&trip_id, &err))?;
        self.backend.write(&trip_id, &body, None)?;
        tracing::info!(trip_id = %trip_id, "created trip");
        Ok(doc)
    }

    /// Applies a PATCH-style update through the delta engine and saves it.
    /// An empty update, or one that changes nothing, is not written.
    ///
    /// # Errors
    /// Store errors, or [`UpdateError::Boundary`] when the sweep is blocking
    /// and the update would introduce boundary violations.
    pub fn apply_update(
        &mut self,
        trip_id: &TripId,
        update: &TripUpdate,
    ) -> Result<UpdateOutcome, UpdateError> {
        let before = self.load(trip_id)?;
        if update.is_empty() {
            return Ok(UpdateOutcome {
                document: before,
                written: false,
                sweep: ValidationResult::valid(),
            });
        }

        let mut after = before.clone();
        update.apply_to(&mut after);
        if after == before {
            return Ok(UpdateOutcome {
                document: before,
                written: false,
                sweep: ValidationResult::valid(),
            });
        }

        let sweep = post_write_check(
            self.config.validation.post_write_sweep,
            &before,
            &after,
            "apply_update",
        )
        .map_err(UpdateError::Boundary)?;

        self.save(&mut after)?;
        Ok(UpdateOutcome {
            document: after,
            written: true,
            sweep,
        })
    }

    /// Summaries of every readable trip. Documents that fail to load are
    /// logged and skipped so one bad trip cannot hide the others.
    ///
    /// # Errors
    /// Only when the backend cannot enumerate trip ids.
    pub fn list_trips(&self) -> Result<Vec<TripSummary>, StoreError> {
        let mut summaries = Vec::new();
        for trip_id in self.backend.trip_ids()? {
            match self.read_migrated(&trip_id) {
                Ok(doc) => summaries.push(TripSummary::of(&doc)),
                Err(err) => {
                    tracing::warn!(trip_id = %trip_id, error = %err, "skipping unreadable trip");
                }
            }
        }
        Ok(summaries)
    }

    fn read_migrated(&self, trip_id: &TripId) -> Result<TripDocument, StoreError> {
        let blob = self
            .backend
            .read(trip_id)?
            .ok_or_else(|| StoreError::NotFound(trip_id.to_string()))?;
        let outcome = migrate_to_latest_schema(blob.body);
        let mut doc = parse_document(trip_id, outcome.document)?;
        doc.document_version = blob.document_version;
        Ok(doc)
    }

    /// # Errors
    /// Backend errors only.
    pub fn cleanup_log(&self, trip_id: &TripId) -> Result<Vec<LinkCleanupEntry>, StoreError> {
        self.backend.link_cleanup_log(trip_id)
    }
}

fn parse_document(trip_id: &TripId, body: Value) -> Result<TripDocument, StoreError> {
    let doc = TripDocument::from_value(body).map_err(|err| StoreError::corrupt(trip_id, &err))?;
    if !doc.id.is_empty() && doc.id != trip_id.as_str() {
        return Err(StoreError::Corrupt {
            trip_id: trip_id.to_string(),
            reason: format!("body declares id {}", doc.id),
        });
    }
    Ok(doc)
}
