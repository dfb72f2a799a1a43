//! Versioned trip documents with referential integrity between expenses and
//! the travel items they pay for.

#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod delta;
pub mod error;
pub mod linking;
pub mod migrate;
pub mod model;
pub mod store;
pub mod validate;

pub use config::{ConfigError, LedgerConfig, SplitConfig, SweepPolicy};
pub use delta::{apply_delta, canonical_json, create_delta, CollectionDelta, EntityPatch};
pub use error::{ErrorKind, StatusClass, ValidationError, ValidationResult};
pub use linking::{
    derive_travel_reference, expense_links, link_expense, unlink_expense, validate_split,
    ExpenseLink, ExpenseLinkingService, LinkMode, LinkOutcome, LinkTarget, LinkingError,
};
pub use migrate::{
    migrate_to_latest_schema, CleanupItemKind, CleanupReason, LinkCleanupEntry, MigrationError,
    MigrationOutcome,
};
pub use model::{
    Accommodation, CostData, CostTrackingLink, DocDate, Expense, Identified, Location, Route,
    RouteSegment, SplitMode, TravelData, TravelItemKind, TravelItemMut, TravelItemRef,
    TravelReference, TripDocument, TripId, CURRENT_SCHEMA_VERSION,
};
pub use store::{
    InMemoryBlobStore, MigrationReport, NewTrip, StoreError, TripBlobStore, TripSummary,
    TripUpdate, UnifiedDataStore, UpdateError, UpdateOutcome, VersionedBlob,
};
pub use validate::{
    sweep_and_log, validate_all_trip_boundaries, validate_cost_tracking_links,
    validate_expense_belongs_to_trip, validate_travel_item_belongs_to_trip, validate_trip_boundary,
};
