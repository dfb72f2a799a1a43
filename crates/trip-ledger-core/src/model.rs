//! Typed trip document model.
//!
//! Every persisted trip is a single JSON document. Fields this crate does not
//! interpret (weather, wikipedia, instagram enrichment, ...) are carried through
//! the `extra` maps so a load/save cycle never drops data.

use std::fmt::{Display, Formatter};

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime, UtcOffset};
use ulid::Ulid;

/// Schema version stamped on every document written by this crate.
pub const CURRENT_SCHEMA_VERSION: u32 = 4;

/// Schema version assumed for documents that predate the `schemaVersion` field.
pub const LEGACY_SCHEMA_VERSION: u32 = 1;

/// Expense category whose links belong on an accommodation rather than its location.
pub const ACCOMMODATION_CATEGORY: &str = "Accommodation";

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Returns true only for the exact `YYYY-MM-DDTHH:mm:ss.sssZ` shape.
#[must_use]
pub fn is_iso_millis(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    if bytes.len() != 24 {
        return false;
    }

    bytes.iter().enumerate().all(|(index, byte)| match index {
        4 | 7 => *byte == b'-',
        10 => *byte == b'T',
        13 | 16 => *byte == b':',
        19 => *byte == b'.',
        23 => *byte == b'Z',
        _ => byte.is_ascii_digit(),
    })
}

/// Parses the narrow ISO shape produced by `Date.prototype.toISOString`.
#[must_use]
pub fn parse_iso_millis(raw: &str) -> Option<OffsetDateTime> {
    if !is_iso_millis(raw) {
        return None;
    }
    OffsetDateTime::parse(raw, &Rfc3339).ok()
}

#[must_use]
pub fn format_iso_millis(value: OffsetDateTime) -> String {
    let utc = value.to_offset(UtcOffset::UTC);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:03}Z",
        utc.year(),
        u8::from(utc.month()),
        utc.day(),
        utc.hour(),
        utc.minute(),
        utc.second(),
        utc.millisecond()
    )
}

/// A date-bearing field.
///
/// Strings in the exact millisecond ISO form revive to an instant; anything
/// else (`"2024-05-01"`, free text) is kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocDate {
    Instant(OffsetDateTime),
    Text(String),
}

impl DocDate {
    #[must_use]
    pub fn revive(raw: &str) -> Self {
        match parse_iso_millis(raw) {
            Some(instant) => Self::Instant(instant),
            None => Self::Text(raw.to_string()),
        }
    }

    /// Current instant truncated to the millisecond precision of the wire format.
    #[must_use]
    pub fn now() -> Self {
        let now = now_utc();
        let excess = i64::from(now.nanosecond() % 1_000_000);
        Self::Instant(now - Duration::nanoseconds(excess))
    }

    #[must_use]
    pub fn instant(&self) -> Option<OffsetDateTime> {
        match self {
            Self::Instant(value) => Some(*value),
            Self::Text(_) => None,
        }
    }

    #[must_use]
    pub fn to_wire(&self) -> String {
        match self {
            Self::Instant(value) => format_iso_millis(*value),
            Self::Text(raw) => raw.clone(),
        }
    }
}

impl Display for DocDate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_wire())
    }
}

impl Serialize for DocDate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_wire())
    }
}

impl<'de> Deserialize<'de> for DocDate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::revive(&raw))
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("invalid trip id {0:?}: trip ids are non-empty and ASCII alphanumeric")]
pub struct InvalidTripId(pub String);

/// Storage key of a trip document.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TripId(String);

impl TripId {
    /// Validates a raw trip id.
    ///
    /// # Errors
    /// Returns [`InvalidTripId`] when the id is empty or contains anything
    /// other than ASCII letters and digits.
    pub fn parse(raw: &str) -> Result<Self, InvalidTripId> {
        if raw.is_empty() || !raw.bytes().all(|byte| byte.is_ascii_alphanumeric()) {
            return Err(InvalidTripId(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TripId {
    type Error = InvalidTripId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TripId> for String {
    fn from(value: TripId) -> Self {
        value.0
    }
}

impl Display for TripId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TravelItemKind {
    Location,
    Route,
    Accommodation,
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("unknown travel item type: {0}")]
pub struct UnknownTravelItemType(pub String);

impl TravelItemKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Location => "location",
            Self::Route => "route",
            Self::Accommodation => "accommodation",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "location" => Some(Self::Location),
            "route" => Some(Self::Route),
            "accommodation" => Some(Self::Accommodation),
            _ => None,
        }
    }

    /// Classifies an untyped record at the import boundary.
    ///
    /// An explicit `kind` wins; otherwise the legacy shape rules apply
    /// (`coordinates` → location, `type`+`from`+`to` → route,
    /// `locationId` → accommodation).
    ///
    /// # Errors
    /// Returns [`UnknownTravelItemType`] when no rule matches.
    pub fn infer_from_shape(value: &Value) -> Result<Self, UnknownTravelItemType> {
        let Some(object) = value.as_object() else {
            return Err(UnknownTravelItemType("record is not an object".to_string()));
        };

        if let Some(kind) = object.get("kind").and_then(Value::as_str) {
            return Self::parse(kind).ok_or_else(|| UnknownTravelItemType(kind.to_string()));
        }

        if object.contains_key("coordinates") {
            return Ok(Self::Location);
        }
        if ["type", "from", "to"]
            .iter()
            .all(|field| object.contains_key(*field))
        {
            return Ok(Self::Route);
        }
        if object.contains_key("locationId") {
            return Ok(Self::Accommodation);
        }

        let id = object
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or("<no id>");
        Err(UnknownTravelItemType(format!("record {id}")))
    }
}

impl Display for TravelItemKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

macro_rules! kind_tag {
    ($name:ident, $tag:literal) => {
        /// Serialized `kind` discriminator; only accepts its own tag.
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct $name;

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str($tag)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                if raw == $tag {
                    Ok(Self)
                } else {
                    Err(D::Error::custom(format!(
                        "expected kind {:?}, found {raw:?}",
                        $tag
                    )))
                }
            }
        }
    };
}

kind_tag!(LocationTag, "location");
kind_tag!(RouteTag, "route");
kind_tag!(AccommodationTag, "accommodation");

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SplitMode {
    Equal,
    Percentage,
    Fixed,
}

impl SplitMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Equal => "equal",
            Self::Percentage => "percentage",
            Self::Fixed => "fixed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "equal" => Some(Self::Equal),
            "percentage" => Some(Self::Percentage),
            "fixed" => Some(Self::Fixed),
            _ => None,
        }
    }
}

/// Canonical expense ↔ travel item link, held on the travel item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CostTrackingLink {
    pub expense_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_mode: Option<SplitMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_value: Option<f64>,
}

impl CostTrackingLink {
    #[must_use]
    pub fn new(expense_id: impl Into<String>) -> Self {
        Self {
            expense_id: expense_id.into(),
            description: None,
            split_mode: None,
            split_value: None,
        }
    }
}

pub type Coordinates = [f64; 2];

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    #[serde(default)]
    pub kind: LocationTag,
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DocDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DocDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub accommodation_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cost_tracking_links: Vec<CostTrackingLink>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One leg of a composite route. Legs are not standalone link targets.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteSegment {
    pub id: String,
    #[serde(rename = "type", default)]
    pub transport_type: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cost_tracking_links: Vec<CostTrackingLink>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    #[serde(default)]
    pub kind: RouteTag,
    pub id: String,
    #[serde(rename = "type", default)]
    pub transport_type: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub departure_time: Option<DocDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arrival_time: Option<DocDate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_routes: Vec<RouteSegment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cost_tracking_links: Vec<CostTrackingLink>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Accommodation {
    #[serde(default)]
    pub kind: AccommodationTag,
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub location_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accommodation_data: Option<String>,
    #[serde(default)]
    pub is_accommodation_public: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DocDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DocDate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cost_tracking_links: Vec<CostTrackingLink>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Legacy expense-side pointer, kept only for backward compatibility.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TravelReference {
    Location {
        #[serde(rename = "locationId")]
        location_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Accommodation {
        #[serde(rename = "accommodationId")]
        accommodation_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Route {
        #[serde(rename = "routeId")]
        route_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
}

impl TravelReference {
    #[must_use]
    pub fn target(&self) -> (TravelItemKind, &str) {
        match self {
            Self::Location { location_id, .. } => (TravelItemKind::Location, location_id),
            Self::Accommodation {
                accommodation_id, ..
            } => (TravelItemKind::Accommodation, accommodation_id),
            Self::Route { route_id, .. } => (TravelItemKind::Route, route_id),
        }
    }

    #[must_use]
    pub fn to_item(kind: TravelItemKind, item_id: &str, description: Option<String>) -> Self {
        match kind {
            TravelItemKind::Location => Self::Location {
                location_id: item_id.to_string(),
                description,
            },
            TravelItemKind::Accommodation => Self::Accommodation {
                accommodation_id: item_id.to_string(),
                description,
            },
            TravelItemKind::Route => Self::Route {
                route_id: item_id.to_string(),
                description,
            },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Expense {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DocDate>,
    #[serde(default)]
    pub amount: f64,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub travel_reference: Option<TravelReference>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TravelData {
    #[serde(default)]
    pub locations: Vec<Location>,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CostData {
    #[serde(default)]
    pub overall_budget: f64,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub expenses: Vec<Expense>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn legacy_schema_version() -> u32 {
    LEGACY_SCHEMA_VERSION
}

/// The unit of storage and atomicity: one document per trip.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TripDocument {
    #[serde(default = "legacy_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub document_version: u64,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DocDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DocDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DocDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DocDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub travel_data: Option<TravelData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accommodations: Option<Vec<Accommodation>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_data: Option<CostData>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Anything addressable by id inside a trip document.
pub trait Identified {
    fn entity_id(&self) -> &str;
}

macro_rules! identified {
    ($($ty:ty),+ $(,)?) => {
        $(impl Identified for $ty {
            fn entity_id(&self) -> &str {
                &self.id
            }
        })+
    };
}

identified!(Location, Route, RouteSegment, Accommodation, Expense);

/// Borrowed view over the three linkable travel item variants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TravelItemRef<'a> {
    Location(&'a Location),
    Route(&'a Route),
    Accommodation(&'a Accommodation),
}

impl<'a> TravelItemRef<'a> {
    #[must_use]
    pub fn kind(self) -> TravelItemKind {
        match self {
            Self::Location(_) => TravelItemKind::Location,
            Self::Route(_) => TravelItemKind::Route,
            Self::Accommodation(_) => TravelItemKind::Accommodation,
        }
    }

    #[must_use]
    pub fn id(self) -> &'a str {
        match self {
            Self::Location(item) => &item.id,
            Self::Route(item) => &item.id,
            Self::Accommodation(item) => &item.id,
        }
    }

    #[must_use]
    pub fn cost_tracking_links(self) -> &'a [CostTrackingLink] {
        match self {
            Self::Location(item) => &item.cost_tracking_links,
            Self::Route(item) => &item.cost_tracking_links,
            Self::Accommodation(item) => &item.cost_tracking_links,
        }
    }
}

/// Mutable counterpart of [`TravelItemRef`].
#[derive(Debug)]
pub enum TravelItemMut<'a> {
    Location(&'a mut Location),
    Route(&'a mut Route),
    Accommodation(&'a mut Accommodation),
}

impl<'a> TravelItemMut<'a> {
    #[must_use]
    pub fn kind(&self) -> TravelItemKind {
        match self {
            Self::Location(_) => TravelItemKind::Location,
            Self::Route(_) => TravelItemKind::Route,
            Self::Accommodation(_) => TravelItemKind::Accommodation,
        }
    }

    #[must_use]
    pub fn into_links(self) -> &'a mut Vec<CostTrackingLink> {
        match self {
            Self::Location(item) => &mut item.cost_tracking_links,
            Self::Route(item) => &mut item.cost_tracking_links,
            Self::Accommodation(item) => &mut item.cost_tracking_links,
        }
    }
}

/// Where a link lives, including route legs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkOwner {
    pub kind: TravelItemKind,
    pub item_id: String,
    pub parent_route_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DroppedLink {
    pub owner: LinkOwner,
    pub link: CostTrackingLink,
}

impl TripDocument {
    /// Parses a stored body into the typed model.
    ///
    /// # Errors
    /// Returns the underlying serde error when the body does not fit the model.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// # Errors
    /// Returns the underlying serde error when serialization fails.
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    #[must_use]
    pub fn locations(&self) -> &[Location] {
        self.travel_data
            .as_ref()
            .map_or(&[], |data| data.locations.as_slice())
    }

    #[must_use]
    pub fn routes(&self) -> &[Route] {
        self.travel_data
            .as_ref()
            .map_or(&[], |data| data.routes.as_slice())
    }

    #[must_use]
    pub fn accommodations(&self) -> &[Accommodation] {
        self.accommodations.as_deref().unwrap_or(&[])
    }

    #[must_use]
    pub fn expenses(&self) -> &[Expense] {
        self.cost_data
            .as_ref()
            .map_or(&[], |data| data.expenses.as_slice())
    }

    #[must_use]
    pub fn find_expense(&self, expense_id: &str) -> Option<&Expense> {
        self.expenses().iter().find(|expense| expense.id == expense_id)
    }

    pub fn find_expense_mut(&mut self, expense_id: &str) -> Option<&mut Expense> {
        self.cost_data
            .as_mut()?
            .expenses
            .iter_mut()
            .find(|expense| expense.id == expense_id)
    }

    /// Locations, then routes, then accommodations. Route legs are excluded.
    pub fn travel_items(&self) -> impl Iterator<Item = TravelItemRef<'_>> {
        self.locations()
            .iter()
            .map(TravelItemRef::Location)
            .chain(self.routes().iter().map(TravelItemRef::Route))
            .chain(
                self.accommodations()
                    .iter()
                    .map(TravelItemRef::Accommodation),
            )
    }

    #[must_use]
    pub fn find_travel_item(&self, item_id: &str) -> Option<TravelItemRef<'_>> {
        self.travel_items().find(|item| item.id() == item_id)
    }

    #[must_use]
    pub fn find_travel_item_of(
        &self,
        kind: TravelItemKind,
        item_id: &str,
    ) -> Option<TravelItemRef<'_>> {
        self.travel_items()
            .find(|item| item.kind() == kind && item.id() == item_id)
    }

    pub fn travel_item_mut(
        &mut self,
        kind: TravelItemKind,
        item_id: &str,
    ) -> Option<TravelItemMut<'_>> {
        match kind {
            TravelItemKind::Location => self
                .travel_data
                .as_mut()?
                .locations
                .iter_mut()
                .find(|item| item.id == item_id)
                .map(TravelItemMut::Location),
            TravelItemKind::Route => self
                .travel_data
                .as_mut()?
                .routes
                .iter_mut()
                .find(|item| item.id == item_id)
                .map(TravelItemMut::Route),
            TravelItemKind::Accommodation => self
                .accommodations
                .as_mut()?
                .iter_mut()
                .find(|item| item.id == item_id)
                .map(TravelItemMut::Accommodation),
        }
    }

    pub fn links_mut(
        &mut self,
        kind: TravelItemKind,
        item_id: &str,
    ) -> Option<&mut Vec<CostTrackingLink>> {
        self.travel_item_mut(kind, item_id)
            .map(TravelItemMut::into_links)
    }

    /// Keeps only the links for which `keep` returns true, across locations,
    /// routes (and their legs) and accommodations. Returns what was dropped.
    pub fn retain_links<F>(&mut self, mut keep: F) -> Vec<DroppedLink>
    where
        F: FnMut(&LinkOwner, &CostTrackingLink) -> bool,
    {
        let mut dropped = Vec::new();

        if let Some(data) = self.travel_data.as_mut() {
            for location in &mut data.locations {
                let owner = LinkOwner {
                    kind: TravelItemKind::Location,
                    item_id: location.id.clone(),
                    parent_route_id: None,
                };
                retain_owned(&mut location.cost_tracking_links, &owner, &mut keep, &mut dropped);
            }

            for route in &mut data.routes {
                let owner = LinkOwner {
                    kind: TravelItemKind::Route,
                    item_id: route.id.clone(),
                    parent_route_id: None,
                };
                retain_owned(&mut route.cost_tracking_links, &owner, &mut keep, &mut dropped);

                for segment in &mut route.sub_routes {
                    let owner = LinkOwner {
                        kind: TravelItemKind::Route,
                        item_id: segment.id.clone(),
                        parent_route_id: Some(route.id.clone()),
                    };
                    retain_owned(
                        &mut segment.cost_tracking_links,
                        &owner,
                        &mut keep,
                        &mut dropped,
                    );
                }
            }
        }

        if let Some(accommodations) = self.accommodations.as_mut() {
            for accommodation in accommodations {
                let owner = LinkOwner {
                    kind: TravelItemKind::Accommodation,
                    item_id: accommodation.id.clone(),
                    parent_route_id: None,
                };
                retain_owned(
                    &mut accommodation.cost_tracking_links,
                    &owner,
                    &mut keep,
                    &mut dropped,
                );
            }
        }

        dropped
    }

    /// Every link owner holding a link for `expense_id`, in document order.
    #[must_use]
    pub fn link_owners_for(&self, expense_id: &str) -> Vec<(LinkOwner, CostTrackingLink)> {
        let mut owners = Vec::new();
        let mut collect = |owner: LinkOwner, links: &[CostTrackingLink]| {
            for link in links.iter().filter(|link| link.expense_id == expense_id) {
                owners.push((owner.clone(), link.clone()));
            }
        };

        for location in self.locations() {
            collect(
                LinkOwner {
                    kind: TravelItemKind::Location,
                    item_id: location.id.clone(),
                    parent_route_id: None,
                },
                &location.cost_tracking_links,
            );
        }
        for route in self.routes() {
            collect(
                LinkOwner {
                    kind: TravelItemKind::Route,
                    item_id: route.id.clone(),
                    parent_route_id: None,
                },
                &route.cost_tracking_links,
            );
            for segment in &route.sub_routes {
                collect(
                    LinkOwner {
                        kind: TravelItemKind::Route,
                        item_id: segment.id.clone(),
                        parent_route_id: Some(route.id.clone()),
                    },
                    &segment.cost_tracking_links,
                );
            }
        }
        for accommodation in self.accommodations() {
            collect(
                LinkOwner {
                    kind: TravelItemKind::Accommodation,
                    item_id: accommodation.id.clone(),
                    parent_route_id: None,
                },
                &accommodation.cost_tracking_links,
            );
        }

        owners
    }
}

fn retain_owned<F>(
    links: &mut Vec<CostTrackingLink>,
    owner: &LinkOwner,
    keep: &mut F,
    dropped: &mut Vec<DroppedLink>,
) where
    F: FnMut(&LinkOwner, &CostTrackingLink) -> bool,
{
    let mut kept = Vec::with_capacity(links.len());
    for link in links.drain(..) {
        if keep(owner, &link) {
            kept.push(link);
        } else {
            dropped.push(DroppedLink {
                owner: owner.clone(),
                link,
            });
        }
    }
    *links = kept;
}
