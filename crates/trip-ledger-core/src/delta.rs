//! Diff/patch for ordered, id-keyed entity collections.

use std::collections::{HashMap, HashSet};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::Identified;

/// Field-level patch addressed by id. `fields` never contains `id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityPatch {
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl EntityPatch {
    /// Builds a patch carrying every serialized field of `entity`.
    ///
    /// # Errors
    /// Returns the serde error when `entity` does not serialize to an object.
    pub fn from_entity<T: Identified + Serialize>(entity: &T) -> Result<Self, serde_json::Error> {
        let mut fields = match serde_json::to_value(entity)? {
            Value::Object(map) => map,
            other => {
                return Err(serde::ser::Error::custom(format!(
                    "entity {} serialized to non-object {other}",
                    entity.entity_id()
                )))
            }
        };
        fields.remove("id");
        Ok(Self {
            id: entity.entity_id().to_string(),
            fields,
        })
    }
}

/// Incremental change to an id-keyed collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CollectionDelta<T> {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub added: Vec<T>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub updated: Vec<EntityPatch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<Vec<String>>,
}

impl<T> Default for CollectionDelta<T> {
    fn default() -> Self {
        Self {
            added: Vec::new(),
            updated: Vec::new(),
            removed_ids: Vec::new(),
            order: None,
        }
    }
}

impl<T> CollectionDelta<T> {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.updated.is_empty()
            && self.removed_ids.is_empty()
            && self.order.is_none()
    }
}

/// Serializes `value` with object keys sorted at every depth.
///
/// Dates serialize through their ISO wire form, so two entities compare equal
/// here exactly when a client would see the same JSON.
///
/// # Errors
/// Returns the serde error when `value` cannot be serialized.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let value = serde_json::to_value(value)?;
    serde_json::to_string(&sort_keys(value))
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries = map.into_iter().collect::<Vec<_>>();
            entries.sort_by(|lhs, rhs| lhs.0.cmp(&rhs.0));
            let mut sorted = Map::new();
            for (key, inner) in entries {
                sorted.insert(key, sort_keys(inner));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

/// Computes the delta that turns `previous` into `current`, or `None` when
/// nothing changed. Duplicate ids are resolved first-wins.
///
/// # Errors
/// Returns the serde error when an entity cannot be serialized.
pub fn create_delta<T>(
    previous: &[T],
    current: &[T],
) -> Result<Option<CollectionDelta<T>>, serde_json::Error>
where
    T: Identified + Serialize + Clone,
{
    let mut previous_by_id: HashMap<&str, &T> = HashMap::with_capacity(previous.len());
    for entity in previous {
        previous_by_id.entry(entity.entity_id()).or_insert(entity);
    }
    let current_ids: HashSet<&str> = current.iter().map(Identified::entity_id).collect();

    let mut delta = CollectionDelta::default();
    let mut seen = HashSet::with_capacity(current.len());
    for entity in current {
        let id = entity.entity_id();
        if !seen.insert(id) {
            continue;
        }

        match previous_by_id.get(id) {
            None => delta.added.push(entity.clone()),
            Some(before) => {
                if canonical_json(*before)? != canonical_json(entity)? {
                    delta.updated.push(EntityPatch::from_entity(entity)?);
                }
            }
        }
    }

    let mut removed_seen = HashSet::new();
    for entity in previous {
        let id = entity.entity_id();
        if !current_ids.contains(id) && removed_seen.insert(id) {
            delta.removed_ids.push(id.to_string());
        }
    }

    // What applying added/removed alone would produce; anything else needs `order`.
    let implied = dedup_ids(previous.iter().map(Identified::entity_id))
        .into_iter()
        .filter(|id| current_ids.contains(id))
        .chain(delta.added.iter().map(Identified::entity_id))
        .collect::<Vec<_>>();
    let actual = dedup_ids(current.iter().map(Identified::entity_id));
    if implied != actual {
        delta.order = Some(actual.into_iter().map(str::to_string).collect());
    }

    if delta.is_empty() {
        Ok(None)
    } else {
        Ok(Some(delta))
    }
}

fn dedup_ids<'a>(ids: impl Iterator<Item = &'a str>) -> Vec<&'a str> {
    let mut seen = HashSet::new();
    ids.filter(|id| seen.insert(*id)).collect()
}

/// Applies `delta` to a copy of `existing`.
///
/// Added entries whose id already exists merge into the existing entry;
/// updates for unknown ids are dropped; ids missing from `order` keep their
/// prior relative order after the ordered ones.
#[must_use]
pub fn apply_delta<T>(existing: &[T], delta: Option<&CollectionDelta<T>>) -> Vec<T>
where
    T: Identified + Serialize + DeserializeOwned + Clone,
{
    let mut entities = existing.to_vec();
    let Some(delta) = delta else {
        return entities;
    };

    for entity in &delta.added {
        let position = entities
            .iter()
            .position(|candidate| candidate.entity_id() == entity.entity_id());
        match position {
            None => entities.push(entity.clone()),
            Some(index) => match EntityPatch::from_entity(entity) {
                Ok(patch) => merge_at(&mut entities, index, &patch),
                Err(err) => tracing::warn!(
                    entity_id = entity.entity_id(),
                    error = %err,
                    "skipping added entity that cannot be serialized"
                ),
            },
        }
    }

    for patch in &delta.updated {
        let position = entities
            .iter()
            .position(|candidate| candidate.entity_id() == patch.id);
        match position {
            Some(index) => merge_at(&mut entities, index, patch),
            None => tracing::debug!(entity_id = %patch.id, "dropping update for unknown id"),
        }
    }

    if !delta.removed_ids.is_empty() {
        let removed: HashSet<&str> = delta.removed_ids.iter().map(String::as_str).collect();
        entities.retain(|entity| !removed.contains(entity.entity_id()));
    }

    match &delta.order {
        Some(order) => reorder(entities, order),
        None => entities,
    }
}

fn merge_at<T>(entities: &mut [T], index: usize, patch: &EntityPatch)
where
    T: Identified + Serialize + DeserializeOwned,
{
    match merge_fields(&entities[index], patch) {
        Ok(merged) => entities[index] = merged,
        Err(err) => tracing::warn!(
            entity_id = %patch.id,
            error = %err,
            "skipping patch that does not fit the entity shape"
        ),
    }
}

fn merge_fields<T>(entity: &T, patch: &EntityPatch) -> Result<T, serde_json::Error>
where
    T: Identified + Serialize + DeserializeOwned,
{
    let mut object = match serde_json::to_value(entity)? {
        Value::Object(map) => map,
        other => {
            return Err(serde::ser::Error::custom(format!(
                "entity {} serialized to non-object {other}",
                entity.entity_id()
            )))
        }
    };

    for (key, value) in &patch.fields {
        if key != "id" {
            object.insert(key.clone(), value.clone());
        }
    }

    serde_json::from_value(Value::Object(object))
}

fn reorder<T: Identified>(entities: Vec<T>, order: &[String]) -> Vec<T> {
    let mut slots: Vec<Option<T>> = entities.into_iter().map(Some).collect();
    let mut index_by_id: HashMap<String, usize> = HashMap::with_capacity(slots.len());
    for (index, slot) in slots.iter().enumerate() {
        if let Some(entity) = slot {
            index_by_id
                .entry(entity.entity_id().to_string())
                .or_insert(index);
        }
    }

    let mut ordered = Vec::with_capacity(slots.len());
    for id in order {
        if let Some(index) = index_by_id.remove(id) {
            if let Some(entity) = slots[index].take() {
                ordered.push(entity);
            }
        }
    }

    ordered.extend(slots.into_iter().flatten());
    ordered
}
