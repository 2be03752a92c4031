//! Entity identities, field values and the persisted record shape.

use std::collections::BTreeMap;
use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::error::DomainError;

/// Identifier of an entity within its kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyId {
    Id(i64),
    Name(String),
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyId::Id(id) => write!(f, "{id}"),
            KeyId::Name(name) => write!(f, "'{name}'"),
        }
    }
}

/// Identity of an entity: its kind, its id and an optional parent key.
///
/// Parents form an ownership tree. Two keys are equal only if their whole
/// ancestor paths are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    kind: String,
    id: KeyId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent: Option<Box<EntityKey>>,
}

impl EntityKey {
    pub fn named(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: KeyId::Name(name.into()),
            parent: None,
        }
    }

    pub fn numeric(kind: impl Into<String>, id: i64) -> Self {
        Self {
            kind: kind.into(),
            id: KeyId::Id(id),
            parent: None,
        }
    }

    /// Place this key under `parent` in the ownership tree.
    pub fn with_parent(mut self, parent: EntityKey) -> Self {
        self.parent = Some(Box::new(parent));
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn id(&self) -> &KeyId {
        &self.id
    }

    pub fn parent(&self) -> Option<&EntityKey> {
        self.parent.as_deref()
    }

    /// Stable, URL-safe encoding of the full ancestor path.
    pub fn urlsafe(&self) -> String {
        let mut path = Vec::new();
        let mut current = Some(self);
        while let Some(key) = current {
            path.push((key.kind.as_str(), &key.id));
            current = key.parent();
        }
        path.reverse();

        // Serializing borrowed strings and ids cannot fail.
        let json = serde_json::to_vec(&path).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    /// Decode a key produced by [`EntityKey::urlsafe`].
    pub fn from_urlsafe(encoded: &str) -> Result<Self, DomainError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|err| DomainError::validation(format!("invalid key encoding: {err}")))?;
        let path: Vec<(String, KeyId)> = serde_json::from_slice(&bytes)
            .map_err(|err| DomainError::validation(format!("invalid key path: {err}")))?;

        let mut key: Option<EntityKey> = None;
        for (kind, id) in path {
            key = Some(EntityKey {
                kind,
                id,
                parent: key.map(Box::new),
            });
        }
        key.ok_or_else(|| DomainError::validation("empty key path"))
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(parent) = self.parent() {
            write!(f, "{parent} > ")?;
        }
        write!(f, "{}({})", self.kind, self.id)
    }
}

/// A single attribute value on an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Key(EntityKey),
}

impl FieldValue {
    pub fn as_key(&self) -> Option<&EntityKey> {
        match self {
            FieldValue::Key(key) => Some(key),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Plain JSON view used by template contexts. Keys render as their urlsafe form.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FieldValue::Null => serde_json::Value::Null,
            FieldValue::Bool(value) => serde_json::Value::Bool(*value),
            FieldValue::Int(value) => serde_json::Value::from(*value),
            FieldValue::Float(value) => serde_json::Value::from(*value),
            FieldValue::Text(value) => serde_json::Value::String(value.clone()),
            FieldValue::Key(key) => serde_json::Value::String(key.urlsafe()),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<EntityKey> for FieldValue {
    fn from(value: EntityKey) -> Self {
        FieldValue::Key(value)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(FieldValue::Null)
    }
}

/// A persisted record of some kind.
///
/// `updated_at` is owned by the store: every successful put replaces it. A
/// record that was never stored carries the Unix epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    key: EntityKey,
    updated_at: OffsetDateTime,
    fields: BTreeMap<String, FieldValue>,
}

impl Entity {
    pub fn new(key: EntityKey) -> Self {
        Self {
            key,
            updated_at: OffsetDateTime::UNIX_EPOCH,
            fields: BTreeMap::new(),
        }
    }

    /// Rebuild a record loaded from storage.
    pub fn from_parts(
        key: EntityKey,
        updated_at: OffsetDateTime,
        fields: BTreeMap<String, FieldValue>,
    ) -> Self {
        Self {
            key,
            updated_at,
            fields,
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn with_updated_at(mut self, updated_at: OffsetDateTime) -> Self {
        self.updated_at = updated_at;
        self
    }

    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    pub fn kind(&self) -> &str {
        self.key.kind()
    }

    pub fn updated_at(&self) -> OffsetDateTime {
        self.updated_at
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(FieldValue::as_text)
    }

    /// The key stored under `name`, if the attribute holds a non-null reference.
    pub fn reference(&self, name: &str) -> Option<&EntityKey> {
        self.get(name).and_then(FieldValue::as_key)
    }
}
