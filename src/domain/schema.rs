//! Per-kind schemas and cache-break declarations.
//!
//! A kind declares which of its reference attributes point at entities that
//! "contain" it for caching purposes. Declarations come in two equivalent
//! shapes in configuration:
//!
//! ```toml
//! [[kinds]]
//! name = "Post"
//! fields = { blog = "key:Blog", title = "text" }
//! cache_break = "blog"            # flat form
//!
//! [[kinds]]
//! name = "Comment"
//! fields = { post = "key:Post" }
//! cascade = { cache_break = ["post"] }   # nested form
//! ```
//!
//! The flat form wins when both are present. Resolution happens once, when the
//! kind is registered; validation of the named attributes happens when a write
//! cascades (see [`crate::cache::InvalidationCascade`]).

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

/// Declared type of an entity attribute.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum FieldType {
    Text,
    Int,
    Float,
    Bool,
    /// Reference to another entity, optionally restricted to one kind.
    Key { kind: Option<String> },
}

impl FieldType {
    pub fn key_of(kind: impl Into<String>) -> Self {
        FieldType::Key {
            kind: Some(kind.into()),
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, FieldType::Key { .. })
    }
}

impl TryFrom<String> for FieldType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let trimmed = value.trim();
        match trimmed {
            "text" => Ok(FieldType::Text),
            "int" => Ok(FieldType::Int),
            "float" => Ok(FieldType::Float),
            "bool" => Ok(FieldType::Bool),
            "key" => Ok(FieldType::Key { kind: None }),
            other => match other.strip_prefix("key:") {
                Some(kind) if !kind.trim().is_empty() => Ok(FieldType::key_of(kind.trim())),
                _ => Err(format!("unknown field type `{other}`")),
            },
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Text => f.write_str("text"),
            FieldType::Int => f.write_str("int"),
            FieldType::Float => f.write_str("float"),
            FieldType::Bool => f.write_str("bool"),
            FieldType::Key { kind: None } => f.write_str("key"),
            FieldType::Key { kind: Some(kind) } => write!(f, "key:{kind}"),
        }
    }
}

/// A single attribute name or a list of them.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn to_vec(&self) -> Vec<String> {
        match self {
            OneOrMany::One(value) => vec![value.clone()],
            OneOrMany::Many(values) => values.clone(),
        }
    }
}

/// Kind declaration as written in configuration.
///
/// Kinds are an array of tables rather than a map so that kind names keep
/// their case through the layered config loader.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KindDeclaration {
    pub name: String,
    pub fields: BTreeMap<String, FieldType>,
    /// Flat form.
    pub cache_break: Option<OneOrMany>,
    /// Nested form.
    pub cascade: Option<CascadeDeclaration>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CascadeDeclaration {
    pub cache_break: Option<OneOrMany>,
}

impl KindDeclaration {
    /// Declared cache-break attributes, flat form first.
    pub fn dependencies(&self) -> Vec<String> {
        let declared = self.cache_break.as_ref().or_else(|| {
            self.cascade
                .as_ref()
                .and_then(|cascade| cascade.cache_break.as_ref())
        });

        let mut out: Vec<String> = Vec::new();
        for attribute in declared.map(OneOrMany::to_vec).unwrap_or_default() {
            if !out.contains(&attribute) {
                out.push(attribute);
            }
        }
        out
    }
}

/// Configuration errors in cache-break declarations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("kind `{kind}` declares cache-break attribute `{attribute}` which it does not define")]
    UnknownAttribute { kind: String, attribute: String },
    #[error("attribute `{attribute}` of kind `{kind}` must be a key reference, not `{found}`")]
    NotAReference {
        kind: String,
        attribute: String,
        found: FieldType,
    },
}

/// Resolved schema of one kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindSchema {
    name: String,
    fields: BTreeMap<String, FieldType>,
    dependencies: Vec<String>,
}

impl KindSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: BTreeMap::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn from_declaration(declaration: &KindDeclaration) -> Self {
        Self {
            name: declaration.name.clone(),
            fields: declaration.fields.clone(),
            dependencies: declaration.dependencies(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields.insert(name.into(), ty);
        self
    }

    /// Declare `attribute` as a cache-break reference.
    pub fn depends_on(mut self, attribute: impl Into<String>) -> Self {
        let attribute = attribute.into();
        if !self.dependencies.contains(&attribute) {
            self.dependencies.push(attribute);
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldType> {
        &self.fields
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    /// Check that `attribute` exists on this kind and holds a reference.
    pub fn resolve_reference(&self, attribute: &str) -> Result<&FieldType, SchemaError> {
        let ty = self
            .fields
            .get(attribute)
            .ok_or_else(|| SchemaError::UnknownAttribute {
                kind: self.name.clone(),
                attribute: attribute.to_string(),
            })?;

        if !ty.is_reference() {
            return Err(SchemaError::NotAReference {
                kind: self.name.clone(),
                attribute: attribute.to_string(),
                found: ty.clone(),
            });
        }

        Ok(ty)
    }

    pub fn check(&self) -> Vec<SchemaError> {
        self.dependencies
            .iter()
            .filter_map(|attribute| self.resolve_reference(attribute).err())
            .collect()
    }
}

/// Registered kinds, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    kinds: HashMap<String, Arc<KindSchema>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later declarations of the same kind replace earlier ones.
    pub fn from_declarations(declarations: &[KindDeclaration]) -> Self {
        let mut registry = Self::new();
        for declaration in declarations {
            registry.register(KindSchema::from_declaration(declaration));
        }
        registry
    }

    /// Register a kind, replacing any previous schema with the same name.
    pub fn register(&mut self, schema: KindSchema) {
        self.kinds.insert(schema.name.clone(), Arc::new(schema));
    }

    pub fn with(mut self, schema: KindSchema) -> Self {
        self.register(schema);
        self
    }

    pub fn get(&self, kind: &str) -> Option<Arc<KindSchema>> {
        self.kinds.get(kind).cloned()
    }

    /// Every configuration error across all kinds, ordered by kind name.
    pub fn check(&self) -> Vec<SchemaError> {
        let mut names: Vec<&String> = self.kinds.keys().collect();
        names.sort();
        names
            .into_iter()
            .flat_map(|name| self.kinds[name].check())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}
