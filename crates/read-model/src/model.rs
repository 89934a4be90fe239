//! Read model document and version types.

use chrono::{DateTime, SecondsFormat, Utc};
use common::ReadModelId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON object used for read-model data and metadata.
pub type Document = serde_json::Map<String, Value>;

/// Version of a read model.
///
/// A stored model always has a version of at least 1; `Version::initial()`
/// (0) is used as the expected version of a model that must not exist yet.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Version expected for a model that does not exist.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Version of a freshly created model.
    pub fn first() -> Self {
        Self(1)
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// A materialized, versioned query view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadModel {
    pub id: ReadModelId,
    pub model_type: String,
    pub version: Version,
    pub data: Document,
    #[serde(default)]
    pub metadata: Document,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReadModel {
    /// Looks up a dotted path (`"address.city"`) in the model data.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        lookup_path(&self.data, path.split('.'))
    }

    /// Resolves a query field against this model.
    ///
    /// Timestamps resolve to fixed-width RFC 3339 strings so that string
    /// ordering matches chronological ordering.
    pub fn field(&self, field: &FieldRef) -> Option<Value> {
        match field {
            FieldRef::Id => Some(Value::String(self.id.to_string())),
            FieldRef::ModelType => Some(Value::String(self.model_type.clone())),
            FieldRef::Version => Some(Value::from(self.version.as_i64())),
            FieldRef::CreatedAt => Some(Value::String(format_timestamp(self.created_at))),
            FieldRef::UpdatedAt => Some(Value::String(format_timestamp(self.updated_at))),
            FieldRef::Data(path) => lookup_path(&self.data, path.iter().map(String::as_str))
                .filter(|v| !v.is_null())
                .cloned(),
        }
    }
}

fn lookup_path<'a, 'p>(
    document: &'a Document,
    mut path: impl Iterator<Item = &'p str>,
) -> Option<&'a Value> {
    let mut current = document.get(path.next()?)?;
    for segment in path {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

pub(crate) fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// A field a query can filter or sort on.
///
/// `id`, `model_type`, `version`, `created_at` and `updated_at` name model
/// columns; any other name is a dotted path into the model data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldRef {
    Id,
    ModelType,
    Version,
    CreatedAt,
    UpdatedAt,
    Data(Vec<String>),
}

impl FieldRef {
    pub fn parse(field: &str) -> Self {
        match field {
            "id" => Self::Id,
            "model_type" => Self::ModelType,
            "version" => Self::Version,
            "created_at" => Self::CreatedAt,
            "updated_at" => Self::UpdatedAt,
            path => Self::Data(path.split('.').map(str::to_string).collect()),
        }
    }
}

/// New content for a read model, handed to `ReadModelStore::upsert`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModelUpdate {
    pub model_type: String,
    pub data: Document,
    pub metadata: Document,
}

impl ModelUpdate {
    pub fn new(model_type: impl Into<String>, data: Document) -> Self {
        Self {
            model_type: model_type.into(),
            data,
            metadata: Document::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Document) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn model(data: Value) -> ReadModel {
        let now = Utc::now();
        ReadModel {
            id: ReadModelId::from("X"),
            model_type: "customer".into(),
            version: Version::first(),
            data: data.as_object().cloned().unwrap(),
            metadata: Document::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn version_sequence() {
        assert_eq!(Version::initial().next(), Version::first());
        assert!(Version::first() < Version::new(2));
    }

    #[test]
    fn lookup_follows_dotted_paths() {
        let m = model(json!({"address": {"city": "Lyon"}, "name": "foo"}));
        assert_eq!(m.lookup("name"), Some(&json!("foo")));
        assert_eq!(m.lookup("address.city"), Some(&json!("Lyon")));
        assert_eq!(m.lookup("address.zip"), None);
        assert_eq!(m.lookup("name.first"), None);
    }

    #[test]
    fn field_resolves_columns_and_data() {
        let m = model(json!({"n": null, "age": 3}));
        assert_eq!(m.field(&FieldRef::parse("id")), Some(json!("X")));
        assert_eq!(m.field(&FieldRef::parse("version")), Some(json!(1)));
        assert_eq!(m.field(&FieldRef::parse("age")), Some(json!(3)));
        // JSON null counts as absent
        assert_eq!(m.field(&FieldRef::parse("n")), None);
    }
}
