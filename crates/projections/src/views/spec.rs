//! Declarative projection definitions, loadable from JSON.

use std::sync::Arc;

use common::ProjectionId;
use serde::{Deserialize, Serialize};

use super::{DeleteModel, MergeFields};
use crate::Result;
use crate::projection::{Projection, ProjectionConfig, ProjectionDefinition};

/// The built-in projection a [`ViewSpec`] instantiates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ViewKind {
    MergeFields {
        #[serde(default)]
        required: Vec<String>,
    },
    DeleteModel,
}

/// A projection described as data.
///
/// ```json
/// {
///   "id": "customer-renamed",
///   "source_event_type": "Renamed",
///   "target_model_type": "customer",
///   "kind": "merge_fields",
///   "required": ["name"]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewSpec {
    pub id: ProjectionId,
    #[serde(default)]
    pub name: Option<String>,
    pub source_event_type: String,
    pub target_model_type: String,
    #[serde(flatten)]
    pub kind: ViewKind,
    #[serde(default)]
    pub config: ProjectionConfig,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl ViewSpec {
    /// Parses a JSON array of specs.
    pub fn parse_list(json: &str) -> Result<Vec<ViewSpec>> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn into_parts(self) -> (ProjectionDefinition, Arc<dyn Projection>) {
        let mut definition =
            ProjectionDefinition::new(self.id, self.source_event_type, self.target_model_type)
                .with_config(self.config);
        if let Some(name) = self.name {
            definition = definition.named(name);
        }
        if !self.active {
            definition = definition.inactive();
        }

        let projection: Arc<dyn Projection> = match self.kind {
            ViewKind::MergeFields { required } => Arc::new(MergeFields::required(required)),
            ViewKind::DeleteModel => Arc::new(DeleteModel),
        };
        (definition, projection)
    }
}
