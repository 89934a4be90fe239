//! Field-merging and deleting projections.

use event_store::EventEnvelope;
use read_model::{Document, ReadModel};

use crate::projection::{Projection, ProjectionOutcome};
use crate::{ProjectionError, Result};

/// Merges the top-level fields of an object payload into the model data.
///
/// Fields absent from the payload keep their current value. A payload that
/// is not an object, or lacks a required field, is rejected.
#[derive(Debug, Clone, Default)]
pub struct MergeFields {
    required: Vec<String>,
}

impl MergeFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required<I, T>(fields: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            required: fields.into_iter().map(Into::into).collect(),
        }
    }
}

impl Projection for MergeFields {
    fn apply(
        &self,
        current: Option<&ReadModel>,
        event: &EventEnvelope,
    ) -> Result<ProjectionOutcome> {
        let payload = event.payload.as_object().ok_or_else(|| {
            ProjectionError::Rejected(format!(
                "{} payload is not a JSON object",
                event.event_type
            ))
        })?;

        if let Some(missing) = self
            .required
            .iter()
            .find(|field| payload.get(field.as_str()).is_none_or(|v| v.is_null()))
        {
            return Err(ProjectionError::Rejected(format!(
                "{} payload is missing required field `{missing}`",
                event.event_type
            )));
        }

        let mut data = current.map(|m| m.data.clone()).unwrap_or_else(Document::new);
        data.extend(payload.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(ProjectionOutcome::Upsert(data))
    }
}

/// Deletes the target model.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteModel;

impl Projection for DeleteModel {
    fn apply(&self, _: Option<&ReadModel>, _: &EventEnvelope) -> Result<ProjectionOutcome> {
        Ok(ProjectionOutcome::Delete)
    }
}
