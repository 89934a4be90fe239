//! Built-in projections.

pub mod closure;
pub mod merge_fields;
pub mod spec;

pub use closure::FnProjection;
pub use merge_fields::{DeleteModel, MergeFields};
pub use spec::{ViewKind, ViewSpec};
