use std::borrow::Borrow;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Declares a string-backed identifier newtype.
///
/// Identifiers are opaque strings: callers may use natural keys ("X",
/// "customer-42") or generate random UUID-based ids with `generate()`.
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates an identifier from any string-like value.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Creates a new random identifier.
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consumes the identifier, returning the inner string.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id! {
    /// Identifier of an aggregate instance: the consistency boundary whose
    /// events share one strictly increasing sequence.
    AggregateId
}

string_id! {
    /// Identifier of a materialized read model.
    ReadModelId
}

string_id! {
    /// Identifier of a registered projection.
    ProjectionId
}

impl From<AggregateId> for ReadModelId {
    fn from(id: AggregateId) -> Self {
        Self(id.0)
    }
}

impl From<&AggregateId> for ReadModelId {
    fn from(id: &AggregateId) -> Self {
        Self(id.0.clone())
    }
}
