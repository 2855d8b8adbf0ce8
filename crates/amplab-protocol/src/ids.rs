//! Typed ID wrappers.
//!
//! IDs are opaque String wrappers (serde-transparent). Generated ids use UUID
//! v4; ids that arrive on the wire are kept verbatim.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from any string value.
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Create a new ID using UUID v4 (random).
            pub fn new_uuid() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            /// View as string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

typed_id!(
    /// Unique identifier for an event.
    EventId
);
typed_id!(
    /// Identifier shared by every event of one generated run.
    CorrelationId
);
typed_id!(
    /// Queue-assigned identifier of a single message.
    MessageId
);

impl CorrelationId {
    /// Time-derived run id, `run-{epoch_seconds}`.
    pub fn for_run_at(epoch_seconds: i64) -> Self {
        Self(format!("run-{epoch_seconds}"))
    }
}
