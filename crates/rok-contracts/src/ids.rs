//! Opaque identifiers for run document entities.
//!
//! Every identifier is a plain string on the wire. Generated ids carry a
//! short entity prefix followed by twelve hex characters from a UUID v4,
//! which keeps documents readable without promising any structure to
//! consumers. Callers may also supply their own ids (e.g. `"S1"`).

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Generate a fresh, random identifier.
            pub fn new() -> Self {
                let hex = uuid::Uuid::new_v4().simple().to_string();
                Self(format!(concat!($prefix, "_{}"), &hex[..12]))
            }

            /// Wrap an existing identifier string.
            pub fn from_string(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

define_id!(
    /// Identifies one reasoning request.
    TaskId, "task"
);
define_id!(
    /// Identifies one execution of a task through the kernel.
    RunId, "run"
);
define_id!(
    /// Identifies a step; unique within a run.
    StepId, "step"
);
define_id!(EvidenceId, "ev");
define_id!(ExecutionId, "exec");
define_id!(RevisionId, "rev");
define_id!(ContradictionId, "ctr");
define_id!(MemoryId, "mem");
define_id!(
    /// Identifies one audit log event.
    EventId, "evt"
);
