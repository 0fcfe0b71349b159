//! Newtype wrappers for identifiers to ensure type safety.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create an identifier from a string.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a new random identifier.
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Get the inner string reference.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner string.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_id!(
    /// Identity of a task configuration, assigned once on creation.
    ConfigurationId
);

string_id!(
    /// Identity of one instantiated computation run.
    ///
    /// Distinct from [`ConfigurationId`]: a configuration gets exactly one
    /// of these the first time its run identity is requested.
    ComputationTaskId
);

string_id!(
    /// Identity of a registered remote service (a worker host).
    ServiceId
);

string_id!(
    /// Identity of an execution controller owning configurations.
    ControllerId
);

string_id!(
    /// Identity of a data-storage handle attached to a run.
    DataStorageId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        let id1 = ComputationTaskId::generate();
        let id2 = ComputationTaskId::generate();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_id_display() {
        let id = ServiceId::new("host-1");
        assert_eq!(format!("{}", id), "host-1");
    }

    #[test]
    fn test_id_serializes_as_plain_string() {
        let id = ConfigurationId::new("cfg-7");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"cfg-7\"");
    }
}
