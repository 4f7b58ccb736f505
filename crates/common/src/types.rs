use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a provisioning queue item.
///
/// Wraps a UUID so queue ids can't be mixed up with other UUID-based
/// identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueItemId(Uuid);

impl QueueItemId {
    /// Creates a new random queue item ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a queue item ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for QueueItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for QueueItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for QueueItemId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<QueueItemId> for Uuid {
    fn from(id: QueueItemId) -> Self {
        id.0
    }
}

/// Declares a string-backed identifier assigned by the payment processor.
macro_rules! processor_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates the identifier from any string-like value.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
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

processor_id!(
    /// The paying customer, as known to the payment processor.
    PayerId
);

processor_id!(
    /// A recurring billing arrangement (subscription) at the processor.
    ArrangementId
);

processor_id!(
    /// A single billable item attached to an arrangement.
    BillingItemId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_item_id_new_creates_unique_ids() {
        let id1 = QueueItemId::new();
        let id2 = QueueItemId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn queue_item_id_from_uuid_preserves_value() {
        let uuid = Uuid::new_v4();
        let id = QueueItemId::from_uuid(uuid);
        assert_eq!(id.as_uuid(), uuid);
    }

    #[test]
    fn processor_ids_serialize_as_plain_strings() {
        let payer = PayerId::new("cus_123");
        let json = serde_json::to_string(&payer).unwrap();
        assert_eq!(json, "\"cus_123\"");

        let back: PayerId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payer);
    }

    #[test]
    fn processor_ids_display_raw_value() {
        assert_eq!(ArrangementId::from("sub_9").to_string(), "sub_9");
        assert_eq!(BillingItemId::new("si_1").as_str(), "si_1");
    }
}
