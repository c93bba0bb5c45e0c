use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Declares a UUID-backed identifier newtype.
///
/// Each identifier is its own type so an order id can never be passed where
/// a courier id is expected.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Creates an identifier from an existing UUID.
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

uuid_id!(
    /// Identifier of an order, owned by the order service.
    OrderId
);
uuid_id!(
    /// Identifier of the customer who placed an order.
    UserId
);
uuid_id!(
    /// Identifier of the store fulfilling an order.
    StoreId
);
uuid_id!(
    /// Identifier of a courier, owned by the courier service.
    CourierId
);

/// Product identifier (SKU), owned by the inventory service.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(String);

impl ProductId {
    /// Creates a new product ID from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the product ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProductId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ProductId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ProductId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for ProductId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Opaque version stamp guarding a mutable row.
///
/// Every successful write moves the token forward. A write conditioned on a
/// token that no longer matches the stored one must be rejected, never
/// applied over the newer state.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ConcurrencyToken(i64);

impl ConcurrencyToken {
    /// Creates a token from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the token of a freshly inserted row.
    pub fn initial() -> Self {
        Self(1)
    }

    /// Returns the token the row carries after the next write.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw token value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for ConcurrencyToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ConcurrencyToken {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        assert_ne!(OrderId::new(), OrderId::new());
        assert_ne!(CourierId::new(), CourierId::new());
    }

    #[test]
    fn id_from_uuid_preserves_value() {
        let uuid = Uuid::new_v4();
        let id = StoreId::from_uuid(uuid);
        assert_eq!(id.as_uuid(), uuid);
        assert_eq!(Uuid::from(id), uuid);
    }

    #[test]
    fn ids_serialize_transparently() {
        let uuid = Uuid::new_v4();
        let json = serde_json::to_string(&OrderId::from_uuid(uuid)).unwrap();
        assert_eq!(json, format!("\"{uuid}\""));

        let product = serde_json::to_string(&ProductId::new("P1")).unwrap();
        assert_eq!(product, "\"P1\"");
    }

    #[test]
    fn token_advances() {
        let token = ConcurrencyToken::initial();
        assert_eq!(token.as_i64(), 1);
        assert_eq!(token.next().as_i64(), 2);
        assert!(token.next() > token);
    }
}
