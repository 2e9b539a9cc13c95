//! Identifier spaces
//!
//! Five disjoint numeric spaces, all 32-bit signed with a reserved invalid
//! sentinel. Global federate and handle ids are assigned by the root broker;
//! route ids are local to each broker's routing table; local indices are
//! assigned densely by each federate's manager in registration order.

use std::fmt;

use serde::{Deserialize, Serialize};

const INVALID: i32 = -1;

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(i32);

        impl $name {
            /// The reserved invalid sentinel.
            pub const INVALID: $name = $name(INVALID);

            pub const fn new(raw: i32) -> Self {
                $name(raw)
            }

            pub const fn as_i32(self) -> i32 {
                self.0
            }

            pub fn is_valid(self) -> bool {
                self.0 != INVALID
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type! {
    /// Global identifier of a federate, assigned by the root broker.
    FederateId
}

id_type! {
    /// Global identifier of a registered handle (publication, subscription,
    /// endpoint, or filter).
    HandleId
}

id_type! {
    /// Global identifier of a broker node.
    BrokerId
}

id_type! {
    /// Identifier of a route in a broker's routing table.
    RouteId
}

id_type! {
    /// Dense per-federate index of a locally registered interface.
    LocalId
}

impl RouteId {
    /// Route 0 always leads toward the parent broker.
    pub const PARENT: RouteId = RouteId(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_sentinel() {
        assert!(!FederateId::INVALID.is_valid());
        assert!(FederateId::new(0).is_valid());
        assert_eq!(HandleId::INVALID.as_i32(), -1);
    }

    #[test]
    fn test_parent_route() {
        assert_eq!(RouteId::PARENT.as_i32(), 0);
        assert!(RouteId::PARENT.is_valid());
    }
}
