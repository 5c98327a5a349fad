//! UUIDv7 identifiers.

/// Declares a transparent, time-ordered UUID newtype with `new`,
/// `from_uuid`, `as_uuid`, `Display`, `FromStr` and `Uuid` conversions.
///
/// The calling crate must depend on `serde`.
#[macro_export]
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug,
            Copy,
            Clone,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            $crate::__private::Serialize,
            $crate::__private::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name($crate::__private::Uuid);

        impl $name {
            /// A fresh UUIDv7. Ids generated later sort after earlier ones.
            pub fn new() -> Self {
                Self($crate::__private::Uuid::now_v7())
            }

            pub fn from_uuid(uuid: $crate::__private::Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &$crate::__private::Uuid {
                &self.0
            }
        }

        impl ::core::default::Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl ::core::fmt::Display for $name {
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                ::core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl ::core::convert::From<$crate::__private::Uuid> for $name {
            fn from(uuid: $crate::__private::Uuid) -> Self {
                Self(uuid)
            }
        }

        impl ::core::convert::From<$name> for $crate::__private::Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl ::core::str::FromStr for $name {
            type Err = $crate::DomainError;

            fn from_str(raw: &str) -> ::core::result::Result<Self, Self::Err> {
                <$crate::__private::Uuid as ::core::str::FromStr>::from_str(raw)
                    .map(Self)
                    .map_err(|e| $crate::DomainError::invalid_id(format!("{}: {e}", stringify!($name))))
            }
        }
    };
}

uuid_id!(
    /// Identifier of an aggregate root.
    AggregateId
);

uuid_id!(
    /// Identifier of a single domain event occurrence.
    EventId
);
