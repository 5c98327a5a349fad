//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects are **immutable** and **compared by value**: two instances
/// carrying the same attributes are the same value. Constructors validate, so
/// holding a value object means holding a valid value.
///
/// ```ignore
/// #[derive(Debug, Clone, PartialEq, Eq)]
/// struct Email(String);
///
/// impl ValueObject for Email {}
/// ```
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
