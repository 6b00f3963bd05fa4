//! Type-level service identity.
//!
//! The original service framework looked services up by the reflected
//! identity of the Go interface they were registered under. Rust has no
//! runtime reflection, so [`InterfaceTag`] substitutes `std::any::TypeId`
//! plus a compile-time name constant: every service implementation names
//! the marker type it is registered as via [`ServiceInterface`], and the
//! container keys its registry on the resulting tag.

use std::any::TypeId;
use std::fmt;

/// Implemented by the marker type a service is registered under, not by the
/// service itself - a service that satisfies several roles can implement
/// this once per marker and be looked up under any of them.
///
/// ```ignore
/// struct Clock;
/// impl ServiceInterface for Clock {
///     const NAME: &'static str = "Clock";
/// }
/// ```
pub trait ServiceInterface: 'static {
    /// Human-readable name, used in [`ServiceKey`] and in log output. Does
    /// not need to be globally unique; [`InterfaceTag`] equality is what the
    /// container actually keys on.
    const NAME: &'static str;
}

/// The opaque, `Copy`, hashable identity of a [`ServiceInterface`] marker
/// type. Two tags compare equal iff they were built from the same Rust
/// type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterfaceTag {
    type_id: TypeId,
    name: &'static str,
}

impl InterfaceTag {
    #[must_use]
    pub fn of<I: ServiceInterface>() -> Self {
        Self {
            type_id: TypeId::of::<I>(),
            name: I::NAME,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn to_service_key(self) -> ServiceKey {
        ServiceKey {
            package_path: module_path_hint(self.name),
            type_name: self.name,
        }
    }
}

impl fmt::Display for InterfaceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A human-readable, serializable stand-in for the package path / type name
/// pair the original framework derived from Go reflection. Rust has no
/// portable equivalent of a package path at runtime, so `package_path` is a
/// best-effort hint (the crate this tag's name was registered from, when
/// the caller bothers to qualify it) rather than a guaranteed unique key -
/// [`InterfaceTag`] remains the only thing the container actually compares.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ServiceKey {
    pub package_path: String,
    pub type_name: &'static str,
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.package_path.is_empty() {
            write!(f, "{}", self.type_name)
        } else {
            write!(f, "{}::{}", self.package_path, self.type_name)
        }
    }
}

/// Splits `"crate_name::Type"` style names at the last `::`, or returns an
/// empty package path for unqualified names. Purely cosmetic.
fn module_path_hint(name: &'static str) -> String {
    match name.rsplit_once("::") {
        Some((path, _)) => path.to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Alpha;
    impl ServiceInterface for Alpha {
        const NAME: &'static str = "Alpha";
    }

    struct Beta;
    impl ServiceInterface for Beta {
        const NAME: &'static str = "Beta";
    }

    #[test]
    fn tags_of_distinct_types_differ() {
        assert_ne!(InterfaceTag::of::<Alpha>(), InterfaceTag::of::<Beta>());
    }

    #[test]
    fn tags_of_same_type_are_equal_and_stable() {
        assert_eq!(InterfaceTag::of::<Alpha>(), InterfaceTag::of::<Alpha>());
    }

    #[test]
    fn service_key_display_without_package_path() {
        let key = InterfaceTag::of::<Alpha>().to_service_key();
        assert_eq!(key.to_string(), "Alpha");
    }
}
