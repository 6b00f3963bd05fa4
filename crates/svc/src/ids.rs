//! Opaque 64-bit identifiers.
//!
//! Every id type in this crate is an unsigned 64-bit integer that stringifies
//! as hex, the way the event, error and metric ids in the original service
//! framework this crate is modeled on did. `0` is reserved and rejected by
//! [`TryFrom`] for every id type - callers that need a checked constructor
//! should go through that rather than the bare tuple constructor.

use std::fmt;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Builds an id without checking for zero. Prefer [`TryFrom`] at
            /// boundaries where a caller-supplied value needs validating.
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }

            #[must_use]
            pub const fn is_zero(self) -> bool {
                self.0 == 0
            }
        }

        impl TryFrom<u64> for $name {
            type Error = crate::error::Error;

            fn try_from(value: u64) -> Result<Self, Self::Error> {
                if value == 0 {
                    Err(crate::error::Error::IdZero(stringify!($name)))
                } else {
                    Ok(Self(value))
                }
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:x}", self.0)
            }
        }
    };
}

id_type!(
    /// Identifies a registered service, stable for the life of the process.
    ServiceId
);
id_type!(
    /// Identifies a metric within the metrics facade, scoped per service id.
    MetricId
);
id_type!(
    /// Identifies a structured error/log event.
    ErrorId
);
id_type!(
    /// Identifies a pipeline stage command, used as the `command` label on
    /// per-stage metrics and to distinguish failing stages on a work item.
    CommandId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_as_hex() {
        assert_eq!(ServiceId::new(0xdead_beef).to_string(), "deadbeef");
    }

    #[test]
    fn rejects_zero() {
        assert!(ServiceId::try_from(0).is_err());
        assert!(ServiceId::try_from(1).is_ok());
    }
}
