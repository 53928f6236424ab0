//! Failure taxonomy shared by the store, broker and processing layers.
//!
//! Every collaborator error is reduced to a [`FailureKind`] by one pure
//! classification step, which decides whether redelivery can help.

use std::fmt;

pub type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Whether retrying the same input could succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Network, timeout, throttling or server-side conditions.
    Temporary,
    /// Malformed input, client errors and anything unrecognised.
    Permanent,
}

impl FailureKind {
    pub fn is_temporary(self) -> bool {
        self == FailureKind::Temporary
    }

    pub fn is_permanent(self) -> bool {
        self == FailureKind::Permanent
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Temporary => f.write_str("temporary"),
            FailureKind::Permanent => f.write_str("permanent"),
        }
    }
}

/// Errors that know whether they are worth retrying.
pub trait Classify {
    fn failure_kind(&self) -> FailureKind;

    fn is_temporary(&self) -> bool {
        self.failure_kind().is_temporary()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_predicates() {
        assert!(FailureKind::Temporary.is_temporary());
        assert!(!FailureKind::Temporary.is_permanent());
        assert!(FailureKind::Permanent.is_permanent());
        assert_eq!(FailureKind::Permanent.to_string(), "permanent");
    }
}
