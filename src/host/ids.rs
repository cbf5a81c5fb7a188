//! Process-wide interned identifiers.
//!
//! Method names, local-variable names and primitive names are interned once
//! into a global store so that identity comparison is a single integer
//! compare. The store is append-only and shared by every [`crate::jit::Jit`]
//! engine in the process.

use std::fmt;
use std::sync::LazyLock;

use lasso::{Spur, ThreadedRodeo};

static ID_STORE: LazyLock<ThreadedRodeo> = LazyLock::new(ThreadedRodeo::default);

/// An interned identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id(Spur);

impl Id {
    /// Intern `name`, returning its id. Idempotent.
    pub fn intern(name: &str) -> Id {
        Id(ID_STORE.get_or_intern(name))
    }

    /// Resolve the id back to its string form.
    pub fn name(self) -> &'static str {
        ID_STORE.resolve(&self.0)
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// The hidden receiver variable.
pub fn self_name() -> Id {
    Id::intern("<self>")
}

/// The hidden method-resolution environment variable.
pub fn env_name() -> Id {
    Id::intern("<env>")
}

/// Binary operators the analyzer widens undetermined lookups with.
pub fn op_plus() -> Id {
    Id::intern("+")
}

pub fn op_minus() -> Id {
    Id::intern("-")
}

pub fn op_star() -> Id {
    Id::intern("*")
}

pub fn op_slash() -> Id {
    Id::intern("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_is_idempotent() {
        let a = Id::intern("foo");
        let b = Id::intern("foo");
        assert_eq!(a, b);
        assert_eq!(a.name(), "foo");
    }

    #[test]
    fn test_distinct_names_distinct_ids() {
        assert_ne!(Id::intern("foo"), Id::intern("bar"));
    }

    #[test]
    fn test_predefined_names() {
        assert_eq!(self_name().name(), "<self>");
        assert_eq!(env_name().name(), "<env>");
    }
}
