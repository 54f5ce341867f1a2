//! Environment representation policy.
//!
//! An environment is a heap-allocated [`Representation::Reference`] type by
//! default. When every closure that uses it is non-escaping it can be a
//! [`Representation::Value`] type living in the creating frame, and closures
//! needing it receive it as a by-reference parameter.
//!
//! Escape states form a lattice:
//!
//! ```text
//! Local < Escaping
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::scope::{ClosureId, MethodBody};

/// Whether a closure outlives the frame that creates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum EscapeState {
    /// Only ever called directly from its frame.
    #[default]
    Local,
    /// Converted to a delegate, stored, or otherwise leaves the frame.
    Escaping,
}

impl EscapeState {
    /// Lattice join (least upper bound).
    pub fn join(self, other: Self) -> Self {
        std::cmp::max(self, other)
    }

    pub fn of(body: &MethodBody, closure: ClosureId) -> Self {
        if body.escapes(closure) {
            EscapeState::Escaping
        } else {
            EscapeState::Local
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Representation {
    Reference,
    Value,
}

impl fmt::Display for Representation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Representation::Reference => f.write_str("reference"),
            Representation::Value => f.write_str("value"),
        }
    }
}

/// Pick the representation of an environment from the escape states of the
/// closures that use it.
pub fn choose(users: impl IntoIterator<Item = EscapeState>, allow_value: bool) -> Representation {
    let joined = users
        .into_iter()
        .fold(EscapeState::Local, EscapeState::join);
    if allow_value && joined == EscapeState::Local {
        Representation::Value
    } else {
        Representation::Reference
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join() {
        assert_eq!(EscapeState::Local.join(EscapeState::Local), EscapeState::Local);
        assert_eq!(EscapeState::Local.join(EscapeState::Escaping), EscapeState::Escaping);
        assert_eq!(EscapeState::Escaping.join(EscapeState::Local), EscapeState::Escaping);
    }

    #[test]
    fn test_choose() {
        assert_eq!(choose([EscapeState::Local], true), Representation::Value);
        assert_eq!(choose([EscapeState::Local], false), Representation::Reference);
        assert_eq!(
            choose([EscapeState::Local, EscapeState::Escaping], true),
            Representation::Reference
        );
    }
}
