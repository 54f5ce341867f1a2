//! Method body model.
//!
//! Each generation, the front end hands the engine one [`MethodBody`] per
//! edited method: an arena of lexical scopes, the variables declared in them,
//! and the closures declared in them together with the variables each closure
//! body references. Trees are built fresh every generation and are immutable
//! once [`MethodBodyBuilder::finish`] has validated them.

mod builder;
mod tree;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use builder::MethodBodyBuilder;
pub use tree::{
    Access, ClosureDecl, ClosureKind, MethodBody, ScopeNode, ScopeOwner, VariableDecl,
    VariableKind, VariableRef,
};

macro_rules! arena_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u32);

        impl $name {
            /// Create an id from an arena index.
            pub const fn new(index: u32) -> Self {
                Self(index)
            }

            /// The arena index of this id.
            pub const fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "({})"), self.0)
            }
        }
    };
}

arena_id!(
    /// Index of a scope within one [`MethodBody`].
    ScopeId,
    "ScopeId"
);
arena_id!(
    /// Index of a variable within one [`MethodBody`].
    VariableId,
    "VariableId"
);
arena_id!(
    /// Index of a closure within one [`MethodBody`].
    ClosureId,
    "ClosureId"
);

/// Identifies a member (method, constructor, accessor) across generations.
///
/// Two overloads of the same name differ in `signature`, so a deleted and
/// re-added overload is a different member from its namesakes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberKey {
    /// Fully qualified name of the containing type.
    pub type_name: String,
    /// Source name of the member.
    pub name: String,
    /// Rendered parameter list, e.g. `(int, string)`.
    pub signature: String,
    /// Number of generic parameters of the member itself.
    pub generic_arity: u32,
}

impl MemberKey {
    pub fn new(
        type_name: impl Into<String>,
        name: impl Into<String>,
        signature: impl Into<String>,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            name: name.into(),
            signature: signature.into(),
            generic_arity: 0,
        }
    }

    /// Set the member's generic arity.
    pub fn with_generic_arity(mut self, arity: u32) -> Self {
        self.generic_arity = arity;
        self
    }

    /// Key of this member within its type, used to index snapshots.
    pub fn member_key(&self) -> String {
        if self.generic_arity == 0 {
            format!("{}{}", self.name, self.signature)
        } else {
            format!("{}`{}{}", self.name, self.generic_arity, self.signature)
        }
    }
}

impl fmt::Display for MemberKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.type_name, self.member_key())
    }
}
