//! Synthesized identities and their metadata names.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::scope::ClosureKind;

/// Field holding the enclosing instance in an environment.
pub const THIS_FIELD: &str = "<>4__this";

/// Field linking an environment to its parent environment.
pub const PARENT_FIELD: &str = "<>8__parent";

/// Edit generation. Generation 0 is the original build.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Generation(pub u32);

impl Generation {
    pub const BASELINE: Generation = Generation(0);

    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    pub const fn index(self) -> u32 {
        self.0
    }

    pub const fn is_baseline(self) -> bool {
        self.0 == 0
    }

    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// The suffix carried by entities first minted in this generation.
    pub(crate) fn suffix(self) -> Option<Generation> {
        (!self.is_baseline()).then_some(self)
    }
}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Generation({})", self.0)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Environment,
    Lambda,
    LocalFunction,
    QueryClause,
    /// Static field caching the delegate of a singleton-hosted closure.
    CacheField,
    /// The per-type container of closures that capture nothing.
    Singleton,
}

impl From<ClosureKind> for EntityKind {
    fn from(kind: ClosureKind) -> Self {
        match kind {
            ClosureKind::Lambda => EntityKind::Lambda,
            ClosureKind::LocalFunction => EntityKind::LocalFunction,
            ClosureKind::QueryClause => EntityKind::QueryClause,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Environment => "environment",
            EntityKind::Lambda => "lambda",
            EntityKind::LocalFunction => "local function",
            EntityKind::QueryClause => "query clause",
            EntityKind::CacheField => "cache field",
            EntityKind::Singleton => "singleton",
        };
        f.write_str(name)
    }
}

/// Name-bearing tuple of a synthesized type, method or field.
///
/// Once minted an identity never changes; a matched entity carries its
/// identity, generation suffix included, into every later generation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SynthesizedIdentity {
    pub kind: EntityKind,
    /// Source name of the enclosing member.
    pub base_name: String,
    /// Source name of a local function.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub member_ordinal: u32,
    pub local_ordinal: u32,
    pub generic_arity: u32,
    /// Generation of first introduction, absent for the original build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<Generation>,
}

impl SynthesizedIdentity {
    /// Name emitted into metadata.
    pub fn metadata_name(&self) -> String {
        let m = self.member_ordinal;
        let l = self.local_ordinal;
        let mut name = match self.kind {
            EntityKind::Environment => format!("<>c__Env{}_{}", m, l),
            EntityKind::Lambda => format!("<{}>b__{}_{}", self.base_name, m, l),
            EntityKind::LocalFunction => format!(
                "<{}>g__{}|{}_{}",
                self.base_name,
                self.label.as_deref().unwrap_or_default(),
                m,
                l
            ),
            EntityKind::QueryClause => format!("<{}>q__{}_{}", self.base_name, m, l),
            EntityKind::CacheField => format!("<>9__{}_{}", m, l),
            EntityKind::Singleton => "<>c".to_string(),
        };
        if self.generic_arity > 0 {
            name.push_str(&format!("`{}", self.generic_arity));
        }
        if let Some(generation) = self.generation {
            name.push_str(&format!("#{}", generation));
        }
        name
    }

    /// Whether this identity was introduced by an edit.
    pub fn is_edit_introduced(&self) -> bool {
        self.generation.is_some()
    }
}

impl fmt::Display for SynthesizedIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.metadata_name())
    }
}
