//! Syntax markers and cross-generation syntax correspondence.
//!
//! Source offsets shift on every edit, so nodes are identified by a
//! [`SyntaxMarker`] assigned by the tree-differencing collaborator. A
//! [`SyntaxMap`] relates the markers of the previous generation's tree to the
//! markers of the current one. A node with no entry is a wholesale-new region.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::diagnostics::ModelError;

/// Stable structural identifier of a syntax node within one generation.
///
/// Markers are unique per node category (scope, variable, closure) within a
/// method body. A closure and the scope of its body may share a marker.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyntaxMarker {
    /// Collaborator-assigned index.
    pub index: u32,
}

impl SyntaxMarker {
    /// Create a marker with the given index.
    pub const fn new(index: u32) -> Self {
        Self { index }
    }

    /// The index of this marker.
    pub const fn index(self) -> u32 {
        self.index
    }
}

impl fmt::Debug for SyntaxMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SyntaxMarker({})", self.index)
    }
}

impl fmt::Display for SyntaxMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.index)
    }
}

/// Category of a syntax node.
///
/// Markers are unique within a category only, so every correspondence is
/// keyed by category as well as marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeKind {
    Scope,
    Variable,
    Closure,
}

impl NodeKind {
    pub const ALL: [NodeKind; 3] = [NodeKind::Scope, NodeKind::Variable, NodeKind::Closure];

    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Scope => "scope",
            NodeKind::Variable => "variable",
            NodeKind::Closure => "closure",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Correspondence between the previous and the current syntax tree of a method.
///
/// The map is injective in both directions within each [`NodeKind`];
/// [`SyntaxMap::map`] rejects a marker that is already mapped on either side.
/// A closure's body scope carries the closure's marker, so mapping a closure
/// also maps its body scope.
#[derive(Debug, Clone, Default)]
pub struct SyntaxMap {
    /// (kind, old marker) -> new marker.
    forward: HashMap<(NodeKind, SyntaxMarker), SyntaxMarker>,
    /// (kind, new marker) -> old marker.
    backward: HashMap<(NodeKind, SyntaxMarker), SyntaxMarker>,
}

impl SyntaxMap {
    /// Create an empty correspondence (every node is new).
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a correspondence where every given marker maps to itself in
    /// every category.
    ///
    /// Useful when the edit only touched expression bodies and the
    /// collaborator kept the markers stable.
    pub fn identity(markers: impl IntoIterator<Item = SyntaxMarker>) -> Self {
        let mut map = Self::new();
        for marker in markers {
            for kind in NodeKind::ALL {
                map.forward.insert((kind, marker), marker);
                map.backward.insert((kind, marker), marker);
            }
        }
        map
    }

    /// Build a correspondence from `(kind, old, new)` triples.
    pub fn from_pairs(
        pairs: impl IntoIterator<Item = (NodeKind, SyntaxMarker, SyntaxMarker)>,
    ) -> Result<Self, ModelError> {
        let mut map = Self::new();
        for (kind, old, new) in pairs {
            map.map(kind, old, new)?;
        }
        Ok(map)
    }

    /// Record that the `kind` node `old` in the previous tree corresponds to `new`.
    pub fn map(
        &mut self,
        kind: NodeKind,
        old: SyntaxMarker,
        new: SyntaxMarker,
    ) -> Result<(), ModelError> {
        self.insert(kind, old, new)?;
        if kind == NodeKind::Closure {
            self.insert(NodeKind::Scope, old, new)?;
        }
        Ok(())
    }

    fn insert(
        &mut self,
        kind: NodeKind,
        old: SyntaxMarker,
        new: SyntaxMarker,
    ) -> Result<(), ModelError> {
        if let Some(&existing) = self.forward.get(&(kind, old)) {
            if existing != new {
                return Err(ModelError::AmbiguousCorrespondence { kind, marker: old });
            }
            return Ok(());
        }
        if self.backward.contains_key(&(kind, new)) {
            return Err(ModelError::AmbiguousCorrespondence { kind, marker: new });
        }
        self.forward.insert((kind, old), new);
        self.backward.insert((kind, new), old);
        Ok(())
    }

    /// The new marker corresponding to an old one.
    pub fn forward(&self, kind: NodeKind, old: SyntaxMarker) -> Option<SyntaxMarker> {
        self.forward.get(&(kind, old)).copied()
    }

    /// The old marker corresponding to a new one.
    pub fn backward(&self, kind: NodeKind, new: SyntaxMarker) -> Option<SyntaxMarker> {
        self.backward.get(&(kind, new)).copied()
    }

    /// Number of corresponding node pairs, all categories together.
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    /// Whether no node corresponds.
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}
