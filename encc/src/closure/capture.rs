//! # Variable Capture Analysis
//!
//! Determines which variables each closure captures and how.
//!
//! ## Rules
//!
//! - A variable is captured iff some closure strictly nested below its
//!   declaring scope references it across a closure boundary. Uses inside the
//!   frame that declares the variable are not captures.
//! - Captures are transitive: a closure whose nested closure captures an outer
//!   variable captures it too, since it has to hand it down.
//! - `this` is a captured variable of the root scope whenever a closure
//!   references it.
//! - A captured variable is [`CaptureMode::ByReference`] if it is reassigned
//!   anywhere or written by any closure, and [`CaptureMode::ByValue`]
//!   otherwise.
//!
//! ## Algorithm
//!
//! One bottom-up pass. Each scope returns the set of variables referenced
//! from closures below it that are declared further out; each closure body
//! contributes its own references, and a scope removes the variables it
//! declares before handing the set to its parent.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::diagnostics::ModelError;
use crate::scope::{Access, ClosureId, MethodBody, ScopeId, VariableId, VariableKind};
use crate::syntax::SyntaxMarker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CaptureMode {
    /// Never reassigned: a copy observes the same value.
    ByValue,
    /// Reassigned or written by a closure: all users share one storage slot.
    ByReference,
}

/// A variable captured by at least one closure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedVariable {
    pub variable: VariableId,
    pub marker: SyntaxMarker,
    pub scope: ScopeId,
    pub name: String,
    pub kind: VariableKind,
    pub mode: CaptureMode,
}

/// What one closure captures.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClosureCaptures {
    /// Captured variables other than `this`, in declaration order.
    pub variables: Vec<VariableId>,
    pub captures_this: bool,
}

impl ClosureCaptures {
    pub fn is_empty(&self) -> bool {
        self.variables.is_empty() && !self.captures_this
    }
}

/// Capture analysis results for one method body.
#[derive(Debug, Clone, Default)]
pub struct CaptureAnalysis {
    variables: BTreeMap<VariableId, CapturedVariable>,
    by_scope: BTreeMap<ScopeId, Vec<VariableId>>,
    closures: Vec<ClosureCaptures>,
}

impl CaptureAnalysis {
    /// Details of a captured variable, `None` if it is not captured.
    pub fn variable(&self, id: VariableId) -> Option<&CapturedVariable> {
        self.variables.get(&id)
    }

    pub fn is_captured(&self, id: VariableId) -> bool {
        self.variables.contains_key(&id)
    }

    /// Captured non-`this` variables declared directly in `scope`.
    pub fn scope_variables(&self, scope: ScopeId) -> &[VariableId] {
        self.by_scope.get(&scope).map_or(&[], Vec::as_slice)
    }

    pub fn closure(&self, id: ClosureId) -> &ClosureCaptures {
        &self.closures[id.index()]
    }

    /// All captured variables in id order.
    pub fn captured(&self) -> impl Iterator<Item = &CapturedVariable> {
        self.variables.values()
    }

    /// Whether any closure captures `this`.
    pub fn captures_this(&self) -> bool {
        self.closures.iter().any(|c| c.captures_this)
    }
}

/// Bottom-up capture analyzer.
pub struct CaptureAnalyzer<'a> {
    body: &'a MethodBody,
    free: Vec<BTreeSet<VariableId>>,
    written: BTreeSet<VariableId>,
}

impl<'a> CaptureAnalyzer<'a> {
    pub fn new(body: &'a MethodBody) -> Self {
        Self {
            body,
            free: vec![BTreeSet::new(); body.closures().len()],
            written: BTreeSet::new(),
        }
    }

    pub fn analyze(mut self) -> Result<CaptureAnalysis, ModelError> {
        let escaping = self.visit_scope(self.body.root())?;
        debug_assert!(escaping.is_empty(), "root scope declares every visible variable");

        let mut captured = BTreeSet::new();
        for free in &self.free {
            captured.extend(free.iter().copied());
        }

        let mut analysis = CaptureAnalysis::default();
        for &id in &captured {
            let decl = self.body.variable(id);
            let mode = if decl.reassigned || self.written.contains(&id) {
                CaptureMode::ByReference
            } else {
                CaptureMode::ByValue
            };
            analysis.variables.insert(
                id,
                CapturedVariable {
                    variable: id,
                    marker: decl.marker,
                    scope: decl.scope,
                    name: decl.name.clone(),
                    kind: decl.kind,
                    mode,
                },
            );
        }

        for node in self.body.scopes() {
            let resident: Vec<_> = node
                .variables
                .iter()
                .copied()
                .filter(|v| captured.contains(v) && self.body.variable(*v).kind != VariableKind::This)
                .collect();
            if !resident.is_empty() {
                analysis.by_scope.insert(node.id, resident);
            }
        }

        let this = self.body.this_variable();
        analysis.closures = self
            .free
            .iter()
            .map(|free| ClosureCaptures {
                variables: free.iter().copied().filter(|v| Some(*v) != this).collect(),
                captures_this: this.is_some_and(|t| free.contains(&t)),
            })
            .collect();

        Ok(analysis)
    }

    /// Returns the variables referenced from closures below `scope` that are
    /// declared outside it.
    fn visit_scope(&mut self, scope: ScopeId) -> Result<BTreeSet<VariableId>, ModelError> {
        let body = self.body;
        let node = body.scope(scope);
        let mut pending = BTreeSet::new();

        for &child in &node.children {
            pending.extend(self.visit_scope(child)?);
        }

        for &closure in &node.closures {
            let decl = body.closure(closure);
            let mut free = self.visit_scope(decl.body)?;
            for reference in &decl.references {
                free.insert(reference.variable);
                if reference.access == Access::Write {
                    self.written.insert(reference.variable);
                }
            }
            free.retain(|v| !body.is_within(body.variable(*v).scope, decl.body));

            if decl.is_static {
                if let Some(&first) = free.iter().next() {
                    return Err(ModelError::StaticClosureCaptures {
                        closure: decl.marker,
                        variable: body.variable(first).name.clone(),
                    });
                }
            }

            trace!(closure = %decl.marker, captures = free.len(), "closure captures");
            pending.extend(free.iter().copied());
            self.free[closure.index()] = free;
        }

        pending.retain(|v| body.variable(*v).scope != scope);
        Ok(pending)
    }
}

/// Run capture analysis over a method body.
pub fn analyze(body: &MethodBody) -> Result<CaptureAnalysis, ModelError> {
    CaptureAnalyzer::new(body).analyze()
}
