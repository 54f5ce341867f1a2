//! Scope tree arena.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::{ClosureId, MemberKey, ScopeId, VariableId};
use crate::diagnostics::ModelError;
use crate::syntax::SyntaxMarker;

/// Who owns the frame a scope lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeOwner {
    /// The enclosing method's own frame.
    Method,
    /// The body of a closure.
    Closure(ClosureId),
}

/// A lexical block.
#[derive(Debug, Clone)]
pub struct ScopeNode {
    pub id: ScopeId,
    pub marker: SyntaxMarker,
    pub parent: Option<ScopeId>,
    pub owner: ScopeOwner,
    /// Variables declared here are fresh on every iteration.
    pub is_loop_body: bool,
    /// Variables declared directly in this scope, in declaration order.
    pub variables: Vec<VariableId>,
    /// Nested blocks of the same owner. Closure bodies are reached through
    /// `closures` instead.
    pub children: Vec<ScopeId>,
    /// Closures declared directly in this scope, in declaration order.
    pub closures: Vec<ClosureId>,
    /// Distance from the method's root scope.
    pub depth: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum VariableKind {
    Parameter,
    Local,
    /// The enclosing instance.
    This,
}

/// A declared variable.
#[derive(Debug, Clone)]
pub struct VariableDecl {
    pub id: VariableId,
    pub marker: SyntaxMarker,
    pub name: String,
    pub kind: VariableKind,
    pub scope: ScopeId,
    /// Assigned again after its declaration somewhere in the method.
    pub reassigned: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    Read,
    Write,
}

/// One variable referenced from within a closure body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariableRef {
    pub variable: VariableId,
    pub access: Access,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ClosureKind {
    Lambda,
    LocalFunction,
    /// Helper lambda produced by lowering a query clause.
    QueryClause,
}

impl ClosureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ClosureKind::Lambda => "lambda",
            ClosureKind::LocalFunction => "local function",
            ClosureKind::QueryClause => "query clause",
        }
    }
}

/// A closure declared in some scope.
#[derive(Debug, Clone)]
pub struct ClosureDecl {
    pub id: ClosureId,
    pub marker: SyntaxMarker,
    pub kind: ClosureKind,
    /// Source name, present for local functions.
    pub name: Option<String>,
    /// Scope the closure is declared in.
    pub scope: ScopeId,
    /// Root scope of the closure's body.
    pub body: ScopeId,
    /// Parameters, declared in `body`.
    pub params: Vec<VariableId>,
    /// Variables referenced anywhere in the body, nested closures excluded.
    pub references: Vec<VariableRef>,
    /// Declared `static`: must not capture anything.
    pub is_static: bool,
    /// Converted to a delegate or otherwise outlives the frame. Lambdas and
    /// query clauses always escape.
    pub escapes: bool,
}

/// One method's scope tree for a single generation.
#[derive(Debug, Clone)]
pub struct MethodBody {
    pub(crate) member: MemberKey,
    pub(crate) is_static: bool,
    pub(crate) root: ScopeId,
    pub(crate) this_variable: Option<VariableId>,
    pub(crate) scopes: Vec<ScopeNode>,
    pub(crate) variables: Vec<VariableDecl>,
    pub(crate) closures: Vec<ClosureDecl>,
}

impl MethodBody {
    pub fn member(&self) -> &MemberKey {
        &self.member
    }

    pub fn is_static(&self) -> bool {
        self.is_static
    }

    pub fn root(&self) -> ScopeId {
        self.root
    }

    /// The `this` variable, present for instance members.
    pub fn this_variable(&self) -> Option<VariableId> {
        self.this_variable
    }

    pub fn scope(&self, id: ScopeId) -> &ScopeNode {
        &self.scopes[id.index()]
    }

    pub fn variable(&self, id: VariableId) -> &VariableDecl {
        &self.variables[id.index()]
    }

    pub fn closure(&self, id: ClosureId) -> &ClosureDecl {
        &self.closures[id.index()]
    }

    pub fn scopes(&self) -> &[ScopeNode] {
        &self.scopes
    }

    pub fn variables(&self) -> &[VariableDecl] {
        &self.variables
    }

    pub fn closures(&self) -> &[ClosureDecl] {
        &self.closures
    }

    /// Whether `scope` is `ancestor` or lies below it.
    pub fn is_within(&self, scope: ScopeId, ancestor: ScopeId) -> bool {
        let mut current = Some(scope);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.scope(id).parent;
        }
        false
    }

    /// Scopes in pre-order: a scope, then its nested blocks, then the bodies
    /// of the closures declared in it.
    pub fn preorder(&self) -> Vec<ScopeId> {
        let mut order = Vec::with_capacity(self.scopes.len());
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            order.push(id);
            let node = self.scope(id);
            for &closure in node.closures.iter().rev() {
                stack.push(self.closure(closure).body);
            }
            for &child in node.children.iter().rev() {
                stack.push(child);
            }
        }
        order
    }

    /// Whether the closure outlives the frame that creates it.
    pub fn escapes(&self, id: ClosureId) -> bool {
        let closure = self.closure(id);
        match closure.kind {
            ClosureKind::Lambda | ClosureKind::QueryClause => true,
            ClosureKind::LocalFunction => closure.escapes,
        }
    }

    /// Structural validation, run once by the builder.
    pub(crate) fn validate(&self) -> Result<(), ModelError> {
        let root = self
            .scopes
            .get(self.root.index())
            .ok_or(ModelError::UnknownScope { scope: self.root })?;
        if root.parent.is_some() || root.owner != ScopeOwner::Method {
            return Err(ModelError::MalformedScope {
                scope: self.root,
                reason: "the root scope must be the method's outermost block",
            });
        }

        let mut scope_markers = HashSet::new();
        for (index, node) in self.scopes.iter().enumerate() {
            if node.id.index() != index {
                return Err(ModelError::UnknownScope { scope: node.id });
            }
            if !scope_markers.insert(node.marker) {
                return Err(ModelError::DuplicateMarker {
                    category: "scope",
                    marker: node.marker,
                });
            }
            if let Some(parent) = node.parent {
                // Parents are always allocated first, which also rules out cycles.
                if parent.index() >= index {
                    return Err(ModelError::MalformedScope {
                        scope: node.id,
                        reason: "a scope must be declared after its parent",
                    });
                }
                let expected_owner = self.body_owner(node.id).unwrap_or(self.scope(parent).owner);
                if node.owner != expected_owner {
                    return Err(ModelError::MalformedScope {
                        scope: node.id,
                        reason: "scope owner disagrees with its parent",
                    });
                }
            } else if node.id != self.root {
                return Err(ModelError::MalformedScope {
                    scope: node.id,
                    reason: "only the root scope may have no parent",
                });
            }
            for &child in &node.children {
                if child.index() >= self.scopes.len() {
                    return Err(ModelError::UnknownScope { scope: child });
                }
            }
        }

        let mut declared = vec![None; self.variables.len()];
        for node in &self.scopes {
            for &variable in &node.variables {
                let slot = declared
                    .get_mut(variable.index())
                    .ok_or(ModelError::UnknownVariable { variable })?;
                if slot.is_some() {
                    return Err(ModelError::DuplicateVariable {
                        name: self.variables[variable.index()].name.clone(),
                        scope: node.id,
                    });
                }
                *slot = Some(node.id);
            }
        }

        let mut variable_markers = HashSet::new();
        for (decl, home) in self.variables.iter().zip(&declared) {
            if *home != Some(decl.scope) {
                return Err(ModelError::DuplicateVariable {
                    name: decl.name.clone(),
                    scope: decl.scope,
                });
            }
            if !variable_markers.insert(decl.marker) {
                return Err(ModelError::DuplicateMarker {
                    category: "variable",
                    marker: decl.marker,
                });
            }
            if decl.kind == VariableKind::This
                && (decl.scope != self.root || self.this_variable != Some(decl.id))
            {
                return Err(ModelError::MalformedScope {
                    scope: decl.scope,
                    reason: "`this` must be declared once in the root scope",
                });
            }
        }

        let mut closure_markers = HashSet::new();
        for closure in &self.closures {
            if !closure_markers.insert(closure.marker) {
                return Err(ModelError::DuplicateMarker {
                    category: "closure",
                    marker: closure.marker,
                });
            }
            let body = self
                .scopes
                .get(closure.body.index())
                .ok_or(ModelError::UnknownScope { scope: closure.body })?;
            if body.parent != Some(closure.scope) || body.owner != ScopeOwner::Closure(closure.id) {
                return Err(ModelError::MalformedScope {
                    scope: closure.body,
                    reason: "closure body must be nested in its declaring scope",
                });
            }
            for reference in &closure.references {
                let variable = self
                    .variables
                    .get(reference.variable.index())
                    .ok_or(ModelError::UnknownVariable {
                        variable: reference.variable,
                    })?;
                // Outer variables, or locals of this closure's own body. Locals
                // of a nested closure are not visible here.
                let visible = self.is_within(closure.body, variable.scope)
                    || (self.is_within(variable.scope, closure.body)
                        && self.scope(variable.scope).owner == ScopeOwner::Closure(closure.id));
                if !visible {
                    return Err(ModelError::VariableNotInScope {
                        variable: variable.name.clone(),
                        closure: closure.marker,
                    });
                }
            }
        }

        Ok(())
    }

    fn body_owner(&self, scope: ScopeId) -> Option<ScopeOwner> {
        self.closures
            .iter()
            .find(|closure| closure.body == scope)
            .map(|closure| ScopeOwner::Closure(closure.id))
    }
}
