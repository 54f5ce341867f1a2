//! Incremental construction of [`MethodBody`] trees.

use super::tree::{
    Access, ClosureDecl, ClosureKind, MethodBody, ScopeNode, ScopeOwner, VariableDecl,
    VariableKind, VariableRef,
};
use super::{ClosureId, MemberKey, ScopeId, VariableId};
use crate::diagnostics::ModelError;
use crate::syntax::SyntaxMarker;

/// Builds a [`MethodBody`] one node at a time.
///
/// Markers are supplied by the caller because they must agree with the
/// [`SyntaxMap`](crate::SyntaxMap) produced for the edit. A closure's body
/// scope reuses the closure's marker. The `this` variable of an instance
/// member reuses the root scope's marker.
///
/// Handing the builder an id it did not allocate is recorded and reported
/// by [`finish`](Self::finish).
#[derive(Debug)]
pub struct MethodBodyBuilder {
    body: MethodBody,
    error: Option<ModelError>,
}

impl MethodBodyBuilder {
    /// Start an instance member whose root scope carries `root_marker`.
    pub fn new(member: MemberKey, root_marker: SyntaxMarker) -> Self {
        let mut builder = Self::with_root(member, false, root_marker);
        let this = builder.declare(builder.body.root, "this", VariableKind::This, root_marker);
        builder.body.this_variable = Some(this);
        builder
    }

    /// Start a static member: no `this` is available.
    pub fn new_static(member: MemberKey, root_marker: SyntaxMarker) -> Self {
        Self::with_root(member, true, root_marker)
    }

    fn with_root(member: MemberKey, is_static: bool, marker: SyntaxMarker) -> Self {
        let root = ScopeId::new(0);
        Self {
            body: MethodBody {
                member,
                is_static,
                root,
                this_variable: None,
                scopes: vec![ScopeNode {
                    id: root,
                    marker,
                    parent: None,
                    owner: ScopeOwner::Method,
                    is_loop_body: false,
                    variables: Vec::new(),
                    children: Vec::new(),
                    closures: Vec::new(),
                    depth: 0,
                }],
                variables: Vec::new(),
                closures: Vec::new(),
            },
            error: None,
        }
    }

    /// Keep the first misuse; later ones are usually its fallout.
    fn fail(&mut self, error: ModelError) {
        self.error.get_or_insert(error);
    }

    pub fn root(&self) -> ScopeId {
        self.body.root
    }

    /// The `this` variable, if the member is an instance member.
    pub fn this(&self) -> Option<VariableId> {
        self.body.this_variable
    }

    /// Open a nested block.
    pub fn block(&mut self, parent: ScopeId, marker: SyntaxMarker) -> ScopeId {
        self.nested(parent, marker, false)
    }

    /// Open a loop body: its variables are fresh per iteration.
    pub fn loop_body(&mut self, parent: ScopeId, marker: SyntaxMarker) -> ScopeId {
        self.nested(parent, marker, true)
    }

    fn nested(&mut self, parent: ScopeId, marker: SyntaxMarker, is_loop_body: bool) -> ScopeId {
        let (owner, depth) = self
            .body
            .scopes
            .get(parent.index())
            .map(|node| (node.owner, node.depth + 1))
            .unwrap_or((ScopeOwner::Method, 0));
        let id = self.push_scope(parent, marker, owner, is_loop_body, depth);
        if let Some(node) = self.body.scopes.get_mut(parent.index()) {
            node.children.push(id);
        }
        id
    }

    fn push_scope(
        &mut self,
        parent: ScopeId,
        marker: SyntaxMarker,
        owner: ScopeOwner,
        is_loop_body: bool,
        depth: u32,
    ) -> ScopeId {
        let id = ScopeId::new(self.body.scopes.len() as u32);
        self.body.scopes.push(ScopeNode {
            id,
            marker,
            parent: Some(parent),
            owner,
            is_loop_body,
            variables: Vec::new(),
            children: Vec::new(),
            closures: Vec::new(),
            depth,
        });
        id
    }

    pub fn parameter(&mut self, scope: ScopeId, name: &str, marker: SyntaxMarker) -> VariableId {
        self.declare(scope, name, VariableKind::Parameter, marker)
    }

    pub fn local(&mut self, scope: ScopeId, name: &str, marker: SyntaxMarker) -> VariableId {
        self.declare(scope, name, VariableKind::Local, marker)
    }

    fn declare(
        &mut self,
        scope: ScopeId,
        name: &str,
        kind: VariableKind,
        marker: SyntaxMarker,
    ) -> VariableId {
        let id = VariableId::new(self.body.variables.len() as u32);
        self.body.variables.push(VariableDecl {
            id,
            marker,
            name: name.to_string(),
            kind,
            scope,
            reassigned: false,
        });
        if let Some(node) = self.body.scopes.get_mut(scope.index()) {
            node.variables.push(id);
        }
        id
    }

    /// Record that the variable is assigned after its declaration.
    pub fn mark_reassigned(&mut self, variable: VariableId) {
        if let Some(decl) = self.body.variables.get_mut(variable.index()) {
            decl.reassigned = true;
        }
    }

    pub fn lambda(&mut self, scope: ScopeId, marker: SyntaxMarker) -> ClosureId {
        self.closure(scope, ClosureKind::Lambda, None, marker)
    }

    /// Declare a local function. It does not escape unless marked.
    pub fn local_function(&mut self, scope: ScopeId, name: &str, marker: SyntaxMarker) -> ClosureId {
        self.closure(scope, ClosureKind::LocalFunction, Some(name.to_string()), marker)
    }

    pub fn query_clause(&mut self, scope: ScopeId, marker: SyntaxMarker) -> ClosureId {
        self.closure(scope, ClosureKind::QueryClause, None, marker)
    }

    fn closure(
        &mut self,
        scope: ScopeId,
        kind: ClosureKind,
        name: Option<String>,
        marker: SyntaxMarker,
    ) -> ClosureId {
        let id = ClosureId::new(self.body.closures.len() as u32);
        let depth = self
            .body
            .scopes
            .get(scope.index())
            .map_or(0, |node| node.depth + 1);
        let body = self.push_scope(scope, marker, ScopeOwner::Closure(id), false, depth);
        self.body.closures.push(ClosureDecl {
            id,
            marker,
            kind,
            name,
            scope,
            body,
            params: Vec::new(),
            references: Vec::new(),
            is_static: false,
            escapes: kind != ClosureKind::LocalFunction,
        });
        if let Some(node) = self.body.scopes.get_mut(scope.index()) {
            node.closures.push(id);
        }
        id
    }

    /// Root scope of a closure's body.
    ///
    /// An unknown closure is recorded as an error and yields the root scope.
    pub fn closure_body(&mut self, closure: ClosureId) -> ScopeId {
        match self.body.closures.get(closure.index()) {
            Some(decl) => decl.body,
            None => {
                self.fail(ModelError::UnknownClosure { closure });
                self.body.root
            }
        }
    }

    /// Declare a parameter of a closure.
    pub fn closure_parameter(
        &mut self,
        closure: ClosureId,
        name: &str,
        marker: SyntaxMarker,
    ) -> VariableId {
        let body = self.closure_body(closure);
        let id = self.declare(body, name, VariableKind::Parameter, marker);
        if let Some(decl) = self.body.closures.get_mut(closure.index()) {
            decl.params.push(id);
        }
        id
    }

    pub fn reads(&mut self, closure: ClosureId, variable: VariableId) {
        self.reference(closure, variable, Access::Read);
    }

    pub fn writes(&mut self, closure: ClosureId, variable: VariableId) {
        self.reference(closure, variable, Access::Write);
    }

    fn reference(&mut self, closure: ClosureId, variable: VariableId, access: Access) {
        match self.body.closures.get_mut(closure.index()) {
            Some(decl) => decl.references.push(VariableRef { variable, access }),
            None => self.fail(ModelError::UnknownClosure { closure }),
        }
    }

    /// Declare the closure `static`.
    pub fn mark_static(&mut self, closure: ClosureId) {
        match self.body.closures.get_mut(closure.index()) {
            Some(decl) => decl.is_static = true,
            None => self.fail(ModelError::UnknownClosure { closure }),
        }
    }

    /// Record that a local function is converted to a delegate.
    pub fn mark_escaping(&mut self, closure: ClosureId) {
        match self.body.closures.get_mut(closure.index()) {
            Some(decl) => decl.escapes = true,
            None => self.fail(ModelError::UnknownClosure { closure }),
        }
    }

    /// Validate and freeze the tree.
    pub fn finish(self) -> Result<MethodBody, ModelError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        self.body.validate()?;
        Ok(self.body)
    }
}
