//! # Environment Allocation
//!
//! Groups captured variables into synthesized environment types and decides
//! where every closure lives.
//!
//! ## Environments
//!
//! Each scope declaring at least one captured variable (other than `this`)
//! gets an environment, unless it can be merged into the nearest ancestor
//! environment. Merging requires that
//!
//! 1. no loop body or closure boundary lies between the two scopes, and
//! 2. every closure capturing the inner scope's variables already captures
//!    something from the ancestor environment,
//!
//! so a merge never makes a closure capture more than it did.
//!
//! ## Hosts
//!
//! | Captures | Host |
//! |----------|------|
//! | nothing | [`ClosureHost::Singleton`] |
//! | only `this` | [`ClosureHost::InstanceOnType`] |
//! | locals | [`ClosureHost::InstanceOnEnvironment`] of the innermost environment it needs |
//!
//! ## Chains
//!
//! A closure hosted on one environment that needs outer variables reaches
//! them through parent links. A link always targets the nearest
//! [`Representation::Reference`] ancestor environment; value environments are
//! never link targets and are passed to the closure as extra by-reference
//! parameters instead. The enclosing instance is stored once, in the
//! outermost environment a `this`-capturing closure requires.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::capture::CaptureAnalysis;
use super::representation::{self, EscapeState, Representation};
use crate::config::EnvironmentConfig;
use crate::scope::{ClosureId, MethodBody, ScopeId, VariableId};

/// Index of an environment within one [`EnvironmentLayout`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EnvId(pub u32);

impl EnvId {
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnvId({})", self.0)
    }
}

/// Where a closure's method lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClosureHost {
    /// Instance method of the per-type singleton.
    Singleton,
    /// Instance method of the enclosing type.
    InstanceOnType,
    /// Instance method of a synthesized environment.
    InstanceOnEnvironment(EnvId),
}

impl ClosureHost {
    pub fn class(&self) -> HostClass {
        match self {
            ClosureHost::Singleton => HostClass::Singleton,
            ClosureHost::InstanceOnType => HostClass::TypeInstance,
            ClosureHost::InstanceOnEnvironment(_) => HostClass::Environment,
        }
    }

    /// Whether the closure captures nothing at all.
    pub fn is_static(&self) -> bool {
        matches!(self, ClosureHost::Singleton)
    }

    pub fn environment(&self) -> Option<EnvId> {
        match self {
            ClosureHost::InstanceOnEnvironment(env) => Some(*env),
            _ => None,
        }
    }
}

/// Host shape without the environment payload, used for policy decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HostClass {
    Singleton,
    TypeInstance,
    Environment,
}

impl HostClass {
    pub const ALL: [HostClass; 3] = [
        HostClass::Singleton,
        HostClass::TypeInstance,
        HostClass::Environment,
    ];
}

impl fmt::Display for HostClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostClass::Singleton => f.write_str("singleton"),
            HostClass::TypeInstance => f.write_str("type instance"),
            HostClass::Environment => f.write_str("environment"),
        }
    }
}

/// A synthesized environment.
#[derive(Debug, Clone)]
pub struct Environment {
    pub id: EnvId,
    /// Scope whose entry creates the environment instance.
    pub scope: ScopeId,
    /// Descendant scopes whose variables were merged in.
    pub merged_scopes: Vec<ScopeId>,
    /// Resident variables, outer scope first, declaration order within a scope.
    pub variables: Vec<VariableId>,
    pub representation: Representation,
    /// Link to the nearest reference-type ancestor environment.
    pub parent: Option<EnvId>,
    /// Holds a field for the enclosing instance.
    pub captures_this: bool,
    /// Closures requiring this environment.
    pub users: Vec<ClosureId>,
}

/// Placement of one closure.
#[derive(Debug, Clone)]
pub struct ClosureLayout {
    pub closure: ClosureId,
    pub host: ClosureHost,
    /// Environments holding the closure's captured variables, outermost first.
    pub required: Vec<EnvId>,
    /// Value environments passed as extra by-reference parameters.
    pub by_ref_environments: Vec<EnvId>,
    pub captures_this: bool,
    pub escapes: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationStats {
    pub scopes_with_captures: usize,
    pub environments: usize,
    pub merged_scopes: usize,
    pub value_environments: usize,
    pub singleton_closures: usize,
    pub type_closures: usize,
    pub environment_closures: usize,
    pub parent_links: usize,
    pub by_ref_parameters: usize,
}

/// Environment layout of one method body.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentLayout {
    environments: Vec<Environment>,
    closures: Vec<ClosureLayout>,
    homes: BTreeMap<VariableId, EnvId>,
    scope_environments: BTreeMap<ScopeId, EnvId>,
    pub stats: AllocationStats,
}

impl EnvironmentLayout {
    /// Environments in creation order; an environment's parent always comes
    /// before it.
    pub fn environments(&self) -> &[Environment] {
        &self.environments
    }

    pub fn environment(&self, id: EnvId) -> &Environment {
        &self.environments[id.index()]
    }

    pub fn closures(&self) -> &[ClosureLayout] {
        &self.closures
    }

    pub fn closure(&self, id: ClosureId) -> &ClosureLayout {
        &self.closures[id.index()]
    }

    /// The environment a captured variable lives in.
    pub fn home(&self, variable: VariableId) -> Option<EnvId> {
        self.homes.get(&variable).copied()
    }

    /// The environment holding the variables declared in `scope`, including
    /// scopes merged into an ancestor's environment.
    pub fn scope_environment(&self, scope: ScopeId) -> Option<EnvId> {
        self.scope_environments.get(&scope).copied()
    }

    /// Whether any closure is hosted on the per-type singleton.
    pub fn uses_singleton(&self) -> bool {
        self.closures.iter().any(|c| c.host.is_static())
    }
}

/// Computes an [`EnvironmentLayout`] from capture analysis results.
pub struct EnvironmentAllocator<'a> {
    body: &'a MethodBody,
    captures: &'a CaptureAnalysis,
    config: &'a EnvironmentConfig,
    environments: Vec<Environment>,
    scope_environments: BTreeMap<ScopeId, EnvId>,
}

impl<'a> EnvironmentAllocator<'a> {
    pub fn new(
        body: &'a MethodBody,
        captures: &'a CaptureAnalysis,
        config: &'a EnvironmentConfig,
    ) -> Self {
        Self {
            body,
            captures,
            config,
            environments: Vec::new(),
            scope_environments: BTreeMap::new(),
        }
    }

    pub fn allocate(mut self) -> EnvironmentLayout {
        let mut stats = AllocationStats::default();

        for scope in self.body.preorder() {
            let residents = self.captures.scope_variables(scope);
            if residents.is_empty() {
                continue;
            }
            stats.scopes_with_captures += 1;

            let target = if self.config.merge_scopes {
                self.merge_target(scope)
            } else {
                None
            };
            match target {
                Some(target) => {
                    let env = &mut self.environments[target.index()];
                    env.variables.extend_from_slice(residents);
                    env.merged_scopes.push(scope);
                    self.scope_environments.insert(scope, target);
                    stats.merged_scopes += 1;
                }
                None => {
                    let id = EnvId::new(self.environments.len() as u32);
                    self.environments.push(Environment {
                        id,
                        scope,
                        merged_scopes: Vec::new(),
                        variables: residents.to_vec(),
                        representation: Representation::Reference,
                        parent: None,
                        captures_this: false,
                        users: Vec::new(),
                    });
                    self.scope_environments.insert(scope, id);
                }
            }
        }

        let mut homes = BTreeMap::new();
        for env in &self.environments {
            for &variable in &env.variables {
                homes.insert(variable, env.id);
            }
        }

        let mut closures = Vec::with_capacity(self.body.closures().len());
        for decl in self.body.closures() {
            let captures = self.captures.closure(decl.id);
            let mut required: Vec<EnvId> = captures
                .variables
                .iter()
                .filter_map(|v| homes.get(v).copied())
                .collect();
            required.sort_by_key(|env| (self.env_depth(*env), *env));
            required.dedup();

            let host = match required.last() {
                Some(&innermost) => ClosureHost::InstanceOnEnvironment(innermost),
                None if captures.captures_this => ClosureHost::InstanceOnType,
                None => ClosureHost::Singleton,
            };
            for env in &required {
                self.environments[env.index()].users.push(decl.id);
            }
            closures.push(ClosureLayout {
                closure: decl.id,
                host,
                required,
                by_ref_environments: Vec::new(),
                captures_this: captures.captures_this,
                escapes: self.body.escapes(decl.id),
            });
        }

        let body = self.body;
        let allow_value = self.config.value_environments;
        for env in &mut self.environments {
            let users = env.users.iter().map(|c| EscapeState::of(body, *c));
            env.representation = representation::choose(users, allow_value);
        }

        for layout in &mut closures {
            if let Some(host) = layout.host.environment() {
                let environments = &self.environments;
                layout.by_ref_environments = layout
                    .required
                    .iter()
                    .copied()
                    .filter(|env| {
                        *env != host
                            && environments[env.index()].representation == Representation::Value
                    })
                    .collect();
            }
        }

        for layout in &closures {
            let Some(host) = layout.host.environment() else {
                continue;
            };
            for &target in &layout.required {
                if target == host
                    || self.environments[target.index()].representation == Representation::Value
                {
                    continue;
                }
                let mut current = host;
                while current != target {
                    let Some(next) = self.reference_ancestor(current) else {
                        break;
                    };
                    self.environments[current.index()].parent = Some(next);
                    current = next;
                }
            }
        }

        for layout in &closures {
            if layout.captures_this {
                if let Some(outermost) = layout.required.first() {
                    self.environments[outermost.index()].captures_this = true;
                }
            }
        }

        stats.environments = self.environments.len();
        stats.value_environments = self
            .environments
            .iter()
            .filter(|e| e.representation == Representation::Value)
            .count();
        stats.parent_links = self.environments.iter().filter(|e| e.parent.is_some()).count();
        for layout in &closures {
            match layout.host {
                ClosureHost::Singleton => stats.singleton_closures += 1,
                ClosureHost::InstanceOnType => stats.type_closures += 1,
                ClosureHost::InstanceOnEnvironment(_) => stats.environment_closures += 1,
            }
            stats.by_ref_parameters += layout.by_ref_environments.len();
        }

        EnvironmentLayout {
            environments: self.environments,
            closures,
            homes,
            scope_environments: self.scope_environments,
            stats,
        }
    }

    fn env_depth(&self, env: EnvId) -> u32 {
        self.body.scope(self.environments[env.index()].scope).depth
    }

    /// The environment `scope` may merge into, if any.
    fn merge_target(&self, scope: ScopeId) -> Option<EnvId> {
        let mut current = scope;
        loop {
            let node = self.body.scope(current);
            if node.is_loop_body {
                return None;
            }
            let parent = node.parent?;
            if self.body.scope(parent).owner != node.owner {
                return None;
            }
            if let Some(&target) = self.scope_environments.get(&parent) {
                return self.merge_preserves_captures(scope, target).then_some(target);
            }
            current = parent;
        }
    }

    fn merge_preserves_captures(&self, scope: ScopeId, target: EnvId) -> bool {
        let inner = self.captures.scope_variables(scope);
        let outer = &self.environments[target.index()].variables;
        self.body.closures().iter().all(|decl| {
            let captured = &self.captures.closure(decl.id).variables;
            let needs_inner = captured.iter().any(|v| inner.contains(v));
            !needs_inner || captured.iter().any(|v| outer.contains(v))
        })
    }

    /// Nearest reference-type environment of an enclosing scope.
    fn reference_ancestor(&self, env: EnvId) -> Option<EnvId> {
        let mut scope = self.body.scope(self.environments[env.index()].scope).parent;
        while let Some(id) = scope {
            if let Some(&candidate) = self.scope_environments.get(&id) {
                if candidate != env
                    && self.environments[candidate.index()].representation
                        == Representation::Reference
                {
                    return Some(candidate);
                }
            }
            scope = self.body.scope(id).parent;
        }
        None
    }
}

/// Compute the environment layout of a method body.
pub fn allocate(
    body: &MethodBody,
    captures: &CaptureAnalysis,
    config: &EnvironmentConfig,
) -> EnvironmentLayout {
    EnvironmentAllocator::new(body, captures, config).allocate()
}
