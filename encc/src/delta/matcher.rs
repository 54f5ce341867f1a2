//! # Cross-Generation Matching
//!
//! Pairs the environments and closures of a method's new body with what the
//! previous generation shipped for it, so that identities survive the edit.
//!
//! ## Environments
//!
//! Matched (in creation order, so parents resolve first) when the previous
//! generation had an environment at the corresponding scope with
//!
//! - the same set of resident variables, mapped through the syntax map
//! - the same representation and `this` field presence
//! - a parent link to the matched identity of its old parent
//!
//! Anything else is a new environment type.
//!
//! ## Closures
//!
//! A closure corresponds to the old closure at the mapped syntax position.
//! The [`ReusePolicy`] decides, from the old and new host class, whether it
//! keeps its identity, receives a new one, or whether the edit is rejected.
//! Old entities nobody claimed are reported as no longer emitted.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::identity::{EntityKind, SynthesizedIdentity};
use super::plan::Classification;
use super::snapshot::{ClosureRecord, EnvironmentRecord, HostRecord, MethodSnapshot};
use crate::closure::{ClosureHost, EnvId, HostClass, MethodAnalysis};
use crate::diagnostics::{Rejection, UnsupportedReason};
use crate::scope::{ClosureId, MethodBody, VariableKind};
use crate::syntax::{NodeKind, SyntaxMap, SyntaxMarker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReuseAction {
    /// Keep the old identity.
    Reuse,
    /// Emit the closure under a new identity; the old one stays for frames
    /// still running it.
    Remint,
    /// The edit cannot be applied.
    Reject,
}

/// Action per (old host class, new host class).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReusePolicy {
    table: [[ReuseAction; 3]; 3],
}

impl Default for ReusePolicy {
    fn default() -> Self {
        use ReuseAction::{Remint, Reuse};
        Self {
            table: [
                // old singleton -> singleton, type instance, environment
                [Reuse, Remint, Remint],
                // old type instance
                [Reuse, Reuse, Reuse],
                // old environment
                [Reuse, Reuse, Reuse],
            ],
        }
    }
}

impl ReusePolicy {
    pub fn action(&self, old: HostClass, new: HostClass) -> ReuseAction {
        self.table[Self::slot(old)][Self::slot(new)]
    }

    pub fn set(&mut self, old: HostClass, new: HostClass, action: ReuseAction) {
        self.table[Self::slot(old)][Self::slot(new)] = action;
    }

    fn slot(class: HostClass) -> usize {
        match class {
            HostClass::Singleton => 0,
            HostClass::TypeInstance => 1,
            HostClass::Environment => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvironmentMatch {
    Reused(SynthesizedIdentity),
    New,
}

impl EnvironmentMatch {
    pub fn identity(&self) -> Option<&SynthesizedIdentity> {
        match self {
            EnvironmentMatch::Reused(identity) => Some(identity),
            EnvironmentMatch::New => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClosureMatch {
    Reused {
        identity: SynthesizedIdentity,
        /// `Matched` or `Updated`.
        classification: Classification,
    },
    New {
        /// Identity of the old closure at the same position, when the policy
        /// asked for a new one.
        replaces: Option<SynthesizedIdentity>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheMatch {
    /// The closure needs no cache field.
    None,
    Reused(SynthesizedIdentity),
    New,
}

/// An old entity with no counterpart in the new generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetiredEntity {
    pub kind: EntityKind,
    pub identity: SynthesizedIdentity,
    pub marker: Option<SyntaxMarker>,
}

/// Matching results for one method, indexed like its layout.
#[derive(Debug, Clone, Default)]
pub struct MethodMatch {
    pub environments: Vec<EnvironmentMatch>,
    pub closures: Vec<ClosureMatch>,
    pub cache_fields: Vec<CacheMatch>,
    pub retired: Vec<RetiredEntity>,
    pub rejections: Vec<Rejection>,
}

/// Matches one method body against its previous generation.
pub struct Matcher<'a> {
    body: &'a MethodBody,
    analysis: &'a MethodAnalysis,
    map: &'a SyntaxMap,
    previous: Option<&'a MethodSnapshot>,
    policy: &'a ReusePolicy,
}

impl<'a> Matcher<'a> {
    pub fn new(
        body: &'a MethodBody,
        analysis: &'a MethodAnalysis,
        map: &'a SyntaxMap,
        previous: Option<&'a MethodSnapshot>,
        policy: &'a ReusePolicy,
    ) -> Self {
        Self {
            body,
            analysis,
            map,
            previous,
            policy,
        }
    }

    pub fn run(self) -> MethodMatch {
        let mut result = MethodMatch::default();
        let mut claimed_environments = BTreeSet::new();
        let mut claimed_closures = BTreeSet::new();
        let mut claimed_caches = BTreeSet::new();

        for env in self.analysis.layout.environments() {
            let found = self.match_environment(env.id, &result.environments, &claimed_environments);
            match found {
                Some((index, record)) => {
                    claimed_environments.insert(index);
                    result.environments.push(EnvironmentMatch::Reused(record.identity.clone()));
                }
                None => result.environments.push(EnvironmentMatch::New),
            }
        }

        for layout in self.analysis.layout.closures() {
            let decl = self.body.closure(layout.closure);
            let needs_cache = self.needs_cache_field(layout.host, layout.escapes);

            let old = self
                .map
                .backward(NodeKind::Closure, decl.marker)
                .and_then(|old_marker| self.previous?.closure_at(old_marker));
            let Some(old) = old else {
                result.closures.push(ClosureMatch::New { replaces: None });
                result.cache_fields.push(if needs_cache { CacheMatch::New } else { CacheMatch::None });
                continue;
            };
            claimed_closures.insert(old.identity.clone());

            if let Some(reason) = self.unsupported(layout.closure, old) {
                result.rejections.push(Rejection {
                    member: self.body.member().to_string(),
                    closure: decl.marker,
                    previous: old.marker,
                    reason,
                });
                result.closures.push(ClosureMatch::New { replaces: None });
                result.cache_fields.push(CacheMatch::None);
                continue;
            }

            let old_class = old.host.class();
            let new_class = layout.host.class();
            match self.policy.action(old_class, new_class) {
                ReuseAction::Reject => {
                    result.rejections.push(Rejection {
                        member: self.body.member().to_string(),
                        closure: decl.marker,
                        previous: old.marker,
                        reason: UnsupportedReason::HostTransitionRejected {
                            old: old_class,
                            new: new_class,
                        },
                    });
                    result.closures.push(ClosureMatch::New { replaces: None });
                    result.cache_fields.push(CacheMatch::None);
                }
                ReuseAction::Remint => {
                    result.retired.push(RetiredEntity {
                        kind: old.kind.into(),
                        identity: old.identity.clone(),
                        marker: Some(old.marker),
                    });
                    result.closures.push(ClosureMatch::New {
                        replaces: Some(old.identity.clone()),
                    });
                    result.cache_fields.push(if needs_cache { CacheMatch::New } else { CacheMatch::None });
                }
                ReuseAction::Reuse => {
                    let container_changed =
                        !self.same_container(layout.host, &old.host, &result.environments);
                    let same_shape = !container_changed
                        && old_class == new_class
                        && old.captures_this == layout.captures_this
                        && self.same_captures(layout.closure, old);
                    let classification = if same_shape {
                        Classification::Matched
                    } else {
                        Classification::Updated
                    };
                    trace!(closure = %old.identity, ?classification, container_changed, "closure reused");
                    result.closures.push(ClosureMatch::Reused {
                        identity: old.identity.clone(),
                        classification,
                    });

                    let cache = match (&old.cache_field, needs_cache) {
                        (Some(field), true) => {
                            claimed_caches.insert(field.clone());
                            CacheMatch::Reused(field.clone())
                        }
                        (None, true) => CacheMatch::New,
                        (_, false) => CacheMatch::None,
                    };
                    result.cache_fields.push(cache);
                }
            }
        }

        if let Some(previous) = self.previous {
            for (index, env) in previous.environments.iter().enumerate() {
                if !claimed_environments.contains(&index) {
                    result.retired.push(RetiredEntity {
                        kind: EntityKind::Environment,
                        identity: env.identity.clone(),
                        marker: Some(env.scope),
                    });
                }
            }
            for closure in &previous.closures {
                if !claimed_closures.contains(&closure.identity) {
                    result.retired.push(RetiredEntity {
                        kind: closure.kind.into(),
                        identity: closure.identity.clone(),
                        marker: Some(closure.marker),
                    });
                }
                if let Some(field) = &closure.cache_field {
                    if !claimed_caches.contains(field) {
                        result.retired.push(RetiredEntity {
                            kind: EntityKind::CacheField,
                            identity: field.clone(),
                            marker: None,
                        });
                    }
                }
            }
        }

        result
    }

    fn match_environment(
        &self,
        env: EnvId,
        resolved: &[EnvironmentMatch],
        claimed: &BTreeSet<usize>,
    ) -> Option<(usize, &'a EnvironmentRecord)> {
        let previous = self.previous?;
        let layout = self.analysis.layout.environment(env);
        let scope_marker = self.body.scope(layout.scope).marker;
        let old_scope = self.map.backward(NodeKind::Scope, scope_marker)?;

        let residents: BTreeSet<SyntaxMarker> = layout
            .variables
            .iter()
            .map(|v| {
                self.map
                    .backward(NodeKind::Variable, self.body.variable(*v).marker)
            })
            .collect::<Option<_>>()?;

        let parent = match layout.parent {
            Some(parent) => Some(resolved.get(parent.index())?.identity()?.clone()),
            None => None,
        };

        previous
            .environments
            .iter()
            .enumerate()
            .find(|(index, record)| {
                !claimed.contains(index)
                    && record.scope == old_scope
                    && record.representation == layout.representation
                    && record.captures_this == layout.captures_this
                    && record.parent == parent
                    && record.residents.len() == residents.len()
                    && record.residents.iter().all(|r| residents.contains(&r.marker))
            })
    }

    fn unsupported(
        &self,
        closure: ClosureId,
        old: &ClosureRecord,
    ) -> Option<UnsupportedReason> {
        let decl = self.body.closure(closure);
        if decl.kind != old.kind {
            return Some(UnsupportedReason::ClosureKindChanged {
                old: old.kind,
                new: decl.kind,
            });
        }
        if decl.params.len() != old.parameter_count {
            return Some(UnsupportedReason::ParameterCountChanged {
                old: old.parameter_count,
                new: decl.params.len(),
            });
        }

        let previous = self.previous?;
        for &variable in &self.analysis.captures.closure(closure).variables {
            let var = self.body.variable(variable);
            if var.kind == VariableKind::This {
                continue;
            }
            let Some(old_marker) = self.map.backward(NodeKind::Variable, var.marker) else {
                continue;
            };
            let Some(old_var) = previous.resident(old_marker) else {
                continue;
            };
            let new_scope = self.body.scope(var.scope).marker;
            if self.map.backward(NodeKind::Scope, new_scope) != Some(old_var.scope) {
                return Some(UnsupportedReason::CapturedVariableMoved {
                    variable: var.name.clone(),
                });
            }
        }
        None
    }

    fn same_container(
        &self,
        host: ClosureHost,
        old: &HostRecord,
        environments: &[EnvironmentMatch],
    ) -> bool {
        match (host, old) {
            (ClosureHost::Singleton, HostRecord::Singleton) => true,
            (ClosureHost::InstanceOnType, HostRecord::TypeInstance) => true,
            (ClosureHost::InstanceOnEnvironment(env), HostRecord::Environment(old_env)) => {
                environments
                    .get(env.index())
                    .and_then(EnvironmentMatch::identity)
                    == Some(old_env)
            }
            _ => false,
        }
    }

    fn same_captures(&self, closure: ClosureId, old: &ClosureRecord) -> bool {
        let captured = &self.analysis.captures.closure(closure).variables;
        if captured.len() != old.captured.len() {
            return false;
        }
        captured.iter().all(|v| {
            self.map
                .backward(NodeKind::Variable, self.body.variable(*v).marker)
                .is_some_and(|old_marker| old.captured.contains(&old_marker))
        })
    }

    /// Singleton-hosted escaping closures of non-generic members cache their
    /// delegate in a static field.
    fn needs_cache_field(&self, host: ClosureHost, escapes: bool) -> bool {
        host.is_static() && escapes && self.body.member().generic_arity == 0
    }
}

/// Match one method body against its previous generation.
pub fn match_method(
    body: &MethodBody,
    analysis: &MethodAnalysis,
    map: &SyntaxMap,
    previous: Option<&MethodSnapshot>,
    policy: &ReusePolicy,
) -> MethodMatch {
    Matcher::new(body, analysis, map, previous, policy).run()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = ReusePolicy::default();
        for class in HostClass::ALL {
            assert_eq!(policy.action(class, class), ReuseAction::Reuse);
        }
        assert_eq!(
            policy.action(HostClass::TypeInstance, HostClass::Environment),
            ReuseAction::Reuse
        );
        assert_eq!(
            policy.action(HostClass::Environment, HostClass::TypeInstance),
            ReuseAction::Reuse
        );
        assert_eq!(
            policy.action(HostClass::Environment, HostClass::Singleton),
            ReuseAction::Reuse
        );
        assert_eq!(
            policy.action(HostClass::Singleton, HostClass::Environment),
            ReuseAction::Remint
        );
        assert_eq!(
            policy.action(HostClass::Singleton, HostClass::TypeInstance),
            ReuseAction::Remint
        );
    }

    #[test]
    fn test_policy_override() {
        let mut policy = ReusePolicy::default();
        policy.set(HostClass::Environment, HostClass::Singleton, ReuseAction::Reject);
        assert_eq!(
            policy.action(HostClass::Environment, HostClass::Singleton),
            ReuseAction::Reject
        );
        assert_eq!(
            policy.action(HostClass::TypeInstance, HostClass::Singleton),
            ReuseAction::Reuse
        );
    }
}
