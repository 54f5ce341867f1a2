//! Emission plan: what the metadata and IL writers receive for one edit.
//!
//! - [`Declaration`]s name every synthesized type, method and field the delta
//!   touches, tagged with whether a new metadata row is needed.
//! - A [`RewritePlan`] per lowered method tells the body rewriter where each
//!   variable lives, which environments to instantiate, and how to create each
//!   closure.
//! - [`EntityReport`]s classify every entity for diagnostics.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::identity::{EntityKind, Generation, SynthesizedIdentity, PARENT_FIELD, THIS_FIELD};
use super::snapshot::{
    CapturedVariableRecord, ClosureRecord, EnvironmentRecord, GenerationSnapshot, HostRecord,
    MethodSnapshot,
};
use crate::closure::{CaptureMode, ClosureHost, MethodAnalysis, Representation};
use crate::scope::{MemberKey, MethodBody, VariableId, VariableKind};
use crate::syntax::{NodeKind, SyntaxMap, SyntaxMarker};

/// How an entity relates to what earlier generations shipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Classification {
    /// Same identity, same shape.
    Matched,
    /// Same identity; captures, host or body changed.
    Updated,
    /// Minted by this generation.
    Added,
    /// Shipped earlier, not emitted by this generation. Its metadata stays.
    NoLongerEmitted,
}

/// Whether a declaration needs a metadata row in this delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowAction {
    /// Emit a new metadata row.
    New,
    /// The row from an earlier generation is reused.
    Existing,
}

/// What an environment field stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    /// A captured local or parameter.
    Variable {
        /// Declaration of the variable in the new tree.
        marker: SyntaxMarker,
        mode: CaptureMode,
    },
    /// The enclosing instance.
    This,
    /// Link to the parent environment.
    Parent(SynthesizedIdentity),
}

/// One field of an environment type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDecl {
    /// Metadata name, stable for as long as the environment is reused.
    pub name: String,
    pub kind: FieldKind,
}

/// Type holding a closure's method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Container {
    /// The enclosing type itself.
    Type(String),
    /// The per-type singleton hosting captureless closures.
    Singleton(SynthesizedIdentity),
    /// A class environment.
    Environment(SynthesizedIdentity),
}

/// A synthesized type, method or field the delta touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Declaration {
    /// Environment type nested in `owner_type`.
    Environment {
        identity: SynthesizedIdentity,
        /// Type whose member declares the environment.
        owner_type: String,
        representation: Representation,
        /// Captured variables first, then `this`, then the parent link.
        fields: Vec<FieldDecl>,
        row: RowAction,
    },
    /// The per-type singleton of `owner_type`.
    Singleton {
        identity: SynthesizedIdentity,
        owner_type: String,
        row: RowAction,
    },
    /// Method holding a closure's body.
    ClosureMethod {
        identity: SynthesizedIdentity,
        /// Type the method is declared in.
        container: Container,
        /// The closure's own parameters, excluding by-ref environments.
        parameter_count: usize,
        /// Value environments passed as trailing by-ref parameters.
        by_ref_environments: Vec<SynthesizedIdentity>,
        /// `New` whenever the method has never had a row in `container`.
        row: RowAction,
    },
    /// Static field caching a singleton-hosted closure's delegate.
    CacheField {
        identity: SynthesizedIdentity,
        /// The singleton the field lives in.
        container: SynthesizedIdentity,
        row: RowAction,
    },
}

impl Declaration {
    pub fn identity(&self) -> &SynthesizedIdentity {
        match self {
            Declaration::Environment { identity, .. }
            | Declaration::Singleton { identity, .. }
            | Declaration::ClosureMethod { identity, .. }
            | Declaration::CacheField { identity, .. } => identity,
        }
    }

    pub fn row(&self) -> RowAction {
        match self {
            Declaration::Environment { row, .. }
            | Declaration::Singleton { row, .. }
            | Declaration::ClosureMethod { row, .. }
            | Declaration::CacheField { row, .. } => *row,
        }
    }
}

/// Storage location of a variable after lowering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Home {
    /// Ordinary local or parameter slot.
    Frame,
    /// A field of an environment instance.
    EnvironmentField {
        environment: SynthesizedIdentity,
        field: String,
        mode: CaptureMode,
    },
    /// `this` of the enclosing member.
    EnclosingInstance,
}

/// Where one variable of the new tree lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableHome {
    pub marker: SyntaxMarker,
    pub name: String,
    pub home: Home,
}

/// An environment instantiated on entry to a scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentInstance {
    pub identity: SynthesizedIdentity,
    /// Scope whose entry creates the instance.
    pub scope: SyntaxMarker,
    pub representation: Representation,
    /// Environment stored in the parent link, if any.
    pub parent: Option<SynthesizedIdentity>,
    /// Whether `this` is copied in on creation.
    pub captures_this: bool,
}

/// Object a closure's delegate is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Receiver {
    /// The singleton's shared instance.
    Singleton(SynthesizedIdentity),
    /// `this` of the enclosing member.
    EnclosingInstance,
    /// The innermost live instance of this environment.
    Environment(SynthesizedIdentity),
}

/// How to create one closure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosureSite {
    /// The closure expression in the new tree.
    pub marker: SyntaxMarker,
    /// Synthesized method holding the body.
    pub method: SynthesizedIdentity,
    pub receiver: Receiver,
    /// Value environments to pass by reference, outermost first.
    pub by_ref_arguments: Vec<SynthesizedIdentity>,
    /// Field to load the delegate from before creating a new one.
    pub cache_field: Option<SynthesizedIdentity>,
}

/// Instructions for rewriting one lowered method body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewritePlan {
    pub member: MemberKey,
    /// In scope preorder.
    pub environments: Vec<EnvironmentInstance>,
    /// Every variable of the body, in declaration order.
    pub variables: Vec<VariableHome>,
    pub closures: Vec<ClosureSite>,
}

impl RewritePlan {
    pub fn home_of(&self, marker: SyntaxMarker) -> Option<&Home> {
        self.variables
            .iter()
            .find(|v| v.marker == marker)
            .map(|v| &v.home)
    }

    pub fn closure_at(&self, marker: SyntaxMarker) -> Option<&ClosureSite> {
        self.closures.iter().find(|c| c.marker == marker)
    }
}

/// Classification of one entity, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityReport {
    /// Rendered member key, or the type name for a singleton.
    pub member: String,
    pub kind: EntityKind,
    pub identity: SynthesizedIdentity,
    /// Position in the new tree, or in the old one for retired entities.
    pub marker: Option<SyntaxMarker>,
    pub classification: Classification,
}

/// Output of one generation.
#[derive(Debug, Clone)]
pub struct Delta {
    /// Generation this delta produces.
    pub generation: Generation,
    pub declarations: Vec<Declaration>,
    /// One per inserted or updated member.
    pub rewrites: Vec<RewritePlan>,
    pub reports: Vec<EntityReport>,
    /// State to resume the session from after this delta.
    pub snapshot: Arc<GenerationSnapshot>,
}

impl Delta {
    pub fn count(&self, classification: Classification) -> usize {
        self.reports
            .iter()
            .filter(|r| r.classification == classification)
            .count()
    }

    /// Report for the entity with the given metadata name.
    pub fn report(&self, metadata_name: &str) -> Option<&EntityReport> {
        self.reports
            .iter()
            .find(|r| r.identity.metadata_name() == metadata_name)
    }

    pub fn declaration(&self, metadata_name: &str) -> Option<&Declaration> {
        self.declarations
            .iter()
            .find(|d| d.identity().metadata_name() == metadata_name)
    }

    pub fn rewrite(&self, member: &MemberKey) -> Option<&RewritePlan> {
        self.rewrites.iter().find(|p| &p.member == member)
    }

    /// Declarations that need new metadata rows.
    pub fn new_rows(&self) -> impl Iterator<Item = &Declaration> {
        self.declarations.iter().filter(|d| d.row() == RowAction::New)
    }
}

/// An identity resolved for this generation.
#[derive(Debug, Clone)]
pub(crate) struct Resolved {
    pub identity: SynthesizedIdentity,
    pub classification: Classification,
    pub row: RowAction,
}

impl Resolved {
    pub fn added(identity: SynthesizedIdentity) -> Self {
        Self {
            identity,
            classification: Classification::Added,
            row: RowAction::New,
        }
    }

    pub fn matched(identity: SynthesizedIdentity) -> Self {
        Self {
            identity,
            classification: Classification::Matched,
            row: RowAction::Existing,
        }
    }
}

/// A method whose entities all have identities.
pub(crate) struct ResolvedMethod<'a> {
    pub body: &'a MethodBody,
    pub analysis: &'a MethodAnalysis,
    pub map: &'a SyntaxMap,
    pub previous: Option<&'a MethodSnapshot>,
    pub environments: Vec<Resolved>,
    pub closures: Vec<Resolved>,
    pub cache_fields: Vec<Option<Resolved>>,
    pub singleton: Option<SynthesizedIdentity>,
}

pub(crate) struct EmittedMethod {
    pub declarations: Vec<Declaration>,
    pub plan: RewritePlan,
    pub reports: Vec<EntityReport>,
    pub snapshot: MethodSnapshot,
}

impl ResolvedMethod<'_> {
    pub fn emit(self) -> EmittedMethod {
        let body = self.body;
        let layout = &self.analysis.layout;
        let captures = &self.analysis.captures;
        let member = body.member();
        let member_name = member.to_string();

        let env_identity = |index: usize| self.environments[index].identity.clone();

        let mut declarations = Vec::new();
        let mut reports = Vec::new();
        let mut env_records = Vec::new();
        let mut instances = Vec::new();
        let mut homes: BTreeMap<_, Home> = BTreeMap::new();

        for (env, resolved) in layout.environments().iter().zip(&self.environments) {
            let field_names = self.field_names(env.variables.as_slice(), resolved);
            let parent = env.parent.map(|p| env_identity(p.index()));

            let mut fields = Vec::new();
            let mut residents = Vec::new();
            for (&variable, name) in env.variables.iter().zip(field_names) {
                let decl = body.variable(variable);
                let mode = captures
                    .variable(variable)
                    .map_or(CaptureMode::ByValue, |c| c.mode);
                fields.push(FieldDecl {
                    name: name.clone(),
                    kind: FieldKind::Variable {
                        marker: decl.marker,
                        mode,
                    },
                });
                residents.push(CapturedVariableRecord {
                    marker: decl.marker,
                    name: decl.name.clone(),
                    field: name.clone(),
                    kind: decl.kind,
                    scope: body.scope(decl.scope).marker,
                    mode,
                });
                homes.insert(
                    variable,
                    Home::EnvironmentField {
                        environment: resolved.identity.clone(),
                        field: name,
                        mode,
                    },
                );
            }
            if env.captures_this {
                fields.push(FieldDecl {
                    name: THIS_FIELD.to_string(),
                    kind: FieldKind::This,
                });
            }
            if let Some(parent) = &parent {
                fields.push(FieldDecl {
                    name: PARENT_FIELD.to_string(),
                    kind: FieldKind::Parent(parent.clone()),
                });
            }

            let scope = body.scope(env.scope).marker;
            declarations.push(Declaration::Environment {
                identity: resolved.identity.clone(),
                owner_type: member.type_name.clone(),
                representation: env.representation,
                fields,
                row: resolved.row,
            });
            reports.push(EntityReport {
                member: member_name.clone(),
                kind: EntityKind::Environment,
                identity: resolved.identity.clone(),
                marker: Some(scope),
                classification: resolved.classification,
            });
            instances.push(EnvironmentInstance {
                identity: resolved.identity.clone(),
                scope,
                representation: env.representation,
                parent: parent.clone(),
                captures_this: env.captures_this,
            });
            env_records.push(EnvironmentRecord {
                identity: resolved.identity.clone(),
                scope,
                residents,
                representation: env.representation,
                captures_this: env.captures_this,
                parent,
            });
        }

        let mut sites = Vec::new();
        let mut closure_records = Vec::new();
        let closures = layout.closures().iter().zip(&self.closures).zip(&self.cache_fields);
        for ((closure, resolved), cache) in closures {
            let decl = body.closure(closure.closure);
            let (container, receiver, host_record) = match closure.host {
                ClosureHost::Singleton => match &self.singleton {
                    Some(singleton) => (
                        Container::Singleton(singleton.clone()),
                        Receiver::Singleton(singleton.clone()),
                        HostRecord::Singleton,
                    ),
                    // The session mints the singleton before emitting any
                    // method with a singleton-hosted closure.
                    None => (
                        Container::Type(member.type_name.clone()),
                        Receiver::EnclosingInstance,
                        HostRecord::Singleton,
                    ),
                },
                ClosureHost::InstanceOnType => (
                    Container::Type(member.type_name.clone()),
                    Receiver::EnclosingInstance,
                    HostRecord::TypeInstance,
                ),
                ClosureHost::InstanceOnEnvironment(env) => {
                    let identity = env_identity(env.index());
                    (
                        Container::Environment(identity.clone()),
                        Receiver::Environment(identity.clone()),
                        HostRecord::Environment(identity),
                    )
                }
            };
            let by_ref: Vec<_> = closure
                .by_ref_environments
                .iter()
                .map(|env| env_identity(env.index()))
                .collect();

            // A method row exists only in the containers it was emitted in.
            let mut emitted_in = self
                .previous
                .filter(|_| resolved.classification != Classification::Added)
                .and_then(|previous| {
                    previous
                        .closures
                        .iter()
                        .find(|record| record.identity == resolved.identity)
                })
                .map(|record| record.emitted_in.clone())
                .unwrap_or_default();
            let row = if emitted_in.contains(&container) {
                resolved.row
            } else {
                emitted_in.push(container.clone());
                RowAction::New
            };

            declarations.push(Declaration::ClosureMethod {
                identity: resolved.identity.clone(),
                container,
                parameter_count: decl.params.len(),
                by_ref_environments: by_ref.clone(),
                row,
            });
            reports.push(EntityReport {
                member: member_name.clone(),
                kind: decl.kind.into(),
                identity: resolved.identity.clone(),
                marker: Some(decl.marker),
                classification: resolved.classification,
            });

            let cache_field = cache.as_ref().map(|field| field.identity.clone());
            if let (Some(field), Some(singleton)) = (cache, &self.singleton) {
                declarations.push(Declaration::CacheField {
                    identity: field.identity.clone(),
                    container: singleton.clone(),
                    row: field.row,
                });
                reports.push(EntityReport {
                    member: member_name.clone(),
                    kind: EntityKind::CacheField,
                    identity: field.identity.clone(),
                    marker: Some(decl.marker),
                    classification: field.classification,
                });
            }

            sites.push(ClosureSite {
                marker: decl.marker,
                method: resolved.identity.clone(),
                receiver,
                by_ref_arguments: by_ref,
                cache_field: cache_field.clone(),
            });
            let captured = captures.closure(closure.closure);
            closure_records.push(ClosureRecord {
                identity: resolved.identity.clone(),
                marker: decl.marker,
                kind: decl.kind,
                host: host_record,
                captured: captured
                    .variables
                    .iter()
                    .map(|v| body.variable(*v).marker)
                    .collect(),
                captures_this: captured.captures_this,
                parameter_count: decl.params.len(),
                escapes: closure.escapes,
                cache_field,
                emitted_in,
            });
        }

        let variables = body
            .variables()
            .iter()
            .map(|decl| VariableHome {
                marker: decl.marker,
                name: decl.name.clone(),
                home: if decl.kind == VariableKind::This {
                    Home::EnclosingInstance
                } else {
                    homes.remove(&decl.id).unwrap_or(Home::Frame)
                },
            })
            .collect();

        EmittedMethod {
            declarations,
            plan: RewritePlan {
                member: member.clone(),
                environments: instances,
                variables,
                closures: sites,
            },
            reports,
            snapshot: MethodSnapshot {
                member: member.clone(),
                environments: env_records,
                closures: closure_records,
            },
        }
    }

    /// Field names of an environment's residents.
    ///
    /// A reused environment keeps the field names it shipped with. New ones
    /// use the source name, disambiguating repeats from sibling scopes.
    fn field_names(&self, variables: &[VariableId], env: &Resolved) -> Vec<String> {
        let shipped = self
            .previous
            .filter(|_| env.classification != Classification::Added)
            .and_then(|previous| {
                previous
                    .environments
                    .iter()
                    .find(|record| record.identity == env.identity)
            });

        let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
        variables
            .iter()
            .map(|&variable| {
                let decl = self.body.variable(variable);
                let old_field = shipped.and_then(|record| {
                    let old_marker = self.map.backward(NodeKind::Variable, decl.marker)?;
                    record
                        .residents
                        .iter()
                        .find(|r| r.marker == old_marker)
                        .map(|r| r.field.clone())
                });
                if let Some(field) = old_field {
                    return field;
                }
                let count = seen.entry(decl.name.as_str()).or_insert(0);
                *count += 1;
                if *count == 1 {
                    decl.name.clone()
                } else {
                    format!("<{}>{}", decl.name, *count - 1)
                }
            })
            .collect()
    }
}
