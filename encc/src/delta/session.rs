//! # Edit Sessions
//!
//! An [`EditSession`] owns the most recent [`GenerationSnapshot`] and the
//! per-type ordinal state. Each [`Edit`] goes through three phases:
//!
//! 1. **Analysis**: capture analysis and environment allocation, per method,
//!    on scoped worker threads. Results are kept in input order.
//! 2. **Matching**: every method against its previous generation. Any
//!    unsupported change rejects the whole edit here, before anything is
//!    minted.
//! 3. **Minting**: identities for added entities, committed atomically, then
//!    the new snapshot is published.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::thread;

use tracing::{debug, info, info_span, warn, Span};

use super::identity::{EntityKind, Generation, SynthesizedIdentity};
use super::matcher::{self, CacheMatch, ClosureMatch, EnvironmentMatch, MethodMatch};
use super::naming::{MintScope, NameAllocator};
use super::plan::{
    Classification, Declaration, Delta, EmittedMethod, EntityReport, Resolved, ResolvedMethod,
    RowAction,
};
use super::snapshot::{GenerationSnapshot, MethodSnapshot};
use crate::closure::{self, ClosureHost, MethodAnalysis};
use crate::config::EngineConfig;
use crate::diagnostics::{EditError, ModelError};
use crate::scope::{MemberKey, MethodBody};
use crate::syntax::SyntaxMap;

/// A change to one member.
#[derive(Debug, Clone)]
pub enum MethodEdit {
    /// A member that did not exist in the previous generation.
    Insert(MethodBody),
    /// A new body for an existing member.
    Update { body: MethodBody, map: SyntaxMap },
    Delete(MemberKey),
}

impl MethodEdit {
    pub fn member(&self) -> &MemberKey {
        match self {
            MethodEdit::Insert(body) | MethodEdit::Update { body, .. } => body.member(),
            MethodEdit::Delete(member) => member,
        }
    }
}

/// One edit, computed against generation `base`.
#[derive(Debug, Clone)]
pub struct Edit {
    pub base: Generation,
    pub methods: Vec<MethodEdit>,
}

impl Edit {
    pub fn new(base: Generation) -> Self {
        Self {
            base,
            methods: Vec::new(),
        }
    }

    pub fn insert(mut self, body: MethodBody) -> Self {
        self.methods.push(MethodEdit::Insert(body));
        self
    }

    pub fn update(mut self, body: MethodBody, map: SyntaxMap) -> Self {
        self.methods.push(MethodEdit::Update { body, map });
        self
    }

    pub fn delete(mut self, member: MemberKey) -> Self {
        self.methods.push(MethodEdit::Delete(member));
        self
    }
}

/// A method to lower in this edit.
struct Pending<'a> {
    body: &'a MethodBody,
    map: &'a SyntaxMap,
    fresh: bool,
    previous: Option<&'a MethodSnapshot>,
}

/// Cross-generation lowering state of one running program.
#[derive(Debug)]
pub struct EditSession {
    config: EngineConfig,
    names: NameAllocator,
    current: Arc<GenerationSnapshot>,
}

impl EditSession {
    /// Lower the original build (generation 0).
    pub fn baseline(
        config: EngineConfig,
        methods: Vec<MethodBody>,
    ) -> Result<(Self, Delta), EditError> {
        config.validate()?;
        let mut session = Self {
            config,
            names: NameAllocator::new(),
            current: Arc::new(GenerationSnapshot::empty()),
        };
        let edits = methods.into_iter().map(MethodEdit::Insert).collect();
        let delta = session.lower(Generation::BASELINE, edits)?;
        Ok((session, delta))
    }

    /// Continue from a persisted snapshot.
    pub fn resume(config: EngineConfig, snapshot: GenerationSnapshot) -> Result<Self, EditError> {
        config.validate()?;
        snapshot.validate()?;
        info!(generation = %snapshot.generation, types = snapshot.types.len(), "session resumed");
        Ok(Self {
            config,
            names: NameAllocator::from_snapshot(&snapshot),
            current: Arc::new(snapshot),
        })
    }

    pub fn generation(&self) -> Generation {
        self.current.generation
    }

    pub fn snapshot(&self) -> Arc<GenerationSnapshot> {
        Arc::clone(&self.current)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn names(&self) -> &NameAllocator {
        &self.names
    }

    /// Lower an edit into the next generation.
    pub fn apply(&mut self, edit: Edit) -> Result<Delta, EditError> {
        let current = self.current.generation;
        if edit.base != current {
            return Err(EditError::StaleBaseline {
                requested: edit.base,
                current,
            });
        }
        self.lower(current.next(), edit.methods)
    }

    fn lower(&mut self, generation: Generation, edits: Vec<MethodEdit>) -> Result<Delta, EditError> {
        let _span = info_span!("lower_edit", %generation, methods = edits.len()).entered();
        let previous = Arc::clone(&self.current);

        let mut seen = BTreeSet::new();
        for edit in &edits {
            let member = edit.member();
            if !seen.insert(member.clone()) {
                return Err(EditError::DuplicateMember {
                    member: member.to_string(),
                });
            }
            let exists = previous.contains_member(member);
            match edit {
                MethodEdit::Insert(_) if exists => {
                    return Err(EditError::DuplicateMember {
                        member: member.to_string(),
                    });
                }
                MethodEdit::Update { .. } | MethodEdit::Delete(_) if !exists => {
                    return Err(EditError::UnknownMember {
                        member: member.to_string(),
                    });
                }
                _ => {}
            }
        }

        let empty_map = SyntaxMap::new();
        let pending: Vec<Pending<'_>> = edits
            .iter()
            .filter_map(|edit| match edit {
                MethodEdit::Insert(body) => Some(Pending {
                    body,
                    map: &empty_map,
                    fresh: true,
                    previous: None,
                }),
                MethodEdit::Update { body, map } => Some(Pending {
                    body,
                    map,
                    fresh: false,
                    previous: previous.method(body.member()),
                }),
                MethodEdit::Delete(_) => None,
            })
            .collect();
        let deleted: Vec<&MemberKey> = edits
            .iter()
            .filter_map(|edit| match edit {
                MethodEdit::Delete(member) => Some(member),
                _ => None,
            })
            .collect();

        // Phase 1: analysis.
        let bodies: Vec<&MethodBody> = pending.iter().map(|p| p.body).collect();
        let analyses = self.analyze_all(&bodies)?;

        // Phase 2: matching.
        let policy = &self.config.matching.policy;
        let matches: Vec<MethodMatch> = pending
            .iter()
            .zip(&analyses)
            .map(|(p, analysis)| matcher::match_method(p.body, analysis, p.map, p.previous, policy))
            .collect();

        let rejections: Vec<_> = matches.iter().flat_map(|m| m.rejections.iter()).collect();
        if let Some(first) = rejections.first() {
            for rejection in &rejections {
                warn!(
                    member = %rejection.member,
                    closure = %rejection.closure,
                    previous = %rejection.previous,
                    reason = %rejection.reason,
                    "unsupported edit"
                );
            }
            return Err((*first).clone().into());
        }

        let parent = if generation.is_baseline() {
            None
        } else {
            Some(previous.fingerprint()?)
        };

        // Phase 3: minting.
        let type_names: BTreeSet<String> = edits
            .iter()
            .map(|edit| edit.member().type_name.clone())
            .collect();
        let (emitted, singletons) = self.names.mint(generation, &type_names, |scope| {
            for member in &deleted {
                scope.retire_member(member)?;
            }
            let mut singletons: BTreeMap<String, (SynthesizedIdentity, bool)> = BTreeMap::new();
            let mut emitted = Vec::with_capacity(pending.len());
            for ((p, analysis), matched) in pending.iter().zip(&analyses).zip(&matches) {
                let resolved = resolve(scope, p, analysis, matched, &mut singletons)?;
                emitted.push(resolved.emit());
            }
            Ok((emitted, singletons))
        })?;

        let mut declarations = Vec::new();
        let mut reports = Vec::new();
        let mut rewrites = Vec::with_capacity(emitted.len());

        for (type_name, (identity, minted)) in &singletons {
            declarations.push(Declaration::Singleton {
                identity: identity.clone(),
                owner_type: type_name.clone(),
                row: if *minted { RowAction::New } else { RowAction::Existing },
            });
            reports.push(EntityReport {
                member: type_name.clone(),
                kind: EntityKind::Singleton,
                identity: identity.clone(),
                marker: None,
                classification: if *minted {
                    Classification::Added
                } else {
                    Classification::Matched
                },
            });
        }

        let mut types = previous.types.clone();
        for member in &deleted {
            if let Some(method) = previous.method(member) {
                for identity in method.identities() {
                    reports.push(EntityReport {
                        member: member.to_string(),
                        kind: identity.kind,
                        identity: identity.clone(),
                        marker: None,
                        classification: Classification::NoLongerEmitted,
                    });
                }
            }
            if let Some(ty) = types.get_mut(&member.type_name) {
                ty.members.remove(&member.member_key());
            }
        }

        for (matched, method) in matches.iter().zip(emitted) {
            let EmittedMethod {
                declarations: decls,
                plan,
                reports: method_reports,
                snapshot,
            } = method;
            declarations.extend(decls);
            reports.extend(method_reports);
            for retired in &matched.retired {
                reports.push(EntityReport {
                    member: plan.member.to_string(),
                    kind: retired.kind,
                    identity: retired.identity.clone(),
                    marker: retired.marker,
                    classification: Classification::NoLongerEmitted,
                });
            }
            let member = &plan.member;
            types
                .entry(member.type_name.clone())
                .or_default()
                .members
                .insert(member.member_key(), snapshot);
            rewrites.push(plan);
        }

        for type_name in &type_names {
            if let Some(ordinals) = self.names.ordinals(type_name) {
                types.entry(type_name.clone()).or_default().ordinals = ordinals;
            }
        }

        let snapshot = Arc::new(GenerationSnapshot {
            generation,
            parent,
            types,
        });
        self.current = Arc::clone(&snapshot);

        let delta = Delta {
            generation,
            declarations,
            rewrites,
            reports,
            snapshot,
        };
        if self.config.log.entity_reports {
            for report in &delta.reports {
                debug!(
                    member = %report.member,
                    kind = %report.kind,
                    identity = %report.identity,
                    classification = ?report.classification,
                    "entity"
                );
            }
        }
        info!(
            added = delta.count(Classification::Added),
            matched = delta.count(Classification::Matched),
            updated = delta.count(Classification::Updated),
            retired = delta.count(Classification::NoLongerEmitted),
            new_rows = delta.new_rows().count(),
            "edit lowered"
        );
        Ok(delta)
    }

    /// Analyze method bodies, spreading them over the configured threads.
    fn analyze_all(&self, bodies: &[&MethodBody]) -> Result<Vec<MethodAnalysis>, ModelError> {
        let config = &self.config.environments;
        let threads = self.config.analysis.threads.min(bodies.len()).max(1);
        if threads == 1 {
            return bodies
                .iter()
                .map(|body| closure::analyze_method(body, config))
                .collect();
        }

        let chunk = bodies.len().div_ceil(threads);
        let parent = Span::current();
        let results: Vec<Result<Vec<MethodAnalysis>, ModelError>> = thread::scope(|s| {
            let handles: Vec<_> = bodies
                .chunks(chunk)
                .map(|slice| {
                    let span = parent.clone();
                    s.spawn(move || {
                        let _entered = span.enter();
                        slice
                            .iter()
                            .map(|body| closure::analyze_method(body, config))
                            .collect::<Result<Vec<_>, _>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
                })
                .collect()
        });

        let mut analyses = Vec::with_capacity(bodies.len());
        for result in results {
            analyses.extend(result?);
        }
        Ok(analyses)
    }
}

/// Assign identities to every entity of one method.
fn resolve<'a>(
    scope: &mut MintScope<'_>,
    pending: &Pending<'a>,
    analysis: &'a MethodAnalysis,
    matched: &MethodMatch,
    singletons: &mut BTreeMap<String, (SynthesizedIdentity, bool)>,
) -> Result<ResolvedMethod<'a>, EditError> {
    let body = pending.body;
    let member = body.member();
    scope.enter_member(member, pending.fresh)?;

    let singleton = if analysis.layout.uses_singleton() {
        let (identity, minted) = scope.singleton(&member.type_name)?;
        let entry = singletons
            .entry(member.type_name.clone())
            .or_insert_with(|| (identity.clone(), minted));
        entry.1 |= minted;
        Some(identity)
    } else {
        None
    };

    let mut environments = Vec::with_capacity(matched.environments.len());
    for env in &matched.environments {
        environments.push(match env {
            EnvironmentMatch::Reused(identity) => Resolved::matched(identity.clone()),
            EnvironmentMatch::New => Resolved::added(scope.environment(member)?),
        });
    }

    let mut closures = Vec::with_capacity(matched.closures.len());
    let mut cache_fields = Vec::with_capacity(matched.closures.len());
    let layouts = analysis.layout.closures();
    for ((layout, closure), cache) in layouts.iter().zip(&matched.closures).zip(&matched.cache_fields) {
        let resolved = match closure {
            // The row is settled at emission, against the containers the
            // closure was emitted in before.
            ClosureMatch::Reused {
                identity,
                classification,
            } => Resolved {
                identity: identity.clone(),
                classification: *classification,
                row: RowAction::Existing,
            },
            ClosureMatch::New { .. } => {
                let decl = body.closure(layout.closure);
                let arity = match layout.host {
                    ClosureHost::InstanceOnEnvironment(_) => 0,
                    _ => member.generic_arity,
                };
                Resolved::added(scope.closure(member, decl.kind, decl.name.as_deref(), arity)?)
            }
        };
        let cache = match cache {
            CacheMatch::None => None,
            CacheMatch::Reused(identity) => Some(Resolved::matched(identity.clone())),
            CacheMatch::New => Some(Resolved::added(
                scope.cache_field(&member.type_name, &resolved.identity)?,
            )),
        };
        closures.push(resolved);
        cache_fields.push(cache);
    }

    Ok(ResolvedMethod {
        body,
        analysis,
        map: pending.map,
        previous: pending.previous,
        environments,
        closures,
        cache_fields,
        singleton,
    })
}
