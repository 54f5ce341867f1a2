//! # Synthesized Name Allocation
//!
//! Mints identities for entities introduced by an edit.
//!
//! Ordinal state is kept per owning type:
//!
//! - every member that received synthesized entities has a member ordinal;
//!   a member introduced by an edit (a new or re-added overload among them)
//!   gets a fresh one, so its ordinals can never meet older ones
//! - within a member, environments and closures draw local ordinals from two
//!   monotonic counters that are never reset; cache fields reuse the ordinals
//!   of their closure
//! - every identity ever minted in the type is remembered
//!
//! Minting for an edit is staged against copies of the affected types' state
//! and only written back when the whole edit succeeded. Only the types locked
//! for the edit can be minted in.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::identity::{EntityKind, Generation, SynthesizedIdentity};
use super::snapshot::GenerationSnapshot;
use crate::diagnostics::EditError;
use crate::scope::{ClosureKind, MemberKey};

/// Ordinal counters of one member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberOrdinals {
    pub member_ordinal: u32,
    pub next_environment: u32,
    pub next_closure: u32,
}

/// Ordinal state of one type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeOrdinals {
    pub next_member_ordinal: u32,
    /// Live members, keyed by [`MemberKey::member_key`].
    pub members: BTreeMap<String, MemberOrdinals>,
    /// Every identity ever minted in this type.
    pub minted: BTreeSet<SynthesizedIdentity>,
    /// The per-type singleton, once minted.
    pub singleton: Option<SynthesizedIdentity>,
}

impl TypeOrdinals {
    fn member_mut(&mut self, key: String) -> &mut MemberOrdinals {
        let next = &mut self.next_member_ordinal;
        self.members.entry(key).or_insert_with(|| {
            let ordinals = MemberOrdinals {
                member_ordinal: *next,
                next_environment: 0,
                next_closure: 0,
            };
            *next += 1;
            ordinals
        })
    }
}

/// Per-type ordinal state owned by an edit session.
#[derive(Debug, Default)]
pub struct NameAllocator {
    types: RwLock<BTreeMap<String, Arc<Mutex<TypeOrdinals>>>>,
}

impl NameAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-create the allocator state recorded in a snapshot.
    pub fn from_snapshot(snapshot: &GenerationSnapshot) -> Self {
        let types = snapshot
            .types
            .iter()
            .map(|(name, ty)| (name.clone(), Arc::new(Mutex::new(ty.ordinals.clone()))))
            .collect();
        Self {
            types: RwLock::new(types),
        }
    }

    /// Copy of a type's current state.
    pub fn ordinals(&self, type_name: &str) -> Option<TypeOrdinals> {
        let types = self.types.read();
        types.get(type_name).map(|state| state.lock().clone())
    }

    pub fn is_minted(&self, type_name: &str, identity: &SynthesizedIdentity) -> bool {
        let types = self.types.read();
        types
            .get(type_name)
            .is_some_and(|state| state.lock().minted.contains(identity))
    }

    /// Run `f` against staged copies of the given types' state.
    ///
    /// The types are locked in name order for the duration of the call. If
    /// `f` fails nothing is written back.
    pub fn mint<R>(
        &self,
        generation: Generation,
        type_names: &BTreeSet<String>,
        f: impl FnOnce(&mut MintScope<'_>) -> Result<R, EditError>,
    ) -> Result<R, EditError> {
        let handles: Vec<(String, Arc<Mutex<TypeOrdinals>>)> = {
            let mut types = self.types.write();
            type_names
                .iter()
                .map(|name| (name.clone(), Arc::clone(types.entry(name.clone()).or_default())))
                .collect()
        };

        let mut guards: Vec<_> = handles.iter().map(|(name, state)| (name, state.lock())).collect();
        let mut staged: BTreeMap<String, TypeOrdinals> = guards
            .iter()
            .map(|(name, guard)| ((*name).clone(), (**guard).clone()))
            .collect();

        let mut scope = MintScope {
            generation,
            staged: &mut staged,
        };
        let result = f(&mut scope)?;

        for (name, guard) in &mut guards {
            if let Some(state) = staged.remove(name.as_str()) {
                **guard = state;
            }
        }

        Ok(result)
    }
}

/// Staged minting for one edit.
pub struct MintScope<'a> {
    generation: Generation,
    staged: &'a mut BTreeMap<String, TypeOrdinals>,
}

impl MintScope<'_> {
    pub fn generation(&self) -> Generation {
        self.generation
    }

    fn state(&mut self, type_name: &str) -> Result<&mut TypeOrdinals, EditError> {
        self.staged
            .get_mut(type_name)
            .ok_or_else(|| EditError::TypeNotStaged {
                type_name: type_name.to_string(),
            })
    }

    /// Member ordinal of `member`. A `fresh` member always receives a new one.
    pub fn enter_member(&mut self, member: &MemberKey, fresh: bool) -> Result<u32, EditError> {
        let state = self.state(&member.type_name)?;
        let key = member.member_key();
        if fresh {
            state.members.remove(&key);
        }
        Ok(state.member_mut(key).member_ordinal)
    }

    /// Forget a deleted member's counters. Its minted identities stay reserved.
    pub fn retire_member(&mut self, member: &MemberKey) -> Result<(), EditError> {
        let key = member.member_key();
        self.state(&member.type_name)?.members.remove(&key);
        Ok(())
    }

    pub fn environment(&mut self, member: &MemberKey) -> Result<SynthesizedIdentity, EditError> {
        let generation = self.generation.suffix();
        let state = self.state(&member.type_name)?;
        let ordinals = state.member_mut(member.member_key());
        let identity = SynthesizedIdentity {
            kind: EntityKind::Environment,
            base_name: member.name.clone(),
            label: None,
            member_ordinal: ordinals.member_ordinal,
            local_ordinal: ordinals.next_environment,
            generic_arity: member.generic_arity,
            generation,
        };
        ordinals.next_environment += 1;
        self.reserve(&member.type_name, identity)
    }

    pub fn closure(
        &mut self,
        member: &MemberKey,
        kind: ClosureKind,
        label: Option<&str>,
        generic_arity: u32,
    ) -> Result<SynthesizedIdentity, EditError> {
        let generation = self.generation.suffix();
        let state = self.state(&member.type_name)?;
        let ordinals = state.member_mut(member.member_key());
        let identity = SynthesizedIdentity {
            kind: kind.into(),
            base_name: member.name.clone(),
            label: label.map(str::to_string),
            member_ordinal: ordinals.member_ordinal,
            local_ordinal: ordinals.next_closure,
            generic_arity,
            generation,
        };
        ordinals.next_closure += 1;
        self.reserve(&member.type_name, identity)
    }

    /// Cache field for the delegate of a singleton-hosted closure.
    pub fn cache_field(
        &mut self,
        type_name: &str,
        closure: &SynthesizedIdentity,
    ) -> Result<SynthesizedIdentity, EditError> {
        let identity = SynthesizedIdentity {
            kind: EntityKind::CacheField,
            base_name: closure.base_name.clone(),
            label: None,
            member_ordinal: closure.member_ordinal,
            local_ordinal: closure.local_ordinal,
            generic_arity: 0,
            generation: self.generation.suffix(),
        };
        self.reserve(type_name, identity)
    }

    /// The type's singleton, minting it on first use. The flag is true when
    /// this call minted it.
    pub fn singleton(&mut self, type_name: &str) -> Result<(SynthesizedIdentity, bool), EditError> {
        if let Some(existing) = &self.state(type_name)?.singleton {
            return Ok((existing.clone(), false));
        }
        let identity = SynthesizedIdentity {
            kind: EntityKind::Singleton,
            base_name: String::new(),
            label: None,
            member_ordinal: 0,
            local_ordinal: 0,
            generic_arity: 0,
            generation: self.generation.suffix(),
        };
        let identity = self.reserve(type_name, identity)?;
        self.state(type_name)?.singleton = Some(identity.clone());
        Ok((identity, true))
    }

    fn reserve(
        &mut self,
        type_name: &str,
        identity: SynthesizedIdentity,
    ) -> Result<SynthesizedIdentity, EditError> {
        let state = self.state(type_name)?;
        if !state.minted.insert(identity.clone()) {
            return Err(EditError::OrdinalCollision {
                type_name: type_name.to_string(),
                identity: identity.metadata_name(),
            });
        }
        trace!(type_name, identity = %identity, "minted");
        Ok(identity)
    }
}
