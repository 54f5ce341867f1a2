//! # Generation Snapshots
//!
//! Everything a generation shipped: per type, the environments and closures
//! of every member, plus the ordinal state needed to keep minting without
//! collisions. A published snapshot is immutable and shared as
//! `Arc<GenerationSnapshot>`.
//!
//! ## Persistence
//!
//! Snapshots are stored as JSON together with a BLAKE3 fingerprint of their
//! canonical serialization. Maps are ordered (`BTreeMap`), so the same
//! snapshot always serializes to the same bytes.
//!
//! ```text
//! { "format_version": 1, "fingerprint": "3f9a…", "snapshot": { … } }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tracing::debug;

use super::identity::{Generation, SynthesizedIdentity};
use super::naming::TypeOrdinals;
use super::plan::Container;
use crate::closure::{CaptureMode, HostClass, Representation};
use crate::diagnostics::ErrorCode;
use crate::scope::{ClosureKind, MemberKey, VariableKind};
use crate::syntax::SyntaxMarker;

/// Format version of persisted snapshots.
/// Increment when changing any serialized record.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Format(String),

    #[error("snapshot format version {found} is not supported (expected {expected})")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("snapshot fingerprint mismatch: recorded {recorded}, computed {computed}")]
    FingerprintMismatch { recorded: String, computed: String },

    #[error("inconsistent snapshot for type `{type_name}`: {message}")]
    Inconsistent { type_name: String, message: String },
}

impl From<serde_json::Error> for SnapshotError {
    fn from(e: serde_json::Error) -> Self {
        SnapshotError::Format(e.to_string())
    }
}

impl SnapshotError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SnapshotError::Io(_) => ErrorCode::SnapshotIo,
            SnapshotError::Format(_) | SnapshotError::Inconsistent { .. } => {
                ErrorCode::SnapshotFormat
            }
            SnapshotError::VersionMismatch { .. } => ErrorCode::SnapshotVersion,
            SnapshotError::FingerprintMismatch { .. } => ErrorCode::SnapshotFingerprint,
        }
    }
}

/// BLAKE3-256 fingerprint of a snapshot's canonical serialization.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SnapshotFingerprint([u8; 32]);

impl SnapshotFingerprint {
    /// Hash bytes with the format version prefix.
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&SNAPSHOT_FORMAT_VERSION.to_le_bytes());
        hasher.update(data);
        Self(*hasher.finalize().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, SnapshotError> {
        let bytes = hex::decode(s).map_err(|e| SnapshotError::Format(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SnapshotError::Format("fingerprint must be 32 bytes".into()))?;
        Ok(Self(bytes))
    }

    /// First 12 hex characters.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Debug for SnapshotFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SnapshotFingerprint({})", self.short())
    }
}

impl fmt::Display for SnapshotFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for SnapshotFingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for SnapshotFingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// A variable resident in a shipped environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedVariableRecord {
    pub marker: SyntaxMarker,
    pub name: String,
    /// Name of the environment field holding it.
    pub field: String,
    pub kind: VariableKind,
    /// Declaring scope.
    pub scope: SyntaxMarker,
    pub mode: CaptureMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentRecord {
    pub identity: SynthesizedIdentity,
    /// Scope whose entry creates the environment.
    pub scope: SyntaxMarker,
    pub residents: Vec<CapturedVariableRecord>,
    pub representation: Representation,
    pub captures_this: bool,
    pub parent: Option<SynthesizedIdentity>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostRecord {
    Singleton,
    TypeInstance,
    Environment(SynthesizedIdentity),
}

impl HostRecord {
    pub fn class(&self) -> HostClass {
        match self {
            HostRecord::Singleton => HostClass::Singleton,
            HostRecord::TypeInstance => HostClass::TypeInstance,
            HostRecord::Environment(_) => HostClass::Environment,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosureRecord {
    pub identity: SynthesizedIdentity,
    pub marker: SyntaxMarker,
    pub kind: ClosureKind,
    pub host: HostRecord,
    /// Markers of the captured variables other than `this`.
    pub captured: Vec<SyntaxMarker>,
    pub captures_this: bool,
    pub parameter_count: usize,
    pub escapes: bool,
    pub cache_field: Option<SynthesizedIdentity>,
    /// Every container the closure's method has a row in, oldest first.
    #[serde(default)]
    pub emitted_in: Vec<Container>,
}

/// What one member shipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodSnapshot {
    pub member: MemberKey,
    pub environments: Vec<EnvironmentRecord>,
    pub closures: Vec<ClosureRecord>,
}

impl MethodSnapshot {
    pub fn closure_at(&self, marker: SyntaxMarker) -> Option<&ClosureRecord> {
        self.closures.iter().find(|c| c.marker == marker)
    }

    /// Resident record of a captured variable, searching every environment.
    pub fn resident(&self, marker: SyntaxMarker) -> Option<&CapturedVariableRecord> {
        self.environments
            .iter()
            .flat_map(|env| env.residents.iter())
            .find(|r| r.marker == marker)
    }

    /// Identities of every entity this member shipped.
    pub fn identities(&self) -> impl Iterator<Item = &SynthesizedIdentity> {
        let environments = self.environments.iter().map(|e| &e.identity);
        let closures = self
            .closures
            .iter()
            .flat_map(|c| std::iter::once(&c.identity).chain(c.cache_field.as_ref()));
        environments.chain(closures)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeSnapshot {
    /// Members keyed by [`MemberKey::member_key`].
    pub members: BTreeMap<String, MethodSnapshot>,
    pub ordinals: TypeOrdinals,
}

/// Everything shipped as of one generation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationSnapshot {
    pub generation: Generation,
    /// Fingerprint of the snapshot this one was derived from.
    pub parent: Option<SnapshotFingerprint>,
    pub types: BTreeMap<String, TypeSnapshot>,
}

#[derive(Serialize)]
struct SnapshotFileRef<'a> {
    format_version: u32,
    fingerprint: SnapshotFingerprint,
    snapshot: &'a GenerationSnapshot,
}

#[derive(Deserialize)]
struct SnapshotHeader {
    format_version: u32,
}

#[derive(Deserialize)]
struct SnapshotFile {
    fingerprint: SnapshotFingerprint,
    snapshot: GenerationSnapshot,
}

impl GenerationSnapshot {
    /// A snapshot that shipped nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn method(&self, member: &MemberKey) -> Option<&MethodSnapshot> {
        self.types
            .get(&member.type_name)
            .and_then(|ty| ty.members.get(&member.member_key()))
    }

    pub fn contains_member(&self, member: &MemberKey) -> bool {
        self.method(member).is_some()
    }

    /// Number of live entities across all types, singletons included.
    pub fn live_count(&self) -> usize {
        self.types
            .values()
            .map(|ty| {
                let members: usize = ty.members.values().map(|m| m.identities().count()).sum();
                members + usize::from(ty.ordinals.singleton.is_some())
            })
            .sum()
    }

    pub fn fingerprint(&self) -> Result<SnapshotFingerprint, SnapshotError> {
        let bytes = serde_json::to_vec(self)?;
        Ok(SnapshotFingerprint::compute(&bytes))
    }

    /// Check the cross-record invariants.
    ///
    /// - live identities are unique within their type
    /// - every live identity was minted in its type
    /// - environment parents and closure hosts name environments of the
    ///   same member
    pub fn validate(&self) -> Result<(), SnapshotError> {
        for (type_name, ty) in &self.types {
            let inconsistent = |message: String| SnapshotError::Inconsistent {
                type_name: type_name.clone(),
                message,
            };

            let mut live = BTreeSet::new();
            for method in ty.members.values() {
                for identity in method.identities() {
                    if !live.insert(identity) {
                        return Err(inconsistent(format!("`{}` is live twice", identity)));
                    }
                    if !ty.ordinals.minted.contains(identity) {
                        return Err(inconsistent(format!("`{}` was never minted", identity)));
                    }
                }

                let environments: BTreeSet<_> =
                    method.environments.iter().map(|e| &e.identity).collect();
                for env in &method.environments {
                    if let Some(parent) = &env.parent {
                        if !environments.contains(parent) {
                            return Err(inconsistent(format!(
                                "parent `{}` of `{}` is not an environment of `{}`",
                                parent, env.identity, method.member
                            )));
                        }
                    }
                }
                for closure in &method.closures {
                    if let HostRecord::Environment(host) = &closure.host {
                        if !environments.contains(host) {
                            return Err(inconsistent(format!(
                                "host `{}` of `{}` is not an environment of `{}`",
                                host, closure.identity, method.member
                            )));
                        }
                    }
                }
            }

            if let Some(singleton) = &ty.ordinals.singleton {
                if !ty.ordinals.minted.contains(singleton) {
                    return Err(inconsistent(format!("`{}` was never minted", singleton)));
                }
            }
        }
        Ok(())
    }

    /// Write the snapshot and its fingerprint to `path`.
    pub fn save(&self, path: &Path) -> Result<SnapshotFingerprint, SnapshotError> {
        let fingerprint = self.fingerprint()?;
        let file = SnapshotFileRef {
            format_version: SNAPSHOT_FORMAT_VERSION,
            fingerprint,
            snapshot: self,
        };
        let json = serde_json::to_string_pretty(&file)?;
        fs::write(path, json)?;
        debug!(path = %path.display(), generation = %self.generation, fingerprint = %fingerprint.short(), "snapshot saved");
        Ok(fingerprint)
    }

    /// Read a snapshot written by [`GenerationSnapshot::save`], verifying
    /// its version, fingerprint and invariants.
    pub fn load(path: &Path) -> Result<Self, SnapshotError> {
        let content = fs::read_to_string(path)?;

        let header: SnapshotHeader = serde_json::from_str(&content)?;
        if header.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(SnapshotError::VersionMismatch {
                expected: SNAPSHOT_FORMAT_VERSION,
                found: header.format_version,
            });
        }

        let file: SnapshotFile = serde_json::from_str(&content)?;
        let computed = file.snapshot.fingerprint()?;
        if computed != file.fingerprint {
            return Err(SnapshotError::FingerprintMismatch {
                recorded: file.fingerprint.to_hex(),
                computed: computed.to_hex(),
            });
        }
        file.snapshot.validate()?;

        debug!(path = %path.display(), generation = %file.snapshot.generation, "snapshot loaded");
        Ok(file.snapshot)
    }
}
