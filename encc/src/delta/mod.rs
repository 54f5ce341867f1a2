//! # Delta Emission
//!
//! Everything that spans generations:
//!
//! - [`identity`] - Synthesized identities and their metadata names
//! - [`matcher`] - Pairs the new generation's entities with the previous one
//! - [`naming`] - Per-type ordinal state and minting
//! - [`snapshot`] - What each generation shipped, persisted between sessions
//! - [`plan`] - Declarations and rewrite plans handed to the writers
//! - [`session`] - Drives analysis, matching and minting for one edit

pub mod identity;
pub mod matcher;
pub mod naming;
pub mod plan;
pub mod session;
pub mod snapshot;

pub use identity::{EntityKind, Generation, SynthesizedIdentity, PARENT_FIELD, THIS_FIELD};
pub use matcher::{match_method, MethodMatch, ReuseAction, ReusePolicy};
pub use naming::{MemberOrdinals, MintScope, NameAllocator, TypeOrdinals};
pub use plan::{
    Classification, ClosureSite, Container, Declaration, Delta, EntityReport, EnvironmentInstance,
    FieldDecl, FieldKind, Home, Receiver, RewritePlan, RowAction, VariableHome,
};
pub use session::{Edit, EditSession, MethodEdit};
pub use snapshot::{
    CapturedVariableRecord, ClosureRecord, EnvironmentRecord, GenerationSnapshot, HostRecord,
    MethodSnapshot, SnapshotError, SnapshotFingerprint, TypeSnapshot, SNAPSHOT_FORMAT_VERSION,
};
