//! # encc
//!
//! Closure lowering and cross-generation identity engine for edit-and-continue.
//!
//! When a running program is edited, the compiler emits a metadata delta and
//! new method bodies. Closures that were already running (lambdas, local
//! functions, query-clause helpers) and the synthesized environments holding
//! their captured variables must keep their identity across the edit, while
//! closures introduced by the edit need fresh names that can never collide with
//! anything shipped in an earlier generation.
//!
//! ## Pipeline
//!
//! ```text
//! MethodBody ─▶ capture ─▶ environment ─▶ matcher ─▶ naming ─▶ Delta
//!  (scope)      analysis    allocation    (previous   (per-type   (declarations,
//!                                          snapshot)   ordinals)   rewrite plans,
//!                                                                  reports)
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use encc::{EditSession, EngineConfig, MemberKey, MethodBodyBuilder, SyntaxMarker};
//!
//! let mut body = MethodBodyBuilder::new(
//!     MemberKey::new("Widget", "Render", "()"),
//!     SyntaxMarker::new(0),
//! );
//! let root = body.root();
//! let x = body.local(root, "x", SyntaxMarker::new(1));
//! let lambda = body.lambda(root, SyntaxMarker::new(2));
//! body.reads(lambda, x);
//! let body = body.finish().unwrap();
//!
//! let (session, delta) = EditSession::baseline(EngineConfig::default(), vec![body]).unwrap();
//! assert_eq!(session.generation().index(), 0);
//! assert_eq!(delta.declarations.len(), 2);
//! ```
//!
//! ## Module Overview
//!
//! - [`syntax`] - Syntax markers and the old-to-new syntax correspondence
//! - [`scope`] - Method body model: scopes, variables, closures
//! - [`closure`] - Capture analysis, environment allocation, representation policy
//! - [`delta`] - Matching, naming, snapshots, emission plans and the edit session
//! - [`config`] - Engine configuration
//! - [`diagnostics`] - Error taxonomy

pub mod closure;
pub mod config;
pub mod delta;
pub mod diagnostics;
pub mod scope;
pub mod syntax;

pub use closure::{
    CaptureAnalysis, CaptureMode, ClosureHost, EnvId, EnvironmentLayout, HostClass, Representation,
};
pub use config::{ConfigError, EngineConfig};
pub use delta::{
    Classification, Declaration, Delta, Edit, EditSession, EntityKind, EntityReport, Generation,
    GenerationSnapshot, NameAllocator, ReusePolicy, RewritePlan, SynthesizedIdentity,
};
pub use diagnostics::{EditError, ErrorCode, ModelError, Rejection, UnsupportedReason};
pub use scope::{
    Access, ClosureId, ClosureKind, MemberKey, MethodBody, MethodBodyBuilder, ScopeId, VariableId,
    VariableKind,
};
pub use syntax::{NodeKind, SyntaxMap, SyntaxMarker};
