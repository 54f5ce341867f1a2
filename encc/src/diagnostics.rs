//! Error taxonomy.
//!
//! # Error Codes
//!
//! Codes are stable across releases and organized by category:
//!
//! - **ENC0001-ENC0099**: Malformed input trees and syntax maps
//! - **ENC0100-ENC0199**: Rejected or inconsistent edits
//! - **ENC0200-ENC0299**: Snapshot persistence
//! - **ENC0300-ENC0399**: Configuration

use std::fmt;

use thiserror::Error;

use crate::closure::HostClass;
use crate::config::ConfigError;
use crate::delta::{Generation, SnapshotError};
use crate::scope::{ClosureId, ClosureKind, ScopeId, VariableId};
use crate::syntax::{NodeKind, SyntaxMarker};

/// Engine error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // ============================================================
    // Input model errors (ENC0001-ENC0099)
    // ============================================================
    UnknownScope = 1,
    UnknownVariable = 2,
    UnknownClosure = 3,
    MalformedScope = 4,
    DuplicateVariable = 5,
    DuplicateMarker = 6,
    // 7 is retired.
    StaticClosureCaptures = 8,
    VariableNotInScope = 9,
    AmbiguousCorrespondence = 10,

    // ============================================================
    // Edit errors (ENC0100-ENC0199)
    // ============================================================
    UnsupportedEdit = 100,
    OrdinalCollision = 101,
    StaleBaseline = 102,
    UnknownMember = 103,
    DuplicateMember = 104,
    TypeNotStaged = 105,

    // ============================================================
    // Snapshot errors (ENC0200-ENC0299)
    // ============================================================
    SnapshotIo = 200,
    SnapshotFormat = 201,
    SnapshotVersion = 202,
    SnapshotFingerprint = 203,

    // ============================================================
    // Configuration errors (ENC0300-ENC0399)
    // ============================================================
    InvalidConfig = 300,
}

impl ErrorCode {
    /// Rendered code, e.g. `ENC0100`.
    pub fn as_str(&self) -> String {
        format!("ENC{:04}", *self as u16)
    }

    pub fn description(&self) -> &'static str {
        match self {
            ErrorCode::UnknownScope => "reference to a scope that does not exist",
            ErrorCode::UnknownVariable => "reference to a variable that does not exist",
            ErrorCode::UnknownClosure => "reference to a closure that does not exist",
            ErrorCode::MalformedScope => "scope tree is not well formed",
            ErrorCode::DuplicateVariable => "variable declared in more than one scope",
            ErrorCode::DuplicateMarker => "syntax marker used by two nodes",
            ErrorCode::StaticClosureCaptures => "static closure captures a variable",
            ErrorCode::VariableNotInScope => "closure references a variable it cannot see",
            ErrorCode::AmbiguousCorrespondence => "syntax marker mapped more than once",
            ErrorCode::UnsupportedEdit => "edit cannot be applied to the running program",
            ErrorCode::OrdinalCollision => "synthesized identity would be minted twice",
            ErrorCode::StaleBaseline => "edit is based on an outdated generation",
            ErrorCode::UnknownMember => "edit updates or deletes a member that was never emitted",
            ErrorCode::DuplicateMember => "member appears more than once in an edit",
            ErrorCode::TypeNotStaged => "identity minted in a type the edit did not lock",
            ErrorCode::SnapshotIo => "snapshot could not be read or written",
            ErrorCode::SnapshotFormat => "snapshot is not valid JSON for this format",
            ErrorCode::SnapshotVersion => "snapshot was written by an incompatible format version",
            ErrorCode::SnapshotFingerprint => "snapshot contents do not match their fingerprint",
            ErrorCode::InvalidConfig => "invalid engine configuration",
        }
    }

    pub fn help(&self) -> Option<&'static str> {
        match self {
            ErrorCode::UnsupportedEdit => {
                Some("restart the program to apply this change, or revert the closure's shape")
            }
            ErrorCode::OrdinalCollision | ErrorCode::TypeNotStaged => {
                Some("this is an internal error; please report it")
            }
            ErrorCode::StaleBaseline => {
                Some("recompute the edit against the session's current generation")
            }
            ErrorCode::SnapshotVersion => Some("re-run the baseline build to produce a new snapshot"),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

/// A method body or syntax map that violates the input model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    /// A scope id that is not in the body's arena.
    #[error("unknown scope {scope:?}")]
    UnknownScope { scope: ScopeId },

    /// A variable id that is not in the body's arena.
    #[error("unknown variable {variable:?}")]
    UnknownVariable { variable: VariableId },

    /// A closure id handed to the builder that it never allocated.
    #[error("unknown closure {closure:?}")]
    UnknownClosure { closure: ClosureId },

    /// Parent, owner or ordering links of a scope are inconsistent.
    #[error("malformed scope {scope:?}: {reason}")]
    MalformedScope {
        scope: ScopeId,
        reason: &'static str,
    },

    /// A variable registered in more than one scope.
    #[error("variable `{name}` is declared in more than one scope (seen in {scope:?})")]
    DuplicateVariable { name: String, scope: ScopeId },

    /// Two nodes of the same category share a marker.
    #[error("{category} marker {marker} is used by more than one node")]
    DuplicateMarker {
        category: &'static str,
        marker: SyntaxMarker,
    },

    /// A closure declared `static` references an outer variable.
    #[error("static closure at {closure} captures `{variable}`")]
    StaticClosureCaptures {
        closure: SyntaxMarker,
        variable: String,
    },

    /// A closure references a variable declared outside its enclosing scopes.
    #[error("closure at {closure} references `{variable}`, which is not in scope")]
    VariableNotInScope {
        variable: String,
        closure: SyntaxMarker,
    },

    /// A syntax map pairs a node with two different counterparts.
    #[error("{kind} marker {marker} has more than one counterpart")]
    AmbiguousCorrespondence { kind: NodeKind, marker: SyntaxMarker },
}

impl ModelError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ModelError::UnknownScope { .. } => ErrorCode::UnknownScope,
            ModelError::UnknownVariable { .. } => ErrorCode::UnknownVariable,
            ModelError::UnknownClosure { .. } => ErrorCode::UnknownClosure,
            ModelError::MalformedScope { .. } => ErrorCode::MalformedScope,
            ModelError::DuplicateVariable { .. } => ErrorCode::DuplicateVariable,
            ModelError::DuplicateMarker { .. } => ErrorCode::DuplicateMarker,
            ModelError::StaticClosureCaptures { .. } => ErrorCode::StaticClosureCaptures,
            ModelError::VariableNotInScope { .. } => ErrorCode::VariableNotInScope,
            ModelError::AmbiguousCorrespondence { .. } => ErrorCode::AmbiguousCorrespondence,
        }
    }
}

/// Why a closure edit cannot be applied to running code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnsupportedReason {
    /// A lambda became a local function, or similar.
    ClosureKindChanged {
        old: ClosureKind,
        new: ClosureKind,
    },
    /// The closure's own parameter list changed length.
    ParameterCountChanged {
        old: usize,
        new: usize,
    },
    /// A captured variable that survived the edit now lives in a scope with no
    /// counterpart to its old declaring scope.
    CapturedVariableMoved { variable: String },
    /// The reuse policy rejects the closure's change of host class.
    HostTransitionRejected {
        old: HostClass,
        new: HostClass,
    },
}

impl fmt::Display for UnsupportedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnsupportedReason::ClosureKindChanged { old, new } => {
                write!(f, "changed from a {} to a {}", old.as_str(), new.as_str())
            }
            UnsupportedReason::ParameterCountChanged { old, new } => {
                write!(f, "parameter count changed from {} to {}", old, new)
            }
            UnsupportedReason::CapturedVariableMoved { variable } => {
                write!(f, "captured variable `{}` moved to a different scope", variable)
            }
            UnsupportedReason::HostTransitionRejected { old, new } => {
                write!(f, "closure host changed from {} to {}", old, new)
            }
        }
    }
}

/// One unsupported closure change found while matching an edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Rendered [`MemberKey`](crate::MemberKey) of the edited member.
    pub member: String,
    /// Position of the closure in the new tree.
    pub closure: SyntaxMarker,
    /// Position of its counterpart in the previous tree.
    pub previous: SyntaxMarker,
    pub reason: UnsupportedReason,
}

/// Failure to lower an edit.
#[derive(Debug, Error)]
pub enum EditError {
    /// The edit changes a closure in a way running code cannot follow.
    #[error("unsupported edit in `{member}`: closure at {closure} (previously {previous}) {reason}")]
    Unsupported {
        member: String,
        closure: SyntaxMarker,
        previous: SyntaxMarker,
        reason: UnsupportedReason,
    },

    /// Two entities computed the same identity. Indicates an engine defect.
    #[error("internal error: `{identity}` would be minted twice in type `{type_name}`")]
    OrdinalCollision { type_name: String, identity: String },

    /// The edit was computed against a generation other than the current one.
    #[error("edit is based on generation {requested}, but the session is at generation {current}")]
    StaleBaseline {
        requested: Generation,
        current: Generation,
    },

    /// An update or delete names a member the session never lowered.
    #[error("member `{member}` has no emitted counterpart")]
    UnknownMember { member: String },

    /// A member is named twice, or inserted although it already exists.
    #[error("member `{member}` appears more than once in the edit")]
    DuplicateMember { member: String },

    /// Minting touched a type whose ordinal state was not locked for the
    /// edit. Indicates an engine defect.
    #[error("internal error: type `{type_name}` was not staged for minting")]
    TypeNotStaged { type_name: String },

    /// An input tree or syntax map is malformed.
    #[error(transparent)]
    Model(#[from] ModelError),

    /// Reading, writing or verifying a snapshot failed.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    /// The session was started with an invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl EditError {
    pub fn code(&self) -> ErrorCode {
        match self {
            EditError::Unsupported { .. } => ErrorCode::UnsupportedEdit,
            EditError::OrdinalCollision { .. } => ErrorCode::OrdinalCollision,
            EditError::StaleBaseline { .. } => ErrorCode::StaleBaseline,
            EditError::UnknownMember { .. } => ErrorCode::UnknownMember,
            EditError::DuplicateMember { .. } => ErrorCode::DuplicateMember,
            EditError::TypeNotStaged { .. } => ErrorCode::TypeNotStaged,
            EditError::Model(e) => e.code(),
            EditError::Snapshot(e) => e.code(),
            EditError::Config(e) => e.code(),
        }
    }

    /// Errors caused by the edit's content rather than an engine defect.
    pub fn is_user_facing(&self) -> bool {
        !matches!(
            self,
            EditError::OrdinalCollision { .. } | EditError::TypeNotStaged { .. }
        )
    }
}

impl From<Rejection> for EditError {
    fn from(rejection: Rejection) -> Self {
        EditError::Unsupported {
            member: rejection.member,
            closure: rejection.closure,
            previous: rejection.previous,
            reason: rejection.reason,
        }
    }
}
