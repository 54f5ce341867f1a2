//! # Closure Lowering Analysis
//!
//! Per-method analysis that runs before any cross-generation matching:
//!
//! 1. [`capture`] finds the captured variables and their capture modes.
//! 2. [`environment`] groups them into environments and hosts every closure.
//! 3. [`representation`] decides which environments can be value types.
//!
//! The result depends only on the method body and the configuration, so the
//! methods of one edit are analyzed independently.

pub mod capture;
pub mod environment;
pub mod representation;

use tracing::{debug, debug_span};

pub use capture::{CaptureAnalysis, CaptureMode, CapturedVariable, ClosureCaptures};
pub use environment::{
    AllocationStats, ClosureHost, ClosureLayout, EnvId, Environment, EnvironmentLayout, HostClass,
};
pub use representation::{EscapeState, Representation};

use crate::config::EnvironmentConfig;
use crate::diagnostics::ModelError;
use crate::scope::MethodBody;

/// Capture analysis and environment layout of one method.
#[derive(Debug, Clone)]
pub struct MethodAnalysis {
    pub captures: CaptureAnalysis,
    pub layout: EnvironmentLayout,
}

impl MethodAnalysis {
    /// Human-readable report of the allocation, for debugging.
    pub fn summary(&self) -> String {
        let stats = &self.layout.stats;
        let mut report = String::new();
        report.push_str(&format!(
            "environments: {} ({} value, {} merged scopes, {} parent links)\n",
            stats.environments, stats.value_environments, stats.merged_scopes, stats.parent_links
        ));
        report.push_str(&format!(
            "closures: {} singleton, {} on type, {} on environment\n",
            stats.singleton_closures, stats.type_closures, stats.environment_closures
        ));
        if stats.by_ref_parameters > 0 {
            report.push_str(&format!("by-ref environment parameters: {}\n", stats.by_ref_parameters));
        }
        report
    }
}

/// Analyze one method body.
pub fn analyze_method(
    body: &MethodBody,
    config: &EnvironmentConfig,
) -> Result<MethodAnalysis, ModelError> {
    let _span = debug_span!("analyze_method", member = %body.member()).entered();

    let captures = capture::analyze(body)?;
    let layout = environment::allocate(body, &captures, config);

    let stats = &layout.stats;
    debug!(
        captured = captures.captured().count(),
        environments = stats.environments,
        merged = stats.merged_scopes,
        value = stats.value_environments,
        singleton = stats.singleton_closures,
        on_type = stats.type_closures,
        on_environment = stats.environment_closures,
        "environments allocated"
    );

    Ok(MethodAnalysis { captures, layout })
}
