//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use encc::{
    Delta, EditSession, EngineConfig, MemberKey, MethodBody, MethodBodyBuilder, SyntaxMap,
    SyntaxMarker,
};

/// Route engine logs to the test harness. `RUST_LOG` wins over `ENCC_LOG_LEVEL`.
pub fn init_tracing() {
    let directive = EngineConfig::from_env().log.level.directive();
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(directive));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

pub fn m(index: u32) -> SyntaxMarker {
    SyntaxMarker::new(index)
}

pub fn render() -> MemberKey {
    MemberKey::new("Widget", "Render", "()")
}

/// Map every marker of `body` onto itself.
pub fn same_positions(body: &MethodBody) -> SyntaxMap {
    let markers = body
        .scopes()
        .iter()
        .map(|s| s.marker)
        .chain(body.variables().iter().map(|v| v.marker))
        .chain(body.closures().iter().map(|c| c.marker));
    SyntaxMap::identity(markers)
}

/// Map the given markers onto themselves.
pub fn positions(markers: &[u32]) -> SyntaxMap {
    SyntaxMap::identity(markers.iter().copied().map(SyntaxMarker::new))
}

/// `void Render() { int x; F(() => x); }`
pub fn single_lambda() -> MethodBody {
    let mut b = MethodBodyBuilder::new(render(), m(0));
    let root = b.root();
    let x = b.local(root, "x", m(1));
    let lambda = b.lambda(root, m(2));
    b.reads(lambda, x);
    b.finish().unwrap()
}

/// `single_lambda` plus `{ int y; F(() => y); }`
pub fn single_lambda_with_block() -> MethodBody {
    let mut b = MethodBodyBuilder::new(render(), m(0));
    let root = b.root();
    let x = b.local(root, "x", m(1));
    let lambda = b.lambda(root, m(2));
    b.reads(lambda, x);
    let block = b.block(root, m(3));
    let y = b.local(block, "y", m(4));
    let second = b.lambda(block, m(5));
    b.reads(second, y);
    b.finish().unwrap()
}

/// `void Render() { F(() => 1); F(() => 2); }`
pub fn captureless_pair() -> MethodBody {
    let mut b = MethodBodyBuilder::new(render(), m(0));
    let root = b.root();
    b.lambda(root, m(1));
    b.lambda(root, m(2));
    b.finish().unwrap()
}

pub fn baseline(methods: Vec<MethodBody>) -> (EditSession, Delta) {
    init_tracing();
    EditSession::baseline(EngineConfig::default(), methods).unwrap()
}

pub fn names(delta: &Delta) -> Vec<String> {
    delta
        .declarations
        .iter()
        .map(|d| d.identity().metadata_name())
        .collect()
}
