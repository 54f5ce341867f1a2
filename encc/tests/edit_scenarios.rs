//! Edit scenarios across generations.
//!
//! Each test lowers a baseline, applies one or more edits through an
//! [`EditSession`], and checks the declarations, rewrite plans and entity
//! reports of every delta.
//!
//! Run:  cargo test -p encc --test edit_scenarios

mod common;

use common::{
    baseline, captureless_pair, m, names, positions, render, same_positions, single_lambda,
    single_lambda_with_block,
};
use encc::delta::{Container, FieldKind, Home, Receiver, ReuseAction, RowAction};
use encc::{
    Classification, ClosureKind, Declaration, Delta, Edit, EditError, EditSession, EngineConfig,
    ErrorCode, Generation, GenerationSnapshot, HostClass, MemberKey, MethodBody,
    MethodBodyBuilder, NodeKind, Representation, SyntaxMap, UnsupportedReason,
};

fn classification(delta: &Delta, name: &str) -> Classification {
    delta
        .report(name)
        .unwrap_or_else(|| panic!("no report for {name}"))
        .classification
}

fn retired(delta: &Delta) -> Vec<String> {
    let mut names: Vec<_> = delta
        .reports
        .iter()
        .filter(|r| r.classification == Classification::NoLongerEmitted)
        .map(|r| r.identity.metadata_name())
        .collect();
    names.sort();
    names
}

/// `void Render() { int x; F(() => x); }` where the lambda captures nothing.
fn lambda_capturing_nothing() -> MethodBody {
    let mut b = MethodBodyBuilder::new(render(), m(0));
    let root = b.root();
    b.local(root, "x", m(1));
    b.lambda(root, m(2));
    b.finish().unwrap()
}

// ============================================================
// Baseline layouts
// ============================================================

#[test]
fn test_baseline_single_lambda() {
    let (session, delta) = baseline(vec![single_lambda()]);

    assert_eq!(session.generation(), Generation::BASELINE);
    assert_eq!(names(&delta), vec!["<>c__Env0_0", "<Render>b__0_0"]);
    assert!(delta.declarations.iter().all(|d| d.row() == RowAction::New));
    assert_eq!(delta.count(Classification::Added), 2);

    let plan = delta.rewrite(&render()).unwrap();
    match plan.home_of(m(1)) {
        Some(Home::EnvironmentField { environment, field, .. }) => {
            assert_eq!(environment.metadata_name(), "<>c__Env0_0");
            assert_eq!(field, "x");
        }
        other => panic!("x should live in the environment, got {other:?}"),
    }
    let site = plan.closure_at(m(2)).unwrap();
    assert!(matches!(&site.receiver, Receiver::Environment(env) if env.metadata_name() == "<>c__Env0_0"));
    assert!(site.cache_field.is_none());
}

#[test]
fn test_this_only_local_function_has_no_environment() {
    let mut b = MethodBodyBuilder::new(render(), m(0));
    let root = b.root();
    let this = b.this().unwrap();
    let helper = b.local_function(root, "Helper", m(1));
    b.reads(helper, this);
    let (_, delta) = baseline(vec![b.finish().unwrap()]);

    assert_eq!(names(&delta), vec!["<Render>g__Helper|0_0"]);
    match &delta.declarations[0] {
        Declaration::ClosureMethod { container, by_ref_environments, .. } => {
            assert_eq!(container, &Container::Type("Widget".into()));
            assert!(by_ref_environments.is_empty());
        }
        other => panic!("expected a closure method, got {other:?}"),
    }
    let plan = delta.rewrite(&render()).unwrap();
    assert!(plan.environments.is_empty());
    assert_eq!(plan.closure_at(m(1)).unwrap().receiver, Receiver::EnclosingInstance);
}

#[test]
fn test_captureless_lambdas_share_one_singleton() {
    let (_, delta) = baseline(vec![captureless_pair()]);

    assert_eq!(
        names(&delta),
        vec!["<>c", "<Render>b__0_0", "<>9__0_0", "<Render>b__0_1", "<>9__0_1"]
    );
    let singletons = delta
        .declarations
        .iter()
        .filter(|d| matches!(d, Declaration::Singleton { .. }))
        .count();
    assert_eq!(singletons, 1);

    for declaration in &delta.declarations {
        match declaration {
            Declaration::ClosureMethod { container, .. } => {
                assert!(matches!(container, Container::Singleton(s) if s.metadata_name() == "<>c"));
            }
            Declaration::CacheField { container, .. } => assert_eq!(container.metadata_name(), "<>c"),
            _ => {}
        }
    }
}

#[test]
fn test_loop_scope_chains_to_outer_environment() {
    let mut b = MethodBodyBuilder::new(render(), m(0));
    let root = b.root();
    let x = b.local(root, "x", m(1));
    let body = b.loop_body(root, m(2));
    let y = b.local(body, "y", m(3));
    let lambda = b.lambda(body, m(4));
    b.reads(lambda, x);
    b.reads(lambda, y);
    let (_, delta) = baseline(vec![b.finish().unwrap()]);

    assert_eq!(names(&delta), vec!["<>c__Env0_0", "<>c__Env0_1", "<Render>b__0_0"]);
    match delta.declaration("<>c__Env0_1").unwrap() {
        Declaration::Environment { fields, .. } => {
            assert_eq!(fields.len(), 2);
            assert_eq!(fields[0].name, "y");
            assert_eq!(fields[1].name, "<>8__parent");
            assert!(matches!(&fields[1].kind, FieldKind::Parent(p) if p.metadata_name() == "<>c__Env0_0"));
        }
        other => panic!("expected an environment, got {other:?}"),
    }
}

#[test]
fn test_local_function_uses_value_environments() {
    let build = || {
        let mut b = MethodBodyBuilder::new(render(), m(0));
        let root = b.root();
        let x = b.local(root, "x", m(1));
        let body = b.loop_body(root, m(2));
        let y = b.local(body, "y", m(3));
        let helper = b.local_function(body, "Sum", m(4));
        b.reads(helper, x);
        b.reads(helper, y);
        b.finish().unwrap()
    };

    let (_, delta) = baseline(vec![build()]);
    for name in ["<>c__Env0_0", "<>c__Env0_1"] {
        match delta.declaration(name).unwrap() {
            Declaration::Environment { representation, fields, .. } => {
                assert_eq!(*representation, Representation::Value);
                assert!(!fields.iter().any(|f| matches!(f.kind, FieldKind::Parent(_))));
            }
            other => panic!("expected an environment, got {other:?}"),
        }
    }
    let site = delta.rewrite(&render()).unwrap().closure_at(m(4)).unwrap().clone();
    let by_ref: Vec<_> = site.by_ref_arguments.iter().map(|e| e.metadata_name()).collect();
    assert_eq!(by_ref, vec!["<>c__Env0_0"]);

    // Without value environments the same body chains through a parent link.
    let config = EngineConfig::builder().value_environments(false).build().unwrap();
    let (_, delta) = EditSession::baseline(config, vec![build()]).unwrap();
    match delta.declaration("<>c__Env0_1").unwrap() {
        Declaration::Environment { representation, fields, .. } => {
            assert_eq!(*representation, Representation::Reference);
            assert!(fields.iter().any(|f| matches!(f.kind, FieldKind::Parent(_))));
        }
        other => panic!("expected an environment, got {other:?}"),
    }
    let site = delta.rewrite(&render()).unwrap().closure_at(m(4)).unwrap().clone();
    assert!(site.by_ref_arguments.is_empty());
}

#[test]
fn test_generic_member_query_clauses() {
    let member = MemberKey::new("Query", "Map", "(T[])").with_generic_arity(1);
    let mut b = MethodBodyBuilder::new_static(member.clone(), m(0));
    let root = b.root();
    let source = b.parameter(root, "source", m(1));
    b.query_clause(root, m(2));
    let filter = b.query_clause(root, m(3));
    b.reads(filter, source);
    let (_, delta) = baseline(vec![b.finish().unwrap()]);

    // Generic members get no delegate cache; the environment carries the arity.
    assert_eq!(
        names(&delta),
        vec!["<>c", "<>c__Env0_0`1", "<Map>q__0_0`1", "<Map>q__0_1"]
    );
    let plan = delta.rewrite(&member).unwrap();
    assert!(plan.closure_at(m(2)).unwrap().cache_field.is_none());
    match delta.declaration("<>c__Env0_0`1").unwrap() {
        Declaration::Environment { representation, owner_type, .. } => {
            assert_eq!(*representation, Representation::Reference);
            assert_eq!(owner_type, "Query");
        }
        other => panic!("expected an environment, got {other:?}"),
    }
}

// ============================================================
// Edits
// ============================================================

#[test]
fn test_body_only_edit_matches_everything() {
    let (mut session, _) = baseline(vec![single_lambda()]);
    let body = single_lambda();
    let map = same_positions(&body);

    let delta = session.apply(Edit::new(Generation::BASELINE).update(body, map)).unwrap();

    assert_eq!(delta.generation, Generation::new(1));
    assert_eq!(delta.count(Classification::Matched), 2);
    assert_eq!(delta.count(Classification::Added), 0);
    assert_eq!(delta.count(Classification::NoLongerEmitted), 0);
    assert_eq!(delta.new_rows().count(), 0);
    assert_eq!(names(&delta), vec!["<>c__Env0_0", "<Render>b__0_0"]);
}

#[test]
fn test_renumbered_block_matches_by_category() {
    let (mut session, _) = baseline(vec![single_lambda_with_block()]);

    // The block moves from scope marker 3 to 4, which is also `y`'s variable marker.
    let mut b = MethodBodyBuilder::new(render(), m(0));
    let root = b.root();
    let x = b.local(root, "x", m(1));
    let lambda = b.lambda(root, m(2));
    b.reads(lambda, x);
    let block = b.block(root, m(4));
    let y = b.local(block, "y", m(4));
    let second = b.lambda(block, m(5));
    b.reads(second, y);
    let map = SyntaxMap::from_pairs([
        (NodeKind::Scope, m(0), m(0)),
        (NodeKind::Scope, m(3), m(4)),
        (NodeKind::Variable, m(0), m(0)),
        (NodeKind::Variable, m(1), m(1)),
        (NodeKind::Variable, m(4), m(4)),
        (NodeKind::Closure, m(2), m(2)),
        (NodeKind::Closure, m(5), m(5)),
    ])
    .unwrap();
    let delta = session
        .apply(Edit::new(Generation::BASELINE).update(b.finish().unwrap(), map))
        .unwrap();

    assert_eq!(delta.count(Classification::Added), 0);
    assert_eq!(delta.count(Classification::Updated), 0);
    assert!(retired(&delta).is_empty());
    assert_eq!(classification(&delta, "<>c__Env0_1"), Classification::Matched);
    let plan = delta.rewrite(&render()).unwrap();
    assert!(matches!(
        plan.home_of(m(4)),
        Some(Home::EnvironmentField { environment, .. }) if environment.metadata_name() == "<>c__Env0_1"
    ));
}

#[test]
fn test_lambda_added_in_inner_block() {
    let (mut session, _) = baseline(vec![single_lambda()]);

    let delta = session
        .apply(Edit::new(Generation::BASELINE).update(single_lambda_with_block(), positions(&[0, 1, 2])))
        .unwrap();

    assert_eq!(classification(&delta, "<>c__Env0_0"), Classification::Matched);
    assert_eq!(classification(&delta, "<Render>b__0_0"), Classification::Matched);
    assert_eq!(classification(&delta, "<>c__Env0_1#1"), Classification::Added);
    assert_eq!(classification(&delta, "<Render>b__0_1#1"), Classification::Added);

    match delta.declaration("<>c__Env0_1#1").unwrap() {
        Declaration::Environment { fields, row, .. } => {
            assert_eq!(*row, RowAction::New);
            assert_eq!(fields.len(), 1);
            assert_eq!(fields[0].name, "y");
        }
        other => panic!("expected an environment, got {other:?}"),
    }
}

#[test]
fn test_identities_are_stable_across_generations() {
    let (mut session, _) = baseline(vec![single_lambda()]);
    session
        .apply(Edit::new(Generation::new(0)).update(single_lambda_with_block(), positions(&[0, 1, 2])))
        .unwrap();

    let body = single_lambda_with_block();
    let map = same_positions(&body);
    let delta = session.apply(Edit::new(Generation::new(1)).update(body, map)).unwrap();
    assert_eq!(delta.count(Classification::Matched), 4);
    assert_eq!(
        names(&delta),
        vec!["<>c__Env0_0", "<>c__Env0_1#1", "<Render>b__0_0", "<Render>b__0_1#1"]
    );

    // A third, captureless lambda needs the singleton for the first time.
    let mut b = MethodBodyBuilder::new(render(), m(0));
    let root = b.root();
    let x = b.local(root, "x", m(1));
    let first = b.lambda(root, m(2));
    b.reads(first, x);
    let block = b.block(root, m(3));
    let y = b.local(block, "y", m(4));
    let second = b.lambda(block, m(5));
    b.reads(second, y);
    b.lambda(root, m(6));
    let body = b.finish().unwrap();

    let delta = session
        .apply(Edit::new(Generation::new(2)).update(body, positions(&[0, 1, 2, 3, 4, 5])))
        .unwrap();
    assert_eq!(delta.generation, Generation::new(3));
    assert_eq!(classification(&delta, "<>c#3"), Classification::Added);
    assert_eq!(classification(&delta, "<Render>b__0_2#3"), Classification::Added);
    assert_eq!(classification(&delta, "<>9__0_2#3"), Classification::Added);
    assert_eq!(classification(&delta, "<Render>b__0_1#1"), Classification::Matched);
}

#[test]
fn test_block_without_new_captures_adds_no_environment() {
    let (mut session, _) = baseline(vec![single_lambda()]);

    let mut b = MethodBodyBuilder::new(render(), m(0));
    let root = b.root();
    let x = b.local(root, "x", m(1));
    let lambda = b.lambda(root, m(2));
    b.reads(lambda, x);
    let block = b.block(root, m(3));
    let nested = b.lambda(block, m(5));
    b.reads(nested, x);
    let delta = session
        .apply(Edit::new(Generation::BASELINE).update(b.finish().unwrap(), positions(&[0, 1, 2])))
        .unwrap();

    let environments = delta
        .declarations
        .iter()
        .filter(|d| matches!(d, Declaration::Environment { .. }))
        .count();
    assert_eq!(environments, 1);
    assert_eq!(classification(&delta, "<>c__Env0_0"), Classification::Matched);
    assert_eq!(classification(&delta, "<Render>b__0_1#1"), Classification::Added);
    let site = delta.rewrite(&render()).unwrap().closure_at(m(5)).unwrap().clone();
    assert!(matches!(&site.receiver, Receiver::Environment(env) if env.metadata_name() == "<>c__Env0_0"));
}

#[test]
fn test_instance_lambda_becoming_static_keeps_identity() {
    let mut b = MethodBodyBuilder::new(render(), m(0));
    let root = b.root();
    let this = b.this().unwrap();
    let lambda = b.lambda(root, m(1));
    b.reads(lambda, this);
    let (mut session, delta) = baseline(vec![b.finish().unwrap()]);
    assert_eq!(names(&delta), vec!["<Render>b__0_0"]);

    let mut b = MethodBodyBuilder::new(render(), m(0));
    let root = b.root();
    b.lambda(root, m(1));
    let delta = session
        .apply(Edit::new(Generation::BASELINE).update(b.finish().unwrap(), positions(&[0, 1])))
        .unwrap();

    assert_eq!(classification(&delta, "<Render>b__0_0"), Classification::Updated);
    assert_eq!(classification(&delta, "<>c#1"), Classification::Added);
    assert_eq!(classification(&delta, "<>9__0_0#1"), Classification::Added);
    assert!(retired(&delta).is_empty());
    match delta.declaration("<Render>b__0_0").unwrap() {
        Declaration::ClosureMethod { row, container, .. } => {
            assert_eq!(*row, RowAction::New);
            assert!(matches!(container, Container::Singleton(_)));
        }
        other => panic!("expected a closure method, got {other:?}"),
    }
}

#[test]
fn test_removed_lambda_never_gives_back_its_ordinal() {
    let (mut session, _) = baseline(vec![single_lambda()]);

    let mut b = MethodBodyBuilder::new(render(), m(0));
    let root = b.root();
    b.local(root, "x", m(1));
    let delta = session
        .apply(Edit::new(Generation::new(0)).update(b.finish().unwrap(), positions(&[0, 1])))
        .unwrap();
    assert!(delta.declarations.is_empty());
    assert_eq!(retired(&delta), vec!["<>c__Env0_0", "<Render>b__0_0"]);

    let mut b = MethodBodyBuilder::new(render(), m(0));
    let root = b.root();
    let x = b.local(root, "x", m(1));
    let lambda = b.lambda(root, m(7));
    b.reads(lambda, x);
    let delta = session
        .apply(Edit::new(Generation::new(1)).update(b.finish().unwrap(), positions(&[0, 1])))
        .unwrap();
    assert_eq!(names(&delta), vec!["<>c__Env0_1#2", "<Render>b__0_1#2"]);
}

#[test]
fn test_captureless_lambda_gaining_a_capture_is_reminted() {
    let (mut session, _) = baseline(vec![lambda_capturing_nothing()]);

    let body = single_lambda();
    let map = same_positions(&body);
    let delta = session.apply(Edit::new(Generation::BASELINE).update(body, map)).unwrap();

    assert_eq!(names(&delta), vec!["<>c__Env0_0#1", "<Render>b__0_1#1"]);
    assert_eq!(retired(&delta), vec!["<>9__0_0", "<Render>b__0_0"]);
    // The singleton stays allocated but is not part of this delta.
    assert!(delta.report("<>c").is_none());
    assert!(session.snapshot().types["Widget"].ordinals.singleton.is_some());
}

#[test]
fn test_policy_can_keep_identity_across_host_change() {
    init_with(ReuseAction::Reuse, |mut session| {
        let body = single_lambda();
        let map = same_positions(&body);
        let delta = session.apply(Edit::new(Generation::BASELINE).update(body, map)).unwrap();

        assert_eq!(classification(&delta, "<Render>b__0_0"), Classification::Updated);
        match delta.declaration("<Render>b__0_0").unwrap() {
            Declaration::ClosureMethod { row, container, .. } => {
                assert_eq!(*row, RowAction::New);
                assert!(matches!(container, Container::Environment(_)));
            }
            other => panic!("expected a closure method, got {other:?}"),
        }
        assert_eq!(retired(&delta), vec!["<>9__0_0"]);
    });
}

#[test]
fn test_policy_can_reject_host_change() {
    init_with(ReuseAction::Reject, |mut session| {
        let before = session.names().ordinals("Widget");
        let body = single_lambda();
        let map = same_positions(&body);
        let err = session
            .apply(Edit::new(Generation::BASELINE).update(body, map))
            .unwrap_err();

        assert!(matches!(
            err,
            EditError::Unsupported {
                reason: UnsupportedReason::HostTransitionRejected {
                    old: HostClass::Singleton,
                    new: HostClass::Environment,
                },
                ..
            }
        ));
        assert_eq!(session.generation(), Generation::BASELINE);
        assert_eq!(session.names().ordinals("Widget"), before);
    });
}

fn closure_row(delta: &Delta, name: &str) -> (RowAction, Container) {
    match delta.declaration(name) {
        Some(Declaration::ClosureMethod { row, container, .. }) => (*row, container.clone()),
        other => panic!("expected a closure method for {name}, got {other:?}"),
    }
}

/// `void Render() { F(() => this); }`, optionally also capturing `int x`.
fn lambda_reading_this(with_local: bool) -> MethodBody {
    let mut b = MethodBodyBuilder::new(render(), m(0));
    let root = b.root();
    let this = b.this().unwrap();
    let lambda = b.lambda(root, m(1));
    b.reads(lambda, this);
    if with_local {
        let x = b.local(root, "x", m(2));
        b.reads(lambda, x);
    }
    b.finish().unwrap()
}

#[test]
fn test_closure_returning_to_type_reuses_its_row() {
    let (mut session, delta) = baseline(vec![lambda_reading_this(false)]);
    let (row, container) = closure_row(&delta, "<Render>b__0_0");
    assert_eq!(row, RowAction::New);
    assert_eq!(container, Container::Type("Widget".into()));

    let delta = session
        .apply(Edit::new(Generation::new(0)).update(lambda_reading_this(true), positions(&[0, 1])))
        .unwrap();
    let (row, container) = closure_row(&delta, "<Render>b__0_0");
    assert_eq!(row, RowAction::New);
    assert!(matches!(container, Container::Environment(_)));

    let delta = session
        .apply(Edit::new(Generation::new(1)).update(lambda_reading_this(false), positions(&[0, 1])))
        .unwrap();
    let (row, container) = closure_row(&delta, "<Render>b__0_0");
    assert_eq!(row, RowAction::Existing);
    assert_eq!(container, Container::Type("Widget".into()));
    assert_eq!(classification(&delta, "<Render>b__0_0"), Classification::Updated);
    assert_eq!(retired(&delta), vec!["<>c__Env0_0#1"]);
    assert_eq!(delta.new_rows().count(), 0);
}

#[test]
fn test_closure_returning_to_singleton_reuses_its_row() {
    common::init_tracing();
    let config = EngineConfig::builder()
        .transition(HostClass::Singleton, HostClass::TypeInstance, ReuseAction::Reuse)
        .build()
        .unwrap();
    let captureless = || {
        let mut b = MethodBodyBuilder::new(render(), m(0));
        let root = b.root();
        b.lambda(root, m(1));
        b.finish().unwrap()
    };
    let (mut session, delta) = EditSession::baseline(config, vec![captureless()]).unwrap();
    let (row, _) = closure_row(&delta, "<Render>b__0_0");
    assert_eq!(row, RowAction::New);

    let delta = session
        .apply(Edit::new(Generation::new(0)).update(lambda_reading_this(false), positions(&[0, 1])))
        .unwrap();
    let (row, container) = closure_row(&delta, "<Render>b__0_0");
    assert_eq!(row, RowAction::New);
    assert_eq!(container, Container::Type("Widget".into()));

    let delta = session
        .apply(Edit::new(Generation::new(1)).update(captureless(), positions(&[0, 1])))
        .unwrap();
    let (row, container) = closure_row(&delta, "<Render>b__0_0");
    assert_eq!(row, RowAction::Existing);
    assert!(matches!(container, Container::Singleton(s) if s.metadata_name() == "<>c"));
    assert_eq!(classification(&delta, "<Render>b__0_0"), Classification::Updated);
    assert_eq!(classification(&delta, "<>9__0_0#2"), Classification::Added);
}

fn init_with(action: ReuseAction, test: impl FnOnce(EditSession)) {
    common::init_tracing();
    let config = EngineConfig::builder()
        .transition(HostClass::Singleton, HostClass::Environment, action)
        .build()
        .unwrap();
    let (session, _) = EditSession::baseline(config, vec![lambda_capturing_nothing()]).unwrap();
    test(session);
}

#[test]
fn test_lambda_losing_its_captures_moves_to_new_singleton() {
    let (mut session, _) = baseline(vec![single_lambda()]);

    let body = lambda_capturing_nothing();
    let delta = session
        .apply(Edit::new(Generation::BASELINE).update(body, positions(&[0, 1, 2])))
        .unwrap();

    assert_eq!(classification(&delta, "<>c#1"), Classification::Added);
    assert_eq!(classification(&delta, "<Render>b__0_0"), Classification::Updated);
    assert_eq!(classification(&delta, "<>9__0_0#1"), Classification::Added);
    assert_eq!(retired(&delta), vec!["<>c__Env0_0"]);
}

#[test]
fn test_unsupported_edit_mints_nothing() {
    let (mut session, _) = baseline(vec![single_lambda()]);
    let before = session.names().ordinals("Widget");

    let mut b = MethodBodyBuilder::new(render(), m(0));
    let root = b.root();
    let x = b.local(root, "x", m(1));
    let lambda = b.lambda(root, m(2));
    b.closure_parameter(lambda, "arg", m(3));
    b.reads(lambda, x);
    let extra = b.lambda(root, m(4));
    b.reads(extra, x);
    let err = session
        .apply(Edit::new(Generation::BASELINE).update(b.finish().unwrap(), positions(&[0, 1, 2])))
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::UnsupportedEdit);
    assert!(err.is_user_facing());
    assert!(matches!(
        err,
        EditError::Unsupported {
            reason: UnsupportedReason::ParameterCountChanged { old: 0, new: 1 },
            ..
        }
    ));
    assert_eq!(session.generation(), Generation::BASELINE);
    assert_eq!(session.names().ordinals("Widget"), before);

    // The session is still usable at the same base.
    let body = single_lambda();
    let map = same_positions(&body);
    let delta = session.apply(Edit::new(Generation::BASELINE).update(body, map)).unwrap();
    assert_eq!(delta.generation, Generation::new(1));
}

#[test]
fn test_closure_kind_change_is_rejected() {
    let (mut session, _) = baseline(vec![single_lambda()]);

    let mut b = MethodBodyBuilder::new(render(), m(0));
    let root = b.root();
    let x = b.local(root, "x", m(1));
    let helper = b.local_function(root, "Helper", m(2));
    b.reads(helper, x);
    let err = session
        .apply(Edit::new(Generation::BASELINE).update(b.finish().unwrap(), positions(&[0, 1, 2])))
        .unwrap_err();

    assert!(matches!(
        err,
        EditError::Unsupported {
            reason: UnsupportedReason::ClosureKindChanged {
                old: ClosureKind::Lambda,
                new: ClosureKind::LocalFunction,
            },
            ..
        }
    ));
}

#[test]
fn test_captured_variable_moved_into_new_block_is_rejected() {
    let (mut session, _) = baseline(vec![single_lambda()]);
    let before = session.names().ordinals("Widget");

    let mut b = MethodBodyBuilder::new(render(), m(0));
    let root = b.root();
    let block = b.block(root, m(3));
    let x = b.local(block, "x", m(1));
    let lambda = b.lambda(block, m(2));
    b.reads(lambda, x);
    let err = session
        .apply(Edit::new(Generation::BASELINE).update(b.finish().unwrap(), positions(&[0, 1, 2])))
        .unwrap_err();

    assert!(matches!(
        err,
        EditError::Unsupported {
            reason: UnsupportedReason::CapturedVariableMoved { ref variable },
            ..
        } if variable == "x"
    ));
    assert_eq!(session.names().ordinals("Widget"), before);
}

// ============================================================
// Membership
// ============================================================

fn overload() -> MemberKey {
    MemberKey::new("Widget", "Render", "(int)")
}

fn overload_body() -> MethodBody {
    let mut b = MethodBodyBuilder::new(overload(), m(0));
    let root = b.root();
    let x = b.parameter(root, "x", m(1));
    let lambda = b.lambda(root, m(2));
    b.reads(lambda, x);
    b.finish().unwrap()
}

#[test]
fn test_deleted_overload_readded_with_fresh_ordinal() {
    let (mut session, delta) = baseline(vec![single_lambda(), overload_body()]);
    assert!(delta.declaration("<Render>b__1_0").is_some());

    let delta = session.apply(Edit::new(Generation::new(0)).delete(overload())).unwrap();
    assert_eq!(retired(&delta), vec!["<>c__Env1_0", "<Render>b__1_0"]);
    assert!(!session.snapshot().contains_member(&overload()));

    let delta = session.apply(Edit::new(Generation::new(1)).insert(overload_body())).unwrap();
    assert_eq!(names(&delta), vec!["<>c__Env2_0#2", "<Render>b__2_0#2"]);
}

#[test]
fn test_membership_errors() {
    let (mut session, _) = baseline(vec![single_lambda()]);

    let err = session
        .apply(Edit::new(Generation::BASELINE).insert(single_lambda()))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::DuplicateMember);

    let body = overload_body();
    let map = same_positions(&body);
    let err = session
        .apply(Edit::new(Generation::BASELINE).update(body, map))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::UnknownMember);

    let err = session
        .apply(Edit::new(Generation::BASELINE).delete(overload()))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::UnknownMember);

    let err = session
        .apply(Edit::new(Generation::BASELINE).delete(render()).delete(render()))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::DuplicateMember);
}

#[test]
fn test_stale_base_is_rejected() {
    let (mut session, _) = baseline(vec![single_lambda()]);
    let err = session.apply(Edit::new(Generation::new(5))).unwrap_err();
    assert!(matches!(
        err,
        EditError::StaleBaseline {
            requested: Generation(5),
            current: Generation(0),
        }
    ));
}

#[test]
fn test_invalid_config_is_rejected() {
    let config = EngineConfig::builder().analysis_threads(0).build_unchecked();
    let err = EditSession::baseline(config, vec![single_lambda()]).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidConfig);
}

// ============================================================
// Persistence
// ============================================================

#[test]
fn test_resumed_session_continues_identically() {
    let (mut session, _) = baseline(vec![single_lambda()]);
    let delta = session
        .apply(Edit::new(Generation::new(0)).update(single_lambda_with_block(), positions(&[0, 1, 2])))
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("generation-1.json");
    let fingerprint = delta.snapshot.save(&path).unwrap();
    let loaded = GenerationSnapshot::load(&path).unwrap();
    assert_eq!(&loaded, session.snapshot().as_ref());
    assert_eq!(loaded.fingerprint().unwrap(), fingerprint);

    let mut resumed = EditSession::resume(EngineConfig::default(), loaded).unwrap();
    let next = |session: &mut EditSession| {
        let mut b = MethodBodyBuilder::new(render(), m(0));
        let root = b.root();
        let x = b.local(root, "x", m(1));
        let lambda = b.lambda(root, m(2));
        b.reads(lambda, x);
        let fresh = b.lambda(root, m(9));
        b.reads(fresh, x);
        session
            .apply(Edit::new(Generation::new(1)).update(b.finish().unwrap(), positions(&[0, 1, 2])))
            .unwrap()
    };

    let original = next(&mut session);
    let continued = next(&mut resumed);
    assert_eq!(names(&original), names(&continued));
    assert_eq!(original.snapshot.parent, Some(fingerprint));
    assert!(original.declaration("<Render>b__0_2#2").is_some());
}

#[test]
fn test_tampered_snapshot_fails_to_load() {
    let (_, delta) = baseline(vec![single_lambda()]);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("baseline.json");
    delta.snapshot.save(&path).unwrap();

    let content = std::fs::read_to_string(&path).unwrap();
    let tampered = content.replacen("\"local_ordinal\": 0", "\"local_ordinal\": 7", 1);
    assert_ne!(content, tampered);
    std::fs::write(&path, tampered).unwrap();
    let err = GenerationSnapshot::load(&path).unwrap_err();
    assert_eq!(err.code(), ErrorCode::SnapshotFingerprint);

    let bumped = content.replacen("\"format_version\": 1", "\"format_version\": 99", 1);
    std::fs::write(&path, bumped).unwrap();
    let err = GenerationSnapshot::load(&path).unwrap_err();
    assert_eq!(err.code(), ErrorCode::SnapshotVersion);
}
