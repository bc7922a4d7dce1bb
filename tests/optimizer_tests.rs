//! Optimizer Property Tests
//!
//! The peephole pass must be idempotent and must leave no collapsible
//! shape behind, for arbitrary stream trees.

use std::collections::BTreeSet;

use proptest::prelude::*;

use thingtalk::ast::Statement;
use thingtalk::ir::{BooleanExpressionOp, PointWiseOp, RuleOp, StreamOp};
use thingtalk::Optimizer;

fn projection(names: Vec<String>) -> PointWiseOp {
    PointWiseOp::Projection(names.into_iter().collect::<BTreeSet<_>>())
}

/// Arbitrary stream trees built from the shapes the rules act on.
fn stream_strategy() -> impl Strategy<Value = StreamOp> {
    let leaf = Just(StreamOp::Now);
    leaf.prop_recursive(6, 32, 2, |inner| {
        prop_oneof![
            inner.clone().prop_map(|s| StreamOp::EdgeNew { stream: Box::new(s) }),
            (inner.clone(), proptest::collection::vec("[a-d]", 0..3)).prop_map(|(s, names)| {
                StreamOp::Map {
                    stream: Box::new(s),
                    op: projection(names),
                    schema: None,
                }
            }),
            inner.clone().prop_map(|s| StreamOp::Filter {
                stream: Box::new(s),
                filter: BooleanExpressionOp::True,
                schema: None,
            }),
            (inner.clone(), inner).prop_map(|(a, b)| StreamOp::Union {
                lhs: Box::new(a),
                rhs: Box::new(b),
                schema: None,
            }),
        ]
    })
}

fn rule(stream: StreamOp, has_output: bool) -> RuleOp {
    RuleOp {
        stream: Some(stream),
        actions: vec![],
        has_output,
        source: Statement::Command { table: None, actions: vec![] },
    }
}

/// No `EdgeNew(EdgeNew(..))` and no `Map(Proj)` directly over
/// `Map(Proj)` anywhere in an optimized tree.
fn assert_normalized(op: &StreamOp) {
    match op {
        StreamOp::EdgeNew { stream } => {
            assert!(
                !matches!(stream.as_ref(), StreamOp::EdgeNew { .. }),
                "nested EdgeNew survived optimization"
            );
            assert_normalized(stream);
        }
        StreamOp::Map { stream, op, .. } => {
            if matches!(op, PointWiseOp::Projection(_)) {
                assert!(
                    !matches!(
                        stream.as_ref(),
                        StreamOp::Map { op: PointWiseOp::Projection(_), .. }
                    ),
                    "stacked projections survived optimization"
                );
            }
            assert_normalized(stream);
        }
        StreamOp::Filter { stream, .. } => assert_normalized(stream),
        StreamOp::EdgeFilter { stream, .. } => assert_normalized(stream),
        StreamOp::Union { lhs, rhs, .. } => {
            assert_normalized(lhs);
            assert_normalized(rhs);
        }
        StreamOp::Join { stream, .. } | StreamOp::InvokeTable { stream, .. } => {
            assert_normalized(stream)
        }
        _ => {}
    }
}

proptest! {
    /// Property 3: optimize(optimize(t)) == optimize(t)
    #[test]
    fn optimize_is_idempotent(stream in stream_strategy(), has_output in any::<bool>()) {
        let optimizer = Optimizer::new();
        let once = optimizer.optimize_rule(rule(stream, has_output));
        let twice = optimizer.optimize_rule(once.clone());
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn optimize_normalizes_all_shapes(stream in stream_strategy()) {
        let optimizer = Optimizer::new();
        let optimized = optimizer.optimize_rule(rule(stream, true));
        if let Some(stream) = &optimized.stream {
            assert_normalized(stream);
        }
    }

    /// Without an output action the observable root is never a projection.
    #[test]
    fn root_projection_never_survives_without_output(stream in stream_strategy()) {
        let optimizer = Optimizer::new();
        let optimized = optimizer.optimize_rule(rule(stream, false));
        if let Some(stream) = &optimized.stream {
            let is_root_projection = matches!(
                stream,
                StreamOp::Map { op: PointWiseOp::Projection(_), .. }
            );
            prop_assert!(!is_root_projection);
        }
    }
}
