//! # Operator-Tree Optimizer
//!
//! Peephole rules over lowered rule operators, applied to fixpoint:
//!
//! - Edge collapse: `EdgeNew(EdgeNew(s))` -> `EdgeNew(s)`
//! - Projection collapse: `Map(Proj P)` over `Map(Proj Q)` -> `Map(Proj P)`
//!   (the outer projection subsumes the inner one)
//! - Root projection elimination: a `Map(Proj)` at the root of a
//!   statement with no output action observes nothing and is dropped
//!
//! ```text
//! RuleOp (from lowering) -> [Optimizer] -> Optimized RuleOp -> OpCompiler
//! ```

use crate::ir::{BooleanExpressionOp, PointWiseOp, RuleOp, StreamOp, TableOp};

/// Peephole optimizer with fixpoint iteration.
pub struct Optimizer {
    /// Maximum number of optimization passes
    max_iterations: usize,
}

impl Default for Optimizer {
    fn default() -> Self {
        Optimizer::new()
    }
}

impl Optimizer {
    pub fn new() -> Self {
        Optimizer { max_iterations: 10 }
    }

    pub fn with_max_iterations(max_iterations: usize) -> Self {
        Optimizer { max_iterations }
    }

    /// Optimize one rule to fixpoint, then strip the root projection if
    /// the rule has no output action.
    pub fn optimize_rule(&self, rule: RuleOp) -> RuleOp {
        let RuleOp { stream, actions, has_output, source } = rule;
        let stream = stream.map(|mut current| {
            for _iteration in 0..self.max_iterations {
                let optimized = self.optimize_stream(current.clone());
                if optimized == current {
                    break;
                }
                current = optimized;
            }
            if !has_output {
                current = Self::strip_root_projection(current);
            }
            current
        });
        RuleOp { stream, actions, has_output, source }
    }

    // ------------------------------------------------------------------
    // One pass over streams
    // ------------------------------------------------------------------

    fn optimize_stream(&self, stream: StreamOp) -> StreamOp {
        match stream {
            StreamOp::EdgeNew { stream } => {
                let inner = self.optimize_stream(*stream);
                // consecutive edge-new dedups are one dedup
                if let StreamOp::EdgeNew { .. } = inner {
                    inner
                } else {
                    StreamOp::EdgeNew { stream: Box::new(inner) }
                }
            }
            StreamOp::Map { stream, op, schema } => {
                let inner = self.optimize_stream(*stream);
                if let (
                    PointWiseOp::Projection(_),
                    StreamOp::Map { stream: grandchild, op: PointWiseOp::Projection(_), .. },
                ) = (&op, &inner)
                {
                    return StreamOp::Map { stream: grandchild.clone(), op, schema };
                }
                StreamOp::Map { stream: Box::new(inner), op, schema }
            }
            StreamOp::Filter { stream, filter, schema } => StreamOp::Filter {
                stream: Box::new(self.optimize_stream(*stream)),
                filter: self.optimize_filter(filter),
                schema,
            },
            StreamOp::EdgeFilter { stream, filter } => StreamOp::EdgeFilter {
                stream: Box::new(self.optimize_stream(*stream)),
                filter: self.optimize_filter(filter),
            },
            StreamOp::Union { lhs, rhs, schema } => StreamOp::Union {
                lhs: Box::new(self.optimize_stream(*lhs)),
                rhs: Box::new(self.optimize_stream(*rhs)),
                schema,
            },
            StreamOp::Join { stream, table, schema } => StreamOp::Join {
                stream: Box::new(self.optimize_stream(*stream)),
                table: Box::new(self.optimize_table(*table)),
                schema,
            },
            StreamOp::InvokeTable { stream, table, schema } => StreamOp::InvokeTable {
                stream: Box::new(self.optimize_stream(*stream)),
                table: Box::new(self.optimize_table(*table)),
                schema,
            },
            leaf @ (StreamOp::Now
            | StreamOp::InvokeVarRef { .. }
            | StreamOp::InvokeSubscribe { .. }
            | StreamOp::Timer { .. }
            | StreamOp::AtTimer { .. }
            | StreamOp::OnTimer { .. }) => leaf,
        }
    }

    // ------------------------------------------------------------------
    // One pass over tables
    // ------------------------------------------------------------------

    fn optimize_table(&self, table: TableOp) -> TableOp {
        match table {
            TableOp::Map { table, op, device, handle_thingtalk, schema } => {
                let inner = self.optimize_table(*table);
                if let (
                    PointWiseOp::Projection(_),
                    TableOp::Map { table: grandchild, op: PointWiseOp::Projection(_), .. },
                ) = (&op, &inner)
                {
                    return TableOp::Map {
                        table: grandchild.clone(),
                        op,
                        device,
                        handle_thingtalk,
                        schema,
                    };
                }
                TableOp::Map { table: Box::new(inner), op, device, handle_thingtalk, schema }
            }
            TableOp::Filter { table, filter, device, handle_thingtalk, schema } => {
                TableOp::Filter {
                    table: Box::new(self.optimize_table(*table)),
                    filter: self.optimize_filter(filter),
                    device,
                    handle_thingtalk,
                    schema,
                }
            }
            TableOp::Reduce { table, op, device, handle_thingtalk, schema } => TableOp::Reduce {
                table: Box::new(self.optimize_table(*table)),
                op,
                device,
                handle_thingtalk,
                schema,
            },
            TableOp::CrossJoin { lhs, rhs, device, handle_thingtalk, schema } => {
                TableOp::CrossJoin {
                    lhs: Box::new(self.optimize_table(*lhs)),
                    rhs: Box::new(self.optimize_table(*rhs)),
                    device,
                    handle_thingtalk,
                    schema,
                }
            }
            TableOp::NestedLoopJoin { lhs, rhs, device, handle_thingtalk, schema } => {
                TableOp::NestedLoopJoin {
                    lhs: Box::new(self.optimize_table(*lhs)),
                    rhs: Box::new(self.optimize_table(*rhs)),
                    device,
                    handle_thingtalk,
                    schema,
                }
            }
            TableOp::Join { lhs, rhs, device, handle_thingtalk, schema } => TableOp::Join {
                lhs: Box::new(self.optimize_table(*lhs)),
                rhs: Box::new(self.optimize_table(*rhs)),
                device,
                handle_thingtalk,
                schema,
            },
            leaf @ (TableOp::InvokeVarRef { .. }
            | TableOp::InvokeGet { .. }
            | TableOp::ReadResult { .. }) => leaf,
        }
    }

    fn optimize_filter(&self, filter: BooleanExpressionOp) -> BooleanExpressionOp {
        match filter {
            BooleanExpressionOp::And(ops) => BooleanExpressionOp::And(
                ops.into_iter().map(|o| self.optimize_filter(o)).collect(),
            ),
            BooleanExpressionOp::Or(ops) => BooleanExpressionOp::Or(
                ops.into_iter().map(|o| self.optimize_filter(o)).collect(),
            ),
            BooleanExpressionOp::Not(inner) => {
                BooleanExpressionOp::Not(Box::new(self.optimize_filter(*inner)))
            }
            BooleanExpressionOp::External { selector, channel, in_params, filter, schema } => {
                BooleanExpressionOp::External {
                    selector,
                    channel,
                    in_params,
                    filter: Box::new(self.optimize_filter(*filter)),
                    schema,
                }
            }
            BooleanExpressionOp::ExistentialSubquery { subquery } => {
                BooleanExpressionOp::ExistentialSubquery {
                    subquery: Box::new(self.optimize_table(*subquery)),
                }
            }
            BooleanExpressionOp::ComparisonSubquery { lhs, operator, subquery, field, overload } => {
                BooleanExpressionOp::ComparisonSubquery {
                    lhs,
                    operator,
                    subquery: Box::new(self.optimize_table(*subquery)),
                    field,
                    overload,
                }
            }
            leaf => leaf,
        }
    }

    // ------------------------------------------------------------------
    // Root projection elimination
    // ------------------------------------------------------------------

    /// Strip `Map(Projection)` from the observable root of a rule with no
    /// output action. Commands keep their shape (`InvokeTable` at the
    /// root), so the table side is stripped there too.
    fn strip_root_projection(stream: StreamOp) -> StreamOp {
        match stream {
            StreamOp::Map { stream, op: PointWiseOp::Projection(_), .. } => {
                Self::strip_root_projection(*stream)
            }
            StreamOp::InvokeTable { stream, table, schema } => StreamOp::InvokeTable {
                stream,
                table: Box::new(Self::strip_root_projection_table(*table)),
                schema,
            },
            other => other,
        }
    }

    fn strip_root_projection_table(table: TableOp) -> TableOp {
        match table {
            TableOp::Map { table, op: PointWiseOp::Projection(_), .. } => {
                Self::strip_root_projection_table(*table)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Statement;
    use std::collections::BTreeSet;

    fn projection(names: &[&str]) -> PointWiseOp {
        PointWiseOp::Projection(names.iter().map(|s| s.to_string()).collect())
    }

    fn rule(stream: StreamOp, has_output: bool) -> RuleOp {
        RuleOp {
            stream: Some(stream),
            actions: vec![],
            has_output,
            source: Statement::Command { table: None, actions: vec![] },
        }
    }

    #[test]
    fn test_edge_new_collapse() {
        let stream = StreamOp::EdgeNew {
            stream: Box::new(StreamOp::EdgeNew { stream: Box::new(StreamOp::Now) }),
        };
        let optimized = Optimizer::new().optimize_rule(rule(stream, true));
        assert_eq!(
            optimized.stream,
            Some(StreamOp::EdgeNew { stream: Box::new(StreamOp::Now) })
        );
    }

    #[test]
    fn test_projection_collapse_keeps_outer() {
        let inner = StreamOp::Map {
            stream: Box::new(StreamOp::Now),
            op: projection(&["a", "b", "c"]),
            schema: None,
        };
        let outer = StreamOp::Map {
            stream: Box::new(inner),
            op: projection(&["a"]),
            schema: None,
        };
        let optimized = Optimizer::new().optimize_rule(rule(outer, true));
        match optimized.stream {
            Some(StreamOp::Map { stream, op: PointWiseOp::Projection(names), .. }) => {
                assert_eq!(names, ["a".to_string()].into_iter().collect::<BTreeSet<_>>());
                assert_eq!(*stream, StreamOp::Now);
            }
            other => panic!("expected single projection, got {other:?}"),
        }
    }

    #[test]
    fn test_root_projection_dropped_without_output() {
        let stream = StreamOp::Map {
            stream: Box::new(StreamOp::Now),
            op: projection(&["a"]),
            schema: None,
        };
        let optimized = Optimizer::new().optimize_rule(rule(stream, false));
        assert_eq!(optimized.stream, Some(StreamOp::Now));
    }

    #[test]
    fn test_root_projection_kept_with_output() {
        let stream = StreamOp::Map {
            stream: Box::new(StreamOp::Now),
            op: projection(&["a"]),
            schema: None,
        };
        let optimized = Optimizer::new().optimize_rule(rule(stream.clone(), true));
        assert_eq!(optimized.stream, Some(stream));
    }

    #[test]
    fn test_optimize_is_idempotent() {
        let stream = StreamOp::EdgeNew {
            stream: Box::new(StreamOp::Map {
                stream: Box::new(StreamOp::Map {
                    stream: Box::new(StreamOp::EdgeNew { stream: Box::new(StreamOp::Now) }),
                    op: projection(&["a", "b"]),
                    schema: None,
                }),
                op: projection(&["a"]),
                schema: None,
            }),
        };
        let optimizer = Optimizer::new();
        let once = optimizer.optimize_rule(rule(stream, true));
        let twice = optimizer.optimize_rule(once.clone());
        assert_eq!(once, twice);
    }
}
