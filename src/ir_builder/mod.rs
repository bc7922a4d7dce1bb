//! # Query-Algebra Lowering
//!
//! Typed AST -> operator trees. Builds `StreamOp`/`TableOp`/`ActionOp`
//! trees from statements, pushing `QueryInvocationHints` (projection,
//! filter, sort, limit) down to the invocation leaves as it goes.
//!
//! ```text
//! Typed AST (Program) -> [Lowering] -> RuleOp trees -> Optimizer
//! ```
//!
//! Notable rewrites:
//! - `Index[1] of Sort(f)` fuses to `Reduce(SimpleArgMinMax)` with
//!   `limit = 1` and the sort propagated as a hint.
//! - Joins classify into `CrossJoin` (independent sides),
//!   `NestedLoopJoin` (parameter passing) or device-pushdown `Join`
//!   (both sides on one device that handles its own queries).
//! - `monitor` wraps the subscription leaf in `EdgeNew`; filters above a
//!   monitor become `EdgeFilter`; sort/index/slice above a monitor are
//!   dropped (they do not affect level-triggered firing); aggregations
//!   re-subscribe to the inner table and recompute per change.

use std::collections::BTreeSet;

use crate::ast::{
    Action, BooleanExpression, FunctionDef, InputParam, SortDirection, SortKey, Statement,
    Stream, Table,
};
use crate::ir::{
    ActionOp, BooleanExpressionOp, CompileError, PointWiseOp, QueryInvocationHints, ReduceOp,
    RuleOp, StreamOp, TableOp,
};
use crate::value::Value;

/// The lowering pass. Stateless; schemas were attached by the typechecker.
pub struct Lowerer;

impl Default for Lowerer {
    fn default() -> Self {
        Lowerer
    }
}

impl Lowerer {
    pub fn new() -> Self {
        Lowerer
    }

    /// Lower every rule/command statement of a program.
    pub fn lower_program(
        &self,
        program: &crate::ast::Program,
    ) -> Result<Vec<RuleOp>, CompileError> {
        program
            .rules
            .iter()
            .map(|statement| self.lower_statement(statement))
            .collect()
    }

    /// Lower one statement to a rule operator.
    pub fn lower_statement(&self, statement: &Statement) -> Result<RuleOp, CompileError> {
        match statement {
            Statement::Declaration(decl) => Err(CompileError::Internal(format!(
                "declaration {} must be compiled as a procedure, not lowered",
                decl.name
            ))),
            Statement::Rule { stream, actions } => {
                let has_output = statement.has_output_action();
                let hints = self.root_hints(stream.schema(), actions, has_output);
                let mut op = self.lower_stream(stream, hints)?;
                if has_output {
                    op = self.append_output_projection_stream(op, stream.schema(), actions);
                }
                Ok(RuleOp {
                    stream: Some(op),
                    actions: self.lower_actions(actions),
                    has_output,
                    source: statement.clone(),
                })
            }
            Statement::Command { table, actions } => {
                let has_output = statement.has_output_action();
                let stream = match table {
                    None => Some(StreamOp::Now),
                    Some(table) => {
                        let hints = self.root_hints(table.schema(), actions, has_output);
                        let mut op = self.lower_table(table, hints)?;
                        if has_output {
                            op = self.append_output_projection(op, table.schema(), actions);
                        }
                        Some(StreamOp::InvokeTable {
                            stream: Box::new(StreamOp::Now),
                            table: Box::new(op),
                            schema: table.schema().cloned(),
                        })
                    }
                };
                Ok(RuleOp {
                    stream,
                    actions: self.lower_actions(actions),
                    has_output,
                    source: statement.clone(),
                })
            }
        }
    }

    // ------------------------------------------------------------------
    // Statement-level helpers
    // ------------------------------------------------------------------

    /// Parameter names the actions consume from the tuple.
    fn used_params(&self, actions: &[Action]) -> BTreeSet<String> {
        let mut used = BTreeSet::new();
        for action in actions {
            let params: &[InputParam] = match action {
                Action::Notify { .. } => &[],
                Action::Invocation { invocation, .. } => &invocation.in_params,
                Action::VarRef { in_params, .. } => in_params,
            };
            for param in params {
                collect_value_refs(&param.value, &mut used);
            }
        }
        used
    }

    /// Hints seeded at the root of a statement: the parameters the
    /// actions read, plus the default projection when the statement
    /// delivers tuples to the output channel.
    fn root_hints(
        &self,
        schema: Option<&std::sync::Arc<FunctionDef>>,
        actions: &[Action],
        has_output: bool,
    ) -> QueryInvocationHints {
        let mut projection = self.used_params(actions);
        if has_output {
            if let Some(schema) = schema {
                projection.extend(schema.default_projection.iter().cloned());
            }
        }
        let mut hints = QueryInvocationHints::new();
        hints.set_projection(projection);
        hints
    }

    /// The synthetic output projection: `default_projection ∪ used`.
    /// Skipped when that set is empty, so queries whose functions declare
    /// no default projection surface their tuples unprojected.
    fn output_projection(
        &self,
        schema: Option<&std::sync::Arc<FunctionDef>>,
        actions: &[Action],
    ) -> Option<BTreeSet<String>> {
        let schema = schema?;
        let mut names: BTreeSet<String> = schema.default_projection.clone();
        names.extend(
            self.used_params(actions)
                .into_iter()
                .filter(|n| schema.has_argument(n)),
        );
        if names.is_empty() {
            None
        } else {
            Some(names)
        }
    }

    fn append_output_projection(
        &self,
        op: TableOp,
        schema: Option<&std::sync::Arc<FunctionDef>>,
        actions: &[Action],
    ) -> TableOp {
        match self.output_projection(schema, actions) {
            None => op,
            Some(names) => TableOp::Map {
                device: op.device().cloned(),
                handle_thingtalk: op.handle_thingtalk(),
                schema: op.schema().cloned(),
                table: Box::new(op),
                op: PointWiseOp::Projection(names),
            },
        }
    }

    fn append_output_projection_stream(
        &self,
        op: StreamOp,
        schema: Option<&std::sync::Arc<FunctionDef>>,
        actions: &[Action],
    ) -> StreamOp {
        match self.output_projection(schema, actions) {
            None => op,
            Some(names) => StreamOp::Map {
                schema: schema.cloned(),
                stream: Box::new(op),
                op: PointWiseOp::Projection(names),
            },
        }
    }

    pub fn lower_action(&self, action: &Action) -> ActionOp {
        match action {
            Action::Notify { .. } => ActionOp::Notify,
            Action::Invocation { invocation, .. } => {
                ActionOp::InvokeDo { invocation: invocation.clone() }
            }
            Action::VarRef { name, in_params, .. } => ActionOp::InvokeVarRef {
                name: name.clone(),
                in_params: in_params.clone(),
            },
        }
    }

    fn lower_actions(&self, actions: &[Action]) -> Vec<ActionOp> {
        actions.iter().map(|action| self.lower_action(action)).collect()
    }

    // ------------------------------------------------------------------
    // Tables
    // ------------------------------------------------------------------

    pub fn lower_table(
        &self,
        table: &Table,
        hints: QueryInvocationHints,
    ) -> Result<TableOp, CompileError> {
        match table {
            Table::VarRef { name, in_params, schema } => Ok(TableOp::InvokeVarRef {
                name: name.clone(),
                in_params: in_params.clone(),
                hints,
                schema: schema.clone(),
            }),
            Table::Invocation { invocation, schema } => {
                let mut hints = hints;
                if let Some(schema) = schema {
                    hints.add_projection(schema.minimal_projection.iter().cloned());
                }
                Ok(TableOp::InvokeGet {
                    device: Some(invocation.selector.clone()),
                    handle_thingtalk: schema
                        .as_ref()
                        .map(|s| s.handles_own_queries())
                        .unwrap_or(false),
                    invocation: invocation.clone(),
                    hints,
                    schema: schema.clone(),
                })
            }
            Table::ReadResult { function, index, schema } => Ok(TableOp::ReadResult {
                function: function.clone(),
                index: index.clone(),
                schema: schema.clone(),
            }),
            Table::Filter { table, filter, schema } => {
                let mut child = hints;
                let inner_schema = table.schema();
                child.add_projection(
                    filter
                        .free_variables()
                        .into_iter()
                        .filter(|n| {
                            inner_schema.map(|s| s.has_argument(n)).unwrap_or(false)
                        }),
                );
                child.merge_filter(filter);
                let inner = self.lower_table(table, child)?;
                Ok(TableOp::Filter {
                    device: inner.device().cloned(),
                    handle_thingtalk: inner.handle_thingtalk(),
                    filter: self.lower_filter(filter)?,
                    table: Box::new(inner),
                    schema: schema.clone(),
                })
            }
            Table::Projection { table, args, computations, aliases, schema } => {
                let inner_schema = table.schema();
                let minimal: BTreeSet<String> = inner_schema
                    .map(|s| s.minimal_projection.clone())
                    .unwrap_or_default();
                let mut wanted: BTreeSet<String> = args.iter().cloned().collect();
                wanted.extend(minimal.iter().cloned());

                // the child must additionally produce whatever the
                // computations read
                let mut child = hints.clone();
                let mut child_projection = wanted.clone();
                for computation in computations {
                    child_projection.extend(computation.free_variables());
                }
                child.set_projection(child_projection);
                let mut op = self.lower_table(table, child)?;

                let mut computed_names: BTreeSet<String> = BTreeSet::new();
                for (i, computation) in computations.iter().enumerate() {
                    let alias = aliases
                        .get(i)
                        .cloned()
                        .flatten()
                        .unwrap_or_else(|| format!("__compute_{i}"));
                    computed_names.insert(alias.clone());
                    op = TableOp::Map {
                        device: op.device().cloned(),
                        handle_thingtalk: op.handle_thingtalk(),
                        schema: schema.clone(),
                        table: Box::new(op),
                        op: PointWiseOp::Compute {
                            expression: computation.clone(),
                            alias,
                        },
                    };
                }

                let mut effective = match &hints.projection {
                    Some(requested) => wanted.intersection(requested).cloned().collect(),
                    None => wanted,
                };
                effective.extend(computed_names);
                Ok(TableOp::Map {
                    device: op.device().cloned(),
                    handle_thingtalk: op.handle_thingtalk(),
                    schema: schema.clone(),
                    table: Box::new(op),
                    op: PointWiseOp::Projection(effective),
                })
            }
            Table::Compute { table, expression, alias, schema } => {
                let mut child = hints;
                child.add_projection(expression.free_variables());
                let inner = self.lower_table(table, child)?;
                Ok(TableOp::Map {
                    device: inner.device().cloned(),
                    handle_thingtalk: inner.handle_thingtalk(),
                    schema: schema.clone(),
                    table: Box::new(inner),
                    op: PointWiseOp::Compute {
                        expression: expression.clone(),
                        alias: alias.clone().unwrap_or_else(|| "result".to_string()),
                    },
                })
            }
            Table::Alias { table, .. } => self.lower_table(table, hints),
            Table::Aggregation { table, operator, field, schema, .. } => {
                // aggregation consumes the whole inner table; parent
                // hints do not survive it
                let mut child = QueryInvocationHints::new();
                if field == "*" {
                    child.set_projection(BTreeSet::new());
                } else {
                    child.set_projection([field.clone()].into_iter().collect());
                }
                let inner = self.lower_table(table, child)?;
                let op = match (operator.as_str(), field.as_str()) {
                    ("count", "*") => ReduceOp::Count,
                    ("count", _) => ReduceOp::CountDistinct { field: field.clone() },
                    ("avg", _) => ReduceOp::Average { field: field.clone() },
                    ("sum", _) | ("min", _) | ("max", _) => ReduceOp::SimpleAggregation {
                        operator: operator.clone(),
                        field: field.clone(),
                    },
                    _ => {
                        return Err(CompileError::Internal(format!(
                            "unknown aggregation operator {operator}"
                        )))
                    }
                };
                Ok(TableOp::Reduce {
                    device: inner.device().cloned(),
                    handle_thingtalk: inner.handle_thingtalk(),
                    table: Box::new(inner),
                    op,
                    schema: schema.clone(),
                })
            }
            Table::ArgMinMax { table, operator, field, base, limit, schema } => {
                let direction = if operator == "argmin" {
                    SortDirection::Asc
                } else {
                    SortDirection::Desc
                };
                let mut child = hints;
                child.add_projection([field.clone()]);
                child.sort = Some((field.clone(), direction));
                let simple = matches!(
                    (literal_number(base), literal_number(limit)),
                    (Some(b), Some(l)) if b == 1.0 && l == 1.0
                );
                child.limit = if simple {
                    Some(Value::Number(1.0))
                } else {
                    match (literal_number(base), literal_number(limit)) {
                        (Some(b), Some(l)) => Some(Value::Number(b + l - 1.0)),
                        _ => None,
                    }
                };
                let inner = self.lower_table(table, child)?;
                let op = if simple {
                    ReduceOp::SimpleArgMinMax {
                        operator: operator.clone(),
                        field: field.clone(),
                    }
                } else {
                    ReduceOp::ComplexArgMinMax {
                        operator: operator.clone(),
                        field: field.clone(),
                        base: base.clone(),
                        limit: limit.clone(),
                    }
                };
                Ok(TableOp::Reduce {
                    device: inner.device().cloned(),
                    handle_thingtalk: inner.handle_thingtalk(),
                    table: Box::new(inner),
                    op,
                    schema: schema.clone(),
                })
            }
            Table::Sort { table, key, direction, schema } => {
                let mut child = hints;
                let op = match key {
                    SortKey::Field(field) => {
                        child.add_projection([field.clone()]);
                        child.sort = Some((field.clone(), *direction));
                        ReduceOp::SimpleSort {
                            field: field.clone(),
                            direction: *direction,
                        }
                    }
                    SortKey::Expression(expression) => {
                        child.add_projection(expression.free_variables());
                        ReduceOp::ComplexSort {
                            expression: expression.clone(),
                            direction: *direction,
                        }
                    }
                };
                let inner = self.lower_table(table, child)?;
                Ok(TableOp::Reduce {
                    device: inner.device().cloned(),
                    handle_thingtalk: inner.handle_thingtalk(),
                    table: Box::new(inner),
                    op,
                    schema: schema.clone(),
                })
            }
            Table::Index { table, indices, schema } => {
                // Index[1] of Sort fuses into a single-pass argmin/argmax
                if let [index] = indices.as_slice() {
                    if let Some(k) = literal_number(index) {
                        if let Table::Sort {
                            table: sorted,
                            key: SortKey::Field(field),
                            direction,
                            ..
                        } = table.as_ref()
                        {
                            if k == 1.0 || k == -1.0 {
                                let operator = match (k == 1.0, direction) {
                                    (true, SortDirection::Asc)
                                    | (false, SortDirection::Desc) => "argmin",
                                    _ => "argmax",
                                };
                                let mut child = hints;
                                child.add_projection([field.clone()]);
                                child.sort = Some((field.clone(), *direction));
                                child.limit = Some(Value::Number(1.0));
                                let inner = self.lower_table(sorted, child)?;
                                return Ok(TableOp::Reduce {
                                    device: inner.device().cloned(),
                                    handle_thingtalk: inner.handle_thingtalk(),
                                    table: Box::new(inner),
                                    op: ReduceOp::SimpleArgMinMax {
                                        operator: operator.to_string(),
                                        field: field.clone(),
                                    },
                                    schema: schema.clone(),
                                });
                            }
                        }
                        if k >= 1.0 {
                            let mut child = hints;
                            child.limit = Some(Value::Number(k));
                            let inner = self.lower_table(table, child)?;
                            return Ok(TableOp::Reduce {
                                device: inner.device().cloned(),
                                handle_thingtalk: inner.handle_thingtalk(),
                                table: Box::new(inner),
                                op: ReduceOp::SimpleIndex { index: index.clone() },
                                schema: schema.clone(),
                            });
                        }
                    }
                }
                let mut child = hints;
                child.limit = None;
                let inner = self.lower_table(table, child)?;
                Ok(TableOp::Reduce {
                    device: inner.device().cloned(),
                    handle_thingtalk: inner.handle_thingtalk(),
                    table: Box::new(inner),
                    op: ReduceOp::ComplexIndex { indices: indices.clone() },
                    schema: schema.clone(),
                })
            }
            Table::Slice { table, base, limit, schema } => {
                let mut child = hints;
                child.limit = match (literal_number(base), literal_number(limit)) {
                    (Some(b), Some(l)) => Some(Value::Number(b + l - 1.0)),
                    _ => None,
                };
                let inner = self.lower_table(table, child)?;
                Ok(TableOp::Reduce {
                    device: inner.device().cloned(),
                    handle_thingtalk: inner.handle_thingtalk(),
                    table: Box::new(inner),
                    op: ReduceOp::Slice { base: base.clone(), limit: limit.clone() },
                    schema: schema.clone(),
                })
            }
            Table::Join { lhs, rhs, in_params, schema } => {
                let param_passing = !in_params.is_empty()
                    || references_outputs(rhs, lhs.schema());
                let rhs_ast;
                let rhs = if in_params.is_empty() {
                    rhs.as_ref()
                } else {
                    rhs_ast = push_in_params(rhs, in_params);
                    &rhs_ast
                };

                let left = self.lower_table(lhs, hints.restrict_to(lhs.schema()))?;
                let right = self.lower_table(rhs, hints.restrict_to(rhs.schema()))?;

                let device = match (left.device(), right.device()) {
                    (Some(a), Some(b)) if a == b => Some(a.clone()),
                    _ => None,
                };
                let handle_thingtalk =
                    device.is_some() && left.handle_thingtalk() && right.handle_thingtalk();

                if handle_thingtalk {
                    Ok(TableOp::Join {
                        lhs: Box::new(left),
                        rhs: Box::new(right),
                        device,
                        handle_thingtalk,
                        schema: schema.clone(),
                    })
                } else if param_passing {
                    Ok(TableOp::NestedLoopJoin {
                        lhs: Box::new(left),
                        rhs: Box::new(right),
                        device,
                        handle_thingtalk: false,
                        schema: schema.clone(),
                    })
                } else {
                    Ok(TableOp::CrossJoin {
                        lhs: Box::new(left),
                        rhs: Box::new(right),
                        device,
                        handle_thingtalk: false,
                        schema: schema.clone(),
                    })
                }
            }
            Table::Window { .. } => Err(CompileError::NotImplemented(
                "window expressions over streams".to_string(),
            )),
            Table::TimeSeries { .. } => Err(CompileError::NotImplemented(
                "time series expressions over streams".to_string(),
            )),
            Table::Sequence { .. } => Err(CompileError::NotImplemented(
                "sequence expressions over query history".to_string(),
            )),
            Table::History { .. } => Err(CompileError::NotImplemented(
                "history expressions over query history".to_string(),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Streams
    // ------------------------------------------------------------------

    pub fn lower_stream(
        &self,
        stream: &Stream,
        hints: QueryInvocationHints,
    ) -> Result<StreamOp, CompileError> {
        match stream {
            Stream::VarRef { name, in_params, schema } => Ok(StreamOp::InvokeVarRef {
                name: name.clone(),
                in_params: in_params.clone(),
                schema: schema.clone(),
            }),
            Stream::Timer { base, interval, frequency, .. } => Ok(StreamOp::Timer {
                base: base.clone(),
                interval: interval.clone(),
                frequency: frequency.clone(),
            }),
            Stream::AtTimer { times, expiration, .. } => Ok(StreamOp::AtTimer {
                times: times.clone(),
                expiration: expiration.clone(),
            }),
            Stream::OnTimer { dates, .. } => Ok(StreamOp::OnTimer { dates: dates.clone() }),
            Stream::Monitor { table, args, .. } => {
                let projected;
                let table = match args {
                    None => table.as_ref(),
                    Some(args) => {
                        // monitoring specific fields watches exactly those:
                        // treat as a monitor of the projected table
                        let schema = table.schema().map(|s| {
                            let keep: BTreeSet<&str> =
                                args.iter().map(String::as_str).collect();
                            std::sync::Arc::new(
                                s.filter_arguments(|a| keep.contains(a.name.as_str())),
                            )
                        });
                        projected = Table::Projection {
                            table: table.clone(),
                            args: args.clone(),
                            computations: vec![],
                            aliases: vec![],
                            schema,
                        };
                        &projected
                    }
                };
                self.lower_monitor(table, hints)
            }
            Stream::EdgeNew { stream, .. } => Ok(StreamOp::EdgeNew {
                stream: Box::new(self.lower_stream(stream, hints)?),
            }),
            Stream::EdgeFilter { stream, filter, .. } => {
                let mut child = hints;
                child.add_projection(filter.free_variables());
                Ok(StreamOp::EdgeFilter {
                    stream: Box::new(self.lower_stream(stream, child)?),
                    filter: self.lower_filter(filter)?,
                })
            }
            Stream::Filter { stream, filter, schema } => {
                let mut child = hints;
                child.add_projection(filter.free_variables());
                child.merge_filter(filter);
                Ok(StreamOp::Filter {
                    stream: Box::new(self.lower_stream(stream, child)?),
                    filter: self.lower_filter(filter)?,
                    schema: schema.clone(),
                })
            }
            Stream::Projection { stream, args, schema } => {
                let minimal: BTreeSet<String> = stream
                    .schema()
                    .map(|s| s.minimal_projection.clone())
                    .unwrap_or_default();
                let mut wanted: BTreeSet<String> = args.iter().cloned().collect();
                wanted.extend(minimal);
                let mut child = hints.clone();
                child.set_projection(wanted.clone());
                let effective = match &hints.projection {
                    Some(requested) => wanted.intersection(requested).cloned().collect(),
                    None => wanted,
                };
                Ok(StreamOp::Map {
                    stream: Box::new(self.lower_stream(stream, child)?),
                    op: PointWiseOp::Projection(effective),
                    schema: schema.clone(),
                })
            }
            Stream::Compute { stream, expression, alias, schema } => {
                let mut child = hints;
                child.add_projection(expression.free_variables());
                Ok(StreamOp::Map {
                    stream: Box::new(self.lower_stream(stream, child)?),
                    op: PointWiseOp::Compute {
                        expression: expression.clone(),
                        alias: alias.clone().unwrap_or_else(|| "result".to_string()),
                    },
                    schema: schema.clone(),
                })
            }
            Stream::Alias { stream, .. } => self.lower_stream(stream, hints),
            Stream::Join { stream, table, in_params, schema } => {
                let table_ast;
                let table = if in_params.is_empty() {
                    table.as_ref()
                } else {
                    table_ast = push_in_params(table, in_params);
                    &table_ast
                };
                let table_op = self.lower_table(table, hints.restrict_to(table.schema()))?;
                let stream_hints = hints.restrict_to(stream.schema());
                Ok(StreamOp::Join {
                    stream: Box::new(self.lower_stream(stream, stream_hints)?),
                    table: Box::new(table_op),
                    schema: schema.clone(),
                })
            }
        }
    }

    /// Lower `monitor(table)` into its stream pipeline.
    fn lower_monitor(
        &self,
        table: &Table,
        hints: QueryInvocationHints,
    ) -> Result<StreamOp, CompileError> {
        match table {
            Table::Invocation { invocation, schema } => {
                let mut hints = hints;
                if let Some(schema) = schema {
                    hints.add_projection(schema.minimal_projection.iter().cloned());
                }
                Ok(StreamOp::EdgeNew {
                    stream: Box::new(StreamOp::InvokeSubscribe {
                        invocation: invocation.clone(),
                        hints,
                        schema: schema.clone(),
                    }),
                })
            }
            Table::VarRef { name, in_params, schema } => Ok(StreamOp::EdgeNew {
                stream: Box::new(StreamOp::InvokeVarRef {
                    name: name.clone(),
                    in_params: in_params.clone(),
                    schema: schema.clone(),
                }),
            }),
            Table::Filter { table, filter, .. } => {
                let mut child = hints;
                child.add_projection(filter.free_variables());
                child.merge_filter(filter);
                Ok(StreamOp::EdgeFilter {
                    stream: Box::new(self.lower_monitor(table, child)?),
                    filter: self.lower_filter(filter)?,
                })
            }
            Table::Projection { table, args, computations, aliases, schema } => {
                let mut wanted: BTreeSet<String> = args.iter().cloned().collect();
                if let Some(inner) = table.schema() {
                    wanted.extend(inner.minimal_projection.iter().cloned());
                }
                let mut child = hints;
                let mut child_projection = wanted.clone();
                for computation in computations {
                    child_projection.extend(computation.free_variables());
                }
                child.set_projection(child_projection);
                let mut op = self.lower_monitor(table, child)?;
                for (i, computation) in computations.iter().enumerate() {
                    let alias = aliases
                        .get(i)
                        .cloned()
                        .flatten()
                        .unwrap_or_else(|| format!("__compute_{i}"));
                    wanted.insert(alias.clone());
                    op = StreamOp::Map {
                        stream: Box::new(op),
                        op: PointWiseOp::Compute {
                            expression: computation.clone(),
                            alias,
                        },
                        schema: schema.clone(),
                    };
                }
                Ok(StreamOp::Map {
                    stream: Box::new(op),
                    op: PointWiseOp::Projection(wanted),
                    schema: schema.clone(),
                })
            }
            Table::Compute { table, expression, alias, schema } => {
                let mut child = hints;
                child.add_projection(expression.free_variables());
                Ok(StreamOp::Map {
                    stream: Box::new(self.lower_monitor(table, child)?),
                    op: PointWiseOp::Compute {
                        expression: expression.clone(),
                        alias: alias.clone().unwrap_or_else(|| "result".to_string()),
                    },
                    schema: schema.clone(),
                })
            }
            Table::Alias { table, .. } => self.lower_monitor(table, hints),
            // ordering and truncation do not change when a row changes,
            // so they are dropped under a monitor
            Table::Sort { table, .. }
            | Table::Index { table, .. }
            | Table::Slice { table, .. }
            | Table::ArgMinMax { table, .. } => self.lower_monitor(table, hints),
            Table::Aggregation { table: inner, field, .. } => {
                // subscribe to the inner table, recompute the aggregate
                // on every change, and fire when the aggregate changes
                let mut inner_hints = QueryInvocationHints::new();
                if field == "*" {
                    inner_hints.set_projection(BTreeSet::new());
                } else {
                    inner_hints.set_projection([field.clone()].into_iter().collect());
                }
                let monitor = self.lower_monitor(inner, inner_hints)?;
                let aggregate = self.lower_table(table, QueryInvocationHints::new())?;
                Ok(StreamOp::EdgeNew {
                    stream: Box::new(StreamOp::InvokeTable {
                        stream: Box::new(monitor),
                        table: Box::new(aggregate),
                        schema: table_schema(table),
                    }),
                })
            }
            Table::Join { lhs, rhs, .. } => {
                // either side changing re-evaluates the join
                let union = StreamOp::Union {
                    lhs: Box::new(self.lower_monitor(lhs, hints.restrict_to(lhs.schema()))?),
                    rhs: Box::new(self.lower_monitor(rhs, hints.restrict_to(rhs.schema()))?),
                    schema: table_schema(table),
                };
                let join = self.lower_table(table, hints)?;
                Ok(StreamOp::EdgeNew {
                    stream: Box::new(StreamOp::InvokeTable {
                        stream: Box::new(union),
                        table: Box::new(join),
                        schema: table_schema(table),
                    }),
                })
            }
            Table::ReadResult { .. } => Err(CompileError::NotImplemented(
                "monitoring a stored result".to_string(),
            )),
            Table::Window { .. }
            | Table::TimeSeries { .. }
            | Table::Sequence { .. }
            | Table::History { .. } => Err(CompileError::NotImplemented(
                "monitoring history expressions".to_string(),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Filters
    // ------------------------------------------------------------------

    pub fn lower_filter(
        &self,
        filter: &BooleanExpression,
    ) -> Result<BooleanExpressionOp, CompileError> {
        match filter {
            BooleanExpression::True => Ok(BooleanExpressionOp::True),
            BooleanExpression::False => Ok(BooleanExpressionOp::False),
            BooleanExpression::And(ops) => Ok(BooleanExpressionOp::And(
                ops.iter()
                    .map(|o| self.lower_filter(o))
                    .collect::<Result<_, _>>()?,
            )),
            BooleanExpression::Or(ops) => Ok(BooleanExpressionOp::Or(
                ops.iter()
                    .map(|o| self.lower_filter(o))
                    .collect::<Result<_, _>>()?,
            )),
            BooleanExpression::Not(inner) => Ok(BooleanExpressionOp::Not(Box::new(
                self.lower_filter(inner)?,
            ))),
            BooleanExpression::Atom { name, operator, value, overload } => {
                Ok(BooleanExpressionOp::Atom {
                    name: name.clone(),
                    operator: operator.clone(),
                    value: value.clone(),
                    overload: overload.clone(),
                })
            }
            BooleanExpression::External { selector, channel, in_params, filter, schema } => {
                Ok(BooleanExpressionOp::External {
                    selector: selector.clone(),
                    channel: channel.clone(),
                    in_params: in_params.clone(),
                    filter: Box::new(self.lower_filter(filter)?),
                    schema: schema.clone(),
                })
            }
            BooleanExpression::Compute { lhs, operator, rhs, overload } => {
                Ok(BooleanExpressionOp::Compute {
                    lhs: lhs.clone(),
                    operator: operator.clone(),
                    rhs: rhs.clone(),
                    overload: overload.clone(),
                })
            }
            BooleanExpression::ExistentialSubquery { subquery } => {
                let lowered = self.lower_table(subquery, QueryInvocationHints::new())?;
                Ok(BooleanExpressionOp::ExistentialSubquery {
                    subquery: Box::new(lowered),
                })
            }
            BooleanExpression::ComparisonSubquery { lhs, operator, rhs, overload } => {
                let field = rhs
                    .schema()
                    .and_then(|s| s.out_params().next().map(|a| a.name.clone()))
                    .ok_or_else(|| {
                        CompileError::Internal(
                            "comparison subquery without a projected field".to_string(),
                        )
                    })?;
                let mut hints = QueryInvocationHints::new();
                hints.set_projection([field.clone()].into_iter().collect());
                let lowered = self.lower_table(rhs, hints)?;
                Ok(BooleanExpressionOp::ComparisonSubquery {
                    lhs: lhs.clone(),
                    operator: operator.clone(),
                    subquery: Box::new(lowered),
                    field,
                    overload: overload.clone(),
                })
            }
            BooleanExpression::DontCare { name } => {
                Ok(BooleanExpressionOp::DontCare { name: name.clone() })
            }
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn table_schema(table: &Table) -> Option<std::sync::Arc<FunctionDef>> {
    table.schema().cloned()
}

fn literal_number(value: &Value) -> Option<f64> {
    if let Value::Number(n) = value {
        Some(*n)
    } else {
        None
    }
}

fn collect_value_refs(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::VarRef { name } => {
            if !name.starts_with("__const_") {
                out.insert(name.clone());
            }
        }
        Value::Array(elems) => {
            for e in elems {
                collect_value_refs(e, out);
            }
        }
        _ => {}
    }
}

/// Whether any invocation or filter inside `table` reads an output of
/// `lhs_schema` (parameter passing across a join).
fn references_outputs(
    table: &Table,
    lhs_schema: Option<&std::sync::Arc<FunctionDef>>,
) -> bool {
    let Some(schema) = lhs_schema else { return false };
    let outputs: BTreeSet<&str> = schema.out_params().map(|a| a.name.as_str()).collect();

    let mut refs = BTreeSet::new();
    collect_table_value_refs(table, &mut refs);
    refs.iter().any(|name| outputs.contains(name.as_str()))
}

fn collect_table_value_refs(table: &Table, out: &mut BTreeSet<String>) {
    match table {
        Table::VarRef { in_params, .. } => {
            for p in in_params {
                collect_value_refs(&p.value, out);
            }
        }
        Table::Invocation { invocation, .. } => {
            for p in &invocation.in_params {
                collect_value_refs(&p.value, out);
            }
        }
        Table::ReadResult { .. } => {}
        Table::Filter { table, filter, .. } => {
            collect_table_value_refs(table, out);
            // only scope references count, not the table's own columns
            if let Some(schema) = table.schema() {
                for name in filter.free_variables() {
                    if !schema.has_argument(&name) {
                        out.insert(name);
                    }
                }
            } else {
                out.extend(filter.free_variables());
            }
        }
        Table::Projection { table, .. }
        | Table::Compute { table, .. }
        | Table::Alias { table, .. }
        | Table::Aggregation { table, .. }
        | Table::ArgMinMax { table, .. }
        | Table::Sort { table, .. }
        | Table::Index { table, .. }
        | Table::Slice { table, .. }
        | Table::Sequence { table, .. }
        | Table::History { table, .. } => collect_table_value_refs(table, out),
        Table::Join { lhs, rhs, in_params, .. } => {
            collect_table_value_refs(lhs, out);
            collect_table_value_refs(rhs, out);
            for p in in_params {
                collect_value_refs(&p.value, out);
            }
        }
        Table::Window { .. } | Table::TimeSeries { .. } => {}
    }
}

/// Clone `table` with extra input parameters appended to its leaf
/// invocation (used when a join passes parameters into its right side).
fn push_in_params(table: &Table, params: &[InputParam]) -> Table {
    let mut out = table.clone();
    push_in_params_mut(&mut out, params);
    out
}

fn push_in_params_mut(table: &mut Table, params: &[InputParam]) {
    match table {
        Table::VarRef { in_params, .. } => in_params.extend(params.iter().cloned()),
        Table::Invocation { invocation, .. } => {
            invocation.in_params.extend(params.iter().cloned())
        }
        Table::Filter { table, .. }
        | Table::Projection { table, .. }
        | Table::Compute { table, .. }
        | Table::Alias { table, .. }
        | Table::Aggregation { table, .. }
        | Table::ArgMinMax { table, .. }
        | Table::Sort { table, .. }
        | Table::Index { table, .. }
        | Table::Slice { table, .. }
        | Table::Sequence { table, .. }
        | Table::History { table, .. } => push_in_params_mut(table, params),
        Table::Join { lhs, .. } => push_in_params_mut(lhs, params),
        Table::ReadResult { .. } | Table::Window { .. } | Table::TimeSeries { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{ArgumentDef, DeviceSelector, Direction, FunctionType, Invocation};
    use crate::types::Type;
    use std::sync::Arc;

    fn query(kind: &str, name: &str, args: Vec<ArgumentDef>) -> Arc<FunctionDef> {
        let mut f = FunctionDef::new(kind, FunctionType::Query, name, args);
        f.is_list = true;
        f.is_monitorable = true;
        Arc::new(f)
    }

    fn orders() -> Arc<FunctionDef> {
        query(
            "org.shop",
            "orders",
            vec![
                ArgumentDef::new(Direction::Out, "customer", Type::String),
                ArgumentDef::new(Direction::Out, "amount", Type::Number),
            ],
        )
    }

    fn profile() -> Arc<FunctionDef> {
        query(
            "org.crm",
            "profile",
            vec![
                ArgumentDef::new(Direction::InOpt, "id", Type::String),
                ArgumentDef::new(Direction::Out, "email", Type::String),
            ],
        )
    }

    fn handles_own_queries(schema: &Arc<FunctionDef>) -> Arc<FunctionDef> {
        let mut f = (**schema).clone();
        f.annotations
            .insert("handle_thingtalk".to_string(), Value::Boolean(true));
        Arc::new(f)
    }

    fn invocation_table(schema: &Arc<FunctionDef>) -> Table {
        Table::Invocation {
            invocation: Invocation::new(
                DeviceSelector::new(schema.kind.clone()),
                schema.name.clone(),
            ),
            schema: Some(schema.clone()),
        }
    }

    fn join(lhs: Table, rhs: Table, in_params: Vec<InputParam>) -> Table {
        let schema = match (lhs.schema(), rhs.schema()) {
            (Some(a), Some(b)) => Some(Arc::new(a.join(b))),
            _ => None,
        };
        Table::Join {
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
            in_params,
            schema,
        }
    }

    #[test]
    fn test_independent_sides_become_cross_join() {
        let t = join(invocation_table(&orders()), invocation_table(&profile()), vec![]);
        let op = Lowerer::new()
            .lower_table(&t, QueryInvocationHints::new())
            .unwrap();
        assert!(matches!(op, TableOp::CrossJoin { device: None, .. }));
    }

    #[test]
    fn test_join_in_params_force_nested_loop() {
        let params = vec![InputParam::new("id", Value::VarRef { name: "customer".to_string() })];
        let t = join(invocation_table(&orders()), invocation_table(&profile()), params);
        let op = Lowerer::new()
            .lower_table(&t, QueryInvocationHints::new())
            .unwrap();

        let TableOp::NestedLoopJoin { rhs, .. } = op else {
            panic!("expected NestedLoopJoin, got {op:?}");
        };
        // the parameter was pushed into the right leaf invocation
        let TableOp::InvokeGet { invocation, .. } = rhs.as_ref() else {
            panic!("expected InvokeGet on the right side, got {rhs:?}");
        };
        assert_eq!(invocation.in_params.len(), 1);
        assert_eq!(invocation.in_params[0].name, "id");
        assert_eq!(
            invocation.in_params[0].value,
            Value::VarRef { name: "customer".to_string() }
        );
    }

    #[test]
    fn test_rhs_scope_reference_forces_nested_loop() {
        // no join-level parameters: the right invocation itself reads an
        // output of the left side
        let rhs = Table::Invocation {
            invocation: Invocation::new(DeviceSelector::new("org.crm"), "profile")
                .with_param("id", Value::VarRef { name: "customer".to_string() }),
            schema: Some(profile()),
        };
        let t = join(invocation_table(&orders()), rhs, vec![]);
        let op = Lowerer::new()
            .lower_table(&t, QueryInvocationHints::new())
            .unwrap();
        assert!(matches!(op, TableOp::NestedLoopJoin { .. }));
    }

    #[test]
    fn test_shared_device_becomes_pushdown_join() {
        let a = handles_own_queries(&query(
            "org.database",
            "orders",
            vec![ArgumentDef::new(Direction::Out, "amount", Type::Number)],
        ));
        let b = handles_own_queries(&query(
            "org.database",
            "customers",
            vec![ArgumentDef::new(Direction::Out, "name", Type::String)],
        ));
        let t = join(invocation_table(&a), invocation_table(&b), vec![]);
        let op = Lowerer::new()
            .lower_table(&t, QueryInvocationHints::new())
            .unwrap();

        let TableOp::Join { device, handle_thingtalk, .. } = op else {
            panic!("expected device-pushdown Join, got {op:?}");
        };
        assert!(handle_thingtalk);
        assert_eq!(device.map(|d| d.kind), Some("org.database".to_string()));
    }

    #[test]
    fn test_one_plain_side_disables_pushdown() {
        let a = handles_own_queries(&query(
            "org.database",
            "orders",
            vec![ArgumentDef::new(Direction::Out, "amount", Type::Number)],
        ));
        let t = join(invocation_table(&a), invocation_table(&profile()), vec![]);
        let op = Lowerer::new()
            .lower_table(&t, QueryInvocationHints::new())
            .unwrap();
        assert!(matches!(op, TableOp::CrossJoin { device: None, handle_thingtalk: false, .. }));
    }

    #[test]
    fn test_join_arms_get_restricted_hints() {
        let mut hints = QueryInvocationHints::new();
        hints.set_projection(
            ["customer".to_string(), "email".to_string()].into_iter().collect(),
        );
        hints.sort = Some(("amount".to_string(), SortDirection::Asc));
        hints.limit = Some(Value::Number(3.0));

        let t = join(invocation_table(&orders()), invocation_table(&profile()), vec![]);
        let op = Lowerer::new().lower_table(&t, hints).unwrap();

        let TableOp::CrossJoin { lhs, rhs, .. } = op else {
            panic!("expected CrossJoin, got {op:?}");
        };
        for (arm, own, foreign) in [(&lhs, "customer", "email"), (&rhs, "email", "customer")] {
            let TableOp::InvokeGet { hints, .. } = arm.as_ref() else {
                panic!("expected InvokeGet leaf, got {arm:?}");
            };
            let projection = hints.projection.as_ref().expect("arm keeps a projection");
            assert!(projection.contains(own));
            assert!(!projection.contains(foreign));
            // ordering and truncation never cross a join
            assert!(hints.sort.is_none());
            assert!(hints.limit.is_none());
        }
    }
}
