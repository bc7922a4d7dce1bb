//! # Operator Trees
//!
//! The query-algebra form the lowering pass produces and the operator
//! compiler consumes. Unlike the AST, these are strict trees with
//! parent-to-child ownership: streams of [`StreamOp`], tables of
//! [`TableOp`], reductions described by [`ReduceOp`], and filters mirrored
//! into [`BooleanExpressionOp`] with subqueries already lowered.
//!
//! Invocation leaves carry [`QueryInvocationHints`]: best-effort
//! projection/filter/sort/limit directives pushed down during lowering.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::ast::{
    BooleanExpression, DeviceSelector, FunctionDef, InputParam, Invocation, Overload,
    ScalarExpression, SortDirection, Statement,
};
use crate::typecheck::TypeError;
use crate::value::Value;

/// Compilation failure past the typechecker.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    /// The program uses a shape the compiler does not support yet
    #[error("not implemented: {0}")]
    NotImplemented(String),
    /// A malformed tree reached the compiler; always a bug upstream
    #[error("internal compiler error: {0}")]
    Internal(String),
    #[error(transparent)]
    Type(#[from] TypeError),
}

// ============================================================================
// Query invocation hints
// ============================================================================

/// Best-effort directives attached to invocation leaves, telling the
/// device which parameters will be consumed, which filter the caller will
/// apply anyway, and how results will be ordered and truncated.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryInvocationHints {
    /// Output parameters the caller needs; `None` means all of them
    pub projection: Option<BTreeSet<String>>,
    /// Filter the caller applies over the results
    pub filter: BooleanExpression,
    pub sort: Option<(String, SortDirection)>,
    pub limit: Option<Value>,
}

impl Default for QueryInvocationHints {
    fn default() -> Self {
        QueryInvocationHints {
            projection: None,
            filter: BooleanExpression::True,
            sort: None,
            limit: None,
        }
    }
}

impl QueryInvocationHints {
    pub fn new() -> Self {
        QueryInvocationHints::default()
    }

    /// Add names to the projection, if one is set.
    pub fn add_projection<I: IntoIterator<Item = String>>(&mut self, names: I) {
        if let Some(projection) = &mut self.projection {
            projection.extend(names);
        }
    }

    /// Replace the projection wholesale.
    pub fn set_projection(&mut self, names: BTreeSet<String>) {
        self.projection = Some(names);
    }

    /// Conjoin another filter into the hint, conservatively dropping
    /// branches a device cannot evaluate (externals, subqueries).
    pub fn merge_filter(&mut self, filter: &BooleanExpression) {
        let pushable = filter.restrict(&|_| true);
        let current = std::mem::replace(&mut self.filter, BooleanExpression::True);
        self.filter = BooleanExpression::and(vec![current, pushable]);
    }

    /// Restrict the hints to what one join arm's schema can answer:
    /// projection names absent from the schema are dropped, the filter is
    /// conservatively rewritten to `True` wherever it mentions an absent
    /// name, and sort/limit are cleared (they do not survive joins).
    pub fn restrict_to(&self, schema: Option<&Arc<FunctionDef>>) -> QueryInvocationHints {
        let keep = |name: &str| -> bool {
            schema.map(|s| s.has_argument(name)).unwrap_or(false)
        };
        let projection = self.projection.as_ref().map(|names| {
            names.iter().filter(|n| keep(n)).cloned().collect()
        });
        QueryInvocationHints {
            projection,
            filter: self.filter.restrict(&keep),
            sort: None,
            limit: None,
        }
    }
}

// ============================================================================
// Filters
// ============================================================================

/// The operator-tree mirror of [`BooleanExpression`], with subqueries
/// lowered to [`TableOp`]s.
#[derive(Debug, Clone, PartialEq)]
pub enum BooleanExpressionOp {
    True,
    False,
    And(Vec<BooleanExpressionOp>),
    Or(Vec<BooleanExpressionOp>),
    Not(Box<BooleanExpressionOp>),
    Atom {
        name: String,
        operator: String,
        value: Value,
        overload: Option<Overload>,
    },
    External {
        selector: DeviceSelector,
        channel: String,
        in_params: Vec<InputParam>,
        filter: Box<BooleanExpressionOp>,
        schema: Option<Arc<FunctionDef>>,
    },
    Compute {
        lhs: ScalarExpression,
        operator: String,
        rhs: ScalarExpression,
        overload: Option<Overload>,
    },
    ExistentialSubquery { subquery: Box<TableOp> },
    ComparisonSubquery {
        lhs: Value,
        operator: String,
        subquery: Box<TableOp>,
        /// Output field of the subquery being compared against
        field: String,
        overload: Option<Overload>,
    },
    DontCare { name: String },
}

// ============================================================================
// Point-wise and reduce operators
// ============================================================================

/// A per-tuple transformation.
#[derive(Debug, Clone, PartialEq)]
pub enum PointWiseOp {
    /// Keep only these fields
    Projection(BTreeSet<String>),
    /// Append a computed field
    Compute {
        expression: ScalarExpression,
        alias: String,
    },
    /// Append a boolean field computed from a filter expression
    BooleanCompute {
        expression: BooleanExpressionOp,
        alias: String,
    },
}

/// A whole-table reduction. The operator compiler drives these through an
/// init / advance / finish protocol around the inner table's loop.
#[derive(Debug, Clone, PartialEq)]
pub enum ReduceOp {
    /// `count` over the whole tuple
    Count,
    /// `count` over one field, distinct values only
    CountDistinct { field: String },
    Average { field: String },
    /// `sum`/`min`/`max` over one field
    SimpleAggregation { operator: String, field: String },
    /// First (or last) row of a sort: fused `Index[1] of Sort`
    SimpleArgMinMax { operator: String, field: String },
    /// General `argmin`/`argmax` with base and limit
    ComplexArgMinMax {
        operator: String,
        field: String,
        base: Value,
        limit: Value,
    },
    /// Sort by a plain field
    SimpleSort {
        field: String,
        direction: SortDirection,
    },
    /// Sort by a computed key
    ComplexSort {
        expression: ScalarExpression,
        direction: SortDirection,
    },
    /// Select a single literal 1-based index
    SimpleIndex { index: Value },
    /// Select arbitrary indices
    ComplexIndex { indices: Vec<Value> },
    Slice { base: Value, limit: Value },
}

// ============================================================================
// Tables
// ============================================================================

/// A table operator. `device` and `handle_thingtalk` record which device
/// the subtree runs on; they propagate up joins only when both sides
/// agree, enabling whole-subtree pushdown via `Join`.
#[derive(Debug, Clone, PartialEq)]
pub enum TableOp {
    /// Call a table declaration bound in scope
    InvokeVarRef {
        name: String,
        in_params: Vec<InputParam>,
        hints: QueryInvocationHints,
        schema: Option<Arc<FunctionDef>>,
    },
    /// Call a device query
    InvokeGet {
        invocation: Invocation,
        device: Option<DeviceSelector>,
        handle_thingtalk: bool,
        hints: QueryInvocationHints,
        schema: Option<Arc<FunctionDef>>,
    },
    /// Read the stored result of a previous invocation
    ReadResult {
        function: String,
        index: Value,
        schema: Option<Arc<FunctionDef>>,
    },
    Filter {
        table: Box<TableOp>,
        filter: BooleanExpressionOp,
        device: Option<DeviceSelector>,
        handle_thingtalk: bool,
        schema: Option<Arc<FunctionDef>>,
    },
    Map {
        table: Box<TableOp>,
        op: PointWiseOp,
        device: Option<DeviceSelector>,
        handle_thingtalk: bool,
        schema: Option<Arc<FunctionDef>>,
    },
    Reduce {
        table: Box<TableOp>,
        op: ReduceOp,
        device: Option<DeviceSelector>,
        handle_thingtalk: bool,
        schema: Option<Arc<FunctionDef>>,
    },
    /// Independent sides, all combinations
    CrossJoin {
        lhs: Box<TableOp>,
        rhs: Box<TableOp>,
        device: Option<DeviceSelector>,
        handle_thingtalk: bool,
        schema: Option<Arc<FunctionDef>>,
    },
    /// Right side re-evaluated per left tuple (parameter passing)
    NestedLoopJoin {
        lhs: Box<TableOp>,
        rhs: Box<TableOp>,
        device: Option<DeviceSelector>,
        handle_thingtalk: bool,
        schema: Option<Arc<FunctionDef>>,
    },
    /// Whole-join pushdown to a device that handles its own queries
    Join {
        lhs: Box<TableOp>,
        rhs: Box<TableOp>,
        device: Option<DeviceSelector>,
        handle_thingtalk: bool,
        schema: Option<Arc<FunctionDef>>,
    },
}

impl TableOp {
    pub fn schema(&self) -> Option<&Arc<FunctionDef>> {
        match self {
            TableOp::InvokeVarRef { schema, .. }
            | TableOp::InvokeGet { schema, .. }
            | TableOp::ReadResult { schema, .. }
            | TableOp::Filter { schema, .. }
            | TableOp::Map { schema, .. }
            | TableOp::Reduce { schema, .. }
            | TableOp::CrossJoin { schema, .. }
            | TableOp::NestedLoopJoin { schema, .. }
            | TableOp::Join { schema, .. } => schema.as_ref(),
        }
    }

    pub fn device(&self) -> Option<&DeviceSelector> {
        match self {
            TableOp::InvokeGet { device, .. }
            | TableOp::Filter { device, .. }
            | TableOp::Map { device, .. }
            | TableOp::Reduce { device, .. }
            | TableOp::CrossJoin { device, .. }
            | TableOp::NestedLoopJoin { device, .. }
            | TableOp::Join { device, .. } => device.as_ref(),
            TableOp::InvokeVarRef { .. } | TableOp::ReadResult { .. } => None,
        }
    }

    pub fn handle_thingtalk(&self) -> bool {
        match self {
            TableOp::InvokeGet { handle_thingtalk, .. }
            | TableOp::Filter { handle_thingtalk, .. }
            | TableOp::Map { handle_thingtalk, .. }
            | TableOp::Reduce { handle_thingtalk, .. }
            | TableOp::CrossJoin { handle_thingtalk, .. }
            | TableOp::NestedLoopJoin { handle_thingtalk, .. }
            | TableOp::Join { handle_thingtalk, .. } => *handle_thingtalk,
            TableOp::InvokeVarRef { .. } | TableOp::ReadResult { .. } => false,
        }
    }
}

// ============================================================================
// Streams
// ============================================================================

/// A stream operator.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamOp {
    /// Degenerate stream that fires exactly once, immediately
    Now,
    /// Call a stream declaration bound in scope
    InvokeVarRef {
        name: String,
        in_params: Vec<InputParam>,
        schema: Option<Arc<FunctionDef>>,
    },
    /// Subscribe to changes of a device query
    InvokeSubscribe {
        invocation: Invocation,
        hints: QueryInvocationHints,
        schema: Option<Arc<FunctionDef>>,
    },
    /// For each firing of the stream, evaluate the table
    InvokeTable {
        stream: Box<StreamOp>,
        table: Box<TableOp>,
        schema: Option<Arc<FunctionDef>>,
    },
    Timer {
        base: Option<Value>,
        interval: Value,
        frequency: Option<Value>,
    },
    AtTimer {
        times: Vec<Value>,
        expiration: Option<Value>,
    },
    OnTimer { dates: Vec<Value> },
    Filter {
        stream: Box<StreamOp>,
        filter: BooleanExpressionOp,
        schema: Option<Arc<FunctionDef>>,
    },
    /// Fire only for tuples not seen before (by watched keys)
    EdgeNew { stream: Box<StreamOp> },
    /// Fire only on the rising edge of the predicate
    EdgeFilter {
        stream: Box<StreamOp>,
        filter: BooleanExpressionOp,
    },
    Map {
        stream: Box<StreamOp>,
        op: PointWiseOp,
        schema: Option<Arc<FunctionDef>>,
    },
    Union {
        lhs: Box<StreamOp>,
        rhs: Box<StreamOp>,
        schema: Option<Arc<FunctionDef>>,
    },
    /// For each stream event, cross with the table's current contents
    Join {
        stream: Box<StreamOp>,
        table: Box<TableOp>,
        schema: Option<Arc<FunctionDef>>,
    },
}

// ============================================================================
// Actions and rules
// ============================================================================

/// A lowered action.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOp {
    /// Deliver the current tuple to the output channel
    Notify,
    /// Invoke a device action
    InvokeDo { invocation: Invocation },
    /// Invoke an action declaration bound in scope
    InvokeVarRef {
        name: String,
        in_params: Vec<InputParam>,
    },
}

/// One compiled rule: an optional event source feeding a list of actions.
/// `source` points back at the statement this came from, for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleOp {
    pub stream: Option<StreamOp>,
    pub actions: Vec<ActionOp>,
    /// Whether any action is `notify`; gates the synthetic output
    /// projection and its elimination
    pub has_output: bool,
    pub source: Statement,
}
