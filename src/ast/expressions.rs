//! # Expression Vocabulary
//!
//! The mutually recursive table/stream/filter algebra of the language.
//! Tables are finite re-entrant tuple sequences, streams are infinite
//! event-driven ones, and boolean expressions filter either. Stream and
//! table nodes own their children (`Box`), so the mutual recursion forms
//! strict trees; function schemas attached by the typechecker are shared
//! behind `Arc`.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::functions::FunctionDef;
use crate::value::Value;

/// Which device a primitive invocation targets.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSelector {
    /// Device class, e.g. `com.twitter`
    pub kind: String,
    /// Concrete device id once slot-filling has chosen one
    pub id: Option<String>,
    /// Attribute constraints used to pick a device (`name="kitchen"`)
    pub attributes: Vec<InputParam>,
    /// Whether the invocation targets every matching device
    pub all: bool,
    /// Remote principal, for programs executing on someone else's behalf
    pub principal: Option<Value>,
}

impl DeviceSelector {
    pub fn new(kind: impl Into<String>) -> Self {
        DeviceSelector {
            kind: kind.into(),
            id: None,
            attributes: Vec::new(),
            all: false,
            principal: None,
        }
    }
}

/// A named input parameter binding.
#[derive(Debug, Clone, PartialEq)]
pub struct InputParam {
    pub name: String,
    pub value: Value,
}

impl InputParam {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        InputParam { name: name.into(), value }
    }
}

/// One primitive invocation of a device function.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub selector: DeviceSelector,
    pub channel: String,
    pub in_params: Vec<InputParam>,
    pub schema: Option<Arc<FunctionDef>>,
}

impl Invocation {
    pub fn new(selector: DeviceSelector, channel: impl Into<String>) -> Self {
        Invocation {
            selector,
            channel: channel.into(),
            in_params: Vec::new(),
            schema: None,
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: Value) -> Self {
        self.in_params.push(InputParam::new(name, value));
        self
    }
}

/// A scalar computation over the current tuple: either a plain value
/// (possibly a `VarRef` into scope) or an operator applied to operands.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarExpression {
    Primary(Value),
    Derived {
        op: String,
        operands: Vec<ScalarExpression>,
    },
}

impl ScalarExpression {
    /// Names this expression reads from the surrounding tuple scope.
    pub fn free_variables(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_free_variables(&mut out);
        out
    }

    fn collect_free_variables(&self, out: &mut BTreeSet<String>) {
        match self {
            ScalarExpression::Primary(Value::VarRef { name }) => {
                if !name.starts_with("__const_") {
                    out.insert(name.clone());
                }
            }
            ScalarExpression::Primary(_) => {}
            ScalarExpression::Derived { operands, .. } => {
                for operand in operands {
                    operand.collect_free_variables(out);
                }
            }
        }
    }
}

/// Overload triple attached by the typechecker to comparisons:
/// `(lhsType, rhsType, resultType)`.
pub type Overload = [crate::types::Type; 3];

/// A filter over the current tuple (and scope).
#[derive(Debug, Clone, PartialEq)]
pub enum BooleanExpression {
    True,
    False,
    And(Vec<BooleanExpression>),
    Or(Vec<BooleanExpression>),
    Not(Box<BooleanExpression>),
    /// `name op value`, e.g. `text =~ "rust"`
    Atom {
        name: String,
        operator: String,
        value: Value,
        overload: Option<Overload>,
    },
    /// A predicate over another device's query:
    /// `@org.weather.current() { temperature >= 30C }`
    External {
        selector: DeviceSelector,
        channel: String,
        in_params: Vec<InputParam>,
        filter: Box<BooleanExpression>,
        schema: Option<Arc<FunctionDef>>,
    },
    /// A comparison between computed scalars
    Compute {
        lhs: ScalarExpression,
        operator: String,
        rhs: ScalarExpression,
        overload: Option<Overload>,
    },
    /// `any(subquery)`
    ExistentialSubquery { subquery: Box<Table> },
    /// `lhs op any(subquery)`, the subquery projecting a single field
    ComparisonSubquery {
        lhs: Value,
        operator: String,
        rhs: Box<Table>,
        overload: Option<Overload>,
    },
    /// Explicit "anything is fine" marker for a parameter
    DontCare { name: String },
}

impl BooleanExpression {
    pub fn and(operands: Vec<BooleanExpression>) -> BooleanExpression {
        let mut flat = Vec::new();
        for op in operands {
            match op {
                BooleanExpression::True => {}
                BooleanExpression::And(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => BooleanExpression::True,
            1 => flat.into_iter().next().unwrap_or(BooleanExpression::True),
            _ => BooleanExpression::And(flat),
        }
    }

    pub fn is_true(&self) -> bool {
        matches!(self, BooleanExpression::True)
    }

    /// Tuple-scope names this filter reads: atom names, scalar free
    /// variables, var-refs inside values and external parameters.
    pub fn free_variables(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_free_variables(&mut out);
        out
    }

    fn collect_free_variables(&self, out: &mut BTreeSet<String>) {
        match self {
            BooleanExpression::True
            | BooleanExpression::False
            | BooleanExpression::DontCare { .. } => {}
            BooleanExpression::And(ops) | BooleanExpression::Or(ops) => {
                for op in ops {
                    op.collect_free_variables(out);
                }
            }
            BooleanExpression::Not(inner) => inner.collect_free_variables(out),
            BooleanExpression::Atom { name, value, .. } => {
                out.insert(name.clone());
                collect_value_vars(value, out);
            }
            BooleanExpression::External { in_params, .. } => {
                for p in in_params {
                    collect_value_vars(&p.value, out);
                }
                // the inner filter runs against the external function's
                // outputs, not our tuple
            }
            BooleanExpression::Compute { lhs, rhs, .. } => {
                lhs.collect_free_variables(out);
                rhs.collect_free_variables(out);
            }
            BooleanExpression::ExistentialSubquery { .. } => {}
            BooleanExpression::ComparisonSubquery { lhs, .. } => {
                collect_value_vars(lhs, out);
            }
        }
    }

    /// Conservative rewrite dropping every branch that mentions a name
    /// `keep` rejects: such branches become `True`. Used when hints cross
    /// a join arm whose schema does not carry the name, and to strip
    /// external predicates and subqueries from pushed-down hints.
    pub fn restrict(&self, keep: &dyn Fn(&str) -> bool) -> BooleanExpression {
        match self {
            BooleanExpression::True => BooleanExpression::True,
            BooleanExpression::False => BooleanExpression::False,
            BooleanExpression::And(ops) => {
                BooleanExpression::and(ops.iter().map(|o| o.restrict(keep)).collect())
            }
            BooleanExpression::Or(ops) => {
                let restricted: Vec<_> = ops.iter().map(|o| o.restrict(keep)).collect();
                if restricted.iter().any(BooleanExpression::is_true) {
                    BooleanExpression::True
                } else {
                    BooleanExpression::Or(restricted)
                }
            }
            BooleanExpression::Not(inner) => {
                let restricted = inner.restrict(keep);
                if restricted.is_true() {
                    // inner branch was dropped, drop the negation too
                    BooleanExpression::True
                } else {
                    BooleanExpression::Not(Box::new(restricted))
                }
            }
            BooleanExpression::Atom { name, value, .. } => {
                let mut names = BTreeSet::new();
                names.insert(name.clone());
                collect_value_vars(value, &mut names);
                if names.iter().all(|n| keep(n)) {
                    self.clone()
                } else {
                    BooleanExpression::True
                }
            }
            BooleanExpression::Compute { .. } => {
                if self.free_variables().iter().all(|n| keep(n)) {
                    self.clone()
                } else {
                    BooleanExpression::True
                }
            }
            // Externals and subqueries never travel as hints
            BooleanExpression::External { .. }
            | BooleanExpression::ExistentialSubquery { .. }
            | BooleanExpression::ComparisonSubquery { .. } => BooleanExpression::True,
            BooleanExpression::DontCare { .. } => BooleanExpression::True,
        }
    }
}

fn collect_value_vars(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::VarRef { name } => {
            if !name.starts_with("__const_") {
                out.insert(name.clone());
            }
        }
        Value::Array(elems) => {
            for e in elems {
                collect_value_vars(e, out);
            }
        }
        _ => {}
    }
}

/// Direction of a sort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    Asc,
    Desc,
}

/// The key of a sort: a plain output field or a computed scalar.
#[derive(Debug, Clone, PartialEq)]
pub enum SortKey {
    Field(String),
    Expression(ScalarExpression),
}

/// A finite sequence of typed tuples produced by a query.
#[derive(Debug, Clone, PartialEq)]
pub enum Table {
    /// Reference to a table declaration in scope
    VarRef {
        name: String,
        in_params: Vec<InputParam>,
        schema: Option<Arc<FunctionDef>>,
    },
    Invocation {
        invocation: Invocation,
        schema: Option<Arc<FunctionDef>>,
    },
    /// Read the stored result of a previous invocation
    ReadResult {
        function: String,
        index: Value,
        schema: Option<Arc<FunctionDef>>,
    },
    Filter {
        table: Box<Table>,
        filter: BooleanExpression,
        schema: Option<Arc<FunctionDef>>,
    },
    Projection {
        table: Box<Table>,
        args: Vec<String>,
        computations: Vec<ScalarExpression>,
        aliases: Vec<Option<String>>,
        schema: Option<Arc<FunctionDef>>,
    },
    Compute {
        table: Box<Table>,
        expression: ScalarExpression,
        alias: Option<String>,
        schema: Option<Arc<FunctionDef>>,
    },
    Alias {
        table: Box<Table>,
        name: String,
        schema: Option<Arc<FunctionDef>>,
    },
    Aggregation {
        table: Box<Table>,
        /// `count`, `sum`, `avg`, `min`, `max`
        operator: String,
        /// Aggregated field, or `*` for whole-tuple count
        field: String,
        alias: Option<String>,
        schema: Option<Arc<FunctionDef>>,
    },
    ArgMinMax {
        table: Box<Table>,
        /// `argmin` or `argmax`
        operator: String,
        field: String,
        base: Value,
        limit: Value,
        schema: Option<Arc<FunctionDef>>,
    },
    Sort {
        table: Box<Table>,
        key: SortKey,
        direction: SortDirection,
        schema: Option<Arc<FunctionDef>>,
    },
    Index {
        table: Box<Table>,
        indices: Vec<Value>,
        schema: Option<Arc<FunctionDef>>,
    },
    Slice {
        table: Box<Table>,
        base: Value,
        limit: Value,
        schema: Option<Arc<FunctionDef>>,
    },
    Join {
        lhs: Box<Table>,
        rhs: Box<Table>,
        in_params: Vec<InputParam>,
        schema: Option<Arc<FunctionDef>>,
    },
    Window {
        base: Value,
        delta: Value,
        stream: Box<Stream>,
        schema: Option<Arc<FunctionDef>>,
    },
    TimeSeries {
        base: Value,
        delta: Value,
        stream: Box<Stream>,
        schema: Option<Arc<FunctionDef>>,
    },
    Sequence {
        base: Value,
        delta: Value,
        table: Box<Table>,
        schema: Option<Arc<FunctionDef>>,
    },
    History {
        base: Value,
        delta: Value,
        table: Box<Table>,
        schema: Option<Arc<FunctionDef>>,
    },
}

impl Table {
    /// The function signature describing this table's tuples, once the
    /// typechecker has run.
    pub fn schema(&self) -> Option<&Arc<FunctionDef>> {
        match self {
            Table::VarRef { schema, .. }
            | Table::Invocation { schema, .. }
            | Table::ReadResult { schema, .. }
            | Table::Filter { schema, .. }
            | Table::Projection { schema, .. }
            | Table::Compute { schema, .. }
            | Table::Alias { schema, .. }
            | Table::Aggregation { schema, .. }
            | Table::ArgMinMax { schema, .. }
            | Table::Sort { schema, .. }
            | Table::Index { schema, .. }
            | Table::Slice { schema, .. }
            | Table::Join { schema, .. }
            | Table::Window { schema, .. }
            | Table::TimeSeries { schema, .. }
            | Table::Sequence { schema, .. }
            | Table::History { schema, .. } => schema.as_ref(),
        }
    }
}

/// An infinite event-driven sequence of typed tuples.
#[derive(Debug, Clone, PartialEq)]
pub enum Stream {
    /// Reference to a stream declaration in scope
    VarRef {
        name: String,
        in_params: Vec<InputParam>,
        schema: Option<Arc<FunctionDef>>,
    },
    /// `timer(base=..., interval=...)`
    Timer {
        base: Option<Value>,
        interval: Value,
        frequency: Option<Value>,
        schema: Option<Arc<FunctionDef>>,
    },
    /// `attimer(time=[...])`
    AtTimer {
        times: Vec<Value>,
        expiration: Option<Value>,
        schema: Option<Arc<FunctionDef>>,
    },
    /// `ontimer(date=[...])`
    OnTimer {
        dates: Vec<Value>,
        schema: Option<Arc<FunctionDef>>,
    },
    /// `monitor(table)`; `args` restricts which fields are watched
    Monitor {
        table: Box<Table>,
        args: Option<Vec<String>>,
        schema: Option<Arc<FunctionDef>>,
    },
    EdgeNew {
        stream: Box<Stream>,
        schema: Option<Arc<FunctionDef>>,
    },
    EdgeFilter {
        stream: Box<Stream>,
        filter: BooleanExpression,
        schema: Option<Arc<FunctionDef>>,
    },
    Filter {
        stream: Box<Stream>,
        filter: BooleanExpression,
        schema: Option<Arc<FunctionDef>>,
    },
    Projection {
        stream: Box<Stream>,
        args: Vec<String>,
        schema: Option<Arc<FunctionDef>>,
    },
    Compute {
        stream: Box<Stream>,
        expression: ScalarExpression,
        alias: Option<String>,
        schema: Option<Arc<FunctionDef>>,
    },
    Alias {
        stream: Box<Stream>,
        name: String,
        schema: Option<Arc<FunctionDef>>,
    },
    /// For each stream event, evaluate the table with the event in scope
    Join {
        stream: Box<Stream>,
        table: Box<Table>,
        in_params: Vec<InputParam>,
        schema: Option<Arc<FunctionDef>>,
    },
}

impl Stream {
    pub fn schema(&self) -> Option<&Arc<FunctionDef>> {
        match self {
            Stream::VarRef { schema, .. }
            | Stream::Timer { schema, .. }
            | Stream::AtTimer { schema, .. }
            | Stream::OnTimer { schema, .. }
            | Stream::Monitor { schema, .. }
            | Stream::EdgeNew { schema, .. }
            | Stream::EdgeFilter { schema, .. }
            | Stream::Filter { schema, .. }
            | Stream::Projection { schema, .. }
            | Stream::Compute { schema, .. }
            | Stream::Alias { schema, .. }
            | Stream::Join { schema, .. } => schema.as_ref(),
        }
    }
}

/// A side-effecting invocation consuming the current tuple.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// The builtin `notify` output
    Notify { schema: Option<Arc<FunctionDef>> },
    Invocation {
        invocation: Invocation,
        schema: Option<Arc<FunctionDef>>,
    },
    /// Reference to an action declaration in scope
    VarRef {
        name: String,
        in_params: Vec<InputParam>,
        schema: Option<Arc<FunctionDef>>,
    },
}

impl Action {
    pub fn is_notify(&self) -> bool {
        matches!(self, Action::Notify { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn atom(name: &str, op: &str, value: Value) -> BooleanExpression {
        BooleanExpression::Atom {
            name: name.to_string(),
            operator: op.to_string(),
            value,
            overload: None,
        }
    }

    #[test]
    fn test_and_flattens_and_drops_true() {
        let f = BooleanExpression::and(vec![
            BooleanExpression::True,
            atom("a", "==", Value::Number(1.0)),
            BooleanExpression::And(vec![atom("b", "==", Value::Number(2.0))]),
        ]);
        match f {
            BooleanExpression::And(ops) => assert_eq!(ops.len(), 2),
            other => panic!("expected And, got {other:?}"),
        }
    }

    #[test]
    fn test_free_variables() {
        let f = BooleanExpression::and(vec![
            atom("text", "=~", Value::String("rust".into())),
            atom("author", "==", Value::VarRef { name: "me".into() }),
        ]);
        let vars = f.free_variables();
        assert!(vars.contains("text"));
        assert!(vars.contains("author"));
        assert!(vars.contains("me"));
    }

    #[test]
    fn test_restrict_drops_absent_names() {
        let f = BooleanExpression::and(vec![
            atom("text", "=~", Value::String("rust".into())),
            atom("other", "==", Value::Number(1.0)),
        ]);
        let restricted = f.restrict(&|n| n == "text");
        assert_eq!(
            restricted,
            atom("text", "=~", Value::String("rust".into()))
        );
    }

    #[test]
    fn test_restrict_or_is_conservative() {
        let f = BooleanExpression::Or(vec![
            atom("text", "=~", Value::String("rust".into())),
            atom("other", "==", Value::Number(1.0)),
        ]);
        // one disjunct dropped -> whole disjunction is no longer a valid
        // restriction, so it must collapse to True
        assert!(f.restrict(&|n| n == "text").is_true());
    }
}
