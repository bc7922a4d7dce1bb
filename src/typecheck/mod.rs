//! # Typechecker
//!
//! Resolves every invocation, var-ref and external predicate against the
//! schema retriever, attaches the resulting `FunctionDef`s to the AST,
//! verifies parameter and filter types unify, and decorates comparisons
//! with overload triples from the coercion table.
//!
//! Resolution happens in two phases: a prefetch walk collects every
//! `(kind, function)` the program mentions and resolves them concurrently
//! (so they coalesce into one catalog batch), then the check itself runs
//! synchronously against the resolved map.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use futures_util::future::join_all;

use crate::ast::builtins::{self, BUILTIN_KIND};
use crate::ast::{
    Action, ArgumentDef, BooleanExpression, ClassDef, Declaration, DeclarationBody,
    DeclarationKind, Direction, FunctionDef, FunctionType, InputParam, Invocation, Overload,
    Program, ScalarExpression, SortKey, Statement, Stream, Table,
};
use crate::schema::{FunctionSelector, SchemaError, SchemaRetriever};
use crate::types::{EntitySubtypeMap, Type};
use crate::value::Value;

/// Type or resolution failure. Fatal for the compile request.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TypeError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("{name} is not in scope")]
    NotInScope { name: String },
    #[error("no parameter {name} in {function}")]
    UnknownParameter { name: String, function: String },
    #[error("invalid type for {name}: expected {expected}, have {have}")]
    Mismatch {
        name: String,
        expected: Type,
        have: Type,
    },
    #[error("operator {operator} cannot be applied to {lhs} and {rhs}")]
    NoOverload {
        operator: String,
        lhs: Type,
        rhs: Type,
    },
    #[error("{function} is not monitorable")]
    NotMonitorable { function: String },
    #[error("invalid use of aggregation {operator} on field {field}")]
    InvalidAggregation { operator: String, field: String },
    #[error("{0}")]
    Invalid(String),
}

/// Typecheck a program in place, filling every `schema` slot.
pub async fn typecheck_program(
    program: &mut Program,
    schemas: &SchemaRetriever,
) -> Result<(), TypeError> {
    let subtypes = schemas.entity_subtype_map().await?;

    let mut locals: HashMap<String, Arc<ClassDef>> = HashMap::new();
    for class in &program.classes {
        class
            .validate()
            .map_err(|message| SchemaError::Invalid { kind: class.kind.clone(), message })?;
        locals.insert(class.kind.clone(), Arc::new(class.clone()));
    }

    // Phase 1: prefetch every remote function the program mentions. The
    // lookups run concurrently, so they coalesce into one catalog batch.
    let mut refs: BTreeSet<(String, FunctionType, String)> = BTreeSet::new();
    collect_program_refs(program, &mut refs);
    refs.retain(|(kind, _, _)| kind != BUILTIN_KIND && !locals.contains_key(kind));

    let lookups = refs.iter().map(|(kind, ftype, name)| {
        let selector = match ftype {
            FunctionType::Query => FunctionSelector::Query,
            FunctionType::Action => FunctionSelector::Action,
        };
        async move {
            let result = schemas.get_schema(kind, selector, name).await;
            ((kind.clone(), *ftype, name.clone()), result)
        }
    });
    let mut resolved: HashMap<(String, FunctionType, String), Arc<FunctionDef>> = HashMap::new();
    for (key, result) in join_all(lookups).await {
        resolved.insert(key, result?);
    }

    // Phase 2: the synchronous check proper.
    let mut checker = TypeChecker {
        subtypes,
        locals,
        resolved,
        declarations: HashMap::new(),
    };

    let mut declarations = std::mem::take(&mut program.declarations);
    for decl in &mut declarations {
        checker.check_declaration(decl)?;
    }
    program.declarations = declarations;

    let mut rules = std::mem::take(&mut program.rules);
    for statement in &mut rules {
        checker.check_statement(statement)?;
    }
    program.rules = rules;

    if let Some(principal) = &program.principal {
        let ptype = principal.get_type();
        let ok = matches!(
            &ptype,
            Type::Entity(kind) if kind == "tt:contact" || kind == "tt:username"
        );
        if !ok {
            return Err(TypeError::Mismatch {
                name: "principal".to_string(),
                expected: Type::Entity("tt:contact".to_string()),
                have: ptype,
            });
        }
    }
    Ok(())
}

// ============================================================================
// Reference collection (prefetch walk)
// ============================================================================

fn collect_program_refs(program: &Program, out: &mut BTreeSet<(String, FunctionType, String)>) {
    for decl in &program.declarations {
        match &decl.body {
            DeclarationBody::Stream(s) => collect_stream_refs(s, out),
            DeclarationBody::Table(t) => collect_table_refs(t, out),
            DeclarationBody::Action(a) => collect_action_refs(a, out),
        }
    }
    for statement in &program.rules {
        match statement {
            Statement::Declaration(_) => {}
            Statement::Rule { stream, actions } => {
                collect_stream_refs(stream, out);
                for a in actions {
                    collect_action_refs(a, out);
                }
            }
            Statement::Command { table, actions } => {
                if let Some(table) = table {
                    collect_table_refs(table, out);
                }
                for a in actions {
                    collect_action_refs(a, out);
                }
            }
        }
    }
}

fn collect_table_refs(table: &Table, out: &mut BTreeSet<(String, FunctionType, String)>) {
    match table {
        Table::VarRef { .. } => {}
        Table::Invocation { invocation, .. } => {
            out.insert((
                invocation.selector.kind.clone(),
                FunctionType::Query,
                invocation.channel.clone(),
            ));
        }
        Table::ReadResult { function, .. } => {
            if let Some((kind, name)) = function.rsplit_once(':') {
                out.insert((kind.to_string(), FunctionType::Query, name.to_string()));
            }
        }
        Table::Filter { table, filter, .. } => {
            collect_table_refs(table, out);
            collect_filter_refs(filter, out);
        }
        Table::Projection { table, .. }
        | Table::Compute { table, .. }
        | Table::Alias { table, .. }
        | Table::Aggregation { table, .. }
        | Table::ArgMinMax { table, .. }
        | Table::Sort { table, .. }
        | Table::Index { table, .. }
        | Table::Slice { table, .. } => collect_table_refs(table, out),
        Table::Join { lhs, rhs, .. } => {
            collect_table_refs(lhs, out);
            collect_table_refs(rhs, out);
        }
        Table::Window { stream, .. } | Table::TimeSeries { stream, .. } => {
            collect_stream_refs(stream, out)
        }
        Table::Sequence { table, .. } | Table::History { table, .. } => {
            collect_table_refs(table, out)
        }
    }
}

fn collect_stream_refs(stream: &Stream, out: &mut BTreeSet<(String, FunctionType, String)>) {
    match stream {
        Stream::VarRef { .. }
        | Stream::Timer { .. }
        | Stream::AtTimer { .. }
        | Stream::OnTimer { .. } => {}
        Stream::Monitor { table, .. } => collect_table_refs(table, out),
        Stream::EdgeNew { stream, .. }
        | Stream::Projection { stream, .. }
        | Stream::Compute { stream, .. }
        | Stream::Alias { stream, .. } => collect_stream_refs(stream, out),
        Stream::EdgeFilter { stream, filter, .. } | Stream::Filter { stream, filter, .. } => {
            collect_stream_refs(stream, out);
            collect_filter_refs(filter, out);
        }
        Stream::Join { stream, table, .. } => {
            collect_stream_refs(stream, out);
            collect_table_refs(table, out);
        }
    }
}

fn collect_action_refs(action: &Action, out: &mut BTreeSet<(String, FunctionType, String)>) {
    if let Action::Invocation { invocation, .. } = action {
        out.insert((
            invocation.selector.kind.clone(),
            FunctionType::Action,
            invocation.channel.clone(),
        ));
    }
}

fn collect_filter_refs(
    filter: &BooleanExpression,
    out: &mut BTreeSet<(String, FunctionType, String)>,
) {
    match filter {
        BooleanExpression::And(ops) | BooleanExpression::Or(ops) => {
            for op in ops {
                collect_filter_refs(op, out);
            }
        }
        BooleanExpression::Not(inner) => collect_filter_refs(inner, out),
        BooleanExpression::External { selector, channel, filter, .. } => {
            out.insert((selector.kind.clone(), FunctionType::Query, channel.clone()));
            collect_filter_refs(filter, out);
        }
        BooleanExpression::ExistentialSubquery { subquery } => collect_table_refs(subquery, out),
        BooleanExpression::ComparisonSubquery { rhs, .. } => collect_table_refs(rhs, out),
        _ => {}
    }
}

// ============================================================================
// The checker
// ============================================================================

/// Lexical scope for value references: out-params of enclosing tables and
/// declaration lambda arguments.
#[derive(Debug, Clone, Default)]
struct Scope {
    vars: HashMap<String, Type>,
}

impl Scope {
    fn get(&self, name: &str) -> Option<&Type> {
        self.vars.get(name)
    }

    fn insert(&mut self, name: impl Into<String>, t: Type) {
        self.vars.insert(name.into(), t);
    }

    fn add_outputs(&mut self, schema: &FunctionDef) {
        for arg in schema.out_params() {
            self.vars.insert(arg.name.clone(), arg.arg_type.clone());
        }
    }
}

struct TypeChecker {
    subtypes: EntitySubtypeMap,
    locals: HashMap<String, Arc<ClassDef>>,
    resolved: HashMap<(String, FunctionType, String), Arc<FunctionDef>>,
    /// Signatures synthesized for `let` declarations seen so far
    declarations: HashMap<String, Arc<FunctionDef>>,
}

impl TypeChecker {
    fn lookup(
        &self,
        kind: &str,
        ftype: FunctionType,
        name: &str,
    ) -> Result<Arc<FunctionDef>, TypeError> {
        if kind == BUILTIN_KIND {
            let builtin = match (ftype, name) {
                (FunctionType::Query, "timer") => Some(builtins::timer()),
                (FunctionType::Query, "attimer") => Some(builtins::attimer()),
                (FunctionType::Query, "ontimer") => Some(builtins::ontimer()),
                (FunctionType::Action, "notify") => Some(builtins::notify()),
                _ => None,
            };
            return builtin.map(Arc::new).ok_or_else(|| {
                SchemaError::FunctionNotFound { kind: kind.to_string(), name: name.to_string() }
                    .into()
            });
        }
        if let Some(class) = self.locals.get(kind) {
            let found = match ftype {
                FunctionType::Query => class.get_query(name),
                FunctionType::Action => class.get_action(name),
            };
            return found.map(|f| Arc::new(f.clone())).ok_or_else(|| {
                SchemaError::FunctionNotFound { kind: kind.to_string(), name: name.to_string() }
                    .into()
            });
        }
        self.resolved
            .get(&(kind.to_string(), ftype, name.to_string()))
            .cloned()
            .ok_or_else(|| {
                SchemaError::ClassNotFound(kind.to_string()).into()
            })
    }

    fn declaration(&self, name: &str) -> Result<Arc<FunctionDef>, TypeError> {
        self.declarations
            .get(name)
            .cloned()
            .ok_or_else(|| TypeError::NotInScope { name: name.to_string() })
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn check_declaration(&mut self, decl: &mut Declaration) -> Result<(), TypeError> {
        let mut scope = Scope::default();
        for (name, t) in &decl.args {
            scope.insert(name.clone(), t.clone());
        }

        let body_schema = match (&decl.kind, &mut decl.body) {
            (DeclarationKind::Stream, DeclarationBody::Stream(s)) => {
                self.check_stream(s, &scope)?
            }
            (DeclarationKind::Table, DeclarationBody::Table(t)) => self.check_table(t, &scope)?,
            (DeclarationKind::Action, DeclarationBody::Action(a)) => {
                self.check_action(a, &scope)?;
                Arc::new(builtins::notify())
            }
            _ => {
                return Err(TypeError::Invalid(format!(
                    "declaration {} body does not match its kind",
                    decl.name
                )))
            }
        };

        // Synthesize the callable signature: lambda args become required
        // inputs, the body's outputs pass through.
        let mut args: Vec<ArgumentDef> = decl
            .args
            .iter()
            .map(|(name, t)| ArgumentDef::new(Direction::InReq, name.clone(), t.clone()))
            .collect();
        if decl.kind != DeclarationKind::Action {
            args.extend(body_schema.out_params().cloned());
        }
        let ftype = match decl.kind {
            DeclarationKind::Action => FunctionType::Action,
            _ => FunctionType::Query,
        };
        let mut signature = FunctionDef::new("__dyn", ftype, decl.name.clone(), args);
        signature.is_list = body_schema.is_list;
        signature.is_monitorable = body_schema.is_monitorable;
        self.declarations
            .insert(decl.name.clone(), Arc::new(signature));
        Ok(())
    }

    fn check_statement(&mut self, statement: &mut Statement) -> Result<(), TypeError> {
        match statement {
            Statement::Declaration(decl) => self.check_declaration(decl),
            Statement::Rule { stream, actions } => {
                let schema = self.check_stream(stream, &Scope::default())?;
                let mut scope = Scope::default();
                scope.add_outputs(&schema);
                for action in actions {
                    self.check_action(action, &scope)?;
                }
                Ok(())
            }
            Statement::Command { table, actions } => {
                let mut scope = Scope::default();
                if let Some(table) = table {
                    let schema = self.check_table(table, &Scope::default())?;
                    scope.add_outputs(&schema);
                }
                for action in actions {
                    self.check_action(action, &scope)?;
                }
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Invocations
    // ------------------------------------------------------------------

    fn check_invocation(
        &mut self,
        invocation: &mut Invocation,
        ftype: FunctionType,
        scope: &Scope,
    ) -> Result<Arc<FunctionDef>, TypeError> {
        let schema = self.lookup(&invocation.selector.kind, ftype, &invocation.channel)?;
        self.check_in_params(&invocation.in_params, &schema, scope)?;
        invocation.schema = Some(schema.clone());
        Ok(schema)
    }

    fn check_in_params(
        &self,
        in_params: &[InputParam],
        schema: &FunctionDef,
        scope: &Scope,
    ) -> Result<(), TypeError> {
        for param in in_params {
            let arg = schema.arg(&param.name).ok_or_else(|| TypeError::UnknownParameter {
                name: param.name.clone(),
                function: format!("{}.{}", schema.kind, schema.name),
            })?;
            if !arg.direction.is_input() {
                return Err(TypeError::Invalid(format!(
                    "{} is an output of {}.{}, not an input",
                    param.name, schema.kind, schema.name
                )));
            }
            self.check_value(&param.value, &arg.arg_type, &param.name, scope)?;
        }
        Ok(())
    }

    /// Check one value against an expected type. `Undefined` always fits
    /// (the slot will be filled later); `VarRef` resolves from scope.
    fn check_value(
        &self,
        value: &Value,
        expected: &Type,
        name: &str,
        scope: &Scope,
    ) -> Result<(), TypeError> {
        let have = self.type_of_value(value, scope)?;
        if matches!(value, Value::Undefined { .. }) {
            return Ok(());
        }
        // An enum literal checks by membership, not structure
        if let (Value::Enum { value: choice }, Type::Enum(Some(choices))) = (value, expected) {
            if choices.contains(choice) {
                return Ok(());
            }
            return Err(TypeError::Mismatch {
                name: name.to_string(),
                expected: expected.clone(),
                have,
            });
        }
        if !have.is_assignable(expected, &self.subtypes) {
            return Err(TypeError::Mismatch {
                name: name.to_string(),
                expected: expected.clone(),
                have,
            });
        }
        Ok(())
    }

    fn type_of_value(&self, value: &Value, scope: &Scope) -> Result<Type, TypeError> {
        match value {
            Value::VarRef { name } => {
                if name.starts_with("__const_") {
                    return Ok(Type::Any);
                }
                scope
                    .get(name)
                    .cloned()
                    .ok_or_else(|| TypeError::NotInScope { name: name.clone() })
            }
            Value::Date(date) => {
                if let Some(offset) = &date.offset {
                    if !offset.is_duration_like() {
                        return Err(TypeError::Invalid(
                            "date offset must be a duration".to_string(),
                        ));
                    }
                }
                Ok(Type::Date)
            }
            other => Ok(other.get_type()),
        }
    }

    // ------------------------------------------------------------------
    // Tables
    // ------------------------------------------------------------------

    fn check_table(
        &mut self,
        table: &mut Table,
        scope: &Scope,
    ) -> Result<Arc<FunctionDef>, TypeError> {
        match table {
            Table::VarRef { name, in_params, schema } => {
                let signature = self.declaration(name)?;
                self.check_in_params(in_params, &signature, scope)?;
                *schema = Some(signature.clone());
                Ok(signature)
            }
            Table::Invocation { invocation, schema } => {
                let s = self.check_invocation(invocation, FunctionType::Query, scope)?;
                *schema = Some(s.clone());
                Ok(s)
            }
            Table::ReadResult { function, index, schema } => {
                let (kind, name) = function.rsplit_once(':').ok_or_else(|| {
                    TypeError::Invalid(format!("malformed function reference {function}"))
                })?;
                let s = self.lookup(kind, FunctionType::Query, name)?;
                self.check_value(index, &Type::Number, "index", scope)?;
                *schema = Some(s.clone());
                Ok(s)
            }
            Table::Filter { table, filter, schema } => {
                let inner = self.check_table(table, scope)?;
                let mut inner_scope = scope.clone();
                inner_scope.add_outputs(&inner);
                self.check_filter(filter, Some(&inner), &inner_scope)?;
                *schema = Some(inner.clone());
                Ok(inner)
            }
            Table::Projection { table, args, computations, aliases, schema } => {
                let inner = self.check_table(table, scope)?;
                for name in args.iter() {
                    let arg = inner.arg(name).ok_or_else(|| TypeError::UnknownParameter {
                        name: name.clone(),
                        function: format!("{}.{}", inner.kind, inner.name),
                    })?;
                    if !arg.direction.is_output() {
                        return Err(TypeError::Invalid(format!(
                            "cannot project input parameter {name}"
                        )));
                    }
                }
                let mut inner_scope = scope.clone();
                inner_scope.add_outputs(&inner);
                let keep: BTreeSet<&str> = args.iter().map(String::as_str).collect();
                let mut derived = inner.filter_arguments(|a| keep.contains(a.name.as_str()));
                for (i, computation) in computations.iter().enumerate() {
                    let t = self.type_of_scalar(computation, &inner_scope)?;
                    let alias = aliases
                        .get(i)
                        .cloned()
                        .flatten()
                        .unwrap_or_else(|| format!("__compute_{i}"));
                    derived = derived.with_output(alias, t);
                }
                let derived = Arc::new(derived);
                *schema = Some(derived.clone());
                Ok(derived)
            }
            Table::Compute { table, expression, alias, schema } => {
                let inner = self.check_table(table, scope)?;
                let mut inner_scope = scope.clone();
                inner_scope.add_outputs(&inner);
                let t = self.type_of_scalar(expression, &inner_scope)?;
                let name = alias.clone().unwrap_or_else(|| "result".to_string());
                let derived = Arc::new(inner.with_output(name, t));
                *schema = Some(derived.clone());
                Ok(derived)
            }
            Table::Alias { table, schema, .. } => {
                let inner = self.check_table(table, scope)?;
                *schema = Some(inner.clone());
                Ok(inner)
            }
            Table::Aggregation { table, operator, field, alias, schema } => {
                let inner = self.check_table(table, scope)?;
                let derived = self.aggregation_schema(&inner, operator, field, alias.as_deref())?;
                let derived = Arc::new(derived);
                *schema = Some(derived.clone());
                Ok(derived)
            }
            Table::ArgMinMax { table, operator, field, base, limit, schema } => {
                let inner = self.check_table(table, scope)?;
                let arg = inner.arg(field).ok_or_else(|| TypeError::UnknownParameter {
                    name: field.clone(),
                    function: format!("{}.{}", inner.kind, inner.name),
                })?;
                if !arg.arg_type.is_comparable() {
                    return Err(TypeError::InvalidAggregation {
                        operator: operator.clone(),
                        field: field.clone(),
                    });
                }
                self.check_value(base, &Type::Number, "base", scope)?;
                self.check_value(limit, &Type::Number, "limit", scope)?;
                *schema = Some(inner.clone());
                Ok(inner)
            }
            Table::Sort { table, key, schema, .. } => {
                let inner = self.check_table(table, scope)?;
                match key {
                    SortKey::Field(field) => {
                        let arg =
                            inner.arg(field).ok_or_else(|| TypeError::UnknownParameter {
                                name: field.clone(),
                                function: format!("{}.{}", inner.kind, inner.name),
                            })?;
                        if !arg.arg_type.is_comparable() {
                            return Err(TypeError::Invalid(format!(
                                "cannot sort by non-comparable field {field}"
                            )));
                        }
                    }
                    SortKey::Expression(expr) => {
                        let mut inner_scope = scope.clone();
                        inner_scope.add_outputs(&inner);
                        let t = self.type_of_scalar(expr, &inner_scope)?;
                        if !t.is_comparable() {
                            return Err(TypeError::Invalid(
                                "cannot sort by non-comparable expression".to_string(),
                            ));
                        }
                    }
                }
                *schema = Some(inner.clone());
                Ok(inner)
            }
            Table::Index { table, indices, schema } => {
                let inner = self.check_table(table, scope)?;
                for index in indices.iter() {
                    self.check_value(index, &Type::Number, "index", scope)?;
                }
                *schema = Some(inner.clone());
                Ok(inner)
            }
            Table::Slice { table, base, limit, schema } => {
                let inner = self.check_table(table, scope)?;
                self.check_value(base, &Type::Number, "base", scope)?;
                self.check_value(limit, &Type::Number, "limit", scope)?;
                *schema = Some(inner.clone());
                Ok(inner)
            }
            Table::Join { lhs, rhs, in_params, schema } => {
                let left = self.check_table(lhs, scope)?;
                let mut rhs_scope = scope.clone();
                rhs_scope.add_outputs(&left);
                let right = self.check_table(rhs, &rhs_scope)?;
                self.check_in_params(in_params, &right, &rhs_scope)?;
                let joined = Arc::new(left.join(&right));
                *schema = Some(joined.clone());
                Ok(joined)
            }
            Table::Window { base, delta, stream, schema }
            | Table::TimeSeries { base, delta, stream, schema } => {
                self.check_value(base, &Type::Number, "base", scope)?;
                self.check_value(delta, &Type::Number, "delta", scope)?;
                let inner = self.check_stream(stream, scope)?;
                *schema = Some(inner.clone());
                Ok(inner)
            }
            Table::Sequence { base, delta, table, schema }
            | Table::History { base, delta, table, schema } => {
                self.check_value(base, &Type::Number, "base", scope)?;
                self.check_value(delta, &Type::Number, "delta", scope)?;
                let inner = self.check_table(table, scope)?;
                *schema = Some(inner.clone());
                Ok(inner)
            }
        }
    }

    fn aggregation_schema(
        &self,
        inner: &FunctionDef,
        operator: &str,
        field: &str,
        alias: Option<&str>,
    ) -> Result<FunctionDef, TypeError> {
        let result = if field == "*" {
            if operator != "count" {
                return Err(TypeError::InvalidAggregation {
                    operator: operator.to_string(),
                    field: field.to_string(),
                });
            }
            ("count".to_string(), Type::Number)
        } else {
            let arg = inner.arg(field).ok_or_else(|| TypeError::UnknownParameter {
                name: field.to_string(),
                function: format!("{}.{}", inner.kind, inner.name),
            })?;
            let field_type = &arg.arg_type;
            let out_type = match operator {
                "count" => Type::Number,
                "avg" | "sum" => {
                    if !field_type.is_numeric() {
                        return Err(TypeError::InvalidAggregation {
                            operator: operator.to_string(),
                            field: field.to_string(),
                        });
                    }
                    field_type.clone()
                }
                "min" | "max" => {
                    if !field_type.is_comparable() {
                        return Err(TypeError::InvalidAggregation {
                            operator: operator.to_string(),
                            field: field.to_string(),
                        });
                    }
                    field_type.clone()
                }
                _ => {
                    return Err(TypeError::InvalidAggregation {
                        operator: operator.to_string(),
                        field: field.to_string(),
                    })
                }
            };
            (field.to_string(), out_type)
        };

        let name = alias.map(str::to_string).unwrap_or(result.0);
        let mut derived = FunctionDef::new(
            inner.kind.clone(),
            FunctionType::Query,
            inner.name.clone(),
            inner.in_params().cloned().collect(),
        );
        derived.args.push(ArgumentDef::new(Direction::Out, name, result.1));
        derived.is_list = false;
        derived.is_monitorable = inner.is_monitorable;
        Ok(derived)
    }

    // ------------------------------------------------------------------
    // Streams
    // ------------------------------------------------------------------

    fn check_stream(
        &mut self,
        stream: &mut Stream,
        scope: &Scope,
    ) -> Result<Arc<FunctionDef>, TypeError> {
        match stream {
            Stream::VarRef { name, in_params, schema } => {
                let signature = self.declaration(name)?;
                self.check_in_params(in_params, &signature, scope)?;
                *schema = Some(signature.clone());
                Ok(signature)
            }
            Stream::Timer { base, interval, frequency, schema } => {
                if let Some(base) = base {
                    self.check_value(base, &Type::Date, "base", scope)?;
                }
                self.check_value(interval, &Type::Measure("ms".to_string()), "interval", scope)?;
                if let Some(frequency) = frequency {
                    self.check_value(frequency, &Type::Number, "frequency", scope)?;
                }
                let s = Arc::new(builtins::timer());
                *schema = Some(s.clone());
                Ok(s)
            }
            Stream::AtTimer { times, expiration, schema } => {
                for time in times.iter() {
                    self.check_value(time, &Type::Time, "time", scope)?;
                }
                if let Some(expiration) = expiration {
                    self.check_value(expiration, &Type::Date, "expiration_date", scope)?;
                }
                let s = Arc::new(builtins::attimer());
                *schema = Some(s.clone());
                Ok(s)
            }
            Stream::OnTimer { dates, schema } => {
                for date in dates.iter() {
                    self.check_value(date, &Type::Date, "date", scope)?;
                }
                let s = Arc::new(builtins::ontimer());
                *schema = Some(s.clone());
                Ok(s)
            }
            Stream::Monitor { table, args, schema } => {
                let inner = self.check_table(table, scope)?;
                if !inner.is_monitorable {
                    return Err(TypeError::NotMonitorable {
                        function: format!("{}.{}", inner.kind, inner.name),
                    });
                }
                if let Some(args) = args {
                    for name in args.iter() {
                        if inner.arg(name).map(|a| !a.direction.is_output()).unwrap_or(true) {
                            return Err(TypeError::UnknownParameter {
                                name: name.clone(),
                                function: format!("{}.{}", inner.kind, inner.name),
                            });
                        }
                    }
                }
                *schema = Some(inner.clone());
                Ok(inner)
            }
            Stream::EdgeNew { stream, schema } => {
                let inner = self.check_stream(stream, scope)?;
                *schema = Some(inner.clone());
                Ok(inner)
            }
            Stream::EdgeFilter { stream, filter, schema }
            | Stream::Filter { stream, filter, schema } => {
                let inner = self.check_stream(stream, scope)?;
                let mut inner_scope = scope.clone();
                inner_scope.add_outputs(&inner);
                self.check_filter(filter, Some(&inner), &inner_scope)?;
                *schema = Some(inner.clone());
                Ok(inner)
            }
            Stream::Projection { stream, args, schema } => {
                let inner = self.check_stream(stream, scope)?;
                for name in args.iter() {
                    if inner.arg(name).map(|a| !a.direction.is_output()).unwrap_or(true) {
                        return Err(TypeError::UnknownParameter {
                            name: name.clone(),
                            function: format!("{}.{}", inner.kind, inner.name),
                        });
                    }
                }
                let keep: BTreeSet<&str> = args.iter().map(String::as_str).collect();
                let derived = Arc::new(inner.filter_arguments(|a| keep.contains(a.name.as_str())));
                *schema = Some(derived.clone());
                Ok(derived)
            }
            Stream::Compute { stream, expression, alias, schema } => {
                let inner = self.check_stream(stream, scope)?;
                let mut inner_scope = scope.clone();
                inner_scope.add_outputs(&inner);
                let t = self.type_of_scalar(expression, &inner_scope)?;
                let name = alias.clone().unwrap_or_else(|| "result".to_string());
                let derived = Arc::new(inner.with_output(name, t));
                *schema = Some(derived.clone());
                Ok(derived)
            }
            Stream::Alias { stream, schema, .. } => {
                let inner = self.check_stream(stream, scope)?;
                *schema = Some(inner.clone());
                Ok(inner)
            }
            Stream::Join { stream, table, in_params, schema } => {
                let left = self.check_stream(stream, scope)?;
                let mut rhs_scope = scope.clone();
                rhs_scope.add_outputs(&left);
                let right = self.check_table(table, &rhs_scope)?;
                self.check_in_params(in_params, &right, &rhs_scope)?;
                let joined = Arc::new(left.join(&right));
                *schema = Some(joined.clone());
                Ok(joined)
            }
        }
    }

    // ------------------------------------------------------------------
    // Actions
    // ------------------------------------------------------------------

    fn check_action(&mut self, action: &mut Action, scope: &Scope) -> Result<(), TypeError> {
        match action {
            Action::Notify { schema } => {
                *schema = Some(Arc::new(builtins::notify()));
                Ok(())
            }
            Action::Invocation { invocation, schema } => {
                let s = self.check_invocation(invocation, FunctionType::Action, scope)?;
                *schema = Some(s);
                Ok(())
            }
            Action::VarRef { name, in_params, schema } => {
                let signature = self.declaration(name)?;
                self.check_in_params(in_params, &signature, scope)?;
                *schema = Some(signature);
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Filters and scalars
    // ------------------------------------------------------------------

    fn check_filter(
        &mut self,
        filter: &mut BooleanExpression,
        schema: Option<&Arc<FunctionDef>>,
        scope: &Scope,
    ) -> Result<(), TypeError> {
        match filter {
            BooleanExpression::True
            | BooleanExpression::False => Ok(()),
            BooleanExpression::DontCare { name } => {
                if schema.map(|s| s.has_argument(name)).unwrap_or(false) || scope.get(name).is_some()
                {
                    Ok(())
                } else {
                    Err(TypeError::NotInScope { name: name.clone() })
                }
            }
            BooleanExpression::And(ops) | BooleanExpression::Or(ops) => {
                for op in ops {
                    self.check_filter(op, schema, scope)?;
                }
                Ok(())
            }
            BooleanExpression::Not(inner) => self.check_filter(inner, schema, scope),
            BooleanExpression::Atom { name, operator, value, overload } => {
                let lhs_type = schema
                    .and_then(|s| s.arg(name))
                    .map(|a| a.arg_type.clone())
                    .or_else(|| scope.get(name).cloned())
                    .ok_or_else(|| TypeError::NotInScope { name: name.clone() })?;
                let rhs_type = self.type_of_value(value, scope)?;
                // Enum atoms check membership instead of unification
                if let (Type::Enum(Some(_)), Value::Enum { .. }) = (&lhs_type, &*value) {
                    self.check_value(value, &lhs_type, name, scope)?;
                    *overload =
                        Some([lhs_type.clone(), lhs_type.clone(), Type::Boolean]);
                    return Ok(());
                }
                *overload = Some(self.resolve_overload(operator, &lhs_type, &rhs_type)?);
                Ok(())
            }
            BooleanExpression::External { selector, channel, in_params, filter, schema: ext_schema } => {
                let resolved = self.lookup(&selector.kind, FunctionType::Query, channel)?;
                self.check_in_params(in_params, &resolved, scope)?;
                let mut inner_scope = scope.clone();
                inner_scope.add_outputs(&resolved);
                self.check_filter(filter, Some(&resolved), &inner_scope)?;
                *ext_schema = Some(resolved);
                Ok(())
            }
            BooleanExpression::Compute { lhs, operator, rhs, overload } => {
                let lhs_type = self.type_of_scalar(lhs, scope)?;
                let rhs_type = self.type_of_scalar(rhs, scope)?;
                *overload = Some(self.resolve_overload(operator, &lhs_type, &rhs_type)?);
                Ok(())
            }
            BooleanExpression::ExistentialSubquery { subquery } => {
                self.check_table(subquery, scope)?;
                Ok(())
            }
            BooleanExpression::ComparisonSubquery { lhs, operator, rhs, overload } => {
                let lhs_type = self.type_of_value(lhs, scope)?;
                let subquery_schema = self.check_table(rhs, scope)?;
                let mut outs = subquery_schema.out_params();
                let field = outs.next().ok_or_else(|| {
                    TypeError::Invalid("comparison subquery has no output".to_string())
                })?;
                if outs.next().is_some() {
                    return Err(TypeError::Invalid(
                        "comparison subquery must project a single field".to_string(),
                    ));
                }
                *overload =
                    Some(self.resolve_overload(operator, &lhs_type, &field.arg_type)?);
                Ok(())
            }
        }
    }

    fn type_of_scalar(
        &self,
        expression: &ScalarExpression,
        scope: &Scope,
    ) -> Result<Type, TypeError> {
        match expression {
            ScalarExpression::Primary(value) => self.type_of_value(value, scope),
            ScalarExpression::Derived { op, operands } => {
                let types: Vec<Type> = operands
                    .iter()
                    .map(|o| self.type_of_scalar(o, scope))
                    .collect::<Result<_, _>>()?;
                self.resolve_scalar_op(op, &types)
            }
        }
    }

    fn resolve_scalar_op(&self, op: &str, operands: &[Type]) -> Result<Type, TypeError> {
        let bad = || TypeError::NoOverload {
            operator: op.to_string(),
            lhs: operands.first().cloned().unwrap_or(Type::Any),
            rhs: operands.get(1).cloned().unwrap_or(Type::Any),
        };
        match (op, operands) {
            ("+", [Type::Date, Type::Measure(unit)]) if unit == "ms" => Ok(Type::Date),
            ("-", [Type::Date, Type::Measure(unit)]) if unit == "ms" => Ok(Type::Date),
            ("-", [Type::Date, Type::Date]) => Ok(Type::Measure("ms".to_string())),
            ("+" | "-" | "max" | "min", [a, b]) => {
                if a.is_numeric() && a.is_assignable(b, &self.subtypes) {
                    Ok(a.clone())
                } else {
                    Err(bad())
                }
            }
            ("*" | "/" | "%" | "**", [Type::Number, Type::Number]) => Ok(Type::Number),
            ("*" | "/", [Type::Measure(unit), Type::Number]) => {
                Ok(Type::Measure(unit.clone()))
            }
            ("distance", [Type::Location, Type::Location]) => {
                Ok(Type::Measure("m".to_string()))
            }
            ("round", [Type::Number]) => Ok(Type::Number),
            _ => Err(bad()),
        }
    }

    /// The coercion table: which operators apply to which operand types,
    /// and what they produce. Comparisons all produce `Boolean`.
    fn resolve_overload(
        &self,
        operator: &str,
        lhs: &Type,
        rhs: &Type,
    ) -> Result<Overload, TypeError> {
        let no_overload = || TypeError::NoOverload {
            operator: operator.to_string(),
            lhs: lhs.clone(),
            rhs: rhs.clone(),
        };
        let ok = |l: &Type, r: &Type| Ok([l.clone(), r.clone(), Type::Boolean]);

        match operator {
            "==" | "!=" => {
                if lhs.is_assignable(rhs, &self.subtypes) || rhs.is_assignable(lhs, &self.subtypes)
                {
                    ok(lhs, rhs)
                } else {
                    Err(no_overload())
                }
            }
            ">=" | "<=" | ">" | "<" => {
                if lhs.is_comparable() && lhs.is_assignable(rhs, &self.subtypes) {
                    ok(lhs, rhs)
                } else {
                    Err(no_overload())
                }
            }
            "=~" => match (lhs, rhs) {
                (Type::String, Type::String) | (Type::Entity(_), Type::String) => ok(lhs, rhs),
                _ => Err(no_overload()),
            },
            "~=" => match (lhs, rhs) {
                (Type::String, Type::String) | (Type::String, Type::Entity(_)) => ok(lhs, rhs),
                _ => Err(no_overload()),
            },
            "starts_with" | "ends_with" => match (lhs, rhs) {
                (Type::String, Type::String) => ok(lhs, rhs),
                _ => Err(no_overload()),
            },
            "contains" => match lhs {
                Type::Array(elem) if rhs.is_assignable(elem, &self.subtypes) => ok(lhs, rhs),
                _ => Err(no_overload()),
            },
            "contains~" => match (lhs, rhs) {
                (Type::Array(elem), Type::String) if matches!(**elem, Type::String | Type::Entity(_)) => {
                    ok(lhs, rhs)
                }
                _ => Err(no_overload()),
            },
            "in_array" => match rhs {
                Type::Array(elem) if lhs.is_assignable(elem, &self.subtypes) => ok(lhs, rhs),
                _ => Err(no_overload()),
            },
            _ => Err(no_overload()),
        }
    }
}
