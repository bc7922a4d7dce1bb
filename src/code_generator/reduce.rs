//! # Reduce-Op Compilers
//!
//! One compiler per [`ReduceOp`], driven by the operator compiler through
//! a three-step protocol: `init` before the inner table is compiled,
//! `advance` inside the per-tuple loop, and `finish` after the loop is
//! popped. `finish` returns the scope and watched names the downstream
//! code runs under; it may leave blocks open (an `if` guarding the result,
//! a `for` over sorted tuples) for the caller to unwind later.

use crate::ast::SortDirection;
use crate::ir::ReduceOp;
use crate::value::Value;

use super::builder::IrBuilder;
use super::instr::{Instruction, Register};
use super::scope::{Scope, ScopeEntry, ScopeKind};

/// Registers allocated by `init`, interpreted privately by each compiler.
pub struct ReduceState {
    regs: Vec<Register>,
}

pub trait ReduceCompiler {
    fn init(&self, builder: &mut IrBuilder, scope: &Scope) -> ReduceState;
    fn advance(
        &self,
        state: &ReduceState,
        builder: &mut IrBuilder,
        scope: &Scope,
        var_scope_names: &[String],
    );
    fn finish(
        &self,
        state: &ReduceState,
        builder: &mut IrBuilder,
        scope: &Scope,
        var_scope_names: &[String],
    ) -> (Scope, Vec<String>);
}

/// Pick the compiler for a reduce op. `ComplexSort` does not appear here:
/// the operator compiler rewrites it to a compute plus a `SimpleSort`
/// before reaching this point.
pub fn compiler_for(op: &ReduceOp) -> Box<dyn ReduceCompiler> {
    match op {
        ReduceOp::Count => Box::new(CountCompiler),
        ReduceOp::CountDistinct { field } => {
            Box::new(CountDistinctCompiler { field: field.clone() })
        }
        ReduceOp::Average { field } => Box::new(AverageCompiler { field: field.clone() }),
        ReduceOp::SimpleAggregation { operator, field } => Box::new(SimpleAggregationCompiler {
            operator: operator.clone(),
            field: field.clone(),
        }),
        ReduceOp::SimpleArgMinMax { operator, field } => Box::new(SimpleArgMinMaxCompiler {
            operator: operator.clone(),
            field: field.clone(),
        }),
        ReduceOp::ComplexArgMinMax { operator, field, base, limit } => {
            Box::new(ComplexArgMinMaxCompiler {
                operator: operator.clone(),
                field: field.clone(),
                base: base.clone(),
                limit: limit.clone(),
            })
        }
        ReduceOp::SimpleSort { field, direction } => Box::new(SortCompiler {
            field: field.clone(),
            direction: *direction,
        }),
        ReduceOp::ComplexSort { direction, .. } => Box::new(SortCompiler {
            field: "__sort_key".to_string(),
            direction: *direction,
        }),
        ReduceOp::SimpleIndex { index } => Box::new(SimpleIndexCompiler { index: index.clone() }),
        ReduceOp::ComplexIndex { indices } => {
            Box::new(MaterializeCompiler { selection: Selection::Index(indices.clone()) })
        }
        ReduceOp::Slice { base, limit } => Box::new(MaterializeCompiler {
            selection: Selection::Slice { base: base.clone(), limit: limit.clone() },
        }),
    }
}

// ============================================================================
// Shared helpers
// ============================================================================

fn load_value(builder: &mut IrBuilder, scope: &Scope, value: &Value) -> Register {
    if let Value::VarRef { name } = value {
        if let Some(entry) = scope.get(name) {
            return entry.register;
        }
    }
    let r = builder.alloc_register();
    builder.add(Instruction::LoadConstant { value: value.clone(), dst: r });
    r
}

fn field_register(scope: &Scope, field: &str) -> Register {
    scope
        .get(field)
        .map(|e| e.register)
        .unwrap_or_else(|| scope.output().unwrap_or(0))
}

/// Rebuild the tuple scope from a chosen `[outputType, tuple]` pair.
/// Only the watched names are re-read: those are the fields the tuple
/// actually carries (outer chained bindings are not part of it).
fn read_tuple(
    builder: &mut IrBuilder,
    old_scope: &Scope,
    tuple: Register,
    output_type: Register,
) -> Scope {
    let mut scope = Scope::new();
    scope.set_output(tuple);
    scope.set_output_type(output_type);
    for (name, entry) in old_scope
        .tuple_entries()
        .filter(|(_, e)| e.is_in_var_scope_names)
    {
        let r = builder.alloc_register();
        builder.add(Instruction::GetKey { object: tuple, key: name.to_string(), dst: r });
        scope.set(
            name,
            ScopeEntry {
                kind: ScopeKind::Scalar,
                tt_type: entry.tt_type.clone(),
                register: r,
                is_in_var_scope_names: entry.is_in_var_scope_names,
            },
        );
    }
    scope
}

/// Build the single-row result of an aggregation: a fresh tuple holding
/// one field, with the output type tag derived from the inner one.
fn singleton_result(
    builder: &mut IrBuilder,
    scope: &Scope,
    operator: &str,
    field: &str,
    value: Register,
) -> (Scope, Vec<String>) {
    let tuple = builder.alloc_register();
    builder.add(Instruction::CreateObject { dst: tuple });
    builder.add(Instruction::SetKey {
        object: tuple,
        key: field.to_string(),
        src: value,
    });

    let op_name = builder.alloc_register();
    builder.add(Instruction::LoadConstant {
        value: Value::String(operator.to_string()),
        dst: op_name,
    });
    let output_type = match scope.output_type() {
        Some(inner) => {
            let combined = builder.alloc_register();
            builder.add(Instruction::BinaryFunctionOp {
                a: op_name,
                b: inner,
                function: "aggregateOutputType".to_string(),
                dst: combined,
            });
            combined
        }
        None => op_name,
    };

    let mut new_scope = Scope::new();
    new_scope.set_output(tuple);
    new_scope.set_output_type(output_type);
    new_scope.set(
        field,
        ScopeEntry {
            kind: ScopeKind::Scalar,
            tt_type: None,
            register: value,
            is_in_var_scope_names: true,
        },
    );
    (new_scope, vec![field.to_string()])
}

/// Append `[outputType, output]` to a materialization array.
fn push_current_tuple(builder: &mut IrBuilder, scope: &Scope, array: Register) {
    let pair = builder.alloc_register();
    builder.add(Instruction::CreateTuple { size: 2, dst: pair });
    if let Some(ot) = scope.output_type() {
        builder.add(Instruction::SetIndex { tuple: pair, index: 0, src: ot });
    }
    if let Some(output) = scope.output() {
        builder.add(Instruction::SetIndex { tuple: pair, index: 1, src: output });
    }
    builder.add(Instruction::UnaryMethodOp {
        object: array,
        arg: pair,
        method: "push".to_string(),
    });
}

/// Loop over a materialized `[outputType, tuple]` array, rebuilding the
/// scope per element. Leaves the loop block open.
fn iterate_pairs(
    builder: &mut IrBuilder,
    old_scope: &Scope,
    var_scope_names: &[String],
    array: Register,
) -> (Scope, Vec<String>) {
    let element = builder.alloc_register();
    builder.push_for_of(element, array);
    let output_type = builder.alloc_register();
    builder.add(Instruction::GetIndex { tuple: element, index: 0, dst: output_type });
    let tuple = builder.alloc_register();
    builder.add(Instruction::GetIndex { tuple: element, index: 1, dst: tuple });
    let scope = read_tuple(builder, old_scope, tuple, output_type);
    (scope, var_scope_names.to_vec())
}

// ============================================================================
// Count / distinct / average / aggregation
// ============================================================================

struct CountCompiler;

impl ReduceCompiler for CountCompiler {
    fn init(&self, builder: &mut IrBuilder, _scope: &Scope) -> ReduceState {
        let acc = builder.alloc_register();
        builder.add(Instruction::LoadConstant { value: Value::Number(0.0), dst: acc });
        ReduceState { regs: vec![acc] }
    }

    fn advance(&self, state: &ReduceState, builder: &mut IrBuilder, _scope: &Scope, _vsn: &[String]) {
        let acc = state.regs[0];
        let one = builder.alloc_register();
        builder.add(Instruction::LoadConstant { value: Value::Number(1.0), dst: one });
        builder.add(Instruction::BinaryOp { a: acc, b: one, op: "+".to_string(), dst: acc });
    }

    fn finish(
        &self,
        state: &ReduceState,
        builder: &mut IrBuilder,
        scope: &Scope,
        _vsn: &[String],
    ) -> (Scope, Vec<String>) {
        singleton_result(builder, scope, "count", "count", state.regs[0])
    }
}

struct CountDistinctCompiler {
    field: String,
}

impl ReduceCompiler for CountDistinctCompiler {
    fn init(&self, builder: &mut IrBuilder, _scope: &Scope) -> ReduceState {
        let set = builder.alloc_register();
        builder.add(Instruction::NewObject {
            class: "EqualitySet".to_string(),
            dst: set,
            args: vec![],
        });
        ReduceState { regs: vec![set] }
    }

    fn advance(&self, state: &ReduceState, builder: &mut IrBuilder, scope: &Scope, _vsn: &[String]) {
        let value = field_register(scope, &self.field);
        builder.add(Instruction::UnaryMethodOp {
            object: state.regs[0],
            arg: value,
            method: "add".to_string(),
        });
    }

    fn finish(
        &self,
        state: &ReduceState,
        builder: &mut IrBuilder,
        scope: &Scope,
        _vsn: &[String],
    ) -> (Scope, Vec<String>) {
        let count = builder.alloc_register();
        builder.add(Instruction::GetKey {
            object: state.regs[0],
            key: "size".to_string(),
            dst: count,
        });
        singleton_result(builder, scope, "count", "count", count)
    }
}

struct AverageCompiler {
    field: String,
}

impl ReduceCompiler for AverageCompiler {
    fn init(&self, builder: &mut IrBuilder, _scope: &Scope) -> ReduceState {
        let sum = builder.alloc_register();
        let count = builder.alloc_register();
        builder.add(Instruction::LoadConstant { value: Value::Number(0.0), dst: sum });
        builder.add(Instruction::LoadConstant { value: Value::Number(0.0), dst: count });
        ReduceState { regs: vec![sum, count] }
    }

    fn advance(&self, state: &ReduceState, builder: &mut IrBuilder, scope: &Scope, _vsn: &[String]) {
        let (sum, count) = (state.regs[0], state.regs[1]);
        let value = field_register(scope, &self.field);
        builder.add(Instruction::BinaryOp { a: sum, b: value, op: "+".to_string(), dst: sum });
        let one = builder.alloc_register();
        builder.add(Instruction::LoadConstant { value: Value::Number(1.0), dst: one });
        builder.add(Instruction::BinaryOp { a: count, b: one, op: "+".to_string(), dst: count });
    }

    fn finish(
        &self,
        state: &ReduceState,
        builder: &mut IrBuilder,
        scope: &Scope,
        _vsn: &[String],
    ) -> (Scope, Vec<String>) {
        let avg = builder.alloc_register();
        builder.add(Instruction::BinaryOp {
            a: state.regs[0],
            b: state.regs[1],
            op: "/".to_string(),
            dst: avg,
        });
        singleton_result(builder, scope, "avg", &self.field, avg)
    }
}

struct SimpleAggregationCompiler {
    operator: String,
    field: String,
}

impl ReduceCompiler for SimpleAggregationCompiler {
    fn init(&self, builder: &mut IrBuilder, _scope: &Scope) -> ReduceState {
        let acc = builder.alloc_register();
        let seed = match self.operator.as_str() {
            "min" => Value::Number(f64::INFINITY),
            "max" => Value::Number(f64::NEG_INFINITY),
            _ => Value::Number(0.0),
        };
        builder.add(Instruction::LoadConstant { value: seed, dst: acc });
        ReduceState { regs: vec![acc] }
    }

    fn advance(&self, state: &ReduceState, builder: &mut IrBuilder, scope: &Scope, _vsn: &[String]) {
        let acc = state.regs[0];
        let value = field_register(scope, &self.field);
        match self.operator.as_str() {
            "sum" => builder.add(Instruction::BinaryOp {
                a: acc,
                b: value,
                op: "+".to_string(),
                dst: acc,
            }),
            op => builder.add(Instruction::BinaryFunctionOp {
                a: acc,
                b: value,
                function: op.to_string(),
                dst: acc,
            }),
        }
    }

    fn finish(
        &self,
        state: &ReduceState,
        builder: &mut IrBuilder,
        scope: &Scope,
        _vsn: &[String],
    ) -> (Scope, Vec<String>) {
        singleton_result(builder, scope, &self.operator, &self.field, state.regs[0])
    }
}

// ============================================================================
// Argmin / argmax
// ============================================================================

struct SimpleArgMinMaxCompiler {
    operator: String,
    field: String,
}

impl ReduceCompiler for SimpleArgMinMaxCompiler {
    fn init(&self, builder: &mut IrBuilder, _scope: &Scope) -> ReduceState {
        let best = builder.alloc_register();
        let seed = if self.operator == "argmin" {
            Value::Number(f64::INFINITY)
        } else {
            Value::Number(f64::NEG_INFINITY)
        };
        builder.add(Instruction::LoadConstant { value: seed, dst: best });
        let tuple = builder.alloc_register();
        let output_type = builder.alloc_register();
        let found = builder.alloc_register();
        for r in [tuple, output_type] {
            builder.add(Instruction::LoadConstant {
                value: Value::Undefined { local: true },
                dst: r,
            });
        }
        builder.add(Instruction::LoadConstant { value: Value::Boolean(false), dst: found });
        ReduceState { regs: vec![best, tuple, output_type, found] }
    }

    fn advance(&self, state: &ReduceState, builder: &mut IrBuilder, scope: &Scope, _vsn: &[String]) {
        let [best, tuple, output_type, found] =
            [state.regs[0], state.regs[1], state.regs[2], state.regs[3]];
        let value = field_register(scope, &self.field);
        let op = if self.operator == "argmin" { "<" } else { ">" };
        let cond = builder.alloc_register();
        builder.add(Instruction::BinaryOp {
            a: value,
            b: best,
            op: op.to_string(),
            dst: cond,
        });
        builder.push_if(cond);
        builder.add(Instruction::Copy { src: value, dst: best });
        if let Some(output) = scope.output() {
            builder.add(Instruction::Copy { src: output, dst: tuple });
        }
        if let Some(ot) = scope.output_type() {
            builder.add(Instruction::Copy { src: ot, dst: output_type });
        }
        builder.add(Instruction::LoadConstant { value: Value::Boolean(true), dst: found });
        builder.pop_block();
    }

    fn finish(
        &self,
        state: &ReduceState,
        builder: &mut IrBuilder,
        scope: &Scope,
        var_scope_names: &[String],
    ) -> (Scope, Vec<String>) {
        let [_, tuple, output_type, found] =
            [state.regs[0], state.regs[1], state.regs[2], state.regs[3]];
        builder.push_if(found);
        let new_scope = read_tuple(builder, scope, tuple, output_type);
        (new_scope, var_scope_names.to_vec())
    }
}

struct ComplexArgMinMaxCompiler {
    operator: String,
    field: String,
    base: Value,
    limit: Value,
}

impl ReduceCompiler for ComplexArgMinMaxCompiler {
    fn init(&self, builder: &mut IrBuilder, scope: &Scope) -> ReduceState {
        let op = load_value(builder, scope, &Value::String(self.operator.clone()));
        let field = load_value(builder, scope, &Value::String(self.field.clone()));
        let base = load_value(builder, scope, &self.base);
        let limit = load_value(builder, scope, &self.limit);
        let state = builder.alloc_register();
        builder.add(Instruction::NewObject {
            class: "ArgMinMaxState".to_string(),
            dst: state,
            args: vec![op, field, base, limit],
        });
        ReduceState { regs: vec![state] }
    }

    fn advance(&self, state: &ReduceState, builder: &mut IrBuilder, scope: &Scope, _vsn: &[String]) {
        if let (Some(ot), Some(output)) = (scope.output_type(), scope.output()) {
            builder.add(Instruction::BinaryMethodOp {
                object: state.regs[0],
                a: ot,
                b: output,
                method: "update".to_string(),
            });
        }
    }

    fn finish(
        &self,
        state: &ReduceState,
        builder: &mut IrBuilder,
        scope: &Scope,
        var_scope_names: &[String],
    ) -> (Scope, Vec<String>) {
        iterate_pairs(builder, scope, var_scope_names, state.regs[0])
    }
}

// ============================================================================
// Sort / index / slice
// ============================================================================

struct SortCompiler {
    field: String,
    direction: SortDirection,
}

impl ReduceCompiler for SortCompiler {
    fn init(&self, builder: &mut IrBuilder, _scope: &Scope) -> ReduceState {
        let array = builder.alloc_register();
        builder.add(Instruction::CreateTuple { size: 0, dst: array });
        ReduceState { regs: vec![array] }
    }

    fn advance(&self, state: &ReduceState, builder: &mut IrBuilder, scope: &Scope, _vsn: &[String]) {
        push_current_tuple(builder, scope, state.regs[0]);
    }

    fn finish(
        &self,
        state: &ReduceState,
        builder: &mut IrBuilder,
        scope: &Scope,
        var_scope_names: &[String],
    ) -> (Scope, Vec<String>) {
        let array = state.regs[0];
        let field = load_value(builder, scope, &Value::String(self.field.clone()));
        let direction = match self.direction {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        };
        let direction = load_value(builder, scope, &Value::String(direction.to_string()));
        builder.add(Instruction::VoidFunctionOp {
            function: "sortkey".to_string(),
            args: vec![array, field, direction],
        });
        iterate_pairs(builder, scope, var_scope_names, array)
    }
}

struct SimpleIndexCompiler {
    index: Value,
}

impl ReduceCompiler for SimpleIndexCompiler {
    fn init(&self, builder: &mut IrBuilder, _scope: &Scope) -> ReduceState {
        let counter = builder.alloc_register();
        builder.add(Instruction::LoadConstant { value: Value::Number(0.0), dst: counter });
        let tuple = builder.alloc_register();
        let output_type = builder.alloc_register();
        let found = builder.alloc_register();
        for r in [tuple, output_type] {
            builder.add(Instruction::LoadConstant {
                value: Value::Undefined { local: true },
                dst: r,
            });
        }
        builder.add(Instruction::LoadConstant { value: Value::Boolean(false), dst: found });
        ReduceState { regs: vec![counter, tuple, output_type, found] }
    }

    fn advance(&self, state: &ReduceState, builder: &mut IrBuilder, scope: &Scope, _vsn: &[String]) {
        let [counter, tuple, output_type, found] =
            [state.regs[0], state.regs[1], state.regs[2], state.regs[3]];
        let one = builder.alloc_register();
        builder.add(Instruction::LoadConstant { value: Value::Number(1.0), dst: one });
        builder.add(Instruction::BinaryOp { a: counter, b: one, op: "+".to_string(), dst: counter });

        let wanted = load_value(builder, scope, &self.index);
        let cond = builder.alloc_register();
        builder.add(Instruction::BinaryOp {
            a: counter,
            b: wanted,
            op: "==".to_string(),
            dst: cond,
        });
        builder.push_if(cond);
        if let Some(output) = scope.output() {
            builder.add(Instruction::Copy { src: output, dst: tuple });
        }
        if let Some(ot) = scope.output_type() {
            builder.add(Instruction::Copy { src: ot, dst: output_type });
        }
        builder.add(Instruction::LoadConstant { value: Value::Boolean(true), dst: found });
        builder.add(Instruction::Break);
        builder.pop_block();
    }

    fn finish(
        &self,
        state: &ReduceState,
        builder: &mut IrBuilder,
        scope: &Scope,
        var_scope_names: &[String],
    ) -> (Scope, Vec<String>) {
        let [_, tuple, output_type, found] =
            [state.regs[0], state.regs[1], state.regs[2], state.regs[3]];
        builder.push_if(found);
        let new_scope = read_tuple(builder, scope, tuple, output_type);
        (new_scope, var_scope_names.to_vec())
    }
}

enum Selection {
    Index(Vec<Value>),
    Slice { base: Value, limit: Value },
}

/// Materialize every tuple, then select: `indexArray` for arbitrary
/// indices, `sliceArray` for a contiguous window.
struct MaterializeCompiler {
    selection: Selection,
}

impl ReduceCompiler for MaterializeCompiler {
    fn init(&self, builder: &mut IrBuilder, _scope: &Scope) -> ReduceState {
        let array = builder.alloc_register();
        builder.add(Instruction::CreateTuple { size: 0, dst: array });
        ReduceState { regs: vec![array] }
    }

    fn advance(&self, state: &ReduceState, builder: &mut IrBuilder, scope: &Scope, _vsn: &[String]) {
        push_current_tuple(builder, scope, state.regs[0]);
    }

    fn finish(
        &self,
        state: &ReduceState,
        builder: &mut IrBuilder,
        scope: &Scope,
        var_scope_names: &[String],
    ) -> (Scope, Vec<String>) {
        let array = state.regs[0];
        let selected = builder.alloc_register();
        match &self.selection {
            Selection::Index(indices) => {
                let list = builder.alloc_register();
                builder.add(Instruction::CreateTuple { size: indices.len(), dst: list });
                for (i, index) in indices.iter().enumerate() {
                    let r = load_value(builder, scope, index);
                    builder.add(Instruction::SetIndex { tuple: list, index: i, src: r });
                }
                builder.add(Instruction::FunctionOp {
                    function: "indexArray".to_string(),
                    dst: selected,
                    args: vec![array, list],
                });
            }
            Selection::Slice { base, limit } => {
                let base = load_value(builder, scope, base);
                let limit = load_value(builder, scope, limit);
                builder.add(Instruction::FunctionOp {
                    function: "sliceArray".to_string(),
                    dst: selected,
                    args: vec![array, base, limit],
                });
            }
        }
        iterate_pairs(builder, scope, var_scope_names, selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_protocol() {
        let mut builder = IrBuilder::new();
        let scope = Scope::new();
        let compiler = compiler_for(&ReduceOp::Count);
        let state = compiler.init(&mut builder, &scope);
        compiler.advance(&state, &mut builder, &scope, &[]);
        let (new_scope, names) = compiler.finish(&state, &mut builder, &scope, &[]);
        builder.pop_all();

        assert_eq!(names, vec!["count".to_string()]);
        assert!(new_scope.has("count"));
        let code = builder.codegen("");
        assert!(code.contains("_t_0 = 0;"));
        assert!(code.contains("_t_0 = _t_0 + _t_1;"));
    }

    #[test]
    fn test_argmin_guards_on_found() {
        let mut builder = IrBuilder::new();
        let mut scope = Scope::new();
        let output = builder.alloc_register();
        let ot = builder.alloc_register();
        let temp = builder.alloc_register();
        scope.set_output(output);
        scope.set_output_type(ot);
        scope.set(
            "temperature",
            ScopeEntry {
                kind: ScopeKind::Scalar,
                tt_type: None,
                register: temp,
                is_in_var_scope_names: true,
            },
        );

        let op = ReduceOp::SimpleArgMinMax {
            operator: "argmin".to_string(),
            field: "temperature".to_string(),
        };
        let compiler = compiler_for(&op);
        let state = compiler.init(&mut builder, &scope);
        compiler.advance(&state, &mut builder, &scope, &["temperature".to_string()]);
        let (new_scope, _) =
            compiler.finish(&state, &mut builder, &scope, &["temperature".to_string()]);
        builder.pop_all();

        assert!(new_scope.has("temperature"));
        let code = builder.codegen("");
        assert!(code.contains("Infinity"));
        assert!(code.contains("if ("));
    }

    #[test]
    fn test_sort_materializes_and_sorts() {
        let mut builder = IrBuilder::new();
        let mut scope = Scope::new();
        let output = builder.alloc_register();
        let ot = builder.alloc_register();
        scope.set_output(output);
        scope.set_output_type(ot);

        let op = ReduceOp::SimpleSort {
            field: "temperature".to_string(),
            direction: SortDirection::Asc,
        };
        let compiler = compiler_for(&op);
        let state = compiler.init(&mut builder, &scope);
        compiler.advance(&state, &mut builder, &scope, &[]);
        compiler.finish(&state, &mut builder, &scope, &[]);
        builder.pop_all();

        let code = builder.codegen("");
        assert!(code.contains("__builtin.sortkey("));
        assert!(code.contains(".push("));
        assert!(code.contains("for ("));
    }
}
