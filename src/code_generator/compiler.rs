//! # Operator Compiler
//!
//! Walks optimized operator trees and emits register IR through the
//! [`IrBuilder`]. Compilation is continuation-shaped: compiling a stream
//! or table leaves the builder positioned inside the innermost per-tuple
//! block with the scope describing the current tuple; the caller emits
//! the downstream code there and unwinds with `pop_to`.
//!
//! Every primitive invocation sits in its own purpose-labeled try/catch,
//! so one failing device does not abort the rest of the rule; state
//! writes happen only on success paths.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use serde_json::json;

use crate::ast::{
    Declaration, DeclarationBody, DeviceSelector, FunctionDef, InputParam, Invocation,
    ScalarExpression,
};
use crate::ir::{
    ActionOp, BooleanExpressionOp, CompileError, PointWiseOp, QueryInvocationHints, ReduceOp,
    RuleOp, StreamOp, TableOp,
};
use crate::ir_builder::Lowerer;
use crate::types::Type;
use crate::value::Value;

use super::builder::IrBuilder;
use super::instr::{Instruction, Register};
use super::reduce;
use super::scope::{Scope, ScopeEntry, ScopeKind};

/// Device kinds whose `send` action closes a remote flow.
const REMOTE_KIND: &str = "org.thingpedia.builtin.thingengine.remote";

pub(crate) struct OpCompiler {
    builder: IrBuilder,
    scope: Scope,
    var_scope_names: Vec<String>,
    /// Program-wide state slot allocator, shared across rule compilers
    states: Rc<Cell<usize>>,
    /// Program-wide table of AST payloads referenced by `InvokeDbQuery`
    ast_objects: Rc<RefCell<Vec<serde_json::Value>>>,
}

impl OpCompiler {
    pub(crate) fn new(
        states: Rc<Cell<usize>>,
        ast_objects: Rc<RefCell<Vec<serde_json::Value>>>,
    ) -> Self {
        OpCompiler {
            builder: IrBuilder::new(),
            scope: Scope::new(),
            var_scope_names: Vec::new(),
            states,
            ast_objects,
        }
    }

    pub(crate) fn finish(mut self) -> String {
        self.builder.pop_all();
        self.builder.codegen_function("")
    }

    fn alloc_state_slot(&mut self) -> usize {
        let slot = self.states.get();
        self.states.set(slot + 1);
        slot
    }

    // ------------------------------------------------------------------
    // Rules
    // ------------------------------------------------------------------

    /// Compile one rule body into the current function. The scope is
    /// restored afterwards so sequential commands do not leak bindings.
    pub(crate) fn compile_rule(&mut self, rule: &RuleOp) -> Result<(), CompileError> {
        let depth = self.builder.save_stack_state();
        let saved_scope = self.scope.clone();
        let saved_vsn = self.var_scope_names.clone();

        if let Some(stream) = &rule.stream {
            self.compile_stream(stream)?;
        }
        for action in &rule.actions {
            self.compile_action(action)?;
        }

        self.builder.pop_to(depth);
        self.scope = saved_scope;
        self.var_scope_names = saved_vsn;
        Ok(())
    }

    /// Compile a `let` declaration into a function bound in scope.
    pub(crate) fn compile_declaration(
        &mut self,
        decl: &Declaration,
        index: usize,
    ) -> Result<(), CompileError> {
        let mut child =
            OpCompiler::new(self.states.clone(), self.ast_objects.clone());
        for (name, arg_type) in &decl.args {
            let register = child.builder.alloc_argument();
            child.scope.set(
                name,
                ScopeEntry {
                    kind: ScopeKind::Scalar,
                    tt_type: Some(arg_type.clone()),
                    register,
                    is_in_var_scope_names: false,
                },
            );
        }

        let lowerer = Lowerer::new();
        let (kind, takes_emit) = match &decl.body {
            DeclarationBody::Action(action) => {
                let id = child.builder.alloc_register();
                child.builder.add(Instruction::LoadConstant {
                    value: Value::Number(index as f64),
                    dst: id,
                });
                child.builder.add(Instruction::EnterProcedure {
                    id,
                    name: decl.name.clone(),
                });
                let op = lowerer.lower_action(action);
                child.compile_action(&op)?;
                child.builder.pop_all();
                child.builder.add(Instruction::ExitProcedure {
                    id,
                    name: decl.name.clone(),
                });
                (ScopeKind::Procedure, false)
            }
            DeclarationBody::Table(table) => {
                let op = lowerer.lower_table(table, QueryInvocationHints::new())?;
                child.compile_table(&op)?;
                child.emit_current();
                (ScopeKind::Declaration, true)
            }
            DeclarationBody::Stream(stream) => {
                let op = lowerer.lower_stream(stream, QueryInvocationHints::new())?;
                child.compile_stream(&op)?;
                child.emit_current();
                (ScopeKind::Declaration, true)
            }
        };

        let function = child.builder.into_inner_function(takes_emit);
        let into = self.builder.alloc_register();
        self.builder
            .add(Instruction::AsyncFunctionDeclaration { into, function });
        self.scope.set(
            decl.name.clone(),
            ScopeEntry {
                kind,
                tt_type: None,
                register: into,
                is_in_var_scope_names: false,
            },
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Streams
    // ------------------------------------------------------------------

    fn compile_stream(&mut self, op: &StreamOp) -> Result<(), CompileError> {
        match op {
            StreamOp::Now => Ok(()),
            StreamOp::Timer { base, interval, frequency } => {
                self.builder.push_try_catch("Failed to invoke timer");
                let base = match base {
                    Some(base) => self.compile_value(base)?,
                    None => {
                        let r = self.builder.alloc_register();
                        self.builder.add(Instruction::LoadConstant {
                            value: Value::Date(crate::value::DateValue {
                                value: None,
                                operator: crate::value::DateOp::Plus,
                                offset: None,
                            }),
                            dst: r,
                        });
                        r
                    }
                };
                let interval = self.compile_value(interval)?;
                let frequency = match frequency {
                    Some(f) => Some(self.compile_value(f)?),
                    None => None,
                };
                let timer = self.builder.alloc_register();
                self.builder.add(Instruction::InvokeTimer {
                    dst: timer,
                    base,
                    interval,
                    frequency,
                });
                self.begin_iteration(timer);
                self.read_result(Some(&Arc::new(crate::ast::builtins::timer())));
                Ok(())
            }
            StreamOp::AtTimer { times, expiration } => {
                self.builder.push_try_catch("Failed to invoke at-timer");
                let time_array = self.compile_value_array(times)?;
                let expiration = match expiration {
                    Some(e) => Some(self.compile_value(e)?),
                    None => None,
                };
                let timer = self.builder.alloc_register();
                self.builder.add(Instruction::InvokeAtTimer {
                    dst: timer,
                    time_array,
                    expiration,
                });
                self.begin_iteration(timer);
                self.read_result(Some(&Arc::new(crate::ast::builtins::attimer())));
                Ok(())
            }
            StreamOp::OnTimer { dates } => {
                // one-shot timers reuse the at-timer entry point; the
                // runtime tells them apart by the value types
                self.builder.push_try_catch("Failed to invoke on-timer");
                let time_array = self.compile_value_array(dates)?;
                let timer = self.builder.alloc_register();
                self.builder.add(Instruction::InvokeAtTimer {
                    dst: timer,
                    time_array,
                    expiration: None,
                });
                self.begin_iteration(timer);
                self.read_result(Some(&Arc::new(crate::ast::builtins::ontimer())));
                Ok(())
            }
            StreamOp::InvokeSubscribe { invocation, schema, .. } => {
                self.builder.push_try_catch("Failed to invoke trigger");
                let attrs = self.compile_selector_attrs(&invocation.selector)?;
                let args = self.compile_in_params(&invocation.in_params)?;
                let monitor = self.builder.alloc_register();
                self.builder.add(Instruction::InvokeMonitor {
                    kind: invocation.selector.kind.clone(),
                    attrs,
                    fname: invocation.channel.clone(),
                    dst: monitor,
                    args,
                    once: false,
                });
                self.begin_iteration(monitor);
                self.read_result(schema.as_ref());
                Ok(())
            }
            StreamOp::InvokeVarRef { name, in_params, schema } => {
                let function = self.scope_function(name)?;
                self.builder.push_try_catch("Failed to invoke stream");
                let args = self.compile_call_args(in_params, schema.as_ref())?;
                let result = self.builder.alloc_register();
                self.builder.add(Instruction::InvokeStreamVarRef {
                    function,
                    dst: result,
                    args,
                });
                self.begin_iteration(result);
                self.read_result(schema.as_ref());
                Ok(())
            }
            StreamOp::InvokeTable { stream, table, .. } => {
                self.compile_stream(stream)?;
                self.compile_table(table)
            }
            StreamOp::Filter { stream, filter, .. } => {
                self.compile_stream(stream)?;
                let cond = self.compile_filter(filter)?;
                self.builder.push_if(cond);
                Ok(())
            }
            StreamOp::Map { stream, op, .. } => {
                self.compile_stream(stream)?;
                self.apply_pointwise(op)
            }
            StreamOp::EdgeNew { stream } => {
                self.compile_stream(stream)?;
                let slot = self.alloc_state_slot();
                let state = self.builder.alloc_register();
                self.builder
                    .add(Instruction::InvokeReadState { dst: state, state_slot: slot });
                let tuple = self.current_output();
                let is_new = self.builder.alloc_register();
                self.builder.add(Instruction::CheckIsNewTuple {
                    dst: is_new,
                    state,
                    tuple,
                    keys: self.var_scope_names.clone(),
                });
                let new_state = self.builder.alloc_register();
                self.builder
                    .add(Instruction::AddTupleToState { dst: new_state, state, tuple });
                self.builder.add(Instruction::InvokeWriteState {
                    src: new_state,
                    state_slot: slot,
                });
                self.builder.push_if(is_new);
                Ok(())
            }
            StreamOp::EdgeFilter { stream, filter } => {
                self.compile_stream(stream)?;
                let slot = self.alloc_state_slot();
                let old_state = self.builder.alloc_register();
                self.builder
                    .add(Instruction::InvokeReadState { dst: old_state, state_slot: slot });
                let cond = self.compile_filter(filter)?;

                // persist the new filter value only when it changed
                let changed = self.builder.alloc_register();
                self.builder.add(Instruction::BinaryOp {
                    a: cond,
                    b: old_state,
                    op: "!==".to_string(),
                    dst: changed,
                });
                self.builder.push_if(changed);
                self.builder
                    .add(Instruction::InvokeWriteState { src: cond, state_slot: slot });
                self.builder.pop_block();

                // fire on the rising edge only
                let not_old = self.builder.alloc_register();
                self.builder.add(Instruction::UnaryOp {
                    v: old_state,
                    op: "!".to_string(),
                    dst: not_old,
                });
                let fire = self.builder.alloc_register();
                self.builder.add(Instruction::BinaryOp {
                    a: cond,
                    b: not_old,
                    op: "&&".to_string(),
                    dst: fire,
                });
                self.builder.push_if(fire);
                Ok(())
            }
            StreamOp::Union { lhs, rhs, schema } => {
                let saved_scope = self.scope.clone();
                let saved_vsn = self.var_scope_names.clone();

                let lhs_fn = self.builder.alloc_register();
                let depth = self.builder.save_stack_state();
                self.builder.push_async_function(lhs_fn);
                self.compile_stream(lhs)?;
                self.emit_current();
                self.builder.pop_to(depth);
                self.scope = saved_scope.clone();
                self.var_scope_names = saved_vsn.clone();

                let rhs_fn = self.builder.alloc_register();
                self.builder.push_async_function(rhs_fn);
                self.compile_stream(rhs)?;
                self.emit_current();
                self.builder.pop_to(depth);
                self.scope = saved_scope;
                self.var_scope_names = saved_vsn;

                let union = self.builder.alloc_register();
                self.builder.add(Instruction::FunctionOp {
                    function: "streamUnion".to_string(),
                    dst: union,
                    args: vec![lhs_fn, rhs_fn],
                });
                self.begin_iteration(union);
                self.read_result(schema.as_ref());
                Ok(())
            }
            StreamOp::Join { stream, table, .. } => {
                self.compile_stream(stream)?;
                let outer_scope = self.scope.clone();
                let outer_vsn = self.var_scope_names.clone();
                self.compile_table(table)?;
                self.merge_scopes(&outer_scope, &outer_vsn);
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Tables
    // ------------------------------------------------------------------

    fn compile_table(&mut self, op: &TableOp) -> Result<(), CompileError> {
        match op {
            TableOp::InvokeGet { invocation, schema, .. } => {
                self.builder.push_try_catch("Failed to invoke query");
                let attrs = self.compile_selector_attrs(&invocation.selector)?;
                let args = self.compile_in_params(&invocation.in_params)?;
                let result = self.builder.alloc_register();
                self.builder.add(Instruction::InvokeQuery {
                    kind: invocation.selector.kind.clone(),
                    attrs,
                    fname: invocation.channel.clone(),
                    dst: result,
                    args,
                });
                self.begin_iteration(result);
                self.read_result(schema.as_ref());
                Ok(())
            }
            TableOp::InvokeVarRef { name, in_params, schema, .. } => {
                let function = self.scope_function(name)?;
                self.builder.push_try_catch("Failed to invoke query");
                let args = self.compile_call_args(in_params, schema.as_ref())?;
                let result = self.builder.alloc_register();
                self.builder.add(Instruction::InvokeStreamVarRef {
                    function,
                    dst: result,
                    args,
                });
                self.begin_iteration(result);
                self.read_result(schema.as_ref());
                Ok(())
            }
            TableOp::ReadResult { function, index, schema } => {
                self.builder.push_try_catch("Failed to read results");
                let index = self.compile_value(index)?;
                let result = self.builder.alloc_register();
                self.builder.add(Instruction::InvokeReadResult {
                    function: function.clone(),
                    index,
                    dst: result,
                });
                self.begin_iteration(result);
                self.read_result(schema.as_ref());
                Ok(())
            }
            TableOp::Filter { table, filter, .. } => {
                self.compile_table(table)?;
                let cond = self.compile_filter(filter)?;
                self.builder.push_if(cond);
                Ok(())
            }
            TableOp::Map { table, op, .. } => {
                self.compile_table(table)?;
                self.apply_pointwise(op)
            }
            TableOp::Reduce { table, op, device, handle_thingtalk, schema } => {
                if let ReduceOp::ComplexSort { expression, direction } = op {
                    // a computed sort key is a compute plus a plain sort
                    let rewritten = TableOp::Reduce {
                        table: Box::new(TableOp::Map {
                            table: table.clone(),
                            op: PointWiseOp::Compute {
                                expression: expression.clone(),
                                alias: "__sort_key".to_string(),
                            },
                            device: device.clone(),
                            handle_thingtalk: *handle_thingtalk,
                            schema: schema.clone(),
                        }),
                        op: ReduceOp::SimpleSort {
                            field: "__sort_key".to_string(),
                            direction: *direction,
                        },
                        device: device.clone(),
                        handle_thingtalk: *handle_thingtalk,
                        schema: schema.clone(),
                    };
                    return self.compile_table(&rewritten);
                }

                let compiler = reduce::compiler_for(op);
                let state = compiler.init(&mut self.builder, &self.scope);
                let depth = self.builder.save_stack_state();
                self.compile_table(table)?;
                compiler.advance(&state, &mut self.builder, &self.scope, &self.var_scope_names);
                self.builder.pop_to(depth);
                let (scope, vsn) =
                    compiler.finish(&state, &mut self.builder, &self.scope, &self.var_scope_names);
                self.scope = scope;
                self.var_scope_names = vsn;
                Ok(())
            }
            TableOp::CrossJoin { lhs, rhs, schema, .. } => {
                let saved_scope = self.scope.clone();
                let saved_vsn = self.var_scope_names.clone();

                let lhs_fn = self.builder.alloc_register();
                let depth = self.builder.save_stack_state();
                self.builder.push_async_function(lhs_fn);
                self.compile_table(lhs)?;
                self.emit_current();
                self.builder.pop_to(depth);
                self.scope = saved_scope.clone();
                self.var_scope_names = saved_vsn.clone();

                let rhs_fn = self.builder.alloc_register();
                self.builder.push_async_function(rhs_fn);
                self.compile_table(rhs)?;
                self.emit_current();
                self.builder.pop_to(depth);
                self.scope = saved_scope;
                self.var_scope_names = saved_vsn;

                let joined = self.builder.alloc_register();
                self.builder.add(Instruction::FunctionOp {
                    function: "tableCrossJoin".to_string(),
                    dst: joined,
                    args: vec![lhs_fn, rhs_fn],
                });
                self.begin_iteration(joined);
                self.read_result(schema.as_ref());
                Ok(())
            }
            TableOp::NestedLoopJoin { lhs, rhs, .. } => {
                self.compile_table(lhs)?;
                let outer_scope = self.scope.clone();
                let outer_vsn = self.var_scope_names.clone();
                self.compile_table(rhs)?;
                self.merge_scopes(&outer_scope, &outer_vsn);
                Ok(())
            }
            TableOp::Join { lhs, rhs, device, schema, .. } => {
                let device = device.as_ref().ok_or_else(|| {
                    CompileError::Internal("device-pushdown join without a device".to_string())
                })?;
                let payload = json!({
                    "op": "join",
                    "lhs": describe_table_op(lhs),
                    "rhs": describe_table_op(rhs),
                });
                let ast_index = {
                    let mut objects = self.ast_objects.borrow_mut();
                    objects.push(payload);
                    objects.len() - 1
                };

                self.builder.push_try_catch("Failed to invoke query");
                let kind = device.kind.clone();
                let attrs = self.compile_selector_attrs(device)?;
                let result = self.builder.alloc_register();
                self.builder.add(Instruction::InvokeDbQuery {
                    kind,
                    attrs,
                    dst: result,
                    ast_index,
                });
                self.begin_iteration(result);
                self.read_result(schema.as_ref());
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Point-wise transforms
    // ------------------------------------------------------------------

    fn apply_pointwise(&mut self, op: &PointWiseOp) -> Result<(), CompileError> {
        match op {
            PointWiseOp::Projection(names) => {
                let tuple = self.builder.alloc_register();
                self.builder.add(Instruction::CreateObject { dst: tuple });
                for name in names {
                    if let Some(entry) = self.scope.get(name) {
                        self.builder.add(Instruction::SetKey {
                            object: tuple,
                            key: name.clone(),
                            src: entry.register,
                        });
                    }
                }
                let mut projected = Scope::new();
                if let Some(ot) = self.scope.output_type() {
                    projected.set_output_type(ot);
                }
                projected.set_output(tuple);
                for (name, entry) in self.scope.tuple_entries() {
                    if names.contains(name) {
                        projected.set(name, entry.clone());
                    }
                }
                self.scope = projected;
                self.var_scope_names.retain(|n| names.contains(n));
                Ok(())
            }
            PointWiseOp::Compute { expression, alias } => {
                let value = self.compile_scalar(expression)?;
                let output = self.current_output();
                self.builder.add(Instruction::SetKey {
                    object: output,
                    key: alias.clone(),
                    src: value,
                });
                self.scope.set(
                    alias.clone(),
                    ScopeEntry {
                        kind: ScopeKind::Scalar,
                        tt_type: None,
                        register: value,
                        is_in_var_scope_names: true,
                    },
                );
                self.var_scope_names.push(alias.clone());
                Ok(())
            }
            PointWiseOp::BooleanCompute { expression, alias } => {
                let value = self.compile_filter(expression)?;
                let output = self.current_output();
                self.builder.add(Instruction::SetKey {
                    object: output,
                    key: alias.clone(),
                    src: value,
                });
                self.scope.set(
                    alias.clone(),
                    ScopeEntry {
                        kind: ScopeKind::Scalar,
                        tt_type: Some(Type::Boolean),
                        register: value,
                        is_in_var_scope_names: true,
                    },
                );
                self.var_scope_names.push(alias.clone());
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Actions
    // ------------------------------------------------------------------

    fn compile_action(&mut self, op: &ActionOp) -> Result<(), CompileError> {
        match op {
            ActionOp::Notify => {
                let output_type = self.current_output_type();
                let output = self.current_output();
                self.builder
                    .add(Instruction::InvokeOutput { output_type, output });
                Ok(())
            }
            ActionOp::InvokeDo { invocation } => {
                self.builder.push_try_catch("Failed to invoke action");
                let attrs = self.compile_selector_attrs(&invocation.selector)?;
                let args = self.compile_in_params(&invocation.in_params)?;
                self.builder.add(Instruction::InvokeAction {
                    kind: invocation.selector.kind.clone(),
                    attrs,
                    fname: invocation.channel.clone(),
                    args,
                });
                self.builder.pop_block();

                if is_remote_send(invocation) {
                    self.compile_end_of_flow(invocation)?;
                }
                Ok(())
            }
            ActionOp::InvokeVarRef { name, in_params } => {
                let function = self.scope_function(name)?;
                self.builder.push_try_catch("Failed to invoke action");
                let args = self.compile_call_args(in_params, None)?;
                self.builder
                    .add(Instruction::InvokeActionVarRef { function, args });
                self.builder.pop_block();
                Ok(())
            }
        }
    }

    /// Remote sends additionally signal end-of-flow so the receiving
    /// program can stop waiting.
    fn compile_end_of_flow(&mut self, invocation: &Invocation) -> Result<(), CompileError> {
        self.builder.push_try_catch("Failed to signal end-of-flow");
        let principal = match find_param(&invocation.in_params, "__principal") {
            Some(value) => self.compile_value(value)?,
            None => self.load_undefined(),
        };
        let flow = match find_param(&invocation.in_params, "__flow") {
            Some(value) => self.compile_value(value)?,
            None => self.load_undefined(),
        };
        self.builder
            .add(Instruction::SendEndOfFlow { principal, flow });
        self.builder.pop_block();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Filters
    // ------------------------------------------------------------------

    fn compile_filter(&mut self, filter: &BooleanExpressionOp) -> Result<Register, CompileError> {
        match filter {
            BooleanExpressionOp::True | BooleanExpressionOp::DontCare { .. } => {
                Ok(self.load_boolean(true))
            }
            BooleanExpressionOp::False => Ok(self.load_boolean(false)),
            BooleanExpressionOp::And(ops) => {
                let cond = self.load_boolean(true);
                for op in ops {
                    let value = self.compile_filter(op)?;
                    self.builder.add(Instruction::BinaryOp {
                        a: cond,
                        b: value,
                        op: "&&".to_string(),
                        dst: cond,
                    });
                }
                Ok(cond)
            }
            BooleanExpressionOp::Or(ops) => {
                let cond = self.load_boolean(false);
                for op in ops {
                    let value = self.compile_filter(op)?;
                    self.builder.add(Instruction::BinaryOp {
                        a: cond,
                        b: value,
                        op: "||".to_string(),
                        dst: cond,
                    });
                }
                Ok(cond)
            }
            BooleanExpressionOp::Not(inner) => {
                let value = self.compile_filter(inner)?;
                let cond = self.builder.alloc_register();
                self.builder.add(Instruction::UnaryOp {
                    v: value,
                    op: "!".to_string(),
                    dst: cond,
                });
                Ok(cond)
            }
            BooleanExpressionOp::Atom { name, operator, value, .. } => {
                let lhs = self
                    .scope
                    .get(name)
                    .map(|e| e.register)
                    .ok_or_else(|| {
                        CompileError::Internal(format!("filter name {name} not in scope"))
                    })?;
                let rhs = self.compile_value(value)?;
                self.compile_comparison(operator, lhs, rhs)
            }
            BooleanExpressionOp::Compute { lhs, operator, rhs, .. } => {
                let lhs = self.compile_scalar(lhs)?;
                let rhs = self.compile_scalar(rhs)?;
                self.compile_comparison(operator, lhs, rhs)
            }
            BooleanExpressionOp::External { selector, channel, in_params, filter, schema } => {
                let cond = self.load_boolean(false);
                let depth = self.builder.save_stack_state();
                let saved_scope = self.scope.clone();
                let saved_vsn = self.var_scope_names.clone();

                self.builder.push_try_catch("Failed to invoke get-predicate query");
                let attrs = self.compile_selector_attrs(selector)?;
                let args = self.compile_in_params(in_params)?;
                let result = self.builder.alloc_register();
                self.builder.add(Instruction::InvokeQuery {
                    kind: selector.kind.clone(),
                    attrs,
                    fname: channel.clone(),
                    dst: result,
                    args,
                });
                self.begin_iteration(result);
                self.read_result(schema.as_ref());

                let inner = self.compile_filter(filter)?;
                self.builder.push_if(inner);
                self.builder.add(Instruction::LoadConstant {
                    value: Value::Boolean(true),
                    dst: cond,
                });
                self.builder.add(Instruction::Break);

                self.builder.pop_to(depth);
                self.scope = saved_scope;
                self.var_scope_names = saved_vsn;
                Ok(cond)
            }
            BooleanExpressionOp::ExistentialSubquery { subquery } => {
                let cond = self.load_boolean(false);
                let depth = self.builder.save_stack_state();
                let saved_scope = self.scope.clone();
                let saved_vsn = self.var_scope_names.clone();

                self.compile_table(subquery)?;
                self.builder.add(Instruction::LoadConstant {
                    value: Value::Boolean(true),
                    dst: cond,
                });
                self.builder.add(Instruction::Break);

                self.builder.pop_to(depth);
                self.scope = saved_scope;
                self.var_scope_names = saved_vsn;
                Ok(cond)
            }
            BooleanExpressionOp::ComparisonSubquery { lhs, operator, subquery, field, .. } => {
                let lhs = self.compile_value(lhs)?;
                let cond = self.load_boolean(false);
                let depth = self.builder.save_stack_state();
                let saved_scope = self.scope.clone();
                let saved_vsn = self.var_scope_names.clone();

                self.compile_table(subquery)?;
                let rhs = self
                    .scope
                    .get(field)
                    .map(|e| e.register)
                    .ok_or_else(|| {
                        CompileError::Internal(format!(
                            "comparison subquery field {field} not in scope"
                        ))
                    })?;
                let matched = self.compile_comparison(operator, lhs, rhs)?;
                self.builder.push_if(matched);
                self.builder.add(Instruction::LoadConstant {
                    value: Value::Boolean(true),
                    dst: cond,
                });
                self.builder.add(Instruction::Break);

                self.builder.pop_to(depth);
                self.scope = saved_scope;
                self.var_scope_names = saved_vsn;
                Ok(cond)
            }
        }
    }

    fn compile_comparison(
        &mut self,
        operator: &str,
        lhs: Register,
        rhs: Register,
    ) -> Result<Register, CompileError> {
        let dst = self.builder.alloc_register();
        match operator {
            "==" => self.builder.add(Instruction::BinaryFunctionOp {
                a: lhs,
                b: rhs,
                function: "equality".to_string(),
                dst,
            }),
            "!=" => {
                let eq = self.builder.alloc_register();
                self.builder.add(Instruction::BinaryFunctionOp {
                    a: lhs,
                    b: rhs,
                    function: "equality".to_string(),
                    dst: eq,
                });
                self.builder.add(Instruction::UnaryOp {
                    v: eq,
                    op: "!".to_string(),
                    dst,
                });
            }
            ">=" | "<=" | ">" | "<" => self.builder.add(Instruction::BinaryOp {
                a: lhs,
                b: rhs,
                op: operator.to_string(),
                dst,
            }),
            "=~" => self.builder.add(Instruction::BinaryFunctionOp {
                a: lhs,
                b: rhs,
                function: "like".to_string(),
                dst,
            }),
            "~=" => self.builder.add(Instruction::BinaryFunctionOp {
                a: rhs,
                b: lhs,
                function: "like".to_string(),
                dst,
            }),
            "starts_with" => self.builder.add(Instruction::BinaryFunctionOp {
                a: lhs,
                b: rhs,
                function: "startsWith".to_string(),
                dst,
            }),
            "ends_with" => self.builder.add(Instruction::BinaryFunctionOp {
                a: lhs,
                b: rhs,
                function: "endsWith".to_string(),
                dst,
            }),
            "contains" => self.builder.add(Instruction::BinaryFunctionOp {
                a: lhs,
                b: rhs,
                function: "contains".to_string(),
                dst,
            }),
            "contains~" => self.builder.add(Instruction::BinaryFunctionOp {
                a: lhs,
                b: rhs,
                function: "containsLike".to_string(),
                dst,
            }),
            "in_array" => self.builder.add(Instruction::BinaryFunctionOp {
                a: rhs,
                b: lhs,
                function: "contains".to_string(),
                dst,
            }),
            other => {
                return Err(CompileError::NotImplemented(format!(
                    "comparison operator {other}"
                )))
            }
        }
        Ok(dst)
    }

    // ------------------------------------------------------------------
    // Scalars and values
    // ------------------------------------------------------------------

    fn compile_scalar(&mut self, expression: &ScalarExpression) -> Result<Register, CompileError> {
        match expression {
            ScalarExpression::Primary(value) => self.compile_value(value),
            ScalarExpression::Derived { op, operands } => {
                let regs: Vec<Register> = operands
                    .iter()
                    .map(|o| self.compile_scalar(o))
                    .collect::<Result<_, _>>()?;
                let dst = self.builder.alloc_register();
                match (op.as_str(), regs.as_slice()) {
                    ("+" | "-" | "*" | "/" | "%", [a, b]) => {
                        self.builder.add(Instruction::BinaryOp {
                            a: *a,
                            b: *b,
                            op: op.clone(),
                            dst,
                        })
                    }
                    ("**", [a, b]) => self.builder.add(Instruction::BinaryFunctionOp {
                        a: *a,
                        b: *b,
                        function: "pow".to_string(),
                        dst,
                    }),
                    ("max" | "min" | "distance", [a, b]) => {
                        self.builder.add(Instruction::BinaryFunctionOp {
                            a: *a,
                            b: *b,
                            function: op.clone(),
                            dst,
                        })
                    }
                    (_, args) => self.builder.add(Instruction::FunctionOp {
                        function: op.clone(),
                        dst,
                        args: args.to_vec(),
                    }),
                }
                Ok(dst)
            }
        }
    }

    fn compile_value(&mut self, value: &Value) -> Result<Register, CompileError> {
        match value {
            Value::VarRef { name } => self
                .scope
                .get(name)
                .map(|e| e.register)
                .ok_or_else(|| {
                    CompileError::Internal(format!("variable {name} not in scope"))
                }),
            Value::Event { name } => {
                let dst = self.builder.alloc_register();
                match name.as_deref() {
                    None => {
                        let output_type = self.current_output_type();
                        let output = self.current_output();
                        self.builder.add(Instruction::FormatEvent {
                            hint: "string".to_string(),
                            output_type,
                            output,
                            dst,
                        });
                    }
                    Some("type") => {
                        let output_type = self.current_output_type();
                        self.builder
                            .add(Instruction::Copy { src: output_type, dst });
                    }
                    Some("program_id") => {
                        self.builder.add(Instruction::GetEnvironment {
                            name: "program_id".to_string(),
                            dst,
                        });
                    }
                    Some(field) => {
                        let output = self.current_output();
                        self.builder.add(Instruction::GetKey {
                            object: output,
                            key: field.to_string(),
                            dst,
                        });
                    }
                }
                Ok(dst)
            }
            other => {
                let dst = self.builder.alloc_register();
                self.builder
                    .add(Instruction::LoadConstant { value: other.clone(), dst });
                Ok(dst)
            }
        }
    }

    fn compile_value_array(&mut self, values: &[Value]) -> Result<Register, CompileError> {
        let array = self.builder.alloc_register();
        self.builder
            .add(Instruction::CreateTuple { size: values.len(), dst: array });
        for (i, value) in values.iter().enumerate() {
            let r = self.compile_value(value)?;
            self.builder
                .add(Instruction::SetIndex { tuple: array, index: i, src: r });
        }
        Ok(array)
    }

    // ------------------------------------------------------------------
    // Invocation plumbing
    // ------------------------------------------------------------------

    fn compile_selector_attrs(
        &mut self,
        selector: &DeviceSelector,
    ) -> Result<Register, CompileError> {
        let attrs = self.builder.alloc_register();
        self.builder.add(Instruction::CreateObject { dst: attrs });
        if let Some(id) = &selector.id {
            let r = self.compile_value(&Value::String(id.clone()))?;
            self.builder.add(Instruction::SetKey {
                object: attrs,
                key: "id".to_string(),
                src: r,
            });
        }
        for attribute in &selector.attributes {
            let r = self.compile_value(&attribute.value)?;
            self.builder.add(Instruction::SetKey {
                object: attrs,
                key: attribute.name.clone(),
                src: r,
            });
        }
        Ok(attrs)
    }

    fn compile_in_params(&mut self, in_params: &[InputParam]) -> Result<Register, CompileError> {
        let args = self.builder.alloc_register();
        self.builder.add(Instruction::CreateObject { dst: args });
        for param in in_params {
            if matches!(param.value, Value::Undefined { .. }) {
                continue;
            }
            let r = self.compile_value(&param.value)?;
            self.builder.add(Instruction::SetKey {
                object: args,
                key: param.name.clone(),
                src: r,
            });
        }
        Ok(args)
    }

    /// Positional arguments for a declaration call, in the signature's
    /// declared order.
    fn compile_call_args(
        &mut self,
        in_params: &[InputParam],
        schema: Option<&Arc<FunctionDef>>,
    ) -> Result<Vec<Register>, CompileError> {
        match schema {
            Some(schema) => schema
                .in_params()
                .map(|arg| match find_param(in_params, &arg.name) {
                    Some(value) => self.compile_value(value),
                    None => Ok(self.load_undefined()),
                })
                .collect(),
            None => {
                // no signature: sorted by name, matching declaration order
                let mut sorted: Vec<&InputParam> = in_params.iter().collect();
                sorted.sort_by(|a, b| a.name.cmp(&b.name));
                sorted
                    .into_iter()
                    .map(|p| self.compile_value(&p.value))
                    .collect()
            }
        }
    }

    fn scope_function(&self, name: &str) -> Result<Register, CompileError> {
        self.scope
            .get(name)
            .filter(|e| {
                matches!(e.kind, ScopeKind::Declaration | ScopeKind::Procedure | ScopeKind::Assignment)
            })
            .map(|e| e.register)
            .ok_or_else(|| {
                CompileError::Internal(format!("no declaration named {name} in scope"))
            })
    }

    // ------------------------------------------------------------------
    // Iteration and scope plumbing
    // ------------------------------------------------------------------

    /// Iterate an invocation result. Leaves the builder inside the loop
    /// body with `$output`/`$outputType` bound to the current element.
    fn begin_iteration(&mut self, iterable: Register) {
        let iterator = self.builder.alloc_register();
        self.builder
            .add(Instruction::Iterator { dst: iterator, iterable });
        let result = self.builder.alloc_register();
        self.builder.push_async_while(result, iterator);

        let pair = self.builder.alloc_register();
        self.builder.add(Instruction::GetKey {
            object: result,
            key: "value".to_string(),
            dst: pair,
        });
        let output_type = self.builder.alloc_register();
        self.builder
            .add(Instruction::GetIndex { tuple: pair, index: 0, dst: output_type });
        let output = self.builder.alloc_register();
        self.builder
            .add(Instruction::GetIndex { tuple: pair, index: 1, dst: output });
        self.scope.set_output_type(output_type);
        self.scope.set_output(output);
    }

    /// Bind every declared out-parameter of `schema` into the scope by
    /// reading it off the current tuple. Dotted names are skipped at the
    /// top level; compound arguments recurse into their fields instead.
    /// The watched names (`var_scope_names`) become exactly the out
    /// parameters, never the inputs.
    fn read_result(&mut self, schema: Option<&Arc<FunctionDef>>) {
        self.var_scope_names.clear();
        let Some(schema) = schema else { return };
        let output = self.current_output();
        for arg in schema.out_params() {
            if arg.is_compound_field() {
                continue;
            }
            let register = self.builder.alloc_register();
            self.builder.add(Instruction::GetKey {
                object: output,
                key: arg.name.clone(),
                dst: register,
            });
            self.scope.set(
                arg.name.clone(),
                ScopeEntry {
                    kind: ScopeKind::Scalar,
                    tt_type: Some(arg.arg_type.clone()),
                    register,
                    is_in_var_scope_names: true,
                },
            );
            self.var_scope_names.push(arg.name.clone());

            if let Type::Compound { fields, .. } = &arg.arg_type {
                self.read_compound_fields(&arg.name, register, fields);
            }
        }
    }

    fn read_compound_fields(
        &mut self,
        prefix: &str,
        parent: Register,
        fields: &std::collections::BTreeMap<String, Type>,
    ) {
        for (field, field_type) in fields {
            let register = self.builder.alloc_register();
            self.builder.add(Instruction::GetKey {
                object: parent,
                key: field.clone(),
                dst: register,
            });
            let name = format!("{prefix}.{field}");
            self.scope.set(
                name.clone(),
                ScopeEntry {
                    kind: ScopeKind::Scalar,
                    tt_type: Some(field_type.clone()),
                    register,
                    is_in_var_scope_names: false,
                },
            );
            if let Type::Compound { fields, .. } = field_type {
                self.read_compound_fields(&name, register, fields);
            }
        }
    }

    /// Merge the current (inner) tuple scope with a saved outer one into
    /// a fresh joined tuple.
    fn merge_scopes(&mut self, outer: &Scope, outer_vsn: &[String]) {
        let merged = self.builder.alloc_register();
        self.builder.add(Instruction::CreateObject { dst: merged });
        for (name, entry) in outer.tuple_entries() {
            self.builder.add(Instruction::SetKey {
                object: merged,
                key: name.to_string(),
                src: entry.register,
            });
        }
        for (name, entry) in self.scope.tuple_entries() {
            self.builder.add(Instruction::SetKey {
                object: merged,
                key: name.to_string(),
                src: entry.register,
            });
        }

        let output_type = match (outer.output_type(), self.scope.output_type()) {
            (Some(a), Some(b)) => {
                let combined = self.builder.alloc_register();
                self.builder.add(Instruction::BinaryFunctionOp {
                    a,
                    b,
                    function: "combineOutputTypes".to_string(),
                    dst: combined,
                });
                Some(combined)
            }
            (a, b) => a.or(b),
        };

        let mut joined = outer.clone();
        for (name, entry) in self.scope.tuple_entries() {
            joined.set(name, entry.clone());
        }
        joined.set_output(merged);
        if let Some(ot) = output_type {
            joined.set_output_type(ot);
        }
        self.scope = joined;

        let mut vsn: Vec<String> = outer_vsn.to_vec();
        for name in &self.var_scope_names {
            if !vsn.contains(name) {
                vsn.push(name.clone());
            }
        }
        self.var_scope_names = vsn;
    }

    fn emit_current(&mut self) {
        let output_type = self.current_output_type();
        let output = self.current_output();
        self.builder
            .add(Instruction::InvokeEmit { values: vec![output_type, output] });
    }

    fn current_output(&mut self) -> Register {
        match self.scope.output() {
            Some(r) => r,
            None => {
                let r = self.builder.alloc_register();
                self.builder.add(Instruction::CreateObject { dst: r });
                self.scope.set_output(r);
                r
            }
        }
    }

    fn current_output_type(&mut self) -> Register {
        match self.scope.output_type() {
            Some(r) => r,
            None => {
                let r = self.load_undefined();
                self.scope.set_output_type(r);
                r
            }
        }
    }

    fn load_boolean(&mut self, value: bool) -> Register {
        let r = self.builder.alloc_register();
        self.builder.add(Instruction::LoadConstant {
            value: Value::Boolean(value),
            dst: r,
        });
        r
    }

    fn load_undefined(&mut self) -> Register {
        let r = self.builder.alloc_register();
        self.builder.add(Instruction::LoadConstant {
            value: Value::Undefined { local: true },
            dst: r,
        });
        r
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn find_param<'a>(in_params: &'a [InputParam], name: &str) -> Option<&'a Value> {
    in_params
        .iter()
        .find(|p| p.name == name)
        .map(|p| &p.value)
}

fn is_remote_send(invocation: &Invocation) -> bool {
    let kind = &invocation.selector.kind;
    (kind == REMOTE_KIND || kind.starts_with("__dyn_")) && invocation.channel == "send"
}

/// Compact structural description of a table subtree, shipped to devices
/// that evaluate whole queries by themselves.
fn describe_table_op(op: &TableOp) -> serde_json::Value {
    match op {
        TableOp::InvokeGet { invocation, .. } => json!({
            "op": "invoke",
            "kind": invocation.selector.kind,
            "channel": invocation.channel,
        }),
        TableOp::InvokeVarRef { name, .. } => json!({ "op": "varref", "name": name }),
        TableOp::ReadResult { function, .. } => json!({ "op": "result", "function": function }),
        TableOp::Filter { table, .. } => json!({
            "op": "filter",
            "table": describe_table_op(table),
        }),
        TableOp::Map { table, .. } => json!({
            "op": "map",
            "table": describe_table_op(table),
        }),
        TableOp::Reduce { table, .. } => json!({
            "op": "reduce",
            "table": describe_table_op(table),
        }),
        TableOp::CrossJoin { lhs, rhs, .. }
        | TableOp::NestedLoopJoin { lhs, rhs, .. }
        | TableOp::Join { lhs, rhs, .. } => json!({
            "op": "join",
            "lhs": describe_table_op(lhs),
            "rhs": describe_table_op(rhs),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::builtins;
    use crate::ast::{ArgumentDef, Direction, FunctionType, Statement};
    use crate::types::Type;

    fn query_schema(kind: &str, name: &str, outs: &[(&str, Type)]) -> Arc<FunctionDef> {
        let args = outs
            .iter()
            .map(|(n, t)| ArgumentDef::new(Direction::Out, *n, t.clone()))
            .collect();
        let mut f = FunctionDef::new(kind, FunctionType::Query, name, args);
        f.is_list = true;
        f.is_monitorable = true;
        Arc::new(f)
    }

    fn invoke_get(schema: &Arc<FunctionDef>, in_params: Vec<InputParam>) -> TableOp {
        let mut invocation =
            Invocation::new(DeviceSelector::new(schema.kind.clone()), schema.name.clone());
        invocation.in_params = in_params;
        TableOp::InvokeGet {
            device: Some(invocation.selector.clone()),
            handle_thingtalk: false,
            invocation,
            hints: QueryInvocationHints::new(),
            schema: Some(schema.clone()),
        }
    }

    fn compile_table_op(table: TableOp) -> String {
        let rule = RuleOp {
            stream: Some(StreamOp::InvokeTable {
                stream: Box::new(StreamOp::Now),
                table: Box::new(table),
                schema: None,
            }),
            actions: vec![ActionOp::Notify],
            has_output: true,
            source: Statement::Command { table: None, actions: vec![] },
        };
        let mut compiler =
            OpCompiler::new(Rc::new(Cell::new(0)), Rc::new(RefCell::new(Vec::new())));
        compiler.compile_rule(&rule).expect("compilation failed");
        compiler.finish()
    }

    #[test]
    fn test_cross_join_emits_two_generators() {
        let a = query_schema("com.a", "one", &[("x", Type::Number)]);
        let b = query_schema("com.b", "two", &[("y", Type::Number)]);
        let joined = Arc::new(a.join(&b));
        let code = compile_table_op(TableOp::CrossJoin {
            lhs: Box::new(invoke_get(&a, vec![])),
            rhs: Box::new(invoke_get(&b, vec![])),
            device: None,
            handle_thingtalk: false,
            schema: Some(joined),
        });

        assert_eq!(code.matches("async function(__emit)").count(), 2);
        assert!(code.contains("await __emit("));
        assert!(code.contains("__builtin.tableCrossJoin("));
        assert!(code.contains("await __env.invokeQuery(\"com.a\""));
        assert!(code.contains("await __env.invokeQuery(\"com.b\""));
        // the joined result is iterated like any other invocation
        assert!(code.contains("_t_"));
        assert!(code.contains("while (!"));
    }

    #[test]
    fn test_nested_loop_join_inlines_and_merges() {
        let a = query_schema("com.a", "one", &[("x", Type::Number)]);
        let b = query_schema("com.b", "two", &[("y", Type::Number)]);
        let joined = Arc::new(a.join(&b));
        // the inner invocation reads the outer row's output
        let rhs = invoke_get(&b, vec![InputParam::new("seed", Value::VarRef { name: "x".into() })]);
        let code = compile_table_op(TableOp::NestedLoopJoin {
            lhs: Box::new(invoke_get(&a, vec![])),
            rhs: Box::new(rhs),
            device: None,
            handle_thingtalk: false,
            schema: Some(joined),
        });

        assert!(!code.contains("tableCrossJoin"));
        assert!(code.contains("await __env.invokeQuery(\"com.a\""));
        assert!(code.contains("await __env.invokeQuery(\"com.b\""));
        assert!(code.contains("[\"seed\"]"));
        assert!(code.contains("__builtin.combineOutputTypes("));
        // both rows merge into a fresh tuple
        assert!(code.contains("[\"x\"]"));
        assert!(code.contains("[\"y\"]"));
    }

    #[test]
    fn test_device_pushdown_join_uses_db_query() {
        let a = query_schema("org.database", "orders", &[("amount", Type::Number)]);
        let b = query_schema("org.database", "customers", &[("name", Type::String)]);
        let joined = Arc::new(a.join(&b));
        let device = DeviceSelector::new("org.database");
        let table = TableOp::Join {
            lhs: Box::new(invoke_get(&a, vec![])),
            rhs: Box::new(invoke_get(&b, vec![])),
            device: Some(device),
            handle_thingtalk: true,
            schema: Some(joined),
        };

        let rule = RuleOp {
            stream: Some(StreamOp::InvokeTable {
                stream: Box::new(StreamOp::Now),
                table: Box::new(table),
                schema: None,
            }),
            actions: vec![ActionOp::Notify],
            has_output: true,
            source: Statement::Command { table: None, actions: vec![] },
        };
        let ast_objects = Rc::new(RefCell::new(Vec::new()));
        let mut compiler = OpCompiler::new(Rc::new(Cell::new(0)), ast_objects.clone());
        compiler.compile_rule(&rule).expect("compilation failed");
        let code = compiler.finish();

        assert!(code.contains("await __env.invokeDBQuery(\"org.database\""));
        assert!(code.contains("__ast[0]"));
        // neither side is invoked locally
        assert!(!code.contains("invokeQuery"));
        assert_eq!(ast_objects.borrow().len(), 1);
        assert_eq!(ast_objects.borrow()[0]["op"], "join");
    }

    #[test]
    fn test_external_predicate_iterates_and_breaks() {
        let a = query_schema("com.a", "one", &[("x", Type::Number)]);
        let weather = query_schema("org.weather", "current", &[("temperature", Type::Number)]);
        let code = compile_table_op(TableOp::Filter {
            table: Box::new(invoke_get(&a, vec![])),
            filter: BooleanExpressionOp::External {
                selector: DeviceSelector::new("org.weather"),
                channel: "current".to_string(),
                in_params: vec![],
                filter: Box::new(BooleanExpressionOp::Atom {
                    name: "temperature".to_string(),
                    operator: ">=".to_string(),
                    value: Value::Number(30.0),
                    overload: None,
                }),
                schema: Some(weather),
            },
            device: None,
            handle_thingtalk: false,
            schema: Some(a.clone()),
        });

        assert!(code.contains("reportError(\"Failed to invoke get-predicate query\""));
        assert!(code.contains("await __env.invokeQuery(\"org.weather\""));
        assert!(code.contains(" >= "));
        // first match wins, then the predicate loop stops
        assert!(code.contains("break;"));
    }

    #[test]
    fn test_comparison_subquery_compares_projected_field() {
        let a = query_schema("com.a", "one", &[("x", Type::Number)]);
        let weather = query_schema("org.weather", "current", &[("temperature", Type::Number)]);
        let code = compile_table_op(TableOp::Filter {
            table: Box::new(invoke_get(&a, vec![])),
            filter: BooleanExpressionOp::ComparisonSubquery {
                lhs: Value::Number(5.0),
                operator: "<=".to_string(),
                subquery: Box::new(invoke_get(&weather, vec![])),
                field: "temperature".to_string(),
                overload: None,
            },
            device: None,
            handle_thingtalk: false,
            schema: Some(a.clone()),
        });

        assert!(code.contains(" = 5;"));
        assert!(code.contains("await __env.invokeQuery(\"org.weather\""));
        assert!(code.contains(" <= "));
        assert!(code.contains("break;"));
    }

    #[test]
    fn test_stream_union_merges_two_sources() {
        let rule = RuleOp {
            stream: Some(StreamOp::Union {
                lhs: Box::new(StreamOp::Timer {
                    base: None,
                    interval: Value::Measure { value: 1.0, unit: "h".to_string() },
                    frequency: None,
                }),
                rhs: Box::new(StreamOp::Timer {
                    base: None,
                    interval: Value::Measure { value: 1.0, unit: "day".to_string() },
                    frequency: None,
                }),
                schema: Some(Arc::new(builtins::timer())),
            }),
            actions: vec![ActionOp::Notify],
            has_output: true,
            source: Statement::Command { table: None, actions: vec![] },
        };
        let mut compiler =
            OpCompiler::new(Rc::new(Cell::new(0)), Rc::new(RefCell::new(Vec::new())));
        compiler.compile_rule(&rule).expect("compilation failed");
        let code = compiler.finish();

        assert_eq!(code.matches("async function(__emit)").count(), 2);
        assert_eq!(code.matches("await __env.invokeTimer(").count(), 2);
        assert!(code.contains("__builtin.streamUnion("));
        assert!(code.contains("await __emit("));
        assert!(code.contains("await __env.output("));
    }
}
