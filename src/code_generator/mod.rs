//! # Code Generator
//!
//! Turns optimized operator trees into register-IR functions for the
//! async runtime.
//!
//! ```text
//! Optimized RuleOp -> [OpCompiler] -> register IR -> codegen -> JS text
//! ```
//!
//! The output of [`compile_program`] is one function per rule plus a
//! single function holding every immediate command; each serializes to an
//! async function over `(__builtin, __scope, __ast, __env, ...args)` with
//! all registers declared up front, so the runtime can bind it without
//! introspection.

pub mod builder;
pub mod instr;
pub mod reduce;
pub mod scope;

mod compiler;

pub use builder::IrBuilder;
pub use instr::{Block, InnerFunction, Instruction, Register};
pub use scope::{Scope, ScopeEntry, ScopeKind};

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::ast::{Program, Statement};
use crate::ir::CompileError;
use crate::ir_builder::Lowerer;
use crate::optimizer::Optimizer;

use compiler::OpCompiler;

/// The executable form of a program.
#[derive(Debug, Clone, Default)]
pub struct CompiledProgram {
    /// Number of persistent state slots the rules allocate
    pub states: usize,
    /// All immediate commands, compiled sequentially into one function
    pub command: Option<String>,
    /// One function per event-driven rule
    pub rules: Vec<String>,
    /// AST payloads referenced by `GetASTObject`/`InvokeDBQuery`
    pub ast_objects: Vec<serde_json::Value>,
}

/// Compile a typed program: lower, optimize, and emit.
pub fn compile_program(program: &Program) -> Result<CompiledProgram, CompileError> {
    let lowerer = Lowerer::new();
    let optimizer = Optimizer::new();
    let states = Rc::new(Cell::new(0));
    let ast_objects = Rc::new(RefCell::new(Vec::new()));

    let mut command_ops = Vec::new();
    let mut rule_ops = Vec::new();
    for statement in &program.rules {
        let rule = optimizer.optimize_rule(lowerer.lower_statement(statement)?);
        match statement {
            Statement::Command { .. } => command_ops.push(rule),
            _ => rule_ops.push(rule),
        }
    }

    let command = if command_ops.is_empty() {
        None
    } else {
        let mut compiler = OpCompiler::new(states.clone(), ast_objects.clone());
        for (index, decl) in program.declarations.iter().enumerate() {
            compiler.compile_declaration(decl, index)?;
        }
        for rule in &command_ops {
            compiler.compile_rule(rule)?;
        }
        Some(compiler.finish())
    };

    let mut rules = Vec::new();
    for rule in &rule_ops {
        let mut compiler = OpCompiler::new(states.clone(), ast_objects.clone());
        for (index, decl) in program.declarations.iter().enumerate() {
            compiler.compile_declaration(decl, index)?;
        }
        compiler.compile_rule(rule)?;
        rules.push(compiler.finish());
    }

    let ast_objects = ast_objects.borrow().clone();
    Ok(CompiledProgram { states: states.get(), command, rules, ast_objects })
}
