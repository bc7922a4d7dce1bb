//! # ThingTalk Compiler Core
//!
//! The language pipeline that turns a ThingTalk virtual-assistant program
//! into an executable plan for an asynchronous runtime.
//!
//! ## Pipeline Architecture
//!
//! ```text
//! Token stream (external lexer)
//!     ↓
//! [Parser]                 → AST (shift-reduce over generated tables)
//!     ↓
//! [Schema Retriever]       → class metadata (batched, cached)
//!     ↓
//! [Typechecker]            → typed AST (schemas + overload triples)
//!     ↓
//! [Lowering]               → StreamOp/TableOp/ActionOp trees with hints
//!     ↓
//! [Optimizer]              → peephole-clean operator trees
//!     ↓
//! [OpCompiler]             → register IR
//!     ↓
//! [Codegen]                → async functions for the runtime
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use thingtalk::schema::{HttpCatalog, SchemaRetriever};
//! use thingtalk::{compile_program, typecheck_program};
//!
//! let retriever = SchemaRetriever::new(Arc::new(HttpCatalog::new(
//!     "https://thingpedia.stanford.edu/thingpedia",
//! )));
//!
//! // program comes out of the parser, driven by generated tables
//! typecheck_program(&mut program, &retriever).await?;
//! let compiled = compile_program(&program)?;
//! for rule in &compiled.rules {
//!     println!("{rule}");
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `types` | value types, unification, entity subtyping |
//! | `value` | constant values and their normalized host form |
//! | `ast` | programs, streams, tables, filters, class metadata |
//! | `parser` | table-driven shift-reduce runtime |
//! | `schema` | catalog client + batching/caching retriever |
//! | `typecheck` | schema resolution, scoping, overload triples |
//! | `ir` | stream/table/action operator trees and hints |
//! | `ir_builder` | query-algebra lowering |
//! | `optimizer` | peephole rules over operator trees |
//! | `code_generator` | register IR, blocks, codegen |
//! | `config` | figment-based configuration |

pub mod ast;
pub mod types;
pub mod units;
pub mod value;

pub mod parser;
pub mod schema;
pub mod typecheck;

pub mod ir;
pub mod ir_builder;
pub mod optimizer;

pub mod code_generator;

pub mod config;

// Re-export the pipeline surface
pub use ast::Program;
pub use code_generator::{compile_program, CompiledProgram};
pub use config::Config;
pub use ir::CompileError;
pub use ir_builder::Lowerer;
pub use optimizer::Optimizer;
pub use parser::{ParseTables, Parser, SyntaxError, Token};
pub use schema::{SchemaError, SchemaRetriever};
pub use typecheck::{typecheck_program, TypeError};
pub use types::Type;
pub use value::Value;
