//! # Register IR
//!
//! The instruction set the operator compiler emits and its serialization
//! to the target runtime's form: a single async function over
//! `(__builtin, __scope, __ast, __env, ...args)` with every register
//! declared up front. Blocks nest inside control-flow instructions; the
//! rest are straight-line register operations.

use crate::units;
use crate::value::{Location as LocationValue, Value};

/// A virtual register, rendered as `_t_N`.
pub type Register = usize;

fn reg(r: Register) -> String {
    format!("_t_{r}")
}

fn escape_js(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out
}

fn string_literal(s: &str) -> String {
    format!("\"{}\"", escape_js(s))
}

/// Render a constant value as a target-language literal. Values needing
/// runtime resolution (symbolic dates, relative locations) render as
/// builtin calls; unresolved references render as `null` (the compiler
/// resolves them to registers before emitting).
pub fn value_literal(value: &Value) -> String {
    match value {
        Value::Boolean(b) => b.to_string(),
        Value::String(s) => string_literal(s),
        Value::Number(n) if n.is_infinite() => {
            if *n > 0.0 { "Infinity".to_string() } else { "-Infinity".to_string() }
        }
        Value::Number(n) => format!("{n}"),
        Value::Measure { value, unit } => {
            format!("{}", units::normalize(*value, unit).unwrap_or(*value))
        }
        Value::CompoundMeasure(parts) => {
            let total: f64 = parts
                .iter()
                .map(|p| match p {
                    Value::Measure { value, unit } => {
                        units::normalize(*value, unit).unwrap_or(*value)
                    }
                    _ => 0.0,
                })
                .sum();
            format!("{total}")
        }
        Value::Currency { value, code } => {
            format!("new __builtin.Currency({}, {})", value, string_literal(&code.to_lowercase()))
        }
        Value::Location(LocationValue::Absolute { lat, lon, display }) => {
            let display = display
                .as_ref()
                .map(|d| string_literal(d))
                .unwrap_or_else(|| "null".to_string());
            format!("new __builtin.Location({lat}, {lon}, {display})")
        }
        Value::Location(LocationValue::Relative { tag }) => {
            format!("__builtin.relativeLocation({})", string_literal(tag.as_str()))
        }
        Value::Date(date) => match (date.resolve(), &date.value) {
            (Some(resolved), _) => format!(
                "new Date({})",
                string_literal(&resolved.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
            ),
            (None, None) if date.offset.is_none() => "new Date()".to_string(),
            _ => {
                // symbolic base or offset; hand the description to the runtime
                let json = serde_json::to_string(date).unwrap_or_else(|_| "null".to_string());
                format!("__builtin.resolveDate({json})")
            }
        },
        Value::Time { hour, minute, second } => {
            format!("new __builtin.Time({hour}, {minute}, {second})")
        }
        Value::Entity { value, display, .. } => {
            let display = display
                .as_ref()
                .map(|d| string_literal(d))
                .unwrap_or_else(|| "null".to_string());
            format!("new __builtin.Entity({}, {display})", string_literal(value))
        }
        Value::Enum { value } => string_literal(value),
        Value::Array(elems) => {
            let inner: Vec<String> = elems.iter().map(value_literal).collect();
            format!("[{}]", inner.join(", "))
        }
        Value::Undefined { .. } => "undefined".to_string(),
        Value::VarRef { .. } | Value::Event { .. } => "null".to_string(),
    }
}

/// An ordered list of instructions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Block {
    pub instructions: Vec<Instruction>,
}

impl Block {
    pub fn new() -> Self {
        Block::default()
    }

    pub fn add(&mut self, instruction: Instruction) {
        self.instructions.push(instruction);
    }

    pub fn write_into(&self, out: &mut String, prefix: &str) {
        for instruction in &self.instructions {
            instruction.write_into(out, prefix);
        }
    }
}

/// A nested function compiled by its own builder: its parameters are its
/// first `params` registers, and `register_count` covers everything it
/// allocated. Stream and table declarations additionally take the
/// `__emit` callback as their first parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct InnerFunction {
    pub params: usize,
    pub register_count: usize,
    pub takes_emit: bool,
    pub body: Block,
}

/// The complete instruction set.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    // data movement
    Copy { src: Register, dst: Register },
    CreateTuple { size: usize, dst: Register },
    CreateObject { dst: Register },
    SetIndex { tuple: Register, index: usize, src: Register },
    GetIndex { tuple: Register, index: usize, dst: Register },
    SetKey { object: Register, key: String, src: Register },
    GetKey { object: Register, key: String, dst: Register },
    GetAstObject { index: usize, dst: Register },
    GetVariable { name: String, dst: Register },
    GetEnvironment { name: String, dst: Register },
    GetScope { name: String, dst: Register },
    Iterator { dst: Register, iterable: Register },
    LoadConstant { value: Value, dst: Register },
    LoadBuiltin { name: String, dst: Register },
    LoadContext { context: String, dst: Register },
    NewObject { class: String, dst: Register, args: Vec<Register> },
    MapAndReadField { dst: Register, array: Register, field: String },
    FormatEvent { hint: String, output_type: Register, output: Register, dst: Register },

    // arithmetic / logic
    BinaryOp { a: Register, b: Register, op: String, dst: Register },
    UnaryOp { v: Register, op: String, dst: Register },
    BinaryFunctionOp { a: Register, b: Register, function: String, dst: Register },
    UnaryMethodOp { object: Register, arg: Register, method: String },
    BinaryMethodOp { object: Register, a: Register, b: Register, method: String },
    VoidFunctionOp { function: String, args: Vec<Register> },
    FunctionOp { function: String, dst: Register, args: Vec<Register> },

    // invocation
    InvokeMonitor {
        kind: String,
        attrs: Register,
        fname: String,
        dst: Register,
        args: Register,
        once: bool,
    },
    InvokeTimer { dst: Register, base: Register, interval: Register, frequency: Option<Register> },
    InvokeAtTimer { dst: Register, time_array: Register, expiration: Option<Register> },
    InvokeQuery { kind: String, attrs: Register, fname: String, dst: Register, args: Register },
    InvokeDbQuery { kind: String, attrs: Register, dst: Register, ast_index: usize },
    InvokeStreamVarRef { function: Register, dst: Register, args: Vec<Register> },
    InvokeAction { kind: String, attrs: Register, fname: String, args: Register },
    InvokeActionVarRef { function: Register, args: Vec<Register> },
    InvokeOutput { output_type: Register, output: Register },
    InvokeReadState { dst: Register, state_slot: usize },
    InvokeWriteState { src: Register, state_slot: usize },
    InvokeReadResult { function: String, index: Register, dst: Register },
    InvokeEmit { values: Vec<Register> },
    EnterProcedure { id: Register, name: String },
    ExitProcedure { id: Register, name: String },
    SendEndOfFlow { principal: Register, flow: Register },
    ClearGetCache,

    // control flow
    Break,
    IfStatement { cond: Register, iftrue: Block, iffalse: Block },
    ForOfStatement { into: Register, iterable: Register, body: Block },
    AsyncWhileLoop { into: Register, iterator: Register, body: Block },
    AsyncFunctionExpression { into: Register, body: Block },
    ArrayFilterExpression { into: Register, element: Register, array: Register, body: Block },
    AsyncFunctionDeclaration { into: Register, function: InnerFunction },
    LabeledLoop { label: usize, body: Block },
    LabeledBreak { label: usize },
    LabeledContinue { label: usize },
    ReturnValue { src: Register },
    TryCatch { message: String, body: Block },
    CheckIsNewTuple { dst: Register, state: Register, tuple: Register, keys: Vec<String> },
    AddTupleToState { dst: Register, state: Register, tuple: Register },
}

impl Instruction {
    pub fn write_into(&self, out: &mut String, prefix: &str) {
        use Instruction::*;
        let line = |out: &mut String, text: String| {
            out.push_str(prefix);
            out.push_str(&text);
            out.push('\n');
        };
        match self {
            Copy { src, dst } => line(out, format!("{} = {};", reg(*dst), reg(*src))),
            CreateTuple { size, dst } => {
                line(out, format!("{} = new Array({size});", reg(*dst)))
            }
            CreateObject { dst } => line(out, format!("{} = {{}};", reg(*dst))),
            SetIndex { tuple, index, src } => {
                line(out, format!("{}[{index}] = {};", reg(*tuple), reg(*src)))
            }
            GetIndex { tuple, index, dst } => {
                line(out, format!("{} = {}[{index}];", reg(*dst), reg(*tuple)))
            }
            SetKey { object, key, src } => line(
                out,
                format!("{}[{}] = {};", reg(*object), string_literal(key), reg(*src)),
            ),
            GetKey { object, key, dst } => line(
                out,
                format!("{} = {}[{}];", reg(*dst), reg(*object), string_literal(key)),
            ),
            GetAstObject { index, dst } => {
                line(out, format!("{} = __ast[{index}];", reg(*dst)))
            }
            GetVariable { name, dst } => line(
                out,
                format!("{} = __env.getVariable({});", reg(*dst), string_literal(name)),
            ),
            GetEnvironment { name, dst } => {
                line(out, format!("{} = __env.{name};", reg(*dst)))
            }
            GetScope { name, dst } => line(
                out,
                format!("{} = __scope[{}];", reg(*dst), string_literal(name)),
            ),
            Iterator { dst, iterable } => line(
                out,
                format!("{} = __builtin.getAsyncIterator({});", reg(*dst), reg(*iterable)),
            ),
            LoadConstant { value, dst } => {
                line(out, format!("{} = {};", reg(*dst), value_literal(value)))
            }
            LoadBuiltin { name, dst } => {
                line(out, format!("{} = __builtin.{name};", reg(*dst)))
            }
            LoadContext { context, dst } => line(
                out,
                format!("{} = await __env.loadContext({});", reg(*dst), string_literal(context)),
            ),
            NewObject { class, dst, args } => {
                let args: Vec<String> = args.iter().map(|a| reg(*a)).collect();
                line(
                    out,
                    format!("{} = new __builtin.{class}({});", reg(*dst), args.join(", ")),
                )
            }
            MapAndReadField { dst, array, field } => line(
                out,
                format!(
                    "{} = {}.map((__x) => __x[{}]);",
                    reg(*dst),
                    reg(*array),
                    string_literal(field)
                ),
            ),
            FormatEvent { hint, output_type, output, dst } => line(
                out,
                format!(
                    "{} = await __env.formatEvent({}, {}, {});",
                    reg(*dst),
                    string_literal(hint),
                    reg(*output_type),
                    reg(*output)
                ),
            ),

            BinaryOp { a, b, op, dst } => {
                line(out, format!("{} = {} {op} {};", reg(*dst), reg(*a), reg(*b)))
            }
            UnaryOp { v, op, dst } => line(out, format!("{} = {op} ({});", reg(*dst), reg(*v))),
            BinaryFunctionOp { a, b, function, dst } => line(
                out,
                format!("{} = __builtin.{function}({}, {});", reg(*dst), reg(*a), reg(*b)),
            ),
            UnaryMethodOp { object, arg, method } => {
                line(out, format!("{}.{method}({});", reg(*object), reg(*arg)))
            }
            BinaryMethodOp { object, a, b, method } => line(
                out,
                format!("{}.{method}({}, {});", reg(*object), reg(*a), reg(*b)),
            ),
            VoidFunctionOp { function, args } => {
                let args: Vec<String> = args.iter().map(|a| reg(*a)).collect();
                line(out, format!("__builtin.{function}({});", args.join(", ")))
            }
            FunctionOp { function, dst, args } => {
                let args: Vec<String> = args.iter().map(|a| reg(*a)).collect();
                line(
                    out,
                    format!("{} = __builtin.{function}({});", reg(*dst), args.join(", ")),
                )
            }

            InvokeMonitor { kind, attrs, fname, dst, args, once } => line(
                out,
                format!(
                    "{} = await __env.invokeMonitor({}, {}, {}, {}, {once});",
                    reg(*dst),
                    string_literal(kind),
                    reg(*attrs),
                    string_literal(fname),
                    reg(*args)
                ),
            ),
            InvokeTimer { dst, base, interval, frequency } => {
                let frequency = frequency
                    .map(|f| reg(f))
                    .unwrap_or_else(|| "null".to_string());
                line(
                    out,
                    format!(
                        "{} = await __env.invokeTimer({}, {}, {frequency});",
                        reg(*dst),
                        reg(*base),
                        reg(*interval)
                    ),
                )
            }
            InvokeAtTimer { dst, time_array, expiration } => {
                let expiration = expiration
                    .map(|e| reg(e))
                    .unwrap_or_else(|| "null".to_string());
                line(
                    out,
                    format!(
                        "{} = await __env.invokeAtTimer({}, {expiration});",
                        reg(*dst),
                        reg(*time_array)
                    ),
                )
            }
            InvokeQuery { kind, attrs, fname, dst, args } => line(
                out,
                format!(
                    "{} = await __env.invokeQuery({}, {}, {}, {});",
                    reg(*dst),
                    string_literal(kind),
                    reg(*attrs),
                    string_literal(fname),
                    reg(*args)
                ),
            ),
            InvokeDbQuery { kind, attrs, dst, ast_index } => line(
                out,
                format!(
                    "{} = await __env.invokeDBQuery({}, {}, __ast[{ast_index}]);",
                    reg(*dst),
                    string_literal(kind),
                    reg(*attrs)
                ),
            ),
            InvokeStreamVarRef { function, dst, args } => {
                let mut all = vec![reg(*function)];
                all.extend(args.iter().map(|a| reg(*a)));
                line(
                    out,
                    format!(
                        "{} = await __builtin.invokeStreamVarRef({});",
                        reg(*dst),
                        all.join(", ")
                    ),
                )
            }
            InvokeAction { kind, attrs, fname, args } => line(
                out,
                format!(
                    "await __env.invokeAction({}, {}, {}, {});",
                    string_literal(kind),
                    reg(*attrs),
                    string_literal(fname),
                    reg(*args)
                ),
            ),
            InvokeActionVarRef { function, args } => {
                let args: Vec<String> = args.iter().map(|a| reg(*a)).collect();
                line(out, format!("await {}({});", reg(*function), args.join(", ")))
            }
            InvokeOutput { output_type, output } => line(
                out,
                format!("await __env.output({}, {});", reg(*output_type), reg(*output)),
            ),
            InvokeReadState { dst, state_slot } => line(
                out,
                format!("{} = await __env.readState({state_slot});", reg(*dst)),
            ),
            InvokeWriteState { src, state_slot } => line(
                out,
                format!("await __env.writeState({state_slot}, {});", reg(*src)),
            ),
            InvokeReadResult { function, index, dst } => line(
                out,
                format!(
                    "{} = await __env.readResult({}, {});",
                    reg(*dst),
                    string_literal(function),
                    reg(*index)
                ),
            ),
            InvokeEmit { values } => {
                let values: Vec<String> = values.iter().map(|v| reg(*v)).collect();
                line(out, format!("await __emit({});", values.join(", ")))
            }
            EnterProcedure { id, name } => line(
                out,
                format!("await __env.enterProcedure({}, {});", reg(*id), string_literal(name)),
            ),
            ExitProcedure { id, name } => line(
                out,
                format!("await __env.exitProcedure({}, {});", reg(*id), string_literal(name)),
            ),
            SendEndOfFlow { principal, flow } => line(
                out,
                format!("await __env.sendEndOfFlow({}, {});", reg(*principal), reg(*flow)),
            ),
            ClearGetCache => line(out, "__env.clearGetCache();".to_string()),

            Break => line(out, "break;".to_string()),
            IfStatement { cond, iftrue, iffalse } => {
                line(out, format!("if ({}) {{", reg(*cond)));
                let inner = format!("{prefix}  ");
                iftrue.write_into(out, &inner);
                if iffalse.instructions.is_empty() {
                    line(out, "}".to_string());
                } else {
                    line(out, "} else {".to_string());
                    iffalse.write_into(out, &inner);
                    line(out, "}".to_string());
                }
            }
            ForOfStatement { into, iterable, body } => {
                line(out, format!("for ({} of {}) {{", reg(*into), reg(*iterable)));
                body.write_into(out, &format!("{prefix}  "));
                line(out, "}".to_string());
            }
            AsyncWhileLoop { into, iterator, body } => {
                line(out, format!("{} = await {}.next();", reg(*into), reg(*iterator)));
                line(out, format!("while (!{}.done) {{", reg(*into)));
                let inner = format!("{prefix}  ");
                body.write_into(out, &inner);
                out.push_str(&inner);
                out.push_str(&format!("{} = await {}.next();\n", reg(*into), reg(*iterator)));
                line(out, "}".to_string());
            }
            AsyncFunctionExpression { into, body } => {
                line(out, format!("{} = async function(__emit) {{", reg(*into)));
                body.write_into(out, &format!("{prefix}  "));
                line(out, "};".to_string());
            }
            ArrayFilterExpression { into, element, array, body } => {
                line(
                    out,
                    format!(
                        "{} = await __builtin.arrayFilter({}, async function({}) {{",
                        reg(*into),
                        reg(*array),
                        reg(*element)
                    ),
                );
                body.write_into(out, &format!("{prefix}  "));
                line(out, "});".to_string());
            }
            AsyncFunctionDeclaration { into, function } => {
                let mut params: Vec<String> = Vec::new();
                if function.takes_emit {
                    params.push("__emit".to_string());
                }
                params.extend((0..function.params).map(reg));
                line(
                    out,
                    format!("{} = async function({}) {{", reg(*into), params.join(", ")),
                );
                let inner = format!("{prefix}  ");
                if function.register_count > function.params {
                    let locals: Vec<String> =
                        (function.params..function.register_count).map(reg).collect();
                    out.push_str(&inner);
                    out.push_str(&format!("let {};\n", locals.join(", ")));
                }
                function.body.write_into(out, &inner);
                line(out, "};".to_string());
            }
            LabeledLoop { label, body } => {
                line(out, format!("_l_{label}: while (true) {{"));
                body.write_into(out, &format!("{prefix}  "));
                line(out, "}".to_string());
            }
            LabeledBreak { label } => line(out, format!("break _l_{label};")),
            LabeledContinue { label } => line(out, format!("continue _l_{label};")),
            ReturnValue { src } => line(out, format!("return {};", reg(*src))),
            TryCatch { message, body } => {
                line(out, "try {".to_string());
                body.write_into(out, &format!("{prefix}  "));
                line(out, "} catch(_exc_) {".to_string());
                out.push_str(prefix);
                out.push_str(&format!(
                    "  __env.reportError({}, _exc_);\n",
                    string_literal(message)
                ));
                line(out, "}".to_string());
            }
            CheckIsNewTuple { dst, state, tuple, keys } => {
                let keys: Vec<String> = keys.iter().map(|k| string_literal(k)).collect();
                line(
                    out,
                    format!(
                        "{} = __builtin.isNewTuple({}, {}, [{}]);",
                        reg(*dst),
                        reg(*state),
                        reg(*tuple),
                        keys.join(", ")
                    ),
                )
            }
            AddTupleToState { dst, state, tuple } => line(
                out,
                format!(
                    "{} = __builtin.addTuple({}, {});",
                    reg(*dst),
                    reg(*state),
                    reg(*tuple)
                ),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_codegen() {
        let mut block = Block::new();
        block.add(Instruction::LoadConstant { value: Value::Number(5.0), dst: 0 });
        block.add(Instruction::Copy { src: 0, dst: 1 });
        let mut out = String::new();
        block.write_into(&mut out, "");
        assert_eq!(out, "_t_0 = 5;\n_t_1 = _t_0;\n");
    }

    #[test]
    fn test_try_catch_reports_error() {
        let mut body = Block::new();
        body.add(Instruction::ClearGetCache);
        let instr = Instruction::TryCatch { message: "Failed to invoke query".to_string(), body };
        let mut out = String::new();
        instr.write_into(&mut out, "");
        assert!(out.contains("try {"));
        assert!(out.contains("__env.reportError(\"Failed to invoke query\", _exc_);"));
    }

    #[test]
    fn test_string_escaping() {
        let v = Value::String("say \"hi\"\n".to_string());
        assert_eq!(value_literal(&v), "\"say \\\"hi\\\"\\n\"");
    }

    #[test]
    fn test_measure_literal_normalized() {
        let v = Value::Measure { value: 2.0, unit: "km".to_string() };
        assert_eq!(value_literal(&v), "2000");
    }

    #[test]
    fn test_async_while_shape() {
        let instr = Instruction::AsyncWhileLoop { into: 2, iterator: 1, body: Block::new() };
        let mut out = String::new();
        instr.write_into(&mut out, "");
        assert!(out.starts_with("_t_2 = await _t_1.next();\nwhile (!_t_2.done) {\n"));
        assert!(out.contains("  _t_2 = await _t_1.next();\n}\n"));
    }
}
