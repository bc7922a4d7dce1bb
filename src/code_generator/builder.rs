//! # IR Builder
//!
//! Owns the block stack during compilation. Control-flow instructions are
//! opened as frames (`push_*`), filled by subsequent `add` calls, and
//! sealed by `pop_block`, which folds the finished block into the
//! enclosing one. `save_stack_state`/`pop_to` unwind whole pyramids of
//! loops and try/catches in one go, which is how the compiler returns
//! from the innermost per-tuple position back to a statement boundary.

use super::instr::{Block, InnerFunction, Instruction, Register};

/// An open control-flow frame waiting for its body to finish.
#[derive(Debug)]
enum Frame {
    If { cond: Register },
    Else { cond: Register, iftrue: Block },
    ForOf { into: Register, iterable: Register },
    AsyncWhile { into: Register, iterator: Register },
    AsyncFunction { into: Register },
    ArrayFilter { into: Register, element: Register, array: Register },
    TryCatch { message: String },
    LabeledLoop { label: usize },
}

#[derive(Debug)]
struct OpenBlock {
    frame: Frame,
    block: Block,
}

/// Builds one register function.
#[derive(Debug, Default)]
pub struct IrBuilder {
    next_register: usize,
    next_label: usize,
    n_args: usize,
    root: Block,
    stack: Vec<OpenBlock>,
}

impl IrBuilder {
    pub fn new() -> Self {
        IrBuilder::default()
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    pub fn alloc_register(&mut self) -> Register {
        let r = self.next_register;
        self.next_register += 1;
        r
    }

    /// Arguments must be allocated before any plain register.
    pub fn alloc_argument(&mut self) -> Register {
        debug_assert_eq!(
            self.next_register, self.n_args,
            "arguments must be allocated first"
        );
        let r = self.alloc_register();
        self.n_args = self.next_register;
        r
    }

    pub fn alloc_label(&mut self) -> usize {
        let l = self.next_label;
        self.next_label += 1;
        l
    }

    // ------------------------------------------------------------------
    // Emission
    // ------------------------------------------------------------------

    fn top(&mut self) -> &mut Block {
        match self.stack.last_mut() {
            Some(open) => &mut open.block,
            None => &mut self.root,
        }
    }

    pub fn add(&mut self, instruction: Instruction) {
        self.top().add(instruction);
    }

    // ------------------------------------------------------------------
    // Block stack
    // ------------------------------------------------------------------

    pub fn push_if(&mut self, cond: Register) -> usize {
        self.push_frame(Frame::If { cond })
    }

    /// Close the then-branch and start the else-branch of the innermost
    /// open `if`.
    pub fn enter_else(&mut self) {
        let open = self.stack.pop();
        match open {
            Some(OpenBlock { frame: Frame::If { cond }, block }) => {
                self.stack.push(OpenBlock {
                    frame: Frame::Else { cond, iftrue: block },
                    block: Block::new(),
                });
            }
            Some(other) => {
                // not an if: put it back untouched
                self.stack.push(other);
            }
            None => {}
        }
    }

    pub fn push_for_of(&mut self, into: Register, iterable: Register) -> usize {
        self.push_frame(Frame::ForOf { into, iterable })
    }

    pub fn push_async_while(&mut self, into: Register, iterator: Register) -> usize {
        self.push_frame(Frame::AsyncWhile { into, iterator })
    }

    pub fn push_async_function(&mut self, into: Register) -> usize {
        self.push_frame(Frame::AsyncFunction { into })
    }

    pub fn push_array_filter(
        &mut self,
        into: Register,
        element: Register,
        array: Register,
    ) -> usize {
        self.push_frame(Frame::ArrayFilter { into, element, array })
    }

    pub fn push_try_catch(&mut self, message: impl Into<String>) -> usize {
        self.push_frame(Frame::TryCatch { message: message.into() })
    }

    pub fn push_labeled_loop(&mut self, label: usize) -> usize {
        self.push_frame(Frame::LabeledLoop { label })
    }

    fn push_frame(&mut self, frame: Frame) -> usize {
        self.stack.push(OpenBlock { frame, block: Block::new() });
        self.stack.len()
    }

    /// Seal the innermost open frame into its instruction.
    pub fn pop_block(&mut self) {
        let Some(OpenBlock { frame, block }) = self.stack.pop() else {
            return;
        };
        let instruction = match frame {
            Frame::If { cond } => Instruction::IfStatement {
                cond,
                iftrue: block,
                iffalse: Block::new(),
            },
            Frame::Else { cond, iftrue } => Instruction::IfStatement {
                cond,
                iftrue,
                iffalse: block,
            },
            Frame::ForOf { into, iterable } => {
                Instruction::ForOfStatement { into, iterable, body: block }
            }
            Frame::AsyncWhile { into, iterator } => {
                Instruction::AsyncWhileLoop { into, iterator, body: block }
            }
            Frame::AsyncFunction { into } => {
                Instruction::AsyncFunctionExpression { into, body: block }
            }
            Frame::ArrayFilter { into, element, array } => {
                Instruction::ArrayFilterExpression { into, element, array, body: block }
            }
            Frame::TryCatch { message } => Instruction::TryCatch { message, body: block },
            Frame::LabeledLoop { label } => Instruction::LabeledLoop { label, body: block },
        };
        self.add(instruction);
    }

    /// Current stack depth, for later unwinding with [`Self::pop_to`].
    pub fn save_stack_state(&self) -> usize {
        self.stack.len()
    }

    pub fn pop_to(&mut self, depth: usize) {
        while self.stack.len() > depth {
            self.pop_block();
        }
    }

    pub fn pop_all(&mut self) {
        self.pop_to(0);
    }

    // ------------------------------------------------------------------
    // Serialization
    // ------------------------------------------------------------------

    /// Serialize the body: register declarations, then the root block.
    /// `prefix` is prepended to every line.
    pub fn codegen(&self, prefix: &str) -> String {
        debug_assert!(self.stack.is_empty(), "codegen with open blocks");
        let mut out = String::new();
        if self.next_register > self.n_args {
            let locals: Vec<String> = (self.n_args..self.next_register)
                .map(|r| format!("_t_{r}"))
                .collect();
            out.push_str(prefix);
            out.push_str(&format!("let {};\n", locals.join(", ")));
        }
        self.root.write_into(&mut out, prefix);
        out
    }

    /// Serialize as a complete async function over the runtime surface:
    /// `(__builtin, __scope, __ast, __env, ...args)`.
    pub fn codegen_function(&self, prefix: &str) -> String {
        let mut header: Vec<String> = vec![
            "__builtin".to_string(),
            "__scope".to_string(),
            "__ast".to_string(),
            "__env".to_string(),
        ];
        header.extend((0..self.n_args).map(|r| format!("_t_{r}")));
        let mut out = String::new();
        out.push_str(prefix);
        out.push_str(&format!("async function({}) {{\n", header.join(", ")));
        out.push_str(&self.codegen(&format!("{prefix}  ")));
        out.push_str(prefix);
        out.push_str("}\n");
        out
    }

    /// Finish this builder as a nested function body (used for
    /// declarations compiled inside an enclosing rule). `takes_emit`
    /// marks stream/table declarations, which receive the `__emit`
    /// callback ahead of their own parameters.
    pub fn into_inner_function(mut self, takes_emit: bool) -> InnerFunction {
        self.pop_all();
        InnerFunction {
            params: self.n_args,
            register_count: self.next_register,
            takes_emit,
            body: self.root,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn test_registers_declared_up_front() {
        let mut b = IrBuilder::new();
        let r = b.alloc_register();
        b.add(Instruction::LoadConstant { value: Value::Boolean(true), dst: r });
        let code = b.codegen("");
        assert!(code.starts_with("let _t_0;\n"));
        assert!(code.contains("_t_0 = true;"));
    }

    #[test]
    fn test_arguments_become_parameters() {
        let mut b = IrBuilder::new();
        let arg = b.alloc_argument();
        let local = b.alloc_register();
        b.add(Instruction::Copy { src: arg, dst: local });
        let code = b.codegen_function("");
        assert!(code.contains("async function(__builtin, __scope, __ast, __env, _t_0)"));
        assert!(code.contains("let _t_1;"));
    }

    #[test]
    fn test_pop_to_unwinds_nested_frames() {
        let mut b = IrBuilder::new();
        let cond = b.alloc_register();
        let depth = b.save_stack_state();
        b.push_try_catch("Failed to invoke query");
        b.push_if(cond);
        b.add(Instruction::Break);
        b.pop_to(depth);
        assert_eq!(b.save_stack_state(), 0);

        let code = b.codegen("");
        assert!(code.contains("try {"));
        assert!(code.contains("if (_t_0) {"));
    }

    #[test]
    fn test_if_else() {
        let mut b = IrBuilder::new();
        let cond = b.alloc_register();
        b.push_if(cond);
        b.add(Instruction::Break);
        b.enter_else();
        b.add(Instruction::ClearGetCache);
        b.pop_block();
        let code = b.codegen("");
        assert!(code.contains("} else {"));
        assert!(code.contains("__env.clearGetCache();"));
    }
}
