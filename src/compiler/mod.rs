//! Single-pass compiler: source text -> [`crate::chunk::FunctionProto`].
//!
//! Ground: the teacher splits this into `compiler/parser` (external, reused
//! here as [`crate::parser`]) and `compiler/code_gen` (the AST-walking
//! emitter); this module mirrors that split, with [`state`] holding the
//! teacher's `func_state.rs`-shaped per-function bookkeeping and
//! [`codegen`] holding the actual AST walk.

mod codegen;
mod state;

use crate::chunk::FunctionProto;
use crate::gc::StringInterner;
use codegen::Codegen;
use state::FuncState;
use std::rc::Rc;

#[derive(Debug)]
pub struct CompileError {
    pub message: String,
    pub line: u32,
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.line, self.message)
    }
}

impl std::error::Error for CompileError {}

impl From<crate::parser::ParseError> for CompileError {
    fn from(e: crate::parser::ParseError) -> Self {
        CompileError { message: e.message, line: e.line }
    }
}

pub struct Compiler;

impl Compiler {
    /// Parses and compiles one source chunk, returning the top-level
    /// function prototype ready for [`crate::vm::Vm`] to call.
    ///
    /// The top-level chunk is itself a vararg function (spec §2's "a chunk
    /// is a vararg function body") with a single upvalue, `_ENV`, at index
    /// 0 — every free name in the source resolves up through nested
    /// function upvalue chains to that one binding (spec §9).
    pub fn compile(
        source: &str,
        source_name: &str,
        interner: &mut StringInterner,
    ) -> Result<FunctionProto, CompileError> {
        let block = crate::parser::parse(source)?;

        let source_rc: Rc<str> = Rc::from(source_name);
        let mut top = FuncState::new(source_rc.clone(), None);
        top.is_vararg = true;
        top.add_upvalue("_ENV", false, 0);

        let mut cg = Codegen { interner, funcs: vec![top], source_name: source_rc };
        cg.compile_block(&block)?;
        cg.funcs.last_mut().unwrap().emit_op(crate::opcode::OpCode::Return, 0);
        cg.funcs.last_mut().unwrap().emit_u8(0, 0);

        let top = cg.funcs.pop().unwrap();
        if let Some(g) = top.pending_gotos.first() {
            return Err(CompileError {
                message: format!("no visible label '{}' for goto", g.name),
                line: g.line,
            });
        }
        Ok(top.into_proto(cg.interner))
    }
}
