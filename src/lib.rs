//! A compact Lua-5-family scripting language: lexer, single-pass bytecode
//! compiler, and a stack-based virtual machine with closures, tables,
//! metatables, coroutines, and a tri-color mark-and-sweep collector.

pub mod ast;
pub mod bytecode;
pub mod chunk;
pub mod compiler;
pub mod gc;
pub mod lexer;
pub mod native;
pub mod opcode;
pub mod parser;
pub mod stdlib;
pub mod value;
pub mod vm;

pub use chunk::Chunk;
pub use compiler::Compiler;
pub use value::Value;
pub use vm::{LumaError, LumaResult, Vm, VmConfig};

/// Compile and run a script against a fresh VM with the standard library loaded.
///
/// Mirrors the one-shot `execute` helper a host embedder reaches for first.
pub fn execute(source: &str) -> LumaResult<Vec<Value>> {
    let mut vm = Vm::new(VmConfig::default());
    stdlib::open_libs(&mut vm);
    vm.run_source(source, "<script>")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_returns_last_top_level_expression_statement_effects() {
        let vm_result = execute("return 1 + 2");
        assert_eq!(vm_result.unwrap(), vec![Value::Int(3)]);
    }
}
