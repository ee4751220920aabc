//! `coroutine.*`: a thin binding over [`Vm`]'s own resume/yield mechanics
//! (`Vm::create_coroutine`/`Vm::resume`/`Vm::do_yield`) — `yield` is bound
//! straight to [`Vm::do_yield`] rather than emitting the dedicated `Yield`
//! opcode, per the VM's "yield is an ordinary native call" design.
//!
//! Ground: `stdlib/coroutine.rs` in the teacher for the function list.

use crate::native::LibraryModule;
use crate::value::Value;
use crate::vm::object::CoroutineStatus;
use crate::vm::{Vm, VmResult};

pub fn module() -> LibraryModule {
    LibraryModule::new("coroutine")
        .with_fn("create", create)
        .with_fn("resume", resume)
        .with_fn("yield", yield_)
        .with_fn("status", status)
        .with_fn("running", running)
        .with_fn("wrap", wrap)
        .with_fn("isyieldable", isyieldable)
}

fn create(vm: &mut Vm) -> VmResult<usize> {
    let f = vm.arg(1);
    let id = vm.create_coroutine(f)?;
    vm.push(Value::Coroutine(id));
    Ok(1)
}

fn resume(vm: &mut Vm) -> VmResult<usize> {
    let Value::Coroutine(id) = vm.arg(1) else {
        return Err(vm.raise("bad argument #1 to 'resume' (coroutine expected)"));
    };
    let args = vm.args();
    let rest = args.into_iter().skip(1).collect();
    match vm.resume(id, rest) {
        Ok(results) => {
            vm.push(Value::Bool(true));
            let n = results.len();
            for r in results {
                vm.push(r);
            }
            Ok(1 + n)
        }
        Err(_) => {
            let msg = std::mem::take(&mut vm.error_message);
            let msg_id = vm.intern(&msg);
            vm.push(Value::Bool(false));
            vm.push(Value::Str(msg_id));
            Ok(2)
        }
    }
}

fn yield_(vm: &mut Vm) -> VmResult<usize> {
    vm.do_yield()
}

fn status(vm: &mut Vm) -> VmResult<usize> {
    let Value::Coroutine(id) = vm.arg(1) else {
        return Err(vm.raise("bad argument #1 to 'status' (coroutine expected)"));
    };
    let name = match vm.coroutine_status(id) {
        CoroutineStatus::Suspended => "suspended",
        CoroutineStatus::Running => "running",
        CoroutineStatus::Normal => "normal",
        CoroutineStatus::Dead => "dead",
    };
    let s = vm.intern(name);
    vm.push(Value::Str(s));
    Ok(1)
}

fn running(vm: &mut Vm) -> VmResult<usize> {
    match vm.running_coroutine() {
        Some(id) => {
            vm.push(Value::Coroutine(id));
            vm.push(Value::Bool(false));
        }
        None => {
            vm.push(Value::Nil);
            vm.push(Value::Bool(true));
        }
    }
    Ok(2)
}

fn isyieldable(vm: &mut Vm) -> VmResult<usize> {
    vm.push(Value::Bool(vm.running_coroutine().is_some()));
    Ok(1)
}

/// `wrap(f)`: there is no `__call` metamethod dispatch in this VM (every
/// callee opcode only knows `Closure`/`Native`), so a table-plus-trampoline
/// trick can't stand in for a real function. Instead this compiles a small
/// glue chunk — `local co = ...; return function(...) ... end` — and runs it
/// once through [`Vm::call_proto`] with the fresh coroutine as its sole
/// vararg argument; the chunk's own `return` hands back a genuine
/// `Value::Closure` over that coroutine, which is directly callable with no
/// VM changes. Mirrors the teacher's original `lib_registry.rs` note that
/// `coroutine.wrap` used to be "a Lua override" before it moved to Rust.
const WRAP_GLUE: &str = r#"
local co = ...
return function(...)
    local results = { coroutine.resume(co, ...) }
    if not results[1] then
        error(results[2])
    end
    return table.unpack(results, 2)
end
"#;

fn wrap(vm: &mut Vm) -> VmResult<usize> {
    let f = vm.arg(1);
    let co = vm.create_coroutine(f)?;
    let proto = crate::compiler::Compiler::compile(WRAP_GLUE, "=coroutine.wrap", vm.strings_mut())
        .map_err(|e| vm.raise(format!("coroutine.wrap: {e}")))?;
    let results = vm
        .call_proto(std::rc::Rc::new(proto), vec![Value::Coroutine(co)])
        .map_err(|e| vm.raise(e.message))?;
    vm.push(results.into_iter().next().unwrap_or(Value::Nil));
    Ok(1)
}
