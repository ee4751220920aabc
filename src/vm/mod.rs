//! The stack-based virtual machine: per-coroutine value/frame stacks, the
//! opcode dispatch loop, call/return/tail-call mechanics, coroutine
//! resume/yield, and the heap (string interner + per-kind object pools +
//! tri-color collector).
//!
//! Ground: the teacher's `lua_vm/lua_state.rs` + `lua_vm/execute/call.rs`
//! "push a frame, let the outer loop step it — never recurse for an
//! ordinary Lua call" design. This crate is stack-based rather than
//! register-based, but keeps that same non-recursive frame-stack loop: a
//! `Coroutine` owns an explicit `Vec<CallFrame>`, and `Call`/`Return`/
//! `TailCall` only push/pop/replace entries in it, so neither deep Lua
//! recursion nor a long tail-call chain ever grows the Rust stack.
//!
//! A native function that calls back into Lua (`pcall`, a metamethod
//! callback, `coroutine.resume` over a closure) is the one place genuine
//! Rust recursion happens, bounded by native-call nesting rather than Lua
//! call depth (see [`Vm::call_value`] / [`Vm::run_until`]).

mod dispatch;
mod gc_trace;
pub mod object;
mod ops;

use crate::chunk::FunctionProto;
use crate::compiler::Compiler;
use crate::gc::{Gc, ObjectPool, StringInterner};
use crate::value::{ClosureId, CoroutineId, NativeFn, StringId, TableId, UpvalueId, UserdataId, Value};
use object::{CallFrame, Closure, Coroutine, CoroutineStatus, Table, Upvalue, Userdata};
use std::rc::Rc;

pub use crate::opcode::ALL_RESULTS;

/// Lightweight error tag, `Copy` and one byte (ground: `lua_vm/lua_error.rs`).
/// The human-readable message lives on [`Vm::error_message`] until a caller
/// promotes it into a [`VmFatal`] at an API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LumaError {
    Runtime,
    Compile,
    Yield,
    StackOverflow,
    OutOfMemory,
    CoroutineProtocolViolation,
}

impl std::fmt::Display for LumaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LumaError::Runtime => "runtime error",
            LumaError::Compile => "compile error",
            LumaError::Yield => "yield",
            LumaError::StackOverflow => "stack overflow",
            LumaError::OutOfMemory => "out of memory",
            LumaError::CoroutineProtocolViolation => "coroutine protocol violation",
        };
        write!(f, "{s}")
    }
}

impl std::error::Error for LumaError {}

/// Cheap internal result alias — also the return type of every
/// [`NativeFn`], so a host binding never pays for a heap-allocated message
/// on its hot success path.
pub type VmResult<T> = Result<T, LumaError>;

/// Rich error delivered across the public API boundary: kind plus message.
#[derive(Debug, Clone)]
pub struct VmFatal {
    pub kind: LumaError,
    pub message: String,
}

impl std::fmt::Display for VmFatal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for VmFatal {}

pub type LumaResult<T> = Result<T, VmFatal>;

/// VM tuning knobs, mirroring the teacher's plain-constant `lua_limits.rs`
/// rather than an external config-file crate.
#[derive(Debug, Clone, Copy)]
pub struct VmConfig {
    pub initial_gc_threshold: usize,
    pub gc_growth_factor: usize,
    pub max_stack_size: usize,
    pub max_call_depth: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            initial_gc_threshold: 1 << 20,
            gc_growth_factor: 2,
            max_stack_size: 1_000_000,
            max_call_depth: 220,
        }
    }
}

/// Index into [`Vm::type_metatables`] for value kinds that can carry a
/// *type-level* metatable (tables and userdata carry their own instead).
fn type_meta_slot(v: &Value) -> Option<usize> {
    match v {
        Value::Nil => Some(0),
        Value::Bool(_) => Some(1),
        Value::Int(_) | Value::Float(_) => Some(2),
        Value::Str(_) => Some(3),
        Value::Closure(_) | Value::Native(_) => Some(4),
        Value::Coroutine(_) => Some(5),
        Value::Table(_) | Value::Userdata(_) => None,
    }
}

const N_TYPE_META: usize = 6;

/// One pending native-function activation: the stack window its args live
/// in. Saved/restored around nested native calls (`vm.call_value` invoked
/// from inside a native, e.g. `pcall`) so `Vm::arg`/`Vm::arg_count` always
/// read the innermost call's window.
struct NativeFrame {
    base: usize,
    nargs: usize,
}

pub struct Vm {
    pub(crate) strings: StringInterner,
    pub(crate) tables: ObjectPool<Table>,
    pub(crate) closures: ObjectPool<Closure>,
    pub(crate) coroutines: ObjectPool<Coroutine>,
    pub(crate) upvalues: ObjectPool<Upvalue>,
    pub(crate) userdata: ObjectPool<Userdata>,
    pub(crate) gc: Gc,
    pub(crate) globals: TableId,
    type_metatables: [Option<TableId>; N_TYPE_META],
    main_coroutine: CoroutineId,
    pub(crate) current: CoroutineId,
    pub config: VmConfig,
    pub(crate) error_message: String,
    /// Number of values the most recent multi-result instruction actually
    /// produced (spec §4.3's `lastResultCount`). Read by `CallMulti`,
    /// `ReturnMulti`, `PushVararg(ALL_RESULTS)`, and `SetList`.
    pub(crate) last_result_count: usize,
    native_frames: Vec<NativeFrame>,
    rng_state: u64,
}

impl Vm {
    pub fn new(config: VmConfig) -> Self {
        let mut tables = ObjectPool::new();
        let globals = TableId(tables.insert(Table::new()));
        let mut coroutines = ObjectPool::new();
        let main = CoroutineId(coroutines.insert(Coroutine::new()));
        if let Some(c) = coroutines.get_mut(main.0) {
            c.status = CoroutineStatus::Running;
        }
        Vm {
            strings: StringInterner::new(),
            tables,
            closures: ObjectPool::new(),
            coroutines,
            upvalues: ObjectPool::new(),
            userdata: ObjectPool::new(),
            gc: Gc::new(config.initial_gc_threshold, config.gc_growth_factor),
            globals,
            type_metatables: [None; N_TYPE_META],
            main_coroutine: main,
            current: main,
            config,
            error_message: String::new(),
            last_result_count: 0,
            native_frames: Vec::new(),
            rng_state: 0x2545F4914F6CDD1D,
        }
    }

    pub fn with_config(config: VmConfig) -> Self {
        Self::new(config)
    }

    pub fn globals(&self) -> TableId {
        self.globals
    }

    pub fn intern(&mut self, s: &str) -> StringId {
        StringId(self.strings.intern(s))
    }

    pub fn str_value(&self, id: StringId) -> &str {
        self.strings.get(id.0)
    }

    /// Exposed so a host embedder can hand the same interner to
    /// [`crate::compiler::Compiler::compile`] or [`crate::bytecode`] without
    /// going through a full `run_source` call — the CLI's `-c`/`-b` paths
    /// both need this.
    pub fn strings_mut(&mut self) -> &mut StringInterner {
        &mut self.strings
    }

    // ---- error helpers ----

    /// Records `message` and returns the cheap tag a [`NativeFn`] propagates
    /// with `?` — the teacher's `LuaState::error` split between message
    /// storage and the `LuaError` marker (`lua_vm/lua_state.rs`).
    pub fn raise(&mut self, message: impl Into<String>) -> LumaError {
        self.error_message = message.into();
        LumaError::Runtime
    }

    pub fn into_full_error(&self, kind: LumaError) -> VmFatal {
        VmFatal { kind, message: self.error_message.clone() }
    }

    // ---- heap constructors ----

    pub fn new_table(&mut self) -> TableId {
        self.gc.note_alloc(64);
        TableId(self.tables.insert(Table::new()))
    }

    pub fn table(&self, id: TableId) -> &Table {
        self.tables.get(id.0).expect("dangling TableId")
    }

    pub fn table_mut(&mut self, id: TableId) -> &mut Table {
        self.tables.get_mut(id.0).expect("dangling TableId")
    }

    pub fn get_metatable(&self, v: &Value) -> Option<TableId> {
        match v {
            Value::Table(t) => self.table(*t).metatable,
            Value::Userdata(u) => self.userdata.get(u.0).and_then(|ud| ud.metatable),
            other => type_meta_slot(other).and_then(|i| self.type_metatables[i]),
        }
    }

    pub fn set_metatable(&mut self, v: &Value, mt: Option<TableId>) {
        match v {
            Value::Table(t) => self.table_mut(*t).metatable = mt,
            Value::Userdata(u) => {
                if let Some(ud) = self.userdata.get_mut(u.0) {
                    ud.metatable = mt;
                }
            }
            other => {
                if let Some(i) = type_meta_slot(other) {
                    self.type_metatables[i] = mt;
                }
            }
        }
    }

    pub fn metamethod(&mut self, v: &Value, name: &str) -> Option<Value> {
        let mt = self.get_metatable(v)?;
        let id = self.intern(name);
        let val = self.table(mt).get(&Value::Str(id));
        if val.is_nil() {
            None
        } else {
            Some(val)
        }
    }

    // ---- native-call argument/result protocol ----

    pub fn arg_count(&self) -> usize {
        self.native_frames.last().map(|f| f.nargs).unwrap_or(0)
    }

    /// 1-indexed, `Nil` past the end (matches Lua's "missing args are nil").
    pub fn arg(&self, i: usize) -> Value {
        let Some(frame) = self.native_frames.last() else { return Value::Nil };
        if i == 0 || i > frame.nargs {
            return Value::Nil;
        }
        let stack = &self.coroutines.get(self.current.0).unwrap().stack;
        stack[frame.base + i - 1]
    }

    pub fn args(&self) -> Vec<Value> {
        (1..=self.arg_count()).map(|i| self.arg(i)).collect()
    }

    pub fn push(&mut self, v: Value) {
        self.coroutine_mut(self.current).stack.push(v);
    }

    fn coroutine_mut(&mut self, id: CoroutineId) -> &mut Coroutine {
        self.coroutines.get_mut(id.0).expect("dangling CoroutineId")
    }

    fn coroutine(&self, id: CoroutineId) -> &Coroutine {
        self.coroutines.get(id.0).expect("dangling CoroutineId")
    }

    // ---- compiling & running a chunk ----

    pub fn run_source(&mut self, source: &str, source_name: &str) -> LumaResult<Vec<Value>> {
        let proto = Compiler::compile(source, source_name, &mut self.strings)
            .map_err(|e| VmFatal { kind: LumaError::Compile, message: format!("{source_name}:{e}") })?;
        self.call_proto(Rc::new(proto), Vec::new())
    }

    /// Runs a top-level function prototype to completion on the main
    /// coroutine, returning every value its outermost `return` produced.
    ///
    /// Every top-level chunk declares exactly one upvalue, `_ENV`
    /// ([`Compiler::compile`]), closed here over the VM's globals table.
    pub fn call_proto(&mut self, proto: Rc<FunctionProto>, args: Vec<Value>) -> LumaResult<Vec<Value>> {
        let env = self.upvalues.insert(Upvalue::Closed(Value::Table(self.globals)));
        let closure = Value::Closure(ClosureId(self.closures.insert(Closure {
            proto,
            upvalues: vec![UpvalueId(env)],
        })));
        self.call_value(closure, &args)
            .map_err(|kind| self.into_full_error(kind))
    }

    /// General-purpose "call this value with these args and run it to
    /// completion" helper, used both by the public API and by natives that
    /// call back into Lua (`pcall`, `coroutine.wrap`, sort comparators,
    /// `__index` function metamethods). For a closure callee this performs
    /// bounded Rust recursion via [`Self::run_until`] — the frame-stack
    /// loop itself never recurses for ordinary Lua-to-Lua calls.
    pub(crate) fn call_value(&mut self, func: Value, args: &[Value]) -> VmResult<Vec<Value>> {
        let base = self.coroutine(self.current).stack.len();
        for a in args {
            self.push(*a);
        }
        match func {
            Value::Native(nf) => {
                self.native_frames.push(NativeFrame { base, nargs: args.len() });
                let pushed = nf(self);
                self.native_frames.pop();
                let pushed = pushed?;
                let co = self.coroutine_mut(self.current);
                let results = co.stack.split_off(co.stack.len() - pushed);
                co.stack.truncate(base);
                Ok(results)
            }
            Value::Closure(cid) => {
                let depth_before = self.coroutine(self.current).frames.len();
                self.push_closure_frame(cid, base, args.len(), ALL_RESULTS, base)?;
                self.run_until(depth_before)?;
                let co = self.coroutine_mut(self.current);
                let results = co.stack.split_off(base);
                Ok(results)
            }
            other => {
                let tn = other.type_name();
                Err(self.raise(format!("attempt to call a {tn} value")))
            }
        }
    }

    /// Pushes a call frame for `closure` whose arguments are already sitting
    /// on the current coroutine's stack at `[base, base+nargs)`. Matches
    /// spec §4.3's call protocol: pad/truncate fixed-arity args, or stash
    /// the overflow as a vararg area.
    pub(crate) fn push_closure_frame(
        &mut self,
        cid: ClosureId,
        base: usize,
        nargs: usize,
        want: u8,
        result_base: usize,
    ) -> VmResult<()> {
        let co_id = self.current;
        if self.coroutine(co_id).frames.len() >= self.config.max_call_depth {
            return Err(self.raise("stack overflow"));
        }
        let closure = self.closures.get(cid.0).expect("dangling ClosureId");
        let proto = closure.proto.clone();
        let arity = proto.arity as usize;
        let is_vararg = proto.is_vararg;
        let num_slots = proto.num_slots as usize;
        let co = self.coroutine_mut(co_id);

        // A vararg call with overflow args relocates the extras to sit
        // *below* the named parameters, so the declared local slots always
        // start fresh at a frame base the overflow never collides with.
        let (frame_base, vararg_base, vararg_count) = if is_vararg && nargs > arity {
            let mut args = co.stack.split_off(base);
            let extra = args.split_off(arity);
            let extra_count = extra.len();
            co.stack.extend(extra);
            co.stack.extend(args);
            (base + extra_count, base, extra_count)
        } else {
            if nargs < arity {
                co.stack.resize(base + arity, Value::Nil);
            } else if nargs > arity {
                co.stack.truncate(base + arity);
            }
            (base, base, 0)
        };

        let have = co.stack.len() - frame_base;
        if have < num_slots {
            co.stack.resize(frame_base + num_slots, Value::Nil);
        }
        co.frames.push(CallFrame {
            closure: cid,
            base: frame_base,
            pc: 0,
            vararg_base,
            vararg_count,
            want,
            result_base,
        });
        Ok(())
    }

    /// Writes `results` into the current coroutine's stack starting at
    /// `base`, padding with nil or truncating to `want` results
    /// (`ALL_RESULTS` keeps every one), truncating the stack to exactly
    /// that window first. Spec §4.3's "rewind to stackBase, then pad or
    /// truncate to what the caller asked for" — shared by `Return`/
    /// `ReturnMulti`, a native callee's results, and `yield` resumption.
    pub(crate) fn finish_return(&mut self, base: usize, mut results: Vec<Value>, want: u8) {
        self.last_result_count = results.len();
        if want != ALL_RESULTS {
            results.resize(want as usize, Value::Nil);
        }
        let co = self.coroutine_mut(self.current);
        co.stack.truncate(base);
        co.stack.extend(results);
    }

    /// The top-level driver: steps the dispatch loop until the current
    /// coroutine's frame stack empties (the call returned) or it suspends
    /// via `yield`.
    fn drive(&mut self) -> VmResult<()> {
        loop {
            if self.coroutine(self.current).frames.is_empty() {
                return Ok(());
            }
            if self.coroutine(self.current).status != CoroutineStatus::Running {
                return Ok(());
            }
            self.step()?;
        }
    }

    /// Runs the dispatch loop until the current coroutine's frame count
    /// returns to `depth` (a closure call issued from native code
    /// completing) or the coroutine suspends. Suspending above `depth`
    /// while nested inside a native call is a protocol violation: real Lua
    /// calls this "attempt to yield across a C-call boundary", and this VM
    /// keeps that same restriction rather than implementing continuations.
    fn run_until(&mut self, depth: usize) -> VmResult<()> {
        loop {
            if self.coroutine(self.current).frames.len() <= depth {
                return Ok(());
            }
            if self.coroutine(self.current).status != CoroutineStatus::Running {
                return Err(self.raise("attempt to yield across a C-call boundary"));
            }
            self.step()?;
        }
    }

    // ---- coroutines ----

    pub fn create_coroutine(&mut self, closure: Value) -> VmResult<CoroutineId> {
        let Value::Closure(_) = closure else {
            return Err(self.raise("coroutine.create expects a function"));
        };
        let mut co = Coroutine::new();
        co.stack.push(closure);
        let id = CoroutineId(self.coroutines.insert(co));
        Ok(id)
    }

    pub fn coroutine_status(&self, id: CoroutineId) -> CoroutineStatus {
        self.coroutine(id).status
    }

    pub fn running_coroutine(&self) -> Option<CoroutineId> {
        if self.current == self.main_coroutine {
            None
        } else {
            Some(self.current)
        }
    }

    pub fn is_main(&self, id: CoroutineId) -> bool {
        id == self.main_coroutine
    }

    /// `resume(co, args...)`: per spec §4.4, either starts `co`'s root
    /// closure or reactivates it past its last `yield`, running until it
    /// yields, returns, or errors.
    pub fn resume(&mut self, id: CoroutineId, args: Vec<Value>) -> VmResult<Vec<Value>> {
        {
            let co = self.coroutine(id);
            match co.status {
                CoroutineStatus::Dead => return Err(self.raise("cannot resume dead coroutine")),
                CoroutineStatus::Running | CoroutineStatus::Normal => {
                    return Err(self.raise("cannot resume non-suspended coroutine"))
                }
                CoroutineStatus::Suspended => {}
            }
        }
        let caller = self.current;
        self.coroutine_mut(caller).status = CoroutineStatus::Normal;
        self.coroutine_mut(id).caller = Some(caller);
        self.coroutine_mut(id).status = CoroutineStatus::Running;
        self.current = id;

        let starting = self.coroutine(id).frames.is_empty();
        let run = if starting {
            let callee = self.coroutine(id).stack[0];
            let Value::Closure(cid) = callee else {
                unreachable!("create_coroutine only stores closures")
            };
            self.coroutine_mut(id).stack.clear();
            for a in &args {
                self.push(*a);
            }
            self.push_closure_frame(cid, 0, args.len(), ALL_RESULTS, 0)
                .and_then(|_| self.drive())
        } else {
            let want = self.coroutine(id).yield_want;
            let base = self.coroutine(id).yield_base;
            self.finish_return(base, args, want);
            self.drive()
        };

        self.current = caller;
        self.coroutine_mut(caller).status = CoroutineStatus::Running;

        if let Err(e) = run {
            self.coroutine_mut(id).status = CoroutineStatus::Dead;
            return Err(e);
        }

        // A yield can leave the frame stack empty too (a tail call replacing
        // the last frame with a native callee that then yields pops that
        // frame without pushing a new one), so completion is decided by
        // status, not by whether any frames remain.
        let co = self.coroutine_mut(id);
        if co.status == CoroutineStatus::Suspended {
            Ok(std::mem::take(&mut co.yielded_values))
        } else {
            co.status = CoroutineStatus::Dead;
            Ok(std::mem::take(&mut co.stack))
        }
    }

    /// `coroutine.yield(...)`: called from the `coroutine` stdlib's native
    /// binding, never from a dedicated opcode — it suspends the *current*
    /// native call the same way any other native-callee call site pauses
    /// (see `vm::dispatch::invoke_native`), which is what lets a yield
    /// nested arbitrarily deep in ordinary Lua calls still work without a
    /// continuation mechanism.
    pub(crate) fn do_yield(&mut self) -> VmResult<usize> {
        if self.is_main(self.current) {
            return Err(self.raise("attempt to yield from outside a coroutine"));
        }
        let values = self.args();
        let id = self.current;
        self.coroutine_mut(id).yielded_values = values;
        self.coroutine_mut(id).status = CoroutineStatus::Suspended;
        Ok(0)
    }

    // ---- GC ----

    pub fn collect_garbage(&mut self) {
        gc_trace::collect(self);
    }

    pub fn maybe_collect(&mut self) {
        if self.gc.should_collect() {
            self.collect_garbage();
        }
    }

    pub fn next_random(&mut self) -> u64 {
        // xorshift64*, matching the teacher's instance-owned RNG note
        // (spec §9: "make the RNG an instance field of the VM").
        let mut x = self.rng_state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng_state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    pub fn seed_random(&mut self, seed: u64) {
        self.rng_state = seed | 1;
    }

    pub fn native_fn_name(&self, f: NativeFn) -> String {
        format!("{:p}", f as usize as *const ())
    }

    pub(crate) fn userdata_get(&self, id: UserdataId) -> Option<&Userdata> {
        self.userdata.get(id.0)
    }
}
