//! Runtime heap object shapes: tables, closures, upvalues, coroutines, and
//! the per-call bookkeeping record (spec §3's TableObject/ClosureObject/
//! UpvalueObject/CoroutineObject/CallFrame).
//!
//! Ground: the teacher keeps these as NaN-boxed union payloads reached
//! through `GcId`s into `gc/gc_object.rs`'s pools. This crate already
//! traded the union for a plain enum in [`crate::value`]; these types are
//! the plain-Rust-struct payloads those ids point at.

use crate::chunk::FunctionProto;
use crate::value::{ClosureId, CoroutineId, TableId, Value, ValueKey};
use ahash::AHashMap;
use std::rc::Rc;

/// An associative mapping from non-nil values to non-nil values, plus an
/// optional metatable. Array part (dense 1-based integer keys) is split
/// from the hash part purely as a performance convenience for `ipairs`/
/// `#`/`table.insert`; spec §3 only requires the externally observable
/// "non-nil -> non-nil, delete on nil" mapping.
#[derive(Default)]
pub struct Table {
    pub array: Vec<Value>,
    pub hash: AHashMap<ValueKey, Value>,
    pub metatable: Option<TableId>,
}

impl Table {
    pub fn new() -> Self {
        Table::default()
    }

    fn array_index(key: &Value) -> Option<usize> {
        match key {
            Value::Int(i) if *i >= 1 => Some(*i as usize - 1),
            Value::Float(f) if f.fract() == 0.0 && *f >= 1.0 => Some(*f as usize - 1),
            _ => None,
        }
    }

    pub fn get(&self, key: &Value) -> Value {
        let key = key.canonicalize();
        if let Some(idx) = Self::array_index(&key) {
            if idx < self.array.len() {
                return self.array[idx];
            }
        }
        self.hash.get(&ValueKey(key)).copied().unwrap_or(Value::Nil)
    }

    /// `t[key] = value`; `value == Nil` deletes. Caller is responsible for
    /// rejecting a nil or NaN key before calling (spec §3: "setting a key
    /// to nil deletes it"; NaN keys are never valid).
    pub fn set(&mut self, key: Value, value: Value) {
        let key = key.canonicalize();
        if let Some(idx) = Self::array_index(&key) {
            if idx < self.array.len() {
                self.array[idx] = value;
                if value.is_nil() && idx == self.array.len() - 1 {
                    while matches!(self.array.last(), Some(Value::Nil)) {
                        self.array.pop();
                    }
                }
                return;
            }
            if idx == self.array.len() && !value.is_nil() {
                self.array.push(value);
                // absorb any contiguous hash-part successors into the array
                let mut next = self.array.len() as i64 + 1;
                while let Some(v) = self.hash.remove(&ValueKey(Value::Int(next))) {
                    self.array.push(v);
                    next += 1;
                }
                return;
            }
        }
        if value.is_nil() {
            self.hash.remove(&ValueKey(key));
        } else {
            self.hash.insert(ValueKey(key), value);
        }
    }

    /// Border length per spec §3: largest `n` such that keys `1..=n` are
    /// all non-nil. With no holes this is just the array length.
    pub fn length(&self) -> i64 {
        let mut n = self.array.len();
        while n > 0 && matches!(self.array[n - 1], Value::Nil) {
            n -= 1;
        }
        if n == self.array.len() {
            let mut probe = n as i64 + 1;
            while self.hash.contains_key(&ValueKey(Value::Int(probe))) {
                probe += 1;
            }
            return probe - 1;
        }
        n as i64
    }
}

/// Two-state upvalue cell (spec §3): `Open` aliases a slot on some
/// coroutine's value stack so writes through either the original local or
/// a capturing closure stay in sync; `Closed` owns its value once the
/// local's scope ends.
pub enum Upvalue {
    Open { coroutine: CoroutineId, slot: usize },
    Closed(Value),
}

pub struct Closure {
    pub proto: Rc<FunctionProto>,
    pub upvalues: Vec<crate::value::UpvalueId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineStatus {
    Suspended,
    Running,
    Normal,
    Dead,
}

/// One activation record (spec §3's CallFrame): which closure, where its
/// locals/varargs begin on the coroutine's value stack, and how many
/// results its caller wants back.
pub struct CallFrame {
    pub closure: ClosureId,
    pub base: usize,
    pub pc: usize,
    pub vararg_base: usize,
    pub vararg_count: usize,
    pub want: u8,
    /// Where this call's results get written on return. Equal to `base`
    /// when there was no callee slot to drop (a Rust-initiated call via
    /// [`super::Vm::call_proto`]/[`super::Vm::resume`]), or `base - 1` for
    /// an ordinary bytecode `Call`, which also removes the callee value.
    pub result_base: usize,
}

/// A complete, independently steppable execution context (spec §3's
/// CoroutineObject). The main coroutine is just the first one the VM ever
/// creates; nothing distinguishes it structurally.
pub struct Coroutine {
    pub stack: Vec<Value>,
    pub frames: Vec<CallFrame>,
    pub status: CoroutineStatus,
    pub caller: Option<CoroutineId>,
    /// Open upvalues for this coroutine's stack, kept ordered by `slot`
    /// (spec §3 invariant) so `close_upvalues_above` can stop at the first
    /// one below the threshold.
    pub open_upvalues: Vec<crate::value::UpvalueId>,
    /// Arguments the most recent `yield` call suspended with — handed back
    /// as `resume`'s return values the moment `drive` returns.
    pub yielded_values: Vec<Value>,
    /// Where a suspended `yield` call's results get written once `resume`
    /// delivers them, and how many of them the waiting call site wants —
    /// the only state a synchronous-native-call suspension needs to carry
    /// across the gap between one `drive`/`run_until` call and the next,
    /// since no Rust call frame survives that gap.
    pub yield_base: usize,
    pub yield_want: u8,
}

impl Coroutine {
    pub fn new() -> Self {
        Coroutine {
            stack: Vec::new(),
            frames: Vec::new(),
            status: CoroutineStatus::Suspended,
            caller: None,
            open_upvalues: Vec::new(),
            yielded_values: Vec::new(),
            yield_base: 0,
            yield_want: 0,
        }
    }
}

impl Default for Coroutine {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Userdata {
    pub metatable: Option<TableId>,
    pub data: Rc<dyn std::any::Any>,
}
