//! Per-function compile-time state: the local/upvalue tables, scope
//! bookkeeping, and loop/goto patch lists a single-pass generator needs
//! while it's still emitting bytes for one function body.
//!
//! Ground: the teacher's `compiler/func_state.rs` keeps the same shape
//! (locals vector, upvalue table, scope depth, chunk-under-construction)
//! for its register allocator; this reuses the structure for slot
//! allocation instead of register allocation.

use crate::chunk::{Chunk, FunctionProto, LocalDebug, UpvalueDesc};
use crate::opcode::OpCode;
use crate::value::StringId;
use std::rc::Rc;

pub struct Local {
    pub name: String,
    pub slot: u8,
    pub depth: i32,
    pub captured: bool,
    /// PC at `declare_local` time, carried through to the `LocalDebug`
    /// record this local gets on `end_scope` (or function end).
    pub start_pc: u32,
}

/// Break-target patch list for one enclosing loop, plus the local-table
/// length the loop's body started at (so `break` knows exactly which
/// locals to unwind with inline `Pop`/`CloseUpvalue` before jumping out,
/// mirroring what the body's own `end_scope` would emit on a normal exit).
pub struct LoopCtx {
    pub break_patches: Vec<usize>,
    pub locals_mark: usize,
}

/// A label's recorded PC plus the scope it was declared in (spec §4.2:
/// "labels record PC and scope depth"), so a later goto can tell how many
/// locals separate it from the label.
pub struct LabelInfo {
    pub pc: usize,
    pub locals_count: usize,
    pub scope_depth: i32,
}

pub struct PendingGoto {
    pub name: String,
    pub patch_loc: usize,
    pub line: u32,
    /// `locals` snapshot (captured-flags only) at the point of the goto,
    /// taken before any of those locals can be popped by normal scope
    /// exit — the same "ask now, the stack can't change out from under a
    /// single-pass compiler" approach `compile_break` uses for its own
    /// cleanup list.
    pub captured_snapshot: Vec<bool>,
    pub scope_depth: i32,
}

pub struct FuncState {
    pub chunk: Chunk,
    pub locals: Vec<Local>,
    /// Name alongside the descriptor purely so `resolve_upvalue` can dedupe
    /// by name (spec §4.2: "upvalue descriptors are de-duplicated by name").
    pub upvalues: Vec<(String, UpvalueDesc)>,
    pub scope_depth: i32,
    pub next_slot: u16,
    pub max_slot: u16,
    pub loop_stack: Vec<LoopCtx>,
    pub labels: std::collections::HashMap<String, LabelInfo>,
    pub pending_gotos: Vec<PendingGoto>,
    /// Locals that have already left scope, queued for the `LocalDebug`
    /// conversion `into_proto` does once the interner is back in hand.
    pub completed_locals: Vec<(String, u8, u32, u32)>,
    pub arity: u8,
    pub is_vararg: bool,
    pub name: Option<StringId>,
    pub source_name: Rc<str>,
}

impl FuncState {
    pub fn new(source_name: Rc<str>, name: Option<StringId>) -> Self {
        FuncState {
            chunk: Chunk::new(),
            locals: Vec::new(),
            upvalues: Vec::new(),
            scope_depth: 0,
            next_slot: 0,
            max_slot: 0,
            loop_stack: Vec::new(),
            labels: std::collections::HashMap::new(),
            pending_gotos: Vec::new(),
            completed_locals: Vec::new(),
            arity: 0,
            is_vararg: false,
            name,
            source_name,
        }
    }

    pub fn emit_u8(&mut self, byte: u8, line: u32) {
        self.chunk.push_byte(byte, line);
    }

    pub fn emit_op(&mut self, op: OpCode, line: u32) {
        self.emit_u8(op as u8, line);
    }

    pub fn emit_u16(&mut self, v: u16, line: u32) {
        let [a, b] = v.to_le_bytes();
        self.emit_u8(a, line);
        self.emit_u8(b, line);
    }

    /// Emits `op` followed by a placeholder u16, returning the byte offset
    /// of that placeholder so a later `patch_jump`/`patch_u16` can fill it
    /// in once the real target is known.
    pub fn emit_jump(&mut self, op: OpCode, line: u32) -> usize {
        self.emit_op(op, line);
        let loc = self.chunk.code.len();
        self.emit_u16(0xFFFF, line);
        loc
    }

    /// Patches a forward jump emitted at `loc` to land on the current pc.
    pub fn patch_jump(&mut self, loc: usize) {
        let target = self.chunk.code.len();
        let offset = (target - (loc + 2)) as u16;
        let [a, b] = offset.to_le_bytes();
        self.chunk.code[loc] = a;
        self.chunk.code[loc + 1] = b;
    }

    /// Emits a backward jump (`Loop`) from the current position to `target`,
    /// which must already have been emitted (used for `while`/`repeat`
    /// back-edges and for `goto` onto an already-seen label).
    pub fn emit_loop(&mut self, op: OpCode, target: usize, line: u32) {
        self.emit_op(op, line);
        let from = self.chunk.code.len() + 2;
        let offset = (from - target) as u16;
        self.emit_u16(offset, line);
    }

    pub fn add_constant(&mut self, v: crate::value::Value) -> u16 {
        self.chunk.add_constant(v)
    }

    pub fn begin_scope(&mut self) {
        self.scope_depth += 1;
    }

    /// Pops every local declared in the scope being left, one instruction per
    /// local (`CloseUpvalue` for ones captured by a nested closure, `Pop`
    /// otherwise) so the physical stack height matches slot numbering again
    /// for whatever gets pushed next.
    pub fn end_scope(&mut self, line: u32) {
        self.scope_depth -= 1;
        let end_pc = self.chunk.code.len() as u32;
        let mut removed = Vec::new();
        while let Some(local) = self.locals.last() {
            if local.depth <= self.scope_depth {
                break;
            }
            let local = self.locals.pop().unwrap();
            self.next_slot -= 1;
            removed.push((local.captured, local.name, local.slot, local.start_pc));
        }
        // Locals are live stack slots, not just compile-time bookkeeping, so
        // each one leaving scope needs its own Pop (or CloseUpvalue, if a
        // nested closure captured it) to keep slot numbers matching physical
        // stack positions for whatever gets pushed next.
        for (captured, name, slot, start_pc) in removed {
            if captured {
                self.emit_op(OpCode::CloseUpvalue, line);
            } else {
                self.emit_op(OpCode::Pop, line);
            }
            self.completed_locals.push((name, slot, start_pc, end_pc));
        }
    }

    pub fn declare_local(&mut self, name: &str) -> u8 {
        let slot = self.next_slot;
        self.next_slot += 1;
        if self.next_slot > self.max_slot {
            self.max_slot = self.next_slot;
        }
        self.locals.push(Local {
            name: name.to_string(),
            slot: slot as u8,
            depth: self.scope_depth,
            captured: false,
            start_pc: self.chunk.code.len() as u32,
        });
        slot as u8
    }

    /// Finds `name` among locals currently in scope, innermost first.
    pub fn resolve_local(&self, name: &str) -> Option<u8> {
        self.locals.iter().rev().find(|l| l.name == name).map(|l| l.slot)
    }

    pub fn mark_captured(&mut self, slot: u8) {
        if let Some(l) = self.locals.iter_mut().rev().find(|l| l.slot == slot) {
            l.captured = true;
        }
    }

    /// Adds (or reuses) an upvalue descriptor for `name`, returning its index.
    pub fn add_upvalue(&mut self, name: &str, is_local: bool, index: u8) -> u8 {
        if let Some(pos) = self.upvalues.iter().position(|(n, _)| n == name) {
            return pos as u8;
        }
        self.upvalues.push((name.to_string(), UpvalueDesc { is_local, index }));
        (self.upvalues.len() - 1) as u8
    }

    /// Consumes the function's compile-time state into its runtime
    /// prototype. Any locals still live at function end (the outermost
    /// function body scope is never `end_scope`d explicitly, it just ends
    /// when the function does) are flushed into `completed_locals` here,
    /// with `end_pc` pinned to the final instruction.
    pub fn into_proto(mut self, interner: &mut crate::gc::StringInterner) -> FunctionProto {
        let end_pc = self.chunk.code.len() as u32;
        for local in self.locals.drain(..) {
            self.completed_locals.push((local.name, local.slot, local.start_pc, end_pc));
        }
        let locals_debug = self
            .completed_locals
            .into_iter()
            .map(|(name, slot, start_pc, end_pc)| LocalDebug {
                name: StringId(interner.intern(&name)),
                slot,
                start_pc,
                end_pc,
            })
            .collect();
        FunctionProto {
            name: self.name,
            arity: self.arity,
            is_vararg: self.is_vararg,
            upvalues: self.upvalues.into_iter().map(|(_, d)| d).collect(),
            num_slots: self.max_slot as u8,
            chunk: self.chunk,
            locals_debug,
            source_name: self.source_name,
        }
    }
}
