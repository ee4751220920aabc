//! The opcode dispatch loop: `Vm::step` decodes and executes exactly one
//! instruction of the current coroutine's topmost frame.
//!
//! Ground: the teacher's `lua_vm/execute/dispatch.rs` big-match fetch-decode-
//! execute loop, and `execute/call.rs`'s `FrameAction` push/pop/replace
//! frame-stack design for `Call`/`Return`/`TailCall` — reworked here for a
//! plain operand stack instead of register windows, and for `yield`
//! suspending through an ordinary native-function call rather than a
//! dedicated opcode (see [`Vm::do_yield`]).

use super::object::{Closure, CoroutineStatus, Upvalue};
use super::{Vm, VmResult, ALL_RESULTS};
use crate::opcode::OpCode;
use crate::value::{ClosureId, CoroutineId, NativeFn, UpvalueId, Value};

use super::NativeFrame;

impl Vm {
    /// Decodes and executes one instruction of `self.current`'s topmost
    /// frame. Callers ([`Vm::drive`]/[`Vm::run_until`]) are responsible for
    /// checking the frame stack and coroutine status between calls.
    pub(crate) fn step(&mut self) -> VmResult<()> {
        let co_id = self.current;
        let (cid, start_pc) = {
            let frame = self.coroutine(co_id).frames.last().expect("step with no active frame");
            (frame.closure, frame.pc)
        };
        let frame_base = self.coroutine(co_id).frames.last().unwrap().base;
        let proto = self.closures.get(cid.0).expect("dangling ClosureId").proto.clone();
        let code = &proto.chunk.code;
        let op = OpCode::from_u8(code[start_pc]);
        let mut cursor = start_pc + 1;

        macro_rules! u8_op {
            () => {{
                let b = proto.chunk.code[cursor];
                cursor += 1;
                b
            }};
        }
        macro_rules! u16_op {
            () => {{
                let b = u16::from_le_bytes([proto.chunk.code[cursor], proto.chunk.code[cursor + 1]]);
                cursor += 2;
                b
            }};
        }
        macro_rules! pop {
            () => {
                self.coroutine_mut(co_id).stack.pop().expect("stack underflow")
            };
        }
        macro_rules! push {
            ($v:expr) => {
                self.coroutine_mut(co_id).stack.push($v)
            };
        }
        macro_rules! set_pc {
            ($pc:expr) => {
                self.coroutine_mut(co_id).frames.last_mut().unwrap().pc = $pc
            };
        }

        use OpCode::*;
        match op {
            Nil => {
                push!(Value::Nil);
                set_pc!(cursor);
            }
            True => {
                push!(Value::Bool(true));
                set_pc!(cursor);
            }
            False => {
                push!(Value::Bool(false));
                set_pc!(cursor);
            }
            LoadConst => {
                let idx = u16_op!();
                let v = proto.chunk.constants[idx as usize];
                push!(v);
                set_pc!(cursor);
            }
            Pop => {
                pop!();
                set_pc!(cursor);
            }
            Dup => {
                let v = *self.coroutine(co_id).stack.last().expect("Dup on empty stack");
                push!(v);
                set_pc!(cursor);
            }
            Swap => {
                let b = pop!();
                let a = pop!();
                push!(b);
                push!(a);
                set_pc!(cursor);
            }
            Rotate => {
                let n = u8_op!() as usize;
                let stack = &mut self.coroutine_mut(co_id).stack;
                let len = stack.len();
                if n > 1 && n <= len {
                    let v = stack.remove(len - 1);
                    stack.insert(len - n, v);
                }
                set_pc!(cursor);
            }
            GetLocal => {
                let slot = u8_op!() as usize;
                let v = self.coroutine(co_id).stack[frame_base + slot];
                push!(v);
                set_pc!(cursor);
            }
            SetLocal => {
                let slot = u8_op!() as usize;
                let v = pop!();
                self.coroutine_mut(co_id).stack[frame_base + slot] = v;
                set_pc!(cursor);
            }
            GetUpval => {
                let idx = u8_op!() as usize;
                let upid = self.closures.get(cid.0).expect("dangling ClosureId").upvalues[idx];
                let v = self.read_upvalue(upid);
                push!(v);
                set_pc!(cursor);
            }
            SetUpval => {
                let idx = u8_op!() as usize;
                let v = pop!();
                let upid = self.closures.get(cid.0).expect("dangling ClosureId").upvalues[idx];
                self.write_upvalue(upid, v);
                set_pc!(cursor);
            }
            GetTabUp => {
                let upidx = u8_op!() as usize;
                let key_idx = u16_op!();
                let upid = self.closures.get(cid.0).expect("dangling ClosureId").upvalues[upidx];
                let t = self.read_upvalue(upid);
                let k = proto.chunk.constants[key_idx as usize];
                let v = self.index_get(t, k)?;
                push!(v);
                set_pc!(cursor);
            }
            SetTabUp => {
                let upidx = u8_op!() as usize;
                let key_idx = u16_op!();
                let v = pop!();
                let upid = self.closures.get(cid.0).expect("dangling ClosureId").upvalues[upidx];
                let t = self.read_upvalue(upid);
                let k = proto.chunk.constants[key_idx as usize];
                self.index_set(t, k, v)?;
                set_pc!(cursor);
            }
            GetIndex => {
                let k = pop!();
                let t = pop!();
                let v = self.index_get(t, k)?;
                push!(v);
                set_pc!(cursor);
            }
            SetIndex => {
                let v = pop!();
                let k = pop!();
                let t = pop!();
                self.index_set(t, k, v)?;
                set_pc!(cursor);
            }
            NewTable => {
                let tid = self.new_table();
                push!(Value::Table(tid));
                set_pc!(cursor);
            }
            Add | Sub | Mul | Div | IDiv | Mod | Pow | BAnd | BOr | BXor | Shl | Shr => {
                let b = pop!();
                let a = pop!();
                let v = self.binary_arith(op, a, b)?;
                push!(v);
                set_pc!(cursor);
            }
            Concat => {
                let b = pop!();
                let a = pop!();
                let v = self.concat(a, b)?;
                push!(v);
                set_pc!(cursor);
            }
            Len => {
                let a = pop!();
                let v = self.length_of(a)?;
                push!(v);
                set_pc!(cursor);
            }
            Neg => {
                let a = pop!();
                let v = self.unary_neg(a)?;
                push!(v);
                set_pc!(cursor);
            }
            BNot => {
                let a = pop!();
                let v = self.unary_bnot(a)?;
                push!(v);
                set_pc!(cursor);
            }
            Not => {
                let a = pop!();
                push!(Value::Bool(!a.is_truthy()));
                set_pc!(cursor);
            }
            Eq => {
                let b = pop!();
                let a = pop!();
                let r = self.values_equal(a, b)?;
                push!(Value::Bool(r));
                set_pc!(cursor);
            }
            Lt => {
                let b = pop!();
                let a = pop!();
                let r = self.less_than(a, b)?;
                push!(Value::Bool(r));
                set_pc!(cursor);
            }
            Le => {
                let b = pop!();
                let a = pop!();
                let r = self.less_equal(a, b)?;
                push!(Value::Bool(r));
                set_pc!(cursor);
            }
            Jump => {
                let off = u16_op!();
                set_pc!(cursor + off as usize);
            }
            JumpIfFalse => {
                let off = u16_op!();
                let taken = !self.coroutine(co_id).stack.last().expect("JumpIfFalse on empty stack").is_truthy();
                set_pc!(if taken { cursor + off as usize } else { cursor });
            }
            Loop => {
                let off = u16_op!();
                set_pc!(cursor - off as usize);
            }
            Closure => {
                let idx = u16_op!();
                let nested = proto.chunk.functions[idx as usize].clone();
                let n_up = nested.upvalues.len();
                let mut ups = Vec::with_capacity(n_up);
                for _ in 0..n_up {
                    let is_local = u8_op!();
                    let index = u8_op!() as usize;
                    let upid = if is_local != 0 {
                        self.find_or_open_upvalue(co_id, frame_base + index)
                    } else {
                        self.closures.get(cid.0).expect("dangling ClosureId").upvalues[index]
                    };
                    ups.push(upid);
                }
                let new_cid = ClosureId(self.closures.insert(Closure { proto: nested, upvalues: ups }));
                push!(Value::Closure(new_cid));
                set_pc!(cursor);
            }
            CloseUpvalue => {
                let top = self.coroutine(co_id).stack.len() - 1;
                self.close_upvalues_above(co_id, top);
                self.coroutine_mut(co_id).stack.pop();
                set_pc!(cursor);
            }
            Call | CallMulti => {
                let argc = u8_op!();
                let retc = u8_op!();
                let total_nargs =
                    if op == CallMulti { argc as usize + self.last_result_count } else { argc as usize };
                set_pc!(cursor);
                let call_pos = self.coroutine(co_id).stack.len() - total_nargs - 1;
                let callee = self.coroutine(co_id).stack[call_pos];
                match callee {
                    Value::Closure(callee_cid) => {
                        self.push_closure_frame(callee_cid, call_pos + 1, total_nargs, retc, call_pos)?;
                    }
                    Value::Native(nf) => {
                        self.invoke_native(nf, call_pos + 1, total_nargs, call_pos, retc)?;
                    }
                    other => {
                        let tn = other.type_name();
                        return Err(self.raise(format!("attempt to call a {tn} value")));
                    }
                }
            }
            TailCall | TailCallMulti => {
                let fixed = u8_op!();
                let total_nargs =
                    if op == TailCallMulti { fixed as usize + self.last_result_count } else { fixed as usize };
                let old_frame = self.coroutine_mut(co_id).frames.pop().expect("tail call with no active frame");
                self.close_upvalues_above(co_id, old_frame.base);
                let call_pos = self.coroutine(co_id).stack.len() - total_nargs - 1;
                {
                    let co = self.coroutine_mut(co_id);
                    let window = co.stack.split_off(call_pos);
                    co.stack.truncate(old_frame.result_base);
                    co.stack.extend(window);
                }
                let new_call_pos = old_frame.result_base;
                let callee = self.coroutine(co_id).stack[new_call_pos];
                match callee {
                    Value::Closure(callee_cid) => {
                        self.push_closure_frame(
                            callee_cid,
                            new_call_pos + 1,
                            total_nargs,
                            old_frame.want,
                            new_call_pos,
                        )?;
                    }
                    Value::Native(nf) => {
                        self.invoke_native(nf, new_call_pos + 1, total_nargs, new_call_pos, old_frame.want)?;
                    }
                    other => {
                        let tn = other.type_name();
                        return Err(self.raise(format!("attempt to call a {tn} value")));
                    }
                }
            }
            Return | ReturnMulti => {
                let fixed = u8_op!();
                let total = if op == ReturnMulti { fixed as usize + self.last_result_count } else { fixed as usize };
                let frame = self.coroutine_mut(co_id).frames.pop().expect("return with no active frame");
                self.close_upvalues_above(co_id, frame.base);
                let results = {
                    let co = self.coroutine_mut(co_id);
                    let len = co.stack.len();
                    co.stack.split_off(len - total)
                };
                self.finish_return(frame.result_base, results, frame.want);
            }
            PushVararg => {
                let n = u8_op!();
                let (vbase, vcount) = {
                    let f = self.coroutine(co_id).frames.last().unwrap();
                    (f.vararg_base, f.vararg_count)
                };
                let take = if n == ALL_RESULTS { vcount } else { n as usize };
                for i in 0..take {
                    let v = if i < vcount { self.coroutine(co_id).stack[vbase + i] } else { Value::Nil };
                    push!(v);
                }
                self.last_result_count = take;
                set_pc!(cursor);
            }
            SetList => {
                let start_key = u16_op!() as i64;
                let n = self.last_result_count;
                let values = {
                    let co = self.coroutine_mut(co_id);
                    let len = co.stack.len();
                    co.stack.split_off(len - n)
                };
                let table_val = *self.coroutine(co_id).stack.last().expect("SetList with no table on stack");
                if let Value::Table(tid) = table_val {
                    for (i, v) in values.into_iter().enumerate() {
                        self.table_mut(tid).set(Value::Int(start_key + i as i64), v);
                    }
                }
                set_pc!(cursor);
            }
            Yield => {
                let argc = u8_op!();
                let retc = u8_op!();
                set_pc!(cursor);
                if self.is_main(co_id) {
                    return Err(self.raise("attempt to yield from outside a coroutine"));
                }
                let values = {
                    let co = self.coroutine_mut(co_id);
                    let len = co.stack.len();
                    co.stack.split_off(len - argc as usize)
                };
                let base = self.coroutine(co_id).stack.len();
                let co = self.coroutine_mut(co_id);
                co.yielded_values = values;
                co.yield_base = base;
                co.yield_want = retc;
                co.status = CoroutineStatus::Suspended;
            }
        }
        Ok(())
    }

    /// Runs a native callee synchronously and either writes its results in
    /// place of the call window at `target_base` (padded/truncated to
    /// `retc`), or, if the native suspended the coroutine (`coroutine.yield`
    /// firing inside it), stashes `target_base`/`retc` as where `resume`
    /// should deliver its results later. Shared by `Call`/`CallMulti` (where
    /// `target_base` is the callee's own slot) and `TailCall`/`TailCallMulti`
    /// (where it's the replaced frame's `result_base`).
    fn invoke_native(
        &mut self,
        nf: NativeFn,
        args_pos: usize,
        nargs: usize,
        target_base: usize,
        retc: u8,
    ) -> VmResult<()> {
        let co_id = self.current;
        self.native_frames.push(NativeFrame { base: args_pos, nargs });
        let pushed = nf(self);
        self.native_frames.pop();
        let pushed = pushed?;
        if self.coroutine(co_id).status != CoroutineStatus::Running {
            let co = self.coroutine_mut(co_id);
            co.stack.truncate(target_base);
            co.yield_base = target_base;
            co.yield_want = retc;
            return Ok(());
        }
        let co = self.coroutine_mut(co_id);
        let len = co.stack.len();
        let results = co.stack.split_off(len - pushed);
        self.finish_return(target_base, results, retc);
        Ok(())
    }

    fn read_upvalue(&self, id: UpvalueId) -> Value {
        match self.upvalues.get(id.0).expect("dangling UpvalueId") {
            Upvalue::Open { coroutine, slot } => self.coroutine(*coroutine).stack[*slot],
            Upvalue::Closed(v) => *v,
        }
    }

    fn write_upvalue(&mut self, id: UpvalueId, v: Value) {
        let target = match self.upvalues.get(id.0).expect("dangling UpvalueId") {
            Upvalue::Open { coroutine, slot } => Some((*coroutine, *slot)),
            Upvalue::Closed(_) => None,
        };
        match target {
            Some((co, slot)) => self.coroutine_mut(co).stack[slot] = v,
            None => {
                if let Some(Upvalue::Closed(stored)) = self.upvalues.get_mut(id.0) {
                    *stored = v;
                }
            }
        }
    }

    /// Finds the open upvalue already aliasing `abs_slot` on `co_id`'s
    /// stack, or opens a new one, keeping the coroutine's `open_upvalues`
    /// sorted by slot (spec §3 invariant backing [`Self::close_upvalues_above`]).
    fn find_or_open_upvalue(&mut self, co_id: CoroutineId, abs_slot: usize) -> UpvalueId {
        let ids = self.coroutine(co_id).open_upvalues.clone();
        for id in &ids {
            if let Some(Upvalue::Open { slot, .. }) = self.upvalues.get(id.0) {
                if *slot == abs_slot {
                    return *id;
                }
            }
        }
        let new_id = UpvalueId(self.upvalues.insert(Upvalue::Open { coroutine: co_id, slot: abs_slot }));
        let insert_at = ids
            .iter()
            .position(|id| matches!(self.upvalues.get(id.0), Some(Upvalue::Open { slot, .. }) if *slot > abs_slot))
            .unwrap_or(ids.len());
        self.coroutine_mut(co_id).open_upvalues.insert(insert_at, new_id);
        new_id
    }

    /// Closes (converts `Open` to `Closed`, snapshotting the current stack
    /// value) every open upvalue on `co_id` at or above `threshold` — a
    /// scope or frame leaving, whose locals must not keep aliasing a stack
    /// slot some later call is about to reuse.
    fn close_upvalues_above(&mut self, co_id: CoroutineId, threshold: usize) {
        let ids: Vec<UpvalueId> = self
            .coroutine(co_id)
            .open_upvalues
            .iter()
            .filter(|id| matches!(self.upvalues.get(id.0), Some(Upvalue::Open { slot, .. }) if *slot >= threshold))
            .copied()
            .collect();
        if ids.is_empty() {
            return;
        }
        for id in &ids {
            let value = match self.upvalues.get(id.0) {
                Some(Upvalue::Open { slot, .. }) => self.coroutine(co_id).stack[*slot],
                _ => continue,
            };
            if let Some(u) = self.upvalues.get_mut(id.0) {
                *u = Upvalue::Closed(value);
            }
        }
        self.coroutine_mut(co_id).open_upvalues.retain(|id| !ids.contains(id));
    }
}
