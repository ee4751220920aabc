//! Single-pass code generator: walks [`crate::ast`] once and emits
//! [`crate::opcode::OpCode`] bytes directly, the way the teacher's
//! `compiler/code_gen.rs` walks its AST once into register-VM bytecode.
//! No separate optimization or resolution pass — name resolution,
//! constant folding of literals into the pool, and jump patching all
//! happen inline as each node is visited (spec §4.2).

use super::state::{FuncState, LabelInfo, LoopCtx, PendingGoto};
use super::CompileError;
use crate::ast::*;
use crate::chunk::UpvalueDesc;
use crate::gc::StringInterner;
use crate::opcode::{OpCode, ALL_RESULTS};
use crate::value::{StringId, Value};
use std::rc::Rc;

pub struct Codegen<'i> {
    pub interner: &'i mut StringInterner,
    pub funcs: Vec<FuncState>,
    pub source_name: Rc<str>,
}

impl<'i> Codegen<'i> {
    fn f(&mut self) -> &mut FuncState {
        self.funcs.last_mut().unwrap()
    }

    fn err_here<T>(&self, msg: impl Into<String>, line: u32) -> Result<T, CompileError> {
        Err(CompileError { message: msg.into(), line })
    }

    fn string_const(&mut self, s: &str) -> u16 {
        let id = self.interner.intern(s);
        self.f().add_constant(Value::Str(StringId(id)))
    }

    fn load_const(&mut self, idx: u16, line: u32) {
        self.f().emit_op(OpCode::LoadConst, line);
        self.f().emit_u16(idx, line);
    }

    fn emit_nil(&mut self, line: u32) {
        self.f().emit_op(OpCode::Nil, line);
    }

    fn emit_bool(&mut self, b: bool, line: u32) {
        self.f().emit_op(if b { OpCode::True } else { OpCode::False }, line);
    }

    fn emit_int(&mut self, i: i64, line: u32) {
        let idx = self.f().add_constant(Value::Int(i));
        self.load_const(idx, line);
    }

    fn emit_float(&mut self, v: f64, line: u32) {
        let idx = self.f().add_constant(Value::Float(v));
        self.load_const(idx, line);
    }

    fn get_local(&mut self, slot: u8, line: u32) {
        self.f().emit_op(OpCode::GetLocal, line);
        self.f().emit_u8(slot, line);
    }

    /// Resolves `name` as an upvalue of the function at `level`, recursing
    /// into enclosing functions and registering a descriptor at each level
    /// it threads through (spec §4.2's local -> upvalue -> `_ENV` chain).
    fn resolve_upvalue(&mut self, level: usize, name: &str) -> Option<u8> {
        if level == 0 {
            return self.funcs[0]
                .upvalues
                .iter()
                .position(|(n, _)| n == name)
                .map(|i| i as u8);
        }
        let parent = level - 1;
        if let Some(slot) = self.funcs[parent].resolve_local(name) {
            self.funcs[parent].mark_captured(slot);
            return Some(self.funcs[level].add_upvalue(name, true, slot));
        }
        if let Some(up) = self.resolve_upvalue(parent, name) {
            return Some(self.funcs[level].add_upvalue(name, false, up));
        }
        None
    }

    fn load_name(&mut self, name: &str, line: u32) {
        if let Some(slot) = self.f().resolve_local(name) {
            self.get_local(slot, line);
            return;
        }
        let level = self.funcs.len() - 1;
        if let Some(idx) = self.resolve_upvalue(level, name) {
            self.f().emit_op(OpCode::GetUpval, line);
            self.f().emit_u8(idx, line);
            return;
        }
        let env_idx = self.resolve_upvalue(level, "_ENV").expect("_ENV always resolvable");
        let key = self.string_const(name);
        self.f().emit_op(OpCode::GetTabUp, line);
        self.f().emit_u8(env_idx, line);
        self.f().emit_u16(key, line);
    }

    fn store_name(&mut self, name: &str, line: u32) {
        if let Some(slot) = self.f().resolve_local(name) {
            self.f().emit_op(OpCode::SetLocal, line);
            self.f().emit_u8(slot, line);
            return;
        }
        let level = self.funcs.len() - 1;
        if let Some(idx) = self.resolve_upvalue(level, name) {
            self.f().emit_op(OpCode::SetUpval, line);
            self.f().emit_u8(idx, line);
            return;
        }
        let env_idx = self.resolve_upvalue(level, "_ENV").expect("_ENV always resolvable");
        let key = self.string_const(name);
        self.f().emit_op(OpCode::SetTabUp, line);
        self.f().emit_u8(env_idx, line);
        self.f().emit_u16(key, line);
    }

    // ---- expressions ----

    pub fn compile_expr(&mut self, e: &Expr, line: u32) -> Result<(), CompileError> {
        match e {
            Expr::Nil => self.emit_nil(line),
            Expr::True => self.emit_bool(true, line),
            Expr::False => self.emit_bool(false, line),
            Expr::Int(i) => self.emit_int(*i, line),
            Expr::Float(v) => self.emit_float(*v, line),
            Expr::Str(s) => {
                let idx = self.string_const(s);
                self.load_const(idx, line);
            }
            Expr::Vararg => {
                self.f().emit_op(OpCode::PushVararg, line);
                self.f().emit_u8(1, line);
            }
            Expr::Name(n) => self.load_name(n, line),
            Expr::Index(o, k) => {
                self.compile_expr(o, line)?;
                self.compile_expr(k, line)?;
                self.f().emit_op(OpCode::GetIndex, line);
            }
            Expr::Field(o, name) => {
                self.compile_expr(o, line)?;
                let idx = self.string_const(name);
                self.load_const(idx, line);
                self.f().emit_op(OpCode::GetIndex, line);
            }
            Expr::Call(callee, args, cline) => self.compile_call(callee, args, 1, *cline)?,
            Expr::MethodCall(obj, name, args, cline) => {
                self.compile_method_call(obj, name, args, 1, *cline)?
            }
            Expr::Function(body) => self.compile_function_body(body, None, line)?,
            Expr::Table(fields) => self.compile_table(fields, line)?,
            Expr::Binary(op, l, r, bline) => self.compile_binary(*op, l, r, *bline)?,
            Expr::Unary(op, inner, uline) => self.compile_unary(*op, inner, *uline)?,
            Expr::And(l, r) => {
                // JumpIfFalse tests without consuming, so the false branch
                // lands on `end` with `l` itself still on the stack.
                self.compile_expr(l, line)?;
                let to_end = self.f().emit_jump(OpCode::JumpIfFalse, line);
                self.f().emit_op(OpCode::Pop, line);
                self.compile_expr(r, line)?;
                self.f().patch_jump(to_end);
            }
            Expr::Or(l, r) => {
                // No JumpIfTrue opcode, so the truthy branch falls through
                // JumpIfFalse and takes an extra unconditional jump to skip
                // evaluating `r`, keeping `l` on the stack either way.
                self.compile_expr(l, line)?;
                let to_eval_r = self.f().emit_jump(OpCode::JumpIfFalse, line);
                let to_end = self.f().emit_jump(OpCode::Jump, line);
                self.f().patch_jump(to_eval_r);
                self.f().emit_op(OpCode::Pop, line);
                self.compile_expr(r, line)?;
                self.f().patch_jump(to_end);
            }
            Expr::Paren(inner) => self.compile_expr(inner, line)?,
        }
        Ok(())
    }

    /// Compiles `e` (which must be `is_multi()`) requesting exactly `retc`
    /// results, or every result when `retc == ALL_RESULTS`.
    fn compile_expr_multi(&mut self, e: &Expr, retc: u8, line: u32) -> Result<(), CompileError> {
        match e {
            Expr::Call(callee, args, cline) => self.compile_call(callee, args, retc, *cline),
            Expr::MethodCall(obj, name, args, cline) => {
                self.compile_method_call(obj, name, args, retc, *cline)
            }
            Expr::Vararg => {
                self.f().emit_op(OpCode::PushVararg, line);
                self.f().emit_u8(retc, line);
                Ok(())
            }
            _ => unreachable!("compile_expr_multi called on a non-multi expression"),
        }
    }

    fn compile_call(&mut self, callee: &Expr, args: &[Expr], retc: u8, line: u32) -> Result<(), CompileError> {
        self.compile_expr(callee, line)?;
        let (fixed, is_multi) = self.compile_expr_list_multi(args, line)?;
        if is_multi {
            self.f().emit_op(OpCode::CallMulti, line);
        } else {
            self.f().emit_op(OpCode::Call, line);
        }
        self.f().emit_u8(fixed, line);
        self.f().emit_u8(retc, line);
        Ok(())
    }

    fn compile_method_call(
        &mut self,
        obj: &Expr,
        name: &str,
        args: &[Expr],
        retc: u8,
        line: u32,
    ) -> Result<(), CompileError> {
        self.compile_expr(obj, line)?;
        self.f().emit_op(OpCode::Dup, line);
        let k = self.string_const(name);
        self.load_const(k, line);
        self.f().emit_op(OpCode::GetIndex, line);
        self.f().emit_op(OpCode::Swap, line);
        let (fixed, is_multi) = self.compile_expr_list_multi(args, line)?;
        let total = fixed + 1;
        if is_multi {
            self.f().emit_op(OpCode::CallMulti, line);
        } else {
            self.f().emit_op(OpCode::Call, line);
        }
        self.f().emit_u8(total, line);
        self.f().emit_u8(retc, line);
        Ok(())
    }

    fn compile_binary(&mut self, op: BinOp, l: &Expr, r: &Expr, line: u32) -> Result<(), CompileError> {
        use BinOp::*;
        match op {
            Add | Sub | Mul | Div | IDiv | Mod | Pow | BAnd | BOr | BXor | Shl | Shr | Concat => {
                self.compile_expr(l, line)?;
                self.compile_expr(r, line)?;
                let oc = match op {
                    Add => OpCode::Add,
                    Sub => OpCode::Sub,
                    Mul => OpCode::Mul,
                    Div => OpCode::Div,
                    IDiv => OpCode::IDiv,
                    Mod => OpCode::Mod,
                    Pow => OpCode::Pow,
                    BAnd => OpCode::BAnd,
                    BOr => OpCode::BOr,
                    BXor => OpCode::BXor,
                    Shl => OpCode::Shl,
                    Shr => OpCode::Shr,
                    Concat => OpCode::Concat,
                    _ => unreachable!(),
                };
                self.f().emit_op(oc, line);
            }
            Eq => {
                self.compile_expr(l, line)?;
                self.compile_expr(r, line)?;
                self.f().emit_op(OpCode::Eq, line);
            }
            Ne => {
                self.compile_expr(l, line)?;
                self.compile_expr(r, line)?;
                self.f().emit_op(OpCode::Eq, line);
                self.f().emit_op(OpCode::Not, line);
            }
            Lt => {
                self.compile_expr(l, line)?;
                self.compile_expr(r, line)?;
                self.f().emit_op(OpCode::Lt, line);
            }
            Le => {
                self.compile_expr(l, line)?;
                self.compile_expr(r, line)?;
                self.f().emit_op(OpCode::Le, line);
            }
            // a > b  ==  b < a; a >= b  ==  b <= a (spec §9: comparisons realized via Lt/Le only).
            Gt => {
                self.compile_expr(r, line)?;
                self.compile_expr(l, line)?;
                self.f().emit_op(OpCode::Lt, line);
            }
            Ge => {
                self.compile_expr(r, line)?;
                self.compile_expr(l, line)?;
                self.f().emit_op(OpCode::Le, line);
            }
        }
        Ok(())
    }

    fn compile_unary(&mut self, op: UnOp, e: &Expr, line: u32) -> Result<(), CompileError> {
        self.compile_expr(e, line)?;
        let oc = match op {
            UnOp::Neg => OpCode::Neg,
            UnOp::Not => OpCode::Not,
            UnOp::Len => OpCode::Len,
            UnOp::BNot => OpCode::BNot,
        };
        self.f().emit_op(oc, line);
        Ok(())
    }

    fn compile_table(&mut self, fields: &[TableField], line: u32) -> Result<(), CompileError> {
        self.f().emit_op(OpCode::NewTable, line);
        let mut next_index: i64 = 1;
        let n = fields.len();
        for (i, field) in fields.iter().enumerate() {
            let is_last = i == n - 1;
            match field {
                TableField::Positional(e) => {
                    if is_last && e.is_multi() {
                        self.compile_expr_multi(e, ALL_RESULTS, line)?;
                        self.f().emit_op(OpCode::SetList, line);
                        self.f().emit_u16(next_index as u16, line);
                    } else {
                        self.f().emit_op(OpCode::Dup, line);
                        self.emit_int(next_index, line);
                        self.compile_expr(e, line)?;
                        self.f().emit_op(OpCode::SetIndex, line);
                        next_index += 1;
                    }
                }
                TableField::Named(name, e) => {
                    self.f().emit_op(OpCode::Dup, line);
                    let k = self.string_const(name);
                    self.load_const(k, line);
                    self.compile_expr(e, line)?;
                    self.f().emit_op(OpCode::SetIndex, line);
                }
                TableField::Indexed(k, v) => {
                    self.f().emit_op(OpCode::Dup, line);
                    self.compile_expr(k, line)?;
                    self.compile_expr(v, line)?;
                    self.f().emit_op(OpCode::SetIndex, line);
                }
            }
        }
        Ok(())
    }

    /// Compiles `exprs` to leave exactly `want` values on the stack,
    /// expanding a multi-valued tail or padding/truncating with nils as
    /// needed (spec §4.2's multi-value expression contract, local-decl and
    /// generic-`for` control-variable sides).
    fn compile_expr_list_exact(&mut self, exprs: &[Expr], want: u8, line: u32) -> Result<(), CompileError> {
        if exprs.is_empty() {
            for _ in 0..want {
                self.emit_nil(line);
            }
            return Ok(());
        }
        let n = exprs.len();
        for e in &exprs[..n - 1] {
            self.compile_expr(e, line)?;
        }
        let fixed = (n - 1) as i32;
        let wantf = want as i32;
        let last = &exprs[n - 1];
        if last.is_multi() {
            let need = (wantf - fixed).max(0) as u8;
            self.compile_expr_multi(last, need, line)?;
            if fixed > wantf {
                for _ in 0..(fixed - wantf) {
                    self.f().emit_op(OpCode::Pop, line);
                }
            }
        } else {
            self.compile_expr(last, line)?;
            let total = n as i32;
            if total > wantf {
                for _ in 0..(total - wantf) {
                    self.f().emit_op(OpCode::Pop, line);
                }
            } else if total < wantf {
                for _ in 0..(wantf - total) {
                    self.emit_nil(line);
                }
            }
        }
        Ok(())
    }

    /// Compiles `exprs` keeping every value the last (possibly multi)
    /// expression produces, returning `(fixed, is_multi)` for the caller to
    /// pick the `*Multi` opcode variant and the non-last argument count
    /// (used for call arguments, return values, table-constructor tails).
    fn compile_expr_list_multi(&mut self, exprs: &[Expr], line: u32) -> Result<(u8, bool), CompileError> {
        if exprs.is_empty() {
            return Ok((0, false));
        }
        let n = exprs.len();
        for e in &exprs[..n - 1] {
            self.compile_expr(e, line)?;
        }
        let fixed = (n - 1) as u8;
        let last = &exprs[n - 1];
        if last.is_multi() {
            self.compile_expr_multi(last, ALL_RESULTS, line)?;
            Ok((fixed, true))
        } else {
            self.compile_expr(last, line)?;
            Ok((fixed + 1, false))
        }
    }

    // ---- statements ----

    pub fn compile_block(&mut self, block: &Block) -> Result<(), CompileError> {
        for s in &block.stmts {
            self.compile_stmt(s)?;
        }
        Ok(())
    }

    fn compile_stmt(&mut self, s: &Stmt) -> Result<(), CompileError> {
        match s {
            Stmt::Local { names, exprs, line } => {
                self.compile_expr_list_exact(exprs, names.len() as u8, *line)?;
                for n in names {
                    self.f().declare_local(n);
                }
            }
            Stmt::Assign { targets, exprs, line } => self.compile_assign(targets, exprs, *line)?,
            Stmt::ExprStat(e, line) => {
                if e.is_multi() {
                    self.compile_expr_multi(e, 0, *line)?;
                } else {
                    self.compile_expr(e, *line)?;
                    self.f().emit_op(OpCode::Pop, *line);
                }
            }
            Stmt::Do(b) => {
                self.f().begin_scope();
                self.compile_block(b)?;
                self.f().end_scope(0);
            }
            Stmt::While { cond, body, line } => self.compile_while(cond, body, *line)?,
            Stmt::Repeat { body, cond, line } => self.compile_repeat(body, cond, *line)?,
            Stmt::If { arms, else_body, line } => self.compile_if(arms, else_body, *line)?,
            Stmt::NumericFor { var, start, limit, step, body, line } => {
                self.compile_numeric_for(var, start, limit, step.as_ref(), body, *line)?
            }
            Stmt::GenericFor { names, exprs, body, line } => {
                self.compile_generic_for(names, exprs, body, *line)?
            }
            Stmt::FunctionDecl { path, is_method, body, line } => {
                self.compile_function_decl(path, *is_method, body, *line)?
            }
            Stmt::LocalFunction { name, body, line } => self.compile_local_function(name, body, *line)?,
            Stmt::Return(exprs, line) => self.compile_return(exprs, *line)?,
            Stmt::Break(line) => self.compile_break(*line)?,
            Stmt::Goto(name, line) => self.compile_goto(name, *line)?,
            Stmt::Label(name, line) => self.compile_label(name, *line)?,
        }
        Ok(())
    }

    fn compile_assign(&mut self, targets: &[Expr], exprs: &[Expr], line: u32) -> Result<(), CompileError> {
        self.f().begin_scope();
        self.compile_expr_list_exact(exprs, targets.len() as u8, line)?;
        let mut tmp_slots = Vec::with_capacity(targets.len());
        for _ in 0..targets.len() {
            tmp_slots.push(self.f().declare_local("(assign)"));
        }
        for (t, slot) in targets.iter().zip(tmp_slots) {
            match t {
                Expr::Name(n) => {
                    self.get_local(slot, line);
                    self.store_name(n, line);
                }
                Expr::Field(obj, name) => {
                    self.compile_expr(obj, line)?;
                    let k = self.string_const(name);
                    self.load_const(k, line);
                    self.get_local(slot, line);
                    self.f().emit_op(OpCode::SetIndex, line);
                }
                Expr::Index(obj, key) => {
                    self.compile_expr(obj, line)?;
                    self.compile_expr(key, line)?;
                    self.get_local(slot, line);
                    self.f().emit_op(OpCode::SetIndex, line);
                }
                _ => return self.err_here("invalid assignment target", line),
            }
        }
        self.f().end_scope(line);
        Ok(())
    }

    fn compile_if(
        &mut self,
        arms: &[(Expr, Block)],
        else_body: &Option<Block>,
        line: u32,
    ) -> Result<(), CompileError> {
        let mut end_jumps = Vec::new();
        for (i, (cond, body)) in arms.iter().enumerate() {
            self.compile_expr(cond, line)?;
            let else_jump = self.f().emit_jump(OpCode::JumpIfFalse, line);
            self.f().emit_op(OpCode::Pop, line); // truthy cond, entering body
            self.f().begin_scope();
            self.compile_block(body)?;
            self.f().end_scope(line);
            if i != arms.len() - 1 || else_body.is_some() {
                end_jumps.push(self.f().emit_jump(OpCode::Jump, line));
            }
            self.f().patch_jump(else_jump);
            self.f().emit_op(OpCode::Pop, line); // falsy cond, entering else/next arm
        }
        if let Some(eb) = else_body {
            self.f().begin_scope();
            self.compile_block(eb)?;
            self.f().end_scope(line);
        }
        for j in end_jumps {
            self.f().patch_jump(j);
        }
        Ok(())
    }

    fn compile_while(&mut self, cond: &Expr, body: &Block, line: u32) -> Result<(), CompileError> {
        let test_pc = self.f().chunk.code.len();
        self.compile_expr(cond, line)?;
        let exit_jump = self.f().emit_jump(OpCode::JumpIfFalse, line);
        self.f().emit_op(OpCode::Pop, line); // truthy cond, entering body
        self.f().begin_scope();
        let mark = self.f().locals.len();
        self.f().loop_stack.push(LoopCtx { break_patches: Vec::new(), locals_mark: mark });
        self.compile_block(body)?;
        let ctx = self.f().loop_stack.pop().unwrap();
        self.f().end_scope(line);
        self.f().emit_loop(OpCode::Loop, test_pc, line);
        self.f().patch_jump(exit_jump);
        self.f().emit_op(OpCode::Pop, line); // falsy cond, loop done
        for p in ctx.break_patches {
            self.f().patch_jump(p);
        }
        Ok(())
    }

    fn compile_repeat(&mut self, body: &Block, cond: &Expr, line: u32) -> Result<(), CompileError> {
        let body_start = self.f().chunk.code.len();
        self.f().begin_scope();
        let mark = self.f().locals.len();
        self.f().loop_stack.push(LoopCtx { break_patches: Vec::new(), locals_mark: mark });
        self.compile_block(body)?;
        // `until` sees the body's locals (spec-compatible Lua scoping), so the
        // condition is compiled before the scope closes.
        self.compile_expr(cond, line)?;
        let to_continue = self.f().emit_jump(OpCode::JumpIfFalse, line);
        // fallthrough: cond true, stop. Unwind the body's locals inline, then jump past the loop.
        self.f().emit_op(OpCode::Pop, line);
        let captured: Vec<bool> = self.f().locals[mark..].iter().rev().map(|l| l.captured).collect();
        for was_captured in &captured {
            if was_captured {
                self.f().emit_op(OpCode::CloseUpvalue, line);
            } else {
                self.f().emit_op(OpCode::Pop, line);
            }
        }
        let to_end = self.f().emit_jump(OpCode::Jump, line);
        self.f().patch_jump(to_continue);
        self.f().emit_op(OpCode::Pop, line); // cond false, continue
        // continue path: ordinary scope exit, then loop back
        let ctx = self.f().loop_stack.pop().unwrap();
        self.f().end_scope(line);
        self.f().emit_loop(OpCode::Loop, body_start, line);
        self.f().patch_jump(to_end);
        for p in ctx.break_patches {
            self.f().patch_jump(p);
        }
        Ok(())
    }

    fn compile_numeric_for(
        &mut self,
        var: &str,
        start: &Expr,
        limit: &Expr,
        step: Option<&Expr>,
        body: &Block,
        line: u32,
    ) -> Result<(), CompileError> {
        self.f().begin_scope();
        self.compile_expr(start, line)?;
        let counter_slot = self.f().declare_local("(for counter)");
        self.compile_expr(limit, line)?;
        let limit_slot = self.f().declare_local("(for limit)");
        match step {
            Some(e) => self.compile_expr(e, line)?,
            None => self.emit_int(1, line),
        }
        let step_slot = self.f().declare_local("(for step)");
        self.emit_int(0, line);
        self.get_local(step_slot, line);
        self.f().emit_op(OpCode::Lt, line);
        let step_pos_slot = self.f().declare_local("(for step positive)");

        let test_pc = self.f().chunk.code.len();
        self.get_local(step_pos_slot, line);
        let to_desc = self.f().emit_jump(OpCode::JumpIfFalse, line);
        self.f().emit_op(OpCode::Pop, line); // ascending
        self.get_local(counter_slot, line);
        self.get_local(limit_slot, line);
        self.f().emit_op(OpCode::Le, line);
        let past_desc = self.f().emit_jump(OpCode::Jump, line);
        self.f().patch_jump(to_desc);
        self.f().emit_op(OpCode::Pop, line); // descending
        self.get_local(limit_slot, line);
        self.get_local(counter_slot, line);
        self.f().emit_op(OpCode::Le, line);
        self.f().patch_jump(past_desc);
        let to_end = self.f().emit_jump(OpCode::JumpIfFalse, line);
        self.f().emit_op(OpCode::Pop, line); // in range, enter body

        self.f().begin_scope();
        self.get_local(counter_slot, line);
        self.f().declare_local(var);
        let mark = self.f().locals.len();
        self.f().loop_stack.push(LoopCtx { break_patches: Vec::new(), locals_mark: mark });
        self.compile_block(body)?;
        let ctx = self.f().loop_stack.pop().unwrap();
        self.f().end_scope(line);

        self.get_local(counter_slot, line);
        self.get_local(step_slot, line);
        self.f().emit_op(OpCode::Add, line);
        self.f().emit_op(OpCode::SetLocal, line);
        self.f().emit_u8(counter_slot, line);
        self.f().emit_loop(OpCode::Loop, test_pc, line);

        self.f().patch_jump(to_end);
        self.f().emit_op(OpCode::Pop, line); // out of range, loop done
        for p in ctx.break_patches {
            self.f().patch_jump(p);
        }
        self.f().end_scope(line);
        Ok(())
    }

    fn compile_generic_for(
        &mut self,
        names: &[String],
        exprs: &[Expr],
        body: &Block,
        line: u32,
    ) -> Result<(), CompileError> {
        self.f().begin_scope();
        self.compile_expr_list_exact(exprs, 3, line)?;
        let f_slot = self.f().declare_local("(for iterator)");
        let s_slot = self.f().declare_local("(for state)");
        let control_slot = self.f().declare_local("(for control)");

        let test_pc = self.f().chunk.code.len();
        self.get_local(f_slot, line);
        self.get_local(s_slot, line);
        self.get_local(control_slot, line);
        self.f().emit_op(OpCode::Call, line);
        self.f().emit_u8(2, line);
        self.f().emit_u8(names.len() as u8, line);

        self.f().begin_scope();
        let first_slot = self.f().declare_local(&names[0]);
        for n in &names[1..] {
            self.f().declare_local(n);
        }
        self.get_local(first_slot, line);
        self.emit_nil(line);
        self.f().emit_op(OpCode::Eq, line);
        self.f().emit_op(OpCode::Not, line);
        let to_end = self.f().emit_jump(OpCode::JumpIfFalse, line);
        self.f().emit_op(OpCode::Pop, line); // first result non-nil, continue
        self.get_local(first_slot, line);
        self.f().emit_op(OpCode::SetLocal, line);
        self.f().emit_u8(control_slot, line);

        let mark = self.f().locals.len();
        self.f().loop_stack.push(LoopCtx { break_patches: Vec::new(), locals_mark: mark });
        self.compile_block(body)?;
        let ctx = self.f().loop_stack.pop().unwrap();
        self.f().end_scope(line);
        self.f().emit_loop(OpCode::Loop, test_pc, line);

        self.f().patch_jump(to_end);
        self.f().emit_op(OpCode::Pop, line); // first result nil, loop done
        for p in ctx.break_patches {
            self.f().patch_jump(p);
        }
        self.f().end_scope(line); // pops the name locals on the stop path
        self.f().end_scope(line); // pops f/s/control
        Ok(())
    }

    fn compile_break(&mut self, line: u32) -> Result<(), CompileError> {
        let Some(mark) = self.f().loop_stack.last().map(|c| c.locals_mark) else {
            return self.err_here("break outside a loop", line);
        };
        let captured: Vec<bool> = self.f().locals[mark..].iter().rev().map(|l| l.captured).collect();
        for was_captured in captured {
            if was_captured {
                self.f().emit_op(OpCode::CloseUpvalue, line);
            } else {
                self.f().emit_op(OpCode::Pop, line);
            }
        }
        let patch = self.f().emit_jump(OpCode::Jump, line);
        self.f().loop_stack.last_mut().unwrap().break_patches.push(patch);
        Ok(())
    }

    /// A backward goto's target is already compiled, so the locals it needs
    /// to close are still sitting in `self.f().locals` (not yet popped by
    /// the label's own `end_scope`) — close them with the same
    /// captured-flag-driven `Pop`/`CloseUpvalue` choice `compile_break`
    /// uses, then emit the loop jump (spec §4.2: "backward gotos emit a
    /// loop jump preceded by close-upvalue instructions").
    ///
    /// A forward goto's label hasn't been seen yet, so it's deferred:
    /// `compile_label` resolves it once the label's own scope depth is
    /// known, inserting a cleanup stub first if the goto leaves a deeper
    /// scope than the label does.
    fn compile_goto(&mut self, name: &str, line: u32) -> Result<(), CompileError> {
        if let Some(label) = self.f().labels.get(name) {
            let (target, label_locals_count, label_scope_depth) =
                (label.pc, label.locals_count, label.scope_depth);
            let current_count = self.f().locals.len();
            if current_count < label_locals_count {
                return self.err_here(format!("goto '{name}' jumps into the scope of a local"), line);
            }
            debug_assert!(
                self.f().scope_depth >= label_scope_depth,
                "a backward goto can't target a deeper scope than its own"
            );
            let captured: Vec<bool> =
                self.f().locals[label_locals_count..].iter().rev().map(|l| l.captured).collect();
            for was_captured in captured {
                if was_captured {
                    self.f().emit_op(OpCode::CloseUpvalue, line);
                } else {
                    self.f().emit_op(OpCode::Pop, line);
                }
            }
            self.f().emit_loop(OpCode::Loop, target, line);
        } else {
            let captured_snapshot: Vec<bool> = self.f().locals.iter().map(|l| l.captured).collect();
            let scope_depth = self.f().scope_depth;
            let loc = self.f().emit_jump(OpCode::Jump, line);
            self.f().pending_gotos.push(PendingGoto {
                name: name.to_string(),
                patch_loc: loc,
                line,
                captured_snapshot,
                scope_depth,
            });
        }
        Ok(())
    }

    fn compile_label(&mut self, name: &str, _line: u32) -> Result<(), CompileError> {
        let label_locals_count = self.f().locals.len();
        let label_scope_depth = self.f().scope_depth;

        let mut matched = Vec::new();
        let mut rest = Vec::new();
        for g in self.f().pending_gotos.drain(..) {
            if g.name == name {
                matched.push(g);
            } else {
                rest.push(g);
            }
        }
        self.f().pending_gotos = rest;

        for g in &matched {
            if g.captured_snapshot.len() < label_locals_count {
                return self.err_here(format!("goto '{name}' jumps into the scope of a local"), g.line);
            }
            debug_assert!(
                g.scope_depth >= label_scope_depth,
                "a goto can't leave a shallower scope than the label it targets"
            );
        }

        // Gotos that leave a strictly deeper scope get a cleanup stub
        // emitted right here, before the label's own PC is recorded: the
        // jump lands on the stub, the stub closes exactly the locals that
        // existed at the goto site but not at the label, then falls
        // through into whatever comes next (either the next stub or the
        // label itself).
        for g in &matched {
            if g.captured_snapshot.len() > label_locals_count {
                self.f().patch_jump(g.patch_loc);
                for was_captured in g.captured_snapshot[label_locals_count..].iter().rev() {
                    if *was_captured {
                        self.f().emit_op(OpCode::CloseUpvalue, g.line);
                    } else {
                        self.f().emit_op(OpCode::Pop, g.line);
                    }
                }
            }
        }

        let pc = self.f().chunk.code.len();
        for g in &matched {
            if g.captured_snapshot.len() == label_locals_count {
                self.f().patch_jump(g.patch_loc);
            }
        }

        self.f().labels.insert(
            name.to_string(),
            LabelInfo { pc, locals_count: label_locals_count, scope_depth: label_scope_depth },
        );
        Ok(())
    }

    fn compile_return(&mut self, exprs: &[Expr], line: u32) -> Result<(), CompileError> {
        if exprs.len() == 1 {
            match &exprs[0] {
                Expr::Call(callee, args, cline) => {
                    self.compile_expr(callee, line)?;
                    let (fixed, is_multi) = self.compile_expr_list_multi(args, *cline)?;
                    if is_multi {
                        self.f().emit_op(OpCode::TailCallMulti, *cline);
                    } else {
                        self.f().emit_op(OpCode::TailCall, *cline);
                    }
                    self.f().emit_u8(fixed, *cline);
                    return Ok(());
                }
                Expr::MethodCall(obj, name, args, cline) => {
                    self.compile_expr(obj, *cline)?;
                    self.f().emit_op(OpCode::Dup, *cline);
                    let k = self.string_const(name);
                    self.load_const(k, *cline);
                    self.f().emit_op(OpCode::GetIndex, *cline);
                    self.f().emit_op(OpCode::Swap, *cline);
                    let (fixed, is_multi) = self.compile_expr_list_multi(args, *cline)?;
                    let total = fixed + 1;
                    if is_multi {
                        self.f().emit_op(OpCode::TailCallMulti, *cline);
                    } else {
                        self.f().emit_op(OpCode::TailCall, *cline);
                    }
                    self.f().emit_u8(total, *cline);
                    return Ok(());
                }
                _ => {}
            }
        }
        let (fixed, is_multi) = self.compile_expr_list_multi(exprs, line)?;
        if is_multi {
            self.f().emit_op(OpCode::ReturnMulti, line);
        } else {
            self.f().emit_op(OpCode::Return, line);
        }
        self.f().emit_u8(fixed, line);
        Ok(())
    }

    fn compile_function_decl(
        &mut self,
        path: &[String],
        _is_method: bool,
        body: &FunctionBody,
        line: u32,
    ) -> Result<(), CompileError> {
        let disp_name = path.join(".");
        let name_id = self.interner.intern(&disp_name);
        self.compile_function_body(body, Some(StringId(name_id)), line)?;

        if path.len() == 1 {
            self.store_name(&path[0], line);
            return Ok(());
        }
        self.f().begin_scope();
        let tmp = self.f().declare_local("(fndecl)");
        let mut obj = Expr::Name(path[0].clone());
        for seg in &path[1..path.len() - 1] {
            obj = Expr::Field(Box::new(obj), seg.clone());
        }
        self.compile_expr(&obj, line)?;
        let k = self.string_const(&path[path.len() - 1]);
        self.load_const(k, line);
        self.get_local(tmp, line);
        self.f().emit_op(OpCode::SetIndex, line);
        self.f().end_scope(line);
        Ok(())
    }

    fn compile_local_function(&mut self, name: &str, body: &FunctionBody, line: u32) -> Result<(), CompileError> {
        self.emit_nil(line);
        let slot = self.f().declare_local(name);
        let name_id = self.interner.intern(name);
        self.compile_function_body(body, Some(StringId(name_id)), line)?;
        self.f().emit_op(OpCode::SetLocal, line);
        self.f().emit_u8(slot, line);
        Ok(())
    }

    /// Compiles a nested function body into its own [`FuncState`], then
    /// pushes a `Closure` instruction in the *enclosing* function referring
    /// to the freshly built prototype and its resolved upvalue descriptors.
    pub fn compile_function_body(
        &mut self,
        body: &FunctionBody,
        name: Option<StringId>,
        line: u32,
    ) -> Result<(), CompileError> {
        self.funcs.push(FuncState::new(self.source_name.clone(), name));
        let level = self.funcs.len() - 1;
        self.funcs[level].arity = body.params.len() as u8;
        self.funcs[level].is_vararg = body.is_vararg;
        for p in &body.params {
            self.funcs[level].declare_local(p);
        }
        self.compile_block(&body.block)?;
        self.f().emit_op(OpCode::Return, body.line);
        self.f().emit_u8(0, body.line);

        let completed = self.funcs.pop().unwrap();
        if let Some(g) = completed.pending_gotos.first() {
            return self.err_here(format!("no visible label '{}' for goto", g.name), g.line);
        }
        let upvals: Vec<UpvalueDesc> = completed.upvalues.iter().map(|(_, d)| *d).collect();
        let proto = completed.into_proto(self.interner);
        let proto_idx = self.f().chunk.functions.len() as u16;
        self.f().chunk.functions.push(Rc::new(proto));

        self.f().emit_op(OpCode::Closure, line);
        self.f().emit_u16(proto_idx, line);
        for d in upvals {
            self.f().emit_u8(d.is_local as u8, line);
            self.f().emit_u8(d.index, line);
        }
        Ok(())
    }
}
