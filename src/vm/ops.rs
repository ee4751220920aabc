//! Value-level operators: arithmetic, comparison, concatenation, length,
//! and indexing. Each tries the direct operation on primitive operands
//! first and falls back to the matching metamethod (spec §4.3's metatable
//! fallback list) — the same "fast path, then metamethod" shape the
//! teacher's `execute/metamethod.rs` uses for its MMBIN dispatch, reworked
//! here for a pair of popped stack operands instead of a register window.

use super::{Vm, VmResult};
use crate::opcode::OpCode;
use crate::value::{Value, ValueKey};

impl Vm {
    /// Looks up a metamethod on either operand (left first) and, if found,
    /// calls it with `(a, b)`, returning its first result.
    fn try_binary_metamethod(&mut self, a: &Value, b: &Value, name: &str) -> VmResult<Option<Value>> {
        let mm = self.metamethod(a, name).or_else(|| self.metamethod(b, name));
        match mm {
            Some(f) => {
                let results = self.call_value(f, &[*a, *b])?;
                Ok(Some(results.into_iter().next().unwrap_or(Value::Nil)))
            }
            None => Ok(None),
        }
    }

    pub(crate) fn binary_arith(&mut self, op: OpCode, a: Value, b: Value) -> VmResult<Value> {
        if is_bitwise(op) {
            return self.bitwise(op, a, b);
        }
        if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
            return self.numeric_arith(op, a, b, x, y);
        }
        if let Some(v) = self.try_binary_metamethod(&a, &b, arith_metamethod_name(op))? {
            return Ok(v);
        }
        let bad = if a.is_number() { b } else { a };
        Err(self.raise(format!("attempt to perform arithmetic on a {} value", bad.type_name())))
    }

    fn numeric_arith(&mut self, op: OpCode, a: Value, b: Value, x: f64, y: f64) -> VmResult<Value> {
        use OpCode::*;
        if let (Value::Int(ix), Value::Int(iy)) = (a, b) {
            match op {
                Add => return Ok(Value::Int(ix.wrapping_add(iy))),
                Sub => return Ok(Value::Int(ix.wrapping_sub(iy))),
                Mul => return Ok(Value::Int(ix.wrapping_mul(iy))),
                IDiv => {
                    if iy == 0 {
                        return Err(self.raise("attempt to perform 'n//0'"));
                    }
                    return Ok(Value::Int(ix.div_euclid(iy)));
                }
                Mod => {
                    if iy == 0 {
                        return Err(self.raise("attempt to perform 'n%%0'"));
                    }
                    return Ok(Value::Int(ix.rem_euclid(iy)));
                }
                _ => {}
            }
        }
        Ok(Value::Float(match op {
            Add => x + y,
            Sub => x - y,
            Mul => x * y,
            Div => x / y,
            Pow => x.powf(y),
            IDiv => (x / y).floor(),
            Mod => x - (x / y).floor() * y,
            _ => unreachable!("non-arithmetic opcode reached numeric_arith"),
        }))
    }

    fn bitwise(&mut self, op: OpCode, a: Value, b: Value) -> VmResult<Value> {
        use OpCode::*;
        let (Some(x), Some(y)) = (to_int(a), to_int(b)) else {
            if let Some(v) = self.try_binary_metamethod(&a, &b, arith_metamethod_name(op))? {
                return Ok(v);
            }
            let bad = if to_int(a).is_none() { a } else { b };
            return Err(self.raise(match bad {
                Value::Float(_) => "number has no integer representation".to_string(),
                other => format!("attempt to perform bitwise operation on a {} value", other.type_name()),
            }));
        };
        Ok(Value::Int(match op {
            BAnd => x & y,
            BOr => x | y,
            BXor => x ^ y,
            Shl => shift(x, y),
            Shr => shift(x, -y),
            _ => unreachable!("non-bitwise opcode reached bitwise"),
        }))
    }

    pub(crate) fn unary_neg(&mut self, v: Value) -> VmResult<Value> {
        match v {
            Value::Int(i) => Ok(Value::Int(i.wrapping_neg())),
            Value::Float(f) => Ok(Value::Float(-f)),
            other => self.unary_fallback(other, "__unm", "attempt to perform arithmetic on a"),
        }
    }

    pub(crate) fn unary_bnot(&mut self, v: Value) -> VmResult<Value> {
        match to_int(v) {
            Some(i) => Ok(Value::Int(!i)),
            None => self.unary_fallback(v, "__bnot", "attempt to perform bitwise operation on a"),
        }
    }

    fn unary_fallback(&mut self, v: Value, name: &str, verb: &str) -> VmResult<Value> {
        if let Some(f) = self.metamethod(&v, name) {
            let r = self.call_value(f, &[v, v])?;
            Ok(r.into_iter().next().unwrap_or(Value::Nil))
        } else {
            Err(self.raise(format!("{verb} {} value", v.type_name())))
        }
    }

    pub(crate) fn length_of(&mut self, v: Value) -> VmResult<Value> {
        match v {
            Value::Str(id) => Ok(Value::Int(self.str_value(id).len() as i64)),
            Value::Table(tid) => match self.metamethod(&v, "__len") {
                Some(f) => {
                    let r = self.call_value(f, &[v])?;
                    Ok(r.into_iter().next().unwrap_or(Value::Nil))
                }
                None => Ok(Value::Int(self.table(tid).length())),
            },
            other => match self.metamethod(&other, "__len") {
                Some(f) => {
                    let r = self.call_value(f, &[other])?;
                    Ok(r.into_iter().next().unwrap_or(Value::Nil))
                }
                None => Err(self.raise(format!("attempt to get length of a {} value", other.type_name()))),
            },
        }
    }

    pub(crate) fn concat(&mut self, a: Value, b: Value) -> VmResult<Value> {
        if let (Some(sa), Some(sb)) = (self.coerce_to_string(&a), self.coerce_to_string(&b)) {
            let joined = format!("{sa}{sb}");
            return Ok(Value::Str(self.intern(&joined)));
        }
        if let Some(v) = self.try_binary_metamethod(&a, &b, "__concat")? {
            return Ok(v);
        }
        let bad = if self.coerce_to_string(&a).is_some() { b } else { a };
        Err(self.raise(format!("attempt to concatenate a {} value", bad.type_name())))
    }

    fn coerce_to_string(&self, v: &Value) -> Option<String> {
        match v {
            Value::Str(id) => Some(self.str_value(*id).to_string()),
            Value::Int(i) => Some(itoa::Buffer::new().format(*i).to_string()),
            Value::Float(f) => Some(format_float(*f)),
            _ => None,
        }
    }

    pub(crate) fn values_equal(&mut self, a: Value, b: Value) -> VmResult<bool> {
        let a = a.canonicalize();
        let b = b.canonicalize();
        if ValueKey(a) == ValueKey(b) {
            return Ok(true);
        }
        let same_kind = matches!(
            (a, b),
            (Value::Table(_), Value::Table(_)) | (Value::Userdata(_), Value::Userdata(_))
        );
        if same_kind {
            if let Some(v) = self.try_binary_metamethod(&a, &b, "__eq")? {
                return Ok(v.is_truthy());
            }
        }
        Ok(false)
    }

    pub(crate) fn less_than(&mut self, a: Value, b: Value) -> VmResult<bool> {
        if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
            return Ok(x < y);
        }
        if let (Value::Str(sa), Value::Str(sb)) = (a, b) {
            return Ok(self.str_value(sa) < self.str_value(sb));
        }
        if let Some(v) = self.try_binary_metamethod(&a, &b, "__lt")? {
            return Ok(v.is_truthy());
        }
        Err(self.raise(format!("attempt to compare {} with {}", a.type_name(), b.type_name())))
    }

    pub(crate) fn less_equal(&mut self, a: Value, b: Value) -> VmResult<bool> {
        if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
            return Ok(x <= y);
        }
        if let (Value::Str(sa), Value::Str(sb)) = (a, b) {
            return Ok(self.str_value(sa) <= self.str_value(sb));
        }
        if let Some(v) = self.try_binary_metamethod(&a, &b, "__le")? {
            return Ok(v.is_truthy());
        }
        Err(self.raise(format!("attempt to compare {} with {}", a.type_name(), b.type_name())))
    }

    /// `t[k]`, following the `__index` chain (table or function) when the
    /// raw lookup misses. Non-table operands only reach here via a
    /// type-level metatable (e.g. strings' `__index` pointing at the
    /// string library), so a miss with no metatable at all is always an
    /// indexing error.
    pub(crate) fn index_get(&mut self, t: Value, k: Value) -> VmResult<Value> {
        if let Value::Table(tid) = t {
            let v = self.table(tid).get(&k);
            if !v.is_nil() {
                return Ok(v);
            }
        }
        match self.metamethod(&t, "__index") {
            Some(mt @ Value::Table(_)) => self.index_get(mt, k),
            Some(f @ (Value::Closure(_) | Value::Native(_))) => {
                let results = self.call_value(f, &[t, k])?;
                Ok(results.into_iter().next().unwrap_or(Value::Nil))
            }
            _ => {
                if matches!(t, Value::Table(_)) {
                    Ok(Value::Nil)
                } else {
                    Err(self.raise(format!("attempt to index a {} value", t.type_name())))
                }
            }
        }
    }

    /// `t[k] = v`, following `__newindex` only when the key is absent from
    /// the table already (spec §4.3: an existing key always writes through
    /// directly, matching real Lua).
    pub(crate) fn index_set(&mut self, t: Value, k: Value, v: Value) -> VmResult<()> {
        if let Value::Table(tid) = t {
            if !self.table(tid).get(&k).is_nil() {
                return self.raw_set(tid, k, v);
            }
        }
        match self.metamethod(&t, "__newindex") {
            Some(mt @ Value::Table(_)) => self.index_set(mt, k, v),
            Some(f @ (Value::Closure(_) | Value::Native(_))) => {
                self.call_value(f, &[t, k, v])?;
                Ok(())
            }
            _ => match t {
                Value::Table(tid) => self.raw_set(tid, k, v),
                other => Err(self.raise(format!("attempt to index a {} value", other.type_name()))),
            },
        }
    }

    /// `tostring(v)`: the `__tostring` metamethod if present, else the same
    /// rendering `print` and string coercion use for non-string operands.
    /// Public: the CLI's REPL uses this to print top-level expression
    /// results the same way `print` would.
    pub fn display_value(&mut self, v: Value) -> VmResult<String> {
        if let Some(f) = self.metamethod(&v, "__tostring") {
            let result = self.call_value(f, &[v])?.into_iter().next().unwrap_or(Value::Nil);
            return match result {
                Value::Str(id) => Ok(self.str_value(id).to_string()),
                other => Ok(self.coerce_to_string(&other).unwrap_or_else(|| other.type_name().to_string())),
            };
        }
        Ok(match v {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => itoa::Buffer::new().format(i).to_string(),
            Value::Float(f) => format_float(f),
            Value::Str(id) => self.str_value(id).to_string(),
            Value::Table(id) => format!("table: 0x{:012x}", id.0),
            Value::Closure(id) => format!("function: 0x{:012x}", id.0),
            Value::Native(f) => format!("function: builtin: {:p}", f as usize as *const ()),
            Value::Coroutine(id) => format!("thread: 0x{:012x}", id.0),
            Value::Userdata(id) => format!("userdata: 0x{:012x}", id.0),
        })
    }

    fn raw_set(&mut self, tid: crate::value::TableId, k: Value, v: Value) -> VmResult<()> {
        if k.is_nil() {
            return Err(self.raise("table index is nil"));
        }
        if let Value::Float(f) = k {
            if f.is_nan() {
                return Err(self.raise("table index is NaN"));
            }
        }
        self.table_mut(tid).set(k, v);
        Ok(())
    }
}

fn is_bitwise(op: OpCode) -> bool {
    matches!(op, OpCode::BAnd | OpCode::BOr | OpCode::BXor | OpCode::Shl | OpCode::Shr)
}

fn arith_metamethod_name(op: OpCode) -> &'static str {
    use OpCode::*;
    match op {
        Add => "__add",
        Sub => "__sub",
        Mul => "__mul",
        Div => "__div",
        IDiv => "__idiv",
        Mod => "__mod",
        Pow => "__pow",
        BAnd => "__band",
        BOr => "__bor",
        BXor => "__bxor",
        Shl => "__shl",
        Shr => "__shr",
        other => unreachable!("{other:?} is not an arithmetic opcode"),
    }
}

/// Integers and exact-integer floats convert; fractional floats and
/// anything else don't (spec's "no integer representation" case).
fn to_int(v: Value) -> Option<i64> {
    match v {
        Value::Int(i) => Some(i),
        Value::Float(f) if f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 => {
            Some(f as i64)
        }
        _ => None,
    }
}

/// Shifts left by `n`, treating a negative `n` as a right shift by `-n`
/// (how `Shr` is implemented in terms of this helper). Shifts of 64 or
/// more bits yield zero rather than Rust's panicking/UB-prone behavior,
/// matching Lua's defined "shift past width is zero" rule.
fn shift(x: i64, n: i64) -> i64 {
    if n <= -64 || n >= 64 {
        0
    } else if n >= 0 {
        ((x as u64) << n) as i64
    } else {
        ((x as u64) >> -n) as i64
    }
}

fn format_float(f: f64) -> String {
    if f.is_nan() {
        "nan".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { "inf".to_string() } else { "-inf".to_string() }
    } else if f == f.trunc() && f.abs() < 1e15 {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}
