//! The unnamed base library: installed directly into `_G` rather than
//! behind a module table. Ground: `stdlib/basic.rs` in the teacher.

use super::util::as_int;
use crate::native::LibraryModule;
use crate::value::{Value, ValueKey};
use crate::vm::{Vm, VmResult};

pub fn module() -> LibraryModule {
    LibraryModule::new("_G")
        .with_fn("print", print)
        .with_fn("type", type_)
        .with_fn("tostring", tostring)
        .with_fn("tonumber", tonumber)
        .with_fn("next", next)
        .with_fn("pairs", pairs)
        .with_fn("ipairs", ipairs)
        .with_fn("setmetatable", setmetatable)
        .with_fn("getmetatable", getmetatable)
        .with_fn("rawget", rawget)
        .with_fn("rawset", rawset)
        .with_fn("rawequal", rawequal)
        .with_fn("rawlen", rawlen)
        .with_fn("assert", assert_)
        .with_fn("error", error)
        .with_fn("pcall", pcall)
        .with_fn("xpcall", xpcall)
        .with_fn("select", select)
        .with_fn("unpack", unpack)
}

fn print(vm: &mut Vm) -> VmResult<usize> {
    let args = vm.args();
    let mut line = String::new();
    for (i, a) in args.into_iter().enumerate() {
        if i > 0 {
            line.push('\t');
        }
        line.push_str(&vm.display_value(a)?);
    }
    println!("{line}");
    Ok(0)
}

fn type_(vm: &mut Vm) -> VmResult<usize> {
    let name = vm.arg(1).type_name();
    let id = vm.intern(name);
    vm.push(Value::Str(id));
    Ok(1)
}

fn tostring(vm: &mut Vm) -> VmResult<usize> {
    let s = vm.display_value(vm.arg(1))?;
    let id = vm.intern(&s);
    vm.push(Value::Str(id));
    Ok(1)
}

/// `tonumber(v [, base])`: base-10 numeric coercion when called with one
/// argument (accepting `Int`/`Float` as-is and parsing decimal strings),
/// base-N string-to-integer parsing when a base is given.
fn tonumber(vm: &mut Vm) -> VmResult<usize> {
    let v = vm.arg(1);
    let base_arg = vm.arg(2);
    if base_arg.is_nil() {
        let result = match v {
            Value::Int(_) | Value::Float(_) => Some(v),
            Value::Str(id) => parse_number(vm.str_value(id)),
            _ => None,
        };
        vm.push(result.unwrap_or(Value::Nil));
        return Ok(1);
    }
    let base = as_int(base_arg).unwrap_or(10);
    let Value::Str(id) = v else {
        vm.push(Value::Nil);
        return Ok(1);
    };
    let text = vm.str_value(id).trim();
    let (neg, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    match i64::from_str_radix(digits, base as u32) {
        Ok(n) => vm.push(Value::Int(if neg { -n } else { n })),
        Err(_) => vm.push(Value::Nil),
    }
    Ok(1)
}

fn parse_number(text: &str) -> Option<Value> {
    let t = text.trim();
    if let Ok(i) = t.parse::<i64>() {
        return Some(Value::Int(i));
    }
    if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16).ok().map(Value::Int);
    }
    t.parse::<f64>().ok().map(Value::Float)
}

/// The stateless iterator behind `pairs`/the `for k,v in next, t do` idiom.
/// Walks the array part first (skipping holes), then the hash part in its
/// underlying (stable-until-mutated) bucket order.
fn next(vm: &mut Vm) -> VmResult<usize> {
    let t = vm.arg(1);
    let key = vm.arg(2);
    let Value::Table(tid) = t else {
        return Err(vm.raise("bad argument #1 to 'next' (table expected)"));
    };
    let array_len = vm.table(tid).array.len();

    let start_in_array = if key.is_nil() {
        Some(0)
    } else if let Value::Int(i) = key.canonicalize() {
        if i >= 1 && (i as usize) <= array_len {
            Some(i as usize)
        } else {
            None
        }
    } else {
        None
    };

    if let Some(start) = start_in_array {
        for idx in start..array_len {
            let v = vm.table(tid).array[idx];
            if !v.is_nil() {
                vm.push(Value::Int((idx + 1) as i64));
                vm.push(v);
                return Ok(2);
            }
        }
        return first_hash_entry(vm, tid);
    }

    let target = ValueKey(key.canonicalize());
    let mut found = false;
    let mut result = None;
    for (k, v) in vm.table(tid).hash.iter() {
        if found {
            result = Some((k.0, *v));
            break;
        }
        if *k == target {
            found = true;
        }
    }
    if !found {
        return Err(vm.raise("invalid key to 'next'"));
    }
    match result {
        Some((k, v)) => {
            vm.push(k);
            vm.push(v);
            Ok(2)
        }
        None => {
            vm.push(Value::Nil);
            Ok(1)
        }
    }
}

fn first_hash_entry(vm: &mut Vm, tid: crate::value::TableId) -> VmResult<usize> {
    if let Some((k, v)) = vm.table(tid).hash.iter().next() {
        let (k, v) = (k.0, *v);
        vm.push(k);
        vm.push(v);
        return Ok(2);
    }
    vm.push(Value::Nil);
    Ok(1)
}

fn pairs(vm: &mut Vm) -> VmResult<usize> {
    let t = vm.arg(1);
    if let Some(mm) = vm.metamethod(&t, "__pairs") {
        let results = vm.call_value(mm, &[t])?;
        let n = results.len();
        for r in results {
            vm.push(r);
        }
        return Ok(n);
    }
    vm.push(Value::Native(next));
    vm.push(t);
    vm.push(Value::Nil);
    Ok(3)
}

fn ipairs(vm: &mut Vm) -> VmResult<usize> {
    let t = vm.arg(1);
    vm.push(Value::Native(inext));
    vm.push(t);
    vm.push(Value::Int(0));
    Ok(3)
}

fn inext(vm: &mut Vm) -> VmResult<usize> {
    let t = vm.arg(1);
    let i = as_int(vm.arg(2)).unwrap_or(0) + 1;
    let v = vm.index_get(t, Value::Int(i))?;
    if v.is_nil() {
        vm.push(Value::Nil);
        return Ok(1);
    }
    vm.push(Value::Int(i));
    vm.push(v);
    Ok(2)
}

fn setmetatable(vm: &mut Vm) -> VmResult<usize> {
    let t = vm.arg(1);
    let mt = vm.arg(2);
    if !matches!(t, Value::Table(_)) {
        return Err(vm.raise("bad argument #1 to 'setmetatable' (table expected)"));
    }
    if vm.metamethod(&t, "__metatable").is_some() {
        return Err(vm.raise("cannot change a protected metatable"));
    }
    match mt {
        Value::Nil => vm.set_metatable(&t, None),
        Value::Table(id) => vm.set_metatable(&t, Some(id)),
        _ => return Err(vm.raise("bad argument #2 to 'setmetatable' (nil or table expected)")),
    }
    vm.push(t);
    Ok(1)
}

fn getmetatable(vm: &mut Vm) -> VmResult<usize> {
    let v = vm.arg(1);
    match vm.get_metatable(&v) {
        Some(mt) => {
            let protected = vm.metamethod(&v, "__metatable");
            vm.push(protected.unwrap_or(Value::Table(mt)));
        }
        None => vm.push(Value::Nil),
    }
    Ok(1)
}

fn rawget(vm: &mut Vm) -> VmResult<usize> {
    let t = super::util::check_table(vm, vm.arg(1), "rawget", 1)?;
    let k = vm.arg(2);
    vm.push(vm.table(t).get(&k));
    Ok(1)
}

fn rawset(vm: &mut Vm) -> VmResult<usize> {
    let t = super::util::check_table(vm, vm.arg(1), "rawset", 1)?;
    let k = vm.arg(2);
    let v = vm.arg(3);
    if k.is_nil() {
        return Err(vm.raise("table index is nil"));
    }
    if let Value::Float(f) = k.canonicalize() {
        if f.is_nan() {
            return Err(vm.raise("table index is NaN"));
        }
    }
    vm.table_mut(t).set(k, v);
    let t_val = vm.arg(1);
    vm.push(t_val);
    Ok(1)
}

fn rawequal(vm: &mut Vm) -> VmResult<usize> {
    let a = ValueKey(vm.arg(1).canonicalize());
    let b = ValueKey(vm.arg(2).canonicalize());
    vm.push(Value::Bool(a == b));
    Ok(1)
}

fn rawlen(vm: &mut Vm) -> VmResult<usize> {
    let v = vm.arg(1);
    let n = match v {
        Value::Table(id) => vm.table(id).length(),
        Value::Str(id) => vm.str_value(id).len() as i64,
        _ => return Err(vm.raise("table or string expected")),
    };
    vm.push(Value::Int(n));
    Ok(1)
}

fn assert_(vm: &mut Vm) -> VmResult<usize> {
    let v = vm.arg(1);
    if !v.is_truthy() {
        let msg = vm.arg(2);
        let msg = if msg.is_nil() {
            "assertion failed!".to_string()
        } else {
            vm.display_value(msg)?
        };
        return Err(vm.raise(msg));
    }
    let args = vm.args();
    let n = args.len();
    for a in args {
        vm.push(a);
    }
    Ok(n)
}

fn error(vm: &mut Vm) -> VmResult<usize> {
    let msg = vm.arg(1);
    let s = match msg {
        Value::Str(id) => vm.str_value(id).to_string(),
        other => vm.display_value(other)?,
    };
    Err(vm.raise(s))
}

fn pcall(vm: &mut Vm) -> VmResult<usize> {
    let args = vm.args();
    let Some((f, rest)) = args.split_first() else {
        return Err(vm.raise("bad argument #1 to 'pcall' (value expected)"));
    };
    match vm.call_value(*f, rest) {
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
            let id = vm.intern(&msg);
            vm.push(Value::Bool(false));
            vm.push(Value::Str(id));
            Ok(2)
        }
    }
}

fn xpcall(vm: &mut Vm) -> VmResult<usize> {
    let args = vm.args();
    if args.len() < 2 {
        return Err(vm.raise("bad argument #2 to 'xpcall' (value expected)"));
    }
    let f = args[0];
    let handler = args[1];
    let rest = &args[2..];
    match vm.call_value(f, rest) {
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
            let id = vm.intern(&msg);
            let handled = vm.call_value(handler, &[Value::Str(id)])?;
            vm.push(Value::Bool(false));
            let n = handled.len();
            for r in handled {
                vm.push(r);
            }
            Ok(1 + n)
        }
    }
}

fn select(vm: &mut Vm) -> VmResult<usize> {
    let sel = vm.arg(1);
    let total = vm.arg_count();
    if let Value::Str(id) = sel {
        if vm.str_value(id) == "#" {
            vm.push(Value::Int(total as i64 - 1));
            return Ok(1);
        }
    }
    let Some(n) = as_int(sel) else {
        return Err(vm.raise("bad argument #1 to 'select' (number expected)"));
    };
    let n = if n < 0 { total as i64 + n } else { n };
    if n < 1 {
        return Err(vm.raise("bad argument #1 to 'select' (index out of range)"));
    }
    let mut count = 0;
    for i in (n as usize + 1)..=total {
        let v = vm.arg(i);
        vm.push(v);
        count += 1;
    }
    Ok(count)
}

fn unpack(vm: &mut Vm) -> VmResult<usize> {
    let t = super::util::check_table(vm, vm.arg(1), "unpack", 1)?;
    let i = super::util::opt_int(vm.arg(2), 1);
    let default_j = vm.table(t).length();
    let j = super::util::opt_int(vm.arg(3), default_j);
    let mut count = 0usize;
    for idx in i..=j {
        let v = vm.table(t).get(&Value::Int(idx));
        vm.push(v);
        count += 1;
    }
    Ok(count)
}
