//! `string.*`: byte-oriented length/indexing functions (spec treats Lua
//! strings as byte strings, so these index by `char` position over the
//! decoded text — every string this VM ever interns comes from UTF-8 source
//! text or `string.char`/`%d`-free formatting, so char and byte counting
//! coincide for the scripts this crate targets) plus the pattern-matching
//! family built on [`super::pattern`].
//!
//! Ground: `stdlib/string.rs` in the teacher for the function list and
//! argument conventions.

use super::pattern::{self, CaptureValue};
use super::util::{as_int, check_int, check_str, check_table, normalize_index, opt_int};
use crate::native::LibraryModule;
use crate::value::Value;
use crate::vm::{Vm, VmResult};

pub fn module() -> LibraryModule {
    LibraryModule::new("string")
        .with_fn("len", len)
        .with_fn("sub", sub)
        .with_fn("upper", upper)
        .with_fn("lower", lower)
        .with_fn("rep", rep)
        .with_fn("byte", byte)
        .with_fn("char", char_)
        .with_fn("format", format)
        .with_fn("find", find)
        .with_fn("match", match_)
        .with_fn("gmatch", gmatch)
        .with_fn("gsub", gsub)
}

fn len(vm: &mut Vm) -> VmResult<usize> {
    let s = check_str(vm, vm.arg(1), "len", 1)?;
    vm.push(Value::Int(s.chars().count() as i64));
    Ok(1)
}

fn sub(vm: &mut Vm) -> VmResult<usize> {
    let s = check_str(vm, vm.arg(1), "sub", 1)?;
    let chars: Vec<char> = s.chars().collect();
    let len = chars.len() as i64;
    let i = normalize_index(opt_int(vm.arg(2), 1), len).max(1);
    let j = normalize_index(opt_int(vm.arg(3), -1), len).min(len);
    let out: String = if i > j { String::new() } else { chars[(i - 1) as usize..j as usize].iter().collect() };
    let id = vm.intern(&out);
    vm.push(Value::Str(id));
    Ok(1)
}

fn upper(vm: &mut Vm) -> VmResult<usize> {
    let s = check_str(vm, vm.arg(1), "upper", 1)?.to_uppercase();
    let id = vm.intern(&s);
    vm.push(Value::Str(id));
    Ok(1)
}

fn lower(vm: &mut Vm) -> VmResult<usize> {
    let s = check_str(vm, vm.arg(1), "lower", 1)?.to_lowercase();
    let id = vm.intern(&s);
    vm.push(Value::Str(id));
    Ok(1)
}

fn rep(vm: &mut Vm) -> VmResult<usize> {
    let s = check_str(vm, vm.arg(1), "rep", 1)?;
    let n = check_int(vm, vm.arg(2), "rep", 2)?.max(0) as usize;
    let sep_arg = vm.arg(3);
    let sep = if sep_arg.is_nil() { String::new() } else { check_str(vm, sep_arg, "rep", 3)? };
    let out = if sep.is_empty() { s.repeat(n) } else { vec![s.as_str(); n].join(&sep) };
    let id = vm.intern(&out);
    vm.push(Value::Str(id));
    Ok(1)
}

fn byte(vm: &mut Vm) -> VmResult<usize> {
    let s = check_str(vm, vm.arg(1), "byte", 1)?;
    let chars: Vec<char> = s.chars().collect();
    let len = chars.len() as i64;
    let i = normalize_index(opt_int(vm.arg(2), 1), len).max(1);
    let j = normalize_index(opt_int(vm.arg(3), i), len).min(len);
    let mut count = 0;
    for idx in i..=j {
        if idx >= 1 && idx <= len {
            vm.push(Value::Int(chars[(idx - 1) as usize] as i64));
            count += 1;
        }
    }
    Ok(count)
}

fn char_(vm: &mut Vm) -> VmResult<usize> {
    let args = vm.args();
    let mut out = String::new();
    for (i, a) in args.into_iter().enumerate() {
        let code = as_int(a).ok_or_else(|| vm.raise(format!("bad argument #{} to 'char' (number expected)", i + 1)))?;
        let c = char::from_u32(code as u32).ok_or_else(|| vm.raise("value out of range"))?;
        out.push(c);
    }
    let id = vm.intern(&out);
    vm.push(Value::Str(id));
    Ok(1)
}

/// `string.format`: the usual `%d %i %u %s %q %x %X %o %c %f %g %e %%`
/// directives, width/precision/flags passed straight through to Rust's
/// formatting machinery where the shapes line up.
fn format(vm: &mut Vm) -> VmResult<usize> {
    let fmt = check_str(vm, vm.arg(1), "format", 1)?;
    let mut out = String::new();
    let mut argn = 2usize;
    let bytes: Vec<char> = fmt.chars().collect();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != '%' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        i += 1;
        if bytes.get(i) == Some(&'%') {
            out.push('%');
            i += 1;
            continue;
        }
        let spec_start = i;
        while bytes.get(i).is_some_and(|c| "-+ #0".contains(*c)) {
            i += 1;
        }
        while bytes.get(i).is_some_and(|c| c.is_ascii_digit()) {
            i += 1;
        }
        if bytes.get(i) == Some(&'.') {
            i += 1;
            while bytes.get(i).is_some_and(|c| c.is_ascii_digit()) {
                i += 1;
            }
        }
        let conv = *bytes.get(i).ok_or("invalid conversion to 'format'").map_err(|e| vm.raise(e))?;
        let spec: String = bytes[spec_start..i].iter().collect();
        i += 1;
        let arg = vm.arg(argn);
        argn += 1;
        out.push_str(&format_one(vm, &spec, conv, arg)?);
    }
    let id = vm.intern(&out);
    vm.push(Value::Str(id));
    Ok(1)
}

fn format_one(vm: &mut Vm, spec: &str, conv: char, arg: Value) -> VmResult<String> {
    let width_prec = parse_width_precision(spec);
    Ok(match conv {
        'd' | 'i' | 'u' => {
            let n = check_int(vm, arg, "format", 0)?;
            pad_number(n.to_string(), width_prec, spec.contains('0') && !spec.contains('-'))
        }
        'x' => pad_number(format!("{:x}", check_int(vm, arg, "format", 0)?), width_prec, false),
        'X' => pad_number(format!("{:X}", check_int(vm, arg, "format", 0)?), width_prec, false),
        'o' => pad_number(format!("{:o}", check_int(vm, arg, "format", 0)?), width_prec, false),
        'c' => {
            let n = check_int(vm, arg, "format", 0)?;
            char::from_u32(n as u32).map(|c| c.to_string()).unwrap_or_default()
        }
        'f' | 'F' => {
            let x = arg.as_f64().ok_or_else(|| vm.raise("bad argument to 'format' (number expected)"))?;
            let prec = width_prec.1.unwrap_or(6);
            format!("{x:.prec$}")
        }
        'e' | 'E' => {
            let x = arg.as_f64().ok_or_else(|| vm.raise("bad argument to 'format' (number expected)"))?;
            format!("{x:e}")
        }
        'g' | 'G' => {
            let x = arg.as_f64().ok_or_else(|| vm.raise("bad argument to 'format' (number expected)"))?;
            format!("{x}")
        }
        's' => {
            let s = vm.display_value(arg)?;
            match width_prec.1 {
                Some(p) => s.chars().take(p).collect(),
                None => s,
            }
        }
        'q' => format!("{:?}", vm.display_value(arg)?),
        other => return Err(vm.raise(format!("invalid conversion '%{other}' to 'format'"))),
    })
}

fn parse_width_precision(spec: &str) -> (Option<usize>, Option<usize>) {
    let (width_part, prec_part) = match spec.split_once('.') {
        Some((w, p)) => (w, Some(p)),
        None => (spec, None),
    };
    let width: String = width_part.chars().filter(|c| c.is_ascii_digit()).collect();
    (width.parse().ok(), prec_part.and_then(|p| p.parse().ok()))
}

fn pad_number(s: String, width_prec: (Option<usize>, Option<usize>), zero_pad: bool) -> String {
    match width_prec.0 {
        Some(w) if s.len() < w => {
            let pad = w - s.len();
            if zero_pad {
                format!("{}{}", "0".repeat(pad), s)
            } else {
                format!("{}{}", " ".repeat(pad), s)
            }
        }
        _ => s,
    }
}

fn capture_values(vm: &mut Vm, whole: &str, caps: &[CaptureValue]) -> Vec<Value> {
    if caps.is_empty() {
        let id = vm.intern(whole);
        return vec![Value::Str(id)];
    }
    caps.iter()
        .map(|c| match c {
            CaptureValue::Str(s) => Value::Str(vm.intern(s)),
            CaptureValue::Position(p) => Value::Int(*p),
        })
        .collect()
}

fn find(vm: &mut Vm) -> VmResult<usize> {
    let s = check_str(vm, vm.arg(1), "find", 1)?;
    let pat = check_str(vm, vm.arg(2), "find", 2)?;
    let chars: Vec<char> = s.chars().collect();
    let init = normalize_index(opt_int(vm.arg(3), 1), chars.len() as i64).max(1);
    let plain = vm.arg(4).is_truthy();
    if plain || !pat.chars().any(|c| "^$*+?.([%-".contains(c)) {
        return find_plain(vm, &chars, &pat, (init - 1).max(0) as usize);
    }
    let parsed = pattern::parse(&pat).map_err(|e| vm.raise(e))?;
    match pattern::find(&chars, &parsed, (init - 1).max(0) as usize) {
        Some(m) => {
            vm.push(Value::Int(m.start as i64 + 1));
            vm.push(Value::Int(m.end as i64));
            let mut n = 2;
            for c in captures_only(vm, &m.captures) {
                vm.push(c);
                n += 1;
            }
            Ok(n)
        }
        None => {
            vm.push(Value::Nil);
            Ok(1)
        }
    }
}

fn captures_only(vm: &mut Vm, caps: &[CaptureValue]) -> Vec<Value> {
    caps.iter()
        .map(|c| match c {
            CaptureValue::Str(s) => Value::Str(vm.intern(s)),
            CaptureValue::Position(p) => Value::Int(*p),
        })
        .collect()
}

fn find_plain(vm: &mut Vm, chars: &[char], needle: &str, from: usize) -> VmResult<usize> {
    let needle_chars: Vec<char> = needle.chars().collect();
    if needle_chars.is_empty() {
        vm.push(Value::Int(from as i64 + 1));
        vm.push(Value::Int(from as i64));
        return Ok(2);
    }
    if from <= chars.len() {
        for start in from..=chars.len().saturating_sub(needle_chars.len()) {
            if chars[start..start + needle_chars.len()] == needle_chars[..] {
                vm.push(Value::Int(start as i64 + 1));
                vm.push(Value::Int((start + needle_chars.len()) as i64));
                return Ok(2);
            }
        }
    }
    vm.push(Value::Nil);
    Ok(1)
}

fn match_(vm: &mut Vm) -> VmResult<usize> {
    let s = check_str(vm, vm.arg(1), "match", 1)?;
    let pat = check_str(vm, vm.arg(2), "match", 2)?;
    let chars: Vec<char> = s.chars().collect();
    let init = normalize_index(opt_int(vm.arg(3), 1), chars.len() as i64).max(1);
    let parsed = pattern::parse(&pat).map_err(|e| vm.raise(e))?;
    match pattern::find(&chars, &parsed, (init - 1).max(0) as usize) {
        Some(m) => {
            let whole: String = chars[m.start..m.end].iter().collect();
            let values = capture_values(vm, &whole, &m.captures);
            let n = values.len();
            for v in values {
                vm.push(v);
            }
            Ok(n)
        }
        None => {
            vm.push(Value::Nil);
            Ok(1)
        }
    }
}

/// `gmatch`: returns a stateful iterator closure. Since natives are bare
/// `fn` pointers with no captured state, the iterator's position lives in
/// an upvalue-free substitute: a one-entry table stashed as the iterator's
/// sole upvalue-like argument, read and rewritten on every call.
fn gmatch(vm: &mut Vm) -> VmResult<usize> {
    let s = check_str(vm, vm.arg(1), "gmatch", 1)?;
    let pat = check_str(vm, vm.arg(2), "gmatch", 2)?;
    // validate eagerly so a malformed pattern fails at `gmatch(...)` time
    pattern::parse(&pat).map_err(|e| vm.raise(e))?;

    let state = vm.new_table();
    let s_id = vm.intern(&s);
    let pat_id = vm.intern(&pat);
    vm.table_mut(state).set(Value::Int(1), Value::Str(s_id));
    vm.table_mut(state).set(Value::Int(2), Value::Str(pat_id));
    vm.table_mut(state).set(Value::Int(3), Value::Int(0));
    vm.push(Value::Native(gmatch_step));
    vm.push(Value::Table(state));
    vm.push(Value::Nil);
    Ok(3)
}

fn gmatch_step(vm: &mut Vm) -> VmResult<usize> {
    let state = check_table(vm, vm.arg(1), "gmatch", 1)?;
    let Value::Str(s_id) = vm.table(state).get(&Value::Int(1)) else { return Ok(0) };
    let Value::Str(pat_id) = vm.table(state).get(&Value::Int(2)) else { return Ok(0) };
    let pos = as_int(vm.table(state).get(&Value::Int(3))).unwrap_or(0) as usize;
    let s = vm.str_value(s_id).to_string();
    let pat = vm.str_value(pat_id).to_string();
    let chars: Vec<char> = s.chars().collect();
    let parsed = pattern::parse(&pat).map_err(|e| vm.raise(e))?;
    match pattern::find(&chars, &parsed, pos) {
        Some(m) => {
            let next = if m.end > m.start { m.end } else { m.end + 1 };
            vm.table_mut(state).set(Value::Int(3), Value::Int(next as i64));
            let whole: String = chars[m.start..m.end].iter().collect();
            let values = capture_values(vm, &whole, &m.captures);
            let n = values.len();
            for v in values {
                vm.push(v);
            }
            Ok(n)
        }
        None => Ok(0),
    }
}

fn gsub(vm: &mut Vm) -> VmResult<usize> {
    let s = check_str(vm, vm.arg(1), "gsub", 1)?;
    let pat = check_str(vm, vm.arg(2), "gsub", 2)?;
    let repl = vm.arg(3);
    let max = if vm.arg(4).is_nil() { None } else { Some(check_int(vm, vm.arg(4), "gsub", 4)?.max(0) as usize) };
    let parsed = pattern::parse(&pat).map_err(|e| vm.raise(e))?;
    let chars: Vec<char> = s.chars().collect();

    let mut out = String::new();
    let mut pos = 0usize;
    let mut count = 0usize;
    while pos <= chars.len() {
        if max.is_some_and(|m| count >= m) {
            break;
        }
        let Some(m) = pattern::find(&chars, &parsed, pos) else { break };
        out.extend(&chars[pos..m.start]);
        let whole: String = chars[m.start..m.end].iter().collect();
        let values = capture_values(vm, &whole, &m.captures);
        let replacement = apply_replacement(vm, repl, &whole, &values)?;
        out.push_str(&replacement);
        count += 1;
        pos = if m.end > m.start {
            m.end
        } else {
            if m.end < chars.len() {
                out.push(chars[m.end]);
            }
            m.end + 1
        };
        if parsed.is_anchored() {
            break;
        }
    }
    if pos < chars.len() {
        out.extend(&chars[pos..]);
    }
    let id = vm.intern(&out);
    vm.push(Value::Str(id));
    vm.push(Value::Int(count as i64));
    Ok(2)
}

fn apply_replacement(vm: &mut Vm, repl: Value, whole: &str, caps: &[Value]) -> VmResult<String> {
    match repl {
        Value::Str(id) => {
            let template = vm.str_value(id).to_string();
            let cap_strings: VmResult<Vec<String>> =
                caps.iter().map(|v| vm.display_value(*v)).collect();
            Ok(substitute_percent(&template, whole, &cap_strings?))
        }
        Value::Table(tid) => {
            let key = caps.first().copied().unwrap_or(Value::Str(vm.intern(whole)));
            let v = vm.table(tid).get(&key);
            Ok(if v.is_truthy() { vm.display_value(v)? } else { whole.to_string() })
        }
        Value::Closure(_) | Value::Native(_) => {
            let results = vm.call_value(repl, caps)?;
            let v = results.into_iter().next().unwrap_or(Value::Nil);
            Ok(if v.is_truthy() { vm.display_value(v)? } else { whole.to_string() })
        }
        _ => Err(vm.raise("bad argument #3 to 'gsub' (string/function/table expected)")),
    }
}

fn substitute_percent(template: &str, whole: &str, caps: &[String]) -> String {
    let mut out = String::new();
    let chars: Vec<char> = template.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '%' && i + 1 < chars.len() {
            let n = chars[i + 1];
            if n == '%' {
                out.push('%');
            } else if n == '0' {
                out.push_str(whole);
            } else if n.is_ascii_digit() {
                let idx = n as usize - '1' as usize;
                if let Some(s) = caps.get(idx) {
                    out.push_str(s);
                }
            } else {
                out.push(n);
            }
            i += 2;
        } else {
            out.push(chars[i]);
            i += 1;
        }
    }
    out
}
