//! Small cross-module helpers shared by the standard library bindings:
//! argument coercion and the negative-index normalization every `string`/
//! `table` function built on 1-based indices needs.

use crate::value::{StringId, TableId, Value};
use crate::vm::{Vm, VmResult};

pub(crate) fn as_int(v: Value) -> Option<i64> {
    match v.canonicalize() {
        Value::Int(i) => Some(i),
        Value::Float(f) if f.is_finite() => Some(f as i64),
        _ => None,
    }
}

pub(crate) fn opt_int(v: Value, default: i64) -> i64 {
    if v.is_nil() {
        default
    } else {
        as_int(v).unwrap_or(default)
    }
}

pub(crate) fn check_table(vm: &mut Vm, v: Value, fname: &str, argn: usize) -> VmResult<TableId> {
    match v {
        Value::Table(id) => Ok(id),
        other => Err(vm.raise(format!(
            "bad argument #{argn} to '{fname}' (table expected, got {})",
            other.type_name()
        ))),
    }
}

/// Strings and numbers are both acceptable wherever the string library wants
/// a string argument (real Lua auto-coerces numbers to their string form).
pub(crate) fn check_str(vm: &mut Vm, v: Value, fname: &str, argn: usize) -> VmResult<String> {
    match v {
        Value::Str(id) => Ok(vm.str_value(id).to_string()),
        Value::Int(i) => Ok(i.to_string()),
        Value::Float(_) => Ok(vm.display_value(v)?),
        other => Err(vm.raise(format!(
            "bad argument #{argn} to '{fname}' (string expected, got {})",
            other.type_name()
        ))),
    }
}

pub(crate) fn check_int(vm: &mut Vm, v: Value, fname: &str, argn: usize) -> VmResult<i64> {
    as_int(v).ok_or_else(|| vm.raise(format!("bad argument #{argn} to '{fname}' (number expected, got {})", v.type_name())))
}

pub(crate) fn intern(vm: &mut Vm, s: &str) -> StringId {
    vm.intern(s)
}

/// Clamps a 1-based, possibly-negative Lua string/table index (where `-1`
/// means "last element") to `1..=len`, the way `string.sub`/`string.byte`
/// both define their bounds.
pub(crate) fn normalize_index(i: i64, len: i64) -> i64 {
    if i < 0 {
        (len + i + 1).max(0)
    } else {
        i
    }
}
