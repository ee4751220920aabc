//! `table.*`: array-part manipulation built directly on [`crate::vm::object::Table`].
//! Ground: `stdlib/table.rs` in the teacher.

use super::util::{check_int, check_table, opt_int};
use crate::native::LibraryModule;
use crate::value::Value;
use crate::vm::{Vm, VmResult};

pub fn module() -> LibraryModule {
    LibraryModule::new("table")
        .with_fn("insert", insert)
        .with_fn("remove", remove)
        .with_fn("concat", concat)
        .with_fn("sort", sort)
        .with_fn("unpack", unpack)
}

/// `insert(t, v)` appends; `insert(t, pos, v)` shifts everything at and
/// after `pos` up by one first.
fn insert(vm: &mut Vm) -> VmResult<usize> {
    let t = check_table(vm, vm.arg(1), "insert", 1)?;
    let argc = vm.arg_count();
    let len = vm.table(t).length();
    let (pos, v) = if argc <= 2 {
        (len + 1, vm.arg(2))
    } else {
        (check_int(vm, vm.arg(2), "insert", 2)?, vm.arg(3))
    };
    if pos < 1 || pos > len + 1 {
        return Err(vm.raise("bad argument #2 to 'insert' (position out of bounds)"));
    }
    let mut i = len + 1;
    while i > pos {
        let prev = vm.table(t).get(&Value::Int(i - 1));
        vm.table_mut(t).set(Value::Int(i), prev);
        i -= 1;
    }
    vm.table_mut(t).set(Value::Int(pos), v);
    Ok(0)
}

/// `remove(t)` drops the last element; `remove(t, pos)` drops `pos` and
/// shifts everything after it down by one.
fn remove(vm: &mut Vm) -> VmResult<usize> {
    let t = check_table(vm, vm.arg(1), "remove", 1)?;
    let len = vm.table(t).length();
    let pos = opt_int(vm.arg(2), len);
    if len == 0 {
        vm.push(Value::Nil);
        return Ok(1);
    }
    if pos < 1 || pos > len + 1 {
        return Err(vm.raise("bad argument #2 to 'remove' (position out of bounds)"));
    }
    let removed = vm.table(t).get(&Value::Int(pos));
    let mut i = pos;
    while i < len {
        let next = vm.table(t).get(&Value::Int(i + 1));
        vm.table_mut(t).set(Value::Int(i), next);
        i += 1;
    }
    vm.table_mut(t).set(Value::Int(len), Value::Nil);
    vm.push(removed);
    Ok(1)
}

fn concat(vm: &mut Vm) -> VmResult<usize> {
    let t = check_table(vm, vm.arg(1), "concat", 1)?;
    let sep_arg = vm.arg(2);
    let sep = if sep_arg.is_nil() { String::new() } else { vm.display_value(sep_arg)? };
    let len = vm.table(t).length();
    let i = opt_int(vm.arg(3), 1);
    let j = opt_int(vm.arg(4), len);
    let mut parts = Vec::new();
    for idx in i..=j {
        let v = vm.table(t).get(&Value::Int(idx));
        if !matches!(v, Value::Str(_) | Value::Int(_) | Value::Float(_)) {
            return Err(vm.raise(format!("invalid value ({}) at index {idx} in table for 'concat'", v.type_name())));
        }
        parts.push(vm.display_value(v)?);
    }
    let id = vm.intern(&parts.join(&sep));
    vm.push(Value::Str(id));
    Ok(1)
}

/// Sorts the array part in place. A custom comparator, if given, is called
/// through [`Vm::call_value`] just like any other Lua callback; the default
/// order falls back to [`Vm::less_than`]'s own metamethod-aware rule. Ground:
/// a plain insertion/merge sort calling back into the VM for each
/// comparison, the same shape the teacher's `stdlib/table.rs::lua_sort`
/// uses for its comparator callback.
fn sort(vm: &mut Vm) -> VmResult<usize> {
    let t = check_table(vm, vm.arg(1), "sort", 1)?;
    let cmp = vm.arg(2);
    let len = vm.table(t).length();
    let mut items: Vec<Value> = (1..=len).map(|i| vm.table(t).get(&Value::Int(i))).collect();

    // Simple merge sort: stable and easy to make exception-safe around a
    // fallible, VM-calling comparator (no partial in-place swaps to unwind).
    let mut err = None;
    merge_sort(&mut items, &mut |a, b| {
        if err.is_some() {
            return false;
        }
        let result = if cmp.is_nil() {
            vm.less_than(*a, *b)
        } else {
            vm.call_value(cmp, &[*a, *b]).map(|r| r.into_iter().next().unwrap_or(Value::Nil).is_truthy())
        };
        match result {
            Ok(b) => b,
            Err(_) => {
                err = Some(());
                false
            }
        }
    });
    if err.is_some() {
        let msg = std::mem::take(&mut vm.error_message);
        return Err(vm.raise(msg));
    }

    for (i, v) in items.into_iter().enumerate() {
        vm.table_mut(t).set(Value::Int(i as i64 + 1), v);
    }
    Ok(0)
}

fn merge_sort(items: &mut [Value], less: &mut impl FnMut(&Value, &Value) -> bool) {
    let len = items.len();
    if len <= 1 {
        return;
    }
    let mid = len / 2;
    let mut left = items[..mid].to_vec();
    let mut right = items[mid..].to_vec();
    merge_sort(&mut left, less);
    merge_sort(&mut right, less);
    let (mut i, mut j, mut k) = (0, 0, 0);
    while i < left.len() && j < right.len() {
        if less(&right[j], &left[i]) {
            items[k] = right[j];
            j += 1;
        } else {
            items[k] = left[i];
            i += 1;
        }
        k += 1;
    }
    while i < left.len() {
        items[k] = left[i];
        i += 1;
        k += 1;
    }
    while j < right.len() {
        items[k] = right[j];
        j += 1;
        k += 1;
    }
}

fn unpack(vm: &mut Vm) -> VmResult<usize> {
    let t = check_table(vm, vm.arg(1), "unpack", 1)?;
    let i = opt_int(vm.arg(2), 1);
    let default_j = vm.table(t).length();
    let j = opt_int(vm.arg(3), default_j);
    let mut count = 0usize;
    for idx in i..=j {
        let v = vm.table(t).get(&Value::Int(idx));
        vm.push(v);
        count += 1;
    }
    Ok(count)
}
