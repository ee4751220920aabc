//! `math.*`: constants, unary/binary numeric functions, and `random`/
//! `randomseed` backed directly by [`Vm::next_random`]/[`Vm::seed_random`]
//! (spec §9: "make the RNG an instance field of the VM").
//!
//! Ground: `stdlib/math.rs` in the teacher for the function list.

use super::util::{as_int, check_int};
use crate::native::LibraryModule;
use crate::value::Value;
use crate::vm::{Vm, VmResult};

pub fn module() -> LibraryModule {
    crate::lib_module!("math", {
        "abs" => abs,
        "ceil" => ceil,
        "floor" => floor,
        "sqrt" => sqrt,
        "sin" => sin,
        "cos" => cos,
        "tan" => tan,
        "exp" => exp,
        "log" => log,
        "pow" => pow,
        "fmod" => fmod,
        "modf" => modf,
        "max" => max,
        "min" => min,
        "random" => random,
        "randomseed" => randomseed,
        "tointeger" => tointeger,
        "type" => mtype,
    })
}

/// `LibraryModule` only carries functions (native constant *values* have no
/// `NativeFn` shape), so the handful of numeric constants `math` exposes
/// are set directly on its table once [`super::open_libs`] has installed it.
pub fn install_constants(vm: &mut Vm) {
    let name = vm.intern("math");
    let Value::Table(t) = vm.table(vm.globals()).get(&Value::Str(name)) else { return };
    let entries = [
        ("pi", Value::Float(std::f64::consts::PI)),
        ("huge", Value::Float(f64::INFINITY)),
        ("maxinteger", Value::Int(i64::MAX)),
        ("mininteger", Value::Int(i64::MIN)),
    ];
    for (k, v) in entries {
        let key = vm.intern(k);
        vm.table_mut(t).set(Value::Str(key), v);
    }
}

fn arg_f64(vm: &mut Vm, i: usize, fname: &str) -> VmResult<f64> {
    vm.arg(i).as_f64().ok_or_else(|| vm.raise(format!("bad argument #{i} to '{fname}' (number expected)")))
}

fn abs(vm: &mut Vm) -> VmResult<usize> {
    match vm.arg(1) {
        Value::Int(i) => vm.push(Value::Int(i.wrapping_abs())),
        other => vm.push(Value::Float(arg_f64_val(other, vm, "abs")?.abs())),
    }
    Ok(1)
}

fn arg_f64_val(v: Value, vm: &mut Vm, fname: &str) -> VmResult<f64> {
    v.as_f64().ok_or_else(|| vm.raise(format!("bad argument #1 to '{fname}' (number expected)")))
}

fn ceil(vm: &mut Vm) -> VmResult<usize> {
    if let Value::Int(i) = vm.arg(1) {
        vm.push(Value::Int(i));
    } else {
        vm.push(Value::Int(arg_f64(vm, 1, "ceil")?.ceil() as i64));
    }
    Ok(1)
}

fn floor(vm: &mut Vm) -> VmResult<usize> {
    if let Value::Int(i) = vm.arg(1) {
        vm.push(Value::Int(i));
    } else {
        vm.push(Value::Int(arg_f64(vm, 1, "floor")?.floor() as i64));
    }
    Ok(1)
}

fn sqrt(vm: &mut Vm) -> VmResult<usize> {
    vm.push(Value::Float(arg_f64(vm, 1, "sqrt")?.sqrt()));
    Ok(1)
}

fn sin(vm: &mut Vm) -> VmResult<usize> {
    vm.push(Value::Float(arg_f64(vm, 1, "sin")?.sin()));
    Ok(1)
}

fn cos(vm: &mut Vm) -> VmResult<usize> {
    vm.push(Value::Float(arg_f64(vm, 1, "cos")?.cos()));
    Ok(1)
}

fn tan(vm: &mut Vm) -> VmResult<usize> {
    vm.push(Value::Float(arg_f64(vm, 1, "tan")?.tan()));
    Ok(1)
}

fn exp(vm: &mut Vm) -> VmResult<usize> {
    vm.push(Value::Float(arg_f64(vm, 1, "exp")?.exp()));
    Ok(1)
}

fn log(vm: &mut Vm) -> VmResult<usize> {
    let x = arg_f64(vm, 1, "log")?;
    let result = if vm.arg(2).is_nil() { x.ln() } else { x.log(arg_f64(vm, 2, "log")?) };
    vm.push(Value::Float(result));
    Ok(1)
}

fn pow(vm: &mut Vm) -> VmResult<usize> {
    let x = arg_f64(vm, 1, "pow")?;
    let y = arg_f64(vm, 2, "pow")?;
    vm.push(Value::Float(x.powf(y)));
    Ok(1)
}

fn fmod(vm: &mut Vm) -> VmResult<usize> {
    if let (Value::Int(a), Value::Int(b)) = (vm.arg(1), vm.arg(2)) {
        if b == 0 {
            return Err(vm.raise("bad argument #2 to 'fmod' (zero)"));
        }
        vm.push(Value::Int(a.wrapping_rem(b)));
    } else {
        let a = arg_f64(vm, 1, "fmod")?;
        let b = arg_f64(vm, 2, "fmod")?;
        vm.push(Value::Float(a % b));
    }
    Ok(1)
}

fn modf(vm: &mut Vm) -> VmResult<usize> {
    let x = arg_f64(vm, 1, "modf")?;
    vm.push(Value::Float(x.trunc()));
    vm.push(Value::Float(x.fract()));
    Ok(2)
}

fn max(vm: &mut Vm) -> VmResult<usize> {
    let args = vm.args();
    if args.is_empty() {
        return Err(vm.raise("bad argument #1 to 'max' (value expected)"));
    }
    let mut best = args[0];
    for &v in &args[1..] {
        if vm.less_than(best, v)? {
            best = v;
        }
    }
    vm.push(best);
    Ok(1)
}

fn min(vm: &mut Vm) -> VmResult<usize> {
    let args = vm.args();
    if args.is_empty() {
        return Err(vm.raise("bad argument #1 to 'min' (value expected)"));
    }
    let mut best = args[0];
    for &v in &args[1..] {
        if vm.less_than(v, best)? {
            best = v;
        }
    }
    vm.push(best);
    Ok(1)
}

/// `random()` -> float in `[0,1)`; `random(m)` -> integer in `[1,m]`;
/// `random(m,n)` -> integer in `[m,n]`.
fn random(vm: &mut Vm) -> VmResult<usize> {
    let argc = vm.arg_count();
    if argc == 0 {
        let bits = vm.next_random();
        vm.push(Value::Float((bits >> 11) as f64 / (1u64 << 53) as f64));
        return Ok(1);
    }
    let (lo, hi) = if argc == 1 {
        (1, check_int(vm, vm.arg(1), "random", 1)?)
    } else {
        (check_int(vm, vm.arg(1), "random", 1)?, check_int(vm, vm.arg(2), "random", 2)?)
    };
    if lo > hi {
        return Err(vm.raise("bad argument #2 to 'random' (interval is empty)"));
    }
    let span = (hi - lo + 1) as u64;
    let n = lo + (vm.next_random() % span) as i64;
    vm.push(Value::Int(n));
    Ok(1)
}

fn randomseed(vm: &mut Vm) -> VmResult<usize> {
    let seed = as_int(vm.arg(1)).unwrap_or(0) as u64;
    vm.seed_random(seed);
    Ok(0)
}

fn tointeger(vm: &mut Vm) -> VmResult<usize> {
    vm.push(as_int(vm.arg(1)).map(Value::Int).unwrap_or(Value::Nil));
    Ok(1)
}

fn mtype(vm: &mut Vm) -> VmResult<usize> {
    let name = match vm.arg(1) {
        Value::Int(_) => Some("integer"),
        Value::Float(_) => Some("float"),
        _ => None,
    };
    match name {
        Some(n) => {
            let id = vm.intern(n);
            vm.push(Value::Str(id));
        }
        None => vm.push(Value::Nil),
    }
    Ok(1)
}
