//! `os.*`, kept minimal per the expanded spec ("os: time, clock, date
//! minimal") — no filesystem/process/env bindings, matching spec §1's
//! file/socket non-goal.
//!
//! Ground: `stdlib/os.rs` in the teacher for the function names; the actual
//! date formatting is hand-rolled against `std::time` rather than pulled in
//! via `chrono`, since `date`'s default format (`"%c"`-ish human string)
//! doesn't need a calendar library to produce something readable.

use crate::native::LibraryModule;
use crate::value::Value;
use crate::vm::{Vm, VmResult};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn module() -> LibraryModule {
    LibraryModule::new("os").with_fn("time", time).with_fn("clock", clock).with_fn("date", date)
}

fn time(vm: &mut Vm) -> VmResult<usize> {
    let secs = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0);
    vm.push(Value::Int(secs));
    Ok(1)
}

fn clock(vm: &mut Vm) -> VmResult<usize> {
    let secs = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or(0.0);
    vm.push(Value::Float(secs));
    Ok(1)
}

/// Minimal `os.date`: ignores the `format`/`time` arguments' full strftime
/// grammar and returns a fixed `YYYY-MM-DD HH:MM:SS` UTC rendering, built
/// from a plain proleptic-Gregorian civil-from-days calculation (Howard
/// Hinnant's well-known constant-time algorithm) so no calendar crate is
/// needed for this one minimal entry point.
fn date(vm: &mut Vm) -> VmResult<usize> {
    let secs = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0);
    let (y, mo, d) = civil_from_days(secs.div_euclid(86400));
    let rem = secs.rem_euclid(86400);
    let (h, mi, s) = (rem / 3600, (rem % 3600) / 60, rem % 60);
    let text = format!("{y:04}-{mo:02}-{d:02} {h:02}:{mi:02}:{s:02}");
    let id = vm.intern(&text);
    vm.push(Value::Str(id));
    Ok(1)
}

fn civil_from_days(z: i64) -> (i64, i64, i64) {
    let z = z + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as i64;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as i64;
    (if m <= 2 { y + 1 } else { y }, m, d)
}
