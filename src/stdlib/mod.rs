//! Standard library modules: `basic`, `string`, `table`, `math`, `os`,
//! `coroutine`. Each exposes a `module()` function returning a
//! [`crate::native::LibraryModule`]; [`open_libs`] is the one-call entry
//! point a host embedder (or [`crate::execute`]) reaches for.
//!
//! Ground: the teacher's `stdlib/*.rs` + `lib_registry.rs::create_standard_registry`.

pub mod basic;
pub mod coroutine;
pub mod math;
pub mod os;
mod pattern;
pub mod string;
pub mod table;
mod util;

use crate::vm::Vm;

pub fn open_libs(vm: &mut Vm) {
    crate::native::install_standard_library(vm);
    math::install_constants(vm);
}
