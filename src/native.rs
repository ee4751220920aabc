//! Standard-library registration: a declarative list of named native
//! functions per module, installed as global tables (or directly into
//! `_G` for the `basic` module).
//!
//! Ground: the teacher's `lib_registry.rs` `LibraryModule`/`LibraryRegistry`
//! builder pattern, trimmed to this crate's needs — no `ValueInitializer`/
//! `ModuleInitializer` hooks or `package.loaded` bookkeeping, since this
//! spec has no `require`.

use crate::value::{NativeFn, Value};
use crate::vm::Vm;

/// One named native function, ready to install into a table.
pub struct LibraryModule {
    pub name: &'static str,
    pub entries: Vec<(&'static str, NativeFn)>,
}

impl LibraryModule {
    pub fn new(name: &'static str) -> Self {
        LibraryModule { name, entries: Vec::new() }
    }

    pub fn with_fn(mut self, name: &'static str, f: NativeFn) -> Self {
        self.entries.push((name, f));
        self
    }
}

/// Builds a `LibraryModule` from a name and a brace-delimited list of
/// `"name" => function` pairs — the teacher's `lib_module!` macro, minus
/// the `LibraryEntry::Value` arm this crate never needs. Used by
/// [`crate::stdlib::math::module`]; the other stdlib modules build theirs
/// with the plain `.with_fn()` chain instead, which reads better once a
/// module's functions stop being a flat list (`string`'s pattern-class
/// helpers, `coroutine`'s glue-compiled `wrap`).
#[macro_export]
macro_rules! lib_module {
    ($name:expr, { $($item_name:expr => $item:expr),* $(,)? }) => {{
        let mut module = $crate::native::LibraryModule::new($name);
        $(
            module.entries.push(($item_name, $item));
        )*
        module
    }};
}

/// Installs every registered module: `basic`'s entries go straight into
/// `_G`, everything else gets its own global table.
pub fn install_standard_library(vm: &mut Vm) {
    for module in standard_modules() {
        install_module(vm, &module);
    }
}

fn install_module(vm: &mut Vm, module: &LibraryModule) {
    if module.name == "_G" {
        for (name, f) in &module.entries {
            let key = vm.intern(name);
            vm.table_mut(vm.globals()).set(Value::Str(key), Value::Native(*f));
        }
        return;
    }
    let table = vm.new_table();
    for (name, f) in &module.entries {
        let key = vm.intern(name);
        vm.table_mut(table).set(Value::Str(key), Value::Native(*f));
    }
    let name_key = vm.intern(module.name);
    vm.table_mut(vm.globals()).set(Value::Str(name_key), Value::Table(table));
}

fn standard_modules() -> Vec<LibraryModule> {
    vec![
        crate::stdlib::basic::module(),
        crate::stdlib::string::module(),
        crate::stdlib::table::module(),
        crate::stdlib::math::module(),
        crate::stdlib::os::module(),
        crate::stdlib::coroutine::module(),
    ]
}
