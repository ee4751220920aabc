//! End-to-end tests against the public `luma::execute` entry point, one
//! per testable property in the spec's "language-level invariants" and
//! "round-trip/idempotence" sections.

use luma::Value;

fn run(src: &str) -> Vec<Value> {
    luma::execute(src).unwrap_or_else(|e| panic!("{src}\n -> {e}"))
}

fn run_err(src: &str) -> String {
    luma::execute(src).unwrap_err().message
}

#[test]
fn arithmetic_canonicalizes_integers() {
    assert_eq!(run("return 1 + 2"), vec![Value::Int(3)]);
    assert_eq!(run("return 4 / 4"), vec![Value::Int(1)]);
    assert_eq!(run("return 1 / 2"), vec![Value::Float(0.5)]);
}

#[test]
fn equality_is_tag_and_payload_for_scalars_and_identity_for_tables() {
    assert_eq!(run("return 1 == 1.0"), vec![Value::Bool(true)]);
    assert_eq!(run("return 'a' == 'a'"), vec![Value::Bool(true)]);
    assert_eq!(run("return {} == {}"), vec![Value::Bool(false)]);
    assert_eq!(run("local t = {}\nreturn t == t"), vec![Value::Bool(true)]);
}

#[test]
fn table_constructor_captures_every_result_of_a_trailing_call() {
    let results = run(
        "local function three() return 1, 2, 3 end
         local t = { three() }
         return #t",
    );
    assert_eq!(results, vec![Value::Int(3)]);
}

#[test]
fn multiple_assignment_pads_with_nil_and_discards_extras() {
    let results = run(
        "local function two() return 1, 2 end
         local a, b, c = two()
         local d, e = 1, 2, 3
         return a, b, c, d, e",
    );
    assert_eq!(results, vec![Value::Int(1), Value::Int(2), Value::Nil, Value::Int(1), Value::Int(2)]);
}

#[test]
fn closures_sharing_an_upvalue_observe_each_others_writes() {
    let results = run(
        "local function make_counter()
             local x = 0
             return function()
                 x = x + 1
                 return x
             end
         end
         local counter = make_counter()
         return counter(), counter(), counter()",
    );
    assert_eq!(results, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
}

#[test]
fn closed_upvalue_survives_the_stack_frame_that_created_it() {
    let results = run(
        "local fns = {}
         for i = 1, 3 do
             local v = i * 10
             fns[i] = function() return v end
         end
         return fns[1](), fns[2](), fns[3]()",
    );
    assert_eq!(results, vec![Value::Int(10), Value::Int(20), Value::Int(30)]);
}

#[test]
fn deep_tail_calls_do_not_grow_the_frame_stack() {
    let results = run(
        "local function loop(n, acc)
             if n == 0 then return acc end
             return loop(n - 1, acc + 1)
         end
         return loop(200000, 0)",
    );
    assert_eq!(results, vec![Value::Int(200000)]);
}

#[test]
fn metatable_index_chain_resolves_through_a_fallback_table() {
    let results = run(
        "local base = { greet = function() return 'hi' end }
         local derived = setmetatable({}, { __index = base })
         return derived.greet() == 'hi'",
    );
    assert_eq!(results, vec![Value::Bool(true)]);
}

#[test]
fn coroutine_producer_consumer_round_trips_values_through_yield() {
    let results = run(
        "local co = coroutine.create(function(a, b)
             local c = coroutine.yield(a + b)
             local d = coroutine.yield(c * 2)
             return d + 1
         end)
         local ok1, v1 = coroutine.resume(co, 1, 2)
         local ok2, v2 = coroutine.resume(co, 10)
         local ok3, v3 = coroutine.resume(co, 100)
         return ok1, v1, ok2, v2, ok3, v3",
    );
    assert_eq!(
        results,
        vec![
            Value::Bool(true),
            Value::Int(3),
            Value::Bool(true),
            Value::Int(20),
            Value::Bool(true),
            Value::Int(101),
        ]
    );
}

#[test]
fn coroutine_wrap_propagates_errors_as_lua_errors() {
    let err = run_err(
        "local f = coroutine.wrap(function() error('boom') end)
         f()",
    );
    assert!(err.contains("boom"), "expected error message to contain 'boom', got: {err}");
}

#[test]
fn break_inside_a_loop_closes_upvalues_captured_so_far() {
    let results = run(
        "local fns = {}
         local i = 1
         while true do
             local v = i
             fns[i] = function() return v end
             if i == 3 then break end
             i = i + 1
         end
         return fns[1](), fns[2](), fns[3]()",
    );
    assert_eq!(results, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
}

#[test]
fn backward_goto_closes_a_local_declared_since_the_label_before_looping() {
    // `v` is declared once, textually, between `::top::` and the backward
    // `goto top` — each trip around the goto closes it (as a captured
    // upvalue, since a nested closure reads it) before re-declaring it on
    // the next pass, so the three closures each see their own `i`.
    let results = run(
        "local fns = {}
         local i = 1
         ::top::
         local v = i
         fns[i] = function() return v end
         i = i + 1
         if i <= 3 then goto top end
         return fns[1](), fns[2](), fns[3]()",
    );
    assert_eq!(results, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
}

#[test]
fn forward_goto_past_a_local_declaration_does_not_corrupt_later_locals() {
    let results = run(
        "do
             local x = 1
             if x == 1 then
                 goto done
             end
             local unreachable = 99
         end
         ::done::
         local a = 10
         local b = 20
         return a, b",
    );
    assert_eq!(results, vec![Value::Int(10), Value::Int(20)]);
}

#[test]
fn string_upper_then_lower_is_identity_on_lowercase_ascii() {
    let results = run("return string.lower(string.upper('hello world')) == 'hello world'");
    assert_eq!(results, vec![Value::Bool(true)]);
}

#[test]
fn bytecode_round_trips_through_serialize_and_deserialize() {
    use luma::gc::StringInterner;
    use luma::{bytecode, Compiler};

    let source = "local function add(a, b) return a + b end\nreturn add(2, 3)";
    let mut interner = StringInterner::new();
    let proto = Compiler::compile(source, "<roundtrip>", &mut interner).unwrap();
    assert_eq!(proto.chunk.functions[0].locals_debug.len(), 2, "params a, b should each get a local-debug record");
    let bytes = bytecode::serialize(&proto, &interner);

    let mut interner2 = StringInterner::new();
    let loaded = bytecode::deserialize(&bytes, &mut interner2).unwrap();
    assert_eq!(loaded.chunk.functions[0].locals_debug.len(), 2);
    let loaded_names: Vec<&str> =
        loaded.chunk.functions[0].locals_debug.iter().map(|l| interner2.get(l.name.0)).collect();
    assert_eq!(loaded_names, vec!["a", "b"]);

    let mut vm = luma::Vm::new(luma::VmConfig::default());
    luma::stdlib::open_libs(&mut vm);
    let results = vm.call_proto(std::rc::Rc::new(loaded), Vec::new()).unwrap();
    assert_eq!(results, vec![Value::Int(5)]);
}

#[test]
fn pcall_catches_a_runtime_error_and_returns_it_as_a_value() {
    let results = run("local ok, msg = pcall(function() return nil + 1 end)\nreturn ok");
    assert_eq!(results, vec![Value::Bool(false)]);
}

#[test]
fn undefined_global_call_is_a_runtime_error_not_a_panic() {
    let err = run_err("undefined_function()");
    assert!(!err.is_empty());
}
