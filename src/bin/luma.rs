//! Script runner + REPL + bytecode (de)serialization entry point.
//!
//! Ground: `luars_interpreter/src/bin/main.rs` in the teacher for the
//! overall shape (arg parsing, `execute_file`/`execute_stdin`, REPL
//! "try as an expression, fall back to a statement" loop) — this binary
//! drops the teacher's `-l`/`require`, `-E`/`-W` env flags (no module
//! system or warning subsystem in this language) and its Windows crash
//! handler, and adds `-c`/`-o`/`-b` for spec §6's bytecode file support.

use luma::{bytecode, stdlib, Compiler, LumaError, Vm, VmConfig};
use std::env;
use std::fs;
use std::io::{self, BufRead, Read, Write};
use std::process::ExitCode;

const VERSION: &str = "luma 0.1 (Lua 5-family)";

fn print_usage() {
    eprintln!("usage: luma [options] [script]");
    eprintln!("Available options are:");
    eprintln!("  -e stat        execute string 'stat'");
    eprintln!("  -c, --compile  compile only; use with -o to write bytecode");
    eprintln!("  -o path        output path for -c");
    eprintln!("  -b, --bytecode load and run a serialized bytecode file");
    eprintln!("  -v, --verbose  print the disassembly of every chunk before running it");
    eprintln!("  -h, --help     show this help");
    eprintln!("  -              stop handling options and execute stdin");
}

#[derive(Default)]
struct Options {
    execute_strings: Vec<String>,
    compile_only: bool,
    output_path: Option<String>,
    load_bytecode: bool,
    verbose: bool,
    read_stdin: bool,
    script_file: Option<String>,
}

fn parse_args() -> Result<Options, String> {
    let args: Vec<String> = env::args().collect();
    let mut opts = Options::default();
    let mut i = 1;
    let mut stop_options = false;

    while i < args.len() {
        let arg = &args[i];
        if !stop_options && arg.starts_with('-') && arg.len() > 1 {
            match arg.as_str() {
                "-e" => {
                    i += 1;
                    let s = args.get(i).ok_or("'-e' needs argument")?;
                    opts.execute_strings.push(s.clone());
                }
                "-c" | "--compile" => opts.compile_only = true,
                "-o" => {
                    i += 1;
                    let s = args.get(i).ok_or("'-o' needs argument")?;
                    opts.output_path = Some(s.clone());
                }
                "-b" | "--bytecode" => opts.load_bytecode = true,
                "-v" | "--verbose" => opts.verbose = true,
                "-h" | "--help" => {
                    print_usage();
                    std::process::exit(0);
                }
                "--" => stop_options = true,
                "-" => {
                    opts.read_stdin = true;
                    stop_options = true;
                }
                _ => return Err(format!("unrecognized option '{arg}'")),
            }
        } else {
            opts.script_file = Some(arg.clone());
            stop_options = true;
        }
        i += 1;
    }
    Ok(opts)
}

fn trace_proto(proto: &luma::Chunk, name: &str) {
    eprint!("{}", luma::opcode::disassemble(proto, name));
}

fn trace_all(proto: &luma::chunk::FunctionProto, label: &str) {
    trace_proto(&proto.chunk, label);
    for (i, f) in proto.chunk.functions.iter().enumerate() {
        trace_all(f, &format!("{label}:fn{i}"));
    }
}

fn run_source(vm: &mut Vm, source: &str, name: &str, verbose: bool) -> Result<(), String> {
    if verbose {
        let proto = Compiler::compile(source, name, vm.strings_mut()).map_err(|e| format!("{name}:{e}"))?;
        trace_all(&proto, name);
        return vm.call_proto(std::rc::Rc::new(proto), Vec::new()).map(|_| ()).map_err(|e| e.to_string());
    }
    vm.run_source(source, name).map(|_| ()).map_err(|e| e.to_string())
}

fn execute_file(vm: &mut Vm, path: &str, verbose: bool) -> Result<(), String> {
    let code = fs::read_to_string(path).map_err(|e| format!("cannot open {path}: {e}"))?;
    run_source(vm, &code, path, verbose)
}

fn execute_stdin(vm: &mut Vm, verbose: bool) -> Result<(), String> {
    let mut code = String::new();
    io::stdin().read_to_string(&mut code).map_err(|e| format!("error reading stdin: {e}"))?;
    run_source(vm, &code, "stdin", verbose)
}

fn compile_to_bytecode(path: &str, out_path: &str) -> Result<(), String> {
    let code = fs::read_to_string(path).map_err(|e| format!("cannot open {path}: {e}"))?;
    let mut interner = luma::gc::StringInterner::new();
    let proto = Compiler::compile(&code, path, &mut interner).map_err(|e| format!("{path}:{e}"))?;
    let bytes = bytecode::serialize(&proto, &interner);
    fs::write(out_path, bytes).map_err(|e| format!("cannot write {out_path}: {e}"))
}

fn run_bytecode_file(vm: &mut Vm, path: &str) -> Result<(), String> {
    let bytes = fs::read(path).map_err(|e| format!("cannot open {path}: {e}"))?;
    let proto = bytecode::deserialize(&bytes, vm.strings_mut()).map_err(|e| format!("{path}: {e}"))?;
    vm.call_proto(std::rc::Rc::new(proto), Vec::new()).map(|_| ()).map_err(|e| e.to_string())
}

fn run_repl(vm: &mut Vm) {
    println!("{VERSION}");
    println!("Type 'exit' or 'quit' to leave\n");

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    let mut incomplete = String::new();

    loop {
        if incomplete.is_empty() {
            print!("> ");
        } else {
            print!(">> ");
        }
        io::stdout().flush().ok();

        let line = match lines.next() {
            Some(Ok(line)) => line,
            _ => break,
        };

        let trimmed = line.trim();
        if incomplete.is_empty() && (trimmed == "exit" || trimmed == "quit") {
            break;
        }

        if !incomplete.is_empty() {
            incomplete.push('\n');
        }
        incomplete.push_str(&line);

        let expr_code = format!("return {incomplete}");
        let code_to_run =
            if Compiler::compile(&expr_code, "=stdin", vm.strings_mut()).is_ok() { expr_code } else { incomplete.clone() };

        match vm.run_source(&code_to_run, "=stdin") {
            Ok(results) => {
                if let Some(first) = results.into_iter().next() {
                    if !first.is_nil() {
                        match vm.display_value(first) {
                            Ok(s) => println!("{s}"),
                            Err(_) => println!("<error displaying result>"),
                        }
                    }
                }
                incomplete.clear();
            }
            Err(e) => {
                let msg = e.to_string();
                if e.kind == LumaError::Compile && (msg.contains("<eof>") || msg.contains("expected")) {
                    continue;
                }
                eprintln!("Error: {msg}");
                incomplete.clear();
            }
        }
    }
}

fn new_vm() -> Vm {
    let mut vm = Vm::new(VmConfig::default());
    stdlib::open_libs(&mut vm);
    vm
}

fn run() -> Result<(), String> {
    let opts = parse_args()?;

    if opts.compile_only {
        let script = opts.script_file.as_ref().ok_or("'-c' needs a script file")?;
        let out = opts.output_path.as_ref().ok_or("'-c' needs an output path ('-o path')")?;
        return compile_to_bytecode(script, out);
    }

    let mut vm = new_vm();

    for stat in &opts.execute_strings {
        run_source(&mut vm, stat, "=(command line)", opts.verbose)?;
    }
    if !opts.execute_strings.is_empty() && opts.script_file.is_none() && !opts.read_stdin {
        return Ok(());
    }

    if opts.load_bytecode {
        let script = opts.script_file.as_ref().ok_or("'-b' needs a bytecode file")?;
        return run_bytecode_file(&mut vm, script);
    }

    if let Some(script) = &opts.script_file {
        return execute_file(&mut vm, script, opts.verbose);
    }

    if opts.read_stdin {
        return execute_stdin(&mut vm, opts.verbose);
    }

    run_repl(&mut vm);
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
