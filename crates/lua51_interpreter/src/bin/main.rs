// Minimal standalone runner for precompiled 5.1 chunks (luac output):
// load a .luac file (or stdin), run it protected, report errors the way
// lua.c does.

use lua51::{LuaResult, LuaVM, LuaValue};
use std::env;
use std::fs;
use std::io::Read;
use std::process::ExitCode;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const VERSION: &str = "lua51 (Lua 5.1.5 bytecode runner)";

/// print lives here, not in the core library: the VM crate stays free
/// of I/O, the runner owns stdout.
fn lua_print(vm: &mut LuaVM) -> LuaResult<usize> {
    let args = vm.args();
    let mut parts = Vec::with_capacity(args.len());
    for a in &args {
        parts.push(vm.display_value(a));
    }
    println!("{}", parts.join("\t"));
    Ok(0)
}

fn print_usage() {
    eprintln!("usage: lua51 [options] [chunk.luac [args]]");
    eprintln!("Available options are:");
    eprintln!("  -v        show version information");
    eprintln!("  --        stop handling options");
    eprintln!("  -         read chunk from stdin");
}

#[derive(Default)]
struct Options {
    chunk_file: Option<String>,
    chunk_args: Vec<String>,
    show_version: bool,
    read_stdin: bool,
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
                "-v" => opts.show_version = true,
                "--" => stop_options = true,
                _ => return Err(format!("unrecognized option '{}'", arg)),
            }
        } else if arg == "-" && !stop_options {
            opts.read_stdin = true;
            stop_options = true;
        } else {
            opts.chunk_file = Some(arg.clone());
            i += 1;
            while i < args.len() {
                opts.chunk_args.push(args[i].clone());
                i += 1;
            }
            break;
        }
        i += 1;
    }
    Ok(opts)
}

fn main() -> ExitCode {
    let opts = match parse_args() {
        Ok(o) => o,
        Err(msg) => {
            eprintln!("lua51: {}", msg);
            print_usage();
            return ExitCode::FAILURE;
        }
    };

    if opts.show_version {
        println!("{}", VERSION);
        return ExitCode::SUCCESS;
    }

    let bytes = if opts.read_stdin {
        let mut buf = Vec::new();
        if let Err(e) = std::io::stdin().read_to_end(&mut buf) {
            eprintln!("lua51: cannot read stdin: {}", e);
            return ExitCode::FAILURE;
        }
        buf
    } else if let Some(file) = &opts.chunk_file {
        match fs::read(file) {
            Ok(b) => b,
            Err(e) => {
                eprintln!("lua51: cannot open {}: {}", file, e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        print_usage();
        return ExitCode::FAILURE;
    };

    let mut vm = LuaVM::new();
    if let Err(e) = vm.open_libs() {
        eprintln!("lua51: {}", vm.into_full_error(e));
        return ExitCode::FAILURE;
    }
    vm.set_global("print", LuaValue::cfunction(lua_print));

    let args: Vec<LuaValue> = opts
        .chunk_args
        .iter()
        .map(|a| vm.new_string(a))
        .collect();

    match vm.run_chunk(&bytes, &args) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("lua51: {}", vm.into_full_error(e));
            ExitCode::FAILURE
        }
    }
}
