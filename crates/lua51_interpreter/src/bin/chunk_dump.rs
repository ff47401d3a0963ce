// Disassembler-style listing of a precompiled chunk, for debugging
// loader and dispatch issues.

use lua51::lua_value::Proto;
use lua51::{Instruction, LuaVM, OpCode, OpMode};
use std::env;
use std::fs;
use std::process::ExitCode;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn list_proto(vm: &LuaVM, p: &Proto, depth: usize) {
    let indent = "  ".repeat(depth);
    println!(
        "{}function <{}:{}> ({} instructions, {} params, {} upvalues, {} stack)",
        indent,
        p.chunk_name(),
        p.line_defined,
        p.code.len(),
        p.num_params,
        p.nups,
        p.max_stack_size
    );
    for (pc, &i) in p.code.iter().enumerate() {
        let op = Instruction::get_opcode(i);
        let line = p.line_at(pc);
        let operands = match op.get_mode() {
            OpMode::IABC => format!(
                "{} {} {}",
                Instruction::get_a(i),
                Instruction::get_b(i),
                Instruction::get_c(i)
            ),
            OpMode::IABx => format!("{} {}", Instruction::get_a(i), Instruction::get_bx(i)),
            OpMode::IAsBx => format!("{} {}", Instruction::get_a(i), Instruction::get_sbx(i)),
        };
        println!("{}  [{}] {:?} {} ; line {}", indent, pc + 1, op, operands, line);
    }
    for (ki, k) in p.constants.iter().enumerate() {
        println!("{}  const [{}] = {}", indent, ki, vm.display_value(k));
    }
    for sub in &p.protos {
        list_proto(vm, sub, depth + 1);
    }
}

fn main() -> ExitCode {
    let Some(file) = env::args().nth(1) else {
        eprintln!("usage: chunk_dump <chunk.luac>");
        return ExitCode::FAILURE;
    };
    let bytes = match fs::read(&file) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("chunk_dump: cannot open {}: {}", file, e);
            return ExitCode::FAILURE;
        }
    };
    let mut vm = LuaVM::new();
    match vm.load_chunk(&bytes) {
        Ok(closure) => {
            let id = closure.clvalue();
            if let lua51::Closure::Lua(lc) = vm.pool.closure(id) {
                let proto = lc.proto.clone();
                list_proto(&vm, &proto, 0);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("chunk_dump: {}", vm.into_full_error(e));
            ExitCode::FAILURE
        }
    }
}
