// The 5.1 precompiled-chunk format (lundump.c / ldump.c).
//
// Header (12 bytes): ESC "Lua", version 0x51, format 0, endianness,
// sizeof(int), sizeof(size_t), sizeof(Instruction), sizeof(lua_Number),
// integral flag. Then the top-level Proto, recursively. A rejected
// stream surfaces as a load error; no partial prototype escapes.

use std::rc::Rc;

use smol_str::SmolStr;

use crate::lua_value::{LocVar, LuaValue, Proto};
use crate::lua_vm::opcode::{Instruction, OpCode, OpMode};
use crate::lua_vm::{LuaError, LuaResult, LuaVM};

pub const SIGNATURE: &[u8; 4] = b"\x1bLua";
pub const VERSION: u8 = 0x51;
pub const FORMAT: u8 = 0;

// Constant tags on the wire (basic lua.h tags).
const TAG_NIL: u8 = 0;
const TAG_BOOLEAN: u8 = 1;
const TAG_NUMBER: u8 = 3;
const TAG_STRING: u8 = 4;

struct ChunkReader<'a> {
    data: &'a [u8],
    pos: usize,
    size_t_len: usize,
}

impl<'a> ChunkReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            size_t_len: 8,
        }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], String> {
        if self.pos + n > self.data.len() {
            return Err("unexpected end of chunk".to_string());
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn byte(&mut self) -> Result<u8, String> {
        Ok(self.bytes(1)?[0])
    }

    fn int(&mut self) -> Result<i32, String> {
        let b = self.bytes(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn size_t(&mut self) -> Result<usize, String> {
        if self.size_t_len == 4 {
            Ok(self.int()? as u32 as usize)
        } else {
            let b = self.bytes(8)?;
            let v = u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]);
            usize::try_from(v).map_err(|_| "string too large".to_string())
        }
    }

    fn instruction(&mut self) -> Result<u32, String> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn number(&mut self) -> Result<f64, String> {
        let b = self.bytes(8)?;
        Ok(f64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Length-prefixed string including a trailing NUL; zero length is
    /// the absent string.
    fn string(&mut self) -> Result<Option<&'a [u8]>, String> {
        let len = self.size_t()?;
        if len == 0 {
            return Ok(None);
        }
        let raw = self.bytes(len)?;
        Ok(Some(&raw[..len - 1]))
    }

    fn header(&mut self) -> Result<(), String> {
        if self.bytes(4)? != SIGNATURE {
            return Err("bad signature".to_string());
        }
        if self.byte()? != VERSION {
            return Err("version mismatch".to_string());
        }
        if self.byte()? != FORMAT {
            return Err("incompatible format".to_string());
        }
        if self.byte()? != 1 {
            return Err("big-endian chunks are not supported".to_string());
        }
        if self.byte()? != 4 {
            return Err("bad sizeof(int)".to_string());
        }
        let st = self.byte()?;
        if st != 4 && st != 8 {
            return Err("bad sizeof(size_t)".to_string());
        }
        self.size_t_len = st as usize;
        if self.byte()? != 4 {
            return Err("bad sizeof(Instruction)".to_string());
        }
        if self.byte()? != 8 {
            return Err("bad sizeof(lua_Number)".to_string());
        }
        if self.byte()? != 0 {
            return Err("integral number format not supported".to_string());
        }
        Ok(())
    }

    fn proto(&mut self, vm: &mut LuaVM, parent_source: &SmolStr) -> Result<Rc<Proto>, String> {
        let source = match self.string()? {
            Some(b) => SmolStr::new(String::from_utf8_lossy(b)),
            None => parent_source.clone(),
        };
        let line_defined = self.int()?;
        let last_line_defined = self.int()?;
        let nups = self.byte()?;
        let num_params = self.byte()?;
        let is_vararg = self.byte()?;
        let max_stack_size = self.byte()?;

        let sizecode = self.int()?;
        if sizecode < 0 {
            return Err("bad code size".to_string());
        }
        let mut code = Vec::with_capacity(sizecode as usize);
        for _ in 0..sizecode {
            code.push(self.instruction()?);
        }

        let sizek = self.int()?;
        let mut constants = Vec::with_capacity(sizek.max(0) as usize);
        for _ in 0..sizek {
            let tag = self.byte()?;
            constants.push(match tag {
                TAG_NIL => LuaValue::nil(),
                TAG_BOOLEAN => LuaValue::boolean(self.byte()? != 0),
                TAG_NUMBER => LuaValue::number(self.number()?),
                TAG_STRING => {
                    let bytes = self.string()?.unwrap_or(b"");
                    vm.new_string_bytes(bytes)
                }
                _ => return Err(format!("bad constant tag {}", tag)),
            });
        }

        let sizep = self.int()?;
        let mut protos = Vec::with_capacity(sizep.max(0) as usize);
        for _ in 0..sizep {
            protos.push(self.proto(vm, &source)?);
        }

        let sizelineinfo = self.int()?;
        let mut line_info = Vec::with_capacity(sizelineinfo.max(0) as usize);
        for _ in 0..sizelineinfo {
            line_info.push(self.int()?);
        }

        let sizelocvars = self.int()?;
        let mut loc_vars = Vec::with_capacity(sizelocvars.max(0) as usize);
        for _ in 0..sizelocvars {
            let name = match self.string()? {
                Some(b) => SmolStr::new(String::from_utf8_lossy(b)),
                None => SmolStr::default(),
            };
            let start_pc = self.int()?;
            let end_pc = self.int()?;
            loc_vars.push(LocVar {
                name,
                start_pc,
                end_pc,
            });
        }

        let sizeupvalues = self.int()?;
        let mut upvalue_names = Vec::with_capacity(sizeupvalues.max(0) as usize);
        for _ in 0..sizeupvalues {
            upvalue_names.push(match self.string()? {
                Some(b) => SmolStr::new(String::from_utf8_lossy(b)),
                None => SmolStr::default(),
            });
        }

        let proto = Proto {
            source,
            line_defined,
            last_line_defined,
            nups,
            num_params,
            is_vararg,
            max_stack_size,
            code,
            constants,
            protos,
            line_info,
            loc_vars,
            upvalue_names,
        };
        validate_proto(&proto)?;
        Ok(Rc::new(proto))
    }
}

/// Structural checks so no malformed prototype reaches the dispatch
/// loop: known opcodes, in-range constants, prototypes, registers and
/// jump targets.
fn validate_proto(p: &Proto) -> Result<(), String> {
    if p.code.is_empty() {
        return Err("empty code".to_string());
    }
    let sizecode = p.code.len();
    let maxstack = p.max_stack_size as usize;
    let check_reg = |r: usize| -> Result<(), String> {
        if r >= maxstack {
            Err("register out of range".to_string())
        } else {
            Ok(())
        }
    };
    let check_rk = |x: u32| -> Result<(), String> {
        if Instruction::is_k(x) {
            if (Instruction::rk_index(x) as usize) < p.constants.len() {
                Ok(())
            } else {
                Err("constant out of range".to_string())
            }
        } else {
            if (x as usize) < maxstack {
                Ok(())
            } else {
                Err("register out of range".to_string())
            }
        }
    };
    let mut pc = 0usize;
    while pc < sizecode {
        let i = p.code[pc];
        let Some(op) = OpCode::try_from_u8(Instruction::raw_opcode(i)) else {
            return Err("bad opcode".to_string());
        };
        let a = Instruction::get_a(i) as usize;
        // A is a boolean flag on comparisons and unused on JMP; it names
        // a register everywhere else.
        if !matches!(op, OpCode::Eq | OpCode::Lt | OpCode::Le | OpCode::Jmp) {
            check_reg(a)?;
        }
        match op.get_mode() {
            OpMode::IABx => {
                let bx = Instruction::get_bx(i) as usize;
                match op {
                    OpCode::LoadK | OpCode::GetGlobal | OpCode::SetGlobal => {
                        if bx >= p.constants.len() {
                            return Err("constant out of range".to_string());
                        }
                    }
                    OpCode::Closure => {
                        if bx >= p.protos.len() {
                            return Err("prototype out of range".to_string());
                        }
                        // The words after CLOSURE are capture pseudo-
                        // instructions, one per upvalue: MOVE (stack
                        // slot) or GETUPVAL (enclosing upvalue).
                        let nups = p.protos[bx].nups as usize;
                        if pc + nups + 1 >= sizecode {
                            return Err("truncated closure capture list".to_string());
                        }
                        for j in 1..=nups {
                            let pseudo = p.code[pc + j];
                            match OpCode::try_from_u8(Instruction::raw_opcode(pseudo)) {
                                Some(OpCode::Move) | Some(OpCode::GetUpval) => {}
                                _ => return Err("bad closure capture".to_string()),
                            }
                        }
                        pc += nups;
                    }
                    _ => {}
                }
            }
            OpMode::IAsBx => {
                let target = pc as i64 + 1 + Instruction::get_sbx(i) as i64;
                if target < 0 || target as usize >= sizecode {
                    return Err("jump out of range".to_string());
                }
            }
            OpMode::IABC => {
                if op.uses_rk() {
                    check_rk(Instruction::get_b(i))?;
                    check_rk(Instruction::get_c(i))?;
                }
                if op == OpCode::SetList && Instruction::get_c(i) == 0 {
                    // Next word is a raw count, not an instruction.
                    pc += 1;
                    if pc >= sizecode {
                        return Err("truncated SETLIST".to_string());
                    }
                }
                // These dispatch through the following JMP.
                if matches!(
                    op,
                    OpCode::Eq
                        | OpCode::Lt
                        | OpCode::Le
                        | OpCode::Test
                        | OpCode::TestSet
                        | OpCode::TForLoop
                ) {
                    let next = p.code.get(pc + 1).copied();
                    let is_jmp = next
                        .and_then(|n| OpCode::try_from_u8(Instruction::raw_opcode(n)))
                        .is_some_and(|n| n == OpCode::Jmp);
                    if !is_jmp {
                        return Err("comparison not followed by jump".to_string());
                    }
                }
            }
        }
        pc += 1;
    }
    Ok(())
}

impl LuaVM {
    /// Parse a precompiled chunk into a top-level closure bound to the
    /// globals table.
    pub fn load_chunk(&mut self, bytes: &[u8]) -> LuaResult<LuaValue> {
        let mut reader = ChunkReader::new(bytes);
        let default_source = SmolStr::new("=?");
        let result = reader
            .header()
            .and_then(|_| reader.proto(self, &default_source));
        match result {
            Ok(proto) => Ok(self.new_lua_closure(proto, Vec::new())),
            Err(msg) => {
                let v = self.new_string(&format!("bad bytecode: {}", msg));
                self.current_thread_mut().error_value = v;
                Err(LuaError::LoadError)
            }
        }
    }

    /// Serialize a prototype back into the binary format (ldump.c).
    pub fn dump_proto(&self, proto: &Proto) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(SIGNATURE);
        out.push(VERSION);
        out.push(FORMAT);
        out.push(1); // little-endian
        out.push(4); // sizeof(int)
        out.push(8); // sizeof(size_t)
        out.push(4); // sizeof(Instruction)
        out.push(8); // sizeof(lua_Number)
        out.push(0); // floating-point numbers
        self.dump_one(proto, &mut out);
        out
    }

    fn dump_string(&self, s: Option<&[u8]>, out: &mut Vec<u8>) {
        match s {
            None => out.extend_from_slice(&0u64.to_le_bytes()),
            Some(bytes) => {
                out.extend_from_slice(&((bytes.len() + 1) as u64).to_le_bytes());
                out.extend_from_slice(bytes);
                out.push(0);
            }
        }
    }

    fn dump_one(&self, p: &Proto, out: &mut Vec<u8>) {
        self.dump_string(
            if p.source.is_empty() {
                None
            } else {
                Some(p.source.as_bytes())
            },
            out,
        );
        out.extend_from_slice(&p.line_defined.to_le_bytes());
        out.extend_from_slice(&p.last_line_defined.to_le_bytes());
        out.push(p.nups);
        out.push(p.num_params);
        out.push(p.is_vararg);
        out.push(p.max_stack_size);

        out.extend_from_slice(&(p.code.len() as i32).to_le_bytes());
        for &ins in &p.code {
            out.extend_from_slice(&ins.to_le_bytes());
        }

        out.extend_from_slice(&(p.constants.len() as i32).to_le_bytes());
        for kv in &p.constants {
            if kv.is_nil() {
                out.push(TAG_NIL);
            } else if kv.is_boolean() {
                out.push(TAG_BOOLEAN);
                out.push(kv.bvalue() as u8);
            } else if kv.is_number() {
                out.push(TAG_NUMBER);
                out.extend_from_slice(&kv.nvalue().to_le_bytes());
            } else {
                out.push(TAG_STRING);
                let bytes = self.pool.string(kv.tsvalue()).as_bytes();
                self.dump_string(Some(bytes), out);
            }
        }

        out.extend_from_slice(&(p.protos.len() as i32).to_le_bytes());
        for sub in &p.protos {
            self.dump_one(sub, out);
        }

        out.extend_from_slice(&(p.line_info.len() as i32).to_le_bytes());
        for &l in &p.line_info {
            out.extend_from_slice(&l.to_le_bytes());
        }
        out.extend_from_slice(&(p.loc_vars.len() as i32).to_le_bytes());
        for lv in &p.loc_vars {
            self.dump_string(Some(lv.name.as_bytes()), out);
            out.extend_from_slice(&lv.start_pc.to_le_bytes());
            out.extend_from_slice(&lv.end_pc.to_le_bytes());
        }
        out.extend_from_slice(&(p.upvalue_names.len() as i32).to_le_bytes());
        for n in &p.upvalue_names {
            self.dump_string(Some(n.as_bytes()), out);
        }
    }
}
