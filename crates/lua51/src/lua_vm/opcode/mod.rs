mod instruction;

pub use instruction::{Instruction, fb2int, int2fb};

/// Instruction format modes (lopcodes.h).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpMode {
    IABC,
    IABx,
    IAsBx,
}

/// The complete Lua 5.1 opcode set (38 opcodes), numbered exactly as in
/// lopcodes.h so loaded bytecode dispatches without translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Move = 0,  // R(A) := R(B)
    LoadK,     // R(A) := K(Bx)
    LoadBool,  // R(A) := (Bool)B; if (C) pc++
    LoadNil,   // R(A) := ... := R(B) := nil
    GetUpval,  // R(A) := UpValue[B]
    GetGlobal, // R(A) := Gbl[K(Bx)]
    GetTable,  // R(A) := R(B)[RK(C)]
    SetGlobal, // Gbl[K(Bx)] := R(A)
    SetUpval,  // UpValue[B] := R(A)
    SetTable,  // R(A)[RK(B)] := RK(C)
    NewTable,  // R(A) := {} (size hints B, C)
    Self_,     // R(A+1) := R(B); R(A) := R(B)[RK(C)]
    Add,       // R(A) := RK(B) + RK(C)
    Sub,       // R(A) := RK(B) - RK(C)
    Mul,       // R(A) := RK(B) * RK(C)
    Div,       // R(A) := RK(B) / RK(C)
    Mod,       // R(A) := RK(B) % RK(C)
    Pow,       // R(A) := RK(B) ^ RK(C)
    Unm,       // R(A) := -R(B)
    Not,       // R(A) := not R(B)
    Len,       // R(A) := length of R(B)
    Concat,    // R(A) := R(B).. ... ..R(C)
    Jmp,       // pc += sBx
    Eq,        // if ((RK(B) == RK(C)) ~= A) then pc++
    Lt,        // if ((RK(B) <  RK(C)) ~= A) then pc++
    Le,        // if ((RK(B) <= RK(C)) ~= A) then pc++
    Test,      // if not (R(A) <=> C) then pc++
    TestSet,   // if (R(B) <=> C) then R(A) := R(B) else pc++
    Call,      // R(A), ... ,R(A+C-2) := R(A)(R(A+1), ... ,R(A+B-1))
    TailCall,  // return R(A)(R(A+1), ... ,R(A+B-1))
    Return,    // return R(A), ... ,R(A+B-2)
    ForLoop,   // R(A)+=R(A+2); if R(A) <?= R(A+1) then { pc+=sBx; R(A+3)=R(A) }
    ForPrep,   // R(A)-=R(A+2); pc+=sBx
    TForLoop,  // R(A+3),...,R(A+2+C) := R(A)(R(A+1),R(A+2)); ...
    SetList,   // R(A)[(C-1)*FPF+i] := R(A+i), 1 <= i <= B
    Close,     // close all upvalues >= R(A)
    Closure,   // R(A) := closure(KPROTO[Bx], R(A), ... ,R(A+n))
    Vararg,    // R(A), R(A+1), ..., R(A+B-1) = vararg
}

pub const NUM_OPCODES: u8 = 38;

/// Fields-per-flush for SETLIST (lopcodes.h LFIELDS_PER_FLUSH).
pub const FIELDS_PER_FLUSH: usize = 50;

impl OpCode {
    /// Unchecked decode for the dispatch loop; the loader validates
    /// every opcode before a chunk ever executes.
    #[inline(always)]
    pub fn from_u8(byte: u8) -> Self {
        debug_assert!(byte < NUM_OPCODES);
        unsafe { std::mem::transmute(byte) }
    }

    /// Checked decode for the loader.
    #[inline]
    pub fn try_from_u8(byte: u8) -> Option<Self> {
        if byte < NUM_OPCODES {
            Some(Self::from_u8(byte))
        } else {
            None
        }
    }

    pub fn get_mode(self) -> OpMode {
        use OpCode::*;
        match self {
            LoadK | GetGlobal | SetGlobal | NewTable | Closure => OpMode::IABx,
            Jmp | ForLoop | ForPrep => OpMode::IAsBx,
            _ => OpMode::IABC,
        }
    }

    /// Opcodes whose B (or C) operand may be an RK constant reference.
    pub fn uses_rk(self) -> bool {
        use OpCode::*;
        matches!(
            self,
            GetTable | SetTable | Self_ | Add | Sub | Mul | Div | Mod | Pow | Eq | Lt | Le
        )
    }
}
