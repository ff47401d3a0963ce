/*----------------------------------------------------------------------
  Lua 5.1 instruction encoding, a 1:1 port of lopcodes.h.

  Each instruction is one little-endian 32-bit word:
  - iABC:  [Op(6) | A(8) | C(9) | B(9)]
  - iABx:  [Op(6) | A(8) | Bx(18)]
  - iAsBx: [Op(6) | A(8) | sBx(18, excess-131071)]

  A 9-bit B/C operand with its high bit set (BITRK) is a constant-table
  index; otherwise it is a register.
----------------------------------------------------------------------*/

use crate::lua_vm::OpCode;

pub struct Instruction;

impl Instruction {
    pub const SIZE_OP: u32 = 6;
    pub const SIZE_A: u32 = 8;
    pub const SIZE_C: u32 = 9;
    pub const SIZE_B: u32 = 9;
    pub const SIZE_BX: u32 = Self::SIZE_C + Self::SIZE_B; // 18

    pub const POS_OP: u32 = 0;
    pub const POS_A: u32 = Self::POS_OP + Self::SIZE_OP; // 6
    pub const POS_C: u32 = Self::POS_A + Self::SIZE_A; // 14
    pub const POS_B: u32 = Self::POS_C + Self::SIZE_C; // 23
    pub const POS_BX: u32 = Self::POS_C; // 14

    pub const MAX_A: u32 = (1 << Self::SIZE_A) - 1;
    pub const MAX_B: u32 = (1 << Self::SIZE_B) - 1;
    pub const MAX_C: u32 = (1 << Self::SIZE_C) - 1;
    pub const MAX_BX: u32 = (1 << Self::SIZE_BX) - 1;
    pub const OFFSET_SBX: i32 = (Self::MAX_BX >> 1) as i32; // 131071

    /// Constant-vs-register selector bit of a 9-bit operand.
    pub const BITRK: u32 = 1 << (Self::SIZE_B - 1); // 256
    pub const MAX_INDEX_RK: u32 = Self::BITRK - 1; // 255

    #[inline(always)]
    fn mask1(n: u32, p: u32) -> u32 {
        (!(!0u32 << n)) << p
    }

    #[inline(always)]
    pub fn get_opcode(i: u32) -> OpCode {
        OpCode::from_u8(((i >> Self::POS_OP) & Self::mask1(Self::SIZE_OP, 0)) as u8)
    }

    #[inline(always)]
    pub fn raw_opcode(i: u32) -> u8 {
        ((i >> Self::POS_OP) & Self::mask1(Self::SIZE_OP, 0)) as u8
    }

    #[inline(always)]
    pub fn get_a(i: u32) -> u32 {
        (i >> Self::POS_A) & Self::mask1(Self::SIZE_A, 0)
    }

    #[inline(always)]
    pub fn get_b(i: u32) -> u32 {
        (i >> Self::POS_B) & Self::mask1(Self::SIZE_B, 0)
    }

    #[inline(always)]
    pub fn get_c(i: u32) -> u32 {
        (i >> Self::POS_C) & Self::mask1(Self::SIZE_C, 0)
    }

    #[inline(always)]
    pub fn get_bx(i: u32) -> u32 {
        (i >> Self::POS_BX) & Self::mask1(Self::SIZE_BX, 0)
    }

    #[inline(always)]
    pub fn get_sbx(i: u32) -> i32 {
        Self::get_bx(i) as i32 - Self::OFFSET_SBX
    }

    // RK(x): constant if the selector bit is set, register otherwise.
    #[inline(always)]
    pub fn is_k(x: u32) -> bool {
        x & Self::BITRK != 0
    }

    #[inline(always)]
    pub fn rk_index(x: u32) -> u32 {
        x & !Self::BITRK
    }

    #[inline(always)]
    pub fn rk_as_k(x: u32) -> u32 {
        x | Self::BITRK
    }

    // ============ Construction (used by the loader tests and tools) ============

    pub fn create_abc(op: OpCode, a: u32, b: u32, c: u32) -> u32 {
        debug_assert!(a <= Self::MAX_A && b <= Self::MAX_B && c <= Self::MAX_C);
        ((op as u32) << Self::POS_OP) | (a << Self::POS_A) | (b << Self::POS_B) | (c << Self::POS_C)
    }

    pub fn create_abx(op: OpCode, a: u32, bx: u32) -> u32 {
        debug_assert!(a <= Self::MAX_A && bx <= Self::MAX_BX);
        ((op as u32) << Self::POS_OP) | (a << Self::POS_A) | (bx << Self::POS_BX)
    }

    pub fn create_asbx(op: OpCode, a: u32, sbx: i32) -> u32 {
        Self::create_abx(op, a, (sbx + Self::OFFSET_SBX) as u32)
    }
}

/// Size hints in NEWTABLE are "floating point bytes": eeeeexxx meaning
/// (1xxx) * 2^(eeeee-1), or xxx when eeeee is 0 (luaO_fb2int).
pub fn fb2int(x: u32) -> usize {
    let e = (x >> 3) & 0x1f;
    if e == 0 {
        x as usize
    } else {
        (((x & 7) + 8) as usize) << (e - 1)
    }
}

/// Inverse of fb2int, rounding up (luaO_int2fb).
pub fn int2fb(mut x: usize) -> u32 {
    let mut e = 0u32;
    while x >= 16 {
        x = (x + 1) >> 1;
        e += 1;
    }
    if e == 0 {
        x as u32
    } else {
        ((e + 1) << 3) | (x as u32 - 8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lua_vm::OpMode;

    #[test]
    fn test_instruction_abc() {
        let i = Instruction::create_abc(OpCode::Move, 1, 2, 3);
        assert_eq!(Instruction::get_opcode(i), OpCode::Move);
        assert_eq!(Instruction::get_a(i), 1);
        assert_eq!(Instruction::get_b(i), 2);
        assert_eq!(Instruction::get_c(i), 3);
    }

    #[test]
    fn test_instruction_abx() {
        let i = Instruction::create_abx(OpCode::LoadK, 3, 100_000);
        assert_eq!(Instruction::get_opcode(i), OpCode::LoadK);
        assert_eq!(Instruction::get_a(i), 3);
        assert_eq!(Instruction::get_bx(i), 100_000);
    }

    #[test]
    fn test_instruction_asbx() {
        let neg = Instruction::create_asbx(OpCode::Jmp, 0, -50);
        assert_eq!(Instruction::get_sbx(neg), -50);
        let pos = Instruction::create_asbx(OpCode::ForLoop, 2, 1000);
        assert_eq!(Instruction::get_sbx(pos), 1000);
        let zero = Instruction::create_asbx(OpCode::Jmp, 0, 0);
        assert_eq!(Instruction::get_sbx(zero), 0);
    }

    #[test]
    fn test_field_positions() {
        // Bit layout pinned by the 5.1 binary format.
        assert_eq!(Instruction::POS_OP, 0);
        assert_eq!(Instruction::POS_A, 6);
        assert_eq!(Instruction::POS_C, 14);
        assert_eq!(Instruction::POS_B, 23);
        assert_eq!(Instruction::OFFSET_SBX, 131071);
    }

    #[test]
    fn test_rk_encoding() {
        assert!(!Instruction::is_k(5));
        let k = Instruction::rk_as_k(5);
        assert!(Instruction::is_k(k));
        assert_eq!(Instruction::rk_index(k), 5);
        assert_eq!(Instruction::BITRK, 256);
    }

    #[test]
    fn test_boundaries() {
        let i = Instruction::create_abc(
            OpCode::Move,
            Instruction::MAX_A,
            Instruction::MAX_B,
            Instruction::MAX_C,
        );
        assert_eq!(Instruction::get_a(i), Instruction::MAX_A);
        assert_eq!(Instruction::get_b(i), Instruction::MAX_B);
        assert_eq!(Instruction::get_c(i), Instruction::MAX_C);
        assert_eq!(Instruction::get_opcode(i), OpCode::Move);
    }

    #[test]
    fn test_fb2int_round_trip() {
        for n in [0usize, 1, 2, 7, 8, 15, 16, 17, 100, 1000, 50_000] {
            let fb = int2fb(n);
            let back = fb2int(fb);
            assert!(back >= n, "fb2int(int2fb({n})) = {back}");
        }
        assert_eq!(fb2int(0), 0);
        assert_eq!(fb2int(int2fb(8)), 8);
    }

    #[test]
    fn test_opcode_modes() {
        assert_eq!(OpCode::Move.get_mode(), OpMode::IABC);
        assert_eq!(OpCode::LoadK.get_mode(), OpMode::IABx);
        assert_eq!(OpCode::Jmp.get_mode(), OpMode::IAsBx);
        assert_eq!(OpCode::Closure.get_mode(), OpMode::IABx);
        assert_eq!(OpCode::ForLoop.get_mode(), OpMode::IAsBx);
    }
}
