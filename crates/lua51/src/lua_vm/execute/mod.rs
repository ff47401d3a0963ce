/*----------------------------------------------------------------------
  The fetch-decode-execute loop over a frame's bytecode.

  Single flat loop in the shape of luaV_execute: calling a Lua function
  pushes a frame and re-enters at 'startfunc, returning pops one and
  does the same, so Lua-to-Lua calls cost no Rust stack. Host calls run
  inline. Nested dispatch (metamethods, pcall bodies, iterator calls)
  recurses through call_at with a CIST_FRESH frame and a target depth.

  pc and base live in locals; the frame's saved pc is written back
  (save_pc) before anything that can call out or raise, so errors and
  suspensions see a consistent frame.
----------------------------------------------------------------------*/

pub mod arith;
pub mod call;
pub mod compare;
pub mod concat;
pub mod metamethod;
pub mod table_ops;

use crate::gc::ThreadId;
use crate::lua_value::{Closure, LuaValue};
use crate::lua_vm::lua_limits::LUA_MULTRET;
use crate::lua_vm::opcode::{FIELDS_PER_FLUSH, fb2int};
use crate::lua_vm::{Instruction, LuaResult, LuaVM, OpCode};

use arith::ArithOp;
use metamethod::TmKind;

/// Run the current thread until its call depth drops to `target_depth`.
pub fn lua_execute(vm: &mut LuaVM, tid: ThreadId, target_depth: usize) -> LuaResult<()> {
    'startfunc: loop {
        let depth = vm.thread(tid).frames.len();
        if depth <= target_depth {
            return Ok(());
        }
        let frame_idx = depth - 1;

        // ===== Load frame context =====
        let (func, saved_pc, frame_base, ci_top) = {
            let ci = &vm.thread(tid).frames[frame_idx];
            debug_assert!(ci.is_lua());
            (ci.func, ci.pc as usize, ci.base, ci.top)
        };

        // Nil the gap between a lowered top (after a MULTRET return) and
        // the frame's register window, so no stale values linger there.
        {
            let th = vm.thread_mut(tid);
            if th.top < ci_top {
                th.clear_to(ci_top);
            }
        }

        let (proto, upvals, env) = match vm.pool.closure(func.clvalue()) {
            Closure::Lua(lc) => (lc.proto.clone(), lc.upvalues.clone(), lc.env),
            Closure::Native(_) => unreachable!("host frames never enter the dispatch loop"),
        };
        let code = &proto.code;
        let k = &proto.constants;
        let base = frame_base;
        let mut pc = saved_pc;

        macro_rules! save_pc {
            () => {
                vm.thread_mut(tid).frames[frame_idx].pc = pc as u32;
            };
        }
        macro_rules! reg {
            ($n:expr) => {
                vm.thread(tid).stack[base + $n]
            };
        }
        macro_rules! set_reg {
            ($n:expr, $v:expr) => {
                vm.thread_mut(tid).stack[base + $n] = $v;
            };
        }
        macro_rules! rk {
            ($x:expr) => {{
                let x = $x;
                if Instruction::is_k(x) {
                    k[Instruction::rk_index(x) as usize]
                } else {
                    reg!(Instruction::rk_index(x) as usize)
                }
            }};
        }
        // Comparison opcodes are always followed by a JMP; taking the
        // branch means executing it, skipping means stepping over it.
        macro_rules! cond_jump {
            ($cond:expr) => {
                if $cond {
                    let j = code[pc];
                    pc = (pc as i64 + 1 + Instruction::get_sbx(j) as i64) as usize;
                } else {
                    pc += 1;
                }
            };
        }

        // ===== Main dispatch =====
        loop {
            let i = code[pc];
            pc += 1;
            let a = Instruction::get_a(i) as usize;

            match Instruction::get_opcode(i) {
                OpCode::Move => {
                    let b = Instruction::get_b(i) as usize;
                    set_reg!(a, reg!(b));
                }
                OpCode::LoadK => {
                    let bx = Instruction::get_bx(i) as usize;
                    set_reg!(a, k[bx]);
                }
                OpCode::LoadBool => {
                    let b = Instruction::get_b(i);
                    let c = Instruction::get_c(i);
                    set_reg!(a, LuaValue::boolean(b != 0));
                    if c != 0 {
                        pc += 1;
                    }
                }
                OpCode::LoadNil => {
                    let b = Instruction::get_b(i) as usize;
                    let th = vm.thread_mut(tid);
                    for r in a..=b {
                        th.stack[base + r] = LuaValue::nil();
                    }
                }
                OpCode::GetUpval => {
                    let b = Instruction::get_b(i) as usize;
                    let v = vm.upvalue_get(upvals[b]);
                    set_reg!(a, v);
                }
                OpCode::SetUpval => {
                    let b = Instruction::get_b(i) as usize;
                    let v = reg!(a);
                    vm.upvalue_set(upvals[b], v);
                }
                OpCode::GetGlobal => {
                    let bx = Instruction::get_bx(i) as usize;
                    save_pc!();
                    let v = table_ops::vm_gettable(vm, LuaValue::table(env), k[bx])?;
                    set_reg!(a, v);
                }
                OpCode::SetGlobal => {
                    let bx = Instruction::get_bx(i) as usize;
                    save_pc!();
                    let v = reg!(a);
                    table_ops::vm_settable(vm, LuaValue::table(env), k[bx], v)?;
                }
                OpCode::GetTable => {
                    let b = Instruction::get_b(i) as usize;
                    let c = Instruction::get_c(i);
                    save_pc!();
                    let t = reg!(b);
                    let key = rk!(c);
                    let v = table_ops::vm_gettable(vm, t, key)?;
                    set_reg!(a, v);
                }
                OpCode::SetTable => {
                    let b = Instruction::get_b(i);
                    let c = Instruction::get_c(i);
                    save_pc!();
                    let t = reg!(a);
                    let key = rk!(b);
                    let val = rk!(c);
                    table_ops::vm_settable(vm, t, key, val)?;
                }
                OpCode::NewTable => {
                    let b = Instruction::get_b(i);
                    let c = Instruction::get_c(i);
                    let t = vm.new_table(fb2int(b), fb2int(c));
                    set_reg!(a, t);
                    save_pc!();
                    vm.check_gc();
                }
                OpCode::Self_ => {
                    let b = Instruction::get_b(i) as usize;
                    let c = Instruction::get_c(i);
                    save_pc!();
                    let obj = reg!(b);
                    set_reg!(a + 1, obj);
                    let key = rk!(c);
                    let v = table_ops::vm_gettable(vm, obj, key)?;
                    set_reg!(a, v);
                }
                op @ (OpCode::Add
                | OpCode::Sub
                | OpCode::Mul
                | OpCode::Div
                | OpCode::Mod
                | OpCode::Pow) => {
                    let op = match op {
                        OpCode::Add => ArithOp::Add,
                        OpCode::Sub => ArithOp::Sub,
                        OpCode::Mul => ArithOp::Mul,
                        OpCode::Div => ArithOp::Div,
                        OpCode::Mod => ArithOp::Mod,
                        _ => ArithOp::Pow,
                    };
                    let vb = rk!(Instruction::get_b(i));
                    let vc = rk!(Instruction::get_c(i));
                    if vb.is_number() && vc.is_number() {
                        set_reg!(a, LuaValue::number(op.apply(vb.nvalue(), vc.nvalue())));
                    } else {
                        save_pc!();
                        let r = arith::arith(vm, vb, vc, op)?;
                        set_reg!(a, r);
                    }
                }
                OpCode::Unm => {
                    let b = Instruction::get_b(i) as usize;
                    let v = reg!(b);
                    if v.is_number() {
                        set_reg!(a, LuaValue::number(-v.nvalue()));
                    } else {
                        save_pc!();
                        let r = arith::unary_minus(vm, v)?;
                        set_reg!(a, r);
                    }
                }
                OpCode::Not => {
                    let b = Instruction::get_b(i) as usize;
                    let v = reg!(b);
                    set_reg!(a, LuaValue::boolean(v.is_falsy()));
                }
                OpCode::Len => {
                    let b = Instruction::get_b(i) as usize;
                    let v = reg!(b);
                    if v.is_table() {
                        let n = vm.pool.table(v.hvalue()).length();
                        set_reg!(a, LuaValue::number(n as f64));
                    } else if v.is_string() {
                        let n = vm.pool.string(v.tsvalue()).len();
                        set_reg!(a, LuaValue::number(n as f64));
                    } else {
                        save_pc!();
                        let mm = vm.get_metamethod(&v, TmKind::Len);
                        if mm.is_nil() {
                            let tn = v.type_name();
                            return Err(
                                vm.error(format!("attempt to get length of a {} value", tn))
                            );
                        }
                        let r = metamethod::call_tm_res(vm, mm, &[v])?;
                        set_reg!(a, r);
                    }
                }
                OpCode::Concat => {
                    let b = Instruction::get_b(i) as usize;
                    let c = Instruction::get_c(i) as usize;
                    save_pc!();
                    let v = concat::concat_range(vm, tid, base, b, c)?;
                    set_reg!(a, v);
                    vm.check_gc();
                }
                OpCode::Jmp => {
                    pc = (pc as i64 + Instruction::get_sbx(i) as i64) as usize;
                }
                OpCode::Eq => {
                    let vb = rk!(Instruction::get_b(i));
                    let vc = rk!(Instruction::get_c(i));
                    save_pc!();
                    let cond = compare::equal_values(vm, vb, vc)?;
                    cond_jump!(cond == (a != 0));
                }
                OpCode::Lt => {
                    let vb = rk!(Instruction::get_b(i));
                    let vc = rk!(Instruction::get_c(i));
                    save_pc!();
                    let cond = compare::less_than(vm, vb, vc)?;
                    cond_jump!(cond == (a != 0));
                }
                OpCode::Le => {
                    let vb = rk!(Instruction::get_b(i));
                    let vc = rk!(Instruction::get_c(i));
                    save_pc!();
                    let cond = compare::less_equal(vm, vb, vc)?;
                    cond_jump!(cond == (a != 0));
                }
                OpCode::Test => {
                    let c = Instruction::get_c(i);
                    let v = reg!(a);
                    cond_jump!(v.is_truthy() == (c != 0));
                }
                OpCode::TestSet => {
                    let b = Instruction::get_b(i) as usize;
                    let c = Instruction::get_c(i);
                    let v = reg!(b);
                    if v.is_truthy() == (c != 0) {
                        set_reg!(a, v);
                        cond_jump!(true);
                    } else {
                        pc += 1;
                    }
                }
                OpCode::Call => {
                    let b = Instruction::get_b(i) as usize;
                    let c = Instruction::get_c(i);
                    let func_pos = base + a;
                    let nargs = if b == 0 {
                        vm.thread(tid).top - func_pos - 1
                    } else {
                        vm.thread_mut(tid).top = func_pos + b;
                        b - 1
                    };
                    let nres = c as i32 - 1;
                    save_pc!();
                    match call::precall(vm, tid, func_pos, nargs, nres, false)? {
                        call::PreCall::Lua => continue 'startfunc,
                        call::PreCall::Native => {
                            if nres != LUA_MULTRET {
                                vm.thread_mut(tid).top = ci_top;
                            }
                        }
                    }
                }
                OpCode::TailCall => {
                    let b = Instruction::get_b(i) as usize;
                    let call_pos = base + a;
                    let nargs = if b == 0 {
                        vm.thread(tid).top - call_pos - 1
                    } else {
                        b - 1
                    };
                    save_pc!();
                    // Callability is checked while this frame is still
                    // intact so the error points at the right line.
                    {
                        let f = vm.thread(tid).stack[call_pos];
                        if !f.is_function() && !vm.get_metamethod(&f, TmKind::Call).is_function()
                        {
                            let tn = f.type_name();
                            return Err(vm.error(format!("attempt to call a {} value", tn)));
                        }
                    }
                    vm.close_upvalues(tid, base);
                    let ci = match vm.thread_mut(tid).frames.pop() {
                        Some(ci) => ci,
                        None => unreachable!("tail call without a frame"),
                    };
                    {
                        let th = vm.thread_mut(tid);
                        for j in 0..=nargs {
                            th.stack[ci.func_pos + j] = th.stack[call_pos + j];
                        }
                        th.top = ci.func_pos + 1 + nargs;
                    }
                    let was_fresh = ci.is_fresh();
                    match call::precall(vm, tid, ci.func_pos, nargs, ci.nresults, was_fresh)? {
                        call::PreCall::Lua => {
                            let th = vm.thread_mut(tid);
                            if let Some(f) = th.frames.last_mut() {
                                f.set_tail();
                                f.tailcalls = ci.tailcalls + 1;
                            }
                            continue 'startfunc;
                        }
                        call::PreCall::Native => {
                            if ci.nresults != LUA_MULTRET {
                                let th = vm.thread_mut(tid);
                                if let Some(parent) = th.frames.last() {
                                    if parent.is_lua() {
                                        let pt = parent.top;
                                        th.top = pt;
                                    }
                                }
                            }
                            continue 'startfunc;
                        }
                    }
                }
                OpCode::Return => {
                    let b = Instruction::get_b(i) as usize;
                    let first = base + a;
                    let n = if b == 0 {
                        vm.thread(tid).top - first
                    } else {
                        b - 1
                    };
                    vm.close_upvalues(tid, base);
                    let ci = match vm.thread_mut(tid).frames.pop() {
                        Some(ci) => ci,
                        None => unreachable!("return without a frame"),
                    };
                    let th = vm.thread_mut(tid);
                    for j in 0..n {
                        th.stack[ci.func_pos + j] = th.stack[first + j];
                    }
                    if ci.nresults == LUA_MULTRET {
                        th.top = ci.func_pos + n;
                    } else {
                        let wanted = ci.nresults as usize;
                        for j in n..wanted {
                            th.stack[ci.func_pos + j] = LuaValue::nil();
                        }
                        th.top = ci.func_pos + wanted;
                        if let Some(parent) = th.frames.last() {
                            if parent.is_lua() {
                                let pt = parent.top;
                                th.top = pt;
                            }
                        }
                    }
                    continue 'startfunc;
                }
                OpCode::ForLoop => {
                    let step = reg!(a + 2).nvalue();
                    let idx = reg!(a).nvalue() + step;
                    let limit = reg!(a + 1).nvalue();
                    let cont = if step > 0.0 { idx <= limit } else { limit <= idx };
                    if cont {
                        pc = (pc as i64 + Instruction::get_sbx(i) as i64) as usize;
                        set_reg!(a, LuaValue::number(idx));
                        set_reg!(a + 3, LuaValue::number(idx));
                    }
                }
                OpCode::ForPrep => {
                    save_pc!();
                    let init = coerce_for_value(vm, tid, base + a, "initial value")?;
                    coerce_for_value(vm, tid, base + a + 1, "limit")?;
                    let step = coerce_for_value(vm, tid, base + a + 2, "step")?;
                    set_reg!(a, LuaValue::number(init - step));
                    pc = (pc as i64 + Instruction::get_sbx(i) as i64) as usize;
                }
                OpCode::TForLoop => {
                    let c = Instruction::get_c(i) as usize;
                    save_pc!();
                    let cb = base + a + 3;
                    {
                        let th = vm.thread_mut(tid);
                        th.ensure_stack(cb + 3)?;
                        th.stack[cb + 2] = th.stack[base + a + 2];
                        th.stack[cb + 1] = th.stack[base + a + 1];
                        th.stack[cb] = th.stack[base + a];
                        th.top = cb + 3;
                    }
                    call::call_at(vm, tid, cb, 2, c as i32)?;
                    vm.thread_mut(tid).top = ci_top;
                    let ctrl = vm.thread(tid).stack[cb];
                    if !ctrl.is_nil() {
                        set_reg!(a + 2, ctrl);
                        let j = code[pc];
                        pc = (pc as i64 + 1 + Instruction::get_sbx(j) as i64) as usize;
                    } else {
                        pc += 1;
                    }
                }
                OpCode::SetList => {
                    let b = Instruction::get_b(i) as usize;
                    let c = Instruction::get_c(i) as usize;
                    let n = if b == 0 {
                        vm.thread(tid).top - (base + a) - 1
                    } else {
                        b
                    };
                    let block = if c == 0 {
                        let next = code[pc];
                        pc += 1;
                        next as usize
                    } else {
                        c
                    };
                    let t = reg!(a);
                    debug_assert!(t.is_table());
                    let tbl = t.hvalue();
                    let offset = (block - 1) * FIELDS_PER_FLUSH;
                    for j in 1..=n {
                        let v = reg!(a + j);
                        vm.table_set_int(tbl, (offset + j) as i64, v);
                    }
                    if b == 0 {
                        vm.thread_mut(tid).top = ci_top;
                    }
                }
                OpCode::Close => {
                    vm.close_upvalues(tid, base + a);
                }
                OpCode::Closure => {
                    let bx = Instruction::get_bx(i) as usize;
                    let sub = proto.protos[bx].clone();
                    let nup = sub.nups as usize;
                    let mut captured = Vec::with_capacity(nup);
                    // CLOSURE is followed by one pseudo-instruction per
                    // upvalue: MOVE captures a stack slot, GETUPVAL
                    // re-shares one of ours.
                    for j in 0..nup {
                        let pseudo = code[pc + j];
                        let pb = Instruction::get_b(pseudo) as usize;
                        // The loader has already verified these are
                        // MOVE/GETUPVAL words.
                        if Instruction::raw_opcode(pseudo) == OpCode::Move as u8 {
                            captured.push(vm.open_upvalue(tid, base + pb));
                        } else {
                            captured.push(upvals[pb]);
                        }
                    }
                    pc += nup;
                    let cl = vm.new_lua_closure_with_env(sub, captured, env);
                    set_reg!(a, cl);
                    save_pc!();
                    vm.check_gc();
                }
                OpCode::Vararg => {
                    let b = Instruction::get_b(i) as usize;
                    let (func_pos, n) = {
                        let ci = &vm.thread(tid).frames[frame_idx];
                        (ci.func_pos, ci.num_varargs)
                    };
                    let nfixed = proto.num_params as usize;
                    let wanted = if b == 0 { n } else { b - 1 };
                    {
                        let th = vm.thread_mut(tid);
                        th.ensure_stack(base + a + wanted)?;
                        for j in 0..wanted {
                            let v = if j < n {
                                th.stack[func_pos + 1 + nfixed + j]
                            } else {
                                LuaValue::nil()
                            };
                            th.stack[base + a + j] = v;
                        }
                        if b == 0 {
                            th.top = base + a + n;
                        }
                    }
                }
            }
        }
    }
}

/// FORPREP operand coercion, in place, with the 5.1 error wording.
fn coerce_for_value(
    vm: &mut LuaVM,
    tid: ThreadId,
    slot: usize,
    what: &str,
) -> LuaResult<f64> {
    let v = vm.thread(tid).stack[slot];
    match crate::lua_value::value_to_number(&v, &vm.pool) {
        Some(n) => {
            vm.thread_mut(tid).stack[slot] = LuaValue::number(n);
            Ok(n)
        }
        None => Err(vm.error(format!("'for' {} must be a number", what))),
    }
}

