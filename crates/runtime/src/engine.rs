//! Bytecode Execution Engine
//!
//! The execute loop: fetch, decode, dispatch, count. Traps raised during
//! an instruction are handled at the dispatch boundary: the engine
//! unwinds to the innermost statically-registered trap range, or fails
//! the record when none covers the faulting pc. Sweeps run only here,
//! where every live value is reachable from the stack.
//!
//! Two failure planes never mix: traps are language-level and recoverable
//! (undefined values with a message); host invariant violations (illegal
//! opcode, stack verification failure, overflow of the value stack) are
//! fatal panics.

use tracing::{debug, trace};

use szl_core::Val;
use szl_core::val::{self, InitMode};

use crate::convop;
use crate::frame::{self, SENTINEL_PC};
use crate::opcode::Opcode;
use crate::outputter;
use crate::process::{Process, Status};

/// Execute until the record completes, traps out, hits the step limit, or
/// observes the terminate flag. Returns the status and steps taken.
pub fn execute(p: &mut Process, max_steps: i32) -> (Status, i32) {
    let mut steps = 0;
    loop {
        if p.terminated() {
            debug!("terminate flag observed");
            return (Status::Terminated, steps);
        }
        if steps >= max_steps {
            return (Status::StepLimit, steps);
        }
        p.maybe_sweep();

        let prog = p.program();
        let at = p.pc;
        let op = prog.code.fetch_op(&mut p.pc);
        steps += 1;
        p.steps_total += 1;
        trace!(pc = at, op = op.name(), "dispatch");

        match op {
            Opcode::Nop => {}

            Opcode::VerifySp => {
                let expected = prog.code.int32_at(&mut p.pc);
                let depth = p.expr_depth();
                assert!(
                    depth == expected as usize,
                    "stack verification failed at pc {at}: depth {depth}, expected {expected}"
                );
            }

            // =============================================================
            // Loads
            // =============================================================
            Opcode::LoadV => {
                let v = prog.code.int16_at(&mut p.pc);
                let slot = frame::var_slot(p.bp, v);
                let x = p.stack[slot];
                if x.is_null() {
                    p.trap("undefined variable");
                }
                x.inc_ref();
                p.push(x);
            }

            Opcode::LoadVu => {
                let v = prog.code.int16_at(&mut p.pc);
                let slot = frame::var_slot(p.bp, v);
                let x = p.stack[slot];
                if x.is_null() {
                    p.trap("undefined variable");
                    p.push(Val::NULL);
                } else {
                    let u = x.uniq(&mut p.heap); // consumes the slot's ref
                    p.stack[slot] = u;
                    u.inc_ref();
                    p.push(u);
                }
            }

            Opcode::FloadV => {
                let o = prog.code.uint16_at(&mut p.pc) as usize;
                let t = p.pop();
                if t.is_null() {
                    p.trap("undefined tuple");
                    p.push(Val::NULL);
                } else {
                    let x = val::tuple_slot_at(t, o);
                    if x.is_null() {
                        p.trap("undefined tuple field");
                    }
                    x.inc_ref();
                    t.dec_ref();
                    p.push(x);
                }
            }

            Opcode::FloadVu => {
                let o = prog.code.uint16_at(&mut p.pc) as usize;
                let t = p.pop();
                if t.is_null() {
                    p.trap("undefined tuple");
                    p.push(Val::NULL);
                } else {
                    let x = val::tuple_slot_at(t, o);
                    if x.is_null() {
                        p.trap("undefined tuple field");
                        t.dec_ref();
                        p.push(Val::NULL);
                    } else {
                        let u = x.uniq(&mut p.heap);
                        val::tuple_set_slot_raw(t, o, u);
                        u.inc_ref();
                        t.dec_ref();
                        p.push(u);
                    }
                }
            }

            Opcode::Xload8 => {
                let i = p.pop_int();
                let b = p.pop();
                match check_index(b, i, || val::bytes_length(b)) {
                    Ok(i) => {
                        let x = val::bytes_data(b)[i] as i64;
                        b.dec_ref();
                        p.push(Val::from_smi(x));
                    }
                    Err(msg) => {
                        b.dec_ref();
                        p.trap(msg);
                    }
                }
            }

            Opcode::XloadR => {
                let i = p.pop_int();
                let s = p.pop();
                match check_index(s, i, || val::string_num_runes(s)) {
                    Ok(i) => {
                        let r = val::string_rune_at(s, i) as i64;
                        s.dec_ref();
                        p.push_int(r);
                    }
                    Err(msg) => {
                        s.dec_ref();
                        p.trap(msg);
                    }
                }
            }

            Opcode::XloadV => {
                let i = p.pop_int();
                let a = p.pop();
                match check_index(a, i, || val::array_length(a)) {
                    Ok(i) => {
                        let e = val::array_at(a, i);
                        if e.is_null() {
                            p.trap("undefined array element");
                        }
                        e.inc_ref();
                        a.dec_ref();
                        p.push(e);
                    }
                    Err(msg) => {
                        a.dec_ref();
                        p.trap(msg);
                    }
                }
            }

            Opcode::XloadVu => {
                let i = p.pop_int();
                let a = p.pop();
                match check_index(a, i, || val::array_length(a)) {
                    Ok(i) => {
                        let e = val::array_at(a, i);
                        if e.is_null() {
                            p.trap("undefined array element");
                            a.dec_ref();
                            p.push(Val::NULL);
                        } else {
                            let u = e.uniq(&mut p.heap);
                            val::array_put_raw(a, i, u);
                            u.inc_ref();
                            a.dec_ref();
                            p.push(u);
                        }
                    }
                    Err(msg) => {
                        a.dec_ref();
                        p.trap(msg);
                    }
                }
            }

            Opcode::MindexV | Opcode::MindexVu => {
                let k = p.pop();
                let m = p.pop();
                if m.is_null() {
                    p.trap("undefined map");
                } else {
                    let idx = val::map_ref(m).lookup(k);
                    if idx < 0 {
                        p.trap(format!(
                            "undefined map value for key {}",
                            k.display_string()
                        ));
                    } else {
                        let x = val::map_ref(m).fetch(idx);
                        if op == Opcode::MindexVu && !x.is_null() {
                            let u = x.uniq(&mut p.heap);
                            val::map_ref(m).set_value_raw(idx, u);
                            u.inc_ref();
                            p.push(u);
                        } else {
                            if x.is_null() {
                                p.trap("undefined map value");
                            }
                            x.inc_ref();
                            p.push(x);
                        }
                    }
                }
                k.dec_ref();
                m.dec_ref();
            }

            Opcode::Sload8 => {
                let end = p.pop_int();
                let beg = p.pop_int();
                let b = p.pop();
                if b.is_null() {
                    p.trap("undefined bytes");
                } else {
                    let s = val::new_bytes_slice(&mut p.heap, b, beg, end);
                    p.push(s);
                }
            }

            Opcode::SloadR => {
                let end = p.pop_int();
                let beg = p.pop_int();
                let s = p.pop();
                if s.is_null() {
                    p.trap("undefined string");
                } else {
                    let t = val::new_string_slice(&mut p.heap, s, beg, end);
                    p.push(t);
                }
            }

            Opcode::SloadV => {
                let end = p.pop_int();
                let beg = p.pop_int();
                let a = p.pop();
                if a.is_null() {
                    p.trap("undefined array");
                } else {
                    let s = val::new_array_slice(&mut p.heap, a, beg, end);
                    p.push(s);
                }
            }

            // =============================================================
            // Stores
            // =============================================================
            Opcode::StoreV => {
                let v = prog.code.int16_at(&mut p.pc);
                let x = p.pop();
                let slot = frame::var_slot(p.bp, v);
                p.stack[slot].dec_ref();
                p.stack[slot] = x;
            }

            Opcode::Undefine => {
                let v = prog.code.int16_at(&mut p.pc);
                let slot = frame::var_slot(p.bp, v);
                p.stack[slot].dec_ref();
                p.stack[slot] = Val::NULL;
            }

            Opcode::FstoreV => {
                let o = prog.code.uint16_at(&mut p.pc) as usize;
                let x = p.pop();
                let t = p.pop();
                if t.is_null() {
                    x.dec_ref();
                    p.trap("undefined tuple");
                } else {
                    val::tuple_set_slot(t, o, x);
                    val::tuple_set_bit(t, o);
                    t.dec_ref();
                }
            }

            Opcode::FclearB => {
                let i = prog.code.int32_at(&mut p.pc) as usize;
                let t = p.pop();
                val::tuple_clear_bit(t, i);
                t.dec_ref();
            }

            Opcode::FsetB => {
                let i = prog.code.int32_at(&mut p.pc) as usize;
                let t = p.top();
                val::tuple_set_bit(t, i);
            }

            Opcode::FtestB => {
                let i = prog.code.int32_at(&mut p.pc) as usize;
                let t = p.pop();
                let b = val::tuple_bit_at(t, i);
                t.dec_ref();
                p.push_bool(b);
            }

            Opcode::Xstore8 => {
                let x = p.pop_int();
                let i = p.pop_int();
                let b = p.pop();
                match check_index(b, i, || val::bytes_length(b)) {
                    Ok(i) => {
                        val::bytes_data_mut(b)[i] = x as u8;
                        b.dec_ref();
                    }
                    Err(msg) => {
                        b.dec_ref();
                        p.trap(msg);
                    }
                }
            }

            Opcode::XstoreR => {
                let x = p.pop_int();
                let i = p.pop_int();
                let s = p.pop();
                let r = char::from_u32(x as u32);
                match (check_index(s, i, || val::string_num_runes(s)), r) {
                    (Ok(i), Some(r)) => {
                        val::string_put_rune(&mut p.heap, s, i, r);
                        s.dec_ref();
                    }
                    (Err(msg), _) => {
                        s.dec_ref();
                        p.trap(msg);
                    }
                    (_, None) => {
                        s.dec_ref();
                        p.trap(format!("invalid unicode code point {x}"));
                    }
                }
            }

            Opcode::XstoreV => {
                let x = p.pop();
                let i = p.pop_int();
                let a = p.pop();
                match check_index(a, i, || val::array_length(a)) {
                    Ok(i) => {
                        val::array_put(a, i, x);
                        a.dec_ref();
                    }
                    Err(msg) => {
                        x.dec_ref();
                        a.dec_ref();
                        p.trap(msg);
                    }
                }
            }

            Opcode::MinsertV => {
                let k = p.pop();
                let m = p.pop();
                if m.is_null() {
                    k.dec_ref();
                    p.trap("undefined map");
                    p.push(Val::NULL);
                    p.push(Val::NULL);
                } else {
                    let idx = val::map_ref(m).insert_key(k);
                    p.push(m); // keep the map's reference on the stack
                    p.push(Val::from_smi(idx as i64));
                }
            }

            Opcode::MstoreV => {
                let x = p.pop();
                let idx = p.pop_int();
                let m = p.pop();
                if m.is_null() {
                    x.dec_ref();
                    p.trap("undefined map");
                } else {
                    val::map_ref(m).set_value(idx as i32, x);
                    m.dec_ref();
                }
            }

            Opcode::SstoreV => {
                let x = p.pop();
                let end = p.pop_int();
                let beg = p.pop_int();
                let v = p.pop();
                if v.is_null() || x.is_null() {
                    p.trap("undefined value in slice assignment");
                } else if let Err(msg) = val::put_slice(&mut p.heap, v, beg, end, x) {
                    p.trap(msg);
                }
                x.dec_ref();
                v.dec_ref();
            }

            // =============================================================
            // Increments
            // =============================================================
            Opcode::Inc64 => {
                let v = prog.code.int16_at(&mut p.pc);
                let delta = prog.code.int8_at(&mut p.pc) as i64;
                let slot = frame::var_slot(p.bp, v);
                let x = p.stack[slot];
                if x.is_null() {
                    p.trap("undefined variable");
                } else {
                    let n = val::new_int(&mut p.heap, x.as_int().wrapping_add(delta));
                    x.dec_ref();
                    p.stack[slot] = n;
                }
            }

            Opcode::Finc64 => {
                let o = prog.code.uint16_at(&mut p.pc) as usize;
                let delta = prog.code.int8_at(&mut p.pc) as i64;
                let t = p.pop();
                let x = val::tuple_slot_at(t, o);
                if x.is_null() {
                    p.trap("undefined tuple field");
                } else {
                    let n = val::new_int(&mut p.heap, x.as_int().wrapping_add(delta));
                    val::tuple_set_slot(t, o, n);
                }
                t.dec_ref();
            }

            Opcode::Xinc64 => {
                let delta = prog.code.int8_at(&mut p.pc) as i64;
                let i = p.pop_int();
                let a = p.pop();
                match check_index(a, i, || val::array_length(a)) {
                    Ok(i) => {
                        let x = val::array_at(a, i);
                        if x.is_null() {
                            p.trap("undefined array element");
                        } else {
                            let n = val::new_int(&mut p.heap, x.as_int().wrapping_add(delta));
                            val::array_put(a, i, n);
                        }
                        a.dec_ref();
                    }
                    Err(msg) => {
                        a.dec_ref();
                        p.trap(msg);
                    }
                }
            }

            Opcode::Minc64 => {
                let delta = prog.code.int8_at(&mut p.pc) as i64;
                let idx = p.pop_int();
                let m = p.pop();
                if m.is_null() {
                    p.trap("undefined map");
                } else {
                    let r = {
                        let (heap, map) = (&mut p.heap, val::map_ref(m));
                        map.inc_value(heap, idx as i32, delta)
                    };
                    if let Err(msg) = r {
                        p.trap(msg);
                    }
                    m.dec_ref();
                }
            }

            // =============================================================
            // Stack
            // =============================================================
            Opcode::Push8 => {
                let c = prog.code.int8_at(&mut p.pc);
                p.push(Val::from_smi(c as i64));
            }

            Opcode::PushV => {
                let i = prog.code.uint32_at(&mut p.pc);
                let lit = prog.literal_at(i);
                lit.inc_ref();
                p.push(lit);
            }

            Opcode::DupV => {
                let v = p.top();
                v.inc_ref();
                p.push(v);
            }

            Opcode::PopV => {
                p.pop().dec_ref();
            }

            // =============================================================
            // Aggregate creation
            // =============================================================
            Opcode::NewB => {
                let init = p.pop_int();
                let len = p.pop_int();
                if len < 0 {
                    p.trap(format!("negative length {len} in new(bytes)"));
                } else {
                    let v = val::new_bytes(&mut p.heap, len as usize);
                    val::bytes_data_mut(v).fill(init as u8);
                    p.push(v);
                }
            }

            Opcode::NewStr => {
                let init = p.pop_int();
                let len = p.pop_int();
                match (len, char::from_u32(init as u32)) {
                    (n, Some(r)) if n >= 0 => {
                        let v = val::new_string_fill(&mut p.heap, n as usize, r);
                        p.push(v);
                    }
                    (n, _) if n < 0 => p.trap(format!("negative length {n} in new(string)")),
                    _ => p.trap(format!("invalid unicode code point {init}")),
                }
            }

            Opcode::NewA => {
                let t = prog.type_at(prog.code.uint32_at(&mut p.pc));
                let init = p.pop();
                let len = p.pop_int();
                if len < 0 {
                    init.dec_ref();
                    p.trap(format!("negative length {len} in new(array)"));
                } else {
                    let v = val::new_array_init(&mut p.heap, t, len as usize, init);
                    init.dec_ref();
                    p.push(v);
                }
            }

            Opcode::NewM => {
                let t = prog.type_at(prog.code.uint32_at(&mut p.pc));
                let hint = p.pop_int().max(0) as usize;
                let v = val::new_map(&mut p.heap, t, hint);
                p.push(v);
            }

            Opcode::CreateA => {
                let n = prog.code.int32_at(&mut p.pc) as usize;
                let t = prog.type_at(prog.code.uint32_at(&mut p.pc));
                let v = val::new_array(&mut p.heap, t, n);
                for i in (0..n).rev() {
                    let e = p.pop();
                    val::array_put(v, i, e);
                }
                p.push(v);
            }

            Opcode::CreateT => {
                let t = prog.type_at(prog.code.uint32_at(&mut p.pc));
                let n = t.as_tuple().nslots as usize;
                let v = val::new_tuple(&mut p.heap, t, InitMode::SetInproto);
                for i in (0..n).rev() {
                    let e = p.pop();
                    val::tuple_set_slot(v, i, e);
                }
                p.push(v);
            }

            Opcode::CreateM => {
                let n = prog.code.int32_at(&mut p.pc) as usize; // pair count
                let t = prog.type_at(prog.code.uint32_at(&mut p.pc));
                let mut kv = vec![Val::NULL; 2 * n];
                for i in (0..2 * n).rev() {
                    kv[i] = p.pop();
                }
                let v = val::new_map(&mut p.heap, t, n);
                for pair in kv.chunks(2) {
                    let m = val::map_ref(v);
                    let idx = m.insert_key(pair[0]);
                    m.set_value(idx, pair[1]);
                }
                p.push(v);
            }

            Opcode::CreateC => {
                let entry = prog.code.pcoff_at(&mut p.pc) as u32;
                let delta = prog.code.int8_at(&mut p.pc) as u8;
                let t = prog.type_at(prog.code.uint32_at(&mut p.pc));
                let ctx = frame::base(&p.stack, p.fp, delta) as u32;
                let v = val::new_closure(&mut p.heap, t, entry, ctx);
                p.push(v);
            }

            // =============================================================
            // Arithmetic and logic
            // =============================================================
            Opcode::AndBool => {
                let y = p.pop_bool();
                let x = p.pop_bool();
                p.push_bool(x && y);
            }
            Opcode::OrBool => {
                let y = p.pop_bool();
                let x = p.pop_bool();
                p.push_bool(x || y);
            }

            Opcode::AddInt => int_binop(p, |x, y| Ok(x.wrapping_add(y))),
            Opcode::SubInt => int_binop(p, |x, y| Ok(x.wrapping_sub(y))),
            Opcode::MulInt => int_binop(p, |x, y| Ok(x.wrapping_mul(y))),
            Opcode::DivInt => int_binop(p, |x, y| {
                if y == 0 {
                    Err("divide by zero".to_string())
                } else {
                    Ok(x.wrapping_div(y))
                }
            }),
            Opcode::ModInt => int_binop(p, |x, y| {
                if y == 0 {
                    Err("divide by zero".to_string())
                } else {
                    Ok(x.wrapping_rem(y))
                }
            }),

            Opcode::AddUint => uint_binop(p, |x, y| Ok(x.wrapping_add(y))),
            Opcode::SubUint => uint_binop(p, |x, y| Ok(x.wrapping_sub(y))),
            Opcode::MulUint => uint_binop(p, |x, y| Ok(x.wrapping_mul(y))),
            Opcode::DivUint => uint_binop(p, |x, y| {
                if y == 0 {
                    Err("divide by zero".to_string())
                } else {
                    Ok(x / y)
                }
            }),
            Opcode::ModUint => uint_binop(p, |x, y| {
                if y == 0 {
                    Err("divide by zero".to_string())
                } else {
                    Ok(x % y)
                }
            }),

            Opcode::AddFloat => float_binop(p, |x, y| x + y),
            Opcode::SubFloat => float_binop(p, |x, y| x - y),
            Opcode::MulFloat => float_binop(p, |x, y| x * y),
            Opcode::DivFloat => float_binop(p, |x, y| x / y),

            Opcode::AddFpr => {
                let y = p.pop_bits();
                let x = p.pop_bits();
                let v = val::new_fingerprint(
                    &mut p.heap,
                    szl_core::fingerprint::fingerprint_cat(x, y),
                );
                p.push(v);
            }

            Opcode::AddArray => {
                let y = p.pop();
                let x = p.pop();
                let (nx, ny) = (val::array_length(x), val::array_length(y));
                let v = val::new_array(&mut p.heap, x.type_(), nx + ny);
                for i in 0..nx {
                    let e = val::array_at(x, i);
                    e.inc_ref();
                    val::array_put(v, i, e);
                }
                for i in 0..ny {
                    let e = val::array_at(y, i);
                    e.inc_ref();
                    val::array_put(v, nx + i, e);
                }
                x.dec_ref();
                y.dec_ref();
                p.push(v);
            }

            Opcode::AddBytes => {
                let y = p.pop();
                let x = p.pop();
                let mut data = Vec::with_capacity(val::bytes_length(x) + val::bytes_length(y));
                data.extend_from_slice(val::bytes_data(x));
                data.extend_from_slice(val::bytes_data(y));
                let v = val::new_bytes_init(&mut p.heap, &data);
                x.dec_ref();
                y.dec_ref();
                p.push(v);
            }

            Opcode::AddString => {
                let y = p.pop();
                let x = p.pop();
                let mut s = String::with_capacity(
                    val::string_byte_length(x) + val::string_byte_length(y),
                );
                s.push_str(val::string_str(x));
                s.push_str(val::string_str(y));
                let v = val::new_string(&mut p.heap, &s);
                x.dec_ref();
                y.dec_ref();
                p.push(v);
            }

            Opcode::AddTime => {
                let y = p.pop_bits();
                let x = p.pop_bits();
                let v = val::new_time(&mut p.heap, x.wrapping_add(y));
                p.push(v);
            }
            Opcode::SubTime => {
                let y = p.pop_bits();
                let x = p.pop_bits();
                let v = val::new_time(&mut p.heap, x.wrapping_sub(y));
                p.push(v);
            }

            Opcode::ShlInt => int_binop(p, |x, y| Ok(x.wrapping_shl(y as u32 & 63))),
            Opcode::ShrInt => int_binop(p, |x, y| Ok(x.wrapping_shr(y as u32 & 63))),
            Opcode::AndInt => int_binop(p, |x, y| Ok(x & y)),
            Opcode::OrInt => int_binop(p, |x, y| Ok(x | y)),
            Opcode::XorInt => int_binop(p, |x, y| Ok(x ^ y)),
            Opcode::ShlUint => uint_binop(p, |x, y| Ok(x.wrapping_shl(y as u32 & 63))),
            Opcode::ShrUint => uint_binop(p, |x, y| Ok(x.wrapping_shr(y as u32 & 63))),
            Opcode::AndUint => uint_binop(p, |x, y| Ok(x & y)),
            Opcode::OrUint => uint_binop(p, |x, y| Ok(x | y)),
            Opcode::XorUint => uint_binop(p, |x, y| Ok(x ^ y)),

            // =============================================================
            // Condition code and comparisons
            // =============================================================
            Opcode::SetCc => {
                p.cc = p.pop_bool();
            }
            Opcode::GetCc => {
                let cc = p.cc;
                p.push_bool(cc);
            }

            Opcode::EqlBits => bits_cmp(p, |x, y| x == y),
            Opcode::NeqBits => bits_cmp(p, |x, y| x != y),
            Opcode::LssBits => bits_cmp(p, |x, y| x < y),
            Opcode::LeqBits => bits_cmp(p, |x, y| x <= y),
            Opcode::GtrBits => bits_cmp(p, |x, y| x > y),
            Opcode::GeqBits => bits_cmp(p, |x, y| x >= y),

            Opcode::EqlFloat => float_cmp(p, |x, y| x == y),
            Opcode::NeqFloat => float_cmp(p, |x, y| x != y),
            Opcode::LssFloat => float_cmp(p, |x, y| x < y),
            Opcode::LeqFloat => float_cmp(p, |x, y| x <= y),
            Opcode::GtrFloat => float_cmp(p, |x, y| x > y),
            Opcode::GeqFloat => float_cmp(p, |x, y| x >= y),

            Opcode::LssInt => int_cmp(p, |x, y| x < y),
            Opcode::LeqInt => int_cmp(p, |x, y| x <= y),
            Opcode::GtrInt => int_cmp(p, |x, y| x > y),
            Opcode::GeqInt => int_cmp(p, |x, y| x >= y),

            Opcode::EqlString => data_cmp(p, true, |o| o.is_eq()),
            Opcode::NeqString => data_cmp(p, true, |o| o.is_ne()),
            Opcode::LssString => data_cmp(p, true, |o| o.is_lt()),
            Opcode::LeqString => data_cmp(p, true, |o| o.is_le()),
            Opcode::GtrString => data_cmp(p, true, |o| o.is_gt()),
            Opcode::GeqString => data_cmp(p, true, |o| o.is_ge()),

            Opcode::EqlBytes => data_cmp(p, false, |o| o.is_eq()),
            Opcode::NeqBytes => data_cmp(p, false, |o| o.is_ne()),
            Opcode::LssBytes => data_cmp(p, false, |o| o.is_lt()),
            Opcode::LeqBytes => data_cmp(p, false, |o| o.is_le()),
            Opcode::GtrBytes => data_cmp(p, false, |o| o.is_gt()),
            Opcode::GeqBytes => data_cmp(p, false, |o| o.is_ge()),

            Opcode::EqlArray
            | Opcode::EqlMap
            | Opcode::EqlTuple
            | Opcode::EqlClosure => deep_cmp(p, false),
            Opcode::NeqArray
            | Opcode::NeqMap
            | Opcode::NeqTuple
            | Opcode::NeqClosure => deep_cmp(p, true),

            // =============================================================
            // Conversions
            // =============================================================
            Opcode::Basicconv => {
                let op = prog.code.uint8_at(&mut p.pc);
                let ti = prog.code.uint32_at(&mut p.pc);
                let t = (ti != u32::MAX).then(|| prog.type_at(ti));
                if let Err(msg) = convop::convert_basic(p, op, t) {
                    p.trap(msg);
                }
            }

            Opcode::Arrayconv => {
                let op = prog.code.uint8_at(&mut p.pc);
                let ti = prog.code.uint32_at(&mut p.pc);
                let t = (ti != u32::MAX).then(|| prog.type_at(ti));
                if let Err(msg) = convop::convert_array(p, op, t) {
                    p.trap(msg);
                }
            }

            Opcode::Mapconv => {
                let t = prog.type_at(prog.code.uint32_at(&mut p.pc));
                let kop = prog.code.uint8_at(&mut p.pc);
                let vop = prog.code.uint8_at(&mut p.pc);
                if let Err(msg) = convop::convert_array_to_map(p, t, kop, vop) {
                    p.trap(msg);
                }
            }

            // =============================================================
            // Control
            // =============================================================
            Opcode::Branch => {
                p.pc = prog.code.pcoff_at(&mut p.pc);
            }
            Opcode::BranchTrue => {
                let target = prog.code.pcoff_at(&mut p.pc);
                if p.cc {
                    p.pc = target;
                }
            }
            Opcode::BranchFalse => {
                let target = prog.code.pcoff_at(&mut p.pc);
                if !p.cc {
                    p.pc = target;
                }
            }
            Opcode::TrapFalse => {
                let s = prog.code.uint32_at(&mut p.pc);
                if !p.cc {
                    p.trap(prog.string_at(s).to_string());
                }
            }

            Opcode::Enter => {
                let nlocals = prog.code.int32_at(&mut p.pc);
                let frame_size = prog.code.int32_at(&mut p.pc);
                if p.sp < frame_size as usize {
                    panic!("value stack overflow entering function at pc {at}");
                }
                for _ in 0..nlocals {
                    p.push(Val::NULL);
                }
            }

            Opcode::SetBp => {
                let delta = prog.code.int8_at(&mut p.pc) as u8;
                p.bp = frame::base(&p.stack, p.fp, delta);
            }

            Opcode::Callc | Opcode::Callcnf => {
                let i = prog.code.uint32_at(&mut p.pc);
                let f = prog.natives[i as usize];
                if let Err(msg) = f(p) {
                    p.trap(msg);
                }
            }

            Opcode::Call => {
                let c = p.pop();
                if c.is_null() {
                    p.trap("undefined function");
                } else {
                    let entry = val::closure_entry(c) as usize;
                    let ctx = val::closure_context(c) as usize;
                    c.dec_ref();
                    push_frame(p, entry, ctx);
                }
            }

            Opcode::Calli => {
                let entry = prog.code.pcoff_at(&mut p.pc);
                let ctx = p.globals_fp;
                push_frame(p, entry, ctx);
            }

            Opcode::Ret => {
                let nparams = prog.code.int16_at(&mut p.pc) as usize;
                if let Some(status) = do_ret(p, nparams) {
                    return (status, steps);
                }
            }

            Opcode::RetV => {
                let nparams = prog.code.int16_at(&mut p.pc) as usize;
                let r = p.pop();
                match do_ret(p, nparams) {
                    Some(status) => {
                        r.dec_ref();
                        return (status, steps);
                    }
                    None => p.push(r),
                }
            }

            Opcode::RetU => {
                let nparams = prog.code.int16_at(&mut p.pc) as usize;
                match do_ret(p, nparams) {
                    Some(status) => return (status, steps),
                    None => {
                        p.push(Val::NULL);
                        p.trap("function did not return a value");
                    }
                }
            }

            Opcode::Terminate => {
                return (Status::Terminated, steps);
            }

            Opcode::Stop => {
                let s = prog.code.uint32_at(&mut p.pc);
                let msg = prog.string_at(s).to_string();
                debug!(msg = %msg, "stop");
                p.set_error(&msg);
                return (Status::Failed, steps);
            }

            Opcode::Emit => {
                let table = prog.code.uint16_at(&mut p.pc);
                if p.terminated() {
                    return (Status::Terminated, steps);
                }
                if let Err(msg) = outputter::emit(p, table) {
                    p.trap(msg);
                }
            }

            Opcode::Illegal => {
                panic!("illegal instruction at pc {at}");
            }
        }

        if p.has_trap() {
            if let Some(status) = handle_trap(p) {
                return (status, steps);
            }
        }
    }
}

/// Check an index against a container length. The length is computed
/// lazily so an undefined container is caught first.
fn check_index(v: Val, i: i64, len: impl FnOnce() -> usize) -> Result<usize, String> {
    if v.is_null() {
        return Err("undefined value".to_string());
    }
    let len = len();
    if i < 0 || i as usize >= len {
        return Err(format!("index {i} out of range (length {len})"));
    }
    Ok(i as usize)
}

fn int_binop(p: &mut Process, f: impl FnOnce(i64, i64) -> Result<i64, String>) {
    let y = p.pop_int();
    let x = p.pop_int();
    match f(x, y) {
        Ok(r) => p.push_int(r),
        Err(msg) => p.trap(msg),
    }
}

fn uint_binop(p: &mut Process, f: impl FnOnce(u64, u64) -> Result<u64, String>) {
    let y = p.pop_uint();
    let x = p.pop_uint();
    match f(x, y) {
        Ok(r) => p.push_uint(r),
        Err(msg) => p.trap(msg),
    }
}

fn float_binop(p: &mut Process, f: impl FnOnce(f64, f64) -> f64) {
    let y = p.pop_float();
    let x = p.pop_float();
    let r = f(x, y);
    p.push_float(r);
}

fn bits_cmp(p: &mut Process, f: impl FnOnce(u64, u64) -> bool) {
    let y = p.pop_bits();
    let x = p.pop_bits();
    p.cc = f(x, y);
}

fn int_cmp(p: &mut Process, f: impl FnOnce(i64, i64) -> bool) {
    let y = p.pop_int();
    let x = p.pop_int();
    p.cc = f(x, y);
}

fn float_cmp(p: &mut Process, f: impl FnOnce(f64, f64) -> bool) {
    let y = p.pop_float();
    let x = p.pop_float();
    p.cc = f(x, y);
}

fn data_cmp(p: &mut Process, strings: bool, f: impl FnOnce(std::cmp::Ordering) -> bool) {
    let y = p.pop();
    let x = p.pop();
    let o = if strings {
        val::string_data(x).cmp(val::string_data(y))
    } else {
        val::bytes_data(x).cmp(val::bytes_data(y))
    };
    x.dec_ref();
    y.dec_ref();
    p.cc = f(o);
}

/// Deep equality through the forms (arrays, maps, tuples, closures).
fn deep_cmp(p: &mut Process, negate: bool) {
    let y = p.pop();
    let x = p.pop();
    let eq = x.is_equal(y);
    x.dec_ref();
    y.dec_ref();
    p.cc = eq != negate;
}

fn push_frame(p: &mut Process, entry: usize, static_link: usize) {
    p.push(Val::from_smi(p.pc as i64)); // return_pc
    p.push(Val::from_smi(p.fp as i64)); // dynamic_link
    p.push(Val::from_smi(static_link as i64)); // static_link
    p.fp = p.sp + frame::FRAME_SLOTS - 1;
    p.bp = p.fp;
    p.pc = entry;
}

/// Pop the current frame: release locals, operands and `nparams`
/// parameters, restore the caller's registers. Returns Completed when the
/// frame's return pc is the record sentinel.
fn do_ret(p: &mut Process, nparams: usize) -> Option<Status> {
    let fp = p.fp;
    let ret = frame::return_pc(&p.stack, fp);
    let dynl = frame::dynamic_link(&p.stack, fp);
    p.release_to(fp + 1 + nparams);
    p.fp = dynl;
    p.bp = dynl;
    if ret == SENTINEL_PC {
        Some(Status::Completed)
    } else {
        p.pc = ret;
        None
    }
}

/// Unwind to the innermost trap range covering the current pc, walking
/// caller frames when the faulting frame has none. Without a handler the
/// record fails and the undef counters are updated.
fn handle_trap(p: &mut Process) -> Option<Status> {
    let msg = p.take_trap().expect("trap pending");
    debug!(msg = %msg, pc = p.pc, "trap");
    loop {
        if let Some(r) = p.program().find_trap_range(p.pc) {
            let target_sp = p.fp - r.sp_offset as usize;
            p.release_to(target_sp);
            p.pc = r.target as usize;
            return None;
        }
        let fp = p.fp;
        let ret = frame::return_pc(&p.stack, fp);
        if fp == p.globals_fp || ret == SENTINEL_PC {
            p.record_undef(&msg);
            return Some(Status::Failed);
        }
        p.pc = ret;
        let dynl = frame::dynamic_link(&p.stack, fp);
        p.fp = dynl;
        p.bp = dynl;
    }
}
