// The instruction engine: fetch-decode-execute one instruction per
// `step()`, dispatching on the semantic form the decode tables assign to
// each raw opcode. Register/flag state lives in `Memory`'s overlay (see
// `memory.rs`); this module owns IP, the prefix latches, and the
// dispatch switch itself.

use crate::decode::DecodeTables;
use crate::devices::Host;
use crate::flags;
use crate::memory::{linear, Flag, Memory, Reg16, Reg8};
use crate::ports::Ports;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepMode {
    Repz,
    Repnz,
}

/// One decoded effective-address-or-register operand. `Mem` carries the
/// already-resolved linear address; `decode_modrm` is the only place that
/// computes one, so the rest of the dispatch never repeats the mod/rm
/// arithmetic.
#[derive(Debug, Clone, Copy)]
pub enum Operand {
    Reg8(Reg8),
    Reg16(Reg16),
    Mem(usize),
}

pub struct Cpu {
    pub mem: Memory,
    pub tables: DecodeTables,
    pub ports: Ports,
    pub ip: u16,
    pub halted: bool,
    seg_override: Option<Reg16>,
    seg_override_ttl: u8,
    rep: Option<RepMode>,
    rep_ttl: u8,
    /// Set when the instruction just executed was a jump/call/return that
    /// assigned IP directly; suppresses the generic post-dispatch advance.
    ip_branched: bool,
}

impl Cpu {
    pub fn new(tables: DecodeTables) -> Self {
        let mut mem = Memory::new();
        mem.set_reg16(Reg16::Cs, crate::memory::BIOS_ENTRY_CS);
        Cpu {
            mem,
            tables,
            ports: Ports::new(),
            ip: crate::memory::BIOS_ENTRY_IP,
            halted: false,
            seg_override: None,
            seg_override_ttl: 0,
            rep: None,
            rep_ttl: 0,
            ip_branched: false,
        }
    }

    fn ports_synthesized_in(&mut self, addr: u16) -> Option<u8> {
        self.ports.synthesized_in(addr)
    }

    fn ports_synthesized_out(&mut self, addr: u16, value: u8) -> bool {
        self.ports.raw_out(addr, value);
        self.ports.synthesized_out(addr, value)
    }

    fn ports_raw_in(&self, addr: u16) -> u8 {
        self.ports.raw_in(addr)
    }

    fn ports_raw_out(&mut self, addr: u16, value: u8) {
        self.ports.raw_out(addr, value);
    }

    fn cs(&self) -> u16 {
        self.mem.reg16(Reg16::Cs)
    }

    fn fetch_u8(&mut self) -> u8 {
        let addr = linear(self.cs(), self.ip);
        let byte = self.mem.read_u8(addr);
        self.ip = self.ip.wrapping_add(1);
        byte
    }

    fn fetch_u16(&mut self) -> u16 {
        let lo = self.fetch_u8() as u16;
        let hi = self.fetch_u8() as u16;
        lo | (hi << 8)
    }

    fn fetch_i8(&mut self) -> i8 {
        self.fetch_u8() as i8
    }

    fn default_data_segment(&self) -> Reg16 {
        self.seg_override.unwrap_or(Reg16::Ds)
    }

    /// Decodes a mod/reg/rm byte, returning the `reg` field and the
    /// operand selected by `mod`/`rm`. Segment defaults follow the 8086
    /// table: BP-based modes default to SS, everything else to DS,
    /// subject to an active segment-override prefix.
    fn decode_modrm(&mut self) -> (u8, Operand) {
        let byte = self.fetch_u8();
        let md = byte >> 6;
        let reg = (byte >> 3) & 0b111;
        let rm = byte & 0b111;

        if md == 0b11 {
            return (reg, Operand::Reg16(Reg16::from_index(rm as usize)));
        }

        let (base, default_seg) = match rm {
            0 => (self.mem.reg16(Reg16::Bx).wrapping_add(self.mem.reg16(Reg16::Si)), Reg16::Ds),
            1 => (self.mem.reg16(Reg16::Bx).wrapping_add(self.mem.reg16(Reg16::Di)), Reg16::Ds),
            2 => (self.mem.reg16(Reg16::Bp).wrapping_add(self.mem.reg16(Reg16::Si)), Reg16::Ss),
            3 => (self.mem.reg16(Reg16::Bp).wrapping_add(self.mem.reg16(Reg16::Di)), Reg16::Ss),
            4 => (self.mem.reg16(Reg16::Si), Reg16::Ds),
            5 => (self.mem.reg16(Reg16::Di), Reg16::Ds),
            6 if md == 0 => {
                let disp = self.fetch_u16();
                let seg = self.seg_override.unwrap_or(Reg16::Ds);
                let addr = linear(self.mem.reg16(seg), disp);
                return (reg, Operand::Mem(addr));
            }
            6 => (self.mem.reg16(Reg16::Bp), Reg16::Ss),
            7 => (self.mem.reg16(Reg16::Bx), Reg16::Ds),
            _ => unreachable!(),
        };

        let disp: u16 = match md {
            0 => 0,
            1 => self.fetch_i8() as i16 as u16,
            2 => self.fetch_u16(),
            _ => unreachable!(),
        };

        let seg = self.seg_override.unwrap_or(default_seg);
        let offset = base.wrapping_add(disp);
        (reg, Operand::Mem(linear(self.mem.reg16(seg), offset)))
    }

    fn reg8_operand(&self, index: u8) -> Operand {
        Operand::Reg8(Reg8::from_index(index as usize))
    }

    fn reg16_operand(&self, index: u8) -> Operand {
        Operand::Reg16(Reg16::from_index(index as usize))
    }

    fn read8(&self, op: Operand) -> u8 {
        match op {
            Operand::Reg8(r) => self.mem.reg8(r),
            Operand::Reg16(r) => self.mem.reg16(r) as u8,
            Operand::Mem(addr) => self.mem.read_u8(addr),
        }
    }

    fn write8(&mut self, op: Operand, value: u8) {
        match op {
            Operand::Reg8(r) => self.mem.set_reg8(r, value),
            Operand::Reg16(r) => {
                let hi = self.mem.reg16(r) & 0xff00;
                self.mem.set_reg16(r, hi | value as u16);
            }
            Operand::Mem(addr) => self.mem.write_u8(addr, value),
        }
    }

    fn read16(&self, op: Operand) -> u16 {
        match op {
            Operand::Reg16(r) => self.mem.reg16(r),
            Operand::Reg8(r) => self.mem.reg8(r) as u16,
            Operand::Mem(addr) => self.mem.read_u16(addr),
        }
    }

    fn write16(&mut self, op: Operand, value: u16) {
        match op {
            Operand::Reg16(r) => self.mem.set_reg16(r, value),
            Operand::Reg8(r) => self.mem.set_reg8(r, value as u8),
            Operand::Mem(addr) => self.mem.write_u16(addr, value),
        }
    }

    fn sreg_operand(&self, index: u8) -> Reg16 {
        match index & 0b11 {
            0 => Reg16::Es,
            1 => Reg16::Cs,
            2 => Reg16::Ss,
            _ => Reg16::Ds,
        }
    }

    // --- flags ---------------------------------------------------------

    fn apply_szp8(&mut self, result: u8) {
        self.mem.set_flag(Flag::Sf, flags::sf8(result));
        self.mem.set_flag(Flag::Zf, flags::zf8(result));
        self.mem.set_flag(Flag::Pf, flags::pf(result as u16));
    }

    fn apply_szp16(&mut self, result: u16) {
        self.mem.set_flag(Flag::Sf, flags::sf16(result));
        self.mem.set_flag(Flag::Zf, flags::zf16(result));
        self.mem.set_flag(Flag::Pf, flags::pf(result));
    }

    fn apply_logic_clear(&mut self) {
        self.mem.set_flag(Flag::Of, false);
        self.mem.set_flag(Flag::Cf, false);
    }

    /// ADD-family: `dst op= src`, returning the result. Updates CF/OF/AF
    /// plus SZP, per the spec's arithmetic flags class.
    fn alu_add8(&mut self, dst: u8, src: u8, carry_in: bool) -> u8 {
        let result = dst.wrapping_add(src).wrapping_add(carry_in as u8);
        self.mem.set_flag(Flag::Cf, flags::cf_add8_carry(dst, src, carry_in));
        self.mem.set_flag(Flag::Of, flags::of_add8(dst, src, result));
        self.mem.set_flag(Flag::Af, flags::af_add(dst as u16, src as u16, result as u16));
        self.apply_szp8(result);
        result
    }

    fn alu_add16(&mut self, dst: u16, src: u16, carry_in: bool) -> u16 {
        let result = dst.wrapping_add(src).wrapping_add(carry_in as u16);
        self.mem.set_flag(Flag::Cf, flags::cf_add16_carry(dst, src, carry_in));
        self.mem.set_flag(Flag::Of, flags::of_add16(dst, src, result));
        self.mem.set_flag(Flag::Af, flags::af_add(dst, src, result));
        self.apply_szp16(result);
        result
    }

    fn alu_sub8(&mut self, dst: u8, src: u8, borrow_in: bool) -> u8 {
        let result = dst.wrapping_sub(src).wrapping_sub(borrow_in as u8);
        self.mem.set_flag(Flag::Cf, flags::cf_sub8_borrow(dst, src, borrow_in));
        self.mem.set_flag(Flag::Of, flags::of_sub8(dst, src, result));
        self.mem.set_flag(Flag::Af, flags::af_sub(dst as u16, src as u16, result as u16));
        self.apply_szp8(result);
        result
    }

    fn alu_sub16(&mut self, dst: u16, src: u16, borrow_in: bool) -> u16 {
        let result = dst.wrapping_sub(src).wrapping_sub(borrow_in as u16);
        self.mem.set_flag(Flag::Cf, flags::cf_sub16_borrow(dst, src, borrow_in));
        self.mem.set_flag(Flag::Of, flags::of_sub16(dst, src, result));
        self.mem.set_flag(Flag::Af, flags::af_sub(dst, src, result));
        self.apply_szp16(result);
        result
    }

    fn alu_logic8(&mut self, result: u8) -> u8 {
        self.apply_szp8(result);
        self.apply_logic_clear();
        result
    }

    fn alu_logic16(&mut self, result: u16) -> u16 {
        self.apply_szp16(result);
        self.apply_logic_clear();
        result
    }

    fn jump_near(&mut self, target: u16) {
        self.ip = target;
        self.ip_branched = true;
    }

    fn condition_true(&self, opcode: u8) -> bool {
        let group = (opcode >> 1) & 0b111;
        let invert = opcode & 1 != 0;
        let pred = match group {
            0 => self.mem.flag(Flag::Of),
            1 => self.mem.flag(Flag::Cf),
            2 => self.mem.flag(Flag::Zf),
            3 => self.mem.flag(Flag::Cf) || self.mem.flag(Flag::Zf),
            4 => self.mem.flag(Flag::Sf),
            5 => self.mem.flag(Flag::Pf),
            6 => self.mem.flag(Flag::Sf) != self.mem.flag(Flag::Of),
            7 => self.mem.flag(Flag::Zf) || (self.mem.flag(Flag::Sf) != self.mem.flag(Flag::Of)),
            _ => unreachable!(),
        };
        pred != invert
    }

    /// Advances one guest instruction. Returns `false` once CS:IP reaches
    /// 0:0, the documented halt condition.
    pub fn step(&mut self, host: &mut Host) -> bool {
        if self.halted {
            return false;
        }

        self.tick_prefix_ttls();
        self.ip_branched = false;

        // Latched before dispatch: the trap fires after the instruction
        // that had TF set completes, not after whatever TF ends up as
        // once the instruction (or the trap delivery itself) has run.
        let tf_before = self.mem.flag(Flag::Tf);

        let opcode = self.fetch_u8();
        let w = opcode & 1 != 0;
        let d = opcode & 2 != 0;
        let form = self.tables.xlat_opcode(opcode);

        self.dispatch(form, opcode, w, d, host);

        // Segment-override and REP prefixes persist for exactly the one
        // instruction that follows them; everything else resets the
        // latches set during decode of a non-prefix instruction.
        if form != 23 && form != 27 {
            self.seg_override = None;
            self.rep = None;
        }

        if tf_before {
            self.deliver_interrupt(crate::interrupts::VEC_SINGLE_STEP);
        }

        !(self.cs() == 0 && self.ip == 0)
    }

    fn tick_prefix_ttls(&mut self) {
        if self.seg_override_ttl > 0 {
            self.seg_override_ttl -= 1;
            if self.seg_override_ttl == 0 {
                self.seg_override = None;
            }
        }
        if self.rep_ttl > 0 {
            self.rep_ttl -= 1;
            if self.rep_ttl == 0 {
                self.rep = None;
            }
        }
    }

    fn dispatch(&mut self, form: u8, opcode: u8, w: bool, d: bool, host: &mut Host) {
        match form {
            0 => self.exec_conditional_jump(opcode),
            1 => self.exec_mov_imm_to_reg(opcode),
            2 => self.exec_inc_dec_reg(opcode),
            3 => self.exec_push_reg(opcode),
            4 => self.exec_pop_reg(opcode),
            5 => self.exec_group_ff(w),
            6 => self.exec_group_f6(w),
            7 | 8 | 9 => self.exec_alu_group(form, opcode, w, d),
            10 => self.exec_mov_rm_reg(w, d),
            11 => self.exec_mov_sreg_rm(d),
            12 => self.exec_shift_group(opcode, w),
            13 => self.exec_loop_group(opcode),
            14 => self.exec_jmp_call_near_far(opcode),
            15 => self.exec_test_rm_reg(w),
            16 => self.exec_xchg(opcode, w),
            17 | 18 => self.exec_string_op(opcode, w, host),
            19 => self.exec_ret_group(opcode),
            20 => self.exec_mov_acc_abs(w, d),
            21 => self.exec_in(opcode, w, host),
            22 => self.exec_out(opcode, w, host),
            23 => self.exec_rep_prefix(opcode),
            25 => self.exec_push_sreg(opcode),
            26 => self.exec_pop_sreg(opcode),
            27 => self.exec_segment_override(opcode),
            28 => self.exec_daa(),
            29 => self.exec_das(),
            30 => self.exec_aaa(),
            31 => self.exec_aas(),
            32 => self.exec_call_far(),
            33 => self.exec_pushf(),
            34 => self.exec_popf(),
            35 => self.exec_cbw(),
            36 => self.exec_cwd(),
            37 => self.exec_les_lds(opcode),
            38 => self.exec_int3(host),
            39 => self.exec_int_imm(host),
            40 => self.exec_into(host),
            41 => self.exec_lea(),
            42 => self.exec_pop_rm(),
            43 => self.exec_sahf_lahf(opcode),
            44 => self.exec_xlat(),
            45 => self.exec_salc(),
            46 => self.exec_flag_bit_ops(opcode),
            47 => self.exec_test_acc_imm(w),
            48 => {
                let subcode = self.fetch_u8();
                self.exec_host_opcode(subcode, host);
            }
            56 => self.exec_mov_rm_imm(w),
            57 => self.exec_aam(host),
            58 => self.exec_aad(),
            59 => {
                self.halted = true;
            }
            49..=55 => {
                // 80186/FPU/WAIT/undocumented: outside the modeled ISA.
                // The canonical table assigns these forms a plausible
                // instruction length (immediate/modrm as appropriate) via
                // ad hoc handling here so IP still advances sanely.
                self.exec_unmodeled(opcode);
            }
            _ => self.exec_unmodeled(opcode),
        }
    }

    fn exec_unmodeled(&mut self, _opcode: u8) {
        tracing::debug!("executed unmodeled opcode as no-op");
    }

    fn exec_conditional_jump(&mut self, opcode: u8) {
        let disp = self.fetch_i8();
        if self.condition_true(opcode) {
            let target = (self.ip as i32 + disp as i32) as u16;
            self.jump_near(target);
        }
    }

    fn exec_mov_imm_to_reg(&mut self, opcode: u8) {
        // 0xB0-0xB7 are the byte form, 0xB8-0xBF the word form -- this
        // block's width lives in bit 3 of the opcode, not the generic
        // bit-0 `w` the rest of the dispatch uses.
        let index = opcode & 0b111;
        let w = opcode & 0x08 != 0;
        if w {
            let value = self.fetch_u16();
            self.mem.set_reg16(Reg16::from_index(index as usize), value);
        } else {
            let value = self.fetch_u8();
            self.mem.set_reg8(Reg8::from_index(index as usize), value);
        }
    }

    fn exec_inc_dec_reg(&mut self, opcode: u8) {
        let index = opcode & 0b111;
        let is_dec = opcode & 0b1000 != 0;
        let reg = Reg16::from_index(index as usize);
        let before = self.mem.reg16(reg);
        let after = if is_dec { before.wrapping_sub(1) } else { before.wrapping_add(1) };
        self.mem.set_reg16(reg, after);
        // INC/DEC update SF/ZF/PF/AF/OF but leave CF untouched.
        let saved_cf = self.mem.flag(Flag::Cf);
        if is_dec {
            self.alu_sub16(before, 1, false);
        } else {
            self.alu_add16(before, 1, false);
        }
        self.mem.set_flag(Flag::Cf, saved_cf);
    }

    fn exec_push_reg(&mut self, opcode: u8) {
        let reg = Reg16::from_index((opcode & 0b111) as usize);
        let value = self.mem.reg16(reg);
        self.push16(value);
    }

    fn exec_pop_reg(&mut self, opcode: u8) {
        let value = self.pop16();
        self.mem.set_reg16(Reg16::from_index((opcode & 0b111) as usize), value);
    }

    fn exec_push_sreg(&mut self, opcode: u8) {
        let reg = self.sreg_operand(opcode >> 3);
        let value = self.mem.reg16(reg);
        self.push16(value);
    }

    fn exec_pop_sreg(&mut self, opcode: u8) {
        let reg = self.sreg_operand(opcode >> 3);
        let value = self.pop16();
        self.mem.set_reg16(reg, value);
    }

    /// Opcodes 0xFE/0xFF: grouped INC/DEC/CALL/JMP/PUSH, selected by the
    /// modrm `reg` field.
    fn exec_group_ff(&mut self, w: bool) {
        let (reg, operand) = self.decode_modrm();
        match reg {
            0 | 1 => {
                // INC / DEC rm
                let is_dec = reg == 1;
                let saved_cf = self.mem.flag(Flag::Cf);
                if w {
                    let before = self.read16(operand);
                    let after = if is_dec {
                        self.alu_sub16(before, 1, false)
                    } else {
                        self.alu_add16(before, 1, false)
                    };
                    self.write16(operand, after);
                } else {
                    let before = self.read8(operand);
                    let after = if is_dec {
                        self.alu_sub8(before, 1, false)
                    } else {
                        self.alu_add8(before, 1, false)
                    };
                    self.write8(operand, after);
                }
                self.mem.set_flag(Flag::Cf, saved_cf);
            }
            2 => {
                // CALL near indirect
                let target = self.read16(operand);
                let ret = self.ip;
                self.push16(ret);
                self.jump_near(target);
            }
            3 => {
                // CALL far indirect: load CS:IP from [ea] and [ea+2]
                if let Operand::Mem(addr) = operand {
                    let new_ip = self.mem.read_u16(addr);
                    let new_cs = self.mem.read_u16(addr + 2);
                    self.push16(self.cs());
                    self.push16(self.ip);
                    self.mem.set_reg16(Reg16::Cs, new_cs);
                    self.jump_near(new_ip);
                }
            }
            4 => {
                let target = self.read16(operand);
                self.jump_near(target);
            }
            5 => {
                if let Operand::Mem(addr) = operand {
                    let new_ip = self.mem.read_u16(addr);
                    let new_cs = self.mem.read_u16(addr + 2);
                    self.mem.set_reg16(Reg16::Cs, new_cs);
                    self.jump_near(new_ip);
                }
            }
            6 | 7 => {
                let value = self.read16(operand);
                self.push16(value);
            }
            _ => unreachable!(),
        }
    }

    /// Opcodes 0xF6/0xF7: TEST/NOT/NEG/MUL/IMUL/DIV/IDIV, selected by the
    /// modrm `reg` field.
    fn exec_group_f6(&mut self, w: bool) {
        let (reg, operand) = self.decode_modrm();
        match reg {
            0 | 1 => {
                // TEST rm, imm
                if w {
                    let imm = self.fetch_u16();
                    let value = self.read16(operand);
                    self.alu_logic16(value & imm);
                } else {
                    let imm = self.fetch_u8();
                    let value = self.read8(operand);
                    self.alu_logic8(value & imm);
                }
            }
            2 => {
                if w {
                    let value = self.read16(operand);
                    self.write16(operand, !value);
                } else {
                    let value = self.read8(operand);
                    self.write8(operand, !value);
                }
            }
            3 => {
                // NEG: CF set iff result != 0
                if w {
                    let value = self.read16(operand);
                    let result = self.alu_sub16(0, value, false);
                    self.mem.set_flag(Flag::Cf, result != 0);
                    self.write16(operand, result);
                } else {
                    let value = self.read8(operand);
                    let result = self.alu_sub8(0, value, false);
                    self.mem.set_flag(Flag::Cf, result != 0);
                    self.write8(operand, result);
                }
            }
            4 => self.exec_mul(operand, w),
            5 => self.exec_imul(operand, w),
            6 => self.exec_div(operand, w),
            7 => self.exec_idiv(operand, w),
            _ => unreachable!(),
        }
    }

    fn exec_mul(&mut self, operand: Operand, w: bool) {
        if w {
            let ax = self.mem.reg16(Reg16::Ax);
            let src = self.read16(operand);
            let result = ax as u32 * src as u32;
            self.mem.set_reg16(Reg16::Ax, (result & 0xffff) as u16);
            self.mem.set_reg16(Reg16::Dx, (result >> 16) as u16);
            let overflow = (result >> 16) != 0;
            self.mem.set_flag(Flag::Cf, overflow);
            self.mem.set_flag(Flag::Of, overflow);
        } else {
            let al = self.mem.reg8(Reg8::Al);
            let src = self.read8(operand);
            let result = al as u16 * src as u16;
            self.mem.set_reg16(Reg16::Ax, result);
            let overflow = (result >> 8) != 0;
            self.mem.set_flag(Flag::Cf, overflow);
            self.mem.set_flag(Flag::Of, overflow);
        }
    }

    fn exec_imul(&mut self, operand: Operand, w: bool) {
        if w {
            let ax = self.mem.reg16(Reg16::Ax) as i16;
            let src = self.read16(operand) as i16;
            let result = ax as i32 * src as i32;
            self.mem.set_reg16(Reg16::Ax, (result & 0xffff) as u16);
            self.mem.set_reg16(Reg16::Dx, ((result >> 16) & 0xffff) as u16);
            let sign_extended = result == (result as i16) as i32;
            self.mem.set_flag(Flag::Cf, !sign_extended);
            self.mem.set_flag(Flag::Of, !sign_extended);
        } else {
            let al = self.mem.reg8(Reg8::Al) as i8;
            let src = self.read8(operand) as i8;
            let result = al as i16 * src as i16;
            self.mem.set_reg16(Reg16::Ax, result as u16);
            let sign_extended = result == (result as i8) as i16;
            self.mem.set_flag(Flag::Cf, !sign_extended);
            self.mem.set_flag(Flag::Of, !sign_extended);
        }
    }

    fn exec_div(&mut self, operand: Operand, w: bool) {
        if w {
            let dividend = ((self.mem.reg16(Reg16::Dx) as u32) << 16) | self.mem.reg16(Reg16::Ax) as u32;
            let divisor = self.read16(operand) as u32;
            if divisor == 0 || dividend / divisor > 0xffff {
                self.raise_divide_error();
                return;
            }
            self.mem.set_reg16(Reg16::Ax, (dividend / divisor) as u16);
            self.mem.set_reg16(Reg16::Dx, (dividend % divisor) as u16);
        } else {
            let dividend = self.mem.reg16(Reg16::Ax) as u32;
            let divisor = self.read8(operand) as u32;
            if divisor == 0 || dividend / divisor > 0xff {
                self.raise_divide_error();
                return;
            }
            self.mem.set_reg8(Reg8::Al, (dividend / divisor) as u8);
            self.mem.set_reg8(Reg8::Ah, (dividend % divisor) as u8);
        }
    }

    fn exec_idiv(&mut self, operand: Operand, w: bool) {
        if w {
            let dividend = (((self.mem.reg16(Reg16::Dx) as u32) << 16) | self.mem.reg16(Reg16::Ax) as u32) as i32;
            let divisor = self.read16(operand) as i16 as i32;
            if divisor == 0 || dividend / divisor > 0x7fff || dividend / divisor < -0x8000 {
                self.raise_divide_error();
                return;
            }
            self.mem.set_reg16(Reg16::Ax, (dividend / divisor) as u16);
            self.mem.set_reg16(Reg16::Dx, (dividend % divisor) as u16);
        } else {
            let dividend = self.mem.reg16(Reg16::Ax) as i16 as i32;
            let divisor = self.read8(operand) as i8 as i32;
            if divisor == 0 || dividend / divisor > 0x7f || dividend / divisor < -0x80 {
                self.raise_divide_error();
                return;
            }
            self.mem.set_reg8(Reg8::Al, (dividend / divisor) as u8);
            self.mem.set_reg8(Reg8::Ah, (dividend % divisor) as u8);
        }
    }

    fn raise_divide_error(&mut self) {
        self.deliver_interrupt(crate::interrupts::VEC_DIVIDE_BY_ZERO);
    }

    /// ALU group opcodes. Form 7 is the 8 `op rm,imm` group opcodes
    /// (0x80-0x83, op selected by modrm.reg); forms 8/9 are the
    /// `op reg,rm`/`op rm,reg`/`op acc,imm` encodings scattered across
    /// 0x00-0x3D, op selected by the opcode's own bits 5:3.
    fn exec_alu_group(&mut self, form: u8, opcode: u8, w: bool, d: bool) {
        let op = if form == 7 {
            // decoded below after reading modrm.reg
            0xff
        } else {
            (opcode >> 3) & 0b111
        };

        match form {
            7 => {
                let (reg, operand) = self.decode_modrm();
                let op = reg;
                let imm_is_word = w && opcode != 0x83;
                if w {
                    let imm = if imm_is_word { self.fetch_u16() } else { self.fetch_i8() as i16 as u16 };
                    let dst = self.read16(operand);
                    let result = self.alu_op16(op, dst, imm);
                    if op != 7 {
                        self.write16(operand, result);
                    }
                } else {
                    let imm = self.fetch_u8();
                    let dst = self.read8(operand);
                    let result = self.alu_op8(op, dst, imm);
                    if op != 7 {
                        self.write8(operand, result);
                    }
                }
            }
            8 => {
                // op reg,rm / op rm,reg (d selects direction)
                let (reg, rm_operand) = self.decode_modrm();
                if w {
                    let reg_operand = self.reg16_operand(reg);
                    let (dst_op, src_val) = if d {
                        (reg_operand, self.read16(rm_operand))
                    } else {
                        (rm_operand, self.read16(reg_operand))
                    };
                    let dst = self.read16(dst_op);
                    let result = self.alu_op16(op, dst, src_val);
                    if op != 7 {
                        self.write16(dst_op, result);
                    }
                } else {
                    let reg_operand = self.reg8_operand(reg);
                    let (dst_op, src_val) = if d {
                        (reg_operand, self.read8(rm_operand))
                    } else {
                        (rm_operand, self.read8(reg_operand))
                    };
                    let dst = self.read8(dst_op);
                    let result = self.alu_op8(op, dst, src_val);
                    if op != 7 {
                        self.write8(dst_op, result);
                    }
                }
            }
            9 => {
                // op acc, imm
                if w {
                    let imm = self.fetch_u16();
                    let dst = self.mem.reg16(Reg16::Ax);
                    let result = self.alu_op16(op, dst, imm);
                    if op != 7 {
                        self.mem.set_reg16(Reg16::Ax, result);
                    }
                } else {
                    let imm = self.fetch_u8();
                    let dst = self.mem.reg8(Reg8::Al);
                    let result = self.alu_op8(op, dst, imm);
                    if op != 7 {
                        self.mem.set_reg8(Reg8::Al, result);
                    }
                }
            }
            _ => unreachable!(),
        }
    }

    /// `op` selects ADD/OR/ADC/SBB/AND/SUB/XOR/CMP, the standard 8086 ALU
    /// group ordering. CMP (7) computes flags only, caller skips the
    /// writeback.
    fn alu_op8(&mut self, op: u8, dst: u8, src: u8) -> u8 {
        match op {
            0 => self.alu_add8(dst, src, false),
            1 => self.alu_logic8(dst | src),
            2 => self.alu_add8(dst, src, self.mem.flag(Flag::Cf)),
            3 => self.alu_sub8(dst, src, self.mem.flag(Flag::Cf)),
            4 => self.alu_logic8(dst & src),
            5 | 7 => self.alu_sub8(dst, src, false),
            6 => self.alu_logic8(dst ^ src),
            _ => unreachable!(),
        }
    }

    fn alu_op16(&mut self, op: u8, dst: u16, src: u16) -> u16 {
        match op {
            0 => self.alu_add16(dst, src, false),
            1 => self.alu_logic16(dst | src),
            2 => self.alu_add16(dst, src, self.mem.flag(Flag::Cf)),
            3 => self.alu_sub16(dst, src, self.mem.flag(Flag::Cf)),
            4 => self.alu_logic16(dst & src),
            5 | 7 => self.alu_sub16(dst, src, false),
            6 => self.alu_logic16(dst ^ src),
            _ => unreachable!(),
        }
    }

    fn exec_mov_rm_reg(&mut self, w: bool, d: bool) {
        let (reg, rm_operand) = self.decode_modrm();
        if w {
            let reg_operand = self.reg16_operand(reg);
            if d {
                let value = self.read16(rm_operand);
                self.write16(reg_operand, value);
            } else {
                let value = self.read16(reg_operand);
                self.write16(rm_operand, value);
            }
        } else {
            let reg_operand = self.reg8_operand(reg);
            if d {
                let value = self.read8(rm_operand);
                self.write8(reg_operand, value);
            } else {
                let value = self.read8(reg_operand);
                self.write8(rm_operand, value);
            }
        }
    }

    fn exec_mov_sreg_rm(&mut self, d: bool) {
        let (reg, rm_operand) = self.decode_modrm();
        let sreg = self.sreg_operand(reg);
        if d {
            let value = self.read16(rm_operand);
            self.mem.set_reg16(sreg, value);
        } else {
            let value = self.mem.reg16(sreg);
            self.write16(rm_operand, value);
        }
    }

    fn exec_shift_group(&mut self, opcode: u8, w: bool) {
        let (reg, operand) = self.decode_modrm();
        // 0xC0/0xC1: count is an immediate byte (80186 shift-by-imm8).
        // 0xD0/0xD1: count is implicitly 1. 0xD2/0xD3: count comes from CL.
        let count = match opcode {
            0xC0 | 0xC1 => self.fetch_u8() & 0b1_1111,
            0xD0 | 0xD1 => 1,
            0xD2 | 0xD3 => self.mem.reg8(Reg8::Cl) & 0b1_1111,
            _ => 1,
        };
        if count == 0 {
            return;
        }
        if w {
            let value = self.read16(operand);
            let result = self.shift_rotate16(reg, value, count);
            self.write16(operand, result);
        } else {
            let value = self.read8(operand);
            let result = self.shift_rotate8(reg, value, count);
            self.write8(operand, result);
        }
    }

    fn shift_rotate8(&mut self, op: u8, value: u8, count: u8) -> u8 {
        let mut v = value;
        let mut cf = self.mem.flag(Flag::Cf);
        for _ in 0..count {
            match op {
                0 => { cf = v & 0x80 != 0; v = v.rotate_left(1); } // ROL
                1 => { cf = v & 1 != 0; v = v.rotate_right(1); } // ROR
                2 => { let new_cf = v & 0x80 != 0; v = (v << 1) | cf as u8; cf = new_cf; } // RCL
                3 => { let new_cf = v & 1 != 0; v = (v >> 1) | ((cf as u8) << 7); cf = new_cf; } // RCR
                4 | 6 => { cf = v & 0x80 != 0; v <<= 1; } // SHL/SAL
                5 => { cf = v & 1 != 0; v >>= 1; } // SHR
                7 => { cf = v & 1 != 0; v = ((v as i8) >> 1) as u8; } // SAR
                _ => unreachable!(),
            }
        }
        self.mem.set_flag(Flag::Cf, cf);
        self.apply_szp8(v);
        v
    }

    fn shift_rotate16(&mut self, op: u8, value: u16, count: u8) -> u16 {
        let mut v = value;
        let mut cf = self.mem.flag(Flag::Cf);
        for _ in 0..count {
            match op {
                0 => { cf = v & 0x8000 != 0; v = v.rotate_left(1); }
                1 => { cf = v & 1 != 0; v = v.rotate_right(1); }
                2 => { let new_cf = v & 0x8000 != 0; v = (v << 1) | cf as u16; cf = new_cf; }
                3 => { let new_cf = v & 1 != 0; v = (v >> 1) | ((cf as u16) << 15); cf = new_cf; }
                4 | 6 => { cf = v & 0x8000 != 0; v <<= 1; }
                5 => { cf = v & 1 != 0; v >>= 1; }
                7 => { cf = v & 1 != 0; v = ((v as i16) >> 1) as u16; }
                _ => unreachable!(),
            }
        }
        self.mem.set_flag(Flag::Cf, cf);
        self.apply_szp16(v);
        v
    }

    fn exec_loop_group(&mut self, opcode: u8) {
        let disp = self.fetch_i8();
        let cx = self.mem.reg16(Reg16::Cx);
        let take = match opcode {
            0xE0 => { let cx = cx.wrapping_sub(1); self.mem.set_reg16(Reg16::Cx, cx); cx != 0 && !self.mem.flag(Flag::Zf) }
            0xE1 => { let cx = cx.wrapping_sub(1); self.mem.set_reg16(Reg16::Cx, cx); cx != 0 && self.mem.flag(Flag::Zf) }
            0xE2 => { let cx = cx.wrapping_sub(1); self.mem.set_reg16(Reg16::Cx, cx); cx != 0 }
            0xE3 => cx == 0, // JCXZ: does not decrement
            _ => unreachable!(),
        };
        if take {
            let target = (self.ip as i32 + disp as i32) as u16;
            self.jump_near(target);
        }
    }

    fn exec_jmp_call_near_far(&mut self, opcode: u8) {
        match opcode {
            0xE8 => {
                let disp = self.fetch_u16() as i16;
                let ret = self.ip;
                self.push16(ret);
                let target = (self.ip as i32 + disp as i32) as u16;
                self.jump_near(target);
            }
            0xE9 => {
                let disp = self.fetch_u16() as i16;
                let target = (self.ip as i32 + disp as i32) as u16;
                self.jump_near(target);
            }
            0xEB => {
                let disp = self.fetch_i8();
                let target = (self.ip as i32 + disp as i32) as u16;
                self.jump_near(target);
            }
            0xEA => {
                let new_ip = self.fetch_u16();
                let new_cs = self.fetch_u16();
                self.mem.set_reg16(Reg16::Cs, new_cs);
                self.jump_near(new_ip);
            }
            _ => unreachable!(),
        }
    }

    fn exec_call_far(&mut self) {
        let new_ip = self.fetch_u16();
        let new_cs = self.fetch_u16();
        self.push16(self.cs());
        self.push16(self.ip);
        self.mem.set_reg16(Reg16::Cs, new_cs);
        self.jump_near(new_ip);
    }

    fn exec_test_rm_reg(&mut self, w: bool) {
        let (reg, rm_operand) = self.decode_modrm();
        if w {
            let a = self.read16(self.reg16_operand(reg));
            let b = self.read16(rm_operand);
            self.alu_logic16(a & b);
        } else {
            let a = self.read8(self.reg8_operand(reg));
            let b = self.read8(rm_operand);
            self.alu_logic8(a & b);
        }
    }

    fn exec_xchg(&mut self, opcode: u8, w: bool) {
        if opcode == 0x90 {
            return; // NOP: XCHG AX,AX
        }
        if (0x91..=0x97).contains(&opcode) {
            let reg = Reg16::from_index((opcode & 0b111) as usize);
            let a = self.mem.reg16(Reg16::Ax);
            let b = self.mem.reg16(reg);
            self.mem.set_reg16(Reg16::Ax, b);
            self.mem.set_reg16(reg, a);
            return;
        }
        let (reg, rm_operand) = self.decode_modrm();
        if w {
            let reg_operand = self.reg16_operand(reg);
            let a = self.read16(reg_operand);
            let b = self.read16(rm_operand);
            self.write16(reg_operand, b);
            self.write16(rm_operand, a);
        } else {
            let reg_operand = self.reg8_operand(reg);
            let a = self.read8(reg_operand);
            let b = self.read8(rm_operand);
            self.write8(reg_operand, b);
            self.write8(rm_operand, a);
        }
    }

    fn segment_for_string_dst(&self) -> Reg16 {
        Reg16::Es // destination segment is never overridable
    }

    fn exec_string_op(&mut self, opcode: u8, w: bool, _host: &mut Host) {
        let iterations = match self.rep {
            Some(_) => self.mem.reg16(Reg16::Cx),
            None => 1,
        };
        let step: u16 = if w { 2 } else { 1 };
        let df = self.mem.flag(Flag::Df);
        let delta: i32 = if df { -(step as i32) } else { step as i32 };

        let mut remaining = iterations;
        loop {
            if self.rep.is_some() && remaining == 0 {
                break;
            }
            let si = self.mem.reg16(Reg16::Si);
            let di = self.mem.reg16(Reg16::Di);
            let src_seg = self.default_data_segment();
            let dst_seg = self.segment_for_string_dst();

            let mut early_exit = false;
            match opcode {
                0xA4 | 0xA5 => {
                    // MOVSB/MOVSW
                    let src_addr = linear(self.mem.reg16(src_seg), si);
                    let dst_addr = linear(self.mem.reg16(dst_seg), di);
                    if w {
                        let v = self.mem.read_u16(src_addr);
                        self.mem.write_u16(dst_addr, v);
                    } else {
                        let v = self.mem.read_u8(src_addr);
                        self.mem.write_u8(dst_addr, v);
                    }
                    self.mem.set_reg16(Reg16::Si, (si as i32 + delta) as u16);
                    self.mem.set_reg16(Reg16::Di, (di as i32 + delta) as u16);
                }
                0xAA | 0xAB => {
                    // STOSB/STOSW
                    let dst_addr = linear(self.mem.reg16(dst_seg), di);
                    if w {
                        self.mem.write_u16(dst_addr, self.mem.reg16(Reg16::Ax));
                    } else {
                        self.mem.write_u8(dst_addr, self.mem.reg8(Reg8::Al));
                    }
                    self.mem.set_reg16(Reg16::Di, (di as i32 + delta) as u16);
                }
                0xAC | 0xAD => {
                    // LODSB/LODSW
                    let src_addr = linear(self.mem.reg16(src_seg), si);
                    if w {
                        let v = self.mem.read_u16(src_addr);
                        self.mem.set_reg16(Reg16::Ax, v);
                    } else {
                        let v = self.mem.read_u8(src_addr);
                        self.mem.set_reg8(Reg8::Al, v);
                    }
                    self.mem.set_reg16(Reg16::Si, (si as i32 + delta) as u16);
                }
                0xA6 | 0xA7 => {
                    // CMPSB/CMPSW
                    let src_addr = linear(self.mem.reg16(src_seg), si);
                    let dst_addr = linear(self.mem.reg16(dst_seg), di);
                    if w {
                        let a = self.mem.read_u16(src_addr);
                        let b = self.mem.read_u16(dst_addr);
                        self.alu_sub16(a, b, false);
                    } else {
                        let a = self.mem.read_u8(src_addr);
                        let b = self.mem.read_u8(dst_addr);
                        self.alu_sub8(a, b, false);
                    }
                    self.mem.set_reg16(Reg16::Si, (si as i32 + delta) as u16);
                    self.mem.set_reg16(Reg16::Di, (di as i32 + delta) as u16);
                    early_exit = self.rep_mismatch();
                }
                0xAE | 0xAF => {
                    // SCASB/SCASW
                    let dst_addr = linear(self.mem.reg16(dst_seg), di);
                    if w {
                        let a = self.mem.reg16(Reg16::Ax);
                        let b = self.mem.read_u16(dst_addr);
                        self.alu_sub16(a, b, false);
                    } else {
                        let a = self.mem.reg8(Reg8::Al);
                        let b = self.mem.read_u8(dst_addr);
                        self.alu_sub8(a, b, false);
                    }
                    self.mem.set_reg16(Reg16::Di, (di as i32 + delta) as u16);
                    early_exit = self.rep_mismatch();
                }
                _ => {}
            }

            if self.rep.is_some() {
                remaining = remaining.wrapping_sub(1);
                self.mem.set_reg16(Reg16::Cx, remaining);
            } else {
                break;
            }
            if early_exit {
                break;
            }
        }
    }

    fn rep_mismatch(&self) -> bool {
        match self.rep {
            Some(RepMode::Repz) => !self.mem.flag(Flag::Zf),
            Some(RepMode::Repnz) => self.mem.flag(Flag::Zf),
            None => false,
        }
    }

    fn exec_ret_group(&mut self, opcode: u8) {
        match opcode {
            0xC2 => {
                let adj = self.fetch_u16();
                let ip = self.pop16();
                let sp = self.mem.reg16(Reg16::Sp).wrapping_add(adj);
                self.mem.set_reg16(Reg16::Sp, sp);
                self.jump_near(ip);
            }
            0xC3 => {
                let ip = self.pop16();
                self.jump_near(ip);
            }
            0xCA => {
                let adj = self.fetch_u16();
                let ip = self.pop16();
                let cs = self.pop16();
                self.mem.set_reg16(Reg16::Cs, cs);
                let sp = self.mem.reg16(Reg16::Sp).wrapping_add(adj);
                self.mem.set_reg16(Reg16::Sp, sp);
                self.jump_near(ip);
            }
            0xCB => {
                let ip = self.pop16();
                let cs = self.pop16();
                self.mem.set_reg16(Reg16::Cs, cs);
                self.jump_near(ip);
            }
            0xCF => {
                let ip = self.pop16();
                let cs = self.pop16();
                let flags_word = self.pop16();
                self.mem.set_reg16(Reg16::Cs, cs);
                self.mem.set_flags_word(flags_word);
                self.jump_near(ip);
            }
            _ => unreachable!(),
        }
    }

    fn exec_mov_acc_abs(&mut self, w: bool, d: bool) {
        let disp = self.fetch_u16();
        let seg = self.default_data_segment();
        let addr = linear(self.mem.reg16(seg), disp);
        // 0xA0/0xA1 (d=false) load moffs->AL/AX; 0xA2/0xA3 (d=true) store
        // AL/AX->moffs -- this block's `d` bit is reversed relative to the
        // 0x88-0x8B MOV rm<->reg group.
        if !d {
            if w {
                let v = self.mem.read_u16(addr);
                self.mem.set_reg16(Reg16::Ax, v);
            } else {
                let v = self.mem.read_u8(addr);
                self.mem.set_reg8(Reg8::Al, v);
            }
        } else if w {
            let v = self.mem.reg16(Reg16::Ax);
            self.mem.write_u16(addr, v);
        } else {
            let v = self.mem.reg8(Reg8::Al);
            self.mem.write_u8(addr, v);
        }
    }

    fn exec_in(&mut self, opcode: u8, w: bool, host: &mut Host) {
        let port = if opcode & 0b1000 != 0 { self.mem.reg16(Reg16::Dx) } else { self.fetch_u8() as u16 };
        let value = self.port_in(port, host);
        if w {
            let hi = self.port_in(port.wrapping_add(1), host);
            self.mem.set_reg16(Reg16::Ax, (value as u16) | ((hi as u16) << 8));
        } else {
            self.mem.set_reg8(Reg8::Al, value);
        }
    }

    fn exec_out(&mut self, opcode: u8, w: bool, host: &mut Host) {
        let port = if opcode & 0b1000 != 0 { self.mem.reg16(Reg16::Dx) } else { self.fetch_u8() as u16 };
        if w {
            let value = self.mem.reg16(Reg16::Ax);
            self.port_out(port, (value & 0xff) as u8, host);
            self.port_out(port.wrapping_add(1), (value >> 8) as u8, host);
        } else {
            let value = self.mem.reg8(Reg8::Al);
            self.port_out(port, value, host);
        }
    }

    fn port_in(&mut self, port: u16, host: &mut Host) -> u8 {
        if let Some(v) = self.ports_synthesized_in(port) {
            return v;
        }
        if host.port_filter.filter(port, crate::devices::PortDirection::In) {
            return host.port_filter.port_in(port);
        }
        self.ports_raw_in(port)
    }

    fn port_out(&mut self, port: u16, value: u8, host: &mut Host) {
        if self.ports_synthesized_out(port, value) {
            return;
        }
        if host.port_filter.filter(port, crate::devices::PortDirection::Out) {
            host.port_filter.port_out(port, value);
            return;
        }
        self.ports_raw_out(port, value);
    }

    fn exec_rep_prefix(&mut self, opcode: u8) {
        self.rep = Some(if opcode == 0xF2 { RepMode::Repnz } else { RepMode::Repz });
        self.rep_ttl = 2;
    }

    fn exec_segment_override(&mut self, opcode: u8) {
        self.seg_override = Some(match opcode {
            0x26 => Reg16::Es,
            0x2E => Reg16::Cs,
            0x36 => Reg16::Ss,
            0x3E => Reg16::Ds,
            _ => unreachable!(),
        });
        self.seg_override_ttl = 2;
    }

    /// DAA: BCD-adjust AL after addition, per the standard 8086 algorithm.
    fn exec_daa(&mut self) {
        let mut al = self.mem.reg8(Reg8::Al);
        let mut cf = self.mem.flag(Flag::Cf);
        let af = self.mem.flag(Flag::Af);
        if (al & 0x0f) > 9 || af {
            let (new_al, carry) = al.overflowing_add(6);
            al = new_al;
            cf = cf || carry;
            self.mem.set_flag(Flag::Af, true);
        } else {
            self.mem.set_flag(Flag::Af, false);
        }
        if al > 0x9f || cf {
            al = al.wrapping_add(0x60);
            cf = true;
        }
        self.mem.set_flag(Flag::Cf, cf);
        self.mem.set_reg8(Reg8::Al, al);
        self.apply_szp8(al);
    }

    fn exec_das(&mut self) {
        let mut al = self.mem.reg8(Reg8::Al);
        let mut cf = self.mem.flag(Flag::Cf);
        let af = self.mem.flag(Flag::Af);
        let old_al = al;
        if (al & 0x0f) > 9 || af {
            al = al.wrapping_sub(6);
            self.mem.set_flag(Flag::Af, true);
            cf = cf || old_al < 6;
        } else {
            self.mem.set_flag(Flag::Af, false);
        }
        if old_al > 0x99 || cf {
            al = al.wrapping_sub(0x60);
            cf = true;
        }
        self.mem.set_flag(Flag::Cf, cf);
        self.mem.set_reg8(Reg8::Al, al);
        self.apply_szp8(al);
    }

    fn exec_aaa(&mut self) {
        let al = self.mem.reg8(Reg8::Al);
        let af = self.mem.flag(Flag::Af);
        if (al & 0x0f) > 9 || af {
            let ah = self.mem.reg8(Reg8::Ah);
            self.mem.set_reg8(Reg8::Al, al.wrapping_add(6) & 0x0f);
            self.mem.set_reg8(Reg8::Ah, ah.wrapping_add(1));
            self.mem.set_flag(Flag::Af, true);
            self.mem.set_flag(Flag::Cf, true);
        } else {
            self.mem.set_reg8(Reg8::Al, al & 0x0f);
            self.mem.set_flag(Flag::Af, false);
            self.mem.set_flag(Flag::Cf, false);
        }
    }

    fn exec_aas(&mut self) {
        let al = self.mem.reg8(Reg8::Al);
        let af = self.mem.flag(Flag::Af);
        if (al & 0x0f) > 9 || af {
            let ah = self.mem.reg8(Reg8::Ah);
            self.mem.set_reg8(Reg8::Al, al.wrapping_sub(6) & 0x0f);
            self.mem.set_reg8(Reg8::Ah, ah.wrapping_sub(1));
            self.mem.set_flag(Flag::Af, true);
            self.mem.set_flag(Flag::Cf, true);
        } else {
            self.mem.set_reg8(Reg8::Al, al & 0x0f);
            self.mem.set_flag(Flag::Af, false);
            self.mem.set_flag(Flag::Cf, false);
        }
    }

    fn exec_pushf(&mut self) {
        let word = self.mem.flags_word();
        self.push16(word);
    }

    fn exec_popf(&mut self) {
        let word = self.pop16();
        self.mem.set_flags_word(word);
    }

    fn exec_cbw(&mut self) {
        let al = self.mem.reg8(Reg8::Al) as i8;
        self.mem.set_reg16(Reg16::Ax, al as i16 as u16);
    }

    fn exec_cwd(&mut self) {
        let ax = self.mem.reg16(Reg16::Ax) as i16;
        self.mem.set_reg16(Reg16::Dx, if ax < 0 { 0xffff } else { 0 });
    }

    fn exec_lea(&mut self) {
        let (reg, operand) = self.decode_modrm();
        if let Operand::Mem(addr) = operand {
            // The effective address was computed as a linear (segment
            // already folded in) address; LEA wants the bare offset, so
            // undo the segment's contribution before storing it.
            let seg = self.seg_override.unwrap_or(Reg16::Ds);
            let seg_base = (self.mem.reg16(seg) as usize) << 4;
            let offset = addr.wrapping_sub(seg_base) as u16;
            self.mem.set_reg16(Reg16::from_index(reg as usize), offset);
        }
    }

    fn exec_pop_rm(&mut self) {
        let (_reg, operand) = self.decode_modrm();
        let value = self.pop16();
        self.write16(operand, value);
    }

    fn exec_mov_rm_imm(&mut self, w: bool) {
        let (_reg, operand) = self.decode_modrm();
        if w {
            let imm = self.fetch_u16();
            self.write16(operand, imm);
        } else {
            let imm = self.fetch_u8();
            self.write8(operand, imm);
        }
    }

    /// AAM: AH = AL / imm8, AL = AL % imm8. Divide-by-zero raises INT 0,
    /// matching DIV's behavior (the base opcode's imm8 is conventionally
    /// 0x0A, but the encoding permits any divisor).
    fn exec_aam(&mut self, host: &mut Host) {
        let _ = host;
        let base = self.fetch_u8();
        let al = self.mem.reg8(Reg8::Al);
        if base == 0 {
            self.raise_divide_error();
            return;
        }
        self.mem.set_reg8(Reg8::Ah, al / base);
        let remainder = al % base;
        self.mem.set_reg8(Reg8::Al, remainder);
        self.apply_szp8(remainder);
    }

    /// AAD: AL = AH * imm8 + AL, AH = 0.
    fn exec_aad(&mut self) {
        let base = self.fetch_u8();
        let al = self.mem.reg8(Reg8::Al);
        let ah = self.mem.reg8(Reg8::Ah);
        let result = ah.wrapping_mul(base).wrapping_add(al);
        self.mem.set_reg8(Reg8::Al, result);
        self.mem.set_reg8(Reg8::Ah, 0);
        self.apply_szp8(result);
    }

    fn exec_les_lds(&mut self, opcode: u8) {
        let (reg, operand) = self.decode_modrm();
        if let Operand::Mem(addr) = operand {
            let offset = self.mem.read_u16(addr);
            let segment = self.mem.read_u16(addr + 2);
            self.write16(self.reg16_operand(reg), offset);
            let seg_reg = if opcode == 0xC4 { Reg16::Es } else { Reg16::Ds };
            self.mem.set_reg16(seg_reg, segment);
        }
    }

    fn exec_int3(&mut self, host: &mut Host) {
        let _ = host;
        self.deliver_interrupt(crate::interrupts::VEC_BREAKPOINT);
    }

    fn exec_int_imm(&mut self, host: &mut Host) {
        let _ = host;
        let vector = self.fetch_u8();
        self.deliver_interrupt(vector);
    }

    fn exec_into(&mut self, host: &mut Host) {
        let _ = host;
        if self.mem.flag(Flag::Of) {
            self.deliver_interrupt(crate::interrupts::VEC_OVERFLOW);
        }
    }

    fn exec_sahf_lahf(&mut self, opcode: u8) {
        if opcode == 0x9E {
            // SAHF: AH -> low byte of FLAGS (SF,ZF,AF,PF,CF)
            let ah = self.mem.reg8(Reg8::Ah);
            let current = self.mem.flags_word() & 0xff00;
            self.mem.set_flags_word(current | ah as u16);
        } else {
            // LAHF: low byte of FLAGS -> AH
            let word = self.mem.flags_word();
            self.mem.set_reg8(Reg8::Ah, (word & 0xff) as u8);
        }
    }

    fn exec_xlat(&mut self) {
        let bx = self.mem.reg16(Reg16::Bx);
        let al = self.mem.reg8(Reg8::Al);
        let seg = self.default_data_segment();
        let addr = linear(self.mem.reg16(seg), bx.wrapping_add(al as u16));
        let value = self.mem.read_u8(addr);
        self.mem.set_reg8(Reg8::Al, value);
    }

    fn exec_salc(&mut self) {
        let value = if self.mem.flag(Flag::Cf) { 0xff } else { 0x00 };
        self.mem.set_reg8(Reg8::Al, value);
    }

    fn exec_flag_bit_ops(&mut self, opcode: u8) {
        match opcode {
            0xF5 => {
                let cf = self.mem.flag(Flag::Cf);
                self.mem.set_flag(Flag::Cf, !cf);
            }
            0xF8 => self.mem.set_flag(Flag::Cf, false),
            0xF9 => self.mem.set_flag(Flag::Cf, true),
            0xFA => self.mem.set_flag(Flag::If, false),
            0xFB => self.mem.set_flag(Flag::If, true),
            0xFC => self.mem.set_flag(Flag::Df, false),
            0xFD => self.mem.set_flag(Flag::Df, true),
            _ => {}
        }
    }

    fn exec_test_acc_imm(&mut self, w: bool) {
        if w {
            let imm = self.fetch_u16();
            let ax = self.mem.reg16(Reg16::Ax);
            self.alu_logic16(ax & imm);
        } else {
            let imm = self.fetch_u8();
            let al = self.mem.reg8(Reg8::Al);
            self.alu_logic8(al & imm);
        }
    }

    /// Whether a segment-override or REP prefix is waiting on its
    /// following instruction. The 100 Hz tick withholds the timer IRQ
    /// while this holds, matching real hardware's between-instructions-only
    /// INTR sampling.
    pub fn prefix_pending(&self) -> bool {
        self.seg_override.is_some() || self.rep.is_some()
    }

    // --- testable hooks for REP/segment-override state, used by tests --

    #[cfg(test)]
    pub fn seg_override_active(&self) -> bool {
        self.seg_override.is_some()
    }

    #[cfg(test)]
    pub fn rep_active(&self) -> bool {
        self.rep.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{
        Calendar, Clock, Disk as DiskTrait, KeyEvent, PortDirection, PortFilter, Serial, SerialStatus, Video,
        VideoKind,
    };

    struct NullVideo;
    impl Video for NullVideo {
        fn getkey(&mut self) -> KeyEvent {
            KeyEvent::None
        }
        fn initialize(&mut self, _kind: VideoKind, _width: usize, _height: usize) {}
        fn backbuffer(&mut self) -> &mut [u32] {
            &mut []
        }
        fn textmode(&mut self, _vram: &[u8], _font: &[u8], _cursor_visible: bool, _cx: u8, _cy: u8) {}
    }

    struct NullClock;
    impl Clock for NullClock {
        fn localtime(&self) -> Calendar {
            Calendar { second: 0, minute: 0, hour: 0, day: 1, month: 1, year: 1980, weekday: 0 }
        }
        fn millitm(&self) -> u16 {
            0
        }
    }

    struct NullFilter;
    impl PortFilter for NullFilter {
        fn filter(&mut self, _addr: u16, _dir: PortDirection) -> bool {
            false
        }
        fn port_in(&mut self, _addr: u16) -> u8 {
            0xFF
        }
        fn port_out(&mut self, _addr: u16, _value: u8) {}
    }

    struct NullSerial;
    impl Serial for NullSerial {
        fn init(&mut self, _config: u8) {}
        fn status(&mut self) -> SerialStatus {
            SerialStatus::default()
        }
        fn send(&mut self, _byte: u8) {}
        fn receive(&mut self) -> u8 {
            0
        }
    }

    struct NullAudio;
    impl crate::devices::Audio for NullAudio {
        fn pause(&mut self, _pause: bool) {}
        fn silence_byte(&self) -> u8 {
            0x80
        }
    }

    fn make_host<'a>(
        video: &'a mut NullVideo,
        clock: &'a NullClock,
        filter: &'a mut NullFilter,
        serial: &'a mut [NullSerial; 4],
        audio: &'a mut NullAudio,
    ) -> Host<'a> {
        let [s0, s1, s2, s3] = serial;
        Host { video, clock, disks: [None, None], port_filter: filter, serial: [s0, s1, s2, s3], audio }
    }

    fn new_cpu_with_code(code: &[u8]) -> Cpu {
        let mut cpu = Cpu::new(DecodeTables::canonical());
        let base = linear(cpu.mem.reg16(Reg16::Cs), cpu.ip);
        cpu.mem.write_block(base, code);
        cpu
    }

    fn step_n(cpu: &mut Cpu, n: usize) {
        let mut video = NullVideo;
        let clock = NullClock;
        let mut filter = NullFilter;
        let mut serial = [NullSerial, NullSerial, NullSerial, NullSerial];
        let mut audio = NullAudio;
        for _ in 0..n {
            let mut host = make_host(&mut video, &clock, &mut filter, &mut serial, &mut audio);
            cpu.step(&mut host);
        }
    }

    #[test]
    fn add_ax_ffff_plus_1_wraps_with_carry_and_aux_carry() {
        // MOV AX,0xFFFF ; ADD AX,1
        let mut cpu = new_cpu_with_code(&[0xB8, 0xFF, 0xFF, 0x05, 0x01, 0x00]);
        step_n(&mut cpu, 2);
        assert_eq!(cpu.mem.reg16(Reg16::Ax), 0);
        assert!(cpu.mem.flag(Flag::Cf));
        assert!(cpu.mem.flag(Flag::Zf));
        assert!(!cpu.mem.flag(Flag::Of));
        assert!(!cpu.mem.flag(Flag::Sf));
        assert!(cpu.mem.flag(Flag::Af));
    }

    #[test]
    fn push_pop_round_trips_sp_and_value() {
        // MOV AX,0x1234 ; PUSH AX ; MOV AX,0 ; POP AX
        let mut cpu = new_cpu_with_code(&[0xB8, 0x34, 0x12, 0x50, 0xB8, 0x00, 0x00, 0x58]);
        let sp_before = cpu.mem.reg16(Reg16::Sp);
        step_n(&mut cpu, 4);
        assert_eq!(cpu.mem.reg16(Reg16::Ax), 0x1234);
        assert_eq!(cpu.mem.reg16(Reg16::Sp), sp_before);
    }

    #[test]
    fn pushf_popf_is_a_no_op_over_the_flags_word() {
        let mut cpu = new_cpu_with_code(&[0x9C, 0x9D]); // PUSHF ; POPF
        cpu.mem.set_flag(Flag::Cf, true);
        cpu.mem.set_flag(Flag::Zf, true);
        cpu.mem.set_flag(Flag::Df, true);
        let before = cpu.mem.flags_word();
        step_n(&mut cpu, 2);
        assert_eq!(cpu.mem.flags_word(), before);
    }

    #[test]
    fn rep_movsb_copies_exactly_cx_bytes_and_zeroes_cx() {
        // F3 A4 = REP MOVSB
        let mut cpu = new_cpu_with_code(&[0xF3, 0xA4]);
        cpu.mem.set_reg16(Reg16::Cx, 5);
        cpu.mem.set_reg16(Reg16::Si, 0x100);
        cpu.mem.set_reg16(Reg16::Di, 0x200);
        let ds = cpu.mem.reg16(Reg16::Ds);
        let es = cpu.mem.reg16(Reg16::Es);
        let src = linear(ds, 0x100);
        cpu.mem.write_block(src, &[1, 2, 3, 4, 5]);

        step_n(&mut cpu, 2);

        assert_eq!(cpu.mem.reg16(Reg16::Cx), 0);
        assert_eq!(cpu.mem.reg16(Reg16::Si), 0x105);
        assert_eq!(cpu.mem.reg16(Reg16::Di), 0x205);
        let dst = linear(es, 0x200);
        assert_eq!(cpu.mem.read_block(dst, 5), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn string_op_direction_follows_df() {
        // STD ; MOVSB with SI/DI pointing mid-buffer should decrement.
        let mut cpu = new_cpu_with_code(&[0xFD, 0xA4]); // STD ; MOVSB
        cpu.mem.set_reg16(Reg16::Si, 0x100);
        cpu.mem.set_reg16(Reg16::Di, 0x200);
        step_n(&mut cpu, 2);
        assert_eq!(cpu.mem.reg16(Reg16::Si), 0x0FF);
        assert_eq!(cpu.mem.reg16(Reg16::Di), 0x1FF);
    }

    #[test]
    fn segment_override_prefix_applies_to_exactly_one_following_instruction() {
        // 26 = ES segment override ; B0 01 = MOV AL,1 (not a memory form,
        // but the prefix latch itself is what's under test here).
        let mut cpu = new_cpu_with_code(&[0x26, 0xB0, 0x01, 0xB0, 0x02]);
        step_n(&mut cpu, 1);
        assert!(cpu.seg_override_active());
        step_n(&mut cpu, 1);
        assert!(!cpu.seg_override_active());
        step_n(&mut cpu, 1);
        assert!(!cpu.seg_override_active());
    }

    #[test]
    fn hlt_sets_halted_and_next_step_returns_false() {
        let mut cpu = new_cpu_with_code(&[0xF4]); // HLT
        let mut video = NullVideo;
        let clock = NullClock;
        let mut filter = NullFilter;
        let mut serial = [NullSerial, NullSerial, NullSerial, NullSerial];
        let mut audio = NullAudio;
        let mut host = make_host(&mut video, &clock, &mut filter, &mut serial, &mut audio);
        cpu.step(&mut host);
        assert!(cpu.halted);
        assert!(!cpu.step(&mut host));
    }

    #[test]
    fn mov_imm_to_reg_picks_word_width_from_bit_3_not_bit_0() {
        // 0xB8 MOV AX,imm16 has bit0=0 (the generic `w` would say byte),
        // but it's in the 0xB8-0xBF word block.
        let mut cpu = new_cpu_with_code(&[0xB8, 0xFF, 0xFF]);
        let ip_before = cpu.ip;
        step_n(&mut cpu, 1);
        assert_eq!(cpu.mem.reg16(Reg16::Ax), 0xFFFF);
        assert_eq!(cpu.ip, ip_before.wrapping_add(3));
    }

    #[test]
    fn mov_acc_abs_loads_on_a0_a1_and_stores_on_a2_a3() {
        // MOV AX,[0x0500] ; MOV AX,0x55AA ; MOV [0x0502],AX
        let mut cpu = new_cpu_with_code(&[0xA1, 0x00, 0x05, 0xB8, 0xAA, 0x55, 0xA3, 0x02, 0x05]);
        cpu.mem.write_u16(0x0500, 0x1234);
        step_n(&mut cpu, 1);
        assert_eq!(cpu.mem.reg16(Reg16::Ax), 0x1234);
        assert_eq!(cpu.mem.read_u16(0x0500), 0x1234, "load must not clobber source");

        step_n(&mut cpu, 2);
        assert_eq!(cpu.mem.read_u16(0x0502), 0x55AA);
    }

    #[test]
    fn single_step_trap_fires_after_the_instruction_that_had_tf_set() {
        // MOV AX,1 ; MOV BX,2 -- TF set before the first instruction.
        let mut cpu = new_cpu_with_code(&[0xB8, 0x01, 0x00, 0xBB, 0x02, 0x00]);
        cpu.mem.set_flag(Flag::Tf, true);
        cpu.mem.write_u16(crate::interrupts::VEC_SINGLE_STEP as usize * 4, 0x9000);
        cpu.mem.write_u16(crate::interrupts::VEC_SINGLE_STEP as usize * 4 + 2, 0x1000);

        step_n(&mut cpu, 1);

        assert_eq!(cpu.mem.reg16(Reg16::Ax), 1, "the instruction that set TF still ran");
        assert_eq!(cpu.mem.reg16(Reg16::Cs), 0x1000);
        assert_eq!(cpu.ip, 0x9000);
        assert!(!cpu.mem.flag(Flag::Tf), "trap delivery clears TF so the handler isn't itself traced");
    }
}
