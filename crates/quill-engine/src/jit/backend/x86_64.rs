//! x86-64 micro-assembler
//!
//! Register conventions (System V, no calls made from trace code):
//! - R13: locals base (first argument, pinned)
//! - R14: globals values base (second argument, pinned)
//! - R15: constants base (third argument, pinned)
//! - R12: exit-state area base (baked immediate, pinned)
//! - Bank 0..9: RAX RCX RDX RBX RSI RDI R8 R9 R10 (allocatable)
//! - Scratch: R11 (S0), RBP (S1, saved in the prologue)
//! - FP bank 0..8: XMM0-XMM7; scratch XMM8 (FS0), XMM9 (FS1), XMM15 internal
//!
//! Two-operand forms are synthesized from the three-operand interface with
//! a leading move when the destination is not the first source.

use super::{Cc, FCc, MicroAsm, Patch, STATE_DIV0, STATE_DIV1, STATE_NEG_MASK};

/// Machine encodings of the general bank, then S0 and S1.
const GPR_MAP: [u8; 11] = [0, 1, 2, 3, 6, 7, 8, 9, 10, 11, 5];

const RAX: u8 = 0;
const RDX: u8 = 2;
const R12: u8 = 12;
const R13: u8 = 13;
const R14: u8 = 14;
const R15: u8 = 15;
const XMM_INTERNAL: u8 = 15;

/// The x86-64 assembler.
pub struct X64Asm {
    code: Vec<u8>,
}

impl X64Asm {
    #[inline]
    fn gpr(&self, idx: u8) -> u8 {
        GPR_MAP[idx as usize]
    }

    #[inline]
    fn fpr(&self, idx: u8) -> u8 {
        // FP bank indices map directly onto XMM numbers.
        idx
    }

    fn emit(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    fn emit32(&mut self, v: u32) {
        self.emit(&v.to_le_bytes());
    }

    fn emit64(&mut self, v: u64) {
        self.emit(&v.to_le_bytes());
    }

    /// REX prefix for `reg` (ModRM.reg) and `rm` (ModRM.rm / opcode reg).
    /// Emitted whenever any bit is set; `force` additionally emits the bare
    /// 0x40 prefix (needed for SPL/BPL/SIL/DIL byte registers).
    fn rex(&mut self, w: bool, reg: u8, rm: u8, force: bool) {
        let b = 0x40
            | ((w as u8) << 3)
            | (((reg >> 3) & 1) << 2)
            | ((rm >> 3) & 1);
        if b != 0x40 || force {
            self.emit(&[b]);
        }
    }

    fn modrm_rr(&mut self, reg: u8, rm: u8) {
        self.emit(&[0xC0 | ((reg & 7) << 3) | (rm & 7)]);
    }

    /// ModRM (+ SIB) + disp32 for `[base + disp]`.
    fn modrm_mem(&mut self, reg: u8, base: u8, disp: i32) {
        if base & 7 == 4 {
            // RSP/R12 rows need a SIB byte.
            self.emit(&[0x80 | ((reg & 7) << 3) | 4, 0x24]);
        } else {
            self.emit(&[0x80 | ((reg & 7) << 3) | (base & 7)]);
        }
        self.emit32(disp as u32);
    }

    /// prefixes + REX + opcode + ModRM reg,reg.
    fn op_rr(&mut self, prefixes: &[u8], w: bool, opcode: &[u8], reg: u8, rm: u8) {
        self.emit(prefixes);
        self.rex(w, reg, rm, false);
        self.emit(opcode);
        self.modrm_rr(reg, rm);
    }

    /// prefixes + REX + opcode + ModRM reg,[base+disp].
    fn op_mem(&mut self, prefixes: &[u8], w: bool, opcode: &[u8], reg: u8, base: u8, disp: i32) {
        self.emit(prefixes);
        self.rex(w, reg, base, false);
        self.emit(opcode);
        self.modrm_mem(reg, base, disp);
    }

    /// Group-1 style `opcode /ext imm32` on a register.
    fn alu_ri(&mut self, w: bool, ext: u8, rm: u8, imm: i32) {
        self.rex(w, 0, rm, false);
        self.emit(&[0x81]);
        self.modrm_rr(ext, rm);
        self.emit32(imm as u32);
    }

    fn push_enc(&mut self, enc: u8) {
        self.rex(false, 0, enc, false);
        self.emit(&[0x50 + (enc & 7)]);
    }

    fn pop_enc(&mut self, enc: u8) {
        self.rex(false, 0, enc, false);
        self.emit(&[0x58 + (enc & 7)]);
    }

    fn mov_enc_rr64(&mut self, dst: u8, src: u8) {
        self.rex(true, src, dst, false);
        self.emit(&[0x89]);
        self.modrm_rr(src, dst);
    }

    /// Raw setcc byte form (`cc` is the low nibble of the 0F 9x opcode).
    fn setcc_raw(&mut self, enc: u8, cc: u8) {
        self.rex(false, 0, enc, enc >= 4);
        self.emit(&[0x0F, 0x90 | cc]);
        self.modrm_rr(0, enc);
    }

    fn movzx8(&mut self, dst_enc: u8, src_enc: u8) {
        self.rex(false, dst_enc, src_enc, src_enc >= 4);
        self.emit(&[0x0F, 0xB6]);
        self.modrm_rr(dst_enc, src_enc);
    }

    fn cc_nibble(cc: Cc) -> u8 {
        match cc {
            Cc::Eq => 0x4,
            Cc::Ne => 0x5,
            Cc::Lt => 0xC,
            Cc::Ge => 0xD,
            Cc::Le => 0xE,
            Cc::Gt => 0xF,
        }
    }

    /// Three-operand to two-operand synthesis for group-1 ALU opcodes.
    fn alu_rr32(&mut self, opcode: u8, dst: u8, a: u8, b: u8, commutative: bool) {
        let (d, a, b) = (self.gpr(dst), self.gpr(a), self.gpr(b));
        if d == a {
            self.op_rr(&[], false, &[opcode], b, d);
        } else if d == b && commutative {
            self.op_rr(&[], false, &[opcode], a, d);
        } else {
            debug_assert!(d != b, "dst aliases second source of a non-commutative op");
            self.op_rr(&[], false, &[0x89], a, d); // mov d, a
            self.op_rr(&[], false, &[opcode], b, d);
        }
    }

    fn alu_rr64(&mut self, opcode: u8, dst: u8, a: u8, b: u8) {
        let (d, a, b) = (self.gpr(dst), self.gpr(a), self.gpr(b));
        if d == a {
            self.op_rr(&[], true, &[opcode], b, d);
        } else if d == b {
            self.op_rr(&[], true, &[opcode], a, d); // and/or/xor are commutative
        } else {
            self.mov_enc_rr64(d, a);
            self.op_rr(&[], true, &[opcode], b, d);
        }
    }

    fn sse_rr(&mut self, prefix: u8, opcode: u8, reg: u8, rm: u8) {
        self.emit(&[prefix]);
        self.rex(false, reg, rm, false);
        self.emit(&[0x0F, opcode]);
        self.modrm_rr(reg, rm);
    }

    fn sse_arith(&mut self, opcode: u8, dst: u8, a: u8, b: u8, commutative: bool) {
        let (d, a, b) = (self.fpr(dst), self.fpr(a), self.fpr(b));
        if d == a {
            self.sse_rr(0xF2, opcode, d, b);
        } else if d == b && commutative {
            self.sse_rr(0xF2, opcode, d, a);
        } else {
            debug_assert!(d != b, "fp dst aliases second source of a non-commutative op");
            self.sse_rr(0xF2, 0x10, d, a); // movsd d, a
            self.sse_rr(0xF2, opcode, d, b);
        }
    }

    /// comisd/ucomisd x, y.
    fn comisd(&mut self, opcode: u8, x: u8, y: u8) {
        self.emit(&[0x66]);
        self.rex(false, x, y, false);
        self.emit(&[0x0F, opcode]);
        self.modrm_rr(x, y);
    }

    fn div_common(&mut self, dst: u8, a: u8, b: u8, want_rem: bool) {
        let b_enc = self.gpr(b);
        let a_enc = self.gpr(a);
        self.push_enc(RAX);
        self.push_enc(RDX);
        // Divisor staged through memory so RAX/RDX never collide with it.
        self.op_mem(&[], true, &[0x89], b_enc, R12, STATE_DIV0 as i32);
        // eax = dividend; cdq sign-extends into edx.
        if a_enc != RAX {
            self.op_rr(&[], false, &[0x8B], RAX, a_enc);
        }
        self.emit(&[0x99]); // cdq
        self.op_mem(&[], false, &[0xF7], 7, R12, STATE_DIV0 as i32); // idiv dword [r12+..]
        let result = if want_rem { RDX } else { RAX };
        self.op_mem(&[], true, &[0x89], result, R12, STATE_DIV1 as i32);
        self.pop_enc(RDX);
        self.pop_enc(RAX);
        let d = self.gpr(dst);
        self.op_mem(&[], true, &[0x8B], d, R12, STATE_DIV1 as i32);
    }
}

impl MicroAsm for X64Asm {
    const NUM_GPR: u8 = 9;
    const S0: u8 = 9;
    const S1: u8 = 10;
    const FS0: u8 = 8;
    const FS1: u8 = 9;

    fn new() -> Self {
        X64Asm { code: Vec::with_capacity(1024) }
    }

    fn pos(&self) -> usize {
        self.code.len()
    }

    fn into_code(self) -> Vec<u8> {
        self.code
    }

    fn prologue(&mut self, exit_state: u64) {
        for enc in [3u8, 5, 12, 13, 14, 15] {
            self.push_enc(enc); // rbx, rbp, r12..r15
        }
        self.mov_enc_rr64(R13, 7); // locals  <- rdi
        self.mov_enc_rr64(R14, 6); // globals <- rsi
        self.mov_enc_rr64(R15, 2); // consts  <- rdx
        // movabs r12, exit_state
        self.rex(true, 0, R12, false);
        self.emit(&[0xB8 + (R12 & 7)]);
        self.emit64(exit_state);
    }

    fn epilogue_ret(&mut self) {
        for enc in [15u8, 14, 13, 12, 5, 3] {
            self.pop_enc(enc);
        }
        self.emit(&[0xC3]);
    }

    fn set_return(&mut self, v: i32) {
        // mov rax, imm32 (sign-extended)
        self.rex(true, 0, RAX, false);
        self.emit(&[0xC7]);
        self.modrm_rr(0, RAX);
        self.emit32(v as u32);
    }

    fn mov_rr(&mut self, dst: u8, src: u8) {
        let (d, s) = (self.gpr(dst), self.gpr(src));
        if d != s {
            self.mov_enc_rr64(d, s);
        }
    }

    fn mov32_rr(&mut self, dst: u8, src: u8) {
        let (d, s) = (self.gpr(dst), self.gpr(src));
        self.op_rr(&[], false, &[0x89], s, d);
    }

    fn mov_ri(&mut self, dst: u8, imm: i64) {
        let d = self.gpr(dst);
        if imm >= 0 && imm <= u32::MAX as i64 {
            // mov r32, imm32 zero-extends.
            self.rex(false, 0, d, false);
            self.emit(&[0xB8 + (d & 7)]);
            self.emit32(imm as u32);
        } else if imm >= i32::MIN as i64 && imm <= i32::MAX as i64 {
            self.rex(true, 0, d, false);
            self.emit(&[0xC7]);
            self.modrm_rr(0, d);
            self.emit32(imm as u32);
        } else {
            self.rex(true, 0, d, false);
            self.emit(&[0xB8 + (d & 7)]);
            self.emit64(imm as u64);
        }
    }

    fn load_local(&mut self, dst: u8, slot: u16) {
        let d = self.gpr(dst);
        self.op_mem(&[], true, &[0x8B], d, R13, slot as i32 * 8);
    }

    fn store_local(&mut self, src: u8, slot: u16) {
        let s = self.gpr(src);
        self.op_mem(&[], true, &[0x89], s, R13, slot as i32 * 8);
    }

    fn load_global(&mut self, dst: u8, slot: u16) {
        let d = self.gpr(dst);
        self.op_mem(&[], true, &[0x8B], d, R14, slot as i32 * 8);
    }

    fn store_global(&mut self, src: u8, slot: u16) {
        let s = self.gpr(src);
        self.op_mem(&[], true, &[0x89], s, R14, slot as i32 * 8);
    }

    fn load_state(&mut self, dst: u8, off: u32) {
        let d = self.gpr(dst);
        self.op_mem(&[], true, &[0x8B], d, R12, off as i32);
    }

    fn store_state(&mut self, src: u8, off: u32) {
        let s = self.gpr(src);
        self.op_mem(&[], true, &[0x89], s, R12, off as i32);
    }

    fn fload_state(&mut self, dst: u8, off: u32) {
        let d = self.fpr(dst);
        self.op_mem(&[0xF2], false, &[0x0F, 0x10], d, R12, off as i32);
    }

    fn fstore_state(&mut self, src: u8, off: u32) {
        let s = self.fpr(src);
        self.op_mem(&[0xF2], false, &[0x0F, 0x11], s, R12, off as i32);
    }

    fn add32(&mut self, dst: u8, a: u8, b: u8) {
        self.alu_rr32(0x01, dst, a, b, true);
    }

    fn sub32(&mut self, dst: u8, a: u8, b: u8) {
        self.alu_rr32(0x29, dst, a, b, false);
    }

    fn mul32(&mut self, dst: u8, a: u8, b: u8) {
        let (d, a, b) = (self.gpr(dst), self.gpr(a), self.gpr(b));
        if d == a {
            self.op_rr(&[], false, &[0x0F, 0xAF], d, b);
        } else if d == b {
            self.op_rr(&[], false, &[0x0F, 0xAF], d, a);
        } else {
            self.op_rr(&[], false, &[0x89], a, d);
            self.op_rr(&[], false, &[0x0F, 0xAF], d, b);
        }
    }

    fn neg32(&mut self, dst: u8, a: u8) {
        let (d, a) = (self.gpr(dst), self.gpr(a));
        if d != a {
            self.op_rr(&[], false, &[0x89], a, d);
        }
        self.rex(false, 0, d, false);
        self.emit(&[0xF7]);
        self.modrm_rr(3, d);
    }

    fn add32i(&mut self, dst: u8, a: u8, imm: i32) {
        let (d, a) = (self.gpr(dst), self.gpr(a));
        if d != a {
            self.op_rr(&[], false, &[0x89], a, d);
        }
        self.alu_ri(false, 0, d, imm);
    }

    fn sdiv32(&mut self, dst: u8, a: u8, b: u8) {
        self.div_common(dst, a, b, false);
    }

    fn srem32(&mut self, dst: u8, a: u8, b: u8) {
        self.div_common(dst, a, b, true);
    }

    fn and64(&mut self, dst: u8, a: u8, b: u8) {
        self.alu_rr64(0x21, dst, a, b);
    }

    fn or64(&mut self, dst: u8, a: u8, b: u8) {
        self.alu_rr64(0x09, dst, a, b);
    }

    fn xor64(&mut self, dst: u8, a: u8, b: u8) {
        self.alu_rr64(0x31, dst, a, b);
    }

    fn xor32i(&mut self, dst: u8, a: u8, imm: i32) {
        let (d, a) = (self.gpr(dst), self.gpr(a));
        if d != a {
            self.op_rr(&[], false, &[0x89], a, d);
        }
        self.alu_ri(false, 6, d, imm);
    }

    fn and64i(&mut self, dst: u8, a: u8, imm: i32) {
        let (d, a) = (self.gpr(dst), self.gpr(a));
        if d != a {
            self.mov_enc_rr64(d, a);
        }
        self.alu_ri(true, 4, d, imm);
    }

    fn shl64i(&mut self, dst: u8, a: u8, sh: u8) {
        let (d, a) = (self.gpr(dst), self.gpr(a));
        if d != a {
            self.mov_enc_rr64(d, a);
        }
        self.rex(true, 0, d, false);
        self.emit(&[0xC1]);
        self.modrm_rr(4, d);
        self.emit(&[sh]);
    }

    fn shr64i(&mut self, dst: u8, a: u8, sh: u8) {
        let (d, a) = (self.gpr(dst), self.gpr(a));
        if d != a {
            self.mov_enc_rr64(d, a);
        }
        self.rex(true, 0, d, false);
        self.emit(&[0xC1]);
        self.modrm_rr(5, d);
        self.emit(&[sh]);
    }

    fn cmp32(&mut self, a: u8, b: u8) {
        let (a, b) = (self.gpr(a), self.gpr(b));
        self.op_rr(&[], false, &[0x39], b, a);
    }

    fn cmp32i(&mut self, a: u8, imm: i32) {
        let a = self.gpr(a);
        self.alu_ri(false, 7, a, imm);
    }

    fn cmp64(&mut self, a: u8, b: u8) {
        let (a, b) = (self.gpr(a), self.gpr(b));
        self.op_rr(&[], true, &[0x39], b, a);
    }

    fn cmp64i(&mut self, a: u8, imm: i32) {
        let a = self.gpr(a);
        self.alu_ri(true, 7, a, imm);
    }

    fn setcc(&mut self, dst: u8, cc: Cc) {
        let d = self.gpr(dst);
        self.setcc_raw(d, Self::cc_nibble(cc));
        self.movzx8(d, d);
    }

    fn jcc(&mut self, cc: Cc) -> Patch {
        self.emit(&[0x0F, 0x80 | Self::cc_nibble(cc)]);
        let p = Patch(self.pos());
        self.emit32(0);
        p
    }

    fn jmp(&mut self) -> Patch {
        self.emit(&[0xE9]);
        let p = Patch(self.pos());
        self.emit32(0);
        p
    }

    fn jmp_back(&mut self, target: usize) {
        self.emit(&[0xE9]);
        let rel = target as i64 - (self.pos() as i64 + 4);
        self.emit32(rel as u32);
    }

    fn bind(&mut self, p: Patch) {
        let rel = (self.pos() as i64 - (p.0 as i64 + 4)) as i32;
        self.code[p.0..p.0 + 4].copy_from_slice(&rel.to_le_bytes());
    }

    fn fmov_from_gpr(&mut self, dst: u8, src: u8) {
        let (d, s) = (self.fpr(dst), self.gpr(src));
        self.emit(&[0x66]);
        self.rex(true, d, s, false);
        self.emit(&[0x0F, 0x6E]);
        self.modrm_rr(d, s);
    }

    fn fmov_to_gpr(&mut self, dst: u8, src: u8) {
        let (d, s) = (self.gpr(dst), self.fpr(src));
        self.emit(&[0x66]);
        self.rex(true, s, d, false);
        self.emit(&[0x0F, 0x7E]);
        self.modrm_rr(s, d);
    }

    fn fmov(&mut self, dst: u8, src: u8) {
        let (d, s) = (self.fpr(dst), self.fpr(src));
        if d != s {
            self.sse_rr(0xF2, 0x10, d, s);
        }
    }

    fn fadd(&mut self, dst: u8, a: u8, b: u8) {
        self.sse_arith(0x58, dst, a, b, true);
    }

    fn fsub(&mut self, dst: u8, a: u8, b: u8) {
        self.sse_arith(0x5C, dst, a, b, false);
    }

    fn fmul(&mut self, dst: u8, a: u8, b: u8) {
        self.sse_arith(0x59, dst, a, b, true);
    }

    fn fdiv(&mut self, dst: u8, a: u8, b: u8) {
        self.sse_arith(0x5E, dst, a, b, false);
    }

    fn fneg(&mut self, dst: u8, a: u8) {
        self.fmov(dst, a);
        let d = self.fpr(dst);
        // Sign mask lives in the exit-state area; xorpd flips the sign bit.
        self.op_mem(&[0xF2], false, &[0x0F, 0x10], XMM_INTERNAL, R12, STATE_NEG_MASK as i32);
        self.emit(&[0x66]);
        self.rex(false, d, XMM_INTERNAL, false);
        self.emit(&[0x0F, 0x57]);
        self.modrm_rr(d, XMM_INTERNAL);
    }

    fn fcmp_set(&mut self, dst: u8, a: u8, b: u8, cc: FCc) {
        let d = self.gpr(dst);
        let (fa, fb) = (self.fpr(a), self.fpr(b));
        match cc {
            // a < b  <=>  comisd(b, a) above; NaN clears "above".
            FCc::Lt => {
                self.comisd(0x2F, fb, fa);
                self.setcc_raw(d, 0x7); // seta
                self.movzx8(d, d);
            }
            FCc::Le => {
                self.comisd(0x2F, fb, fa);
                self.setcc_raw(d, 0x3); // setae
                self.movzx8(d, d);
            }
            FCc::Gt => {
                self.comisd(0x2F, fa, fb);
                self.setcc_raw(d, 0x7);
                self.movzx8(d, d);
            }
            FCc::Ge => {
                self.comisd(0x2F, fa, fb);
                self.setcc_raw(d, 0x3);
                self.movzx8(d, d);
            }
            // Equality needs the parity bit folded in (PF set on NaN).
            FCc::Eq => {
                let s1 = self.gpr(Self::S1);
                self.comisd(0x2E, fa, fb);
                self.setcc_raw(d, 0x4); // sete
                self.setcc_raw(s1, 0xB); // setnp
                self.rex(false, s1, d, d >= 4 || s1 >= 4);
                self.emit(&[0x20]); // and d8, s1_8
                self.modrm_rr(s1, d);
                self.movzx8(d, d);
            }
            FCc::Ne => {
                let s1 = self.gpr(Self::S1);
                self.comisd(0x2E, fa, fb);
                self.setcc_raw(d, 0x5); // setne
                self.setcc_raw(s1, 0xA); // setp
                self.rex(false, s1, d, d >= 4 || s1 >= 4);
                self.emit(&[0x08]); // or d8, s1_8
                self.modrm_rr(s1, d);
                self.movzx8(d, d);
            }
        }
    }

    fn cvt_i32_f64(&mut self, dst: u8, src: u8) {
        let (d, s) = (self.fpr(dst), self.gpr(src));
        self.emit(&[0xF2]);
        self.rex(false, d, s, false);
        self.emit(&[0x0F, 0x2A]);
        self.modrm_rr(d, s);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asm() -> X64Asm {
        X64Asm::new()
    }

    #[test]
    fn test_mov_rr_encoding() {
        // mov rax, rcx => 48 89 C8
        let mut a = asm();
        a.mov_rr(0, 1);
        assert_eq!(a.into_code(), vec![0x48, 0x89, 0xC8]);
    }

    #[test]
    fn test_mov_rr_high_regs() {
        // mov r10, r8 => 4D 89 C2
        let mut a = asm();
        a.mov_rr(8, 6);
        assert_eq!(a.into_code(), vec![0x4D, 0x89, 0xC2]);
    }

    #[test]
    fn test_add32_same_dst() {
        // add eax, ecx => 01 C8
        let mut a = asm();
        a.add32(0, 0, 1);
        assert_eq!(a.into_code(), vec![0x01, 0xC8]);
    }

    #[test]
    fn test_add32_with_move() {
        // dst=rdx, a=rax, b=rcx => mov edx, eax; add edx, ecx
        let mut a = asm();
        a.add32(2, 0, 1);
        assert_eq!(a.into_code(), vec![0x89, 0xC2, 0x01, 0xCA]);
    }

    #[test]
    fn test_load_local_rbp_free_base() {
        // mov rax, [r13 + 8] => 49 8B 85 08 00 00 00
        let mut a = asm();
        a.load_local(0, 1);
        assert_eq!(a.into_code(), vec![0x49, 0x8B, 0x85, 8, 0, 0, 0]);
    }

    #[test]
    fn test_load_state_uses_sib_for_r12() {
        // mov rax, [r12 + 0] => 49 8B 84 24 00 00 00 00
        let mut a = asm();
        a.load_state(0, 0);
        assert_eq!(a.into_code(), vec![0x49, 0x8B, 0x84, 0x24, 0, 0, 0, 0]);
    }

    #[test]
    fn test_mov_ri_forms() {
        // mov eax, 1 (zero-extending 32-bit form)
        let mut a = asm();
        a.mov_ri(0, 1);
        assert_eq!(a.into_code(), vec![0xB8, 1, 0, 0, 0]);

        // mov rax, -1 (sign-extended imm32 form)
        let mut a = asm();
        a.mov_ri(0, -1);
        assert_eq!(a.into_code(), vec![0x48, 0xC7, 0xC0, 0xFF, 0xFF, 0xFF, 0xFF]);

        // movabs rax, 0x7FFC000000000003
        let mut a = asm();
        a.mov_ri(0, 0x7FFC_0000_0000_0003);
        let code = a.into_code();
        assert_eq!(&code[..2], &[0x48, 0xB8]);
        assert_eq!(&code[2..], &0x7FFC_0000_0000_0003u64.to_le_bytes());
    }

    #[test]
    fn test_setcc_movzx() {
        // cmp eax, ecx; sete al; movzx eax, al
        let mut a = asm();
        a.cmp32(0, 1);
        a.setcc(0, Cc::Eq);
        assert_eq!(a.into_code(), vec![0x39, 0xC8, 0x0F, 0x94, 0xC0, 0x0F, 0xB6, 0xC0]);
    }

    #[test]
    fn test_setcc_needs_rex_for_sil() {
        // bank index 4 is RSI: setcc must emit the bare REX prefix.
        let mut a = asm();
        a.setcc(4, Cc::Lt);
        let code = a.into_code();
        assert_eq!(&code[..4], &[0x40, 0x0F, 0x9C, 0xC6]);
    }

    #[test]
    fn test_jcc_patching() {
        let mut a = asm();
        let p = a.jcc(Cc::Ne);
        a.mov32_rr(0, 0); // 2 bytes of filler
        a.bind(p);
        let code = a.into_code();
        // 0F 85 rel32; rel = 2 (the filler length)
        assert_eq!(&code[..2], &[0x0F, 0x85]);
        assert_eq!(&code[2..6], &2i32.to_le_bytes());
    }

    #[test]
    fn test_jmp_back() {
        let mut a = asm();
        a.mov32_rr(0, 0); // target at 0, 2 bytes
        a.jmp_back(0);
        let code = a.into_code();
        // E9 rel32 with rel = 0 - 7 = -7
        assert_eq!(code[2], 0xE9);
        assert_eq!(&code[3..7], &(-7i32).to_le_bytes());
    }

    #[test]
    fn test_shl_shr() {
        // shl rax, 3 => 48 C1 E0 03 ; shr rax, 3 => 48 C1 E8 03
        let mut a = asm();
        a.shl64i(0, 0, 3);
        a.shr64i(0, 0, 3);
        assert_eq!(a.into_code(), vec![0x48, 0xC1, 0xE0, 3, 0x48, 0xC1, 0xE8, 3]);
    }

    #[test]
    fn test_push_pop_prologue_balance() {
        let mut a = asm();
        a.prologue(0x1234_5678_9ABC_DEF0);
        a.set_return(-1);
        a.epilogue_ret();
        let code = a.into_code();
        assert_eq!(*code.last().unwrap(), 0xC3);
        // Six pushes at the head: rbx, rbp, r12..r15.
        assert_eq!(&code[..2], &[0x53, 0x55]);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_assembled_identity_runs() {
        use crate::jit::backend::codebuf::CodeBuffer;

        // A function that returns -1 through the full prologue/epilogue.
        let mut a = asm();
        a.prologue(0);
        a.set_return(-1);
        a.epilogue_ret();
        let code = a.into_code();

        let mut cb = CodeBuffer::with_capacity(code.len()).unwrap();
        cb.write(&code).unwrap();
        let exec = cb.finalize().unwrap();
        let f: crate::jit::backend::TraceEntryFn = unsafe { std::mem::transmute(exec.ptr()) };
        let r = unsafe { f(std::ptr::null_mut(), std::ptr::null_mut(), std::ptr::null()) };
        assert_eq!(r, -1);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_assembled_arith_runs() {
        use crate::jit::backend::codebuf::CodeBuffer;

        // return (7 + 35) via bank registers and the sign-extending return.
        let mut a = asm();
        a.prologue(0);
        a.mov_ri(1, 7);
        a.mov_ri(2, 35);
        a.add32(3, 1, 2);
        // mov rax, rbx-equivalent through set_return path: store into eax.
        let d = 0; // bank 0 is RAX
        a.mov32_rr(d, 3);
        a.epilogue_ret();
        let code = a.into_code();

        let mut cb = CodeBuffer::with_capacity(code.len()).unwrap();
        cb.write(&code).unwrap();
        let exec = cb.finalize().unwrap();
        let f: crate::jit::backend::TraceEntryFn = unsafe { std::mem::transmute(exec.ptr()) };
        let r = unsafe { f(std::ptr::null_mut(), std::ptr::null_mut(), std::ptr::null()) };
        assert_eq!(r, 42);
    }
}
