//! x86-64 System V code emitter.
//!
//! Register assignment:
//! - `rbx`: [`crate::DynContext`] base for the whole run (callee-saved, set by `run_code`)
//! - `rax`/`rcx`/`rdx`/`r8`/`r9`: the [`HostReg`] roles
//! - `r10`/`r11`: private scratch for flag transfer
//!
//! `run_code` pushes six registers and then `call`s the block, so compiled code runs with a
//! 16-byte aligned stack and may call helpers directly.

use super::{
    AluOp, BlockReturn, BranchCond, BranchToken, CodeSink, HostEmitter, HostReg, UnaryOp, Width,
};
use crate::FLAGS_ARITH_MASK;

const RAX: u8 = 0;
const RCX: u8 = 1;
const RDX: u8 = 2;
const RBX: u8 = 3;
const RBP: u8 = 5;
const RSI: u8 = 6;
const RDI: u8 = 7;
const R8: u8 = 8;
const R9: u8 = 9;
const R10: u8 = 10;
const R11: u8 = 11;
const R12: u8 = 12;
const R13: u8 = 13;
const R14: u8 = 14;
const R15: u8 = 15;

/// Integer parameter registers of the System V calling convention.
const PARAM_REGS: [u8; 4] = [RDI, RSI, RDX, RCX];

/// Callee-saved registers preserved by `run_code`, in push order.
const SAVED_REGS: [u8; 6] = [RBX, RBP, R12, R13, R14, R15];

const fn host(reg: HostReg) -> u8 {
    match reg {
        HostReg::RetOp => RAX,
        HostReg::Op1 => RCX,
        HostReg::Op2 => RDX,
        HostReg::Addr => R8,
        HostReg::Temp => R9,
    }
}

fn emit_rex(out: &mut dyn CodeSink, w: bool, r: u8, b: u8) {
    let rex = 0x40 | ((w as u8) << 3) | (((r >> 3) & 1) << 2) | ((b >> 3) & 1);
    if rex != 0x40 {
        out.add_u8(rex);
    }
}

/// REX for instructions with a byte register in the `reg` field; `spl..dil` need a bare REX.
fn emit_rex_byte(out: &mut dyn CodeSink, r: u8, b: u8) {
    let rex = 0x40 | (((r >> 3) & 1) << 2) | ((b >> 3) & 1);
    if rex != 0x40 || (4..8).contains(&r) {
        out.add_u8(rex);
    }
}

fn emit_modrm(out: &mut dyn CodeSink, mode: u8, reg: u8, rm: u8) {
    out.add_u8(((mode & 0x3) << 6) | ((reg & 0x7) << 3) | (rm & 0x7));
}

/// `[rbx + disp32]` with `reg` in the ModRM reg field.
fn emit_ctx_mem(out: &mut dyn CodeSink, reg: u8, offset: u32) {
    emit_modrm(out, 0b10, reg, RBX);
    out.add_u32(offset);
}

fn push_r64(out: &mut dyn CodeSink, reg: u8) {
    emit_rex(out, false, 0, reg);
    out.add_u8(0x50 + (reg & 0x7));
}

fn pop_r64(out: &mut dyn CodeSink, reg: u8) {
    emit_rex(out, false, 0, reg);
    out.add_u8(0x58 + (reg & 0x7));
}

fn mov_r32_r32(out: &mut dyn CodeSink, dst: u8, src: u8) {
    emit_rex(out, false, src, dst);
    out.add_u8(0x89);
    emit_modrm(out, 0b11, src, dst);
}

fn mov_r64_r64(out: &mut dyn CodeSink, dst: u8, src: u8) {
    emit_rex(out, true, src, dst);
    out.add_u8(0x89);
    emit_modrm(out, 0b11, src, dst);
}

fn mov_r32_imm32(out: &mut dyn CodeSink, dst: u8, imm: u32) {
    emit_rex(out, false, 0, dst);
    out.add_u8(0xB8 + (dst & 0x7));
    out.add_u32(imm);
}

fn mov_r64_imm64(out: &mut dyn CodeSink, dst: u8, imm: u64) {
    emit_rex(out, true, 0, dst);
    out.add_u8(0xB8 + (dst & 0x7));
    out.add_u64(imm);
}

fn mov_r32_ctx(out: &mut dyn CodeSink, dst: u8, offset: u32) {
    emit_rex(out, false, dst, RBX);
    out.add_u8(0x8B);
    emit_ctx_mem(out, dst, offset);
}

fn mov_ctx_r32(out: &mut dyn CodeSink, offset: u32, src: u8) {
    emit_rex(out, false, src, RBX);
    out.add_u8(0x89);
    emit_ctx_mem(out, src, offset);
}

fn and_r32_imm32(out: &mut dyn CodeSink, reg: u8, imm: u32) {
    emit_rex(out, false, 0, reg);
    out.add_u8(0x81);
    emit_modrm(out, 0b11, 4, reg);
    out.add_u32(imm);
}

fn test_r32_r32(out: &mut dyn CodeSink, reg: u8) {
    emit_rex(out, false, reg, reg);
    out.add_u8(0x85);
    emit_modrm(out, 0b11, reg, reg);
}

/// `jcc rel32` / `jmp rel32` with a zero displacement; returns the displacement position.
fn branch_rel32(out: &mut dyn CodeSink, cc: Option<u8>) -> BranchToken {
    match cc {
        Some(cc) => {
            out.add_u8(0x0F);
            out.add_u8(0x80 | (cc & 0xF));
        }
        None => out.add_u8(0xE9),
    }
    let at = out.pos();
    out.add_u32(0);
    BranchToken { at }
}

/// The x86-64 [`HostEmitter`].
#[derive(Debug, Clone, Copy, Default)]
pub struct X64Emitter;

impl X64Emitter {
    pub const fn new() -> Self {
        Self
    }
}

impl HostEmitter for X64Emitter {
    fn run_code(&self, out: &mut dyn CodeSink) {
        for reg in SAVED_REGS {
            push_r64(out, reg);
        }
        // rsi = ctx, rdi = block entry.
        mov_r64_r64(out, RBX, RSI);
        emit_rex(out, false, 0, RDI);
        out.add_u8(0xFF);
        emit_modrm(out, 0b11, 2, RDI);
        for reg in SAVED_REGS.iter().rev() {
            pop_r64(out, *reg);
        }
        out.add_u8(0xC3);
    }

    fn return_with(&self, out: &mut dyn CodeSink, code: BlockReturn) {
        mov_r32_imm32(out, RAX, code as u32);
        out.add_u8(0xC3);
    }

    fn mov_regs(&self, out: &mut dyn CodeSink, dst: HostReg, src: HostReg) {
        if dst != src {
            mov_r32_r32(out, host(dst), host(src));
        }
    }

    fn mov_imm(&self, out: &mut dyn CodeSink, dst: HostReg, imm: u32) {
        mov_r32_imm32(out, host(dst), imm);
    }

    fn load_ctx(&self, out: &mut dyn CodeSink, dst: HostReg, offset: u32, width: Width) {
        let dst = host(dst);
        match width {
            Width::U32 => mov_r32_ctx(out, dst, offset),
            Width::U16 | Width::U8 => {
                emit_rex(out, false, dst, RBX);
                out.add_u8(0x0F);
                out.add_u8(if width == Width::U8 { 0xB6 } else { 0xB7 });
                emit_ctx_mem(out, dst, offset);
            }
        }
    }

    fn store_ctx(&self, out: &mut dyn CodeSink, src: HostReg, offset: u32, width: Width) {
        let src = host(src);
        match width {
            Width::U32 => mov_ctx_r32(out, offset, src),
            Width::U16 => {
                out.add_u8(0x66);
                emit_rex(out, false, src, RBX);
                out.add_u8(0x89);
                emit_ctx_mem(out, src, offset);
            }
            Width::U8 => {
                emit_rex_byte(out, src, RBX);
                out.add_u8(0x88);
                emit_ctx_mem(out, src, offset);
            }
        }
    }

    fn store_ctx_imm(&self, out: &mut dyn CodeSink, offset: u32, imm: u32) {
        out.add_u8(0xC7);
        emit_ctx_mem(out, 0, offset);
        out.add_u32(imm);
    }

    fn sub_ctx_imm(&self, out: &mut dyn CodeSink, offset: u32, imm: u32) {
        out.add_u8(0x81);
        emit_ctx_mem(out, 5, offset);
        out.add_u32(imm);
    }

    fn alu(&self, out: &mut dyn CodeSink, op: AluOp, dst: HostReg, src: HostReg) {
        let (dst, src) = (host(dst), host(src));
        let opcode = match op {
            AluOp::Add => 0x01,
            AluOp::Or => 0x09,
            AluOp::And => 0x21,
            AluOp::Sub => 0x29,
            AluOp::Xor => 0x31,
            AluOp::Cmp => 0x39,
            AluOp::Test => 0x85,
        };
        emit_rex(out, false, src, dst);
        out.add_u8(opcode);
        emit_modrm(out, 0b11, src, dst);
    }

    fn alu_imm(&self, out: &mut dyn CodeSink, op: AluOp, dst: HostReg, imm: u32) {
        let dst = host(dst);
        let (opcode, ext) = match op {
            AluOp::Add => (0x81, 0),
            AluOp::Or => (0x81, 1),
            AluOp::And => (0x81, 4),
            AluOp::Sub => (0x81, 5),
            AluOp::Xor => (0x81, 6),
            AluOp::Cmp => (0x81, 7),
            AluOp::Test => (0xF7, 0),
        };
        emit_rex(out, false, 0, dst);
        out.add_u8(opcode);
        emit_modrm(out, 0b11, ext, dst);
        out.add_u32(imm);
    }

    fn unary(&self, out: &mut dyn CodeSink, op: UnaryOp, reg: HostReg) {
        let reg = host(reg);
        emit_rex(out, false, 0, reg);
        out.add_u8(0xFF);
        emit_modrm(out, 0b11, if op == UnaryOp::Inc { 0 } else { 1 }, reg);
    }

    fn shl_imm(&self, out: &mut dyn CodeSink, reg: HostReg, amount: u8) {
        if amount == 0 {
            return;
        }
        let reg = host(reg);
        emit_rex(out, false, 0, reg);
        out.add_u8(0xC1);
        emit_modrm(out, 0b11, 4, reg);
        out.add_u8(amount);
    }

    fn save_flags(&self, out: &mut dyn CodeSink, offset: u32) {
        out.add_u8(0x9C); // pushfq
        pop_r64(out, R10);
        and_r32_imm32(out, R10, FLAGS_ARITH_MASK);
        mov_r32_ctx(out, R11, offset);
        and_r32_imm32(out, R11, !FLAGS_ARITH_MASK);
        // or r11d, r10d
        emit_rex(out, false, R10, R11);
        out.add_u8(0x09);
        emit_modrm(out, 0b11, R10, R11);
        mov_ctx_r32(out, offset, R11);
    }

    fn load_flags(&self, out: &mut dyn CodeSink, offset: u32) {
        mov_r32_ctx(out, R10, offset);
        // Only the arithmetic flags reach the host; TF/DF/IF stay under host control.
        and_r32_imm32(out, R10, FLAGS_ARITH_MASK);
        push_r64(out, R10);
        out.add_u8(0x9D); // popfq
    }

    fn load_param_reg(&self, out: &mut dyn CodeSink, param: usize, src: HostReg) {
        let dst = PARAM_REGS[param];
        let src = host(src);
        if dst != src {
            mov_r32_r32(out, dst, src);
        }
    }

    fn load_param_imm(&self, out: &mut dyn CodeSink, param: usize, imm: u32) {
        mov_r32_imm32(out, PARAM_REGS[param], imm);
    }

    fn load_param_ctx_ptr(&self, out: &mut dyn CodeSink, param: usize, offset: u32) {
        let dst = PARAM_REGS[param];
        emit_rex(out, true, dst, RBX);
        out.add_u8(0x8B);
        emit_ctx_mem(out, dst, offset);
    }

    fn call_function(&self, out: &mut dyn CodeSink, target: usize) {
        let next = out.host_addr(out.pos()) as i64 + 5;
        let rel = target as i64 - next;
        match i32::try_from(rel) {
            Ok(rel) => {
                out.add_u8(0xE8);
                out.add_u32(rel as u32);
            }
            Err(_) => {
                mov_r64_imm64(out, RAX, target as u64);
                out.add_u8(0xFF);
                emit_modrm(out, 0b11, 2, RAX);
            }
        }
    }

    fn create_branch(&self, out: &mut dyn CodeSink, cond: BranchCond) -> BranchToken {
        match cond {
            BranchCond::Always => branch_rel32(out, None),
            BranchCond::NonZero(reg) => {
                test_r32_r32(out, host(reg));
                branch_rel32(out, Some(0x5))
            }
            BranchCond::LessEqualZero(reg) => {
                test_r32_r32(out, host(reg));
                branch_rel32(out, Some(0xE))
            }
            BranchCond::Guest(cc) => branch_rel32(out, Some(cc as u8)),
        }
    }

    fn fill_branch(&self, out: &mut dyn CodeSink, token: BranchToken) {
        let rel = out.pos() as i64 - (token.at as i64 + 4);
        out.patch_u32(token.at, rel as i32 as u32);
    }

    fn jmp_slot(&self, out: &mut dyn CodeSink, slot_addr: usize) {
        mov_r64_imm64(out, RAX, slot_addr as u64);
        // jmp qword [rax]
        out.add_u8(0xFF);
        emit_modrm(out, 0b00, 4, RAX);
    }
}
