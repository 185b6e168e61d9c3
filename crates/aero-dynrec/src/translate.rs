//! Translation of one guest block.
//!
//! [`translate`] opens the active cache block, decodes guest instructions from a single page with
//! `iced-x86` and emits host code for each through a [`HostEmitter`], closes the block with the
//! type implied by its terminating instruction and indexes it on the page's
//! [`crate::CodePageHandler`].
//!
//! Guest state lives in [`crate::DynContext`] between instructions; no guest register is cached
//! in a host register across instruction boundaries, so any exit (including one from the middle
//! of a block) leaves a precise context behind.
//!
//! Block layout:
//!
//! ```text
//! prologue   running = id; if cycles <= 0 -> [cycle stub]
//! body       one host sequence per guest instruction, in guest order
//! exit       link-slot jumps (SingleLink/DualLink) or `return code` (Normal)
//! stubs      rarely taken exits reached by forward branches from the prologue and body
//! ```

use iced_x86::{Code, Decoder, DecoderOptions, Instruction, Mnemonic, OpKind, Register};
use tracing::debug;

use crate::block::{BlockType, CacheBlockId, LinkSlot};
use crate::cache::CodeCache;
use crate::context::{
    reg8_off, reg_off, Gpr, CTX_CALLBACK_OFF, CTX_CYCLES_OFF, CTX_EFLAGS_OFF, CTX_EIP_OFF,
    CTX_ENGINE_OFF, CTX_RUNNING_OFF,
};
use crate::emit::{
    AluOp, BlockReturn, BranchCond, BranchToken, CodeSink, Cond, HostEmitter, HostReg, UnaryOp,
    Width,
};
use crate::error::{fatal, FatalError};
use crate::memory::GuestMemory;
use crate::page::{CodePageId, CodePages};
use crate::{PAGE_OFFSET_MASK, PAGE_SHIFT, PAGE_SIZE};

/// Room kept free for one more guest instruction.
const INSN_RESERVE: usize = 128;
/// Room kept free for the block exit.
const EXIT_RESERVE: usize = 128;
/// Room per deferred stub.
const STUB_RESERVE: usize = 32;

/// Host addresses of the memory helpers compiled code calls.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct HelperTable {
    /// `fn(engine, addr) -> u32`
    pub(crate) read_u32: usize,
    /// `fn(engine, addr, value) -> u32`, non-zero if the running block was invalidated.
    pub(crate) write_u8: usize,
    pub(crate) write_u16: usize,
    pub(crate) write_u32: usize,
}

impl HelperTable {
    fn write(&self, width: Width) -> usize {
        match width {
            Width::U8 => self.write_u8,
            Width::U16 => self.write_u16,
            Width::U32 => self.write_u32,
        }
    }
}

/// Per-block translation limits.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Limits {
    pub(crate) max_instructions: usize,
    pub(crate) max_block_bytes: usize,
}

/// Flat 32-bit effective address `base + (index << shift) + disp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MemRef {
    base: Option<Gpr>,
    index: Option<(Gpr, u8)>,
    disp: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Src {
    /// Context offset of a register of the store's width.
    Reg(u32),
    Imm(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AluSrc {
    Reg(Gpr),
    Imm(u32),
}

/// A guest instruction the translator can compile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Nop,
    MovImm { dst: Gpr, imm: u32 },
    MovReg { dst: Gpr, src: Gpr },
    Load { dst: Gpr, mem: MemRef },
    Store { mem: MemRef, width: Width, src: Src },
    Alu { op: AluOp, dst: Gpr, src: AluSrc },
    Unary { op: UnaryOp, reg: Gpr },
    Lea { dst: Gpr, mem: MemRef },
    Push(Gpr),
    Pop(Gpr),
    Jmp(u32),
    Jcc { cond: Cond, target: u32 },
    Call(u32),
    Ret,
    JmpReg(Gpr),
    Int(u8),
}

/// How control leaves the block body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// Block limit reached; continue at the next instruction.
    Fall(u32),
    Jump(u32),
    Branch { cond: Cond, taken: u32, not_taken: u32 },
    /// `eip` has already been stored.
    Return,
    /// The interpreter executes the instruction at this address.
    Interpret(u32),
    CallBack(u32),
}

#[derive(Debug, Clone, Copy)]
enum Stub {
    Cycles(BranchToken),
    Smc {
        token: BranchToken,
        eip: u32,
        instructions: u32,
    },
}

/// Compile the guest code at `eip` into a new block and index it on `code_page`.
///
/// The caller has already looked the address up and installed `code_page` for its page.
#[allow(clippy::too_many_arguments)]
pub(crate) fn translate(
    emitter: &dyn HostEmitter,
    cache: &mut CodeCache,
    pages: &mut CodePages,
    mem: &GuestMemory,
    code_page: CodePageId,
    helpers: &HelperTable,
    limits: Limits,
    eip: u32,
) -> CacheBlockId {
    let Some(page_bytes) = mem.page_bytes(eip >> PAGE_SHIFT) else {
        fatal(FatalError::ArenaCorrupted("translating outside guest memory"));
    };
    let id = cache.open_block(pages);

    let mut builder = BlockBuilder {
        emitter,
        origin: cache.pos(),
        out: cache,
        helpers,
        limits,
        id,
        stubs: Vec::new(),
    };
    let (block_type, end, instructions) = builder.build(page_bytes, eip);
    let size = builder.out.pos() - builder.origin;

    cache.close_block(block_type);
    let start = (eip & PAGE_OFFSET_MASK) as u16;
    pages.add_cache_block(cache, code_page, id, start, end);
    debug!(
        block = %id,
        eip = format_args!("{eip:#x}"),
        end = format_args!("{:#x}", (eip & !PAGE_OFFSET_MASK) | u32::from(end)),
        instructions,
        ?block_type,
        host_bytes = size,
        "compiled block"
    );
    id
}

struct BlockBuilder<'a> {
    emitter: &'a dyn HostEmitter,
    out: &'a mut CodeCache,
    helpers: &'a HelperTable,
    limits: Limits,
    id: CacheBlockId,
    origin: usize,
    stubs: Vec<Stub>,
}

impl BlockBuilder<'_> {
    /// Emit the whole block. Returns its type, the page offset of its last source byte and the
    /// number of compiled instructions.
    fn build(&mut self, page_bytes: &[u8], eip: u32) -> (BlockType, u16, u32) {
        let start = (eip & PAGE_OFFSET_MASK) as usize;
        let e = self.emitter;

        e.store_ctx_imm(self.out, CTX_RUNNING_OFF, self.id.raw());
        e.load_ctx(self.out, HostReg::RetOp, CTX_CYCLES_OFF, Width::U32);
        let cycles = e.create_branch(self.out, BranchCond::LessEqualZero(HostReg::RetOp));
        self.stubs.push(Stub::Cycles(cycles));

        let mut decoder = Decoder::with_ip(
            32,
            &page_bytes[start..],
            u64::from(eip),
            DecoderOptions::NONE,
        );
        let mut instr = Instruction::default();
        let mut count: u32 = 0;
        // One past the last source byte, as a page offset.
        let mut end = start;

        let exit = loop {
            let cur = eip.wrapping_add(decoder.position() as u32);
            if count as usize >= self.limits.max_instructions
                || !decoder.can_decode()
                || self.out_of_space()
            {
                break Exit::Fall(cur);
            }

            decoder.decode_out(&mut instr);
            // A truncated instruction at the end of the page still counts as source up to the
            // page end.
            end = (start + decoder.position())
                .min(PAGE_SIZE)
                .max(end + 1);
            if instr.is_invalid() {
                break Exit::Interpret(cur);
            }
            let Some(op) = classify(&instr) else {
                break Exit::Interpret(cur);
            };
            count += 1;
            if let Some(exit) = self.emit_op(op, instr.next_ip32(), count) {
                break exit;
            }
        };

        let block_type = self.emit_exit(exit, count);
        self.emit_stubs();
        (block_type, (end - 1) as u16, count)
    }

    fn out_of_space(&self) -> bool {
        let written = self.out.pos() - self.origin;
        written + INSN_RESERVE + EXIT_RESERVE + (self.stubs.len() + 1) * STUB_RESERVE
            > self.limits.max_block_bytes
    }

    fn emit_op(&mut self, op: Op, next: u32, count: u32) -> Option<Exit> {
        let e = self.emitter;
        match op {
            Op::Nop => {}
            Op::MovImm { dst, imm } => e.store_ctx_imm(self.out, reg_off(dst), imm),
            Op::MovReg { dst, src } => {
                e.load_ctx(self.out, HostReg::RetOp, reg_off(src), Width::U32);
                e.store_ctx(self.out, HostReg::RetOp, reg_off(dst), Width::U32);
            }
            Op::Load { dst, mem } => {
                self.effective_address(mem);
                self.call_read();
                e.store_ctx(self.out, HostReg::RetOp, reg_off(dst), Width::U32);
            }
            Op::Store { mem, width, src } => {
                self.effective_address(mem);
                match src {
                    Src::Reg(offset) => e.load_ctx(self.out, HostReg::Temp, offset, width),
                    Src::Imm(imm) => e.mov_imm(self.out, HostReg::Temp, imm),
                }
                self.call_write(width, next, count);
            }
            Op::Alu { op, dst, src } => {
                e.load_ctx(self.out, HostReg::RetOp, reg_off(dst), Width::U32);
                match src {
                    AluSrc::Reg(src) => {
                        e.load_ctx(self.out, HostReg::Op1, reg_off(src), Width::U32);
                        e.alu(self.out, op, HostReg::RetOp, HostReg::Op1);
                    }
                    AluSrc::Imm(imm) => e.alu_imm(self.out, op, HostReg::RetOp, imm),
                }
                e.save_flags(self.out, CTX_EFLAGS_OFF);
                if op.writes_result() {
                    e.store_ctx(self.out, HostReg::RetOp, reg_off(dst), Width::U32);
                }
            }
            Op::Unary { op, reg } => {
                // INC/DEC leave CF alone: start from the guest flags.
                e.load_ctx(self.out, HostReg::RetOp, reg_off(reg), Width::U32);
                e.load_flags(self.out, CTX_EFLAGS_OFF);
                e.unary(self.out, op, HostReg::RetOp);
                e.save_flags(self.out, CTX_EFLAGS_OFF);
                e.store_ctx(self.out, HostReg::RetOp, reg_off(reg), Width::U32);
            }
            Op::Lea { dst, mem } => {
                self.effective_address(mem);
                e.store_ctx(self.out, HostReg::Addr, reg_off(dst), Width::U32);
            }
            Op::Push(src) => {
                e.load_ctx(self.out, HostReg::Temp, reg_off(src), Width::U32);
                self.push_temp();
                self.call_write(Width::U32, next, count);
            }
            Op::Pop(dst) => {
                e.load_ctx(self.out, HostReg::Addr, reg_off(Gpr::Esp), Width::U32);
                self.call_read();
                self.release_stack(4);
                e.store_ctx(self.out, HostReg::RetOp, reg_off(dst), Width::U32);
            }
            Op::Jmp(target) => return Some(Exit::Jump(target)),
            Op::Jcc { cond, target } => {
                return Some(Exit::Branch {
                    cond,
                    taken: target,
                    not_taken: next,
                })
            }
            Op::Call(target) => {
                e.mov_imm(self.out, HostReg::Temp, next);
                self.push_temp();
                self.call_write(Width::U32, target, count);
                return Some(Exit::Jump(target));
            }
            Op::Ret => {
                e.load_ctx(self.out, HostReg::Addr, reg_off(Gpr::Esp), Width::U32);
                self.call_read();
                e.store_ctx(self.out, HostReg::RetOp, CTX_EIP_OFF, Width::U32);
                self.release_stack(4);
                return Some(Exit::Return);
            }
            Op::JmpReg(src) => {
                e.load_ctx(self.out, HostReg::RetOp, reg_off(src), Width::U32);
                e.store_ctx(self.out, HostReg::RetOp, CTX_EIP_OFF, Width::U32);
                return Some(Exit::Return);
            }
            Op::Int(vector) => {
                e.store_ctx_imm(self.out, CTX_CALLBACK_OFF, u32::from(vector));
                return Some(Exit::CallBack(next));
            }
        }
        None
    }

    /// Leave the effective address of `mem` in [`HostReg::Addr`]. Clobbers `Temp`.
    fn effective_address(&mut self, mem: MemRef) {
        let e = self.emitter;
        match mem.base {
            Some(base) => {
                e.load_ctx(self.out, HostReg::Addr, reg_off(base), Width::U32);
                if mem.disp != 0 {
                    e.alu_imm(self.out, AluOp::Add, HostReg::Addr, mem.disp);
                }
            }
            None => e.mov_imm(self.out, HostReg::Addr, mem.disp),
        }
        if let Some((index, shift)) = mem.index {
            e.load_ctx(self.out, HostReg::Temp, reg_off(index), Width::U32);
            e.shl_imm(self.out, HostReg::Temp, shift);
            e.alu(self.out, AluOp::Add, HostReg::Addr, HostReg::Temp);
        }
    }

    /// `esp -= 4`, leaving the new `esp` in `Addr`.
    fn push_temp(&mut self) {
        let e = self.emitter;
        e.load_ctx(self.out, HostReg::Addr, reg_off(Gpr::Esp), Width::U32);
        e.alu_imm(self.out, AluOp::Sub, HostReg::Addr, 4);
        e.store_ctx(self.out, HostReg::Addr, reg_off(Gpr::Esp), Width::U32);
    }

    fn release_stack(&mut self, bytes: u32) {
        let e = self.emitter;
        e.load_ctx(self.out, HostReg::Op1, reg_off(Gpr::Esp), Width::U32);
        e.alu_imm(self.out, AluOp::Add, HostReg::Op1, bytes);
        e.store_ctx(self.out, HostReg::Op1, reg_off(Gpr::Esp), Width::U32);
    }

    /// `RetOp = read_u32(engine, Addr)`.
    fn call_read(&mut self) {
        let e = self.emitter;
        e.load_param_reg(self.out, 1, HostReg::Addr);
        e.load_param_ctx_ptr(self.out, 0, CTX_ENGINE_OFF);
        e.call_function(self.out, self.helpers.read_u32);
    }

    /// Store `Temp` at `Addr` through the checked write helper. If the store invalidated this
    /// block, leave it with `eip = resume` once the store is done.
    fn call_write(&mut self, width: Width, resume: u32, instructions: u32) {
        let e = self.emitter;
        e.load_param_reg(self.out, 2, HostReg::Temp);
        e.load_param_reg(self.out, 1, HostReg::Addr);
        e.load_param_ctx_ptr(self.out, 0, CTX_ENGINE_OFF);
        e.call_function(self.out, self.helpers.write(width));
        let token = e.create_branch(self.out, BranchCond::NonZero(HostReg::RetOp));
        self.stubs.push(Stub::Smc {
            token,
            eip: resume,
            instructions,
        });
    }

    fn link_exit(&mut self, slot: LinkSlot, target: u32, instructions: u32) {
        let e = self.emitter;
        e.store_ctx_imm(self.out, CTX_EIP_OFF, target);
        self.charge(instructions);
        let slot_addr = self.out.link_slot_addr(self.id, slot);
        e.jmp_slot(self.out, slot_addr);
    }

    fn return_exit(&mut self, eip: Option<u32>, instructions: u32, code: BlockReturn) {
        let e = self.emitter;
        if let Some(eip) = eip {
            e.store_ctx_imm(self.out, CTX_EIP_OFF, eip);
        }
        self.charge(instructions);
        e.return_with(self.out, code);
    }

    fn charge(&mut self, instructions: u32) {
        if instructions != 0 {
            self.emitter
                .sub_ctx_imm(self.out, CTX_CYCLES_OFF, instructions);
        }
    }

    fn emit_exit(&mut self, exit: Exit, count: u32) -> BlockType {
        match exit {
            Exit::Fall(target) | Exit::Jump(target) => {
                self.link_exit(LinkSlot::Link1, target, count);
                BlockType::SingleLink
            }
            Exit::Branch {
                cond,
                taken,
                not_taken,
            } => {
                let e = self.emitter;
                e.load_flags(self.out, CTX_EFLAGS_OFF);
                let branch = e.create_branch(self.out, BranchCond::Guest(cond));
                self.link_exit(LinkSlot::Link1, not_taken, count);
                e.fill_branch(self.out, branch);
                self.link_exit(LinkSlot::Link2, taken, count);
                BlockType::DualLink
            }
            Exit::Return => {
                self.return_exit(None, count, BlockReturn::Normal);
                BlockType::Normal
            }
            Exit::Interpret(eip) => {
                self.return_exit(Some(eip), count, BlockReturn::Opcode);
                BlockType::Normal
            }
            Exit::CallBack(next) => {
                self.return_exit(Some(next), count, BlockReturn::CallBack);
                BlockType::Normal
            }
        }
    }

    fn emit_stubs(&mut self) {
        for stub in core::mem::take(&mut self.stubs) {
            match stub {
                Stub::Cycles(token) => {
                    self.emitter.fill_branch(self.out, token);
                    self.emitter.return_with(self.out, BlockReturn::Cycles);
                }
                Stub::Smc {
                    token,
                    eip,
                    instructions,
                } => {
                    self.emitter.fill_branch(self.out, token);
                    self.return_exit(Some(eip), instructions, BlockReturn::SmcBlock);
                }
            }
        }
    }
}

fn gpr32(reg: Register) -> Option<Gpr> {
    Some(match reg {
        Register::EAX => Gpr::Eax,
        Register::ECX => Gpr::Ecx,
        Register::EDX => Gpr::Edx,
        Register::EBX => Gpr::Ebx,
        Register::ESP => Gpr::Esp,
        Register::EBP => Gpr::Ebp,
        Register::ESI => Gpr::Esi,
        Register::EDI => Gpr::Edi,
        _ => return None,
    })
}

fn gpr16(reg: Register) -> Option<Gpr> {
    Some(match reg {
        Register::AX => Gpr::Eax,
        Register::CX => Gpr::Ecx,
        Register::DX => Gpr::Edx,
        Register::BX => Gpr::Ebx,
        Register::SP => Gpr::Esp,
        Register::BP => Gpr::Ebp,
        Register::SI => Gpr::Esi,
        Register::DI => Gpr::Edi,
        _ => return None,
    })
}

/// Context offset of an 8-bit register.
fn gpr8_off(reg: Register) -> Option<u32> {
    Some(match reg {
        Register::AL => reg8_off(Gpr::Eax, false),
        Register::CL => reg8_off(Gpr::Ecx, false),
        Register::DL => reg8_off(Gpr::Edx, false),
        Register::BL => reg8_off(Gpr::Ebx, false),
        Register::AH => reg8_off(Gpr::Eax, true),
        Register::CH => reg8_off(Gpr::Ecx, true),
        Register::DH => reg8_off(Gpr::Edx, true),
        Register::BH => reg8_off(Gpr::Ebx, true),
        _ => return None,
    })
}

fn reg_operand(instr: &Instruction, operand: u32) -> Option<Gpr> {
    (instr.op_kind(operand) == OpKind::Register)
        .then(|| gpr32(instr.op_register(operand)))
        .flatten()
}

/// `base + index * scale + disp` of the memory operand, if it uses 32-bit addressing.
fn address(instr: &Instruction) -> Option<MemRef> {
    let base = match instr.memory_base() {
        Register::None => None,
        reg => Some(gpr32(reg)?),
    };
    let index = match instr.memory_index() {
        Register::None => None,
        reg => Some((
            gpr32(reg)?,
            instr.memory_index_scale().trailing_zeros() as u8,
        )),
    };
    Some(MemRef {
        base,
        index,
        disp: instr.memory_displacement32(),
    })
}

/// The memory operand of `instr`, if it is a flat access (no FS/GS override).
fn mem_operand(instr: &Instruction) -> Option<MemRef> {
    match instr.memory_segment() {
        Register::DS | Register::ES | Register::SS | Register::CS => address(instr),
        _ => None,
    }
}

fn jcc_cond(code: Code) -> Option<Cond> {
    Some(match code {
        Code::Jo_rel8_32 | Code::Jo_rel32_32 => Cond::O,
        Code::Jno_rel8_32 | Code::Jno_rel32_32 => Cond::No,
        Code::Jb_rel8_32 | Code::Jb_rel32_32 => Cond::B,
        Code::Jae_rel8_32 | Code::Jae_rel32_32 => Cond::Ae,
        Code::Je_rel8_32 | Code::Je_rel32_32 => Cond::E,
        Code::Jne_rel8_32 | Code::Jne_rel32_32 => Cond::Ne,
        Code::Jbe_rel8_32 | Code::Jbe_rel32_32 => Cond::Be,
        Code::Ja_rel8_32 | Code::Ja_rel32_32 => Cond::A,
        Code::Js_rel8_32 | Code::Js_rel32_32 => Cond::S,
        Code::Jns_rel8_32 | Code::Jns_rel32_32 => Cond::Ns,
        Code::Jp_rel8_32 | Code::Jp_rel32_32 => Cond::P,
        Code::Jnp_rel8_32 | Code::Jnp_rel32_32 => Cond::Np,
        Code::Jl_rel8_32 | Code::Jl_rel32_32 => Cond::L,
        Code::Jge_rel8_32 | Code::Jge_rel32_32 => Cond::Ge,
        Code::Jle_rel8_32 | Code::Jle_rel32_32 => Cond::Le,
        Code::Jg_rel8_32 | Code::Jg_rel32_32 => Cond::G,
        _ => return None,
    })
}

/// Map a decoded instruction onto a compilable [`Op`]; `None` sends it to the interpreter.
fn classify(instr: &Instruction) -> Option<Op> {
    if instr.has_lock_prefix() || instr.has_rep_prefix() || instr.has_repne_prefix() {
        return None;
    }
    if let Some(cond) = jcc_cond(instr.code()) {
        return Some(Op::Jcc {
            cond,
            target: instr.near_branch32(),
        });
    }

    let op = match instr.code() {
        Code::Nopd | Code::Nop_rm32 => Op::Nop,
        Code::Mov_r32_imm32 => Op::MovImm {
            dst: reg_operand(instr, 0)?,
            imm: instr.immediate32(),
        },
        Code::Mov_rm32_imm32 => match instr.op0_kind() {
            OpKind::Register => Op::MovImm {
                dst: reg_operand(instr, 0)?,
                imm: instr.immediate32(),
            },
            _ => Op::Store {
                mem: mem_operand(instr)?,
                width: Width::U32,
                src: Src::Imm(instr.immediate32()),
            },
        },
        Code::Mov_rm16_imm16 if instr.op0_kind() == OpKind::Memory => Op::Store {
            mem: mem_operand(instr)?,
            width: Width::U16,
            src: Src::Imm(u32::from(instr.immediate16())),
        },
        Code::Mov_rm8_imm8 if instr.op0_kind() == OpKind::Memory => Op::Store {
            mem: mem_operand(instr)?,
            width: Width::U8,
            src: Src::Imm(u32::from(instr.immediate8())),
        },
        Code::Mov_r32_rm32 | Code::Mov_rm32_r32 => {
            match (instr.op0_kind(), instr.op1_kind()) {
                (OpKind::Register, OpKind::Register) => Op::MovReg {
                    dst: reg_operand(instr, 0)?,
                    src: reg_operand(instr, 1)?,
                },
                (OpKind::Register, OpKind::Memory) => Op::Load {
                    dst: reg_operand(instr, 0)?,
                    mem: mem_operand(instr)?,
                },
                (OpKind::Memory, OpKind::Register) => Op::Store {
                    mem: mem_operand(instr)?,
                    width: Width::U32,
                    src: Src::Reg(reg_off(reg_operand(instr, 1)?)),
                },
                _ => return None,
            }
        }
        Code::Mov_EAX_moffs32 => Op::Load {
            dst: Gpr::Eax,
            mem: mem_operand(instr)?,
        },
        Code::Mov_moffs32_EAX => Op::Store {
            mem: mem_operand(instr)?,
            width: Width::U32,
            src: Src::Reg(reg_off(Gpr::Eax)),
        },
        Code::Mov_rm16_r16 if instr.op0_kind() == OpKind::Memory => Op::Store {
            mem: mem_operand(instr)?,
            width: Width::U16,
            src: Src::Reg(reg_off(gpr16(instr.op1_register())?)),
        },
        Code::Mov_rm8_r8 if instr.op0_kind() == OpKind::Memory => Op::Store {
            mem: mem_operand(instr)?,
            width: Width::U8,
            src: Src::Reg(gpr8_off(instr.op1_register())?),
        },
        // LEA never touches memory, so its segment is irrelevant.
        Code::Lea_r32_m => Op::Lea {
            dst: reg_operand(instr, 0)?,
            mem: address(instr)?,
        },
        Code::Push_r32 => Op::Push(reg_operand(instr, 0)?),
        Code::Pop_r32 => Op::Pop(reg_operand(instr, 0)?),
        Code::Inc_r32 | Code::Inc_rm32 => Op::Unary {
            op: UnaryOp::Inc,
            reg: reg_operand(instr, 0)?,
        },
        Code::Dec_r32 | Code::Dec_rm32 => Op::Unary {
            op: UnaryOp::Dec,
            reg: reg_operand(instr, 0)?,
        },
        Code::Jmp_rel8_32 | Code::Jmp_rel32_32 => Op::Jmp(instr.near_branch32()),
        Code::Call_rel32_32 => Op::Call(instr.near_branch32()),
        Code::Retnd => Op::Ret,
        Code::Jmp_rm32 => Op::JmpReg(reg_operand(instr, 0)?),
        Code::Int_imm8 => Op::Int(instr.immediate8()),
        _ => return classify_alu(instr),
    };
    Some(op)
}

fn classify_alu(instr: &Instruction) -> Option<Op> {
    let op = match instr.mnemonic() {
        Mnemonic::Add => AluOp::Add,
        Mnemonic::Or => AluOp::Or,
        Mnemonic::And => AluOp::And,
        Mnemonic::Sub => AluOp::Sub,
        Mnemonic::Xor => AluOp::Xor,
        Mnemonic::Cmp => AluOp::Cmp,
        Mnemonic::Test => AluOp::Test,
        _ => return None,
    };
    if instr.op_count() != 2 {
        return None;
    }
    let dst = reg_operand(instr, 0)?;
    let src = match instr.op1_kind() {
        OpKind::Register => AluSrc::Reg(reg_operand(instr, 1)?),
        OpKind::Immediate32 | OpKind::Immediate8to32 => AluSrc::Imm(instr.immediate(1) as u32),
        _ => return None,
    };
    Some(Op::Alu { op, dst, src })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(bytes: &[u8]) -> Instruction {
        let mut decoder = Decoder::with_ip(32, bytes, 0x1000, DecoderOptions::NONE);
        decoder.decode()
    }

    fn op(bytes: &[u8]) -> Option<Op> {
        classify(&decode(bytes))
    }

    #[test]
    fn classifies_moves() {
        assert_eq!(
            op(&[0xB8, 0x78, 0x56, 0x34, 0x12]),
            Some(Op::MovImm {
                dst: Gpr::Eax,
                imm: 0x1234_5678
            })
        );
        assert_eq!(
            op(&[0x89, 0xD8]),
            Some(Op::MovReg {
                dst: Gpr::Eax,
                src: Gpr::Ebx
            })
        );
        // mov ecx, [esi + edi*4 + 8]
        assert_eq!(
            op(&[0x8B, 0x4C, 0xBE, 0x08]),
            Some(Op::Load {
                dst: Gpr::Ecx,
                mem: MemRef {
                    base: Some(Gpr::Esi),
                    index: Some((Gpr::Edi, 2)),
                    disp: 8
                }
            })
        );
        // mov byte [0x1008], 0x48
        assert_eq!(
            op(&[0xC6, 0x05, 0x08, 0x10, 0x00, 0x00, 0x48]),
            Some(Op::Store {
                mem: MemRef {
                    base: None,
                    index: None,
                    disp: 0x1008
                },
                width: Width::U8,
                src: Src::Imm(0x48)
            })
        );
        // mov [ebx], ah
        assert_eq!(
            op(&[0x88, 0x23]),
            Some(Op::Store {
                mem: MemRef {
                    base: Some(Gpr::Ebx),
                    index: None,
                    disp: 0
                },
                width: Width::U8,
                src: Src::Reg(1)
            })
        );
    }

    #[test]
    fn classifies_alu_forms() {
        assert_eq!(
            op(&[0x01, 0xC8]),
            Some(Op::Alu {
                op: AluOp::Add,
                dst: Gpr::Eax,
                src: AluSrc::Reg(Gpr::Ecx)
            })
        );
        // sub esp, -4 (sign-extended imm8)
        assert_eq!(
            op(&[0x83, 0xEC, 0xFC]),
            Some(Op::Alu {
                op: AluOp::Sub,
                dst: Gpr::Esp,
                src: AluSrc::Imm(0xFFFF_FFFC)
            })
        );
        assert_eq!(
            op(&[0x49]),
            Some(Op::Unary {
                op: UnaryOp::Dec,
                reg: Gpr::Ecx
            })
        );
        // add [eax], ecx: memory destination is not compiled.
        assert_eq!(op(&[0x01, 0x08]), None);
        // 16-bit register forms are not compiled.
        assert_eq!(op(&[0x66, 0x01, 0xC8]), None);
    }

    #[test]
    fn classifies_control_flow() {
        assert_eq!(op(&[0xEB, 0xFE]), Some(Op::Jmp(0x1000)));
        assert_eq!(
            op(&[0x75, 0xFB]),
            Some(Op::Jcc {
                cond: Cond::Ne,
                target: 0x0FFD
            })
        );
        assert_eq!(op(&[0xE8, 0x00, 0x10, 0x00, 0x00]), Some(Op::Call(0x2005)));
        assert_eq!(op(&[0xC3]), Some(Op::Ret));
        assert_eq!(op(&[0xFF, 0xE0]), Some(Op::JmpReg(Gpr::Eax)));
        assert_eq!(op(&[0xCD, 0x21]), Some(Op::Int(0x21)));
        // jecxz, hlt, far/indirect memory forms fall back.
        assert_eq!(op(&[0xE3, 0x00]), None);
        assert_eq!(op(&[0xF4]), None);
        assert_eq!(op(&[0xFF, 0x20]), None);
    }

    #[test]
    fn segment_overrides_fall_back() {
        // mov eax, fs:[0]
        assert_eq!(op(&[0x64, 0xA1, 0, 0, 0, 0]), None);
        assert_eq!(
            op(&[0xA1, 0, 0x20, 0, 0]),
            Some(Op::Load {
                dst: Gpr::Eax,
                mem: MemRef {
                    base: None,
                    index: None,
                    disp: 0x2000
                }
            })
        );
        // lea ignores the override.
        assert!(matches!(op(&[0x64, 0x8D, 0x43, 0x04]), Some(Op::Lea { .. })));
    }
}
