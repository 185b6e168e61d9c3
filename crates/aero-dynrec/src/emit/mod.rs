//! Host code emission interface.
//!
//! The translator talks to the host ISA exclusively through [`HostEmitter`]. An emitter owns no
//! buffer: every method appends to a [`CodeSink`] (the code cache while a block is open). Host
//! registers are named by role ([`HostReg`]); each target maps the roles onto its own registers
//! and keeps its encoding helpers private.

pub mod x64;

pub use x64::X64Emitter;

/// Why control left compiled code.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockReturn {
    /// Exit through a control transfer that cannot be linked (`ret`, indirect jumps).
    Normal = 0,
    /// The cycle budget was exhausted on block entry.
    Cycles = 1,
    /// An unlinked [`crate::LinkSlot::Link1`] exit reached its trampoline.
    Link1 = 2,
    /// An unlinked [`crate::LinkSlot::Link2`] exit reached its trampoline.
    Link2 = 3,
    /// The next instruction must be executed by the interpreter.
    Opcode = 4,
    /// `int imm8`; the vector is left in the context.
    CallBack = 5,
    /// A store from the running block invalidated that block.
    SmcBlock = 6,
}

impl BlockReturn {
    pub const fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::Normal,
            1 => Self::Cycles,
            2 => Self::Link1,
            3 => Self::Link2,
            4 => Self::Opcode,
            5 => Self::CallBack,
            6 => Self::SmcBlock,
            _ => return None,
        })
    }
}

/// Host register roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostReg {
    /// Function return value and general accumulator.
    RetOp,
    Op1,
    Op2,
    /// Effective address of a guest memory access.
    Addr,
    Temp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    U8,
    U16,
    U32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AluOp {
    Add,
    Or,
    And,
    Sub,
    Xor,
    Cmp,
    Test,
}

impl AluOp {
    /// `Cmp` and `Test` only produce flags.
    pub const fn writes_result(self) -> bool {
        !matches!(self, AluOp::Cmp | AluOp::Test)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Inc,
    Dec,
}

/// x86 condition codes in encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cond {
    O = 0x0,
    No = 0x1,
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    S = 0x8,
    Ns = 0x9,
    P = 0xA,
    Np = 0xB,
    L = 0xC,
    Ge = 0xD,
    Le = 0xE,
    G = 0xF,
}

/// Branch condition for [`HostEmitter::create_branch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BranchCond {
    Always,
    NonZero(HostReg),
    /// Signed `reg <= 0`.
    LessEqualZero(HostReg),
    /// Guest condition evaluated on guest flags previously restored with
    /// [`HostEmitter::load_flags`].
    Guest(Cond),
}

/// Patch site of a forward branch created by [`HostEmitter::create_branch`].
#[must_use = "an unfilled branch jumps to garbage"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchToken {
    pub(crate) at: usize,
}

/// Byte sink that host code is appended to.
pub trait CodeSink {
    /// Offset of the next byte.
    fn pos(&self) -> usize;

    /// Host address of the byte at `pos`.
    fn host_addr(&self, pos: usize) -> usize;

    fn add_u8(&mut self, value: u8);

    fn add_u16(&mut self, value: u16) {
        for b in value.to_le_bytes() {
            self.add_u8(b);
        }
    }

    fn add_u32(&mut self, value: u32) {
        for b in value.to_le_bytes() {
            self.add_u8(b);
        }
    }

    fn add_u64(&mut self, value: u64) {
        for b in value.to_le_bytes() {
            self.add_u8(b);
        }
    }

    /// Overwrite four previously emitted bytes at `at`.
    fn patch_u32(&mut self, at: usize, value: u32);
}

/// Code generation interface of one host instruction set.
///
/// Context offsets are relative to the [`crate::DynContext`] that [`HostEmitter::run_code`]
/// installs in a dedicated host register for the whole run.
pub trait HostEmitter {
    /// Entry stub: `fn(code: *const u8, ctx: *mut DynContext) -> u32`. Saves the host's
    /// callee-saved registers, installs `ctx`, calls `code` and returns its return code.
    fn run_code(&self, out: &mut dyn CodeSink);

    /// Leave compiled code with `code`.
    fn return_with(&self, out: &mut dyn CodeSink, code: BlockReturn);

    fn mov_regs(&self, out: &mut dyn CodeSink, dst: HostReg, src: HostReg);
    fn mov_imm(&self, out: &mut dyn CodeSink, dst: HostReg, imm: u32);

    /// Zero-extending load from the context.
    fn load_ctx(&self, out: &mut dyn CodeSink, dst: HostReg, offset: u32, width: Width);
    fn store_ctx(&self, out: &mut dyn CodeSink, src: HostReg, offset: u32, width: Width);
    fn store_ctx_imm(&self, out: &mut dyn CodeSink, offset: u32, imm: u32);
    fn sub_ctx_imm(&self, out: &mut dyn CodeSink, offset: u32, imm: u32);

    fn alu(&self, out: &mut dyn CodeSink, op: AluOp, dst: HostReg, src: HostReg);
    fn alu_imm(&self, out: &mut dyn CodeSink, op: AluOp, dst: HostReg, imm: u32);
    fn unary(&self, out: &mut dyn CodeSink, op: UnaryOp, reg: HostReg);
    fn shl_imm(&self, out: &mut dyn CodeSink, reg: HostReg, amount: u8);

    /// Merge the host arithmetic flags into the guest flags word at `offset`.
    fn save_flags(&self, out: &mut dyn CodeSink, offset: u32);
    /// Load the guest arithmetic flags at `offset` into the host flags.
    fn load_flags(&self, out: &mut dyn CodeSink, offset: u32);

    /// Load integer parameter `param` of the next call from a register.
    fn load_param_reg(&self, out: &mut dyn CodeSink, param: usize, src: HostReg);
    fn load_param_imm(&self, out: &mut dyn CodeSink, param: usize, imm: u32);
    /// Load integer parameter `param` with the pointer-sized context field at `offset`.
    fn load_param_ctx_ptr(&self, out: &mut dyn CodeSink, param: usize, offset: u32);

    /// Call a host function; direct when in range, through a register otherwise. The result
    /// is left in [`HostReg::RetOp`]; every role register is clobbered.
    fn call_function(&self, out: &mut dyn CodeSink, target: usize);

    fn create_branch(&self, out: &mut dyn CodeSink, cond: BranchCond) -> BranchToken;
    /// Point `token` at the current position.
    fn fill_branch(&self, out: &mut dyn CodeSink, token: BranchToken);

    /// Jump to the host address stored at `slot_addr`.
    fn jmp_slot(&self, out: &mut dyn CodeSink, slot_addr: usize);
}
