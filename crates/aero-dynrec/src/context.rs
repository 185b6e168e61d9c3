//! Guest register file and the context block compiled code runs against.
//!
//! Compiled blocks address [`DynContext`] through a host base register using the `CTX_*_OFF`
//! constants below; `tests/abi.rs` pins them to the real field offsets.

/// General purpose registers in x86 encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gpr {
    Eax = 0,
    Ecx = 1,
    Edx = 2,
    Ebx = 3,
    Esp = 4,
    Ebp = 5,
    Esi = 6,
    Edi = 7,
}

impl Gpr {
    pub const ALL: [Gpr; 8] = [
        Gpr::Eax,
        Gpr::Ecx,
        Gpr::Edx,
        Gpr::Ebx,
        Gpr::Esp,
        Gpr::Ebp,
        Gpr::Esi,
        Gpr::Edi,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Architectural state of the 32-bit guest CPU.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuState {
    pub regs: [u32; 8],
    pub eip: u32,
    pub eflags: u32,
}

impl Default for CpuState {
    fn default() -> Self {
        Self {
            regs: [0; 8],
            eip: 0,
            // Bit 1 of EFLAGS always reads as set.
            eflags: 0x2,
        }
    }
}

impl CpuState {
    pub fn reg(&self, gpr: Gpr) -> u32 {
        self.regs[gpr.index()]
    }

    pub fn set_reg(&mut self, gpr: Gpr, value: u32) {
        self.regs[gpr.index()] = value;
    }
}

/// Sentinel stored in [`DynContext::running`] while no block has been entered.
pub const RUNNING_NONE: u32 = u32::MAX;

/// State shared between the dispatch loop and compiled code.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct DynContext {
    pub cpu: CpuState,
    /// Remaining cycle budget; blocks subtract their instruction count on exit.
    pub cycles: i32,
    /// Raw id of the last block entered, written by every block prologue.
    pub running: u32,
    /// Vector of the last `int imm8` that left compiled code.
    pub callback: u32,
    pub reserved: u32,
    /// Address of the owning engine, installed for the duration of a native call.
    pub engine: u64,
}

impl Default for DynContext {
    fn default() -> Self {
        Self {
            cpu: CpuState::default(),
            cycles: 0,
            running: RUNNING_NONE,
            callback: 0,
            reserved: 0,
            engine: 0,
        }
    }
}

pub const CTX_REGS_OFF: u32 = 0;
pub const CTX_EIP_OFF: u32 = 32;
pub const CTX_EFLAGS_OFF: u32 = 36;
pub const CTX_CYCLES_OFF: u32 = 40;
pub const CTX_RUNNING_OFF: u32 = 44;
pub const CTX_CALLBACK_OFF: u32 = 48;
pub const CTX_ENGINE_OFF: u32 = 56;
pub const CTX_SIZE: u32 = 64;

/// Context offset of the 32-bit register slot.
pub const fn reg_off(gpr: Gpr) -> u32 {
    CTX_REGS_OFF + 4 * gpr as u32
}

/// Context offset of an 8-bit register (`AL..BL`, or `AH..BH` when `high`).
pub const fn reg8_off(gpr: Gpr, high: bool) -> u32 {
    reg_off(gpr) + high as u32
}

const _: () = {
    assert!(core::mem::size_of::<CpuState>() == 40);
    assert!(core::mem::size_of::<DynContext>() == CTX_SIZE as usize);
    // The engine pointer is loaded with a 64-bit move.
    assert!(CTX_ENGINE_OFF % 8 == 0);
};
