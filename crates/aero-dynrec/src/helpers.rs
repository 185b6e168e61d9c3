//! Guest memory helpers called from compiled code.
//!
//! Compiled blocks pass the engine pointer from [`crate::DynContext::engine`] as the first
//! argument. The pointer is only valid while [`JitEngine::execute`] is on the stack.

use crate::engine::JitEngine;
use crate::error::{fatal, FatalError};
use crate::translate::HelperTable;

fn engine<'a>(engine_ptr: *mut JitEngine) -> &'a mut JitEngine {
    if engine_ptr.is_null() {
        fatal(FatalError::ArenaCorrupted("compiled code called a helper without an engine"));
    }
    // SAFETY: `execute` installs a pointer to the engine it was called on and does not touch the
    // engine through any other path until the native call returns.
    unsafe { &mut *engine_ptr }
}

extern "sysv64" fn read_u32(engine_ptr: *mut JitEngine, addr: u32) -> u32 {
    engine(engine_ptr).read_u32(addr)
}

extern "sysv64" fn write_u8(engine_ptr: *mut JitEngine, addr: u32, value: u32) -> u32 {
    u32::from(engine(engine_ptr).write_u8_checked(addr, value as u8))
}

extern "sysv64" fn write_u16(engine_ptr: *mut JitEngine, addr: u32, value: u32) -> u32 {
    u32::from(engine(engine_ptr).write_u16_checked(addr, value as u16))
}

extern "sysv64" fn write_u32(engine_ptr: *mut JitEngine, addr: u32, value: u32) -> u32 {
    u32::from(engine(engine_ptr).write_u32_checked(addr, value))
}

pub(crate) fn table() -> HelperTable {
    HelperTable {
        read_u32: read_u32 as *const () as usize,
        write_u8: write_u8 as *const () as usize,
        write_u16: write_u16 as *const () as usize,
        write_u32: write_u32 as *const () as usize,
    }
}
