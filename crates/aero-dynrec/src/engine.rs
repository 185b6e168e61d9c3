//! [`JitEngine`]: the single owner of the code cache, code pages, guest memory and CPU context,
//! and the dispatch loop that drives them.

use tracing::{debug, trace, warn};

use crate::block::{CacheBlock, CacheBlockId, LinkSlot};
use crate::cache::{CodeCache, DynrecStats};
use crate::config::DynrecConfig;
use crate::context::{CpuState, DynContext, RUNNING_NONE};
use crate::emit::{BlockReturn, X64Emitter};
use crate::error::{fatal, DynrecError, FatalError};
use crate::memory::{GuestBus, GuestMemory, PageFlags};
use crate::page::{CodePages, WriteOutcome};
use crate::translate::{self, HelperTable, Limits};
use crate::{PAGE_OFFSET_MASK, PAGE_SHIFT};

/// Result of one interpreter step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    /// The CPU stopped (e.g. `hlt`).
    Halt,
}

/// The fallback CPU core. Executes exactly one guest instruction per call.
pub trait Interpreter {
    fn step(&mut self, cpu: &mut CpuState, bus: &mut dyn GuestBus) -> StepOutcome;
}

/// Why [`JitEngine::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    CyclesExhausted,
    Halted,
    /// `int imm8`; `eip` is past the instruction.
    Interrupt(u8),
}

/// [`GuestBus`] whose writes keep the code cache coherent.
#[derive(Debug)]
pub struct CodeBus<'a> {
    cache: &'a mut CodeCache,
    pages: &'a mut CodePages,
    mem: &'a mut GuestMemory,
}

impl CodeBus<'_> {
    fn write(&mut self, addr: u32, len: usize, value: u32) {
        self.pages.write(self.mem, self.cache, addr, len, value, None);
    }
}

impl GuestBus for CodeBus<'_> {
    fn read_u8(&self, addr: u32) -> u8 {
        self.mem.read_u8(addr)
    }

    fn write_u8(&mut self, addr: u32, value: u8) {
        self.write(addr, 1, u32::from(value));
    }

    fn write_u16(&mut self, addr: u32, value: u16) {
        self.write(addr, 2, u32::from(value));
    }

    fn write_u32(&mut self, addr: u32, value: u32) {
        self.write(addr, 4, value);
    }
}

/// Dynamic recompiler for one guest CPU.
#[derive(Debug)]
pub struct JitEngine {
    config: DynrecConfig,
    emitter: X64Emitter,
    cache: CodeCache,
    pages: CodePages,
    mem: GuestMemory,
    /// Boxed so compiled code can hold its address across engine moves between runs.
    ctx: Box<DynContext>,
    helpers: HelperTable,
}

impl JitEngine {
    pub fn new(config: DynrecConfig, mem: GuestMemory) -> Result<Self, DynrecError> {
        config.validate()?;
        let emitter = X64Emitter::new();
        let cache = CodeCache::new(&config, &emitter)?;
        let pages = CodePages::new(config.code_pages, config.page_release_delay);

        #[cfg(target_arch = "x86_64")]
        let helpers = crate::helpers::table();
        #[cfg(not(target_arch = "x86_64"))]
        let helpers = HelperTable::default();

        Ok(Self {
            config,
            emitter,
            cache,
            pages,
            mem,
            ctx: Box::default(),
            helpers,
        })
    }

    pub fn config(&self) -> &DynrecConfig {
        &self.config
    }

    pub fn cpu(&self) -> &CpuState {
        &self.ctx.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut CpuState {
        &mut self.ctx.cpu
    }

    pub fn context(&self) -> &DynContext {
        &self.ctx
    }

    /// Remaining cycle budget.
    pub fn cycles(&self) -> i32 {
        self.ctx.cycles
    }

    pub fn set_cycles(&mut self, cycles: i32) {
        self.ctx.cycles = cycles;
    }

    pub fn memory(&self) -> &GuestMemory {
        &self.mem
    }

    pub fn cache(&self) -> &CodeCache {
        &self.cache
    }

    pub fn code_pages(&self) -> &CodePages {
        &self.pages
    }

    pub fn block(&self, id: CacheBlockId) -> &CacheBlock {
        self.cache.block(id)
    }

    pub fn stats(&self) -> DynrecStats {
        *self.cache.stats()
    }

    /// A bus for the interpreter or device models; writes are routed through the code pages.
    pub fn bus(&mut self) -> CodeBus<'_> {
        CodeBus {
            cache: &mut self.cache,
            pages: &mut self.pages,
            mem: &mut self.mem,
        }
    }

    /// Block currently executing, if a native call is in progress.
    pub fn running(&self) -> Option<CacheBlockId> {
        (self.ctx.running != RUNNING_NONE).then(|| CacheBlockId::from_raw(self.ctx.running))
    }

    /// Live block starting exactly at `addr`.
    pub fn find_block(&self, addr: u32) -> Option<CacheBlockId> {
        self.pages.find_cache_block(&self.mem, &self.cache, addr)
    }

    /// Compiled block for `eip`, translating it if needed.
    ///
    /// `None` means the instruction at `eip` must be interpreted: the address is outside guest
    /// memory, its page is flagged no-code, or it has been rewritten too often.
    pub fn compile_or_fetch(&mut self, eip: u32) -> Option<CacheBlockId> {
        let page = eip >> PAGE_SHIFT;
        if !self.mem.contains(eip) {
            warn!(eip = format_args!("{eip:#x}"), "eip outside guest memory; interpreting");
            return None;
        }
        if self.mem.flags(page).contains(PageFlags::NO_CODE) {
            trace!(eip = format_args!("{eip:#x}"), "no-code page; interpreting");
            return None;
        }
        let offset = eip & PAGE_OFFSET_MASK;

        if let Some(code_page) = self.mem.code_page(page) {
            let handler = self.pages.handler(code_page);
            if let Some(id) = handler.find_cache_block(&self.cache, offset as u16) {
                self.cache.stats_mut().cache_hits += 1;
                trace!(block = %id, eip = format_args!("{eip:#x}"), "cache hit");
                return Some(id);
            }
            if handler.invalidation_count(offset) >= self.config.smc_threshold {
                trace!(eip = format_args!("{eip:#x}"), "rewritten too often; interpreting");
                return None;
            }
        }

        let code_page = self
            .pages
            .make_code_page(&mut self.mem, &mut self.cache, page)?;
        let limits = Limits {
            max_instructions: self.config.max_instructions,
            max_block_bytes: self.config.max_block_bytes,
        };
        Some(translate::translate(
            &self.emitter,
            &mut self.cache,
            &mut self.pages,
            &self.mem,
            code_page,
            &self.helpers,
            limits,
            eip,
        ))
    }

    /// Run compiled code starting at block `id` until it returns to the dispatcher.
    ///
    /// `id` is recorded as running for the duration of the call; linked successors update it
    /// as they are entered.
    pub fn execute(&mut self, id: CacheBlockId) -> BlockReturn {
        self.execute_block(id).0
    }

    /// Returns the exit code and the last block entered.
    fn execute_block(&mut self, id: CacheBlockId) -> (BlockReturn, CacheBlockId) {
        if id.is_trampoline() || !self.cache.block(id).is_live() {
            fatal(FatalError::ArenaCorrupted("executing a block that is not compiled"));
        }
        self.ctx.running = id.raw();
        let raw = self.call_native(id);
        let last = CacheBlockId::from_raw(self.ctx.running);
        self.ctx.running = RUNNING_NONE;

        let ret =
            BlockReturn::from_raw(raw).unwrap_or_else(|| fatal(FatalError::InvalidReturnCode(raw)));
        (ret, last)
    }

    #[cfg(target_arch = "x86_64")]
    fn call_native(&mut self, id: CacheBlockId) -> u32 {
        type RunCode = unsafe extern "sysv64" fn(*const u8, *mut DynContext) -> u32;

        let entry = self.cache.entry_addr(id) as *const u8;
        // SAFETY: the address is the `run_code` stub emitted into the executable arena when the
        // cache was created; it has exactly this signature.
        let run_code = unsafe { core::mem::transmute::<usize, RunCode>(self.cache.run_code_addr()) };

        let engine: *mut JitEngine = self;
        // SAFETY: compiled code only touches the context and calls back into the engine through
        // `engine`; nothing else uses `self` until the call returns.
        unsafe {
            let ctx: *mut DynContext = &mut *(*engine).ctx;
            (*ctx).engine = engine as u64;
            let raw = run_code(entry, ctx);
            (*ctx).engine = 0;
            raw
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn call_native(&mut self, _id: CacheBlockId) -> u32 {
        fatal(FatalError::UnsupportedHost)
    }

    /// Run for `cycles` guest instructions (approximately: blocks are charged on exit).
    pub fn run(&mut self, interp: &mut dyn Interpreter, cycles: i32) -> RunExit {
        self.ctx.cycles = cycles;
        // Exit slot to link once its successor is known, with the block's generation at exit.
        let mut pending_link: Option<(CacheBlockId, LinkSlot, u32)> = None;

        loop {
            if self.ctx.cycles <= 0 {
                return RunExit::CyclesExhausted;
            }
            let Some(id) = self.compile_or_fetch(self.ctx.cpu.eip) else {
                pending_link = None;
                if self.interpret(interp) == StepOutcome::Halt {
                    return RunExit::Halted;
                }
                continue;
            };

            if let Some((from, slot, generation)) = pending_link.take() {
                // Translating `id` may have evicted or recompiled the predecessor.
                let block = self.cache.block(from);
                if block.is_live() && block.generation() == generation {
                    self.cache.link(from, slot, id);
                }
            }

            let (ret, last) = self.execute_block(id);
            match ret {
                BlockReturn::Normal | BlockReturn::Cycles | BlockReturn::SmcBlock => {}
                BlockReturn::Link1 | BlockReturn::Link2 => {
                    let slot = if ret == BlockReturn::Link1 {
                        LinkSlot::Link1
                    } else {
                        LinkSlot::Link2
                    };
                    pending_link = Some((last, slot, self.cache.block(last).generation()));
                }
                BlockReturn::Opcode => {
                    if self.interpret(interp) == StepOutcome::Halt {
                        return RunExit::Halted;
                    }
                }
                BlockReturn::CallBack => return RunExit::Interrupt(self.ctx.callback as u8),
            }
        }
    }

    fn interpret(&mut self, interp: &mut dyn Interpreter) -> StepOutcome {
        let mut bus = CodeBus {
            cache: &mut self.cache,
            pages: &mut self.pages,
            mem: &mut self.mem,
        };
        let outcome = interp.step(&mut self.ctx.cpu, &mut bus);
        self.ctx.cycles -= 1;
        self.cache.stats_mut().interpreter_steps += 1;
        outcome
    }

    pub fn link(&mut self, from: CacheBlockId, slot: LinkSlot, to: CacheBlockId) {
        self.cache.link(from, slot, to);
    }

    /// Tear down one compiled block, unlinking it in both directions.
    pub fn reset_block(&mut self, id: CacheBlockId) {
        self.cache.reset(&mut self.pages, id);
    }

    /// Invalidate compiled code overlapping the guest range `[start, end]`. Returns the number
    /// of blocks invalidated.
    pub fn invalidate_range(&mut self, start: u32, end: u32) -> usize {
        let running = self.running();
        self.pages
            .invalidate_range(&self.mem, &mut self.cache, start, end, running)
            .0
    }

    /// Discard all compiled code.
    pub fn flush(&mut self) {
        self.pages.clear_all(&mut self.mem, &mut self.cache);
        debug!("flushed code cache");
    }

    /// Load a saved CPU state. Compiled code is discarded at every restore boundary.
    pub fn restore_cpu(&mut self, state: CpuState) {
        self.flush();
        self.ctx.cpu = state;
    }

    /// Write guest bytes, invalidating overlapping compiled code.
    pub fn load_image(&mut self, addr: u32, bytes: &[u8]) {
        for (i, &b) in bytes.iter().enumerate() {
            self.write_u8(addr.wrapping_add(i as u32), b);
        }
    }

    pub fn read_u8(&self, addr: u32) -> u8 {
        self.mem.read_u8(addr)
    }

    pub fn read_u16(&self, addr: u32) -> u16 {
        self.mem.read_u16(addr)
    }

    pub fn read_u32(&self, addr: u32) -> u32 {
        self.mem.read_u32(addr)
    }

    fn write(&mut self, addr: u32, len: usize, value: u32) -> WriteOutcome {
        let running = self.running();
        self.pages
            .write(&mut self.mem, &mut self.cache, addr, len, value, running)
    }

    pub fn write_u8(&mut self, addr: u32, value: u8) -> WriteOutcome {
        self.write(addr, 1, u32::from(value))
    }

    pub fn write_u16(&mut self, addr: u32, value: u16) -> WriteOutcome {
        self.write(addr, 2, u32::from(value))
    }

    pub fn write_u32(&mut self, addr: u32, value: u32) -> WriteOutcome {
        self.write(addr, 4, value)
    }

    /// Write and report whether the running block was invalidated.
    pub fn write_u8_checked(&mut self, addr: u32, value: u8) -> bool {
        self.write_u8(addr, value).hit_running()
    }

    pub fn write_u16_checked(&mut self, addr: u32, value: u16) -> bool {
        self.write_u16(addr, value).hit_running()
    }

    pub fn write_u32_checked(&mut self, addr: u32, value: u32) -> bool {
        self.write_u32(addr, value).hit_running()
    }

    /// Audit arena, link and code page bookkeeping.
    pub fn check_invariants(&self) -> Result<(), FatalError> {
        self.cache.check_arena()?;
        self.cache.check_links()?;
        self.pages.check_write_maps(&self.cache)
    }
}
