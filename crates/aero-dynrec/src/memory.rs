//! Flat guest memory with per-page attributes.
//!
//! Guest linear addresses map 1:1 onto a RAM buffer. Each 4KiB page carries [`PageFlags`] and,
//! while compiled code exists for it, the id of the [`crate::CodePageHandler`] that intercepts
//! its writes. [`GuestMemory`] itself never intercepts anything: writes that must keep the code
//! cache coherent go through [`crate::JitEngine`] or its [`crate::CodeBus`].

use bitflags::bitflags;

use crate::error::DynrecError;
use crate::page::CodePageId;
use crate::{PAGE_SHIFT, PAGE_SIZE};

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct PageFlags: u32 {
        const READABLE = 1 << 0;
        const WRITEABLE = 1 << 1;
        /// A code page handler is installed; writes must be routed through it.
        const HAS_CODE = 1 << 2;
        /// Never compile code from this page.
        const NO_CODE = 1 << 3;
        /// Writes are silently dropped.
        const HAS_ROM = 1 << 4;
    }
}

impl Default for PageFlags {
    fn default() -> Self {
        PageFlags::READABLE | PageFlags::WRITEABLE
    }
}

/// Byte-addressable view of guest memory used by the interpreter.
pub trait GuestBus {
    fn read_u8(&self, addr: u32) -> u8;
    fn write_u8(&mut self, addr: u32, value: u8);

    #[must_use]
    fn read_u16(&self, addr: u32) -> u16 {
        u16::from_le_bytes([self.read_u8(addr), self.read_u8(addr.wrapping_add(1))])
    }

    #[must_use]
    fn read_u32(&self, addr: u32) -> u32 {
        let mut bytes = [0u8; 4];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = self.read_u8(addr.wrapping_add(i as u32));
        }
        u32::from_le_bytes(bytes)
    }

    fn write_u16(&mut self, addr: u32, value: u16) {
        for (i, b) in value.to_le_bytes().into_iter().enumerate() {
            self.write_u8(addr.wrapping_add(i as u32), b);
        }
    }

    fn write_u32(&mut self, addr: u32, value: u32) {
        for (i, b) in value.to_le_bytes().into_iter().enumerate() {
            self.write_u8(addr.wrapping_add(i as u32), b);
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct PageEntry {
    flags: PageFlags,
    code_page: Option<CodePageId>,
}

/// Guest RAM. Reads outside the buffer return `0xFF` (open bus); writes outside it are dropped.
#[derive(Debug, Clone)]
pub struct GuestMemory {
    ram: Vec<u8>,
    pages: Vec<PageEntry>,
}

impl GuestMemory {
    pub fn new(size: usize) -> Result<Self, DynrecError> {
        if size == 0 || size % PAGE_SIZE != 0 || u32::try_from(size - 1).is_err() {
            return Err(DynrecError::GuestMemorySize(size));
        }
        Ok(Self {
            ram: vec![0; size],
            pages: vec![PageEntry::default(); size / PAGE_SIZE],
        })
    }

    pub fn len(&self) -> usize {
        self.ram.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ram.is_empty()
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn contains(&self, addr: u32) -> bool {
        (addr as usize) < self.ram.len()
    }

    /// Flags of `page`, or empty flags for a page outside guest memory.
    pub fn flags(&self, page: u32) -> PageFlags {
        self.pages
            .get(page as usize)
            .map_or(PageFlags::empty(), |p| p.flags)
    }

    pub fn code_page(&self, page: u32) -> Option<CodePageId> {
        self.pages.get(page as usize).and_then(|p| p.code_page)
    }

    /// Mark `page` read-only. Writes to it are ignored from then on.
    pub fn set_rom(&mut self, page: u32, rom: bool) {
        if let Some(entry) = self.pages.get_mut(page as usize) {
            entry.flags.set(PageFlags::HAS_ROM, rom);
            entry.flags.set(PageFlags::WRITEABLE, !rom);
        }
    }

    /// Exclude `page` from compilation; code on it always runs in the interpreter.
    pub fn set_no_code(&mut self, page: u32, no_code: bool) {
        if let Some(entry) = self.pages.get_mut(page as usize) {
            entry.flags.set(PageFlags::NO_CODE, no_code);
        }
    }

    pub(crate) fn attach_code_page(&mut self, page: u32, id: CodePageId) {
        if let Some(entry) = self.pages.get_mut(page as usize) {
            entry.code_page = Some(id);
            entry.flags.insert(PageFlags::HAS_CODE);
        }
    }

    pub(crate) fn detach_code_page(&mut self, page: u32) {
        if let Some(entry) = self.pages.get_mut(page as usize) {
            entry.code_page = None;
            entry.flags.remove(PageFlags::HAS_CODE);
        }
    }

    /// The 4KiB backing bytes of `page`.
    pub fn page_bytes(&self, page: u32) -> Option<&[u8]> {
        let start = (page as usize).checked_mul(PAGE_SIZE)?;
        self.ram.get(start..start + PAGE_SIZE)
    }

    /// Copy `bytes` into RAM at `addr`, bypassing page flags and code page handlers.
    ///
    /// Only for populating memory before any code has been compiled from it; use
    /// [`crate::JitEngine::load_image`] afterwards.
    pub fn load(&mut self, addr: u32, bytes: &[u8]) {
        let start = addr as usize;
        let end = start.saturating_add(bytes.len()).min(self.ram.len());
        if start < end {
            self.ram[start..end].copy_from_slice(&bytes[..end - start]);
        }
    }

    /// Read `len <= 4` bytes little-endian.
    pub(crate) fn read_sized(&self, addr: u32, len: usize) -> u32 {
        (0..len).fold(0u32, |acc, i| {
            acc | (u32::from(self.read_u8(addr.wrapping_add(i as u32))) << (8 * i))
        })
    }

    /// Store without consulting page flags or handlers.
    pub(crate) fn store_u8(&mut self, addr: u32, value: u8) {
        if let Some(b) = self.ram.get_mut(addr as usize) {
            *b = value;
        }
    }

    pub(crate) fn page_of(addr: u32) -> u32 {
        addr >> PAGE_SHIFT
    }
}

impl GuestBus for GuestMemory {
    fn read_u8(&self, addr: u32) -> u8 {
        self.ram.get(addr as usize).copied().unwrap_or(0xFF)
    }

    fn write_u8(&mut self, addr: u32, value: u8) {
        if self.flags(Self::page_of(addr)).contains(PageFlags::HAS_ROM) {
            return;
        }
        self.store_u8(addr, value);
    }
}
