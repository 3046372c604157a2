// src/arch/x86_64/paging.rs
//! Hardware page table on real x86_64 paging structures
//!
//! Implements the [`PageTable`] service trait over an `OffsetPageTable`
//! from the `x86_64` crate. Intermediate page-table pages come from an
//! injected frame pool; physical addresses are derived from the pool's
//! kernel addresses through the physical-memory offset.

use alloc::boxed::Box;

use x86_64::PhysAddr;
use x86_64::VirtAddr as X64VirtAddr;
use x86_64::structures::paging::mapper::TranslateResult;
use x86_64::structures::paging::{
    FrameAllocator, Mapper, OffsetPageTable, Page, PageTable as Pml4Table, PageTableFlags,
    PhysFrame, Size4KiB, Translate,
};

use crate::kernel::core::traits::{FramePool, PageTable};
use crate::kernel::mm::VirtAddr;

/// Allocates page-table pages from the injected pool, translating the
/// pool's kernel addresses into physical frames.
struct TableAllocator {
    pool: Box<dyn FramePool>,
    phys_offset: u64,
}

unsafe impl FrameAllocator<Size4KiB> for TableAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        let kva = self.pool.alloc_user_page(true)?;
        let phys = PhysAddr::new(kva.as_u64() - self.phys_offset);
        PhysFrame::from_start_address(phys).ok()
    }
}

/// One user process's hardware page table
pub struct KernelPageTable {
    mapper: OffsetPageTable<'static>,
    tables: TableAllocator,
}

impl KernelPageTable {
    /// Wrap a level-4 table.
    ///
    /// # Safety
    ///
    /// `l4_table` must be the process's live PML4, `phys_offset` must be
    /// the offset at which all physical memory is mapped, and `pool` must
    /// hand out frames that stay mapped at that offset.
    pub unsafe fn new(
        l4_table: &'static mut Pml4Table,
        phys_offset: X64VirtAddr,
        pool: Box<dyn FramePool>,
    ) -> Self {
        Self {
            mapper: unsafe { OffsetPageTable::new(l4_table, phys_offset) },
            tables: TableAllocator {
                pool,
                phys_offset: phys_offset.as_u64(),
            },
        }
    }

    fn flags_at(&self, va: VirtAddr) -> Option<PageTableFlags> {
        match self.mapper.translate(X64VirtAddr::new(va.as_u64())) {
            TranslateResult::Mapped { flags, .. } => Some(flags),
            _ => None,
        }
    }

    fn update_flags(&mut self, va: VirtAddr, set: PageTableFlags, on: bool) {
        let Some(mut flags) = self.flags_at(va) else {
            return;
        };
        flags.set(set, on);
        let page = Page::<Size4KiB>::containing_address(X64VirtAddr::new(va.as_u64()));
        // Safety: only the accessed/dirty bits of an existing mapping
        // change; the frame and permissions stay intact.
        if let Ok(flush) = unsafe { self.mapper.update_flags(page, flags) } {
            finish(flush);
        }
    }
}

impl PageTable for KernelPageTable {
    fn map(&mut self, va: VirtAddr, kva: VirtAddr, writable: bool) -> bool {
        let page = Page::<Size4KiB>::containing_address(X64VirtAddr::new(va.as_u64()));
        let phys = PhysAddr::new(kva.as_u64() - self.tables.phys_offset);
        let Ok(frame) = PhysFrame::from_start_address(phys) else {
            return false;
        };

        let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
        if writable {
            flags |= PageTableFlags::WRITABLE;
        }

        // Safety: the claim path guarantees the frame is exclusively
        // owned by the page being mapped.
        match unsafe { self.mapper.map_to(page, frame, flags, &mut self.tables) } {
            Ok(flush) => {
                finish(flush);
                true
            }
            Err(_) => false,
        }
    }

    fn unmap(&mut self, va: VirtAddr) {
        let page = Page::<Size4KiB>::containing_address(X64VirtAddr::new(va.as_u64()));
        if let Ok((_frame, flush)) = self.mapper.unmap(page) {
            finish(flush);
        }
    }

    fn is_mapped(&self, va: VirtAddr) -> bool {
        self.flags_at(va).is_some()
    }

    fn is_accessed(&self, va: VirtAddr) -> bool {
        self.flags_at(va)
            .map(|f| f.contains(PageTableFlags::ACCESSED))
            .unwrap_or(false)
    }

    fn set_accessed(&mut self, va: VirtAddr, accessed: bool) {
        self.update_flags(va, PageTableFlags::ACCESSED, accessed);
    }

    fn is_dirty(&self, va: VirtAddr) -> bool {
        self.flags_at(va)
            .map(|f| f.contains(PageTableFlags::DIRTY))
            .unwrap_or(false)
    }

    fn set_dirty(&mut self, va: VirtAddr, dirty: bool) {
        self.update_flags(va, PageTableFlags::DIRTY, dirty);
    }
}

/// Flush the TLB entry on real hardware; host-side tests have no TLB.
#[cfg(target_os = "none")]
fn finish(flush: x86_64::structures::paging::mapper::MapperFlush<Size4KiB>) {
    flush.flush();
}

#[cfg(not(target_os = "none"))]
fn finish(flush: x86_64::structures::paging::mapper::MapperFlush<Size4KiB>) {
    flush.ignore();
}
