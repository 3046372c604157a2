// src/kernel/vm/mod.rs
//! Virtual memory service
//!
//! Owns the process-global state of the subsystem (frame table, swap
//! table, frame pool, the shared filesystem lock) plus every process's
//! supplemental page table, and implements the page lifecycle: lazy
//! allocation, the claim path, fault handling with stack growth, eviction
//! hooks, duplication on fork and teardown on exit.
//!
//! The kernel installs one `Vm` behind the [`VM`] global via [`init`];
//! tests construct `Vm` directly with simulated services.

pub mod anon;
pub mod file;
pub mod page;
pub mod spt;
pub mod uninit;

#[cfg(test)]
mod tests;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::constants::{STACK_MAX, STACK_SLACK, USER_STACK, is_user_addr};
use crate::debug_println;
use crate::errors::{FrameError, SptError, VmError, VmResult};
use crate::kernel::core::traits::{FileSystem, FramePool, SwapDevice};
use crate::kernel::mm::types::frame_bytes;
use crate::kernel::mm::{FrameId, FrameTable, SwapTable, VirtAddr};
use crate::kernel::process::{Pid, Process};

use page::{FileSpan, Page, PageFuture, PageState};
pub use page::{BackingKind, FileShare, MappedFile};
pub use spt::SupplementalPageTable;

/// Shared handle to the boxed filesystem service; the mutex is the global
/// filesystem lock.
pub type FsHandle = Arc<Mutex<Box<dyn FileSystem>>>;

/// The saved register state a fault handler receives; only the user stack
/// pointer matters to the stack-growth heuristic.
#[derive(Debug, Clone, Copy)]
pub struct TrapFrame {
    pub rsp: VirtAddr,
}

/// How the claim path fills a freshly mapped frame
pub(crate) enum FrameFill {
    /// Leave the zeroed frame as is
    Zeroed,
    /// Read the page back from a swap slot
    Swap(crate::kernel::mm::SwapSlot),
    /// Read a file span and zero-fill the tail
    Data(FileSpan),
}

/// Snapshot of one source page taken before duplication starts
enum CopySrc {
    Pending(PageFuture),
    Anon,
    File(FileSpan),
}

/// The virtual memory service
pub struct Vm {
    pub(crate) pool: Box<dyn FramePool>,
    pub(crate) frames: FrameTable,
    pub(crate) swap: SwapTable,
    pub(crate) fs: FsHandle,
    pub(crate) processes: BTreeMap<Pid, Process>,
    pub(crate) next_pid: u64,
}

impl Vm {
    /// Wire the subsystem to its hardware services.
    ///
    /// The swap bitmap is sized from the device geometry here, which is
    /// the anonymous-page subsystem initialization of `vm_init`.
    pub fn new(pool: Box<dyn FramePool>, swap_device: Box<dyn SwapDevice>, fs: FsHandle) -> Self {
        Self {
            pool,
            frames: FrameTable::new(),
            swap: SwapTable::new(swap_device),
            fs,
            processes: BTreeMap::new(),
            next_pid: 1,
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub(crate) fn process(&self, pid: Pid) -> VmResult<&Process> {
        self.processes.get(&pid).ok_or(VmError::NoSuchProcess)
    }

    pub(crate) fn process_mut(&mut self, pid: Pid) -> VmResult<&mut Process> {
        self.processes.get_mut(&pid).ok_or(VmError::NoSuchProcess)
    }

    pub(crate) fn page(&self, pid: Pid, va: VirtAddr) -> VmResult<&Page> {
        self.process(pid)?
            .spt
            .find(va)
            .ok_or(VmError::Spt(SptError::NotFound))
    }

    pub(crate) fn page_mut(&mut self, pid: Pid, va: VirtAddr) -> VmResult<&mut Page> {
        self.process_mut(pid)?
            .spt
            .find_mut(va)
            .ok_or(VmError::Spt(SptError::NotFound))
    }

    fn resident_kva(&self, pid: Pid, va: VirtAddr) -> VmResult<VirtAddr> {
        let frame = self
            .page(pid, va)?
            .frame
            .ok_or(VmError::Frame(FrameError::NotResident))?;
        Ok(self.frames.kva(frame))
    }

    /// `(total frames, frames with an owning page)`
    pub fn frame_stats(&self) -> (usize, usize) {
        (self.frames.len(), self.frames.resident())
    }

    /// `(total swap slots, slots in use)`
    pub fn swap_stats(&self) -> (usize, usize) {
        (self.swap.slot_count(), self.swap.used_slots())
    }

    // ------------------------------------------------------------------
    // Page allocation
    // ------------------------------------------------------------------

    /// Reserve a pending page at `va`.
    ///
    /// The page is created `Uninit` and only gets a frame on first touch.
    /// Fails if the address is outside user space or already reserved.
    pub fn alloc_page_with_initializer(
        &mut self,
        pid: Pid,
        va: VirtAddr,
        writable: bool,
        future: PageFuture,
    ) -> VmResult<()> {
        let va = va.page_round_down();
        if !is_user_addr(va.as_usize()) {
            return Err(SptError::NotUserSpace.into());
        }
        let proc = self.process_mut(pid)?;
        proc.spt.insert(Page::new_uninit(va, writable, future))?;
        Ok(())
    }

    /// Reserve a plain anonymous page at `va`
    pub fn alloc_page(&mut self, pid: Pid, va: VirtAddr, writable: bool) -> VmResult<()> {
        self.alloc_page_with_initializer(pid, va, writable, PageFuture::Anon { seed: None })
    }

    // ------------------------------------------------------------------
    // Claim path
    // ------------------------------------------------------------------

    /// Make the page at `va` resident.
    ///
    /// Obtains a frame (evicting if the pool is dry), links page and frame
    /// both ways, installs the hardware mapping, then runs the backend's
    /// swap-in. Each failing step unwinds the previous ones; a failing
    /// first-touch initialization additionally destroys the page.
    pub fn claim_page(&mut self, pid: Pid, va: VirtAddr) -> VmResult<()> {
        let va = va.page_round_down();
        let (resident, was_uninit) = {
            let page = self.page(pid, va)?;
            (
                page.is_resident(),
                matches!(page.state, PageState::Uninit(_)),
            )
        };
        if resident {
            return Ok(());
        }

        let frame = self.get_frame()?;
        let kva = self.frames.kva(frame);

        self.frames.attach(frame, pid, va);
        self.page_mut(pid, va)?.frame = Some(frame);

        let writable = self.page(pid, va)?.writable;
        let mapped = self.process_mut(pid)?.pt.map(va, kva, writable);
        if !mapped {
            self.unwind_claim(pid, va, frame, false);
            return Err(FrameError::MapFailed.into());
        }

        if let Err(e) = self.swap_in(pid, va, kva) {
            self.unwind_claim(pid, va, frame, true);
            if was_uninit {
                // A page whose first-touch initialization failed is gone.
                let removed = self
                    .processes
                    .get_mut(&pid)
                    .and_then(|p| p.spt.remove(va));
                if let Some(page) = removed {
                    self.destroy_page(pid, page);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    fn unwind_claim(&mut self, pid: Pid, va: VirtAddr, frame: FrameId, unmap: bool) {
        if let Some(proc) = self.processes.get_mut(&pid) {
            if unmap {
                proc.pt.unmap(va);
            }
            if let Some(page) = proc.spt.find_mut(va) {
                page.frame = None;
            }
        }
        let kva = self.frames.remove(frame);
        self.pool.free_user_page(kva);
    }

    /// Dispatch the backend's swap-in for the page at `va`; `kva` is the
    /// freshly mapped, zeroed frame.
    fn swap_in(&mut self, pid: Pid, va: VirtAddr, kva: VirtAddr) -> VmResult<()> {
        let fill = {
            let page = self.page_mut(pid, va)?;
            match &page.state {
                PageState::Uninit(_) => None,
                PageState::Anon(a) => Some(match a.swap_slot {
                    Some(slot) => FrameFill::Swap(slot),
                    None => FrameFill::Zeroed,
                }),
                PageState::File(f) => Some(FrameFill::Data(f.span.clone())),
            }
        };
        let fill = match fill {
            Some(fill) => fill,
            None => self.uninit_initialize(pid, va)?,
        };
        match fill {
            FrameFill::Zeroed => Ok(()),
            FrameFill::Swap(slot) => self.anon_fill(pid, va, kva, slot),
            FrameFill::Data(span) => self.file_fill(&span, kva),
        }
    }

    // ------------------------------------------------------------------
    // Frame acquisition and eviction
    // ------------------------------------------------------------------

    /// Obtain a zeroed frame with no prior page linkage.
    ///
    /// Tries a fresh allocation from the user pool; on exhaustion a victim
    /// is chosen by the clock sweep, its page is swapped out, and the
    /// frame is reused.
    fn get_frame(&mut self) -> VmResult<FrameId> {
        if let Some(kva) = self.pool.alloc_user_page(true) {
            return Ok(self.frames.push_new(kva));
        }

        let victim = {
            let Vm {
                frames, processes, ..
            } = self;
            frames.select_victim(|pid, va| {
                if let Some(proc) = processes.get_mut(&pid) {
                    if proc.pt.is_accessed(va) {
                        proc.pt.set_accessed(va, false);
                        return true;
                    }
                }
                false
            })
        };
        let victim = match victim {
            Some(victim) => victim,
            // Nothing resident to push out: the kernel cannot make
            // forward progress on any fault.
            None => panic!("user pool exhausted and no frame is evictable"),
        };

        if let Some((vpid, vva)) = self.frames.owner(victim) {
            debug_println!("[VM] evicting {} of pid {}", vva, vpid.as_u64());
            if let Err(e) = self.swap_out_page(vpid, vva) {
                self.frames.requeue(victim);
                return Err(e);
            }
        }

        let kva = self.frames.kva(victim);
        // Reused frames honor the same zeroed contract as fresh ones.
        // Safety: the victim's page is detached, nothing else references
        // the frame.
        unsafe { frame_bytes(kva) }.fill(0);
        self.frames.requeue(victim);
        Ok(victim)
    }

    /// Swap the resident page at `va` out of memory.
    ///
    /// The backend persists the contents (anon pages to a swap slot, file
    /// pages back to the file when dirty and writable); then both
    /// page/frame edges are broken and the hardware mapping is removed.
    pub fn swap_out_page(&mut self, pid: Pid, va: VirtAddr) -> VmResult<()> {
        let va = va.page_round_down();
        let (frame, kva, backing) = {
            let page = self.page(pid, va)?;
            let frame = page.frame.ok_or(VmError::Frame(FrameError::NotResident))?;
            (frame, self.frames.kva(frame), page.backing())
        };
        match backing {
            // Uninit pages are never resident.
            BackingKind::Uninit => return Err(VmError::Frame(FrameError::NotResident)),
            BackingKind::Anon => self.anon_swap_out(pid, va, kva)?,
            BackingKind::File => self.file_swap_out(pid, va, kva)?,
        }

        self.page_mut(pid, va)?.frame = None;
        self.frames.detach(frame);
        self.process_mut(pid)?.pt.unmap(va);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Destruction
    // ------------------------------------------------------------------

    /// Destroy a page already detached from its SPT.
    ///
    /// Backends persist or release their resources (file write-back, swap
    /// slot, mapping share); then the mapping is removed and the frame,
    /// if any, always goes back to the pool.
    pub(crate) fn destroy_page(&mut self, pid: Pid, page: Page) {
        let Page {
            va,
            writable,
            frame,
            state,
        } = page;

        match state {
            PageState::Uninit(u) => self.uninit_destroy(u.future),
            PageState::Anon(a) => self.anon_destroy(a.swap_slot),
            PageState::File(f) => {
                let kva = frame.map(|id| self.frames.kva(id));
                self.file_destroy(pid, va, kva, writable, f.span);
            }
        }

        if let Some(proc) = self.processes.get_mut(&pid) {
            proc.pt.unmap(va);
        }
        if let Some(id) = frame {
            let kva = self.frames.remove(id);
            self.pool.free_user_page(kva);
        }
    }

    /// Explicitly drop the reservation at `va`: detach the page from the
    /// SPT and destroy it.
    pub fn dealloc_page(&mut self, pid: Pid, va: VirtAddr) -> VmResult<()> {
        let page = self
            .process_mut(pid)?
            .spt
            .remove(va)
            .ok_or(VmError::Spt(SptError::NotFound))?;
        self.destroy_page(pid, page);
        Ok(())
    }

    /// Destroy every page of the process's SPT.
    ///
    /// Destructors write dirty file pages back and release swap slots.
    pub fn spt_kill(&mut self, pid: Pid) {
        loop {
            let page = self.processes.get_mut(&pid).and_then(|p| p.spt.take_any());
            match page {
                Some(page) => self.destroy_page(pid, page),
                None => break,
            }
        }
    }

    // ------------------------------------------------------------------
    // Duplication (fork)
    // ------------------------------------------------------------------

    /// Duplicate every page of `src`'s SPT into `dst`.
    ///
    /// Pending pages are re-created with a freshly duplicated initializer
    /// record (file-lazy records get a reopened cursor); file pages are
    /// re-created lazily and claimed at once; anonymous pages are claimed
    /// in both address spaces and byte-copied so the child always gets a
    /// private copy. On failure `dst` is left destroyable for the caller.
    pub fn spt_copy(&mut self, dst: Pid, src: Pid) -> VmResult<()> {
        let entries: Vec<(VirtAddr, bool, CopySrc)> = self
            .process(src)?
            .spt
            .iter()
            .map(|page| {
                let state = match &page.state {
                    PageState::Uninit(u) => CopySrc::Pending(u.future.clone()),
                    PageState::Anon(_) => CopySrc::Anon,
                    PageState::File(f) => CopySrc::File(f.span.clone()),
                };
                (page.va, page.writable, state)
            })
            .collect();

        // Pages sharing one cursor in the source keep sharing one
        // duplicated cursor in the destination.
        let mut shares: BTreeMap<usize, FileShare> = BTreeMap::new();
        let result = self.copy_entries(dst, src, entries, &mut shares);

        // Cursors that ended up with no destination page (duplication
        // stopped early) are closed here; live ones stay open.
        for (_, share) in shares {
            self.release_share(share);
        }
        result
    }

    fn copy_entries(
        &mut self,
        dst: Pid,
        src: Pid,
        entries: Vec<(VirtAddr, bool, CopySrc)>,
        shares: &mut BTreeMap<usize, FileShare>,
    ) -> VmResult<()> {
        for (va, writable, state) in entries {
            match state {
                CopySrc::Pending(future) => {
                    let future = self.duplicate_future(future, shares)?;
                    self.alloc_page_with_initializer(dst, va, writable, future)?;
                }
                CopySrc::File(span) => {
                    let span = self.duplicate_span(&span, shares)?;
                    self.alloc_page_with_initializer(
                        dst,
                        va,
                        writable,
                        PageFuture::File { span },
                    )?;
                    self.claim_page(dst, va)?;
                }
                CopySrc::Anon => {
                    self.alloc_page(dst, va, writable)?;
                    let (src_kva, dst_kva) = self.claim_pair((src, va), (dst, va))?;
                    // Safety: both frames are live and belong to different
                    // pages, so the ranges cannot overlap.
                    unsafe {
                        frame_bytes(dst_kva).copy_from_slice(frame_bytes(src_kva));
                    }
                }
            }
        }
        Ok(())
    }

    /// Claim two pages and return both frame addresses, retrying when one
    /// claim evicts the other under memory pressure.
    fn claim_pair(
        &mut self,
        a: (Pid, VirtAddr),
        b: (Pid, VirtAddr),
    ) -> VmResult<(VirtAddr, VirtAddr)> {
        for _ in 0..4 {
            self.claim_page(a.0, a.1)?;
            self.claim_page(b.0, b.1)?;
            if self.page(a.0, a.1)?.is_resident() && self.page(b.0, b.1)?.is_resident() {
                return Ok((
                    self.resident_kva(a.0, a.1)?,
                    self.resident_kva(b.0, b.1)?,
                ));
            }
        }
        Err(FrameError::Exhausted.into())
    }

    fn duplicate_future(
        &self,
        future: PageFuture,
        shares: &mut BTreeMap<usize, FileShare>,
    ) -> VmResult<PageFuture> {
        Ok(match future {
            PageFuture::Anon { seed: None } => PageFuture::Anon { seed: None },
            PageFuture::Anon { seed: Some(span) } => PageFuture::Anon {
                seed: Some(self.duplicate_span(&span, shares)?),
            },
            PageFuture::File { span } => PageFuture::File {
                span: self.duplicate_span(&span, shares)?,
            },
        })
    }

    // ------------------------------------------------------------------
    // Fault handling
    // ------------------------------------------------------------------

    /// Absorb a page fault if possible.
    ///
    /// Returns `true` iff the fault was resolved and the faulting
    /// instruction may be restarted; `false` means the caller terminates
    /// the process with status -1.
    pub fn try_handle_fault(
        &mut self,
        pid: Pid,
        frame: &TrapFrame,
        addr: VirtAddr,
        user: bool,
        write: bool,
        not_present: bool,
    ) -> bool {
        if addr.is_null() || !is_user_addr(addr.as_usize()) {
            return false;
        }

        // A fault raised while the kernel touches user memory carries the
        // kernel stack pointer; use the rsp latched at syscall entry.
        let rsp = if user {
            frame.rsp
        } else {
            match self.processes.get(&pid).and_then(|p| p.user_rsp()) {
                Some(rsp) => rsp,
                None => return false,
            }
        };

        let known = match self.process(pid) {
            Ok(proc) => proc.spt.find(addr).map(|page| page.writable),
            Err(_) => return false,
        };

        match known {
            Some(writable) => {
                if write && !writable {
                    // True permission violation.
                    return false;
                }
                self.claim_page(pid, addr).is_ok()
            }
            None => {
                if !not_present {
                    return false;
                }
                if in_stack_window(addr, rsp) {
                    self.stack_growth(pid, addr)
                } else {
                    debug_println!("[VM] unhandled fault at {} (rsp {})", addr, rsp);
                    false
                }
            }
        }
    }

    /// Grow the stack by one anonymous page covering `addr`
    fn stack_growth(&mut self, pid: Pid, addr: VirtAddr) -> bool {
        let va = addr.page_round_down();
        if self.alloc_page(pid, va, true).is_err() {
            return false;
        }
        if self.claim_page(pid, va).is_err() {
            if let Some(page) = self.processes.get_mut(&pid).and_then(|p| p.spt.remove(va)) {
                self.destroy_page(pid, page);
            }
            return false;
        }
        true
    }
}

/// Stack-growth window: close enough under the saved stack pointer and
/// within the 1 MiB stack region below `USER_STACK`.
fn in_stack_window(addr: VirtAddr, rsp: VirtAddr) -> bool {
    let addr = addr.as_usize();
    addr >= rsp.as_usize().saturating_sub(STACK_SLACK)
        && addr >= USER_STACK - STACK_MAX
        && addr < USER_STACK
}

lazy_static! {
    /// Global VM service, installed once by [`init`]
    pub static ref VM: Mutex<Option<Vm>> = Mutex::new(None);
}

/// Initialize the virtual memory subsystem.
///
/// Wires the injected services together and installs the global handle.
/// Called once during kernel bring-up, after the frame pool and the
/// filesystem are available.
pub fn init(pool: Box<dyn FramePool>, swap_device: Box<dyn SwapDevice>, fs: FsHandle) {
    let vm = Vm::new(pool, swap_device, fs);
    let (slots, _) = vm.swap_stats();
    *VM.lock() = Some(vm);
    debug_println!("[VM] initialized: {} swap slots", slots);
}
