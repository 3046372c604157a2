// src/kernel/vm/anon.rs
//! Anonymous pages
//!
//! Pages with no file backing: user stack, BSS, heap, and the private
//! copies produced by fork. A freshly initialized anonymous page starts
//! from the zeroed frame; once evicted, its contents live in a swap slot
//! until the next fault reads them back.

use crate::errors::VmResult;
use crate::kernel::mm::{SwapSlot, VirtAddr};
use crate::kernel::process::Pid;

use super::Vm;
use super::page::PageState;

impl Vm {
    /// Read the page's contents back from its swap slot.
    ///
    /// On success the slot bit is cleared and the page forgets the slot.
    /// On a device error the slot stays recorded so the page can still be
    /// destroyed cleanly.
    pub(super) fn anon_fill(
        &mut self,
        pid: Pid,
        va: VirtAddr,
        kva: VirtAddr,
        slot: SwapSlot,
    ) -> VmResult<()> {
        self.swap.read_slot(slot, kva)?;
        self.swap.release(slot);
        if let PageState::Anon(anon) = &mut self.page_mut(pid, va)?.state {
            anon.swap_slot = None;
        }
        Ok(())
    }

    /// Write the page's frame to a freshly allocated swap slot.
    ///
    /// A full swap device is fatal: losing the page silently is not an
    /// option, and the fault path has no way to make progress.
    pub(super) fn anon_swap_out(&mut self, pid: Pid, va: VirtAddr, kva: VirtAddr) -> VmResult<()> {
        let slot = match self.swap.scan_and_flip() {
            Some(slot) => slot,
            None => panic!("swap device full while evicting {}", va),
        };
        if let Err(e) = self.swap.write_slot(slot, kva) {
            self.swap.release(slot);
            return Err(e.into());
        }
        if let PageState::Anon(anon) = &mut self.page_mut(pid, va)?.state {
            anon.swap_slot = Some(slot);
        }
        Ok(())
    }

    /// Release the swap slot an anonymous page may still own
    pub(super) fn anon_destroy(&mut self, slot: Option<SwapSlot>) {
        if let Some(slot) = slot {
            self.swap.release(slot);
        }
    }
}
