// src/kernel/vm/uninit.rs
//! Uninitialized pages
//!
//! Every page is born uninitialized. The first fault transmutes the page
//! into its future type (anonymous or file-backed) and reports how the
//! freshly mapped frame must be filled: left zeroed, or populated from the
//! seeding file span. A pending page that is never touched still owns its
//! duplicated initializer record, which is released on destroy.

use crate::errors::VmResult;
use crate::kernel::mm::VirtAddr;
use crate::kernel::process::Pid;

use super::page::{AnonPage, FilePage, PageFuture, PageState};
use super::{FrameFill, Vm};

impl Vm {
    /// Transmute the pending page at `va` into its future type.
    ///
    /// Runs under the claim path once the frame is mapped; the returned
    /// fill action is the user-supplied initialization (segment load or
    /// mmap population) that completes the first touch.
    pub(super) fn uninit_initialize(&mut self, pid: Pid, va: VirtAddr) -> VmResult<FrameFill> {
        let page = self.page_mut(pid, va)?;
        let future = match &mut page.state {
            PageState::Uninit(u) => {
                core::mem::replace(&mut u.future, PageFuture::Anon { seed: None })
            }
            // Only reachable for pending pages; nothing to do otherwise.
            _ => return Ok(FrameFill::Zeroed),
        };

        match future {
            PageFuture::Anon { seed } => {
                page.state = PageState::Anon(AnonPage { swap_slot: None });
                Ok(match seed {
                    Some(span) => FrameFill::Data(span),
                    None => FrameFill::Zeroed,
                })
            }
            PageFuture::File { span } => {
                page.state = PageState::File(FilePage { span: span.clone() });
                Ok(FrameFill::Data(span))
            }
        }
    }

    /// Release the resources of a pending page that was never touched
    pub(super) fn uninit_destroy(&mut self, future: PageFuture) {
        match future {
            PageFuture::Anon { seed: Some(span) } | PageFuture::File { span } => {
                self.release_share(span.share);
            }
            PageFuture::Anon { seed: None } => {}
        }
    }
}
