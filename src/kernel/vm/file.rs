// src/kernel/vm/file.rs
//! File-backed pages, `mmap` and `munmap`
//!
//! A file-backed page mirrors one page worth of a file: `read_bytes` read
//! at a fixed offset, the rest zero-filled. Faults re-read the span with
//! positional reads (seek state would not survive concurrent readers);
//! eviction and destruction write dirty pages back iff the mapping is
//! writable. One `mmap` call reopens the file once and shares the cursor
//! across all pages of the mapping.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use crate::constants::PAGE_SIZE;
use crate::constants::is_user_addr;
use crate::debug_println;
use crate::errors::{FrameError, FsError, VmError, VmResult};
use crate::kernel::core::traits::FileHandle;
use crate::kernel::mm::VirtAddr;
use crate::kernel::mm::types::frame_bytes;
use crate::kernel::process::Pid;

use super::Vm;
use super::page::{FileShare, FileSpan, MappedFile, PageFuture, PageState};

impl Vm {
    /// Populate a frame from a file span: read `read_bytes` at the span's
    /// offset, zero-fill the tail.
    pub(super) fn file_fill(&mut self, span: &FileSpan, kva: VirtAddr) -> VmResult<()> {
        // Safety: the claim path owns the freshly mapped frame.
        let buf = unsafe { frame_bytes(kva) };
        {
            let mut fs = self.fs.lock();
            let read = fs.read_at(span.handle(), &mut buf[..span.read_bytes], span.ofs)?;
            if read != span.read_bytes {
                return Err(FsError::ShortRead.into());
            }
        }
        buf[span.read_bytes..].fill(0);
        Ok(())
    }

    /// Write a page's span back to the file; short writes fail the
    /// operation.
    pub(super) fn write_span_back(&self, span: &FileSpan, kva: VirtAddr) -> VmResult<()> {
        // Safety: the frame is still live; eviction detaches it only after
        // the write-back finished.
        let buf = unsafe { frame_bytes(kva) };
        let mut fs = self.fs.lock();
        let written = fs.write_at(span.handle(), &buf[..span.read_bytes], span.ofs)?;
        if written != span.read_bytes {
            return Err(FsError::ShortWrite.into());
        }
        Ok(())
    }

    /// Backend part of evicting a file-backed page: write back iff the
    /// mapping is writable and the hardware dirty bit is set.
    pub(super) fn file_swap_out(&mut self, pid: Pid, va: VirtAddr, kva: VirtAddr) -> VmResult<()> {
        let (span, writable) = {
            let page = self.page(pid, va)?;
            match &page.state {
                PageState::File(file) => (file.span.clone(), page.writable),
                _ => return Err(VmError::Frame(FrameError::NotResident)),
            }
        };
        if writable && self.process(pid)?.pt.is_dirty(va) {
            self.write_span_back(&span, kva)?;
            self.process_mut(pid)?.pt.set_dirty(va, false);
        }
        Ok(())
    }

    /// Backend part of destroying a file-backed page.
    ///
    /// Same write-back policy as eviction, but best-effort: destructors
    /// never propagate I/O errors, they log and move on. Dropping the
    /// mapping share closes the reopened cursor once the last page of the
    /// mapping is gone.
    pub(super) fn file_destroy(
        &mut self,
        pid: Pid,
        va: VirtAddr,
        kva: Option<VirtAddr>,
        writable: bool,
        span: FileSpan,
    ) {
        if let Some(kva) = kva {
            let dirty = self
                .processes
                .get(&pid)
                .map(|p| p.pt.is_dirty(va))
                .unwrap_or(false);
            if writable && dirty {
                match self.write_span_back(&span, kva) {
                    Ok(()) => {
                        if let Some(proc) = self.processes.get_mut(&pid) {
                            proc.pt.set_dirty(va, false);
                        }
                    }
                    Err(e) => {
                        debug_println!("[VM] write-back failed destroying {}: {}", va, e);
                    }
                }
            }
        }
        self.release_share(span.share);
    }

    /// Drop one reference to a mapping's cursor, closing the reopened
    /// handle when this was the last one.
    pub(super) fn release_share(&self, share: FileShare) {
        if share.owned && Arc::strong_count(&share) == 1 {
            self.fs.lock().close(share.handle);
        }
    }

    /// Reopen a span's file to produce an independent cursor for a
    /// duplicated page record.
    ///
    /// `shares` dedups by the source cursor, so every page of one source
    /// mapping ends up on the same duplicated cursor.
    pub(super) fn duplicate_span(
        &self,
        span: &FileSpan,
        shares: &mut BTreeMap<usize, FileShare>,
    ) -> VmResult<FileSpan> {
        let key = Arc::as_ptr(&span.share) as usize;
        let share = match shares.get(&key) {
            Some(share) => share.clone(),
            None => {
                let handle = self.fs.lock().reopen(span.handle())?;
                let share: FileShare = Arc::new(MappedFile {
                    handle,
                    owned: true,
                });
                shares.insert(key, share.clone());
                share
            }
        };
        Ok(FileSpan {
            share,
            ofs: span.ofs,
            read_bytes: span.read_bytes,
            zero_bytes: span.zero_bytes,
        })
    }

    // ------------------------------------------------------------------
    // mmap / munmap
    // ------------------------------------------------------------------

    /// Map `length` bytes of `file` starting at `offset` to `addr`.
    ///
    /// Validation failures return `None` without touching any state:
    /// zero length, unaligned `offset` or `addr`, a null or non-user
    /// range, or overlap with an existing page. The file is reopened once;
    /// every page of the mapping shares the cursor. A mid-loop allocation
    /// failure rolls the whole mapping back. Returns `addr` on success.
    pub fn do_mmap(
        &mut self,
        pid: Pid,
        addr: VirtAddr,
        length: usize,
        writable: bool,
        file: FileHandle,
        offset: u64,
    ) -> Option<VirtAddr> {
        if length == 0 || addr.is_null() || !addr.is_page_aligned() {
            return None;
        }
        if offset as usize % PAGE_SIZE != 0 {
            return None;
        }
        let page_count = length.div_ceil(PAGE_SIZE);
        let end = addr.checked_add(page_count.checked_mul(PAGE_SIZE)?)?;
        if !is_user_addr(addr.as_usize()) || !is_user_addr(end.as_usize() - 1) {
            return None;
        }
        {
            let proc = self.processes.get(&pid)?;
            for i in 0..page_count {
                let va = VirtAddr::new(addr.as_usize() + i * PAGE_SIZE);
                if proc.spt.find(va).is_some() {
                    return None;
                }
            }
        }

        // One independent cursor per mapping, shared by all its pages.
        let (handle, file_len) = {
            let mut fs = self.fs.lock();
            let handle = fs.reopen(file).ok()?;
            match fs.length(handle) {
                Ok(len) => (handle, len),
                Err(_) => {
                    fs.close(handle);
                    return None;
                }
            }
        };
        let share: FileShare = Arc::new(MappedFile {
            handle,
            owned: true,
        });

        let mut remaining = length.min(file_len as usize);
        let mut ofs = offset;
        for i in 0..page_count {
            let va = VirtAddr::new(addr.as_usize() + i * PAGE_SIZE);
            let page_read = remaining.min(PAGE_SIZE);
            let span = FileSpan::new(share.clone(), ofs, page_read);
            let allocated =
                self.alloc_page_with_initializer(pid, va, writable, PageFuture::File { span });
            if allocated.is_err() {
                for j in 0..i {
                    let undo = VirtAddr::new(addr.as_usize() + j * PAGE_SIZE);
                    if let Some(page) = self
                        .processes
                        .get_mut(&pid)
                        .and_then(|p| p.spt.remove(undo))
                    {
                        self.destroy_page(pid, page);
                    }
                }
                self.release_share(share);
                return None;
            }
            remaining -= page_read;
            ofs += page_read as u64;
        }

        debug_println!("[VM] mmap {} pages at {}", page_count, addr);
        Some(addr)
    }

    /// Unmap the mapping that starts at `addr`.
    ///
    /// Walks consecutive pages backed by the same mapping cursor as the
    /// first one, writing dirty pages back and destroying each. Stops at
    /// the first non-matching or missing page.
    pub fn do_munmap(&mut self, pid: Pid, addr: VirtAddr) {
        let mut va = addr.page_round_down();
        let first = match self
            .processes
            .get(&pid)
            .and_then(|p| p.spt.find(va))
            .and_then(|p| p.file_share().cloned())
        {
            Some(share) => share,
            None => return,
        };

        loop {
            let same_mapping = self
                .processes
                .get(&pid)
                .and_then(|p| p.spt.find(va))
                .and_then(|p| p.file_share())
                .map(|s| Arc::ptr_eq(s, &first))
                .unwrap_or(false);
            if !same_mapping {
                break;
            }

            if let Some(page) = self.processes.get_mut(&pid).and_then(|p| p.spt.remove(va)) {
                self.destroy_page(pid, page);
            } else {
                break;
            }

            va = match va.checked_add(PAGE_SIZE) {
                Some(next) => next,
                None => break,
            };
        }

        // The walk held its own reference to the cursor; dropping it here
        // closes the handle if every page of the mapping is gone.
        self.release_share(first);
    }
}
