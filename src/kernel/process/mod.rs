// src/kernel/process/mod.rs
//! Per-process virtual memory state
//!
//! The VM-side view of a process: its supplemental page table, its
//! hardware page table handle, the user stack pointer latched at syscall
//! entry, and the parent link. Scheduling, register state and the fd
//! table belong to the host kernel.

use alloc::boxed::Box;
use alloc::sync::Arc;

use crate::constants::{PAGE_SIZE, USER_STACK};
use crate::debug_println;
use crate::errors::VmResult;
use crate::kernel::core::traits::{FileHandle, PageTable};
use crate::kernel::mm::VirtAddr;
use crate::kernel::vm::page::{FileSpan, MappedFile, PageFuture};
use crate::kernel::vm::{SupplementalPageTable, Vm};

/// Process ID type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(u64);

impl Pid {
    /// Create a new process ID
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Virtual memory state of one process
pub struct Process {
    pid: Pid,
    parent: Option<Pid>,
    pub(crate) spt: SupplementalPageTable,
    pub(crate) pt: Box<dyn PageTable>,
    user_rsp: Option<VirtAddr>,
}

impl Process {
    fn new(pid: Pid, pt: Box<dyn PageTable>) -> Self {
        Self {
            pid,
            parent: None,
            spt: SupplementalPageTable::new(),
            pt,
            user_rsp: None,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn parent(&self) -> Option<Pid> {
        self.parent
    }

    /// The user stack pointer saved at the last syscall entry
    pub fn user_rsp(&self) -> Option<VirtAddr> {
        self.user_rsp
    }

    /// Number of pages reserved in the SPT
    pub fn page_count(&self) -> usize {
        self.spt.len()
    }
}

impl Vm {
    /// Register a new process with an empty SPT.
    ///
    /// The hardware page table is created by the host kernel and handed
    /// in; the VM subsystem owns it from here on.
    pub fn create_process(&mut self, pt: Box<dyn PageTable>) -> Pid {
        let pid = Pid::new(self.next_pid);
        self.next_pid += 1;
        self.processes.insert(pid, Process::new(pid, pt));
        debug_println!("[PROCESS] created pid {}", pid.as_u64());
        pid
    }

    /// Latch the user stack pointer at syscall entry.
    ///
    /// A later fault on a kernel-side touch of user memory reads this to
    /// apply the stack-growth heuristic.
    pub fn latch_user_rsp(&mut self, pid: Pid, rsp: VirtAddr) {
        if let Some(proc) = self.processes.get_mut(&pid) {
            proc.user_rsp = Some(rsp);
        }
    }

    /// Fork `parent`'s address space into a new process.
    ///
    /// Duplicates the parent's SPT page by page; anonymous pages become
    /// private copies immediately. On failure the half-built child is torn
    /// down and the error propagated.
    pub fn fork(&mut self, parent: Pid, child_pt: Box<dyn PageTable>) -> VmResult<Pid> {
        let child = self.create_process(child_pt);
        self.process_mut(child)?.parent = Some(parent);

        if let Err(e) = self.spt_copy(child, parent) {
            self.process_exit(child, -1);
            return Err(e);
        }
        debug_println!(
            "[PROCESS] forked pid {} -> pid {}",
            parent.as_u64(),
            child.as_u64()
        );
        Ok(child)
    }

    /// Tear down a process's address space on exit.
    ///
    /// Destroys every SPT entry with full write-back semantics, then
    /// forgets the process.
    pub fn process_exit(&mut self, pid: Pid, exit_code: i32) {
        self.spt_kill(pid);
        self.processes.remove(&pid);
        debug_println!(
            "[PROCESS] pid {} exited with code {}",
            pid.as_u64(),
            exit_code
        );
    }

    /// Register a segment of the executable for lazy loading.
    ///
    /// `read_bytes + zero_bytes` must be a multiple of the page size; the
    /// pages are reserved as anonymous pages seeded from `file`, so they
    /// load on first touch and swap to the swap device afterwards. The
    /// executable's handle stays owned by the process layer.
    pub fn load_segment(
        &mut self,
        pid: Pid,
        file: FileHandle,
        ofs: u64,
        upage: VirtAddr,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> VmResult<()> {
        debug_assert!((read_bytes + zero_bytes) % PAGE_SIZE == 0);
        debug_assert!(upage.is_page_aligned());
        debug_assert!(ofs as usize % PAGE_SIZE == 0);

        let share = Arc::new(MappedFile {
            handle: file,
            owned: false,
        });

        let mut va = upage;
        let mut ofs = ofs;
        let mut remaining = read_bytes;
        let mut pending_zero = zero_bytes;
        while remaining > 0 || pending_zero > 0 {
            let page_read = remaining.min(PAGE_SIZE);
            let page_zero = PAGE_SIZE - page_read;

            let seed = if page_read > 0 {
                Some(FileSpan::new(share.clone(), ofs, page_read))
            } else {
                None
            };
            self.alloc_page_with_initializer(pid, va, writable, PageFuture::Anon { seed })?;

            remaining -= page_read;
            pending_zero -= page_zero;
            ofs += page_read as u64;
            va = VirtAddr::new(va.as_usize() + PAGE_SIZE);
        }
        Ok(())
    }

    /// Create and immediately claim the first stack page.
    ///
    /// Returns the initial user stack pointer, `USER_STACK`.
    pub fn setup_stack(&mut self, pid: Pid) -> VmResult<VirtAddr> {
        let stack_bottom = VirtAddr::new(USER_STACK - PAGE_SIZE);
        self.alloc_page(pid, stack_bottom, true)?;
        self.claim_page(pid, stack_bottom)?;
        Ok(VirtAddr::new(USER_STACK))
    }
}
