// src/kernel/syscall/mod.rs
//! Syscall-facing surface of the VM subsystem
//!
//! The dispatcher itself lives in the host kernel; what belongs here is
//! the one thing every syscall entry must do for the VM (latch the user
//! stack pointer) and the thin `mmap`/`munmap` wrappers that translate
//! the service's results into Linux-style error codes.

use crate::kernel::core::traits::FileHandle;
use crate::kernel::mm::VirtAddr;
use crate::kernel::process::Pid;
use crate::kernel::vm::Vm;

/// System call result type
pub type SyscallResult = i64;

/// Success code
pub const SUCCESS: SyscallResult = 0;

/// Error codes (Linux-compatible)
pub const ENOENT: SyscallResult = -2; // No such file or directory
pub const ESRCH: SyscallResult = -3; // No such process
pub const ENOMEM: SyscallResult = -12; // Out of memory
pub const EFAULT: SyscallResult = -14; // Bad address (invalid pointer)
pub const EINVAL: SyscallResult = -22; // Invalid argument

/// Record the faulting-relevant state at syscall entry.
///
/// Must run at the single kernel entry point, before any user memory is
/// touched: a page fault taken while the kernel dereferences a user
/// pointer needs the user rsp to decide on stack growth.
pub fn syscall_enter(vm: &mut Vm, pid: Pid, user_rsp: VirtAddr) {
    vm.latch_user_rsp(pid, user_rsp);
}

/// sys_mmap - map a file into the process's address space
///
/// Arguments mirror the userspace call: destination address, length in
/// bytes, writability, the file to map and a page-aligned offset. The fd
/// table is the dispatcher's business; by the time this runs the fd has
/// been resolved to a `FileHandle`.
///
/// Returns:
/// - Positive: the mapped address
/// - Negative: error code (EINVAL)
pub fn sys_mmap(
    vm: &mut Vm,
    pid: Pid,
    addr: u64,
    length: u64,
    writable: bool,
    file: FileHandle,
    offset: u64,
) -> SyscallResult {
    match vm.do_mmap(
        pid,
        VirtAddr::new(addr as usize),
        length as usize,
        writable,
        file,
        offset,
    ) {
        Some(mapped) => mapped.as_u64() as SyscallResult,
        None => EINVAL,
    }
}

/// sys_munmap - remove the mapping that starts at `addr`
pub fn sys_munmap(vm: &mut Vm, pid: Pid, addr: u64) -> SyscallResult {
    vm.do_munmap(pid, VirtAddr::new(addr as usize));
    SUCCESS
}
