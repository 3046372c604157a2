// src/kernel/core/traits.rs
//! Service traits for the virtual memory subsystem
//!
//! The VM core consumes four external interfaces: the hardware page table,
//! the physical frame pool, the swap block device, and the filesystem.
//! Each is a trait here, implemented by the host kernel for real hardware
//! and by simulated services in tests. The `Vm` service holds boxed
//! instances, so nothing in the core reaches for ambient globals.

use crate::errors::{FsError, SwapError};
use crate::kernel::mm::VirtAddr;

/// Hardware page table of one user process.
///
/// Mirrors the page-table primitives: install/remove 4 KiB mappings and
/// query/update the accessed and dirty bits of a mapped page. All addresses
/// are page-aligned user virtual addresses except `kva`, which is the
/// kernel-accessible address of the backing frame.
pub trait PageTable: Send {
    /// Install a mapping from `va` to the frame at `kva`.
    ///
    /// Returns `false` if installing the mapping failed (e.g. a page-table
    /// page could not be allocated).
    fn map(&mut self, va: VirtAddr, kva: VirtAddr, writable: bool) -> bool;

    /// Remove the mapping for `va` and flush the TLB entry.
    ///
    /// Removing a missing mapping is a no-op.
    fn unmap(&mut self, va: VirtAddr);

    /// Check whether `va` currently has a mapping installed
    fn is_mapped(&self, va: VirtAddr) -> bool;

    /// Read the accessed bit of the mapping at `va`
    fn is_accessed(&self, va: VirtAddr) -> bool;

    /// Write the accessed bit of the mapping at `va`
    fn set_accessed(&mut self, va: VirtAddr, accessed: bool);

    /// Read the dirty bit of the mapping at `va`
    fn is_dirty(&self, va: VirtAddr) -> bool;

    /// Write the dirty bit of the mapping at `va`
    fn set_dirty(&mut self, va: VirtAddr, dirty: bool);
}

/// Physical frame pool for user pages.
///
/// Hands out kernel-accessible addresses of 4 KiB frames from the user
/// pool. Exhaustion is reported as `None`; the frame table reacts by
/// evicting a resident page.
pub trait FramePool: Send {
    /// Allocate one user frame; `zero` requests a zero-filled frame
    fn alloc_user_page(&mut self, zero: bool) -> Option<VirtAddr>;

    /// Return a frame to the pool
    fn free_user_page(&mut self, kva: VirtAddr);
}

/// Swap block device.
///
/// Fixed 512-byte sectors; the swap table groups `SECTORS_PER_PAGE`
/// consecutive sectors into one page-sized slot.
pub trait SwapDevice: Send {
    /// Total number of sectors on the device
    fn sector_count(&self) -> u64;

    /// Read one sector into `buf` (`buf.len() == SECTOR_SIZE`)
    fn read_sector(&mut self, sector: u64, buf: &mut [u8]) -> Result<(), SwapError>;

    /// Write one sector from `buf` (`buf.len() == SECTOR_SIZE`)
    fn write_sector(&mut self, sector: u64, buf: &[u8]) -> Result<(), SwapError>;
}

/// An open file cursor, as issued by the filesystem service.
///
/// Handles are opaque to the VM core; `reopen` yields an independent
/// cursor onto the same file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileHandle(pub u64);

/// Byte-level filesystem interface.
///
/// Only positional reads and writes are used: `read_at`/`write_at` do not
/// disturb any seek position, so concurrent readers of reopened handles
/// stay independent. The single mutex around the boxed implementation is
/// the global filesystem lock.
pub trait FileSystem: Send {
    /// Open an independent cursor onto the file behind `file`
    fn reopen(&mut self, file: FileHandle) -> Result<FileHandle, FsError>;

    /// Close a handle obtained from `reopen`
    fn close(&mut self, file: FileHandle);

    /// Length of the file in bytes
    fn length(&mut self, file: FileHandle) -> Result<u64, FsError>;

    /// Read up to `buf.len()` bytes at byte offset `ofs`; returns the
    /// number of bytes read (short at end of file)
    fn read_at(&mut self, file: FileHandle, buf: &mut [u8], ofs: u64) -> Result<usize, FsError>;

    /// Write `buf` at byte offset `ofs`; returns the number of bytes
    /// written
    fn write_at(&mut self, file: FileHandle, buf: &[u8], ofs: u64) -> Result<usize, FsError>;
}
