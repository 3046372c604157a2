// src/constants.rs

//! Kernel constants and configuration values
//!
//! This module centralizes the layout and geometry constants used by the
//! virtual memory subsystem: page and sector sizes, the user address-space
//! boundary, and the stack-growth policy knobs.

/// Size of one virtual/physical page in bytes (4 KiB)
pub const PAGE_SIZE: usize = 4096;

/// Size of one swap-disk sector in bytes
pub const SECTOR_SIZE: usize = 512;

/// Number of disk sectors composing one swap slot
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

/// First address past the canonical lower half.
///
/// User space: 0x0000_0000_0000_0000 ~ 0x0000_7FFF_FFFF_FFFF
/// Kernel space: 0xFFFF_8000_0000_0000 ~ 0xFFFF_FFFF_FFFF_FFFF
pub const USER_SPACE_END: usize = 0x0000_8000_0000_0000;

/// Top of the user stack (exclusive); the initial stack page is mapped
/// directly below this address.
pub const USER_STACK: usize = 0x0000_7000_0000_0000;

/// Maximum size the user stack may grow to (1 MiB)
pub const STACK_MAX: usize = 1024 * 1024;

/// Slack below the saved stack pointer still treated as stack growth.
///
/// One machine word, so a faulting `push` (which decrements rsp by 8
/// before the access) still lands inside the growth window.
pub const STACK_SLACK: usize = 8;

/// Check if an address is in user space
#[inline]
pub const fn is_user_addr(addr: usize) -> bool {
    addr < USER_SPACE_END
}
