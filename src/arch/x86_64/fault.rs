// src/arch/x86_64/fault.rs
//! Page-fault error code decoding
//!
//! The CPU pushes an error code on #PF; the exception handler decodes it
//! into the three facts the VM fault handler consumes: fault origin
//! (user/kernel), access kind (read/write), and whether the translation
//! was missing or merely lacked permission.

use x86_64::structures::idt::PageFaultErrorCode;

/// Decoded view of a #PF error code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultKind {
    /// Fault raised while the CPU was in ring 3
    pub user: bool,
    /// The faulting access was a write
    pub write: bool,
    /// No translation existed (as opposed to a protection violation)
    pub not_present: bool,
}

impl From<PageFaultErrorCode> for FaultKind {
    fn from(code: PageFaultErrorCode) -> Self {
        Self {
            user: code.contains(PageFaultErrorCode::USER_MODE),
            write: code.contains(PageFaultErrorCode::CAUSED_BY_WRITE),
            not_present: !code.contains(PageFaultErrorCode::PROTECTION_VIOLATION),
        }
    }
}
