// src/errors/unified.rs

//! Unified error types for the virtual memory subsystem
//!
//! This module provides a consistent error handling approach across
//! all VM subsystems (supplemental page table, frame table, swap,
//! file-backed pages).

use core::fmt;

/// Top-level virtual memory error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Supplemental page table error
    Spt(SptError),
    /// Frame table / eviction error
    Frame(FrameError),
    /// Swap device error
    Swap(SwapError),
    /// Filesystem error
    Fs(FsError),
    /// The referenced process is not registered
    NoSuchProcess,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::Spt(e) => write!(f, "SPT error: {}", e),
            VmError::Frame(e) => write!(f, "frame error: {}", e),
            VmError::Swap(e) => write!(f, "swap error: {}", e),
            VmError::Fs(e) => write!(f, "filesystem error: {}", e),
            VmError::NoSuchProcess => write!(f, "no such process"),
        }
    }
}

/// Supplemental page table errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SptError {
    /// A page with the same virtual address is already registered
    Duplicate,
    /// No page is registered at the virtual address
    NotFound,
    /// The virtual address lies outside user space
    NotUserSpace,
}

impl SptError {
    pub const fn as_str(&self) -> &'static str {
        match self {
            SptError::Duplicate => "duplicate page",
            SptError::NotFound => "page not found",
            SptError::NotUserSpace => "address not in user space",
        }
    }
}

impl fmt::Display for SptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<SptError> for VmError {
    fn from(err: SptError) -> Self {
        VmError::Spt(err)
    }
}

/// Frame table and eviction errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// The user pool is exhausted and no frame is eligible for eviction
    Exhausted,
    /// Installing the hardware mapping failed
    MapFailed,
    /// The page has no resident frame
    NotResident,
}

impl FrameError {
    pub const fn as_str(&self) -> &'static str {
        match self {
            FrameError::Exhausted => "out of frames",
            FrameError::MapFailed => "hardware mapping failed",
            FrameError::NotResident => "page not resident",
        }
    }
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<FrameError> for VmError {
    fn from(err: FrameError) -> Self {
        VmError::Frame(err)
    }
}

/// Swap device errors
///
/// Slot exhaustion is not represented here: a full swap device during
/// eviction is fatal, so that path panics instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapError {
    /// Reading a slot's sectors from the swap device failed
    ReadFailed,
    /// Writing a slot's sectors to the swap device failed
    WriteFailed,
}

impl fmt::Display for SwapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwapError::ReadFailed => write!(f, "swap read failed"),
            SwapError::WriteFailed => write!(f, "swap write failed"),
        }
    }
}

impl From<SwapError> for VmError {
    fn from(err: SwapError) -> Self {
        VmError::Swap(err)
    }
}

/// Filesystem errors, as reported by the injected filesystem service or
/// detected on short transfers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// The file handle does not refer to an open file
    BadHandle,
    /// A positional read returned fewer bytes than requested
    ShortRead,
    /// A positional write wrote fewer bytes than requested
    ShortWrite,
    /// Underlying device I/O failure
    Io,
}

impl FsError {
    pub const fn as_str(&self) -> &'static str {
        match self {
            FsError::BadHandle => "bad file handle",
            FsError::ShortRead => "short read",
            FsError::ShortWrite => "short write",
            FsError::Io => "I/O failure",
        }
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<FsError> for VmError {
    fn from(err: FsError) -> Self {
        VmError::Fs(err)
    }
}

/// Result type alias for virtual memory operations
pub type VmResult<T> = core::result::Result<T, VmError>;
