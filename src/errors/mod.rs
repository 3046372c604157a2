// src/errors/mod.rs
//! Error types for the virtual memory subsystem
//!
//! Re-exports the unified error hierarchy so callers can write
//! `use crate::errors::{VmError, VmResult}`.

pub mod unified;

pub use unified::{FrameError, FsError, SptError, SwapError, VmError, VmResult};
