// src/kernel/mm/mod.rs
//! Memory management primitives: address types, frame table, swap table

pub mod frame;
pub mod swap;
pub mod types;

pub use frame::{FrameId, FrameTable};
pub use swap::{SwapSlot, SwapTable};
pub use types::VirtAddr;
