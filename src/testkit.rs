// src/testkit.rs
//! Simulated hardware services for host tests
//!
//! Every service the VM consumes has a simulated twin here. Each is a
//! cheaply cloneable handle over shared state, so a test can hand one
//! clone to the `Vm` service and keep another to inspect or perturb the
//! "hardware": flip accessed/dirty bits like the MMU would, bound the
//! frame pool to force eviction, or read a file's bytes after write-back.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::vec::Vec;

use crate::constants::{PAGE_SIZE, SECTOR_SIZE};
use crate::errors::{FsError, SwapError};
use crate::kernel::core::traits::{FileHandle, FileSystem, FramePool, PageTable, SwapDevice};
use crate::kernel::mm::VirtAddr;

// ----------------------------------------------------------------------
// Page table
// ----------------------------------------------------------------------

/// One simulated mapping entry
#[derive(Debug, Clone, Copy)]
pub struct SimMapping {
    pub kva: VirtAddr,
    pub writable: bool,
    pub accessed: bool,
    pub dirty: bool,
}

#[derive(Default)]
struct PtState {
    maps: BTreeMap<VirtAddr, SimMapping>,
    fail_next_map: bool,
}

/// Simulated hardware page table.
///
/// Tests emulate the MMU through [`SimPageTable::write_byte`] and
/// [`SimPageTable::read_byte`], which honor the mapping's permissions and
/// set the accessed/dirty bits as real hardware would.
#[derive(Clone)]
pub struct SimPageTable(Arc<Mutex<PtState>>);

impl SimPageTable {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(PtState::default())))
    }

    /// Inspect the mapping covering `va`
    pub fn mapping(&self, va: VirtAddr) -> Option<SimMapping> {
        self.0
            .lock()
            .unwrap()
            .maps
            .get(&va.page_round_down())
            .copied()
    }

    /// Number of live mappings
    pub fn mapped_pages(&self) -> usize {
        self.0.lock().unwrap().maps.len()
    }

    /// Make the next `map` call fail, as if a page-table page could not
    /// be allocated
    pub fn fail_next_map(&self) {
        self.0.lock().unwrap().fail_next_map = true;
    }

    /// Emulate a user store: fails (None) when `va` is unmapped or the
    /// mapping is read-only, otherwise writes through the frame and sets
    /// the accessed and dirty bits.
    pub fn write_byte(&self, va: VirtAddr, value: u8) -> Option<()> {
        let mut state = self.0.lock().unwrap();
        let mapping = state.maps.get_mut(&va.page_round_down())?;
        if !mapping.writable {
            return None;
        }
        mapping.accessed = true;
        mapping.dirty = true;
        let kva = mapping.kva;
        drop(state);
        // Safety: the frame behind a live mapping is owned by the pool
        // for the whole test.
        unsafe {
            *kva.as_mut_ptr::<u8>().add(va.page_offset()) = value;
        }
        Some(())
    }

    /// Emulate a user load; sets the accessed bit.
    pub fn read_byte(&self, va: VirtAddr) -> Option<u8> {
        let mut state = self.0.lock().unwrap();
        let mapping = state.maps.get_mut(&va.page_round_down())?;
        mapping.accessed = true;
        let kva = mapping.kva;
        drop(state);
        // Safety: as in write_byte.
        Some(unsafe { *kva.as_ptr::<u8>().add(va.page_offset()) })
    }
}

impl Default for SimPageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PageTable for SimPageTable {
    fn map(&mut self, va: VirtAddr, kva: VirtAddr, writable: bool) -> bool {
        let mut state = self.0.lock().unwrap();
        if state.fail_next_map {
            state.fail_next_map = false;
            return false;
        }
        if state.maps.contains_key(&va) {
            return false;
        }
        state.maps.insert(
            va,
            SimMapping {
                kva,
                writable,
                accessed: false,
                dirty: false,
            },
        );
        true
    }

    fn unmap(&mut self, va: VirtAddr) {
        self.0.lock().unwrap().maps.remove(&va.page_round_down());
    }

    fn is_mapped(&self, va: VirtAddr) -> bool {
        self.0
            .lock()
            .unwrap()
            .maps
            .contains_key(&va.page_round_down())
    }

    fn is_accessed(&self, va: VirtAddr) -> bool {
        self.mapping(va).map(|m| m.accessed).unwrap_or(false)
    }

    fn set_accessed(&mut self, va: VirtAddr, accessed: bool) {
        if let Some(m) = self.0.lock().unwrap().maps.get_mut(&va.page_round_down()) {
            m.accessed = accessed;
        }
    }

    fn is_dirty(&self, va: VirtAddr) -> bool {
        self.mapping(va).map(|m| m.dirty).unwrap_or(false)
    }

    fn set_dirty(&mut self, va: VirtAddr, dirty: bool) {
        if let Some(m) = self.0.lock().unwrap().maps.get_mut(&va.page_round_down()) {
            m.dirty = dirty;
        }
    }
}

// ----------------------------------------------------------------------
// Frame pool
// ----------------------------------------------------------------------

#[repr(align(4096))]
struct FrameBuf([u8; PAGE_SIZE]);

struct PoolState {
    capacity: usize,
    live: BTreeMap<usize, Box<FrameBuf>>,
    free: Vec<Box<FrameBuf>>,
}

/// Bounded frame pool backed by heap frames.
///
/// `capacity` is the number of frames that may be live at once; a test
/// that wants eviction makes it small. Freed frames are recycled, so a
/// once-seen kernel address stays valid for the whole test.
#[derive(Clone)]
pub struct SimFramePool(Arc<Mutex<PoolState>>);

impl SimFramePool {
    pub fn new(capacity: usize) -> Self {
        Self(Arc::new(Mutex::new(PoolState {
            capacity,
            live: BTreeMap::new(),
            free: Vec::new(),
        })))
    }

    /// Number of frames currently handed out
    pub fn live_frames(&self) -> usize {
        self.0.lock().unwrap().live.len()
    }
}

impl FramePool for SimFramePool {
    fn alloc_user_page(&mut self, zero: bool) -> Option<VirtAddr> {
        let mut state = self.0.lock().unwrap();
        if state.live.len() >= state.capacity {
            return None;
        }
        let mut buf = state
            .free
            .pop()
            .unwrap_or_else(|| Box::new(FrameBuf([0; PAGE_SIZE])));
        if zero {
            buf.0.fill(0);
        }
        let kva = buf.0.as_ptr() as usize;
        state.live.insert(kva, buf);
        Some(VirtAddr::new(kva))
    }

    fn free_user_page(&mut self, kva: VirtAddr) {
        let mut state = self.0.lock().unwrap();
        if let Some(buf) = state.live.remove(&kva.as_usize()) {
            state.free.push(buf);
        }
    }
}

// ----------------------------------------------------------------------
// Swap device
// ----------------------------------------------------------------------

struct SwapState {
    sectors: Vec<[u8; SECTOR_SIZE]>,
    fail_io: bool,
}

/// In-memory swap disk with fixed sector count
#[derive(Clone)]
pub struct SimSwapDevice(Arc<Mutex<SwapState>>);

impl SimSwapDevice {
    pub fn new(sector_count: usize) -> Self {
        Self(Arc::new(Mutex::new(SwapState {
            sectors: vec![[0; SECTOR_SIZE]; sector_count],
            fail_io: false,
        })))
    }

    /// Make every subsequent sector transfer fail
    pub fn fail_io(&self) {
        self.0.lock().unwrap().fail_io = true;
    }
}

impl SwapDevice for SimSwapDevice {
    fn sector_count(&self) -> u64 {
        self.0.lock().unwrap().sectors.len() as u64
    }

    fn read_sector(&mut self, sector: u64, buf: &mut [u8]) -> Result<(), SwapError> {
        let state = self.0.lock().unwrap();
        if state.fail_io {
            return Err(SwapError::ReadFailed);
        }
        let data = state
            .sectors
            .get(sector as usize)
            .ok_or(SwapError::ReadFailed)?;
        buf.copy_from_slice(data);
        Ok(())
    }

    fn write_sector(&mut self, sector: u64, buf: &[u8]) -> Result<(), SwapError> {
        let mut state = self.0.lock().unwrap();
        if state.fail_io {
            return Err(SwapError::WriteFailed);
        }
        let data = state
            .sectors
            .get_mut(sector as usize)
            .ok_or(SwapError::WriteFailed)?;
        data.copy_from_slice(buf);
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Filesystem
// ----------------------------------------------------------------------

struct FsState {
    files: Vec<Vec<u8>>,
    handles: BTreeMap<u64, usize>,
    next_handle: u64,
}

/// In-memory filesystem with reopenable positional cursors
#[derive(Clone)]
pub struct SimFileSystem(Arc<Mutex<FsState>>);

impl SimFileSystem {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(FsState {
            files: Vec::new(),
            handles: BTreeMap::new(),
            next_handle: 1,
        })))
    }

    /// Create a file with the given contents and return a handle to it
    pub fn create_file(&self, data: &[u8]) -> FileHandle {
        let mut state = self.0.lock().unwrap();
        let index = state.files.len();
        state.files.push(data.to_vec());
        let handle = state.next_handle;
        state.next_handle += 1;
        state.handles.insert(handle, index);
        FileHandle(handle)
    }

    /// Current contents of the file behind `handle`
    pub fn contents(&self, handle: FileHandle) -> Vec<u8> {
        let state = self.0.lock().unwrap();
        let index = state.handles[&handle.0];
        state.files[index].clone()
    }

    /// Number of open handles (original creations plus live reopens)
    pub fn open_handles(&self) -> usize {
        self.0.lock().unwrap().handles.len()
    }
}

impl Default for SimFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem for SimFileSystem {
    fn reopen(&mut self, file: FileHandle) -> Result<FileHandle, FsError> {
        let mut state = self.0.lock().unwrap();
        let index = *state.handles.get(&file.0).ok_or(FsError::BadHandle)?;
        let handle = state.next_handle;
        state.next_handle += 1;
        state.handles.insert(handle, index);
        Ok(FileHandle(handle))
    }

    fn close(&mut self, file: FileHandle) {
        self.0.lock().unwrap().handles.remove(&file.0);
    }

    fn length(&mut self, file: FileHandle) -> Result<u64, FsError> {
        let state = self.0.lock().unwrap();
        let index = *state.handles.get(&file.0).ok_or(FsError::BadHandle)?;
        Ok(state.files[index].len() as u64)
    }

    fn read_at(&mut self, file: FileHandle, buf: &mut [u8], ofs: u64) -> Result<usize, FsError> {
        let state = self.0.lock().unwrap();
        let index = *state.handles.get(&file.0).ok_or(FsError::BadHandle)?;
        let data = &state.files[index];
        let ofs = ofs as usize;
        if ofs >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - ofs);
        buf[..n].copy_from_slice(&data[ofs..ofs + n]);
        Ok(n)
    }

    fn write_at(&mut self, file: FileHandle, buf: &[u8], ofs: u64) -> Result<usize, FsError> {
        let mut state = self.0.lock().unwrap();
        let index = *state.handles.get(&file.0).ok_or(FsError::BadHandle)?;
        let data = &mut state.files[index];
        let ofs = ofs as usize;
        // Files do not grow through mapped writes.
        if ofs >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - ofs);
        data[ofs..ofs + n].copy_from_slice(&buf[..n]);
        Ok(n)
    }
}
