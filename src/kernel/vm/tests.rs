// src/kernel/vm/tests.rs
//! End-to-end scenarios for the VM service
//!
//! Drives the whole subsystem against simulated hardware: faults are
//! raised by emulated user loads and stores, the frame pool is bounded to
//! force eviction, and the swap device and filesystem are inspectable
//! from the outside.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::constants::{PAGE_SIZE, SECTORS_PER_PAGE, STACK_MAX, USER_STACK};
use crate::kernel::core::traits::{FileSystem, PageTable as _};
use crate::kernel::mm::VirtAddr;
use crate::kernel::process::Pid;
use crate::kernel::vm::{TrapFrame, Vm};
use crate::testkit::{SimFileSystem, SimFramePool, SimPageTable, SimSwapDevice};

struct Harness {
    vm: Vm,
    fs: SimFileSystem,
    pool: SimFramePool,
}

/// Build a VM over simulated services: `frames` bounds the user pool,
/// `swap_slots` sizes the swap device.
fn harness(frames: usize, swap_slots: usize) -> Harness {
    let fs = SimFileSystem::new();
    let pool = SimFramePool::new(frames);
    let swap = SimSwapDevice::new(swap_slots * SECTORS_PER_PAGE);
    let fs_handle = Arc::new(Mutex::new(Box::new(fs.clone()) as Box<dyn FileSystem>));
    let vm = Vm::new(Box::new(pool.clone()), Box::new(swap), fs_handle);
    Harness { vm, fs, pool }
}

impl Harness {
    fn spawn(&mut self) -> (Pid, SimPageTable) {
        let pt = SimPageTable::new();
        let pid = self.vm.create_process(Box::new(pt.clone()));
        (pid, pt)
    }
}

/// Emulated user store: raises and handles the fault like the exception
/// path would, then retries the access once.
fn user_write(
    vm: &mut Vm,
    pt: &SimPageTable,
    pid: Pid,
    va: VirtAddr,
    rsp: VirtAddr,
    value: u8,
) -> bool {
    if pt.write_byte(va, value).is_some() {
        return true;
    }
    let not_present = pt.mapping(va).is_none();
    let frame = TrapFrame { rsp };
    if !vm.try_handle_fault(pid, &frame, va, true, true, not_present) {
        return false;
    }
    pt.write_byte(va, value).is_some()
}

/// Emulated user load with the same fault protocol
fn user_read(vm: &mut Vm, pt: &SimPageTable, pid: Pid, va: VirtAddr, rsp: VirtAddr) -> Option<u8> {
    if let Some(value) = pt.read_byte(va) {
        return Some(value);
    }
    let not_present = pt.mapping(va).is_none();
    let frame = TrapFrame { rsp };
    if !vm.try_handle_fault(pid, &frame, va, true, false, not_present) {
        return None;
    }
    pt.read_byte(va)
}

// ----------------------------------------------------------------------
// Stack growth
// ----------------------------------------------------------------------

#[test]
fn test_lazy_stack_push() {
    let mut h = harness(4, 4);
    let (pid, pt) = h.spawn();

    // A push at the top of the empty stack region faults, grows the
    // stack by one page and retries successfully.
    let addr = VirtAddr::new(USER_STACK - 8);
    let rsp = VirtAddr::new(USER_STACK - 8);
    assert!(user_write(&mut h.vm, &pt, pid, addr, rsp, 0x5A));

    let page = h.vm.process(pid).unwrap().spt.find(addr).unwrap();
    assert_eq!(page.va, VirtAddr::new(USER_STACK - PAGE_SIZE));
    assert_eq!(user_read(&mut h.vm, &pt, pid, addr, rsp), Some(0x5A));
}

#[test]
fn test_fault_above_stack_region_kills() {
    let mut h = harness(4, 4);
    let (pid, pt) = h.spawn();

    let addr = VirtAddr::new(USER_STACK + PAGE_SIZE);
    let rsp = VirtAddr::new(USER_STACK);
    assert!(!user_write(&mut h.vm, &pt, pid, addr, rsp, 1));
    assert!(h.vm.process(pid).unwrap().spt.find(addr).is_none());
}

#[test]
fn test_fault_below_stack_limit_kills() {
    let mut h = harness(4, 4);
    let (pid, pt) = h.spawn();

    // Inside the slack of rsp but deeper than STACK_MAX below USER_STACK.
    let addr = VirtAddr::new(USER_STACK - STACK_MAX - PAGE_SIZE);
    let rsp = VirtAddr::new(USER_STACK - STACK_MAX - PAGE_SIZE);
    assert!(!user_write(&mut h.vm, &pt, pid, addr, rsp, 1));
}

#[test]
fn test_fault_far_below_rsp_kills() {
    let mut h = harness(4, 4);
    let (pid, pt) = h.spawn();

    let rsp = VirtAddr::new(USER_STACK);
    let addr = VirtAddr::new(USER_STACK - 64 * 1024);
    assert!(!user_write(&mut h.vm, &pt, pid, addr, rsp, 1));
}

#[test]
fn test_kernel_fault_uses_latched_rsp() {
    let mut h = harness(4, 4);
    let (pid, pt) = h.spawn();

    let addr = VirtAddr::new(USER_STACK - 16);
    let bogus = TrapFrame {
        rsp: VirtAddr::new(0xFFFF_8000_0000_0000),
    };

    // Without a latched rsp a kernel-side fault cannot be attributed.
    assert!(!h.vm.try_handle_fault(pid, &bogus, addr, false, true, true));

    crate::kernel::syscall::syscall_enter(&mut h.vm, pid, VirtAddr::new(USER_STACK - 16));
    assert!(h.vm.try_handle_fault(pid, &bogus, addr, false, true, true));
    assert!(pt.is_mapped(addr));
}

// ----------------------------------------------------------------------
// Anonymous pages and swap
// ----------------------------------------------------------------------

#[test]
fn test_swap_round_trip_under_pressure() {
    const FRAMES: usize = 4;
    const PAGES: usize = 8;

    let mut h = harness(FRAMES, 16);
    let (pid, pt) = h.spawn();
    let rsp = VirtAddr::new(USER_STACK);
    let base = 0x2000_0000usize;

    for i in 0..PAGES {
        let va = VirtAddr::new(base + i * PAGE_SIZE);
        h.vm.alloc_page(pid, va, true).unwrap();
        assert!(user_write(&mut h.vm, &pt, pid, va, rsp, i as u8 + 1));
    }

    // The pool is four frames deep, so at most four pages are resident
    // and the overflow lives in swap slots.
    assert!(h.pool.live_frames() <= FRAMES);
    let (_, used) = h.vm.swap_stats();
    assert!(used <= PAGES - FRAMES);

    for i in (0..PAGES).rev() {
        let va = VirtAddr::new(base + i * PAGE_SIZE);
        assert_eq!(
            user_read(&mut h.vm, &pt, pid, va, rsp),
            Some(i as u8 + 1),
            "page {} lost its contents across swap",
            i
        );
    }

    let (_, used) = h.vm.swap_stats();
    assert!(used <= PAGES - FRAMES);
    assert!(h.pool.live_frames() <= FRAMES);
}

#[test]
fn test_fresh_anon_page_reads_zero() {
    let mut h = harness(2, 4);
    let (pid, pt) = h.spawn();
    let va = VirtAddr::new(0x2000_0000);

    h.vm.alloc_page(pid, va, true).unwrap();
    let rsp = VirtAddr::new(USER_STACK);
    assert_eq!(user_read(&mut h.vm, &pt, pid, va, rsp), Some(0));
    assert_eq!(
        user_read(
            &mut h.vm,
            &pt,
            pid,
            VirtAddr::new(0x2000_0000 + PAGE_SIZE - 1),
            rsp
        ),
        Some(0)
    );
}

#[test]
fn test_evicted_frame_is_rezeroed_for_fresh_page() {
    let mut h = harness(1, 4);
    let (pid, pt) = h.spawn();
    let rsp = VirtAddr::new(USER_STACK);

    let dirty_va = VirtAddr::new(0x2000_0000);
    h.vm.alloc_page(pid, dirty_va, true).unwrap();
    assert!(user_write(&mut h.vm, &pt, pid, dirty_va, rsp, 0xEE));

    // The only frame gets recycled for the second page; the previous
    // owner's bytes must not shine through.
    let fresh_va = VirtAddr::new(0x3000_0000);
    h.vm.alloc_page(pid, fresh_va, true).unwrap();
    assert_eq!(user_read(&mut h.vm, &pt, pid, fresh_va, rsp), Some(0));
}

#[test]
fn test_second_chance_prefers_cold_pages() {
    let mut h = harness(2, 8);
    let (pid, pt) = h.spawn();
    let rsp = VirtAddr::new(USER_STACK);

    let hot = VirtAddr::new(0x2000_0000);
    let cold = VirtAddr::new(0x2000_1000);
    let newcomer = VirtAddr::new(0x2000_2000);
    for va in [hot, cold] {
        h.vm.alloc_page(pid, va, true).unwrap();
        assert!(user_write(&mut h.vm, &pt, pid, va, rsp, 7));
    }

    // Both pages carry the accessed bit from the writes above; clear the
    // cold page's bit so the clock passes over the hot one.
    let mut hw = pt.clone();
    hw.set_accessed(cold, false);

    h.vm.alloc_page(pid, newcomer, true).unwrap();
    assert!(user_write(&mut h.vm, &pt, pid, newcomer, rsp, 7));

    assert!(pt.is_mapped(hot), "hot page should have survived eviction");
    assert!(!pt.is_mapped(cold), "cold page should have been evicted");
}

#[test]
#[should_panic(expected = "swap device full")]
fn test_swap_exhaustion_is_fatal() {
    let mut h = harness(1, 0);
    let (pid, pt) = h.spawn();
    let rsp = VirtAddr::new(USER_STACK);

    let first = VirtAddr::new(0x2000_0000);
    h.vm.alloc_page(pid, first, true).unwrap();
    assert!(user_write(&mut h.vm, &pt, pid, first, rsp, 1));

    // No swap slot exists for the victim.
    let second = VirtAddr::new(0x2000_1000);
    h.vm.alloc_page(pid, second, true).unwrap();
    let _ = user_write(&mut h.vm, &pt, pid, second, rsp, 2);
}

// ----------------------------------------------------------------------
// Lazily loaded segments
// ----------------------------------------------------------------------

#[test]
fn test_segment_loads_lazily_and_swaps_as_anon() {
    let mut h = harness(1, 4);
    let (pid, pt) = h.spawn();
    let rsp = VirtAddr::new(USER_STACK);

    let mut image = Vec::new();
    for i in 0..PAGE_SIZE {
        image.push((i % 199) as u8);
    }
    image.extend_from_slice(&[0xCC; 100]);
    let exe = h.fs.create_file(&image);

    let seg = VirtAddr::new(0x0040_0000);
    h.vm
        .load_segment(pid, exe, 0, seg, PAGE_SIZE + 100, PAGE_SIZE - 100, true)
        .unwrap();

    // Nothing is resident until the first touch.
    assert!(!pt.is_mapped(seg));
    assert_eq!(user_read(&mut h.vm, &pt, pid, seg, rsp), Some(0));
    assert_eq!(
        user_read(&mut h.vm, &pt, pid, VirtAddr::new(seg.as_usize() + 198), rsp),
        Some(198 % 199)
    );

    // Overwrite a byte, then force the page out through pool pressure on
    // the second segment page. Segment pages are anonymous: the copy goes
    // to swap, not back to the executable.
    assert!(user_write(&mut h.vm, &pt, pid, seg, rsp, 0x77));
    let tail = VirtAddr::new(seg.as_usize() + PAGE_SIZE + 50);
    assert_eq!(user_read(&mut h.vm, &pt, pid, tail, rsp), Some(0xCC));
    assert!(!pt.is_mapped(seg));
    let (_, used) = h.vm.swap_stats();
    assert_eq!(used, 1);
    assert_eq!(h.fs.contents(exe)[0], 0, "segment write leaked into file");

    // The zero tail of the second page is beyond the 100 seeded bytes.
    let zero_byte = VirtAddr::new(seg.as_usize() + PAGE_SIZE + 200);
    assert_eq!(user_read(&mut h.vm, &pt, pid, zero_byte, rsp), Some(0));

    // Faulting the first page back restores the written byte.
    assert_eq!(user_read(&mut h.vm, &pt, pid, seg, rsp), Some(0x77));
}

#[test]
fn test_segment_read_past_eof_destroys_page() {
    let mut h = harness(2, 4);
    let (pid, pt) = h.spawn();
    let rsp = VirtAddr::new(USER_STACK);

    let exe = h.fs.create_file(&[1, 2, 3]);
    let seg = VirtAddr::new(0x0040_0000);
    // Claims to have a full page of initialized bytes; the read comes up
    // short and the first touch fails.
    h.vm
        .load_segment(pid, exe, 0, seg, PAGE_SIZE, 0, true)
        .unwrap();

    assert!(user_read(&mut h.vm, &pt, pid, seg, rsp).is_none());
    // The failed initialization destroyed the page outright.
    assert!(h.vm.process(pid).unwrap().spt.find(seg).is_none());
    assert_eq!(h.pool.live_frames(), 0);
}

// ----------------------------------------------------------------------
// mmap / munmap
// ----------------------------------------------------------------------

#[test]
fn test_mmap_reads_file_and_zero_tail() {
    let mut h = harness(4, 4);
    let (pid, pt) = h.spawn();
    let rsp = VirtAddr::new(USER_STACK);

    let file = h.fs.create_file(&[b'A'; 5000]);
    let addr = VirtAddr::new(0x1000_0000);
    let mapped = h.vm.do_mmap(pid, addr, 5000, false, file, 0);
    assert_eq!(mapped, Some(addr));

    // Last initialized byte of the mapping.
    let last = VirtAddr::new(addr.as_usize() + 4999);
    assert_eq!(user_read(&mut h.vm, &pt, pid, last, rsp), Some(b'A'));

    // One past the file: still inside the second mapped page, zero-filled.
    let past = VirtAddr::new(addr.as_usize() + 5000);
    assert_eq!(user_read(&mut h.vm, &pt, pid, past, rsp), Some(0));
}

#[test]
fn test_mmap_write_back_on_munmap() {
    let mut h = harness(4, 4);
    let (pid, pt) = h.spawn();
    let rsp = VirtAddr::new(USER_STACK);

    let file = h.fs.create_file(b"0123456789");
    let addr = VirtAddr::new(0x1000_0000);
    assert!(h.vm.do_mmap(pid, addr, 10, true, file, 0).is_some());

    for (i, b) in b"abcdefghij".iter().enumerate() {
        let va = VirtAddr::new(addr.as_usize() + i);
        assert!(user_write(&mut h.vm, &pt, pid, va, rsp, *b));
    }
    h.vm.do_munmap(pid, addr);

    assert_eq!(h.fs.contents(file), b"abcdefghij".to_vec());
    // The mapping is gone and the reopened cursor is closed.
    assert!(h.vm.process(pid).unwrap().spt.find(addr).is_none());
    assert_eq!(h.fs.open_handles(), 1);
}

#[test]
fn test_munmap_removes_every_page_of_mapping() {
    let mut h = harness(4, 4);
    let (pid, pt) = h.spawn();

    let file = h.fs.create_file(&[7; 3 * PAGE_SIZE]);
    let addr = VirtAddr::new(0x1000_0000);
    assert!(h.vm.do_mmap(pid, addr, 3 * PAGE_SIZE, false, file, 0).is_some());
    assert_eq!(h.vm.process(pid).unwrap().spt.len(), 3);

    h.vm.do_munmap(pid, addr);
    for i in 0..3 {
        let va = VirtAddr::new(addr.as_usize() + i * PAGE_SIZE);
        assert!(h.vm.process(pid).unwrap().spt.find(va).is_none());
        assert!(!pt.is_mapped(va));
    }
    // Unmapping again is harmless.
    h.vm.do_munmap(pid, addr);
}

#[test]
fn test_munmap_stops_at_foreign_mapping() {
    let mut h = harness(8, 4);
    let (pid, _pt) = h.spawn();

    let file_a = h.fs.create_file(&[1; 2 * PAGE_SIZE]);
    let file_b = h.fs.create_file(&[2; PAGE_SIZE]);
    let a = VirtAddr::new(0x1000_0000);
    let b = VirtAddr::new(0x1000_0000 + 2 * PAGE_SIZE);
    assert!(h.vm.do_mmap(pid, a, 2 * PAGE_SIZE, false, file_a, 0).is_some());
    assert!(h.vm.do_mmap(pid, b, PAGE_SIZE, false, file_b, 0).is_some());

    h.vm.do_munmap(pid, a);
    assert!(h.vm.process(pid).unwrap().spt.find(a).is_none());
    // The adjacent mapping of another file survives.
    assert!(h.vm.process(pid).unwrap().spt.find(b).is_some());
}

#[test]
fn test_mmap_rejects_bad_arguments() {
    let mut h = harness(4, 4);
    let (pid, _pt) = h.spawn();
    let file = h.fs.create_file(&[0; 64]);
    let addr = VirtAddr::new(0x1000_0000);

    // Zero length.
    assert!(h.vm.do_mmap(pid, addr, 0, false, file, 0).is_none());
    // Misaligned address.
    assert!(
        h.vm.do_mmap(pid, VirtAddr::new(0x1000_0800), 64, false, file, 0)
            .is_none()
    );
    // Null address.
    assert!(h.vm.do_mmap(pid, VirtAddr::zero(), 64, false, file, 0).is_none());
    // Misaligned offset.
    assert!(h.vm.do_mmap(pid, addr, 64, false, file, 512).is_none());
    // Kernel-side address.
    assert!(
        h.vm.do_mmap(pid, VirtAddr::new(0xFFFF_8000_0000_0000), 64, false, file, 0)
            .is_none()
    );
    // Range that crosses out of user space.
    assert!(
        h.vm.do_mmap(pid, VirtAddr::new(0x7FFF_FFFF_F000), 2 * PAGE_SIZE, false, file, 0)
            .is_none()
    );

    // No state was touched.
    assert_eq!(h.vm.process(pid).unwrap().spt.len(), 0);
    assert_eq!(h.fs.open_handles(), 1);
}

#[test]
fn test_mmap_rejects_overlap_untouched() {
    let mut h = harness(4, 4);
    let (pid, _pt) = h.spawn();
    let file = h.fs.create_file(&[9; 3 * PAGE_SIZE]);
    let addr = VirtAddr::new(0x1000_0000);

    // A page in the middle of the requested range is already reserved.
    let blocker = VirtAddr::new(addr.as_usize() + PAGE_SIZE);
    h.vm.alloc_page(pid, blocker, true).unwrap();

    assert!(h.vm.do_mmap(pid, addr, 3 * PAGE_SIZE, false, file, 0).is_none());
    assert!(h.vm.process(pid).unwrap().spt.find(addr).is_none());
    assert_eq!(h.vm.process(pid).unwrap().spt.len(), 1);
    assert_eq!(h.fs.open_handles(), 1);
}

#[test]
fn test_write_fault_on_readonly_mapping_kills() {
    let mut h = harness(4, 4);
    let (pid, pt) = h.spawn();
    let rsp = VirtAddr::new(USER_STACK);

    let file = h.fs.create_file(&[3; PAGE_SIZE]);
    let addr = VirtAddr::new(0x1000_0000);
    assert!(h.vm.do_mmap(pid, addr, PAGE_SIZE, false, file, 0).is_some());

    // Fault the page in read-only, then attempt a store.
    assert_eq!(user_read(&mut h.vm, &pt, pid, addr, rsp), Some(3));
    assert!(!user_write(&mut h.vm, &pt, pid, addr, rsp, 1));
    assert_eq!(h.fs.contents(file)[0], 3);
}

// ----------------------------------------------------------------------
// Eviction of file-backed pages
// ----------------------------------------------------------------------

#[test]
fn test_file_page_round_trip_read_only() {
    let mut h = harness(4, 4);
    let (pid, pt) = h.spawn();
    let rsp = VirtAddr::new(USER_STACK);

    let file = h.fs.create_file(&[b'Q'; 100]);
    let addr = VirtAddr::new(0x1000_0000);
    assert!(h.vm.do_mmap(pid, addr, 100, false, file, 0).is_some());
    assert_eq!(user_read(&mut h.vm, &pt, pid, addr, rsp), Some(b'Q'));

    h.vm.swap_out_page(pid, addr).unwrap();
    assert!(!pt.is_mapped(addr));
    // No swap slot is consumed: the file itself is the backing store.
    assert_eq!(h.vm.swap_stats().1, 0);

    assert_eq!(user_read(&mut h.vm, &pt, pid, addr, rsp), Some(b'Q'));
    let tail = VirtAddr::new(addr.as_usize() + 100);
    assert_eq!(user_read(&mut h.vm, &pt, pid, tail, rsp), Some(0));
}

#[test]
fn test_dirty_writable_page_written_back_on_eviction() {
    let mut h = harness(4, 4);
    let (pid, pt) = h.spawn();
    let rsp = VirtAddr::new(USER_STACK);

    let file = h.fs.create_file(&[b'.'; 32]);
    let addr = VirtAddr::new(0x1000_0000);
    assert!(h.vm.do_mmap(pid, addr, 32, true, file, 0).is_some());
    assert!(user_write(&mut h.vm, &pt, pid, addr, rsp, b'X'));

    h.vm.swap_out_page(pid, addr).unwrap();
    assert_eq!(h.fs.contents(file)[0], b'X');

    // Faulting back in re-reads the updated file contents.
    assert_eq!(user_read(&mut h.vm, &pt, pid, addr, rsp), Some(b'X'));
}

#[test]
fn test_readonly_page_never_written_back() {
    let mut h = harness(4, 4);
    let (pid, pt) = h.spawn();
    let rsp = VirtAddr::new(USER_STACK);

    let file = h.fs.create_file(&[b'.'; 32]);
    let addr = VirtAddr::new(0x1000_0000);
    assert!(h.vm.do_mmap(pid, addr, 32, false, file, 0).is_some());
    assert_eq!(user_read(&mut h.vm, &pt, pid, addr, rsp), Some(b'.'));

    // Even with the hardware dirty bit forced on, a read-only mapping is
    // dropped, not written back.
    let mut hw = pt.clone();
    hw.set_dirty(addr, true);
    h.vm.swap_out_page(pid, addr).unwrap();
    assert_eq!(h.fs.contents(file)[0], b'.');
}

// ----------------------------------------------------------------------
// Claim failures
// ----------------------------------------------------------------------

#[test]
fn test_map_failure_unwinds_claim() {
    let mut h = harness(2, 4);
    let (pid, pt) = h.spawn();
    let rsp = VirtAddr::new(USER_STACK);

    let va = VirtAddr::new(0x2000_0000);
    h.vm.alloc_page(pid, va, true).unwrap();

    pt.fail_next_map();
    assert!(!user_write(&mut h.vm, &pt, pid, va, rsp, 1));
    // The frame went back to the pool and the page is still claimable.
    assert_eq!(h.pool.live_frames(), 0);
    assert!(user_write(&mut h.vm, &pt, pid, va, rsp, 1));
}

// ----------------------------------------------------------------------
// Fork
// ----------------------------------------------------------------------

#[test]
fn test_fork_duplicates_anon_privately() {
    let mut h = harness(8, 8);
    let (parent, ppt) = h.spawn();
    let rsp = VirtAddr::new(USER_STACK);

    let va = VirtAddr::new(0x2000_0000);
    h.vm.alloc_page(parent, va, true).unwrap();
    assert!(user_write(&mut h.vm, &ppt, parent, va, rsp, 0xAB));

    let cpt = SimPageTable::new();
    let child = h.vm.fork(parent, Box::new(cpt.clone())).unwrap();

    assert_eq!(user_read(&mut h.vm, &cpt, child, va, rsp), Some(0xAB));

    // Independent backing: the parent's later write is invisible to the
    // child, and vice versa.
    assert!(user_write(&mut h.vm, &ppt, parent, va, rsp, 0xCD));
    assert_eq!(user_read(&mut h.vm, &cpt, child, va, rsp), Some(0xAB));
    assert!(user_write(&mut h.vm, &cpt, child, va, rsp, 0xEF));
    assert_eq!(user_read(&mut h.vm, &ppt, parent, va, rsp), Some(0xCD));
}

#[test]
fn test_fork_duplicates_swapped_anon_page() {
    let mut h = harness(2, 8);
    let (parent, ppt) = h.spawn();
    let rsp = VirtAddr::new(USER_STACK);

    let va = VirtAddr::new(0x2000_0000);
    h.vm.alloc_page(parent, va, true).unwrap();
    assert!(user_write(&mut h.vm, &ppt, parent, va, rsp, 0x42));
    // Push the page out to swap before forking.
    h.vm.swap_out_page(parent, va).unwrap();

    let cpt = SimPageTable::new();
    let child = h.vm.fork(parent, Box::new(cpt.clone())).unwrap();
    assert_eq!(user_read(&mut h.vm, &cpt, child, va, rsp), Some(0x42));
}

#[test]
fn test_fork_copies_pending_and_file_pages() {
    let mut h = harness(8, 8);
    let (parent, ppt) = h.spawn();
    let rsp = VirtAddr::new(USER_STACK);

    let file = h.fs.create_file(&[b'F'; 2 * PAGE_SIZE]);
    let mapped = VirtAddr::new(0x1000_0000);
    assert!(h.vm.do_mmap(parent, mapped, 2 * PAGE_SIZE, false, file, 0).is_some());
    // Touch only the first page; the second stays pending.
    assert_eq!(user_read(&mut h.vm, &ppt, parent, mapped, rsp), Some(b'F'));

    let cpt = SimPageTable::new();
    let child = h.vm.fork(parent, Box::new(cpt.clone())).unwrap();

    // The touched page was claimed during the copy; the pending one loads
    // on the child's first fault.
    let second = VirtAddr::new(mapped.as_usize() + PAGE_SIZE);
    assert_eq!(user_read(&mut h.vm, &cpt, child, mapped, rsp), Some(b'F'));
    assert_eq!(user_read(&mut h.vm, &cpt, child, second, rsp), Some(b'F'));

    // Each duplicated record reopened its own cursor; unmapping in the
    // child leaves the parent's mapping working.
    h.vm.do_munmap(child, mapped);
    assert_eq!(user_read(&mut h.vm, &ppt, parent, second, rsp), Some(b'F'));
}

// ----------------------------------------------------------------------
// Teardown
// ----------------------------------------------------------------------

#[test]
fn test_process_exit_releases_everything() {
    let mut h = harness(2, 8);
    let (pid, pt) = h.spawn();
    let rsp = VirtAddr::new(USER_STACK);

    // A stack page, anon pages spilled to swap, and a dirty mapping.
    h.vm.setup_stack(pid).unwrap();
    for i in 0..3 {
        let va = VirtAddr::new(0x2000_0000 + i * PAGE_SIZE);
        h.vm.alloc_page(pid, va, true).unwrap();
        assert!(user_write(&mut h.vm, &pt, pid, va, rsp, i as u8 + 1));
    }
    let file = h.fs.create_file(&[b'o'; 16]);
    let mapped = VirtAddr::new(0x1000_0000);
    assert!(h.vm.do_mmap(pid, mapped, 16, true, file, 0).is_some());
    assert!(user_write(&mut h.vm, &pt, pid, mapped, rsp, b'W'));

    h.vm.process_exit(pid, 0);

    // Every frame and swap slot is released, the dirty page reached the
    // file, the reopened cursor is closed.
    assert_eq!(h.pool.live_frames(), 0);
    assert_eq!(h.vm.swap_stats().1, 0);
    assert_eq!(h.vm.frame_stats().0, 0);
    assert_eq!(h.fs.contents(file)[0], b'W');
    assert_eq!(h.fs.open_handles(), 1);
    assert!(h.vm.process(pid).is_err());
}

#[test]
fn test_dealloc_page_releases_swap_slot() {
    let mut h = harness(2, 8);
    let (pid, pt) = h.spawn();
    let rsp = VirtAddr::new(USER_STACK);

    let va = VirtAddr::new(0x2000_0000);
    h.vm.alloc_page(pid, va, true).unwrap();
    assert!(user_write(&mut h.vm, &pt, pid, va, rsp, 5));
    h.vm.swap_out_page(pid, va).unwrap();
    assert_eq!(h.vm.swap_stats().1, 1);

    h.vm.dealloc_page(pid, va).unwrap();
    assert_eq!(h.vm.swap_stats().1, 0);
    assert!(h.vm.process(pid).unwrap().spt.find(va).is_none());
    assert!(h.vm.dealloc_page(pid, va).is_err());
}

// ----------------------------------------------------------------------
// Invariants
// ----------------------------------------------------------------------

#[test]
fn test_residency_duality() {
    let mut h = harness(2, 8);
    let (pid, pt) = h.spawn();
    let rsp = VirtAddr::new(USER_STACK);

    let pages: Vec<VirtAddr> = (0..4)
        .map(|i| VirtAddr::new(0x2000_0000 + i * PAGE_SIZE))
        .collect();
    for (i, va) in pages.iter().enumerate() {
        h.vm.alloc_page(pid, *va, true).unwrap();
        assert!(user_write(&mut h.vm, &pt, pid, *va, rsp, i as u8 + 1));
    }

    // For every page: a frame is recorded iff the hardware mapping
    // exists.
    for va in &pages {
        let resident = h.vm.process(pid).unwrap().spt.find(*va).unwrap().is_resident();
        assert_eq!(resident, pt.is_mapped(*va));
    }
}

#[test]
fn test_spt_lookup_rounds_to_page() {
    let mut h = harness(2, 4);
    let (pid, _pt) = h.spawn();

    let va = VirtAddr::new(0x2000_0000);
    h.vm.alloc_page(pid, va, true).unwrap();

    let proc = h.vm.process(pid).unwrap();
    assert!(proc.spt.find(VirtAddr::new(0x2000_0ABC)).is_some());
    assert!(proc.spt.find(VirtAddr::new(0x2000_1000)).is_none());
}
