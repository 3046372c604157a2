// src/kernel/vm/page.rs
//! Page model
//!
//! One `Page` per reserved virtual page. The dynamic backing state is a
//! tagged sum: every page is born `Uninit` and is transmuted into `Anon`
//! or `File` on its first fault. The frame cross-reference is an index
//! handle into the frame table, broken explicitly on eviction and destroy.

use alloc::sync::Arc;

use crate::constants::PAGE_SIZE;
use crate::kernel::core::traits::FileHandle;
use crate::kernel::mm::{FrameId, SwapSlot, VirtAddr};

/// The reopened file cursor shared by the pages of one mapping.
///
/// `Arc` strong counts track how many pages still reference the cursor;
/// when the last owning reference is dropped, the handle is closed through
/// the filesystem service. Lazy-loaded executable segments borrow the
/// loader's handle instead (`owned == false`) and never close it.
#[derive(Debug)]
pub struct MappedFile {
    pub handle: FileHandle,
    pub owned: bool,
}

/// Shared reference to a mapping's file cursor
pub type FileShare = Arc<MappedFile>;

/// One page worth of file backing: read `read_bytes` at `ofs`, then
/// zero-fill the remaining `zero_bytes`.
#[derive(Debug, Clone)]
pub struct FileSpan {
    pub share: FileShare,
    pub ofs: u64,
    pub read_bytes: usize,
    pub zero_bytes: usize,
}

impl FileSpan {
    pub fn new(share: FileShare, ofs: u64, read_bytes: usize) -> Self {
        debug_assert!(read_bytes <= PAGE_SIZE);
        Self {
            share,
            ofs,
            read_bytes,
            zero_bytes: PAGE_SIZE - read_bytes,
        }
    }

    /// Handle of the underlying file cursor
    pub fn handle(&self) -> FileHandle {
        self.share.handle
    }
}

/// What an uninitialized page will become on first touch.
///
/// An optional span seeds the first-touch contents: segments loaded lazily
/// from the executable are `Anon` pages with a seed, `mmap` pages are
/// `File` pages whose span stays with them for their whole life.
#[derive(Debug, Clone)]
pub enum PageFuture {
    Anon { seed: Option<FileSpan> },
    File { span: FileSpan },
}

/// Payload of a page that has not been touched yet
#[derive(Debug)]
pub struct UninitPage {
    pub future: PageFuture,
}

/// Payload of an anonymous page; `swap_slot` is set exactly while the
/// contents live on the swap device
#[derive(Debug)]
pub struct AnonPage {
    pub swap_slot: Option<SwapSlot>,
}

/// Payload of a file-backed page
#[derive(Debug)]
pub struct FilePage {
    pub span: FileSpan,
}

/// Dynamic backing state of a page
#[derive(Debug)]
pub enum PageState {
    Uninit(UninitPage),
    Anon(AnonPage),
    File(FilePage),
}

/// Discriminant of [`PageState`], for dispatch without borrowing the
/// payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingKind {
    Uninit,
    Anon,
    File,
}

/// One reserved virtual page of a user process
#[derive(Debug)]
pub struct Page {
    pub va: VirtAddr,
    pub writable: bool,
    pub frame: Option<FrameId>,
    pub state: PageState,
}

impl Page {
    /// Create a pending page; all pages are born uninitialized
    pub fn new_uninit(va: VirtAddr, writable: bool, future: PageFuture) -> Self {
        debug_assert!(va.is_page_aligned());
        Self {
            va,
            writable,
            frame: None,
            state: PageState::Uninit(UninitPage { future }),
        }
    }

    /// Whether a frame currently backs this page
    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    /// Current backing kind
    pub fn backing(&self) -> BackingKind {
        match self.state {
            PageState::Uninit(_) => BackingKind::Uninit,
            PageState::Anon(_) => BackingKind::Anon,
            PageState::File(_) => BackingKind::File,
        }
    }

    /// The mapping share of a file-kind page.
    ///
    /// Returns the share for resolved file pages and for pending pages
    /// whose future is `File`; anonymous pages (including lazily loaded
    /// segments, whose seed is only initial content) have none. Used by
    /// `munmap` to walk the pages of one mapping.
    pub fn file_share(&self) -> Option<&FileShare> {
        match &self.state {
            PageState::File(f) => Some(&f.span.share),
            PageState::Uninit(u) => match &u.future {
                PageFuture::File { span } => Some(&span.share),
                PageFuture::Anon { .. } => None,
            },
            PageState::Anon(_) => None,
        }
    }
}
