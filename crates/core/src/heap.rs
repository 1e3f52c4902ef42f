//! Per-Process Heap
//!
//! A chunked arena of variable-sized blocks. Every block begins with a
//! `Header` carrying the form pointer, a reference count and the block
//! size; the value payload follows. Blocks are 8-byte aligned.
//!
//! Reference counts have three regimes:
//! - `0`: unreachable, reclaimed at the next sweep
//! - `1..MINIMUM_READONLY_REF`: normal counted references
//! - `>= MINIMUM_READONLY_REF`: read-only; never copied, moved or freed
//!
//! A sweep cascades deletion of zero-ref blocks, slides survivors toward
//! the start of each chunk, and then rewrites every contained pointer
//! through the forms' adjust callbacks plus the caller-supplied roots.
//! Read-only blocks are pinned: they are recognized by their refcount and
//! excluded from the moving set.
//!
//! Sweeps only run at interpreter dispatch boundaries, where every live
//! value is reachable from the stack or from read-only storage. Raw
//! pointers held in host locals across a sweep would dangle.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::tagged::Val;
use crate::types::Form;

/// Initial refcount for read-only values, assigned once at initialization.
pub const INITIAL_READONLY_REF: i32 = (u32::MAX >> 2) as i32;

/// Threshold above which a refcount marks a read-only value. Kept below
/// the initial value so modest drift cannot demote a read-only block.
pub const MINIMUM_READONLY_REF: i32 = (u32::MAX >> 3) as i32;

/// Block header. Every heap and static block starts with one.
///
/// `form` is null for blocks that have been freed (or not yet claimed by a
/// factory); the walker skips them and compaction reclaims them.
#[repr(C)]
pub struct Header {
    pub(crate) form: *const Form,
    pub(crate) ref_: i32,
    pub(crate) size: u32,
}

/// Size of the block header in bytes.
pub const HEADER_SIZE: usize = std::mem::size_of::<Header>();

/// Common allocation interface for the per-process heap and the read-only
/// static heap. Factories work against this so literals and runtime values
/// share one construction path.
pub trait Alloc {
    /// Allocate a zeroed 8-aligned block of at least `size` bytes with a
    /// pre-initialized header (`form` null, refcount per allocator kind).
    fn alloc_block(&mut self, size: usize) -> *mut u8;

    /// Refcount new blocks start with: 1 on the heap, the read-only
    /// sentinel on static storage.
    fn initial_ref(&self) -> i32;
}

fn round_up(size: usize) -> usize {
    (size + 7) & !7
}

// =============================================================================
// Relocation map
// =============================================================================

/// Old-address to new-address map built during compaction and consumed by
/// the forms' `adjust_heap_ptrs` callbacks.
#[derive(Default)]
pub struct Relocation {
    map: HashMap<usize, usize>,
}

impl Relocation {
    fn insert(&mut self, old: usize, new: usize) {
        self.map.insert(old, new);
    }

    /// Post-move address of `v`. Smis, null and unmoved blocks (including
    /// all read-only blocks) come back unchanged.
    #[inline]
    pub fn relocate(&self, v: Val) -> Val {
        if v.is_ptr() && !v.is_null() {
            if let Some(&new) = self.map.get(&v.raw()) {
                // Safety: `new` is the post-move address of the same block.
                return unsafe { Val::from_raw(new) };
            }
        }
        v
    }

    /// Rewrite a slot in place.
    #[inline]
    pub fn relocate_slot(&self, slot: &mut Val) {
        *slot = self.relocate(*slot);
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

// =============================================================================
// Heap
// =============================================================================

struct Chunk {
    mem: Box<[u64]>,
    top: usize, // bytes in use from the start of `mem`
}

impl Chunk {
    fn new(bytes: usize) -> Chunk {
        Chunk {
            mem: vec![0u64; bytes.div_ceil(8)].into_boxed_slice(),
            top: 0,
        }
    }

    fn base(&self) -> *mut u8 {
        self.mem.as_ptr() as *mut u8
    }

    fn capacity(&self) -> usize {
        self.mem.len() * 8
    }
}

/// Heap statistics surfaced by the resource report.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapStats {
    pub allocated_bytes: u64,
    pub allocated_blocks: u64,
    pub sweeps: u64,
    pub chunk_bytes: usize,
    pub used_bytes: usize,
}

pub struct Heap {
    chunks: Vec<Chunk>,
    chunk_size: usize,
    sweep_threshold: usize,
    stats: HeapStats,
}

impl Heap {
    pub fn new(chunk_size: usize, sweep_threshold: usize) -> Heap {
        assert!(chunk_size >= 256, "heap chunk size too small");
        Heap {
            chunks: Vec::new(),
            chunk_size,
            sweep_threshold,
            stats: HeapStats::default(),
        }
    }

    pub fn stats(&self) -> HeapStats {
        let mut s = self.stats;
        s.chunk_bytes = self.chunks.iter().map(|c| c.capacity()).sum();
        s.used_bytes = self.used_bytes();
        s
    }

    fn used_bytes(&self) -> usize {
        self.chunks.iter().map(|c| c.top).sum()
    }

    /// Allocation headroom check, polled at dispatch boundaries.
    pub fn needs_sweep(&self) -> bool {
        self.used_bytes() >= self.sweep_threshold
    }

    /// Allocate a zeroed block. Never sweeps: mid-operation exhaustion
    /// grows a chunk instead, so raw pointers stay valid until the next
    /// dispatch boundary.
    pub fn allocate(&mut self, size: usize) -> *mut u8 {
        let size = round_up(size.max(HEADER_SIZE));
        let fits = match self.chunks.last() {
            Some(c) => c.capacity() - c.top >= size,
            None => false,
        };
        if !fits {
            self.chunks.push(Chunk::new(self.chunk_size.max(size)));
        }
        let initial_ref = self.initial_ref();
        let chunk = self.chunks.last_mut().expect("chunk just pushed");
        let p = unsafe { chunk.base().add(chunk.top) };
        chunk.top += size;
        self.stats.allocated_bytes += size as u64;
        self.stats.allocated_blocks += 1;
        unsafe {
            std::ptr::write_bytes(p, 0, size);
            let h = p as *mut Header;
            (*h).form = std::ptr::null();
            (*h).ref_ = initial_ref;
            (*h).size = size as u32;
        }
        p
    }

    /// Release a single block explicitly (used by `Form::delete`). The
    /// space is reclaimed at the next sweep.
    pub fn free(&mut self, v: Val) {
        unsafe {
            let h = v.as_raw_ptr() as *mut Header;
            debug_assert!(!(*h).form.is_null(), "double free");
            (*h).form = std::ptr::null();
        }
    }

    /// `free` with the block counted against the allocation statistics
    /// (for callers retiring blocks they accounted themselves).
    pub fn free_counted(&mut self, v: Val) {
        unsafe {
            let size = (*(v.as_raw_ptr() as *mut Header)).size as u64;
            self.stats.allocated_bytes = self.stats.allocated_bytes.saturating_sub(size);
            self.stats.allocated_blocks = self.stats.allocated_blocks.saturating_sub(1);
        }
        self.free(v);
    }

    fn block_list(&self) -> Vec<*mut Header> {
        let mut blocks = Vec::new();
        for chunk in &self.chunks {
            let mut off = 0;
            while off < chunk.top {
                let h = unsafe { chunk.base().add(off) } as *mut Header;
                let size = unsafe { (*h).size } as usize;
                assert!(
                    size >= HEADER_SIZE && size % 8 == 0 && off + size <= chunk.top,
                    "heap corruption: bad block size {size} at offset {off}"
                );
                blocks.push(h);
                off += size;
            }
        }
        blocks
    }

    /// Reclaim dead blocks, compact survivors, fix up pointers.
    ///
    /// `roots` is every mutable slot outside the heap that may hold a heap
    /// pointer: the live region of the value stack including the globals
    /// frame. Slots are rewritten in place when their target moves.
    pub fn sweep(&mut self, roots: &mut [Val]) {
        let used_before = self.used_bytes();

        // Delete pass. Zero-ref blocks release their contained references,
        // which cascades immediately through dec_ref_and_check.
        let mut deleted = 0u64;
        for &h in &self.block_list() {
            unsafe {
                if (*h).form.is_null() || (*h).ref_ >= MINIMUM_READONLY_REF {
                    continue;
                }
                if (*h).ref_ == 0 {
                    let v = Val::from_raw_ptr(h as *mut u8);
                    (v.form().ops.delete)(self, v);
                    deleted += 1;
                }
            }
        }

        // Slide pass. Live blocks move toward the chunk start; read-only
        // blocks are pinned and compaction restarts past them.
        let mut reloc = Relocation::default();
        for chunk in &mut self.chunks {
            let base = chunk.base();
            let mut src = 0;
            let mut dst = 0;
            while src < chunk.top {
                unsafe {
                    let h = base.add(src) as *mut Header;
                    let size = (*h).size as usize;
                    if (*h).form.is_null() {
                        // dead: reclaimed by not advancing dst
                    } else if (*h).ref_ >= MINIMUM_READONLY_REF {
                        // pinned: cannot move, give up the gap before it
                        dst = src + size;
                    } else {
                        if dst != src {
                            std::ptr::copy(base.add(src), base.add(dst), size);
                            reloc.insert(base.add(src) as usize, base.add(dst) as usize);
                        }
                        dst += size;
                    }
                    src += size;
                }
            }
            chunk.top = dst;
        }

        // Adjust pass. Every live block and every root slot is rewritten
        // through the relocation map.
        if !reloc.is_empty() {
            for &h in &self.block_list() {
                unsafe {
                    if (*h).form.is_null() {
                        continue;
                    }
                    let v = Val::from_raw_ptr(h as *mut u8);
                    (v.form().ops.adjust_heap_ptrs)(v, &reloc);
                }
            }
            for slot in roots.iter_mut() {
                reloc.relocate_slot(slot);
            }
        }

        // Drop chunks that compacted to empty, keeping one warm.
        while self.chunks.len() > 1 && self.chunks.last().is_some_and(|c| c.top == 0) {
            self.chunks.pop();
        }

        self.stats.sweeps += 1;
        let used_after = self.used_bytes();
        // Raise the threshold when live data alone exceeds it, otherwise
        // every dispatch boundary would sweep again immediately.
        if used_after * 4 >= self.sweep_threshold * 3 {
            self.sweep_threshold = used_after * 2;
        }
        debug!(
            deleted,
            reclaimed = used_before - used_after,
            live = used_after,
            "heap sweep"
        );
    }

    /// Whole-heap invariant audit. Panics on corruption; meant for tests
    /// and debugging, not the hot path.
    pub fn check(&self) {
        let mut live = HashSet::new();
        for &h in &self.block_list() {
            unsafe {
                if !(*h).form.is_null() {
                    live.insert(h as usize);
                }
            }
        }
        let valid = |v: Val| -> bool { live.contains(&v.raw()) || v.is_readonly() };
        for &h in &self.block_list() {
            unsafe {
                if (*h).form.is_null() {
                    continue;
                }
                let r = (*h).ref_;
                assert!(r >= 0, "heap corruption: negative refcount {r}");
                let v = Val::from_raw_ptr(h as *mut u8);
                (v.form().ops.check_heap_ptrs)(v, &valid);
            }
        }
    }
}

impl Alloc for Heap {
    fn alloc_block(&mut self, size: usize) -> *mut u8 {
        self.allocate(size)
    }

    fn initial_ref(&self) -> i32 {
        1
    }
}

// =============================================================================
// Static heap
// =============================================================================

/// Storage for read-only values: literals, default proto tuples, shared
/// singletons. Blocks never move and are never individually freed; they
/// live as long as the owning registry (the whole process for the
/// universe, the program for its literal pool).
#[derive(Default)]
pub struct StaticHeap {
    blocks: Vec<Box<[u64]>>,
}

impl StaticHeap {
    pub fn new() -> StaticHeap {
        StaticHeap::default()
    }

    /// Does `p` point into this static heap?
    pub fn contains(&self, p: *const u8) -> bool {
        let addr = p as usize;
        self.blocks.iter().any(|b| {
            let start = b.as_ptr() as usize;
            addr >= start && addr < start + b.len() * 8
        })
    }
}

impl Alloc for StaticHeap {
    fn alloc_block(&mut self, size: usize) -> *mut u8 {
        let size = round_up(size.max(HEADER_SIZE));
        let mut block = vec![0u64; size / 8].into_boxed_slice();
        let p = block.as_mut_ptr() as *mut u8;
        self.blocks.push(block);
        unsafe {
            let h = p as *mut Header;
            (*h).form = std::ptr::null();
            (*h).ref_ = INITIAL_READONLY_REF;
            (*h).size = size as u32;
        }
        p
    }

    fn initial_ref(&self) -> i32 {
        INITIAL_READONLY_REF
    }
}
