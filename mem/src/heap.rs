//! Word-granular first-fit heap with hole coalescing.
//!
//! Serves every runtime allocation in the stack core.  A block is a run of
//! machine words `[len][payload...][len]`; both length words carry the
//! same signed payload word count, negative while the block is free.  Free
//! blocks whose payload is wide enough to hold a [`HoleLink`] join the
//! address-ordered holes list, whose nodes live *inside* the free memory
//! they describe.  This module is the only place in the workspace that
//! does raw pointer arithmetic on heap words.
//!
//! # Allocation policy
//!
//! Two entry points share one allocator:
//!
//! - [`Heap::alloc`] (persistent) scans the holes list back-to-front, so
//!   long-lived objects cluster at high addresses.
//! - [`Heap::temporary_alloc`] scans front-to-back and fails once the
//!   allocated byte count passes the temporary-allocation ceiling
//!   (default: 95 % of the heap), keeping headroom for persistent state.
//!
//! The directional split rule keeps the policy intact: an ascending
//! allocation leaves its residual hole after the block, a descending one
//! leaves it before.
//!
//! # Failure reporting
//!
//! Corruption and misuse never panic.  Every detected violation is
//! reported once to the registered failure callback with a [`HeapFail`]
//! reason; the callback is the host's policy point (log, reset, halt).
//!
//! # Concurrency
//!
//! The book keeping lives in a [`CriticalCell`]; every operation holds the
//! critical section for its duration, which keeps the counters and list
//! coherent for ISR-side callers.

use core::mem;
use core::ptr::{self, NonNull};

use meshcore_lib::{CriticalCell, CriticalSection};

/// Internal signed block-size word.
type Word = isize;

const WORD_SIZE: usize = mem::size_of::<Word>();

/// Maximum number of non-contiguous heap regions.
const REGION_COUNT: usize = 3;

/// Words a free block's payload must hold to carry a list node.
const HOLE_LINK_WORDS: usize = mem::size_of::<HoleLink>() / WORD_SIZE;

/// Temporary allocations must leave this share of the heap free.
const TEMPORARY_ALLOC_FREE_PERCENT: usize = 5;

/// Failure taxonomy delivered to the heap failure callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeapFail {
    Uninitialized,
    SizeInvalid,
    SectorCorrupted,
    PointerInvalid,
    DoubleFree,
    NullFree,
}

/// Caller-visible errors from the management APIs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeapError {
    NotInitialized,
    InvalidParameter,
    RegionDuplicate,
    RegionLimit,
}

/// Allocator statistics, updated under the critical section.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Total heap bytes across all regions.
    pub sector_size: u32,
    /// Bytes currently allocated, including block headers.
    pub allocated_bytes: u32,
    /// High-water mark of `allocated_bytes`.
    pub allocated_bytes_max: u32,
    /// Cumulative bytes handed out over the heap lifetime.
    pub alloc_total_bytes: u32,
    /// Allocations that failed.
    pub alloc_fail_cnt: u32,
    /// Live allocation count.
    pub alloc_cnt: u32,
}

/// Scan direction; selects the allocation policy.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// Ascending address scan (temporary allocations).
    Up,
    /// Descending address scan (persistent allocations).
    Down,
}

/// Doubly-linked node embedded at the payload start of a listed hole.
/// Links are block-start pointers, null-terminated at both ends.
#[repr(C)]
struct HoleLink {
    prev: *mut Word,
    next: *mut Word,
}

#[derive(Clone, Copy)]
struct Region {
    /// First word of the region (head sentinel of its first block).
    start: *mut Word,
    /// Last word of the region (tail sentinel of its last block).
    end: *mut Word,
}

struct HeapInner {
    regions: [Option<Region>; REGION_COUNT],
    holes_head: *mut Word,
    holes_tail: *mut Word,
    heap_size: usize,
    temporary_alloc_limit: usize,
    fail_cb: Option<fn(HeapFail)>,
    stats: HeapStats,
}

// SAFETY: the raw pointers reference heap regions owned by this book; all
// access is serialized by the critical cell.
unsafe impl Send for HeapInner {}

/// The heap book: region table, holes list, statistics and policy.
pub struct Heap {
    inner: CriticalCell<HeapInner>,
}

impl Heap {
    pub const fn new(cs: &'static CriticalSection) -> Self {
        Self {
            inner: CriticalCell::new(
                cs,
                HeapInner {
                    regions: [None; REGION_COUNT],
                    holes_head: ptr::null_mut(),
                    holes_tail: ptr::null_mut(),
                    heap_size: 0,
                    temporary_alloc_limit: 0,
                    fail_cb: None,
                    stats: HeapStats {
                        sector_size: 0,
                        allocated_bytes: 0,
                        allocated_bytes_max: 0,
                        alloc_total_bytes: 0,
                        alloc_fail_cnt: 0,
                        alloc_cnt: 0,
                    },
                },
            ),
        }
    }

    /// Initialize the book with its first region.
    ///
    /// The region is aligned down to whole words; it must hold at least one
    /// listable free block.
    ///
    /// # Safety
    ///
    /// `region..region + size` must be writable memory owned exclusively by
    /// this heap for the heap's lifetime.
    pub unsafe fn init(
        &self,
        region: *mut u8,
        size: usize,
        fail_cb: Option<fn(HeapFail)>,
    ) -> Result<(), HeapError> {
        self.inner.with(|inner| {
            inner.fail_cb = fail_cb;
            let (start, words) = align_region(region, size);
            if start.is_null() || words < 2 + HOLE_LINK_WORDS {
                inner.fail(HeapFail::SizeInvalid);
                return Err(HeapError::InvalidParameter);
            }
            let data = (words - 2) as Word;
            unsafe {
                *start = -data;
                let end = start.add(words - 1);
                *end = -data;
                inner.regions[0] = Some(Region { start, end });
                inner.holes_head = start;
                inner.holes_tail = start;
                (*hole_link(start)).prev = ptr::null_mut();
                (*hole_link(start)).next = ptr::null_mut();
            }
            inner.heap_size = words * WORD_SIZE;
            inner.stats = HeapStats {
                sector_size: (words * WORD_SIZE) as u32,
                ..HeapStats::default()
            };
            inner.temporary_alloc_limit =
                inner.heap_size / 100 * (100 - TEMPORARY_ALLOC_FREE_PERCENT);
            Ok(())
        })
    }

    /// Add a further non-contiguous region (up to three in total).
    ///
    /// # Safety
    ///
    /// Same ownership contract as [`Heap::init`]; the region must not
    /// overlap any region already given to this heap.
    pub unsafe fn region_add(&self, region: *mut u8, size: usize) -> Result<(), HeapError> {
        self.inner.with(|inner| {
            if inner.regions[0].is_none() {
                return Err(HeapError::NotInitialized);
            }
            if region.is_null() || size < 3 * WORD_SIZE {
                return Err(HeapError::InvalidParameter);
            }
            let (start, words) = align_region(region, size);
            if start.is_null() || words < 2 + HOLE_LINK_WORDS {
                return Err(HeapError::InvalidParameter);
            }

            // Locate the list position for the new region's single hole.
            let mut previous = ptr::null_mut();
            let mut cursor = inner.holes_head;
            while !cursor.is_null() {
                if cursor == start {
                    return Err(HeapError::RegionDuplicate);
                }
                if cursor < start {
                    previous = cursor;
                }
                cursor = unsafe { (*hole_link(cursor)).next };
            }

            let slot = match inner.regions.iter().position(|r| r.is_none()) {
                Some(slot) => slot,
                None => return Err(HeapError::RegionLimit),
            };

            let data = (words - 2) as Word;
            unsafe {
                *start = -data;
                let end = start.add(words - 1);
                *end = -data;
                inner.regions[slot] = Some(Region { start, end });
                if previous.is_null() {
                    inner.hole_insert_head(start);
                } else {
                    inner.hole_insert_after(previous, start);
                }
            }

            inner.heap_size += words * WORD_SIZE;
            inner.stats.sector_size = inner.heap_size as u32;
            inner.temporary_alloc_limit =
                inner.heap_size / 100 * (100 - TEMPORARY_ALLOC_FREE_PERCENT);
            Ok(())
        })
    }

    /// Persistent allocation; scans holes from the top of the heap down.
    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.inner.with(|inner| inner.alloc(size, Direction::Down))
    }

    /// Temporary allocation; scans from the bottom up and honors the
    /// temporary-allocation ceiling.
    pub fn temporary_alloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.inner.with(|inner| {
            if inner.stats.allocated_bytes as usize > inner.temporary_alloc_limit {
                inner.stats.alloc_fail_cnt += 1;
                return None;
            }
            inner.alloc(size, Direction::Up)
        })
    }

    /// Return a block to the heap, coalescing with free neighbours.
    ///
    /// # Safety
    ///
    /// `block` must be null or a payload pointer previously returned by
    /// [`Heap::alloc`]/[`Heap::temporary_alloc`] on this heap and not freed
    /// since.  (Invalid pointers inside a heap region are detected and
    /// reported, not dereferenced beyond their length word.)
    pub unsafe fn free(&self, block: *mut u8) {
        self.inner.with(|inner| {
            if block.is_null() {
                inner.fail(HeapFail::NullFree);
                return;
            }
            let block_start = unsafe { (block as *mut Word).sub(1) };
            let size = unsafe { *block_start };
            if inner.region_of(block_start, size.unsigned_abs()).is_none() {
                inner.fail(HeapFail::PointerInvalid);
            } else if size < 0 {
                inner.fail(HeapFail::DoubleFree);
            } else if !block_validate(block_start) {
                inner.fail(HeapFail::SectorCorrupted);
            } else {
                unsafe { inner.free_and_merge(block_start, size) };
                let freed = (size as usize + 2) * WORD_SIZE;
                inner.stats.alloc_cnt = inner.stats.alloc_cnt.saturating_sub(1);
                inner.stats.allocated_bytes =
                    inner.stats.allocated_bytes.saturating_sub(freed as u32);
            }
        })
    }

    /// Reconfigure the temporary-allocation ceiling.  `free_percent` and
    /// `free_bytes` are alternatives: the share (or byte count) of the heap
    /// that temporary allocations must leave untouched.  Both zero disables
    /// the reservation.
    pub fn set_temporary_alloc_threshold(
        &self,
        free_percent: u8,
        free_bytes: u32,
    ) -> Result<(), HeapError> {
        self.inner.with(|inner| {
            if inner.regions[0].is_none() {
                return Err(HeapError::NotInitialized);
            }
            let heap = inner.heap_size;
            let mut limit = 0usize;
            if free_bytes != 0 && (free_bytes as usize) < heap / 2 {
                limit = heap - free_bytes as usize;
            }
            if free_bytes == 0 && free_percent != 0 && free_percent < 50 {
                limit = heap / 100 * (100 - free_percent as usize);
            }
            if free_bytes == 0 && free_percent == 0 {
                limit = heap;
            }
            if limit == 0 {
                return Err(HeapError::InvalidParameter);
            }
            inner.temporary_alloc_limit = limit;
            Ok(())
        })
    }

    /// Snapshot of the allocator statistics.
    pub fn stats(&self) -> HeapStats {
        self.inner.with(|inner| inner.stats)
    }

    /// Bytes currently allocated (headers included).
    pub fn allocated_bytes(&self) -> u32 {
        self.inner.with(|inner| inner.stats.allocated_bytes)
    }

    /// Number of holes currently on the list.
    pub fn hole_count(&self) -> usize {
        self.inner.with(|inner| {
            let mut n = 0;
            let mut cursor = inner.holes_head;
            while !cursor.is_null() {
                n += 1;
                cursor = unsafe { (*hole_link(cursor)).next };
            }
            n
        })
    }

    /// Walk every region and the holes list, verifying block framing,
    /// coalescing, list order and mass conservation.
    pub fn integrity_check(&self) -> bool {
        self.inner.with(|inner| unsafe { inner.integrity_check() })
    }
}

impl HeapInner {
    fn fail(&self, reason: HeapFail) {
        log::warn!("heap failure: {:?}", reason);
        if let Some(cb) = self.fail_cb {
            cb(reason);
        }
    }

    fn region_of(&self, block: *mut Word, size_words: usize) -> Option<usize> {
        // Address arithmetic on untrusted sizes stays in integers so a
        // garbage length word cannot overflow a pointer offset.
        let addr = block as usize;
        let span = size_words.checked_mul(WORD_SIZE)?;
        let block_end = addr.checked_add(span)?;
        for (idx, region) in self.regions.iter().enumerate() {
            if let Some(r) = *region {
                let start = r.start as usize;
                let end = r.end as usize;
                if addr >= start && addr < end && block_end < end {
                    return Some(idx);
                }
            }
        }
        None
    }

    /// Convert a byte request to payload words, reporting invalid sizes.
    /// A zero return means the request was rejected outright.
    fn convert_allocation_size(&self, requested: usize) -> usize {
        if self.regions[0].is_none() {
            self.fail(HeapFail::Uninitialized);
            return 0;
        }
        if requested == 0 {
            self.fail(HeapFail::SizeInvalid);
            return 0;
        }
        if requested > self.heap_size - 2 * WORD_SIZE {
            // Reported, but the scan below still runs and fails cleanly.
            self.fail(HeapFail::SizeInvalid);
        }
        requested.div_ceil(WORD_SIZE)
    }

    fn alloc(&mut self, requested: usize, direction: Direction) -> Option<NonNull<u8>> {
        let data_size = self.convert_allocation_size(requested);
        if data_size == 0 {
            self.stats.alloc_fail_cnt += 1;
            return None;
        }

        let mut block = ptr::null_mut();
        let mut cursor = match direction {
            Direction::Up => self.holes_head,
            Direction::Down => self.holes_tail,
        };
        while !cursor.is_null() {
            let head = unsafe { *cursor };
            if !block_validate(cursor) || head >= 0 {
                self.fail(HeapFail::SectorCorrupted);
                break;
            }
            if head.unsigned_abs() >= data_size {
                block = cursor;
                break;
            }
            cursor = unsafe {
                match direction {
                    Direction::Up => (*hole_link(cursor)).next,
                    Direction::Down => (*hole_link(cursor)).prev,
                }
            };
        }

        if block.is_null() {
            self.stats.alloc_fail_cnt += 1;
            return None;
        }

        let block_data = unsafe { (*block).unsigned_abs() };
        let mut data = data_size;
        let payload = unsafe {
            if block_data >= data_size + 2 + HOLE_LINK_WORDS {
                let hole_size = block_data - data_size - 2;
                match direction {
                    Direction::Up => {
                        // Residual hole goes after the allocation; move the
                        // descriptor, keeping its list position.
                        let hole = block.add(1 + data_size + 1);
                        let before = (*hole_link(block)).prev;
                        self.hole_remove(block);
                        if before.is_null() {
                            self.hole_insert_head(hole);
                        } else {
                            self.hole_insert_after(before, hole);
                        }
                        *hole = -(hole_size as Word);
                        *hole.add(1 + hole_size) = -(hole_size as Word);
                        block
                    }
                    Direction::Down => {
                        // Residual hole keeps the low end and its
                        // descriptor; the allocation takes the top.
                        *block = -(hole_size as Word);
                        *block.add(1 + hole_size) = -(hole_size as Word);
                        block.add(1 + hole_size + 1)
                    }
                }
            } else {
                // Too tight to split; hand out the whole block.
                data = block_data;
                self.hole_remove(block);
                block
            }
        };

        unsafe {
            *payload = data as Word;
            *payload.add(1 + data) = data as Word;
        }

        let bytes = ((data + 2) * WORD_SIZE) as u32;
        self.stats.alloc_cnt += 1;
        self.stats.allocated_bytes += bytes;
        self.stats.alloc_total_bytes += bytes;
        if self.stats.allocated_bytes > self.stats.allocated_bytes_max {
            self.stats.allocated_bytes_max = self.stats.allocated_bytes;
        }

        NonNull::new(unsafe { payload.add(1) } as *mut u8)
    }

    /// Mark `block` free and merge with adjacent free blocks inside its
    /// region, keeping the holes list coherent.
    unsafe fn free_and_merge(&mut self, block: *mut Word, data_size: Word) {
        let data_size = data_size as usize;
        let region = match self.region_of(block, data_size).and_then(|idx| self.regions[idx]) {
            Some(region) => region,
            None => {
                self.fail(HeapFail::SectorCorrupted);
                return;
            }
        };

        let mut start = block;
        let mut end = block.add(data_size + 1);
        *start = -(data_size as Word);
        *end = -(data_size as Word);
        let mut merged = data_size;

        // Listed descriptors of the neighbours we merge with, if any.
        let mut existing_start: *mut Word = ptr::null_mut();
        let mut existing_end: *mut Word = ptr::null_mut();

        if start != region.start && *start.sub(1) < 0 {
            let prev_end = start.sub(1);
            let prev_size = 1 + (*prev_end).unsigned_abs() + 1;
            merged += prev_size;
            start = start.sub(prev_size);
            if *start != *prev_end {
                self.fail(HeapFail::SectorCorrupted);
            }
            if prev_size >= 1 + HOLE_LINK_WORDS + 1 {
                existing_start = start;
            }
        }

        if end != region.end && *end.add(1) < 0 {
            let next_start = end.add(1);
            let next_size = 1 + (*next_start).unsigned_abs() + 1;
            merged += next_size;
            end = end.add(next_size);
            if *end != *next_start {
                self.fail(HeapFail::SectorCorrupted);
            }
            if next_size >= 1 + HOLE_LINK_WORDS + 1 {
                existing_end = next_start;
            }
        }

        let mut before: *mut Word = ptr::null_mut();
        if !existing_end.is_null() {
            // The upper hole's descriptor would end up mid-block; replace
            // it with one at the merged block's base, noting its position.
            before = (*hole_link(existing_end)).next;
            self.hole_remove(existing_end);
        }
        if existing_start.is_null() {
            // No descriptor survives at the base; add one if the merged
            // block is wide enough to carry it.
            if merged >= HOLE_LINK_WORDS {
                if existing_end.is_null() {
                    let mut cursor = self.holes_head;
                    while !cursor.is_null() {
                        if cursor > start {
                            before = cursor;
                            break;
                        }
                        cursor = (*hole_link(cursor)).next;
                    }
                }
                if before.is_null() {
                    self.hole_insert_tail(start);
                } else {
                    self.hole_insert_before(before, start);
                }
            }
        }

        *start = -(merged as Word);
        *end = -(merged as Word);
    }

    unsafe fn hole_insert_head(&mut self, block: *mut Word) {
        let old = self.holes_head;
        (*hole_link(block)).prev = ptr::null_mut();
        (*hole_link(block)).next = old;
        if old.is_null() {
            self.holes_tail = block;
        } else {
            (*hole_link(old)).prev = block;
        }
        self.holes_head = block;
    }

    unsafe fn hole_insert_tail(&mut self, block: *mut Word) {
        let old = self.holes_tail;
        (*hole_link(block)).next = ptr::null_mut();
        (*hole_link(block)).prev = old;
        if old.is_null() {
            self.holes_head = block;
        } else {
            (*hole_link(old)).next = block;
        }
        self.holes_tail = block;
    }

    unsafe fn hole_insert_after(&mut self, prev: *mut Word, block: *mut Word) {
        let next = (*hole_link(prev)).next;
        (*hole_link(block)).prev = prev;
        (*hole_link(block)).next = next;
        (*hole_link(prev)).next = block;
        if next.is_null() {
            self.holes_tail = block;
        } else {
            (*hole_link(next)).prev = block;
        }
    }

    unsafe fn hole_insert_before(&mut self, next: *mut Word, block: *mut Word) {
        let prev = (*hole_link(next)).prev;
        (*hole_link(block)).next = next;
        (*hole_link(block)).prev = prev;
        (*hole_link(next)).prev = block;
        if prev.is_null() {
            self.holes_head = block;
        } else {
            (*hole_link(prev)).next = block;
        }
    }

    unsafe fn hole_remove(&mut self, block: *mut Word) {
        let prev = (*hole_link(block)).prev;
        let next = (*hole_link(block)).next;
        if prev.is_null() {
            self.holes_head = next;
        } else {
            (*hole_link(prev)).next = next;
        }
        if next.is_null() {
            self.holes_tail = prev;
        } else {
            (*hole_link(next)).prev = prev;
        }
    }

    unsafe fn integrity_check(&self) -> bool {
        let mut free_words = 0usize;
        let mut used_words = 0usize;
        let mut overhead_words = 0usize;
        let mut listable_holes = 0usize;

        for region in self.regions.iter().flatten() {
            let mut cursor = region.start;
            let mut prev_free = false;
            while cursor < region.end {
                let head = *cursor;
                if head == 0 {
                    return false;
                }
                let len = head.unsigned_abs();
                let tail = cursor.add(len + 1);
                if tail > region.end || *tail != head {
                    return false;
                }
                if head < 0 {
                    // Two adjacent free blocks mean a missed coalesce.
                    if prev_free {
                        return false;
                    }
                    prev_free = true;
                    free_words += len;
                    if len >= HOLE_LINK_WORDS {
                        listable_holes += 1;
                    }
                } else {
                    prev_free = false;
                    used_words += len;
                }
                overhead_words += 2;
                cursor = tail.add(1);
            }
            if cursor != region.end.add(1) {
                return false;
            }
        }

        // Holes list: ascending, consistent back links, all free and wide.
        let mut listed = 0usize;
        let mut cursor = self.holes_head;
        let mut prev: *mut Word = ptr::null_mut();
        while !cursor.is_null() {
            if *cursor >= 0 || (*cursor).unsigned_abs() < HOLE_LINK_WORDS {
                return false;
            }
            if (*hole_link(cursor)).prev != prev {
                return false;
            }
            if !prev.is_null() && cursor < prev {
                return false;
            }
            listed += 1;
            prev = cursor;
            cursor = (*hole_link(cursor)).next;
        }
        if self.holes_tail != prev || listed != listable_holes {
            return false;
        }

        (free_words + used_words + overhead_words) * WORD_SIZE == self.heap_size
    }
}

#[inline]
fn hole_link(block: *mut Word) -> *mut HoleLink {
    unsafe { block.add(1) as *mut HoleLink }
}

/// Head and tail length words must match and be nonzero.
fn block_validate(block_start: *mut Word) -> bool {
    unsafe {
        let head = *block_start;
        if head == 0 {
            return false;
        }
        let tail = block_start.add(1 + head.unsigned_abs());
        head == *tail
    }
}

/// Word-align a raw region, returning the aligned start and whole-word
/// count.  Returns a null start when the region cannot hold a single word.
fn align_region(region: *mut u8, size: usize) -> (*mut Word, usize) {
    let misalign = region as usize % WORD_SIZE;
    let (start, mut usable) = if misalign != 0 {
        let adjust = WORD_SIZE - misalign;
        if size <= adjust {
            return (ptr::null_mut(), 0);
        }
        (unsafe { region.add(adjust) }, size - adjust)
    } else {
        (region, size)
    };
    usable -= usable % WORD_SIZE;
    (start as *mut Word, usable / WORD_SIZE)
}
