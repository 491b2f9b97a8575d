//! Recursive critical-section primitive shared by the whole stack core.
//!
//! Every mutation of shared core state (heap book, event queue, timer
//! lists, MAC queues) happens inside the critical section.  The primitive
//! itself carries no mutual exclusion on a bare-metal single-threaded
//! port; the registered **platform hooks** supply it:
//!
//! - bare metal: IRQ disable/enable around the outermost depth,
//! - RTOS port: a recursive, priority-inheriting mutex shared with the
//!   host threads that want to poke at stack state.
//!
//! Hooks are installed at boot through [`CriticalSection::register_platform`],
//! following the same runtime-registration pattern the early-boot logger
//! uses.  Until registration, enter/exit only track depth, which satisfies
//! the contract for a polled single-threaded loop.
//!
//! # Re-entrancy
//!
//! `enter()` nests freely: the hook fires only on the outermost entry, so
//! an interrupt callback running inside the critical section may call any
//! core API that itself takes the section.  [`CriticalCell`] data access is
//! *not* re-entrant: state borrows are kept short and callbacks are invoked
//! after the borrow is released (while still holding the section), so a
//! nested borrow of the same cell is a bug and panics.

use core::cell::UnsafeCell;
use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};

/// Platform hook invoked on outermost enter/exit.
pub type CriticalHook = fn();

/// Recursive critical section with registrable platform hooks.
pub struct CriticalSection {
    depth: AtomicU32,
    enter_hook: AtomicPtr<()>,
    exit_hook: AtomicPtr<()>,
}

impl CriticalSection {
    pub const fn new() -> Self {
        Self {
            depth: AtomicU32::new(0),
            enter_hook: AtomicPtr::new(ptr::null_mut()),
            exit_hook: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Install the platform enter/exit pair.  Called once at boot, before
    /// any other core API.
    pub fn register_platform(&self, enter: CriticalHook, exit: CriticalHook) {
        self.enter_hook.store(enter as *mut (), Ordering::Release);
        self.exit_hook.store(exit as *mut (), Ordering::Release);
    }

    fn call_hook(slot: &AtomicPtr<()>) {
        let raw = slot.load(Ordering::Acquire);
        if !raw.is_null() {
            // Registered value is always a `CriticalHook`.
            let hook: CriticalHook = unsafe { mem::transmute(raw) };
            hook();
        }
    }

    /// Enter the critical section.  Nested entries are cheap: the platform
    /// hook runs only when the depth goes 0 -> 1.
    pub fn enter(&self) {
        Self::call_hook(&self.enter_hook);
        self.depth.fetch_add(1, Ordering::Relaxed);
    }

    /// Leave the critical section, invoking the platform hook on the
    /// outermost exit.
    pub fn exit(&self) {
        self.depth.fetch_sub(1, Ordering::Relaxed);
        Self::call_hook(&self.exit_hook);
    }

    /// RAII entry; the guard exits on drop.
    pub fn lock(&self) -> CriticalGuard<'_> {
        self.enter();
        CriticalGuard { cs: self }
    }

    /// Current nesting depth.  Nonzero means the caller (or something
    /// above it on the stack) holds the section.
    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::Relaxed)
    }
}

impl Default for CriticalSection {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CriticalGuard<'a> {
    cs: &'a CriticalSection,
}

impl Drop for CriticalGuard<'_> {
    fn drop(&mut self) {
        self.cs.exit();
    }
}

/// State cell protected by a [`CriticalSection`].
///
/// All access goes through [`with`](Self::with), which holds the section
/// for the duration of the closure.  The borrow flag catches accidental
/// re-entrant access from a callback; subsystems avoid it by collecting
/// work under the borrow and dispatching callbacks after it is released.
pub struct CriticalCell<T> {
    cs: &'static CriticalSection,
    borrowed: AtomicBool,
    value: UnsafeCell<T>,
}

// SAFETY: exclusive access is enforced by the critical section (platform
// exclusion) plus the borrow flag (re-entrancy detection).
unsafe impl<T: Send> Sync for CriticalCell<T> {}
unsafe impl<T: Send> Send for CriticalCell<T> {}

impl<T> CriticalCell<T> {
    pub const fn new(cs: &'static CriticalSection, value: T) -> Self {
        Self {
            cs,
            borrowed: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// The critical section this cell is bound to.
    pub fn section(&self) -> &'static CriticalSection {
        self.cs
    }

    /// Run `f` with exclusive access to the state, inside the critical
    /// section.
    ///
    /// Panics on re-entrant access to the same cell.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let _guard = self.cs.lock();
        if self.borrowed.swap(true, Ordering::Acquire) {
            panic!("re-entrant CriticalCell access");
        }
        // SAFETY: the critical section excludes other contexts and the
        // borrow flag excludes re-entry from this one.
        let result = f(unsafe { &mut *self.value.get() });
        self.borrowed.store(false, Ordering::Release);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_enter_tracks_depth() {
        static CS: CriticalSection = CriticalSection::new();
        assert_eq!(CS.depth(), 0);
        CS.enter();
        CS.enter();
        assert_eq!(CS.depth(), 2);
        CS.exit();
        assert_eq!(CS.depth(), 1);
        CS.exit();
        assert_eq!(CS.depth(), 0);
    }

    #[test]
    fn guard_releases_on_drop() {
        static CS: CriticalSection = CriticalSection::new();
        {
            let _g = CS.lock();
            assert!(CS.depth() >= 1);
        }
        assert_eq!(CS.depth(), 0);
    }

    #[test]
    fn cell_gives_exclusive_access() {
        static CELL_CS: CriticalSection = CriticalSection::new();
        static CELL: CriticalCell<u32> = CriticalCell::new(&CELL_CS, 7);
        CELL.with(|v| *v += 1);
        assert_eq!(CELL.with(|v| *v), 8);
    }
}
