//! The process-wide interposition context.
//!
//! [`Interposer`] bundles everything the intercepted entry points share: the
//! cache of real routines, the recursion guard, the bootstrap arena and the
//! latency histograms.  It is built by a `const fn`, so the preload library
//! keeps it in a `static` and no code runs before the first `malloc`.
//!
//! Each entry point makes sure its real routine is known, then times the call
//! to it.  Resolution goes through a [`Resolver`] that may itself allocate;
//! allocations that arrive while a resolution is in progress and whose own
//! routine is not yet known are served from the arena, and the arena never
//! gives anything back.  Only calls made on a thread that is running the
//! resolver are redirected.

use std::{
    alloc::{GlobalAlloc, Layout},
    io::{self, Write},
    mem, ptr,
    sync::atomic::{AtomicBool, Ordering},
    time::Instant,
};

use libc::{c_int, c_void, size_t};

use crate::{
    arena::BumpArena,
    config::{BOOTSTRAP_ARENA_BYTES, MIN_ALIGN, REPORT_CONFIG},
    fatal,
    guard::RecursionGuard,
    histogram::HistogramSet,
    report::Snapshot,
    symbols::{
        CallocFn, FreeFn, MallocFn, MemalignFn, Operation, PosixMemalignFn, ReallocFn, Resolver,
        SymbolCache, UsableSizeFn,
    },
    ReportConfig,
};

/// Interposition context, generic over how real routines are found and how
/// much memory is set aside for the resolver.
pub struct Interposer<R, const ARENA: usize = BOOTSTRAP_ARENA_BYTES> {
    resolver: R,
    symbols: SymbolCache,
    guard: RecursionGuard,
    arena: BumpArena<ARENA>,
    histograms: HistogramSet,
    finished: AtomicBool,
}

impl<R: Resolver, const ARENA: usize> Interposer<R, ARENA> {
    pub const fn new(resolver: R) -> Self {
        Interposer {
            resolver,
            symbols: SymbolCache::new(),
            guard: RecursionGuard::new(),
            arena: BumpArena::new(),
            histograms: HistogramSet::new(),
            finished: AtomicBool::new(false),
        }
    }

    pub fn symbols(&self) -> &SymbolCache {
        &self.symbols
    }

    pub fn guard(&self) -> &RecursionGuard {
        &self.guard
    }

    pub fn arena(&self) -> &BumpArena<ARENA> {
        &self.arena
    }

    pub fn histograms(&self) -> &HistogramSet {
        &self.histograms
    }

    /// Address of the real routine for `op`, looking it up on first use.
    /// Aborts the process if the resolver cannot find it.
    pub fn resolve(&self, op: Operation) -> usize {
        if let Some(addr) = self.symbols.get(op) {
            return addr;
        }
        let _scope = self.guard.enter();
        match self.symbols.get_or_resolve(op, &self.resolver) {
            Some(addr) => addr,
            None => fatal!("couldn't find original {}", op),
        }
    }

    // Is this a call for an unknown routine made from inside the resolver?
    #[inline]
    fn bootstrapping(&self, op: Operation) -> bool {
        self.symbols.get(op).is_none() && self.guard.active()
    }

    // `Ok` with the real routine, or `Err` with arena memory if the routine
    // is unknown and we are being called from inside the resolver.
    #[inline]
    fn resolve_or_bootstrap(
        &self,
        op: Operation,
        size: usize,
        align: usize,
    ) -> Result<usize, *mut c_void> {
        if self.bootstrapping(op) {
            return Err(self.bootstrap(size, align));
        }
        Ok(self.resolve(op))
    }

    #[cold]
    fn bootstrap(&self, size: usize, align: usize) -> *mut c_void {
        match self.arena.try_alloc(size, align) {
            Some(block) => block.as_ptr().cast(),
            None => fatal!(
                "bootstrap arena exhausted: {} bytes requested, {} of {} bytes in use",
                size,
                self.arena.used(),
                self.arena.capacity()
            ),
        }
    }

    // Arena memory for an aligned request, or the error number the real
    // allocator reports when it runs out of memory.
    fn bootstrap_aligned(&self, size: usize, align: usize) -> Result<*mut c_void, c_int> {
        if align > self.arena.capacity() {
            return Err(libc::ENOMEM);
        }
        Ok(self.bootstrap(size, align))
    }

    #[inline]
    fn timed<T>(&self, op: Operation, call: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let res = call();
        let nanos = u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.histograms.record(op, nanos);
        res
    }

    /// # Safety
    ///
    /// Same contract as C `malloc`.
    pub unsafe fn malloc(&self, size: size_t) -> *mut c_void {
        let real: MallocFn = match self.resolve_or_bootstrap(Operation::Malloc, size, MIN_ALIGN) {
            Ok(addr) => mem::transmute(addr),
            Err(block) => return block,
        };
        self.timed(Operation::Malloc, || real(size))
    }

    /// # Safety
    ///
    /// Same contract as C `free`.
    pub unsafe fn free(&self, ptr: *mut c_void) {
        if self.arena.contains(ptr) {
            return;
        }
        let real: FreeFn = mem::transmute(self.resolve(Operation::Free));
        self.timed(Operation::Free, || real(ptr))
    }

    /// # Safety
    ///
    /// Same contract as C `cfree`, i.e., `free`.
    pub unsafe fn cfree(&self, ptr: *mut c_void) {
        if self.arena.contains(ptr) {
            return;
        }
        let real: FreeFn = mem::transmute(self.resolve(Operation::Cfree));
        self.timed(Operation::Cfree, || real(ptr))
    }

    /// # Safety
    ///
    /// Same contract as C `calloc`.
    pub unsafe fn calloc(&self, n: size_t, size: size_t) -> *mut c_void {
        if self.bootstrapping(Operation::Calloc) {
            return match n.checked_mul(size) {
                // Arena bytes are never handed out twice, so they are still zero.
                Some(total) => self.bootstrap(total, MIN_ALIGN),
                None => fail(libc::ENOMEM),
            };
        }
        let real: CallocFn = mem::transmute(self.resolve(Operation::Calloc));
        self.timed(Operation::Calloc, || real(n, size))
    }

    /// # Safety
    ///
    /// Same contract as C `realloc`.  Blocks from the bootstrap arena cannot
    /// be resized: the call fails with a null result and the block stays valid.
    pub unsafe fn realloc(&self, ptr: *mut c_void, size: size_t) -> *mut c_void {
        if self.arena.contains(ptr) {
            return ptr::null_mut();
        }
        let addr = if ptr.is_null() {
            match self.resolve_or_bootstrap(Operation::Realloc, size, MIN_ALIGN) {
                Ok(addr) => addr,
                Err(block) => return block,
            }
        } else {
            self.resolve(Operation::Realloc)
        };
        let real: ReallocFn = mem::transmute(addr);
        self.timed(Operation::Realloc, || real(ptr, size))
    }

    /// # Safety
    ///
    /// Same contract as C `memalign`.
    pub unsafe fn memalign(&self, alignment: size_t, size: size_t) -> *mut c_void {
        if self.bootstrapping(Operation::Memalign) {
            // glibc rounds other alignments up to a power of two.
            if alignment > usize::MAX / 2 + 1 {
                return fail(libc::EINVAL);
            }
            return self
                .bootstrap_aligned(size, alignment)
                .unwrap_or_else(fail);
        }
        let real: MemalignFn = mem::transmute(self.resolve(Operation::Memalign));
        self.timed(Operation::Memalign, || real(alignment, size))
    }

    /// # Safety
    ///
    /// Same contract as C `posix_memalign`: `out` must be valid for writes.
    pub unsafe fn posix_memalign(
        &self,
        out: *mut *mut c_void,
        alignment: size_t,
        size: size_t,
    ) -> c_int {
        if self.bootstrapping(Operation::PosixMemalign) {
            if !alignment.is_power_of_two() || alignment % mem::size_of::<*mut c_void>() != 0 {
                return libc::EINVAL;
            }
            return match self.bootstrap_aligned(size, alignment) {
                Ok(block) => {
                    *out = block;
                    0
                }
                Err(errno) => errno,
            };
        }
        let real: PosixMemalignFn = mem::transmute(self.resolve(Operation::PosixMemalign));
        self.timed(Operation::PosixMemalign, || real(out, alignment, size))
    }

    /// # Safety
    ///
    /// Same contract as C `aligned_alloc`.
    pub unsafe fn aligned_alloc(&self, alignment: size_t, size: size_t) -> *mut c_void {
        if self.bootstrapping(Operation::AlignedAlloc) {
            if !alignment.is_power_of_two() {
                return fail(libc::EINVAL);
            }
            return self
                .bootstrap_aligned(size, alignment)
                .unwrap_or_else(fail);
        }
        let real: MemalignFn = mem::transmute(self.resolve(Operation::AlignedAlloc));
        self.timed(Operation::AlignedAlloc, || real(alignment, size))
    }

    /// # Safety
    ///
    /// Same contract as C `malloc_usable_size`.  Blocks from the bootstrap
    /// arena report 0 usable bytes.
    pub unsafe fn malloc_usable_size(&self, ptr: *mut c_void) -> size_t {
        if self.arena.contains(ptr) {
            return 0;
        }
        let real: UsableSizeFn = mem::transmute(self.resolve(Operation::MallocUsableSize));
        self.timed(Operation::MallocUsableSize, || real(ptr))
    }

    /// Copy of the latencies recorded so far.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::capture(&self.histograms)
    }

    /// Render the latencies recorded so far.
    pub fn report(&self, config: &ReportConfig) -> String {
        self.snapshot().report(config)
    }

    /// Report the recorded latencies according to the `LATALLOC_*` environment
    /// variables: print them to stderr and/or save them to a file.
    ///
    /// Only the first call does anything.  Calls made after this one are still
    /// forwarded and timed, they just no longer get reported.
    pub fn shutdown(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown_with(&REPORT_CONFIG);
    }

    fn shutdown_with(&self, config: &ReportConfig) {
        let snapshot = self.snapshot();
        if let Some(dir) = config.output_dir.as_ref() {
            if let Err(e) = snapshot.save(dir) {
                crate::log!("failed to save latency profile: {:#}", e);
            }
        }
        // Runs from an exit handler: a closed or broken stderr is not our problem.
        if !config.quiet {
            let _ = io::stderr().write_all(snapshot.report(config).as_bytes());
        }
    }
}

// Null result with `errno` set, the C allocation API's failure convention.
fn fail(errno: c_int) -> *mut c_void {
    unsafe { *libc::__errno_location() = errno };
    ptr::null_mut()
}

// Lets a Rust program profile its own allocations without `LD_PRELOAD`:
//
//     #[global_allocator]
//     static GLOBAL: Interposer<NextSymbol> = Interposer::new(NextSymbol);
unsafe impl<R: Resolver + Sync, const ARENA: usize> GlobalAlloc for Interposer<R, ARENA> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= MIN_ALIGN && layout.align() <= layout.size() {
            self.malloc(layout.size()).cast()
        } else {
            self.aligned(layout)
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= MIN_ALIGN && layout.align() <= layout.size() {
            self.calloc(layout.size(), 1).cast()
        } else {
            let block = self.aligned(layout);
            if !block.is_null() {
                ptr::write_bytes(block, 0, layout.size());
            }
            block
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.free(ptr.cast());
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= MIN_ALIGN && layout.align() <= new_size {
            return Interposer::realloc(self, ptr.cast(), new_size).cast();
        }
        let new_layout = Layout::from_size_align_unchecked(new_size, layout.align());
        let block = self.aligned(new_layout);
        if !block.is_null() {
            ptr::copy_nonoverlapping(ptr, block, layout.size().min(new_size));
            self.free(ptr.cast());
        }
        block
    }
}

impl<R: Resolver, const ARENA: usize> Interposer<R, ARENA> {
    unsafe fn aligned(&self, layout: Layout) -> *mut u8 {
        let mut out = ptr::null_mut();
        let align = layout.align().max(mem::size_of::<usize>());
        match self.posix_memalign(&mut out, align, layout.size()) {
            0 => out.cast(),
            _ => ptr::null_mut(),
        }
    }
}
