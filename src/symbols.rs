//! The intercepted operations, the capability used to find the real routines,
//! and the cache of routines found so far.

use std::{ffi::CStr, fmt, num::NonZeroUsize};

use libc::{c_void, dlsym, RTLD_NEXT};
use once_cell::race::OnceNonZeroUsize;

/// One intercepted entry point of the C allocation API.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Malloc,
    Free,
    Cfree,
    Calloc,
    Realloc,
    Memalign,
    PosixMemalign,
    AlignedAlloc,
    MallocUsableSize,
}

impl Operation {
    pub const COUNT: usize = 9;

    pub const ALL: [Operation; Operation::COUNT] = [
        Operation::Malloc,
        Operation::Free,
        Operation::Cfree,
        Operation::Calloc,
        Operation::Realloc,
        Operation::Memalign,
        Operation::PosixMemalign,
        Operation::AlignedAlloc,
        Operation::MallocUsableSize,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            Operation::Malloc => "malloc",
            Operation::Free => "free",
            Operation::Cfree => "cfree",
            Operation::Calloc => "calloc",
            Operation::Realloc => "realloc",
            Operation::Memalign => "memalign",
            Operation::PosixMemalign => "posix_memalign",
            Operation::AlignedAlloc => "aligned_alloc",
            Operation::MallocUsableSize => "malloc_usable_size",
        }
    }

    /// Symbols to try, in order, when resolving the real routine.
    ///
    /// glibc stopped exporting `cfree` for dynamic lookup in 2.26; it was always
    /// an alias of `free`.
    pub fn symbols(self) -> &'static [&'static CStr] {
        match self {
            Operation::Malloc => &[c"malloc"],
            Operation::Free => &[c"free"],
            Operation::Cfree => &[c"cfree", c"free"],
            Operation::Calloc => &[c"calloc"],
            Operation::Realloc => &[c"realloc"],
            Operation::Memalign => &[c"memalign"],
            Operation::PosixMemalign => &[c"posix_memalign"],
            Operation::AlignedAlloc => &[c"aligned_alloc"],
            Operation::MallocUsableSize => &[c"malloc_usable_size"],
        }
    }

    pub fn from_name(name: &str) -> Option<Operation> {
        Operation::ALL.iter().copied().find(|op| op.name() == name)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Finds the address of the routine the process would have called had this
/// library not been loaded.
///
/// Implementations may allocate through the interposed entry points while
/// they run; those requests are served from the bootstrap arena.
pub trait Resolver {
    fn lookup(&self, symbol: &CStr) -> Option<NonZeroUsize>;
}

/// Looks symbols up with `dlsym(RTLD_NEXT, ..)`, i.e., in the objects loaded
/// after the one doing the lookup.
#[derive(Clone, Copy, Debug, Default)]
pub struct NextSymbol;

impl Resolver for NextSymbol {
    fn lookup(&self, symbol: &CStr) -> Option<NonZeroUsize> {
        let addr = unsafe { dlsym(RTLD_NEXT, symbol.as_ptr()) };
        NonZeroUsize::new(addr as usize)
    }
}

/// One lazily filled function pointer slot per [`Operation`].
///
/// Slots may be filled concurrently by several threads; the first value
/// stored wins and is never replaced.
pub struct SymbolCache {
    slots: [OnceNonZeroUsize; Operation::COUNT],
}

impl SymbolCache {
    pub const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const UNRESOLVED: OnceNonZeroUsize = OnceNonZeroUsize::new();
        SymbolCache {
            slots: [UNRESOLVED; Operation::COUNT],
        }
    }

    #[inline]
    pub fn get(&self, op: Operation) -> Option<usize> {
        self.slots[op.index()].get().map(NonZeroUsize::get)
    }

    /// Fill the slot for `op` with the first symbol of `op` that `resolver`
    /// finds, unless it is already filled.  Returns `None` if nothing was found.
    pub fn get_or_resolve<R: Resolver + ?Sized>(
        &self,
        op: Operation,
        resolver: &R,
    ) -> Option<usize> {
        self.slots[op.index()]
            .get_or_try_init(|| {
                op.symbols()
                    .iter()
                    .find_map(|symbol| resolver.lookup(symbol))
                    .ok_or(())
            })
            .ok()
            .map(NonZeroUsize::get)
    }
}

impl Default for SymbolCache {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) type MallocFn = unsafe extern "C" fn(size: libc::size_t) -> *mut c_void;
pub(crate) type FreeFn = unsafe extern "C" fn(ptr: *mut c_void);
pub(crate) type CallocFn =
    unsafe extern "C" fn(n: libc::size_t, size: libc::size_t) -> *mut c_void;
pub(crate) type ReallocFn =
    unsafe extern "C" fn(ptr: *mut c_void, size: libc::size_t) -> *mut c_void;
pub(crate) type MemalignFn =
    unsafe extern "C" fn(alignment: libc::size_t, size: libc::size_t) -> *mut c_void;
pub(crate) type PosixMemalignFn = unsafe extern "C" fn(
    out: *mut *mut c_void,
    alignment: libc::size_t,
    size: libc::size_t,
) -> libc::c_int;
pub(crate) type UsableSizeFn = unsafe extern "C" fn(ptr: *mut c_void) -> libc::size_t;
