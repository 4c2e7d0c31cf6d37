//! This malloc latency profiler measures how long every call into the memory allocator takes,
//! without changing what the allocator does.  It is meant for attaching to an existing binary
//! whose allocator you suspect of stalling it: lock contention inside `malloc`, page faults on
//! fresh arenas, or `free` calls that trigger expensive trimming all show up as tails in the
//! latency distribution.
//!
//! Note: `latalloc` is not an allocator.  Every request is forwarded unchanged to the allocator
//! the program would have used anyway (found through the dynamic linker), and every result is
//! returned unchanged.  The only difference a program can observe is the added latency of two
//! clock reads and two atomic increments per call.
//!
//! ## Using `latalloc` via `LD_PRELOAD`
//!
//! The companion `lib_latalloc` crate produces a dynamic library that intercepts `malloc`,
//! `free`, `cfree`, `calloc`, `realloc`, `memalign`, `posix_memalign`, `aligned_alloc` and
//! `malloc_usable_size`:
//!
//! ```bash
//! LD_PRELOAD=liblatalloc_preload.so ./my_program
//! ```
//!
//! When the program exits, the latency distribution of each operation is printed to stderr.
//! The following environment variables control the report:
//!
//! * `LATALLOC_FORMAT=csv|classic`: layout of the percentile table (default `csv`).
//! * `LATALLOC_TICKS=<n>`: percentile steps per half-distance to 100% (default 10).
//! * `LATALLOC_DIR=<dir>`: also save the profile to `<dir>/latalloc.<pid>.yaml`.
//! * `LATALLOC_QUIET=1`: do not print the report.
//!
//! ## Enabling `latalloc` in a Rust program
//!
//! A Rust program can use the profiler as its global allocator instead of
//! [`std::alloc::System`], and print the report when it is done:
//!
//! ```
//! use latalloc::{Interposer, NextSymbol};
//!
//! #[global_allocator]
//! static GLOBAL: Interposer<NextSymbol> = Interposer::new(NextSymbol);
//!
//! fn main() {
//!     let _v = vec![1, 2, 3];
//!     GLOBAL.shutdown();
//! }
//! ```
//!
//! ## Viewing saved profiles
//!
//! Profiles saved with `LATALLOC_DIR` can be merged and printed with the `lat_print` tool from
//! this crate, e.g.:
//!
//! ```bash
//! lat_print --dir profiles --format classic
//! ```
//!
//! which is useful for programs that fork, since each process saves its own profile.

pub mod arena;
pub mod config;
pub mod diag;
pub mod guard;
pub mod histogram;
pub mod interpose;
pub mod report;
pub mod symbols;

pub use config::ReportConfig;
pub use interpose::Interposer;
pub use report::{Format, Snapshot, Summary};
pub use symbols::{NextSymbol, Operation, Resolver};
