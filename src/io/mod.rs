/*
 * I/O Integration
 *
 * Pollers translate epoll readiness into fibre resumes against the
 * per-descriptor registry; the wrappers give blocking-style semantics to
 * non-blocking syscalls by parking the calling fibre on the descriptor's
 * read- or write-side semaphore until a poller signals readiness.
 */

pub(crate) mod poller;
pub(crate) mod registry;
pub mod wrappers;

pub use wrappers::*;

/// Which half of a descriptor an operation concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Input,
    Output,
}
