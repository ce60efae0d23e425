//! # iomgr
//!
//! **iomgr** is the runtime core of a storage engine's I/O layer. It owns
//! a pool of reactor threads, each running its own event loop, and gives
//! the storage and drive subsystems built on top of it a uniform way to
//! reach those threads.
//!
//! It provides:
//!
//! - A **lifecycle state machine** (`stopped → … → running → stopping →
//!   stopped`) with blocking readiness waits
//! - **Cross-thread messaging**, point-to-point or broadcast, fire-and-forget
//!   or blocking, addressed through thread handles or
//!   [`ThreadRegex`] groups
//! - **Message modules**: handlers registered once and always invoked on
//!   the reactor a message was addressed to
//! - **Interfaces and devices**: pluggable I/O providers whose descriptors
//!   are watched by the reactors
//! - **Timers**, local to a reactor or global and dispatched through a
//!   selector
//! - **Aligned I/O buffers** from an allocator chosen at start
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use iomgr::{IoManagerBuilder, StartOptions, ThreadRegex};
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! let iomgr = IoManagerBuilder::new().build();
//! iomgr.start(StartOptions::new(4))?;
//!
//! let hits = Arc::new(AtomicUsize::new(0));
//! let h = hits.clone();
//! let reached = iomgr.run_on(ThreadRegex::AllWorker, move || {
//!     h.fetch_add(1, Ordering::SeqCst);
//! }, true);
//!
//! assert_eq!(reached, 4);
//! assert_eq!(hits.load(Ordering::SeqCst), 4);
//!
//! iomgr.stop()?;
//! ```
//!
//! Or let the attribute macros manage the lifecycle:
//!
//! ```rust,ignore
//! #[iomgr::main(threads = 4)]
//! fn main() {
//!     runtime.run_on(iomgr::ThreadRegex::AllIo, || println!("hello"), true);
//! }
//! ```
//!
//! ## Modules
//!
//! - [`msg`] — Message envelope and module handlers
//! - [`interface`] — Interfaces, drive interfaces and devices
//! - [`timer`] — Timer handles and callbacks
//! - [`iobuf`] — Aligned allocators and buffers
//! - [`reactor`] — Reactor roles and event backends
//!
//! The crate is Linux only.

mod config;
mod error;
mod manager;
mod state;
mod thread;
mod utils;

pub mod interface;
pub mod iobuf;
pub mod msg;
pub mod reactor;
pub mod timer;

pub use config::{
    DEFAULT_MAX_IO_THREADS, DEFAULT_MAX_MSG_MODULES, InterfaceAdder, IoManagerBuilder,
    IoManagerConfig, StartOptions, ThreadStateNotifier,
};
pub use error::{IomgrError, Result};
pub use manager::{INTERNAL_MODULE, IoManager};
pub use state::IomgrState;
pub use thread::{IoThread, ThreadRegex, ThreadSelector};

pub use iomgr_macros::*;
