//! Exokernel Library OS
//!
//! The kernel underneath this library exports nothing but page-granular
//! mapping primitives, process creation and a page-fault upcall. Everything
//! that looks like virtual-memory policy lives here, linked into each
//! process.
//!
//! The centrepiece is [`Runtime::fork`], a user-level fork that shares the
//! parent's address space with the child copy-on-write and resolves the
//! resulting write faults in [`fork::pgfault`].
//!
//! # Usage
//!
//! ```rust,ignore
//! use libexo::{ForkResult, Runtime};
//!
//! let mut rt = Runtime::bootstrap(platform);
//! match rt.fork()? {
//!     ForkResult::Child => { /* running in the new process */ }
//!     ForkResult::Parent(child) => log::info!("spawned {}", child),
//! }
//! ```

#![cfg_attr(not(test), no_std)]

pub use errno::Errno;
pub use error::Error;
pub use fork::{duppage, pgfault, ForkResult, ForkStage};
pub use mmu::{PteFlags, PteFlagsExt, PERM_COW, PERM_RW, PTE_AVAIL, PTE_COW, PTE_SYSCALL};
pub use pgfault::{TrapRegs, UTrapframe};
pub use runtime::Runtime;
pub use syscall::{Exofork, Platform, Syscalls, Upcall, UserMemory};
pub use types::*;
pub use uvpt::{Inspector, Vpt};

pub mod errno;
pub mod error;
pub mod fork;
pub mod memlayout;
pub mod mmu;
pub mod pgfault;
pub mod runtime;
pub mod syscall;
pub mod types;
pub mod uvpt;
