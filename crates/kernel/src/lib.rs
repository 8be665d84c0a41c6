// cSpell:ignore exofork pgfault

//! Exo: a small exokernel hosted on an emulated 32-bit MMU.
//!
//! The kernel hands user environments raw page-table and scheduling
//! primitives through a closed set of numbered system calls. Policy lives
//! in user space: [`user::fork`] builds copy-on-write fork out of page
//! faults and `page_map`, and [`user::ipc`] builds request/reply messaging
//! out of a single rendezvous primitive. A file server environment can own
//! a [`BlockCache`] that maps disk blocks into a window of its address
//! space on first touch.
//!
//! [`Machine`] ties a [`Kernel`] to the [`Program`]s that run on it.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod bc;
pub mod clock;
pub mod console;
pub mod disk;
pub mod env;
mod error;
mod kernel;
pub mod logging;
mod machine;
pub mod memlayout;
pub mod net;
mod sched;
mod syscall;
pub mod trap;
pub mod user;

pub use bc::{BlockCache, CacheError};
pub use disk::{BlockDevice, DiskError, MemDisk};
pub use env::{EnvId, EnvInfo, EnvStatus, EnvType};
pub use error::Error;
pub use kernel::{FaultOutcome, Kernel, KernelConfig};
pub use machine::{COW_UPCALL, FaultHandler, Machine, Program, UserCx};
pub use net::{Loopback, NetDevice};
pub use syscall::Syscall;
pub use trap::{FaultRecord, TrapFrame};
