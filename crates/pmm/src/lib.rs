#![cfg_attr(not(test), no_std)]

//! # Exo Physical Memory Manager (PMM)
//!
//! The low-level memory layer of the Exo kernel. It provides:
//!
//! - An emulated physical memory arena divided into 4 KiB frames.
//! - Reference-counted frame allocation.
//! - Two-level, 32-bit x86 style page tables stored inside those frames.
//! - A software MMU that translates user accesses and raises page faults.

extern crate alloc;

mod address;
mod address_space;
mod arch;
mod frame;
mod numbers;
mod page_directory;
mod physical_memory_manager;

pub use address::{PhysicalAddress, VirtualAddress};
pub use address_space::{Access, AddressSpace, FaultCode, PageFault};
pub use arch::{ENTRY_COUNT, PAGE_SIZE, PageEntry, PageFlags, TABLE_SPAN};
pub use frame::{Frame, FrameFlag, FrameFlags};
pub use numbers::FrameNumber;
pub use page_directory::{MapError, PageDirectory};
pub use physical_memory_manager::{AllocError, PhysicalMemoryManager};
