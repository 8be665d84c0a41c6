//! Libraries that user programs link against.
//!
//! Nothing here is privileged: everything goes through [`UserCx`] system
//! calls and memory accesses, exactly as a program of its own would.
//!
//! [`UserCx`]: crate::UserCx

pub mod fork;
pub mod ipc;

pub use fork::{cow_fault, fork};
pub use ipc::{Message, ipc_find_env, ipc_recv, ipc_recv_result, ipc_send};
