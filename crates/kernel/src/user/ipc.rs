//! User side of rendezvous IPC.
//!
//! Receiving takes two turns: [`ipc_recv`] registers and blocks, and once
//! a sender has woken the environment [`ipc_recv_result`] reads what was
//! delivered. Sending is polled: a receiver that is not waiting makes
//! [`ipc_send`] yield and return `Pending`, and the program tries again on
//! its next turn.

use core::task::Poll;

use pmm::PageFlags;

use crate::{
    Error,
    env::{EnvId, EnvStatus, EnvType},
    machine::UserCx,
    memlayout::UTOP,
};

/// A delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    pub from: EnvId,
    pub value: u32,
    /// Permissions of the received page; empty if no page came with it.
    pub perm: PageFlags,
}

/// Sends `value`, and the page at `page` if given, to `to`.
///
/// Returns `Pending` after yielding if `to` is not receiving. Any other
/// failure is fatal: the environment destroys itself.
pub fn ipc_send(
    cx: &mut UserCx<'_>,
    to: EnvId,
    value: u32,
    page: Option<u32>,
    perm: PageFlags,
) -> Poll<()> {
    let srcva = page.unwrap_or(UTOP);
    match cx.sys_ipc_try_send(to, value, srcva, perm) {
        Ok(()) => Poll::Ready(()),
        Err(Error::IpcNotRecv) => {
            cx.sys_yield();
            Poll::Pending
        }
        Err(err) => {
            log::error!("[{}] ipc_send to {to}: {err}", cx.env_id());
            cx.exit();
            Poll::Pending
        }
    }
}

/// Blocks until a message arrives, offering to take a page at `page`.
///
/// The turn is over once this returns `Ok`.
pub fn ipc_recv(cx: &mut UserCx<'_>, page: Option<u32>) -> Result<(), Error> {
    cx.sys_ipc_recv(page.unwrap_or(UTOP))
}

/// Reads the message delivered since the last [`ipc_recv`].
pub fn ipc_recv_result(cx: &UserCx<'_>) -> Option<Message> {
    let ipc = cx.env(EnvId::CURRENT)?.ipc;
    if ipc.recving {
        return None;
    }
    Some(Message {
        from: ipc.from,
        value: ipc.value,
        perm: ipc.perm,
    })
}

/// Finds the first environment of type `env_type`.
pub fn ipc_find_env(cx: &UserCx<'_>, env_type: EnvType) -> Option<EnvId> {
    cx.envs()
        .into_iter()
        .find(|env| env.env_type == env_type && env.status != EnvStatus::Dying)
        .map(|env| env.id)
}
