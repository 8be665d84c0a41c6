//! System call dispatch.
//!
//! A system call enters through [`Kernel::syscall`], which records the
//! trap in the caller's frame, and is routed by [`Kernel::dispatch`] to one
//! of the handlers in the submodules. Handlers return `Result<u32, Error>`;
//! only the dispatcher turns that into the signed value user code sees.

mod ipc;
mod lifecycle;
mod memory;
mod net;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use pmm::{PageFlags, VirtualAddress};

use crate::{
    Error,
    env::EnvId,
    kernel::Kernel,
    memlayout::{UTOP, is_page_aligned},
    trap::TrapVector,
};

/// System call numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum Syscall {
    Cputs = 0,
    Cgetc = 1,
    GetEnvId = 2,
    EnvDestroy = 3,
    PageAlloc = 4,
    PageMap = 5,
    PageUnmap = 6,
    Exofork = 7,
    EnvSetStatus = 8,
    EnvSetTrapframe = 9,
    EnvSetPgfaultUpcall = 10,
    Yield = 11,
    IpcTrySend = 12,
    IpcRecv = 13,
    TimeMsec = 14,
    SetPriority = 15,
    GetMacAddress = 16,
    NetTransmit = 17,
    NetReceive = 18,
}

impl Kernel {
    /// Trap entry for a system call made by `caller`.
    ///
    /// The number and arguments are loaded into the caller's saved
    /// registers the way the trap stub finds them (`eax`, then `edx`,
    /// `ecx`, `ebx`, `edi`, `esi`), and the result is left in `eax`.
    pub fn syscall(&mut self, caller: EnvId, number: u32, args: [u32; 5]) -> i32 {
        let tf = &mut self.envs.env_mut(caller).tf;
        tf.trapno = TrapVector::SYSCALL.value();
        tf.regs.eax = number;
        tf.regs.edx = args[0];
        tf.regs.ecx = args[1];
        tf.regs.ebx = args[2];
        tf.regs.edi = args[3];
        tf.regs.esi = args[4];

        let [a1, a2, a3, a4, a5] = args;
        let ret = self.dispatch(caller, number, a1, a2, a3, a4, a5);
        if let Some(env) = self.envs.get_mut(caller) {
            env.tf.regs.eax = ret as u32;
        }
        ret
    }

    /// Runs system call `number` on behalf of `caller`.
    ///
    /// Returns the call's result, or a negative error code.
    #[allow(clippy::too_many_arguments)]
    pub fn dispatch(
        &mut self,
        caller: EnvId,
        number: u32,
        a1: u32,
        a2: u32,
        a3: u32,
        a4: u32,
        a5: u32,
    ) -> i32 {
        let Ok(call) = Syscall::try_from(number) else {
            log::debug!("[{caller}] unknown syscall {number}");
            return Error::Inval.code();
        };
        log::trace!("[{caller}] {call:?}({a1:#x}, {a2:#x}, {a3:#x}, {a4:#x}, {a5:#x})");

        let result = match call {
            Syscall::Cputs => self.sys_cputs(caller, a1, a2),
            Syscall::Cgetc => Ok(u32::from(self.console.getc())),
            Syscall::GetEnvId => Ok(caller.as_u32()),
            Syscall::EnvDestroy => self.sys_env_destroy(caller, EnvId::from_raw(a1)),
            Syscall::PageAlloc => self.sys_page_alloc(caller, EnvId::from_raw(a1), a2, a3),
            Syscall::PageMap => self.sys_page_map(
                caller,
                EnvId::from_raw(a1),
                a2,
                EnvId::from_raw(a3),
                a4,
                a5,
            ),
            Syscall::PageUnmap => self.sys_page_unmap(caller, EnvId::from_raw(a1), a2),
            Syscall::Exofork => self.sys_exofork(caller),
            Syscall::EnvSetStatus => self.sys_env_set_status(caller, EnvId::from_raw(a1), a2),
            Syscall::EnvSetTrapframe => {
                self.sys_env_set_trapframe(caller, EnvId::from_raw(a1), a2)
            }
            Syscall::EnvSetPgfaultUpcall => {
                self.sys_env_set_pgfault_upcall(caller, EnvId::from_raw(a1), a2)
            }
            Syscall::Yield => self.sys_yield(caller),
            Syscall::IpcTrySend => self.sys_ipc_try_send(caller, EnvId::from_raw(a1), a2, a3, a4),
            Syscall::IpcRecv => self.sys_ipc_recv(caller, a1),
            Syscall::TimeMsec => Ok(self.clock.now_ms()),
            Syscall::SetPriority => self.sys_set_priority(caller, a1 as i32),
            Syscall::GetMacAddress => self.sys_get_mac_address(caller, a1),
            Syscall::NetTransmit => self.sys_net_transmit(caller, a1, a2),
            Syscall::NetReceive => self.sys_net_receive(caller, a1),
        };

        match result {
            Ok(value) => value as i32,
            Err(err) => {
                log::trace!("[{caller}] {call:?} failed: {err}");
                err.code()
            }
        }
    }
}

/// Validates a permission mask passed to a system call.
///
/// Present and User are required; nothing outside Writable and the
/// available bits may be set.
fn syscall_perm(perm: u32) -> Result<PageFlags, Error> {
    let required = PageFlags::PRESENT | PageFlags::USER;
    if perm & !PageFlags::SYSCALL.bits() != 0 {
        return Err(Error::Inval);
    }
    let perm = PageFlags::from_bits_retain(perm);
    if !perm.contains(required) {
        return Err(Error::Inval);
    }
    Ok(perm)
}

/// Validates a user page address: below `UTOP` and page-aligned.
fn user_page(va: u32) -> Result<VirtualAddress, Error> {
    if va >= UTOP || !is_page_aligned(va) {
        return Err(Error::Inval);
    }
    Ok(VirtualAddress::new(va as usize))
}
