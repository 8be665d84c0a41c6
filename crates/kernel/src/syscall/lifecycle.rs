//! Environment lifecycle, console and clock calls.

use alloc::vec;
use pmm::{PageFlags, VirtualAddress};

use crate::{
    Error,
    env::{EnvId, EnvStatus},
    kernel::Kernel,
    trap::{DPL_USER, FL_IF, TrapFrame},
};

impl Kernel {
    /// Prints `len` bytes at `va`; the caller dies if it cannot read them.
    pub(super) fn sys_cputs(&mut self, caller: EnvId, va: u32, len: u32) -> Result<u32, Error> {
        let len = len as usize;
        self.user_mem_assert(caller, va, len, PageFlags::empty())?;

        let mut buf = vec![0u8; len];
        self.address_space(caller)
            .read(VirtualAddress::new(va as usize), &mut buf)
            .map_err(|_| Error::Fault)?;
        self.console.write(&buf);
        Ok(0)
    }

    pub(super) fn sys_env_destroy(&mut self, caller: EnvId, envid: EnvId) -> Result<u32, Error> {
        let target = self.envs.lookup(caller, envid, true)?;
        if target == caller {
            log::info!("[{caller}] exiting gracefully");
        } else {
            log::info!("[{caller}] destroying {target}");
        }
        self.destroy_env(target);
        Ok(0)
    }

    /// Creates a child that shares nothing yet and resumes with `eax = 0`.
    pub(super) fn sys_exofork(&mut self, caller: EnvId) -> Result<u32, Error> {
        let mut tf = self.envs.env(caller).tf;
        tf.regs.eax = 0;
        let child = self.envs.alloc(&mut self.pmm, caller, tf)?;
        self.envs.env_mut(child).status = EnvStatus::NotRunnable;
        Ok(child.as_u32())
    }

    pub(super) fn sys_env_set_status(
        &mut self,
        caller: EnvId,
        envid: EnvId,
        status: u32,
    ) -> Result<u32, Error> {
        let status = match EnvStatus::try_from(status) {
            Ok(status @ (EnvStatus::Runnable | EnvStatus::NotRunnable)) => status,
            _ => return Err(Error::Inval),
        };
        let target = self.envs.lookup(caller, envid, true)?;
        self.envs.env_mut(target).status = status;
        Ok(0)
    }

    /// Replaces a target's saved frame with the one at `va` in the caller.
    ///
    /// The installed frame always runs at user privilege with interrupts
    /// enabled.
    pub(super) fn sys_env_set_trapframe(
        &mut self,
        caller: EnvId,
        envid: EnvId,
        va: u32,
    ) -> Result<u32, Error> {
        let target = self.envs.lookup(caller, envid, true)?;
        self.user_mem_assert(caller, va, TrapFrame::SIZE, PageFlags::empty())?;

        let mut bytes = [0u8; TrapFrame::SIZE];
        self.address_space(caller)
            .read(VirtualAddress::new(va as usize), &mut bytes)
            .map_err(|_| Error::Fault)?;
        let mut tf = TrapFrame::from_bytes(&bytes);
        tf.cs |= DPL_USER;
        tf.ss |= DPL_USER;
        tf.eflags |= FL_IF;

        self.envs.env_mut(target).tf = tf;
        Ok(0)
    }

    pub(super) fn sys_env_set_pgfault_upcall(
        &mut self,
        caller: EnvId,
        envid: EnvId,
        entry: u32,
    ) -> Result<u32, Error> {
        let target = self.envs.lookup(caller, envid, true)?;
        self.envs.env_mut(target).pgfault_upcall = entry;
        Ok(0)
    }

    /// Gives up the rest of the caller's turn.
    pub(super) fn sys_yield(&mut self, caller: EnvId) -> Result<u32, Error> {
        self.envs.env_mut(caller).status = EnvStatus::Runnable;
        Ok(0)
    }

    pub(super) fn sys_set_priority(&mut self, caller: EnvId, priority: i32) -> Result<u32, Error> {
        self.envs.env_mut(caller).priority = priority;
        Ok(0)
    }
}
