//! Page allocation and mapping calls.

use pmm::PageFlags;

use super::{syscall_perm, user_page};
use crate::{Error, env::EnvId, kernel::Kernel};

impl Kernel {
    /// Maps a fresh zeroed page at `va` in `envid`, replacing any page there.
    pub(super) fn sys_page_alloc(
        &mut self,
        caller: EnvId,
        envid: EnvId,
        va: u32,
        perm: u32,
    ) -> Result<u32, Error> {
        let perm = syscall_perm(perm)?;
        let target = self.envs.lookup(caller, envid, true)?;
        user_page(va)?;

        self.insert_new_page(target, va, perm, &[])?;
        Ok(0)
    }

    /// Maps the page at `srcva` in `srcenv` at `dstva` in `dstenv`.
    pub(super) fn sys_page_map(
        &mut self,
        caller: EnvId,
        srcenv: EnvId,
        srcva: u32,
        dstenv: EnvId,
        dstva: u32,
        perm: u32,
    ) -> Result<u32, Error> {
        let perm = syscall_perm(perm)?;
        let src = self.envs.lookup(caller, srcenv, true)?;
        let dst = self.envs.lookup(caller, dstenv, true)?;
        let srcva = user_page(srcva)?;
        let dstva = user_page(dstva)?;

        let (frame, flags) = self
            .envs
            .env(src)
            .pgdir()
            .lookup(&self.pmm, srcva)
            .ok_or(Error::Inval)?;
        if perm.contains(PageFlags::WRITABLE) && !flags.contains(PageFlags::WRITABLE) {
            return Err(Error::Inval);
        }

        let pgdir = self.envs.env(dst).pgdir();
        pgdir.insert(&mut self.pmm, dstva, frame, perm)?;
        Ok(0)
    }

    /// Unmaps `va` in `envid`; unmapping nothing succeeds.
    pub(super) fn sys_page_unmap(&mut self, caller: EnvId, envid: EnvId, va: u32) -> Result<u32, Error> {
        let target = self.envs.lookup(caller, envid, true)?;
        let va = user_page(va)?;

        let pgdir = self.envs.env(target).pgdir();
        pgdir.remove(&mut self.pmm, va);
        Ok(0)
    }
}
