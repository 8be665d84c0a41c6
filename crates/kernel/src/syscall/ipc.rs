//! Rendezvous IPC.
//!
//! A receiver registers with `ipc_recv` and stops running. A sender's
//! `ipc_try_send` either completes the whole handoff at once or fails with
//! [`Error::IpcNotRecv`]; there is no queue.

use pmm::{PageFlags, VirtualAddress};

use super::{syscall_perm, user_page};
use crate::{
    Error,
    env::{EnvId, EnvStatus},
    kernel::Kernel,
    memlayout::{UTOP, is_page_aligned},
};

impl Kernel {
    /// Delivers `value`, and the page at `srcva` if below `UTOP`, to a
    /// receiver blocked in `ipc_recv`.
    pub(super) fn sys_ipc_try_send(
        &mut self,
        caller: EnvId,
        envid: EnvId,
        value: u32,
        srcva: u32,
        perm: u32,
    ) -> Result<u32, Error> {
        let target = self.envs.lookup(caller, envid, false)?;
        if !self.envs.env(target).ipc.recving {
            return Err(Error::IpcNotRecv);
        }

        let mut granted = PageFlags::empty();
        if srcva < UTOP {
            let srcva = user_page(srcva)?;
            let perm = syscall_perm(perm)?;
            let (frame, flags) = self
                .envs
                .env(caller)
                .pgdir()
                .lookup(&self.pmm, srcva)
                .ok_or(Error::Inval)?;
            if perm.contains(PageFlags::WRITABLE) && !flags.contains(PageFlags::WRITABLE) {
                return Err(Error::Inval);
            }

            let receiver = self.envs.env(target);
            let dstva = receiver.ipc.dstva;
            if dstva < UTOP {
                let pgdir = receiver.pgdir();
                pgdir.insert(&mut self.pmm, VirtualAddress::new(dstva as usize), frame, perm)?;
                granted = perm;
            }
        }

        let receiver = self.envs.env_mut(target);
        receiver.ipc.recving = false;
        receiver.ipc.from = caller;
        receiver.ipc.value = value;
        receiver.ipc.perm = granted;
        receiver.status = EnvStatus::Runnable;
        receiver.tf.regs.eax = 0;
        log::trace!("[{caller}] ipc {value:#x} -> {target}");
        Ok(0)
    }

    /// Blocks the caller until a message arrives.
    ///
    /// A `dstva` below `UTOP` offers to take a page there; anything at or
    /// above `UTOP` takes no page.
    pub(super) fn sys_ipc_recv(&mut self, caller: EnvId, dstva: u32) -> Result<u32, Error> {
        if dstva < UTOP && !is_page_aligned(dstva) {
            return Err(Error::Inval);
        }

        let env = self.envs.env_mut(caller);
        env.ipc.recving = true;
        env.ipc.dstva = dstva;
        env.status = EnvStatus::NotRunnable;
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use pmm::{PageFlags, VirtualAddress};

    use super::super::{Syscall, tests::kernel};
    use crate::{EnvId, EnvStatus, EnvType, Error, Kernel, memlayout::UTOP};

    const PUW: u32 = 0x007;

    fn send(k: &mut Kernel, from: EnvId, to: EnvId, value: u32, srcva: u32, perm: u32) -> i32 {
        k.dispatch(from, Syscall::IpcTrySend.into(), to.as_u32(), value, srcva, perm, 0)
    }

    fn recv(k: &mut Kernel, env: EnvId, dstva: u32) -> i32 {
        k.dispatch(env, Syscall::IpcRecv.into(), dstva, 0, 0, 0, 0)
    }

    #[test]
    fn send_requires_waiting_receiver() {
        let mut k = kernel();
        let a = k.create_env(EnvType::User).unwrap();
        let b = k.create_env(EnvType::User).unwrap();

        assert_eq!(send(&mut k, a, b, 1, UTOP, 0), Error::IpcNotRecv.code());
        assert_eq!(
            send(&mut k, a, EnvId::from_raw(0x3333), 1, UTOP, 0),
            Error::BadEnv.code()
        );
    }

    #[test]
    fn value_only_handoff() {
        let mut k = kernel();
        let rx = k.create_env(EnvType::User).unwrap();
        let tx = k.create_env(EnvType::User).unwrap();

        assert_eq!(recv(&mut k, rx, UTOP), 0);
        assert_eq!(k.env_info(rx).unwrap().status, EnvStatus::NotRunnable);
        assert_eq!(send(&mut k, tx, rx, 42, UTOP, 0), 0);

        let info = k.env_info(rx).unwrap();
        assert_eq!(info.status, EnvStatus::Runnable);
        assert!(!info.ipc.recving);
        assert_eq!(info.ipc.from, tx);
        assert_eq!(info.ipc.value, 42);
        assert!(info.ipc.perm.is_empty());
    }

    #[test]
    fn page_handoff() {
        let mut k = kernel();
        let rx = k.create_env(EnvType::User).unwrap();
        let tx = k.create_env(EnvType::User).unwrap();
        let srcva = 0x0070_0000;
        let dstva = 0x00A0_0000;
        k.dispatch(tx, Syscall::PageAlloc.into(), 0, srcva, PUW, 0, 0);
        k.address_space(tx)
            .write_u32(VirtualAddress::new(srcva as usize), 0xFEED)
            .unwrap();

        recv(&mut k, rx, dstva);
        assert_eq!(send(&mut k, tx, rx, 7, srcva, PUW), 0);

        assert_eq!(
            k.env_info(rx).unwrap().ipc.perm,
            PageFlags::from_bits_retain(PUW)
        );
        assert_eq!(
            k.address_space(rx)
                .read_u32(VirtualAddress::new(dstva as usize)),
            Ok(0xFEED)
        );
    }

    #[test]
    fn receiver_not_wanting_a_page_gets_none() {
        let mut k = kernel();
        let rx = k.create_env(EnvType::User).unwrap();
        let tx = k.create_env(EnvType::User).unwrap();
        k.dispatch(tx, Syscall::PageAlloc.into(), 0, 0x0070_0000, PUW, 0, 0);
        let before = k.free_frames();

        recv(&mut k, rx, 0xF000_0000);
        assert_eq!(send(&mut k, tx, rx, 7, 0x0070_0000, PUW), 0);

        assert!(k.env_info(rx).unwrap().ipc.perm.is_empty());
        assert_eq!(k.free_frames(), before);
    }

    #[test]
    fn bad_page_offer_keeps_receiver_waiting() {
        let mut k = kernel();
        let rx = k.create_env(EnvType::User).unwrap();
        let tx = k.create_env(EnvType::User).unwrap();
        k.dispatch(tx, Syscall::PageAlloc.into(), 0, 0x0070_0000, 0x005, 0, 0);
        recv(&mut k, rx, 0x00A0_0000);

        assert_eq!(send(&mut k, tx, rx, 1, 0x0070_0004, 0x005), Error::Inval.code());
        assert_eq!(send(&mut k, tx, rx, 1, 0x0070_0000, 0x007), Error::Inval.code());
        assert_eq!(send(&mut k, tx, rx, 1, 0x0080_0000, 0x005), Error::Inval.code());
        assert_eq!(send(&mut k, tx, rx, 1, 0x0070_0000, 0x001), Error::Inval.code());

        let info = k.env_info(rx).unwrap();
        assert!(info.ipc.recving);
        assert_eq!(info.status, EnvStatus::NotRunnable);
    }

    #[test]
    fn recv_rejects_only_misaligned_user_addresses() {
        let mut k = kernel();
        let rx = k.create_env(EnvType::User).unwrap();
        assert_eq!(recv(&mut k, rx, 0x1001), Error::Inval.code());
        assert_eq!(k.env_info(rx).unwrap().status, EnvStatus::Runnable);
        assert_eq!(recv(&mut k, rx, UTOP + 1), 0);
    }

    #[test]
    fn exactly_one_of_many_senders_wins() {
        let mut k = kernel();
        let rx = k.create_env(EnvType::User).unwrap();
        let senders: alloc::vec::Vec<_> = (0..5)
            .map(|_| k.create_env(EnvType::User).unwrap())
            .collect();
        recv(&mut k, rx, UTOP);

        let results: alloc::vec::Vec<i32> = senders
            .iter()
            .enumerate()
            .map(|(i, &tx)| send(&mut k, tx, rx, i as u32, UTOP, 0))
            .collect();

        assert_eq!(results.iter().filter(|&&r| r == 0).count(), 1);
        assert!(results[1..].iter().all(|&r| r == Error::IpcNotRecv.code()));
        let info = k.env_info(rx).unwrap();
        assert_eq!(info.ipc.from, senders[0]);
        assert_eq!(info.ipc.value, 0);
    }
}
