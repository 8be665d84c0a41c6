//! Network card calls.

use alloc::vec;
use pmm::{PageFlags, VirtualAddress};

use super::user_page;
use crate::{
    Error,
    env::{EnvId, EnvStatus},
    kernel::Kernel,
    net::{MAX_PACKET, TxError},
};

impl Kernel {
    /// Writes the card's 6-byte hardware address to `va`.
    pub(super) fn sys_get_mac_address(&mut self, caller: EnvId, va: u32) -> Result<u32, Error> {
        let mac = self.net.as_ref().ok_or(Error::Unspecified)?.mac_address();
        self.user_mem_assert(caller, va, mac.len(), PageFlags::WRITABLE)?;
        self.address_space(caller)
            .write(VirtualAddress::new(va as usize), &mac)
            .map_err(|_| Error::Fault)?;
        Ok(0)
    }

    /// Transmits the `len` bytes at `va`.
    ///
    /// A full transmit queue reports [`Error::Unspecified`]; the caller
    /// retries.
    pub(super) fn sys_net_transmit(&mut self, caller: EnvId, va: u32, len: u32) -> Result<u32, Error> {
        let len = len as usize;
        if len > MAX_PACKET {
            return Err(Error::Inval);
        }
        if self.net.is_none() {
            return Err(Error::Unspecified);
        }
        self.user_mem_assert(caller, va, len, PageFlags::empty())?;

        let mut packet = vec![0u8; len];
        self.address_space(caller)
            .read(VirtualAddress::new(va as usize), &mut packet)
            .map_err(|_| Error::Fault)?;
        let device = self.net.as_mut().ok_or(Error::Unspecified)?;
        match device.transmit(&packet) {
            Ok(()) => Ok(0),
            Err(TxError::TooLong) => Err(Error::Inval),
            Err(TxError::QueueFull) => Err(Error::Unspecified),
        }
    }

    /// Maps the next received packet at `va` as `len: u32` followed by the
    /// bytes, and returns `len`.
    ///
    /// With nothing to receive the caller blocks until the card's next
    /// interrupt and gets 0; it asks again once it runs.
    pub(super) fn sys_net_receive(&mut self, caller: EnvId, va: u32) -> Result<u32, Error> {
        user_page(va)?;
        let device = self.net.as_mut().ok_or(Error::Unspecified)?;

        let Some(packet) = device.receive() else {
            let env = self.envs.env_mut(caller);
            env.net_blocked = true;
            env.status = EnvStatus::NotRunnable;
            log::trace!("[{caller}] waiting for a packet");
            return Ok(0);
        };

        let len = packet.len().min(MAX_PACKET);
        let mut page = vec![0u8; 4 + len];
        page[..4].copy_from_slice(&(len as u32).to_le_bytes());
        page[4..].copy_from_slice(&packet[..len]);
        let flags = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER;
        self.insert_new_page(caller, va, flags, &page)?;
        Ok(len as u32)
    }
}

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;
    use pmm::VirtualAddress;

    use super::super::{Syscall, tests::kernel};
    use crate::{
        EnvId, EnvStatus, EnvType, Error, Kernel,
        memlayout::{PGSIZE, USTACKTOP},
        net::{DEFAULT_MAC, Loopback, MAX_PACKET},
    };

    const BUF: u32 = USTACKTOP - PGSIZE;
    const RXPAGE: u32 = 0x0090_0000;

    fn call(k: &mut Kernel, env: EnvId, call: Syscall, args: [u32; 5]) -> i32 {
        k.dispatch(env, call.into(), args[0], args[1], args[2], args[3], args[4])
    }

    fn with_card() -> (Kernel, EnvId, Loopback) {
        let mut k = kernel();
        let card = Loopback::default();
        k.attach_net(Box::new(card.clone()));
        let env = k.create_env(EnvType::NetServer).unwrap();
        (k, env, card)
    }

    #[test]
    fn mac_address_lands_in_user_memory() {
        let (mut k, env, _) = with_card();
        assert_eq!(call(&mut k, env, Syscall::GetMacAddress, [BUF, 0, 0, 0, 0]), 0);

        let mut mac = [0u8; 6];
        k.address_space(env)
            .read(VirtualAddress::new(BUF as usize), &mut mac)
            .unwrap();
        assert_eq!(mac, DEFAULT_MAC);
    }

    #[test]
    fn no_card_is_unspecified() {
        let mut k = kernel();
        let env = k.create_env(EnvType::User).unwrap();
        assert_eq!(
            call(&mut k, env, Syscall::NetReceive, [RXPAGE, 0, 0, 0, 0]),
            Error::Unspecified.code()
        );
    }

    #[test]
    fn transmit_then_receive() {
        let (mut k, env, card) = with_card();
        k.address_space(env)
            .write(VirtualAddress::new(BUF as usize), b"frame")
            .unwrap();

        assert_eq!(call(&mut k, env, Syscall::NetTransmit, [BUF, 5, 0, 0, 0]), 0);
        assert_eq!(card.transmitted(), 1);
        assert_eq!(call(&mut k, env, Syscall::NetReceive, [RXPAGE, 0, 0, 0, 0]), 5);

        let mut space = k.address_space(env);
        assert_eq!(space.read_u32(VirtualAddress::new(RXPAGE as usize)), Ok(5));
        let mut data = [0u8; 5];
        space
            .read(VirtualAddress::new(RXPAGE as usize + 4), &mut data)
            .unwrap();
        assert_eq!(&data, b"frame");
    }

    #[test]
    fn transmit_checks_length() {
        let (mut k, env, _) = with_card();
        let len = MAX_PACKET as u32 + 1;
        assert_eq!(
            call(&mut k, env, Syscall::NetTransmit, [BUF, len, 0, 0, 0]),
            Error::Inval.code()
        );
        assert_eq!(k.env_info(env).unwrap().status, EnvStatus::Runnable);
    }

    #[test]
    fn receive_blocks_until_interrupt() {
        let (mut k, env, card) = with_card();
        k.schedule();

        assert_eq!(call(&mut k, env, Syscall::NetReceive, [RXPAGE, 0, 0, 0, 0]), 0);
        assert_eq!(k.env_info(env).unwrap().status, EnvStatus::NotRunnable);
        assert!(k.pte(env, RXPAGE).is_none());
        k.end_turn(env);
        assert_eq!(k.schedule(), None);

        card.inject(b"hi");
        assert_eq!(k.net_interrupt(), 1);
        assert_eq!(k.schedule(), Some(env));
        assert_eq!(call(&mut k, env, Syscall::NetReceive, [RXPAGE, 0, 0, 0, 0]), 2);
    }

    #[test]
    fn receive_needs_a_page_address() {
        let (mut k, env, card) = with_card();
        card.inject(b"x");
        assert_eq!(
            call(&mut k, env, Syscall::NetReceive, [RXPAGE + 1, 0, 0, 0, 0]),
            Error::Inval.code()
        );
        assert_eq!(card.pending(), 1);
    }
}
